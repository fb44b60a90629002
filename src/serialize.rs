//! Conversion between values and buffers, per celltype.

use std::fmt;

use bytes::Bytes;
use serde_json::Value as Json;

use crate::{
    celltype::Celltype,
    value::{Array, ArrayError, Value, MAGIC_NUMPY, MAGIC_SEAMLESS_MIXED},
};

/// Error (de)serializing a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SerializeError {
    #[error("Buffer is not valid UTF-8")]
    NotUtf8,
    #[error("Buffer is not valid JSON: {0}")]
    NotJson(String),
    #[error("Expected {expected}, got {actual}")]
    WrongType {
        expected: Celltype,
        actual: &'static str,
    },
    #[error("Cannot convert {value} to {target}")]
    Cast { value: String, target: Celltype },
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error("Mixed buffers with the combined JSON/array layout are not supported")]
    MixedLayout,
    #[error("Invalid {celltype}: {message}")]
    InvalidText { celltype: Celltype, message: String },
}

/// Turns values into buffers and back.
///
/// The default implementation handles JSON, text, raw bytes and `.npy` arrays. Source
/// code validation and the parsing of `cson`/`yaml` can be customized.
pub trait Serializer: fmt::Debug + Send + Sync + 'static {
    fn serialize(&self, value: &Value, celltype: Celltype) -> Result<Bytes, SerializeError>;

    fn deserialize(&self, buffer: &Bytes, celltype: Celltype) -> Result<Value, SerializeError>;

    /// Checks that `text` is valid for a code or structured text celltype.
    fn validate_text(&self, text: &str, celltype: Celltype) -> Result<(), SerializeError> {
        match celltype {
            Celltype::Cson | Celltype::Yaml => self.parse_structured(text, celltype).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Parses a `cson` or `yaml` text into a JSON value.
    ///
    /// Both are supersets of JSON, so the default accepts JSON only.
    fn parse_structured(&self, text: &str, celltype: Celltype) -> Result<Json, SerializeError> {
        serde_json::from_str(text).map_err(|e| SerializeError::InvalidText {
            celltype,
            message: e.to_string(),
        })
    }

    /// Converts IPython source into plain Python source.
    fn ipython_to_python(&self, text: &str) -> Result<String, SerializeError> {
        let lines: Vec<String> = text
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.starts_with('%') || trimmed.starts_with('!') {
                    let indent = &line[..line.len() - trimmed.len()];
                    format!("{indent}pass  # {trimmed}")
                } else {
                    line.to_string()
                }
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

/// Serializes JSON with sorted keys and two space indentation, plus a newline.
pub fn json_dumps(value: &Json) -> Bytes {
    // without the preserve_order feature serde_json maps are sorted
    let mut out = serde_json::to_vec_pretty(value).unwrap_or_else(|_| b"null".to_vec());
    out.push(b'\n');
    Bytes::from(out)
}

/// The default [`Serializer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSerializer;

impl Serializer for DefaultSerializer {
    fn serialize(&self, value: &Value, celltype: Celltype) -> Result<Bytes, SerializeError> {
        serialize(value, celltype)
    }

    fn deserialize(&self, buffer: &Bytes, celltype: Celltype) -> Result<Value, SerializeError> {
        deserialize(buffer, celltype)
    }
}

fn serialize(value: &Value, celltype: Celltype) -> Result<Bytes, SerializeError> {
    let buffer = match celltype {
        Celltype::Str => match value {
            Value::Json(Json::Bool(b)) => json_dumps(&Json::Bool(*b)),
            Value::Json(Json::String(s)) | Value::Text(s) => json_dumps(&Json::String(s.clone())),
            Value::Json(Json::Number(n)) => json_dumps(&Json::String(n.to_string())),
            Value::Array(array) => match array.scalar() {
                Some(Json::String(s)) => json_dumps(&Json::String(s)),
                Some(Json::Bool(b)) => json_dumps(&Json::Bool(b)),
                Some(Json::Number(n)) => json_dumps(&Json::String(n.to_string())),
                _ => return Err(wrong_type(celltype, value)),
            },
            _ => return Err(wrong_type(celltype, value)),
        },
        Celltype::Int | Celltype::Float | Celltype::Bool => json_dumps(&cast(value, celltype)?),
        Celltype::Text
        | Celltype::Python
        | Celltype::Ipython
        | Celltype::Cson
        | Celltype::Yaml => {
            let text = match value {
                Value::Text(s) | Value::Json(Json::String(s)) => s.clone(),
                Value::Json(Json::Number(n)) => n.to_string(),
                Value::Json(Json::Bool(b)) => if *b { "True" } else { "False" }.to_string(),
                Value::Bytes(b) => std::str::from_utf8(b)
                    .map_err(|_| SerializeError::NotUtf8)?
                    .to_string(),
                _ => return Err(wrong_type(celltype, value)),
            };
            let mut text = text.trim_end_matches('\n').to_string();
            text.push('\n');
            Bytes::from(text)
        }
        Celltype::Plain | Celltype::Checksum => match value {
            Value::Json(json) => json_dumps(json),
            Value::Text(s) => json_dumps(&Json::String(s.clone())),
            Value::Array(array) => json_dumps(&array.to_json()),
            Value::Bytes(_) => return Err(wrong_type(celltype, value)),
        },
        Celltype::Bytes => match value {
            Value::Bytes(b) => b.clone(),
            Value::Text(s) | Value::Json(Json::String(s)) => {
                Bytes::from(s.trim_end_matches('\n').to_string())
            }
            Value::Array(array) => array.data.clone(),
            Value::Json(json) => Bytes::from(json.to_string()),
        },
        Celltype::Mixed => match value {
            Value::Json(json) => json_dumps(json),
            Value::Text(s) => json_dumps(&Json::String(s.clone())),
            Value::Array(array) => array.to_npy(),
            Value::Bytes(b) => Array::bytes_scalar(b.clone()).to_npy(),
        },
        Celltype::Binary => match value {
            Value::Bytes(b) => b.clone(),
            Value::Array(array) => array.to_npy(),
            Value::Json(json) => Array::from_json(json)?.to_npy(),
            Value::Text(s) => Array::bytes_scalar(Bytes::from(s.clone())).to_npy(),
        },
    };
    tracing::trace!(%celltype, len = buffer.len(), "serialize");
    Ok(buffer)
}

fn deserialize(buffer: &Bytes, celltype: Celltype) -> Result<Value, SerializeError> {
    match celltype {
        Celltype::Bytes => Ok(Value::Bytes(buffer.clone())),
        Celltype::Text
        | Celltype::Python
        | Celltype::Ipython
        | Celltype::Cson
        | Celltype::Yaml => {
            let text = std::str::from_utf8(buffer).map_err(|_| SerializeError::NotUtf8)?;
            Ok(Value::Text(text.trim_end_matches('\n').to_string()))
        }
        Celltype::Plain | Celltype::Checksum => Ok(Value::Json(parse_json(buffer)?)),
        Celltype::Str => match parse_json(buffer)? {
            json @ Json::String(_) => Ok(Value::Json(json)),
            other => Err(SerializeError::WrongType {
                expected: celltype,
                actual: Value::Json(other).kind(),
            }),
        },
        Celltype::Int | Celltype::Float | Celltype::Bool => {
            let json = parse_json(buffer)?;
            let ok = match celltype {
                Celltype::Int => json.is_i64() || json.is_u64(),
                Celltype::Float => json.is_number(),
                _ => json.is_boolean(),
            };
            if ok {
                Ok(Value::Json(json))
            } else {
                Err(SerializeError::WrongType {
                    expected: celltype,
                    actual: Value::Json(json).kind(),
                })
            }
        }
        Celltype::Mixed => {
            if buffer.starts_with(MAGIC_NUMPY) {
                Ok(Value::Array(Array::from_npy(buffer)?))
            } else if buffer.starts_with(MAGIC_SEAMLESS_MIXED) {
                Err(SerializeError::MixedLayout)
            } else {
                Ok(Value::Json(parse_json(buffer)?))
            }
        }
        Celltype::Binary => Ok(Value::Array(Array::from_npy(buffer)?)),
    }
}

fn parse_json(buffer: &[u8]) -> Result<Json, SerializeError> {
    let text = std::str::from_utf8(buffer).map_err(|_| SerializeError::NotUtf8)?;
    serde_json::from_str(text).map_err(|e| SerializeError::NotJson(e.to_string()))
}

fn wrong_type(expected: Celltype, value: &Value) -> SerializeError {
    SerializeError::WrongType {
        expected,
        actual: value.kind(),
    }
}

/// Casts a scalar value to `int`, `float`, `bool` or `str`.
///
/// Lists, dicts and arrays with dimensions are rejected.
pub fn cast(value: &Value, target: Celltype) -> Result<Json, SerializeError> {
    let scalar = match value {
        Value::Json(json) => json.clone(),
        Value::Text(s) => Json::String(s.clone()),
        Value::Array(array) => array
            .scalar()
            .ok_or_else(|| wrong_type(target, value))?,
        Value::Bytes(_) => return Err(wrong_type(target, value)),
    };
    let fail = || SerializeError::Cast {
        value: scalar.to_string(),
        target,
    };
    let result = match (target, &scalar) {
        (_, Json::Array(_) | Json::Object(_) | Json::Null) => return Err(wrong_type(target, value)),
        (Celltype::Int, Json::Number(n)) => match n.as_i64() {
            Some(i) => Json::from(i),
            None => Json::from(n.as_f64().ok_or_else(fail)?.trunc() as i64),
        },
        (Celltype::Int, Json::Bool(b)) => Json::from(*b as i64),
        (Celltype::Int, Json::String(s)) => {
            Json::from(s.trim().parse::<i64>().map_err(|_| fail())?)
        }
        (Celltype::Float, Json::Number(n)) => {
            Json::from(n.as_f64().ok_or_else(fail)?)
        }
        (Celltype::Float, Json::Bool(b)) => Json::from(if *b { 1.0 } else { 0.0 }),
        (Celltype::Float, Json::String(s)) => {
            Json::from(s.trim().parse::<f64>().map_err(|_| fail())?)
        }
        (Celltype::Bool, Json::Bool(b)) => Json::Bool(*b),
        (Celltype::Bool, Json::Number(n)) => Json::Bool(n.as_f64() != Some(0.0)),
        (Celltype::Bool, Json::String(s)) => Json::Bool(!s.is_empty()),
        (Celltype::Str, Json::String(s)) => Json::String(s.clone()),
        (Celltype::Str, Json::Bool(b)) => Json::String(if *b { "True" } else { "False" }.into()),
        (Celltype::Str, Json::Number(n)) => Json::String(n.to_string()),
        _ => return Err(fail()),
    };
    Ok(result)
}

//! Deserialized cell values and the `.npy` array codec.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Number;

/// Magic prefix of a `.npy` buffer.
pub const MAGIC_NUMPY: &[u8] = b"\x93NUMPY";
/// Magic prefix of a mixed buffer that combines JSON and arrays.
pub const MAGIC_SEAMLESS_MIXED: &[u8] = b"\x94SEAMLESS-MIXED";

/// A deserialized buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Anything JSON can hold. Used by `plain`, `str`, `int`, `float`, `bool`, `checksum`.
    Json(serde_json::Value),
    /// Unquoted text. Used by `text` and the code celltypes.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// A homogeneous array.
    Array(Array),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Json(serde_json::Value::String(s.into()))
    }

    /// The JSON form of the value. Non UTF-8 bytes have none.
    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Value::Json(json) => Some(json),
            Value::Text(text) => Some(serde_json::Value::String(text)),
            Value::Array(array) => Some(array.to_json()),
            Value::Bytes(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .map(|s| serde_json::Value::String(s.to_string())),
        }
    }

    /// Short description for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Json(serde_json::Value::Null) => "null",
            Value::Json(serde_json::Value::Bool(_)) => "bool",
            Value::Json(serde_json::Value::Number(n)) if n.is_f64() => "float",
            Value::Json(serde_json::Value::Number(_)) => "int",
            Value::Json(serde_json::Value::String(_)) => "str",
            Value::Json(serde_json::Value::Array(_)) => "list",
            Value::Json(serde_json::Value::Object(_)) => "dict",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "ndarray",
        }
    }
}

/// Element type of an [`Array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    /// `<i8`
    Int64,
    /// `<f8`
    Float64,
    /// `|b1`
    Bool,
    /// `|S<n>`, fixed width byte strings.
    Bytes(usize),
}

impl Dtype {
    /// Width of one element in bytes.
    pub fn item_size(&self) -> usize {
        match self {
            Dtype::Int64 | Dtype::Float64 => 8,
            Dtype::Bool => 1,
            Dtype::Bytes(n) => *n,
        }
    }

    /// The numpy type descriptor.
    pub fn descr(&self) -> String {
        match self {
            Dtype::Int64 => "<i8".to_string(),
            Dtype::Float64 => "<f8".to_string(),
            Dtype::Bool => "|b1".to_string(),
            Dtype::Bytes(n) => format!("|S{n}"),
        }
    }

    fn from_descr(descr: &str) -> Result<Self, ArrayError> {
        match descr {
            "<i8" => Ok(Dtype::Int64),
            "<f8" => Ok(Dtype::Float64),
            "|b1" => Ok(Dtype::Bool),
            other => {
                let width = other
                    .strip_prefix("|S")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| ArrayError::UnsupportedDtype(other.to_string()))?;
                Ok(Dtype::Bytes(width))
            }
        }
    }

    /// Name as reported in buffer info, e.g. `int64`.
    pub fn name(&self) -> String {
        match self {
            Dtype::Int64 => "int64".to_string(),
            Dtype::Float64 => "float64".to_string(),
            Dtype::Bool => "bool".to_string(),
            Dtype::Bytes(n) => format!("S{n}"),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descr())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArrayError {
    #[error("Not a Numpy buffer")]
    NotNumpy,
    #[error("Malformed Numpy header: {0}")]
    Header(String),
    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),
    #[error("Fortran order arrays are not supported")]
    FortranOrder,
    #[error("Array data has {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },
    #[error("Value is not a numeric scalar or rectangular numeric list")]
    NotNumeric,
}

/// A C-ordered n-dimensional array of one of the supported dtypes.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Bytes,
}

impl Array {
    /// A zero-dimensional byte string array holding `data`.
    pub fn bytes_scalar(data: Bytes) -> Self {
        Array {
            dtype: Dtype::Bytes(data.len()),
            shape: Vec::new(),
            data,
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes as a version 1.0 `.npy` buffer.
    pub fn to_npy(&self) -> Bytes {
        let shape = match self.shape.len() {
            0 => "()".to_string(),
            1 => format!("({},)", self.shape[0]),
            _ => format!(
                "({})",
                self.shape
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let mut header = format!(
            "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
            self.dtype.descr(),
            shape
        );
        // magic + version + header length + header + newline is a multiple of 64
        let unpadded = MAGIC_NUMPY.len() + 2 + 2 + header.len() + 1;
        let padding = (64 - unpadded % 64) % 64;
        header.extend(std::iter::repeat(' ').take(padding));
        header.push('\n');

        let mut out = BytesMut::with_capacity(10 + header.len() + self.data.len());
        out.put_slice(MAGIC_NUMPY);
        out.put_u8(1);
        out.put_u8(0);
        out.put_u16_le(header.len() as u16);
        out.put_slice(header.as_bytes());
        out.put_slice(&self.data);
        out.freeze()
    }

    /// Decodes a `.npy` buffer.
    pub fn from_npy(buffer: &Bytes) -> Result<Self, ArrayError> {
        if !buffer.starts_with(MAGIC_NUMPY) || buffer.len() < 10 {
            return Err(ArrayError::NotNumpy);
        }
        let major = buffer[6];
        let (header_len, offset) = match major {
            1 => (u16::from_le_bytes([buffer[8], buffer[9]]) as usize, 10),
            2 | 3 => {
                if buffer.len() < 12 {
                    return Err(ArrayError::NotNumpy);
                }
                let len = u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);
                (len as usize, 12)
            }
            v => return Err(ArrayError::Header(format!("version {v}"))),
        };
        let end = offset + header_len;
        if buffer.len() < end {
            return Err(ArrayError::Header("truncated".to_string()));
        }
        let header = std::str::from_utf8(&buffer[offset..end])
            .map_err(|_| ArrayError::Header("not ascii".to_string()))?;
        let descr = header_field(header, "descr")?;
        let descr = descr.trim_matches(|c| c == '\'' || c == '"');
        let dtype = Dtype::from_descr(descr)?;
        if header_field(header, "fortran_order")? != "False" {
            return Err(ArrayError::FortranOrder);
        }
        let shape_str = header_field(header, "shape")?;
        let shape = shape_str
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ArrayError::Header(format!("shape {shape_str}")))?;
        let data = buffer.slice(end..);
        let expected = shape.iter().product::<usize>() * dtype.item_size();
        if data.len() != expected {
            return Err(ArrayError::Length {
                expected,
                actual: data.len(),
            });
        }
        Ok(Array { dtype, shape, data })
    }

    /// Builds an array from a JSON number, bool, or rectangular list of them.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ArrayError> {
        let mut shape = Vec::new();
        let mut cursor = value;
        while let serde_json::Value::Array(items) = cursor {
            shape.push(items.len());
            match items.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }
        let mut leaves = Vec::new();
        collect_leaves(value, &shape, 0, &mut leaves)?;
        let dtype = if leaves.iter().all(|v| v.is_boolean()) && !leaves.is_empty() {
            Dtype::Bool
        } else if leaves.iter().any(|v| v.is_boolean()) {
            return Err(ArrayError::NotNumeric);
        } else if leaves.iter().all(|v| v.is_i64()) {
            Dtype::Int64
        } else {
            Dtype::Float64
        };
        let mut data = BytesMut::with_capacity(leaves.len() * dtype.item_size());
        for leaf in leaves {
            match dtype {
                Dtype::Bool => data.put_u8(leaf.as_bool().unwrap_or_default() as u8),
                Dtype::Int64 => data.put_i64_le(leaf.as_i64().unwrap_or_default()),
                Dtype::Float64 => data.put_f64_le(leaf.as_f64().unwrap_or_default()),
                Dtype::Bytes(_) => return Err(ArrayError::NotNumeric),
            }
        }
        Ok(Array {
            dtype,
            shape,
            data: data.freeze(),
        })
    }

    /// Converts to nested JSON lists. Byte strings become JSON strings.
    pub fn to_json(&self) -> serde_json::Value {
        let size = self.dtype.item_size();
        let items: Vec<serde_json::Value> = (0..self.len())
            .map(|i| self.element(&self.data[i * size..(i + 1) * size]))
            .collect();
        if self.shape.is_empty() {
            return items
                .into_iter()
                .next()
                .unwrap_or(serde_json::Value::Null);
        }
        nest(&items, &self.shape)
    }

    /// The single element of a zero-dimensional array.
    pub fn scalar(&self) -> Option<serde_json::Value> {
        if self.ndim() == 0 {
            Some(self.to_json())
        } else {
            None
        }
    }

    fn element(&self, raw: &[u8]) -> serde_json::Value {
        match self.dtype {
            Dtype::Int64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                serde_json::Value::from(i64::from_le_bytes(b))
            }
            Dtype::Float64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                Number::from_f64(f64::from_le_bytes(b))
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
            Dtype::Bool => serde_json::Value::Bool(raw[0] != 0),
            Dtype::Bytes(_) => {
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                serde_json::Value::String(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
        }
    }
}

fn header_field<'a>(header: &'a str, key: &str) -> Result<&'a str, ArrayError> {
    let pattern = format!("'{key}':");
    let start = header
        .find(&pattern)
        .ok_or_else(|| ArrayError::Header(format!("missing {key}")))?
        + pattern.len();
    let rest = header[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find(',')
    }
    .ok_or_else(|| ArrayError::Header(format!("unterminated {key}")))?;
    Ok(rest[..end].trim())
}

fn collect_leaves<'a>(
    value: &'a serde_json::Value,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<&'a serde_json::Value>,
) -> Result<(), ArrayError> {
    match value {
        serde_json::Value::Array(items) => {
            if shape.get(depth) != Some(&items.len()) {
                return Err(ArrayError::NotNumeric);
            }
            for item in items {
                collect_leaves(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        serde_json::Value::Number(_) | serde_json::Value::Bool(_) if depth == shape.len() => {
            out.push(value);
            Ok(())
        }
        _ => Err(ArrayError::NotNumeric),
    }
}

fn nest(items: &[serde_json::Value], shape: &[usize]) -> serde_json::Value {
    match shape {
        [] => items
            .first()
            .cloned()
            .unwrap_or(serde_json::Value::Null),
        [_] => serde_json::Value::Array(items.to_vec()),
        [n, rest @ ..] => {
            let stride: usize = rest.iter().product();
            serde_json::Value::Array(
                (0..*n)
                    .map(|i| nest(&items[i * stride..(i + 1) * stride], rest))
                    .collect(),
            )
        }
    }
}

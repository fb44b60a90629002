//! Celltype conversion of checksums.
//!
//! [`Converter::try_convert`] does the cheap part: it answers from the conversion table and
//! buffer info where possible, and rewrites buffers that are available. [`Converter::convert`]
//! is the complete operation, delegating conversions that need the full value to a
//! [`ValueConversion`].

use std::{collections::HashSet, fmt, sync::Arc};

use bytes::Bytes;
use futures_lite::future::Boxed;
use parking_lot::Mutex;
use serde_json::Value as Json;
use tracing::{debug, trace};

use crate::{
    buffer_cache::BufferCache,
    buffer_info::{conversion_from_buffer_info, verify, BufferInfo, ConversionField, Field},
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    conversion::{canonical, conversion, resolve_chain, Conversion, Outcome},
    error::{truncate, CacheMiss, ConversionError, Result},
    serialize::{cast, Serializer},
    value::{Array, Dtype, Value, MAGIC_NUMPY, MAGIC_SEAMLESS_MIXED},
};

/// Buffers above this size are never scalars.
const MAX_SCALAR_BUFFER: usize = 1000;

/// Where a conversion step may look for the buffer it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// Only use the buffer that was passed in.
    Never,
    /// Also look in the local cache.
    Local,
    /// Also ask the remote tiers.
    Remote,
}

/// Performs conversions that need the whole value, such as `plain` to `binary`.
pub trait ValueConversion: fmt::Debug + Send + Sync + 'static {
    fn convert(
        &self,
        converter: Converter,
        checksum: Checksum,
        source: Celltype,
        target: Celltype,
    ) -> Boxed<Result<Checksum>>;
}

/// The default [`ValueConversion`].
///
/// Converts between `binary` and `plain`, and to and from `checksum`. It only looks for
/// buffers locally and in the remote tiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValueConversion;

impl ValueConversion for DefaultValueConversion {
    fn convert(
        &self,
        converter: Converter,
        checksum: Checksum,
        source: Celltype,
        target: Celltype,
    ) -> Boxed<Result<Checksum>> {
        Box::pin(async move { converter.value_conversion(checksum, source, target).await })
    }
}

/// Converts checksums between celltypes, using and recording buffer info.
#[derive(Debug, Clone)]
pub struct Converter {
    buffers: BufferCache,
    serializer: Arc<dyn Serializer>,
    value_conversion: Arc<dyn ValueConversion>,
    /// (checksum, celltype) pairs whose text was validated.
    validated: Arc<Mutex<HashSet<(Checksum, Celltype)>>>,
}

impl Converter {
    pub fn new(buffers: BufferCache, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            buffers,
            serializer,
            value_conversion: Arc::new(DefaultValueConversion),
            validated: Default::default(),
        }
    }

    /// Replaces the callback used for value conversion steps.
    pub fn with_value_conversion(mut self, value_conversion: Arc<dyn ValueConversion>) -> Self {
        self.value_conversion = value_conversion;
        self
    }

    pub fn buffers(&self) -> &BufferCache {
        &self.buffers
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// Serializes a value and keeps the buffer in the cache.
    pub async fn store(&self, value: &Value, celltype: Celltype) -> Result<Checksum> {
        let buffer = Buffer::new(self.serializer.serialize(value, celltype)?);
        let checksum = buffer.checksum();
        self.buffers.cache(&checksum, buffer).await;
        Ok(checksum)
    }

    /// Returns true if the buffer is known to be valid for `celltype`.
    pub fn has_validated_evaluation(&self, checksum: &Checksum, celltype: Celltype) -> bool {
        let celltype = match celltype {
            Celltype::Bytes | Celltype::Checksum => return true,
            Celltype::Ipython | Celltype::Python | Celltype::Cson | Celltype::Yaml => {
                Celltype::Text
            }
            other => other,
        };
        if self.validated.lock().contains(&(*checksum, celltype)) {
            return true;
        }
        self.buffers
            .buffer_info()
            .get_local(checksum)
            .is_some_and(|info| verify(&info, celltype))
    }

    /// Tries to convert without value conversions, in three passes.
    ///
    /// The first pass looks at the conversion table only, to find impossible chains
    /// quickly. The second uses `buffer` or the local cache, the third also the remote
    /// tiers. Both stop at the first value conversion step that cannot be settled.
    pub async fn try_convert(
        &self,
        checksum: &Checksum,
        source: Celltype,
        target: Celltype,
        buffer: Option<Buffer>,
        buffer_info: Option<&BufferInfo>,
    ) -> Result<Outcome, ConversionError> {
        if source == target {
            return Ok(Outcome::Unchanged);
        }
        let chain = resolve_chain(source, target);
        let passes = [
            (false, Fetch::Never, false),
            (true, Fetch::Local, true),
            (true, Fetch::Remote, true),
        ];
        let mut result = Outcome::Undetermined;
        for (with_buffer, fetch, break_on_value) in passes {
            result = self
                .try_chain(
                    checksum,
                    source,
                    &chain,
                    with_buffer.then(|| buffer.clone()).flatten(),
                    with_buffer.then_some(buffer_info).flatten(),
                    fetch,
                    break_on_value,
                )
                .await?;
            trace!(%checksum, %source, %target, ?fetch, ?result, "try_convert pass");
            if result.is_settled() {
                break;
            }
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_chain(
        &self,
        checksum: &Checksum,
        source: Celltype,
        chain: &[Celltype],
        buffer: Option<Buffer>,
        buffer_info: Option<&BufferInfo>,
        fetch: Fetch,
        break_on_value: bool,
    ) -> Result<Outcome, ConversionError> {
        let mut current = *checksum;
        let mut current_celltype = source;
        let mut current_buffer = buffer;
        let mut unsettled = None;
        for next in chain.iter().copied() {
            let local_info;
            let info = if current == *checksum {
                buffer_info
            } else if fetch != Fetch::Never {
                local_info = self.buffers.buffer_info().get_local(&current);
                local_info.as_ref()
            } else {
                None
            };
            let outcome = self
                .try_convert_single(
                    &current,
                    current_celltype,
                    next,
                    current_buffer.clone(),
                    info,
                    fetch,
                )
                .await?;
            match outcome {
                Outcome::Converted(c) => {
                    if c != current {
                        current = c;
                        current_buffer = None;
                    }
                }
                Outcome::Unchanged => {}
                Outcome::Impossible => return Ok(Outcome::Impossible),
                Outcome::Pending | Outcome::Undetermined => {
                    if break_on_value && is_value_step(current_celltype, next) {
                        return Ok(Outcome::Undetermined);
                    }
                    if unsettled != Some(Outcome::Undetermined) {
                        unsettled = Some(outcome);
                    }
                }
            }
            current_celltype = next;
        }
        Ok(match unsettled {
            Some(outcome) => outcome,
            None if current == *checksum => Outcome::Unchanged,
            None => Outcome::Converted(current),
        })
    }

    /// Does a single step of a conversion chain.
    ///
    /// Chained pairs must be expanded with [`resolve_chain`] first.
    pub async fn try_convert_single(
        &self,
        checksum: &Checksum,
        source: Celltype,
        target: Celltype,
        buffer: Option<Buffer>,
        buffer_info: Option<&BufferInfo>,
        fetch: Fetch,
    ) -> Result<Outcome, ConversionError> {
        if source == target {
            return Ok(Outcome::Unchanged);
        }
        let (source, target) = canonical(source, target);
        let class = conversion(source, target);
        let mut outcome = match (buffer_info, class) {
            (_, Conversion::Chain(_)) => {
                return Err(ConversionError::new(
                    "Chained conversions must be handled upstream",
                ))
            }
            (Some(info), _) => match conversion_from_buffer_info(info, source, target) {
                Ok(outcome) if outcome.is_settled() => return Ok(outcome),
                Ok(outcome) => outcome,
                Err(err) => return Err(ConversionError::reinterpret(checksum, source, target, err)),
            },
            (None, Conversion::Identity | Conversion::Trivial) => return Ok(Outcome::Unchanged),
            (None, Conversion::Forbidden) => return Ok(Outcome::Impossible),
            (None, Conversion::Reformat) => Outcome::Pending,
            (None, _) => Outcome::Undetermined,
        };
        if class == Conversion::Value {
            return Ok(Outcome::Undetermined);
        }
        let buffer = match (buffer, fetch) {
            (Some(buffer), _) => Some(buffer),
            (None, Fetch::Never) => None,
            (None, fetch) => self.buffers.get(checksum, fetch == Fetch::Remote).await,
        };
        if let Some(buffer) = buffer {
            if let Some(result) = self
                .convert_from_buffer(checksum, &buffer, source, target)
                .await?
            {
                outcome = Outcome::Converted(result);
            }
        }
        if let Outcome::Converted(result) = outcome {
            self.buffers
                .guarantee_buffer_info(&result, target, None, true)
                .await;
        }
        Ok(outcome)
    }

    async fn convert_from_buffer(
        &self,
        checksum: &Checksum,
        buffer: &Buffer,
        source: Celltype,
        target: Celltype,
    ) -> Result<Option<Checksum>, ConversionError> {
        if buffer.len() > MAX_SCALAR_BUFFER
            && matches!(target, Celltype::Int | Celltype::Float | Celltype::Bool)
        {
            return Err(ConversionError::new("Buffer too long"));
        }
        match conversion(source, target) {
            Conversion::Reinterpret => self
                .reinterpret(checksum, buffer, source, target)
                .await
                .map(Some),
            Conversion::Reformat => self.reformat(checksum, buffer, source, target).await.map(Some),
            Conversion::Possible => self
                .convert_possible(checksum, buffer, source, target)
                .await
                .map(Some),
            _ => Ok(None),
        }
    }

    /// Checks that the buffer is valid for `target`. The checksum does not change.
    async fn reinterpret(
        &self,
        checksum: &Checksum,
        buffer: &Buffer,
        source: Celltype,
        target: Celltype,
    ) -> Result<Checksum, ConversionError> {
        let fail = |cause: &dyn fmt::Display| {
            ConversionError::reinterpret(checksum, source, target, cause)
        };
        match target {
            Celltype::Bytes => {}
            Celltype::Binary => {
                let ok = buffer.starts_with(MAGIC_NUMPY);
                self.buffers
                    .update_buffer_info(checksum, Field::IsNumpy(ok), true)
                    .await;
                if !ok {
                    return Err(fail(&"Buffer is not a Numpy buffer"));
                }
            }
            Celltype::Mixed => {
                if !buffer.starts_with(MAGIC_NUMPY) && !buffer.starts_with(MAGIC_SEAMLESS_MIXED) {
                    self.check_json(checksum, buffer)
                        .await
                        .map_err(|e| fail(&e))?;
                }
            }
            Celltype::Plain => {
                self.check_json(checksum, buffer)
                    .await
                    .map_err(|e| fail(&e))?;
            }
            Celltype::Str | Celltype::Int | Celltype::Float | Celltype::Bool => {
                self.serializer
                    .deserialize(buffer.bytes(), target)
                    .map_err(|e| fail(&e))?;
            }
            _ => {
                let text = self.check_utf8(checksum, buffer).await.map_err(|e| fail(&e))?;
                self.serializer
                    .validate_text(text.trim_end_matches('\n'), target)
                    .map_err(|e| fail(&e))?;
                self.validated.lock().insert((*checksum, Celltype::Text));
            }
        }
        Ok(*checksum)
    }

    async fn check_utf8<'a>(
        &self,
        checksum: &Checksum,
        buffer: &'a Buffer,
    ) -> Result<&'a str, std::str::Utf8Error> {
        let text = std::str::from_utf8(buffer);
        self.buffers
            .update_buffer_info(checksum, Field::IsUtf8(text.is_ok()), true)
            .await;
        text
    }

    async fn check_json(&self, checksum: &Checksum, buffer: &Buffer) -> Result<Json, String> {
        let text = self
            .check_utf8(checksum, buffer)
            .await
            .map_err(|e| e.to_string())?;
        let parsed = serde_json::from_str::<Json>(text);
        self.buffers
            .update_buffer_info(checksum, Field::IsJson(parsed.is_ok()), true)
            .await;
        parsed.map_err(|e| e.to_string())
    }

    /// Deterministic rewrites that succeed for any valid input.
    async fn reformat(
        &self,
        checksum: &Checksum,
        buffer: &Buffer,
        source: Celltype,
        target: Celltype,
    ) -> Result<Checksum, ConversionError> {
        use Celltype as C;
        let fail =
            |cause: &dyn fmt::Display| ConversionError::convert(checksum, source, target, cause);
        let deserialize = |celltype: Celltype| {
            self.serializer
                .deserialize(buffer.bytes(), celltype)
                .map_err(|e| fail(&e))
        };
        let mut recorded = None;
        let target_buffer: Bytes = match (source, target) {
            (_, C::Int | C::Float | C::Bool) | (C::Int | C::Float | C::Bool, C::Str) => {
                let value = cast(&deserialize(source)?, target).map_err(|e| fail(&e))?;
                self.serializer.serialize(&Value::Json(value), target).map_err(|e| fail(&e))?
            }
            (C::Bytes, C::Binary | C::Mixed) => {
                if buffer.starts_with(MAGIC_NUMPY) {
                    self.buffers
                        .guarantee_buffer_info(checksum, C::Binary, Some(buffer), true)
                        .await;
                    return Ok(*checksum);
                }
                if target == C::Mixed && buffer.starts_with(MAGIC_SEAMLESS_MIXED) {
                    self.buffers
                        .guarantee_buffer_info(checksum, C::Mixed, Some(buffer), true)
                        .await;
                    return Ok(*checksum);
                }
                match std::str::from_utf8(buffer) {
                    Ok(text) if target == C::Mixed => {
                        self.buffers
                            .guarantee_buffer_info(checksum, C::Text, Some(buffer), true)
                            .await;
                        if serde_json::from_str::<Json>(text).is_ok() {
                            self.buffers
                                .guarantee_buffer_info(checksum, C::Plain, Some(buffer), true)
                                .await;
                            return Ok(*checksum);
                        }
                        recorded = Some(ConversionField::Text2str);
                        self.serializer
                            .serialize(&Value::str(text.trim_end_matches('\n')), C::Str)
                            .map_err(|e| fail(&e))?
                    }
                    _ => {
                        recorded = Some(ConversionField::Bytes2binary);
                        Array::bytes_scalar(buffer.bytes().clone()).to_npy()
                    }
                }
            }
            (C::Binary | C::Mixed, C::Bytes) => {
                if source == C::Mixed && !buffer.starts_with(MAGIC_NUMPY) {
                    return Ok(*checksum);
                }
                let array = Array::from_npy(buffer.bytes()).map_err(|e| fail(&e))?;
                match array.dtype {
                    Dtype::Bytes(_) => {
                        recorded = Some(ConversionField::Binary2bytes);
                        array.data.clone()
                    }
                    _ => return Ok(*checksum),
                }
            }
            (C::Plain, C::Text) => match deserialize(C::Plain)? {
                Value::Json(Json::String(s)) => {
                    recorded = Some(ConversionField::Str2text);
                    self.serializer.serialize(&Value::Text(s), C::Text).map_err(|e| fail(&e))?
                }
                _ => {
                    self.buffers
                        .guarantee_buffer_info(checksum, C::Text, Some(buffer), true)
                        .await;
                    return Ok(*checksum);
                }
            },
            (C::Text, C::Plain) => {
                if let Ok(text) = std::str::from_utf8(buffer) {
                    if serde_json::from_str::<Json>(text).is_ok() {
                        self.buffers
                            .guarantee_buffer_info(checksum, C::Plain, Some(buffer), true)
                            .await;
                        return Ok(*checksum);
                    }
                }
                let text = deserialize(C::Text)?;
                recorded = Some(ConversionField::Text2str);
                self.serializer.serialize(&text, C::Str).map_err(|e| fail(&e))?
            }
            (C::Text, C::Str) | (C::Str, C::Text) => {
                recorded = ConversionField::for_conversion(source, target);
                let value = match deserialize(source)? {
                    Value::Json(Json::String(s)) => Value::Text(s),
                    Value::Text(s) => Value::str(s),
                    other => other,
                };
                self.serializer.serialize(&value, target).map_err(|e| fail(&e))?
            }
            (C::Cson | C::Yaml, C::Plain) => {
                let Value::Text(text) = deserialize(C::Text)? else {
                    return Err(fail(&"not a text buffer"));
                };
                let value = self
                    .serializer
                    .parse_structured(&text, source)
                    .map_err(|e| fail(&e))?;
                self.serializer.serialize(&Value::Json(value), C::Plain).map_err(|e| fail(&e))?
            }
            (C::Ipython, C::Python) => {
                let Value::Text(text) = deserialize(C::Text)? else {
                    return Err(fail(&"not a text buffer"));
                };
                let code = self
                    .serializer
                    .ipython_to_python(&text)
                    .map_err(|e| fail(&e))?;
                self.serializer.serialize(&Value::Text(code), C::Python).map_err(|e| fail(&e))?
            }
            _ => {
                return Err(ConversionError::new(format!(
                    "No reformat rule from {source} to {target}"
                )))
            }
        };
        let target_buffer = Buffer::new(target_buffer);
        let target_checksum = target_buffer.checksum();
        self.buffers
            .cache(&target_checksum, target_buffer.clone())
            .await;
        if let Some(field) = recorded {
            let infos = self.buffers.buffer_info();
            infos
                .update(checksum, Field::Conversion(field, target_checksum), true)
                .await;
            infos.update_local(&target_checksum, Field::Conversion(field.reverse(), *checksum));
        }
        let guaranteed = match recorded {
            Some(ConversionField::Text2str) => C::Str,
            Some(ConversionField::Bytes2binary) => C::Binary,
            _ => target,
        };
        self.buffers
            .guarantee_buffer_info(&target_checksum, guaranteed, Some(&target_buffer), true)
            .await;
        debug!(%checksum, %source, %target, result = %target_checksum, "reformatted");
        Ok(target_checksum)
    }

    /// Value dependent scalar casts.
    async fn convert_possible(
        &self,
        checksum: &Checksum,
        buffer: &Buffer,
        source: Celltype,
        target: Celltype,
    ) -> Result<Checksum, ConversionError> {
        let fail =
            |cause: &dyn fmt::Display| ConversionError::convert(checksum, source, target, cause);
        if source == Celltype::Mixed && target == Celltype::Str {
            if buffer.starts_with(MAGIC_NUMPY) {
                return Err(fail(&"Numpy format"));
            }
            if buffer.starts_with(MAGIC_SEAMLESS_MIXED) {
                return Err(fail(&"Seamless mixed buffer format"));
            }
        }
        let value = self
            .serializer
            .deserialize(buffer.bytes(), source)
            .map_err(|e| fail(&e))?;
        match &value {
            Value::Json(json @ (Json::Array(_) | Json::Object(_))) => {
                return Err(fail(&Value::Json(json.clone()).kind()))
            }
            Value::Array(array) if array.ndim() > 0 => {
                return Err(fail(&format!("ndarray with {} dimensions", array.ndim())))
            }
            _ => {}
        }
        let value = cast(&value, target).map_err(|e| fail(&e))?;
        let target_buffer = Buffer::new(
            self.serializer
                .serialize(&Value::Json(value), target)
                .map_err(|e| fail(&e))?,
        );
        let target_checksum = target_buffer.checksum();
        self.buffers
            .cache(&target_checksum, target_buffer.clone())
            .await;
        self.buffers
            .guarantee_buffer_info(&target_checksum, target, Some(&target_buffer), true)
            .await;
        Ok(target_checksum)
    }

    /// Converts a checksum from `source` to `target`, including value conversions.
    ///
    /// If `buffer` is given it is cached first. Conversion results are recorded in the
    /// buffer info.
    pub async fn convert(
        &self,
        checksum: &Checksum,
        source: Celltype,
        target: Celltype,
        buffer: Option<Buffer>,
    ) -> Result<Checksum> {
        if let Some(buffer) = &buffer {
            self.buffers.cache(checksum, buffer.clone()).await;
        }
        let infos = self.buffers.buffer_info();
        match self.try_convert(checksum, source, target, None, None).await? {
            Outcome::Converted(result) => {
                infos
                    .update_conversion(checksum, source, &result, target, true)
                    .await;
                return Ok(result);
            }
            Outcome::Unchanged => return Ok(*checksum),
            Outcome::Impossible => {
                return Err(ConversionError::new("Checksum cannot be converted").into())
            }
            Outcome::Pending | Outcome::Undetermined => {}
        }
        let mut current = *checksum;
        let mut current_celltype = source;
        for next in resolve_chain(source, target) {
            let info = infos.get(&current, current == *checksum).await;
            let outcome = self
                .try_convert_single(
                    &current,
                    current_celltype,
                    next,
                    None,
                    Some(&info),
                    Fetch::Remote,
                )
                .await?;
            let result = match outcome {
                Outcome::Converted(result) => result,
                Outcome::Unchanged => current,
                Outcome::Pending | Outcome::Undetermined => {
                    if !is_value_step(current_celltype, next) {
                        return Err(CacheMiss::new(current).into());
                    }
                    self.value_conversion
                        .convert(self.clone(), current, current_celltype, next)
                        .await?
                }
                Outcome::Impossible => {
                    return Err(ConversionError::new("Unexpected conversion error").into())
                }
            };
            if result != current {
                infos
                    .update_conversion(&current, current_celltype, &result, next, true)
                    .await;
                current = result;
            }
            current_celltype = next;
        }
        Ok(current)
    }

    /// The built-in value conversions, see [`DefaultValueConversion`].
    pub async fn value_conversion(
        &self,
        checksum: Checksum,
        source: Celltype,
        target: Celltype,
    ) -> Result<Checksum> {
        use Celltype as C;
        if target == C::Checksum {
            let buffer = Buffer::new(checksum.to_hex());
            let result = buffer.checksum();
            self.buffers.cache(&result, buffer).await;
            return Ok(result);
        }
        let buffer = self
            .buffers
            .get(&checksum, true)
            .await
            .ok_or_else(|| CacheMiss::new(checksum))?;
        if source == C::Checksum {
            return match validate_checksum_value(buffer.bytes())? {
                Json::String(_) => Ok(checksum),
                _ if target == C::Plain => Ok(checksum),
                _ => Err(
                    ConversionError::new("Cannot convert deep cell in value conversion").into(),
                ),
            };
        }
        let fail =
            |cause: &dyn fmt::Display| ConversionError::convert(&checksum, source, target, cause);
        let value = self
            .serializer
            .deserialize(buffer.bytes(), source)
            .map_err(|e| fail(&e))?;
        let infos = self.buffers.buffer_info();
        let (target_value, array) = match (source, target) {
            (C::Binary, C::Plain) => {
                let json = match &value {
                    Value::Array(array) => array.to_json(),
                    Value::Json(json) => json.clone(),
                    other => return Err(fail(&other.kind()).into()),
                };
                (Value::Json(json), None)
            }
            (C::Plain, C::Binary) => {
                let json = match &value {
                    Value::Json(json) => json,
                    other => return Err(fail(&other.kind()).into()),
                };
                let scalar = matches!(json, Json::Number(_) | Json::Bool(_));
                let array = match json {
                    Json::Number(_) | Json::Bool(_) | Json::Array(_) => Array::from_json(json).ok(),
                    _ => None,
                };
                let Some(array) = array else {
                    infos.update_local(&checksum, Field::IsJsonNumericScalar(false));
                    infos
                        .update(&checksum, Field::IsJsonNumericArray(false), true)
                        .await;
                    return Err(fail(&truncate(&String::from_utf8_lossy(&buffer))).into());
                };
                let field = if scalar {
                    Field::IsJsonNumericScalar(true)
                } else {
                    Field::IsJsonNumericArray(true)
                };
                infos.update(&checksum, field, true).await;
                (Value::Array(array.clone()), Some(array))
            }
            _ => {
                return Err(ConversionError::new(format!(
                    "No value conversion from {source} to {target}"
                ))
                .into())
            }
        };
        let result = self.store(&target_value, target).await?;
        if let Some(array) = array {
            infos.update_local(&result, Field::Shape(array.shape.clone()));
            infos.update_local(&result, Field::Dtype(array.dtype.name()));
        }
        infos
            .update_conversion(&checksum, source, &result, target, true)
            .await;
        self.buffers
            .guarantee_buffer_info(&result, target, None, true)
            .await;
        Ok(result)
    }
}

fn is_value_step(source: Celltype, target: Celltype) -> bool {
    let (source, target) = canonical(source, target);
    conversion(source, target) == Conversion::Value
}

/// Checks the content of a `checksum` cell: a hex checksum, or a list or dict of them.
pub fn validate_checksum_value(buffer: &Bytes) -> Result<Json, ConversionError> {
    fn check(value: &Json) -> Result<(), ConversionError> {
        match value {
            Json::String(s) => s
                .parse::<Checksum>()
                .map(|_| ())
                .map_err(|e| ConversionError::new(e.to_string())),
            Json::Array(items) => items.iter().try_for_each(check),
            Json::Object(map) => map.values().try_for_each(check),
            other => Err(ConversionError::new(format!("Invalid checksum: {other}"))),
        }
    }
    let text = std::str::from_utf8(buffer).map_err(|e| ConversionError::new(e.to_string()))?;
    let trimmed = text.trim();
    // a bare hex string is accepted as well as a JSON one
    let value = match serde_json::from_str::<Json>(trimmed) {
        Ok(value) => value,
        Err(_) => Json::String(trimmed.to_string()),
    };
    check(&value)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        buffer_info::BufferInfoStore,
        config::BufferConfig,
        database::Database,
        error::Error,
        remote::RemoteBufferLayer,
        serialize::{json_dumps, DefaultSerializer},
    };

    fn converter() -> Converter {
        let infos = Arc::new(BufferInfoStore::new(Database::inactive()));
        let remote = RemoteBufferLayer::new(Default::default());
        let buffers = BufferCache::new(BufferConfig::default(), remote, infos);
        Converter::new(buffers, Arc::new(DefaultSerializer))
    }

    async fn put(converter: &Converter, data: impl Into<Bytes>) -> Checksum {
        let buffer = Buffer::new(data.into());
        let checksum = buffer.checksum();
        converter.buffers().cache(&checksum, buffer).await;
        checksum
    }

    async fn read(converter: &Converter, checksum: &Checksum) -> Bytes {
        converter
            .buffers()
            .get(checksum, false)
            .await
            .map(|b| b.bytes().clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn plain_to_int() -> anyhow::Result<()> {
        let conv = converter();
        let c = put(&conv, "42\n").await;
        let result = conv.convert(&c, Celltype::Plain, Celltype::Int, None).await?;
        assert_eq!(read(&conv, &result).await, Bytes::from("42\n"));

        let c = put(&conv, json_dumps(&serde_json::json!([1, 2]))).await;
        let err = conv
            .convert(&c, Celltype::Plain, Celltype::Int, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)), "{err}");
        assert!(err.to_string().contains("cannot be converted from plain to int"));
        Ok(())
    }

    #[tokio::test]
    async fn table_alone_detects_impossible_chains() -> anyhow::Result<()> {
        let conv = converter();
        let c = Checksum::new(b"not cached");
        let outcome = conv
            .try_convert(&c, Celltype::Text, Celltype::Text, None, None)
            .await?;
        assert_eq!(outcome, Outcome::Unchanged);
        let outcome = conv
            .try_convert(&c, Celltype::Python, Celltype::Int, None, None)
            .await?;
        assert_eq!(outcome, Outcome::Impossible);
        Ok(())
    }

    #[tokio::test]
    async fn str_text_roundtrip_is_recorded() -> anyhow::Result<()> {
        let conv = converter();
        let text = put(&conv, "hello\nworld\n").await;
        let s = conv.convert(&text, Celltype::Text, Celltype::Str, None).await?;
        assert_eq!(read(&conv, &s).await, Bytes::from("\"hello\\nworld\"\n"));
        let back = conv.convert(&s, Celltype::Str, Celltype::Text, None).await?;
        assert_eq!(back, text);
        let info = conv.buffers().buffer_info().get_local(&text).unwrap_or_default();
        assert_eq!(info.text2str, Some(s));
        let info = conv.buffers().buffer_info().get_local(&s).unwrap_or_default();
        assert_eq!(info.str2text, Some(text));
        Ok(())
    }

    #[tokio::test]
    async fn reinterpret_failure_is_an_error() -> anyhow::Result<()> {
        let conv = converter();
        let c = put(&conv, "not json\n").await;
        let err = conv
            .try_convert(&c, Celltype::Bytes, Celltype::Plain, None, None)
            .await
            .unwrap_err();
        assert!(err
            .message()
            .starts_with(&format!("{c} cannot be re-interpreted from bytes to plain")));
        let info = conv.buffers().buffer_info().get_local(&c).unwrap_or_default();
        assert_eq!(info.is_utf8, Some(true));
        assert_eq!(info.is_json, Some(false));
        Ok(())
    }

    #[tokio::test]
    async fn long_buffers_are_not_scalars() -> anyhow::Result<()> {
        let conv = converter();
        let c = put(&conv, format!("\"{}\"\n", "1".repeat(2000))).await;
        let err = conv
            .try_convert(&c, Celltype::Str, Celltype::Int, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Buffer too long");
        Ok(())
    }

    #[tokio::test]
    async fn plain_binary_value_conversion() -> anyhow::Result<()> {
        let conv = converter();
        let plain = put(&conv, json_dumps(&serde_json::json!([[1, 2], [3, 4]]))).await;
        let binary = conv
            .convert(&plain, Celltype::Plain, Celltype::Binary, None)
            .await?;
        let array = Array::from_npy(&read(&conv, &binary).await)?;
        assert_eq!(array.shape, vec![2, 2]);
        let infos = conv.buffers().buffer_info();
        let info = infos.get_local(&plain).unwrap_or_default();
        assert_eq!(info.json2binary, Some(binary));
        assert_eq!(info.is_json_numeric_array, Some(true));
        let info = infos.get_local(&binary).unwrap_or_default();
        assert_eq!(info.shape, Some(vec![2, 2]));
        assert_eq!(info.is_numpy, Some(true));

        let back = conv
            .convert(&binary, Celltype::Binary, Celltype::Plain, None)
            .await?;
        assert_eq!(back, plain);

        let dict = put(&conv, json_dumps(&serde_json::json!({"a": 1}))).await;
        assert!(conv
            .convert(&dict, Celltype::Plain, Celltype::Binary, None)
            .await
            .is_err());
        let info = infos.get_local(&dict).unwrap_or_default();
        assert_eq!(info.is_json_numeric_array, Some(false));
        Ok(())
    }

    #[tokio::test]
    async fn checksum_value_conversions() -> anyhow::Result<()> {
        let conv = converter();
        let c = put(&conv, "1\n").await;
        let as_checksum = conv
            .convert(&c, Celltype::Plain, Celltype::Checksum, None)
            .await?;
        assert_eq!(read(&conv, &as_checksum).await, Bytes::from(c.to_hex()));

        let deep = put(&conv, json_dumps(&serde_json::json!({"a": c.to_hex()}))).await;
        let same = conv
            .convert(&deep, Celltype::Checksum, Celltype::Plain, None)
            .await?;
        assert_eq!(same, deep);
        assert!(conv
            .convert(&deep, Celltype::Checksum, Celltype::Text, None)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn missing_buffers_are_cache_misses() {
        let conv = converter();
        let c = Checksum::new(b"[1]\n");
        let err = conv
            .convert(&c, Celltype::Plain, Celltype::Binary, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheMiss(_)), "{err}");
    }

    #[tokio::test]
    async fn bytes_to_mixed() -> anyhow::Result<()> {
        let conv = converter();
        let json = put(&conv, "[1, 2]").await;
        let result = conv
            .convert(&json, Celltype::Bytes, Celltype::Mixed, None)
            .await?;
        assert_eq!(result, json);

        let text = put(&conv, "some text").await;
        let result = conv
            .convert(&text, Celltype::Bytes, Celltype::Mixed, None)
            .await?;
        assert_eq!(read(&conv, &result).await, Bytes::from("\"some text\"\n"));

        let raw = put(&conv, vec![0xffu8, 0xfe]).await;
        let result = conv
            .convert(&raw, Celltype::Bytes, Celltype::Mixed, None)
            .await?;
        let array = Array::from_npy(&read(&conv, &result).await)?;
        assert_eq!(array.dtype, Dtype::Bytes(2));
        Ok(())
    }
}

//! Expressions: a checksum accessed at a path and converted to a target celltype.
//!
//! An expression is provenance. Its result can be recomputed from the source checksum at any
//! time, which the fingertipper uses to regenerate lost buffers.

use std::{collections::HashMap, fmt};

use futures_lite::future::Boxed;
use parking_lot::Mutex;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, trace};

use crate::{
    buffer_cache::BufferCache,
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    conversion::{canonical, conversion, Conversion},
    convert::Converter,
    deep_structure::{
        self, access, access_hash_pattern, Access, DeepStructureError, HashPattern, PathItem,
    },
    error::{CacheMiss, ConversionError, Result},
    serialize::json_dumps,
    value::Value,
};

/// Where evaluation gets its input buffers.
///
/// The buffer cache only looks in memory and the remote tiers. The fingertipper also
/// recomputes buffers from provenance.
pub trait BufferSource: fmt::Debug + Send + Sync {
    /// Gets a buffer, failing with a cache miss if it cannot be obtained.
    fn fetch(&self, checksum: Checksum) -> Boxed<Result<Buffer>>;
}

impl BufferSource for BufferCache {
    fn fetch(&self, checksum: Checksum) -> Boxed<Result<Buffer>> {
        let cache = self.clone();
        Box::pin(async move {
            cache
                .get(&checksum, true)
                .await
                .ok_or_else(|| CacheMiss::new(checksum).into())
        })
    }
}

/// An expression is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid expression: {0}")]
pub struct ExpressionError(String);

/// A source checksum, a path into its value, and the celltype to convert the result to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expression {
    checksum: Checksum,
    path: Vec<PathItem>,
    celltype: Celltype,
    target_celltype: Celltype,
    target_subcelltype: Option<String>,
    hash_pattern: Option<HashPattern>,
    target_hash_pattern: Option<HashPattern>,
}

impl Expression {
    /// Creates an expression.
    ///
    /// A `#` hash pattern is the same as none. Hash patterns require the `mixed` celltype, and
    /// a non-empty path requires `mixed`, `plain` or `binary`.
    pub fn new(
        checksum: Checksum,
        path: Vec<PathItem>,
        celltype: Celltype,
        target_celltype: Celltype,
        target_subcelltype: Option<String>,
        hash_pattern: Option<HashPattern>,
        target_hash_pattern: Option<HashPattern>,
    ) -> Result<Self, ExpressionError> {
        let hash_pattern = hash_pattern.filter(|hp| *hp != HashPattern::Hash);
        let target_hash_pattern = target_hash_pattern.filter(|hp| *hp != HashPattern::Hash);
        if hash_pattern.is_some() && celltype != Celltype::Mixed {
            return Err(ExpressionError(format!(
                "hash pattern requires celltype mixed, not {celltype}"
            )));
        }
        if target_hash_pattern.is_some() && target_celltype != Celltype::Mixed {
            return Err(ExpressionError(format!(
                "target hash pattern requires celltype mixed, not {target_celltype}"
            )));
        }
        if !path.is_empty()
            && !matches!(celltype, Celltype::Mixed | Celltype::Plain | Celltype::Binary)
        {
            return Err(ExpressionError(format!(
                "celltype {celltype} does not support paths"
            )));
        }
        Ok(Self {
            checksum,
            path,
            celltype,
            target_celltype,
            target_subcelltype,
            hash_pattern,
            target_hash_pattern,
        })
    }

    /// An expression converting a whole buffer.
    pub fn conversion(checksum: Checksum, celltype: Celltype, target_celltype: Celltype) -> Self {
        Self {
            checksum,
            path: Vec::new(),
            celltype,
            target_celltype,
            target_subcelltype: None,
            hash_pattern: None,
            target_hash_pattern: None,
        }
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn path(&self) -> &[PathItem] {
        &self.path
    }

    pub fn celltype(&self) -> Celltype {
        self.celltype
    }

    pub fn target_celltype(&self) -> Celltype {
        self.target_celltype
    }

    pub fn target_subcelltype(&self) -> Option<&str> {
        self.target_subcelltype.as_deref()
    }

    /// Hash pattern of the source checksum. Only deep checksums have one.
    pub fn hash_pattern(&self) -> Option<&HashPattern> {
        self.hash_pattern.as_ref()
    }

    /// Hash pattern requested for the result.
    pub fn target_hash_pattern(&self) -> Option<&HashPattern> {
        self.target_hash_pattern.as_ref()
    }

    /// Hash pattern of the value found at the path, before applying the target pattern.
    pub fn result_hash_pattern(&self) -> Option<HashPattern> {
        access_hash_pattern(self.hash_pattern.as_ref(), &self.path)
    }

    /// Returns true if the result is the source checksum without any evaluation.
    pub fn is_trivial_for(&self, result: &Checksum) -> bool {
        self.path.is_empty()
            && self.hash_pattern == self.target_hash_pattern
            && *result == self.checksum
    }

    fn to_json(&self) -> Json {
        json!({
            "_checksum": self.checksum.to_hex(),
            "_path": self.path,
            "_celltype": self.celltype,
            "_hash_pattern": self.hash_pattern,
            "_target_celltype": self.target_celltype,
            "_target_subcelltype": self.target_subcelltype,
            "_target_hash_pattern": self.target_hash_pattern,
        })
    }

    /// Checksum identifying the expression.
    pub fn key(&self) -> Checksum {
        Checksum::new(json_dumps(&self.to_json()))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = json_dumps(&self.to_json());
        write!(f, "{}", String::from_utf8_lossy(&text).trim_end())
    }
}

/// Results of evaluated expressions, with the reverse relation.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    inner: Mutex<ExpressionCacheInner>,
}

#[derive(Debug, Default)]
struct ExpressionCacheInner {
    results: HashMap<Expression, Checksum>,
    reverse: HashMap<Checksum, Vec<Expression>>,
}

impl ExpressionCache {
    pub fn get(&self, expression: &Expression) -> Option<Checksum> {
        self.inner.lock().results.get(expression).copied()
    }

    pub fn set(&self, expression: &Expression, result: Checksum) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.results.insert(expression.clone(), result) {
            if old == result {
                return;
            }
            if let Some(list) = inner.reverse.get_mut(&old) {
                list.retain(|e| e != expression);
                if list.is_empty() {
                    inner.reverse.remove(&old);
                }
            }
        }
        inner
            .reverse
            .entry(result)
            .or_default()
            .push(expression.clone());
    }

    /// Expressions known to evaluate to `result`.
    pub fn expressions_for(&self, result: &Checksum) -> Vec<Expression> {
        self.inner
            .lock()
            .reverse
            .get(result)
            .cloned()
            .unwrap_or_default()
    }

    pub fn forget(&self, expression: &Expression) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.results.remove(expression) {
            if let Some(list) = inner.reverse.get_mut(&old) {
                list.retain(|e| e != expression);
                if list.is_empty() {
                    inner.reverse.remove(&old);
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.results.clear();
        inner.reverse.clear();
    }
}

fn deserialize_json(converter: &Converter, buffer: &Buffer, celltype: Celltype) -> Result<Json> {
    let value = converter
        .serializer()
        .deserialize(buffer.bytes(), celltype)?;
    value
        .into_json()
        .ok_or_else(|| {
            ConversionError::new(format!("{} has no JSON form", buffer.checksum())).into()
        })
}

/// Walks a path through a plain value. Anything missing on the way gives `None`.
pub fn get_subpath<'a>(value: &'a Json, path: &[PathItem]) -> Option<&'a Json> {
    let mut current = value;
    for item in path {
        current = match (current, item) {
            (Json::Null, _) => return None,
            (Json::Array(items), PathItem::Index(i)) => items.get(*i)?,
            (Json::Object(map), PathItem::Key(k)) => map.get(k)?,
            _ => return None,
        };
    }
    (!current.is_null()).then_some(current)
}

/// Evaluates the part of the value at `path`, fetching leaf buffers if `value` is a deep
/// structure.
async fn deep_subpath(
    converter: &Converter,
    source: &dyn BufferSource,
    value: &Json,
    hash_pattern: Option<&HashPattern>,
    path: &[PathItem],
) -> Result<Option<Json>> {
    let Some(hash_pattern) = hash_pattern else {
        return Ok(get_subpath(value, path).cloned());
    };
    match access(value, hash_pattern, path)? {
        Access::Missing => Ok(None),
        Access::Checksum {
            checksum,
            remaining,
        } => {
            let buffer = source.fetch(checksum).await?;
            let raw = access_hash_pattern(Some(hash_pattern), &path[..path.len() - remaining.len()])
                .is_some_and(|hp| hp.is_raw());
            let celltype = if raw { Celltype::Text } else { Celltype::Mixed };
            let sub = deserialize_json(converter, &buffer, celltype)?;
            Ok(get_subpath(&sub, &remaining).cloned())
        }
        Access::Sub { structure, pattern } => {
            let mut buffers = HashMap::new();
            for checksum in deep_structure::collect_checksums(&structure, &pattern)? {
                buffers.insert(checksum, source.fetch(checksum).await?);
            }
            let decoded = deep_structure::decode(
                &structure,
                &pattern,
                &buffers,
                converter.serializer().as_ref(),
            )?;
            Ok(Some(decoded))
        }
    }
}

async fn convert_leaf(
    converter: &Converter,
    source: &dyn BufferSource,
    leaf: &Json,
    from: Celltype,
    to: Celltype,
) -> Result<Json> {
    let Some(hex) = leaf.as_str() else {
        return Ok(Json::Null);
    };
    let checksum: Checksum = hex
        .parse()
        .map_err(|_| DeepStructureError::Leaf {
            checksum: Checksum::new(hex),
            message: format!("invalid checksum {hex}"),
        })?;
    let buffer = source.fetch(checksum).await?;
    let result = converter.convert(&checksum, from, to, Some(buffer)).await?;
    Ok(Json::String(result.to_hex()))
}

/// Rewrites a deep structure for another hash pattern without touching the leaf values.
///
/// Returns `None` if the pair of patterns is not supported.
async fn inter_deepcell_conversion(
    converter: &Converter,
    source: &dyn BufferSource,
    value: &Json,
    from: &HashPattern,
    to: &HashPattern,
) -> Result<Option<Json>> {
    use HashPattern as H;
    let items: Vec<(String, Json)> = match value {
        Json::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Json::Array(list) => list
            .iter()
            .enumerate()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        _ => return Ok(None),
    };
    let (leaf_from, leaf_to, as_list) = match (from, to) {
        (H::Dict(a), H::List(b)) if **a == H::Hash && **b == H::Hash => (None, None, true),
        (H::List(a), H::Dict(b)) if **a == H::Hash && **b == H::Hash => (None, None, false),
        (H::Dict(a) | H::List(a), H::Dict(b)) if **a == H::Hash && **b == H::RawHash => {
            (Some(Celltype::Mixed), Some(Celltype::Bytes), false)
        }
        (H::Dict(a), H::Dict(b) | H::List(b)) if **a == H::RawHash && **b == H::Hash => {
            (Some(Celltype::Bytes), Some(Celltype::Mixed), matches!(to, H::List(_)))
        }
        _ => return Ok(None),
    };
    let mut converted = Vec::with_capacity(items.len());
    for (key, leaf) in items {
        let leaf = match (leaf_from, leaf_to) {
            (Some(from), Some(to)) => convert_leaf(converter, source, &leaf, from, to).await?,
            _ => leaf,
        };
        converted.push((key, leaf));
    }
    Ok(Some(if as_list {
        Json::Array(converted.into_iter().map(|(_, v)| v).collect())
    } else {
        Json::Object(converted.into_iter().collect::<Map<_, _>>())
    }))
}

/// Evaluates an expression, returning the checksum of its result.
///
/// `None` means that the path leads nowhere. Input buffers come from `source`; the result
/// buffer is put in the buffer cache.
pub async fn evaluate(
    converter: &Converter,
    source: &dyn BufferSource,
    expression: &Expression,
) -> Result<Option<Checksum>> {
    let mut source_celltype = expression.celltype;
    let mut target_celltype = expression.target_celltype;
    let mut source_checksum = expression.checksum;
    let mut result_hash_pattern = expression.result_hash_pattern();
    let target_hash_pattern = expression.target_hash_pattern.as_ref();
    let mut trivial_path = expression.path.is_empty();

    if result_hash_pattern.as_ref().is_some_and(|hp| !hp.is_leaf())
        && target_celltype == Celltype::Checksum
    {
        // a deep cell read as checksum is its deep structure
        result_hash_pattern = None;
        source_celltype = Celltype::Checksum;
    } else {
        if result_hash_pattern == Some(HashPattern::RawHash) {
            source_celltype = Celltype::Bytes;
        }
        if target_hash_pattern == Some(&HashPattern::RawHash) {
            target_celltype = Celltype::Bytes;
        }
    }
    let (s, t) = canonical(source_celltype, target_celltype);
    if s != t && conversion(s, t) == Conversion::Forbidden {
        return Err(ConversionError::new(format!(
            "Forbidden conversion from {source_celltype} to {target_celltype}"
        ))
        .into());
    }
    let hash_pattern_equivalent =
        source_celltype == target_celltype && result_hash_pattern.as_ref() == target_hash_pattern;
    trace!(%expression, "evaluate");

    if let Some(hash_pattern) = expression
        .hash_pattern
        .as_ref()
        .filter(|_| result_hash_pattern.as_ref().is_some_and(HashPattern::is_leaf))
    {
        let buffer = source.fetch(source_checksum).await?;
        let deep = deserialize_json(converter, &buffer, Celltype::Plain)?;
        match access(&deep, hash_pattern, &expression.path)? {
            Access::Checksum {
                checksum,
                remaining,
            } if remaining.is_empty() => source_checksum = checksum,
            Access::Missing => return Ok(None),
            _ => {
                return Err(DeepStructureError::InvalidPath {
                    path: format!("{:?}", expression.path),
                    pattern: hash_pattern.to_string(),
                }
                .into())
            }
        }
        result_hash_pattern = None;
        trivial_path = true;
    }

    let (result, done) = if source_celltype == Celltype::Checksum
        && target_celltype == Celltype::Checksum
    {
        (source_checksum, true)
    } else if let (Celltype::Checksum, Some(target_hash_pattern)) =
        (source_celltype, target_hash_pattern)
    {
        let buffer = source.fetch(source_checksum).await?;
        let mut deep = deserialize_json(converter, &buffer, Celltype::Checksum)?;
        let mut result = source_checksum;
        if let Some(nested) = deep.as_str() {
            let nested: Checksum = nested.parse().map_err(|_| {
                ConversionError::new(format!("{source_checksum} is not a valid checksum cell"))
            })?;
            let buffer = source.fetch(nested).await?;
            deep = deserialize_json(converter, &buffer, Celltype::Checksum)?;
            result = nested;
        }
        deep_structure::validate(&deep, target_hash_pattern)?;
        (result, true)
    } else if trivial_path && result_hash_pattern.is_none() {
        let result = if source_celltype == target_celltype {
            source_checksum
        } else {
            let buffer = source.fetch(source_checksum).await?;
            converter
                .convert(&source_checksum, source_celltype, target_celltype, Some(buffer))
                .await?
        };
        (result, false)
    } else if trivial_path && hash_pattern_equivalent {
        (source_checksum, true)
    } else {
        let buffer = source.fetch(source_checksum).await?;
        let value = deserialize_json(converter, &buffer, source_celltype)?;
        let mut result_value = None;
        if trivial_path {
            if let (Some(from), Some(to)) =
                (expression.hash_pattern.as_ref(), target_hash_pattern)
            {
                result_value =
                    inter_deepcell_conversion(converter, source, &value, from, to).await?;
            }
        }
        if result_value.is_none() {
            result_value = deep_subpath(
                converter,
                source,
                &value,
                expression.hash_pattern.as_ref(),
                &expression.path,
            )
            .await?;
        }
        let Some(result_value) = result_value else {
            return Ok(None);
        };
        let result = converter
            .store(&Value::Json(result_value), target_celltype)
            .await?;
        (result, true)
    };

    let result = match target_hash_pattern {
        Some(hp) if !done && !hp.is_leaf() => {
            deep_structure::apply_hash_pattern(converter, &result, hp).await?
        }
        _ => result,
    };
    converter
        .buffers()
        .guarantee_buffer_info(&result, target_celltype, None, false)
        .await;
    debug!(%expression, %result, "expression evaluated");
    Ok(Some(result))
}

//! Deep structures: nested collections whose leaves are checksums.
//!
//! A [`HashPattern`] describes which positions of a value are stored as separate buffers. The
//! deep structure mirrors the value down to those positions and holds the hex checksum of
//! each leaf buffer instead of the leaf itself. Values in deep structures are JSON values;
//! array leaves decode to nested lists.
//!
//! Paths passed to [`write`], [`set`] and returned in [`WriteOutcome::Deeper`] address the
//! structure. They are the same as value paths, except below a chunked list, where the
//! structure index is the chunk.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    num::NonZeroUsize,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::trace;

use crate::{
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    convert::Converter,
    error::{CacheMiss, Result},
    serialize::Serializer,
    value::{Dtype, Value, MAGIC_NUMPY, MAGIC_SEAMLESS_MIXED},
};

/// Leaves serialized on the calling task; larger structures are serialized in batches of
/// this size on the blocking pool.
const INLINE_LEAVES: usize = 64;

/// Error in a deep structure or hash pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeepStructureError {
    #[error("\n  Invalid deep structure: {}\n  Hash pattern: {pattern}", truncate_value(.value))]
    Invalid { value: String, pattern: String },
    #[error("Hash pattern {0} is not supported")]
    Unsupported(String),
    #[error("Invalid path {path} for hash pattern {pattern}")]
    InvalidPath { path: String, pattern: String },
    #[error("Buffer for {0} is missing")]
    MissingBuffer(Checksum),
    #[error("Cannot decode {checksum}: {message}")]
    Leaf { checksum: Checksum, message: String },
    #[error("Encoding failed: {0}")]
    Encode(String),
}

impl DeepStructureError {
    fn invalid(value: &Json, pattern: &HashPattern) -> Self {
        Self::Invalid {
            value: value.to_string(),
            pattern: pattern.to_string(),
        }
    }

    fn invalid_path(path: &[PathItem], pattern: &HashPattern) -> Self {
        Self::InvalidPath {
            path: format!("{path:?}"),
            pattern: pattern.to_string(),
        }
    }
}

fn truncate_value(value: &str) -> String {
    let count = value.chars().count();
    if count <= 300 {
        return value.to_string();
    }
    let head: String = value.chars().take(220).collect();
    let tail: String = value.chars().skip(count - 50).collect();
    format!("{head}...{tail}")
}

/// Which positions of a value are stored as separate buffers.
///
/// The JSON forms are `"#"`, `"##"`, `{"*": P}`, `{"!": P}` and `{"!N": "#"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Json", into = "Json")]
pub enum HashPattern {
    /// A checksum of a mixed buffer.
    Hash,
    /// A checksum of a raw buffer: text, or the bytes of a byte string array.
    RawHash,
    /// Every value of a dict follows the inner pattern.
    Dict(Box<HashPattern>),
    /// Every item of a list follows the inner pattern.
    List(Box<HashPattern>),
    /// A list stored as chunks of this many items, each chunk one checksum.
    Chunked(NonZeroUsize),
}

impl HashPattern {
    pub fn dict(inner: HashPattern) -> Self {
        Self::Dict(Box::new(inner))
    }

    pub fn list(inner: HashPattern) -> Self {
        Self::List(Box::new(inner))
    }

    /// Returns true for `#` and `##`.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Hash | Self::RawHash)
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::RawHash)
    }

    /// Returns true if the pattern describes a list.
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_) | Self::Chunked(_))
    }

    fn empty_container(&self) -> Json {
        if self.is_list() {
            Json::Array(Vec::new())
        } else {
            Json::Object(Map::new())
        }
    }
}

impl TryFrom<Json> for HashPattern {
    type Error = DeepStructureError;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        let unsupported = || DeepStructureError::Unsupported(value.to_string());
        match &value {
            Json::String(s) if s == "#" => Ok(Self::Hash),
            Json::String(s) if s == "##" => Ok(Self::RawHash),
            Json::Object(map) if map.len() == 1 => {
                let (key, inner) = map.iter().next().ok_or_else(unsupported)?;
                match key.as_str() {
                    "*" => Ok(Self::dict(HashPattern::try_from(inner.clone())?)),
                    "!" => Ok(Self::list(HashPattern::try_from(inner.clone())?)),
                    _ => {
                        let size = key
                            .strip_prefix('!')
                            .and_then(|n| n.parse::<NonZeroUsize>().ok())
                            .ok_or_else(unsupported)?;
                        if inner != "#" {
                            return Err(unsupported());
                        }
                        Ok(Self::Chunked(size))
                    }
                }
            }
            _ => Err(unsupported()),
        }
    }
}

impl From<HashPattern> for Json {
    fn from(value: HashPattern) -> Self {
        match value {
            HashPattern::Hash => Json::from("#"),
            HashPattern::RawHash => Json::from("##"),
            HashPattern::Dict(inner) => serde_json::json!({ "*": Json::from(*inner) }),
            HashPattern::List(inner) => serde_json::json!({ "!": Json::from(*inner) }),
            HashPattern::Chunked(n) => {
                let mut map = Map::new();
                map.insert(format!("!{n}"), Json::from("#"));
                Json::Object(map)
            }
        }
    }
}

impl fmt::Display for HashPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Json::from(self.clone()))
    }
}

/// One step of a path into a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathItem {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathItem::Index(i) => write!(f, "{i}"),
            PathItem::Key(k) => write!(f, "{k}"),
        }
    }
}

impl From<usize> for PathItem {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

impl From<&str> for PathItem {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<String> for PathItem {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

/// Result of [`access`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// Nothing is stored at the path.
    Missing,
    /// The path leads to a checksum. A non-empty `remaining` path must be applied to its
    /// value.
    Checksum {
        checksum: Checksum,
        remaining: Vec<PathItem>,
    },
    /// The path ends above the leaves.
    Sub { structure: Json, pattern: HashPattern },
}

/// Result of [`write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The leaf was replaced; holds the previous checksum.
    Replaced(Option<Checksum>),
    /// The path ends above the leaves. The caller must turn the checksum into a deep
    /// structure with this pattern and [`set`] it.
    NeedsSubstructure(HashPattern),
    /// The path goes below a leaf. The caller must apply `post_path` to the value of `old`,
    /// and write the checksum of the result at `pre_path`.
    Deeper {
        pre_path: Vec<PathItem>,
        old: Option<Checksum>,
        post_path: Vec<PathItem>,
        raw: bool,
    },
}

fn leaf_checksum(
    value: &Json,
    pattern: &HashPattern,
) -> Result<Option<Checksum>, DeepStructureError> {
    match value {
        Json::Null => Ok(None),
        Json::String(s) => s
            .parse()
            .map(Some)
            .map_err(|_| DeepStructureError::invalid(value, pattern)),
        _ => Err(DeepStructureError::invalid(value, pattern)),
    }
}

/// Checks that a deep structure matches its hash pattern. `null` is allowed anywhere.
pub fn validate(deep: &Json, pattern: &HashPattern) -> Result<(), DeepStructureError> {
    if validate_inner(deep, pattern) {
        Ok(())
    } else {
        Err(DeepStructureError::invalid(deep, pattern))
    }
}

fn validate_inner(deep: &Json, pattern: &HashPattern) -> bool {
    match (deep, pattern) {
        (Json::Null, _) => true,
        (Json::String(s), HashPattern::Hash | HashPattern::RawHash) => {
            s.parse::<Checksum>().is_ok()
        }
        (Json::Object(map), HashPattern::Dict(inner)) => {
            map.values().all(|v| validate_inner(v, inner))
        }
        (Json::Array(items), HashPattern::List(inner)) => {
            items.iter().all(|v| validate_inner(v, inner))
        }
        (Json::Array(items), HashPattern::Chunked(_)) => items
            .iter()
            .all(|v| validate_inner(v, &HashPattern::Hash)),
        _ => false,
    }
}

/// Walks `path` through a deep structure.
pub fn access(
    deep: &Json,
    pattern: &HashPattern,
    path: &[PathItem],
) -> Result<Access, DeepStructureError> {
    validate(deep, pattern)?;
    access_inner(deep, pattern, path)
}

fn access_inner(
    deep: &Json,
    pattern: &HashPattern,
    path: &[PathItem],
) -> Result<Access, DeepStructureError> {
    if deep.is_null() {
        return Ok(Access::Missing);
    }
    if pattern.is_leaf() {
        return Ok(match leaf_checksum(deep, pattern)? {
            Some(checksum) => Access::Checksum {
                checksum,
                remaining: path.to_vec(),
            },
            None => Access::Missing,
        });
    }
    let Some((first, rest)) = path.split_first() else {
        return Ok(Access::Sub {
            structure: deep.clone(),
            pattern: pattern.clone(),
        });
    };
    match (pattern, first) {
        (HashPattern::Dict(inner), PathItem::Key(key)) => {
            let sub = deep.get(key).unwrap_or(&Json::Null);
            access_inner(sub, inner, rest)
        }
        (HashPattern::List(inner), PathItem::Index(index)) => {
            let sub = deep.get(*index).unwrap_or(&Json::Null);
            access_inner(sub, inner, rest)
        }
        (HashPattern::Chunked(size), PathItem::Index(index)) => {
            let chunk = deep.get(index / size.get()).unwrap_or(&Json::Null);
            let mut remaining = vec![PathItem::Index(index % size.get())];
            remaining.extend_from_slice(rest);
            Ok(match leaf_checksum(chunk, &HashPattern::Hash)? {
                Some(checksum) => Access::Checksum {
                    checksum,
                    remaining,
                },
                None => Access::Missing,
            })
        }
        _ => Err(DeepStructureError::invalid_path(path, pattern)),
    }
}

/// The pattern of the sub-value at `path`, if it is a deep structure or a leaf checksum.
pub fn access_hash_pattern(
    pattern: Option<&HashPattern>,
    path: &[PathItem],
) -> Option<HashPattern> {
    let pattern = pattern?;
    let Some((_, rest)) = path.split_first() else {
        return Some(pattern.clone());
    };
    match pattern {
        HashPattern::Dict(inner) | HashPattern::List(inner) => {
            access_hash_pattern(Some(inner), rest)
        }
        _ => None,
    }
}

/// Every leaf checksum of a deep structure.
pub fn collect_checksums(
    deep: &Json,
    pattern: &HashPattern,
) -> Result<BTreeSet<Checksum>, DeepStructureError> {
    Ok(collect_checksums_with_raw(deep, pattern)?
        .into_iter()
        .map(|(checksum, _)| checksum)
        .collect())
}

/// Every leaf checksum of a deep structure, flagged if the leaf is raw.
pub fn collect_checksums_with_raw(
    deep: &Json,
    pattern: &HashPattern,
) -> Result<BTreeSet<(Checksum, bool)>, DeepStructureError> {
    validate(deep, pattern)?;
    let mut found = BTreeSet::new();
    collect_inner(deep, pattern, &mut found)?;
    Ok(found)
}

fn collect_inner(
    deep: &Json,
    pattern: &HashPattern,
    found: &mut BTreeSet<(Checksum, bool)>,
) -> Result<(), DeepStructureError> {
    match (deep, pattern) {
        (Json::Null, _) => {}
        (_, HashPattern::Hash | HashPattern::RawHash) => {
            if let Some(checksum) = leaf_checksum(deep, pattern)? {
                found.insert((checksum, pattern.is_raw()));
            }
        }
        (Json::Object(map), HashPattern::Dict(inner)) => {
            for sub in map.values() {
                collect_inner(sub, inner, found)?;
            }
        }
        (Json::Array(items), HashPattern::List(inner)) => {
            for sub in items {
                collect_inner(sub, inner, found)?;
            }
        }
        (Json::Array(items), HashPattern::Chunked(_)) => {
            for sub in items {
                collect_inner(sub, &HashPattern::Hash, found)?;
            }
        }
        _ => return Err(DeepStructureError::invalid(deep, pattern)),
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Leaf {
    value: Json,
    raw: bool,
}

fn collect_leaves(
    value: &Json,
    pattern: &HashPattern,
    leaves: &mut Vec<Leaf>,
) -> Result<(), DeepStructureError> {
    match (value, pattern) {
        (Json::Null, _) => {}
        (_, HashPattern::Hash | HashPattern::RawHash) => leaves.push(Leaf {
            value: value.clone(),
            raw: pattern.is_raw(),
        }),
        (Json::Object(map), HashPattern::Dict(inner)) => {
            for sub in map.values() {
                collect_leaves(sub, inner, leaves)?;
            }
        }
        (Json::Array(items), HashPattern::List(inner)) => {
            for sub in items {
                collect_leaves(sub, inner, leaves)?;
            }
        }
        (Json::Array(items), HashPattern::Chunked(size)) => {
            leaves.extend(items.chunks(size.get()).map(|chunk| Leaf {
                value: Json::Array(chunk.to_vec()),
                raw: false,
            }));
        }
        _ => return Err(DeepStructureError::invalid(value, pattern)),
    }
    Ok(())
}

/// Rebuilds the shape of `value`, taking leaf checksums in traversal order.
fn build(
    value: &Json,
    pattern: &HashPattern,
    checksums: &mut impl Iterator<Item = Checksum>,
) -> Json {
    match (value, pattern) {
        (Json::Null, _) => Json::Null,
        (_, HashPattern::Hash | HashPattern::RawHash) => checksums
            .next()
            .map(|c| Json::String(c.to_hex()))
            .unwrap_or(Json::Null),
        (Json::Object(map), HashPattern::Dict(inner)) => Json::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), build(v, inner, checksums)))
                .collect(),
        ),
        (Json::Array(items), HashPattern::List(inner)) => {
            Json::Array(items.iter().map(|v| build(v, inner, checksums)).collect())
        }
        (Json::Array(items), HashPattern::Chunked(size)) => Json::Array(
            items
                .chunks(size.get())
                .map(|_| {
                    checksums
                        .next()
                        .map(|c| Json::String(c.to_hex()))
                        .unwrap_or(Json::Null)
                })
                .collect(),
        ),
        _ => Json::Null,
    }
}

fn serialize_leaf(serializer: &dyn Serializer, leaf: &Leaf) -> Result<Buffer> {
    let bytes = match &leaf.value {
        Json::String(s) if leaf.raw => {
            serializer.serialize(&Value::Text(s.clone()), Celltype::Text)?
        }
        other => serializer.serialize(&Value::Json(other.clone()), Celltype::Mixed)?,
    };
    Ok(Buffer::new(bytes))
}

/// Replaces every leaf of `value` by the checksum of its serialized buffer.
///
/// Returns the deep structure and the leaf buffers. Large values are serialized
/// concurrently on the blocking pool.
pub async fn encode(
    value: &Json,
    pattern: &HashPattern,
    serializer: &Arc<dyn Serializer>,
) -> Result<(Json, HashMap<Checksum, Buffer>)> {
    let mut leaves = Vec::new();
    collect_leaves(value, pattern, &mut leaves)?;
    let buffers: Vec<Buffer> = if leaves.len() <= INLINE_LEAVES {
        leaves
            .iter()
            .map(|leaf| serialize_leaf(serializer.as_ref(), leaf))
            .collect::<Result<_>>()?
    } else {
        let batches = leaves.chunks(INLINE_LEAVES).map(|batch| {
            let batch = batch.to_vec();
            let serializer = serializer.clone();
            tokio::task::spawn_blocking(move || {
                batch
                    .iter()
                    .map(|leaf| serialize_leaf(serializer.as_ref(), leaf))
                    .collect::<Result<Vec<_>>>()
            })
        });
        let results = futures_buffered::try_join_all(batches)
            .await
            .map_err(|err| DeepStructureError::Encode(err.to_string()))?;
        let mut buffers = Vec::with_capacity(leaves.len());
        for batch in results {
            buffers.extend(batch?);
        }
        buffers
    };
    trace!(leaves = buffers.len(), %pattern, "encoded deep structure");
    let mut checksums = buffers.iter().map(Buffer::checksum);
    let deep = build(value, pattern, &mut checksums);
    let table = buffers.into_iter().map(|b| (b.checksum(), b)).collect();
    Ok((deep, table))
}

fn decode_leaf(
    serializer: &dyn Serializer,
    checksum: &Checksum,
    buffer: &Buffer,
    raw: bool,
) -> Result<Json, DeepStructureError> {
    let fail = |message: String| DeepStructureError::Leaf {
        checksum: *checksum,
        message,
    };
    if raw && !buffer.starts_with(MAGIC_NUMPY) && !buffer.starts_with(MAGIC_SEAMLESS_MIXED) {
        let text = std::str::from_utf8(buffer)
            .map_err(|_| fail("raw buffer is not text".to_string()))?;
        return Ok(Json::String(text.trim_end_matches('\n').to_string()));
    }
    match serializer
        .deserialize(buffer.bytes(), Celltype::Mixed)
        .map_err(|e| fail(e.to_string()))?
    {
        Value::Json(json) => Ok(json),
        Value::Array(array) => Ok(array.to_json()),
        Value::Text(text) => Ok(Json::String(text)),
        Value::Bytes(_) => Err(fail("raw bytes have no JSON form".to_string())),
    }
}

/// Rebuilds the value of a deep structure from a table holding every leaf buffer.
///
/// Performs no I/O.
pub fn decode(
    deep: &Json,
    pattern: &HashPattern,
    buffers: &HashMap<Checksum, Buffer>,
    serializer: &dyn Serializer,
) -> Result<Json, DeepStructureError> {
    validate(deep, pattern)?;
    let mut values = HashMap::new();
    for (checksum, raw) in collect_checksums_with_raw(deep, pattern)? {
        let buffer = buffers
            .get(&checksum)
            .ok_or(DeepStructureError::MissingBuffer(checksum))?;
        values.insert(checksum, decode_leaf(serializer, &checksum, buffer, raw)?);
    }
    decode_inner(deep, pattern, &values)
}

fn decode_inner(
    deep: &Json,
    pattern: &HashPattern,
    values: &HashMap<Checksum, Json>,
) -> Result<Json, DeepStructureError> {
    let lookup = |leaf: &Json, pattern: &HashPattern| -> Result<Json, DeepStructureError> {
        match leaf_checksum(leaf, pattern)? {
            Some(checksum) => values
                .get(&checksum)
                .cloned()
                .ok_or(DeepStructureError::MissingBuffer(checksum)),
            None => Ok(Json::Null),
        }
    };
    Ok(match (deep, pattern) {
        (Json::Null, _) => Json::Null,
        (_, HashPattern::Hash | HashPattern::RawHash) => lookup(deep, pattern)?,
        (Json::Object(map), HashPattern::Dict(inner)) => Json::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), decode_inner(v, inner, values)?)))
                .collect::<Result<_, DeepStructureError>>()?,
        ),
        (Json::Array(items), HashPattern::List(inner)) => Json::Array(
            items
                .iter()
                .map(|v| decode_inner(v, inner, values))
                .collect::<Result<_, _>>()?,
        ),
        (Json::Array(chunks), HashPattern::Chunked(_)) => {
            let mut items = Vec::new();
            for chunk in chunks {
                match lookup(chunk, &HashPattern::Hash)? {
                    Json::Array(chunk_items) => items.extend(chunk_items),
                    Json::Null => {}
                    other => return Err(DeepStructureError::invalid(&other, pattern)),
                }
            }
            Json::Array(items)
        }
        _ => return Err(DeepStructureError::invalid(deep, pattern)),
    })
}

/// Writes `checksum` into a deep structure at `path`. `None` deletes the leaf.
///
/// Missing containers along the path are created.
pub fn write(
    checksum: Option<Checksum>,
    deep: &mut Json,
    pattern: &HashPattern,
    path: &[PathItem],
) -> Result<WriteOutcome, DeepStructureError> {
    if pattern.is_leaf() {
        let old = leaf_checksum(deep, pattern)?;
        if path.is_empty() {
            *deep = checksum.map(|c| Json::String(c.to_hex())).unwrap_or(Json::Null);
            return Ok(WriteOutcome::Replaced(old));
        }
        return Ok(WriteOutcome::Deeper {
            pre_path: Vec::new(),
            old,
            post_path: path.to_vec(),
            raw: pattern.is_raw(),
        });
    }
    validate(deep, pattern)?;
    let Some((first, rest)) = path.split_first() else {
        return Ok(WriteOutcome::NeedsSubstructure(pattern.clone()));
    };
    if deep.is_null() {
        *deep = pattern.empty_container();
    }
    let (slot, sub_pattern, step): (&mut Json, &HashPattern, PathItem) =
        match (pattern, first, deep) {
            (HashPattern::Dict(inner), PathItem::Key(key), Json::Object(map)) => {
                if rest.is_empty() && inner.is_leaf() {
                    let old = match map.remove(key) {
                        Some(old) => leaf_checksum(&old, inner)?,
                        None => None,
                    };
                    if let Some(checksum) = checksum {
                        map.insert(key.clone(), Json::String(checksum.to_hex()));
                    }
                    return Ok(WriteOutcome::Replaced(old));
                }
                (
                    map.entry(key.clone()).or_insert(Json::Null),
                    inner.as_ref(),
                    first.clone(),
                )
            }
            (HashPattern::List(inner), PathItem::Index(index), Json::Array(items)) => {
                if items.len() <= *index {
                    items.resize(index + 1, Json::Null);
                }
                (&mut items[*index], inner.as_ref(), first.clone())
            }
            (HashPattern::Chunked(size), PathItem::Index(index), Json::Array(items)) => {
                let chunk = index / size.get();
                let old = match items.get(chunk) {
                    Some(old) => leaf_checksum(old, &HashPattern::Hash)?,
                    None => None,
                };
                let mut post_path = vec![PathItem::Index(index % size.get())];
                post_path.extend_from_slice(rest);
                return Ok(WriteOutcome::Deeper {
                    pre_path: vec![PathItem::Index(chunk)],
                    old,
                    post_path,
                    raw: false,
                });
            }
            (pattern, _, _) => return Err(DeepStructureError::invalid_path(path, pattern)),
        };
    let outcome = write(checksum, slot, sub_pattern, rest)?;
    Ok(match outcome {
        WriteOutcome::Deeper {
            mut pre_path,
            old,
            post_path,
            raw,
        } => {
            pre_path.insert(0, step);
            WriteOutcome::Deeper {
                pre_path,
                old,
                post_path,
                raw,
            }
        }
        other => other,
    })
}

/// Puts `substructure` at `path` of a deep structure, returning what was there.
///
/// The caller releases the checksums of the returned substructure.
pub fn set(
    substructure: Json,
    deep: &mut Json,
    pattern: &HashPattern,
    path: &[PathItem],
) -> Result<Json, DeepStructureError> {
    let Some((first, rest)) = path.split_first() else {
        validate(&substructure, pattern)?;
        return Ok(std::mem::replace(deep, substructure));
    };
    if deep.is_null() {
        *deep = pattern.empty_container();
    }
    let (slot, sub_pattern) = match (pattern, first, deep) {
        (HashPattern::Dict(inner), PathItem::Key(key), Json::Object(map)) => {
            (map.entry(key.clone()).or_insert(Json::Null), inner.as_ref())
        }
        (HashPattern::List(inner), PathItem::Index(index), Json::Array(items)) => {
            if items.len() <= *index {
                items.resize(index + 1, Json::Null);
            }
            (&mut items[*index], inner.as_ref())
        }
        (HashPattern::Chunked(_), PathItem::Index(chunk), Json::Array(items)) => {
            if items.len() <= *chunk {
                items.resize(chunk + 1, Json::Null);
            }
            (&mut items[*chunk], &HashPattern::Hash)
        }
        (pattern, _, _) => return Err(DeepStructureError::invalid_path(path, pattern)),
    };
    set(substructure, slot, sub_pattern, rest)
}

/// Serializes a value as a deep structure and caches every leaf buffer.
pub async fn value_to_deep_structure(
    converter: &Converter,
    value: &Json,
    pattern: &HashPattern,
) -> Result<(Json, BTreeSet<Checksum>)> {
    let (deep, buffers) = encode(value, pattern, converter.serializer()).await?;
    let cache = converter.buffers();
    let mut checksums = BTreeSet::new();
    for (checksum, buffer) in buffers {
        cache.cache(&checksum, buffer.clone()).await;
        cache
            .guarantee_buffer_info(&checksum, Celltype::Mixed, Some(&buffer), false)
            .await;
        checksums.insert(checksum);
    }
    Ok((deep, checksums))
}

/// Fetches every leaf of a deep structure, locally or remotely, and decodes it.
pub async fn deep_structure_to_value(
    converter: &Converter,
    deep: &Json,
    pattern: &HashPattern,
) -> Result<Json> {
    let mut buffers = HashMap::new();
    for checksum in collect_checksums(deep, pattern)? {
        let buffer = converter
            .buffers()
            .get(&checksum, true)
            .await
            .ok_or_else(|| CacheMiss::new(checksum))?;
        buffers.insert(checksum, buffer);
    }
    Ok(decode(deep, pattern, &buffers, converter.serializer().as_ref())?)
}

/// Converts the checksum of a mixed value into the checksum of its deep structure.
pub async fn apply_hash_pattern(
    converter: &Converter,
    checksum: &Checksum,
    pattern: &HashPattern,
) -> Result<Checksum> {
    if *pattern == HashPattern::Hash {
        return Ok(*checksum);
    }
    let buffer = converter
        .buffers()
        .get(checksum, true)
        .await
        .ok_or_else(|| CacheMiss::new(*checksum))?;
    if *pattern == HashPattern::RawHash {
        if !buffer.starts_with(MAGIC_NUMPY) {
            return Ok(*checksum);
        }
        return match converter
            .serializer()
            .deserialize(buffer.bytes(), Celltype::Mixed)?
        {
            Value::Array(array) if matches!(array.dtype, Dtype::Bytes(_)) => {
                let raw = Buffer::new(array.data.clone());
                let raw_checksum = raw.checksum();
                converter.buffers().cache(&raw_checksum, raw).await;
                Ok(raw_checksum)
            }
            _ => Ok(*checksum),
        };
    }
    let value = match converter
        .serializer()
        .deserialize(buffer.bytes(), Celltype::Mixed)?
    {
        Value::Json(json) => json,
        Value::Array(array) => array.to_json(),
        _ => return Err(DeepStructureError::Unsupported(pattern.to_string()).into()),
    };
    let (deep, _) = value_to_deep_structure(converter, &value, pattern).await?;
    let deep_checksum = converter.store(&Value::Json(deep), Celltype::Plain).await?;
    converter
        .buffers()
        .guarantee_buffer_info(&deep_checksum, Celltype::Plain, None, false)
        .await;
    Ok(deep_checksum)
}

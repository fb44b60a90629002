//! Structured cell joins.
//!
//! A structured cell value is built from an authoritative base value (`auth`) and inchannels,
//! each one a checksum written at a path. The join dict lists them; its checksum identifies
//! the join, and the join cache maps it to the checksum of the joined value.
//!
//! Before inchannels are applied, entries of the auth value that an inchannel path points to
//! are removed ("relic cleanup"). With a hash pattern the auth value is a deep structure, and
//! cleanup stops at its leaves: a path below a leaf leaves the auth value as it is, since the
//! inchannel rewrites the leaf anyway. Paths into chunked lists are never cleaned up.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, trace};

use crate::{
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    convert::Converter,
    deep_structure::{self, access_hash_pattern, HashPattern, PathItem, WriteOutcome},
    error::{ConversionError, Result},
    expression::{get_subpath, BufferSource},
    serialize::json_dumps,
    value::Value,
};

/// Description of a structured cell join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDict {
    /// Inchannel checksums keyed by their JSON encoded path, such as `["a", 0]`.
    #[serde(default)]
    pub inchannels: BTreeMap<String, Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_pattern: Option<HashPattern>,
}

impl JoinDict {
    pub fn with_inchannel(mut self, path: &[PathItem], checksum: Checksum) -> Self {
        self.inchannels.insert(encode_path(path), checksum);
        self
    }

    pub fn with_auth(mut self, auth: Checksum) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_hash_pattern(mut self, hash_pattern: HashPattern) -> Self {
        self.hash_pattern = Some(hash_pattern);
        self
    }

    /// Parses a join dict buffer.
    pub fn from_buffer(buffer: &Buffer) -> Result<Self> {
        serde_json::from_slice(buffer.bytes()).map_err(|err| {
            ConversionError::new(format!("{} is not a join dict: {err}", buffer.checksum())).into()
        })
    }

    /// The plain buffer of the join dict.
    pub fn to_buffer(&self) -> Buffer {
        let json = serde_json::to_value(self).unwrap_or(Json::Null);
        Buffer::new(json_dumps(&json))
    }

    /// Checksum identifying the join.
    pub fn checksum(&self) -> Checksum {
        self.to_buffer().checksum()
    }

    /// Inchannels with decoded paths, in path order.
    pub fn paths(&self) -> Result<Vec<(Vec<PathItem>, Checksum)>> {
        let mut paths = self
            .inchannels
            .iter()
            .map(|(key, checksum)| {
                let path: Vec<PathItem> = serde_json::from_str(key).map_err(|err| {
                    ConversionError::new(format!("invalid inchannel path {key}: {err}"))
                })?;
                Ok((path, *checksum))
            })
            .collect::<Result<Vec<_>>>()?;
        paths.sort();
        Ok(paths)
    }
}

fn encode_path(path: &[PathItem]) -> String {
    serde_json::to_string(path).unwrap_or_else(|_| "[]".to_string())
}

/// What relic cleanup did to the auth value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCleanup {
    Unchanged,
    /// An inchannel covers the whole value.
    Removed,
    /// Entries were removed; the cleaned value has this checksum.
    Replaced(Checksum),
}

/// Result of [`evaluate_join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub result: Checksum,
    pub auth: AuthCleanup,
}

/// Join results, with the reverse relation.
#[derive(Debug, Default)]
pub struct JoinCache {
    inner: Mutex<JoinCacheInner>,
}

#[derive(Debug, Default)]
struct JoinCacheInner {
    results: HashMap<Checksum, Checksum>,
    dicts: HashMap<Checksum, JoinDict>,
    reverse: HashMap<Checksum, Vec<Checksum>>,
}

impl JoinCache {
    pub fn get(&self, join: &JoinDict) -> Option<Checksum> {
        self.inner.lock().results.get(&join.checksum()).copied()
    }

    pub fn set(&self, join: &JoinDict, result: Checksum) {
        let key = join.checksum();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.results.insert(key, result) {
            if let Some(keys) = inner.reverse.get_mut(&old) {
                keys.retain(|k| *k != key);
                if keys.is_empty() {
                    inner.reverse.remove(&old);
                }
            }
        }
        inner.dicts.insert(key, join.clone());
        let keys = inner.reverse.entry(result).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    /// Join dicts known to evaluate to `result`.
    pub fn joins_for(&self, result: &Checksum) -> Vec<JoinDict> {
        let inner = self.inner.lock();
        inner
            .reverse
            .get(result)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.dicts.get(key).cloned())
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.results.clear();
        inner.dicts.clear();
        inner.reverse.clear();
    }
}

/// Removes the entry at `path`. Returns true if something was removed.
pub fn path_cleanup(
    value: &mut Json,
    path: &[PathItem],
    hash_pattern: Option<&HashPattern>,
) -> bool {
    let Some((head, rest)) = path.split_first() else {
        return false;
    };
    let inner = match hash_pattern {
        None => None,
        Some(HashPattern::Dict(inner) | HashPattern::List(inner)) => Some(inner.as_ref()),
        Some(HashPattern::Hash | HashPattern::RawHash | HashPattern::Chunked(_)) => return false,
    };
    match (value, head) {
        (Json::Array(items), PathItem::Index(i)) => {
            if *i >= items.len() {
                return false;
            }
            if rest.is_empty() {
                items.remove(*i);
                return true;
            }
            path_cleanup(&mut items[*i], rest, inner)
        }
        (Json::Object(map), PathItem::Key(k)) => {
            if rest.is_empty() {
                return map.remove(k).is_some();
            }
            match map.get_mut(k) {
                Some(sub) => path_cleanup(sub, rest, inner),
                None => false,
            }
        }
        _ => false,
    }
}

fn container_for(item: &PathItem) -> Json {
    match item {
        PathItem::Index(_) => Json::Array(Vec::new()),
        PathItem::Key(_) => Json::Object(Map::new()),
    }
}

/// Writes `subvalue` at `path` of a plain value, creating containers on the way.
///
/// A null `subvalue` removes the entry.
pub fn set_subpath(value: &mut Json, path: &[PathItem], subvalue: Json) {
    let Some((head, rest)) = path.split_first() else {
        *value = subvalue;
        return;
    };
    let fits = matches!(
        (&*value, head),
        (Json::Array(_), PathItem::Index(_)) | (Json::Object(_), PathItem::Key(_))
    );
    if !fits {
        *value = container_for(head);
    }
    match (value, head) {
        (Json::Array(items), PathItem::Index(i)) => {
            if rest.is_empty() && subvalue.is_null() {
                if *i + 1 == items.len() {
                    items.pop();
                } else if *i < items.len() {
                    items[*i] = Json::Null;
                }
                return;
            }
            if items.len() <= *i {
                items.resize(*i + 1, Json::Null);
            }
            if rest.is_empty() {
                items[*i] = subvalue;
            } else {
                set_subpath(&mut items[*i], rest, subvalue);
            }
        }
        (Json::Object(map), PathItem::Key(k)) => {
            if rest.is_empty() {
                if subvalue.is_null() {
                    map.remove(k);
                } else {
                    map.insert(k.clone(), subvalue);
                }
                return;
            }
            let sub = map.entry(k.clone()).or_insert_with(|| container_for(&rest[0]));
            set_subpath(sub, rest, subvalue);
        }
        _ => {}
    }
}

fn leaf_json(converter: &Converter, buffer: &Buffer, raw: bool) -> Result<Json> {
    let celltype = if raw { Celltype::Text } else { Celltype::Mixed };
    let value = converter.serializer().deserialize(buffer.bytes(), celltype)?;
    value
        .into_json()
        .ok_or_else(|| {
            ConversionError::new(format!("{} has no JSON form", buffer.checksum())).into()
        })
}

/// Writes an inchannel checksum into a (deep) value.
///
/// The checksum is already encoded with the sub-pattern at `path`. `sub_buffer` may be
/// `None` only if the path reaches a leaf of the hash pattern.
async fn set_subpath_checksum(
    converter: &Converter,
    source: &dyn BufferSource,
    value: &mut Json,
    hash_pattern: Option<&HashPattern>,
    path: &[PathItem],
    checksum: Checksum,
    sub_buffer: Option<Buffer>,
) -> Result<()> {
    let sub_json = |raw: bool| -> Result<Json> {
        match &sub_buffer {
            Some(buffer) => leaf_json(converter, buffer, raw),
            None => Err(ConversionError::new(format!("no buffer for inchannel {checksum}")).into()),
        }
    };
    let hash_pattern = match hash_pattern {
        Some(hp) if !hp.is_leaf() => hp,
        hp => {
            let raw = hp.is_some_and(HashPattern::is_raw);
            set_subpath(value, path, sub_json(raw)?);
            return Ok(());
        }
    };
    match deep_structure::write(Some(checksum), value, hash_pattern, path)? {
        WriteOutcome::Replaced(_) => {}
        WriteOutcome::NeedsSubstructure(sub_pattern) => {
            let sub_structure = sub_json(false)?;
            deep_structure::set(sub_structure, value, &sub_pattern, path)?;
        }
        WriteOutcome::Deeper {
            pre_path,
            old,
            post_path,
            raw,
        } => {
            let mut leaf = match old {
                Some(old) => leaf_json(converter, &source.fetch(old).await?, raw)?,
                None => Json::Null,
            };
            set_subpath(&mut leaf, &post_path, sub_json(false)?);
            let celltype = if raw { Celltype::Text } else { Celltype::Mixed };
            let new_leaf = converter.store(&Value::Json(leaf), celltype).await?;
            deep_structure::write(Some(new_leaf), value, hash_pattern, &pre_path)?;
        }
    }
    Ok(())
}

/// Joins the auth value and the inchannels of a structured cell.
///
/// Buffers come from `source`. The joined value is stored in the buffer cache as `mixed`.
pub async fn evaluate_join(
    converter: &Converter,
    source: &dyn BufferSource,
    join: &JoinDict,
) -> Result<JoinOutcome> {
    let paths = join.paths()?;
    let hash_pattern = join
        .hash_pattern
        .as_ref()
        .filter(|hp| **hp != HashPattern::Hash);
    if join.auth.is_none() && hash_pattern.is_none() {
        if let [(path, checksum)] = paths.as_slice() {
            if path.is_empty() {
                return Ok(JoinOutcome {
                    result: *checksum,
                    auth: AuthCleanup::Unchanged,
                });
            }
        }
    }

    let mut auth = AuthCleanup::Unchanged;
    let mut value = None;
    if let Some(auth_checksum) = join.auth {
        let buffer = source.fetch(auth_checksum).await?;
        let mut data = Some(leaf_json(converter, &buffer, false)?);
        let mut cleaned = false;
        for (path, _) in &paths {
            if path.is_empty() {
                data = None;
                cleaned = true;
                break;
            }
            if let Some(data) = data.as_mut() {
                cleaned |= path_cleanup(data, path, hash_pattern);
            }
        }
        if cleaned {
            auth = match &data {
                None => AuthCleanup::Removed,
                Some(data) => AuthCleanup::Replaced(
                    converter
                        .store(&Value::Json(data.clone()), Celltype::Mixed)
                        .await?,
                ),
            };
            trace!(?auth, "auth relic cleanup");
        }
        value = data.filter(|d| !d.is_null());
    }

    let mut value = value.unwrap_or_else(|| {
        let list = matches!(
            paths.first(),
            Some((p, _)) if matches!(p.first(), Some(PathItem::Index(_)))
        ) || hash_pattern.is_some_and(HashPattern::is_list);
        if list {
            Json::Array(Vec::new())
        } else {
            Json::Object(Map::new())
        }
    });

    for (path, checksum) in &paths {
        let leaf = hash_pattern.is_some()
            && access_hash_pattern(hash_pattern, path).is_some_and(|hp| hp.is_leaf());
        let sub_buffer = if leaf {
            None
        } else {
            Some(source.fetch(*checksum).await?)
        };
        set_subpath_checksum(
            converter,
            source,
            &mut value,
            hash_pattern,
            path,
            *checksum,
            sub_buffer,
        )
        .await?;
    }

    let result = converter.store(&Value::Json(value), Celltype::Mixed).await?;
    converter
        .buffers()
        .guarantee_buffer_info(&result, Celltype::Mixed, None, false)
        .await;
    debug!(join = %join.checksum(), %result, "join evaluated");
    Ok(JoinOutcome { result, auth })
}

/// Reads the value of a join result, following a hash pattern.
pub async fn join_value(
    converter: &Converter,
    source: &dyn BufferSource,
    result: &Checksum,
    hash_pattern: Option<&HashPattern>,
    path: &[PathItem],
) -> Result<Option<Json>> {
    let buffer = source.fetch(*result).await?;
    let value = leaf_json(converter, &buffer, false)?;
    let value = match hash_pattern {
        Some(hp) => deep_structure::deep_structure_to_value(converter, &value, hp).await?,
        None => value,
    };
    Ok(get_subpath(&value, path).cloned())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::test_utils::test_converter;

    fn p(items: &[PathItem]) -> Vec<PathItem> {
        items.to_vec()
    }

    #[test]
    fn join_dict_format() {
        let a = Checksum::new(b"1\n");
        let join = JoinDict::default()
            .with_inchannel(&p(&["x".into(), PathItem::Index(0)]), a)
            .with_inchannel(&[], a);
        let json = serde_json::to_value(&join).unwrap();
        assert_eq!(
            json,
            json!({"inchannels": {"[\"x\",0]": a.to_hex(), "[]": a.to_hex()}})
        );
        let paths = join.paths().unwrap();
        assert_eq!(paths[0].0, Vec::<PathItem>::new());
        let back = JoinDict::from_buffer(&join.to_buffer()).unwrap();
        assert_eq!(back, join);
        assert_eq!(back.checksum(), join.checksum());
    }

    #[test]
    fn subpaths_are_written() {
        let mut value = json!({});
        set_subpath(&mut value, &p(&["a".into(), PathItem::Index(1)]), json!(5));
        assert_eq!(value, json!({"a": [null, 5]}));
        set_subpath(&mut value, &p(&["a".into(), PathItem::Index(1)]), Json::Null);
        assert_eq!(value, json!({"a": [null]}));
        set_subpath(&mut value, &p(&["a".into()]), json!(3));
        set_subpath(&mut value, &p(&["a".into(), "b".into()]), json!(4));
        assert_eq!(value, json!({"a": {"b": 4}}));
        set_subpath(&mut value, &p(&["a".into()]), Json::Null);
        assert_eq!(value, json!({}));
    }

    #[test]
    fn relic_cleanup_plain() {
        let mut auth = json!({"a": 1, "b": {"c": 2, "d": 3}, "l": [1, 2, 3]});
        assert!(path_cleanup(&mut auth, &p(&["a".into()]), None));
        assert!(path_cleanup(&mut auth, &p(&["b".into(), "c".into()]), None));
        assert!(path_cleanup(&mut auth, &p(&["l".into(), PathItem::Index(0)]), None));
        assert!(!path_cleanup(&mut auth, &p(&["zz".into()]), None));
        assert!(!path_cleanup(&mut auth, &p(&["l".into(), PathItem::Index(9)]), None));
        assert!(!path_cleanup(&mut auth, &p(&["l".into(), "k".into()]), None));
        assert_eq!(auth, json!({"b": {"d": 3}, "l": [2, 3]}));
    }

    #[test]
    fn relic_cleanup_stops_at_leaves() {
        let a = Checksum::new(b"1\n").to_hex();
        let b = Checksum::new(b"2\n").to_hex();
        let pattern = HashPattern::dict(HashPattern::Hash);
        let mut auth = json!({"x": a, "y": b});
        assert!(!path_cleanup(&mut auth, &p(&["x".into(), "sub".into()]), Some(&pattern)));
        assert_eq!(auth, json!({"x": a, "y": b}));
        assert!(path_cleanup(&mut auth, &p(&["x".into()]), Some(&pattern)));
        assert_eq!(auth, json!({"y": b}));

        let nested = HashPattern::dict(HashPattern::dict(HashPattern::Hash));
        let mut auth = json!({"k": {"x": a, "y": b}});
        assert!(path_cleanup(&mut auth, &p(&["k".into(), "y".into()]), Some(&nested)));
        let below_leaf = p(&["k".into(), "x".into(), PathItem::Index(0)]);
        assert!(!path_cleanup(&mut auth, &below_leaf, Some(&nested)));
        assert_eq!(auth, json!({"k": {"x": a}}));

        let chunked = HashPattern::Chunked(std::num::NonZeroUsize::new(2).unwrap());
        let mut auth = json!([a, b]);
        assert!(!path_cleanup(&mut auth, &p(&[PathItem::Index(1)]), Some(&chunked)));
        assert_eq!(auth, json!([a, b]));
    }

    #[tokio::test]
    async fn join_with_auth_and_inchannels() -> anyhow::Result<()> {
        let conv = test_converter();
        let cache = conv.buffers().clone();
        let auth = conv
            .store(&Value::Json(json!({"a": 1, "b": 2, "c": {"d": 4}})), Celltype::Mixed)
            .await?;
        let ten = conv.store(&Value::Json(json!(10)), Celltype::Mixed).await?;
        let join = JoinDict::default()
            .with_auth(auth)
            .with_inchannel(&p(&["b".into()]), ten)
            .with_inchannel(&p(&["c".into(), "e".into()]), ten);
        let outcome = evaluate_join(&conv, &cache, &join).await?;
        let AuthCleanup::Replaced(cleaned) = outcome.auth else {
            panic!("auth was not cleaned: {:?}", outcome.auth);
        };
        let cleaned = cache.get(&cleaned, false).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<Json>(cleaned.bytes())?,
            json!({"a": 1, "c": {"d": 4}})
        );
        let joined = join_value(&conv, &cache, &outcome.result, None, &[]).await?;
        assert_eq!(joined, Some(json!({"a": 1, "b": 10, "c": {"d": 4, "e": 10}})));
        Ok(())
    }

    #[tokio::test]
    async fn whole_value_inchannel() -> anyhow::Result<()> {
        let conv = test_converter();
        let cache = conv.buffers().clone();
        let value = conv.store(&Value::Json(json!([1, 2])), Celltype::Mixed).await?;
        let join = JoinDict::default().with_inchannel(&[], value);
        let outcome = evaluate_join(&conv, &cache, &join).await?;
        assert_eq!(outcome.result, value);
        assert_eq!(outcome.auth, AuthCleanup::Unchanged);
        Ok(())
    }

    #[tokio::test]
    async fn whole_value_inchannel_removes_auth() -> anyhow::Result<()> {
        let conv = test_converter();
        let cache = conv.buffers().clone();
        let auth = conv.store(&Value::Json(json!({"a": 1})), Celltype::Mixed).await?;
        let value = conv.store(&Value::Json(json!({"z": 0})), Celltype::Mixed).await?;
        let join = JoinDict::default()
            .with_auth(auth)
            .with_inchannel(&[], value);
        let outcome = evaluate_join(&conv, &cache, &join).await?;
        assert_eq!(outcome.auth, AuthCleanup::Removed);
        let joined = join_value(&conv, &cache, &outcome.result, None, &[]).await?;
        assert_eq!(joined, Some(json!({"z": 0})));
        Ok(())
    }

    #[tokio::test]
    async fn deep_join() -> anyhow::Result<()> {
        let conv = test_converter();
        let cache = conv.buffers().clone();
        let pattern = HashPattern::dict(HashPattern::Hash);
        let (auth_deep, _) =
            deep_structure::value_to_deep_structure(&conv, &json!({"a": 1, "b": [1, 2]}), &pattern)
                .await?;
        let auth = conv.store(&Value::Json(auth_deep), Celltype::Mixed).await?;
        let seven = conv.store(&Value::Json(json!(7)), Celltype::Mixed).await?;
        let join = JoinDict::default()
            .with_auth(auth)
            .with_hash_pattern(pattern.clone())
            .with_inchannel(&p(&["c".into()]), seven)
            .with_inchannel(&p(&["b".into(), PathItem::Index(0)]), seven);
        let outcome = evaluate_join(&conv, &cache, &join).await?;
        assert_eq!(outcome.auth, AuthCleanup::Unchanged);
        let joined = join_value(&conv, &cache, &outcome.result, Some(&pattern), &[]).await?;
        assert_eq!(joined, Some(json!({"a": 1, "b": [7, 2], "c": 7})));
        Ok(())
    }

    #[test]
    fn join_cache_reverse() {
        let cache = JoinCache::default();
        let r = Checksum::new(b"r");
        let join = JoinDict::default().with_inchannel(&[], Checksum::new(b"x"));
        cache.set(&join, r);
        assert_eq!(cache.get(&join), Some(r));
        assert_eq!(cache.joins_for(&r), vec![join]);
        cache.clear();
        assert!(cache.joins_for(&r).is_empty());
    }
}

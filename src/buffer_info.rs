//! Per checksum metadata about buffers.
//!
//! A [`BufferInfo`] records what is known about the buffer behind a checksum: its length,
//! which format family it belongs to, and the checksums of known one-step conversions.
//! Records never expire. They can be mirrored to the database, where the database copy wins
//! on conflict.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    celltype::Celltype,
    checksum::Checksum,
    conversion::{canonical, conversion, Conversion, Outcome},
    database::Database,
};

/// The JSON type of a buffer's value.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Dict,
    List,
    Str,
    Int,
    Float,
    Bool,
}

impl JsonType {
    pub fn of(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(_) => Some(JsonType::Dict),
            serde_json::Value::Array(_) => Some(JsonType::List),
            serde_json::Value::String(_) => Some(JsonType::Str),
            serde_json::Value::Number(n) if n.is_f64() => Some(JsonType::Float),
            serde_json::Value::Number(_) => Some(JsonType::Int),
            serde_json::Value::Bool(_) => Some(JsonType::Bool),
            serde_json::Value::Null => None,
        }
    }

    fn matches(&self, celltype: Celltype) -> bool {
        matches!(
            (self, celltype),
            (JsonType::Str, Celltype::Str)
                | (JsonType::Int, Celltype::Int)
                | (JsonType::Float, Celltype::Float)
                | (JsonType::Bool, Celltype::Bool)
        )
    }
}

/// What is known about a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_utf8: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_json: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_type: Option<JsonType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_json_numeric_array: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_json_numeric_scalar: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_numpy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_seamless_mixed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str2text: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text2str: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary2bytes: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes2binary: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary2json: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json2binary: Option<Checksum>,
}

/// Name of a recorded one-step conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConversionField {
    Str2text,
    Text2str,
    Binary2bytes,
    Bytes2binary,
    Binary2json,
    Json2binary,
}

impl ConversionField {
    /// The field recording the conversion from `source` to `target`, if any.
    pub fn for_conversion(source: Celltype, target: Celltype) -> Option<Self> {
        use Celltype as C;
        match (source, target) {
            (C::Str, C::Text) => Some(Self::Str2text),
            (C::Text, C::Str) => Some(Self::Text2str),
            (C::Binary, C::Bytes) => Some(Self::Binary2bytes),
            (C::Bytes, C::Binary) => Some(Self::Bytes2binary),
            (C::Binary, C::Plain) => Some(Self::Binary2json),
            (C::Plain, C::Binary) => Some(Self::Json2binary),
            _ => None,
        }
    }

    /// The field of the target recording the way back.
    pub fn reverse(&self) -> Self {
        match self {
            Self::Str2text => Self::Text2str,
            Self::Text2str => Self::Str2text,
            Self::Binary2bytes => Self::Bytes2binary,
            Self::Bytes2binary => Self::Binary2bytes,
            Self::Binary2json => Self::Json2binary,
            Self::Json2binary => Self::Binary2json,
        }
    }

    /// Source and target celltype, with `json` meaning `plain`.
    pub fn celltypes(&self) -> (Celltype, Celltype) {
        use Celltype as C;
        match self {
            Self::Str2text => (C::Str, C::Text),
            Self::Text2str => (C::Text, C::Str),
            Self::Binary2bytes => (C::Binary, C::Bytes),
            Self::Bytes2binary => (C::Bytes, C::Binary),
            Self::Binary2json => (C::Binary, C::Plain),
            Self::Json2binary => (C::Plain, C::Binary),
        }
    }

    pub fn all() -> [Self; 6] {
        [
            Self::Str2text,
            Self::Text2str,
            Self::Binary2bytes,
            Self::Bytes2binary,
            Self::Binary2json,
            Self::Json2binary,
        ]
    }
}

/// A single piece of information to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Length(u64),
    IsUtf8(bool),
    IsJson(bool),
    JsonType(JsonType),
    IsJsonNumericArray(bool),
    IsJsonNumericScalar(bool),
    IsNumpy(bool),
    Dtype(String),
    Shape(Vec<usize>),
    IsSeamlessMixed(bool),
    Conversion(ConversionField, Checksum),
}

/// Flag names used for the co- and anti-occurrence rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    IsUtf8,
    IsJson,
    IsJsonNumericArray,
    IsJsonNumericScalar,
    IsNumpy,
    IsSeamlessMixed,
}

impl BufferInfo {
    pub fn get_conversion(&self, field: ConversionField) -> Option<Checksum> {
        match field {
            ConversionField::Str2text => self.str2text,
            ConversionField::Text2str => self.text2str,
            ConversionField::Binary2bytes => self.binary2bytes,
            ConversionField::Bytes2binary => self.bytes2binary,
            ConversionField::Binary2json => self.binary2json,
            ConversionField::Json2binary => self.json2binary,
        }
    }

    fn conversion_mut(&mut self, field: ConversionField) -> &mut Option<Checksum> {
        match field {
            ConversionField::Str2text => &mut self.str2text,
            ConversionField::Text2str => &mut self.text2str,
            ConversionField::Binary2bytes => &mut self.binary2bytes,
            ConversionField::Bytes2binary => &mut self.bytes2binary,
            ConversionField::Binary2json => &mut self.binary2json,
            ConversionField::Json2binary => &mut self.json2binary,
        }
    }

    fn flag_mut(&mut self, flag: Flag) -> &mut Option<bool> {
        match flag {
            Flag::IsUtf8 => &mut self.is_utf8,
            Flag::IsJson => &mut self.is_json,
            Flag::IsJsonNumericArray => &mut self.is_json_numeric_array,
            Flag::IsJsonNumericScalar => &mut self.is_json_numeric_scalar,
            Flag::IsNumpy => &mut self.is_numpy,
            Flag::IsSeamlessMixed => &mut self.is_seamless_mixed,
        }
    }

    /// Sets a field and applies the implied flags. Returns true if anything changed.
    pub fn apply(&mut self, field: Field) -> bool {
        let before = self.clone();
        match field {
            Field::Length(l) => self.length = Some(l),
            Field::IsUtf8(v) => self.set_flag(Flag::IsUtf8, v),
            Field::IsJson(v) => self.set_flag(Flag::IsJson, v),
            Field::IsJsonNumericArray(v) => self.set_flag(Flag::IsJsonNumericArray, v),
            Field::IsJsonNumericScalar(v) => self.set_flag(Flag::IsJsonNumericScalar, v),
            Field::IsNumpy(v) => self.set_flag(Flag::IsNumpy, v),
            Field::IsSeamlessMixed(v) => self.set_flag(Flag::IsSeamlessMixed, v),
            Field::JsonType(t) => {
                self.json_type = Some(t);
                self.set_flag(Flag::IsJson, true);
            }
            Field::Dtype(d) => {
                self.dtype = Some(d);
                self.set_flag(Flag::IsNumpy, true);
            }
            Field::Shape(s) => {
                self.shape = Some(s);
                self.set_flag(Flag::IsNumpy, true);
            }
            Field::Conversion(field, checksum) => *self.conversion_mut(field) = Some(checksum),
        }
        *self != before
    }

    fn set_flag(&mut self, flag: Flag, value: bool) {
        *self.flag_mut(flag) = Some(value);
        if value {
            for implied in co_flags(flag) {
                self.set_flag(*implied, true);
            }
            for excluded in anti_flags(flag) {
                *self.flag_mut(*excluded) = Some(false);
            }
        } else {
            // whatever implies this flag cannot hold either
            for other in [
                Flag::IsUtf8,
                Flag::IsJson,
                Flag::IsJsonNumericArray,
                Flag::IsJsonNumericScalar,
                Flag::IsNumpy,
                Flag::IsSeamlessMixed,
            ] {
                if co_flags(other).contains(&flag) {
                    self.set_flag(other, false);
                }
            }
        }
    }

    /// Merges `other` into self, with `other` winning on conflict.
    pub fn merge_from(&mut self, other: &BufferInfo) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        take!(
            length,
            is_utf8,
            is_json,
            json_type,
            is_json_numeric_array,
            is_json_numeric_scalar,
            is_numpy,
            dtype,
            shape,
            is_seamless_mixed,
            str2text,
            text2str,
            binary2bytes,
            bytes2binary,
            binary2json,
            json2binary
        );
    }
}

fn co_flags(flag: Flag) -> &'static [Flag] {
    match flag {
        Flag::IsJson => &[Flag::IsUtf8],
        Flag::IsJsonNumericArray | Flag::IsJsonNumericScalar => &[Flag::IsJson],
        _ => &[],
    }
}

fn anti_flags(flag: Flag) -> &'static [Flag] {
    match flag {
        Flag::IsJson => &[Flag::IsNumpy, Flag::IsSeamlessMixed],
        Flag::IsNumpy => &[Flag::IsJson, Flag::IsSeamlessMixed],
        Flag::IsSeamlessMixed => &[Flag::IsJson, Flag::IsNumpy],
        _ => &[],
    }
}

/// The buffer info contradicts a celltype.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("buffer info is incompatible with celltype {0}")]
pub struct IncompatibleBufferInfo(pub Celltype);

/// Checks that the recorded info does not rule out `celltype`.
pub fn validate(info: &BufferInfo, celltype: Celltype) -> Result<(), IncompatibleBufferInfo> {
    use Celltype as C;
    let fail = Err(IncompatibleBufferInfo(celltype));
    match celltype {
        C::Bytes => {}
        C::Mixed => {
            if info.is_json == Some(false)
                && info.is_numpy == Some(false)
                && info.is_seamless_mixed == Some(false)
            {
                return fail;
            }
        }
        C::Binary => {
            if info.is_json == Some(true) || info.is_seamless_mixed == Some(true) {
                return fail;
            }
        }
        C::Plain | C::Str | C::Int | C::Float | C::Bool => {
            if info.is_utf8 == Some(false)
                || info.is_numpy == Some(true)
                || info.is_seamless_mixed == Some(true)
            {
                return fail;
            }
            if celltype != C::Plain
                && matches!(info.json_type, Some(JsonType::Dict | JsonType::List))
            {
                return fail;
            }
        }
        C::Text | C::Cson | C::Yaml | C::Ipython | C::Python | C::Checksum => {
            if info.is_utf8 == Some(false) {
                return fail;
            }
            if celltype == C::Checksum
                && matches!(
                    info.json_type,
                    Some(
                        JsonType::Dict
                            | JsonType::List
                            | JsonType::Int
                            | JsonType::Float
                            | JsonType::Bool
                    )
                )
            {
                return fail;
            }
        }
    }
    Ok(())
}

/// Returns true if the info shows the buffer is surely valid for `celltype`.
pub fn verify(info: &BufferInfo, celltype: Celltype) -> bool {
    use Celltype as C;
    if validate(info, celltype).is_err() {
        return false;
    }
    match celltype {
        C::Bytes | C::Checksum => true,
        C::Mixed => {
            info.is_json == Some(true)
                || info.is_numpy == Some(true)
                || info.is_seamless_mixed == Some(true)
        }
        C::Binary => info.is_numpy == Some(true),
        C::Plain => info.is_json == Some(true),
        C::Str | C::Int | C::Float | C::Bool => {
            info.json_type.is_some_and(|t| t.matches(celltype))
        }
        C::Text | C::Cson | C::Yaml | C::Ipython | C::Python => info.is_utf8 == Some(true),
    }
}

/// Tries to settle a single conversion step from the info alone.
///
/// An error means the info rules out `source` for this buffer altogether.
pub fn conversion_from_buffer_info(
    info: &BufferInfo,
    source: Celltype,
    target: Celltype,
) -> Result<Outcome, IncompatibleBufferInfo> {
    use Celltype as C;
    validate(info, source)?;
    let (source, target) = canonical(source, target);
    let outcome = match conversion(source, target) {
        Conversion::Identity | Conversion::Trivial => Outcome::Unchanged,
        Conversion::Forbidden => Outcome::Impossible,
        Conversion::Value => match (source, target) {
            (C::Binary, C::Plain) => match (info.binary2json, info.is_json) {
                (Some(c), _) => Outcome::Converted(c),
                (None, Some(true)) => Outcome::Pending,
                (None, Some(false)) => Outcome::Impossible,
                (None, None) => Outcome::Undetermined,
            },
            (C::Plain, C::Binary) => match (info.json2binary, info.json_type) {
                (Some(c), _) => Outcome::Converted(c),
                (None, Some(JsonType::Dict)) => Outcome::Impossible,
                (None, Some(JsonType::Int | JsonType::Float | JsonType::Bool)) => {
                    Outcome::Pending
                }
                _ => Outcome::Undetermined,
            },
            _ => Outcome::Undetermined,
        },
        Conversion::Chain(_) | Conversion::Equivalent(..) => Outcome::Undetermined,
        Conversion::Reinterpret => {
            if validate(info, target).is_err() {
                return Ok(Outcome::Impossible);
            }
            let known = match target {
                C::Bytes => true,
                C::Mixed => {
                    info.is_json == Some(true)
                        || info.is_numpy == Some(true)
                        || info.is_seamless_mixed == Some(true)
                }
                C::Binary => info.is_numpy == Some(true),
                C::Plain => info.is_json == Some(true),
                C::Str | C::Int | C::Float | C::Bool => {
                    info.is_json == Some(true) && info.json_type.is_some_and(|t| t.matches(target))
                }
                _ => source == C::Text && info.is_utf8 == Some(true),
            };
            if known {
                Outcome::Unchanged
            } else {
                Outcome::Undetermined
            }
        }
        Conversion::Possible => {
            if matches!(target, C::Int | C::Float | C::Bool)
                && info.length.is_some_and(|l| l > 1000)
            {
                Outcome::Impossible
            } else {
                Outcome::Undetermined
            }
        }
        Conversion::Reformat => {
            let recorded = match (source, target) {
                (C::Bytes, C::Binary) | (C::Bytes, C::Mixed) => {
                    if info.is_numpy == Some(true)
                        || (target == C::Mixed && info.is_seamless_mixed == Some(true))
                    {
                        return Ok(Outcome::Unchanged);
                    }
                    info.bytes2binary
                }
                (C::Binary, C::Bytes) | (C::Mixed, C::Bytes) => {
                    if source == C::Mixed && info.is_numpy == Some(false) {
                        return Ok(Outcome::Unchanged);
                    }
                    if info.shape.as_ref().is_some_and(|s| !s.is_empty()) {
                        return Ok(Outcome::Unchanged);
                    }
                    if info.dtype.as_ref().is_some_and(|d| !d.starts_with('S')) {
                        return Ok(Outcome::Unchanged);
                    }
                    info.binary2bytes
                }
                (C::Plain, C::Text) => {
                    if info.json_type.is_some_and(|t| t != JsonType::Str) {
                        return Ok(Outcome::Unchanged);
                    }
                    None
                }
                (C::Text, C::Plain) => {
                    if info.is_json == Some(true) {
                        return Ok(Outcome::Unchanged);
                    }
                    None
                }
                (C::Text, C::Str) => info.text2str,
                (C::Str, C::Text) => info.str2text,
                _ => None,
            };
            match recorded {
                Some(c) => Outcome::Converted(c),
                None => Outcome::Pending,
            }
        }
    };
    Ok(outcome)
}

#[derive(Debug, Default)]
struct StoreInner {
    infos: HashMap<Checksum, BufferInfo>,
    /// Checksums whose record matches the database copy.
    synced: HashSet<Checksum>,
}

/// The local table of buffer infos, optionally mirrored to the database.
#[derive(Debug)]
pub struct BufferInfoStore {
    inner: Mutex<StoreInner>,
    database: Database,
}

impl BufferInfoStore {
    pub fn new(database: Database) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            database,
        }
    }

    /// The local record, without consulting the database.
    pub fn get_local(&self, checksum: &Checksum) -> Option<BufferInfo> {
        self.inner.lock().infos.get(checksum).cloned()
    }

    /// The record, creating an empty one if needed. Merges the database copy if asked.
    pub async fn get(&self, checksum: &Checksum, sync_remote: bool) -> BufferInfo {
        self.inner.lock().infos.entry(*checksum).or_default();
        if sync_remote {
            self.sync_from_remote(checksum).await;
        }
        self.get_local(checksum).unwrap_or_default()
    }

    /// Applies a field locally. Returns true if the record changed.
    pub fn update_local(&self, checksum: &Checksum, field: Field) -> bool {
        let mut inner = self.inner.lock();
        let changed = inner.infos.entry(*checksum).or_default().apply(field);
        if changed {
            inner.synced.remove(checksum);
        }
        changed
    }

    /// Applies a field, optionally synchronizing with the database in both directions.
    pub async fn update(&self, checksum: &Checksum, field: Field, sync_remote: bool) {
        if sync_remote && !self.is_synced(checksum) {
            self.sync_from_remote(checksum).await;
        }
        self.update_local(checksum, field);
        if sync_remote {
            self.sync_to_remote(checksum).await;
        }
    }

    /// Records that converting `source_checksum` from `source` to `target` gives
    /// `target_checksum`, and the way back on the target.
    pub async fn update_conversion(
        &self,
        source_checksum: &Checksum,
        source: Celltype,
        target_checksum: &Checksum,
        target: Celltype,
        sync_remote: bool,
    ) {
        let Some(field) = ConversionField::for_conversion(source, target) else {
            return;
        };
        if sync_remote && !self.is_synced(source_checksum) {
            self.sync_from_remote(source_checksum).await;
        }
        let changed =
            self.update_local(source_checksum, Field::Conversion(field, *target_checksum));
        self.update_local(
            target_checksum,
            Field::Conversion(field.reverse(), *source_checksum),
        );
        if changed && sync_remote {
            self.sync_to_remote(source_checksum).await;
        }
    }

    fn is_synced(&self, checksum: &Checksum) -> bool {
        self.inner.lock().synced.contains(checksum)
    }

    /// Pulls the database copy, which wins on conflict.
    pub async fn sync_from_remote(&self, checksum: &Checksum) {
        if !self.database.is_active() || self.is_synced(checksum) {
            return;
        }
        let remote = match self.database.get_buffer_info(checksum).await {
            Ok(Some(remote)) => remote,
            Ok(None) => return,
            Err(err) => {
                warn!(%checksum, ?err, "failed to get buffer info from database");
                return;
            }
        };
        let mut inner = self.inner.lock();
        let local = inner.infos.entry(*checksum).or_default();
        let mut merged = local.clone();
        merged.merge_from(&remote);
        let in_sync = merged == remote;
        *local = merged;
        if in_sync {
            inner.synced.insert(*checksum);
        }
    }

    /// Pushes the local record unless it is known to be in sync.
    pub async fn sync_to_remote(&self, checksum: &Checksum) {
        if !self.database.is_active() {
            return;
        }
        let info = {
            let inner = self.inner.lock();
            if inner.synced.contains(checksum) {
                return;
            }
            match inner.infos.get(checksum) {
                Some(info) => info.clone(),
                None => return,
            }
        };
        match self.database.set_buffer_info(checksum, &info).await {
            Ok(()) => {
                debug!(%checksum, "buffer info synced to database");
                let mut inner = self.inner.lock();
                // only mark synced if nothing changed in the meantime
                if inner.infos.get(checksum) == Some(&info) {
                    inner.synced.insert(*checksum);
                }
            }
            Err(err) => warn!(%checksum, ?err, "failed to store buffer info in database"),
        }
    }

    /// Every local record holding a conversion field that points at `checksum`.
    ///
    /// Yields `(field, source_checksum)`: converting `source_checksum` along `field` gives
    /// `checksum`.
    pub fn reverse_conversions(&self, checksum: &Checksum) -> Vec<(ConversionField, Checksum)> {
        let inner = self.inner.lock();
        let mut found = Vec::new();
        for (source, info) in inner.infos.iter() {
            for field in ConversionField::all() {
                if info.get_conversion(field) == Some(*checksum) {
                    found.push((field, *source));
                }
            }
        }
        found
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.infos.clear();
        inner.synced.clear();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn co_and_anti_flags() {
        let mut info = BufferInfo::default();
        info.apply(Field::JsonType(JsonType::Int));
        assert_eq!(info.is_json, Some(true));
        assert_eq!(info.is_utf8, Some(true));
        assert_eq!(info.is_numpy, Some(false));
        assert_eq!(info.is_seamless_mixed, Some(false));

        info.apply(Field::IsNumpy(true));
        assert_eq!(info.is_json, Some(false));
        assert_eq!(info.is_json_numeric_scalar, None);

        let mut info = BufferInfo::default();
        info.apply(Field::IsJsonNumericArray(true));
        info.apply(Field::IsUtf8(false));
        assert_eq!(info.is_json, Some(false));
        assert_eq!(info.is_json_numeric_array, Some(false));
    }

    #[test]
    fn apply_reports_changes() {
        let mut info = BufferInfo::default();
        assert!(info.apply(Field::Length(3)));
        assert!(!info.apply(Field::Length(3)));
    }

    #[test]
    fn serializes_only_known_fields() {
        let mut info = BufferInfo::default();
        info.apply(Field::Length(3));
        info.apply(Field::IsUtf8(true));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, serde_json::json!({"length": 3, "is_utf8": true}));
        let back: BufferInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn validation() {
        let mut info = BufferInfo::default();
        info.apply(Field::JsonType(JsonType::List));
        assert!(validate(&info, Celltype::Plain).is_ok());
        assert!(validate(&info, Celltype::Int).is_err());
        assert!(validate(&info, Celltype::Checksum).is_err());
        assert!(validate(&info, Celltype::Binary).is_err());
        assert!(validate(&info, Celltype::Mixed).is_ok());
        assert!(verify(&info, Celltype::Plain));
        assert!(verify(&info, Celltype::Text));
        assert!(!verify(&info, Celltype::Str));
    }

    #[test]
    fn conversions_from_info() {
        let target = Checksum::new(b"hello\n");
        let mut info = BufferInfo::default();
        info.apply(Field::JsonType(JsonType::Str));
        info.apply(Field::Conversion(ConversionField::Str2text, target));

        assert_eq!(
            conversion_from_buffer_info(&info, Celltype::Str, Celltype::Text),
            Ok(Outcome::Converted(target))
        );
        assert_eq!(
            conversion_from_buffer_info(&info, Celltype::Str, Celltype::Plain),
            Ok(Outcome::Unchanged)
        );
        assert_eq!(
            conversion_from_buffer_info(&info, Celltype::Plain, Celltype::Str),
            Ok(Outcome::Undetermined)
        );
        assert_eq!(
            conversion_from_buffer_info(&info, Celltype::Bytes, Celltype::Plain),
            Ok(Outcome::Unchanged)
        );
        assert!(conversion_from_buffer_info(&info, Celltype::Binary, Celltype::Plain).is_err());

        let mut long = BufferInfo::default();
        long.apply(Field::Length(5000));
        assert_eq!(
            conversion_from_buffer_info(&long, Celltype::Plain, Celltype::Int),
            Ok(Outcome::Impossible)
        );
    }

    #[tokio::test]
    async fn store_without_database() {
        let store = BufferInfoStore::new(Database::inactive());
        let source = Checksum::new(b"\"hello\"\n");
        let target = Checksum::new(b"hello\n");
        store
            .update_conversion(&source, Celltype::Str, &target, Celltype::Text, true)
            .await;
        assert_eq!(store.get(&source, true).await.str2text, Some(target));
        assert_eq!(store.get_local(&target).unwrap().text2str, Some(source));
        assert_eq!(
            store.reverse_conversions(&target),
            vec![(ConversionField::Str2text, source)]
        );
    }
}

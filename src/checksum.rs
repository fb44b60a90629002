//! The SHA3-256 checksum and the immutable buffer it identifies.

use std::{
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, OnceLock, Weak},
};

use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};

/// Suffix of checksum sidecar files.
pub const CHECKSUM_SUFFIX: &str = ".CHECKSUM";

/// Checksum type used throughout.
///
/// A null checksum is represented as `Option<Checksum>::None`.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Checksum([u8; 32]);

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Checksum").field(&DD(self.to_hex())).finish()
    }
}

struct DD<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DD<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Checksum {
    /// The checksum of the empty dict buffer, `b"{}\n"`.
    pub const EMPTY_DICT: Checksum = Checksum::from_bytes([
        208, 161, 178, 175, 23, 5, 193, 184, 73, 91, 0, 20, 80, 130, 239, 116, 112, 56, 78, 98,
        172, 28, 77, 155, 156, 219, 190, 4, 118, 194, 143, 140,
    ]);

    /// The checksum of the empty list buffer, `b"[]\n"`.
    pub const EMPTY_LIST: Checksum = Checksum::from_bytes([
        123, 65, 173, 74, 80, 178, 145, 88, 224, 117, 198, 70, 49, 51, 118, 18, 102, 173, 180,
        117, 19, 11, 142, 136, 111, 47, 86, 73, 7, 0, 49, 207,
    ]);

    /// Calculate the checksum of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        let digest = Sha3_256::digest(buf.as_ref());
        Checksum(digest.into())
    }

    /// Bytes of the checksum.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `Checksum` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert the checksum to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short representation, for logging.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }

    /// Returns the buffer for the two well-known constants, which never need storage.
    pub fn constant_buffer(&self) -> Option<&'static [u8]> {
        if *self == Self::EMPTY_DICT {
            Some(b"{}\n")
        } else if *self == Self::EMPTY_LIST {
            Some(b"[]\n")
        } else {
            None
        }
    }

    /// Loads a checksum from a sidecar file.
    ///
    /// The `.CHECKSUM` suffix is appended to `path` if it is not already present.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let path = sidecar_path(path.as_ref());
        let content = tokio::fs::read_to_string(&path).await?;
        let content = content.trim_end_matches('\n');
        if content.len() != 64 {
            return Err(FormatError::Invalid(path));
        }
        content.parse().map_err(|_| FormatError::Invalid(path))
    }

    /// Saves the checksum to a sidecar file, as 64 hex characters and a newline.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), FormatError> {
        let path = sidecar_path(path.as_ref());
        tokio::fs::write(path, format!("{}\n", self.to_hex())).await?;
        Ok(())
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let s = path.as_os_str().to_string_lossy();
    if s.ends_with(CHECKSUM_SUFFIX) {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{s}{CHECKSUM_SUFFIX}"))
    }
}

/// Error loading or saving a checksum sidecar file.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The file exists but its content is not a checksum.
    #[error("File does not contain a SHA3-256 checksum: {}", .0.display())]
    Invalid(PathBuf),
    /// Reading or writing the file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Error parsing a hex checksum.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid checksum: {0}")]
pub struct InvalidChecksum(String);

impl AsRef<[u8]> for Checksum {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Checksum {
    fn from(value: [u8; 32]) -> Self {
        Checksum(value)
    }
}

impl From<Checksum> for [u8; 32] {
    fn from(value: Checksum) -> Self {
        value.0
    }
}

impl From<&[u8; 32]> for Checksum {
    fn from(value: &[u8; 32]) -> Self {
        Checksum(*value)
    }
}

impl PartialOrd for Checksum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Checksum {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = [0u8; 64];
        // hex output is always valid ascii
        hex::encode_to_slice(self.0, &mut res).map_err(|_| fmt::Error)?;
        f.write_str(std::str::from_utf8(&res).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Checksum {
    type Err = InvalidChecksum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sb = s.as_bytes();
        if sb.len() != 64 {
            return Err(InvalidChecksum(truncate(s)));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(sb, &mut bytes).map_err(|_| InvalidChecksum(truncate(s)))?;
        Ok(Self(bytes))
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > 1000 {
        let head: String = s.chars().take(920).collect();
        let tail: String = s
            .chars()
            .rev()
            .take(50)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{head}...{tail}")
    } else {
        s.to_string()
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_hex().as_str())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = <[u8; 32]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

/// An immutable byte buffer that computes its checksum at most once.
///
/// Clones share both the bytes and the memoized checksum.
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

pub(crate) struct BufferInner {
    data: Bytes,
    checksum: OnceLock<Checksum>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Buffer");
        s.field("len", &self.len());
        if let Some(checksum) = self.0.checksum.get() {
            s.field("checksum", &DD(checksum.fmt_short()));
        }
        s.finish()
    }
}

impl Buffer {
    /// Wraps bytes in a buffer. The checksum is computed on first use.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(Arc::new(BufferInner {
            data: data.into(),
            checksum: OnceLock::new(),
        }))
    }

    /// Wraps bytes whose checksum is already known.
    ///
    /// The checksum is trusted; use [`Buffer::verify`] for data from untrusted sources.
    pub fn with_checksum(data: impl Into<Bytes>, checksum: Checksum) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(checksum);
        Self(Arc::new(BufferInner {
            data: data.into(),
            checksum: cell,
        }))
    }

    /// The checksum of the content, computed once per buffer object.
    pub fn checksum(&self) -> Checksum {
        *self.0.checksum.get_or_init(|| Checksum::new(&self.0.data))
    }

    /// Returns true when the content hashes to `expected`.
    ///
    /// Always recomputes, ignoring a memoized value.
    pub fn verify(&self, expected: &Checksum) -> bool {
        Checksum::new(&self.0.data) == *expected
    }

    /// The underlying bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.0.data
    }

    /// Returns true if the content starts with `magic`.
    pub fn starts_with(&self, magic: &[u8]) -> bool {
        self.0.data.starts_with(magic)
    }

    pub(crate) fn downgrade(&self) -> Weak<BufferInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<BufferInner>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    /// Returns true if both handles point to the same buffer object.
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.0.data
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.0.data == other.0.data
    }
}

impl Eq for Buffer {}

impl From<Bytes> for Buffer {
    fn from(value: Bytes) -> Self {
        Buffer::new(value)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(value: Vec<u8>) -> Self {
        Buffer::new(value)
    }
}

impl From<&'static [u8]> for Buffer {
    fn from(value: &'static [u8]) -> Self {
        Buffer::new(Bytes::from_static(value))
    }
}

impl From<&'static str> for Buffer {
    fn from(value: &'static str) -> Self {
        Buffer::new(Bytes::from_static(value.as_bytes()))
    }
}

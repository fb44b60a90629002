//! Errors shared between the components.

use std::fmt;

use crate::{
    celltype::Celltype,
    checksum::Checksum,
    database::DatabaseError,
    deep_structure::DeepStructureError,
    remote::RemoteError,
    serialize::SerializeError,
    transformation_cache::TransformationError,
};

/// Buffers larger than this are cut down in error messages.
const MAX_MESSAGE: usize = 1000;

/// No buffer could be obtained for a checksum.
///
/// When raised after provenance recomputation, `trail` holds the collected causes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("CacheMissError: {checksum}{trail}")]
pub struct CacheMiss {
    pub checksum: Checksum,
    pub trail: String,
}

impl CacheMiss {
    pub fn new(checksum: Checksum) -> Self {
        Self {
            checksum,
            trail: String::new(),
        }
    }

    pub fn with_trail(checksum: Checksum, trail: impl Into<String>) -> Self {
        Self {
            checksum,
            trail: trail.into(),
        }
    }
}

/// A buffer is not valid for the requested celltype.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConversionError(String);

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// A checksum preserving conversion found an invalid buffer.
    pub fn reinterpret(
        checksum: &Checksum,
        source: Celltype,
        target: Celltype,
        cause: impl fmt::Display,
    ) -> Self {
        Self(format!(
            "{checksum} cannot be re-interpreted from {source} to {target}\n\nOriginal exception:\n\n{}",
            truncate(&cause.to_string())
        ))
    }

    /// A value dependent conversion failed.
    pub fn convert(
        checksum: &Checksum,
        source: Celltype,
        target: Celltype,
        cause: impl fmt::Display,
    ) -> Self {
        Self(format!(
            "{checksum} cannot be converted from {source} to {target}\n\nOriginal exception:\n\n{}",
            truncate(&cause.to_string())
        ))
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Cuts long messages to the first 920 and last 50 characters.
pub(crate) fn truncate(s: &str) -> String {
    let count = s.chars().count();
    if count <= MAX_MESSAGE {
        return s.to_string();
    }
    let head: String = s.chars().take(920).collect();
    let tail: String = s.chars().skip(count - 50).collect();
    format!("{head}...{tail}")
}

/// Any error produced by the store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    CacheMiss(#[from] CacheMiss),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    DeepStructure(#[from] DeepStructureError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Transformation(#[from] TransformationError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Helpers for unit tests.

use std::sync::Arc;

use crate::{
    buffer_cache::BufferCache,
    buffer_info::BufferInfoStore,
    config::BufferConfig,
    convert::Converter,
    database::Database,
    remote::RemoteBufferLayer,
    serialize::DefaultSerializer,
};

/// A standalone buffer cache: no remote tiers and no database.
pub(crate) fn test_cache() -> BufferCache {
    let infos = Arc::new(BufferInfoStore::new(Database::inactive()));
    let remote = RemoteBufferLayer::new(Default::default());
    BufferCache::new(BufferConfig::default(), remote, infos)
}

pub(crate) fn test_converter() -> Converter {
    Converter::new(test_cache(), Arc::new(DefaultSerializer))
}

//! Content-addressed buffer store with provenance based recomputation.
//!
//! Buffers are identified by the SHA3-256 [`Checksum`] of their bytes. A [`Context`] holds the
//! local [`BufferCache`], the remote tiers, the database client and the provenance records
//! (transformations, expressions and joins) used to compute a buffer again when it is lost.
//! [`BlockingContext`] offers the same operations to synchronous callers.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod blocking;
pub mod buffer_cache;
pub mod buffer_info;
pub mod celltype;
pub mod checksum;
pub mod config;
pub mod context;
pub mod conversion;
pub mod convert;
pub mod database;
pub mod deep_structure;
pub mod digest_cache;
pub mod error;
pub mod expression;
pub mod fingertip;
pub mod join;
pub mod refs;
pub mod remote;
pub mod serialize;
pub mod transformation_cache;
pub mod value;

#[cfg(test)]
mod test_utils;

pub use crate::{
    blocking::BlockingContext,
    buffer_cache::{BufferCache, BufferRef},
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    config::Config,
    context::Context,
    error::{CacheMiss, Error, Result},
    expression::Expression,
    fingertip::FingerTipper,
    join::JoinDict,
    transformation_cache::{Transformation, TransformationCache},
};

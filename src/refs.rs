//! Holders of checksum references.
//!
//! Cells, expressions, joins and transformations hold checksums. Each holder gets an id from
//! the [`RefTable`] arena, and each (holder, checksum) pair owns one [`BufferRef`] in the
//! buffer cache. Unregistering a holder releases everything it holds.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    buffer_cache::{BufferCache, BufferRef},
    checksum::Checksum,
    expression::Expression,
};

/// Identifies a holder in a [`RefTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("holder-{_0}")]
pub struct HolderId(u64);

/// Something that keeps checksums alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    /// A cell, by name. Only checksums held by cells may be recomputed on behalf of
    /// untrusted callers.
    Cell(String),
    Expression(Expression),
    /// A structured cell join, by join dict checksum.
    Join(Checksum),
    /// A transformation, by tf_checksum.
    Transformation(Checksum),
    /// Imperative one-off use.
    Placeholder,
}

#[derive(derive_more::Debug)]
struct Held {
    /// The checksum is the result of the holder, rather than an input.
    result: bool,
    #[debug(skip)]
    _guard: BufferRef,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    holders: HashMap<HolderId, Holder>,
    refs: HashMap<Checksum, BTreeMap<HolderId, Held>>,
    by_holder: HashMap<HolderId, HashSet<Checksum>>,
}

/// Arena of holders and the checksums they hold. Clones share the table.
#[derive(Debug, Clone)]
pub struct RefTable {
    cache: BufferCache,
    inner: Arc<Mutex<Inner>>,
}

impl RefTable {
    pub fn new(cache: BufferCache) -> Self {
        Self {
            cache,
            inner: Default::default(),
        }
    }

    pub fn register(&self, holder: Holder) -> HolderId {
        let mut inner = self.inner.lock();
        let id = HolderId(inner.next_id);
        inner.next_id += 1;
        trace!(%id, ?holder, "register holder");
        inner.holders.insert(id, holder);
        id
    }

    pub fn holder(&self, id: HolderId) -> Option<Holder> {
        self.inner.lock().holders.get(&id).cloned()
    }

    /// Makes `id` hold `checksum`. Holding the same checksum twice is a no-op.
    pub async fn incref(&self, checksum: &Checksum, id: HolderId, persistent: bool, result: bool) {
        {
            let inner = self.inner.lock();
            if !inner.holders.contains_key(&id) {
                warn!(%id, %checksum, "incref by unknown holder");
                return;
            }
            if inner
                .refs
                .get(checksum)
                .is_some_and(|holders| holders.contains_key(&id))
            {
                return;
            }
        }
        let guard = self.cache.incref(checksum, persistent).await;
        let mut inner = self.inner.lock();
        if !inner.holders.contains_key(&id) {
            // unregistered while increfing; the guard is released on drop
            return;
        }
        let holders = inner.refs.entry(*checksum).or_default();
        if holders.contains_key(&id) {
            return;
        }
        holders.insert(
            id,
            Held {
                result,
                _guard: guard,
            },
        );
        inner.by_holder.entry(id).or_default().insert(*checksum);
    }

    /// Releases the reference of `id` to `checksum`. Returns false if there was none.
    pub fn decref(&self, checksum: &Checksum, id: HolderId) -> bool {
        let held = {
            let mut inner = self.inner.lock();
            let Some(holders) = inner.refs.get_mut(checksum) else {
                return false;
            };
            let held = holders.remove(&id);
            if holders.is_empty() {
                inner.refs.remove(checksum);
            }
            if let Some(set) = inner.by_holder.get_mut(&id) {
                set.remove(checksum);
            }
            held
        };
        held.is_some()
    }

    /// Removes a holder and releases everything it holds.
    pub fn unregister(&self, id: HolderId) {
        let released: Vec<Held> = {
            let mut inner = self.inner.lock();
            inner.holders.remove(&id);
            let checksums = inner.by_holder.remove(&id).unwrap_or_default();
            checksums
                .into_iter()
                .filter_map(|checksum| {
                    let holders = inner.refs.get_mut(&checksum)?;
                    let held = holders.remove(&id);
                    if holders.is_empty() {
                        inner.refs.remove(&checksum);
                    }
                    held
                })
                .collect()
        };
        debug!(%id, released = released.len(), "unregister holder");
    }

    /// Holders of a checksum, with the result flag.
    pub fn holders(&self, checksum: &Checksum) -> Vec<(HolderId, Holder, bool)> {
        let inner = self.inner.lock();
        inner
            .refs
            .get(checksum)
            .into_iter()
            .flatten()
            .filter_map(|(id, held)| {
                let holder = inner.holders.get(id)?.clone();
                Some((*id, holder, held.result))
            })
            .collect()
    }

    /// Expressions holding `checksum` as their result.
    pub fn expressions_with_result(&self, checksum: &Checksum) -> Vec<Expression> {
        self.holders(checksum)
            .into_iter()
            .filter_map(|(_, holder, result)| match holder {
                Holder::Expression(expression) if result => Some(expression),
                _ => None,
            })
            .collect()
    }

    /// Returns true if a cell holds the checksum.
    pub fn has_cell(&self, checksum: &Checksum) -> bool {
        self.holders(checksum)
            .iter()
            .any(|(_, holder, _)| matches!(holder, Holder::Cell(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().refs.is_empty()
    }

    /// Releases every reference and forgets every holder.
    pub fn clear(&self) {
        let old = {
            let mut inner = self.inner.lock();
            let next_id = inner.next_id;
            let old = std::mem::take(&mut *inner);
            inner.next_id = next_id;
            old
        };
        if !old.refs.is_empty() {
            warn!(checksums = old.refs.len(), "releasing references of live holders");
        }
        drop(old);
    }
}

//! Weak checksum to buffer table.
//!
//! Lets the buffer cache find a buffer that is still alive somewhere in the process without
//! keeping it alive itself.

use std::{collections::HashMap, sync::Weak};

use parking_lot::Mutex;

use crate::checksum::{Buffer, BufferInner, Checksum};

/// Number of registrations between two prune passes.
const PRUNE_INTERVAL: usize = 1024;

#[derive(Debug, Default)]
pub struct DigestCache {
    inner: Mutex<Inner>,
}

#[derive(derive_more::Debug, Default)]
struct Inner {
    #[debug("{} entries", entries.len())]
    entries: HashMap<Checksum, Weak<BufferInner>>,
    inserts_since_prune: usize,
}

impl DigestCache {
    /// Records a buffer, computing its checksum if not yet known.
    pub fn register(&self, buffer: &Buffer) -> Checksum {
        let checksum = buffer.checksum();
        let mut inner = self.inner.lock();
        inner.entries.insert(checksum, buffer.downgrade());
        inner.inserts_since_prune += 1;
        if inner.inserts_since_prune >= PRUNE_INTERVAL {
            inner.prune();
        }
        checksum
    }

    /// Returns the buffer if some owner still holds it.
    pub fn get(&self, checksum: &Checksum) -> Option<Buffer> {
        let mut inner = self.inner.lock();
        let weak = inner.entries.get(checksum)?;
        match Buffer::upgrade(weak) {
            Some(buffer) => Some(buffer),
            None => {
                inner.entries.remove(checksum);
                None
            }
        }
    }

    /// Drops all entries whose buffer is gone.
    pub fn prune(&self) {
        self.inner.lock().prune();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

impl Inner {
    fn prune(&mut self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        self.inserts_since_prune = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_buffers_are_found() {
        let cache = DigestCache::default();
        let buffer = Buffer::from("\"hello\"\n");
        let checksum = cache.register(&buffer);
        let found = cache.get(&checksum).expect("still alive");
        assert!(found.ptr_eq(&buffer));
    }

    #[test]
    fn dead_buffers_are_not_kept_alive() {
        let cache = DigestCache::default();
        let checksum = {
            let buffer = Buffer::new(b"temporary".to_vec());
            cache.register(&buffer)
        };
        assert!(cache.get(&checksum).is_none());
        assert!(cache.is_empty());

        let keep = Buffer::new(b"keep".to_vec());
        cache.register(&keep);
        {
            let gone = Buffer::new(b"gone".to_vec());
            cache.register(&gone);
        }
        cache.prune();
        assert_eq!(cache.len(), 1);
    }
}

//! Invariants for the cache state.

#![cfg(any(test, debug_assertions))]

use super::*;

impl State {
    /// Checks the invariants the cache state must maintain.
    #[track_caller]
    pub(super) fn check_invariants(&self) {
        self.check_refcounts();
        self.check_missing();
    }

    /// Zero counts are removed, and the constants are never counted.
    #[track_caller]
    fn check_refcounts(&self) {
        for (checksum, count) in self.refcounts.iter() {
            assert!(*count > 0, "zero refcount stored for {checksum}");
            assert!(
                checksum.constant_buffer().is_none(),
                "constant {checksum} is refcounted"
            );
        }
        for checksum in self.persistent.iter() {
            assert!(
                self.refcounts.contains_key(checksum),
                "persistent checksum {checksum} has no references"
            );
        }
    }

    /// A missing checksum is referenced and has no resident buffer.
    #[track_caller]
    fn check_missing(&self) {
        for checksum in self.missing.keys() {
            assert!(
                self.refcounts.contains_key(checksum),
                "missing checksum {checksum} has no references"
            );
            assert!(
                !self.buffers.contains_key(checksum),
                "missing checksum {checksum} is resident"
            );
        }
    }
}

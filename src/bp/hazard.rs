//! Hazard pointer for list iteration.
//!
//! A batch walking the flush list or the LRU publishes its current node
//! here; a concurrent remover consults the slot before unlinking and, if it
//! is about to remove the published node, advances the pointer to the next
//! still-present node. The iterator stays valid without holding the list
//! mutex across I/O. One type serves both lists; the use site decides the
//! adjustment direction by passing the appropriate successor.

use std::sync::atomic::{AtomicU32, Ordering};

use super::lists::NIL;

pub(crate) struct HazardPointer {
    slot: AtomicU32,
}

impl HazardPointer {
    pub(crate) fn new() -> Self {
        HazardPointer {
            slot: AtomicU32::new(NIL),
        }
    }

    /// Publishes the iterator position. Caller holds the list mutex.
    pub(crate) fn set(&self, idx: u32) {
        self.slot.store(idx, Ordering::Release);
    }

    pub(crate) fn get(&self) -> u32 {
        self.slot.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.slot.store(NIL, Ordering::Release);
    }

    /// Called by a remover, before unlinking `removed`, with the node that
    /// will take its place in iteration order. Caller holds the list mutex,
    /// so the compare cannot race another adjust.
    pub(crate) fn adjust(&self, removed: u32, next: u32) {
        let _ = self
            .slot
            .compare_exchange(removed, next, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.get() != NIL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_moves_only_matching() {
        let hp = HazardPointer::new();
        assert!(!hp.is_set());
        hp.set(5);
        hp.adjust(4, 9);
        assert_eq!(hp.get(), 5);
        hp.adjust(5, 9);
        assert_eq!(hp.get(), 9);
        hp.clear();
        assert!(!hp.is_set());
    }
}

//! Intrusive doubly-linked lists over descriptor indices.
//!
//! Descriptors never move, so lists store dense `u32` indices instead of
//! pointers; `NIL` marks list ends and unlinked nodes. Link cells are
//! atomics only so the structure is `Sync`; every mutation happens under
//! the mutex owning the list (pool mutex for free/LRU/unzip, flush-list
//! mutex for the flush list), and the relaxed ordering is sufficient.

use std::sync::atomic::{AtomicU32, Ordering};

use super::descriptor::PageDescriptor;

pub(crate) const NIL: u32 = u32::MAX;

pub(crate) struct ListNode {
    prev: AtomicU32,
    next: AtomicU32,
}

impl ListNode {
    pub(crate) fn new() -> Self {
        ListNode {
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
        }
    }

    #[inline]
    pub(crate) fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_prev(&self, idx: u32) {
        self.prev.store(idx, Ordering::Relaxed);
    }

    #[inline]
    fn set_next(&self, idx: u32) {
        self.next.store(idx, Ordering::Relaxed);
    }
}

/// Which intrusive link set of the descriptor a list threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    Free,
    Lru,
    Flush,
    Unzip,
}

/// Head/tail/len of one intrusive list. The owning mutex serializes all
/// access.
pub(crate) struct IndexList {
    kind: LinkKind,
    head: AtomicU32,
    tail: AtomicU32,
    len: AtomicU32,
}

impl IndexList {
    pub(crate) fn new(kind: LinkKind) -> Self {
        IndexList {
            kind,
            head: AtomicU32::new(NIL),
            tail: AtomicU32::new(NIL),
            len: AtomicU32::new(0),
        }
    }

    pub(crate) fn head(&self) -> u32 {
        self.head.load(Ordering::Relaxed)
    }

    pub(crate) fn tail(&self) -> u32 {
        self.tail.load(Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> u32 {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push_front<'a, R>(&self, resolve: &R, idx: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        let node = resolve(idx).node(self.kind);
        debug_assert_eq!(node.prev(), NIL);
        debug_assert_eq!(node.next(), NIL);
        let old_head = self.head.load(Ordering::Relaxed);
        node.set_next(old_head);
        node.set_prev(NIL);
        if old_head == NIL {
            self.tail.store(idx, Ordering::Relaxed);
        } else {
            resolve(old_head).node(self.kind).set_prev(idx);
        }
        self.head.store(idx, Ordering::Relaxed);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn push_back<'a, R>(&self, resolve: &R, idx: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        let node = resolve(idx).node(self.kind);
        debug_assert_eq!(node.prev(), NIL);
        debug_assert_eq!(node.next(), NIL);
        let old_tail = self.tail.load(Ordering::Relaxed);
        node.set_prev(old_tail);
        node.set_next(NIL);
        if old_tail == NIL {
            self.head.store(idx, Ordering::Relaxed);
        } else {
            resolve(old_tail).node(self.kind).set_next(idx);
        }
        self.tail.store(idx, Ordering::Relaxed);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Inserts `idx` immediately before `pos`.
    pub(crate) fn insert_before<'a, R>(&self, resolve: &R, pos: u32, idx: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        debug_assert_ne!(pos, NIL);
        let pos_node = resolve(pos).node(self.kind);
        let prev = pos_node.prev();
        let node = resolve(idx).node(self.kind);
        node.set_prev(prev);
        node.set_next(pos);
        pos_node.set_prev(idx);
        if prev == NIL {
            self.head.store(idx, Ordering::Relaxed);
        } else {
            resolve(prev).node(self.kind).set_next(idx);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Inserts `idx` immediately after `pos`.
    pub(crate) fn insert_after<'a, R>(&self, resolve: &R, pos: u32, idx: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        debug_assert_ne!(pos, NIL);
        let pos_node = resolve(pos).node(self.kind);
        let next = pos_node.next();
        let node = resolve(idx).node(self.kind);
        node.set_prev(pos);
        node.set_next(next);
        pos_node.set_next(idx);
        if next == NIL {
            self.tail.store(idx, Ordering::Relaxed);
        } else {
            resolve(next).node(self.kind).set_prev(idx);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove<'a, R>(&self, resolve: &R, idx: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        let node = resolve(idx).node(self.kind);
        let prev = node.prev();
        let next = node.next();
        if prev == NIL {
            debug_assert_eq!(self.head.load(Ordering::Relaxed), idx);
            self.head.store(next, Ordering::Relaxed);
        } else {
            resolve(prev).node(self.kind).set_next(next);
        }
        if next == NIL {
            debug_assert_eq!(self.tail.load(Ordering::Relaxed), idx);
            self.tail.store(prev, Ordering::Relaxed);
        } else {
            resolve(next).node(self.kind).set_prev(prev);
        }
        node.set_prev(NIL);
        node.set_next(NIL);
        let old = self.len.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0);
    }

    /// Splices `to` into the exact position `from` occupies, then unlinks
    /// `from`. Used by compressed-page relocation.
    pub(crate) fn replace<'a, R>(&self, resolve: &R, from: u32, to: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        let from_node = resolve(from).node(self.kind);
        let prev = from_node.prev();
        let next = from_node.next();
        let to_node = resolve(to).node(self.kind);
        to_node.set_prev(prev);
        to_node.set_next(next);
        if prev == NIL {
            self.head.store(to, Ordering::Relaxed);
        } else {
            resolve(prev).node(self.kind).set_next(to);
        }
        if next == NIL {
            self.tail.store(to, Ordering::Relaxed);
        } else {
            resolve(next).node(self.kind).set_prev(to);
        }
        from_node.set_prev(NIL);
        from_node.set_next(NIL);
    }

    /// Iterates indices from the tail toward the head, calling `f` until it
    /// returns false. Caller holds the owning mutex.
    pub(crate) fn for_each_from_tail<'a, R, F>(&self, resolve: &R, mut f: F)
    where
        R: Fn(u32) -> &'a PageDescriptor,
        F: FnMut(u32) -> bool,
    {
        let mut idx = self.tail();
        while idx != NIL {
            let prev = resolve(idx).node(self.kind).prev();
            if !f(idx) {
                break;
            }
            idx = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(n: u32) -> Vec<PageDescriptor> {
        (0..n).map(PageDescriptor::new).collect()
    }

    fn collect<'a, R: Fn(u32) -> &'a PageDescriptor>(list: &IndexList, resolve: &R) -> Vec<u32> {
        let mut out = Vec::new();
        let mut idx = list.head();
        while idx != NIL {
            out.push(idx);
            idx = resolve(idx).node(LinkKind::Lru).next();
        }
        out
    }

    #[test]
    fn test_push_and_remove() {
        let descs = fixture(4);
        let resolve = |i: u32| &descs[i as usize];
        let list = IndexList::new(LinkKind::Lru);

        list.push_front(&resolve, 0);
        list.push_front(&resolve, 1);
        list.push_back(&resolve, 2);
        assert_eq!(collect(&list, &resolve), vec![1, 0, 2]);
        assert_eq!(list.len(), 3);

        list.remove(&resolve, 0);
        assert_eq!(collect(&list, &resolve), vec![1, 2]);
        list.remove(&resolve, 1);
        list.remove(&resolve, 2);
        assert!(list.is_empty());
        assert_eq!(list.head(), NIL);
        assert_eq!(list.tail(), NIL);
    }

    #[test]
    fn test_insert_relative() {
        let descs = fixture(4);
        let resolve = |i: u32| &descs[i as usize];
        let list = IndexList::new(LinkKind::Lru);

        list.push_back(&resolve, 0);
        list.push_back(&resolve, 3);
        list.insert_after(&resolve, 0, 1);
        list.insert_before(&resolve, 3, 2);
        assert_eq!(collect(&list, &resolve), vec![0, 1, 2, 3]);
        assert_eq!(list.tail(), 3);
    }

    #[test]
    fn test_replace_keeps_position() {
        let descs = fixture(4);
        let resolve = |i: u32| &descs[i as usize];
        let list = IndexList::new(LinkKind::Lru);

        list.push_back(&resolve, 0);
        list.push_back(&resolve, 1);
        list.push_back(&resolve, 2);
        list.replace(&resolve, 1, 3);
        assert_eq!(collect(&list, &resolve), vec![0, 3, 2]);
        // The evicted node is fully unlinked.
        assert_eq!(descs[1].node(LinkKind::Lru).next(), NIL);
        assert_eq!(descs[1].node(LinkKind::Lru).prev(), NIL);
    }

    #[test]
    fn test_tail_iteration() {
        let descs = fixture(3);
        let resolve = |i: u32| &descs[i as usize];
        let list = IndexList::new(LinkKind::Lru);
        for i in 0..3 {
            list.push_front(&resolve, i);
        }
        let mut seen = Vec::new();
        list.for_each_from_tail(&resolve, |i| {
            seen.push(i);
            true
        });
        assert_eq!(seen, vec![0, 1, 2]);
    }
}

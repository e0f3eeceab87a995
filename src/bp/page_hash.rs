//! Striped page hash: `(space_id, page_no) → descriptor index`.
//!
//! Buckets are atomic heads of singly-linked chains threaded through
//! `descriptor.hash_next`. Locking is striped: bucket `b` maps to stripe
//! `b & (stripes - 1)`. Lookup takes the stripe shared; insertion and
//! removal take it exclusive and additionally require the pool mutex.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::page::PageId;
use crate::sync::{RwLatch, SyncContext};

use super::descriptor::PageDescriptor;
use super::lists::NIL;

pub(crate) struct PageHash {
    buckets: Box<[AtomicU32]>,
    bucket_mask: u64,
    stripes: Box<[RwLatch]>,
    stripe_mask: usize,
}

impl PageHash {
    /// Bucket count is the next power of two above `capacity`; stripe count
    /// is capped by it.
    pub(crate) fn new(capacity: usize, n_stripes: usize) -> Self {
        assert!(n_stripes.is_power_of_two());
        let n_buckets = (capacity.max(1) * 2).next_power_of_two();
        let n_stripes = n_stripes.min(n_buckets);
        PageHash {
            buckets: (0..n_buckets).map(|_| AtomicU32::new(NIL)).collect(),
            bucket_mask: (n_buckets - 1) as u64,
            stripes: (0..n_stripes).map(|_| RwLatch::new()).collect(),
            stripe_mask: n_stripes - 1,
        }
    }

    #[inline]
    fn bucket_index(&self, id: PageId) -> usize {
        (id.fingerprint() & self.bucket_mask) as usize
    }

    #[inline]
    pub(crate) fn stripe(&self, id: PageId) -> &RwLatch {
        &self.stripes[self.bucket_index(id) & self.stripe_mask]
    }

    /// Caller holds the stripe for `id` in either mode.
    pub(crate) fn lookup<'a, R>(&self, resolve: &R, id: PageId) -> Option<u32>
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        let mut idx = self.buckets[self.bucket_index(id)].load(Ordering::Acquire);
        while idx != NIL {
            let desc = resolve(idx);
            if desc.id() == Some(id) {
                return Some(idx);
            }
            idx = desc.hash_next();
        }
        None
    }

    /// Caller holds the stripe exclusively and the pool mutex; `idx` must
    /// already carry `id`.
    pub(crate) fn insert<'a, R>(&self, resolve: &R, id: PageId, idx: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        debug_assert_eq!(resolve(idx).id(), Some(id));
        debug_assert!(self.lookup(resolve, id).is_none(), "duplicate hash insert");
        let bucket = &self.buckets[self.bucket_index(id)];
        let head = bucket.load(Ordering::Acquire);
        resolve(idx).set_hash_next(head);
        bucket.store(idx, Ordering::Release);
    }

    /// Caller holds the stripe exclusively and the pool mutex.
    pub(crate) fn remove<'a, R>(&self, resolve: &R, id: PageId, idx: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        let bucket = &self.buckets[self.bucket_index(id)];
        let head = bucket.load(Ordering::Acquire);
        if head == idx {
            bucket.store(resolve(idx).hash_next(), Ordering::Release);
        } else {
            let mut cur = head;
            loop {
                assert_ne!(cur, NIL, "descriptor not found in its hash chain");
                let next = resolve(cur).hash_next();
                if next == idx {
                    resolve(cur).set_hash_next(resolve(idx).hash_next());
                    break;
                }
                cur = next;
            }
        }
        resolve(idx).set_hash_next(NIL);
    }

    /// Rewrites the chain entry for `id` from `from` to `to` in place.
    /// Caller holds the stripe exclusively and the pool mutex.
    pub(crate) fn replace<'a, R>(&self, resolve: &R, id: PageId, from: u32, to: u32)
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        resolve(to).set_hash_next(resolve(from).hash_next());
        let bucket = &self.buckets[self.bucket_index(id)];
        if bucket.load(Ordering::Acquire) == from {
            bucket.store(to, Ordering::Release);
        } else {
            let mut cur = bucket.load(Ordering::Acquire);
            loop {
                assert_ne!(cur, NIL, "descriptor not found in its hash chain");
                let next = resolve(cur).hash_next();
                if next == from {
                    resolve(cur).set_hash_next(to);
                    break;
                }
                cur = next;
            }
        }
        resolve(from).set_hash_next(NIL);
    }

    /// Visits every chained descriptor index. For validation sweeps; the
    /// caller has excluded concurrent writers.
    pub(crate) fn for_each<'a, R, F>(&self, resolve: &R, mut f: F)
    where
        R: Fn(u32) -> &'a PageDescriptor,
        F: FnMut(u32),
    {
        for bucket in self.buckets.iter() {
            let mut idx = bucket.load(Ordering::Acquire);
            while idx != NIL {
                f(idx);
                idx = resolve(idx).hash_next();
            }
        }
    }

    /// Convenience: shared-lookup with stripe management, for read-only
    /// queries that need no descriptor stability beyond the call.
    pub(crate) fn lookup_locked<'a, R>(
        &self,
        sync: &SyncContext,
        resolve: &R,
        id: PageId,
    ) -> Option<u32>
    where
        R: Fn(u32) -> &'a PageDescriptor,
    {
        let stripe = self.stripe(id);
        stripe.shared(sync);
        let found = self.lookup(resolve, id);
        stripe.release_shared(sync);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(n: u32) -> Vec<PageDescriptor> {
        (0..n).map(PageDescriptor::new).collect()
    }

    #[test]
    fn test_insert_lookup_remove() {
        let descs = fixture(8);
        let resolve = |i: u32| &descs[i as usize];
        let hash = PageHash::new(8, 4);

        for i in 0..8u32 {
            let id = PageId::new(1, i);
            descs[i as usize].set_id(Some(id));
            descs[i as usize].set_state(crate::bp::PageState::FilePage);
            hash.insert(&resolve, id, i);
        }
        for i in 0..8u32 {
            assert_eq!(hash.lookup(&resolve, PageId::new(1, i)), Some(i));
        }
        assert_eq!(hash.lookup(&resolve, PageId::new(2, 0)), None);

        hash.remove(&resolve, PageId::new(1, 3), 3);
        assert_eq!(hash.lookup(&resolve, PageId::new(1, 3)), None);
        assert_eq!(hash.lookup(&resolve, PageId::new(1, 7)), Some(7));
    }

    #[test]
    fn test_chain_collisions() {
        // A tiny bucket array forces chains.
        let descs = fixture(16);
        let resolve = |i: u32| &descs[i as usize];
        let hash = PageHash::new(1, 1);
        for i in 0..16u32 {
            let id = PageId::new(i, i);
            descs[i as usize].set_id(Some(id));
            hash.insert(&resolve, id, i);
        }
        for i in 0..16u32 {
            assert_eq!(hash.lookup(&resolve, PageId::new(i, i)), Some(i));
        }
        // Remove from the middle of a chain.
        for i in (0..16u32).step_by(2) {
            hash.remove(&resolve, PageId::new(i, i), i);
        }
        for i in 0..16u32 {
            let expect = if i % 2 == 0 { None } else { Some(i) };
            assert_eq!(hash.lookup(&resolve, PageId::new(i, i)), expect);
        }
    }

    #[test]
    fn test_replace_rewrites_chain() {
        let descs = fixture(4);
        let resolve = |i: u32| &descs[i as usize];
        let hash = PageHash::new(1, 1);
        let id_a = PageId::new(0, 0);
        let id_b = PageId::new(1, 1);
        descs[0].set_id(Some(id_a));
        descs[1].set_id(Some(id_b));
        hash.insert(&resolve, id_a, 0);
        hash.insert(&resolve, id_b, 1);

        // Relocate id_a's entry from descriptor 0 to descriptor 3.
        descs[3].set_id(Some(id_a));
        hash.replace(&resolve, id_a, 0, 3);
        descs[0].set_id(None);
        assert_eq!(hash.lookup(&resolve, id_a), Some(3));
        assert_eq!(hash.lookup(&resolve, id_b), Some(1));
    }
}

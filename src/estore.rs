//! Estore: a fixed array of `EBuckets` with aggregate bookkeeping.
//!
//! The expiration counterpart of `Kvstore`: items are routed to a bucket by
//! the caller, and a `FenwickIndex` of per-bucket counts lets sweeps step
//! over empty buckets in O(log n).

use crate::ebuckets::{EBuckets, EItem, ExpireAction, ExpireInfo};
use crate::error::ExpireError;
use crate::fenwick::FenwickIndex;
use tracing::debug;

pub struct Estore<I: EItem> {
    buckets: Vec<EBuckets<I::Id>>,
    num_buckets_bits: u32,
    count: usize,
    counts: FenwickIndex,
}

impl<I: EItem> Estore<I> {
    pub fn new(num_buckets_bits: u32) -> Self {
        assert!(num_buckets_bits <= 16, "too many buckets");
        Self {
            buckets: (0..1usize << num_buckets_bits)
                .map(|_| EBuckets::new())
                .collect(),
            num_buckets_bits,
            count: 0,
            counts: FenwickIndex::new(num_buckets_bits),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_buckets_bits(&self) -> u32 {
        self.num_buckets_bits
    }

    pub fn bucket_len(&self, eidx: usize) -> usize {
        self.buckets[eidx].len()
    }

    pub fn bucket(&self, eidx: usize) -> &EBuckets<I::Id> {
        &self.buckets[eidx]
    }

    fn account(&mut self, eidx: usize, before: usize) {
        let after = self.buckets[eidx].len();
        if after == before {
            return;
        }
        let delta = after as i64 - before as i64;
        self.count = (self.count as i64 + delta) as usize;
        self.counts.update(eidx, delta);
        if before == 0 || after == 0 {
            debug!(bucket = eidx, len = after, "estore bucket occupancy changed");
        }
    }

    pub fn add(&mut self, eidx: usize, item: &mut I, when: u64) -> Result<(), ExpireError> {
        let before = self.buckets[eidx].len();
        let id = item.id();
        self.buckets[eidx].add(id, item.expire_meta_mut(), when)?;
        self.account(eidx, before);
        Ok(())
    }

    /// Stops tracking `item`, returning its expiration time.
    pub fn remove(&mut self, eidx: usize, item: &mut I) -> Option<u64> {
        let before = self.buckets[eidx].len();
        let id = item.id();
        let when = self.buckets[eidx].remove(&id, item.expire_meta_mut())?;
        self.account(eidx, before);
        Some(when)
    }

    /// Moves a tracked item to `when`; the total count is unchanged.
    pub fn update(&mut self, eidx: usize, item: &mut I, when: u64) -> Result<(), ExpireError> {
        let id = item.id();
        self.buckets[eidx].update(&id, item.expire_meta_mut(), when)
    }

    /// Sweeps due items of one bucket; see `EBuckets::active_expire`.
    pub fn active_expire<F>(&mut self, eidx: usize, info: &mut ExpireInfo, f: F)
    where
        F: FnMut(&I::Id) -> ExpireAction,
    {
        let before = self.buckets[eidx].len();
        self.buckets[eidx].active_expire(info, f);
        self.account(eidx, before);
    }

    pub fn first_non_empty_bucket(&self) -> Option<usize> {
        self.counts.find_first_non_empty()
    }

    pub fn next_non_empty_bucket(&self, eidx: usize) -> Option<usize> {
        self.counts.find_next_non_empty(eidx)
    }

    pub fn next_expire_time(&self, eidx: usize) -> Option<u64> {
        self.buckets[eidx].next_expire_time()
    }

    /// Earliest expiration time across all buckets.
    pub fn min_expire_time(&self) -> Option<u64> {
        let mut min: Option<u64> = None;
        let mut cur = self.first_non_empty_bucket();
        while let Some(eidx) = cur {
            let t = self.buckets[eidx].next_expire_time();
            min = match (min, t) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            cur = self.next_non_empty_bucket(eidx);
        }
        min
    }

    /// Offers ids of one bucket for relocation; see `EBuckets::defrag`.
    pub fn defrag_bucket<F>(&mut self, eidx: usize, cursor: u64, max_ids: usize, f: F) -> u64
    where
        F: FnMut(&mut I::Id),
    {
        self.buckets[eidx].defrag(cursor, max_ids, f)
    }

    /// Stops tracking everything. Item metas are left to their owners.
    pub fn empty(&mut self) {
        for b in &mut self.buckets {
            b.clear();
        }
        self.count = 0;
        self.counts.clear();
    }

    pub fn mem_usage(&self) -> usize {
        core::mem::size_of::<Self>() + self.buckets.iter().map(|b| b.mem_usage()).sum::<usize>()
    }
}

//! Kvstore: a fixed array of `Dict` shards with aggregate bookkeeping.
//!
//! Callers route every key to a shard index themselves; the store never
//! hashes keys to pick a shard. On top of plain routing it keeps:
//!
//! - a total key count and a `FenwickIndex` of per-shard key counts, both
//!   updated in the same call as the shard mutation that changed them;
//! - the list of shards with a rehash in progress, so a periodic driver can
//!   finish idle rehashes with `incrementally_rehash`;
//! - the total number of allocated buckets and the bucket overhead of
//!   in-progress rehashes.
//!
//! Shards report rehash and bucket changes through their `DictType` hooks.
//! The store wraps the caller's type in `ShardType`, which records those
//! events, and drains them after every operation that may have produced any.

use crate::dict::{
    AddRaw, Dict, DictConfig, DictDefragFns, DictStats, DictType, Handle, Occupied, SafeIter,
};
use crate::error::DictError;
use crate::fenwick::FenwickIndex;
use core::borrow::Borrow;
use core::hash::Hash;
use rand::Rng;
use slotmap::DefaultKey;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::debug;

/// Shard allocation behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvstoreFlags {
    /// Create a shard's table on its first insert instead of up front.
    pub allocate_on_demand: bool,
    /// Release a shard's table once its last key is removed.
    pub free_empty_shards: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RehashEvent {
    Started { from: usize },
    Completed { from: usize },
}

/// `DictType` installed on every shard: forwards to the caller's type and
/// records what the store needs to keep its aggregates.
#[derive(Debug)]
pub struct ShardType<T> {
    inner: T,
    events: Vec<RehashEvent>,
    bucket_delta: i64,
}

impl<T> ShardType<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            events: Vec::new(),
            bucket_delta: 0,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: DictType> DictType for ShardType<T> {
    #[inline]
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        self.inner.hash(key)
    }

    fn resize_allowed(&self, more_mem: usize, used_ratio: f64) -> bool {
        self.inner.resize_allowed(more_mem, used_ratio)
    }

    fn rehashing_started(&mut self, from: usize, to: usize) {
        self.inner.rehashing_started(from, to);
        self.events.push(RehashEvent::Started { from });
    }

    fn rehashing_completed(&mut self, from: usize, to: usize) {
        self.inner.rehashing_completed(from, to);
        self.events.push(RehashEvent::Completed { from });
    }

    fn bucket_count_changed(&mut self, delta: i64) {
        self.inner.bucket_count_changed(delta);
        self.bucket_delta += delta;
    }
}

pub type Shard<K, V, T> = Dict<K, V, ShardType<T>>;

pub struct Kvstore<K, V, T> {
    ty: T,
    config: DictConfig,
    flags: KvstoreFlags,
    shards: Vec<Option<Box<Shard<K, V, T>>>>,
    num_shards_bits: u32,
    key_count: usize,
    non_empty: usize,
    allocated: usize,
    bucket_count: usize,
    /// Old-table buckets of the rehashes in progress.
    rehashing_buckets: usize,
    rehashing: VecDeque<usize>,
    resize_cursor: usize,
    counts: FenwickIndex,
}

impl<K, V, T> Kvstore<K, V, T>
where
    K: Eq + Hash,
    T: DictType + Clone,
{
    /// Store of `2^num_shards_bits` shards, each created with a clone of `ty`.
    pub fn new(ty: T, num_shards_bits: u32, flags: KvstoreFlags) -> Self {
        Self::with_config(ty, num_shards_bits, flags, DictConfig::default())
    }

    pub fn with_config(ty: T, num_shards_bits: u32, flags: KvstoreFlags, config: DictConfig) -> Self {
        assert!(num_shards_bits <= 16, "too many shards");
        let n = 1usize << num_shards_bits;
        let mut kvs = Self {
            ty,
            config,
            flags,
            shards: (0..n).map(|_| None).collect(),
            num_shards_bits,
            key_count: 0,
            non_empty: 0,
            allocated: 0,
            bucket_count: 0,
            rehashing_buckets: 0,
            rehashing: VecDeque::new(),
            resize_cursor: 0,
            counts: FenwickIndex::new(num_shards_bits),
        };
        if !flags.allocate_on_demand {
            for didx in 0..n {
                kvs.create_if_needed(didx);
            }
        }
        kvs
    }

    pub fn flags(&self) -> KvstoreFlags {
        self.flags
    }

    // ------------------------------------------------------------------
    // Shard lifecycle and bookkeeping
    // ------------------------------------------------------------------

    fn create_if_needed(&mut self, didx: usize) -> &mut Shard<K, V, T> {
        if self.shards[didx].is_none() {
            self.allocated += 1;
            debug!(shard = didx, "kvstore shard allocated");
        }
        let (ty, config) = (&self.ty, self.config);
        self.shards[didx]
            .get_or_insert_with(|| Box::new(Dict::with_config(ShardType::new(ty.clone()), config)))
    }

    fn free_if_needed(&mut self, didx: usize) {
        if !self.flags.free_empty_shards {
            return;
        }
        let Some(d) = self.shards[didx].as_deref_mut() else {
            return;
        };
        if !d.is_empty() || d.unlinked_len() > 0 || d.is_rehashing_paused() {
            return;
        }
        d.clear();
        self.sync(didx);
        self.shards[didx] = None;
        self.allocated -= 1;
        debug!(shard = didx, "kvstore shard freed");
    }

    /// Applies the rehash and bucket events a shard recorded.
    fn sync(&mut self, didx: usize) {
        let Some(d) = self.shards[didx].as_deref_mut() else {
            return;
        };
        let ty = d.dict_type_mut();
        let delta = core::mem::take(&mut ty.bucket_delta);
        let events = core::mem::take(&mut ty.events);
        self.bucket_count = (self.bucket_count as i64 + delta) as usize;
        for ev in events {
            match ev {
                RehashEvent::Started { from } => {
                    self.rehashing.push_back(didx);
                    self.rehashing_buckets += from;
                }
                RehashEvent::Completed { from } => {
                    if let Some(pos) = self.rehashing.iter().position(|&i| i == didx) {
                        self.rehashing.remove(pos);
                    }
                    self.rehashing_buckets = self.rehashing_buckets.saturating_sub(from);
                }
            }
        }
    }

    fn shard_len_raw(&self, didx: usize) -> usize {
        self.shards[didx].as_ref().map_or(0, |d| d.len())
    }

    /// Folds a change of shard `didx` from `before` keys into the aggregates.
    fn account(&mut self, didx: usize, before: usize) {
        self.sync(didx);
        let after = self.shard_len_raw(didx);
        if after == before {
            return;
        }
        let delta = after as i64 - before as i64;
        self.key_count = (self.key_count as i64 + delta) as usize;
        if before == 0 {
            self.non_empty += 1;
        } else if after == 0 {
            self.non_empty -= 1;
        }
        self.counts.update(didx, delta);
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Total keys across shards.
    pub fn len(&self) -> usize {
        self.key_count
    }

    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn num_shards_bits(&self) -> u32 {
        self.num_shards_bits
    }

    pub fn num_non_empty_shards(&self) -> usize {
        self.non_empty
    }

    pub fn num_allocated_shards(&self) -> usize {
        self.allocated
    }

    /// Buckets allocated across all shards, both tables included.
    pub fn buckets(&self) -> usize {
        self.bucket_count
    }

    /// Number of shards with a rehash in progress.
    pub fn rehashing_count(&self) -> usize {
        self.rehashing.len()
    }

    /// Bytes of the shard lookup table.
    pub fn overhead_lut(&self) -> usize {
        self.shards.len() * core::mem::size_of::<Option<Box<Shard<K, V, T>>>>()
    }

    /// Bytes held by old tables still being drained.
    pub fn overhead_rehashing(&self) -> usize {
        self.rehashing_buckets * core::mem::size_of::<Option<DefaultKey>>()
    }

    pub fn mem_usage(&self) -> usize {
        let shards: usize = self
            .shards
            .iter()
            .flatten()
            .map(|d| core::mem::size_of::<Shard<K, V, T>>() + d.mem_usage())
            .sum();
        core::mem::size_of::<Self>() + self.overhead_lut() + shards
    }

    pub fn shard(&self, didx: usize) -> Option<&Shard<K, V, T>> {
        self.shards[didx].as_deref()
    }

    pub fn shard_len(&self, didx: usize) -> usize {
        self.counts.value_at(didx) as usize
    }

    pub fn first_non_empty_shard(&self) -> Option<usize> {
        self.counts.find_first_non_empty()
    }

    pub fn next_non_empty_shard(&self, didx: usize) -> Option<usize> {
        self.counts.find_next_non_empty(didx)
    }

    /// Shard holding the `target`-th key (1-based) in shard order.
    ///
    /// Returns 0 for an empty or single-shard store.
    pub fn find_shard_index_by_key_index(&self, target: u64) -> usize {
        if self.shards.len() == 1 || self.key_count == 0 {
            return 0;
        }
        assert!(
            target <= self.key_count as u64,
            "key index {target} past the {} stored keys",
            self.key_count
        );
        self.counts.find_index(target)
    }

    /// Random shard, weighted by key count.
    pub fn fair_random_shard_index(&self) -> usize {
        if self.key_count == 0 {
            return 0;
        }
        let target = rand::thread_rng().gen_range(1..=self.key_count as u64);
        self.find_shard_index_by_key_index(target)
    }

    pub fn stats(&self, full: bool) -> DictStats {
        let mut total = DictStats::default();
        for d in self.shards.iter().flatten() {
            total.merge(&d.stats(full));
        }
        total
    }

    // ------------------------------------------------------------------
    // Per-shard operations
    // ------------------------------------------------------------------

    pub fn add(&mut self, didx: usize, key: K, value: V) -> Result<Handle, Occupied<K, V>> {
        let before = self.shard_len_raw(didx);
        let res = self.create_if_needed(didx).add(key, value);
        self.account(didx, before);
        res
    }

    pub fn add_raw<F>(&mut self, didx: usize, key: K, default: F) -> AddRaw
    where
        F: FnOnce() -> V,
    {
        let before = self.shard_len_raw(didx);
        let res = self.create_if_needed(didx).add_raw(key, default);
        self.account(didx, before);
        res
    }

    /// Inserts or overwrites. Returns true when the key was new.
    pub fn replace(&mut self, didx: usize, key: K, value: V) -> bool {
        let before = self.shard_len_raw(didx);
        let res = self.create_if_needed(didx).replace(key, value);
        self.account(didx, before);
        res
    }

    pub fn find<Q>(&mut self, didx: usize, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.shards[didx].as_deref_mut()?.find(q);
        self.sync(didx);
        h
    }

    pub fn fetch_mut<Q>(&mut self, didx: usize, q: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.find(didx, q)?;
        self.value_mut(didx, h)
    }

    /// Read-only lookup; never advances rehashing.
    pub fn get<Q>(&self, didx: usize, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shards[didx].as_deref()?.get(q)
    }

    pub fn contains_key<Q>(&self, didx: usize, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get(didx, q).is_some()
    }

    pub fn key(&self, didx: usize, h: Handle) -> Option<&K> {
        self.shards[didx].as_deref()?.key(h)
    }

    pub fn value(&self, didx: usize, h: Handle) -> Option<&V> {
        self.shards[didx].as_deref()?.value(h)
    }

    pub fn value_mut(&mut self, didx: usize, h: Handle) -> Option<&mut V> {
        self.shards[didx].as_deref_mut()?.value_mut(h)
    }

    pub fn set_value(&mut self, didx: usize, h: Handle, value: V) -> Option<V> {
        self.shards[didx].as_deref_mut()?.set_value(h, value)
    }

    pub fn delete<Q>(&mut self, didx: usize, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let before = self.shard_len_raw(didx);
        let res = self.shards[didx].as_deref_mut()?.delete(q);
        self.account(didx, before);
        self.free_if_needed(didx);
        res
    }

    /// First phase of a two-phase delete; see `Dict::unlink`.
    pub fn unlink<Q>(&mut self, didx: usize, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let before = self.shard_len_raw(didx);
        let res = self.shards[didx].as_deref_mut()?.unlink(q);
        self.account(didx, before);
        res
    }

    pub fn free_unlinked(&mut self, didx: usize, h: Handle) -> Option<(K, V)> {
        let res = self.shards[didx].as_deref_mut()?.free_unlinked(h);
        self.free_if_needed(didx);
        res
    }

    pub fn random_key(&mut self, didx: usize) -> Option<Handle> {
        let h = self.shards[didx].as_deref_mut()?.random_key();
        self.sync(didx);
        h
    }

    pub fn fair_random_key(&mut self, didx: usize) -> Option<Handle> {
        let h = self.shards[didx].as_deref_mut()?.fair_random_key();
        self.sync(didx);
        h
    }

    pub fn some_keys(&mut self, didx: usize, count: usize) -> Vec<Handle> {
        let Some(d) = self.shards[didx].as_deref_mut() else {
            return Vec::new();
        };
        let out = d.some_keys(count);
        self.sync(didx);
        out
    }

    pub fn pause_rehashing(&mut self, didx: usize) {
        if let Some(d) = self.shards[didx].as_deref_mut() {
            d.pause_rehashing();
        }
    }

    pub fn resume_rehashing(&mut self, didx: usize) {
        if let Some(d) = self.shards[didx].as_deref_mut() {
            d.resume_rehashing();
        }
        self.free_if_needed(didx);
    }

    // ------------------------------------------------------------------
    // Store-wide operations
    // ------------------------------------------------------------------

    /// Expands every shard not rejected by `skip` to hold `size` keys.
    ///
    /// Refusals that leave a shard as is (already large enough, rehash in
    /// progress) are ignored; an allocation failure stops the walk.
    pub fn expand<S>(&mut self, size: usize, try_alloc: bool, mut skip: S) -> Result<(), DictError>
    where
        S: FnMut(usize) -> bool,
    {
        for didx in 0..self.shards.len() {
            if skip(didx) {
                continue;
            }
            let d = self.create_if_needed(didx);
            let res = if try_alloc {
                d.try_expand(size)
            } else {
                d.expand(size)
            };
            self.sync(didx);
            if let Err(e @ DictError::AllocFailed { .. }) = res {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Rehashes shards from the rehashing list until `budget_us` is spent.
    ///
    /// Each listed shard gets at most one turn per call, so shards whose
    /// rehash cannot progress (paused, blocked by policy) do not spin.
    /// Returns elapsed microseconds.
    pub fn incrementally_rehash(&mut self, budget_us: u64) -> u64 {
        if self.rehashing.is_empty() {
            return 0;
        }
        let start = Instant::now();
        let pending: Vec<usize> = self.rehashing.iter().copied().collect();
        for didx in pending {
            let elapsed = start.elapsed().as_micros() as u64;
            if elapsed >= budget_us {
                break;
            }
            if let Some(d) = self.shards[didx].as_deref_mut() {
                d.rehash_microseconds(budget_us - elapsed);
            }
            self.sync(didx);
        }
        start.elapsed().as_micros() as u64
    }

    /// Gives up to `limit` shards, round robin, a chance to shrink or grow.
    pub fn try_resize_shards(&mut self, limit: usize) {
        let n = self.shards.len();
        for _ in 0..limit.min(n) {
            let didx = self.resize_cursor;
            if let Some(d) = self.shards[didx].as_deref_mut() {
                if !d.shrink_if_needed() {
                    d.expand_if_needed();
                }
                self.sync(didx);
            }
            self.resize_cursor = (didx + 1) % n;
        }
    }

    /// Clears every shard, calling `callback` periodically during long
    /// clears.
    pub fn empty<F: FnMut()>(&mut self, mut callback: F) {
        for didx in 0..self.shards.len() {
            if let Some(d) = self.shards[didx].as_deref_mut() {
                d.empty(&mut callback);
                self.sync(didx);
                self.free_if_needed(didx);
            }
        }
        self.rehashing.clear();
        self.rehashing_buckets = 0;
        self.key_count = 0;
        self.non_empty = 0;
        self.resize_cursor = 0;
        self.counts.clear();
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    fn split_cursor(&self, cursor: u64) -> (usize, u64) {
        if self.num_shards_bits == 0 {
            return (0, cursor);
        }
        let shift = 64 - self.num_shards_bits;
        ((cursor >> shift) as usize, cursor & ((1u64 << shift) - 1))
    }

    fn join_cursor(&self, didx: usize, cursor: u64) -> u64 {
        if self.num_shards_bits == 0 {
            return cursor;
        }
        ((didx as u64) << (64 - self.num_shards_bits)) | cursor
    }

    /// One scan step across the store.
    ///
    /// The shard index travels in the top `num_shards_bits` bits of the
    /// cursor and the shard's own cursor in the rest. When a shard's scan
    /// completes the cursor moves on to the next non-empty shard. With
    /// `only_shard` the scan stays on that shard and returns 0 once it is
    /// done. Shards for which `skip` returns true are passed over.
    pub fn scan<F, S>(&mut self, cursor: u64, only_shard: Option<usize>, mut f: F, mut skip: S) -> u64
    where
        F: FnMut(&K, &mut V),
        S: FnMut(usize) -> bool,
    {
        let (mut didx, mut inner) = self.split_cursor(cursor);
        if let Some(only) = only_shard {
            didx = only;
        }
        let skipped = self.shards[didx].is_none() || skip(didx);
        if !skipped {
            if let Some(d) = self.shards[didx].as_deref_mut() {
                inner = d.scan(inner, &mut f);
            }
            self.sync(didx);
            self.free_if_needed(didx);
        }
        if skipped || inner == 0 {
            if only_shard.is_some() {
                return 0;
            }
            match self.next_non_empty_shard(didx) {
                Some(next) => {
                    didx = next;
                    inner = 0;
                }
                None => return 0,
            }
        }
        self.join_cursor(didx, inner)
    }

    /// `Dict::scan_defrag` on one shard. Returns the shard-level cursor.
    pub fn scan_shard_defrag<D>(&mut self, didx: usize, cursor: u64, defrag: &mut D) -> u64
    where
        D: DictDefragFns<K, V>,
    {
        let Some(d) = self.shards[didx].as_deref_mut() else {
            return 0;
        };
        let next = d.scan_defrag(cursor, defrag);
        self.sync(didx);
        next
    }

    /// Offers the shard lookup table and the shard at `cursor` for
    /// relocation. Returns the next cursor, 0 once every shard was visited.
    ///
    /// `should_move` receives the address of each candidate allocation.
    pub fn lut_defrag<F>(&mut self, cursor: usize, mut should_move: F) -> usize
    where
        F: FnMut(usize) -> bool,
    {
        if cursor == 0 && should_move(self.shards.as_ptr() as usize) {
            let mut fresh = Vec::with_capacity(self.shards.len());
            fresh.extend(self.shards.drain(..));
            self.shards = fresh;
        }
        let mut didx = cursor;
        while didx < self.shards.len() && self.shards[didx].is_none() {
            didx += 1;
        }
        if didx >= self.shards.len() {
            return 0;
        }
        let addr = self.shards[didx]
            .as_deref()
            .map_or(0, |d| d as *const Shard<K, V, T> as usize);
        if should_move(addr) {
            if let Some(old) = self.shards[didx].take() {
                self.shards[didx] = Some(Box::new(*old));
            }
        }
        if let Some(d) = self.shards[didx].as_deref_mut() {
            d.defrag_tables(&mut should_move);
        }
        (didx + 1) % self.shards.len()
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Detached iterator over every key, shard by shard.
    pub fn iter(&self) -> KvstoreIter {
        KvstoreIter {
            didx: None,
            started: false,
            inner: None,
            released: false,
        }
    }
}

/// Cross-shard iterator that only visits non-empty shards.
///
/// The shard being walked has its rehashing paused, so entries may be
/// deleted through the store between calls. Must be handed back through
/// `release`.
#[derive(Debug)]
pub struct KvstoreIter {
    didx: Option<usize>,
    started: bool,
    inner: Option<SafeIter>,
    released: bool,
}

impl KvstoreIter {
    pub fn current_shard_index(&self) -> Option<usize> {
        self.didx
    }

    pub fn next<K, V, T>(&mut self, kvs: &mut Kvstore<K, V, T>) -> Option<(usize, Handle)>
    where
        K: Eq + Hash,
        T: DictType + Clone,
    {
        loop {
            if let (Some(didx), Some(it)) = (self.didx, self.inner.as_mut()) {
                if let Some(d) = kvs.shards[didx].as_deref() {
                    if let Some(h) = it.next(d) {
                        return Some((didx, h));
                    }
                }
                self.close_shard(kvs);
            }
            let next = if self.started {
                self.didx.and_then(|i| kvs.next_non_empty_shard(i))
            } else {
                kvs.first_non_empty_shard()
            };
            self.started = true;
            let Some(didx) = next else {
                self.didx = None;
                return None;
            };
            self.didx = Some(didx);
            let d = kvs.shards[didx].as_deref_mut()?;
            self.inner = Some(d.safe_iter());
        }
    }

    fn close_shard<K, V, T>(&mut self, kvs: &mut Kvstore<K, V, T>)
    where
        K: Eq + Hash,
        T: DictType + Clone,
    {
        let (Some(didx), Some(it)) = (self.didx, self.inner.take()) else {
            return;
        };
        if let Some(d) = kvs.shards[didx].as_deref_mut() {
            it.release(d);
        }
        kvs.free_if_needed(didx);
    }

    pub fn release<K, V, T>(mut self, kvs: &mut Kvstore<K, V, T>)
    where
        K: Eq + Hash,
        T: DictType + Clone,
    {
        self.close_shard(kvs);
        self.released = true;
    }
}

impl Drop for KvstoreIter {
    fn drop(&mut self) {
        if !self.released && !std::thread::panicking() {
            panic!("KvstoreIter dropped without release");
        }
    }
}

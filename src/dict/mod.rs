//! Dict: chained hash table with incremental rehashing.
//!
//! Entries live in a generational arena (`SlotMap`); buckets hold the head
//! of an intrusive singly linked chain of arena keys. Two bucket arrays
//! exist while a rehash is in progress: `ht[0]` is being drained into
//! `ht[1]` one bucket at a time, and `rehash_idx` marks how far the drain
//! has gone. Buckets of `ht[0]` below `rehash_idx` are always empty.
//!
//! Moving an entry between tables only relinks arena keys, so a `Handle`
//! stays valid across rehashing; it is invalidated only when its entry is
//! removed from the arena.

mod iter;
mod random;
mod scan;
mod stats;

pub use iter::{Iter, IterMut, SafeIter, UnsafeIter};
pub use scan::DictDefragFns;
pub use stats::{DictStats, TableStats};

use crate::error::{ConfigError, DictError};
use crate::pause::PauseCount;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;
use std::time::Instant;
use tracing::debug;

/// Smallest non-zero bucket count.
pub const INITIAL_SIZE: usize = 4;

/// Entries freed between callback invocations in `empty`.
const EMPTY_CALLBACK_PERIOD: usize = 65536;

/// Stable reference to an entry of a `Dict`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

impl Handle {
    pub(crate) fn new(k: DefaultKey) -> Self {
        Handle(k)
    }
    pub(crate) fn raw_handle(&self) -> DefaultKey {
        self.0
    }

    pub fn key<'a, K, V, T>(&self, dict: &'a Dict<K, V, T>) -> Option<&'a K>
    where
        K: Eq + Hash,
        T: DictType,
    {
        dict.key(*self)
    }

    pub fn value<'a, K, V, T>(&self, dict: &'a Dict<K, V, T>) -> Option<&'a V>
    where
        K: Eq + Hash,
        T: DictType,
    {
        dict.value(*self)
    }

    pub fn value_mut<'a, K, V, T>(&self, dict: &'a mut Dict<K, V, T>) -> Option<&'a mut V>
    where
        K: Eq + Hash,
        T: DictType,
    {
        dict.value_mut(*self)
    }
}

/// Per-table behavior: hashing, resize veto, and resize notifications.
///
/// Key comparison is `Eq`, and key/value destruction is `Drop`.
pub trait DictType {
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64;

    /// Veto for a resize that needs `more_mem` bytes of buckets while the
    /// table is at `used_ratio` entries per bucket.
    fn resize_allowed(&self, _more_mem: usize, _used_ratio: f64) -> bool {
        true
    }

    fn rehashing_started(&mut self, _from: usize, _to: usize) {}

    fn rehashing_completed(&mut self, _from: usize, _to: usize) {}

    /// Called with the signed change of allocated buckets.
    fn bucket_count_changed(&mut self, _delta: i64) {}
}

/// `DictType` backed by a `BuildHasher` with no hooks.
#[derive(Clone, Debug, Default)]
pub struct DefaultType<S = RandomState> {
    hasher: S,
}

impl<S> DefaultType<S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self { hasher }
    }
}

impl<S: BuildHasher> DictType for DefaultType<S> {
    #[inline]
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }
}

/// Process-wide resizing mode, typically switched while a fork child runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResizePolicy {
    #[default]
    Enable,
    /// Resize and step only when the load is far off (see `DictConfig`).
    Avoid,
    Forbid,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DictConfig {
    pub resize_policy: ResizePolicy,
    /// Load factor that forces growth even under `ResizePolicy::Avoid`.
    pub force_resize_ratio: usize,
    /// Shrink once fewer than `1 / min_fill` of the buckets are used.
    pub min_fill: usize,
}

impl Default for DictConfig {
    fn default() -> Self {
        Self {
            resize_policy: ResizePolicy::Enable,
            force_resize_ratio: 4,
            min_fill: 8,
        }
    }
}

impl DictConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.force_resize_ratio < 2 {
            return Err(ConfigError::new("force_resize_ratio must be at least 2"));
        }
        if self.min_fill < 2 {
            return Err(ConfigError::new("min_fill must be at least 2"));
        }
        Ok(())
    }
}

/// Duplicate key on `add`: the existing entry plus the rejected pair.
#[derive(Debug)]
pub struct Occupied<K, V> {
    pub existing: Handle,
    pub key: K,
    pub value: V,
}

/// Outcome of `add_raw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRaw {
    Inserted(Handle),
    Existing(Handle),
}

impl AddRaw {
    pub fn handle(&self) -> Handle {
        match *self {
            AddRaw::Inserted(h) | AddRaw::Existing(h) => h,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, AddRaw::Inserted(_))
    }
}

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u64,
    next: Option<DefaultKey>,
    linked: bool,
}

#[derive(Debug, Default, Clone)]
struct Table {
    buckets: Vec<Option<DefaultKey>>,
    used: usize,
}

impl Table {
    #[inline]
    fn size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buckets.len().wrapping_sub(1)
    }
}

pub struct Dict<K, V, T = DefaultType> {
    ty: T,
    entries: SlotMap<DefaultKey, Entry<K, V>>,
    ht: [Table; 2],
    rehash_idx: Option<usize>,
    pause_rehash: PauseCount,
    pause_auto_resize: PauseCount,
    config: DictConfig,
}

impl<K, V> Dict<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_type(DefaultType::default())
    }
}

impl<K, V> Default for Dict<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, T> Dict<K, V, T>
where
    K: Eq + Hash,
    T: DictType,
{
    pub fn with_type(ty: T) -> Self {
        Self::with_config(ty, DictConfig::default())
    }

    pub fn with_config(ty: T, config: DictConfig) -> Self {
        Self {
            ty,
            entries: SlotMap::with_key(),
            ht: [Table::default(), Table::default()],
            rehash_idx: None,
            pause_rehash: PauseCount::new(),
            pause_auto_resize: PauseCount::new(),
            config,
        }
    }

    pub fn dict_type(&self) -> &T {
        &self.ty
    }

    pub fn dict_type_mut(&mut self) -> &mut T {
        &mut self.ty
    }

    pub fn config(&self) -> &DictConfig {
        &self.config
    }

    pub fn set_resize_policy(&mut self, policy: ResizePolicy) {
        self.config.resize_policy = policy;
    }

    /// Number of linked entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.ht[0].used + self.ht[1].used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries unlinked but not yet released through `free_unlinked`.
    #[inline]
    pub fn unlinked_len(&self) -> usize {
        self.entries.len() - self.len()
    }

    /// Total buckets across both tables.
    #[inline]
    pub fn buckets(&self) -> usize {
        self.ht[0].size() + self.ht[1].size()
    }

    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx.is_some()
    }

    /// `(from, to)` bucket counts of the rehash in progress.
    pub fn rehashing_info(&self) -> Option<(usize, usize)> {
        self.rehash_idx
            .map(|_| (self.ht[0].size(), self.ht[1].size()))
    }

    pub fn pause_rehashing(&mut self) {
        self.pause_rehash.pause();
    }

    pub fn resume_rehashing(&mut self) {
        self.pause_rehash.resume();
    }

    pub fn is_rehashing_paused(&self) -> bool {
        self.pause_rehash.is_paused()
    }

    pub fn pause_auto_resize(&mut self) {
        self.pause_auto_resize.pause();
    }

    /// Resumes automatic resizing and applies any shrink deferred meanwhile.
    pub fn resume_auto_resize(&mut self) {
        self.pause_auto_resize.resume();
        if !self.pause_auto_resize.is_paused() {
            self.shrink_if_needed();
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn mem_usage(&self) -> usize {
        self.buckets() * core::mem::size_of::<Option<DefaultKey>>()
            + self.len() * core::mem::size_of::<Entry<K, V>>()
    }

    // ------------------------------------------------------------------
    // Resizing
    // ------------------------------------------------------------------

    /// Starts growing to hold at least `size` entries.
    pub fn expand(&mut self, size: usize) -> Result<(), DictError> {
        self.expand_inner(size, false)
    }

    /// Like `expand`, but reports allocation failure instead of aborting.
    pub fn try_expand(&mut self, size: usize) -> Result<(), DictError> {
        self.expand_inner(size, true)
    }

    fn expand_inner(&mut self, size: usize, try_alloc: bool) -> Result<(), DictError> {
        if self.is_rehashing() {
            return Err(DictError::Rehashing);
        }
        if self.ht[0].used > size {
            return Err(DictError::InvalidSize {
                requested: size,
                used: self.ht[0].used,
            });
        }
        if self.ht[0].size() >= size {
            return Err(DictError::Unchanged {
                requested: size,
                buckets: self.ht[0].size(),
            });
        }
        self.resize(size, try_alloc)
    }

    /// Starts shrinking to `size` buckets (rounded up to a power of two).
    pub fn shrink(&mut self, size: usize) -> Result<(), DictError> {
        if self.is_rehashing() {
            return Err(DictError::Rehashing);
        }
        if self.ht[0].used > size {
            return Err(DictError::InvalidSize {
                requested: size,
                used: self.ht[0].used,
            });
        }
        if self.ht[0].size() <= size {
            return Err(DictError::Unchanged {
                requested: size,
                buckets: self.ht[0].size(),
            });
        }
        self.resize(size, false)
    }

    /// Grows the table when the load factor calls for it.
    ///
    /// Returns true when a resize was started by this call.
    pub fn expand_if_needed(&mut self) -> bool {
        if self.is_rehashing() {
            return false;
        }
        if self.ht[0].size() == 0 {
            return self.resize(INITIAL_SIZE, false).is_ok();
        }
        let used = self.ht[0].used;
        let size = self.ht[0].size();
        let policy = self.config.resize_policy;
        let wanted = (policy == ResizePolicy::Enable && used >= size)
            || (policy != ResizePolicy::Forbid
                && used >= self.config.force_resize_ratio.saturating_mul(size));
        if !wanted || !self.type_resize_allowed(used + 1) {
            return false;
        }
        self.resize(used + 1, false).is_ok()
    }

    /// Shrinks the table when it has become sparse.
    ///
    /// Returns true when a resize was started by this call.
    pub fn shrink_if_needed(&mut self) -> bool {
        if self.is_rehashing() {
            return false;
        }
        let size = self.ht[0].size();
        if size <= INITIAL_SIZE {
            return false;
        }
        let used = self.ht[0].used;
        let policy = self.config.resize_policy;
        let min_fill = self.config.min_fill;
        let wanted = (policy == ResizePolicy::Enable && used.saturating_mul(min_fill) <= size)
            || (policy != ResizePolicy::Forbid
                && used
                    .saturating_mul(min_fill)
                    .saturating_mul(self.config.force_resize_ratio)
                    <= size);
        if !wanted || !self.type_resize_allowed(used) {
            return false;
        }
        self.resize(used, false).is_ok()
    }

    fn auto_expand(&mut self) {
        if self.ht[0].size() == 0 || !self.pause_auto_resize.is_paused() {
            self.expand_if_needed();
        }
    }

    fn auto_shrink(&mut self) {
        if !self.pause_auto_resize.is_paused() {
            self.shrink_if_needed();
        }
    }

    fn type_resize_allowed(&self, size: usize) -> bool {
        let Some(buckets) = next_size(size) else {
            return false;
        };
        let more_mem = buckets.saturating_mul(core::mem::size_of::<Option<DefaultKey>>());
        let ratio = if self.ht[0].size() == 0 {
            0.0
        } else {
            self.ht[0].used as f64 / self.ht[0].size() as f64
        };
        self.ty.resize_allowed(more_mem, ratio)
    }

    fn resize(&mut self, size: usize, try_alloc: bool) -> Result<(), DictError> {
        assert!(!self.is_rehashing(), "resize requested while rehashing");
        let new_size = next_size(size).ok_or(DictError::AllocFailed { buckets: size })?;
        if new_size == self.ht[0].size() {
            return Err(DictError::Unchanged {
                requested: size,
                buckets: new_size,
            });
        }
        let buckets = alloc_buckets(new_size, try_alloc)?;
        let from = self.ht[0].size();
        self.ht[1] = Table { buckets, used: 0 };
        self.rehash_idx = Some(0);
        self.ty.bucket_count_changed(new_size as i64);
        self.ty.rehashing_started(from, new_size);

        // First allocation or empty table: nothing to migrate.
        if from == 0 || self.ht[0].used == 0 {
            self.ty.rehashing_completed(from, new_size);
            self.ht[0] = core::mem::take(&mut self.ht[1]);
            self.rehash_idx = None;
            if from > 0 {
                self.ty.bucket_count_changed(-(from as i64));
            }
            return Ok(());
        }
        debug!(from, to = new_size, used = self.ht[0].used, "dict rehash started");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rehashing
    // ------------------------------------------------------------------

    fn rehash_allowed(&self) -> bool {
        let (s0, s1) = (self.ht[0].size(), self.ht[1].size());
        let ratio = self.config.force_resize_ratio;
        match self.config.resize_policy {
            ResizePolicy::Enable => true,
            ResizePolicy::Forbid => false,
            ResizePolicy::Avoid => {
                let grow_blocked = s1 > s0 && s1 < ratio.saturating_mul(s0);
                let shrink_blocked =
                    s1 < s0 && s0 < self.config.min_fill.saturating_mul(ratio).saturating_mul(s1);
                !(grow_blocked || shrink_blocked)
            }
        }
    }

    /// Migrates up to `n` non-empty buckets, visiting at most `10 * n` empty
    /// ones. Returns true while a rehash is still in progress.
    pub fn rehash(&mut self, n: usize) -> bool {
        let Some(mut idx) = self.rehash_idx else {
            return false;
        };
        if !self.rehash_allowed() {
            return true;
        }
        let mut empty_visits = n.saturating_mul(10);
        let mut n = n;
        while n > 0 && self.ht[0].used != 0 {
            assert!(idx < self.ht[0].size(), "rehash index past the old table");
            while self.ht[0].buckets[idx].is_none() {
                idx += 1;
                self.rehash_idx = Some(idx);
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }
            self.rehash_bucket(idx);
            idx += 1;
            self.rehash_idx = Some(idx);
            n -= 1;
        }
        !self.check_rehash_completed()
    }

    /// Rehashes in batches of 100 buckets until `budget_us` microseconds
    /// have elapsed or the rehash completes. Returns elapsed microseconds.
    pub fn rehash_microseconds(&mut self, budget_us: u64) -> u64 {
        if !self.is_rehashing() || self.pause_rehash.is_paused() || !self.rehash_allowed() {
            return 0;
        }
        let start = Instant::now();
        while self.rehash(100) {
            if start.elapsed().as_micros() as u64 >= budget_us {
                break;
            }
        }
        start.elapsed().as_micros() as u64
    }

    /// Drives a started rehash to completion in 1000-bucket steps.
    ///
    /// Does not start a rehash and honors the resize policy; returns
    /// whether a rehash is still pending afterwards.
    pub fn rehash_to_completion(&mut self) -> bool {
        while self.is_rehashing() && self.rehash_allowed() {
            self.rehash(1000);
        }
        self.is_rehashing()
    }

    fn rehash_step(&mut self) {
        if self.is_rehashing() && !self.pause_rehash.is_paused() {
            self.rehash(1);
        }
    }

    /// One step of background rehash, triggered by a lookup or mutation
    /// that touched `visited` (an index into the old table).
    fn rehash_step_if_needed(&mut self, visited: usize) {
        let Some(idx) = self.rehash_idx else {
            return;
        };
        if self.pause_rehash.is_paused() {
            return;
        }
        if visited >= idx && visited < self.ht[0].size() && self.ht[0].buckets[visited].is_some()
        {
            if self.rehash_allowed() {
                self.rehash_bucket(visited);
                self.check_rehash_completed();
            }
        } else {
            self.rehash(1);
        }
    }

    fn rehash_bucket(&mut self, idx: usize) {
        let mask1 = self.ht[1].mask();
        let mut cur = self.ht[0].buckets[idx].take();
        while let Some(k) = cur {
            let e = &mut self.entries[k];
            cur = e.next;
            let dst = (e.hash as usize) & mask1;
            e.next = self.ht[1].buckets[dst];
            self.ht[1].buckets[dst] = Some(k);
            self.ht[0].used -= 1;
            self.ht[1].used += 1;
        }
    }

    fn check_rehash_completed(&mut self) -> bool {
        if self.rehash_idx.is_none() || self.ht[0].used != 0 {
            return false;
        }
        let (from, to) = (self.ht[0].size(), self.ht[1].size());
        self.ty.rehashing_completed(from, to);
        self.ht[0] = core::mem::take(&mut self.ht[1]);
        self.rehash_idx = None;
        self.ty.bucket_count_changed(-(from as i64));
        debug!(from, to, "dict rehash completed");
        true
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    #[inline]
    fn old_index(&self, hash: u64) -> usize {
        (hash as usize) & self.ht[0].mask()
    }

    fn search<Q>(&self, hash: u64, q: &Q) -> Option<DefaultKey>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        if self.is_empty() {
            return None;
        }
        for t in 0..2 {
            let table = &self.ht[t];
            if table.size() == 0 {
                continue;
            }
            let idx = (hash as usize) & table.mask();
            if t == 0 && self.rehash_idx.is_some_and(|r| idx < r) {
                continue;
            }
            let mut cur = table.buckets[idx];
            while let Some(k) = cur {
                let e = &self.entries[k];
                if e.hash == hash && e.key.borrow() == q {
                    return Some(k);
                }
                cur = e.next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Finds `q`, advancing a pending rehash by one step.
    pub fn find<Q>(&mut self, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.is_empty() {
            return None;
        }
        let hash = self.ty.hash(q);
        self.rehash_step_if_needed(self.old_index(hash));
        self.search(hash, q).map(Handle::new)
    }

    /// Value of `q`, advancing a pending rehash by one step.
    pub fn fetch<Q>(&mut self, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.find(q)?;
        self.value(h)
    }

    pub fn fetch_mut<Q>(&mut self, q: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.find(q)?;
        self.value_mut(h)
    }

    /// Read-only lookup that never advances rehashing.
    pub fn get<Q>(&self, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.ty.hash(q);
        self.search(hash, q).map(|k| &self.entries[k].value)
    }

    pub fn get_key_value<Q>(&self, q: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.ty.hash(q);
        self.search(hash, q).map(|k| {
            let e = &self.entries[k];
            (&e.key, &e.value)
        })
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.ty.hash(q);
        self.search(hash, q).is_some()
    }

    pub fn key(&self, h: Handle) -> Option<&K> {
        self.entries.get(h.raw_handle()).map(|e| &e.key)
    }

    pub fn value(&self, h: Handle) -> Option<&V> {
        self.entries.get(h.raw_handle()).map(|e| &e.value)
    }

    pub fn value_mut(&mut self, h: Handle) -> Option<&mut V> {
        self.entries.get_mut(h.raw_handle()).map(|e| &mut e.value)
    }

    /// Replaces the value behind `h`, returning the previous one.
    pub fn set_value(&mut self, h: Handle, value: V) -> Option<V> {
        self.entries
            .get_mut(h.raw_handle())
            .map(|e| core::mem::replace(&mut e.value, value))
    }

    /// Swaps the stored key for an equal one (same hash, `==`), returning
    /// the old key. Used to move a key into a fresh allocation.
    pub fn set_key(&mut self, h: Handle, key: K) -> Option<K> {
        let hash = self.ty.hash(&key);
        let e = self.entries.get_mut(h.raw_handle())?;
        assert!(
            e.hash == hash && e.key == key,
            "set_key must not change key identity"
        );
        Some(core::mem::replace(&mut e.key, key))
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Bucket to insert `q` into, or the existing entry for `q`.
    fn position_for_insert<Q>(&mut self, hash: u64, q: &Q) -> Result<(usize, usize), DefaultKey>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        if self.ht[0].size() > 0 {
            self.rehash_step_if_needed(self.old_index(hash));
        }
        self.auto_expand();
        if let Some(k) = self.search(hash, q) {
            return Err(k);
        }
        let t = if self.is_rehashing() { 1 } else { 0 };
        Ok((t, (hash as usize) & self.ht[t].mask()))
    }

    fn link_new(&mut self, (t, idx): (usize, usize), key: K, value: V, hash: u64) -> DefaultKey {
        let next = self.ht[t].buckets[idx];
        let k = self.entries.insert(Entry {
            key,
            value,
            hash,
            next,
            linked: true,
        });
        self.ht[t].buckets[idx] = Some(k);
        self.ht[t].used += 1;
        k
    }

    /// Inserts `key -> value`; on a duplicate key nothing is overwritten.
    pub fn add(&mut self, key: K, value: V) -> Result<Handle, Occupied<K, V>> {
        let hash = self.ty.hash(&key);
        match self.position_for_insert(hash, &key) {
            Ok(pos) => Ok(Handle::new(self.link_new(pos, key, value, hash))),
            Err(existing) => Err(Occupied {
                existing: Handle::new(existing),
                key,
                value,
            }),
        }
    }

    /// Inserts `key` with a lazily built value, or reports the existing
    /// entry. `default` only runs on insertion.
    pub fn add_raw<F>(&mut self, key: K, default: F) -> AddRaw
    where
        F: FnOnce() -> V,
    {
        let hash = self.ty.hash(&key);
        match self.position_for_insert(hash, &key) {
            Ok(pos) => AddRaw::Inserted(Handle::new(self.link_new(pos, key, default(), hash))),
            Err(existing) => AddRaw::Existing(Handle::new(existing)),
        }
    }

    pub fn add_or_find<F>(&mut self, key: K, default: F) -> Handle
    where
        F: FnOnce() -> V,
    {
        self.add_raw(key, default).handle()
    }

    /// Inserts or overwrites. Returns true when the key was new.
    ///
    /// On overwrite the new value is stored before the old one is dropped.
    pub fn replace(&mut self, key: K, value: V) -> bool {
        let hash = self.ty.hash(&key);
        match self.position_for_insert(hash, &key) {
            Ok(pos) => {
                self.link_new(pos, key, value, hash);
                true
            }
            Err(existing) => {
                let old = core::mem::replace(&mut self.entries[existing].value, value);
                drop(old);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    fn unlink_key<Q>(&mut self, q: &Q) -> Option<DefaultKey>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.is_empty() {
            return None;
        }
        let hash = self.ty.hash(q);
        self.rehash_step_if_needed(self.old_index(hash));
        for t in 0..2 {
            if self.ht[t].size() == 0 {
                continue;
            }
            let idx = (hash as usize) & self.ht[t].mask();
            if t == 0 && self.rehash_idx.is_some_and(|r| idx < r) {
                continue;
            }
            let mut prev: Option<DefaultKey> = None;
            let mut cur = self.ht[t].buckets[idx];
            while let Some(k) = cur {
                let (matched, next) = {
                    let e = &self.entries[k];
                    (e.hash == hash && e.key.borrow() == q, e.next)
                };
                if matched {
                    match prev {
                        Some(p) => self.entries[p].next = next,
                        None => self.ht[t].buckets[idx] = next,
                    }
                    let e = &mut self.entries[k];
                    e.next = None;
                    e.linked = false;
                    self.ht[t].used -= 1;
                    self.auto_shrink();
                    return Some(k);
                }
                prev = Some(k);
                cur = next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Removes `q`, returning the owned pair.
    pub fn delete<Q>(&mut self, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let k = self.unlink_key(q)?;
        self.entries.remove(k).map(|e| (e.key, e.value))
    }

    /// Unlinks `q` from the table but keeps it readable through the
    /// returned handle until `free_unlinked` is called.
    pub fn unlink<Q>(&mut self, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.unlink_key(q).map(Handle::new)
    }

    /// Releases an entry previously returned by `unlink`.
    ///
    /// Panics if `h` still refers to a linked entry.
    pub fn free_unlinked(&mut self, h: Handle) -> Option<(K, V)> {
        let e = self.entries.get(h.raw_handle())?;
        assert!(!e.linked, "free_unlinked called on a linked entry");
        self.entries.remove(h.raw_handle()).map(|e| (e.key, e.value))
    }

    /// Drops every entry, calling `callback` every 65536 buckets so long
    /// clears can yield to other work.
    pub fn empty<F: FnMut()>(&mut self, mut callback: F) {
        if let Some((from, to)) = self.rehashing_info() {
            self.ty.rehashing_completed(from, to);
        }
        for t in 0..2 {
            for i in 0..self.ht[t].size() {
                if i % EMPTY_CALLBACK_PERIOD == 0 {
                    callback();
                }
                let mut cur = self.ht[t].buckets[i].take();
                while let Some(k) = cur {
                    cur = self.entries.remove(k).and_then(|e| e.next);
                }
            }
        }
        let freed = self.buckets();
        self.entries.clear();
        self.ht = [Table::default(), Table::default()];
        self.rehash_idx = None;
        self.pause_rehash = PauseCount::new();
        self.pause_auto_resize = PauseCount::new();
        if freed > 0 {
            self.ty.bucket_count_changed(-(freed as i64));
        }
    }

    pub fn clear(&mut self) {
        self.empty(|| {});
    }

    // ------------------------------------------------------------------
    // Internal accessors for sibling modules
    // ------------------------------------------------------------------

    pub(crate) fn bucket_head(&self, t: usize, idx: usize) -> Option<DefaultKey> {
        self.ht[t].buckets[idx]
    }

    pub(crate) fn next_in_chain(&self, k: DefaultKey) -> Option<DefaultKey> {
        self.entries.get(k).and_then(|e| e.next)
    }

    pub(crate) fn table_size(&self, t: usize) -> usize {
        self.ht[t].size()
    }

    pub(crate) fn table_used(&self, t: usize) -> usize {
        self.ht[t].used
    }

    pub(crate) fn rehash_index(&self) -> Option<usize> {
        self.rehash_idx
    }
}

impl<K, V, T> fmt::Debug for Dict<K, V, T>
where
    K: Eq + Hash + fmt::Debug,
    V: fmt::Debug,
    T: DictType,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(_, k, v)| (k, v)))
            .finish()
    }
}

/// Power of two `>= size`, at least `INITIAL_SIZE`.
fn next_size(size: usize) -> Option<usize> {
    if size <= INITIAL_SIZE {
        return Some(INITIAL_SIZE);
    }
    size.checked_next_power_of_two()
}

fn alloc_buckets(n: usize, try_alloc: bool) -> Result<Vec<Option<DefaultKey>>, DictError> {
    let bytes = n.checked_mul(core::mem::size_of::<Option<DefaultKey>>());
    if bytes.map_or(true, |b| b > isize::MAX as usize) {
        return Err(DictError::AllocFailed { buckets: n });
    }
    if try_alloc {
        let mut v = Vec::new();
        v.try_reserve_exact(n)
            .map_err(|_| DictError::AllocFailed { buckets: n })?;
        v.resize(n, None);
        Ok(v)
    } else {
        Ok(vec![None; n])
    }
}

#[cfg(test)]
mod tests;

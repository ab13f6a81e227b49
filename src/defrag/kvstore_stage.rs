//! Stage walking every key of a `Kvstore`.
//!
//! Order of work: the shard lookup table and per-shard tables first, then
//! each non-empty shard through `scan_shard_defrag`. Values too large to
//! process inline are queued and drained incrementally before the scan
//! moves on.

use super::{DefragCtx, DefragValue, LaterCursor, Stage, StageKind, StageStatus};
use crate::alloc::Relocatable;
use crate::dict::{DictDefragFns, DictType};
use crate::kvstore::Kvstore;
use hashbrown::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;
use std::time::Instant;
use tracing::trace;

const CHECK_EVERY: u32 = 16;
const CHECK_AFTER_HITS: u64 = 512;
const CHECK_AFTER_SCANNED: u64 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Lut(usize),
    Start,
    Scanning(usize),
    After(usize),
}

/// Keys whose values are processed after the scan step that found them.
#[derive(Debug)]
struct Deferred<K> {
    queue: VecDeque<(usize, K)>,
    queued: HashSet<(usize, K)>,
    cursor: LaterCursor,
}

impl<K: Eq + Hash + Clone> Deferred<K> {
    fn push(&mut self, didx: usize, key: &K) -> bool {
        let entry = (didx, key.clone());
        if self.queued.contains(&entry) {
            return false;
        }
        self.queued.insert(entry.clone());
        self.queue.push_back(entry);
        true
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.queued.clear();
        self.cursor = LaterCursor::default();
    }
}

/// Scan hooks for one shard step.
struct KeyScan<'s, 'a, K> {
    ctx: &'s mut DefragCtx<'a>,
    deferred: &'s mut Deferred<K>,
    didx: usize,
    hits_before: u64,
    defer: bool,
}

impl<K, V> DictDefragFns<K, V> for KeyScan<'_, '_, K>
where
    K: Relocatable + Eq + Hash + Clone,
    V: DefragValue,
{
    fn defrag_key(&mut self, key: &mut K) {
        self.hits_before = self.ctx.hits;
        self.ctx.relocate(key);
    }

    fn defrag_val(&mut self, val: &mut V) {
        self.defer = val.scan_fields() > self.ctx.max_scan_fields();
        if !self.defer {
            val.defrag(self.ctx);
        }
    }

    fn visit(&mut self, key: &K, _val: &mut V) {
        self.ctx.scanned += 1;
        if self.ctx.hits > self.hits_before {
            self.ctx.key_hits += 1;
        } else {
            self.ctx.key_misses += 1;
        }
        if self.defer && self.deferred.push(self.didx, key) {
            trace!(shard = self.didx, "large value deferred");
        }
        self.defer = false;
    }
}

/// Stage over the `Kvstore` that `kvstore` projects out of the database.
pub struct KvstoreStage<C, K, V, T> {
    name: String,
    kind: StageKind,
    kvstore: fn(&mut C) -> &mut Kvstore<K, V, T>,
    phase: Phase,
    cursor: u64,
    deferred: Deferred<K>,
}

impl<C, K, V, T> KvstoreStage<C, K, V, T>
where
    K: Relocatable + Eq + Hash + Clone,
    V: DefragValue,
    T: DictType + Clone,
{
    pub fn new(name: impl Into<String>, kind: StageKind, kvstore: fn(&mut C) -> &mut Kvstore<K, V, T>) -> Self {
        Self {
            name: name.into(),
            kind,
            kvstore,
            phase: Phase::Lut(0),
            cursor: 0,
            deferred: Deferred {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                cursor: LaterCursor::default(),
            },
        }
    }

    /// Keys waiting for incremental processing.
    pub fn pending_later(&self) -> usize {
        self.deferred.queue.len()
    }

    /// Drains deferred values. Returns false if the deadline passed first.
    fn drain_deferred(&mut self, kvs: &mut Kvstore<K, V, T>, ctx: &mut DefragCtx<'_>, deadline: Instant) -> bool {
        while let Some((didx, key)) = self.deferred.queue.front() {
            let finished = match kvs.fetch_mut(*didx, key) {
                Some(val) => loop {
                    if val.defrag_later(&mut self.deferred.cursor, ctx) {
                        break true;
                    }
                    if Instant::now() >= deadline {
                        break false;
                    }
                },
                None => true,
            };
            if !finished {
                return false;
            }
            if let Some(entry) = self.deferred.queue.pop_front() {
                self.deferred.queued.remove(&entry);
            }
            self.deferred.cursor = LaterCursor::default();
            if !self.deferred.queue.is_empty() && Instant::now() >= deadline {
                return false;
            }
        }
        true
    }
}

impl<C, K, V, T> Stage<C> for KvstoreStage<C, K, V, T>
where
    K: Relocatable + Eq + Hash + Clone,
    V: DefragValue,
    T: DictType + Clone,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn step(&mut self, db: &mut C, ctx: &mut DefragCtx<'_>, deadline: Instant) -> StageStatus {
        let kvs = (self.kvstore)(db);

        while let Phase::Lut(cursor) = self.phase {
            let next = kvs.lut_defrag(cursor, |addr| ctx.should_move(addr));
            self.phase = if next == 0 { Phase::Start } else { Phase::Lut(next) };
            if Instant::now() >= deadline {
                return StageStatus::NotDone;
            }
        }

        let mut iterations = 0u32;
        let mut hits_mark = ctx.hits;
        let mut scanned_mark = ctx.scanned;
        loop {
            if !self.drain_deferred(kvs, ctx, deadline) {
                return StageStatus::NotDone;
            }
            let didx = match self.phase {
                Phase::Start => kvs.first_non_empty_shard(),
                Phase::Scanning(d) => Some(d),
                Phase::After(d) => kvs.next_non_empty_shard(d),
                Phase::Lut(_) => None,
            };
            let Some(didx) = didx else {
                self.reset();
                return StageStatus::Done;
            };
            if self.phase != Phase::Scanning(didx) {
                trace!(stage = %self.name, shard = didx, "defrag shard");
                self.phase = Phase::Scanning(didx);
                self.cursor = 0;
            }
            let mut scan = KeyScan {
                ctx: &mut *ctx,
                deferred: &mut self.deferred,
                didx,
                hits_before: 0,
                defer: false,
            };
            self.cursor = kvs.scan_shard_defrag(didx, self.cursor, &mut scan);
            if self.cursor == 0 {
                self.phase = Phase::After(didx);
            }

            iterations += 1;
            if iterations >= CHECK_EVERY
                || ctx.hits - hits_mark > CHECK_AFTER_HITS
                || ctx.scanned - scanned_mark > CHECK_AFTER_SCANNED
            {
                if Instant::now() >= deadline {
                    return StageStatus::NotDone;
                }
                iterations = 0;
                hits_mark = ctx.hits;
                scanned_mark = ctx.scanned;
            }
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Lut(0);
        self.cursor = 0;
        self.deferred.clear();
    }
}

//! rehashkv: incrementally rehashed dictionaries, a sharded key-value
//! store, expiration indexes, and a time-sliced defragmenter.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: keep every long-running operation (growing a table, walking a
//!   keyspace, expiring items, defragmenting) splittable into short steps
//!   that a single-threaded event loop can interleave with requests.
//! - Layers:
//!   - `Dict<K, V, T>`: chained hash table with two bucket arrays and an
//!     incremental rehash cursor. Entries live in a generational arena and
//!     are addressed by `Handle`. A `DictType` supplies hashing and
//!     observes resize decisions.
//!   - `Kvstore<K, V, T>`: fixed array of `Dict` shards plus aggregate
//!     counts kept in a `FenwickIndex`, so "the n-th key" and "next
//!     non-empty shard" are O(log n).
//!   - `EBuckets<Id>` / `Estore<I>`: items ordered by expiration time, and a
//!     bucketed array of those with the same Fenwick bookkeeping.
//!   - `Defragmenter<C>`: ordered, resumable `Stage`s over a database value
//!     `C`, run under a CPU budget derived from allocator statistics.
//!
//! Constraints
//! - Single-threaded: nothing here is `Sync`, and no locks are taken.
//!   Background work is time slicing driven by the caller.
//! - Stable handles: an entry keeps its `Handle` across rehashing, bucket
//!   array moves and relocation of its key or value.
//! - No unsafe code.
//!
//! Rehashing
//! - Each entry stores its hash; rehashing never calls `Hash` again.
//! - A rehash step moves whole buckets and visits at most `10 * n` empty
//!   buckets for `n` requested moves.
//! - Lookups that land on an unmigrated old bucket migrate that bucket
//!   first.
//! - Pausing (safe iterators, scans, defrag) suspends steps but not
//!   inserts; while rehashing, inserts go to the new table.
//!
//! Scanning
//! - `scan` uses a reverse-binary cursor: every entry present for the
//!   whole scan is returned at least once even if the table grows or
//!   shrinks between calls. Duplicates are possible.
//!
//! Expiration
//! - An item's `ExpireMeta` and the index that tracks it always agree.
//!   Owners change a tracked time only through the index, and sweep
//!   callbacks report what they did through `ExpireAction`.
//!
//! Defragmentation
//! - The allocator is an `Allocator` trait object: a relocation hint per
//!   address plus fragmentation counters. Relocation clones an owned
//!   buffer into fresh storage and swaps it in; handles and indexes stay
//!   valid, so there is nothing to fix up.
//! - Large values are deferred and processed in batches from a
//!   `LaterCursor`, one value at a time, before the key scan continues.
//!
//! Notes and non-goals
//! - No persistence, replication or command surface.
//! - The shard of a key is chosen by the caller.
//! - Logging goes through `tracing`; no subscriber is installed.

pub mod alloc;
pub mod defrag;
pub mod dict;
mod dict_proptest;
pub mod ebuckets;
pub mod error;
pub mod estore;
pub mod fenwick;
pub mod kvstore;
pub mod object;
mod pause;

// Public surface
pub use alloc::{Allocator, FragStats, NeverRelocate, Relocatable, SimulatedAllocator};
pub use defrag::{
    DefragConfig, DefragCtx, DefragStats, DefragValue, Defragmenter, DutyCycle, LaterCursor, Stage,
    StageKind, StageStatus,
};
pub use dict::{AddRaw, DefaultType, Dict, DictConfig, DictType, Handle, Occupied, ResizePolicy};
pub use ebuckets::{EBuckets, EItem, ExpireAction, ExpireInfo, ExpireMeta};
pub use error::{ConfigError, DictError, ExpireError};
pub use estore::Estore;
pub use fenwick::FenwickIndex;
pub use kvstore::{Kvstore, KvstoreFlags, KvstoreIter};
pub use object::{HashObject, Object};

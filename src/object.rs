//! Values stored in a keyspace and how each one is defragmented.
//!
//! Small values are processed inline during the key scan. Collections
//! above the configured element count are processed in batches through
//! `DefragValue::defrag_later`, resuming from a `LaterCursor`:
//!
//! - lists: `pos` is the next element index;
//! - sets: `pos` is a `Dict::scan_defrag` cursor;
//! - hashes: the field table is scanned in the primary phase, then the
//!   field-expiry index in the secondary phase, `pos` holding the cursor
//!   of whichever is current.

use crate::alloc::Relocatable;
use crate::defrag::{DefragCtx, DefragValue, LaterCursor, LaterPhase};
use crate::dict::{Dict, DictDefragFns};
use crate::ebuckets::{EBuckets, ExpireAction, ExpireInfo, ExpireMeta};
use crate::error::ExpireError;
use std::collections::VecDeque;

/// Elements per list batch.
const LIST_BATCH: u64 = 128;
/// `scan_defrag` steps per set or hash batch.
const SCAN_STEPS: usize = 16;
/// Expiry ids per hash batch.
const TTL_BATCH: usize = 64;

/// A hash field: its value plus expiration bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Field {
    pub value: Vec<u8>,
    meta: ExpireMeta,
}

impl Field {
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            meta: ExpireMeta::new(),
        }
    }

    pub fn expire_meta(&self) -> &ExpireMeta {
        &self.meta
    }
}

impl Relocatable for Field {
    fn heap_addr(&self) -> Option<usize> {
        self.value.heap_addr()
    }

    fn relocate(&mut self) {
        self.value.relocate();
    }
}

/// Relocates keys and values of a collection dict.
struct ElementScan<'s, 'a> {
    ctx: &'s mut DefragCtx<'a>,
}

impl<V: Relocatable> DictDefragFns<Vec<u8>, V> for ElementScan<'_, '_> {
    fn defrag_key(&mut self, key: &mut Vec<u8>) {
        self.ctx.relocate(key);
    }

    fn defrag_val(&mut self, val: &mut V) {
        self.ctx.relocate(val);
    }

    fn visit(&mut self, _key: &Vec<u8>, _val: &mut V) {
        self.ctx.scanned += 1;
    }
}

/// Runs up to `steps` scan steps from `*cursor`. Returns true when the
/// scan wrapped around.
fn scan_batch<V: Relocatable>(
    dict: &mut Dict<Vec<u8>, V>,
    cursor: &mut u64,
    steps: usize,
    ctx: &mut DefragCtx<'_>,
) -> bool {
    if *cursor == 0 {
        dict.defrag_tables(|addr| ctx.should_move(addr));
    }
    let mut scan = ElementScan { ctx };
    for _ in 0..steps {
        *cursor = dict.scan_defrag(*cursor, &mut scan);
        if *cursor == 0 {
            return true;
        }
    }
    false
}

/// Hash with optional per-field expiration.
#[derive(Debug, Default)]
pub struct HashObject {
    fields: Dict<Vec<u8>, Field>,
    ttl: EBuckets<Vec<u8>>,
}

impl HashObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields with an expiration time.
    pub fn volatile_len(&self) -> usize {
        self.ttl.len()
    }

    /// Sets `field`, dropping any expiration it had. Returns true if the
    /// field is new.
    pub fn set(&mut self, field: &[u8], value: Vec<u8>) -> bool {
        if let Some(f) = self.fields.fetch_mut(field) {
            f.value = value;
            if f.meta.is_tracked() {
                self.ttl.remove(&field.to_vec(), &mut f.meta);
            }
            return false;
        }
        self.fields.replace(field.to_vec(), Field::new(value))
    }

    /// Value of `field`. Expired fields stay visible until swept.
    pub fn get(&self, field: &[u8]) -> Option<&[u8]> {
        self.fields.get(field).map(|f| f.value.as_slice())
    }

    pub fn remove(&mut self, field: &[u8]) -> Option<Vec<u8>> {
        let (name, mut f) = self.fields.delete(field)?;
        self.ttl.remove(&name, &mut f.meta);
        Some(f.value)
    }

    /// Sets or moves the expiration of `field`. Returns false when the
    /// field does not exist.
    pub fn set_expire(&mut self, field: &[u8], when: u64) -> Result<bool, ExpireError> {
        let Some(f) = self.fields.fetch_mut(field) else {
            return Ok(false);
        };
        if f.meta.is_tracked() {
            self.ttl.update(&field.to_vec(), &mut f.meta, when)?;
        } else {
            self.ttl.add(field.to_vec(), &mut f.meta, when)?;
        }
        Ok(true)
    }

    /// Drops the expiration of `field`, returning the time it had.
    pub fn persist(&mut self, field: &[u8]) -> Option<u64> {
        let f = self.fields.fetch_mut(field)?;
        self.ttl.remove(&field.to_vec(), &mut f.meta)
    }

    pub fn expire_time(&self, field: &[u8]) -> Option<u64> {
        self.fields.get(field)?.meta.when()
    }

    /// Earliest field expiration.
    pub fn min_expire(&self) -> Option<u64> {
        self.ttl.next_expire_time()
    }

    /// Deletes up to `max` fields whose time is before `now`.
    pub fn active_expire(&mut self, now: u64, max: usize) -> ExpireInfo {
        let mut info = ExpireInfo::new(now, max);
        let fields = &mut self.fields;
        self.ttl.active_expire(&mut info, |name| {
            fields.delete(name.as_slice());
            ExpireAction::Remove
        });
        info
    }
}

#[derive(Debug)]
pub enum Object {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(Dict<Vec<u8>, ()>),
    Hash(HashObject),
}

impl Object {
    pub fn list<I: IntoIterator<Item = Vec<u8>>>(items: I) -> Self {
        Object::List(items.into_iter().collect())
    }

    pub fn set<I: IntoIterator<Item = Vec<u8>>>(members: I) -> Self {
        let mut d = Dict::new();
        for m in members {
            d.replace(m, ());
        }
        Object::Set(d)
    }

    pub fn as_hash_mut(&mut self) -> Option<&mut HashObject> {
        match self {
            Object::Hash(h) => Some(h),
            _ => None,
        }
    }

    /// Elements held: 1 for a string.
    pub fn len(&self) -> usize {
        match self {
            Object::Str(_) => 1,
            Object::List(l) => l.len(),
            Object::Set(s) => s.len(),
            Object::Hash(h) => h.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DefragValue for Object {
    fn scan_fields(&self) -> usize {
        match self {
            Object::Str(_) => 0,
            other => other.len(),
        }
    }

    fn defrag(&mut self, ctx: &mut DefragCtx<'_>) {
        let mut cursor = LaterCursor::default();
        while !defrag_batch(self, &mut cursor, ctx, usize::MAX) {}
    }

    fn defrag_later(&mut self, cursor: &mut LaterCursor, ctx: &mut DefragCtx<'_>) -> bool {
        defrag_batch(self, cursor, ctx, 1)
    }
}

/// One batch of work, `scale` batches' worth of budget. Returns true when
/// the object is done.
fn defrag_batch(obj: &mut Object, cursor: &mut LaterCursor, ctx: &mut DefragCtx<'_>, scale: usize) -> bool {
    match obj {
        Object::Str(s) => {
            ctx.relocate(s);
            true
        }
        Object::List(l) => {
            if cursor.pos == 0 {
                ctx.relocate(l);
            }
            let batch = LIST_BATCH.saturating_mul(scale as u64);
            let end = cursor.pos.saturating_add(batch).min(l.len() as u64);
            for i in cursor.pos..end {
                if let Some(item) = l.get_mut(i as usize) {
                    ctx.relocate(item);
                    ctx.scanned += 1;
                }
            }
            cursor.pos = end;
            end >= l.len() as u64
        }
        Object::Set(s) => scan_batch(s, &mut cursor.pos, SCAN_STEPS.saturating_mul(scale), ctx),
        Object::Hash(h) => match cursor.phase {
            LaterPhase::Primary => {
                if scan_batch(&mut h.fields, &mut cursor.pos, SCAN_STEPS.saturating_mul(scale), ctx) {
                    cursor.phase = LaterPhase::Secondary;
                    cursor.pos = 0;
                }
                false
            }
            LaterPhase::Secondary => {
                cursor.pos = h.ttl.defrag(cursor.pos, TTL_BATCH.saturating_mul(scale), |name| {
                    ctx.relocate(name);
                });
                cursor.pos == 0
            }
        },
    }
}

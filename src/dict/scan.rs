//! Cursor-based scanning.
//!
//! The cursor is advanced by incrementing its *reversed* bits, so the high
//! bits of the bucket index change fastest. With power-of-two tables this
//! means that when the table grows between calls, every bucket already
//! visited maps onto a contiguous set of already-visited expansions, and
//! when it shrinks, no unvisited bucket is skipped. Entries present for the
//! whole scan are returned at least once; some may be returned twice.
//!
//! While a rehash is in progress both tables are visited: the bucket of the
//! smaller table, then every bucket of the larger table that expands it.

use super::{Dict, DictType};
use core::hash::Hash;

/// Per-entry hooks of `scan_defrag`, called in order `defrag_key`,
/// `defrag_val`, `visit` for every entry of a visited bucket.
///
/// `defrag_key` must preserve key identity: a relocated key hashes and
/// compares equal to the original.
pub trait DictDefragFns<K, V> {
    fn defrag_key(&mut self, _key: &mut K) {}
    fn defrag_val(&mut self, _val: &mut V) {}
    fn visit(&mut self, _key: &K, _val: &mut V) {}
}

struct ScanOnly<F>(F);

impl<K, V, F> DictDefragFns<K, V> for ScanOnly<F>
where
    F: FnMut(&K, &mut V),
{
    fn visit(&mut self, key: &K, val: &mut V) {
        (self.0)(key, val)
    }
}

#[inline]
fn advance(v: u64, mask: u64) -> u64 {
    // Set the unmasked bits so the reversed increment carries into the
    // masked ones.
    let v = v | !mask;
    v.reverse_bits().wrapping_add(1).reverse_bits()
}

impl<K, V, T> Dict<K, V, T>
where
    K: Eq + Hash,
    T: DictType,
{
    /// Visits one cursor step worth of entries and returns the next cursor.
    ///
    /// Start with 0; a returned 0 means the scan is complete.
    pub fn scan<F>(&mut self, cursor: u64, f: F) -> u64
    where
        F: FnMut(&K, &mut V),
    {
        self.scan_defrag(cursor, &mut ScanOnly(f))
    }

    /// `scan` that runs the relocation hooks of `defrag` on every entry of
    /// each visited bucket before visiting it.
    pub fn scan_defrag<D>(&mut self, cursor: u64, defrag: &mut D) -> u64
    where
        D: DictDefragFns<K, V>,
    {
        if self.is_empty() {
            return 0;
        }
        self.pause_rehash.pause();
        let mut v = cursor;
        if self.rehash_idx.is_none() {
            let m0 = self.ht[0].mask() as u64;
            self.visit_bucket(0, (v & m0) as usize, defrag);
            v = advance(v, m0);
        } else {
            let (small, large) = if self.ht[0].size() <= self.ht[1].size() {
                (0, 1)
            } else {
                (1, 0)
            };
            let m0 = self.ht[small].mask() as u64;
            let m1 = self.ht[large].mask() as u64;
            self.visit_bucket(small, (v & m0) as usize, defrag);
            loop {
                self.visit_bucket(large, (v & m1) as usize, defrag);
                v = advance(v, m1);
                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }
        self.pause_rehash.resume();
        v
    }

    fn visit_bucket<D>(&mut self, t: usize, idx: usize, defrag: &mut D)
    where
        D: DictDefragFns<K, V>,
    {
        let mut cur = self.ht[t].buckets[idx];
        while let Some(k) = cur {
            let e = &mut self.entries[k];
            cur = e.next;
            defrag.defrag_key(&mut e.key);
            defrag.defrag_val(&mut e.value);
            defrag.visit(&e.key, &mut e.value);
        }
    }

    /// Moves bucket arrays for which `should_move(address)` is true into
    /// fresh allocations. Returns the number of arrays moved.
    pub fn defrag_tables<F>(&mut self, mut should_move: F) -> usize
    where
        F: FnMut(usize) -> bool,
    {
        let mut moved = 0;
        for t in 0..2 {
            let table = &mut self.ht[t];
            if table.size() == 0 {
                continue;
            }
            if should_move(table.buckets.as_ptr() as usize) {
                table.buckets = table.buckets.clone();
                moved += 1;
            }
        }
        moved
    }
}

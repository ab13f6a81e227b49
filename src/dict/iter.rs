//! Iteration over a `Dict`.
//!
//! `iter`/`iter_mut` borrow the table and cannot observe mutation. The
//! detached iterators (`SafeIter`, `UnsafeIter`) do not hold a borrow, so
//! the caller may touch the table between `next` calls:
//!
//! - `SafeIter` pauses incremental rehashing for its lifetime. The entry
//!   it just returned may be deleted before the next call.
//! - `UnsafeIter` records a fingerprint of the table shape and asserts on
//!   `release` that nothing changed; any mutation becomes a loud panic.
//!
//! Both must be handed back through `release`. Dropping one unreleased
//! panics.

use super::{Dict, DictType, Entry, Handle};
use core::hash::Hash;
use slotmap::DefaultKey;

/// Iterator over linked entries.
pub struct Iter<'a, K, V> {
    it: slotmap::basic::Iter<'a, DefaultKey, Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (Handle, &'a K, &'a V);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.it
            .by_ref()
            .find(|(_, e)| e.linked)
            .map(|(k, e)| (Handle::new(k), &e.key, &e.value))
    }
}

/// Iterator over linked entries with mutable values.
pub struct IterMut<'a, K, V> {
    it: slotmap::basic::IterMut<'a, DefaultKey, Entry<K, V>>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (Handle, &'a K, &'a mut V);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.it
            .by_ref()
            .find(|(_, e)| e.linked)
            .map(|(k, e)| (Handle::new(k), &e.key, &mut e.value))
    }
}

#[derive(Debug, Default)]
struct Cursor {
    table: usize,
    index: usize,
    started: bool,
    finished: bool,
    next: Option<DefaultKey>,
}

impl Cursor {
    fn advance<K, V, T>(&mut self, d: &Dict<K, V, T>) -> Option<Handle> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(k) = self.next.take() {
                if let Some(e) = d.entries.get(k).filter(|e| e.linked) {
                    self.next = e.next;
                    return Some(Handle::new(k));
                }
                // The saved successor was removed; the rest of this chain is
                // unreachable from here, so move on to the next bucket.
            }
            self.index = if self.started { self.index + 1 } else { 0 };
            self.started = true;
            if self.index >= d.ht[self.table].size() {
                if self.table == 0 && d.rehash_idx.is_some() {
                    self.table = 1;
                    self.index = 0;
                }
                if self.index >= d.ht[self.table].size() || self.table == 0 {
                    self.finished = true;
                    return None;
                }
            }
            self.next = d.ht[self.table].buckets[self.index];
        }
    }
}

/// Detached iterator that pauses rehashing until released.
#[derive(Debug)]
pub struct SafeIter {
    cursor: Cursor,
    released: bool,
}

impl SafeIter {
    pub fn next<K, V, T>(&mut self, d: &Dict<K, V, T>) -> Option<Handle> {
        self.cursor.advance(d)
    }

    pub fn release<K, V, T>(mut self, d: &mut Dict<K, V, T>)
    where
        K: Eq + Hash,
        T: DictType,
    {
        self.released = true;
        d.resume_rehashing();
    }
}

impl Drop for SafeIter {
    fn drop(&mut self) {
        if !self.released && !std::thread::panicking() {
            panic!("SafeIter dropped without release");
        }
    }
}

/// Detached iterator that asserts the table was not mutated.
#[derive(Debug)]
pub struct UnsafeIter {
    cursor: Cursor,
    fingerprint: u64,
    released: bool,
}

impl UnsafeIter {
    pub fn next<K, V, T>(&mut self, d: &Dict<K, V, T>) -> Option<Handle> {
        self.cursor.advance(d)
    }

    /// Panics if the table changed shape since the iterator was created.
    pub fn release<K, V, T>(mut self, d: &Dict<K, V, T>)
    where
        K: Eq + Hash,
        T: DictType,
    {
        self.released = true;
        assert!(
            self.fingerprint == d.fingerprint(),
            "dict mutated during unsafe iteration"
        );
    }
}

impl Drop for UnsafeIter {
    fn drop(&mut self) {
        if !self.released && !std::thread::panicking() {
            panic!("UnsafeIter dropped without release");
        }
    }
}

impl<K, V, T> Dict<K, V, T>
where
    K: Eq + Hash,
    T: DictType,
{
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            it: self.entries.iter(),
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut {
            it: self.entries.iter_mut(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(_, k, _)| k)
    }

    pub fn safe_iter(&mut self) -> SafeIter {
        self.pause_rehashing();
        SafeIter {
            cursor: Cursor::default(),
            released: false,
        }
    }

    pub fn unsafe_iter(&self) -> UnsafeIter {
        UnsafeIter {
            cursor: Cursor::default(),
            fingerprint: self.fingerprint(),
            released: false,
        }
    }

    /// Hash of the table shape: bucket array identities, sizes, and counts.
    pub fn fingerprint(&self) -> u64 {
        let integers = [
            self.ht[0].buckets.as_ptr() as u64,
            self.ht[0].size() as u64,
            self.ht[0].used as u64,
            self.ht[1].buckets.as_ptr() as u64,
            self.ht[1].size() as u64,
            self.ht[1].used as u64,
        ];
        let mut hash: u64 = 0;
        for i in integers {
            hash = hash.wrapping_add(i);
            // Thomas Wang's 64-bit integer mix.
            hash = (!hash).wrapping_add(hash << 21);
            hash ^= hash >> 24;
            hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
            hash ^= hash >> 14;
            hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
            hash ^= hash >> 28;
            hash = hash.wrapping_add(hash << 31);
        }
        hash
    }
}

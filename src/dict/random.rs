//! Random sampling of entries.

use super::{Dict, DictType, Handle};
use core::hash::Hash;
use rand::Rng;
use slotmap::DefaultKey;

/// Sample size used by `fair_random_key`.
const FAIR_SAMPLE: usize = 15;

impl<K, V, T> Dict<K, V, T>
where
    K: Eq + Hash,
    T: DictType,
{
    /// Picks a random bucket, then a random entry of its chain.
    ///
    /// Entries in long chains are less likely to be returned than entries
    /// alone in their bucket; see `fair_random_key`.
    pub fn random_key(&mut self) -> Option<Handle> {
        if self.is_empty() {
            return None;
        }
        self.rehash_step();
        let mut rng = rand::thread_rng();
        let head = if let Some(r) = self.rehash_idx {
            let s0 = self.ht[0].size();
            let slots = s0 + self.ht[1].size();
            // Buckets of the old table below the rehash index are empty.
            loop {
                let h = r + rng.gen_range(0..slots - r);
                let head = if h >= s0 {
                    self.ht[1].buckets[h - s0]
                } else {
                    self.ht[0].buckets[h]
                };
                if head.is_some() {
                    break head;
                }
            }
        } else {
            let mask = self.ht[0].mask();
            loop {
                let head = self.ht[0].buckets[rng.gen::<usize>() & mask];
                if head.is_some() {
                    break head;
                }
            }
        };

        let chain = self.chain_from(head);
        Some(Handle::new(chain[rng.gen_range(0..chain.len())]))
    }

    fn chain_from(&self, head: Option<DefaultKey>) -> Vec<DefaultKey> {
        let mut chain = Vec::new();
        let mut cur = head;
        while let Some(k) = cur {
            chain.push(k);
            cur = self.entries[k].next;
        }
        chain
    }

    /// Samples up to `count` entries starting from a random bucket.
    ///
    /// May return fewer than `count` entries, and may repeat an entry when
    /// the walk wraps around a small table. Takes at most `10 * count` steps.
    pub fn some_keys(&mut self, count: usize) -> Vec<Handle> {
        let count = count.min(self.len());
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }
        let mut maxsteps = count * 10;

        // Proportional rehash work for the sample we are about to take.
        for _ in 0..count {
            if !self.is_rehashing() {
                break;
            }
            self.rehash_step();
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut maxsizemask = self.ht[0].mask();
        if tables > 1 && maxsizemask < self.ht[1].mask() {
            maxsizemask = self.ht[1].mask();
        }

        let mut rng = rand::thread_rng();
        let mut i = rng.gen::<usize>() & maxsizemask;
        let mut emptylen = 0usize;
        while out.len() < count && maxsteps > 0 {
            maxsteps -= 1;
            for j in 0..tables {
                // Old-table buckets below the rehash index are empty; jump
                // past them when the new table is also exhausted at `i`.
                if tables == 2 && j == 0 {
                    if let Some(r) = self.rehash_idx {
                        if i < r {
                            if i >= self.ht[1].size() {
                                i = r;
                            } else {
                                continue;
                            }
                        }
                    }
                }
                if i >= self.ht[j].size() {
                    continue;
                }
                let mut cur = self.ht[j].buckets[i];
                if cur.is_none() {
                    emptylen += 1;
                    if emptylen >= 5 && emptylen > count {
                        i = rng.gen::<usize>() & maxsizemask;
                        emptylen = 0;
                    }
                } else {
                    emptylen = 0;
                    while let Some(k) = cur {
                        out.push(Handle::new(k));
                        if out.len() == count {
                            return out;
                        }
                        cur = self.entries[k].next;
                    }
                }
            }
            i = (i + 1) & maxsizemask;
        }
        out
    }

    /// Random entry with chain-length bias corrected by sampling.
    pub fn fair_random_key(&mut self) -> Option<Handle> {
        let sample = self.some_keys(FAIR_SAMPLE);
        if sample.is_empty() {
            return self.random_key();
        }
        let idx = rand::thread_rng().gen_range(0..sample.len());
        Some(sample[idx])
    }
}

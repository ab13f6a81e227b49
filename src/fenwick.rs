//! FenwickIndex: binary indexed tree over a power-of-two number of counters.
//!
//! Used by `Kvstore` and `Estore` to keep per-shard item counts so they can
//! (a) pick a shard proportionally to its size and (b) step through only the
//! non-empty shards, both in O(log n).
//!
//! Layout: `tree[1..=capacity]` holds the classic 1-based Fenwick nodes;
//! `tree[0]` is unused. `total` mirrors `prefix_sum(capacity - 1)`.

#[derive(Debug, Clone)]
pub struct FenwickIndex {
    tree: Vec<u64>,
    size_bits: u32,
    total: u64,
}

impl FenwickIndex {
    /// Creates an index with `2^size_bits` zeroed counters.
    pub fn new(size_bits: u32) -> Self {
        assert!(size_bits < usize::BITS, "fenwick size_bits out of range");
        let capacity = 1usize << size_bits;
        Self {
            tree: vec![0; capacity + 1],
            size_bits,
            total: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        1usize << self.size_bits
    }

    #[inline]
    pub fn size_bits(&self) -> u32 {
        self.size_bits
    }

    /// Sum of every counter.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Adds `delta` to the counter at 0-based `idx`.
    ///
    /// Panics if `idx` is out of range or if the logical counter at `idx`
    /// would become negative.
    pub fn update(&mut self, idx: usize, delta: i64) {
        assert!(idx < self.capacity(), "fenwick index {idx} out of range");
        if delta == 0 {
            return;
        }
        if delta < 0 {
            let current = self.value_at(idx);
            assert!(
                current >= delta.unsigned_abs(),
                "fenwick counter {idx} would go negative ({current} + {delta})"
            );
        }
        let mut i = idx + 1;
        while i <= self.capacity() {
            self.tree[i] = self.tree[i].wrapping_add_signed(delta);
            i += lowbit(i);
        }
        self.total = self.total.wrapping_add_signed(delta);
    }

    /// Cumulative sum over `[0, idx]`. `idx` past the end is clamped.
    pub fn prefix_sum(&self, idx: usize) -> u64 {
        let mut i = idx.min(self.capacity() - 1) + 1;
        let mut sum = 0u64;
        while i > 0 {
            sum += self.tree[i];
            i -= lowbit(i);
        }
        sum
    }

    /// Value of the single counter at `idx`.
    pub fn value_at(&self, idx: usize) -> u64 {
        let upto = self.prefix_sum(idx);
        if idx == 0 {
            upto
        } else {
            upto - self.prefix_sum(idx - 1)
        }
    }

    /// Smallest 0-based index whose prefix sum is `>= target`.
    ///
    /// `target == 0` returns 0. For `target > total()` the result is
    /// `capacity()`, i.e. one past the last index.
    pub fn find_index(&self, target: u64) -> usize {
        if target == 0 {
            return 0;
        }
        let mut target = target;
        let mut result = 0usize;
        let mut step = self.capacity();
        while step != 0 {
            let current = result + step;
            if current <= self.capacity() && target > self.tree[current] {
                target -= self.tree[current];
                result = current;
            }
            step >>= 1;
        }
        // 1-based node `result + 1` holds the answer; minus one for 0-based.
        result
    }

    pub fn find_first_non_empty(&self) -> Option<usize> {
        if self.total == 0 {
            return None;
        }
        Some(self.find_index(1))
    }

    /// First index after `idx` whose counter is non-zero.
    pub fn find_next_non_empty(&self, idx: usize) -> Option<usize> {
        let next = self.prefix_sum(idx) + 1;
        if next > self.total {
            return None;
        }
        Some(self.find_index(next))
    }

    pub fn clear(&mut self) {
        self.tree.iter_mut().for_each(|c| *c = 0);
        self.total = 0;
    }
}

#[inline]
fn lowbit(i: usize) -> usize {
    i & i.wrapping_neg()
}

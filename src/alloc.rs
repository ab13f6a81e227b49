//! Allocator seam for the defragmenter.
//!
//! The allocator answers two questions: whether a given allocation sits
//! somewhere worth moving away from, and how fragmented the heap is
//! overall. Relocation itself is expressed on the owning value through
//! `Relocatable`: allocate fresh storage, copy, swap it in, drop the old
//! block. Nothing keeps raw addresses across a relocation, so there are no
//! back-references to fix up.

use std::cell::Cell;
use std::collections::VecDeque;

/// Allocator byte counters used to compute fragmentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FragStats {
    /// Bytes handed out to the program.
    pub allocated: u64,
    /// Bytes in pages holding at least one live allocation.
    pub active: u64,
    pub resident: u64,
}

impl FragStats {
    /// Percentage of active bytes beyond what is allocated.
    pub fn frag_pct(&self) -> f64 {
        if self.allocated == 0 {
            return 0.0;
        }
        self.active as f64 / self.allocated as f64 * 100.0 - 100.0
    }

    pub fn frag_bytes(&self) -> u64 {
        self.active.saturating_sub(self.allocated)
    }
}

pub trait Allocator {
    /// Hint: the allocation at `addr` lives in a sparsely used region.
    fn should_relocate(&self, addr: usize) -> bool;

    fn frag_stats(&self) -> FragStats;
}

/// Allocator that never asks for relocation and reports no fragmentation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverRelocate;

impl Allocator for NeverRelocate {
    fn should_relocate(&self, _addr: usize) -> bool {
        false
    }

    fn frag_stats(&self) -> FragStats {
        FragStats::default()
    }
}

/// Scriptable allocator for tests and benchmarks.
///
/// Every `period`-th hint answers true (0 disables relocation). Each
/// positive hint is assumed to reclaim `reclaim_per_hit` active bytes.
#[derive(Debug, Default)]
pub struct SimulatedAllocator {
    period: Cell<u64>,
    asked: Cell<u64>,
    hits: Cell<u64>,
    reclaim_per_hit: Cell<u64>,
    stats: Cell<FragStats>,
}

impl SimulatedAllocator {
    pub fn new(stats: FragStats) -> Self {
        let a = Self::default();
        a.stats.set(stats);
        a.period.set(1);
        a
    }

    pub fn set_period(&self, period: u64) {
        self.period.set(period);
    }

    pub fn set_reclaim_per_hit(&self, bytes: u64) {
        self.reclaim_per_hit.set(bytes);
    }

    pub fn set_frag_stats(&self, stats: FragStats) {
        self.stats.set(stats);
    }

    /// Number of relocation hints requested so far.
    pub fn asked(&self) -> u64 {
        self.asked.get()
    }

    /// Number of hints answered with true.
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }
}

impl Allocator for SimulatedAllocator {
    fn should_relocate(&self, _addr: usize) -> bool {
        let n = self.asked.get() + 1;
        self.asked.set(n);
        let period = self.period.get();
        if period == 0 || n % period != 0 {
            return false;
        }
        self.hits.set(self.hits.get() + 1);
        let mut s = self.stats.get();
        s.active = s
            .active
            .saturating_sub(self.reclaim_per_hit.get())
            .max(s.allocated);
        self.stats.set(s);
        true
    }

    fn frag_stats(&self) -> FragStats {
        self.stats.get()
    }
}

/// A value owning heap storage that can be moved to a fresh allocation
/// without changing its logical content.
pub trait Relocatable {
    /// Address of the owned heap block, or `None` when nothing is allocated.
    fn heap_addr(&self) -> Option<usize>;

    fn relocate(&mut self);
}

/// Relocates `v` when the allocator asks for it. Returns true on a move.
pub fn relocate_if_needed<R: Relocatable + ?Sized>(alloc: &dyn Allocator, v: &mut R) -> bool {
    match v.heap_addr() {
        Some(addr) if alloc.should_relocate(addr) => {
            v.relocate();
            true
        }
        _ => false,
    }
}

impl<T: Clone> Relocatable for Vec<T> {
    fn heap_addr(&self) -> Option<usize> {
        (self.capacity() > 0 && core::mem::size_of::<T>() > 0).then(|| self.as_ptr() as usize)
    }

    fn relocate(&mut self) {
        let fresh = self.as_slice().to_vec();
        *self = fresh;
    }
}

impl Relocatable for String {
    fn heap_addr(&self) -> Option<usize> {
        (self.capacity() > 0).then(|| self.as_ptr() as usize)
    }

    fn relocate(&mut self) {
        let fresh = self.as_str().to_owned();
        *self = fresh;
    }
}

impl<T: Clone> Relocatable for Box<T> {
    fn heap_addr(&self) -> Option<usize> {
        (core::mem::size_of::<T>() > 0).then(|| &**self as *const T as usize)
    }

    fn relocate(&mut self) {
        let fresh = Box::new((**self).clone());
        *self = fresh;
    }
}

impl<T: Clone> Relocatable for Box<[T]> {
    fn heap_addr(&self) -> Option<usize> {
        (!self.is_empty() && core::mem::size_of::<T>() > 0).then(|| self.as_ptr() as usize)
    }

    fn relocate(&mut self) {
        let fresh: Box<[T]> = self.iter().cloned().collect();
        *self = fresh;
    }
}

impl<T: Clone> Relocatable for VecDeque<T> {
    fn heap_addr(&self) -> Option<usize> {
        if self.capacity() == 0 || core::mem::size_of::<T>() == 0 {
            return None;
        }
        let (front, back) = self.as_slices();
        front
            .first()
            .or_else(|| back.first())
            .map(|e| e as *const T as usize)
    }

    fn relocate(&mut self) {
        let fresh: VecDeque<T> = self.iter().cloned().collect();
        *self = fresh;
    }
}

/// Keys with no heap storage of their own.
macro_rules! inline_relocatable {
    ($($t:ty),*) => {
        $(impl Relocatable for $t {
            fn heap_addr(&self) -> Option<usize> {
                None
            }
            fn relocate(&mut self) {}
        })*
    };
}

inline_relocatable!((), u8, u16, u32, u64, usize, i32, i64);

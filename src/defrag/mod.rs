//! Active defragmentation.
//!
//! A `Defragmenter` drives an ordered list of resumable `Stage`s over a
//! database value `C` in short time slices. Between slices it yields back
//! to the caller, which re-arms a timer with the returned delay. The whole
//! cycle is started by `cron` once the allocator reports enough
//! fragmentation and ends when every stage reports `Done`.
//!
//! ## Budget
//!
//! The CPU share follows the fragmentation level, scaled by a decay rate
//! that shrinks while cycles stop paying off (see `control`). Each slice
//! runs until its deadline; a stage that finishes early hands the rest of
//! the slice to the next stage when at least `cycle_us` remains.
//!
//! ## Relocation
//!
//! Stages never move memory themselves. They offer owned buffers to a
//! `DefragCtx`, which asks the `Allocator` for a hint and relocates through
//! `Relocatable`. Handles and indexes stay valid across a move, so nothing
//! needs fixing up afterwards.

mod control;
mod estore_stage;
mod kvstore_stage;
mod stage;

pub use control::{next_decay_rate, target_cpu_pct, DutyCycle};
pub use estore_stage::EstoreStage;
pub use kvstore_stage::KvstoreStage;
pub use stage::{FnStage, Stage, StageKind, StageStatus};

use crate::alloc::{Allocator, Relocatable};
use crate::error::ConfigError;
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

/// Poll interval while a child process is active.
const CHILD_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DefragConfig {
    pub enabled: bool,
    /// Minimum fragmented bytes before a cycle starts.
    pub ignore_bytes: u64,
    /// Fragmentation percent at which a cycle starts.
    pub threshold_lower: u32,
    /// Fragmentation percent at which the CPU share reaches `cycle_max`.
    pub threshold_upper: u32,
    pub cycle_min: u32,
    pub cycle_max: u32,
    /// Values with more elements than this are deferred and processed
    /// incrementally.
    pub max_scan_fields: usize,
    /// Shortest slice and the granularity of the duty cycle.
    pub cycle_us: u64,
    pub max_duty_us: u64,
    pub decay_min_improvement_pct: f64,
    pub decay_min_hit_ratio: f64,
    pub decay_reset_improvement_pct: f64,
    pub decay_factor: f64,
    pub decay_floor: f64,
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_bytes: 100 << 20,
            threshold_lower: 10,
            threshold_upper: 100,
            cycle_min: 1,
            cycle_max: 25,
            max_scan_fields: 1000,
            cycle_us: 500,
            max_duty_us: 50_000,
            decay_min_improvement_pct: 1.0,
            decay_min_hit_ratio: 0.1,
            decay_reset_improvement_pct: 5.0,
            decay_factor: 0.9,
            decay_floor: 0.1,
        }
    }
}

impl DefragConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold_lower > self.threshold_upper {
            return Err(ConfigError::new("threshold_lower exceeds threshold_upper"));
        }
        if self.cycle_min == 0 || self.cycle_max > 99 || self.cycle_min > self.cycle_max {
            return Err(ConfigError::new("cpu bounds must satisfy 1 <= cycle_min <= cycle_max <= 99"));
        }
        if self.cycle_us == 0 {
            return Err(ConfigError::new("cycle_us must be positive"));
        }
        if self.max_duty_us < self.cycle_us {
            return Err(ConfigError::new("max_duty_us is shorter than cycle_us"));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(ConfigError::new("decay_factor must be in (0, 1]"));
        }
        if !(self.decay_floor > 0.0 && self.decay_floor <= 1.0) {
            return Err(ConfigError::new("decay_floor must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Per-slice relocation context handed to stages.
pub struct DefragCtx<'a> {
    alloc: &'a dyn Allocator,
    max_scan_fields: usize,
    pub hits: u64,
    pub misses: u64,
    pub key_hits: u64,
    pub key_misses: u64,
    pub scanned: u64,
}

impl<'a> DefragCtx<'a> {
    pub fn new(alloc: &'a dyn Allocator, max_scan_fields: usize) -> Self {
        Self {
            alloc,
            max_scan_fields,
            hits: 0,
            misses: 0,
            key_hits: 0,
            key_misses: 0,
            scanned: 0,
        }
    }

    pub fn allocator(&self) -> &'a dyn Allocator {
        self.alloc
    }

    pub fn max_scan_fields(&self) -> usize {
        self.max_scan_fields
    }

    /// Asks the allocator about `addr`, counting the answer.
    pub fn should_move(&mut self, addr: usize) -> bool {
        let moved = self.alloc.should_relocate(addr);
        if moved {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        moved
    }

    /// Relocates `v` if the allocator asks for it. Values without heap
    /// storage are not offered and not counted.
    pub fn relocate<R: Relocatable + ?Sized>(&mut self, v: &mut R) -> bool {
        match v.heap_addr() {
            Some(addr) if self.should_move(addr) => {
                v.relocate();
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LaterPhase {
    #[default]
    Primary,
    Secondary,
}

/// Resume point of an incrementally defragmented value.
///
/// `pos` is owned by the value's implementation: an element index, a scan
/// cursor, or an expiry cursor depending on the phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaterCursor {
    pub phase: LaterPhase,
    pub pos: u64,
}

/// Values stored in a defragmented keyspace.
pub trait DefragValue {
    /// Number of elements a full pass would visit. Values above the
    /// configured limit are deferred.
    fn scan_fields(&self) -> usize {
        0
    }

    /// Offers every owned allocation in one go.
    fn defrag(&mut self, ctx: &mut DefragCtx<'_>);

    /// Offers one bounded batch starting at `cursor`. Returns true once
    /// the value is fully processed.
    fn defrag_later(&mut self, cursor: &mut LaterCursor, ctx: &mut DefragCtx<'_>) -> bool {
        let _ = cursor;
        self.defrag(ctx);
        true
    }
}

impl DefragValue for () {
    fn defrag(&mut self, _ctx: &mut DefragCtx<'_>) {}
}

impl DefragValue for u64 {
    fn defrag(&mut self, _ctx: &mut DefragCtx<'_>) {}
}

impl<T: Clone> DefragValue for Vec<T> {
    fn defrag(&mut self, ctx: &mut DefragCtx<'_>) {
        ctx.relocate(self);
    }
}

impl DefragValue for String {
    fn defrag(&mut self, ctx: &mut DefragCtx<'_>) {
        ctx.relocate(self);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DefragStats {
    pub hits: u64,
    pub misses: u64,
    pub key_hits: u64,
    pub key_misses: u64,
    pub scanned: u64,
    pub cycles_completed: u64,
    pub cycles_aborted: u64,
    pub total_time: Duration,
    pub last_cycle: Option<Duration>,
}

impl DefragStats {
    fn absorb(&mut self, ctx: &DefragCtx<'_>) {
        self.hits += ctx.hits;
        self.misses += ctx.misses;
        self.key_hits += ctx.key_hits;
        self.key_misses += ctx.key_misses;
        self.scanned += ctx.scanned;
    }
}

/// Bookkeeping of the cycle in progress.
#[derive(Debug)]
struct Cycle {
    next_stage: usize,
    started: Instant,
    start_frag_pct: f64,
    hits: u64,
    misses: u64,
}

/// Time-sliced defragmentation driver over a database of type `C`.
pub struct Defragmenter<C> {
    config: DefragConfig,
    stages: Vec<Box<dyn Stage<C>>>,
    cycle: Option<Cycle>,
    cpu_pct: u32,
    decay_rate: f64,
    duty: DutyCycle,
    last_end: Option<Instant>,
    stats: DefragStats,
}

impl<C> Defragmenter<C> {
    pub fn new(config: DefragConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            stages: Vec::new(),
            cycle: None,
            cpu_pct: 0,
            decay_rate: 1.0,
            duty: DutyCycle::new(config.cycle_us, config.max_duty_us),
            last_end: None,
            stats: DefragStats::default(),
        })
    }

    pub fn config(&self) -> &DefragConfig {
        &self.config
    }

    pub fn stats(&self) -> &DefragStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.cycle.is_some()
    }

    /// CPU percentage of the running cycle, 0 when idle.
    pub fn current_cpu_pct(&self) -> u32 {
        self.cpu_pct
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Adds a stage. Stages run ordered by kind, then by registration.
    pub fn register(&mut self, stage: Box<dyn Stage<C>>) {
        assert!(self.cycle.is_none(), "cannot register a stage during a cycle");
        self.stages.push(stage);
        self.stages.sort_by_key(|s| s.kind());
    }

    /// Disabling aborts a running cycle immediately.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled && self.cycle.is_some() {
            self.abort();
        }
    }

    fn abort(&mut self) {
        let done = self.cycle.as_ref().map_or(0, |c| c.next_stage);
        warn!(
            stages_done = done,
            stages = self.stages.len(),
            "active defrag aborted"
        );
        for s in &mut self.stages {
            s.reset();
        }
        self.cycle = None;
        self.cpu_pct = 0;
        self.duty.reset();
        self.last_end = None;
        self.stats.cycles_aborted += 1;
    }

    fn begin_cycle(&mut self, frag_pct: f64, cpu_pct: u32) {
        for s in &mut self.stages {
            s.reset();
        }
        self.cycle = Some(Cycle {
            next_stage: 0,
            started: Instant::now(),
            start_frag_pct: frag_pct,
            hits: 0,
            misses: 0,
        });
        self.cpu_pct = cpu_pct;
        self.duty.reset();
        self.last_end = None;
    }

    fn end_cycle(&mut self, alloc: &dyn Allocator) {
        let Some(cycle) = self.cycle.take() else {
            return;
        };
        let elapsed = cycle.started.elapsed();
        let frag_pct = alloc.frag_stats().frag_pct();
        let asked = cycle.hits + cycle.misses;
        let hit_ratio = if asked == 0 {
            0.0
        } else {
            cycle.hits as f64 / asked as f64
        };
        self.decay_rate = next_decay_rate(
            &self.config,
            self.decay_rate,
            cycle.start_frag_pct - frag_pct,
            hit_ratio,
        );
        self.stats.cycles_completed += 1;
        self.stats.total_time += elapsed;
        self.stats.last_cycle = Some(elapsed);
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            hits = cycle.hits,
            misses = cycle.misses,
            frag_pct,
            decay_rate = self.decay_rate,
            "active defrag done"
        );
        self.cpu_pct = 0;
        self.duty.reset();
        self.last_end = None;
    }

    /// Periodic check. Starts a cycle when fragmentation crosses the lower
    /// threshold and raises the CPU share of a running one.
    pub fn cron(&mut self, alloc: &dyn Allocator, child_active: bool) {
        if !self.config.enabled {
            if self.cycle.is_some() {
                self.abort();
            }
            return;
        }
        if child_active {
            return;
        }
        let frag = alloc.frag_stats();
        let frag_pct = frag.frag_pct();
        if self.cycle.is_some() {
            let target = target_cpu_pct(&self.config, frag_pct, self.decay_rate);
            if target > self.cpu_pct {
                info!(from = self.cpu_pct, to = target, frag_pct, "increasing defrag cpu");
                self.cpu_pct = target;
            }
            return;
        }
        if frag_pct < self.config.threshold_lower as f64 || frag.frag_bytes() < self.config.ignore_bytes {
            trace!(frag_pct, frag_bytes = frag.frag_bytes(), "fragmentation below threshold");
            return;
        }
        let target = target_cpu_pct(&self.config, frag_pct, self.decay_rate);
        info!(
            frag_pct,
            frag_bytes = frag.frag_bytes(),
            cpu_pct = target,
            "starting active defrag"
        );
        self.begin_cycle(frag_pct, target);
    }

    /// One timer tick. Returns the delay until the next tick, or `None` once
    /// there is no cycle to drive.
    pub fn time_proc(&mut self, db: &mut C, alloc: &dyn Allocator, child_active: bool) -> Option<Duration> {
        self.cycle.as_ref()?;
        if !self.config.enabled {
            self.abort();
            return None;
        }
        if child_active {
            self.last_end = None;
            return Some(CHILD_POLL);
        }
        let start = Instant::now();
        let waited = self
            .last_end
            .map(|t| start.saturating_duration_since(t).as_micros() as u64);
        let duty_us = self.duty.next_duty_us(self.cpu_pct, waited);
        let deadline = start + Duration::from_micros(duty_us);
        let more = self.run_stages(db, alloc, deadline);
        let end = Instant::now();
        if end > deadline {
            self.duty.overran((end - deadline).as_micros() as u64);
        }
        if !more {
            self.end_cycle(alloc);
            return None;
        }
        self.last_end = Some(end);
        Some(Duration::from_micros(self.duty.delay_us(self.cpu_pct)))
    }

    /// Runs one slice ending at `deadline`, starting a cycle if none is
    /// running. Returns whether work remains.
    pub fn run_one_time_slice(&mut self, db: &mut C, alloc: &dyn Allocator, deadline: Instant) -> bool {
        if !self.config.enabled {
            if self.cycle.is_some() {
                self.abort();
            }
            return false;
        }
        if self.cycle.is_none() {
            let frag_pct = alloc.frag_stats().frag_pct();
            let target = target_cpu_pct(&self.config, frag_pct, self.decay_rate);
            trace!(frag_pct, cpu_pct = target, "defrag cycle started by slice");
            self.begin_cycle(frag_pct, target);
        }
        let more = self.run_stages(db, alloc, deadline);
        if !more {
            self.end_cycle(alloc);
        }
        more
    }

    fn run_stages(&mut self, db: &mut C, alloc: &dyn Allocator, deadline: Instant) -> bool {
        let Some(cycle) = self.cycle.as_mut() else {
            return false;
        };
        let mut ctx = DefragCtx::new(alloc, self.config.max_scan_fields);
        let min_slice = Duration::from_micros(self.config.cycle_us);
        let mut first = true;
        while cycle.next_stage < self.stages.len() {
            if !first && Instant::now() + min_slice > deadline {
                break;
            }
            first = false;
            let stage = &mut self.stages[cycle.next_stage];
            match stage.step(db, &mut ctx, deadline) {
                StageStatus::Done => {
                    trace!(stage = stage.name(), kind = ?stage.kind(), "defrag stage done");
                    stage.reset();
                    cycle.next_stage += 1;
                }
                StageStatus::NotDone => break,
            }
        }
        cycle.hits += ctx.hits;
        cycle.misses += ctx.misses;
        self.stats.absorb(&ctx);
        cycle.next_stage < self.stages.len()
    }
}

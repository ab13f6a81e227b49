//! CPU budget control: target percentage, duty slices, and decay.
//!
//! The target CPU percentage is interpolated from the fragmentation level
//! between the configured thresholds and scaled by a decay rate that falls
//! while cycles stop paying off. The duty cycle turns that percentage into
//! concrete slice lengths and pauses, given how long the driver actually
//! waited between slices.

use super::DefragConfig;

/// Linear interpolation of `x` from `[x1, x2]` onto `[y1, y2]`.
fn interpolate(x: f64, x1: f64, x2: f64, y1: f64, y2: f64) -> f64 {
    if x2 <= x1 {
        return y2;
    }
    y1 + (x - x1) * (y2 - y1) / (x2 - x1)
}

/// CPU percentage to spend at fragmentation `frag_pct`.
pub fn target_cpu_pct(config: &DefragConfig, frag_pct: f64, decay_rate: f64) -> u32 {
    let cpu = interpolate(
        frag_pct,
        config.threshold_lower as f64,
        config.threshold_upper as f64,
        config.cycle_min as f64,
        config.cycle_max as f64,
    ) * decay_rate;
    let cpu = cpu.clamp(config.cycle_min as f64, config.cycle_max as f64);
    cpu as u32
}

/// New decay rate after a completed cycle.
///
/// `improvement_pct` is the drop in fragmentation percent over the cycle
/// and `hit_ratio` the share of relocation hints that moved something.
pub fn next_decay_rate(config: &DefragConfig, decay_rate: f64, improvement_pct: f64, hit_ratio: f64) -> f64 {
    if improvement_pct >= config.decay_reset_improvement_pct {
        return 1.0;
    }
    if improvement_pct < config.decay_min_improvement_pct && hit_ratio < config.decay_min_hit_ratio {
        return (decay_rate * config.decay_factor).max(config.decay_floor);
    }
    decay_rate
}

/// Slice-length controller.
///
/// Keeps the share of wall time spent in slices at the target percentage.
/// A slice shorter than `cycle_us` is never scheduled; the time taken
/// beyond what the target allows is carried as overage and repaid from
/// later slices and pauses.
#[derive(Clone, Debug)]
pub struct DutyCycle {
    cycle_us: u64,
    max_duty_us: u64,
    overage_us: u64,
    prev_cpu_pct: u32,
}

impl DutyCycle {
    pub fn new(cycle_us: u64, max_duty_us: u64) -> Self {
        Self {
            cycle_us,
            max_duty_us,
            overage_us: 0,
            prev_cpu_pct: 0,
        }
    }

    pub fn overage_us(&self) -> u64 {
        self.overage_us
    }

    /// Length of the next slice at `cpu_pct`, given the time since the
    /// previous slice ended (`None` for the first slice of a run).
    pub fn next_duty_us(&mut self, cpu_pct: u32, waited_us: Option<u64>) -> u64 {
        let cpu_pct = cpu_pct.clamp(1, 99) as u64;
        let waited = match waited_us {
            Some(w) if cpu_pct as u32 == self.prev_cpu_pct => w,
            _ => {
                self.prev_cpu_pct = cpu_pct as u32;
                return self.cycle_us;
            }
        };
        let duty = waited.saturating_mul(cpu_pct) / (100 - cpu_pct);
        let owed = core::mem::take(&mut self.overage_us);
        match duty.checked_sub(owed) {
            Some(d) if d >= self.cycle_us => d.min(self.max_duty_us),
            Some(d) => {
                self.overage_us = self.cycle_us - d;
                self.cycle_us
            }
            None => {
                self.overage_us = owed - duty + self.cycle_us;
                self.cycle_us
            }
        }
    }

    /// Records a slice that ran `over_us` past its deadline.
    pub fn overran(&mut self, over_us: u64) {
        self.overage_us = self.overage_us.saturating_add(over_us);
    }

    /// Pause before the next slice at `cpu_pct`.
    pub fn delay_us(&self, cpu_pct: u32) -> u64 {
        let cpu_pct = cpu_pct.clamp(1, 99) as u64;
        let total = self.cycle_us * 100 / cpu_pct;
        let delay = total - self.cycle_us;
        delay + self.overage_us * (100 - cpu_pct) / 100
    }

    pub fn reset(&mut self) {
        self.overage_us = 0;
        self.prev_cpu_pct = 0;
    }
}

//! # Correction-Factor Model
//!
//! The time until the next known timer is a poor idle predictor on its own:
//! interrupts and wakeups from other CPUs cut most sleeps short. The model
//! learns, per magnitude bucket, which fraction of the known timer distance
//! the CPU actually sleeps, and scales future predictions by it.
//!
//! ```text
//!   next_timer_us     <10   <100  <1000  <10000  <100000  >=100000
//!   no iowait         [0]   [1]   [2]    [3]     [4]      [5]
//!   iowait            [6]   [7]   [8]    [9]     [10]     [11]
//! ```
//!
//! Factors are fixed point with `RESOLUTION * DECAY` meaning 1.0.

use crate::{BUCKETS, DECAY, MAX_INTERESTING_US, NO_TIMER, RESOLUTION};

/// Unity scaling
pub const UNITY: u32 = RESOLUTION * DECAY;

/// Magnitude bucket for a timer distance
#[inline]
pub fn which_bucket(next_timer_us: u64, nr_iowaiters: u32) -> usize {
    let base = if nr_iowaiters > 0 { BUCKETS / 2 } else { 0 };

    let magnitude = match next_timer_us {
        0..=9 => 0,
        10..=99 => 1,
        100..=999 => 2,
        1_000..=9_999 => 3,
        10_000..=99_999 => 4,
        _ => 5,
    };

    base + magnitude
}

/// Per-CPU learned correction factors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionModel {
    factors: [u32; BUCKETS],
}

impl CorrectionModel {
    /// All buckets at unity
    pub const fn new() -> Self {
        Self {
            factors: [UNITY; BUCKETS],
        }
    }

    /// Back to unity, used on hotplug re-enable
    pub fn reset(&mut self) {
        self.factors = [UNITY; BUCKETS];
    }

    /// Current factor for a bucket
    #[inline]
    pub fn factor(&self, bucket: usize) -> u32 {
        self.factors[bucket % BUCKETS]
    }

    /// Scaled prediction, rounded to the nearest microsecond
    pub fn predict(&self, bucket: usize, next_timer_us: u64) -> u32 {
        let timer = next_timer_us.min(u32::MAX as u64);
        let scaled = (timer * self.factor(bucket) as u64 + (UNITY as u64) / 2) / UNITY as u64;
        scaled.min(u32::MAX as u64) as u32
    }

    /// Blend one observation into the bucket
    ///
    /// `measured_us` must already be clamped to `next_timer_us`.
    pub fn update(&mut self, bucket: usize, measured_us: u64, next_timer_us: u64) {
        let slot = &mut self.factors[bucket % BUCKETS];
        let mut factor = *slot;
        factor -= factor / DECAY;

        if next_timer_us > 0 && next_timer_us != NO_TIMER && measured_us < MAX_INTERESTING_US {
            let ratio = (RESOLUTION as u64 * measured_us) / next_timer_us;
            factor += ratio.min(RESOLUTION as u64) as u32;
        } else {
            factor += RESOLUTION;
        }

        // Unreachable with DECAY > 1, kept for DECAY == 1 builds
        if factor == 0 {
            factor = 1;
        }

        *slot = factor;
    }
}

impl Default for CorrectionModel {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! # Typical-Interval Detector
//!
//! Keeps the last [`INTERVALS`] observed idle lengths and looks for a
//! repeating pattern. A tight cluster (standard deviation at most 20 us, or
//! the mean at least six standard deviations) is trusted as a prediction.
//! Outliers are trimmed one at a time, most deviant first, until the pattern
//! holds or too few samples remain.

use crate::{EST_SAMPLE_MIN, INTERVALS};

/// Variance accepted regardless of the mean (20 us standard deviation)
const TIGHT_VARIANCE: u128 = 400;

/// Mean must exceed six standard deviations: avg^2 > 36 * variance
const COV_FACTOR: u128 = 36;

/// Mean of a tight cluster within `samples`, ignoring zero slots
pub fn typical_interval(samples: &[u32; INTERVALS]) -> Option<u32> {
    let mut excluded = [false; INTERVALS];
    let mut count = samples.iter().filter(|&&v| v != 0).count();

    while count > 0 {
        let live = || {
            samples
                .iter()
                .enumerate()
                .filter(|&(i, &v)| v != 0 && !excluded[i])
        };

        let sum: u64 = live().map(|(_, &v)| v as u64).sum();
        let avg = sum / count as u64;

        let variance = live()
            .map(|(_, &v)| {
                let diff = (v as i64 - avg as i64).unsigned_abs() as u128;
                diff * diff
            })
            .sum::<u128>()
            / count as u128;

        let avg_sq = avg as u128 * avg as u128;
        if count >= EST_SAMPLE_MIN && (variance <= TIGHT_VARIANCE || avg_sq > COV_FACTOR * variance) {
            return Some(avg as u32);
        }

        if count <= EST_SAMPLE_MIN {
            return None;
        }

        // Drop the most deviant sample and retry
        let worst = live()
            .max_by_key(|&(_, &v)| (v as i64 - avg as i64).unsigned_abs())
            .map(|(i, _)| i);
        match worst {
            Some(i) => excluded[i] = true,
            None => return None,
        }
        count -= 1;
    }

    None
}

/// Per-CPU ring of recent idle lengths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalHistory {
    intervals: [u32; INTERVALS],
    cursor: usize,
    repeat: bool,
}

impl IntervalHistory {
    /// Empty ring
    pub const fn new() -> Self {
        Self {
            intervals: [0; INTERVALS],
            cursor: 0,
            repeat: false,
        }
    }

    /// Forget everything
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one observed idle length
    pub fn push(&mut self, interval_us: u32) {
        self.intervals[self.cursor] = interval_us;
        self.cursor = (self.cursor + 1) % INTERVALS;
    }

    /// Raw ring contents
    #[inline]
    pub fn samples(&self) -> &[u32; INTERVALS] {
        &self.intervals
    }

    /// Whether the last detection found a repeating pattern
    #[inline]
    pub fn repeat(&self) -> bool {
        self.repeat
    }

    /// Typical interval of the ring, `u32::MAX` when there is none
    ///
    /// Updates the `repeat` flag.
    pub fn get_typical_interval(&mut self) -> u32 {
        let samples = self.intervals;
        self.detect(&samples)
    }

    /// Run detection over externally supplied samples, updating `repeat`
    pub(crate) fn detect(&mut self, samples: &[u32; INTERVALS]) -> u32 {
        match typical_interval(samples) {
            Some(avg) => {
                self.repeat = true;
                avg
            },
            None => {
                self.repeat = false;
                u32::MAX
            },
        }
    }
}

impl Default for IntervalHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_values_repeat() {
        let mut hist = IntervalHistory::new();
        for _ in 0..INTERVALS {
            hist.push(1_234);
        }
        assert_eq!(hist.get_typical_interval(), 1_234);
        assert!(hist.repeat());
    }

    #[test]
    fn test_empty_ring() {
        let mut hist = IntervalHistory::new();
        assert_eq!(hist.get_typical_interval(), u32::MAX);
        assert!(!hist.repeat());
    }

    #[test]
    fn test_too_few_samples() {
        let mut hist = IntervalHistory::new();
        for _ in 0..3 {
            hist.push(500);
        }
        assert_eq!(hist.get_typical_interval(), u32::MAX);
        hist.push(500);
        assert_eq!(hist.get_typical_interval(), 500);
    }

    #[test]
    fn test_outlier_trimmed() {
        let samples = [1_000, 1_010, 990, 1_005, 995, 1_000, 1_002, 90_000];
        assert_eq!(typical_interval(&samples), Some(1_000));
    }

    #[test]
    fn test_low_outlier_trimmed() {
        let samples = [2_000, 2_000, 2_000, 2_000, 2_000, 2_000, 2_000, 3];
        assert_eq!(typical_interval(&samples), Some(2_000));
    }

    #[test]
    fn test_scattered_rejected() {
        let samples = [10, 5_000, 300, 40_000, 90, 12_000, 700, 25_000];
        assert_eq!(typical_interval(&samples), None);

        let mut hist = IntervalHistory::new();
        for v in [1_000u32; INTERVALS] {
            hist.push(v);
        }
        assert_eq!(hist.get_typical_interval(), 1_000);
        for v in samples {
            hist.push(v);
        }
        assert_eq!(hist.get_typical_interval(), u32::MAX);
        assert!(!hist.repeat());
    }

    #[test]
    fn test_cursor_wraps() {
        let mut hist = IntervalHistory::new();
        for v in 1..=(INTERVALS as u32 + 2) {
            hist.push(v);
        }
        assert_eq!(hist.samples()[0], INTERVALS as u32 + 1);
        assert_eq!(hist.samples()[1], INTERVALS as u32 + 2);
        assert_eq!(hist.samples()[2], 3);
    }
}

//! # Idle Statistics
//!
//! Per-CPU counters owned by the CPU's context. Clearing is requested
//! globally by bumping an epoch; each CPU notices the new epoch on its next
//! update and zeroes its own counters, so no cross-CPU write is needed.

use crate::monitor::MonitorKind;
use crate::select::SelectionReason;
use crate::state::StateTable;
use crate::CPUIDLE_STATE_MAX;

/// Counters of one idle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateStats {
    /// Times entered
    pub usage: u64,
    /// Accumulated measured residency (us)
    pub time_us: u64,
    /// Woke before the target residency: state was too deep
    pub above: u64,
    /// A deeper enabled state would have fit: state was too shallow
    pub below: u64,
}

/// Counters of one CPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleStats {
    states: [StateStats; CPUIDLE_STATE_MAX],
    reasons: [u64; SelectionReason::COUNT],
    timer_fires: [u64; MonitorKind::ARMED.len()],
    epoch: u32,
}

impl IdleStats {
    pub const fn new() -> Self {
        Self {
            states: [StateStats {
                usage: 0,
                time_us: 0,
                above: 0,
                below: 0,
            }; CPUIDLE_STATE_MAX],
            reasons: [0; SelectionReason::COUNT],
            timer_fires: [0; MonitorKind::ARMED.len()],
            epoch: 0,
        }
    }

    /// Account one completed idle period
    pub fn custom_collect_stat(&mut self, table: &StateTable, state_idx: usize, measured_us: u32) {
        let Some(entry) = self.states.get_mut(state_idx) else {
            return;
        };
        entry.usage += 1;
        entry.time_us += measured_us as u64;

        let Some(state) = table.get(state_idx) else {
            return;
        };
        if measured_us < state.residency_us {
            entry.above += 1;
        } else if let Some(deeper) = table.next_enabled_after(state_idx).and_then(|i| table.get(i)) {
            if measured_us >= deeper.residency_us {
                entry.below += 1;
            }
        }
    }

    pub fn record_selection(&mut self, reason: SelectionReason) {
        self.reasons[reason.index()] += 1;
    }

    pub fn record_timer_fire(&mut self, kind: MonitorKind) {
        if let Some(i) = kind.armed_index() {
            self.timer_fires[i] += 1;
        }
    }

    /// Counters of one state
    pub fn state(&self, index: usize) -> Option<&StateStats> {
        self.states.get(index)
    }

    /// Selections made for `reason`
    pub fn reason_count(&self, reason: SelectionReason) -> u64 {
        self.reasons[reason.index()]
    }

    /// Monitor-timer fires of `kind`
    pub fn timer_fires(&self, kind: MonitorKind) -> u64 {
        kind.armed_index().map_or(0, |i| self.timer_fires[i])
    }

    /// Zero every counter
    pub fn clear(&mut self) {
        let epoch = self.epoch;
        *self = Self::new();
        self.epoch = epoch;
    }

    /// Clear when a newer global epoch was published
    pub fn sync_epoch(&mut self, epoch: u32) {
        if self.epoch != epoch {
            self.clear();
            self.epoch = epoch;
        }
    }
}

impl Default for IdleStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EffectiveState;

    fn table() -> StateTable {
        let st = |residency_us, disabled| EffectiveState {
            residency_us,
            latency_us: 1,
            polling: false,
            disabled,
        };
        StateTable::from_states(&[st(1, false), st(100, false), st(500, true), st(2_000, false)])
    }

    #[test]
    fn test_above_below() {
        let table = table();
        let mut stats = IdleStats::new();

        stats.custom_collect_stat(&table, 1, 50);
        stats.custom_collect_stat(&table, 1, 800);
        stats.custom_collect_stat(&table, 1, 2_500);
        stats.custom_collect_stat(&table, 3, 9_000);

        let s1 = stats.state(1).copied().unwrap_or_default();
        assert_eq!(s1.usage, 3);
        assert_eq!(s1.time_us, 3_350);
        assert_eq!(s1.above, 1);
        // State 2 is disabled, only 2500 reaches state 3
        assert_eq!(s1.below, 1);

        let s3 = stats.state(3).copied().unwrap_or_default();
        assert_eq!((s3.above, s3.below), (0, 0));
    }

    #[test]
    fn test_epoch_clear() {
        let table = table();
        let mut stats = IdleStats::new();
        stats.custom_collect_stat(&table, 0, 10);
        stats.record_selection(SelectionReason::Latency);
        stats.record_timer_fire(MonitorKind::Inv);
        stats.record_timer_fire(MonitorKind::Stop);
        assert_eq!(stats.reason_count(SelectionReason::Latency), 1);
        assert_eq!(stats.timer_fires(MonitorKind::Inv), 1);
        assert_eq!(stats.timer_fires(MonitorKind::Stop), 0);

        stats.sync_epoch(0);
        assert_eq!(stats.state(0).map(|s| s.usage), Some(1));

        stats.sync_epoch(1);
        assert_eq!(stats.state(0).map(|s| s.usage), Some(0));
        assert_eq!(stats.reason_count(SelectionReason::Latency), 0);
        assert_eq!(stats.timer_fires(MonitorKind::Inv), 0);
    }
}

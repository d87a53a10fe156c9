//! # History-Based Reselection
//!
//! CPUs opted into the extended path keep the last [`HIST_SIZE`] idle periods
//! with their exit timestamps. Before each entry the ring is summarised over
//! a sliding time window and the first choice may be corrected:
//!
//! ```text
//!   ring (newest first)      window = latest.exit - hist_window_size_us
//!   ┌────┬────┬────┬────┬────┬────┐
//!   │ e0 │ e1 │ e2 │ e3 │ e4 │ .. │   e0..e3 in window, e4 too old
//!   └────┴────┴────┴────┴────┴────┘
//!      │    │
//!      │    └─ busy streak: consecutive short residencies from e0
//!      └────── early wakeups: residency < thresh, debounced by step width
//! ```
//!
//! Early-wakeup and busy corrections only ever make the choice shallower.
//! A single monitor-timer miss (`inv_predict == 1`) widens it by one state.
//! Repeated misses suppress reselection for one cycle, then the streak
//! counters restart from zero.

use crate::config::HistTunables;
use crate::monitor::MonitorKind;
use crate::select::{find_state, ScanInput};
use crate::state::StateTable;
use crate::{HIST_SIZE, INTERVALS};

// =============================================================================
// RING
// =============================================================================

/// One observed idle period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistCstateEntry {
    /// State actually entered
    pub idle_state_idx: usize,
    /// State the plain predictor wanted
    pub org_state_idx: usize,
    pub residency_us: u32,
    /// Monotonic exit timestamp (us)
    pub exit_time_us: u64,
}

/// Per-CPU extended history and misprediction streaks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedHistory {
    entries: [HistCstateEntry; HIST_SIZE],
    cursor: usize,
    len: usize,
    /// Consecutive general/inv monitor-timer fires, capped
    inv_predict: u32,
    /// Consecutive repeat monitor-timer fires, capped
    inv_repeat: u32,
    /// Monitor timer fired during the current idle period
    inv_flag: bool,
}

impl ExtendedHistory {
    /// Empty history
    pub const fn new() -> Self {
        Self {
            entries: [HistCstateEntry {
                idle_state_idx: 0,
                org_state_idx: 0,
                residency_us: 0,
                exit_time_us: 0,
            }; HIST_SIZE],
            cursor: 0,
            len: 0,
            inv_predict: 0,
            inv_repeat: 0,
            inv_flag: false,
        }
    }

    /// Forget everything
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one idle period, overwriting the oldest
    pub fn push(&mut self, entry: HistCstateEntry) {
        self.entries[self.cursor] = entry;
        self.cursor = (self.cursor + 1) % HIST_SIZE;
        self.len = (self.len + 1).min(HIST_SIZE);
    }

    /// Number of recorded periods
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing was recorded yet
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `n`-th most recent entry, 0 being the newest
    pub fn nth_recent(&self, n: usize) -> Option<&HistCstateEntry> {
        if n >= self.len {
            return None;
        }
        let slot = (self.cursor + HIST_SIZE - 1 - n) % HIST_SIZE;
        Some(&self.entries[slot])
    }

    /// Entries newest first
    pub fn iter_recent(&self) -> impl Iterator<Item = &HistCstateEntry> + '_ {
        (0..self.len).filter_map(move |n| self.nth_recent(n))
    }

    /// Newest residencies as interval-detector input, zero padded
    pub fn recent_residencies(&self) -> [u32; INTERVALS] {
        let mut out = [0u32; INTERVALS];
        for (slot, e) in out.iter_mut().zip(self.iter_recent()) {
            *slot = e.residency_us;
        }
        out
    }

    /// Misprediction streak
    #[inline]
    pub fn inv_predict(&self) -> u32 {
        self.inv_predict
    }

    /// Repeat-timer streak
    #[inline]
    pub fn inv_repeat(&self) -> u32 {
        self.inv_repeat
    }

    /// Whether the monitor timer fired in the current period
    #[inline]
    pub fn inv_flag(&self) -> bool {
        self.inv_flag
    }

    // -------------------------------------------------------------------------
    // Misprediction streaks
    // -------------------------------------------------------------------------

    /// Monitor timer callback bookkeeping; nothing else happens on fire
    pub fn on_timer_fired(&mut self, kind: MonitorKind, t: &HistTunables) {
        match kind {
            MonitorKind::Repeat => {
                self.inv_repeat = (self.inv_repeat + 1).min(t.repeat_thres);
            },
            MonitorKind::General | MonitorKind::Inv => {
                self.inv_predict = (self.inv_predict + 1).min(t.mispredict_thres);
            },
            MonitorKind::Stop => return,
        }
        self.inv_flag = true;
    }

    /// Consume the per-period fire flag
    pub fn take_inv_flag(&mut self) -> bool {
        core::mem::take(&mut self.inv_flag)
    }

    /// Idle period ended without a monitor-timer fire
    pub fn on_quiet_cycle(&mut self) {
        self.inv_predict = 0;
        self.inv_repeat = self.inv_repeat.saturating_sub(1);
    }

    /// Both streaks below their thresholds
    pub fn reselection_allowed(&self, t: &HistTunables) -> bool {
        self.inv_predict < t.mispredict_thres && self.inv_repeat < t.repeat_thres
    }

    /// Restart streaks that reached their threshold
    pub fn cool_down(&mut self, t: &HistTunables) {
        if self.inv_predict >= t.mispredict_thres {
            self.inv_predict = 0;
        }
        if self.inv_repeat >= t.repeat_thres {
            self.inv_repeat = 0;
        }
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Summarise the in-window part of the ring
    ///
    /// `residency_thresh` marks an early wakeup for the state being judged.
    pub fn calc_stat_info(&self, residency_thresh: u32, t: &HistTunables) -> HistStats {
        let mut stats = HistStats::default();
        let Some(latest) = self.nth_recent(0).copied() else {
            return stats;
        };

        let window_start = latest.exit_time_us.saturating_sub(t.window_size_us as u64);
        let mut busy_run = true;
        let mut step = t.early_wakeup_step_width;
        let mut oldest_entry_us = latest.exit_time_us;

        stats.min_residency_us = u32::MAX;
        for e in self.iter_recent() {
            if e.exit_time_us < window_start || e.exit_time_us > latest.exit_time_us {
                break;
            }

            stats.count += 1;
            stats.total_residency_us += e.residency_us as u64;
            stats.min_residency_us = stats.min_residency_us.min(e.residency_us);
            stats.max_residency_us = stats.max_residency_us.max(e.residency_us);
            oldest_entry_us = e.exit_time_us.saturating_sub(e.residency_us as u64);

            if busy_run && e.residency_us < t.min_duration_us {
                stats.busy_cnt += 1;
                stats.busy_residency_us += e.residency_us as u64;
            } else {
                busy_run = false;
            }

            if e.residency_us < residency_thresh && step > 0 {
                stats.early_wakeup_cnt += 1;
                stats.early_wakeup_residency_us += e.residency_us as u64;
                step = t.early_wakeup_step_width;
            } else {
                step = step.saturating_sub(1);
            }
        }

        stats.total_us = latest.exit_time_us - oldest_entry_us.min(latest.exit_time_us);

        if let Some(prev) = self.nth_recent(1) {
            let entry_us = latest.exit_time_us.saturating_sub(latest.residency_us as u64);
            stats.last_exec_us = entry_us.saturating_sub(prev.exit_time_us);
        }

        stats
    }

    // -------------------------------------------------------------------------
    // Reselection
    // -------------------------------------------------------------------------

    /// Correct the plain choice `org_idx` using the ring
    ///
    /// `scan` is the input the plain choice was made with. The caller checks
    /// opt-in, `org_idx > 0` and the streak thresholds.
    pub fn reselect(&self, table: &StateTable, scan: &ScanInput, org_idx: usize, t: &HistTunables) -> Reselection {
        let mut result = Reselection {
            index: org_idx,
            predicted_us: scan.predicted_us,
            early_wakeup: false,
            busy: BusyLevel::Idle,
            widened: false,
        };
        let Some(cur) = table.get(org_idx) else {
            return result;
        };

        let deepest = table.deepest_enabled();
        let stats = self.calc_stat_info(cur.cost_us() / 2, t);

        // Early wakeups: tolerate one more near the deepest states
        let mut thres = t.early_wakeup_thres;
        if (deepest.saturating_sub(org_idx) as u32) < t.early_wakeup_depth {
            thres += 1;
        }
        if stats.early_wakeup_cnt > thres {
            let avg = stats.early_wakeup_avg_us();
            let fail_us = scan.predicted_us.min(avg);
            let out = find_state(table, &ScanInput { predicted_us: fail_us, ..*scan });
            if out.index < result.index {
                result.index = out.index;
                result.predicted_us = fail_us;
                result.early_wakeup = true;
            }
        }

        // Busy CPU close to the deepest state
        let busy = busy_flag(&stats, t);
        result.busy = busy;
        if busy != BusyLevel::Idle && (deepest.saturating_sub(result.index) as u32) < t.busy_depth {
            let target = match busy {
                BusyLevel::ShortWakes if stats.busy_cnt > 0 => stats.busy_avg_us(),
                _ if stats.count > 0 => stats.avg_residency_us(),
                _ => t.hrtimer_min_us,
            };
            let target = target.min(scan.predicted_us);
            let out = find_state(table, &ScanInput { predicted_us: target, ..*scan });
            if out.index < result.index {
                result.index = out.index;
                result.predicted_us = target;
            }
        }

        // One monitor-timer miss: try one state deeper, exactly once.
        // Skipped when a correction above already went shallower, and the
        // deeper state must still fit the latency budget.
        if self.inv_predict == 1 && result.index == org_idx {
            let wider = (org_idx + 1).min(table.len().saturating_sub(1));
            let fits = table.get(wider).is_some_and(|s| s.latency_us <= scan.latency_req_us);
            if wider > org_idx && fits {
                result.index = wider;
                result.widened = true;
            }
        }

        if !table.is_enabled(result.index) {
            result = Reselection {
                index: org_idx,
                predicted_us: scan.predicted_us,
                early_wakeup: false,
                busy,
                widened: false,
            };
        }

        #[cfg(feature = "trace")]
        log::trace!(
            "cpuidle: reselect {} -> {} (early {}/{}, busy {:?})",
            org_idx,
            result.index,
            stats.early_wakeup_cnt,
            thres,
            busy
        );

        result
    }
}

impl Default for ExtendedHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Summary of the in-window history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistStats {
    /// In-window entries
    pub count: u32,
    pub total_residency_us: u64,
    pub min_residency_us: u32,
    pub max_residency_us: u32,
    /// Consecutive short residencies from the newest entry
    pub busy_cnt: u32,
    pub busy_residency_us: u64,
    /// Debounced early wakeups
    pub early_wakeup_cnt: u32,
    pub early_wakeup_residency_us: u64,
    /// Span from the oldest in-window idle entry to the newest exit
    pub total_us: u64,
    /// Run time between the two newest idle periods
    pub last_exec_us: u64,
}

impl HistStats {
    /// Mean in-window residency; callers ensure `count > 0`
    fn avg_residency_us(&self) -> u32 {
        (self.total_residency_us / self.count.max(1) as u64) as u32
    }

    fn busy_avg_us(&self) -> u32 {
        (self.busy_residency_us / self.busy_cnt.max(1) as u64) as u32
    }

    fn early_wakeup_avg_us(&self) -> u32 {
        (self.early_wakeup_residency_us / self.early_wakeup_cnt.max(1) as u64) as u32
    }
}

/// How busy the recent history looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BusyLevel {
    Idle         = 0,
    /// Frequent short wakes
    ShortWakes   = 1,
    /// Sustained low idle ratio
    LowIdleRatio = 2,
}

/// Classify the window, first matching test wins
pub fn busy_flag(stats: &HistStats, t: &HistTunables) -> BusyLevel {
    if stats.count == 0 {
        return BusyLevel::Idle;
    }

    if stats.busy_cnt > t.recent_busy_thres {
        return BusyLevel::ShortWakes;
    }

    if stats.last_exec_us > t.long_exec_us as u64
        && (stats.min_residency_us < t.min_duration_us || stats.max_residency_us < t.max_duration_us)
    {
        return BusyLevel::LowIdleRatio;
    }

    if stats.count > t.idle_cnt && stats.avg_residency_us() < t.avg_duration_us {
        return BusyLevel::ShortWakes;
    }

    let idle = stats.total_residency_us;
    if idle + (t.total_exec_us as u64) < stats.total_us || idle * 100 < t.idle_ratio as u64 * stats.total_us {
        return BusyLevel::LowIdleRatio;
    }

    BusyLevel::Idle
}

/// Outcome of one reselection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reselection {
    pub index: usize,
    /// Idle length the corrected choice assumed
    pub predicted_us: u32,
    pub early_wakeup: bool,
    pub busy: BusyLevel,
    /// One-step deeper correction applied
    pub widened: bool,
}

// =============================================================================
// TESTS
// =============================================================================

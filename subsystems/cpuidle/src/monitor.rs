//! # Misprediction Monitor Timer
//!
//! When a shallow state is chosen on an opted-in CPU, a one-shot timer is
//! armed a little past the predicted wakeup. If the CPU is still idle when it
//! fires, the prediction was too short: the callback only records that fact,
//! and the next selection widens or stops reselecting.
//!
//! The platform owns the actual hardware timer and drives it through
//! [`MonitorTimerOps`]. Arming and cancelling never block.
//!
//! A fire truncates the idle period it interrupted. The truncated residency
//! is carried over and added to the next one, so the history sees one long
//! idle period instead of two short ones.

use crate::config::HistTunables;
use crate::state::StateTable;

/// Why a monitor timer was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MonitorKind {
    /// Not armed
    Stop    = 0,
    /// A repeating interval pattern was detected
    Repeat  = 1,
    /// Plain shallow choice
    General = 2,
    /// Reselection went shallower than the plain choice
    Inv     = 3,
}

impl MonitorKind {
    /// Armed kinds, for per-kind counters
    pub const ARMED: [MonitorKind; 3] = [MonitorKind::Repeat, MonitorKind::General, MonitorKind::Inv];

    /// Dense index among armed kinds
    #[inline]
    pub const fn armed_index(self) -> Option<usize> {
        match self {
            MonitorKind::Stop => None,
            MonitorKind::Repeat => Some(0),
            MonitorKind::General => Some(1),
            MonitorKind::Inv => Some(2),
        }
    }
}

/// Platform high-resolution timer service
pub trait MonitorTimerOps {
    /// Arm a one-shot timer on `cpu` expiring after `duration_us`
    ///
    /// On expiry the platform calls `CpuIdleContext::monitor_timer_fired`
    /// with the same `kind`.
    fn arm(&mut self, cpu: u32, duration_us: u32, kind: MonitorKind);

    /// Cancel the timer on `cpu` without waiting for a running callback
    ///
    /// Returns `true` if a pending expiry was removed.
    fn cancel(&mut self, cpu: u32) -> bool;
}

/// Timer service for platforms without a monitor timer
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMonitorTimer;

impl MonitorTimerOps for NoMonitorTimer {
    fn arm(&mut self, _cpu: u32, _duration_us: u32, _kind: MonitorKind) {}

    fn cancel(&mut self, _cpu: u32) -> bool {
        false
    }
}

// =============================================================================
// PER-CPU TIMER STATE
// =============================================================================

/// Planned arming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPlan {
    pub kind: MonitorKind,
    pub duration_us: u32,
}

/// Monitor timer bookkeeping of one CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTimer {
    kind: MonitorKind,
    duration_us: u32,
    /// Kind of the timer that fired during the current idle period
    fired: Option<MonitorKind>,
    /// Truncated residency waiting to be merged
    carried_us: Option<u32>,
}

impl MonitorTimer {
    pub const fn new() -> Self {
        Self {
            kind: MonitorKind::Stop,
            duration_us: 0,
            fired: None,
            carried_us: None,
        }
    }

    /// Currently armed kind
    #[inline]
    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    /// Length of the current or last arming
    #[inline]
    pub fn duration_us(&self) -> u32 {
        self.duration_us
    }

    /// Whether a fire is pending consumption
    #[inline]
    pub fn hrtime_out(&self) -> bool {
        self.fired.is_some()
    }

    /// Whether a truncated residency is waiting to be merged
    #[inline]
    pub fn hrtime_addtime(&self) -> bool {
        self.carried_us.is_some()
    }

    /// Decide whether and how long to arm
    ///
    /// `idx` is the final choice, `raw_idx` the plain predictor's choice. The
    /// caller checks opt-in and the frequency profile.
    pub fn plan(
        table: &StateTable,
        idx: usize,
        raw_idx: usize,
        next_timer_us: u64,
        predicted_us: u32,
        repeat: bool,
        t: &HistTunables,
    ) -> Option<MonitorPlan> {
        if idx >= table.deepest_enabled() {
            return None;
        }
        let cur = table.get(idx)?;
        let next = table.get(table.next_enabled_after(idx)?)?;
        let next_cost = next.cost_us();

        // The real wakeup comes before a deeper state could pay off
        if next_timer_us <= next_cost as u64 {
            return None;
        }

        let kind = if idx < raw_idx {
            MonitorKind::Inv
        } else if repeat {
            MonitorKind::Repeat
        } else {
            MonitorKind::General
        };

        let mut duration = predicted_us.saturating_add(t.hrtimer_offset_us);
        duration = duration.max(next.residency_us / 2).min(next.residency_us);
        duration = duration.max(cur.residency_us);
        duration = duration.max(t.hrtimer_min_us).min(t.hrtimer_max_us);

        if duration == 0 || duration as u64 >= next_timer_us {
            return None;
        }

        Some(MonitorPlan { kind, duration_us: duration })
    }

    /// Arm through the platform
    pub fn arm(&mut self, cpu: u32, plan: MonitorPlan, ops: &mut impl MonitorTimerOps) {
        if plan.kind == MonitorKind::Stop {
            return;
        }
        self.kind = plan.kind;
        self.duration_us = plan.duration_us;
        ops.arm(cpu, plan.duration_us, plan.kind);
    }

    /// Cancel an armed timer that has not fired yet
    pub fn cancel(&mut self, cpu: u32, ops: &mut impl MonitorTimerOps) {
        if self.kind != MonitorKind::Stop && self.fired.is_none() {
            ops.cancel(cpu);
        }
        self.kind = MonitorKind::Stop;
    }

    /// Expiry bookkeeping
    ///
    /// Returns the kind to account for, or `None` for a stale expiry that
    /// raced with cancellation.
    pub fn fire(&mut self, kind: MonitorKind) -> Option<MonitorKind> {
        if self.kind == MonitorKind::Stop || self.kind != kind {
            return None;
        }
        self.kind = MonitorKind::Stop;
        self.fired = Some(kind);
        Some(kind)
    }

    /// Consume the pending fire, if any
    pub fn take_fired(&mut self) -> Option<MonitorKind> {
        self.fired.take()
    }

    /// Merge truncated residencies
    ///
    /// A period cut short by a fire is held back and `None` returned; the
    /// next uninterrupted period comes back with the held time added.
    pub fn merge_residency(&mut self, residency_us: u32, fired: bool) -> Option<u32> {
        if fired {
            let carried = self.carried_us.unwrap_or(0);
            self.carried_us = Some(carried.saturating_add(residency_us));
            return None;
        }
        let carried = self.carried_us.take().unwrap_or(0);
        Some(residency_us.saturating_add(carried))
    }

    /// Drop all state without touching the platform timer
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for MonitorTimer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

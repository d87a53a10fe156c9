//! # Idle State Tables
//!
//! The governor does not own idle states. The cpuidle driver describes them
//! through [`CpuIdleDriver`]; index 0 is the shallowest state (often a polling
//! loop) and deeper indices save more power at a higher exit latency.
//!
//! Every `select()` builds a [`StateTable`] on the stack: residency and
//! latency come from the per-CPU override mirror (see `cluster`), the polling
//! flag and the enable bit come from the driver at call time.

use bitflags::bitflags;
use heapless::Vec;

use crate::CPUIDLE_STATE_MAX;

bitflags! {
    /// Driver-provided idle state properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u32 {
        /// Busy-wait loop rather than a hardware sleep
        const POLLING    = 1 << 0;
        /// State is shared with sibling CPUs
        const COUPLED    = 1 << 1;
        /// Local timer stops in this state
        const TIMER_STOP = 1 << 2;
    }
}

/// Static description of one idle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleStateDesc {
    pub name: &'static str,
    /// Minimum sleep length that breaks even (us)
    pub residency_us: u32,
    /// Exit latency (us)
    pub latency_us: u32,
    pub flags: StateFlags,
}

impl IdleStateDesc {
    /// Plain hardware state
    pub const fn new(name: &'static str, residency_us: u32, latency_us: u32) -> Self {
        Self {
            name,
            residency_us,
            latency_us,
            flags: StateFlags::empty(),
        }
    }

    /// Busy-wait state
    pub const fn polling(name: &'static str, residency_us: u32, latency_us: u32) -> Self {
        Self {
            name,
            residency_us,
            latency_us,
            flags: StateFlags::POLLING,
        }
    }

    /// Whether this is a busy-wait state
    #[inline]
    pub const fn is_polling(&self) -> bool {
        self.flags.contains(StateFlags::POLLING)
    }
}

/// Residency/latency pair as mirrored per CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdleStateConfig {
    pub residency_us: u32,
    pub latency_us: u32,
}

/// Capability query served by the cpuidle driver
///
/// Both methods are called on every `select()`; nothing is cached across
/// calls.
pub trait CpuIdleDriver {
    /// Idle states available on `cpu`, shallowest first
    fn states(&self, cpu: u32) -> &[IdleStateDesc];

    /// Whether state `index` is administratively disabled on `cpu`
    fn is_disabled(&self, cpu: u32, index: usize) -> bool;
}

/// Fixed-capacity driver table, usable by platform glue without a heap
#[derive(Debug, Clone, Default)]
pub struct IdleDriverTable {
    states: Vec<IdleStateDesc, CPUIDLE_STATE_MAX>,
    disabled: [bool; CPUIDLE_STATE_MAX],
}

impl IdleDriverTable {
    /// Build from a slice; states beyond `CPUIDLE_STATE_MAX` are dropped
    pub fn new(states: &[IdleStateDesc]) -> Self {
        let mut table = Self::default();
        for desc in states.iter().take(CPUIDLE_STATE_MAX) {
            let _ = table.states.push(*desc);
        }
        table
    }

    /// Enable or disable one state
    pub fn set_disabled(&mut self, index: usize, disabled: bool) {
        if let Some(slot) = self.disabled.get_mut(index) {
            *slot = disabled;
        }
    }
}

impl CpuIdleDriver for IdleDriverTable {
    fn states(&self, _cpu: u32) -> &[IdleStateDesc] {
        &self.states
    }

    fn is_disabled(&self, _cpu: u32, index: usize) -> bool {
        self.disabled.get(index).copied().unwrap_or(true)
    }
}

// =============================================================================
// EFFECTIVE STATE TABLE
// =============================================================================

/// One state as seen by a single decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveState {
    pub residency_us: u32,
    pub latency_us: u32,
    pub polling: bool,
    pub disabled: bool,
}

impl EffectiveState {
    /// Residency plus exit latency
    #[inline]
    pub const fn cost_us(&self) -> u32 {
        self.residency_us.saturating_add(self.latency_us)
    }
}

/// Per-call snapshot of the CPU's idle states
#[derive(Debug, Clone, Default)]
pub struct StateTable {
    states: Vec<EffectiveState, CPUIDLE_STATE_MAX>,
}

impl StateTable {
    /// Build from effective entries; extra entries are dropped
    pub fn from_states(states: &[EffectiveState]) -> Self {
        let mut table = Self::default();
        for s in states.iter().take(CPUIDLE_STATE_MAX) {
            let _ = table.states.push(*s);
        }
        table
    }

    /// Append one state, ignored when full
    pub(crate) fn push(&mut self, state: EffectiveState) {
        let _ = self.states.push(state);
    }

    /// Number of states
    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the table is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// State at `index`
    #[inline]
    pub fn get(&self, index: usize) -> Option<&EffectiveState> {
        self.states.get(index)
    }

    /// All states
    #[inline]
    pub fn as_slice(&self) -> &[EffectiveState] {
        &self.states
    }

    /// Whether `index` names an enabled state
    #[inline]
    pub fn is_enabled(&self, index: usize) -> bool {
        self.states.get(index).is_some_and(|s| !s.disabled)
    }

    /// Deepest enabled state, or 0
    pub fn deepest_enabled(&self) -> usize {
        self.states
            .iter()
            .rposition(|s| !s.disabled)
            .unwrap_or(0)
    }

    /// First enabled state deeper than `index`
    pub fn next_enabled_after(&self, index: usize) -> Option<usize> {
        (index + 1..self.states.len()).find(|&i| !self.states[i].disabled)
    }

    /// Nearest enabled state at or below `cap`, or 0 when none is enabled
    pub fn enabled_at_or_below(&self, cap: usize) -> usize {
        let top = cap.min(self.states.len().saturating_sub(1));
        (0..=top)
            .rev()
            .find(|&i| !self.states[i].disabled)
            .unwrap_or(0)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn eff(residency_us: u32, latency_us: u32, disabled: bool) -> EffectiveState {
        EffectiveState {
            residency_us,
            latency_us,
            polling: false,
            disabled,
        }
    }

    #[test]
    fn test_driver_table_disabled_out_of_range() {
        let mut drv = IdleDriverTable::new(&[
            IdleStateDesc::polling("poll", 1, 1),
            IdleStateDesc::new("wfi", 70, 10),
        ]);
        assert_eq!(drv.states(0).len(), 2);
        assert!(drv.states(0)[0].is_polling());
        assert!(!drv.is_disabled(0, 1));
        drv.set_disabled(1, true);
        assert!(drv.is_disabled(0, 1));
        assert!(drv.is_disabled(0, CPUIDLE_STATE_MAX));
    }

    #[test]
    fn test_table_walks() {
        let table = StateTable::from_states(&[
            eff(1, 1, false),
            eff(70, 10, true),
            eff(1000, 100, false),
            eff(5000, 500, true),
        ]);
        assert_eq!(table.deepest_enabled(), 2);
        assert_eq!(table.next_enabled_after(0), Some(2));
        assert_eq!(table.next_enabled_after(2), None);
        assert_eq!(table.enabled_at_or_below(1), 0);
        assert_eq!(table.enabled_at_or_below(9), 2);
        assert_eq!(table.get(2).map(|s| s.cost_us()), Some(1100));
    }

    #[test]
    fn test_all_disabled_maps_to_zero() {
        let table = StateTable::from_states(&[eff(1, 1, true), eff(70, 10, true)]);
        assert_eq!(table.deepest_enabled(), 0);
        assert_eq!(table.enabled_at_or_below(1), 0);
        assert!(!table.is_enabled(0));
    }
}

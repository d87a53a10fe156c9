//! # Idle-State Selector
//!
//! Picks the deepest enabled state whose target residency fits the predicted
//! idle length and whose exit latency fits the latency budget. States are
//! scanned shallow to deep; deeper states are assumed to be no cheaper in
//! either residency or latency.

use crate::state::StateTable;

// =============================================================================
// SELECTION RESULT
// =============================================================================

/// Why the final depth was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SelectionReason {
    /// Plain prediction, unchanged
    Origin  = 0,
    /// History reselection or misprediction widening changed the prediction
    Predict = 1,
    /// Latency budget stopped the scan
    Latency = 2,
    /// CPU is halted by the scheduler integration
    Halted  = 3,
    /// An administrative depth cap clamped the result
    Limited = 4,
    /// An IPI is pending
    Ipi     = 5,
}

impl SelectionReason {
    /// Number of reasons
    pub const COUNT: usize = 6;

    /// Whether an external constraint, not the predictor, decided
    pub const fn is_forced(self) -> bool {
        match self {
            SelectionReason::Origin | SelectionReason::Predict | SelectionReason::Halted => false,
            SelectionReason::Latency | SelectionReason::Limited | SelectionReason::Ipi => true,
        }
    }

    /// Dense index for counters
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Outcome of one `select()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Idle state to enter
    pub state_idx: usize,
    /// Idle length the decision assumed (us)
    pub predicted_us: u32,
    /// Distance to the next known wake event (us)
    pub next_timer_us: u64,
    pub reason: SelectionReason,
    /// Whether the periodic tick may be stopped
    pub stop_tick: bool,
}

impl Selection {
    /// Shallowest state, tick kept running
    pub const fn shallowest(next_timer_us: u64, reason: SelectionReason) -> Self {
        Self {
            state_idx: 0,
            predicted_us: 0,
            next_timer_us,
            reason,
            stop_tick: false,
        }
    }
}

// =============================================================================
// SCAN
// =============================================================================

/// Inputs of one scan over the state table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanInput {
    pub predicted_us: u32,
    pub next_timer_us: u64,
    pub latency_req_us: u32,
    pub tick_us: u32,
}

/// Result of one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub index: usize,
    pub predicted_us: u32,
    /// `Origin` or `Latency`
    pub reason: SelectionReason,
    pub stop_tick: bool,
}

/// Latency divisor for CPUs with tasks waiting on I/O
#[inline]
pub const fn performance_multiplier(nr_iowaiters: u32) -> u32 {
    1u32.saturating_add(nr_iowaiters.saturating_mul(10))
}

/// Latency budget after the I/O-wait interactivity tightening
///
/// Only applied once the prediction exceeds one tick period.
pub fn latency_budget(latency_req_us: u32, predicted_us: u32, nr_iowaiters: u32, tick_us: u32) -> u32 {
    if predicted_us > tick_us {
        latency_req_us.min(predicted_us / performance_multiplier(nr_iowaiters))
    } else {
        latency_req_us
    }
}

/// Cases where state 0 is the only sensible choice
///
/// Evaluated on the raw timer distance before any prediction work.
pub fn short_circuit(table: &StateTable, next_timer_us: u64, latency_req_us: u32) -> Option<ScanOutcome> {
    let s0 = table.get(0)?;
    let outcome = |reason| ScanOutcome {
        index: 0,
        predicted_us: 0,
        reason,
        stop_tick: !s0.polling,
    };

    let Some(s1) = table.get(1) else {
        return Some(outcome(SelectionReason::Origin));
    };
    if latency_req_us == 0 {
        return Some(outcome(SelectionReason::Latency));
    }
    if s0.disabled {
        return None;
    }
    if latency_req_us < s1.latency_us {
        return Some(outcome(SelectionReason::Latency));
    }
    if next_timer_us < s1.residency_us as u64 {
        return Some(outcome(SelectionReason::Origin));
    }
    None
}

/// Deepest state satisfying residency and latency
pub fn find_state(table: &StateTable, input: &ScanInput) -> ScanOutcome {
    let states = table.as_slice();
    let mut predicted = input.predicted_us;
    let mut reason = SelectionReason::Origin;
    let mut idx: Option<usize> = None;

    for (i, s) in states.iter().enumerate() {
        if s.disabled {
            continue;
        }
        let cur = *idx.get_or_insert(i);

        if s.residency_us > predicted {
            // Prefer a real sleep over polling when a timer will end it anyway
            if states[cur].polling
                && s.latency_us <= input.latency_req_us
                && s.residency_us as u64 <= input.next_timer_us
            {
                predicted = s.residency_us;
                idx = Some(i);
                break;
            }
            if predicted >= input.tick_us {
                // Tick keeps running: waking early from a shallow state is cheap
                predicted = states[cur].residency_us;
            }
            break;
        }
        if s.latency_us > input.latency_req_us {
            reason = SelectionReason::Latency;
            break;
        }
        idx = Some(i);
    }

    let mut index = idx.unwrap_or(0);

    // The first enabled state may itself miss the budget
    if index > 0 && states[index].latency_us > input.latency_req_us {
        index = 0;
        reason = SelectionReason::Latency;
    }

    let mut stop_tick = true;
    let shallow = states.get(index).is_some_and(|s| s.polling);
    if shallow || predicted < input.tick_us {
        stop_tick = false;

        // The tick stays on, so the state must fit before the next timer
        if index > 0 && states[index].residency_us as u64 > input.next_timer_us {
            for i in (0..index).rev() {
                if states[i].disabled {
                    continue;
                }
                index = i;
                if states[i].residency_us as u64 <= input.next_timer_us {
                    break;
                }
            }
        }
    }

    ScanOutcome {
        index,
        predicted_us: predicted,
        reason,
        stop_tick,
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! # Governor Configuration
//!
//! Two kinds of configuration exist:
//!
//! - [`GovernorConfig`]: fixed when the governor is created (CPU count, tick
//!   period).
//! - [`Tunable`]: numeric knobs adjustable at runtime from any CPU. They live
//!   in relaxed atomics inside [`TunableSet`] and are copied into a
//!   [`HistTunables`] snapshot once per `select()`, so one decision always
//!   sees a consistent set.
//!
//! The per-CPU opt-in for the extended-history path is a [`CpuMask`].

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{ErrorKind, GovernorError, GovernorResult};
use crate::{DEFAULT_TICK_US, MAX_CPUS};

// =============================================================================
// TUNABLES
// =============================================================================

/// Runtime-adjustable governor parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Tunable {
    /// Sliding window for the history statistics (us)
    HistWindowSizeUs,
    /// Residency below which an idle period counts as busy (us)
    HistMinDurationUs,
    /// Maximum residency still considered short after a long run (us)
    HistMaxDurationUs,
    /// Average residency below which the CPU is busy (us)
    HistAvgDurationUs,
    /// Minimum in-window sample count for the average test
    HistIdleCnt,
    /// Idle ratio (percent of window) below which the CPU is busy
    HistIdleRatio,
    /// Run length that marks a long execution (us)
    HistLongExecUs,
    /// Non-idle time in the window that marks the CPU busy (us)
    HistTotalExecUs,
    /// Busy streak length that triggers busy classification
    HistRecentBusyThres,
    /// Distance from the deepest state inside which busy reselection runs
    HistBusyDepth,
    /// Look-back width of the early-wakeup debounce
    HistEarlyWakeupStepWidth,
    /// Distance from the deepest state inside which the threshold is bumped
    HistEarlyWakeupDepth,
    /// Early wakeups needed to reselect
    HistEarlyWakeupThres,
    /// Mispredict streak that suppresses reselection
    HistMispredictThres,
    /// Repeat-timer streak that suppresses reselection
    HistRepeatThres,
    /// Slack added to the predicted interval when arming the monitor timer (us)
    HrtimerOffsetUs,
    /// Shortest monitor timer (us)
    HrtimerMinUs,
    /// Longest monitor timer (us)
    HrtimerMaxUs,
    /// Frequency above which the monitor timer is used (kHz)
    MenuSwitchProfile,
    /// Next-wake distance beyond which the first choice is trusted (ms)
    PerfectCstateMs,
}

/// Static description of one tunable
#[derive(Debug, Clone, Copy)]
struct TunableSpec {
    name: &'static str,
    default: u32,
    min: u32,
    max: u32,
}

const fn spec(name: &'static str, default: u32, min: u32, max: u32) -> TunableSpec {
    TunableSpec {
        name,
        default,
        min,
        max,
    }
}

/// Indexed by `Tunable as usize`
const SPECS: [TunableSpec; Tunable::COUNT] = [
    spec("hist_window_size_us", 20_000, 1, 1_000_000),
    spec("hist_min_duration_us", 500, 0, 1_000_000),
    spec("hist_max_duration_us", 3_000, 0, 1_000_000),
    spec("hist_avg_duration_us", 800, 0, 1_000_000),
    spec("hist_idle_cnt", 4, 0, crate::HIST_SIZE as u32),
    spec("hist_idle_ratio", 30, 0, 100),
    spec("hist_long_exec_us", 1_000, 0, 1_000_000),
    spec("hist_total_exec_us", 5_000, 0, 1_000_000),
    spec("hist_recent_busy_thres", 1, 0, crate::HIST_SIZE as u32),
    spec("hist_busy_depth", 2, 0, crate::CPUIDLE_STATE_MAX as u32),
    spec("hist_early_wakeup_step_width", 3, 1, crate::HIST_SIZE as u32),
    spec("hist_early_wakeup_depth", 1, 0, crate::CPUIDLE_STATE_MAX as u32),
    spec("hist_early_wakeup_thres", 2, 0, crate::HIST_SIZE as u32),
    spec("hist_mispredict_thres", 2, 1, 64),
    spec("hist_repeat_thres", 2, 1, 64),
    spec("hrtimer_offset_us", 100, 0, 100_000),
    spec("hrtimer_min_us", 800, 1, 1_000_000),
    spec("hrtimer_max_us", 20_000, 1, 1_000_000),
    spec("menu_switch_profile", 1_600_000, 0, u32::MAX),
    spec("perfect_cstate_ms", 50, 1, 10_000),
];

impl Tunable {
    /// Number of tunables
    pub const COUNT: usize = 20;

    /// All tunables in declaration order
    pub const ALL: [Tunable; Tunable::COUNT] = [
        Tunable::HistWindowSizeUs,
        Tunable::HistMinDurationUs,
        Tunable::HistMaxDurationUs,
        Tunable::HistAvgDurationUs,
        Tunable::HistIdleCnt,
        Tunable::HistIdleRatio,
        Tunable::HistLongExecUs,
        Tunable::HistTotalExecUs,
        Tunable::HistRecentBusyThres,
        Tunable::HistBusyDepth,
        Tunable::HistEarlyWakeupStepWidth,
        Tunable::HistEarlyWakeupDepth,
        Tunable::HistEarlyWakeupThres,
        Tunable::HistMispredictThres,
        Tunable::HistRepeatThres,
        Tunable::HrtimerOffsetUs,
        Tunable::HrtimerMinUs,
        Tunable::HrtimerMaxUs,
        Tunable::MenuSwitchProfile,
        Tunable::PerfectCstateMs,
    ];

    /// Externally visible parameter name
    pub const fn name(self) -> &'static str {
        SPECS[self as usize].name
    }

    /// Value used until an administrator changes it
    pub const fn default_value(self) -> u32 {
        SPECS[self as usize].default
    }

    /// Inclusive accepted range
    pub const fn range(self) -> (u32, u32) {
        let s = SPECS[self as usize];
        (s.min, s.max)
    }

    /// Look a tunable up by its external name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
}

// =============================================================================
// TUNABLE SNAPSHOT
// =============================================================================

/// Plain copy of every tunable, taken once per decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistTunables {
    pub window_size_us: u32,
    pub min_duration_us: u32,
    pub max_duration_us: u32,
    pub avg_duration_us: u32,
    pub idle_cnt: u32,
    pub idle_ratio: u32,
    pub long_exec_us: u32,
    pub total_exec_us: u32,
    pub recent_busy_thres: u32,
    pub busy_depth: u32,
    pub early_wakeup_step_width: u32,
    pub early_wakeup_depth: u32,
    pub early_wakeup_thres: u32,
    pub mispredict_thres: u32,
    pub repeat_thres: u32,
    pub hrtimer_offset_us: u32,
    pub hrtimer_min_us: u32,
    pub hrtimer_max_us: u32,
    pub switch_profile_khz: u32,
    pub perfect_cstate_ms: u32,
}

impl HistTunables {
    fn from_fn(get: impl Fn(Tunable) -> u32) -> Self {
        Self {
            window_size_us: get(Tunable::HistWindowSizeUs),
            min_duration_us: get(Tunable::HistMinDurationUs),
            max_duration_us: get(Tunable::HistMaxDurationUs),
            avg_duration_us: get(Tunable::HistAvgDurationUs),
            idle_cnt: get(Tunable::HistIdleCnt),
            idle_ratio: get(Tunable::HistIdleRatio),
            long_exec_us: get(Tunable::HistLongExecUs),
            total_exec_us: get(Tunable::HistTotalExecUs),
            recent_busy_thres: get(Tunable::HistRecentBusyThres),
            busy_depth: get(Tunable::HistBusyDepth),
            early_wakeup_step_width: get(Tunable::HistEarlyWakeupStepWidth),
            early_wakeup_depth: get(Tunable::HistEarlyWakeupDepth),
            early_wakeup_thres: get(Tunable::HistEarlyWakeupThres),
            mispredict_thres: get(Tunable::HistMispredictThres),
            repeat_thres: get(Tunable::HistRepeatThres),
            hrtimer_offset_us: get(Tunable::HrtimerOffsetUs),
            hrtimer_min_us: get(Tunable::HrtimerMinUs),
            hrtimer_max_us: get(Tunable::HrtimerMaxUs),
            switch_profile_khz: get(Tunable::MenuSwitchProfile),
            perfect_cstate_ms: get(Tunable::PerfectCstateMs),
        }
    }
}

impl Default for HistTunables {
    fn default() -> Self {
        Self::from_fn(Tunable::default_value)
    }
}

// =============================================================================
// TUNABLE SET
// =============================================================================

/// Shared, lock-free tunable storage
#[derive(Debug)]
pub struct TunableSet {
    values: [AtomicU32; Tunable::COUNT],
}

impl TunableSet {
    /// Create a set holding the defaults
    pub fn new() -> Self {
        Self {
            values: core::array::from_fn(|i| AtomicU32::new(Tunable::ALL[i].default_value())),
        }
    }

    /// Current value
    #[inline]
    pub fn get(&self, tunable: Tunable) -> u32 {
        self.values[tunable as usize].load(Ordering::Relaxed)
    }

    /// Validate and store a new value
    pub fn set(&self, tunable: Tunable, value: u32) -> GovernorResult<()> {
        let (min, max) = tunable.range();
        if value < min || value > max {
            log::warn!(
                "cpuidle: {} = {} rejected (range {}..={})",
                tunable.name(),
                value,
                min,
                max
            );
            return Err(GovernorError::new(
                ErrorKind::OutOfRange,
                "tunable value outside accepted range",
            ));
        }

        let conflict = match tunable {
            Tunable::HrtimerMinUs => value > self.get(Tunable::HrtimerMaxUs),
            Tunable::HrtimerMaxUs => value < self.get(Tunable::HrtimerMinUs),
            _ => false,
        };
        if conflict {
            log::warn!("cpuidle: {} = {} conflicts with hrtimer bounds", tunable.name(), value);
            return Err(GovernorError::new(
                ErrorKind::Conflict,
                "hrtimer_min_us must not exceed hrtimer_max_us",
            ));
        }

        self.values[tunable as usize].store(value, Ordering::Relaxed);
        log::debug!("cpuidle: {} = {}", tunable.name(), value);
        Ok(())
    }

    /// Store a value addressed by external name
    pub fn set_by_name(&self, name: &str, value: u32) -> GovernorResult<()> {
        let tunable = Tunable::from_name(name)
            .ok_or(GovernorError::new(ErrorKind::NotFound, "unknown tunable"))?;
        self.set(tunable, value)
    }

    /// Restore every default
    pub fn reset(&self) {
        for t in Tunable::ALL {
            self.values[t as usize].store(t.default_value(), Ordering::Relaxed);
        }
    }

    /// Copy all values for one decision
    pub fn snapshot(&self) -> HistTunables {
        HistTunables::from_fn(|t| self.get(t))
    }
}

impl Default for TunableSet {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CPU MASK
// =============================================================================

/// Set of logical CPUs, one bit each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// No CPU
    pub const EMPTY: CpuMask = CpuMask(0);

    /// Build from a raw bitmask
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bitmask
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Mask with only `cpu` set
    pub const fn single(cpu: u32) -> Self {
        if (cpu as usize) < MAX_CPUS {
            Self(1 << cpu)
        } else {
            Self(0)
        }
    }

    /// Whether `cpu` is in the mask
    #[inline]
    pub const fn contains(&self, cpu: u32) -> bool {
        (cpu as usize) < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    /// Number of CPUs in the mask
    pub const fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    /// Parse a cpulist such as `"0-3,6"`
    ///
    /// An empty string yields the empty mask.
    pub fn parse_list(list: &str) -> GovernorResult<Self> {
        let parse_err = GovernorError::new(ErrorKind::ParseFailed, "malformed cpulist");
        let mut bits = 0u64;

        for part in list.trim().split(',').filter(|p| !p.is_empty()) {
            let (lo, hi) = match part.split_once('-') {
                Some((a, b)) => (a.trim(), b.trim()),
                None => (part.trim(), part.trim()),
            };
            let lo: u32 = lo.parse().map_err(|_| parse_err)?;
            let hi: u32 = hi.parse().map_err(|_| parse_err)?;
            if lo > hi {
                return Err(parse_err);
            }
            if hi as usize >= MAX_CPUS {
                return Err(GovernorError::new(ErrorKind::InvalidCpu, "cpulist names an unsupported cpu")
                    .with_cpu(hi));
            }
            for cpu in lo..=hi {
                bits |= 1 << cpu;
            }
        }

        Ok(Self(bits))
    }
}

/// Atomic holder for the extended-history opt-in mask
#[derive(Debug, Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    /// Create an empty mask
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current mask
    #[inline]
    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Relaxed))
    }

    /// Replace the mask
    pub fn store(&self, mask: CpuMask) {
        self.0.store(mask.0, Ordering::Relaxed);
    }
}

// =============================================================================
// GOVERNOR CONFIG
// =============================================================================

/// Parameters fixed for the lifetime of a governor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Logical CPUs the governor may serve
    pub nr_cpus: u32,
    /// Scheduler tick period (us)
    pub tick_us: u32,
}

impl GovernorConfig {
    /// Check the configuration against compile-time capacities
    pub fn validate(&self) -> GovernorResult<()> {
        if self.nr_cpus == 0 || self.nr_cpus as usize > MAX_CPUS {
            return Err(GovernorError::new(ErrorKind::InvalidCpu, "nr_cpus outside supported range"));
        }
        if self.tick_us == 0 {
            return Err(GovernorError::new(ErrorKind::InvalidArgument, "tick period must be non-zero"));
        }
        Ok(())
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            nr_cpus: MAX_CPUS as u32,
            tick_us: DEFAULT_TICK_US,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

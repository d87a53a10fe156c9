//! # Helix OS CPU Idle Governor
//!
//! A history-aware "menu" governor: every time a CPU runs out of work it
//! picks which hardware idle state to enter, trading wakeup latency against
//! power saved.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MENU GOVERNOR PIPELINE                           │
//! │                                                                         │
//! │   next timer ──► bucket ──► correction factor ──┐                       │
//! │                                                 ├─► min ─► predicted    │
//! │   interval ring / history ──► typical interval ─┘            │          │
//! │                                                              ▼          │
//! │   QoS latency ──► budget (iowait tightened) ──────────► state scan      │
//! │                                                              │          │
//! │                                  opted-in CPUs only          ▼          │
//! │                         ┌───────────────────────────── reselection      │
//! │                         │  early wakeups, busy CPU,          │          │
//! │                         │  single-miss widening              ▼          │
//! │                         └───────────────────────────── monitor timer    │
//! │                                                              │          │
//! │   client depth caps ──────────────────────────────────► depth clamp     │
//! │                                                              │          │
//! │                                                              ▼          │
//! │                                                   state index + reason  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Layers
//!
//! | Layer | Module       | Role                                           |
//! |-------|--------------|------------------------------------------------|
//! | 1     | `bucket`     | Per-magnitude correction factors               |
//! | 2     | `interval`   | Repeating idle-length detection                |
//! | 3     | `select`     | Residency/latency scan over the state table    |
//! | 4     | `history`    | Window statistics and reselection              |
//! | 5     | `monitor`    | Misprediction timer and residency merging      |
//! | 6     | `depth`      | Administrative depth caps                      |
//!
//! `governor` ties the layers together, `cluster` mirrors per-CPU state
//! parameters, `stats` keeps per-CPU counters.
//!
//! ## Concurrency
//!
//! Each CPU owns its [`CpuIdleContext`] exclusively; `select()` and
//! `reflect()` run on that CPU with no locking. Shared state in
//! [`MenuGovernor`] is either relaxed atomics (tunables, opt-in mask, depth
//! caps, state mirrors) or, for cluster-wide overrides, one spin lock per
//! cluster held only by writers.
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use helix_cpuidle::{
//!     GovernorConfig, IdleDriverTable, IdleSignals, IdleStateDesc, MenuGovernor,
//!     NoMonitorTimer, ReflectInput, Residency,
//! };
//!
//! let driver = IdleDriverTable::new(&[
//!     IdleStateDesc::polling("poll", 1, 1),
//!     IdleStateDesc::new("wfi", 70, 10),
//!     IdleStateDesc::new("cpu-off", 1_000, 100),
//! ]);
//! let gov = MenuGovernor::new(GovernorConfig::default())?;
//! let mut ctx = gov.enable_device(0, 0, &driver)?;
//! let mut timer = NoMonitorTimer;
//!
//! let sel = ctx.select(&gov, &driver, &IdleSignals { next_timer_us: 500, ..Default::default() }, &mut timer);
//! // ... enter sel.state_idx ...
//! ctx.reflect(
//!     ReflectInput { state_idx: sel.state_idx, residency: Residency::Measured(420), exit_time_us: now },
//!     &mut timer,
//! );
//! ```

#![cfg_attr(not(test), no_std)]

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Error types
pub mod error;

/// Static configuration and runtime tunables
pub mod config;

/// Idle state descriptions and per-call tables
pub mod state;

/// Correction-factor model
pub mod bucket;

/// Typical-interval detector
pub mod interval;

/// Residency/latency state scan
pub mod select;

/// Extended history and reselection
pub mod history;

/// Misprediction monitor timer
pub mod monitor;

/// Client depth caps
pub mod depth;

/// Cluster-wide state overrides
pub mod cluster;

/// Per-CPU idle statistics
pub mod stats;

/// Shared governor and per-CPU context
pub mod governor;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use bucket::{which_bucket, CorrectionModel};
pub use config::{CpuMask, GovernorConfig, HistTunables, Tunable, TunableSet};
pub use depth::{DepthClient, DEPTH_UNLIMITED};
pub use error::{ErrorKind, GovernorError, GovernorResult};
pub use governor::{CpuIdleContext, HaltState, IdleSignals, MenuGovernor, ReflectInput, Residency};
pub use history::{BusyLevel, ExtendedHistory, HistCstateEntry, HistStats};
pub use interval::IntervalHistory;
pub use monitor::{MonitorKind, MonitorTimerOps, NoMonitorTimer};
pub use select::{Selection, SelectionReason};
pub use state::{CpuIdleDriver, IdleDriverTable, IdleStateConfig, IdleStateDesc, StateFlags};
pub use stats::{IdleStats, StateStats};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Correction-factor buckets, half of them for CPUs with I/O waiters
pub const BUCKETS: usize = 12;

/// Fixed-point resolution of one correction step
pub const RESOLUTION: u32 = 1024;

/// Weight of history in the correction average
pub const DECAY: u32 = 8;

/// Sleeps at least this long are never worth correcting for (us)
pub const MAX_INTERESTING_US: u64 = 50_000;

/// Slots of the typical-interval ring
pub const INTERVALS: usize = 8;

/// Minimum samples for a typical interval
pub const EST_SAMPLE_MIN: usize = 4;

/// Slots of the extended history ring
pub const HIST_SIZE: usize = 12;

/// Maximum idle states per CPU
pub const CPUIDLE_STATE_MAX: usize = 10;

/// Maximum CPUs served by one governor
pub const MAX_CPUS: usize = 64;

/// Maximum cluster groups
pub const MAX_CLUSTERS: usize = 8;

/// No timer pending
pub const NO_TIMER: u64 = u64::MAX;

/// Default scheduler tick period (us), 250 Hz
pub const DEFAULT_TICK_US: u32 = 4_000;

static_assertions::const_assert!(BUCKETS % 2 == 0);
static_assertions::const_assert!(DECAY > 1);
static_assertions::const_assert!(EST_SAMPLE_MIN <= INTERVALS);
static_assertions::const_assert!(INTERVALS <= HIST_SIZE);
static_assertions::const_assert!(MAX_CPUS <= 64);
static_assertions::const_assert!(CPUIDLE_STATE_MAX >= 2);
// Factor arithmetic stays within u32
static_assertions::const_assert!((RESOLUTION as u64) * (DECAY as u64) * 2 < u32::MAX as u64);

// =============================================================================
// TESTS
// =============================================================================

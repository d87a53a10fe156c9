//! # Menu Governor
//!
//! [`MenuGovernor`] holds everything shared between CPUs: tunables, the
//! extended-history opt-in mask, depth caps and cluster overrides. Each CPU
//! owns one [`CpuIdleContext`], created by [`MenuGovernor::enable_device`]
//! and handed back on disable. The idle loop drives it:
//!
//! ```text
//!   idle entry          wakeup              next idle entry
//!   ──────────          ──────              ───────────────
//!   select() ─► enter ─► reflect() ─► ... ─► select()
//!                  │                           │
//!             monitor timer                update pass runs here,
//!             may fire: flags only         then a new decision
//! ```
//!
//! Nothing on this path allocates, blocks or fails. Degenerate inputs select
//! state 0.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::bucket::{which_bucket, CorrectionModel};
use crate::cluster::ClusterConfigs;
use crate::config::{AtomicCpuMask, CpuMask, GovernorConfig, HistTunables, Tunable, TunableSet};
use crate::depth::{clamp_depth, DepthClient, DepthLimits};
use crate::error::{ErrorKind, GovernorError, GovernorResult};
use crate::history::{ExtendedHistory, HistCstateEntry};
use crate::interval::IntervalHistory;
use crate::monitor::{MonitorKind, MonitorTimer, MonitorTimerOps};
use crate::select::{find_state, latency_budget, short_circuit, ScanInput, Selection, SelectionReason};
use crate::state::{CpuIdleDriver, EffectiveState, IdleStateConfig, StateTable};
use crate::stats::IdleStats;
use crate::{CPUIDLE_STATE_MAX, MAX_CLUSTERS, MAX_CPUS, NO_TIMER};

// =============================================================================
// SIGNALS
// =============================================================================

/// Scheduler halt classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaltState {
    #[default]
    Running,
    /// Prediction runs, history and monitor timer are skipped
    PartialHalted,
    /// Deepest state the latency budget allows
    Halted,
}

/// Environment of one idle entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSignals {
    /// Time to the next timer or scheduled wake, [`NO_TIMER`] if none
    pub next_timer_us: u64,
    pub nr_iowaiters: u32,
    /// QoS latency ceiling (us)
    pub latency_req_us: u32,
    pub cur_freq_khz: u32,
    pub ipi_pending: bool,
    pub halt: HaltState,
}

impl Default for IdleSignals {
    fn default() -> Self {
        Self {
            next_timer_us: NO_TIMER,
            nr_iowaiters: 0,
            latency_req_us: u32::MAX,
            cur_freq_khz: 0,
            ipi_pending: false,
            halt: HaltState::Running,
        }
    }
}

/// Residency reported after wakeup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Measured(u32),
    /// A polling state hit its time limit instead of a real wakeup
    PollTimeLimit,
}

/// Outcome of one idle period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectInput {
    /// State actually entered
    pub state_idx: usize,
    pub residency: Residency,
    /// Monotonic wakeup timestamp (us)
    pub exit_time_us: u64,
}

// =============================================================================
// SHARED GOVERNOR
// =============================================================================

/// Governor state shared by all CPUs
#[derive(Debug)]
pub struct MenuGovernor {
    config: GovernorConfig,
    tunables: TunableSet,
    menu_cpumask: AtomicCpuMask,
    depth: DepthLimits,
    clusters: ClusterConfigs,
    enabled: AtomicU64,
    stats_epoch: AtomicU32,
}

impl MenuGovernor {
    /// Create a governor with default tunables and an empty opt-in mask
    pub fn new(config: GovernorConfig) -> GovernorResult<Self> {
        config.validate()?;
        log::info!(
            "cpuidle: menu governor v{} ({} cpus, tick {} us)",
            crate::VERSION,
            config.nr_cpus,
            config.tick_us
        );
        Ok(Self {
            config,
            tunables: TunableSet::new(),
            menu_cpumask: AtomicCpuMask::new(),
            depth: DepthLimits::new(),
            clusters: ClusterConfigs::new(),
            enabled: AtomicU64::new(0),
            stats_epoch: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn check_cpu(&self, cpu: u32) -> GovernorResult<()> {
        if cpu >= self.config.nr_cpus {
            return Err(GovernorError::new(ErrorKind::InvalidCpu, "cpu beyond nr_cpus").with_cpu(cpu));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Device lifecycle
    // -------------------------------------------------------------------------

    /// Attach `cpu` to the governor and create its context
    pub fn enable_device<D>(&self, cpu: u32, cluster: u32, driver: &D) -> GovernorResult<CpuIdleContext>
    where
        D: CpuIdleDriver + ?Sized,
    {
        self.check_cpu(cpu)?;
        if cluster as usize >= MAX_CLUSTERS {
            return Err(GovernorError::new(ErrorKind::InvalidCluster, "cluster id beyond capacity").with_cpu(cpu));
        }
        let states = driver.states(cpu);
        if states.is_empty() || states.len() > CPUIDLE_STATE_MAX {
            return Err(GovernorError::new(ErrorKind::InvalidStateTable, "driver state table unusable").with_cpu(cpu));
        }

        let bit = 1u64 << cpu;
        if self.enabled.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Err(GovernorError::new(ErrorKind::DeviceAlreadyEnabled, "device already enabled").with_cpu(cpu));
        }
        if let Err(err) = self.clusters.install(cpu, cluster, states) {
            self.enabled.fetch_and(!bit, Ordering::AcqRel);
            return Err(err);
        }
        self.depth.forget_cached(cpu);

        log::info!(
            "cpuidle: enabled cpu{} ({} states, cluster {})",
            cpu,
            states.len(),
            cluster
        );
        Ok(CpuIdleContext::new(cpu))
    }

    /// Detach a CPU, consuming its context
    pub fn disable_device(&self, mut ctx: CpuIdleContext, timer: &mut impl MonitorTimerOps) {
        let cpu = ctx.cpu;
        ctx.timer.cancel(cpu, timer);
        self.clusters.remove(cpu);
        self.depth.forget_cached(cpu);
        if (cpu as usize) < MAX_CPUS {
            self.enabled.fetch_and(!(1u64 << cpu), Ordering::AcqRel);
        }
        log::info!("cpuidle: disabled cpu{}", cpu);
    }

    /// Whether `cpu` has a live context
    pub fn is_enabled(&self, cpu: u32) -> bool {
        (cpu as usize) < MAX_CPUS && self.enabled.load(Ordering::Acquire) & (1u64 << cpu) != 0
    }

    // -------------------------------------------------------------------------
    // Tunables
    // -------------------------------------------------------------------------

    #[inline]
    pub fn tunables(&self) -> &TunableSet {
        &self.tunables
    }

    pub fn tunable(&self, tunable: Tunable) -> u32 {
        self.tunables.get(tunable)
    }

    pub fn set_tunable(&self, tunable: Tunable, value: u32) -> GovernorResult<()> {
        self.tunables.set(tunable, value)
    }

    pub fn set_tunable_by_name(&self, name: &str, value: u32) -> GovernorResult<()> {
        self.tunables.set_by_name(name, value)
    }

    /// CPUs running the extended-history path
    pub fn menu_cpumask(&self) -> CpuMask {
        self.menu_cpumask.load()
    }

    /// Replace the extended-history opt-in mask
    pub fn set_menu_cpumask(&self, mask: CpuMask) -> GovernorResult<()> {
        let valid = if self.config.nr_cpus >= 64 {
            u64::MAX
        } else {
            (1u64 << self.config.nr_cpus) - 1
        };
        if mask.bits() & !valid != 0 {
            return Err(GovernorError::new(ErrorKind::InvalidCpu, "mask names cpus beyond nr_cpus"));
        }
        self.menu_cpumask.store(mask);
        log::debug!("cpuidle: menu_cpumask -> {:#x}", mask.bits());
        Ok(())
    }

    /// Replace the opt-in mask from a cpulist such as `"0-3,6"`
    pub fn set_menu_cpulist(&self, list: &str) -> GovernorResult<()> {
        self.set_menu_cpumask(CpuMask::parse_list(list)?)
    }

    // -------------------------------------------------------------------------
    // Administrative operations
    // -------------------------------------------------------------------------

    /// Set one client's depth cap on `cpu`
    pub fn set_client_depth(&self, cpu: u32, client: DepthClient, depth: u32) -> GovernorResult<()> {
        self.check_cpu(cpu)?;
        self.depth.set(cpu, client, depth)
    }

    pub fn client_depth(&self, cpu: u32, client: DepthClient) -> GovernorResult<u32> {
        self.check_cpu(cpu)?;
        self.depth.get(cpu, client)
    }

    /// Allowed depth folded at `cpu`'s last decision
    pub fn allowed_depth(&self, cpu: u32) -> u32 {
        self.depth.allowed_depth(cpu)
    }

    /// Override a state's residency on `cpu`'s cluster, returns CPUs updated
    pub fn set_state_residency(&self, cpu: u32, state: usize, residency_us: u32) -> GovernorResult<u32> {
        self.check_cpu(cpu)?;
        self.clusters.set_state_residency(cpu, state, residency_us)
    }

    /// Override a state's exit latency on `cpu`'s cluster
    pub fn set_state_latency(&self, cpu: u32, state: usize, latency_us: u32) -> GovernorResult<u32> {
        self.check_cpu(cpu)?;
        self.clusters.set_state_latency(cpu, state, latency_us)
    }

    /// Effective residency/latency of a state on `cpu`
    pub fn state_config(&self, cpu: u32, state: usize) -> GovernorResult<IdleStateConfig> {
        self.check_cpu(cpu)?;
        self.clusters.config(cpu, state).ok_or(
            GovernorError::new(ErrorKind::InvalidState, "state not present on cpu")
                .with_cpu(cpu)
                .with_state(state),
        )
    }

    /// Ask every CPU to zero its statistics on its next decision
    pub fn clear_stats(&self) {
        self.stats_epoch.fetch_add(1, Ordering::Relaxed);
        log::debug!("cpuidle: statistics cleared");
    }

    fn stats_epoch(&self) -> u32 {
        self.stats_epoch.load(Ordering::Relaxed)
    }

    /// Snapshot the driver table with cluster overrides applied
    fn build_table<D>(&self, cpu: u32, driver: &D) -> StateTable
    where
        D: CpuIdleDriver + ?Sized,
    {
        let mut table = StateTable::default();
        for (i, desc) in driver.states(cpu).iter().enumerate().take(CPUIDLE_STATE_MAX) {
            let cfg = self.clusters.config(cpu, i).unwrap_or(IdleStateConfig {
                residency_us: desc.residency_us,
                latency_us: desc.latency_us,
            });
            table.push(EffectiveState {
                residency_us: cfg.residency_us,
                latency_us: cfg.latency_us,
                polling: desc.is_polling(),
                disabled: driver.is_disabled(cpu, i),
            });
        }
        table
    }
}

// =============================================================================
// PER-CPU CONTEXT
// =============================================================================

/// Idle governor state owned by one CPU
#[derive(Debug, Clone)]
pub struct CpuIdleContext {
    cpu: u32,
    model: CorrectionModel,
    intervals: IntervalHistory,
    hist: ExtendedHistory,
    timer: MonitorTimer,
    stats: IdleStats,
    /// Bucket of the last decision
    bucket: usize,
    /// Timer distance of the last decision
    next_timer_us: u64,
    /// Plain predictor's choice in the last decision
    org_state_idx: usize,
    last: Option<Selection>,
    /// Reflection waiting for the update pass
    pending: Option<ReflectInput>,
}

impl CpuIdleContext {
    fn new(cpu: u32) -> Self {
        Self {
            cpu,
            model: CorrectionModel::new(),
            intervals: IntervalHistory::new(),
            hist: ExtendedHistory::new(),
            timer: MonitorTimer::new(),
            stats: IdleStats::new(),
            bucket: 0,
            next_timer_us: NO_TIMER,
            org_state_idx: 0,
            last: None,
            pending: None,
        }
    }

    #[inline]
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Last decision
    #[inline]
    pub fn last_selection(&self) -> Option<&Selection> {
        self.last.as_ref()
    }

    #[inline]
    pub fn stats(&self) -> &IdleStats {
        &self.stats
    }

    #[inline]
    pub fn correction_model(&self) -> &CorrectionModel {
        &self.model
    }

    #[inline]
    pub fn intervals(&self) -> &IntervalHistory {
        &self.intervals
    }

    #[inline]
    pub fn history(&self) -> &ExtendedHistory {
        &self.hist
    }

    #[inline]
    pub fn monitor(&self) -> &MonitorTimer {
        &self.timer
    }

    /// Whether an external constraint decided the last selection
    pub fn forced_state(&self) -> bool {
        self.last.is_some_and(|s| s.reason.is_forced())
    }

    /// Forget all learned state, used when a CPU comes back online
    pub fn reset(&mut self, timer: &mut impl MonitorTimerOps) {
        self.timer.cancel(self.cpu, timer);
        *self = Self::new(self.cpu);
    }

    // -------------------------------------------------------------------------
    // Idle entry
    // -------------------------------------------------------------------------

    /// Choose the idle state for this entry
    pub fn select<D, T>(&mut self, gov: &MenuGovernor, driver: &D, signals: &IdleSignals, timer: &mut T) -> Selection
    where
        D: CpuIdleDriver + ?Sized,
        T: MonitorTimerOps,
    {
        let t = gov.tunables.snapshot();
        let table = gov.build_table(self.cpu, driver);
        let in_mask = gov.menu_cpumask.load().contains(self.cpu);

        self.stats.sync_epoch(gov.stats_epoch());
        self.timer.cancel(self.cpu, timer);
        if let Some(input) = self.pending.take() {
            self.update(&table, input, in_mask);
        }

        let allowed = gov.depth.custom_get_allowed_depth(self.cpu);
        let mut sel = self.decide(&table, signals, &t, gov.config.tick_us, in_mask, timer);

        if let Some(clamped) = clamp_depth(&table, sel.state_idx, allowed) {
            sel.state_idx = clamped;
            sel.reason = SelectionReason::Limited;
            sel.stop_tick = sel.stop_tick && table.get(clamped).is_some_and(|s| !s.polling);
            self.timer.cancel(self.cpu, timer);
        }

        self.stats.record_selection(sel.reason);
        self.last = Some(sel);
        sel
    }

    fn decide<T: MonitorTimerOps>(
        &mut self,
        table: &StateTable,
        signals: &IdleSignals,
        t: &HistTunables,
        tick_us: u32,
        in_mask: bool,
        timer: &mut T,
    ) -> Selection {
        let next_timer_us = signals.next_timer_us;
        self.next_timer_us = next_timer_us;
        self.bucket = which_bucket(next_timer_us, signals.nr_iowaiters);
        self.org_state_idx = 0;

        if table.is_empty() {
            return Selection::shallowest(next_timer_us, SelectionReason::Origin);
        }
        if signals.ipi_pending {
            return Selection::shallowest(next_timer_us, SelectionReason::Ipi);
        }
        if signals.halt == HaltState::Halted {
            return halted_selection(table, next_timer_us, signals.latency_req_us);
        }

        if let Some(out) = short_circuit(table, next_timer_us, signals.latency_req_us) {
            return Selection {
                state_idx: out.index,
                predicted_us: out.predicted_us,
                next_timer_us,
                reason: out.reason,
                stop_tick: out.stop_tick,
            };
        }

        let corrected = self.model.predict(self.bucket, next_timer_us);
        let typical = if in_mask {
            let samples = self.hist.recent_residencies();
            self.intervals.detect(&samples)
        } else {
            self.intervals.get_typical_interval()
        };
        let predicted = corrected.min(typical);

        let scan = ScanInput {
            predicted_us: predicted,
            next_timer_us,
            latency_req_us: latency_budget(signals.latency_req_us, predicted, signals.nr_iowaiters, tick_us),
            tick_us,
        };
        let out = find_state(table, &scan);
        self.org_state_idx = out.index;

        let mut sel = Selection {
            state_idx: out.index,
            predicted_us: out.predicted_us,
            next_timer_us,
            reason: out.reason,
            stop_tick: out.stop_tick,
        };

        if !in_mask || signals.halt != HaltState::Running {
            return sel;
        }

        let allowed = self.hist.reselection_allowed(t);
        self.hist.cool_down(t);
        let perfect = next_timer_us >= t.perfect_cstate_ms as u64 * 1_000;

        if allowed && out.index > 0 && !perfect {
            let r = self.hist.reselect(table, &scan, out.index, t);
            if r.index != out.index {
                sel.state_idx = r.index;
                sel.predicted_us = r.predicted_us;
                sel.reason = SelectionReason::Predict;
                sel.stop_tick = out.stop_tick && table.get(r.index).is_some_and(|s| !s.polling);
            }
        }

        if signals.cur_freq_khz > t.switch_profile_khz && !sel.reason.is_forced() {
            let plan = MonitorTimer::plan(
                table,
                sel.state_idx,
                out.index,
                next_timer_us,
                sel.predicted_us,
                self.intervals.repeat(),
                t,
            );
            if let Some(plan) = plan {
                self.timer.arm(self.cpu, plan, timer);
            }
        }

        sel
    }

    // -------------------------------------------------------------------------
    // Wakeup
    // -------------------------------------------------------------------------

    /// Record the outcome of the idle period; the update runs on next select
    pub fn reflect(&mut self, input: ReflectInput, timer: &mut impl MonitorTimerOps) {
        self.timer.cancel(self.cpu, timer);
        self.pending = Some(input);
    }

    /// Monitor-timer expiry, called from the timer interrupt
    pub fn monitor_timer_fired(&mut self, gov: &MenuGovernor, kind: MonitorKind) {
        if let Some(kind) = self.timer.fire(kind) {
            let t = gov.tunables.snapshot();
            self.hist.on_timer_fired(kind, &t);
        }
    }

    fn update(&mut self, table: &StateTable, input: ReflectInput, in_mask: bool) {
        let Some(last_idx) = table.len().checked_sub(1) else {
            return;
        };
        let entered = input.state_idx.min(last_idx);
        let latency_us = table.get(entered).map_or(0, |s| s.latency_us as u64);
        let next_timer_us = self.next_timer_us;

        let measured = match input.residency {
            Residency::PollTimeLimit => next_timer_us,
            Residency::Measured(r) => {
                let r = r as u64;
                if r > 2 * latency_us {
                    r - latency_us
                } else {
                    r / 2
                }
            },
        }
        .min(next_timer_us);

        self.model.update(self.bucket, measured, next_timer_us);
        let measured_us = measured.min(u32::MAX as u64) as u32;
        self.stats.custom_collect_stat(table, entered, measured_us);

        let fired = self.timer.take_fired();
        if let Some(kind) = fired {
            self.stats.record_timer_fire(kind);
        }
        // Streaks hold across a period the monitor timer cut short
        if !self.hist.take_inv_flag() {
            self.hist.on_quiet_cycle();
        }

        if self.forced_state() {
            return;
        }
        let Some(residency_us) = self.timer.merge_residency(measured_us, fired.is_some()) else {
            return;
        };

        if in_mask {
            self.hist.push(HistCstateEntry {
                idle_state_idx: entered,
                org_state_idx: self.org_state_idx,
                residency_us,
                exit_time_us: input.exit_time_us,
            });
        } else {
            self.intervals.push(residency_us);
        }
    }
}

/// Deepest enabled state within the latency ceiling
fn halted_selection(table: &StateTable, next_timer_us: u64, latency_req_us: u32) -> Selection {
    let mut idx = 0;
    for (i, s) in table.as_slice().iter().enumerate() {
        if s.disabled {
            continue;
        }
        if s.latency_us > latency_req_us {
            break;
        }
        idx = i;
    }
    Selection {
        state_idx: idx,
        predicted_us: 0,
        next_timer_us,
        reason: SelectionReason::Halted,
        stop_tick: table.get(idx).is_some_and(|s| !s.polling),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::UNITY;
    use crate::state::{IdleDriverTable, IdleStateDesc};

    const FAST_KHZ: u32 = 2_000_000;

    #[derive(Default)]
    struct Recorder {
        armed: Option<(u32, u32, MonitorKind)>,
        arms: u32,
        cancels: u32,
    }

    impl MonitorTimerOps for Recorder {
        fn arm(&mut self, cpu: u32, duration_us: u32, kind: MonitorKind) {
            self.armed = Some((cpu, duration_us, kind));
            self.arms += 1;
        }

        fn cancel(&mut self, _cpu: u32) -> bool {
            self.cancels += 1;
            self.armed.take().is_some()
        }
    }

    fn scenario_driver() -> IdleDriverTable {
        IdleDriverTable::new(&[
            IdleStateDesc::polling("poll", 1, 1),
            IdleStateDesc::new("wfi", 70, 10),
            IdleStateDesc::new("cpu-off", 1_000, 100),
        ])
    }

    fn deep_driver() -> IdleDriverTable {
        IdleDriverTable::new(&[
            IdleStateDesc::polling("poll", 1, 1),
            IdleStateDesc::new("wfi", 70, 10),
            IdleStateDesc::new("cpu-off", 1_000, 100),
            IdleStateDesc::new("cluster-off", 20_000, 2_000),
        ])
    }

    fn governor() -> MenuGovernor {
        MenuGovernor::new(GovernorConfig {
            nr_cpus: 8,
            tick_us: 4_000,
        })
        .unwrap()
    }

    fn signals(next_timer_us: u64) -> IdleSignals {
        IdleSignals {
            next_timer_us,
            ..IdleSignals::default()
        }
    }

    fn reflect(ctx: &mut CpuIdleContext, timer: &mut Recorder, state_idx: usize, residency: Residency, now: u64) {
        ctx.reflect(
            ReflectInput {
                state_idx,
                residency,
                exit_time_us: now,
            },
            timer,
        );
    }

    /// Opted-in CPU whose history repeats `residency_us` every `gap_us`
    fn seed_history(ctx: &mut CpuIdleContext, residency_us: u32, gap_us: u64, n: usize) {
        for i in 0..n {
            ctx.hist.push(HistCstateEntry {
                idle_state_idx: 1,
                org_state_idx: 1,
                residency_us,
                exit_time_us: 1_000_000 + i as u64 * gap_us,
            });
        }
    }

    #[test]
    fn test_scenario_a_mid_state() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();

        let sel = ctx.select(&gov, &drv, &signals(500), &mut timer);
        assert_eq!(sel.state_idx, 1);
        assert_eq!(sel.reason, SelectionReason::Origin);
        assert!(!ctx.forced_state());
    }

    #[test]
    fn test_scenario_b_latency() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();

        let sig = IdleSignals {
            latency_req_us: 5,
            ..signals(500)
        };
        let sel = ctx.select(&gov, &drv, &sig, &mut timer);
        assert_eq!(sel.state_idx, 0);
        assert_eq!(sel.reason, SelectionReason::Latency);
        assert!(!sel.stop_tick);
        assert!(ctx.forced_state());
    }

    #[test]
    fn test_scenario_d_depth_limit() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();
        seed_history(&mut ctx, 300, 400, 8);

        let sig = IdleSignals {
            cur_freq_khz: FAST_KHZ,
            ..signals(5_000)
        };

        // Unclamped: state 1 with a monitor timer watching it
        let sel = ctx.select(&gov, &drv, &sig, &mut timer);
        assert_eq!(sel.state_idx, 1);
        assert_eq!(timer.armed, Some((1, 800, MonitorKind::Repeat)));

        gov.set_client_depth(1, DepthClient::Thermal, 0).unwrap();
        let sel = ctx.select(&gov, &drv, &sig, &mut timer);
        assert_eq!(gov.allowed_depth(1), 0);
        assert_eq!(sel.state_idx, 0);
        assert_eq!(sel.reason, SelectionReason::Limited);
        // Armed by the prediction, then cancelled by the clamp
        assert_eq!(timer.arms, 2);
        assert_eq!(timer.armed, None);
        assert_eq!(ctx.monitor().kind(), MonitorKind::Stop);
        assert!(ctx.forced_state());
    }

    #[test]
    fn test_scenario_e_perfect_prediction_converges() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();
        let bucket = which_bucket(2_000, 0);

        let mut now = 0;
        for _ in 0..4 {
            let sel = ctx.select(&gov, &drv, &signals(2_000), &mut timer);
            now += 300;
            reflect(&mut ctx, &mut timer, sel.state_idx, Residency::Measured(210), now);
        }
        ctx.select(&gov, &drv, &signals(2_000), &mut timer);
        let perturbed = ctx.correction_model().factor(bucket);
        assert!(perturbed < UNITY * 3 / 4);

        for _ in 0..20 {
            now += 2_100;
            reflect(&mut ctx, &mut timer, 0, Residency::PollTimeLimit, now);
            ctx.select(&gov, &drv, &signals(2_000), &mut timer);
        }
        let factor = ctx.correction_model().factor(bucket);
        assert!(factor > perturbed);
        assert!(factor <= UNITY);
        assert!(UNITY - factor < UNITY / 10);
    }

    #[test]
    fn test_forced_selection_not_fed_back() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();

        let tight = IdleSignals {
            latency_req_us: 5,
            ..signals(500)
        };
        ctx.select(&gov, &drv, &tight, &mut timer);
        reflect(&mut ctx, &mut timer, 0, Residency::Measured(400), 1_000);
        ctx.select(&gov, &drv, &signals(500), &mut timer);
        assert!(ctx.intervals().samples().iter().all(|&v| v == 0));

        reflect(&mut ctx, &mut timer, 1, Residency::Measured(400), 2_000);
        ctx.select(&gov, &drv, &signals(500), &mut timer);
        // 400 us minus the 10 us exit latency
        assert!(ctx.intervals().samples().contains(&390));
    }

    #[test]
    fn test_history_fed_on_opted_in_cpu() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(2, 0, &drv).unwrap();
        gov.set_menu_cpulist("2-3").unwrap();

        let sel = ctx.select(&gov, &drv, &signals(500), &mut timer);
        reflect(&mut ctx, &mut timer, sel.state_idx, Residency::Measured(480), 10_000);
        ctx.select(&gov, &drv, &signals(500), &mut timer);

        assert_eq!(ctx.history().len(), 1);
        let entry = ctx.history().nth_recent(0).copied().unwrap_or_default();
        assert_eq!(entry.residency_us, 470);
        assert_eq!(entry.exit_time_us, 10_000);
        assert_eq!(entry.org_state_idx, 1);
        assert!(ctx.intervals().samples().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_monitor_fire_merges_residency() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();
        seed_history(&mut ctx, 300, 400, 8);

        let sig = IdleSignals {
            cur_freq_khz: FAST_KHZ,
            ..signals(5_000)
        };
        ctx.select(&gov, &drv, &sig, &mut timer);
        assert_eq!(ctx.monitor().kind(), MonitorKind::Repeat);

        ctx.monitor_timer_fired(&gov, MonitorKind::Repeat);
        assert!(ctx.monitor().hrtime_out());
        assert!(ctx.history().inv_flag());
        assert_eq!(ctx.history().inv_repeat(), 1);

        let cancels = timer.cancels;
        reflect(&mut ctx, &mut timer, 1, Residency::Measured(810), 1_010_000);
        assert_eq!(timer.cancels, cancels);

        let quiet = signals(5_000);
        ctx.select(&gov, &drv, &quiet, &mut timer);
        assert_eq!(ctx.stats().timer_fires(MonitorKind::Repeat), 1);
        assert!(ctx.monitor().hrtime_addtime());
        assert!(!ctx.history().inv_flag());
        assert_eq!(ctx.history().inv_repeat(), 1);
        assert_eq!(ctx.history().len(), 8);

        reflect(&mut ctx, &mut timer, 1, Residency::Measured(510), 1_020_000);
        ctx.select(&gov, &drv, &quiet, &mut timer);
        assert_eq!(ctx.history().inv_repeat(), 0);
        assert!(!ctx.monitor().hrtime_addtime());
        assert_eq!(ctx.history().len(), 9);
        assert_eq!(ctx.history().nth_recent(0).map(|e| e.residency_us), Some(800 + 500));
    }

    #[test]
    fn test_single_miss_widens() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();
        seed_history(&mut ctx, 300, 400, 8);

        let t = gov.tunables().snapshot();
        ctx.hist.on_timer_fired(MonitorKind::General, &t);

        let sel = ctx.select(&gov, &drv, &signals(5_000), &mut timer);
        assert_eq!(sel.state_idx, 2);
        assert_eq!(sel.reason, SelectionReason::Predict);
        assert!(!ctx.forced_state());
    }

    #[test]
    fn test_perfect_cstate_skips_reselection() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();
        seed_history(&mut ctx, 300, 400, 8);

        let t = gov.tunables().snapshot();
        ctx.hist.on_timer_fired(MonitorKind::General, &t);

        let sel = ctx.select(&gov, &drv, &signals(60_000), &mut timer);
        assert_eq!(sel.state_idx, 1);
        assert_eq!(sel.reason, SelectionReason::Origin);
    }

    #[test]
    fn test_halt_and_ipi() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();

        let halted = IdleSignals {
            halt: HaltState::Halted,
            ..signals(100)
        };
        let sel = ctx.select(&gov, &drv, &halted, &mut timer);
        assert_eq!((sel.state_idx, sel.reason), (2, SelectionReason::Halted));
        assert!(sel.stop_tick);
        assert!(!ctx.forced_state());

        let halted_qos = IdleSignals {
            latency_req_us: 50,
            ..halted
        };
        assert_eq!(ctx.select(&gov, &drv, &halted_qos, &mut timer).state_idx, 1);

        let ipi = IdleSignals {
            ipi_pending: true,
            ..signals(50_000)
        };
        let sel = ctx.select(&gov, &drv, &ipi, &mut timer);
        assert_eq!((sel.state_idx, sel.reason), (0, SelectionReason::Ipi));
        assert!(ctx.forced_state());
    }

    #[test]
    fn test_disabled_states_respected() {
        let gov = governor();
        let mut drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();

        drv.set_disabled(2, true);
        let sel = ctx.select(&gov, &drv, &signals(50_000), &mut timer);
        assert_eq!(sel.state_idx, 1);
    }

    #[test]
    fn test_cluster_override_changes_choice() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx0 = gov.enable_device(0, 0, &drv).unwrap();
        let mut ctx1 = gov.enable_device(1, 0, &drv).unwrap();

        assert_eq!(gov.set_state_residency(0, 2, 400), Ok(2));
        assert_eq!(gov.state_config(1, 2).map(|c| c.residency_us), Ok(400));

        assert_eq!(ctx0.select(&gov, &drv, &signals(500), &mut timer).state_idx, 2);
        assert_eq!(ctx1.select(&gov, &drv, &signals(500), &mut timer).state_idx, 2);
    }

    #[test]
    fn test_lifecycle_errors() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();

        let ctx = gov.enable_device(3, 1, &drv).unwrap();
        assert!(gov.is_enabled(3));
        let err = gov.enable_device(3, 1, &drv).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceAlreadyEnabled);

        let err = gov.enable_device(8, 0, &drv).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCpu);

        let err = gov.enable_device(4, MAX_CLUSTERS as u32, &drv).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCluster);

        let empty = IdleDriverTable::new(&[]);
        let err = gov.enable_device(4, 0, &empty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTable);
        assert!(!gov.is_enabled(4));

        gov.disable_device(ctx, &mut timer);
        assert!(!gov.is_enabled(3));
        assert!(gov.set_state_latency(3, 1, 5).is_err());
        assert!(gov.enable_device(3, 1, &drv).is_ok());
    }

    #[test]
    fn test_admin_validation() {
        let gov = governor();
        assert!(gov.set_menu_cpumask(CpuMask::from_bits(1 << 9)).is_err());
        assert!(gov.set_menu_cpulist("0-x").is_err());
        assert!(gov.set_client_depth(8, DepthClient::Debug, 1).is_err());
        assert_eq!(gov.client_depth(2, DepthClient::Debug), Ok(u32::MAX));

        gov.set_tunable_by_name("hrtimer_offset_us", 250).unwrap();
        assert_eq!(gov.tunable(Tunable::HrtimerOffsetUs), 250);
        assert_eq!(gov.set_tunable_by_name("bogus", 1).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_stats_cleared_by_epoch() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();

        for _ in 0..3 {
            ctx.select(&gov, &drv, &signals(500), &mut timer);
        }
        assert_eq!(ctx.stats().reason_count(SelectionReason::Origin), 3);

        gov.clear_stats();
        ctx.select(&gov, &drv, &signals(500), &mut timer);
        assert_eq!(ctx.stats().reason_count(SelectionReason::Origin), 1);
    }

    #[test]
    fn test_reset_forgets_learning() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(0, 0, &drv).unwrap();

        let sel = ctx.select(&gov, &drv, &signals(2_000), &mut timer);
        reflect(&mut ctx, &mut timer, sel.state_idx, Residency::Measured(150), 5_000);
        ctx.select(&gov, &drv, &signals(2_000), &mut timer);
        assert!(ctx.correction_model().factor(which_bucket(2_000, 0)) < UNITY);

        ctx.reset(&mut timer);
        assert_eq!(ctx.correction_model().factor(which_bucket(2_000, 0)), UNITY);
        assert!(ctx.last_selection().is_none());
        assert_eq!(ctx.cpu(), 0);
    }

    #[test]
    fn test_depth_cap_survives_hotplug() {
        let gov = governor();
        let drv = scenario_driver();
        let mut timer = Recorder::default();
        let ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_client_depth(1, DepthClient::Thermal, 1).unwrap();

        gov.disable_device(ctx, &mut timer);
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        assert_eq!(gov.client_depth(1, DepthClient::Thermal), Ok(1));

        let sel = ctx.select(&gov, &drv, &signals(50_000), &mut timer);
        assert_eq!(sel.state_idx, 1);
        assert_eq!(sel.reason, SelectionReason::Limited);
        assert_eq!(gov.allowed_depth(1), 1);
    }

    #[test]
    fn test_monitor_needs_fast_clock() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();
        seed_history(&mut ctx, 300, 400, 8);

        let at_profile = IdleSignals {
            cur_freq_khz: gov.tunable(Tunable::MenuSwitchProfile),
            ..signals(5_000)
        };
        let sel = ctx.select(&gov, &drv, &at_profile, &mut timer);
        assert_eq!(sel.state_idx, 1);
        assert_eq!(timer.arms, 0);
        assert_eq!(ctx.monitor().kind(), MonitorKind::Stop);

        let above = IdleSignals {
            cur_freq_khz: at_profile.cur_freq_khz + 1,
            ..at_profile
        };
        ctx.select(&gov, &drv, &above, &mut timer);
        assert_eq!(timer.arms, 1);
    }

    #[test]
    fn test_monitor_needs_opted_in_cpu() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(2, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();

        let sig = IdleSignals {
            cur_freq_khz: FAST_KHZ,
            ..signals(5_000)
        };
        let sel = ctx.select(&gov, &drv, &sig, &mut timer);
        assert_eq!(sel.state_idx, 2);
        assert_eq!(timer.arms, 0);
        assert_eq!(ctx.monitor().kind(), MonitorKind::Stop);
    }

    #[test]
    fn test_partial_halt_skips_history_pass() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();
        seed_history(&mut ctx, 300, 400, 8);

        let t = gov.tunables().snapshot();
        ctx.hist.on_timer_fired(MonitorKind::General, &t);

        let sig = IdleSignals {
            cur_freq_khz: FAST_KHZ,
            halt: HaltState::PartialHalted,
            ..signals(5_000)
        };
        let sel = ctx.select(&gov, &drv, &sig, &mut timer);
        // No widening, no monitor timer
        assert_eq!(sel.state_idx, 1);
        assert_eq!(sel.reason, SelectionReason::Origin);
        assert_eq!(timer.arms, 0);
        assert_eq!(ctx.history().inv_predict(), 1);
    }

    #[test]
    fn test_zero_latency_short_circuits() {
        let gov = governor();
        let drv = deep_driver();
        let mut timer = Recorder::default();
        let mut ctx = gov.enable_device(1, 0, &drv).unwrap();
        gov.set_menu_cpumask(CpuMask::single(1)).unwrap();

        let sig = IdleSignals {
            latency_req_us: 0,
            cur_freq_khz: FAST_KHZ,
            ..signals(50_000)
        };
        let sel = ctx.select(&gov, &drv, &sig, &mut timer);
        assert_eq!(sel.state_idx, 0);
        assert_eq!(sel.reason, SelectionReason::Latency);
        assert!(!sel.stop_tick);
        assert!(ctx.forced_state());
        assert_eq!(timer.arms, 0);
    }
}

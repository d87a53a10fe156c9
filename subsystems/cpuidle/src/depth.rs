//! # Idle Depth Limits
//!
//! Independent clients may cap how deep a CPU is allowed to go. Each
//! (cpu, client) cell is a relaxed atomic written from any CPU; the owning
//! CPU folds them into one allowed depth at every `select()`.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ErrorKind, GovernorError, GovernorResult};
use crate::state::StateTable;
use crate::MAX_CPUS;

/// No cap
pub const DEPTH_UNLIMITED: u32 = u32::MAX;

/// Subsystems allowed to cap idle depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum DepthClient {
    Thermal = 0,
    Debug   = 1,
    Driver  = 2,
    IpiHalt = 3,
}

impl DepthClient {
    pub const COUNT: usize = 4;

    pub const ALL: [DepthClient; DepthClient::COUNT] =
        [DepthClient::Thermal, DepthClient::Debug, DepthClient::Driver, DepthClient::IpiHalt];

    pub const fn name(self) -> &'static str {
        match self {
            DepthClient::Thermal => "thermal",
            DepthClient::Debug => "debug",
            DepthClient::Driver => "driver",
            DepthClient::IpiHalt => "ipi_halt",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// Per-CPU, per-client depth caps
#[derive(Debug)]
pub struct DepthLimits {
    cells: [[AtomicU32; DepthClient::COUNT]; MAX_CPUS],
    /// Result of the last fold, per CPU
    allowed: [AtomicU32; MAX_CPUS],
}

impl DepthLimits {
    /// Everything unlimited
    pub fn new() -> Self {
        Self {
            cells: core::array::from_fn(|_| core::array::from_fn(|_| AtomicU32::new(DEPTH_UNLIMITED))),
            allowed: core::array::from_fn(|_| AtomicU32::new(DEPTH_UNLIMITED)),
        }
    }

    fn check_cpu(cpu: u32) -> GovernorResult<usize> {
        let idx = cpu as usize;
        if idx >= MAX_CPUS {
            return Err(GovernorError::new(ErrorKind::InvalidCpu, "cpu beyond depth table").with_cpu(cpu));
        }
        Ok(idx)
    }

    /// Set one client's cap; `DEPTH_UNLIMITED` lifts it
    pub fn set(&self, cpu: u32, client: DepthClient, depth: u32) -> GovernorResult<()> {
        let idx = Self::check_cpu(cpu)?;
        self.cells[idx][client as usize].store(depth, Ordering::Relaxed);
        log::debug!("cpuidle: cpu{} {} depth cap -> {}", cpu, client.name(), depth);
        Ok(())
    }

    /// One client's cap
    pub fn get(&self, cpu: u32, client: DepthClient) -> GovernorResult<u32> {
        let idx = Self::check_cpu(cpu)?;
        Ok(self.cells[idx][client as usize].load(Ordering::Relaxed))
    }

    /// Fold all clients into the allowed depth and cache it
    pub fn custom_get_allowed_depth(&self, cpu: u32) -> u32 {
        let Some(row) = self.cells.get(cpu as usize) else {
            return DEPTH_UNLIMITED;
        };
        let depth = row
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .min()
            .unwrap_or(DEPTH_UNLIMITED);
        self.allowed[cpu as usize].store(depth, Ordering::Relaxed);
        depth
    }

    /// Allowed depth as of the CPU's last decision
    pub fn allowed_depth(&self, cpu: u32) -> u32 {
        self.allowed
            .get(cpu as usize)
            .map_or(DEPTH_UNLIMITED, |a| a.load(Ordering::Relaxed))
    }

    /// Drop the cached allowed depth; client caps are left to their owners
    pub fn forget_cached(&self, cpu: u32) {
        if let Some(allowed) = self.allowed.get(cpu as usize) {
            allowed.store(DEPTH_UNLIMITED, Ordering::Relaxed);
        }
    }
}

impl Default for DepthLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp a choice to the allowed depth
///
/// Returns the replacement index when `idx` is too deep: the nearest enabled
/// state at or below the cap, or 0.
pub fn clamp_depth(table: &StateTable, idx: usize, allowed: u32) -> Option<usize> {
    if (idx as u64) <= allowed as u64 {
        return None;
    }
    Some(table.enabled_at_or_below(allowed as usize))
}

// =============================================================================
// TESTS
// =============================================================================

//! # Cluster State Overrides
//!
//! Each CPU reads residency and latency from its own mirror of the driver
//! table. An administrator may override a value for one CPU; the write is
//! broadcast to every CPU of the same cluster under the cluster's lock, so
//! concurrent overrides never interleave. Readers on the selection path only
//! do relaxed loads and never take the lock.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{ErrorKind, GovernorError, GovernorResult};
use crate::state::{IdleStateConfig, IdleStateDesc};
use crate::{CPUIDLE_STATE_MAX, MAX_CLUSTERS, MAX_CPUS};

/// CPU not attached to any cluster
const NO_CLUSTER: u32 = u32::MAX;

#[derive(Debug)]
struct StateCell {
    residency_us: AtomicU32,
    latency_us: AtomicU32,
}

impl StateCell {
    fn new() -> Self {
        Self {
            residency_us: AtomicU32::new(0),
            latency_us: AtomicU32::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Residency,
    Latency,
}

/// Per-CPU residency/latency mirrors grouped by cluster
#[derive(Debug)]
pub struct ClusterConfigs {
    cells: [[StateCell; CPUIDLE_STATE_MAX]; MAX_CPUS],
    state_count: [AtomicU32; MAX_CPUS],
    cluster_of: [AtomicU32; MAX_CPUS],
    locks: [Mutex<()>; MAX_CLUSTERS],
}

impl ClusterConfigs {
    pub fn new() -> Self {
        Self {
            cells: core::array::from_fn(|_| core::array::from_fn(|_| StateCell::new())),
            state_count: core::array::from_fn(|_| AtomicU32::new(0)),
            cluster_of: core::array::from_fn(|_| AtomicU32::new(NO_CLUSTER)),
            locks: core::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Seed a CPU's mirror from its driver table and attach it to `cluster`
    pub fn install(&self, cpu: u32, cluster: u32, states: &[IdleStateDesc]) -> GovernorResult<()> {
        let idx = check_cpu(cpu)?;
        let lock = self.lock_for(cluster)?;
        let _guard = lock.lock();

        let count = states.len().min(CPUIDLE_STATE_MAX);
        for (cell, desc) in self.cells[idx].iter().zip(states.iter()) {
            cell.residency_us.store(desc.residency_us, Ordering::Relaxed);
            cell.latency_us.store(desc.latency_us, Ordering::Relaxed);
        }
        self.state_count[idx].store(count as u32, Ordering::Relaxed);
        self.cluster_of[idx].store(cluster, Ordering::Relaxed);
        Ok(())
    }

    /// Detach a CPU
    pub fn remove(&self, cpu: u32) {
        if let Some(slot) = self.cluster_of.get(cpu as usize) {
            slot.store(NO_CLUSTER, Ordering::Relaxed);
            self.state_count[cpu as usize].store(0, Ordering::Relaxed);
        }
    }

    /// Cluster of a CPU, if attached
    pub fn cluster_of(&self, cpu: u32) -> Option<u32> {
        let c = self.cluster_of.get(cpu as usize)?.load(Ordering::Relaxed);
        (c != NO_CLUSTER).then_some(c)
    }

    /// Number of mirrored states of a CPU
    pub fn state_count(&self, cpu: u32) -> usize {
        self.state_count
            .get(cpu as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed) as usize)
    }

    /// Mirrored values of one state, `None` when not mirrored
    pub fn config(&self, cpu: u32, state: usize) -> Option<IdleStateConfig> {
        if state >= self.state_count(cpu) {
            return None;
        }
        let cell = &self.cells[cpu as usize][state];
        Some(IdleStateConfig {
            residency_us: cell.residency_us.load(Ordering::Relaxed),
            latency_us: cell.latency_us.load(Ordering::Relaxed),
        })
    }

    /// Override a state's target residency on `cpu`'s whole cluster
    ///
    /// Returns the number of CPUs updated.
    pub fn set_state_residency(&self, cpu: u32, state: usize, residency_us: u32) -> GovernorResult<u32> {
        self.broadcast(cpu, state, residency_us, Field::Residency)
    }

    /// Override a state's exit latency on `cpu`'s whole cluster
    pub fn set_state_latency(&self, cpu: u32, state: usize, latency_us: u32) -> GovernorResult<u32> {
        self.broadcast(cpu, state, latency_us, Field::Latency)
    }

    fn broadcast(&self, cpu: u32, state: usize, value: u32, field: Field) -> GovernorResult<u32> {
        check_cpu(cpu)?;
        let cluster = self
            .cluster_of(cpu)
            .ok_or_else(|| GovernorError::new(ErrorKind::DeviceNotEnabled, "cpu has no cluster").with_cpu(cpu))?;
        if state >= self.state_count(cpu) {
            return Err(GovernorError::new(ErrorKind::InvalidState, "state not present on cpu")
                .with_cpu(cpu)
                .with_state(state));
        }

        let lock = self.lock_for(cluster)?;
        let _guard = lock.lock();

        let mut updated = 0;
        for (i, row) in self.cells.iter().enumerate() {
            if self.cluster_of[i].load(Ordering::Relaxed) != cluster {
                continue;
            }
            if state >= self.state_count[i].load(Ordering::Relaxed) as usize {
                continue;
            }
            let cell = match field {
                Field::Residency => &row[state].residency_us,
                Field::Latency => &row[state].latency_us,
            };
            cell.store(value, Ordering::Relaxed);
            updated += 1;
        }

        log::debug!(
            "cpuidle: cluster {} state {} {:?} -> {} us ({} cpus)",
            cluster,
            state,
            field,
            value,
            updated
        );
        Ok(updated)
    }

    fn lock_for(&self, cluster: u32) -> GovernorResult<&Mutex<()>> {
        self.locks
            .get(cluster as usize)
            .ok_or(GovernorError::new(ErrorKind::InvalidCluster, "cluster id beyond capacity"))
    }
}

impl Default for ClusterConfigs {
    fn default() -> Self {
        Self::new()
    }
}

fn check_cpu(cpu: u32) -> GovernorResult<usize> {
    if cpu as usize >= MAX_CPUS {
        return Err(GovernorError::new(ErrorKind::InvalidCpu, "cpu beyond capacity").with_cpu(cpu));
    }
    Ok(cpu as usize)
}

// =============================================================================
// TESTS
// =============================================================================

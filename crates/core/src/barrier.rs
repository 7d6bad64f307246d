//! Global SMP memory-barrier rendezvous with timeout→machine-check (§4.5).

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::fault::{FaultDispatcher, MachineCheckReason, PendingEvent};
use crate::pte::Mode;
use crate::state::Mces;

const BARRIER_TIMEOUT: Duration = Duration::from_secs(2);

struct BarrierState {
    in_progress: bool,
    participating: usize,
    acknowledged: usize,
    initiating_cpu: usize,
    /// Bumped each time a barrier completes so `wait` can tell its own
    /// rendezvous apart from the next one if it got spuriously woken late.
    generation: u64,
}

impl Default for BarrierState {
    fn default() -> Self {
        Self {
            in_progress: false,
            participating: 0,
            acknowledged: 0,
            initiating_cpu: 0,
            generation: 0,
        }
    }
}

/// Process-wide singleton (held by `System`, shared by reference into every
/// CPU's PalService, per §9's "replace global singletons with a composition
/// root" guidance).
pub struct MemoryBarrierCoordinator {
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl Default for MemoryBarrierCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBarrierCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
        }
    }

    /// Start a barrier if none is in progress and at least two CPUs are
    /// active. Immediately acknowledges on behalf of the initiator. Returns
    /// true when the caller must now send wake-up IPIs to the other
    /// participants.
    pub fn initiate_global_memory_barrier(&self, cpu_id: usize, active_cpu_count: usize) -> bool {
        if active_cpu_count < 2 {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if state.in_progress {
            return false;
        }
        state.in_progress = true;
        state.participating = active_cpu_count;
        state.acknowledged = 1;
        state.initiating_cpu = cpu_id;
        true
    }

    /// Full host-level fence plus this CPU's acknowledgement. Wakes waiters
    /// and completes the barrier once every participant has acknowledged.
    pub fn acknowledge_memory_barrier(&self, _cpu_id: usize) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.in_progress {
            return;
        }
        state.acknowledged += 1;
        if state.acknowledged >= state.participating {
            state.in_progress = false;
            state.generation += 1;
            self.cv.notify_all();
        }
    }

    /// Block until the barrier completes or a 2-second deadline elapses. On
    /// timeout, escalate to a machine check on `dispatcher` only if `mces`
    /// has MME set (§4.5, §7). Returns true if the barrier completed
    /// normally, false on timeout.
    pub fn wait_for_barrier_acknowledge(
        &self,
        cpu_id: usize,
        mces: Mces,
        dispatcher: &FaultDispatcher,
        fault_pc: u64,
    ) -> bool {
        let guard = self.state.lock().unwrap();
        let start_generation = guard.generation;
        let deadline = Instant::now() + BARRIER_TIMEOUT;
        let mut guard = guard;
        while guard.in_progress && guard.generation == start_generation {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (g, timeout) = self.cv.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if timeout.timed_out() {
                break;
            }
        }
        if !guard.in_progress || guard.generation != start_generation {
            return true;
        }
        drop(guard);

        log::warn!("memory barrier wait timed out after {:?} for cpu {cpu_id}", BARRIER_TIMEOUT);
        if mces.contains(Mces::MME) {
            dispatcher.raise_fault(PendingEvent::machine_check(
                MachineCheckReason::SmpBarrierTimeout,
                0,
                fault_pc,
                Mode::Kernel,
            ));
        }
        false
    }

    pub fn is_barrier_in_progress(&self) -> bool {
        self.state.lock().unwrap().in_progress
    }

    pub fn acknowledged_count(&self) -> usize {
        self.state.lock().unwrap().acknowledged
    }

    pub fn participating_count(&self) -> usize {
        self.state.lock().unwrap().participating
    }

    pub fn initiating_cpu(&self) -> usize {
        self.state.lock().unwrap().initiating_cpu
    }
}

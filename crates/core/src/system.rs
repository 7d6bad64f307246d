//! Composition root: owns every shared collaborator and hands out the
//! per-call context structs `MBox`/`PalService` borrow from (§5, §9 Design
//! Notes — "replace global singletons with an explicit composition root
//! the driver constructs once at boot").

use crate::barrier::MemoryBarrierCoordinator;
use crate::console::{ConsoleDevice, EnvStore};
use crate::fault::FaultDispatcher;
use crate::guest_memory::GuestMemory;
use crate::ipi::IpiManager;
use crate::mbox::MemoryAccessContext;
use crate::pal::{apply_ipi_command, PalContext, PalVectorTable};
use crate::pte::Mode;
use crate::reservation::ReservationManager;
use crate::state::CpuState;
use crate::tlb::TlbShard;

/// Everything this core's per-CPU executors (`MBox`, PAL dispatch) need,
/// sized to `cpu_count` at construction and otherwise effectively constant
/// (§5 Shared-resource policy). `M` is the guest physical memory backing —
/// a single instance shared read/write across every CPU, same as real
/// hardware's one DRAM behind N cores.
pub struct System<M: GuestMemory> {
    pub mem: M,
    tlb: Vec<TlbShard>,
    pub reservations: ReservationManager,
    pub barrier: MemoryBarrierCoordinator,
    pub ipi: IpiManager,
    pub vector_table: PalVectorTable,
    pub console: Box<dyn ConsoleDevice>,
    pub env: Box<dyn EnvStore>,
    dispatchers: Vec<FaultDispatcher>,
    cpu_states: Vec<CpuState>,
    cpu_count: usize,
}

impl<M: GuestMemory> System<M> {
    pub fn new(
        mem: M,
        cpu_count: usize,
        pal_base: u64,
        console: Box<dyn ConsoleDevice>,
        env: Box<dyn EnvStore>,
    ) -> Self {
        let mut vector_table = PalVectorTable::new();
        vector_table.bind_pal_base(pal_base);
        Self {
            mem,
            tlb: (0..cpu_count).map(|_| TlbShard::new()).collect(),
            reservations: ReservationManager::new(cpu_count),
            barrier: MemoryBarrierCoordinator::new(),
            ipi: IpiManager::new(cpu_count),
            vector_table,
            console,
            env,
            dispatchers: (0..cpu_count).map(|_| FaultDispatcher::new()).collect(),
            cpu_states: (0..cpu_count).map(|id| CpuState::new(id, pal_base)).collect(),
            cpu_count,
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn tlb(&self, cpu_id: usize) -> &TlbShard {
        &self.tlb[cpu_id]
    }

    pub fn dispatcher(&self, cpu_id: usize) -> &FaultDispatcher {
        &self.dispatchers[cpu_id]
    }

    pub fn cpu_state(&self, cpu_id: usize) -> &CpuState {
        &self.cpu_states[cpu_id]
    }

    pub fn cpu_state_mut(&mut self, cpu_id: usize) -> &mut CpuState {
        &mut self.cpu_states[cpu_id]
    }

    /// Bundle the collaborators an MBox call needs for `cpu_id`'s current
    /// mode/ASN (§4.1).
    pub fn mbox_context(&self, cpu_id: usize, mode: Mode, physical_mode: bool) -> MemoryAccessContext<'_> {
        MemoryAccessContext {
            mem: &self.mem,
            tlb: &self.tlb[cpu_id],
            reservations: &self.reservations,
            dispatcher: &self.dispatchers[cpu_id],
            asn: self.cpu_states[cpu_id].asn,
            mode,
            physical_mode,
        }
    }

    /// Bundle the collaborators a CALL_PAL dispatch needs for `cpu_id`
    /// (§4.2).
    pub fn pal_context(&self, cpu_id: usize, physical_mode: bool) -> PalContext<'_> {
        PalContext {
            mem: &self.mem,
            tlb: &self.tlb[cpu_id],
            reservations: &self.reservations,
            barrier: &self.barrier,
            ipi: &self.ipi,
            dispatcher: &self.dispatchers[cpu_id],
            vector_table: &self.vector_table,
            console: self.console.as_ref(),
            env: self.env.as_ref(),
            cpu_id,
            active_cpu_count: self.cpu_count,
            physical_mode,
        }
    }

    /// Apply any TLB shootdown IPIs addressed to `cpu_id` (§5 recognition
    /// point — a CPU observes these only when it chooses to look, typically
    /// once per instruction boundary).
    pub fn recognize_ipis(&self, cpu_id: usize) {
        for cmd in self.ipi.drain(cpu_id) {
            apply_ipi_command(&self.tlb[cpu_id], &self.barrier, cpu_id, cmd);
        }
    }
}

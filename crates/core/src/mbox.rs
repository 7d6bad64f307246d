//! MBox — memory-opcode execution: effective address, alignment, translation,
//! LL/SC, and guest-memory access (§4.1).

use std::sync::atomic::{AtomicBool, Ordering};

use crate::fault::{classify_translation_fault, ExceptionClass, FaultDispatcher, PendingEvent};
use crate::guest_memory::GuestMemory;
use crate::pte::{AccessKind, Mode};
use crate::reservation::ReservationManager;
use crate::state::CpuState;
use crate::tlb::{Realm, TlbShard};
use crate::translator::{self, TranslationFault};

/// Outbound fields the pipeline inspects after an MBox call (§3: Pipeline
/// slot; §6 Pipeline/MBox interface).
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineSlot {
    pub va: u64,
    pub pa: u64,
    pub pay_load: u64,
    pub needs_writeback: bool,
    pub write_ra: Option<u8>,
    pub write_fa: Option<u8>,
    pub fault_pending: bool,
    pub trap_code: Option<ExceptionClass>,
    pub fault_va: u64,
}

impl PipelineSlot {
    fn align_fault(&mut self, va: u64) {
        self.va = va;
        self.fault_pending = true;
        self.trap_code = Some(ExceptionClass::Unalign);
        self.fault_va = va;
        self.needs_writeback = false;
    }

    fn translation_fault(&mut self, fault: TranslationFault) {
        self.va = fault.va;
        self.fault_pending = true;
        self.trap_code = Some(classify_translation_fault(fault));
        self.fault_va = fault.va;
        self.needs_writeback = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntLoadOp {
    Ldl,
    Ldq,
    Ldwu,
    Ldbu,
}

impl IntLoadOp {
    fn align_mask(self) -> u64 {
        match self {
            IntLoadOp::Ldl => 0x3,
            IntLoadOp::Ldq => 0x7,
            IntLoadOp::Ldwu => 0x1,
            IntLoadOp::Ldbu => 0x0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntStoreOp {
    Stl,
    Stq,
    Stw,
    Stb,
}

impl IntStoreOp {
    fn align_mask(self) -> u64 {
        match self {
            IntStoreOp::Stl => 0x3,
            IntStoreOp::Stq => 0x7,
            IntStoreOp::Stw => 0x1,
            IntStoreOp::Stb => 0x0,
        }
    }
}

/// F-format loads. LDG/LDT are raw 8-byte transfers (G-float and T-float
/// both happen to be 8 bytes wide; this core does not model VAX G-float
/// rounding, only IEEE T-float, so LDG is treated identically to LDT). LDS
/// converts a 4-byte IEEE single into the 8-byte double representation kept
/// in the FP register file; LDF (legacy VAX F-float) is treated the same way
/// as LDS since this core carries no VAX floating-point conversion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatLoadOp {
    Ldg,
    Ldt,
    Lds,
    Ldf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatStoreOp {
    Stg,
    Stt,
    Sts,
    Stf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlOp {
    LdlL,
    LdqL,
}

impl LlOp {
    fn align_mask(self) -> u64 {
        match self {
            LlOp::LdlL => 0x3,
            LlOp::LdqL => 0x7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScOp {
    StlC,
    StqC,
}

impl ScOp {
    fn align_mask(self) -> u64 {
        match self {
            ScOp::StlC => 0x3,
            ScOp::StqC => 0x7,
        }
    }
}

/// Collaborators MBox needs for a single operation: the CPU's TLB shard, the
/// shared reservation manager, and the shared fault dispatcher for this CPU.
/// Passed by reference at each call site rather than stored, per §9's
/// "ownership moves from raw borrowed pointers to explicit references".
pub struct MemoryAccessContext<'a> {
    pub mem: &'a dyn GuestMemory,
    pub tlb: &'a TlbShard,
    pub reservations: &'a ReservationManager,
    pub dispatcher: &'a FaultDispatcher,
    pub asn: u64,
    pub mode: Mode,
    pub physical_mode: bool,
}

/// Per-CPU memory-opcode executor. Runs single-threaded for its CPU; `isBusy`
/// is exposed for schedulers that want to order against it (§4.1
/// Concurrency).
#[derive(Default)]
pub struct MBox {
    busy: AtomicBool,
}

impl MBox {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn with_busy<T>(&self, f: impl FnOnce() -> T) -> T {
        self.busy.store(true, Ordering::Release);
        let result = f();
        self.busy.store(false, Ordering::Release);
        result
    }

    /// EA = Rb + sign_extend(disp16). No translation, no faults; R31
    /// destination discards the result via `CpuState::write_int`.
    pub fn effective_address(rb_value: u64, disp16: i16) -> u64 {
        rb_value.wrapping_add(disp16 as i64 as u64)
    }

    /// LDAH: disp16 is shifted left 16 bits before sign-extension.
    pub fn effective_address_high(rb_value: u64, disp16: i16) -> u64 {
        let shifted = (disp16 as i64) << 16;
        rb_value.wrapping_add(shifted as u64)
    }

    pub fn execute_lda(&self, state: &mut CpuState, ra: u8, rb_value: u64, disp16: i16) {
        state.write_int(ra, Self::effective_address(rb_value, disp16));
    }

    pub fn execute_ldah(&self, state: &mut CpuState, ra: u8, rb_value: u64, disp16: i16) {
        state.write_int(ra, Self::effective_address_high(rb_value, disp16));
    }

    /// LDL/LDQ/LDWU/LDBU (§4.1, §8 properties 1 & 3).
    pub fn execute_load(
        &self,
        ctx: &MemoryAccessContext,
        state: &mut CpuState,
        op: IntLoadOp,
        ra: u8,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let va = Self::effective_address(rb_value, disp16);
            slot.va = va;
            if va & op.align_mask() != 0 {
                slot.align_fault(va);
                return slot;
            }
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Read,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    return slot;
                }
            };
            slot.pa = translation.pa;

            let value = match op {
                IntLoadOp::Ldl => ctx.mem.read32(translation.pa).map(|v| v as i32 as i64 as u64),
                IntLoadOp::Ldq => ctx.mem.read64(translation.pa),
                IntLoadOp::Ldwu => ctx.mem.read16(translation.pa).map(|v| v as u64),
                IntLoadOp::Ldbu => ctx.mem.read8(translation.pa).map(|v| v as u64),
            };
            match value {
                Ok(v) => {
                    slot.pay_load = v;
                    slot.needs_writeback = true;
                    slot.write_ra = Some(ra);
                    state.write_int(ra, v);
                }
                Err(_) => {
                    ctx.dispatcher.raise_fault(PendingEvent::machine_check(
                        crate::fault::MachineCheckReason::IoBusError,
                        translation.pa,
                        fault_pc,
                        ctx.mode,
                    ));
                    slot.fault_pending = true;
                }
            }
            slot
        })
    }

    /// STL/STQ/STW/STB (§4.1, §8 properties 1, 3 & 6).
    pub fn execute_store(
        &self,
        ctx: &MemoryAccessContext,
        op: IntStoreOp,
        ra_value: u64,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let va = Self::effective_address(rb_value, disp16);
            slot.va = va;
            if va & op.align_mask() != 0 {
                slot.align_fault(va);
                return slot;
            }
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Write,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    return slot;
                }
            };
            slot.pa = translation.pa;
            slot.pay_load = ra_value;

            let result = match op {
                IntStoreOp::Stl => ctx.mem.write32(translation.pa, ra_value as u32),
                IntStoreOp::Stq => ctx.mem.write64(translation.pa, ra_value),
                IntStoreOp::Stw => ctx.mem.write16(translation.pa, ra_value as u16),
                IntStoreOp::Stb => ctx.mem.write8(translation.pa, ra_value as u8),
            };
            match result {
                Ok(()) => ctx.reservations.break_reservation(translation.pa),
                Err(_) => {
                    ctx.dispatcher.raise_fault(PendingEvent::machine_check(
                        crate::fault::MachineCheckReason::IoBusError,
                        translation.pa,
                        fault_pc,
                        ctx.mode,
                    ));
                    slot.fault_pending = true;
                }
            }
            slot
        })
    }

    /// LDQ_U: force 8-byte alignment by clearing bits [2:0]; no alignment
    /// fault is possible (§4.1, §8 property 4).
    pub fn execute_load_unaligned_quad(
        &self,
        ctx: &MemoryAccessContext,
        state: &mut CpuState,
        ra: u8,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let ea = Self::effective_address(rb_value, disp16);
            let va = ea & !0x7;
            slot.va = va;
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Read,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    slot.fault_va = ea;
                    return slot;
                }
            };
            slot.pa = translation.pa;
            if let Ok(v) = ctx.mem.read64(translation.pa) {
                slot.pay_load = v;
                slot.needs_writeback = true;
                slot.write_ra = Some(ra);
                state.write_int(ra, v);
            }
            slot
        })
    }

    /// STQ_U: same forced alignment as LDQ_U.
    pub fn execute_store_unaligned_quad(
        &self,
        ctx: &MemoryAccessContext,
        ra_value: u64,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let ea = Self::effective_address(rb_value, disp16);
            let va = ea & !0x7;
            slot.va = va;
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Write,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    slot.fault_va = ea;
                    return slot;
                }
            };
            slot.pa = translation.pa;
            slot.pay_load = ra_value;
            if ctx.mem.write64(translation.pa, ra_value).is_ok() {
                ctx.reservations.break_reservation(translation.pa);
            }
            slot
        })
    }

    /// F-format loads: LDG/LDT (8-byte aligned), LDS/LDF (4-byte aligned,
    /// S-float→T-float widened on load).
    pub fn execute_float_load(
        &self,
        ctx: &MemoryAccessContext,
        state: &mut CpuState,
        op: FloatLoadOp,
        fa: u8,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let va = Self::effective_address(rb_value, disp16);
            slot.va = va;
            let align_mask = match op {
                FloatLoadOp::Ldg | FloatLoadOp::Ldt => 0x7,
                FloatLoadOp::Lds | FloatLoadOp::Ldf => 0x3,
            };
            if va & align_mask != 0 {
                slot.align_fault(va);
                return slot;
            }
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Read,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    return slot;
                }
            };
            slot.pa = translation.pa;
            let value = match op {
                FloatLoadOp::Ldg | FloatLoadOp::Ldt => ctx.mem.read64(translation.pa),
                FloatLoadOp::Lds | FloatLoadOp::Ldf => ctx
                    .mem
                    .read32(translation.pa)
                    .map(|bits| f64::from(f32::from_bits(bits)).to_bits()),
            };
            if let Ok(v) = value {
                slot.pay_load = v;
                slot.needs_writeback = true;
                slot.write_fa = Some(fa);
                state.write_fp(fa, v);
            }
            slot
        })
    }

    /// F-format stores: inverse of `execute_float_load`.
    pub fn execute_float_store(
        &self,
        ctx: &MemoryAccessContext,
        op: FloatStoreOp,
        fa_value: u64,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let va = Self::effective_address(rb_value, disp16);
            slot.va = va;
            let align_mask = match op {
                FloatStoreOp::Stg | FloatStoreOp::Stt => 0x7,
                FloatStoreOp::Sts | FloatStoreOp::Stf => 0x3,
            };
            if va & align_mask != 0 {
                slot.align_fault(va);
                return slot;
            }
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Write,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    return slot;
                }
            };
            slot.pa = translation.pa;
            slot.pay_load = fa_value;
            let result = match op {
                FloatStoreOp::Stg | FloatStoreOp::Stt => ctx.mem.write64(translation.pa, fa_value),
                FloatStoreOp::Sts | FloatStoreOp::Stf => {
                    let narrowed = f64::from_bits(fa_value) as f32;
                    ctx.mem.write32(translation.pa, narrowed.to_bits())
                }
            };
            if result.is_ok() {
                ctx.reservations.break_reservation(translation.pa);
            }
            slot
        })
    }

    /// LDL_L/LDQ_L: load then arm a reservation on the covering cache line
    /// (§4.1, §8 property 5, scenarios C/D).
    pub fn execute_load_locked(
        &self,
        ctx: &MemoryAccessContext,
        state: &mut CpuState,
        cpu: usize,
        op: LlOp,
        ra: u8,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let va = Self::effective_address(rb_value, disp16);
            slot.va = va;
            if va & op.align_mask() != 0 {
                slot.align_fault(va);
                return slot;
            }
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Read,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    return slot;
                }
            };
            slot.pa = translation.pa;
            let value = match op {
                LlOp::LdlL => ctx.mem.read32(translation.pa).map(|v| v as i32 as i64 as u64),
                LlOp::LdqL => ctx.mem.read64(translation.pa),
            };
            if let Ok(v) = value {
                slot.pay_load = v;
                slot.needs_writeback = true;
                slot.write_ra = Some(ra);
                state.write_int(ra, v);
                ctx.reservations.set_reservation(cpu, translation.pa);
            }
            slot
        })
    }

    /// STL_C/STQ_C: translate, then validate-and-clear the reservation. On
    /// success, write the store and break other CPUs' reservations on the
    /// same line; R-destination receives 1. On failure, no write and R
    /// receives 0 (§4.1, §8 property 5, scenarios C/D).
    pub fn execute_store_conditional(
        &self,
        ctx: &MemoryAccessContext,
        state: &mut CpuState,
        cpu: usize,
        op: ScOp,
        ra: u8,
        ra_value: u64,
        rb_value: u64,
        disp16: i16,
        fault_pc: u64,
    ) -> PipelineSlot {
        self.with_busy(|| {
            let mut slot = PipelineSlot::default();
            let va = Self::effective_address(rb_value, disp16);
            slot.va = va;
            if va & op.align_mask() != 0 {
                slot.align_fault(va);
                return slot;
            }
            let translation = match translator::translate(
                ctx.tlb,
                Realm::Data,
                va,
                AccessKind::Write,
                ctx.mode,
                ctx.asn,
                ctx.physical_mode,
            ) {
                Ok(t) => t,
                Err(fault) => {
                    ctx.dispatcher.raise_fault(PendingEvent::translation_fault(
                        fault, fault_pc, ctx.asn, ctx.mode,
                    ));
                    slot.translation_fault(fault);
                    return slot;
                }
            };
            slot.pa = translation.pa;

            if !ctx.reservations.check_and_clear_reservation(cpu, translation.pa) {
                slot.pay_load = 0;
                slot.needs_writeback = true;
                slot.write_ra = Some(ra);
                state.write_int(ra, 0);
                return slot;
            }

            let result = match op {
                ScOp::StlC => ctx.mem.write32(translation.pa, ra_value as u32),
                ScOp::StqC => ctx.mem.write64(translation.pa, ra_value),
            };
            match result {
                Ok(()) => {
                    ctx.reservations.break_reservations_on_cache_line(translation.pa);
                    slot.pay_load = 1;
                    slot.needs_writeback = true;
                    slot.write_ra = Some(ra);
                    state.write_int(ra, 1);
                }
                Err(_) => {
                    ctx.dispatcher.raise_fault(PendingEvent::machine_check(
                        crate::fault::MachineCheckReason::IoBusError,
                        translation.pa,
                        fault_pc,
                        ctx.mode,
                    ));
                    slot.fault_pending = true;
                }
            }
            slot
        })
    }
}

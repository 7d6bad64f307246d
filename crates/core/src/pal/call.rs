//! CALL_PAL dispatch, PAL mode bookkeeping, and vector entry (§4.2).

use crate::barrier::MemoryBarrierCoordinator;
use crate::console::{ConsoleDevice, EnvStore};
use crate::error::TlbCommitError;
use crate::fault::{FaultDispatcher, PalVectorId, PendingEvent};
use crate::guest_memory::GuestMemory;
use crate::ipi::{IpiCommand, IpiManager};
use crate::pte::{AccessKind, Mode};
use crate::reservation::ReservationManager;
use crate::state::{CpuState, ProcessorStatus};
use crate::tlb::{Realm, TlbShard};
use crate::translator;

use super::cserve::{self, CserveContext, CserveOutcome};
use super::queue::{self, LinkWidth};
use super::result::PalResult;
use super::vector_table::PalVectorTable;

/// Distance between successive SWPPAL variant entry points (§4.2.4).
const PAL_VARIANT_STRIDE: u64 = 0x1000;

/// HWPCB field offsets SWPCTX loads from/stores to (§4.2.4: "load new
/// HWPCB at R16, update PCBB IPR, load the mode-appropriate stack pointer
/// into R30, sync IPL from the new HWPCB"). The exact HWPCB byte layout is
/// PALcode-private on real hardware; this core defines its own fixed
/// layout since nothing outside SWPCTX itself needs to agree with it.
const HWPCB_KSP: u64 = 0x00;
const HWPCB_ESP: u64 = 0x08;
const HWPCB_SSP: u64 = 0x10;
const HWPCB_USP: u64 = 0x18;
const HWPCB_PTBR: u64 = 0x20;
const HWPCB_ASN: u64 = 0x28;
const HWPCB_IPL: u64 = 0x30;

/// Every CALL_PAL / HW_MFPR / HW_MTPR function this core services. This
/// core funnels HW_MFPR/HW_MTPR through the same dispatch as CALL_PAL
/// functions rather than modeling them as the separate hardware
/// instructions real silicon uses — PALcode itself is the only consumer of
/// either, and folding them into one switch keeps the handler table in one
/// place (§4.2.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PalCallPalFunction {
    Halt,
    Cflush,
    Draina,
    Imb,
    Cserve,
    Swppal,
    Wtint,
    SwpCtx,

    MfprWhami,
    MfprIpl,
    MtprIpl,
    MfprAsn,
    MfprPcbb,
    MfprPtbr,
    MtprPtbr,
    MfprScbb,
    MtprScbb,
    MfprSisr,
    MtprSirr,
    MfprVptb,
    MtprVptb,
    MfprEsp,
    MtprEsp,
    MfprSsp,
    MtprSsp,
    MfprUsp,
    MtprUsp,
    MfprFen,
    MtprFen,
    MfprMces,
    MtprMces,
    MfprPrbr,
    MtprPrbr,
    MfprAsten,
    MtprAsten,
    MfprAstsr,
    MtprAstsr,
    MfprTbChk,
    MtprTbia,
    MtprTbiap,
    MtprTbis,
    MtprTbisd,
    MtprTbisi,
    MtprIpir,
    MtprPerfmon,
    MtprDatfx,

    SwAsten,
    SwpIpl,
    RdPs,
    WrPs,
    ReadUnq,
    WriteUnq,

    GenTrap,
    Bpt,
    BugChk,
    Callsys,
    Chmk,
    Chme,
    Chms,
    Chmu,
    Rti,
    Rfe,

    LdqP,
    StqP,
    AmovRm,
    AmovRr,
    Prober,
    Probew,

    InsqHil,
    InsqTil,
    InsqHiq,
    InsqTiq,
    RemqHil,
    RemqTil,
    RemqHiq,
    RemqTiq,
}

/// `enterPALVector`/`setPalMode`/canonicalization: the only sanctioned path
/// for mutating the PAL-mode bit of PC (§4.2.2, §4.2.3, §3 Invariant 2).
pub fn set_pal_mode(state: &mut CpuState, enable: bool) {
    if enable {
        state.pc |= 1;
        state.ps.mode = Mode::Kernel as u8;
    } else {
        state.pc &= !1;
    }
}

pub fn exit_pal(state: &mut CpuState) {
    set_pal_mode(state, false);
}

pub fn canonicalize_pal_pc(pc: u64) -> u64 {
    pc | 1
}

pub fn canonicalize_user_pc(pc: u64) -> u64 {
    pc & !1
}

/// Collaborators a CALL_PAL handler may need, bundled so call sites don't
/// thread eight parameters through every function (§9: explicit references
/// held by the per-CPU context rather than raw borrowed pointers).
pub struct PalContext<'a> {
    pub mem: &'a dyn GuestMemory,
    pub tlb: &'a TlbShard,
    pub reservations: &'a ReservationManager,
    pub barrier: &'a MemoryBarrierCoordinator,
    pub ipi: &'a IpiManager,
    pub dispatcher: &'a FaultDispatcher,
    pub vector_table: &'a PalVectorTable,
    pub console: &'a dyn ConsoleDevice,
    pub env: &'a dyn EnvStore,
    pub cpu_id: usize,
    pub active_cpu_count: usize,
    pub physical_mode: bool,
}

/// Apply a remotely-originated TLB shootdown or barrier-wakeup command
/// against this CPU, consumed at the next IPI recognition point (§5).
/// `MemoryBarrierRequest` is answered immediately with an acknowledgement —
/// this core's CPUs have no other suspension point between recognition
/// points, so there is nothing to defer.
pub fn apply_ipi_command(
    tlb: &TlbShard,
    barrier: &MemoryBarrierCoordinator,
    cpu_id: usize,
    cmd: IpiCommand,
) {
    match cmd {
        IpiCommand::TlbInvalidateVa { realm, va, asn } => tlb.invalidate_entry(realm, va, asn),
        IpiCommand::TlbInvalidateAsn { asn } => tlb.invalidate_all_by_asn(asn),
        IpiCommand::TlbInvalidateAll => tlb.invalidate_all(),
        IpiCommand::MemoryBarrierRequest => barrier.acknowledge_memory_barrier(cpu_id),
        IpiCommand::Custom(_) => {}
    }
}

/// IMB/CFLUSH/DRAINA's actual SMP rendezvous (§4.5, §5): initiate (or join)
/// a global barrier, wake the other participants, and block for their
/// acknowledgement. On a single-CPU system this degenerates to a host fence
/// with no wait, since `initiate_global_memory_barrier` never arms a
/// barrier below two active CPUs.
fn perform_memory_barrier(ctx: &PalContext, state: &CpuState, fault_pc: u64) {
    if ctx.barrier.initiate_global_memory_barrier(ctx.cpu_id, ctx.active_cpu_count) {
        ctx.ipi
            .post_ipi_all_but_self(ctx.cpu_id, IpiCommand::MemoryBarrierRequest);
    }
    ctx.barrier
        .wait_for_barrier_acknowledge(ctx.cpu_id, state.mces, ctx.dispatcher, fault_pc);
}

/// `enterPALVector` (§4.2.2): look up the vector, save `exc_addr`, force PAL
/// mode, adjust IPL if the vector demands it, stage R16..R21 from `args`,
/// and redirect PC. Escalates to MachineCheck if the vector is unregistered.
pub fn enter_pal_vector(
    ctx: &PalContext,
    state: &mut CpuState,
    vector_id: PalVectorId,
    exception_pc: u64,
    args: [u64; 6],
) -> PalResult {
    let entry_pc = match ctx.vector_table.entry_pc(vector_id) {
        Some(pc) => pc,
        None => {
            log::error!("PAL vector {:?} has no bound entry point, raising a machine check", vector_id);
            ctx.dispatcher.raise_fault(PendingEvent::machine_check(
                crate::fault::MachineCheckReason::Unknown,
                0,
                exception_pc,
                state.ps.mode(),
            ));
            return PalResult::raising_exception();
        }
    };
    let desc = ctx.vector_table.lookup(vector_id).unwrap();

    log::debug!("entering PAL vector {:?} from pc={:#x}", vector_id, exception_pc);
    state.ent_fault = exception_pc;
    set_pal_mode(state, true);
    if desc.modifies_ipl {
        state.ps.ipl = desc.target_ipl;
    }
    for (i, value) in args.iter().enumerate() {
        state.write_int(16 + i as u8, *value);
    }
    state.pc = canonicalize_pal_pc(entry_pc);

    PalResult::transfers_to(state.pc).with_flush(state.pc)
}

fn translate_data(
    ctx: &PalContext,
    state: &CpuState,
    va: u64,
    kind: AccessKind,
) -> Result<u64, translator::TranslationFault> {
    translator::translate(ctx.tlb, Realm::Data, va, kind, state.ps.mode(), state.asn, ctx.physical_mode)
        .map(|t| t.pa)
}

fn stage_translation_fault(ctx: &PalContext, state: &CpuState, fault: translator::TranslationFault, fault_pc: u64) {
    ctx.dispatcher
        .raise_fault(PendingEvent::translation_fault(fault, fault_pc, state.asn, state.ps.mode()));
}

/// Read one HWPCB field at `pcb_va + offset`, translating and faulting the
/// same way every other PAL memory helper does.
fn read_hwpcb_field(
    ctx: &PalContext,
    state: &CpuState,
    pcb_va: u64,
    offset: u64,
) -> Result<u64, translator::TranslationFault> {
    let va = pcb_va.wrapping_add(offset);
    let pa = translate_data(ctx, state, va, AccessKind::Read)?;
    ctx.mem.read64(pa).map_err(|_| translator::TranslationFault {
        kind: translator::TranslationFaultKind::AccessViolation,
        realm: Realm::Data,
        va,
    })
}

/// Push PS then PC onto the destination mode's stack and transfer control
/// through the CALL_CENTRY table, as a generic CALL_PAL entry would (§4.2.4
/// CHMK/CHME/CHMS/CHMU: "control transfers through SCB"; this core has no
/// separate SCB-walk model, so it reuses the CALL_CENTRY_BEG mechanism that
/// every other CALL_PAL function already transfers through).
fn change_mode(
    ctx: &PalContext,
    state: &mut CpuState,
    function_code: u32,
    target_mode: Mode,
    fault_pc: u64,
) -> PalResult {
    let ps_bits = state.ps.to_bits();
    let return_pc = fault_pc + 4;
    let mut sp = state.stack_pointer(target_mode);
    sp = sp.wrapping_sub(16);

    if let Ok(pa) = translate_data(ctx, state, sp, AccessKind::Write) {
        let _ = ctx.mem.write64(pa, ps_bits);
    }
    if let Ok(pa) = translate_data(ctx, state, sp + 8, AccessKind::Write) {
        let _ = ctx.mem.write64(pa, return_pc);
    }
    state.set_stack_pointer(target_mode, sp);
    state.ps.mode = target_mode as u8;

    let entry = ctx
        .vector_table
        .call_entry_pc(function_code)
        .unwrap_or(state.pal_base);
    set_pal_mode(state, true);
    state.pc = canonicalize_pal_pc(entry);
    PalResult::transfers_to(state.pc).with_flush(state.pc)
}

fn return_from_exception(ctx: &PalContext, state: &mut CpuState, clear_pal_bit: bool) -> PalResult {
    let sp = state.ksp;
    let pc = match translate_data(ctx, state, sp, AccessKind::Read).and_then(|pa| {
        ctx.mem.read64(pa).map_err(|_| translator::TranslationFault {
            kind: translator::TranslationFaultKind::AccessViolation,
            realm: Realm::Data,
            va: sp,
        })
    }) {
        Ok(v) => v,
        Err(fault) => {
            stage_translation_fault(ctx, state, fault, state.pc);
            return PalResult::raising_exception();
        }
    };
    let ps_bits = match translate_data(ctx, state, sp + 8, AccessKind::Read).and_then(|pa| {
        ctx.mem.read64(pa).map_err(|_| translator::TranslationFault {
            kind: translator::TranslationFaultKind::AccessViolation,
            realm: Realm::Data,
            va: sp + 8,
        })
    }) {
        Ok(v) => v,
        Err(fault) => {
            stage_translation_fault(ctx, state, fault, state.pc);
            return PalResult::raising_exception();
        }
    };

    state.ksp = sp.wrapping_add(16);
    state.ps = ProcessorStatus::from_bits(ps_bits);
    state.pc = if clear_pal_bit { pc & !1 } else { pc };
    PalResult::transfers_to(state.pc)
        .with_flush(state.pc)
        .with_reevaluate_traps()
}

fn swppal(state: &mut CpuState, variant: u8) -> PalResult {
    if variant > 3 {
        return PalResult::returns_value(1);
    }
    let entry = state.pal_base + u64::from(variant) * PAL_VARIANT_STRIDE;
    set_pal_mode(state, true);
    state.pc = canonicalize_pal_pc(entry);
    PalResult::transfers_to(state.pc).with_flush(state.pc)
}

fn probe(ctx: &PalContext, state: &CpuState, va: u64, kind: AccessKind) -> u64 {
    match translate_data(ctx, state, va, kind) {
        Ok(_) => 0,
        Err(fault) if fault.kind == translator::TranslationFaultKind::Miss => 1,
        Err(_) => 2,
    }
}

/// `INSQ`/`REMQ` family: like every other PAL memory helper, `header`/
/// `entry` are guest VAs that PALcode translates itself before walking the
/// queue (§4.2.4: "All use guest VA→PA translation; failures return 1 in
/// R0").
#[allow(clippy::too_many_arguments)]
fn queue_insert(
    ctx: &PalContext,
    state: &CpuState,
    width: LinkWidth,
    at_head: bool,
    header_va: u64,
    entry_va: u64,
    fault_pc: u64,
) -> u64 {
    let header_pa = match translate_data(ctx, state, header_va, AccessKind::Write) {
        Ok(pa) => pa,
        Err(fault) => {
            stage_translation_fault(ctx, state, fault, fault_pc);
            return 1;
        }
    };
    let entry_pa = match translate_data(ctx, state, entry_va, AccessKind::Write) {
        Ok(pa) => pa,
        Err(fault) => {
            stage_translation_fault(ctx, state, fault, fault_pc);
            return 1;
        }
    };
    let result = if at_head {
        queue::insert_head(ctx.mem, width, header_pa, entry_pa)
    } else {
        queue::insert_tail(ctx.mem, width, header_pa, entry_pa)
    };
    if result.is_ok() {
        0
    } else {
        1
    }
}

fn queue_remove(
    state: &mut CpuState,
    ctx: &PalContext,
    width: LinkWidth,
    from_head: bool,
    header_va: u64,
    fault_pc: u64,
) -> u64 {
    let header_pa = match translate_data(ctx, state, header_va, AccessKind::Write) {
        Ok(pa) => pa,
        Err(fault) => {
            stage_translation_fault(ctx, state, fault, fault_pc);
            state.write_int(1, 0);
            return 1;
        }
    };
    let result = if from_head {
        queue::remove_head(ctx.mem, width, header_pa)
    } else {
        queue::remove_tail(ctx.mem, width, header_pa)
    };
    match result {
        Ok(Some(entry_pa)) => {
            state.write_int(1, entry_pa);
            0
        }
        Ok(None) => {
            state.write_int(1, 0);
            1
        }
        Err(_) => 1,
    }
}

/// Dispatch one CALL_PAL / HW_MFPR / HW_MTPR function. `args` are R16..R21;
/// `fault_pc` is the PC the instruction was issued from, used as `exc_addr`
/// for any fault this call stages.
pub fn dispatch_call_pal(
    ctx: &PalContext,
    state: &mut CpuState,
    function: PalCallPalFunction,
    args: [u64; 6],
    fault_pc: u64,
) -> PalResult {
    use PalCallPalFunction::*;
    let r16 = args[0];
    match function {
        Halt => {
            state.halted = true;
            PalResult::returns().with_flush(fault_pc).with_notify_halt()
        }
        Cflush | Draina => {
            perform_memory_barrier(ctx, state, fault_pc);
            PalResult::returns().with_drain().with_barrier()
        }
        Imb => {
            perform_memory_barrier(ctx, state, fault_pc);
            PalResult::returns().with_barrier().with_flush(state.pc)
        }
        Wtint => {
            state.idle = true;
            PalResult::returns()
        }
        Cserve => {
            let cctx = CserveContext {
                mem: ctx.mem,
                console: ctx.console,
                env: ctx.env,
                tlb: ctx.tlb,
                dispatcher: ctx.dispatcher,
                asn: state.asn,
                mode: state.ps.mode(),
                physical_mode: ctx.physical_mode,
                fault_pc,
            };
            match cserve::dispatch(&cctx, (r16 & 0xFF) as u32, args[1], args[2], args[3]) {
                CserveOutcome::Value { r0, r1 } => {
                    if let Some(v) = r1 {
                        state.write_int(1, v);
                    }
                    PalResult::returns_value(r0)
                }
                CserveOutcome::Faulted => PalResult::raising_exception(),
            }
        }
        Swppal => swppal(state, r16 as u8),
        SwpCtx => {
            // Preconditions (§4.2.4): 128-byte aligned PCB pointer, CM==kernel.
            if r16 & 0x7F != 0 {
                ctx.dispatcher.set_pending_event(PendingEvent::exception(
                    crate::fault::ExceptionClass::OpcDec,
                    fault_pc,
                    state.ps.mode(),
                ));
                return PalResult::raising_exception();
            }
            if state.ps.mode() != Mode::Kernel {
                ctx.dispatcher.set_pending_event(PendingEvent::exception(
                    crate::fault::ExceptionClass::OpcDec,
                    fault_pc,
                    state.ps.mode(),
                ));
                return PalResult::raising_exception();
            }
            let old_pcbb = state.pcbb;
            let old_ptbr = state.ptbr;

            let new_ksp = match read_hwpcb_field(ctx, state, r16, HWPCB_KSP) {
                Ok(v) => v,
                Err(fault) => {
                    stage_translation_fault(ctx, state, fault, fault_pc);
                    return PalResult::raising_exception();
                }
            };
            let new_esp = match read_hwpcb_field(ctx, state, r16, HWPCB_ESP) {
                Ok(v) => v,
                Err(fault) => {
                    stage_translation_fault(ctx, state, fault, fault_pc);
                    return PalResult::raising_exception();
                }
            };
            let new_ssp = match read_hwpcb_field(ctx, state, r16, HWPCB_SSP) {
                Ok(v) => v,
                Err(fault) => {
                    stage_translation_fault(ctx, state, fault, fault_pc);
                    return PalResult::raising_exception();
                }
            };
            let new_usp = match read_hwpcb_field(ctx, state, r16, HWPCB_USP) {
                Ok(v) => v,
                Err(fault) => {
                    stage_translation_fault(ctx, state, fault, fault_pc);
                    return PalResult::raising_exception();
                }
            };
            let new_ptbr = match read_hwpcb_field(ctx, state, r16, HWPCB_PTBR) {
                Ok(v) => v,
                Err(fault) => {
                    stage_translation_fault(ctx, state, fault, fault_pc);
                    return PalResult::raising_exception();
                }
            };
            let new_asn = match read_hwpcb_field(ctx, state, r16, HWPCB_ASN) {
                Ok(v) => v,
                Err(fault) => {
                    stage_translation_fault(ctx, state, fault, fault_pc);
                    return PalResult::raising_exception();
                }
            };
            let new_ipl = match read_hwpcb_field(ctx, state, r16, HWPCB_IPL) {
                Ok(v) => (v & 0x1f) as u8,
                Err(fault) => {
                    stage_translation_fault(ctx, state, fault, fault_pc);
                    return PalResult::raising_exception();
                }
            };

            state.pcbb = r16;
            state.ksp = new_ksp;
            state.esp = new_esp;
            state.ssp = new_ssp;
            state.usp = new_usp;
            state.ptbr = new_ptbr;
            state.asn = new_asn;
            state.ps.ipl = new_ipl;
            // CM is already Kernel (checked above), so R30 for this mode is ksp,
            // already assigned above.

            if state.ptbr != old_ptbr {
                ctx.tlb.invalidate_non_asm(Realm::Data);
                ctx.tlb.invalidate_non_asm(Realm::Instruction);
                state.clear_staged_fills();
            }
            PalResult::returns_value(old_pcbb)
                .with_barrier()
                .with_flush(state.pc)
                .with_branch_predictor_clear()
        }

        MfprWhami => PalResult::returns_value(state.id as u64),
        MfprIpl => PalResult::returns_value(state.ps.ipl as u64),
        MtprIpl => {
            let old = state.ps.ipl;
            let new_ipl = (r16 & 0x1f) as u8;
            state.ps.ipl = new_ipl;
            let mut result = PalResult::returns().with_ipl_changed();
            if new_ipl < old {
                result = result.with_reevaluate_traps();
            }
            result
        }
        MfprAsn => PalResult::returns_value(state.asn),
        MfprPcbb => PalResult::returns_value(state.pcbb),
        MfprPtbr => PalResult::returns_value(state.ptbr),
        MtprPtbr => {
            state.ptbr = r16;
            ctx.tlb.invalidate_non_asm(Realm::Data);
            ctx.tlb.invalidate_non_asm(Realm::Instruction);
            state.clear_staged_fills();
            PalResult::returns()
        }
        MfprScbb => PalResult::returns_value(state.scbb),
        MtprScbb => {
            state.scbb = r16;
            PalResult::returns()
        }
        MfprSisr => PalResult::returns_value(state.sisr),
        MtprSirr => {
            let level = (r16 & 0xF) as u8;
            if level >= 1 {
                state.sisr |= 1 << level;
            }
            PalResult::returns().with_reevaluate_traps()
        }
        MfprVptb => PalResult::returns_value(state.vptb),
        MtprVptb => {
            state.vptb = r16;
            PalResult::returns()
        }
        MfprEsp => PalResult::returns_value(state.esp),
        MtprEsp => {
            state.esp = r16;
            PalResult::returns()
        }
        MfprSsp => PalResult::returns_value(state.ssp),
        MtprSsp => {
            state.ssp = r16;
            PalResult::returns()
        }
        MfprUsp => PalResult::returns_value(state.usp),
        MtprUsp => {
            state.usp = r16;
            PalResult::returns()
        }
        MfprFen => PalResult::returns_value(state.fen as u64),
        MtprFen => {
            state.fen = r16 & 1 != 0;
            PalResult::returns()
        }
        MfprMces => PalResult::returns_value(state.mces.bits() as u64),
        MtprMces => {
            state.mces.apply_write(r16 as u8);
            PalResult::returns()
        }
        // TODO: PRBR and UNQ are architecturally distinct IPRs; this core
        // backs both with the same per-CPU storage since no observed
        // behavior in scope distinguishes them. Split if a consumer needs
        // independent values.
        MfprPrbr => PalResult::returns_value(state.unq),
        MtprPrbr => {
            state.unq = r16;
            PalResult::returns()
        }
        MfprAsten => PalResult::returns_value(state.aster.get() as u64),
        MtprAsten => {
            let old = state.aster.masked_rmw(r16);
            PalResult::returns_value(old as u64)
        }
        MfprAstsr => PalResult::returns_value(state.astsr.get() as u64),
        MtprAstsr => {
            let old = state.astsr.masked_rmw(r16);
            PalResult::returns_value(old as u64)
        }
        MfprTbChk => {
            let hit = ctx.tlb.tbchk_probe(r16, state.asn);
            PalResult::returns_value(if hit { 1 } else { 0 })
        }
        MtprTbia => {
            ctx.tlb.invalidate_all();
            state.clear_staged_fills();
            ctx.ipi.post_ipi_all_but_self(ctx.cpu_id, IpiCommand::TlbInvalidateAll);
            PalResult::returns()
        }
        MtprTbiap => {
            ctx.tlb.invalidate_all_by_asn(r16);
            state.clear_staged_fills();
            ctx.ipi
                .post_ipi_all_but_self(ctx.cpu_id, IpiCommand::TlbInvalidateAsn { asn: r16 });
            PalResult::returns()
        }
        MtprTbis => {
            ctx.tlb.tbis_invalidate(r16, state.asn);
            state.clear_staged_fills();
            for realm in [Realm::Instruction, Realm::Data] {
                ctx.ipi.post_ipi_all_but_self(
                    ctx.cpu_id,
                    IpiCommand::TlbInvalidateVa { realm, va: r16, asn: state.asn },
                );
            }
            PalResult::returns()
        }
        MtprTbisd => {
            ctx.tlb.tbisd_invalidate(r16, state.asn);
            state.clear_staged_fills();
            ctx.ipi.post_ipi_all_but_self(
                ctx.cpu_id,
                IpiCommand::TlbInvalidateVa { realm: Realm::Data, va: r16, asn: state.asn },
            );
            PalResult::returns()
        }
        MtprTbisi => {
            ctx.tlb.tbisi_invalidate(r16, state.asn);
            state.clear_staged_fills();
            ctx.ipi.post_ipi_all_but_self(
                ctx.cpu_id,
                IpiCommand::TlbInvalidateVa { realm: Realm::Instruction, va: r16, asn: state.asn },
            );
            PalResult::returns()
        }
        MtprIpir => {
            for target in 0..ctx.ipi.cpu_count() {
                if (r16 & (1 << target)) == 0 {
                    continue;
                }
                if target == ctx.cpu_id {
                    continue;
                }
                ctx.ipi.post_ipi(target, IpiCommand::Custom(1));
            }
            let mut result = PalResult::returns();
            if r16 & (1 << ctx.cpu_id) != 0 {
                result = result.with_reevaluate_traps();
            }
            result
        }
        MtprPerfmon | MtprDatfx => PalResult::returns(),

        SwAsten => {
            let old = state.aster.get();
            state.aster = crate::state::ModeMask((r16 & 0xF) as u8);
            PalResult::returns_value(old as u64)
        }
        SwpIpl => {
            let old = state.ps.ipl;
            let new_ipl = (r16 & 0x1f) as u8;
            state.ps.ipl = new_ipl;
            let mut result = PalResult::returns_value(old as u64).with_ipl_changed();
            if new_ipl < old {
                result = result.with_reevaluate_traps();
            }
            result
        }
        RdPs => PalResult::returns_value(state.ps.to_bits()),
        WrPs => {
            state.ps = ProcessorStatus::from_bits(r16);
            PalResult::returns()
        }
        ReadUnq => PalResult::returns_value(state.unq),
        WriteUnq => {
            state.unq = r16;
            PalResult::returns()
        }

        GenTrap | Bpt | BugChk | Callsys => {
            ctx.dispatcher.set_pending_event(PendingEvent::software_trap(
                function as u32,
                r16,
                fault_pc,
                state.ps.mode(),
            ));
            PalResult::raising_exception()
        }
        Chmk => change_mode(ctx, state, Chmk as u32, Mode::Kernel, fault_pc),
        Chme => change_mode(ctx, state, Chme as u32, Mode::Executive, fault_pc),
        Chms => change_mode(ctx, state, Chms as u32, Mode::Supervisor, fault_pc),
        Chmu => change_mode(ctx, state, Chmu as u32, Mode::User, fault_pc),
        Rti => return_from_exception(ctx, state, true),
        Rfe => return_from_exception(ctx, state, false),

        LdqP => {
            if r16 & 0x7 != 0 {
                ctx.dispatcher
                    .raise_fault(PendingEvent::unalign(fault_pc, r16, state.ps.mode()));
                return PalResult::raising_exception();
            }
            match ctx.mem.read64(r16) {
                Ok(v) => PalResult::returns_value(v),
                Err(_) => {
                    ctx.dispatcher.raise_fault(PendingEvent::machine_check(
                        crate::fault::MachineCheckReason::IoBusError,
                        r16,
                        fault_pc,
                        state.ps.mode(),
                    ));
                    PalResult::raising_exception()
                }
            }
        }
        StqP => {
            if r16 & 0x7 != 0 {
                ctx.dispatcher
                    .raise_fault(PendingEvent::unalign(fault_pc, r16, state.ps.mode()));
                return PalResult::raising_exception();
            }
            match ctx.mem.write64(r16, args[1]) {
                Ok(()) => {
                    ctx.reservations.break_reservation(r16);
                    PalResult::returns()
                }
                Err(_) => {
                    ctx.dispatcher.raise_fault(PendingEvent::machine_check(
                        crate::fault::MachineCheckReason::IoBusError,
                        r16,
                        fault_pc,
                        state.ps.mode(),
                    ));
                    PalResult::raising_exception()
                }
            }
        }
        AmovRm => match ctx.mem.read64(r16) {
            Ok(old) => {
                if ctx.mem.write64(r16, args[1]).is_ok() {
                    ctx.reservations.break_reservation(r16);
                }
                PalResult::returns_value(old)
            }
            Err(_) => {
                ctx.dispatcher.raise_fault(PendingEvent::machine_check(
                    crate::fault::MachineCheckReason::IoBusError,
                    r16,
                    fault_pc,
                    state.ps.mode(),
                ));
                PalResult::raising_exception()
            }
        },
        AmovRr => {
            let reg = (r16 & 0x1F) as u8;
            let old = state.read_int(reg);
            state.write_int(reg, args[1]);
            PalResult::returns_value(old)
        }
        Prober => PalResult::returns_value(probe(ctx, state, r16, AccessKind::Read)),
        Probew => PalResult::returns_value(probe(ctx, state, r16, AccessKind::Write)),

        InsqHil => PalResult::returns_value(queue_insert(ctx, state, LinkWidth::Long, true, r16, args[1], fault_pc)),
        InsqTil => PalResult::returns_value(queue_insert(ctx, state, LinkWidth::Long, false, r16, args[1], fault_pc)),
        InsqHiq => PalResult::returns_value(queue_insert(ctx, state, LinkWidth::Quad, true, r16, args[1], fault_pc)),
        InsqTiq => PalResult::returns_value(queue_insert(ctx, state, LinkWidth::Quad, false, r16, args[1], fault_pc)),
        RemqHil => PalResult::returns_value(queue_remove(state, ctx, LinkWidth::Long, true, r16, fault_pc)),
        RemqTil => PalResult::returns_value(queue_remove(state, ctx, LinkWidth::Long, false, r16, fault_pc)),
        RemqHiq => PalResult::returns_value(queue_remove(state, ctx, LinkWidth::Quad, true, r16, fault_pc)),
        RemqTiq => PalResult::returns_value(queue_remove(state, ctx, LinkWidth::Quad, false, r16, fault_pc)),
    }
}

/// Unrecognized CALL_PAL function codes raise OPCDEC (§7 User-visible
/// failure behavior: "unknown PAL functions log and raise OPCDEC").
pub fn unknown_function(ctx: &PalContext, state: &CpuState, fault_pc: u64) -> PalResult {
    log::warn!("unrecognized CALL_PAL function at pc={:#x}, raising OPCDEC", fault_pc);
    ctx.dispatcher.set_pending_event(PendingEvent::exception(
        crate::fault::ExceptionClass::OpcDec,
        fault_pc,
        state.ps.mode(),
    ));
    PalResult::raising_exception()
}

/// Commit a staged ITB/DTB fill into the TLB (TB_FILL). Clears the staging
/// record only on success, so a retried write sequence after a failed
/// commit must restage both halves (§3 Invariants, §8 property 9).
pub fn tb_fill(tlb: &TlbShard, realm: Realm, state: &mut CpuState, global: bool) -> Result<(), TlbCommitError> {
    let staged = match realm {
        Realm::Instruction => &state.itb,
        Realm::Data => &state.dtb,
    };
    let pte = staged.commit()?;
    let tag = staged.tag();
    let asn = if global { 0 } else { state.asn };
    tlb.insert(realm, asn, tag, pte);
    match realm {
        Realm::Instruction => state.itb.clear(),
        Realm::Data => state.dtb.clear(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{MemoryConsole, MemoryEnvStore};
    use crate::fault::FaultDispatcher;
    use crate::guest_memory::FlatGuestMemory;
    use crate::ipi::IpiManager;
    use crate::pal::vector_table::PalVectorTable;

    fn harness() -> (
        FlatGuestMemory,
        TlbShard,
        ReservationManager,
        MemoryBarrierCoordinator,
        IpiManager,
        FaultDispatcher,
        PalVectorTable,
        MemoryConsole,
        MemoryEnvStore,
    ) {
        (
            FlatGuestMemory::new(1 << 20),
            TlbShard::new(),
            ReservationManager::new(2),
            MemoryBarrierCoordinator::new(),
            IpiManager::new(2),
            FaultDispatcher::new(),
            PalVectorTable::new(),
            MemoryConsole::new(),
            MemoryEnvStore::new(),
        )
    }

    #[test]
    fn callsys_raises_a_software_trap_and_does_not_return() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);

        let result = dispatch_call_pal(
            &ctx,
            &mut state,
            PalCallPalFunction::Callsys,
            [0, 0, 0, 0, 0, 0],
            0x2000,
        );
        assert!(!result.does_return);
        let queued = dispatcher.take_queued_event().unwrap();
        assert_eq!(queued.pal_function, PalCallPalFunction::Callsys as u32);
    }

    #[test]
    fn asten_masked_rmw_matches_scenario_e() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);
        state.aster = crate::state::ModeMask(0b1010);

        let result = dispatch_call_pal(
            &ctx,
            &mut state,
            PalCallPalFunction::MtprAsten,
            [0x35, 0, 0, 0, 0, 0],
            0x1000,
        );
        assert_eq!(result.return_value, 0b1010);
        assert_eq!(state.aster.get(), 0b0011);
    }

    #[test]
    fn mtpr_ptbr_drops_non_global_entries_but_keeps_asm() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        tlb.insert(
            Realm::Data,
            1,
            0x7000,
            crate::pte::Pte {
                flags: crate::pte::PteFlags::VALID | crate::pte::PteFlags::KRE,
                pfn: 9,
                size: crate::pte::SizeClass::Page8K,
            },
        );
        tlb.insert(
            Realm::Data,
            1,
            0x8000,
            crate::pte::Pte {
                flags: crate::pte::PteFlags::VALID | crate::pte::PteFlags::KRE | crate::pte::PteFlags::ASM,
                pfn: 10,
                size: crate::pte::SizeClass::Page8K,
            },
        );
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);

        let result = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::MtprPtbr, [0x9000, 0, 0, 0, 0, 0], 0x1000);

        assert!(result.does_return);
        assert_eq!(state.ptbr, 0x9000);
        assert!(tlb.lookup(Realm::Data, 0x7000, 1).is_none());
        assert!(tlb.lookup(Realm::Data, 0x8000, 1).is_some());
    }

    #[test]
    fn tbiap_broadcasts_ipi_and_scopes_invalidation_to_asn() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        tlb.insert(
            Realm::Data,
            1,
            0x4000,
            crate::pte::Pte {
                flags: crate::pte::PteFlags::VALID | crate::pte::PteFlags::KRE,
                pfn: 3,
                size: crate::pte::SizeClass::Page8K,
            },
        );
        tlb.insert(
            Realm::Data,
            2,
            0x4000,
            crate::pte::Pte {
                flags: crate::pte::PteFlags::VALID | crate::pte::PteFlags::KRE,
                pfn: 3,
                size: crate::pte::SizeClass::Page8K,
            },
        );
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 2,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);

        dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::MtprTbiap, [1, 0, 0, 0, 0, 0], 0x1000);

        assert!(tlb.lookup(Realm::Data, 0x4000, 1).is_none());
        assert!(tlb.lookup(Realm::Data, 0x4000, 2).is_some());
        assert_eq!(
            ipi.drain(1),
            vec![IpiCommand::TlbInvalidateAsn { asn: 1 }]
        );
    }

    #[test]
    fn swpctx_rejects_unaligned_pcb_with_opcdec() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);

        let result = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::SwpCtx, [0x101, 0, 0, 0, 0, 0], 0x2000);
        assert!(!result.does_return);
    }

    #[test]
    fn swpctx_loads_the_new_hwpcb_fields_and_flushes_on_ptbr_change() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);
        state.ptbr = 0xaaaa;
        tlb.insert(
            Realm::Data,
            0,
            0x1000,
            crate::pte::Pte {
                flags: crate::pte::PteFlags::VALID | crate::pte::PteFlags::KRE,
                pfn: 1,
                size: crate::pte::SizeClass::Page8K,
            },
        );

        let pcb_va = 0x4000u64;
        mem.write64(pcb_va + HWPCB_KSP, 0x7000_0000).unwrap();
        mem.write64(pcb_va + HWPCB_ESP, 0x7000_1000).unwrap();
        mem.write64(pcb_va + HWPCB_SSP, 0x7000_2000).unwrap();
        mem.write64(pcb_va + HWPCB_USP, 0x7000_3000).unwrap();
        mem.write64(pcb_va + HWPCB_PTBR, 0xbbbb).unwrap();
        mem.write64(pcb_va + HWPCB_ASN, 7).unwrap();
        mem.write64(pcb_va + HWPCB_IPL, 3).unwrap();

        let result = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::SwpCtx, [pcb_va, 0, 0, 0, 0, 0], 0x2000);

        assert!(result.does_return);
        assert_eq!(state.pcbb, pcb_va);
        assert_eq!(state.ksp, 0x7000_0000);
        assert_eq!(state.esp, 0x7000_1000);
        assert_eq!(state.ssp, 0x7000_2000);
        assert_eq!(state.usp, 0x7000_3000);
        assert_eq!(state.ptbr, 0xbbbb);
        assert_eq!(state.asn, 7);
        assert_eq!(state.ps.ipl, 3);
        // PTBR changed, so the stale non-ASM mapping must be gone.
        assert!(tlb.lookup(Realm::Data, 0x1000, 0).is_none());
    }

    #[test]
    fn swppal_transfers_to_variant_offset() {
        let mut state = CpuState::new(0, 0x20000);
        let result = swppal(&mut state, 2);
        assert!(!result.does_return);
        assert_eq!(state.pc, (0x20000 + 2 * PAL_VARIANT_STRIDE) | 1);
    }

    #[test]
    fn queue_round_trip_via_dispatch() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);
        queue::init_header(&mem, LinkWidth::Quad, 0x5000).unwrap();

        let r0 = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::InsqTiq, [0x5000, 0x5100, 0, 0, 0, 0], 0);
        assert_eq!(r0.return_value, 0);

        let r1 = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::RemqHiq, [0x5000, 0, 0, 0, 0, 0], 0);
        assert_eq!(r1.return_value, 0);
        assert_eq!(state.read_int(1), 0x5100);

        let empty = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::RemqHiq, [0x5000, 0, 0, 0, 0, 0], 0);
        assert_eq!(empty.return_value, 1);
        assert_eq!(state.read_int(1), 0);
    }

    #[test]
    fn queue_insert_with_untranslatable_header_stages_a_fault_and_returns_one() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: false,
        };
        let mut state = CpuState::new(0, 0x10000);

        let result = dispatch_call_pal(
            &ctx,
            &mut state,
            PalCallPalFunction::InsqTiq,
            [0x1_0000_5000, 0x1_0000_5100, 0, 0, 0, 0],
            0x2000,
        );
        assert_eq!(result.return_value, 1);
        assert!(dispatcher.has_immediate_fault());
    }

    #[test]
    fn tb_fill_requires_both_staged_halves() {
        let tlb = TlbShard::new();
        let mut state = CpuState::new(0, 0x10000);
        state.dtb.write_tag(0x6000);
        assert_eq!(tb_fill(&tlb, Realm::Data, &mut state, false).unwrap_err(), TlbCommitError::MissingPte);
        state.dtb.write_pte_temp(crate::pte::PteFlags::VALID.bits() as u64 | (9u64 << 32));
        tb_fill(&tlb, Realm::Data, &mut state, false).unwrap();
        assert!(tlb.lookup(Realm::Data, 0x6000, state.asn).is_some());
    }

    #[test]
    fn imb_on_a_uniprocessor_returns_without_blocking() {
        let (mem, tlb, res, barrier, ipi, dispatcher, vt, console, env) = harness();
        let ctx = PalContext {
            mem: &mem,
            tlb: &tlb,
            reservations: &res,
            barrier: &barrier,
            ipi: &ipi,
            dispatcher: &dispatcher,
            vector_table: &vt,
            console: &console,
            env: &env,
            cpu_id: 0,
            active_cpu_count: 1,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);

        let result = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::Imb, [0, 0, 0, 0, 0, 0], 0x1000);
        assert!(result.does_return);
        assert!(!barrier.is_barrier_in_progress());
    }

    #[test]
    fn draina_on_two_cpus_waits_for_the_peers_acknowledgement() {
        use std::sync::Arc;
        use std::thread;

        let mem = Arc::new(FlatGuestMemory::new(1 << 20));
        let tlb = Arc::new(TlbShard::new());
        let res = Arc::new(ReservationManager::new(2));
        let barrier = Arc::new(MemoryBarrierCoordinator::new());
        let ipi = Arc::new(IpiManager::new(2));
        let dispatcher = Arc::new(FaultDispatcher::new());
        let vt = Arc::new(PalVectorTable::new());
        let console = Arc::new(MemoryConsole::new());
        let env = Arc::new(MemoryEnvStore::new());

        let peer_barrier = Arc::clone(&barrier);
        let peer_ipi = Arc::clone(&ipi);
        let peer_tlb = Arc::clone(&tlb);
        let peer = thread::spawn(move || loop {
            let cmds = peer_ipi.drain(1);
            if cmds.iter().any(|c| matches!(c, IpiCommand::MemoryBarrierRequest)) {
                apply_ipi_command(&peer_tlb, &peer_barrier, 1, IpiCommand::MemoryBarrierRequest);
                break;
            }
        });

        let ctx = PalContext {
            mem: mem.as_ref(),
            tlb: tlb.as_ref(),
            reservations: res.as_ref(),
            barrier: barrier.as_ref(),
            ipi: ipi.as_ref(),
            dispatcher: dispatcher.as_ref(),
            vector_table: vt.as_ref(),
            console: console.as_ref(),
            env: env.as_ref(),
            cpu_id: 0,
            active_cpu_count: 2,
            physical_mode: true,
        };
        let mut state = CpuState::new(0, 0x10000);

        let result = dispatch_call_pal(&ctx, &mut state, PalCallPalFunction::Draina, [0, 0, 0, 0, 0, 0], 0x1000);
        peer.join().unwrap();

        assert!(result.does_return);
        assert!(!barrier.is_barrier_in_progress());
        assert!(!dispatcher.has_immediate_fault());
    }
}

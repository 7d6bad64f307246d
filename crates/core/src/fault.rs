//! Pending events and the per-CPU fault dispatcher (§3 PendingEvent; §4.6).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::pte::{AccessKind, Mode};
use crate::translator::{TranslationFault, TranslationFaultKind};
use crate::tlb::Realm;

/// Identifies a PAL entry vector (§4.2.2). `CALL_CENTRY_BEG` is the base of
/// the per-function CALL_PAL entry-call table; the concrete entry PC is
/// computed from the function code, not looked up by a single id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PalVectorId {
    Reset,
    Mchk,
    Arith,
    Interrupt,
    ItbMiss,
    ItbAcv,
    OpcDec,
    Fen,
    Unalign,
    DtbMissSingle,
    DtbMissDouble,
    DtbMissNative,
    CallCentryBeg,
}

/// The kind of exceptional condition a `PendingEvent` describes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    ItbMiss,
    ItbAcv,
    DtbMissSingle,
    DtbMissDouble,
    DFault,
    Unalign,
    OpcDec,
    Fen,
    Arith,
    Interrupt,
    Mchk,
    Reset,
    CallPal,
    SoftwareTrap,
}

/// Map an `ExceptionClass` to the PAL vector that services it (§4.6). Total
/// over the enumeration (§8 property 12).
pub fn map_class_to_pal_vector(class: ExceptionClass) -> PalVectorId {
    match class {
        ExceptionClass::ItbMiss => PalVectorId::ItbMiss,
        ExceptionClass::ItbAcv => PalVectorId::ItbAcv,
        ExceptionClass::DtbMissSingle => PalVectorId::DtbMissSingle,
        ExceptionClass::DtbMissDouble => PalVectorId::DtbMissDouble,
        ExceptionClass::DFault => PalVectorId::DtbMissNative,
        ExceptionClass::Unalign => PalVectorId::Unalign,
        ExceptionClass::OpcDec => PalVectorId::OpcDec,
        ExceptionClass::Fen => PalVectorId::Fen,
        ExceptionClass::Arith => PalVectorId::Arith,
        ExceptionClass::Interrupt => PalVectorId::Interrupt,
        ExceptionClass::Mchk => PalVectorId::Mchk,
        ExceptionClass::Reset => PalVectorId::Reset,
        ExceptionClass::CallPal | ExceptionClass::SoftwareTrap => PalVectorId::CallCentryBeg,
    }
}

/// Convert a translator-level fault into the `ExceptionClass` its realm
/// dictates: ITB faults are either a miss or an access violation; DTB
/// faults are either a miss or the generic data fault vector (§4.6).
pub fn classify_translation_fault(fault: TranslationFault) -> ExceptionClass {
    match (fault.realm, fault.kind) {
        (Realm::Instruction, TranslationFaultKind::Miss) => ExceptionClass::ItbMiss,
        (Realm::Instruction, _) => ExceptionClass::ItbAcv,
        (Realm::Data, TranslationFaultKind::Miss) => ExceptionClass::DtbMissSingle,
        (Realm::Data, _) => ExceptionClass::DFault,
    }
}

/// Machine-check reason codes (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineCheckReason {
    IoBusError,
    SmpBarrierTimeout,
    Unknown,
}

/// A pending architectural event: an exception, a machine check, or an armed
/// (non-faulting) PAL call (§3).
#[derive(Debug, Clone, Copy)]
pub struct PendingEvent {
    pub kind: PendingEventKind,
    pub fault_pc: u64,
    pub fault_va: u64,
    pub asn: u64,
    pub access: Option<AccessKind>,
    pub mode: Mode,
    pub pal_function: u32,
    pub r16: u64,
    pub r17: u64,
    pub mchk_reason: Option<MachineCheckReason>,
    pub mchk_address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingEventKind {
    Exception(ExceptionClass),
    MachineCheck,
    PalCall,
}

impl PendingEvent {
    pub fn exception(class: ExceptionClass, fault_pc: u64, mode: Mode) -> Self {
        Self {
            kind: PendingEventKind::Exception(class),
            fault_pc,
            fault_va: 0,
            asn: 0,
            access: None,
            mode,
            pal_function: 0,
            r16: 0,
            r17: 0,
            mchk_reason: None,
            mchk_address: 0,
        }
    }

    pub fn translation_fault(fault: TranslationFault, fault_pc: u64, asn: u64, mode: Mode) -> Self {
        let class = classify_translation_fault(fault);
        let access = match fault.kind {
            TranslationFaultKind::FaultOnRead => Some(AccessKind::Read),
            TranslationFaultKind::FaultOnWrite => Some(AccessKind::Write),
            TranslationFaultKind::FaultOnExecute => Some(AccessKind::Execute),
            _ => None,
        };
        Self {
            kind: PendingEventKind::Exception(class),
            fault_pc,
            fault_va: fault.va,
            asn,
            access,
            mode,
            pal_function: 0,
            r16: 0,
            r17: 0,
            mchk_reason: None,
            mchk_address: 0,
        }
    }

    pub fn unalign(fault_pc: u64, fault_va: u64, mode: Mode) -> Self {
        Self {
            fault_va,
            ..Self::exception(ExceptionClass::Unalign, fault_pc, mode)
        }
    }

    pub fn machine_check(reason: MachineCheckReason, address: u64, fault_pc: u64, mode: Mode) -> Self {
        Self {
            kind: PendingEventKind::MachineCheck,
            mchk_reason: Some(reason),
            mchk_address: address,
            ..Self::exception(ExceptionClass::Mchk, fault_pc, mode)
        }
    }

    pub fn call_pal(function: u32, r16: u64, r17: u64, fault_pc: u64, mode: Mode) -> Self {
        Self {
            kind: PendingEventKind::PalCall,
            pal_function: function,
            r16,
            r17,
            ..Self::exception(ExceptionClass::CallPal, fault_pc, mode)
        }
    }

    pub fn software_trap(function: u32, r16: u64, fault_pc: u64, mode: Mode) -> Self {
        Self {
            kind: PendingEventKind::Exception(ExceptionClass::SoftwareTrap),
            pal_function: function,
            r16,
            ..Self::exception(ExceptionClass::SoftwareTrap, fault_pc, mode)
        }
    }
}

/// Per-CPU queue of pending events plus an immediate-fault slot (§4.6).
#[derive(Default)]
pub struct FaultDispatcher {
    queue: Mutex<VecDeque<PendingEvent>>,
    immediate: Mutex<Option<PendingEvent>>,
}

impl FaultDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue without disturbing current execution (non-fault requests
    /// like an armed PalCall, or a deferred fault).
    pub fn set_pending_event(&self, ev: PendingEvent) {
        self.queue.lock().unwrap().push_back(ev);
    }

    /// Mark an immediate fault; recognized at the next pipeline boundary.
    pub fn raise_fault(&self, ev: PendingEvent) {
        *self.immediate.lock().unwrap() = Some(ev);
    }

    pub fn has_immediate_fault(&self) -> bool {
        self.immediate.lock().unwrap().is_some()
    }

    /// Drain the immediate fault, if any, for delivery.
    pub fn take_immediate_fault(&self) -> Option<PendingEvent> {
        self.immediate.lock().unwrap().take()
    }

    /// Drain the next queued (non-immediate) event, if any.
    pub fn take_queued_event(&self) -> Option<PendingEvent> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn clear_pending_events(&self) {
        self.queue.lock().unwrap().clear();
        *self.immediate.lock().unwrap() = None;
    }
}

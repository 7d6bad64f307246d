//! PAL vector table: entry descriptors per `PalVectorId`, rebindable to a
//! `PAL_BASE`, plus the total `ExceptionClass → PalVectorId` mapping (§4.2.2,
//! §4.6).

use std::collections::HashMap;

use crate::fault::{map_class_to_pal_vector, ExceptionClass, PalVectorId};
use crate::pte::Mode;

/// Fixed byte offset of each vector's entry point, relative to the bound
/// `PAL_BASE`. Chosen to keep every vector 0x40 apart, matching the spacing
/// convention the teacher's `arch::x86_64` IDT stub table uses for its
/// fixed-stride exception entries.
const VECTOR_STRIDE: u64 = 0x40;

fn ordinal(id: PalVectorId) -> u64 {
    match id {
        PalVectorId::Reset => 0,
        PalVectorId::Mchk => 1,
        PalVectorId::Arith => 2,
        PalVectorId::Interrupt => 3,
        PalVectorId::ItbMiss => 4,
        PalVectorId::ItbAcv => 5,
        PalVectorId::OpcDec => 6,
        PalVectorId::Fen => 7,
        PalVectorId::Unalign => 8,
        PalVectorId::DtbMissSingle => 9,
        PalVectorId::DtbMissDouble => 10,
        PalVectorId::DtbMissNative => 11,
        PalVectorId::CallCentryBeg => 12,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VectorDescriptor {
    pub target_ipl: u8,
    pub required_cm: Mode,
    pub modifies_ipl: bool,
    pub name: &'static str,
    entry_pc: u64,
}

/// Table of PAL entry points, indexed by `PalVectorId`. Effectively constant
/// after boot (§5 Shared-resource policy); `bind_pal_base` recomputes every
/// absolute entry PC in one pass when PAL_BASE changes (e.g. after SWPPAL).
pub struct PalVectorTable {
    descriptors: HashMap<PalVectorId, VectorDescriptor>,
    pal_base: u64,
}

impl Default for PalVectorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PalVectorTable {
    pub fn new() -> Self {
        let mut table = Self {
            descriptors: HashMap::new(),
            pal_base: 0,
        };
        table.register_defaults();
        table
    }

    fn register_defaults(&mut self) {
        use PalVectorId::*;
        let defaults: &[(PalVectorId, u8, Mode, bool, &'static str)] = &[
            (Reset, 31, Mode::Kernel, true, "RESET"),
            (Mchk, 31, Mode::Kernel, true, "MCHK"),
            (Arith, 0, Mode::Kernel, false, "ARITH"),
            (Interrupt, 0, Mode::Kernel, false, "INTERRUPT"),
            (ItbMiss, 0, Mode::Kernel, false, "ITB_MISS"),
            (ItbAcv, 0, Mode::Kernel, false, "ITB_ACV"),
            (OpcDec, 0, Mode::Kernel, false, "OPCDEC"),
            (Fen, 0, Mode::Kernel, false, "FEN"),
            (Unalign, 0, Mode::Kernel, false, "UNALIGN"),
            (DtbMissSingle, 0, Mode::Kernel, false, "DTB_MISS_SINGLE"),
            (DtbMissDouble, 0, Mode::Kernel, false, "DTB_MISS_DOUBLE"),
            (DtbMissNative, 0, Mode::Kernel, false, "DTB_MISS_NATIVE"),
            (CallCentryBeg, 0, Mode::Kernel, false, "CALL_CENTRY_BEG"),
        ];
        for &(id, target_ipl, required_cm, modifies_ipl, name) in defaults {
            self.register_vector(id, target_ipl, required_cm, modifies_ipl, name);
        }
        self.bind_pal_base(0);
    }

    pub fn register_vector(
        &mut self,
        id: PalVectorId,
        target_ipl: u8,
        required_cm: Mode,
        modifies_ipl: bool,
        name: &'static str,
    ) {
        let entry_pc = self.pal_base + ordinal(id) * VECTOR_STRIDE;
        self.descriptors.insert(
            id,
            VectorDescriptor {
                target_ipl,
                required_cm,
                modifies_ipl,
                name,
                entry_pc,
            },
        );
    }

    /// Recompute every registered vector's absolute entry PC against a new
    /// `PAL_BASE` (SWPPAL, boot).
    pub fn bind_pal_base(&mut self, pal_base: u64) {
        self.pal_base = pal_base;
        for (&id, desc) in self.descriptors.iter_mut() {
            desc.entry_pc = pal_base + ordinal(id) * VECTOR_STRIDE;
        }
    }

    pub fn lookup(&self, id: PalVectorId) -> Option<&VectorDescriptor> {
        self.descriptors.get(&id)
    }

    /// Absolute (non-canonicalized) entry PC for `id`, or `None` if the
    /// vector is unregistered — callers escalate to MachineCheck in that case
    /// (§4.2.2 step 1).
    pub fn entry_pc(&self, id: PalVectorId) -> Option<u64> {
        self.descriptors.get(&id).map(|d| d.entry_pc)
    }

    pub fn map_exception(&self, class: ExceptionClass) -> PalVectorId {
        map_class_to_pal_vector(class)
    }

    /// Entry PC for the specific CALL_PAL function table, offset from
    /// `CALL_CENTRY_BEG` by the function's own slot (§4.2.2: "the concrete
    /// entry PC is computed from the function code").
    pub fn call_entry_pc(&self, function_code: u32) -> Option<u64> {
        self.entry_pc(PalVectorId::CallCentryBeg)
            .map(|base| base + u64::from(function_code) * 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_pal_base_shifts_every_entry() {
        let mut table = PalVectorTable::new();
        let before = table.entry_pc(PalVectorId::ItbMiss).unwrap();
        table.bind_pal_base(0x1_0000);
        let after = table.entry_pc(PalVectorId::ItbMiss).unwrap();
        assert_eq!(after, before + 0x1_0000);
    }

    #[test]
    fn unregistered_vector_is_none() {
        let table = PalVectorTable::new();
        for id in [
            PalVectorId::Reset,
            PalVectorId::CallCentryBeg,
            PalVectorId::DtbMissDouble,
        ] {
            assert!(table.entry_pc(id).is_some());
        }
    }

    #[test]
    fn call_entry_offsets_by_function_code() {
        let table = PalVectorTable::new();
        let base = table.entry_pc(PalVectorId::CallCentryBeg).unwrap();
        assert_eq!(table.call_entry_pc(3).unwrap(), base + 24);
    }

    #[test]
    fn map_exception_matches_fault_module() {
        let table = PalVectorTable::new();
        assert_eq!(
            table.map_exception(ExceptionClass::ItbMiss),
            PalVectorId::ItbMiss
        );
    }
}

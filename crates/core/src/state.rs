//! Per-CPU architectural state: integer/FP registers, PS, IPRs, staged
//! ITB/DTB fill latches (§3 DATA MODEL).
//!
//! Design note (§9): the source models IPR access through raw `union`-like
//! substructure pointers (`x->`, `h->`, ...). Here every IPR is a named
//! field on `CpuState`, accessed directly; no pointer aliasing survives the
//! port.

use crate::error::TlbCommitError;
use crate::pte::{Mode, Pte, PteFlags, SizeClass};

/// Processor Status: current mode and interrupt priority level (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorStatus {
    pub mode: u8, // 0..=3, see pte::Mode
    pub ipl: u8,  // 0..=31
}

impl ProcessorStatus {
    pub fn to_bits(self) -> u64 {
        (self.mode as u64 & 0x3) | ((self.ipl as u64 & 0x1f) << 2)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            mode: (bits & 0x3) as u8,
            ipl: ((bits >> 2) & 0x1f) as u8,
        }
    }

    pub fn mode(self) -> Mode {
        Mode::from_bits(self.mode as u64)
    }
}

bitflags::bitflags! {
    /// Machine Check Error Summary bit layout (GLOSSARY: MCES). Bits 2:0 are
    /// write-1-to-clear status bits; bits 4:3 are plain read/write enables
    /// (§4.2.4 MTPR_MCES).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mces: u8 {
        const MIP = 1 << 0;
        const SCE = 1 << 1;
        const PCE = 1 << 2;
        const WRE = 1 << 3;
        const MME = 1 << 4;
    }
}

impl Mces {
    const W1C_MASK: u8 = 0b0000_0111;
    const DIRECT_MASK: u8 = 0b0001_1000;

    /// Apply an MTPR_MCES write: bits 2:0 clear the corresponding status bit
    /// when written as 1; bits 4:3 are written straight through.
    pub fn apply_write(&mut self, value: u8) {
        let clear = value & Self::W1C_MASK;
        let mut bits = self.bits() & !clear;
        bits = (bits & !Self::DIRECT_MASK) | (value & Self::DIRECT_MASK);
        *self = Mces::from_bits_truncate(bits);
    }
}

/// A 4-bit mask over the four processor modes (AST-enable / AST-summary,
/// §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeMask(pub u8);

impl ModeMask {
    pub fn get(self) -> u8 {
        self.0 & 0xF
    }

    /// ASTEN/ASTSR masked read-modify-write (§4.2.4, §8 property 10):
    /// `new = (old & keep) | set`, where R16 packs keep in bits[3:0] and set
    /// in bits[7:4]. Returns the prior value.
    pub fn masked_rmw(&mut self, r16: u64) -> u8 {
        let old = self.get();
        let keep = (r16 & 0xF) as u8;
        let set = ((r16 >> 4) & 0xF) as u8;
        self.0 = ((old & keep) | set) & 0xF;
        old
    }
}

/// Staged ITB/DTB fill latches (§3, §8 property 9). HW_MTPR writes the tag
/// and PTE halves independently; only a component that has written both may
/// commit them into the TLB via TB_FILL.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagedFill {
    tag: u64,
    pte_temp: u64,
    has_tag: bool,
    has_pte: bool,
}

impl StagedFill {
    pub fn write_tag(&mut self, tag: u64) {
        self.tag = tag;
        self.has_tag = true;
    }

    pub fn write_pte_temp(&mut self, pte_temp: u64) {
        self.pte_temp = pte_temp;
        self.has_pte = true;
    }

    pub fn clear(&mut self) {
        *self = StagedFill::default();
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Commit the staged halves into a `Pte`. Fails if either half is
    /// missing; does not clear the staging record (callers clear after a
    /// successful TLB insert so a retried write sequence must restage both
    /// halves).
    pub fn commit(&self) -> Result<Pte, TlbCommitError> {
        if !self.has_tag {
            return Err(TlbCommitError::MissingTag);
        }
        if !self.has_pte {
            return Err(TlbCommitError::MissingPte);
        }
        Ok(decode_pte_temp(self.pte_temp))
    }
}

/// Decode a raw PTE word as staged by HW_MTPR into our `Pte` model. The
/// layout mirrors `pte::PteFlags` bit-for-bit plus a PFN field starting at
/// bit 32 and a 2-bit size class at bits 9:8.
pub fn decode_pte_temp(word: u64) -> Pte {
    let flags = PteFlags::from_bits_truncate((word & 0x1ff) as u32);
    let size = match (word >> 8) & 0x3 {
        0 => SizeClass::Page8K,
        1 => SizeClass::Page64K,
        2 => SizeClass::Page512K,
        _ => SizeClass::Page4M,
    };
    Pte {
        flags,
        pfn: word >> 32,
        size,
    }
}

/// Full per-CPU architectural state (§3).
#[derive(Debug, Clone)]
pub struct CpuState {
    pub id: usize,

    int_regs: [u64; 32],
    fp_regs: [u64; 32],

    pub pc: u64,
    pub ps: ProcessorStatus,
    pub asn: u64,
    pub ptbr: u64,

    pub ksp: u64,
    pub esp: u64,
    pub ssp: u64,
    pub usp: u64,

    pub cc: u64,
    pub mces: Mces,
    pub sisr: u64,
    pub aster: ModeMask,
    pub astsr: ModeMask,
    pub unq: u64,
    pub pal_base: u64,
    pub vptb: u64,
    pub scbb: u64,
    pub pcbb: u64,

    pub ent_int: u64,
    pub ent_arith: u64,
    pub ent_mm: u64,
    pub ent_fault: u64,
    pub ent_una: u64,
    pub ent_sys: u64,

    pub fen: bool,
    pub halted: bool,
    pub idle: bool,

    pub itb: StagedFill,
    pub dtb: StagedFill,
}

impl CpuState {
    pub fn new(id: usize, pal_base: u64) -> Self {
        Self {
            id,
            int_regs: [0; 32],
            fp_regs: [0; 32],
            pc: pal_base | 1,
            ps: ProcessorStatus { mode: 0, ipl: 31 },
            asn: 0,
            ptbr: 0,
            ksp: 0,
            esp: 0,
            ssp: 0,
            usp: 0,
            cc: 0,
            mces: Mces::empty(),
            sisr: 0,
            aster: ModeMask::default(),
            astsr: ModeMask::default(),
            unq: 0,
            pal_base,
            vptb: 0,
            scbb: 0,
            pcbb: 0,
            ent_int: 0,
            ent_arith: 0,
            ent_mm: 0,
            ent_fault: 0,
            ent_una: 0,
            ent_sys: 0,
            fen: false,
            halted: false,
            idle: false,
            itb: StagedFill::default(),
            dtb: StagedFill::default(),
        }
    }

    /// R31 is architecturally wired to zero; never committed (§3 Invariant
    /// 1, §8 property 1).
    pub fn read_int(&self, reg: u8) -> u64 {
        if reg == 31 {
            0
        } else {
            self.int_regs[reg as usize]
        }
    }

    pub fn write_int(&mut self, reg: u8, value: u64) {
        if reg != 31 {
            self.int_regs[reg as usize] = value;
        }
    }

    /// F31 is likewise hardwired to zero on Alpha.
    pub fn read_fp(&self, reg: u8) -> u64 {
        if reg == 31 {
            0
        } else {
            self.fp_regs[reg as usize]
        }
    }

    pub fn write_fp(&mut self, reg: u8, value: u64) {
        if reg != 31 {
            self.fp_regs[reg as usize] = value;
        }
    }

    /// PAL mode is defined entirely by PC bit 0 (§3 Invariant 2, §8
    /// property 2): there is no separate flag to drift out of sync.
    pub fn is_in_pal_mode(&self) -> bool {
        (self.pc & 1) != 0
    }

    pub fn stack_pointer(&self, mode: Mode) -> u64 {
        match mode {
            Mode::Kernel => self.ksp,
            Mode::Executive => self.esp,
            Mode::Supervisor => self.ssp,
            Mode::User => self.usp,
        }
    }

    pub fn set_stack_pointer(&mut self, mode: Mode, value: u64) {
        match mode {
            Mode::Kernel => self.ksp = value,
            Mode::Executive => self.esp = value,
            Mode::Supervisor => self.ssp = value,
            Mode::User => self.usp = value,
        }
    }

    /// Clear staged ITB/DTB latches; called whenever the TLB is flushed or
    /// a fill commits (§3 Invariants).
    pub fn clear_staged_fills(&mut self) {
        self.itb.clear();
        self.dtb.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r31_reads_zero_and_discards_writes() {
        let mut cpu = CpuState::new(0, 0x8000);
        cpu.write_int(31, 0xdead_beef);
        assert_eq!(cpu.read_int(31), 0);
    }

    #[test]
    fn pal_mode_tracks_pc_bit_zero() {
        let mut cpu = CpuState::new(0, 0x8000);
        assert!(cpu.is_in_pal_mode());
        cpu.pc &= !1;
        assert!(!cpu.is_in_pal_mode());
    }

    #[test]
    fn mces_write_clears_status_and_writes_mask_bits() {
        let mut mces = Mces::MIP | Mces::SCE | Mces::MME;
        // value: clear MIP (bit0) only, set WRE (bit3)
        mces.apply_write(0b0000_1001);
        assert!(!mces.contains(Mces::MIP));
        assert!(mces.contains(Mces::SCE));
        assert!(mces.contains(Mces::WRE));
        assert!(mces.contains(Mces::MME));
    }

    #[test]
    fn asten_masked_rmw_matches_scenario_e() {
        let mut aster = ModeMask(0b1010);
        let old = aster.masked_rmw(0x35);
        assert_eq!(old, 0b1010);
        assert_eq!(aster.get(), 0b0011);
    }

    #[test]
    fn staged_fill_requires_both_halves() {
        let mut fill = StagedFill::default();
        assert_eq!(fill.commit().unwrap_err(), crate::error::TlbCommitError::MissingTag);
        fill.write_tag(0x1000);
        assert_eq!(fill.commit().unwrap_err(), crate::error::TlbCommitError::MissingPte);
        fill.write_pte_temp(1 | (5u64 << 32));
        let pte = fill.commit().unwrap();
        assert!(pte.is_valid());
        assert_eq!(pte.pfn, 5);
    }
}

#[cfg(all(test, feature = "property-tests"))]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// §8 property 10, quantified over every (old, r16) pair rather than
        /// the single literal case in `asten_masked_rmw_matches_scenario_e`:
        /// the written nibble always lands exactly as `(old & keep) | set`,
        /// and the call always hands back the value that was in place
        /// before the write.
        #[test]
        fn asten_masked_rmw_matches_keep_set_formula(old in 0u8..16, r16 in any::<u64>()) {
            let mut mask = ModeMask(old);
            let keep = (r16 & 0xF) as u8;
            let set = ((r16 >> 4) & 0xF) as u8;

            let prior = mask.masked_rmw(r16);

            prop_assert_eq!(prior, old & 0xF);
            prop_assert_eq!(mask.get(), (old & keep) | set);
        }
    }
}

//! VA→PA translation and fault classification (§4.3).
//!
//! Alpha fills its TLB in software: a miss here does not walk guest page
//! tables itself, it reports the miss so PAL can do so (via HW_MTPR staging
//! + TB_FILL, see `state::StagedFill` and `pal::call::tb_fill`).

use crate::pte::{AccessKind, Mode, Pte};
use crate::tlb::{Realm, TlbShard};

/// KSEG: Alpha's directly-mapped segment, VA bits <41:40> == 0b10 in the
/// common 43-bit superpage layout. Bypasses translation entirely (§4.3).
const KSEG_SELECT_MASK: u64 = 0b11 << 40;
const KSEG_SELECT_VALUE: u64 = 0b10 << 40;

pub fn is_kseg(va: u64) -> bool {
    (va & KSEG_SELECT_MASK) == KSEG_SELECT_VALUE
}

/// The fault a translation produced, tagged with the realm it was attempted
/// in so the caller can pick the right `ExceptionClass` (§4.6: ITB faults
/// are Miss/IACCVIO; DTB faults are Miss/DFAULT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationFaultKind {
    Miss,
    InvalidPte,
    FaultOnRead,
    FaultOnWrite,
    FaultOnExecute,
    AccessViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationFault {
    pub kind: TranslationFaultKind,
    pub realm: Realm,
    pub va: u64,
}

/// Physical address plus the PTE that produced it, returned on a
/// successful translation.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub pa: u64,
    pub pte: Pte,
}

/// Resolve `va` for `kind`/`mode` against the per-CPU TLB `shard`.
///
/// `physical_mode` models `va_ctl<1> == 0`: when set, any VA whose upper
/// bits match the platform's mid-range physical window also bypasses
/// translation (§4.3). KSEG always bypasses regardless of `physical_mode`.
pub fn translate(
    shard: &TlbShard,
    realm: Realm,
    va: u64,
    kind: AccessKind,
    mode: Mode,
    asn: u64,
    physical_mode: bool,
) -> Result<Translation, TranslationFault> {
    if is_kseg(va) || physical_mode {
        return Ok(Translation {
            pa: va & 0x0000_3fff_ffff_ffff,
            pte: Pte {
                flags: crate::pte::PteFlags::VALID
                    | crate::pte::PteFlags::KRE
                    | crate::pte::PteFlags::KWE,
                pfn: 0,
                size: crate::pte::SizeClass::Page8K,
            },
        });
    }

    let pte = shard.lookup(realm, va, asn).ok_or(TranslationFault {
        kind: TranslationFaultKind::Miss,
        realm,
        va,
    })?;

    if !pte.is_valid() {
        return Err(TranslationFault {
            kind: TranslationFaultKind::InvalidPte,
            realm,
            va,
        });
    }

    let perm = pte.perm_mask(mode);
    let allowed = match kind {
        AccessKind::Read => perm.readable,
        AccessKind::Write => perm.writable,
        AccessKind::Execute => perm.executable,
    };
    if !allowed {
        let fault_kind = match kind {
            AccessKind::Read => TranslationFaultKind::FaultOnRead,
            AccessKind::Write => TranslationFaultKind::FaultOnWrite,
            AccessKind::Execute => TranslationFaultKind::FaultOnExecute,
        };
        return Err(TranslationFault {
            kind: fault_kind,
            realm,
            va,
        });
    }

    let page_offset = va & crate::tlb::PAGE_MASK;
    let pa = (pte.pfn << crate::tlb::PAGE_SHIFT) | page_offset;
    Ok(Translation { pa, pte })
}

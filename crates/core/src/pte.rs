//! Page table entry layout and the derived permission mask used by probes
//! (§3 DATA MODEL: PTE).

use bitflags::bitflags;

bitflags! {
    /// Bit layout of a 64-bit Alpha PTE, modeled the way the teacher models
    /// page-table bits as a `bitflags` set (c.f. `mm::pagetable`) rather than
    /// raw shifts scattered through call sites.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const VALID = 1 << 0;
        const KRE   = 1 << 1;
        const URE   = 1 << 2;
        const KWE   = 1 << 3;
        const UWE   = 1 << 4;
        const FOR_  = 1 << 5; // fault-on-read
        const FOW   = 1 << 6; // fault-on-write
        const FOE   = 1 << 7; // fault-on-execute
        const ASM   = 1 << 8; // address-space-match (global)
    }
}

/// Page-size class; larger classes cover `8KiB << (3*class)` bytes, matching
/// Alpha's granularity hint encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeClass {
    #[default]
    Page8K = 0,
    Page64K = 1,
    Page512K = 2,
    Page4M = 3,
}

impl SizeClass {
    pub fn span_bytes(self) -> u64 {
        8 * 1024 * (1u64 << (3 * self as u64))
    }
}

/// The access kind requested of a translation (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Current processor mode, encoded in PS (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    Kernel = 0,
    Executive = 1,
    Supervisor = 2,
    User = 3,
}

impl Mode {
    pub fn from_bits(bits: u64) -> Mode {
        match bits & 0x3 {
            0 => Mode::Kernel,
            1 => Mode::Executive,
            2 => Mode::Supervisor,
            _ => Mode::User,
        }
    }

    pub fn is_privileged(self) -> bool {
        matches!(self, Mode::Kernel)
    }
}

/// A page table entry as staged/committed into the TLB (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub flags: PteFlags,
    pub pfn: u64,
    pub size: SizeClass,
}

/// The subset of `PteFlags` that governs a particular access kind in a
/// particular mode, used by PROBER/PROBEW and by the translator's
/// permission check (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermMask {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl Pte {
    pub fn is_valid(&self) -> bool {
        self.flags.contains(PteFlags::VALID)
    }

    pub fn is_global(&self) -> bool {
        self.flags.contains(PteFlags::ASM)
    }

    /// Derive the permission mask observable by a given mode, per §4.3:
    /// "enforce (K|U)RE/(K|U)WE and FOR/FOW/FOE; execute maps to read."
    pub fn perm_mask(&self, mode: Mode) -> PermMask {
        let privileged = mode.is_privileged() || mode == Mode::Executive || mode == Mode::Supervisor;
        let re = if privileged {
            self.flags.contains(PteFlags::KRE)
        } else {
            self.flags.contains(PteFlags::URE)
        };
        let we = if privileged {
            self.flags.contains(PteFlags::KWE)
        } else {
            self.flags.contains(PteFlags::UWE)
        };
        PermMask {
            readable: re && !self.flags.contains(PteFlags::FOR_),
            writable: we && !self.flags.contains(PteFlags::FOW),
            // Execute maps to read permission, gated additionally by FOE.
            executable: re && !self.flags.contains(PteFlags::FOE),
        }
    }

    /// Whether `kind` is permitted for `mode` under this PTE.
    pub fn allows(&self, kind: AccessKind, mode: Mode) -> bool {
        let perm = self.perm_mask(mode);
        match kind {
            AccessKind::Read => perm.readable,
            AccessKind::Write => perm.writable,
            AccessKind::Execute => perm.executable,
        }
    }
}

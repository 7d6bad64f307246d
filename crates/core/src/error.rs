//! Shared status and error vocabulary.
//!
//! The architectural control flow of this crate never uses `Result` for
//! faults — every architectural failure is surfaced as a [`crate::fault::PendingEvent`]
//! or a status word in R0, per spec §7. The types here exist only at the
//! *peripheral* trait boundaries (guest memory, staged-IPR commit) where a
//! real Rust error is the idiomatic shape.

use thiserror::Error;

/// Failure returned by a [`crate::guest_memory::GuestMemory`] access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("physical address {0:#x} is out of range")]
    OutOfRange(u64),
    #[error("unaligned access at {0:#x} for width {1}")]
    Misaligned(u64, u8),
    #[error("uncorrectable memory error (IO bus error) at {0:#x}")]
    IoBusError(u64),
}

/// Failure returned when committing staged ITB/DTB fill latches (§3 Invariants,
/// §8 property 9: commit fails unless both tag and PTE halves have been written).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlbCommitError {
    #[error("TB_FILL commit attempted with no staged tag half")]
    MissingTag,
    #[error("TB_FILL commit attempted with no staged PTE half")]
    MissingPte,
}

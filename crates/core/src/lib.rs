//! Architectural core of an Alpha AXP 21264 (EV6) emulator: the memory
//! pipeline (MBox), the PAL service layer, per-CPU TLBs, and the SMP
//! coordination primitives (reservations, memory barriers, IPIs) that tie
//! multiple emulated CPUs together.
//!
//! This crate models privileged architectural behavior only. It has no
//! opinion on instruction decode, guest-memory backing, or how a driver
//! schedules CPUs across threads — those are peripheral concerns a host
//! wires in through the trait boundaries in [`guest_memory`] and
//! [`console`], and through [`system::System`] as the composition root.

pub mod barrier;
pub mod console;
pub mod error;
pub mod fault;
pub mod guest_memory;
pub mod ipi;
pub mod mbox;
pub mod pal;
pub mod pte;
pub mod reservation;
pub mod state;
pub mod system;
pub mod tlb;
pub mod translator;

pub use error::{MemoryError, TlbCommitError};
pub use fault::{ExceptionClass, FaultDispatcher, PalVectorId, PendingEvent};
pub use mbox::MBox;
pub use state::CpuState;
pub use system::System;

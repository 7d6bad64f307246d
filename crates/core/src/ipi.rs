//! Inter-processor interrupts (§5; CALL_PAL MTPR_IPIR/WRIPIR; TLB
//! shootdown broadcasts in §4.3).
//!
//! Grounded on the teacher's `smp::ipi` module: per-target delivery,
//! per-target statistics, a broadcast-to-all-but-self helper. The teacher
//! sends a real SGI over a GIC system register; here "sending" means
//! pushing onto the target's bounded queue, consumed at that CPU's next
//! recognition point (§5: "`postIPI(target, data)` is lock-free w.r.t. the
//! target").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::tlb::Realm;

/// IPI payload. TLB shootdown variants carry the VA (bit 0 tags realm pairs
/// elsewhere; here realm is explicit) and ASN needed to replay the
/// invalidation locally; `Custom` carries an opaque interrupt vector for
/// general cross-CPU notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiCommand {
    TlbInvalidateVa { realm: Realm, va: u64, asn: u64 },
    TlbInvalidateAsn { asn: u64 },
    TlbInvalidateAll,
    /// Wake-up sent by the barrier initiator (§4.5); the recognizing CPU
    /// answers with `MemoryBarrierCoordinator::acknowledge_memory_barrier`.
    MemoryBarrierRequest,
    Custom(u32),
}

#[derive(Default)]
struct IpiStats {
    tlb_invalidate: AtomicU64,
    memory_barrier: AtomicU64,
    custom: AtomicU64,
}

impl IpiStats {
    fn record(&self, cmd: IpiCommand) {
        match cmd {
            IpiCommand::Custom(_) => self.custom.fetch_add(1, Ordering::Relaxed),
            IpiCommand::MemoryBarrierRequest => self.memory_barrier.fetch_add(1, Ordering::Relaxed),
            _ => self.tlb_invalidate.fetch_add(1, Ordering::Relaxed),
        };
    }
}

const QUEUE_CAPACITY: usize = 256;

/// Bounded per-CPU IPI queues plus delivery statistics (§5).
pub struct IpiManager {
    queues: Vec<Mutex<VecDeque<IpiCommand>>>,
    stats: Vec<IpiStats>,
}

impl IpiManager {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            queues: (0..cpu_count).map(|_| Mutex::new(VecDeque::new())).collect(),
            stats: (0..cpu_count).map(|_| IpiStats::default()).collect(),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.queues.len()
    }

    /// Post an IPI to `target`. Drops the oldest entry if the target's
    /// queue is saturated rather than blocking the sender (§5: suspension
    /// points are limited to barrier-wait and blocking console reads).
    pub fn post_ipi(&self, target: usize, cmd: IpiCommand) {
        let mut q = self.queues[target].lock().unwrap();
        if q.len() >= QUEUE_CAPACITY {
            q.pop_front();
        }
        q.push_back(cmd);
        self.stats[target].record(cmd);
    }

    /// Broadcast to every CPU except `sender` (MTPR_IPIR / TBIS shootdown).
    pub fn post_ipi_all_but_self(&self, sender: usize, cmd: IpiCommand) {
        for target in 0..self.queues.len() {
            if target != sender {
                self.post_ipi(target, cmd);
            }
        }
    }

    /// Drain every pending IPI addressed to `cpu`, in FIFO order, for the
    /// caller to apply at its next recognition point.
    pub fn drain(&self, cpu: usize) -> Vec<IpiCommand> {
        let mut q = self.queues[cpu].lock().unwrap();
        q.drain(..).collect()
    }

    pub fn pending_count(&self, cpu: usize) -> usize {
        self.queues[cpu].lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_drain_preserves_fifo_order() {
        let mgr = IpiManager::new(2);
        mgr.post_ipi(1, IpiCommand::TlbInvalidateAsn { asn: 1 });
        mgr.post_ipi(1, IpiCommand::TlbInvalidateAsn { asn: 2 });
        let drained = mgr.drain(1);
        assert_eq!(
            drained,
            vec![
                IpiCommand::TlbInvalidateAsn { asn: 1 },
                IpiCommand::TlbInvalidateAsn { asn: 2 },
            ]
        );
        assert!(mgr.drain(1).is_empty());
    }

    #[test]
    fn broadcast_skips_sender() {
        let mgr = IpiManager::new(3);
        mgr.post_ipi_all_but_self(0, IpiCommand::TlbInvalidateAll);
        assert_eq!(mgr.pending_count(0), 0);
        assert_eq!(mgr.pending_count(1), 1);
        assert_eq!(mgr.pending_count(2), 1);
    }
}

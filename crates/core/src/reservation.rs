//! Per-CPU LL/SC reservations, cache-line-granular invalidation (§4.4).

use std::sync::Mutex;

/// Cache line size backing reservation granularity (§3 Invariants, §4.4,
/// §8 property 6). 64 bytes matches the EV6 D-cache line.
pub const CACHE_LINE_SIZE: u64 = 64;
pub const CACHE_LINE_MASK: u64 = !(CACHE_LINE_SIZE - 1);

#[derive(Debug, Clone, Copy)]
struct Slot {
    line: Option<u64>,
    generation: u64,
}

/// Holds at most one reservation per CPU. Shared across CPUs, internally
/// synchronized (§5: "ReservationManager is shared across CPUs").
pub struct ReservationManager {
    slots: Vec<Mutex<Slot>>,
}

impl ReservationManager {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            slots: (0..cpu_count)
                .map(|_| {
                    Mutex::new(Slot {
                        line: None,
                        generation: 0,
                    })
                })
                .collect(),
        }
    }

    /// LDx_L: stash the cache line covering `pa`.
    pub fn set_reservation(&self, cpu: usize, pa: u64) {
        let mut slot = self.slots[cpu].lock().unwrap();
        slot.line = Some(pa & CACHE_LINE_MASK);
        slot.generation += 1;
    }

    /// STx_C: atomically validate the line is still reserved and clear the
    /// slot, regardless of the outcome (§3 Invariants: STx_C succeeds iff
    /// the reservation is still valid; either way it is consumed).
    pub fn check_and_clear_reservation(&self, cpu: usize, pa: u64) -> bool {
        let mut slot = self.slots[cpu].lock().unwrap();
        let hit = slot.line == Some(pa & CACHE_LINE_MASK);
        slot.line = None;
        hit
    }

    /// Clear any CPU's reservation whose line covers `pa` (§8 property 6:
    /// `(p ^ r) < CACHE_LINE_SIZE` — equivalent to comparing masked lines).
    pub fn break_reservations_on_cache_line(&self, pa: u64) {
        let line = pa & CACHE_LINE_MASK;
        for (cpu, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock().unwrap();
            if slot.line == Some(line) {
                log::trace!("breaking reservation held by cpu {cpu} on line {line:#x}");
                slot.line = None;
                slot.generation += 1;
            }
        }
    }

    /// Convenience alias used by MBox/PAL call sites (§4.4).
    pub fn break_reservation(&self, pa: u64) {
        self.break_reservations_on_cache_line(pa);
    }

    pub fn has_reservation(&self, cpu: usize) -> bool {
        self.slots[cpu].lock().unwrap().line.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ll_sc_succeeds_with_no_intervening_write() {
        let mgr = ReservationManager::new(2);
        mgr.set_reservation(0, 0x1000);
        assert!(mgr.check_and_clear_reservation(0, 0x1000));
    }

    #[test]
    fn sc_fails_after_peer_breaks_same_line() {
        let mgr = ReservationManager::new(2);
        mgr.set_reservation(0, 0x1000);
        mgr.break_reservations_on_cache_line(0x1000 + 8); // same 64B line
        assert!(!mgr.check_and_clear_reservation(0, 0x1000));
    }

    #[test]
    fn sc_consumes_reservation_even_on_failure() {
        let mgr = ReservationManager::new(1);
        assert!(!mgr.check_and_clear_reservation(0, 0x2000));
        mgr.set_reservation(0, 0x2000);
        assert!(mgr.check_and_clear_reservation(0, 0x2000));
        assert!(!mgr.check_and_clear_reservation(0, 0x2000));
    }

    #[test]
    fn break_only_affects_covering_line() {
        let mgr = ReservationManager::new(1);
        mgr.set_reservation(0, 0x1000);
        mgr.break_reservations_on_cache_line(0x2000);
        assert!(mgr.check_and_clear_reservation(0, 0x1000));
    }
}

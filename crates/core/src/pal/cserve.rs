//! CSERVE console-service sub-dispatch (§4.2.5).
//!
//! A single CALL_PAL function multiplexed by a selector in R16[7:0], with
//! R17/R18/R19 as auxiliary arguments. Buffers are assumed not to cross a
//! page boundary — this core translates each buffer's starting VA once and
//! walks the resulting PA range directly, rather than re-translating per
//! page, since CSERVE buffers in practice are console-line sized and well
//! under 8 KiB.

use crate::console::{ConsoleDevice, EnvStore};
use crate::fault::{FaultDispatcher, PendingEvent};
use crate::guest_memory::GuestMemory;
use crate::pte::{AccessKind, Mode};
use crate::tlb::{Realm, TlbShard};
use crate::translator;

const MAX_STRING_LEN: usize = 256;

pub struct CserveContext<'a> {
    pub mem: &'a dyn GuestMemory,
    pub console: &'a dyn ConsoleDevice,
    pub env: &'a dyn EnvStore,
    pub tlb: &'a TlbShard,
    pub dispatcher: &'a FaultDispatcher,
    pub asn: u64,
    pub mode: Mode,
    pub physical_mode: bool,
    pub fault_pc: u64,
}

/// Result of a CSERVE call: either a normal return (R0, optional R1) or a
/// translation fault that was staged on the dispatcher — the PAL call does
/// not return in that case (§4.2.5: "the call does not return; the pending
/// fault is delivered through the pipeline").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CserveOutcome {
    Value { r0: u64, r1: Option<u64> },
    Faulted,
}

impl CserveOutcome {
    fn ok(r0: u64) -> Self {
        CserveOutcome::Value { r0, r1: None }
    }
}

fn translate_or_fault(ctx: &CserveContext, va: u64, kind: AccessKind) -> Result<u64, ()> {
    match translator::translate(ctx.tlb, Realm::Data, va, kind, ctx.mode, ctx.asn, ctx.physical_mode) {
        Ok(t) => Ok(t.pa),
        Err(fault) => {
            ctx.dispatcher
                .raise_fault(PendingEvent::translation_fault(fault, ctx.fault_pc, ctx.asn, ctx.mode));
            Err(())
        }
    }
}

fn read_c_string(ctx: &CserveContext, va: u64) -> Result<Option<String>, ()> {
    let pa = translate_or_fault(ctx, va, AccessKind::Read)?;
    let mut bytes = Vec::new();
    for i in 0..MAX_STRING_LEN as u64 {
        match ctx.mem.read8(pa + i) {
            Ok(0) => break,
            Ok(b) => bytes.push(b),
            Err(_) => return Ok(None),
        }
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

pub fn dispatch(ctx: &CserveContext, selector: u32, r17: u64, r18: u64, r19: u64) -> CserveOutcome {
    match selector {
        0x01 => {
            let timeout_ms = r17 as u32;
            let c = ctx.console.get_char(timeout_ms != 0, timeout_ms);
            CserveOutcome::ok(c as i64 as u64)
        }
        0x02 => {
            ctx.console.put_char(r17 as u8);
            CserveOutcome::ok(0)
        }
        0x03 => CserveOutcome::ok(if ctx.console.has_input() { 1 } else { 0 }),
        0x07 => CserveOutcome::ok(0),
        0x09 => {
            let pa = match translate_or_fault(ctx, r17, AccessKind::Read) {
                Ok(pa) => pa,
                Err(()) => return CserveOutcome::Faulted,
            };
            let len = r18 as usize;
            let mut buf = vec![0u8; len];
            if ctx.mem.read_bytes(pa, &mut buf).is_err() {
                return CserveOutcome::ok((-1i64) as u64);
            }
            CserveOutcome::ok(ctx.console.put_string(&buf) as u64)
        }
        0x0C => {
            let pa = match translate_or_fault(ctx, r17, AccessKind::Write) {
                Ok(pa) => pa,
                Err(()) => return CserveOutcome::Faulted,
            };
            let max_len = r18 as usize;
            let echo = (r19 & 0x1) != 0;
            let null_terminate = (r19 & 0x2) != 0;
            let data = ctx.console.get_string(max_len, echo);
            if ctx.mem.write_bytes(pa, &data).is_err() {
                return CserveOutcome::ok((-1i64) as u64);
            }
            if null_terminate {
                let _ = ctx.mem.write8(pa + data.len() as u64, 0);
            }
            CserveOutcome::ok(data.len() as u64)
        }
        0x10 => {
            let kind = match r18 {
                0 => AccessKind::Read,
                1 => AccessKind::Write,
                _ => AccessKind::Execute,
            };
            match translator::translate(ctx.tlb, Realm::Data, r17, kind, ctx.mode, ctx.asn, ctx.physical_mode) {
                Ok(t) => CserveOutcome::ok(t.pa),
                Err(_) => CserveOutcome::ok(1u64 << 63),
            }
        }
        0x20 => {
            let name = match read_c_string(ctx, r17) {
                Ok(Some(n)) => n,
                Ok(None) => return CserveOutcome::ok((-1i64) as u64),
                Err(()) => return CserveOutcome::Faulted,
            };
            let value = match ctx.env.get(&name) {
                Some(v) => v,
                None => return CserveOutcome::ok((-1i64) as u64),
            };
            let capacity = r19 as usize;
            if value.len() > capacity {
                return CserveOutcome::ok((-2i64) as u64);
            }
            let pa = match translate_or_fault(ctx, r18, AccessKind::Write) {
                Ok(pa) => pa,
                Err(()) => return CserveOutcome::Faulted,
            };
            if ctx.mem.write_bytes(pa, value.as_bytes()).is_err() {
                return CserveOutcome::ok((-1i64) as u64);
            }
            CserveOutcome::ok(value.len() as u64)
        }
        0x21 => {
            let name = match read_c_string(ctx, r17) {
                Ok(Some(n)) => n,
                Ok(None) => return CserveOutcome::ok((-1i64) as u64),
                Err(()) => return CserveOutcome::Faulted,
            };
            let value = match read_c_string(ctx, r18) {
                Ok(Some(v)) => v,
                Ok(None) => return CserveOutcome::ok((-1i64) as u64),
                Err(()) => return CserveOutcome::Faulted,
            };
            ctx.env.set(&name, &value);
            CserveOutcome::ok(0)
        }
        0x22 => {
            ctx.env.save();
            CserveOutcome::ok(0)
        }
        0x23 => {
            ctx.env.clear();
            CserveOutcome::ok(0)
        }
        0x30 => {
            let pa = match translate_or_fault(ctx, r17, AccessKind::Write) {
                Ok(pa) => pa,
                Err(()) => return CserveOutcome::Faulted,
            };
            let seconds = ctx.env.get_adjusted_time();
            if ctx.mem.write64(pa, seconds as u64).is_err() || ctx.mem.write64(pa + 8, 0).is_err() {
                return CserveOutcome::ok((-1i64) as u64);
            }
            CserveOutcome::ok(0)
        }
        0x31 => {
            let pa = match translate_or_fault(ctx, r17, AccessKind::Read) {
                Ok(pa) => pa,
                Err(()) => return CserveOutcome::Faulted,
            };
            match ctx.mem.read64(pa) {
                Ok(offset) => {
                    ctx.env.set_time_offset(offset as i64);
                    CserveOutcome::ok(0)
                }
                Err(_) => CserveOutcome::ok((-1i64) as u64),
            }
        }
        0x32 => CserveOutcome::ok(ctx.env.get_time_offset() as u64),
        other => {
            log::warn!("unknown CSERVE selector {other:#x}");
            CserveOutcome::ok((-1i64) as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{MemoryConsole, MemoryEnvStore};
    use crate::fault::FaultDispatcher;
    use crate::guest_memory::FlatGuestMemory;

    fn ctx<'a>(
        mem: &'a FlatGuestMemory,
        console: &'a MemoryConsole,
        env: &'a MemoryEnvStore,
        tlb: &'a TlbShard,
        dispatcher: &'a FaultDispatcher,
    ) -> CserveContext<'a> {
        CserveContext {
            mem,
            console,
            env,
            tlb,
            dispatcher,
            asn: 0,
            mode: Mode::Kernel,
            physical_mode: true,
            fault_pc: 0x9000,
        }
    }

    #[test]
    fn putc_and_poll() {
        let mem = FlatGuestMemory::new(4096);
        let console = MemoryConsole::new();
        let env = MemoryEnvStore::new();
        let tlb = TlbShard::new();
        let dispatcher = FaultDispatcher::new();
        let c = ctx(&mem, &console, &env, &tlb, &dispatcher);

        assert_eq!(dispatch(&c, 0x02, b'A' as u64, 0, 0), CserveOutcome::ok(0));
        assert_eq!(console.take_output(), b"A");
        assert_eq!(dispatch(&c, 0x03, 0, 0, 0), CserveOutcome::ok(0));
    }

    #[test]
    fn puts_reads_guest_buffer_into_console() {
        let mem = FlatGuestMemory::new(4096);
        mem.seed(0x1000, b"hello");
        let console = MemoryConsole::new();
        let env = MemoryEnvStore::new();
        let tlb = TlbShard::new();
        let dispatcher = FaultDispatcher::new();
        let c = ctx(&mem, &console, &env, &tlb, &dispatcher);

        let outcome = dispatch(&c, 0x09, 0x1000, 5, 0);
        assert_eq!(outcome, CserveOutcome::ok(5));
        assert_eq!(console.take_output(), b"hello");
    }

    #[test]
    fn set_and_get_env_round_trip() {
        let mem = FlatGuestMemory::new(4096);
        mem.seed(0x1000, b"BOOT_FLAGS\0");
        mem.seed(0x1100, b"a\0");
        let console = MemoryConsole::new();
        let env = MemoryEnvStore::new();
        let tlb = TlbShard::new();
        let dispatcher = FaultDispatcher::new();
        let c = ctx(&mem, &console, &env, &tlb, &dispatcher);

        assert_eq!(dispatch(&c, 0x21, 0x1000, 0x1100, 0), CserveOutcome::ok(0));

        let outcome = dispatch(&c, 0x20, 0x1000, 0x1200, 16);
        assert_eq!(outcome, CserveOutcome::ok(1));
        let mut buf = [0u8; 1];
        mem.read_bytes(0x1200, &mut buf).unwrap();
        assert_eq!(&buf, b"a");
    }

    #[test]
    fn get_env_missing_returns_negative_one() {
        let mem = FlatGuestMemory::new(4096);
        mem.seed(0x1000, b"NOPE\0");
        let console = MemoryConsole::new();
        let env = MemoryEnvStore::new();
        let tlb = TlbShard::new();
        let dispatcher = FaultDispatcher::new();
        let c = ctx(&mem, &console, &env, &tlb, &dispatcher);

        let outcome = dispatch(&c, 0x20, 0x1000, 0x1200, 16);
        assert_eq!(outcome, CserveOutcome::ok((-1i64) as u64));
    }

    #[test]
    fn unknown_selector_returns_negative_one() {
        let mem = FlatGuestMemory::new(4096);
        let console = MemoryConsole::new();
        let env = MemoryEnvStore::new();
        let tlb = TlbShard::new();
        let dispatcher = FaultDispatcher::new();
        let c = ctx(&mem, &console, &env, &tlb, &dispatcher);
        assert_eq!(dispatch(&c, 0xFF, 0, 0, 0), CserveOutcome::ok((-1i64) as u64));
    }

    #[test]
    fn translate_selector_reports_fault_as_sentinel_not_escalation() {
        let mem = FlatGuestMemory::new(4096);
        let console = MemoryConsole::new();
        let env = MemoryEnvStore::new();
        let tlb = TlbShard::new();
        let dispatcher = FaultDispatcher::new();
        let c = CserveContext {
            physical_mode: false,
            ..ctx(&mem, &console, &env, &tlb, &dispatcher)
        };
        let outcome = dispatch(&c, 0x10, 0x1_0000_0000, 0, 0);
        assert_eq!(outcome, CserveOutcome::ok(1u64 << 63));
        assert!(!dispatcher.has_immediate_fault());
    }
}

//! Console device and environment-store contracts consumed by CSERVE (§6).
//!
//! Console and environment persistence are peripheral collaborators (§1);
//! this module defines the interface boundary plus small in-memory
//! implementations good enough to exercise `pal::cserve` in this crate's
//! own tests.

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-OPA console device contract (§6).
pub trait ConsoleDevice: Send + Sync {
    /// Read one character. `timeout_ms == 0` means poll (non-blocking);
    /// `timeout_ms == u32::MAX` means block indefinitely.
    fn get_char(&self, blocking: bool, timeout_ms: u32) -> i32;
    fn put_char(&self, c: u8);
    fn put_string(&self, data: &[u8]) -> usize;
    fn get_string(&self, max_len: usize, echo: bool) -> Vec<u8>;
    fn has_input(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn reset(&self);
}

/// An in-memory console backed by a preloaded input queue and an output
/// buffer, used for tests and as a default until a real console is wired in.
#[derive(Default)]
pub struct MemoryConsole {
    inner: Mutex<MemoryConsoleState>,
}

#[derive(Default)]
struct MemoryConsoleState {
    input: std::collections::VecDeque<u8>,
    output: Vec<u8>,
    connected: bool,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryConsoleState {
                input: Default::default(),
                output: Vec::new(),
                connected: true,
            }),
        }
    }

    pub fn push_input(&self, data: &[u8]) {
        self.inner.lock().unwrap().input.extend(data.iter().copied());
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().output)
    }
}

impl ConsoleDevice for MemoryConsole {
    fn get_char(&self, _blocking: bool, _timeout_ms: u32) -> i32 {
        let mut state = self.inner.lock().unwrap();
        match state.input.pop_front() {
            Some(b) => b as i32,
            None => -1,
        }
    }

    fn put_char(&self, c: u8) {
        self.inner.lock().unwrap().output.push(c);
    }

    fn put_string(&self, data: &[u8]) -> usize {
        self.inner.lock().unwrap().output.extend_from_slice(data);
        data.len()
    }

    fn get_string(&self, max_len: usize, echo: bool) -> Vec<u8> {
        let mut state = self.inner.lock().unwrap();
        let mut out = Vec::new();
        while out.len() < max_len {
            match state.input.pop_front() {
                Some(b) => {
                    if echo {
                        state.output.push(b);
                    }
                    if b == b'\n' {
                        break;
                    }
                    out.push(b);
                }
                None => break,
            }
        }
        out
    }

    fn has_input(&self) -> bool {
        !self.inner.lock().unwrap().input.is_empty()
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn reset(&self) {
        let mut state = self.inner.lock().unwrap();
        state.input.clear();
        state.output.clear();
    }
}

/// SRM-style environment variable store contract (§6, CSERVE 0x20-0x23).
pub trait EnvStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str);
    fn exists(&self, name: &str) -> bool;
    fn clear(&self);
    /// Persist to whatever backing medium the embedder chose; this core
    /// does not define a file format (§6), so the default implementation
    /// is a no-op.
    fn save(&self);
    fn get_adjusted_time(&self) -> i64;
    fn get_time_offset(&self) -> i64;
    fn set_time_offset(&self, seconds: i64);
}

/// In-memory environment store, guarded per §5's "environment store is
/// shared and guarded" requirement.
pub struct MemoryEnvStore {
    vars: Mutex<HashMap<String, String>>,
    time_offset: std::sync::atomic::AtomicI64,
}

impl Default for MemoryEnvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnvStore {
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
            time_offset: std::sync::atomic::AtomicI64::new(0),
        }
    }
}

impl EnvStore for MemoryEnvStore {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.lock().unwrap().get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) {
        self.vars
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    fn exists(&self, name: &str) -> bool {
        self.vars.lock().unwrap().contains_key(name)
    }

    fn clear(&self) {
        self.vars.lock().unwrap().clear();
    }

    fn save(&self) {}

    fn get_adjusted_time(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        now + self.time_offset.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn get_time_offset(&self) -> i64 {
        self.time_offset.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn set_time_offset(&self, seconds: i64) {
        self.time_offset
            .store(seconds, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_echoes_and_stops_at_newline() {
        let c = MemoryConsole::new();
        c.push_input(b"hi\nmore");
        let line = c.get_string(16, true);
        assert_eq!(line, b"hi");
        assert_eq!(c.take_output(), b"hi\n");
    }

    #[test]
    fn env_store_round_trips() {
        let env = MemoryEnvStore::new();
        assert!(!env.exists("BOOT_FLAGS"));
        env.set("BOOT_FLAGS", "a");
        assert_eq!(env.get("BOOT_FLAGS").as_deref(), Some("a"));
        env.clear();
        assert!(!env.exists("BOOT_FLAGS"));
    }

    #[test]
    fn env_time_offset_applies() {
        let env = MemoryEnvStore::new();
        env.set_time_offset(100);
        assert_eq!(env.get_time_offset(), 100);
    }
}

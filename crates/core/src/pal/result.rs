//! `PalResult` — the side-effect contract a CALL_PAL/HW_MTPR handler hands
//! back to the pipeline (§4.2.1).

/// Side effects the pipeline must apply after a PAL-format instruction. A
/// plain-data record with a handful of builder methods, per §9's guidance to
/// replace chained-mutation result objects with a builder over a flat
/// struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct PalResult {
    pub does_return: bool,
    pub has_return_value: bool,
    pub return_reg: u8,
    pub return_value: u64,
    pub pc_modified: bool,
    pub new_pc: u64,
    pub drain_write_buffers: bool,
    pub full_memory_barrier: bool,
    pub flush_pipeline: bool,
    pub flush_pc: u64,
    pub clear_branch_predictor: bool,
    pub ipl_changed: bool,
    pub reevaluate_traps: bool,
    pub notify_halt: bool,
    pub raises_exception: bool,
}

impl PalResult {
    /// The common case: execution continues linearly, no return value.
    pub fn returns() -> Self {
        Self {
            does_return: true,
            ..Default::default()
        }
    }

    /// Execution continues linearly with R0 (by convention) carrying a value.
    pub fn returns_value(value: u64) -> Self {
        Self {
            does_return: true,
            has_return_value: true,
            return_reg: 0,
            return_value: value,
            ..Default::default()
        }
    }

    pub fn returns_value_in(reg: u8, value: u64) -> Self {
        Self {
            does_return: true,
            has_return_value: true,
            return_reg: reg,
            return_value: value,
            ..Default::default()
        }
    }

    /// Control transfers elsewhere: HALT, CHMx, SWPPAL, trap-class functions.
    pub fn transfers_to(new_pc: u64) -> Self {
        Self {
            does_return: false,
            pc_modified: true,
            new_pc,
            ..Default::default()
        }
    }

    pub fn raising_exception() -> Self {
        Self {
            does_return: false,
            raises_exception: true,
            ..Default::default()
        }
    }

    pub fn with_barrier(mut self) -> Self {
        self.full_memory_barrier = true;
        self
    }

    pub fn with_drain(mut self) -> Self {
        self.drain_write_buffers = true;
        self
    }

    pub fn with_flush(mut self, pc: u64) -> Self {
        self.flush_pipeline = true;
        self.flush_pc = pc;
        self
    }

    pub fn with_branch_predictor_clear(mut self) -> Self {
        self.clear_branch_predictor = true;
        self
    }

    pub fn with_ipl_changed(mut self) -> Self {
        self.ipl_changed = true;
        self
    }

    pub fn with_reevaluate_traps(mut self) -> Self {
        self.reevaluate_traps = true;
        self
    }

    pub fn with_notify_halt(mut self) -> Self {
        self.notify_halt = true;
        self
    }
}

//! Privileged Architecture Library service layer (§4.2).

pub mod call;
pub mod cserve;
pub mod queue;
pub mod result;
pub mod vector_table;

pub use call::{
    apply_ipi_command, canonicalize_pal_pc, canonicalize_user_pc, dispatch_call_pal, enter_pal_vector, exit_pal,
    set_pal_mode, tb_fill, unknown_function, PalCallPalFunction, PalContext,
};
pub use result::PalResult;
pub use vector_table::PalVectorTable;

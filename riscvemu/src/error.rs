//! The single error channel the step loop surfaces to its caller.
//!
//! Every fatal condition the core can raise (a bad memory access, a
//! rejected CSR write, or a WFI deadlock) is folded into one enum so
//! `Vm::step`/`Vm::run` have one `Result` type, and a higher layer (the
//! exception reporter) can match on it to build a diagnostic without the
//! core needing to know how to format text.

use thiserror::Error;

use crate::csr::UnimplementedCsrWrite;
use crate::memory::MemoryError;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("csr error: {0}")]
    Csr(#[from] UnimplementedCsrWrite),

    #[error("unknown decoded instruction at pc 0x{pc:08x} (should be unreachable)")]
    UnknownInstruction { pc: u32 },

    #[error(
        "WFI held with interrupts globally disabled for {ticks} ticks; deadlock budget exceeded"
    )]
    Deadlock { pc: u32, ticks: u32 },
}

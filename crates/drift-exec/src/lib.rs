//! Concolic interpreter for the drift IR.
//!
//! Each SSA register holds a concrete 64-bit value alongside its symbolic
//! expression; branches are decided concretely, memory is byte-granular so
//! symbolic input buffers read back as expressions over their arrays. The
//! interpreter drives the error analysis at every dispatch, load, store
//! and block entry, and applies the loop-breaking protocol when enabled.

mod interp;
mod memory;
mod state;

pub use interp::{Config, Interpreter, RunOutcome};
pub use memory::Memory;
pub use state::{CallFrame, ConcVal, ExecState};

use drift_analysis::AnalysisError;
use drift_ir::ValueId;
use thiserror::Error;

/// Execution error; aborts the offending state.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("undefined value {0}")]
    UndefinedValue(ValueId),

    #[error("malformed instruction: {0}")]
    Malformed(&'static str),

    #[error("step limit exceeded")]
    StepLimit,
}

pub type ExecResult<T> = Result<T, ExecError>;

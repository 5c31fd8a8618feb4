//! Round-off error analysis core.
//!
//! Runs in lock-step with the host interpreter: for every IR value the
//! interpreter computes, [`ErrorState`] maintains a symbolic expression
//! for that value's relative numerical error, and [`LoopController`]
//! summarizes the error accumulated across constant-trip-count loops in
//! closed form instead of enumerating every iteration.

pub mod error_expr;
mod error_state;
mod loop_control;

pub use error_state::ErrorState;
pub use loop_control::{BlockEntryAction, HostBinder, LoopController, LoopFrame};

use thiserror::Error;

/// Fatal analysis error; aborts the offending execution state.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unhandled opcode `{mnemonic}` in error propagation")]
    UnhandledOpcode { mnemonic: &'static str },

    #[error("store through non-constant address `{address}`")]
    NonConstantAddress { address: String },
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

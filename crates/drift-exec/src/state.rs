//! Execution states: registers, call stack, error state, loop frames.

use crate::memory::Memory;
use ahash::AHashMap;
use drift_analysis::{ErrorState, LoopController};
use drift_expr::{Expr, ExprRef};
use drift_ir::ValueId;

/// A register value: concrete bits plus the symbolic expression they came
/// from.
#[derive(Debug, Clone)]
pub struct ConcVal {
    pub raw: u64,
    pub sym: ExprRef,
}

impl ConcVal {
    /// A purely concrete value of the given width.
    pub fn concrete(width: u32, raw: u64) -> Self {
        let sym = Expr::constant(width, raw);
        let raw = sym.const_value().unwrap_or(raw);
        Self { raw, sym }
    }
}

/// One call-stack frame: a position in a function plus PHI bookkeeping.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub func: usize,
    pub block: usize,
    pub inst: usize,
    /// Predecessor block, for PHI incoming resolution.
    pub prev_block: Option<usize>,
    /// Caller-side SSA value to bind on return, if any.
    pub ret_dest: Option<ValueId>,
    /// Whether the block-entry hook still has to run for this block
    /// visit.
    pub entry_hook_pending: bool,
}

impl CallFrame {
    pub fn at(func: usize, ret_dest: Option<ValueId>) -> Self {
        Self {
            func,
            block: 0,
            inst: 0,
            prev_block: None,
            ret_dest,
            entry_hook_pending: true,
        }
    }
}

/// One execution state. Forking clones everything per-state by value;
/// expression nodes and arrays stay shared.
#[derive(Debug, Clone)]
pub struct ExecState {
    pub id: u32,
    pub regs: AHashMap<ValueId, ConcVal>,
    pub memory: Memory,
    pub errors: ErrorState,
    pub loops: LoopController,
    pub stack: Vec<CallFrame>,
    pub steps: u64,
}

impl ExecState {
    pub fn new(id: u32, entry_func: usize, loop_breaking: bool) -> Self {
        Self {
            id,
            regs: AHashMap::new(),
            memory: Memory::new(),
            errors: ErrorState::new(),
            loops: LoopController::new(loop_breaking),
            stack: vec![CallFrame::at(entry_func, None)],
            steps: 0,
        }
    }

    /// Shallow fork: a synchronous tree split.
    pub fn fork(&self, id: u32) -> ExecState {
        let mut child = self.clone();
        child.id = id;
        child
    }

    pub fn frame(&self) -> &CallFrame {
        self.stack.last().expect("running state has a frame")
    }

    pub fn frame_mut(&mut self) -> &mut CallFrame {
        self.stack.last_mut().expect("running state has a frame")
    }
}

//! Instruction dispatch and the hooks into the error analysis.

use crate::memory::Memory;
use crate::state::{CallFrame, ConcVal, ExecState};
use crate::{ExecError, ExecResult};
use ahash::AHashMap;
use drift_analysis::error_expr::{resize, zero8};
use drift_analysis::{BlockEntryAction, HostBinder};
use drift_expr::{ArrayCache, ArrayRef, CmpPred, Expr, ExprRef};
use drift_ir::{BlockId, FcmpPred, Module, Opcode, Operand, TripCounts, ValueId};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Interpreter configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enables the loop-breaking protocol. Off by default; loops then
    /// execute normally.
    pub loop_breaking: bool,
    /// Per-state step budget.
    pub max_steps: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loop_breaking: false,
            max_steps: 1 << 20,
        }
    }
}

/// Result of driving all states to completion.
#[derive(Debug)]
pub struct RunOutcome {
    /// States that reached `ret` from the entry function.
    pub completed: Vec<ExecState>,
    /// States aborted with a diagnostic.
    pub aborted: Vec<(u32, ExecError)>,
}

enum StepEvent {
    Continue,
    Finished,
    Fork(Box<ExecState>),
}

/// The interpreter: drives one state at a time off a FIFO queue, owns the
/// process-wide array cache and the fresh-symbol counter.
pub struct Interpreter<'m> {
    module: &'m Module,
    trips: TripCounts,
    cache: ArrayCache,
    fresh_id: u64,
    next_state_id: u32,
    config: Config,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module, trips: TripCounts, config: Config) -> Self {
        Self {
            module,
            trips,
            cache: ArrayCache::new(),
            fresh_id: 0,
            next_state_id: 0,
            config,
        }
    }

    pub fn trips(&self) -> &TripCounts {
        &self.trips
    }

    fn alloc_state_id(&mut self) -> u32 {
        let id = self.next_state_id;
        self.next_state_id += 1;
        id
    }

    /// Execute the entry function, following forks, until every state has
    /// finished or aborted.
    pub fn run(&mut self, entry: &str) -> ExecResult<RunOutcome> {
        let (entry_idx, _) = self
            .module
            .function(entry)
            .ok_or_else(|| ExecError::UnknownFunction(entry.to_string()))?;
        let id = self.alloc_state_id();
        let state = ExecState::new(id, entry_idx, self.config.loop_breaking);

        let mut queue = VecDeque::from([state]);
        let mut completed = Vec::new();
        let mut aborted = Vec::new();
        while let Some(mut state) = queue.pop_front() {
            loop {
                match self.step(&mut state) {
                    Ok(StepEvent::Continue) => {}
                    Ok(StepEvent::Finished) => {
                        debug!(state = state.id, steps = state.steps, "state finished");
                        completed.push(state);
                        break;
                    }
                    Ok(StepEvent::Fork(child)) => {
                        queue.push_back(*child);
                    }
                    Err(e) => {
                        warn!(state = state.id, error = %e, "state aborted");
                        aborted.push((state.id, e));
                        break;
                    }
                }
            }
        }
        info!(
            completed = completed.len(),
            aborted = aborted.len(),
            "run complete"
        );
        Ok(RunOutcome { completed, aborted })
    }

    fn step(&mut self, state: &mut ExecState) -> ExecResult<StepEvent> {
        state.steps += 1;
        if state.steps > self.config.max_steps {
            return Err(ExecError::StepLimit);
        }
        let module = self.module;
        let (func_idx, block_idx, inst_idx, hook_pending) = {
            let f = state.frame();
            (f.func, f.block, f.inst, f.entry_hook_pending)
        };
        let func = &module.functions[func_idx];
        let block = &func.blocks[block_idx];

        // Block-entry hook: after the PHIs, before the entry instruction.
        if hook_pending && inst_idx >= block.entry_idx() {
            state.frame_mut().entry_hook_pending = false;
            if let Some(entry) = block.entry_inst() {
                let mut host = StateHost {
                    regs: &mut state.regs,
                    memory: &mut state.memory,
                    cache: &mut self.cache,
                    fresh_id: &mut self.fresh_id,
                };
                if let BlockEntryAction::SkipToExit(exit) = state.loops.on_block_entry(
                    entry.id,
                    &self.trips,
                    &mut state.errors,
                    &mut host,
                ) {
                    jump(state, block_idx, exit.block as usize);
                    return Ok(StepEvent::Continue);
                }
            }
        }

        let inst = block
            .insts
            .get(inst_idx)
            .ok_or(ExecError::Malformed("block without terminator"))?;

        match inst.opcode {
            Opcode::Phi => {
                let prev = state
                    .frame()
                    .prev_block
                    .ok_or(ExecError::Malformed("phi in entry block"))?;
                let incoming: Operand = inst
                    .phi_incoming()
                    .find(|(_, from)| *from as usize == prev)
                    .map(|(op, _)| op.clone())
                    .ok_or(ExecError::Malformed("no matching phi incoming"))?;
                let cv = operand_value(&state.regs, &incoming)?;
                let incoming_error = incoming
                    .as_value()
                    .and_then(|v| state.errors.retrieve_error(v))
                    .unwrap_or_else(zero8);
                state.regs.insert(inst.id, cv.clone());
                let error =
                    state
                        .errors
                        .propagate(&mut self.cache, module, inst, &cv.sym, &[incoming_error])?;
                let bid = BlockId {
                    func: func_idx as u32,
                    block: block_idx as u32,
                };
                if self.trips.header_entry_at(bid).is_some() {
                    state.loops.stage_phi(inst.id, error, inst.width);
                }
                advance(state)
            }

            Opcode::Alloca => {
                let size = match inst.operands.first() {
                    Some(Operand::Const { value, .. }) => *value,
                    _ => return Err(ExecError::Malformed("alloca without constant size")),
                };
                let addr = state.memory.allocate(size);
                state.regs.insert(inst.id, ConcVal::concrete(64, addr));
                advance(state)
            }

            Opcode::Load => {
                let addr = operand_value(&state.regs, &inst.operands[0])?;
                let (conc, sym) = state.memory.load(addr.raw, inst.width);
                let sym = sym.unwrap_or_else(|| Expr::constant(inst.width, conc));
                state.regs.insert(inst.id, ConcVal { raw: conc, sym });
                state.errors.execute_load(inst.id, &addr.sym);
                advance(state)
            }

            Opcode::Store => {
                let value = operand_value(&state.regs, &inst.operands[0])?;
                let addr = operand_value(&state.regs, &inst.operands[1])?;
                state
                    .memory
                    .store(addr.raw, value.sym.width(), value.raw, &value.sym);
                let error = state.errors.retrieve_error_for(
                    &mut self.cache,
                    &value.sym,
                    inst.operands[0].as_value(),
                );
                let prior = addr
                    .sym
                    .const_value()
                    .and_then(|a| state.errors.stored_error_at(a));
                state.errors.execute_store(&addr.sym, error)?;
                if let Some(a) = addr.sym.const_value() {
                    let bid = BlockId {
                        func: func_idx as u32,
                        block: block_idx as u32,
                    };
                    state
                        .loops
                        .record_store(bid, &self.trips, a, value.sym.clone(), prior);
                }
                advance(state)
            }

            Opcode::Gep => {
                let base = operand_value(&state.regs, &inst.operands[0])?;
                let offset = operand_value(&state.regs, &inst.operands[1])?;
                let raw = base.raw.wrapping_add(offset.raw);
                let sym = if base.sym.const_value().is_some() && offset.sym.const_value().is_some()
                {
                    Expr::constant(64, raw)
                } else {
                    Expr::add(resize(base.sym.clone(), 64), resize(offset.sym.clone(), 64))
                };
                state.regs.insert(inst.id, ConcVal { raw, sym: sym.clone() });
                state
                    .errors
                    .propagate(&mut self.cache, module, inst, &sym, &[base.sym, offset.sym])?;
                advance(state)
            }

            Opcode::Br => {
                let target = inst.operands[0]
                    .as_block()
                    .ok_or(ExecError::Malformed("br without target"))?;
                jump(state, block_idx, target as usize);
                Ok(StepEvent::Continue)
            }

            Opcode::CondBr => {
                let cond = operand_value(&state.regs, &inst.operands[0])?;
                let target = if cond.raw & 1 != 0 {
                    inst.operands[1].as_block()
                } else {
                    inst.operands[2].as_block()
                }
                .ok_or(ExecError::Malformed("cbr without targets"))?;
                jump(state, block_idx, target as usize);
                Ok(StepEvent::Continue)
            }

            Opcode::Ret => {
                let retval = match inst.operands.first() {
                    Some(op) => Some(operand_value(&state.regs, op)?),
                    None => None,
                };
                let popped = state.stack.pop().ok_or(ExecError::Malformed("ret without frame"))?;
                if state.stack.is_empty() {
                    return Ok(StepEvent::Finished);
                }
                if let (Some(cv), Some(dest)) = (retval, popped.ret_dest) {
                    state.regs.insert(dest, cv);
                }
                Ok(StepEvent::Continue)
            }

            Opcode::Call => self.dispatch_call(state, func_idx, block_idx, inst_idx),

            _ => {
                let (cv, args) = self.eval_value_op(state, func_idx, block_idx, inst_idx)?;
                let inst = &module.functions[func_idx].blocks[block_idx].insts[inst_idx];
                state.regs.insert(inst.id, cv.clone());
                state
                    .errors
                    .propagate(&mut self.cache, module, inst, &cv.sym, &args)?;
                advance(state)
            }
        }
    }

    /// Evaluate a pure value-producing instruction concretely and build
    /// its symbolic result.
    fn eval_value_op(
        &mut self,
        state: &mut ExecState,
        func_idx: usize,
        block_idx: usize,
        inst_idx: usize,
    ) -> ExecResult<(ConcVal, Vec<ExprRef>)> {
        let inst = &self.module.functions[func_idx].blocks[block_idx].insts[inst_idx];
        let w = inst.width;
        match inst.opcode {
            Opcode::Trunc
            | Opcode::ZExt
            | Opcode::SExt
            | Opcode::FpExt
            | Opcode::FpTrunc
            | Opcode::FpToSi
            | Opcode::FpToUi
            | Opcode::SiToFp
            | Opcode::UiToFp
            | Opcode::PtrToInt
            | Opcode::IntToPtr
            | Opcode::BitCast => {
                let x = operand_value(&state.regs, &inst.operands[0])?;
                let cv = eval_cast(inst.opcode, w, &x);
                Ok((cv, vec![x.sym]))
            }
            _ => {
                let l = operand_value(&state.regs, &inst.operands[0])?;
                let r = operand_value(&state.regs, &inst.operands[1])?;
                let cv = eval_binary(inst.opcode, w, &l, &r)?;
                Ok((cv, vec![l.sym, r.sym]))
            }
        }
    }

    fn dispatch_call(
        &mut self,
        state: &mut ExecState,
        func_idx: usize,
        block_idx: usize,
        inst_idx: usize,
    ) -> ExecResult<StepEvent> {
        let module = self.module;
        let inst = &module.functions[func_idx].blocks[block_idx].insts[inst_idx];
        let callee = inst
            .callee()
            .ok_or(ExecError::Malformed("call without callee"))?;

        match callee {
            "drift_symbolic" => {
                let args = inst.call_args();
                let ptr = operand_value(&state.regs, &args[0])?;
                let len = match args.get(1) {
                    Some(Operand::Const { value, .. }) => *value,
                    _ => return Err(ExecError::Malformed("drift_symbolic without length")),
                };
                let name = match args.get(2) {
                    Some(Operand::Str(s)) => s.clone(),
                    _ => return Err(ExecError::Malformed("drift_symbolic without name")),
                };
                let array = self.cache.create(&name, len);
                state.memory.set_symbolic(ptr.raw, &array);
                debug!(name = array.name.as_str(), size = len, "symbolic input");
                advance(state)
            }
            "drift_bound" => {
                let args = inst.call_args();
                let subject = args.first().and_then(|o| o.as_value());
                let bound = match args.get(1) {
                    Some(Operand::Float { value, .. }) => *value,
                    Some(Operand::Const { value, .. }) => *value as f64,
                    _ => return Err(ExecError::Malformed("drift_bound without bound")),
                };
                let func_name = module.functions[func_idx].name.clone();
                state
                    .errors
                    .output_bound(inst, Some(&func_name), subject, bound);
                advance(state)
            }
            "drift_fork" => {
                let width = inst.width.max(1);
                state.regs.insert(inst.id, ConcVal::concrete(width, 1));
                state.frame_mut().inst += 1;
                let mut child = state.fork(self.alloc_state_id());
                child.regs.insert(inst.id, ConcVal::concrete(width, 0));
                debug!(parent = state.id, child = child.id, "state forked");
                Ok(StepEvent::Fork(Box::new(child)))
            }
            _ => {
                let (callee_idx, callee_func) = module
                    .function(callee)
                    .ok_or_else(|| ExecError::UnknownFunction(callee.to_string()))?;
                let mut args = Vec::with_capacity(inst.call_args().len());
                for op in inst.call_args() {
                    args.push(operand_value(&state.regs, op)?);
                }
                let arg_syms: Vec<ExprRef> = args.iter().map(|a| a.sym.clone()).collect();
                let result = Expr::constant(inst.width.max(1), 0);
                state
                    .errors
                    .propagate(&mut self.cache, module, inst, &result, &arg_syms)?;
                for (param, cv) in callee_func.params.iter().zip(args) {
                    state.regs.insert(param.id, cv);
                }
                let ret_dest = (inst.width > 0).then_some(inst.id);
                state.frame_mut().inst += 1;
                state.stack.push(CallFrame::at(callee_idx, ret_dest));
                Ok(StepEvent::Continue)
            }
        }
    }
}

fn advance(state: &mut ExecState) -> ExecResult<StepEvent> {
    state.frame_mut().inst += 1;
    Ok(StepEvent::Continue)
}

fn jump(state: &mut ExecState, from: usize, target: usize) {
    let frame = state.frame_mut();
    frame.prev_block = Some(from);
    frame.block = target;
    frame.inst = 0;
    frame.entry_hook_pending = true;
}

fn operand_value(regs: &AHashMap<ValueId, ConcVal>, op: &Operand) -> ExecResult<ConcVal> {
    match op {
        Operand::Value(v) => regs.get(v).cloned().ok_or(ExecError::UndefinedValue(*v)),
        Operand::Const { width, value } => Ok(ConcVal::concrete((*width).max(1), *value)),
        Operand::Float { width, value } => {
            Ok(ConcVal::concrete(*width, float_bits(*width, *value)))
        }
        _ => Err(ExecError::Malformed("operand is not a value")),
    }
}

fn mask(width: u32, value: u64) -> u64 {
    if width >= 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

fn to_signed(width: u32, value: u64) -> i64 {
    if width >= 64 {
        value as i64
    } else {
        let shift = 64 - width;
        ((value << shift) as i64) >> shift
    }
}

fn float_of(width: u32, bits: u64) -> f64 {
    if width == 32 {
        f32::from_bits(bits as u32) as f64
    } else {
        f64::from_bits(bits)
    }
}

fn float_bits(width: u32, value: f64) -> u64 {
    if width == 32 {
        (value as f32).to_bits() as u64
    } else {
        value.to_bits()
    }
}

fn eval_icmp(pred: CmpPred, width: u32, a: u64, b: u64) -> bool {
    let (ua, ub) = (mask(width, a), mask(width, b));
    let (sa, sb) = (to_signed(width, ua), to_signed(width, ub));
    match pred {
        CmpPred::Eq => ua == ub,
        CmpPred::Ne => ua != ub,
        CmpPred::Ult => ua < ub,
        CmpPred::Ule => ua <= ub,
        CmpPred::Ugt => ua > ub,
        CmpPred::Uge => ua >= ub,
        CmpPred::Slt => sa < sb,
        CmpPred::Sle => sa <= sb,
        CmpPred::Sgt => sa > sb,
        CmpPred::Sge => sa >= sb,
    }
}

fn eval_fcmp(pred: FcmpPred, width: u32, a: u64, b: u64) -> bool {
    let (fa, fb) = (float_of(width, a), float_of(width, b));
    match pred {
        FcmpPred::Oeq => fa == fb,
        FcmpPred::One => fa != fb,
        FcmpPred::Olt => fa < fb,
        FcmpPred::Ole => fa <= fb,
        FcmpPred::Ogt => fa > fb,
        FcmpPred::Oge => fa >= fb,
    }
}

fn eval_binary(op: Opcode, w: u32, l: &ConcVal, r: &ConcVal) -> ExecResult<ConcVal> {
    let a = mask(w, l.raw);
    let b = mask(w, r.raw);
    let fw = l.sym.width();

    // Symbolic node for the ops the expression universe covers; anything
    // else concretizes.
    let (conc, sym): (u64, Option<ExprRef>) = match op {
        Opcode::Add => (
            a.wrapping_add(b),
            Some(Expr::add(l.sym.clone(), r.sym.clone())),
        ),
        Opcode::Sub => (
            a.wrapping_sub(b),
            Some(Expr::sub(l.sym.clone(), r.sym.clone())),
        ),
        Opcode::Mul => (
            a.wrapping_mul(b),
            Some(Expr::mul(l.sym.clone(), r.sym.clone())),
        ),
        Opcode::UDiv => {
            if b == 0 {
                return Err(ExecError::DivisionByZero);
            }
            (a / b, Some(Expr::udiv(l.sym.clone(), r.sym.clone())))
        }
        Opcode::SDiv => {
            if b == 0 {
                return Err(ExecError::DivisionByZero);
            }
            (
                to_signed(w, a).wrapping_div(to_signed(w, b)) as u64,
                None,
            )
        }
        Opcode::URem => {
            if b == 0 {
                return Err(ExecError::DivisionByZero);
            }
            (a % b, None)
        }
        Opcode::SRem => {
            if b == 0 {
                return Err(ExecError::DivisionByZero);
            }
            (
                to_signed(w, a).wrapping_rem(to_signed(w, b)) as u64,
                None,
            )
        }
        Opcode::And => (a & b, None),
        Opcode::Or => (a | b, None),
        Opcode::Xor => (a ^ b, None),
        Opcode::Shl => (
            if b >= w as u64 { 0 } else { a << (b as u32) },
            None,
        ),
        Opcode::LShr => (
            if b >= w as u64 { 0 } else { a >> (b as u32) },
            None,
        ),
        Opcode::AShr => {
            let sh = b.min(w.saturating_sub(1) as u64) as u32;
            ((to_signed(w, a) >> sh) as u64, None)
        }
        Opcode::FAdd => (float_bits(w, float_of(w, a) + float_of(w, b)), None),
        Opcode::FSub => (float_bits(w, float_of(w, a) - float_of(w, b)), None),
        Opcode::FMul => (float_bits(w, float_of(w, a) * float_of(w, b)), None),
        Opcode::FDiv => (float_bits(w, float_of(w, a) / float_of(w, b)), None),
        Opcode::FRem => (float_bits(w, float_of(w, a) % float_of(w, b)), None),
        Opcode::Icmp(pred) => (
            eval_icmp(pred, fw, l.raw, r.raw) as u64,
            Some(Expr::cmp(pred, l.sym.clone(), r.sym.clone())),
        ),
        Opcode::Fcmp(pred) => (eval_fcmp(pred, fw, l.raw, r.raw) as u64, None),
        _ => return Err(ExecError::Malformed("not a binary opcode")),
    };
    let out_width = match op {
        Opcode::Icmp(_) | Opcode::Fcmp(_) => 1,
        _ => w,
    };
    let sym = sym.unwrap_or_else(|| Expr::constant(out_width, conc));
    Ok(ConcVal {
        raw: mask(out_width, conc),
        sym,
    })
}

fn eval_cast(op: Opcode, w: u32, x: &ConcVal) -> ConcVal {
    let xw = x.sym.width();
    let (conc, sym): (u64, Option<ExprRef>) = match op {
        Opcode::Trunc => (mask(w, x.raw), Some(Expr::extract(x.sym.clone(), 0, w))),
        Opcode::ZExt => (x.raw, Some(Expr::zext(x.sym.clone(), w))),
        Opcode::SExt => (
            mask(w, to_signed(xw, x.raw) as u64),
            Some(Expr::sext(x.sym.clone(), w)),
        ),
        Opcode::PtrToInt | Opcode::IntToPtr | Opcode::BitCast => {
            (mask(w, x.raw), Some(resize(x.sym.clone(), w)))
        }
        Opcode::FpExt => (float_bits(64, float_of(32, x.raw)), None),
        Opcode::FpTrunc => (float_bits(32, float_of(64, x.raw)), None),
        Opcode::FpToSi => (mask(w, float_of(xw, x.raw) as i64 as u64), None),
        Opcode::FpToUi => (mask(w, float_of(xw, x.raw) as u64), None),
        Opcode::SiToFp => (float_bits(w, to_signed(xw, x.raw) as f64), None),
        Opcode::UiToFp => (float_bits(w, x.raw as f64), None),
        _ => (mask(w, x.raw), None),
    };
    let sym = sym.unwrap_or_else(|| Expr::constant(w, conc));
    ConcVal {
        raw: mask(w, conc),
        sym,
    }
}

/// Interpreter-side implementation of the rebinding primitives the loop
/// controller needs when closing a loop. Borrows disjoint pieces of the
/// state and the interpreter.
struct StateHost<'a> {
    regs: &'a mut AHashMap<ValueId, ConcVal>,
    memory: &'a mut Memory,
    cache: &'a mut ArrayCache,
    fresh_id: &'a mut u64,
}

impl HostBinder for StateHost<'_> {
    fn bind_local(&mut self, value: ValueId, expr: ExprRef) {
        match self.regs.get_mut(&value) {
            Some(cv) => cv.sym = expr,
            None => {
                self.regs.insert(value, ConcVal { raw: 0, sym: expr });
            }
        }
    }

    fn write_memory(&mut self, addr: u64, value: ExprRef) {
        self.memory.write_expr(addr, &value);
    }

    fn fresh_array(&mut self, width_bits: u32) -> ArrayRef {
        let name = format!("__fresh_sym_{}", *self.fresh_id);
        *self.fresh_id += 1;
        self.cache.create(&name, (width_bits as u64 + 7) / 8)
    }
}

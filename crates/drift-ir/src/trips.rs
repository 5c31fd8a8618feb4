//! Constant trip-count analysis.
//!
//! For every natural loop whose backedge-taken count can be determined
//! statically, records the trip count (number of body executions of an
//! always-entered loop) together with the loop landmarks the loop-breaking
//! protocol needs: the header's entry instruction, the unique exit block
//! and its entry instruction, and the membership of body blocks.
//!
//! The reasoning is classic induction-variable recognition: a header PHI
//! with a constant initial value, a single constant-step increment in the
//! body, and one exiting compare against a constant bound. Anything else
//! is skipped; skipped loops simply execute normally.

use crate::ir::{BlockId, Instruction, Module, Opcode, Operand, ValueId};
use crate::loops::{find_loops, NaturalLoop};
use drift_expr::CmpPred;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Per-loop record: constant trip count and the unique exit block.
#[derive(Debug, Clone, Copy)]
pub struct LoopInfo {
    pub trip_count: i64,
    pub exit: BlockId,
}

/// Immutable result of the module-wide analysis. Constructed once per
/// module and consulted at every block entry during execution.
#[derive(Debug, Default)]
pub struct TripCounts {
    counts: HashMap<ValueId, LoopInfo>,
    header_of_block: HashMap<BlockId, ValueId>,
    exit_to_header: HashMap<ValueId, ValueId>,
    header_block_entry: HashMap<BlockId, ValueId>,
}

impl TripCounts {
    /// Run the analysis over every function of the module.
    pub fn analyze(module: &Module) -> TripCounts {
        let mut out = TripCounts::default();
        for (f_idx, func) in module.functions.iter().enumerate() {
            // Defining instruction per value id, for induction lookups.
            let mut defs: HashMap<ValueId, &Instruction> = HashMap::new();
            for block in &func.blocks {
                for inst in &block.insts {
                    defs.insert(inst.id, inst);
                }
            }
            // Largest body first, so inner loops overwrite the
            // header-for-block entries of their enclosing loops.
            for l in find_loops(func) {
                out.record_loop(module, f_idx, &l, &defs);
            }
        }
        out
    }

    fn record_loop(
        &mut self,
        module: &Module,
        f_idx: usize,
        l: &NaturalLoop,
        defs: &HashMap<ValueId, &Instruction>,
    ) {
        let func = &module.functions[f_idx];
        let header_block = &func.blocks[l.header];
        let header_entry = match header_block.entry_inst() {
            Some(inst) => inst.id,
            None => return,
        };

        let count = match constant_trip_count(module, f_idx, l, defs) {
            Some((count, exit_block)) => {
                let exit = BlockId {
                    func: f_idx as u32,
                    block: exit_block as u32,
                };
                let exit_entry = match func.blocks[exit_block].entry_inst() {
                    Some(inst) => inst.id,
                    None => return,
                };
                debug!(
                    function = func.name.as_str(),
                    header = header_block.name.as_str(),
                    trip_count = count,
                    "retained constant-trip loop"
                );
                self.counts.insert(header_entry, LoopInfo {
                    trip_count: count,
                    exit,
                });
                self.exit_to_header.insert(exit_entry, header_entry);
                self.header_block_entry.insert(
                    BlockId {
                        func: f_idx as u32,
                        block: l.header as u32,
                    },
                    header_entry,
                );
                Some(count)
            }
            None => {
                trace!(
                    function = func.name.as_str(),
                    header = header_block.name.as_str(),
                    "loop without constant trip count, skipped"
                );
                None
            }
        };

        if count.is_some() {
            for &b in &l.body {
                self.header_of_block.insert(
                    BlockId {
                        func: f_idx as u32,
                        block: b as u32,
                    },
                    header_entry,
                );
            }
        }
    }

    /// Trip count and exit block of a retained loop, keyed by its
    /// header-entry instruction.
    pub fn trip_count_of(&self, header_entry: ValueId) -> Option<LoopInfo> {
        self.counts.get(&header_entry).copied()
    }

    /// The header-entry instruction of the retained loop containing the
    /// given block (innermost wins).
    pub fn header_for(&self, block: BlockId) -> Option<ValueId> {
        self.header_of_block.get(&block).copied()
    }

    /// If `inst` is the entry instruction of a retained loop's exit
    /// block, the corresponding header-entry instruction.
    pub fn first_of_exit(&self, exit_entry: ValueId) -> Option<ValueId> {
        self.exit_to_header.get(&exit_entry).copied()
    }

    /// Whether `inst` is the entry instruction of a retained loop header.
    pub fn is_header_entry(&self, inst: ValueId) -> bool {
        self.counts.contains_key(&inst)
    }

    /// The header-entry instruction of a retained loop whose header is
    /// the given block, if any. Used to recognize header PHIs.
    pub fn header_entry_at(&self, block: BlockId) -> Option<ValueId> {
        self.header_block_entry.get(&block).copied()
    }

    /// Number of retained loops.
    pub fn retained(&self) -> usize {
        self.counts.len()
    }

    /// Iterate retained loops as (header entry, info).
    pub fn iter(&self) -> impl Iterator<Item = (ValueId, LoopInfo)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }

    /// Iterate retained loop headers as (header block, header entry).
    pub fn header_blocks(&self) -> impl Iterator<Item = (BlockId, ValueId)> + '_ {
        self.header_block_entry.iter().map(|(k, v)| (*k, *v))
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

/// Swap a predicate's operand order (`a < b` becomes `b > a`).
fn swap_pred(pred: CmpPred) -> CmpPred {
    match pred {
        CmpPred::Eq => CmpPred::Eq,
        CmpPred::Ne => CmpPred::Ne,
        CmpPred::Ult => CmpPred::Ugt,
        CmpPred::Ule => CmpPred::Uge,
        CmpPred::Ugt => CmpPred::Ult,
        CmpPred::Uge => CmpPred::Ule,
        CmpPred::Slt => CmpPred::Sgt,
        CmpPred::Sle => CmpPred::Sge,
        CmpPred::Sgt => CmpPred::Slt,
        CmpPred::Sge => CmpPred::Sle,
    }
}

/// Recognized induction pattern of one loop.
struct Induction {
    width: u32,
    init: u64,
    step: u64,
    phi: ValueId,
    next: ValueId,
}

/// One exiting edge controlled by a compare of the induction variable
/// against a constant.
struct IvExit {
    pred: CmpPred,
    on_next: bool,
    bound: u64,
    exit_on_true: bool,
    at_header: bool,
}

fn constant_trip_count(
    module: &Module,
    f_idx: usize,
    l: &NaturalLoop,
    defs: &HashMap<ValueId, &Instruction>,
) -> Option<(i64, usize)> {
    let func = &module.functions[f_idx];

    // Unique exit block. Multiple exiting edges are allowed; the ones
    // that are not induction-controlled are data-dependent early exits
    // and handled dynamically.
    let mut exits: HashSet<usize> = HashSet::new();
    let mut exiting: Vec<usize> = Vec::new();
    for &b in &l.body {
        let succs = func.successors(b);
        if succs.iter().any(|s| !l.body.contains(s)) {
            exiting.push(b);
        }
        for s in succs {
            if !l.body.contains(&s) {
                exits.insert(s);
            }
        }
    }
    if exits.len() != 1 {
        return None;
    }
    let exit_block = *exits.iter().next()?;

    let induction = find_induction(func, l, defs)?;

    // Exactly one exiting edge must be controlled by the induction
    // variable; its compare determines the count.
    let mut iv_exits: Vec<IvExit> = Vec::new();
    for &exiting_block in &exiting {
        if let Some(e) = iv_exit(func, l, defs, &induction, exiting_block) {
            iv_exits.push(e);
        }
    }
    if iv_exits.len() != 1 {
        return None;
    }
    let IvExit {
        pred,
        on_next,
        bound,
        exit_on_true,
        at_header: test_at_header,
    } = iv_exits.pop()?;

    // The tested value follows the affine progression v(c) = init + c*step.
    // `c0` is the progression index of the first test and `delta` converts
    // the exiting index back to the number of body executions: a header
    // test runs before each iteration, a latch test after, and testing
    // `iv.next` shifts the index by one increment.
    let (c0, delta): (i128, i128) = match (test_at_header, on_next) {
        (true, false) => (0, 0),
        (true, true) => (1, 1),
        (false, true) => (1, 0),
        (false, false) => (0, -1),
    };
    let c = closed_form_count(
        pred,
        exit_on_true,
        induction.width,
        induction.init,
        induction.step,
        bound,
        c0,
    )?;
    let trips = i64::try_from(c - delta).ok()?;
    Some((trips, exit_block))
}

/// Smallest progression index `c >= c0` at which the exit condition first
/// holds for `v(c) = init + c * step`, solved per predicate in exact
/// integer arithmetic. Bails out (no constant count) when the progression
/// would leave the type's domain before the exit, where the modular
/// semantics of the machine diverge from the affine model.
fn closed_form_count(
    pred: CmpPred,
    exit_on_true: bool,
    width: u32,
    init: u64,
    step: u64,
    bound: u64,
    c0: i128,
) -> Option<i128> {
    let exit_pred = if exit_on_true { pred } else { negate_pred(pred) };
    let signed = matches!(
        exit_pred,
        CmpPred::Slt | CmpPred::Sle | CmpPred::Sgt | CmpPred::Sge
    );
    let (a, b, dom_min, dom_max): (i128, i128, i128, i128) = if signed {
        (
            to_signed(width, init) as i128,
            to_signed(width, bound) as i128,
            -(1i128 << (width - 1)),
            (1i128 << (width - 1)) - 1,
        )
    } else {
        (
            mask(width, init) as i128,
            mask(width, bound) as i128,
            0,
            if width >= 64 {
                u64::MAX as i128
            } else {
                (1i128 << width) - 1
            },
        )
    };
    let s = to_signed(width, step) as i128;

    let c = match exit_pred {
        CmpPred::Eq => solve_eq(a, s, b, c0)?,
        CmpPred::Ne => solve_ne(a, s, b, c0)?,
        CmpPred::Ult | CmpPred::Slt => solve_le(a, s, b - 1, c0)?,
        CmpPred::Ule | CmpPred::Sle => solve_le(a, s, b, c0)?,
        CmpPred::Ugt | CmpPred::Sgt => solve_ge(a, s, b + 1, c0)?,
        CmpPred::Uge | CmpPred::Sge => solve_ge(a, s, b, c0)?,
    };

    // The progression is monotone, so in-domain endpoints mean the whole
    // tested segment stays in domain.
    for v in [a + c0 * s, a + c * s] {
        if v < dom_min || v > dom_max {
            return None;
        }
    }
    Some(c)
}

/// The exit condition when the branch leaves the loop on a false compare.
fn negate_pred(pred: CmpPred) -> CmpPred {
    match pred {
        CmpPred::Eq => CmpPred::Ne,
        CmpPred::Ne => CmpPred::Eq,
        CmpPred::Ult => CmpPred::Uge,
        CmpPred::Ule => CmpPred::Ugt,
        CmpPred::Ugt => CmpPred::Ule,
        CmpPred::Uge => CmpPred::Ult,
        CmpPred::Slt => CmpPred::Sge,
        CmpPred::Sle => CmpPred::Sgt,
        CmpPred::Sgt => CmpPred::Sle,
        CmpPred::Sge => CmpPred::Slt,
    }
}

/// Smallest `c >= c0` with `a + c*s <= t`.
fn solve_le(a: i128, s: i128, t: i128, c0: i128) -> Option<i128> {
    if s == 0 {
        return (a <= t).then_some(c0);
    }
    if a + c0 * s <= t {
        return Some(c0);
    }
    if s > 0 {
        // Increasing away from the threshold.
        return None;
    }
    Some(c0.max(div_ceil(a - t, -s)))
}

/// Smallest `c >= c0` with `a + c*s >= t`.
fn solve_ge(a: i128, s: i128, t: i128, c0: i128) -> Option<i128> {
    if s == 0 {
        return (a >= t).then_some(c0);
    }
    if a + c0 * s >= t {
        return Some(c0);
    }
    if s < 0 {
        return None;
    }
    Some(c0.max(div_ceil(t - a, s)))
}

/// Smallest `c >= c0` with `a + c*s == b`.
fn solve_eq(a: i128, s: i128, b: i128, c0: i128) -> Option<i128> {
    if s == 0 {
        return (a == b).then_some(c0);
    }
    let d = b - a;
    if d % s != 0 {
        return None;
    }
    let c = d / s;
    (c >= c0).then_some(c)
}

/// Smallest `c >= c0` with `a + c*s != b`.
fn solve_ne(a: i128, s: i128, b: i128, c0: i128) -> Option<i128> {
    if a + c0 * s != b {
        Some(c0)
    } else if s != 0 {
        Some(c0 + 1)
    } else {
        None
    }
}

/// Ceiling division; every call site has both operands positive.
fn div_ceil(n: i128, d: i128) -> i128 {
    (n + d - 1) / d
}

/// Inspect one exiting block for a conditional branch on a compare of the
/// induction variable against a constant.
fn iv_exit(
    func: &crate::ir::Function,
    l: &NaturalLoop,
    defs: &HashMap<ValueId, &Instruction>,
    induction: &Induction,
    exiting_block: usize,
) -> Option<IvExit> {
    let term = func.blocks[exiting_block].terminator()?;
    if term.opcode != Opcode::CondBr {
        return None;
    }
    let cond_id = term.operands[0].as_value()?;
    let cmp = defs.get(&cond_id)?;
    let pred = match cmp.opcode {
        Opcode::Icmp(p) => p,
        _ => return None,
    };
    let (pred, iv_side, bound) = match (&cmp.operands[0], &cmp.operands[1]) {
        (Operand::Value(v), Operand::Const { value, .. }) => (pred, *v, *value),
        (Operand::Const { value, .. }, Operand::Value(v)) => (swap_pred(pred), *v, *value),
        _ => return None,
    };
    let on_next = if iv_side == induction.next {
        true
    } else if iv_side == induction.phi {
        false
    } else {
        return None;
    };

    let true_target = term.operands[1].as_block()? as usize;
    let false_target = term.operands[2].as_block()? as usize;
    let exit_on_true = match (
        l.body.contains(&true_target),
        l.body.contains(&false_target),
    ) {
        (false, true) => true,
        (true, false) => false,
        _ => return None,
    };
    Some(IvExit {
        pred,
        on_next,
        bound,
        exit_on_true,
        at_header: exiting_block == l.header,
    })
}

/// Find a header PHI of the shape `phi [init, preheader], [next, latch]`
/// where `next = add/sub(phi, const)` is defined in the body.
fn find_induction(
    func: &crate::ir::Function,
    l: &NaturalLoop,
    defs: &HashMap<ValueId, &Instruction>,
) -> Option<Induction> {
    for inst in &func.blocks[l.header].insts {
        if inst.opcode != Opcode::Phi {
            break;
        }
        let incoming: Vec<_> = inst.phi_incoming().collect();
        if incoming.len() != 2 {
            continue;
        }
        let mut init: Option<u64> = None;
        let mut next: Option<ValueId> = None;
        for (value, from) in incoming {
            if l.body.contains(&(from as usize)) {
                if let Operand::Value(v) = value {
                    next = Some(*v);
                }
            } else if let Operand::Const { value, .. } = value {
                init = Some(*value);
            }
        }
        let (init, next_id) = match (init, next) {
            (Some(i), Some(n)) => (i, n),
            _ => continue,
        };
        let next_inst = match defs.get(&next_id) {
            Some(i) => i,
            None => continue,
        };
        let step = match (next_inst.opcode, &next_inst.operands[..]) {
            (Opcode::Add, [Operand::Value(v), Operand::Const { width, value }])
                if *v == inst.id =>
            {
                to_signed(*width, *value) as u64
            }
            (Opcode::Add, [Operand::Const { width, value }, Operand::Value(v)])
                if *v == inst.id =>
            {
                to_signed(*width, *value) as u64
            }
            (Opcode::Sub, [Operand::Value(v), Operand::Const { width, value }])
                if *v == inst.id =>
            {
                (to_signed(*width, *value)).wrapping_neg() as u64
            }
            _ => continue,
        };
        return Some(Induction {
            width: inst.width,
            init,
            step,
            phi: inst.id,
            next: next_id,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_module;

    fn analyze(src: &str) -> (Module, TripCounts) {
        let module = parse_module(src).unwrap();
        let trips = TripCounts::analyze(&module);
        (module, trips)
    }

    const WHILE_LOOP: &str = r#"
fn @main() {
entry:
  br header
header:
  %i = phi i32, [ 0, entry ], [ %inc, body ]
  %c = icmp slt i32, %i, 3
  cbr %c, body, exit
body:
  %inc = add i32, %i, 1
  br header
exit:
  ret
}
"#;

    #[test]
    fn test_while_loop_trip_count() {
        let (module, trips) = analyze(WHILE_LOOP);
        assert_eq!(trips.retained(), 1);
        let f = &module.functions[0];
        let header_entry = f.blocks[1].entry_inst().unwrap().id;
        let info = trips.trip_count_of(header_entry).unwrap();
        assert_eq!(info.trip_count, 3);
        assert_eq!(info.exit, BlockId { func: 0, block: 3 });
        assert!(trips.is_header_entry(header_entry));
        let exit_entry = f.blocks[3].entry_inst().unwrap().id;
        assert_eq!(trips.first_of_exit(exit_entry), Some(header_entry));
        for b in [1u32, 2] {
            assert_eq!(
                trips.header_for(BlockId { func: 0, block: b }),
                Some(header_entry)
            );
        }
        assert_eq!(trips.header_for(BlockId { func: 0, block: 0 }), None);
    }

    #[test]
    fn test_do_while_trip_count() {
        let src = r#"
fn @main() {
entry:
  br body
body:
  %i = phi i32, [ 0, entry ], [ %inc, body ]
  %inc = add i32, %i, 1
  %c = icmp slt i32, %inc, 5
  cbr %c, body, exit
exit:
  ret
}
"#;
        let (module, trips) = analyze(src);
        let f = &module.functions[0];
        let header_entry = f.blocks[1].entry_inst().unwrap().id;
        assert_eq!(trips.trip_count_of(header_entry).unwrap().trip_count, 5);
    }

    #[test]
    fn test_symbolic_bound_not_retained() {
        let src = r#"
fn @main(%n: i32) {
entry:
  br header
header:
  %i = phi i32, [ 0, entry ], [ %inc, body ]
  %c = icmp slt i32, %i, %n
  cbr %c, body, exit
body:
  %inc = add i32, %i, 1
  br header
exit:
  ret
}
"#;
        let (_, trips) = analyze(src);
        assert_eq!(trips.retained(), 0);
    }

    #[test]
    fn test_nested_loops_both_retained() {
        let src = r#"
fn @main() {
entry:
  br outer
outer:
  %i = phi i32, [ 0, entry ], [ %inext, olatch ]
  br inner
inner:
  %j = phi i32, [ 0, outer ], [ %jnext, inner ]
  %jnext = add i32, %j, 1
  %cj = icmp slt i32, %jnext, 4
  cbr %cj, inner, olatch
olatch:
  %inext = add i32, %i, 1
  %ci = icmp slt i32, %inext, 2
  cbr %ci, outer, exit
exit:
  ret
}
"#;
        let (module, trips) = analyze(src);
        assert_eq!(trips.retained(), 2);
        let f = &module.functions[0];
        let outer_entry = f.blocks[1].entry_inst().unwrap().id;
        let inner_entry = f.blocks[2].entry_inst().unwrap().id;
        assert_eq!(trips.trip_count_of(outer_entry).unwrap().trip_count, 2);
        assert_eq!(trips.trip_count_of(inner_entry).unwrap().trip_count, 4);
        // Inner blocks resolve to the inner header.
        assert_eq!(
            trips.header_for(BlockId { func: 0, block: 2 }),
            Some(inner_entry)
        );
        // The outer latch belongs to the outer loop only.
        assert_eq!(
            trips.header_for(BlockId { func: 0, block: 3 }),
            Some(outer_entry)
        );
    }

    #[test]
    fn test_data_dependent_break_still_retained() {
        // The second exiting edge compares a loaded value, not the
        // induction variable; the count comes from the header test.
        let src = r#"
fn @main() {
entry:
  %buf = alloca 8
  br header
header:
  %i = phi i32, [ 0, entry ], [ %inc, latch ]
  %c = icmp slt i32, %i, 5
  cbr %c, body, exit
body:
  %p = gep %buf, %i
  %v = load i8, %p
  %z = icmp eq i8, %v, 7
  cbr %z, exit, latch
latch:
  %inc = add i32, %i, 1
  br header
exit:
  ret
}
"#;
        let (module, trips) = analyze(src);
        let f = &module.functions[0];
        let header_entry = f.blocks[1].entry_inst().unwrap().id;
        assert_eq!(trips.trip_count_of(header_entry).unwrap().trip_count, 5);
    }

    #[test]
    fn test_ne_predicate_loop() {
        let src = r#"
fn @main() {
entry:
  br header
header:
  %i = phi i32, [ 0, entry ], [ %inc, body ]
  %c = icmp ne i32, %i, 4
  cbr %c, body, exit
body:
  %inc = add i32, %i, 1
  br header
exit:
  ret
}
"#;
        let (module, trips) = analyze(src);
        let f = &module.functions[0];
        let header_entry = f.blocks[1].entry_inst().unwrap().id;
        assert_eq!(trips.trip_count_of(header_entry).unwrap().trip_count, 4);
    }

    #[test]
    fn test_wrapping_progression_not_retained() {
        // Counting 10, 7, 4, 1, then wrapping below zero: the affine
        // model leaves the unsigned domain before `%i <= 0` ever holds.
        let src = r#"
fn @main() {
entry:
  br header
header:
  %i = phi i32, [ 10, entry ], [ %dec, body ]
  %c = icmp ugt i32, %i, 0
  cbr %c, body, exit
body:
  %dec = sub i32, %i, 3
  br header
exit:
  ret
}
"#;
        let (_, trips) = analyze(src);
        assert_eq!(trips.retained(), 0);
    }

    #[test]
    fn test_countdown_loop() {
        let src = r#"
fn @main() {
entry:
  br header
header:
  %i = phi i32, [ 10, entry ], [ %dec, body ]
  %c = icmp sgt i32, %i, 0
  cbr %c, body, exit
body:
  %dec = sub i32, %i, 2
  br header
exit:
  ret
}
"#;
        let (module, trips) = analyze(src);
        let f = &module.functions[0];
        let header_entry = f.blocks[1].entry_inst().unwrap().id;
        assert_eq!(trips.trip_count_of(header_entry).unwrap().trip_count, 5);
    }
}

//! Per-execution-state error store and per-opcode error propagation.

use crate::error_expr::{extract_low8, resize, zero8};
use crate::{AnalysisError, AnalysisResult};
use ahash::AHashMap;
use drift_expr::{expr_uid, pretty, ArrayCache, ArrayId, ArrayRef, BinOp, Expr, ExprRef};
use drift_ir::{Instruction, Module, Opcode, ValueId};
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::debug;

/// Error bookkeeping for one execution state.
///
/// Cloned wholesale when the state forks: the maps copy by value while
/// expression nodes and arrays stay shared.
#[derive(Debug, Clone, Default)]
pub struct ErrorState {
    /// Relative error of each SSA value, always 8 bits wide.
    value_error: AHashMap<ValueId, ExprRef>,
    /// Primary input array -> its companion error array. Entries are set
    /// on first use and stable afterwards; forked states share the same
    /// error-array identities.
    array_error_array: AHashMap<ArrayId, ArrayRef>,
    /// Error associated with the bytes most recently stored at each
    /// concrete address.
    stored_error: BTreeMap<u64, ExprRef>,
    /// Human-readable bound assertions, appended per `output_bound`.
    output: String,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored error of an SSA value, if one has been recorded.
    pub fn retrieve_error(&self, value: ValueId) -> Option<ExprRef> {
        self.value_error.get(&value).cloned()
    }

    pub fn set_value_error(&mut self, value: ValueId, error: ExprRef) {
        self.value_error.insert(value, error);
    }

    /// Error most recently stored at a concrete address.
    pub fn stored_error_at(&self, addr: u64) -> Option<ExprRef> {
        self.stored_error.get(&addr).cloned()
    }

    pub fn set_stored_error(&mut self, addr: u64, error: ExprRef) {
        self.stored_error.insert(addr, error);
    }

    /// The report buffer.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Compute the error expression associated with `value_expr`,
    /// memoizing against `owning` when supplied.
    ///
    /// Reads out of a primary input array yield a read of the companion
    /// error array at the same index; unknown shapes degrade to the sum
    /// of their children's errors.
    pub fn retrieve_error_for(
        &mut self,
        cache: &mut ArrayCache,
        value_expr: &ExprRef,
        owning: Option<ValueId>,
    ) -> ExprRef {
        if let Some(v) = owning {
            if let Some(e) = self.value_error.get(&v) {
                return e.clone();
            }
        }
        let ret = self.descend(cache, value_expr);
        if let Some(v) = owning {
            self.value_error.insert(v, ret.clone());
        }
        ret
    }

    fn descend(&mut self, cache: &mut ArrayCache, e: &ExprRef) -> ExprRef {
        match &**e {
            Expr::Read { array, index } => {
                let (array, index) = (array.clone(), index.clone());
                self.error_read(cache, &array, &index)
            }
            Expr::Concat { .. } => {
                if let Some((array, index)) = leftmost_read(e) {
                    self.error_read(cache, &array, &index)
                } else {
                    self.sum_of_kids(cache, e)
                }
            }
            Expr::SExt { child, .. } => {
                let child = child.clone();
                self.descend(cache, &child)
            }
            Expr::Binary {
                op: BinOp::Add,
                left,
                right,
            } => {
                let (left, right) = (left.clone(), right.clone());
                let l = self.descend(cache, &left);
                let r = self.descend(cache, &right);
                Expr::add(l, r)
            }
            Expr::Const { .. } => zero8(),
            _ => self.sum_of_kids(cache, e),
        }
    }

    fn sum_of_kids(&mut self, cache: &mut ArrayCache, e: &ExprRef) -> ExprRef {
        let mut ret = zero8();
        for kid in e.kids() {
            ret = Expr::add(self.descend(cache, &kid), ret);
        }
        ret
    }

    /// Read of the companion error array, creating it on first use with
    /// the `_unspecified_error_` prefix.
    fn error_read(&mut self, cache: &mut ArrayCache, array: &ArrayRef, index: &ExprRef) -> ExprRef {
        let id = ArrayId::of(array);
        let error_array = match self.array_error_array.get(&id) {
            Some(a) => a.clone(),
            None => {
                let name = format!("_unspecified_error_{}", array.name);
                let a = cache.create(&name, array.size);
                self.array_error_array.insert(id, a.clone());
                a
            }
        };
        Expr::read(error_array, index.clone())
    }

    /// Compute and record the error of `inst`'s result.
    ///
    /// `args` holds the operand value expressions in operand order, except
    /// for PHI where the interpreter passes the resolved incoming error
    /// directly, and Call where it passes the actual argument values.
    pub fn propagate(
        &mut self,
        cache: &mut ArrayCache,
        module: &Module,
        inst: &Instruction,
        result: &ExprRef,
        args: &[ExprRef],
    ) -> AnalysisResult<ExprRef> {
        match inst.opcode {
            Opcode::Phi => {
                let error = args.first().cloned().unwrap_or_else(zero8);
                self.value_error.insert(inst.id, error.clone());
                Ok(error)
            }

            Opcode::Call => {
                // Bind each formal of the callee to the error of the
                // caller's argument; the call site's own error is zero.
                if let Some((_, callee)) = inst.callee().and_then(|n| module.function(n)) {
                    let params: Vec<ValueId> = callee.params.iter().map(|p| p.id).collect();
                    for (i, param) in params.into_iter().enumerate() {
                        if let Some(arg) = args.get(i) {
                            let owning = inst.call_args().get(i).and_then(|o| o.as_value());
                            let e = self.retrieve_error_for(cache, arg, owning);
                            self.value_error.insert(param, e);
                        }
                    }
                }
                let error = zero8();
                self.value_error.insert(inst.id, error.clone());
                Ok(error)
            }

            Opcode::Add | Opcode::FAdd | Opcode::Sub | Opcode::FSub => {
                let l_err = self.retrieve_error_for(cache, &args[0], inst.operands[0].as_value());
                let r_err = self.retrieve_error_for(cache, &args[1], inst.operands[1].as_value());
                let ext_l = resize(l_err, args[0].width());
                let ext_r = resize(r_err, args[1].width());
                let sum = Expr::add(
                    Expr::mul(ext_l, args[0].clone()),
                    Expr::mul(ext_r, args[1].clone()),
                );
                let out = if result.is_zero() {
                    extract_low8(result.clone())
                } else {
                    extract_low8(Expr::udiv(sum, result.clone()))
                };
                self.value_error.insert(inst.id, out.clone());
                Ok(out)
            }

            Opcode::Mul
            | Opcode::FMul
            | Opcode::UDiv
            | Opcode::FDiv
            | Opcode::SDiv => {
                let l_err = self.retrieve_error_for(cache, &args[0], inst.operands[0].as_value());
                let r_err = self.retrieve_error_for(cache, &args[1], inst.operands[1].as_value());
                let ext_l = resize(l_err, args[0].width());
                let ext_r = resize(r_err, args[1].width());
                let out = extract_low8(Expr::add(ext_l, ext_r));
                self.value_error.insert(inst.id, out.clone());
                Ok(out)
            }

            // Decisions are taken as exact.
            Opcode::Icmp(_) | Opcode::Fcmp(_) => Ok(zero8()),

            Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::URem
            | Opcode::SRem
            | Opcode::FRem => {
                let e0 = self.prior_error(inst.operands.first());
                let e1 = self.prior_error(inst.operands.get(1));
                let out = extract_low8(Expr::add(e0, e1));
                self.value_error.insert(inst.id, out.clone());
                Ok(out)
            }

            Opcode::Trunc
            | Opcode::ZExt
            | Opcode::SExt
            | Opcode::AShr
            | Opcode::LShr
            | Opcode::Shl
            | Opcode::FpExt
            | Opcode::FpTrunc
            | Opcode::FpToSi
            | Opcode::FpToUi
            | Opcode::SiToFp
            | Opcode::UiToFp
            | Opcode::PtrToInt
            | Opcode::IntToPtr
            | Opcode::BitCast
            | Opcode::Gep => {
                let mut error = self.prior_error(inst.operands.first());
                if error.width() > 8 {
                    error = extract_low8(error);
                }
                self.value_error.insert(inst.id, error.clone());
                Ok(error)
            }

            _ => Err(AnalysisError::UnhandledOpcode {
                mnemonic: inst.opcode.mnemonic(),
            }),
        }
    }

    /// Previously recorded error of an operand; zero when absent or when
    /// the operand is not an SSA value.
    fn prior_error(&self, operand: Option<&drift_ir::Operand>) -> ExprRef {
        operand
            .and_then(|o| o.as_value())
            .and_then(|v| self.value_error.get(&v).cloned())
            .unwrap_or_else(zero8)
    }

    /// Record the error of a store. The address must be a constant; the
    /// concrete-address invariant is load-bearing for the store map.
    pub fn execute_store(&mut self, address: &ExprRef, error: ExprRef) -> AnalysisResult<()> {
        match address.const_value() {
            Some(addr) => {
                self.stored_error.insert(addr, error);
                Ok(())
            }
            None => Err(AnalysisError::NonConstantAddress {
                address: pretty(address),
            }),
        }
    }

    /// Bind the error of a loaded value from the store map. A load from
    /// an address with no recorded error unbinds the value, so its error
    /// is re-derived from the loaded value's own shape on next use; a
    /// symbolic address degrades to zero.
    pub fn execute_load(&mut self, value: ValueId, address: &ExprRef) -> ExprRef {
        match address.const_value() {
            Some(addr) => match self.stored_error.get(&addr) {
                Some(e) => {
                    let e = e.clone();
                    self.value_error.insert(value, e.clone());
                    e
                }
                None => {
                    self.value_error.remove(&value);
                    zero8()
                }
            },
            None => {
                debug!(address = %pretty(address), "load through non-constant address, assuming zero error");
                zero8()
            }
        }
    }

    /// Append one bound assertion to the report buffer.
    ///
    /// `subject` is the SSA value whose error is being bounded (the first
    /// operand of the bounding call); a missing error degrades to zero.
    pub fn output_bound(
        &mut self,
        inst: &Instruction,
        func_name: Option<&str>,
        subject: Option<ValueId>,
        bound: f64,
    ) {
        let e = subject
            .and_then(|v| self.value_error.get(&v).cloned())
            .unwrap_or_else(zero8);
        let var = format!("__error__{}", expr_uid(&e));

        if !self.output.is_empty() {
            self.output.push_str("\n------------------------\n");
        }
        match &inst.dbg {
            Some(loc) => {
                let _ = write!(
                    self.output,
                    "Line {} of {}/{}",
                    loc.line, loc.dir, loc.file
                );
                if let Some(f) = func_name {
                    let _ = write!(self.output, " ({})", f);
                }
                self.output.push_str(": ");
            }
            None => {
                if let Some(f) = func_name {
                    let _ = write!(self.output, "{}: ", f);
                }
            }
        }
        let _ = writeln!(
            self.output,
            "{var} == ({}) && ({var} <= {bound}) && ({var} >= -{bound})",
            pretty(&e)
        );
    }

    /// Take union-right-priority over the stored and per-value error maps
    /// of `other`; all other fields are untouched. Used when merging a
    /// closed loop's summarized effects into the caller state.
    pub fn overwrite_with(&mut self, other: &ErrorState) {
        for (addr, e) in &other.stored_error {
            self.stored_error.insert(*addr, e.clone());
        }
        for (v, e) in &other.value_error {
            self.value_error.insert(*v, e.clone());
        }
    }
}

/// Left-most read leaf of a concat chain, if any.
fn leftmost_read(e: &ExprRef) -> Option<(ArrayRef, ExprRef)> {
    let mut cur = e.clone();
    loop {
        match &*cur {
            Expr::Concat { lo, .. } => {
                let lo = lo.clone();
                cur = lo;
            }
            Expr::Read { array, index } => return Some((array.clone(), index.clone())),
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_ir::parse_module;

    fn arith_module() -> Module {
        parse_module(
            r#"
fn @main() {
entry:
  %buf = alloca 4
  %x0 = load i8, %buf
  %x1 = load i8, %buf
  %y = add i8, %x0, %x1
  %z = mul i8, %x0, %x1
  %c = icmp ult i8, %x0, %x1
  %w = and i8, %x0, %x1
  %e = zext i32, %x0
  ret
}
"#,
        )
        .unwrap()
    }

    fn read_expr(cache: &mut ArrayCache, name: &str, idx: u64) -> ExprRef {
        let arr = cache.create(name, 4);
        Expr::read(arr, Expr::constant(32, idx))
    }

    #[test]
    fn test_retrieve_const_is_zero() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let e = st.retrieve_error_for(&mut cache, &Expr::constant(32, 7), None);
        assert!(e.is_zero());
        assert_eq!(e.width(), 8);
    }

    #[test]
    fn test_retrieve_read_creates_error_array() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let r = read_expr(&mut cache, "x", 1);
        let e = st.retrieve_error_for(&mut cache, &r, None);
        match &*e {
            Expr::Read { array, index } => {
                assert_eq!(array.name, "_unspecified_error_x");
                assert_eq!(index.const_value(), Some(1));
            }
            other => panic!("expected error read, got {:?}", other),
        }
        assert!(cache.get("_unspecified_error_x").is_some());
    }

    #[test]
    fn test_retrieve_memoizes_and_is_idempotent() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let r = read_expr(&mut cache, "x", 0);
        let owner = ValueId(42);
        let e1 = st.retrieve_error_for(&mut cache, &r, Some(owner));
        let created = cache.len();
        let e2 = st.retrieve_error_for(&mut cache, &r, Some(owner));
        assert_eq!(e1, e2);
        assert_eq!(cache.len(), created);
        assert_eq!(st.retrieve_error(owner), Some(e1));
    }

    #[test]
    fn test_retrieve_concat_uses_leftmost_leaf() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let lo = read_expr(&mut cache, "x", 2);
        let hi = read_expr(&mut cache, "x", 3);
        let concat = Expr::concat(lo, hi);
        let e = st.retrieve_error_for(&mut cache, &concat, None);
        match &*e {
            Expr::Read { array, index } => {
                assert_eq!(array.name, "_unspecified_error_x");
                assert_eq!(index.const_value(), Some(2));
            }
            other => panic!("expected error read, got {:?}", other),
        }
    }

    #[test]
    fn test_retrieve_add_sums_children() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let sum = Expr::add(
            read_expr(&mut cache, "x", 0),
            read_expr(&mut cache, "x", 1),
        );
        let e = st.retrieve_error_for(&mut cache, &sum, None);
        assert_eq!(
            pretty(&e),
            "(Read(_unspecified_error_x, 0) + Read(_unspecified_error_x, 1))"
        );
    }

    #[test]
    fn test_propagate_add_divides_by_result() {
        let module = arith_module();
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let f = &module.functions[0];
        let add = &f.blocks[0].insts[3];
        let a0 = read_expr(&mut cache, "x", 0);
        let a1 = read_expr(&mut cache, "x", 1);
        let result = Expr::add(a0.clone(), a1.clone());
        let e = st
            .propagate(&mut cache, &module, add, &result, &[a0, a1])
            .unwrap();
        assert_eq!(e.width(), 8);
        let text = pretty(&e);
        assert!(text.contains("Read(_unspecified_error_x, 0)"), "{text}");
        assert!(text.contains("Read(_unspecified_error_x, 1)"), "{text}");
        assert!(text.contains('/'), "{text}");
        assert_eq!(st.retrieve_error(add.id), Some(e));
    }

    #[test]
    fn test_propagate_add_zero_result_is_exact() {
        let module = arith_module();
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let add = &module.functions[0].blocks[0].insts[3];
        let a0 = Expr::constant(8, 0);
        let a1 = Expr::constant(8, 0);
        let result = Expr::constant(8, 0);
        let e = st
            .propagate(&mut cache, &module, add, &result, &[a0, a1])
            .unwrap();
        assert!(e.is_zero());
        assert_eq!(e.width(), 8);
    }

    #[test]
    fn test_propagate_mul_sums_operand_errors() {
        let module = arith_module();
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let mul = &module.functions[0].blocks[0].insts[4];
        let a0 = read_expr(&mut cache, "x", 0);
        let a1 = read_expr(&mut cache, "x", 1);
        let result = Expr::mul(a0.clone(), a1.clone());
        let e = st
            .propagate(&mut cache, &module, mul, &result, &[a0, a1])
            .unwrap();
        assert_eq!(e.width(), 8);
        assert_eq!(
            pretty(&e),
            "(Read(_unspecified_error_x, 0) + Read(_unspecified_error_x, 1))"
        );
    }

    #[test]
    fn test_propagate_compare_is_exact_and_unrecorded() {
        let module = arith_module();
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let cmp = &module.functions[0].blocks[0].insts[5];
        let a0 = read_expr(&mut cache, "x", 0);
        let a1 = read_expr(&mut cache, "x", 1);
        let result = Expr::cmp(drift_expr::CmpPred::Ult, a0.clone(), a1.clone());
        let e = st
            .propagate(&mut cache, &module, cmp, &result, &[a0, a1])
            .unwrap();
        assert!(e.is_zero());
        assert_eq!(st.retrieve_error(cmp.id), None);
    }

    #[test]
    fn test_propagate_bitwise_uses_prior_errors() {
        let module = arith_module();
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let f = &module.functions[0];
        let and = &f.blocks[0].insts[6];
        let x0 = f.blocks[0].insts[1].id;
        let err = read_expr(&mut cache, "_unspecified_error_x", 0);
        st.set_value_error(x0, err.clone());
        let a0 = read_expr(&mut cache, "x", 0);
        let a1 = read_expr(&mut cache, "x", 1);
        let result = Expr::constant(8, 0);
        let e = st
            .propagate(&mut cache, &module, and, &result, &[a0, a1])
            .unwrap();
        // Right operand has no prior error; add identity keeps the left.
        assert_eq!(e, err);
    }

    #[test]
    fn test_propagate_cast_forwards_operand_error() {
        let module = arith_module();
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let f = &module.functions[0];
        let zext = &f.blocks[0].insts[7];
        let x0 = f.blocks[0].insts[1].id;
        let err = read_expr(&mut cache, "_unspecified_error_x", 0);
        st.set_value_error(x0, err.clone());
        let a0 = read_expr(&mut cache, "x", 0);
        let result = Expr::zext(a0.clone(), 32);
        let e = st
            .propagate(&mut cache, &module, zext, &result, &[a0])
            .unwrap();
        assert_eq!(e, err);
        assert_eq!(st.retrieve_error(zext.id), Some(err));
    }

    #[test]
    fn test_propagate_terminator_is_unhandled() {
        let module = arith_module();
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let ret = module.functions[0].blocks[0].insts.last().unwrap().clone();
        let err = st
            .propagate(&mut cache, &module, &ret, &Expr::constant(1, 0), &[])
            .unwrap_err();
        assert!(matches!(err, AnalysisError::UnhandledOpcode { .. }));
    }

    #[test]
    fn test_store_load_round_trip() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let e = read_expr(&mut cache, "_unspecified_error_x", 0);
        let addr = Expr::constant(64, 0x1000);
        st.execute_store(&addr, e.clone()).unwrap();
        let v = ValueId(7);
        let loaded = st.execute_load(v, &addr);
        assert_eq!(loaded, e);
        assert_eq!(st.retrieve_error(v), Some(e));
    }

    #[test]
    fn test_load_without_store_unbinds_value() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let addr = Expr::constant(64, 0x2000);
        let v = ValueId(8);
        // A stale memo from an earlier iteration is dropped.
        st.set_value_error(v, read_expr(&mut cache, "_unspecified_error_x", 0));
        let loaded = st.execute_load(v, &addr);
        assert!(loaded.is_zero());
        assert_eq!(st.retrieve_error(v), None);
    }

    #[test]
    fn test_store_non_constant_address_fails() {
        let mut st = ErrorState::new();
        let mut cache = ArrayCache::new();
        let addr = read_expr(&mut cache, "p", 0);
        let err = st.execute_store(&addr, zero8()).unwrap_err();
        assert!(matches!(err, AnalysisError::NonConstantAddress { .. }));
    }

    #[test]
    fn test_overwrite_with_right_priority() {
        let mut a = ErrorState::new();
        let mut b = ErrorState::new();
        let mut cache = ArrayCache::new();
        let ea = read_expr(&mut cache, "ea", 0);
        let eb = read_expr(&mut cache, "eb", 0);
        a.set_stored_error(0x10, ea.clone());
        a.set_value_error(ValueId(1), ea.clone());
        b.set_stored_error(0x10, eb.clone());
        b.set_stored_error(0x20, eb.clone());
        b.set_value_error(ValueId(1), eb.clone());
        a.overwrite_with(&b);
        assert_eq!(a.stored_error_at(0x10), Some(eb.clone()));
        assert_eq!(a.stored_error_at(0x20), Some(eb.clone()));
        assert_eq!(a.retrieve_error(ValueId(1)), Some(eb));
    }

    #[test]
    fn test_output_bound_format() {
        let module = parse_module(
            "fn @main() {\nentry:\n  %x = alloca 1\n  call @drift_bound(%x, 0.5) !dbg 7 t.c /src\n  ret\n}\n",
        )
        .unwrap();
        let f = &module.functions[0];
        let call = &f.blocks[0].insts[1];
        let mut st = ErrorState::new();
        st.output_bound(call, Some("main"), None, 0.5);
        let out = st.output().to_string();
        assert!(out.starts_with("Line 7 of /src/t.c (main): __error__"), "{out}");
        assert!(out.contains("== (0) && (__error__"), "{out}");
        assert!(out.contains("<= 0.5) && (__error__"), "{out}");
        assert!(out.contains(">= -0.5)"), "{out}");

        // A second entry is preceded by the separator line.
        st.output_bound(call, Some("main"), None, 0.5);
        let out = st.output();
        assert_eq!(out.matches("------------------------").count(), 1);
    }

    #[test]
    fn test_output_bound_missing_debug_degrades() {
        let module =
            parse_module("fn @main() {\nentry:\n  %x = alloca 1\n  call @drift_bound(%x, 1.0)\n  ret\n}\n")
                .unwrap();
        let call = &module.functions[0].blocks[0].insts[1];
        let mut st = ErrorState::new();
        st.output_bound(call, Some("main"), None, 1.0);
        assert!(st.output().starts_with("main: __error__"));
        let mut st2 = ErrorState::new();
        st2.output_bound(call, None, None, 1.0);
        assert!(st2.output().starts_with("__error__"));
    }
}

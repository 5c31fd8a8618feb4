//! Report-facing expression printer.
//!
//! Renders reads as `Read(name, index)`, arithmetic infix, and casts in
//! functional notation. The output is meant for the bound report, not for
//! re-parsing.

use crate::expr::{BinOp, CmpPred, Expr, ExprRef};
use std::fmt::Write;

/// Pretty print an expression to a string.
pub fn pretty(expr: &ExprRef) -> String {
    let mut printer = Printer::default();
    printer.print(expr);
    printer.out
}

#[derive(Default)]
struct Printer {
    out: String,
}

impl Printer {
    fn write(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn print(&mut self, expr: &ExprRef) {
        match &**expr {
            Expr::Const { value, .. } => {
                let _ = write!(self.out, "{}", value);
            }
            Expr::Read { array, index } => {
                self.write("Read(");
                self.write(&array.name);
                self.write(", ");
                self.print(index);
                self.write(")");
            }
            Expr::Concat { lo, hi } => {
                self.write("Concat(");
                self.print(lo);
                self.write(", ");
                self.print(hi);
                self.write(")");
            }
            Expr::Extract {
                child,
                offset,
                width,
            } => {
                self.write("Extract(");
                self.print(child);
                let _ = write!(self.out, ", {}, {})", offset, width);
            }
            Expr::ZExt { child, width } => {
                self.write("ZExt(");
                self.print(child);
                let _ = write!(self.out, ", {})", width);
            }
            Expr::SExt { child, width } => {
                self.write("SExt(");
                self.print(child);
                let _ = write!(self.out, ", {})", width);
            }
            Expr::Binary { op, left, right } => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::UDiv => "/",
                };
                self.write("(");
                self.print(left);
                self.write(" ");
                self.write(sym);
                self.write(" ");
                self.print(right);
                self.write(")");
            }
            Expr::Cmp { pred, left, right } => {
                let name = match pred {
                    CmpPred::Eq => "Eq",
                    CmpPred::Ne => "Ne",
                    CmpPred::Ult => "Ult",
                    CmpPred::Ule => "Ule",
                    CmpPred::Ugt => "Ugt",
                    CmpPred::Uge => "Uge",
                    CmpPred::Slt => "Slt",
                    CmpPred::Sle => "Sle",
                    CmpPred::Sgt => "Sgt",
                    CmpPred::Sge => "Sge",
                };
                self.write(name);
                self.write("(");
                self.print(left);
                self.write(", ");
                self.print(right);
                self.write(")");
            }
        }
    }
}

//! Symbolic expression library for the drift analyzer.
//!
//! Expressions form an immutable, `Arc`-shared DAG over a small closed set
//! of node shapes: constants, reads from named symbolic byte arrays,
//! concatenations, extracts, extensions, the four arithmetic operators and
//! integer compares. Every node carries an explicit bit-width.

mod array;
mod expr;
mod pretty;

pub use array::{Array, ArrayCache, ArrayId, ArrayRef};
pub use expr::{expr_uid, BinOp, CmpPred, Expr, ExprRef};
pub use pretty::pretty;

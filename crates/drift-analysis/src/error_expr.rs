//! Conventions for building error expressions.
//!
//! Error terms are always 8 bits wide. Arithmetic that needs wider
//! intermediates zero-extends its inputs, then the result is re-extracted
//! at the low end.

use drift_expr::{ArrayRef, Expr, ExprRef};

/// Width of every error expression.
pub const ERROR_WIDTH: u32 = 8;

/// The zero error.
pub fn zero8() -> ExprRef {
    Expr::constant(ERROR_WIDTH, 0)
}

/// Bring an expression to exactly `width` bits: zero-extend if narrower,
/// extract the low bits if wider.
pub fn resize(e: ExprRef, width: u32) -> ExprRef {
    let w = e.width();
    if w < width {
        Expr::zext(e, width)
    } else if w > width {
        Expr::extract(e, 0, width)
    } else {
        e
    }
}

/// Re-extract an expression to the error width.
pub fn extract_low8(e: ExprRef) -> ExprRef {
    resize(e, ERROR_WIDTH)
}

/// Closed-form loop-error extrapolation over `k` iterations: the error
/// per iteration is modeled linearly between the two observed iterations,
/// `e_init + (k - 1) * (e_end - e_init)`.
pub fn extrapolate(k: i64, e_init: &ExprRef, e_end: &ExprRef) -> ExprRef {
    let init64 = resize(e_init.clone(), 64);
    let end64 = resize(e_end.clone(), 64);
    let delta = Expr::sub(end64, init64.clone());
    let scaled = Expr::mul(Expr::constant(64, (k - 1) as u64), delta);
    extract_low8(Expr::add(init64, scaled))
}

/// The value of a whole fresh array as one expression of the requested
/// width: a low-first concatenation of its bytes, re-extracted when the
/// width is not a multiple of 8.
pub fn array_value(array: &ArrayRef, width: u32) -> ExprRef {
    let bytes = array.size.max(1);
    let mut e = Expr::read(array.clone(), Expr::constant(32, 0));
    for i in 1..bytes {
        e = Expr::concat(e, Expr::read(array.clone(), Expr::constant(32, i)));
    }
    resize(e, width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_expr::ArrayCache;

    #[test]
    fn test_zero8_width() {
        assert_eq!(zero8().width(), 8);
        assert!(zero8().is_zero());
    }

    #[test]
    fn test_resize_both_directions() {
        let mut cache = ArrayCache::new();
        let arr = cache.create("x", 4);
        let r = Expr::read(arr, Expr::constant(32, 0));
        assert_eq!(resize(r.clone(), 32).width(), 32);
        assert_eq!(resize(resize(r.clone(), 32), 8).width(), 8);
        assert_eq!(resize(r.clone(), 8), r);
    }

    #[test]
    fn test_extrapolate_of_zero_is_zero() {
        let e = extrapolate(5, &zero8(), &zero8());
        assert!(e.is_zero());
        assert_eq!(e.width(), 8);
    }

    #[test]
    fn test_extrapolate_width_and_shape() {
        let mut cache = ArrayCache::new();
        let arr = cache.create("_unspecified_error_x", 4);
        let e1 = Expr::read(arr, Expr::constant(32, 0));
        let out = extrapolate(3, &zero8(), &e1);
        assert_eq!(out.width(), 8);
        // Same inputs, same structure.
        let again = extrapolate(3, &zero8(), &e1);
        assert_eq!(out, again);
    }

    #[test]
    fn test_array_value_widths() {
        let mut cache = ArrayCache::new();
        let a1 = cache.create("f1", 1);
        assert_eq!(array_value(&a1, 8).width(), 8);
        assert_eq!(array_value(&a1, 1).width(), 1);
        let a4 = cache.create("f4", 4);
        assert_eq!(array_value(&a4, 32).width(), 32);
    }
}

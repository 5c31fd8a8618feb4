//! Byte-granular memory with a symbolic shadow per byte.

use drift_analysis::error_expr::resize;
use drift_expr::{ArrayRef, Expr, ExprRef};
use std::collections::BTreeMap;

fn mask(width: u32, value: u64) -> u64 {
    if width >= 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

#[derive(Debug, Clone)]
struct ByteCell {
    conc: u8,
    /// Symbolic shadow of this byte, width 8; absent for purely concrete
    /// content.
    sym: Option<ExprRef>,
}

/// Flat memory: concrete bytes plus optional symbolic shadows, with bump
/// allocation for `alloca`.
#[derive(Debug, Clone)]
pub struct Memory {
    bytes: BTreeMap<u64, ByteCell>,
    next_alloc: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            bytes: BTreeMap::new(),
            next_alloc: 0x1000,
        }
    }

    /// Reserve `size` zero-initialized bytes, 8-byte aligned.
    pub fn allocate(&mut self, size: u64) -> u64 {
        let addr = self.next_alloc;
        self.next_alloc += (size.max(1) + 7) & !7;
        for i in 0..size {
            self.bytes.insert(addr + i, ByteCell { conc: 0, sym: None });
        }
        addr
    }

    /// Store a value: concrete bytes little-endian, symbolic shadow per
    /// byte when the value is not a constant.
    pub fn store(&mut self, addr: u64, width: u32, conc: u64, sym: &ExprRef) {
        let n = ((width + 7) / 8) as u64;
        let symbolic = sym.const_value().is_none();
        for i in 0..n {
            let byte = (conc >> (8 * i)) as u8;
            let shadow = if symbolic {
                Some(Expr::extract(sym.clone(), (8 * i) as u32, 8))
            } else {
                None
            };
            self.bytes.insert(
                addr + i,
                ByteCell {
                    conc: byte,
                    sym: shadow,
                },
            );
        }
    }

    /// Load `width` bits. Returns the concrete value and, when any byte
    /// carries a shadow, the composed symbolic value (low byte first).
    pub fn load(&self, addr: u64, width: u32) -> (u64, Option<ExprRef>) {
        let n = ((width + 7) / 8) as u64;
        let mut conc: u64 = 0;
        let mut any_sym = false;
        for i in 0..n {
            if let Some(cell) = self.bytes.get(&(addr + i)) {
                conc |= (cell.conc as u64) << (8 * i);
                any_sym |= cell.sym.is_some();
            }
        }
        let sym = if any_sym {
            let mut composed: Option<ExprRef> = None;
            for i in 0..n {
                let byte_sym = match self.bytes.get(&(addr + i)) {
                    Some(ByteCell { sym: Some(s), .. }) => s.clone(),
                    Some(ByteCell { conc, .. }) => Expr::constant(8, *conc as u64),
                    None => Expr::constant(8, 0),
                };
                composed = Some(match composed {
                    None => byte_sym,
                    Some(acc) => Expr::concat(acc, byte_sym),
                });
            }
            composed.map(|e| resize(e, width))
        } else {
            None
        };
        (mask(width, conc), sym)
    }

    /// Overwrite the symbolic shadow at `addr` with a new value, leaving
    /// the concrete bytes as they are. Used when a closed loop rebinds a
    /// written location to a fresh symbol.
    pub fn write_expr(&mut self, addr: u64, value: &ExprRef) {
        let n = ((value.width() + 7) / 8) as u64;
        for i in 0..n {
            let shadow = Expr::extract(value.clone(), (8 * i) as u32, 8);
            let cell = self
                .bytes
                .entry(addr + i)
                .or_insert(ByteCell { conc: 0, sym: None });
            cell.sym = Some(shadow);
        }
    }

    /// Mark a buffer as a named symbolic input: every byte reads out of
    /// the given array.
    pub fn set_symbolic(&mut self, addr: u64, array: &ArrayRef) {
        for i in 0..array.size {
            self.bytes.insert(
                addr + i,
                ByteCell {
                    conc: 0,
                    sym: Some(Expr::read(array.clone(), Expr::constant(32, i))),
                },
            );
        }
    }
}

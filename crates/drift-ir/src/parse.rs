//! Line-oriented parser for the textual IR syntax.
//!
//! ```text
//! fn @main() {
//! entry:
//!   %buf = alloca 4
//!   call @drift_symbolic(%buf, 4, "x")
//!   %x0 = load i8, %buf
//!   %p = gep %buf, 1
//!   %x1 = load i8, %p
//!   %y = add i8, %x0, %x1 !dbg 3 sum.c /src
//!   call @drift_bound(%y, 1e-6)
//!   ret
//! }
//! ```
//!
//! Comments start with `#` or `;`. Block labels are bare identifiers
//! followed by a colon; block 0 is the function entry.

use crate::ir::{
    Block, DebugLoc, FcmpPred, Function, Instruction, Module, Opcode, Operand, Param, ValueId,
};
use drift_expr::CmpPred;
use smallvec::SmallVec;
use std::collections::HashMap;
use thiserror::Error;

/// Parse error with the 1-based source line.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: unexpected token `{found}`")]
    Unexpected { line: usize, found: String },

    #[error("line {line}: unknown opcode `{mnemonic}`")]
    UnknownOpcode { line: usize, mnemonic: String },

    #[error("line {line}: unknown type `{ty}`")]
    UnknownType { line: usize, ty: String },

    #[error("line {line}: unknown value `%{name}`")]
    UnknownValue { line: usize, name: String },

    #[error("line {line}: unknown label `{label}`")]
    UnknownLabel { line: usize, label: String },

    #[error("line {line}: malformed instruction")]
    Malformed { line: usize },

    #[error("line {line}: statement outside function")]
    OutsideFunction { line: usize },

    #[error("unterminated function `{name}`")]
    UnterminatedFunction { name: String },
}

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Int(i64),
    Float(f64),
    Str(String),
    Punct(char),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Word(w) => w.clone(),
            Tok::Int(n) => n.to_string(),
            Tok::Float(x) => x.to_string(),
            Tok::Str(s) => format!("\"{}\"", s),
            Tok::Punct(c) => c.to_string(),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '%' | '@' | '!' | '-')
}

fn tokenize(line: usize, text: &str) -> ParseResult<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '#' | ';' => break,
            ',' | '(' | ')' | '[' | ']' | '=' | ':' | '{' | '}' => {
                chars.next();
                toks.push(Tok::Punct(c));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, ch)) => s.push(ch),
                        None => {
                            return Err(ParseError::Unexpected {
                                line,
                                found: "\"".to_string(),
                            })
                        }
                    }
                }
                toks.push(Tok::Str(s));
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let mut end = start;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch.is_ascii_digit()
                        || matches!(ch, '.' | 'e' | 'E' | 'x')
                        || (ch == '-' && text[start..i].ends_with(['e', 'E']))
                        || (ch == '+' && text[start..i].ends_with(['e', 'E']))
                        || (i == start && ch == '-')
                    {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let lit = &text[start..end];
                if let Some(hex) = lit.strip_prefix("0x") {
                    let v = u64::from_str_radix(hex, 16).map_err(|_| ParseError::Unexpected {
                        line,
                        found: lit.to_string(),
                    })?;
                    toks.push(Tok::Int(v as i64));
                } else if lit.contains(['.', 'e', 'E']) {
                    let v: f64 = lit.parse().map_err(|_| ParseError::Unexpected {
                        line,
                        found: lit.to_string(),
                    })?;
                    toks.push(Tok::Float(v));
                } else {
                    let v: i64 = lit.parse().map_err(|_| ParseError::Unexpected {
                        line,
                        found: lit.to_string(),
                    })?;
                    toks.push(Tok::Int(v));
                }
            }
            _ if is_word_char(c) => {
                let mut end = start;
                while let Some(&(i, ch)) = chars.peek() {
                    if is_word_char(ch) {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Word(text[start..end].to_string()));
            }
            _ => {
                return Err(ParseError::Unexpected {
                    line,
                    found: c.to_string(),
                })
            }
        }
    }
    Ok(toks)
}

/// Width in bits of a type name; floats map onto their bit patterns and
/// `ptr` is 64 bits.
fn type_width(line: usize, ty: &str) -> ParseResult<u32> {
    match ty {
        "i1" => Ok(1),
        "i8" => Ok(8),
        "i16" => Ok(16),
        "i32" => Ok(32),
        "i64" => Ok(64),
        "f32" => Ok(32),
        "f64" => Ok(64),
        "ptr" => Ok(64),
        _ => Err(ParseError::UnknownType {
            line,
            ty: ty.to_string(),
        }),
    }
}

fn icmp_pred(line: usize, word: &str) -> ParseResult<CmpPred> {
    match word {
        "eq" => Ok(CmpPred::Eq),
        "ne" => Ok(CmpPred::Ne),
        "ult" => Ok(CmpPred::Ult),
        "ule" => Ok(CmpPred::Ule),
        "ugt" => Ok(CmpPred::Ugt),
        "uge" => Ok(CmpPred::Uge),
        "slt" => Ok(CmpPred::Slt),
        "sle" => Ok(CmpPred::Sle),
        "sgt" => Ok(CmpPred::Sgt),
        "sge" => Ok(CmpPred::Sge),
        _ => Err(ParseError::Unexpected {
            line,
            found: word.to_string(),
        }),
    }
}

fn fcmp_pred(line: usize, word: &str) -> ParseResult<FcmpPred> {
    match word {
        "oeq" => Ok(FcmpPred::Oeq),
        "one" => Ok(FcmpPred::One),
        "olt" => Ok(FcmpPred::Olt),
        "ole" => Ok(FcmpPred::Ole),
        "ogt" => Ok(FcmpPred::Ogt),
        "oge" => Ok(FcmpPred::Oge),
        _ => Err(ParseError::Unexpected {
            line,
            found: word.to_string(),
        }),
    }
}

fn plain_opcode(mnemonic: &str) -> Option<Opcode> {
    Some(match mnemonic {
        "add" => Opcode::Add,
        "sub" => Opcode::Sub,
        "mul" => Opcode::Mul,
        "udiv" => Opcode::UDiv,
        "sdiv" => Opcode::SDiv,
        "urem" => Opcode::URem,
        "srem" => Opcode::SRem,
        "fadd" => Opcode::FAdd,
        "fsub" => Opcode::FSub,
        "fmul" => Opcode::FMul,
        "fdiv" => Opcode::FDiv,
        "frem" => Opcode::FRem,
        "and" => Opcode::And,
        "or" => Opcode::Or,
        "xor" => Opcode::Xor,
        "shl" => Opcode::Shl,
        "lshr" => Opcode::LShr,
        "ashr" => Opcode::AShr,
        "trunc" => Opcode::Trunc,
        "zext" => Opcode::ZExt,
        "sext" => Opcode::SExt,
        "fpext" => Opcode::FpExt,
        "fptrunc" => Opcode::FpTrunc,
        "fptosi" => Opcode::FpToSi,
        "fptoui" => Opcode::FpToUi,
        "sitofp" => Opcode::SiToFp,
        "uitofp" => Opcode::UiToFp,
        "ptrtoint" => Opcode::PtrToInt,
        "inttoptr" => Opcode::IntToPtr,
        "bitcast" => Opcode::BitCast,
        _ => return None,
    })
}

/// Cursor over one line of tokens.
struct Cursor<'a> {
    line: usize,
    toks: &'a [Tok],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: usize, toks: &'a [Tok]) -> Self {
        Self { line, toks, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> ParseResult<&'a Tok> {
        let t = self.toks.get(self.pos).ok_or(ParseError::Malformed {
            line: self.line,
        })?;
        self.pos += 1;
        Ok(t)
    }

    fn expect_punct(&mut self, c: char) -> ParseResult<()> {
        match self.next()? {
            Tok::Punct(p) if *p == c => Ok(()),
            t => Err(ParseError::Unexpected {
                line: self.line,
                found: t.describe(),
            }),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.peek(), Some(Tok::Punct(p)) if *p == c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn word(&mut self) -> ParseResult<&'a str> {
        match self.next()? {
            Tok::Word(w) => Ok(w.as_str()),
            t => Err(ParseError::Unexpected {
                line: self.line,
                found: t.describe(),
            }),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }
}

/// Per-function parse context: name resolution for values and labels.
struct FuncCtx {
    values: HashMap<String, ValueId>,
    labels: HashMap<String, u32>,
}

struct ModuleBuilder {
    next_id: u32,
    value_widths: Vec<u32>,
}

impl ModuleBuilder {
    fn alloc(&mut self) -> ValueId {
        let id = ValueId(self.next_id);
        self.next_id += 1;
        self.value_widths.push(0);
        id
    }

    fn set_width(&mut self, id: ValueId, width: u32) {
        self.value_widths[id.0 as usize] = width;
    }
}

/// Parse a whole module from source text.
pub fn parse_module(src: &str) -> ParseResult<Module> {
    let mut builder = ModuleBuilder {
        next_id: 0,
        value_widths: Vec::new(),
    };
    let mut functions = Vec::new();

    // Group source lines into functions.
    let mut current: Option<(String, Vec<Param>, FuncCtx, Vec<(usize, Vec<Tok>)>)> = None;
    for (idx, raw) in src.lines().enumerate() {
        let line = idx + 1;
        let toks = tokenize(line, raw)?;
        if toks.is_empty() {
            continue;
        }
        if matches!(&toks[0], Tok::Word(w) if w == "fn") {
            let mut cur = Cursor::new(line, &toks);
            cur.next()?; // fn
            let name = cur.word()?;
            let name = name.strip_prefix('@').unwrap_or(name).to_string();
            cur.expect_punct('(')?;
            let mut params = Vec::new();
            let mut ctx = FuncCtx {
                values: HashMap::new(),
                labels: HashMap::new(),
            };
            while !cur.eat_punct(')') {
                let pname = cur.word()?;
                let pname = pname
                    .strip_prefix('%')
                    .ok_or(ParseError::Malformed { line })?
                    .to_string();
                cur.expect_punct(':')?;
                let width = type_width(line, cur.word()?)?;
                let id = builder.alloc();
                builder.set_width(id, width);
                ctx.values.insert(pname.clone(), id);
                params.push(Param {
                    id,
                    name: pname,
                    width,
                });
                cur.eat_punct(',');
            }
            cur.expect_punct('{')?;
            current = Some((name, params, ctx, Vec::new()));
            continue;
        }
        if matches!(&toks[0], Tok::Punct('}')) {
            let (name, params, mut ctx, body) =
                current.take().ok_or(ParseError::OutsideFunction { line })?;
            let blocks = build_function(&mut builder, &mut ctx, &body)?;
            functions.push(Function {
                name,
                params,
                blocks,
            });
            continue;
        }
        match current.as_mut() {
            Some((_, _, ctx, body)) => {
                // Pre-register labels and value definitions so later
                // blocks and PHIs can reference them.
                if toks.len() == 2 && matches!(&toks[1], Tok::Punct(':')) {
                    if let Tok::Word(label) = &toks[0] {
                        let next = ctx.labels.len() as u32;
                        ctx.labels.insert(label.clone(), next);
                    }
                } else if toks.len() >= 2 && matches!(&toks[1], Tok::Punct('=')) {
                    if let Tok::Word(w) = &toks[0] {
                        if let Some(vname) = w.strip_prefix('%') {
                            let id = builder.alloc();
                            ctx.values.insert(vname.to_string(), id);
                        }
                    }
                }
                body.push((line, toks));
            }
            None => return Err(ParseError::OutsideFunction { line }),
        }
    }
    if let Some((name, ..)) = current {
        return Err(ParseError::UnterminatedFunction { name });
    }

    Ok(Module {
        functions,
        value_widths: builder.value_widths,
    })
}

fn build_function(
    builder: &mut ModuleBuilder,
    ctx: &mut FuncCtx,
    body: &[(usize, Vec<Tok>)],
) -> ParseResult<Vec<Block>> {
    let mut blocks: Vec<Block> = Vec::new();
    for (line, toks) in body {
        let line = *line;
        if toks.len() == 2 && matches!(&toks[1], Tok::Punct(':')) {
            if let Tok::Word(label) = &toks[0] {
                blocks.push(Block {
                    name: label.clone(),
                    insts: Vec::new(),
                });
                continue;
            }
        }
        let block = blocks.last_mut().ok_or(ParseError::Malformed { line })?;
        let inst = parse_instruction(builder, ctx, line, toks)?;
        block.insts.push(inst);
    }
    Ok(blocks)
}

fn parse_instruction(
    builder: &mut ModuleBuilder,
    ctx: &FuncCtx,
    line: usize,
    toks: &[Tok],
) -> ParseResult<Instruction> {
    let mut cur = Cursor::new(line, toks);

    // Optional `%dst =` prefix; the id was pre-allocated.
    let mut dest: Option<(String, ValueId)> = None;
    if let Some(Tok::Word(w)) = cur.peek() {
        if let Some(vname) = w.strip_prefix('%') {
            if matches!(toks.get(1), Some(Tok::Punct('='))) {
                let id = *ctx.values.get(vname).ok_or_else(|| ParseError::UnknownValue {
                    line,
                    name: vname.to_string(),
                })?;
                dest = Some((vname.to_string(), id));
                cur.next()?;
                cur.next()?;
            }
        }
    }

    let mnemonic = cur.word()?.to_string();
    let mut operands: SmallVec<[Operand; 2]> = SmallVec::new();
    let (opcode, width): (Opcode, u32);

    match mnemonic.as_str() {
        "icmp" | "fcmp" => {
            let pred = cur.word()?;
            let opc = if mnemonic == "icmp" {
                Opcode::Icmp(icmp_pred(line, pred)?)
            } else {
                Opcode::Fcmp(fcmp_pred(line, pred)?)
            };
            let opw = type_width(line, cur.word()?)?;
            cur.expect_punct(',')?;
            operands.push(parse_operand(ctx, &mut cur, opw)?);
            cur.expect_punct(',')?;
            operands.push(parse_operand(ctx, &mut cur, opw)?);
            opcode = opc;
            width = 1;
        }
        "alloca" => {
            operands.push(parse_operand(ctx, &mut cur, 64)?);
            opcode = Opcode::Alloca;
            width = 64;
        }
        "load" => {
            let ty = type_width(line, cur.word()?)?;
            cur.expect_punct(',')?;
            operands.push(parse_operand(ctx, &mut cur, 64)?);
            opcode = Opcode::Load;
            width = ty;
        }
        "store" => {
            let ty = type_width(line, cur.word()?)?;
            cur.expect_punct(',')?;
            operands.push(parse_operand(ctx, &mut cur, ty)?);
            cur.expect_punct(',')?;
            operands.push(parse_operand(ctx, &mut cur, 64)?);
            opcode = Opcode::Store;
            width = 0;
        }
        "gep" => {
            operands.push(parse_operand(ctx, &mut cur, 64)?);
            cur.expect_punct(',')?;
            operands.push(parse_operand(ctx, &mut cur, 64)?);
            opcode = Opcode::Gep;
            width = 64;
        }
        "phi" => {
            let ty = type_width(line, cur.word()?)?;
            cur.expect_punct(',')?;
            while cur.eat_punct('[') {
                operands.push(parse_operand(ctx, &mut cur, ty)?);
                cur.expect_punct(',')?;
                let label = cur.word()?;
                let idx = *ctx.labels.get(label).ok_or_else(|| ParseError::UnknownLabel {
                    line,
                    label: label.to_string(),
                })?;
                operands.push(Operand::Block(idx));
                cur.expect_punct(']')?;
                cur.eat_punct(',');
            }
            opcode = Opcode::Phi;
            width = ty;
        }
        "call" => {
            let mut ty = 0;
            if let Some(Tok::Word(w)) = cur.peek() {
                if !w.starts_with('@') {
                    ty = type_width(line, cur.word()?)?;
                    cur.expect_punct(',')?;
                }
            }
            let callee = cur.word()?;
            let callee = callee.strip_prefix('@').unwrap_or(callee).to_string();
            operands.push(Operand::Func(callee));
            cur.expect_punct('(')?;
            while !cur.eat_punct(')') {
                operands.push(parse_operand(ctx, &mut cur, 64)?);
                cur.eat_punct(',');
            }
            opcode = Opcode::Call;
            width = ty;
        }
        "br" => {
            let label = cur.word()?;
            let idx = *ctx.labels.get(label).ok_or_else(|| ParseError::UnknownLabel {
                line,
                label: label.to_string(),
            })?;
            operands.push(Operand::Block(idx));
            opcode = Opcode::Br;
            width = 0;
        }
        "cbr" => {
            operands.push(parse_operand(ctx, &mut cur, 1)?);
            cur.expect_punct(',')?;
            for _ in 0..2 {
                let label = cur.word()?;
                let idx = *ctx.labels.get(label).ok_or_else(|| ParseError::UnknownLabel {
                    line,
                    label: label.to_string(),
                })?;
                operands.push(Operand::Block(idx));
                cur.eat_punct(',');
            }
            opcode = Opcode::CondBr;
            width = 0;
        }
        "ret" => {
            if !cur.at_end() && !matches!(cur.peek(), Some(Tok::Word(w)) if w == "!dbg") {
                operands.push(parse_operand(ctx, &mut cur, 64)?);
            }
            opcode = Opcode::Ret;
            width = 0;
        }
        _ => {
            let opc = plain_opcode(&mnemonic).ok_or_else(|| ParseError::UnknownOpcode {
                line,
                mnemonic: mnemonic.clone(),
            })?;
            let ty = type_width(line, cur.word()?)?;
            cur.expect_punct(',')?;
            operands.push(parse_operand(ctx, &mut cur, ty)?);
            if cur.eat_punct(',') {
                operands.push(parse_operand(ctx, &mut cur, ty)?);
            }
            opcode = opc;
            width = ty;
        }
    }

    // Optional trailing `!dbg LINE FILE DIR`.
    let mut dbg = None;
    if matches!(cur.peek(), Some(Tok::Word(w)) if w == "!dbg") {
        cur.next()?;
        let dline = match cur.next()? {
            Tok::Int(n) => *n as u32,
            t => {
                return Err(ParseError::Unexpected {
                    line,
                    found: t.describe(),
                })
            }
        };
        let file = cur.word()?.to_string();
        let dir = cur.word()?.to_string();
        dbg = Some(DebugLoc {
            line: dline,
            file,
            dir,
        });
    }

    let (name, id) = match dest {
        Some((n, id)) => {
            builder.set_width(id, width);
            (Some(n), id)
        }
        None => (None, builder.alloc()),
    };

    Ok(Instruction {
        id,
        name,
        opcode,
        width,
        operands,
        dbg,
    })
}

fn parse_operand(ctx: &FuncCtx, cur: &mut Cursor, width: u32) -> ParseResult<Operand> {
    let line = cur.line;
    match cur.next()? {
        Tok::Word(w) => {
            if let Some(vname) = w.strip_prefix('%') {
                let id = *ctx.values.get(vname).ok_or_else(|| ParseError::UnknownValue {
                    line,
                    name: vname.to_string(),
                })?;
                Ok(Operand::Value(id))
            } else {
                Err(ParseError::Unexpected {
                    line,
                    found: w.clone(),
                })
            }
        }
        Tok::Int(n) => Ok(Operand::Const {
            width,
            value: *n as u64,
        }),
        Tok::Float(x) => Ok(Operand::Float {
            width: if width == 32 { 32 } else { 64 },
            value: *x,
        }),
        Tok::Str(s) => Ok(Operand::Str(s.clone())),
        t => Err(ParseError::Unexpected {
            line,
            found: t.describe(),
        }),
    }
}

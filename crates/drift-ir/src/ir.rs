//! IR data model: modules, functions, blocks, instructions.

use drift_expr::CmpPred;
use smallvec::SmallVec;
use std::fmt;

/// Opaque handle for an SSA value (instruction result or parameter).
/// Ids are unique across a module; ordering is by identity only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A basic block, addressed by function and block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub func: u32,
    pub block: u32,
}

/// Float compare predicate (ordered comparisons only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcmpPred {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
}

/// Instruction opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    Icmp(CmpPred),
    Fcmp(FcmpPred),
    Trunc,
    ZExt,
    SExt,
    FpExt,
    FpTrunc,
    FpToSi,
    FpToUi,
    SiToFp,
    UiToFp,
    PtrToInt,
    IntToPtr,
    BitCast,
    Alloca,
    Load,
    Store,
    Gep,
    Phi,
    Call,
    Br,
    CondBr,
    Ret,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Br | Opcode::CondBr | Opcode::Ret)
    }

    pub fn is_phi(self) -> bool {
        matches!(self, Opcode::Phi)
    }

    /// Mnemonic used by the textual syntax and diagnostics.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::UDiv => "udiv",
            Opcode::SDiv => "sdiv",
            Opcode::URem => "urem",
            Opcode::SRem => "srem",
            Opcode::FAdd => "fadd",
            Opcode::FSub => "fsub",
            Opcode::FMul => "fmul",
            Opcode::FDiv => "fdiv",
            Opcode::FRem => "frem",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::LShr => "lshr",
            Opcode::AShr => "ashr",
            Opcode::Icmp(_) => "icmp",
            Opcode::Fcmp(_) => "fcmp",
            Opcode::Trunc => "trunc",
            Opcode::ZExt => "zext",
            Opcode::SExt => "sext",
            Opcode::FpExt => "fpext",
            Opcode::FpTrunc => "fptrunc",
            Opcode::FpToSi => "fptosi",
            Opcode::FpToUi => "fptoui",
            Opcode::SiToFp => "sitofp",
            Opcode::UiToFp => "uitofp",
            Opcode::PtrToInt => "ptrtoint",
            Opcode::IntToPtr => "inttoptr",
            Opcode::BitCast => "bitcast",
            Opcode::Alloca => "alloca",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Gep => "gep",
            Opcode::Phi => "phi",
            Opcode::Call => "call",
            Opcode::Br => "br",
            Opcode::CondBr => "cbr",
            Opcode::Ret => "ret",
        }
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Reference to an SSA value.
    Value(ValueId),
    /// Integer constant of the given width.
    Const { width: u32, value: u64 },
    /// Float constant (width 32 or 64).
    Float { width: u32, value: f64 },
    /// Block index within the enclosing function (branch targets, PHI
    /// incoming edges).
    Block(u32),
    /// Callee name.
    Func(String),
    /// String literal (symbolic input names).
    Str(String),
}

impl Operand {
    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<u32> {
        match self {
            Operand::Block(b) => Some(*b),
            _ => None,
        }
    }
}

/// Source location attached to an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLoc {
    pub line: u32,
    pub file: String,
    pub dir: String,
}

/// A single IR instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: ValueId,
    /// SSA result name from the source text, if the instruction produces
    /// a value.
    pub name: Option<String>,
    pub opcode: Opcode,
    /// Result width in bits; 0 for instructions that produce no value.
    pub width: u32,
    pub operands: SmallVec<[Operand; 2]>,
    pub dbg: Option<DebugLoc>,
}

impl Instruction {
    /// Incoming (value, predecessor block) pairs of a PHI. Operands are
    /// laid out as `[v0, Block(b0), v1, Block(b1), ...]`.
    pub fn phi_incoming(&self) -> impl Iterator<Item = (&Operand, u32)> {
        self.operands.chunks(2).filter_map(|pair| match pair {
            [value, Operand::Block(b)] => Some((value, *b)),
            _ => None,
        })
    }

    /// Callee name of a call instruction.
    pub fn callee(&self) -> Option<&str> {
        match self.operands.first() {
            Some(Operand::Func(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Argument operands of a call instruction.
    pub fn call_args(&self) -> &[Operand] {
        if self.opcode == Opcode::Call && !self.operands.is_empty() {
            &self.operands[1..]
        } else {
            &[]
        }
    }
}

/// Function parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub id: ValueId,
    pub name: String,
    pub width: u32,
}

/// A basic block: ordered instructions, terminator last.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Instruction>,
}

impl Block {
    /// Index of the entry instruction: the first non-PHI.
    pub fn entry_idx(&self) -> usize {
        self.insts
            .iter()
            .position(|i| !i.opcode.is_phi())
            .unwrap_or(0)
    }

    /// The entry instruction itself.
    pub fn entry_inst(&self) -> Option<&Instruction> {
        self.insts.get(self.entry_idx())
    }

    /// The block terminator.
    pub fn terminator(&self) -> Option<&Instruction> {
        self.insts.last().filter(|i| i.opcode.is_terminator())
    }
}

/// A function: parameters plus basic blocks, block 0 is the entry.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub blocks: Vec<Block>,
}

impl Function {
    /// Successor block indices of the given block.
    pub fn successors(&self, block: usize) -> SmallVec<[usize; 2]> {
        let mut out = SmallVec::new();
        if let Some(term) = self.blocks[block].terminator() {
            for op in &term.operands {
                if let Operand::Block(b) = op {
                    out.push(*b as usize);
                }
            }
        }
        out
    }

    /// Block index by label name.
    pub fn block_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }
}

/// A module: the unit of loading and analysis.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    /// Result width of every value id allocated in this module, indexed
    /// by id. Parameters and instructions alike.
    pub value_widths: Vec<u32>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<(usize, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.functions[id.func as usize].blocks[id.block as usize]
    }

    /// Result width of a value in bits.
    pub fn value_width(&self, id: ValueId) -> u32 {
        self.value_widths[id.0 as usize]
    }
}

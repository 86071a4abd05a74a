//! Instruction metadata, immediates and resolved (index-carrying) instructions.
//!
//! The instruction set is a static list of [`InstructionSpec`] records (see
//! `opcodes.rs`). Two read-only lookup tables, built on first use, map names
//! and opcodes to those records.

pub mod codec;
mod opcodes;

use std::collections::HashMap;
use std::fmt;

use fhex::ToHex;
use once_cell::sync::Lazy;

use crate::types::{format_types, RefType, ValueType};

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Opcode {
    Byte(u8),
    /// A prefix byte (`0xFC`, `0xFD`, `0xFE`) followed by a u32 sub-opcode.
    Prefixed(u8, u32),
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Opcode::Byte(b) => write!(f, "{:#04x}", b),
            Opcode::Prefixed(p, sub) => write!(f, "{:#04x} {}", p, sub),
        }
    }
}

pub const PREFIX_MISC: u8 = 0xFC;
pub const PREFIX_SIMD: u8 = 0xFD;
pub const PREFIX_ATOMIC: u8 = 0xFE;

pub fn is_prefix(byte: u8) -> bool {
    byte == PREFIX_MISC || byte == PREFIX_SIMD || byte == PREFIX_ATOMIC
}

/// The shape of an instruction's immediate operands, which selects its codec.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ImmediateKind {
    None,
    U32,
    I32,
    I64,
    F32,
    F64,
    U32Pair,
    /// Memory access; `natural` is the log2 of the access width in bytes.
    MemArg { natural: u32 },
    Block,
    If,
    BrTable,
    RefType,
    ValueTypes,
}

/// Operand-stack effect of an instruction, when it does not depend on its
/// operands.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum StackEffect {
    Fixed {
        params: &'static [ValueType],
        results: &'static [ValueType],
    },
    /// Computed by the builder from the instruction's operands.
    Dynamic,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct InstructionSpec {
    pub name: &'static str,
    pub opcode: Opcode,
    pub immediate: ImmediateKind,
    pub stack: StackEffect,
}

struct Registry {
    by_name: HashMap<&'static str, &'static InstructionSpec>,
    by_opcode: HashMap<Opcode, &'static InstructionSpec>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut by_name = HashMap::with_capacity(opcodes::INSTRUCTIONS.len());
    let mut by_opcode = HashMap::with_capacity(opcodes::INSTRUCTIONS.len());
    for spec in opcodes::INSTRUCTIONS {
        by_name.insert(spec.name, spec);
        by_opcode.insert(spec.opcode, spec);
    }
    Registry { by_name, by_opcode }
});

pub fn by_name(name: &str) -> Option<&'static InstructionSpec> {
    REGISTRY.by_name.get(name).copied()
}

pub fn by_opcode(opcode: Opcode) -> Option<&'static InstructionSpec> {
    REGISTRY.by_opcode.get(&opcode).copied()
}

/// `align` is the log2 of the alignment in bytes.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct MemArg {
    pub align: u32,
    pub offset: u32,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum BlockType {
    Empty,
    Value(ValueType),
    Index(u32),
}

/// Float immediates compare by bit pattern, so NaN constants equal
/// themselves and `-0.0` differs from `0.0`, matching the bytes they encode.
#[derive(Clone, Debug)]
pub enum Immediate {
    None,
    U32(u32),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    U32Pair(u32, u32),
    MemArg(MemArg),
    Block {
        block_type: BlockType,
        body: Vec<ResolvedInstruction>,
    },
    If {
        block_type: BlockType,
        then: Vec<ResolvedInstruction>,
        else_: Option<Vec<ResolvedInstruction>>,
    },
    BrTable {
        labels: Vec<u32>,
        default: u32,
    },
    RefType(RefType),
    ValueTypes(Vec<ValueType>),
}

impl PartialEq for Immediate {
    fn eq(&self, other: &Immediate) -> bool {
        match (self, other) {
            (Immediate::None, Immediate::None) => true,
            (Immediate::U32(a), Immediate::U32(b)) => a == b,
            (Immediate::I32(a), Immediate::I32(b)) => a == b,
            (Immediate::I64(a), Immediate::I64(b)) => a == b,
            (Immediate::F32(a), Immediate::F32(b)) => a.to_bits() == b.to_bits(),
            (Immediate::F64(a), Immediate::F64(b)) => a.to_bits() == b.to_bits(),
            (Immediate::U32Pair(a0, a1), Immediate::U32Pair(b0, b1)) => a0 == b0 && a1 == b1,
            (Immediate::MemArg(a), Immediate::MemArg(b)) => a == b,
            (
                Immediate::Block {
                    block_type: at,
                    body: ab,
                },
                Immediate::Block {
                    block_type: bt,
                    body: bb,
                },
            ) => at == bt && ab == bb,
            (
                Immediate::If {
                    block_type: at,
                    then: a_then,
                    else_: a_else,
                },
                Immediate::If {
                    block_type: bt,
                    then: b_then,
                    else_: b_else,
                },
            ) => at == bt && a_then == b_then && a_else == b_else,
            (
                Immediate::BrTable {
                    labels: al,
                    default: ad,
                },
                Immediate::BrTable {
                    labels: bl,
                    default: bd,
                },
            ) => al == bl && ad == bd,
            (Immediate::RefType(a), Immediate::RefType(b)) => a == b,
            (Immediate::ValueTypes(a), Immediate::ValueTypes(b)) => a == b,
            _ => false,
        }
    }
}

impl Immediate {
    pub fn kind_matches(&self, kind: ImmediateKind) -> bool {
        match (self, kind) {
            (Immediate::None, ImmediateKind::None)
            | (Immediate::U32(_), ImmediateKind::U32)
            | (Immediate::I32(_), ImmediateKind::I32)
            | (Immediate::I64(_), ImmediateKind::I64)
            | (Immediate::F32(_), ImmediateKind::F32)
            | (Immediate::F64(_), ImmediateKind::F64)
            | (Immediate::U32Pair(..), ImmediateKind::U32Pair)
            | (Immediate::MemArg(_), ImmediateKind::MemArg { .. })
            | (Immediate::Block { .. }, ImmediateKind::Block)
            | (Immediate::If { .. }, ImmediateKind::If)
            | (Immediate::BrTable { .. }, ImmediateKind::BrTable)
            | (Immediate::RefType(_), ImmediateKind::RefType)
            | (Immediate::ValueTypes(_), ImmediateKind::ValueTypes) => true,
            _ => false,
        }
    }
}

/// An instruction whose operands are all numeric indices, ready to encode.
#[derive(PartialEq, Clone, Debug)]
pub struct ResolvedInstruction {
    pub name: &'static str,
    pub immediate: Immediate,
}

impl ResolvedInstruction {
    pub fn new(name: &'static str, immediate: Immediate) -> ResolvedInstruction {
        ResolvedInstruction { name, immediate }
    }
}

fn fmt_body(f: &mut fmt::Formatter, body: &[ResolvedInstruction]) -> fmt::Result {
    for instr in body {
        write!(f, " {}", instr)?;
    }
    Ok(())
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Empty => Ok(()),
            BlockType::Value(t) => write!(f, " (result {})", t),
            BlockType::Index(idx) => write!(f, " (type {})", idx),
        }
    }
}

impl fmt::Display for ResolvedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = if self.name == "select_t" { "select" } else { self.name };
        write!(f, "{}", name)?;
        match &self.immediate {
            Immediate::None => Ok(()),
            Immediate::U32(v) => write!(f, " {}", v),
            Immediate::I32(v) => write!(f, " {}", v),
            Immediate::I64(v) => write!(f, " {}", v),
            Immediate::F32(v) => write!(f, " {}", v.to_hex()),
            Immediate::F64(v) => write!(f, " {}", v.to_hex()),
            Immediate::U32Pair(a, b) => write!(f, " {} {}", a, b),
            Immediate::MemArg(MemArg { align, offset }) => {
                if *offset != 0 {
                    write!(f, " offset={}", offset)?;
                }
                write!(f, " align={}", 1u64 << align)
            }
            Immediate::Block { block_type, body } => {
                write!(f, "{}", block_type)?;
                fmt_body(f, body)?;
                write!(f, " end")
            }
            Immediate::If { block_type, then, else_ } => {
                write!(f, "{}", block_type)?;
                fmt_body(f, then)?;
                if let Some(else_) = else_ {
                    write!(f, " else")?;
                    fmt_body(f, else_)?;
                }
                write!(f, " end")
            }
            Immediate::BrTable { labels, default } => {
                for label in labels {
                    write!(f, " {}", label)?;
                }
                write!(f, " {}", default)
            }
            Immediate::RefType(t) => match t {
                RefType::FuncRef => write!(f, " func"),
                RefType::ExternRef => write!(f, " extern"),
            },
            Immediate::ValueTypes(types) => write!(f, " (result {})", format_types(types)),
        }
    }
}

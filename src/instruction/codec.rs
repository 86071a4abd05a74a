//! Binary codec for resolved instructions and constant/function-body
//! expressions.
//!
//! Structured instructions (`block`, `loop`, `if`) carry their bodies inline,
//! so an expression decodes into a tree and re-encodes to the same bytes.

use super::{
    by_name, by_opcode, is_prefix, BlockType, Immediate, ImmediateKind, InstructionSpec, MemArg, Opcode,
    ResolvedInstruction,
};
use crate::binary::encoding::{
    read_f32, read_f64, read_vs32, read_vs33, read_vs64, read_vu32, write_f32, write_f64, write_vs32, write_vs64,
    write_vu32, BLOCK_TYPE_EMPTY, OP_ELSE, OP_END,
};
use crate::binary::{vec, Codec, CodecError, Reader, U32};
use crate::types::{RefTypeCodec, ValueType, ValueTypeCodec};

/// Deepest `block`/`loop`/`if` nesting the decoder accepts. Decoded bodies
/// form a tree, so unbounded input nesting would exhaust the call stack.
pub const MAX_NESTING: usize = 512;

pub struct BlockTypeCodec;

impl Codec<BlockType> for BlockTypeCodec {
    fn encode(&self, value: &BlockType, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match value {
            BlockType::Empty => buf.push(BLOCK_TYPE_EMPTY),
            BlockType::Value(t) => buf.push(t.wire_byte()),
            BlockType::Index(idx) => write_vs64(buf, *idx as i64),
        }
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<BlockType, CodecError> {
        let offset = reader.pos();
        match reader.peek_byte() {
            Some(BLOCK_TYPE_EMPTY) => {
                reader.read_byte()?;
                Ok(BlockType::Empty)
            }
            Some(byte) if ValueType::decode(byte).is_some() => Ok(BlockType::Value(ValueTypeCodec.decode(reader)?)),
            Some(_) => {
                let idx = read_vs33(reader)?;
                if idx < 0 {
                    return Err(CodecError::IntegerOutOfRange { offset, bits: 33 });
                }
                Ok(BlockType::Index(idx as u32))
            }
            None => Err(CodecError::UnexpectedEof { offset }),
        }
    }
}

fn encode_immediate(spec: &InstructionSpec, immediate: &Immediate, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    if !immediate.kind_matches(spec.immediate) {
        return Err(CodecError::ImmediateMismatch(spec.name.to_string()));
    }
    match immediate {
        Immediate::None => {}
        Immediate::U32(v) => write_vu32(buf, *v),
        Immediate::I32(v) => write_vs32(buf, *v),
        Immediate::I64(v) => write_vs64(buf, *v),
        Immediate::F32(v) => write_f32(buf, *v),
        Immediate::F64(v) => write_f64(buf, *v),
        Immediate::U32Pair(a, b) => {
            write_vu32(buf, *a);
            write_vu32(buf, *b);
        }
        Immediate::MemArg(memarg) => {
            check_alignment(spec, memarg)?;
            write_vu32(buf, memarg.align);
            write_vu32(buf, memarg.offset);
        }
        Immediate::Block { block_type, body } => {
            BlockTypeCodec.encode(block_type, buf)?;
            encode_body(body, buf)?;
            buf.push(OP_END);
        }
        Immediate::If { block_type, then, else_ } => {
            BlockTypeCodec.encode(block_type, buf)?;
            encode_body(then, buf)?;
            if let Some(else_) = else_ {
                buf.push(OP_ELSE);
                encode_body(else_, buf)?;
            }
            buf.push(OP_END);
        }
        Immediate::BrTable { labels, default } => {
            vec(U32).encode(labels, buf)?;
            write_vu32(buf, *default);
        }
        Immediate::RefType(t) => RefTypeCodec.encode(t, buf)?,
        Immediate::ValueTypes(types) => vec(ValueTypeCodec).encode(types, buf)?,
    }
    Ok(())
}

fn check_alignment(spec: &InstructionSpec, memarg: &MemArg) -> Result<(), CodecError> {
    if let ImmediateKind::MemArg { natural } = spec.immediate {
        if memarg.align > natural {
            return Err(CodecError::InvalidAlignment {
                name: spec.name.to_string(),
                align: memarg.align,
                natural,
            });
        }
    }
    Ok(())
}

fn enter_block(reader: &Reader<'_>, depth: usize) -> Result<usize, CodecError> {
    if depth >= MAX_NESTING {
        return Err(CodecError::NestingTooDeep {
            offset: reader.pos(),
            limit: MAX_NESTING,
        });
    }
    Ok(depth + 1)
}

fn decode_immediate(spec: &InstructionSpec, reader: &mut Reader<'_>, depth: usize) -> Result<Immediate, CodecError> {
    Ok(match spec.immediate {
        ImmediateKind::None => Immediate::None,
        ImmediateKind::U32 => Immediate::U32(read_vu32(reader)?),
        ImmediateKind::I32 => Immediate::I32(read_vs32(reader)?),
        ImmediateKind::I64 => Immediate::I64(read_vs64(reader)?),
        ImmediateKind::F32 => Immediate::F32(read_f32(reader)?),
        ImmediateKind::F64 => Immediate::F64(read_f64(reader)?),
        ImmediateKind::U32Pair => Immediate::U32Pair(read_vu32(reader)?, read_vu32(reader)?),
        ImmediateKind::MemArg { .. } => {
            let memarg = MemArg {
                align: read_vu32(reader)?,
                offset: read_vu32(reader)?,
            };
            check_alignment(spec, &memarg)?;
            Immediate::MemArg(memarg)
        }
        ImmediateKind::Block => {
            let depth = enter_block(reader, depth)?;
            let block_type = BlockTypeCodec.decode(reader)?;
            let (body, _) = decode_body(reader, false, depth)?;
            Immediate::Block { block_type, body }
        }
        ImmediateKind::If => {
            let depth = enter_block(reader, depth)?;
            let block_type = BlockTypeCodec.decode(reader)?;
            let (then, terminator) = decode_body(reader, true, depth)?;
            let else_ = if terminator == OP_ELSE {
                Some(decode_body(reader, false, depth)?.0)
            } else {
                None
            };
            Immediate::If { block_type, then, else_ }
        }
        ImmediateKind::BrTable => Immediate::BrTable {
            labels: vec(U32).decode(reader)?,
            default: read_vu32(reader)?,
        },
        ImmediateKind::RefType => Immediate::RefType(RefTypeCodec.decode(reader)?),
        ImmediateKind::ValueTypes => Immediate::ValueTypes(vec(ValueTypeCodec).decode(reader)?),
    })
}

fn encode_body(body: &[ResolvedInstruction], buf: &mut Vec<u8>) -> Result<(), CodecError> {
    for instr in body {
        InstructionCodec.encode(instr, buf)?;
    }
    Ok(())
}

/// Reads instructions up to `end` (or `else`, when allowed), consuming the
/// terminator and returning it alongside the body. `depth` counts the
/// structured instructions enclosing the body.
fn decode_body(
    reader: &mut Reader<'_>,
    allow_else: bool,
    depth: usize,
) -> Result<(Vec<ResolvedInstruction>, u8), CodecError> {
    let mut body = Vec::new();
    loop {
        let offset = reader.pos();
        match reader.peek_byte() {
            Some(OP_END) => {
                reader.read_byte()?;
                return Ok((body, OP_END));
            }
            Some(OP_ELSE) if allow_else => {
                reader.read_byte()?;
                return Ok((body, OP_ELSE));
            }
            Some(_) => body.push(decode_instruction(reader, depth)?),
            None => return Err(CodecError::UnexpectedEof { offset }),
        }
    }
}

pub struct InstructionCodec;

impl Codec<ResolvedInstruction> for InstructionCodec {
    fn encode(&self, value: &ResolvedInstruction, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let spec = by_name(value.name).ok_or_else(|| CodecError::UnknownInstruction(value.name.to_string()))?;
        match spec.opcode {
            Opcode::Byte(b) => buf.push(b),
            Opcode::Prefixed(prefix, sub) => {
                buf.push(prefix);
                write_vu32(buf, sub);
            }
        }
        encode_immediate(spec, &value.immediate, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<ResolvedInstruction, CodecError> {
        decode_instruction(reader, 0)
    }
}

fn decode_instruction(reader: &mut Reader<'_>, depth: usize) -> Result<ResolvedInstruction, CodecError> {
    let offset = reader.pos();
    let byte = reader.read_byte()?;
    let opcode = if is_prefix(byte) {
        Opcode::Prefixed(byte, read_vu32(reader)?)
    } else {
        Opcode::Byte(byte)
    };
    let spec = by_opcode(opcode).ok_or_else(|| CodecError::UnknownOpcode {
        offset,
        opcode: opcode.to_string(),
    })?;
    let immediate = decode_immediate(spec, reader, depth)?;
    Ok(ResolvedInstruction::new(spec.name, immediate))
}

/// A sequence of instructions terminated by `end`.
pub struct ExpressionCodec;

impl Codec<Vec<ResolvedInstruction>> for ExpressionCodec {
    fn encode(&self, value: &Vec<ResolvedInstruction>, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_body(value, buf)?;
        buf.push(OP_END);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Vec<ResolvedInstruction>, CodecError> {
        decode_body(reader, false, 0).map(|(body, _)| body)
    }
}

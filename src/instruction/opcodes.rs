//! The instruction metadata table: every non-vector, non-atomic instruction
//! with its opcode, immediate shape and (where fixed) stack signature.

use super::ImmediateKind as K;
use super::InstructionSpec;
use super::Opcode::{Byte, Prefixed};
use super::StackEffect;
use crate::types::ValueType::*;

macro_rules! op {
    ($name:expr, $code:expr, $imm:expr, [$($p:ident),*] -> [$($r:ident),*]) => {
        InstructionSpec {
            name: $name,
            opcode: $code,
            immediate: $imm,
            stack: StackEffect::Fixed {
                params: &[$($p),*],
                results: &[$($r),*],
            },
        }
    };
    ($name:expr, $code:expr, $imm:expr) => {
        InstructionSpec {
            name: $name,
            opcode: $code,
            immediate: $imm,
            stack: StackEffect::Dynamic,
        }
    };
}

macro_rules! num {
    ($name:expr, $byte:expr, [$($p:ident),*] -> [$($r:ident),*]) => {
        op!($name, Byte($byte), K::None, [$($p),*] -> [$($r),*])
    };
}

macro_rules! mem {
    ($name:expr, $byte:expr, $natural:expr, [$($p:ident),*] -> [$($r:ident),*]) => {
        op!($name, Byte($byte), K::MemArg { natural: $natural }, [$($p),*] -> [$($r),*])
    };
}

pub(super) static INSTRUCTIONS: &[InstructionSpec] = &[
    // Control
    op!("unreachable", Byte(0x00), K::None, [] -> []),
    op!("nop", Byte(0x01), K::None, [] -> []),
    op!("block", Byte(0x02), K::Block),
    op!("loop", Byte(0x03), K::Block),
    op!("if", Byte(0x04), K::If),
    op!("br", Byte(0x0c), K::U32),
    op!("br_if", Byte(0x0d), K::U32),
    op!("br_table", Byte(0x0e), K::BrTable),
    op!("return", Byte(0x0f), K::None),
    op!("call", Byte(0x10), K::U32),
    op!("call_indirect", Byte(0x11), K::U32Pair),
    // Reference
    op!("ref.null", Byte(0xd0), K::RefType),
    op!("ref.is_null", Byte(0xd1), K::None),
    op!("ref.func", Byte(0xd2), K::U32, [] -> [FuncRef]),
    // Parametric
    op!("drop", Byte(0x1a), K::None),
    op!("select", Byte(0x1b), K::None),
    op!("select_t", Byte(0x1c), K::ValueTypes),
    // Variable
    op!("local.get", Byte(0x20), K::U32),
    op!("local.set", Byte(0x21), K::U32),
    op!("local.tee", Byte(0x22), K::U32),
    op!("global.get", Byte(0x23), K::U32),
    op!("global.set", Byte(0x24), K::U32),
    // Table
    op!("table.get", Byte(0x25), K::U32),
    op!("table.set", Byte(0x26), K::U32),
    op!("table.init", Prefixed(0xfc, 12), K::U32Pair, [I32, I32, I32] -> []),
    op!("elem.drop", Prefixed(0xfc, 13), K::U32, [] -> []),
    op!("table.copy", Prefixed(0xfc, 14), K::U32Pair, [I32, I32, I32] -> []),
    op!("table.grow", Prefixed(0xfc, 15), K::U32),
    op!("table.size", Prefixed(0xfc, 16), K::U32, [] -> [I32]),
    op!("table.fill", Prefixed(0xfc, 17), K::U32),
    // Memory
    mem!("i32.load", 0x28, 2, [I32] -> [I32]),
    mem!("i64.load", 0x29, 3, [I32] -> [I64]),
    mem!("f32.load", 0x2a, 2, [I32] -> [F32]),
    mem!("f64.load", 0x2b, 3, [I32] -> [F64]),
    mem!("i32.load8_s", 0x2c, 0, [I32] -> [I32]),
    mem!("i32.load8_u", 0x2d, 0, [I32] -> [I32]),
    mem!("i32.load16_s", 0x2e, 1, [I32] -> [I32]),
    mem!("i32.load16_u", 0x2f, 1, [I32] -> [I32]),
    mem!("i64.load8_s", 0x30, 0, [I32] -> [I64]),
    mem!("i64.load8_u", 0x31, 0, [I32] -> [I64]),
    mem!("i64.load16_s", 0x32, 1, [I32] -> [I64]),
    mem!("i64.load16_u", 0x33, 1, [I32] -> [I64]),
    mem!("i64.load32_s", 0x34, 2, [I32] -> [I64]),
    mem!("i64.load32_u", 0x35, 2, [I32] -> [I64]),
    mem!("i32.store", 0x36, 2, [I32, I32] -> []),
    mem!("i64.store", 0x37, 3, [I32, I64] -> []),
    mem!("f32.store", 0x38, 2, [I32, F32] -> []),
    mem!("f64.store", 0x39, 3, [I32, F64] -> []),
    mem!("i32.store8", 0x3a, 0, [I32, I32] -> []),
    mem!("i32.store16", 0x3b, 1, [I32, I32] -> []),
    mem!("i64.store8", 0x3c, 0, [I32, I64] -> []),
    mem!("i64.store16", 0x3d, 1, [I32, I64] -> []),
    mem!("i64.store32", 0x3e, 2, [I32, I64] -> []),
    op!("memory.size", Byte(0x3f), K::U32, [] -> [I32]),
    op!("memory.grow", Byte(0x40), K::U32, [I32] -> [I32]),
    op!("memory.init", Prefixed(0xfc, 8), K::U32Pair, [I32, I32, I32] -> []),
    op!("data.drop", Prefixed(0xfc, 9), K::U32, [] -> []),
    op!("memory.copy", Prefixed(0xfc, 10), K::U32Pair, [I32, I32, I32] -> []),
    op!("memory.fill", Prefixed(0xfc, 11), K::U32, [I32, I32, I32] -> []),
    // Constants
    op!("i32.const", Byte(0x41), K::I32, [] -> [I32]),
    op!("i64.const", Byte(0x42), K::I64, [] -> [I64]),
    op!("f32.const", Byte(0x43), K::F32, [] -> [F32]),
    op!("f64.const", Byte(0x44), K::F64, [] -> [F64]),
    // i32 comparison
    num!("i32.eqz", 0x45, [I32] -> [I32]),
    num!("i32.eq", 0x46, [I32, I32] -> [I32]),
    num!("i32.ne", 0x47, [I32, I32] -> [I32]),
    num!("i32.lt_s", 0x48, [I32, I32] -> [I32]),
    num!("i32.lt_u", 0x49, [I32, I32] -> [I32]),
    num!("i32.gt_s", 0x4a, [I32, I32] -> [I32]),
    num!("i32.gt_u", 0x4b, [I32, I32] -> [I32]),
    num!("i32.le_s", 0x4c, [I32, I32] -> [I32]),
    num!("i32.le_u", 0x4d, [I32, I32] -> [I32]),
    num!("i32.ge_s", 0x4e, [I32, I32] -> [I32]),
    num!("i32.ge_u", 0x4f, [I32, I32] -> [I32]),
    // i64 comparison
    num!("i64.eqz", 0x50, [I64] -> [I32]),
    num!("i64.eq", 0x51, [I64, I64] -> [I32]),
    num!("i64.ne", 0x52, [I64, I64] -> [I32]),
    num!("i64.lt_s", 0x53, [I64, I64] -> [I32]),
    num!("i64.lt_u", 0x54, [I64, I64] -> [I32]),
    num!("i64.gt_s", 0x55, [I64, I64] -> [I32]),
    num!("i64.gt_u", 0x56, [I64, I64] -> [I32]),
    num!("i64.le_s", 0x57, [I64, I64] -> [I32]),
    num!("i64.le_u", 0x58, [I64, I64] -> [I32]),
    num!("i64.ge_s", 0x59, [I64, I64] -> [I32]),
    num!("i64.ge_u", 0x5a, [I64, I64] -> [I32]),
    // f32 comparison
    num!("f32.eq", 0x5b, [F32, F32] -> [I32]),
    num!("f32.ne", 0x5c, [F32, F32] -> [I32]),
    num!("f32.lt", 0x5d, [F32, F32] -> [I32]),
    num!("f32.gt", 0x5e, [F32, F32] -> [I32]),
    num!("f32.le", 0x5f, [F32, F32] -> [I32]),
    num!("f32.ge", 0x60, [F32, F32] -> [I32]),
    // f64 comparison
    num!("f64.eq", 0x61, [F64, F64] -> [I32]),
    num!("f64.ne", 0x62, [F64, F64] -> [I32]),
    num!("f64.lt", 0x63, [F64, F64] -> [I32]),
    num!("f64.gt", 0x64, [F64, F64] -> [I32]),
    num!("f64.le", 0x65, [F64, F64] -> [I32]),
    num!("f64.ge", 0x66, [F64, F64] -> [I32]),
    // i32 arithmetic
    num!("i32.clz", 0x67, [I32] -> [I32]),
    num!("i32.ctz", 0x68, [I32] -> [I32]),
    num!("i32.popcnt", 0x69, [I32] -> [I32]),
    num!("i32.add", 0x6a, [I32, I32] -> [I32]),
    num!("i32.sub", 0x6b, [I32, I32] -> [I32]),
    num!("i32.mul", 0x6c, [I32, I32] -> [I32]),
    num!("i32.div_s", 0x6d, [I32, I32] -> [I32]),
    num!("i32.div_u", 0x6e, [I32, I32] -> [I32]),
    num!("i32.rem_s", 0x6f, [I32, I32] -> [I32]),
    num!("i32.rem_u", 0x70, [I32, I32] -> [I32]),
    num!("i32.and", 0x71, [I32, I32] -> [I32]),
    num!("i32.or", 0x72, [I32, I32] -> [I32]),
    num!("i32.xor", 0x73, [I32, I32] -> [I32]),
    num!("i32.shl", 0x74, [I32, I32] -> [I32]),
    num!("i32.shr_s", 0x75, [I32, I32] -> [I32]),
    num!("i32.shr_u", 0x76, [I32, I32] -> [I32]),
    num!("i32.rotl", 0x77, [I32, I32] -> [I32]),
    num!("i32.rotr", 0x78, [I32, I32] -> [I32]),
    // i64 arithmetic
    num!("i64.clz", 0x79, [I64] -> [I64]),
    num!("i64.ctz", 0x7a, [I64] -> [I64]),
    num!("i64.popcnt", 0x7b, [I64] -> [I64]),
    num!("i64.add", 0x7c, [I64, I64] -> [I64]),
    num!("i64.sub", 0x7d, [I64, I64] -> [I64]),
    num!("i64.mul", 0x7e, [I64, I64] -> [I64]),
    num!("i64.div_s", 0x7f, [I64, I64] -> [I64]),
    num!("i64.div_u", 0x80, [I64, I64] -> [I64]),
    num!("i64.rem_s", 0x81, [I64, I64] -> [I64]),
    num!("i64.rem_u", 0x82, [I64, I64] -> [I64]),
    num!("i64.and", 0x83, [I64, I64] -> [I64]),
    num!("i64.or", 0x84, [I64, I64] -> [I64]),
    num!("i64.xor", 0x85, [I64, I64] -> [I64]),
    num!("i64.shl", 0x86, [I64, I64] -> [I64]),
    num!("i64.shr_s", 0x87, [I64, I64] -> [I64]),
    num!("i64.shr_u", 0x88, [I64, I64] -> [I64]),
    num!("i64.rotl", 0x89, [I64, I64] -> [I64]),
    num!("i64.rotr", 0x8a, [I64, I64] -> [I64]),
    // f32 arithmetic
    num!("f32.abs", 0x8b, [F32] -> [F32]),
    num!("f32.neg", 0x8c, [F32] -> [F32]),
    num!("f32.ceil", 0x8d, [F32] -> [F32]),
    num!("f32.floor", 0x8e, [F32] -> [F32]),
    num!("f32.trunc", 0x8f, [F32] -> [F32]),
    num!("f32.nearest", 0x90, [F32] -> [F32]),
    num!("f32.sqrt", 0x91, [F32] -> [F32]),
    num!("f32.add", 0x92, [F32, F32] -> [F32]),
    num!("f32.sub", 0x93, [F32, F32] -> [F32]),
    num!("f32.mul", 0x94, [F32, F32] -> [F32]),
    num!("f32.div", 0x95, [F32, F32] -> [F32]),
    num!("f32.min", 0x96, [F32, F32] -> [F32]),
    num!("f32.max", 0x97, [F32, F32] -> [F32]),
    num!("f32.copysign", 0x98, [F32, F32] -> [F32]),
    // f64 arithmetic
    num!("f64.abs", 0x99, [F64] -> [F64]),
    num!("f64.neg", 0x9a, [F64] -> [F64]),
    num!("f64.ceil", 0x9b, [F64] -> [F64]),
    num!("f64.floor", 0x9c, [F64] -> [F64]),
    num!("f64.trunc", 0x9d, [F64] -> [F64]),
    num!("f64.nearest", 0x9e, [F64] -> [F64]),
    num!("f64.sqrt", 0x9f, [F64] -> [F64]),
    num!("f64.add", 0xa0, [F64, F64] -> [F64]),
    num!("f64.sub", 0xa1, [F64, F64] -> [F64]),
    num!("f64.mul", 0xa2, [F64, F64] -> [F64]),
    num!("f64.div", 0xa3, [F64, F64] -> [F64]),
    num!("f64.min", 0xa4, [F64, F64] -> [F64]),
    num!("f64.max", 0xa5, [F64, F64] -> [F64]),
    num!("f64.copysign", 0xa6, [F64, F64] -> [F64]),
    // Conversions
    num!("i32.wrap_i64", 0xa7, [I64] -> [I32]),
    num!("i32.trunc_f32_s", 0xa8, [F32] -> [I32]),
    num!("i32.trunc_f32_u", 0xa9, [F32] -> [I32]),
    num!("i32.trunc_f64_s", 0xaa, [F64] -> [I32]),
    num!("i32.trunc_f64_u", 0xab, [F64] -> [I32]),
    num!("i64.extend_i32_s", 0xac, [I32] -> [I64]),
    num!("i64.extend_i32_u", 0xad, [I32] -> [I64]),
    num!("i64.trunc_f32_s", 0xae, [F32] -> [I64]),
    num!("i64.trunc_f32_u", 0xaf, [F32] -> [I64]),
    num!("i64.trunc_f64_s", 0xb0, [F64] -> [I64]),
    num!("i64.trunc_f64_u", 0xb1, [F64] -> [I64]),
    num!("f32.convert_i32_s", 0xb2, [I32] -> [F32]),
    num!("f32.convert_i32_u", 0xb3, [I32] -> [F32]),
    num!("f32.convert_i64_s", 0xb4, [I64] -> [F32]),
    num!("f32.convert_i64_u", 0xb5, [I64] -> [F32]),
    num!("f32.demote_f64", 0xb6, [F64] -> [F32]),
    num!("f64.convert_i32_s", 0xb7, [I32] -> [F64]),
    num!("f64.convert_i32_u", 0xb8, [I32] -> [F64]),
    num!("f64.convert_i64_s", 0xb9, [I64] -> [F64]),
    num!("f64.convert_i64_u", 0xba, [I64] -> [F64]),
    num!("f64.promote_f32", 0xbb, [F32] -> [F64]),
    num!("i32.reinterpret_f32", 0xbc, [F32] -> [I32]),
    num!("i64.reinterpret_f64", 0xbd, [F64] -> [I64]),
    num!("f32.reinterpret_i32", 0xbe, [I32] -> [F32]),
    num!("f64.reinterpret_i64", 0xbf, [I64] -> [F64]),
    // Sign extension
    num!("i32.extend8_s", 0xc0, [I32] -> [I32]),
    num!("i32.extend16_s", 0xc1, [I32] -> [I32]),
    num!("i64.extend8_s", 0xc2, [I64] -> [I64]),
    num!("i64.extend16_s", 0xc3, [I64] -> [I64]),
    num!("i64.extend32_s", 0xc4, [I64] -> [I64]),
    // Saturating truncation
    op!("i32.trunc_sat_f32_s", Prefixed(0xfc, 0), K::None, [F32] -> [I32]),
    op!("i32.trunc_sat_f32_u", Prefixed(0xfc, 1), K::None, [F32] -> [I32]),
    op!("i32.trunc_sat_f64_s", Prefixed(0xfc, 2), K::None, [F64] -> [I32]),
    op!("i32.trunc_sat_f64_u", Prefixed(0xfc, 3), K::None, [F64] -> [I32]),
    op!("i64.trunc_sat_f32_s", Prefixed(0xfc, 4), K::None, [F32] -> [I64]),
    op!("i64.trunc_sat_f32_u", Prefixed(0xfc, 5), K::None, [F32] -> [I64]),
    op!("i64.trunc_sat_f64_s", Prefixed(0xfc, 6), K::None, [F64] -> [I64]),
    op!("i64.trunc_sat_f64_u", Prefixed(0xfc, 7), K::None, [F64] -> [I64]),
];

//! Value, function, table, memory and global types, with their binary codecs.

use std::fmt;

use crate::binary::encoding::TYPE_FUNC;
use crate::binary::{iso, tagged_union, vec, with_byte_code, Bool, Codec, CodecError, Reader, U32};

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub enum ValueType {
    // Number types
    I32,
    I64,
    F32,
    F64,
    // Vector types
    V128,
    // Reference types
    FuncRef,
    ExternRef,
}

impl ValueType {
    pub fn decode(byte: u8) -> Option<Self> {
        match byte {
            0x7f => Some(ValueType::I32),
            0x7e => Some(ValueType::I64),
            0x7d => Some(ValueType::F32),
            0x7c => Some(ValueType::F64),
            0x7b => Some(ValueType::V128),
            0x70 => Some(ValueType::FuncRef),
            0x6f => Some(ValueType::ExternRef),
            _ => None,
        }
    }

    pub fn wire_byte(self) -> u8 {
        match self {
            ValueType::I32 => 0x7f,
            ValueType::I64 => 0x7e,
            ValueType::F32 => 0x7d,
            ValueType::F64 => 0x7c,
            ValueType::V128 => 0x7b,
            ValueType::FuncRef => 0x70,
            ValueType::ExternRef => 0x6f,
        }
    }

    pub fn is_num(self) -> bool {
        matches!(self, ValueType::I32 | ValueType::I64 | ValueType::F32 | ValueType::F64)
    }

    pub fn is_vec(self) -> bool {
        self == ValueType::V128
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValueType::FuncRef | ValueType::ExternRef)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::V128 => "v128",
            ValueType::FuncRef => "funcref",
            ValueType::ExternRef => "externref",
        };
        write!(f, "{}", name)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum RefType {
    FuncRef,
    ExternRef,
}

impl From<RefType> for ValueType {
    fn from(ty: RefType) -> ValueType {
        match ty {
            RefType::FuncRef => ValueType::FuncRef,
            RefType::ExternRef => ValueType::ExternRef,
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        ValueType::from(*self).fmt(f)
    }
}

/// Stack signature of a function, block or instruction.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Default)]
pub struct FunctionType {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl FunctionType {
    pub fn new(params: &[ValueType], results: &[ValueType]) -> FunctionType {
        FunctionType {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] -> [{}]", format_types(&self.params), format_types(&self.results))
    }
}

pub fn format_types(types: &[ValueType]) -> String {
    types.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" ")
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    pub fn new(min: u32, max: Option<u32>) -> Limits {
        Limits { min, max }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct MemoryType {
    pub limits: Limits,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct TableType {
    pub element: RefType,
    pub limits: Limits,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct GlobalType {
    pub value: ValueType,
    pub mutable: bool,
}

impl GlobalType {
    pub fn new(value: ValueType, mutable: bool) -> GlobalType {
        GlobalType { value, mutable }
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

pub struct ValueTypeCodec;

impl Codec<ValueType> for ValueTypeCodec {
    fn encode(&self, value: &ValueType, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(value.wire_byte());
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<ValueType, CodecError> {
        let offset = reader.pos();
        let found = reader.read_byte()?;
        ValueType::decode(found).ok_or(CodecError::InvalidValueType { offset, found })
    }
}

pub struct RefTypeCodec;

impl Codec<RefType> for RefTypeCodec {
    fn encode(&self, value: &RefType, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        ValueTypeCodec.encode(&ValueType::from(*value), buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<RefType, CodecError> {
        let offset = reader.pos();
        match ValueTypeCodec.decode(reader)? {
            ValueType::FuncRef => Ok(RefType::FuncRef),
            ValueType::ExternRef => Ok(RefType::ExternRef),
            other => Err(CodecError::InvalidValueType {
                offset,
                found: other.wire_byte(),
            }),
        }
    }
}

/// `0x60 vec(valtype) vec(valtype)`
pub fn function_type_codec() -> impl Codec<FunctionType> {
    with_byte_code(
        TYPE_FUNC,
        iso(
            (vec(ValueTypeCodec), vec(ValueTypeCodec)),
            |t: &FunctionType| (t.params.clone(), t.results.clone()),
            |(params, results): (Vec<ValueType>, Vec<ValueType>)| FunctionType { params, results },
        ),
    )
}

/// `0x00 min` or `0x01 min max`
pub fn limits_codec() -> impl Codec<Limits> {
    tagged_union(
        vec![
            (
                0x00,
                Box::new(iso(U32, |l: &Limits| l.min, |min| Limits { min, max: None })) as Box<dyn Codec<Limits>>,
            ),
            (
                0x01,
                Box::new(iso(
                    (U32, U32),
                    |l: &Limits| (l.min, l.max.unwrap_or(0)),
                    |(min, max): (u32, u32)| Limits { min, max: Some(max) },
                )) as Box<dyn Codec<Limits>>,
            ),
        ],
        |l| if l.max.is_some() { Some(0x01) } else { Some(0x00) },
    )
}

pub fn memory_type_codec() -> impl Codec<MemoryType> {
    iso(limits_codec(), |m: &MemoryType| m.limits, |limits| MemoryType { limits })
}

pub fn table_type_codec() -> impl Codec<TableType> {
    iso(
        (RefTypeCodec, limits_codec()),
        |t: &TableType| (t.element, t.limits),
        |(element, limits): (RefType, Limits)| TableType { element, limits },
    )
}

pub fn global_type_codec() -> impl Codec<GlobalType> {
    iso(
        (ValueTypeCodec, Bool),
        |g: &GlobalType| (g.value, g.mutable),
        |(value, mutable): (ValueType, bool)| GlobalType { value, mutable },
    )
}

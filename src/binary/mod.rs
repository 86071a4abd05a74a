//! Bidirectional binary codecs.
//!
//! A [`Codec<T>`] both writes a `T` into a byte buffer and reads one back from
//! a [`Reader`]. Larger layouts are assembled from the combinators in this
//! module (byte codes, length prefixes, vectors, tagged unions, isomorphisms,
//! validation wrappers), each of which keeps the round-trip property of the
//! codecs it wraps: `decode(encode(x)) == x`, consuming exactly the bytes
//! written.

pub mod encoding;
pub mod reader;

use thiserror::Error;

pub use self::reader::Reader;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },
    #[error("invalid tag byte {found:#04x} at offset {offset}")]
    InvalidTag { offset: usize, found: u8 },
    #[error("invalid boolean byte {found:#04x} at offset {offset}")]
    InvalidBool { offset: usize, found: u8 },
    #[error("{remaining} trailing bytes after full decode at offset {offset}")]
    TrailingBytes { offset: usize, remaining: usize },
    #[error("invalid preamble at offset {offset}")]
    InvalidPreamble { offset: usize },
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("integer representation too long at offset {offset} (max {bits} bits)")]
    IntegerTooLong { offset: usize, bits: u32 },
    #[error("integer out of range at offset {offset} (max {bits} bits)")]
    IntegerOutOfRange { offset: usize, bits: u32 },
    #[error("invalid utf-8 sequence at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("invalid value type {found:#04x} at offset {offset}")]
    InvalidValueType { offset: usize, found: u8 },
    #[error("unknown opcode {opcode} at offset {offset}")]
    UnknownOpcode { offset: usize, opcode: String },
    #[error("unknown instruction {0}")]
    UnknownInstruction(String),
    #[error("immediate does not match the operand kind of {0}")]
    ImmediateMismatch(String),
    #[error("alignment must not be larger than natural: 2^{align} for {name} (natural 2^{natural})")]
    InvalidAlignment { name: String, align: u32, natural: u32 },
    #[error("value matches no variant of the union")]
    NoVariant,
    #[error("length prefix says {expected} bytes but {actual} were decoded at offset {offset}")]
    LengthMismatch { offset: usize, expected: usize, actual: usize },
    #[error("expected {expected} elements, got {actual}")]
    ArrayLength { expected: usize, actual: usize },
    #[error("non-canonical encoding at offset {offset}: {what}")]
    NonCanonical { offset: usize, what: &'static str },
    #[error("function and code section have inconsistent lengths ({functions} != {codes})")]
    FunctionCodeMismatch { functions: usize, codes: usize },
    #[error("multiple memories ({0})")]
    MultipleMemories(usize),
    #[error("data count {declared} does not match data segment count {actual}")]
    DataCountMismatch { declared: u32, actual: usize },
    #[error("type index {0} out of range")]
    TypeIndexOutOfRange(u32),
    #[error("too many locals ({0})")]
    TooManyLocals(u64),
    #[error("blocks nested deeper than {limit} at offset {offset}")]
    NestingTooDeep { offset: usize, limit: usize },
}

impl CodecError {
    /// Position at which reading failed, for errors raised while decoding.
    pub fn offset(&self) -> Option<usize> {
        match self {
            CodecError::UnexpectedEof { offset }
            | CodecError::InvalidTag { offset, .. }
            | CodecError::InvalidBool { offset, .. }
            | CodecError::TrailingBytes { offset, .. }
            | CodecError::InvalidPreamble { offset }
            | CodecError::IntegerTooLong { offset, .. }
            | CodecError::IntegerOutOfRange { offset, .. }
            | CodecError::InvalidUtf8 { offset }
            | CodecError::InvalidValueType { offset, .. }
            | CodecError::UnknownOpcode { offset, .. }
            | CodecError::LengthMismatch { offset, .. }
            | CodecError::NonCanonical { offset, .. }
            | CodecError::NestingTooDeep { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

pub trait Codec<T> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError>;

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError>;

    fn to_bytes(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        self.encode(value, &mut buf)?;
        Ok(buf)
    }

    /// Decodes a complete value; leftover bytes are an error.
    fn from_bytes(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let mut reader = Reader::new(bytes);
        let value = self.decode(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }

    /// Decodes one value starting at `offset`, returning it with the offset
    /// just past it.
    fn decode_at(&self, bytes: &[u8], offset: usize) -> Result<(T, usize), CodecError> {
        let mut reader = Reader::at(bytes, offset);
        let value = self.decode(&mut reader)?;
        Ok((value, reader.pos()))
    }
}

impl<T, C: Codec<T> + ?Sized> Codec<T> for Box<C> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        (**self).encode(value, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        (**self).decode(reader)
    }
}

impl<'a, T, C: Codec<T> + ?Sized> Codec<T> for &'a C {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        (**self).encode(value, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        (**self).decode(reader)
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

pub struct Byte;

impl Codec<u8> for Byte {
    fn encode(&self, value: &u8, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(*value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<u8, CodecError> {
        reader.read_byte()
    }
}

pub struct Bool;

impl Codec<bool> for Bool {
    fn encode(&self, value: &bool, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(*value as u8);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<bool, CodecError> {
        let offset = reader.pos();
        match reader.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            found => Err(CodecError::InvalidBool { offset, found }),
        }
    }
}

/// Unsigned LEB128 u32.
pub struct U32;

impl Codec<u32> for U32 {
    fn encode(&self, value: &u32, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_vu32(buf, *value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<u32, CodecError> {
        encoding::read_vu32(reader)
    }
}

/// Signed LEB128 i32.
pub struct I32;

impl Codec<i32> for I32 {
    fn encode(&self, value: &i32, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_vs32(buf, *value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<i32, CodecError> {
        encoding::read_vs32(reader)
    }
}

/// Signed LEB128 i64.
pub struct I64;

impl Codec<i64> for I64 {
    fn encode(&self, value: &i64, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_vs64(buf, *value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<i64, CodecError> {
        encoding::read_vs64(reader)
    }
}

pub struct F32;

impl Codec<f32> for F32 {
    fn encode(&self, value: &f32, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_f32(buf, *value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<f32, CodecError> {
        encoding::read_f32(reader)
    }
}

pub struct F64;

impl Codec<f64> for F64 {
    fn encode(&self, value: &f64, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_f64(buf, *value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<f64, CodecError> {
        encoding::read_f64(reader)
    }
}

/// Length-prefixed UTF-8 string.
pub struct Name;

impl Codec<String> for Name {
    fn encode(&self, value: &String, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_name(buf, value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<String, CodecError> {
        encoding::read_name(reader)
    }
}

/// A byte vector with a u32 length prefix.
pub struct Bytes;

impl Codec<Vec<u8>> for Bytes {
    fn encode(&self, value: &Vec<u8>, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_vu32(buf, value.len() as u32);
        buf.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Vec<u8>, CodecError> {
        let len = encoding::read_vu32(reader)? as usize;
        Ok(reader.read_bytes(len)?.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub struct WithByteCode<C> {
    code: u8,
    codec: C,
}

/// Prefixes `codec` with a fixed byte; decoding any other byte fails.
pub fn with_byte_code<C>(code: u8, codec: C) -> WithByteCode<C> {
    WithByteCode { code, codec }
}

impl<T, C: Codec<T>> Codec<T> for WithByteCode<C> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.push(self.code);
        self.codec.encode(value, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        let offset = reader.pos();
        let found = reader.read_byte()?;
        if found != self.code {
            return Err(CodecError::InvalidTag { offset, found });
        }
        self.codec.decode(reader)
    }
}

pub struct WithPreamble<C> {
    preamble: &'static [u8],
    codec: C,
}

pub fn with_preamble<C>(preamble: &'static [u8], codec: C) -> WithPreamble<C> {
    WithPreamble { preamble, codec }
}

impl<T, C: Codec<T>> Codec<T> for WithPreamble<C> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(self.preamble);
        self.codec.encode(value, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        let offset = reader.pos();
        let bytes = reader
            .read_bytes(self.preamble.len())
            .map_err(|_| CodecError::InvalidPreamble { offset })?;
        if bytes != self.preamble {
            return Err(CodecError::InvalidPreamble { offset });
        }
        self.codec.decode(reader)
    }
}

pub struct WithByteLength<C> {
    codec: C,
}

/// Prefixes the inner encoding with its byte length. Decoding must consume
/// exactly that many bytes.
pub fn with_byte_length<C>(codec: C) -> WithByteLength<C> {
    WithByteLength { codec }
}

impl<T, C: Codec<T>> Codec<T> for WithByteLength<C> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let inner = self.codec.to_bytes(value)?;
        encoding::write_vu32(buf, inner.len() as u32);
        buf.extend_from_slice(&inner);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        let expected = encoding::read_vu32(reader)? as usize;
        let start = reader.pos();
        let mut sub = reader.sub_reader(expected)?;
        let value = self.codec.decode(&mut sub)?;
        if !sub.is_empty() {
            return Err(CodecError::LengthMismatch {
                offset: start,
                expected,
                actual: sub.pos() - start,
            });
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

macro_rules! sequence_codec {
    ($($codec:ident $value:ident $idx:tt),+) => {
        impl<$($value,)+ $($codec: Codec<$value>,)+> Codec<($($value,)+)> for ($($codec,)+) {
            fn encode(&self, value: &($($value,)+), buf: &mut Vec<u8>) -> Result<(), CodecError> {
                $(self.$idx.encode(&value.$idx, buf)?;)+
                Ok(())
            }

            fn decode(&self, reader: &mut Reader<'_>) -> Result<($($value,)+), CodecError> {
                Ok(($(self.$idx.decode(reader)?,)+))
            }
        }
    };
}

sequence_codec!(CA A 0, CB B 1);
sequence_codec!(CA A 0, CB B 1, CC C 2);
sequence_codec!(CA A 0, CB B 1, CC C 2, CD D 3);

pub struct Array<C> {
    codec: C,
    len: usize,
}

/// Exactly `len` values, with no count prefix.
pub fn array<C>(codec: C, len: usize) -> Array<C> {
    Array { codec, len }
}

impl<T, C: Codec<T>> Codec<Vec<T>> for Array<C> {
    fn encode(&self, value: &Vec<T>, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if value.len() != self.len {
            return Err(CodecError::ArrayLength {
                expected: self.len,
                actual: value.len(),
            });
        }
        for item in value {
            self.codec.encode(item, buf)?;
        }
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Vec<T>, CodecError> {
        let mut values = Vec::with_capacity(self.len);
        for _ in 0..self.len {
            values.push(self.codec.decode(reader)?);
        }
        Ok(values)
    }
}

pub struct VecOf<C> {
    codec: C,
}

/// A u32 element count followed by the elements.
pub fn vec<C>(codec: C) -> VecOf<C> {
    VecOf { codec }
}

impl<T, C: Codec<T>> Codec<Vec<T>> for VecOf<C> {
    fn encode(&self, value: &Vec<T>, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        encoding::write_vu32(buf, value.len() as u32);
        for item in value {
            self.codec.encode(item, buf)?;
        }
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Vec<T>, CodecError> {
        let count = encoding::read_vu32(reader)? as usize;
        // the count is untrusted; cap the preallocation by what could fit
        let mut values = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            values.push(self.codec.decode(reader)?);
        }
        Ok(values)
    }
}

// ---------------------------------------------------------------------------
// Derived codecs
// ---------------------------------------------------------------------------

pub struct Iso<C, S, T> {
    codec: C,
    to: fn(&T) -> S,
    from: fn(S) -> T,
}

/// Re-bases a `Codec<S>` onto `T` through a pair of total conversions.
pub fn iso<C, S, T>(codec: C, to: fn(&T) -> S, from: fn(S) -> T) -> Iso<C, S, T> {
    Iso { codec, to, from }
}

impl<C: Codec<S>, S, T> Codec<T> for Iso<C, S, T> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.codec.encode(&(self.to)(value), buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        self.codec.decode(reader).map(self.from)
    }
}

pub struct Constant<T> {
    value: T,
}

/// Writes nothing and always decodes to `value`.
pub fn constant<T: Clone>(value: T) -> Constant<T> {
    Constant { value }
}

impl<T: Clone> Codec<T> for Constant<T> {
    fn encode(&self, _value: &T, _buf: &mut Vec<u8>) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode(&self, _reader: &mut Reader<'_>) -> Result<T, CodecError> {
        Ok(self.value.clone())
    }
}

pub struct Validated<C, T> {
    codec: C,
    validate: fn(&T) -> Result<(), CodecError>,
}

/// Runs `validate` before encoding and after decoding.
pub fn validated<C, T>(codec: C, validate: fn(&T) -> Result<(), CodecError>) -> Validated<C, T> {
    Validated { codec, validate }
}

impl<T, C: Codec<T>> Codec<T> for Validated<C, T> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        (self.validate)(value)?;
        self.codec.encode(value, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        let value = self.codec.decode(reader)?;
        (self.validate)(&value)?;
        Ok(value)
    }
}

pub struct TaggedUnion<T> {
    variants: Vec<(u8, Box<dyn Codec<T>>)>,
    discriminator: fn(&T) -> Option<u8>,
}

/// A byte tag chosen by `discriminator` followed by that variant's encoding.
///
/// Decoded values are passed back through `discriminator`; a value that would
/// not re-encode under the tag it was read with is rejected.
pub fn tagged_union<T>(
    variants: Vec<(u8, Box<dyn Codec<T>>)>,
    discriminator: fn(&T) -> Option<u8>,
) -> TaggedUnion<T> {
    TaggedUnion { variants, discriminator }
}

impl<T> TaggedUnion<T> {
    fn variant(&self, tag: u8) -> Option<&dyn Codec<T>> {
        self.variants
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, codec)| &**codec)
    }
}

impl<T> Codec<T> for TaggedUnion<T> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let tag = (self.discriminator)(value).ok_or(CodecError::NoVariant)?;
        let codec = self.variant(tag).ok_or(CodecError::NoVariant)?;
        buf.push(tag);
        codec.encode(value, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        let offset = reader.pos();
        let found = reader.read_byte()?;
        let codec = self.variant(found).ok_or(CodecError::InvalidTag { offset, found })?;
        let value = codec.decode(reader)?;
        if (self.discriminator)(&value) != Some(found) {
            return Err(CodecError::InvalidTag { offset, found });
        }
        Ok(value)
    }
}

pub struct Optional<C> {
    codec: C,
}

/// An optional value: absent when the inner codec fails right at the start
/// (wrong leading tag or end of input), present otherwise.
pub fn optional<C>(codec: C) -> Optional<C> {
    Optional { codec }
}

impl<T, C: Codec<T>> Codec<Option<T>> for Optional<C> {
    fn encode(&self, value: &Option<T>, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match value {
            Some(value) => self.codec.encode(value, buf),
            None => Ok(()),
        }
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Option<T>, CodecError> {
        let start = reader.pos();
        match self.codec.decode(reader) {
            Ok(value) => Ok(Some(value)),
            Err(err @ CodecError::InvalidTag { .. }) | Err(err @ CodecError::UnexpectedEof { .. })
                if err.offset() == Some(start) =>
            {
                reader.skip_to(start);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

pub struct OrDefault<C, T> {
    inner: Optional<C>,
    default: T,
    is_default: fn(&T) -> bool,
}

/// Omits the value when `is_default` holds and decodes absence as `default`.
/// An explicitly encoded default is rejected, since it would not re-encode
/// to the same bytes.
pub fn or_default<C, T>(codec: C, default: T, is_default: fn(&T) -> bool) -> OrDefault<C, T> {
    OrDefault {
        inner: optional(codec),
        default,
        is_default,
    }
}

impl<T: Clone, C: Codec<T>> Codec<T> for OrDefault<C, T> {
    fn encode(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if (self.is_default)(value) {
            return Ok(());
        }
        self.inner.codec.encode(value, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<T, CodecError> {
        let offset = reader.pos();
        match self.inner.decode(reader)? {
            None => Ok(self.default.clone()),
            Some(value) if (self.is_default)(&value) => Err(CodecError::NonCanonical {
                offset,
                what: "explicitly encoded default value",
            }),
            Some(value) => Ok(value),
        }
    }
}

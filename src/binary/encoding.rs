//! Binary encoding primitives for the WebAssembly module format.
//!
//! Writers append LEB128 integers and little-endian IEEE 754 floats to a
//! caller-provided `&mut Vec<u8>`. Readers decode the same layouts from a
//! [`Reader`](super::reader::Reader); LEB128 decoding accumulates into a
//! 128-bit integer so that range checks happen after the full value is known,
//! never by truncating intermediate shifts.

use byteorder::{ByteOrder, LittleEndian};

use super::reader::Reader;
use super::CodecError;

// ---------------------------------------------------------------------------
// Binary format constants
// ---------------------------------------------------------------------------

pub const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
pub const VERSION: u32 = 1;

// Section IDs
pub const SECTION_TYPE: u8 = 1;
pub const SECTION_IMPORT: u8 = 2;
pub const SECTION_FUNCTION: u8 = 3;
pub const SECTION_TABLE: u8 = 4;
pub const SECTION_MEMORY: u8 = 5;
pub const SECTION_GLOBAL: u8 = 6;
pub const SECTION_EXPORT: u8 = 7;
pub const SECTION_START: u8 = 8;
pub const SECTION_ELEMENT: u8 = 9;
pub const SECTION_CODE: u8 = 10;
pub const SECTION_DATA: u8 = 11;
pub const SECTION_DATA_COUNT: u8 = 12;

pub const TYPE_FUNC: u8 = 0x60;

// Import/export descriptor kinds
pub const DESC_FUNC: u8 = 0x00;
pub const DESC_TABLE: u8 = 0x01;
pub const DESC_MEMORY: u8 = 0x02;
pub const DESC_GLOBAL: u8 = 0x03;

pub const ELEMKIND_FUNCREF: u8 = 0x00;

// Element segment flag bits: bit 0 = non-active, bit 1 = explicit table (or
// declarative when non-active), bit 2 = expressions instead of indices.
pub const ELEM_PASSIVE_BIT: u32 = 0b001;
pub const ELEM_EXPLICIT_BIT: u32 = 0b010;
pub const ELEM_EXPRESSIONS_BIT: u32 = 0b100;

// Data segment flags
pub const DATA_ACTIVE: u32 = 0;
pub const DATA_PASSIVE: u32 = 1;
pub const DATA_ACTIVE_EXPLICIT: u32 = 2;

pub const OP_ELSE: u8 = 0x05;
pub const OP_END: u8 = 0x0B;

pub const BLOCK_TYPE_EMPTY: u8 = 0x40;

// ---------------------------------------------------------------------------
// Unsigned LEB128
// ---------------------------------------------------------------------------

fn padded(offset: usize) -> CodecError {
    CodecError::NonCanonical {
        offset,
        what: "padded integer",
    }
}

fn write_vu(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        byte |= 0x80;
        buf.push(byte);
    }
}

/// Appends the unsigned LEB128 encoding of a u32 value to `buf`.
pub fn write_vu32(buf: &mut Vec<u8>, v: u32) {
    write_vu(buf, v as u64);
}

/// Appends the unsigned LEB128 encoding of a u64 value to `buf`.
pub fn write_vu64(buf: &mut Vec<u8>, v: u64) {
    write_vu(buf, v);
}

/// Reads an unsigned LEB128 value of at most `bits` bits.
///
/// At most `ceil(bits / 7)` bytes are consumed; a longer encoding is
/// malformed even when the value would fit. Only the minimal encoding is
/// accepted: a zero final byte after a continuation byte is padding.
pub fn read_vu(reader: &mut Reader<'_>, bits: u32) -> Result<u64, CodecError> {
    let start = reader.pos();
    let max_bytes = (bits + 6) / 7;
    let mut result: u128 = 0;
    let mut shift = 0u32;
    for i in 0..max_bytes {
        let byte = reader.read_byte()?;
        result |= ((byte & 0x7f) as u128) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if result >> bits != 0 {
                return Err(CodecError::IntegerOutOfRange { offset: start, bits });
            }
            if i > 0 && byte == 0 {
                return Err(padded(start));
            }
            return Ok(result as u64);
        }
    }
    Err(CodecError::IntegerTooLong { offset: start, bits })
}

pub fn read_vu32(reader: &mut Reader<'_>) -> Result<u32, CodecError> {
    read_vu(reader, 32).map(|v| v as u32)
}

pub fn read_vu64(reader: &mut Reader<'_>) -> Result<u64, CodecError> {
    read_vu(reader, 64)
}

// ---------------------------------------------------------------------------
// Signed LEB128
// ---------------------------------------------------------------------------

fn write_vs(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if (value == 0 && (byte & 0x40) == 0) || (value == -1 && (byte & 0x40) != 0) {
            buf.push(byte);
            break;
        }
        byte |= 0x80;
        buf.push(byte);
    }
}

/// Appends the signed LEB128 encoding of an i32 value to `buf`.
pub fn write_vs32(buf: &mut Vec<u8>, v: i32) {
    write_vs(buf, v as i64);
}

/// Appends the signed LEB128 encoding of an i64 value to `buf`.
pub fn write_vs64(buf: &mut Vec<u8>, v: i64) {
    write_vs(buf, v);
}

/// Reads a signed LEB128 value of at most `bits` bits.
///
/// The terminating byte's sign bit extends the accumulator to infinite
/// precision before the range check, so values near `±2^(bits-1)` are never
/// misread as their truncated neighbours.
///
/// A final byte that only repeats the sign already carried by the previous
/// byte (`0x00` after a clear sign bit, `0x7f` after a set one) is padding
/// and rejected.
pub fn read_vs(reader: &mut Reader<'_>, bits: u32) -> Result<i64, CodecError> {
    let start = reader.pos();
    let max_bytes = (bits + 6) / 7;
    let mut result: i128 = 0;
    let mut shift = 0u32;
    let mut prev: Option<u8> = None;
    for _ in 0..max_bytes {
        let byte = reader.read_byte()?;
        result |= ((byte & 0x7f) as i128) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if byte & 0x40 != 0 {
                result |= -1i128 << shift;
            }
            let min = -(1i128 << (bits - 1));
            let max = (1i128 << (bits - 1)) - 1;
            if result < min || result > max {
                return Err(CodecError::IntegerOutOfRange { offset: start, bits });
            }
            match prev {
                Some(p) if (byte == 0x00 && p & 0x40 == 0) || (byte == 0x7f && p & 0x40 != 0) => {
                    return Err(padded(start))
                }
                _ => return Ok(result as i64),
            }
        }
        prev = Some(byte);
    }
    Err(CodecError::IntegerTooLong { offset: start, bits })
}

pub fn read_vs32(reader: &mut Reader<'_>) -> Result<i32, CodecError> {
    read_vs(reader, 32).map(|v| v as i32)
}

pub fn read_vs33(reader: &mut Reader<'_>) -> Result<i64, CodecError> {
    read_vs(reader, 33)
}

pub fn read_vs64(reader: &mut Reader<'_>) -> Result<i64, CodecError> {
    read_vs(reader, 64)
}

// ---------------------------------------------------------------------------
// IEEE 754 floats (little-endian)
// ---------------------------------------------------------------------------

/// Appends the little-endian IEEE 754 encoding of an f32 value to `buf`.
pub fn write_f32(buf: &mut Vec<u8>, v: f32) {
    let mut bytes = [0u8; 4];
    LittleEndian::write_f32(&mut bytes, v);
    buf.extend_from_slice(&bytes);
}

/// Appends the little-endian IEEE 754 encoding of an f64 value to `buf`.
pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    let mut bytes = [0u8; 8];
    LittleEndian::write_f64(&mut bytes, v);
    buf.extend_from_slice(&bytes);
}

pub fn read_f32(reader: &mut Reader<'_>) -> Result<f32, CodecError> {
    Ok(LittleEndian::read_f32(reader.read_bytes(4)?))
}

pub fn read_f64(reader: &mut Reader<'_>) -> Result<f64, CodecError> {
    Ok(LittleEndian::read_f64(reader.read_bytes(8)?))
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Appends a UTF-8 name: byte length followed by the bytes.
pub fn write_name(buf: &mut Vec<u8>, name: &str) {
    write_vu32(buf, name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
}

pub fn read_name(reader: &mut Reader<'_>) -> Result<String, CodecError> {
    let len = read_vu32(reader)? as usize;
    let offset = reader.pos();
    let bytes = reader.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8 { offset })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rstest::rstest;

    fn assert_eq_with_diag<T: std::fmt::Debug + std::cmp::PartialEq>(actual: T, expected: T) {
        assert!(
            actual == expected,
            "Assertion failed. Actual: {:?}, Expected: {:?}",
            actual,
            expected
        );
    }

    fn encode_vu32(v: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_vu32(&mut buf, v);
        buf
    }

    fn encode_vs32(v: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_vs32(&mut buf, v);
        buf
    }

    fn encode_vs64(v: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        write_vs64(&mut buf, v);
        buf
    }

    #[rstest]
    #[case(0, "00")]
    #[case(1, "01")]
    #[case(127, "7f")]
    #[case(128, "8001")]
    #[case(624485, "e58e26")]
    #[case(u32::MAX, "ffffffff0f")]
    fn vu32_known_encodings(#[case] value: u32, #[case] expected: &str) {
        assert_eq_with_diag(hex::encode(encode_vu32(value)), expected.to_string());
        let bytes = encode_vu32(value);
        let mut reader = Reader::new(&bytes);
        assert_eq_with_diag(read_vu32(&mut reader).unwrap(), value);
        assert_eq!(reader.remaining(), 0);
    }

    #[rstest]
    #[case(0, "00")]
    #[case(-1, "7f")]
    #[case(63, "3f")]
    #[case(64, "c000")]
    #[case(-64, "40")]
    #[case(-65, "bf7f")]
    #[case(-123456, "c0bb78")]
    #[case(i32::MAX, "ffffffff07")]
    #[case(i32::MIN, "8080808078")]
    fn vs32_known_encodings(#[case] value: i32, #[case] expected: &str) {
        assert_eq_with_diag(hex::encode(encode_vs32(value)), expected.to_string());
        let bytes = encode_vs32(value);
        let mut reader = Reader::new(&bytes);
        assert_eq_with_diag(read_vs32(&mut reader).unwrap(), value);
    }

    #[rstest]
    #[case(i64::MAX)]
    #[case(i64::MIN)]
    #[case(1 << 31)]
    #[case(-(1 << 31) - 1)]
    #[case(1 << 32)]
    #[case((1 << 32) - 1)]
    #[case(i64::MIN + 1)]
    fn vs64_boundaries_round_trip(#[case] value: i64) {
        let bytes = encode_vs64(value);
        let mut reader = Reader::new(&bytes);
        assert_eq_with_diag(read_vs64(&mut reader).unwrap(), value);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn vu64_max_round_trip() {
        let mut buf = Vec::new();
        write_vu64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        let mut reader = Reader::new(&buf);
        assert_eq!(read_vu64(&mut reader).unwrap(), u64::MAX);
    }

    #[test]
    fn vu32_rejects_overflowing_final_byte() {
        // 2^32 encoded in five bytes
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x10];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            read_vu32(&mut reader),
            Err(CodecError::IntegerOutOfRange { offset: 0, bits: 32 })
        ));
    }

    #[test]
    fn vu32_rejects_too_many_bytes() {
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x00];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(read_vu32(&mut reader), Err(CodecError::IntegerTooLong { .. })));
    }

    #[test]
    fn vs32_rejects_value_just_past_min() {
        // -2^31 - 1
        let bytes = encode_vs64(-(1i64 << 31) - 1);
        let mut reader = Reader::new(&bytes);
        assert!(matches!(read_vs32(&mut reader), Err(CodecError::IntegerOutOfRange { .. })));
    }

    #[test]
    fn vs33_accepts_full_u32_type_indices() {
        let mut buf = Vec::new();
        write_vs64(&mut buf, u32::MAX as i64);
        let mut reader = Reader::new(&buf);
        assert_eq!(read_vs33(&mut reader).unwrap(), u32::MAX as i64);
    }

    #[rstest]
    #[case(&[0x85, 0x80, 0x80, 0x80, 0x00])]
    #[case(&[0x80, 0x00])]
    #[case(&[0x81, 0x00])]
    fn padded_unsigned_is_rejected(#[case] bytes: &[u8]) {
        let mut reader = Reader::new(bytes);
        assert!(matches!(
            read_vu32(&mut reader),
            Err(CodecError::NonCanonical { offset: 0, .. })
        ));
    }

    #[rstest]
    #[case(&[0xff, 0x7f])]
    #[case(&[0x80, 0x00])]
    #[case(&[0xbf, 0x7f, 0x7f])]
    #[case(&[0xff, 0xff, 0xff, 0xff, 0x7f])]
    fn padded_signed_is_rejected(#[case] bytes: &[u8]) {
        let mut reader = Reader::new(bytes);
        assert!(matches!(
            read_vs32(&mut reader),
            Err(CodecError::NonCanonical { offset: 0, .. })
        ));
    }

    #[test]
    fn sign_carrying_final_byte_is_minimal() {
        // 64 needs a second byte to clear the sign bit of 0x40
        let mut reader = Reader::new(&[0xc0, 0x00]);
        assert_eq!(read_vs32(&mut reader).unwrap(), 64);
        let mut reader = Reader::new(&[0xbf, 0x7f]);
        assert_eq!(read_vs32(&mut reader).unwrap(), -65);
    }

    #[test]
    fn random_leb_round_trips() {
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let u: u32 = rng.gen();
            let s: i32 = rng.gen();
            let l: i64 = rng.gen();
            let mut buf = Vec::new();
            write_vu32(&mut buf, u);
            write_vs32(&mut buf, s);
            write_vs64(&mut buf, l);
            let mut reader = Reader::new(&buf);
            assert_eq_with_diag(read_vu32(&mut reader).unwrap(), u);
            assert_eq_with_diag(read_vs32(&mut reader).unwrap(), s);
            assert_eq_with_diag(read_vs64(&mut reader).unwrap(), l);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn floats_are_little_endian() {
        let mut buf = Vec::new();
        write_f32(&mut buf, 1.0);
        write_f64(&mut buf, -2.5);
        assert_eq!(hex::encode(&buf), "0000803f00000000000004c0");
        let mut reader = Reader::new(&buf);
        assert_eq!(read_f32(&mut reader).unwrap(), 1.0);
        assert_eq!(read_f64(&mut reader).unwrap(), -2.5);
    }

    #[test]
    fn random_float_bits_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let a = f32::from_bits(rng.gen());
            let b = f64::from_bits(rng.gen());
            let mut buf = Vec::new();
            write_f32(&mut buf, a);
            write_f64(&mut buf, b);
            let mut reader = Reader::new(&buf);
            assert_eq!(read_f32(&mut reader).unwrap().to_bits(), a.to_bits());
            assert_eq!(read_f64(&mut reader).unwrap().to_bits(), b.to_bits());
        }
    }

    #[test]
    fn names_are_utf8_with_byte_length() {
        let mut buf = Vec::new();
        write_name(&mut buf, "héllo");
        assert_eq!(buf[0], 6);
        let mut reader = Reader::new(&buf);
        assert_eq!(read_name(&mut reader).unwrap(), "héllo");

        let mut reader = Reader::new(&[0x02, 0xc3, 0x28]);
        assert!(matches!(read_name(&mut reader), Err(CodecError::InvalidUtf8 { offset: 1 })));
    }
}

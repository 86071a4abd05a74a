use super::CodecError;

/// A forward-only cursor over a borrowed byte slice.
///
/// Every failing read reports the offset at which it happened so codec errors
/// can point at the offending byte.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, pos: 0 }
    }

    /// Starts reading `bytes` at `offset`, as `decode(bytes, offset)` does.
    pub fn at(bytes: &'a [u8], offset: usize) -> Reader<'a> {
        Reader { bytes, pos: offset }
    }
}

impl<'a> Reader<'a> {
    // Basic operations --------------------------------------------------------
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn read_byte(&mut self) -> Result<u8, CodecError> {
        match self.bytes.get(self.pos) {
            Some(&byte) => {
                self.pos += 1;
                Ok(byte)
            }
            None => Err(CodecError::UnexpectedEof { offset: self.pos }),
        }
    }

    pub fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    pub fn has_at_least(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Rewinds (or advances) to an absolute position previously obtained from
    /// [`pos`](Reader::pos).
    pub fn skip_to(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if !self.has_at_least(len) {
            return Err(CodecError::UnexpectedEof { offset: self.bytes.len() });
        }
        let bytes = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Splits off the next `len` bytes as an independent reader whose offsets
    /// stay absolute, advancing this reader past them.
    pub fn sub_reader(&mut self, len: usize) -> Result<Reader<'a>, CodecError> {
        let start = self.pos;
        self.read_bytes(len)?;
        Ok(Reader {
            bytes: &self.bytes[..start + len],
            pos: start,
        })
    }

    /// Fails if any bytes are left unread.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes {
                offset: self.pos,
                remaining: self.remaining(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_byte_reports_eof_offset() {
        let mut reader = Reader::new(&[1, 2]);
        assert_eq!(reader.read_byte().unwrap(), 1);
        assert_eq!(reader.read_byte().unwrap(), 2);
        assert!(matches!(reader.read_byte(), Err(CodecError::UnexpectedEof { offset: 2 })));
    }

    #[test]
    fn sub_reader_is_bounded_and_absolute() {
        let bytes = [9, 1, 2, 3, 4];
        let mut reader = Reader::new(&bytes);
        reader.read_byte().unwrap();
        let mut sub = reader.sub_reader(2).unwrap();
        assert_eq!(sub.pos(), 1);
        assert_eq!(sub.read_bytes(2).unwrap(), &[1, 2]);
        assert!(sub.finish().is_ok());
        assert!(sub.read_byte().is_err());
        assert_eq!(reader.pos(), 3);
        assert!(matches!(
            reader.finish(),
            Err(CodecError::TrailingBytes { offset: 3, remaining: 2 })
        ));
    }

    #[test]
    fn read_bytes_past_end_fails() {
        let mut reader = Reader::at(&[0, 1, 2], 2);
        assert!(reader.read_bytes(2).is_err());
        assert_eq!(reader.read_bytes(1).unwrap(), &[2]);
    }
}

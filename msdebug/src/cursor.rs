//! Bounds-checked reading of little-endian values from untrusted bytes.
//!
//! Every offset inside debug information comes from the file being decoded, so every read goes
//! through [`ByteCursor`], which reports [`DecodeError`] instead of reading past the end.


use crate::error::DecodeError;
use crate::int_from_byte_slice::IntFromByteSlice;


/// Returns `length` bytes of `bytes` starting at `offset`.
pub fn slice_at(bytes: &[u8], offset: usize, length: usize) -> Result<&[u8], DecodeError> {
    if offset > bytes.len() {
        return Err(DecodeError::OffsetOutOfRange { offset, length: bytes.len() });
    }
    let end = offset.checked_add(length)
        .filter(|e| *e <= bytes.len())
        .ok_or(DecodeError::UnexpectedEof {
            offset,
            wanted: length,
            available: bytes.len() - offset,
        })?;
    Ok(&bytes[offset..end])
}

/// Returns the bytes of `bytes` from `offset` until the end.
pub fn slice_from(bytes: &[u8], offset: usize) -> Result<&[u8], DecodeError> {
    if offset > bytes.len() {
        Err(DecodeError::OffsetOutOfRange { offset, length: bytes.len() })
    } else {
        Ok(&bytes[offset..])
    }
}

pub(crate) fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    position: usize,
}
impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
        }
    }

    /// Creates a cursor positioned at `position` within `bytes`.
    pub fn at(bytes: &'a [u8], position: usize) -> Result<Self, DecodeError> {
        let mut cursor = Self::new(bytes);
        cursor.seek(position)?;
        Ok(cursor)
    }

    pub fn as_bytes(&self) -> &'a [u8] { self.bytes }
    pub fn position(&self) -> usize { self.position }
    pub fn len(&self) -> usize { self.bytes.len() }
    pub fn remaining(&self) -> usize { self.bytes.len() - self.position }
    pub fn is_at_end(&self) -> bool { self.position >= self.bytes.len() }

    pub fn seek(&mut self, position: usize) -> Result<(), DecodeError> {
        if position > self.bytes.len() {
            return Err(DecodeError::OffsetOutOfRange { offset: position, length: self.bytes.len() });
        }
        self.position = position;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> Result<(), DecodeError> {
        self.read_bytes(count)?;
        Ok(())
    }

    /// Moves forward to the next multiple of `alignment`, stopping at the end of the data.
    pub fn align(&mut self, alignment: usize) {
        if alignment < 2 {
            return;
        }
        let misalignment = self.position % alignment;
        if misalignment != 0 {
            self.position = (self.position + (alignment - misalignment)).min(self.bytes.len());
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        let slice = slice_at(self.bytes, self.position, count)?;
        self.position += count;
        Ok(slice)
    }

    /// Returns a cursor over the next `count` bytes and moves past them.
    pub fn sub_cursor(&mut self, count: usize) -> Result<ByteCursor<'a>, DecodeError> {
        let bytes = self.read_bytes(count)?;
        Ok(ByteCursor::new(bytes))
    }

    fn read_int<T: IntFromByteSlice>(&mut self) -> Result<T, DecodeError> {
        let bytes = self.read_bytes(T::size())?;
        Ok(T::from_le_byte_slice(bytes))
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> { self.read_int() }
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> { self.read_int() }
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> { self.read_int() }
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> { self.read_int() }
    pub fn read_i8(&mut self) -> Result<i8, DecodeError> { self.read_int() }
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> { self.read_int() }
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> { self.read_int() }
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> { self.read_int() }

    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        let mut copy = *self;
        copy.read_u8()
    }

    pub fn peek_u16(&self) -> Result<u16, DecodeError> {
        let mut copy = *self;
        copy.read_u16()
    }

    /// Reads a string prefixed by its length as a single byte.
    ///
    /// Returns `None` for a zero-length string.
    pub fn read_counted_string(&mut self) -> Result<Option<String>, DecodeError> {
        let length = self.read_u8()?;
        if length == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(length.into())?;
        Ok(Some(bytes_to_string(bytes)))
    }

    pub fn read_nul_terminated_string(&mut self) -> Result<String, DecodeError> {
        let rest = &self.bytes[self.position..];
        let Some(nul_index) = rest.iter().position(|b| *b == 0x00) else {
            return Err(DecodeError::UnexpectedEof {
                offset: self.position,
                wanted: rest.len() + 1,
                available: rest.len(),
            });
        };
        let string = bytes_to_string(&rest[..nul_index]);
        self.position += nul_index + 1;
        Ok(string)
    }

    /// Reads a fixed-size field holding a string padded with NUL bytes.
    pub fn read_padded_string(&mut self, size: usize) -> Result<String, DecodeError> {
        let bytes = self.read_bytes(size)?;
        let end = bytes.iter().position(|b| *b == 0x00).unwrap_or(bytes.len());
        Ok(bytes_to_string(&bytes[..end]))
    }
}


#[cfg(test)]
mod tests {
    use super::{slice_at, ByteCursor};
    use crate::error::DecodeError;

    #[test]
    fn test_read_integers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xFF, 0xFF];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.read_u8().unwrap(), 0x01);
        assert_eq!(cursor.read_u16().unwrap(), 0x0302);
        assert_eq!(cursor.read_u32().unwrap(), 0x0706_0504);
        assert_eq!(cursor.position(), 7);
        assert_eq!(cursor.read_i16().unwrap(), -1);
        assert!(cursor.is_at_end());
    }

    #[test]
    fn test_truncated_read_fails() {
        let data = [0x01, 0x02, 0x03];
        let mut cursor = ByteCursor::new(&data);
        cursor.skip(1).unwrap();
        let err = cursor.read_u32().unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedEof { offset: 1, wanted: 4, available: 2 });

        // a failed read does not move the cursor
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.read_u16().unwrap(), 0x0302);
    }

    #[test]
    fn test_seek_past_end_fails() {
        let data = [0u8; 4];
        let mut cursor = ByteCursor::new(&data);
        assert!(cursor.seek(4).is_ok());
        assert_eq!(cursor.seek(5).unwrap_err(), DecodeError::OffsetOutOfRange { offset: 5, length: 4 });
        assert!(ByteCursor::at(&data, 9).is_err());
    }

    #[test]
    fn test_counted_string() {
        let data = b"\x05hello\x00\x03abc";
        let mut cursor = ByteCursor::new(data);
        assert_eq!(cursor.read_counted_string().unwrap().as_deref(), Some("hello"));
        assert_eq!(cursor.read_counted_string().unwrap(), None);
        assert_eq!(cursor.read_counted_string().unwrap().as_deref(), Some("abc"));

        let truncated = b"\x09abc";
        assert!(ByteCursor::new(truncated).read_counted_string().is_err());
    }

    #[test]
    fn test_nul_terminated_and_padded_strings() {
        let data = b"foo.pdb\0.text\0\0\0rest";
        let mut cursor = ByteCursor::new(data);
        assert_eq!(cursor.read_nul_terminated_string().unwrap(), "foo.pdb");
        assert_eq!(cursor.read_padded_string(8).unwrap(), ".text");
        assert_eq!(cursor.position(), 16);
        assert!(cursor.read_nul_terminated_string().is_err());
    }

    #[test]
    fn test_align() {
        let data = [0u8; 10];
        let mut cursor = ByteCursor::new(&data);
        cursor.skip(5).unwrap();
        cursor.align(4);
        assert_eq!(cursor.position(), 8);
        cursor.align(4);
        assert_eq!(cursor.position(), 8);
        cursor.skip(1).unwrap();
        cursor.align(4);
        assert_eq!(cursor.position(), 10);
    }

    #[test]
    fn test_slice_at() {
        let data = [1u8, 2, 3, 4];
        assert_eq!(slice_at(&data, 1, 2).unwrap(), &[2, 3]);
        assert_eq!(slice_at(&data, 4, 0).unwrap(), &[] as &[u8]);
        assert!(slice_at(&data, 3, 2).is_err());
        assert!(slice_at(&data, 5, 0).is_err());
        assert!(slice_at(&data, 1, usize::MAX).is_err());
    }
}

//! Deterministic binary primitives shared by discovery and transport messages.
//!
//! `Writer` appends to a byte buffer; `Reader` walks a byte slice front to
//! back. Every decoder fails with `CodecError::InvalidLength` instead of
//! panicking on truncated input.

use thiserror::Error;

/// `-1` as an `i32` length prefix means "null" for an optional byte string.
const NULL_LENGTH: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("unexpected end of buffer: wanted {wanted} bytes, {available} available")]
    UnexpectedEof { wanted: usize, available: usize },
    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("invalid value for field")]
    InvalidValue,
    #[error("trailing data: {0} bytes left after decoding")]
    TrailingData(usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Anything that can be written to and read from the wire in our simple codec.
pub trait Serializer: Sized {
    fn read(reader: &mut Reader) -> CodecResult<Self>;
    fn write(&self, writer: &mut Writer);

    /// Encoded size in bytes; used to pre-size buffers and to validate
    /// length-prefixed collections before allocating.
    fn size(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        let mut writer = Writer::new(&mut bytes);
        self.write(&mut writer);
        bytes
    }

    fn from_bytes(data: &[u8]) -> CodecResult<Self> {
        let mut reader = Reader::new(data);
        let value = Self::read(&mut reader)?;
        let remaining = reader.remaining();
        if remaining > 0 {
            return Err(CodecError::TrailingData(remaining));
        }
        Ok(value)
    }
}

pub struct Writer<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buffer.extend_from_slice(value);
    }

    /// Length-prefixed byte string; `None` is encoded as length `-1`.
    pub fn write_optional_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            Some(bytes) => {
                self.write_i32(bytes.len() as i32);
                self.write_bytes(bytes);
            }
            None => self.write_i32(NULL_LENGTH),
        }
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_i32(value.len() as i32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    pub fn write_optional_string(&mut self, value: Option<&str>) {
        self.write_optional_bytes(value.map(str::as_bytes));
    }
}

pub struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof {
                wanted: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> CodecResult<i16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(i16::from_be_bytes(bytes))
    }

    pub fn read_u16(&mut self) -> CodecResult<u16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn read_i32(&mut self) -> CodecResult<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(i32::from_be_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_i64(&mut self) -> CodecResult<i64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> CodecResult<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        self.take(len)
    }

    /// Length-prefixed byte string; length `-1` decodes to `None`.
    pub fn read_optional_bytes(&mut self) -> CodecResult<Option<Vec<u8>>> {
        let len = self.read_i32()?;
        if len == NULL_LENGTH {
            return Ok(None);
        }
        if len < 0 {
            return Err(CodecError::InvalidLength(len));
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    pub fn read_string(&mut self) -> CodecResult<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(CodecError::InvalidLength(len));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_optional_string(&mut self) -> CodecResult<Option<String>> {
        match self.read_optional_bytes()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| CodecError::InvalidUtf8),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_integers() {
        let mut bytes = Vec::new();
        let mut w = Writer::new(&mut bytes);
        w.write_u8(7);
        w.write_i16(-300);
        w.write_u32(123456);
        w.write_i64(-1);
        w.write_u64(u64::MAX);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_i16().unwrap(), -300);
        assert_eq!(r.read_u32().unwrap(), 123456);
        assert_eq!(r.read_i64().unwrap(), -1);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn roundtrip_string_and_null_bytes() {
        let mut bytes = Vec::new();
        let mut w = Writer::new(&mut bytes);
        w.write_string("hello");
        w.write_optional_bytes(None);
        w.write_optional_bytes(Some(&[1, 2, 3]));

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "hello");
        assert_eq!(r.read_optional_bytes().unwrap(), None);
        assert_eq!(r.read_optional_bytes().unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn truncated_buffer_errors() {
        let bytes = vec![0u8; 3];
        let mut r = Reader::new(&bytes);
        let err = r.read_u64().unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedEof {
                wanted: 8,
                available: 3
            }
        );
    }

    #[test]
    fn negative_length_other_than_null_is_rejected() {
        let mut bytes = Vec::new();
        let mut w = Writer::new(&mut bytes);
        w.write_i32(-2);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_optional_bytes().unwrap_err(), CodecError::InvalidLength(-2));
    }

    #[test]
    fn trailing_data_detected_via_serializer() {
        struct Dummy(u8);
        impl Serializer for Dummy {
            fn read(reader: &mut Reader) -> CodecResult<Self> {
                Ok(Dummy(reader.read_u8()?))
            }
            fn write(&self, writer: &mut Writer) {
                writer.write_u8(self.0);
            }
            fn size(&self) -> usize {
                1
            }
        }

        let mut bytes = Dummy(9).to_bytes();
        bytes.push(0xFF);
        let err = Dummy::from_bytes(&bytes).unwrap_err();
        assert_eq!(err, CodecError::TrailingData(1));
    }
}

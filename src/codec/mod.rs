//! MQTT packet codec
//!
//! Encoding and decoding for MQTT 3.1, 3.1.1 and 5.0 packets. The decoder
//! works on a borrowed buffer and never consumes a partial frame, so a
//! connection can keep appending bytes and retry.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Maximum remaining length (268,435,455 bytes)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum accepted packet size
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a Variable Byte Integer
///
/// Returns `(value, bytes_consumed)`. A fourth byte with the continuation bit
/// set is rejected immediately, without waiting for a fifth byte.
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if (byte & 0x80) == 0 {
            return Ok((value, i + 1));
        }
    }

    if buf.len() >= 4 {
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Write a Variable Byte Integer, returning the number of bytes written
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            return Ok(count);
        }
    }
}

/// Number of bytes needed to encode a Variable Byte Integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Write a length-prefixed UTF-8 string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Cursor over the body of a complete packet
///
/// The frame length is already known when a `Reader` is created, so running
/// out of bytes means the packet is malformed rather than incomplete.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::MalformedPacket("field extends past packet end"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Two Byte Integer, big-endian
    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Four Byte Integer, big-endian
    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn variable_int(&mut self) -> Result<u32, DecodeError> {
        match read_variable_int(&self.buf[self.pos..]) {
            Ok((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            Err(DecodeError::InsufficientData) => {
                Err(DecodeError::MalformedPacket("variable integer extends past packet end"))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// UTF-8 string; U+0000 is rejected
    pub(crate) fn string(&mut self) -> Result<&'a str, DecodeError> {
        let s = std::str::from_utf8(self.binary()?).map_err(|_| DecodeError::InvalidUtf8)?;
        if s.contains('\0') {
            return Err(DecodeError::MalformedPacket("string contains null character"));
        }
        Ok(s)
    }

    /// Split off the next `len` bytes as their own reader
    pub(crate) fn sub_reader(&mut self, len: usize) -> Result<Reader<'a>, DecodeError> {
        Ok(Reader::new(self.take(len)?))
    }

    /// Everything not read yet
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

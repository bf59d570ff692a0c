//! MQTT packet codec
//!
//! Encoding and decoding for the client packet subset at both protocol
//! levels. The codec is symmetric: it decodes what it encodes, which lets the
//! same code drive the sink and the fake brokers used in tests.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Maximum remaining length (268,435,455 bytes)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default cap on inbound packets; a bridge client only receives small acks
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// v5.0 CONNECT property: four byte session expiry in seconds
pub const PROPERTY_SESSION_EXPIRY_INTERVAL: u8 = 0x11;

/// Read a variable byte integer, returning (value, bytes consumed)
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;
    for (pos, byte) in buf.iter().enumerate() {
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        value |= ((byte & 0x7F) as u32) << (7 * pos);
        if byte & 0x80 == 0 {
            return Ok((value, pos + 1));
        }
    }
    if buf.len() >= 4 {
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Write a variable byte integer
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Read a two byte big-endian integer
#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Read a length-prefixed binary field, returning (data, bytes consumed)
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let end = 2 + len;
    if buf.len() < end {
        return Err(DecodeError::MalformedPacket("field overruns packet"));
    }
    Ok((&buf[2..end], end))
}

/// Read a length-prefixed UTF-8 string, returning (string, bytes consumed)
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (raw, used) = read_binary(buf)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains null character"));
    }
    Ok((s, used))
}

pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

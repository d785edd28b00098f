//! MySQL wire protocol encoding and decoding primitives.
//!
//! MySQL uses little-endian for all fixed-size integers, a variable-length
//! "length-encoded" integer for most counted fields, and frames every payload
//! in an envelope of `[length:3][sequence:1]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::FromBytes;

use crate::error::{Error, Result};

use super::types::{U16LE, U32LE, U64LE};

/// Largest payload that fits a single envelope.
pub const MAX_ENVELOPE_SIZE: usize = 0xFF_FFFF;

/// One length-delimited framing unit of the wire protocol.
#[derive(Debug)]
pub struct Envelope {
    /// Sequence id of this envelope within the current command
    pub sequence_id: u8,
    /// Decoded payload bytes, owned
    pub payload: Vec<u8>,
}

/// Read one envelope from the stream into an owned payload.
///
/// Payloads of exactly [`MAX_ENVELOPE_SIZE`] bytes are followed by
/// continuation envelopes, which are concatenated here so the decoder
/// always sees one logical payload.
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let sequence_id = header[3];

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let mut last_len = len;
    while last_len == MAX_ENVELOPE_SIZE {
        reader.read_exact(&mut header).await?;
        last_len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let start = payload.len();
        payload.resize(start + last_len, 0);
        reader.read_exact(&mut payload[start..]).await?;
    }

    Ok(Envelope {
        sequence_id,
        payload,
    })
}

/// Write one payload as envelope(s) and flush.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sequence_id: u8,
    payload: &[u8],
) -> Result<()> {
    let mut seq = sequence_id;
    let mut rest = payload;
    loop {
        let chunk_len = rest.len().min(MAX_ENVELOPE_SIZE);
        let (chunk, tail) = rest.split_at(chunk_len);
        let len_bytes = (chunk_len as u32).to_le_bytes();
        writer
            .write_all(&[len_bytes[0], len_bytes[1], len_bytes[2], seq])
            .await?;
        writer.write_all(chunk).await?;
        seq = seq.wrapping_add(1);
        rest = tail;
        // A payload of exactly MAX_ENVELOPE_SIZE needs an empty trailer
        if rest.is_empty() && chunk_len != MAX_ENVELOPE_SIZE {
            break;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((byte, rest)) => Ok((*byte, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

/// Read 2-byte little-endian unsigned integer.
#[inline]
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::Protocol(format!(
            "read_u16: buffer too short: {} < 2",
            data.len()
        )));
    }
    let value = U16LE::ref_from_bytes(&data[..2])
        .map_err(|e| Error::Protocol(format!("read_u16: {e:?}")))?
        .get();
    Ok((value, &data[2..]))
}

/// Read 4-byte little-endian unsigned integer.
#[inline]
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Protocol(format!(
            "read_u32: buffer too short: {} < 4",
            data.len()
        )));
    }
    let value = U32LE::ref_from_bytes(&data[..4])
        .map_err(|e| Error::Protocol(format!("read_u32: {e:?}")))?
        .get();
    Ok((value, &data[4..]))
}

/// Read 8-byte little-endian unsigned integer.
#[inline]
pub fn read_u64(data: &[u8]) -> Result<(u64, &[u8])> {
    if data.len() < 8 {
        return Err(Error::Protocol(format!(
            "read_u64: buffer too short: {} < 8",
            data.len()
        )));
    }
    let value = U64LE::ref_from_bytes(&data[..8])
        .map_err(|e| Error::Protocol(format!("read_u64: {e:?}")))?
        .get();
    Ok((value, &data[8..]))
}

/// Read `n` raw bytes.
#[inline]
pub fn read_bytes(data: &[u8], n: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < n {
        return Err(Error::Protocol(format!(
            "read_bytes: buffer too short: {} < {}",
            data.len(),
            n
        )));
    }
    Ok(data.split_at(n))
}

/// Read a length-encoded integer.
///
/// - `0x00..=0xFA`: 1-byte value
/// - `0xFC` + 2 bytes
/// - `0xFD` + 3 bytes
/// - `0xFE` + 8 bytes
pub fn read_lenenc_int(data: &[u8]) -> Result<(u64, &[u8])> {
    let (first, rest) = read_u8(data)?;
    match first {
        0xFB => Err(Error::Protocol("read_lenenc_int: NULL marker 0xFB".into())),
        0xFC => {
            let (v, rest) = read_u16(rest)?;
            Ok((u64::from(v), rest))
        }
        0xFD => {
            let (bytes, rest) = read_bytes(rest, 3)?;
            let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
            Ok((u64::from(v), rest))
        }
        0xFE => {
            let (v, rest) = read_u64(rest)?;
            Ok((v, rest))
        }
        v => Ok((u64::from(v), rest)),
    }
}

/// Read a length-encoded byte string.
pub fn read_lenenc_bytes(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_lenenc_int(data)?;
    read_bytes(rest, len as usize)
}

/// Read a NUL-terminated string.
pub fn read_cstring(data: &[u8]) -> Result<(&str, &[u8])> {
    let nul = memchr::memchr(0, data)
        .ok_or_else(|| Error::Protocol("read_cstring: missing NUL terminator".into()))?;
    let s = simdutf8::compat::from_utf8(&data[..nul])
        .map_err(|e| Error::Protocol(format!("read_cstring: invalid UTF-8: {e}")))?;
    Ok((s, &data[nul + 1..]))
}

/// Decode a UTF-8 string from raw bytes.
pub fn decode_utf8(data: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(data)
        .map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}")))
}

/// Write a 2-byte little-endian unsigned integer.
#[inline]
pub fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Write a 3-byte little-endian unsigned integer.
#[inline]
pub fn write_u24(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Write a 4-byte little-endian unsigned integer.
#[inline]
pub fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Write an 8-byte little-endian unsigned integer.
#[inline]
pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Write a length-encoded integer.
pub fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 0x1_0000 {
        buf.push(0xFC);
        write_u16(buf, value as u16);
    } else if value < 0x100_0000 {
        buf.push(0xFD);
        write_u24(buf, value as u32);
    } else {
        buf.push(0xFE);
        write_u64(buf, value);
    }
}

/// Write a length-encoded byte string.
pub fn write_lenenc_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_lenenc_int(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Write a NUL-terminated string.
pub fn write_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenenc_int_roundtrip() {
        for value in [0u64, 250, 251, 0xFFFF, 0x1_0000, 0xFF_FFFF, 0x100_0000, u64::MAX] {
            let mut buf = Vec::new();
            write_lenenc_int(&mut buf, value);
            let (decoded, rest) = read_lenenc_int(&buf).unwrap();
            assert_eq!(decoded, value);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn cstring_rejects_missing_nul() {
        assert!(read_cstring(b"no terminator").is_err());
        let (s, rest) = read_cstring(b"abc\0def").unwrap();
        assert_eq!(s, "abc");
        assert_eq!(rest, b"def");
    }

    #[tokio::test]
    async fn envelope_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_envelope(&mut client, 3, b"hello").await.unwrap();
        let envelope = read_envelope(&mut server).await.unwrap();
        assert_eq!(envelope.sequence_id, 3);
        assert_eq!(envelope.payload, b"hello");
    }
}

//! Length-prefixed framing
//!
//! Frame layout:
//! [1 byte: kind] [4 bytes: length, little-endian] [payload...]

use super::{Decoder, Encoder, Envelope};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Largest payload a single frame may carry
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frame kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Encoded node message
    Message = 0x01,
}

impl TryFrom<u8> for FrameKind {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Message),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind: {:#04x}", value),
            )),
        }
    }
}

/// Read one frame from the stream
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> io::Result<(FrameKind, Vec<u8>)> {
    let kind = FrameKind::try_from(reader.read_u8()?)?;

    let length = reader.read_u32::<LittleEndian>()? as usize;
    if length > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", length, MAX_FRAME_LEN),
        ));
    }

    // Grow with the bytes that actually arrive rather than the announced length
    let mut payload = Vec::new();
    Read::take(&mut *reader, length as u64).read_to_end(&mut payload)?;
    if payload.len() != length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated: {} of {} bytes", payload.len(), length),
        ));
    }

    Ok((kind, payload))
}

/// Write one frame to the stream
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes (max {})", payload.len(), MAX_FRAME_LEN),
        ));
    }

    writer.write_u8(kind as u8)?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Default wire codec: one message frame per envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    fn decode(&self, reader: &mut dyn Read) -> io::Result<Envelope> {
        let (_kind, payload) = read_frame(reader)?;
        Ok(Envelope {
            from: String::new(),
            payload,
        })
    }
}

impl Encoder for FrameCodec {
    fn encode(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        write_frame(&mut frame, FrameKind::Message, payload)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let frame = FrameCodec.encode(b"abc").unwrap();
        assert_eq!(frame, vec![0x01, 3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_decode_consecutive_frames() {
        let mut wire = FrameCodec.encode(b"first").unwrap();
        wire.extend(FrameCodec.encode(b"").unwrap());
        wire.extend(FrameCodec.encode(b"third").unwrap());

        let mut cursor = Cursor::new(wire);
        assert_eq!(FrameCodec.decode(&mut cursor).unwrap().payload, b"first");
        assert!(FrameCodec.decode(&mut cursor).unwrap().payload.is_empty());
        assert_eq!(FrameCodec.decode(&mut cursor).unwrap().payload, b"third");

        let eof = FrameCodec.decode(&mut cursor).unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_unknown_kind() {
        let mut cursor = Cursor::new(vec![0x7f, 0, 0, 0, 0]);
        let err = FrameCodec.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = vec![FrameKind::Message as u8];
        header.extend(((MAX_FRAME_LEN + 1) as u32).to_le_bytes());
        let err = read_frame(&mut Cursor::new(header)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_large_announced_length_with_short_body() {
        let mut frame = vec![FrameKind::Message as u8];
        frame.extend((MAX_FRAME_LEN as u32).to_le_bytes());
        frame.extend(b"tiny");

        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncated_payload_is_eof() {
        let mut frame = FrameCodec.encode(b"hello").unwrap();
        frame.truncate(7);
        let err = FrameCodec.decode(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

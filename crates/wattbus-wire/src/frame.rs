//! 512-byte bulk frame codec
//!
//! Wire format (little-endian):
//! - 4-byte header packing `{port_id:5, length:11, frame_id:16}` from bit 0 up
//! - up to 508 payload bytes, zero-padded to the fixed frame size
//!
//! `length` counts payload bytes only, excluding the header.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Fixed on-the-wire frame size
pub const FRAME_SIZE: usize = 512;
/// Header size
pub const FRAME_HEADER_SIZE: usize = 4;
/// Maximum payload per frame
pub const FRAME_PAYLOAD_MAX: usize = FRAME_SIZE - FRAME_HEADER_SIZE;

/// Frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload too large: {0} bytes (max {FRAME_PAYLOAD_MAX})")]
    PayloadTooLarge(usize),
    #[error("truncated frame: {0} bytes")]
    Truncated(usize),
    #[error("length field {length} exceeds buffer {available}")]
    LengthExceedsBuffer { length: usize, available: usize },
    #[error("malformed message on port {port_id}")]
    Malformed { port_id: u8 },
}

/// One demultiplexed frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Wrapping per-direction sequence number
    pub frame_id: u16,
    /// 5-bit port selector
    pub port_id: u8,
    /// Payload, at most [`FRAME_PAYLOAD_MAX`] bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, validating the payload bound.
    pub fn new(frame_id: u16, port_id: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > FRAME_PAYLOAD_MAX {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            frame_id,
            port_id: port_id & 0x1F,
            payload,
        })
    }

    /// Encode into `dst`, always appending exactly [`FRAME_SIZE`] bytes.
    pub fn encode(&self, dst: &mut BytesMut) {
        let header = u32::from(self.port_id & 0x1F)
            | ((self.payload.len() as u32 & 0x7FF) << 5)
            | (u32::from(self.frame_id) << 16);
        dst.put_u32_le(header);
        dst.put_slice(&self.payload);
        dst.put_bytes(0, FRAME_SIZE - FRAME_HEADER_SIZE - self.payload.len());
    }

    /// Decode one frame from the front of `src`, consuming [`FRAME_SIZE`]
    /// bytes. Returns `Ok(None)` until a full frame is buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if src.len() < FRAME_SIZE {
            return Ok(None);
        }
        let header = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let port_id = (header & 0x1F) as u8;
        let length = ((header >> 5) & 0x7FF) as usize;
        let frame_id = (header >> 16) as u16;
        if length > FRAME_PAYLOAD_MAX {
            return Err(FrameError::LengthExceedsBuffer {
                length,
                available: FRAME_PAYLOAD_MAX,
            });
        }
        src.advance(FRAME_HEADER_SIZE);
        let payload = src[..length].to_vec();
        src.advance(FRAME_SIZE - FRAME_HEADER_SIZE);
        Ok(Some(Self {
            frame_id,
            port_id,
            payload,
        }))
    }

    /// Decode one frame from an exactly sized chunk (bulk transfers carry
    /// whole frames back to back).
    pub fn parse(chunk: &[u8]) -> Result<Self, FrameError> {
        if chunk.len() < FRAME_SIZE {
            return Err(FrameError::Truncated(chunk.len()));
        }
        let header = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let port_id = (header & 0x1F) as u8;
        let length = ((header >> 5) & 0x7FF) as usize;
        let frame_id = (header >> 16) as u16;
        if length > FRAME_PAYLOAD_MAX {
            return Err(FrameError::LengthExceedsBuffer {
                length,
                available: FRAME_PAYLOAD_MAX,
            });
        }
        Ok(Self {
            frame_id,
            port_id,
            payload: chunk[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length].to_vec(),
        })
    }

    /// The next frame id after this one (wrapping).
    pub fn next_id(&self) -> u16 {
        self.frame_id.wrapping_add(1)
    }
}

/// Frame id gap between `expected` and `received`, zero when in sequence.
pub fn frame_id_gap(expected: u16, received: u16) -> u16 {
    received.wrapping_sub(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(0x1234, 17, vec![1, 2, 3, 4, 5]).unwrap();
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_SIZE);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_bit_layout() {
        let frame = Frame::new(0xABCD, 3, vec![0u8; 7]).unwrap();
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let header = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(header & 0x1F, 3);
        assert_eq!((header >> 5) & 0x7FF, 7);
        assert_eq!(header >> 16, 0xABCD);
    }

    #[test]
    fn test_decode_needs_full_frame() {
        let mut buf = BytesMut::new();
        buf.put_bytes(0, FRAME_SIZE - 1);
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_payload_bound() {
        assert!(Frame::new(0, 16, vec![0u8; FRAME_PAYLOAD_MAX]).is_ok());
        assert_eq!(
            Frame::new(0, 16, vec![0u8; FRAME_PAYLOAD_MAX + 1]),
            Err(FrameError::PayloadTooLarge(FRAME_PAYLOAD_MAX + 1))
        );
    }

    #[test]
    fn test_length_field_excludes_header() {
        // A full frame's length field is 508, not 512.
        let frame = Frame::new(0, 16, vec![0xAA; FRAME_PAYLOAD_MAX]).unwrap();
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let header = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!((header >> 5) & 0x7FF, FRAME_PAYLOAD_MAX as u32);
    }

    #[test]
    fn test_frame_id_gap() {
        assert_eq!(frame_id_gap(5, 5), 0);
        assert_eq!(frame_id_gap(5, 8), 3);
        assert_eq!(frame_id_gap(0xFFFF, 1), 2);
    }
}

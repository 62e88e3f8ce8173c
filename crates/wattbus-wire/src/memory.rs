//! Port-3 flash memory operations
//!
//! Four-step protocol: erase; write-start, write-data..., write-finalize;
//! read-request, read-data.... The instrument acks write-data with the
//! highest offset it has committed so the host can bound the in-flight
//! window by the instrument's receive buffer.
//!
//! Layout: `[op:u8, status:u8, region:u8, rsvd:u8]` then the op body.

use crate::frame::FrameError;
use bytes::{Buf, BufMut, BytesMut};

const OP_ERASE: u8 = 1;
const OP_WRITE_START: u8 = 2;
const OP_WRITE_DATA: u8 = 3;
const OP_WRITE_FINALIZE: u8 = 4;
const OP_READ_REQ: u8 = 5;
const OP_READ_DATA: u8 = 6;
const OP_ACK: u8 = 7;

/// Memory port messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryMsg {
    /// Erase a flash region
    Erase { region: u8 },
    /// Begin a write of `size` bytes to a region
    WriteStart { region: u8, size: u32 },
    /// One write chunk at a strictly increasing offset
    WriteData { region: u8, offset: u32, data: Vec<u8> },
    /// Commit the write
    WriteFinalize { region: u8 },
    /// Request `length` bytes from `offset` of a region
    ReadReq { region: u8, offset: u32, length: u32 },
    /// One read chunk
    ReadData { region: u8, offset: u32, data: Vec<u8> },
    /// Instrument acknowledgment: `offset` is the highest byte committed,
    /// `status` a wire error code (0 = success)
    Ack { region: u8, op: u8, offset: u32, status: u8 },
}

impl MemoryMsg {
    /// The operation code byte for acks.
    pub fn op_code(&self) -> u8 {
        match self {
            MemoryMsg::Erase { .. } => OP_ERASE,
            MemoryMsg::WriteStart { .. } => OP_WRITE_START,
            MemoryMsg::WriteData { .. } => OP_WRITE_DATA,
            MemoryMsg::WriteFinalize { .. } => OP_WRITE_FINALIZE,
            MemoryMsg::ReadReq { .. } => OP_READ_REQ,
            MemoryMsg::ReadData { .. } => OP_READ_DATA,
            MemoryMsg::Ack { .. } => OP_ACK,
        }
    }

    /// Encode to a port-3 frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            MemoryMsg::Erase { region } => {
                put_header(&mut buf, OP_ERASE, 0, *region);
            }
            MemoryMsg::WriteStart { region, size } => {
                put_header(&mut buf, OP_WRITE_START, 0, *region);
                buf.put_u32_le(*size);
            }
            MemoryMsg::WriteData { region, offset, data } => {
                put_header(&mut buf, OP_WRITE_DATA, 0, *region);
                buf.put_u32_le(*offset);
                buf.put_u16_le(data.len() as u16);
                buf.put_u16_le(0);
                buf.put_slice(data);
            }
            MemoryMsg::WriteFinalize { region } => {
                put_header(&mut buf, OP_WRITE_FINALIZE, 0, *region);
            }
            MemoryMsg::ReadReq { region, offset, length } => {
                put_header(&mut buf, OP_READ_REQ, 0, *region);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*length);
            }
            MemoryMsg::ReadData { region, offset, data } => {
                put_header(&mut buf, OP_READ_DATA, 0, *region);
                buf.put_u32_le(*offset);
                buf.put_u16_le(data.len() as u16);
                buf.put_u16_le(0);
                buf.put_slice(data);
            }
            MemoryMsg::Ack { region, op, offset, status } => {
                put_header(&mut buf, OP_ACK, *status, *region);
                buf.put_u8(*op);
                buf.put_bytes(0, 3);
                buf.put_u32_le(*offset);
            }
        }
        buf.to_vec()
    }

    /// Decode from a port-3 frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let malformed = || FrameError::Malformed { port_id: 3 };
        let mut buf = payload;
        if buf.remaining() < 4 {
            return Err(malformed());
        }
        let op = buf.get_u8();
        let status = buf.get_u8();
        let region = buf.get_u8();
        buf.advance(1);
        match op {
            OP_ERASE => Ok(MemoryMsg::Erase { region }),
            OP_WRITE_START => {
                if buf.remaining() < 4 {
                    return Err(malformed());
                }
                Ok(MemoryMsg::WriteStart {
                    region,
                    size: buf.get_u32_le(),
                })
            }
            OP_WRITE_DATA | OP_READ_DATA => {
                if buf.remaining() < 8 {
                    return Err(malformed());
                }
                let offset = buf.get_u32_le();
                let len = buf.get_u16_le() as usize;
                buf.advance(2);
                if buf.remaining() < len {
                    return Err(malformed());
                }
                let data = buf[..len].to_vec();
                if op == OP_WRITE_DATA {
                    Ok(MemoryMsg::WriteData { region, offset, data })
                } else {
                    Ok(MemoryMsg::ReadData { region, offset, data })
                }
            }
            OP_WRITE_FINALIZE => Ok(MemoryMsg::WriteFinalize { region }),
            OP_READ_REQ => {
                if buf.remaining() < 8 {
                    return Err(malformed());
                }
                Ok(MemoryMsg::ReadReq {
                    region,
                    offset: buf.get_u32_le(),
                    length: buf.get_u32_le(),
                })
            }
            OP_ACK => {
                if buf.remaining() < 8 {
                    return Err(malformed());
                }
                let acked_op = buf.get_u8();
                buf.advance(3);
                Ok(MemoryMsg::Ack {
                    region,
                    op: acked_op,
                    offset: buf.get_u32_le(),
                    status,
                })
            }
            _ => Err(malformed()),
        }
    }
}

fn put_header(buf: &mut BytesMut, op: u8, status: u8, region: u8) {
    buf.put_u8(op);
    buf.put_u8(status);
    buf.put_u8(region);
    buf.put_u8(0);
}

//! Port-0 link control messages
//!
//! Layout: `[op:u8, flags:u8, reserved:u16]` then the op-specific body.
//! Flag bit 0 distinguishes responses from requests.

use crate::frame::FrameError;
use bytes::{Buf, BufMut, BytesMut};

/// Protocol major revision compiled into this driver. A connect response
/// carrying a different major fails the open with `not-supported`.
pub const PROTOCOL_MAJOR: u8 = 1;
/// Protocol minor revision
pub const PROTOCOL_MINOR: u8 = 3;

const OP_CONNECT: u8 = 1;
const OP_ECHO: u8 = 2;
const OP_TIMESYNC: u8 = 3;
const FLAG_RSP: u8 = 0x01;

/// Version and identity block exchanged during connect
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectInfo {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    /// Hardware revision, `major.minor.patch` packed as `u32`
    pub hw_version: u32,
    /// Firmware revision
    pub fw_version: u32,
    /// FPGA bitstream revision
    pub fpga_version: u32,
}

/// Link control messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkMsg {
    Connect(ConnectInfo),
    ConnectRsp(ConnectInfo),
    /// Liveness loopback; the instrument mirrors `seq` back
    Echo { seq: u32 },
    EchoRsp { seq: u32 },
    /// Instrument-initiated: carries the counter latched at send time
    TimeSyncReq { start_count: u64 },
    /// Host reply: both UTC stamps are the host receive time; `end_count`
    /// stays zero (the instrument latches its own on receipt)
    TimeSyncRsp {
        start_count: u64,
        utc_recv: i64,
        utc_send: i64,
        end_count: u64,
    },
}

impl LinkMsg {
    /// Encode to a port-0 frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(40);
        match self {
            LinkMsg::Connect(info) | LinkMsg::ConnectRsp(info) => {
                let rsp = matches!(self, LinkMsg::ConnectRsp(_));
                put_header(&mut buf, OP_CONNECT, rsp);
                buf.put_u8(info.protocol_major);
                buf.put_u8(info.protocol_minor);
                buf.put_u16_le(0);
                buf.put_u32_le(info.hw_version);
                buf.put_u32_le(info.fw_version);
                buf.put_u32_le(info.fpga_version);
            }
            LinkMsg::Echo { seq } | LinkMsg::EchoRsp { seq } => {
                let rsp = matches!(self, LinkMsg::EchoRsp { .. });
                put_header(&mut buf, OP_ECHO, rsp);
                buf.put_u32_le(*seq);
            }
            LinkMsg::TimeSyncReq { start_count } => {
                put_header(&mut buf, OP_TIMESYNC, false);
                buf.put_u64_le(*start_count);
                buf.put_i64_le(0);
                buf.put_i64_le(0);
                buf.put_u64_le(0);
            }
            LinkMsg::TimeSyncRsp {
                start_count,
                utc_recv,
                utc_send,
                end_count,
            } => {
                put_header(&mut buf, OP_TIMESYNC, true);
                buf.put_u64_le(*start_count);
                buf.put_i64_le(*utc_recv);
                buf.put_i64_le(*utc_send);
                buf.put_u64_le(*end_count);
            }
        }
        buf.to_vec()
    }

    /// Decode from a port-0 frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let malformed = || FrameError::Malformed { port_id: 0 };
        let mut buf = payload;
        if buf.remaining() < 4 {
            return Err(malformed());
        }
        let op = buf.get_u8();
        let rsp = buf.get_u8() & FLAG_RSP != 0;
        buf.advance(2);
        match op {
            OP_CONNECT => {
                if buf.remaining() < 16 {
                    return Err(malformed());
                }
                let protocol_major = buf.get_u8();
                let protocol_minor = buf.get_u8();
                buf.advance(2);
                let info = ConnectInfo {
                    protocol_major,
                    protocol_minor,
                    hw_version: buf.get_u32_le(),
                    fw_version: buf.get_u32_le(),
                    fpga_version: buf.get_u32_le(),
                };
                Ok(if rsp {
                    LinkMsg::ConnectRsp(info)
                } else {
                    LinkMsg::Connect(info)
                })
            }
            OP_ECHO => {
                if buf.remaining() < 4 {
                    return Err(malformed());
                }
                let seq = buf.get_u32_le();
                Ok(if rsp {
                    LinkMsg::EchoRsp { seq }
                } else {
                    LinkMsg::Echo { seq }
                })
            }
            OP_TIMESYNC => {
                if buf.remaining() < 32 {
                    return Err(malformed());
                }
                let start_count = buf.get_u64_le();
                let utc_recv = buf.get_i64_le();
                let utc_send = buf.get_i64_le();
                let end_count = buf.get_u64_le();
                Ok(if rsp {
                    LinkMsg::TimeSyncRsp {
                        start_count,
                        utc_recv,
                        utc_send,
                        end_count,
                    }
                } else {
                    LinkMsg::TimeSyncReq { start_count }
                })
            }
            _ => Err(malformed()),
        }
    }
}

fn put_header(buf: &mut BytesMut, op: u8, rsp: bool) {
    buf.put_u8(op);
    buf.put_u8(if rsp { FLAG_RSP } else { 0 });
    buf.put_u16_le(0);
}

/// Pack a `major.minor.patch` version triple.
pub fn pack_version(major: u8, minor: u8, patch: u16) -> u32 {
    (u32::from(major) << 24) | (u32::from(minor) << 16) | u32::from(patch)
}

/// Render a packed version for topic publication.
pub fn version_string(v: u32) -> String {
    format!("{}.{}.{}", v >> 24, (v >> 16) & 0xFF, v & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_roundtrip() {
        let info = ConnectInfo {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            hw_version: pack_version(2, 0, 0),
            fw_version: pack_version(1, 7, 2),
            fpga_version: pack_version(1, 1, 0),
        };
        for msg in [LinkMsg::Connect(info), LinkMsg::ConnectRsp(info)] {
            assert_eq!(LinkMsg::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_timesync_request_reply_shape() {
        let req = LinkMsg::TimeSyncReq { start_count: 0x1122334455 };
        let decoded = LinkMsg::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);

        let rsp = LinkMsg::TimeSyncRsp {
            start_count: 0x1122334455,
            utc_recv: 99,
            utc_send: 99,
            end_count: 0,
        };
        assert_eq!(LinkMsg::decode(&rsp.encode()).unwrap(), rsp);
    }

    #[test]
    fn test_truncated_rejected() {
        let mut raw = LinkMsg::Echo { seq: 1 }.encode();
        raw.truncate(5);
        assert!(LinkMsg::decode(&raw).is_err());
    }

    #[test]
    fn test_version_string() {
        assert_eq!(version_string(pack_version(1, 7, 2)), "1.7.2");
    }
}

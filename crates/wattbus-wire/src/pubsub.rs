//! Port-1 pub/sub messages
//!
//! Carries one topic/value pair in either direction. Layout:
//! `[type:u8, flags:u8, op:u8, app:u8, data_len:u16, topic_len:u8, rsvd:u8]`
//! then the NUL-terminated topic, then the little-endian value payload.
//! Topics on the wire are relative to the device prefix.

use crate::frame::FrameError;
use bytes::{Buf, BufMut, BytesMut};
use wattbus_core::value::{AppPayload, Dtype, Value, ValueData, ValueFlags};

/// One pub/sub exchange on port 1
#[derive(Clone, Debug, PartialEq)]
pub struct PubSubMsg {
    /// Topic relative to the device prefix, e.g. `s/i/ctrl`
    pub topic: String,
    pub value: Value,
}

fn dtype_code(dtype: Dtype) -> u8 {
    match dtype {
        Dtype::Null => 0,
        Dtype::Str => 1,
        Dtype::Json => 2,
        Dtype::Bin => 3,
        Dtype::F32 => 4,
        Dtype::F64 => 5,
        Dtype::I8 => 6,
        Dtype::I16 => 7,
        Dtype::I32 => 8,
        Dtype::I64 => 9,
        Dtype::U8 => 10,
        Dtype::U16 => 11,
        Dtype::U32 => 12,
        Dtype::U64 => 13,
    }
}

impl PubSubMsg {
    /// Encode to a port-1 frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = BytesMut::new();
        match &self.value.data {
            ValueData::Null => {}
            ValueData::Str(s) | ValueData::Json(s) => {
                data.put_slice(s.as_bytes());
                data.put_u8(0);
            }
            ValueData::Bin(b) => data.put_slice(b),
            ValueData::F32(v) => data.put_f32_le(*v),
            ValueData::F64(v) => data.put_f64_le(*v),
            ValueData::I8(v) => data.put_i8(*v),
            ValueData::I16(v) => data.put_i16_le(*v),
            ValueData::I32(v) => data.put_i32_le(*v),
            ValueData::I64(v) => data.put_i64_le(*v),
            ValueData::U8(v) => data.put_u8(*v),
            ValueData::U16(v) => data.put_u16_le(*v),
            ValueData::U32(v) => data.put_u32_le(*v),
            ValueData::U64(v) => data.put_u64_le(*v),
        }

        let mut buf = BytesMut::with_capacity(8 + self.topic.len() + 1 + data.len());
        buf.put_u8(dtype_code(self.value.dtype()));
        buf.put_u8(self.value.flags.bits());
        buf.put_u8(self.value.op);
        buf.put_u8(self.value.app as u8);
        buf.put_u16_le(data.len() as u16);
        buf.put_u8(self.topic.len() as u8);
        buf.put_u8(0);
        buf.put_slice(self.topic.as_bytes());
        buf.put_u8(0);
        buf.put_slice(&data);
        buf.to_vec()
    }

    /// Decode from a port-1 frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let malformed = || FrameError::Malformed { port_id: 1 };
        let mut buf = payload;
        if buf.remaining() < 8 {
            return Err(malformed());
        }
        let dtype = buf.get_u8();
        let flags = ValueFlags::from_bits_truncate(buf.get_u8());
        let op = buf.get_u8();
        let app = AppPayload::try_from(buf.get_u8()).map_err(|_| malformed())?;
        let data_len = buf.get_u16_le() as usize;
        let topic_len = buf.get_u8() as usize;
        buf.advance(1);

        if buf.remaining() < topic_len + 1 + data_len {
            return Err(malformed());
        }
        let topic = std::str::from_utf8(&buf[..topic_len])
            .map_err(|_| malformed())?
            .to_string();
        buf.advance(topic_len + 1); // topic + NUL

        let mut data = &buf[..data_len];
        let parsed = match dtype {
            0 => ValueData::Null,
            1 | 2 => {
                let s = std::str::from_utf8(&data[..data_len.saturating_sub(1)])
                    .map_err(|_| malformed())?
                    .to_string();
                if dtype == 1 {
                    ValueData::Str(s)
                } else {
                    ValueData::Json(s)
                }
            }
            3 => ValueData::Bin(data.to_vec()),
            4 if data_len >= 4 => ValueData::F32(data.get_f32_le()),
            5 if data_len >= 8 => ValueData::F64(data.get_f64_le()),
            6 if data_len >= 1 => ValueData::I8(data.get_i8()),
            7 if data_len >= 2 => ValueData::I16(data.get_i16_le()),
            8 if data_len >= 4 => ValueData::I32(data.get_i32_le()),
            9 if data_len >= 8 => ValueData::I64(data.get_i64_le()),
            10 if data_len >= 1 => ValueData::U8(data.get_u8()),
            11 if data_len >= 2 => ValueData::U16(data.get_u16_le()),
            12 if data_len >= 4 => ValueData::U32(data.get_u32_le()),
            13 if data_len >= 8 => ValueData::U64(data.get_u64_le()),
            _ => return Err(malformed()),
        };

        Ok(Self {
            topic,
            value: Value {
                data: parsed,
                flags,
                op,
                app,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let msg = PubSubMsg {
            topic: "s/i/ctrl".into(),
            value: Value::u8(1).retained(),
        };
        let decoded = PubSubMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.topic, "s/i/ctrl");
        assert!(decoded.value.eq_exact(&msg.value));
    }

    #[test]
    fn test_string_roundtrip() {
        let msg = PubSubMsg {
            topic: "c/fw/version".into(),
            value: Value::str("1.7.2"),
        };
        assert_eq!(PubSubMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_aux_bytes_survive() {
        let msg = PubSubMsg {
            topic: "!/pong".into(),
            value: Value::null().with_op(7),
        };
        let decoded = PubSubMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.value.op, 7);
    }

    #[test]
    fn test_truncated_rejected() {
        let mut raw = PubSubMsg {
            topic: "a/b".into(),
            value: Value::u32(5),
        }
        .encode();
        raw.truncate(raw.len() - 2);
        assert!(PubSubMsg::decode(&raw).is_err());
    }
}

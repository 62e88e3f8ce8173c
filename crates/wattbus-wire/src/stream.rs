//! Streaming data ports
//!
//! Ports 16-31 carry packed sample data. Each streaming frame payload starts
//! with a 32-bit sample counter at the instrument's native rate, followed by
//! packed elements. The host extends the counter to 64 bits and repackages
//! runs of frames into stream-signal messages for broker publication.

use crate::frame::FrameError;
use bytes::{Buf, BufMut, BytesMut};
use wattbus_core::timemap::TimeMap;

/// Streaming signal identities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldId {
    /// Raw ADC channel 0-3
    RawAdc(u8),
    /// Active current range code
    CurrentRange,
    Current,
    Voltage,
    Power,
    /// General-purpose input 0-3
    Gpi(u8),
    /// GPI 7, the external trigger
    Trigger,
    Uart0,
    /// Instrument-computed statistics blocks
    SensorStats,
}

impl FieldId {
    /// Stable wire code for the stream-signal header.
    pub fn code(&self) -> u8 {
        match self {
            FieldId::RawAdc(n) => *n,
            FieldId::CurrentRange => 4,
            FieldId::Current => 5,
            FieldId::Voltage => 6,
            FieldId::Power => 7,
            FieldId::Gpi(n) => 8 + *n,
            FieldId::Trigger => 12,
            FieldId::Uart0 => 13,
            FieldId::SensorStats => 14,
        }
    }

    /// Reconstruct from the wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0..=3 => FieldId::RawAdc(code),
            4 => FieldId::CurrentRange,
            5 => FieldId::Current,
            6 => FieldId::Voltage,
            7 => FieldId::Power,
            8..=11 => FieldId::Gpi(code - 8),
            12 => FieldId::Trigger,
            13 => FieldId::Uart0,
            14 => FieldId::SensorStats,
            _ => return None,
        })
    }

    /// The broker signal name under `s/<signal>`.
    pub fn signal_name(&self) -> String {
        match self {
            FieldId::RawAdc(n) => format!("adc{n}"),
            FieldId::CurrentRange => "irange".into(),
            FieldId::Current => "i".into(),
            FieldId::Voltage => "v".into(),
            FieldId::Power => "p".into(),
            FieldId::Gpi(n) => format!("gpi{n}"),
            FieldId::Trigger => "trigger".into(),
            FieldId::Uart0 => "uart0".into(),
            FieldId::SensorStats => "sstats".into(),
        }
    }
}

/// Packed element representation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    Uint = 0,
    Int = 1,
    Float = 2,
}

impl TryFrom<u8> for ElementType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(ElementType::Uint),
            1 => Ok(ElementType::Int),
            2 => Ok(ElementType::Float),
            _ => Err(FrameError::Malformed { port_id: 0xFF }),
        }
    }
}

/// Fixed per-port element layout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub field: FieldId,
    pub element: ElementType,
    pub bits: u8,
    /// Smallest decimation the instrument will emit for this field
    pub decimate_min: u32,
}

/// The streaming field table: port id 16+i to layout.
pub fn field_for_port(port_id: u8) -> Option<FieldInfo> {
    let index = port_id.checked_sub(crate::port::STREAM_BASE)?;
    let info = match index {
        0..=3 => FieldInfo {
            field: FieldId::RawAdc(index),
            element: ElementType::Int,
            bits: 16,
            decimate_min: 1,
        },
        4 => FieldInfo {
            field: FieldId::CurrentRange,
            element: ElementType::Uint,
            bits: 4,
            decimate_min: 1,
        },
        5 => FieldInfo {
            field: FieldId::Current,
            element: ElementType::Float,
            bits: 32,
            decimate_min: 2,
        },
        6 => FieldInfo {
            field: FieldId::Voltage,
            element: ElementType::Float,
            bits: 32,
            decimate_min: 2,
        },
        7 => FieldInfo {
            field: FieldId::Power,
            element: ElementType::Float,
            bits: 32,
            decimate_min: 2,
        },
        8..=11 => FieldInfo {
            field: FieldId::Gpi(index - 8),
            element: ElementType::Uint,
            bits: 1,
            decimate_min: 1,
        },
        12 => FieldInfo {
            field: FieldId::Trigger,
            element: ElementType::Uint,
            bits: 1,
            decimate_min: 1,
        },
        13 => FieldInfo {
            field: FieldId::Uart0,
            element: ElementType::Uint,
            bits: 8,
            decimate_min: 1,
        },
        14 => FieldInfo {
            field: FieldId::SensorStats,
            element: ElementType::Uint,
            bits: 8,
            decimate_min: 1,
        },
        _ => return None,
    };
    Some(info)
}

/// The port carrying a field.
pub fn port_for_field(field: FieldId) -> u8 {
    crate::port::STREAM_BASE + field.code()
}

/// Extend a 32-bit wire sample counter to 64 bits against the last observed
/// id. Correct as long as no gap reaches 2^31 samples (about 17 minutes at
/// 2 Msps).
pub fn extend_sample_id(wire: u32, last: u64) -> u64 {
    let delta = wire.wrapping_sub(last as u32) as i32;
    last.wrapping_add(delta as i64 as u64)
}

/// One streaming frame payload: counter plus packed element bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    /// 32-bit counter at the instrument's native rate
    pub sample_counter: u32,
    pub data: &'a [u8],
}

impl<'a> StreamFrame<'a> {
    /// Split a streaming frame payload into counter and data.
    pub fn parse(payload: &'a [u8], port_id: u8) -> Result<Self, FrameError> {
        if payload.len() < 4 {
            return Err(FrameError::Malformed { port_id });
        }
        Ok(Self {
            sample_counter: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            data: &payload[4..],
        })
    }

    /// Encode into a streaming frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.extend_from_slice(&self.sample_counter.to_le_bytes());
        out.extend_from_slice(self.data);
        out
    }
}

/// Stream-signal message header preceding the sample data in a `!data`
/// publication payload
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalHeader {
    pub sample_id: u64,
    /// Instrument native rate in Hz
    pub sample_rate: u32,
    pub decimate_factor: u32,
    pub field_id: u8,
    /// Channel index for multi-instance fields
    pub index: u8,
    pub element_type: ElementType,
    pub element_size_bits: u8,
    pub element_count: u32,
    pub time_map: TimeMap,
}

/// Encoded size of a [`SignalHeader`]
pub const SIGNAL_HEADER_SIZE: usize = 48;

impl SignalHeader {
    /// Encode into the head of a publication payload.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.sample_id);
        buf.put_u32_le(self.sample_rate);
        buf.put_u32_le(self.decimate_factor);
        buf.put_u8(self.field_id);
        buf.put_u8(self.index);
        buf.put_u8(self.element_type as u8);
        buf.put_u8(self.element_size_bits);
        buf.put_u32_le(self.element_count);
        buf.put_u64_le(self.time_map.offset_counter);
        buf.put_i64_le(self.time_map.offset_time);
        buf.put_f64_le(self.time_map.counter_rate);
    }

    /// Decode from the head of a publication payload.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let malformed = || FrameError::Malformed { port_id: 0xFF };
        if payload.len() < SIGNAL_HEADER_SIZE {
            return Err(malformed());
        }
        let mut buf = payload;
        Ok(Self {
            sample_id: buf.get_u64_le(),
            sample_rate: buf.get_u32_le(),
            decimate_factor: buf.get_u32_le(),
            field_id: buf.get_u8(),
            index: buf.get_u8(),
            element_type: ElementType::try_from(buf.get_u8())?,
            element_size_bits: buf.get_u8(),
            element_count: buf.get_u32_le(),
            time_map: TimeMap {
                offset_counter: buf.get_u64_le(),
                offset_time: buf.get_i64_le(),
                counter_rate: buf.get_f64_le(),
            },
        })
    }
}

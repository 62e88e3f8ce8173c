//! Tagged value carrier
//!
//! A [`Value`] is the payload of every broker publication: one scalar or blob
//! plus the auxiliary bytes that travel with it on the wire. The `op` byte is
//! a sub-discriminator (JSON token kinds, suffix command codes); the
//! [`AppPayload`] tag narrows how a `Bin` blob is to be interpreted.

use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Flags carried by every value
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ValueFlags: u8 {
        /// Store as the topic's retained value
        const RETAIN = 0x01;
        /// Value never changes after first publish
        const CONST = 0x02;
    }
}

/// Application-level layout tag for `Bin` payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AppPayload {
    /// Uninterpreted bytes
    #[default]
    Plain = 0,
    /// Device descriptor record
    Device = 1,
    /// Stream frame payload
    Stream = 2,
    /// Statistics block
    Statistics = 3,
    /// 8-byte USB control setup packet
    UsbCtrl = 4,
    /// Buffer request record
    BufferReq = 5,
    /// Buffer response record
    BufferRsp = 6,
    /// Buffer info record
    BufferInfo = 7,
}

impl TryFrom<u8> for AppPayload {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Plain,
            1 => Self::Device,
            2 => Self::Stream,
            3 => Self::Statistics,
            4 => Self::UsbCtrl,
            5 => Self::BufferReq,
            6 => Self::BufferRsp,
            7 => Self::BufferInfo,
            _ => return Err(Error::ParameterInvalid(format!("app payload tag {value}"))),
        })
    }
}

/// Value type discriminant, also the `dtype` vocabulary of the metadata schema
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dtype {
    Null,
    Str,
    Json,
    Bin,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl Dtype {
    /// The metadata-schema name for this dtype.
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Null => "null",
            Dtype::Str => "str",
            Dtype::Json => "json",
            Dtype::Bin => "bin",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
            Dtype::I8 => "i8",
            Dtype::I16 => "i16",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::U8 => "u8",
            Dtype::U16 => "u16",
            Dtype::U32 => "u32",
            Dtype::U64 => "u64",
        }
    }

    /// Parse a metadata-schema dtype name.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "null" => Dtype::Null,
            "str" => Dtype::Str,
            "json" => Dtype::Json,
            "bin" => Dtype::Bin,
            "f32" => Dtype::F32,
            "f64" => Dtype::F64,
            "i8" => Dtype::I8,
            "i16" => Dtype::I16,
            "i32" => Dtype::I32,
            "i64" => Dtype::I64,
            "u8" => Dtype::U8,
            "u16" => Dtype::U16,
            "u32" => Dtype::U32,
            "u64" => Dtype::U64,
            _ => return Err(Error::ParameterInvalid(format!("dtype {name:?}"))),
        })
    }

    /// Whether values of this dtype carry a length (string/blob kinds).
    pub fn is_pointer_kind(&self) -> bool {
        matches!(self, Dtype::Str | Dtype::Json | Dtype::Bin)
    }
}

/// The tagged union proper
#[derive(Clone, Debug, PartialEq)]
pub enum ValueData {
    Null,
    Str(String),
    Json(String),
    Bin(Vec<u8>),
    F32(f32),
    F64(f64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

/// Tagged scalar/blob carrier with flags and application payload tag
#[derive(Clone, Debug, Default)]
pub struct Value {
    pub data: ValueData,
    pub flags: ValueFlags,
    pub op: u8,
    pub app: AppPayload,
}

impl Default for ValueData {
    fn default() -> Self {
        ValueData::Null
    }
}

/// Equality compares type and scalar/blob payload only; use
/// [`Value::eq_exact`] to also compare the auxiliary bytes.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

macro_rules! scalar_ctor {
    ($name:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("Construct a `", stringify!($ty), "` value.")]
        pub fn $name(v: $ty) -> Self {
            Self::from_data(ValueData::$variant(v))
        }
    };
}

impl Value {
    fn from_data(data: ValueData) -> Self {
        Self {
            data,
            flags: ValueFlags::empty(),
            op: 0,
            app: AppPayload::Plain,
        }
    }

    /// The null value.
    pub fn null() -> Self {
        Self::from_data(ValueData::Null)
    }

    /// Construct a UTF-8 string value.
    pub fn str(s: impl Into<String>) -> Self {
        Self::from_data(ValueData::Str(s.into()))
    }

    /// Construct a JSON string value.
    pub fn json(s: impl Into<String>) -> Self {
        Self::from_data(ValueData::Json(s.into()))
    }

    /// Construct a binary blob value.
    pub fn bin(b: impl Into<Vec<u8>>) -> Self {
        Self::from_data(ValueData::Bin(b.into()))
    }

    scalar_ctor!(f32, F32, f32);
    scalar_ctor!(f64, F64, f64);
    scalar_ctor!(i8, I8, i8);
    scalar_ctor!(i16, I16, i16);
    scalar_ctor!(i32, I32, i32);
    scalar_ctor!(i64, I64, i64);
    scalar_ctor!(u8, U8, u8);
    scalar_ctor!(u16, U16, u16);
    scalar_ctor!(u32, U32, u32);
    scalar_ctor!(u64, U64, u64);

    /// Set the RETAIN flag.
    pub fn retained(mut self) -> Self {
        self.flags |= ValueFlags::RETAIN;
        self
    }

    /// Replace the flag set.
    pub fn with_flags(mut self, flags: ValueFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the op sub-discriminator byte.
    pub fn with_op(mut self, op: u8) -> Self {
        self.op = op;
        self
    }

    /// Set the application payload tag.
    pub fn with_app(mut self, app: AppPayload) -> Self {
        self.app = app;
        self
    }

    /// Exact equality: payload plus flags, op, and app tag.
    pub fn eq_exact(&self, other: &Self) -> bool {
        self == other && self.flags == other.flags && self.op == other.op && self.app == other.app
    }

    /// The dtype of this value.
    pub fn dtype(&self) -> Dtype {
        match &self.data {
            ValueData::Null => Dtype::Null,
            ValueData::Str(_) => Dtype::Str,
            ValueData::Json(_) => Dtype::Json,
            ValueData::Bin(_) => Dtype::Bin,
            ValueData::F32(_) => Dtype::F32,
            ValueData::F64(_) => Dtype::F64,
            ValueData::I8(_) => Dtype::I8,
            ValueData::I16(_) => Dtype::I16,
            ValueData::I32(_) => Dtype::I32,
            ValueData::I64(_) => Dtype::I64,
            ValueData::U8(_) => Dtype::U8,
            ValueData::U16(_) => Dtype::U16,
            ValueData::U32(_) => Dtype::U32,
            ValueData::U64(_) => Dtype::U64,
        }
    }

    /// Payload size. Meaningful only for pointer-kind values; for strings it
    /// includes the NUL terminator the wire format carries.
    pub fn size(&self) -> Option<usize> {
        match &self.data {
            ValueData::Str(s) | ValueData::Json(s) => Some(s.len() + 1),
            ValueData::Bin(b) => Some(b.len()),
            _ => None,
        }
    }

    /// Widen to i64. Unsigned values above `i64::MAX` and non-integer kinds
    /// return `None`; the full 64 bits are always preserved.
    pub fn as_i64(&self) -> Option<i64> {
        match self.data {
            ValueData::I8(v) => Some(i64::from(v)),
            ValueData::I16(v) => Some(i64::from(v)),
            ValueData::I32(v) => Some(i64::from(v)),
            ValueData::I64(v) => Some(v),
            ValueData::U8(v) => Some(i64::from(v)),
            ValueData::U16(v) => Some(i64::from(v)),
            ValueData::U32(v) => Some(i64::from(v)),
            ValueData::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Widen to u64. Negative values and non-integer kinds return `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self.data {
            ValueData::I8(v) => u64::try_from(v).ok(),
            ValueData::I16(v) => u64::try_from(v).ok(),
            ValueData::I32(v) => u64::try_from(v).ok(),
            ValueData::I64(v) => u64::try_from(v).ok(),
            ValueData::U8(v) => Some(u64::from(v)),
            ValueData::U16(v) => Some(u64::from(v)),
            ValueData::U32(v) => Some(u64::from(v)),
            ValueData::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Convert any numeric kind to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self.data {
            ValueData::F32(v) => Some(f64::from(v)),
            ValueData::F64(v) => Some(v),
            ValueData::I8(v) => Some(f64::from(v)),
            ValueData::I16(v) => Some(f64::from(v)),
            ValueData::I32(v) => Some(f64::from(v)),
            ValueData::I64(v) => Some(v as f64),
            ValueData::U8(v) => Some(f64::from(v)),
            ValueData::U16(v) => Some(f64::from(v)),
            ValueData::U32(v) => Some(f64::from(v)),
            ValueData::U64(v) => Some(v as f64),
            _ => None,
        }
    }

    /// The string payload, when this is a Str or Json value.
    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ValueData::Str(s) | ValueData::Json(s) => Some(s),
            _ => None,
        }
    }

    /// The blob payload, when this is a Bin value.
    pub fn as_bin(&self) -> Option<&[u8]> {
        match &self.data {
            ValueData::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// Cast to `dtype`, preserving flags/op/app. Numeric casts are checked;
    /// strings parse when the target is numeric. Out-of-range or unparsable
    /// inputs fail with `ParameterInvalid`.
    pub fn cast_to(&self, dtype: Dtype) -> Result<Value> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let invalid = || Error::ParameterInvalid(format!("cannot cast to {}", dtype.name()));
        let data = match dtype {
            Dtype::Null => ValueData::Null,
            Dtype::Str => ValueData::Str(self.as_str().ok_or_else(invalid)?.to_string()),
            Dtype::Json => ValueData::Json(self.as_str().ok_or_else(invalid)?.to_string()),
            Dtype::Bin => ValueData::Bin(self.as_bin().ok_or_else(invalid)?.to_vec()),
            Dtype::F32 => ValueData::F32(self.numeric_f64()? as f32),
            Dtype::F64 => ValueData::F64(self.numeric_f64()?),
            Dtype::I8 => ValueData::I8(self.numeric_i64()?.try_into().map_err(|_| invalid())?),
            Dtype::I16 => ValueData::I16(self.numeric_i64()?.try_into().map_err(|_| invalid())?),
            Dtype::I32 => ValueData::I32(self.numeric_i64()?.try_into().map_err(|_| invalid())?),
            Dtype::I64 => ValueData::I64(self.numeric_i64()?),
            Dtype::U8 => ValueData::U8(self.numeric_u64()?.try_into().map_err(|_| invalid())?),
            Dtype::U16 => ValueData::U16(self.numeric_u64()?.try_into().map_err(|_| invalid())?),
            Dtype::U32 => ValueData::U32(self.numeric_u64()?.try_into().map_err(|_| invalid())?),
            Dtype::U64 => ValueData::U64(self.numeric_u64()?),
        };
        Ok(Value {
            data,
            flags: self.flags,
            op: self.op,
            app: self.app,
        })
    }

    fn numeric_i64(&self) -> Result<i64> {
        if let Some(v) = self.as_i64() {
            return Ok(v);
        }
        if let ValueData::F32(_) | ValueData::F64(_) = self.data {
            let f = self.as_f64().unwrap();
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                return Ok(f as i64);
            }
        }
        if let Some(s) = self.as_str() {
            if let Ok(v) = s.trim().parse::<i64>() {
                return Ok(v);
            }
        }
        Err(Error::ParameterInvalid("not an integer".into()))
    }

    fn numeric_u64(&self) -> Result<u64> {
        if let Some(v) = self.as_u64() {
            return Ok(v);
        }
        if let ValueData::F32(_) | ValueData::F64(_) = self.data {
            let f = self.as_f64().unwrap();
            if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 {
                return Ok(f as u64);
            }
        }
        if let Some(s) = self.as_str() {
            if let Ok(v) = s.trim().parse::<u64>() {
                return Ok(v);
            }
        }
        Err(Error::ParameterInvalid("not an unsigned integer".into()))
    }

    fn numeric_f64(&self) -> Result<f64> {
        if let Some(v) = self.as_f64() {
            return Ok(v);
        }
        if let Some(s) = self.as_str() {
            if let Ok(v) = s.trim().parse::<f64>() {
                return Ok(v);
            }
        }
        Err(Error::ParameterInvalid("not numeric".into()))
    }
}

//! Topic metadata schema and value coercion
//!
//! Metadata is a JSON document published on a `$` topic. The broker uses it
//! to validate and coerce every subsequent publish to the base topic:
//! enum-style option lookup, range clamping, and dtype casting.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use wattbus_core::error::{Error, Result};
use wattbus_core::value::{Dtype, Value};

/// Parsed metadata document
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Metadata {
    pub dtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    /// `[value, name]` or `[value, name, alias]` entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Vec<JsonValue>>>,
    /// `[lo, hi]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Subset of `ro`, `hide`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

impl Metadata {
    /// Parse a metadata JSON document, checking the dtype name.
    pub fn parse(json: &str) -> Result<Self> {
        let meta: Metadata = serde_json::from_str(json)
            .map_err(|e| Error::ParameterInvalid(format!("metadata json: {e}")))?;
        Dtype::from_name(&meta.dtype)?;
        Ok(meta)
    }

    /// The declared dtype.
    pub fn dtype(&self) -> Dtype {
        // parse() verified the name.
        Dtype::from_name(&self.dtype).unwrap_or(Dtype::Null)
    }

    /// Whether the topic rejects writes from clients.
    pub fn is_read_only(&self) -> bool {
        self.flags
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == "ro"))
    }

    /// Whether UIs should hide the topic.
    pub fn is_hidden(&self) -> bool {
        self.flags
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == "hide"))
    }

    /// The default value, coerced to the declared dtype.
    pub fn default_value(&self) -> Option<Value> {
        let default = self.default.as_ref()?;
        self.coerce(&json_to_value(default)?).ok()
    }

    /// Validate and coerce a published value: option lookup when options are
    /// declared, then a checked dtype cast, then range clamping. The input's
    /// flags and auxiliary bytes carry over to the coerced value.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        let dtype = self.dtype();
        let mut coerced = match &self.options {
            Some(options) => self.lookup_option(options, value)?.cast_to(dtype)?,
            None => value.cast_to(dtype)?,
        };
        if let Some(range) = &self.range {
            coerced = clamp_to_range(coerced, range)?;
        }
        coerced.flags = value.flags;
        coerced.op = value.op;
        coerced.app = value.app;
        Ok(coerced)
    }

    /// Match a value against the options list by option value, name, or
    /// alias. Strings match names first; numerics match option values.
    fn lookup_option(&self, options: &[Vec<JsonValue>], value: &Value) -> Result<Value> {
        for option in options {
            let Some(opt_value) = option.first() else {
                continue;
            };
            // Name or alias match for string inputs.
            if let Some(s) = value.as_str() {
                if option.iter().skip(1).any(|n| n.as_str() == Some(s)) {
                    return json_to_value(opt_value)
                        .ok_or_else(|| Error::ParameterInvalid("option value".into()));
                }
            }
            // Value match for numeric inputs (or numeric strings).
            if let Some(v) = value.as_f64().or_else(|| {
                value
                    .as_str()
                    .and_then(|s| s.trim().parse::<f64>().ok())
            }) {
                if opt_value.as_f64() == Some(v) {
                    return json_to_value(opt_value)
                        .ok_or_else(|| Error::ParameterInvalid("option value".into()));
                }
            }
        }
        Err(Error::ParameterInvalid(format!(
            "no matching option for {value:?}"
        )))
    }
}

/// Convert a JSON scalar into a driver value.
fn json_to_value(json: &JsonValue) -> Option<Value> {
    match json {
        JsonValue::Null => Some(Value::null()),
        JsonValue::Bool(b) => Some(Value::u8(u8::from(*b))),
        JsonValue::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(Value::u64(u))
            } else if let Some(i) = n.as_i64() {
                Some(Value::i64(i))
            } else {
                n.as_f64().map(Value::f64)
            }
        }
        JsonValue::String(s) => Some(Value::str(s.clone())),
        _ => None,
    }
}

/// Clamp a numeric value into `[lo, hi]`, preserving its dtype.
fn clamp_to_range(value: Value, range: &[JsonValue]) -> Result<Value> {
    if range.len() != 2 {
        return Err(Error::ParameterInvalid("range must be [lo, hi]".into()));
    }
    let (Some(lo), Some(hi)) = (range[0].as_f64(), range[1].as_f64()) else {
        return Err(Error::ParameterInvalid("range bounds not numeric".into()));
    };
    let Some(x) = value.as_f64() else {
        // Non-numeric dtypes ignore range.
        return Ok(value);
    };
    if x >= lo && x <= hi {
        return Ok(value);
    }
    Value::f64(x.clamp(lo, hi)).cast_to(value.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE_SELECT_META: &str = r#"{
        "dtype": "u8",
        "brief": "current range",
        "options": [[0, "off"], [1, "10 A"], [2, "2 A"]]
    }"#;

    #[test]
    fn test_parse_and_flags() {
        let meta = Metadata::parse(
            r#"{"dtype": "u32", "brief": "b", "flags": ["ro", "hide"], "default": 7}"#,
        )
        .unwrap();
        assert_eq!(meta.dtype(), Dtype::U32);
        assert!(meta.is_read_only());
        assert!(meta.is_hidden());
        assert_eq!(meta.default_value().unwrap(), Value::u32(7));

        assert!(Metadata::parse(r#"{"dtype": "float"}"#).is_err());
        assert!(Metadata::parse("not json").is_err());
    }

    #[test]
    fn test_option_lookup_by_name() {
        let meta = Metadata::parse(RANGE_SELECT_META).unwrap();
        assert_eq!(meta.coerce(&Value::str("2 A")).unwrap(), Value::u8(2));
        assert_eq!(meta.coerce(&Value::str("off")).unwrap(), Value::u8(0));
        assert!(matches!(
            meta.coerce(&Value::str("unknown")),
            Err(Error::ParameterInvalid(_))
        ));
    }

    #[test]
    fn test_option_lookup_by_value() {
        let meta = Metadata::parse(RANGE_SELECT_META).unwrap();
        assert_eq!(meta.coerce(&Value::u32(1)).unwrap(), Value::u8(1));
        assert!(meta.coerce(&Value::u32(9)).is_err());
    }

    #[test]
    fn test_option_lookup_by_alias() {
        let meta = Metadata::parse(
            r#"{"dtype": "u8", "options": [[0, "off", "disabled"], [1, "on"]]}"#,
        )
        .unwrap();
        assert_eq!(meta.coerce(&Value::str("disabled")).unwrap(), Value::u8(0));
    }

    #[test]
    fn test_range_clamp() {
        let meta =
            Metadata::parse(r#"{"dtype": "i32", "range": [-10, 10]}"#).unwrap();
        assert_eq!(meta.coerce(&Value::i32(5)).unwrap(), Value::i32(5));
        assert_eq!(meta.coerce(&Value::i32(50)).unwrap(), Value::i32(10));
        assert_eq!(meta.coerce(&Value::i32(-50)).unwrap(), Value::i32(-10));
    }

    #[test]
    fn test_dtype_cast() {
        let meta = Metadata::parse(r#"{"dtype": "u16"}"#).unwrap();
        assert_eq!(meta.coerce(&Value::u8(9)).unwrap(), Value::u16(9));
        assert_eq!(meta.coerce(&Value::str("12")).unwrap(), Value::u16(12));
        assert!(meta.coerce(&Value::i32(-1)).is_err());
    }
}

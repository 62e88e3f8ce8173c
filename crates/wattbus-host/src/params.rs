//! Device parameter model
//!
//! Each instrument exposes a table of parameters under its topic prefix:
//! host-computed settings under `h/`, per-signal stream enables under
//! `s/<signal>/ctrl`, and read-only identifiers under `c/`. Every parameter
//! carries a metadata document the broker uses to validate writes; the
//! upper-level device publishes the metadata and defaults at open.

use std::collections::HashMap;
use wattbus_core::value::Value;
use wattbus_wire::stream::FieldId;

/// One table entry
#[derive(Clone, Copy, Debug)]
pub struct Param {
    /// Topic relative to the device prefix
    pub topic: &'static str,
    /// Metadata JSON document
    pub meta: &'static str,
}

const BOOL_CTRL: &str = r#"{"dtype": "u8", "brief": "stream enable", "options": [[0, "off"], [1, "on"]], "default": 0}"#;

/// The device parameter table.
pub const PARAMS: &[Param] = &[
    Param {
        topic: "h/state",
        meta: r#"{"dtype": "u8", "brief": "device state", "options": [[0, "not_present"], [1, "closed"], [2, "opening"], [3, "open"]], "flags": ["ro"], "default": 1}"#,
    },
    Param {
        topic: "h/fs",
        meta: r#"{"dtype": "u32", "brief": "output sampling frequency in Hz", "options": [[1000000, "1 MHz"], [500000, "500 kHz"], [200000, "200 kHz"], [100000, "100 kHz"], [50000, "50 kHz"], [20000, "20 kHz"], [10000, "10 kHz"]], "default": 1000000}"#,
    },
    Param {
        topic: "h/filter",
        meta: r#"{"dtype": "u8", "brief": "decimation filter", "options": [[0, "average"], [1, "flat"]], "default": 1}"#,
    },
    Param {
        topic: "h/sup/mode",
        meta: r#"{"dtype": "u8", "brief": "range-change suppression", "options": [[0, "nan"], [1, "mean"], [2, "interp"]], "default": 2}"#,
    },
    Param {
        topic: "h/sup/matrix",
        meta: r#"{"dtype": "u8", "brief": "suppression window table", "options": [[0, "aggressive"], [1, "conservative"]], "default": 1}"#,
    },
    Param {
        topic: "s/i/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/v/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/p/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/adc0/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/adc1/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/adc2/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/adc3/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/gpi0/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/gpi1/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/gpi2/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/gpi3/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/trigger/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/uart0/ctrl",
        meta: BOOL_CTRL,
    },
    Param {
        topic: "s/stats/ctrl",
        meta: r#"{"dtype": "u8", "brief": "host statistics enable", "options": [[0, "off"], [1, "on"]], "default": 0}"#,
    },
    Param {
        topic: "s/sstats/ctrl",
        meta: r#"{"dtype": "u8", "brief": "instrument statistics enable", "options": [[0, "off"], [1, "on"]], "default": 0}"#,
    },
];

/// Device states published on `h/state`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    NotPresent = 0,
    Closed = 1,
    Opening = 2,
    Open = 3,
}

/// Cached parameter values plus the streaming aggregate
#[derive(Default)]
pub struct ParamStore {
    values: HashMap<String, Value>,
}

impl ParamStore {
    /// Record a parameter write; returns the previous value.
    pub fn set(&mut self, topic: &str, value: Value) -> Option<Value> {
        self.values.insert(topic.to_string(), value)
    }

    /// Current cached value.
    pub fn get(&self, topic: &str) -> Option<&Value> {
        self.values.get(topic)
    }

    /// Cached value as an unsigned integer, with a default.
    pub fn get_u64(&self, topic: &str, default: u64) -> u64 {
        self.get(topic).and_then(Value::as_u64).unwrap_or(default)
    }

    /// Whether a `s/<signal>/ctrl` enable is on.
    pub fn signal_enabled(&self, signal: &str) -> bool {
        self.get_u64(&format!("s/{signal}/ctrl"), 0) != 0
    }

    /// OR of every signal enable: whether the instrument should stream.
    pub fn is_streaming(&self) -> bool {
        self.values
            .iter()
            .any(|(topic, value)| {
                topic.starts_with("s/")
                    && topic.ends_with("/ctrl")
                    && value.as_u64().unwrap_or(0) != 0
            })
    }

    /// Bitmask of enabled streaming ports for the aggregate settings
    /// control (bit i = port 16+i).
    pub fn stream_mask(&self) -> u32 {
        let mut mask = 0u32;
        for (topic, value) in &self.values {
            if value.as_u64().unwrap_or(0) == 0 {
                continue;
            }
            let Some(signal) = topic
                .strip_prefix("s/")
                .and_then(|t| t.strip_suffix("/ctrl"))
            else {
                continue;
            };
            if let Some(field) = field_for_signal(signal) {
                mask |= 1 << field.code();
            }
        }
        mask
    }
}

/// Map a signal name to its streaming field.
pub fn field_for_signal(signal: &str) -> Option<FieldId> {
    Some(match signal {
        "adc0" => FieldId::RawAdc(0),
        "adc1" => FieldId::RawAdc(1),
        "adc2" => FieldId::RawAdc(2),
        "adc3" => FieldId::RawAdc(3),
        "irange" => FieldId::CurrentRange,
        "i" => FieldId::Current,
        "v" => FieldId::Voltage,
        "p" => FieldId::Power,
        "gpi0" => FieldId::Gpi(0),
        "gpi1" => FieldId::Gpi(1),
        "gpi2" => FieldId::Gpi(2),
        "gpi3" => FieldId::Gpi(3),
        "trigger" => FieldId::Trigger,
        "uart0" => FieldId::Uart0,
        "sstats" => FieldId::SensorStats,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    #[test]
    fn test_all_param_metadata_parses() {
        for param in PARAMS {
            let meta = Metadata::parse(param.meta)
                .unwrap_or_else(|e| panic!("{}: {e}", param.topic));
            assert!(meta.default_value().is_some(), "{} has no default", param.topic);
        }
    }

    #[test]
    fn test_is_streaming_aggregate() {
        let mut store = ParamStore::default();
        assert!(!store.is_streaming());
        store.set("s/i/ctrl", Value::u8(0));
        assert!(!store.is_streaming());
        store.set("s/i/ctrl", Value::u8(1));
        store.set("s/v/ctrl", Value::u8(1));
        assert!(store.is_streaming());
        store.set("s/i/ctrl", Value::u8(0));
        assert!(store.is_streaming(), "voltage still enabled");
        store.set("s/v/ctrl", Value::u8(0));
        assert!(!store.is_streaming());
    }

    #[test]
    fn test_stream_mask() {
        let mut store = ParamStore::default();
        store.set("s/i/ctrl", Value::u8(1));
        store.set("s/trigger/ctrl", Value::u8(1));
        store.set("s/v/ctrl", Value::u8(0));
        let mask = store.stream_mask();
        assert_eq!(mask, (1 << 5) | (1 << 12));
    }

    #[test]
    fn test_signal_field_mapping() {
        assert_eq!(field_for_signal("i"), Some(FieldId::Current));
        assert_eq!(field_for_signal("sstats"), Some(FieldId::SensorStats));
        assert_eq!(field_for_signal("stats"), None, "host stats is not a wire port");
        assert_eq!(field_for_signal("bogus"), None);
    }
}

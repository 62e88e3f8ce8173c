//! Routed message envelope
//!
//! A [`Message`] is the only thing that crosses a thread boundary in the
//! driver: a topic string, a [`Value`], and an extras union for the few
//! operations that need more than a value (USB control setup, stream buffer
//! loans, subscription records, queries).

use crate::error::Error;
use crate::queue::QueueSender;
use crate::value::Value;
use bitflags::bitflags;
use std::sync::Arc;

/// Upper bound for one stream-signal payload: one bulk USB transfer plus its
/// headers.
pub const MESSAGE_PAYLOAD_MAX: usize = 16 * 1024;

/// Identifies one subscriber for echo suppression and unsubscribe matching.
///
/// The C rendition of this driver identified subscribers by callback pointer
/// plus user data; here the registrar allocates an id instead.
pub type SubscriberId = u64;

bitflags! {
    /// Which message classes a subscriber receives
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SubscriberFlags: u8 {
        /// Normal value publications
        const PUB = 0x01;
        /// Metadata responses (`$` topics)
        const METADATA_RSP = 0x02;
        /// Return codes (`#` topics)
        const RETURN_CODE = 0x04;
        /// Replay retained values upon subscribing
        const RETAIN = 0x08;
    }
}

/// Where a subscriber's messages are delivered
#[derive(Clone)]
pub enum SubscriberSink {
    /// Deliver the full message to a thread's inbound queue
    Queue(QueueSender),
    /// Invoke a callback on the frontend thread; must not block
    Callback(Arc<dyn Fn(&Message) + Send + Sync>),
}

impl std::fmt::Debug for SubscriberSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberSink::Queue(q) => f.debug_tuple("Queue").field(&q.name()).finish(),
            SubscriberSink::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Subscription record carried by `_/!sub` and `_/!unsub` messages
#[derive(Clone, Debug)]
pub struct SubscriberSpec {
    pub id: SubscriberId,
    pub flags: SubscriberFlags,
    pub sink: SubscriberSink,
}

/// 8-byte USB control setup packet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsbSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl UsbSetup {
    /// Encode to the little-endian wire layout.
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.request_type;
        out[1] = self.request;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Decode from the little-endian wire layout.
    pub fn decode(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }
}

/// A bulk-IN transfer buffer on loan from the lower-level device.
///
/// The pool slot index is the buffer's identity: the upper layer must hand
/// the buffer back in a `stream_in_data` message so the transfer can be
/// re-submitted on the same slot.
#[derive(Debug)]
pub struct TransferBuf {
    pub slot: usize,
    pub data: Vec<u8>,
}

/// Extras union: operation-specific companions to the value
#[derive(Debug, Default)]
pub enum Extras {
    #[default]
    None,
    /// Control transfer: setup packet, completion status
    UsbCtrl {
        setup: UsbSetup,
        status: Option<Error>,
    },
    /// Streaming transfer: endpoint, completion status, loaned buffer
    Stream {
        endpoint: u8,
        status: Option<Error>,
        buffer: Option<TransferBuf>,
    },
    /// Subscription record for broker control topics
    Subscriber(SubscriberSpec),
    /// Query request; the response is pushed to `reply`
    Query { reply: QueueSender },
}

/// Routed envelope: topic + value + extras
#[derive(Debug, Default)]
pub struct Message {
    pub topic: String,
    pub value: Value,
    pub extras: Extras,
    /// Publishing subscriber, for echo suppression
    pub src: Option<SubscriberId>,
}

impl Message {
    /// A plain publication.
    pub fn publish(topic: impl Into<String>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            value,
            extras: Extras::None,
            src: None,
        }
    }

    /// Tag the publishing subscriber for echo suppression.
    pub fn with_src(mut self, src: SubscriberId) -> Self {
        self.src = Some(src);
        self
    }

    /// A return-code publication on `topic#`.
    pub fn return_code(topic: &str, status: Result<(), Error>) -> Self {
        let code = match &status {
            Ok(()) => i32::from(Error::SUCCESS),
            Err(e) => i32::from(e.code()),
        };
        Self::publish(format!("{topic}#"), Value::i32(code))
    }

    /// Shallow copy for fan-out: everything except the loaned buffer, which
    /// has exactly one owner at all times.
    pub fn fanout_clone(&self) -> Self {
        let extras = match &self.extras {
            Extras::None => Extras::None,
            Extras::UsbCtrl { setup, status } => Extras::UsbCtrl {
                setup: *setup,
                status: status.clone(),
            },
            Extras::Stream {
                endpoint, status, ..
            } => Extras::Stream {
                endpoint: *endpoint,
                status: status.clone(),
                buffer: None,
            },
            Extras::Subscriber(spec) => Extras::Subscriber(spec.clone()),
            Extras::Query { reply } => Extras::Query {
                reply: reply.clone(),
            },
        };
        Self {
            topic: self.topic.clone(),
            value: self.value.clone(),
            extras,
            src: self.src,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_setup_roundtrip() {
        let setup = UsbSetup {
            request_type: 0xC0,
            request: 0x12,
            value: 0x3456,
            index: 0x0002,
            length: 512,
        };
        let raw = setup.encode();
        assert_eq!(raw[2], 0x56); // little endian
        assert_eq!(UsbSetup::decode(&raw), setup);
    }

    #[test]
    fn test_return_code_topic() {
        let ok = Message::return_code("u/js220/001/h/state", Ok(()));
        assert_eq!(ok.topic, "u/js220/001/h/state#");
        assert_eq!(ok.value, Value::i32(0));

        let err = Message::return_code("a/b", Err(Error::TimedOut));
        assert_eq!(err.value, Value::i32(i32::from(Error::TimedOut.code())));
    }

    #[test]
    fn test_fanout_clone_drops_loaned_buffer() {
        let msg = Message {
            topic: "x".into(),
            value: Value::null(),
            extras: Extras::Stream {
                endpoint: 0x82,
                status: None,
                buffer: Some(TransferBuf {
                    slot: 3,
                    data: vec![0; 16],
                }),
            },
            src: None,
        };
        let copy = msg.fanout_clone();
        match copy.extras {
            Extras::Stream { buffer, .. } => assert!(buffer.is_none()),
            _ => panic!("extras kind changed"),
        }
    }
}

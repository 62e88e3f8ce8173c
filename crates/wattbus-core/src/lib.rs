//! Core types for the wattbus instrument driver.
//!
//! Everything that crosses a thread boundary lives here: the tagged [`Value`]
//! carrier, bounded [`Topic`] paths, the routed [`Message`] envelope, and the
//! MPSC [`queue`] that every driver thread drains at its top level.

pub mod error;
pub mod message;
pub mod queue;
pub mod timemap;
pub mod topic;
pub mod value;

pub use error::{Error, Result};
pub use message::{Extras, Message, SubscriberFlags, SubscriberId, SubscriberSink, SubscriberSpec, TransferBuf, UsbSetup};
pub use queue::{message_queue, QueueReceiver, QueueSender};
pub use timemap::{TimeMap, TimeMapFilter};
pub use topic::{Suffix, Topic};
pub use value::{AppPayload, Dtype, Value, ValueFlags};

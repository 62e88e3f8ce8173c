//! Host-side driver core for wattbus power-measurement instruments
//!
//! The [`Frontend`] thread owns the topic-tree [`Broker`]; a [`Backend`]
//! thread watches for instrument arrival and spawns one [`lldevice`] USB
//! transport thread plus one [`uldevice`] protocol-engine thread per
//! instrument. Everything communicates through `wattbus_core` message
//! queues; the broker tree is touched by the frontend thread only.

pub mod backend;
pub mod broker;
pub mod frontend;
pub mod lldevice;
pub mod memops;
pub mod metadata;
pub mod params;
pub mod sim;
pub mod stream_port;
pub mod transport;
pub mod uldevice;

pub use backend::{Backend, BackendConfig};
pub use broker::Broker;
pub use frontend::{Frontend, FrontendHandle};
pub use metadata::Metadata;
pub use transport::{DeviceInfo, DeviceScanner, TransferComplete, TransferKind, UsbTransport};

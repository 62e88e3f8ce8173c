//! Bit-exact wire protocol for wattbus instruments
//!
//! The instrument multiplexes everything over fixed 512-byte bulk frames.
//! Ports 0-15 carry control-plane services (link, pub/sub, logging, memory);
//! ports 16-31 carry streaming sample data. All integers are little-endian.

pub mod frame;
pub mod link;
pub mod memory;
pub mod pubsub;
pub mod stream;

pub use frame::{Frame, FrameError, FRAME_HEADER_SIZE, FRAME_PAYLOAD_MAX, FRAME_SIZE};
pub use link::{ConnectInfo, LinkMsg, PROTOCOL_MAJOR, PROTOCOL_MINOR};
pub use memory::MemoryMsg;
pub use pubsub::PubSubMsg;
pub use stream::{extend_sample_id, field_for_port, ElementType, FieldId, FieldInfo, SignalHeader};

/// Control-plane port ids
pub mod port {
    /// Link control: connect, echo, time synchronization
    pub const LINK: u8 = 0;
    /// Inbound pub/sub
    pub const PUBSUB: u8 = 1;
    /// Instrument log stream
    pub const LOGGING: u8 = 2;
    /// Flash memory operations
    pub const MEMORY: u8 = 3;
    /// First streaming data port
    pub const STREAM_BASE: u8 = 16;

    /// Whether a port id selects a streaming data port.
    pub fn is_stream(port_id: u8) -> bool {
        (STREAM_BASE..32).contains(&port_id)
    }
}

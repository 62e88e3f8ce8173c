//! USB transport abstraction
//!
//! OS-specific enumeration and transfer plumbing (WinUSB, libusb) live
//! outside the core; the lower-level device thread drives this submit/poll
//! interface instead. Transfers complete asynchronously: `submit_*` queues
//! work, `poll` surfaces one completion at a time, mirroring the libusb
//! event-handling model.

use std::time::Duration;
use wattbus_core::error::{Error, Result};
use wattbus_core::message::UsbSetup;

/// One enumerated instrument
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Model identifier, e.g. `js220`
    pub model: String,
    /// Serial number string
    pub serial: String,
    /// OS transport path, opaque to the core
    pub path: String,
}

impl DeviceInfo {
    /// The broker topic prefix for this instrument.
    pub fn prefix(&self) -> String {
        format!("u/{}/{}", self.model, self.serial)
    }
}

/// Transfer class of a completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    BulkIn,
    BulkOut,
}

/// One completed transfer surfaced by [`UsbTransport::poll`]
#[derive(Debug)]
pub struct TransferComplete {
    pub kind: TransferKind,
    pub endpoint: u8,
    /// The transfer buffer. For bulk IN, `result` holds the valid length.
    pub data: Vec<u8>,
    /// Transferred byte count, or the failure taxon (`TimedOut` for a
    /// transfer timeout, `Aborted` for cancellation, `Io` otherwise)
    pub result: Result<usize>,
}

/// Per-device USB transfer interface, driven by one thread
pub trait UsbTransport: Send {
    /// Open the device handle.
    fn open(&mut self) -> Result<()>;

    /// Close the device handle; in-flight transfers complete as `Aborted`.
    fn close(&mut self);

    /// Queue a control transfer. `data` carries OUT payload; IN length comes
    /// from the setup packet.
    fn submit_control(&mut self, setup: UsbSetup, data: Vec<u8>) -> Result<()>;

    /// Queue a bulk IN transfer with a caller-provided buffer.
    fn submit_bulk_in(&mut self, endpoint: u8, buffer: Vec<u8>) -> Result<()>;

    /// Queue a bulk OUT transfer.
    fn submit_bulk_out(&mut self, endpoint: u8, data: Vec<u8>) -> Result<()>;

    /// Wait up to `timeout` for the next completion.
    fn poll(&mut self, timeout: Duration) -> Option<TransferComplete>;

    /// Cancel in-flight transfers on one endpoint.
    fn cancel(&mut self, endpoint: u8);

    /// Cancel everything in flight.
    fn cancel_all(&mut self);
}

/// Platform device enumeration, polled by the backend thread
pub trait DeviceScanner: Send {
    /// Instruments currently present.
    fn scan(&mut self) -> Vec<DeviceInfo>;

    /// Open a transport for one instrument.
    fn open(&mut self, info: &DeviceInfo) -> Result<Box<dyn UsbTransport>>;
}

/// Helper for transports: a completion that failed before submission.
pub fn failed_completion(kind: TransferKind, endpoint: u8, err: Error) -> TransferComplete {
    TransferComplete {
        kind,
        endpoint,
        data: Vec::new(),
        result: Err(err),
    }
}

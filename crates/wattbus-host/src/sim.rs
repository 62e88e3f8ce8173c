//! Simulated instrument
//!
//! A [`UsbTransport`] implementation that speaks the framed wire protocol
//! from the instrument side: connect handshake, echo, ping/pong, settings
//! controls, memory operations, and constant-valued current/voltage
//! streaming. It stands in for the out-of-scope OS USB layer in tests and
//! exercises every codec from the opposite direction.

use crate::transport::{DeviceInfo, DeviceScanner, TransferComplete, TransferKind, UsbTransport};
use crate::uldevice::req;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use wattbus_core::error::{Error, Result};
use wattbus_core::message::UsbSetup;
use wattbus_wire::frame::{Frame, FRAME_SIZE};
use wattbus_wire::link::{pack_version, ConnectInfo, LinkMsg, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use wattbus_wire::memory::MemoryMsg;
use wattbus_wire::port;
use wattbus_wire::pubsub::PubSubMsg;
use wattbus_wire::stream::StreamFrame;
use wattbus_core::value::Value;

/// Elements per generated streaming frame
const GEN_ELEMENTS: usize = 100;
/// Streaming frames per enabled float port per poll
const GEN_FRAMES_PER_POLL: usize = 5;
/// Constant generated current in amperes
pub const GEN_CURRENT: f32 = 0.5;
/// Constant generated voltage in volts
pub const GEN_VOLTAGE: f32 = 2.0;

/// Shared hotplug state: tests plug and unplug through [`SimPlug`].
#[derive(Default)]
struct PlugBoard {
    devices: Vec<DeviceInfo>,
}

/// Test-side handle controlling which instruments are "present"
#[derive(Clone)]
pub struct SimPlug {
    board: Arc<Mutex<PlugBoard>>,
}

impl SimPlug {
    /// Make an instrument visible to the scanner.
    pub fn plug(&self, info: DeviceInfo) {
        self.board.lock().devices.push(info);
    }

    /// Remove an instrument by serial.
    pub fn unplug(&self, serial: &str) {
        self.board.lock().devices.retain(|d| d.serial != serial);
    }
}

/// Scanner over the simulated plug board
pub struct SimScanner {
    board: Arc<Mutex<PlugBoard>>,
    /// Protocol major the simulated instruments report
    pub protocol_major: u8,
}

impl SimScanner {
    pub fn new() -> (Self, SimPlug) {
        let board = Arc::new(Mutex::new(PlugBoard::default()));
        (
            Self {
                board: board.clone(),
                protocol_major: PROTOCOL_MAJOR,
            },
            SimPlug { board },
        )
    }
}

impl DeviceScanner for SimScanner {
    fn scan(&mut self) -> Vec<DeviceInfo> {
        self.board.lock().devices.clone()
    }

    fn open(&mut self, info: &DeviceInfo) -> Result<Box<dyn UsbTransport>> {
        Ok(Box::new(SimInstrument::new(info.clone(), self.protocol_major)))
    }
}

/// One simulated instrument behind the transport interface
pub struct SimInstrument {
    info: DeviceInfo,
    protocol_major: u8,
    open: bool,
    completions: VecDeque<TransferComplete>,
    /// Bulk-IN buffers submitted by the host, waiting for data
    in_buffers: VecDeque<Vec<u8>>,
    /// Whole 512-byte frames waiting for an IN buffer
    pending_frames: VecDeque<Vec<u8>>,
    frame_id: u16,
    stream_mask: u32,
    sample_counter: u32,
    /// Committed flash regions
    regions: HashMap<u8, Vec<u8>>,
    /// Write in progress per region
    staging: HashMap<u8, Vec<u8>>,
    timesync_sent: bool,
}

impl SimInstrument {
    pub fn new(info: DeviceInfo, protocol_major: u8) -> Self {
        Self {
            info,
            protocol_major,
            open: false,
            completions: VecDeque::new(),
            in_buffers: VecDeque::new(),
            pending_frames: VecDeque::new(),
            frame_id: 0,
            stream_mask: 0,
            sample_counter: 0,
            regions: HashMap::new(),
            staging: HashMap::new(),
            timesync_sent: false,
        }
    }

    /// Identity of the simulated instrument.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn queue_frame(&mut self, port_id: u8, payload: Vec<u8>) {
        let frame = Frame::new(self.frame_id, port_id, payload).expect("sim frame payload");
        self.frame_id = self.frame_id.wrapping_add(1);
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        frame.encode(&mut buf);
        self.pending_frames.push_back(buf.to_vec());
    }

    fn on_host_frame(&mut self, frame: Frame) {
        match frame.port_id {
            port::LINK => self.on_link(&frame.payload),
            port::PUBSUB => self.on_pubsub(&frame.payload),
            port::MEMORY => self.on_memory(&frame.payload),
            other => {
                let _ = other;
            }
        }
    }

    fn on_link(&mut self, payload: &[u8]) {
        match LinkMsg::decode(payload) {
            Ok(LinkMsg::Connect(_)) => {
                let rsp = LinkMsg::ConnectRsp(ConnectInfo {
                    protocol_major: self.protocol_major,
                    protocol_minor: PROTOCOL_MINOR,
                    hw_version: pack_version(2, 0, 0),
                    fw_version: pack_version(1, 2, 3),
                    fpga_version: pack_version(1, 0, 0),
                });
                self.queue_frame(port::LINK, rsp.encode());
                if !self.timesync_sent {
                    self.timesync_sent = true;
                    let req = LinkMsg::TimeSyncReq {
                        start_count: u64::from(self.sample_counter),
                    };
                    self.queue_frame(port::LINK, req.encode());
                }
            }
            Ok(LinkMsg::Echo { seq }) => {
                self.queue_frame(port::LINK, LinkMsg::EchoRsp { seq }.encode());
            }
            Ok(LinkMsg::TimeSyncRsp { .. }) => {}
            Ok(_) | Err(_) => {}
        }
    }

    fn on_pubsub(&mut self, payload: &[u8]) {
        let Ok(msg) = PubSubMsg::decode(payload) else {
            return;
        };
        if msg.topic == "!/ping" {
            let pong = PubSubMsg {
                topic: "!/pong".to_string(),
                value: Value::null(),
            };
            self.queue_frame(port::PUBSUB, pong.encode());
        }
    }

    fn on_memory(&mut self, payload: &[u8]) {
        let Ok(msg) = MemoryMsg::decode(payload) else {
            return;
        };
        let op = msg.op_code();
        match msg {
            MemoryMsg::Erase { region } => {
                self.regions.insert(region, Vec::new());
                self.queue_ack(region, op, 0);
            }
            MemoryMsg::WriteStart { region, size } => {
                self.staging.insert(region, Vec::with_capacity(size as usize));
            }
            MemoryMsg::WriteData { region, offset, data } => {
                let staged = self.staging.entry(region).or_default();
                if staged.len() as u32 != offset {
                    self.queue_ack(region, op, Error::Sequence.code());
                    return;
                }
                staged.extend_from_slice(&data);
                self.queue_ack(region, op, 0);
            }
            MemoryMsg::WriteFinalize { region } => {
                if let Some(staged) = self.staging.remove(&region) {
                    self.regions.insert(region, staged);
                }
                self.queue_ack(region, op, 0);
            }
            MemoryMsg::ReadReq { region, offset, length } => {
                let stored = self.regions.get(&region).cloned().unwrap_or_default();
                let mut sent = 0u32;
                while sent < length {
                    let chunk = (length - sent).min(200);
                    let from = (offset + sent) as usize;
                    let data: Vec<u8> = (from..from + chunk as usize)
                        .map(|i| stored.get(i).copied().unwrap_or(0xFF))
                        .collect();
                    self.queue_frame(
                        port::MEMORY,
                        MemoryMsg::ReadData {
                            region,
                            offset: offset + sent,
                            data,
                        }
                        .encode(),
                    );
                    sent += chunk;
                }
            }
            _ => {}
        }
    }

    fn queue_ack(&mut self, region: u8, op: u8, status: u8) {
        // Acks carry the byte count committed so far.
        let offset = self
            .staging
            .get(&region)
            .map(|s| s.len() as u32)
            .unwrap_or(0);
        self.queue_frame(
            port::MEMORY,
            MemoryMsg::Ack {
                region,
                op,
                offset,
                status,
            }
            .encode(),
        );
    }

    /// Generate one batch of streaming frames for the enabled float ports.
    fn generate_stream(&mut self) {
        let i_enabled = self.stream_mask & (1 << 5) != 0;
        let v_enabled = self.stream_mask & (1 << 6) != 0;
        if !i_enabled && !v_enabled {
            return;
        }
        for _ in 0..GEN_FRAMES_PER_POLL {
            let counter = self.sample_counter;
            if i_enabled {
                let data: Vec<u8> = std::iter::repeat(GEN_CURRENT.to_le_bytes())
                    .take(GEN_ELEMENTS)
                    .flatten()
                    .collect();
                let frame = StreamFrame {
                    sample_counter: counter,
                    data: &data,
                };
                self.queue_frame(port::STREAM_BASE + 5, frame.encode());
            }
            if v_enabled {
                let data: Vec<u8> = std::iter::repeat(GEN_VOLTAGE.to_le_bytes())
                    .take(GEN_ELEMENTS)
                    .flatten()
                    .collect();
                let frame = StreamFrame {
                    sample_counter: counter,
                    data: &data,
                };
                self.queue_frame(port::STREAM_BASE + 6, frame.encode());
            }
            // Float ports stream at native/2.
            self.sample_counter = self
                .sample_counter
                .wrapping_add((GEN_ELEMENTS * 2) as u32);
        }
    }

    /// Move pending frames into a submitted IN buffer.
    fn fill_in_buffer(&mut self) -> Option<TransferComplete> {
        if self.pending_frames.is_empty() {
            return None;
        }
        let mut buffer = self.in_buffers.pop_front()?;
        let capacity = buffer.len() / FRAME_SIZE;
        let mut filled = 0;
        while filled < capacity {
            let Some(frame) = self.pending_frames.pop_front() else {
                break;
            };
            buffer[filled * FRAME_SIZE..(filled + 1) * FRAME_SIZE].copy_from_slice(&frame);
            filled += 1;
        }
        Some(TransferComplete {
            kind: TransferKind::BulkIn,
            endpoint: 0x82,
            data: buffer,
            result: Ok(filled * FRAME_SIZE),
        })
    }
}

impl UsbTransport for SimInstrument {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.frame_id = 0;
        self.sample_counter = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.in_buffers.clear();
        self.pending_frames.clear();
        self.completions.clear();
        self.stream_mask = 0;
    }

    fn submit_control(&mut self, setup: UsbSetup, _data: Vec<u8>) -> Result<()> {
        if !self.open {
            return Err(Error::Closed);
        }
        match setup.request {
            req::CONNECT | req::DISCONNECT => {}
            req::SETTINGS => {
                self.stream_mask =
                    u32::from(setup.value) | (u32::from(setup.index) << 16);
            }
            _ => {}
        }
        self.completions.push_back(TransferComplete {
            kind: TransferKind::Control,
            endpoint: 0,
            data: Vec::new(),
            result: Ok(0),
        });
        Ok(())
    }

    fn submit_bulk_in(&mut self, _endpoint: u8, buffer: Vec<u8>) -> Result<()> {
        if !self.open {
            return Err(Error::Closed);
        }
        self.in_buffers.push_back(buffer);
        Ok(())
    }

    fn submit_bulk_out(&mut self, endpoint: u8, data: Vec<u8>) -> Result<()> {
        if !self.open {
            return Err(Error::Closed);
        }
        let len = data.len();
        let mut offset = 0;
        while offset + FRAME_SIZE <= data.len() {
            if let Ok(frame) = Frame::parse(&data[offset..offset + FRAME_SIZE]) {
                self.on_host_frame(frame);
            }
            offset += FRAME_SIZE;
        }
        self.completions.push_back(TransferComplete {
            kind: TransferKind::BulkOut,
            endpoint,
            data: Vec::new(),
            result: Ok(len),
        });
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Option<TransferComplete> {
        if let Some(c) = self.completions.pop_front() {
            return Some(c);
        }
        if self.stream_mask != 0 && !self.in_buffers.is_empty() {
            self.generate_stream();
        }
        if let Some(c) = self.fill_in_buffer() {
            return Some(c);
        }
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        None
    }

    fn cancel(&mut self, _endpoint: u8) {
        while let Some(buffer) = self.in_buffers.pop_front() {
            self.completions.push_back(TransferComplete {
                kind: TransferKind::BulkIn,
                endpoint: 0x82,
                data: buffer,
                result: Err(Error::Aborted),
            });
        }
    }

    fn cancel_all(&mut self) {
        self.cancel(0x82);
    }
}

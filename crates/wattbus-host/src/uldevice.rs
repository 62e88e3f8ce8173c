//! Upper-level device thread: the per-instrument protocol engine
//!
//! Translates between broker messages and the framed wire protocol: the open
//! handshake (transport connect, bulk-in stream, port-0 connect with
//! protocol-major check, pub/sub ping await), port demultiplexing, streaming
//! defragmentation and republication, the parameter model, host-side power
//! synthesis and statistics, and the memory-operation frontend.

use crate::frontend::FrontendHandle;
use crate::lldevice::{bulk_out_msg, cmd as ll_cmd, ctrl_msg, rsp as ll_rsp, stream_msg};
use crate::memops::{MemOps, MemResult};
use crate::params::{DeviceState, ParamStore, PARAMS};
use crate::stream_port::StreamPort;
use crate::transport::DeviceInfo;
use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use wattbus_core::error::{Error, Result};
use wattbus_core::message::{Extras, Message, SubscriberFlags, SubscriberId, TransferBuf};
use wattbus_core::queue::{QueueReceiver, QueueSender};
use wattbus_core::timemap::TimeMapFilter;
use wattbus_core::value::{AppPayload, Value};
use wattbus_dsp::downsample::DownsampleMode;
use wattbus_dsp::sample::{CalSample, Calibration, SampleProcessor, SuppressMatrix, SuppressMode};
use wattbus_dsp::stats::{CalInput, StatsEngine};
use wattbus_wire::frame::{Frame, FRAME_SIZE};
use wattbus_wire::link::{version_string, ConnectInfo, LinkMsg, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use wattbus_wire::memory::MemoryMsg;
use wattbus_wire::port;
use wattbus_wire::pubsub::PubSubMsg;
use wattbus_wire::stream::{field_for_port, FieldId, FieldInfo, StreamFrame};

/// Vendor control requests
pub mod req {
    pub const CONNECT: u8 = 1;
    pub const DISCONNECT: u8 = 2;
    pub const SETTINGS: u8 = 3;
}

/// Commands accepted on the upper-level inbox
pub mod cmd {
    pub const OPEN: &str = "!open";
    pub const FINALIZE: &str = "!finalize";
}

/// Native rate at which the sensor delivers only current and voltage and
/// the host computes power as their product.
pub const POWER_SYNTH_RATE: u32 = 2_000_000;

/// Upper-level device configuration
#[derive(Clone, Debug)]
pub struct UlConfig {
    pub info: DeviceInfo,
    /// Instrument native sampling rate in Hz
    pub sample_rate: u32,
    /// Host statistics block length in native samples
    pub stats_block_size: u32,
    pub open_timeout: Duration,
    pub bulk_in_ep: u8,
    pub bulk_out_ep: u8,
    /// Packed-raw stream mode: port 16 carries 32-bit raw sample words that
    /// pass through host calibration and range suppression
    pub raw_mode: bool,
}

impl UlConfig {
    pub fn new(info: DeviceInfo) -> Self {
        let raw_mode = info.model == "js110";
        Self {
            info,
            sample_rate: if raw_mode { 2_000_000 } else { 1_000_000 },
            stats_block_size: 500_000,
            open_timeout: Duration::from_secs(5),
            bulk_in_ep: 0x82,
            bulk_out_ep: 0x02,
            raw_mode,
        }
    }
}

/// Semantic events extracted from inbox messages
#[derive(Debug)]
enum UlEvent {
    OpenRc(i32),
    CtrlRsp { status: Option<Error> },
    ConnectRsp(ConnectInfo),
    EchoRsp(u32),
    PubSubIn(String),
    StreamError(Error),
}

/// Aligns current/voltage element runs and produces `(id, i, v, p)` tuples.
struct PowerSynth {
    i: VecDeque<f32>,
    i_next: u64,
    v: VecDeque<f32>,
    v_next: u64,
    stride: u64,
}

impl PowerSynth {
    fn new(stride: u64) -> Self {
        Self {
            i: VecDeque::new(),
            i_next: 0,
            v: VecDeque::new(),
            v_next: 0,
            stride,
        }
    }

    /// Bound on either side's backlog while the other signal is quiet.
    const BUFFER_MAX: usize = 1 << 20;

    fn push_i(&mut self, start: u64, xs: impl Iterator<Item = f32>) {
        if self.i.is_empty() {
            self.i_next = start;
        }
        self.i.extend(xs);
        while self.i.len() > Self::BUFFER_MAX {
            self.i.pop_front();
            self.i_next += self.stride;
        }
    }

    fn push_v(&mut self, start: u64, xs: impl Iterator<Item = f32>) {
        if self.v.is_empty() {
            self.v_next = start;
        }
        self.v.extend(xs);
        while self.v.len() > Self::BUFFER_MAX {
            self.v.pop_front();
            self.v_next += self.stride;
        }
    }

    /// Drain aligned tuples; both signals must cover a sample id before it
    /// is produced, so products always start at a common id.
    fn drain(&mut self) -> Vec<(u64, f32, f32, f32)> {
        let mut out = Vec::new();
        while !self.i.is_empty() && !self.v.is_empty() {
            if self.i_next < self.v_next {
                self.i.pop_front();
                self.i_next += self.stride;
            } else if self.v_next < self.i_next {
                self.v.pop_front();
                self.v_next += self.stride;
            } else {
                let i = self.i.pop_front().expect("checked non-empty");
                let v = self.v.pop_front().expect("checked non-empty");
                let id = self.i_next;
                self.i_next += self.stride;
                self.v_next = self.i_next;
                out.push((id, i, v, i * v));
            }
        }
        out
    }

    fn clear(&mut self) {
        self.i.clear();
        self.v.clear();
    }
}

struct UlDevice {
    config: UlConfig,
    prefix: String,
    state: DeviceState,
    inbox: QueueReceiver,
    ll: QueueSender,
    frontend: FrontendHandle,
    sub_id: SubscriberId,
    frame_id_tx: u16,
    rx_frame_expected: Option<u16>,
    rx_frame_gaps: u64,
    ports: HashMap<u8, StreamPort>,
    params: ParamStore,
    tmf: TimeMapFilter,
    memops: MemOps,
    mem_topic: Option<String>,
    stats: StatsEngine,
    stats_enabled: bool,
    power: PowerSynth,
    raw: SampleProcessor,
    raw_next_id: u64,
    connect_info: Option<ConnectInfo>,
    echo_seq: u32,
}

/// Spawn the upper-level thread over an existing inbox. The lower-level
/// device must push its responses into the same inbox.
pub fn spawn(
    config: UlConfig,
    inbox: QueueReceiver,
    ll: QueueSender,
    frontend: FrontendHandle,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("wattbus-ul-{}", config.info.serial))
        .spawn(move || {
            let prefix = config.info.prefix();
            let sub_id = frontend
                .subscribe_queue(&prefix, SubscriberFlags::PUB, inbox.sender())
                .unwrap_or(0);
            let sample_rate = config.sample_rate;
            let stats_block = config.stats_block_size;
            // Statistics see one sample per aligned i/v pair: native rate in
            // raw mode, the float-port element rate otherwise.
            let stats_rate = if config.raw_mode {
                f64::from(sample_rate)
            } else {
                f64::from(sample_rate) / 2.0
            };
            let device = UlDevice {
                prefix,
                state: DeviceState::Closed,
                sub_id,
                frame_id_tx: 0,
                rx_frame_expected: None,
                rx_frame_gaps: 0,
                ports: HashMap::new(),
                params: ParamStore::default(),
                tmf: TimeMapFilter::new(f64::from(sample_rate)),
                memops: MemOps::default(),
                mem_topic: None,
                stats: StatsEngine::new(stats_block, stats_rate),
                stats_enabled: false,
                power: PowerSynth::new(u64::from(
                    field_for_port(port::STREAM_BASE + 5)
                        .expect("current port in table")
                        .decimate_min,
                )),
                raw: SampleProcessor::new(
                    Calibration::default(),
                    SuppressMode::Interp,
                    SuppressMatrix::Conservative,
                ),
                raw_next_id: 0,
                connect_info: None,
                echo_seq: 0,
                inbox,
                ll,
                frontend,
                config,
            };
            device.run();
        })
        .expect("spawn uldevice thread")
}

impl UlDevice {
    fn run(mut self) {
        info!("uldevice {} started", self.prefix);
        loop {
            let msg = self.inbox.pop();
            match msg.topic.as_str() {
                cmd::OPEN => {
                    if let Err(e) = self.open() {
                        warn!("{} open failed: {e}", self.prefix);
                        let _ = self.frontend.send(Message::return_code(
                            &format!("{}/h/state", self.prefix),
                            Err(e),
                        ));
                        self.set_state(DeviceState::Closed);
                    }
                }
                cmd::FINALIZE => {
                    self.finalize();
                    break;
                }
                _ => {
                    let _ = self.process_msg(msg);
                }
            }
        }
        info!("uldevice {} finalized", self.prefix);
    }

    /// Device open sequence; any failed step leaves the device closed.
    fn open(&mut self) -> Result<()> {
        self.set_state(DeviceState::Opening);

        // 1. Open the transport.
        self.ll.push(Message::publish(ll_cmd::OPEN, Value::null()))?;
        match self.wait(|e| matches!(e, UlEvent::OpenRc(_)))? {
            UlEvent::OpenRc(0) => {}
            UlEvent::OpenRc(code) => {
                return Err(Error::from_code(code as u8).unwrap_or(Error::Unavailable))
            }
            _ => unreachable!(),
        }

        // 2. Transport-level connect control request.
        let setup = wattbus_core::message::UsbSetup {
            request_type: 0x40,
            request: req::CONNECT,
            value: 1,
            index: 0,
            length: 0,
        };
        self.ll.push(ctrl_msg(false, setup, Vec::new()))?;
        match self.wait(|e| matches!(e, UlEvent::CtrlRsp { .. }))? {
            UlEvent::CtrlRsp { status: None } => {}
            UlEvent::CtrlRsp { status: Some(e) } => return Err(e),
            _ => unreachable!(),
        }

        // 3. Open the bulk-in stream.
        self.ll.push(stream_msg(
            ll_cmd::BULK_IN_STREAM_OPEN,
            self.config.bulk_in_ep,
            None,
        ))?;

        // 4. Port-0 connect handshake; the protocol major must match.
        self.send_link(LinkMsg::Connect(ConnectInfo {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            ..Default::default()
        }))?;
        let info = match self.wait(|e| matches!(e, UlEvent::ConnectRsp(_)))? {
            UlEvent::ConnectRsp(info) => info,
            _ => unreachable!(),
        };
        if info.protocol_major != PROTOCOL_MAJOR {
            warn!(
                "{}: protocol major {} != {}",
                self.prefix, info.protocol_major, PROTOCOL_MAJOR
            );
            self.close_ll();
            return Err(Error::NotSupported);
        }
        self.connect_info = Some(info);

        // 4b. Echo loopback sanity check on the framed link.
        self.echo_seq = self.echo_seq.wrapping_add(1);
        let seq = self.echo_seq;
        self.send_link(LinkMsg::Echo { seq })?;
        self.wait(|e| matches!(e, UlEvent::EchoRsp(s) if *s == seq))?;

        // 5. Pub/sub liveness: block until the instrument pongs.
        self.send_pubsub("!/ping", Value::null())?;
        self.wait(|e| matches!(e, UlEvent::PubSubIn(t) if t == "!/pong"))?;

        // 6. Publish identity and the parameter table.
        self.publish_identity();
        self.publish_params();

        self.set_state(DeviceState::Open);
        info!("{} open", self.prefix);
        Ok(())
    }

    /// Wait for a matching event while processing everything else normally.
    fn wait(&mut self, want: impl Fn(&UlEvent) -> bool) -> Result<UlEvent> {
        let deadline = Instant::now() + self.config.open_timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::TimedOut)?;
            let msg = self.inbox.pop_timeout(remaining).ok_or(Error::TimedOut)?;
            for event in self.process_msg(msg) {
                if want(&event) {
                    return Ok(event);
                }
                if let UlEvent::StreamError(e) = event {
                    return Err(e);
                }
            }
        }
    }

    /// Shared inbox handler; returns semantic events for the open sequence.
    fn process_msg(&mut self, msg: Message) -> Vec<UlEvent> {
        if msg.topic.starts_with(self.prefix.as_str()) {
            let relative = msg.topic[self.prefix.len()..]
                .trim_start_matches('/')
                .to_string();
            self.on_param(&relative, msg);
            return Vec::new();
        }
        match msg.topic.as_str() {
            ll_rsp::OPEN => {
                let code = msg.value.as_i64().unwrap_or(0) as i32;
                vec![UlEvent::OpenRc(code)]
            }
            ll_rsp::CLOSE | ll_rsp::FINALIZE => Vec::new(),
            ll_rsp::CTRL => {
                let Extras::UsbCtrl { status, .. } = msg.extras else {
                    return Vec::new();
                };
                vec![UlEvent::CtrlRsp { status }]
            }
            ll_cmd::STREAM_IN_DATA => self.on_stream_in(msg),
            // A finalize landing while the open sequence is blocked in
            // wait(): put it back for the main loop and abort the open.
            cmd::FINALIZE => {
                let _ = self
                    .inbox
                    .sender()
                    .push(Message::publish(cmd::FINALIZE, Value::null()));
                vec![UlEvent::StreamError(Error::Aborted)]
            }
            cmd::OPEN => Vec::new(),
            other => {
                trace!("uldevice: ignoring {other}");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames

    fn on_stream_in(&mut self, msg: Message) -> Vec<UlEvent> {
        let Extras::Stream {
            endpoint,
            status,
            buffer,
        } = msg.extras
        else {
            return Vec::new();
        };
        if let Some(e) = status {
            warn!("{}: stream failed: {e}", self.prefix);
            self.set_state(DeviceState::Closed);
            let _ = self.frontend.send(Message::return_code(
                &format!("{}/h/state", self.prefix),
                Err(Error::Unavailable),
            ));
            return vec![UlEvent::StreamError(Error::Unavailable)];
        }
        let Some(buf) = buffer else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let whole = buf.data.len() - buf.data.len() % FRAME_SIZE;
        let mut offset = 0;
        while offset < whole {
            match Frame::parse(&buf.data[offset..offset + FRAME_SIZE]) {
                Ok(frame) => events.extend(self.on_frame(frame)),
                Err(e) => {
                    warn!("{}: bad frame: {e}", self.prefix);
                }
            }
            offset += FRAME_SIZE;
        }

        // Hand the loaned buffer back for re-submission.
        let _ = self.ll.push(stream_msg(
            ll_cmd::STREAM_IN_DATA,
            endpoint,
            Some(TransferBuf {
                slot: buf.slot,
                data: buf.data,
            }),
        ));
        events
    }

    fn on_frame(&mut self, frame: Frame) -> Vec<UlEvent> {
        if let Some(expected) = self.rx_frame_expected {
            if frame.frame_id != expected {
                self.rx_frame_gaps += 1;
                debug!(
                    "{}: frame id gap: expected {expected}, got {}",
                    self.prefix, frame.frame_id
                );
            }
        }
        self.rx_frame_expected = Some(frame.next_id());

        match frame.port_id {
            port::LINK => self.on_link(&frame.payload),
            port::PUBSUB => self.on_pubsub(&frame.payload),
            port::LOGGING => {
                on_instrument_log(&self.prefix, &frame.payload);
                Vec::new()
            }
            port::MEMORY => {
                self.on_memory(&frame.payload);
                Vec::new()
            }
            p if port::is_stream(p) => {
                self.on_stream_frame(p, &frame.payload);
                Vec::new()
            }
            other => {
                trace!("{}: frame on unused port {other}", self.prefix);
                Vec::new()
            }
        }
    }

    fn on_link(&mut self, payload: &[u8]) -> Vec<UlEvent> {
        match LinkMsg::decode(payload) {
            Ok(LinkMsg::ConnectRsp(info)) => vec![UlEvent::ConnectRsp(info)],
            Ok(LinkMsg::EchoRsp { seq }) => vec![UlEvent::EchoRsp(seq)],
            Ok(LinkMsg::TimeSyncReq { start_count }) => {
                let now = utc_now();
                let _ = self.send_link(LinkMsg::TimeSyncRsp {
                    start_count,
                    utc_recv: now,
                    utc_send: now,
                    end_count: 0,
                });
                if self.tmf.add(start_count, now) {
                    if let Some(map) = self.tmf.get() {
                        for port in self.ports.values_mut() {
                            port.set_time_map(map);
                        }
                    }
                }
                Vec::new()
            }
            Ok(other) => {
                trace!("{}: link message {other:?}", self.prefix);
                Vec::new()
            }
            Err(e) => {
                warn!("{}: link decode: {e}", self.prefix);
                Vec::new()
            }
        }
    }

    fn on_pubsub(&mut self, payload: &[u8]) -> Vec<UlEvent> {
        match PubSubMsg::decode(payload) {
            Ok(msg) => {
                // Republish under the device prefix; our own subscription is
                // suppressed by source id.
                let full = format!("{}/{}", self.prefix, msg.topic);
                if !msg.topic.starts_with('!') {
                    let _ = self.frontend.publish_from(self.sub_id, full, msg.value);
                }
                vec![UlEvent::PubSubIn(msg.topic)]
            }
            Err(e) => {
                warn!("{}: pubsub decode: {e}", self.prefix);
                Vec::new()
            }
        }
    }

    fn on_memory(&mut self, payload: &[u8]) {
        let msg = match MemoryMsg::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{}: memory decode: {e}", self.prefix);
                return;
            }
        };
        let (replies, result) = self.memops.on_msg(msg);
        for reply in replies {
            let _ = self.send_mem(&reply);
        }
        let Some(result) = result else { return };
        let Some(topic) = self.mem_topic.take() else {
            return;
        };
        match result {
            MemResult::Done(status) => {
                let _ = self
                    .frontend
                    .send(Message::return_code(&topic, status));
            }
            MemResult::ReadDone(Ok(data)) => {
                let _ = self.frontend.publish(
                    format!("{}/h/mem/!rdata", self.prefix),
                    Value::bin(data).with_app(AppPayload::Plain),
                );
                let _ = self
                    .frontend
                    .send(Message::return_code(&topic, Ok(())));
            }
            MemResult::ReadDone(Err(e)) => {
                let _ = self
                    .frontend
                    .send(Message::return_code(&topic, Err(e)));
            }
        }
    }

    fn on_stream_frame(&mut self, port_id: u8, payload: &[u8]) {
        let frame = match StreamFrame::parse(payload, port_id) {
            Ok(f) => f,
            Err(e) => {
                warn!("{}: stream parse: {e}", self.prefix);
                return;
            }
        };

        if self.config.raw_mode && port_id == port::STREAM_BASE {
            self.on_raw_frame(frame.sample_counter, frame.data);
            return;
        }

        let Some(info) = field_for_port(port_id) else {
            return;
        };

        // Instrument-computed statistics pass through as value blocks.
        if info.field == FieldId::SensorStats {
            if self.params.signal_enabled("sstats") {
                let _ = self.frontend.publish_from(
                    self.sub_id,
                    format!("{}/s/sstats/value", self.prefix),
                    Value::bin(frame.data.to_vec())
                        .retained()
                        .with_app(AppPayload::Statistics),
                );
            }
            return;
        }

        self.ensure_port(port_id, info);
        let port = self.ports.get_mut(&port_id).expect("port just ensured");
        let start_id =
            wattbus_wire::stream::extend_sample_id(frame.sample_counter, port.last_id());
        let flushed = port.on_frame(frame.sample_counter, frame.data);
        for p in flushed {
            self.publish_signal(&p);
        }

        // Feed host statistics and power synthesis from the float signals.
        let want_pairs = self.stats_enabled
            || (self.config.sample_rate == POWER_SYNTH_RATE && self.params.signal_enabled("p"));
        if matches!(info.field, FieldId::Current | FieldId::Voltage) {
            if !want_pairs {
                self.power.clear();
                return;
            }
            let floats = frame
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()));
            match info.field {
                FieldId::Current => self.power.push_i(start_id, floats),
                FieldId::Voltage => self.power.push_v(start_id, floats),
                _ => unreachable!(),
            }
            self.drain_power();
        }
    }

    /// Packed-raw path: calibrate, suppress range-change artifacts, then
    /// feed the i/v/p signal ports and statistics.
    fn on_raw_frame(&mut self, counter: u32, data: &[u8]) {
        let start = wattbus_wire::stream::extend_sample_id(counter, self.raw_next_id);
        self.raw_next_id = start;
        for chunk in data.chunks_exact(4) {
            let raw = u32::from_le_bytes(chunk.try_into().unwrap());
            let out = self.raw.process(raw);
            self.raw_next_id += 1;
            let Some(sample) = out else { continue };
            let id = self.raw_next_id - 1 - SampleProcessor::delay();
            self.push_cal_sample(id, &sample);
        }
    }

    fn push_cal_sample(&mut self, id: u64, sample: &CalSample) {
        if self.stats_enabled {
            if let Some(block) = self.stats.add(&CalInput::from(sample)) {
                let _ = self.frontend.publish_from(
                    self.sub_id,
                    format!("{}/s/stats/value", self.prefix),
                    Value::bin(block.encode())
                        .retained()
                        .with_app(AppPayload::Statistics),
                );
            }
        }
        for (field, x) in [
            (FieldId::Current, sample.i),
            (FieldId::Voltage, sample.v),
            (FieldId::Power, sample.p),
        ] {
            if !self.params.signal_enabled(&field.signal_name()) {
                continue;
            }
            let port_id = wattbus_wire::stream::port_for_field(field);
            let info = FieldInfo {
                field,
                element: wattbus_wire::stream::ElementType::Float,
                bits: 32,
                decimate_min: 1,
            };
            self.ensure_port(port_id, info);
            let port = self.ports.get_mut(&port_id).expect("port just ensured");
            let flushed = port.push_value(id, x);
            for p in flushed {
                self.publish_signal(&p);
            }
        }
    }

    fn drain_power(&mut self) {
        let tuples = self.power.drain();
        if tuples.is_empty() {
            return;
        }
        let synth_power = self.config.sample_rate == POWER_SYNTH_RATE;
        for (id, i, v, p) in tuples {
            if self.stats_enabled {
                if let Some(block) = self.stats.add(&CalInput { i, v, p }) {
                    let _ = self.frontend.publish_from(
                        self.sub_id,
                        format!("{}/s/stats/value", self.prefix),
                        Value::bin(block.encode())
                            .retained()
                            .with_app(AppPayload::Statistics),
                    );
                }
            }
            if synth_power && self.params.signal_enabled("p") {
                let port_id = wattbus_wire::stream::port_for_field(FieldId::Power);
                let info = field_for_port(port_id).expect("power port in table");
                self.ensure_port(port_id, info);
                let port = self.ports.get_mut(&port_id).expect("port just ensured");
                let flushed = port.push_value(id, p);
                for payload in flushed {
                    self.publish_signal(&payload);
                }
            }
        }
    }

    fn ensure_port(&mut self, port_id: u8, info: FieldInfo) {
        if self.ports.contains_key(&port_id) {
            return;
        }
        let user_rate = self.params.get_u64("h/fs", u64::from(self.config.sample_rate)) as u32;
        let mode = if self.params.get_u64("h/filter", 1) == 0 {
            DownsampleMode::Average
        } else {
            DownsampleMode::FlatPassband
        };
        let mut port = StreamPort::new(info, self.config.sample_rate, user_rate, mode);
        if let Some(map) = self.tmf.get() {
            port.set_time_map(map);
        }
        self.ports.insert(port_id, port);
    }

    fn publish_signal(&self, payload: &crate::stream_port::FlushPayload) {
        let Some(field) = FieldId::from_code(payload.header.field_id) else {
            return;
        };
        let topic = format!("{}/s/{}/!data", self.prefix, field.signal_name());
        let _ = self.frontend.publish_from(
            self.sub_id,
            topic,
            Value::bin(payload.encode()).with_app(AppPayload::Stream),
        );
    }

    // ------------------------------------------------------------------
    // Parameters and user commands

    fn on_param(&mut self, relative: &str, msg: Message) {
        if self.state != DeviceState::Open && self.state != DeviceState::Opening {
            // Only an open device accepts commands on its subtree.
            let _ = self.frontend.send(Message::return_code(
                &msg.topic,
                Err(Error::Unavailable),
            ));
            return;
        }
        match relative {
            "h/mem/!erase" | "h/mem/!write" | "h/mem/!read" => {
                self.on_mem_command(relative, msg);
            }
            _ => self.apply_param(relative, msg),
        }
    }

    fn apply_param(&mut self, relative: &str, msg: Message) {
        let previous = self.params.set(relative, msg.value.clone());
        let changed = previous.as_ref() != Some(&msg.value);
        if !changed {
            return;
        }
        match relative {
            "h/fs" | "h/filter" => {
                // Decimation chain changed: rebuild the stream ports.
                for port in self.ports.values_mut() {
                    if let Some(p) = port.flush() {
                        // Flush in-progress data before the rebuild.
                        self.frontend
                            .publish_from(
                                self.sub_id,
                                format!(
                                    "{}/s/{}/!data",
                                    self.prefix,
                                    FieldId::from_code(p.header.field_id)
                                        .map(|f| f.signal_name())
                                        .unwrap_or_default()
                                ),
                                Value::bin(p.encode()).with_app(AppPayload::Stream),
                            )
                            .ok();
                    }
                }
                self.ports.clear();
                self.power.clear();
                self.stats.restart(0);
            }
            "h/sup/mode" => {
                let mode = match self.params.get_u64("h/sup/mode", 2) {
                    0 => SuppressMode::Nan,
                    1 => SuppressMode::Mean,
                    _ => SuppressMode::Interp,
                };
                self.raw = SampleProcessor::new(Calibration::default(), mode, self.raw_matrix());
            }
            "h/sup/matrix" => {
                let matrix = self.raw_matrix();
                self.raw = SampleProcessor::new(Calibration::default(), self.raw_mode_cfg(), matrix);
            }
            "s/stats/ctrl" => {
                self.stats_enabled = self.params.signal_enabled("stats");
                self.stats.restart(0);
            }
            _ => {}
        }
        if relative.starts_with("s/") && relative.ends_with("/ctrl") {
            self.update_streaming();
        }
    }

    fn raw_matrix(&self) -> SuppressMatrix {
        match self.params.get_u64("h/sup/matrix", 1) {
            0 => SuppressMatrix::Aggressive,
            _ => SuppressMatrix::Conservative,
        }
    }

    fn raw_mode_cfg(&self) -> SuppressMode {
        match self.params.get_u64("h/sup/mode", 2) {
            0 => SuppressMode::Nan,
            1 => SuppressMode::Mean,
            _ => SuppressMode::Interp,
        }
    }

    /// Recompute the streaming aggregate; on transition send one settings
    /// control with the enabled-port mask.
    fn update_streaming(&mut self) {
        let mask = self.params.stream_mask();
        let streaming = self.params.is_streaming();
        let setup = wattbus_core::message::UsbSetup {
            request_type: 0x40,
            request: req::SETTINGS,
            value: (mask & 0xFFFF) as u16,
            index: (mask >> 16) as u16,
            length: 0,
        };
        debug!(
            "{}: streaming={} mask=0x{mask:08x}",
            self.prefix, streaming
        );
        let _ = self.ll.push(ctrl_msg(false, setup, Vec::new()));
        if !streaming {
            for port in self.ports.values_mut() {
                port.reset();
            }
            self.power.clear();
        }
    }

    fn on_mem_command(&mut self, relative: &str, msg: Message) {
        let topic = msg.topic.clone();
        let started = match relative {
            "h/mem/!erase" => {
                let region = msg.value.as_u64().unwrap_or(0) as u8;
                self.memops.start_erase(region)
            }
            "h/mem/!write" => match msg.value.as_bin() {
                Some([region, data @ ..]) if !data.is_empty() => {
                    self.memops.start_write(*region, data.to_vec())
                }
                _ => Err(Error::ParameterInvalid("write payload".into())),
            },
            "h/mem/!read" => match msg.value.as_bin() {
                Some(raw) if raw.len() >= 9 => {
                    let region = raw[0];
                    let offset = u32::from_le_bytes(raw[1..5].try_into().expect("len checked"));
                    let length = u32::from_le_bytes(raw[5..9].try_into().expect("len checked"));
                    self.memops.start_read(region, offset, length)
                }
                _ => Err(Error::ParameterInvalid("read request".into())),
            },
            _ => unreachable!(),
        };
        match started {
            Ok(msgs) => {
                self.mem_topic = Some(topic);
                for m in msgs {
                    let _ = self.send_mem(&m);
                }
            }
            Err(e) => {
                let _ = self.frontend.send(Message::return_code(&topic, Err(e)));
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound

    fn send_frame(&mut self, port_id: u8, payload: Vec<u8>) -> Result<()> {
        let frame = Frame::new(self.frame_id_tx, port_id, payload)
            .map_err(|e| Error::ParameterInvalid(e.to_string()))?;
        self.frame_id_tx = self.frame_id_tx.wrapping_add(1);
        let mut buf = bytes::BytesMut::with_capacity(FRAME_SIZE);
        frame.encode(&mut buf);
        self.ll
            .push(bulk_out_msg(self.config.bulk_out_ep, buf.to_vec()))
    }

    fn send_link(&mut self, msg: LinkMsg) -> Result<()> {
        self.send_frame(port::LINK, msg.encode())
    }

    fn send_pubsub(&mut self, topic: &str, value: Value) -> Result<()> {
        let msg = PubSubMsg {
            topic: topic.to_string(),
            value,
        };
        self.send_frame(port::PUBSUB, msg.encode())
    }

    fn send_mem(&mut self, msg: &MemoryMsg) -> Result<()> {
        self.send_frame(port::MEMORY, msg.encode())
    }

    fn publish_identity(&mut self) {
        let info = self.connect_info.unwrap_or_default();
        for (topic, version) in [
            ("c/fw/version", info.fw_version),
            ("c/hw/version", info.hw_version),
        ] {
            let _ = self.frontend.publish_from(
                self.sub_id,
                format!("{}/{}", self.prefix, topic),
                Value::str(version_string(version)).retained(),
            );
        }
    }

    fn publish_params(&mut self) {
        for param in PARAMS {
            let _ = self.frontend.publish_from(
                self.sub_id,
                format!("{}/{}$", self.prefix, param.topic),
                Value::json(param.meta),
            );
            if let Ok(meta) = crate::metadata::Metadata::parse(param.meta) {
                if let Some(default) = meta.default_value() {
                    self.params.set(param.topic, default.clone());
                    let _ = self.frontend.publish_from(
                        self.sub_id,
                        format!("{}/{}", self.prefix, param.topic),
                        default.retained(),
                    );
                }
            }
        }
    }

    fn set_state(&mut self, state: DeviceState) {
        self.state = state;
        self.params.set("h/state", Value::u8(state as u8));
        let _ = self.frontend.publish_from(
            self.sub_id,
            format!("{}/h/state", self.prefix),
            Value::u8(state as u8).retained(),
        );
    }

    fn close_ll(&mut self) {
        let _ = self
            .ll
            .push(Message::publish(ll_cmd::CLOSE, Value::null()));
    }

    fn finalize(&mut self) {
        // Flush whatever streaming data is in progress.
        let pending: Vec<_> = self
            .ports
            .values_mut()
            .filter_map(StreamPort::flush)
            .collect();
        for p in pending {
            self.publish_signal(&p);
        }
        let _ = self
            .ll
            .push(Message::publish(ll_cmd::FINALIZE, Value::null()));
        // Give the lower level a moment to acknowledge; not fatal if slow.
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            match self.inbox.pop_timeout(Duration::from_millis(50)) {
                Some(msg) if msg.topic == ll_rsp::FINALIZE => break,
                Some(_) => continue,
                None => continue,
            }
        }
        if self.rx_frame_gaps > 0 {
            debug!("{}: {} frame id gaps over session", self.prefix, self.rx_frame_gaps);
        }
        let _ = self.frontend.unsubscribe_all(self.sub_id);
        self.set_state(DeviceState::NotPresent);
    }
}

/// Forward an instrument log record (`[level, rsvd x3, utf8 text]`) into
/// the host log stream.
fn on_instrument_log(prefix: &str, payload: &[u8]) {
    if payload.len() < 4 {
        return;
    }
    let level = payload[0];
    let text = String::from_utf8_lossy(&payload[4..]);
    let text = text.trim_end_matches('\0');
    match level {
        0 => tracing::error!("{prefix}: {text}"),
        1 => warn!("{prefix}: {text}"),
        2 => info!("{prefix}: {text}"),
        3 => debug!("{prefix}: {text}"),
        _ => trace!("{prefix}: {text}"),
    }
}

/// UTC now in nanoseconds since the epoch.
fn utc_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_synth_aligned_start() {
        let mut synth = PowerSynth::new(2);
        synth.push_i(100, [1.0f32, 2.0, 3.0].into_iter());
        synth.push_v(100, [10.0f32, 10.0].into_iter());
        let out = synth.drain();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (100, 1.0, 10.0, 10.0));
        assert_eq!(out[1], (102, 2.0, 10.0, 20.0));

        // The remaining current sample pairs once voltage catches up.
        synth.push_v(104, [10.0f32].into_iter());
        let out = synth.drain();
        assert_eq!(out, vec![(104, 3.0, 10.0, 30.0)]);
    }

    #[test]
    fn test_power_synth_trims_leading_misalignment() {
        let mut synth = PowerSynth::new(2);
        // Voltage starts two samples later; leading current is dropped.
        synth.push_i(100, [1.0f32, 2.0, 3.0].into_iter());
        synth.push_v(104, [10.0f32, 10.0].into_iter());
        let out = synth.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 104);
        assert_eq!(out[0].1, 3.0);
    }

    #[test]
    fn test_ul_config_model_defaults() {
        let js110 = UlConfig::new(DeviceInfo {
            model: "js110".into(),
            serial: "001".into(),
            path: String::new(),
        });
        assert!(js110.raw_mode);
        assert_eq!(js110.sample_rate, POWER_SYNTH_RATE);

        let js220 = UlConfig::new(DeviceInfo {
            model: "js220".into(),
            serial: "002".into(),
            path: String::new(),
        });
        assert!(!js220.raw_mode);
        assert_eq!(js220.sample_rate, 1_000_000);
    }
}

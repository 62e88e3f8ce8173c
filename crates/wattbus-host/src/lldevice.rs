//! Lower-level device thread: USB transfer management
//!
//! One thread per instrument drives the [`UsbTransport`]: a control FIFO
//! with at most one request in flight, a fixed pool of outstanding bulk-IN
//! transfers whose buffers are loaned upward and returned by slot id, and
//! serialized bulk-OUT per endpoint. The thread alternates between draining
//! its command queue and polling the transport for completions.

use crate::transport::{TransferComplete, TransferKind, UsbTransport};
use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use wattbus_core::error::Error;
use wattbus_core::message::{Extras, Message, TransferBuf, UsbSetup};
use wattbus_core::queue::{message_queue, QueueReceiver, QueueSender};
use wattbus_core::value::Value;

/// Command topics accepted on the lower-level queue
pub mod cmd {
    pub const OPEN: &str = "!open";
    pub const CLOSE: &str = "!close";
    pub const FINALIZE: &str = "!finalize";
    pub const CTRL_IN: &str = "!ctrl_in";
    pub const CTRL_OUT: &str = "!ctrl_out";
    pub const BULK_IN_STREAM_OPEN: &str = "!bulk_in_stream_open";
    pub const BULK_IN_STREAM_CLOSE: &str = "!bulk_in_stream_close";
    pub const BULK_OUT_DATA: &str = "!bulk_out_data";
    /// Upward: a loaned buffer with data. Downward: the buffer coming back.
    pub const STREAM_IN_DATA: &str = "!stream_in_data";
}

/// Response topics pushed to the upper-level queue
pub mod rsp {
    pub const OPEN: &str = "!open#";
    pub const CLOSE: &str = "!close#";
    pub const FINALIZE: &str = "!finalize#";
    pub const CTRL: &str = "!ctrl_rsp";
}

/// Lower-level device configuration
#[derive(Clone, Debug)]
pub struct LlConfig {
    /// Control transfer timeout
    pub ctrl_timeout: Duration,
    /// Outstanding bulk-IN transfers
    pub bulk_in_transfers: usize,
    /// Bytes per bulk-IN transfer
    pub bulk_in_size: usize,
    /// Transport poll granularity while open
    pub poll_interval: Duration,
}

impl Default for LlConfig {
    fn default() -> Self {
        Self {
            ctrl_timeout: Duration::from_secs(1),
            bulk_in_transfers: 4,
            bulk_in_size: 32 * 1024,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Unassigned,
    Closed,
    Open,
    Closing,
}

struct PendingCtrl {
    setup: UsbSetup,
    data: Vec<u8>,
    deadline: Option<Instant>,
}

struct LlDevice {
    transport: Box<dyn UsbTransport>,
    config: LlConfig,
    cmd_rx: QueueReceiver,
    rsp_tx: QueueSender,
    mode: Mode,
    ctrl_fifo: VecDeque<PendingCtrl>,
    ctrl_inflight: bool,
    bulk_out_pending: HashMap<u8, VecDeque<Vec<u8>>>,
    bulk_out_inflight: HashMap<u8, bool>,
    stream_ep: Option<u8>,
    free_slots: Vec<usize>,
    /// Set after a non-timeout bulk-IN error; cleared on the next open
    stream_failed: bool,
}

/// Spawn the lower-level thread. Returns the command queue sender and the
/// join handle; responses and loaned buffers go to `rsp_tx`.
pub fn spawn(
    transport: Box<dyn UsbTransport>,
    rsp_tx: QueueSender,
    config: LlConfig,
) -> (QueueSender, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = message_queue("lldevice-cmd");
    let device = LlDevice {
        transport,
        config,
        cmd_rx,
        rsp_tx,
        mode: Mode::Unassigned,
        ctrl_fifo: VecDeque::new(),
        ctrl_inflight: false,
        bulk_out_pending: HashMap::new(),
        bulk_out_inflight: HashMap::new(),
        stream_ep: None,
        free_slots: Vec::new(),
        stream_failed: false,
    };
    let join = std::thread::Builder::new()
        .name("wattbus-ll".into())
        .spawn(move || device.run())
        .expect("spawn lldevice thread");
    (cmd_tx, join)
}

impl LlDevice {
    fn run(mut self) {
        loop {
            while let Some(msg) = self.cmd_rx.try_pop() {
                if !self.handle_cmd(msg) {
                    return;
                }
            }
            if self.mode == Mode::Open {
                if let Some(completion) = self.transport.poll(self.config.poll_interval) {
                    self.handle_completion(completion);
                }
                self.check_ctrl_timeout();
            } else if let Some(msg) = self.cmd_rx.pop_timeout(Duration::from_millis(20)) {
                if !self.handle_cmd(msg) {
                    return;
                }
            }
        }
    }

    /// Returns false when the thread must exit (finalize).
    fn handle_cmd(&mut self, msg: Message) -> bool {
        match msg.topic.as_str() {
            cmd::OPEN => {
                let status = match self.transport.open() {
                    Ok(()) => {
                        self.mode = Mode::Open;
                        self.stream_failed = false;
                        info!("lldevice open");
                        Ok(())
                    }
                    Err(e) => {
                        warn!("lldevice open failed: {e}");
                        Err(e)
                    }
                };
                self.respond_rc(rsp::OPEN, status);
            }
            cmd::CLOSE => {
                self.transport.cancel_all();
                self.transport.close();
                self.mode = Mode::Closed;
                self.stream_ep = None;
                self.ctrl_fifo.clear();
                self.ctrl_inflight = false;
                self.respond_rc(rsp::CLOSE, Ok(()));
            }
            cmd::FINALIZE => {
                self.finalize();
                return false;
            }
            cmd::CTRL_IN | cmd::CTRL_OUT => {
                let Extras::UsbCtrl { setup, .. } = msg.extras else {
                    warn!("control command without setup");
                    return true;
                };
                if self.mode != Mode::Open {
                    self.respond_ctrl(setup, Err(Error::Closed), Vec::new());
                    return true;
                }
                let data = msg.value.as_bin().map(<[u8]>::to_vec).unwrap_or_default();
                self.ctrl_fifo.push_back(PendingCtrl {
                    setup,
                    data,
                    deadline: None,
                });
                self.pump_ctrl();
            }
            cmd::BULK_IN_STREAM_OPEN => {
                let Extras::Stream { endpoint, .. } = msg.extras else {
                    return true;
                };
                if self.mode != Mode::Open || self.stream_failed {
                    self.respond_stream_status(endpoint, Error::Unavailable);
                    return true;
                }
                self.stream_ep = Some(endpoint);
                self.free_slots = (0..self.config.bulk_in_transfers).collect();
                for _ in 0..self.config.bulk_in_transfers {
                    let buffer = vec![0u8; self.config.bulk_in_size];
                    if let Err(e) = self.transport.submit_bulk_in(endpoint, buffer) {
                        warn!("bulk-in submit failed: {e}");
                    }
                }
                trace!("bulk-in stream open on 0x{endpoint:02x}");
            }
            cmd::BULK_IN_STREAM_CLOSE => {
                if let Some(ep) = self.stream_ep.take() {
                    self.transport.cancel(ep);
                }
            }
            cmd::BULK_OUT_DATA => {
                let Extras::Stream { endpoint, .. } = msg.extras else {
                    return true;
                };
                let data = msg.value.as_bin().map(<[u8]>::to_vec).unwrap_or_default();
                self.submit_bulk_out(endpoint, data);
            }
            cmd::STREAM_IN_DATA => {
                // Buffer coming back from the upper layer; slot id is the
                // loan identity.
                let Extras::Stream {
                    endpoint,
                    buffer: Some(buf),
                    ..
                } = msg.extras
                else {
                    return true;
                };
                self.free_slots.push(buf.slot);
                if self.stream_ep == Some(endpoint) && !self.stream_failed {
                    let mut data = buf.data;
                    data.resize(self.config.bulk_in_size, 0);
                    if let Err(e) = self.transport.submit_bulk_in(endpoint, data) {
                        warn!("bulk-in re-submit failed: {e}");
                    }
                }
            }
            other => warn!("lldevice: unknown command {other}"),
        }
        true
    }

    fn handle_completion(&mut self, completion: TransferComplete) {
        match completion.kind {
            TransferKind::Control => {
                self.ctrl_inflight = false;
                let Some(pending) = self.ctrl_fifo.pop_front() else {
                    trace!("control completion with empty fifo (cancelled)");
                    return;
                };
                let status = completion.result.map(|_| ());
                self.respond_ctrl(pending.setup, status, completion.data);
                self.pump_ctrl();
            }
            TransferKind::BulkIn => self.handle_bulk_in(completion),
            TransferKind::BulkOut => {
                let ep = completion.endpoint;
                if let Err(e) = completion.result {
                    warn!("bulk-out error on 0x{ep:02x}: {e}");
                    self.bulk_out_pending.remove(&ep);
                    self.bulk_out_inflight.insert(ep, false);
                    return;
                }
                let next = self
                    .bulk_out_pending
                    .get_mut(&ep)
                    .and_then(VecDeque::pop_front);
                match next {
                    Some(data) => {
                        if let Err(e) = self.transport.submit_bulk_out(ep, data) {
                            warn!("bulk-out submit failed: {e}");
                            self.bulk_out_inflight.insert(ep, false);
                        }
                    }
                    None => {
                        self.bulk_out_inflight.insert(ep, false);
                    }
                }
            }
        }
    }

    fn handle_bulk_in(&mut self, completion: TransferComplete) {
        let ep = completion.endpoint;
        if self.stream_ep != Some(ep) {
            return; // stale completion from a closed stream
        }
        match completion.result {
            Ok(len) => {
                let Some(slot) = self.free_slots.pop() else {
                    // Upper layer holds every buffer; drop and re-arm.
                    warn!("bulk-in pool exhausted; dropping transfer");
                    let _ = self.transport.submit_bulk_in(ep, completion.data);
                    return;
                };
                let mut data = completion.data;
                data.truncate(len);
                let msg = Message {
                    topic: cmd::STREAM_IN_DATA.into(),
                    value: Value::null(),
                    extras: Extras::Stream {
                        endpoint: ep,
                        status: None,
                        buffer: Some(TransferBuf { slot, data }),
                    },
                    src: None,
                };
                let _ = self.rsp_tx.push(msg);
            }
            Err(Error::TimedOut) => {
                // Quiet stream; re-arm silently.
                let _ = self.transport.submit_bulk_in(ep, completion.data);
            }
            Err(Error::Aborted) => {
                trace!("bulk-in transfer cancelled");
            }
            Err(e) => {
                warn!("bulk-in error on 0x{ep:02x}: {e}; cancelling pipe");
                self.stream_failed = true;
                self.transport.cancel(ep);
                self.respond_stream_status(ep, Error::Io(e.to_string()));
            }
        }
    }

    fn submit_bulk_out(&mut self, ep: u8, data: Vec<u8>) {
        if self.mode != Mode::Open {
            return;
        }
        if *self.bulk_out_inflight.get(&ep).unwrap_or(&false) {
            self.bulk_out_pending.entry(ep).or_default().push_back(data);
            return;
        }
        match self.transport.submit_bulk_out(ep, data) {
            Ok(()) => {
                self.bulk_out_inflight.insert(ep, true);
            }
            Err(e) => warn!("bulk-out submit failed: {e}"),
        }
    }

    fn pump_ctrl(&mut self) {
        while !self.ctrl_inflight {
            let Some(head) = self.ctrl_fifo.front_mut() else {
                return;
            };
            let setup = head.setup;
            let data = std::mem::take(&mut head.data);
            match self.transport.submit_control(setup, data) {
                Ok(()) => {
                    head.deadline = Some(Instant::now() + self.config.ctrl_timeout);
                    self.ctrl_inflight = true;
                }
                Err(e) => {
                    self.ctrl_fifo.pop_front();
                    self.respond_ctrl(setup, Err(e), Vec::new());
                }
            }
        }
    }

    fn check_ctrl_timeout(&mut self) {
        if !self.ctrl_inflight {
            return;
        }
        let expired = self
            .ctrl_fifo
            .front()
            .and_then(|p| p.deadline)
            .is_some_and(|d| Instant::now() > d);
        if expired {
            let pending = self.ctrl_fifo.pop_front().expect("checked front");
            debug!("control transfer timed out");
            self.transport.cancel(0);
            self.ctrl_inflight = false;
            self.respond_ctrl(pending.setup, Err(Error::TimedOut), Vec::new());
            self.pump_ctrl();
        }
    }

    fn finalize(&mut self) {
        info!("lldevice finalizing");
        self.mode = Mode::Closing;
        self.transport.cancel_all();
        // Drain whatever the cancellation flushes out.
        while self.transport.poll(Duration::from_millis(1)).is_some() {}
        while let Some(pending) = self.ctrl_fifo.pop_front() {
            self.respond_ctrl(pending.setup, Err(Error::Aborted), Vec::new());
        }
        self.transport.close();
        self.respond_rc(rsp::FINALIZE, Ok(()));
    }

    fn respond_rc(&self, topic: &str, status: Result<(), Error>) {
        let code = match status {
            Ok(()) => 0,
            Err(e) => i32::from(e.code()),
        };
        let _ = self
            .rsp_tx
            .push(Message::publish(topic, Value::i32(code)));
    }

    fn respond_ctrl(&self, setup: UsbSetup, status: Result<(), Error>, data: Vec<u8>) {
        let msg = Message {
            topic: rsp::CTRL.into(),
            value: Value::bin(data),
            extras: Extras::UsbCtrl {
                setup,
                status: status.err(),
            },
            src: None,
        };
        let _ = self.rsp_tx.push(msg);
    }

    fn respond_stream_status(&self, endpoint: u8, err: Error) {
        let msg = Message {
            topic: cmd::STREAM_IN_DATA.into(),
            value: Value::null(),
            extras: Extras::Stream {
                endpoint,
                status: Some(err),
                buffer: None,
            },
            src: None,
        };
        let _ = self.rsp_tx.push(msg);
    }
}

/// Build a control command message for the lower-level queue.
pub fn ctrl_msg(is_in: bool, setup: UsbSetup, data: Vec<u8>) -> Message {
    Message {
        topic: if is_in { cmd::CTRL_IN } else { cmd::CTRL_OUT }.into(),
        value: Value::bin(data),
        extras: Extras::UsbCtrl {
            setup,
            status: None,
        },
        src: None,
    }
}

/// Build a bulk-out command message.
pub fn bulk_out_msg(endpoint: u8, data: Vec<u8>) -> Message {
    Message {
        topic: cmd::BULK_OUT_DATA.into(),
        value: Value::bin(data),
        extras: Extras::Stream {
            endpoint,
            status: None,
            buffer: None,
        },
        src: None,
    }
}

/// Build a stream open/close/return message.
pub fn stream_msg(topic: &str, endpoint: u8, buffer: Option<TransferBuf>) -> Message {
    Message {
        topic: topic.into(),
        value: Value::null(),
        extras: Extras::Stream {
            endpoint,
            status: None,
            buffer,
        },
        src: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use wattbus_core::error::Result;

    const EP_IN: u8 = 0x82;

    /// Scripted transport: submissions are recorded, completions only
    /// happen when a test queues one.
    #[derive(Default)]
    struct FakeState {
        completions: VecDeque<TransferComplete>,
        bulk_in_submits: Vec<(u8, usize)>,
        ctrl_submits: usize,
        cancelled: Vec<u8>,
    }

    struct FakeTransport {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeTransport {
        fn new() -> (Self, Arc<Mutex<FakeState>>) {
            let state = Arc::new(Mutex::new(FakeState::default()));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl UsbTransport for FakeTransport {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}

        fn submit_control(&mut self, _setup: UsbSetup, _data: Vec<u8>) -> Result<()> {
            self.state.lock().ctrl_submits += 1;
            Ok(())
        }

        fn submit_bulk_in(&mut self, endpoint: u8, buffer: Vec<u8>) -> Result<()> {
            self.state
                .lock()
                .bulk_in_submits
                .push((endpoint, buffer.len()));
            Ok(())
        }

        fn submit_bulk_out(&mut self, _endpoint: u8, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }

        fn poll(&mut self, timeout: Duration) -> Option<TransferComplete> {
            if let Some(c) = self.state.lock().completions.pop_front() {
                return Some(c);
            }
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            None
        }

        fn cancel(&mut self, endpoint: u8) {
            self.state.lock().cancelled.push(endpoint);
        }

        fn cancel_all(&mut self) {
            self.state.lock().cancelled.push(0xFF);
        }
    }

    fn test_config() -> LlConfig {
        LlConfig {
            ctrl_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn wait_until(mut pred: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timeout waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Spawn an opened device with the bulk-in transfer pool armed.
    fn open_with_stream() -> (
        Arc<Mutex<FakeState>>,
        QueueSender,
        QueueReceiver,
        JoinHandle<()>,
    ) {
        let (transport, state) = FakeTransport::new();
        let (rsp_tx, rsp_rx) = message_queue("rsp");
        let (cmd_tx, join) = spawn(Box::new(transport), rsp_tx, test_config());

        cmd_tx
            .push(Message::publish(cmd::OPEN, Value::null()))
            .unwrap();
        let rc = rsp_rx.pop_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rc.topic, rsp::OPEN);
        assert_eq!(rc.value, Value::i32(0));

        cmd_tx
            .push(stream_msg(cmd::BULK_IN_STREAM_OPEN, EP_IN, None))
            .unwrap();
        wait_until(
            || state.lock().bulk_in_submits.len() == 4,
            "transfer pool armed",
        );
        (state, cmd_tx, rsp_rx, join)
    }

    fn finalize(cmd_tx: &QueueSender, rsp_rx: &QueueReceiver, join: JoinHandle<()>) {
        cmd_tx
            .push(Message::publish(cmd::FINALIZE, Value::null()))
            .unwrap();
        loop {
            let msg = rsp_rx.pop_timeout(Duration::from_secs(5)).expect("finalize rc");
            if msg.topic == rsp::FINALIZE {
                break;
            }
        }
        join.join().unwrap();
    }

    #[test]
    fn test_bulk_in_timeout_rearms_silently() {
        let (state, cmd_tx, rsp_rx, join) = open_with_stream();

        state.lock().completions.push_back(TransferComplete {
            kind: TransferKind::BulkIn,
            endpoint: EP_IN,
            data: vec![0u8; 32 * 1024],
            result: Err(Error::TimedOut),
        });

        // The buffer goes straight back to the transport...
        wait_until(
            || state.lock().bulk_in_submits.len() == 5,
            "timed-out transfer re-armed",
        );
        // ...with nothing reported upward and no pipe cancellation.
        assert!(rsp_rx.pop_timeout(Duration::from_millis(50)).is_none());
        assert!(state.lock().cancelled.is_empty());

        finalize(&cmd_tx, &rsp_rx, join);
    }

    #[test]
    fn test_bulk_in_error_quarantines_pipe() {
        let (state, cmd_tx, rsp_rx, join) = open_with_stream();

        state.lock().completions.push_back(TransferComplete {
            kind: TransferKind::BulkIn,
            endpoint: EP_IN,
            data: vec![0u8; 32 * 1024],
            result: Err(Error::Io("stall".into())),
        });

        // The failure surfaces upward as a failed stream message and the
        // pipe is cancelled.
        let msg = rsp_rx.pop_timeout(Duration::from_secs(5)).expect("stream error");
        assert_eq!(msg.topic, cmd::STREAM_IN_DATA);
        match msg.extras {
            Extras::Stream {
                status: Some(Error::Io(_)),
                buffer: None,
                ..
            } => {}
            other => panic!("unexpected extras: {other:?}"),
        }
        assert!(state.lock().cancelled.contains(&EP_IN));

        // A returned buffer is not re-submitted while quarantined.
        let submits = state.lock().bulk_in_submits.len();
        cmd_tx
            .push(stream_msg(
                cmd::STREAM_IN_DATA,
                EP_IN,
                Some(TransferBuf {
                    slot: 0,
                    data: vec![0u8; 1024],
                }),
            ))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(state.lock().bulk_in_submits.len(), submits);

        // The stream stays refused until the next device open.
        cmd_tx
            .push(stream_msg(cmd::BULK_IN_STREAM_OPEN, EP_IN, None))
            .unwrap();
        let msg = rsp_rx.pop_timeout(Duration::from_secs(5)).expect("refusal");
        match msg.extras {
            Extras::Stream {
                status: Some(Error::Unavailable),
                ..
            } => {}
            other => panic!("unexpected extras: {other:?}"),
        }

        finalize(&cmd_tx, &rsp_rx, join);
    }

    #[test]
    fn test_ctrl_timeout_and_fifo_advance() {
        let (transport, state) = FakeTransport::new();
        let (rsp_tx, rsp_rx) = message_queue("rsp");
        let (cmd_tx, join) = spawn(Box::new(transport), rsp_tx, test_config());
        cmd_tx
            .push(Message::publish(cmd::OPEN, Value::null()))
            .unwrap();
        let rc = rsp_rx.pop_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rc.topic, rsp::OPEN);

        let setup = UsbSetup {
            request_type: 0x40,
            request: 1,
            value: 0,
            index: 0,
            length: 0,
        };
        cmd_tx.push(ctrl_msg(false, setup, Vec::new())).unwrap();

        // No completion ever arrives: the head times out, the control pipe
        // is cancelled, and the requester hears about it.
        let msg = rsp_rx.pop_timeout(Duration::from_secs(5)).expect("timeout rsp");
        assert_eq!(msg.topic, rsp::CTRL);
        match msg.extras {
            Extras::UsbCtrl {
                status: Some(Error::TimedOut),
                setup: s,
            } => assert_eq!(s, setup),
            other => panic!("unexpected extras: {other:?}"),
        }
        assert!(state.lock().cancelled.contains(&0));

        // The FIFO advances: the next request completes normally.
        let setup2 = UsbSetup {
            request: 2,
            ..setup
        };
        cmd_tx.push(ctrl_msg(true, setup2, Vec::new())).unwrap();
        wait_until(
            || state.lock().ctrl_submits == 2,
            "second control submitted",
        );
        state.lock().completions.push_back(TransferComplete {
            kind: TransferKind::Control,
            endpoint: 0,
            data: vec![0xAB, 0xCD],
            result: Ok(2),
        });
        let msg = rsp_rx.pop_timeout(Duration::from_secs(5)).expect("ctrl rsp");
        assert_eq!(msg.topic, rsp::CTRL);
        match msg.extras {
            Extras::UsbCtrl {
                status: None,
                setup: s,
            } => assert_eq!(s, setup2),
            other => panic!("unexpected extras: {other:?}"),
        }
        assert_eq!(msg.value.as_bin(), Some(&[0xAB, 0xCD][..]));

        finalize(&cmd_tx, &rsp_rx, join);
    }
}

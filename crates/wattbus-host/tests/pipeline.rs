//! End-to-end pipeline test over the simulated instrument: hotplug,
//! open handshake, metadata-validated writes through the device subtree,
//! streaming flush cadence, host statistics, and unplug.

use std::time::{Duration, Instant};
use wattbus_core::error::Error;
use wattbus_core::message::{Message, SubscriberFlags};
use wattbus_core::queue::message_queue;
use wattbus_core::topic::{TOPIC_DEVICE_ADD, TOPIC_DEVICE_REMOVE};
use wattbus_core::value::Value;
use wattbus_dsp::stats::StatisticsBlock;
use wattbus_host::backend::{Backend, BackendConfig, CMD_FINALIZE};
use wattbus_host::frontend::{Frontend, FrontendHandle};
use wattbus_host::sim::{SimScanner, GEN_CURRENT, GEN_VOLTAGE};
use wattbus_host::transport::DeviceInfo;
use wattbus_wire::stream::{ElementType, SignalHeader, SIGNAL_HEADER_SIZE};

const TIMEOUT: Duration = Duration::from_secs(10);
const PREFIX: &str = "u/js220/000123";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn test_device() -> DeviceInfo {
    DeviceInfo {
        model: "js220".into(),
        serial: "000123".into(),
        path: "sim/0".into(),
    }
}

/// Poll a retained topic until it matches.
fn wait_retained(
    frontend: &FrontendHandle,
    topic: &str,
    pred: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match frontend.query(topic, Duration::from_millis(250)) {
            Ok(value) if pred(&value) => return value,
            Ok(_) | Err(Error::NotFound) => {}
            Err(Error::TimedOut) => {}
            Err(e) => panic!("query {topic}: {e}"),
        }
        assert!(Instant::now() < deadline, "timeout waiting for {topic}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_device_lifecycle_and_streaming() {
    init_logging();
    let (frontend, fe_join) = Frontend::spawn();
    let (scanner, plug) = SimScanner::new();
    let config = BackendConfig {
        poll_interval: Duration::from_millis(20),
        stats_block_size: 5_000,
        ..Default::default()
    };
    let (backend_tx, be_join) = Backend::spawn(Box::new(scanner), frontend.clone(), config);

    // Broadcast subscriber registered before any device exists.
    let (bcast_tx, bcast_rx) = message_queue("bcast");
    frontend
        .subscribe_queue(
            "@",
            SubscriberFlags::PUB | SubscriberFlags::RETAIN,
            bcast_tx,
        )
        .unwrap();

    // Plug the instrument; exactly one device-add with the prefix arrives.
    plug.plug(test_device());
    let msg = bcast_rx.pop_timeout(TIMEOUT).expect("device-add");
    assert_eq!(msg.topic, TOPIC_DEVICE_ADD);
    assert_eq!(msg.value, Value::str(PREFIX));

    // The open sequence completes: state reaches open, identity retained.
    wait_retained(&frontend, &format!("{PREFIX}/h/state"), |v| {
        *v == Value::u8(3)
    });
    let fw = wait_retained(&frontend, &format!("{PREFIX}/c/fw/version"), |_| true);
    assert_eq!(fw, Value::str("1.2.3"));

    // A late broadcast subscriber receives a synthetic device-add.
    let (late_tx, late_rx) = message_queue("late");
    frontend
        .subscribe_queue(
            "@",
            SubscriberFlags::PUB | SubscriberFlags::RETAIN,
            late_tx,
        )
        .unwrap();
    let synthetic = late_rx.pop_timeout(TIMEOUT).expect("synthetic add");
    assert_eq!(synthetic.topic, TOPIC_DEVICE_ADD);
    assert_eq!(synthetic.value, Value::str(PREFIX));

    // Metadata-validated write: the option name coerces to its value.
    frontend
        .publish(format!("{PREFIX}/s/v/ctrl"), Value::str("on").retained())
        .unwrap();
    wait_retained(&frontend, &format!("{PREFIX}/s/v/ctrl"), |v| {
        *v == Value::u8(1)
    });

    // Enable current streaming and host statistics.
    let (data_tx, data_rx) = message_queue("data");
    frontend
        .subscribe_queue(
            &format!("{PREFIX}/s/i/!data"),
            SubscriberFlags::PUB,
            data_tx,
        )
        .unwrap();
    frontend
        .publish(format!("{PREFIX}/s/i/ctrl"), Value::u8(1).retained())
        .unwrap();
    frontend
        .publish(format!("{PREFIX}/s/stats/ctrl"), Value::str("on").retained())
        .unwrap();

    // Streaming data arrives, framed and within both flush ceilings.
    let msg = data_rx.pop_timeout(TIMEOUT).expect("stream data");
    let payload = msg.value.as_bin().expect("binary stream payload");
    let header = SignalHeader::decode(payload).expect("signal header");
    assert_eq!(header.element_type, ElementType::Float);
    assert_eq!(header.element_size_bits, 32);
    assert_eq!(header.decimate_factor, 2);
    assert_eq!(header.sample_rate, 1_000_000);
    assert!(header.element_count <= 25_000);
    assert_eq!(
        payload.len(),
        SIGNAL_HEADER_SIZE + header.element_count as usize * 4
    );
    let first = f32::from_le_bytes(payload[SIGNAL_HEADER_SIZE..SIGNAL_HEADER_SIZE + 4]
        .try_into()
        .unwrap());
    assert_eq!(first, GEN_CURRENT);

    // Host statistics blocks accumulate from aligned i/v pairs.
    let stats = wait_retained(&frontend, &format!("{PREFIX}/s/stats/value"), |_| true);
    let block = StatisticsBlock::decode(stats.as_bin().unwrap()).expect("stats block");
    assert_eq!(block.block_sample_count, 5_000);
    assert_eq!(block.valid_count, 5_000);
    assert!((block.current.avg - f64::from(GEN_CURRENT)).abs() < 1e-6);
    assert!((block.voltage.avg - f64::from(GEN_VOLTAGE)).abs() < 1e-6);
    assert!(
        (block.power.avg - f64::from(GEN_CURRENT) * f64::from(GEN_VOLTAGE)).abs() < 1e-6
    );

    // Unplug: one device-remove with the same value, device threads join.
    plug.unplug("000123");
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let msg = bcast_rx.pop_timeout(TIMEOUT).expect("device-remove");
        if msg.topic == TOPIC_DEVICE_REMOVE {
            assert_eq!(msg.value, Value::str(PREFIX));
            break;
        }
        assert!(Instant::now() < deadline, "no device-remove seen");
    }

    backend_tx
        .push(Message::publish(CMD_FINALIZE, Value::null()))
        .unwrap();
    be_join.join().unwrap();
    frontend.finalize().unwrap();
    fe_join.join().unwrap();
}

#[test]
fn test_protocol_major_mismatch_fails_open() {
    init_logging();
    let (frontend, fe_join) = Frontend::spawn();
    let (mut scanner, plug) = SimScanner::new();
    scanner.protocol_major = 99;
    let config = BackendConfig {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let (backend_tx, be_join) = Backend::spawn(Box::new(scanner), frontend.clone(), config);

    // Return codes surface on the state topic when open fails.
    let (rc_tx, rc_rx) = message_queue("rc");
    frontend
        .subscribe_queue(PREFIX, SubscriberFlags::RETURN_CODE, rc_tx)
        .unwrap();

    plug.plug(test_device());

    let deadline = Instant::now() + TIMEOUT;
    let code = loop {
        let msg = rc_rx.pop_timeout(TIMEOUT).expect("open return code");
        if msg.topic == format!("{PREFIX}/h/state#") {
            break msg.value.as_i64().unwrap();
        }
        assert!(Instant::now() < deadline);
    };
    assert_eq!(code, i64::from(Error::NotSupported.code()));

    // The device never reaches the open state.
    let state = frontend
        .query(&format!("{PREFIX}/h/state"), Duration::from_secs(1))
        .unwrap();
    assert_ne!(state, Value::u8(3));

    backend_tx
        .push(Message::publish(CMD_FINALIZE, Value::null()))
        .unwrap();
    be_join.join().unwrap();
    frontend.finalize().unwrap();
    fe_join.join().unwrap();
}

//! Backend: hotplug scanning and device thread lifecycle
//!
//! One backend thread per platform transport polls a [`DeviceScanner`] and
//! runs a mark-sweep over the known device set: every present instrument is
//! marked found, newcomers get a lower-level / upper-level thread pair and a
//! device-add broadcast, and vanished instruments are finalized and
//! announced with a device-remove broadcast.

use crate::frontend::FrontendHandle;
use crate::lldevice::{self, LlConfig};
use crate::transport::{DeviceInfo, DeviceScanner};
use crate::uldevice::{self, UlConfig};
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};
use wattbus_core::message::Message;
use wattbus_core::queue::{message_queue, QueueSender};
use wattbus_core::topic::{TOPIC_DEVICE_ADD, TOPIC_DEVICE_REMOVE};
use wattbus_core::value::Value;

/// Backend finalize command
pub const CMD_FINALIZE: &str = "!finalize";

/// Backend configuration
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Scan cadence
    pub poll_interval: Duration,
    /// Lower-level device configuration applied to every instrument
    pub ll: LlConfig,
    /// Host statistics block length in native samples
    pub stats_block_size: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            ll: LlConfig::default(),
            stats_block_size: 500_000,
        }
    }
}

/// Scan-sweep state per device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MarkState {
    None,
    Found,
    Added,
    Removed,
}

struct DeviceEntry {
    info: DeviceInfo,
    mark: MarkState,
    ul_tx: QueueSender,
    ul_join: JoinHandle<()>,
    ll_join: JoinHandle<()>,
}

/// The hotplug scanner thread
pub struct Backend;

impl Backend {
    /// Spawn the backend thread over a scanner.
    pub fn spawn(
        scanner: Box<dyn DeviceScanner>,
        frontend: FrontendHandle,
        config: BackendConfig,
    ) -> (QueueSender, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = message_queue("backend");
        let join = std::thread::Builder::new()
            .name("wattbus-backend".into())
            .spawn(move || {
                let mut scanner = scanner;
                let mut devices: HashMap<String, DeviceEntry> = HashMap::new();
                info!("backend started");
                loop {
                    if let Some(msg) = cmd_rx.pop_timeout(config.poll_interval) {
                        if msg.topic == CMD_FINALIZE {
                            break;
                        }
                    }
                    sweep(&mut *scanner, &frontend, &config, &mut devices);
                }
                info!("backend finalizing {} devices", devices.len());
                for (_, entry) in devices.drain() {
                    remove_device(&frontend, entry);
                }
            })
            .expect("spawn backend thread");
        (cmd_tx, join)
    }
}

fn sweep(
    scanner: &mut dyn DeviceScanner,
    frontend: &FrontendHandle,
    config: &BackendConfig,
    devices: &mut HashMap<String, DeviceEntry>,
) {
    for entry in devices.values_mut() {
        entry.mark = MarkState::None;
    }

    for info in scanner.scan() {
        let prefix = info.prefix();
        match devices.get_mut(&prefix) {
            Some(entry) => entry.mark = MarkState::Found,
            None => match add_device(scanner, frontend, config, &info) {
                Ok(entry) => {
                    devices.insert(prefix, entry);
                }
                Err(e) => warn!("device {prefix} add failed: {e}"),
            },
        }
    }

    let gone: Vec<String> = devices
        .iter()
        .filter(|(_, e)| e.mark == MarkState::None)
        .map(|(prefix, _)| prefix.clone())
        .collect();
    for prefix in gone {
        if let Some(mut entry) = devices.remove(&prefix) {
            entry.mark = MarkState::Removed;
            remove_device(frontend, entry);
        }
    }
}

fn add_device(
    scanner: &mut dyn DeviceScanner,
    frontend: &FrontendHandle,
    config: &BackendConfig,
    info: &DeviceInfo,
) -> wattbus_core::error::Result<DeviceEntry> {
    let prefix = info.prefix();
    info!("device arrived: {prefix}");
    let transport = scanner.open(info)?;

    let (ul_tx, ul_rx) = message_queue(format!("ul-{}", info.serial));
    let (ll_tx, ll_join) = lldevice::spawn(transport, ul_tx.clone(), config.ll.clone());
    let mut ul_config = UlConfig::new(info.clone());
    ul_config.stats_block_size = config.stats_block_size;
    let ul_join = uldevice::spawn(ul_config, ul_rx, ll_tx, frontend.clone());

    ul_tx.push(Message::publish(uldevice::cmd::OPEN, Value::null()))?;
    frontend.publish(TOPIC_DEVICE_ADD, Value::str(prefix))?;

    Ok(DeviceEntry {
        info: info.clone(),
        mark: MarkState::Added,
        ul_tx,
        ul_join,
        ll_join,
    })
}

fn remove_device(frontend: &FrontendHandle, entry: DeviceEntry) {
    let prefix = entry.info.prefix();
    info!("device removed: {prefix}");
    let _ = entry
        .ul_tx
        .push(Message::publish(uldevice::cmd::FINALIZE, Value::null()));
    if entry.ul_join.join().is_err() {
        warn!("{prefix}: upper-level thread panicked");
    }
    if entry.ll_join.join().is_err() {
        warn!("{prefix}: lower-level thread panicked");
    }
    let _ = frontend.publish(TOPIC_DEVICE_REMOVE, Value::str(prefix));
}

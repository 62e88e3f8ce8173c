//! Topic-tree pub/sub engine
//!
//! The broker is single-threaded by design: the frontend thread owns it and
//! is the only caller, so publication order seen by any subscriber is
//! exactly the frontend's dequeue order. Nodes hold at most one retained
//! value and optional metadata that validates publishes; subscribers are
//! value records, so the tree has no back references and no cycles.

use crate::metadata::Metadata;
use tracing::{debug, trace, warn};
use wattbus_core::error::{Error, Result};
use wattbus_core::message::{Message, SubscriberFlags, SubscriberId, SubscriberSink, SubscriberSpec};
use wattbus_core::topic::{Suffix, Topic, TOPIC_DEVICE_ADD};
use wattbus_core::value::{Value, ValueData, ValueFlags};

#[derive(Default)]
struct TopicNode {
    name: String,
    retained: Option<Value>,
    metadata: Option<Metadata>,
    /// Original metadata document, for replay and query
    metadata_json: Option<Value>,
    children: Vec<TopicNode>,
    subscribers: Vec<SubscriberSpec>,
}

impl TopicNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&TopicNode> {
        self.children.iter().find(|n| n.name == name)
    }
}

/// Hierarchical topic tree with retained values, metadata validation, and
/// per-subscriber flag filtering
#[derive(Default)]
pub struct Broker {
    root: TopicNode,
    /// Device prefixes currently listed, for device-add synthesis
    devices: Vec<String>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device prefixes currently listed.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// Route one publication. Validation failures are published as return
    /// codes and are never fatal; `Err` is returned only for topics the
    /// broker cannot address at all.
    pub fn publish(&mut self, msg: Message) -> Result<()> {
        let topic = Topic::new(&msg.topic)?;
        match topic.suffix() {
            Some(Suffix::Metadata) => self.publish_metadata(&topic, msg),
            Some(Suffix::ReturnCode) => {
                self.fan_out(&topic, &msg, SubscriberFlags::RETURN_CODE);
                Ok(())
            }
            Some(Suffix::Query) => {
                warn!("query topic {} published; dropped", msg.topic);
                Ok(())
            }
            None => self.publish_value(&topic, msg),
        }
    }

    fn publish_value(&mut self, topic: &Topic, msg: Message) -> Result<()> {
        let comps: Vec<&str> = topic.components().collect();
        let node = self.node_mut(&comps);

        // Metadata-driven validation and coercion.
        let mut value = msg.value.clone();
        if let Some(meta) = &node.metadata {
            match meta.coerce(&value) {
                Ok(v) => value = v,
                Err(e) => {
                    debug!("publish {} rejected: {e}", msg.topic);
                    let rc = Message::return_code(topic.as_str(), Err(e));
                    return self.publish(rc);
                }
            }
        }

        // Equal retained value: acknowledge and drop.
        if node.retained.as_ref() == Some(&value) {
            let rc = Message::return_code(topic.as_str(), Ok(()));
            return self.publish(rc);
        }

        if value.flags.contains(ValueFlags::RETAIN) && !topic.leaf_is_event() {
            node.retained = Some(value.clone());
        }

        self.track_devices(topic, &value);

        let msg = Message {
            topic: msg.topic,
            value,
            extras: msg.extras,
            src: msg.src,
        };
        self.fan_out(topic, &msg, SubscriberFlags::PUB);
        Ok(())
    }

    fn publish_metadata(&mut self, topic: &Topic, msg: Message) -> Result<()> {
        let comps: Vec<&str> = topic.components().collect();
        match &msg.value.data {
            ValueData::Json(json) => {
                let meta = match Metadata::parse(json) {
                    Ok(meta) => meta,
                    Err(e) => {
                        debug!("metadata {} rejected: {e}", msg.topic);
                        let rc = Message::return_code(topic.base(), Err(e));
                        return self.publish(rc);
                    }
                };
                let node = self.node_mut(&comps);
                node.metadata = Some(meta);
                node.metadata_json = Some(msg.value.clone());
            }
            ValueData::Null => {
                let node = self.node_mut(&comps);
                node.metadata = None;
                node.metadata_json = None;
            }
            _ => {
                let rc = Message::return_code(
                    topic.base(),
                    Err(Error::ParameterInvalid("metadata must be json".into())),
                );
                return self.publish(rc);
            }
        }
        self.fan_out(topic, &msg, SubscriberFlags::METADATA_RSP);
        Ok(())
    }

    /// Register a subscriber at `topic`. With the RETAIN flag, retained
    /// values and metadata below the node replay immediately, and a
    /// subscription at or above the device-add topic receives one synthetic
    /// device-add per listed device.
    pub fn subscribe(&mut self, topic: &str, spec: SubscriberSpec) -> Result<()> {
        let parsed = Topic::new(topic)?;
        let comps: Vec<&str> = parsed.components().collect();
        let node = self.node_mut(&comps);
        node.subscribers.retain(|s| s.id != spec.id);
        node.subscribers.push(spec.clone());
        trace!("subscribe {} id={}", topic, spec.id);

        if spec.flags.contains(SubscriberFlags::RETAIN) {
            let node = self.node(&comps).expect("node just created");
            Self::replay(node, parsed.base(), &spec);

            if spec.flags.contains(SubscriberFlags::PUB) && covers_device_add(parsed.base()) {
                for device in &self.devices {
                    deliver(
                        &spec,
                        &Message::publish(TOPIC_DEVICE_ADD, Value::str(device.clone())),
                    );
                }
            }
        }
        Ok(())
    }

    /// Remove the subscriber with `id` at `topic`. Idempotent.
    pub fn unsubscribe(&mut self, topic: &str, id: SubscriberId) -> Result<()> {
        let parsed = Topic::new(topic)?;
        let comps: Vec<&str> = parsed.components().collect();
        if let Some(node) = self.node_mut_existing(&comps) {
            node.subscribers.retain(|s| s.id != id);
        }
        Ok(())
    }

    /// Remove the subscriber with `id` everywhere.
    pub fn unsubscribe_all(&mut self, id: SubscriberId) {
        fn walk(node: &mut TopicNode, id: SubscriberId) {
            node.subscribers.retain(|s| s.id != id);
            for child in &mut node.children {
                walk(child, id);
            }
        }
        walk(&mut self.root, id);
    }

    /// Copy out the retained value, or the metadata document when the topic
    /// ends in `$`. `max_size` bounds pointer-kind payloads.
    pub fn query(&self, topic: &str, max_size: Option<usize>) -> Result<Value> {
        let parsed = Topic::new(topic)?;
        let comps: Vec<&str> = parsed.components().collect();
        let node = self.node(&comps).ok_or(Error::NotFound)?;
        let value = match parsed.suffix() {
            Some(Suffix::Metadata) => node.metadata_json.clone().ok_or(Error::NotFound)?,
            _ => node.retained.clone().ok_or(Error::NotFound)?,
        };
        if let (Some(max), Some(size)) = (max_size, value.size()) {
            if size > max {
                return Err(Error::TooSmall);
            }
        }
        Ok(value)
    }

    /// Keep the device list in sync with add/remove broadcasts.
    fn track_devices(&mut self, topic: &Topic, value: &Value) {
        let Some(prefix) = value.as_str() else {
            return;
        };
        if topic.as_str() == TOPIC_DEVICE_ADD {
            if !self.devices.iter().any(|d| d == prefix) {
                self.devices.push(prefix.to_string());
            }
        } else if topic.as_str() == wattbus_core::topic::TOPIC_DEVICE_REMOVE {
            self.devices.retain(|d| d != prefix);
        }
    }

    /// Deliver to flag-matching subscribers from the leaf up to the root.
    fn fan_out(&self, topic: &Topic, msg: &Message, flag: SubscriberFlags) {
        let mut nodes = vec![&self.root];
        let mut node = &self.root;
        for comp in topic.components() {
            match node.child(comp) {
                Some(child) => {
                    nodes.push(child);
                    node = child;
                }
                None => break,
            }
        }
        for node in nodes.iter().rev() {
            for spec in &node.subscribers {
                if !spec.flags.contains(flag) {
                    continue;
                }
                if msg.src == Some(spec.id) {
                    continue; // echo suppression
                }
                deliver(spec, msg);
            }
        }
    }

    /// Replay retained state below `node` to one new subscriber.
    fn replay(node: &TopicNode, path: &str, spec: &SubscriberSpec) {
        if spec.flags.contains(SubscriberFlags::PUB) {
            if let Some(value) = &node.retained {
                deliver(spec, &Message::publish(path, value.clone()));
            }
        }
        if spec.flags.contains(SubscriberFlags::METADATA_RSP) {
            if let Some(json) = &node.metadata_json {
                deliver(spec, &Message::publish(format!("{path}$"), json.clone()));
            }
        }
        for child in &node.children {
            let child_path = if path.is_empty() {
                child.name.clone()
            } else {
                format!("{path}/{}", child.name)
            };
            Self::replay(child, &child_path, spec);
        }
    }

    fn node(&self, comps: &[&str]) -> Option<&TopicNode> {
        let mut node = &self.root;
        for comp in comps {
            node = node.child(comp)?;
        }
        Some(node)
    }

    fn node_mut_existing(&mut self, comps: &[&str]) -> Option<&mut TopicNode> {
        let mut node = &mut self.root;
        for comp in comps {
            let pos = node.children.iter().position(|n| n.name == *comp)?;
            node = &mut node.children[pos];
        }
        Some(node)
    }

    /// Find the node for a component path, creating missing nodes.
    fn node_mut(&mut self, comps: &[&str]) -> &mut TopicNode {
        let mut node = &mut self.root;
        for comp in comps {
            let pos = node.children.iter().position(|n| n.name == *comp);
            node = match pos {
                Some(i) => &mut node.children[i],
                None => {
                    node.children.push(TopicNode::new(comp));
                    node.children.last_mut().unwrap()
                }
            };
        }
        node
    }
}

fn deliver(spec: &SubscriberSpec, msg: &Message) {
    match &spec.sink {
        SubscriberSink::Queue(q) => {
            if q.push(msg.fanout_clone()).is_err() {
                trace!("subscriber {} queue closed", spec.id);
            }
        }
        SubscriberSink::Callback(cb) => cb(msg),
    }
}

/// Whether a subscription at `topic` sits at or above the device-add topic.
fn covers_device_add(topic: &str) -> bool {
    topic.is_empty()
        || topic == TOPIC_DEVICE_ADD
        || TOPIC_DEVICE_ADD.starts_with(&format!("{topic}/"))
}

//! Frontend: the broker-owning orchestrator thread
//!
//! The frontend drains its inbox and dispatches each message: broker-local
//! control topics (`_/!sub`, `_/!unsub`, `_/!unsub+`, `_/!query`) operate on
//! the subscription state, everything else is routed through
//! [`Broker::publish`]. No other thread ever touches the broker tree.

use crate::broker::Broker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use wattbus_core::error::{Error, Result};
use wattbus_core::message::{
    Extras, Message, SubscriberFlags, SubscriberId, SubscriberSink, SubscriberSpec,
};
use wattbus_core::queue::{message_queue, QueueSender};
use wattbus_core::topic::{TOPIC_QUERY, TOPIC_SUB, TOPIC_UNSUB, TOPIC_UNSUB_ALL};
use wattbus_core::value::Value;

/// Broker-local finalize topic; the frontend's sole shutdown primitive
pub const TOPIC_FINALIZE: &str = "_/!fin";

/// The broker-owning thread
pub struct Frontend {
    broker: Broker,
    inbox: wattbus_core::queue::QueueReceiver,
}

impl Frontend {
    /// Spawn the frontend thread; returns the client handle and the join
    /// handle for shutdown.
    pub fn spawn() -> (FrontendHandle, JoinHandle<()>) {
        let (tx, rx) = message_queue("frontend");
        let frontend = Frontend {
            broker: Broker::new(),
            inbox: rx,
        };
        let join = std::thread::Builder::new()
            .name("wattbus-frontend".into())
            .spawn(move || frontend.run())
            .expect("spawn frontend thread");
        (
            FrontendHandle {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            join,
        )
    }

    fn run(mut self) {
        info!("frontend started");
        loop {
            let msg = self.inbox.pop();
            if msg.topic == TOPIC_FINALIZE {
                break;
            }
            self.dispatch(msg);
        }
        info!("frontend finalized");
    }

    fn dispatch(&mut self, msg: Message) {
        match msg.topic.as_str() {
            TOPIC_SUB => {
                let (Some(topic), Extras::Subscriber(spec)) = (msg.value.as_str(), &msg.extras)
                else {
                    warn!("malformed subscribe message");
                    return;
                };
                if let Err(e) = self.broker.subscribe(topic, spec.clone()) {
                    debug!("subscribe {topic} failed: {e}");
                }
            }
            TOPIC_UNSUB => {
                let (Some(topic), Extras::Subscriber(spec)) = (msg.value.as_str(), &msg.extras)
                else {
                    warn!("malformed unsubscribe message");
                    return;
                };
                let _ = self.broker.unsubscribe(topic, spec.id);
            }
            TOPIC_UNSUB_ALL => {
                if let Extras::Subscriber(spec) = &msg.extras {
                    self.broker.unsubscribe_all(spec.id);
                }
            }
            TOPIC_QUERY => {
                let (Some(topic), Extras::Query { reply }) = (msg.value.as_str(), &msg.extras)
                else {
                    warn!("malformed query message");
                    return;
                };
                let response = match self.broker.query(topic, None) {
                    Ok(value) => Message::publish(topic, value),
                    Err(e) => Message::return_code(topic, Err(e)),
                };
                let _ = reply.push(response);
            }
            _ => {
                if let Err(e) = self.broker.publish(msg) {
                    debug!("publish failed: {e}");
                }
            }
        }
    }
}

/// Cloneable client handle to the frontend thread
#[derive(Clone)]
pub struct FrontendHandle {
    tx: QueueSender,
    next_id: Arc<AtomicU64>,
}

impl FrontendHandle {
    /// The raw inbox sender (for tests and adapters).
    pub fn sender(&self) -> QueueSender {
        self.tx.clone()
    }

    /// Allocate a subscriber id.
    pub fn alloc_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a publication.
    pub fn publish(&self, topic: impl Into<String>, value: Value) -> Result<()> {
        self.tx.push(Message::publish(topic, value))
    }

    /// Enqueue a publication tagged with its publishing subscriber, so the
    /// broker suppresses the echo.
    pub fn publish_from(
        &self,
        src: SubscriberId,
        topic: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        self.tx.push(Message::publish(topic, value).with_src(src))
    }

    /// Enqueue an arbitrary message.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.tx.push(msg)
    }

    /// Subscribe a queue sink under `topic`.
    pub fn subscribe_queue(
        &self,
        topic: &str,
        flags: SubscriberFlags,
        sink: QueueSender,
    ) -> Result<SubscriberId> {
        let id = self.alloc_id();
        self.subscribe_spec(
            topic,
            SubscriberSpec {
                id,
                flags,
                sink: SubscriberSink::Queue(sink),
            },
        )?;
        Ok(id)
    }

    /// Subscribe a callback sink under `topic`. The callback runs on the
    /// frontend thread and must not block.
    pub fn subscribe_fn(
        &self,
        topic: &str,
        flags: SubscriberFlags,
        callback: Arc<dyn Fn(&Message) + Send + Sync>,
    ) -> Result<SubscriberId> {
        let id = self.alloc_id();
        self.subscribe_spec(
            topic,
            SubscriberSpec {
                id,
                flags,
                sink: SubscriberSink::Callback(callback),
            },
        )?;
        Ok(id)
    }

    /// Subscribe with an existing spec (re-subscribe keeps the id).
    pub fn subscribe_spec(&self, topic: &str, spec: SubscriberSpec) -> Result<()> {
        self.tx.push(Message {
            topic: TOPIC_SUB.into(),
            value: Value::str(topic),
            extras: Extras::Subscriber(spec),
            src: None,
        })
    }

    /// Remove subscriber `id` at `topic`.
    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) -> Result<()> {
        self.tx.push(Message {
            topic: TOPIC_UNSUB.into(),
            value: Value::str(topic),
            extras: Extras::Subscriber(SubscriberSpec {
                id,
                flags: SubscriberFlags::empty(),
                sink: SubscriberSink::Callback(Arc::new(|_| {})),
            }),
            src: None,
        })
    }

    /// Remove subscriber `id` everywhere.
    pub fn unsubscribe_all(&self, id: SubscriberId) -> Result<()> {
        self.tx.push(Message {
            topic: TOPIC_UNSUB_ALL.into(),
            value: Value::null(),
            extras: Extras::Subscriber(SubscriberSpec {
                id,
                flags: SubscriberFlags::empty(),
                sink: SubscriberSink::Callback(Arc::new(|_| {})),
            }),
            src: None,
        })
    }

    /// Synchronous retained-value query with a timeout.
    pub fn query(&self, topic: &str, timeout: Duration) -> Result<Value> {
        let (reply_tx, reply_rx) = message_queue("query-reply");
        self.tx.push(Message {
            topic: TOPIC_QUERY.into(),
            value: Value::str(topic),
            extras: Extras::Query { reply: reply_tx },
            src: None,
        })?;
        let msg = reply_rx.pop_timeout(timeout).ok_or(Error::TimedOut)?;
        if msg.topic.ends_with('#') {
            let code = msg.value.as_i64().unwrap_or(1) as u8;
            Err(Error::from_code(code).unwrap_or(Error::Unspecified))
        } else {
            Ok(msg.value)
        }
    }

    /// Request frontend shutdown.
    pub fn finalize(&self) -> Result<()> {
        self.tx.push(Message::publish(TOPIC_FINALIZE, Value::null()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattbus_core::topic::TOPIC_DEVICE_ADD;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_publish_query_roundtrip() {
        let (handle, join) = Frontend::spawn();
        handle.publish("a/b", Value::u32(42).retained()).unwrap();
        assert_eq!(handle.query("a/b", TIMEOUT).unwrap(), Value::u32(42));
        assert_eq!(
            handle.query("a/missing", TIMEOUT).unwrap_err(),
            Error::NotFound
        );
        handle.finalize().unwrap();
        join.join().unwrap();
    }

    #[test]
    fn test_subscription_delivery_through_queue() {
        let (handle, join) = Frontend::spawn();
        let (sub_tx, sub_rx) = message_queue("sub");
        let id = handle
            .subscribe_queue("dev", SubscriberFlags::PUB, sub_tx)
            .unwrap();

        handle.publish("dev/x", Value::u8(1)).unwrap();
        let msg = sub_rx.pop_timeout(TIMEOUT).unwrap();
        assert_eq!(msg.topic, "dev/x");

        // Own publications are suppressed.
        handle.publish_from(id, "dev/y", Value::u8(2)).unwrap();
        handle.publish("dev/z", Value::u8(3)).unwrap();
        let msg = sub_rx.pop_timeout(TIMEOUT).unwrap();
        assert_eq!(msg.topic, "dev/z");

        handle.unsubscribe("dev", id).unwrap();
        handle.publish("dev/x", Value::u8(4)).unwrap();
        assert!(sub_rx.pop_timeout(Duration::from_millis(50)).is_none());

        handle.finalize().unwrap();
        join.join().unwrap();
    }

    #[test]
    fn test_device_add_replay_via_control_topics() {
        let (handle, join) = Frontend::spawn();
        handle
            .publish(TOPIC_DEVICE_ADD, Value::str("u/js220/42"))
            .unwrap();

        let (sub_tx, sub_rx) = message_queue("sub");
        handle
            .subscribe_queue(
                "@",
                SubscriberFlags::PUB | SubscriberFlags::RETAIN,
                sub_tx,
            )
            .unwrap();
        let msg = sub_rx.pop_timeout(TIMEOUT).unwrap();
        assert_eq!(msg.topic, TOPIC_DEVICE_ADD);
        assert_eq!(msg.value, Value::str("u/js220/42"));

        handle.finalize().unwrap();
        join.join().unwrap();
    }
}

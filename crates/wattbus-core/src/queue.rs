//! Inter-thread message queues
//!
//! Every long-lived driver thread owns exactly one inbound queue. Pushing is
//! safe from any thread; popping is restricted to the owner by construction:
//! the constructor returns a cloneable [`QueueSender`] and a single
//! [`QueueReceiver`]. The C original paired the queue with an OS wait handle
//! (auto-reset event / self-pipe); the condvar fills that role here.

use crate::error::{Error, Result};
use crate::message::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

struct Shared {
    name: String,
    inner: Mutex<Inner>,
    avail: Condvar,
}

struct Inner {
    queue: VecDeque<Message>,
    closed: bool,
}

/// Create a new queue, returning the push and pop ends.
pub fn message_queue(name: impl Into<String>) -> (QueueSender, QueueReceiver) {
    let shared = Arc::new(Shared {
        name: name.into(),
        inner: Mutex::new(Inner {
            queue: VecDeque::new(),
            closed: false,
        }),
        avail: Condvar::new(),
    });
    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

/// Push end; clone freely across threads.
#[derive(Clone)]
pub struct QueueSender {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for QueueSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSender")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl QueueSender {
    /// Enqueue a message in FIFO order. Fails with `Closed` once the owning
    /// receiver has been dropped.
    pub fn push(&self, msg: Message) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.queue.push_back(msg);
        drop(inner);
        self.shared.avail.notify_one();
        Ok(())
    }

    /// Queue name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of undelivered messages.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pop end; owned by exactly one thread.
pub struct QueueReceiver {
    shared: Arc<Shared>,
}

impl QueueReceiver {
    /// Pop the next message, blocking until one arrives.
    pub fn pop(&self) -> Message {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(msg) = inner.queue.pop_front() {
                return msg;
            }
            self.shared.avail.wait(&mut inner);
        }
    }

    /// Pop the next message, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(msg) = inner.queue.pop_front() {
                return Some(msg);
            }
            if self
                .shared
                .avail
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.queue.pop_front();
            }
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<Message> {
        self.shared.inner.lock().queue.pop_front()
    }

    /// Move every pending message into `out`, preserving order.
    pub fn drain(&self, out: &mut Vec<Message>) {
        let mut inner = self.shared.inner.lock();
        out.extend(inner.queue.drain(..));
    }

    /// A sender for this queue.
    pub fn sender(&self) -> QueueSender {
        QueueSender {
            shared: self.shared.clone(),
        }
    }

    /// Queue name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        self.shared.inner.lock().closed = true;
    }
}

//! In-process message broker.
//!
//! Backs development and tests with the same at-least-once contract the
//! `MessageBroker` trait promises from a hosted queue: a consumed message
//! stays in flight until acked, and a nack puts it back at the head of the
//! queue marked as redelivered. Delivery tags are per-queue and never
//! reused within a broker's lifetime.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use stepflow_core::queue::broker::{BrokerError, Delivery, MessageBroker, RESULT_QUEUE};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct PendingMessage {
    payload: Value,
    redelivered: bool,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<PendingMessage>,
    in_flight: HashMap<u64, PendingMessage>,
    next_tag: u64,
}

/// One declared queue: ready messages plus in-flight deliveries.
#[derive(Default)]
struct QueueState {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// In-memory `MessageBroker` with per-queue FIFO ordering.
pub struct MemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
    shutdown: CancellationToken,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Shut the broker down. Blocked consumers resolve with
    /// [`BrokerError::Closed`]; further operations are rejected.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn state(&self, queue: &str) -> Result<Arc<QueueState>, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        self.queues
            .get(queue)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for MemoryBroker {
    async fn ensure_topology(&self) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        self.queues.entry(RESULT_QUEUE.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Value) -> Result<(), BrokerError> {
        let state = self.state(queue)?;
        let mut inner = state.inner.lock().await;
        inner.ready.push_back(PendingMessage {
            payload,
            redelivered: false,
        });
        state.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Delivery, BrokerError> {
        let state = self.state(queue)?;
        loop {
            // Register for a wakeup before checking the queue; notify_one
            // stores a permit, so a publish racing this gap is not lost.
            let notified = state.notify.notified();
            {
                let mut inner = state.inner.lock().await;
                if let Some(message) = inner.ready.pop_front() {
                    inner.next_tag += 1;
                    let tag = inner.next_tag;
                    inner.in_flight.insert(tag, message.clone());
                    if !inner.ready.is_empty() {
                        // Wake the next waiter for the remaining backlog.
                        state.notify.notify_one();
                    }
                    return Ok(Delivery {
                        delivery_tag: tag,
                        payload: message.payload,
                        redelivered: message.redelivered,
                    });
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(BrokerError::Closed),
                _ = notified => {}
            }
        }
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        let state = self.state(queue)?;
        let mut inner = state.inner.lock().await;
        inner
            .in_flight
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: queue.to_string(),
                tag: delivery_tag,
            })?;
        Ok(())
    }

    async fn nack(&self, queue: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        let state = self.state(queue)?;
        let mut inner = state.inner.lock().await;
        let mut message =
            inner
                .in_flight
                .remove(&delivery_tag)
                .ok_or_else(|| BrokerError::UnknownDelivery {
                    queue: queue.to_string(),
                    tag: delivery_tag,
                })?;
        message.redelivered = true;
        inner.ready.push_front(message);
        state.notify.notify_one();
        Ok(())
    }
}

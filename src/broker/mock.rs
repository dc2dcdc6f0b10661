//! [`MockBroker`]: deterministic in-memory [`super::Broker`] used by unit
//! and scenario tests in place of a running RabbitMQ.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, Delivery, DeliverySubscription, Envelope};
use crate::error::BrokerError;

struct QueueState {
    backlog: VecDeque<Delivery>,
    subscriber: Option<(String, mpsc::UnboundedSender<Delivery>)>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            backlog: VecDeque::new(),
            subscriber: None,
        }
    }
}

/// In-memory stand-in for a RabbitMQ broker. Each named queue has a FIFO
/// backlog and at most one active subscriber; publishing routes directly
/// to the active subscriber when one exists (mirroring a real broker
/// pushing to whichever consumer is attached), otherwise the message waits
/// in the backlog for `basic_get` or a future `basic_consume`.
pub struct MockBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    next_delivery_tag: AtomicU64,
    acked: Mutex<Vec<u64>>,
    nacked: Mutex<Vec<(u64, bool)>>,
    fail_next_get: AtomicBool,
}

impl MockBroker {
    /// Create an empty broker with no queues.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            next_delivery_tag: AtomicU64::new(1),
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
            fail_next_get: AtomicBool::new(false),
        })
    }

    /// Arm a one-shot failure: the next `basic_get` call returns
    /// `Err(BrokerError::Io(..))` instead of consulting the backlog.
    pub fn fail_next_get(&self) {
        self.fail_next_get.store(true, Ordering::SeqCst);
    }

    /// Publish a message to `queue`, as if it arrived from an external
    /// producer. Delivered directly to an active subscriber if one exists,
    /// otherwise queued in the backlog.
    pub fn publish(&self, queue: &str, body: impl Into<Bytes>) {
        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            envelope: Envelope {
                delivery_tag,
                redelivered: false,
            },
            body: body.into(),
        };
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_insert_with(QueueState::new);
        if let Some((_, sender)) = &state.subscriber {
            if sender.send(delivery).is_ok() {
                return;
            }
        }
        state.backlog.push_back(delivery);
    }

    /// Messages acked so far, for test assertions.
    #[must_use]
    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }

    /// `(delivery_tag, requeue)` pairs nacked so far, for test assertions.
    #[must_use]
    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.nacked.lock().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn basic_get(&self, queue: &str, _auto_ack: bool) -> Result<Option<Delivery>, BrokerError> {
        if self.fail_next_get.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Io(anyhow::anyhow!("simulated basic_get failure")));
        }
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_insert_with(QueueState::new);
        Ok(state.backlog.pop_front())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        _no_local: bool,
        _auto_ack: bool,
    ) -> Result<Box<dyn DeliverySubscription>, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_insert_with(QueueState::new);
        for delivery in state.backlog.drain(..) {
            let _ = sender.send(delivery);
        }
        state.subscriber = Some((tag.to_string(), sender));
        Ok(Box::new(MockSubscription {
            tag: tag.to_string(),
            receiver,
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.acked.lock().push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.nacked.lock().push((delivery_tag, requeue));
        Ok(())
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock();
        for state in queues.values_mut() {
            if state.subscriber.as_ref().is_some_and(|(t, _)| t == tag) {
                state.subscriber = None;
            }
        }
        Ok(())
    }
}

struct MockSubscription {
    tag: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl DeliverySubscription for MockSubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        self.receiver.recv().await.map(Ok)
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

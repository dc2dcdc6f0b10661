//! [`ReceiveBuffer`] and the `OnceOnlyConsumer` pump task.
//!
//! Bridges the broker's push-only subscription model to pull semantics: a
//! single outstanding subscription, pre-fetching up to `batching_size`
//! messages, is amortized across many synchronous `receive` calls instead
//! of opening one subscription per call.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::abortable::Abortable;
use crate::broker::{Broker, Delivery};
use crate::error::{Aborted, BrokerError, GetError};
use crate::session::ConsumerTag;
use crate::time_tracker::TimeTracker;

struct Inner {
    fifo: VecDeque<Delivery>,
    /// Tag of the currently in-flight subscription, if any. Cleared by the
    /// pump task when it exhausts its budget or is cancelled.
    subscription_tag: Option<ConsumerTag>,
    aborted: bool,
    /// Set by the pump task when its subscription stream errors out, and
    /// taken (surfaced, not silently dropped) by the next waiter woken with
    /// nothing in the FIFO.
    pump_error: Option<BrokerError>,
}

/// Amortizes one broker subscription across many synchronous `receive`
/// calls.
pub struct ReceiveBuffer {
    broker: Arc<dyn Broker>,
    queue_name: String,
    no_local: bool,
    batching_size: usize,
    runtime: Handle,
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl ReceiveBuffer {
    /// Create a new, empty buffer bound to `queue_name` on `broker`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        queue_name: impl Into<String>,
        no_local: bool,
        batching_size: usize,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            queue_name: queue_name.into(),
            no_local,
            batching_size,
            runtime,
            inner: Mutex::new(Inner {
                fifo: VecDeque::new(),
                subscription_tag: None,
                aborted: false,
                pump_error: None,
            }),
            condvar: Condvar::new(),
        })
    }

    /// Protocol for `get(deadline)`: dequeue-if-buffered, else a single
    /// non-blocking fetch for a zero deadline, else ensure a pump
    /// subscription is running and block on it.
    ///
    /// # Errors
    ///
    /// Returns [`GetError::Aborted`] if the buffer was aborted while
    /// waiting or fetching, and [`GetError::Broker`] if the broker call
    /// itself failed.
    pub fn get(self: &Arc<Self>, deadline: TimeTracker) -> Result<Option<Delivery>, GetError> {
        // Step 1: FIFO non-empty -> dequeue and return.
        if let Some(delivery) = self.try_dequeue()? {
            return Ok(Some(delivery));
        }

        // Step 2: zero deadline -> single non-blocking broker fetch.
        if deadline.is_zero() {
            let delivery = self
                .runtime
                .block_on(self.broker.basic_get(&self.queue_name, false))
                .map_err(|err| {
                    warn!(queue = %self.queue_name, error = %err, "basic_get failed");
                    GetError::Broker(err)
                })?;
            return Ok(delivery);
        }

        // Step 3: ensure a subscription is in flight.
        self.ensure_subscription()?;

        // Step 4: block on the wait condition.
        self.wait_for_delivery(deadline)
    }

    fn try_dequeue(&self) -> Result<Option<Delivery>, GetError> {
        let mut inner = self.inner.lock();
        if inner.aborted {
            return Err(GetError::Aborted(Aborted));
        }
        Ok(inner.fifo.pop_front())
    }

    fn wait_for_delivery(self: &Arc<Self>, deadline: TimeTracker) -> Result<Option<Delivery>, GetError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.aborted {
                return Err(GetError::Aborted(Aborted));
            }
            if let Some(delivery) = inner.fifo.pop_front() {
                return Ok(Some(delivery));
            }
            if let Some(err) = inner.pump_error.take() {
                return Err(GetError::Broker(err));
            }
            if deadline.is_zero() {
                return Ok(None);
            }
            match deadline.remaining() {
                None => self.condvar.wait(&mut inner),
                Some(remaining) => {
                    let result = self.condvar.wait_for(&mut inner, remaining);
                    if result.timed_out() && deadline.timed_out() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn ensure_subscription(self: &Arc<Self>) -> Result<(), GetError> {
        {
            let inner = self.inner.lock();
            if inner.subscription_tag.is_some() || inner.aborted {
                return Ok(());
            }
        }
        let tag = ConsumerTag::generate();
        let subscribe_result = self.runtime.block_on(self.broker.basic_consume(
            &self.queue_name,
            tag.as_str(),
            self.no_local,
            false,
        ));
        let subscription = match subscribe_result {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(queue = %self.queue_name, error = %err, "basic_consume failed");
                return Err(GetError::Broker(err));
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.aborted {
                // Lost the race with an abort; drop the subscription
                // immediately rather than let the pump task run.
                let broker = self.broker.clone();
                let cancel_tag = tag.as_str().to_string();
                self.runtime.spawn(async move {
                    let _ = broker.basic_cancel(&cancel_tag).await;
                });
                return Err(GetError::Aborted(Aborted));
            }
            inner.subscription_tag = Some(tag.clone());
        }

        let this = self.clone();
        let budget = self.batching_size;
        self.runtime.spawn(async move {
            this.run_pump(tag, subscription, budget).await;
        });
        Ok(())
    }

    /// `OnceOnlyConsumer`: accepts up to `budget` deliveries then
    /// auto-cancels itself.
    async fn run_pump(
        self: Arc<Self>,
        tag: ConsumerTag,
        mut subscription: Box<dyn crate::broker::DeliverySubscription>,
        budget: usize,
    ) {
        let mut received = 0usize;
        while received < budget {
            match subscription.next().await {
                Some(Ok(delivery)) => {
                    received += 1;
                    let mut inner = self.inner.lock();
                    inner.fifo.push_back(delivery);
                    self.condvar.notify_all();
                }
                Some(Err(err)) => {
                    warn!(queue = %self.queue_name, error = %err, "delivery stream error");
                    let mut inner = self.inner.lock();
                    inner.pump_error = Some(err);
                    self.condvar.notify_all();
                    break;
                }
                None => break,
            }
        }
        debug!(queue = %self.queue_name, tag = %tag, received, "once-only subscription exhausted, cancelling");
        if let Err(err) = self.broker.basic_cancel(tag.as_str()).await {
            warn!(queue = %self.queue_name, tag = %tag, error = %err, "cancel after exhaustion failed");
        }
        let mut inner = self.inner.lock();
        if inner.subscription_tag.as_ref() == Some(&tag) {
            inner.subscription_tag = None;
        }
    }

    /// Cancel the in-flight subscription without discarding buffered
    /// deliveries or waking waiters.
    fn cancel_subscription(&self) {
        let tag = {
            let mut inner = self.inner.lock();
            inner.subscription_tag.take()
        };
        if let Some(tag) = tag {
            let broker = self.broker.clone();
            let tag_str = tag.as_str().to_string();
            self.runtime.spawn(async move {
                let _ = broker.basic_cancel(&tag_str).await;
            });
        }
    }
}

impl Abortable for ReceiveBuffer {
    fn start(&self) {
        // Subscriptions are created lazily by `get`; nothing to do here.
    }

    fn stop(&self) {
        self.cancel_subscription();
    }

    fn abort(&self) {
        self.cancel_subscription();
        let discarded: Vec<Delivery> = {
            let mut inner = self.inner.lock();
            inner.aborted = true;
            let discarded = inner.fifo.drain(..).collect();
            self.condvar.notify_all();
            discarded
        };
        // Nack discarded buffered deliveries with requeue=true so the
        // broker redelivers them promptly instead of relying solely on
        // channel-close recovery.
        if !discarded.is_empty() {
            let broker = self.broker.clone();
            let queue_name = self.queue_name.clone();
            self.runtime.spawn(async move {
                for delivery in discarded {
                    if let Err(err) = broker.basic_nack(delivery.envelope.delivery_tag, true).await {
                        warn!(
                            queue = %queue_name,
                            delivery_tag = delivery.envelope.delivery_tag,
                            error = %err,
                            "failed to nack discarded buffered delivery"
                        );
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use std::time::Duration;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn get_with_zero_deadline_performs_single_basic_get() {
        let runtime = rt();
        let broker = MockBroker::new();
        broker.publish("q", bytes::Bytes::from_static(b"hello"));
        let buffer = ReceiveBuffer::new(broker, "q", false, 5, runtime.handle().clone());

        let delivery = buffer.get(TimeTracker::zero()).unwrap();
        assert_eq!(delivery.unwrap().body, bytes::Bytes::from_static(b"hello"));
    }

    #[test]
    fn get_with_zero_deadline_on_empty_queue_returns_none() {
        let runtime = rt();
        let broker = MockBroker::new();
        let buffer = ReceiveBuffer::new(broker, "q", false, 5, runtime.handle().clone());
        assert_eq!(buffer.get(TimeTracker::zero()).unwrap(), None);
    }

    #[test]
    fn get_with_deadline_starts_subscription_and_waits() {
        let runtime = rt();
        let broker = MockBroker::new();
        let buffer = ReceiveBuffer::new(broker.clone(), "q", false, 5, runtime.handle().clone());

        let buffer2 = buffer.clone();
        let handle = std::thread::spawn(move || {
            buffer2.get(TimeTracker::from_duration(Duration::from_secs(2)))
        });

        std::thread::sleep(Duration::from_millis(100));
        broker.publish("q", bytes::Bytes::from_static(b"batched"));

        let delivery = handle.join().unwrap().unwrap();
        assert_eq!(delivery.unwrap().body, bytes::Bytes::from_static(b"batched"));
    }

    #[test]
    fn get_times_out_returning_none() {
        let runtime = rt();
        let broker = MockBroker::new();
        let buffer = ReceiveBuffer::new(broker, "q", false, 5, runtime.handle().clone());

        let start = std::time::Instant::now();
        let delivery = buffer.get(TimeTracker::from_duration(Duration::from_millis(100))).unwrap();
        assert_eq!(delivery, None);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn abort_wakes_waiter_and_discards_with_nack() {
        let runtime = rt();
        let broker = MockBroker::new();
        let buffer = ReceiveBuffer::new(broker.clone(), "q", false, 5, runtime.handle().clone());

        let buffer2 = buffer.clone();
        let handle = std::thread::spawn(move || buffer2.get(TimeTracker::infinite()));

        std::thread::sleep(Duration::from_millis(100));
        // Seed a buffered delivery directly, bypassing the subscription,
        // by publishing before abort runs its discard logic is racy; so
        // instead assert the abort path itself on the waiting call.
        buffer.abort();

        assert!(matches!(handle.join().unwrap(), Err(GetError::Aborted(_))));
    }

    #[test]
    fn subsequent_get_after_abort_also_fails() {
        let runtime = rt();
        let broker = MockBroker::new();
        let buffer = ReceiveBuffer::new(broker, "q", false, 5, runtime.handle().clone());
        buffer.abort();
        assert!(matches!(buffer.get(TimeTracker::zero()), Err(GetError::Aborted(_))));
    }

    #[test]
    fn zero_deadline_broker_failure_surfaces_as_broker_error() {
        let runtime = rt();
        let broker = MockBroker::new();
        broker.fail_next_get();
        let buffer = ReceiveBuffer::new(broker, "q", false, 5, runtime.handle().clone());
        assert!(matches!(buffer.get(TimeTracker::zero()), Err(GetError::Broker(_))));
    }
}

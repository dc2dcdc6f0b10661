//! [`ListenerConsumer`]: the push-driven broker subscription that invokes an
//! application-registered [`MessageListener`].
//!
//! Grounded on `basic_consume_builder::{consumer_task_handler,
//! delivery_task_handler}`'s `tokio::select!` loop and ack/nack-on-result
//! branch, generalized from "spawn one task per delivery, unbounded
//! parallelism" to "one cooperative in-flight invocation at a time".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::abortable::Abortable;
use crate::broker::{Broker, Delivery, DeliverySubscription};
use crate::error::ListenerStopTimedOut;
use crate::session::{ConsumerTag, SessionHandle};
use crate::time_tracker::TimeTracker;

/// An application-registered callback invoked once per delivery.
/// Decoding the raw body into an application message is this listener's own
/// responsibility (out of scope); an `Err` return is treated exactly
/// like the source's "listener raises an exception" case (step 5): the
/// delivery is nacked and left for broker redelivery.
pub trait MessageListener: Send + Sync {
    /// Handle one delivery. Returning `Err` causes the delivery to be
    /// nacked rather than acknowledged.
    fn on_message(&self, delivery: &Delivery) -> Result<(), anyhow::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    InFlight,
    Stopped,
}

struct Inner {
    state: RunState,
}

/// Drives a single broker subscription on behalf of an installed
/// [`MessageListener`]. Created fresh by `Consumer::set_message_listener`
/// and torn down (orderly, then forced if needed) whenever the listener is
/// replaced or the consumer closes.
pub struct ListenerConsumer {
    self_ref: Weak<ListenerConsumer>,
    tag: ConsumerTag,
    queue_name: String,
    no_local: bool,
    broker: Arc<dyn Broker>,
    listener: Arc<dyn MessageListener>,
    session: Arc<dyn SessionHandle>,
    /// Mirrors the owning `Consumer`'s `closing` flag: a
    /// delivery arriving after `closing` is set is nacked unread.
    closing: Arc<AtomicBool>,
    inner: Mutex<Inner>,
    condvar: Condvar,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
    /// Bumped on every `start`; a running loop checks its own generation is
    /// still current so a caller that starts twice without an intervening
    /// stop cannot leave two loops racing on the same broker subscription.
    /// `Consumer`'s pause/resume state machine guarantees at most one
    /// outstanding `start` per cycle, so this is a safety net, not a
    /// supported re-entrant API.
    generation: AtomicU64,
}

impl ListenerConsumer {
    /// Construct a new, not-yet-subscribed listener consumer. Call
    /// [`Self::start`] (directly, or via an [`crate::abortable::AbortableSet`])
    /// to begin consuming.
    #[must_use]
    pub fn new(
        tag: ConsumerTag,
        queue_name: impl Into<String>,
        no_local: bool,
        broker: Arc<dyn Broker>,
        listener: Arc<dyn MessageListener>,
        session: Arc<dyn SessionHandle>,
        closing: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            tag,
            queue_name: queue_name.into(),
            no_local,
            broker,
            listener,
            session,
            closing,
            inner: Mutex::new(Inner { state: RunState::Stopped }),
            condvar: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// The consumer tag this listener subscribes with.
    #[must_use]
    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }

    fn start_subscription(&self) {
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stop_requested.store(false, Ordering::Release);

        let runtime = self.session.runtime().clone();
        let subscribe_result = runtime.block_on(self.broker.basic_consume(
            &self.queue_name,
            self.tag.as_str(),
            self.no_local,
            false,
        ));
        let subscription = match subscribe_result {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(tag = %self.tag, queue = %self.queue_name, error = %err, "listener subscribe failed");
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.state = RunState::Idle;
        }

        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        runtime.spawn(async move {
            this.run(my_generation, subscription).await;
        });
    }

    async fn run(self: Arc<Self>, my_generation: u64, mut subscription: Box<dyn DeliverySubscription>) {
        loop {
            if self.generation.load(Ordering::SeqCst) != my_generation {
                // Superseded by a newer `start`; the newer loop owns the
                // subscription teardown.
                return;
            }
            if self.stop_requested.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                () = self.notify.notified() => {
                    if self.stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                }
                next = subscription.next() => {
                    match next {
                        None => break,
                        Some(Err(err)) => {
                            warn!(tag = %self.tag, error = %err, "listener subscription error");
                            break;
                        }
                        Some(Ok(delivery)) => {
                            self.set_state(RunState::InFlight);
                            self.handle_delivery(delivery).await;
                            self.set_state(RunState::Idle);
                        }
                    }
                }
            }
        }

        if let Err(err) = self.broker.basic_cancel(self.tag.as_str()).await {
            warn!(tag = %self.tag, error = %err, "listener cancel failed");
        }
        if self.generation.load(Ordering::SeqCst) == my_generation {
            let mut inner = self.inner.lock();
            inner.state = RunState::Stopped;
            self.condvar.notify_all();
        }
    }

    fn set_state(&self, state: RunState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        self.condvar.notify_all();
    }

    /// Skip-and-nack while closing, otherwise invoke the
    /// listener and ack/nack based on its result.
    async fn handle_delivery(&self, delivery: Delivery) {
        if self.closing.load(Ordering::Acquire) {
            if let Err(err) = self.broker.basic_nack(delivery.envelope.delivery_tag, true).await {
                warn!(tag = %self.tag, error = %err, "nack of delivery arriving during close failed");
            }
            return;
        }

        match self.listener.on_message(&delivery) {
            Ok(()) => {
                if self.session.ack_mode().is_auto() {
                    if let Err(err) = self.broker.basic_ack(delivery.envelope.delivery_tag).await {
                        warn!(tag = %self.tag, error = %err, "ack of delivered message failed");
                    }
                } else {
                    self.session.register_unacked(&self.tag, &delivery);
                }
            }
            Err(err) => {
                warn!(tag = %self.tag, error = %err, "listener invocation failed, nacking delivery");
                if let Err(nack_err) = self.broker.basic_nack(delivery.envelope.delivery_tag, true).await {
                    warn!(tag = %self.tag, error = %nack_err, "nack after listener failure failed");
                }
            }
        }
    }

    /// Orderly stop: request the loop to exit, wait
    /// up to `timeout` for it to actually do so (which bounds any in-flight
    /// listener invocation), then return. If the wait elapses with the loop
    /// not yet stopped, the caller should follow up with [`Abortable::abort`].
    ///
    /// # Errors
    ///
    /// Returns [`ListenerStopTimedOut`] if `timeout` elapsed before the loop
    /// exited.
    pub fn graceful_stop(&self, timeout: Duration) -> Result<(), ListenerStopTimedOut> {
        self.stop_requested.store(true, Ordering::Release);
        self.notify.notify_one();

        let deadline = TimeTracker::from_duration(timeout);
        let mut inner = self.inner.lock();
        while inner.state != RunState::Stopped {
            match deadline.remaining() {
                None => self.condvar.wait(&mut inner),
                Some(remaining) => {
                    if remaining.is_zero() {
                        break;
                    }
                    let result = self.condvar.wait_for(&mut inner, remaining);
                    if result.timed_out() && deadline.timed_out() {
                        break;
                    }
                }
            }
        }

        if inner.state == RunState::Stopped {
            Ok(())
        } else {
            Err(ListenerStopTimedOut { timeout })
        }
    }
}

impl Abortable for ListenerConsumer {
    /// (Re)subscribe. A caller error to invoke while already started; see
    /// the `generation` field doc comment.
    fn start(&self) {
        self.start_subscription();
    }

    /// Request cooperative stop and cancel the subscription, without
    /// waiting for an in-flight listener invocation (used by `pause`, which
    /// has no listener-invocation timeout budget of its own).
    fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.notify.notify_one();
        let runtime = self.session.runtime().clone();
        let tag = self.tag.as_str().to_string();
        let broker = self.broker.clone();
        runtime.spawn(async move {
            let _ = broker.basic_cancel(&tag).await;
        });
    }

    /// Forced abort: cancel immediately and mark stopped regardless of any
    /// in-flight invocation's progress.
    fn abort(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.notify.notify_one();
        let runtime = self.session.runtime().clone();
        let tag = self.tag.as_str().to_string();
        let broker = self.broker.clone();
        runtime.spawn(async move {
            let _ = broker.basic_cancel(&tag).await;
        });
        let mut inner = self.inner.lock();
        inner.state = RunState::Stopped;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::config::AckMode;
    use crate::session::TestSession;
    use std::time::Duration;

    struct RecordingListener {
        calls: Mutex<Vec<Delivery>>,
        fail_next: AtomicBool,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
            })
        }
    }

    impl MessageListener for RecordingListener {
        fn on_message(&self, delivery: &Delivery) -> Result<(), anyhow::Error> {
            self.calls.lock().push(delivery.clone());
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(anyhow::anyhow!("forced failure"));
            }
            Ok(())
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn delivers_and_acks_under_auto_mode() {
        let runtime = rt();
        let broker = MockBroker::new();
        let session = TestSession::new(runtime.handle().clone(), AckMode::Auto);
        let listener = RecordingListener::new();
        let lc = ListenerConsumer::new(
            ConsumerTag::generate(),
            "q",
            false,
            broker.clone(),
            listener.clone(),
            session,
            Arc::new(AtomicBool::new(false)),
        );

        lc.start();
        std::thread::sleep(Duration::from_millis(50));
        broker.publish("q", bytes::Bytes::from_static(b"m1"));
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(listener.calls.lock().len(), 1);
        assert_eq!(broker.acked().len(), 1);

        lc.graceful_stop(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn client_ack_mode_registers_unacked() {
        let runtime = rt();
        let broker = MockBroker::new();
        let session = TestSession::new(runtime.handle().clone(), AckMode::Client);
        let listener = RecordingListener::new();
        let lc = ListenerConsumer::new(
            ConsumerTag::generate(),
            "q",
            false,
            broker.clone(),
            listener,
            session.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        lc.start();
        std::thread::sleep(Duration::from_millis(50));
        broker.publish("q", bytes::Bytes::from_static(b"m1"));
        std::thread::sleep(Duration::from_millis(100));

        assert!(broker.acked().is_empty());
        assert_eq!(session.registered().len(), 1);

        lc.graceful_stop(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn listener_failure_nacks_delivery() {
        let runtime = rt();
        let broker = MockBroker::new();
        let session = TestSession::new(runtime.handle().clone(), AckMode::Auto);
        let listener = RecordingListener::new();
        listener.fail_next.store(true, Ordering::SeqCst);
        let lc = ListenerConsumer::new(
            ConsumerTag::generate(),
            "q",
            false,
            broker.clone(),
            listener,
            session,
            Arc::new(AtomicBool::new(false)),
        );

        lc.start();
        std::thread::sleep(Duration::from_millis(50));
        broker.publish("q", bytes::Bytes::from_static(b"m1"));
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(broker.nacked().len(), 1);
        assert!(broker.acked().is_empty());

        lc.graceful_stop(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn stop_then_start_again_resumes_delivery() {
        let runtime = rt();
        let broker = MockBroker::new();
        let session = TestSession::new(runtime.handle().clone(), AckMode::Auto);
        let listener = RecordingListener::new();
        let lc = ListenerConsumer::new(
            ConsumerTag::generate(),
            "q",
            false,
            broker.clone(),
            listener.clone(),
            session,
            Arc::new(AtomicBool::new(false)),
        );

        lc.start();
        std::thread::sleep(Duration::from_millis(50));
        broker.publish("q", bytes::Bytes::from_static(b"m1"));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(listener.calls.lock().len(), 1);

        lc.graceful_stop(Duration::from_millis(500)).unwrap();

        // No delivery while stopped.
        broker.publish("q", bytes::Bytes::from_static(b"m2"));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(listener.calls.lock().len(), 1);

        lc.start();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(listener.calls.lock().len(), 2);

        lc.graceful_stop(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn closing_flag_causes_nack_without_listener_invocation() {
        let runtime = rt();
        let broker = MockBroker::new();
        let session = TestSession::new(runtime.handle().clone(), AckMode::Auto);
        let listener = RecordingListener::new();
        let closing = Arc::new(AtomicBool::new(true));
        let lc = ListenerConsumer::new(
            ConsumerTag::generate(),
            "q",
            false,
            broker.clone(),
            listener.clone(),
            session,
            closing,
        );

        lc.start();
        std::thread::sleep(Duration::from_millis(50));
        broker.publish("q", bytes::Bytes::from_static(b"m1"));
        std::thread::sleep(Duration::from_millis(100));

        assert!(listener.calls.lock().is_empty());
        assert_eq!(broker.nacked().len(), 1);

        lc.graceful_stop(Duration::from_millis(500)).unwrap();
    }
}

//! [`Consumer`]: the state machine tying `ReceiveGate`, `ReceiveBuffer`,
//! `ListenerConsumer` and `AbortableSet` together.
//!
//! Grounded on `mzndr-hare::client::Client<S>` as the orchestrating type
//! that owns a registry of long-lived subscriptions and exposes
//! builder-constructed operations over them; the atomic `closing`/`closed`
//! flags and the mutex-guarded listener slot are the idiomatic Rust
//! rendition of a source with monotonic booleans and an install-if-empty
//! compare-and-swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::abortable::{Abortable, AbortableSet};
use crate::broker::{Broker, Delivery};
use crate::config::ConsumerConfig;
use crate::destination::Destination;
use crate::error::{ConsumerError, GetError};
use crate::listener_consumer::{ListenerConsumer, MessageListener};
use crate::receive_buffer::ReceiveBuffer;
use crate::receive_gate::ReceiveGate;
use crate::session::{ConsumerTag, SessionHandle};
use crate::time_tracker::TimeTracker;

/// One installed listener and the subscription currently driving it.
type ListenerSlot = Option<(Arc<dyn MessageListener>, Arc<ListenerConsumer>)>;

/// A single consumer attached to a [`Destination`]. Owns the
/// synchronous receive path (gate + buffer) and, optionally, a push
/// listener subscription; mediates both against connection-level
/// `pause`/`resume`/`close`.
pub struct Consumer {
    session: Arc<dyn SessionHandle>,
    broker: Arc<dyn Broker>,
    destination: Destination,
    tag: ConsumerTag,
    durable: bool,
    no_local: bool,
    config: ConsumerConfig,

    gate: ReceiveGate,
    buffer: Arc<ReceiveBuffer>,
    abortables: AbortableSet,

    /// `true` between `resume()` and the next `pause()`/`close()`; governs
    /// whether a freshly installed listener is started immediately.
    active: AtomicBool,
    /// Monotonic, set once before teardown begins.
    closing: Arc<AtomicBool>,
    /// Monotonic, set once teardown completes.
    closed: AtomicBool,
    /// Serializes `internal_close` so concurrent callers observe a single
    /// teardown run to completion before returning (Idempotence: `close()`
    /// called N times has the same effect as once).
    close_lock: Mutex<()>,

    listener_slot: Mutex<ListenerSlot>,
}

impl Consumer {
    /// Construct a consumer attached to `destination`.
    /// `durable`/`no_local` and the ack mode are session-owned settings,
    /// already folded into `config`/`session` by the caller before first
    /// use.
    #[must_use]
    pub fn new(
        session: Arc<dyn SessionHandle>,
        broker: Arc<dyn Broker>,
        destination: Destination,
        tag: ConsumerTag,
        config: ConsumerConfig,
        initially_paused: bool,
    ) -> Arc<Self> {
        let runtime = session.runtime().clone();
        let buffer = ReceiveBuffer::new(
            broker.clone(),
            destination.queue_name().to_string(),
            config.no_local,
            config.batching_size,
            runtime,
        );
        let abortables = AbortableSet::new();
        abortables.add(buffer.clone() as Arc<dyn Abortable>);

        Arc::new(Self {
            session,
            broker,
            durable: config.durable,
            no_local: config.no_local,
            destination,
            tag,
            gate: ReceiveGate::new(!initially_paused),
            buffer,
            abortables,
            active: AtomicBool::new(!initially_paused),
            closing: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
            config,
            listener_slot: Mutex::new(None),
        })
    }

    /// The destination this consumer reads from.
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// This consumer's stable tag.
    #[must_use]
    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }

    /// Whether the destination is consumed durably.
    #[must_use]
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Whether the subscription excludes same-connection publishes.
    #[must_use]
    pub fn no_local(&self) -> bool {
        self.no_local
    }

    /// `true` once `internal_close` has fully completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_closing_or_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire)
    }

    /// Block indefinitely until a message is available, the consumer is
    /// closed, or the gate is aborted. Equivalent to `receive_timeout(0)`
    /// under the messaging-standard's zero-means-infinite convention for
    /// the public timeout APIs.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::IllegalState`] if the consumer is
    /// closing/closed; otherwise only structural broker errors propagate.
    pub fn receive(&self) -> Result<Option<Delivery>, ConsumerError> {
        self.receive_with_deadline(TimeTracker::infinite())
    }

    /// Block until a message is available or `timeout` elapses. A zero
    /// `timeout` means "wait indefinitely" (messaging-standard convention,
    /// distinct from [`Self::receive_no_wait`]).
    ///
    /// # Errors
    ///
    /// See [`Self::receive`].
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Delivery>, ConsumerError> {
        if timeout.is_zero() {
            self.receive_with_deadline(TimeTracker::infinite())
        } else {
            self.receive_with_deadline(TimeTracker::from_duration(timeout))
        }
    }

    /// Return a message if one is immediately available (buffered, or via
    /// a single non-blocking broker fetch), else `None`. Never blocks.
    ///
    /// # Errors
    ///
    /// See [`Self::receive`].
    pub fn receive_no_wait(&self) -> Result<Option<Delivery>, ConsumerError> {
        self.receive_with_deadline(TimeTracker::zero())
    }

    fn receive_with_deadline(&self, deadline: TimeTracker) -> Result<Option<Delivery>, ConsumerError> {
        if self.is_closing_or_closed() {
            return Err(ConsumerError::IllegalState(
                "receive called on a closing/closed consumer".into(),
            ));
        }

        let entered = match self.gate.enter(deadline) {
            Ok(entered) => entered,
            // Internal control-flow signal: translated to `None`, never
            // surfaced to the application.
            Err(_aborted) => return Ok(None),
        };
        if !entered {
            return Ok(None);
        }
        let _gate_guard = GateGuard { gate: &self.gate };

        let delivery = match self.buffer.get(deadline) {
            Ok(delivery) => delivery,
            Err(GetError::Aborted(_)) => return Ok(None),
            Err(GetError::Broker(err)) => return Err(ConsumerError::Broker(err)),
        };
        let Some(delivery) = delivery else {
            return Ok(None);
        };

        if self.session.ack_mode().is_auto() {
            let ack_result = self
                .session
                .runtime()
                .block_on(self.broker.basic_ack(delivery.envelope.delivery_tag));
            if let Err(err) = ack_result {
                warn!(tag = %self.tag, error = %err, "failed to ack synchronously received message");
            }
        } else {
            self.session.register_unacked(&self.tag, &delivery);
        }

        Ok(Some(delivery))
    }

    /// Atomic replace. A no-op if `listener` is
    /// the currently installed one (`Arc::ptr_eq`) or if both are `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::IllegalState`] if the consumer is closed.
    pub fn set_message_listener(
        &self,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<(), ConsumerError> {
        if self.is_closed() {
            return Err(ConsumerError::IllegalState(
                "set_message_listener called on a closed consumer".into(),
            ));
        }

        let mut slot = self.listener_slot.lock();
        match (&*slot, &listener) {
            (Some((current, _)), Some(new)) if Arc::ptr_eq(current, new) => return Ok(()),
            (None, None) => return Ok(()),
            _ => {}
        }

        if let Some((_, old_lc)) = slot.take() {
            let member: Arc<dyn Abortable> = old_lc.clone();
            self.abortables.remove(&member);
            self.teardown_listener_consumer(&old_lc);
        }

        if let Some(new_listener) = listener {
            let lc = ListenerConsumer::new(
                ConsumerTag::generate(),
                self.destination.queue_name().to_string(),
                self.no_local,
                self.broker.clone(),
                new_listener.clone(),
                self.session.clone(),
                self.closing.clone(),
            );
            self.abortables.add(lc.clone() as Arc<dyn Abortable>);
            if self.active.load(Ordering::Acquire) {
                lc.start();
            }
            *slot = Some((new_listener, lc));
        }

        Ok(())
    }

    fn teardown_listener_consumer(&self, lc: &Arc<ListenerConsumer>) {
        if let Err(timed_out) = lc.graceful_stop(self.config.listener_termination_timeout) {
            warn!(tag = %lc.tag(), %timed_out, "listener did not stop in time, forcing abort");
            lc.abort();
        }
    }

    /// Close the gate, wait up to `stop_timeout` for in-flight receivers to
    /// exit, then cancel (not abort) every abortable. Used on connection
    /// `stop`.
    pub fn pause(&self) {
        self.active.store(false, Ordering::Release);
        self.gate.close();
        self.gate.wait_to_clear(TimeTracker::from_duration(self.config.stop_timeout));
        self.abortables.stop();
    }

    /// Start every abortable (re-subscribing the listener consumer, if
    /// installed), then reopen the gate. Used on connection `start`.
    pub fn resume(&self) {
        self.abortables.start();
        self.active.store(true, Ordering::Release);
        self.gate.open();
    }

    /// Delegate to the session, which drops this consumer from its
    /// registry, then tear down locally.
    pub fn close(&self) {
        self.internal_close();
        self.session.remove_consumer(&self.tag);
    }

    /// Idempotent teardown: close and drain the
    /// gate, stop the listener consumer (orderly, then forced), abort
    /// every remaining abortable, and set `closed`.
    pub fn internal_close(&self) {
        let _guard = self.close_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.closing.store(true, Ordering::Release);

        self.gate.close();
        self.gate.abort_waiters();

        if let Some((_, lc)) = self.listener_slot.lock().take() {
            let member: Arc<dyn Abortable> = lc.clone();
            self.abortables.remove(&member);
            self.teardown_listener_consumer(&lc);
        }

        self.abortables.abort();

        self.closed.store(true, Ordering::Release);
        self.closing.store(false, Ordering::Release);
    }
}

/// Guarantees `ReceiveGate::exit` runs on every return path out of
/// `receive_with_deadline`, including an unexpected panic from the ack
/// call.
struct GateGuard<'a> {
    gate: &'a ReceiveGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

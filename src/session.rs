//! [`SessionHandle`]: the narrow callback surface the `Consumer` calls back
//! into.
//!
//! Acknowledgement bookkeeping, transaction coordination, and channel
//! multiplexing are external collaborators; this trait only names the
//! handful of operations the core genuinely needs from its owning session,
//! breaking the Consumer↔Session cycle the source exhibits by making the
//! session the *owner* (it holds the consumer registry) and the consumer
//! hold only a non-owning reference back.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::broker::Delivery;
use crate::config::AckMode;

/// A stable identifier for a consumer's broker subscription:
/// `"jms-consumer-" + uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// Generate a new, unique tag.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("jms-consumer-{}", uuid::Uuid::new_v4()))
    }

    /// The tag's string form, as used for both the AMQP consumer tag and
    /// (for topic destinations) the private queue name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The callback surface a `Consumer` needs from its owning session.
pub trait SessionHandle: Send + Sync {
    /// The acknowledgement mode this session was created with; governs
    /// whether the core acks immediately after delivery or defers to the
    /// application/session.
    fn ack_mode(&self) -> AckMode;

    /// Register a message delivered under client-ack or transacted mode
    /// for later acknowledgement. The core calls this instead of acking
    /// itself whenever `ack_mode().is_auto()` is `false`.
    fn register_unacked(&self, tag: &ConsumerTag, delivery: &Delivery);

    /// The runtime used to spawn `ListenerConsumer` tasks and to
    /// `block_on` individual broker RPCs from the otherwise-synchronous
    /// gate/buffer code.
    fn runtime(&self) -> &Handle;

    /// Called exactly once, from `internalClose`, so the session can drop
    /// its registry entry for this consumer.
    fn remove_consumer(&self, tag: &ConsumerTag);
}

/// Reference [`SessionHandle`] used by this crate's own tests: acks
/// immediately (mode is fixed at construction), records unacked
/// registrations and removed consumers for assertions.
pub struct TestSession {
    ack_mode: AckMode,
    runtime: Handle,
    registered: parking_lot::Mutex<Vec<(ConsumerTag, Delivery)>>,
    removed: parking_lot::Mutex<Vec<ConsumerTag>>,
}

impl TestSession {
    /// Build a test session bound to the given runtime handle and ack
    /// mode.
    #[must_use]
    pub fn new(runtime: Handle, ack_mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            ack_mode,
            runtime,
            registered: parking_lot::Mutex::new(Vec::new()),
            removed: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Deliveries registered for later ack, for test assertions.
    #[must_use]
    pub fn registered(&self) -> Vec<(ConsumerTag, Delivery)> {
        self.registered.lock().clone()
    }

    /// Consumer tags removed via `remove_consumer`, for test assertions.
    #[must_use]
    pub fn removed(&self) -> Vec<ConsumerTag> {
        self.removed.lock().clone()
    }
}

impl SessionHandle for TestSession {
    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    fn register_unacked(&self, tag: &ConsumerTag, delivery: &Delivery) {
        self.registered.lock().push((tag.clone(), delivery.clone()));
    }

    fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn remove_consumer(&self, tag: &ConsumerTag) {
        self.removed.lock().push(tag.clone());
    }
}

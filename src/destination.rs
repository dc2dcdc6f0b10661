//! [`Destination`]: the thin address type the core treats a consumer as
//! attached to.
//!
//! Destination naming and address parsing proper are an external
//! collaborator; this type only carries the three fields the core actually
//! reads.

/// A destination a consumer reads from: either a point-to-point queue, or a
/// topic for which the core allocates a private per-consumer queue.
#[derive(Debug, Clone)]
pub struct Destination {
    is_queue: bool,
    physical_name: String,
    per_consumer_name: String,
}

impl Destination {
    /// A point-to-point queue destination.
    #[must_use]
    pub fn queue(physical_name: impl Into<String>) -> Self {
        Self {
            is_queue: true,
            physical_name: physical_name.into(),
            per_consumer_name: String::new(),
        }
    }

    /// A topic destination. `per_consumer_name` is the private queue the
    /// session has already bound to the topic for this consumer.
    #[must_use]
    pub fn topic(per_consumer_name: impl Into<String>) -> Self {
        Self {
            is_queue: false,
            physical_name: String::new(),
            per_consumer_name: per_consumer_name.into(),
        }
    }

    /// `true` for point-to-point queues, `false` for topic-shaped
    /// destinations.
    #[must_use]
    pub fn is_queue(&self) -> bool {
        self.is_queue
    }

    /// The queue name to issue broker calls against: the destination's
    /// physical name if queue-shaped, else the per-consumer private queue
    /// name.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        if self.is_queue {
            &self.physical_name
        } else {
            &self.per_consumer_name
        }
    }
}

//! [`AbortableSet`] definition and implementation: a concurrency-safe bag of
//! lifecycle-bearing members broadcasting `start`/`stop`/`abort`.

use std::sync::Arc;

use parking_lot::Mutex;

/// Something the consumer can broadcast lifecycle events to uniformly: a
/// `ListenerConsumer`, a `ReceiveBuffer`'s in-flight subscription, or any
/// other broker interaction that needs to be quiesced on `pause` and torn
/// down on `close`.
pub trait Abortable: Send + Sync {
    /// Resume broker interaction (e.g. re-subscribe).
    fn start(&self);
    /// Cancel the underlying broker subscription, but leave any parked
    /// waiters alone; they will simply see no further deliveries.
    fn stop(&self);
    /// Cancel the underlying broker subscription and wake every parked
    /// waiter so it returns immediately.
    fn abort(&self);
}

/// Per-action re-entrancy guard: a nested broadcast of the same action
/// while one is already executing on this bag is a no-op.
#[derive(Default)]
struct InProgress {
    start: bool,
    stop: bool,
    abort: bool,
}

/// Registry of [`Abortable`] members, broadcasting lifecycle events to all
/// of them at once.
#[derive(Default)]
pub struct AbortableSet {
    members: Mutex<Vec<Arc<dyn Abortable>>>,
    in_progress: Mutex<InProgress>,
}

impl AbortableSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new member. No lifecycle event is replayed onto it; the
    /// caller is responsible for bringing it up to date (e.g. by calling
    /// `start()` on it directly) if the set is currently in the started
    /// state.
    pub fn add(&self, member: Arc<dyn Abortable>) {
        self.members.lock().push(member);
    }

    /// Remove a member that has self-completed (e.g. a one-shot
    /// subscription that ran to exhaustion on its own).
    pub fn remove(&self, member: &Arc<dyn Abortable>) {
        self.members
            .lock()
            .retain(|m| !Arc::ptr_eq(m, member));
    }

    /// Broadcast `start` to every member.
    pub fn start(&self) {
        {
            let mut in_progress = self.in_progress.lock();
            if in_progress.start {
                return;
            }
            in_progress.start = true;
        }
        for member in self.members.lock().iter() {
            member.start();
        }
        self.in_progress.lock().start = false;
    }

    /// Broadcast `stop` to every member.
    pub fn stop(&self) {
        {
            let mut in_progress = self.in_progress.lock();
            if in_progress.stop {
                return;
            }
            in_progress.stop = true;
        }
        for member in self.members.lock().iter() {
            member.stop();
        }
        self.in_progress.lock().stop = false;
    }

    /// Broadcast `abort` to every member.
    pub fn abort(&self) {
        {
            let mut in_progress = self.in_progress.lock();
            if in_progress.abort {
                return;
            }
            in_progress.abort = true;
        }
        for member in self.members.lock().iter() {
            member.abort();
        }
        self.in_progress.lock().abort = false;
    }

    /// Number of currently registered members, for tests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// `true` if no members are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

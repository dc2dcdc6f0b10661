//! [`ReceiveGate`] definition and implementation: the admission gate on the
//! synchronous receive path.

use parking_lot::{Condvar, Mutex};

use crate::error::Aborted;
use crate::time_tracker::TimeTracker;

/// The gate's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closed,
    Aborted,
}

struct Inner {
    state: State,
    occupancy: u64,
}

/// Counts concurrent occupants of the synchronous receive path and gates
/// entry on the connection's started/stopped state.
///
/// `enter`/`exit` bracket every synchronous broker interaction; `pause`
/// closes the gate and waits for occupants to leave, `internalClose` aborts
/// any waiter currently parked in `enter`.
pub struct ReceiveGate {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl ReceiveGate {
    /// Create a gate in the given initial state (`open` mirrors the
    /// consumer's `initiallyPaused` flag: `false` means start OPEN).
    #[must_use]
    pub fn new(open: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: if open { State::Open } else { State::Closed },
                occupancy: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Block while CLOSED until OPEN (enter and return `Ok(true)`), the
    /// deadline expires (`Ok(false)`), or the gate is ABORTED
    /// (`Err(Aborted)`).
    ///
    /// # Errors
    ///
    /// Returns [`Aborted`] if the gate was aborted while waiting or is
    /// already aborted.
    pub fn enter(&self, deadline: TimeTracker) -> Result<bool, Aborted> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                State::Aborted => return Err(Aborted),
                State::Open => {
                    inner.occupancy += 1;
                    return Ok(true);
                }
                State::Closed => {
                    if deadline.is_zero() {
                        return Ok(false);
                    }
                    match deadline.remaining() {
                        None => self.condvar.wait(&mut inner),
                        Some(remaining) => {
                            let timed_out = self.condvar.wait_for(&mut inner, remaining).timed_out();
                            if timed_out && deadline.timed_out() {
                                return Ok(false);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Leave the gate. Panics (programming error) if called
    /// without a matching `enter`.
    pub fn exit(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.occupancy > 0, "ReceiveGate::exit without matching enter");
        inner.occupancy -= 1;
        if inner.occupancy == 0 {
            self.condvar.notify_all();
        }
    }

    /// Open the gate and wake all waiters so they can enter.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Open;
        self.condvar.notify_all();
    }

    /// Close the gate. New entrants block; existing occupants are
    /// unaffected.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
    }

    /// Abort the gate for its current generation: wake all waiters so each
    /// returns `Err(Aborted)`. Reopening via [`Self::open`] clears the
    /// abort.
    pub fn abort_waiters(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Aborted;
        self.condvar.notify_all();
    }

    /// Block until occupancy reaches zero or `deadline` expires. Returns
    /// `true` if occupancy reached zero.
    pub fn wait_to_clear(&self, deadline: TimeTracker) -> bool {
        let mut inner = self.inner.lock();
        while inner.occupancy > 0 {
            if deadline.is_zero() {
                return false;
            }
            match deadline.remaining() {
                None => self.condvar.wait(&mut inner),
                Some(remaining) => {
                    let result = self.condvar.wait_for(&mut inner, remaining);
                    if result.timed_out() && deadline.timed_out() && inner.occupancy > 0 {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Current occupancy, for tests/diagnostics.
    #[must_use]
    pub fn occupancy(&self) -> u64 {
        self.inner.lock().occupancy
    }
}

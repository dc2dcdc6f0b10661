//! Error taxonomy for the consumer core.
//!
//! Internal control-flow signals ([`Aborted`]) never escape the public API;
//! they are translated to `None` at the `Consumer` boundary. Structural
//! broker failures propagate instead, surfaced as [`ConsumerError::Broker`].

use std::time::Duration;

/// A blocking wait was terminated by connection/consumer shutdown.
/// Crate-internal signal, never returned from a public API: `Consumer`
/// translates it to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the receive gate was aborted")]
pub struct Aborted;

/// Errors surfaced by the public `Consumer` API.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Operation invoked on a closed/closing consumer, or a losing
    /// `setMessageListener` install race.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Underlying broker-client failure on the synchronous receive path.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Outcome of a single [`crate::receive_buffer::ReceiveBuffer::get`] call:
/// distinguishes a buffer abort (translated to `None` by the caller) from a
/// genuine broker failure (propagated to the application as
/// [`ConsumerError::Broker`]).
#[derive(Debug, thiserror::Error)]
pub enum GetError {
    /// The buffer was aborted while waiting or fetching.
    #[error(transparent)]
    Aborted(#[from] Aborted),

    /// The broker call itself failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from the [`crate::broker::Broker`] capability.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The underlying broker client (e.g. `lapin`) reported an I/O or
    /// protocol failure.
    #[error("broker I/O failure: {0}")]
    Io(#[source] anyhow::Error),

    /// A subscription could not be cancelled (e.g. because it was already
    /// gone); logged, never fatal.
    #[error("cancel failed for consumer tag {tag}: {source}")]
    CancelFailed {
        /// The consumer tag that could not be cancelled.
        tag: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

/// A message could not be acknowledged or negatively acknowledged; always
/// logged, never propagated to the application.
#[derive(Debug, thiserror::Error)]
#[error("failed to {action} delivery {delivery_tag}: {source}")]
pub struct AckError {
    /// `"ack"` or `"nack"`, for log messages.
    pub action: &'static str,
    /// The delivery tag that could not be (n)acked.
    pub delivery_tag: u64,
    /// The underlying broker error.
    #[source]
    pub source: anyhow::Error,
}

/// The connection's listener-termination timeout was exceeded while
/// waiting for an in-flight listener invocation to return during an
/// orderly stop. Not an error condition per se (the caller proceeds to a
/// forced abort); kept as a typed value so callers can log it uniformly.
#[derive(Debug, Clone, Copy)]
pub struct ListenerStopTimedOut {
    /// The timeout that was exceeded.
    pub timeout: Duration,
}

impl std::fmt::Display for ListenerStopTimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "listener did not return within {:?}, forcing abort",
            self.timeout
        )
    }
}

//! [`ConsumerConfig`] and [`AckMode`]: the tunables otherwise left as named
//! constants or "from connection config" values.

use std::time::Duration;

use serde::Deserialize;

/// Acknowledgement modes recognized from the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Core acks immediately after delivery.
    Auto,
    /// Behaves identically to `Auto` at this layer.
    DupsOk,
    /// Application acks the message explicitly.
    Client,
    /// Session commit acks all messages received in the transaction.
    Transacted,
}

impl AckMode {
    /// `true` for the two modes where the core itself acknowledges the
    /// message immediately after a successful delivery.
    #[must_use]
    pub fn is_auto(self) -> bool {
        matches!(self, Self::Auto | Self::DupsOk)
    }
}

/// Per-consumer tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum number of pre-fetched undelivered messages the
    /// `ReceiveBuffer` holds before its subscription auto-cancels.
    /// Default 5.
    #[serde(default = "default_batching_size")]
    pub batching_size: usize,

    /// How long `pause()` waits for in-flight receivers to exit the gate
    /// before stopping abortables regardless. Default 1s.
    #[serde(default = "default_stop_timeout", with = "duration_millis")]
    pub stop_timeout: Duration,

    /// How long an orderly `ListenerConsumer` stop waits for an in-flight
    /// listener invocation to return before forcing an abort.
    /// Sourced from the connection; there is no
    /// crate-wide default, so callers must supply one explicitly.
    #[serde(with = "duration_millis")]
    pub listener_termination_timeout: Duration,

    /// Whether the destination is consumed durably. Set by the session
    /// before first use.
    #[serde(default)]
    pub durable: bool,

    /// Whether the subscription excludes messages published on the same
    /// connection. Set by the session before first use.
    #[serde(default)]
    pub no_local: bool,
}

fn default_batching_size() -> usize {
    5
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(1)
}

impl ConsumerConfig {
    /// Construct a config with every default and an explicit
    /// listener-termination timeout (no crate-wide default exists for it).
    #[must_use]
    pub fn new(listener_termination_timeout: Duration) -> Self {
        Self {
            batching_size: default_batching_size(),
            stop_timeout: default_stop_timeout(),
            listener_termination_timeout,
            durable: false,
            no_local: false,
        }
    }

    /// Builder-style override of the batching size.
    #[must_use]
    pub fn with_batching_size(mut self, batching_size: usize) -> Self {
        self.batching_size = batching_size;
        self
    }

    /// Builder-style override of the stop timeout.
    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Builder-style override of `durable`/`no_local`, set by the session
    /// before the consumer's first use.
    #[must_use]
    pub fn with_flags(mut self, durable: bool, no_local: bool) -> Self {
        self.durable = durable;
        self.no_local = no_local;
        self
    }
}

/// `serde` helper: (de)serialize a [`Duration`] as milliseconds, since the
/// messaging standard and the connection config both express timeouts that
/// way.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

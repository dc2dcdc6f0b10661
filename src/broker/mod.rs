//! The `Broker` capability trait.
//!
//! This is the external collaborator: the wire-level broker
//! client. The crate depends on `lapin` and ships [`lapin_broker::LapinBroker`]
//! as the concrete implementation, but every other module in this crate is
//! written against the trait so that `broker::mock::MockBroker` can stand in
//! for scenario tests without a running RabbitMQ.

pub mod lapin_broker;

/// Available during the crate's own unit tests, and to the `tests/`
/// integration suite when built with `--features test-util`.
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BrokerError;

/// Delivery tag and redelivery flag for one broker response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Broker-assigned monotonic identifier, used for targeted ack/nack.
    pub delivery_tag: u64,
    /// Whether the broker has attempted to deliver this message before.
    pub redelivered: bool,
}

/// One message handed back by the broker, either via `basicGet` or a
/// consumer subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Tag/redelivery metadata.
    pub envelope: Envelope,
    /// Raw message bytes. Decoding into an application message is an
    /// external collaborator, out of scope for this crate.
    pub body: Bytes,
}

/// A live subscription created by [`Broker::basic_consume`]: a pull
/// interface over what is, at the wire level, a push subscription. Callers
/// poll `next()`; `None` means the subscription has been cancelled
/// (explicitly, or because the broker closed it).
#[async_trait]
pub trait DeliverySubscription: Send {
    /// Await the next delivery, or `None` once the subscription ends.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// The consumer tag this subscription was created with.
    fn tag(&self) -> &str;
}

/// The broker capabilities this core consumes. Every method maps
/// directly onto one AMQP `basic.*` method.
#[async_trait]
pub trait Broker: Send + Sync {
    /// `basicGet(queue, autoAck) -> response|null`: a single non-blocking
    /// fetch.
    async fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, BrokerError>;

    /// `basicConsume(queue, autoAck, tag, noLocal, exclusive, args, callback)
    /// -> consumerTag`. `exclusive` and `args` are always `false`/empty per
    /// this crate's Non-goals (no exclusive consumption, no custom
    /// subscription arguments); `no_local` is the only caller-supplied
    /// option.
    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        no_local: bool,
        auto_ack: bool,
    ) -> Result<Box<dyn DeliverySubscription>, BrokerError>;

    /// `basicAck(deliveryTag)`.
    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// `basicNack(deliveryTag, requeue)`.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// `basicCancel(consumerTag)`.
    async fn basic_cancel(&self, tag: &str) -> Result<(), BrokerError>;
}

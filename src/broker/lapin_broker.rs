//! [`LapinBroker`]: the `lapin`-backed implementation of [`super::Broker`].

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;

use super::{Broker, Delivery, DeliverySubscription, Envelope};
use crate::error::BrokerError;

/// Wraps a single `lapin::Channel`. Channel sharing/pooling across
/// consumers is the session layer's responsibility; this type just issues
/// the AMQP calls the core needs on whichever channel it is handed.
#[derive(Clone)]
pub struct LapinBroker {
    channel: Channel,
}

impl LapinBroker {
    /// Wrap an already-open channel.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

fn to_broker_io_error(err: lapin::Error) -> BrokerError {
    BrokerError::Io(err.into())
}

#[async_trait]
impl Broker for LapinBroker {
    async fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, BrokerError> {
        let opts = BasicGetOptions { no_ack: auto_ack };
        let maybe_message = self
            .channel
            .basic_get(queue, opts)
            .await
            .map_err(to_broker_io_error)?;
        Ok(maybe_message.map(|message| Delivery {
            envelope: Envelope {
                delivery_tag: message.delivery.delivery_tag,
                redelivered: message.delivery.redelivered,
            },
            body: message.delivery.data.into(),
        }))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        no_local: bool,
        auto_ack: bool,
    ) -> Result<Box<dyn DeliverySubscription>, BrokerError> {
        let opts = BasicConsumeOptions {
            no_local,
            no_ack: auto_ack,
            exclusive: false,
            nowait: false,
        };
        let consumer = self
            .channel
            .basic_consume(queue, tag, opts, FieldTable::default())
            .await
            .map_err(to_broker_io_error)?;
        Ok(Box::new(LapinSubscription {
            tag: tag.to_string(),
            consumer,
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(to_broker_io_error)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { requeue, multiple: false })
            .await
            .map_err(to_broker_io_error)
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
            .map_err(|err| BrokerError::CancelFailed {
                tag: tag.to_string(),
                source: err.into(),
            })
    }
}

/// [`DeliverySubscription`] over a live `lapin::Consumer` stream.
struct LapinSubscription {
    tag: String,
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliverySubscription for LapinSubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let delivery_result = self.consumer.next().await?;
        Some(delivery_result.map(|delivery| Delivery {
            envelope: Envelope {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
            },
            body: delivery.data.into(),
        }).map_err(to_broker_io_error))
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

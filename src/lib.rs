//! A message-consumer concurrency core: adapts a broker-native push-delivery
//! model (`lapin`/AMQP-0-9-1) to the dual synchronous/asynchronous consumer
//! API a messaging-standard client exposes.
#![forbid(unsafe_code)]
#![deny(nonstandard_style)]
#![warn(
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::pedantic,
    clippy::unwrap_used
)]
#![allow(clippy::unused_async)]

pub mod abortable;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod listener_consumer;
pub mod receive_buffer;
pub mod receive_gate;
pub mod session;
pub mod time_tracker;

pub use abortable::{Abortable, AbortableSet};
pub use broker::{Broker, Delivery, DeliverySubscription, Envelope};
pub use config::{AckMode, ConsumerConfig};
pub use consumer::Consumer;
pub use destination::Destination;
pub use error::{AckError, ConsumerError, GetError, ListenerStopTimedOut};
pub use listener_consumer::{ListenerConsumer, MessageListener};
pub use lapin;
pub use receive_buffer::ReceiveBuffer;
pub use receive_gate::ReceiveGate;
pub use session::{ConsumerTag, SessionHandle};
pub use time_tracker::TimeTracker;

//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
mod factory;
pub mod memory;
pub mod rabbit_mq;
pub mod session;
pub mod transport;

pub use factory::ConnectionFactory;
pub use transport::{
    ConnectionEvent, DeliveryStream, PublishOutcome, ReturnedMessage, Transport,
    TransportChannel, TransportConnection,
};

pub use lapin::{options, types, BasicProperties};

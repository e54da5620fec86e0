use crate::amqp::session::{BindingOptions, ConsumerOptions, Exchange, Queue};
use crate::consumers::Delivery;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Deliveries pushed by the broker for one subscription.
///
/// The stream ends when the subscription is cancelled, its channel is closed or the
/// connection is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Asynchronous notifications emitted by a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was closed by the broker or the network, not by us.
    Closed(String),
    /// The broker applies back-pressure: publishing is suspended.
    Blocked(String),
    Unblocked,
}

/// What the broker told us about a publishing.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Written to the socket; the channel is not in confirm mode.
    Sent,
    Acked,
    Nacked,
    /// The broker could not route the message and sent it back.
    Returned(ReturnedMessage),
}

/// A mandatory message the broker could not route to any queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub data: Vec<u8>,
}

impl From<lapin::message::BasicReturnMessage> for ReturnedMessage {
    fn from(value: lapin::message::BasicReturnMessage) -> Self {
        Self {
            exchange: value.delivery.exchange.as_str().to_owned(),
            routing_key: value.delivery.routing_key.as_str().to_owned(),
            reply_code: value.reply_code,
            reply_text: value.reply_text.as_str().to_owned(),
            data: value.delivery.data,
        }
    }
}

/// `Transport` dials physical connections to a broker.
///
/// [`ConnectionFactory`](crate::amqp::ConnectionFactory) implements it on top of `lapin`,
/// [`MemoryBroker`](crate::amqp::memory::MemoryBroker) implements it in-process.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new physical connection.
    ///
    /// Fails if the broker is unreachable or rejects our credentials.
    async fn connect(&self) -> Result<Box<dyn TransportConnection>, anyhow::Error>;
}

/// One physical connection to the broker.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    /// Open a new multiplexed channel.
    async fn open_channel(
        &self,
        publisher_confirms: bool,
    ) -> Result<Arc<dyn TransportChannel>, anyhow::Error>;

    /// Take the notification stream of this connection.
    ///
    /// Returns `None` if it has already been taken.
    fn events(&self) -> Option<UnboundedReceiver<ConnectionEvent>>;

    fn is_closed(&self) -> bool;

    /// Close the connection on purpose. No [`ConnectionEvent::Closed`] is emitted.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// One multiplexed session on a connection.
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), anyhow::Error>;

    async fn declare_queue(&self, queue: &Queue) -> Result<(), anyhow::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingOptions,
    ) -> Result<(), anyhow::Error>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome, anyhow::Error>;

    /// Limit the number of unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
    ) -> Result<DeliveryStream, anyhow::Error>;

    /// Cancel the subscription identified by `consumer_tag`, ending its delivery stream.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;

    fn is_open(&self) -> bool;
}

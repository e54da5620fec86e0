//! Callbacks a [`Consumer`](crate::consumers::Consumer) hands to the pool.
use crate::consumers::Delivery;
use std::future::Future;

/// Implementers of `DeliveryHandler` process the messages a consumer receives, one at a time.
///
/// Acknowledging the delivery is up to the handler (see [`Delivery::ack`]), unless the
/// subscription uses `auto_ack`.
///
/// # Implementers
///
/// While you can implement `DeliveryHandler` for a struct or enum, most of the time you will be
/// relying on the implementation for async functions and closures with a matching signature:
/// `Fn(Delivery) -> Fut`, where `Fut` resolves to `()`.
#[async_trait::async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);
}

#[async_trait::async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, delivery: Delivery) {
        (self)(delivery).await
    }
}

/// The broker dropped a connection we did not close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosed {
    pub connection_id: u64,
    /// The error reported by the broker or the network.
    pub reason: String,
}

/// Invoked when the connection serving a consumer is lost.
///
/// Handlers run on the task watching the connection, before the pool tears the connection down:
/// anything long-running should be spawned.
pub trait CloseHandler: Send + Sync + 'static {
    fn on_close(&self, event: &ConnectionClosed);
}

impl<F> CloseHandler for F
where
    F: Fn(&ConnectionClosed) + Send + Sync + 'static,
{
    fn on_close(&self, event: &ConnectionClosed) {
        (self)(event)
    }
}

use crate::amqp::session::{BindingOptions, ConsumerOptions, Session};
use crate::amqp::transport::{PublishOutcome, TransportChannel};
use crate::consumers::DeliveryHandler;
use crate::pool::{Connection, Error, Role};
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::sync::Arc;
use tracing::{debug, warn};

/// One multiplexed broker session, owned by exactly one [`Connection`] set at a time.
pub(crate) struct Channel {
    raw: Arc<dyn TransportChannel>,
    /// Empty while idle.
    key: String,
    connection_id: u64,
    consumer_tag: Option<String>,
    handler: Option<Arc<dyn DeliveryHandler>>,
    /// Number of leases sharing the channel while it is in use.
    pub(crate) holders: usize,
}

impl Channel {
    pub(crate) fn new(raw: Arc<dyn TransportChannel>, connection_id: u64) -> Self {
        Self {
            raw,
            key: String::new(),
            connection_id,
            consumer_tag: None,
            handler: None,
            holders: 0,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn raw(&self) -> Arc<dyn TransportChannel> {
        Arc::clone(&self.raw)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.raw.is_open()
    }

    /// Whether `raw` is this very broker channel.
    pub(crate) fn is(&self, raw: &Arc<dyn TransportChannel>) -> bool {
        Arc::ptr_eq(&self.raw, raw)
    }

    /// Declare the exchange and, for consumers, declare the queue and bind it.
    ///
    /// Declarations are idempotent: binding the same session twice is not an error.
    #[tracing::instrument(name = "bind_topology", skip_all, fields(connection = self.connection_id, key = %key))]
    pub(crate) async fn bind_topology(
        &mut self,
        session: &Session,
        role: Role,
        key: String,
    ) -> Result<(), Error> {
        let raw = &self.raw;
        let declared = async {
            let exchange = session.exchange();
            // The default exchange always exists and cannot be declared.
            if !exchange.name.is_empty() {
                raw.declare_exchange(exchange).await?;
            }
            if role == Role::Consumer {
                let queue = session.queue();
                raw.declare_queue(queue).await?;
                if !exchange.name.is_empty() {
                    raw.bind_queue(&queue.name, &exchange.name, session.binding())
                        .await?;
                }
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(source) = declared {
            warn!(error = ?source, "Topology declaration was rejected");
            return Err(Error::Topology { key, source });
        }
        debug!("Channel bound");
        self.key = key;
        Ok(())
    }

    pub(crate) fn start_consuming(&mut self, tag: String, handler: Arc<dyn DeliveryHandler>) {
        self.consumer_tag = Some(tag);
        self.handler = Some(handler);
    }

    pub(crate) fn stop_consuming(&mut self) {
        self.consumer_tag = None;
        self.handler = None;
    }

    /// Forget the binding so the channel can be reused by anyone.
    ///
    /// For consumers the subscription is cancelled on a best-effort basis.
    pub(crate) async fn clean(&mut self, role: Role) {
        if self.handler.take().is_some() {
            debug!(key = %self.key, "Detached delivery handler");
        }
        self.key.clear();
        self.holders = 0;
        if role == Role::Consumer {
            if let Some(tag) = self.consumer_tag.take() {
                if let Err(e) = self.raw.cancel(&tag).await {
                    warn!(error = ?e, consumer_tag = %tag, "Failed to cancel the subscription of a released channel");
                }
            }
        }
    }

    pub(crate) async fn close(self) {
        if let Err(e) = self.raw.close().await {
            debug!(error = ?e, connection = self.connection_id, "Failed to close channel");
        }
    }
}

/// What a producer or consumer holds while it owns a channel: the connection and the key the
/// channel is registered under, plus a handle to the broker session.
#[derive(Clone)]
pub(crate) struct ChannelLease {
    connection: Arc<Connection>,
    key: String,
    raw: Arc<dyn TransportChannel>,
}

impl ChannelLease {
    pub(crate) fn new(
        connection: Arc<Connection>,
        key: String,
        raw: Arc<dyn TransportChannel>,
    ) -> Self {
        Self {
            connection,
            key,
            raw,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// The channel is open and still registered under this lease's key.
    pub(crate) async fn is_alive(&self) -> bool {
        !self.connection.is_closed()
            && self.raw.is_open()
            && self.connection.holds(&self.key, &self.raw).await
    }

    /// Give the channel back to its connection. Shared channels stay in use until their last
    /// holder releases them.
    pub(crate) async fn release(&self) -> Result<(), Error> {
        self.connection.release_or_close(&self.key, &self.raw).await
    }

    /// Cancel the subscription `tag` on this channel, ending its delivery stream.
    pub(crate) async fn cancel(&self, tag: &str) -> Result<(), anyhow::Error> {
        self.raw.cancel(tag).await?;
        self.connection.stop_consuming(&self.key).await;
        Ok(())
    }

    pub(crate) async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome, Error> {
        self.raw
            .publish(exchange, routing_key, body, properties, mandatory)
            .await
            .map_err(Error::Publish)
    }

    /// Subscribe to `queue` and feed every delivery to `handler`, one at a time, until the
    /// delivery stream ends.
    ///
    /// Returns `Ok(())` once the stream closes: the subscription was cancelled, the channel was
    /// closed or the connection was lost.
    #[tracing::instrument(
        name = "consume",
        skip_all,
        fields(
            connection = self.connection.id(),
            queue = %queue,
            routing_key = %binding.routing_key,
            consumer_tag = %options.tag,
        )
    )]
    pub(crate) async fn consume(
        &self,
        options: &ConsumerOptions,
        binding: &BindingOptions,
        queue: &str,
        prefetch_count: u16,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), Error> {
        let subscribe = |source| Error::Subscribe {
            queue: queue.to_owned(),
            source,
        };
        self.raw.qos(prefetch_count).await.map_err(subscribe)?;
        let mut deliveries = self.raw.consume(queue, options).await.map_err(subscribe)?;
        self.connection
            .start_consuming(&self.key, options.tag.clone(), Arc::clone(&handler))
            .await?;
        tracing::info!("Consuming");

        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => handler.handle(delivery).await,
                Err(e) => {
                    warn!(error = ?e, "Delivery stream failed");
                    break;
                }
            }
        }
        tracing::info!("Delivery stream closed");
        Ok(())
    }
}

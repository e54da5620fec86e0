//! [`lapin`]-backed implementations of the transport traits.
//!
//! [`lapin`]: https://docs.rs/crate/lapin
use crate::amqp::session::{BindingOptions, ConsumerOptions, Exchange, Queue};
use crate::amqp::transport::{
    ConnectionEvent, DeliveryStream, PublishOutcome, TransportChannel, TransportConnection,
};
use crate::consumers::Delivery;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    BasicProperties, ConnectionStatus,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// AMQP reply code for a regular, intentional close.
const REPLY_SUCCESS: u16 = 200;

/// How often the back-pressure flag of a connection is sampled.
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A connection to a RabbitMq broker.
pub struct RabbitMqConnection {
    inner: lapin::Connection,
    events: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
}

impl RabbitMqConnection {
    pub(crate) fn new(connection: lapin::Connection) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let on_error = sender.clone();
        connection.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            let _ = on_error.send(ConnectionEvent::Closed(e.to_string()));
        });
        // lapin only exposes back-pressure as a status flag.
        tokio::spawn(watch_blocked(connection.status().clone(), sender));

        Self {
            inner: connection,
            events: Mutex::new(Some(receiver)),
        }
    }

    pub fn raw(&self) -> &lapin::Connection {
        &self.inner
    }
}

async fn watch_blocked(status: ConnectionStatus, events: UnboundedSender<ConnectionEvent>) {
    let mut blocked = false;
    while status.connected() && !events.is_closed() {
        if status.blocked() != blocked {
            blocked = !blocked;
            let event = if blocked {
                ConnectionEvent::Blocked("connection.blocked received from the broker".into())
            } else {
                ConnectionEvent::Unblocked
            };
            if events.send(event).is_err() {
                return;
            }
        }
        tokio::time::sleep(BLOCKED_POLL_INTERVAL).await;
    }
}

#[async_trait::async_trait]
impl TransportConnection for RabbitMqConnection {
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(
        &self,
        publisher_confirms: bool,
    ) -> Result<Arc<dyn TransportChannel>, anyhow::Error> {
        let channel = self.inner.create_channel().await?;
        if publisher_confirms {
            // Enable publish confirms on the channel
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(Arc::new(RabbitMqChannel {
            inner: channel,
            confirms: publisher_confirms,
        }))
    }

    fn events(&self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().ok()?.take()
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

/// A RabbitMq channel.
pub struct RabbitMqChannel {
    inner: lapin::Channel,
    confirms: bool,
}

impl RabbitMqChannel {
    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait::async_trait]
impl TransportChannel for RabbitMqChannel {
    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip_all, fields(exchange = %exchange.name))]
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), anyhow::Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            internal: exchange.internal,
            nowait: exchange.no_wait,
        };
        self.inner
            .exchange_declare(
                &exchange.name,
                exchange.kind.clone(),
                options,
                exchange.args.clone(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip_all, fields(queue = %queue.name))]
    async fn declare_queue(&self, queue: &Queue) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            nowait: queue.no_wait,
        };
        self.inner
            .queue_declare(&queue.name, options, queue.args.clone())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self, binding), fields(routing_key = %binding.routing_key))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingOptions,
    ) -> Result<(), anyhow::Error> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                binding.args.clone(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome, anyhow::Error> {
        let options = BasicPublishOptions {
            mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;

        let outcome = match confirm {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                PublishOutcome::Returned((*returned).into())
            }
            Confirmation::Ack(None) => PublishOutcome::Acked,
            Confirmation::Nack(None) => PublishOutcome::Nacked,
            Confirmation::NotRequested if self.confirms => {
                anyhow::bail!("Publisher confirms are enabled but the broker did not confirm")
            }
            Confirmation::NotRequested => PublishOutcome::Sent,
        };
        Ok(outcome)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self, options), fields(consumer_tag = %options.tag))]
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &options.tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                options.args.clone(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

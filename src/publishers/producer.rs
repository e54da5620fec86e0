use crate::amqp::session::{BindingOptions, Exchange, Session};
use crate::amqp::transport::{PublishOutcome, ReturnedMessage};
use crate::pool::{ChannelLease, Connection, Error, Pool};
use crate::publishers::notifications::{listen_confirms, listen_returns, Confirmation};
use lapin::BasicProperties;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

/// AMQP delivery mode of messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Publishes messages to one exchange with one routing key, through a [`Pool`].
///
/// A producer holds on to the channel of its first successful publish and keeps publishing on
/// it until [`Producer::shutdown`] gives it back. Producers built with [`Producer::new`] share
/// their channel key with every other producer of the same exchange and routing key; use
/// [`Producer::new_safe`] to get a key of your own.
///
/// `publish` takes `&mut self`: a producer serves one caller at a time.
pub struct Producer {
    pool: Pool,
    session: Session,
    key: String,
    lease: Option<ChannelLease>,
    /// Number of messages published so far.
    sequence: u64,
    returns: Option<UnboundedSender<ReturnedMessage>>,
    confirms: Option<UnboundedSender<Confirmation>>,
}

impl Producer {
    pub fn new(pool: Pool, exchange: Exchange, binding: BindingOptions) -> Self {
        Self::with_key(pool, Session::for_producer(exchange, binding), None)
    }

    /// A producer whose channel key is prefixed by `unique`, so that producers with distinct
    /// tags never share a channel.
    pub fn new_safe(
        pool: Pool,
        exchange: Exchange,
        binding: BindingOptions,
        unique: impl Into<String>,
    ) -> Self {
        let unique = unique.into();
        Self::with_key(
            pool,
            Session::for_producer(exchange, binding),
            Some(unique.as_str()),
        )
    }

    fn with_key(pool: Pool, session: Session, unique: Option<&str>) -> Self {
        let key = session.producer_key(unique);
        Self {
            pool,
            session,
            key,
            lease: None,
            sequence: 0,
            returns: None,
            confirms: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The key identifying this producer's channel on its connection.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Invoke `callback`, on a background task, for every mandatory message the broker could
    /// not route.
    pub fn notify_return<F>(&mut self, callback: F)
    where
        F: Fn(ReturnedMessage) + Send + 'static,
    {
        self.returns = Some(listen_returns(callback));
    }

    /// Invoke `ack` or `nack`, on a background task, with the sequence number of each publishing
    /// the broker confirmed. Requires publisher confirms on the pool.
    pub fn notify_confirm<A, N>(&mut self, ack: A, nack: N)
    where
        A: Fn(u64) + Send + 'static,
        N: Fn(u64) + Send + 'static,
    {
        self.confirms = Some(listen_confirms(ack, nack));
    }

    /// Publish `body` and return the connection it went through.
    ///
    /// On the first call (or after the held channel broke) a producer channel is taken from the
    /// pool and the exchange is declared on it. No retry is attempted: a failure is returned
    /// as is and the channel that failed is discarded.
    #[tracing::instrument(
        name = "producer_publish",
        skip_all,
        fields(exchange = %self.session.exchange().name, routing_key = %self.session.binding().routing_key)
    )]
    pub async fn publish(&mut self, body: impl AsRef<[u8]>) -> Result<Arc<Connection>, Error> {
        let body = body.as_ref();
        let mut held = self.lease.take();
        if let Some(lease) = &held {
            if !lease.is_alive().await {
                if let Some(stale) = held.take() {
                    discard(stale).await;
                }
            }
        }
        let lease = match held {
            Some(lease) => lease,
            // Joins the channel of other producers publishing under this key, if any.
            None => {
                self.pool
                    .acquire_shared(&self.session, self.key.clone())
                    .await?
            }
        };

        match self.send(&lease, body).await {
            Ok(()) => {
                let connection = Arc::clone(lease.connection());
                self.lease = Some(lease);
                Ok(connection)
            }
            Err(e) => {
                warn!(error = ?e, "Publishing failed, discarding the channel");
                discard(lease).await;
                Err(e)
            }
        }
    }

    async fn send(&mut self, lease: &ChannelLease, body: &[u8]) -> Result<(), Error> {
        let outcome = lease
            .publish(
                &self.session.exchange().name,
                &self.session.binding().routing_key,
                body,
                message_properties(),
                self.pool.publisher_confirms(),
            )
            .await?;
        self.sequence += 1;
        self.notify(outcome);
        Ok(())
    }

    fn notify(&self, outcome: PublishOutcome) {
        let confirmation = match outcome {
            PublishOutcome::Sent => None,
            PublishOutcome::Acked => Some(Confirmation::Ack(self.sequence)),
            PublishOutcome::Nacked => Some(Confirmation::Nack(self.sequence)),
            PublishOutcome::Returned(message) => {
                match &self.returns {
                    Some(returns) => {
                        let _ = returns.send(message);
                    }
                    None => warn!(
                        reply_code = message.reply_code,
                        reply_text = %message.reply_text,
                        "Message returned by the broker"
                    ),
                }
                // Unroutable messages are still acked in confirm mode.
                self.pool
                    .publisher_confirms()
                    .then_some(Confirmation::Ack(self.sequence))
            }
        };
        if let (Some(confirmation), Some(confirms)) = (confirmation, &self.confirms) {
            let _ = confirms.send(confirmation);
        }
    }

    /// Give this producer's hold on its channel on `connection` back to the pool.
    ///
    /// A channel shared with other producers of the same key stays in use until the last of
    /// them shuts down. Fails with [`Error::KeyNotFound`] if this producer holds no channel on
    /// `connection`, e.g. when called twice.
    #[tracing::instrument(name = "producer_shutdown", skip_all, fields(connection = connection.id()))]
    pub async fn shutdown(&mut self, connection: &Connection) -> Result<(), Error> {
        match self.lease.take() {
            Some(lease) if lease.connection().id() == connection.id() => lease.release().await,
            other => {
                self.lease = other;
                Err(Error::KeyNotFound {
                    key: self.key.clone(),
                    connection: connection.id(),
                })
            }
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(discard(lease));
        }
    }
}

async fn discard(lease: ChannelLease) {
    if let Err(e) = lease.release().await {
        debug!(error = ?e, key = lease.key(), "Failed to release producer channel");
    }
}

fn message_properties() -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type("text/plain".into())
        .with_delivery_mode(PERSISTENT)
        .with_message_id(Uuid::new_v4().to_string().into());
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => properties.with_timestamp(now.as_secs()),
        Err(_) => {
            warn!("System time is before 1970");
            properties
        }
    }
}

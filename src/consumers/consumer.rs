use crate::amqp::session::{BindingOptions, ConsumerOptions, Exchange, Queue, Session};
use crate::consumers::reconnect::{Reconnect, Retries};
use crate::consumers::{CloseHandler, DeliveryHandler};
use crate::pool::{ChannelLease, Error, Pool, Role};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Prefetch limit applied when [`Consumer::qos`] was never called.
pub const DEFAULT_PREFETCH_COUNT: u16 = 3;

/// Subscribes to a queue through a [`Pool`] and feeds its messages to a handler.
///
/// `Consumer` is a cheap handle: clone it to call [`Consumer::shutdown`] or
/// [`Consumer::close`] from another task while [`Consumer::consume`] is running.
///
/// # Fault tolerance
///
/// If the connection is lost, `consume` returns `Ok(())`. Register
/// [`Consumer::register_auto_reconnection`] before consuming to resubscribe automatically.
#[derive(Clone)]
pub struct Consumer {
    pub(crate) inner: Arc<ConsumerInner>,
}

pub(crate) struct ConsumerInner {
    pool: Pool,
    session: Session,
    /// Generated on first use when left empty.
    tag: Mutex<String>,
    prefetch_count: AtomicU16,
    lease: Mutex<Option<ChannelLease>>,
    handler: Mutex<Option<Arc<dyn DeliveryHandler>>>,
    closed_handler: Mutex<Option<Arc<dyn CloseHandler>>>,
    /// Set by `shutdown` and `close`, cleared by `consume`.
    pub(crate) stopped: AtomicBool,
    pub(crate) reconnecting: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Consumer {
    /// A consumer of `queue`, bound to `exchange` according to `binding`.
    ///
    /// `tag` identifies the subscription on its channel; an empty tag is replaced by a random
    /// one when consumption starts.
    pub fn new(
        pool: Pool,
        exchange: Exchange,
        queue: Queue,
        binding: BindingOptions,
        options: ConsumerOptions,
        tag: impl Into<String>,
    ) -> Self {
        let tag = tag.into();
        let session = Session::for_consumer(exchange, queue, binding, options);
        Self {
            inner: Arc::new(ConsumerInner {
                pool,
                session,
                tag: Mutex::new(tag),
                prefetch_count: AtomicU16::new(DEFAULT_PREFETCH_COUNT),
                lease: Mutex::new(None),
                handler: Mutex::new(None),
                closed_handler: Mutex::new(None),
                stopped: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Set the prefetch limit used by the next call to [`Consumer::consume`].
    pub fn qos(&self, prefetch_count: u16) {
        self.inner
            .prefetch_count
            .store(prefetch_count, Ordering::SeqCst);
    }

    pub fn prefetch_count(&self) -> u16 {
        self.inner.prefetch_count.load(Ordering::SeqCst)
    }

    /// The consumer tag, generating one if it was left empty.
    pub fn tag(&self) -> String {
        let mut tag = lock(&self.inner.tag);
        if tag.is_empty() {
            *tag = Uuid::new_v4().to_string();
        }
        tag.clone()
    }

    /// The connection currently serving this consumer, if any.
    pub fn connection_id(&self) -> Option<u64> {
        lock(&self.inner.lease)
            .as_ref()
            .map(|lease| lease.connection().id())
    }

    /// Run `handler` on every delivery until the subscription ends.
    ///
    /// This is long-running: it returns `Ok(())` once the delivery stream closes, after
    /// [`Consumer::shutdown`], [`Consumer::close`] or a connection loss. It fails if no channel
    /// could be acquired or the subscription could not be set up.
    #[tracing::instrument(name = "consumer_consume", skip_all, fields(queue = %self.inner.session.queue().name))]
    pub async fn consume<H: DeliveryHandler>(&self, handler: H) -> Result<(), Error> {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(handler);
        *lock(&self.inner.handler) = Some(Arc::clone(&handler));
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.run(handler, true).await
    }

    pub(crate) async fn run(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        watch_connection: bool,
    ) -> Result<(), Error> {
        let session = self.inner.session.with_consumer_tag(self.tag());
        let close_handler = if watch_connection {
            lock(&self.inner.closed_handler).clone()
        } else {
            None
        };
        let lease = self
            .inner
            .pool
            .acquire(Role::Consumer, &session, session.consumer_key(), close_handler)
            .await?;
        *lock(&self.inner.lease) = Some(lease.clone());

        let consumed = lease
            .consume(
                session.consumer_options(),
                session.binding(),
                &session.queue().name,
                self.prefetch_count(),
                handler,
            )
            .await;
        if consumed.is_err() {
            self.discard_lease().await;
        }
        consumed
    }

    pub(crate) fn current_handler(&self) -> Option<Arc<dyn DeliveryHandler>> {
        lock(&self.inner.handler).clone()
    }

    pub(crate) fn current_lease(&self) -> Option<ChannelLease> {
        lock(&self.inner.lease).clone()
    }

    fn take_lease(&self) -> Option<ChannelLease> {
        lock(&self.inner.lease).take()
    }

    /// Give up the channel held by a finished subscription.
    pub(crate) async fn discard_lease(&self) {
        let Some(lease) = self.take_lease() else {
            return;
        };
        // A lost connection releases its channels when it is torn down.
        if lease.connection().is_closed() {
            return;
        }
        if let Err(e) = lease.release().await {
            warn!(error = ?e, "Failed to release the channel of a finished subscription");
        }
    }

    /// Invoke `handler` when the connection serving this consumer is lost.
    ///
    /// Replaces any handler registered before, including automatic reconnection. Takes effect
    /// from the next call to [`Consumer::consume`].
    pub fn register_closed_handler<H: CloseHandler>(&self, handler: H) {
        *lock(&self.inner.closed_handler) = Some(Arc::new(handler));
    }

    /// Resubscribe with the same handler when the connection is lost: wait `interval`, try again,
    /// and give up after `retries` failed attempts.
    ///
    /// Replaces any closed handler registered before. Takes effect from the next call to
    /// [`Consumer::consume`].
    pub fn register_auto_reconnection(&self, interval: Duration, retries: Retries) {
        let reconnect = Reconnect::new(Arc::downgrade(&self.inner), interval, retries);
        *lock(&self.inner.closed_handler) = Some(Arc::new(reconnect));
    }

    /// Cancel the subscription and give the channel back to the pool.
    ///
    /// The connection stays open for other consumers, unless it is now redundant.
    #[tracing::instrument(name = "consumer_shutdown", skip_all)]
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let lease = self.take_lease().ok_or(Error::NotBound)?;
        self.cancel(&lease).await;
        lease.release().await
    }

    /// Cancel the subscription and tear down the connection serving it.
    #[tracing::instrument(name = "consumer_close", skip_all)]
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let lease = self.take_lease().ok_or(Error::NotBound)?;
        self.cancel(&lease).await;
        lease.connection().shutdown(lease.key()).await
    }

    async fn cancel(&self, lease: &ChannelLease) {
        let tag = self.tag();
        if let Err(e) = lease.cancel(&tag).await {
            warn!(error = ?e, consumer_tag = %tag, "Failed to cancel subscription");
        }
    }

    /// Shut the consumer down and exit the process on SIGINT, SIGTERM or SIGQUIT.
    pub fn register_signal_handler(&self) {
        let consumer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = termination().await {
                warn!(error = ?e, "Failed to listen for termination signals");
                return;
            }
            info!("Termination signal received, shutting down consumer");
            if let Err(e) = consumer.shutdown().await {
                warn!(error = ?e, "Failed to shut down consumer");
            }
            std::process::exit(0);
        });
    }
}

#[cfg(unix)]
async fn termination() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
        _ = quit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

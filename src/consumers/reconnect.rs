use crate::consumers::consumer::{Consumer, ConsumerInner};
use crate::consumers::{CloseHandler, ConnectionClosed};
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;
use tracing::{info, warn};

/// How many failed attempts a consumer makes to resubscribe before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retries {
    Forever,
    Times(u32),
}

impl Retries {
    fn exhausted(&self, attempts: u32) -> bool {
        match self {
            Self::Forever => false,
            Self::Times(max) => attempts >= *max,
        }
    }
}

/// Close handler restarting a consumer's subscription on a fresh connection.
pub(crate) struct Reconnect {
    consumer: Weak<ConsumerInner>,
    interval: Duration,
    retries: Retries,
}

impl Reconnect {
    pub(crate) fn new(consumer: Weak<ConsumerInner>, interval: Duration, retries: Retries) -> Self {
        Self {
            consumer,
            interval,
            retries,
        }
    }
}

impl CloseHandler for Reconnect {
    fn on_close(&self, event: &ConnectionClosed) {
        let Some(inner) = self.consumer.upgrade() else {
            return;
        };
        if inner.stopped.load(Ordering::SeqCst) || inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            connection = event.connection_id,
            reason = %event.reason,
            "Consumer lost its connection, reconnecting"
        );
        let consumer = Consumer { inner };
        tokio::spawn(reconnect(consumer, self.interval, self.retries));
    }
}

async fn reconnect(consumer: Consumer, interval: Duration, retries: Retries) {
    // Let the pool tear the broken connection down before dialling again.
    if let Some(lease) = consumer.current_lease() {
        lease.connection().wait_closed().await;
    }
    consumer.discard_lease().await;

    if let Some(handler) = consumer.current_handler() {
        let mut attempts = 0;
        while !retries.exhausted(attempts) {
            tokio::time::sleep(interval).await;
            if consumer.inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            attempts += 1;
            info!(attempt = attempts, "Reconnecting consumer");
            match consumer.run(handler.clone(), false).await {
                // The subscription ran until its stream closed: start counting afresh.
                Ok(()) => attempts = 0,
                Err(e) => warn!(attempt = attempts, error = ?e, "Reconnection attempt failed"),
            }
            consumer.discard_lease().await;
            if consumer.inner.stopped.load(Ordering::SeqCst) {
                break;
            }
        }
        if retries.exhausted(attempts) {
            warn!(attempts, "Giving up reconnecting consumer");
        }
    }
    consumer.inner.reconnecting.store(false, Ordering::SeqCst);
}

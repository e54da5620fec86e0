use crate::amqp::transport::{ConnectionEvent, TransportChannel, TransportConnection};
use crate::consumers::{CloseHandler, ConnectionClosed, DeliveryHandler};
use crate::pool::channel::{Channel, ChannelLease};
use crate::pool::lock::BoundedMutex;
use crate::pool::manager::{Limits, PoolInner};
use crate::pool::Error;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a connection's channels are used for. Producer and consumer channels never share a
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => f.write_str("producer"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

/// A point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub id: u64,
    pub role: Role,
    pub idle: usize,
    pub used: usize,
    pub closed: bool,
}

#[derive(Default)]
struct ChannelSets {
    idle: VecDeque<Channel>,
    used: HashMap<String, Channel>,
    /// Invoked in registration order when the broker drops the connection.
    /// Each handler belongs to the channel key that registered it.
    close_handlers: Vec<(String, Arc<dyn CloseHandler>)>,
}

/// Outcome of [`Connection::reserve`].
pub(crate) enum Reservation {
    Idle(Channel),
    /// A slot for a channel that still has to be opened.
    Fresh,
}

/// One physical broker connection and the channels opened on it.
///
/// Channels move between an idle set and a set of used channels keyed by
/// [`Session`](crate::amqp::session::Session) key. `idle + used + reserved` never exceeds the
/// channel limit of the connection's role, where `reserved` counts channels being opened,
/// bound or released.
pub struct Connection {
    id: u64,
    role: Role,
    raw: Box<dyn TransportConnection>,
    channels: BoundedMutex<ChannelSets>,
    reserved: AtomicUsize,
    /// Set once we start closing the connection ourselves.
    closing: AtomicBool,
    torn_down: watch::Sender<bool>,
    limits: Arc<Limits>,
    pool: Weak<PoolInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        role: Role,
        raw: Box<dyn TransportConnection>,
        limits: Arc<Limits>,
        pool: Weak<PoolInner>,
    ) -> Self {
        let (torn_down, _) = watch::channel(false);
        Self {
            id,
            role,
            raw,
            channels: BoundedMutex::new(ChannelSets::default(), limits.lock_timeout, "connection"),
            reserved: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            torn_down,
            limits,
            pool,
        }
    }

    /// Identifier of the connection, unique within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.raw.is_closed()
    }

    /// Resolves once the connection has been fully torn down.
    pub async fn wait_closed(&self) {
        let mut torn_down = self.torn_down.subscribe();
        while !*torn_down.borrow_and_update() {
            if torn_down.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn stats(&self) -> Result<ConnectionStats, Error> {
        let sets = self.channels.lock().await?;
        Ok(ConnectionStats {
            id: self.id,
            role: self.role,
            idle: sets.idle.len(),
            used: sets.used.len(),
            closed: self.is_closed(),
        })
    }

    /// No channel is in use.
    pub async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.channels.lock().await?.used.is_empty())
    }

    /// A channel can be handed out without exceeding the channel limit.
    pub async fn has_spare_capacity(&self) -> Result<bool, Error> {
        let sets = self.channels.lock().await?;
        Ok(!sets.idle.is_empty() || self.has_room(&sets))
    }

    /// More channels are open, idle or in flight than the channel limit allows.
    pub async fn has_excess_channels(&self) -> Result<bool, Error> {
        let sets = self.channels.lock().await?;
        Ok(self.is_over_limit(&sets))
    }

    fn limit(&self) -> usize {
        self.limits.channels(self.role)
    }

    fn has_room(&self, sets: &ChannelSets) -> bool {
        self.occupied(sets) < self.limit()
    }

    fn is_over_limit(&self, sets: &ChannelSets) -> bool {
        self.occupied(sets) > self.limit()
    }

    fn occupied(&self, sets: &ChannelSets) -> usize {
        sets.idle.len() + sets.used.len() + self.reserved.load(Ordering::SeqCst)
    }

    fn unreserve(&self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }

    /// Empty and with nothing in flight: safe to retire.
    pub(crate) async fn is_idle(&self) -> bool {
        match self.channels.lock().await {
            Ok(sets) => sets.used.is_empty() && self.reserved.load(Ordering::SeqCst) == 0,
            Err(_) => false,
        }
    }

    /// Claim a channel slot: an idle channel if there is one, otherwise room for a new channel.
    ///
    /// Returns `None` when the connection is closed or full. Every reservation must end in
    /// [`Connection::occupy`] or [`Connection::abandon`].
    pub(crate) async fn reserve(&self) -> Result<Option<Reservation>, Error> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut sets = self.channels.lock().await?;
        while let Some(channel) = sets.idle.pop_back() {
            if channel.is_open() {
                self.reserved.fetch_add(1, Ordering::SeqCst);
                return Ok(Some(Reservation::Idle(channel)));
            }
            debug!(connection = self.id, "Dropping an idle channel closed by the broker");
        }
        if self.has_room(&sets) {
            self.reserved.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(Reservation::Fresh));
        }
        Ok(None)
    }

    /// Open a channel for a [`Reservation::Fresh`] slot.
    pub(crate) async fn open_channel(&self) -> Result<Channel, Error> {
        let confirms = self.role == Role::Producer && self.limits.publisher_confirms;
        match self.raw.open_channel(confirms).await {
            Ok(raw) => {
                debug!(connection = self.id, role = %self.role, "Channel opened");
                Ok(Channel::new(raw, self.id))
            }
            Err(source) => {
                self.unreserve();
                Err(Error::ChannelOpen {
                    connection: self.id,
                    source,
                })
            }
        }
    }

    /// End a reservation without using the channel: park it in the idle set if `reuse` and it
    /// is still healthy, close it otherwise.
    pub(crate) async fn abandon(&self, channel: Channel, reuse: bool) {
        if reuse && channel.is_open() && !self.is_closed() {
            if let Ok(mut sets) = self.channels.lock().await {
                sets.idle.push_back(channel);
                self.unreserve();
                return;
            }
        }
        self.unreserve();
        channel.close().await;
    }

    /// Move a bound channel into the used set, ending its reservation.
    ///
    /// Fails with [`Error::DuplicateKey`] if another channel is already in use under the same
    /// key; the channel is closed in that case.
    pub(crate) async fn occupy(
        self: &Arc<Self>,
        mut channel: Channel,
        close_handler: Option<Arc<dyn CloseHandler>>,
    ) -> Result<ChannelLease, Error> {
        let mut sets = match self.channels.lock().await {
            Ok(sets) => sets,
            Err(e) => {
                self.unreserve();
                channel.close().await;
                return Err(e);
            }
        };
        self.unreserve();

        let key = channel.key().to_owned();
        if sets.used.get(&key).map_or(false, |used| !used.is_open()) {
            // Closed by the broker while in use: its holders find out on their next publish.
            sets.used.remove(&key);
            sets.close_handlers.retain(|(k, _)| k != &key);
            debug!(connection = self.id, %key, "Dropping a used channel closed by the broker");
        }
        if self.is_closed() || sets.used.contains_key(&key) {
            drop(sets);
            channel.close().await;
            if self.is_closed() {
                return Err(Error::ChannelOpen {
                    connection: self.id,
                    source: anyhow::anyhow!("The connection closed while binding the channel"),
                });
            }
            warn!(connection = self.id, %key, "Channel key is already in use");
            return Err(Error::DuplicateKey(key));
        }

        let lease = ChannelLease::new(Arc::clone(self), key.clone(), channel.raw());
        if let Some(handler) = close_handler {
            sets.close_handlers.push((key.clone(), handler));
        }
        channel.holders = 1;
        sets.used.insert(key, channel);
        Ok(lease)
    }

    /// Join the holders of the healthy channel in use under `key`, if any.
    ///
    /// The returned lease must be released like any other.
    pub(crate) async fn share(self: &Arc<Self>, key: &str) -> Result<Option<ChannelLease>, Error> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut sets = self.channels.lock().await?;
        let Some(channel) = sets.used.get_mut(key).filter(|channel| channel.is_open()) else {
            return Ok(None);
        };
        channel.holders += 1;
        debug!(connection = self.id, %key, holders = channel.holders, "Sharing a channel in use");
        Ok(Some(ChannelLease::new(
            Arc::clone(self),
            key.to_owned(),
            channel.raw(),
        )))
    }

    /// Whether `raw` is the channel in use under `key`.
    pub(crate) async fn holds(&self, key: &str, raw: &Arc<dyn TransportChannel>) -> bool {
        match self.channels.lock().await {
            Ok(sets) => sets.used.get(key).map_or(false, |channel| channel.is(raw)),
            Err(_) => false,
        }
    }

    pub(crate) async fn start_consuming(
        &self,
        key: &str,
        tag: String,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), Error> {
        let mut sets = self.channels.lock().await?;
        let channel = sets.used.get_mut(key).ok_or_else(|| Error::KeyNotFound {
            key: key.to_owned(),
            connection: self.id,
        })?;
        channel.start_consuming(tag, handler);
        Ok(())
    }

    pub(crate) async fn stop_consuming(&self, key: &str) {
        if let Ok(mut sets) = self.channels.lock().await {
            if let Some(channel) = sets.used.get_mut(key) {
                channel.stop_consuming();
            }
        }
    }

    /// Give back `raw`, the channel in use under `key`.
    ///
    /// Fails with [`Error::KeyNotFound`] unless `raw` is registered under `key`. A channel shared
    /// by several holders stays in use until the last one gives it back.
    ///
    /// The channel then returns to the idle set unless the connection is over budget for its
    /// role (too many channels, or too many idle ones), in which case it is closed. Afterwards
    /// the connection itself is retired if it is empty and the pool has enough empty
    /// connections of the same role already.
    #[tracing::instrument(name = "release_channel", skip(self, raw), fields(connection = self.id, role = %self.role))]
    pub(crate) async fn release_or_close(
        &self,
        key: &str,
        raw: &Arc<dyn TransportChannel>,
    ) -> Result<(), Error> {
        let not_found = || Error::KeyNotFound {
            key: key.to_owned(),
            connection: self.id,
        };
        let (mut channel, keep) = {
            let mut sets = self.channels.lock().await?;
            let Some(used) = sets.used.get_mut(key).filter(|used| used.is(raw)) else {
                return Err(not_found());
            };
            if used.holders > 1 && used.is_open() {
                used.holders -= 1;
                debug!(holders = used.holders, "Channel still shared, keeping it in use");
                return Ok(());
            }
            let channel = sets.used.remove(key).ok_or_else(not_found)?;
            sets.close_handlers.retain(|(k, _)| k != key);
            // In flight until parked or closed.
            self.reserved.fetch_add(1, Ordering::SeqCst);

            let over_budget = self.is_over_limit(&sets)
                || sets.idle.len() >= self.limits.idle_channels(self.role);
            let keep = !over_budget && channel.is_open() && !self.is_closed();
            (channel, keep)
        };

        if keep {
            channel.clean(self.role).await;
            self.abandon(channel, true).await;
            debug!("Channel released to the idle set");
        } else {
            self.abandon(channel, false).await;
            debug!("Channel closed on release");
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.retire_if_redundant(self.id, self.role).await;
        }
        Ok(())
    }

    /// Close the channel in use under `key`, then the whole connection.
    #[tracing::instrument(name = "shutdown_connection", skip(self), fields(connection = self.id, role = %self.role))]
    pub(crate) async fn shutdown(&self, key: &str) -> Result<(), Error> {
        let channel = {
            let mut sets = self.channels.lock().await?;
            sets.close_handlers.retain(|(k, _)| k != key);
            sets.used.remove(key)
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.deregister(self.id).await;
        }
        self.close().await;
        Ok(())
    }

    /// Close the connection on purpose, dropping all its channels.
    pub(crate) async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sets) = self.channels.lock().await {
            sets.idle.clear();
            sets.used.clear();
            sets.close_handlers.clear();
        }
        if let Err(e) = self.raw.close().await {
            debug!(error = ?e, connection = self.id, "Failed to close connection");
        }
        self.torn_down.send_replace(true);
        info!(connection = self.id, role = %self.role, "Connection closed");
    }

    /// Follow the broker notifications of this connection on a background task.
    pub(crate) fn watch(self: &Arc<Self>) {
        let Some(mut events) = self.raw.events() else {
            return;
        };
        let connection = Arc::downgrade(self);
        let mut torn_down = self.torn_down.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = torn_down.changed() => None,
                };
                let (Some(event), Some(connection)) = (event, connection.upgrade()) else {
                    return;
                };
                match event {
                    ConnectionEvent::Closed(reason) => {
                        connection.on_closed(reason).await;
                        return;
                    }
                    ConnectionEvent::Blocked(reason) => {
                        warn!(connection = connection.id, %reason, "Connection blocked by the broker");
                    }
                    ConnectionEvent::Unblocked => {
                        info!(connection = connection.id, "Connection unblocked");
                    }
                }
            }
        });
    }

    async fn on_closed(&self, reason: String) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        warn!(connection = self.id, role = %self.role, %reason, "Connection closed unexpectedly");
        let handlers = match self.channels.lock().await {
            Ok(mut sets) => std::mem::take(&mut sets.close_handlers),
            Err(_) => Vec::new(),
        };
        let event = ConnectionClosed {
            connection_id: self.id,
            reason,
        };
        for (_, handler) in &handlers {
            handler.on_close(&event);
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.deregister(self.id).await;
        }
        self.close().await;
    }
}

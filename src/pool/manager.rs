use crate::amqp::configuration::{PoolSettings, Settings};
use crate::amqp::session::Session;
use crate::amqp::transport::Transport;
use crate::amqp::ConnectionFactory;
use crate::consumers::CloseHandler;
use crate::pool::channel::{Channel, ChannelLease};
use crate::pool::connection::Reservation;
use crate::pool::lock::{BoundedMutex, BoundedRwLock};
use crate::pool::{Connection, ConnectionStats, Error, Role};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capacity limits shared by the pool and its connections.
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub(crate) max_connections: usize,
    pub(crate) max_producer_channels: usize,
    pub(crate) max_consumer_channels: usize,
    pub(crate) max_idle_channels: Option<usize>,
    pub(crate) spare_connections: usize,
    pub(crate) lock_timeout: Duration,
    pub(crate) publisher_confirms: bool,
}

impl Limits {
    pub(crate) fn channels(&self, role: Role) -> usize {
        match role {
            Role::Producer => self.max_producer_channels,
            Role::Consumer => self.max_consumer_channels,
        }
    }

    pub(crate) fn idle_channels(&self, role: Role) -> usize {
        let limit = self.channels(role);
        self.max_idle_channels.map_or(limit, |idle| idle.min(limit))
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for Limits {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            max_producer_channels: settings.max_producer_channels_per_connection,
            max_consumer_channels: settings.max_consumer_channels_per_connection,
            max_idle_channels: settings.max_idle_channels_per_connection,
            spare_connections: settings.spare_connections_per_role,
            lock_timeout: settings.lock_timeout(),
            publisher_confirms: settings.publisher_confirms,
        }
    }
}

/// A bounded registry of broker connections, split between producer and consumer roles.
///
/// `Pool` is a cheap handle: clone it and hand it to every [`Producer`] and [`Consumer`] of the
/// process.
///
/// [`Producer`]: crate::publishers::Producer
/// [`Consumer`]: crate::consumers::Consumer
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    transport: Box<dyn Transport>,
    connections: BoundedRwLock<BTreeMap<u64, Arc<Connection>>>,
    /// Serializes the creation of producer connections.
    creation: BoundedMutex<()>,
    /// One gate per producer key, so that same-key producers bind a single channel and share it.
    gates: BoundedMutex<HashMap<String, Arc<BoundedMutex<()>>>>,
    next_id: AtomicU64,
    limits: Arc<Limits>,
}

/// A channel handed out by the pool, reserved on its connection but not registered under a key
/// yet.
struct Checkout {
    connection: Arc<Connection>,
    channel: Channel,
    fresh: bool,
}

impl Pool {
    /// Start building a [`Pool`] that dials connections through `transport`.
    pub fn builder<T: Transport>(transport: T) -> PoolBuilder {
        PoolBuilder::new(Box::new(transport))
    }

    /// Build a pool connected to the RabbitMq broker described by `settings`.
    pub async fn from_settings(settings: &Settings) -> Result<Self, Error> {
        let factory = ConnectionFactory::from_settings(&settings.rabbitmq).map_err(Error::Dial)?;
        Self::builder(factory)
            .with_settings(&settings.pool)
            .build()
            .await
    }

    /// Whether producer channels run in confirm mode.
    pub fn publisher_confirms(&self) -> bool {
        self.inner.limits.publisher_confirms
    }

    /// Number of registered connections, both roles included.
    pub async fn connection_count(&self) -> Result<usize, Error> {
        Ok(self.inner.connections.read().await?.len())
    }

    /// Snapshot of the connections of `role`, ordered by identifier.
    pub async fn connections(&self, role: Role) -> Result<Vec<ConnectionStats>, Error> {
        let connections = self.inner.connections.read().await?;
        let mut stats = Vec::new();
        for connection in connections.values().filter(|c| c.role() == role) {
            stats.push(connection.stats().await?);
        }
        Ok(stats)
    }

    /// Run one reclamation sweep now.
    ///
    /// Closed connections are deregistered and, per role, at most the configured number of
    /// spare empty connections is kept.
    #[tracing::instrument(name = "reclaim_connections", skip(self))]
    pub async fn reclaim(&self) -> Result<(), Error> {
        let (dead, retired) = {
            let mut connections = self.inner.connections.write().await?;
            let dead: Vec<Arc<Connection>> = connections
                .values()
                .filter(|c| c.is_closed())
                .cloned()
                .collect();
            for connection in &dead {
                connections.remove(&connection.id());
            }

            let mut retired = Vec::new();
            for role in [Role::Producer, Role::Consumer] {
                let mut spare = 0;
                for connection in connections.values().filter(|c| c.role() == role) {
                    if connection.is_idle().await {
                        spare += 1;
                        if spare > self.inner.limits.spare_connections {
                            retired.push(connection.id());
                        }
                    }
                }
            }
            let retired: Vec<_> = retired
                .iter()
                .filter_map(|id| connections.remove(id))
                .collect();
            (dead, retired)
        };

        // Dead connections still need tearing down: their watchers and waiters are pending.
        for connection in dead.iter().chain(&retired) {
            connection.close().await;
        }
        if !dead.is_empty() || !retired.is_empty() {
            info!(
                closed = dead.len(),
                redundant = retired.len(),
                "Reclaimed connections"
            );
        }
        Ok(())
    }

    /// Take a channel of `role`, bind `session` on it and register it under `key`.
    pub(crate) async fn acquire(
        &self,
        role: Role,
        session: &Session,
        key: String,
        close_handler: Option<Arc<dyn CloseHandler>>,
    ) -> Result<ChannelLease, Error> {
        let Checkout {
            connection,
            mut channel,
            fresh,
        } = self.checkout(role).await?;
        if let Err(e) = channel.bind_topology(session, role, key).await {
            connection.abandon(channel, !fresh).await;
            return Err(e);
        }
        connection.occupy(channel, close_handler).await
    }

    /// Share the producer channel in use under `key`, or acquire one if there is none.
    ///
    /// Same-key callers are serialized until the channel is registered, so concurrent producers
    /// with the same key end up on a single channel.
    pub(crate) async fn acquire_shared(
        &self,
        session: &Session,
        key: String,
    ) -> Result<ChannelLease, Error> {
        let gate = self.inner.gate(&key).await?;
        let _binding = gate.lock().await?;
        if let Some(lease) = self.share(Role::Producer, &key).await? {
            return Ok(lease);
        }
        self.acquire(Role::Producer, session, key, None).await
    }

    /// Join the holders of a healthy channel already in use under `key` on a connection of
    /// `role`.
    async fn share(&self, role: Role, key: &str) -> Result<Option<ChannelLease>, Error> {
        let connections = self.inner.connections.read().await?;
        for connection in connections.values().filter(|c| c.role() == role) {
            if let Some(lease) = connection.share(key).await? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    async fn checkout(&self, role: Role) -> Result<Checkout, Error> {
        if let Some(checkout) = self.inner.reserve_existing(role).await? {
            return self.inner.open(checkout.0, checkout.1).await;
        }
        let connection = match role {
            Role::Producer => {
                let _creation = self.inner.creation.lock().await?;
                // Another producer may have made room while we were waiting.
                if let Some(checkout) = self.inner.reserve_existing(role).await? {
                    return self.inner.open(checkout.0, checkout.1).await;
                }
                self.inner.create_connection(role).await?
            }
            Role::Consumer => self.inner.create_connection(role).await?,
        };
        self.inner.open(connection, Reservation::Fresh).await
    }
}

impl PoolInner {
    async fn gate(&self, key: &str) -> Result<Arc<BoundedMutex<()>>, Error> {
        let mut gates = self.gates.lock().await?;
        // Gates nobody waits on anymore.
        gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        let gate = gates.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(BoundedMutex::new(
                (),
                self.limits.lock_timeout,
                "producer key",
            ))
        });
        Ok(Arc::clone(gate))
    }

    async fn reserve_existing(
        &self,
        role: Role,
    ) -> Result<Option<(Arc<Connection>, Reservation)>, Error> {
        let connections = self.connections.read().await?;
        for connection in connections.values().filter(|c| c.role() == role) {
            if let Some(reservation) = connection.reserve().await? {
                return Ok(Some((Arc::clone(connection), reservation)));
            }
        }
        Ok(None)
    }

    async fn open(
        &self,
        connection: Arc<Connection>,
        reservation: Reservation,
    ) -> Result<Checkout, Error> {
        match reservation {
            Reservation::Idle(channel) => Ok(Checkout {
                connection,
                channel,
                fresh: false,
            }),
            Reservation::Fresh => {
                let channel = connection.open_channel().await?;
                Ok(Checkout {
                    connection,
                    channel,
                    fresh: true,
                })
            }
        }
    }

    async fn live_connections(&self) -> Result<usize, Error> {
        let connections = self.connections.read().await?;
        Ok(connections.values().filter(|c| !c.is_closed()).count())
    }

    /// Dial a new connection of `role` and register it, holding one reserved channel slot.
    #[tracing::instrument(name = "create_connection", skip(self))]
    async fn create_connection(self: &Arc<Self>, role: Role) -> Result<Arc<Connection>, Error> {
        let max = self.limits.max_connections;
        if self.live_connections().await? >= max {
            warn!(max, "Connection limit reached");
            return Err(Error::CapacityExceeded(max));
        }

        let raw = self.transport.connect().await.map_err(|e| {
            warn!(error = ?e, "Failed to dial the broker");
            Error::Dial(e)
        })?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new(
            id,
            role,
            raw,
            Arc::clone(&self.limits),
            Arc::downgrade(self),
        ));
        // Nobody else can see the connection yet: this always succeeds.
        let _ = connection.reserve().await?;

        {
            let mut connections = self.connections.write().await?;
            if connections.values().filter(|c| !c.is_closed()).count() >= max {
                drop(connections);
                connection.close().await;
                warn!(max, "Connection limit reached");
                return Err(Error::CapacityExceeded(max));
            }
            connections.insert(id, Arc::clone(&connection));
        }
        connection.watch();
        info!(connection = id, %role, "Connection registered");
        Ok(connection)
    }

    pub(crate) async fn deregister(&self, id: u64) {
        match self.connections.write().await {
            Ok(mut connections) => {
                if connections.remove(&id).is_some() {
                    info!(connection = id, "Connection deregistered");
                }
            }
            // The sweep removes it later.
            Err(e) => warn!(error = ?e, connection = id, "Failed to deregister connection"),
        }
    }

    /// Close connection `id` if it is empty and enough other empty connections of `role` exist.
    pub(crate) async fn retire_if_redundant(&self, id: u64, role: Role) {
        let retired = {
            let mut connections = match self.connections.write().await {
                Ok(connections) => connections,
                Err(_) => return,
            };
            let Some(candidate) = connections.get(&id) else {
                return;
            };
            if !candidate.is_idle().await {
                return;
            }
            let mut empty = 0;
            for connection in connections.values().filter(|c| c.role() == role) {
                if !connection.is_closed() && connection.is_idle().await {
                    empty += 1;
                }
            }
            if empty <= self.limits.spare_connections {
                return;
            }
            connections.remove(&id)
        };
        if let Some(connection) = retired {
            debug!(connection = id, %role, "Retiring redundant empty connection");
            connection.close().await;
        }
    }
}

/// A builder for [`Pool`].
///
/// Use [`Pool::builder`] as entrypoint.
pub struct PoolBuilder {
    transport: Box<dyn Transport>,
    limits: Limits,
    reclaim_interval: Duration,
}

impl PoolBuilder {
    fn new(transport: Box<dyn Transport>) -> Self {
        let settings = PoolSettings::default();
        Self {
            transport,
            limits: Limits::from(&settings),
            reclaim_interval: settings.reclaim_interval(),
        }
    }

    /// Take every limit from `settings`.
    #[must_use]
    pub fn with_settings(mut self, settings: &PoolSettings) -> Self {
        self.limits = Limits::from(settings);
        self.reclaim_interval = settings.reclaim_interval();
        self
    }

    /// Maximum number of live connections, both roles included. Defaults to 10.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.limits.max_connections = max;
        self
    }

    /// Maximum number of channels on a producer connection. Defaults to 20.
    #[must_use]
    pub fn max_producer_channels(mut self, max: usize) -> Self {
        self.limits.max_producer_channels = max;
        self
    }

    /// Maximum number of channels on a consumer connection. Defaults to 20.
    #[must_use]
    pub fn max_consumer_channels(mut self, max: usize) -> Self {
        self.limits.max_consumer_channels = max;
        self
    }

    /// Maximum number of idle channels kept on a connection; released channels beyond it are
    /// closed. Defaults to the channel limit of the connection's role.
    #[must_use]
    pub fn max_idle_channels(mut self, max: usize) -> Self {
        self.limits.max_idle_channels = Some(max);
        self
    }

    /// How many empty connections of each role survive reclamation. Defaults to 1.
    #[must_use]
    pub fn spare_connections(mut self, spare: usize) -> Self {
        self.limits.spare_connections = spare;
        self
    }

    /// How long to wait for the pool or a connection lock before failing with
    /// [`Error::LockTimeout`]. Defaults to 16 seconds.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.limits.lock_timeout = timeout;
        self
    }

    /// Interval between reclamation sweeps. Defaults to 30 seconds.
    #[must_use]
    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Put producer channels in confirm mode and publish as mandatory. Defaults to `true`.
    #[must_use]
    pub fn publisher_confirms(mut self, enabled: bool) -> Self {
        self.limits.publisher_confirms = enabled;
        self
    }

    /// Finalise the builder: open the first producer connection with one idle channel and start
    /// the reclamation sweep.
    ///
    /// Fails if the broker cannot be reached.
    #[tracing::instrument(name = "init_pool", skip(self), fields(max_connections = self.limits.max_connections))]
    pub async fn build(self) -> Result<Pool, Error> {
        let lock_timeout = self.limits.lock_timeout;
        let inner = Arc::new(PoolInner {
            transport: self.transport,
            connections: BoundedRwLock::new(BTreeMap::new(), lock_timeout, "pool"),
            creation: BoundedMutex::new((), lock_timeout, "connection creation"),
            gates: BoundedMutex::new(HashMap::new(), lock_timeout, "producer gates"),
            next_id: AtomicU64::new(1),
            limits: Arc::new(self.limits),
        });

        let connection = inner.create_connection(Role::Producer).await?;
        let channel = connection.open_channel().await?;
        connection.abandon(channel, true).await;

        spawn_reclaimer(Arc::downgrade(&inner), self.reclaim_interval);
        Ok(Pool { inner })
    }
}

fn spawn_reclaimer(inner: Weak<PoolInner>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                debug!("Pool dropped, stopping reclamation");
                return;
            };
            if let Err(e) = (Pool { inner }).reclaim().await {
                warn!(error = ?e, "Reclamation sweep failed");
            }
        }
    });
}

//! An in-process broker implementing the transport traits.
//!
//! `MemoryBroker` keeps exchanges, queues and bindings in memory and routes publishings to
//! subscribed channels, enough to exercise the pool without a running RabbitMq. It also exposes
//! knobs to simulate failures (unreachable broker, dropped connections, back-pressure) and
//! network latency.
//!
//! ```rust
//! use warren::amqp::memory::MemoryBroker;
//! use warren::pool::Pool;
//!
//! async fn example() -> Result<(), warren::pool::Error> {
//!     let broker = MemoryBroker::new();
//!     let pool = Pool::builder(broker.clone()).build().await?;
//!     assert_eq!(pool.connection_count().await?, 1);
//!     Ok(())
//! }
//! ```
use crate::amqp::session::{BindingOptions, ConsumerOptions, Exchange, ExchangeKind, Queue};
use crate::amqp::transport::{
    ConnectionEvent, DeliveryStream, PublishOutcome, ReturnedMessage, Transport,
    TransportChannel, TransportConnection,
};
use crate::consumers::Delivery;
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};

/// AMQP reply code sent back with unroutable mandatory messages.
const NO_ROUTE: u16 = 312;

/// A broker living in the current process.
///
/// Cloning is cheap: all clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// A message accepted by [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    latency: Duration,
    dial_attempts: Vec<Instant>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    connections: BTreeMap<u64, ConnectionEntry>,
    exchanges: BTreeMap<String, Exchange>,
    queues: BTreeMap<String, QueueEntry>,
    bindings: Vec<(String, String, String)>,
    published: Vec<PublishedMessage>,
}

struct ConnectionEntry {
    closed: Arc<AtomicBool>,
    events: UnboundedSender<ConnectionEvent>,
    channels: Vec<Arc<AtomicBool>>,
}

struct QueueEntry {
    declaration: Queue,
    messages: VecDeque<PublishedMessage>,
    subscribers: VecDeque<Subscriber>,
}

struct Subscriber {
    connection_id: u64,
    channel_id: u16,
    tag: String,
    sender: UnboundedSender<Result<Delivery, anyhow::Error>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse (or accept again) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Delay every channel operation by `latency`, so that concurrent callers interleave the
    /// way they do against a remote broker.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    async fn pause(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// When each connection attempt happened, successful or not.
    pub fn dial_attempts(&self) -> Vec<Instant> {
        self.state().dial_attempts.clone()
    }

    /// Identifiers of the connections that are still open.
    pub fn connection_ids(&self) -> Vec<u64> {
        self.state()
            .connections
            .iter()
            .filter(|(_, c)| !c.closed.load(Ordering::SeqCst))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn open_connections(&self) -> usize {
        self.connection_ids().len()
    }

    pub fn open_channels(&self) -> usize {
        self.state()
            .connections
            .values()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .flat_map(|c| c.channels.iter())
            .filter(|open| open.load(Ordering::SeqCst))
            .count()
    }

    /// Drop a connection as if the network went away.
    pub fn disconnect(&self, connection_id: u64, reason: &str) {
        let mut state = self.state();
        if let Some(entry) = state.connections.get(&connection_id) {
            if !entry.closed.swap(true, Ordering::SeqCst) {
                let _ = entry
                    .events
                    .send(ConnectionEvent::Closed(reason.to_owned()));
            }
        }
        state.drop_subscribers(|s| s.connection_id == connection_id);
    }

    /// Close a connection without telling the client, like a TCP link that silently died.
    pub fn sever(&self, connection_id: u64) {
        let mut state = self.state();
        if let Some(entry) = state.connections.get(&connection_id) {
            entry.closed.store(true, Ordering::SeqCst);
        }
        state.drop_subscribers(|s| s.connection_id == connection_id);
    }

    /// Drop every open connection as if the broker restarted.
    pub fn disconnect_all(&self, reason: &str) {
        for id in self.connection_ids() {
            self.disconnect(id, reason);
        }
    }

    /// Send a back-pressure notification on every open connection.
    pub fn block_all(&self, reason: &str) {
        self.notify_all(ConnectionEvent::Blocked(reason.to_owned()));
    }

    pub fn unblock_all(&self) {
        self.notify_all(ConnectionEvent::Unblocked);
    }

    fn notify_all(&self, event: ConnectionEvent) {
        for entry in self.state().connections.values() {
            if !entry.closed.load(Ordering::SeqCst) {
                let _ = entry.events.send(event.clone());
            }
        }
    }

    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.state()
            .queues
            .get(name)
            .map(|q| q.declaration.clone())
    }

    /// `(exchange, queue, routing key)` triples.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state().bindings.clone()
    }

    /// Messages waiting in `queue` for a subscriber.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.subscribers.len())
    }

    /// Every message accepted so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }
}

impl BrokerState {
    fn drop_subscribers(&mut self, mut predicate: impl FnMut(&Subscriber) -> bool) {
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| !predicate(s));
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect();
        }
        let Some(declared) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|(e, _, _)| e == exchange)
            .filter(|(_, _, key)| match &declared.kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(
                    &key.split('.').collect::<Vec<_>>(),
                    &routing_key.split('.').collect::<Vec<_>>(),
                ),
                _ => key == routing_key,
            })
            .map(|(_, queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    fn enqueue(&mut self, queue: &str, message: PublishedMessage) {
        self.next_delivery_tag += 1;
        let tag = self.next_delivery_tag;
        let Some(entry) = self.queues.get_mut(queue) else {
            return;
        };
        let mut delivery = to_delivery(tag, &message);
        // Round-robin across subscribers, forgetting the ones whose stream was dropped.
        while let Some(subscriber) = entry.subscribers.pop_front() {
            match subscriber.sender.send(Ok(delivery)) {
                Ok(()) => {
                    entry.subscribers.push_back(subscriber);
                    return;
                }
                Err(SendError(returned)) => match returned {
                    Ok(d) => delivery = d,
                    Err(_) => return,
                },
            }
        }
        entry.messages.push_back(message);
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&word, rest)), Some((&head, tail))) => {
            (word == "*" || word == head) && topic_matches(rest, tail)
        }
        _ => false,
    }
}

fn to_delivery(tag: u64, message: &PublishedMessage) -> Delivery {
    lapin::message::Delivery {
        delivery_tag: tag,
        exchange: message.exchange.clone().into(),
        routing_key: message.routing_key.clone().into(),
        redelivered: false,
        properties: message.properties.clone(),
        data: message.data.clone(),
        acker: Default::default(),
    }
    .into()
}

#[async_trait::async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn TransportConnection>, anyhow::Error> {
        let mut state = self.state();
        state.dial_attempts.push(Instant::now());
        if state.unreachable {
            anyhow::bail!("Connection refused (os error 111)");
        }
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let closed = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            ConnectionEntry {
                closed: closed.clone(),
                events: sender,
                channels: Vec::new(),
            },
        );
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
            closed,
            next_channel_id: AtomicU16::new(0),
            events: Mutex::new(Some(receiver)),
        }))
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: Arc<AtomicBool>,
    next_channel_id: AtomicU16,
    events: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
}

impl MemoryConnection {
    /// The identifier the broker knows this connection by.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait::async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_channel(
        &self,
        publisher_confirms: bool,
    ) -> Result<Arc<dyn TransportChannel>, anyhow::Error> {
        self.broker.pause().await;
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("Connection {} is closed", self.id);
        }
        let open = Arc::new(AtomicBool::new(true));
        if let Some(entry) = self.broker.state().connections.get_mut(&self.id) {
            entry.channels.push(open.clone());
        }
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            channel_id,
            open,
            connection_closed: self.closed.clone(),
            confirms: publisher_confirms,
        }))
    }

    fn events(&self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Connection {} is already closed", self.id);
        }
        let id = self.id;
        self.broker
            .state()
            .drop_subscribers(|s| s.connection_id == id);
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
    channel_id: u16,
    open: Arc<AtomicBool>,
    connection_closed: Arc<AtomicBool>,
    confirms: bool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), anyhow::Error> {
        if !self.is_open() {
            anyhow::bail!(
                "Channel {} on connection {} is closed",
                self.channel_id,
                self.connection_id
            );
        }
        Ok(())
    }

    /// Channel-level exceptions close the channel, like a real broker does.
    fn fail(&self, state: &mut BrokerState, reason: String) -> anyhow::Error {
        self.open.store(false, Ordering::SeqCst);
        let (connection_id, channel_id) = (self.connection_id, self.channel_id);
        state.drop_subscribers(|s| s.connection_id == connection_id && s.channel_id == channel_id);
        anyhow::anyhow!(reason)
    }
}

#[async_trait::async_trait]
impl TransportChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), anyhow::Error> {
        self.broker.pause().await;
        self.ensure_open()?;
        if exchange.name.is_empty() {
            return Ok(());
        }
        let mut state = self.broker.state();
        match state.exchanges.get(&exchange.name) {
            Some(existing)
                if existing.kind != exchange.kind
                    || existing.durable != exchange.durable
                    || existing.auto_delete != exchange.auto_delete
                    || existing.internal != exchange.internal =>
            {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                    exchange.name
                );
                Err(self.fail(&mut state, reason))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<(), anyhow::Error> {
        self.broker.pause().await;
        self.ensure_open()?;
        if queue.name.is_empty() {
            return Ok(());
        }
        let mut state = self.broker.state();
        match state.queues.get(&queue.name) {
            Some(existing)
                if existing.declaration.durable != queue.durable
                    || existing.declaration.auto_delete != queue.auto_delete
                    || existing.declaration.exclusive != queue.exclusive =>
            {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    queue.name
                );
                Err(self.fail(&mut state, reason))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueEntry {
                        declaration: queue.clone(),
                        messages: VecDeque::new(),
                        subscribers: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &BindingOptions,
    ) -> Result<(), anyhow::Error> {
        self.broker.pause().await;
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{queue}'");
            return Err(self.fail(&mut state, reason));
        }
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - no exchange '{exchange}'");
            return Err(self.fail(&mut state, reason));
        }
        let triple = (
            exchange.to_owned(),
            queue.to_owned(),
            binding.routing_key.clone(),
        );
        if !state.bindings.contains(&triple) {
            state.bindings.push(triple);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<PublishOutcome, anyhow::Error> {
        self.broker.pause().await;
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - no exchange '{exchange}'");
            return Err(self.fail(&mut state, reason));
        }
        let message = PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: payload.to_vec(),
            properties,
        };
        state.published.push(message.clone());

        let queues = state.route(exchange, routing_key);
        if queues.is_empty() && mandatory {
            return Ok(PublishOutcome::Returned(ReturnedMessage {
                exchange: message.exchange,
                routing_key: message.routing_key,
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".into(),
                data: message.data,
            }));
        }
        for queue in queues {
            state.enqueue(&queue, message.clone());
        }
        Ok(if self.confirms {
            PublishOutcome::Acked
        } else {
            PublishOutcome::Sent
        })
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.broker.pause().await;
        self.ensure_open()
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
    ) -> Result<DeliveryStream, anyhow::Error> {
        self.broker.pause().await;
        self.ensure_open()?;
        let mut state = self.broker.state();
        let (connection_id, channel_id) = (self.connection_id, self.channel_id);
        let duplicate_tag = state.queues.values().any(|q| {
            q.subscribers.iter().any(|s| {
                s.connection_id == connection_id
                    && s.channel_id == channel_id
                    && s.tag == options.tag
            })
        });
        if duplicate_tag {
            let reason = format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", options.tag);
            return Err(self.fail(&mut state, reason));
        }
        let Some(entry) = state.queues.get_mut(queue) else {
            let reason = format!("NOT_FOUND - no queue '{queue}'");
            return Err(self.fail(&mut state, reason));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        entry.subscribers.push_back(Subscriber {
            connection_id,
            channel_id,
            tag: options.tag.clone(),
            sender,
        });
        let backlog: Vec<_> = entry.messages.drain(..).collect();
        for message in backlog {
            state.enqueue(queue, message);
        }

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        let (connection_id, channel_id) = (self.connection_id, self.channel_id);
        self.broker.state().drop_subscribers(|s| {
            s.connection_id == connection_id && s.channel_id == channel_id && s.tag == consumer_tag
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        self.open.store(false, Ordering::SeqCst);
        let (connection_id, channel_id) = (self.connection_id, self.channel_id);
        state.drop_subscribers(|s| s.connection_id == connection_id && s.channel_id == channel_id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.connection_closed.load(Ordering::SeqCst)
    }
}

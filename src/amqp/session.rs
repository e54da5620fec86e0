//! Declarative descriptions of the topology a channel must have before it can be used.
//!
//! A [`Session`] bundles an exchange, a queue and the options used to bind them and to consume
//! from the queue. It is pure data: channels read it to declare topology, the pool reads it to
//! derive channel keys.
use lapin::types::FieldTable;
pub use lapin::ExchangeKind;

/// A broker-side routing entity messages are published to.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    /// The exchange name. The empty string is the broker's default exchange.
    pub name: String,
    pub kind: ExchangeKind,
    /// Durable exchanges survive broker restarts.
    pub durable: bool,
    /// The exchange is deleted once its last binding is removed.
    pub auto_delete: bool,
    /// Internal exchanges do not accept publishings from clients.
    pub internal: bool,
    /// Declare without waiting for the broker to confirm.
    pub no_wait: bool,
    pub args: FieldTable,
}

impl Exchange {
    /// A transient, non-internal exchange of the given kind.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            args: FieldTable::default(),
        }
    }

    /// Make the exchange survive broker restarts.
    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: FieldTable) -> Self {
        self.args = args;
        self
    }
}

/// A broker-side buffer messages are consumed from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Exclusive queues are only accessible by the connection that declared them.
    pub exclusive: bool,
    pub no_wait: bool,
    pub args: FieldTable,
}

impl Queue {
    /// A transient, shared queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: FieldTable) -> Self {
        self.args = args;
        self
    }
}

/// How a queue is bound to an exchange, and the routing key producers publish with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindingOptions {
    pub routing_key: String,
    pub no_wait: bool,
    pub args: FieldTable,
}

impl BindingOptions {
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }
}

/// Options used when subscribing to a queue.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsumerOptions {
    /// Identifies the subscription on its channel.
    /// Left empty, a random tag is generated when consumption starts.
    pub tag: String,
    /// The broker considers deliveries acknowledged as soon as they are sent.
    pub auto_ack: bool,
    pub exclusive: bool,
    /// Do not receive messages published on the same connection.
    pub no_local: bool,
    pub no_wait: bool,
    pub args: FieldTable,
}

impl ConsumerOptions {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }
}

/// The topology a channel must have before use.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    exchange: Exchange,
    queue: Queue,
    binding: BindingOptions,
    consumer: ConsumerOptions,
}

impl Session {
    /// A session used to publish: only the exchange and the routing key matter.
    pub fn for_producer(exchange: Exchange, binding: BindingOptions) -> Self {
        Self {
            exchange,
            queue: Queue::default(),
            binding,
            consumer: ConsumerOptions::default(),
        }
    }

    /// A session used to consume: the queue is declared and bound to the exchange.
    pub fn for_consumer(
        exchange: Exchange,
        queue: Queue,
        binding: BindingOptions,
        consumer: ConsumerOptions,
    ) -> Self {
        Self {
            exchange,
            queue,
            binding,
            consumer,
        }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn binding(&self) -> &BindingOptions {
        &self.binding
    }

    pub fn consumer_options(&self) -> &ConsumerOptions {
        &self.consumer
    }

    /// Key identifying a consumer's channel: exchange, routing key and queue.
    pub fn consumer_key(&self) -> String {
        format!(
            "{}{}{}",
            self.exchange.name, self.binding.routing_key, self.queue.name
        )
    }

    /// Key identifying a producer's channel: routing key and exchange, prefixed by the
    /// caller-supplied uniqueness tag when there is one.
    pub fn producer_key(&self, unique: Option<&str>) -> String {
        format!(
            "{}{}{}",
            unique.unwrap_or_default(),
            self.binding.routing_key,
            self.exchange.name
        )
    }

    /// A copy of this session using `tag` as consumer tag.
    pub(crate) fn with_consumer_tag(&self, tag: String) -> Self {
        let mut session = self.clone();
        session.consumer.tag = tag;
        session
    }
}

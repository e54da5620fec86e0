//! `warren` keeps a bounded set of RabbitMQ connections and multiplexed channels, split between
//! publishing and consuming, and hands them out to long-lived producers and consumers.
//!
//! [`Pool`](crate::pool::Pool) owns the connections. [`Producer`](crate::publishers::Producer)
//! and [`Consumer`](crate::consumers::Consumer) are the best starting points to learn how to
//! publish and consume through it.
//!
//! Everything talks to the broker through the [`Transport`](crate::amqp::Transport) trait:
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) dials a real RabbitMQ via [`lapin`],
//! [`MemoryBroker`](crate::amqp::memory::MemoryBroker) keeps everything in-process.

pub mod consumers;
pub mod publishers;

pub mod amqp;
pub mod pool;

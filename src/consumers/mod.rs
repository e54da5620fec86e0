//! Long-running subscriptions served by the pool.
//!
//! A [`Consumer`] acquires a consumer channel, declares its queue and binding, then feeds every
//! delivery to a [`DeliveryHandler`]. When the connection is lost, registered
//! [`CloseHandler`]s run; [`Consumer::register_auto_reconnection`] installs one that
//! resubscribes on a fresh connection.
mod consumer;
mod handler;
mod incoming_message;
mod reconnect;

pub use consumer::{Consumer, DEFAULT_PREFETCH_COUNT};
pub use handler::{CloseHandler, ConnectionClosed, DeliveryHandler};
pub use incoming_message::Delivery;
pub use reconnect::Retries;

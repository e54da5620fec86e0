//! A bounded pool of broker connections and the channels multiplexed on them.
//!
//! The pool keeps two kinds of connections apart: producer connections, whose channels are used
//! to publish, and consumer connections, whose channels run subscriptions. Limits apply to:
//! - the number of live connections, both roles included;
//! - the number of channels on each connection, per role;
//! - the number of idle channels kept around for reuse.
//!
//! Pool and connection state are guarded by locks whose acquisition fails with
//! [`Error::LockTimeout`] after a configurable budget instead of hanging.
//!
//! ```rust
//! use warren::amqp::configuration::Settings;
//! use warren::pool::{Pool, Role};
//!
//! // Function for asyncness.
//! async fn example(settings: Settings) -> Result<(), warren::pool::Error> {
//!     let pool = Pool::from_settings(&settings).await?;
//!
//!     // One producer connection is opened eagerly, holding one idle channel.
//!     let producers = pool.connections(Role::Producer).await?;
//!     assert_eq!(producers[0].idle, 1);
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;
mod lock;
mod manager;

pub(crate) use channel::ChannelLease;
pub use connection::{Connection, ConnectionStats, Role};
pub use error::Error;
pub use manager::{Pool, PoolBuilder};

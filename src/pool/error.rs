use std::time::Duration;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The broker could not be reached, or refused the connection.
    #[error("Failed to open a connection to the broker")]
    Dial(#[source] anyhow::Error),
    #[error("Failed to open a channel on connection {connection}")]
    ChannelOpen {
        connection: u64,
        #[source]
        source: anyhow::Error,
    },
    /// Declaring or binding the session topology failed, e.g. because an exchange already exists
    /// with a different type.
    #[error("Failed to declare the topology for channel `{key}`")]
    Topology {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to subscribe to queue `{queue}`")]
    Subscribe {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to publish a message")]
    Publish(#[source] anyhow::Error),
    /// Another caller already holds a channel under the same key on the same connection.
    #[error("A channel keyed `{0}` is already in use on this connection")]
    DuplicateKey(String),
    /// Every connection is full and no new one may be opened.
    #[error("The pool is at capacity: {0} connections are open and all their channels are in use")]
    CapacityExceeded(usize),
    #[error("Timed out after {budget:?} waiting for the {what} lock")]
    LockTimeout {
        budget: Duration,
        what: &'static str,
    },
    #[error("No channel keyed `{key}` is in use on connection {connection}")]
    KeyNotFound { key: String, connection: u64 },
    /// The producer or consumer does not hold a channel.
    #[error("No channel is currently held")]
    NotBound,
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Dial(_) | Self::CapacityExceeded(_) | Self::LockTimeout { .. }
        )
    }
}

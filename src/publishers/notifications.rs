//! Background delivery of publish outcomes to user callbacks.
use crate::amqp::transport::ReturnedMessage;
use tokio::sync::mpsc::{self, UnboundedSender};

/// What the broker answered to one publishing, in confirm mode.
///
/// Publishings are numbered per producer, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack(u64),
    Nack(u64),
}

impl Confirmation {
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Ack(sequence) | Self::Nack(sequence) => *sequence,
        }
    }
}

/// Run `callback` on its own task for every message sent down the returned channel.
pub(crate) fn listen<T, F>(callback: F) -> UnboundedSender<T>
where
    T: Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let (sender, mut receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            callback(message);
        }
    });
    sender
}

pub(crate) fn listen_returns<F>(callback: F) -> UnboundedSender<ReturnedMessage>
where
    F: Fn(ReturnedMessage) + Send + 'static,
{
    listen(callback)
}

pub(crate) fn listen_confirms<A, N>(ack: A, nack: N) -> UnboundedSender<Confirmation>
where
    A: Fn(u64) + Send + 'static,
    N: Fn(u64) + Send + 'static,
{
    listen(move |confirmation| match confirmation {
        Confirmation::Ack(sequence) => ack(sequence),
        Confirmation::Nack(sequence) => nack(sequence),
    })
}

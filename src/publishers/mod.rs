//! Facilities to publish messages to a RabbitMq exchange. Check out [`Producer`] as a starting point.
mod notifications;
mod producer;

pub use notifications::Confirmation;
pub use producer::Producer;

//! Broker consumer implementations.

mod queue;
mod socket;

pub use self::queue::{QueueConsumer, QueueProducer};
pub use self::socket::SocketConsumer;

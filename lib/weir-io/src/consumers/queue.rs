//! In-memory queue consumer.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use weir_core::broker::{AckHandle, BrokerConsumer, ConsumedMessage, SubscriptionSpec};
use weir_core::collections::FastHashSet;
use weir_error::{generic_error, GenericError};

/// Producer half of an in-memory queue.
///
/// Cloneable; publishing blocks while the queue is full.
#[derive(Clone)]
pub struct QueueProducer {
    sender: mpsc::Sender<Bytes>,
}

impl QueueProducer {
    /// Publishes one payload to the queue.
    ///
    /// # Errors
    ///
    /// If the consumer half has been dropped, an error is returned.
    pub async fn publish<P>(&self, payload: P) -> Result<(), GenericError>
    where
        P: Into<Bytes>,
    {
        self.sender
            .send(payload.into())
            .await
            .map_err(|_| generic_error!("queue consumer has been dropped"))
    }
}

/// A [`BrokerConsumer`] backed by an in-memory bounded queue.
///
/// Used by tests and embedded setups where no external broker exists.
/// Delivered messages are tracked until acknowledged; there is no redelivery.
pub struct QueueConsumer {
    inbox: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    next_id: AtomicU64,
    in_flight: Mutex<FastHashSet<u64>>,
    acked: AtomicU64,
}

impl QueueConsumer {
    /// Creates a connected producer/consumer pair with the given queue
    /// capacity.
    pub fn pair(subscription: &SubscriptionSpec, capacity: usize) -> (QueueProducer, QueueConsumer) {
        debug!(
            subscription = %subscription.subscription_name,
            consumer = %subscription.consumer_name,
            topics = ?subscription.topics,
            "Created in-memory queue consumer."
        );

        let (sender, receiver) = mpsc::channel(capacity);
        let producer = QueueProducer { sender };
        let consumer = QueueConsumer {
            inbox: tokio::sync::Mutex::new(receiver),
            next_id: AtomicU64::new(0),
            in_flight: Mutex::new(FastHashSet::default()),
            acked: AtomicU64::new(0),
        };

        (producer, consumer)
    }

    /// Number of delivered but not yet acknowledged messages.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Total messages acknowledged so far.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerConsumer for QueueConsumer {
    async fn next_message(&self) -> Option<ConsumedMessage> {
        let payload = self.inbox.lock().await.recv().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().unwrap().insert(id);

        Some(ConsumedMessage {
            payload,
            ack: AckHandle::new(id),
        })
    }

    async fn ack(&self, handle: AckHandle) -> Result<(), GenericError> {
        if self.in_flight.lock().unwrap().remove(&handle.id()) {
            self.acked.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(generic_error!(
                "unknown or already acknowledged message {}",
                handle.id()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription() -> SubscriptionSpec {
        SubscriptionSpec {
            topics: vec!["telemetry/raw".to_string()],
            subscription_name: "weir-aggregator".to_string(),
            consumer_name: "weir".to_string(),
            delivery_mode: Default::default(),
            initial_position: Default::default(),
        }
    }

    #[tokio::test]
    async fn delivers_published_payloads_in_order() {
        let (producer, consumer) = QueueConsumer::pair(&subscription(), 8);

        producer.publish(&b"first"[..]).await.unwrap();
        producer.publish(&b"second"[..]).await.unwrap();

        let first = consumer.next_message().await.unwrap();
        let second = consumer.next_message().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"first");
        assert_eq!(second.payload.as_ref(), b"second");
    }

    #[tokio::test]
    async fn ack_clears_in_flight_tracking() {
        let (producer, consumer) = QueueConsumer::pair(&subscription(), 8);

        producer.publish(&b"payload"[..]).await.unwrap();
        let message = consumer.next_message().await.unwrap();
        assert_eq!(consumer.in_flight(), 1);

        consumer.ack(message.ack).await.unwrap();
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(consumer.acked(), 1);
    }

    #[tokio::test]
    async fn double_ack_is_an_error() {
        let (producer, consumer) = QueueConsumer::pair(&subscription(), 8);

        producer.publish(&b"payload"[..]).await.unwrap();
        let message = consumer.next_message().await.unwrap();

        consumer.ack(message.ack).await.unwrap();
        assert!(consumer.ack(message.ack).await.is_err());
    }

    #[tokio::test]
    async fn stream_closes_when_producer_drops() {
        let (producer, consumer) = QueueConsumer::pair(&subscription(), 8);
        drop(producer);

        assert!(consumer.next_message().await.is_none());
    }
}

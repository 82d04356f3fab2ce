//! TCP socket consumer.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};
use weir_core::broker::{AckHandle, BrokerConsumer, ConsumedMessage, SubscriptionSpec};
use weir_core::collections::FastHashMap;
use weir_error::{generic_error, ErrorContext as _, GenericError};

const MAX_LINE_BYTES: usize = 1024 * 1024;

type PendingAcks = Arc<Mutex<FastHashMap<u64, OwnedSemaphorePermit>>>;

/// A [`BrokerConsumer`] fed by peers over TCP.
///
/// Each connection carries newline-delimited payloads. Publish time is
/// receipt time, and redelivery is the peer's concern: acknowledging a
/// message only releases its in-flight permit, so a peer that outruns the
/// pipeline is paused at `max_in_flight` unacknowledged messages per
/// connection.
///
/// ## Missing
///
/// - Graceful shutdown (dropping the consumer stops the accept loop, but
///   established connections linger until the peer closes or a send fails)
pub struct SocketConsumer {
    inbox: tokio::sync::Mutex<mpsc::Receiver<ConsumedMessage>>,
    pending: PendingAcks,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl SocketConsumer {
    /// Binds a listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// If the listen address cannot be bound, an error is returned.
    pub async fn bind(
        listen_addr: SocketAddr, subscription: &SubscriptionSpec, queue_capacity: usize, max_in_flight: usize,
    ) -> Result<Self, GenericError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_error_context(|| format!("failed to bind socket consumer to {}", listen_addr))?;
        let local_addr = listener
            .local_addr()
            .error_context("failed to query socket consumer local address")?;

        info!(
            listen_addr = %local_addr,
            subscription = %subscription.subscription_name,
            consumer = %subscription.consumer_name,
            topics = ?subscription.topics,
            "Socket consumer started."
        );

        let (sender, receiver) = mpsc::channel(queue_capacity);
        let pending: PendingAcks = Arc::new(Mutex::new(FastHashMap::default()));
        let next_id = Arc::new(AtomicU64::new(0));

        let accept_pending = Arc::clone(&pending);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Connection accepted.");

                        let sender = sender.clone();
                        let pending = Arc::clone(&accept_pending);
                        let next_id = Arc::clone(&next_id);
                        tokio::spawn(drive_connection(stream, peer, sender, pending, next_id, max_in_flight));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection.");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            inbox: tokio::sync::Mutex::new(receiver),
            pending,
            local_addr,
            accept_task,
        })
    }

    /// Returns the bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for SocketConsumer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl BrokerConsumer for SocketConsumer {
    async fn next_message(&self) -> Option<ConsumedMessage> {
        self.inbox.lock().await.recv().await
    }

    async fn ack(&self, handle: AckHandle) -> Result<(), GenericError> {
        // Dropping the permit lets the owning connection read another frame.
        match self.pending.lock().unwrap().remove(&handle.id()) {
            Some(_permit) => Ok(()),
            None => Err(generic_error!(
                "unknown or already acknowledged message {}",
                handle.id()
            )),
        }
    }
}

async fn drive_connection(
    stream: TcpStream, peer: SocketAddr, sender: mpsc::Sender<ConsumedMessage>, pending: PendingAcks,
    next_id: Arc<AtomicU64>, max_in_flight: usize,
) {
    let limiter = Arc::new(Semaphore::new(max_in_flight));
    let mut frames = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    while let Some(result) = frames.next().await {
        let line = match result {
            Ok(line) => line,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to read frame. Closing connection.");
                break;
            }
        };

        let permit = match Arc::clone(&limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        pending.lock().unwrap().insert(id, permit);

        let message = ConsumedMessage {
            payload: Bytes::from(line.into_bytes()),
            ack: AckHandle::new(id),
        };
        if sender.send(message).await.is_err() {
            break;
        }
    }

    debug!(%peer, "Connection closed.");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt as _;
    use tokio::time::timeout;

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

    async fn bind_consumer(max_in_flight: usize) -> SocketConsumer {
        SocketConsumer::bind("127.0.0.1:0".parse().unwrap(), &subscription(), 16, max_in_flight)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn delivers_newline_delimited_payloads() {
        let consumer = bind_consumer(8).await;

        let mut peer = TcpStream::connect(consumer.local_addr()).await.unwrap();
        peer.write_all(b"{\"a\":1}\n{\"b\":2}\n").await.unwrap();

        let first = consumer.next_message().await.unwrap();
        let second = consumer.next_message().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"{\"a\":1}");
        assert_eq!(second.payload.as_ref(), b"{\"b\":2}");

        consumer.ack(first.ack).await.unwrap();
        consumer.ack(second.ack).await.unwrap();
    }

    #[tokio::test]
    async fn ack_releases_the_in_flight_permit() {
        let consumer = bind_consumer(1).await;

        let mut peer = TcpStream::connect(consumer.local_addr()).await.unwrap();
        peer.write_all(b"first\nsecond\n").await.unwrap();

        let first = consumer.next_message().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"first");

        // The single permit is held, so the second frame cannot be delivered
        // until the first is acknowledged.
        let starved = timeout(Duration::from_millis(50), consumer.next_message()).await;
        assert!(starved.is_err());

        consumer.ack(first.ack).await.unwrap();
        let second = consumer.next_message().await.unwrap();
        assert_eq!(second.payload.as_ref(), b"second");
    }

    #[tokio::test]
    async fn double_ack_is_an_error() {
        let consumer = bind_consumer(8).await;

        let mut peer = TcpStream::connect(consumer.local_addr()).await.unwrap();
        peer.write_all(b"payload\n").await.unwrap();

        let message = consumer.next_message().await.unwrap();
        consumer.ack(message.ack).await.unwrap();
        assert!(consumer.ack(message.ack).await.is_err());
    }

    #[tokio::test]
    async fn serves_multiple_connections() {
        let consumer = bind_consumer(8).await;

        let mut first_peer = TcpStream::connect(consumer.local_addr()).await.unwrap();
        let mut second_peer = TcpStream::connect(consumer.local_addr()).await.unwrap();
        first_peer.write_all(b"from-first\n").await.unwrap();
        second_peer.write_all(b"from-second\n").await.unwrap();

        let mut payloads = vec![
            consumer.next_message().await.unwrap(),
            consumer.next_message().await.unwrap(),
        ]
        .into_iter()
        .map(|message| String::from_utf8(message.payload.to_vec()).unwrap())
        .collect::<Vec<_>>();
        payloads.sort();

        assert_eq!(payloads, vec!["from-first".to_string(), "from-second".to_string()]);
    }
}

//! Graceful shutdown signalling.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Waits for the coordinator to signal shutdown.
///
/// Completes when shutdown is triggered, or when the coordinator is dropped
/// without triggering it, so components never wait on a signal that can no
/// longer arrive.
pub struct ComponentShutdownHandle {
    receiver: oneshot::Receiver<()>,
}

impl Future for ComponentShutdownHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|_| ())
    }
}

/// Hands out shutdown handles and triggers them all at once.
#[derive(Default)]
pub struct ComponentShutdownCoordinator {
    senders: Vec<oneshot::Sender<()>>,
}

impl ComponentShutdownCoordinator {
    /// Registers another component, returning the handle it should wait on.
    pub fn register(&mut self) -> ComponentShutdownHandle {
        let (sender, receiver) = oneshot::channel();
        self.senders.push(sender);
        ComponentShutdownHandle { receiver }
    }

    /// Signals shutdown to every registered component.
    pub fn shutdown(self) {
        for sender in self.senders {
            let _ = sender.send(());
        }
    }
}

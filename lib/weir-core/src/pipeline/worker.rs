//! Ingestion workers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::broker::{AckHandle, ConsumedMessage};
use crate::pipeline::shutdown::ComponentShutdownHandle;
use crate::registry::Registry;
use crate::telemetry::PipelineTelemetry;

/// The inbound queue end shared by the worker pool.
///
/// Workers contend on the mutex only for the handoff of a single message;
/// processing happens after the guard is released.
pub(crate) type SharedInbound = Arc<Mutex<mpsc::Receiver<ConsumedMessage>>>;

pub(crate) struct IngestionWorker {
    id: usize,
    registry: Arc<Registry>,
    telemetry: PipelineTelemetry,
    inbound: SharedInbound,
    outbound: mpsc::Sender<AckHandle>,
}

impl IngestionWorker {
    pub fn new(
        id: usize,
        registry: Arc<Registry>,
        telemetry: PipelineTelemetry,
        inbound: SharedInbound,
        outbound: mpsc::Sender<AckHandle>,
    ) -> Self {
        Self {
            id,
            registry,
            telemetry,
            inbound,
            outbound,
        }
    }

    pub async fn run(self, mut shutdown: ComponentShutdownHandle) {
        debug!(worker = self.id, "Ingestion worker started.");

        loop {
            let message = tokio::select! {
                _ = &mut shutdown => break,
                message = next_message(&self.inbound) => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.process(message).await;
        }

        debug!(worker = self.id, "Ingestion worker stopped.");
    }

    async fn process(&self, message: ConsumedMessage) {
        let total = self.telemetry.stage_timer();

        self.handle_payload(&message.payload);

        // Whatever classification made of the payload, the message itself is
        // done: acknowledge it exactly once.
        if self.outbound.send(message.ack).await.is_err() {
            debug!(worker = self.id, "Acknowledgement queue closed.");
        }

        self.telemetry.observe_process(total);
    }

    fn handle_payload(&self, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(err) => {
                debug!(worker = self.id, %err, "Discarded undecodable message.");
                return;
            }
        };

        let Some(hostname) = value.get("hstnm").and_then(Value::as_str) else {
            debug!(worker = self.id, "Discarded message without a hostname.");
            return;
        };

        let classify = self.telemetry.stage_timer();
        let events = self.registry.classify(&value);
        self.telemetry.observe_classify(classify);

        let update = self.telemetry.stage_timer();
        for event in &events {
            self.telemetry.mark_extracted(&event.namespace, 1);
            self.registry.apply(event, hostname);
        }
        self.telemetry.observe_update(update);
    }
}

async fn next_message(inbound: &SharedInbound) -> Option<ConsumedMessage> {
    inbound.lock().await.recv().await
}

//! Acknowledgement draining.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::broker::{AckHandle, BrokerConsumer};
use crate::telemetry::PipelineTelemetry;

const REPORT_PERIOD: Duration = Duration::from_secs(60);

/// Drains the outbound queue, acknowledging messages with the broker.
///
/// The acknowledger has no shutdown handle on purpose: it runs until every
/// worker has dropped its sender, which guarantees acks queued during
/// shutdown still reach the broker.
pub(crate) struct Acknowledger {
    consumer: Arc<dyn BrokerConsumer>,
    outbound: mpsc::Receiver<AckHandle>,
    telemetry: PipelineTelemetry,
}

impl Acknowledger {
    pub fn new(
        consumer: Arc<dyn BrokerConsumer>,
        outbound: mpsc::Receiver<AckHandle>,
        telemetry: PipelineTelemetry,
    ) -> Self {
        Self {
            consumer,
            outbound,
            telemetry,
        }
    }

    pub async fn run(self) {
        debug!("Acknowledger started.");

        let Self {
            consumer,
            mut outbound,
            telemetry,
        } = self;

        let mut report = interval_at(Instant::now() + REPORT_PERIOD, REPORT_PERIOD);
        let mut acked_since_report = 0u64;

        loop {
            tokio::select! {
                handle = outbound.recv() => match handle {
                    Some(handle) => {
                        acknowledge(consumer.as_ref(), &telemetry, handle, &mut acked_since_report).await;
                    }
                    None => break,
                },
                _ = report.tick() => {
                    info!(
                        acked = acked_since_report,
                        period_secs = REPORT_PERIOD.as_secs(),
                        "Acknowledgement throughput."
                    );
                    acked_since_report = 0;
                }
            }
        }

        debug!("Acknowledger stopped.");
    }
}

async fn acknowledge(
    consumer: &dyn BrokerConsumer,
    telemetry: &PipelineTelemetry,
    handle: AckHandle,
    acked: &mut u64,
) {
    match consumer.ack(handle).await {
        Ok(()) => {
            telemetry.mark_processed();
            *acked += 1;
        }
        Err(err) => {
            warn!(%err, "Failed to acknowledge message.");
        }
    }
}

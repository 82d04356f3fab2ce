//! Pipeline assembly.
//!
//! Wires the broker reader, the worker pool, the ticker, and the
//! acknowledger together around two bounded queues: consumed messages flow
//! inbound to the workers, acknowledgement handles flow outbound to the
//! broker. Backpressure from a slow stage propagates through the queues back
//! to the broker reader.

mod acker;
mod shutdown;
mod ticker;
mod worker;

pub use self::shutdown::{ComponentShutdownCoordinator, ComponentShutdownHandle};

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use self::acker::Acknowledger;
use self::ticker::Ticker;
use self::worker::IngestionWorker;
use crate::broker::{BrokerConsumer, ConsumedMessage};
use crate::config::PipelineConfiguration;
use crate::registry::Registry;
use weir_error::{ErrorContext as _, GenericError};

/// Handles to every spawned pipeline task.
pub struct Pipeline {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Spawns the pipeline tasks onto the current runtime.
    ///
    /// Every task except the acknowledger registers with `coordinator`; the
    /// acknowledger instead runs until the workers drop their queue ends, so
    /// acks queued during shutdown still drain.
    pub fn spawn(
        registry: Arc<Registry>,
        consumer: Arc<dyn BrokerConsumer>,
        config: &PipelineConfiguration,
        coordinator: &mut ComponentShutdownCoordinator,
    ) -> Result<Self, GenericError> {
        let worker_count = config.worker_count()?;
        let capacity = config.queue_capacity()?;
        let period = registry
            .settings()
            .granularity
            .to_std()
            .error_context("Window granularity must be positive.")?;
        let telemetry = registry.telemetry();

        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let inbound = Arc::new(Mutex::new(inbound_rx));

        let mut tasks = Vec::with_capacity(worker_count + 3);

        tasks.push((
            "reader",
            tokio::spawn(run_reader(
                Arc::clone(&consumer),
                inbound_tx,
                coordinator.register(),
            )),
        ));

        for id in 0..worker_count {
            let worker = IngestionWorker::new(
                id,
                Arc::clone(&registry),
                telemetry.clone(),
                Arc::clone(&inbound),
                outbound_tx.clone(),
            );
            tasks.push(("worker", tokio::spawn(worker.run(coordinator.register()))));
        }
        drop(outbound_tx);

        let ticker = Ticker::new(Arc::clone(&registry), period);
        tasks.push(("ticker", tokio::spawn(ticker.run(coordinator.register()))));

        let acknowledger = Acknowledger::new(consumer, outbound_rx, telemetry);
        tasks.push(("acknowledger", tokio::spawn(acknowledger.run())));

        debug!(
            workers = worker_count,
            queue_capacity = capacity,
            "Pipeline started."
        );

        Ok(Self { tasks })
    }

    /// Waits for every pipeline task to finish.
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(err) = task.await {
                error!(task = name, %err, "Pipeline task terminated abnormally.");
            }
        }
        debug!("Pipeline stopped.");
    }
}

async fn run_reader(
    consumer: Arc<dyn BrokerConsumer>,
    inbound: mpsc::Sender<ConsumedMessage>,
    mut shutdown: ComponentShutdownHandle,
) {
    debug!("Broker reader started.");

    loop {
        let message = tokio::select! {
            _ = &mut shutdown => break,
            message = consumer.next_message() => match message {
                Some(message) => message,
                None => {
                    debug!("Broker stream closed.");
                    break;
                }
            },
        };
        if inbound.send(message).await.is_err() {
            break;
        }
    }

    debug!("Broker reader stopped.");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{TimeDelta, Utc};
    use serde_json::json;

    use super::*;
    use crate::broker::AckHandle;
    use crate::catalog::Catalog;
    use crate::config::AggregationSettings;
    use crate::data_model::GaugePolicy;
    use crate::router::{classification_functions, FilterRoot};
    use crate::sink::MetricSink;
    use crate::store::SharedClock;
    use crate::telemetry::PipelineTelemetry;
    use crate::testing::RecordingSink;
    use weir_expr::Interpreter;

    struct StubConsumer {
        inbox: Mutex<mpsc::UnboundedReceiver<ConsumedMessage>>,
        acked: std::sync::Mutex<Vec<u64>>,
    }

    impl StubConsumer {
        fn new() -> (mpsc::UnboundedSender<ConsumedMessage>, Arc<Self>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let consumer = Arc::new(Self {
                inbox: Mutex::new(receiver),
                acked: std::sync::Mutex::new(Vec::new()),
            });
            (sender, consumer)
        }

        fn acked(&self) -> Vec<u64> {
            self.acked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerConsumer for StubConsumer {
        async fn next_message(&self) -> Option<ConsumedMessage> {
            self.inbox.lock().await.recv().await
        }

        async fn ack(&self, handle: AckHandle) -> Result<(), GenericError> {
            self.acked.lock().unwrap().push(handle.id());
            Ok(())
        }
    }

    fn build_registry(dir: &std::path::Path, sink: Arc<RecordingSink>) -> Arc<Registry> {
        std::fs::write(
            dir.join("orders.yaml"),
            "namespace: orders\ngroup: payments\nservice: checkout\nfilter: orders.flt\nmetrics:\n  requests_total:\n    type: counter\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("orders.flt"),
            r#"event("orders"; .ts; { requests_total: .cnt })"#,
        )
        .unwrap();

        let catalog = Arc::new(Catalog::load_dir(dir).unwrap());
        let engine = Interpreter::new(classification_functions());
        let filter_root = FilterRoot::build(
            Arc::clone(&catalog),
            &engine,
            r#"if .dmn == "payments" then ["payments"] else [] end"#,
        )
        .unwrap();
        let settings = AggregationSettings {
            granularity: TimeDelta::seconds(30),
            cardinality: 3,
            shift: 3,
            gauge_policy: GaugePolicy::default(),
            idle_limit: 0,
        };
        let clock = Arc::new(SharedClock::aligned(Utc::now(), TimeDelta::seconds(30)));
        let telemetry =
            PipelineTelemetry::register(Arc::clone(&sink) as Arc<dyn MetricSink>, false).unwrap();

        Arc::new(
            Registry::build(catalog, filter_root, sink, telemetry, settings, clock).unwrap(),
        )
    }

    fn message(id: u64, payload: serde_json::Value) -> ConsumedMessage {
        ConsumedMessage {
            payload: Bytes::from(serde_json::to_vec(&payload).unwrap()),
            ack: AckHandle::new(id),
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn relevant_messages_update_windows_and_are_acked() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let registry = build_registry(dir.path(), Arc::clone(&sink));
        let (sender, consumer) = StubConsumer::new();

        let mut coordinator = ComponentShutdownCoordinator::default();
        let pipeline = Pipeline::spawn(
            Arc::clone(&registry),
            Arc::clone(&consumer) as Arc<dyn BrokerConsumer>,
            &PipelineConfiguration::default(),
            &mut coordinator,
        )
        .unwrap();

        let t = registry.clock().now() + TimeDelta::seconds(15);
        sender
            .send(message(
                7,
                json!({
                    "dmn": "payments",
                    "hstnm": "node-1",
                    "ts": t.to_rfc3339(),
                    "cnt": 3,
                }),
            ))
            .unwrap();

        let probe = Arc::clone(&consumer);
        wait_until("the message to be acked", move || probe.acked() == vec![7]).await;
        assert_eq!(registry.window_count(), 1);

        coordinator.shutdown();
        pipeline.join().await;
    }

    #[tokio::test]
    async fn hostless_messages_are_acked_without_producing_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let registry = build_registry(dir.path(), Arc::clone(&sink));
        let (sender, consumer) = StubConsumer::new();

        let mut coordinator = ComponentShutdownCoordinator::default();
        let pipeline = Pipeline::spawn(
            Arc::clone(&registry),
            Arc::clone(&consumer) as Arc<dyn BrokerConsumer>,
            &PipelineConfiguration::default(),
            &mut coordinator,
        )
        .unwrap();

        let t = registry.clock().now() + TimeDelta::seconds(15);
        sender
            .send(message(
                1,
                json!({ "dmn": "payments", "ts": t.to_rfc3339(), "cnt": 3 }),
            ))
            .unwrap();

        let probe = Arc::clone(&consumer);
        wait_until("the message to be acked", move || probe.acked() == vec![1]).await;
        assert_eq!(registry.window_count(), 0);

        coordinator.shutdown();
        pipeline.join().await;
    }

    #[tokio::test]
    async fn irrelevant_messages_are_acked_without_producing_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let registry = build_registry(dir.path(), Arc::clone(&sink));
        let (sender, consumer) = StubConsumer::new();

        let mut coordinator = ComponentShutdownCoordinator::default();
        let pipeline = Pipeline::spawn(
            Arc::clone(&registry),
            Arc::clone(&consumer) as Arc<dyn BrokerConsumer>,
            &PipelineConfiguration::default(),
            &mut coordinator,
        )
        .unwrap();

        sender
            .send(message(
                1,
                json!({ "dmn": "logistics", "hstnm": "node-1", "cnt": 3 }),
            ))
            .unwrap();
        sender.send(message(2, json!("not an object"))).unwrap();

        let probe = Arc::clone(&consumer);
        wait_until("both messages to be acked", move || probe.acked().len() == 2).await;
        assert_eq!(registry.window_count(), 0);

        coordinator.shutdown();
        pipeline.join().await;
    }

    #[tokio::test]
    async fn pipeline_drains_when_the_broker_stream_closes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let registry = build_registry(dir.path(), Arc::clone(&sink));
        let (sender, consumer) = StubConsumer::new();

        let mut coordinator = ComponentShutdownCoordinator::default();
        let pipeline = Pipeline::spawn(
            Arc::clone(&registry),
            Arc::clone(&consumer) as Arc<dyn BrokerConsumer>,
            &PipelineConfiguration::default(),
            &mut coordinator,
        )
        .unwrap();

        let t = registry.clock().now() + TimeDelta::seconds(15);
        sender
            .send(message(
                9,
                json!({
                    "dmn": "payments",
                    "hstnm": "node-1",
                    "ts": t.to_rfc3339(),
                    "cnt": 1,
                }),
            ))
            .unwrap();
        drop(sender);

        // The reader, workers, and acknowledger wind down on their own once
        // the stream closes; the ticker still needs the explicit signal.
        let probe = Arc::clone(&consumer);
        wait_until("the queued message to drain", move || probe.acked() == vec![9]).await;

        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(5), pipeline.join())
            .await
            .expect("pipeline failed to stop");
    }
}

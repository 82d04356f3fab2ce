//! Broker consumer abstraction.
//!
//! The pipeline consumes messages through [`BrokerConsumer`] without caring
//! what transport sits behind it. Implementations hand out messages with an
//! opaque [`AckHandle`]; the pipeline guarantees every handle is acknowledged
//! exactly once, whether or not the message produced events.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use weir_error::GenericError;

fn default_subscription_name() -> String {
    "weir-aggregator".to_string()
}

fn default_consumer_name() -> String {
    "weir".to_string()
}

/// How the broker distributes messages among consumers of a subscription.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Messages are distributed round-robin across consumers.
    #[default]
    Shared,

    /// A single consumer owns the subscription.
    Exclusive,
}

/// Where a fresh subscription starts reading.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialPosition {
    /// Start at the oldest retained message.
    Earliest,

    /// Start at the head of the topic.
    #[default]
    Latest,
}

/// Subscription parameters, as handed to a consumer implementation.
///
/// Implementations honor what their transport supports and log the rest.
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionSpec {
    /// Topics to consume from.
    pub topics: Vec<String>,

    /// Name of the subscription, shared by cooperating consumers.
    #[serde(default = "default_subscription_name")]
    pub subscription_name: String,

    /// Name identifying this consumer within the subscription.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Distribution mode across consumers.
    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    /// Starting position for a fresh subscription.
    #[serde(default)]
    pub initial_position: InitialPosition,
}

/// Opaque acknowledgement token for one consumed message.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AckHandle(u64);

impl AckHandle {
    /// Creates a handle from a consumer-assigned identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The consumer-assigned identifier.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// One message pulled from the broker.
#[derive(Clone, Debug)]
pub struct ConsumedMessage {
    /// Raw message payload.
    pub payload: Bytes,

    /// Token to acknowledge the message with.
    pub ack: AckHandle,
}

/// A source of messages with acknowledgement.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Pulls the next message, or `None` once the stream is closed.
    async fn next_message(&self) -> Option<ConsumedMessage>;

    /// Acknowledges a previously consumed message.
    async fn ack(&self, handle: AckHandle) -> Result<(), GenericError>;
}

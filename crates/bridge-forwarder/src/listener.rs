//! Forward listener stages
//!
//! A forward endpoint handles each rabbit delivery through typed stages:
//!
//! ```text
//! DeadletteringListener ─► ForwardingListener
//!   (classify failure)        transform ─► send to SNS topic / SQS queue
//! ```

use async_trait::async_trait;
use bridge_core::metrics::ForwarderMetrics;
use bridge_core::prelude::*;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Handles one rabbit delivery
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, delivery: &Delivery) -> Result<()>;
}

/// Where a forward bridge sends to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmazonTarget {
    Topic(String),
    Queue(String),
}

impl AmazonTarget {
    /// Only SNS and SQS destinations can be forwarded to
    pub fn from_destination(destination: &Destination) -> Result<Self> {
        match destination {
            Destination::Sns(sns) => Ok(Self::Topic(sns.name.clone())),
            Destination::Sqs(sqs) => Ok(Self::Queue(sqs.name.clone())),
            Destination::Rabbit(rabbit) => Err(BridgeError::config(format!(
                "cannot forward to rabbit exchange '{}'",
                rabbit.exchange
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Topic(name) | Self::Queue(name) => name,
        }
    }
}

impl fmt::Display for AmazonTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(name) => write!(f, "sns:{name}"),
            Self::Queue(name) => write!(f, "sqs:{name}"),
        }
    }
}

/// Transforms a delivery and sends it to SNS or SQS
pub struct ForwardingListener {
    target: AmazonTarget,
    amazon: Arc<dyn AmazonClient>,
    transformer: Arc<dyn MessageTransformer>,
    metrics: ForwarderMetrics,
}

impl ForwardingListener {
    pub fn new(
        target: AmazonTarget,
        amazon: Arc<dyn AmazonClient>,
        transformer: Arc<dyn MessageTransformer>,
        metrics: ForwarderMetrics,
    ) -> Self {
        Self {
            target,
            amazon,
            transformer,
            metrics,
        }
    }

    pub fn target(&self) -> &AmazonTarget {
        &self.target
    }
}

#[async_trait]
impl MessageListener for ForwardingListener {
    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        let transformed = self.transformer.transform(&delivery.body_text())?;

        match &self.target {
            AmazonTarget::Topic(topic) => self.amazon.send_to_topic(topic, &transformed).await?,
            AmazonTarget::Queue(queue) => self.amazon.send_to_queue(queue, &transformed).await?,
        }

        debug!(
            delivery_tag = delivery.delivery_tag,
            target = %self.target,
            "Forwarded message"
        );
        self.metrics.record_forwarded(self.target.name());
        Ok(())
    }
}

//! Retry or dead-letter decision for failed forward deliveries

use crate::listener::MessageListener;
use async_trait::async_trait;
use bridge_core::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

/// What to do with a delivery whose forward attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    /// Let the consumer retry with backoff
    Retry,
    /// Route straight to the dead-letter queue
    DeadLetter,
}

/// Classify a failure.
///
/// Only SNS/SQS transport errors and generic messaging errors are retried,
/// and only while retries are enabled.
pub fn classify(error: &BridgeError, should_retry: bool) -> DeliveryDecision {
    if should_retry && error.is_retryable() {
        DeliveryDecision::Retry
    } else {
        DeliveryDecision::DeadLetter
    }
}

/// Wraps a listener, turning terminal failures into the dead-letter signal
pub struct DeadletteringListener {
    inner: Arc<dyn MessageListener>,
    should_retry: bool,
}

impl DeadletteringListener {
    pub fn new(inner: Arc<dyn MessageListener>, should_retry: bool) -> Self {
        Self {
            inner,
            should_retry,
        }
    }
}

#[async_trait]
impl MessageListener for DeadletteringListener {
    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        info!("Message received on {} / {}", delivery.exchange, delivery.queue);

        let Err(error) = self.inner.on_message(delivery).await else {
            return Ok(());
        };

        match classify(&error, self.should_retry) {
            DeliveryDecision::Retry => {
                warn!(error = %error, "A retryable error occurred.");
                Err(error)
            }
            DeliveryDecision::DeadLetter => Err(BridgeError::reject(error)),
        }
    }
}

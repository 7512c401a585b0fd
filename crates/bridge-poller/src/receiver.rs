//! SQS side of a reverse bridge

use bridge_core::prelude::*;
use bridge_core::PollerConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Long-polls one SQS queue and settles the messages it hands out
#[derive(Clone)]
pub struct SqsReceiver {
    amazon: Arc<dyn AmazonClient>,
    queue_name: String,
    queue_url: String,
    wait_time: Duration,
    max_messages: usize,
}

impl SqsReceiver {
    /// Resolve the queue url once; the receiver keeps it for its lifetime
    pub async fn resolve(
        amazon: Arc<dyn AmazonClient>,
        queue_name: &str,
        config: &PollerConfig,
    ) -> Result<Self> {
        let queue_url = amazon.resolve_queue_url(queue_name).await?;
        Ok(Self {
            amazon,
            queue_name: queue_name.to_string(),
            queue_url,
            wait_time: config.wait_time,
            max_messages: config.max_messages,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// One long-poll receive. Empty when the wait elapsed without arrivals.
    pub async fn receive(&self) -> Result<Vec<SqsMessage>> {
        let messages = self
            .amazon
            .receive(&self.queue_url, self.wait_time, self.max_messages)
            .await?;
        trace!(queue = %self.queue_name, count = messages.len(), "Receive returned");
        Ok(messages)
    }

    /// Remove a handled message
    pub async fn delete(&self, message: &SqsMessage) -> Result<()> {
        self.amazon
            .delete_message(&self.queue_url, &message.receipt_handle)
            .await
    }

    /// Make a message visible again straight away
    pub async fn release(&self, message: &SqsMessage) -> Result<()> {
        self.amazon
            .change_visibility(&self.queue_url, &message.receipt_handle, 0)
            .await
    }
}

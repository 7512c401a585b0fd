//! Rabbit consumer driving one forward endpoint
//!
//! Pulls deliveries from the endpoint queue, runs the listener chain under
//! the retry policy, then acks or rejects without requeue. A delivery whose
//! ack or reject the broker refused is reported as unsettled.

use crate::generator::ForwardEndpoint;
use crate::retry::RetryPolicy;
use bridge_core::error::{ErrorContext, ErrorContextExt};
use bridge_core::metrics::{error_type, ForwarderMetrics, LatencyTimer};
use bridge_core::prelude::*;
use bridge_core::RabbitConfig;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Final state of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    DeadLettered,
    /// The ack or reject failed; the broker still holds the delivery
    Unsettled,
}

pub struct ForwardConsumer {
    endpoint: ForwardEndpoint,
    rabbit: Arc<dyn RabbitClient>,
    retry: RetryPolicy,
    retry_enabled: bool,
    concurrency: usize,
    metrics: ForwarderMetrics,
}

impl ForwardConsumer {
    pub fn new(endpoint: ForwardEndpoint, rabbit: Arc<dyn RabbitClient>, config: &RabbitConfig) -> Self {
        let metrics = ForwarderMetrics::new(endpoint.id.clone());
        Self {
            endpoint,
            rabbit,
            retry: RetryPolicy::from(&config.retry),
            retry_enabled: config.retry.enabled,
            concurrency: config.listener.concurrency.max(1),
            metrics,
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &ForwardEndpoint {
        &self.endpoint
    }

    /// Consume until shutdown is signalled or the delivery stream ends.
    ///
    /// Deliveries already being handled when shutdown arrives run to completion.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let stream = self
            .rabbit
            .consume(&self.endpoint.queue, &self.endpoint.id)
            .await?;

        info!(
            listener = %self.endpoint.id,
            queue = %self.endpoint.queue,
            concurrency = self.concurrency,
            "Forward consumer started"
        );

        stream
            .take_until(shutdown_requested(shutdown))
            .for_each_concurrent(self.concurrency, |item| async move {
                match item {
                    Ok(delivery) => {
                        self.handle(delivery).await;
                    }
                    Err(e) => error!(listener = %self.endpoint.id, error = %e, "Delivery stream error"),
                }
            })
            .await;

        info!(listener = %self.endpoint.id, "Forward consumer stopped");
        Ok(())
    }

    /// Process one delivery to completion
    pub async fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        self.metrics.record_received();

        let timer = LatencyTimer::start(|elapsed| self.metrics.record_send_latency(elapsed));
        let result = self.deliver(&delivery).await;
        timer.stop();

        let ctx = ErrorContext::new("forward_consumer", "settle")
            .with_bridge(self.endpoint.id.clone())
            .with_message_id(delivery.delivery_tag.to_string());

        let (settled, outcome) = match result {
            Ok(()) => (self.rabbit.ack(&delivery).await, DeliveryOutcome::Acked),
            Err(e) => {
                warn!(
                    listener = %self.endpoint.id,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Dead-lettering delivery"
                );
                self.metrics.record_dead_lettered(error_type(&e));
                (
                    self.rabbit.reject(&delivery, false).await,
                    DeliveryOutcome::DeadLettered,
                )
            }
        };

        match settled.with_context(ctx) {
            Ok(()) => outcome,
            Err(e) => {
                self.metrics.record_settle_failed(error_type(&e));
                DeliveryOutcome::Unsettled
            }
        }
    }

    async fn deliver(&self, delivery: &Delivery) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.endpoint.listener.on_message(delivery).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_reject() => return Err(e),
                Err(e) if self.retry_enabled && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        listener = %self.endpoint.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying delivery"
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ForwardBridgeGenerator;
    use bridge_core::memory::{MemoryAmazon, MemoryRabbit};
    use bridge_core::{Bridge, ChainSpecEngine, RabbitFrom, SqsTo};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::watch;

    const QUEUE: &str = "orders-q";

    async fn consumer(rabbit: &MemoryRabbit, amazon: &MemoryAmazon, whitelist: bool) -> ForwardConsumer {
        let mut bridge = Bridge::new(
            Source::Rabbit(RabbitFrom {
                exchange: "orders".into(),
                queue_name: QUEUE.into(),
                routing_key: "order.#".into(),
            }),
            Destination::Sqs(SqsTo { name: "out".into() }),
        );
        if whitelist {
            bridge = bridge.with_whitelist(["id"]);
        }

        let endpoint = ForwardBridgeGenerator::new(
            Arc::new(rabbit.clone()),
            Arc::new(amazon.clone()),
            Arc::new(ChainSpecEngine),
            true,
        )
        .generate(0, &bridge)
        .await
        .unwrap();

        ForwardConsumer::new(endpoint, Arc::new(rabbit.clone()), &RabbitConfig::default())
            .with_retry(RetryPolicy::immediate(3))
    }

    async fn next_delivery(rabbit: &MemoryRabbit, body: &'static str) -> Delivery {
        rabbit
            .send("orders", "order.created", Bytes::from_static(body.as_bytes()))
            .await
            .unwrap();
        let mut stream = rabbit.consume(QUEUE, "test").await.unwrap();
        stream.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_queue("out").await;
        let consumer = consumer(&rabbit, &amazon, false).await;

        let delivery = next_delivery(&rabbit, r#"{"id":1}"#).await;
        assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::Acked);
        assert_eq!(amazon.queue_bodies("out").await, vec![r#"{"id":1}"#]);
        assert_eq!(rabbit.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_queue("out").await;
        amazon.fail_next_send(|| BridgeError::amazon("throttled")).await;
        amazon.fail_next_send(|| BridgeError::messaging("timeout")).await;
        let consumer = consumer(&rabbit, &amazon, false).await;

        let delivery = next_delivery(&rabbit, r#"{"id":1}"#).await;
        assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::Acked);
        assert_eq!(amazon.queue_bodies("out").await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_queue("out").await;
        for _ in 0..3 {
            amazon.fail_next_send(|| BridgeError::amazon("throttled")).await;
        }
        let consumer = consumer(&rabbit, &amazon, false).await;

        let delivery = next_delivery(&rabbit, r#"{"id":1}"#).await;
        assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::DeadLettered);
        assert!(amazon.queue_bodies("out").await.is_empty());

        let dead = rabbit.take_ready("orders-q-dead-letter").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body_text(), r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_queue("out").await;
        let consumer = consumer(&rabbit, &amazon, true).await;

        let delivery = next_delivery(&rabbit, "\"just a string\"").await;
        assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::DeadLettered);
        assert_eq!(rabbit.take_ready("orders-q-dead-letter").await.len(), 1);
    }

    fn unknown_delivery(body: &'static str) -> Delivery {
        Delivery {
            delivery_tag: 999,
            exchange: "orders".into(),
            routing_key: "order.created".into(),
            queue: QUEUE.into(),
            body: Bytes::from_static(body.as_bytes()),
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn test_failed_ack_is_unsettled() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_queue("out").await;
        let consumer = consumer(&rabbit, &amazon, false).await;

        // Never handed out by the broker, so it cannot be acked
        let delivery = unknown_delivery(r#"{"id":1}"#);
        assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::Unsettled);
        assert_eq!(amazon.queue_bodies("out").await, vec![r#"{"id":1}"#]);
    }

    #[tokio::test]
    async fn test_failed_reject_is_unsettled() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_queue("out").await;
        let consumer = consumer(&rabbit, &amazon, true).await;

        let delivery = unknown_delivery("\"just a string\"");
        assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::Unsettled);
        assert!(rabbit.take_ready("orders-q-dead-letter").await.is_empty());
    }

    #[tokio::test]
    async fn test_run_forwards_until_shutdown() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_queue("out").await;
        let consumer = Arc::new(consumer(&rabbit, &amazon, false).await);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            async move { consumer.run(rx).await }
        });

        for body in [r#"{"id":1}"#, r#"{"id":2}"#] {
            rabbit
                .send("orders", "order.created", Bytes::from_static(body.as_bytes()))
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if amazon.queue_bodies("out").await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            amazon.queue_bodies("out").await,
            vec![r#"{"id":1}"#, r#"{"id":2}"#]
        );

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

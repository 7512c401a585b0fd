//! One poll-convert-forward-acknowledge run for a reverse bridge

use crate::receiver::SqsReceiver;
use crate::sender::RabbitSender;
use bridge_core::error::{ErrorContext, ErrorContextExt};
use bridge_core::metrics::{error_type, LatencyTimer, PollerMetrics};
use bridge_core::prelude::*;
use bridge_core::EnvelopeConverter;
use tracing::{info, warn};

pub struct SqsDispatcher {
    receiver: SqsReceiver,
    sender: RabbitSender,
    converter: EnvelopeConverter,
    idempotency_key: Option<String>,
    metrics: PollerMetrics,
}

impl SqsDispatcher {
    pub fn new(receiver: SqsReceiver, sender: RabbitSender, idempotency_key: Option<String>) -> Self {
        let metrics = PollerMetrics::new(receiver.queue_name());
        Self {
            receiver,
            sender,
            converter: EnvelopeConverter,
            idempotency_key,
            metrics,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.receiver.queue_name()
    }

    /// Receive one batch and forward it in receipt order.
    ///
    /// The first failure makes that message visible again and aborts the run;
    /// messages after it stay invisible until their timeout lapses. Returns
    /// the number of messages forwarded. Failures are logged here with their
    /// context before being returned.
    pub async fn run_once(&self) -> Result<usize> {
        let _timer = LatencyTimer::start(|elapsed| self.metrics.record_run_duration(elapsed));

        let ctx = ErrorContext::new("sqs_dispatcher", "receive").with_bridge(self.queue_name());
        let messages = self.receiver.receive().await.with_context(ctx)?;
        if messages.is_empty() {
            return Ok(0);
        }

        info!("Received {} messages from {}", messages.len(), self.queue_name());
        self.metrics.record_received(messages.len());

        for message in &messages {
            let ctx = ErrorContext::new("sqs_dispatcher", "forward")
                .with_bridge(self.queue_name())
                .with_message_id(message.message_id.clone());

            if let Err(e) = self.forward(message).await.with_context(ctx) {
                self.metrics.record_failed(error_type(&e));
                if let Err(release) = self.receiver.release(message).await {
                    warn!(
                        queue = %self.queue_name(),
                        message_id = %message.message_id,
                        error = %release,
                        "Failed to reset visibility timeout"
                    );
                }
                return Err(e);
            }
            self.metrics.record_forwarded();
        }

        Ok(messages.len())
    }

    async fn forward(&self, message: &SqsMessage) -> Result<()> {
        let payload = self.converter.convert(
            &message.body,
            &message.message_id,
            self.sender.exchange(),
            self.idempotency_key.as_deref(),
        )?;
        self.sender.send(payload).await?;
        self.receiver.delete(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_core::memory::{MemoryAmazon, MemoryRabbit};
    use bridge_core::{BindingSpec, DeliveryStream, ExchangeSpec, PollerConfig, QueueSpec, RabbitTo};
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        amazon: MemoryAmazon,
        rabbit: MemoryRabbit,
        dispatcher: SqsDispatcher,
    }

    async fn fixture(idempotency_key: Option<&str>) -> Fixture {
        let amazon = MemoryAmazon::new();
        let rabbit = MemoryRabbit::new();
        amazon.create_queue("inbound").await;

        let config = PollerConfig {
            wait_time: Duration::from_millis(50),
            ..Default::default()
        };
        let receiver = SqsReceiver::resolve(Arc::new(amazon.clone()), "inbound", &config)
            .await
            .unwrap();
        let sender = RabbitSender::new(
            Arc::new(rabbit.clone()),
            &RabbitTo {
                exchange: "settlements".into(),
                routing_key: "settled".into(),
            },
        );
        sender.declare().await.unwrap();

        Fixture {
            amazon,
            rabbit,
            dispatcher: SqsDispatcher::new(receiver, sender, idempotency_key.map(str::to_string)),
        }
    }

    async fn published(rabbit: &MemoryRabbit) -> Vec<Value> {
        rabbit
            .published()
            .await
            .iter()
            .map(|m| serde_json::from_slice(&m.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let f = fixture(None).await;
        assert_eq!(f.dispatcher.run_once().await.unwrap(), 0);
        assert!(f.rabbit.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_receive_failure_is_returned() {
        let f = fixture(None).await;
        f.amazon.delete_queue("inbound").await;

        let err = f.dispatcher.run_once().await.unwrap_err();
        assert!(matches!(err, BridgeError::Amazon { .. }));
        assert!(f.rabbit.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_forwards_and_deletes_in_order() {
        let f = fixture(None).await;
        f.amazon.send_message("inbound", r#"{"n":1}"#).await.unwrap();
        f.amazon
            .send_message("inbound", r#"{"Type":"Notification","Message":"{\"n\":2}"}"#)
            .await
            .unwrap();

        assert_eq!(f.dispatcher.run_once().await.unwrap(), 2);
        assert_eq!(published(&f.rabbit).await, vec![json!({"n": 1}), json!({"n": 2})]);
        assert!(f.amazon.queue_bodies("inbound").await.is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_key_uses_exchange_and_message_id() {
        let f = fixture(Some("enabled")).await;
        let id = f.amazon.send_message("inbound", r#"{"n":1}"#).await.unwrap();

        f.dispatcher.run_once().await.unwrap();
        assert_eq!(
            published(&f.rabbit).await,
            vec![json!({"n": 1, "idempotencyKey": format!("settlements/{id}")})]
        );
    }

    /// Rabbit whose `nth` send (1-based) fails
    struct FailingSend {
        inner: MemoryRabbit,
        nth: usize,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl RabbitClient for FailingSend {
        async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
            self.inner.declare_exchange(exchange).await
        }

        async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
            self.inner.declare_queue(queue).await
        }

        async fn declare_binding(&self, binding: &BindingSpec) -> Result<()> {
            self.inner.declare_binding(binding).await
        }

        async fn send(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()> {
            if self.sends.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
                return Err(BridgeError::rabbit("publish not confirmed"));
            }
            self.inner.send(exchange, routing_key, body).await
        }

        async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
            self.inner.consume(queue, consumer_tag).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<()> {
            self.inner.ack(delivery).await
        }

        async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
            self.inner.reject(delivery, requeue).await
        }
    }

    #[tokio::test]
    async fn test_send_failure_aborts_batch() {
        let amazon = MemoryAmazon::new();
        let rabbit = MemoryRabbit::new();
        amazon.create_queue("inbound").await;
        for n in 1..=3 {
            amazon
                .send_message("inbound", &format!(r#"{{"n":{n}}}"#))
                .await
                .unwrap();
        }

        let receiver = SqsReceiver::resolve(Arc::new(amazon.clone()), "inbound", &PollerConfig::default())
            .await
            .unwrap();
        let sender = RabbitSender::new(
            Arc::new(FailingSend {
                inner: rabbit.clone(),
                nth: 2,
                sends: AtomicUsize::new(0),
            }),
            &RabbitTo {
                exchange: "settlements".into(),
                routing_key: "settled".into(),
            },
        );
        sender.declare().await.unwrap();
        let dispatcher = SqsDispatcher::new(receiver, sender, None);

        let err = dispatcher.run_once().await.unwrap_err();
        assert!(matches!(err, BridgeError::Rabbit { .. }));

        // Message 1 sent and deleted, message 2 visible again, message 3 untouched
        assert_eq!(published(&rabbit).await, vec![json!({"n": 1})]);
        assert_eq!(
            amazon.queue_bodies("inbound").await,
            vec![r#"{"n":2}"#.to_string(), r#"{"n":3}"#.to_string()]
        );
        assert_eq!(amazon.in_flight("inbound").await, 1);
    }

    #[tokio::test]
    async fn test_failure_mid_batch_keeps_earlier_deletes() {
        let f = fixture(None).await;
        f.amazon.send_message("inbound", r#"{"n":1}"#).await.unwrap();
        f.amazon.send_message("inbound", "not json").await.unwrap();
        f.amazon.send_message("inbound", r#"{"n":3}"#).await.unwrap();

        let err = f.dispatcher.run_once().await.unwrap_err();
        assert!(matches!(err, BridgeError::Transform { .. }));

        assert_eq!(published(&f.rabbit).await, vec![json!({"n": 1})]);
        assert_eq!(
            f.amazon.queue_bodies("inbound").await,
            vec!["not json".to_string(), r#"{"n":3}"#.to_string()]
        );
        // "not json" was released, {"n":3} was received but never handled
        assert_eq!(f.amazon.in_flight("inbound").await, 1);

        // Next run picks the released message up first and fails again on it
        assert!(f.dispatcher.run_once().await.is_err());
    }
}

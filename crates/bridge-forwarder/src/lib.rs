//! # Bridge Forwarder
//!
//! Consumes rabbit queues and forwards each payload to an SNS topic or SQS
//! queue.
//!
//! ## Components
//!
//! - `ForwardBridgeGenerator`: declares per-bridge topology and builds endpoints
//! - `ForwardingListener`: transform then send
//! - `DeadletteringListener`: retry or dead-letter classification
//! - `ForwardConsumer`: retry interceptor, ack / reject without requeue
//!
//! A failed delivery is retried only for transient SNS/SQS errors. Everything
//! else, and anything still failing once retries run out, is rejected without
//! requeue and lands in the queue's `-dead-letter` queue.

pub mod consumer;
pub mod deadletter;
pub mod generator;
pub mod listener;
pub mod retry;

pub use consumer::*;
pub use deadletter::*;
pub use generator::*;
pub use listener::*;
pub use retry::*;

use async_trait::async_trait;
use bridge_core::prelude::*;
use bridge_core::{RabbitConfig, TransformEngine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runs one consumer task per forward bridge
pub struct ForwardingService {
    bridges: Vec<Bridge>,
    rabbit: Arc<dyn RabbitClient>,
    amazon: Arc<dyn AmazonClient>,
    engine: Arc<dyn TransformEngine>,
    config: RabbitConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    endpoint_ids: Mutex<Vec<String>>,
    running: AtomicBool,
}

impl ForwardingService {
    pub fn new(
        bridges: Vec<Bridge>,
        rabbit: Arc<dyn RabbitClient>,
        amazon: Arc<dyn AmazonClient>,
        engine: Arc<dyn TransformEngine>,
        config: RabbitConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bridges,
            rabbit,
            amazon,
            engine,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            endpoint_ids: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Ids of the endpoints started by the last `start`
    pub async fn endpoint_ids(&self) -> Vec<String> {
        self.endpoint_ids.lock().await.clone()
    }
}

#[async_trait]
impl Lifecycle for ForwardingService {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(false);

        let generator = ForwardBridgeGenerator::new(
            Arc::clone(&self.rabbit),
            Arc::clone(&self.amazon),
            Arc::clone(&self.engine),
            self.config.retry.enabled,
        );
        let endpoints = match generator.generate_all(&self.bridges).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut tasks = self.tasks.lock().await;
        let mut ids = self.endpoint_ids.lock().await;
        ids.clear();

        for endpoint in endpoints {
            ids.push(endpoint.id.clone());
            let consumer = ForwardConsumer::new(endpoint, Arc::clone(&self.rabbit), &self.config);
            let shutdown = self.shutdown.subscribe();

            tasks.push(tokio::spawn(async move {
                if let Err(e) = consumer.run(shutdown).await {
                    error!(
                        listener = %consumer.endpoint().id,
                        error = %e,
                        "Forward consumer failed"
                    );
                }
            }));
        }

        info!(listeners = ids.len(), "Forwarding service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Forward consumer task panicked");
            }
        }

        info!("Forwarding service stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::memory::{MemoryAmazon, MemoryRabbit};
    use bridge_core::{ChainSpecEngine, RabbitFrom, SnsTo};
    use bytes::Bytes;
    use std::time::Duration;

    fn bridge(exchange: &str, queue: &str, topic: &str) -> Bridge {
        Bridge::new(
            Source::Rabbit(RabbitFrom {
                exchange: exchange.into(),
                queue_name: queue.into(),
                routing_key: "#".into(),
            }),
            Destination::Sns(SnsTo { name: topic.into() }),
        )
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();
        amazon.create_topic("t1").await;
        amazon.create_topic("t2").await;

        let service = ForwardingService::new(
            vec![bridge("a", "qa", "t1"), bridge("b", "qb", "t2")],
            Arc::new(rabbit.clone()),
            Arc::new(amazon.clone()),
            Arc::new(ChainSpecEngine),
            RabbitConfig::default(),
        );

        service.start().await.unwrap();
        assert!(service.is_running());
        assert_eq!(
            service.endpoint_ids().await,
            vec!["rabbit-amazon-bridge-listener#0", "rabbit-amazon-bridge-listener#1"]
        );

        rabbit.send("b", "any", Bytes::from_static(b"{\"n\":1}")).await.unwrap();
        for _ in 0..100 {
            if !amazon.topic_messages("t2").await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(amazon.topic_messages("t2").await, vec![r#"{"n":1}"#]);
        assert!(amazon.topic_messages("t1").await.is_empty());

        tokio::time::timeout(Duration::from_secs(1), service.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_on_conflicting_topology() {
        let rabbit = MemoryRabbit::new();
        let amazon = MemoryAmazon::new();

        // Same queue bound for two different dead-letter exchanges
        let service = ForwardingService::new(
            vec![bridge("a", "shared", "t1"), bridge("b", "shared", "t1")],
            Arc::new(rabbit),
            Arc::new(amazon),
            Arc::new(ChainSpecEngine),
            RabbitConfig::default(),
        );

        assert!(service.start().await.is_err());
        assert!(!service.is_running());
    }
}

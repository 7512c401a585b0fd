//! # Bridge Gateway
//!
//! Process wiring for the rabbit-amazon bridge: settings, bridge files, and
//! the forwarding and polling services.
//!
//! ## Startup
//!
//! ```text
//! BridgeSettings::load ─► BridgeConfigParser::load_files ─► BridgeApp::start
//!                                                             ├── ForwardingService (rabbit ─► SNS/SQS)
//!                                                             └── PollerService     (SQS ─► rabbit)
//! ```
//!
//! Startup is all-or-nothing: an invalid bridge file, or a topology or queue
//! lookup failure, stops the process before any message moves.

use async_trait::async_trait;
use bridge_core::memory::MemoryAmazon;
use bridge_core::prelude::*;
use bridge_core::{BridgeConfigParser, ChainSpecEngine, TransformEngine};
use bridge_forwarder::ForwardingService;
use bridge_poller::PollerService;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// Parse and validate the bridge files named in the settings
pub fn load_bridges(settings: &BridgeSettings, engine: Arc<dyn TransformEngine>) -> Result<Vec<Bridge>> {
    BridgeConfigParser::new(engine).load_files(&settings.bridge.paths())
}

/// Create the SQS queues and SNS topics a set of bridges refers to
pub async fn provision_local_amazon(amazon: &MemoryAmazon, bridges: &[Bridge]) {
    for bridge in bridges {
        if let Source::Sqs(from) = &bridge.source {
            amazon.create_queue(&from.name).await;
        }
        match &bridge.destination {
            Destination::Sns(sns) => amazon.create_topic(&sns.name).await,
            Destination::Sqs(sqs) => {
                amazon.create_queue(&sqs.name).await;
            }
            Destination::Rabbit(_) => {}
        }
    }
}

/// Both bridge directions behind one lifecycle
pub struct BridgeApp {
    bridges: Vec<Bridge>,
    forwarding: ForwardingService,
    poller: PollerService,
}

impl BridgeApp {
    pub fn new(
        settings: &BridgeSettings,
        bridges: Vec<Bridge>,
        rabbit: Arc<dyn RabbitClient>,
        amazon: Arc<dyn AmazonClient>,
    ) -> Self {
        Self::with_engine(settings, bridges, rabbit, amazon, Arc::new(ChainSpecEngine))
    }

    pub fn with_engine(
        settings: &BridgeSettings,
        bridges: Vec<Bridge>,
        rabbit: Arc<dyn RabbitClient>,
        amazon: Arc<dyn AmazonClient>,
        engine: Arc<dyn TransformEngine>,
    ) -> Self {
        let forwarding = ForwardingService::new(
            bridges.clone(),
            Arc::clone(&rabbit),
            Arc::clone(&amazon),
            engine,
            settings.rabbit.clone(),
        );
        let poller = PollerService::new(bridges.clone(), rabbit, amazon, settings.poller.clone());

        Self {
            bridges,
            forwarding,
            poller,
        }
    }

    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    pub fn forwarding(&self) -> &ForwardingService {
        &self.forwarding
    }

    /// Start, wait for `shutdown`, then stop
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start().await?;
        shutdown.await;
        info!("Shutdown signal received");
        self.stop().await
    }
}

#[async_trait]
impl Lifecycle for BridgeApp {
    async fn start(&self) -> Result<()> {
        info!(bridges = self.bridges.len(), "Starting rabbit-amazon bridge");

        self.forwarding.start().await?;
        if let Err(e) = self.poller.start().await {
            error!(error = %e, "Poller startup failed");
            self.forwarding.stop().await?;
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let poller = self.poller.stop().await;
        let forwarding = self.forwarding.stop().await;
        poller.and(forwarding)
    }

    fn is_running(&self) -> bool {
        self.forwarding.is_running() && self.poller.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::memory::MemoryRabbit;
    use bridge_core::{RabbitFrom, RabbitTo, SnsTo, SqsFrom, SqsTo};

    fn bridges() -> Vec<Bridge> {
        vec![
            Bridge::new(
                Source::Rabbit(RabbitFrom {
                    exchange: "orders".into(),
                    queue_name: "orders-q".into(),
                    routing_key: "#".into(),
                }),
                Destination::Sns(SnsTo { name: "orders-topic".into() }),
            ),
            Bridge::new(
                Source::Rabbit(RabbitFrom {
                    exchange: "audit".into(),
                    queue_name: "audit-q".into(),
                    routing_key: "#".into(),
                }),
                Destination::Sqs(SqsTo { name: "audit-out".into() }),
            ),
            Bridge::new(
                Source::Sqs(SqsFrom { name: "replies".into() }),
                Destination::Rabbit(RabbitTo {
                    exchange: "replies-ex".into(),
                    routing_key: "reply".into(),
                }),
            ),
        ]
    }

    #[tokio::test]
    async fn test_provision_local_amazon() {
        let amazon = MemoryAmazon::new();
        provision_local_amazon(&amazon, &bridges()).await;

        assert!(amazon.resolve_queue_url("replies").await.is_ok());
        assert!(amazon.resolve_queue_url("audit-out").await.is_ok());
        amazon.send_to_topic("orders-topic", "{}").await.unwrap();
    }

    #[tokio::test]
    async fn test_poller_failure_stops_forwarding() {
        let settings = BridgeSettings::default();
        let app = BridgeApp::new(
            &settings,
            bridges(),
            Arc::new(MemoryRabbit::new()),
            Arc::new(MemoryAmazon::new()),
        );

        // "replies" does not exist, so the poller cannot resolve its queue
        assert!(app.start().await.is_err());
        assert!(!app.forwarding().is_running());
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn test_run_until_starts_and_stops() {
        let settings = BridgeSettings::default();
        let amazon = MemoryAmazon::new();
        provision_local_amazon(&amazon, &bridges()).await;

        let app = BridgeApp::new(&settings, bridges(), Arc::new(MemoryRabbit::new()), Arc::new(amazon));
        app.run_until(async {}).await.unwrap();
        assert!(!app.is_running());
    }
}

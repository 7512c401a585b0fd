//! Builds forward endpoints from validated bridges

use crate::deadletter::DeadletteringListener;
use crate::listener::{AmazonTarget, ForwardingListener, MessageListener};
use bridge_core::metrics::ForwarderMetrics;
use bridge_core::prelude::*;
use bridge_core::{TopologyProvisioner, TopologyRecord, TransformChain, TransformEngine};
use std::sync::Arc;
use tracing::info;

pub const LISTENER_ID_PREFIX: &str = "rabbit-amazon-bridge-listener";

/// One rabbit queue wired to an SNS topic or SQS queue
pub struct ForwardEndpoint {
    /// `rabbit-amazon-bridge-listener#<index>`
    pub id: String,
    pub queue: String,
    pub exchange: String,
    pub target: AmazonTarget,
    pub listener: Arc<dyn MessageListener>,
    pub topology: TopologyRecord,
}

impl std::fmt::Debug for ForwardEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardEndpoint")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

pub struct ForwardBridgeGenerator {
    amazon: Arc<dyn AmazonClient>,
    engine: Arc<dyn TransformEngine>,
    provisioner: TopologyProvisioner,
    should_retry: bool,
}

impl ForwardBridgeGenerator {
    pub fn new(
        rabbit: Arc<dyn RabbitClient>,
        amazon: Arc<dyn AmazonClient>,
        engine: Arc<dyn TransformEngine>,
        should_retry: bool,
    ) -> Self {
        Self {
            amazon,
            engine,
            provisioner: TopologyProvisioner::new(rabbit),
            should_retry,
        }
    }

    /// Declare the topology for one forward bridge and build its endpoint
    pub async fn generate(&self, index: usize, bridge: &Bridge) -> Result<ForwardEndpoint> {
        let Source::Rabbit(from) = &bridge.source else {
            return Err(BridgeError::config(format!(
                "bridge {} does not read from rabbit",
                bridge.label()
            )));
        };
        let target = AmazonTarget::from_destination(&bridge.destination)?;

        let topology = self.provisioner.provision(from).await?;

        info!(
            "Creating bridge between exchange: {}/{} to {}",
            from.exchange, from.queue_name, target
        );

        let id = format!("{LISTENER_ID_PREFIX}#{index}");
        let chain = TransformChain::for_bridge(bridge, self.engine.as_ref())?;
        let forwarding = ForwardingListener::new(
            target.clone(),
            Arc::clone(&self.amazon),
            Arc::new(chain),
            ForwarderMetrics::new(id.clone()),
        );
        let listener = DeadletteringListener::new(Arc::new(forwarding), self.should_retry);

        Ok(ForwardEndpoint {
            id,
            queue: from.queue_name.clone(),
            exchange: from.exchange.clone(),
            target,
            listener: Arc::new(listener),
            topology,
        })
    }

    /// Endpoints for every enabled rabbit-sourced bridge, in order.
    ///
    /// The listener index counts only these bridges.
    pub async fn generate_all(&self, bridges: &[Bridge]) -> Result<Vec<ForwardEndpoint>> {
        let mut endpoints = Vec::new();
        let forwardable = bridges
            .iter()
            .filter(|b| b.is_from_rabbit() && b.forwarding_enabled);

        for (index, bridge) in forwardable.enumerate() {
            endpoints.push(self.generate(index, bridge).await?);
        }
        Ok(endpoints)
    }
}

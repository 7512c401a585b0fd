//! Rabbit topology for bridges
//!
//! Every forward bridge owns:
//!
//! ```text
//! exchange ──(routing key)──► queue ──reject──► exchange-dead-letter ──(queue)──► queue-dead-letter
//! ```
//!
//! Declarations are idempotent and issued once at startup.

use crate::bridge::RabbitFrom;
use crate::error::Result;
use crate::strategy::{BindingSpec, ExchangeSpec, QueueSpec, RabbitClient};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEAD_LETTER_SUFFIX: &str = "-dead-letter";
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// `<name>-dead-letter`
pub fn dead_letter_name(name: &str) -> String {
    format!("{name}{DEAD_LETTER_SUFFIX}")
}

/// Everything declared for one forward bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyRecord {
    pub exchange: ExchangeSpec,
    pub dead_letter_exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub dead_letter_queue: QueueSpec,
    pub queue_binding: BindingSpec,
    pub dead_letter_binding: BindingSpec,
}

impl TopologyRecord {
    pub fn for_source(from: &RabbitFrom) -> Self {
        let dlx = dead_letter_name(&from.exchange);
        let dlq = dead_letter_name(&from.queue_name);

        Self {
            exchange: ExchangeSpec::topic(&from.exchange),
            dead_letter_exchange: ExchangeSpec::topic(&dlx),
            queue: QueueSpec::durable(&from.queue_name)
                .with_argument(DEAD_LETTER_EXCHANGE_ARG, &dlx)
                .with_argument(DEAD_LETTER_ROUTING_KEY_ARG, &from.queue_name),
            dead_letter_queue: QueueSpec::durable(&dlq),
            queue_binding: BindingSpec {
                queue: from.queue_name.clone(),
                exchange: from.exchange.clone(),
                routing_key: from.routing_key.clone(),
            },
            dead_letter_binding: BindingSpec {
                queue: dlq,
                exchange: dlx,
                routing_key: from.queue_name.clone(),
            },
        }
    }
}

/// Issues declarations against a rabbit client
#[derive(Clone)]
pub struct TopologyProvisioner {
    rabbit: Arc<dyn RabbitClient>,
}

impl TopologyProvisioner {
    pub fn new(rabbit: Arc<dyn RabbitClient>) -> Self {
        Self { rabbit }
    }

    /// Declare an exchange and its dead-letter exchange
    pub async fn declare_exchange_pair(&self, exchange: &str) -> Result<(ExchangeSpec, ExchangeSpec)> {
        let primary = ExchangeSpec::topic(exchange);
        let dead_letter = ExchangeSpec::topic(dead_letter_name(exchange));

        self.rabbit.declare_exchange(&primary).await?;
        self.rabbit.declare_exchange(&dead_letter).await?;
        debug!(exchange, "Declared exchange pair");

        Ok((primary, dead_letter))
    }

    /// Declare the full forward topology for a rabbit source
    pub async fn provision(&self, from: &RabbitFrom) -> Result<TopologyRecord> {
        let record = TopologyRecord::for_source(from);

        self.declare_exchange_pair(&from.exchange).await?;
        self.rabbit.declare_queue(&record.queue).await?;
        self.rabbit.declare_queue(&record.dead_letter_queue).await?;
        self.rabbit.declare_binding(&record.queue_binding).await?;
        self.rabbit.declare_binding(&record.dead_letter_binding).await?;

        info!(
            exchange = %from.exchange,
            queue = %from.queue_name,
            routing_key = %from.routing_key,
            "Provisioned bridge topology"
        );
        Ok(record)
    }
}

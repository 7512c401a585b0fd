//! Rabbit side of a reverse bridge

use bridge_core::prelude::*;
use bridge_core::{RabbitTo, TopologyProvisioner};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Publishes converted payloads to one exchange with a fixed routing key
#[derive(Clone)]
pub struct RabbitSender {
    rabbit: Arc<dyn RabbitClient>,
    exchange: String,
    routing_key: String,
}

impl RabbitSender {
    pub fn new(rabbit: Arc<dyn RabbitClient>, to: &RabbitTo) -> Self {
        Self {
            rabbit,
            exchange: to.exchange.clone(),
            routing_key: to.routing_key.clone(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declare the destination exchange and its dead-letter exchange
    pub async fn declare(&self) -> Result<()> {
        TopologyProvisioner::new(Arc::clone(&self.rabbit))
            .declare_exchange_pair(&self.exchange)
            .await?;
        Ok(())
    }

    /// Publish and wait for the broker confirmation
    pub async fn send(&self, payload: String) -> Result<()> {
        self.rabbit
            .send(&self.exchange, &self.routing_key, Bytes::from(payload))
            .await?;
        debug!(exchange = %self.exchange, routing_key = %self.routing_key, "Published to rabbit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::memory::MemoryRabbit;

    fn to() -> RabbitTo {
        RabbitTo {
            exchange: "payments".into(),
            routing_key: "payment.settled".into(),
        }
    }

    #[tokio::test]
    async fn test_declare_then_send() {
        let rabbit = MemoryRabbit::new();
        let sender = RabbitSender::new(Arc::new(rabbit.clone()), &to());

        assert!(sender.send("{}".into()).await.is_err());

        sender.declare().await.unwrap();
        assert!(rabbit.exchange("payments-dead-letter").await.is_some());

        sender.send(r#"{"id":1}"#.into()).await.unwrap();
        let published = rabbit.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "payments");
        assert_eq!(published[0].routing_key, "payment.settled");
        assert_eq!(published[0].body, Bytes::from_static(br#"{"id":1}"#));
    }
}

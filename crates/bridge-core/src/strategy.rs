//! Broker collaborator traits
//!
//! The bridge never talks to a broker directly. Rabbit (broker A) and Amazon
//! SNS/SQS (broker B) sit behind these traits so the forwarding and polling
//! runtimes can be driven by real clients or by the in-memory brokers in
//! [`crate::memory`].
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     ├── ForwardingService ──► RabbitClient::consume ──► AmazonClient::send_to_*
//!     │
//!     └── PollerService     ──► AmazonClient::receive ──► RabbitClient::send
//! ```

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;

/// Type alias for boxed async streams of rabbit deliveries
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for runtimes
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component. Topology is declared here.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully. In-flight work is not cancelled.
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Receiving side of a runtime's shutdown channel; `true` means stop
pub type ShutdownSignal = watch::Receiver<bool>;

/// Resolves once shutdown is requested or the sender is gone
pub async fn shutdown_requested(mut signal: ShutdownSignal) {
    loop {
        let stop = *signal.borrow_and_update();
        if stop || signal.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Broker A: Rabbit
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, non auto-delete topic exchange
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, String>,
}

impl QueueSpec {
    /// Durable, non-exclusive, non auto-delete queue
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A message delivered by rabbit to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    pub routing_key: String,
    /// Queue the consumer reads from
    pub queue: String,
    pub body: Bytes,
    pub redelivered: bool,
}

impl Delivery {
    /// Body as text, replacing invalid UTF-8
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Rabbit client strategy
#[async_trait]
pub trait RabbitClient: Send + Sync {
    /// Idempotent exchange declaration
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    /// Idempotent queue declaration
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Idempotent binding declaration
    async fn declare_binding(&self, binding: &BindingSpec) -> Result<()>;

    /// Publish and wait for the broker to confirm
    async fn send(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()>;

    /// Start consuming a queue
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Reject a delivery. Without requeue the broker dead-letters it.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
}

// ============================================================================
// Broker B: Amazon SNS / SQS
// ============================================================================

/// A message received from an SQS queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// Amazon client strategy
#[async_trait]
pub trait AmazonClient: Send + Sync {
    /// Send to an SQS queue by name
    async fn send_to_queue(&self, queue_name: &str, body: &str) -> Result<()>;

    /// Publish to an SNS topic by name
    async fn send_to_topic(&self, topic_name: &str, body: &str) -> Result<()>;

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String>;

    /// Long-poll receive, requesting all attributes. Empty when nothing arrived.
    async fn receive(
        &self,
        queue_url: &str,
        wait_time: Duration,
        max_messages: usize,
    ) -> Result<Vec<SqsMessage>>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;

    /// Change visibility; zero makes the message redeliverable at once
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_seconds: u32,
    ) -> Result<()>;
}

//! In-memory brokers
//!
//! - [`MemoryRabbit`]: exchanges, queues, bindings with topic routing, and
//!   dead-lettering through `x-dead-letter-exchange` when a delivery is
//!   rejected without requeue.
//! - [`MemoryAmazon`]: SQS queues with visibility timeouts and receipt handles,
//!   plus SNS topics that wrap messages in a notification envelope for their
//!   queue subscribers.
//!
//! Both back the test suites and the binary's local mode. Failures can be
//! injected for the next N sends. The logs of published rabbit messages and
//! topic messages keep only the most recent [`DEFAULT_LOG_CAPACITY`] entries
//! unless another capacity is set with `with_log_capacity`.

use crate::error::{BridgeError, Result};
use crate::strategy::{
    AmazonClient, BindingSpec, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec, QueueSpec,
    RabbitClient, SqsMessage,
};
use crate::topology::{DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

/// Builds the error returned by an injected failure
pub type FailureFactory = fn() -> BridgeError;

/// Entries kept per published-message log
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Append to a log holding at most `capacity` entries, dropping the oldest
fn push_bounded<T>(log: &mut VecDeque<T>, entry: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(entry);
}

/// Check a routing key against a topic pattern.
///
/// - `*` matches exactly one word
/// - `#` matches zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

// ============================================================================
// Memory Rabbit
// ============================================================================

/// A message published to rabbit, as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
}

struct MemoryQueue {
    spec: QueueSpec,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

#[derive(Default)]
struct RabbitState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<BindingSpec>,
    unacked: HashMap<u64, Delivery>,
    published: VecDeque<PublishedMessage>,
    failures: VecDeque<FailureFactory>,
}

/// In-memory rabbit broker
#[derive(Clone)]
pub struct MemoryRabbit {
    state: Arc<Mutex<RabbitState>>,
    next_tag: Arc<AtomicU64>,
    log_capacity: usize,
}

impl Default for MemoryRabbit {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRabbit {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RabbitState::default())),
            next_tag: Arc::new(AtomicU64::new(0)),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Keep at most `capacity` entries in the published log; zero disables it
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Make the next `send` fail with the given error
    pub async fn fail_next_send(&self, failure: FailureFactory) {
        self.state.lock().await.failures.push_back(failure);
    }

    /// The most recent messages accepted by `send`, oldest first
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.iter().cloned().collect()
    }

    pub async fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().await.exchanges.get(name).cloned()
    }

    pub async fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state.lock().await.queues.get(name).map(|q| q.spec.clone())
    }

    pub async fn bindings(&self) -> Vec<BindingSpec> {
        self.state.lock().await.bindings.clone()
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Drain ready messages from a queue nobody consumes
    pub async fn take_ready(&self, queue: &str) -> Vec<Delivery> {
        let mut state = self.state.lock().await;
        let mut ready = Vec::new();
        if let Some(rx) = state.queues.get_mut(queue).and_then(|q| q.rx.as_mut()) {
            while let Ok(delivery) = rx.try_recv() {
                ready.push(delivery);
            }
        }
        ready
    }

    fn enqueue(&self, state: &RabbitState, queue: &str, exchange: &str, routing_key: &str, body: Bytes, redelivered: bool) {
        if let Some(target) = state.queues.get(queue) {
            let delivery = Delivery {
                delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
                body,
                redelivered,
            };
            // A closed receiver means the consumer went away; the message is lost
            let _ = target.tx.send(delivery);
        }
    }

    fn route(&self, state: &RabbitState, exchange: &str, routing_key: &str, body: Bytes) -> usize {
        if exchange.is_empty() {
            self.enqueue(state, routing_key, exchange, routing_key, body, false);
            return usize::from(state.queues.contains_key(routing_key));
        }

        let kind = state
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .unwrap_or(ExchangeKind::Topic);

        let mut targets: Vec<&str> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.as_str())
            .collect();
        targets.sort_unstable();
        targets.dedup();

        for queue in &targets {
            self.enqueue(state, queue, exchange, routing_key, body.clone(), false);
        }
        targets.len()
    }
}

#[async_trait]
impl RabbitClient for MemoryRabbit {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BridgeError::rabbit(format!(
                "exchange '{}' already declared with different properties",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(BridgeError::rabbit(format!(
                "queue '{}' already declared with different arguments",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        spec: queue.clone(),
                        tx,
                        rx: Some(rx),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_binding(&self, binding: &BindingSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BridgeError::rabbit(format!("no exchange '{}'", binding.exchange)));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BridgeError::rabbit(format!("no queue '{}'", binding.queue)));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn send(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(failure) = state.failures.pop_front() {
            return Err(failure());
        }
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(BridgeError::rabbit(format!("no exchange '{exchange}'")));
        }

        let routed = self.route(&state, exchange, routing_key, body.clone());
        tracing::trace!(exchange, routing_key, routed, "Published to memory rabbit");
        let entry = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
        };
        push_bounded(&mut state.published, entry, self.log_capacity);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.state.lock().await;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BridgeError::rabbit(format!("no queue '{queue}'")))?;
        let rx = target.rx.take().ok_or_else(|| {
            BridgeError::rabbit(format!("queue '{queue}' already has a consumer"))
        })?;

        tracing::debug!(queue, consumer_tag, "Consumer registered");

        let unacked = Arc::clone(&self.state);
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let unacked = Arc::clone(&unacked);
            async move {
                let delivery = rx.recv().await?;
                unacked
                    .lock()
                    .await
                    .unacked
                    .insert(delivery.delivery_tag, delivery.clone());
                Some((Ok::<_, BridgeError>(delivery), rx))
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state
            .lock()
            .await
            .unacked
            .remove(&delivery.delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BridgeError::rabbit(format!("unknown delivery tag {}", delivery.delivery_tag)))
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let delivery = state
            .unacked
            .remove(&delivery.delivery_tag)
            .ok_or_else(|| BridgeError::rabbit(format!("unknown delivery tag {}", delivery.delivery_tag)))?;

        if requeue {
            self.enqueue(
                &state,
                &delivery.queue,
                &delivery.exchange,
                &delivery.routing_key,
                delivery.body,
                true,
            );
            return Ok(());
        }

        let arguments = state
            .queues
            .get(&delivery.queue)
            .map(|q| q.spec.arguments.clone())
            .unwrap_or_default();

        if let Some(dlx) = arguments.get(DEAD_LETTER_EXCHANGE_ARG) {
            let routing_key = arguments
                .get(DEAD_LETTER_ROUTING_KEY_ARG)
                .unwrap_or(&delivery.routing_key);
            let routed = self.route(&state, dlx, routing_key, delivery.body);
            tracing::debug!(queue = %delivery.queue, dlx = %dlx, routed, "Delivery dead-lettered");
        }
        Ok(())
    }
}

// ============================================================================
// Memory Amazon
// ============================================================================

const QUEUE_URL_PREFIX: &str = "https://sqs.local/000000000000/";
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIVE_TICK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
    receive_count: u32,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

#[derive(Debug, Default)]
struct SqsQueue {
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct AmazonState {
    queues: HashMap<String, SqsQueue>,
    topics: HashMap<String, VecDeque<String>>,
    subscriptions: HashMap<String, Vec<String>>,
    failures: VecDeque<FailureFactory>,
}

/// In-memory SNS and SQS
#[derive(Clone)]
pub struct MemoryAmazon {
    state: Arc<Mutex<AmazonState>>,
    arrivals: Arc<Notify>,
    visibility_timeout: Duration,
    log_capacity: usize,
}

impl Default for MemoryAmazon {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAmazon {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(AmazonState::default())),
            arrivals: Arc::new(Notify::new()),
            visibility_timeout,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Keep at most `capacity` messages per topic log; zero disables it
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn queue_url(name: &str) -> String {
        format!("{QUEUE_URL_PREFIX}{name}")
    }

    fn queue_name(url: &str) -> Result<&str> {
        url.strip_prefix(QUEUE_URL_PREFIX)
            .ok_or_else(|| BridgeError::amazon(format!("malformed queue url '{url}'")))
    }

    /// Create a queue, returning its url
    pub async fn create_queue(&self, name: &str) -> String {
        self.state
            .lock()
            .await
            .queues
            .entry(name.to_string())
            .or_default();
        Self::queue_url(name)
    }

    /// Drop a queue and everything stored in it
    pub async fn delete_queue(&self, name: &str) {
        self.state.lock().await.queues.remove(name);
    }

    /// Create a topic
    pub async fn create_topic(&self, name: &str) {
        self.state
            .lock()
            .await
            .topics
            .entry(name.to_string())
            .or_default();
    }

    /// Deliver everything published to `topic` into `queue`, wrapped in a
    /// notification envelope
    pub async fn subscribe(&self, topic: &str, queue: &str) {
        let mut state = self.state.lock().await;
        state.topics.entry(topic.to_string()).or_default();
        state.queues.entry(queue.to_string()).or_default();
        state
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(queue.to_string());
    }

    /// Make the next send to a queue or topic fail with the given error
    pub async fn fail_next_send(&self, failure: FailureFactory) {
        self.state.lock().await.failures.push_back(failure);
    }

    /// Enqueue a message directly, returning its id
    pub async fn send_message(&self, queue_name: &str, body: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let id = Self::store(&mut state, queue_name, body)?;
        self.arrivals.notify_waiters();
        Ok(id)
    }

    /// Bodies of all messages still stored in a queue, in arrival order
    pub async fn queue_bodies(&self, queue_name: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .queues
            .get(queue_name)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages received but neither deleted nor visible again
    pub async fn in_flight(&self, queue_name: &str) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .await
            .queues
            .get(queue_name)
            .map(|q| q.messages.iter().filter(|m| !m.is_visible(now)).count())
            .unwrap_or_default()
    }

    /// The most recent messages published to a topic, oldest first
    pub async fn topic_messages(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .topics
            .get(topic)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn store(state: &mut AmazonState, queue_name: &str, body: &str) -> Result<String> {
        let queue = state.queues.get_mut(queue_name).ok_or_else(|| {
            BridgeError::amazon(format!("The specified queue '{queue_name}' does not exist"))
        })?;
        let message_id = uuid::Uuid::new_v4().to_string();
        queue.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.to_string(),
            receipt_handle: None,
            invisible_until: None,
            receive_count: 0,
        });
        Ok(message_id)
    }

    fn take_visible(&self, state: &mut AmazonState, queue_name: &str, max: usize) -> Result<Vec<SqsMessage>> {
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BridgeError::amazon(format!("The specified queue '{queue_name}' does not exist")))?;

        let now = Instant::now();
        let mut received = Vec::new();
        for message in queue.messages.iter_mut().filter(|m| m.is_visible(now)).take(max) {
            let receipt = uuid::Uuid::new_v4().to_string();
            message.receipt_handle = Some(receipt.clone());
            message.invisible_until = Some(now + self.visibility_timeout);
            message.receive_count += 1;

            let attributes = HashMap::from([
                (
                    "ApproximateReceiveCount".to_string(),
                    message.receive_count.to_string(),
                ),
                (
                    "SentTimestamp".to_string(),
                    chrono::Utc::now().timestamp_millis().to_string(),
                ),
            ]);

            received.push(SqsMessage {
                message_id: message.message_id.clone(),
                receipt_handle: receipt,
                body: message.body.clone(),
                attributes,
            });
        }
        Ok(received)
    }
}

#[async_trait]
impl AmazonClient for MemoryAmazon {
    async fn send_to_queue(&self, queue_name: &str, body: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(failure) = state.failures.pop_front() {
            return Err(failure());
        }
        Self::store(&mut state, queue_name, body)?;
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn send_to_topic(&self, topic_name: &str, body: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(failure) = state.failures.pop_front() {
            return Err(failure());
        }

        let published = state.topics.get_mut(topic_name).ok_or_else(|| {
            BridgeError::amazon(format!("Topic '{topic_name}' does not exist"))
        })?;
        push_bounded(published, body.to_string(), self.log_capacity);

        let subscribers = state.subscriptions.get(topic_name).cloned().unwrap_or_default();
        for queue in subscribers {
            let envelope = serde_json::json!({
                "Type": "Notification",
                "MessageId": uuid::Uuid::new_v4().to_string(),
                "TopicArn": format!("arn:aws:sns:local:000000000000:{topic_name}"),
                "Message": body,
                "Timestamp": chrono::Utc::now().to_rfc3339(),
            });
            Self::store(&mut state, &queue, &envelope.to_string())?;
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String> {
        if self.state.lock().await.queues.contains_key(queue_name) {
            Ok(Self::queue_url(queue_name))
        } else {
            Err(BridgeError::amazon(format!(
                "The specified queue '{queue_name}' does not exist"
            )))
        }
    }

    async fn receive(
        &self,
        queue_url: &str,
        wait_time: Duration,
        max_messages: usize,
    ) -> Result<Vec<SqsMessage>> {
        let queue_name = Self::queue_name(queue_url)?;
        let deadline = Instant::now() + wait_time;

        loop {
            let notified = self.arrivals.notified();
            {
                let mut state = self.state.lock().await;
                let received = self.take_visible(&mut state, queue_name, max_messages)?;
                if !received.is_empty() {
                    return Ok(received);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Visibility expiry does not notify, so wake up periodically
            let _ = tokio::time::timeout((deadline - now).min(RECEIVE_TICK), notified).await;
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        let queue_name = Self::queue_name(queue_url)?;
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BridgeError::amazon(format!("The specified queue '{queue_name}' does not exist")))?;

        let before = queue.messages.len();
        queue
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if queue.messages.len() == before {
            return Err(BridgeError::amazon(format!(
                "The receipt handle '{receipt_handle}' is not valid"
            )));
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_seconds: u32,
    ) -> Result<()> {
        let queue_name = Self::queue_name(queue_url)?;
        let mut state = self.state.lock().await;
        let message = state
            .queues
            .get_mut(queue_name)
            .and_then(|q| {
                q.messages
                    .iter_mut()
                    .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            })
            .ok_or_else(|| {
                BridgeError::amazon(format!("The receipt handle '{receipt_handle}' is not valid"))
            })?;

        message.invisible_until = match timeout_seconds {
            0 => None,
            secs => Some(Instant::now() + Duration::from_secs(u64::from(secs))),
        };
        drop(state);
        self.arrivals.notify_waiters();
        Ok(())
    }
}

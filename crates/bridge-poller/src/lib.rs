//! # Bridge Poller
//!
//! Moves messages from SQS queues onto rabbit exchanges.
//!
//! ## Flow per reverse bridge
//!
//! ```text
//! SqsReceiver::receive ─► EnvelopeConverter ─► RabbitSender::send ─► SqsReceiver::delete
//!                                   │ failure
//!                                   └──────► visibility 0, abort batch
//! ```
//!
//! Each bridge runs on its own task under a `FixedDelayScheduler`. A message
//! that fails is redelivered by SQS; there is no dead-lettering on this side.

pub mod dispatcher;
pub mod receiver;
pub mod scheduler;
pub mod sender;

pub use dispatcher::*;
pub use receiver::*;
pub use scheduler::*;
pub use sender::*;

use async_trait::async_trait;
use bridge_core::prelude::*;
use bridge_core::{reverse_bridges, PollerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Runs one poller task per SQS-sourced bridge
pub struct PollerService {
    bridges: Vec<Bridge>,
    rabbit: Arc<dyn RabbitClient>,
    amazon: Arc<dyn AmazonClient>,
    config: PollerConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl PollerService {
    pub fn new(
        bridges: Vec<Bridge>,
        rabbit: Arc<dyn RabbitClient>,
        amazon: Arc<dyn AmazonClient>,
        config: PollerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bridges,
            rabbit,
            amazon,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Resolve the queue and declare the exchange for one reverse bridge
    async fn prepare(&self, bridge: &Bridge) -> Result<SqsDispatcher> {
        let (Source::Sqs(from), Destination::Rabbit(to)) = (&bridge.source, &bridge.destination) else {
            return Err(BridgeError::config(format!(
                "bridge {} is not an SQS to rabbit bridge",
                bridge.label()
            )));
        };

        let receiver = SqsReceiver::resolve(Arc::clone(&self.amazon), &from.name, &self.config).await?;
        let sender = RabbitSender::new(Arc::clone(&self.rabbit), to);
        sender.declare().await?;

        Ok(SqsDispatcher::new(
            receiver,
            sender,
            self.config.idempotency_key.clone(),
        ))
    }
}

#[async_trait]
impl Lifecycle for PollerService {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(false);

        let mut dispatchers = Vec::new();
        for bridge in reverse_bridges(&self.bridges) {
            match self.prepare(bridge).await {
                Ok(dispatcher) => dispatchers.push(dispatcher),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        let mut tasks = self.tasks.lock().await;
        let count = dispatchers.len();
        for dispatcher in dispatchers {
            let scheduler = FixedDelayScheduler::new(dispatcher, self.config.fixed_delay);
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
        }

        info!(pollers = count, "Poller service started");
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
                warn!(error = %e, "Poller task panicked");
            }
        }

        info!("Poller service stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

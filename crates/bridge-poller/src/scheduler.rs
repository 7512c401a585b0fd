//! Fixed-delay scheduling of dispatcher runs

use crate::dispatcher::SqsDispatcher;
use bridge_core::prelude::*;
use std::time::Duration;
use tracing::info;

/// Re-arms a dispatcher `fixed_delay` after each run completes
pub struct FixedDelayScheduler {
    dispatcher: SqsDispatcher,
    fixed_delay: Duration,
}

impl FixedDelayScheduler {
    pub fn new(dispatcher: SqsDispatcher, fixed_delay: Duration) -> Self {
        Self {
            dispatcher,
            fixed_delay,
        }
    }

    /// Loop until shutdown. A run in progress always finishes; shutdown only
    /// prevents the next one from being armed. A failed run is logged by the
    /// dispatcher and the loop carries on.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(
            queue = %self.dispatcher.queue_name(),
            fixed_delay_ms = self.fixed_delay.as_millis() as u64,
            "Poller started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let _ = self.dispatcher.run_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.fixed_delay) => {}
                _ = shutdown_requested(shutdown.clone()) => break,
            }
        }

        info!(queue = %self.dispatcher.queue_name(), "Poller stopped");
    }
}

//! # Bridge Core
//!
//! Core types, broker strategy traits, and transforms for the rabbit-amazon
//! bridge.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!  bridge files ─►│ BridgeConfigParser   │─► Vec<Bridge>
//!                 └──────────────────────┘
//!                            │
//!          ┌─────────────────┴──────────────────┐
//!          ▼                                    ▼
//!  rabbit ─► TransformChain ─► SNS/SQS    SQS ─► EnvelopeConverter ─► rabbit
//!          (bridge-forwarder)                  (bridge-poller)
//! ```

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod parser;
pub mod spec_engine;
pub mod strategy;
pub mod topology;
pub mod transform;

pub use bridge::*;
pub use config::*;
pub use envelope::*;
pub use error::*;
pub use parser::BridgeConfigParser;
pub use spec_engine::{ChainSpecEngine, CompiledSpec, TransformEngine};
pub use strategy::*;
pub use topology::*;
pub use transform::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bridge::{Bridge, Destination, Source};
    pub use crate::config::BridgeSettings;
    pub use crate::error::{BridgeError, Result};
    pub use crate::strategy::{
        shutdown_requested, AmazonClient, Delivery, Lifecycle, RabbitClient, ShutdownSignal,
        SqsMessage,
    };
    pub use crate::transform::MessageTransformer;
}

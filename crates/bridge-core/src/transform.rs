//! Message transformers for the forward direction
//!
//! Every forward bridge runs its payload through a [`TransformChain`]:
//!
//! ```text
//! raw payload ──► declarative spec (or identity) ──► whitelist scrubber ──► outbound
//!                                                   (only when configured)
//! ```

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::spec_engine::{CompiledSpec, TransformEngine};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

/// Canonical serialization used when a transform produces nothing
pub const EMPTY_OBJECT: &str = "{}";

/// Turns one payload into another
pub trait MessageTransformer: Send + Sync + Debug {
    fn transform(&self, message: &str) -> Result<String>;

    /// Name for logging
    fn name(&self) -> &'static str;
}

fn parse_payload(message: &str) -> Result<Value> {
    serde_json::from_str(message)
        .map_err(|e| BridgeError::transform_with_source("payload is not valid JSON", e))
}

// ============================================================================
// Identity
// ============================================================================

/// Returns the payload untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct DoNothingTransformer;

impl MessageTransformer for DoNothingTransformer {
    fn transform(&self, message: &str) -> Result<String> {
        Ok(message.to_string())
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

// ============================================================================
// Declarative
// ============================================================================

/// Applies a compiled declarative spec
#[derive(Debug, Clone)]
pub struct DeclarativeTransformer {
    spec: Arc<dyn CompiledSpec>,
}

impl DeclarativeTransformer {
    /// Compile once; the compiled spec is shared by every message
    pub fn compile(engine: &dyn TransformEngine, spec: &Value) -> Result<Self> {
        Ok(Self {
            spec: engine.compile(spec)?,
        })
    }
}

impl MessageTransformer for DeclarativeTransformer {
    fn transform(&self, message: &str) -> Result<String> {
        let input = parse_payload(message)?;
        match self.spec.apply(input) {
            None | Some(Value::Null) => Ok(EMPTY_OBJECT.to_string()),
            Some(output) => Ok(output.to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "declarative"
    }
}

// ============================================================================
// Whitelist scrubber
// ============================================================================

/// Drops every field whose dotted path is not whitelisted.
///
/// Arrays do not extend the path: each element is scrubbed at the path of the
/// array itself.
#[derive(Debug, Clone)]
pub struct MessageScrubber {
    whitelisted_fields: BTreeSet<String>,
}

impl MessageScrubber {
    pub fn new(whitelisted_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            whitelisted_fields: whitelisted_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn scrub(&self, document: &Value) -> Result<Value> {
        if is_primitive(document) {
            return Err(BridgeError::transform("primitive json values are not supported"));
        }
        if let Value::Array(items) = document {
            if items.iter().any(is_primitive) {
                return Err(BridgeError::transform(
                    "Array of primitive json values are not supported",
                ));
            }
        }

        Ok(self
            .elide(document, "")
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    fn elide(&self, value: &Value, path: &str) -> Option<Value> {
        match value {
            Value::Object(map) => self.scrub_object(map, path),
            Value::Array(items) => Some(Value::Array(
                items.iter().filter_map(|item| self.elide(item, path)).collect(),
            )),
            leaf => Some(leaf.clone()),
        }
    }

    fn scrub_object(&self, map: &Map<String, Value>, path: &str) -> Option<Value> {
        if map.is_empty() {
            return Some(Value::Object(Map::new()));
        }

        let mut kept = Map::new();
        for (key, value) in map {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };
            if !self.whitelisted_fields.contains(&child_path) {
                continue;
            }
            if let Some(elided) = self.elide(value, &child_path) {
                kept.insert(key.clone(), elided);
            }
        }

        (!kept.is_empty()).then_some(Value::Object(kept))
    }
}

/// Top-level null counts as a primitive; nulls inside arrays are kept
fn is_primitive(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

impl MessageTransformer for MessageScrubber {
    fn transform(&self, message: &str) -> Result<String> {
        let document = parse_payload(message)?;
        if document.is_null() {
            return Err(BridgeError::transform("primitive json values are not supported"));
        }
        Ok(self.scrub(&document)?.to_string())
    }

    fn name(&self) -> &'static str {
        "scrubber"
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Ordered transformers applied to every forwarded payload
#[derive(Debug, Clone)]
pub struct TransformChain {
    stages: Vec<Arc<dyn MessageTransformer>>,
}

impl TransformChain {
    pub fn new(stages: Vec<Arc<dyn MessageTransformer>>) -> Self {
        Self { stages }
    }

    /// Build the chain a bridge asks for, compiling its spec
    pub fn for_bridge(bridge: &Bridge, engine: &dyn TransformEngine) -> Result<Self> {
        let mut stages: Vec<Arc<dyn MessageTransformer>> = Vec::with_capacity(2);

        match &bridge.transform_spec {
            Some(spec) => stages.push(Arc::new(DeclarativeTransformer::compile(engine, spec)?)),
            None => stages.push(Arc::new(DoNothingTransformer)),
        }

        if let Some(fields) = &bridge.whitelisted_fields {
            stages.push(Arc::new(MessageScrubber::new(fields.iter().cloned())));
        }

        Ok(Self { stages })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

impl MessageTransformer for TransformChain {
    fn transform(&self, message: &str) -> Result<String> {
        let mut current = message.to_string();
        for stage in &self.stages {
            current = stage.transform(&current)?;
        }
        Ok(current)
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

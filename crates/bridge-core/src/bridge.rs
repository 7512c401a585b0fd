//! Bridge definitions
//!
//! Two layers live here:
//!
//! - [`BridgeDefinition`]: the wire shape of one entry in a bridge file, with
//!   nullable "one of" blocks exactly as operators write them.
//! - [`Bridge`]: the validated model, where the source and destination are
//!   tagged unions. Only [`crate::parser::BridgeConfigParser`] builds these.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Wire format
// ============================================================================

/// One bridge entry as it appears in a bridge file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<FromDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_specs: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ToDefinition>,

    /// Dotted paths allowed to survive scrubbing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelisted_fields: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_forward_messages: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FromDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rabbit: Option<RabbitFrom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqs: Option<SqsFrom>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sns: Option<SnsTo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqs: Option<SqsTo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rabbit: Option<RabbitTo>,
}

impl ToDefinition {
    pub(crate) fn has_amazon(&self) -> bool {
        self.sns.is_some() || self.sqs.is_some()
    }
}

// ============================================================================
// Endpoints
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitFrom {
    pub exchange: String,
    pub queue_name: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqsFrom {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitTo {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnsTo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqsTo {
    pub name: String,
}

/// Where a bridge reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Rabbit(RabbitFrom),
    Sqs(SqsFrom),
}

/// Where a bridge writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Sns(SnsTo),
    Sqs(SqsTo),
    Rabbit(RabbitTo),
}

impl Destination {
    /// Name used in log lines
    pub fn name(&self) -> &str {
        match self {
            Self::Sns(sns) => &sns.name,
            Self::Sqs(sqs) => &sqs.name,
            Self::Rabbit(rabbit) => &rabbit.exchange,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rabbit(r) => write!(f, "rabbit:{}/{}", r.exchange, r.queue_name),
            Self::Sqs(s) => write!(f, "sqs:{}", s.name),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sns(s) => write!(f, "sns:{}", s.name),
            Self::Sqs(s) => write!(f, "sqs:{}", s.name),
            Self::Rabbit(r) => write!(f, "rabbit:{}/{}", r.exchange, r.routing_key),
        }
    }
}

// ============================================================================
// Validated bridge
// ============================================================================

/// A validated, immutable bridge
#[derive(Debug, Clone, PartialEq)]
pub struct Bridge {
    pub source: Source,
    pub destination: Destination,
    /// Declarative spec; `None` when absent or empty
    pub transform_spec: Option<serde_json::Value>,
    pub whitelisted_fields: Option<BTreeSet<String>>,
    pub forwarding_enabled: bool,
    pub description: Option<String>,
}

impl Bridge {
    /// Build a bridge from its parts. Callers outside the parser are tests and
    /// embedders that already hold valid endpoints.
    pub fn new(source: Source, destination: Destination) -> Self {
        Self {
            source,
            destination,
            transform_spec: None,
            whitelisted_fields: None,
            forwarding_enabled: true,
            description: None,
        }
    }

    pub fn with_transform_spec(mut self, spec: serde_json::Value) -> Self {
        self.transform_spec = normalize_spec(Some(spec));
        self
    }

    pub fn with_whitelist(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.whitelisted_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_forwarding(mut self, enabled: bool) -> Self {
        self.forwarding_enabled = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_from_rabbit(&self) -> bool {
        matches!(self.source, Source::Rabbit(_))
    }

    pub fn is_from_sqs(&self) -> bool {
        matches!(self.source, Source::Sqs(_))
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> String {
        format!("{} -> {}", self.source, self.destination)
    }
}

/// Treat `null`, `[]` and `{}` as "no transform"
pub(crate) fn normalize_spec(spec: Option<serde_json::Value>) -> Option<serde_json::Value> {
    match spec {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Array(ref items)) if items.is_empty() => None,
        Some(serde_json::Value::Object(ref map)) if map.is_empty() => None,
        other => other,
    }
}

/// Bridges reading from rabbit
pub fn forward_bridges(bridges: &[Bridge]) -> Vec<&Bridge> {
    bridges.iter().filter(|b| b.is_from_rabbit()).collect()
}

/// Bridges reading from SQS
pub fn reverse_bridges(bridges: &[Bridge]) -> Vec<&Bridge> {
    bridges.iter().filter(|b| b.is_from_sqs()).collect()
}

//! Error types for the rabbit-amazon bridge
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Primary error type for all bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bridge file could not be read or deserialized
    #[error("Malformed bridge config: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Bridge definitions violate a startup invariant.
    ///
    /// The message is matched verbatim by operators.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Declarative transformation spec failed to compile
    #[error("Spec error: {message}")]
    Spec { message: String },

    /// Payload could not be transformed or converted
    #[error("Transform error: {message}")]
    Transform {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Transport or SDK level failure talking to SNS/SQS
    #[error("Amazon error: {message}")]
    Amazon {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Generic messaging send failure
    #[error("Messaging error: {message}")]
    Messaging {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Rabbit connection, topology or publish errors
    #[error("Rabbit error: {message}")]
    Rabbit {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Message must go to the dead-letter queue without further attempts
    #[error("Rejected without requeue: {0}")]
    RejectAndDontRequeue(#[source] Box<BridgeError>),

    /// Graceful shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create a bridge file parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a bridge file parse error with source
    pub fn config_parse_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a spec compilation error
    pub fn spec(message: impl Into<String>) -> Self {
        Self::Spec {
            message: message.into(),
        }
    }

    /// Create a transform error
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transform error with source
    pub fn transform_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transform {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an Amazon error
    pub fn amazon(message: impl Into<String>) -> Self {
        Self::Amazon {
            message: message.into(),
            source: None,
        }
    }

    /// Create an Amazon error with source
    pub fn amazon_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Amazon {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a messaging error
    pub fn messaging(message: impl Into<String>) -> Self {
        Self::Messaging {
            message: message.into(),
            source: None,
        }
    }

    /// Create a rabbit error
    pub fn rabbit(message: impl Into<String>) -> Self {
        Self::Rabbit {
            message: message.into(),
            source: None,
        }
    }

    /// Create a rabbit error with source
    pub fn rabbit_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Rabbit {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap an error into the dead-letter signal
    pub fn reject(cause: BridgeError) -> Self {
        match cause {
            already @ Self::RejectAndDontRequeue(_) => already,
            other => Self::RejectAndDontRequeue(Box::new(other)),
        }
    }

    /// Check if error belongs to the retryable delivery taxonomy
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Amazon { .. } | Self::Messaging { .. })
    }

    /// Check if error is the dead-letter signal
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::RejectAndDontRequeue(_))
    }

    /// Check if error happened while loading bridge definitions
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse { .. } | Self::Configuration { .. } | Self::Spec { .. }
        )
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub bridge: Option<String>,
    pub message_id: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            bridge: None,
            message_id: None,
        }
    }

    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = Some(bridge.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref bridge) = self.bridge {
            write!(f, " bridge={}", bridge)?;
        }
        if let Some(ref id) = self.message_id {
            write!(f, " message_id={}", id)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                bridge = ?ctx.bridge,
                message_id = ?ctx.message_id,
                "Operation failed"
            );
            e
        })
    }
}

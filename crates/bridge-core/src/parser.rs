//! Bridge file parsing and validation
//!
//! Resources are parsed, flattened in the order given and validated as a
//! whole. Validation is all-or-nothing: the first broken invariant fails the
//! entire set.

use crate::bridge::{
    normalize_spec, Bridge, BridgeDefinition, Destination, FromDefinition, Source, ToDefinition,
};
use crate::error::{BridgeError, Result};
use crate::spec_engine::TransformEngine;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

pub const NO_BRIDGES: &str = "Bridge config should be defined";
pub const FROM_REQUIRED: &str = "A 'from' definition is required";
pub const SINGLE_FROM: &str = "Only one 'from' definition is allowed per bridge";
pub const TO_REQUIRED: &str = "'To' definition is required";
pub const NO_FANOUT: &str =
    "We do not currently support fanout to multiple AWS destinations in one bridge";
pub const AMAZON_DESTINATION_REQUIRED: &str =
    "An SNS or SQS definition is required if messages are coming from rabbit";
pub const NO_RABBIT_TO_RABBIT: &str = "Forwarding rabbit to rabbit is not supported";
pub const NO_SQS_TO_AMAZON: &str = "Forwarding SQS to SQS/SNS is not supported";
pub const RABBIT_DESTINATION_REQUIRED: &str =
    "An rabbit definition is required for messages coming from SQS";
pub const INVALID_TRANSFORMATION_SPEC: &str = "Invalid transformationSpec";

/// Parses bridge resources into validated bridges
#[derive(Clone)]
pub struct BridgeConfigParser {
    engine: Arc<dyn TransformEngine>,
}

impl BridgeConfigParser {
    pub fn new(engine: Arc<dyn TransformEngine>) -> Self {
        Self { engine }
    }

    /// Read and parse bridge files
    pub fn load_files<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<Bridge>> {
        let locations: Vec<_> = paths.iter().map(|p| p.as_ref().display().to_string()).collect();
        info!(paths = ?locations, "Loading bridge config");

        let resources = paths
            .iter()
            .map(|path| {
                let path = path.as_ref();
                std::fs::read(path).map_err(|e| {
                    BridgeError::config_parse_with_source(
                        format!("cannot read bridge file '{}'", path.display()),
                        e,
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.parse(&resources)
    }

    /// Parse raw resources, each a JSON array of bridge objects
    pub fn parse<R: AsRef<[u8]>>(&self, resources: &[R]) -> Result<Vec<Bridge>> {
        let mut definitions = Vec::new();
        for (index, resource) in resources.iter().enumerate() {
            let parsed: Vec<BridgeDefinition> = serde_json::from_slice(resource.as_ref())
                .map_err(|e| {
                    BridgeError::config_parse_with_source(
                        format!("bridge resource #{index} is malformed"),
                        e,
                    )
                })?;
            definitions.extend(parsed);
        }
        self.validate(definitions)
    }

    /// Check every invariant, in order, across all definitions
    pub fn validate(&self, definitions: Vec<BridgeDefinition>) -> Result<Vec<Bridge>> {
        if definitions.is_empty() {
            return Err(BridgeError::config(NO_BRIDGES));
        }

        let routes = definitions
            .iter()
            .map(|def| {
                let source = source_of(def.from.as_ref())?;
                let to = def.to.as_ref().ok_or_else(|| BridgeError::config(TO_REQUIRED))?;
                Ok((source, to))
            })
            .collect::<Result<Vec<_>>>()?;

        for (source, to) in &routes {
            if let Source::Rabbit(_) = source {
                rabbit_destination(to)?;
            }
        }

        for (source, to) in &routes {
            if let Source::Sqs(_) = source {
                sqs_destination(to)?;
            }
        }

        // Only forward bridges apply a transform
        for (def, (source, _)) in definitions.iter().zip(&routes) {
            if !matches!(source, Source::Rabbit(_)) {
                continue;
            }
            if let Some(spec) = normalize_spec(def.transformation_specs.clone()) {
                if let Err(e) = self.engine.compile(&spec) {
                    error!(error = %e, "The provided transformation spec is invalid");
                    return Err(BridgeError::config(INVALID_TRANSFORMATION_SPEC));
                }
            }
        }

        let routes = routes
            .into_iter()
            .map(|(source, to)| {
                let destination = match &source {
                    Source::Rabbit(_) => rabbit_destination(to)?,
                    Source::Sqs(_) => sqs_destination(to)?,
                };
                Ok((source, destination))
            })
            .collect::<Result<Vec<_>>>()?;

        let bridges: Vec<Bridge> = definitions
            .into_iter()
            .zip(routes)
            .map(|(def, (source, destination))| Bridge {
                source,
                destination,
                transform_spec: normalize_spec(def.transformation_specs),
                whitelisted_fields: def
                    .whitelisted_fields
                    .map(|fields| fields.into_iter().collect()),
                forwarding_enabled: def.should_forward_messages.unwrap_or(true),
                description: def.description,
            })
            .collect();

        info!(
            total = bridges.len(),
            forward = bridges.iter().filter(|b| b.is_from_rabbit()).count(),
            reverse = bridges.iter().filter(|b| b.is_from_sqs()).count(),
            "Bridge config validated"
        );
        Ok(bridges)
    }
}

fn source_of(from: Option<&FromDefinition>) -> Result<Source> {
    let Some(from) = from else {
        return Err(BridgeError::config(FROM_REQUIRED));
    };
    match (&from.rabbit, &from.sqs) {
        (Some(rabbit), None) => Ok(Source::Rabbit(rabbit.clone())),
        (None, Some(sqs)) => Ok(Source::Sqs(sqs.clone())),
        (None, None) => Err(BridgeError::config(FROM_REQUIRED)),
        (Some(_), Some(_)) => Err(BridgeError::config(SINGLE_FROM)),
    }
}

fn rabbit_destination(to: &ToDefinition) -> Result<Destination> {
    match (&to.sns, &to.sqs, &to.rabbit) {
        (Some(_), Some(_), _) => Err(BridgeError::config(NO_FANOUT)),
        (_, _, Some(_)) => Err(BridgeError::config(NO_RABBIT_TO_RABBIT)),
        (Some(sns), None, None) => Ok(Destination::Sns(sns.clone())),
        (None, Some(sqs), None) => Ok(Destination::Sqs(sqs.clone())),
        (None, None, None) => Err(BridgeError::config(AMAZON_DESTINATION_REQUIRED)),
    }
}

fn sqs_destination(to: &ToDefinition) -> Result<Destination> {
    if to.has_amazon() {
        return Err(BridgeError::config(NO_SQS_TO_AMAZON));
    }
    to.rabbit
        .clone()
        .map(Destination::Rabbit)
        .ok_or_else(|| BridgeError::config(RABBIT_DESTINATION_REQUIRED))
}

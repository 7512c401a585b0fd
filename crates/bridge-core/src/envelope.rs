//! Conversion of SQS message bodies into rabbit payloads

use crate::error::{BridgeError, Result};
use serde_json::Value;

/// Field marking an SNS notification envelope
pub const ENVELOPE_MESSAGE_FIELD: &str = "Message";

/// Field injected when idempotency keys are enabled
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotencyKey";

/// Unwraps notification envelopes and stamps idempotency keys
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeConverter;

impl EnvelopeConverter {
    /// Convert an incoming body.
    ///
    /// With `idempotency_key` set, the payload gains a trailing
    /// `idempotencyKey` field holding `{prefix}/{message_id}`. Only object
    /// payloads can carry it.
    pub fn convert(
        &self,
        body: &str,
        message_id: &str,
        prefix: &str,
        idempotency_key: Option<&str>,
    ) -> Result<String> {
        let parsed: Value = serde_json::from_str(body)
            .map_err(|e| BridgeError::transform_with_source("SQS body is not valid JSON", e))?;

        let payload = Self::extract_payload(parsed)?;

        if idempotency_key.is_none() {
            return Ok(payload.to_string());
        }

        match payload {
            Value::Object(mut map) => {
                map.insert(
                    IDEMPOTENCY_KEY_FIELD.to_string(),
                    Value::String(format!("{prefix}/{message_id}")),
                );
                Ok(Value::Object(map).to_string())
            }
            other => Err(BridgeError::transform(format!(
                "cannot add {IDEMPOTENCY_KEY_FIELD} to a non-object payload ({})",
                kind(&other)
            ))),
        }
    }

    fn extract_payload(parsed: Value) -> Result<Value> {
        let Value::Object(mut envelope) = parsed else {
            return Ok(parsed);
        };

        match envelope.remove(ENVELOPE_MESSAGE_FIELD) {
            None => Ok(Value::Object(envelope)),
            Some(Value::String(inner)) => serde_json::from_str(&inner).map_err(|e| {
                BridgeError::transform_with_source("notification Message is not valid JSON", e)
            }),
            Some(inner) => Ok(inner),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Array(_) => "array",
        Value::Null => "null",
        _ => "scalar",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONVERTER: EnvelopeConverter = EnvelopeConverter;

    #[test]
    fn test_unwraps_notification_envelope() {
        let body = r#"{"Type":"Notification","MessageId":"sns-1","Message":"{\"k\":\"v\"}"}"#;
        assert_eq!(CONVERTER.convert(body, "m1", "pfx", None).unwrap(), r#"{"k":"v"}"#);
    }

    #[test]
    fn test_plain_body_is_unchanged() {
        assert_eq!(
            CONVERTER.convert(r#"{"k":"v"}"#, "m1", "pfx", None).unwrap(),
            r#"{"k":"v"}"#
        );
    }

    #[test]
    fn test_object_message_field_is_used_directly() {
        let body = r#"{"Message":{"k":"v"}}"#;
        assert_eq!(CONVERTER.convert(body, "m1", "pfx", None).unwrap(), r#"{"k":"v"}"#);
    }

    #[test]
    fn test_idempotency_key_is_appended() {
        assert_eq!(
            CONVERTER
                .convert(r#"{"k":"v"}"#, "m1", "pfx", Some("id1"))
                .unwrap(),
            r#"{"k":"v","idempotencyKey":"pfx/m1"}"#
        );

        let body = r#"{"Message":"{\"z\":1,\"a\":2}"}"#;
        assert_eq!(
            CONVERTER.convert(body, "m2", "orders", Some("on")).unwrap(),
            r#"{"z":1,"a":2,"idempotencyKey":"orders/m2"}"#
        );
    }

    #[test]
    fn test_idempotency_key_on_non_object_fails() {
        let err = CONVERTER
            .convert(r#"{"Message":"[1,2]"}"#, "m1", "pfx", Some("id1"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transform { .. }));

        // Without a key the array goes through untouched
        assert_eq!(
            CONVERTER.convert(r#"{"Message":"[1,2]"}"#, "m1", "pfx", None).unwrap(),
            "[1,2]"
        );
    }

    #[test]
    fn test_invalid_json_fails() {
        assert!(CONVERTER.convert("nope", "m1", "pfx", None).is_err());
        assert!(CONVERTER
            .convert(r#"{"Message":"not json"}"#, "m1", "pfx", None)
            .is_err());
    }
}

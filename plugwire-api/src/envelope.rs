//! Envelope: the single wire message shared by requests, responses and
//! cancellations.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One line of the protocol stream.
///
/// Three logical variants share this schema:
///
/// | variant  | fields                        |
/// |----------|-------------------------------|
/// | request  | `id`, `method`, `data?`       |
/// | response | `id`, `data?` or `id`, `err`  |
/// | cancel   | `cancel`                      |
///
/// Absent fields are omitted on the wire. Unknown fields are ignored when
/// decoding, and empty strings are read as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Request identifier, echoed by the response
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty"
    )]
    pub id: Option<String>,

    /// Identifier of the request to cancel
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty"
    )]
    pub cancel: Option<String>,

    /// Method name (request side only)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty"
    )]
    pub method: Option<String>,

    /// Error message (failed responses only)
    #[serde(
        default,
        rename = "err",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty"
    )]
    pub error: Option<String>,

    /// Call arguments or call result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Classification of a decoded envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
    Cancel,
    /// Neither `id` nor `cancel` is set
    Invalid,
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

impl Envelope {
    /// Create a request envelope. A null argument is sent without `data`.
    pub fn request(id: impl Into<String>, method: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            data: (!data.is_null()).then_some(data),
            ..Self::default()
        }
    }

    /// Create a successful response. A null result is sent without `data`.
    pub fn response_ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            data: (!data.is_null()).then_some(data),
            ..Self::default()
        }
    }

    /// Create a failed response
    pub fn response_err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Create a cancellation message for a request id
    pub fn cancel(id: impl Into<String>) -> Self {
        Self {
            cancel: Some(id.into()),
            ..Self::default()
        }
    }

    /// Classify this envelope.
    ///
    /// A set `cancel` wins over everything else; otherwise an envelope with an
    /// `id` is a request when it names a method and a response when it doesn't.
    pub fn kind(&self) -> EnvelopeKind {
        match (&self.cancel, &self.id, &self.method) {
            (Some(_), _, _) => EnvelopeKind::Cancel,
            (None, None, _) => EnvelopeKind::Invalid,
            (None, Some(_), Some(_)) => EnvelopeKind::Request,
            (None, Some(_), None) => EnvelopeKind::Response,
        }
    }

    /// The payload, or `null` when absent
    pub fn data_or_null(&self) -> Value {
        self.data.clone().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_omits_absent_fields() {
        let env = Envelope::request("1", "add", json!({"a": 2, "b": 3}));
        let line = serde_json::to_string(&env).unwrap();
        assert_eq!(line, r#"{"id":"1","method":"add","data":{"a":2,"b":3}}"#);
    }

    #[test]
    fn test_request_with_null_argument_omits_data() {
        let env = Envelope::request("2", "count", Value::Null);
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"id":"2","method":"count"}"#
        );
        assert_eq!(env.data_or_null(), Value::Null);
    }

    #[test]
    fn test_response_never_carries_null_data() {
        let env = Envelope::response_ok("a", Value::Null);
        assert_eq!(serde_json::to_string(&env).unwrap(), r#"{"id":"a"}"#);

        let env = Envelope::response_err("a", "boom");
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"id":"a","err":"boom"}"#
        );
    }

    #[test]
    fn test_cancel_carries_only_cancel() {
        let env = Envelope::cancel("ff");
        assert_eq!(serde_json::to_string(&env).unwrap(), r#"{"cancel":"ff"}"#);
        assert_eq!(env.kind(), EnvelopeKind::Cancel);
    }

    #[test]
    fn test_empty_strings_decode_as_absent() {
        let env: Envelope =
            serde_json::from_str(r#"{"cancel":"","id":"3","method":"add","err":""}"#).unwrap();
        assert_eq!(env.cancel, None);
        assert_eq!(env.error, None);
        assert_eq!(env.kind(), EnvelopeKind::Request);
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let env: Envelope =
            serde_json::from_str(r#"{"id":"7","data":1,"trace":"x","v":2}"#).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Response);
        assert_eq!(env.data, Some(json!(1)));
    }

    #[test]
    fn test_kind_classification() {
        let invalid: Envelope = serde_json::from_str(r#"{"method":"add"}"#).unwrap();
        assert_eq!(invalid.kind(), EnvelopeKind::Invalid);

        let cancel: Envelope = serde_json::from_str(r#"{"cancel":"2","id":"2"}"#).unwrap();
        assert_eq!(cancel.kind(), EnvelopeKind::Cancel);
    }

    #[test]
    fn test_null_data_decodes_as_none() {
        let env: Envelope = serde_json::from_str(r#"{"id":"1","data":null}"#).unwrap();
        assert_eq!(env.data, None);
        assert_eq!(env.data_or_null(), Value::Null);
    }
}

//! Message contract between a caller and the broker.
//!
//! Messages are JSON objects tagged by `type`.  Inbound kinds are `PING`,
//! `GET_STATUS`, `GET_PROVIDERS` and `REQUEST`; outbound kinds are `PONG`,
//! `STATUS`, `PROVIDERS`, `RESPONSE` and `STREAM_CHUNK`.  Field names are
//! camelCase on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerError;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A message received from a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum InboundMessage {
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
    GetStatus {
        #[serde(default)]
        request_id: Option<String>,
    },
    GetProviders {
        #[serde(default)]
        request_id: Option<String>,
    },
    Request {
        request_id: String,
        payload: RequestPayload,
        #[serde(default)]
        origin_domain: String,
    },
}

impl InboundMessage {
    /// Correlation id, empty when the caller did not supply one.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Ping { request_id }
            | Self::GetStatus { request_id }
            | Self::GetProviders { request_id } => request_id.as_deref().unwrap_or_default(),
            Self::Request { request_id, .. } => request_id,
        }
    }
}

/// The proxied call a `REQUEST` asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

fn default_method() -> String {
    "GET".to_owned()
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A message sent back to a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum OutboundMessage {
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        installed: bool,
        unlocked: bool,
        version: String,
    },
    Providers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        providers: Vec<ProviderInfo>,
    },
    Response(ResponseMessage),
    StreamChunk(StreamChunk),
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl ResponseMessage {
    pub fn ok(request_id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(request_id: impl Into<String>, error: &BrokerError) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            error: Some(ErrorBody {
                code: error.code().to_owned(),
                message: error.to_string(),
            }),
            data: None,
        }
    }
}

/// Structured error in a failed `RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Upstream result in a successful `RESPONSE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// One piece of a streamed upstream body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub request_id: String,
    pub chunk: String,
    pub done: bool,
}

/// Provider listing entry for `PROVIDERS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub has_credential: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_request_message() {
        let raw = json!({
            "type": "REQUEST",
            "requestId": "r1",
            "originDomain": "example.com",
            "payload": {
                "provider": "openai",
                "endpoint": "/v1/chat/completions",
                "method": "POST",
                "headers": {"Content-Type": "application/json"},
                "body": {"model": "gpt-4o"},
                "stream": true
            }
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        let InboundMessage::Request {
            request_id,
            payload,
            origin_domain,
        } = msg
        else {
            panic!("expected REQUEST");
        };
        assert_eq!(request_id, "r1");
        assert_eq!(origin_domain, "example.com");
        assert_eq!(payload.provider.as_deref(), Some("openai"));
        assert_eq!(payload.stream, Some(true));
        assert_eq!(payload.body, Some(json!({"model": "gpt-4o"})));
    }

    #[test]
    fn parses_bare_ping() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Ping { request_id: None });
        assert_eq!(msg.request_id(), "");
    }

    #[test]
    fn method_defaults_to_get() {
        let payload: RequestPayload = serde_json::from_str(r#"{"provider":"openai"}"#).unwrap();
        assert_eq!(payload.method, "GET");
        assert_eq!(payload.endpoint, "");
    }

    #[test]
    fn error_response_shape() {
        let msg = OutboundMessage::Response(ResponseMessage::err(
            "r2",
            &BrokerError::DomainNotAllowed {
                domain: "other.com".into(),
            },
        ));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "RESPONSE");
        assert_eq!(v["requestId"], "r2");
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["code"], "DomainNotAllowed");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn stream_chunk_shape() {
        let msg = OutboundMessage::StreamChunk(StreamChunk {
            request_id: "r3".into(),
            chunk: "Hello".into(),
            done: false,
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"type": "STREAM_CHUNK", "requestId": "r3", "chunk": "Hello", "done": false})
        );
    }

    #[test]
    fn status_and_providers_shape() {
        let v = serde_json::to_value(OutboundMessage::Status {
            request_id: None,
            installed: true,
            unlocked: false,
            version: "0.1.0".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "STATUS");
        assert_eq!(v["installed"], true);

        let v = serde_json::to_value(OutboundMessage::Providers {
            request_id: Some("p".into()),
            providers: vec![ProviderInfo {
                id: "openai".into(),
                name: "OpenAI".into(),
                has_credential: true,
            }],
        })
        .unwrap();
        assert_eq!(v["providers"][0]["hasCredential"], true);
    }
}

//! Outbound HTTP capability.
//!
//! The broker never talks to the network directly; it goes through a
//! [`Transport`] supplied by the host.  [`ReqwestTransport`] is the
//! production implementation.  Tests substitute a scripted transport.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Failure reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be built (bad method, header, or URL).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The connection failed or no response arrived.
    #[error("connection failed: {reason}")]
    Connect { reason: String },

    /// Reading the response body failed part way through.
    #[error("read failed: {reason}")]
    Read { reason: String },
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest {
                reason: err.to_string(),
            }
        } else if err.is_body() || err.is_decode() {
            Self::Read {
                reason: err.to_string(),
            }
        } else {
            Self::Connect {
                reason: err.to_string(),
            }
        }
    }
}

/// A fully composed outbound request.
#[derive(Clone)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    /// Headers in the order they should be applied.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl std::fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("header_names", &names)
            .field("body_len", &self.body.as_ref().map(String::len))
            .finish()
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// A response whose body is read incrementally.
pub struct StreamingResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

/// Capability to perform outbound HTTP calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the call and buffer the whole response body.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Perform the call and hand back the body as a stream of byte chunks in
    /// the order received.
    async fn send_streaming(
        &self,
        request: TransportRequest,
    ) -> Result<StreamingResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// [`Transport`] backed by a shared `reqwest::Client`.
///
/// Only connection establishment is bounded by a timeout; request duration
/// is bounded by the caller.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    fn build(&self, request: TransportRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = parse_method(&request.method).ok_or_else(|| TransportError::InvalidRequest {
            reason: format!("unsupported HTTP method `{}`", request.method),
        })?;
        let url = url::Url::parse(&request.url).map_err(|e| TransportError::InvalidRequest {
            reason: format!("invalid URL: {e}"),
        })?;

        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                TransportError::InvalidRequest {
                    reason: format!("invalid header name `{key}`: {e}"),
                }
            })?;
            // Never echo the value: it may be the credential.
            let value = HeaderValue::from_str(value).map_err(|_| TransportError::InvalidRequest {
                reason: format!("invalid header value for `{key}`"),
            })?;
            headers.insert(name, value);
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        debug!(method = %request.method, url = %request.url, "sending upstream request");
        let response = self.build(request)?.send().await?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await.map_err(|e| TransportError::Read {
            reason: e.to_string(),
        })?;

        Ok(TransportResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    async fn send_streaming(
        &self,
        request: TransportRequest,
    ) -> Result<StreamingResponse, TransportError> {
        debug!(method = %request.method, url = %request.url, "opening upstream stream");
        let response = self.build(request)?.send().await?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map(|b| b.to_vec()).map_err(|e| TransportError::Read {
                    reason: e.to_string(),
                })
            })
            .boxed();

        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }
}

/// Parse an HTTP method name.
pub fn parse_method(method: &str) -> Option<reqwest::Method> {
    match method.to_uppercase().as_str() {
        "GET" => Some(reqwest::Method::GET),
        "POST" => Some(reqwest::Method::POST),
        "PUT" => Some(reqwest::Method::PUT),
        "PATCH" => Some(reqwest::Method::PATCH),
        "DELETE" => Some(reqwest::Method::DELETE),
        "HEAD" => Some(reqwest::Method::HEAD),
        _ => None,
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_owned(),
                v.to_str().unwrap_or("<binary>").to_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new("keyhaven-test", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn parse_method_supported_methods() {
        assert_eq!(parse_method("GET"), Some(reqwest::Method::GET));
        assert_eq!(parse_method("post"), Some(reqwest::Method::POST));
        assert_eq!(parse_method("Patch"), Some(reqwest::Method::PATCH));
        assert_eq!(parse_method("OPTIONS"), None);
        assert_eq!(parse_method(""), None);
    }

    #[test]
    fn build_rejects_bad_header_without_leaking_value() {
        let err = transport()
            .build(TransportRequest {
                method: "POST".into(),
                url: "https://api.openai.com/v1/models".into(),
                headers: vec![("Authorization".into(), "Bearer sk-\nsecret".into())],
                body: None,
            })
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("Authorization"));
        assert!(!msg.contains("sk-"));
    }

    #[test]
    fn build_rejects_unknown_method() {
        let result = transport().build(TransportRequest {
            method: "BREW".into(),
            url: "https://example.com".into(),
            headers: Vec::new(),
            body: None,
        });
        assert!(matches!(result, Err(TransportError::InvalidRequest { .. })));
    }

    #[test]
    fn debug_omits_header_values() {
        let req = TransportRequest {
            method: "GET".into(),
            url: "https://example.com".into(),
            headers: vec![("x-api-key".into(), "top-secret".into())],
            body: Some("{}".into()),
        };
        let rendered = format!("{req:?}");
        assert!(rendered.contains("x-api-key"));
        assert!(!rendered.contains("top-secret"));
    }

    #[tokio::test]
    async fn unreachable_host_is_connect_error() {
        let result = transport()
            .send(TransportRequest {
                method: "GET".into(),
                url: "http://127.0.0.1:9/".into(),
                headers: Vec::new(),
                body: None,
            })
            .await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}

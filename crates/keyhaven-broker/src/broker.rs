//! Authorization and proxying of caller requests.
//!
//! [`RequestBroker::authorize_and_proxy`] runs the checks in a fixed order
//! and stops at the first failure:
//!
//! 1. the vault is unlocked (`Locked`);
//! 2. activity is recorded with the session guard;
//! 3. the caller's origin is on the allow-list (`DomainNotAllowed`);
//! 4. the provider id resolves in the provider table (`InvalidRequest`);
//! 5. a credential exists for the provider (`NoCredential`);
//! 6. a base URL can be resolved (`InvalidRequest`).
//!
//! It then composes headers (caller headers, then the injected auth header,
//! then provider fixed headers, each later one replacing an earlier header
//! of the same name), performs the call and appends a history entry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use keyhaven_vault::{CredentialEntry, HistoryEntry, ProviderConfig, VaultManager, find_provider};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::allowlist::{DomainAllowList, normalize_origin};
use crate::error::{BrokerError, Result};
use crate::history::HistoryLog;
use crate::protocol::{OutboundMessage, RequestPayload, StreamChunk};
use crate::session::SessionGuard;
use crate::transport::{Transport, TransportRequest, parse_method};

// ---------------------------------------------------------------------------
// Intent and result
// ---------------------------------------------------------------------------

/// What a caller wants the broker to do.
#[derive(Debug, Clone, Default)]
pub struct ProxyIntent {
    pub provider_id: Option<String>,
    pub endpoint_path: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub streaming: bool,
    pub caller_origin: String,
    pub caller_endpoint_url: Option<String>,
}

impl ProxyIntent {
    /// Build an intent from a `REQUEST` payload and its origin.
    pub fn from_payload(payload: RequestPayload, origin: impl Into<String>) -> Self {
        Self {
            provider_id: payload.provider,
            endpoint_path: payload.endpoint,
            method: payload.method,
            headers: payload.headers.unwrap_or_default(),
            body: payload.body,
            streaming: payload.stream.unwrap_or(false),
            caller_origin: origin.into(),
            caller_endpoint_url: payload.endpoint_url,
        }
    }
}

/// Upstream result.  For streamed calls `body` is the concatenated text.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResult {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Everything resolved by the authorization phase.
struct Authorized {
    provider: &'static ProviderConfig,
    caller_domain: String,
    request: TransportRequest,
}

// ---------------------------------------------------------------------------
// RequestBroker
// ---------------------------------------------------------------------------

/// Brokers outbound calls on behalf of allow-listed callers.
pub struct RequestBroker {
    vault: Arc<VaultManager>,
    session: SessionGuard,
    allowlist: DomainAllowList,
    history: HistoryLog,
    transport: Arc<dyn Transport>,
}

impl RequestBroker {
    pub fn new(
        vault: Arc<VaultManager>,
        session: SessionGuard,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let store = vault.store().clone();
        Self {
            vault,
            session,
            allowlist: DomainAllowList::new(store.clone()),
            history: HistoryLog::new(store),
            transport,
        }
    }

    pub fn vault(&self) -> &Arc<VaultManager> {
        &self.vault
    }

    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    pub fn allowlist(&self) -> &DomainAllowList {
        &self.allowlist
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Authorize `intent` and perform the call.
    ///
    /// Streamed calls emit ordered `STREAM_CHUNK`s tagged with `request_id`
    /// on `chunks`, always ending with a `done` chunk, even on failure.
    pub async fn authorize_and_proxy(
        &self,
        request_id: &str,
        intent: ProxyIntent,
        chunks: &mpsc::Sender<OutboundMessage>,
    ) -> Result<ProxyResult> {
        let streaming = intent.streaming;
        let endpoint_path = intent.endpoint_path.clone();

        let authorized = match self.authorize(intent).await {
            Ok(a) => a,
            Err(e) => {
                warn!(request_id, code = e.code(), "request rejected");
                return Err(e);
            }
        };
        debug!(
            request_id,
            provider = authorized.provider.id,
            caller = %authorized.caller_domain,
            streaming,
            "request authorized"
        );

        let started = Instant::now();
        let (status, outcome) = if streaming {
            self.proxy_streaming(request_id, authorized.request, chunks)
                .await
        } else {
            self.proxy_buffered(authorized.request).await
        };

        self.log(
            authorized.provider.id,
            endpoint_path,
            authorized.caller_domain,
            status,
            started,
        )
        .await;

        if let Err(e) = &outcome {
            warn!(request_id, error = %e, "upstream call failed");
        }
        outcome
    }

    async fn authorize(&self, intent: ProxyIntent) -> Result<Authorized> {
        if !self.vault.is_unlocked() {
            return Err(BrokerError::Locked);
        }

        if let Err(e) = self.session.record_activity().await {
            warn!(error = %e, "failed to record activity");
        }

        let caller_domain = normalize_origin(&intent.caller_origin).unwrap_or_default();
        if caller_domain.is_empty() || !self.allowlist.contains(&caller_domain).await? {
            return Err(BrokerError::DomainNotAllowed {
                domain: if caller_domain.is_empty() {
                    intent.caller_origin.clone()
                } else {
                    caller_domain
                },
            });
        }

        let provider_id = intent
            .provider_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BrokerError::invalid("missing provider"))?;
        let provider = find_provider(provider_id)
            .ok_or_else(|| BrokerError::invalid(format!("unknown provider: {provider_id}")))?;

        let credential =
            self.vault
                .find_by_provider(provider.id)?
                .ok_or_else(|| BrokerError::NoCredential {
                    provider: provider.id.to_owned(),
                })?;

        let base_url = self
            .resolve_base_url(provider, &credential, intent.caller_endpoint_url.as_deref())
            .await?;
        let url = join_endpoint(&base_url, &intent.endpoint_path)?;

        if parse_method(&intent.method).is_none() {
            return Err(BrokerError::invalid(format!(
                "unsupported HTTP method `{}`",
                intent.method
            )));
        }

        let (headers, body) = compose(provider, &credential, intent.headers, intent.body);

        Ok(Authorized {
            provider,
            caller_domain,
            request: TransportRequest {
                method: intent.method.to_uppercase(),
                url,
                headers,
                body,
            },
        })
    }

    /// Pick the base URL for the call.
    ///
    /// Self-hosted providers take the caller-supplied URL, then the URL
    /// stored on the credential, then the custom endpoint map.  Fixed
    /// providers ignore the caller and use the stored/custom endpoint if the
    /// owner configured one, else the table default.
    async fn resolve_base_url(
        &self,
        provider: &ProviderConfig,
        credential: &CredentialEntry,
        caller_url: Option<&str>,
    ) -> Result<String> {
        let stored = match &credential.endpoint_url {
            Some(url) if !url.trim().is_empty() => Some(url.clone()),
            _ => self.vault.custom_endpoint(&credential.id).await?,
        };

        let resolved = if provider.requires_caller_endpoint {
            caller_url
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_owned)
                .or(stored)
        } else {
            Some(stored.unwrap_or_else(|| provider.base_url.to_owned()))
        };

        resolved.ok_or_else(|| {
            BrokerError::invalid(format!("provider {} requires an endpoint URL", provider.id))
        })
    }

    async fn proxy_buffered(&self, request: TransportRequest) -> (u16, Result<ProxyResult>) {
        match self.transport.send(request).await {
            Ok(response) => {
                let body = decode_body(&response.headers, &response.body);
                (
                    response.status,
                    Ok(ProxyResult {
                        status: response.status,
                        headers: response.headers,
                        body,
                    }),
                )
            }
            Err(e) => (0, Err(BrokerError::from(e))),
        }
    }

    async fn proxy_streaming(
        &self,
        request_id: &str,
        request: TransportRequest,
        chunks: &mpsc::Sender<OutboundMessage>,
    ) -> (u16, Result<ProxyResult>) {
        let response = match self.transport.send_streaming(request).await {
            Ok(r) => r,
            Err(e) => {
                emit_done(request_id, chunks).await;
                return (0, Err(BrokerError::from(e)));
            }
        };

        let mut body = response.body;
        let mut pending: Vec<u8> = Vec::new();
        let mut full = String::new();

        while let Some(next) = body.next().await {
            let bytes = match next {
                Ok(b) => b,
                Err(e) => {
                    emit_done(request_id, chunks).await;
                    return (0, Err(BrokerError::from(e)));
                }
            };
            pending.extend_from_slice(&bytes);
            let text = drain_utf8(&mut pending);
            if text.is_empty() {
                continue;
            }
            full.push_str(&text);
            if !emit(request_id, text, false, chunks).await {
                return (
                    0,
                    Err(BrokerError::NetworkError {
                        reason: "stream cancelled by caller".into(),
                    }),
                );
            }
        }

        if !pending.is_empty() {
            let tail = String::from_utf8_lossy(&pending).into_owned();
            full.push_str(&tail);
            emit(request_id, tail, false, chunks).await;
        }
        emit_done(request_id, chunks).await;

        (
            response.status,
            Ok(ProxyResult {
                status: response.status,
                headers: response.headers,
                body: Value::String(full),
            }),
        )
    }

    async fn log(
        &self,
        provider_id: &str,
        endpoint_path: String,
        caller_domain: String,
        status: u16,
        started: Instant,
    ) {
        let entry = HistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            provider_id: provider_id.to_owned(),
            endpoint_path,
            caller_domain,
            http_status: status,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        match self.history.record(entry).await {
            Ok(_) => info!(provider = provider_id, status, "request completed"),
            Err(e) => warn!(error = %e, "failed to record history"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Join a base URL and an endpoint path with exactly one `/`.
///
/// The path must be relative: absolute URLs and scheme-relative paths are
/// rejected, and the joined URL must stay on the base URL's host.  The query
/// string may carry URLs.
fn join_endpoint(base: &str, path: &str) -> Result<String> {
    let path = path.trim();
    let route = path.split_once('?').map_or(path, |(route, _)| route);
    if route.contains("://") || path.starts_with("//") {
        return Err(BrokerError::invalid("endpoint must be a path, not a URL"));
    }

    let joined = if path.is_empty() {
        base.trim_end_matches('/').to_owned()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    let base_url = url::Url::parse(base)
        .map_err(|e| BrokerError::invalid(format!("invalid base URL: {e}")))?;
    let joined_url = url::Url::parse(&joined)
        .map_err(|e| BrokerError::invalid(format!("invalid endpoint URL: {e}")))?;
    if !matches!(base_url.scheme(), "http" | "https") || base_url.host() != joined_url.host() {
        return Err(BrokerError::invalid("endpoint resolves outside the provider host"));
    }

    Ok(joined)
}

/// Replace any header named `name` (case-insensitively) and append it.
fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    headers.push((name.to_owned(), value));
}

/// Compose the outbound header list and body.
fn compose(
    provider: &ProviderConfig,
    credential: &CredentialEntry,
    caller_headers: BTreeMap<String, String>,
    body: Option<Value>,
) -> (Vec<(String, String)>, Option<String>) {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(caller_headers.len() + 3);
    for (name, value) in caller_headers {
        set_header(&mut headers, &name, value);
    }

    set_header(
        &mut headers,
        provider.auth_header,
        format!("{}{}", provider.auth_prefix, credential.secret_value),
    );
    for (name, value) in provider.extra_headers {
        set_header(&mut headers, name, (*value).to_owned());
    }

    let body = match body {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            if !headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            {
                headers.push(("Content-Type".to_owned(), "application/json".to_owned()));
            }
            Some(other.to_string())
        }
    };

    (headers, body)
}

/// Parse a body as JSON when the response declares a JSON content type,
/// falling back to text.
fn decode_body(headers: &BTreeMap<String, String>, body: &[u8]) -> Value {
    let is_json = headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v.to_ascii_lowercase().contains("json"));
    if is_json {
        if let Ok(v) = serde_json::from_slice(body) {
            return v;
        }
    }
    Value::String(String::from_utf8_lossy(body).into_owned())
}

/// Take the longest valid UTF-8 prefix out of `pending`, leaving an
/// incomplete trailing sequence in place.  Invalid bytes become U+FFFD.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Send one chunk.  Returns `false` if the receiver is gone.
async fn emit(
    request_id: &str,
    chunk: String,
    done: bool,
    chunks: &mpsc::Sender<OutboundMessage>,
) -> bool {
    chunks
        .send(OutboundMessage::StreamChunk(StreamChunk {
            request_id: request_id.to_owned(),
            chunk,
            done,
        }))
        .await
        .is_ok()
}

async fn emit_done(request_id: &str, chunks: &mpsc::Sender<OutboundMessage>) {
    if !emit(request_id, String::new(), true, chunks).await {
        debug!(request_id, "stream receiver gone before done marker");
    }
}

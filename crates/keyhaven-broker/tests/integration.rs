//! Integration tests for the keyhaven-broker crate.
//!
//! A scripted transport stands in for the network so that the full path
//! (authorization, credential injection, streaming, history and auto-lock)
//! can be exercised deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use keyhaven_broker::{
    BrokerError, MessageHandler, OutboundMessage, ProxyIntent, RequestBroker, SessionGuard,
    StreamChunk, StreamingResponse, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use keyhaven_kernel::IpcBus;
use keyhaven_vault::{CredentialStore, NewCredential, VaultManager, VaultStatus};
use serde_json::json;
use tokio::sync::{Notify, mpsc};

// ═══════════════════════════════════════════════════════════════════════
//  Scripted transport
// ═══════════════════════════════════════════════════════════════════════

enum Scripted {
    Reply {
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
    },
    Stream {
        status: u16,
        chunks: Vec<Result<Vec<u8>, TransportError>>,
    },
    Refuse,
}

fn reply_json(status: u16, body: serde_json::Value) -> Scripted {
    Scripted::Reply {
        status,
        content_type: "application/json",
        body: body.to_string().into_bytes(),
    }
}

fn stream(parts: &[&[u8]]) -> Scripted {
    Scripted::Stream {
        status: 200,
        chunks: parts.iter().map(|p| Ok(p.to_vec())).collect(),
    }
}

#[derive(Default)]
struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<TransportRequest>>,
    hold: Option<Arc<Notify>>,
}

impl MockTransport {
    fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    fn held(mut self, gate: Arc<Notify>) -> Self {
        self.hold = Some(gate);
        self
    }

    fn seen(&self) -> Vec<TransportRequest> {
        self.seen.lock().unwrap().clone()
    }

    async fn next(&self, request: TransportRequest) -> Scripted {
        self.seen.lock().unwrap().push(request);
        if let Some(gate) = &self.hold {
            gate.notified().await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Scripted::Refuse)
    }
}

fn content_type(value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("content-type".to_owned(), value.to_owned())])
}

fn refused() -> TransportError {
    TransportError::Connect {
        reason: "connection refused".into(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        match self.next(request).await {
            Scripted::Reply {
                status,
                content_type: ct,
                body,
            } => Ok(TransportResponse {
                status,
                headers: content_type(ct),
                body,
            }),
            Scripted::Stream { .. } => panic!("buffered call got a streaming script"),
            Scripted::Refuse => Err(refused()),
        }
    }

    async fn send_streaming(
        &self,
        request: TransportRequest,
    ) -> Result<StreamingResponse, TransportError> {
        match self.next(request).await {
            Scripted::Stream { status, chunks } => Ok(StreamingResponse {
                status,
                headers: content_type("text/event-stream"),
                body: futures::stream::iter(chunks).boxed(),
            }),
            Scripted::Reply { .. } => panic!("streaming call got a buffered script"),
            Scripted::Refuse => Err(refused()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Harness
// ═══════════════════════════════════════════════════════════════════════

struct Harness {
    vault: Arc<VaultManager>,
    session: SessionGuard,
    broker: Arc<RequestBroker>,
    transport: Arc<MockTransport>,
}

/// Unlocked vault with an OpenAI credential and `example.com` allowed.
async fn harness(transport: MockTransport) -> Harness {
    let vault = Arc::new(
        VaultManager::load(CredentialStore::in_memory(), IpcBus::new(32))
            .await
            .unwrap(),
    );
    vault.create("pw").await.unwrap();
    vault
        .add_credential(&NewCredential::new("openai", "sk-real"))
        .await
        .unwrap();

    let session = SessionGuard::new(Arc::clone(&vault));
    let transport = Arc::new(transport);
    let broker = Arc::new(RequestBroker::new(
        Arc::clone(&vault),
        session.clone(),
        transport.clone(),
    ));
    broker.allowlist().add("example.com").await.unwrap();

    Harness {
        vault,
        session,
        broker,
        transport,
    }
}

fn intent(provider: &str, path: &str) -> ProxyIntent {
    ProxyIntent {
        provider_id: Some(provider.to_owned()),
        endpoint_path: path.to_owned(),
        method: "GET".to_owned(),
        caller_origin: "https://example.com".to_owned(),
        ..ProxyIntent::default()
    }
}

async fn proxy(h: &Harness, intent: ProxyIntent) -> Result<keyhaven_broker::ProxyResult, BrokerError> {
    let (tx, _rx) = mpsc::channel(64);
    h.broker.authorize_and_proxy("r", intent, &tx).await
}

async fn last_status(h: &Harness) -> u16 {
    h.broker.history().list(Some(1)).await.unwrap()[0].http_status
}

fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Ok(m) = rx.try_recv() {
        out.push(m);
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Authorization
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn origin_not_on_allow_list_is_rejected() {
    let h = harness(MockTransport::new([reply_json(200, json!({}))])).await;

    let mut from_other = intent("openai", "/v1/models");
    from_other.caller_origin = "https://other.com".into();
    let result = proxy(&h, from_other).await;
    assert!(matches!(result, Err(BrokerError::DomainNotAllowed { .. })));

    let mut from_sub = intent("openai", "/v1/models");
    from_sub.caller_origin = "https://app.example.com".into();
    let result = proxy(&h, from_sub).await;
    assert!(matches!(result, Err(BrokerError::DomainNotAllowed { .. })));

    assert!(h.transport.seen().is_empty());
    assert!(h.broker.history().list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn locked_vault_is_checked_first() {
    let h = harness(MockTransport::default()).await;
    h.vault.lock().await;

    let mut from_other = intent("nonsense", "/x");
    from_other.caller_origin = "other.com".into();
    let result = proxy(&h, from_other).await;
    assert!(matches!(result, Err(BrokerError::Locked)));
}

#[tokio::test]
async fn provider_and_credential_checks() {
    let h = harness(MockTransport::default()).await;

    let mut missing = intent("openai", "/v1/models");
    missing.provider_id = None;
    assert!(matches!(
        proxy(&h, missing).await,
        Err(BrokerError::InvalidRequest { .. })
    ));

    assert!(matches!(
        proxy(&h, intent("skynet", "/v1")).await,
        Err(BrokerError::InvalidRequest { .. })
    ));

    assert!(matches!(
        proxy(&h, intent("anthropic", "/v1/messages")).await,
        Err(BrokerError::NoCredential { .. })
    ));

    assert!(matches!(
        proxy(&h, intent("openai", "https://evil.com/steal")).await,
        Err(BrokerError::InvalidRequest { .. })
    ));

    let mut bad_method = intent("openai", "/v1/models");
    bad_method.method = "TRACE".into();
    assert!(matches!(
        proxy(&h, bad_method).await,
        Err(BrokerError::InvalidRequest { .. })
    ));

    assert!(h.transport.seen().is_empty());
}

#[tokio::test]
async fn self_hosted_provider_needs_an_endpoint() {
    let h = harness(MockTransport::new([reply_json(200, json!({"ok": true}))])).await;
    h.vault
        .add_credential(&NewCredential::new("ollama", "local-token"))
        .await
        .unwrap();

    assert!(matches!(
        proxy(&h, intent("ollama", "/api/tags")).await,
        Err(BrokerError::InvalidRequest { .. })
    ));

    let mut with_url = intent("ollama", "/api/tags");
    with_url.caller_endpoint_url = Some("http://localhost:11434/".into());
    let result = proxy(&h, with_url).await.unwrap();
    assert_eq!(result.status, 200);
    assert_eq!(h.transport.seen()[0].url, "http://localhost:11434/api/tags");
}

#[tokio::test]
async fn fixed_provider_ignores_caller_url_but_honors_custom_endpoint() {
    let h = harness(MockTransport::new([
        reply_json(200, json!({})),
        reply_json(200, json!({})),
    ]))
    .await;

    let mut redirected = intent("openai", "/v1/models");
    redirected.caller_endpoint_url = Some("https://attacker.example".into());
    proxy(&h, redirected).await.unwrap();
    assert_eq!(h.transport.seen()[0].url, "https://api.openai.com/v1/models");

    let id = h.vault.find_by_provider("openai").unwrap().unwrap().id.clone();
    assert!(
        h.vault
            .set_custom_endpoint(&id, "https://gateway.internal/openai")
            .await
            .unwrap()
    );
    proxy(&h, intent("openai", "v1/models")).await.unwrap();
    assert_eq!(
        h.transport.seen()[1].url,
        "https://gateway.internal/openai/v1/models"
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Buffered calls
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn credential_is_injected_over_caller_headers() {
    let h = harness(MockTransport::new([reply_json(
        200,
        json!({"id": "chatcmpl-1"}),
    )]))
    .await;

    let mut call = intent("openai", "/v1/chat/completions");
    call.method = "post".into();
    call.headers
        .insert("authorization".into(), "Bearer stolen".into());
    call.headers.insert("X-Trace".into(), "abc".into());
    call.body = Some(json!({"model": "gpt-4o"}));

    let result = proxy(&h, call).await.unwrap();
    assert_eq!(result.status, 200);
    assert_eq!(result.body, json!({"id": "chatcmpl-1"}));

    let sent = &h.transport.seen()[0];
    assert_eq!(sent.method, "POST");
    assert_eq!(sent.url, "https://api.openai.com/v1/chat/completions");
    assert_eq!(sent.body.as_deref(), Some(r#"{"model":"gpt-4o"}"#));

    let auth: Vec<_> = sent
        .headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("authorization"))
        .collect();
    assert_eq!(auth.len(), 1);
    assert_eq!(auth[0].1, "Bearer sk-real");
    assert!(sent.headers.contains(&("X-Trace".to_owned(), "abc".to_owned())));
    assert!(
        sent.headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/json")
    );

    let history = h.broker.history().list(None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].provider_id, "openai");
    assert_eq!(history[0].endpoint_path, "/v1/chat/completions");
    assert_eq!(history[0].caller_domain, "example.com");
    assert_eq!(history[0].http_status, 200);
}

#[tokio::test]
async fn upstream_error_status_is_passed_through() {
    let h = harness(MockTransport::new([Scripted::Reply {
        status: 429,
        content_type: "text/plain",
        body: b"slow down".to_vec(),
    }]))
    .await;

    let result = proxy(&h, intent("openai", "/v1/models")).await.unwrap();
    assert_eq!(result.status, 429);
    assert_eq!(result.body, json!("slow down"));
    assert_eq!(last_status(&h).await, 429);
}

#[tokio::test]
async fn connect_failure_is_network_error_with_status_zero() {
    let h = harness(MockTransport::new([Scripted::Refuse])).await;
    let result = proxy(&h, intent("openai", "/v1/models")).await;
    assert!(matches!(result, Err(BrokerError::NetworkError { .. })));
    assert_eq!(last_status(&h).await, 0);
}

#[tokio::test]
async fn request_in_flight_completes_after_lock() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        MockTransport::new([reply_json(200, json!({"late": true}))]).held(Arc::clone(&gate)),
    )
    .await;

    let broker = Arc::clone(&h.broker);
    let task = tokio::spawn(async move {
        let (tx, _rx) = mpsc::channel(8);
        broker
            .authorize_and_proxy("inflight", intent("openai", "/v1/models"), &tx)
            .await
    });

    while h.transport.seen().is_empty() {
        tokio::task::yield_now().await;
    }
    h.vault.lock().await;
    gate.notify_one();

    let result = task.await.unwrap().unwrap();
    assert_eq!(result.body, json!({"late": true}));

    let after = proxy(&h, intent("openai", "/v1/models")).await;
    assert!(matches!(after, Err(BrokerError::Locked)));
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn streamed_response_through_handler() {
    let h = harness(MockTransport::new([stream(&[b"Hello", b"", b" world"])])).await;
    let handler = MessageHandler::new(Arc::clone(&h.broker), "test");

    let (tx, mut rx) = mpsc::channel(64);
    let line = json!({
        "type": "REQUEST",
        "requestId": "s1",
        "originDomain": "example.com",
        "payload": {
            "provider": "openai",
            "endpoint": "/v1/chat/completions",
            "method": "POST",
            "body": {"stream": true},
            "stream": true
        }
    })
    .to_string();
    handler.handle_line(&line, &tx).await;

    let messages = drain(&mut rx);
    let chunk = |text: &str, done: bool| {
        OutboundMessage::StreamChunk(StreamChunk {
            request_id: "s1".into(),
            chunk: text.into(),
            done,
        })
    };
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0], chunk("Hello", false));
    assert_eq!(messages[1], chunk(" world", false));
    assert_eq!(messages[2], chunk("", true));

    let OutboundMessage::Response(resp) = &messages[3] else {
        panic!("expected final RESPONSE");
    };
    assert!(resp.success);
    let data = resp.data.as_ref().unwrap();
    assert_eq!(data.status, 200);
    assert_eq!(data.body, json!("Hello world"));
    assert_eq!(last_status(&h).await, 200);
}

#[tokio::test]
async fn multibyte_characters_split_across_chunks() {
    let h = harness(MockTransport::new([stream(&[b"caf\xC3", b"\xA9!"])])).await;
    let mut call = intent("openai", "/v1/chat/completions");
    call.streaming = true;

    let (tx, mut rx) = mpsc::channel(64);
    let result = h.broker.authorize_and_proxy("u", call, &tx).await.unwrap();
    assert_eq!(result.body, json!("café!"));

    let texts: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|m| match m {
            OutboundMessage::StreamChunk(c) if !c.done => Some(c.chunk),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["caf".to_owned(), "é!".to_owned()]);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_done_marker() {
    let h = harness(MockTransport::new([Scripted::Stream {
        status: 200,
        chunks: vec![
            Ok(b"partial".to_vec()),
            Err(TransportError::Read {
                reason: "reset by peer".into(),
            }),
        ],
    }]))
    .await;
    let mut call = intent("openai", "/v1/chat/completions");
    call.streaming = true;

    let (tx, mut rx) = mpsc::channel(64);
    let result = h.broker.authorize_and_proxy("m", call, &tx).await;
    assert!(matches!(result, Err(BrokerError::NetworkError { .. })));

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 2);
    assert!(matches!(
        messages.last(),
        Some(OutboundMessage::StreamChunk(StreamChunk { done: true, .. }))
    ));
    assert_eq!(last_status(&h).await, 0);
}

#[tokio::test]
async fn streaming_connect_failure_still_sends_done() {
    let h = harness(MockTransport::new([Scripted::Refuse])).await;
    let mut call = intent("openai", "/v1/chat/completions");
    call.streaming = true;

    let (tx, mut rx) = mpsc::channel(64);
    let result = h.broker.authorize_and_proxy("c", call, &tx).await;
    assert!(matches!(result, Err(BrokerError::NetworkError { .. })));
    assert_eq!(
        drain(&mut rx),
        vec![OutboundMessage::StreamChunk(StreamChunk {
            request_id: "c".into(),
            chunk: String::new(),
            done: true,
        })]
    );
}

#[tokio::test]
async fn dropped_receiver_cancels_stream() {
    let h = harness(MockTransport::new([stream(&[b"one", b"two"])])).await;
    let mut call = intent("openai", "/v1/chat/completions");
    call.streaming = true;

    let (tx, rx) = mpsc::channel(64);
    drop(rx);
    let result = h.broker.authorize_and_proxy("x", call, &tx).await;
    assert!(matches!(result, Err(BrokerError::NetworkError { .. })));
    assert_eq!(last_status(&h).await, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Auto-lock
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn idle_vault_locks_after_five_minutes() {
    let h = harness(MockTransport::default()).await;
    h.session.set_auto_lock_minutes(5).await.unwrap();
    tokio::time::pause();

    h.session.record_activity().await.unwrap();
    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(h.vault.status(), VaultStatus::Unlocked);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.vault.status(), VaultStatus::Locked);

    let result = proxy(&h, intent("openai", "/v1/models")).await;
    assert!(matches!(result, Err(BrokerError::Locked)));
}

#[tokio::test]
async fn brokered_request_postpones_auto_lock() {
    let h = harness(MockTransport::new([reply_json(200, json!({}))])).await;
    h.session.set_auto_lock_minutes(5).await.unwrap();
    tokio::time::pause();

    h.session.record_activity().await.unwrap();
    tokio::time::sleep(Duration::from_secs(240)).await;
    proxy(&h, intent("openai", "/v1/models")).await.unwrap();

    // Original deadline passes without locking.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.vault.status(), VaultStatus::Unlocked);

    // Five minutes after the request.
    tokio::time::sleep(Duration::from_secs(181)).await;
    assert_eq!(h.vault.status(), VaultStatus::Locked);
}

#[tokio::test]
async fn listener_follows_lock_and_unlock() {
    let h = harness(MockTransport::default()).await;
    let listener = h.session.spawn_event_listener();

    h.session.record_activity().await.unwrap();
    assert!(h.session.is_armed());

    h.vault.lock().await;
    while h.session.is_armed() {
        tokio::task::yield_now().await;
    }

    assert!(h.vault.unlock("pw").await.unwrap());
    while !h.session.is_armed() {
        tokio::task::yield_now().await;
    }

    listener.abort();
}

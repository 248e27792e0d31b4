//! Message dispatch.
//!
//! [`MessageHandler`] turns one inbound message into the outbound messages
//! it produces.  Replies go to an `mpsc` channel so that streamed chunks and
//! the final `RESPONSE` share one ordered outlet.

use std::sync::Arc;

use keyhaven_vault::providers;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{ProxyIntent, RequestBroker};
use crate::error::BrokerError;
use crate::protocol::{
    InboundMessage, OutboundMessage, ProviderInfo, ResponseData, ResponseMessage,
};

/// Dispatches inbound messages to the broker.
#[derive(Clone)]
pub struct MessageHandler {
    broker: Arc<RequestBroker>,
    version: String,
}

impl MessageHandler {
    pub fn new(broker: Arc<RequestBroker>, version: impl Into<String>) -> Self {
        Self {
            broker,
            version: version.into(),
        }
    }

    pub fn broker(&self) -> &Arc<RequestBroker> {
        &self.broker
    }

    /// Handle one message.  Returns once every reply has been queued.
    pub async fn handle(&self, message: InboundMessage, out: &mpsc::Sender<OutboundMessage>) {
        let reply = match message {
            InboundMessage::Ping { request_id } => OutboundMessage::Pong { request_id },

            InboundMessage::GetStatus { request_id } => {
                let vault = self.broker.vault();
                OutboundMessage::Status {
                    request_id,
                    installed: vault.is_installed(),
                    unlocked: vault.is_unlocked(),
                    version: self.version.clone(),
                }
            }

            InboundMessage::GetProviders { request_id } => self.providers(request_id),

            InboundMessage::Request {
                request_id,
                payload,
                origin_domain,
            } => {
                let intent = ProxyIntent::from_payload(payload, origin_domain);
                let response = match self
                    .broker
                    .authorize_and_proxy(&request_id, intent, out)
                    .await
                {
                    Ok(result) => ResponseMessage::ok(
                        request_id,
                        ResponseData {
                            status: result.status,
                            headers: result.headers,
                            body: result.body,
                        },
                    ),
                    Err(e) => ResponseMessage::err(request_id, &e),
                };
                OutboundMessage::Response(response)
            }
        };

        if out.send(reply).await.is_err() {
            debug!("reply dropped: outbound channel closed");
        }
    }

    /// Parse and handle one raw JSON message.
    ///
    /// Unparseable input gets an `InvalidRequest` response carrying the
    /// `requestId` if one could be recovered.
    pub async fn handle_line(&self, line: &str, out: &mpsc::Sender<OutboundMessage>) {
        match serde_json::from_str::<InboundMessage>(line) {
            Ok(message) => self.handle(message, out).await,
            Err(e) => {
                warn!(error = %e, "malformed inbound message");
                let request_id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("requestId").and_then(Value::as_str).map(str::to_owned))
                    .unwrap_or_default();
                let error = BrokerError::InvalidRequest {
                    reason: format!("malformed message: {e}"),
                };
                let reply = OutboundMessage::Response(ResponseMessage::err(request_id, &error));
                if out.send(reply).await.is_err() {
                    debug!("reply dropped: outbound channel closed");
                }
            }
        }
    }

    fn providers(&self, request_id: Option<String>) -> OutboundMessage {
        let summaries = match self.broker.vault().list_summaries() {
            Ok(s) => s,
            Err(e) => {
                let error = BrokerError::from(e);
                return OutboundMessage::Response(ResponseMessage::err(
                    request_id.unwrap_or_default(),
                    &error,
                ));
            }
        };

        let providers = providers()
            .iter()
            .map(|p| ProviderInfo {
                id: p.id.to_owned(),
                name: p.display_name.to_owned(),
                has_credential: summaries.iter().any(|s| s.provider_id == p.id),
            })
            .collect();
        OutboundMessage::Providers {
            request_id,
            providers,
        }
    }
}

#[cfg(test)]
mod tests {
    use keyhaven_kernel::IpcBus;
    use keyhaven_vault::{CredentialStore, NewCredential, VaultManager};

    use super::*;
    use crate::session::SessionGuard;
    use crate::transport::ReqwestTransport;

    async fn handler() -> MessageHandler {
        let vault = Arc::new(
            VaultManager::load(CredentialStore::in_memory(), IpcBus::default())
                .await
                .unwrap(),
        );
        let session = SessionGuard::new(Arc::clone(&vault));
        let transport = ReqwestTransport::new("keyhaven-test", std::time::Duration::from_secs(1))
            .unwrap();
        let broker = RequestBroker::new(vault, session, Arc::new(transport));
        MessageHandler::new(Arc::new(broker), "0.1.0")
    }

    async fn roundtrip(handler: &MessageHandler, line: &str) -> OutboundMessage {
        let (tx, mut rx) = mpsc::channel(8);
        handler.handle_line(line, &tx).await;
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn ping_echoes_request_id() {
        let h = handler().await;
        let reply = roundtrip(&h, r#"{"type":"PING","requestId":"p1"}"#).await;
        assert_eq!(
            reply,
            OutboundMessage::Pong {
                request_id: Some("p1".into())
            }
        );
    }

    #[tokio::test]
    async fn status_reflects_vault_state() {
        let h = handler().await;
        let reply = roundtrip(&h, r#"{"type":"GET_STATUS"}"#).await;
        assert!(matches!(
            reply,
            OutboundMessage::Status {
                installed: false,
                unlocked: false,
                ..
            }
        ));

        h.broker().vault().create("pw").await.unwrap();
        let reply = roundtrip(&h, r#"{"type":"GET_STATUS"}"#).await;
        assert!(matches!(
            reply,
            OutboundMessage::Status {
                installed: true,
                unlocked: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn providers_flag_stored_credentials() {
        let h = handler().await;
        let vault = h.broker().vault();
        vault.create("pw").await.unwrap();
        vault
            .add_credential(&NewCredential::new("groq", "gsk-1"))
            .await
            .unwrap();

        let OutboundMessage::Providers { providers, .. } =
            roundtrip(&h, r#"{"type":"GET_PROVIDERS","requestId":"g"}"#).await
        else {
            panic!("expected PROVIDERS");
        };
        assert_eq!(providers.len(), keyhaven_vault::providers().len());
        let flagged: Vec<_> = providers
            .iter()
            .filter(|p| p.has_credential)
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(flagged, vec!["groq"]);
    }

    #[tokio::test]
    async fn providers_while_locked_is_locked_error() {
        let h = handler().await;
        let reply = roundtrip(&h, r#"{"type":"GET_PROVIDERS","requestId":"g"}"#).await;
        let OutboundMessage::Response(resp) = reply else {
            panic!("expected RESPONSE");
        };
        assert!(!resp.success);
        assert_eq!(resp.request_id, "g");
        assert_eq!(resp.error.unwrap().code, "Locked");
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_request() {
        let h = handler().await;

        let OutboundMessage::Response(resp) = roundtrip(&h, "{not json").await else {
            panic!("expected RESPONSE");
        };
        assert_eq!(resp.error.unwrap().code, "InvalidRequest");

        let OutboundMessage::Response(resp) =
            roundtrip(&h, r#"{"type":"TELEPORT","requestId":"x9"}"#).await
        else {
            panic!("expected RESPONSE");
        };
        assert_eq!(resp.request_id, "x9");
        assert_eq!(resp.error.unwrap().code, "InvalidRequest");
    }

    #[tokio::test]
    async fn request_while_locked_is_rejected_before_network() {
        let h = handler().await;
        let line = r#"{"type":"REQUEST","requestId":"r1","originDomain":"example.com",
            "payload":{"provider":"openai","endpoint":"/v1/models"}}"#;
        let OutboundMessage::Response(resp) = roundtrip(&h, line).await else {
            panic!("expected RESPONSE");
        };
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.error.unwrap().code, "Locked");
    }
}

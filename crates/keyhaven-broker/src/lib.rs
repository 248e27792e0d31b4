//! Keyhaven request broker.
//!
//! Sits between untrusted callers and upstream provider APIs.  A caller
//! never sees a secret: it names a provider and an endpoint path, and the
//! broker checks the vault state and the caller's origin, injects the
//! stored credential, performs the call, and records what happened.
//!
//! # Architecture
//!
//! ```text
//!  JSON line ──► MessageHandler ──► RequestBroker ──► Transport ──► upstream
//!                     │                 │  │  │
//!                     │                 │  │  └── HistoryLog
//!                     │                 │  └───── DomainAllowList
//!                     │                 └──────── SessionGuard (auto-lock)
//!                     └── OutboundMessage (RESPONSE / STREAM_CHUNK / ...)
//! ```

pub mod allowlist;
pub mod broker;
pub mod error;
pub mod handler;
pub mod history;
pub mod protocol;
pub mod session;
pub mod transport;

pub use allowlist::{DomainAllowList, normalize_origin};
pub use broker::{ProxyIntent, ProxyResult, RequestBroker};
pub use error::{BrokerError, Result};
pub use handler::MessageHandler;
pub use history::HistoryLog;
pub use protocol::{
    ErrorBody, InboundMessage, OutboundMessage, ProviderInfo, RequestPayload, ResponseData,
    ResponseMessage, StreamChunk,
};
pub use session::SessionGuard;
pub use transport::{
    ReqwestTransport, StreamingResponse, Transport, TransportError, TransportRequest,
    TransportResponse,
};

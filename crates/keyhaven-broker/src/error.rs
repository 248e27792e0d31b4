//! Broker error types.
//!
//! [`BrokerError`] is the taxonomy a caller of the broker sees.  Every
//! variant maps to one wire code via [`BrokerError::code`].  These are
//! expected outcomes of untrusted input, returned as structured errors and
//! never treated as fatal.

use keyhaven_kernel::KernelError;
use keyhaven_vault::VaultError;

use crate::transport::TransportError;

/// Unified error type for the request broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The vault is not unlocked.
    #[error("vault is locked")]
    Locked,

    /// The calling origin is not on the allow-list.
    #[error("domain not allowed: {domain}")]
    DomainNotAllowed { domain: String },

    /// No credential is stored for the provider.
    #[error("no credential stored for provider {provider}")]
    NoCredential { provider: String },

    /// Missing or unknown provider, missing endpoint, malformed request.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Transport failure, including mid-stream failure and cancellation.
    #[error("network error: {reason}")]
    NetworkError { reason: String },

    /// Storage or runtime fault unrelated to the request itself.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl BrokerError {
    /// Wire code used in `RESPONSE.error.code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Locked => "Locked",
            Self::DomainNotAllowed { .. } => "DomainNotAllowed",
            Self::NoCredential { .. } => "NoCredential",
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::NetworkError { .. } => "NetworkError",
            Self::Internal { .. } => "Internal",
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<VaultError> for BrokerError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Locked | VaultError::NotInitialized => Self::Locked,
            VaultError::UnknownProvider { provider } => Self::InvalidRequest {
                reason: format!("unknown provider: {provider}"),
            },
            VaultError::InvalidInput { reason } => Self::InvalidRequest { reason },
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

impl From<KernelError> for BrokerError {
    fn from(err: KernelError) -> Self {
        Self::Internal {
            reason: err.to_string(),
        }
    }
}

impl From<TransportError> for BrokerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidRequest { reason } => Self::InvalidRequest { reason },
            other => Self::NetworkError {
                reason: other.to_string(),
            },
        }
    }
}

/// Convenience alias used throughout the broker crate.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(BrokerError::Locked.code(), "Locked");
        assert_eq!(
            BrokerError::DomainNotAllowed {
                domain: "other.com".into()
            }
            .code(),
            "DomainNotAllowed"
        );
        assert_eq!(
            BrokerError::NoCredential {
                provider: "openai".into()
            }
            .code(),
            "NoCredential"
        );
        assert_eq!(BrokerError::invalid("x").code(), "InvalidRequest");
    }

    #[test]
    fn vault_errors_map_to_wire_taxonomy() {
        assert!(matches!(
            BrokerError::from(VaultError::Locked),
            BrokerError::Locked
        ));
        assert!(matches!(
            BrokerError::from(VaultError::Internal("x".into())),
            BrokerError::Internal { .. }
        ));
    }

    #[test]
    fn transport_errors_map_to_network_error() {
        let err = BrokerError::from(TransportError::Connect {
            reason: "refused".into(),
        });
        assert_eq!(err.code(), "NetworkError");
        let err = BrokerError::from(TransportError::InvalidRequest {
            reason: "bad header".into(),
        });
        assert_eq!(err.code(), "InvalidRequest");
    }
}

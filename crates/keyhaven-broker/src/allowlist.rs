//! Origin allow-list.
//!
//! Only callers whose origin hostname is listed here may use the broker.
//! Matching is exact on the lowercased hostname; `app.example.com` does not
//! match an entry for `example.com`.

use chrono::Utc;
use keyhaven_vault::{CredentialStore, DomainAllowEntry};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{BrokerError, Result};

/// Reduce an origin (`https://App.Example.com:8443/path` or a bare host) to
/// its lowercase hostname.
pub fn normalize_origin(origin: &str) -> Option<String> {
    let trimmed = origin.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }

    let parsed = if trimmed.contains("://") {
        url::Url::parse(trimmed).ok()?
    } else {
        url::Url::parse(&format!("https://{trimmed}")).ok()?
    };

    let host = parsed.host_str()?.trim_end_matches('.').to_lowercase();
    if host.is_empty() { None } else { Some(host) }
}

/// Persisted set of permitted caller hostnames.
pub struct DomainAllowList {
    store: CredentialStore,
    gate: Mutex<()>,
}

impl DomainAllowList {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            gate: Mutex::new(()),
        }
    }

    /// Permit `origin`.  Returns `false` if it was already listed.
    pub async fn add(&self, origin: &str) -> Result<bool> {
        let domain = normalize_origin(origin)
            .ok_or_else(|| BrokerError::invalid(format!("not a valid origin: {origin:?}")))?;

        let _gate = self.gate.lock().await;
        let mut entries = self.store.allowed_domains().await?;
        if entries.iter().any(|e| e.domain == domain) {
            return Ok(false);
        }
        entries.push(DomainAllowEntry {
            domain: domain.clone(),
            added_at: Utc::now(),
        });
        self.store.save_allowed_domains(&entries).await?;

        info!(domain = %domain, "domain allowed");
        Ok(true)
    }

    /// Revoke `origin`.  Returns `false` if it was not listed.
    pub async fn remove(&self, origin: &str) -> Result<bool> {
        let Some(domain) = normalize_origin(origin) else {
            return Ok(false);
        };

        let _gate = self.gate.lock().await;
        let mut entries = self.store.allowed_domains().await?;
        let before = entries.len();
        entries.retain(|e| e.domain != domain);
        if entries.len() == before {
            return Ok(false);
        }
        self.store.save_allowed_domains(&entries).await?;

        info!(domain = %domain, "domain removed from allow-list");
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<DomainAllowEntry>> {
        Ok(self.store.allowed_domains().await?)
    }

    /// Whether `origin` normalizes to a listed hostname.
    pub async fn contains(&self, origin: &str) -> Result<bool> {
        let Some(domain) = normalize_origin(origin) else {
            return Ok(false);
        };
        Ok(self
            .store
            .allowed_domains()
            .await?
            .iter()
            .any(|e| e.domain == domain))
    }
}

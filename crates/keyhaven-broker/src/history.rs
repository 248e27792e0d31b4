//! Request history log.
//!
//! Entries are stored oldest first and trimmed from the front whenever the
//! log grows past `Settings::max_history_entries`.  Only metadata is kept.

use keyhaven_vault::{CredentialStore, HistoryEntry};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Bounded, persisted log of brokered calls.
pub struct HistoryLog {
    store: CredentialStore,
    gate: Mutex<()>,
}

impl HistoryLog {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            gate: Mutex::new(()),
        }
    }

    /// Append `entry` if history is enabled.  Returns whether it was kept.
    pub async fn record(&self, entry: HistoryEntry) -> Result<bool> {
        let settings = self.store.settings().await?;
        if !settings.history_enabled {
            return Ok(false);
        }

        let _gate = self.gate.lock().await;
        let mut entries = self.store.history().await?;
        entries.push(entry);
        let overflow = entries.len().saturating_sub(settings.max_history_entries);
        if overflow > 0 {
            entries.drain(..overflow);
            debug!(dropped = overflow, "history trimmed");
        }
        self.store.save_history(&entries).await?;
        Ok(settings.max_history_entries > 0)
    }

    /// Most recent entries first, at most `limit` of them.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let entries = self.store.history().await?;
        let limit = limit.unwrap_or(entries.len());
        Ok(entries.into_iter().rev().take(limit).collect())
    }

    pub async fn clear(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.store.save_history(&[]).await?;
        debug!("history cleared");
        Ok(())
    }
}

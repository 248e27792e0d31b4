//! Vault event bus.
//!
//! A publish/subscribe channel built on [`tokio::sync::broadcast`].  The
//! vault manager and session guard publish lifecycle [`Event`]s here so that
//! any attached front end (CLI status line, the `serve` loop) can reflect
//! lock-state changes without polling.
//!
//! Events never carry secret material: no passwords, keys, or credential
//! values, only identifiers and counts.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use keyhaven_kernel::ipc::{Event, IpcBus, LockReason};
//! # async fn example() {
//! let bus = IpcBus::new(64);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(Event::VaultLocked {
//!     reason: LockReason::Manual,
//!     timestamp: chrono::Utc::now(),
//! }).unwrap();
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Why the vault transitioned into the locked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockReason {
    /// An explicit `lock()` call.
    Manual,
    /// The inactivity timer expired.
    AutoLock,
    /// The vault was reset and its record removed.
    Reset,
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::AutoLock => "auto-lock",
            Self::Reset => "reset",
        };
        f.write_str(s)
    }
}

/// An event that flows through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A new vault record was created and the vault is unlocked.
    VaultCreated { timestamp: DateTime<Utc> },

    /// The vault was unlocked with the master password.
    VaultUnlocked { timestamp: DateTime<Utc> },

    /// The vault was locked and its key material discarded.
    VaultLocked {
        reason: LockReason,
        timestamp: DateTime<Utc>,
    },

    /// The credential list was re-encrypted and persisted.
    CredentialsChanged {
        /// Number of credentials after the change.
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// The master password was rotated.
    PasswordChanged { timestamp: DateTime<Utc> },

    /// The vault record was deleted.
    VaultReset { timestamp: DateTime<Utc> },

    /// Runtime settings (auto-lock, history) changed.
    SettingsChanged { timestamp: DateTime<Utc> },
}

impl Event {
    /// Short machine-readable kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VaultCreated { .. } => "vault_created",
            Self::VaultUnlocked { .. } => "vault_unlocked",
            Self::VaultLocked { .. } => "vault_locked",
            Self::CredentialsChanged { .. } => "credentials_changed",
            Self::PasswordChanged { .. } => "password_changed",
            Self::VaultReset { .. } => "vault_reset",
            Self::SettingsChanged { .. } => "settings_changed",
        }
    }
}

// ---------------------------------------------------------------------------
// IPC Bus
// ---------------------------------------------------------------------------

/// Publish/subscribe event bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
/// Subscribers receive [`Arc<Event>`] references.
#[derive(Clone)]
pub struct IpcBus {
    inner: Arc<IpcBusInner>,
}

struct IpcBusInner {
    sender: broadcast::Sender<Arc<Event>>,
}

impl IpcBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// A subscriber that falls behind by more than `capacity` events receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(IpcBusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe the event.  With no
    /// subscribers the event is dropped and `Ok(0)` is returned.
    pub fn publish(&self, event: Event) -> Result<usize> {
        let kind = event.kind();
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(kind, receivers = n, "event published");
                Ok(n)
            }
            Err(_) => {
                tracing::trace!(kind, "event published but no active receivers");
                Ok(0)
            }
        }
    }

    /// Create a new subscriber that receives all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.sender.subscribe()
    }

    /// Return the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for IpcBus {
    fn default() -> Self {
        Self::new(64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = IpcBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus
            .publish(Event::VaultLocked {
                reason: LockReason::AutoLock,
                timestamp: Utc::now(),
            })
            .expect("publish should succeed");
        assert_eq!(receivers, 1);

        let received = rx.recv().await.expect("should receive event");
        match received.as_ref() {
            Event::VaultLocked { reason, .. } => assert_eq!(*reason, LockReason::AutoLock),
            other => panic!("unexpected event variant: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = IpcBus::new(4);
        let n = bus
            .publish(Event::VaultReset {
                timestamp: Utc::now(),
            })
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_kind_names() {
        let now = Utc::now();
        assert_eq!(Event::VaultCreated { timestamp: now }.kind(), "vault_created");
        assert_eq!(
            Event::CredentialsChanged {
                count: 2,
                timestamp: now
            }
            .kind(),
            "credentials_changed"
        );
        assert_eq!(LockReason::AutoLock.to_string(), "auto-lock");
    }
}

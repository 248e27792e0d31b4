//! Inactivity auto-lock.
//!
//! [`SessionGuard`] tracks the time of the last brokered activity and keeps
//! a single pending timer in a [`TimerSlot`].  When the timer fires it
//! re-checks elapsed time: if the threshold has passed the vault is locked,
//! otherwise the timer is re-armed for the remaining time.  A threshold of
//! zero minutes means auto-lock is disabled and the slot stays empty.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use keyhaven_kernel::{Event, Generation, LockReason, TimerSlot};
use keyhaven_vault::{CredentialStore, VaultManager};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Cloneable handle to the auto-lock guard.
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    vault: Arc<VaultManager>,
    store: CredentialStore,
    timer: TimerSlot,
    last_activity: Mutex<Instant>,
}

impl SessionGuard {
    pub fn new(vault: Arc<VaultManager>) -> Self {
        let store = vault.store().clone();
        Self {
            inner: Arc::new(SessionInner {
                vault,
                store,
                timer: TimerSlot::new(),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Note activity now and, if the vault is unlocked, re-arm the timer.
    pub async fn record_activity(&self) -> Result<()> {
        self.inner.touch();
        if self.inner.vault.is_unlocked() {
            SessionInner::schedule(&self.inner).await?;
        }
        Ok(())
    }

    /// Cancel any pending timer and arm a new one per the stored
    /// `autoLockMinutes`.  Does nothing further when auto-lock is disabled.
    pub async fn schedule_timer(&self) -> Result<()> {
        SessionInner::schedule(&self.inner).await
    }

    /// Persist a new auto-lock threshold and reschedule.
    pub async fn set_auto_lock_minutes(&self, minutes: u32) -> Result<()> {
        let mut settings = self.inner.store.settings().await?;
        settings.auto_lock_minutes = minutes;
        self.inner.store.save_settings(&settings).await?;
        info!(minutes, "auto-lock threshold updated");

        if let Err(e) = self.inner.vault.bus().publish(Event::SettingsChanged {
            timestamp: Utc::now(),
        }) {
            warn!(error = %e, "failed to publish settings change");
        }

        if minutes == 0 {
            self.inner.timer.cancel();
            Ok(())
        } else if self.inner.vault.is_unlocked() {
            SessionInner::schedule(&self.inner).await
        } else {
            Ok(())
        }
    }

    /// Drop the pending timer, if any.
    pub fn cancel(&self) -> bool {
        self.inner.timer.cancel()
    }

    /// Whether an auto-lock timer is pending.
    pub fn is_armed(&self) -> bool {
        self.inner.timer.is_armed()
    }

    /// When the pending timer will fire.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.timer.deadline()
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .inner
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Follow vault events: arm on unlock, disarm on lock.
    ///
    /// The returned task runs until the bus closes.
    pub fn spawn_event_listener(&self) -> JoinHandle<()> {
        let guard = self.clone();
        let mut rx = self.inner.vault.bus().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match event.as_ref() {
                        Event::VaultCreated { .. } | Event::VaultUnlocked { .. } => {
                            if let Err(e) = guard.record_activity().await {
                                warn!(error = %e, "failed to arm auto-lock timer");
                            }
                        }
                        Event::VaultLocked { .. } | Event::VaultReset { .. } => {
                            guard.cancel();
                        }
                        _ => {}
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "session listener lagged behind vault events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("session listener stopped");
        })
    }
}

impl SessionInner {
    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn since_activity(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    async fn schedule(this: &Arc<Self>) -> Result<()> {
        let minutes = this.store.settings().await?.auto_lock_minutes;
        this.timer.cancel();
        if minutes == 0 {
            return Ok(());
        }
        Self::arm(this, minutes_to_duration(minutes))
    }

    fn arm(this: &Arc<Self>, delay: Duration) -> Result<()> {
        let inner = Arc::clone(this);
        this.timer
            .arm(delay, move |generation| async move { inner.on_fire(generation).await })?;
        debug!(delay_secs = delay.as_secs(), "auto-lock timer armed");
        Ok(())
    }

    async fn on_fire(self: Arc<Self>, generation: Generation) {
        if !self.vault.is_unlocked() {
            return;
        }

        let threshold = match self.store.settings().await {
            Ok(s) if s.auto_lock_minutes == 0 => return,
            Ok(s) => minutes_to_duration(s.auto_lock_minutes),
            Err(e) => {
                // Unreadable settings: fail closed.
                warn!(error = %e, "could not read settings at auto-lock; locking");
                Duration::ZERO
            }
        };

        let elapsed = self.since_activity();
        if elapsed >= threshold {
            // Locking waits for in-flight mutations; activity may arrive
            // meanwhile and arm a newer timer.
            let still_due = || {
                let superseded = self.timer.current_generation().is_some_and(|g| g > generation);
                !superseded && self.since_activity() >= threshold
            };
            if self.vault.lock_if(LockReason::AutoLock, still_due).await {
                info!(idle_secs = elapsed.as_secs(), "vault auto-locked after inactivity");
            } else {
                debug!(generation, "auto-lock skipped after newer activity");
            }
        } else if let Err(e) = Self::arm(&self, threshold - elapsed) {
            warn!(error = %e, "failed to re-arm auto-lock timer");
        }
    }
}

fn minutes_to_duration(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes) * 60)
}

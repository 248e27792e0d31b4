//! Single-slot one-shot timer.
//!
//! [`TimerSlot`] holds at most one pending wake-up.  Arming the slot always
//! aborts whatever was pending before, and every armed timer carries a
//! generation number so a task that already woke up (and was racing the
//! abort) can tell it has been superseded and bow out.  "No timer" is simply
//! an empty slot.
//!
//! Time is measured with [`tokio::time::Instant`], so tests drive the slot
//! deterministically with a paused clock.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{KernelError, Result};

/// Monotonic identifier of an armed timer.
pub type Generation = u64;

// ---------------------------------------------------------------------------
// TimerSlot
// ---------------------------------------------------------------------------

/// A cloneable handle to a single pending timer.
#[derive(Clone, Default)]
pub struct TimerSlot {
    inner: Arc<Mutex<SlotState>>,
}

#[derive(Default)]
struct SlotState {
    next_generation: Generation,
    pending: Option<Pending>,
}

struct Pending {
    generation: Generation,
    deadline: Instant,
    task: JoinHandle<()>,
}

impl TimerSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot to run `on_fire` once after `delay`.
    ///
    /// Any previously armed timer is aborted first.  `on_fire` receives the
    /// generation it was armed with and runs after the slot has been cleared,
    /// so it may re-arm the slot itself.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TimerUnavailable`] when called outside a tokio
    /// runtime.
    pub fn arm<F, Fut>(&self, delay: Duration, on_fire: F) -> Result<Generation>
    where
        F: FnOnce(Generation) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|e| KernelError::TimerUnavailable {
            reason: e.to_string(),
        })?;

        let mut state = self.lock();
        if let Some(previous) = state.pending.take() {
            previous.task.abort();
            tracing::trace!(generation = previous.generation, "timer superseded");
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let deadline = Instant::now() + delay;

        let slot = Arc::clone(&self.inner);
        let task = handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;

            {
                let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
                match &state.pending {
                    Some(p) if p.generation == generation => {
                        state.pending = None;
                    }
                    _ => {
                        tracing::trace!(generation, "stale timer woke up, ignoring");
                        return;
                    }
                }
            }

            on_fire(generation).await;
        });

        state.pending = Some(Pending {
            generation,
            deadline,
            task,
        });

        tracing::trace!(generation, delay_ms = delay.as_millis() as u64, "timer armed");
        Ok(generation)
    }

    /// Abort the pending timer, if any.  Returns `true` if one was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        match state.pending.take() {
            Some(p) => {
                p.task.abort();
                tracing::trace!(generation = p.generation, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a timer is currently pending.
    pub fn is_armed(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Deadline of the pending timer.
    pub fn deadline(&self) -> Option<Instant> {
        self.lock().pending.as_ref().map(|p| p.deadline)
    }

    /// Generation of the pending timer.
    pub fn current_generation(&self) -> Option<Generation> {
        self.lock().pending.as_ref().map(|p| p.generation)
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter_fire(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce(Generation) -> std::future::Ready<()> + Send + 'static {
        let c = Arc::clone(counter);
        move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let slot = TimerSlot::new();
        let fired = Arc::new(AtomicUsize::new(0));

        slot.arm(Duration::from_secs(60), counter_fire(&fired)).unwrap();
        assert!(slot.is_armed());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!slot.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_pending_timer() {
        let slot = TimerSlot::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let first = slot.arm(Duration::from_secs(10), counter_fire(&fired)).unwrap();
        let second = slot.arm(Duration::from_secs(30), counter_fire(&fired)).unwrap();
        assert!(second > first);
        assert_eq!(slot.current_generation(), Some(second));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let slot = TimerSlot::new();
        let fired = Arc::new(AtomicUsize::new(0));

        slot.arm(Duration::from_secs(5), counter_fire(&fired)).unwrap();
        assert!(slot.cancel());
        assert!(!slot.cancel());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(slot.deadline().is_none());
    }

    #[test]
    fn arm_outside_runtime_fails() {
        let slot = TimerSlot::new();
        let result = slot.arm(Duration::from_secs(1), |_| async {});
        assert!(matches!(result, Err(KernelError::TimerUnavailable { .. })));
    }
}

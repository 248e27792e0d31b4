//! Keyhaven kernel services.
//!
//! Small, dependency-light building blocks shared by the vault and the
//! broker:
//!
//! - **[`ipc`]** -- lifecycle event bus backed by [`tokio::sync::broadcast`].
//! - **[`timer`]** -- single-slot, generation-tagged one-shot timer used by
//!   the auto-lock session guard.
//! - **[`error`]** -- kernel error types via [`thiserror`].

pub mod error;
pub mod ipc;
pub mod timer;

pub use error::{KernelError, Result};
pub use ipc::{Event, IpcBus, LockReason};
pub use timer::{Generation, TimerSlot};

//! Kernel error types.
//!
//! Kernel services surface errors through [`KernelError`].  Publishing never
//! fails (an event with no listeners is simply dropped), so the only error
//! is a timer armed outside a runtime.

/// Unified error type for the Keyhaven kernel services.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// A timer was armed outside of a tokio runtime.
    #[error("timer unavailable: {reason}")]
    TimerUnavailable { reason: String },
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

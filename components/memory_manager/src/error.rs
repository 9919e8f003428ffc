//! Error types for the collector.
//!
//! Recoverable failures are reported as [`GcError`]. Broken internal
//! invariants are not errors: [`gc_assert!`](crate::gc_assert) logs them and
//! panics, and a panic on the collector thread comes back to the mutator as
//! [`GcError::CollectorFailed`].

use std::fmt;
use thiserror::Error;

/// Errors surfaced by the allocation and collection API.
#[derive(Debug, Error)]
pub enum GcError {
    /// The arenas are exhausted and no more memory could be obtained.
    #[error("out of memory: could not allocate {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request, header included.
        requested: usize,
    },

    /// The allocation request itself is malformed.
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The request needs a feature this collector does not provide.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// A collection cycle failed on the collector thread.
    #[error("collector thread failed: {0}")]
    CollectorFailed(String),

    /// The collector thread is gone.
    #[error("collector thread is not running")]
    CollectorStopped,

    /// The collector thread could not be started.
    #[error("failed to spawn collector thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result type for collector operations.
pub type GcResult<T> = Result<T, GcError>;

/// Reports a broken collector invariant and aborts the current operation.
#[cold]
#[inline(never)]
pub fn invariant_violated(args: fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "memory_manager::gc", "invariant violated: {}", args);
    panic!("GC invariant violated: {}", args)
}

/// Checks a collector invariant in every build profile.
#[macro_export]
macro_rules! gc_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::invariant_violated(format_args!($($arg)+))
        }
    };
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

//! Typed error taxonomy for engine boundaries.
//!
//! Detectors and ingestion steps never propagate a panic or an unexpected
//! error out of the orchestrator: they return structured results with
//! counts and failure flags, using these kinds only to classify *why* a
//! given sub-step degraded. Call sites elsewhere in the engine keep using
//! `anyhow::Result`, matching the teacher's preference for `anyhow` at
//! call sites and explicit enums at typed boundaries.

use thiserror::Error;

/// One of the seven error kinds named in the engine's error-handling design.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network/5xx from an upstream provider, exchange, or webhook target.
    /// Retried within the operation; surfaces as degraded-mode for the cycle.
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    /// 4xx from an upstream. Logged; cycle continues; no retry.
    #[error("upstream permanent error: {0}")]
    UpstreamPermanent(String),

    /// Malformed payload fragment. The fragment is skipped, not the batch.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unique-constraint violation on an idempotent append. Silent skip,
    /// but counted by the caller.
    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Unexpected data shape (e.g. dispersion over a zero-length sample).
    /// The computed value degrades to `None`; this never crashes a cycle.
    #[error("integrity invariant violated: {0}")]
    IntegrityInvariant(String),

    /// Startup-only: refuse to start when secrets/config are left at
    /// insecure defaults in a production environment.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Uncaught failure. Caught at the orchestrator boundary (cycle marked
    /// degraded, breaker counter incremented) or logged for fire-and-forget
    /// dispatch.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this kind should mark the current cycle as degraded rather
    /// than abort it outright.
    pub fn is_degraded_mode(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamTransient(_) | EngineError::Internal(_)
        )
    }
}

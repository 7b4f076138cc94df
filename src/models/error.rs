//! Error types for batchflow.
//!
//! Three propagation classes:
//! - Fatal: raised at `build()` or when a run directory cannot be opened
//! - Counted: recorded against the affected records, never rethrown
//! - Propagated: bubble to the embedder; the final status snapshot is
//!   still attempted before the run terminates

use thiserror::Error;

/// Boxed error type returned by user step functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for batchflow.
#[derive(Debug, Error)]
pub enum EngineError {
    // ═══════════════════════════════════════════════════════════════════
    // Fatal — raised at build time or context open
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid run directory {0}: expected status/, records/ and steps/ namespaces")]
    InvalidRunDir(String),

    // ═══════════════════════════════════════════════════════════════════
    // Counted — recorded per record, the run continues
    // ═══════════════════════════════════════════════════════════════════

    #[error("Bad input at step {step}: {reason}")]
    BadInput { step: usize, reason: String },

    #[error("Step '{step}' failed: {message}")]
    UserStep { step: String, message: String },

    #[error("Persistence error: {context}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Propagated — serialization bugs and broken invariants
    // ═══════════════════════════════════════════════════════════════════

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a persistence error with context.
    pub fn persistence(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Persistence {
            context: context.into(),
            source,
        }
    }

    /// Whether this error is counted against records rather than aborting the run.
    pub fn is_counted(&self) -> bool {
        matches!(
            self,
            Self::BadInput { .. } | Self::UserStep { .. } | Self::Persistence { .. }
        )
    }
}

/// Result type alias for batchflow.
pub type Result<T> = std::result::Result<T, EngineError>;

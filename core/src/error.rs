//! Error types for the effect engine
//!
//! Bookkeeping conditions that are expected in a timer-driven system (unknown
//! record keys, stale scheduler callbacks) are not errors and never show up
//! here. What does show up: unknown or malformed definitions, hook failures,
//! and persistence failures that survived a re-read.

use std::path::PathBuf;

use thiserror::Error;

/// Error raised by an effect hook. Hooks own their failure modes, so any
/// error type is accepted.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of fallible hooks
pub type HookResult = Result<(), HookError>;

#[derive(Debug, Error)]
pub enum EffectError {
    /// `apply` was given a definition key the registry doesn't know
    #[error("unknown effect definition '{0}'")]
    UnknownDefinition(String),

    /// A spec failed validation at registration time
    #[error("invalid effect definition '{key}': {reason}")]
    InvalidDefinition { key: String, reason: String },

    /// A hook returned an error; the handler does not swallow these
    #[error("{hook} hook failed for effect '{record}'")]
    Hook {
        record: String,
        hook: &'static str,
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from an attribute store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed effect data for '{owner}': {source}")]
    Json {
        owner: String,
        #[source]
        source: serde_json::Error,
    },
}

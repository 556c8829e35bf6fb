//! Error types for the streaming engine

use thiserror::Error;

/// Main error type for the streaming engine
#[derive(Debug, Error)]
pub enum Error {
    /// Too many simultaneously tracked objects. Recoverable by releasing
    /// codes for untracked or evicted objects first.
    #[error("color pool exhausted ({live} codes live)")]
    ColorPoolExhausted { live: usize },

    /// The environment cannot read pixels back from the offscreen target.
    /// The visibility tester degrades to assume-all-visible.
    #[error("pixel readback unsupported: {0}")]
    ReadbackUnsupported(String),

    /// Network or backend failure while fetching a tile. The affected
    /// record reverts to `Unloaded` and is eligible for retry.
    #[error("tile fetch failed for {name}: {reason}")]
    TileFetch { name: String, reason: String },

    /// The fetched payload could not be decoded into a fragment.
    #[error("tile decode failed for {name}: {reason}")]
    TileDecode { name: String, reason: String },

    /// A load settled after the global cancel flag was raised. Expected
    /// discard path, not a failure.
    #[error("load cancelled for {0}")]
    Cancelled(String),

    /// A model id that was never registered (or already unregistered).
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error leaves the geometry eligible for a retry on a
    /// later visibility cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TileFetch { .. } | Error::TileDecode { .. } | Error::Cancelled(_)
        )
    }
}

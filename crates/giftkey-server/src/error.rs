use thiserror::Error;

/// Failures surfaced by the key lifecycle manager and the gift relay.
///
/// Per-key results such as "wrong identity" or "expired" are reported through
/// the operation's outcome type instead; this enum covers conditions that are
/// not part of a normal outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("expired")]
    Expired,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage or timeout failure. Retrying may succeed; never a definitive
    /// "not found".
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// The store could not be opened. Nothing can be served.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn storage(e: anyhow::Error) -> Self {
        Self::Transient(format!("{e:#}"))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Engine error types.

use thiserror::Error;

/// Errors raised by the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    /// The configured byte budget would be exceeded by this commit.
    #[error("store full: {used} of {budget} bytes used")]
    MapFull { used: u64, budget: u64 },
    /// On-disk or in-memory state is inconsistent.
    #[error("store corrupt: {0}")]
    Corrupt(String),
    /// A second write transaction was requested while one is open.
    #[error("write transaction already open")]
    WriteBusy,
}

impl StoreError {
    /// Whether a commit failing with this error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// Why a client submission was not accepted, in the classes observable
/// at the protocol boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Reject {
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("rate-limited: {0}")]
    RateLimited(String),
    #[error("error: {0}")]
    Error(String),
}

impl Reject {
    /// Shorthand for the most common class.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Reject::Invalid(msg.into())
    }

    /// Whether the event was nevertheless acknowledged as accepted.
    ///
    /// Duplicates report `OK ... true` so idempotent republishing stays
    /// cheap for clients.
    pub fn acknowledged(&self) -> bool {
        matches!(self, Reject::Duplicate(_))
    }
}

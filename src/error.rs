//! Error types for the assignment engine and its store adapters.

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the engine to its callers.
///
/// Algorithmic failures (`OutOfRange`, `AlreadyOccupied`,
/// `CompetitorAlreadyPlaced`, `UnknownCompetitor`) never mutate state.
/// `RemoteUnavailable` leaves the local replica exactly as it was after the
/// optimistic update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("position {position} outside 1..={slots}")]
    OutOfRange { position: usize, slots: usize },

    #[error("position {position} is already occupied by #{occupant}")]
    AlreadyOccupied { position: usize, occupant: u32 },

    #[error("competitor #{number} already holds position {position}")]
    CompetitorAlreadyPlaced { number: u32, position: usize },

    /// Confirm with nobody offered, or a row naming a competitor the
    /// registry does not know.
    #[error("no known competitor to act on")]
    UnknownCompetitor,

    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("a live subscription for {0} already exists")]
    DuplicateSubscription(String),

    #[error("invalid {table} row: {detail}")]
    InvalidRow { table: &'static str, detail: String },
}

impl SyncError {
    /// Recoverable failures the presentation layer should offer to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable(_))
    }

    pub(crate) fn invalid_row(table: &'static str, detail: impl Into<String>) -> Self {
        SyncError::InvalidRow {
            table,
            detail: detail.into(),
        }
    }
}

/// Failures reported by a [`crate::store::RemoteStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected a write because of a uniqueness constraint.
    #[error("uniqueness conflict on {0}")]
    Conflict(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Transport(format!("timeout: {}", err))
        } else if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::RemoteUnavailable(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type SyncResult<T> = std::result::Result<T, SyncError>;

use std::time::Duration;

use crate::schema::AccountId;

/// Error taxonomy shared by the pool, the collector and the store.
///
/// Containment rules:
/// - Per-event errors (`AttachmentUnreadable`, `StoreWriteFailure`) are
///   logged by the collector and never stop a worker.
/// - Per-session errors (`AuthInvalid`, `RateLimited`, `TransportLost`)
///   affect exactly one account.
/// - Nothing here crosses the controller's control surface; callers of
///   `CollectionController` only ever see `CollectionStatus`.
///
/// NOTE:
/// A duplicate link is not an error. The store reports it as
/// `SaveOutcome::AlreadyExists`.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Credential rejected by the platform. Needs operator action.
    #[error("credential rejected: {0}")]
    AuthInvalid(String),

    /// Platform-mandated back-off. Retriable after `wait`.
    #[error("rate limited, retry in {}s", wait.as_secs())]
    RateLimited { wait: Duration },

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("attachment unreadable: {0}")]
    AttachmentUnreadable(String),

    #[error("account {0} is not registered")]
    UnknownAccount(AccountId),

    #[error("store write failed: {0}")]
    StoreWriteFailure(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl CollectorError {
    /// True for failures that end the session (worker exits, health = lost).
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::AuthInvalid(_) | Self::TransportLost(_))
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;

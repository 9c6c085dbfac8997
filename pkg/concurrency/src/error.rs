use pkg_state::StoreError;
use thiserror::Error;

/// Failures surfaced by sessions and distributed mutexes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The coordinator stayed unreachable after bounded retries.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("invalid TTL {0}s: must be greater than zero")]
    InvalidTtl(i64),

    /// The session lease lapsed or the session was closed. Start over with a fresh session.
    #[error("session expired")]
    SessionExpired,

    #[error("mutex is not held")]
    NotHeld,

    /// `try_lock` found another session holding the lock.
    #[error("lock is held by {0}")]
    Locked(String),

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("lock acquisition deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid lock name: {0}")]
    InvalidLockName(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Error::Unavailable(msg),
            // A request against a lease the coordinator no longer knows means it lapsed
            StoreError::LeaseNotFound(_) => Error::SessionExpired,
            StoreError::InvalidTtl => Error::InvalidTtl(0),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

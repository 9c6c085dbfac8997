use pkg_types::lease::LeaseId;
use thiserror::Error;

/// Failures reported by a coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("invalid lease TTL: must be greater than zero and representable as a deadline")]
    InvalidTtl,
}

pub type Result<T> = std::result::Result<T, StoreError>;

//! Leases, sessions and distributed mutual exclusion on top of a [`Coordinator`].
//!
//! ```no_run
//! use pkg_concurrency::{DistributedMutex, Session, SessionOptions};
//! use pkg_state::StateStore;
//! use std::sync::Arc;
//!
//! # async fn demo() -> pkg_concurrency::Result<()> {
//! let store = Arc::new(StateStore::new());
//! let session = Arc::new(Session::new(store, SessionOptions::default().with_ttl(60)).await?);
//! let mut mu = DistributedMutex::new(session.clone(), "mutex1")?;
//! mu.lock().await?;
//! // critical section
//! mu.unlock().await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Coordinator`]: pkg_state::Coordinator

pub mod error;
pub mod lease;
pub mod mutex;
pub mod retry;
pub mod session;

pub use error::{Error, Result};
pub use lease::{KeepAlive, LeaseManager};
pub use mutex::{DistributedMutex, MutexState};
pub use retry::RetryPolicy;
pub use session::{Session, SessionOptions, SessionState};

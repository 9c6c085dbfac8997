//! Coordinator contract and the in-process store implementing it.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod txn;
pub mod watch;

pub use client::StateStore;
pub use coordinator::Coordinator;
pub use error::StoreError;

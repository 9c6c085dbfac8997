use async_trait::async_trait;
use pkg_types::kv::{KeyValue, Revision};
use pkg_types::lease::LeaseId;
use std::time::Duration;

use crate::error::Result;
use crate::txn::{Select, Txn, TxnResponse};
use crate::watch::WatchStream;

/// Capabilities the lock protocol consumes from a linearizable key-value store.
///
/// Every mutating call is atomic and advances the store revision once.
/// Keys attached to a lease are deleted when the lease is revoked or lapses.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Store `value` under `key`, optionally attached to `lease`.
    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<Revision>;

    /// Retrieve a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Read keys under `prefix`, narrowed by `select`.
    async fn range(&self, prefix: &str, select: Select) -> Result<Vec<KeyValue>>;

    /// List all keys under `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.range(prefix, Select::All).await
    }

    /// Delete one key. Returns the number of keys removed.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Delete every key under `prefix`. Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Evaluate the guards and run one branch atomically.
    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Stream changes to keys under `prefix`, starting after the current revision.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    /// Current store revision.
    async fn revision(&self) -> Result<Revision>;

    /// Request a new lease valid for `ttl`.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renew a lease once, returning its TTL.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration>;

    /// Invalidate a lease and delete every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Remaining time before the lease lapses, or `None` if it no longer exists.
    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<Duration>>;
}

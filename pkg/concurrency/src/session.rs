use pkg_constants::session::{DEFAULT_SESSION_TTL_SECS, KEEPALIVE_MAX_FAILURES, MAX_LEASE_TTL_SECS};
use pkg_state::Coordinator;
use pkg_types::lease::{Lease, LeaseId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lease::{KeepAlive, LeaseManager};
use crate::retry::RetryPolicy;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// The lease is being renewed.
    Active,
    /// Renewal failed or was abandoned; the lease has lapsed or soon will.
    Expired,
    /// Closed by the owner; the lease was revoked.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "Active"),
            SessionState::Expired => write!(f, "Expired"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Lease TTL in seconds; must be positive. Clamped to `MAX_LEASE_TTL_SECS`.
    pub ttl_secs: i64,
    /// Client identity; a random UUID when unset.
    pub client_id: Option<String>,
    pub retry: RetryPolicy,
    pub keepalive_max_failures: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
            client_id: None,
            retry: RetryPolicy::default(),
            keepalive_max_failures: KEEPALIVE_MAX_FAILURES,
        }
    }
}

impl SessionOptions {
    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_keepalive_max_failures(mut self, max_failures: u32) -> Self {
        self.keepalive_max_failures = max_failures;
        self
    }
}

/// A client identity bound to one lease that is kept alive in the background.
///
/// Dropping an Active session stops renewal and revokes the lease in the
/// background when a tokio runtime is available; otherwise the lease lapses
/// after its TTL. [`Session::close`] does the same and waits for the revoke.
pub struct Session {
    client_id: String,
    lease_id: LeaseId,
    // Last renewal published by the keep-alive task
    lease: watch::Receiver<Lease>,
    leases: LeaseManager,
    coordinator: Arc<dyn Coordinator>,
    retry: RetryPolicy,
    // Written by the keep-alive task while it runs, then by close/orphan once it is stopped
    state: Arc<watch::Sender<SessionState>>,
    keep_alive: Mutex<Option<KeepAlive>>,
    stop: CancellationToken,
}

impl Session {
    /// Grant a lease and start keeping it alive.
    pub async fn new(coordinator: Arc<dyn Coordinator>, options: SessionOptions) -> Result<Self> {
        if options.ttl_secs <= 0 {
            return Err(Error::InvalidTtl(options.ttl_secs));
        }
        let leases = LeaseManager::new(coordinator.clone())
            .with_retry(options.retry)
            .with_max_failures(options.keepalive_max_failures);
        let ttl_secs = (options.ttl_secs as u64).min(MAX_LEASE_TTL_SECS);
        let lease = leases.grant(Duration::from_secs(ttl_secs)).await?;

        let client_id = options
            .client_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (state_tx, _) = watch::channel(SessionState::Active);
        let state = Arc::new(state_tx);
        let lease_id = lease.id;
        let keep_alive = leases.keep_alive(lease, state.clone());
        let stop = keep_alive.cancel_token();

        info!(
            "Session {} opened with lease {} (ttl={}s)",
            client_id, lease_id, ttl_secs
        );

        Ok(Self {
            client_id,
            lease_id,
            lease: keep_alive.lease(),
            leases,
            coordinator,
            retry: options.retry,
            state,
            keep_alive: Mutex::new(Some(keep_alive)),
            stop,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The session lease as of its last successful renewal.
    pub fn lease(&self) -> Lease {
        self.lease.borrow().clone()
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Fail fast with [`Error::SessionExpired`] unless the session is Active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::SessionExpired)
        }
    }

    /// Get a receiver to observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Resolves once the session leaves the Active state.
    pub async fn done(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on a state change
        let _ = rx.wait_for(|state| *state != SessionState::Active).await;
    }

    /// Stop renewal and revoke the lease. Keys attached to it are deleted.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        self.stop_keep_alive().await;
        self.state.send_replace(SessionState::Closed);
        info!("Session {} closed", self.client_id);
        self.leases.revoke(&self.lease()).await
    }

    /// Stop renewal without revoking, as if this process had died.
    /// The session becomes Expired at once; the coordinator drops the lease
    /// and its keys once the TTL runs out.
    pub async fn orphan(&self) {
        self.stop_keep_alive().await;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Expired;
                true
            } else {
                false
            }
        });
        warn!(
            "Session {} orphaned; lease {} will lapse",
            self.client_id, self.lease_id
        );
    }

    async fn stop_keep_alive(&self) {
        if let Some(keep_alive) = self.keep_alive.lock().await.take() {
            keep_alive.stop().await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.cancel();
        if self.state() != SessionState::Active {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let coordinator = self.coordinator.clone();
        let lease = self.lease_id;
        let client_id = std::mem::take(&mut self.client_id);
        handle.spawn(async move {
            match coordinator.revoke_lease(lease).await {
                Ok(()) => debug!("Session {} dropped, revoked lease {}", client_id, lease),
                Err(e) => warn!(
                    "Session {} dropped, lease {} left to lapse: {}",
                    client_id, lease, e
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::StateStore;

    #[tokio::test]
    async fn test_non_positive_ttl_rejected() {
        let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());
        for ttl in [0, -5] {
            let err = Session::new(store.clone(), SessionOptions::default().with_ttl(ttl))
                .await
                .err()
                .expect("invalid ttl");
            assert_eq!(err, Error::InvalidTtl(ttl));
        }
    }

    #[tokio::test]
    async fn test_close_revokes_lease() {
        let store = StateStore::new();
        let session = Session::new(Arc::new(store.clone()), SessionOptions::default())
            .await
            .unwrap();
        assert!(session.is_active());
        store
            .put("owned", b"x", Some(session.lease_id()))
            .await
            .unwrap();

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.ensure_active(), Err(Error::SessionExpired));
        assert!(store.get("owned").await.unwrap().is_none());
        // Second close is a no-op
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_id_option() {
        let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());
        let session = Session::new(store, SessionOptions::default().with_client_id("worker-1"))
            .await
            .unwrap();
        assert_eq!(session.client_id(), "worker-1");
        assert_eq!(session.lease().ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped() {
        let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());
        let session = Session::new(store, SessionOptions::default().with_ttl(i64::MAX))
            .await
            .unwrap();
        assert!(session.is_active());
        assert_eq!(
            session.lease().ttl,
            Duration::from_secs(MAX_LEASE_TTL_SECS)
        );
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_tracks_renewals() {
        let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());
        let session = Session::new(store, SessionOptions::default().with_ttl(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(session.is_active());
        let lease = session.lease();
        assert!(lease.renewed_at > lease.granted_at);
        assert!(!lease.is_expired());
        session.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_lets_lease_lapse() {
        let store = StateStore::new();
        let session = Session::new(
            Arc::new(store.clone()),
            SessionOptions::default().with_ttl(2),
        )
        .await
        .unwrap();
        store
            .put("owned", b"x", Some(session.lease_id()))
            .await
            .unwrap();

        session.orphan().await;
        assert_eq!(session.state(), SessionState::Expired);
        assert!(store.get("owned").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.get("owned").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_resolves_on_outage() {
        let store = StateStore::new();
        let session = Session::new(
            Arc::new(store.clone()),
            SessionOptions::default().with_ttl(3),
        )
        .await
        .unwrap();
        store.set_available(false);

        tokio::time::timeout(Duration::from_secs(10), session.done())
            .await
            .expect("session expired before timeout");
        assert_eq!(session.state(), SessionState::Expired);

        // An expired session can still be closed
        store.set_available(true);
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_drop_revokes_active_lease() {
        let store = StateStore::new();
        let session = Session::new(Arc::new(store.clone()), SessionOptions::default())
            .await
            .unwrap();
        let lease = session.lease_id();
        store.put("owned", b"x", Some(lease)).await.unwrap();
        drop(session);

        tokio::time::timeout(Duration::from_secs(1), async {
            while store.get("owned").await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("key released on drop");
        assert!(store.time_to_live(lease).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_orphan_still_lapses() {
        let store = StateStore::new();
        let session = Session::new(
            Arc::new(store.clone()),
            SessionOptions::default().with_ttl(2),
        )
        .await
        .unwrap();
        let lease = session.lease_id();
        session.orphan().await;
        drop(session);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.time_to_live(lease).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.time_to_live(lease).await.unwrap().is_none());
    }
}

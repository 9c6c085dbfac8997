use pkg_constants::session::{
    KEEPALIVE_MAX_FAILURES, LEASE_RENEW_INTERVAL_DIVISOR, MAX_LEASE_TTL_SECS,
};
use pkg_state::{Coordinator, StoreError};
use pkg_types::lease::Lease;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::session::SessionState;

/// Grants, renews and revokes leases against a coordinator.
#[derive(Clone)]
pub struct LeaseManager {
    coordinator: Arc<dyn Coordinator>,
    retry: RetryPolicy,
    max_failures: u32,
}

impl LeaseManager {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            retry: RetryPolicy::default(),
            max_failures: KEEPALIVE_MAX_FAILURES,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Consecutive failed renewals tolerated before a kept-alive lease is declared expired.
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Request a new lease valid for `ttl`, clamped to `MAX_LEASE_TTL_SECS`.
    pub async fn grant(&self, ttl: Duration) -> Result<Lease> {
        if ttl.is_zero() {
            return Err(Error::InvalidTtl(0));
        }
        let ttl = ttl.min(Duration::from_secs(MAX_LEASE_TTL_SECS));
        let id = self
            .retry
            .run("lease grant", || self.coordinator.grant_lease(ttl))
            .await?;
        info!("Granted lease {} (ttl={:?})", id, ttl);
        Ok(Lease::new(id, ttl))
    }

    /// Invalidate `lease`; the coordinator deletes every key attached to it.
    /// Revoking a lease that already lapsed or was revoked succeeds.
    pub async fn revoke(&self, lease: &Lease) -> Result<()> {
        match self
            .retry
            .run("lease revoke", || self.coordinator.revoke_lease(lease.id))
            .await
        {
            Ok(()) => {
                info!("Revoked lease {}", lease.id);
                Ok(())
            }
            Err(StoreError::LeaseNotFound(_)) => {
                debug!("Lease {} already gone, nothing to revoke", lease.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew `lease` a single time, returning its TTL.
    pub async fn keep_alive_once(&self, lease: &Lease) -> Result<Duration> {
        let ttl = self
            .retry
            .run("lease renew", || self.coordinator.keep_alive_once(lease.id))
            .await?;
        debug!("Renewed lease {}", lease.id);
        Ok(ttl)
    }

    /// Remaining TTL reported by the coordinator, `None` once the lease is gone.
    pub async fn time_to_live(&self, lease: &Lease) -> Result<Option<Duration>> {
        Ok(self
            .retry
            .run("lease ttl", || self.coordinator.time_to_live(lease.id))
            .await?)
    }

    /// Start renewing `lease` every `ttl / 3` in a background task.
    ///
    /// Every successful renewal is published on [`KeepAlive::lease`].
    /// When renewal fails `max_failures` times in a row, or the local deadline
    /// passes, or the coordinator no longer knows the lease, `state` is moved
    /// to [`SessionState::Expired`] and the task ends.
    pub fn keep_alive(&self, lease: Lease, state: Arc<watch::Sender<SessionState>>) -> KeepAlive {
        let cancel = CancellationToken::new();
        let (renewals, lease_rx) = watch::channel(lease.clone());
        let renewer = Renewer {
            coordinator: self.coordinator.clone(),
            retry: self.retry,
            max_failures: self.max_failures,
            lease,
            renewals,
            state,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(renewer.run());
        KeepAlive {
            cancel,
            handle,
            lease: lease_rx,
        }
    }
}

/// Handle to a running keep-alive task.
pub struct KeepAlive {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    lease: watch::Receiver<Lease>,
}

impl KeepAlive {
    /// The lease as of its last successful renewal. Keeps the final value
    /// after the task ends.
    pub fn lease(&self) -> watch::Receiver<Lease> {
        self.lease.clone()
    }

    /// Token that stops the task when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Keep-alive task did not exit cleanly: {}", e);
        }
    }
}

struct Renewer {
    coordinator: Arc<dyn Coordinator>,
    retry: RetryPolicy,
    max_failures: u32,
    lease: Lease,
    renewals: watch::Sender<Lease>,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
}

impl Renewer {
    async fn run(self) {
        let id = self.lease.id;
        let renew_interval =
            (self.lease.ttl / LEASE_RENEW_INTERVAL_DIVISOR).max(Duration::from_millis(1));
        debug!(
            "Keep-alive started for lease {} (ttl={:?}, renew={:?})",
            id, self.lease.ttl, renew_interval
        );

        let mut last_renewed = Instant::now();
        let mut interval = tokio::time::interval(renew_interval);
        // The lease was just granted; the first immediate tick is not a renewal.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Keep-alive for lease {} stopped", id);
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.renew_once(last_renewed).await {
                Some(renewed_at) => {
                    last_renewed = renewed_at;
                    self.renewals.send_modify(Lease::renew);
                }
                None => {
                    if !self.cancel.is_cancelled() {
                        self.mark_expired();
                    }
                    return;
                }
            }
        }
    }

    /// One renewal with bounded retries. `None` means the lease is lost or the
    /// task was cancelled.
    async fn renew_once(&self, last_renewed: Instant) -> Option<Instant> {
        let id = self.lease.id;
        let mut failures = 0;
        loop {
            match self.coordinator.keep_alive_once(id).await {
                Ok(_) => {
                    if failures > 0 {
                        info!("Keep-alive for lease {} recovered after {} failure(s)", id, failures);
                    }
                    return Some(Instant::now());
                }
                Err(StoreError::LeaseNotFound(_)) => {
                    warn!("Lease {} no longer exists on the coordinator", id);
                    return None;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Keep-alive for lease {} failed ({}/{}): {}",
                        id, failures, self.max_failures, e
                    );
                    if failures >= self.max_failures {
                        return None;
                    }
                    if last_renewed.elapsed() >= self.lease.ttl {
                        warn!("Lease {} passed its deadline while retrying", id);
                        return None;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.retry.backoff(failures - 1)) => {}
                    }
                }
            }
        }
    }

    fn mark_expired(&self) {
        warn!("Lease {} declared expired", self.lease.id);
        self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Expired;
                true
            } else {
                false
            }
        });
    }
}

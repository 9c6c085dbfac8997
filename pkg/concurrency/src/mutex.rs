//! Ticket-queue mutual exclusion over a coordinator.
//!
//! Each contender writes `<name>/<lease-id>` attached to its session lease.
//! The coordinator stamps the key with a create revision, which orders all
//! contenders. The contender with the lowest revision holds the lock; every
//! other contender watches only its immediate predecessor, so a release wakes
//! exactly one waiter. A crashed holder's key disappears with its lease.

use pkg_constants::lock::LOCK_KEY_SEPARATOR;
use pkg_state::Coordinator;
use pkg_state::txn::{Compare, CompareOp, Op, Select, Txn};
use pkg_state::watch::EventType;
use pkg_types::kv::Revision;
use pkg_types::lock::LockRequest;
use pkg_types::validate::validate_lock_name;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::session::Session;

/// Local view of one mutex instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    Unlocked,
    Acquiring,
    Held,
    Releasing,
    /// The session expired while acquiring or holding. Terminal.
    Failed,
}

impl fmt::Display for MutexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutexState::Unlocked => write!(f, "Unlocked"),
            MutexState::Acquiring => write!(f, "Acquiring"),
            MutexState::Held => write!(f, "Held"),
            MutexState::Releasing => write!(f, "Releasing"),
            MutexState::Failed => write!(f, "Failed"),
        }
    }
}

/// A named lock shared by every session that constructs one with the same name.
pub struct DistributedMutex {
    session: Arc<Session>,
    name: String,
    prefix: String,
    key: String,
    request: Option<LockRequest>,
    state: MutexState,
}

impl DistributedMutex {
    pub fn new(session: Arc<Session>, name: &str) -> Result<Self> {
        validate_lock_name(name).map_err(|e| Error::InvalidLockName(e.to_string()))?;
        let prefix = format!("{}{}", name, LOCK_KEY_SEPARATOR);
        let key = format!("{}{}", prefix, session.lease_id());
        Ok(Self {
            session,
            name: name.to_string(),
            prefix,
            key,
            request: None,
            state: MutexState::Unlocked,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request key this mutex writes while acquiring or holding.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The request created by the last successful enqueue, while it is live.
    pub fn request(&self) -> Option<&LockRequest> {
        self.request.as_ref()
    }

    /// Current state. A held lock whose session is no longer Active reports `Failed`.
    pub fn state(&self) -> MutexState {
        if self.state == MutexState::Held && !self.session.is_active() {
            MutexState::Failed
        } else {
            self.state
        }
    }

    pub fn is_held(&self) -> bool {
        self.state() == MutexState::Held
    }

    /// Block until the lock is held.
    pub async fn lock(&mut self) -> Result<()> {
        self.lock_with(&CancellationToken::new(), None).await
    }

    /// Block until the lock is held, `cancel` fires, or `deadline` passes.
    ///
    /// On any failure the request key is deleted before returning, so no
    /// phantom waiter is left behind.
    pub async fn lock_with(
        &mut self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if self.is_held() {
            return Ok(());
        }
        self.session.ensure_active()?;
        self.state = MutexState::Acquiring;

        let (request, holder) = match self.enqueue().await {
            Ok(enqueued) => enqueued,
            Err(e) => {
                self.abandon(&e).await;
                return Err(e);
            }
        };
        let sequence = request.sequence;
        let owner = holder.key == request.key;
        self.request = Some(request);

        if !owner {
            info!(
                "Lock {} is busy, {} waiting at sequence {}",
                self.name, self.key, sequence
            );
            let coordinator = self.session.coordinator().as_ref();
            let waited = tokio::select! {
                res = wait_for_predecessors(coordinator, self.session.retry(), &self.prefix, sequence) => res,
                _ = self.session.done() => Err(Error::SessionExpired),
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = sleep_until_deadline(deadline) => Err(Error::DeadlineExceeded),
            };
            let confirmed = match waited {
                Ok(()) => self.confirm_ownership(sequence).await,
                Err(e) => Err(e),
            };
            if let Err(e) = confirmed {
                self.abandon(&e).await;
                return Err(e);
            }
        }

        self.state = MutexState::Held;
        info!(
            "Acquired lock {} (key={}, sequence={})",
            self.name, self.key, sequence
        );
        Ok(())
    }

    /// Take the lock only if nobody holds it; otherwise fail with [`Error::Locked`].
    pub async fn try_lock(&mut self) -> Result<()> {
        if self.is_held() {
            return Ok(());
        }
        self.session.ensure_active()?;
        self.state = MutexState::Acquiring;

        let (request, holder) = match self.enqueue().await {
            Ok(enqueued) => enqueued,
            Err(e) => {
                self.abandon(&e).await;
                return Err(e);
            }
        };
        if holder.key == request.key {
            info!(
                "Acquired lock {} (key={}, sequence={})",
                self.name, self.key, request.sequence
            );
            self.request = Some(request);
            self.state = MutexState::Held;
            return Ok(());
        }

        let coordinator = self.session.coordinator().as_ref();
        let key = self.key.as_str();
        let released = self
            .session
            .retry()
            .run("lock withdraw", || coordinator.delete(key))
            .await;
        self.request = None;
        self.state = MutexState::Unlocked;
        released?;

        debug!("Lock {} is held by {}", self.name, holder.key);
        Err(Error::Locked(holder.key))
    }

    /// Release the lock by deleting the request key.
    ///
    /// Also accepted after the session expired while holding; the key is then
    /// already gone or about to be.
    pub async fn unlock(&mut self) -> Result<()> {
        if self.state != MutexState::Held {
            return Err(Error::NotHeld);
        }
        self.state = MutexState::Releasing;

        let coordinator = self.session.coordinator().as_ref();
        let key = self.key.as_str();
        match self
            .session
            .retry()
            .run("lock release", || coordinator.delete(key))
            .await
        {
            Ok(_) => {
                self.state = MutexState::Unlocked;
                self.request = None;
                info!("Released lock {} (key={})", self.name, self.key);
                Ok(())
            }
            Err(e) => {
                self.state = MutexState::Held;
                Err(e.into())
            }
        }
    }

    /// Current holder of the lock, if anyone holds it.
    pub async fn holder(&self) -> Result<Option<LockRequest>> {
        let coordinator = self.session.coordinator().as_ref();
        let prefix = self.prefix.as_str();
        let kvs = self
            .session
            .retry()
            .run("lock holder", || coordinator.range(prefix, Select::FirstCreated))
            .await?;
        Ok(kvs.first().map(|kv| LockRequest::from_kv(&self.name, kv)))
    }

    /// Create the request key if this session has none yet and read the
    /// first-created key, in one transaction. Returns the request and the
    /// holder seen by that transaction.
    async fn enqueue(&self) -> Result<(LockRequest, LockRequest)> {
        let lease = self.session.lease_id();
        let txn = Txn::new()
            .when([Compare::create_revision(&self.key, CompareOp::Equal, 0)])
            .and_then([
                Op::put_with_lease(&self.key, "", lease),
                Op::range(&self.prefix, Select::FirstCreated),
            ])
            .or_else([
                Op::get(&self.key),
                Op::range(&self.prefix, Select::FirstCreated),
            ]);

        let coordinator = self.session.coordinator().as_ref();
        let resp = self
            .session
            .retry()
            .run("lock enqueue", || coordinator.txn(txn.clone()))
            .await?;

        let sequence = if resp.succeeded {
            resp.revision
        } else {
            resp.responses
                .first()
                .and_then(|r| r.kvs().first())
                .map(|kv| kv.create_revision)
                .ok_or(Error::SessionExpired)?
        };
        // Our own key is under the prefix, so the range is never empty
        let holder = resp
            .responses
            .get(1)
            .and_then(|r| r.kvs().first())
            .map(|first| LockRequest::from_kv(&self.name, first))
            .ok_or(Error::SessionExpired)?;

        let request = LockRequest {
            lock_name: self.name.clone(),
            key: self.key.clone(),
            sequence,
            lease: Some(lease),
        };
        Ok((request, holder))
    }

    /// After the queue ahead drained, make sure our own key survived.
    async fn confirm_ownership(&self, sequence: Revision) -> Result<()> {
        self.session.ensure_active()?;
        let coordinator = self.session.coordinator().as_ref();
        let key = self.key.as_str();
        let current = self
            .session
            .retry()
            .run("lock confirm", || coordinator.get(key))
            .await?;
        match current {
            Some(kv) if kv.create_revision == sequence => Ok(()),
            _ => Err(Error::SessionExpired),
        }
    }

    /// Withdraw a failed acquisition.
    async fn abandon(&mut self, err: &Error) {
        warn!("Acquiring lock {} failed: {}", self.name, err);
        let coordinator = self.session.coordinator().as_ref();
        let key = self.key.as_str();
        if let Err(e) = self
            .session
            .retry()
            .run("lock withdraw", || coordinator.delete(key))
            .await
        {
            warn!("Could not delete request key {}: {}", self.key, e);
        }
        self.request = None;
        self.state = if *err == Error::SessionExpired {
            MutexState::Failed
        } else {
            MutexState::Unlocked
        };
    }
}

/// Wait until no key under `prefix` was created before `sequence`.
async fn wait_for_predecessors(
    coordinator: &dyn Coordinator,
    retry: RetryPolicy,
    prefix: &str,
    sequence: Revision,
) -> Result<()> {
    loop {
        let predecessors = retry
            .run("lock predecessor", || {
                coordinator.range(prefix, Select::LastCreatedBefore(sequence))
            })
            .await?;
        let Some(predecessor) = predecessors.into_iter().next() else {
            return Ok(());
        };
        debug!(
            "Waiting for {} (sequence {}) to be released",
            predecessor.key, predecessor.create_revision
        );
        wait_for_delete(coordinator, retry, &predecessor.key).await?;
    }
}

async fn wait_for_delete(coordinator: &dyn Coordinator, retry: RetryPolicy, key: &str) -> Result<()> {
    let mut watch = retry
        .run("lock watch", || coordinator.watch_prefix(key))
        .await?;
    // The key may have gone before the watch was opened
    if retry.run("lock recheck", || coordinator.get(key)).await?.is_none() {
        return Ok(());
    }
    while let Some(batch) = watch.next().await {
        if batch.missed > 0 {
            if retry.run("lock recheck", || coordinator.get(key)).await?.is_none() {
                return Ok(());
            }
            continue;
        }
        if batch
            .events
            .iter()
            .any(|e| e.event_type == EventType::Delete && e.kv.key == key)
        {
            return Ok(());
        }
    }
    Err(Error::Unavailable(format!("watch on {} closed", key)))
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

use async_trait::async_trait;
use pkg_constants::state::{LEASE_REAPER_INTERVAL_MS, WATCH_CHANNEL_CAPACITY};
use pkg_types::kv::{KeyValue, Revision};
use pkg_types::lease::LeaseId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::error::{Result, StoreError};
use crate::txn::{Op, OpResponse, Select, Txn, TxnResponse};
use crate::watch::{EventLog, EventType, WatchEvent, WatchStream};

/// In-process, single-node coordinator.
///
/// Linearizable by construction: every request runs under one async mutex.
/// Lapsed leases are reaped lazily on each request and by a background sweeper,
/// so deletions reach watchers even when nobody is calling in.
#[derive(Clone)]
pub struct StateStore {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<StoreState>,
    event_log: EventLog,
    available: AtomicBool,
}

#[derive(Default)]
struct StoreState {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
}

struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

impl StateStore {
    /// Create an empty store. When called inside a tokio runtime the lease
    /// sweeper is spawned; it stops once the last handle is dropped.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(StoreState::default()),
            event_log: EventLog::new(WATCH_CHANNEL_CAPACITY),
            available: AtomicBool::new(true),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_expired_leases(Arc::downgrade(&shared)));
        }
        info!("Opened in-process state store");
        Self { shared }
    }

    /// Simulate the coordinator becoming unreachable (or reachable again).
    /// While unavailable every request fails with [`StoreError::Unavailable`];
    /// leases keep ticking toward expiry.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
        info!("State store availability set to {}", available);
    }

    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::Acquire)
    }

    /// Lock the state for one request, reaping any lease that lapsed meanwhile.
    async fn locked(&self) -> Result<MutexGuard<'_, StoreState>> {
        if !self.is_available() {
            return Err(StoreError::Unavailable(
                "state store is not reachable".to_string(),
            ));
        }
        let mut state = self.shared.state.lock().await;
        state.expire_due(Instant::now(), &self.shared.event_log);
        Ok(state)
    }

    async fn execute(&self, txn: Txn) -> Result<TxnResponse> {
        let mut state = self.locked().await?;
        state.execute(txn, &self.shared.event_log)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap_expired_leases(shared: Weak<Shared>) {
    let mut interval = tokio::time::interval(Duration::from_millis(LEASE_REAPER_INTERVAL_MS));
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut state = shared.state.lock().await;
        let expired = state.expire_due(Instant::now(), &shared.event_log);
        if expired > 0 {
            debug!("Lease reaper expired {} lease(s)", expired);
        }
    }
}

impl StoreState {
    fn expire_due(&mut self, now: Instant, log: &EventLog) -> usize {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            info!("Lease {} expired", id);
            self.revoke(*id, log);
        }
        due.len()
    }

    /// Drop a lease and delete its keys at a single revision.
    fn revoke(&mut self, id: LeaseId, log: &EventLog) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let rev = self.revision + 1;
        let mut events = Vec::new();
        for key in &lease.keys {
            self.apply_delete(key, rev, &mut events);
        }
        self.commit(rev, events, log);
        true
    }

    fn commit(&mut self, rev: Revision, events: Vec<WatchEvent>, log: &EventLog) {
        if !events.is_empty() {
            self.revision = rev;
            log.emit(rev, events);
        }
    }

    fn range(&self, prefix: &str, select: Select) -> Vec<KeyValue> {
        let under_prefix = self
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv);
        match select {
            Select::All => under_prefix.cloned().collect(),
            Select::FirstCreated => under_prefix
                .min_by_key(|kv| kv.create_revision)
                .cloned()
                .into_iter()
                .collect(),
            Select::LastCreatedBefore(before) => under_prefix
                .filter(|kv| kv.create_revision < before)
                .max_by_key(|kv| kv.create_revision)
                .cloned()
                .into_iter()
                .collect(),
        }
    }

    fn apply_put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        rev: Revision,
        events: &mut Vec<WatchEvent>,
    ) {
        let (create_revision, version, old_lease) = match self.kvs.get(key) {
            Some(prev) => (prev.create_revision, prev.version + 1, prev.lease),
            None => (rev, 1, None),
        };
        if let Some(old) = old_lease {
            if Some(old) != lease {
                if let Some(record) = self.leases.get_mut(&old) {
                    record.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(record) = self.leases.get_mut(&id) {
                record.keys.insert(key.to_string());
            }
        }
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision,
            mod_revision: rev,
            version,
            lease,
        };
        events.push(WatchEvent {
            event_type: EventType::Put,
            kv: kv.clone(),
        });
        self.kvs.insert(key.to_string(), kv);
    }

    fn apply_delete(&mut self, key: &str, rev: Revision, events: &mut Vec<WatchEvent>) -> u64 {
        let Some(prev) = self.kvs.remove(key) else {
            return 0;
        };
        if let Some(id) = prev.lease {
            if let Some(record) = self.leases.get_mut(&id) {
                record.keys.remove(key);
            }
        }
        events.push(WatchEvent {
            event_type: EventType::Delete,
            kv: KeyValue {
                key: prev.key,
                value: Vec::new(),
                create_revision: 0,
                mod_revision: rev,
                version: 0,
                lease: None,
            },
        });
        1
    }

    fn execute(&mut self, txn: Txn, log: &EventLog) -> Result<TxnResponse> {
        let succeeded = txn
            .compares
            .iter()
            .all(|cmp| cmp.evaluate(self.kvs.get(&cmp.key)));
        let ops = if succeeded { txn.success } else { txn.failure };

        // Reject the whole branch before touching anything
        for op in &ops {
            if let Op::Put { lease: Some(id), .. } = op {
                if !self.leases.contains_key(id) {
                    return Err(StoreError::LeaseNotFound(*id));
                }
            }
        }

        let rev = self.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                Op::Put { key, value, lease } => {
                    self.apply_put(&key, value, lease, rev, &mut events);
                    OpResponse::Put { revision: rev }
                }
                Op::Get { key } => OpResponse::Range {
                    kvs: self.kvs.get(&key).cloned().into_iter().collect(),
                },
                Op::Range { prefix, select } => OpResponse::Range {
                    kvs: self.range(&prefix, select),
                },
                Op::Delete { key } => OpResponse::Delete {
                    deleted: self.apply_delete(&key, rev, &mut events),
                },
                Op::DeletePrefix { prefix } => {
                    let keys: Vec<String> = self
                        .range(&prefix, Select::All)
                        .into_iter()
                        .map(|kv| kv.key)
                        .collect();
                    let mut deleted = 0;
                    for key in keys {
                        deleted += self.apply_delete(&key, rev, &mut events);
                    }
                    OpResponse::Delete { deleted }
                }
            };
            responses.push(response);
        }
        self.commit(rev, events, log);

        Ok(TxnResponse {
            succeeded,
            revision: self.revision,
            responses,
        })
    }
}

#[async_trait]
impl Coordinator for StateStore {
    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<Revision> {
        let op = Op::Put {
            key: key.to_string(),
            value: value.to_vec(),
            lease,
        };
        let resp = self.execute(Txn::new().and_then([op])).await?;
        Ok(resp.revision)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.locked().await?;
        Ok(state.kvs.get(key).cloned())
    }

    async fn range(&self, prefix: &str, select: Select) -> Result<Vec<KeyValue>> {
        let state = self.locked().await?;
        Ok(state.range(prefix, select))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let resp = self.execute(Txn::new().and_then([Op::delete(key)])).await?;
        Ok(deleted_count(&resp))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let resp = self
            .execute(Txn::new().and_then([Op::delete_prefix(prefix)]))
            .await?;
        Ok(deleted_count(&resp))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.execute(txn).await
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        // Subscribe under the lock so the stream starts right after the current revision
        let _state = self.locked().await?;
        Ok(self.shared.event_log.watch_prefix(prefix))
    }

    async fn revision(&self) -> Result<Revision> {
        let state = self.locked().await?;
        Ok(state.revision)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl);
        }
        let deadline = Instant::now()
            .checked_add(ttl)
            .ok_or(StoreError::InvalidTtl)?;
        let mut state = self.locked().await?;
        let id = loop {
            let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
            let id = LeaseId((high >> 1) as i64);
            if id.0 != 0 && !state.leases.contains_key(&id) {
                break id;
            }
        };
        state.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline,
                keys: BTreeSet::new(),
            },
        );
        debug!("Granted lease {} (ttl={:?})", id, ttl);
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration> {
        let mut state = self.locked().await?;
        let record = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        record.deadline = Instant::now()
            .checked_add(record.ttl)
            .ok_or(StoreError::InvalidTtl)?;
        Ok(record.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.locked().await?;
        if state.revoke(lease, &self.shared.event_log) {
            debug!("Revoked lease {}", lease);
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<Duration>> {
        let state = self.locked().await?;
        let now = Instant::now();
        Ok(state
            .leases
            .get(&lease)
            .map(|record| record.deadline.saturating_duration_since(now)))
    }
}

fn deleted_count(resp: &TxnResponse) -> u64 {
    resp.responses
        .iter()
        .map(|r| match r {
            OpResponse::Delete { deleted } => *deleted,
            _ => 0,
        })
        .sum()
}

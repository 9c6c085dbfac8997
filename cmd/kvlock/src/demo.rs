//! Scripted walk-throughs of the client API, one per subcommand.

use pkg_concurrency::{DistributedMutex, LeaseManager, RetryPolicy, Session, SessionOptions};
use pkg_state::{Coordinator, StoreError};
use pkg_state::txn::{Compare, CompareOp, Op, Txn};
use pkg_types::kv::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{info, warn};

fn describe(kvs: &[KeyValue]) -> String {
    let entries: Vec<String> = kvs
        .iter()
        .map(|kv| {
            format!(
                "{}={} (create={}, mod={}, version={})",
                kv.key,
                kv.value_str(),
                kv.create_revision,
                kv.mod_revision,
                kv.version
            )
        })
        .collect();
    format!("[{}]", entries.join(", "))
}

pub async fn access(store: &dyn Coordinator) -> anyhow::Result<()> {
    let rev = store.put("foo", b"bar", None).await?;
    info!("put(foo, bar): revision={}", rev);

    let got = store.get("foo").await?;
    info!("get(foo): {}", describe(got.as_slice()));
    Ok(())
}

async fn put_numbered(store: &dyn Coordinator, prefix: &str) -> anyhow::Result<()> {
    for i in 0..10 {
        let key = format!("{}{}", prefix, i);
        let value = format!("bar{}", i);
        let rev = store.put(&key, value.as_bytes(), None).await?;
        info!("put({}, {}): revision={}", key, value, rev);
    }
    Ok(())
}

pub async fn get_by_prefix(store: &dyn Coordinator) -> anyhow::Result<()> {
    let prefix = "foo";
    put_numbered(store, prefix).await?;

    let kvs = store.get_prefix(prefix).await?;
    info!("get({}) with prefix: {}", prefix, describe(&kvs));
    Ok(())
}

pub async fn delete(store: &dyn Coordinator) -> anyhow::Result<()> {
    let rev = store.put("foo", b"bar", None).await?;
    info!("put(foo, bar): revision={}", rev);

    let deleted = store.delete("foo").await?;
    info!("delete(foo): deleted={}", deleted);

    let prefix = "foo";
    put_numbered(store, prefix).await?;

    let deleted = store.delete_prefix(prefix).await?;
    info!("delete({}) with prefix: deleted={}", prefix, deleted);
    Ok(())
}

pub async fn transactional_write(store: &dyn Coordinator) -> anyhow::Result<()> {
    let rev = store.put("user1", b"bad", None).await?;
    info!("put(user1, bad): revision={}", rev);

    let resp = store
        .txn(
            Txn::new()
                .when([Compare::value("user1", CompareOp::Equal, "bad")])
                .and_then([Op::delete("user1")])
                .or_else([Op::put("user1", "good")]),
        )
        .await?;
    info!(
        "compare(user1 = bad) then delete(user1) else put(user1, good): succeeded={}, revision={}",
        resp.succeeded, resp.revision
    );

    let got = store.get("user1").await?;
    info!("get(user1): {}", describe(got.as_slice()));
    Ok(())
}

pub async fn watch(store: Arc<dyn Coordinator>, count: usize, interval: Duration) -> anyhow::Result<()> {
    let mut stream = store.watch_prefix("stock").await?;

    let writer_store = store.clone();
    let mut writer = tokio::spawn(async move {
        for i in 0..=count {
            let key = format!("stock{}", i);
            let value = format!("value{}", i);
            let rev = writer_store.put(&key, value.as_bytes(), None).await?;
            info!("put({}, {}): revision={}", key, value, rev);
            tokio::time::sleep(interval).await;
        }
        Ok::<(), StoreError>(())
    });

    let mut writer_done = false;
    let mut i = 0;
    loop {
        tokio::select! {
            res = &mut writer, if !writer_done => {
                writer_done = true;
                if let Err(e) = res? {
                    warn!("watch writer stopped: {}", e);
                    return Err(e.into());
                }
            }
            batch = stream.next() => {
                let Some(batch) = batch else {
                    anyhow::bail!("watch(stock) closed after {} batches", i);
                };
                info!(
                    "{}/{}: watch(stock) with prefix: revision={}",
                    i, count, batch.revision
                );
                for (j, event) in batch.events.iter().enumerate() {
                    info!(
                        "{}/{}: events[{}]={:?} {}={}",
                        i,
                        count,
                        j,
                        event.event_type,
                        event.kv.key,
                        event.kv.value_str()
                    );
                }
                if i >= count {
                    break;
                }
                i += 1;
            }
        }
    }

    if !writer_done {
        writer.abort();
    }
    Ok(())
}

pub async fn lease(store: Arc<dyn Coordinator>, ttl: Duration, retry: RetryPolicy) -> anyhow::Result<()> {
    let leases = LeaseManager::new(store.clone()).with_retry(retry);
    let lease = leases.grant(ttl).await?;
    info!("grant({:?}): lease={}", ttl, lease.id);

    let (key, value) = ("sample", "value");
    let rev = store.put(key, value.as_bytes(), Some(lease.id)).await?;
    info!("put({}, {}) with lease {}: revision={}", key, value, lease.id, rev);

    let got = store.get(key).await?;
    info!("get({}): {}", key, describe(got.as_slice()));

    let renewed = leases.keep_alive_once(&lease).await?;
    info!("keepalive({}): ttl={:?}", lease.id, renewed);

    leases.revoke(&lease).await?;
    info!("revoke({}): done", lease.id);

    let got = store.get(key).await?;
    info!("get({}): {}", key, describe(got.as_slice()));
    Ok(())
}

pub async fn distributed_locks(
    store: Arc<dyn Coordinator>,
    options: SessionOptions,
    name: &str,
    hold: Duration,
) -> anyhow::Result<()> {
    let s1 = Arc::new(Session::new(store.clone(), options.clone()).await?);
    let mut mu1 = DistributedMutex::new(s1.clone(), name)?;
    info!("mu1 lock");
    mu1.lock().await?;
    info!("mu1 acquired");

    let releaser = tokio::spawn(async move {
        info!("mu1 sleep {:?}...", hold);
        tokio::time::sleep(hold).await;
        info!("mu1 unlock");
        match mu1.unlock().await {
            Ok(()) => info!("mu1 released"),
            Err(e) => warn!("mu1 unlock failed: {}", e),
        }
    });

    let s2 = Arc::new(Session::new(store, options).await?);
    let mut mu2 = DistributedMutex::new(s2.clone(), name)?;
    info!("mu2 lock");
    let locked = mu2.lock().await;
    if locked.is_ok() {
        info!("mu2 acquired");
        mu2.unlock().await?;
    }

    releaser.await?;
    s2.close().await?;
    s1.close().await?;
    locked?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::StateStore;

    #[tokio::test]
    async fn test_key_value_demos_leave_expected_state() {
        let store = StateStore::new();
        access(&store).await.unwrap();
        assert_eq!(store.get("foo").await.unwrap().unwrap().value_str(), "bar");

        get_by_prefix(&store).await.unwrap();
        assert_eq!(store.get_prefix("foo").await.unwrap().len(), 11);

        delete(&store).await.unwrap();
        assert!(store.get_prefix("foo").await.unwrap().is_empty());

        transactional_write(&store).await.unwrap();
        assert!(store.get("user1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_demo_terminates() {
        let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());
        tokio::time::timeout(
            Duration::from_secs(5),
            watch(store.clone(), 3, Duration::from_millis(10)),
        )
        .await
        .expect("watch demo finished")
        .unwrap();
        assert_eq!(store.get_prefix("stock").await.unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_demo_fails_when_writer_fails() {
        let store = StateStore::new();
        let demo = tokio::spawn(watch(
            Arc::new(store.clone()),
            5,
            Duration::from_secs(1),
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        store.set_available(false);

        let result = tokio::time::timeout(Duration::from_secs(10), demo)
            .await
            .expect("watch demo returned")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_lease_demo_revokes_key() {
        let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());
        lease(store.clone(), Duration::from_secs(300), RetryPolicy::default())
            .await
            .unwrap();
        assert!(store.get("sample").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_demo_hands_over() {
        let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());
        distributed_locks(
            store.clone(),
            SessionOptions::default(),
            "mutex1",
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(store.get_prefix("mutex1/").await.unwrap().is_empty());
    }
}

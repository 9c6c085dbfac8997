use pkg_types::kv::{KeyValue, Revision};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change to one key.
///
/// For deletions `kv` carries the key and the deleting revision as `mod_revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
}

/// All changes committed at one revision that matched the watched prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
    /// Number of batches dropped because the watcher fell behind.
    /// Non-zero means the watcher must re-read state instead of trusting the stream.
    #[serde(default)]
    pub missed: u64,
}

/// Fan-out of committed revisions to every open watch stream.
#[derive(Clone)]
pub struct EventLog {
    sender: broadcast::Sender<WatchResponse>,
}

impl EventLog {
    /// Create a new event log buffering up to `capacity` undelivered batches per watcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish the events of one committed revision. Called by the store while
    /// it still holds its write lock, so batches arrive in revision order.
    pub fn emit(&self, revision: Revision, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        // No receivers is not an error
        let _ = self.sender.send(WatchResponse {
            revision,
            events,
            missed: 0,
        });
    }

    /// Open a stream of batches touching keys under `prefix`.
    pub fn watch_prefix(&self, prefix: &str) -> WatchStream {
        WatchStream {
            inner: BroadcastStream::new(self.sender.subscribe()),
            prefix: prefix.to_string(),
        }
    }
}

/// Lazy, infinite stream of change batches for one prefix.
///
/// Dropping the stream cancels the watch; it cannot be resumed.
pub struct WatchStream {
    inner: BroadcastStream<WatchResponse>,
    prefix: String,
}

impl WatchStream {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Stream for WatchStream {
    type Item = WatchResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(mut batch)) => {
                    batch.events.retain(|e| e.kv.key.starts_with(&self.prefix));
                    if !batch.events.is_empty() {
                        return Poll::Ready(Some(batch));
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    return Poll::Ready(Some(WatchResponse {
                        revision: 0,
                        events: Vec::new(),
                        missed,
                    }));
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn put_event(key: &str, rev: Revision) -> WatchEvent {
        WatchEvent {
            event_type: EventType::Put,
            kv: KeyValue {
                key: key.to_string(),
                value: b"v".to_vec(),
                create_revision: rev,
                mod_revision: rev,
                version: 1,
                lease: None,
            },
        }
    }

    #[tokio::test]
    async fn test_prefix_filtering() {
        let log = EventLog::new(16);
        let mut stream = log.watch_prefix("stock");

        log.emit(1, vec![put_event("other", 1)]);
        log.emit(2, vec![put_event("stock1", 2), put_event("zzz", 2)]);

        let batch = stream.next().await.expect("batch");
        assert_eq!(batch.revision, 2);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].kv.key, "stock1");
    }

    #[tokio::test]
    async fn test_lagging_watcher_is_told_to_resync() {
        let log = EventLog::new(2);
        let mut stream = log.watch_prefix("");

        for rev in 1..=5 {
            log.emit(rev, vec![put_event("k", rev)]);
        }

        let batch = stream.next().await.expect("batch");
        assert!(batch.missed > 0);
        assert!(batch.events.is_empty());
    }

    #[tokio::test]
    async fn test_stream_ends_when_log_dropped() {
        let log = EventLog::new(4);
        let mut stream = log.watch_prefix("");
        drop(log);
        assert!(stream.next().await.is_none());
    }
}

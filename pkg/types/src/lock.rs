use serde::{Deserialize, Serialize};

use crate::kv::{KeyValue, Revision};
use crate::lease::LeaseId;

/// One pending or granted request for a named lock.
///
/// Stored at `<lock_name>/<lease-id-hex>`; requests are ranked by `sequence`,
/// the revision at which the coordinator created the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub lock_name: String,
    pub key: String,
    pub sequence: Revision,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

impl LockRequest {
    pub fn from_kv(lock_name: &str, kv: &KeyValue) -> Self {
        Self {
            lock_name: lock_name.to_string(),
            key: kv.key.clone(),
            sequence: kv.create_revision,
            lease: kv.lease,
        }
    }
}

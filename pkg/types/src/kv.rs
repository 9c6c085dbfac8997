use serde::{Deserialize, Serialize};

use crate::lease::LeaseId;

/// Global store revision. Advances once per committed write or transaction.
pub type Revision = i64;

/// A key with its value and revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
    /// Revision at which the key was created (reset when it is deleted and re-created)
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Number of writes since creation, starting at 1
    pub version: i64,
    /// Lease the key is attached to, if any
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    /// Value as UTF-8 text, lossy.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).to_string()
    }
}

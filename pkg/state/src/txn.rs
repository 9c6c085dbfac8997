//! Transaction model: a set of guards, then one of two op lists, applied atomically.

use pkg_types::kv::{KeyValue, Revision};
use pkg_types::lease::LeaseId;

/// Comparison operator used by a [`Compare`] guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

/// The attribute of a key a guard looks at, with the operand to compare against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Value(Vec<u8>),
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
}

/// A guard evaluated against the current state of one key.
///
/// A missing key has create revision, mod revision and version 0, and never
/// satisfies a value comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Value(value.into()),
        }
    }

    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Version(version),
        }
    }

    /// Evaluate the guard against the key's current state.
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        let ordering = match (&self.target, current) {
            (CompareTarget::Value(_), None) => return false,
            (CompareTarget::Value(expected), Some(kv)) => kv.value.as_slice().cmp(expected.as_slice()),
            (CompareTarget::CreateRevision(rev), kv) => {
                kv.map_or(0, |kv| kv.create_revision).cmp(rev)
            }
            (CompareTarget::ModRevision(rev), kv) => kv.map_or(0, |kv| kv.mod_revision).cmp(rev),
            (CompareTarget::Version(version), kv) => kv.map_or(0, |kv| kv.version).cmp(version),
        };
        match self.op {
            CompareOp::Equal => ordering.is_eq(),
            CompareOp::NotEqual => ordering.is_ne(),
            CompareOp::Greater => ordering.is_gt(),
            CompareOp::Less => ordering.is_lt(),
        }
    }
}

/// Which keys a prefix range returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select {
    /// Every key under the prefix, ordered by key.
    All,
    /// The key with the lowest create revision.
    FirstCreated,
    /// The key with the highest create revision strictly below the given one.
    LastCreatedBefore(Revision),
}

/// A single operation inside a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Get {
        key: String,
    },
    Range {
        prefix: String,
        select: Select,
    },
    Delete {
        key: String,
    },
    DeletePrefix {
        prefix: String,
    },
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Op::Get { key: key.into() }
    }

    pub fn range(prefix: impl Into<String>, select: Select) -> Self {
        Op::Range {
            prefix: prefix.into(),
            select,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        Op::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// Result of one [`Op`], positionally matching the executed branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    Put { revision: Revision },
    Range { kvs: Vec<KeyValue> },
    Delete { deleted: u64 },
}

impl OpResponse {
    /// Keys returned by a `Get` or `Range` op; empty for writes.
    pub fn kvs(&self) -> &[KeyValue] {
        match self {
            OpResponse::Range { kvs } => kvs,
            _ => &[],
        }
    }
}

/// If every guard holds, run `success`, otherwise run `failure`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether the guards held and the success branch ran
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: Revision,
    pub responses: Vec<OpResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(value: &str, create: Revision, modified: Revision, version: i64) -> KeyValue {
        KeyValue {
            key: "k".to_string(),
            value: value.as_bytes().to_vec(),
            create_revision: create,
            mod_revision: modified,
            version,
            lease: None,
        }
    }

    #[test]
    fn test_value_compare() {
        let current = kv("bad", 3, 3, 1);
        assert!(Compare::value("k", CompareOp::Equal, "bad").evaluate(Some(&current)));
        assert!(!Compare::value("k", CompareOp::Equal, "good").evaluate(Some(&current)));
        assert!(Compare::value("k", CompareOp::NotEqual, "good").evaluate(Some(&current)));
        assert!(Compare::value("k", CompareOp::Less, "c").evaluate(Some(&current)));
    }

    #[test]
    fn test_missing_key_compares() {
        assert!(!Compare::value("k", CompareOp::Equal, "").evaluate(None));
        assert!(!Compare::value("k", CompareOp::NotEqual, "x").evaluate(None));
        assert!(Compare::create_revision("k", CompareOp::Equal, 0).evaluate(None));
        assert!(Compare::version("k", CompareOp::Equal, 0).evaluate(None));
    }

    #[test]
    fn test_revision_compares() {
        let current = kv("v", 4, 9, 3);
        assert!(Compare::create_revision("k", CompareOp::Equal, 4).evaluate(Some(&current)));
        assert!(Compare::mod_revision("k", CompareOp::Greater, 4).evaluate(Some(&current)));
        assert!(Compare::version("k", CompareOp::Less, 4).evaluate(Some(&current)));
        assert!(!Compare::create_revision("k", CompareOp::Equal, 0).evaluate(Some(&current)));
    }
}

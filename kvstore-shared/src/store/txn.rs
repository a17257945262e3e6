//! Single-round compare-and-swap transactions.
//!
//! A [`TxnRequest`] holds a list of comparisons, the ops to run when all of them hold and the
//! ops to run otherwise. The store evaluates and applies it atomically.

use bytes::Bytes;

use super::{KeyValue, LeaseId};

/// A condition evaluated against the current state of `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key's create revision equals `revision`. A missing key has create revision 0.
    CreateRevision { key: String, revision: u64 },
    /// The key's version equals `version`. A missing key has version 0.
    Version { key: String, version: u64 },
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, revision: u64) -> Self {
        Compare::CreateRevision {
            key: key.into(),
            revision,
        }
    }

    /// Holds iff `key` does not exist.
    pub fn absent(key: impl Into<String>) -> Self {
        Compare::Version {
            key: key.into(),
            version: 0,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Compare::CreateRevision { key, .. } | Compare::Version { key, .. } => key,
        }
    }

    /// Evaluates the comparison against the key's current value.
    pub fn holds(&self, current: Option<&KeyValue>) -> bool {
        match self {
            Compare::CreateRevision { revision, .. } => {
                current.map_or(0, |kv| kv.create_revision) == *revision
            }
            Compare::Version { version, .. } => current.map_or(0, |kv| kv.version) == *version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Get { key: String },
    GetPrefix { prefix: String },
    Put {
        key: String,
        value: Bytes,
        lease: Option<LeaseId>,
    },
    Delete { key: String },
}

impl TxnOp {
    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    pub fn get_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::GetPrefix {
            prefix: prefix.into(),
        }
    }

    pub fn put(key: impl Into<String>, value: Bytes, lease: Option<LeaseId>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value,
            lease,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    /// Keys returned by a `Get` (zero or one) or `GetPrefix`, ordered by key.
    Range(Vec<KeyValue>),
    Put,
    Delete { deleted: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compare.push(compare);
        self
    }

    pub fn and_then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

/// Outcome of a transaction. `responses` follow the order of the branch that ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
    pub revision: u64,
}

impl TxnResponse {
    /// Keys returned by the `index`th op if it was a read.
    pub fn range(&self, index: usize) -> Option<&[KeyValue]> {
        match self.responses.get(index) {
            Some(TxnOpResponse::Range(kvs)) => Some(kvs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(create_revision: u64, version: u64) -> KeyValue {
        KeyValue {
            key: "locks/x/1".to_string(),
            value: Bytes::new(),
            create_revision,
            mod_revision: create_revision,
            version,
            lease: 0,
        }
    }

    #[test]
    fn missing_key_compares_as_zero() {
        assert!(Compare::absent("a").holds(None));
        assert!(Compare::create_revision("a", 0).holds(None));
        assert!(!Compare::create_revision("a", 5).holds(None));
    }

    #[test]
    fn existing_key_compares_on_metadata() {
        let current = kv(5, 2);
        assert!(Compare::create_revision("a", 5).holds(Some(&current)));
        assert!(!Compare::absent("a").holds(Some(&current)));
    }

    #[test]
    fn builder_keeps_branch_order() {
        let req = TxnRequest::new()
            .when(Compare::absent("k"))
            .and_then(TxnOp::put("k", Bytes::from_static(b"v"), None))
            .or_else(TxnOp::get("k"));
        assert_eq!(req.compare.len(), 1);
        assert_eq!(req.success, vec![TxnOp::put("k", Bytes::from_static(b"v"), None)]);
        assert_eq!(req.failure, vec![TxnOp::get("k")]);
    }
}

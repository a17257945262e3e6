use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use kvstore_shared::store::{KeyValue, LeaseId, NO_LEASE};

/// A stored value with the revision it was last modified at and the lease it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub data: Bytes,
    pub mod_revision: u64,
    /// [`NO_LEASE`] when the key is not bound to a lease.
    pub lease_id: LeaseId,
}

impl From<KeyValue> for Value {
    fn from(kv: KeyValue) -> Self {
        Value {
            data: kv.value,
            mod_revision: kv.mod_revision,
            lease_id: kv.lease,
        }
    }
}

impl Value {
    /// Same value without lease information, as returned by reads made inside lock-qualified
    /// transactions.
    pub(crate) fn without_lease(kv: KeyValue) -> Self {
        Value {
            lease_id: NO_LEASE,
            ..Value::from(kv)
        }
    }
}

pub type KeyValuePairs = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Modify,
    Delete,
    /// Every event emitted before this one forms a coherent snapshot of the prefix.
    Synced,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Create => "create",
            EventType::Modify => "modify",
            EventType::Delete => "delete",
            EventType::Synced => "synced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueEvent {
    pub key: String,
    pub value: Bytes,
    pub typ: EventType,
}

impl KeyValueEvent {
    pub(crate) fn new(typ: EventType, key: impl Into<String>, value: Bytes) -> Self {
        KeyValueEvent {
            key: key.into(),
            value,
            typ,
        }
    }

    pub(crate) fn synced() -> Self {
        KeyValueEvent {
            key: String::new(),
            value: Bytes::new(),
            typ: EventType::Synced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Ok,
    Warning,
    Failure,
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusState::Ok => "Ok",
            StatusState::Warning => "Warning",
            StatusState::Failure => "Failure",
        };
        f.write_str(name)
    }
}

/// Connectivity snapshot, replaced as a whole by the status monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: StatusState,
    pub message: String,
}

impl ConnectionStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            state: StatusState::Ok,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            state: StatusState::Warning,
            message: message.into(),
        }
    }

    /// Failure messages are prefixed with `Err: `.
    pub fn failure(message: impl fmt::Display) -> Self {
        Self {
            state: StatusState::Failure,
            message: format!("Err: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_from_key_value() {
        let kv = KeyValue {
            key: "agents/state/n1".to_string(),
            value: Bytes::from_static(b"v"),
            create_revision: 3,
            mod_revision: 7,
            version: 2,
            lease: 0x7a01,
        };
        let value = Value::from(kv.clone());
        assert_eq!(value.mod_revision, 7);
        assert_eq!(value.lease_id, 0x7a01);
        assert_eq!(Value::without_lease(kv).lease_id, NO_LEASE);
    }

    #[test]
    fn failure_status_is_prefixed() {
        let status = ConnectionStatus::failure("quorum check failed 3 times in a row");
        assert_eq!(status.state, StatusState::Failure);
        assert_eq!(status.message, "Err: quorum check failed 3 times in a row");
    }
}

//! Revisioned key space with leases.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::time::Duration;

use bytes::Bytes;
use kvstore_shared::error::{Result, StoreError};
use kvstore_shared::store::{
    KeyValue, LeaseId, NO_LEASE, RangePage, RangeRequest, TxnOp, TxnOpResponse, TxnRequest,
    TxnResponse, WatchBatch, WatchEvent, WatchEventKind,
};
use tokio::time::Instant;

/// One applied change, with the value it replaced so older revisions can be reconstructed.
#[derive(Debug, Clone)]
pub(crate) struct HistoryEntry {
    pub(crate) event: WatchEvent,
    pub(crate) prev: Option<KeyValue>,
}

impl HistoryEntry {
    fn revision(&self) -> u64 {
        self.event.kv.mod_revision
    }
}

/// Keys from `start` onwards. `RangeFrom<&str>` is not a range over `str`.
fn keys_from(start: &str) -> (Bound<&str>, Bound<&str>) {
    (Bound::Included(start), Bound::Unbounded)
}

#[derive(Debug)]
struct LeaseState {
    ttl_secs: i64,
    expires_at: Instant,
    keys: BTreeSet<String>,
}

/// The whole store state, guarded by a single lock in [`super::SimpleKVStore`].
#[derive(Debug)]
pub struct KVState {
    data: BTreeMap<String, KeyValue>,
    revision: u64,
    /// History at or below this revision is gone.
    compact_revision: u64,
    history: VecDeque<HistoryEntry>,
    /// 0 keeps everything.
    max_history: usize,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease_id: LeaseId,
}

impl KVState {
    pub fn new(max_history: usize) -> Self {
        Self {
            data: BTreeMap::new(),
            revision: 0,
            compact_revision: 0,
            history: VecDeque::new(),
            max_history,
            leases: HashMap::new(),
            next_lease_id: 0x7a00,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn compact_revision(&self) -> u64 {
        self.compact_revision
    }

    pub fn get(&self, key: &str) -> Option<KeyValue> {
        self.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys_of_lease(&self, id: LeaseId) -> Vec<String> {
        self.leases
            .get(&id)
            .map(|lease| lease.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn range(&self, request: &RangeRequest) -> Result<RangePage> {
        let in_prefix = |key: &str| key.starts_with(&request.prefix);
        let start = request.start_key.as_str().max(request.prefix.as_str());

        let view: BTreeMap<String, KeyValue> = match request.revision {
            None => self
                .data
                .range::<str, _>(keys_from(start))
                .take_while(|(key, _)| in_prefix(key))
                .map(|(key, kv)| (key.clone(), kv.clone()))
                .collect(),
            Some(revision) => self.snapshot_at(revision, &request.prefix)?,
        };

        let mut matching = view.into_values().filter(|kv| kv.key.as_str() >= start);
        let kvs: Vec<KeyValue> = if request.limit == 0 {
            matching.by_ref().collect()
        } else {
            matching.by_ref().take(request.limit).collect()
        };
        let more = matching.next().is_some();

        Ok(RangePage {
            kvs,
            more,
            revision: self.revision,
        })
    }

    /// State of every key under `prefix` as of `revision`, rebuilt by undoing newer history.
    fn snapshot_at(&self, revision: u64, prefix: &str) -> Result<BTreeMap<String, KeyValue>> {
        if revision < self.compact_revision {
            return Err(StoreError::Compacted {
                compact_revision: self.compact_revision,
            });
        }
        if revision > self.revision {
            return Err(StoreError::Other(format!(
                "required revision {revision} is a future revision"
            )));
        }

        let mut view: BTreeMap<String, KeyValue> = self
            .data
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, kv)| (key.clone(), kv.clone()))
            .collect();

        for entry in self.history.iter().rev() {
            if entry.revision() <= revision {
                break;
            }
            let key = &entry.event.kv.key;
            if !key.starts_with(prefix) {
                continue;
            }
            match &entry.prev {
                Some(prev) => view.insert(key.clone(), prev.clone()),
                None => view.remove(key),
            };
        }
        Ok(view)
    }

    /// Applies `req` atomically and returns the response plus the batch to publish to watchers.
    pub fn txn(&mut self, req: TxnRequest) -> Result<(TxnResponse, Option<WatchBatch>)> {
        let succeeded = req
            .compare
            .iter()
            .all(|cmp| cmp.holds(self.data.get(cmp.key())));
        let ops = if succeeded { req.success } else { req.failure };

        for op in &ops {
            if let TxnOp::Put {
                lease: Some(id), ..
            } = op
                && *id != NO_LEASE
                && !self.leases.contains_key(id)
            {
                return Err(StoreError::LeaseNotFound);
            }
        }

        let rev = self.revision + 1;
        let mut entries = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                TxnOp::Get { key } => {
                    TxnOpResponse::Range(self.data.get(&key).cloned().into_iter().collect())
                }
                TxnOp::GetPrefix { prefix } => TxnOpResponse::Range(
                    self.data
                        .range::<str, _>(keys_from(&prefix))
                        .take_while(|(key, _)| key.starts_with(&prefix))
                        .map(|(_, kv)| kv.clone())
                        .collect(),
                ),
                TxnOp::Put { key, value, lease } => {
                    entries.push(self.put_at(rev, key, value, lease.unwrap_or(NO_LEASE)));
                    TxnOpResponse::Put
                }
                TxnOp::Delete { key } => {
                    let deleted = self.delete_at(rev, &key);
                    let count = u64::from(deleted.is_some());
                    entries.extend(deleted);
                    TxnOpResponse::Delete { deleted: count }
                }
            };
            responses.push(response);
        }

        let batch = self.commit(entries);
        Ok((
            TxnResponse {
                succeeded,
                responses,
                revision: self.revision,
            },
            batch,
        ))
    }

    pub fn put(&mut self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<WatchBatch> {
        let lease = lease.unwrap_or(NO_LEASE);
        if lease != NO_LEASE && !self.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound);
        }
        let entry = self.put_at(self.revision + 1, key.to_string(), value, lease);
        Ok(self.commit(vec![entry]).unwrap_or_default())
    }

    /// Deletes every key starting with `prefix`, or a single key when `prefix` is false.
    pub fn delete(&mut self, key: &str, prefix: bool) -> Option<WatchBatch> {
        let rev = self.revision + 1;
        let keys: Vec<String> = if prefix {
            self.data
                .range::<str, _>(keys_from(key))
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else {
            vec![key.to_string()]
        };
        let entries = keys
            .iter()
            .filter_map(|k| self.delete_at(rev, k))
            .collect();
        self.commit(entries)
    }

    pub fn lease_grant(&mut self, ttl_secs: i64, now: Instant) -> LeaseId {
        self.next_lease_id += 1;
        let id = self.next_lease_id;
        self.leases.insert(
            id,
            LeaseState {
                ttl_secs,
                expires_at: now + ttl(ttl_secs),
                keys: BTreeSet::new(),
            },
        );
        id
    }

    pub fn lease_keep_alive(&mut self, id: LeaseId, now: Instant) -> Result<i64> {
        let lease = self.leases.get_mut(&id).ok_or(StoreError::LeaseNotFound)?;
        lease.expires_at = now + ttl(lease.ttl_secs);
        Ok(lease.ttl_secs)
    }

    /// Removes the lease and deletes every key attached to it.
    pub fn lease_revoke(&mut self, id: LeaseId) -> Result<Option<WatchBatch>> {
        let lease = self.leases.remove(&id).ok_or(StoreError::LeaseNotFound)?;
        let rev = self.revision + 1;
        let entries = lease
            .keys
            .iter()
            .filter_map(|key| self.delete_at(rev, key))
            .collect();
        Ok(self.commit(entries))
    }

    /// Revokes every lease whose TTL has run out.
    pub fn expire_due_leases(&mut self, now: Instant) -> Vec<WatchBatch> {
        let mut due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|id| self.lease_revoke(id).ok().flatten())
            .collect()
    }

    /// Forgets history at or below `revision`.
    pub fn compact(&mut self, revision: u64) {
        let revision = revision.min(self.revision);
        while self
            .history
            .front()
            .is_some_and(|entry| entry.revision() <= revision)
        {
            self.history.pop_front();
        }
        self.compact_revision = self.compact_revision.max(revision);
    }

    /// Batches (one per revision) under `prefix` starting at `from`, inclusive.
    pub(crate) fn replay(&self, prefix: &str, from: u64) -> Result<Vec<WatchBatch>> {
        // 0 watches from the next revision on
        if from == 0 || from > self.revision {
            return Ok(Vec::new());
        }
        if from <= self.compact_revision {
            return Err(StoreError::Compacted {
                compact_revision: self.compact_revision,
            });
        }

        let mut batches: Vec<WatchBatch> = Vec::new();
        for entry in self.history.iter().filter(|e| e.revision() >= from) {
            if !entry.event.kv.key.starts_with(prefix) {
                continue;
            }
            match batches.last_mut() {
                Some(batch) if batch.revision == entry.revision() => {
                    batch.events.push(entry.event.clone())
                }
                _ => batches.push(WatchBatch {
                    events: vec![entry.event.clone()],
                    revision: entry.revision(),
                }),
            }
        }
        Ok(batches)
    }

    fn put_at(&mut self, rev: u64, key: String, value: Bytes, lease: LeaseId) -> HistoryEntry {
        let prev = self.data.get(&key).cloned();
        if let Some(old) = prev.as_ref().map(|kv| kv.lease)
            && old != lease
        {
            self.detach(old, &key);
        }
        if lease != NO_LEASE
            && let Some(state) = self.leases.get_mut(&lease)
        {
            state.keys.insert(key.clone());
        }

        let kv = KeyValue {
            key: key.clone(),
            value,
            create_revision: prev.as_ref().map_or(rev, |kv| kv.create_revision),
            mod_revision: rev,
            version: prev.as_ref().map_or(1, |kv| kv.version + 1),
            lease,
        };
        self.data.insert(key, kv.clone());
        HistoryEntry {
            event: WatchEvent {
                kind: WatchEventKind::Put,
                kv,
            },
            prev,
        }
    }

    fn delete_at(&mut self, rev: u64, key: &str) -> Option<HistoryEntry> {
        let prev = self.data.remove(key)?;
        self.detach(prev.lease, key);
        Some(HistoryEntry {
            event: WatchEvent {
                kind: WatchEventKind::Delete,
                kv: KeyValue {
                    key: key.to_string(),
                    value: Bytes::new(),
                    create_revision: 0,
                    mod_revision: rev,
                    version: 0,
                    lease: NO_LEASE,
                },
            },
            prev: Some(prev),
        })
    }

    fn detach(&mut self, lease: LeaseId, key: &str) {
        if let Some(state) = self.leases.get_mut(&lease) {
            state.keys.remove(key);
        }
    }

    /// Records the entries under a single new revision.
    fn commit(&mut self, entries: Vec<HistoryEntry>) -> Option<WatchBatch> {
        let revision = entries.first()?.revision();
        self.revision = revision;
        let batch = WatchBatch {
            events: entries.iter().map(|e| e.event.clone()).collect(),
            revision,
        };
        self.history.extend(entries);

        if self.max_history > 0 && self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            let cut = self.history.get(excess - 1).map(HistoryEntry::revision);
            if let Some(cut) = cut {
                self.compact(cut);
            }
        }
        Some(batch)
    }
}

fn ttl(secs: i64) -> Duration {
    Duration::from_secs(secs.max(0) as u64)
}

use std::collections::HashMap;

/// Keys known to one watcher, each with a deletion mark. Owned by the watcher task.
#[derive(Debug, Default)]
pub(crate) struct WatcherCache {
    /// key -> pending deletion
    keys: HashMap<String, bool>,
}

impl WatcherCache {
    pub(crate) fn exists(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// The key was confirmed by the store.
    pub(crate) fn mark_in_use(&mut self, key: &str) {
        match self.keys.get_mut(key) {
            Some(pending) => *pending = false,
            None => {
                self.keys.insert(key.to_string(), false);
            }
        }
    }

    /// Every key has to be confirmed again by the next list.
    pub(crate) fn mark_all_for_deletion(&mut self) {
        self.keys.values_mut().for_each(|pending| *pending = true);
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.keys.remove(key).is_some()
    }

    /// Evicts the keys still marked for deletion, in key order.
    pub(crate) fn remove_deleted(&mut self) -> Vec<String> {
        let mut deleted: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, pending)| **pending)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &deleted {
            self.keys.remove(key);
        }
        deleted.sort_unstable();
        deleted
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

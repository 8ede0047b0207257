//! In-process backend (good for dev/testing).

use super::{MemoryBackend, MemoryEntry, MemoryQuery};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

/// owner -> key -> entry
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<BTreeMap<String, BTreeMap<String, MemoryEntry>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn store(&self, entry: MemoryEntry) -> bool {
        debug!("Storing {}:{} in memory", entry.owner, entry.key);
        self.entries
            .write()
            .entry(entry.owner.clone())
            .or_default()
            .insert(entry.key.clone(), entry);
        true
    }

    async fn retrieve(&self, key: &str, owner: Option<&str>) -> Option<MemoryEntry> {
        let entries = self.entries.read();
        match owner {
            Some(owner) => entries.get(owner).and_then(|m| m.get(key)).cloned(),
            None => entries.values().find_map(|m| m.get(key)).cloned(),
        }
    }

    async fn search(&self, query: &MemoryQuery) -> Vec<MemoryEntry> {
        self.entries
            .read()
            .values()
            .flat_map(BTreeMap::values)
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    async fn delete(&self, key: &str, owner: Option<&str>) -> bool {
        let mut entries = self.entries.write();
        match owner {
            Some(owner) => entries
                .get_mut(owner)
                .map(|m| m.remove(key).is_some())
                .unwrap_or(false),
            None => entries
                .values_mut()
                .fold(false, |deleted, m| m.remove(key).is_some() || deleted),
        }
    }
}

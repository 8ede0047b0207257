//! Embedded key-value backend on sled. Each entry lives under its own
//! `owner \0 key` record, so writes are atomic per key and concurrent
//! writers to one owner never clobber each other's keys.

use super::{MemoryBackend, MemoryEntry, MemoryQuery, PersistedEntry};
use crate::error::{MemoryError, MemoryResult};
use async_trait::async_trait;
use std::path::Path;
use tracing::{error, info};

const SEPARATOR: u8 = 0;

#[derive(Debug, Clone)]
pub struct SledMemoryBackend {
    db: sled::Db,
}

impl SledMemoryBackend {
    pub fn open(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!("Memory database opened at {:?}", path);
        Ok(Self { db })
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> MemoryResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn record_key(owner: &str, key: &str) -> MemoryResult<Vec<u8>> {
        if owner.is_empty() || owner.as_bytes().contains(&SEPARATOR) {
            return Err(MemoryError::InvalidOwner(owner.to_string()));
        }
        let mut raw = Vec::with_capacity(owner.len() + key.len() + 1);
        raw.extend_from_slice(owner.as_bytes());
        raw.push(SEPARATOR);
        raw.extend_from_slice(key.as_bytes());
        Ok(raw)
    }

    fn owner_prefix(owner: &str) -> Vec<u8> {
        let mut raw = owner.as_bytes().to_vec();
        raw.push(SEPARATOR);
        raw
    }

    fn decode(raw_key: &[u8], raw_value: &[u8]) -> MemoryResult<MemoryEntry> {
        let split = raw_key
            .iter()
            .position(|b| *b == SEPARATOR)
            .ok_or_else(|| MemoryError::InvalidOwner(String::from_utf8_lossy(raw_key).into()))?;
        let owner = String::from_utf8_lossy(&raw_key[..split]);
        let key = String::from_utf8_lossy(&raw_key[split + 1..]);
        let persisted: PersistedEntry = serde_json::from_slice(raw_value)?;
        Ok(persisted.into_entry(&owner, &key))
    }

    fn scan(&self, owner: Option<&str>) -> Vec<MemoryEntry> {
        let iter = match owner {
            Some(owner) => self.db.scan_prefix(Self::owner_prefix(owner)),
            None => self.db.iter(),
        };
        let mut entries = Vec::new();
        for item in iter {
            match item
                .map_err(MemoryError::from)
                .and_then(|(k, v)| Self::decode(&k, &v))
            {
                Ok(entry) => entries.push(entry),
                Err(e) => error!("Skipping unreadable memory record: {}", e),
            }
        }
        entries
    }

    async fn put(&self, entry: &MemoryEntry) -> MemoryResult<()> {
        let key = Self::record_key(&entry.owner, &entry.key)?;
        let value = serde_json::to_vec(&PersistedEntry::from_entry(entry))?;
        self.db.insert(key, value)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn remove(&self, owner: &str, key: &str) -> MemoryResult<bool> {
        let removed = self.db.remove(Self::record_key(owner, key)?)?.is_some();
        if removed {
            self.db.flush_async().await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl MemoryBackend for SledMemoryBackend {
    async fn store(&self, entry: MemoryEntry) -> bool {
        match self.put(&entry).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save memory for {}: {}", entry.owner, e);
                false
            }
        }
    }

    async fn retrieve(&self, key: &str, owner: Option<&str>) -> Option<MemoryEntry> {
        match owner {
            Some(owner) => {
                let raw_key = Self::record_key(owner, key).ok()?;
                match self.db.get(&raw_key) {
                    Ok(Some(raw)) => Self::decode(&raw_key, &raw)
                        .map_err(|e| error!("Unreadable memory {}:{}: {}", owner, key, e))
                        .ok(),
                    Ok(None) => None,
                    Err(e) => {
                        error!("Failed to read memory {}:{}: {}", owner, key, e);
                        None
                    }
                }
            }
            None => self.scan(None).into_iter().find(|e| e.key == key),
        }
    }

    async fn search(&self, query: &MemoryQuery) -> Vec<MemoryEntry> {
        self.scan(query.owner.as_deref())
            .into_iter()
            .filter(|e| query.matches(e))
            .collect()
    }

    async fn delete(&self, key: &str, owner: Option<&str>) -> bool {
        let owners: Vec<String> = match owner {
            Some(owner) => vec![owner.to_string()],
            None => self
                .scan(None)
                .into_iter()
                .filter(|e| e.key == key)
                .map(|e| e.owner)
                .collect(),
        };

        let mut deleted = false;
        for owner in owners {
            match self.remove(&owner, key).await {
                Ok(hit) => deleted |= hit,
                Err(e) => error!("Failed to delete {}:{}: {}", owner, key, e),
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StoreOptions;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn owner_prefix_does_not_leak_into_other_owners() {
        let backend = SledMemoryBackend::temporary().unwrap();
        backend.store(MemoryEntry::new("ab", "k", json!(1))).await;
        backend.store(MemoryEntry::new("a", "k", json!(2))).await;

        let only_a = backend.search(&MemoryQuery::all().owner("a")).await;
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].value, json!(2));
    }

    #[tokio::test]
    async fn reopened_database_keeps_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let backend = SledMemoryBackend::open(&path).unwrap();
            let entry = MemoryEntry::new("a", "k", json!({"x": 1}))
                .with_options(StoreOptions::default().with_type("note").with_tags(["t"]));
            assert!(backend.store(entry).await);
        }
        let backend = SledMemoryBackend::open(&path).unwrap();
        let entry = backend.retrieve("k", Some("a")).await.unwrap();
        assert_eq!(entry.memory_type, "note");
        assert_eq!(entry.tags, vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn delete_across_owners() {
        let backend = SledMemoryBackend::temporary().unwrap();
        backend.store(MemoryEntry::new("a", "k", json!(1))).await;
        backend.store(MemoryEntry::new("b", "k", json!(2))).await;

        assert_eq!(backend.retrieve("k", None).await.unwrap().owner, "a");
        assert!(backend.delete("k", None).await);
        assert!(backend.retrieve("k", None).await.is_none());
        assert!(!backend.delete("k", Some("a")).await);
    }
}

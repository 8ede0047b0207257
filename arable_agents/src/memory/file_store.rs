//! Reference backend: one JSON document per owner, `<owner>_memory.json`.
//!
//! Every mutating call reads the owner's whole document, modifies it and
//! rewrites it through a temp file + rename. Writers to the same owner are
//! serialized by a per-owner async lock, so concurrent stores within one
//! process do not lose updates. Separate processes sharing a directory
//! are not coordinated.

use super::{MemoryBackend, MemoryEntry, MemoryQuery, PersistedEntry};
use crate::error::{MemoryError, MemoryResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

const FILE_SUFFIX: &str = "_memory.json";

type OwnerDocument = BTreeMap<String, PersistedEntry>;

#[derive(Debug)]
pub struct FileMemoryBackend {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileMemoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> MemoryResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_file(&self, owner: &str) -> MemoryResult<PathBuf> {
        let invalid = owner.is_empty()
            || owner == "."
            || owner == ".."
            || owner.contains(['/', '\\', '\0']);
        if invalid {
            return Err(MemoryError::InvalidOwner(owner.to_string()));
        }
        Ok(self.root.join(format!("{}{}", owner, FILE_SUFFIX)))
    }

    fn owner_lock(&self, owner: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn owners(&self) -> MemoryResult<Vec<String>> {
        let mut owners = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(owner) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(FILE_SUFFIX))
            {
                owners.push(owner.to_string());
            }
        }
        owners.sort();
        Ok(owners)
    }

    /// A missing document loads as empty. Unreadable or corrupt documents
    /// are errors so callers never rewrite an owner from a partial view.
    async fn load(&self, owner: &str) -> MemoryResult<OwnerDocument> {
        let path = self.owner_file(owner)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(OwnerDocument::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load for read-only paths: a bad document is logged and skipped.
    async fn load_or_skip(&self, owner: &str) -> OwnerDocument {
        match self.load(owner).await {
            Ok(doc) => doc,
            Err(e) => {
                error!("Failed to load memory for {}: {}", owner, e);
                OwnerDocument::new()
            }
        }
    }

    async fn save(&self, owner: &str, doc: &OwnerDocument) -> MemoryResult<()> {
        let path = self.owner_file(owner)?;
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete_for_owner(&self, key: &str, owner: &str) -> MemoryResult<bool> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;
        let mut doc = self.load(owner).await?;
        if doc.remove(key).is_none() {
            return Ok(false);
        }
        self.save(owner, &doc).await?;
        Ok(true)
    }
}

#[async_trait]
impl MemoryBackend for FileMemoryBackend {
    #[instrument(skip(self, entry), fields(owner = %entry.owner, key = %entry.key))]
    async fn store(&self, entry: MemoryEntry) -> bool {
        if let Err(e) = self.owner_file(&entry.owner) {
            error!("Failed to save memory for {}: {}", entry.owner, e);
            return false;
        }
        let lock = self.owner_lock(&entry.owner);
        let _guard = lock.lock().await;

        let mut doc = match self.load(&entry.owner).await {
            Ok(doc) => doc,
            Err(e) => {
                error!("Failed to load memory for {}: {}", entry.owner, e);
                return false;
            }
        };
        doc.insert(entry.key.clone(), PersistedEntry::from_entry(&entry));
        match self.save(&entry.owner, &doc).await {
            Ok(()) => {
                debug!("Saved memory document for {}", entry.owner);
                true
            }
            Err(e) => {
                error!("Failed to save memory for {}: {}", entry.owner, e);
                false
            }
        }
    }

    async fn retrieve(&self, key: &str, owner: Option<&str>) -> Option<MemoryEntry> {
        let owners = match owner {
            Some(owner) => vec![owner.to_string()],
            None => match self.owners().await {
                Ok(owners) => owners,
                Err(e) => {
                    error!("Failed to list memory owners: {}", e);
                    return None;
                }
            },
        };
        for owner in owners {
            if let Some(persisted) = self.load_or_skip(&owner).await.remove(key) {
                return Some(persisted.into_entry(&owner, key));
            }
        }
        None
    }

    async fn search(&self, query: &MemoryQuery) -> Vec<MemoryEntry> {
        let owners = match &query.owner {
            Some(owner) => vec![owner.clone()],
            None => match self.owners().await {
                Ok(owners) => owners,
                Err(e) => {
                    error!("Failed to list memory owners: {}", e);
                    return Vec::new();
                }
            },
        };

        let mut results = Vec::new();
        for owner in owners {
            for (key, persisted) in self.load_or_skip(&owner).await {
                let entry = persisted.into_entry(&owner, &key);
                if query.matches(&entry) {
                    results.push(entry);
                }
            }
        }
        results
    }

    async fn delete(&self, key: &str, owner: Option<&str>) -> bool {
        let owners = match owner {
            Some(owner) => vec![owner.to_string()],
            None => match self.owners().await {
                Ok(owners) => owners,
                Err(e) => {
                    error!("Failed to list memory owners: {}", e);
                    return false;
                }
            },
        };

        let mut deleted = false;
        for owner in owners {
            match self.delete_for_owner(key, &owner).await {
                Ok(hit) => deleted |= hit,
                Err(e) => error!("Failed to delete {}:{}: {}", owner, key, e),
            }
        }
        deleted
    }
}

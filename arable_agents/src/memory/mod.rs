//! Cross-agent memory: tagged, timestamped entries scoped by owner, a
//! pluggable [`MemoryBackend`], and the [`MemoryManager`] used by agents and
//! the orchestrator.
//!
//! TTL is recorded on every entry but never enforced;
//! [`MemoryManager::cleanup_expired_memory`] is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod file_store;
pub mod in_memory;
pub mod sled_store;

pub use file_store::FileMemoryBackend;
pub use in_memory::InMemoryBackend;
pub use sled_store::SledMemoryBackend;

pub const GENERAL_MEMORY: &str = "general";
pub const SHARED_MEMORY: &str = "shared";
pub const WORKFLOW_RESULT_MEMORY: &str = "workflow_result";

pub const WORKFLOW_TAG: &str = "workflow";
pub const TASK_RESULT_TAG: &str = "task_result";
pub const SHARED_TAG: &str = "shared";

/// One stored record, identified by `(owner, key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    pub owner: String,
    pub timestamp: DateTime<Utc>,
    pub memory_type: String,
    pub ttl_seconds: Option<u64>,
    pub tags: Vec<String>,
}

impl MemoryEntry {
    pub fn new(owner: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            owner: owner.into(),
            timestamp: Utc::now(),
            memory_type: GENERAL_MEMORY.to_string(),
            ttl_seconds: None,
            tags: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.memory_type = options.memory_type;
        self.ttl_seconds = options.ttl_seconds;
        self.tags = options.tags;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// On-disk shape of an entry. The key and owner live outside the document
/// (map key / file or key prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub value: Value,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "memoryType", alias = "memory_type", default = "default_memory_type")]
    pub memory_type: String,
    #[serde(rename = "ttlSeconds", alias = "ttl", default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PersistedEntry {
    pub fn from_entry(entry: &MemoryEntry) -> Self {
        Self {
            value: entry.value.clone(),
            timestamp: entry.timestamp,
            memory_type: entry.memory_type.clone(),
            ttl_seconds: entry.ttl_seconds,
            tags: entry.tags.clone(),
        }
    }

    pub fn into_entry(self, owner: &str, key: &str) -> MemoryEntry {
        MemoryEntry {
            key: key.to_string(),
            value: self.value,
            owner: owner.to_string(),
            timestamp: self.timestamp,
            memory_type: self.memory_type,
            ttl_seconds: self.ttl_seconds,
            tags: self.tags,
        }
    }
}

fn default_memory_type() -> String {
    GENERAL_MEMORY.to_string()
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Search filter. All present filters are ANDed; the tag filter matches
/// on any overlap. An empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryQuery {
    pub owner: Option<String>,
    pub memory_type: Option<String>,
    pub tags: Vec<String>,
}

impl MemoryQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = Some(memory_type.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(owner) = &self.owner {
            if &entry.owner != owner {
                return false;
            }
        }
        if let Some(memory_type) = &self.memory_type {
            if &entry.memory_type != memory_type {
                return false;
            }
        }
        self.tags.is_empty() || self.tags.iter().any(|t| entry.has_tag(t))
    }
}

/// Pluggable persistence for memory entries.
///
/// `store` and `delete` report I/O failure as `false`; they never panic or
/// raise for ordinary failures. Omitting the owner on `retrieve` returns
/// the first match across owners; on `delete` it removes the key from
/// every owner.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> bool;

    async fn retrieve(&self, key: &str, owner: Option<&str>) -> Option<MemoryEntry>;

    async fn search(&self, query: &MemoryQuery) -> Vec<MemoryEntry>;

    async fn delete(&self, key: &str, owner: Option<&str>) -> bool;
}

/// Optional attributes for [`MemoryManager::store_agent_memory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub memory_type: String,
    pub ttl_seconds: Option<u64>,
    pub tags: Vec<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            memory_type: GENERAL_MEMORY.to_string(),
            ttl_seconds: None,
            tags: Vec::new(),
        }
    }
}

impl StoreOptions {
    pub fn with_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = memory_type.into();
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Aggregate counts over every stored entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_entries: usize,
    pub agents_with_memory: usize,
    pub memory_types: BTreeMap<String, usize>,
    pub memory_by_agent: BTreeMap<String, usize>,
}

/// Key under which a workflow task's result is stored for its agent.
pub fn workflow_result_key(task_id: &str) -> String {
    format!("workflow_result_{}", task_id)
}

/// High-level memory API over a backend.
#[derive(Clone)]
pub struct MemoryManager {
    backend: Arc<dyn MemoryBackend>,
}

impl MemoryManager {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self { backend }
    }

    /// Manager over a fresh [`InMemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub async fn store_agent_memory(
        &self,
        agent_id: &str,
        key: &str,
        value: Value,
        options: StoreOptions,
    ) -> bool {
        let entry = MemoryEntry::new(agent_id, key, value).with_options(options);
        let stored = self.backend.store(entry).await;
        if stored {
            debug!("Stored memory for {}: {}", agent_id, key);
        } else {
            error!("Failed to store memory for {}: {}", agent_id, key);
        }
        stored
    }

    pub async fn get_agent_memory(&self, agent_id: &str, key: &str) -> Option<Value> {
        self.backend
            .retrieve(key, Some(agent_id))
            .await
            .map(|entry| entry.value)
    }

    pub async fn delete_agent_memory(&self, agent_id: &str, key: &str) -> bool {
        self.backend.delete(key, Some(agent_id)).await
    }

    /// Copy `from_agent:key` into a new entry owned by `to_agent`, tagged
    /// `shared` and `shared_from:<from_agent>`. The source is untouched.
    pub async fn share_memory(
        &self,
        from_agent: &str,
        to_agent: &str,
        key: &str,
        new_key: Option<&str>,
    ) -> bool {
        let Some(source) = self.backend.retrieve(key, Some(from_agent)).await else {
            warn!("No memory found for {}:{}", from_agent, key);
            return false;
        };

        let target_key = new_key.unwrap_or(key);
        let shared = MemoryEntry::new(to_agent, target_key, source.value).with_options(
            StoreOptions::default()
                .with_type(SHARED_MEMORY)
                .with_tags([SHARED_TAG.to_string(), format!("shared_from:{}", from_agent)]),
        );

        let stored = self.backend.store(shared).await;
        if stored {
            info!(
                "Shared memory {}:{} -> {}:{}",
                from_agent, key, to_agent, target_key
            );
        } else {
            error!(
                "Failed to share memory {}:{} -> {}:{}",
                from_agent, key, to_agent, target_key
            );
        }
        stored
    }

    /// Every entry tagged both `workflow` and `workflow_id`, flattened to
    /// `owner:key -> value`.
    pub async fn get_workflow_memory(&self, workflow_id: &str) -> BTreeMap<String, Value> {
        self.backend
            .search(&MemoryQuery::all().tags([workflow_id]))
            .await
            .into_iter()
            .filter(|entry| entry.has_tag(WORKFLOW_TAG))
            .map(|entry| (format!("{}:{}", entry.owner, entry.key), entry.value))
            .collect()
    }

    pub async fn store_workflow_result(
        &self,
        workflow_id: &str,
        agent_id: &str,
        task_id: &str,
        result: Value,
    ) -> bool {
        self.store_agent_memory(
            agent_id,
            &workflow_result_key(task_id),
            result,
            StoreOptions::default()
                .with_type(WORKFLOW_RESULT_MEMORY)
                .with_tags([WORKFLOW_TAG, workflow_id, TASK_RESULT_TAG]),
        )
        .await
    }

    /// TTL expiry is not enforced; always returns 0.
    pub async fn cleanup_expired_memory(&self) -> usize {
        debug!("TTL expiry is not enforced; nothing cleaned up");
        0
    }

    pub async fn get_memory_stats(&self) -> MemoryStats {
        let entries = self.backend.search(&MemoryQuery::all()).await;
        let mut stats = MemoryStats {
            total_entries: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            *stats.memory_types.entry(entry.memory_type).or_insert(0) += 1;
            *stats.memory_by_agent.entry(entry.owner).or_insert(0) += 1;
        }
        stats.agents_with_memory = stats.memory_by_agent.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn store_then_get_round_trips_value() {
        let memory = MemoryManager::in_memory();
        let value = json!({"nested": [1, 2, {"x": null}]});
        assert!(
            memory
                .store_agent_memory("a", "k", value.clone(), StoreOptions::default())
                .await
        );
        assert_eq!(memory.get_agent_memory("a", "k").await, Some(value));
        assert_eq!(memory.get_agent_memory("b", "k").await, None);
    }

    #[tokio::test]
    async fn later_store_overwrites_in_place() {
        let memory = MemoryManager::in_memory();
        memory
            .store_agent_memory("a", "k", json!(1), StoreOptions::default())
            .await;
        memory
            .store_agent_memory("a", "k", json!(2), StoreOptions::default())
            .await;
        assert_eq!(memory.get_agent_memory("a", "k").await, Some(json!(2)));
        assert_eq!(memory.get_memory_stats().await.total_entries, 1);
    }

    #[tokio::test]
    async fn share_copies_and_leaves_source() {
        let memory = MemoryManager::in_memory();
        memory
            .store_agent_memory(
                "a",
                "doc",
                json!("payload"),
                StoreOptions::default().with_tags(["mine"]),
            )
            .await;

        assert!(memory.share_memory("a", "b", "doc", Some("inbox")).await);

        let shared = memory
            .backend()
            .retrieve("inbox", Some("b"))
            .await
            .unwrap();
        assert_eq!(shared.value, json!("payload"));
        assert_eq!(shared.memory_type, SHARED_MEMORY);
        assert!(shared.has_tag(SHARED_TAG));
        assert!(shared.has_tag("shared_from:a"));

        let source = memory.backend().retrieve("doc", Some("a")).await.unwrap();
        assert_eq!(source.tags, vec!["mine".to_string()]);
        assert_eq!(source.memory_type, GENERAL_MEMORY);
    }

    #[tokio::test]
    async fn share_without_source_fails() {
        let memory = MemoryManager::in_memory();
        assert!(!memory.share_memory("a", "b", "missing", None).await);
        assert_eq!(memory.get_memory_stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn workflow_memory_is_scoped_to_workflow() {
        let memory = MemoryManager::in_memory();
        memory
            .store_workflow_result("w1", "extractor", "t1", json!({"n": 1}))
            .await;
        memory
            .store_workflow_result("w2", "extractor", "t2", json!({"n": 2}))
            .await;
        memory
            .store_agent_memory(
                "other",
                "note",
                json!("tagged w1 only"),
                StoreOptions::default().with_tags(["w1"]),
            )
            .await;

        let w1 = memory.get_workflow_memory("w1").await;
        assert_eq!(w1.len(), 1);
        assert_eq!(w1["extractor:workflow_result_t1"], json!({"n": 1}));
    }

    #[tokio::test]
    async fn stats_count_by_type_and_owner() {
        let memory = MemoryManager::in_memory();
        memory
            .store_agent_memory("a", "k1", json!(1), StoreOptions::default())
            .await;
        memory
            .store_agent_memory("a", "k2", json!(2), StoreOptions::default().with_ttl(60))
            .await;
        memory.store_workflow_result("w", "b", "t", json!(3)).await;

        let stats = memory.get_memory_stats().await;
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.agents_with_memory, 2);
        assert_eq!(stats.memory_types[GENERAL_MEMORY], 2);
        assert_eq!(stats.memory_types[WORKFLOW_RESULT_MEMORY], 1);
        assert_eq!(stats.memory_by_agent["a"], 2);
        assert_eq!(memory.cleanup_expired_memory().await, 0);
    }

    #[test]
    fn query_filters_are_anded_and_tags_overlap() {
        let entry = MemoryEntry::new("a", "k", json!(1)).with_options(
            StoreOptions::default()
                .with_type("note")
                .with_tags(["x", "y"]),
        );
        assert!(MemoryQuery::all().matches(&entry));
        assert!(MemoryQuery::all().tags(["y", "z"]).matches(&entry));
        assert!(!MemoryQuery::all().tags(["z"]).matches(&entry));
        assert!(MemoryQuery::all().owner("a").memory_type("note").matches(&entry));
        assert!(!MemoryQuery::all().owner("a").memory_type("general").matches(&entry));
    }

    #[test]
    fn persisted_entry_reads_legacy_field_names() {
        let raw = json!({
            "value": {"ok": true},
            "timestamp": "2025-05-29T12:00:00.123456",
            "memory_type": "workflow_result",
            "ttl": 30,
            "tags": ["workflow"]
        });
        let persisted: PersistedEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(persisted.memory_type, "workflow_result");
        assert_eq!(persisted.ttl_seconds, Some(30));

        let written = serde_json::to_value(&persisted).unwrap();
        assert!(written.get("memoryType").is_some());
        assert!(written.get("ttlSeconds").is_some());
    }
}

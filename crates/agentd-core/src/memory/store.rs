//! Memory storage over the per-user `memories.json`
//!
//! Entries are stored newest-first; that order is authoritative and query
//! results preserve it. Only `timeline` re-sorts (oldest first).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::{load_json, save_json, PathLocks, UserPaths};

use super::types::{default_visibility, Memory, MemoryCategory, SourceType, Visibility};

/// On-disk document for one user's memories
#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    memories: Vec<Memory>,
    #[serde(default)]
    total_created: u64,
    #[serde(default)]
    total_deleted: u64,
}

/// Parameters for saving a new memory
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub category: MemoryCategory,
    /// Defaults to the category's fixed visibility when unset
    pub visibility: Option<Visibility>,
    pub source_type: SourceType,
    pub confidence: f64,
    pub tags: Vec<String>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>, category: MemoryCategory) -> Self {
        Self {
            content: content.into(),
            category,
            visibility: None,
            source_type: SourceType::Inferred,
            confidence: 0.8,
            tags: Vec::new(),
        }
    }

    pub fn explicit(mut self) -> Self {
        self.source_type = SourceType::Explicit;
        self.confidence = 1.0;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Search filters; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub category: Option<MemoryCategory>,
    pub include_superseded: bool,
    pub limit: usize,
}

/// Counts by category and visibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: usize,
    pub active: usize,
    pub by_category: HashMap<String, usize>,
    pub by_visibility: HashMap<String, usize>,
}

/// Store of structured user facts
pub struct MemoryStore {
    paths: UserPaths,
    locks: Arc<PathLocks>,
}

impl MemoryStore {
    pub fn new(paths: UserPaths, locks: Arc<PathLocks>) -> Self {
        Self { paths, locks }
    }

    /// Save a new memory. Saving content identical to an active memory
    /// returns the existing entry instead of duplicating it.
    pub async fn save(&self, user_id: i64, new: NewMemory) -> Result<Memory> {
        validate_confidence(new.confidence)?;
        let path = self.paths.memories_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut file: MemoryFile = load_json(&path)?.unwrap_or_default();

        if let Some(existing) = file
            .memories
            .iter()
            .find(|m| m.is_active() && m.content.eq_ignore_ascii_case(&new.content))
        {
            debug!(user_id, id = %existing.id, "duplicate memory content, keeping existing");
            return Ok(existing.clone());
        }

        let memory = build_memory(&new, None);
        file.memories.insert(0, memory.clone());
        file.total_created += 1;
        save_json(&path, &file)?;

        info!(user_id, id = %memory.id, category = memory.category.as_str(), "saved memory");
        Ok(memory)
    }

    /// Save a new memory that supersedes an existing one. The predecessor
    /// gets `superseded_by_id` and `valid_until` set in the same write. A
    /// missing predecessor degrades to a plain save.
    pub async fn save_with_supersede(
        &self,
        user_id: i64,
        new: NewMemory,
        supersedes_id: &str,
    ) -> Result<Memory> {
        validate_confidence(new.confidence)?;
        let path = self.paths.memories_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut file: MemoryFile = load_json(&path)?.unwrap_or_default();

        let Some(old_index) = file.memories.iter().position(|m| m.id == supersedes_id) else {
            drop(_guard);
            debug!(user_id, supersedes_id, "supersede target missing, saving as new");
            return self.save(user_id, new).await;
        };

        // The supersede relation is a forest: a memory that already has a
        // successor cannot take another one
        if !file.memories[old_index].is_active() {
            return Err(Error::Validation(format!(
                "memory {} is already superseded",
                supersedes_id
            )));
        }

        // New memory inherits visibility and tags from its predecessor
        // unless explicitly set
        let mut new = new;
        if new.visibility.is_none() {
            new.visibility = Some(file.memories[old_index].visibility);
        }
        if new.tags.is_empty() {
            new.tags = file.memories[old_index].tags.clone();
        }

        let memory = build_memory(&new, Some(supersedes_id.to_string()));

        let old = &mut file.memories[old_index];
        old.superseded_by_id = Some(memory.id.clone());
        old.valid_until = Some(Utc::now().date_naive());

        file.memories.insert(0, memory.clone());
        file.total_created += 1;
        save_json(&path, &file)?;

        info!(user_id, old = supersedes_id, new = %memory.id, "memory superseded");
        Ok(memory)
    }

    /// Search memories; results keep storage order (newest first).
    /// Superseded entries are excluded unless requested.
    pub async fn search(&self, user_id: i64, query: SearchQuery) -> Result<Vec<Memory>> {
        let file = self.load(user_id).await?;
        let limit = if query.limit == 0 { 10 } else { query.limit };
        let needle = query.query.as_deref().map(str::to_lowercase);

        let mut results = Vec::new();
        for memory in &file.memories {
            if !query.include_superseded && !memory.is_active() {
                continue;
            }
            if let Some(category) = query.category {
                if memory.category != category {
                    continue;
                }
            }
            if let Some(needle) = &needle {
                let in_content = memory.content.to_lowercase().contains(needle);
                let in_tags = memory
                    .tags
                    .iter()
                    .any(|t| t.to_lowercase().contains(needle));
                if !in_content && !in_tags {
                    continue;
                }
            }
            results.push(memory.clone());
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Full history of a category including superseded entries, oldest first
    pub async fn timeline(&self, user_id: i64, category: MemoryCategory) -> Result<Vec<Memory>> {
        let file = self.load(user_id).await?;
        let mut memories: Vec<Memory> = file
            .memories
            .iter()
            .filter(|m| m.category == category)
            .cloned()
            .collect();
        memories.sort_by_key(|m| m.created_at);
        Ok(memories)
    }

    /// Update fields of an existing memory
    pub async fn update(
        &self,
        user_id: i64,
        memory_id: &str,
        content: Option<String>,
        visibility: Option<Visibility>,
        user_confirmed: Option<bool>,
    ) -> Result<Memory> {
        let path = self.paths.memories_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut file: MemoryFile = load_json(&path)?.unwrap_or_default();
        let memory = file
            .memories
            .iter_mut()
            .find(|m| m.id == memory_id)
            .ok_or_else(|| Error::Validation(format!("memory not found: {}", memory_id)))?;

        if let Some(content) = content {
            memory.content = content;
        }
        if let Some(visibility) = visibility {
            memory.visibility = visibility;
        }
        if let Some(confirmed) = user_confirmed {
            memory.user_confirmed = confirmed;
        }
        let updated = memory.clone();
        save_json(&path, &file)?;
        Ok(updated)
    }

    /// Delete a memory by id
    pub async fn delete(&self, user_id: i64, memory_id: &str) -> Result<()> {
        let path = self.paths.memories_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut file: MemoryFile = load_json(&path)?.unwrap_or_default();
        let before = file.memories.len();
        file.memories.retain(|m| m.id != memory_id);
        if file.memories.len() == before {
            return Err(Error::Validation(format!("memory not found: {}", memory_id)));
        }
        file.total_deleted += 1;
        save_json(&path, &file)?;
        Ok(())
    }

    /// Counts by category and visibility
    pub async fn stats(&self, user_id: i64) -> Result<MemoryStats> {
        let file = self.load(user_id).await?;
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut by_visibility: HashMap<String, usize> = HashMap::new();
        let mut active = 0;

        for memory in &file.memories {
            *by_category
                .entry(memory.category.as_str().to_string())
                .or_default() += 1;
            let vis = match memory.visibility {
                Visibility::Public => "public",
                Visibility::Private => "private",
            };
            *by_visibility.entry(vis.to_string()).or_default() += 1;
            if memory.is_active() {
                active += 1;
            }
        }

        Ok(MemoryStats {
            total: file.memories.len(),
            active,
            by_category,
            by_visibility,
        })
    }

    async fn load(&self, user_id: i64) -> Result<MemoryFile> {
        let path = self.paths.memories_file(user_id);
        let _guard = self.locks.lock(&path).await;
        Ok(load_json(&path)?.unwrap_or_default())
    }
}

fn build_memory(new: &NewMemory, supersedes_id: Option<String>) -> Memory {
    let now = Utc::now();
    Memory {
        id: generate_id(),
        content: new.content.clone(),
        category: new.category,
        visibility: new
            .visibility
            .unwrap_or_else(|| default_visibility(new.category)),
        source_type: new.source_type,
        confidence: new.confidence,
        user_confirmed: false,
        tags: new.tags.clone(),
        created_at: now,
        valid_from: now.date_naive(),
        valid_until: None,
        supersedes_id,
        superseded_by_id: None,
    }
}

fn generate_id() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    format!("mem_{}_{}", date, suffix)
}

fn validate_confidence(confidence: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(Error::Validation(format!(
            "confidence must be within 0.0..=1.0, got {}",
            confidence
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &std::path::Path) -> MemoryStore {
        MemoryStore::new(UserPaths::new(root), Arc::new(PathLocks::new()))
    }

    #[tokio::test]
    async fn test_save_reload_search_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let memory = store(dir.path())
            .save(1, NewMemory::new("Works at Acme", MemoryCategory::Career))
            .await
            .unwrap();

        // Fresh store instance forces a reload from disk
        let results = store(dir.path())
            .search(
                1,
                SearchQuery {
                    query: Some("acme".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, memory.id);
        assert_eq!(results[0].visibility, Visibility::Public);
    }

    #[tokio::test]
    async fn test_duplicate_content_returns_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let first = store
            .save(1, NewMemory::new("Likes tea", MemoryCategory::Preferences))
            .await
            .unwrap();
        let second = store
            .save(1, NewMemory::new("likes tea", MemoryCategory::Preferences))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_supersede_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let old = store
            .save(1, NewMemory::new("Lives in Osaka", MemoryCategory::Personal))
            .await
            .unwrap();
        let new = store
            .save_with_supersede(
                1,
                NewMemory::new("Lives in Tokyo", MemoryCategory::Personal),
                &old.id,
            )
            .await
            .unwrap();

        assert_eq!(new.supersedes_id.as_deref(), Some(old.id.as_str()));

        // Default search hides the superseded entry
        let active = store.search(1, SearchQuery::default()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, new.id);

        // Timeline shows the full chain, oldest first
        let timeline = store.timeline(1, MemoryCategory::Personal).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].id, old.id);
        assert_eq!(timeline[0].superseded_by_id.as_deref(), Some(new.id.as_str()));
        assert!(timeline[0].valid_until.is_some());
    }

    #[tokio::test]
    async fn test_supersede_forest_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let a = store
            .save(1, NewMemory::new("fact v1", MemoryCategory::Context))
            .await
            .unwrap();
        let b = store
            .save_with_supersede(1, NewMemory::new("fact v2", MemoryCategory::Context), &a.id)
            .await
            .unwrap();
        let c = store
            .save_with_supersede(1, NewMemory::new("fact v3", MemoryCategory::Context), &b.id)
            .await
            .unwrap();

        let all = store
            .search(
                1,
                SearchQuery {
                    include_superseded: true,
                    limit: 100,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Each node has at most one direct successor and no cycles
        for memory in &all {
            let successors = all
                .iter()
                .filter(|m| m.supersedes_id.as_deref() == Some(memory.id.as_str()))
                .count();
            assert!(successors <= 1);
        }
        let mut current = c.clone();
        let mut hops = 0;
        while let Some(prev) = &current.supersedes_id {
            current = all.iter().find(|m| &m.id == prev).unwrap().clone();
            hops += 1;
            assert!(hops <= all.len(), "cycle in supersede chain");
        }
        assert_eq!(hops, 2);
    }

    #[tokio::test]
    async fn test_supersede_rejects_second_successor() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let old = store
            .save(1, NewMemory::new("fact v1", MemoryCategory::Context))
            .await
            .unwrap();
        store
            .save_with_supersede(1, NewMemory::new("fact v2", MemoryCategory::Context), &old.id)
            .await
            .unwrap();

        let err = store
            .save_with_supersede(1, NewMemory::new("fact v2b", MemoryCategory::Context), &old.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_supersede_missing_target_degrades_to_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let memory = store
            .save_with_supersede(
                1,
                NewMemory::new("orphan fact", MemoryCategory::Context),
                "mem_00000000_ffffff",
            )
            .await
            .unwrap();
        assert!(memory.supersedes_id.is_none());
    }

    #[tokio::test]
    async fn test_update_delete_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let m1 = store
            .save(1, NewMemory::new("fact one", MemoryCategory::Health))
            .await
            .unwrap();
        store
            .save(1, NewMemory::new("fact two", MemoryCategory::Career))
            .await
            .unwrap();

        store
            .update(1, &m1.id, None, Some(Visibility::Public), Some(true))
            .await
            .unwrap();

        let stats = store.stats(1).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_category.get("health"), Some(&1));
        assert_eq!(stats.by_visibility.get("public"), Some(&2));

        store.delete(1, &m1.id).await.unwrap();
        let stats = store.stats(1).await.unwrap();
        assert_eq!(stats.total, 1);

        let err = store.delete(1, &m1.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_confidence_validation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut new = NewMemory::new("bad", MemoryCategory::Context);
        new.confidence = 1.5;
        assert!(store.save(1, new).await.is_err());
    }
}

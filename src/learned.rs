//! Learned column mappings.
//!
//! A process-wide map from normalized column name to a mapping that cleared the
//! learning threshold, written through to a [`KvStore`] under `learned:{name}`.
//! Consulted before any dictionary or LLM work for a column.

use crate::model::MappingMethod;
use crate::schema_cache::CacheEntry;
use crate::semantic::matcher;
use crate::store::{KvStore, MemoryStore};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KEY_PREFIX: &str = "learned:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedMapping {
    pub standard_field: String,
    pub confidence: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Layer that produced the mapping (llm, multi_model or custom for manual entries).
    pub source: MappingMethod,
}

pub struct LearnedStore {
    entries: Mutex<HashMap<String, CacheEntry<LearnedMapping>>>,
    backend: Arc<dyn KvStore>,
    /// Serializes memory-plus-backend updates so both sides stay in step.
    write_lock: tokio::sync::Mutex<()>,
}

impl LearnedStore {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backend,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn storage_key(column: &str) -> String {
        format!("{}{}", KEY_PREFIX, column)
    }

    /// Warm the map from the backend. Unreadable records are skipped.
    pub async fn load(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let keys = self
            .backend
            .list_keys(KEY_PREFIX)
            .await
            .context("Failed to list learned mappings")?;

        let mut loaded = Vec::new();
        for key in keys {
            let Some(bytes) = self.backend.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<CacheEntry<LearnedMapping>>(&bytes) {
                Ok(entry) => loaded.push(entry),
                Err(e) => warn!("Skipping unreadable learned mapping {}: {}", key, e),
            }
        }

        let count = loaded.len();
        let mut entries = self.entries.lock();
        for entry in loaded {
            entries.insert(entry.key.clone(), entry);
        }
        info!("Loaded {} learned mappings", count);
        Ok(count)
    }

    /// Mapping for a column name, counted as an access.
    pub fn get(&self, column: &str) -> Option<LearnedMapping> {
        let key = matcher::normalize(column);
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&key)?;
        entry.touch(Utc::now());
        debug!("Learned mapping hit: {} -> {}", key, entry.payload.standard_field);
        Some(entry.payload.clone())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.entries.lock().contains_key(&matcher::normalize(column))
    }

    /// Insert or replace the mapping for a column and persist it.
    pub async fn add(&self, column: &str, mapping: LearnedMapping) -> Result<()> {
        let key = matcher::normalize(column);
        anyhow::ensure!(!key.is_empty(), "column name is empty after normalization");
        let _guard = self.write_lock.lock().await;

        let entry = CacheEntry::new(key.clone(), mapping, Utc::now());
        let bytes = serde_json::to_vec(&entry)?;
        self.backend
            .set(&Self::storage_key(&key), &bytes)
            .await
            .with_context(|| format!("Failed to persist learned mapping {}", key))?;

        info!("Learned mapping: {} -> {}", key, entry.payload.standard_field);
        self.entries.lock().insert(key, entry);
        Ok(())
    }

    /// Remove one mapping. Returns whether it existed.
    pub async fn remove(&self, column: &str) -> Result<bool> {
        let key = matcher::normalize(column);
        let _guard = self.write_lock.lock().await;
        self.backend
            .delete(&Self::storage_key(&key))
            .await
            .with_context(|| format!("Failed to delete learned mapping {}", key))?;
        Ok(self.entries.lock().remove(&key).is_some())
    }

    /// Remove every mapping. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let keys = self.backend.list_keys(KEY_PREFIX).await?;
        for key in &keys {
            self.backend.delete(key).await?;
        }
        let mut entries = self.entries.lock();
        let removed = entries.len().max(keys.len());
        entries.clear();
        Ok(removed)
    }

    /// All mappings, sorted by column name.
    pub fn list(&self) -> Vec<CacheEntry<LearnedMapping>> {
        let mut all: Vec<_> = self.entries.lock().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

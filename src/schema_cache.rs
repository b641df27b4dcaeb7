//! Schema cache: full analysis results keyed by file content, with a
//! header-similarity fallback.
//!
//! Entries expire after the configured TTL (checked lazily on read). When the
//! entry count exceeds the maximum, the least recently accessed tenth is evicted.

use crate::config::InferenceConfig;
use crate::model::{DetectionResult, FieldMapping, UserCorrection};
use crate::semantic::matcher;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Headers kept per entry for similarity search.
const MAX_SIGNATURE_HEADERS: usize = 20;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A cached payload with its access bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, payload: T, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at: now,
            accessed_at: now,
            access_count: 0,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.accessed_at = now;
        self.access_count += 1;
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.created_at > ttl
    }
}

/// Detection plus, once computed, the field mappings for the same sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnalysis {
    pub detection: DetectionResult,
    #[serde(default)]
    pub mappings: Option<Vec<FieldMapping>>,
    #[serde(default)]
    pub corrections: Vec<UserCorrection>,
}

impl CachedAnalysis {
    pub fn new(detection: DetectionResult, mappings: Option<Vec<FieldMapping>>) -> Self {
        Self {
            detection,
            mappings,
            corrections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub similarity_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Result of a similarity lookup.
#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub key: String,
    pub similarity: f64,
    pub analysis: CachedAnalysis,
}

struct Slot {
    entry: CacheEntry<CachedAnalysis>,
    signature: BTreeSet<String>,
    /// Insertion/access order, breaks `accessed_at` ties.
    sequence: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    stats: CacheStats,
    sequence: u64,
}

impl Inner {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Upper bound for TTLs too large to represent.
const MAX_TTL_DAYS: i64 = 365 * 1000;

pub struct SchemaCache {
    inner: Mutex<Inner>,
    ttl: chrono::Duration,
    max_entries: usize,
    similarity_threshold: f64,
    clock: Clock,
}

impl SchemaCache {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                stats: CacheStats {
                    max_entries: config.cache_max_entries,
                    ttl_seconds: config.cache_ttl_seconds,
                    ..CacheStats::default()
                },
                ..Inner::default()
            }),
            ttl: chrono::Duration::from_std(config.cache_ttl())
                .unwrap_or_else(|_| chrono::Duration::days(MAX_TTL_DAYS)),
            max_entries: config.cache_max_entries.max(1),
            similarity_threshold: config.similarity_threshold,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// `sha256(file) + ":" + sheet_index`.
    pub fn exact_key(file_bytes: &[u8], sheet_index: usize) -> String {
        format!("{}:{}", hex::encode(Sha256::digest(file_bytes)), sheet_index)
    }

    pub fn get(&self, key: &str) -> Option<CachedAnalysis> {
        let now = (self.clock)();
        let mut inner = self.inner.lock();

        let expired = match inner.slots.get(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(slot) => slot.entry.is_expired(now, self.ttl),
        };
        if expired {
            inner.slots.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            debug!("Schema cache entry {} expired", key);
            return None;
        }

        let sequence = inner.next_sequence();
        inner.stats.hits += 1;
        let slot = inner.slots.get_mut(key)?;
        slot.entry.touch(now);
        slot.sequence = sequence;
        Some(slot.entry.payload.clone())
    }

    /// Best live entry whose header set is at least `similarity_threshold`
    /// Jaccard-similar to `headers`.
    pub fn find_similar(&self, headers: &[String]) -> Option<SimilarMatch> {
        let query = signature(headers);
        if query.is_empty() {
            return None;
        }
        let now = (self.clock)();
        let mut inner = self.inner.lock();
        self.purge_expired(&mut inner, now);

        let best = inner
            .slots
            .iter()
            .map(|(key, slot)| (key.clone(), jaccard(&query, &slot.signature)))
            .filter(|(_, similarity)| *similarity >= self.similarity_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

        let Some((key, similarity)) = best else {
            inner.stats.misses += 1;
            return None;
        };

        let sequence = inner.next_sequence();
        inner.stats.similarity_hits += 1;
        let slot = inner.slots.get_mut(&key)?;
        slot.entry.touch(now);
        slot.sequence = sequence;
        info!("Schema cache similarity hit {} ({:.3})", key, similarity);
        Some(SimilarMatch {
            key,
            similarity,
            analysis: slot.entry.payload.clone(),
        })
    }

    /// Store (or replace) an entry, evicting when over capacity.
    pub fn put(&self, key: &str, analysis: CachedAnalysis) {
        let now = (self.clock)();
        let signature = signature(&analysis.detection.column_names());
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence();

        inner.slots.insert(
            key.to_string(),
            Slot {
                entry: CacheEntry::new(key, analysis, now),
                signature,
                sequence,
            },
        );

        if inner.slots.len() > self.max_entries {
            self.evict(&mut inner);
        }
    }

    /// Append a user correction to a live entry. Returns false if absent.
    pub fn add_correction(&self, key: &str, correction: UserCorrection) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(key) {
            Some(slot) => {
                slot.entry
                    .payload
                    .corrections
                    .retain(|c| c.column != correction.column);
                slot.entry.payload.corrections.push(correction);
                true
            }
            None => false,
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().slots.remove(key).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.slots.len();
        inner.slots.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.slots.len(),
            ..inner.stats.clone()
        }
    }

    /// Entry metadata for a key, without counting as an access.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<CachedAnalysis>> {
        self.inner.lock().slots.get(key).map(|s| s.entry.clone())
    }

    fn purge_expired(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| !slot.entry.is_expired(now, self.ttl));
        let purged = before - inner.slots.len();
        if purged > 0 {
            inner.stats.expirations += purged as u64;
            debug!("Purged {} expired schema cache entries", purged);
        }
    }

    fn evict(&self, inner: &mut Inner) {
        let count = (self.max_entries / 10).max(1);
        let mut order: Vec<(DateTime<Utc>, u64, String)> = inner
            .slots
            .iter()
            .map(|(key, slot)| (slot.entry.accessed_at, slot.sequence, key.clone()))
            .collect();
        order.sort();

        for (_, _, key) in order.into_iter().take(count) {
            inner.slots.remove(&key);
            inner.stats.evictions += 1;
            debug!("Evicted schema cache entry {}", key);
        }
    }
}

/// Normalized, sorted header set truncated to 20 entries.
fn signature(headers: &[String]) -> BTreeSet<String> {
    headers
        .iter()
        .map(|h| matcher::normalize(h))
        .filter(|h| !h.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(MAX_SIGNATURE_HEADERS)
        .collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnInfo;
    use crate::model::ColumnType;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock advancing one second per reading, plus manual jumps.
    fn stepping_clock() -> (Clock, Arc<AtomicI64>) {
        let seconds = Arc::new(AtomicI64::new(1_700_000_000));
        let handle = seconds.clone();
        let clock: Clock = Arc::new(move || {
            let s = handle.fetch_add(1, Ordering::SeqCst);
            DateTime::from_timestamp(s, 0).unwrap_or_default()
        });
        (clock, seconds)
    }

    fn analysis(headers: &[&str]) -> CachedAnalysis {
        let mut detection = DetectionResult::failed("");
        detection.error = None;
        detection.columns = headers
            .iter()
            .enumerate()
            .map(|(index, name)| ColumnInfo {
                index,
                name: name.to_string(),
                inferred_type: ColumnType::Text,
                sample_values: Vec::new(),
            })
            .collect();
        CachedAnalysis::new(detection, None)
    }

    fn cache(max_entries: usize, ttl: u64) -> (SchemaCache, Arc<AtomicI64>) {
        let config = InferenceConfig {
            cache_max_entries: max_entries,
            cache_ttl_seconds: ttl,
            ..InferenceConfig::default()
        };
        let (clock, seconds) = stepping_clock();
        (SchemaCache::new(&config).with_clock(clock), seconds)
    }

    #[test]
    fn test_round_trip() {
        let (cache, _) = cache(10, 3600);
        let key = SchemaCache::exact_key(b"file", 0);
        let stored = analysis(&["项目", "预算"]);
        cache.put(&key, stored.clone());

        assert_eq!(cache.get(&key), Some(stored));
        let entry = cache.entry(&key).unwrap();
        assert_eq!(entry.access_count, 1);
        assert!(entry.accessed_at > entry.created_at);
    }

    #[test]
    fn test_exact_key_format() {
        let key = SchemaCache::exact_key(b"abc", 2);
        assert_eq!(
            key,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad:2"
        );
    }

    #[test]
    fn test_ttl_expiry() {
        let (cache, seconds) = cache(10, 60);
        cache.put("k", analysis(&["a"]));
        seconds.fetch_add(120, Ordering::SeqCst);

        assert!(cache.get("k").is_none());
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_huge_ttl_is_clamped() {
        let (cache, seconds) = cache(10, u64::MAX);
        cache.put("k", analysis(&["a"]));
        seconds.fetch_add(10 * 365 * 24 * 3600, Ordering::SeqCst);

        assert!(cache.get("k").is_some());
        assert_eq!(cache.stats().ttl_seconds, u64::MAX);
    }

    #[test]
    fn test_eviction_removes_oldest_accessed() {
        let (cache, _) = cache(10, 3600);
        for i in 0..10 {
            cache.put(&format!("k{}", i), analysis(&[&format!("h{}", i)]));
        }
        // k0 becomes recent; k1 is now the oldest.
        assert!(cache.get("k0").is_some());

        cache.put("k10", analysis(&["h10"]));

        let stats = cache.stats();
        assert_eq!(stats.entries, 10);
        assert_eq!(stats.evictions, 1);
        assert!(cache.entry("k1").is_none());
        assert!(cache.entry("k0").is_some());
        assert!(cache.entry("k10").is_some());
    }

    #[test]
    fn test_similarity_one_column_different() {
        let (cache, _) = cache(10, 3600);
        let cached: Vec<String> = (0..10).map(|i| format!("col{}", i)).collect();
        let mut query = cached.clone();
        query[9] = "other".to_string();

        let refs: Vec<&str> = cached.iter().map(String::as_str).collect();
        cache.put("k", analysis(&refs));

        let hit = cache.find_similar(&query).unwrap();
        assert_eq!(hit.key, "k");
        assert!((hit.similarity - 9.0 / 11.0).abs() < 1e-9);
        assert_eq!(cache.stats().similarity_hits, 1);

        let unrelated: Vec<String> = vec!["x".into(), "y".into()];
        assert!(cache.find_similar(&unrelated).is_none());
    }

    #[test]
    fn test_signature_normalizes_and_truncates() {
        let headers: Vec<String> = (0..30).map(|i| format!(" Col {:02} ", i)).collect();
        let sig = signature(&headers);
        assert_eq!(sig.len(), MAX_SIGNATURE_HEADERS);
        assert!(sig.contains("col_00"));
    }

    #[test]
    fn test_corrections_replace_per_column() {
        let (cache, _) = cache(10, 3600);
        cache.put("k", analysis(&["营收"]));
        let fix = |field: &str| UserCorrection {
            column: "营收".into(),
            standard_field: field.into(),
        };

        assert!(cache.add_correction("k", fix("revenue")));
        assert!(cache.add_correction("k", fix("amount")));
        assert!(!cache.add_correction("missing", fix("revenue")));

        let corrections = cache.get("k").unwrap().corrections;
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].standard_field, "amount");
    }

    #[test]
    fn test_invalidate_and_clear() {
        let (cache, _) = cache(10, 3600);
        cache.put("a", analysis(&["x"]));
        cache.put("b", analysis(&["y"]));
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.stats().entries, 0);
    }
}

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
// tokio's Instant so tests can drive TTL expiry with a paused clock.
use tokio::time::Instant;
use serde::Serialize;

use crate::cache::classifier::{CacheClassifier, CacheStrategy};
use crate::cache::key::{command_key, normalize_command};
use crate::error::ShellError;
use crate::events::{CacheEvent, EventBus, ShellEvent};

/// Default bound on resident entries; least-recently-used entries are
/// evicted beyond this.
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// A cached command result. Present in the cache iff the strategy is not
/// NEVER and the entry is younger than its strategy TTL.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub stored_at: Instant,
    pub access_count: u64,
    pub strategy: CacheStrategy,
}

struct Entry {
    result: CachedResult,
    /// Original command text, kept for pattern-based clearing.
    command: String,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    skips: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub skips: u64,
    pub expired: u64,
    pub hit_rate: f64,
    pub enabled: bool,
    /// Strategy → TTL seconds (null for PERMANENT).
    pub ttl_secs: Vec<(String, Option<u64>)>,
}

/// TTL + LRU result cache keyed by the digest of `(normalized_command, cwd)`.
pub struct ResultCache {
    classifier: Arc<CacheClassifier>,
    events: EventBus,
    entries: Mutex<LruCache<String, Entry>>,
    counters: Counters,
    enabled: AtomicBool,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(classifier: Arc<CacheClassifier>, events: EventBus, enabled: bool) -> Self {
        Self::with_capacity(classifier, events, enabled, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(
        classifier: Arc<CacheClassifier>,
        events: EventBus,
        enabled: bool,
        max_entries: usize,
    ) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("non-zero capacity");
        Self {
            classifier,
            events,
            entries: Mutex::new(LruCache::new(cap)),
            counters: Counters::default(),
            enabled: AtomicBool::new(enabled),
            max_entries: max_entries.max(1),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Look up a cached result. Expired entries are deleted on observation;
    /// hits bump the entry's access count.
    pub fn get(&self, command: &str, cwd: &str) -> Option<CachedResult> {
        if !self.is_enabled() {
            return None;
        }
        let key = command_key(command, cwd);

        if !self.classifier.should_cache(command) {
            self.miss(&key);
            return None;
        }

        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let Some(entry) = entries.get_mut(&key) else {
            drop(entries);
            self.miss(&key);
            return None;
        };

        if let Some(ttl) = entry.result.strategy.ttl()
            && entry.result.stored_at.elapsed() > ttl
        {
            entries.pop(&key);
            drop(entries);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.events
                .emit(ShellEvent::Cache(CacheEvent::Expired { key: key.clone() }));
            self.miss(&key);
            return None;
        }

        entry.result.access_count += 1;
        let result = entry.result.clone();
        drop(entries);

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.events.emit(ShellEvent::Cache(CacheEvent::Hit { key }));
        Some(result)
    }

    /// Store a result. NEVER-classified commands are skipped silently (an
    /// observability event is still emitted). Replaces any existing entry
    /// for the key.
    pub fn set(&self, command: &str, cwd: &str, stdout: &str, stderr: &str, exit_code: i32) {
        if !self.is_enabled() {
            return;
        }
        let key = command_key(command, cwd);
        let classification = self.classifier.classify(command);

        if classification.strategy == CacheStrategy::Never {
            self.counters.skips.fetch_add(1, Ordering::Relaxed);
            self.events.emit(ShellEvent::Cache(CacheEvent::Skip { key }));
            return;
        }

        let entry = Entry {
            result: CachedResult {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
                stored_at: Instant::now(),
                access_count: 0,
                strategy: classification.strategy,
            },
            command: normalize_command(command),
        };

        self.entries
            .lock()
            .expect("cache lock poisoned")
            .push(key.clone(), entry);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.events.emit(ShellEvent::Cache(CacheEvent::Set {
            key,
            strategy: classification.strategy.as_str(),
        }));
    }

    /// Remove entries for a command. With a cwd the single key is removed;
    /// without, every entry whose normalized command matches is removed.
    /// Returns the number of entries cleared.
    pub fn clear_command(&self, command: &str, cwd: Option<&str>) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let cleared = match cwd {
            Some(cwd) => {
                let key = command_key(command, cwd);
                usize::from(entries.pop(&key).is_some())
            }
            None => {
                let normalized = normalize_command(command);
                let keys: Vec<String> = entries
                    .iter()
                    .filter(|(_, e)| e.command == normalized)
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in &keys {
                    entries.pop(k);
                }
                keys.len()
            }
        };
        drop(entries);
        if cleared > 0 {
            self.events
                .emit(ShellEvent::Cache(CacheEvent::Cleared { count: cleared }));
        }
        cleared
    }

    /// Remove entries whose command matches the regex. Returns the number
    /// cleared, or an error for an invalid pattern.
    pub fn clear_pattern(&self, pattern: &str) -> Result<usize, ShellError> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| ShellError::InvalidPattern(e.to_string()))?;
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| re.is_match(&e.command))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &keys {
            entries.pop(k);
        }
        drop(entries);
        if !keys.is_empty() {
            self.events
                .emit(ShellEvent::Cache(CacheEvent::Cleared { count: keys.len() }));
        }
        Ok(keys.len())
    }

    pub fn clear_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let count = entries.len();
        entries.clear();
        drop(entries);
        self.events
            .emit(ShellEvent::Cache(CacheEvent::Cleared { count }));
        count
    }

    pub fn explain(&self, command: &str) -> String {
        self.classifier.explain(command)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.len(),
            max_entries: self.max_entries,
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            skips: self.counters.skips.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            enabled: self.is_enabled(),
            ttl_secs: [
                CacheStrategy::Never,
                CacheStrategy::Short,
                CacheStrategy::Medium,
                CacheStrategy::Long,
                CacheStrategy::Permanent,
            ]
            .iter()
            .map(|s| (s.as_str().to_string(), s.ttl().map(|d| d.as_secs())))
            .collect(),
        }
    }

    fn miss(&self, key: &str) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.events.emit(ShellEvent::Cache(CacheEvent::Miss {
            key: key.to_string(),
        }));
    }
}

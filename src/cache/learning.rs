use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::classifier::{
    CacheClassifier, CacheStrategy, ClassifierRule, RulePattern, RulePriority,
};
use crate::error::ShellError;

/// Maximum persisted rules; least-recently-hit rules are evicted beyond this.
pub const MAX_RULES: usize = 1000;

/// Quiet period before a mutation is flushed to disk. Mutations inside the
/// window coalesce into one write.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Where a learned rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleSource {
    User,
    AutoDetect,
    Analysis,
}

impl RuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::AutoDetect => "auto-detect",
            Self::Analysis => "analysis",
        }
    }
}

/// A persistent classification rule learned at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedRule {
    pub pattern: String,
    pub is_regex: bool,
    pub strategy: CacheStrategy,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hit_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hit_count: u64,
    pub source: RuleSource,
}

impl LearnedRule {
    pub fn new(
        pattern: impl Into<String>,
        is_regex: bool,
        strategy: CacheStrategy,
        reason: impl Into<String>,
        source: RuleSource,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            is_regex,
            strategy,
            reason: reason.into(),
            created_at: Utc::now(),
            last_hit_at: None,
            hit_count: 0,
            source,
        }
    }

    fn to_classifier_rule(&self) -> Result<ClassifierRule, ShellError> {
        let pattern = if self.is_regex {
            RulePattern::regex(&self.pattern)?
        } else {
            RulePattern::literal(&self.pattern)
        };
        Ok(ClassifierRule::new(
            pattern,
            self.strategy,
            self.reason.clone(),
        ))
    }

    /// Recency used for eviction ordering: last hit, falling back to creation.
    fn recency(&self) -> DateTime<Utc> {
        self.last_hit_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub total_rules: usize,
    pub by_source: HashMap<String, usize>,
    pub by_strategy: HashMap<String, usize>,
    /// Top five rules by hit count: `(pattern, hits)`.
    pub top_rules: Vec<(String, u64)>,
}

/// Durable store for learned classification rules.
///
/// The rule file is a pretty-printed JSON array. Writes are debounced
/// (1 s of inactivity), serialized through an async write lock, and always
/// preceded by copying the current file to its `.backup` sibling. The write
/// itself is atomic: temp file + rename.
pub struct LearningStore {
    path: PathBuf,
    backup_path: PathBuf,
    rules: Mutex<Vec<LearnedRule>>,
    generation: Arc<AtomicU64>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LearningStore {
    pub fn new(path: PathBuf) -> Self {
        let backup_path = backup_path_for(&path);
        Self {
            path,
            backup_path,
            rules: Mutex::new(Vec::new()),
            generation: Arc::new(AtomicU64::new(0)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Load rules from disk and register each with the classifier at high
    /// priority. A missing file starts empty; corrupt content is logged,
    /// the backup is left untouched, and the store starts empty.
    pub async fn initialize(&self, classifier: &CacheClassifier) {
        let loaded: Vec<LearnedRule> = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(rules) => rules,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        "corrupt rule file, starting empty (backup preserved): {e}"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "cannot read rule file: {e}");
                Vec::new()
            }
        };

        for rule in &loaded {
            match rule.to_classifier_rule() {
                Ok(cr) => classifier.add_rule(cr, RulePriority::High),
                Err(e) => {
                    tracing::warn!(pattern = %rule.pattern, "skipping unloadable rule: {e}")
                }
            }
        }

        tracing::info!(count = loaded.len(), "learned cache rules loaded");
        *self.rules.lock().expect("rules lock poisoned") = loaded;
    }

    /// Upsert a rule. An existing `(pattern, is_regex)` match bumps its hit
    /// count and recency instead of inserting. Schedules a debounced write.
    pub fn save_rule(&self, rule: LearnedRule) {
        {
            let mut rules = self.rules.lock().expect("rules lock poisoned");
            if let Some(existing) = rules
                .iter_mut()
                .find(|r| r.pattern == rule.pattern && r.is_regex == rule.is_regex)
            {
                existing.hit_count += 1;
                existing.last_hit_at = Some(Utc::now());
            } else {
                rules.push(rule);
                if rules.len() > MAX_RULES {
                    // Evict the least-recently-hit rule.
                    if let Some(idx) = rules
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, r)| r.recency())
                        .map(|(i, _)| i)
                    {
                        let evicted = rules.remove(idx);
                        tracing::debug!(pattern = %evicted.pattern, "evicted learned rule");
                    }
                }
            }
        }
        self.schedule_write();
    }

    /// Remove a rule by identity. Returns whether one was removed.
    pub fn remove_rule(&self, pattern: &str, is_regex: bool) -> bool {
        let removed = {
            let mut rules = self.rules.lock().expect("rules lock poisoned");
            let before = rules.len();
            rules.retain(|r| !(r.pattern == pattern && r.is_regex == is_regex));
            rules.len() < before
        };
        if removed {
            self.schedule_write();
        }
        removed
    }

    pub fn rules(&self) -> Vec<LearnedRule> {
        self.rules.lock().expect("rules lock poisoned").clone()
    }

    pub fn stats(&self) -> LearningStats {
        let rules = self.rules.lock().expect("rules lock poisoned");
        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut by_strategy: HashMap<String, usize> = HashMap::new();
        for r in rules.iter() {
            *by_source.entry(r.source.as_str().to_string()).or_default() += 1;
            *by_strategy
                .entry(r.strategy.as_str().to_string())
                .or_default() += 1;
        }
        let mut ranked: Vec<(String, u64)> = rules
            .iter()
            .map(|r| (r.pattern.clone(), r.hit_count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(5);
        LearningStats {
            total_rules: rules.len(),
            by_source,
            by_strategy,
            top_rules: ranked,
        }
    }

    /// Force any pending debounced write to complete now.
    pub async fn flush(&self) {
        self.write_now().await;
    }

    fn schedule_write(&self) {
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Outside a runtime (sync unit tests) the caller flushes explicitly.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let generation = self.generation.clone();
        let snapshot_source = self.snapshot_handle();
        handle.spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            // A later mutation superseded this write; let its task handle it.
            if generation.load(Ordering::SeqCst) != my_gen {
                return;
            }
            snapshot_source.write().await;
        });
    }

    fn snapshot_handle(&self) -> WriteHandle {
        WriteHandle {
            path: self.path.clone(),
            backup_path: self.backup_path.clone(),
            rules: self.rules.lock().expect("rules lock poisoned").clone(),
            write_lock: self.write_lock.clone(),
        }
    }

    async fn write_now(&self) {
        self.snapshot_handle().write().await;
    }
}

/// Owned snapshot of the store state, detached for background writing.
struct WriteHandle {
    path: PathBuf,
    backup_path: PathBuf,
    rules: Vec<LearnedRule>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl WriteHandle {
    async fn write(self) {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!("cannot create rule directory: {e}");
            return;
        }

        // Back up the current file first; a missing file is fine.
        if let Err(e) = tokio::fs::copy(&self.path, &self.backup_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("rule backup failed: {e}");
        }

        let json = match serde_json::to_string_pretty(&self.rules) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("cannot serialize rules: {e}");
                return;
            }
        };

        // Atomic write: temp file + rename prevents partial reads. Temp
        // filename includes PID to avoid cross-process collisions.
        let tmp_path = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        if let Err(e) = tokio::fs::write(&tmp_path, json.as_bytes()).await {
            tracing::warn!("rule write failed: {e}");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            tracing::warn!("rule rename failed: {e}");
        }
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => path.with_extension(format!("backup.{ext}")),
        None => path.with_extension("backup"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_sibling_keeps_extension() {
        let p = PathBuf::from("/home/u/.mcp-cache-rules.json");
        assert_eq!(
            backup_path_for(&p),
            PathBuf::from("/home/u/.mcp-cache-rules.backup.json")
        );
    }

    #[test]
    fn upsert_bumps_hit_count() {
        let store = LearningStore::new(PathBuf::from("/nonexistent/rules.json"));
        store.save_rule(LearnedRule::new(
            "date",
            false,
            CacheStrategy::Never,
            "t",
            RuleSource::User,
        ));
        store.save_rule(LearnedRule::new(
            "date",
            false,
            CacheStrategy::Never,
            "t",
            RuleSource::User,
        ));
        let rules = store.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].hit_count, 1);
        assert!(rules[0].last_hit_at.is_some());
    }

    #[test]
    fn remove_rule_reports_presence() {
        let store = LearningStore::new(PathBuf::from("/nonexistent/rules.json"));
        store.save_rule(LearnedRule::new(
            "date",
            false,
            CacheStrategy::Never,
            "t",
            RuleSource::User,
        ));
        assert!(store.remove_rule("date", false));
        assert!(!store.remove_rule("date", false));
    }

    #[test]
    fn stats_rank_by_hits() {
        let store = LearningStore::new(PathBuf::from("/nonexistent/rules.json"));
        for (pattern, hits) in [("a", 5u64), ("b", 9), ("c", 1)] {
            store.save_rule(LearnedRule::new(
                pattern,
                false,
                CacheStrategy::Never,
                "t",
                RuleSource::AutoDetect,
            ));
            for _ in 0..hits {
                store.save_rule(LearnedRule::new(
                    pattern,
                    false,
                    CacheStrategy::Never,
                    "t",
                    RuleSource::AutoDetect,
                ));
            }
        }
        let stats = store.stats();
        assert_eq!(stats.total_rules, 3);
        assert_eq!(stats.top_rules[0], ("b".to_string(), 9));
        assert_eq!(stats.by_source.get("auto-detect"), Some(&3));
    }
}

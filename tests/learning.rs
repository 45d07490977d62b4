//! Tests for the persistent learning store: round-trips, backups,
//! corruption tolerance, and classifier registration on load.

use sirocco::cache::classifier::{CacheClassifier, CacheStrategy};
use sirocco::cache::learning::{LearnedRule, LearningStore, RuleSource};

fn rules_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join(".mcp-cache-rules.json")
}

fn never_rule(pattern: &str, source: RuleSource) -> LearnedRule {
    LearnedRule::new(pattern, false, CacheStrategy::Never, "test rule", source)
}

// ---------------------------------------------------------------------------
// Round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saved_rules_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = rules_path(&dir);

    let store = LearningStore::new(path.clone());
    store.save_rule(never_rule("date", RuleSource::User));
    store.save_rule(never_rule("custom-monitor", RuleSource::AutoDetect));
    store.flush().await;

    // Fresh store + classifier, as after a crash and restart.
    let reloaded = LearningStore::new(path);
    let classifier = CacheClassifier::new();
    reloaded.initialize(&classifier).await;

    let rules = reloaded.rules();
    assert_eq!(rules.len(), 2);
    // Loaded rules are registered at high priority: `custom-monitor`
    // would otherwise default to MEDIUM.
    assert_eq!(
        classifier.classify("custom-monitor").strategy,
        CacheStrategy::Never
    );
    assert_eq!(classifier.classify("date").strategy, CacheStrategy::Never);
}

#[tokio::test]
async fn rule_file_is_pretty_printed_json_with_sources() {
    let dir = tempfile::tempdir().unwrap();
    let path = rules_path(&dir);

    let store = LearningStore::new(path.clone());
    store.save_rule(never_rule("date", RuleSource::User));
    store.flush().await;

    let content = tokio::fs::read_to_string(&path).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    let arr = parsed.as_array().unwrap();
    assert_eq!(arr.len(), 1);
    assert_eq!(arr[0]["pattern"], "date");
    assert_eq!(arr[0]["isRegex"], false);
    assert_eq!(arr[0]["strategy"], "NEVER");
    assert_eq!(arr[0]["source"], "user");
    // Pretty printed: newlines between fields.
    assert!(content.contains("\n"));
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rewrite_produces_a_backup_of_the_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = rules_path(&dir);
    let backup = dir.path().join(".mcp-cache-rules.backup.json");

    let store = LearningStore::new(path.clone());
    store.save_rule(never_rule("first", RuleSource::User));
    store.flush().await;
    assert!(!backup.exists());

    store.save_rule(never_rule("second", RuleSource::User));
    store.flush().await;
    assert!(backup.exists());

    // Backup holds the previous generation (one rule).
    let backup_rules: Vec<serde_json::Value> =
        serde_json::from_str(&tokio::fs::read_to_string(&backup).await.unwrap()).unwrap();
    assert_eq!(backup_rules.len(), 1);
    let current_rules: Vec<serde_json::Value> =
        serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
    assert_eq!(current_rules.len(), 2);
}

// ---------------------------------------------------------------------------
// Corruption and absence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = LearningStore::new(rules_path(&dir));
    store.initialize(&CacheClassifier::new()).await;
    assert!(store.rules().is_empty());
}

#[tokio::test]
async fn corrupt_file_starts_empty_and_preserves_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = rules_path(&dir);
    let backup = dir.path().join(".mcp-cache-rules.backup.json");

    tokio::fs::write(&path, "{not json").await.unwrap();
    tokio::fs::write(&backup, "[]").await.unwrap();

    let store = LearningStore::new(path);
    store.initialize(&CacheClassifier::new()).await;
    assert!(store.rules().is_empty());
    assert!(backup.exists());
}

// ---------------------------------------------------------------------------
// Upsert and debounce
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_saves_coalesce_by_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let store = LearningStore::new(rules_path(&dir));

    for _ in 0..5 {
        store.save_rule(never_rule("date", RuleSource::AutoDetect));
    }
    let rules = store.rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].hit_count, 4);
    assert!(rules[0].last_hit_at.is_some());
}

#[tokio::test]
async fn literal_and_regex_rules_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let store = LearningStore::new(rules_path(&dir));

    store.save_rule(never_rule("date", RuleSource::User));
    store.save_rule(LearnedRule::new(
        "date",
        true,
        CacheStrategy::Never,
        "regex variant",
        RuleSource::User,
    ));
    assert_eq!(store.rules().len(), 2);

    assert!(store.remove_rule("date", true));
    assert_eq!(store.rules().len(), 1);
    assert!(!store.rules()[0].is_regex);
}

#[tokio::test]
async fn debounced_write_lands_without_explicit_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = rules_path(&dir);
    let store = LearningStore::new(path.clone());

    store.save_rule(never_rule("date", RuleSource::User));
    // The debounce window is 1s; wait a little past it.
    tokio::time::sleep(std::time::Duration::from_millis(1400)).await;
    assert!(path.exists());
}

#[tokio::test]
async fn stats_break_down_by_source_and_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let store = LearningStore::new(rules_path(&dir));

    store.save_rule(never_rule("a", RuleSource::User));
    store.save_rule(never_rule("b", RuleSource::AutoDetect));
    store.save_rule(LearnedRule::new(
        "c",
        false,
        CacheStrategy::Short,
        "analysis",
        RuleSource::Analysis,
    ));

    let stats = store.stats();
    assert_eq!(stats.total_rules, 3);
    assert_eq!(stats.by_source["user"], 1);
    assert_eq!(stats.by_source["auto-detect"], 1);
    assert_eq!(stats.by_source["analysis"], 1);
    assert_eq!(stats.by_strategy["NEVER"], 2);
    assert_eq!(stats.by_strategy["SHORT"], 1);
}

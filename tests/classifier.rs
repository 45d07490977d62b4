//! Tests for command classification: built-in rules, priorities, and the
//! explain surface.

use sirocco::cache::classifier::{
    CacheClassifier, CacheStrategy, ClassifierRule, RulePattern, RulePriority,
};

// ---------------------------------------------------------------------------
// Built-in rules
// ---------------------------------------------------------------------------

#[test]
fn volatile_status_commands_are_never_cached() {
    let c = CacheClassifier::new();
    for cmd in [
        "date",
        "date +%s",
        "ps aux",
        "top -b",
        "who",
        "uptime",
        "git status",
        "git status -sb",
        "df -h",
        "free -m",
    ] {
        assert_eq!(
            c.classify(cmd).strategy,
            CacheStrategy::Never,
            "expected NEVER for {cmd}"
        );
        assert!(!c.should_cache(cmd));
    }
}

#[test]
fn listings_are_short_lived() {
    let c = CacheClassifier::new();
    assert_eq!(c.classify("pwd").strategy, CacheStrategy::Short);
    assert_eq!(c.classify("ls").strategy, CacheStrategy::Short);
    assert_eq!(c.classify("ls -la").strategy, CacheStrategy::Short);
}

#[test]
fn file_reads_and_help_are_long_lived() {
    let c = CacheClassifier::new();
    assert_eq!(c.classify("cat Cargo.toml").strategy, CacheStrategy::Long);
    assert_eq!(c.classify("head -5 notes.md").strategy, CacheStrategy::Long);
    assert_eq!(c.classify("cargo --help").strategy, CacheStrategy::Long);
    assert_eq!(c.classify("man ls").strategy, CacheStrategy::Long);
}

#[test]
fn version_queries_are_permanent() {
    let c = CacheClassifier::new();
    assert_eq!(
        c.classify("node --version").strategy,
        CacheStrategy::Permanent
    );
    assert_eq!(c.classify("rustc -V").strategy, CacheStrategy::Permanent);
}

#[test]
fn unknown_commands_default_to_medium() {
    let c = CacheClassifier::new();
    let cls = c.classify("terraform plan");
    assert_eq!(cls.strategy, CacheStrategy::Medium);
    assert_eq!(cls.ttl, Some(std::time::Duration::from_secs(300)));
}

// ---------------------------------------------------------------------------
// Priorities and ordering
// ---------------------------------------------------------------------------

#[test]
fn high_priority_rules_beat_builtins_and_low() {
    let c = CacheClassifier::new();
    c.add_rule(
        ClassifierRule::new(
            RulePattern::literal("cat secrets.env"),
            CacheStrategy::Never,
            "sensitive",
        ),
        RulePriority::High,
    );
    // Built-in would say LONG for `cat`; the high rule wins.
    assert_eq!(
        c.classify("cat secrets.env").strategy,
        CacheStrategy::Never
    );
    // Other cat commands keep the built-in classification.
    assert_eq!(c.classify("cat notes.md").strategy, CacheStrategy::Long);
}

#[test]
fn low_priority_rules_only_apply_without_builtin_match() {
    let c = CacheClassifier::new();
    c.add_rule(
        ClassifierRule::new(
            RulePattern::literal("my-monitor"),
            CacheStrategy::Never,
            "inferred",
        ),
        RulePriority::Low,
    );
    assert_eq!(c.classify("my-monitor").strategy, CacheStrategy::Never);

    // A built-in match shadows a low-priority rule for the same command.
    c.add_rule(
        ClassifierRule::new(RulePattern::literal("pwd"), CacheStrategy::Never, "inferred"),
        RulePriority::Low,
    );
    assert_eq!(c.classify("pwd").strategy, CacheStrategy::Short);
}

#[test]
fn equal_priority_ties_break_by_insertion_order() {
    let c = CacheClassifier::new();
    c.add_rule(
        ClassifierRule::new(
            RulePattern::literal("deploy"),
            CacheStrategy::Never,
            "first",
        ),
        RulePriority::High,
    );
    c.add_rule(
        ClassifierRule::new(
            RulePattern::literal("deploy"),
            CacheStrategy::Long,
            "second",
        ),
        RulePriority::High,
    );
    let cls = c.classify("deploy");
    assert_eq!(cls.strategy, CacheStrategy::Never);
    assert_eq!(cls.reason, "first");
}

#[test]
fn regex_rules_match_normalized_text() {
    let c = CacheClassifier::new();
    c.add_rule(
        ClassifierRule::new(
            RulePattern::regex(r"^kubectl get ").unwrap(),
            CacheStrategy::Never,
            "cluster state",
        ),
        RulePriority::High,
    );
    // Extra whitespace collapses before matching.
    assert_eq!(
        c.classify("kubectl   get pods").strategy,
        CacheStrategy::Never
    );
}

// ---------------------------------------------------------------------------
// Explain
// ---------------------------------------------------------------------------

#[test]
fn explain_names_strategy_and_ttl() {
    let c = CacheClassifier::new();
    let text = c.explain("date");
    assert!(text.contains("NEVER"));
    assert!(text.contains("never cached"));

    let text = c.explain("cat notes.md");
    assert!(text.contains("LONG"));
    assert!(text.contains("3600"));

    let text = c.explain("rustc --version");
    assert!(text.contains("PERMANENT"));
    assert!(text.contains("permanently"));
}

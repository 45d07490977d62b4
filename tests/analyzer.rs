//! Tests for the output analyzer: indicator detection, the strategy ladder,
//! and positional output comparison.

use sirocco::cache::analyzer::{IndicatorKind, OutputAnalyzer};
use sirocco::cache::classifier::CacheStrategy;

// ---------------------------------------------------------------------------
// Strategy ladder
// ---------------------------------------------------------------------------

#[test]
fn high_change_keyword_is_never_with_full_confidence() {
    let a = OutputAnalyzer::new();
    let report = a.analyze("Real-time monitoring active");
    assert_eq!(report.suggested_strategy, CacheStrategy::Never);
    assert!((report.confidence - 1.0).abs() < f64::EPSILON);

    for text in ["live feed", "currently processing", "updating index"] {
        assert_eq!(a.analyze(text).suggested_strategy, CacheStrategy::Never);
    }
}

#[test]
fn static_text_is_long_with_good_confidence() {
    let report = OutputAnalyzer::new().analyze("Welcome to the application");
    assert_eq!(report.suggested_strategy, CacheStrategy::Long);
    assert!(report.confidence >= 0.8);
    assert!(report.indicators.is_empty());
}

#[test]
fn timestamp_and_pid_together_are_high_confidence_never() {
    let report = OutputAnalyzer::new().analyze("2024-01-15T10:30:45 pid 1234");
    assert_eq!(report.suggested_strategy, CacheStrategy::Never);
    assert!(report.confidence >= 0.95);
    let kinds: Vec<IndicatorKind> = report.indicators.iter().map(|i| i.kind).collect();
    assert!(kinds.contains(&IndicatorKind::Timestamp));
    assert!(kinds.contains(&IndicatorKind::ProcessId));
}

#[test]
fn lone_timestamp_is_never() {
    let report = OutputAnalyzer::new().analyze("last build at 10:30:45");
    assert_eq!(report.suggested_strategy, CacheStrategy::Never);
    assert!(report.confidence >= 0.9);
}

#[test]
fn lone_weak_indicator_is_short() {
    let report = OutputAnalyzer::new().analyze("received 42 packets");
    assert_eq!(report.suggested_strategy, CacheStrategy::Short);
    assert!((report.confidence - 0.7).abs() < f64::EPSILON);
}

#[test]
fn indicator_families_are_each_detected() {
    let a = OutputAnalyzer::new();
    let cases: &[(&str, IndicatorKind)] = &[
        ("updated 3 minutes ago", IndicatorKind::Timestamp),
        ("PID: 4242 started", IndicatorKind::ProcessId),
        ("3/10 tests passed", IndicatorKind::Counter),
        ("size 4.2 MB on disk", IndicatorKind::FileSize),
        ("listening on 192.168.1.10", IndicatorKind::IpAddress),
        ("bound to port 8080", IndicatorKind::Port),
    ];
    for (text, kind) in cases {
        let report = a.analyze(text);
        assert!(
            report.indicators.iter().any(|i| i.kind == *kind),
            "expected {kind:?} in {text:?}, got {:?}",
            report.indicators
        );
    }
}

// ---------------------------------------------------------------------------
// Output comparison
// ---------------------------------------------------------------------------

#[test]
fn identical_outputs_are_not_different() {
    let cmp = OutputAnalyzer::new().compare("a\nb\nc", "a\nb\nc");
    assert!(!cmp.is_different);
    assert!((cmp.similarity - 1.0).abs() < f64::EPSILON);
    assert!(cmp.differences.is_empty());
}

#[test]
fn empty_outputs_are_identical() {
    let cmp = OutputAnalyzer::new().compare("", "");
    assert!(!cmp.is_different);
    assert!((cmp.similarity - 1.0).abs() < f64::EPSILON);
}

#[test]
fn one_changed_line_in_twenty_is_similar_enough() {
    let a: String = (0..20).map(|i| format!("line {i}\n")).collect();
    let mut b_lines: Vec<String> = (0..20).map(|i| format!("line {i}")).collect();
    b_lines[10] = "changed".to_string();
    let b = b_lines.join("\n") + "\n";

    let cmp = OutputAnalyzer::new().compare(&a, &b);
    assert!((cmp.similarity - 0.95).abs() < 1e-9);
    // Exactly at the threshold: 0.95 is not `< 0.95`.
    assert!(!cmp.is_different);
}

#[test]
fn length_mismatch_counts_missing_lines_as_different() {
    let cmp = OutputAnalyzer::new().compare("a\nb", "a\nb\nc\nd");
    assert!((cmp.similarity - 0.5).abs() < f64::EPSILON);
    assert!(cmp.is_different);
    assert_eq!(cmp.differences.len(), 2);
}

use std::sync::LazyLock;

use regex::Regex;

use crate::cache::classifier::CacheStrategy;

/// A dynamic-content signal detected in command output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Timestamp,
    ProcessId,
    Counter,
    FileSize,
    IpAddress,
    Port,
    HighChangeKeyword,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::ProcessId => "process-id",
            Self::Counter => "counter",
            Self::FileSize => "file-size",
            Self::IpAddress => "ip-address",
            Self::Port => "port",
            Self::HighChangeKeyword => "high-change-keyword",
        }
    }

    /// Timestamps and PIDs are the strongest volatility signals.
    fn is_strong(&self) -> bool {
        matches!(self, Self::Timestamp | Self::ProcessId)
    }
}

#[derive(Debug, Clone)]
pub struct Indicator {
    pub kind: IndicatorKind,
    /// First matched fragment, for explain/debug output.
    pub sample: String,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub indicators: Vec<Indicator>,
    pub suggested_strategy: CacheStrategy,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct OutputComparison {
    pub is_different: bool,
    pub differences: Vec<String>,
    pub similarity: f64,
}

struct IndicatorFamily {
    kind: IndicatorKind,
    patterns: Vec<Regex>,
}

fn family(kind: IndicatorKind, patterns: &[&str]) -> IndicatorFamily {
    IndicatorFamily {
        kind,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(p).expect("static regex"))
            .collect(),
    }
}

static FAMILIES: LazyLock<Vec<IndicatorFamily>> = LazyLock::new(|| {
    vec![
        family(
            IndicatorKind::HighChangeKeyword,
            &[r"(?i)\b(real-?time|live|currently|updating|running)\b"],
        ),
        family(
            IndicatorKind::Timestamp,
            &[
                // ISO-8601
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}",
                // Unix epoch seconds (2017..2033 range)
                r"\b1[5-9]\d{8}\b",
                // Relative time
                r"\b\d+\s*(seconds?|minutes?|hours?|days?)\s+ago\b",
                // Bare time of day
                r"\b\d{1,2}:\d{2}:\d{2}\b",
            ],
        ),
        family(
            IndicatorKind::ProcessId,
            &[
                r"(?i)\bpid:?\s*\d+",
                r"\[\d{2,}\]",
                // ps-style leading pid column
                r"(?m)^\s*\d{2,}\s+\S",
            ],
        ),
        family(
            IndicatorKind::Counter,
            &[
                r"\b\d+\s+(bytes?|packets?|items?|files?|lines?|requests?)\b",
                r"\b\d+/\d+\b",
            ],
        ),
        family(
            IndicatorKind::FileSize,
            &[r"\b\d+(\.\d+)?\s*(B|KB|MB|GB|TB|KiB|MiB|GiB|TiB)\b"],
        ),
        family(
            IndicatorKind::IpAddress,
            &[
                r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
                r"\b[0-9a-fA-F]{1,4}(:[0-9a-fA-F]{1,4}){3,7}\b",
            ],
        ),
        family(IndicatorKind::Port, &[r"(?i)\bport\s*[:=]?\s*\d{2,5}\b"]),
    ]
});

/// Detects dynamic-content signals in stdout and suggests a cache strategy.
/// Stateless; every method is a pure function of its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputAnalyzer;

impl OutputAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, text: &str) -> AnalysisReport {
        let mut indicators: Vec<Indicator> = Vec::new();
        for fam in FAMILIES.iter() {
            for re in &fam.patterns {
                if let Some(m) = re.find(text) {
                    indicators.push(Indicator {
                        kind: fam.kind,
                        sample: m.as_str().to_string(),
                    });
                    break; // one indicator per family
                }
            }
        }

        let has_keyword = indicators
            .iter()
            .any(|i| i.kind == IndicatorKind::HighChangeKeyword);
        let strong_count = indicators.iter().filter(|i| i.kind.is_strong()).count();
        let total = indicators.len();

        let (suggested_strategy, confidence) = if has_keyword {
            (CacheStrategy::Never, 1.0)
        } else if total >= 2 && strong_count >= 1 {
            (CacheStrategy::Never, 0.95)
        } else if strong_count == 1 {
            (CacheStrategy::Never, 0.9)
        } else if total >= 1 {
            (CacheStrategy::Short, 0.7)
        } else {
            (CacheStrategy::Long, 0.8)
        };

        AnalysisReport {
            indicators,
            suggested_strategy,
            confidence,
        }
    }

    /// Positional line comparison. Similarity is matching lines divided by
    /// the larger line count; outputs differing in fewer than 5% of lines
    /// are considered the same.
    pub fn compare(&self, a: &str, b: &str) -> OutputComparison {
        let lines_a: Vec<&str> = a.lines().collect();
        let lines_b: Vec<&str> = b.lines().collect();
        let max_len = lines_a.len().max(lines_b.len());

        if max_len == 0 {
            return OutputComparison {
                is_different: false,
                differences: Vec::new(),
                similarity: 1.0,
            };
        }

        let mut matching = 0usize;
        let mut differences = Vec::new();
        for i in 0..max_len {
            match (lines_a.get(i), lines_b.get(i)) {
                (Some(la), Some(lb)) if la == lb => matching += 1,
                (la, lb) => {
                    if differences.len() < 10 {
                        differences.push(format!(
                            "line {}: {:?} != {:?}",
                            i + 1,
                            la.unwrap_or(&"<absent>"),
                            lb.unwrap_or(&"<absent>")
                        ));
                    }
                }
            }
        }

        let similarity = matching as f64 / max_len as f64;
        OutputComparison {
            is_different: similarity < 0.95,
            differences,
            similarity,
        }
    }
}

use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::key::normalize_command;
use crate::error::ShellError;

/// Cacheability class assigned to a command. Maps to a TTL and a decision to
/// store results at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStrategy {
    Never,
    Short,
    Medium,
    Long,
    Permanent,
}

impl CacheStrategy {
    /// TTL for this strategy. `None` means the entry never expires
    /// (PERMANENT); NEVER entries are never stored in the first place.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Never => Some(Duration::ZERO),
            Self::Short => Some(Duration::from_secs(30)),
            Self::Medium => Some(Duration::from_secs(5 * 60)),
            Self::Long => Some(Duration::from_secs(60 * 60)),
            Self::Permanent => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Short => "SHORT",
            Self::Medium => "MEDIUM",
            Self::Long => "LONG",
            Self::Permanent => "PERMANENT",
        }
    }
}

/// Rule priority. User-added and learned rules are high; analyzer-inferred
/// rules are low. Built-ins sit between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePriority {
    Low,
    High,
}

#[derive(Debug, Clone)]
pub enum RulePattern {
    /// Matches when the normalized command equals the pattern or starts with
    /// it followed by whitespace (`"git status"` matches `git status -sb`).
    Literal(String),
    Regex(Regex),
}

impl RulePattern {
    pub fn literal(pattern: &str) -> Self {
        Self::Literal(normalize_command(pattern))
    }

    pub fn regex(pattern: &str) -> Result<Self, ShellError> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| ShellError::InvalidPattern(e.to_string()))
    }

    pub fn matches(&self, normalized: &str) -> bool {
        match self {
            Self::Literal(lit) => {
                normalized == lit
                    || normalized
                        .strip_prefix(lit.as_str())
                        .is_some_and(|rest| rest.starts_with(' '))
            }
            Self::Regex(re) => re.is_match(normalized),
        }
    }

    pub fn source_text(&self) -> &str {
        match self {
            Self::Literal(s) => s,
            Self::Regex(re) => re.as_str(),
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Self::Regex(_))
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub pattern: RulePattern,
    pub strategy: CacheStrategy,
    pub reason: String,
}

impl ClassifierRule {
    pub fn new(pattern: RulePattern, strategy: CacheStrategy, reason: impl Into<String>) -> Self {
        Self {
            pattern,
            strategy,
            reason: reason.into(),
        }
    }
}

/// Result of classifying a command.
#[derive(Debug, Clone)]
pub struct Classification {
    pub strategy: CacheStrategy,
    pub ttl: Option<Duration>,
    pub reason: String,
}

fn builtin(pattern: &str, strategy: CacheStrategy, reason: &str) -> ClassifierRule {
    ClassifierRule::new(
        RulePattern::Regex(Regex::new(pattern).expect("static regex")),
        strategy,
        reason,
    )
}

/// Built-in rules, evaluated between high- and low-priority dynamic rules.
/// Order matters: first match wins.
static BUILTIN_RULES: LazyLock<Vec<ClassifierRule>> = LazyLock::new(|| {
    vec![
        builtin(
            r"^(date|uptime|who|w|whoami)\b",
            CacheStrategy::Never,
            "clock/identity output changes between runs",
        ),
        builtin(
            r"^(ps|top|htop)\b",
            CacheStrategy::Never,
            "process listings are inherently volatile",
        ),
        builtin(
            r"^(df|free|netstat|lsof)\b",
            CacheStrategy::Never,
            "resource status changes continuously",
        ),
        builtin(
            r"^git (status|diff|stash list)\b|^git (status|diff)$",
            CacheStrategy::Never,
            "working-tree state changes with every edit",
        ),
        builtin(
            r"^pwd$",
            CacheStrategy::Short,
            "working directory is stable within a session",
        ),
        builtin(
            r"^ls( -[A-Za-z]+)*$",
            CacheStrategy::Short,
            "directory listing without arguments",
        ),
        builtin(
            r"--version\b|\s-V$",
            CacheStrategy::Permanent,
            "version identifiers do not change for an installed binary",
        ),
        builtin(
            r"--help\b|^man\s",
            CacheStrategy::Long,
            "help text only changes on reinstall",
        ),
        builtin(
            r"^(cat|head|tail|wc|file)\s",
            CacheStrategy::Long,
            "file reads change only when the file changes",
        ),
        builtin(
            r"^(which|type)\s",
            CacheStrategy::Long,
            "binary locations rarely change",
        ),
    ]
});

struct RuleSets {
    high: Vec<ClassifierRule>,
    low: Vec<ClassifierRule>,
}

/// Maps command text to a cache strategy by evaluating rules in priority
/// order: high (user/learned) → built-in → low (analyzer-inferred). First
/// match wins; the fallback default is MEDIUM.
pub struct CacheClassifier {
    rules: RwLock<RuleSets>,
}

impl Default for CacheClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheClassifier {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(RuleSets {
                high: Vec::new(),
                low: Vec::new(),
            }),
        }
    }

    pub fn classify(&self, command: &str) -> Classification {
        let normalized = normalize_command(command);
        let sets = self.rules.read().expect("classifier lock poisoned");

        for rule in sets
            .high
            .iter()
            .chain(BUILTIN_RULES.iter())
            .chain(sets.low.iter())
        {
            if rule.pattern.matches(&normalized) {
                return Classification {
                    strategy: rule.strategy,
                    ttl: rule.strategy.ttl(),
                    reason: rule.reason.clone(),
                };
            }
        }

        Classification {
            strategy: CacheStrategy::Medium,
            ttl: CacheStrategy::Medium.ttl(),
            reason: "no matching rule; default strategy".to_string(),
        }
    }

    /// Shorthand for `classify(cmd).strategy != NEVER`.
    pub fn should_cache(&self, command: &str) -> bool {
        self.classify(command).strategy != CacheStrategy::Never
    }

    /// Add a dynamic rule. Equal-priority ties break by insertion order.
    pub fn add_rule(&self, rule: ClassifierRule, priority: RulePriority) {
        let mut sets = self.rules.write().expect("classifier lock poisoned");
        match priority {
            RulePriority::High => sets.high.push(rule),
            RulePriority::Low => sets.low.push(rule),
        }
    }

    /// Remove dynamic rules whose pattern text matches exactly. Returns the
    /// number removed. Built-ins cannot be removed.
    pub fn remove_rule(&self, pattern: &str, is_regex: bool) -> usize {
        let mut sets = self.rules.write().expect("classifier lock poisoned");
        let before = sets.high.len() + sets.low.len();
        let keep = |r: &ClassifierRule| {
            !(r.pattern.is_regex() == is_regex && r.pattern.source_text() == pattern)
        };
        sets.high.retain(&keep);
        sets.low.retain(&keep);
        before - (sets.high.len() + sets.low.len())
    }

    pub fn dynamic_rule_count(&self) -> (usize, usize) {
        let sets = self.rules.read().expect("classifier lock poisoned");
        (sets.high.len(), sets.low.len())
    }

    /// Human-readable explanation of how a command would be classified.
    pub fn explain(&self, command: &str) -> String {
        let classification = self.classify(command);
        let ttl_text = match classification.ttl {
            Some(ttl) if ttl.is_zero() => "never cached".to_string(),
            Some(ttl) => format!("cached for {}s", ttl.as_secs()),
            None => "cached permanently".to_string(),
        };
        format!(
            "{} → {} ({}): {}",
            normalize_command(command),
            classification.strategy.as_str(),
            ttl_text,
            classification.reason
        )
    }
}

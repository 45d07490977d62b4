use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::key::result_fingerprint;

/// Sliding window of result fingerprints kept per command key.
const WINDOW: usize = 5;

/// Identical results needed inside the span to call a command duplicated.
const DUPLICATE_THRESHOLD: usize = 3;

/// Default span within which repeats count as duplicates.
const DEFAULT_SPAN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Fingerprint {
    digest: String,
    seen_at: Instant,
}

/// Emitted when a command keeps producing byte-identical results. The
/// enhancer reacts by learning a NEVER rule and evicting the cache key.
#[derive(Debug, Clone)]
pub struct DuplicateReport {
    pub command: String,
    pub duplicate_count: usize,
    pub time_span: Duration,
}

/// Tracks recent result fingerprints per command and reports commands whose
/// output repeats verbatim: evidence that caching them is pointless or that
/// a cached value has gone stale.
pub struct DuplicateDetector {
    span: Duration,
    history: Mutex<HashMap<String, VecDeque<Fingerprint>>>,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::with_span(DEFAULT_SPAN)
    }

    pub fn with_span(span: Duration) -> Self {
        Self {
            span,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record a fresh execution result. Returns a report when at least
    /// three of the last five fingerprints are identical within the span.
    pub fn record(&self, command: &str, stdout: &str, exit_code: i32) -> Option<DuplicateReport> {
        let digest = result_fingerprint(stdout, exit_code);
        let now = Instant::now();

        let mut history = self.history.lock().expect("detector lock poisoned");
        let window = history.entry(command.to_string()).or_default();

        window.push_back(Fingerprint {
            digest: digest.clone(),
            seen_at: now,
        });
        while window.len() > WINDOW {
            window.pop_front();
        }

        let matches: Vec<&Fingerprint> = window
            .iter()
            .filter(|f| f.digest == digest && now.duration_since(f.seen_at) <= self.span)
            .collect();

        if matches.len() >= DUPLICATE_THRESHOLD {
            let oldest = matches
                .iter()
                .map(|f| f.seen_at)
                .min()
                .unwrap_or(now);
            let report = DuplicateReport {
                command: command.to_string(),
                duplicate_count: matches.len(),
                time_span: now.duration_since(oldest),
            };
            // Reset so one burst produces one report, not one per repeat.
            window.clear();
            return Some(report);
        }

        None
    }

    /// Forget history for a command (used after a rule is learned).
    pub fn forget(&self, command: &str) {
        self.history
            .lock()
            .expect("detector lock poisoned")
            .remove(command);
    }

    pub fn tracked_commands(&self) -> usize {
        self.history.lock().expect("detector lock poisoned").len()
    }
}

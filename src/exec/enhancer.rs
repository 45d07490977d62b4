use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cache::classifier::{
    CacheClassifier, CacheStrategy, ClassifierRule, RulePattern, RulePriority,
};
use crate::cache::analyzer::OutputAnalyzer;
use crate::cache::dedup::Deduplicator;
use crate::cache::detector::DuplicateDetector;
use crate::cache::key::normalize_command;
use crate::cache::learning::{LearnedRule, LearningStore, RuleSource};
use crate::cache::result_cache::ResultCache;
use crate::events::{EventBus, LearningEvent, ShellEvent};
use crate::exec::retry::{ErrorHandler, FailureContext};
use crate::exec::truncate::{truncate_output, TruncationInfo, DEFAULT_MAX_OUTPUT_LINES};
use crate::exec::{CommandExecutor, CommandResult, ExecRequest, DEFAULT_TIMEOUT};

/// Outer bound on attempts regardless of error class.
const MAX_ATTEMPTS: u32 = 3;

/// Analyzer confidence needed before a fresh output registers an
/// (unpersisted) low-priority NEVER rule.
const ANALYZER_RULE_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub max_output_lines: usize,
    pub env: HashMap<String, String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            env: HashMap::new(),
        }
    }
}

/// Failure summary attached to unsuccessful results. The taxonomy code is
/// always present; stderr has already been length-capped upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: &'static str,
    pub suggestion: String,
    pub recoverable: bool,
}

/// What a foreground command returns to the tool layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedResult {
    #[serde(flatten)]
    pub result: CommandResult,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<TruncationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Orchestrates the optimization core around the raw executor: cache lookup,
/// dedup, retry/correction, cache population, duplicate learning, and output
/// analysis.
#[derive(Clone)]
pub struct CommandEnhancer {
    classifier: Arc<CacheClassifier>,
    cache: Arc<ResultCache>,
    dedup: Arc<Deduplicator>,
    detector: Arc<DuplicateDetector>,
    analyzer: OutputAnalyzer,
    errors: ErrorHandler,
    learning: Arc<LearningStore>,
    executor: Arc<dyn CommandExecutor>,
    events: EventBus,
}

impl CommandEnhancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: Arc<CacheClassifier>,
        cache: Arc<ResultCache>,
        dedup: Arc<Deduplicator>,
        detector: Arc<DuplicateDetector>,
        learning: Arc<LearningStore>,
        executor: Arc<dyn CommandExecutor>,
        events: EventBus,
    ) -> Self {
        Self {
            classifier,
            cache,
            dedup,
            detector,
            analyzer: OutputAnalyzer::new(),
            errors: ErrorHandler::new(),
            learning,
            executor,
            events,
        }
    }

    /// Run a foreground command through the full pipeline.
    pub async fn execute(&self, command: &str, cwd: &str, opts: &ExecOptions) -> EnhancedResult {
        if let Some(hit) = self.cache.get(command, cwd) {
            let result = CommandResult {
                stdout: hit.stdout,
                stderr: hit.stderr,
                exit_code: hit.exit_code,
                success: hit.exit_code == 0,
                timed_out: false,
                duration_ms: 0,
            };
            return self.finish(command, result, true, opts);
        }

        let this = self.clone();
        let owned_command = command.to_string();
        let owned_cwd = cwd.to_string();
        let owned_opts = opts.clone();
        let result = self
            .dedup
            .execute(command, cwd, move || {
                this.run_and_learn(owned_command, owned_cwd, owned_opts)
            })
            .await;

        self.finish(command, result, false, opts)
    }

    /// The deduplicated unit of work: retry loop plus the post-success side
    /// effects (cache set, duplicate detection, output analysis). Running
    /// these inside the shared execution keeps them at-most-once per real
    /// run; callers attached via dedup must not feed the detector again.
    async fn run_and_learn(
        self,
        command: String,
        cwd: String,
        opts: ExecOptions,
    ) -> CommandResult {
        let (final_command, result) = self.run_with_retry(&command, &cwd, &opts).await;

        if result.success {
            self.cache.set(
                &final_command,
                &cwd,
                &result.stdout,
                &result.stderr,
                result.exit_code,
            );

            if let Some(report) =
                self.detector
                    .record(&final_command, &result.stdout, result.exit_code)
            {
                self.learn_never_rule(&final_command, &cwd, &report);
            }

            let analysis = self.analyzer.analyze(&result.stdout);
            if analysis.suggested_strategy == CacheStrategy::Never
                && analysis.confidence >= ANALYZER_RULE_CONFIDENCE
            {
                // Provisional: lives only until the duplicate detector
                // confirms it, so it is not persisted.
                self.classifier.add_rule(
                    ClassifierRule::new(
                        RulePattern::literal(&final_command),
                        CacheStrategy::Never,
                        "output carries dynamic-content indicators",
                    ),
                    RulePriority::Low,
                );
            }
        }

        result
    }

    fn learn_never_rule(
        &self,
        command: &str,
        cwd: &str,
        report: &crate::cache::detector::DuplicateReport,
    ) {
        let pattern = normalize_command(command);
        let reason = format!(
            "produced identical output {} times within {}ms",
            report.duplicate_count,
            report.time_span.as_millis()
        );
        tracing::info!(command = %pattern, "learning NEVER rule from duplicate output");

        self.classifier.add_rule(
            ClassifierRule::new(
                RulePattern::literal(&pattern),
                CacheStrategy::Never,
                reason.clone(),
            ),
            RulePriority::High,
        );
        self.learning.save_rule(LearnedRule::new(
            pattern,
            false,
            CacheStrategy::Never,
            reason,
            RuleSource::AutoDetect,
        ));
        self.cache.clear_command(command, Some(cwd));
        self.detector.forget(command);

        self.events
            .emit(ShellEvent::Learning(LearningEvent::DuplicateDetected {
                command: report.command.clone(),
                duplicate_count: report.duplicate_count,
                time_span_ms: report.time_span.as_millis() as u64,
            }));
    }

    /// Up to three attempts. Error-handler decisions drive delays and
    /// command corrections; a corrected command replaces the original
    /// verbatim for subsequent attempts (and for the cache key).
    async fn run_with_retry(
        &self,
        command: &str,
        cwd: &str,
        opts: &ExecOptions,
    ) -> (String, CommandResult) {
        let mut current = command.to_string();
        let mut attempt: u32 = 1;

        loop {
            let req = ExecRequest {
                command: current.clone(),
                cwd: cwd.to_string(),
                env: opts.env.clone(),
                timeout: opts.timeout,
            };
            let result = self.executor.run(&req).await;

            if result.success {
                return (current, result);
            }

            let decision = self.errors.handle(
                &result,
                &FailureContext {
                    command: &current,
                    cwd,
                    attempt,
                },
            );

            if !decision.should_retry || attempt >= MAX_ATTEMPTS {
                return (current, result);
            }

            tracing::debug!(
                command = %current,
                category = decision.category.as_str(),
                attempt,
                "retrying after failure"
            );

            if let Some(corrected) = decision.corrected_command {
                current = corrected;
            }
            if let Some(delay) = decision.delay {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    /// Uniform post-processing for fresh and cached results: truncation
    /// rules on stdout and a structured error report on failure.
    fn finish(
        &self,
        command: &str,
        mut result: CommandResult,
        cached: bool,
        opts: &ExecOptions,
    ) -> EnhancedResult {
        let (stdout, truncation) = truncate_output(&result.stdout, opts.max_output_lines);
        result.stdout = stdout;
        let (stderr, _) = truncate_output(&result.stderr, opts.max_output_lines);
        result.stderr = stderr;

        let error = if result.success {
            None
        } else {
            // Reconstructed deterministically from the final result, so
            // dedup-attached callers report the same taxonomy as the leader.
            let decision = self.errors.handle(
                &result,
                &FailureContext {
                    command,
                    cwd: "",
                    attempt: MAX_ATTEMPTS,
                },
            );
            Some(ErrorReport {
                code: decision.category.as_str(),
                suggestion: decision.suggestion,
                recoverable: decision.recoverable,
            })
        };

        EnhancedResult {
            result,
            cached,
            truncation,
            error,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    pub fn learning(&self) -> &Arc<LearningStore> {
        &self.learning
    }

    pub fn classifier(&self) -> &Arc<CacheClassifier> {
        &self.classifier
    }
}

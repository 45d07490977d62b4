use std::time::Duration;

use serde::Serialize;

use crate::cache::key::base_command;
use crate::exec::CommandResult;

/// Error taxonomy for failed executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    CommandNotFound,
    PermissionDenied,
    Timeout,
    NetworkError,
    ResourceLimit,
    ExecutionError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandNotFound => "COMMAND_NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ResourceLimit => "RESOURCE_LIMIT",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// What the retry loop should do about a failure.
#[derive(Debug, Clone)]
pub struct ErrorDecision {
    pub category: ErrorCategory,
    pub should_retry: bool,
    /// Replacement command for the next attempt (and its cache key).
    pub corrected_command: Option<String>,
    pub delay: Option<Duration>,
    pub suggestion: String,
    pub recoverable: bool,
}

/// Context for a failure under consideration.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub command: &'a str,
    pub cwd: &'a str,
    /// 1-based attempt number of the attempt that just failed.
    pub attempt: u32,
}

/// Common misspellings of interpreter names worth one corrected retry.
const ALIAS_CORRECTIONS: &[(&str, &str)] = &[("python", "python3"), ("pip", "pip3")];

/// Classifies failed executions and proposes retry, correction, or delay.
/// Stateless; the enhancer's retry loop owns the attempt budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorHandler;

impl ErrorHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, result: &CommandResult) -> ErrorCategory {
        if result.timed_out {
            return ErrorCategory::Timeout;
        }
        let stderr = result.stderr.to_lowercase();

        if result.exit_code == 127 || stderr.contains("command not found") {
            return ErrorCategory::CommandNotFound;
        }
        if result.exit_code == 126
            || stderr.contains("permission denied")
            || stderr.contains("operation not permitted")
        {
            return ErrorCategory::PermissionDenied;
        }
        if stderr.contains("connection refused")
            || stderr.contains("could not resolve")
            || stderr.contains("name or service not known")
            || stderr.contains("network is unreachable")
            || stderr.contains("connection timed out")
        {
            return ErrorCategory::NetworkError;
        }
        if stderr.contains("cannot allocate memory")
            || stderr.contains("too many open files")
            || stderr.contains("resource temporarily unavailable")
            || stderr.contains("no space left on device")
        {
            return ErrorCategory::ResourceLimit;
        }
        if result.exit_code > 0 {
            return ErrorCategory::ExecutionError;
        }
        ErrorCategory::Unknown
    }

    pub fn handle(&self, result: &CommandResult, ctx: &FailureContext) -> ErrorDecision {
        let category = self.classify(result);
        match category {
            ErrorCategory::CommandNotFound => {
                let base = base_command(ctx.command);
                let correction = ALIAS_CORRECTIONS
                    .iter()
                    .find(|(from, _)| *from == base)
                    .map(|&(from, to)| ctx.command.replacen(from, to, 1));
                match correction {
                    // One corrected retry; the class itself is not recoverable.
                    Some(corrected) if ctx.attempt == 1 => ErrorDecision {
                        category,
                        should_retry: true,
                        suggestion: format!("'{base}' not found; trying '{corrected}'"),
                        corrected_command: Some(corrected),
                        delay: None,
                        recoverable: false,
                    },
                    _ => ErrorDecision {
                        category,
                        should_retry: false,
                        corrected_command: None,
                        delay: None,
                        suggestion: format!("'{base}' is not installed or not on PATH"),
                        recoverable: false,
                    },
                }
            }
            ErrorCategory::PermissionDenied => ErrorDecision {
                category,
                should_retry: false,
                corrected_command: None,
                delay: None,
                suggestion: "permission denied; the operation may need elevated privileges"
                    .to_string(),
                recoverable: false,
            },
            ErrorCategory::Timeout => ErrorDecision {
                category,
                should_retry: ctx.attempt <= 2,
                corrected_command: None,
                delay: Some(Duration::from_millis(1000)),
                suggestion: "command timed out; consider raising timeout_ms".to_string(),
                recoverable: true,
            },
            ErrorCategory::NetworkError => ErrorDecision {
                category,
                should_retry: ctx.attempt < 3,
                corrected_command: None,
                // Exponential backoff: 1s, 2s, 4s…
                delay: Some(Duration::from_millis(
                    1000u64.saturating_mul(1 << (ctx.attempt.saturating_sub(1)).min(6)),
                )),
                suggestion: "network error; retrying with backoff".to_string(),
                recoverable: true,
            },
            ErrorCategory::ResourceLimit => ErrorDecision {
                category,
                should_retry: ctx.attempt <= 2,
                corrected_command: None,
                delay: Some(Duration::from_millis(5000)),
                suggestion: "resource limit hit; waiting before retry".to_string(),
                recoverable: true,
            },
            ErrorCategory::ExecutionError => ErrorDecision {
                category,
                should_retry: false,
                corrected_command: None,
                delay: None,
                suggestion: format!("command exited with code {}", result.exit_code),
                recoverable: false,
            },
            ErrorCategory::Unknown => ErrorDecision {
                category,
                should_retry: false,
                corrected_command: None,
                delay: None,
                suggestion: "command failed".to_string(),
                recoverable: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(exit_code: i32, stderr: &str) -> CommandResult {
        CommandResult {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
            success: false,
            timed_out: false,
            duration_ms: 5,
        }
    }

    #[test]
    fn exit_127_is_command_not_found() {
        let h = ErrorHandler::new();
        assert_eq!(
            h.classify(&failed(127, "")),
            ErrorCategory::CommandNotFound
        );
        assert_eq!(
            h.classify(&failed(1, "sh: python: command not found")),
            ErrorCategory::CommandNotFound
        );
    }

    #[test]
    fn python_gets_alias_correction_once() {
        let h = ErrorHandler::new();
        let result = failed(127, "sh: python: command not found");
        let ctx = FailureContext {
            command: "python script.py",
            cwd: "/tmp",
            attempt: 1,
        };
        let decision = h.handle(&result, &ctx);
        assert!(decision.should_retry);
        assert_eq!(
            decision.corrected_command.as_deref(),
            Some("python3 script.py")
        );

        // Second attempt: no further correction.
        let ctx2 = FailureContext { attempt: 2, ..ctx };
        assert!(!h.handle(&result, &ctx2).should_retry);
    }

    #[test]
    fn permission_denied_never_retries() {
        let h = ErrorHandler::new();
        let decision = h.handle(
            &failed(126, "Permission denied"),
            &FailureContext {
                command: "./script.sh",
                cwd: "/",
                attempt: 1,
            },
        );
        assert_eq!(decision.category, ErrorCategory::PermissionDenied);
        assert!(!decision.should_retry);
        assert!(decision.suggestion.contains("elevated"));
    }

    #[test]
    fn timeout_retries_twice_with_fixed_delay() {
        let h = ErrorHandler::new();
        let timed_out = CommandResult {
            timed_out: true,
            ..failed(-1, "")
        };
        let ctx = |attempt| FailureContext {
            command: "sleep 100",
            cwd: "/",
            attempt,
        };
        assert!(h.handle(&timed_out, &ctx(1)).should_retry);
        assert!(h.handle(&timed_out, &ctx(2)).should_retry);
        assert!(!h.handle(&timed_out, &ctx(3)).should_retry);
        assert_eq!(
            h.handle(&timed_out, &ctx(1)).delay,
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn network_backoff_doubles() {
        let h = ErrorHandler::new();
        let result = failed(1, "curl: (7) Connection refused");
        let ctx = |attempt| FailureContext {
            command: "curl localhost:9",
            cwd: "/",
            attempt,
        };
        assert_eq!(
            h.handle(&result, &ctx(1)).delay,
            Some(Duration::from_millis(1000))
        );
        assert_eq!(
            h.handle(&result, &ctx(2)).delay,
            Some(Duration::from_millis(2000))
        );
        assert!(!h.handle(&result, &ctx(3)).should_retry);
    }

    #[test]
    fn plain_failure_is_execution_error() {
        let h = ErrorHandler::new();
        assert_eq!(
            h.classify(&failed(2, "grep: no matches")),
            ErrorCategory::ExecutionError
        );
    }
}

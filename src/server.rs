use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};

use crate::cache::classifier::{
    CacheClassifier, CacheStrategy, ClassifierRule, RulePattern, RulePriority,
};
use crate::cache::dedup::Deduplicator;
use crate::cache::detector::DuplicateDetector;
use crate::cache::learning::{LearnedRule, LearningStore, RuleSource};
use crate::cache::result_cache::ResultCache;
use crate::config::Config;
use crate::error::ShellError;
use crate::events::EventBus;
use crate::exec::enhancer::{CommandEnhancer, ExecOptions};
use crate::exec::ShellExecutor;
use crate::process::manager::{ProcessManager, ProcessSignal};
use crate::process::resources::ResourceSampler;
use crate::response::{ShellMetadata, ShellToolResponse};
use crate::session::{HistoryEntry, SessionManager};
use crate::tools::cache::{
    CacheClearCommandRequest, CacheClearPatternRequest, CacheExplainRequest,
    CacheMarkNeverRequest,
};
use crate::tools::command::RunCommandRequest;
use crate::tools::process::{
    KillProcessRequest, ListProcessesRequest, ProcessOutputRequest, RunBackgroundRequest,
};
use crate::tools::session::{CreateSessionRequest, DeleteSessionRequest, SessionHistoryRequest};

/// Longest a process_output call may block waiting for new lines.
const MAX_WAIT_MS: u64 = 30_000;

#[derive(Clone)]
pub struct SiroccoServer {
    config: Config,
    enhancer: CommandEnhancer,
    sessions: Arc<SessionManager>,
    processes: Arc<ProcessManager>,
    learning: Arc<LearningStore>,
    classifier: Arc<CacheClassifier>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl SiroccoServer {
    pub fn new(config: Config) -> Self {
        let events = EventBus::new();
        let classifier = Arc::new(CacheClassifier::new());
        let cache = Arc::new(ResultCache::new(
            classifier.clone(),
            events.clone(),
            config.cache_enabled,
        ));
        let dedup = Arc::new(Deduplicator::new(events.clone()));
        dedup.clone().spawn_sweeper();
        let detector = Arc::new(DuplicateDetector::new());
        let learning = Arc::new(LearningStore::new(config.rules_path.clone()));
        let executor = Arc::new(ShellExecutor::new());
        let enhancer = CommandEnhancer::new(
            classifier.clone(),
            cache,
            dedup,
            detector,
            learning.clone(),
            executor,
            events.clone(),
        );

        let sampler = Arc::new(ResourceSampler::default());
        let processes = Arc::new(ProcessManager::new(
            config.processes_dir(),
            sampler,
            events.clone(),
        ));
        processes.clone().spawn_resource_monitor();

        let sessions = Arc::new(SessionManager::new(config.sessions_dir()));

        Self {
            config,
            enhancer,
            sessions,
            processes,
            learning,
            classifier,
            tool_router: Self::tool_router(),
        }
    }

    /// One-way init: the learning store publishes persisted rules into the
    /// classifier; sessions and process records come back from disk.
    pub async fn initialize(&self) {
        self.learning.initialize(&self.classifier).await;
        self.sessions.initialize().await;
        self.processes.load().await;
    }

    #[tool(
        name = "run_command",
        description = "Execute a shell command in a named session with preserved cwd and env. Results are cached, deduplicated, and retried per the command's classification; the response carries a `cached` flag and optional `truncation` metadata."
    )]
    async fn run_command(
        &self,
        Parameters(req): Parameters<RunCommandRequest>,
    ) -> Result<CallToolResult, McpError> {
        if req.command.trim().is_empty() {
            return Err(McpError::invalid_params("command must not be empty", None));
        }
        let start = Instant::now();
        let session = req.session_or_default().to_string();

        let Some((session_cwd, env)) = self.sessions.exec_context(&session) else {
            return Err(McpError::invalid_params(
                format!("session not found: {session}"),
                None,
            ));
        };
        let cwd = req.cwd.clone().unwrap_or(session_cwd);

        let mut opts = ExecOptions {
            env,
            ..ExecOptions::default()
        };
        if let Some(ms) = req.clamped_timeout_ms() {
            opts.timeout = Duration::from_millis(ms);
        }
        if let Some(lines) = req.max_output_lines {
            opts.max_output_lines = lines;
        }

        let result = self.enhancer.execute(&req.command, &cwd, &opts).await;

        let history = HistoryEntry {
            command: req.command.clone(),
            args: Vec::new(),
            exit_code: result.result.exit_code,
            stdout: result.result.stdout.clone(),
            stderr: result.result.stderr.clone(),
            start_time: chrono::Utc::now(),
            duration_ms: result.result.duration_ms,
        };
        if let Err(e) = self.sessions.add_to_history(&session, history) {
            tracing::warn!("history append failed: {e}");
        }

        let json = serde_json::to_string(&result)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let response = ShellToolResponse::success(
            json,
            ShellMetadata {
                tool_name: "run_command".to_string(),
                session,
                duration_seconds: start.elapsed().as_secs_f64(),
            },
        );
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "run_background",
        description = "Spawn a long-running process in the background. Output is captured line-by-line into a ring buffer readable with `process_output`; resources are sampled periodically.",
        annotations(destructive_hint = true)
    )]
    async fn run_background(
        &self,
        Parameters(req): Parameters<RunBackgroundRequest>,
    ) -> Result<CallToolResult, McpError> {
        if req.command.trim().is_empty() {
            return Err(McpError::invalid_params("command must not be empty", None));
        }
        let start = Instant::now();
        let session = req
            .session
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(crate::session::DEFAULT_SESSION)
            .to_string();

        let Some(session_info) = self.sessions.resolve(&session) else {
            return Err(McpError::invalid_params(
                format!("session not found: {session}"),
                None,
            ));
        };
        let (session_cwd, env) = self
            .sessions
            .exec_context(&session)
            .expect("session resolved above");
        let cwd = req.cwd.clone().unwrap_or(session_cwd);
        let args = req.args.clone().unwrap_or_default();

        let response = match self
            .processes
            .spawn(&session_info.id, &req.command, &args, &cwd, &env)
            .await
        {
            Ok(id) => {
                let info = self.processes.get_info(&id);
                let payload = serde_json::json!({
                    "processId": id,
                    "status": info.map(|i| i.status),
                });
                ShellToolResponse::success(
                    payload.to_string(),
                    self.metadata("run_background", &session, start),
                )
            }
            Err(e) => {
                tracing::warn!("background spawn failed: {e}");
                ShellToolResponse::error(
                    e.user_message(),
                    self.metadata("run_background", &session, start),
                )
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "process_output",
        description = "Read captured output lines from a background process. With `wait_ms`, blocks until lines newer than `after_line` arrive or the wait times out (returning empty).",
        annotations(read_only_hint = true)
    )]
    async fn process_output(
        &self,
        Parameters(req): Parameters<ProcessOutputRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let Some(buffer) = self.processes.get_buffer(&req.process_id) else {
            return Err(McpError::invalid_params(
                format!("process not found: {}", req.process_id),
                None,
            ));
        };

        let after = req.after_line.unwrap_or(0);
        let lines = match req.wait_ms {
            Some(wait_ms) if buffer.total_lines() <= after => {
                let wait = Duration::from_millis(wait_ms.min(MAX_WAIT_MS));
                buffer.wait_for_lines(after, wait).await
            }
            _ => buffer.get_lines(req.count, Some(after)),
        };
        let lines = match req.count {
            Some(count) if lines.len() > count => lines[lines.len() - count..].to_vec(),
            _ => lines,
        };

        let status = self.processes.get_info(&req.process_id).map(|i| i.status);
        let payload = serde_json::json!({
            "lines": lines,
            "totalLines": buffer.total_lines(),
            "bufferSize": buffer.buffer_size(),
            "status": status,
        });
        let response = ShellToolResponse::success(
            payload.to_string(),
            self.metadata("process_output", "none", start),
        );
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "list_processes",
        description = "List background processes with status and latest resource samples, optionally filtered by session.",
        annotations(read_only_hint = true)
    )]
    async fn list_processes(
        &self,
        Parameters(req): Parameters<ListProcessesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let session_id = match req.session.as_deref() {
            Some(s) => match self.sessions.resolve(s) {
                Some(info) => Some(info.id),
                None => {
                    return Err(McpError::invalid_params(
                        format!("session not found: {s}"),
                        None,
                    ))
                }
            },
            None => None,
        };
        let infos = self.processes.list(session_id.as_deref());
        let json = serde_json::to_string(&infos)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let response =
            ShellToolResponse::success(json, self.metadata("list_processes", "none", start));
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "kill_process",
        description = "Send SIGTERM (default) or SIGKILL to a background process. The record lingers briefly so final output can still be read.",
        annotations(destructive_hint = true)
    )]
    async fn kill_process(
        &self,
        Parameters(req): Parameters<KillProcessRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let signal = req.signal.unwrap_or(ProcessSignal::Term);
        let response = match self.processes.kill(&req.process_id, signal) {
            Ok(info) => {
                let payload = serde_json::json!({
                    "success": true,
                    "processId": info.id,
                    "status": info.status,
                });
                ShellToolResponse::success(
                    payload.to_string(),
                    self.metadata("kill_process", "none", start),
                )
            }
            Err(e) => ShellToolResponse::error(
                e.user_message(),
                self.metadata("kill_process", "none", start),
            ),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "create_session",
        description = "Create a named session with its own working directory, environment, and command history."
    )]
    async fn create_session(
        &self,
        Parameters(req): Parameters<CreateSessionRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self
            .sessions
            .create_session(&req.name, req.cwd.clone(), req.env.clone())
        {
            Ok(info) => {
                let json = serde_json::to_string(&info)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                ShellToolResponse::success(json, self.metadata("create_session", &req.name, start))
            }
            Err(e) => ShellToolResponse::error(
                e.user_message(),
                self.metadata("create_session", &req.name, start),
            ),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "list_sessions",
        description = "List sessions with cwd, history length, and last-used time.",
        annotations(read_only_hint = true)
    )]
    async fn list_sessions(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let json = serde_json::to_string(&self.sessions.list())
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let response =
            ShellToolResponse::success(json, self.metadata("list_sessions", "none", start));
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "delete_session",
        description = "Delete a session, killing its background processes and removing its persisted state. The default session is refused.",
        annotations(destructive_hint = true)
    )]
    async fn delete_session(
        &self,
        Parameters(req): Parameters<DeleteSessionRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self
            .sessions
            .delete_session(&req.session, &self.processes)
            .await
        {
            Ok(()) => ShellToolResponse::success(
                serde_json::json!({"success": true}).to_string(),
                self.metadata("delete_session", &req.session, start),
            ),
            Err(e) => ShellToolResponse::error(
                e.user_message(),
                self.metadata("delete_session", &req.session, start),
            ),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "session_history",
        description = "Read a session's recent command history.",
        annotations(read_only_hint = true)
    )]
    async fn session_history(
        &self,
        Parameters(req): Parameters<SessionHistoryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        if self.sessions.resolve(&req.session).is_none() {
            return Err(McpError::invalid_params(
                format!("session not found: {}", req.session),
                None,
            ));
        }
        let history = self.sessions.history(&req.session, req.limit);
        let json = serde_json::to_string(&history)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        let response =
            ShellToolResponse::success(json, self.metadata("session_history", &req.session, start));
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cache_clear_command",
        description = "Drop cached results for one command, optionally scoped to a working directory."
    )]
    async fn cache_clear_command(
        &self,
        Parameters(req): Parameters<CacheClearCommandRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let cleared = self
            .enhancer
            .cache()
            .clear_command(&req.command, req.cwd.as_deref());
        let payload = serde_json::json!({
            "success": true,
            "clearedCount": cleared,
            "command": req.command,
            "cwd": req.cwd,
        });
        let response = ShellToolResponse::success(
            payload.to_string(),
            self.metadata("cache_clear_command", "none", start),
        );
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cache_clear_pattern",
        description = "Drop cached results for every command matching a regex."
    )]
    async fn cache_clear_pattern(
        &self,
        Parameters(req): Parameters<CacheClearPatternRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.enhancer.cache().clear_pattern(&req.pattern) {
            Ok(cleared) => {
                let payload = serde_json::json!({
                    "success": true,
                    "clearedCount": cleared,
                    "pattern": req.pattern,
                });
                ShellToolResponse::success(
                    payload.to_string(),
                    self.metadata("cache_clear_pattern", "none", start),
                )
            }
            Err(e @ ShellError::InvalidPattern(_)) => {
                return Err(McpError::invalid_params(e.to_string(), None));
            }
            Err(e) => ShellToolResponse::error(
                e.user_message(),
                self.metadata("cache_clear_pattern", "none", start),
            ),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cache_mark_never",
        description = "Permanently mark a command (or regex) as never cacheable. The rule takes effect immediately and persists across restarts."
    )]
    async fn cache_mark_never(
        &self,
        Parameters(req): Parameters<CacheMarkNeverRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let reason = req
            .reason
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "marked never-cache by user".to_string());

        let pattern = if req.is_pattern {
            RulePattern::regex(&req.command)
                .map_err(|e| McpError::invalid_params(e.to_string(), None))?
        } else {
            RulePattern::literal(&req.command)
        };
        self.classifier.add_rule(
            ClassifierRule::new(pattern, CacheStrategy::Never, reason.clone()),
            RulePriority::High,
        );
        self.learning.save_rule(LearnedRule::new(
            crate::cache::key::normalize_command(&req.command),
            req.is_pattern,
            CacheStrategy::Never,
            reason,
            RuleSource::User,
        ));
        // Explicit user action: make it durable now rather than debounced.
        self.learning.flush().await;

        let cleared = self.enhancer.cache().clear_command(&req.command, None);
        let payload = serde_json::json!({
            "success": true,
            "command": req.command,
            "isPattern": req.is_pattern,
            "clearedCount": cleared,
        });
        let response = ShellToolResponse::success(
            payload.to_string(),
            self.metadata("cache_mark_never", "none", start),
        );
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cache_stats",
        description = "Cache, dedup, and learning statistics, including the TTL table and whether caching is enabled.",
        annotations(read_only_hint = true)
    )]
    async fn cache_stats(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let payload = serde_json::json!({
            "cache": self.enhancer.cache().stats(),
            "dedup": self.enhancer.dedup().stats(),
            "learning": self.learning.stats(),
            "cacheEnabled": self.config.cache_enabled,
        });
        let response = ShellToolResponse::success(
            payload.to_string(),
            self.metadata("cache_stats", "none", start),
        );
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cache_explain",
        description = "Explain how a command would be classified for caching and whether its results will be stored.",
        annotations(read_only_hint = true)
    )]
    async fn cache_explain(
        &self,
        Parameters(req): Parameters<CacheExplainRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let classification = self.classifier.classify(&req.command);
        let payload = serde_json::json!({
            "command": req.command,
            "explanation": self.classifier.explain(&req.command),
            "classification": classification.strategy.as_str(),
            "willBeCached": self.config.cache_enabled
                && classification.strategy != CacheStrategy::Never,
        });
        let response = ShellToolResponse::success(
            payload.to_string(),
            self.metadata("cache_explain", "none", start),
        );
        Ok(response.into_call_tool_result())
    }

    fn metadata(&self, tool: &str, session: &str, start: Instant) -> ShellMetadata {
        ShellMetadata {
            tool_name: tool.to_string(),
            session: session.to_string(),
            duration_seconds: start.elapsed().as_secs_f64(),
        }
    }
}

#[tool_handler]
impl ServerHandler for SiroccoServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "sirocco".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Sirocco: persistent shell execution with caching, dedup, and background processes.\n\n\
                 Foreground commands:\n\
                 - `run_command`: execute in a named session (cwd/env/history preserved). Identical \
                 commands issued close together share one execution; cacheable commands return cached \
                 results (see the `cached` flag). Long output is truncated head+tail with a marker.\n\n\
                 Background processes:\n\
                 - `run_background`: spawn a long-running process; output goes to a ring buffer.\n\
                 - `process_output`: read buffered lines; pass `after_line` + `wait_ms` to tail.\n\
                 - `list_processes` / `kill_process`: inspect and stop processes.\n\n\
                 Sessions:\n\
                 - `create_session` / `list_sessions` / `delete_session` / `session_history`. The \
                 `default` session always exists and cannot be deleted.\n\n\
                 Cache control:\n\
                 - `cache_explain` before relying on freshness; `cache_clear_command` or \
                 `cache_clear_pattern` after changing state outside the shell; `cache_mark_never` for \
                 commands whose output must always be fresh (persisted across restarts); \
                 `cache_stats` for hit rates and learned-rule counts.\n\
                 Set MCP_DISABLE_CACHE=true to disable result caching entirely."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

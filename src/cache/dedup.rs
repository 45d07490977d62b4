use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
// tokio's Instant so tests can drive window expiry with a paused clock.
use tokio::time::Instant;

use crate::cache::key::{base_command, command_key, normalize_command};
use crate::events::{DedupEvent, EventBus, ShellEvent};
use crate::exec::CommandResult;

/// Window after an execution begins during which identical requests attach
/// to the same run instead of executing again.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// Wait before executing a high-dedup command, giving concurrent identical
/// requests a chance to arrive and coalesce.
pub const BATCH_WAIT: Duration = Duration::from_millis(100);

/// Commands agents fire in rapid succession; worth the batch wait.
const HIGH_DEDUP_COMMANDS: &[&str] = &[
    "ls",
    "pwd",
    "git status",
    "git branch",
    "npm list",
    "cat package.json",
    "cat README.md",
    "whoami",
    "date",
];

/// Command bases whose instances may be merged into one batch run.
const COALESCABLE_BASES: &[&str] = &["ls", "cat", "head", "tail", "wc", "file"];

struct PendingEntry {
    started_at: Instant,
    rx: watch::Receiver<Option<CommandResult>>,
    waiters: u64,
}

enum Slot {
    Attached(watch::Receiver<Option<CommandResult>>),
    Leader(
        watch::Sender<Option<CommandResult>>,
        watch::Receiver<Option<CommandResult>>,
    ),
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    deduped: AtomicU64,
    batched_savings: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    pub total_commands: u64,
    pub deduped_commands: u64,
    pub saved_executions: u64,
    /// Percentage of requests served without a fresh execution.
    pub dedup_rate: f64,
    pub currently_pending: usize,
}

/// Coalesces concurrent and recently-completed identical executions.
///
/// For any command key, at most one underlying run starts per dedup window;
/// every caller inside the window observes the same result through a shared
/// watch cell. The underlying run is spawned as its own task, so a caller
/// abandoning its wait never cancels the execution other waiters share.
pub struct Deduplicator {
    window: Duration,
    batch_wait: Duration,
    entries: Mutex<HashMap<String, PendingEntry>>,
    counters: Counters,
    events: EventBus,
}

impl Deduplicator {
    pub fn new(events: EventBus) -> Self {
        Self::with_window(events, DEDUP_WINDOW, BATCH_WAIT)
    }

    pub fn with_window(events: EventBus, window: Duration, batch_wait: Duration) -> Self {
        Self {
            window,
            batch_wait,
            entries: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            events,
        }
    }

    /// Execute `run` for `(command, cwd)`, or attach to an identical
    /// execution already in flight (or completed within the window).
    pub async fn execute<F, Fut>(&self, command: &str, cwd: &str, run: F) -> CommandResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let key = command_key(command, cwd);

        if let Some(rx) = self.try_attach(&key) {
            return Self::await_value(rx).await;
        }

        // High-dedup commands briefly wait so concurrent identical requests
        // can batch onto one run, then re-check before executing.
        if is_high_dedup(command) {
            tokio::time::sleep(self.batch_wait).await;
        }

        // Attach-or-lead decided under one lock: concurrent callers racing
        // past the checks above cannot both become the leader.
        let rx = match self.attach_or_lead(&key) {
            Slot::Attached(rx) => rx,
            Slot::Leader(tx, rx) => {
                self.events
                    .emit(ShellEvent::Dedup(DedupEvent::Executed { key }));
                // The run lives in its own task: waiter cancellation
                // (including the leader's) must never cancel the shared
                // execution.
                let fut = run();
                tokio::spawn(async move {
                    let result = fut.await;
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        Self::await_value(rx).await
    }

    fn try_attach(&self, key: &str) -> Option<watch::Receiver<Option<CommandResult>>> {
        let mut entries = self.entries.lock().expect("dedup lock poisoned");
        let rx = Self::attach_entry(&mut entries, key, self.window)?;
        drop(entries);
        self.record_hit(key);
        Some(rx)
    }

    fn attach_or_lead(&self, key: &str) -> Slot {
        let mut entries = self.entries.lock().expect("dedup lock poisoned");
        if let Some(rx) = Self::attach_entry(&mut entries, key, self.window) {
            drop(entries);
            self.record_hit(key);
            return Slot::Attached(rx);
        }
        let (tx, rx) = watch::channel(None);
        entries.insert(
            key.to_string(),
            PendingEntry {
                started_at: Instant::now(),
                rx: rx.clone(),
                waiters: 0,
            },
        );
        Slot::Leader(tx, rx)
    }

    fn attach_entry(
        entries: &mut HashMap<String, PendingEntry>,
        key: &str,
        window: Duration,
    ) -> Option<watch::Receiver<Option<CommandResult>>> {
        let entry = entries.get_mut(key)?;
        if entry.started_at.elapsed() >= window {
            return None;
        }
        entry.waiters += 1;
        Some(entry.rx.clone())
    }

    fn record_hit(&self, key: &str) {
        self.counters.deduped.fetch_add(1, Ordering::Relaxed);
        let waiters = self
            .entries
            .lock()
            .expect("dedup lock poisoned")
            .get(key)
            .map(|e| e.waiters)
            .unwrap_or(0);
        self.events.emit(ShellEvent::Dedup(DedupEvent::Hit {
            key: key.to_string(),
            waiters,
        }));
    }

    async fn await_value(mut rx: watch::Receiver<Option<CommandResult>>) -> CommandResult {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a value: the execution task died.
                return CommandResult::internal_failure("execution task terminated unexpectedly");
            }
        }
    }

    /// Execute a list of commands, merging coalescable groups (same base
    /// command, more than one instance) into single `batch_run` calls.
    /// Results come back in input order.
    pub async fn coalesce_commands<R, RFut, B, BFut>(
        &self,
        commands: &[String],
        cwd: &str,
        run: R,
        batch_run: B,
    ) -> Vec<CommandResult>
    where
        R: Fn(String) -> RFut,
        RFut: Future<Output = CommandResult> + Send + 'static,
        B: Fn(Vec<String>) -> BFut,
        BFut: Future<Output = Vec<CommandResult>>,
    {
        // Group input indices by base token, preserving first-seen order.
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, cmd) in commands.iter().enumerate() {
            let base = base_command(cmd).to_string();
            match groups.iter_mut().find(|(b, _)| *b == base) {
                Some((_, idxs)) => idxs.push(i),
                None => groups.push((base, vec![i])),
            }
        }

        let mut results: Vec<Option<CommandResult>> = vec![None; commands.len()];

        for (base, idxs) in groups {
            let coalescable = COALESCABLE_BASES.contains(&base.as_str()) && idxs.len() > 1;
            if coalescable {
                let group: Vec<String> = idxs.iter().map(|&i| commands[i].clone()).collect();
                let mut batch = batch_run(group).await;
                self.counters
                    .batched_savings
                    .fetch_add((idxs.len() - 1) as u64, Ordering::Relaxed);
                // Splice back in input order; a short batch pads with failures.
                for (slot, &i) in idxs.iter().enumerate() {
                    results[i] = Some(if slot < batch.len() {
                        std::mem::replace(
                            &mut batch[slot],
                            CommandResult::internal_failure("consumed"),
                        )
                    } else {
                        CommandResult::internal_failure("batch runner returned too few results")
                    });
                }
            } else {
                for &i in &idxs {
                    let cmd = commands[i].clone();
                    results[i] = Some(self.execute(&cmd, cwd, || run(cmd.clone())).await);
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| CommandResult::internal_failure("missing result")))
            .collect()
    }

    /// Drop entries older than twice the window. The attach path already
    /// ignores entries past one window; the sweep bounds memory.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().expect("dedup lock poisoned");
        let cutoff = self.window * 2;
        let before = entries.len();
        entries.retain(|_, e| e.started_at.elapsed() < cutoff);
        before - entries.len()
    }

    /// Periodic sweeper task. Runs until the deduplicator is dropped.
    pub fn spawn_sweeper(self: Arc<Self>) {
        let weak = Arc::downgrade(&self);
        let period = self.window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(dedup) = weak.upgrade() else { break };
                let removed = dedup.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "dedup sweep");
                }
            }
        });
    }

    pub fn stats(&self) -> DedupStats {
        let total = self.counters.total.load(Ordering::Relaxed);
        let deduped = self.counters.deduped.load(Ordering::Relaxed);
        let batched = self.counters.batched_savings.load(Ordering::Relaxed);
        let entries = self.entries.lock().expect("dedup lock poisoned");
        let currently_pending = entries
            .values()
            .filter(|e| e.rx.borrow().is_none())
            .count();
        DedupStats {
            total_commands: total,
            deduped_commands: deduped,
            saved_executions: deduped + batched,
            dedup_rate: if total == 0 {
                0.0
            } else {
                deduped as f64 / total as f64 * 100.0
            },
            currently_pending,
        }
    }
}

/// True when the normalized command is in the high-dedup set.
fn is_high_dedup(command: &str) -> bool {
    let normalized = normalize_command(command);
    HIGH_DEDUP_COMMANDS.iter().any(|&c| {
        normalized == c
            || normalized
                .strip_prefix(c)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

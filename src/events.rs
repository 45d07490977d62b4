use tokio::sync::broadcast;

/// Typed observability events. Learning and duplicate-detection side-effects
/// surface only here; they never change the shape of a returned result.
#[derive(Debug, Clone)]
pub enum ShellEvent {
    Cache(CacheEvent),
    Dedup(DedupEvent),
    Learning(LearningEvent),
    Process(ProcessEvent),
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit { key: String },
    Miss { key: String },
    Set { key: String, strategy: &'static str },
    /// A NEVER-classified command skipped insertion.
    Skip { key: String },
    Expired { key: String },
    Cleared { count: usize },
}

#[derive(Debug, Clone)]
pub enum DedupEvent {
    /// A caller attached to an in-flight or recently completed execution.
    Hit { key: String, waiters: u64 },
    Executed { key: String },
}

#[derive(Debug, Clone)]
pub enum LearningEvent {
    /// The duplicate detector confirmed repeated identical output.
    DuplicateDetected {
        command: String,
        duplicate_count: usize,
        time_span_ms: u64,
    },
    RuleSaved { pattern: String, source: &'static str },
    RuleRemoved { pattern: String },
}

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Started { id: String, session: String },
    Exited { id: String, exit_code: Option<i32> },
    Killed { id: String },
}

/// Broadcast bus for shell events. Emission is fire-and-forget: if no
/// subscriber is listening the event is dropped silently.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShellEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ShellEvent) {
        let _ = self.tx.send(event);
    }
}

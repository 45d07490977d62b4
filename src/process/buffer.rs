use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default ring capacity in lines.
pub const DEFAULT_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One captured output line. `line_number` is 1-based, strictly monotonic,
/// and gap-free per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamKind,
    pub content: String,
    pub line_number: u64,
}

struct BufferState {
    lines: VecDeque<OutputLine>,
    /// Next line number to assign.
    next_line: u64,
    /// Pending `wait_for_lines` callers, woken FIFO on every add.
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl BufferState {
    fn total_lines(&self) -> u64 {
        self.next_line - 1
    }

    fn lines_after(&self, after_line: u64) -> Vec<OutputLine> {
        self.lines
            .iter()
            .filter(|l| l.line_number > after_line)
            .cloned()
            .collect()
    }
}

/// Bounded ring of output lines with blocking tail-read.
///
/// The oldest line is evicted first once capacity is reached; numbering keeps
/// counting, so `total_lines` can exceed `buffer_size`.
pub struct OutputBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BufferState {
                lines: VecDeque::new(),
                next_line: 1,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Append a line, waking all pending waiters in registration order.
    pub fn add(&self, stream: StreamKind, content: impl Into<String>) -> u64 {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        let line_number = state.next_line;
        state.next_line += 1;
        state.lines.push_back(OutputLine {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
            line_number,
        });
        while state.lines.len() > self.capacity {
            state.lines.pop_front();
        }
        while let Some(tx) = state.waiters.pop_front() {
            // A dropped receiver just means that waiter timed out already.
            let _ = tx.send(());
        }
        line_number
    }

    /// Restore a line from persistence, preserving its recorded number.
    /// Numbering resumes after the highest restored line.
    pub fn restore(&self, line: OutputLine) {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        state.next_line = state.next_line.max(line.line_number + 1);
        state.lines.push_back(line);
        while state.lines.len() > self.capacity {
            state.lines.pop_front();
        }
    }

    /// Resident lines after `from_line` (all resident lines when omitted),
    /// limited to the last `count` when given.
    pub fn get_lines(&self, count: Option<usize>, from_line: Option<u64>) -> Vec<OutputLine> {
        let state = self.state.lock().expect("buffer lock poisoned");
        let mut lines = state.lines_after(from_line.unwrap_or(0));
        if let Some(count) = count
            && lines.len() > count
        {
            lines.drain(..lines.len() - count);
        }
        lines
    }

    /// Wait until a line newer than `after_line` exists, or `timeout`
    /// elapses. Returns the visible newer lines, or empty on timeout;
    /// never an error.
    pub async fn wait_for_lines(&self, after_line: u64, timeout: Duration) -> Vec<OutputLine> {
        let deadline = Instant::now() + timeout;
        loop {
            let rx = {
                let mut state = self.state.lock().expect("buffer lock poisoned");
                if state.total_lines() > after_line {
                    return state.lines_after(after_line);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            match tokio::time::timeout(remaining, rx).await {
                Ok(_) => continue, // woken; collect under the lock
                Err(_) => return Vec::new(),
            }
        }
    }

    /// Highest line number ever assigned.
    pub fn total_lines(&self) -> u64 {
        self.state
            .lock()
            .expect("buffer lock poisoned")
            .total_lines()
    }

    /// Currently resident lines.
    pub fn buffer_size(&self) -> usize {
        self.state.lock().expect("buffer lock poisoned").lines.len()
    }

    /// Drop resident lines. Numbering continues where it left off.
    pub fn clear(&self) {
        self.state
            .lock()
            .expect("buffer lock poisoned")
            .lines
            .clear();
    }
}

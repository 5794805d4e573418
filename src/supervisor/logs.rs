//! Bounded in-memory buffers over the child process's output streams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

/// Lines retained per stream.
pub const LOG_TAIL_CAPACITY: usize = 500;

/// Which stream(s) a log-tail request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    Both,
}

impl std::str::FromStr for LogStream {
    type Err = String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            "both" => Ok(LogStream::Both),
            other => Err(format!("stream must be stdout|stderr|both, got {:?}", other)),
        }
    }
}

/// A snapshot of the requested log tails.
#[derive(Clone, Debug, Serialize)]
pub struct LogTail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<String>>,
}

#[derive(Default)]
struct LogBuffersInner {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

/// Shared ring buffers fed by the child's stream reader tasks.
///
/// Reads are snapshots; they never wait for new output.
#[derive(Clone, Default)]
pub struct LogBuffers {
    inner: Arc<Mutex<LogBuffersInner>>,
}

impl LogBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stream: LogStream, line: String) {
        let mut inner = self.lock();
        let buf = match stream {
            LogStream::Stdout => &mut inner.stdout,
            // `Both` is not a valid write target; collapse to stderr rather
            // than dropping the line.
            LogStream::Stderr | LogStream::Both => &mut inner.stderr,
        };
        if buf.len() >= LOG_TAIL_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    /// The last `lines` lines of the selected stream(s), clamped to capacity.
    pub fn tail(&self, lines: usize, stream: LogStream) -> LogTail {
        let lines = lines.clamp(1, LOG_TAIL_CAPACITY);
        let inner = self.lock();
        let take = |buf: &VecDeque<String>| buf.iter().rev().take(lines).rev().cloned().collect::<Vec<_>>();
        LogTail {
            stdout: matches!(stream, LogStream::Stdout | LogStream::Both).then(|| take(&inner.stdout)),
            stderr: matches!(stream, LogStream::Stderr | LogStream::Both).then(|| take(&inner.stderr)),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.stdout.clear();
        inner.stderr.clear();
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffersInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

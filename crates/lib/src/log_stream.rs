//! Log broadcast queue and the `log` bridge that feeds it.
//!
//! The queue is process-wide and FIFO. Entries are *popped* by whichever stream drains them first,
//! so two open viewers split the entries between them rather than each seeing all of them. The
//! gateway assumes a single viewer (the browser debug panel); this is a queue, not a topic.

use chrono::Local;
use futures_util::stream::{self, Stream};
use log::{Level, LevelFilter, Metadata, Record};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Crate records at this level or more severe are copied into the broadcast queue.
const BROADCAST_LEVEL: Level = Level::Info;

/// One formatted log line waiting for the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Local wall-clock time, `HH:MM:SS`.
    pub timestamp: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            message: message.into(),
        }
    }

    fn from_record(record: &Record<'_>) -> Self {
        let message = match record.level() {
            Level::Error | Level::Warn => format!("{}: {}", record.level(), record.args()),
            _ => record.args().to_string(),
        };
        Self::new(message)
    }

    /// Wire form sent to the viewer: `[HH:MM:SS] message`.
    pub fn line(&self) -> String {
        format!("[{}] {}", self.timestamp, self.message)
    }
}

#[derive(Debug, Default)]
struct Queue {
    entries: VecDeque<LogEntry>,
    capacity: Option<usize>,
    dropped: u64,
}

impl Queue {
    fn enforce_capacity(&mut self) {
        if let Some(cap) = self.capacity {
            while self.entries.len() > cap {
                self.entries.pop_front();
                self.dropped += 1;
            }
        }
    }
}

/// Handle to the process-wide log queue. Cloning shares the same queue.
#[derive(Debug, Clone, Default)]
pub struct LogBroadcaster {
    inner: Arc<Mutex<Queue>>,
}

impl LogBroadcaster {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue holding at most `capacity` entries (drop-oldest). `None` means unbounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        let b = Self::new();
        b.set_capacity(capacity);
        b
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        // Appends never panic while holding the lock, but a poisoned queue is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the bound; applies immediately to already-queued entries.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        let mut q = self.queue();
        q.capacity = capacity;
        q.enforce_capacity();
    }

    /// Append an entry. Never blocks on a consumer and never fails.
    pub fn append(&self, entry: LogEntry) {
        let mut q = self.queue();
        q.entries.push_back(entry);
        q.enforce_capacity();
    }

    /// Append a message stamped with the current time.
    pub fn push(&self, message: impl Into<String>) {
        self.append(LogEntry::new(message));
    }

    /// Remove and return the oldest entry.
    pub fn pop(&self) -> Option<LogEntry> {
        self.queue().entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries discarded by the drop-oldest bound since startup.
    pub fn dropped(&self) -> u64 {
        self.queue().dropped
    }

    /// Infinite stream draining the queue one entry at a time, oldest first.
    /// Sleeps `poll_interval` between attempts while the queue is empty. Ends only when dropped.
    pub fn open_stream(
        &self,
        poll_interval: Duration,
    ) -> impl Stream<Item = LogEntry> + Send + 'static {
        stream::unfold(self.clone(), move |broadcaster| async move {
            loop {
                if let Some(entry) = broadcaster.pop() {
                    return Some((entry, broadcaster));
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }
}

/// `log::Log` that writes through `env_logger` and copies this crate's records into the queue.
pub struct BroadcastLogger {
    inner: env_logger::Logger,
    broadcaster: LogBroadcaster,
}

impl BroadcastLogger {
    pub fn new(inner: env_logger::Logger, broadcaster: LogBroadcaster) -> Self {
        Self { inner, broadcaster }
    }

    fn captures(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= BROADCAST_LEVEL && metadata.target().starts_with(env!("CARGO_CRATE_NAME"))
    }
}

impl log::Log for BroadcastLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata) || self.captures(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        self.inner.log(record);
        if self.captures(record.metadata()) {
            self.broadcaster.append(LogEntry::from_record(record));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the process logger. `default_filter` is used when RUST_LOG is unset (e.g. "info").
pub fn init_logging(
    broadcaster: LogBroadcaster,
    default_filter: &str,
) -> Result<(), log::SetLoggerError> {
    let inner = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .build();
    let max_level = inner.filter().max(LevelFilter::Info);
    log::set_boxed_logger(Box::new(BroadcastLogger::new(inner, broadcaster)))?;
    log::set_max_level(max_level);
    Ok(())
}

//! Per-file watch loop.
//!
//! A watcher owns one open log file and walks through
//! `Starting → Tailing ⇄ Idle → Stopped`:
//!
//! - **Starting**: open the file, resume from the persisted offset or skip
//!   to the end when there is none.
//! - **Tailing**: read complete lines; each one advances the persisted
//!   offset, goes through the file's [`LineParser`] and, if it yields a
//!   record, is written to the sink.
//! - **Idle**: when no complete line is available, sleep for the poll interval,
//!   check for truncation/replacement, then tail again. After the idle
//!   timeout without a line the watcher stops.
//! - **Stopped**: the task ends; the supervisor may start a new watcher for
//!   the same file on a later scan.

pub mod tailer;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::offsets::OffsetStore;
use crate::parser::LineParser;
use crate::sink::{Sink, SinkError};

use tailer::{LineTailer, Opened, Rotation, StartFrom};

/// Delay between reads when the file has no new complete line.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A watcher with no new line for this long stops.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Timing knobs for [`FileWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Starting,
    Tailing,
    Idle,
    Stopped,
}

/// Counters reported when a watcher stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchStats {
    pub lines: u64,
    pub records: u64,
    pub write_failures: u64,
}

/// Tails one log file into a sink.
pub struct FileWatcher<S> {
    path: PathBuf,
    name: String,
    parser: Arc<Mutex<LineParser>>,
    offsets: Arc<OffsetStore>,
    sink: Arc<S>,
    settings: WatcherSettings,
}

impl<S: Sink> FileWatcher<S> {
    /// `parser` carries state across watcher restarts for the same file, so
    /// it is shared rather than owned.
    pub fn new(
        path: impl Into<PathBuf>,
        parser: Arc<Mutex<LineParser>>,
        offsets: Arc<OffsetStore>,
        sink: Arc<S>,
        settings: WatcherSettings,
    ) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            name,
            parser,
            offsets,
            sink,
            settings,
        }
    }

    /// Key used in the offset store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until the file has been idle for the idle timeout.
    pub async fn run(self) -> WatchStats {
        let mut stats = WatchStats::default();
        let Some(mut tailer) = self.start().await else {
            return stats;
        };
        let mut state = WatchState::Tailing;
        let mut last_activity = Instant::now();

        while state != WatchState::Stopped {
            let next = match state {
                WatchState::Tailing => match tailer.next_line().await {
                    Ok(Some(line)) => {
                        self.offsets.set(&self.name, tailer.offset());
                        last_activity = Instant::now();
                        stats.lines += 1;
                        match self.handle_line(&line).await {
                            Ok(true) => {
                                stats.records += 1;
                                info!(file = %self.name, "data write ok");
                            }
                            Ok(false) => {}
                            Err(e) => {
                                stats.write_failures += 1;
                                error!(file = %self.name, error = %e, "data write failed");
                            }
                        }
                        WatchState::Tailing
                    }
                    Ok(None) => WatchState::Idle,
                    Err(e) => {
                        warn!(file = %self.name, error = %e, "read failed");
                        WatchState::Idle
                    }
                },
                WatchState::Idle => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                    if last_activity.elapsed() >= self.settings.idle_timeout {
                        info!(
                            file = %self.name,
                            idle_secs = last_activity.elapsed().as_secs(),
                            "stop watching"
                        );
                        WatchState::Stopped
                    } else {
                        self.check_rotation(&mut tailer).await;
                        WatchState::Tailing
                    }
                }
                WatchState::Starting | WatchState::Stopped => WatchState::Stopped,
            };

            if next != state {
                trace!(file = %self.name, from = ?state, to = ?next, "watch state");
                state = next;
            }
        }

        info!(
            file = %self.name,
            lines = stats.lines,
            records = stats.records,
            write_failures = stats.write_failures,
            "watcher stopped"
        );
        stats
    }

    /// `Starting`: open the file at the persisted offset, or at its end.
    async fn start(&self) -> Option<LineTailer> {
        let start = match self.offsets.get(&self.name) {
            Some(offset) => StartFrom::Offset(offset),
            None => StartFrom::End,
        };
        info!(file = %self.name, offset = ?self.offsets.get(&self.name), "start watching");

        let (tailer, opened) = match LineTailer::open(&self.path, start).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(
                    file = %self.name,
                    path = %self.path.display(),
                    error = %e,
                    "failed to open log file"
                );
                return None;
            }
        };

        match opened {
            Opened::Resumed(offset) => info!(file = %self.name, offset, "resumed from offset"),
            Opened::SkippedToEnd(offset) => {
                info!(file = %self.name, offset, "no offset, skipped to end of file")
            }
            Opened::Restarted { stale_offset, len } => warn!(
                file = %self.name,
                stale_offset,
                len,
                "offset past end of file, reading from the beginning"
            ),
        }
        // The starting point counts as consumed.
        self.offsets.set(&self.name, tailer.offset());
        Some(tailer)
    }

    /// Parse one line and write the resulting record, if any.
    ///
    /// Returns whether a record was written.
    async fn handle_line(&self, line: &str) -> Result<bool, SinkError> {
        let record = {
            let mut parser = self.parser.lock().unwrap_or_else(PoisonError::into_inner);
            parser.parse_line(line)
        };
        let Some(record) = record else {
            return Ok(false);
        };
        debug!(file = %self.name, fields = record.fields.len(), "record parsed");
        self.sink.write(&record).await?;
        Ok(true)
    }

    async fn check_rotation(&self, tailer: &mut LineTailer) {
        match tailer.check_rotation().await {
            Ok(Some(Rotation::Truncated { len, offset })) => {
                warn!(file = %self.name, len, offset, "file truncated, reading from the beginning");
                self.offsets.set(&self.name, 0);
            }
            Ok(Some(Rotation::Replaced)) => {
                warn!(file = %self.name, "file replaced, reading from the beginning");
                self.offsets.set(&self.name, 0);
            }
            Ok(None) => {}
            Err(e) => debug!(file = %self.name, error = %e, "rotation check failed"),
        }
    }
}

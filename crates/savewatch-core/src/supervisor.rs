//! Directory rescans and watcher task bookkeeping.
//!
//! Every scan lists the log directory, and for each matching file without a
//! live watcher starts one. Watchers stop on their own after an idle hour;
//! the next scan restarts them if the file is still there. Parser state is
//! kept per file name for the life of the process, so a restarted watcher
//! continues the same speed history.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::offsets::OffsetStore;
use crate::parser::LineParser;
use crate::parser::timestamp::DEFAULT_TIMEZONE;
use crate::sink::Sink;
use crate::watcher::{FileWatcher, WatchStats, WatcherSettings};

/// Name pattern of VRChat log files.
pub const DEFAULT_PATTERN: &str = "output_log_*.txt";

/// Interval between directory scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// A file name pattern with at most one `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    prefix: String,
    suffix: Option<String>,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Self {
        match pattern.split_once('*') {
            Some((prefix, suffix)) => Self {
                prefix: prefix.to_string(),
                suffix: Some(suffix.to_string()),
            },
            None => Self {
                prefix: pattern.to_string(),
                suffix: None,
            },
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.suffix {
            Some(suffix) => {
                name.len() >= self.prefix.len() + suffix.len()
                    && name.starts_with(&self.prefix)
                    && name.ends_with(suffix.as_str())
            }
            None => name == self.prefix,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub log_dir: PathBuf,
    pub pattern: NamePattern,
    pub scan_interval: Duration,
    pub watcher: WatcherSettings,
    /// Zone of the wall-clock timestamps in the log files.
    pub timezone: Tz,
}

impl SupervisorConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            pattern: NamePattern::new(DEFAULT_PATTERN),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            watcher: WatcherSettings::default(),
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

/// Keeps exactly one watcher task per matching log file.
pub struct Supervisor<S> {
    config: SupervisorConfig,
    offsets: Arc<OffsetStore>,
    sink: Arc<S>,
    registry: Mutex<HashMap<String, JoinHandle<WatchStats>>>,
    parsers: Mutex<HashMap<String, Arc<Mutex<LineParser>>>>,
}

impl<S: Sink> Supervisor<S> {
    pub fn new(config: SupervisorConfig, offsets: Arc<OffsetStore>, sink: Arc<S>) -> Self {
        Self {
            config,
            offsets,
            sink,
            registry: Mutex::new(HashMap::new()),
            parsers: Mutex::new(HashMap::new()),
        }
    }

    /// Scan forever at the configured interval. Cancel by dropping the future,
    /// then call [`Supervisor::shutdown`].
    pub async fn run(&self) {
        info!(
            dir = %self.config.log_dir.display(),
            interval_secs = self.config.scan_interval.as_secs(),
            "start main loop"
        );
        let mut tick = tokio::time::interval(self.config.scan_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            self.scan().await;
        }
    }

    /// One pass over the directory. Returns the number of watchers started.
    pub async fn scan(&self) -> usize {
        let files = match self.list_log_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(
                    dir = %self.config.log_dir.display(),
                    error = %e,
                    "failed to list log directory"
                );
                return 0;
            }
        };

        let mut started = 0;
        for (name, path) in files {
            let mut registry = lock(&self.registry);
            if registry.get(&name).is_some_and(|task| !task.is_finished()) {
                continue;
            }

            info!(file = %name, "new monitoring task");
            let watcher = FileWatcher::new(
                path,
                self.parser_for(&name),
                self.offsets.clone(),
                self.sink.clone(),
                self.config.watcher,
            );
            registry.insert(name, tokio::spawn(watcher.run()));
            started += 1;
        }
        started
    }

    /// Number of watcher tasks that have not finished.
    pub fn active_watchers(&self) -> usize {
        lock(&self.registry)
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Abort every watcher task and wait for them to end. Returns how many
    /// were still running.
    ///
    /// Once this returns no watcher touches the offset store again.
    pub async fn shutdown(&self) -> usize {
        let tasks: Vec<_> = lock(&self.registry).drain().collect();
        let mut aborted = 0;
        for (name, task) in &tasks {
            if !task.is_finished() {
                debug!(file = %name, "aborting watcher");
                task.abort();
                aborted += 1;
            }
        }
        for (name, task) in tasks {
            match task.await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(file = %name, error = %e, "watcher task failed"),
            }
        }
        info!(aborted, "watchers stopped");
        aborted
    }

    fn parser_for(&self, name: &str) -> Arc<Mutex<LineParser>> {
        lock(&self.parsers)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LineParser::new(name, self.config.timezone))))
            .clone()
    }

    /// Regular files (following symlinks) whose names match, sorted by name.
    async fn list_log_files(&self) -> std::io::Result<Vec<(String, PathBuf)>> {
        let mut entries = tokio::fs::read_dir(&self.config.log_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.config.pattern.matches(&name) {
                continue;
            }
            let path = entry.path();
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => files.push((name, path)),
                Ok(_) => {}
                Err(e) => debug!(file = %name, error = %e, "skipping unreadable entry"),
            }
        }
        files.sort();
        Ok(files)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SAVEDATA_URL_PREFIX;
    use crate::sink::memory::MemorySink;
    use std::io::Write;
    use std::path::Path;

    fn config(dir: &Path) -> SupervisorConfig {
        SupervisorConfig {
            scan_interval: Duration::from_millis(20),
            watcher: WatcherSettings {
                poll_interval: Duration::from_millis(5),
                idle_timeout: Duration::from_millis(200),
            },
            timezone: chrono_tz::UTC,
            ..SupervisorConfig::new(dir)
        }
    }

    fn append(path: &Path, content: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn event(credit: i64) -> String {
        format!("{SAVEDATA_URL_PREFIX}?data=%7B%22credit_all%22%3A{credit}%7D&user_id=u\n")
    }

    #[test]
    fn test_name_pattern() {
        let pattern = NamePattern::new(DEFAULT_PATTERN);
        assert!(pattern.matches("output_log_2025-03-01_10-00-00.txt"));
        assert!(pattern.matches("output_log_.txt"));
        assert!(!pattern.matches("output_log_1.txt.bak"));
        assert!(!pattern.matches("my_output_log_1.txt"));
        assert!(!pattern.matches("output_log.txt"));

        let exact = NamePattern::new("a.txt");
        assert!(exact.matches("a.txt"));
        assert!(!exact.matches("aa.txt"));
    }

    #[tokio::test]
    async fn test_scan_starts_one_watcher_per_file() {
        let dir = tempfile::tempdir().unwrap();
        append(&dir.path().join("output_log_1.txt"), "");
        append(&dir.path().join("output_log_2.txt"), "");
        append(&dir.path().join("other.txt"), "");
        std::fs::create_dir(dir.path().join("output_log_dir.txt")).unwrap();

        let offsets = Arc::new(OffsetStore::empty(dir.path().join("offsets.json")));
        let sink = Arc::new(MemorySink::default());
        let supervisor = Supervisor::new(config(dir.path()), offsets, sink);

        assert_eq!(supervisor.scan().await, 2);
        assert_eq!(supervisor.scan().await, 0);
        assert_eq!(supervisor.active_watchers(), 2);
        assert_eq!(supervisor.shutdown().await, 2);
        assert_eq!(supervisor.active_watchers(), 0);
    }

    #[tokio::test]
    async fn test_finished_watcher_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output_log_1.txt");
        append(&path, "");

        let offsets = Arc::new(OffsetStore::empty(dir.path().join("offsets.json")));
        let sink = Arc::new(MemorySink::default());
        let supervisor = Supervisor::new(config(dir.path()), offsets.clone(), sink.clone());

        assert_eq!(supervisor.scan().await, 1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(supervisor.active_watchers(), 0);

        // written while nobody watches; the restarted watcher resumes at the
        // offset recorded by the first one
        append(&path, &event(5));
        assert_eq!(supervisor.scan().await, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.shutdown().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].get_field("credit_all"),
            Some(&crate::record::FieldValue::Int(5))
        );
    }

    #[tokio::test]
    async fn test_parser_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let offsets = Arc::new(OffsetStore::empty(dir.path().join("offsets.json")));
        let sink = Arc::new(MemorySink::default());
        let supervisor = Supervisor::new(config(dir.path()), offsets, sink);

        let first = supervisor.parser_for("output_log_1.txt");
        let again = supervisor.parser_for("output_log_1.txt");
        let other = supervisor.parser_for("output_log_2.txt");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_offset_updates_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output_log_1.txt");
        append(&path, "");

        let offsets = Arc::new(OffsetStore::empty(dir.path().join("offsets.json")));
        let sink = Arc::new(MemorySink::default());
        let supervisor = Supervisor::new(config(dir.path()), offsets.clone(), sink);
        supervisor.scan().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let writer = std::thread::spawn({
            let path = path.clone();
            move || {
                for credit in 0..200 {
                    append(&path, &event(credit));
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        supervisor.shutdown().await;
        let at_shutdown = offsets.snapshot();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(offsets.snapshot(), at_shutdown);
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let offsets = Arc::new(OffsetStore::empty(dir.path().join("offsets.json")));
        let sink = Arc::new(MemorySink::default());
        let supervisor = Supervisor::new(config(&dir.path().join("nope")), offsets, sink);
        assert_eq!(supervisor.scan().await, 0);
    }

    #[tokio::test]
    async fn test_run_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let offsets = Arc::new(OffsetStore::empty(dir.path().join("offsets.json")));
        let sink = Arc::new(MemorySink::default());
        let supervisor = Arc::new(Supervisor::new(config(dir.path()), offsets, sink));

        let runner = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        append(&dir.path().join("output_log_new.txt"), "");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(supervisor.active_watchers(), 1);

        runner.abort();
        supervisor.shutdown().await;
    }
}

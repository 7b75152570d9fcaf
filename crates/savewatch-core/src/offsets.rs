//! Persisted read offsets.
//!
//! Maps a log file name to the byte offset just past the last line that was
//! consumed from it. Watchers update the in-memory map after every line; the
//! map is written to disk periodically and once more at shutdown.
//!
//! Losing the offset file is never fatal: a missing or corrupt document
//! starts an empty map, which makes watchers skip to the end of existing
//! files.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

/// Errors reading or writing the offset document.
#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid offset document {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File name → byte offset map backed by a JSON document.
#[derive(Debug)]
pub struct OffsetStore {
    path: PathBuf,
    offsets: Mutex<HashMap<String, u64>>,
    /// Held for snapshot, write and rename; saves share one `.tmp` file.
    saving: Mutex<()>,
}

impl OffsetStore {
    /// Load offsets from `path`, starting empty if it is absent or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offsets = match read_offsets(&path) {
            Ok(Some(offsets)) => {
                info!(path = %path.display(), entries = offsets.len(), "loaded offsets");
                offsets
            }
            Ok(None) => {
                info!(path = %path.display(), "offset file not found, starting empty");
                HashMap::new()
            }
            Err(e) => {
                warn!(error = %e, "failed to load offsets, starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            offsets: Mutex::new(offsets),
            saving: Mutex::new(()),
        }
    }

    /// Empty store that will save to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offsets: Mutex::new(HashMap::new()),
            saving: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, file_name: &str) -> Option<u64> {
        self.lock().get(file_name).copied()
    }

    pub fn set(&self, file_name: &str, offset: u64) {
        let mut offsets = self.lock();
        match offsets.get_mut(file_name) {
            Some(current) => *current = offset,
            None => {
                offsets.insert(file_name.to_string(), offset);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current map.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.lock().clone()
    }

    /// Write the map to disk, logging instead of failing.
    ///
    /// Returns whether the write succeeded.
    pub fn save(&self) -> bool {
        match self.try_save() {
            Ok(entries) => {
                info!(path = %self.path.display(), entries, "saved offsets");
                true
            }
            Err(e) => {
                error!(error = %e, "failed to save offsets");
                false
            }
        }
    }

    /// Write the map to disk (atomic via .tmp rename).
    ///
    /// Concurrent saves run one after another, each writing the map as of
    /// its turn, so the file never goes back to an older state.
    pub fn try_save(&self) -> Result<usize, OffsetError> {
        let _saving = self.saving.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|source| OffsetError::Format {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source| OffsetError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        Ok(snapshot.len())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Save `store` every `every` until the future is dropped.
///
/// A save already handed to the blocking pool finishes even if the future is
/// dropped; [`OffsetStore::save`] serializes it with any later save.
pub async fn autosave(store: Arc<OffsetStore>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // first tick completes immediately
    tick.tick().await;

    loop {
        tick.tick().await;
        let store = store.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || store.save()).await {
            error!(error = %e, "offset autosave panicked");
        }
    }
}

fn read_offsets(path: &Path) -> Result<Option<HashMap<String, u64>>, OffsetError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(OffsetError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| OffsetError::Format {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::load(dir.path().join("offsets.json"));
        assert!(store.is_empty());
        assert_eq!(store.get("output_log_1.txt"), None);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        std::fs::write(&path, "{ not json").unwrap();
        assert!(OffsetStore::load(&path).is_empty());

        std::fs::write(&path, r#"{"a.txt": -5}"#).unwrap();
        assert!(OffsetStore::load(&path).is_empty());

        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(OffsetStore::load(&path).is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("offsets.json");

        let store = OffsetStore::load(&path);
        store.set("output_log_1.txt", 120);
        store.set("output_log_2.txt", 7);
        store.set("output_log_1.txt", 240);
        assert!(store.save());

        let reloaded = OffsetStore::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("output_log_1.txt"), Some(240));
        assert_eq!(reloaded.get("output_log_2.txt"), Some(7));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_saved_document_is_plain_json_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        let store = OffsetStore::empty(&path);
        store.set("output_log_x.txt", 42);
        store.try_save().unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({"output_log_x.txt": 42}));
    }

    #[test]
    fn test_save_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        // the target path is a directory, so the rename fails
        let path = dir.path().join("taken");
        std::fs::create_dir(&path).unwrap();
        std::fs::create_dir(path.join("child")).unwrap();

        let store = OffsetStore::empty(&path);
        store.set("a", 1);
        assert!(!store.save());
        assert_eq!(store.get("a"), Some(1));
    }

    #[tokio::test]
    async fn test_autosave_writes_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        let store = Arc::new(OffsetStore::empty(&path));
        store.set("output_log_1.txt", 10);

        let task = tokio::spawn(autosave(store.clone(), Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();
        assert_eq!(OffsetStore::load(&path).get("output_log_1.txt"), Some(10));
    }

    #[test]
    fn test_concurrent_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        let store = Arc::new(OffsetStore::empty(&path));

        let handles: Vec<_> = (0..2u64)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..300u64)
                        .filter(|round| {
                            store.set(&format!("file_{i}"), *round);
                            store.try_save().is_err()
                        })
                        .count()
                })
            })
            .collect();
        let failures: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(failures, 0);

        // last save to finish carries both final values
        let reloaded = OffsetStore::load(&path);
        assert_eq!(reloaded.get("file_0"), Some(299));
        assert_eq!(reloaded.get("file_1"), Some(299));
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(OffsetStore::empty("unused.json"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for offset in 0..=100u64 {
                        store.set(&format!("file_{i}"), offset);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
        assert!((0..8).all(|i| store.get(&format!("file_{i}")) == Some(100)));
    }
}

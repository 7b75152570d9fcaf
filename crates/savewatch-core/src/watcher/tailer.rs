//! Incremental line reader over a growing log file.
//!
//! Tracks the byte offset just past the last complete line. An unterminated
//! tail is buffered until its newline arrives, so the offset never points
//! into the middle of a line. Detects truncation (file shorter than the
//! consumed position) and replacement (inode change, unix only) and restarts
//! from the beginning of the file in both cases.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// Where to begin reading a newly opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// A previously persisted offset.
    Offset(u64),
    /// Current end of file; existing content is skipped.
    End,
}

/// Where reading actually began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    Resumed(u64),
    SkippedToEnd(u64),
    /// The persisted offset was past the end of the file; reading starts at 0.
    Restarted { stale_offset: u64, len: u64 },
}

/// Why reading restarted from the beginning of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Truncated { len: u64, offset: u64 },
    Replaced,
}

pub struct LineTailer {
    path: PathBuf,
    reader: BufReader<File>,
    inode: u64,
    consumed: u64,
    pending: Vec<u8>,
}

impl LineTailer {
    pub async fn open(path: impl Into<PathBuf>, start: StartFrom) -> io::Result<(Self, Opened)> {
        let path = path.into();
        let mut file = File::open(&path).await?;
        let metadata = file.metadata().await?;
        let len = metadata.len();

        let opened = match start {
            StartFrom::Offset(offset) if offset <= len => Opened::Resumed(offset),
            StartFrom::Offset(offset) => Opened::Restarted {
                stale_offset: offset,
                len,
            },
            StartFrom::End => Opened::SkippedToEnd(len),
        };
        let position = match opened {
            Opened::Resumed(offset) | Opened::SkippedToEnd(offset) => offset,
            Opened::Restarted { .. } => 0,
        };
        file.seek(SeekFrom::Start(position)).await?;

        Ok((
            Self {
                path,
                reader: BufReader::new(file),
                inode: get_inode(&metadata),
                consumed: position,
                pending: Vec::new(),
            },
            opened,
        ))
    }

    /// Offset just past the last complete line returned.
    pub fn offset(&self) -> u64 {
        self.consumed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next complete line without its terminator, or `None` if the file has
    /// no further complete line yet. Invalid UTF-8 is replaced.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if read == 0 || !self.pending.ends_with(b"\n") {
            return Ok(None);
        }

        self.consumed += self.pending.len() as u64;
        let mut line = &self.pending[..self.pending.len() - 1];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let text = String::from_utf8_lossy(line).into_owned();
        self.pending.clear();
        Ok(Some(text))
    }

    /// Restart from byte 0 if the file shrank below what was read or was
    /// replaced by a different file with the same name.
    ///
    /// A file that is temporarily missing is not a rotation.
    pub async fn check_rotation(&mut self) -> io::Result<Option<Rotation>> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let read_to = self.consumed + self.pending.len() as u64;
        let inode = get_inode(&metadata);
        let rotation = if inode != self.inode {
            Rotation::Replaced
        } else if metadata.len() < read_to {
            Rotation::Truncated {
                len: metadata.len(),
                offset: read_to,
            }
        } else {
            return Ok(None);
        };

        let file = File::open(&self.path).await?;
        self.reader = BufReader::new(file);
        self.inode = inode;
        self.consumed = 0;
        self.pending.clear();
        Ok(Some(rotation))
    }
}

/// Extract inode from file metadata.
#[cfg(unix)]
fn get_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Non-unix: always 0, only truncation is detected.
#[cfg(not(unix))]
fn get_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

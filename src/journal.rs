//! Append-only JSON-lines journal.
//!
//! Every record is one JSON object followed by `\n`. `append` writes the line
//! and calls `sync_data()` before returning, so a record the caller has seen
//! acknowledged survives a crash. On open the file is replayed; a final line
//! that is both unterminated and unparsable is a torn write from a crash and is
//! truncated away. Anything else that fails to parse is reported as corruption.
//!
//! `compact` rewrites the journal from a caller-supplied set of records using a
//! temp file + rename, so the journal is never observed half-written.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("journal {path} line {line} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode journal record: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> JournalError {
    let path = path.to_path_buf();
    move |source| JournalError::Io { path, source }
}

pub struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
    entries: usize,
}

struct Replay<T> {
    records: Vec<T>,
    valid_len: usize,
    missing_newline: bool,
}

impl Journal {
    /// Opens (or creates) the journal and returns every record in it, in write order.
    pub async fn open<T: DeserializeOwned>(
        path: impl Into<PathBuf>,
    ) -> Result<(Self, Vec<T>), JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err(&path))?;
        }

        let raw = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let replay = replay::<T>(&path, &raw)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err(&path))?;

        let mut len = replay.valid_len as u64;
        if replay.valid_len < raw.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = raw.len() - replay.valid_len,
                "journal has a torn tail; truncating"
            );
            file.set_len(len).await.map_err(io_err(&path))?;
            file.sync_all().await.map_err(io_err(&path))?;
        }
        if replay.missing_newline {
            file.write_all(b"\n").await.map_err(io_err(&path))?;
            file.flush().await.map_err(io_err(&path))?;
            file.sync_data().await.map_err(io_err(&path))?;
            len += 1;
        }

        debug!(path = %path.display(), records = replay.records.len(), "journal opened");
        let entries = replay.records.len();
        Ok((
            Self {
                path,
                file,
                len,
                entries,
            },
            replay.records,
        ))
    }

    pub async fn append<T: Serialize>(&mut self, record: &T) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Err(e) = self.write_synced(&line).await {
            // Drop whatever part of the line made it to disk so the next append starts clean.
            if self.file.set_len(self.len).await.is_err() {
                warn!(path = %self.path.display(), "failed to roll back partial journal write");
            }
            return Err(io_err(&self.path)(e));
        }

        self.len += line.len() as u64;
        self.entries += 1;
        Ok(())
    }

    async fn write_synced(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    /// Replaces the journal content with `records`.
    pub async fn compact<'a, T, I>(&mut self, records: I) -> Result<(), JournalError>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut buf = Vec::new();
        let mut count = 0;
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
            count += 1;
        }

        let tmp = PathBuf::from(format!("{}.compact", self.path.display()));
        let mut out = File::create(&tmp).await.map_err(io_err(&tmp))?;
        if let Err(e) = write_all_synced(&mut out, &buf).await {
            drop(out);
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(&tmp)(e));
        }
        drop(out);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(io_err(&self.path))?;
        sync_parent_dir(&self.path).await;

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err(&self.path))?;

        debug!(
            path = %self.path.display(),
            before = self.entries,
            after = count,
            "journal compacted"
        );
        self.len = buf.len() as u64;
        self.entries = count;
        Ok(())
    }

    /// Number of records currently in the file, including superseded ones.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swaps the append handle for a read-only one so every later append fails.
    #[cfg(test)]
    pub async fn reopen_read_only(&mut self) -> Result<(), JournalError> {
        self.file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .await
            .map_err(io_err(&self.path))?;
        Ok(())
    }
}

fn replay<T: DeserializeOwned>(path: &Path, raw: &[u8]) -> Result<Replay<T>, JournalError> {
    let mut records = Vec::new();
    let mut offset = 0;
    let mut line_no = 0;

    while offset < raw.len() {
        line_no += 1;
        let rest = &raw[offset..];
        let (line, terminated) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], true),
            None => (rest, false),
        };
        let next = offset + line.len() + usize::from(terminated);

        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }

        match serde_json::from_slice::<T>(line) {
            Ok(record) => {
                records.push(record);
                if !terminated {
                    return Ok(Replay {
                        records,
                        valid_len: next,
                        missing_newline: true,
                    });
                }
            }
            Err(_) if !terminated => {
                return Ok(Replay {
                    records,
                    valid_len: offset,
                    missing_newline: false,
                });
            }
            Err(source) => {
                return Err(JournalError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    source,
                })
            }
        }
        offset = next;
    }

    Ok(Replay {
        records,
        valid_len: offset,
        missing_newline: false,
    })
}

async fn write_all_synced(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn sync_parent_dir(path: &Path) {
    // Best effort: persists the rename on filesystems that need a directory fsync.
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    if let Ok(dir) = File::open(parent).await {
        let _ = dir.sync_all().await;
    }
}

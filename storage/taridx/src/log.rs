//! The tail log.
//!
//! One text line per insertion, `escape(name),offset,size`, strictly
//! appended in commit order. The last line answers `last()`; the whole
//! file can seed a rebuild. Reading the tail is bounded: at most
//! `2 · max_rec_len + 1` bytes, enough for the final line plus one spare
//! should the final line turn out to be a torn concurrent append.

use std::path::{Path, PathBuf};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{block::MemberRecord, escape, Error, Mode};

/// Append-only record log next to the tree file.
pub struct TailLog {
    file: File,
    path: PathBuf,
    max_rec_len: usize,
    read_only: bool,
}

impl TailLog {
    /// Create a fresh, empty log, truncating any previous file.
    pub async fn create(path: impl AsRef<Path>, max_rec_len: usize) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self {
            file,
            path,
            max_rec_len,
            read_only: false,
        })
    }

    /// Open an existing log.
    pub async fn open(
        path: impl AsRef<Path>,
        mode: Mode,
        max_rec_len: usize,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true);
        if !mode.is_read_only() {
            options.append(true).create(true);
        }
        let file = options.open(&path).await?;
        Ok(Self {
            file,
            path,
            max_rec_len,
            read_only: mode.is_read_only(),
        })
    }

    /// Append one escaped record line.
    pub async fn append(&mut self, record: &MemberRecord) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly {
                path: self.path.clone(),
            });
        }
        let line = format!(
            "{},{},{}\n",
            escape::escape(&record.name),
            record.offset,
            record.size
        );
        self.file.seek(std::io::SeekFrom::End(0)).await?;
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Force appended records to disk.
    pub async fn sync(&mut self) -> Result<(), Error> {
        self.file.sync_data().await?;
        Ok(())
    }

    /// The most recent record, read from a bounded tail window.
    ///
    /// The final line may be a torn concurrent append; in that case the
    /// line before it is the answer. One fallback line is the whole retry
    /// budget — two unreadable lines mean the log is damaged, not racing.
    pub async fn last(&mut self) -> Result<Option<MemberRecord>, Error> {
        let length = self.file.seek(std::io::SeekFrom::End(0)).await?;
        if length == 0 {
            return Ok(None);
        }
        let window = (2 * self.max_rec_len as u64 + 1).min(length);
        self.file
            .seek(std::io::SeekFrom::Start(length - window))
            .await?;
        let mut buffer = vec![0u8; window as usize];
        self.file.read_exact(&mut buffer).await?;

        let mut lines: Vec<&[u8]> = buffer.split(|byte| *byte == b'\n').collect();
        if lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        for (fallback, line) in lines.iter().rev().take(2).enumerate() {
            if let Some(record) = parse_line(line) {
                if fallback > 0 {
                    tracing::warn!(
                        path = %self.path.display(),
                        "tail log ends in an unreadable line, using the one before it"
                    );
                }
                return Ok(Some(record));
            }
        }
        Err(Error::CorruptTailLog {
            path: self.path.clone(),
        })
    }
}

/// Parse `escape(name),offset,size`; anything else is `None`.
fn parse_line(line: &[u8]) -> Option<MemberRecord> {
    let line = std::str::from_utf8(line).ok()?;
    let fields = escape::split_fields(line);
    let [name, offset, size] = fields.as_slice() else {
        return None;
    };
    Some(MemberRecord::new(
        name.clone(),
        offset.parse().ok()?,
        size.parse().ok()?,
    ))
}

//! Write-ahead log for simulation records.
//!
//! Every mutation is appended here before it becomes visible in memory.
//! On open the log is read back up to the first corrupt or truncated
//! entry; anything after that point is cut off so new appends land on a
//! clean tail. A failed append is cut back the same way before the error
//! is returned.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-framed WalEntry]
//! [ENTRY 2: codec-framed WalEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::simulation::{Simulation, SimulationId, SimulationStatus};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number, starting at 1.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged mutation.
    pub kind: WalEntryKind,
}

/// The logged mutation.
///
/// Both kinds carry the full post-image, so replaying an entry twice
/// leaves the same state as replaying it once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A new record.
    Insert(Box<Simulation>),
    /// A successful compare-and-swap.
    StatusSwap {
        /// Record id.
        id: SimulationId,
        /// Status the swap was guarded on.
        expected: SimulationStatus,
        /// Record after the swap.
        record: Box<Simulation>,
    },
}

/// Entries recovered when opening a log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Valid entries in log order.
    pub entries: Vec<WalEntry>,
    /// Bytes cut from a corrupt or torn tail.
    pub discarded_bytes: u64,
}

struct WalWriter {
    file: File,
    len: u64,
    sequence: u64,
    wedged: bool,
}

/// Destination of appended frames.
trait LogSink: Write {
    fn truncate_to(&mut self, len: u64) -> IoResult<()>;
    fn sync(&mut self) -> IoResult<()>;
}

impl LogSink for File {
    fn truncate_to(&mut self, len: u64) -> IoResult<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> IoResult<()> {
        self.sync_all()
    }
}

/// Outcome of a failed append.
struct AppendFailure {
    error: IoError,
    /// The partial frame could not be cut off.
    wedged: bool,
}

/// Writes `frame` at `len`; on any failure the sink is cut back to `len`.
fn append_frame<S: LogSink>(
    sink: &mut S,
    len: u64,
    frame: &[u8],
    sync: bool,
) -> Result<(), AppendFailure> {
    let written = sink
        .write_all(frame)
        .and_then(|()| sink.flush())
        .and_then(|()| if sync { sink.sync() } else { Ok(()) });
    let Err(error) = written else {
        return Ok(());
    };

    match sink.truncate_to(len) {
        Ok(()) => Err(AppendFailure { error, wedged: false }),
        Err(cut) => {
            tracing::error!(
                offset = len,
                error = %cut,
                "could not cut failed append from write-ahead log"
            );
            Err(AppendFailure { error, wedged: true })
        }
    }
}

/// Append-only log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

fn poisoned(context: &'static str) -> IoError {
    IoError::new(ErrorKind::Other, format!("poisoned lock: {context}"))
}

fn open_append(path: &Path) -> IoResult<(File, u64)> {
    let file = OpenOptions::new().append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

fn create_with_header(path: &Path, sync: bool) -> IoResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    codec::write_header(&mut file)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

/// Reads entries until EOF or the first undecodable frame. Returns the
/// entries and the byte offset where valid data ends.
fn read_valid_prefix(path: &Path) -> IoResult<(Vec<WalEntry>, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;

    let mut entries = Vec::new();
    let mut valid_end = codec::HEADER_LEN;
    while valid_end < file_len {
        match codec::decode::<WalEntry>(&mut reader) {
            Ok(entry) => {
                valid_end = reader.stream_position()?;
                entries.push(entry);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    offset = valid_end,
                    error = %e,
                    "write-ahead log ends in a corrupt entry; discarding tail"
                );
                break;
            }
        }
    }
    Ok((entries, valid_end))
}

impl WriteAheadLog {
    /// Opens or creates a log file and returns the recovered entries.
    ///
    /// # Errors
    /// Fails on I/O errors or if an existing file has the wrong header.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, Replay)> {
        let existing_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let replay = if existing_len < codec::HEADER_LEN {
            create_with_header(path, sync_on_write)?;
            Replay::default()
        } else {
            let (entries, valid_end) = read_valid_prefix(path)?;
            let discarded_bytes = existing_len - valid_end;
            if discarded_bytes > 0 {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            Replay {
                entries,
                discarded_bytes,
            }
        };

        let sequence = replay.entries.last().map_or(0, |e| e.sequence);
        let (file, len) = open_append(path)?;
        let wal = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file,
                len,
                sequence,
                wedged: false,
            }),
            sync_on_write,
        };
        Ok((wal, replay))
    }

    fn lock(&self, context: &'static str) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.writer.lock().map_err(|_| poisoned(context))
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// # Errors
    /// Propagates serialization and write failures. A failed write leaves
    /// no partial frame behind and does not advance the sequence number.
    /// If the partial frame cannot be removed, every later append fails
    /// until the log is rewritten or reopened.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.lock("wal.append")?;
        if writer.wedged {
            return Err(IoError::new(
                ErrorKind::Other,
                "write-ahead log holds a partial entry; reopen to recover",
            ));
        }

        let sequence = writer.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        let WalWriter { file, len, .. } = &mut *writer;
        if let Err(failure) = append_frame(file, *len, &encoded, self.sync_on_write) {
            writer.wedged = failure.wedged;
            return Err(failure.error);
        }

        writer.len += encoded.len() as u64;
        writer.sequence = sequence;
        Ok(sequence)
    }

    /// Atomically replaces the log contents with `kinds`.
    ///
    /// The new log is written to a sibling temp file, synced, then renamed
    /// over the old one. A crash at any point leaves either the old or the
    /// new log intact.
    ///
    /// # Errors
    /// Propagates I/O failures; on failure the current log is untouched.
    pub fn rewrite(&self, kinds: impl IntoIterator<Item = WalEntryKind>) -> IoResult<u64> {
        let mut writer = self.lock("wal.rewrite")?;

        let tmp_path = self.path.with_extension("wal.tmp");
        let mut sequence = 0;
        {
            let mut tmp = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            codec::write_header(&mut tmp)?;
            let now = Utc::now();
            for kind in kinds {
                sequence += 1;
                tmp.write_all(&codec::encode(&WalEntry {
                    sequence,
                    timestamp: now,
                    kind,
                })?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        let (file, len) = open_append(&self.path)?;
        *writer = WalWriter {
            file,
            len,
            sequence,
            wedged: false,
        };
        Ok(sequence)
    }

    /// Sequence number of the last appended entry.
    ///
    /// # Errors
    /// Fails only if the writer lock is poisoned.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock("wal.current_sequence")?.sequence)
    }

    /// Size of the log file in bytes.
    ///
    /// # Errors
    /// Propagates metadata failures.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! Durable storage for the Raft log, hard state and latest snapshot.
//!
//! Log file format, one record per entry, little endian:
//! [MAGIC][INDEX][TERM][HAS_COMMAND][LEN][COMMAND][CRC32]
//!
//! The log is append-only; truncation and compaction rewrite it through a
//! temporary file and an atomic rename. A torn final record, left by a crash
//! mid-append, is dropped on open. A damaged record with more data after it
//! fails the open with `Corrupted`, since dropping it would lose entries
//! that may be committed.

use super::{Entry, Index, NodeId, Snapshot, Term};
use crate::common::{crc32, Error, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOG_MAGIC: [u8; 4] = [0x52, 0x4C, 0x4F, 0x47]; // "RLOG"
const LOG_FILE: &str = "raft.log";
const HARD_STATE_FILE: &str = "hardstate";
const SNAPSHOT_FILE: &str = "snapshot";

/// Term, vote and commit index. Must be durable before the node acts on a
/// new term or vote.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub vote: Option<NodeId>,
    pub commit_index: Index,
}

/// Everything a node recovers from its store on startup.
#[derive(Clone, Debug, Default)]
pub struct StoredLog {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<Entry>,
}

/// Storage backend owned exclusively by one Raft node.
pub trait LogStore: Send {
    fn load(&mut self) -> Result<StoredLog>;

    /// Durably append entries following the current last entry.
    fn append(&mut self, entries: &[Entry]) -> Result<()>;

    /// Replace the stored entries wholesale (truncation, compaction).
    fn rewrite(&mut self, entries: &[Entry]) -> Result<()>;

    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()>;

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// In-memory store. Clones share contents, so a test can "restart" a node by
/// building a new one over a clone of the old store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoredLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn load(&mut self) -> Result<StoredLog> {
        Ok(self.inner.lock().clone())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        self.inner.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    fn rewrite(&mut self, entries: &[Entry]) -> Result<()> {
        self.inner.lock().entries = entries.to_vec();
        Ok(())
    }

    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        self.inner.lock().hard_state = hard_state.clone();
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.inner.lock().snapshot = Some(snapshot.clone());
        Ok(())
    }
}

/// File-backed store in a data directory.
pub struct FileStore {
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileStore {
    /// Open or create the store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, writer: None })
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path())?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| Error::Internal("log writer unavailable".into()))
    }

    fn encode_entry(entry: &Entry, buf: &mut Vec<u8>) {
        let command = entry.command.as_deref().unwrap_or(&[]);
        let start = buf.len();
        buf.extend_from_slice(&LOG_MAGIC);
        buf.extend_from_slice(&entry.index.to_le_bytes());
        buf.extend_from_slice(&entry.term.to_le_bytes());
        buf.push(entry.command.is_some() as u8);
        buf.extend_from_slice(&(command.len() as u32).to_le_bytes());
        buf.extend_from_slice(command);
        // Checksum covers everything after the magic.
        let checksum = crc32(&buf[start + LOG_MAGIC.len()..]);
        buf.extend_from_slice(&checksum.to_le_bytes());
    }

    /// Read one record. `Ok(None)` at a clean end of file.
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<Entry>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != LOG_MAGIC {
            return Err(Error::Corrupted("invalid log record magic".into()));
        }

        let mut header = [0u8; 21];
        reader.read_exact(&mut header)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&header[0..8]);
        let index = u64::from_le_bytes(word);
        word.copy_from_slice(&header[8..16]);
        let term = u64::from_le_bytes(word);
        let has_command = header[16] == 1;
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[17..21]);
        let len = u32::from_le_bytes(len) as usize;

        let mut command = vec![0u8; len];
        reader.read_exact(&mut command)?;

        let mut checksum = [0u8; 4];
        reader.read_exact(&mut checksum)?;
        let expected = u32::from_le_bytes(checksum);

        let mut data = Vec::with_capacity(header.len() + len);
        data.extend_from_slice(&header);
        data.extend_from_slice(&command);
        let actual = crc32(&data);
        if actual != expected {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        Ok(Some(Entry {
            index,
            term,
            command: has_command.then_some(command),
        }))
    }

    /// Read all valid entries. The flag reports a torn tail.
    fn replay(&self) -> Result<(Vec<Entry>, bool)> {
        let file = match File::open(self.log_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => return Ok((entries, false)),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(
                        "Dropping torn log record after {} entries",
                        entries.len()
                    );
                    return Ok((entries, true));
                }
                Err(e @ (Error::ChecksumMismatch { .. } | Error::Corrupted(_))) => {
                    // A bad record is only a torn write if nothing follows it.
                    if reader.fill_buf()?.is_empty() {
                        tracing::warn!(
                            "Dropping damaged final log record after {} entries: {}",
                            entries.len(),
                            e
                        );
                        return Ok((entries, true));
                    }
                    return Err(Error::Corrupted(format!(
                        "log record {} is damaged and followed by more data: {}",
                        entries.len() + 1,
                        e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write `bytes` plus a CRC32 trailer to `name` via temp file and rename.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.write_all(&crc32(bytes).to_le_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_checked<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let bytes = match std::fs::read(self.dir.join(name)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 4 {
            return Err(Error::Corrupted(format!("{} is truncated", name)));
        }
        let (payload, trailer) = bytes.split_at(bytes.len() - 4);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(trailer);
        let expected = u32::from_le_bytes(checksum);
        let actual = crc32(payload);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        Ok(Some(bincode::deserialize(payload)?))
    }
}

impl LogStore for FileStore {
    fn load(&mut self) -> Result<StoredLog> {
        let hard_state = self.read_checked(HARD_STATE_FILE)?.unwrap_or_default();
        let snapshot: Option<Snapshot> = self.read_checked(SNAPSHOT_FILE)?;
        let (entries, torn) = self.replay()?;
        if torn {
            self.rewrite(&entries)?;
        }
        Ok(StoredLog {
            hard_state,
            snapshot,
            entries,
        })
    }

    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            Self::encode_entry(entry, &mut buf);
        }
        let writer = self.writer()?;
        writer.write_all(&buf)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn rewrite(&mut self, entries: &[Entry]) -> Result<()> {
        self.writer = None;
        let mut buf = Vec::new();
        for entry in entries {
            Self::encode_entry(entry, &mut buf);
        }
        let tmp = self.dir.join(format!("{}.tmp", LOG_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.log_path())?;
        Ok(())
    }

    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        let bytes = bincode::serialize(hard_state)?;
        self.write_atomic(HARD_STATE_FILE, &bytes)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot)?;
        self.write_atomic(SNAPSHOT_FILE, &bytes)
    }
}

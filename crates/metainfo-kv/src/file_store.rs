//! Durable file-backed KV store with write-ahead log and checkpoint.
//!
//! Reads are served from an in-memory BTreeMap. Every mutation is appended to the
//! WAL and fsynced before it is applied. `checkpoint` writes the full map to a
//! snapshot file and truncates the WAL; `open` loads the snapshot and replays the log.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::KvError;
use crate::kvstore::{check_key, scan_keys, Key, KvStore, Value};

const WAL_FILENAME: &str = "pointers.wal";
const CHECKPOINT_FILENAME: &str = "pointers.snap";

#[derive(Debug, Serialize, Deserialize, Clone)]
enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    op: WalOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Append target of the WAL.
trait WalFile: Write {
    fn len(&self) -> std::io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&self) -> std::io::Result<()>;
}

impl WalFile for File {
    fn len(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> std::io::Result<()> {
        self.sync_all()
    }
}

struct WalWriter<F = File> {
    file: F,
    seq: u64,
}

impl WalWriter {
    fn open(path: &Path, seq: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(WalWriter { file, seq })
    }
}

impl<F: WalFile> WalWriter<F> {
    /// Appends one record. On failure the file is cut back to its previous
    /// length so no partial record is left ahead of later appends.
    fn append(&mut self, op: WalOp) -> Result<(), KvError> {
        let seq = self.seq + 1;
        let entry = WalEntry { seq, op };
        let encoded =
            bincode::serialize(&entry).map_err(|e| KvError::Corrupt(e.to_string()))?;
        let start = self.file.len()?;
        if let Err(e) = self.write_record(&encoded) {
            if let Err(rollback) = self.file.truncate_to(start) {
                warn!(error = %rollback, len = start, "failed to roll back torn WAL record");
            }
            return Err(KvError::Io(e));
        }
        self.seq = seq;
        Ok(())
    }

    fn write_record(&mut self, encoded: &[u8]) -> std::io::Result<()> {
        self.file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        self.file.write_all(encoded)?;
        self.file.sync()
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.truncate_to(0)?;
        self.file.sync()
    }
}

/// Persistent KV store rooted in a directory.
pub struct FileKvStore {
    data: RwLock<BTreeMap<Key, Value>>,
    wal: Mutex<WalWriter>,
    dir: PathBuf,
    closed: AtomicBool,
}

impl FileKvStore {
    /// Opens or creates a store in `dir`, recovering any previous state.
    pub fn open(dir: &Path) -> Result<Self, KvError> {
        fs::create_dir_all(dir)?;

        let mut data = BTreeMap::new();
        let seq = load_checkpoint(&dir.join(CHECKPOINT_FILENAME), &mut data)?;
        let (seq, valid_len) = replay_wal(&dir.join(WAL_FILENAME), &mut data, seq)?;

        debug!(dir = %dir.display(), keys = data.len(), seq, "opened file kv store");

        let wal = WalWriter::open(&dir.join(WAL_FILENAME), seq)?;
        if wal.file.metadata()?.len() > valid_len {
            wal.file.set_len(valid_len)?;
        }
        Ok(Self {
            data: RwLock::new(data),
            wal: Mutex::new(wal),
            dir: dir.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    /// Writes a snapshot of the current state and truncates the WAL.
    pub fn checkpoint(&self) -> Result<(), KvError> {
        self.ensure_open()?;
        // Holding the WAL lock keeps writers out while the snapshot is taken.
        let mut wal = self
            .wal
            .lock()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        let data = self
            .data
            .read()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;

        let checkpoint = Checkpoint {
            seq: wal.seq,
            entries: data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let encoded =
            bincode::serialize(&checkpoint).map_err(|e| KvError::Corrupt(e.to_string()))?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;
        wal.truncate()?;

        debug!(keys = checkpoint.entries.len(), seq = checkpoint.seq, "kv checkpoint written");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), KvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }

    fn apply(&self, op: WalOp) -> Result<(), KvError> {
        let mut wal = self
            .wal
            .lock()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        wal.append(op.clone())?;
        let mut data = self
            .data
            .write()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        match op {
            WalOp::Put { key, value } => {
                data.insert(key, value);
            }
            WalOp::Delete { key } => {
                data.remove(&key);
            }
        }
        Ok(())
    }
}

fn load_checkpoint(path: &Path, data: &mut BTreeMap<Key, Value>) -> Result<u64, KvError> {
    if !path.exists() {
        return Ok(0);
    }
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok(0);
    }
    let checkpoint: Checkpoint = bincode::deserialize(&contents)
        .map_err(|e| KvError::Corrupt(format!("failed to deserialize checkpoint: {}", e)))?;
    data.extend(checkpoint.entries);
    Ok(checkpoint.seq)
}

/// Returns the highest applied sequence number and the length of the intact WAL prefix.
fn replay_wal(
    path: &Path,
    data: &mut BTreeMap<Key, Value>,
    seq: u64,
) -> Result<(u64, u64), KvError> {
    if !path.exists() {
        return Ok((seq, 0));
    }
    let mut file = File::open(path)?;
    let mut max_seq = seq;
    let mut valid_len = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(KvError::Io(e)),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut op_buf = vec![0u8; len];
        match file.read_exact(&mut op_buf) {
            Ok(()) => {}
            // torn tail from a crash mid-append
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(KvError::Io(e)),
        }
        let entry: WalEntry = bincode::deserialize(&op_buf)
            .map_err(|e| KvError::Corrupt(format!("failed to deserialize WAL entry: {}", e)))?;
        valid_len += 4 + len as u64;
        if entry.seq <= seq {
            continue;
        }
        max_seq = max_seq.max(entry.seq);
        match entry.op {
            WalOp::Put { key, value } => {
                data.insert(key, value);
            }
            WalOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
    Ok((max_seq, valid_len))
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> Result<Value, KvError> {
        self.ensure_open()?;
        check_key(key)?;
        let data = self
            .data
            .read()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        data.get(key)
            .cloned()
            .ok_or_else(|| KvError::KeyNotFound(key.to_vec()))
    }

    fn put(&self, key: Key, value: Value) -> Result<(), KvError> {
        self.ensure_open()?;
        check_key(&key)?;
        self.apply(WalOp::Put { key, value })
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.ensure_open()?;
        check_key(key)?;
        self.apply(WalOp::Delete { key: key.to_vec() })
    }

    fn list(&self, start: Option<&[u8]>, limit: usize) -> Result<Vec<Key>, KvError> {
        self.ensure_open()?;
        let data = self
            .data
            .read()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        Ok(scan_keys(&data, start, limit))
    }

    fn close(&self) -> Result<(), KvError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let wal = self
            .wal
            .lock()
            .map_err(|e| KvError::Poisoned(e.to_string()))?;
        wal.file.sync_all()?;
        Ok(())
    }
}

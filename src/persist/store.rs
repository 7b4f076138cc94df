//! Ordered key-value store abstraction and the bundled file-backed store.
//!
//! The engine consumes the store through the `KeyValueStore` trait: an
//! ordered map with atomic multi-key writes. The bundled `FsStore` keeps
//! the live map in memory and appends every mutation to a JSONL log that
//! is replayed on open. One log line is one atomic unit: a torn trailing
//! line (crash mid-write) is discarded as truncation, which is exactly
//! what makes the multi-op `put_many` line all-or-nothing.

use crate::models::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Ordered key-value namespace consumed by the persistence context.
///
/// `scan` iterates in key order. `put_many` is atomic: either every entry
/// is visible after a crash, or none is. Individual puts trade durability
/// for throughput and may be lost on crash until the next `flush`.
pub trait KeyValueStore: Send + Sync {
    fn put(&self, key: &str, value: Value) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn del(&self, key: &str) -> Result<()>;
    fn scan(&self) -> Result<Vec<(String, Value)>>;
    fn put_many(&self, entries: Vec<(String, Value)>) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// One replayable log operation. A `Batch` serializes as a single line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Put { key: String, value: Value },
    Del { key: String },
    Batch { entries: Vec<(String, Value)> },
}

struct Inner {
    map: BTreeMap<String, Value>,
    writer: BufWriter<File>,
}

/// File-backed ordered store: in-memory `BTreeMap` + append-only log.
pub struct FsStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FsStore {
    /// Open (or create) a namespace directory, replaying any existing log.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| EngineError::persistence("creating namespace dir", e))?;
        let log_path = dir.join("log.jsonl");

        let mut map = BTreeMap::new();
        let mut valid_len: u64 = 0;
        if log_path.exists() {
            let file = File::open(&log_path)
                .map_err(|e| EngineError::persistence("opening namespace log", e))?;
            let mut reader = BufReader::new(file);
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader
                    .read_line(&mut line)
                    .map_err(|e| EngineError::persistence("reading namespace log", e))?;
                if n == 0 {
                    break;
                }
                match serde_json::from_str::<LogEntry>(&line) {
                    Ok(entry) => {
                        Self::apply(&mut map, entry);
                        valid_len += n as u64;
                    }
                    Err(e) => {
                        // Torn tail from a crash mid-append. Everything
                        // before this line is intact; drop the rest.
                        warn!(
                            path = %log_path.display(),
                            error = %e,
                            "Discarding torn log tail"
                        );
                        break;
                    }
                }
            }
            let truncate = OpenOptions::new()
                .write(true)
                .open(&log_path)
                .map_err(|e| EngineError::persistence("reopening namespace log", e))?;
            truncate
                .set_len(valid_len)
                .map_err(|e| EngineError::persistence("truncating namespace log", e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| EngineError::persistence("opening namespace log", e))?;

        debug!(dir = %dir.display(), keys = map.len(), "Opened namespace");
        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(Inner {
                map,
                writer: BufWriter::new(file),
            }),
        })
    }

    fn apply(map: &mut BTreeMap<String, Value>, entry: LogEntry) {
        match entry {
            LogEntry::Put { key, value } => {
                map.insert(key, value);
            }
            LogEntry::Del { key } => {
                map.remove(&key);
            }
            LogEntry::Batch { entries } => {
                for (key, value) in entries {
                    map.insert(key, value);
                }
            }
        }
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Internal("namespace lock poisoned".to_string()))
    }

    fn append(inner: &mut Inner, entry: &LogEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(inner.writer, "{line}")
            .map_err(|e| EngineError::persistence("appending to namespace log", e))
    }

    /// Namespace directory on disk.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KeyValueStore for FsStore {
    fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.locked()?;
        Self::append(
            &mut inner,
            &LogEntry::Put {
                key: key.to_string(),
                value: value.clone(),
            },
        )?;
        inner.map.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.locked()?.map.get(key).cloned())
    }

    fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.locked()?;
        Self::append(
            &mut inner,
            &LogEntry::Del {
                key: key.to_string(),
            },
        )?;
        inner.map.remove(key);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, Value)>> {
        Ok(self
            .locked()?
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn put_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut inner = self.locked()?;
        Self::append(
            &mut inner,
            &LogEntry::Batch {
                entries: entries.clone(),
            },
        )?;
        inner
            .writer
            .flush()
            .map_err(|e| EngineError::persistence("flushing namespace log", e))?;
        inner
            .writer
            .get_ref()
            .sync_all()
            .map_err(|e| EngineError::persistence("syncing namespace log", e))?;
        for (key, value) in entries {
            inner.map.insert(key, value);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.locked()?;
        inner
            .writer
            .flush()
            .map_err(|e| EngineError::persistence("flushing namespace log", e))?;
        inner
            .writer
            .get_ref()
            .sync_all()
            .map_err(|e| EngineError::persistence("syncing namespace log", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    #[test]
    fn put_get_del_scan() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        store.put("b", json!(2)).unwrap();
        store.put("a", json!(1)).unwrap();
        store.put("c", json!(3)).unwrap();
        store.del("b").unwrap();

        assert_eq!(store.get("a").unwrap(), Some(json!(1)));
        assert_eq!(store.get("b").unwrap(), None);

        let keys: Vec<String> = store.scan().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn reopen_replays_log() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = FsStore::open(dir.path()).unwrap();
            store.put("x", json!("one")).unwrap();
            store.put("x", json!("two")).unwrap();
            store.del("y").unwrap();
            store.flush().unwrap();
        }
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.get("x").unwrap(), Some(json!("two")));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = FsStore::open(dir.path()).unwrap();
            store.put("keep", json!(1)).unwrap();
            store.flush().unwrap();
        }
        // Simulate a crash mid-append.
        let log = dir.path().join("log.jsonl");
        let mut f = OpenOptions::new().append(true).open(&log).unwrap();
        f.write_all(b"{\"op\":\"put\",\"key\":\"lost").unwrap();
        drop(f);

        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.get("keep").unwrap(), Some(json!(1)));
        assert_eq!(store.get("lost").unwrap(), None);

        // The torn bytes were truncated away; new appends stay parseable.
        store.put("after", json!(2)).unwrap();
        store.flush().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.get("after").unwrap(), Some(json!(2)));
    }

    #[test]
    fn put_many_is_one_line() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = FsStore::open(dir.path()).unwrap();
            store
                .put_many(vec![
                    ("k1".to_string(), json!(1)),
                    ("k2".to_string(), json!(2)),
                ])
                .unwrap();
        }
        let content = std::fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);

        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.get("k1").unwrap(), Some(json!(1)));
        assert_eq!(store.get("k2").unwrap(), Some(json!(2)));
    }
}

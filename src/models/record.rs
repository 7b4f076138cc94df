//! Records and record sources.
//!
//! A record is the unit of work fed into the chain: a stable string id
//! plus an opaque JSON payload. The engine never inspects the payload;
//! only the id participates in bookkeeping and checkpointing.

use crate::models::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// A single input record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier; must be unique within one run
    pub id: String,

    /// Opaque user payload, passed untouched to the first step
    pub payload: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Capability consumed by the engine: a pull-based stream of records.
///
/// `get_next` may suspend (reading a file, a socket, a queue). Returning
/// `None` is the permanent end-of-stream signal; the engine will not call
/// `get_next` again after observing it.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn get_next(&mut self) -> Option<Record>;
}

/// In-memory source over a fixed list of records.
pub struct VecSource {
    records: VecDeque<Record>,
}

impl VecSource {
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: records.into_iter().collect(),
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn get_next(&mut self) -> Option<Record> {
        self.records.pop_front()
    }
}

/// Source reading one JSON record per line from a JSONL file.
///
/// Empty lines are skipped. A line that fails to parse is logged and ends
/// the stream; the records already emitted stay valid.
pub struct JsonlSource {
    reader: BufReader<File>,
    line_num: usize,
}

impl JsonlSource {
    /// Open a JSONL file of `{"id": .., "payload": ..}` records.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).map_err(|e| EngineError::persistence("opening records file", e))?;
        info!(path = %path.display(), "Opened record source");
        Ok(Self {
            reader: BufReader::new(file),
            line_num: 0,
        })
    }
}

#[async_trait]
impl RecordSource for JsonlSource {
    async fn get_next(&mut self) -> Option<Record> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            self.line_num += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(record) => return Some(record),
                Err(e) => {
                    tracing::warn!(line = self.line_num, error = %e, "Malformed record line, ending stream");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn vec_source_drains_in_order() {
        let mut source = VecSource::new(vec![
            Record::new("a", json!(1)),
            Record::new("b", json!(2)),
        ]);
        assert_eq!(source.get_next().await.unwrap().id, "a");
        assert_eq!(source.get_next().await.unwrap().id, "b");
        assert!(source.get_next().await.is_none());
        assert!(source.get_next().await.is_none());
    }

    #[tokio::test]
    async fn jsonl_source_skips_blank_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{"id": "r1", "payload": {{"n": 1}}}}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, r#"{{"id": "r2", "payload": {{"n": 2}}}}"#).unwrap();
        drop(f);

        let mut source = JsonlSource::open(&path).unwrap();
        assert_eq!(source.get_next().await.unwrap().id, "r1");
        assert_eq!(source.get_next().await.unwrap().id, "r2");
        assert!(source.get_next().await.is_none());
    }
}

//! Persistence context: the three durable namespaces of one run.
//!
//! A run directory holds three ordered key-value namespaces:
//! - `status`: batch-wide scalars, written with atomic multi-key snapshots
//! - `records`: record id → pointer at the most recent step snapshot
//! - `steps`: publication id → serialized step execution snapshot
//!
//! Record and step reads are served from write-through caches that are
//! authoritative while the engine runs; a delete removes the cache entry
//! before the disk delete is issued.

use crate::chain::{StepExecution, StepStatus};
use crate::models::{EngineError, Result};
use crate::persist::store::{FsStore, KeyValueStore};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Execution mode of a run; part of the run directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecType {
    Run,
    Retry,
}

impl std::fmt::Display for ExecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecType::Run => write!(f, "RUN"),
            ExecType::Retry => write!(f, "RETRY"),
        }
    }
}

/// Value type of the `records` namespace: where is this record parked?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPointer {
    /// 1-based chain position of the snapshot holding the record
    pub step_index: usize,
    /// Publication id of that snapshot in the `steps` namespace
    pub ser_id: String,
    /// Status of the snapshot at publication time
    pub status: StepStatus,
}

/// Open handles to one run directory's namespaces.
impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("run_dir", &self.run_dir)
            .field("closed", &self.closed)
            .finish()
    }
}

pub struct PersistenceContext {
    run_dir: PathBuf,
    status: Box<dyn KeyValueStore>,
    records: Box<dyn KeyValueStore>,
    steps: Box<dyn KeyValueStore>,
    record_cache: DashMap<String, RecordPointer>,
    step_cache: DashMap<String, StepExecution>,
    closed: AtomicBool,
}

impl PersistenceContext {
    /// Create a fresh run directory `{root}/{name}-[{exec_type}]-{ts}/`.
    pub fn create(root: &Path, name: &str, exec_type: ExecType) -> Result<Self> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let run_dir = root.join(format!("{name}-[{exec_type}]-{stamp}"));
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| EngineError::persistence("creating run dir", e))?;
        debug!(dir = %run_dir.display(), "Created run directory");
        Self::open(run_dir)
    }

    /// Open an existing run directory, e.g. the prior run during retry.
    ///
    /// Fails with `InvalidRunDir` when the three namespaces are missing.
    pub fn open_prior(path: &Path) -> Result<Self> {
        for ns in ["status", "records", "steps"] {
            if !path.join(ns).is_dir() {
                return Err(EngineError::InvalidRunDir(path.display().to_string()));
            }
        }
        Self::open(path.to_path_buf())
    }

    fn open(run_dir: PathBuf) -> Result<Self> {
        let status = FsStore::open(&run_dir.join("status"))?;
        let records = FsStore::open(&run_dir.join("records"))?;
        let steps = FsStore::open(&run_dir.join("steps"))?;
        Ok(Self {
            run_dir,
            status: Box::new(status),
            records: Box::new(records),
            steps: Box::new(steps),
            record_cache: DashMap::new(),
            step_cache: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the run directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    // ─── status ───────────────────────────────────────────────────────

    pub fn put_status(&self, key: &str, value: Value) -> Result<()> {
        self.status.put(key, value)
    }

    /// Atomic multi-key status write: all keys become visible or none.
    pub fn put_many_status(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.status.put_many(entries)
    }

    pub fn get_status(&self, key: &str) -> Result<Option<Value>> {
        self.status.get(key)
    }

    // ─── records ──────────────────────────────────────────────────────

    pub fn put_record(&self, id: &str, pointer: RecordPointer) -> Result<()> {
        self.record_cache.insert(id.to_string(), pointer.clone());
        self.records.put(id, serde_json::to_value(&pointer)?)
    }

    pub fn get_record(&self, id: &str) -> Result<Option<RecordPointer>> {
        if let Some(hit) = self.record_cache.get(id) {
            return Ok(Some(hit.clone()));
        }
        match self.records.get(id)? {
            Some(value) => {
                let pointer: RecordPointer = serde_json::from_value(value)?;
                self.record_cache.insert(id.to_string(), pointer.clone());
                Ok(Some(pointer))
            }
            None => Ok(None),
        }
    }

    pub fn del_record(&self, id: &str) -> Result<()> {
        self.record_cache.remove(id);
        self.records.del(id)
    }

    /// All live record rows in key order.
    pub fn scan_records(&self) -> Result<Vec<(String, RecordPointer)>> {
        self.records
            .scan()?
            .into_iter()
            .map(|(id, value)| Ok((id, serde_json::from_value(value)?)))
            .collect()
    }

    // ─── steps ────────────────────────────────────────────────────────

    pub fn put_step(&self, id: &str, snapshot: &StepExecution) -> Result<()> {
        self.step_cache.insert(id.to_string(), snapshot.clone());
        self.steps.put(id, serde_json::to_value(snapshot)?)
    }

    pub fn get_step(&self, id: &str) -> Result<Option<StepExecution>> {
        if let Some(hit) = self.step_cache.get(id) {
            return Ok(Some(hit.clone()));
        }
        match self.steps.get(id)? {
            Some(value) => {
                let snapshot: StepExecution = serde_json::from_value(value)?;
                self.step_cache.insert(id.to_string(), snapshot.clone());
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub fn del_step(&self, id: &str) -> Result<()> {
        self.step_cache.remove(id);
        self.steps.del(id)
    }

    // ─── lifecycle ────────────────────────────────────────────────────

    /// Flush and release the namespaces. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.status.flush()?;
        self.records.flush()?;
        self.steps.flush()?;
        debug!(dir = %self.run_dir.display(), "Closed persistence context");
        Ok(())
    }
}

impl Drop for PersistenceContext {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(
                dir = %self.run_dir.display(),
                "Persistence context dropped without close, flushing best-effort"
            );
            let _ = self.status.flush();
            let _ = self.records.flush();
            let _ = self.steps.flush();
        }
    }
}

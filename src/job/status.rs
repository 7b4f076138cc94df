//! Batch status: in-memory run metadata, checkpointed as one atomic
//! multi-key snapshot so the on-disk view is never torn.

use crate::persist::ExecType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    NotStarted,
    /// Pulling records from the source
    Injecting,
    /// Source exhausted; flushing partial batches
    Draining,
    FinishedOk,
    FinishedErr,
}

/// Run metadata owned by the controller.
///
/// A plain value: the controller persists snapshots on its behalf, so
/// there is no cycle between status and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub name: String,
    pub exec_type: ExecType,
    pub phase: Phase,
    pub loaded_records: u64,
    pub finalized_records: u64,
    pub failed_records: u64,
    pub last_loaded_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BatchStatus {
    pub fn new(name: impl Into<String>, exec_type: ExecType) -> Self {
        Self {
            name: name.into(),
            exec_type,
            phase: Phase::NotStarted,
            loaded_records: 0,
            finalized_records: 0,
            failed_records: 0,
            last_loaded_id: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Enter `Injecting` and stamp the start time.
    pub fn begin(&mut self) {
        self.phase = Phase::Injecting;
        self.start_time = Some(Utc::now());
    }

    pub fn mark_loaded(&mut self, record_id: &str) {
        self.loaded_records += 1;
        self.last_loaded_id = Some(record_id.to_string());
    }

    pub fn mark_loaded_many(&mut self, count: usize) {
        self.loaded_records += count as u64;
    }

    pub fn mark_finalized(&mut self, count: usize) {
        self.finalized_records += count as u64;
    }

    pub fn mark_failed(&mut self, count: usize) {
        self.failed_records += count as u64;
    }

    /// Records loaded but neither finalized nor failed yet.
    pub fn in_flight(&self) -> u64 {
        self.loaded_records - self.finalized_records - self.failed_records
    }

    /// Stamp the end time and settle the final phase.
    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.phase = if self.failed_records == 0 {
            Phase::FinishedOk
        } else {
            Phase::FinishedErr
        };
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Key/value pairs for the atomic multi-key status write.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        vec![
            ("name".to_string(), json!(self.name)),
            ("exec_type".to_string(), json!(self.exec_type)),
            ("phase".to_string(), json!(self.phase)),
            ("loaded_records".to_string(), json!(self.loaded_records)),
            (
                "finalized_records".to_string(),
                json!(self.finalized_records),
            ),
            ("failed_records".to_string(), json!(self.failed_records)),
            ("last_loaded_id".to_string(), json!(self.last_loaded_id)),
            ("start_time".to_string(), json!(self.start_time)),
            ("end_time".to_string(), json!(self.end_time)),
            ("duration_ms".to_string(), json!(self.duration_ms())),
        ]
    }
}

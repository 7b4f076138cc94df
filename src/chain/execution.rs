//! Step execution results and the checkpoint protocol.
//!
//! A `StepExecution` is the message exchanged between steps and the unit
//! of checkpointing. It is mutated only by the step that currently owns
//! it; every durable publication assigns a fresh time-ordered id so that
//! stale rows in the `steps` namespace can be garbage-collected by id.

use crate::models::{Record, Result};
use crate::persist::{PersistenceContext, RecordPointer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// Status of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    /// Buffered at a step, waiting for the aggregation quantity
    Accumulating,
    /// Handed to the user function
    Processing,
    /// User function returned; at the last step this finalizes
    Successful,
    /// User function raised, or the input was malformed
    Failed,
}

/// Outcome of one step's work on a set of records.
///
/// `id` is `None` until the first publication; each publication replaces
/// it. A `Successful` execution at the last chain position is terminal:
/// publishing it removes the per-record bookkeeping instead of adding to
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Publication id; assigned fresh on every durable publication
    pub id: Option<String>,

    /// 1-based chain position; 0 is the bootstrap emitted per record
    pub step_index: usize,

    /// Current status
    pub status: StepStatus,

    /// Record ids whose fate is tied to this execution, in arrival order
    pub dependent_records: Vec<String>,

    /// Upstream output payloads buffered at this step
    pub acc_payload: Vec<Value>,

    /// The user function's return value, once it has run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_payload: Option<Value>,

    /// Failure description, set iff `status == Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepExecution {
    /// Bootstrap execution wrapping one fresh record (chain position 0).
    pub fn bootstrap(record: &Record) -> Self {
        Self {
            id: None,
            step_index: 0,
            status: StepStatus::Successful,
            dependent_records: vec![record.id.clone()],
            acc_payload: Vec::new(),
            output_payload: Some(record.payload.clone()),
            error: None,
        }
    }

    /// Snapshot of a step's pending buffers, pre-dispatch.
    pub(crate) fn snapshot(
        step_index: usize,
        dependent_records: Vec<String>,
        acc_payload: Vec<Value>,
    ) -> Self {
        Self {
            id: None,
            step_index,
            status: StepStatus::Accumulating,
            dependent_records,
            acc_payload,
            output_payload: None,
            error: None,
        }
    }

    /// Failed execution synthesized by a step.
    pub(crate) fn failed(
        step_index: usize,
        dependent_records: Vec<String>,
        acc_payload: Vec<Value>,
        error: String,
    ) -> Self {
        Self {
            id: None,
            step_index,
            status: StepStatus::Failed,
            dependent_records,
            acc_payload,
            output_payload: None,
            error: Some(error),
        }
    }

    /// Why this execution cannot feed an aggregator, if it cannot.
    pub(crate) fn reject_reason(&self) -> Option<&'static str> {
        if self.status != StepStatus::Successful {
            Some("status is not SUCCESSFUL")
        } else if self.output_payload.as_ref().is_none_or(Value::is_null) {
            Some("output payload is empty")
        } else if self.dependent_records.is_empty() {
            Some("no dependent records")
        } else {
            None
        }
    }

    /// Publish this state durably.
    ///
    /// Non-terminal publications write the snapshot into `steps` and
    /// repoint every dependent record row at it, garbage-collecting the
    /// rows the records pointed at before. A terminal publication
    /// (`terminal == true`, only ever a `Successful` execution at the
    /// last step) removes the record rows and their prior snapshots
    /// instead: finalization.
    pub fn publish(&mut self, ctx: &PersistenceContext, terminal: bool) -> Result<()> {
        let id = Uuid::now_v7().to_string();

        if matches!(
            self.status,
            StepStatus::Accumulating | StepStatus::Processing | StepStatus::Failed
        ) {
            let mut snapshot = self.clone();
            snapshot.id = Some(id.clone());
            ctx.put_step(&id, &snapshot)?;
        }

        let mut collected: HashSet<String> = HashSet::new();
        for rec_id in &self.dependent_records {
            let prior = ctx.get_record(rec_id)?;
            if terminal {
                ctx.del_record(rec_id)?;
            } else {
                ctx.put_record(
                    rec_id,
                    RecordPointer {
                        step_index: self.step_index,
                        ser_id: id.clone(),
                        status: self.status,
                    },
                )?;
            }
            if let Some(prior) = prior {
                if prior.ser_id != id && collected.insert(prior.ser_id.clone()) {
                    ctx.del_step(&prior.ser_id)?;
                }
            }
        }

        self.id = Some(id);
        debug!(
            ser_id = self.id.as_deref().unwrap_or(""),
            step = self.step_index,
            status = ?self.status,
            records = self.dependent_records.len(),
            terminal,
            "Published step execution"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::ExecType;
    use serde_json::json;

    fn ctx() -> (tempfile::TempDir, PersistenceContext) {
        let root = tempfile::TempDir::new().unwrap();
        let ctx = PersistenceContext::create(root.path(), "job", ExecType::Run).unwrap();
        (root, ctx)
    }

    #[test]
    fn bootstrap_carries_the_record() {
        let record = Record::new("r1", json!({"n": 1}));
        let ser = StepExecution::bootstrap(&record);
        assert_eq!(ser.step_index, 0);
        assert_eq!(ser.status, StepStatus::Successful);
        assert_eq!(ser.dependent_records, vec!["r1"]);
        assert_eq!(ser.output_payload, Some(json!({"n": 1})));
        assert!(ser.reject_reason().is_none());
    }

    #[test]
    fn rejects_malformed_input() {
        let record = Record::new("r1", json!(1));
        let mut ser = StepExecution::bootstrap(&record);
        ser.status = StepStatus::Accumulating;
        assert!(ser.reject_reason().is_some());

        let mut ser = StepExecution::bootstrap(&record);
        ser.output_payload = None;
        assert!(ser.reject_reason().is_some());

        let mut ser = StepExecution::bootstrap(&record);
        ser.dependent_records.clear();
        assert!(ser.reject_reason().is_some());
    }

    #[test]
    fn publish_writes_rows_and_collects_priors() {
        let (_root, ctx) = ctx();

        let mut first = StepExecution::snapshot(
            1,
            vec!["a".to_string(), "b".to_string()],
            vec![json!(1), json!(2)],
        );
        first.publish(&ctx, false).unwrap();
        let first_id = first.id.clone().unwrap();

        let ptr = ctx.get_record("a").unwrap().unwrap();
        assert_eq!(ptr.ser_id, first_id);
        assert_eq!(ptr.step_index, 1);
        assert!(ctx.get_step(&first_id).unwrap().is_some());

        // Republication: fresh id, prior snapshot collected.
        let mut second = first.clone();
        second.status = StepStatus::Processing;
        second.publish(&ctx, false).unwrap();
        let second_id = second.id.clone().unwrap();

        assert_ne!(first_id, second_id);
        assert!(ctx.get_step(&first_id).unwrap().is_none());
        assert_eq!(ctx.get_record("b").unwrap().unwrap().ser_id, second_id);
    }

    #[test]
    fn terminal_publish_finalizes() {
        let (_root, ctx) = ctx();

        let mut parked =
            StepExecution::snapshot(2, vec!["a".to_string(), "b".to_string()], vec![json!(1)]);
        parked.publish(&ctx, false).unwrap();
        let parked_id = parked.id.clone().unwrap();

        let mut terminal = parked.clone();
        terminal.status = StepStatus::Successful;
        terminal.output_payload = Some(json!("done"));
        terminal.publish(&ctx, true).unwrap();

        assert!(ctx.get_record("a").unwrap().is_none());
        assert!(ctx.get_record("b").unwrap().is_none());
        assert!(ctx.get_step(&parked_id).unwrap().is_none());
        assert_eq!(ctx.scan_records().unwrap().len(), 0);
    }

    #[test]
    fn failed_publish_leaves_rows_for_retry() {
        let (_root, ctx) = ctx();

        let mut failed = StepExecution::failed(
            1,
            vec!["a".to_string()],
            vec![json!(1)],
            "boom".to_string(),
        );
        failed.publish(&ctx, false).unwrap();
        let id = failed.id.clone().unwrap();

        let ptr = ctx.get_record("a").unwrap().unwrap();
        assert_eq!(ptr.status, StepStatus::Failed);
        let snap = ctx.get_step(&id).unwrap().unwrap();
        assert_eq!(snap.error.as_deref(), Some("boom"));
    }
}

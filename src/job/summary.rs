//! Run summary: the human-readable resume written on completion.
//!
//! Scans the residual `records` namespace and serializes what is left
//! unfinished to `execution-resume.json` in the run directory.

use crate::job::status::Phase;
use crate::models::{EngineError, Result};
use crate::persist::PersistenceContext;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SUMMARY_FILE: &str = "execution-resume.json";

/// One residual record: where it stopped and why.
#[derive(Debug, Clone, Serialize)]
pub struct IncompleteRecord {
    pub record_id: String,
    pub step_index: usize,
    pub status: crate::chain::StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resume of one finished run.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub status: Phase,
    pub incomplete_records: usize,
    /// Omitted when the residual count exceeds the configured limit
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub incomplete_records_details: Vec<IncompleteRecord>,
    /// Pointer at the raw namespace when the detail list was withheld
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_database: Option<String>,
}

impl RunSummary {
    /// Build the summary from the residual `records` namespace.
    pub fn generate(
        ctx: &PersistenceContext,
        phase: Phase,
        detail_limit: usize,
    ) -> Result<Self> {
        let rows = ctx.scan_records()?;
        let incomplete = rows.len();

        if incomplete > detail_limit {
            return Ok(Self {
                status: phase,
                incomplete_records: incomplete,
                incomplete_records_details: Vec::new(),
                records_database: Some(
                    ctx.run_dir().join("records").display().to_string(),
                ),
            });
        }

        let mut snapshots: HashMap<String, Option<String>> = HashMap::new();
        let mut details = Vec::with_capacity(incomplete);
        for (record_id, pointer) in rows {
            let error = if let Some(cached) = snapshots.get(&pointer.ser_id).cloned() {
                cached
            } else {
                let error = ctx
                    .get_step(&pointer.ser_id)?
                    .and_then(|snapshot| snapshot.error);
                snapshots.insert(pointer.ser_id.clone(), error.clone());
                error
            };
            details.push(IncompleteRecord {
                record_id,
                step_index: pointer.step_index,
                status: pointer.status,
                error,
            });
        }

        Ok(Self {
            status: phase,
            incomplete_records: incomplete,
            incomplete_records_details: details,
            records_database: None,
        })
    }

    /// Write the summary atomically (temp file + rename).
    pub fn write(&self, run_dir: &Path) -> Result<PathBuf> {
        let path = run_dir.join(SUMMARY_FILE);
        let temp = run_dir.join(format!("{SUMMARY_FILE}.tmp"));

        let file =
            File::create(&temp).map_err(|e| EngineError::persistence("creating summary", e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        std::fs::rename(&temp, &path)
            .map_err(|e| EngineError::persistence("renaming summary", e))?;

        debug!(path = %path.display(), incomplete = self.incomplete_records, "Wrote run summary");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StepExecution;
    use crate::persist::ExecType;
    use serde_json::json;

    fn residual(ctx: &PersistenceContext, ids: &[&str]) {
        let mut ser = StepExecution::snapshot(
            1,
            ids.iter().map(|s| s.to_string()).collect(),
            vec![json!(1)],
        );
        ser.publish(ctx, false).unwrap();
    }

    #[test]
    fn summarizes_residual_records() {
        let root = tempfile::TempDir::new().unwrap();
        let ctx = PersistenceContext::create(root.path(), "job", ExecType::Run).unwrap();
        residual(&ctx, &["a", "b"]);

        let summary = RunSummary::generate(&ctx, Phase::FinishedErr, 100).unwrap();
        assert_eq!(summary.incomplete_records, 2);
        assert_eq!(summary.incomplete_records_details.len(), 2);
        assert!(summary.records_database.is_none());

        let path = summary.write(ctx.run_dir()).unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("\"incomplete_records\": 2"));
    }

    #[test]
    fn over_limit_points_at_the_namespace() {
        let root = tempfile::TempDir::new().unwrap();
        let ctx = PersistenceContext::create(root.path(), "job", ExecType::Run).unwrap();
        residual(&ctx, &["a", "b", "c"]);

        let summary = RunSummary::generate(&ctx, Phase::FinishedErr, 2).unwrap();
        assert_eq!(summary.incomplete_records, 3);
        assert!(summary.incomplete_records_details.is_empty());
        assert!(summary
            .records_database
            .as_deref()
            .unwrap()
            .ends_with("records"));
    }

    #[test]
    fn clean_run_is_empty() {
        let root = tempfile::TempDir::new().unwrap();
        let ctx = PersistenceContext::create(root.path(), "job", ExecType::Run).unwrap();
        let summary = RunSummary::generate(&ctx, Phase::FinishedOk, 100).unwrap();
        assert_eq!(summary.incomplete_records, 0);
        assert_eq!(summary.status, Phase::FinishedOk);
    }
}

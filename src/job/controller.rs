//! The batch job controller: pumps records from the source, enforces the
//! concurrency window, drives the chain, drains, and retries prior runs.
//!
//! Concurrency model: `max_concurrent_records = pipeline_fan_in ×
//! concurrency_multiplier` pump tasks. Each pump iteration injects one
//! record. A terminal success of k records frees k slots and schedules k
//! fresh iterations; a parked record keeps its slot occupied until later
//! arrivals (or the drain) unpark it; slots lost to a failed batch are
//! not replenished. The in-flight record count never exceeds the window,
//! and the window only shrinks.

use crate::chain::{StepChain, StepExecution, StepStatus};
use crate::job::builder::BatchJobBuilder;
use crate::job::status::{BatchStatus, Phase};
use crate::job::summary::RunSummary;
use crate::models::{EngineError, JobConfig, RecordSource, Result};
use crate::persist::{ExecType, PersistenceContext};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Final state of a finished run or retry.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: BatchStatus,
    pub run_dir: PathBuf,
    pub summary_path: Option<PathBuf>,
}

/// A configured batch job. Built with [`BatchJob::builder`]; drive it
/// with [`run`](BatchJob::run) or [`retry`](BatchJob::retry), one
/// execution at a time.
pub struct BatchJob {
    config: JobConfig,
    chain: Arc<StepChain>,
    source: Arc<tokio::sync::Mutex<Box<dyn RecordSource>>>,
}

/// Shared state of one execution, owned across pump tasks.
struct RunState {
    chain: Arc<StepChain>,
    ctx: Arc<PersistenceContext>,
    source: Arc<tokio::sync::Mutex<Box<dyn RecordSource>>>,
    status: std::sync::Mutex<BatchStatus>,
}

impl RunState {
    /// Mutate the status and persist the snapshot atomically, under the
    /// status lock so concurrent snapshots cannot regress on disk.
    fn update_status(&self, f: impl FnOnce(&mut BatchStatus)) -> Result<()> {
        let mut status = self
            .status
            .lock()
            .map_err(|_| EngineError::Internal("status lock poisoned".to_string()))?;
        f(&mut status);
        self.ctx.put_many_status(status.snapshot())
    }

    fn phase(&self) -> Phase {
        self.status
            .lock()
            .map(|s| s.phase)
            .unwrap_or(Phase::FinishedErr)
    }
}

/// What one pump iteration did to the concurrency window.
enum PumpOutcome {
    /// k records left the chain finalized; k slots free
    Finalized(usize),
    /// k records left the chain failed; their slots are lost
    FailedBatch(usize),
    /// The record parked in an aggregator; its slot stays occupied
    Parked,
    /// End of stream observed (or drain already underway)
    SourceDone,
}

/// One pump iteration: pull, bootstrap, execute, classify.
async fn pump(state: Arc<RunState>) -> Result<PumpOutcome> {
    if state.phase() != Phase::Injecting {
        return Ok(PumpOutcome::SourceDone);
    }

    let record = {
        let mut source = state.source.lock().await;
        source.get_next().await
    };
    let Some(record) = record else {
        let mut drained_now = false;
        state.update_status(|s| {
            if s.phase == Phase::Injecting {
                s.phase = Phase::Draining;
                drained_now = true;
            }
        })?;
        if drained_now {
            info!("Source exhausted, entering drain");
        }
        return Ok(PumpOutcome::SourceDone);
    };

    state.update_status(|s| s.mark_loaded(&record.id))?;
    debug!(record = %record.id, "Injecting record");

    let bootstrap = StepExecution::bootstrap(&record);
    let result = state.chain.execute(&state.ctx, bootstrap).await?;
    match result.status {
        StepStatus::Successful => {
            let count = result.dependent_records.len();
            state.update_status(|s| s.mark_finalized(count))?;
            Ok(PumpOutcome::Finalized(count))
        }
        StepStatus::Failed => {
            let count = result.dependent_records.len();
            state.update_status(|s| s.mark_failed(count))?;
            Ok(PumpOutcome::FailedBatch(count))
        }
        _ => Ok(PumpOutcome::Parked),
    }
}

/// Count a set of drain outcomes into the status.
fn tally(state: &RunState, outcomes: &[StepExecution]) -> Result<()> {
    for outcome in outcomes {
        let count = outcome.dependent_records.len();
        match outcome.status {
            StepStatus::Successful => state.update_status(|s| s.mark_finalized(count))?,
            StepStatus::Failed => state.update_status(|s| s.mark_failed(count))?,
            _ => warn!(status = ?outcome.status, "Unexpected drain outcome"),
        }
    }
    Ok(())
}

impl BatchJob {
    pub fn builder() -> BatchJobBuilder {
        BatchJobBuilder::new()
    }

    pub(crate) fn assemble(
        config: JobConfig,
        chain: StepChain,
        source: Box<dyn RecordSource>,
    ) -> Self {
        Self {
            config,
            chain: Arc::new(chain),
            source: Arc::new(tokio::sync::Mutex::new(source)),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// The concurrency window: `pipeline_fan_in × concurrency_multiplier`.
    pub fn max_concurrent_records(&self) -> usize {
        self.chain.pipeline_fan_in() * self.config.concurrency_multiplier
    }

    /// Execute the job over a fresh run directory.
    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let fan_in = self.chain.pipeline_fan_in();
        let max_concurrent = self.max_concurrent_records();
        self.chain.set_draining(false);

        let ctx = Arc::new(PersistenceContext::create(
            &self.config.root_dir,
            &self.config.name,
            ExecType::Run,
        )?);
        let mut status = BatchStatus::new(&self.config.name, ExecType::Run);
        status.begin();
        ctx.put_many_status(status.snapshot())?;

        info!(
            name = %self.config.name,
            steps = self.chain.len(),
            pipeline_fan_in = fan_in,
            max_concurrent,
            "Starting batch run"
        );

        let state = Arc::new(RunState {
            chain: Arc::clone(&self.chain),
            ctx: Arc::clone(&ctx),
            source: Arc::clone(&self.source),
            status: std::sync::Mutex::new(status),
        });

        let outcome = self.drive(&state, max_concurrent).await;
        self.finish(state, ctx, started, outcome)
    }

    /// Pump until the source is exhausted and every record settled.
    async fn drive(&self, state: &Arc<RunState>, max_concurrent: usize) -> Result<()> {
        let pb = self.spinner();
        let mut tasks: JoinSet<Result<PumpOutcome>> = JoinSet::new();
        for _ in 0..max_concurrent {
            tasks.spawn(pump(Arc::clone(state)));
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(EngineError::Internal(format!("pump task panicked: {e}")));
                }
            };

            let refill = match outcome {
                PumpOutcome::Finalized(k) => k,
                // Slots lost to a failed batch are not replenished; the
                // window shrinks for the rest of the run.
                PumpOutcome::FailedBatch(_) => 0,
                PumpOutcome::Parked | PumpOutcome::SourceDone => 0,
            };
            if refill > 0 && state.phase() == Phase::Injecting {
                for _ in 0..refill {
                    tasks.spawn(pump(Arc::clone(state)));
                }
            }

            if let Some(pb) = &pb {
                if let Ok(s) = state.status.lock() {
                    pb.set_message(format!(
                        "loaded: {}, finalized: {}, failed: {}",
                        s.loaded_records, s.finalized_records, s.failed_records
                    ));
                }
            }
        }

        // Every pump slot has retired, so each record still in flight is
        // parked in a buffer. Failures may have exhausted the window
        // before the source ended; no slot remains to pull, so that is
        // end of input for this run.
        if state.phase() == Phase::Injecting {
            warn!("Concurrency window exhausted by failures before end of input");
            state.update_status(|s| s.phase = Phase::Draining)?;
        }

        let parked = state.chain.records_in_chain();
        if parked > 0 {
            info!(parked, "Flushing partial batches");
            let outcomes = state.chain.force_tail(&state.ctx).await?;
            tally(state, &outcomes)?;
        }

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        Ok(())
    }

    /// Re-attempt the residual records of a prior run.
    ///
    /// Two phases: every residual snapshot of the prior run is collected
    /// and re-injected into the chain in ascending step order, then a
    /// single drain pass pushes the re-seeded state through. A clean
    /// prior run injects nothing and finishes immediately.
    pub async fn retry(&self, prior_run: &Path) -> Result<RunReport> {
        let started = Instant::now();
        self.chain.set_draining(false);

        let prior = PersistenceContext::open_prior(prior_run)?;
        let ctx = Arc::new(PersistenceContext::create(
            &self.config.root_dir,
            &self.config.name,
            ExecType::Retry,
        )?);
        let mut status = BatchStatus::new(&self.config.name, ExecType::Retry);
        status.begin();
        ctx.put_many_status(status.snapshot())?;

        info!(
            name = %self.config.name,
            prior = %prior_run.display(),
            "Starting retry"
        );

        let state = Arc::new(RunState {
            chain: Arc::clone(&self.chain),
            ctx: Arc::clone(&ctx),
            source: Arc::clone(&self.source),
            status: std::sync::Mutex::new(status),
        });

        let outcome = self.replay(&state, &prior).await;
        if let Err(e) = prior.close() {
            warn!(error = %e, "Failed to close prior run context");
        }
        self.finish(state, ctx, started, outcome)
    }

    async fn replay(&self, state: &Arc<RunState>, prior: &PersistenceContext) -> Result<()> {
        // Phase 1: collect every distinct residual snapshot, ascending by
        // step index so upstream records rejoin before deeper steps drain.
        let rows = prior.scan_records()?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut injections: Vec<(usize, StepExecution)> = Vec::new();
        for (record_id, pointer) in rows {
            if !seen.insert(pointer.ser_id.clone()) {
                continue;
            }
            match prior.get_step(&pointer.ser_id)? {
                Some(snapshot) => injections.push((pointer.step_index, snapshot)),
                None => warn!(
                    record = %record_id,
                    ser_id = %pointer.ser_id,
                    "Residual record row without step snapshot, skipping"
                ),
            }
        }

        if injections.is_empty() {
            info!("No residual records, nothing to retry");
            state.update_status(|s| s.phase = Phase::Draining)?;
            return Ok(());
        }
        injections.sort_by_key(|(index, _)| *index);

        for (index, snapshot) in &injections {
            if *index == 0 || *index > self.chain.len() {
                return Err(EngineError::Configuration(format!(
                    "prior run references step index {index}, chain has {} steps",
                    self.chain.len()
                )));
            }
            self.chain
                .inject_recovered_state(&state.ctx, snapshot, *index)?;
            state.update_status(|s| s.mark_loaded_many(snapshot.dependent_records.len()))?;
        }
        info!(
            snapshots = injections.len(),
            records = state.chain.records_in_chain(),
            "Re-injected residual state"
        );
        state.update_status(|s| s.phase = Phase::Draining)?;

        // Phase 2: one drain pass over the re-seeded chain.
        let outcomes = state.chain.force_tail(&state.ctx).await?;
        tally(state, &outcomes)
    }

    /// Settle the final status, write the summary, close the context.
    /// Runs on both the clean and the fatal path; a fatal error is
    /// re-raised after the final snapshot was attempted.
    fn finish(
        &self,
        state: Arc<RunState>,
        ctx: Arc<PersistenceContext>,
        started: Instant,
        outcome: Result<()>,
    ) -> Result<RunReport> {
        let status = {
            let mut s = state
                .status
                .lock()
                .map_err(|_| EngineError::Internal("status lock poisoned".to_string()))?;
            if outcome.is_ok() {
                s.finish();
            } else {
                s.phase = Phase::FinishedErr;
                s.end_time = Some(Utc::now());
            }
            s.clone()
        };

        if let Err(e) = ctx.put_many_status(status.snapshot()) {
            error!(error = %e, "Failed to write final status snapshot");
        }

        let summary_path = RunSummary::generate(&ctx, status.phase, self.config.summary_detail_limit)
            .and_then(|summary| summary.write(ctx.run_dir()))
            .map_err(|e| error!(error = %e, "Failed to write run summary"))
            .ok();

        if let Err(e) = ctx.close() {
            error!(error = %e, "Failed to close persistence context");
        }

        info!(
            phase = ?status.phase,
            loaded = status.loaded_records,
            finalized = status.finalized_records,
            failed = status.failed_records,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );

        outcome?;
        Ok(RunReport {
            status,
            run_dir: ctx.run_dir().to_path_buf(),
            summary_path,
        })
    }

    fn spinner(&self) -> Option<ProgressBar> {
        if !self.config.progress {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    }
}

/// Locate the most recent run directory for a job name under `root`.
///
/// Matches `{name}-[RUN]-{ts}` and `{name}-[RETRY]-{ts}` directories;
/// the compact timestamp format sorts lexicographically.
pub fn find_latest_run(root: &Path, name: &str) -> Result<Option<PathBuf>> {
    let pattern = root
        .join(format!("{}-*", glob::Pattern::escape(name)))
        .display()
        .to_string();
    let re = Regex::new(&format!(
        r"^{}-\[(?:RUN|RETRY)\]-(\d{{8}}T\d{{6}}\.\d{{3}}Z)$",
        regex::escape(name)
    ))
    .map_err(|e| EngineError::Internal(format!("run dir pattern: {e}")))?;

    let mut best: Option<(String, PathBuf)> = None;
    let entries =
        glob::glob(&pattern).map_err(|e| EngineError::Internal(format!("invalid glob: {e}")))?;
    for entry in entries.flatten() {
        if !entry.is_dir() {
            continue;
        }
        let Some(dirname) = entry.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(captures) = re.captures(dirname) {
            let stamp = captures[1].to_string();
            if best.as_ref().is_none_or(|(b, _)| *b < stamp) {
                best = Some((stamp, entry));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_latest_run_prefers_newest() {
        let root = tempfile::TempDir::new().unwrap();
        for dir in [
            "job-[RUN]-20260101T000000.000Z",
            "job-[RETRY]-20260102T000000.000Z",
            "job-[RUN]-20260101T120000.000Z",
            "other-[RUN]-20269999T000000.000Z",
            "job-not-a-run-dir",
        ] {
            std::fs::create_dir(root.path().join(dir)).unwrap();
        }

        let latest = find_latest_run(root.path(), "job").unwrap().unwrap();
        assert!(latest
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("RETRY"));
    }

    #[test]
    fn find_latest_run_empty_root() {
        let root = tempfile::TempDir::new().unwrap();
        assert!(find_latest_run(root.path(), "job").unwrap().is_none());
    }
}

//! Builder for batch jobs: the embedder-facing assembly API.

use crate::chain::{BatchStep, StepChain};
use crate::job::controller::BatchJob;
use crate::models::{EngineError, JobConfig, RecordSource, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Assembles a [`BatchJob`] from a name, a source and a step chain.
///
/// ```no_run
/// # use batchflow::{BatchJob, VecSource};
/// # fn steps() -> Vec<std::sync::Arc<dyn batchflow::BatchStep>> { vec![] }
/// # async fn build() -> batchflow::Result<()> {
/// let mut builder = BatchJob::builder()
///     .name("nightly-import")
///     .concurrency_multiplier(4)
///     .source(VecSource::new(vec![]));
/// for step in steps() {
///     builder = builder.add_step_arc(step);
/// }
/// let job = builder.build()?;
/// job.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct BatchJobBuilder {
    name: Option<String>,
    concurrency_multiplier: usize,
    root_dir: Option<PathBuf>,
    summary_detail_limit: Option<usize>,
    progress: bool,
    steps: Vec<Arc<dyn BatchStep>>,
    source: Option<Box<dyn RecordSource>>,
}

impl BatchJobBuilder {
    pub fn new() -> Self {
        Self {
            concurrency_multiplier: 1,
            ..Self::default()
        }
    }

    /// Job name; prefixes the run directory.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Concurrency window per unit of chain fan-in (default 1).
    pub fn concurrency_multiplier(mut self, multiplier: usize) -> Self {
        self.concurrency_multiplier = multiplier;
        self
    }

    /// Directory under which run directories are created (default: cwd).
    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    /// Cap on per-record entries in the resume summary (default 10 000).
    pub fn summary_detail_limit(mut self, limit: usize) -> Self {
        self.summary_detail_limit = Some(limit);
        self
    }

    /// Show a terminal spinner while the job runs (default off).
    pub fn progress(mut self, on: bool) -> Self {
        self.progress = on;
        self
    }

    /// The record source to pump.
    pub fn source(mut self, source: impl RecordSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Append a step to the chain.
    pub fn add_step(mut self, step: impl BatchStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Append an already-shared step to the chain.
    pub fn add_step_arc(mut self, step: Arc<dyn BatchStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate and assemble the job.
    pub fn build(self) -> Result<BatchJob> {
        let name = match self.name {
            Some(n) if !n.trim().is_empty() => n,
            _ => {
                return Err(EngineError::Configuration(
                    "job name must be set and non-empty".to_string(),
                ))
            }
        };
        if self.steps.is_empty() {
            return Err(EngineError::Configuration(
                "chain must have at least one step".to_string(),
            ));
        }
        if self.concurrency_multiplier == 0 {
            return Err(EngineError::Configuration(
                "concurrency multiplier must be at least 1".to_string(),
            ));
        }
        let source = self.source.ok_or_else(|| {
            EngineError::Configuration("a record source must be set".to_string())
        })?;

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name().trim().is_empty() {
                return Err(EngineError::Configuration(
                    "step names must be non-empty".to_string(),
                ));
            }
            if step.aggregation_quantity() == 0 {
                return Err(EngineError::Configuration(format!(
                    "step '{}' has aggregation quantity 0",
                    step.name()
                )));
            }
            if !names.insert(step.name().to_string()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate step '{}' in chain",
                    step.name()
                )));
            }
        }

        let mut config = JobConfig::new(name);
        config.concurrency_multiplier = self.concurrency_multiplier;
        if let Some(dir) = self.root_dir {
            config.root_dir = dir;
        }
        if let Some(limit) = self.summary_detail_limit {
            config.summary_detail_limit = limit;
        }
        config.progress = self.progress;

        Ok(BatchJob::assemble(config, StepChain::new(self.steps), source))
    }
}

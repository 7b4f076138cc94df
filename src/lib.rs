//! batchflow - embeddable batch-processing engine with crash-recoverable
//! retry.
//!
//! ## Architecture
//!
//! Records pulled from a user [`RecordSource`] are driven through a
//! linear chain of aggregating [`BatchStep`]s:
//!
//! - **Chain**: each step buffers upstream payloads until its
//!   aggregation quantity is reached, then invokes the user function and
//!   hands the result to its successor
//! - **Controller**: keeps `pipeline_fan_in × concurrency_multiplier`
//!   records in flight; when the source ends, partial batches are
//!   drained through the chain tail-first
//! - **Persistence**: every state transition of an in-flight batch is
//!   checkpointed into an ordered key-value run directory, so
//!   [`BatchJob::retry`] can rehydrate exactly the unfinished work of a
//!   crashed or failed run
//!
//! ## Usage
//!
//! Assemble a job with the builder and run it:
//!
//! ```no_run
//! # use batchflow::*;
//! # use serde_json::{json, Value};
//! # struct Normalize;
//! # #[async_trait::async_trait]
//! # impl BatchStep for Normalize {
//! #     fn name(&self) -> &str { "normalize" }
//! #     fn aggregation_quantity(&self) -> usize { 10 }
//! #     async fn apply(&self, batch: Vec<Value>) -> std::result::Result<Value, BoxError> {
//! #         Ok(json!(batch))
//! #     }
//! # }
//! # async fn demo() -> Result<()> {
//! let job = BatchJob::builder()
//!     .name("nightly-import")
//!     .concurrency_multiplier(4)
//!     .source(VecSource::new(vec![Record::new("r1", json!({"n": 1}))]))
//!     .add_step(Normalize)
//!     .build()?;
//! let report = job.run().await?;
//! if report.status.failed_records > 0 {
//!     job.retry(&report.run_dir).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Failures are counted, never fatal: a run with failed records finishes
//! `FINISHED_ERR` with every unfinished record preserved on disk, and a
//! retry over that directory re-attempts exactly those records.

pub mod chain;
pub mod job;
pub mod models;
pub mod persist;

// Re-exports for convenience
pub use chain::{AggregatorStep, BatchStep, StepChain, StepExecution, StepStatus};
pub use job::{
    find_latest_run, BatchJob, BatchJobBuilder, BatchStatus, IncompleteRecord, Phase, RunReport,
    RunSummary,
};
pub use models::{
    BoxError, EngineError, JobConfig, JsonlSource, Record, RecordSource, Result, VecSource,
};
pub use persist::{ExecType, FsStore, KeyValueStore, PersistenceContext, RecordPointer};

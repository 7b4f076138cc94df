//! Aggregator steps: one node of the chain.
//!
//! Each step buffers upstream payloads until its aggregation quantity is
//! reached, then snapshots and clears the buffers and invokes the user
//! function. The clear happens before the await, so payloads arriving
//! while a batch is mid-flight start the next batch in the empty buffers.

use crate::chain::execution::{StepExecution, StepStatus};
use crate::models::{BoxError, EngineError, Result};
use crate::persist::PersistenceContext;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Capability consumed by the engine: one user transformation.
///
/// `apply` receives the accumulated payload batch (at most the
/// aggregation quantity entries, fewer on a drain) and returns a single
/// output payload. It may suspend and may fail with any error value;
/// failure is counted, never fatal to the run.
#[async_trait]
pub trait BatchStep: Send + Sync {
    /// Step name; must be unique within one chain.
    fn name(&self) -> &str;

    /// How many upstream payloads to buffer before `apply` is invoked.
    fn aggregation_quantity(&self) -> usize {
        1
    }

    async fn apply(&self, payloads: Vec<Value>) -> std::result::Result<Value, BoxError>;
}

#[derive(Default)]
struct Pending {
    records: Vec<String>,
    payloads: Vec<Value>,
}

/// What happened when an execution arrived at a step.
pub(crate) enum Absorbed {
    /// Under quota; the execution is parked in the buffers (published)
    Parked(StepExecution),
    /// Quota reached (or draining); buffers snapshotted and cleared
    Batch(StepExecution),
    /// Malformed input; a failed execution was synthesized
    Rejected(StepExecution),
}

/// One chain node: quantity gate + pending buffers around a user step.
pub struct AggregatorStep {
    index: usize,
    name: String,
    quantity: usize,
    step: std::sync::Arc<dyn BatchStep>,
    pending: Mutex<Pending>,
}

impl AggregatorStep {
    pub(crate) fn new(index: usize, step: std::sync::Arc<dyn BatchStep>) -> Self {
        Self {
            index,
            name: step.name().to_string(),
            quantity: step.aggregation_quantity().max(1),
            step,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregation_quantity(&self) -> usize {
        self.quantity
    }

    /// Records currently parked in this step's buffers.
    pub fn parked_records(&self) -> usize {
        self.pending.lock().map(|p| p.records.len()).unwrap_or(0)
    }

    fn locked(&self) -> Result<MutexGuard<'_, Pending>> {
        self.pending
            .lock()
            .map_err(|_| EngineError::Internal(format!("step '{}' buffer lock poisoned", self.name)))
    }

    /// Take an incoming execution into the buffers.
    ///
    /// Buffer append, the quota decision and (for a parked outcome) the
    /// durable publication all happen under the buffer lock, so an
    /// arriving payload sees either the old buffer or the cleared one,
    /// never a half-cleared state.
    pub(crate) fn absorb(
        &self,
        ctx: &PersistenceContext,
        mut incoming: StepExecution,
        draining: bool,
    ) -> Result<Absorbed> {
        if let Some(reason) = incoming.reject_reason() {
            warn!(step = %self.name, reason, "Rejecting malformed input");
            let failed = EngineError::BadInput {
                step: self.index,
                reason: reason.to_string(),
            };
            let mut rejected = StepExecution::failed(
                self.index,
                std::mem::take(&mut incoming.dependent_records),
                std::mem::take(&mut incoming.acc_payload),
                failed.to_string(),
            );
            if !rejected.dependent_records.is_empty() {
                if let Err(e) = rejected.publish(ctx, false) {
                    error!(step = %self.name, error = %e, "Failed to publish rejection");
                }
            }
            return Ok(Absorbed::Rejected(rejected));
        }

        let mut pending = self.locked()?;
        let prior_records = pending.records.len();
        let prior_payloads = pending.payloads.len();
        pending.records.append(&mut incoming.dependent_records);
        pending
            .payloads
            .push(incoming.output_payload.take().unwrap_or(Value::Null));

        if pending.payloads.len() < self.quantity && !draining {
            let mut parked = StepExecution::snapshot(
                self.index,
                pending.records.clone(),
                pending.payloads.clone(),
            );
            if let Err(e) = parked.publish(ctx, false) {
                // The append is rolled back so the failed records do not
                // resurface in a later batch; still under the lock, so
                // truncation cannot clip a concurrent arrival.
                let dropped: Vec<String> = pending.records.split_off(prior_records);
                pending.payloads.truncate(prior_payloads);
                error!(step = %self.name, error = %e, "Failed to park batch");
                return Ok(Absorbed::Rejected(StepExecution::failed(
                    self.index,
                    dropped,
                    Vec::new(),
                    e.to_string(),
                )));
            }
            debug!(
                step = %self.name,
                buffered = pending.payloads.len(),
                quantity = self.quantity,
                "Parked under quota"
            );
            return Ok(Absorbed::Parked(parked));
        }

        let records = std::mem::take(&mut pending.records);
        let payloads = std::mem::take(&mut pending.payloads);
        drop(pending);
        Ok(Absorbed::Batch(StepExecution::snapshot(
            self.index, records, payloads,
        )))
    }

    /// Run the user function on a snapshotted batch.
    pub(crate) async fn invoke(
        &self,
        ctx: &PersistenceContext,
        mut batch: StepExecution,
    ) -> Result<StepExecution> {
        debug!(
            step = %self.name,
            size = batch.acc_payload.len(),
            records = batch.dependent_records.len(),
            "Invoking user step"
        );
        match self.step.apply(batch.acc_payload.clone()).await {
            Ok(output) => {
                batch.status = StepStatus::Processing;
                if let Err(e) = batch.publish(ctx, false) {
                    return Ok(Self::demote(ctx, batch, e));
                }
                batch.output_payload = Some(output);
                Ok(batch)
            }
            Err(e) => {
                warn!(step = %self.name, error = %e, "User step failed");
                let failed = EngineError::UserStep {
                    step: self.name.clone(),
                    message: e.to_string(),
                };
                batch.status = StepStatus::Failed;
                batch.error = Some(failed.to_string());
                batch.output_payload = None;
                if let Err(pe) = batch.publish(ctx, false) {
                    error!(step = %self.name, error = %pe, "Failed to publish failure");
                }
                Ok(batch)
            }
        }
    }

    /// Demote a batch that could not be checkpointed to a counted failure.
    pub(crate) fn demote(
        ctx: &PersistenceContext,
        mut batch: StepExecution,
        e: EngineError,
    ) -> StepExecution {
        error!(step = batch.step_index, error = %e, "Checkpoint failed, counting batch as failed");
        batch.status = StepStatus::Failed;
        batch.error = Some(e.to_string());
        batch.output_payload = None;
        if let Err(pe) = batch.publish(ctx, false) {
            error!(step = batch.step_index, error = %pe, "Failed to publish demotion");
        }
        batch
    }

    /// Snapshot and clear the buffers, if anything is parked here.
    pub(crate) fn take_pending(&self) -> Option<StepExecution> {
        let mut pending = self.pending.lock().ok()?;
        if pending.records.is_empty() && pending.payloads.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut pending.records);
        let payloads = std::mem::take(&mut pending.payloads);
        Some(StepExecution::snapshot(self.index, records, payloads))
    }

    /// Seed the buffers with recovered state (retry rehydration).
    pub(crate) fn seed(&self, mut records: Vec<String>, mut payloads: Vec<Value>) -> Result<()> {
        let mut pending = self.locked()?;
        pending.records.append(&mut records);
        pending.payloads.append(&mut payloads);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::ExecType;
    use serde_json::json;
    use std::sync::Arc;

    struct Sum {
        quantity: usize,
    }

    #[async_trait]
    impl BatchStep for Sum {
        fn name(&self) -> &str {
            "sum"
        }

        fn aggregation_quantity(&self) -> usize {
            self.quantity
        }

        async fn apply(&self, payloads: Vec<Value>) -> std::result::Result<Value, BoxError> {
            let total: i64 = payloads.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        }
    }

    fn ctx() -> (tempfile::TempDir, PersistenceContext) {
        let root = tempfile::TempDir::new().unwrap();
        let ctx = PersistenceContext::create(root.path(), "job", ExecType::Run).unwrap();
        (root, ctx)
    }

    fn incoming(id: &str, n: i64) -> StepExecution {
        StepExecution::bootstrap(&crate::models::Record::new(id, json!(n)))
    }

    #[test]
    fn parks_under_quota_and_publishes() {
        let (_root, ctx) = ctx();
        let step = AggregatorStep::new(1, Arc::new(Sum { quantity: 3 }));

        match step.absorb(&ctx, incoming("a", 1), false).unwrap() {
            Absorbed::Parked(acc) => {
                assert_eq!(acc.status, StepStatus::Accumulating);
                assert_eq!(acc.dependent_records, vec!["a"]);
                assert_eq!(acc.acc_payload, vec![json!(1)]);
            }
            _ => panic!("expected park"),
        }
        assert_eq!(step.parked_records(), 1);
        assert_eq!(ctx.scan_records().unwrap().len(), 1);
    }

    #[test]
    fn dispatches_at_quota_and_clears() {
        let (_root, ctx) = ctx();
        let step = AggregatorStep::new(1, Arc::new(Sum { quantity: 2 }));

        step.absorb(&ctx, incoming("a", 1), false).unwrap();
        match step.absorb(&ctx, incoming("b", 2), false).unwrap() {
            Absorbed::Batch(batch) => {
                assert_eq!(batch.dependent_records, vec!["a", "b"]);
                assert_eq!(batch.acc_payload, vec![json!(1), json!(2)]);
            }
            _ => panic!("expected batch"),
        }
        assert_eq!(step.parked_records(), 0);
    }

    #[test]
    fn draining_forces_dispatch() {
        let (_root, ctx) = ctx();
        let step = AggregatorStep::new(1, Arc::new(Sum { quantity: 5 }));
        match step.absorb(&ctx, incoming("a", 1), true).unwrap() {
            Absorbed::Batch(batch) => assert_eq!(batch.acc_payload.len(), 1),
            _ => panic!("expected batch under drain"),
        }
    }

    #[test]
    fn rejects_bad_input() {
        let (_root, ctx) = ctx();
        let step = AggregatorStep::new(1, Arc::new(Sum { quantity: 1 }));
        let mut bad = incoming("a", 1);
        bad.output_payload = None;
        match step.absorb(&ctx, bad, false).unwrap() {
            Absorbed::Rejected(failed) => {
                assert_eq!(failed.status, StepStatus::Failed);
                assert!(failed.error.as_deref().unwrap().contains("Bad input"));
            }
            _ => panic!("expected rejection"),
        }
        assert_eq!(step.parked_records(), 0);
    }

    #[tokio::test]
    async fn invoke_publishes_processing_then_sets_output() {
        let (_root, ctx) = ctx();
        let step = AggregatorStep::new(1, Arc::new(Sum { quantity: 2 }));
        step.absorb(&ctx, incoming("a", 1), false).unwrap();
        let batch = match step.absorb(&ctx, incoming("b", 2), false).unwrap() {
            Absorbed::Batch(b) => b,
            _ => panic!(),
        };
        let result = step.invoke(&ctx, batch).await.unwrap();
        assert_eq!(result.status, StepStatus::Processing);
        assert_eq!(result.output_payload, Some(json!(3)));

        // The durable snapshot predates the output.
        let snap = ctx.get_step(result.id.as_deref().unwrap()).unwrap().unwrap();
        assert!(snap.output_payload.is_none());
    }

    struct Explode;

    #[async_trait]
    impl BatchStep for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        async fn apply(&self, _payloads: Vec<Value>) -> std::result::Result<Value, BoxError> {
            Err("kaboom".into())
        }
    }

    #[tokio::test]
    async fn invoke_failure_is_published() {
        let (_root, ctx) = ctx();
        let step = AggregatorStep::new(1, Arc::new(Explode));
        let batch = match step.absorb(&ctx, incoming("a", 1), false).unwrap() {
            Absorbed::Batch(b) => b,
            _ => panic!(),
        };
        let result = step.invoke(&ctx, batch).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("kaboom"));
        assert_eq!(
            ctx.get_record("a").unwrap().unwrap().status,
            StepStatus::Failed
        );
    }
}

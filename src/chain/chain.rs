//! The step chain: an ordered sequence of aggregator steps.
//!
//! Steps live in a contiguous array indexed by 1-based position; the
//! successor of step `i` is `i + 1`. The chain drives an execution
//! forward until it parks in a buffer, fails, or finalizes at the tail.

use crate::chain::execution::{StepExecution, StepStatus};
use crate::chain::step::{Absorbed, AggregatorStep, BatchStep};
use crate::models::Result;
use crate::persist::PersistenceContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Ordered chain of aggregator steps.
pub struct StepChain {
    steps: Vec<Arc<AggregatorStep>>,
    draining: AtomicBool,
}

impl StepChain {
    pub(crate) fn new(steps: Vec<Arc<dyn BatchStep>>) -> Self {
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| Arc::new(AggregatorStep::new(i + 1, step)))
            .collect();
        Self {
            steps,
            draining: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> &AggregatorStep {
        &self.steps[index - 1]
    }

    /// Product of the aggregation quantities: the minimum record count
    /// that traverses the whole chain without a drain.
    pub fn pipeline_fan_in(&self) -> usize {
        self.steps
            .iter()
            .map(|s| s.aggregation_quantity())
            .product()
    }

    /// Records currently parked across all step buffers.
    pub fn records_in_chain(&self) -> usize {
        self.steps.iter().map(|s| s.parked_records()).sum()
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn set_draining(&self, on: bool) {
        self.draining.store(on, Ordering::SeqCst);
    }

    /// Drive an incoming execution into the chain.
    ///
    /// Entry position is `incoming.step_index + 1`; a bootstrap (index 0)
    /// enters the head. Returns the execution in its final state for this
    /// arrival: parked (`Accumulating`), failed, mid-chain success
    /// absorbed downstream, or terminal success (already finalized).
    pub(crate) async fn execute(
        &self,
        ctx: &PersistenceContext,
        incoming: StepExecution,
    ) -> Result<StepExecution> {
        let entry = incoming.step_index + 1;
        match self.step(entry).absorb(ctx, incoming, self.is_draining())? {
            Absorbed::Parked(parked) => Ok(parked),
            Absorbed::Rejected(failed) => Ok(failed),
            Absorbed::Batch(batch) => self.run_from(ctx, entry, batch).await,
        }
    }

    /// Invoke a snapshotted batch at `index` and flow the result forward.
    async fn run_from(
        &self,
        ctx: &PersistenceContext,
        index: usize,
        batch: StepExecution,
    ) -> Result<StepExecution> {
        let mut index = index;
        let mut batch = batch;
        loop {
            let mut result = self.step(index).invoke(ctx, batch).await?;
            if result.status == StepStatus::Failed {
                return Ok(result);
            }
            result.status = StepStatus::Successful;
            if index == self.len() {
                if let Err(e) = result.publish(ctx, true) {
                    return Ok(AggregatorStep::demote(ctx, result, e));
                }
                debug!(
                    records = result.dependent_records.len(),
                    "Finalized at terminal step"
                );
                return Ok(result);
            }
            index += 1;
            match self.step(index).absorb(ctx, result, self.is_draining())? {
                Absorbed::Parked(parked) => return Ok(parked),
                Absorbed::Rejected(failed) => return Ok(failed),
                Absorbed::Batch(next) => batch = next,
            }
        }
    }

    /// Flush partial batches through the user functions, tail first.
    ///
    /// Sets the draining flag so downstream steps dispatch on arrival
    /// instead of parking; walking tail to head guarantees a step's own
    /// partial batch is dispatched before upstream remnants reach it.
    /// Returns the final execution of each flush for the caller to tally.
    pub(crate) async fn force_tail(
        &self,
        ctx: &PersistenceContext,
    ) -> Result<Vec<StepExecution>> {
        self.draining.store(true, Ordering::SeqCst);
        let mut outcomes = Vec::new();
        for index in (1..=self.len()).rev() {
            if let Some(batch) = self.step(index).take_pending() {
                debug!(
                    step = index,
                    size = batch.acc_payload.len(),
                    "Forcing partial batch"
                );
                outcomes.push(self.run_from(ctx, index, batch).await?);
            }
        }
        Ok(outcomes)
    }

    /// Seed a step's buffers from a recovered snapshot and checkpoint the
    /// rehydrated state into this run's context, so a crash during retry
    /// is itself retryable.
    pub(crate) fn inject_recovered_state(
        &self,
        ctx: &PersistenceContext,
        snapshot: &StepExecution,
        step_index: usize,
    ) -> Result<()> {
        self.step(step_index).seed(
            snapshot.dependent_records.clone(),
            snapshot.acc_payload.clone(),
        )?;
        let mut rehydrated = StepExecution::snapshot(
            step_index,
            snapshot.dependent_records.clone(),
            snapshot.acc_payload.clone(),
        );
        rehydrated.publish(ctx, false)?;
        debug!(
            step = step_index,
            records = snapshot.dependent_records.len(),
            "Injected recovered state"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoxError, Record};
    use crate::persist::ExecType;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    struct Tag {
        name: String,
        quantity: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchStep for Tag {
        fn name(&self) -> &str {
            &self.name
        }

        fn aggregation_quantity(&self) -> usize {
            self.quantity
        }

        async fn apply(&self, payloads: Vec<Value>) -> std::result::Result<Value, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "via": self.name, "inputs": payloads }))
        }
    }

    fn tag(name: &str, quantity: usize) -> (Arc<dyn BatchStep>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Tag {
                name: name.to_string(),
                quantity,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    fn ctx() -> (tempfile::TempDir, PersistenceContext) {
        let root = tempfile::TempDir::new().unwrap();
        let ctx = PersistenceContext::create(root.path(), "job", ExecType::Run).unwrap();
        (root, ctx)
    }

    #[test]
    fn fan_in_is_the_quantity_product() {
        let (a, _) = tag("a", 3);
        let (b, _) = tag("b", 4);
        let chain = StepChain::new(vec![a, b]);
        assert_eq!(chain.pipeline_fan_in(), 12);
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn straight_through_finalizes() {
        let (_root, ctx) = ctx();
        let (a, a_calls) = tag("a", 1);
        let (b, b_calls) = tag("b", 1);
        let chain = StepChain::new(vec![a, b]);

        let bootstrap = StepExecution::bootstrap(&Record::new("r1", json!(7)));
        let result = chain.execute(&ctx, bootstrap).await.unwrap();

        assert_eq!(result.status, StepStatus::Successful);
        assert_eq!(result.step_index, 2);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.scan_records().unwrap().len(), 0);
        assert_eq!(chain.records_in_chain(), 0);
    }

    #[tokio::test]
    async fn parks_until_quota_then_flows() {
        let (_root, ctx) = ctx();
        let (a, a_calls) = tag("a", 2);
        let chain = StepChain::new(vec![a]);

        let first = chain
            .execute(&ctx, StepExecution::bootstrap(&Record::new("r1", json!(1))))
            .await
            .unwrap();
        assert_eq!(first.status, StepStatus::Accumulating);
        assert_eq!(chain.records_in_chain(), 1);
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);

        let second = chain
            .execute(&ctx, StepExecution::bootstrap(&Record::new("r2", json!(2))))
            .await
            .unwrap();
        assert_eq!(second.status, StepStatus::Successful);
        assert_eq!(second.dependent_records, vec!["r1", "r2"]);
        assert_eq!(chain.records_in_chain(), 0);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_tail_flushes_tail_first() {
        let (_root, ctx) = ctx();
        let (a, a_calls) = tag("a", 2);
        let (b, b_calls) = tag("b", 2);
        let chain = StepChain::new(vec![a, b]);

        // Three records: one full batch flows to step 2 and parks there,
        // the third parks at step 1.
        for (id, n) in [("r1", 1), ("r2", 2), ("r3", 3)] {
            chain
                .execute(&ctx, StepExecution::bootstrap(&Record::new(id, json!(n))))
                .await
                .unwrap();
        }
        assert_eq!(chain.step(1).parked_records(), 1);
        assert_eq!(chain.step(2).parked_records(), 2);

        let outcomes = chain.force_tail(&ctx).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.status == StepStatus::Successful && o.step_index == 2));
        assert_eq!(chain.records_in_chain(), 0);
        assert_eq!(a_calls.load(Ordering::SeqCst), 2);
        // Step 2 ran once for the parked batch, once for the flush of step 1.
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.scan_records().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn injection_seeds_buffers_and_checkpoints() {
        let (_root, ctx) = ctx();
        let (a, _) = tag("a", 2);
        let chain = StepChain::new(vec![a]);

        let snapshot = StepExecution::snapshot(
            1,
            vec!["r1".to_string(), "r2".to_string()],
            vec![json!(1)],
        );
        chain.inject_recovered_state(&ctx, &snapshot, 1).unwrap();

        assert_eq!(chain.records_in_chain(), 2);
        let rows = ctx.scan_records().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|(_, p)| p.step_index == 1));
    }
}

//! Batch operation: the operation behind every node-batched job type
//!
//! Each handle cycle picks the next batch of pending nodes, runs the
//! executor on them in parallel and records per-node outcomes in the job
//! state store. The aggregate phase is re-evaluated on every observe, and
//! the job completes as soon as the failure threshold or the total is
//! reached.

use async_trait::async_trait;
use chrono::Utc;
use fleetops_core::domain::job::PARAMETER_NODE;
use fleetops_core::{Condition, ConditionStatus, OpsJob, OpsJobPhase, Parameter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{OpsError, Result};
use crate::executor::{ActionExecutor, ActionOutcome, CycleContext};
use crate::fault::{FaultGuard, monitor_for};
use crate::reconciler::{Operation, ReconcileAction};
use crate::remote::normalize_message;
use crate::scheduler::run_batch;
use crate::state::{JobRuntimeState, JobStateStore};
use crate::status::{self, JOB_PROCESSING_TYPE};
use crate::store::ResourceStore;

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    /// Delay before a cycle that only deferred nodes runs again
    pub defer_interval: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            defer_interval: Duration::from_secs(5),
        }
    }
}

/// What happened to one node of a batch
#[derive(Debug)]
enum NodeResult {
    /// The node reached a terminal phase
    Finished,
    /// The node went back to `Pending`
    Deferred,
    /// The node stays `Running` until an event reports its outcome
    Dispatched,
    /// The node was not dispatched because its phase moved on
    Skipped,
    /// A failure that concerns the whole job
    Abort(OpsError),
}

/// Per-node half of a cycle, cloned into every batch worker
struct NodeWorker<E> {
    executor: Arc<E>,
    store: Arc<dyn ResourceStore>,
    state: Arc<JobStateStore>,
}

impl<E> Clone for NodeWorker<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: ActionExecutor> NodeWorker<E> {
    async fn process(&self, job: &OpsJob, node: &str, cycle: &CycleContext) -> NodeResult {
        if !self.state.set_phase(job.name(), node, OpsJobPhase::Running) {
            return NodeResult::Skipped;
        }

        match self.executor.execute(job, node, cycle).await {
            Ok(ActionOutcome::Succeeded) => {
                self.finish(job, node, OpsJobPhase::Succeeded, "").await;
                NodeResult::Finished
            }
            Ok(ActionOutcome::Dispatched) => NodeResult::Dispatched,
            Ok(ActionOutcome::Deferred) => {
                self.state.set_phase(job.name(), node, OpsJobPhase::Pending);
                NodeResult::Deferred
            }
            Err(e @ OpsError::FaultConfig(_)) => {
                self.state.set_phase(job.name(), node, OpsJobPhase::Pending);
                NodeResult::Abort(e)
            }
            Err(e) if !e.is_retryable() || matches!(e, OpsError::Transport(_)) => {
                warn!("ops job {} failed on node {}: {}", job.name(), node, e);
                let message = normalize_message(&e.to_string());
                self.finish(job, node, OpsJobPhase::Failed, &message).await;
                NodeResult::Finished
            }
            Err(e) => {
                warn!("ops job {} deferred node {}: {}", job.name(), node, e);
                self.state.set_phase(job.name(), node, OpsJobPhase::Pending);
                NodeResult::Deferred
            }
        }
    }

    /// Records a terminal node phase and its condition
    async fn finish(&self, job: &OpsJob, node: &str, phase: OpsJobPhase, message: &str) {
        if !self.state.set_phase(job.name(), node, phase) {
            return;
        }
        let condition = status::node_condition(
            job.spec.job_type,
            node,
            phase == OpsJobPhase::Succeeded,
            message,
        );
        if let Err(e) = status::update_condition(self.store.as_ref(), job.name(), condition).await
        {
            warn!(
                "failed to record condition of node {} for ops job {}: {}",
                node,
                job.name(),
                e
            );
        }
    }
}

/// Generic [`Operation`] driving an [`ActionExecutor`] over a job's nodes
pub struct BatchOperation<E> {
    executor: Arc<E>,
    store: Arc<dyn ResourceStore>,
    state: Arc<JobStateStore>,
    guard: FaultGuard,
    settings: BatchSettings,
}

impl<E: ActionExecutor> BatchOperation<E> {
    pub fn new(
        executor: E,
        store: Arc<dyn ResourceStore>,
        state: Arc<JobStateStore>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            guard: FaultGuard::new(Arc::clone(&store)),
            store,
            state,
            settings,
        }
    }

    fn worker(&self) -> NodeWorker<E> {
        NodeWorker {
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
        }
    }

    /// Validates a pending job and moves it to `Running`
    async fn start(&self, job: &OpsJob) -> Result<()> {
        self.executor.validate(job).await?;
        if let Some(monitor) = monitor_for(job.spec.job_type) {
            self.guard.enabled_config(monitor).await?;
        }
        status::set_job_phase(self.store.as_ref(), job.name(), OpsJobPhase::Running).await?;
        info!(
            "ops job {} started, type: {}, nodes: {}",
            job.name(),
            job.spec.job_type,
            job.node_names().len()
        );
        Ok(())
    }

    /// Starts tracking the job, rebuilding node phases from persisted state
    ///
    /// Node conditions are authoritative; nodes without one are resolved by the
    /// executor.
    async fn track(&self, job: &OpsJob) -> Result<()> {
        if self.state.is_tracked(job.name()) {
            return Ok(());
        }
        let nodes = job.node_names();
        if nodes.is_empty() {
            return Err(OpsError::BadRequest("no input nodes found".to_string()));
        }

        let mut state = JobRuntimeState::new(
            nodes.iter().cloned(),
            job.availability_ratio(),
            job.batch_count(),
        );
        let mut recovered = 0;
        for node in &nodes {
            let phase = match job.node_condition(node).map(|c| c.status) {
                Some(ConditionStatus::True) => Some(OpsJobPhase::Succeeded),
                Some(ConditionStatus::False) => Some(OpsJobPhase::Failed),
                _ => self.executor.recover(job, node).await?,
            };
            if let Some(phase) = phase {
                state = state.with_phase(node, phase);
                recovered += 1;
            }
        }

        if self.state.insert_if_absent(job.name(), state) && recovered > 0 {
            info!(
                "ops job {} recovered {} node phase(s) from the store",
                job.name(),
                recovered
            );
        }
        Ok(())
    }

    /// Requeue at the deadline so a quiet job still times out
    fn deadline_action(&self, job: &OpsJob) -> ReconcileAction {
        match job.timeout_remaining(Utc::now()) {
            Some(remaining) => ReconcileAction::requeue_after(remaining),
            None => ReconcileAction::await_change(),
        }
    }
}

#[async_trait]
impl<E: ActionExecutor> Operation for BatchOperation<E> {
    fn filter(&self, job: &OpsJob) -> bool {
        job.spec.job_type == self.executor.job_type()
    }

    async fn observe(&self, job: &OpsJob) -> Result<bool> {
        if job.is_pending() {
            return Ok(false);
        }
        self.track(job).await?;

        let (phase, message) = self.state.aggregate_phase(job.name());
        if !phase.is_terminal() {
            return Ok(false);
        }
        let outputs = self
            .state
            .succeeded_keys(job.name())
            .into_iter()
            .map(|node| Parameter::new(PARAMETER_NODE, node))
            .collect();
        status::set_job_completed(self.store.as_ref(), job.name(), phase, &message, outputs)
            .await?;
        self.state.remove(job.name());
        Ok(true)
    }

    async fn handle(&self, job: &OpsJob) -> Result<ReconcileAction> {
        if job.is_pending() {
            self.start(job).await?;
        }
        self.track(job).await?;

        let batch = self.state.next_batch(job.name());
        if batch.is_empty() {
            return Ok(self.deadline_action(job));
        }
        let cycle = Arc::new(self.executor.prepare(job).await?);

        let listed = serde_json::to_string(&batch)
            .map_err(|e| OpsError::Internal(format!("failed to encode batch: {}", e)))?;
        status::update_condition(
            self.store.as_ref(),
            job.name(),
            Condition::new(
                JOB_PROCESSING_TYPE,
                ConditionStatus::True,
                "JobProcessing",
                listed,
            ),
        )
        .await?;
        info!("ops job {} processing batch {:?}", job.name(), batch);

        let results = Arc::new(Mutex::new(Vec::with_capacity(batch.len())));
        let sink = Arc::clone(&results);
        let worker = self.worker();
        let shared = Arc::new(job.clone());
        run_batch(batch.clone(), move |node: String| {
            let worker = worker.clone();
            let job = Arc::clone(&shared);
            let cycle = Arc::clone(&cycle);
            let sink = Arc::clone(&sink);
            async move {
                let result = worker.process(&job, &node, &cycle).await;
                sink.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((node, result));
            }
        })
        .await;

        let results = std::mem::take(&mut *results.lock().unwrap_or_else(|e| e.into_inner()));
        let mut action = ReconcileAction::await_change();

        // A worker that panicked reported nothing; free its batch slot
        for node in batch
            .iter()
            .filter(|n| !results.iter().any(|(reported, _)| reported == *n))
        {
            if self.state.set_phase(job.name(), node, OpsJobPhase::Pending) {
                warn!(
                    "ops job {} lost the worker of node {}, node is pending again",
                    job.name(),
                    node
                );
                action = action.merge(ReconcileAction::requeue_after(
                    self.settings.defer_interval,
                ));
            }
        }

        for (_, result) in results {
            match result {
                NodeResult::Abort(e) => return Err(e),
                NodeResult::Finished => action = action.merge(ReconcileAction::requeue()),
                NodeResult::Deferred => {
                    action = action.merge(ReconcileAction::requeue_after(
                        self.settings.defer_interval,
                    ))
                }
                NodeResult::Dispatched | NodeResult::Skipped => {}
            }
        }
        Ok(action.merge(self.deadline_action(job)))
    }

    async fn cleanup(&self, job: &OpsJob) -> Result<()> {
        self.executor.cleanup(job).await?;
        self.guard.cleanup_job(job.name()).await?;
        self.state.remove(job.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::BaseReconciler;
    use crate::status::JOB_COMPLETED_TYPE;
    use crate::store::InMemoryStore;
    use crate::test_support::{self, CLUSTER};
    use fleetops_core::OpsJobType;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that fails a fixed set of nodes and tracks its concurrency
    struct FakeExecutor {
        job_type: OpsJobType,
        outcome: ActionOutcome,
        failing: HashSet<String>,
        panicking: Mutex<HashSet<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn new(job_type: OpsJobType, outcome: ActionOutcome) -> Self {
            Self {
                job_type,
                outcome,
                failing: HashSet::new(),
                panicking: Mutex::new(HashSet::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self, nodes: &[&str]) -> Self {
            self.failing = nodes.iter().map(|n| n.to_string()).collect();
            self
        }

        /// The first call for each of `nodes` panics
        fn panicking_once(self, nodes: &[&str]) -> Self {
            *self.panicking.lock().unwrap() = nodes.iter().map(|n| n.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl ActionExecutor for FakeExecutor {
        fn job_type(&self) -> OpsJobType {
            self.job_type
        }

        async fn execute(
            &self,
            _job: &OpsJob,
            node: &str,
            _cycle: &CycleContext,
        ) -> Result<ActionOutcome> {
            if self.panicking.lock().unwrap().remove(node) {
                panic!("executor crashed on {}", node);
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(node.to_string());

            if self.failing.contains(node) {
                return Err(OpsError::Internal(format!(
                    "Process exited with status 1: script failed on {}",
                    node
                )));
            }
            Ok(self.outcome)
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        state: Arc<JobStateStore>,
        operation: Arc<BatchOperation<FakeExecutor>>,
        reconciler: BaseReconciler,
    }

    impl Harness {
        fn new(store: Arc<InMemoryStore>, executor: FakeExecutor) -> Self {
            let state = Arc::new(JobStateStore::new());
            let operation = Arc::new(BatchOperation::new(
                executor,
                store.clone(),
                Arc::clone(&state),
                BatchSettings {
                    defer_interval: Duration::from_millis(50),
                },
            ));
            let reconciler =
                BaseReconciler::new(store.clone(), Arc::clone(&state), operation.clone());
            Self {
                store,
                state,
                operation,
                reconciler,
            }
        }

        fn executor(&self) -> &FakeExecutor {
            &self.operation.executor
        }

        /// Reconciles until the job finishes
        async fn drive(&self, name: &str) -> OpsJob {
            for _ in 0..30 {
                self.reconciler.reconcile(name).await.unwrap();
                let job = self.store.get_job(name).await.unwrap();
                if job.is_end() {
                    return job;
                }
            }
            panic!("job {} did not finish", name);
        }
    }

    fn addon_job(nodes: &[String], ratio: f64) -> OpsJob {
        let mut job = OpsJob::new("upgrade", OpsJobType::Addon, CLUSTER).with_nodes(nodes);
        job.spec.availability_ratio = Some(ratio);
        job
    }

    #[tokio::test]
    async fn test_ten_nodes_one_failure_succeeds_in_batches_of_two() {
        let store = test_support::store();
        let nodes = test_support::node_names(10);
        test_support::create_job(&store, addon_job(&nodes, 0.8)).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded).failing(&["node-03"]),
        );

        let job = harness.drive("upgrade").await;

        assert_eq!(job.status.phase, OpsJobPhase::Succeeded);
        assert_eq!(
            job.node_condition(JOB_COMPLETED_TYPE).unwrap().message,
            "success: 9, fail: 1"
        );
        assert_eq!(job.output_values(PARAMETER_NODE).len(), 9);
        assert!(!job.output_values(PARAMETER_NODE).contains(&"node-03"));

        let failed = job.node_condition("node-03").unwrap();
        assert_eq!(failed.status, ConditionStatus::False);
        assert_eq!(failed.reason, "AddonFailed");
        assert!(failed.message.contains("script failed"));
        assert_eq!(
            job.node_condition("node-04").unwrap().status,
            ConditionStatus::True
        );

        assert!(harness.executor().peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(harness.executor().calls.lock().unwrap().len(), 10);
        assert!(!harness.state.is_tracked("upgrade"));
    }

    #[tokio::test]
    async fn test_second_failure_fails_the_job() {
        let store = test_support::store();
        let nodes = test_support::node_names(10);
        test_support::create_job(&store, addon_job(&nodes, 0.8)).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded)
                .failing(&["node-00", "node-01"]),
        );

        let job = harness.drive("upgrade").await;

        assert_eq!(job.status.phase, OpsJobPhase::Failed);
        assert_eq!(
            job.node_condition(JOB_COMPLETED_TYPE).unwrap().message,
            "The number of failures has reached the threshold(2)"
        );
        // The first batch already hit the threshold; nothing else was touched
        assert_eq!(harness.executor().calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panicked_worker_releases_its_batch_slot() {
        let store = test_support::store();
        let nodes = test_support::node_names(2);
        test_support::create_job(&store, addon_job(&nodes, 1.0)).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded)
                .panicking_once(&["node-00"]),
        );

        let action = harness.reconciler.reconcile("upgrade").await.unwrap();
        assert_eq!(
            harness.state.phase("upgrade", "node-00"),
            Some(OpsJobPhase::Pending)
        );
        assert_eq!(action.requeue_after, Some(Duration::from_millis(50)));

        let job = harness.drive("upgrade").await;
        assert_eq!(job.status.phase, OpsJobPhase::Succeeded);
        assert_eq!(job.output_values(PARAMETER_NODE), nodes);
    }

    #[tokio::test]
    async fn test_all_nodes_succeed_with_outputs() {
        let store = test_support::store();
        let nodes = test_support::node_names(5);
        test_support::create_job(&store, addon_job(&nodes, 1.0)).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded),
        );

        let job = harness.drive("upgrade").await;

        assert_eq!(job.status.phase, OpsJobPhase::Succeeded);
        assert_eq!(job.output_values(PARAMETER_NODE), nodes);
        // Ratio 1.0 keeps one node out of service at a time
        assert_eq!(harness.executor().peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_count_override_widens_batches() {
        let store = test_support::store();
        let nodes = test_support::node_names(6);
        let mut job = addon_job(&nodes, 1.0);
        job.spec.batch_count = Some(3);
        test_support::create_job(&store, job).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded),
        );

        harness.drive("upgrade").await;
        assert_eq!(harness.executor().peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pending_job_without_nodes_fails() {
        let store = test_support::store();
        test_support::create_job(&store, OpsJob::new("empty", OpsJobType::Addon, CLUSTER)).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded),
        );

        let job = harness.drive("empty").await;
        assert_eq!(job.status.phase, OpsJobPhase::Failed);
        assert_eq!(
            job.node_condition(JOB_COMPLETED_TYPE).unwrap().message,
            "bad request: no input nodes found"
        );
    }

    #[tokio::test]
    async fn test_missing_fault_config_fails_before_any_node() {
        let store = Arc::new(InMemoryStore::new());
        test_support::add_nodes(&store, &test_support::node_names(2));
        test_support::create_job(&store, addon_job(&test_support::node_names(2), 0.5)).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded),
        );

        let job = harness.drive("upgrade").await;
        assert_eq!(job.status.phase, OpsJobPhase::Failed);
        assert_eq!(
            job.node_condition(JOB_COMPLETED_TYPE).unwrap().message,
            "fault config error: fault config addon is not found"
        );
        assert!(harness.executor().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatched_nodes_wait_for_events() {
        let store = test_support::store();
        let nodes = test_support::node_names(2);
        let mut job = OpsJob::new("pf", OpsJobType::Preflight, CLUSTER).with_nodes(&nodes);
        job.spec.availability_ratio = Some(0.0);
        test_support::create_job(&store, job).await;
        let harness = Harness::new(
            store.clone(),
            FakeExecutor::new(OpsJobType::Preflight, ActionOutcome::Dispatched),
        );

        let action = harness.reconciler.reconcile("pf").await.unwrap();
        assert_eq!(action, ReconcileAction::await_change());
        assert_eq!(
            harness.state.phase("pf", "node-00"),
            Some(OpsJobPhase::Running)
        );

        // Nothing more to dispatch until an event lands
        harness.reconciler.reconcile("pf").await.unwrap();
        assert_eq!(harness.executor().calls.lock().unwrap().len(), 2);

        harness.state.set_phase("pf", "node-00", OpsJobPhase::Succeeded);
        harness.state.set_phase("pf", "node-01", OpsJobPhase::Succeeded);
        harness.reconciler.reconcile("pf").await.unwrap();

        let job = store.get_job("pf").await.unwrap();
        assert_eq!(job.status.phase, OpsJobPhase::Succeeded);
        assert_eq!(job.output_values(PARAMETER_NODE), vec!["node-00", "node-01"]);
    }

    #[tokio::test]
    async fn test_deferred_nodes_are_retried_later() {
        let store = test_support::store();
        test_support::create_job(&store, addon_job(&test_support::node_names(2), 1.0)).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Deferred),
        );

        let action = harness.reconciler.reconcile("upgrade").await.unwrap();
        assert_eq!(action.requeue_after, Some(Duration::from_millis(50)));
        assert!(!action.requeue);
        assert_eq!(
            harness.state.phase("upgrade", "node-00"),
            Some(OpsJobPhase::Pending)
        );
    }

    #[tokio::test]
    async fn test_restart_recovers_phases_from_conditions() {
        let store = test_support::store();
        let nodes = test_support::node_names(3);
        let mut job = addon_job(&nodes, 0.0);
        job.status.phase = OpsJobPhase::Running;
        job.status.conditions.push(status::node_condition(
            OpsJobType::Addon,
            "node-00",
            true,
            "",
        ));
        job.status.conditions.push(status::node_condition(
            OpsJobType::Addon,
            "node-01",
            false,
            "Process exited with status 1",
        ));
        test_support::create_job(&store, job).await;
        let harness = Harness::new(
            store,
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded),
        );

        let job = harness.drive("upgrade").await;

        assert_eq!(
            harness.executor().calls.lock().unwrap().as_slice(),
            ["node-02".to_string()]
        );
        assert_eq!(job.status.phase, OpsJobPhase::Succeeded);
        assert_eq!(job.output_values(PARAMETER_NODE), vec!["node-00", "node-02"]);
    }

    #[tokio::test]
    async fn test_deleting_running_job_stops_it() {
        let store = test_support::store();
        test_support::create_job(&store, addon_job(&test_support::node_names(4), 1.0)).await;
        let harness = Harness::new(
            store.clone(),
            FakeExecutor::new(OpsJobType::Addon, ActionOutcome::Succeeded),
        );
        harness.reconciler.reconcile("upgrade").await.unwrap();

        store.delete_job("upgrade").await.unwrap();
        harness.reconciler.reconcile("upgrade").await.unwrap();

        assert!(store.get_job("upgrade").await.unwrap_err().is_not_found());
        assert!(!harness.state.is_tracked("upgrade"));
    }
}

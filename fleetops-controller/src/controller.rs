//! Controller runtime
//!
//! Wires the store, the job state store, one reconciler per operation type
//! and the event feedback handlers together, then drives them from a work
//! queue:
//!
//! - the watch loop turns store events into queue keys and feedback updates
//! - `workers` tasks pop job names and run the reconcilers on them
//!
//! The queue never hands the same job to two workers, so a job has at most
//! one reconcile in flight while different jobs progress in parallel.

use fleetops_core::OpsJobType;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::events::EventFeedback;
use crate::executor::{AddonExecutor, RebootExecutor, WorkloadExecutor};
use crate::queue::WorkQueue;
use crate::reconciler::{
    BaseReconciler, BatchOperation, BatchSettings, Operation, ReconcileAction,
};
use crate::remote::RemoteShell;
use crate::state::JobStateStore;
use crate::store::{ResourceStore, StoreEvent};

pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue>,
    reconcilers: Vec<BaseReconciler>,
    feedback: EventFeedback,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ResourceStore>,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        let state = Arc::new(JobStateStore::new());
        let queue = Arc::new(WorkQueue::new(config.requeue_base(), config.requeue_max()));
        let settings = BatchSettings {
            defer_interval: config.defer_interval(),
        };
        let retry = config.retry_policy();

        let reconciler = |op: Arc<dyn Operation>| {
            BaseReconciler::new(Arc::clone(&store), Arc::clone(&state), op)
        };
        let reconcilers = vec![
            reconciler(Arc::new(BatchOperation::new(
                AddonExecutor::new(Arc::clone(&store), Arc::clone(&shell), retry),
                Arc::clone(&store),
                Arc::clone(&state),
                settings,
            ))),
            reconciler(Arc::new(BatchOperation::new(
                WorkloadExecutor::new(
                    OpsJobType::Preflight,
                    Arc::clone(&store),
                    config.workload_image.clone(),
                ),
                Arc::clone(&store),
                Arc::clone(&state),
                settings,
            ))),
            reconciler(Arc::new(BatchOperation::new(
                WorkloadExecutor::new(
                    OpsJobType::Diagnose,
                    Arc::clone(&store),
                    config.workload_image.clone(),
                ),
                Arc::clone(&store),
                Arc::clone(&state),
                settings,
            ))),
            reconciler(Arc::new(BatchOperation::new(
                RebootExecutor::new(Arc::clone(&store), Arc::clone(&shell), retry),
                Arc::clone(&store),
                Arc::clone(&state),
                settings,
            ))),
        ];

        let feedback =
            EventFeedback::new(Arc::clone(&store), Arc::clone(&state), Arc::clone(&queue));

        Self {
            config,
            store,
            queue,
            reconcilers,
            feedback,
        }
    }

    /// Reconciles `name` once with every registered operation
    ///
    /// Each reconciler ignores job types it does not own.
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileAction> {
        let mut action = ReconcileAction::await_change();
        for reconciler in &self.reconcilers {
            action = action.merge(reconciler.reconcile(name).await?);
        }
        Ok(action)
    }

    /// Runs until `shutdown` resolves
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            "Starting controller {} with {} worker(s)",
            self.config.controller_id, self.config.workers
        );

        // Subscribe before listing so no change slips between the two
        let events = self.store.subscribe();
        self.resync().await?;

        let watcher = tokio::spawn(Arc::clone(&self).watch(events));
        let workers: Vec<_> = (0..self.config.workers)
            .map(|id| tokio::spawn(Arc::clone(&self).work(id)))
            .collect();

        shutdown.await;
        info!("Shutting down controller {}", self.config.controller_id);

        self.queue.shutdown();
        watcher.abort();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Reconcile worker panicked: {}", e);
            }
        }
        Ok(())
    }

    /// Enqueues every job in the store
    async fn resync(&self) -> Result<()> {
        let jobs = self.store.list_jobs().await?;
        debug!("Resync {} ops job(s)", jobs.len());
        for job in &jobs {
            self.queue.add(job.name());
        }
        Ok(())
    }

    async fn watch(self: Arc<Self>, mut events: broadcast::Receiver<StoreEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.feedback.dispatch(event).await {
                        warn!("Failed to handle store event: {}", e);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} store event(s), resyncing", missed);
                    if let Err(e) = self.resync().await {
                        warn!("Resync failed: {}", e);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn work(self: Arc<Self>, id: usize) {
        debug!("Reconcile worker {} started", id);
        while let Some(key) = self.queue.next().await {
            match self.reconcile(&key).await {
                Ok(action) => {
                    self.queue.forget(&key);
                    if action.requeue {
                        self.queue.add(&key);
                    } else if let Some(delay) = action.requeue_after {
                        self.queue.add_after(&key, delay);
                    }
                }
                Err(e) => {
                    warn!("Failed to reconcile ops job {}: {}", key, e);
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }
        debug!("Reconcile worker {} stopped", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptedShell;
    use crate::status::JOB_COMPLETED_TYPE;
    use crate::store::InMemoryStore;
    use crate::test_support::{self, CLUSTER};
    use fleetops_core::domain::job::{PARAMETER_NODE, PARAMETER_SCRIPT};
    use fleetops_core::{OpsJob, OpsJobPhase, WorkloadPhase};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct Running {
        store: Arc<InMemoryStore>,
        stop: Option<oneshot::Sender<()>>,
        handle: JoinHandle<Result<()>>,
    }

    impl Running {
        fn start(store: Arc<InMemoryStore>, shell: ScriptedShell) -> Self {
            let config = ControllerConfig {
                workers: 2,
                defer_interval_secs: 1,
                retry_initial_ms: 1,
                retry_max_wait_ms: 3,
                requeue_base_ms: 10,
                requeue_max_secs: 1,
                ..Default::default()
            };
            let controller = Arc::new(Controller::new(config, store.clone(), Arc::new(shell)));
            let (stop, stopped) = oneshot::channel();
            let handle = tokio::spawn(controller.run(async move {
                let _ = stopped.await;
            }));
            Self {
                store,
                stop: Some(stop),
                handle,
            }
        }

        async fn wait_until<F>(&self, name: &str, done: F) -> OpsJob
        where
            F: Fn(&OpsJob) -> bool,
        {
            for _ in 0..500 {
                if let Ok(job) = self.store.get_job(name).await {
                    if done(&job) {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("ops job {} did not reach the expected state", name);
        }

        async fn wait_for_workload(&self, name: &str) {
            for _ in 0..500 {
                if self.store.get_workload(name).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("workload {} was not created", name);
        }

        async fn finish_workload(&self, name: &str, phase: WorkloadPhase, message: &str) {
            let mut workload = self.store.get_workload(name).await.unwrap();
            workload.status.phase = phase;
            workload.status.message = message.to_string();
            self.store.update_workload(&workload).await.unwrap();
        }

        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_addon_job_runs_to_completion() {
        let store = test_support::store();
        let nodes = test_support::node_names(4);
        test_support::add_nodes(&store, &nodes);
        let shell = ScriptedShell::new();
        let mut job = OpsJob::new("addon", OpsJobType::Addon, CLUSTER)
            .with_nodes(&nodes)
            .with_input(PARAMETER_SCRIPT, "ZWNobyBvaw==");
        job.spec.availability_ratio = Some(0.5);
        test_support::create_job(&store, job).await;

        let running = Running::start(store.clone(), shell.clone());
        let job = running.wait_until("addon", |j| j.is_end()).await;

        assert_eq!(job.status.phase, OpsJobPhase::Succeeded);
        assert_eq!(job.output_values(PARAMETER_NODE).len(), 4);
        assert!(job.status.started_at.is_some() && job.status.finished_at.is_some());
        assert_eq!(shell.command_count(), 4);
        assert!(store.list_faults().await.unwrap().is_empty());
        for node in store.list_nodes().await.unwrap() {
            assert_eq!(node.owner_job(), None);
        }
        running.stop().await;
    }

    #[tokio::test]
    async fn test_preflight_node_deleted_while_running() {
        let store = test_support::store();
        let nodes = test_support::node_names(2);
        test_support::add_nodes(&store, &nodes);
        let mut job = OpsJob::new("pf", OpsJobType::Preflight, CLUSTER).with_nodes(&nodes);
        job.spec.availability_ratio = Some(0.0);
        test_support::create_job(&store, job).await;

        let running = Running::start(store.clone(), ScriptedShell::new());
        running.wait_for_workload("pf-node-00").await;
        running.wait_for_workload("pf-node-01").await;
        assert!(store.get_fault("node-00-preflight").await.is_ok());

        store.delete_node("node-00").unwrap();
        let job = running
            .wait_until("pf", |j| j.node_condition("node-00").is_some())
            .await;
        assert_eq!(
            job.node_condition("node-00").unwrap().message,
            "The node is deleted"
        );
        assert!(
            store
                .get_fault("node-00-preflight")
                .await
                .unwrap_err()
                .is_not_found()
        );

        running
            .finish_workload("pf-node-01", WorkloadPhase::Succeeded, "")
            .await;
        let job = running.wait_until("pf", |j| j.is_end()).await;
        assert_eq!(job.status.phase, OpsJobPhase::Succeeded);
        assert_eq!(
            job.node_condition(JOB_COMPLETED_TYPE).unwrap().message,
            "success: 1, fail: 1"
        );
        assert_eq!(job.output_values(PARAMETER_NODE), vec!["node-01"]);
        running.stop().await;
    }

    #[tokio::test]
    async fn test_failed_workloads_reach_threshold() {
        let store = test_support::store();
        let nodes = test_support::node_names(4);
        test_support::add_nodes(&store, &nodes);
        let mut job = OpsJob::new("diag", OpsJobType::Diagnose, CLUSTER).with_nodes(&nodes);
        job.spec.availability_ratio = Some(0.5);
        test_support::create_job(&store, job).await;

        let running = Running::start(store.clone(), ScriptedShell::new());
        running.wait_for_workload("diag-node-00").await;
        running.wait_for_workload("diag-node-01").await;
        running
            .finish_workload("diag-node-00", WorkloadPhase::Failed, "gpu 3 unhealthy")
            .await;
        running
            .finish_workload("diag-node-01", WorkloadPhase::Stopped, "")
            .await;

        let job = running.wait_until("diag", |j| j.is_end()).await;
        assert_eq!(job.status.phase, OpsJobPhase::Failed);
        assert_eq!(
            job.node_condition(JOB_COMPLETED_TYPE).unwrap().message,
            "The number of failures has reached the threshold(2)"
        );
        assert_eq!(
            job.node_condition("node-00").unwrap().message,
            "gpu 3 unhealthy"
        );
        assert_eq!(
            job.node_condition("node-01").unwrap().message,
            "unknown reason"
        );
        assert!(job.node_condition("node-02").is_none());
        running.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_fails_job_with_pending_nodes() {
        let store = test_support::store();
        let nodes = test_support::node_names(10);
        test_support::add_nodes(&store, &nodes);
        let mut job = OpsJob::new("slow", OpsJobType::Preflight, CLUSTER).with_nodes(&nodes);
        job.spec.availability_ratio = Some(0.8);
        job.spec.timeout_second = 1;
        test_support::create_job(&store, job).await;

        let running = Running::start(store.clone(), ScriptedShell::new());
        let job = running.wait_until("slow", |j| j.is_end()).await;

        assert_eq!(job.status.phase, OpsJobPhase::Failed);
        assert_eq!(
            job.node_condition(JOB_COMPLETED_TYPE).unwrap().message,
            "The job is timeout, timeoutSecond: 1"
        );
        // Only the first batch of two was ever dispatched
        assert_eq!(store.list_workloads().await.unwrap().len(), 2);
        running.stop().await;
    }

    #[tokio::test]
    async fn test_deleted_job_is_cleaned_up() {
        let store = test_support::store();
        let nodes = test_support::node_names(2);
        test_support::add_nodes(&store, &nodes);
        test_support::create_job(
            &store,
            OpsJob::new("pf", OpsJobType::Preflight, CLUSTER).with_nodes(&nodes),
        )
        .await;

        let running = Running::start(store.clone(), ScriptedShell::new());
        running.wait_for_workload("pf-node-00").await;

        store.delete_job("pf").await.unwrap();
        for _ in 0..500 {
            if store.get_job("pf").await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.get_job("pf").await.unwrap_err().is_not_found());
        assert!(store.list_workloads().await.unwrap().is_empty());
        assert!(store.list_faults().await.unwrap().is_empty());
        assert_eq!(store.get_node("node-00").await.unwrap().owner_job(), None);
        running.stop().await;
    }
}

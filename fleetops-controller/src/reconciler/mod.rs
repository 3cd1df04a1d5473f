//! Reconcile loop shared by every operation type
//!
//! [`BaseReconciler`] owns the lifecycle every job goes through: deletion
//! handling, TTL expiry, the wall-clock deadline and non-retryable failures.
//! What a job actually does is delegated to an [`Operation`].

mod batch_operation;

pub use batch_operation::{BatchOperation, BatchSettings};

use async_trait::async_trait;
use chrono::Utc;
use fleetops_core::domain::job::PARAMETER_NODE;
use fleetops_core::domain::meta::OPS_JOB_FINALIZER;
use fleetops_core::{OpsJob, OpsJobPhase, Parameter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::error::{Result, ignore_not_found};
use crate::state::JobStateStore;
use crate::status;
use crate::store::ResourceStore;

/// What the work queue should do with a key after a reconcile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileAction {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileAction {
    /// Nothing to do until the job or something it watches changes
    pub fn await_change() -> Self {
        Self::default()
    }

    /// Reconcile again right away, without the queue's error backoff
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Reconcile again after `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    /// The more urgent of two actions
    pub fn merge(self, other: Self) -> Self {
        let requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            requeue: self.requeue || other.requeue,
            requeue_after,
        }
    }
}

/// Operation-specific half of the reconcile loop
#[async_trait]
pub trait Operation: Send + Sync {
    /// True if this operation handles the job
    fn filter(&self, job: &OpsJob) -> bool;

    /// Checks whether the job's outcome is already known
    ///
    /// Returns true once the job was completed and the reconcile can stop.
    async fn observe(&self, job: &OpsJob) -> Result<bool>;

    /// Makes one increment of progress
    async fn handle(&self, job: &OpsJob) -> Result<ReconcileAction>;

    /// Releases everything the job holds; runs before the finalizer is removed
    async fn cleanup(&self, job: &OpsJob) -> Result<()>;
}

pub struct BaseReconciler {
    store: Arc<dyn ResourceStore>,
    state: Arc<JobStateStore>,
    operation: Arc<dyn Operation>,
}

impl BaseReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        state: Arc<JobStateStore>,
        operation: Arc<dyn Operation>,
    ) -> Self {
        Self {
            store,
            state,
            operation,
        }
    }

    /// Advances the job `name` by one step
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileAction> {
        let start = Instant::now();
        let result = self.reconcile_job(name).await;
        debug!(
            "Finished reconcile ops job {} cost ({:?})",
            name,
            start.elapsed()
        );
        result
    }

    async fn reconcile_job(&self, name: &str) -> Result<ReconcileAction> {
        let Some(job) = ignore_not_found(self.store.get_job(name).await)? else {
            return Ok(ReconcileAction::await_change());
        };
        if !self.operation.filter(&job) {
            return Ok(ReconcileAction::await_change());
        }
        if job.metadata.is_deleting() {
            return self.delete(&job).await;
        }
        if job.is_end() {
            return self.expire(&job).await;
        }

        match self.operation.observe(&job).await {
            Ok(true) => return Ok(ReconcileAction::await_change()),
            Ok(false) => {}
            Err(e) if !e.is_retryable() => return self.fail(&job, &e.to_string()).await,
            Err(e) => return Err(e),
        }

        if job.is_timeout(Utc::now()) {
            let message = format!(
                "The job is timeout, timeoutSecond: {}",
                job.spec.timeout_second
            );
            return self.fail(&job, &message).await;
        }

        match self.operation.handle(&job).await {
            Ok(action) => Ok(action),
            Err(e) if !e.is_retryable() => self.fail(&job, &e.to_string()).await,
            Err(e) => Err(e),
        }
    }

    /// Stops the job, releases what it holds and drops the finalizer
    async fn delete(&self, job: &OpsJob) -> Result<ReconcileAction> {
        if !job.metadata.has_finalizer(OPS_JOB_FINALIZER) {
            return Ok(ReconcileAction::await_change());
        }
        if !job.is_end() {
            self.complete(job, OpsJobPhase::Failed, "The job is stopped")
                .await?;
        }
        if let Err(e) = self.operation.cleanup(job).await {
            error!("failed to clean up ops job {}: {}", job.name(), e);
            return Err(e);
        }
        self.state.remove(job.name());
        ignore_not_found(
            self.store
                .remove_job_finalizer(job.name(), OPS_JOB_FINALIZER)
                .await,
        )?;
        info!("ops job {} is cleaned up", job.name());
        Ok(ReconcileAction::await_change())
    }

    /// Deletes a finished job once its TTL elapsed
    async fn expire(&self, job: &OpsJob) -> Result<ReconcileAction> {
        match job.ttl_remaining(Utc::now()) {
            None => Ok(ReconcileAction::await_change()),
            Some(remaining) if remaining.is_zero() => {
                info!(
                    "ops job {} reached its ttl ({}s), deleting it",
                    job.name(),
                    job.spec.ttl_seconds_after_finished
                );
                ignore_not_found(self.store.delete_job(job.name()).await)?;
                Ok(ReconcileAction::await_change())
            }
            Some(remaining) => Ok(ReconcileAction::requeue_after(remaining)),
        }
    }

    async fn fail(&self, job: &OpsJob, message: &str) -> Result<ReconcileAction> {
        self.complete(job, OpsJobPhase::Failed, message).await?;
        Ok(ReconcileAction::await_change())
    }

    /// Completes the job, keeping the nodes that already succeeded as outputs
    async fn complete(&self, job: &OpsJob, phase: OpsJobPhase, message: &str) -> Result<()> {
        let outputs = if self.state.is_tracked(job.name()) {
            self.state
                .succeeded_keys(job.name())
                .into_iter()
                .map(|node| Parameter::new(PARAMETER_NODE, node))
                .collect()
        } else {
            job.status.outputs.clone()
        };
        status::set_job_completed(self.store.as_ref(), job.name(), phase, message, outputs)
            .await?;
        self.state.remove(job.name());
        Ok(())
    }
}

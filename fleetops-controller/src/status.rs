//! Job status writes
//!
//! Node workers, event handlers and the reconciler all write to the same job
//! status concurrently. Every write re-reads the job, applies a mutation and
//! retries on version conflicts so no writer clobbers another.

use chrono::Utc;
use fleetops_core::{
    Condition, ConditionStatus, OpsJob, OpsJobPhase, OpsJobType, Parameter, set_condition,
};
use tracing::{info, warn};

use crate::error::{OpsError, Result, ignore_not_found};
use crate::store::ResourceStore;

/// Summary condition set when a job finishes
pub const JOB_COMPLETED_TYPE: &str = "JobCompleted";
/// Summary condition listing the nodes of the batch being processed
pub const JOB_PROCESSING_TYPE: &str = "JobProcessing";

const MAX_CONFLICT_RETRIES: usize = 10;

/// Node-keyed condition recording the outcome of `job_type` on `node`
pub fn node_condition(
    job_type: OpsJobType,
    node: &str,
    succeeded: bool,
    message: &str,
) -> Condition {
    let kind = match job_type {
        OpsJobType::Addon => "Addon",
        OpsJobType::Preflight => "Preflight",
        OpsJobType::Reboot => "Reboot",
        OpsJobType::Diagnose => "Diagnose",
        OpsJobType::DumpLog => "DumpLog",
    };
    let (status, outcome) = if succeeded {
        (ConditionStatus::True, "Succeeded")
    } else {
        (ConditionStatus::False, "Failed")
    };
    Condition::new(node, status, format!("{}{}", kind, outcome), message)
}

/// Re-reads `name`, applies `mutate` and writes it back, retrying on conflicts
///
/// `mutate` returns false when nothing changed, in which case no write is
/// issued. Returns the stored job, or `None` if it no longer exists.
pub async fn update_job_status<F>(
    store: &dyn ResourceStore,
    name: &str,
    mut mutate: F,
) -> Result<Option<OpsJob>>
where
    F: FnMut(&mut OpsJob) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut job) = ignore_not_found(store.get_job(name).await)? else {
            return Ok(None);
        };
        if !mutate(&mut job) {
            return Ok(Some(job));
        }
        match store.update_job(&job).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                warn!(
                    "Conflict updating job {} status (attempt {}), retrying",
                    name, attempt
                );
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Moves the job to `phase` and stamps `started_at` on first start
pub async fn set_job_phase(
    store: &dyn ResourceStore,
    name: &str,
    phase: OpsJobPhase,
) -> Result<Option<OpsJob>> {
    update_job_status(store, name, |job| {
        if job.is_end() || (job.status.phase == phase && job.status.started_at.is_some()) {
            return false;
        }
        job.status.phase = phase;
        job.status.started_at.get_or_insert_with(Utc::now);
        true
    })
    .await
}

/// Completes the job with a terminal phase
///
/// A job already in a terminal phase is left untouched, so completion is
/// idempotent and the first terminal phase wins.
pub async fn set_job_completed(
    store: &dyn ResourceStore,
    name: &str,
    phase: OpsJobPhase,
    message: &str,
    outputs: Vec<Parameter>,
) -> Result<Option<OpsJob>> {
    if !phase.is_terminal() {
        return Err(OpsError::Internal(format!(
            "invalid completion phase: {}",
            phase
        )));
    }
    let mut completed = false;
    let job = update_job_status(store, name, |job| {
        if job.is_end() {
            return false;
        }
        let now = Utc::now();
        job.status.finished_at = Some(now);
        job.status.started_at.get_or_insert(now);
        job.status.phase = phase;
        job.status.outputs = outputs.clone();

        let (status, reason) = if phase == OpsJobPhase::Failed {
            (ConditionStatus::False, "JobFailed")
        } else {
            (ConditionStatus::True, "JobSucceeded")
        };
        set_condition(
            &mut job.status.conditions,
            Condition::new(JOB_COMPLETED_TYPE, status, reason, message),
        );
        completed = true;
        true
    })
    .await?;

    if completed {
        info!(
            "The job is completed. name: {}, phase: {}, message: {}",
            name, phase, message
        );
    }
    Ok(job)
}

/// Upserts a condition on the job
pub async fn update_condition(
    store: &dyn ResourceStore,
    name: &str,
    condition: Condition,
) -> Result<Option<OpsJob>> {
    update_job_status(store, name, |job| {
        set_condition(&mut job.status.conditions, condition.clone())
    })
    .await
}

/// Appends an output parameter unless the same one is already recorded
pub async fn append_output(
    store: &dyn ResourceStore,
    name: &str,
    output: Parameter,
) -> Result<Option<OpsJob>> {
    update_job_status(store, name, |job| {
        if job.status.outputs.contains(&output) {
            return false;
        }
        job.status.outputs.push(output.clone());
        true
    })
    .await
}

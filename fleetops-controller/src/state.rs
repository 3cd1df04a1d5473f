//! Job runtime state
//!
//! In-memory record of every tracked job's per-node progress. The map is a
//! cache: it is rebuilt from persisted node, workload and condition state the
//! first time a job is seen after a restart.
//!
//! All reads and writes go through one reader/writer lock. The terminal-once
//! check in [`JobStateStore::set_phase`] happens under the write lock, so a
//! duplicate or late event can never re-drive a finished node.

use fleetops_core::OpsJobPhase;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::scheduler::batch;
use crate::threshold;

const RATIO_TOLERANCE: f64 = 1e-9;

/// Per-job progress: key (node or workload) to phase, plus derived limits
#[derive(Debug, Clone, PartialEq)]
pub struct JobRuntimeState {
    phases: HashMap<String, OpsJobPhase>,
    batch_count: usize,
    max_fail_count: usize,
}

impl JobRuntimeState {
    /// Builds the state for `keys`, all starting `Pending`
    ///
    /// `max_fail_count = max(1, floor(n * (1 - availability_ratio)))`.
    /// `batch_count` is the override when it is set and fits in `n`,
    /// otherwise `max_fail_count` capped at `n`. A single-key job always
    /// processes one key and fails on the first failure.
    pub fn new<I, S>(keys: I, availability_ratio: f64, batch_override: Option<usize>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let phases: HashMap<String, OpsJobPhase> = keys
            .into_iter()
            .map(|k| (k.into(), OpsJobPhase::Pending))
            .collect();
        let total = phases.len();

        let fail_ratio = 1.0 - availability_ratio.clamp(0.0, 1.0);
        // 1.0 - 0.8 is 0.19999999999999996; keep 10 * 0.2 at 2
        let max_fail_count =
            ((total as f64 * fail_ratio + RATIO_TOLERANCE).floor() as usize).max(1);

        let batch_count = match batch_override {
            Some(n) if n > 0 && n <= total => n,
            _ => max_fail_count.min(total),
        };

        let (batch_count, max_fail_count) = if total <= 1 {
            (1, 1)
        } else {
            (batch_count.max(1), max_fail_count)
        };

        Self {
            phases,
            batch_count,
            max_fail_count,
        }
    }

    /// Seeds a recovered phase for a known key
    pub fn with_phase(mut self, key: &str, phase: OpsJobPhase) -> Self {
        if let Some(current) = self.phases.get_mut(key) {
            *current = phase;
        }
        self
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn max_fail_count(&self) -> usize {
        self.max_fail_count
    }

    pub fn total(&self) -> usize {
        self.phases.len()
    }

    pub fn phase(&self, key: &str) -> Option<OpsJobPhase> {
        self.phases.get(key).copied()
    }

    pub fn count(&self, phase: OpsJobPhase) -> usize {
        self.phases.values().filter(|p| **p == phase).count()
    }

    /// Keys in `phase`, sorted
    pub fn keys_in(&self, phase: OpsJobPhase) -> Vec<String> {
        let mut keys: Vec<String> = self
            .phases
            .iter()
            .filter(|(_, p)| **p == phase)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Applies a transition unless the key is unknown or already terminal
    fn set_phase(&mut self, key: &str, phase: OpsJobPhase) -> bool {
        match self.phases.get_mut(key) {
            Some(current) if !current.is_terminal() => {
                *current = phase;
                true
            }
            _ => false,
        }
    }
}

/// Process-wide store of job runtime states, keyed by job name
#[derive(Default)]
pub struct JobStateStore {
    jobs: RwLock<HashMap<String, JobRuntimeState>>,
}

impl JobStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a job with every key `Pending`
    ///
    /// Returns false if the job was already tracked; the existing state is
    /// kept untouched.
    pub fn ensure(
        &self,
        job_id: &str,
        keys: &[String],
        availability_ratio: f64,
        batch_override: Option<usize>,
    ) -> bool {
        self.insert_if_absent(
            job_id,
            JobRuntimeState::new(keys.iter().cloned(), availability_ratio, batch_override),
        )
    }

    /// Starts tracking a job with a prepared (possibly recovered) state
    ///
    /// The check and insert happen under one write lock, so two concurrent
    /// callers cannot both create the entry.
    pub fn insert_if_absent(&self, job_id: &str, state: JobRuntimeState) -> bool {
        let mut jobs = self.write();
        if jobs.contains_key(job_id) {
            return false;
        }
        info!(
            "Tracking job {}: {} key(s), batch count {}, max fail count {}",
            job_id,
            state.total(),
            state.batch_count,
            state.max_fail_count
        );
        jobs.insert(job_id.to_string(), state);
        true
    }

    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.read().contains_key(job_id)
    }

    /// Sets the phase of one key
    ///
    /// Returns false (and changes nothing) if the job is not tracked, the key
    /// is unknown, or the key already reached a terminal phase.
    pub fn set_phase(&self, job_id: &str, key: &str, phase: OpsJobPhase) -> bool {
        let mut jobs = self.write();
        let Some(state) = jobs.get_mut(job_id) else {
            debug!(
                "Dropping phase update for untracked job {} (key {}, phase {})",
                job_id, key, phase
            );
            return false;
        };
        if !state.set_phase(key, phase) {
            return false;
        }
        info!(
            "update node status for ops job, job.id: {}, node.id: {}, phase: {}",
            job_id, key, phase
        );
        true
    }

    /// Aggregate phase of the job and a human readable message
    ///
    /// Untracked jobs are `Pending`.
    pub fn aggregate_phase(&self, job_id: &str) -> (OpsJobPhase, String) {
        match self.read().get(job_id) {
            Some(state) => threshold::evaluate(state),
            None => (OpsJobPhase::Pending, String::new()),
        }
    }

    /// Keys still waiting to be processed, sorted
    pub fn pending_keys(&self, job_id: &str) -> Vec<String> {
        self.read()
            .get(job_id)
            .map(|s| s.keys_in(OpsJobPhase::Pending))
            .unwrap_or_default()
    }

    /// Keys that finished successfully, sorted
    pub fn succeeded_keys(&self, job_id: &str) -> Vec<String> {
        self.read()
            .get(job_id)
            .map(|s| s.keys_in(OpsJobPhase::Succeeded))
            .unwrap_or_default()
    }

    /// Next keys to dispatch without exceeding the batch width
    pub fn next_batch(&self, job_id: &str) -> Vec<String> {
        self.read()
            .get(job_id)
            .map(batch::next_batch)
            .unwrap_or_default()
    }

    pub fn phase(&self, job_id: &str, key: &str) -> Option<OpsJobPhase> {
        self.read().get(job_id).and_then(|s| s.phase(key))
    }

    /// Copy of a job's state, for inspection
    pub fn snapshot(&self, job_id: &str) -> Option<JobRuntimeState> {
        self.read().get(job_id).cloned()
    }

    /// Stops tracking a job
    pub fn remove(&self, job_id: &str) {
        if self.write().remove(job_id).is_some() {
            debug!("Job {} runtime state removed", job_id);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobRuntimeState>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobRuntimeState>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

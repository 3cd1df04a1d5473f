//! Failure threshold evaluation

use fleetops_core::OpsJobPhase;

use crate::state::JobRuntimeState;

/// Aggregate phase of a job from its per-key phases
///
/// Failure is checked first: reaching `max_fail_count` fails the job even if
/// every key already finished.
pub fn evaluate(state: &JobRuntimeState) -> (OpsJobPhase, String) {
    let failed = state.count(OpsJobPhase::Failed);
    let succeeded = state.count(OpsJobPhase::Succeeded);

    if failed >= state.max_fail_count() {
        return (
            OpsJobPhase::Failed,
            format!(
                "The number of failures has reached the threshold({})",
                state.max_fail_count()
            ),
        );
    }
    if failed + succeeded >= state.total() {
        return (
            OpsJobPhase::Succeeded,
            format!("success: {}, fail: {}", succeeded, failed),
        );
    }
    (OpsJobPhase::Running, String::new())
}

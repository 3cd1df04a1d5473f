//! Batch selection

use fleetops_core::OpsJobPhase;

use crate::state::JobRuntimeState;

/// Keys to dispatch next for a job
///
/// Returns nothing while `batch_count` keys are already running. Otherwise
/// returns the lexicographically smallest pending keys, at most
/// `batch_count - running` of them, so repeated calls on an unchanged state
/// always propose the same batch.
pub fn next_batch(state: &JobRuntimeState) -> Vec<String> {
    let running = state.count(OpsJobPhase::Running);
    if running >= state.batch_count() {
        return Vec::new();
    }
    let mut pending = state.keys_in(OpsJobPhase::Pending);
    pending.truncate(state.batch_count() - running);
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(n: usize, ratio: f64, batch: Option<usize>) -> JobRuntimeState {
        JobRuntimeState::new((0..n).map(|i| format!("node-{:02}", i)), ratio, batch)
    }

    #[test]
    fn test_returns_sorted_prefix() {
        let s = JobRuntimeState::new(["c", "a", "d", "b"], 0.5, None);
        assert_eq!(next_batch(&s), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_is_deterministic() {
        let s = state(10, 0.6, None);
        let first = next_batch(&s);
        for _ in 0..20 {
            assert_eq!(next_batch(&s), first);
        }
    }

    #[test]
    fn test_full_batch_dispatches_nothing() {
        let s = state(10, 0.8, None)
            .with_phase("node-00", OpsJobPhase::Running)
            .with_phase("node-01", OpsJobPhase::Running);
        assert!(next_batch(&s).is_empty());
    }

    #[test]
    fn test_fills_remaining_capacity_only() {
        let s = state(10, 0.0, Some(4))
            .with_phase("node-00", OpsJobPhase::Running)
            .with_phase("node-01", OpsJobPhase::Succeeded)
            .with_phase("node-02", OpsJobPhase::Failed);
        let batch = next_batch(&s);
        assert_eq!(batch, vec!["node-03", "node-04", "node-05"]);
        for key in &batch {
            assert_eq!(s.phase(key), Some(OpsJobPhase::Pending));
        }
    }

    #[test]
    fn test_never_exceeds_capacity() {
        for n in 1..=10usize {
            for running in 0..=n {
                let mut s = state(n, 0.5, None);
                for i in 0..running {
                    s = s.with_phase(&format!("node-{:02}", i), OpsJobPhase::Running);
                }
                let capacity = s.batch_count().saturating_sub(running);
                assert!(next_batch(&s).len() <= capacity);
            }
        }
    }
}

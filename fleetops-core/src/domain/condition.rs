//! Status conditions
//!
//! Conditions are the durable audit trail of a job: one entry per affected
//! node (keyed by node name) plus summary entries such as `JobCompleted`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Inserts or updates the condition with the same type
///
/// The transition time is only moved when the status flips. Returns true if
/// anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) else {
        conditions.push(new);
        return true;
    };

    let mut changed = false;
    if existing.status != new.status {
        existing.status = new.status;
        existing.last_transition_time = new.last_transition_time;
        changed = true;
    }
    if existing.reason != new.reason {
        existing.reason = new.reason;
        changed = true;
    }
    if existing.message != new.message {
        existing.message = new.message;
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_inserts_then_updates() {
        let mut conditions = Vec::new();
        assert!(set_condition(
            &mut conditions,
            Condition::new("node-1", ConditionStatus::False, "AddonFailed", "boom"),
        ));
        assert!(!set_condition(
            &mut conditions,
            Condition::new("node-1", ConditionStatus::False, "AddonFailed", "boom"),
        ));
        assert!(set_condition(
            &mut conditions,
            Condition::new("node-1", ConditionStatus::False, "AddonFailed", "other"),
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "other");
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut conditions = Vec::new();
        let first = Condition::new("JobCompleted", ConditionStatus::True, "a", "a");
        let stamp = first.last_transition_time;
        set_condition(&mut conditions, first);

        let mut later = Condition::new("JobCompleted", ConditionStatus::True, "b", "b");
        later.last_transition_time = stamp + chrono::Duration::seconds(5);
        set_condition(&mut conditions, later);
        assert_eq!(conditions[0].last_transition_time, stamp);
    }
}

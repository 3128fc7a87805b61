//! Status condition helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Condition, State};

pub const CONDITION_TYPE_READY: &str = "Ready";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let status_changed = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if status_changed {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        });
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Set the `Ready` condition from the outcome of a pass
pub fn set_ready_condition(conditions: &mut Vec<Condition>, state: State) {
    let (status, reason, message) = match state {
        State::Ready => (
            CONDITION_STATUS_TRUE,
            "ComponentsReady",
            "All enabled components are deployed and ready",
        ),
        State::NotReady => (
            CONDITION_STATUS_FALSE,
            "ComponentsNotReady",
            "Waiting for component rollouts to converge",
        ),
        State::Disabled => (
            CONDITION_STATUS_FALSE,
            "ComponentsDisabled",
            "No component is enabled",
        ),
        State::Ignored => (
            CONDITION_STATUS_FALSE,
            "DuplicateInstance",
            "Another GpuCluster is already reconciled by this operator",
        ),
    };
    set_condition(conditions, CONDITION_TYPE_READY, status, reason, message);
}

//! Condition list bookkeeping for MeshRootCertificate status.
//!
//! A condition list holds at most one entry per type. Setting a type that is
//! already present updates it in place; `last_transition_time` only moves
//! when the status flips.

use chrono::{DateTime, Utc};

use super::types::{ConditionStatus, MrcCondition, MrcConditionType, MrcState};

pub const REASON_CERTIFICATE_ACCEPTED: &str = "CertificateAccepted";
pub const REASON_ERROR_RETRIEVING_CA: &str = "ErrorRetrievingCA";
pub const REASON_NOT_ACCEPTED_ISSUING: &str = "NotAcceptedIssuing";
pub const REASON_NOT_ACCEPTED_VALIDATING: &str = "NotAcceptedValidating";
pub const REASON_PASSIVE_STATE_ISSUING: &str = "PassiveStateIssuing";
pub const REASON_PASSIVE_STATE_VALIDATING: &str = "PassiveStateValidating";
pub const REASON_PASSIVELY_IN_USE: &str = "CertificatePassivelyInUse";
pub const REASON_STAGE_ENTERED: &str = "StageEntered";
pub const REASON_STAGE_COMPLETED: &str = "StageCompleted";

/// Set the condition of `condition_type`. Returns whether the list changed.
pub fn set_condition(
    conditions: &mut Vec<MrcCondition>,
    condition_type: MrcConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    match conditions.iter_mut().find(|c| c.condition_type == condition_type) {
        Some(existing) => {
            let mut changed = false;
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Some(now);
                changed = true;
            }
            if existing.reason != reason {
                existing.reason = reason.to_string();
                changed = true;
            }
            if existing.message != message {
                existing.message = message.to_string();
                changed = true;
            }
            changed
        }
        None => {
            conditions.push(MrcCondition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Some(now),
            });
            true
        }
    }
}

pub fn get_condition(conditions: &[MrcCondition], condition_type: MrcConditionType) -> Option<&MrcCondition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

pub fn is_condition_true(conditions: &[MrcCondition], condition_type: MrcConditionType) -> bool {
    get_condition(conditions, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// The rotation stage the conditions declare: the most recently transitioned
/// stage condition whose status is `True`.
pub fn implied_stage(conditions: &[MrcCondition]) -> Option<MrcState> {
    conditions
        .iter()
        .enumerate()
        .filter(|(_, c)| c.status == ConditionStatus::True)
        .filter_map(|(index, c)| c.condition_type.stage().map(|stage| ((c.last_transition_time, index), stage)))
        .max_by_key(|(key, _)| *key)
        .map(|(_, stage)| stage)
}

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/* ============================= CONDITION TYPES ============================= */

pub const CA_ROOT_SECRET_RECONCILED: &str = "PolicyServerCARootSecretReconciled";
pub const CA_SECRET_RECONCILED: &str = "PolicyServerCASecretReconciled";
pub const CONFIG_MAP_RECONCILED: &str = "PolicyServerConfigMapReconciled";
pub const POD_DISRUPTION_BUDGET_RECONCILED: &str = "PolicyServerPodDisruptionBudgetReconciled";
pub const DEPLOYMENT_RECONCILED: &str = "PolicyServerDeploymentReconciled";
pub const SERVICE_RECONCILED: &str = "PolicyServerServiceReconciled";

pub const POLICY_SERVER_CONFIGURATION_UP_TO_DATE: &str = "PolicyServerConfigurationUpToDate";
pub const POLICY_UNIQUELY_REACHABLE: &str = "PolicyUniquelyReachable";
pub const POLICY_ACTIVE: &str = "PolicyActive";

pub const REASON_RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
pub const REASON_RECONCILIATION_FAILED: &str = "ReconciliationFailed";
pub const REASON_POLICY_SERVER_NOT_FOUND: &str = "PolicyServerNotFound";
pub const REASON_PENDING: &str = "Pending";

/* ============================= CONSTRUCTORS ============================= */

pub fn condition_true(condition_type: &str, observed_generation: Option<i64>) -> Condition {
    Condition {
        type_: condition_type.to_string(),
        status: "True".to_string(),
        reason: REASON_RECONCILIATION_SUCCEEDED.to_string(),
        message: String::new(),
        observed_generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

pub fn condition_false(
    condition_type: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: condition_type.to_string(),
        status: "False".to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

/* ============================= MUTATION ============================= */

/// Replace the condition with the same type, keeping the previous
/// `lastTransitionTime` when the status value did not flip.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        if existing.status == new.status {
            new.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = new;
        return;
    }
    conditions.push(new);
}

pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == condition_type && c.status == "True")
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_inserts_new_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition_true(SERVICE_RECONCILED, Some(1)));
        assert_eq!(conditions.len(), 1);
        assert!(is_condition_true(&conditions, SERVICE_RECONCILED));
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition_true(SERVICE_RECONCILED, Some(1)));
        set_condition(
            &mut conditions,
            condition_false(SERVICE_RECONCILED, REASON_RECONCILIATION_FAILED, "boom", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert!(!is_condition_true(&conditions, SERVICE_RECONCILED));
        assert_eq!(conditions[0].message, "boom");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_transition_time_sticks_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition_true(CONFIG_MAP_RECONCILED, Some(1)));
        let first_transition = conditions[0].last_transition_time.clone();

        set_condition(&mut conditions, condition_true(CONFIG_MAP_RECONCILED, Some(2)));
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_multiple_types_coexist() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition_true(SERVICE_RECONCILED, None));
        set_condition(
            &mut conditions,
            condition_false(
                DEPLOYMENT_RECONCILED,
                REASON_RECONCILIATION_FAILED,
                "image pull backoff",
                None,
            ),
        );
        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, SERVICE_RECONCILED));
        assert!(!is_condition_true(&conditions, DEPLOYMENT_RECONCILED));
        assert!(!is_condition_true(&conditions, CONFIG_MAP_RECONCILED));
    }
}

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= EXECUTION MODE ============================= */

/// Execution mode of a policy.
///
/// `Monitor` evaluates and logs but always accepts; `Protect` enforces.
/// The only allowed transition on update is `monitor → protect`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PolicyMode {
    #[default]
    Protect,
    Monitor,
}

impl std::fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyMode::Protect => write!(f, "protect"),
            PolicyMode::Monitor => write!(f, "monitor"),
        }
    }
}

/* ============================= WEBHOOK KNOBS ============================= */

/// How errors and timeouts from the webhook call are handled by the API server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Fail => "Fail",
            FailurePolicy::Ignore => "Ignore",
        }
    }
}

/// How the rules list is matched against incoming requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    #[default]
    Equivalent,
    Exact,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Equivalent => "Equivalent",
            MatchPolicy::Exact => "Exact",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum SideEffects {
    #[default]
    None,
    NoneOnDryRun,
}

impl SideEffects {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffects::None => "None",
            SideEffects::NoneOnDryRun => "NoneOnDryRun",
        }
    }
}

/* ============================= CONTEXT AWARENESS ============================= */

/// A resource kind a policy is allowed to read at evaluation time through the
/// policy-server service account.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContextAwareResource {
    pub api_version: String,
    pub kind: String,
}

/* ============================= GROUP MEMBERS ============================= */

/// A single named member of a policy group.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyGroupMember {
    /// Location of the WebAssembly module (registry://, http://, file://).
    pub module: String,

    /// Free-form configuration values handed to the module.
    #[serde(default = "default_settings")]
    pub settings: RawExtension,
}

/// A member of a cluster-scoped policy group; may read cluster context.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicyGroupMember {
    /// Location of the WebAssembly module (registry://, http://, file://).
    pub module: String,

    /// Free-form configuration values handed to the module.
    #[serde(default = "default_settings")]
    pub settings: RawExtension,

    /// Resources this member may read at evaluation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_aware_resources: Option<Vec<ContextAwareResource>>,
}

/* ============================= STATUS ============================= */

/// Scheduling phase of a policy.
///
/// `unscheduled` → no such PolicyServer; `scheduled` → bound, config not yet
/// observed; `pending` → present in the server config; `active` → the server
/// deployment is serving the latest config and the webhook is registered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PolicyStatusPhase {
    #[default]
    Unscheduled,
    Scheduled,
    Pending,
    Active,
}

impl std::fmt::Display for PolicyStatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyStatusPhase::Unscheduled => write!(f, "unscheduled"),
            PolicyStatusPhase::Scheduled => write!(f, "scheduled"),
            PolicyStatusPhase::Pending => write!(f, "pending"),
            PolicyStatusPhase::Active => write!(f, "active"),
        }
    }
}

/// Status shared by all four policy kinds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Scheduling phase, see [`PolicyStatusPhase`].
    #[serde(default)]
    pub policy_status: PolicyStatusPhase,

    /// The mode the webhook configuration currently enforces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PolicyMode>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/* ============================= DEFAULTS ============================= */

pub(crate) fn default_policy_server() -> String {
    "default".to_string()
}

pub(crate) fn default_settings() -> RawExtension {
    RawExtension(serde_json::json!({}))
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PolicyMode::Protect).unwrap(),
            r#""protect""#
        );
        assert_eq!(
            serde_json::to_string(&PolicyMode::Monitor).unwrap(),
            r#""monitor""#
        );
    }

    #[test]
    fn test_policy_mode_default_is_protect() {
        assert_eq!(PolicyMode::default(), PolicyMode::Protect);
    }

    #[test]
    fn test_failure_policy_serializes_capitalized() {
        assert_eq!(
            serde_json::to_string(&FailurePolicy::Fail).unwrap(),
            r#""Fail""#
        );
        assert_eq!(
            serde_json::to_string(&FailurePolicy::Ignore).unwrap(),
            r#""Ignore""#
        );
    }

    #[test]
    fn test_side_effects_default_is_none() {
        assert_eq!(SideEffects::default(), SideEffects::None);
        assert_eq!(SideEffects::None.as_str(), "None");
        assert_eq!(SideEffects::NoneOnDryRun.as_str(), "NoneOnDryRun");
    }

    #[test]
    fn test_status_phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PolicyStatusPhase::Unscheduled).unwrap(),
            r#""unscheduled""#
        );
        assert_eq!(
            serde_json::to_string(&PolicyStatusPhase::Active).unwrap(),
            r#""active""#
        );
    }

    #[test]
    fn test_group_member_settings_default_to_empty_object() {
        let json = r#"{"module":"registry://ghcr.io/kubewarden/policies/safe-labels:v1.0.0"}"#;
        let member: PolicyGroupMember = serde_json::from_str(json).unwrap();
        assert_eq!(member.settings.0, serde_json::json!({}));
    }

    #[test]
    fn test_cluster_group_member_carries_context_aware_resources() {
        let json = r#"{
            "module": "registry://ghcr.io/kubewarden/policies/unique-ingress:v1.0.0",
            "contextAwareResources": [
                {"apiVersion": "networking.k8s.io/v1", "kind": "Ingress"}
            ]
        }"#;
        let member: ClusterPolicyGroupMember = serde_json::from_str(json).unwrap();
        let resources = member.context_aware_resources.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kind, "Ingress");
    }

    #[test]
    fn test_policy_status_roundtrip() {
        let status = PolicyStatus {
            policy_status: PolicyStatusPhase::Pending,
            mode: Some(PolicyMode::Monitor),
            conditions: vec![],
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""policyStatus":"pending""#));
        assert!(json.contains(r#""mode":"monitor""#));
        assert!(!json.contains("conditions"));

        let back: PolicyStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.policy_status, PolicyStatusPhase::Pending);
        assert_eq!(back.mode, Some(PolicyMode::Monitor));
    }
}

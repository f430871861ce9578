use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{
    default_policy_server, FailurePolicy, MatchPolicy, PolicyGroupMember, PolicyMode, PolicyStatus,
    SideEffects,
};

/// AdmissionPolicyGroup combines several named member policies with a boolean
/// expression over their verdicts; scoped to its own namespace. Groups are
/// always validating, never mutating.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "AdmissionPolicyGroup",
    plural = "admissionpolicygroups",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPolicyGroupSpec {
    /// Ordered map of member name to member policy. Each name becomes a
    /// zero-arity boolean function callable from `expression`.
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyGroupMember>,

    /// Boolean expression over the member names deciding the group verdict.
    pub expression: String,

    /// Message returned to the user when the group rejects a request.
    pub message: String,

    /// Operations and resources the webhook cares about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RuleWithOperations>>,

    /// Execution mode, `protect` or `monitor`. Defaults to `protect`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PolicyMode>,

    /// Name of the PolicyServer that evaluates this group.
    #[serde(default = "default_policy_server")]
    pub policy_server: String,

    /// Runs the webhook only on objects with matching labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,

    /// CEL conditions filtering requests after rule and selector matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_conditions: Option<Vec<MatchCondition>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_policy: Option<MatchPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<SideEffects>,

    /// Webhook call timeout in seconds, between 1 and 30. Defaults to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    /// Whether background audit scans should evaluate this group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_audit: Option<bool>,
}

impl Default for AdmissionPolicyGroupSpec {
    fn default() -> Self {
        AdmissionPolicyGroupSpec {
            policies: BTreeMap::new(),
            expression: String::new(),
            message: String::new(),
            rules: None,
            mode: None,
            policy_server: default_policy_server(),
            object_selector: None,
            match_conditions: None,
            match_policy: None,
            failure_policy: None,
            side_effects: None,
            timeout_seconds: None,
            background_audit: None,
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    const YAML: &str = r#"
apiVersion: policies.kubewarden.io/v1
kind: AdmissionPolicyGroup
metadata:
  name: signed-or-trusted
  namespace: default
spec:
  policyServer: default
  rules:
    - apiGroups: [""]
      apiVersions: ["v1"]
      resources: ["pods"]
      operations: ["CREATE", "UPDATE"]
  policies:
    signed_by_alice:
      module: ghcr.io/kubewarden/policies/verify-image-signatures:v0.3.0
      settings:
        signatures:
          - image: "*"
            pubKeys: ["alice"]
    reject_latest:
      module: registry://ghcr.io/kubewarden/policies/trusted-repos:v0.2.0
  expression: "reject_latest() || signed_by_alice()"
  message: "the image is not signed by Alice or uses the latest tag"
"#;

    #[test]
    fn test_crd_identity() {
        let crd = AdmissionPolicyGroup::crd();
        assert_eq!(crd.spec.names.kind, "AdmissionPolicyGroup");
        assert_eq!(crd.spec.names.plural, "admissionpolicygroups");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_deserialize_group() {
        let group: AdmissionPolicyGroup = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(group.spec.policies.len(), 2);
        assert!(group.spec.policies.contains_key("signed_by_alice"));
        assert!(group.spec.policies.contains_key("reject_latest"));
        assert_eq!(
            group.spec.expression,
            "reject_latest() || signed_by_alice()"
        );
        assert!(!group.spec.message.is_empty());
    }

    #[test]
    fn test_member_ordering_is_deterministic() {
        let group: AdmissionPolicyGroup = serde_yaml::from_str(YAML).unwrap();
        let names: Vec<&str> = group.spec.policies.keys().map(String::as_str).collect();
        // BTreeMap iterates in lexicographic order regardless of input order.
        assert_eq!(names, vec!["reject_latest", "signed_by_alice"]);
    }
}

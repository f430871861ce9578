use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{
    default_policy_server, ClusterPolicyGroupMember, FailurePolicy, MatchPolicy, PolicyMode,
    PolicyStatus, SideEffects,
};

/// ClusterAdmissionPolicyGroup combines several named member policies with a
/// boolean expression over their verdicts, cluster-wide. Groups are always
/// validating, never mutating.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "ClusterAdmissionPolicyGroup",
    plural = "clusteradmissionpolicygroups",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAdmissionPolicyGroupSpec {
    /// Ordered map of member name to member policy. Each name becomes a
    /// zero-arity boolean function callable from `expression`.
    #[serde(default)]
    pub policies: BTreeMap<String, ClusterPolicyGroupMember>,

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

    /// Restricts the webhook to requests from matching namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

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

impl Default for ClusterAdmissionPolicyGroupSpec {
    fn default() -> Self {
        ClusterAdmissionPolicyGroupSpec {
            policies: BTreeMap::new(),
            expression: String::new(),
            message: String::new(),
            rules: None,
            mode: None,
            policy_server: default_policy_server(),
            namespace_selector: None,
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

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = ClusterAdmissionPolicyGroup::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.plural, "clusteradmissionpolicygroups");
    }

    #[test]
    fn test_deserialize_member_context_aware_resources() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: ClusterAdmissionPolicyGroup
metadata:
  name: ingress-checks
spec:
  policies:
    unique_ingress:
      module: registry://ghcr.io/kubewarden/policies/unique-ingress:v1.0.0
      contextAwareResources:
        - apiVersion: networking.k8s.io/v1
          kind: Ingress
    safe_labels:
      module: registry://ghcr.io/kubewarden/policies/safe-labels:v1.0.0
  expression: "unique_ingress() && safe_labels()"
  message: "ingress is not acceptable"
  rules:
    - apiGroups: ["networking.k8s.io"]
      apiVersions: ["v1"]
      resources: ["ingresses"]
      operations: ["CREATE"]
"#;
        let group: ClusterAdmissionPolicyGroup = serde_yaml::from_str(yaml).unwrap();
        let member = &group.spec.policies["unique_ingress"];
        let resources = member.context_aware_resources.as_ref().unwrap();
        assert_eq!(resources[0].kind, "Ingress");
        assert!(group.spec.policies["safe_labels"]
            .context_aware_resources
            .is_none());
    }
}

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{
    default_policy_server, default_settings, ContextAwareResource, FailurePolicy, MatchPolicy,
    PolicyMode, PolicyStatus, SideEffects,
};

/// ClusterAdmissionPolicy enforces a single WebAssembly policy on admission
/// traffic across the whole cluster, optionally narrowed by a namespace
/// selector.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "ClusterAdmissionPolicy",
    plural = "clusteradmissionpolicies",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAdmissionPolicySpec {
    /// Location of the WASM module to be loaded. Can be a local file
    /// (file://), a remote file served over HTTP(S), or an artifact in an
    /// OCI registry (registry://, the default when the prefix is missing).
    pub module: String,

    /// Free-form object holding the policy configuration values.
    #[serde(default = "default_settings")]
    pub settings: RawExtension,

    /// Operations and resources the webhook cares about. A request is
    /// forwarded if it matches any rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RuleWithOperations>>,

    /// Whether the policy may mutate incoming requests.
    #[serde(default)]
    pub mutating: bool,

    /// Execution mode, `protect` or `monitor`. Defaults to `protect`.
    /// A policy may move from `monitor` to `protect` but never back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PolicyMode>,

    /// Name of the PolicyServer that evaluates this policy.
    #[serde(default = "default_policy_server")]
    pub policy_server: String,

    /// Restricts the webhook to requests from matching namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Runs the webhook only on objects with matching labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,

    /// CEL conditions filtering requests after rule and selector matching.
    /// At most 64 entries; all must hold for the policy to run.
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

    /// Resources this policy may read at evaluation time through the
    /// policy-server service account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_aware_resources: Option<Vec<ContextAwareResource>>,

    /// Whether background audit scans should evaluate this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_audit: Option<bool>,
}

impl Default for ClusterAdmissionPolicySpec {
    fn default() -> Self {
        ClusterAdmissionPolicySpec {
            module: String::new(),
            settings: default_settings(),
            rules: None,
            mutating: false,
            mode: None,
            policy_server: default_policy_server(),
            namespace_selector: None,
            object_selector: None,
            match_conditions: None,
            match_policy: None,
            failure_policy: None,
            side_effects: None,
            timeout_seconds: None,
            context_aware_resources: None,
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
        let crd = ClusterAdmissionPolicy::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.plural, "clusteradmissionpolicies");
    }

    #[test]
    fn test_deserialize_with_namespace_selector_and_context() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: ClusterAdmissionPolicy
metadata:
  name: unique-ingress
spec:
  module: registry://ghcr.io/kubewarden/policies/unique-ingress:v1.0.0
  rules:
    - apiGroups: ["networking.k8s.io"]
      apiVersions: ["v1"]
      resources: ["ingresses"]
      operations: ["CREATE", "UPDATE"]
  namespaceSelector:
    matchExpressions:
      - key: environment
        operator: In
        values: ["prod", "staging"]
  contextAwareResources:
    - apiVersion: networking.k8s.io/v1
      kind: Ingress
"#;
        let policy: ClusterAdmissionPolicy = serde_yaml::from_str(yaml).unwrap();
        let selector = policy.spec.namespace_selector.unwrap();
        assert_eq!(selector.match_expressions.unwrap()[0].key, "environment");
        let resources = policy.spec.context_aware_resources.unwrap();
        assert_eq!(resources[0].api_version, "networking.k8s.io/v1");
        assert_eq!(resources[0].kind, "Ingress");
    }

    #[test]
    fn test_mode_roundtrip() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: ClusterAdmissionPolicy
metadata:
  name: monitored
spec:
  module: registry://ghcr.io/kubewarden/policies/safe-labels:v1.0.0
  mode: monitor
"#;
        let policy: ClusterAdmissionPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.spec.mode, Some(PolicyMode::Monitor));
        let json = serde_json::to_value(&policy.spec).unwrap();
        assert_eq!(json["mode"], "monitor");
    }
}

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{
    default_policy_server, default_settings, FailurePolicy, MatchPolicy, PolicyMode, PolicyStatus,
    SideEffects,
};

/// AdmissionPolicy enforces a single WebAssembly policy on admission traffic
/// originating from its own namespace.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "AdmissionPolicy",
    plural = "admissionpolicies",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPolicySpec {
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

    /// Whether background audit scans should evaluate this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_audit: Option<bool>,
}

impl Default for AdmissionPolicySpec {
    fn default() -> Self {
        AdmissionPolicySpec {
            module: String::new(),
            settings: default_settings(),
            rules: None,
            mutating: false,
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

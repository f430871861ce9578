use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    FailurePolicy, MatchPolicy, PolicyMode, PolicyStatus, SideEffects,
};

/* ============================= KIND ============================= */

/// Discriminator for the four policy kinds, used in index keys and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    AdmissionPolicy,
    ClusterAdmissionPolicy,
    AdmissionPolicyGroup,
    ClusterAdmissionPolicyGroup,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::AdmissionPolicy => "AdmissionPolicy",
            PolicyKind::ClusterAdmissionPolicy => "ClusterAdmissionPolicy",
            PolicyKind::AdmissionPolicyGroup => "AdmissionPolicyGroup",
            PolicyKind::ClusterAdmissionPolicyGroup => "ClusterAdmissionPolicyGroup",
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            PolicyKind::ClusterAdmissionPolicy | PolicyKind::ClusterAdmissionPolicyGroup
        )
    }
}

/* ============================= POLICY ============================= */

/// Tagged union over the four policy kinds.
///
/// The reconcilers and the config serializer operate on this capability set
/// instead of the concrete custom resources, so the per-kind controllers stay
/// thin wrappers.
#[derive(Debug, Clone)]
pub enum Policy {
    Admission(AdmissionPolicy),
    ClusterAdmission(ClusterAdmissionPolicy),
    Group(AdmissionPolicyGroup),
    ClusterGroup(ClusterAdmissionPolicyGroup),
}

impl From<AdmissionPolicy> for Policy {
    fn from(p: AdmissionPolicy) -> Self {
        Policy::Admission(p)
    }
}

impl From<ClusterAdmissionPolicy> for Policy {
    fn from(p: ClusterAdmissionPolicy) -> Self {
        Policy::ClusterAdmission(p)
    }
}

impl From<AdmissionPolicyGroup> for Policy {
    fn from(p: AdmissionPolicyGroup) -> Self {
        Policy::Group(p)
    }
}

impl From<ClusterAdmissionPolicyGroup> for Policy {
    fn from(p: ClusterAdmissionPolicyGroup) -> Self {
        Policy::ClusterGroup(p)
    }
}

impl Policy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Admission(_) => PolicyKind::AdmissionPolicy,
            Policy::ClusterAdmission(_) => PolicyKind::ClusterAdmissionPolicy,
            Policy::Group(_) => PolicyKind::AdmissionPolicyGroup,
            Policy::ClusterGroup(_) => PolicyKind::ClusterAdmissionPolicyGroup,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Policy::Admission(p) => &p.metadata,
            Policy::ClusterAdmission(p) => &p.metadata,
            Policy::Group(p) => &p.metadata,
            Policy::ClusterGroup(p) => &p.metadata,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Policy::Admission(p) => p.name_any(),
            Policy::ClusterAdmission(p) => p.name_any(),
            Policy::Group(p) => p.name_any(),
            Policy::ClusterGroup(p) => p.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        self.metadata().namespace.clone()
    }

    /// Deterministic identifier used as webhook-configuration name and
    /// config-map entry key.
    pub fn unique_name(&self) -> String {
        let name = self.name();
        match self {
            Policy::Admission(p) => {
                let ns = p.namespace().unwrap_or_default();
                format!("namespaced-{ns}-{name}")
            }
            Policy::ClusterAdmission(_) => format!("clusterwide-{name}"),
            Policy::Group(p) => {
                let ns = p.namespace().unwrap_or_default();
                format!("namespaced-group-{ns}-{name}")
            }
            Policy::ClusterGroup(_) => format!("clusterwide-group-{name}"),
        }
    }

    pub fn policy_server(&self) -> &str {
        match self {
            Policy::Admission(p) => &p.spec.policy_server,
            Policy::ClusterAdmission(p) => &p.spec.policy_server,
            Policy::Group(p) => &p.spec.policy_server,
            Policy::ClusterGroup(p) => &p.spec.policy_server,
        }
    }

    /// Groups are always validating; single policies follow their spec.
    pub fn is_mutating(&self) -> bool {
        match self {
            Policy::Admission(p) => p.spec.mutating,
            Policy::ClusterAdmission(p) => p.spec.mutating,
            Policy::Group(_) | Policy::ClusterGroup(_) => false,
        }
    }

    pub fn mode(&self) -> PolicyMode {
        match self {
            Policy::Admission(p) => p.spec.mode.unwrap_or_default(),
            Policy::ClusterAdmission(p) => p.spec.mode.unwrap_or_default(),
            Policy::Group(p) => p.spec.mode.unwrap_or_default(),
            Policy::ClusterGroup(p) => p.spec.mode.unwrap_or_default(),
        }
    }

    pub fn rules(&self) -> &[RuleWithOperations] {
        let rules = match self {
            Policy::Admission(p) => &p.spec.rules,
            Policy::ClusterAdmission(p) => &p.spec.rules,
            Policy::Group(p) => &p.spec.rules,
            Policy::ClusterGroup(p) => &p.spec.rules,
        };
        rules.as_deref().unwrap_or_default()
    }

    pub fn match_conditions(&self) -> &[MatchCondition] {
        let conditions = match self {
            Policy::Admission(p) => &p.spec.match_conditions,
            Policy::ClusterAdmission(p) => &p.spec.match_conditions,
            Policy::Group(p) => &p.spec.match_conditions,
            Policy::ClusterGroup(p) => &p.spec.match_conditions,
        };
        conditions.as_deref().unwrap_or_default()
    }

    pub fn match_policy(&self) -> MatchPolicy {
        match self {
            Policy::Admission(p) => p.spec.match_policy.unwrap_or_default(),
            Policy::ClusterAdmission(p) => p.spec.match_policy.unwrap_or_default(),
            Policy::Group(p) => p.spec.match_policy.unwrap_or_default(),
            Policy::ClusterGroup(p) => p.spec.match_policy.unwrap_or_default(),
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            Policy::Admission(p) => p.spec.failure_policy.unwrap_or_default(),
            Policy::ClusterAdmission(p) => p.spec.failure_policy.unwrap_or_default(),
            Policy::Group(p) => p.spec.failure_policy.unwrap_or_default(),
            Policy::ClusterGroup(p) => p.spec.failure_policy.unwrap_or_default(),
        }
    }

    pub fn side_effects(&self) -> SideEffects {
        match self {
            Policy::Admission(p) => p.spec.side_effects.unwrap_or_default(),
            Policy::ClusterAdmission(p) => p.spec.side_effects.unwrap_or_default(),
            Policy::Group(p) => p.spec.side_effects.unwrap_or_default(),
            Policy::ClusterGroup(p) => p.spec.side_effects.unwrap_or_default(),
        }
    }

    pub fn timeout_seconds(&self) -> i32 {
        let timeout = match self {
            Policy::Admission(p) => p.spec.timeout_seconds,
            Policy::ClusterAdmission(p) => p.spec.timeout_seconds,
            Policy::Group(p) => p.spec.timeout_seconds,
            Policy::ClusterGroup(p) => p.spec.timeout_seconds,
        };
        timeout.unwrap_or(10)
    }

    pub fn object_selector(&self) -> Option<&LabelSelector> {
        match self {
            Policy::Admission(p) => p.spec.object_selector.as_ref(),
            Policy::ClusterAdmission(p) => p.spec.object_selector.as_ref(),
            Policy::Group(p) => p.spec.object_selector.as_ref(),
            Policy::ClusterGroup(p) => p.spec.object_selector.as_ref(),
        }
    }

    /// The selector the user put on a cluster-scoped policy. Namespaced
    /// policies never expose one; theirs is forced to their own namespace.
    pub fn user_namespace_selector(&self) -> Option<&LabelSelector> {
        match self {
            Policy::ClusterAdmission(p) => p.spec.namespace_selector.as_ref(),
            Policy::ClusterGroup(p) => p.spec.namespace_selector.as_ref(),
            Policy::Admission(_) | Policy::Group(_) => None,
        }
    }

    pub fn status(&self) -> Option<&PolicyStatus> {
        match self {
            Policy::Admission(p) => p.status.as_ref(),
            Policy::ClusterAdmission(p) => p.status.as_ref(),
            Policy::Group(p) => p.status.as_ref(),
            Policy::ClusterGroup(p) => p.status.as_ref(),
        }
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    /// Path the API server calls on the policy-server service.
    pub fn server_path(&self) -> String {
        if self.is_mutating() {
            format!("/mutate/{}", self.unique_name())
        } else {
            format!("/validate/{}", self.unique_name())
        }
    }
}

/* ============================= TESTS ============================= */

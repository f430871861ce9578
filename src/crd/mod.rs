pub mod admission_policy;
pub mod admission_policy_group;
pub mod cluster_admission_policy;
pub mod cluster_admission_policy_group;
pub mod common;
pub mod policy_server;

pub use admission_policy::{AdmissionPolicy, AdmissionPolicySpec};
pub use admission_policy_group::{AdmissionPolicyGroup, AdmissionPolicyGroupSpec};
pub use cluster_admission_policy::{ClusterAdmissionPolicy, ClusterAdmissionPolicySpec};
pub use cluster_admission_policy_group::{
    ClusterAdmissionPolicyGroup, ClusterAdmissionPolicyGroupSpec,
};
pub use common::{
    ClusterPolicyGroupMember, ContextAwareResource, FailurePolicy, MatchPolicy, PolicyGroupMember,
    PolicyMode, PolicyStatus, PolicyStatusPhase, SideEffects,
};
pub use policy_server::{PolicyServer, PolicyServerSecurityContexts, PolicyServerSpec, PolicyServerStatus};

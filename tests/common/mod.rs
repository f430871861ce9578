#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kubewarden_controller::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, AdmissionPolicyGroupSpec, AdmissionPolicySpec,
    ClusterAdmissionPolicy, ClusterAdmissionPolicySpec, PolicyGroupMember, PolicyServer,
    PolicyServerSpec,
};

pub fn pod_rule() -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec!["".to_string()]),
        api_versions: Some(vec!["v1".to_string()]),
        resources: Some(vec!["pods".to_string()]),
        operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
        scope: None,
    }
}

pub fn make_admission_policy(name: &str, namespace: &str, server: &str) -> AdmissionPolicy {
    AdmissionPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: AdmissionPolicySpec {
            module: "registry://ghcr.io/kubewarden/policies/safe-labels:v1.0.0".to_string(),
            rules: Some(vec![pod_rule()]),
            policy_server: server.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

pub fn make_cluster_admission_policy(name: &str, server: &str) -> ClusterAdmissionPolicy {
    ClusterAdmissionPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: ClusterAdmissionPolicySpec {
            module: "registry://ghcr.io/kubewarden/policies/safe-labels:v1.0.0".to_string(),
            rules: Some(vec![pod_rule()]),
            policy_server: server.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

pub fn make_policy_group(name: &str, namespace: &str, members: &[&str]) -> AdmissionPolicyGroup {
    let policies: BTreeMap<String, PolicyGroupMember> = members
        .iter()
        .map(|member| {
            (
                member.to_string(),
                PolicyGroupMember {
                    module: "registry://ghcr.io/kubewarden/policies/trusted-repos:v0.2.0"
                        .to_string(),
                    ..Default::default()
                },
            )
        })
        .collect();
    let expression = members
        .iter()
        .map(|member| format!("{member}()"))
        .collect::<Vec<_>>()
        .join(" && ");

    AdmissionPolicyGroup {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: AdmissionPolicyGroupSpec {
            policies,
            expression,
            message: "rejected by the policy group".to_string(),
            rules: Some(vec![pod_rule()]),
            ..Default::default()
        },
        status: None,
    }
}

pub fn make_policy_server(name: &str) -> PolicyServer {
    PolicyServer {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        },
        spec: PolicyServerSpec {
            image: "ghcr.io/kubewarden/policy-server:v1.21.0".to_string(),
            ..Default::default()
        },
        status: None,
    }
}

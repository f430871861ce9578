use std::collections::{BTreeSet, HashSet};

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::Api;
use kube::Client;

use crate::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    PolicyMode, PolicyServer,
};
use crate::expression::{
    is_reserved_word, is_valid_member_name, validate_group_expression,
    validate_match_condition_expression,
};

const MAX_MATCH_CONDITIONS: usize = 64;
const MAX_POLICY_SERVER_NAME_LENGTH: usize = 63;

/* ============================= FIELD ERRORS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    Forbidden,
    Required,
    Duplicate,
    TooMany,
    NotFound,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Invalid => "Invalid",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::Required => "Required",
            ErrorKind::Duplicate => "Duplicate",
            ErrorKind::TooMany => "Too many",
            ErrorKind::NotFound => "Not found",
        }
    }
}

/// One violated field, rendered as `path: Kind: detail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub kind: ErrorKind,
    pub detail: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, kind: ErrorKind, detail: impl Into<String>) -> Self {
        FieldError {
            path: path.into(),
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.path, self.kind.as_str(), self.detail)
    }
}

/* ============================= SHARED POLICY CHECKS ============================= */

fn validate_rules(rules: &[RuleWithOperations], errors: &mut Vec<FieldError>) {
    if rules.is_empty() {
        errors.push(FieldError::new(
            "spec.rules",
            ErrorKind::Required,
            "a policy must specify at least one rule",
        ));
        return;
    }

    for (i, rule) in rules.iter().enumerate() {
        let path = format!("spec.rules[{i}]");
        check_string_list(
            rule.operations.as_deref(),
            &format!("{path}.operations"),
            errors,
        );
        check_string_list(
            rule.api_versions.as_deref(),
            &format!("{path}.apiVersions"),
            errors,
        );
        check_string_list(
            rule.resources.as_deref(),
            &format!("{path}.resources"),
            errors,
        );
    }
}

fn check_string_list(list: Option<&[String]>, path: &str, errors: &mut Vec<FieldError>) {
    match list {
        None | Some([]) => errors.push(FieldError::new(
            path,
            ErrorKind::Required,
            "must not be empty",
        )),
        Some(values) => {
            if values.iter().any(String::is_empty) {
                errors.push(FieldError::new(
                    path,
                    ErrorKind::Invalid,
                    "must not contain empty strings",
                ));
            }
        }
    }
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

fn validate_match_conditions(conditions: &[MatchCondition], errors: &mut Vec<FieldError>) {
    if conditions.len() > MAX_MATCH_CONDITIONS {
        errors.push(FieldError::new(
            "spec.matchConditions",
            ErrorKind::TooMany,
            format!("must have at most {MAX_MATCH_CONDITIONS} items"),
        ));
    }

    let mut seen = HashSet::new();
    for (i, condition) in conditions.iter().enumerate() {
        let path = format!("spec.matchConditions[{i}]");

        if !is_dns_label(&condition.name) {
            errors.push(FieldError::new(
                format!("{path}.name"),
                ErrorKind::Invalid,
                "must be a valid DNS label",
            ));
        }
        if !seen.insert(condition.name.clone()) {
            errors.push(FieldError::new(
                format!("{path}.name"),
                ErrorKind::Duplicate,
                format!("duplicated name {:?}", condition.name),
            ));
        }

        if condition.expression.trim().is_empty() {
            errors.push(FieldError::new(
                format!("{path}.expression"),
                ErrorKind::Required,
                "must not be empty",
            ));
        } else if let Err(e) = validate_match_condition_expression(&condition.expression) {
            errors.push(FieldError::new(
                format!("{path}.expression"),
                ErrorKind::Invalid,
                e,
            ));
        }
    }
}

fn validate_module(module: &str, errors: &mut Vec<FieldError>) {
    if module.trim().is_empty() {
        errors.push(FieldError::new(
            "spec.module",
            ErrorKind::Required,
            "must not be empty",
        ));
    }
}

fn validate_policy_server_immutable(old: &str, new: &str, errors: &mut Vec<FieldError>) {
    if old != new {
        errors.push(FieldError::new(
            "spec.policyServer",
            ErrorKind::Forbidden,
            "the field is immutable",
        ));
    }
}

fn validate_mode_transition(
    old: Option<PolicyMode>,
    new: Option<PolicyMode>,
    errors: &mut Vec<FieldError>,
) {
    let old = old.unwrap_or_default();
    let new = new.unwrap_or_default();
    if old == PolicyMode::Protect && new == PolicyMode::Monitor {
        errors.push(FieldError::new(
            "spec.mode",
            ErrorKind::Forbidden,
            "field cannot transition from protect to monitor. Recreate instead.",
        ));
    }
}

/* ============================= POLICY GROUP CHECKS ============================= */

fn validate_group_members<'a>(
    member_names: impl Iterator<Item = &'a String>,
    errors: &mut Vec<FieldError>,
) -> BTreeSet<String> {
    let names: BTreeSet<String> = member_names.cloned().collect();

    if names.is_empty() {
        errors.push(FieldError::new(
            "spec.policies",
            ErrorKind::Required,
            "policy groups must have at least one policy member",
        ));
    }

    for name in &names {
        if !is_valid_member_name(name) || is_reserved_word(name) {
            errors.push(FieldError::new(
                format!("spec.policies[{name}]"),
                ErrorKind::Invalid,
                "policy group member name is invalid",
            ));
        }
    }

    names
}

fn validate_group_message_and_expression(
    message: &str,
    expression: &str,
    members: &BTreeSet<String>,
    errors: &mut Vec<FieldError>,
) {
    if message.trim().is_empty() {
        errors.push(FieldError::new(
            "spec.message",
            ErrorKind::Required,
            "must not be empty",
        ));
    }

    if expression.trim().is_empty() {
        errors.push(FieldError::new(
            "spec.expression",
            ErrorKind::Required,
            "must not be empty",
        ));
    } else if let Err(e) = validate_group_expression(expression, members) {
        errors.push(FieldError::new("spec.expression", ErrorKind::Invalid, e));
    }
}

/* ============================= PER-KIND VALIDATORS ============================= */

pub fn validate_admission_policy(policy: &AdmissionPolicy) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_module(&policy.spec.module, &mut errors);
    validate_rules(policy.spec.rules.as_deref().unwrap_or_default(), &mut errors);
    validate_match_conditions(
        policy.spec.match_conditions.as_deref().unwrap_or_default(),
        &mut errors,
    );
    errors
}

pub fn validate_admission_policy_update(
    old: &AdmissionPolicy,
    new: &AdmissionPolicy,
) -> Vec<FieldError> {
    let mut errors = validate_admission_policy(new);
    validate_policy_server_immutable(&old.spec.policy_server, &new.spec.policy_server, &mut errors);
    validate_mode_transition(old.spec.mode, new.spec.mode, &mut errors);
    errors
}

pub fn validate_cluster_admission_policy(policy: &ClusterAdmissionPolicy) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_module(&policy.spec.module, &mut errors);
    validate_rules(policy.spec.rules.as_deref().unwrap_or_default(), &mut errors);
    validate_match_conditions(
        policy.spec.match_conditions.as_deref().unwrap_or_default(),
        &mut errors,
    );
    errors
}

pub fn validate_cluster_admission_policy_update(
    old: &ClusterAdmissionPolicy,
    new: &ClusterAdmissionPolicy,
) -> Vec<FieldError> {
    let mut errors = validate_cluster_admission_policy(new);
    validate_policy_server_immutable(&old.spec.policy_server, &new.spec.policy_server, &mut errors);
    validate_mode_transition(old.spec.mode, new.spec.mode, &mut errors);
    errors
}

pub fn validate_admission_policy_group(group: &AdmissionPolicyGroup) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_rules(group.spec.rules.as_deref().unwrap_or_default(), &mut errors);
    validate_match_conditions(
        group.spec.match_conditions.as_deref().unwrap_or_default(),
        &mut errors,
    );
    let members = validate_group_members(group.spec.policies.keys(), &mut errors);
    validate_group_message_and_expression(
        &group.spec.message,
        &group.spec.expression,
        &members,
        &mut errors,
    );
    errors
}

pub fn validate_admission_policy_group_update(
    old: &AdmissionPolicyGroup,
    new: &AdmissionPolicyGroup,
) -> Vec<FieldError> {
    let mut errors = validate_admission_policy_group(new);
    validate_policy_server_immutable(&old.spec.policy_server, &new.spec.policy_server, &mut errors);
    validate_mode_transition(old.spec.mode, new.spec.mode, &mut errors);
    errors
}

pub fn validate_cluster_admission_policy_group(
    group: &ClusterAdmissionPolicyGroup,
) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_rules(group.spec.rules.as_deref().unwrap_or_default(), &mut errors);
    validate_match_conditions(
        group.spec.match_conditions.as_deref().unwrap_or_default(),
        &mut errors,
    );
    let members = validate_group_members(group.spec.policies.keys(), &mut errors);
    validate_group_message_and_expression(
        &group.spec.message,
        &group.spec.expression,
        &members,
        &mut errors,
    );
    errors
}

pub fn validate_cluster_admission_policy_group_update(
    old: &ClusterAdmissionPolicyGroup,
    new: &ClusterAdmissionPolicyGroup,
) -> Vec<FieldError> {
    let mut errors = validate_cluster_admission_policy_group(new);
    validate_policy_server_immutable(&old.spec.policy_server, &new.spec.policy_server, &mut errors);
    validate_mode_transition(old.spec.mode, new.spec.mode, &mut errors);
    errors
}

/* ============================= POLICY SERVER ============================= */

pub fn validate_policy_server(policy_server: &PolicyServer) -> Vec<FieldError> {
    let mut errors = Vec::new();

    let name = policy_server.metadata.name.as_deref().unwrap_or_default();
    if name.len() > MAX_POLICY_SERVER_NAME_LENGTH {
        errors.push(FieldError::new(
            "metadata.name",
            ErrorKind::Invalid,
            format!("must be no more than {MAX_POLICY_SERVER_NAME_LENGTH} characters"),
        ));
    }

    if policy_server.spec.image.trim().is_empty() {
        errors.push(FieldError::new(
            "spec.image",
            ErrorKind::Required,
            "must not be empty",
        ));
    }

    if policy_server.spec.min_available.is_some() && policy_server.spec.max_unavailable.is_some() {
        errors.push(FieldError::new(
            "spec.minAvailable",
            ErrorKind::Forbidden,
            "minAvailable and maxUnavailable cannot be both set",
        ));
    }

    if let Some(resources) = &policy_server.spec.resources {
        validate_resource_requirements(
            resources.requests.as_ref(),
            resources.limits.as_ref(),
            &mut errors,
        );
    }

    errors
}

fn validate_resource_requirements(
    requests: Option<&std::collections::BTreeMap<String, Quantity>>,
    limits: Option<&std::collections::BTreeMap<String, Quantity>>,
    errors: &mut Vec<FieldError>,
) {
    for (section, map) in [("requests", requests), ("limits", limits)] {
        let Some(map) = map else { continue };
        for (resource, quantity) in map {
            match parse_quantity(&quantity.0) {
                Some(value) if value < 0.0 => errors.push(FieldError::new(
                    format!("spec.resources.{section}.{resource}"),
                    ErrorKind::Invalid,
                    "must not be negative",
                )),
                None => errors.push(FieldError::new(
                    format!("spec.resources.{section}.{resource}"),
                    ErrorKind::Invalid,
                    format!("{:?} is not a valid quantity", quantity.0),
                )),
                _ => {}
            }
        }
    }

    if let (Some(requests), Some(limits)) = (requests, limits) {
        for (resource, request) in requests {
            let Some(limit) = limits.get(resource) else {
                continue;
            };
            if let (Some(request), Some(limit)) =
                (parse_quantity(&request.0), parse_quantity(&limit.0))
            {
                if request > limit {
                    errors.push(FieldError::new(
                        format!("spec.resources.requests.{resource}"),
                        ErrorKind::Invalid,
                        format!("{resource} request must be less than or equal to the limit"),
                    ));
                }
            }
        }
    }
}

/// Minimal Kubernetes quantity parser covering the decimal and binary
/// suffixes the resource fields actually use.
fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1048576.0),
        ("Gi", 1073741824.0),
        ("Ti", 1099511627776.0),
        ("Pi", 1125899906842624.0),
        ("Ei", 1152921504606846976.0),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    for (suffix, factor) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    quantity.parse::<f64>().ok()
}

/// The image pull secret must exist in the deployments namespace and be a
/// docker-config secret; anything else would break module pulls at runtime.
pub async fn validate_image_pull_secret(
    client: &Client,
    deployments_namespace: &str,
    secret_name: &str,
) -> Option<FieldError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), deployments_namespace);
    match secrets.get_opt(secret_name).await {
        Ok(Some(secret)) => {
            if secret.type_.as_deref() != Some("kubernetes.io/dockerconfigjson") {
                Some(FieldError::new(
                    "spec.imagePullSecret",
                    ErrorKind::Invalid,
                    format!("secret {secret_name:?} is not of type kubernetes.io/dockerconfigjson"),
                ))
            } else {
                None
            }
        }
        Ok(None) => Some(FieldError::new(
            "spec.imagePullSecret",
            ErrorKind::NotFound,
            format!("secret {secret_name:?} not found in namespace {deployments_namespace:?}"),
        )),
        Err(e) => Some(FieldError::new(
            "spec.imagePullSecret",
            ErrorKind::Invalid,
            format!("cannot verify secret {secret_name:?}: {e}"),
        )),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AdmissionPolicyGroupSpec, AdmissionPolicySpec, ClusterAdmissionPolicyGroupSpec,
        PolicyGroupMember, PolicyServerSpec, ClusterPolicyGroupMember,
    };
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use std::collections::BTreeMap;

    fn rule(operations: &[&str], api_versions: &[&str], resources: &[&str]) -> RuleWithOperations {
        RuleWithOperations {
            api_groups: Some(vec!["".to_string()]),
            api_versions: Some(api_versions.iter().map(|s| s.to_string()).collect()),
            operations: Some(operations.iter().map(|s| s.to_string()).collect()),
            resources: Some(resources.iter().map(|s| s.to_string()).collect()),
            scope: None,
        }
    }

    fn valid_policy(name: &str) -> AdmissionPolicy {
        AdmissionPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: AdmissionPolicySpec {
                module: "registry://ghcr.io/kubewarden/policies/safe-labels:v1.0.0".to_string(),
                rules: Some(vec![rule(&["CREATE", "UPDATE"], &["v1"], &["pods"])]),
                ..Default::default()
            },
            status: None,
        }
    }

    fn group(members: &[&str], expression: &str) -> AdmissionPolicyGroup {
        let policies: BTreeMap<String, PolicyGroupMember> = members
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    PolicyGroupMember {
                        module: "registry://example/policy:v1".to_string(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        AdmissionPolicyGroup {
            metadata: ObjectMeta {
                name: Some("group".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: AdmissionPolicyGroupSpec {
                policies,
                expression: expression.to_string(),
                message: "rejected by the group".to_string(),
                rules: Some(vec![rule(&["CREATE"], &["v1"], &["pods"])]),
                ..Default::default()
            },
            status: None,
        }
    }

    fn policy_server(name: &str) -> PolicyServer {
        PolicyServer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: PolicyServerSpec {
                image: "ghcr.io/kubewarden/policy-server:v1.21.0".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    // ── rules ──

    #[test]
    fn test_valid_policy_passes() {
        assert!(validate_admission_policy(&valid_policy("ok")).is_empty());
    }

    #[test]
    fn test_empty_rules_rejected() {
        let mut policy = valid_policy("no-rules");
        policy.spec.rules = None;
        let errors = validate_admission_policy(&policy);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "spec.rules");
        assert_eq!(errors[0].kind, ErrorKind::Required);
    }

    #[test]
    fn test_rule_with_empty_operations_rejected() {
        let mut policy = valid_policy("bad-rule");
        policy.spec.rules = Some(vec![rule(&[], &["v1"], &["pods"])]);
        let errors = validate_admission_policy(&policy);
        assert!(errors.iter().any(|e| e.path == "spec.rules[0].operations"));
    }

    #[test]
    fn test_rule_with_empty_string_rejected() {
        let mut policy = valid_policy("bad-rule");
        policy.spec.rules = Some(vec![rule(&["CREATE", ""], &["v1"], &["pods"])]);
        let errors = validate_admission_policy(&policy);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.rules[0].operations" && e.kind == ErrorKind::Invalid));
    }

    #[test]
    fn test_multiple_errors_reported_together() {
        let mut policy = valid_policy("broken");
        policy.spec.module = String::new();
        policy.spec.rules = None;
        let errors = validate_admission_policy(&policy);
        assert_eq!(errors.len(), 2);
    }

    // ── match conditions ──

    fn condition(name: &str, expression: &str) -> MatchCondition {
        MatchCondition {
            name: name.to_string(),
            expression: expression.to_string(),
        }
    }

    #[test]
    fn test_valid_match_conditions() {
        let mut policy = valid_policy("with-conditions");
        policy.spec.match_conditions = Some(vec![
            condition("exclude-leases", "request.resource.resource != 'leases'"),
            condition("exclude-kubelet", "!('system:nodes' in request.userInfo.groups)"),
        ]);
        assert!(validate_admission_policy(&policy).is_empty());
    }

    #[test]
    fn test_too_many_match_conditions() {
        let mut policy = valid_policy("too-many");
        policy.spec.match_conditions = Some(
            (0..65)
                .map(|i| condition(&format!("cond-{i}"), "true"))
                .collect(),
        );
        let errors = validate_admission_policy(&policy);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.matchConditions" && e.kind == ErrorKind::TooMany));
    }

    #[test]
    fn test_duplicate_match_condition_names() {
        let mut policy = valid_policy("dupes");
        policy.spec.match_conditions =
            Some(vec![condition("same", "true"), condition("same", "false")]);
        let errors = validate_admission_policy(&policy);
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Duplicate));
    }

    #[test]
    fn test_match_condition_name_must_be_dns_label() {
        let mut policy = valid_policy("bad-name");
        policy.spec.match_conditions = Some(vec![condition("Not_A_Label", "true")]);
        let errors = validate_admission_policy(&policy);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.matchConditions[0].name"));
    }

    #[test]
    fn test_match_condition_expression_must_compile() {
        let mut policy = valid_policy("bad-expr");
        policy.spec.match_conditions = Some(vec![condition("broken", "object.name ==")]);
        let errors = validate_admission_policy(&policy);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.matchConditions[0].expression"));
    }

    // ── immutability and mode ──

    #[test]
    fn test_policy_server_is_immutable() {
        let old = valid_policy("pinned");
        let mut new = old.clone();
        new.spec.policy_server = "another".to_string();
        let errors = validate_admission_policy_update(&old, &new);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "spec.policyServer");
        assert_eq!(errors[0].kind, ErrorKind::Forbidden);
    }

    #[test]
    fn test_mode_protect_to_monitor_rejected() {
        let mut old = valid_policy("mode");
        old.spec.mode = Some(PolicyMode::Protect);
        let mut new = old.clone();
        new.spec.mode = Some(PolicyMode::Monitor);
        let errors = validate_admission_policy_update(&old, &new);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "spec.mode: Forbidden: field cannot transition from protect to monitor. Recreate instead."
        );
    }

    #[test]
    fn test_mode_monitor_to_protect_accepted() {
        let mut old = valid_policy("mode");
        old.spec.mode = Some(PolicyMode::Monitor);
        let mut new = old.clone();
        new.spec.mode = Some(PolicyMode::Protect);
        assert!(validate_admission_policy_update(&old, &new).is_empty());
    }

    #[test]
    fn test_unset_mode_counts_as_protect() {
        let old = valid_policy("mode");
        let mut new = old.clone();
        new.spec.mode = Some(PolicyMode::Monitor);
        let errors = validate_admission_policy_update(&old, &new);
        assert!(errors.iter().any(|e| e.path == "spec.mode"));
    }

    // ── groups ──

    #[test]
    fn test_valid_group_passes() {
        let group = group(&["signed", "trusted"], "signed() && trusted()");
        assert!(validate_admission_policy_group(&group).is_empty());
    }

    #[test]
    fn test_group_needs_members() {
        let group = group(&[], "true");
        let errors = validate_admission_policy_group(&group);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.policies" && e.kind == ErrorKind::Required));
    }

    #[test]
    fn test_group_member_name_reserved_word() {
        let group = group(&["in"], "in()");
        let errors = validate_admission_policy_group(&group);
        assert!(errors
            .iter()
            .any(|e| e.detail == "policy group member name is invalid"));
    }

    #[test]
    fn test_group_member_name_bad_shape() {
        let group = group(&["has-dash"], "true");
        let errors = validate_admission_policy_group(&group);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.policies[has-dash]" && e.kind == ErrorKind::Invalid));
    }

    #[test]
    fn test_group_expression_must_reference_members() {
        let group = group(&["signed"], "unknown()");
        let errors = validate_admission_policy_group(&group);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.expression" && e.detail.contains("unknown")));
    }

    #[test]
    fn test_group_message_required() {
        let mut group = group(&["signed"], "signed()");
        group.spec.message = String::new();
        let errors = validate_admission_policy_group(&group);
        assert!(errors.iter().any(|e| e.path == "spec.message"));
    }

    #[test]
    fn test_cluster_group_validated_like_namespaced() {
        let mut policies = BTreeMap::new();
        policies.insert(
            "while".to_string(),
            ClusterPolicyGroupMember {
                module: "registry://example/policy:v1".to_string(),
                ..Default::default()
            },
        );
        let group = ClusterAdmissionPolicyGroup {
            metadata: ObjectMeta {
                name: Some("cluster-group".to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicyGroupSpec {
                policies,
                expression: "while()".to_string(),
                message: "no".to_string(),
                rules: Some(vec![rule(&["CREATE"], &["v1"], &["pods"])]),
                ..Default::default()
            },
            status: None,
        };
        let errors = validate_cluster_admission_policy_group(&group);
        assert!(errors
            .iter()
            .any(|e| e.detail == "policy group member name is invalid"));
    }

    // ── policy server ──

    #[test]
    fn test_valid_policy_server_passes() {
        assert!(validate_policy_server(&policy_server("default")).is_empty());
    }

    #[test]
    fn test_policy_server_name_too_long() {
        let errors = validate_policy_server(&policy_server(&"x".repeat(64)));
        assert!(errors.iter().any(|e| e.path == "metadata.name"));
    }

    #[test]
    fn test_min_available_and_max_unavailable_exclusive() {
        let mut server = policy_server("both");
        server.spec.min_available = Some(IntOrString::Int(2));
        server.spec.max_unavailable = Some(IntOrString::Int(2));
        let errors = validate_policy_server(&server);
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .detail
            .contains("minAvailable and maxUnavailable cannot be both set"));
    }

    #[test]
    fn test_negative_resource_request_rejected() {
        let mut server = policy_server("negative");
        server.spec.resources = Some(ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("-100m".to_string()),
            )])),
            ..Default::default()
        });
        let errors = validate_policy_server(&server);
        assert!(errors
            .iter()
            .any(|e| e.path == "spec.resources.requests.cpu"));
    }

    #[test]
    fn test_request_greater_than_limit_rejected() {
        let mut server = policy_server("inverted");
        server.spec.resources = Some(ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("2Gi".to_string()),
            )])),
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("1Gi".to_string()),
            )])),
            ..Default::default()
        });
        let errors = validate_policy_server(&server);
        assert!(errors.iter().any(|e| e
            .detail
            .contains("request must be less than or equal to the limit")));
    }

    #[test]
    fn test_request_within_limit_accepted() {
        let mut server = policy_server("fine");
        server.spec.resources = Some(ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("250m".to_string()),
            )])),
            limits: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("1".to_string()),
            )])),
            ..Default::default()
        });
        assert!(validate_policy_server(&server).is_empty());
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(parse_quantity("100m"), Some(0.1));
        assert_eq!(parse_quantity("1"), Some(1.0));
        assert_eq!(parse_quantity("1Gi"), Some(1073741824.0));
        assert_eq!(parse_quantity("2k"), Some(2000.0));
        assert!(parse_quantity("abc").is_none());
        assert!(parse_quantity("").is_none());
    }
}

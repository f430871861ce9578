mod common;

use common::{make_admission_policy, make_cluster_admission_policy, make_policy_group, make_policy_server};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubewarden_controller::crd::PolicyMode;
use kubewarden_controller::webhooks::validator::{
    validate_admission_policy, validate_admission_policy_group, validate_admission_policy_update,
    validate_cluster_admission_policy_update, validate_policy_server, ErrorKind,
};

/* ============================= MODE TRANSITIONS ============================= */

#[test]
fn test_mode_protect_to_monitor_is_rejected() {
    let mut old = make_cluster_admission_policy("psp", "default");
    old.spec.mode = Some(PolicyMode::Protect);
    let mut new = old.clone();
    new.spec.mode = Some(PolicyMode::Monitor);

    let errors = validate_cluster_admission_policy_update(&old, &new);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "spec.mode");
    assert_eq!(errors[0].kind, ErrorKind::Forbidden);
    assert!(errors[0]
        .to_string()
        .starts_with("spec.mode: Forbidden: field cannot transition from protect to monitor"));
}

#[test]
fn test_mode_monitor_to_protect_is_accepted() {
    let mut old = make_cluster_admission_policy("psp", "default");
    old.spec.mode = Some(PolicyMode::Monitor);
    let mut new = old.clone();
    new.spec.mode = Some(PolicyMode::Protect);

    assert!(validate_cluster_admission_policy_update(&old, &new).is_empty());
}

/* ============================= IMMUTABILITY ============================= */

#[test]
fn test_policy_server_binding_is_immutable() {
    let old = make_admission_policy("pinned", "team-a", "default");
    let mut new = old.clone();
    new.spec.policy_server = "other-server".to_string();

    let errors = validate_admission_policy_update(&old, &new);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "spec.policyServer");
    assert_eq!(errors[0].kind, ErrorKind::Forbidden);
}

#[test]
fn test_unchanged_policy_server_is_accepted() {
    let old = make_admission_policy("pinned", "team-a", "default");
    let new = old.clone();
    assert!(validate_admission_policy_update(&old, &new).is_empty());
}

/* ============================= POLICY SERVER ============================= */

#[test]
fn test_min_available_and_max_unavailable_are_exclusive() {
    let mut server = make_policy_server("guarded");
    server.spec.min_available = Some(IntOrString::Int(2));
    server.spec.max_unavailable = Some(IntOrString::Int(2));

    let errors = validate_policy_server(&server);
    assert_eq!(errors.len(), 1);
    assert!(errors[0]
        .detail
        .contains("minAvailable and maxUnavailable cannot be both set"));
}

#[test]
fn test_single_disruption_field_is_accepted() {
    let mut server = make_policy_server("guarded");
    server.spec.min_available = Some(IntOrString::Int(2));
    assert!(validate_policy_server(&server).is_empty());

    let mut server = make_policy_server("guarded");
    server.spec.max_unavailable = Some(IntOrString::String("25%".to_string()));
    assert!(validate_policy_server(&server).is_empty());
}

/* ============================= POLICY GROUPS ============================= */

#[test]
fn test_group_member_named_in_is_rejected() {
    let group = make_policy_group("bad-member", "default", &["in"]);
    let errors = validate_admission_policy_group(&group);
    assert!(errors
        .iter()
        .any(|e| e.detail == "policy group member name is invalid"));
}

#[test]
fn test_group_with_valid_members_is_accepted() {
    let group = make_policy_group("good", "default", &["signed", "trusted_repo"]);
    assert!(validate_admission_policy_group(&group).is_empty());
}

#[test]
fn test_group_expression_must_only_use_boolean_operators() {
    let mut group = make_policy_group("arith", "default", &["signed"]);
    group.spec.expression = "signed() && 1 + 1".to_string();
    let errors = validate_admission_policy_group(&group);
    assert!(errors.iter().any(|e| e.path == "spec.expression"));
}

/* ============================= MULTI-ERROR REPORTING ============================= */

#[test]
fn test_every_violated_field_is_reported() {
    let mut policy = make_admission_policy("broken", "team-a", "default");
    policy.spec.module = String::new();
    policy.spec.rules = None;

    let errors = validate_admission_policy(&policy);
    let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"spec.module"));
    assert!(paths.contains(&"spec.rules"));
}

use serde_json::{json, Value};

use crate::FINALIZER;

/// Build the JSON patch defaulting a policy object: bind it to the default
/// policy server when the user left the field empty, and add the controller
/// finalizer.
///
/// Works on the raw admission object because serde defaulting would hide
/// whether the user actually set `spec.policyServer`.
pub fn default_policy_patch(raw_object: &Value, default_policy_server: &str) -> Vec<Value> {
    let mut operations = Vec::new();

    let policy_server = raw_object
        .get("spec")
        .and_then(|spec| spec.get("policyServer"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if policy_server.is_empty() {
        operations.push(json!({
            "op": "add",
            "path": "/spec/policyServer",
            "value": default_policy_server,
        }));
    }

    operations.extend(finalizer_patch(raw_object));
    operations
}

/// Build the JSON patch adding the controller finalizer, used for every kind
/// the controller defaults.
pub fn finalizer_patch(raw_object: &Value) -> Vec<Value> {
    let finalizers = raw_object
        .get("metadata")
        .and_then(|metadata| metadata.get("finalizers"))
        .and_then(Value::as_array);

    match finalizers {
        None => vec![json!({
            "op": "add",
            "path": "/metadata/finalizers",
            "value": [FINALIZER],
        })],
        Some(existing) if !existing.iter().any(|f| f == FINALIZER) => vec![json!({
            "op": "add",
            "path": "/metadata/finalizers/-",
            "value": FINALIZER,
        })],
        Some(_) => Vec::new(),
    }
}

/* ============================= TESTS ============================= */

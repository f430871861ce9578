use std::net::SocketAddr;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use crate::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    PolicyServer,
};
use crate::webhooks::defaulter::{default_policy_patch, finalizer_patch};
use crate::webhooks::validator::{
    validate_admission_policy, validate_admission_policy_group,
    validate_admission_policy_group_update, validate_admission_policy_update,
    validate_cluster_admission_policy, validate_cluster_admission_policy_group,
    validate_cluster_admission_policy_group_update, validate_cluster_admission_policy_update,
    validate_image_pull_secret, validate_policy_server, FieldError,
};

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct WebhookState {
    /// Absent in router tests; the pull-secret lookup is skipped without it.
    pub client: Option<Client>,
    pub deployments_namespace: String,
    pub default_policy_server: String,
}

/* ============================= ROUTER ============================= */

pub fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route(
            "/mutate-policies-kubewarden-io-v1-admissionpolicy",
            post(mutate_policy_handler),
        )
        .route(
            "/mutate-policies-kubewarden-io-v1-clusteradmissionpolicy",
            post(mutate_policy_handler),
        )
        .route(
            "/mutate-policies-kubewarden-io-v1-admissionpolicygroup",
            post(mutate_policy_handler),
        )
        .route(
            "/mutate-policies-kubewarden-io-v1-clusteradmissionpolicygroup",
            post(mutate_policy_handler),
        )
        .route(
            "/mutate-policies-kubewarden-io-v1-policyserver",
            post(mutate_policy_server_handler),
        )
        .route(
            "/validate-policies-kubewarden-io-v1-admissionpolicy",
            post(validate_admission_policy_handler),
        )
        .route(
            "/validate-policies-kubewarden-io-v1-clusteradmissionpolicy",
            post(validate_cluster_admission_policy_handler),
        )
        .route(
            "/validate-policies-kubewarden-io-v1-admissionpolicygroup",
            post(validate_admission_policy_group_handler),
        )
        .route(
            "/validate-policies-kubewarden-io-v1-clusteradmissionpolicygroup",
            post(validate_cluster_admission_policy_group_handler),
        )
        .route(
            "/validate-policies-kubewarden-io-v1-policyserver",
            post(validate_policy_server_handler),
        )
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(|| async { (StatusCode::OK, "OK") }))
        .with_state(state)
}

/* ============================= HTTPS SERVER ============================= */

pub async fn serve(
    state: WebhookState,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_webhook_router(state);

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load webhook TLS configuration")?;

    info!(addr = %addr, "webhook_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

/* ============================= REVIEW PLUMBING ============================= */

struct ReviewParts {
    uid: String,
    operation: String,
    object: Value,
    old_object: Value,
}

fn parse_review(body: &str) -> Result<ReviewParts, String> {
    let review: Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let request = review
        .get("request")
        .ok_or_else(|| "admission review carries no request".to_string())?;
    Ok(ReviewParts {
        uid: request["uid"].as_str().unwrap_or_default().to_string(),
        operation: request["operation"]
            .as_str()
            .unwrap_or("UNKNOWN")
            .to_string(),
        object: request["object"].clone(),
        old_object: request["oldObject"].clone(),
    })
}

fn review_response(body: Value) -> String {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": body,
    })
    .to_string()
}

fn allowed_response(uid: &str) -> String {
    review_response(json!({"uid": uid, "allowed": true}))
}

fn patch_response(uid: &str, operations: &[Value]) -> String {
    if operations.is_empty() {
        return allowed_response(uid);
    }
    let patch = base64::engine::general_purpose::STANDARD
        .encode(serde_json::to_vec(operations).expect("patch operations serialize"));
    review_response(json!({
        "uid": uid,
        "allowed": true,
        "patchType": "JSONPatch",
        "patch": patch,
    }))
}

/// Structured `Invalid` rejection listing every violated field path. These
/// are terminal for the request; the API server never retries them.
fn invalid_response(uid: &str, kind: &str, name: &str, errors: &[FieldError]) -> String {
    let details: Vec<String> = errors.iter().map(FieldError::to_string).collect();
    review_response(json!({
        "uid": uid,
        "allowed": false,
        "status": {
            "code": 422,
            "reason": "Invalid",
            "message": format!(
                "{kind}.policies.kubewarden.io {name:?} is invalid: {}",
                details.join(", ")
            ),
        },
    }))
}

fn malformed_review(error: &str) -> (StatusCode, String) {
    info!(error = %error, "malformed_admission_review");
    (
        StatusCode::BAD_REQUEST,
        review_response(json!({"uid": "", "allowed": false})),
    )
}

fn object_name(object: &Value) -> String {
    object["metadata"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/* ============================= DEFAULTERS ============================= */

/// Shared by all four policy kinds: default the policy-server binding and
/// add the finalizer.
async fn mutate_policy_handler(
    State(state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    let parts = match parse_review(&body) {
        Ok(parts) => parts,
        Err(e) => return malformed_review(&e),
    };
    let patch = default_policy_patch(&parts.object, &state.default_policy_server);
    (StatusCode::OK, patch_response(&parts.uid, &patch))
}

async fn mutate_policy_server_handler(
    State(_state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    let parts = match parse_review(&body) {
        Ok(parts) => parts,
        Err(e) => return malformed_review(&e),
    };
    let patch = finalizer_patch(&parts.object);
    (StatusCode::OK, patch_response(&parts.uid, &patch))
}

/* ============================= VALIDATORS ============================= */

fn run_validation<K, C, U>(
    parts: &ReviewParts,
    kind: &str,
    validate_create: C,
    validate_update: U,
) -> (StatusCode, String)
where
    K: DeserializeOwned,
    C: Fn(&K) -> Vec<FieldError>,
    U: Fn(&K, &K) -> Vec<FieldError>,
{
    let name = object_name(&parts.object);
    let new: K = match serde_json::from_value(parts.object.clone()) {
        Ok(new) => new,
        Err(e) => {
            return (
                StatusCode::OK,
                invalid_response(
                    &parts.uid,
                    kind,
                    &name,
                    &[FieldError::new(
                        "spec",
                        crate::webhooks::validator::ErrorKind::Invalid,
                        e.to_string(),
                    )],
                ),
            );
        }
    };

    let errors = if parts.operation == "UPDATE" {
        match serde_json::from_value::<K>(parts.old_object.clone()) {
            Ok(old) => validate_update(&old, &new),
            Err(_) => validate_create(&new),
        }
    } else {
        validate_create(&new)
    };

    if errors.is_empty() {
        (StatusCode::OK, allowed_response(&parts.uid))
    } else {
        info!(kind = %kind, name = %name, errors = errors.len(), "admission_rejected");
        (
            StatusCode::OK,
            invalid_response(&parts.uid, kind, &name, &errors),
        )
    }
}

async fn validate_admission_policy_handler(
    State(_state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    let parts = match parse_review(&body) {
        Ok(parts) => parts,
        Err(e) => return malformed_review(&e),
    };
    run_validation::<AdmissionPolicy, _, _>(
        &parts,
        "AdmissionPolicy",
        validate_admission_policy,
        validate_admission_policy_update,
    )
}

async fn validate_cluster_admission_policy_handler(
    State(_state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    let parts = match parse_review(&body) {
        Ok(parts) => parts,
        Err(e) => return malformed_review(&e),
    };
    run_validation::<ClusterAdmissionPolicy, _, _>(
        &parts,
        "ClusterAdmissionPolicy",
        validate_cluster_admission_policy,
        validate_cluster_admission_policy_update,
    )
}

async fn validate_admission_policy_group_handler(
    State(_state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    let parts = match parse_review(&body) {
        Ok(parts) => parts,
        Err(e) => return malformed_review(&e),
    };
    run_validation::<AdmissionPolicyGroup, _, _>(
        &parts,
        "AdmissionPolicyGroup",
        validate_admission_policy_group,
        validate_admission_policy_group_update,
    )
}

async fn validate_cluster_admission_policy_group_handler(
    State(_state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    let parts = match parse_review(&body) {
        Ok(parts) => parts,
        Err(e) => return malformed_review(&e),
    };
    run_validation::<ClusterAdmissionPolicyGroup, _, _>(
        &parts,
        "ClusterAdmissionPolicyGroup",
        validate_cluster_admission_policy_group,
        validate_cluster_admission_policy_group_update,
    )
}

async fn validate_policy_server_handler(
    State(state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    let parts = match parse_review(&body) {
        Ok(parts) => parts,
        Err(e) => return malformed_review(&e),
    };
    let name = object_name(&parts.object);

    let policy_server: PolicyServer = match serde_json::from_value(parts.object.clone()) {
        Ok(server) => server,
        Err(e) => {
            return (
                StatusCode::OK,
                invalid_response(
                    &parts.uid,
                    "PolicyServer",
                    &name,
                    &[FieldError::new(
                        "spec",
                        crate::webhooks::validator::ErrorKind::Invalid,
                        e.to_string(),
                    )],
                ),
            );
        }
    };

    let mut errors = validate_policy_server(&policy_server);

    if let (Some(client), Some(secret_name)) =
        (&state.client, &policy_server.spec.image_pull_secret)
    {
        if let Some(error) =
            validate_image_pull_secret(client, &state.deployments_namespace, secret_name).await
        {
            errors.push(error);
        }
    }

    if errors.is_empty() {
        (StatusCode::OK, allowed_response(&parts.uid))
    } else {
        info!(name = %name, errors = errors.len(), "policy_server_rejected");
        (
            StatusCode::OK,
            invalid_response(&parts.uid, "PolicyServer", &name, &errors),
        )
    }
}

/* ============================= TESTS ============================= */

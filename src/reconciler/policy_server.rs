use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::certs::{
    ca_needs_rotation, cert_needs_rotation, generate_ca, generate_cert, CertificatePair,
    CA_VALIDITY_DAYS, CERT_VALIDITY_DAYS,
};
use crate::conditions::{
    condition_false, condition_true, set_condition, CA_ROOT_SECRET_RECONCILED,
    CA_SECRET_RECONCILED, CONFIG_MAP_RECONCILED, DEPLOYMENT_RECONCILED,
    POD_DISRUPTION_BUDGET_RECONCILED, REASON_RECONCILIATION_FAILED, SERVICE_RECONCILED,
};
use crate::config::{
    build_policies_config, build_sources_config, config_hash, serialize_policies_config,
    serialize_sources_config,
};
use crate::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    PolicyServer,
};
use crate::errors::{Error, Result};
use crate::policy::{Policy, PolicyKind};
use crate::reconciler::{apply, ensure_finalizer, remove_finalizer, Context};
use crate::resources::{
    ca_root_secret, cert_secret, cert_secret_format_is_current, certificate_pair_from_secret,
    config_map, deployment, pod_disruption_budget, service,
};
use crate::{
    policy_server_cert_secret_name, policy_server_dns_name, policy_server_resource_name,
    CA_ROOT_SECRET_NAME, FIELD_MANAGER, POLICY_SERVER_LABEL,
};

const REQUEUE_INTERVAL: Duration = Duration::from_secs(60);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Key inside a user-provided verification ConfigMap.
const VERIFICATION_CONFIG_DATA_KEY: &str = "verification-config";

/* ============================= ENTRY ============================= */

pub async fn reconcile(
    policy_server: Arc<PolicyServer>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = policy_server.name_any();
    info!(policy_server = %name, "reconcile_start");

    if policy_server.metadata.deletion_timestamp.is_some() {
        return finalize(&policy_server, &ctx).await;
    }

    let servers: Api<PolicyServer> = Api::all(ctx.client.clone());
    ensure_finalizer(&servers, policy_server.as_ref()).await?;

    let mut conditions = policy_server
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let result = reconcile_children(&policy_server, &ctx, &mut conditions).await;

    // Conditions are written even when a step failed, so the failure reason
    // is visible on the object and not only in the controller log.
    if let Err(e) = patch_status(&servers, &name, &conditions).await {
        warn!(policy_server = %name, error = %e, "status_patch_failed");
    }

    result?;
    info!(policy_server = %name, "reconcile_complete");

    // Bound policies advance to `active` through their own reconcilers; the
    // watch on PolicyServer events re-enqueues them once the deployment
    // becomes available.
    Ok(Action::requeue(REQUEUE_INTERVAL))
}

pub fn error_policy(policy_server: Arc<PolicyServer>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        policy_server = %policy_server.name_any(),
        error = %error,
        "reconcile_error"
    );
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/* ============================= CHILD OBJECTS ============================= */

async fn reconcile_children(
    policy_server: &PolicyServer,
    ctx: &Context,
    conditions: &mut Vec<Condition>,
) -> Result<()> {
    let generation = policy_server.metadata.generation;

    let ca = record(
        conditions,
        CA_ROOT_SECRET_RECONCILED,
        generation,
        reconcile_ca_root(ctx).await,
    )?;

    let cert_version = record(
        conditions,
        CA_SECRET_RECONCILED,
        generation,
        reconcile_server_cert(policy_server, ctx, &ca).await,
    )?;

    let config_version = record(
        conditions,
        CONFIG_MAP_RECONCILED,
        generation,
        reconcile_config_map(policy_server, ctx).await,
    )?;

    record(
        conditions,
        POD_DISRUPTION_BUDGET_RECONCILED,
        generation,
        reconcile_pod_disruption_budget(policy_server, ctx).await,
    )?;

    record(
        conditions,
        DEPLOYMENT_RECONCILED,
        generation,
        reconcile_deployment(policy_server, ctx, &config_version, &cert_version).await,
    )?;

    record(
        conditions,
        SERVICE_RECONCILED,
        generation,
        reconcile_service(policy_server, ctx).await,
    )?;

    Ok(())
}

fn record<T>(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    generation: Option<i64>,
    result: Result<T>,
) -> Result<T> {
    match &result {
        Ok(_) => set_condition(conditions, condition_true(condition_type, generation)),
        Err(e) => set_condition(
            conditions,
            condition_false(
                condition_type,
                REASON_RECONCILIATION_FAILED,
                &e.to_string(),
                generation,
            ),
        ),
    }
    result
}

/* ============================= CA ROOT ============================= */

/// Fetch or (re)generate the cluster-wide CA. Verification failures are not
/// fatal: the CA is overwritten and every dependent leaf follows suit.
async fn reconcile_ca_root(ctx: &Context) -> Result<CertificatePair> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let now = OffsetDateTime::now_utc();

    if let Some(secret) = secrets.get_opt(CA_ROOT_SECRET_NAME).await? {
        if let Some(pair) = certificate_pair_from_secret(&secret, "ca.crt", "ca.key") {
            if !ca_needs_rotation(&pair, now) {
                return Ok(pair);
            }
        }
    }

    let pair = generate_ca(now, now + time::Duration::days(CA_VALIDITY_DAYS))?;
    apply(
        &secrets,
        &ca_root_secret(&pair, CA_ROOT_SECRET_NAME, &ctx.deployments_namespace),
    )
    .await?;
    info!("ca_root_generated");
    Ok(pair)
}

/* ============================= SERVER CERT ============================= */

/// Fetch or (re)generate the per-server serving certificate. Returns the
/// secret resourceVersion so the deployment can roll on rotation.
async fn reconcile_server_cert(
    policy_server: &PolicyServer,
    ctx: &Context,
    ca: &CertificatePair,
) -> Result<String> {
    let name = policy_server.name_any();
    let secret_name = policy_server_cert_secret_name(&name);
    let dns_name = policy_server_dns_name(&name, &ctx.deployments_namespace);
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let now = OffsetDateTime::now_utc();

    if let Some(secret) = secrets.get_opt(&secret_name).await? {
        if cert_secret_format_is_current(&secret) {
            if let Some(pair) = certificate_pair_from_secret(&secret, "tls.crt", "tls.key") {
                if !cert_needs_rotation(&pair, &ca.cert_pem, &dns_name, now) {
                    return Ok(secret.resource_version().unwrap_or_default());
                }
            }
        }
    }

    let pair = generate_cert(
        ca,
        now,
        now + time::Duration::days(CERT_VALIDITY_DAYS),
        &dns_name,
    )?;
    let applied = apply(
        &secrets,
        &cert_secret(&pair, policy_server, &ctx.deployments_namespace),
    )
    .await?;
    info!(policy_server = %name, dns_name = %dns_name, "server_cert_generated");
    Ok(applied.resource_version().unwrap_or_default())
}

/* ============================= CONFIG MAP ============================= */

async fn reconcile_config_map(policy_server: &PolicyServer, ctx: &Context) -> Result<String> {
    let policies = fetch_bound_policies(ctx, &policy_server.name_any()).await?;
    let entries = build_policies_config(&policies);
    let policies_config = serialize_policies_config(&entries)?;
    let sources_config = serialize_sources_config(&build_sources_config(&policy_server.spec))?;
    let verification_config = read_verification_config(policy_server, ctx).await?;

    let config_maps: Api<ConfigMap> =
        Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    apply(
        &config_maps,
        &config_map(
            policy_server,
            &ctx.deployments_namespace,
            policies_config.clone(),
            sources_config.clone(),
            verification_config.clone(),
        ),
    )
    .await?;

    Ok(config_hash(
        &policies_config,
        &sources_config,
        verification_config.as_deref().unwrap_or_default(),
    ))
}

async fn read_verification_config(
    policy_server: &PolicyServer,
    ctx: &Context,
) -> Result<Option<String>> {
    let Some(config_map_name) = &policy_server.spec.verification_config else {
        return Ok(None);
    };
    let config_maps: Api<ConfigMap> =
        Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let Some(referenced) = config_maps.get_opt(config_map_name).await? else {
        // Known-pending: the referenced ConfigMap may appear later.
        warn!(config_map = %config_map_name, "verification_config_map_not_found");
        return Ok(None);
    };
    Ok(referenced
        .data
        .as_ref()
        .and_then(|data| data.get(VERIFICATION_CONFIG_DATA_KEY).cloned()))
}

/// Resolve the reverse index into live policy objects, skipping entries that
/// are already on their way out.
async fn fetch_bound_policies(ctx: &Context, policy_server_name: &str) -> Result<Vec<Policy>> {
    let mut policies = Vec::new();

    for key in ctx.index.policies_bound_to(policy_server_name) {
        let namespace = key.namespace.clone().unwrap_or_default();
        let policy: Option<Policy> = match key.kind {
            PolicyKind::AdmissionPolicy => {
                let api: Api<AdmissionPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
                api.get_opt(&key.name).await?.map(Policy::from)
            }
            PolicyKind::ClusterAdmissionPolicy => {
                let api: Api<ClusterAdmissionPolicy> = Api::all(ctx.client.clone());
                api.get_opt(&key.name).await?.map(Policy::from)
            }
            PolicyKind::AdmissionPolicyGroup => {
                let api: Api<AdmissionPolicyGroup> = Api::namespaced(ctx.client.clone(), &namespace);
                api.get_opt(&key.name).await?.map(Policy::from)
            }
            PolicyKind::ClusterAdmissionPolicyGroup => {
                let api: Api<ClusterAdmissionPolicyGroup> = Api::all(ctx.client.clone());
                api.get_opt(&key.name).await?.map(Policy::from)
            }
        };

        match policy {
            Some(policy) if !policy.is_being_deleted() => policies.push(policy),
            _ => {}
        }
    }

    Ok(policies)
}

/* ============================= PDB / DEPLOYMENT / SERVICE ============================= */

async fn reconcile_pod_disruption_budget(
    policy_server: &PolicyServer,
    ctx: &Context,
) -> Result<()> {
    let budgets: Api<PodDisruptionBudget> =
        Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let name = policy_server_resource_name(&policy_server.name_any());

    match pod_disruption_budget(policy_server, &ctx.deployments_namespace) {
        Some(budget) => {
            apply(&budgets, &budget).await?;
        }
        None => {
            // Neither disruption field is set any more; drop a leftover budget.
            if budgets.get_opt(&name).await?.is_some() {
                budgets.delete(&name, &DeleteParams::default()).await?;
            }
        }
    }
    Ok(())
}

async fn reconcile_deployment(
    policy_server: &PolicyServer,
    ctx: &Context,
    config_version: &str,
    cert_version: &str,
) -> Result<()> {
    let deployments: Api<Deployment> =
        Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    apply(
        &deployments,
        &deployment(
            policy_server,
            &ctx.deployments_namespace,
            config_version,
            cert_version,
            &ctx.telemetry,
        ),
    )
    .await?;
    Ok(())
}

async fn reconcile_service(policy_server: &PolicyServer, ctx: &Context) -> Result<()> {
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    apply(&services, &service(policy_server, &ctx.deployments_namespace)).await?;
    Ok(())
}

/* ============================= STATUS ============================= */

async fn patch_status(
    servers: &Api<PolicyServer>,
    name: &str,
    conditions: &[Condition],
) -> Result<(), kube::Error> {
    let patch = serde_json::json!({
        "status": {
            "conditions": conditions
        }
    });
    servers
        .patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

/* ============================= FINALIZE ============================= */

/// Deletion is blocked until no policy names this server; afterwards the
/// labeled webhook configurations go away and the finalizer is stripped.
/// The owned children are garbage-collected through their owner references.
async fn finalize(policy_server: &PolicyServer, ctx: &Context) -> Result<Action, Error> {
    let name = policy_server.name_any();

    if ctx.index.has_policies_bound_to(&name) {
        info!(policy_server = %name, "deletion_blocked_by_bound_policies");
        return Err(Error::PolicyServerStillInUse(name));
    }

    let selector = format!("{POLICY_SERVER_LABEL}={name}");
    let list = ListParams::default().labels(&selector);

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
    validating
        .delete_collection(&DeleteParams::default(), &list)
        .await?;

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());
    mutating
        .delete_collection(&DeleteParams::default(), &list)
        .await?;

    let servers: Api<PolicyServer> = Api::all(ctx.client.clone());
    remove_finalizer(&servers, policy_server).await?;

    info!(policy_server = %name, "finalized");
    Ok(Action::await_change())
}

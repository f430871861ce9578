use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, ValidatingWebhook,
    ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    Condition, LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::error::ErrorResponse;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::conditions::{
    condition_false, condition_true, set_condition, POLICY_ACTIVE,
    POLICY_SERVER_CONFIGURATION_UP_TO_DATE, POLICY_UNIQUELY_REACHABLE, REASON_PENDING,
    REASON_POLICY_SERVER_NOT_FOUND,
};
use crate::config::{build_entry, config_hash, observed_entry};
use crate::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    PolicyServer, PolicyStatus, PolicyStatusPhase,
};
use crate::errors::{Error, Result};
use crate::index::PolicyKey;
use crate::policy::Policy;
use crate::reconciler::{apply, ensure_finalizer, remove_finalizer, Context};
use crate::resources::certificate_pair_from_secret;
use crate::{
    policy_server_dns_name, policy_server_resource_name, CA_ROOT_SECRET_NAME,
    CONFIG_VERSION_ANNOTATION, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    POLICIES_CONFIG_KEY, POLICY_SCOPE_LABEL, POLICY_SERVER_LABEL, POLICY_SERVER_SERVICE_PORT,
    SOURCES_CONFIG_KEY, VERIFICATION_CONFIG_KEY,
};

const REQUEUE_INTERVAL: Duration = Duration::from_secs(60);
const FINALIZE_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/* ============================= PER-KIND ENTRY POINTS ============================= */

pub async fn reconcile_admission_policy(
    policy: Arc<AdmissionPolicy>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    reconcile_policy(Policy::Admission(policy.as_ref().clone()), ctx).await
}

pub async fn reconcile_cluster_admission_policy(
    policy: Arc<ClusterAdmissionPolicy>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    reconcile_policy(Policy::ClusterAdmission(policy.as_ref().clone()), ctx).await
}

pub async fn reconcile_admission_policy_group(
    policy: Arc<AdmissionPolicyGroup>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    reconcile_policy(Policy::Group(policy.as_ref().clone()), ctx).await
}

pub async fn reconcile_cluster_admission_policy_group(
    policy: Arc<ClusterAdmissionPolicyGroup>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    reconcile_policy(Policy::ClusterGroup(policy.as_ref().clone()), ctx).await
}

pub fn error_policy<K: kube::Resource>(
    policy: Arc<K>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(
        policy = %policy.meta().name.as_deref().unwrap_or_default(),
        error = %error,
        "reconcile_error"
    );
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/* ============================= SHARED SKELETON ============================= */

async fn reconcile_policy(policy: Policy, ctx: Arc<Context>) -> Result<Action, Error> {
    let unique_name = policy.unique_name();
    info!(policy = %unique_name, "reconcile_start");

    if policy.is_being_deleted() {
        return finalize_policy(&policy, &ctx).await;
    }

    ctx.index.upsert(&policy);
    let api = PolicyApi::for_policy(&ctx.client, &policy);
    api.ensure_finalizer(&policy).await?;

    let mut conditions = policy
        .status()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    // Resolve the bound PolicyServer. A missing server is a known pending
    // state surfaced on status, never a reconcile error.
    let servers: Api<PolicyServer> = Api::all(ctx.client.clone());
    let Some(server) = servers.get_opt(policy.policy_server()).await? else {
        set_condition(
            &mut conditions,
            condition_false(
                POLICY_SERVER_CONFIGURATION_UP_TO_DATE,
                REASON_POLICY_SERVER_NOT_FOUND,
                &format!("policy server {} does not exist", policy.policy_server()),
                policy.metadata().generation,
            ),
        );
        set_condition(
            &mut conditions,
            condition_false(
                POLICY_UNIQUELY_REACHABLE,
                REASON_POLICY_SERVER_NOT_FOUND,
                "",
                policy.metadata().generation,
            ),
        );
        set_condition(
            &mut conditions,
            condition_false(
                POLICY_ACTIVE,
                REASON_POLICY_SERVER_NOT_FOUND,
                "",
                policy.metadata().generation,
            ),
        );
        api.patch_status(&policy, PolicyStatusPhase::Unscheduled, conditions)
            .await?;
        info!(policy = %unique_name, "policy_server_not_found");
        // The watch on PolicyServer events wakes this policy up as soon as
        // the server appears; same for spec changes that flow into the
        // server's config map through the server controller's policy watch.
        return Ok(Action::await_change());
    };

    let generation = policy.metadata().generation;
    let observed = ObservedState::read(&policy, &server, &ctx).await?;

    let mut phase = PolicyStatusPhase::Scheduled;
    if observed.config_up_to_date {
        phase = PolicyStatusPhase::Pending;
    }

    let mut webhook_applied = false;
    if observed.config_up_to_date && observed.deployment_ready {
        if let Some(ca_bundle) = read_ca_bundle(&ctx).await? {
            reconcile_webhook_configuration(&policy, &ctx, ca_bundle).await?;
            webhook_applied = true;
            phase = PolicyStatusPhase::Active;
        } else {
            warn!(policy = %unique_name, "ca_root_secret_missing");
        }
    }

    if observed.config_up_to_date {
        set_condition(
            &mut conditions,
            condition_true(POLICY_SERVER_CONFIGURATION_UP_TO_DATE, generation),
        );
    } else {
        set_condition(
            &mut conditions,
            condition_false(
                POLICY_SERVER_CONFIGURATION_UP_TO_DATE,
                REASON_PENDING,
                "policy is not yet part of the policy server configuration",
                generation,
            ),
        );
    }

    // Uniquely reachable: the webhook exists and the running deployment has
    // rolled onto the configuration that contains this policy, so only the
    // latest definition can be hit by the API server.
    if webhook_applied && observed.deployment_has_latest_config {
        set_condition(
            &mut conditions,
            condition_true(POLICY_UNIQUELY_REACHABLE, generation),
        );
    } else {
        set_condition(
            &mut conditions,
            condition_false(
                POLICY_UNIQUELY_REACHABLE,
                REASON_PENDING,
                "policy server has not yet observed the latest configuration",
                generation,
            ),
        );
    }

    if phase == PolicyStatusPhase::Active {
        set_condition(&mut conditions, condition_true(POLICY_ACTIVE, generation));
    } else {
        set_condition(
            &mut conditions,
            condition_false(POLICY_ACTIVE, REASON_PENDING, "", generation),
        );
    }

    api.patch_status(&policy, phase, conditions).await?;
    info!(policy = %unique_name, phase = %phase, "reconcile_complete");
    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/* ============================= OBSERVED STATE ============================= */

struct ObservedState {
    config_up_to_date: bool,
    deployment_ready: bool,
    deployment_has_latest_config: bool,
}

impl ObservedState {
    async fn read(policy: &Policy, server: &PolicyServer, ctx: &Context) -> Result<Self> {
        let resource_name = policy_server_resource_name(&server.name_any());

        let config_maps: Api<ConfigMap> =
            Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
        let observed_config = config_maps.get_opt(&resource_name).await?;

        let mut config_up_to_date = false;
        let mut observed_hash = None;
        if let Some(config) = &observed_config {
            if let Some(data) = &config.data {
                let policies = data.get(POLICIES_CONFIG_KEY).cloned().unwrap_or_default();
                let sources = data.get(SOURCES_CONFIG_KEY).cloned().unwrap_or_default();
                let verification = data
                    .get(VERIFICATION_CONFIG_KEY)
                    .cloned()
                    .unwrap_or_default();
                observed_hash = Some(config_hash(&policies, &sources, &verification));

                config_up_to_date = observed_entry(&policies, &policy.unique_name())
                    .is_some_and(|entry| entry == build_entry(policy));
            }
        }

        let deployments: Api<Deployment> =
            Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
        let deployment = deployments.get_opt(&resource_name).await?;

        let mut deployment_ready = false;
        let mut deployment_has_latest_config = false;
        if let Some(deployment) = &deployment {
            if let Some(status) = &deployment.status {
                deployment_ready = status.available_replicas.unwrap_or(0) >= 1
                    && status.observed_generation == deployment.metadata.generation;
            }
            let template_config_version = deployment
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.annotations.as_ref())
                .and_then(|a| a.get(CONFIG_VERSION_ANNOTATION));
            deployment_has_latest_config = matches!(
                (template_config_version, &observed_hash),
                (Some(stamped), Some(current)) if stamped == current
            );
        }

        Ok(ObservedState {
            config_up_to_date,
            deployment_ready,
            deployment_has_latest_config,
        })
    }
}

async fn read_ca_bundle(ctx: &Context) -> Result<Option<Vec<u8>>> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let Some(secret) = secrets.get_opt(CA_ROOT_SECRET_NAME).await? else {
        return Ok(None);
    };
    Ok(certificate_pair_from_secret(&secret, "ca.crt", "ca.key")
        .map(|pair| pair.cert_pem.into_bytes()))
}

/* ============================= WEBHOOK CONFIGURATIONS ============================= */

fn webhook_meta(policy: &Policy) -> ObjectMeta {
    let scope = if policy.kind().is_cluster_scoped() {
        "cluster"
    } else {
        "namespace"
    };
    ObjectMeta {
        name: Some(policy.unique_name()),
        labels: Some(BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (POLICY_SCOPE_LABEL.to_string(), scope.to_string()),
            (
                POLICY_SERVER_LABEL.to_string(),
                policy.policy_server().to_string(),
            ),
        ])),
        ..Default::default()
    }
}

fn client_config(
    policy: &Policy,
    deployments_namespace: &str,
    ca_bundle: Vec<u8>,
) -> WebhookClientConfig {
    let dns_name = policy_server_dns_name(policy.policy_server(), deployments_namespace);
    WebhookClientConfig {
        url: Some(format!(
            "https://{dns_name}:{POLICY_SERVER_SERVICE_PORT}{}",
            policy.server_path()
        )),
        ca_bundle: Some(ByteString(ca_bundle)),
        service: None,
    }
}

/// The namespace selector the webhook configuration ends up with.
///
/// Namespaced policies are forced onto their own namespace regardless of
/// user input. Cluster-scoped policies keep the user selector; when the
/// controller is told to always accept reviews on its own namespace, a
/// `NotIn` clause for that namespace is appended.
pub fn effective_namespace_selector(
    policy: &Policy,
    deployments_namespace: &str,
    always_accept_on_deployments_namespace: bool,
) -> Option<LabelSelector> {
    if !policy.kind().is_cluster_scoped() {
        return Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "kubernetes.io/metadata.name".to_string(),
                policy.namespace().unwrap_or_default(),
            )])),
            ..Default::default()
        });
    }

    let mut selector = policy.user_namespace_selector().cloned().unwrap_or_default();
    if always_accept_on_deployments_namespace {
        let mut expressions = selector.match_expressions.take().unwrap_or_default();
        expressions.push(LabelSelectorRequirement {
            key: "kubernetes.io/metadata.name".to_string(),
            operator: "NotIn".to_string(),
            values: Some(vec![deployments_namespace.to_string()]),
        });
        selector.match_expressions = Some(expressions);
    }

    if selector == LabelSelector::default() {
        None
    } else {
        Some(selector)
    }
}

pub fn build_validating_webhook_configuration(
    policy: &Policy,
    deployments_namespace: &str,
    always_accept_on_deployments_namespace: bool,
    ca_bundle: Vec<u8>,
) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: webhook_meta(policy),
        webhooks: Some(vec![ValidatingWebhook {
            name: format!("{}.kubewarden.admission", policy.unique_name()),
            admission_review_versions: vec!["v1".to_string()],
            client_config: client_config(policy, deployments_namespace, ca_bundle),
            rules: Some(policy.rules().to_vec()),
            failure_policy: Some(policy.failure_policy().as_str().to_string()),
            match_policy: Some(policy.match_policy().as_str().to_string()),
            side_effects: policy.side_effects().as_str().to_string(),
            timeout_seconds: Some(policy.timeout_seconds()),
            namespace_selector: effective_namespace_selector(
                policy,
                deployments_namespace,
                always_accept_on_deployments_namespace,
            ),
            object_selector: policy.object_selector().cloned(),
            match_conditions: match policy.match_conditions() {
                [] => None,
                conditions => Some(conditions.to_vec()),
            },
        }]),
    }
}

pub fn build_mutating_webhook_configuration(
    policy: &Policy,
    deployments_namespace: &str,
    always_accept_on_deployments_namespace: bool,
    ca_bundle: Vec<u8>,
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: webhook_meta(policy),
        webhooks: Some(vec![MutatingWebhook {
            name: format!("{}.kubewarden.admission", policy.unique_name()),
            admission_review_versions: vec!["v1".to_string()],
            client_config: client_config(policy, deployments_namespace, ca_bundle),
            rules: Some(policy.rules().to_vec()),
            failure_policy: Some(policy.failure_policy().as_str().to_string()),
            match_policy: Some(policy.match_policy().as_str().to_string()),
            side_effects: policy.side_effects().as_str().to_string(),
            timeout_seconds: Some(policy.timeout_seconds()),
            reinvocation_policy: Some("Never".to_string()),
            namespace_selector: effective_namespace_selector(
                policy,
                deployments_namespace,
                always_accept_on_deployments_namespace,
            ),
            object_selector: policy.object_selector().cloned(),
            match_conditions: match policy.match_conditions() {
                [] => None,
                conditions => Some(conditions.to_vec()),
            },
        }]),
    }
}

async fn reconcile_webhook_configuration(
    policy: &Policy,
    ctx: &Context,
    ca_bundle: Vec<u8>,
) -> Result<()> {
    let name = policy.unique_name();
    let validating: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
    let mutating: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());

    if policy.is_mutating() {
        apply(
            &mutating,
            &build_mutating_webhook_configuration(
                policy,
                &ctx.deployments_namespace,
                ctx.always_accept_admission_reviews_on_deployments_namespace,
                ca_bundle,
            ),
        )
        .await?;
        delete_ignoring_missing(&validating, &name).await?;
    } else {
        apply(
            &validating,
            &build_validating_webhook_configuration(
                policy,
                &ctx.deployments_namespace,
                ctx.always_accept_admission_reviews_on_deployments_namespace,
                ca_bundle,
            ),
        )
        .await?;
        delete_ignoring_missing(&mutating, &name).await?;
    }
    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
        Err(e) => Err(e),
    }
}

/* ============================= FINALIZE ============================= */

/// Teardown order: webhook configuration first (no more admission traffic),
/// then wait for the policy server config to drop the policy, then strip the
/// finalizer.
async fn finalize_policy(policy: &Policy, ctx: &Context) -> Result<Action, Error> {
    let unique_name = policy.unique_name();

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
    let mutating: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());
    delete_ignoring_missing(&validating, &unique_name).await?;
    delete_ignoring_missing(&mutating, &unique_name).await?;

    ctx.index.remove(&PolicyKey::of(policy));

    // The policy server reconciler rebuilds the config map without this
    // policy; hold the finalizer until that has happened.
    let config_maps: Api<ConfigMap> =
        Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let resource_name = policy_server_resource_name(policy.policy_server());
    if let Some(config) = config_maps.get_opt(&resource_name).await? {
        let still_present = config
            .data
            .as_ref()
            .and_then(|data| data.get(POLICIES_CONFIG_KEY))
            .is_some_and(|policies| observed_entry(policies, &unique_name).is_some());
        if still_present {
            info!(policy = %unique_name, "waiting_for_config_map_removal");
            return Ok(Action::requeue(FINALIZE_RETRY_INTERVAL));
        }
    }

    let api = PolicyApi::for_policy(&ctx.client, policy);
    api.remove_finalizer(policy).await?;
    info!(policy = %unique_name, "finalized");
    Ok(Action::await_change())
}

/* ============================= TYPED API DISPATCH ============================= */

/// Typed API handle for whichever kind the policy happens to be.
enum PolicyApi {
    Admission(Api<AdmissionPolicy>),
    ClusterAdmission(Api<ClusterAdmissionPolicy>),
    Group(Api<AdmissionPolicyGroup>),
    ClusterGroup(Api<ClusterAdmissionPolicyGroup>),
}

impl PolicyApi {
    fn for_policy(client: &Client, policy: &Policy) -> Self {
        let namespace = policy.namespace().unwrap_or_default();
        match policy {
            Policy::Admission(_) => {
                PolicyApi::Admission(Api::namespaced(client.clone(), &namespace))
            }
            Policy::ClusterAdmission(_) => PolicyApi::ClusterAdmission(Api::all(client.clone())),
            Policy::Group(_) => PolicyApi::Group(Api::namespaced(client.clone(), &namespace)),
            Policy::ClusterGroup(_) => PolicyApi::ClusterGroup(Api::all(client.clone())),
        }
    }

    async fn ensure_finalizer(&self, policy: &Policy) -> Result<(), kube::Error> {
        match (self, policy) {
            (PolicyApi::Admission(api), Policy::Admission(p)) => ensure_finalizer(api, p).await,
            (PolicyApi::ClusterAdmission(api), Policy::ClusterAdmission(p)) => {
                ensure_finalizer(api, p).await
            }
            (PolicyApi::Group(api), Policy::Group(p)) => ensure_finalizer(api, p).await,
            (PolicyApi::ClusterGroup(api), Policy::ClusterGroup(p)) => {
                ensure_finalizer(api, p).await
            }
            _ => Ok(()),
        }
    }

    async fn remove_finalizer(&self, policy: &Policy) -> Result<(), kube::Error> {
        match (self, policy) {
            (PolicyApi::Admission(api), Policy::Admission(p)) => remove_finalizer(api, p).await,
            (PolicyApi::ClusterAdmission(api), Policy::ClusterAdmission(p)) => {
                remove_finalizer(api, p).await
            }
            (PolicyApi::Group(api), Policy::Group(p)) => remove_finalizer(api, p).await,
            (PolicyApi::ClusterGroup(api), Policy::ClusterGroup(p)) => {
                remove_finalizer(api, p).await
            }
            _ => Ok(()),
        }
    }

    async fn patch_status(
        &self,
        policy: &Policy,
        phase: PolicyStatusPhase,
        conditions: Vec<Condition>,
    ) -> Result<(), kube::Error> {
        let status = PolicyStatus {
            policy_status: phase,
            mode: Some(policy.mode()),
            conditions,
        };
        let patch = serde_json::json!({ "status": status });
        let params = PatchParams::apply(FIELD_MANAGER);
        let name = policy.name();
        match self {
            PolicyApi::Admission(api) => {
                api.patch_status(&name, &params, &Patch::Merge(&patch)).await?;
            }
            PolicyApi::ClusterAdmission(api) => {
                api.patch_status(&name, &params, &Patch::Merge(&patch)).await?;
            }
            PolicyApi::Group(api) => {
                api.patch_status(&name, &params, &Patch::Merge(&patch)).await?;
            }
            PolicyApi::ClusterGroup(api) => {
                api.patch_status(&name, &params, &Patch::Merge(&patch)).await?;
            }
        }
        Ok(())
    }
}

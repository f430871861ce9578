pub mod policy;
pub mod policy_server;

use std::fmt::Debug;
use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::index::PolicyIndex;
use crate::resources::TelemetryConfig;
use crate::{FIELD_MANAGER, FINALIZER};

/* ============================= CONTEXT ============================= */

/// Shared state handed to every reconciler.
pub struct Context {
    pub client: Client,

    /// Namespace where all owned child objects live.
    pub deployments_namespace: String,

    /// When set, cluster-scoped webhook configurations get a `NotIn` clause
    /// excluding the deployments namespace, so a broken policy can never
    /// lock the controller out of its own namespace.
    pub always_accept_admission_reviews_on_deployments_namespace: bool,

    pub telemetry: TelemetryConfig,

    pub index: Arc<PolicyIndex>,
}

/* ============================= APPLY ============================= */

/// Server-side create-or-update. The field manager owns every field it
/// writes; conflicts with other managers are forced because the controller
/// is the source of truth for its own children.
pub(crate) async fn apply<K>(api: &Api<K>, object: &K) -> Result<K, kube::Error>
where
    K: Resource + Serialize + DeserializeOwned + Clone + Debug,
{
    let name = object.meta().name.clone().unwrap_or_default();
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await
}

/* ============================= FINALIZERS ============================= */

pub(crate) fn has_finalizer<K: Resource>(object: &K) -> bool {
    object.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the controller finalizer; no-op when already present.
pub(crate) async fn ensure_finalizer<K>(api: &Api<K>, object: &K) -> Result<(), kube::Error>
where
    K: Resource + DeserializeOwned + Clone + Debug,
{
    if has_finalizer(object) {
        return Ok(());
    }
    let mut finalizers: Vec<String> = object.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(api, &object.name_any(), finalizers).await
}

/// Strip the controller finalizer, keeping any foreign ones.
pub(crate) async fn remove_finalizer<K>(api: &Api<K>, object: &K) -> Result<(), kube::Error>
where
    K: Resource + DeserializeOwned + Clone + Debug,
{
    if !has_finalizer(object) {
        return Ok(());
    }
    let finalizers: Vec<String> = object
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(api, &object.name_any(), finalizers).await
}

async fn patch_finalizers<K>(
    api: &Api<K>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<(), kube::Error>
where
    K: Resource + DeserializeOwned + Clone + Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/* ============================= TESTS ============================= */

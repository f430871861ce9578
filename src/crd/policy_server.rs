use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PodSecurityContext, ResourceRequirements, SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Security contexts applied to the policy-server pod and container.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerSecurityContexts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<SecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodSecurityContext>,
}

/// PolicyServer declares a fleet of policy-evaluation workers. The controller
/// materialises a Deployment, Service, ConfigMap, serving-cert Secret and
/// optional PodDisruptionBudget for it in the deployments namespace.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "PolicyServer",
    plural = "policyservers",
    status = "PolicyServerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerSpec {
    /// Container image running the policy-server process.
    pub image: String,

    /// Number of replicas in the fleet.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Minimum number of pods that must stay available during disruptions.
    /// Mutually exclusive with `maxUnavailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,

    /// Maximum number of pods that may be unavailable during disruptions.
    /// Mutually exclusive with `minAvailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Compute resources for the policy-server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment variables for the policy-server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    /// Name of a `kubernetes.io/dockerconfigjson` secret in the deployments
    /// namespace used to pull policy modules from private registries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,

    /// Registries reachable over plain HTTP or with unverified TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_sources: Option<Vec<String>>,

    /// Registry host to PEM certificate chains trusted for that host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_authorities: Option<BTreeMap<String, Vec<String>>>,

    /// Name of a ConfigMap holding the Sigstore verification config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_config: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_contexts: Option<PolicyServerSecurityContexts>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

impl Default for PolicyServerSpec {
    fn default() -> Self {
        PolicyServerSpec {
            image: String::new(),
            replicas: default_replicas(),
            min_available: None,
            max_unavailable: None,
            resources: None,
            env: None,
            image_pull_secret: None,
            insecure_sources: None,
            source_authorities: None,
            verification_config: None,
            security_contexts: None,
            affinity: None,
            tolerations: None,
            priority_class_name: None,
            service_account_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_identity() {
        let crd = PolicyServer::crd();
        assert_eq!(crd.spec.group, "policies.kubewarden.io");
        assert_eq!(crd.spec.names.kind, "PolicyServer");
        assert_eq!(crd.spec.names.plural, "policyservers");
        assert_eq!(crd.spec.scope, "Cluster");
    }

    #[test]
    fn test_deserialize_minimal_spec() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: PolicyServer
metadata:
  name: default
spec:
  image: ghcr.io/kubewarden/policy-server:v1.21.0
"#;
        let server: PolicyServer = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(server.spec.image, "ghcr.io/kubewarden/policy-server:v1.21.0");
        assert_eq!(server.spec.replicas, 1);
        assert!(server.spec.min_available.is_none());
        assert!(server.spec.max_unavailable.is_none());
    }

    #[test]
    fn test_deserialize_disruption_budget_fields() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: PolicyServer
metadata:
  name: guarded
spec:
  image: ghcr.io/kubewarden/policy-server:v1.21.0
  replicas: 3
  minAvailable: 2
"#;
        let server: PolicyServer = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(server.spec.replicas, 3);
        assert_eq!(server.spec.min_available, Some(IntOrString::Int(2)));
    }

    #[test]
    fn test_deserialize_sources() {
        let yaml = r#"
apiVersion: policies.kubewarden.io/v1
kind: PolicyServer
metadata:
  name: sourced
spec:
  image: ghcr.io/kubewarden/policy-server:v1.21.0
  insecureSources:
    - registry.local:5000
  sourceAuthorities:
    registry.internal:
      - |
        -----BEGIN CERTIFICATE-----
        zz
        -----END CERTIFICATE-----
"#;
        let server: PolicyServer = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            server.spec.insecure_sources.as_deref(),
            Some(&["registry.local:5000".to_string()][..])
        );
        assert!(server
            .spec
            .source_authorities
            .unwrap()
            .contains_key("registry.internal"));
    }
}

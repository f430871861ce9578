use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HTTPGetAction,
    LocalObjectReference, PodSpec, PodTemplateSpec, Probe, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

use crate::certs::CertificatePair;
use crate::crd::PolicyServer;
use crate::{
    policy_server_cert_secret_name, policy_server_resource_name, CERT_SECRET_FORMAT_ANNOTATION,
    CERT_SECRET_FORMAT_VERSION, CERT_VERSION_ANNOTATION, COMPONENT_LABEL, COMPONENT_VALUE,
    CONFIG_VERSION_ANNOTATION, INSTANCE_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    POLICIES_CONFIG_KEY, POLICY_SERVER_LABEL, POLICY_SERVER_PORT, POLICY_SERVER_SERVICE_PORT,
    SOURCES_CONFIG_KEY, VERIFICATION_CONFIG_KEY,
};

/* ============================= TELEMETRY ============================= */

/// Telemetry knobs forwarded from the controller flags into the
/// policy-server container environment.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub enable_metrics: bool,
    pub enable_tracing: bool,
    pub otlp_endpoint: String,
}

/* ============================= COMMON ============================= */

/// Owner reference binding an owned object to its PolicyServer, so deleting
/// the PolicyServer garbage-collects all of them.
pub fn owner_reference(policy_server: &PolicyServer) -> OwnerReference {
    OwnerReference {
        api_version: PolicyServer::api_version(&()).to_string(),
        kind: PolicyServer::kind(&()).to_string(),
        name: policy_server.name_any(),
        uid: policy_server.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

pub fn standard_labels(policy_server: &PolicyServer) -> BTreeMap<String, String> {
    let name = policy_server.name_any();
    BTreeMap::from([
        (
            INSTANCE_LABEL.to_string(),
            policy_server_resource_name(&name),
        ),
        (COMPONENT_LABEL.to_string(), COMPONENT_VALUE.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (POLICY_SERVER_LABEL.to_string(), name),
    ])
}

fn selector_labels(policy_server: &PolicyServer) -> BTreeMap<String, String> {
    BTreeMap::from([(
        POLICY_SERVER_LABEL.to_string(),
        policy_server.name_any(),
    )])
}

fn owned_meta(policy_server: &PolicyServer, name: String, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(standard_labels(policy_server)),
        owner_references: Some(vec![owner_reference(policy_server)]),
        ..Default::default()
    }
}

/* ============================= CONFIG MAP ============================= */

pub fn config_map(
    policy_server: &PolicyServer,
    namespace: &str,
    policies: String,
    sources: String,
    verification: Option<String>,
) -> ConfigMap {
    let mut data = BTreeMap::from([
        (POLICIES_CONFIG_KEY.to_string(), policies),
        (SOURCES_CONFIG_KEY.to_string(), sources),
    ]);
    if let Some(verification) = verification {
        data.insert(VERIFICATION_CONFIG_KEY.to_string(), verification);
    }

    ConfigMap {
        metadata: owned_meta(
            policy_server,
            policy_server_resource_name(&policy_server.name_any()),
            namespace,
        ),
        data: Some(data),
        ..Default::default()
    }
}

/* ============================= SECRETS ============================= */

/// Cluster-wide CA root secret. Deliberately not owned by any PolicyServer:
/// it must survive individual server deletions.
pub fn ca_root_secret(ca: &CertificatePair, name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("ca.crt".to_string(), ca.cert_pem.clone()),
            ("ca.key".to_string(), ca.key_pem.clone()),
        ])),
        ..Default::default()
    }
}

/// Per-server serving-certificate secret, `policy-server-<name>-attrs`.
pub fn cert_secret(
    pair: &CertificatePair,
    policy_server: &PolicyServer,
    namespace: &str,
) -> Secret {
    let mut meta = owned_meta(
        policy_server,
        policy_server_cert_secret_name(&policy_server.name_any()),
        namespace,
    );
    meta.annotations = Some(BTreeMap::from([(
        CERT_SECRET_FORMAT_ANNOTATION.to_string(),
        CERT_SECRET_FORMAT_VERSION.to_string(),
    )]));

    Secret {
        metadata: meta,
        type_: Some("kubernetes.io/tls".to_string()),
        string_data: Some(BTreeMap::from([
            ("tls.crt".to_string(), pair.cert_pem.clone()),
            ("tls.key".to_string(), pair.key_pem.clone()),
        ])),
        ..Default::default()
    }
}

/// Read a certificate pair back out of a secret, looking at both `data`
/// (what the API server stores) and `stringData` (what we write).
pub fn certificate_pair_from_secret(
    secret: &Secret,
    cert_key: &str,
    key_key: &str,
) -> Option<CertificatePair> {
    let from_data = |key: &str| -> Option<String> {
        if let Some(data) = &secret.data {
            if let Some(ByteString(bytes)) = data.get(key) {
                return String::from_utf8(bytes.clone()).ok();
            }
        }
        secret
            .string_data
            .as_ref()
            .and_then(|map| map.get(key).cloned())
    };

    Some(CertificatePair {
        cert_pem: from_data(cert_key)?,
        key_pem: from_data(key_key)?,
    })
}

/// True when the secret carries the current format-version annotation.
/// Secrets written by older controller versions lack it and are regenerated
/// without further inspection.
pub fn cert_secret_format_is_current(secret: &Secret) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CERT_SECRET_FORMAT_ANNOTATION))
        .is_some_and(|v| v == CERT_SECRET_FORMAT_VERSION)
}

/* ============================= DEPLOYMENT ============================= */

pub fn deployment(
    policy_server: &PolicyServer,
    namespace: &str,
    config_version: &str,
    cert_version: &str,
    telemetry: &TelemetryConfig,
) -> Deployment {
    let name = policy_server.name_any();
    let resource_name = policy_server_resource_name(&name);
    let spec = &policy_server.spec;

    let mut env = vec![
        env_var("KUBEWARDEN_CERT_FILE", "/pki/tls.crt"),
        env_var("KUBEWARDEN_KEY_FILE", "/pki/tls.key"),
        env_var("KUBEWARDEN_PORT", &POLICY_SERVER_PORT.to_string()),
        env_var("KUBEWARDEN_POLICIES", "/config/policies.yml"),
        env_var("KUBEWARDEN_SOURCES_PATH", "/config/sources.yml"),
        env_var("KUBEWARDEN_POLICIES_DOWNLOAD_DIR", "/tmp/policies"),
        env_var("KUBEWARDEN_SIGSTORE_CACHE_DIR", "/tmp/sigstore-data"),
        env_var("KUBEWARDEN_LOG_LEVEL", "info"),
    ];
    if spec.verification_config.is_some() {
        env.push(env_var(
            "KUBEWARDEN_VERIFICATION_CONFIG_PATH",
            "/config/verification.yml",
        ));
    }
    if telemetry.enable_metrics {
        env.push(env_var("KUBEWARDEN_ENABLE_METRICS", "1"));
    }
    if telemetry.enable_tracing {
        env.push(env_var("KUBEWARDEN_LOG_FMT", "otlp"));
    }
    if telemetry.enable_metrics || telemetry.enable_tracing {
        env.push(env_var(
            "OTEL_EXPORTER_OTLP_ENDPOINT",
            &telemetry.otlp_endpoint,
        ));
    }
    if let Some(user_env) = &spec.env {
        env.extend(user_env.iter().cloned());
    }

    let volume_mounts = vec![
        VolumeMount {
            name: "config".to_string(),
            mount_path: "/config".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "certs".to_string(),
            mount_path: "/pki".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];

    let volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(resource_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(policy_server_cert_secret_name(&name)),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let container = Container {
        name: "policy-server".to_string(),
        image: Some(spec.image.clone()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: POLICY_SERVER_PORT,
            name: Some("https".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/readiness".to_string()),
                port: IntOrString::Int(POLICY_SERVER_PORT),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources: spec.resources.clone(),
        security_context: spec
            .security_contexts
            .as_ref()
            .and_then(|sc| sc.container.clone()),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    let template_annotations = BTreeMap::from([
        (
            CONFIG_VERSION_ANNOTATION.to_string(),
            config_version.to_string(),
        ),
        (CERT_VERSION_ANNOTATION.to_string(), cert_version.to_string()),
    ]);

    Deployment {
        metadata: owned_meta(policy_server, resource_name, namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(policy_server)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::Int(1)),
                    max_unavailable: Some(IntOrString::Int(0)),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(policy_server)),
                    annotations: Some(template_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    affinity: spec.affinity.clone(),
                    tolerations: spec.tolerations.clone(),
                    priority_class_name: spec.priority_class_name.clone(),
                    service_account_name: spec.service_account_name.clone(),
                    security_context: spec
                        .security_contexts
                        .as_ref()
                        .and_then(|sc| sc.pod.clone()),
                    image_pull_secrets: spec.image_pull_secret.as_ref().map(|name| {
                        vec![LocalObjectReference {
                            name: Some(name.clone()),
                        }]
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/* ============================= SERVICE ============================= */

pub fn service(policy_server: &PolicyServer, namespace: &str) -> Service {
    Service {
        metadata: owned_meta(
            policy_server,
            policy_server_resource_name(&policy_server.name_any()),
            namespace,
        ),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(policy_server)),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: POLICY_SERVER_SERVICE_PORT,
                target_port: Some(IntOrString::Int(POLICY_SERVER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/* ============================= PDB ============================= */

/// Built only when exactly one of `minAvailable` / `maxUnavailable` is set;
/// the admission webhook rejects specs carrying both.
pub fn pod_disruption_budget(
    policy_server: &PolicyServer,
    namespace: &str,
) -> Option<PodDisruptionBudget> {
    let spec = &policy_server.spec;
    if spec.min_available.is_none() && spec.max_unavailable.is_none() {
        return None;
    }

    Some(PodDisruptionBudget {
        metadata: owned_meta(
            policy_server,
            policy_server_resource_name(&policy_server.name_any()),
            namespace,
        ),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: spec.min_available.clone(),
            max_unavailable: spec.max_unavailable.clone(),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(policy_server)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PolicyServerSpec;

    fn policy_server(name: &str) -> PolicyServer {
        PolicyServer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some("1234-uid".to_string()),
                ..Default::default()
            },
            spec: PolicyServerSpec {
                image: "ghcr.io/kubewarden/policy-server:v1.21.0".to_string(),
                replicas: 2,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_owner_reference_points_at_policy_server() {
        let ps = policy_server("default");
        let owner = owner_reference(&ps);
        assert_eq!(owner.api_version, "policies.kubewarden.io/v1");
        assert_eq!(owner.kind, "PolicyServer");
        assert_eq!(owner.name, "default");
        assert_eq!(owner.uid, "1234-uid");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_every_owned_object_carries_the_owner_reference() {
        let ps = policy_server("default");
        let cm = config_map(&ps, "kubewarden", "{}".into(), "{}".into(), None);
        let dep = deployment(&ps, "kubewarden", "hash", "42", &TelemetryConfig::default());
        let svc = service(&ps, "kubewarden");
        let pair = CertificatePair {
            cert_pem: "CERT".into(),
            key_pem: "KEY".into(),
        };
        let secret = cert_secret(&pair, &ps, "kubewarden");

        for owners in [
            cm.metadata.owner_references,
            dep.metadata.owner_references,
            svc.metadata.owner_references,
            secret.metadata.owner_references,
        ] {
            assert_eq!(owners.unwrap()[0].name, "default");
        }
    }

    #[test]
    fn test_ca_root_secret_is_not_owned() {
        let pair = CertificatePair {
            cert_pem: "CERT".into(),
            key_pem: "KEY".into(),
        };
        let secret = ca_root_secret(&pair, "kubewarden-ca", "kubewarden");
        assert!(secret.metadata.owner_references.is_none());
        let data = secret.string_data.unwrap();
        assert_eq!(data["ca.crt"], "CERT");
        assert_eq!(data["ca.key"], "KEY");
    }

    #[test]
    fn test_cert_secret_shape() {
        let ps = policy_server("default");
        let pair = CertificatePair {
            cert_pem: "CERT".into(),
            key_pem: "KEY".into(),
        };
        let secret = cert_secret(&pair, &ps, "kubewarden");
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("policy-server-default-attrs")
        );
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        assert!(cert_secret_format_is_current(&secret));

        let read = certificate_pair_from_secret(&secret, "tls.crt", "tls.key").unwrap();
        assert_eq!(read, pair);
    }

    #[test]
    fn test_cert_secret_without_annotation_is_stale() {
        let ps = policy_server("default");
        let pair = CertificatePair {
            cert_pem: "CERT".into(),
            key_pem: "KEY".into(),
        };
        let mut secret = cert_secret(&pair, &ps, "kubewarden");
        secret.metadata.annotations = None;
        assert!(!cert_secret_format_is_current(&secret));
    }

    #[test]
    fn test_certificate_pair_prefers_binary_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([
                ("tls.crt".to_string(), ByteString(b"BINCERT".to_vec())),
                ("tls.key".to_string(), ByteString(b"BINKEY".to_vec())),
            ])),
            ..Default::default()
        };
        let pair = certificate_pair_from_secret(&secret, "tls.crt", "tls.key").unwrap();
        assert_eq!(pair.cert_pem, "BINCERT");
        assert_eq!(pair.key_pem, "BINKEY");
    }

    #[test]
    fn test_deployment_rollout_annotations() {
        let ps = policy_server("default");
        let dep = deployment(&ps, "kubewarden", "confighash", "99", &TelemetryConfig::default());
        let annotations = dep
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap();
        assert_eq!(annotations[CONFIG_VERSION_ANNOTATION], "confighash");
        assert_eq!(annotations[CERT_VERSION_ANNOTATION], "99");
    }

    #[test]
    fn test_deployment_core_shape() {
        let ps = policy_server("default");
        let dep = deployment(&ps, "kubewarden", "hash", "1", &TelemetryConfig::default());
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.strategy.as_ref().unwrap().type_.as_deref(),
            Some("RollingUpdate")
        );

        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, "policy-server");
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/kubewarden/policy-server:v1.21.0")
        );
        let env = container.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "KUBEWARDEN_CERT_FILE" && e.value.as_deref() == Some("/pki/tls.crt")));
        assert!(env.iter().all(|e| e.name != "KUBEWARDEN_ENABLE_METRICS"));
    }

    #[test]
    fn test_deployment_telemetry_env() {
        let ps = policy_server("default");
        let telemetry = TelemetryConfig {
            enable_metrics: true,
            enable_tracing: true,
            otlp_endpoint: "127.0.0.1:4317".to_string(),
        };
        let dep = deployment(&ps, "kubewarden", "hash", "1", &telemetry);
        let env = dep.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        assert!(env.iter().any(|e| e.name == "KUBEWARDEN_ENABLE_METRICS"));
        assert!(env
            .iter()
            .any(|e| e.name == "OTEL_EXPORTER_OTLP_ENDPOINT"
                && e.value.as_deref() == Some("127.0.0.1:4317")));
    }

    #[test]
    fn test_deployment_image_pull_secret() {
        let mut ps = policy_server("default");
        ps.spec.image_pull_secret = Some("registry-creds".to_string());
        let dep = deployment(&ps, "kubewarden", "hash", "1", &TelemetryConfig::default());
        let pull = dep
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .image_pull_secrets
            .unwrap();
        assert_eq!(pull[0].name.as_deref(), Some("registry-creds"));
    }

    #[test]
    fn test_service_exposes_443_to_8443() {
        let ps = policy_server("default");
        let svc = service(&ps, "kubewarden");
        assert_eq!(svc.metadata.name.as_deref(), Some("policy-server-default"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 443);
        assert_eq!(port.target_port, Some(IntOrString::Int(8443)));
    }

    #[test]
    fn test_pdb_requires_a_disruption_field() {
        let ps = policy_server("default");
        assert!(pod_disruption_budget(&ps, "kubewarden").is_none());

        let mut guarded = policy_server("guarded");
        guarded.spec.min_available = Some(IntOrString::Int(1));
        let pdb = pod_disruption_budget(&guarded, "kubewarden").unwrap();
        assert_eq!(
            pdb.spec.as_ref().unwrap().min_available,
            Some(IntOrString::Int(1))
        );
        assert!(pdb.spec.as_ref().unwrap().max_unavailable.is_none());
    }

    #[test]
    fn test_config_map_keys() {
        let ps = policy_server("default");
        let cm = config_map(
            &ps,
            "kubewarden",
            r#"{"clusterwide-a":{}}"#.into(),
            "{}".into(),
            Some("verification".into()),
        );
        let data = cm.data.unwrap();
        assert!(data.contains_key(POLICIES_CONFIG_KEY));
        assert!(data.contains_key(SOURCES_CONFIG_KEY));
        assert!(data.contains_key(VERIFICATION_CONFIG_KEY));
    }
}

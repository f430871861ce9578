pub mod certs;
pub mod conditions;
pub mod config;
pub mod crd;
pub mod errors;
pub mod expression;
pub mod index;
pub mod policy;
pub mod reconciler;
pub mod resources;
pub mod webhooks;

/* ============================= WELL-KNOWN NAMES ============================= */

/// Finalizer stamped on every policy and policy server managed by this controller.
pub const FINALIZER: &str = "kubewarden";

/// Field manager used for server-side apply patches.
pub const FIELD_MANAGER: &str = "kubewarden-controller";

/// Name of the cluster-wide secret holding the CA certificate and key.
pub const CA_ROOT_SECRET_NAME: &str = "kubewarden-ca";

/// Annotation recording the layout version of the per-server cert secret.
/// A secret without it (or with an older version) is regenerated wholesale.
pub const CERT_SECRET_FORMAT_ANNOTATION: &str = "kubewarden/secret-format-version";

/// Current value written into [`CERT_SECRET_FORMAT_ANNOTATION`].
pub const CERT_SECRET_FORMAT_VERSION: &str = "1";

/// Pod template annotation carrying the policies config-map content hash.
pub const CONFIG_VERSION_ANNOTATION: &str = "kubewarden/config-version";

/// Pod template annotation carrying the cert secret resourceVersion.
pub const CERT_VERSION_ANNOTATION: &str = "kubewarden/server-cert-version";

/// Label binding an owned object to its PolicyServer.
pub const POLICY_SERVER_LABEL: &str = "kubewarden/policy-server";

/// Label stamped on owned webhook configurations, values `cluster` or `namespace`.
pub const POLICY_SCOPE_LABEL: &str = "kubewarden/policy-scope";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kubewarden-controller";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const COMPONENT_VALUE: &str = "policy-server";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Keys inside the per-server config map.
pub const POLICIES_CONFIG_KEY: &str = "policies.yml";
pub const SOURCES_CONFIG_KEY: &str = "sources.yml";
pub const VERIFICATION_CONFIG_KEY: &str = "verification.yml";

/// Port the policy-server container listens on; the Service exposes 443.
pub const POLICY_SERVER_PORT: i32 = 8443;
pub const POLICY_SERVER_SERVICE_PORT: i32 = 443;

/// Resource name prefix for everything owned by a PolicyServer.
pub fn policy_server_resource_name(policy_server_name: &str) -> String {
    format!("policy-server-{policy_server_name}")
}

/// Name of the per-server secret holding `tls.crt` / `tls.key`.
pub fn policy_server_cert_secret_name(policy_server_name: &str) -> String {
    format!("policy-server-{policy_server_name}-attrs")
}

/// In-cluster DNS name the serving certificate must carry.
pub fn policy_server_dns_name(policy_server_name: &str, namespace: &str) -> String {
    format!("policy-server-{policy_server_name}.{namespace}.svc")
}

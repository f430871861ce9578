use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cli::{parse_bind_address, RunArgs};
use kubewarden_controller::certs::{generate_ca, generate_cert, CA_VALIDITY_DAYS, CERT_VALIDITY_DAYS};
use kubewarden_controller::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    PolicyServer,
};
use kubewarden_controller::index::PolicyIndex;
use kubewarden_controller::policy::PolicyKind;
use kubewarden_controller::reconciler::{self, Context};
use kubewarden_controller::resources::TelemetryConfig;
use kubewarden_controller::webhooks::{self, WebhookState};
use kubewarden_controller::FIELD_MANAGER;

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kubewarden_controller_reconcile_total",
            "Total reconciliation cycles per resource kind",
        ),
        &["kind"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kubewarden_controller_reconcile_errors_total",
            "Total reconciliation errors per resource kind",
        ),
        &["kind"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= LEADER ELECTION ============================= */

const LEASE_NAME: &str = "kubewarden-controller-leader-election-lock";
const LEASE_DURATION_SECONDS: i32 = 15;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(10);
const LEASE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/* ============================= ENTRY ============================= */

pub async fn run(args: RunArgs) -> Result<()> {
    println!("Starting kubewarden-controller...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let metrics_addr = parse_bind_address(&args.metrics_bind_address)?;
    let health_addr = parse_bind_address(&args.health_probe_bind_address)?;
    let webhook_addr = parse_bind_address(&args.webhook_bind_address)?;
    let (tls_cert, tls_key) = ensure_webhook_certs(&args.webhook_cert_dir)?;

    let index = Arc::new(PolicyIndex::new());
    let ctx = Arc::new(Context {
        client: client.clone(),
        deployments_namespace: args.deployments_namespace.clone(),
        always_accept_admission_reviews_on_deployments_namespace: args
            .always_accept_admission_reviews_on_deployments_namespace,
        telemetry: TelemetryConfig {
            enable_metrics: args.enable_metrics,
            enable_tracing: args.enable_tracing,
            otlp_endpoint: args.opentelemetry_endpoint.clone(),
        },
        index: index.clone(),
    });

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);

    println!("  CRD watch ................... policies.kubewarden.io/v1 (5 kinds)");
    println!("  Deployments namespace ....... {}", args.deployments_namespace);
    println!("  Webhook server .............. https://{webhook_addr}");
    println!("  Health probes ............... http://{health_addr}");
    if args.enable_metrics {
        println!("  Metrics server .............. http://{metrics_addr}");
    }
    println!();
    println!("Controller running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    if args.leader_elect {
        let identity = leader_identity();
        println!("Waiting for leadership lease ({identity})...");
        acquire_leadership(&client, &args.deployments_namespace, &identity).await?;
        info!(identity = %identity, "leadership_acquired");

        let renew_client = client.clone();
        let renew_namespace = args.deployments_namespace.clone();
        tokio::spawn(async move {
            renew_leadership(renew_client, renew_namespace, identity).await;
        });
    }

    info!("controller_started");

    let ready = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Health probes always run; the metrics listener only when requested.
    let health_handle = tokio::spawn(start_http_server(
        build_health_router(ready.clone()),
        health_addr,
        shutdown_tx.subscribe(),
    ));
    let metrics_handle = args.enable_metrics.then(|| {
        tokio::spawn(start_http_server(
            build_metrics_router(),
            metrics_addr,
            shutdown_tx.subscribe(),
        ))
    });

    let webhook_state = WebhookState {
        client: Some(client.clone()),
        deployments_namespace: args.deployments_namespace.clone(),
        default_policy_server: args.default_policy_server.clone(),
    };
    let webhook_shutdown = shutdown_tx.subscribe();
    let webhook_handle = tokio::spawn(async move {
        webhooks::serve(
            webhook_state,
            webhook_addr,
            &tls_cert,
            &tls_key,
            webhook_shutdown,
        )
        .await
    });

    let controllers = build_controllers(&client, &ctx, &index, ready.clone());

    tokio::select! {
        _ = controllers => {
            info!("controller_streams_ended");
            println!("\nController streams ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping controller...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = health_handle.await?;
    if let Some(handle) = metrics_handle {
        let _ = handle.await?;
    }
    let _ = webhook_handle.await?;

    info!("controller_stopped");
    println!("Controller stopped.");
    Ok(())
}

/* ============================= CONTROLLERS ============================= */

/// Wire the five controllers: the PolicyServer controller owns its child
/// objects and watches every policy kind; each policy controller watches
/// PolicyServer events through the reverse index.
async fn build_controllers(
    client: &Client,
    ctx: &Arc<Context>,
    index: &Arc<PolicyIndex>,
    ready: Arc<AtomicBool>,
) {
    let namespace = ctx.deployments_namespace.clone();

    let policy_server_controller = Controller::new(
        Api::<PolicyServer>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(
        Api::<Deployment>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .owns(
        Api::<Service>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .owns(
        Api::<ConfigMap>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .owns(
        Api::<Secret>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .owns(
        Api::<PodDisruptionBudget>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .watches(
        Api::<AdmissionPolicy>::all(client.clone()),
        watcher::Config::default(),
        |policy: AdmissionPolicy| Some(ObjectRef::new(&policy.spec.policy_server)),
    )
    .watches(
        Api::<ClusterAdmissionPolicy>::all(client.clone()),
        watcher::Config::default(),
        |policy: ClusterAdmissionPolicy| Some(ObjectRef::new(&policy.spec.policy_server)),
    )
    .watches(
        Api::<AdmissionPolicyGroup>::all(client.clone()),
        watcher::Config::default(),
        |policy: AdmissionPolicyGroup| Some(ObjectRef::new(&policy.spec.policy_server)),
    )
    .watches(
        Api::<ClusterAdmissionPolicyGroup>::all(client.clone()),
        watcher::Config::default(),
        |policy: ClusterAdmissionPolicyGroup| Some(ObjectRef::new(&policy.spec.policy_server)),
    )
    .run(
        reconciler::policy_server::reconcile,
        reconciler::policy_server::error_policy,
        ctx.clone(),
    )
    .for_each({
        let ready = ready.clone();
        move |result| {
            ready.store(true, Ordering::Relaxed);
            async move { count_dispatch("PolicyServer", result.map(|_| ()).map_err(|e| e.to_string())) }
        }
    });

    let admission_policy_controller = Controller::new(
        Api::<AdmissionPolicy>::all(client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<PolicyServer>::all(client.clone()),
        watcher::Config::default(),
        bound_policies_mapper::<AdmissionPolicy>(index.clone(), PolicyKind::AdmissionPolicy),
    )
    .run(
        reconciler::policy::reconcile_admission_policy,
        reconciler::policy::error_policy,
        ctx.clone(),
    )
    .for_each(|result| async move {
        count_dispatch("AdmissionPolicy", result.map(|_| ()).map_err(|e| e.to_string()))
    });

    let cluster_admission_policy_controller = Controller::new(
        Api::<ClusterAdmissionPolicy>::all(client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<PolicyServer>::all(client.clone()),
        watcher::Config::default(),
        bound_policies_mapper::<ClusterAdmissionPolicy>(
            index.clone(),
            PolicyKind::ClusterAdmissionPolicy,
        ),
    )
    .run(
        reconciler::policy::reconcile_cluster_admission_policy,
        reconciler::policy::error_policy,
        ctx.clone(),
    )
    .for_each(|result| async move {
        count_dispatch(
            "ClusterAdmissionPolicy",
            result.map(|_| ()).map_err(|e| e.to_string()),
        )
    });

    let admission_policy_group_controller = Controller::new(
        Api::<AdmissionPolicyGroup>::all(client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<PolicyServer>::all(client.clone()),
        watcher::Config::default(),
        bound_policies_mapper::<AdmissionPolicyGroup>(
            index.clone(),
            PolicyKind::AdmissionPolicyGroup,
        ),
    )
    .run(
        reconciler::policy::reconcile_admission_policy_group,
        reconciler::policy::error_policy,
        ctx.clone(),
    )
    .for_each(|result| async move {
        count_dispatch(
            "AdmissionPolicyGroup",
            result.map(|_| ()).map_err(|e| e.to_string()),
        )
    });

    let cluster_admission_policy_group_controller = Controller::new(
        Api::<ClusterAdmissionPolicyGroup>::all(client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<PolicyServer>::all(client.clone()),
        watcher::Config::default(),
        bound_policies_mapper::<ClusterAdmissionPolicyGroup>(
            index.clone(),
            PolicyKind::ClusterAdmissionPolicyGroup,
        ),
    )
    .run(
        reconciler::policy::reconcile_cluster_admission_policy_group,
        reconciler::policy::error_policy,
        ctx.clone(),
    )
    .for_each(|result| async move {
        count_dispatch(
            "ClusterAdmissionPolicyGroup",
            result.map(|_| ()).map_err(|e| e.to_string()),
        )
    });

    futures::join!(
        policy_server_controller,
        admission_policy_controller,
        cluster_admission_policy_controller,
        admission_policy_group_controller,
        cluster_admission_policy_group_controller,
    );
}

/// Mapper turning a PolicyServer event into the keys of the bound policies
/// of one kind, via the process-wide reverse index.
fn bound_policies_mapper<K>(
    index: Arc<PolicyIndex>,
    kind: PolicyKind,
) -> impl Fn(PolicyServer) -> Vec<ObjectRef<K>>
where
    K: kube::Resource<DynamicType = ()>,
{
    move |policy_server: PolicyServer| {
        let name = policy_server.name_any();
        index
            .policies_bound_to(&name)
            .into_iter()
            .filter(|key| key.kind == kind)
            .map(|key| {
                let object_ref = ObjectRef::new(&key.name);
                match key.namespace {
                    Some(namespace) => object_ref.within(&namespace),
                    None => object_ref,
                }
            })
            .collect()
    }
}

fn count_dispatch(kind: &str, result: Result<(), String>) {
    RECONCILE_TOTAL.with_label_values(&[kind]).inc();
    if let Err(error) = result {
        RECONCILE_ERRORS.with_label_values(&[kind]).inc();
        warn!(kind = %kind, error = %error, "reconcile_dispatch_error");
    }
}

/* ============================= WEBHOOK CERTS ============================= */

/// Locate the webhook serving certificate. In development mode a self-signed
/// pair is generated for the advertised host; in-cluster the files are
/// mounted by the deployment.
fn ensure_webhook_certs(cert_dir: &str) -> Result<(String, String)> {
    let dir = PathBuf::from(cert_dir);
    let cert_path = dir.join("tls.crt");
    let key_path = dir.join("tls.key");

    if cert_path.exists() && key_path.exists() {
        return Ok((
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        ));
    }

    if std::env::var("KUBEWARDEN_DEVELOPMENT_MODE").is_err() {
        anyhow::bail!(
            "webhook TLS material not found in {cert_dir}; mount tls.crt/tls.key or set KUBEWARDEN_DEVELOPMENT_MODE=1"
        );
    }

    let host =
        std::env::var("WEBHOOK_HOST_ADVERTISE").unwrap_or_else(|_| "localhost".to_string());
    let now = time::OffsetDateTime::now_utc();
    let ca = generate_ca(now, now + time::Duration::days(CA_VALIDITY_DAYS))?;
    let cert = generate_cert(&ca, now, now + time::Duration::days(CERT_VALIDITY_DAYS), &host)?;

    std::fs::create_dir_all(&dir).context("Failed to create webhook cert directory")?;
    std::fs::write(&cert_path, &cert.cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &cert.key_pem).context("Failed to write tls.key")?;
    std::fs::write(dir.join("ca.crt"), &ca.cert_pem).context("Failed to write ca.crt")?;
    info!(host = %host, dir = %dir.display(), "development_webhook_certs_generated");

    Ok((
        cert_path.to_string_lossy().into_owned(),
        key_path.to_string_lossy().into_owned(),
    ))
}

/* ============================= LEADER ELECTION ============================= */

fn leader_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "kubewarden-controller".to_string());
    format!("{host}-{}", std::process::id())
}

fn desired_lease(identity: &str) -> Lease {
    let now = MicroTime(chrono::Utc::now());
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..Default::default()
        }),
    }
}

fn lease_is_free_for(lease: &Lease, identity: &str) -> bool {
    let Some(spec) = &lease.spec else { return true };
    match spec.holder_identity.as_deref() {
        None => true,
        Some(holder) if holder == identity => true,
        Some(_) => {
            let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS);
            match &spec.renew_time {
                None => true,
                Some(renew_time) => {
                    let expiry = renew_time.0 + chrono::Duration::seconds(duration as i64);
                    expiry < chrono::Utc::now()
                }
            }
        }
    }
}

/// Block until this process holds the leadership lease.
async fn acquire_leadership(client: &Client, namespace: &str, identity: &str) -> Result<()> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), namespace);

    loop {
        match leases.get_opt(LEASE_NAME).await? {
            None => match leases.create(&Default::default(), &desired_lease(identity)).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(e) => return Err(e.into()),
            },
            Some(existing) if lease_is_free_for(&existing, identity) => {
                let mut lease = desired_lease(identity);
                lease.metadata.resource_version = existing.resource_version();
                match leases.replace(LEASE_NAME, &Default::default(), &lease).await {
                    Ok(_) => return Ok(()),
                    Err(kube::Error::Api(e)) if e.code == 409 => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Some(_) => {}
        }
        tokio::time::sleep(LEASE_RETRY_INTERVAL).await;
    }
}

/// Keep the lease fresh; losing it is logged but does not kill the process,
/// the next renew attempt re-acquires.
async fn renew_leadership(client: Client, namespace: String, identity: String) {
    let leases: Api<Lease> = Api::namespaced(client, &namespace);
    loop {
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": identity,
                "renewTime": MicroTime(chrono::Utc::now()),
            }
        });
        if let Err(e) = leases
            .patch(
                LEASE_NAME,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            warn!(error = %e, "lease_renewal_failed");
        }
    }
}

/* ============================= HTTP SERVERS ============================= */

pub(crate) fn build_health_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(Ordering::Relaxed) {
                        (StatusCode::OK, "READY")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
                    }
                }
            }),
        )
}

pub(crate) fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn start_http_server(
    router: Router,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */

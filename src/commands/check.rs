use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::ListParams;
use kube::{Api, Client};

use kubewarden_controller::crd::{ClusterAdmissionPolicy, PolicyServer};

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    let version = match client.apiserver_version().await {
        Ok(v) => {
            println!("OK (v{}.{})", v.major, v.minor);
            Some(v)
        }
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    // 3. Policy CRDs installed
    print!("  PolicyServer CRD ............ ");
    let servers: Api<PolicyServer> = Api::all(client.clone());
    match servers.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} found)", list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    print!("  ClusterAdmissionPolicy CRD .. ");
    let policies: Api<ClusterAdmissionPolicy> = Api::all(client.clone());
    match policies.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} found)", list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. Permissions the reconcilers depend on
    print!("  List deployments permission . ");
    let deployments: Api<Deployment> = Api::all(client.clone());
    match deployments.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    print!("  Webhook configurations ...... ");
    let webhooks: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    match webhooks.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    if let Some(v) = version {
        println!("\n  Kubernetes version: {}.{}", v.major, v.minor);
    }

    println!("\nAll checks completed.");
    Ok(())
}

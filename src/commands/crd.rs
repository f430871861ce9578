use anyhow::Result;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use kubewarden_controller::crd::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    PolicyServer,
};

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        PolicyServer::crd(),
        AdmissionPolicy::crd(),
        ClusterAdmissionPolicy::crd(),
        AdmissionPolicyGroup::crd(),
        ClusterAdmissionPolicyGroup::crd(),
    ]
}

/// Print every CRD YAML document to stdout for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    for crd in all_crds() {
        let yaml = serde_yaml::to_string(&crd)?;
        println!("---");
        println!("{yaml}");
    }
    Ok(())
}

/// Apply the CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => {
                println!("CRD '{name}' installed successfully");
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists — skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_five_crds_generated() {
        let crds = all_crds();
        assert_eq!(crds.len(), 5);
        let kinds: Vec<&str> = crds.iter().map(|c| c.spec.names.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "PolicyServer",
                "AdmissionPolicy",
                "ClusterAdmissionPolicy",
                "AdmissionPolicyGroup",
                "ClusterAdmissionPolicyGroup"
            ]
        );
    }

    #[test]
    fn test_crds_share_the_api_group() {
        for crd in all_crds() {
            assert_eq!(crd.spec.group, "policies.kubewarden.io");
        }
    }
}

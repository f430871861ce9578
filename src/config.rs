use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::MatchCondition;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crd::{ContextAwareResource, PolicyMode, PolicyServerSpec};
use crate::errors::Result;
use crate::policy::Policy;

/* ============================= POLICY ENTRIES ============================= */

/// One member of a policy group as written into `policies.yml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberConfig {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_aware_resources: Option<Vec<ContextAwareResource>>,
}

/// One policy as written into `policies.yml`, keyed by its unique name.
///
/// Single policies fill `url`/`allowedToMutate`/`settings`; groups fill
/// `expression`/`message`/`members`. This is the fingerprint the policy
/// reconciler compares against the spec to decide whether the server has
/// observed the latest definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfigEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_to_mutate: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_aware_resources: Option<Vec<ContextAwareResource>>,

    pub policy_mode: PolicyMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<BTreeMap<String, MemberConfig>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,
}

fn non_empty_settings(value: &serde_json::Value) -> Option<serde_json::Value> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Object(map) if map.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// Build the config entry for one policy.
pub fn build_entry(policy: &Policy) -> PolicyConfigEntry {
    let mut entry = PolicyConfigEntry {
        url: None,
        allowed_to_mutate: None,
        settings: None,
        context_aware_resources: None,
        policy_mode: policy.mode(),
        expression: None,
        message: None,
        members: None,
        match_conditions: policy.match_conditions().to_vec(),
    };

    match policy {
        Policy::Admission(p) => {
            entry.url = Some(p.spec.module.clone());
            entry.allowed_to_mutate = Some(p.spec.mutating);
            entry.settings = non_empty_settings(&p.spec.settings.0);
        }
        Policy::ClusterAdmission(p) => {
            entry.url = Some(p.spec.module.clone());
            entry.allowed_to_mutate = Some(p.spec.mutating);
            entry.settings = non_empty_settings(&p.spec.settings.0);
            entry.context_aware_resources = p.spec.context_aware_resources.clone();
        }
        Policy::Group(p) => {
            entry.expression = Some(p.spec.expression.clone());
            entry.message = Some(p.spec.message.clone());
            entry.members = Some(
                p.spec
                    .policies
                    .iter()
                    .map(|(name, member)| {
                        (
                            name.clone(),
                            MemberConfig {
                                url: member.module.clone(),
                                settings: non_empty_settings(&member.settings.0),
                                context_aware_resources: None,
                            },
                        )
                    })
                    .collect(),
            );
        }
        Policy::ClusterGroup(p) => {
            entry.expression = Some(p.spec.expression.clone());
            entry.message = Some(p.spec.message.clone());
            entry.members = Some(
                p.spec
                    .policies
                    .iter()
                    .map(|(name, member)| {
                        (
                            name.clone(),
                            MemberConfig {
                                url: member.module.clone(),
                                settings: non_empty_settings(&member.settings.0),
                                context_aware_resources: member.context_aware_resources.clone(),
                            },
                        )
                    })
                    .collect(),
            );
        }
    }

    entry
}

/// Build the whole `policies.yml` map, keyed by unique name.
pub fn build_policies_config(policies: &[Policy]) -> BTreeMap<String, PolicyConfigEntry> {
    policies
        .iter()
        .map(|p| (p.unique_name(), build_entry(p)))
        .collect()
}

pub fn serialize_policies_config(
    config: &BTreeMap<String, PolicyConfigEntry>,
) -> Result<String> {
    Ok(serde_json::to_string(config)?)
}

/// Parse an observed `policies.yml` and return the entry stored under
/// `unique_name`, if any.
pub fn observed_entry(
    policies_config: &str,
    unique_name: &str,
) -> Option<PolicyConfigEntry> {
    let map: BTreeMap<String, PolicyConfigEntry> =
        serde_json::from_str(policies_config).ok()?;
    map.get(unique_name).cloned()
}

/* ============================= SOURCES ============================= */

/// Contents of `sources.yml`: registry reachability and trust anchors the
/// policy server uses when pulling modules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SourcesConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_sources: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_authorities: BTreeMap<String, Vec<String>>,
}

pub fn build_sources_config(spec: &PolicyServerSpec) -> SourcesConfig {
    SourcesConfig {
        insecure_sources: spec.insecure_sources.clone().unwrap_or_default(),
        source_authorities: spec.source_authorities.clone().unwrap_or_default(),
    }
}

pub fn serialize_sources_config(config: &SourcesConfig) -> Result<String> {
    Ok(serde_json::to_string(config)?)
}

/* ============================= HASH ============================= */

/// Content hash stamped onto the deployment pod template, so any config
/// change rolls the policy-server pods.
pub fn config_hash(policies: &str, sources: &str, verification: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policies.as_bytes());
    hasher.update(sources.as_bytes());
    hasher.update(verification.as_bytes());
    format!("{:x}", hasher.finalize())
}

/* ============================= TESTS ============================= */

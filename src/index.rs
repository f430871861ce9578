use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::policy::{Policy, PolicyKind};

/* ============================= KEYS ============================= */

/// Cache key of a policy object: kind plus namespaced name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub kind: PolicyKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl PolicyKey {
    pub fn of(policy: &Policy) -> Self {
        PolicyKey {
            kind: policy.kind(),
            namespace: policy.namespace(),
            name: policy.name(),
        }
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.as_str(), ns, self.name),
            None => write!(f, "{}/{}", self.kind.as_str(), self.name),
        }
    }
}

/* ============================= INDEX ============================= */

/// Process-wide reverse index from PolicyServer name to the policies bound
/// to it.
///
/// Policy reconcilers upsert their object on every pass and remove it on
/// finalize; the PolicyServer reconciler and the cross-kind watch mappers
/// read it. An entry moves between buckets atomically when a policy is
/// rebound (which the admission webhook forbids, but the index does not rely
/// on that).
#[derive(Default)]
pub struct PolicyIndex {
    by_server: RwLock<HashMap<String, HashSet<PolicyKey>>>,
}

impl PolicyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `policy` is bound to its current policy server, dropping
    /// any stale binding under another server name.
    pub fn upsert(&self, policy: &Policy) {
        let key = PolicyKey::of(policy);
        let server = policy.policy_server().to_string();
        let mut map = self.by_server.write().expect("index lock poisoned");
        for bucket in map.values_mut() {
            bucket.remove(&key);
        }
        map.entry(server).or_default().insert(key);
        map.retain(|_, bucket| !bucket.is_empty());
    }

    pub fn remove(&self, key: &PolicyKey) {
        let mut map = self.by_server.write().expect("index lock poisoned");
        for bucket in map.values_mut() {
            bucket.remove(key);
        }
        map.retain(|_, bucket| !bucket.is_empty());
    }

    /// Every policy currently bound to `policy_server`.
    pub fn policies_bound_to(&self, policy_server: &str) -> Vec<PolicyKey> {
        let map = self.by_server.read().expect("index lock poisoned");
        map.get(policy_server)
            .map(|bucket| {
                let mut keys: Vec<_> = bucket.iter().cloned().collect();
                keys.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
                keys
            })
            .unwrap_or_default()
    }

    pub fn has_policies_bound_to(&self, policy_server: &str) -> bool {
        let map = self.by_server.read().expect("index lock poisoned");
        map.get(policy_server).is_some_and(|b| !b.is_empty())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AdmissionPolicy, AdmissionPolicySpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn policy(name: &str, namespace: &str, server: &str) -> Policy {
        Policy::Admission(AdmissionPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: AdmissionPolicySpec {
                policy_server: server.to_string(),
                ..Default::default()
            },
            status: None,
        })
    }

    #[test]
    fn test_upsert_and_lookup() {
        let index = PolicyIndex::new();
        index.upsert(&policy("a", "ns1", "default"));
        index.upsert(&policy("b", "ns1", "default"));
        index.upsert(&policy("c", "ns2", "tenant"));

        assert_eq!(index.policies_bound_to("default").len(), 2);
        assert_eq!(index.policies_bound_to("tenant").len(), 1);
        assert!(index.policies_bound_to("missing").is_empty());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let index = PolicyIndex::new();
        index.upsert(&policy("a", "ns1", "default"));
        index.upsert(&policy("a", "ns1", "default"));
        assert_eq!(index.policies_bound_to("default").len(), 1);
    }

    #[test]
    fn test_rebinding_moves_the_entry() {
        let index = PolicyIndex::new();
        index.upsert(&policy("a", "ns1", "default"));
        index.upsert(&policy("a", "ns1", "tenant"));

        assert!(index.policies_bound_to("default").is_empty());
        assert_eq!(index.policies_bound_to("tenant").len(), 1);
    }

    #[test]
    fn test_remove_clears_binding() {
        let index = PolicyIndex::new();
        let p = policy("a", "ns1", "default");
        index.upsert(&p);
        index.remove(&PolicyKey::of(&p));

        assert!(!index.has_policies_bound_to("default"));
    }

    #[test]
    fn test_lookup_is_sorted() {
        let index = PolicyIndex::new();
        index.upsert(&policy("zeta", "ns1", "default"));
        index.upsert(&policy("alpha", "ns1", "default"));

        let names: Vec<String> = index
            .policies_bound_to("default")
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}

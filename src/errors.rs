use thiserror::Error;

/// Errors surfaced by reconcilers and the webhook server.
///
/// Everything here is retryable from the work queue's point of view except
/// where the reconciler explicitly downgrades it to a status condition.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("policy server {0} still has policies bound to it")]
    PolicyServerStillInUse(String),

    #[error("{0}")]
    Reconciliation(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Errors of a reconcile pass
use crate::provisioning;
use cluster_core::{SecretRef, ValidationError};
use std::time::Duration;
use thiserror::Error;

/// Why a reconcile pass failed
#[derive(Debug, Error)]
pub enum Error {
    /// The spec cannot be provisioned as written
    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] ValidationError),

    /// The credential Secret does not exist
    #[error("credential secret {0} not found")]
    CredentialNotFound(SecretRef),

    /// The credential Secret exists but has no usable `token` key
    #[error("credential secret {0} has no usable `token` key")]
    CredentialMissingToken(SecretRef),

    /// The credential Secret could not be read
    #[error("failed to read credential secret {secret}: {source}")]
    CredentialRead {
        /// The Secret being read
        secret: SecretRef,
        /// What the apiserver said
        #[source]
        source: kube::Error,
    },

    /// A call to the provisioning API failed
    #[error("provisioning API error: {0}")]
    Provisioning(#[from] provisioning::Error),

    /// The remote cluster did not report itself ready in time
    #[error("cluster {cluster_id} not running after {waited:?}, last reported state {last_state:?}")]
    NotReady {
        /// Remote identifier of the cluster
        cluster_id: String,
        /// How long the pass polled
        waited: Duration,
        /// The last state the provider reported
        last_state: String,
    },

    /// Several remote clusters carry the display name of an object being torn down
    #[error("{count} remote clusters are named {name:?}, refusing to pick one to delete")]
    AmbiguousName {
        /// The display name
        name: String,
        /// How many clusters carry it
        count: usize,
    },

    /// A write to the apiserver failed
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Whether retrying the same object without a spec change cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec(_)
                | Error::CredentialNotFound(_)
                | Error::CredentialMissingToken(_)
                | Error::AmbiguousName { .. }
        )
    }
}

/// Result alias for reconcile operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

//! The remote managed-Kubernetes provisioning API
//!
//! [`Provisioner`] is the seam the reconciler talks to; [`DigitalOcean`] is the production
//! implementation.
use crate::credentials::Credential;
use async_trait::async_trait;
use cluster_core::{NodePool, ValidatedSpec};
use thiserror::Error;

mod digitalocean;
pub use digitalocean::DigitalOcean;

/// State string the provider reports for a ready cluster
pub const RUNNING: &str = "running";

/// Failures talking to the provisioning API
#[derive(Debug, Error)]
pub enum Error {
    /// The request did not complete or the response did not decode
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The API answered with an error status
    #[error("API returned {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error message from the response body
        message: String,
    },
}

/// Parameters of a cluster to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Display name
    pub name: String,
    /// Region slug
    pub region: String,
    /// Kubernetes version slug
    pub version: String,
    /// The single node pool to create
    pub node_pool: NodePool,
}

impl From<&ValidatedSpec> for CreateRequest {
    fn from(spec: &ValidatedSpec) -> Self {
        Self {
            name: spec.name.clone(),
            region: spec.region.clone(),
            version: spec.version.clone(),
            node_pool: spec.node_pool.clone(),
        }
    }
}

/// A cluster as returned by [`Provisioner::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCluster {
    /// Provider-assigned identifier
    pub id: String,
    /// Display name
    pub name: String,
}

/// Outcome of a successful [`Provisioner::delete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deleted {
    /// The cluster existed and deletion was accepted
    Removed,
    /// The provider did not know the cluster
    AlreadyGone,
}

/// Lifecycle operations on remote clusters
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Requests a new cluster, returning its identifier
    async fn create(&self, credential: &Credential, request: &CreateRequest) -> Result<String, Error>;

    /// The provider's state string for a cluster, [`RUNNING`] once it is ready
    async fn get_status(&self, credential: &Credential, id: &str) -> Result<String, Error>;

    /// Deletes a cluster; an unknown identifier is not an error
    async fn delete(&self, credential: &Credential, id: &str) -> Result<Deleted, Error>;

    /// All clusters visible with `credential`
    async fn list(&self, credential: &Credential) -> Result<Vec<RemoteCluster>, Error>;

    /// Connection material for a ready cluster, if the provider offers it
    async fn kubeconfig(&self, _credential: &Credential, _id: &str) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

//! Operator provisioning managed Kubernetes clusters from `ClusterRequest` objects
//!
//! The binary wires a [`cluster_runtime::Controller`] to [`reconciler::reconcile`]. The
//! reconciler only talks to the outside world through three seams, each with a production
//! implementation:
//!
//! - [`status::ClusterApi`], implemented by [`status::KubeClusterApi`]
//! - [`provisioning::Provisioner`], implemented by [`provisioning::DigitalOcean`]
//! - [`credentials::CredentialStore`], implemented by [`credentials::SecretCredentials`]

pub mod config;
pub mod credentials;
mod error;
pub mod provisioning;
pub mod reconciler;
pub mod status;

pub use config::OperatorConfig;
pub use error::{Error, Result};
pub use reconciler::{error_policy, reconcile, Context, Readiness};

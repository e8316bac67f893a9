//! Types for the `ClusterRequest` custom resource
//!
//! A `ClusterRequest` declares a remote managed-Kubernetes cluster. The spec is
//! owned by whoever creates the object; the status is owned by the operator
//! and only ever written through the status subresource.

pub mod crd;
pub use crd::{ClusterRequest, ClusterRequestSpec, ClusterStatus, NodePool, Phase, CLEANUP_FINALIZER};

pub mod validation;
pub use validation::{SecretRef, ValidatedSpec, ValidationError};

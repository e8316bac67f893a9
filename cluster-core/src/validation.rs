//! Typed validation of a [`ClusterRequestSpec`]
//!
//! The schema enforces field types; this layer enforces the remaining rules a
//! provisioning call depends on, so the reconciler only ever sees a spec that
//! can be turned into a create request.
use crate::crd::{ClusterRequestSpec, NodePool};
use std::fmt;
use thiserror::Error;

/// Reasons a spec cannot be provisioned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required string field is empty
    #[error("spec.{0} must not be empty")]
    EmptyField(&'static str),
    /// No node pool was declared
    #[error("spec.nodePools must declare at least one pool")]
    NoNodePools,
    /// A node pool is missing a name or size, or has zero nodes
    #[error("spec.nodePools[{index}] is invalid: {reason}")]
    InvalidNodePool {
        /// Position of the pool in `spec.nodePools`
        index: usize,
        /// What is wrong with it
        reason: &'static str,
    },
    /// The token secret reference does not parse
    #[error("spec.tokenSecret {0:?} is not of the form `namespace/name` or `name`")]
    InvalidSecretRef(String),
}

/// Location of the Secret holding the provider token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    /// Namespace of the Secret
    pub namespace: String,
    /// Name of the Secret
    pub name: String,
}

impl SecretRef {
    /// Parses `namespace/name`, or `name` relative to `default_namespace`
    pub fn parse(reference: &str, default_namespace: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidSecretRef(reference.to_string());
        let (namespace, name) = match reference.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (default_namespace, reference),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A spec that passed validation
///
/// Only the first node pool is carried; additional pools are accepted by the
/// schema but not provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSpec {
    /// Remote cluster display name
    pub name: String,
    /// Provider region slug
    pub region: String,
    /// Provider version slug
    pub version: String,
    /// Where the provider token lives
    pub credentials: SecretRef,
    /// The pool to provision
    pub node_pool: NodePool,
}

impl ClusterRequestSpec {
    /// Checks the spec and resolves the token secret against `namespace`
    pub fn validate(&self, namespace: &str) -> Result<ValidatedSpec, ValidationError> {
        for (field, value) in [
            ("name", &self.name),
            ("region", &self.region),
            ("version", &self.version),
            ("tokenSecret", &self.token_secret),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field));
            }
        }
        let credentials = SecretRef::parse(self.token_secret.trim(), namespace)?;

        let pool = self.node_pools.first().ok_or(ValidationError::NoNodePools)?;
        let invalid_pool = |reason| ValidationError::InvalidNodePool { index: 0, reason };
        if pool.name.trim().is_empty() {
            return Err(invalid_pool("name must not be empty"));
        }
        if pool.size.trim().is_empty() {
            return Err(invalid_pool("size must not be empty"));
        }
        if pool.count == 0 {
            return Err(invalid_pool("count must be at least 1"));
        }

        Ok(ValidatedSpec {
            name: self.name.clone(),
            region: self.region.clone(),
            version: self.version.clone(),
            credentials,
            node_pool: pool.clone(),
        })
    }
}

//! The `ClusterRequest` custom resource
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finalizer registered on every converged `ClusterRequest`
///
/// It holds the object in the store until the remote cluster has been torn down.
pub const CLEANUP_FINALIZER: &str = "clusters.kudos.dev/cleanup";

/// Desired state of a remote managed-Kubernetes cluster
///
/// The spec is input only: reconciliation never writes to it.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "clusters.kudos.dev",
    version = "v1alpha1",
    kind = "ClusterRequest",
    namespaced,
    status = "ClusterStatus",
    shortname = "cr",
    printcolumn = r#"{"name":"ClusterID", "type":"string", "jsonPath":".status.clusterId"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequestSpec {
    /// Display name of the remote cluster
    pub name: String,
    /// Provider region slug, e.g. `nyc1`
    pub region: String,
    /// Provider Kubernetes version slug, e.g. `1.30`
    pub version: String,
    /// Secret holding the provider token, as `namespace/name` or `name`
    pub token_secret: String,
    /// Node pools; only the first one is provisioned
    pub node_pools: Vec<NodePool>,
}

/// A group of identically sized worker nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct NodePool {
    /// Pool name
    pub name: String,
    /// Provider machine size slug, e.g. `s-2vcpu-4gb`
    pub size: String,
    /// Number of nodes
    pub count: u32,
}

/// Observed state, written only through the status subresource
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Lifecycle phase of the remote cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Provider-assigned cluster identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    /// Connection material for the remote cluster, opaque to the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

/// Lifecycle phase recorded in [`ClusterStatus::phase`]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// The remote cluster has been requested and is being provisioned
    Creating,
    /// The remote cluster reported itself ready
    Running,
}

impl Phase {
    /// Wire representation of the phase
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Creating => "creating",
            Phase::Running => "running",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ClusterStatus {
    /// Status for a freshly requested cluster
    pub fn creating(cluster_id: impl Into<String>) -> Self {
        Self {
            phase: Some(Phase::Creating),
            cluster_id: Some(cluster_id.into()),
            kubeconfig: None,
        }
    }

    /// Status for a cluster that reported itself ready
    pub fn running(cluster_id: impl Into<String>, kubeconfig: Option<String>) -> Self {
        Self {
            phase: Some(Phase::Running),
            cluster_id: Some(cluster_id.into()),
            kubeconfig,
        }
    }

    /// The recorded remote identifier, ignoring empty strings
    pub fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref().filter(|id| !id.is_empty())
    }
}

impl ClusterRequest {
    /// The recorded remote identifier, if status carries a non-empty one
    pub fn cluster_id(&self) -> Option<&str> {
        self.status.as_ref().and_then(ClusterStatus::cluster_id)
    }

    /// The recorded phase, if any
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Whether the cleanup finalizer is registered
    pub fn has_cleanup_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
    }
}

//! Writes to `ClusterRequest` objects: status and the cleanup finalizer
use async_trait::async_trait;
use cluster_core::{ClusterRequest, ClusterStatus, Phase, CLEANUP_FINALIZER};
use cluster_runtime::ObjectKey;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, warn};

/// The control-plane operations the reconciler needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fresh read of an object, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> kube::Result<Option<ClusterRequest>>;

    /// Replaces the status through the status subresource
    async fn patch_status(&self, key: &ObjectKey, status: &ClusterStatus) -> kube::Result<()>;

    /// Registers [`CLEANUP_FINALIZER`] on `obj`
    async fn add_finalizer(&self, obj: &ClusterRequest) -> kube::Result<()>;

    /// Removes [`CLEANUP_FINALIZER`] from `obj`, leaving other finalizers alone
    async fn remove_finalizer(&self, obj: &ClusterRequest) -> kube::Result<()>;
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// [`ClusterApi`] against the apiserver
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Talks to the apiserver through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<ClusterRequest> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    /// Merge patches the finalizer list, guarded by the resource version we read it at
    async fn set_finalizers(&self, obj: &ClusterRequest, finalizers: Vec<String>) -> kube::Result<()> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": obj.resource_version(),
            }
        });
        self.api(obj.namespace().as_deref())
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(&self, key: &ObjectKey) -> kube::Result<Option<ClusterRequest>> {
        self.api(key.namespace.as_deref()).get_opt(&key.name).await
    }

    async fn patch_status(&self, key: &ObjectKey, status: &ClusterStatus) -> kube::Result<()> {
        let patch = json!({ "status": status });
        self.api(key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, obj: &ClusterRequest) -> kube::Result<()> {
        if obj.has_cleanup_finalizer() {
            return Ok(());
        }
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(CLEANUP_FINALIZER.to_string());
        self.set_finalizers(obj, finalizers).await
    }

    async fn remove_finalizer(&self, obj: &ClusterRequest) -> kube::Result<()> {
        if !obj.has_cleanup_finalizer() {
            return Ok(());
        }
        let finalizers = obj
            .finalizers()
            .iter()
            .filter(|f| *f != CLEANUP_FINALIZER)
            .cloned()
            .collect();
        match self.set_finalizers(obj, finalizers).await {
            Err(err) if is_not_found(&err) => Ok(()),
            res => res,
        }
    }
}

/// What [`StatusWriter::write`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The status was persisted
    Written,
    /// The object already carries this status
    Unchanged,
    /// The object no longer exists
    ObjectGone,
    /// The write would reassign the cluster id or move the phase backwards
    Refused,
}

/// Persists observed progress onto the status subresource
///
/// Every write is preceded by a fresh read, and the full status is written each time.
/// There is no optimistic locking on status; a single active operator is assumed.
pub struct StatusWriter<'a> {
    api: &'a dyn ClusterApi,
}

impl<'a> StatusWriter<'a> {
    /// Writes through `api`
    pub fn new(api: &'a dyn ClusterApi) -> Self {
        Self { api }
    }

    /// Writes `status` onto the object at `key`
    pub async fn write(&self, key: &ObjectKey, status: &ClusterStatus) -> kube::Result<WriteOutcome> {
        let Some(current) = self.api.get(key).await? else {
            debug!("object is gone, skipping status write");
            return Ok(WriteOutcome::ObjectGone);
        };
        if current.status.as_ref() == Some(status) {
            return Ok(WriteOutcome::Unchanged);
        }
        if let Some(recorded) = current.cluster_id() {
            if status.cluster_id() != Some(recorded) {
                warn!(
                    recorded,
                    requested = ?status.cluster_id(),
                    "refusing to reassign cluster id"
                );
                return Ok(WriteOutcome::Refused);
            }
        }
        if current.phase() == Some(Phase::Running) && status.phase == Some(Phase::Creating) {
            warn!("refusing to move phase from running back to creating");
            return Ok(WriteOutcome::Refused);
        }
        match self.api.patch_status(key, status).await {
            Ok(()) => {
                debug!(phase = ?status.phase, cluster_id = ?status.cluster_id(), "status written");
                Ok(WriteOutcome::Written)
            }
            Err(err) if is_not_found(&err) => {
                debug!("object vanished before status write");
                Ok(WriteOutcome::ObjectGone)
            }
            Err(err) => Err(err),
        }
    }
}

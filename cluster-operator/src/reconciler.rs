//! The `ClusterRequest` reconcile pass
//!
//! A pass observes the object's state from its status and deletion marker:
//!
//! - no recorded cluster id: validate, create the remote cluster, record it as `creating`
//! - `creating`: poll the provider until it reports `running`, then record that
//! - `running`: nothing to do
//! - deleting or gone: delete the remote cluster, then release the object
//!
//! A recorded cluster id alone forbids another create, so a retried pass resumes where the
//! previous one stopped.
use crate::{
    credentials::{Credential, CredentialStore},
    provisioning::{CreateRequest, Deleted, Provisioner, RUNNING},
    status::{ClusterApi, StatusWriter, WriteOutcome},
    Error, Result,
};
use cluster_core::{ClusterRequest, ClusterStatus, Phase, SecretRef};
use cluster_runtime::{Action, ObjectKey, Target};
use kube::ResourceExt;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Bounds of the readiness poll after a create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Delay between two status checks
    pub poll_interval: Duration,
    /// How long one pass keeps polling before giving up
    pub timeout: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Everything a reconcile pass talks to
pub struct Context {
    /// Reads and writes `ClusterRequest` objects
    pub api: Arc<dyn ClusterApi>,
    /// Manages remote clusters
    pub provisioner: Arc<dyn Provisioner>,
    /// Resolves provider tokens
    pub credentials: Arc<dyn CredentialStore>,
    /// Readiness poll bounds
    pub readiness: Readiness,
}

/// Runs one pass for `target`
pub async fn reconcile(target: Target<ClusterRequest>, ctx: Arc<Context>) -> Result<()> {
    match target {
        Target::Apply(obj) => apply(&obj, &ctx).await,
        Target::Cleanup(obj) => teardown(&obj, &ctx, true).await,
        Target::Gone(obj) => teardown(&obj, &ctx, false).await,
    }
}

/// Drops permanently failing objects until their next change, retries the rest
pub fn error_policy(err: &Error, _ctx: Arc<Context>) -> Action {
    if err.is_permanent() {
        Action::Discard
    } else {
        Action::Requeue
    }
}

fn namespace_of(obj: &ClusterRequest) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

async fn ensure_finalizer(obj: &ClusterRequest, ctx: &Context) -> Result<()> {
    if !obj.has_cleanup_finalizer() {
        ctx.api.add_finalizer(obj).await?;
        debug!("cleanup finalizer added");
    }
    Ok(())
}

async fn apply(obj: &ClusterRequest, ctx: &Context) -> Result<()> {
    let key = ObjectKey::from_obj(obj);
    if obj.phase() == Some(Phase::Running) {
        debug!(cluster_id = ?obj.cluster_id(), "cluster is running");
        return ensure_finalizer(obj, ctx).await;
    }

    let (cluster_id, credential) = match obj.cluster_id() {
        Some(id) => {
            let credential = credential_for(obj, ctx).await?;
            ensure_finalizer(obj, ctx).await?;
            (id.to_string(), credential)
        }
        None => {
            let spec = obj.spec.validate(&namespace_of(obj))?;
            let credential = ctx.credentials.get_secret(&spec.credentials).await?;
            // only objects that may own a remote cluster hold up their deletion
            ensure_finalizer(obj, ctx).await?;
            let id = ctx.provisioner.create(&credential, &CreateRequest::from(&spec)).await?;
            info!(cluster_id = %id, name = %spec.name, region = %spec.region, "cluster requested");
            match StatusWriter::new(&*ctx.api).write(&key, &ClusterStatus::creating(&id)).await? {
                WriteOutcome::Written | WriteOutcome::Unchanged => {}
                WriteOutcome::ObjectGone => {
                    // teardown finds the cluster by name once the deletion is observed
                    warn!(cluster_id = %id, "object deleted while its cluster was being created");
                    return Ok(());
                }
                WriteOutcome::Refused => {
                    error!(
                        cluster_id = %id,
                        recorded = ?obj.cluster_id(),
                        "created cluster could not be recorded, it has to be deleted by hand"
                    );
                    return Ok(());
                }
            }
            (id, credential)
        }
    };

    wait_until_running(ctx, &credential, &cluster_id).await?;
    let kubeconfig = ctx.provisioner.kubeconfig(&credential, &cluster_id).await?;
    let outcome = StatusWriter::new(&*ctx.api)
        .write(&key, &ClusterStatus::running(&cluster_id, kubeconfig))
        .await?;
    if outcome == WriteOutcome::Written {
        info!(cluster_id = %cluster_id, phase = %Phase::Running, "cluster is running");
    }
    Ok(())
}

/// Polls the provider until the cluster reports [`RUNNING`] or the readiness timeout passes
async fn wait_until_running(ctx: &Context, credential: &Credential, cluster_id: &str) -> Result<()> {
    let started = Instant::now();
    loop {
        let state = ctx.provisioner.get_status(credential, cluster_id).await?;
        if state == RUNNING {
            return Ok(());
        }
        let waited = started.elapsed();
        if waited >= ctx.readiness.timeout {
            return Err(Error::NotReady {
                cluster_id: cluster_id.to_string(),
                waited,
                last_state: state,
            });
        }
        debug!(cluster_id, state = %state, "cluster not running yet");
        tokio::time::sleep(ctx.readiness.poll_interval).await;
    }
}

async fn credential_for(obj: &ClusterRequest, ctx: &Context) -> Result<Credential> {
    let secret = SecretRef::parse(obj.spec.token_secret.trim(), &namespace_of(obj))?;
    ctx.credentials.get_secret(&secret).await
}

/// Deletes the remote cluster; `release` also removes the cleanup finalizer afterwards
///
/// Without a recorded cluster id and without a usable credential there is nothing the
/// operator can clean up, so the object is released anyway.
async fn teardown(obj: &ClusterRequest, ctx: &Context, release: bool) -> Result<()> {
    match credential_for(obj, ctx).await {
        Ok(credential) => delete_remote(obj, ctx, &credential).await?,
        Err(err) if err.is_permanent() && obj.cluster_id().is_none() => {
            warn!(error = %err, "no cluster recorded and no usable credential, skipping remote cleanup");
        }
        Err(err) => return Err(err),
    }

    if release && obj.has_cleanup_finalizer() {
        ctx.api.remove_finalizer(obj).await?;
        debug!("cleanup finalizer removed");
    }
    Ok(())
}

async fn delete_remote(obj: &ClusterRequest, ctx: &Context, credential: &Credential) -> Result<()> {
    let cluster_id = match obj.cluster_id() {
        Some(id) => Some(id.to_string()),
        None => find_by_name(ctx, credential, &obj.spec.name).await?,
    };
    match cluster_id {
        Some(id) => match ctx.provisioner.delete(credential, &id).await? {
            Deleted::Removed => info!(cluster_id = %id, "cluster deleted"),
            Deleted::AlreadyGone => debug!(cluster_id = %id, "cluster already gone"),
        },
        None => debug!(name = %obj.spec.name, "no remote cluster to delete"),
    }
    Ok(())
}

/// Resolves a never-recorded cluster id by display name
///
/// Names are not unique at the provider, so more than one match is refused.
async fn find_by_name(ctx: &Context, credential: &Credential, name: &str) -> Result<Option<String>> {
    let mut matches = ctx
        .provisioner
        .list(credential)
        .await?
        .into_iter()
        .filter(|cluster| cluster.name == name);
    match (matches.next(), matches.next()) {
        (None, _) => Ok(None),
        (Some(cluster), None) => Ok(Some(cluster.id)),
        (Some(_), Some(_)) => Err(Error::AmbiguousName {
            name: name.to_string(),
            count: 2 + matches.count(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{error_policy, reconcile, Context, Readiness};
    use crate::{
        credentials::{Credential, CredentialStore},
        provisioning::{self, CreateRequest, Deleted, Provisioner, RemoteCluster},
        status::ClusterApi,
        Error, Result,
    };
    use async_trait::async_trait;
    use cluster_core::{
        ClusterRequest, ClusterRequestSpec, ClusterStatus, NodePool, Phase, SecretRef, CLEANUP_FINALIZER,
    };
    use cluster_runtime::{Action, ObjectKey, Target};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::ResourceExt;
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc, time::Duration};

    /// In-memory control plane holding a single object
    #[derive(Default)]
    struct FakeApi {
        object: Mutex<Option<ClusterRequest>>,
        status_writes: Mutex<Vec<ClusterStatus>>,
    }

    #[async_trait]
    impl ClusterApi for FakeApi {
        async fn get(&self, _key: &ObjectKey) -> kube::Result<Option<ClusterRequest>> {
            Ok(self.object.lock().clone())
        }

        async fn patch_status(&self, _key: &ObjectKey, status: &ClusterStatus) -> kube::Result<()> {
            if let Some(obj) = self.object.lock().as_mut() {
                obj.status = Some(status.clone());
            }
            self.status_writes.lock().push(status.clone());
            Ok(())
        }

        async fn add_finalizer(&self, _obj: &ClusterRequest) -> kube::Result<()> {
            if let Some(obj) = self.object.lock().as_mut() {
                obj.finalizers_mut().push(CLEANUP_FINALIZER.to_string());
            }
            Ok(())
        }

        async fn remove_finalizer(&self, _obj: &ClusterRequest) -> kube::Result<()> {
            if let Some(obj) = self.object.lock().as_mut() {
                obj.finalizers_mut().retain(|f| f != CLEANUP_FINALIZER);
            }
            Ok(())
        }
    }

    impl FakeApi {
        fn holding(obj: &ClusterRequest) -> Arc<Self> {
            Arc::new(Self {
                object: Mutex::new(Some(obj.clone())),
                ..Self::default()
            })
        }

        fn current(&self) -> Option<ClusterRequest> {
            self.object.lock().clone()
        }
    }

    /// Scripted provider that records every call
    #[derive(Default)]
    struct FakeProvisioner {
        create_results: Mutex<VecDeque<Result<String, provisioning::Error>>>,
        states: Mutex<VecDeque<String>>,
        clusters: Mutex<Vec<RemoteCluster>>,
        created: Mutex<Vec<CreateRequest>>,
        deleted: Mutex<Vec<String>>,
        status_checks: Mutex<usize>,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn create(&self, credential: &Credential, request: &CreateRequest) -> Result<String, provisioning::Error> {
            assert_eq!(credential.expose(), "do-secret");
            self.created.lock().push(request.clone());
            self.create_results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("abc123".to_string()))
        }

        async fn get_status(&self, _credential: &Credential, id: &str) -> Result<String, provisioning::Error> {
            assert_eq!(id, "abc123");
            *self.status_checks.lock() += 1;
            let mut states = self.states.lock();
            // the last scripted state sticks
            Ok(match states.len() {
                0 => "running".to_string(),
                1 => states[0].clone(),
                _ => states.pop_front().unwrap_or_default(),
            })
        }

        async fn delete(&self, _credential: &Credential, id: &str) -> Result<Deleted, provisioning::Error> {
            self.deleted.lock().push(id.to_string());
            let mut clusters = self.clusters.lock();
            let before = clusters.len();
            clusters.retain(|c| c.id != id);
            Ok(if clusters.len() < before {
                Deleted::Removed
            } else {
                Deleted::AlreadyGone
            })
        }

        async fn list(&self, _credential: &Credential) -> Result<Vec<RemoteCluster>, provisioning::Error> {
            Ok(self.clusters.lock().clone())
        }

        async fn kubeconfig(&self, _credential: &Credential, id: &str) -> Result<Option<String>, provisioning::Error> {
            Ok(Some(format!("kubeconfig-for-{id}")))
        }
    }

    impl FakeProvisioner {
        fn with_states(states: &[&str]) -> Self {
            Self {
                states: Mutex::new(states.iter().map(|s| s.to_string()).collect()),
                ..Self::default()
            }
        }

        fn create_calls(&self) -> usize {
            self.created.lock().len()
        }
    }

    struct FakeCredentials;

    #[async_trait]
    impl CredentialStore for FakeCredentials {
        async fn get_secret(&self, secret: &SecretRef) -> Result<Credential> {
            if secret.name == "do-token" {
                Ok(Credential::new("do-secret"))
            } else {
                Err(Error::CredentialNotFound(secret.clone()))
            }
        }
    }

    fn cluster_request(status: Option<ClusterStatus>) -> ClusterRequest {
        let mut obj = ClusterRequest::new("c1", ClusterRequestSpec {
            name: "c1".into(),
            region: "nyc1".into(),
            version: "1.30".into(),
            token_secret: "do-token".into(),
            node_pools: vec![NodePool {
                name: "pool1".into(),
                size: "s-2vcpu-4gb".into(),
                count: 3,
            }],
        });
        obj.metadata.namespace = Some("default".into());
        obj.status = status;
        obj
    }

    fn deleting(mut obj: ClusterRequest) -> ClusterRequest {
        obj.metadata.deletion_timestamp = Some(Time(Default::default()));
        obj.finalizers_mut().push(CLEANUP_FINALIZER.to_string());
        obj
    }

    fn context(api: Arc<FakeApi>, provisioner: Arc<FakeProvisioner>) -> Arc<Context> {
        Arc::new(Context {
            api,
            provisioner,
            credentials: Arc::new(FakeCredentials),
            readiness: Readiness {
                poll_interval: Duration::from_secs(10),
                timeout: Duration::from_secs(30),
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_object_is_created_and_recorded() {
        let obj = cluster_request(None);
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::with_states(&["provisioning", "running"]));
        let ctx = context(api.clone(), provisioner.clone());

        reconcile(Target::Apply(Arc::new(obj)), ctx).await.unwrap();

        let created = provisioner.created.lock().clone();
        assert_eq!(created, vec![CreateRequest {
            name: "c1".into(),
            region: "nyc1".into(),
            version: "1.30".into(),
            node_pool: NodePool {
                name: "pool1".into(),
                size: "s-2vcpu-4gb".into(),
                count: 3,
            },
        }]);
        assert_eq!(api.status_writes.lock().clone(), vec![
            ClusterStatus::creating("abc123"),
            ClusterStatus::running("abc123", Some("kubeconfig-for-abc123".into())),
        ]);
        assert!(api.current().unwrap().has_cleanup_finalizer());
    }

    #[tokio::test]
    async fn creating_object_is_promoted_without_create() {
        let obj = cluster_request(Some(ClusterStatus::creating("abc123")));
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(api.clone(), provisioner.clone());

        reconcile(Target::Apply(Arc::new(obj)), ctx).await.unwrap();

        assert_eq!(provisioner.create_calls(), 0);
        let status = api.current().unwrap().status.unwrap();
        assert_eq!(status.phase, Some(Phase::Running));
        assert_eq!(status.cluster_id(), Some("abc123"));
    }

    #[tokio::test]
    async fn running_object_is_left_alone() {
        let obj = cluster_request(Some(ClusterStatus::running("abc123", None)));
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(api.clone(), provisioner.clone());

        reconcile(Target::Apply(Arc::new(obj)), ctx).await.unwrap();

        assert_eq!(provisioner.create_calls(), 0);
        assert_eq!(*provisioner.status_checks.lock(), 0);
        assert!(api.status_writes.lock().is_empty());
    }

    #[tokio::test]
    async fn deleting_object_deletes_recorded_cluster_and_releases() {
        let obj = deleting(cluster_request(Some(ClusterStatus::running("abc123", None))));
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(api.clone(), provisioner.clone());

        reconcile(Target::Cleanup(Arc::new(obj)), ctx).await.unwrap();

        assert_eq!(provisioner.deleted.lock().clone(), vec!["abc123".to_string()]);
        assert!(!api.current().unwrap().has_cleanup_finalizer());
    }

    #[tokio::test]
    async fn gone_object_without_id_and_no_match_is_done() {
        let obj = cluster_request(None);
        let api = Arc::new(FakeApi::default());
        let provisioner = Arc::new(FakeProvisioner::default());
        provisioner.clusters.lock().push(RemoteCluster {
            id: "zzz999".into(),
            name: "other".into(),
        });
        let ctx = context(api, provisioner.clone());

        reconcile(Target::Gone(Arc::new(obj)), ctx).await.unwrap();

        assert!(provisioner.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn gone_object_without_id_deletes_by_name() {
        let obj = cluster_request(None);
        let provisioner = Arc::new(FakeProvisioner::default());
        provisioner.clusters.lock().push(RemoteCluster {
            id: "def456".into(),
            name: "c1".into(),
        });
        let ctx = context(Arc::new(FakeApi::default()), provisioner.clone());

        reconcile(Target::Gone(Arc::new(obj)), ctx).await.unwrap();

        assert_eq!(provisioner.deleted.lock().clone(), vec!["def456".to_string()]);
    }

    #[tokio::test]
    async fn ambiguous_name_is_refused() {
        let obj = cluster_request(None);
        let provisioner = Arc::new(FakeProvisioner::default());
        for id in ["def456", "ghi789"] {
            provisioner.clusters.lock().push(RemoteCluster {
                id: id.into(),
                name: "c1".into(),
            });
        }
        let ctx = context(Arc::new(FakeApi::default()), provisioner.clone());

        let err = reconcile(Target::Gone(Arc::new(obj)), ctx.clone()).await.unwrap_err();

        assert!(matches!(err, Error::AmbiguousName { count: 2, .. }));
        assert_eq!(error_policy(&err, ctx), Action::Discard);
        assert!(provisioner.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let obj = deleting(cluster_request(Some(ClusterStatus::running("old999", None))));
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(api.clone(), provisioner.clone());

        reconcile(Target::Cleanup(Arc::new(obj.clone())), ctx.clone()).await.unwrap();
        reconcile(Target::Gone(Arc::new(obj)), ctx).await.unwrap();

        assert_eq!(provisioner.deleted.lock().len(), 2);
    }

    #[tokio::test]
    async fn transient_create_failure_is_retried_with_create() {
        let obj = cluster_request(None);
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::default());
        provisioner.create_results.lock().push_back(Err(provisioning::Error::Api {
            status: 503,
            message: "service unavailable".into(),
        }));
        let ctx = context(api.clone(), provisioner.clone());

        let err = reconcile(Target::Apply(Arc::new(obj)), ctx.clone()).await.unwrap_err();
        assert_eq!(error_policy(&err, ctx.clone()), Action::Requeue);
        assert!(api.status_writes.lock().is_empty());

        let retried = api.current().unwrap();
        reconcile(Target::Apply(Arc::new(retried)), ctx).await.unwrap();
        assert_eq!(provisioner.create_calls(), 2);
        assert_eq!(api.current().unwrap().cluster_id(), Some("abc123"));
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_keeps_creating_and_resumes_without_create() {
        let obj = cluster_request(None);
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::with_states(&["provisioning"]));
        let ctx = context(api.clone(), provisioner.clone());

        let err = reconcile(Target::Apply(Arc::new(obj)), ctx.clone()).await.unwrap_err();
        assert!(matches!(&err, Error::NotReady { last_state, .. } if last_state == "provisioning"));
        assert_eq!(error_policy(&err, ctx.clone()), Action::Requeue);
        // checks at 0s, 10s, 20s and 30s
        assert_eq!(*provisioner.status_checks.lock(), 4);
        assert_eq!(api.current().unwrap().phase(), Some(Phase::Creating));

        provisioner.states.lock().clear();
        let resumed = api.current().unwrap();
        reconcile(Target::Apply(Arc::new(resumed)), ctx).await.unwrap();
        assert_eq!(provisioner.create_calls(), 1);
        assert_eq!(api.current().unwrap().phase(), Some(Phase::Running));
    }

    #[tokio::test]
    async fn invalid_spec_is_permanent_and_creates_nothing() {
        let mut obj = cluster_request(None);
        obj.spec.node_pools.clear();
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(api.clone(), provisioner.clone());

        let err = reconcile(Target::Apply(Arc::new(obj)), ctx.clone()).await.unwrap_err();

        assert!(matches!(err, Error::InvalidSpec(_)));
        assert_eq!(error_policy(&err, ctx), Action::Discard);
        assert_eq!(provisioner.create_calls(), 0);
        assert!(!api.current().unwrap().has_cleanup_finalizer());
    }

    #[tokio::test]
    async fn missing_credential_is_permanent() {
        let mut obj = cluster_request(None);
        obj.spec.token_secret = "ops/missing".into();
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(FakeApi::holding(&obj), provisioner.clone());

        let err = reconcile(Target::Apply(Arc::new(obj)), ctx.clone()).await.unwrap_err();

        assert!(matches!(err, Error::CredentialNotFound(_)));
        assert_eq!(error_policy(&err, ctx), Action::Discard);
        assert_eq!(provisioner.create_calls(), 0);
    }

    #[tokio::test]
    async fn missing_credential_does_not_block_deletion() {
        let mut obj = cluster_request(None);
        obj.spec.token_secret = "ops/missing".into();
        let api = FakeApi::holding(&obj);
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(api.clone(), provisioner.clone());

        let err = reconcile(Target::Apply(Arc::new(obj)), ctx.clone()).await.unwrap_err();
        assert_eq!(error_policy(&err, ctx.clone()), Action::Discard);
        assert!(!api.current().unwrap().has_cleanup_finalizer());

        // a finalizer registered before the Secret went away must not pin the object
        let obj = deleting(api.current().unwrap());
        *api.object.lock() = Some(obj.clone());
        reconcile(Target::Cleanup(Arc::new(obj)), ctx).await.unwrap();

        assert!(!api.current().unwrap().has_cleanup_finalizer());
        assert_eq!(provisioner.create_calls(), 0);
        assert!(provisioner.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_credential_with_recorded_cluster_keeps_finalizer() {
        let mut obj = deleting(cluster_request(Some(ClusterStatus::running("abc123", None))));
        obj.spec.token_secret = "ops/missing".into();
        let api = FakeApi::holding(&obj);
        let ctx = context(api.clone(), Arc::new(FakeProvisioner::default()));

        let err = reconcile(Target::Cleanup(Arc::new(obj)), ctx).await.unwrap_err();

        assert!(matches!(err, Error::CredentialNotFound(_)));
        assert!(api.current().unwrap().has_cleanup_finalizer());
    }

    #[tokio::test]
    async fn refused_status_write_after_create_ends_the_pass() {
        let obj = cluster_request(None);
        let api = FakeApi::holding(&cluster_request(Some(ClusterStatus::creating("zzz999"))));
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(api.clone(), provisioner.clone());

        reconcile(Target::Apply(Arc::new(obj)), ctx).await.unwrap();

        assert_eq!(provisioner.create_calls(), 1);
        assert!(api.status_writes.lock().is_empty());
        assert_eq!(api.current().unwrap().cluster_id(), Some("zzz999"));
        assert_eq!(*provisioner.status_checks.lock(), 0);
    }

    #[tokio::test]
    async fn object_deleted_during_create_stops_the_pass() {
        let obj = cluster_request(None);
        let provisioner = Arc::new(FakeProvisioner::default());
        let ctx = context(Arc::new(FakeApi::default()), provisioner.clone());

        reconcile(Target::Apply(Arc::new(obj)), ctx).await.unwrap();

        assert_eq!(provisioner.create_calls(), 1);
        assert_eq!(*provisioner.status_checks.lock(), 0);
    }
}

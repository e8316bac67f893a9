//! Runs a reconciler for every object of a kind, driven by a watch and a work queue
use crate::{
    predicate::{predicates, ChangeFilter, Predicate},
    reflector::{self, Change, ObjectKey, Store, Writer},
    watcher::{self, watcher},
    workqueue::{RetryPolicy, WorkQueue},
};
use async_trait::async_trait;
use futures::{future, Future, Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, pin::pin, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Failures to resolve a key into a reconcile target
#[derive(Debug, Error)]
pub enum Error {
    /// The object could not be fetched
    #[error("failed to look up object: {0}")]
    LookupFailed(#[source] kube::Error),
    /// The object was fetched but does not deserialize
    #[error("stored object is malformed: {0}")]
    MalformedObject(#[source] kube::Error),
}

impl Error {
    fn from_lookup(err: kube::Error) -> Self {
        match err {
            kube::Error::SerdeError(_) => Error::MalformedObject(err),
            _ => Error::LookupFailed(err),
        }
    }

    /// Whether retrying cannot help
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::MalformedObject(_))
    }
}

/// What a reconcile pass is asked to do
#[derive(Debug, Clone)]
pub enum Target<K> {
    /// The object exists and is not being deleted: converge towards its spec
    Apply(Arc<K>),
    /// The object exists and deletion has been requested: tear down what it owns
    Cleanup(Arc<K>),
    /// The object no longer exists: tear down using its last known state
    Gone(Arc<K>),
}

impl<K> Target<K> {
    /// The object the pass operates on
    pub fn object(&self) -> &Arc<K> {
        match self {
            Target::Apply(obj) | Target::Cleanup(obj) | Target::Gone(obj) => obj,
        }
    }
}

/// What to do with a key after its reconcile pass failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Retry after the key's backoff delay
    Requeue,
    /// Log and drop the key until the next change
    Discard,
}

/// Fetches the current state of an object by key
#[async_trait]
pub trait Lookup<K>: Send + Sync {
    /// Returns `Ok(None)` if the object does not exist
    async fn lookup(&self, key: &ObjectKey) -> kube::Result<Option<K>>;
}

/// [`Lookup`] against the apiserver
#[derive(Clone)]
pub struct ApiLookup {
    client: Client,
}

impl ApiLookup {
    /// Looks objects up through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<K> Lookup<K> for ApiLookup
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn lookup(&self, key: &ObjectKey) -> kube::Result<Option<K>> {
        let api: Api<K> = match &key.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        };
        api.get_opt(&key.name).await
    }
}

/// Tuning of a [`Controller`]
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Capacity of the channel between the watch and the queue
    pub channel_capacity: usize,
    /// Re-enqueue every known object at this interval, disabled if `None`
    pub resync_period: Option<Duration>,
    /// Backoff of failed keys
    pub retry: RetryPolicy,
    /// Parameters of the underlying watch
    pub watcher: watcher::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 100,
            resync_period: None,
            retry: RetryPolicy::default(),
            watcher: watcher::Config::default(),
        }
    }
}

/// Controller
///
/// A controller is made up of:
/// - 1 [`watcher`] of the reconciled kind, feeding a bounded channel
/// - 1 consumer task updating a [`Store`] and enqueueing keys whose generation or deletion state changed
/// - N workers pulling keys from a [`WorkQueue`], classifying them into a [`Target`] and running the reconciler
///
/// The same key is never handed to two workers at once.
pub struct Controller<K> {
    api: Api<K>,
    lookup: Arc<dyn Lookup<K>>,
    config: Config,
}

impl<K> Controller<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Create a Controller watching `api`, resolving keys through `lookup`
    ///
    /// The scope of `api` (cluster/all namespaces, or namespaced) decides which objects are reconciled.
    pub fn new(api: Api<K>, lookup: impl Lookup<K> + 'static, config: Config) -> Self {
        Self {
            api,
            lookup: Arc::new(lookup),
            config,
        }
    }

    /// Runs until `shutdown` is cancelled
    ///
    /// On shutdown the watch stops, the queue stops handing out keys, and the call returns once every
    /// in-flight reconcile pass has completed.
    pub async fn run<ReconcilerFut, E, Ctx>(
        self,
        reconciler: impl Fn(Target<K>, Arc<Ctx>) -> ReconcilerFut + Send + Sync + 'static,
        error_policy: impl Fn(&E, Arc<Ctx>) -> Action + Send + Sync + 'static,
        context: Arc<Ctx>,
        shutdown: CancellationToken,
    ) where
        ReconcilerFut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
        Ctx: Send + Sync + 'static,
    {
        let Controller { api, lookup, config } = self;
        let queue = WorkQueue::new(config.retry);
        let (store, writer) = reflector::store();
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));

        let producer = tokio::spawn(forward_events(
            watcher(api, config.watcher.clone()),
            events_tx,
            shutdown.clone(),
        ));
        let consumer = tokio::spawn(consume_events(
            events_rx,
            writer,
            queue.clone(),
            config.resync_period,
            shutdown.clone(),
        ));

        // keys enqueued by the initial listing wait in the queue until the workers start
        tokio::select! {
            synced = store.wait_until_ready() => match synced {
                Ok(()) => info!(objects = store.len(), "initial listing synced"),
                Err(err) => warn!(error = %err, "watch ended before the initial listing"),
            },
            () = shutdown.cancelled() => {}
        }

        let dispatcher = Arc::new(Dispatcher {
            queue: queue.clone(),
            store,
            lookup,
            reconciler,
            error_policy,
            context,
        });
        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.work(worker).await })
            })
            .collect::<Vec<_>>();
        info!(workers = workers.len(), "controller started");

        shutdown.cancelled().await;
        info!("shutting down controller, waiting for in-flight reconciles");
        queue.shut_down();
        for result in future::join_all(workers.into_iter().chain([producer, consumer])).await {
            if let Err(err) = result {
                error!(error = %err, "controller task failed");
            }
        }
        info!("controller stopped");
    }
}

/// Pumps the watch into the bounded channel until shutdown
async fn forward_events<K>(
    events: impl Stream<Item = watcher::Event<K>>,
    tx: mpsc::Sender<watcher::Event<K>>,
    shutdown: CancellationToken,
) {
    let mut events = pin!(events);
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            () = shutdown.cancelled() => None,
        };
        let Some(event) = event else { break };
        let sent = tokio::select! {
            sent = tx.send(event) => sent.is_ok(),
            () = shutdown.cancelled() => false,
        };
        if !sent {
            break;
        }
    }
    debug!("watch stopped");
}

/// Applies watch events to the store and enqueues the keys worth reconciling
async fn consume_events<K>(
    mut rx: mpsc::Receiver<watcher::Event<K>>,
    mut writer: Writer<K>,
    queue: WorkQueue<ObjectKey>,
    resync_period: Option<Duration>,
    shutdown: CancellationToken,
) where
    K: Resource + Clone,
{
    let store = writer.as_reader();
    let mut filter = ChangeFilter::new(predicates::generation::<K>.combine(predicates::deletion::<K>));
    let mut resync = resync_period.map(|period| {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                for change in writer.apply_watcher_event(&event) {
                    enqueue_change(&mut filter, &queue, change);
                }
            }
            () = tick(&mut resync) => {
                let keys = store.keys();
                debug!(objects = keys.len(), "resyncing");
                for key in keys {
                    queue.add(key);
                }
            }
            () = shutdown.cancelled() => break,
        }
    }
}

fn enqueue_change<K, P>(filter: &mut ChangeFilter<P>, queue: &WorkQueue<ObjectKey>, change: Change<K>)
where
    P: Predicate<K>,
{
    match change {
        Change::Applied(key, obj) => {
            if filter.changed(&key, obj.as_ref()) {
                queue.add(key);
            }
        }
        Change::Deleted(key, _) => {
            filter.forget(&key);
            queue.add(key);
        }
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

struct Dispatcher<K, R, P, Ctx> {
    queue: WorkQueue<ObjectKey>,
    store: Store<K>,
    lookup: Arc<dyn Lookup<K>>,
    reconciler: R,
    error_policy: P,
    context: Arc<Ctx>,
}

impl<K, R, P, Ctx, ReconcilerFut, E> Dispatcher<K, R, P, Ctx>
where
    K: Resource,
    R: Fn(Target<K>, Arc<Ctx>) -> ReconcilerFut,
    P: Fn(&E, Arc<Ctx>) -> Action,
    ReconcilerFut: Future<Output = Result<(), E>>,
    E: std::error::Error,
{
    async fn work(&self, worker: usize) {
        while let Some(key) = self.queue.get().await {
            let span = info_span!("reconcile", object = %key, worker);
            self.process(&key).instrument(span).await;
            self.queue.done(&key);
        }
        debug!(worker, "worker stopped");
    }

    async fn process(&self, key: &ObjectKey) {
        let target = match self.resolve(key).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!("object is gone and nothing is known about it");
                self.queue.forget(key);
                return;
            }
            Err(err) if err.is_permanent() => {
                error!(error = %err, "dropping object");
                self.queue.forget(key);
                return;
            }
            Err(err) => {
                warn!(error = %err, "requeueing object");
                self.queue.add_rate_limited(key.clone());
                return;
            }
        };

        let gone = matches!(target, Target::Gone(_));
        match (self.reconciler)(target, self.context.clone()).await {
            Ok(()) => {
                debug!("reconciled");
                self.queue.forget(key);
                if gone {
                    self.store.clear_tombstone(key);
                }
            }
            Err(err) => match (self.error_policy)(&err, self.context.clone()) {
                Action::Requeue => {
                    warn!(error = %err, attempt = self.queue.num_requeues(key) + 1, "reconcile failed, requeueing");
                    self.queue.add_rate_limited(key.clone());
                }
                Action::Discard => {
                    error!(error = %err, "reconcile failed permanently, dropping");
                    self.queue.forget(key);
                    if gone {
                        // deleted keys are never resynced
                        self.store.clear_tombstone(key);
                    }
                }
            },
        }
    }

    /// Classifies a key by a fresh read, falling back to the tombstone for deleted objects
    async fn resolve(&self, key: &ObjectKey) -> Result<Option<Target<K>>, Error> {
        match self.lookup.lookup(key).await.map_err(Error::from_lookup)? {
            Some(obj) if obj.meta().deletion_timestamp.is_some() => Ok(Some(Target::Cleanup(Arc::new(obj)))),
            Some(obj) => Ok(Some(Target::Apply(Arc::new(obj)))),
            None => Ok(self.store.tombstone(key).map(Target::Gone)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{consume_events, Action, Controller, Dispatcher, Lookup, Target};
    use crate::{
        reflector::{self, ObjectKey},
        watcher,
        workqueue::{RetryPolicy, WorkQueue},
    };
    use async_trait::async_trait;
    use http::{Request, Response};
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::Time};
    use kube::{api::ObjectMeta, client::Body, Api, Client, ResourceExt};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::{collections::HashMap, sync::Arc, time::Duration};
    use thiserror::Error;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    fn error_policy(err: &TestError, _: Arc<()>) -> Action {
        match err {
            TestError::Transient => Action::Requeue,
            TestError::Permanent => Action::Discard,
        }
    }

    fn cm(name: &str, generation: i64) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                generation: Some(generation),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(name).within("default")
    }

    #[derive(Default)]
    struct FakeLookup {
        objects: Mutex<HashMap<ObjectKey, ConfigMap>>,
        malformed: bool,
    }

    #[async_trait]
    impl Lookup<ConfigMap> for FakeLookup {
        async fn lookup(&self, key: &ObjectKey) -> kube::Result<Option<ConfigMap>> {
            if self.malformed {
                let err = serde_json::from_str::<ConfigMap>("{").unwrap_err();
                return Err(kube::Error::SerdeError(err));
            }
            Ok(self.objects.lock().get(key).cloned())
        }
    }

    type Seen = Arc<Mutex<Vec<String>>>;

    fn describe(target: &Target<ConfigMap>) -> String {
        let kind = match target {
            Target::Apply(_) => "apply",
            Target::Cleanup(_) => "cleanup",
            Target::Gone(_) => "gone",
        };
        format!("{kind}:{}", target.object().name_any())
    }

    #[allow(clippy::type_complexity)]
    fn make_dispatcher(
        lookup: FakeLookup,
        store: reflector::Store<ConfigMap>,
        outcome: fn() -> Result<(), TestError>,
    ) -> (
        Dispatcher<
            ConfigMap,
            impl Fn(Target<ConfigMap>, Arc<()>) -> futures::future::Ready<Result<(), TestError>>,
            fn(&TestError, Arc<()>) -> Action,
            (),
        >,
        Seen,
    ) {
        let seen = Seen::default();
        let reconciler = {
            let seen = seen.clone();
            move |target: Target<ConfigMap>, _: Arc<()>| {
                seen.lock().push(describe(&target));
                futures::future::ready(outcome())
            }
        };
        let dispatcher = Dispatcher {
            queue: WorkQueue::new(RetryPolicy::default()),
            store,
            lookup: Arc::new(lookup),
            reconciler,
            error_policy: error_policy as fn(&TestError, Arc<()>) -> Action,
            context: Arc::new(()),
        };
        (dispatcher, seen)
    }

    #[tokio::test]
    async fn dispatcher_classifies_targets() {
        let (store, mut writer) = reflector::store::<ConfigMap>();
        writer.apply_watcher_event(&watcher::Event::Deleted(cm("gone", 1)));

        let lookup = FakeLookup::default();
        let mut deleting = cm("deleting", 1);
        deleting.metadata.deletion_timestamp = Some(Time(Default::default()));
        lookup.objects.lock().insert(key("live"), cm("live", 1));
        lookup.objects.lock().insert(key("deleting"), deleting);

        let (dispatcher, seen) = make_dispatcher(lookup, store.clone(), || Ok(()));
        for name in ["live", "deleting", "gone", "unknown"] {
            dispatcher.process(&key(name)).await;
        }
        assert_eq!(*seen.lock(), vec!["apply:live", "cleanup:deleting", "gone:gone"]);
        // tombstones go once their teardown succeeded
        assert!(store.tombstone(&key("gone")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_applies_error_policy() {
        let (store, _writer) = reflector::store::<ConfigMap>();
        let lookup = FakeLookup::default();
        lookup.objects.lock().insert(key("a"), cm("a", 1));

        let (dispatcher, _) = make_dispatcher(lookup, store.clone(), || Err(TestError::Transient));
        dispatcher.process(&key("a")).await;
        assert_eq!(dispatcher.queue.num_requeues(&key("a")), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(dispatcher.queue.get().await, Some(key("a")));

        let lookup = FakeLookup::default();
        lookup.objects.lock().insert(key("a"), cm("a", 1));
        let (dispatcher, seen) = make_dispatcher(lookup, store, || Err(TestError::Permanent));
        dispatcher.process(&key("a")).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(dispatcher.queue.num_requeues(&key("a")), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(dispatcher.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_gone_failure_drops_tombstone() {
        let (store, mut writer) = reflector::store::<ConfigMap>();
        writer.apply_watcher_event(&watcher::Event::Deleted(cm("gone", 1)));
        writer.apply_watcher_event(&watcher::Event::Deleted(cm("flaky", 1)));

        let (dispatcher, seen) = make_dispatcher(FakeLookup::default(), store.clone(), || Err(TestError::Permanent));
        dispatcher.process(&key("gone")).await;
        assert_eq!(*seen.lock(), vec!["gone:gone"]);
        assert!(store.tombstone(&key("gone")).is_none());

        // a transient failure is retried from the tombstone, so it stays
        let (dispatcher, _) = make_dispatcher(FakeLookup::default(), store.clone(), || Err(TestError::Transient));
        dispatcher.process(&key("flaky")).await;
        assert!(store.tombstone(&key("flaky")).is_some());
        assert_eq!(dispatcher.queue.num_requeues(&key("flaky")), 1);
    }

    #[tokio::test]
    async fn dispatcher_drops_malformed_objects() {
        let (store, _writer) = reflector::store::<ConfigMap>();
        let lookup = FakeLookup {
            malformed: true,
            ..FakeLookup::default()
        };
        let (dispatcher, seen) = make_dispatcher(lookup, store, || Ok(()));
        dispatcher.process(&key("a")).await;
        assert!(seen.lock().is_empty());
        assert_eq!(dispatcher.queue.num_requeues(&key("a")), 0);
    }

    #[tokio::test]
    async fn consumer_skips_unchanged_generations() {
        let (store, writer) = reflector::store::<ConfigMap>();
        let queue = WorkQueue::new(RetryPolicy::default());
        let (tx, rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn(consume_events(rx, writer, queue.clone(), None, shutdown.clone()));

        tx.send(watcher::Event::Restarted(vec![cm("a", 1)])).await.unwrap();
        // a status write: same generation
        tx.send(watcher::Event::Applied(cm("a", 1))).await.unwrap();
        tx.send(watcher::Event::Applied(cm("b", 1))).await.unwrap();
        tx.send(watcher::Event::Deleted(cm("b", 1))).await.unwrap();
        drop(tx);
        consumer.await.unwrap();

        store.wait_until_ready().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(store.tombstone(&key("b")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_resyncs_live_objects() {
        let (_store, writer) = reflector::store::<ConfigMap>();
        let queue = WorkQueue::new(RetryPolicy::default());
        let (tx, rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn(consume_events(
            rx,
            writer,
            queue.clone(),
            Some(Duration::from_secs(60)),
            shutdown.clone(),
        ));

        tx.send(watcher::Event::Restarted(vec![cm("a", 1)])).await.unwrap();
        assert_eq!(queue.get().await, Some(key("a")));
        queue.done(&key("a"));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.get().await, Some(key("a")));

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn controller_reconciles_listed_objects_until_shutdown() {
        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let apiserver = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("list");
            let list = json!({
                "kind": "ConfigMapList",
                "apiVersion": "v1",
                "metadata": { "resourceVersion": "1" },
                "items": [cm("a", 1)],
            });
            send.send_response(Response::builder().body(Body::from(serde_json::to_vec(&list).unwrap())).unwrap());
            // hold the watch open
            let _watch = handle.next_request().await;
            futures::future::pending::<()>().await;
        });

        let lookup = FakeLookup::default();
        lookup.objects.lock().insert(key("a"), cm("a", 1));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let controller = Controller::new(Api::<ConfigMap>::default_namespaced(client), lookup, Default::default());
        let run = tokio::spawn(controller.run(
            move |target, _ctx: Arc<()>| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(describe(&target)).ok();
                    Ok::<_, TestError>(())
                }
            },
            error_policy,
            Arc::new(()),
            shutdown.clone(),
        ));

        assert_eq!(seen_rx.recv().await.as_deref(), Some("apply:a"));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        apiserver.abort();
    }
}

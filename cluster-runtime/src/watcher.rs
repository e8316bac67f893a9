//! Watches a Kubernetes Resource for changes, with error recovery
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::{stream::BoxStream, Stream, StreamExt};
use kube::{
    api::{ListParams, WatchEvent, WatchParams},
    core::ErrorResponse,
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use std::{clone::Clone, fmt::Debug, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Failures the [`watcher`] recovers from
#[derive(Error, Debug)]
pub enum Error {
    /// The LIST call failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] kube::Error),
    /// The LIST response carried no resource version to watch from
    #[error("initial object list returned no resource version")]
    NoResourceVersion,
    /// The WATCH call failed
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] kube::Error),
    /// The apiserver sent an error event on an open watch
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch connection broke
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] kube::Error),
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
/// Watch events returned from the [`watcher`]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the watcher is unavailable. Use Finalizers instead.
    Deleted(K),
    /// The watch stream was restarted with a full listing, so `Deleted` events may have been missed
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

/// Parameters of the LIST and WATCH calls, and of the retry backoff
#[derive(Clone, Debug)]
pub struct Config {
    /// A selector to restrict the list of returned objects by their labels
    pub label_selector: Option<String>,
    /// Server side timeout of a single WATCH call, in seconds
    ///
    /// Kept below the client read timeout (295s) so the server closes idle watches first.
    pub timeout: u32,
    /// Delay before the first retry after a failure
    pub min_backoff: Duration,
    /// Upper bound for retry delays
    pub max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label_selector: None,
            timeout: 290,
            min_backoff: Duration::from_millis(800),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Restrict the watch by label selector
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    fn to_list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(labels) = &self.label_selector {
            lp = lp.labels(labels);
        }
        lp
    }

    fn to_watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(self.timeout);
        if let Some(labels) = &self.label_selector {
            wp = wp.labels(labels);
        }
        wp
    }

    fn backoff_builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(usize::MAX)
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State<K> {
    /// The Watcher is empty, and the next [`poll`](Stream::poll_next) will start the initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the server.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the K8s watch window then we propagate the error and fall back doing a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        stream: BoxStream<'static, kube::Result<WatchEvent<K>>>,
    },
}

impl<K> Debug for State<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Empty => f.write_str("Empty"),
            State::InitListed { resource_version } => f
                .debug_struct("InitListed")
                .field("resource_version", resource_version)
                .finish(),
            State::Watching { resource_version, .. } => f
                .debug_struct("Watching")
                .field("resource_version", resource_version)
                .finish_non_exhaustive(),
        }
    }
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined<K>(api: &Api<K>, config: &Config, state: State<K>) -> (Option<Result<Event<K>>>, State<K>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    match state {
        State::Empty => match api.list(&config.to_list_params()).await {
            Ok(list) => match list.metadata.resource_version {
                Some(resource_version) if !resource_version.is_empty() => {
                    debug!(objects = list.items.len(), %resource_version, "listed objects");
                    (Some(Ok(Event::Restarted(list.items))), State::InitListed {
                        resource_version,
                    })
                }
                _ => (Some(Err(Error::NoResourceVersion)), State::Empty),
            },
            Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
        },
        State::InitListed { resource_version } => {
            match api.watch(&config.to_watch_params(), &resource_version).await {
                Ok(stream) => (None, State::Watching {
                    resource_version,
                    stream: stream.boxed(),
                }),
                Err(err) => (Some(Err(Error::WatchStartFailed(err))), State::InitListed {
                    resource_version,
                }),
            }
        }
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Applied(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Deleted(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => (None, State::Watching {
                resource_version: bm.metadata.resource_version,
                stream,
            }),
            Some(Ok(WatchEvent::Error(err))) => {
                // HTTP GONE, means we have desynced and need to start over and re-list :(
                let new_state = if err.code == 410 {
                    State::Empty
                } else {
                    State::Watching {
                        resource_version,
                        stream,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::InitListed {
                resource_version,
            }),
            None => (None, State::InitListed { resource_version }),
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step<K>(api: &Api<K>, config: &Config, mut state: State<K>) -> (Result<Event<K>>, State<K>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    loop {
        match step_trampolined(api, config, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a Kubernetes Resource for changes continuously
///
/// Compared to [`Api::watch`], this recovers from errors on its own: failures are logged and
/// retried with exponential backoff, which is reset whenever an event is delivered. The stream
/// therefore never ends and never yields an error.
///
/// The first event is always a [`Event::Restarted`] carrying a full listing, and every relist
/// (after the server reports the resource version as expired) produces another one.
///
/// # Recovery
///
/// If the watch connection is interrupted then we attempt to restart the watch using the last
/// resource version that we have seen on the stream. If this is successful then the stream is simply
/// resumed from where it left off. If this fails because the resource version is no longer valid
/// then we start over with a new listing.
pub fn watcher<K>(api: Api<K>, config: Config) -> impl Stream<Item = Event<K>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    futures::stream::unfold(
        (api, config, State::Empty, None::<ExponentialBackoff>),
        |(api, config, mut state, mut backoff)| async move {
            loop {
                let (result, new_state) = step(&api, &config, state).await;
                state = new_state;
                match result {
                    Ok(event) => return Some((event, (api, config, state, None))),
                    Err(err) => {
                        let delay = backoff
                            .get_or_insert_with(|| config.backoff_builder().build())
                            .next()
                            .unwrap_or(config.max_backoff);
                        warn!(error = %err, ?delay, "watcher failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        },
    )
}

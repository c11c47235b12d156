//! List+watch runner.
//!
//! Seeds its [`Store`] with a bulk enumeration, replays a synthetic
//! `Replaced` event through the store callback, then applies the incremental
//! watch. When the upstream stream terminates the whole cycle restarts from
//! the list after a short backoff, so the store converges again after any
//! disconnect.

use std::fmt::Debug;
use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Store, WatchError};

/// Result of one bulk enumeration.
pub struct ListSnapshot<T> {
    pub items: Vec<T>,
    pub resource_version: String,
}

/// One notification from the upstream watch.
#[derive(Debug, Clone)]
pub enum WatchedEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

pub type ListFn<T> =
    Box<dyn Fn() -> BoxFuture<'static, Result<ListSnapshot<T>, WatchError>> + Send + Sync>;

pub type EventStream<T> = BoxStream<'static, Result<WatchedEvent<T>, WatchError>>;

/// Opens a watch starting at the given resource version.
pub type WatchFn<T> =
    Box<dyn Fn(String) -> BoxFuture<'static, Result<EventStream<T>, WatchError>> + Send + Sync>;

const RESTART_BACKOFF: Duration = Duration::from_millis(500);

pub struct ListWatcher<T> {
    store: Arc<Store<T>>,
    source: Mutex<Option<(ListFn<T>, WatchFn<T>)>>,
    resync: Option<Duration>,
    shutdown: CancellationToken,
}

impl<T> ListWatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<Store<T>>,
        list: ListFn<T>,
        watch: WatchFn<T>,
        resync: Option<Duration>,
    ) -> Self {
        ListWatcher {
            store,
            source: Mutex::new(Some((list, watch))),
            resync,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> Arc<Store<T>> {
        self.store.clone()
    }

    /// Starts the background worker. Subsequent calls are no-ops.
    pub fn run(&self) {
        let source = self
            .source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some((list, watch)) = source else {
            return;
        };
        let store = self.store.clone();
        let resync = self.resync;
        let shutdown = self.shutdown.clone();
        tokio::spawn(run_loop(store, list, watch, resync, shutdown));
    }

    /// Terminates the worker and closes the upstream watch. Subsequent calls
    /// are no-ops.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn run_loop<T>(
    store: Arc<Store<T>>,
    list: ListFn<T>,
    watch: WatchFn<T>,
    resync: Option<Duration>,
    shutdown: CancellationToken,
) where
    T: Clone + Send + Sync + 'static,
{
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let snapshot = match (list)().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("list failed: {err}");
                if backoff(&shutdown).await {
                    return;
                }
                continue;
            }
        };
        let mut version = snapshot.resource_version.clone();
        store.replace(snapshot.items, &version);

        let mut events = match (watch)(version.clone()).await {
            Ok(events) => events,
            Err(err) => {
                warn!("watch failed: {err}");
                if backoff(&shutdown).await {
                    return;
                }
                continue;
            }
        };

        let resync_at = resync.map(|period| Instant::now() + period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = resync_due(resync_at) => {
                    debug!("resync period elapsed, relisting");
                    break;
                }
                event = events.next() => match event {
                    None => {
                        debug!(resource_version = %version, "watch stream closed, relisting");
                        if backoff(&shutdown).await {
                            return;
                        }
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(resource_version = %version, "watch error: {err}, relisting");
                        if backoff(&shutdown).await {
                            return;
                        }
                        break;
                    }
                    Some(Ok(WatchedEvent::Added(obj))) => {
                        if let Some(v) = store.version_of(&obj) {
                            version = v;
                        }
                        store.add(obj);
                    }
                    Some(Ok(WatchedEvent::Modified(obj))) => {
                        if let Some(v) = store.version_of(&obj) {
                            version = v;
                        }
                        store.update(obj);
                    }
                    Some(Ok(WatchedEvent::Deleted(obj))) => {
                        if let Some(v) = store.version_of(&obj) {
                            version = v;
                        }
                        store.delete(&obj);
                    }
                }
            }
        }
    }
}

/// Sleeps out the restart backoff; true means shutdown fired instead.
async fn backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(RESTART_BACKOFF) => false,
    }
}

async fn resync_due(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}

impl<K> ListWatcher<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Wires a `kube::Api` into the list and watch closures. Bookmarks are
    /// skipped; error events tear the stream down and trigger a relist.
    pub fn for_api(api: Api<K>, store: Arc<Store<K>>, resync: Option<Duration>) -> Self {
        let list_api = api.clone();
        let list: ListFn<K> = Box::new(move || {
            let api = list_api.clone();
            async move {
                let list = api
                    .list(&ListParams::default())
                    .await
                    .map_err(|err| WatchError::List(err.to_string()))?;
                let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
                Ok(ListSnapshot {
                    items: list.items,
                    resource_version,
                })
            }
            .boxed()
        });

        let watch: WatchFn<K> = Box::new(move |version: String| {
            let api = api.clone();
            async move {
                let events = api
                    .watch(&WatchParams::default(), &version)
                    .await
                    .map_err(|err| WatchError::Watch(err.to_string()))?;
                let events = events.filter_map(|event| async move {
                    match event {
                        Ok(WatchEvent::Added(obj)) => Some(Ok(WatchedEvent::Added(obj))),
                        Ok(WatchEvent::Modified(obj)) => Some(Ok(WatchedEvent::Modified(obj))),
                        Ok(WatchEvent::Deleted(obj)) => Some(Ok(WatchedEvent::Deleted(obj))),
                        Ok(WatchEvent::Bookmark(_)) => None,
                        Ok(WatchEvent::Error(err)) => {
                            Some(Err(WatchError::Watch(format!("{err:?}"))))
                        }
                        Err(err) => Some(Err(WatchError::Watch(err.to_string()))),
                    }
                });
                Ok(events.boxed())
            }
            .boxed()
        });

        ListWatcher::new(store, list, watch, resync)
    }
}

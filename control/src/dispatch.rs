//! Fan-in of typed store notifications onto the controller.
//!
//! Store callbacks must not block, so they only forward the typed change
//! into an unbounded channel; a single consumer task applies the events to
//! the controller in arrival order, which preserves each watcher's upstream
//! ordering.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::controller::Controller;
use crate::watch::{Change, ChangeType, OnChange};

/// A change notification from one of the watched collections.
pub enum ResourceEvent {
    ConfigMap(ChangeType, Change<ConfigMap>),
    Service(ChangeType, Change<Service>),
    Endpoints(ChangeType, Change<Endpoints>),
}

pub type EventSender = UnboundedSender<ResourceEvent>;
pub type EventReceiver = UnboundedReceiver<ResourceEvent>;

pub fn configmap_forwarder(events: EventSender) -> OnChange<ConfigMap> {
    forward(events, ResourceEvent::ConfigMap)
}

pub fn service_forwarder(events: EventSender) -> OnChange<Service> {
    forward(events, ResourceEvent::Service)
}

pub fn endpoints_forwarder(events: EventSender) -> OnChange<Endpoints> {
    forward(events, ResourceEvent::Endpoints)
}

fn forward<K, F>(events: EventSender, wrap: F) -> OnChange<K>
where
    K: Send + 'static,
    F: Fn(ChangeType, Change<K>) -> ResourceEvent + Send + Sync + 'static,
{
    Box::new(move |change_type, change| {
        if events.send(wrap(change_type, change)).is_err() {
            warn!("change dispatcher is gone, dropping event");
        }
    })
}

/// Applies queued events to the controller in arrival order. A panicking
/// handler is logged and skipped; one bad event must not take the process
/// down.
pub async fn run(controller: Arc<Controller>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        if AssertUnwindSafe(controller.apply(event))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!("event handler panicked, continuing with next event");
        }
    }
}

//! silta - Kubernetes to BIG-IP virtual-server controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Service};
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use control::config::{ControllerConfig, PoolMode};
use control::controller::Controller;
use control::dispatch;
use control::error::Error;
use control::watch::{ListWatcher, Store};
use control::writer::FileWriter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ControllerConfig::from_env()?;
    info!(
        namespace = %config.namespace,
        mode = %config.pool_mode,
        output = %config.output_path,
        "starting silta controller"
    );

    let client = Client::try_default().await?;
    let writer = Arc::new(FileWriter::new(config.output_path.clone()));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let configmap_store: Arc<Store<ConfigMap>> = Arc::new(Store::for_resource(Some(
        dispatch::configmap_forwarder(events_tx.clone()),
    )));
    let service_store: Arc<Store<Service>> = Arc::new(Store::for_resource(Some(
        dispatch::service_forwarder(events_tx.clone()),
    )));
    let endpoints_store: Arc<Store<Endpoints>> = Arc::new(Store::for_resource(Some(
        dispatch::endpoints_forwarder(events_tx),
    )));

    let controller = Arc::new(Controller::new(
        &config,
        writer,
        service_store.clone(),
        endpoints_store.clone(),
    ));
    tokio::spawn(dispatch::run(controller.clone(), events_rx));

    let resync = config.resync_interval();
    let configmaps = ListWatcher::for_api(
        Api::<ConfigMap>::namespaced(client.clone(), &config.namespace),
        configmap_store,
        resync,
    );
    let services = ListWatcher::for_api(
        Api::<Service>::namespaced(client.clone(), &config.namespace),
        service_store,
        resync,
    );
    let endpoints = ListWatcher::for_api(
        Api::<Endpoints>::namespaced(client.clone(), &config.namespace),
        endpoints_store,
        resync,
    );
    configmaps.run();
    services.run();
    endpoints.run();

    // In cluster mode pool members come from endpoints, so node addresses
    // are never consulted and polling them would be wasted work.
    if config.pool_mode == PoolMode::NodePort {
        let nodes: Api<Node> = Api::all(client);
        let poller = controller.clone();
        let period = Duration::from_secs(config.node_poll_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let listed = nodes
                    .list(&ListParams::default())
                    .await
                    .map(|list| list.items)
                    .map_err(Error::from);
                poller.process_node_update(listed).await;
            }
        });
    }

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    configmaps.stop();
    services.stop();
    endpoints.stop();

    Ok(())
}

//! Virtual-server reconciliation.
//!
//! The [`Controller`] owns the registry of declared virtual servers and the
//! node address cache, binds declarations (ConfigMaps) to backend state
//! (Services, Endpoints, Nodes) as change notifications arrive, and emits the
//! consolidated configuration through the configured writer after every
//! effective mutation.
//!
//! Lock order is registry first, then node cache; both are held across the
//! emission that follows a node state change.

use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Service, ServicePort};
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, PoolMode};
use crate::dispatch::ResourceEvent;
use crate::error::Error;
use crate::metrics;
use crate::parser::parse_virtual_server_config;
use crate::virtual_server::{backend_order, ServiceKey, VirtualServerConfig, POOL_INACTIVE};
use crate::watch::{Change, ChangeType, Store};
use crate::writer::ConfigWriter;

const WRITE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Controller {
    namespace: String,
    mode: PoolMode,
    use_node_internal: bool,
    schema_local: String,
    writer: Arc<dyn ConfigWriter>,
    services: Arc<Store<Service>>,
    endpoints: Arc<Store<Endpoints>>,
    virtual_servers: Mutex<HashMap<ServiceKey, VirtualServerConfig>>,
    nodes: Mutex<Vec<String>>,
}

impl Controller {
    pub fn new(
        config: &ControllerConfig,
        writer: Arc<dyn ConfigWriter>,
        services: Arc<Store<Service>>,
        endpoints: Arc<Store<Endpoints>>,
    ) -> Self {
        Controller {
            namespace: config.namespace.clone(),
            mode: config.pool_mode,
            use_node_internal: config.use_node_internal,
            schema_local: config.schema_local.clone(),
            writer,
            services,
            endpoints,
            virtual_servers: Mutex::new(HashMap::new()),
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Routes one dispatched change notification to its handler.
    pub async fn apply(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::ConfigMap(change_type, change) => {
                self.process_configmap_update(change_type, change).await;
            }
            ResourceEvent::Service(change_type, change) => {
                self.process_service_update(change_type, change).await;
            }
            ResourceEvent::Endpoints(change_type, change) => {
                self.process_endpoints_update(change_type, change).await;
            }
        }
    }

    pub async fn process_configmap_update(&self, change_type: ChangeType, change: Change<ConfigMap>) {
        let updated = match change {
            Change::Replaced(items) => {
                debug!("processing {} configmaps ({change_type:?})", items.len());
                let mut updated = false;
                for cm in &items {
                    updated |= self.apply_configmap(change_type, None, Some(cm)).await;
                }
                updated
            }
            Change::Object(delta) => {
                debug!("processing 1 configmap ({change_type:?})");
                self.apply_configmap(change_type, delta.old.as_ref(), delta.new.as_ref())
                    .await
            }
        };
        metrics::record_reconciliation("configmap", updated);
        if updated {
            self.output_config().await;
        }
    }

    pub async fn process_service_update(&self, change_type: ChangeType, change: Change<Service>) {
        let updated = match change {
            Change::Replaced(items) => {
                debug!("processing {} services ({change_type:?})", items.len());
                let mut updated = false;
                for svc in &items {
                    updated |= self.apply_service(change_type, None, Some(svc)).await;
                }
                updated
            }
            Change::Object(delta) => {
                debug!("processing 1 service ({change_type:?})");
                self.apply_service(change_type, delta.old.as_ref(), delta.new.as_ref())
                    .await
            }
        };
        metrics::record_reconciliation("service", updated);
        if updated {
            self.output_config().await;
        }
    }

    pub async fn process_endpoints_update(&self, change_type: ChangeType, change: Change<Endpoints>) {
        let updated = match change {
            Change::Replaced(items) => {
                debug!("processing {} endpoints ({change_type:?})", items.len());
                let mut updated = false;
                for eps in &items {
                    updated |= self.apply_endpoints(change_type, None, Some(eps)).await;
                }
                updated
            }
            Change::Object(delta) => {
                debug!("processing 1 endpoints ({change_type:?})");
                self.apply_endpoints(change_type, delta.old.as_ref(), delta.new.as_ref())
                    .await
            }
        };
        metrics::record_reconciliation("endpoints", updated);
        if updated {
            self.output_config().await;
        }
    }

    async fn apply_configmap(
        &self,
        change_type: ChangeType,
        old: Option<&ConfigMap>,
        new: Option<&ConfigMap>,
    ) -> bool {
        let cm = match change_type {
            ChangeType::Deleted => old,
            _ => new,
        };
        let Some(cm) = cm else { return false };

        let namespace = cm.namespace().unwrap_or_default();
        if namespace != self.namespace {
            warn!("receiving configmap updates for unwatched namespace {namespace}");
            return false;
        }

        let mut cfg = match parse_virtual_server_config(cm, &self.schema_local) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("could not get config for configmap {}: {err}", cm.name_any());
                return false;
            }
        };

        let service_name = cfg.virtual_server.backend.service_name.clone();
        let service_port = cfg.virtual_server.backend.service_port;
        let key = ServiceKey::new(service_name.clone(), service_port, &self.namespace);

        match change_type {
            ChangeType::Added | ChangeType::Updated | ChangeType::Replaced => {
                if let Some(svc) = self
                    .services
                    .get_by_key(&format!("{}/{service_name}", self.namespace))
                {
                    match self.mode {
                        PoolMode::NodePort => {
                            if service_type(&svc) == Some("NodePort") {
                                for port_spec in service_ports(&svc) {
                                    if port_spec.port == service_port {
                                        let node_port = port_spec.node_port.unwrap_or_default();
                                        debug!("service backend matched {key}: using node port {node_port}");
                                        cfg.virtual_server.backend.pool_member_port = node_port;
                                        cfg.virtual_server.backend.pool_member_addrs =
                                            self.nodes_from_cache().await;
                                    }
                                }
                            }
                        }
                        PoolMode::Cluster => {
                            match self
                                .endpoints
                                .get_by_key(&format!("{}/{service_name}", self.namespace))
                            {
                                Some(eps) => {
                                    for port_spec in service_ports(&svc) {
                                        if port_spec.port == service_port {
                                            let ip_ports = endpoint_addrs(&port_spec.name, &eps);
                                            debug!("found endpoints for backend {key}: {ip_ports:?}");
                                            cfg.virtual_server.backend.pool_member_port = 0;
                                            cfg.virtual_server.backend.pool_member_addrs = ip_ports;
                                        }
                                    }
                                }
                                None => debug!("no endpoints for backend {key}"),
                            }
                        }
                    }
                }

                // A changed (serviceName, servicePort) pair on update retires
                // the old registry entry.
                let mut retired_key = None;
                if change_type == ChangeType::Updated {
                    if let Some(old_cm) = old {
                        match parse_virtual_server_config(old_cm, &self.schema_local) {
                            Ok(old_cfg) => {
                                let old_key = old_cfg.service_key(&self.namespace);
                                if old_key.service_name != service_name
                                    || old_key.service_port != service_port
                                {
                                    retired_key = Some(old_key);
                                }
                            }
                            Err(_) => {
                                warn!("cannot parse previous value for configmap {}", old_cm.name_any());
                            }
                        }
                    }
                }

                cfg.virtual_server.frontend.virtual_server_name =
                    format!("{}_{}", self.namespace, cm.name_any());

                let mut registry = self.virtual_servers.lock().await;
                if registry.contains_key(&key)
                    && (change_type == ChangeType::Added || retired_key.is_some())
                {
                    warn!("overwriting existing entry for backend {key} - change type: {change_type:?}");
                }
                if let Some(old_key) = retired_key {
                    registry.remove(&old_key);
                }
                registry.insert(key, cfg);
                true
            }
            ChangeType::Deleted => {
                let mut registry = self.virtual_servers.lock().await;
                registry.remove(&key);
                true
            }
        }
    }

    async fn apply_service(
        &self,
        change_type: ChangeType,
        old: Option<&Service>,
        new: Option<&Service>,
    ) -> bool {
        let svc = match change_type {
            ChangeType::Deleted => old,
            _ => new,
        };
        let Some(svc) = svc else { return false };

        let namespace = svc.namespace().unwrap_or_default();
        if namespace != self.namespace {
            warn!("receiving service updates for unwatched namespace {namespace}");
            return false;
        }
        let service_name = svc.name_any();

        // Ports present on the old service but absent from the new one lose
        // their backends.
        let mut removed_ports: HashSet<i32> = HashSet::new();
        if change_type == ChangeType::Updated {
            if let Some(old_svc) = old {
                for port_spec in service_ports(old_svc) {
                    removed_ports.insert(port_spec.port);
                }
            }
        }

        let mut update_config = false;
        let mut registry = self.virtual_servers.lock().await;
        for port_spec in service_ports(svc) {
            let key = ServiceKey::new(service_name.clone(), port_spec.port, &self.namespace);
            if !registry.contains_key(&key) {
                continue;
            }
            removed_ports.remove(&port_spec.port);
            match change_type {
                ChangeType::Added | ChangeType::Updated | ChangeType::Replaced => match self.mode {
                    PoolMode::NodePort => {
                        if service_type(svc) == Some("NodePort") {
                            let node_port = port_spec.node_port.unwrap_or_default();
                            debug!("service backend matched {key}: using node port {node_port}");
                            let addrs = self.nodes_from_cache().await;
                            if let Some(vs) = registry.get_mut(&key) {
                                vs.virtual_server.backend.pool_member_port = node_port;
                                vs.virtual_server.backend.pool_member_addrs = addrs;
                                update_config = true;
                            }
                        }
                    }
                    PoolMode::Cluster => {
                        match self
                            .endpoints
                            .get_by_key(&format!("{}/{service_name}", self.namespace))
                        {
                            Some(eps) => {
                                let ip_ports = endpoint_addrs(&port_spec.name, &eps);
                                debug!("found endpoints for backend {key}: {ip_ports:?}");
                                if let Some(vs) = registry.get_mut(&key) {
                                    vs.virtual_server.backend.pool_member_port = 0;
                                    vs.virtual_server.backend.pool_member_addrs = ip_ports;
                                    update_config = true;
                                }
                            }
                            None => debug!("no endpoints for backend {key}"),
                        }
                    }
                },
                ChangeType::Deleted => {
                    if let Some(vs) = registry.get_mut(&key) {
                        vs.virtual_server.backend.pool_member_port = POOL_INACTIVE;
                        vs.virtual_server.backend.pool_member_addrs = Vec::new();
                        update_config = true;
                    }
                }
            }
        }

        for port in removed_ports {
            let key = ServiceKey::new(service_name.clone(), port, &self.namespace);
            if let Some(vs) = registry.get_mut(&key) {
                vs.virtual_server.backend.pool_member_port = POOL_INACTIVE;
                vs.virtual_server.backend.pool_member_addrs = Vec::new();
                update_config = true;
            }
        }

        update_config
    }

    async fn apply_endpoints(
        &self,
        change_type: ChangeType,
        old: Option<&Endpoints>,
        new: Option<&Endpoints>,
    ) -> bool {
        let eps = match change_type {
            ChangeType::Deleted => old,
            _ => new,
        };
        let Some(eps) = eps else { return false };

        let namespace = eps.namespace().unwrap_or_default();
        if namespace != self.namespace {
            warn!("receiving endpoint updates for unwatched namespace {namespace}");
            return false;
        }
        let service_name = eps.name_any();

        // Without the owning service there is nothing to resolve yet; its own
        // event will re-drive reconciliation.
        let Some(svc) = self.services.get_by_key(&format!("{namespace}/{service_name}")) else {
            return false;
        };

        let mut update_config = false;
        let mut registry = self.virtual_servers.lock().await;
        for port_spec in service_ports(&svc) {
            let key = ServiceKey::new(service_name.clone(), port_spec.port, &namespace);
            let Some(vs) = registry.get_mut(&key) else {
                continue;
            };
            match change_type {
                ChangeType::Added | ChangeType::Updated | ChangeType::Replaced => {
                    let ip_ports = endpoint_addrs(&port_spec.name, eps);
                    if ip_ports != vs.virtual_server.backend.pool_member_addrs {
                        debug!(
                            "updating endpoints for backend {key}: from {:?} to {ip_ports:?}",
                            vs.virtual_server.backend.pool_member_addrs
                        );
                        vs.virtual_server.backend.pool_member_port = 0;
                        vs.virtual_server.backend.pool_member_addrs = ip_ports;
                        update_config = true;
                    }
                }
                ChangeType::Deleted => {
                    vs.virtual_server.backend.pool_member_port = POOL_INACTIVE;
                    vs.virtual_server.backend.pool_member_addrs = Vec::new();
                    update_config = true;
                }
            }
        }

        update_config
    }

    /// Ingests a freshly listed node set. On any change to the schedulable
    /// node addresses, every active declaration's backend list is rewritten
    /// and the configuration re-emitted before the cache is replaced.
    pub async fn process_node_update(&self, nodes: Result<Vec<Node>, Error>) {
        let nodes = match nodes {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!("unable to get list of nodes: {err}");
                return;
            }
        };
        let mut new_nodes = node_addresses(&nodes, self.use_node_internal);
        new_nodes.sort();

        let mut registry = self.virtual_servers.lock().await;
        let mut cached = self.nodes.lock().await;
        if *cached != new_nodes {
            info!("change in node state detected");
            for vs in registry.values_mut() {
                if vs.is_active() {
                    vs.virtual_server.backend.pool_member_addrs = new_nodes.clone();
                }
            }
            self.output_config_locked(&registry).await;
            *cached = new_nodes;
        }
    }

    /// Copy of the currently cached node addresses.
    async fn nodes_from_cache(&self) -> Vec<String> {
        self.nodes.lock().await.clone()
    }

    async fn output_config(&self) {
        let registry = self.virtual_servers.lock().await;
        self.output_config_locked(&registry).await;
    }

    /// Must be called with the registry mutex held so the emitted document is
    /// a consistent snapshot.
    async fn output_config_locked(&self, registry: &HashMap<ServiceKey, VirtualServerConfig>) {
        let mut services: Vec<&VirtualServerConfig> =
            registry.values().filter(|vs| vs.is_active()).collect();
        services.sort_by(|a, b| backend_order(*a, *b));
        let count = services.len();

        let payload = match serde_json::to_value(&services) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to serialize virtual server configs: {err}");
                return;
            }
        };

        match self.writer.send_section("services", payload) {
            Err(err) => {
                warn!("failed to write virtual server config data: {err}");
                metrics::record_config_write("error", count);
            }
            Ok((done, failed)) => {
                // An abandoned channel reads as silence, not as a response.
                let done = async move {
                    match done.await {
                        Ok(()) => (),
                        Err(_) => pending().await,
                    }
                };
                let failed = async move {
                    match failed.await {
                        Ok(err) => err,
                        Err(_) => pending().await,
                    }
                };
                tokio::select! {
                    _ = done => {
                        info!("wrote {count} virtual server configs");
                        metrics::record_config_write("success", count);
                    }
                    err = failed => {
                        warn!("failed to write virtual server config data: {err}");
                        metrics::record_config_write("error", count);
                    }
                    _ = tokio::time::sleep(WRITE_RESPONSE_TIMEOUT) => {
                        warn!("did not receive config write response in 1s");
                        metrics::record_config_write("timeout", count);
                    }
                }
            }
        }
    }
}

fn service_type(svc: &Service) -> Option<&str> {
    svc.spec.as_ref().and_then(|spec| spec.type_.as_deref())
}

fn service_ports(svc: &Service) -> Vec<ServicePort> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default()
}

/// Sorted `"<ip>:<port>"` strings for every ready address behind the
/// endpoint port whose name matches `port_name`.
fn endpoint_addrs(port_name: &Option<String>, endpoints: &Endpoints) -> Vec<String> {
    let mut ip_ports = Vec::new();
    for subset in endpoints.subsets.clone().unwrap_or_default() {
        for port in subset.ports.clone().unwrap_or_default() {
            if port.name == *port_name {
                for addr in subset.addresses.clone().unwrap_or_default() {
                    ip_ports.push(format!("{}:{}", addr.ip, port.port));
                }
            }
        }
    }
    ip_ports.sort();
    ip_ports
}

/// Addresses of the selected type across all schedulable nodes.
fn node_addresses(nodes: &[Node], use_internal: bool) -> Vec<String> {
    let wanted = if use_internal { "InternalIP" } else { "ExternalIP" };
    let mut addrs = Vec::new();
    for node in nodes {
        if node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
        {
            continue;
        }
        let Some(status) = &node.status else { continue };
        for addr in status.addresses.clone().unwrap_or_default() {
            if addr.type_ == wanted {
                addrs.push(addr.address);
            }
        }
    }
    addrs
}

#[cfg(test)]
impl Controller {
    pub(crate) async fn virtual_server(&self, key: &ServiceKey) -> Option<VirtualServerConfig> {
        self.virtual_servers.lock().await.get(key).cloned()
    }

    pub(crate) async fn virtual_server_count(&self) -> usize {
        self.virtual_servers.lock().await.len()
    }

    pub(crate) async fn cached_nodes(&self) -> Vec<String> {
        self.nodes.lock().await.clone()
    }
}

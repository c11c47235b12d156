//! Data model of a declared virtual server.
//!
//! The serde shape mirrors the emitted document exactly; most of it comes
//! straight from a ConfigMap declaration, with `poolMemberPort` and
//! `poolMemberAddrs` filled in dynamically by the reconciler. See
//! `schemas/bigip-virtual-server_v0.1.2.json` for the consumed format.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Pool member port value marking a declaration inactive. Inactive entries
/// are kept in the registry but filtered from the emitted document.
pub const POOL_INACTIVE: i32 = -1;

/// Unique identity of a declared virtual server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub service_name: String,
    pub service_port: i32,
    pub namespace: String,
}

impl ServiceKey {
    pub fn new(service_name: impl Into<String>, service_port: i32, namespace: impl Into<String>) -> Self {
        ServiceKey {
            service_name: service_name.into(),
            service_port,
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.service_name, self.service_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerConfig {
    pub virtual_server: VirtualServer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualServer {
    pub backend: Backend,
    pub frontend: Frontend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub service_name: String,
    pub service_port: i32,
    #[serde(default)]
    pub pool_member_port: i32,
    /// Always serialized as an array, never null, so downstream consumers can
    /// iterate it unconditionally.
    #[serde(default)]
    pub pool_member_addrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_monitors: Option<Vec<HealthMonitor>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMonitor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i32>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frontend {
    /// Derived as `"<namespace>_<configMapName>"` when the declaration is
    /// inserted into the registry.
    #[serde(default)]
    pub virtual_server_name: String,
    pub partition: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_address: Option<VirtualAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_profile: Option<SslProfile>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iapp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iapp_pool_member_table: Option<IappPoolMemberTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iapp_options: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iapp_tables: Option<BTreeMap<String, IappTable>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iapp_variables: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f5_profile_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IappPoolMemberTable {
    pub name: String,
    pub columns: Vec<IappColumn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IappColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IappTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<String>>>,
}

impl VirtualServerConfig {
    pub fn is_active(&self) -> bool {
        self.virtual_server.backend.pool_member_port != POOL_INACTIVE
    }

    /// Registry key of this declaration within `namespace`.
    pub fn service_key(&self, namespace: &str) -> ServiceKey {
        ServiceKey::new(
            self.virtual_server.backend.service_name.clone(),
            self.virtual_server.backend.service_port,
            namespace,
        )
    }
}

/// Emission order: ascending by service name, then service port.
pub fn backend_order(a: &VirtualServerConfig, b: &VirtualServerConfig) -> Ordering {
    a.virtual_server
        .backend
        .service_name
        .cmp(&b.virtual_server.backend.service_name)
        .then_with(|| {
            a.virtual_server
                .backend
                .service_port
                .cmp(&b.virtual_server.backend.service_port)
        })
}

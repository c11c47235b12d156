//! Declaration parsing and schema validation.
//!
//! A declaration ConfigMap carries two data keys: `schema`, naming the JSON
//! schema to validate against, and `data`, the declaration itself. A schema
//! reference starting with `f5schemadb://` resolves to the local schema
//! store.

use jsonschema::{Draft, JSONSchema};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::Value;
use thiserror::Error;

use crate::virtual_server::VirtualServerConfig;

/// Prefix marking a schema bundled with the controller.
pub const SCHEMA_INDICATOR: &str = "f5schemadb://";

/// Default location of the bundled schemas inside the container image.
pub const DEFAULT_SCHEMA_LOCAL: &str = "file:///app/vendor/src/f5/schemas/";

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("configmap {0} does not contain schema key")]
    MissingSchemaKey(String),
    #[error("configmap {0} does not contain data key")]
    MissingDataKey(String),
    #[error("failed to load schema {0}: {1}")]
    SchemaLoad(String, String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("configMap is not valid, errors: {0:?}")]
    Invalid(Vec<String>),
}

/// Parses and validates the declaration carried by `cm`.
///
/// `schema_local` replaces the `f5schemadb://` indicator when resolving the
/// schema reference; surrounding whitespace and embedded quotes in the
/// reference are trimmed first.
pub fn parse_virtual_server_config(
    cm: &ConfigMap,
    schema_local: &str,
) -> Result<VirtualServerConfig, DeclarationError> {
    let name = cm.name_any();
    let empty = Default::default();
    let keys = cm.data.as_ref().unwrap_or(&empty);

    let schema_name = keys
        .get("schema")
        .ok_or_else(|| DeclarationError::MissingSchemaKey(name.clone()))?;
    let data = keys
        .get("data")
        .ok_or_else(|| DeclarationError::MissingDataKey(name.clone()))?;

    let schema_name = schema_name.trim().trim_matches('"');
    let location = if let Some(path) = schema_name.strip_prefix(SCHEMA_INDICATOR) {
        format!("{schema_local}{path}")
    } else {
        schema_name.to_string()
    };

    let schema_json = load_schema(&location)?;
    let schema = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .should_validate_formats(true)
        .compile(&schema_json)
        .map_err(|err| DeclarationError::SchemaLoad(location.clone(), err.to_string()))?;

    let instance: Value = serde_json::from_str(data)?;
    if let Err(violations) = schema.validate(&instance) {
        let violations: Vec<String> = violations
            .map(|err| format!("{}: {}", err.instance_path, err))
            .collect();
        return Err(DeclarationError::Invalid(violations));
    }

    Ok(serde_json::from_str(data)?)
}

fn load_schema(location: &str) -> Result<Value, DeclarationError> {
    let path = location.strip_prefix("file://").unwrap_or(location);
    let raw = std::fs::read_to_string(path)
        .map_err(|err| DeclarationError::SchemaLoad(location.to_string(), err.to_string()))?;
    serde_json::from_str(&raw)
        .map_err(|err| DeclarationError::SchemaLoad(location.to_string(), err.to_string()))
}

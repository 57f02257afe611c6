use crate::error::{Result, SeparationError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub manifest: String,
}

#[derive(Debug, Deserialize)]
pub struct Registry {
    pub default: String,
    pub models: Vec<RegistryEntry>,
}

/// Model used when none is named.
pub const DEFAULT_MODEL: &str = "htdemucs_ort_v1";

const REGISTRY_JSON: &str = include_str!("../../models/registry.json");

pub fn registry() -> Result<Registry> {
    Ok(serde_json::from_str(REGISTRY_JSON)?)
}

pub fn resolve_manifest_url(model_name: &str) -> Result<String> {
    let reg = registry()?;
    let target = if model_name.is_empty() {
        reg.default
    } else {
        model_name.to_string()
    };

    reg.models
        .into_iter()
        .find(|m| m.name == target)
        .map(|m| m.manifest)
        .ok_or_else(|| SeparationError::Registry(format!("Model `{target}` not found in registry")))
}

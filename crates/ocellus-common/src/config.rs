//! JSON configuration loading.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

/// Read and parse a JSON config file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)?;
    let value = serde_json::from_str(&raw)
        .map_err(|e| Error::serialization(format!("{}: {e}", path.display())))?;
    tracing::debug!("loaded config from {}", path.display());
    Ok(value)
}

/// Parse a JSON config from an in-memory string.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Render a config value as pretty JSON.
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

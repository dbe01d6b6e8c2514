use crate::envsubst::expand_env;
use anyhow::{anyhow, Context, Result};
use serde_yaml::Value;
use std::fs;
use std::path::Path;

use super::types::Config;
use super::validate::validate_config;

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config = parse_config(&raw)
        .with_context(|| format!("failed to load config: {}", path.display()))?;
    Ok(config)
}

pub(super) fn parse_config(raw: &str) -> Result<Config> {
    use serde::de::IntoDeserializer;

    let expanded = expand_env(raw).context("env expansion failed")?;
    let value: Value = serde_yaml::from_str(&expanded).context("yaml parse failed")?;

    let mut ignored = Vec::new();
    let config: Config =
        serde_ignored::deserialize(value.into_deserializer(), |path| {
            ignored.push(path.to_string())
        })
        .context("failed to deserialize config")?;
    if !ignored.is_empty() {
        ignored.sort();
        ignored.dedup();
        return Err(anyhow!(
            "unknown config keys (fix typos to avoid unexpected defaults): {}",
            ignored.join(", ")
        ));
    }

    validate_config(&config)?;
    Ok(config)
}

//! Configuration loading for `depotd`.

use anyhow::{Context, Result};
use depot_core::config::AppConfig;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use std::path::Path;

/// Prefix of environment overrides, e.g. `DEPOT_TRANSFER__CHUNK_WORKERS=4`.
pub const ENV_PREFIX: &str = "DEPOT_";

/// Layer defaults, the TOML file at `path` if it exists, then `DEPOT_`
/// environment variables with `__` separating nested keys.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
    if path.exists() {
        tracing::info!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path.display(), "No config file, using defaults and environment");
    }
    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .context("failed to load configuration")
}

//! topology connection config
use std::{env, num::NonZeroU32, path::Path, str};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// env var overriding [`Config::read_concurrency`]
pub const READ_CONCURRENCY_VAR: &str = "TOPO_READ_CONCURRENCY";
/// env var overriding [`Config::read_only`]
pub const READ_ONLY_VAR: &str = "TOPO_READ_ONLY";

/// Which store to connect to and how to admit traffic to it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// registered factory name
    #[serde(default = "default_implementation")]
    pub implementation: String,
    #[serde(default)]
    pub global_server_address: String,
    #[serde(default = "default_global_root")]
    pub global_root: String,
    /// max concurrent reads across every cell
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: NonZeroU32,
    /// reject all mutations locally
    #[serde(default)]
    pub read_only: bool,
}

pub fn default_implementation() -> String {
    "memory".to_owned()
}

pub fn default_global_root() -> String {
    "/topo/global".to_owned()
}

pub const fn default_read_concurrency() -> NonZeroU32 {
    match NonZeroU32::new(32) {
        Some(n) => n,
        None => unreachable!(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            implementation: default_implementation(),
            global_server_address: String::new(),
            global_root: default_global_root(),
            read_concurrency: default_read_concurrency(),
            read_only: false,
        }
    }
}

impl Config {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        match serde_json::from_str(input.as_ref()) {
            Ok(config) => Ok(config),
            Err(_err) => {
                serde_yaml::from_str(input.as_ref()).context("failed to decode topo config")
            }
        }
    }

    /// reads and decodes the config at `path`
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        debug!(?config);
        Ok(config)
    }

    /// applies `TOPO_READ_CONCURRENCY` / `TOPO_READ_ONLY` if set
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(n) = parse_var_opt(READ_CONCURRENCY_VAR)? {
            self.read_concurrency = n;
        }
        if let Some(read_only) = parse_var_opt(READ_ONLY_VAR)? {
            self.read_only = read_only;
        }
        Ok(self)
    }

    /// every effective setting keyed by name
    pub fn all_settings(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self).context("failed to encode topo config")? {
            Value::Object(settings) => Ok(settings),
            other => bail!("topo config encoded as {other}, expected an object"),
        }
    }

    /// writes the config to `path`, as YAML for `.yaml`/`.yml` and JSON for `.json`
    pub fn write_as<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let encoded = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::to_string_pretty(self).context("failed to encode topo config")?
            }
            Some("yaml" | "yml") => {
                serde_yaml::to_string(self).context("failed to encode topo config")?
            }
            _ => bail!(
                "unsupported config type for {}, expected .json, .yaml or .yml",
                path.display()
            ),
        };
        std::fs::write(path, encoded)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        debug!(path = %path.display(), "wrote topo config");
        Ok(())
    }

    /// logs every effective setting
    pub fn debug(&self) -> Result<()> {
        for (name, value) in self.all_settings()? {
            debug!(setting = %name, %value, "topo config");
        }
        Ok(())
    }
}

/// `None` when unset, an error naming the var when set but unparseable
fn parse_var_opt<T>(name: &str) -> Result<Option<T>>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("error parsing env var {name}")),
        Err(_) => Ok(None),
    }
}

//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{BucketDefinitions, BucketDefinition, RateLimit};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__STORE__TIMEOUT_MS`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Bucket definitions, in declaration order
    #[serde(default)]
    pub buckets: Vec<BucketDefinition>,

    /// Per-operation rate limit overrides
    #[serde(default)]
    pub operations: HashMap<String, RateLimit>,
}

/// Bucket store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bound on a single store round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Identifier for this process in logs (random when unset)
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            instance_id: None,
        }
    }
}

fn default_timeout_ms() -> u64 {
    500
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TollgateConfig {
    /// Load configuration from a file, with environment overrides.
    ///
    /// The file is parsed with `serde_yaml` so camelCase keys such as
    /// `consumeAmount` reach their serde aliases unchanged. `config` only
    /// supplies the `TOLLGATE__*` layer, which is merged over the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let load_error =
            |e: &dyn std::fmt::Display| TollgateError::Config(format!("Failed to load {}: {}", path.display(), e));

        let contents = std::fs::read_to_string(path).map_err(|e| load_error(&e))?;
        let mut document: serde_yaml::Value =
            serde_yaml::from_str(&contents).map_err(|e| load_error(&e))?;

        let overrides: serde_yaml::Value = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| load_error(&e))?;
        merge(&mut document, overrides);

        serde_yaml::from_value(document).map_err(|e| load_error(&e))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// The validated bucket definition list.
    pub fn definitions(&self) -> Result<BucketDefinitions> {
        BucketDefinitions::new(self.buckets.clone())
    }
}

/// Merge `overlay` into `base`. Mappings merge key by key, anything else is replaced.
fn merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    use serde_yaml::Value;

    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => {
            // an empty env layer must not wipe a scalar from the file
            let empty = overlay.as_mapping().is_some_and(|m| m.is_empty());
            if base.is_null() || !empty {
                *base = overlay;
            }
        }
    }
}

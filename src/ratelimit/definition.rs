//! Statically configured bucket definitions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Result, TollgateError};

/// A named bucket as it appears in configuration.
///
/// Definitions are not validated when loaded; `capacity` and the refill
/// period are checked the first time the bucket is used (see
/// [`BucketDefinition::bandwidth`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDefinition {
    /// Unique bucket name
    pub name: String,
    /// Maximum number of tokens the bucket holds
    #[serde(default)]
    pub capacity: u64,
    /// Seconds component of the refill period
    #[serde(default, alias = "refillSeconds")]
    pub refill_seconds: u64,
    /// Minutes component of the refill period
    #[serde(default, alias = "refillMinutes")]
    pub refill_minutes: u64,
}

impl BucketDefinition {
    /// Create a definition refilling `capacity` tokens every `refill_seconds`.
    pub fn new(name: impl Into<String>, capacity: u64, refill_seconds: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            refill_seconds,
            refill_minutes: 0,
        }
    }

    /// Set the minutes component of the refill period.
    pub fn with_refill_minutes(mut self, minutes: u64) -> Self {
        self.refill_minutes = minutes;
        self
    }
}

/// The read-only list of bucket definitions known to the process.
#[derive(Debug, Clone, Default)]
pub struct BucketDefinitions {
    definitions: Vec<BucketDefinition>,
}

impl BucketDefinitions {
    /// Build the definition list, rejecting duplicate names.
    pub fn new(definitions: Vec<BucketDefinition>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(definitions.len());
        for definition in &definitions {
            if !seen.insert(definition.name.as_str()) {
                error!(bucket = %definition.name, "Duplicate bucket definition");
                return Err(TollgateError::Config(format!(
                    "bucket '{}' is defined more than once",
                    definition.name
                )));
            }
        }

        Ok(Self { definitions })
    }

    /// Find the definition for a bucket name.
    pub fn find(&self, name: &str) -> Option<&BucketDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BucketDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

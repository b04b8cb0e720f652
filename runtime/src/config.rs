//! Coordinator configuration loaded from TOML.
//!
//! ```toml
//! [[workflows]]
//! workflow_type = "order-processing"
//! branches = ["inventory.checked", "order.validated"]   # priority order
//! output_topic = "order.ready"
//!
//! [retry]
//! max_retries = 5
//! initial_delay = 100    # milliseconds
//! max_delay = 5000
//!
//! [coordinator]
//! max_in_flight = 64
//!
//! [sweeper]
//! interval_secs = 30
//! batch_size = 100
//! lease_secs = 30        # how long a publisher's emission claim is honoured
//! ```

use crate::retry::RetryPolicy;
use fanin_core::workflow::WorkflowDefinitionError;
use fanin_core::{WorkflowDefinition, WorkflowType};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A workflow definition is malformed.
    #[error(transparent)]
    Workflow(#[from] WorkflowDefinitionError),

    /// Two workflows share a workflow type.
    #[error("Workflow '{0}' is defined more than once")]
    DuplicateWorkflow(WorkflowType),

    /// No workflows were configured.
    #[error("No workflows configured")]
    NoWorkflows,

    /// A numeric setting is out of range.
    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting {
        /// Setting name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Subscription loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Maximum branch events processed concurrently.
    pub max_in_flight: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self { max_in_flight: 64 }
    }
}

/// Emission sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Maximum pending instances re-published per sweep.
    pub batch_size: usize,
    /// Seconds an emission claim blocks other publishers.
    pub lease_secs: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 100,
            lease_secs: 30,
        }
    }
}

impl SweeperSettings {
    /// Sweep interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Emission claim lease.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Full coordinator configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FanInConfig {
    /// Workflow shapes to coordinate.
    pub workflows: Vec<WorkflowDefinition>,
    /// Back-off for re-attempting arrivals while the store is unavailable.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Subscription loop settings.
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    /// Emission sweeper settings.
    #[serde(default)]
    pub sweeper: SweeperSettings,
}

impl FanInConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the document is malformed or fails validation.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`FanInConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check every workflow and setting.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflows.is_empty() {
            return Err(ConfigError::NoWorkflows);
        }

        let mut seen = HashSet::new();
        for workflow in &self.workflows {
            workflow.validate()?;
            if !seen.insert(workflow.workflow_type()) {
                return Err(ConfigError::DuplicateWorkflow(
                    workflow.workflow_type().clone(),
                ));
            }
        }

        if self.coordinator.max_in_flight == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "coordinator.max_in_flight",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sweeper.interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "sweeper.interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sweeper.batch_size == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "sweeper.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

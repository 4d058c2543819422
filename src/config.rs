//! Orchestrator Configuration
//!
//! Loaded from YAML. Every key is optional; an empty document yields an
//! orchestrator with no active drivers in any category.

use crate::domain::ports::DriverCategory;
use crate::error::{Error, Result};
use crate::lifecycle::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Top-level configuration for the orchestrator and its modules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// OS drivers to activate, in selection order
    #[serde(default)]
    pub os_drivers: Vec<String>,

    /// Volume drivers to activate, in selection order
    #[serde(default)]
    pub volume_drivers: Vec<String>,

    /// Storage drivers to activate, in selection order
    #[serde(default)]
    pub storage_drivers: Vec<String>,

    /// Per-driver configuration blobs keyed by driver name
    #[serde(default)]
    pub drivers: BTreeMap<String, serde_json::Value>,

    /// Driver selection policy
    #[serde(default)]
    pub selection: DriverSelectionConfig,

    /// Polling and deadline settings for the operation lifecycle
    #[serde(default)]
    pub wait: WaitConfig,

    /// Volume manager behaviour
    #[serde(default)]
    pub volume: VolumeConfig,

    /// Extra module instances created at startup
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,

    /// Supervision timeout for module start
    #[serde(default = "default_module_start_timeout_secs")]
    pub module_start_timeout_secs: u64,
}

fn default_module_start_timeout_secs() -> u64 {
    3
}

fn default_interval_millis() -> u64 {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            os_drivers: Vec::new(),
            volume_drivers: Vec::new(),
            storage_drivers: Vec::new(),
            drivers: BTreeMap::new(),
            selection: DriverSelectionConfig::default(),
            wait: WaitConfig::default(),
            volume: VolumeConfig::default(),
            modules: Vec::new(),
            module_start_timeout_secs: default_module_start_timeout_secs(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Reject values that can never work
    pub fn validate(&self) -> Result<()> {
        if self.wait.interval_millis == 0 {
            return Err(Error::Configuration(
                "wait.intervalMillis must be greater than zero".into(),
            ));
        }
        if self.module_start_timeout_secs == 0 {
            return Err(Error::Configuration(
                "moduleStartTimeoutSecs must be greater than zero".into(),
            ));
        }
        for spec in &self.modules {
            if spec.module_type.is_empty() {
                return Err(Error::Configuration("module entry without a type".into()));
            }
        }
        Ok(())
    }

    /// Allow-list for a category
    pub fn allow_list(&self, category: DriverCategory) -> &[String] {
        match category {
            DriverCategory::Os => &self.os_drivers,
            DriverCategory::Volume => &self.volume_drivers,
            DriverCategory::Storage => &self.storage_drivers,
        }
    }

    /// Configuration blob for a driver, `Null` if none was given
    pub fn driver_config(&self, name: &str) -> serde_json::Value {
        self.drivers
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn module_start_timeout(&self) -> Duration {
        Duration::from_secs(self.module_start_timeout_secs)
    }
}

// =============================================================================
// Sections
// =============================================================================

/// How drivers are chosen for single-result operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSelectionConfig {
    /// Fail init when a category has more than one active driver
    #[serde(default)]
    pub exclusive: bool,
}

/// Polling settings for synchronous storage operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_interval_millis")]
    pub interval_millis: u64,

    /// Overall deadline in seconds; absent means wait forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval_millis: default_interval_millis(),
            timeout_secs: None,
        }
    }
}

impl WaitConfig {
    /// Build a wait policy whose cancellation follows `cancel`
    pub fn policy(&self, cancel: CancellationToken) -> WaitPolicy {
        WaitPolicy {
            interval: Duration::from_millis(self.interval_millis),
            timeout: self.timeout_secs.map(Duration::from_secs),
            cancel,
        }
    }
}

/// Volume manager behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Always mount with `preempt` set
    #[serde(default)]
    pub mount_preempt: bool,

    /// Unmount on every request regardless of the mount count
    #[serde(default)]
    pub unmount_ignore_used_count: bool,
}

/// An extra module instance to create at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Registered module type name
    #[serde(rename = "type")]
    pub module_type: String,

    /// Listen address, `tcp://host:port` or `unix:///path`
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Opaque module configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = OrchestratorConfig::from_yaml_str("{}").unwrap();
        assert!(config.storage_drivers.is_empty());
        assert_eq!(config.wait.interval_millis, 1000);
        assert!(config.wait.timeout_secs.is_none());
        assert_eq!(config.module_start_timeout(), Duration::from_secs(3));
        assert!(!config.selection.exclusive);
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
osDrivers: [mock]
volumeDrivers: [docker]
storageDrivers: [mock, ec2]
drivers:
  mock:
    convergeAfterPolls: 2
selection:
  exclusive: true
wait:
  intervalMillis: 250
  timeoutSecs: 30
volume:
  mountPreempt: true
modules:
  - type: admin
    address: tcp://127.0.0.1:9000
    description: second admin
"#;
        let config = OrchestratorConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.allow_list(DriverCategory::Storage), ["mock", "ec2"]);
        assert_eq!(config.allow_list(DriverCategory::Os), ["mock"]);
        assert_eq!(config.driver_config("mock")["convergeAfterPolls"], 2);
        assert!(config.driver_config("ec2").is_null());
        assert!(config.selection.exclusive);
        assert!(config.volume.mount_preempt);
        assert!(!config.volume.unmount_ignore_used_count);
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].module_type, "admin");

        let policy = config.wait.policy(CancellationToken::new());
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = OrchestratorConfig::from_yaml_str("wait:\n  intervalMillis: 0\n").unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storageDrivers: [mock]").unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.storage_drivers, vec!["mock".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = OrchestratorConfig::load("/nonexistent/volume-orchestrator.yaml").unwrap_err();
        assert_matches!(err, Error::Io(_));
    }
}

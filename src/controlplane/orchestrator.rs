//! Main Orchestrator - The "Brain"
//!
//! Owns the configuration and the driver registry, and turns the configured
//! allow-lists into three category managers:
//! - OS drivers (mount, format)
//! - Storage drivers (volumes, snapshots, attachments)
//! - Volume drivers (container volume plugins built on the other two)

use crate::config::OrchestratorConfig;
use crate::domain::ports::{
    Driver, DriverCategory, InitContext, OsDriver, StorageDriver, VolumeDriver,
};
use crate::driver::manager::{
    DriverManager, OsDriverManager, StorageDriverManager, VolumeDriverManager,
};
use crate::driver::registry::{DriverInstance, DriverRegistry};
use crate::error::{Error, Result};
use crate::lifecycle::WaitPolicy;
use crate::metrics::{outcome, Metrics};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Status
// =============================================================================

/// Active drivers per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub os_drivers: Vec<String>,
    pub storage_drivers: Vec<String>,
    pub volume_drivers: Vec<String>,
    pub registered_drivers: usize,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Builds and holds the active drivers of every category
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<DriverRegistry>,
    metrics: Metrics,
    /// Parent of every wait policy handed to drivers and managers
    shutdown: CancellationToken,
    os: Arc<OsDriverManager>,
    storage: Arc<StorageDriverManager>,
    volume: Arc<VolumeDriverManager>,
}

impl Orchestrator {
    /// Create an orchestrator; no driver is constructed until `init_drivers`
    pub fn new(config: OrchestratorConfig, registry: Arc<DriverRegistry>) -> Result<Self> {
        config.validate()?;

        let volume = VolumeDriverManager::new(
            DriverManager::new(DriverCategory::Volume, IndexMap::new()),
            config.volume.clone(),
        );

        Ok(Self {
            metrics: Metrics::new()?,
            shutdown: CancellationToken::new(),
            os: Arc::new(DriverManager::new(DriverCategory::Os, IndexMap::new())),
            storage: Arc::new(DriverManager::new(DriverCategory::Storage, IndexMap::new())),
            volume: Arc::new(volume),
            config,
            registry,
        })
    }

    /// Construct and initialise the drivers named in the allow-lists
    ///
    /// Categories are initialised OS, then Storage, then Volume, so volume
    /// drivers receive the finished OS and Storage managers. A driver whose
    /// init fails is logged and dropped.
    pub async fn init_drivers(&mut self) -> Result<()> {
        info!(registered = self.registry.len(), "Initializing drivers");

        let base = InitContext {
            wait: self.wait_policy(),
            ..Default::default()
        };

        let os: IndexMap<String, Arc<dyn OsDriver>> = self
            .activate(DriverCategory::Os, &base)
            .await
            .into_iter()
            .filter_map(|(name, driver)| match driver {
                DriverInstance::Os(driver) => Some((name, Arc::from(driver))),
                _ => None,
            })
            .collect();
        self.check_exclusive(DriverCategory::Os, os.len())?;
        self.os = Arc::new(self.manager(DriverCategory::Os, os));

        let storage: IndexMap<String, Arc<dyn StorageDriver>> = self
            .activate(DriverCategory::Storage, &base)
            .await
            .into_iter()
            .filter_map(|(name, driver)| match driver {
                DriverInstance::Storage(driver) => Some((name, Arc::from(driver))),
                _ => None,
            })
            .collect();
        self.check_exclusive(DriverCategory::Storage, storage.len())?;
        self.storage = Arc::new(self.manager(DriverCategory::Storage, storage));

        let volume_ctx = InitContext {
            os: Some(self.os.clone()),
            storage: Some(self.storage.clone()),
            ..base
        };
        let volume: IndexMap<String, Arc<dyn VolumeDriver>> = self
            .activate(DriverCategory::Volume, &volume_ctx)
            .await
            .into_iter()
            .filter_map(|(name, driver)| match driver {
                DriverInstance::Volume(driver) => Some((name, Arc::from(driver))),
                _ => None,
            })
            .collect();
        self.check_exclusive(DriverCategory::Volume, volume.len())?;
        self.volume = Arc::new(VolumeDriverManager::new(
            self.manager(DriverCategory::Volume, volume),
            self.config.volume.clone(),
        ));

        info!(
            os = %self.os.driver_names().join(" "),
            storage = %self.storage.driver_names().join(" "),
            volume = %self.volume.driver_names().join(" "),
            "Drivers initialized"
        );
        Ok(())
    }

    /// Construct and initialise every allow-listed driver of a category
    async fn activate(
        &self,
        category: DriverCategory,
        base: &InitContext,
    ) -> Vec<(String, DriverInstance)> {
        // First occurrence keeps its position
        let names: IndexSet<&String> = self.config.allow_list(category).iter().collect();
        let mut active = Vec::with_capacity(names.len());

        for name in names {
            let mut driver = match self.registry.construct(name, category) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(driver = %name, category = %category, error = %e, "skipping driver");
                    continue;
                }
            };

            let ctx = InitContext {
                driver_config: self.config.driver_config(name),
                ..base.clone()
            };

            let result = match &mut driver {
                DriverInstance::Os(d) => d.init(&ctx).await,
                DriverInstance::Volume(d) => d.init(&ctx).await,
                DriverInstance::Storage(d) => d.init(&ctx).await,
            };

            match result {
                Ok(()) => {
                    debug!(driver = %name, category = %category, "driver initialized");
                    self.metrics.record_driver_init(category, name, outcome::OK);
                    active.push((name.clone(), driver));
                }
                Err(e) => {
                    warn!(driver = %name, category = %category, error = %e, "driver init failed, dropping");
                    self.metrics.record_driver_init(category, name, outcome::FAILED);
                }
            }
        }

        active
    }

    fn manager<D: ?Sized>(
        &self,
        category: DriverCategory,
        drivers: IndexMap<String, Arc<D>>,
    ) -> DriverManager<D> {
        DriverManager::new(category, drivers)
            .with_wait(self.wait_policy())
            .with_metrics(self.metrics.clone())
    }

    fn check_exclusive(&self, category: DriverCategory, active: usize) -> Result<()> {
        if self.config.selection.exclusive && active > 1 {
            return Err(Error::Configuration(format!(
                "{} {} drivers active but selection.exclusive allows one",
                active, category
            )));
        }
        Ok(())
    }

    /// Wait policy from configuration, cancelled on shutdown
    pub fn wait_policy(&self) -> WaitPolicy {
        self.config.wait.policy(self.shutdown.child_token())
    }

    pub fn os(&self) -> Arc<OsDriverManager> {
        self.os.clone()
    }

    pub fn storage(&self) -> Arc<StorageDriverManager> {
        self.storage.clone()
    }

    pub fn volume(&self) -> Arc<VolumeDriverManager> {
        self.volume.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Cancel every in-flight wait
    pub fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            os_drivers: self.os.driver_names(),
            storage_drivers: self.storage.driver_names(),
            volume_drivers: self.volume.driver_names(),
            registered_drivers: self.registry.len(),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{MountOptions, VolumeOpts};
    use crate::driver::registry::DriverCtor;
    use crate::drivers::{register_builtin, storage_driver_named};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with(names: &[&'static str]) -> Arc<DriverRegistry> {
        let registry = DriverRegistry::new();
        for &name in names {
            registry.register(name, DriverCtor::storage(move || Box::new(storage_driver_named(name))));
        }
        Arc::new(registry)
    }

    fn config(yaml: &str) -> OrchestratorConfig {
        OrchestratorConfig::from_yaml_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_failed_driver_is_dropped() {
        let config = config(
            r#"
storageDrivers: [alpha, beta]
drivers:
  alpha:
    instanceId: i-alpha
  beta:
    failConnect: true
"#,
        );
        let mut orchestrator = Orchestrator::new(config, registry_with(&["alpha", "beta"])).unwrap();
        orchestrator.init_drivers().await.unwrap();

        let storage = orchestrator.storage();
        assert_eq!(storage.driver_names(), vec!["alpha".to_string()]);
        assert_eq!(storage.get_instance().await.unwrap().instance_id, "i-alpha");

        let rendered = orchestrator.metrics().render().unwrap();
        assert!(rendered.contains(r#"driver="beta""#));
    }

    #[tokio::test]
    async fn test_empty_allow_lists_not_detected() {
        let mut orchestrator =
            Orchestrator::new(OrchestratorConfig::default(), registry_with(&["alpha"])).unwrap();
        orchestrator.init_drivers().await.unwrap();

        assert_matches!(
            orchestrator.os().mounted("/mnt").await,
            Err(Error::NotDetected { category: DriverCategory::Os })
        );
        assert_matches!(
            orchestrator.storage().get_instance().await,
            Err(Error::NotDetected { category: DriverCategory::Storage })
        );
        assert_matches!(
            orchestrator.volume().path(Some("data"), None).await,
            Err(Error::NotDetected { category: DriverCategory::Volume })
        );
    }

    #[tokio::test]
    async fn test_only_allow_listed_drivers_constructed() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = DriverRegistry::new();
        registry.register("alpha", DriverCtor::storage(|| Box::new(storage_driver_named("alpha"))));
        let counter = built.clone();
        registry.register(
            "unused",
            DriverCtor::storage(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(storage_driver_named("unused"))
            }),
        );

        let mut orchestrator =
            Orchestrator::new(config("storageDrivers: [alpha]"), Arc::new(registry)).unwrap();
        assert_eq!(orchestrator.status().storage_drivers.len(), 0);

        orchestrator.init_drivers().await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.status().storage_drivers, vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_and_miscategorised_names_skipped() {
        let config = config(
            r#"
osDrivers: [alpha]
storageDrivers: [missing, alpha, alpha]
"#,
        );
        let mut orchestrator = Orchestrator::new(config, registry_with(&["alpha"])).unwrap();
        orchestrator.init_drivers().await.unwrap();

        let status = orchestrator.status();
        assert!(status.os_drivers.is_empty());
        assert_eq!(status.storage_drivers, vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_exclusive_selection() {
        let config = config(
            r#"
storageDrivers: [alpha, beta]
selection:
  exclusive: true
"#,
        );
        let mut orchestrator = Orchestrator::new(config, registry_with(&["alpha", "beta"])).unwrap();

        let err = orchestrator.init_drivers().await.unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }

    #[tokio::test]
    async fn test_first_configured_driver_serves_single_results() {
        let config = config(
            r#"
storageDrivers: [beta, alpha]
drivers:
  alpha:
    instanceId: i-alpha
  beta:
    instanceId: i-beta
"#,
        );
        let mut orchestrator = Orchestrator::new(config, registry_with(&["alpha", "beta"])).unwrap();
        orchestrator.init_drivers().await.unwrap();

        let storage = orchestrator.storage();
        assert_eq!(storage.get_instance().await.unwrap().instance_id, "i-beta");
        assert_eq!(storage.get_instances().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_volume_driver_sees_other_managers() {
        let registry = DriverRegistry::new();
        register_builtin(&registry);
        let config = config(
            r#"
osDrivers: [mock-os]
storageDrivers: [mock]
volumeDrivers: [docker]
drivers:
  docker:
    mountRoot: /mnt/volumes
"#,
        );

        let mut orchestrator = Orchestrator::new(config, Arc::new(registry)).unwrap();
        orchestrator.init_drivers().await.unwrap();

        let volume = orchestrator.volume();
        volume.create("data", &VolumeOpts::new()).await.unwrap();
        let mount_point = volume
            .mount(Some("data"), None, &MountOptions::default())
            .await
            .unwrap();

        assert_eq!(mount_point, "/mnt/volumes/data");
        assert_eq!(volume.mount_count("data"), 1);
        assert!(orchestrator.os().mounted("/mnt/volumes/data").await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waits() {
        let config = config(
            r#"
storageDrivers: [alpha]
drivers:
  alpha:
    instanceDelayMillis: 60000
"#,
        );
        let mut orchestrator = Orchestrator::new(config, registry_with(&["alpha"])).unwrap();
        orchestrator.init_drivers().await.unwrap();

        orchestrator.shutdown();
        assert!(orchestrator.is_shutdown());
        assert_matches!(
            orchestrator.storage().get_instances().await,
            Err(Error::Cancelled { .. })
        );
    }
}

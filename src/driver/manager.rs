//! Driver Managers
//!
//! A manager wraps the active drivers of one category behind the same
//! interface a single driver exposes. Single-result calls go to the first
//! active driver in configured order; `get_instances` and
//! `get_volume_mapping` visit every driver.

use crate::config::VolumeConfig;
use crate::domain::ports::{Driver, DriverCategory, InitContext, OsDriver, StorageDriver, VolumeDriver};
use crate::domain::types::{
    BlockDevice, CopySnapshotRequest, CreateSnapshotRequest, CreateVolumeRequest, Instance,
    MountInfo, MountOptions, Snapshot, Volume, VolumeAttachment, VolumeMapping, VolumeOpts,
};
use crate::error::{Error, Result};
use crate::lifecycle::wait::sleep_until_deadline;
use crate::lifecycle::{OpOptions, WaitPolicy};
use crate::metrics::{outcome, Metrics};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// =============================================================================
// Generic Manager
// =============================================================================

/// Active drivers of one category, in configured order
pub struct DriverManager<D: ?Sized> {
    category: DriverCategory,
    drivers: IndexMap<String, Arc<D>>,
    name: String,
    wait: WaitPolicy,
    metrics: Option<Metrics>,
}

pub type OsDriverManager = DriverManager<dyn OsDriver>;
pub type StorageDriverManager = DriverManager<dyn StorageDriver>;

impl<D: ?Sized> DriverManager<D> {
    pub fn new(category: DriverCategory, drivers: IndexMap<String, Arc<D>>) -> Self {
        let name = drivers.keys().cloned().collect::<Vec<_>>().join(" ");
        Self {
            category,
            drivers,
            name,
            wait: WaitPolicy::default(),
            metrics: None,
        }
    }

    /// Wait policy applied to fan-out calls
    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn category(&self) -> DriverCategory {
        self.category
    }

    /// The active drivers; empty when none are active
    pub fn drivers(&self) -> impl Iterator<Item = Arc<D>> + '_ {
        self.drivers.values().cloned()
    }

    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Driver serving single-result calls
    pub fn primary(&self) -> Result<&Arc<D>> {
        self.drivers
            .values()
            .next()
            .ok_or(Error::NotDetected {
                category: self.category,
            })
    }

    fn not_detected(&self) -> Result<()> {
        if self.drivers.is_empty() {
            return Err(Error::NotDetected {
                category: self.category,
            });
        }
        Ok(())
    }
}

impl<D: ?Sized> std::fmt::Debug for DriverManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverManager")
            .field("category", &self.category)
            .field("drivers", &self.name)
            .finish()
    }
}

#[async_trait]
impl<D: ?Sized + Send + Sync> Driver for DriverManager<D> {
    /// Space-joined names of the active drivers
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, _ctx: &InitContext) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// OS Manager
// =============================================================================

#[async_trait]
impl OsDriver for DriverManager<dyn OsDriver> {
    async fn get_mounts(
        &self,
        device: Option<&str>,
        mount_point: Option<&str>,
    ) -> Result<Vec<MountInfo>> {
        self.primary()?.get_mounts(device, mount_point).await
    }

    async fn mounted(&self, mount_point: &str) -> Result<bool> {
        self.primary()?.mounted(mount_point).await
    }

    async fn unmount(&self, mount_point: &str) -> Result<()> {
        self.primary()?.unmount(mount_point).await
    }

    async fn mount(
        &self,
        device: &str,
        target: &str,
        options: Option<&str>,
        label: Option<&str>,
    ) -> Result<()> {
        self.primary()?.mount(device, target, options, label).await
    }

    async fn format(&self, device: &str, fs_type: &str, overwrite: bool) -> Result<()> {
        self.primary()?.format(device, fs_type, overwrite).await
    }
}

// =============================================================================
// Storage Manager
// =============================================================================

impl DriverManager<dyn StorageDriver> {
    /// Ask every active driver for its instance concurrently
    ///
    /// Returns in completion order. The first failure is returned at once and
    /// the remaining in-flight lookups are aborted.
    pub async fn get_instances(&self) -> Result<Vec<Instance>> {
        self.not_detected()?;

        let mut tasks = JoinSet::new();
        for (name, driver) in &self.drivers {
            let name = name.clone();
            let driver = driver.clone();
            tasks.spawn(async move {
                let result = driver.get_instance().await;
                (name, result)
            });
        }

        let deadline = self.wait.deadline();
        let mut instances = Vec::with_capacity(self.drivers.len());

        loop {
            let joined = tokio::select! {
                biased;
                _ = self.wait.cancel.cancelled() => {
                    self.record_fanout(outcome::FAILED);
                    return Err(Error::Cancelled {
                        operation: "get_instances".into(),
                    });
                }
                _ = sleep_until_deadline(deadline) => {
                    self.record_fanout(outcome::TIMEOUT);
                    return Err(Error::WaitTimeout {
                        operation: "get_instances".into(),
                        resource: self.name.clone(),
                        waited: self.wait.timeout.unwrap_or_default(),
                    });
                }
                joined = tasks.join_next() => joined,
            };

            let Some(joined) = joined else {
                break;
            };

            let (name, result) = joined.map_err(|e| {
                self.record_fanout(outcome::FAILED);
                Error::Internal(format!("instance lookup task failed: {}", e))
            })?;

            match result {
                Ok(instance) => {
                    debug!(driver = %name, instance_id = %instance.instance_id, "got instance");
                    instances.push(instance);
                }
                Err(e) => {
                    warn!(driver = %name, error = %e, "instance lookup failed");
                    self.record_fanout(outcome::FAILED);
                    return Err(e);
                }
            }
        }

        self.record_fanout(outcome::OK);
        Ok(instances)
    }

    fn record_fanout(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fanout(outcome);
        }
    }
}

#[async_trait]
impl StorageDriver for DriverManager<dyn StorageDriver> {
    /// Block devices of every active driver, in configured order
    async fn get_volume_mapping(&self) -> Result<Vec<BlockDevice>> {
        self.not_detected()?;

        let mut devices = Vec::new();
        for (name, driver) in &self.drivers {
            let mapped = driver
                .get_volume_mapping()
                .await
                .map_err(|e| Error::BlockDeviceDiscovery {
                    driver: name.clone(),
                    reason: e.to_string(),
                })?;
            devices.extend(mapped);
        }
        Ok(devices)
    }

    async fn get_instance(&self) -> Result<Instance> {
        self.primary()?.get_instance().await
    }

    async fn get_volume(
        &self,
        volume_id: Option<&str>,
        volume_name: Option<&str>,
    ) -> Result<Vec<Volume>> {
        self.primary()?.get_volume(volume_id, volume_name).await
    }

    async fn get_volume_attach(
        &self,
        volume_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<VolumeAttachment>> {
        self.primary()?.get_volume_attach(volume_id, instance_id).await
    }

    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
        opts: &OpOptions,
    ) -> Result<Vec<Snapshot>> {
        self.primary()?.create_snapshot(request, opts).await
    }

    async fn get_snapshot(
        &self,
        volume_id: Option<&str>,
        snapshot_id: Option<&str>,
        snapshot_name: Option<&str>,
    ) -> Result<Vec<Snapshot>> {
        self.primary()?
            .get_snapshot(volume_id, snapshot_id, snapshot_name)
            .await
    }

    async fn remove_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.primary()?.remove_snapshot(snapshot_id).await
    }

    async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
        opts: &OpOptions,
    ) -> Result<Volume> {
        self.primary()?.create_volume(request, opts).await
    }

    async fn remove_volume(&self, volume_id: &str) -> Result<()> {
        self.primary()?.remove_volume(volume_id).await
    }

    async fn get_device_next_available(&self) -> Result<String> {
        self.primary()?.get_device_next_available().await
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        opts: &OpOptions,
    ) -> Result<Vec<VolumeAttachment>> {
        self.primary()?
            .attach_volume(volume_id, instance_id, opts)
            .await
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: Option<&str>,
        opts: &OpOptions,
    ) -> Result<()> {
        self.primary()?
            .detach_volume(volume_id, instance_id, opts)
            .await
    }

    async fn copy_snapshot(
        &self,
        request: &CopySnapshotRequest,
        opts: &OpOptions,
    ) -> Result<Snapshot> {
        self.primary()?.copy_snapshot(request, opts).await
    }
}

// =============================================================================
// Volume Manager
// =============================================================================

/// Volume drivers plus per-volume mount reference counts
pub struct VolumeDriverManager {
    inner: DriverManager<dyn VolumeDriver>,
    settings: VolumeConfig,
    mount_counts: Mutex<HashMap<String, usize>>,
}

impl VolumeDriverManager {
    pub fn new(inner: DriverManager<dyn VolumeDriver>, settings: VolumeConfig) -> Self {
        Self {
            inner,
            settings,
            mount_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn drivers(&self) -> impl Iterator<Item = Arc<dyn VolumeDriver>> + '_ {
        self.inner.drivers()
    }

    pub fn driver_names(&self) -> Vec<String> {
        self.inner.driver_names()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Successful mounts not yet matched by an unmount
    pub fn mount_count(&self, volume_name: &str) -> usize {
        self.mount_counts
            .lock()
            .get(volume_name)
            .copied()
            .unwrap_or_default()
    }

    pub async fn unmount_all(&self) -> Result<()> {
        self.inner.not_detected()
    }

    pub async fn remove_all(&self) -> Result<()> {
        self.inner.not_detected()
    }

    pub async fn detach_all(&self, instance_id: &str) -> Result<()> {
        self.inner.not_detected()?;
        debug!(instance_id, "detach all requested");
        Ok(())
    }

    fn count_key(volume_name: Option<&str>, volume_id: Option<&str>) -> String {
        volume_name.or(volume_id).unwrap_or_default().to_string()
    }
}

impl std::fmt::Debug for VolumeDriverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDriverManager")
            .field("drivers", &self.inner.name)
            .field("settings", &self.settings)
            .finish()
    }
}

#[async_trait]
impl Driver for VolumeDriverManager {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn init(&mut self, _ctx: &InitContext) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VolumeDriver for VolumeDriverManager {
    async fn mount(
        &self,
        volume_name: Option<&str>,
        volume_id: Option<&str>,
        options: &MountOptions,
    ) -> Result<String> {
        let driver = self.inner.primary()?;

        let mut options = options.clone();
        if self.settings.mount_preempt {
            options.preempt = true;
        }

        let mount_point = driver.mount(volume_name, volume_id, &options).await?;

        let key = Self::count_key(volume_name, volume_id);
        let count = {
            let mut counts = self.mount_counts.lock();
            let count = counts.entry(key.clone()).or_default();
            *count += 1;
            *count
        };
        debug!(volume = %key, count, mount_point = %mount_point, "mounted volume");
        Ok(mount_point)
    }

    async fn unmount(&self, volume_name: Option<&str>, volume_id: Option<&str>) -> Result<()> {
        let driver = self.inner.primary()?;
        let key = Self::count_key(volume_name, volume_id);

        let still_used = {
            let mut counts = self.mount_counts.lock();
            match counts.get_mut(&key) {
                Some(count) if !self.settings.unmount_ignore_used_count && *count > 1 => {
                    *count -= 1;
                    Some(*count)
                }
                _ => None,
            }
        };

        if let Some(count) = still_used {
            info!(volume = %key, count, "skipping unmount, volume still in use");
            return Ok(());
        }

        driver.unmount(volume_name, volume_id).await?;
        self.mount_counts.lock().remove(&key);
        Ok(())
    }

    async fn path(
        &self,
        volume_name: Option<&str>,
        volume_id: Option<&str>,
    ) -> Result<Option<String>> {
        self.inner.primary()?.path(volume_name, volume_id).await
    }

    async fn get(&self, volume_name: &str) -> Result<VolumeMapping> {
        self.inner.primary()?.get(volume_name).await
    }

    async fn list(&self) -> Result<Vec<VolumeMapping>> {
        self.inner.primary()?.list().await
    }

    async fn create(&self, volume_name: &str, opts: &VolumeOpts) -> Result<()> {
        self.inner.primary()?.create(volume_name, opts).await?;
        self.mount_counts.lock().remove(volume_name);
        Ok(())
    }

    async fn remove(&self, volume_name: &str) -> Result<()> {
        self.inner.primary()?.remove(volume_name).await
    }

    async fn attach(&self, volume_name: &str, instance_id: &str, force: bool) -> Result<String> {
        self.inner
            .primary()?
            .attach(volume_name, instance_id, force)
            .await
    }

    async fn detach(&self, volume_name: &str, instance_id: &str, force: bool) -> Result<()> {
        self.inner
            .primary()?
            .detach(volume_name, instance_id, force)
            .await
    }

    async fn network_name(&self, volume_name: &str, instance_id: &str) -> Result<String> {
        self.inner
            .primary()?
            .network_name(volume_name, instance_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::{storage_driver_named, MockOsDriver};
    use assert_matches::assert_matches;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn storage_driver(name: &str, config: serde_json::Value) -> Arc<dyn StorageDriver> {
        let mut driver = storage_driver_named(name);
        driver
            .init(&InitContext::with_config(config))
            .await
            .unwrap();
        Arc::new(driver)
    }

    fn storage_manager(drivers: Vec<(&str, Arc<dyn StorageDriver>)>) -> StorageDriverManager {
        let drivers = drivers
            .into_iter()
            .map(|(name, driver)| (name.to_string(), driver))
            .collect();
        DriverManager::new(DriverCategory::Storage, drivers)
    }

    #[derive(Default)]
    struct CountingVolumeDriver {
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
        preempted: AtomicUsize,
    }

    #[async_trait]
    impl Driver for CountingVolumeDriver {
        fn name(&self) -> &str {
            "counting"
        }

        async fn init(&mut self, _ctx: &InitContext) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl VolumeDriver for CountingVolumeDriver {
        async fn mount(
            &self,
            volume_name: Option<&str>,
            _volume_id: Option<&str>,
            options: &MountOptions,
        ) -> Result<String> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            if options.preempt {
                self.preempted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(format!("/mnt/{}", volume_name.unwrap_or_default()))
        }

        async fn unmount(&self, _volume_name: Option<&str>, _volume_id: Option<&str>) -> Result<()> {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn path(&self, _: Option<&str>, _: Option<&str>) -> Result<Option<String>> {
            Ok(None)
        }

        async fn get(&self, volume_name: &str) -> Result<VolumeMapping> {
            Ok(VolumeMapping {
                name: volume_name.to_string(),
                mountpoint: Some(format!("/mnt/{}", volume_name)),
            })
        }

        async fn list(&self) -> Result<Vec<VolumeMapping>> {
            Ok(vec![VolumeMapping {
                name: "data".into(),
                mountpoint: None,
            }])
        }

        async fn create(&self, _volume_name: &str, _opts: &VolumeOpts) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _volume_name: &str) -> Result<()> {
            Ok(())
        }

        async fn attach(&self, _: &str, _: &str, _: bool) -> Result<String> {
            Ok("/dev/xvda".into())
        }

        async fn detach(&self, _: &str, _: &str, _: bool) -> Result<()> {
            Ok(())
        }

        async fn network_name(&self, _: &str, _: &str) -> Result<String> {
            Ok("vol-1".into())
        }
    }

    fn volume_manager(settings: VolumeConfig) -> (VolumeDriverManager, Arc<CountingVolumeDriver>) {
        let driver = Arc::new(CountingVolumeDriver::default());
        let mut drivers: IndexMap<String, Arc<dyn VolumeDriver>> = IndexMap::new();
        drivers.insert("counting".into(), driver.clone());
        let inner = DriverManager::new(DriverCategory::Volume, drivers);
        (VolumeDriverManager::new(inner, settings), driver)
    }

    #[tokio::test]
    async fn test_empty_managers_not_detected() {
        let os: OsDriverManager = DriverManager::new(DriverCategory::Os, IndexMap::new());
        let storage: StorageDriverManager =
            DriverManager::new(DriverCategory::Storage, IndexMap::new());
        let volume = VolumeDriverManager::new(
            DriverManager::new(DriverCategory::Volume, IndexMap::new()),
            VolumeConfig::default(),
        );

        assert_matches!(
            os.mounted("/mnt").await,
            Err(Error::NotDetected { category: DriverCategory::Os })
        );
        assert_matches!(
            storage.get_instance().await,
            Err(Error::NotDetected { category: DriverCategory::Storage })
        );
        assert_matches!(storage.get_instances().await, Err(Error::NotDetected { .. }));
        assert_matches!(storage.get_volume_mapping().await, Err(Error::NotDetected { .. }));
        assert_matches!(
            volume.mount(Some("data"), None, &MountOptions::default()).await,
            Err(Error::NotDetected { category: DriverCategory::Volume })
        );
        assert_matches!(
            volume.get("data").await,
            Err(Error::NotDetected { category: DriverCategory::Volume })
        );
        assert_matches!(
            volume.list().await,
            Err(Error::NotDetected { category: DriverCategory::Volume })
        );
        assert_matches!(volume.detach_all("i-1").await, Err(Error::NotDetected { .. }));
        assert_matches!(volume.unmount_all().await, Err(Error::NotDetected { .. }));
        assert_matches!(volume.remove_all().await, Err(Error::NotDetected { .. }));
    }

    #[test]
    fn test_empty_drivers_idempotent() {
        let storage: StorageDriverManager =
            DriverManager::new(DriverCategory::Storage, IndexMap::new());

        for _ in 0..3 {
            assert_eq!(storage.drivers().count(), 0);
        }
        assert_eq!(storage.name(), "");
    }

    #[tokio::test]
    async fn test_get_instances_from_every_driver() {
        let manager = storage_manager(vec![
            ("alpha", storage_driver("alpha", serde_json::json!({ "instanceId": "i-alpha" })).await),
            ("beta", storage_driver("beta", serde_json::json!({ "instanceId": "i-beta" })).await),
            ("gamma", storage_driver("gamma", serde_json::json!({ "instanceId": "i-gamma" })).await),
        ]);

        let instances = manager.get_instances().await.unwrap();
        let ids: HashSet<String> = instances.into_iter().map(|i| i.instance_id).collect();

        let expected: HashSet<String> = ["i-alpha", "i-beta", "i-gamma"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(ids, expected);
        assert_eq!(manager.name(), "alpha beta gamma");
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_instances_returns_first_error() {
        let manager = storage_manager(vec![
            (
                "slow",
                storage_driver("slow", serde_json::json!({ "instanceDelayMillis": 60_000 })).await,
            ),
            ("broken", storage_driver("broken", serde_json::json!({ "failInstance": true })).await),
        ]);

        let started = tokio::time::Instant::now();
        let err = manager.get_instances().await.unwrap_err();

        assert_matches!(err, Error::BackendOperationFailed { ref operation, .. } if operation == "instance");
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_instances_honours_deadline_and_cancel() {
        let slow = || storage_driver("slow", serde_json::json!({ "instanceDelayMillis": 60_000 }));

        let manager = storage_manager(vec![("slow", slow().await)])
            .with_wait(WaitPolicy::default().with_timeout(Duration::from_secs(5)));
        assert_matches!(manager.get_instances().await, Err(Error::WaitTimeout { .. }));

        let cancel = CancellationToken::new();
        let manager = storage_manager(vec![("slow", slow().await)]).with_wait(WaitPolicy {
            cancel: cancel.clone(),
            ..Default::default()
        });
        cancel.cancel();
        assert_matches!(manager.get_instances().await, Err(Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_single_result_uses_first_configured_driver() {
        let manager = storage_manager(vec![
            ("beta", storage_driver("beta", serde_json::json!({ "instanceId": "i-beta" })).await),
            ("alpha", storage_driver("alpha", serde_json::json!({ "instanceId": "i-alpha" })).await),
        ]);

        for _ in 0..5 {
            assert_eq!(manager.get_instance().await.unwrap().instance_id, "i-beta");
        }
    }

    #[tokio::test]
    async fn test_volume_mapping_concatenates_drivers() {
        let alpha = storage_driver("alpha", serde_json::Value::Null).await;
        let beta = storage_driver("beta", serde_json::Value::Null).await;
        for driver in [&alpha, &beta] {
            let volume = driver
                .create_volume(&CreateVolumeRequest::named("data"), &OpOptions::default())
                .await
                .unwrap();
            driver
                .attach_volume(&volume.volume_id, "", &OpOptions::default())
                .await
                .unwrap();
        }

        let manager = storage_manager(vec![("alpha", alpha), ("beta", beta)]);
        let mapping = manager.get_volume_mapping().await.unwrap();
        assert_eq!(mapping.len(), 2);
    }

    #[tokio::test]
    async fn test_volume_mapping_failure_names_driver() {
        let manager = storage_manager(vec![(
            "broken",
            storage_driver("broken", serde_json::json!({ "failInstance": true })).await,
        )]);

        let err = manager.get_volume_mapping().await.unwrap_err();
        assert_matches!(err, Error::BlockDeviceDiscovery { ref driver, .. } if driver == "broken");
    }

    #[tokio::test]
    async fn test_os_manager_delegates() {
        let mut drivers: IndexMap<String, Arc<dyn OsDriver>> = IndexMap::new();
        drivers.insert("mock".into(), Arc::new(MockOsDriver::new()));
        let os = DriverManager::new(DriverCategory::Os, drivers);

        os.format("/dev/xvdf", "ext4", false).await.unwrap();
        os.mount("/dev/xvdf", "/mnt/data", None, None).await.unwrap();
        assert!(os.mounted("/mnt/data").await.unwrap());
        assert_eq!(os.get_mounts(None, Some("/mnt/data")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmount_skipped_while_mounted_twice() {
        let (manager, driver) = volume_manager(VolumeConfig::default());

        manager.mount(Some("data"), None, &MountOptions::default()).await.unwrap();
        manager.mount(Some("data"), None, &MountOptions::default()).await.unwrap();
        assert_eq!(manager.mount_count("data"), 2);

        manager.unmount(Some("data"), None).await.unwrap();
        assert_eq!(driver.unmounts.load(Ordering::SeqCst), 0);
        assert_eq!(manager.mount_count("data"), 1);

        manager.unmount(Some("data"), None).await.unwrap();
        assert_eq!(driver.unmounts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.mount_count("data"), 0);
    }

    #[tokio::test]
    async fn test_unmount_ignoring_count() {
        let (manager, driver) = volume_manager(VolumeConfig {
            mount_preempt: true,
            unmount_ignore_used_count: true,
        });

        manager.mount(Some("data"), None, &MountOptions::default()).await.unwrap();
        manager.mount(Some("data"), None, &MountOptions::default()).await.unwrap();
        assert_eq!(driver.preempted.load(Ordering::SeqCst), 2);

        manager.unmount(Some("data"), None).await.unwrap();
        assert_eq!(driver.unmounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_resets_count() {
        let (manager, _driver) = volume_manager(VolumeConfig::default());

        manager.mount(Some("data"), None, &MountOptions::default()).await.unwrap();
        manager.create("data", &VolumeOpts::new()).await.unwrap();
        assert_eq!(manager.mount_count("data"), 0);
        assert!(manager.detach_all("i-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_get_and_list_delegate_to_primary() {
        let (manager, _driver) = volume_manager(VolumeConfig::default());

        let mapping = manager.get("logs").await.unwrap();
        assert_eq!(mapping.name, "logs");
        assert_eq!(mapping.mountpoint.as_deref(), Some("/mnt/logs"));

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "data");
    }
}

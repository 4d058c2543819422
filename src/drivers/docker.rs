//! Docker Volume Driver
//!
//! Serves container volume plugins by composing the Storage manager (find,
//! create, attach the volume) with the OS manager (format and mount the
//! attached device).

use crate::domain::ports::{Driver, InitContext, OsDriver, StorageDriver, VolumeDriver};
use crate::domain::types::{
    CreateVolumeRequest, MountInfo, MountOptions, Volume, VolumeMapping, VolumeOpts,
};
use crate::driver::manager::{OsDriverManager, StorageDriverManager};
use crate::error::{Error, Result};
use crate::lifecycle::{OpOptions, WaitPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const DOCKER_NAME: &str = "docker";

pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/volume-orchestrator/volumes";
pub const DEFAULT_FS_TYPE: &str = "ext4";
pub const DEFAULT_SIZE_GB: u64 = 16;

/// Configuration blob of the docker driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSettings {
    #[serde(default = "default_mount_root")]
    pub mount_root: String,

    #[serde(default = "default_fs_type")]
    pub fs_type: String,

    /// Size in GB of volumes created without an explicit size
    #[serde(default = "default_size")]
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

fn default_mount_root() -> String {
    DEFAULT_MOUNT_ROOT.to_string()
}

fn default_fs_type() -> String {
    DEFAULT_FS_TYPE.to_string()
}

fn default_size() -> u64 {
    DEFAULT_SIZE_GB
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            fs_type: default_fs_type(),
            size: default_size(),
            volume_type: None,
            iops: None,
            availability_zone: None,
        }
    }
}

/// The `docker` volume driver
#[derive(Default)]
pub struct DockerVolumeDriver {
    settings: DockerSettings,
    os: Option<Arc<OsDriverManager>>,
    storage: Option<Arc<StorageDriverManager>>,
    wait: WaitPolicy,
}

impl DockerVolumeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    fn os(&self) -> Result<&OsDriverManager> {
        self.os.as_deref().ok_or_else(|| Error::DriverNotInitialized {
            driver: DOCKER_NAME.to_string(),
        })
    }

    fn storage(&self) -> Result<&StorageDriverManager> {
        self.storage
            .as_deref()
            .ok_or_else(|| Error::DriverNotInitialized {
                driver: DOCKER_NAME.to_string(),
            })
    }

    fn sync_opts(&self) -> OpOptions {
        OpOptions::new(false, self.wait.clone())
    }

    fn volume_name(volume: &Volume) -> &str {
        if volume.name.is_empty() {
            &volume.volume_id
        } else {
            &volume.name
        }
    }

    fn mount_point(&self, volume: &Volume) -> String {
        format!(
            "{}/{}",
            self.settings.mount_root.trim_end_matches('/'),
            Self::volume_name(volume)
        )
    }

    /// Name and local mount point of `volume`
    fn mapping(volume: &Volume, instance_id: &str, mounts: &[MountInfo]) -> VolumeMapping {
        let mountpoint = Self::attached_device(volume, instance_id).and_then(|device| {
            mounts
                .iter()
                .find(|m| m.device == device)
                .map(|m| m.mount_point.clone())
        });
        VolumeMapping {
            name: Self::volume_name(volume).to_string(),
            mountpoint,
        }
    }

    /// The one volume matching a name or ID
    async fn resolve_volume(
        &self,
        volume_name: Option<&str>,
        volume_id: Option<&str>,
    ) -> Result<Volume> {
        let volume_name = volume_name.filter(|n| !n.is_empty());
        let volume_id = volume_id.filter(|id| !id.is_empty());
        if volume_name.is_none() && volume_id.is_none() {
            return Err(Error::MissingVolumeSelector);
        }

        let mut volumes = self.storage()?.get_volume(volume_id, volume_name).await?;
        match volumes.len() {
            0 => Err(Error::NoVolumesReturned),
            1 => Ok(volumes.remove(0)),
            count => Err(Error::MultipleVolumesReturned { count }),
        }
    }

    async fn local_instance_id(&self) -> Result<String> {
        let mut instances = self.storage()?.get_instances().await?;
        match instances.len() {
            0 => Err(Error::NoInstances),
            1 => Ok(instances.remove(0).instance_id),
            count => Err(Error::MultipleInstances { count }),
        }
    }

    /// Device the volume is attached at on `instance_id`, if any
    fn attached_device(volume: &Volume, instance_id: &str) -> Option<String> {
        volume
            .attachments
            .iter()
            .find(|a| a.instance_id == instance_id)
            .map(|a| a.device_name.clone())
    }

    /// Attach `volume` to `instance_id`, taking it from other instances when
    /// `preempt` is set
    async fn ensure_attached(
        &self,
        volume: &Volume,
        instance_id: &str,
        preempt: bool,
    ) -> Result<String> {
        if let Some(device) = Self::attached_device(volume, instance_id) {
            return Ok(device);
        }

        let storage = self.storage()?;
        if !volume.attachments.is_empty() {
            if !preempt {
                return Err(Error::backend(
                    DOCKER_NAME,
                    "attach",
                    format!("volume {} is attached to another instance", volume.volume_id),
                ));
            }
            info!(volume_id = %volume.volume_id, "preempting volume from other instance");
            storage
                .detach_volume(&volume.volume_id, None, &self.sync_opts())
                .await?;
        }

        let attachments = storage
            .attach_volume(&volume.volume_id, instance_id, &self.sync_opts())
            .await?;
        attachments
            .into_iter()
            .find(|a| a.instance_id == instance_id)
            .map(|a| a.device_name)
            .ok_or_else(|| Error::VolumeNotAttached {
                volume_id: volume.volume_id.clone(),
            })
    }

    fn create_request(&self, volume_name: &str, opts: &VolumeOpts) -> Result<CreateVolumeRequest> {
        let number = |key: &str| -> Result<Option<u64>> {
            opts.get(key)
                .map(|value| {
                    value.parse::<u64>().map_err(|_| {
                        Error::Configuration(format!("invalid {} option: {}", key, value))
                    })
                })
                .transpose()
        };
        let text = |key: &str| opts.get(key).filter(|v| !v.is_empty()).cloned();

        let volume_id = text("volumeId");
        let snapshot_id = text("snapshotId");
        // A source volume or snapshot decides the size unless one is given
        let size_gb = match number("size")? {
            Some(size) => Some(size),
            None if volume_id.is_some() || snapshot_id.is_some() => None,
            None => Some(self.settings.size),
        };

        Ok(CreateVolumeRequest {
            name: Some(volume_name.to_string()),
            volume_id,
            snapshot_id,
            volume_type: text("volumeType").or_else(|| self.settings.volume_type.clone()),
            iops: number("iops")?.or(self.settings.iops),
            size_gb,
            availability_zone: text("availabilityZone")
                .or_else(|| self.settings.availability_zone.clone()),
        })
    }
}

#[async_trait]
impl Driver for DockerVolumeDriver {
    fn name(&self) -> &str {
        DOCKER_NAME
    }

    async fn init(&mut self, ctx: &InitContext) -> Result<()> {
        let missing = |manager: &str| Error::DriverInitFailed {
            driver: DOCKER_NAME.to_string(),
            reason: format!("{} manager unavailable", manager),
        };

        self.settings = ctx.settings()?;
        self.os = Some(ctx.os.clone().ok_or_else(|| missing("OS"))?);
        self.storage = Some(ctx.storage.clone().ok_or_else(|| missing("storage"))?);
        self.wait = ctx.wait.clone();

        info!(
            driver = DOCKER_NAME,
            mount_root = %self.settings.mount_root,
            fs_type = %self.settings.fs_type,
            "volume driver initialized"
        );
        Ok(())
    }
}

#[async_trait]
impl VolumeDriver for DockerVolumeDriver {
    async fn mount(
        &self,
        volume_name: Option<&str>,
        volume_id: Option<&str>,
        options: &MountOptions,
    ) -> Result<String> {
        let os = self.os()?;
        let volume = self.resolve_volume(volume_name, volume_id).await?;
        let instance_id = self.local_instance_id().await?;

        let device = self
            .ensure_attached(&volume, &instance_id, options.preempt)
            .await?;

        if let Some(existing) = os.get_mounts(Some(&device), None).await?.into_iter().next() {
            debug!(device = %device, mount_point = %existing.mount_point, "already mounted");
            return Ok(existing.mount_point);
        }

        let fs_type = options
            .new_fs_type
            .as_deref()
            .unwrap_or(&self.settings.fs_type);
        os.format(&device, fs_type, options.overwrite_fs).await?;

        let mount_point = self.mount_point(&volume);
        os.mount(&device, &mount_point, None, None).await?;

        info!(volume_id = %volume.volume_id, device = %device, mount_point = %mount_point, "mounted volume");
        Ok(mount_point)
    }

    async fn unmount(&self, volume_name: Option<&str>, volume_id: Option<&str>) -> Result<()> {
        let os = self.os()?;
        let volume = self.resolve_volume(volume_name, volume_id).await?;
        let instance_id = self.local_instance_id().await?;

        let Some(device) = Self::attached_device(&volume, &instance_id) else {
            debug!(volume_id = %volume.volume_id, "volume not attached here");
            return Ok(());
        };

        for mount in os.get_mounts(Some(&device), None).await? {
            os.unmount(&mount.mount_point).await?;
        }

        self.storage()?
            .detach_volume(&volume.volume_id, Some(&instance_id), &self.sync_opts())
            .await?;
        info!(volume_id = %volume.volume_id, "unmounted volume");
        Ok(())
    }

    async fn path(
        &self,
        volume_name: Option<&str>,
        volume_id: Option<&str>,
    ) -> Result<Option<String>> {
        let volume = self.resolve_volume(volume_name, volume_id).await?;
        let instance_id = self.local_instance_id().await?;

        let Some(device) = Self::attached_device(&volume, &instance_id) else {
            return Ok(None);
        };

        Ok(self
            .os()?
            .get_mounts(Some(&device), None)
            .await?
            .into_iter()
            .next()
            .map(|m| m.mount_point))
    }

    async fn get(&self, volume_name: &str) -> Result<VolumeMapping> {
        let os = self.os()?;
        let volume = self.resolve_volume(Some(volume_name), None).await?;
        let instance_id = self.local_instance_id().await?;
        let mounts = os.get_mounts(None, None).await?;
        Ok(Self::mapping(&volume, &instance_id, &mounts))
    }

    async fn list(&self) -> Result<Vec<VolumeMapping>> {
        let os = self.os()?;
        let volumes = self.storage()?.get_volume(None, None).await?;
        let instance_id = self.local_instance_id().await?;
        let mounts = os.get_mounts(None, None).await?;
        Ok(volumes
            .iter()
            .map(|volume| Self::mapping(volume, &instance_id, &mounts))
            .collect())
    }

    async fn create(&self, volume_name: &str, opts: &VolumeOpts) -> Result<()> {
        let storage = self.storage()?;
        if !storage.get_volume(None, Some(volume_name)).await?.is_empty() {
            debug!(volume = volume_name, "volume already exists");
            return Ok(());
        }

        let request = self.create_request(volume_name, opts)?;
        let volume = storage.create_volume(&request, &self.sync_opts()).await?;
        info!(volume = volume_name, volume_id = %volume.volume_id, size_gb = volume.size_gb, "created volume");
        Ok(())
    }

    async fn remove(&self, volume_name: &str) -> Result<()> {
        let volume = self.resolve_volume(Some(volume_name), None).await?;
        self.unmount(Some(volume_name), None).await?;
        self.storage()?.remove_volume(&volume.volume_id).await?;
        info!(volume = volume_name, volume_id = %volume.volume_id, "removed volume");
        Ok(())
    }

    async fn attach(&self, volume_name: &str, instance_id: &str, force: bool) -> Result<String> {
        let volume = self.resolve_volume(Some(volume_name), None).await?;
        let instance_id = if instance_id.is_empty() {
            self.local_instance_id().await?
        } else {
            instance_id.to_string()
        };
        self.ensure_attached(&volume, &instance_id, force).await
    }

    async fn detach(&self, volume_name: &str, instance_id: &str, _force: bool) -> Result<()> {
        let volume = self.resolve_volume(Some(volume_name), None).await?;
        let instance_id = Some(instance_id).filter(|id| !id.is_empty());
        self.storage()?
            .detach_volume(&volume.volume_id, instance_id, &self.sync_opts())
            .await
    }

    async fn network_name(&self, volume_name: &str, instance_id: &str) -> Result<String> {
        let volume = self.resolve_volume(Some(volume_name), None).await?;
        Self::attached_device(&volume, instance_id).ok_or(Error::VolumeNotAttached {
            volume_id: volume.volume_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DriverCategory;
    use crate::drivers::mock::{mock_storage_driver, MockOsDriver};
    use crate::driver::manager::DriverManager;
    use assert_matches::assert_matches;
    use indexmap::IndexMap;

    async fn docker(config: serde_json::Value) -> DockerVolumeDriver {
        let mut os_drivers: IndexMap<String, Arc<dyn OsDriver>> = IndexMap::new();
        os_drivers.insert("mock".into(), Arc::new(MockOsDriver::new()));

        let mut storage = mock_storage_driver();
        storage.init(&InitContext::default()).await.unwrap();
        let mut storage_drivers: IndexMap<String, Arc<dyn StorageDriver>> = IndexMap::new();
        storage_drivers.insert("mock".into(), Arc::new(storage));

        let ctx = InitContext {
            driver_config: config,
            os: Some(Arc::new(DriverManager::new(DriverCategory::Os, os_drivers))),
            storage: Some(Arc::new(DriverManager::new(
                DriverCategory::Storage,
                storage_drivers,
            ))),
            wait: WaitPolicy::default(),
        };

        let mut driver = DockerVolumeDriver::new();
        driver.init(&ctx).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_init_requires_managers() {
        let mut driver = DockerVolumeDriver::new();
        let err = driver.init(&InitContext::default()).await.unwrap_err();
        assert_matches!(err, Error::DriverInitFailed { ref driver, .. } if driver == DOCKER_NAME);
    }

    #[tokio::test]
    async fn test_settings_from_config() {
        let driver = docker(serde_json::json!({ "mountRoot": "/mnt/volumes", "size": 32 })).await;
        assert_eq!(driver.settings().mount_root, "/mnt/volumes");
        assert_eq!(driver.settings().size, 32);
        assert_eq!(driver.settings().fs_type, DEFAULT_FS_TYPE);
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let driver = docker(serde_json::Value::Null).await;

        driver.create("data", &VolumeOpts::new()).await.unwrap();
        // Creating twice is a no-op
        driver.create("data", &VolumeOpts::new()).await.unwrap();

        assert_eq!(driver.path(Some("data"), None).await.unwrap(), None);

        let mount_point = driver
            .mount(Some("data"), None, &MountOptions::default())
            .await
            .unwrap();
        assert_eq!(mount_point, format!("{}/data", DEFAULT_MOUNT_ROOT));
        assert_eq!(
            driver.path(Some("data"), None).await.unwrap().as_deref(),
            Some(mount_point.as_str())
        );

        // A second mount reuses the existing mount point
        let again = driver
            .mount(Some("data"), None, &MountOptions::default())
            .await
            .unwrap();
        assert_eq!(again, mount_point);

        assert_eq!(driver.network_name("data", "i-mock").await.unwrap(), "/dev/xvda");

        driver.unmount(Some("data"), None).await.unwrap();
        assert_eq!(driver.path(Some("data"), None).await.unwrap(), None);
        assert_matches!(
            driver.network_name("data", "i-mock").await,
            Err(Error::VolumeNotAttached { .. })
        );

        driver.remove("data").await.unwrap();
        assert_matches!(
            driver.path(Some("data"), None).await,
            Err(Error::NoVolumesReturned)
        );
    }

    #[tokio::test]
    async fn test_create_options() {
        let driver = docker(serde_json::json!({ "volumeType": "gp2" })).await;
        let opts: VolumeOpts = [("size".to_string(), "100".to_string())].into_iter().collect();
        let request = driver.create_request("data", &opts).unwrap();
        assert_eq!(request.size_gb, Some(100));
        assert_eq!(request.volume_type.as_deref(), Some("gp2"));

        let bad: VolumeOpts = [("iops".to_string(), "fast".to_string())].into_iter().collect();
        assert_matches!(
            driver.create_request("data", &bad),
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let driver = docker(serde_json::Value::Null).await;
        driver.create("data", &VolumeOpts::new()).await.unwrap();

        let device = driver.attach("data", "", false).await.unwrap();
        assert_eq!(device, "/dev/xvda");

        driver.detach("data", "i-mock", false).await.unwrap();
        assert_matches!(
            driver.network_name("data", "i-mock").await,
            Err(Error::VolumeNotAttached { .. })
        );
    }

    #[tokio::test]
    async fn test_get_and_list_report_mount_points() {
        let driver = docker(serde_json::Value::Null).await;
        driver.create("data", &VolumeOpts::new()).await.unwrap();
        driver.create("logs", &VolumeOpts::new()).await.unwrap();

        let data = driver.get("data").await.unwrap();
        assert_eq!(data.name, "data");
        assert_eq!(data.mountpoint, None);

        let mount_point = driver
            .mount(Some("data"), None, &MountOptions::default())
            .await
            .unwrap();
        assert_eq!(
            driver.get("data").await.unwrap().mountpoint.as_deref(),
            Some(mount_point.as_str())
        );

        let mut listed = driver.list().await.unwrap();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            listed,
            vec![
                VolumeMapping {
                    name: "data".into(),
                    mountpoint: Some(mount_point),
                },
                VolumeMapping {
                    name: "logs".into(),
                    mountpoint: None,
                },
            ]
        );

        assert_matches!(driver.get("missing").await, Err(Error::NoVolumesReturned));
    }

    #[tokio::test]
    async fn test_volume_selector_required() {
        let driver = docker(serde_json::Value::Null).await;
        assert_matches!(
            driver.path(None, None).await,
            Err(Error::MissingVolumeSelector)
        );
        assert_matches!(
            driver.mount(Some(""), Some(""), &MountOptions::default()).await,
            Err(Error::MissingVolumeSelector)
        );
    }

    #[tokio::test]
    async fn test_source_decides_size_unless_given() {
        let driver = docker(serde_json::json!({ "size": 32 })).await;

        let from_snapshot: VolumeOpts = [("snapshotId".to_string(), "snap-1".to_string())]
            .into_iter()
            .collect();
        let request = driver.create_request("data", &from_snapshot).unwrap();
        assert_eq!(request.size_gb, None);
        assert_eq!(request.snapshot_id.as_deref(), Some("snap-1"));

        let from_volume: VolumeOpts = [("volumeId".to_string(), "vol-1".to_string())]
            .into_iter()
            .collect();
        assert_eq!(driver.create_request("data", &from_volume).unwrap().size_gb, None);

        let sized: VolumeOpts = [
            ("snapshotId".to_string(), "snap-1".to_string()),
            ("size".to_string(), "64".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(driver.create_request("data", &sized).unwrap().size_gb, Some(64));

        let plain = driver.create_request("data", &VolumeOpts::new()).unwrap();
        assert_eq!(plain.size_gb, Some(32));
    }
}

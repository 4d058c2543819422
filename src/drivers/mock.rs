//! Mock Drivers
//!
//! In-memory OS driver and storage backend. The backend converges entities
//! (volumes, snapshots, attachments) after a configurable number of
//! describe calls, which exercises the same waits a real cloud would.

use crate::domain::ports::{Driver, InitContext, OsDriver};
use crate::domain::types::{status, BlockDevice, Instance, MountInfo, Snapshot, Volume, VolumeAttachment};
use crate::error::{Error, Result};
use crate::hardware::allocation::StaticPartitions;
use crate::lifecycle::{
    BackendFactory, LifecycleDriver, SnapshotFilter, StorageBackend, StorageBackendRef,
    VolumeFilter, VolumeSpec,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Driver and provider name
pub const MOCK_NAME: &str = "mock";

/// Device prefix used by the mock storage driver
pub const MOCK_DEVICE_PREFIX: &str = "/dev/xvd";

/// Size of a volume created without a size or source snapshot
const DEFAULT_VOLUME_SIZE_GB: u64 = 16;

// =============================================================================
// OS Driver
// =============================================================================

#[derive(Debug, Default)]
struct MockOsState {
    mounts: Vec<MountInfo>,
    /// device → filesystem type
    filesystems: HashMap<String, String>,
}

/// OS driver keeping its mount table in memory
#[derive(Debug)]
pub struct MockOsDriver {
    name: String,
    state: Mutex<MockOsState>,
}

impl Default for MockOsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOsDriver {
    pub fn new() -> Self {
        Self::named(MOCK_NAME)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockOsState::default()),
        }
    }

    /// Filesystem written to a device by `format`
    pub fn filesystem(&self, device: &str) -> Option<String> {
        self.state.lock().filesystems.get(device).cloned()
    }
}

#[async_trait]
impl Driver for MockOsDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, _ctx: &InitContext) -> Result<()> {
        debug!(driver = %self.name, "OS driver initialized");
        Ok(())
    }
}

#[async_trait]
impl OsDriver for MockOsDriver {
    async fn get_mounts(
        &self,
        device: Option<&str>,
        mount_point: Option<&str>,
    ) -> Result<Vec<MountInfo>> {
        let state = self.state.lock();
        Ok(state
            .mounts
            .iter()
            .filter(|m| device.map_or(true, |d| m.device == d))
            .filter(|m| mount_point.map_or(true, |p| m.mount_point == p))
            .cloned()
            .collect())
    }

    async fn mounted(&self, mount_point: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .mounts
            .iter()
            .any(|m| m.mount_point == mount_point))
    }

    async fn unmount(&self, mount_point: &str) -> Result<()> {
        self.state
            .lock()
            .mounts
            .retain(|m| m.mount_point != mount_point);
        Ok(())
    }

    async fn mount(
        &self,
        device: &str,
        target: &str,
        options: Option<&str>,
        _label: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let fs_type = state.filesystems.get(device).cloned().ok_or_else(|| {
            Error::backend(&self.name, "mount", format!("no filesystem on {}", device))
        })?;

        if state
            .mounts
            .iter()
            .any(|m| m.device == device && m.mount_point == target)
        {
            return Ok(());
        }

        state.mounts.push(MountInfo {
            device: device.to_string(),
            mount_point: target.to_string(),
            fs_type,
            options: options.unwrap_or_default().to_string(),
        });
        Ok(())
    }

    async fn format(&self, device: &str, fs_type: &str, overwrite: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.filesystems.contains_key(device) && !overwrite {
            return Ok(());
        }
        state
            .filesystems
            .insert(device.to_string(), fs_type.to_string());
        Ok(())
    }
}

// =============================================================================
// Storage Backend
// =============================================================================

/// Configuration blob accepted by the mock storage driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MockSettings {
    pub instance_id: String,
    pub instance_name: String,
    pub region: String,
    pub availability_zone: String,
    /// Describe calls before an entity reaches its ready state
    pub converge_after_polls: u32,
    /// Fail `connect`, and with it driver init
    pub fail_connect: bool,
    /// Fail every `instance` lookup
    pub fail_instance: bool,
    /// Fail `create_volume` requests that restore a snapshot
    pub fail_restore: bool,
    /// Delay before `instance` answers
    pub instance_delay_millis: u64,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            instance_id: "i-mock".into(),
            instance_name: "mock-instance".into(),
            region: "mock-region-1".into(),
            availability_zone: "mock-region-1a".into(),
            converge_after_polls: 0,
            fail_connect: false,
            fail_instance: false,
            fail_restore: false,
            instance_delay_millis: 0,
        }
    }
}

#[derive(Debug)]
struct MockAttachment {
    attachment: VolumeAttachment,
    polls_left: u32,
    detaching: bool,
}

#[derive(Debug)]
struct MockVolume {
    volume: Volume,
    polls_left: u32,
    attachments: Vec<MockAttachment>,
}

impl MockVolume {
    /// One describe call's worth of progress
    fn advance(&mut self) {
        self.polls_left = self.polls_left.saturating_sub(1);
        for a in &mut self.attachments {
            a.polls_left = a.polls_left.saturating_sub(1);
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        self.attachments.retain(|a| !(a.detaching && a.polls_left == 0));
        for a in &mut self.attachments {
            if !a.detaching && a.polls_left == 0 {
                a.attachment.status = status::ATTACHED.to_string();
            }
        }

        let in_use = self
            .attachments
            .iter()
            .any(|a| a.attachment.status == status::ATTACHED);
        self.volume.status = if self.polls_left > 0 {
            status::VOLUME_CREATING
        } else if in_use {
            status::VOLUME_IN_USE
        } else {
            status::VOLUME_AVAILABLE
        }
        .to_string();
        self.volume.attachments = self.attachments.iter().map(|a| a.attachment.clone()).collect();
    }
}

#[derive(Debug)]
struct MockSnapshot {
    snapshot: Snapshot,
    polls_left: u32,
}

impl MockSnapshot {
    fn advance(&mut self) {
        self.polls_left = self.polls_left.saturating_sub(1);
        self.refresh();
    }

    fn refresh(&mut self) {
        self.snapshot.status = if self.polls_left > 0 {
            status::SNAPSHOT_PENDING
        } else {
            status::SNAPSHOT_COMPLETED
        }
        .to_string();
    }
}

#[derive(Debug, Default)]
struct RegionState {
    volumes: BTreeMap<String, MockVolume>,
    snapshots: BTreeMap<String, MockSnapshot>,
}

#[derive(Debug, Default)]
struct MockWorld {
    regions: HashMap<String, RegionState>,
    next_id: u64,
}

impl MockWorld {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }
}

/// In-memory storage backend
///
/// Clients returned by `for_region` share one world, so a snapshot copied
/// into another region is visible to every client bound to that region.
#[derive(Debug)]
pub struct MockBackend {
    settings: MockSettings,
    region: String,
    world: Arc<Mutex<MockWorld>>,
    calls: Arc<AtomicUsize>,
    describes: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(settings: MockSettings) -> Self {
        Self {
            region: settings.region.clone(),
            settings,
            world: Arc::new(Mutex::new(MockWorld::default())),
            calls: Arc::new(AtomicUsize::new(0)),
            describes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests issued so far across every region client
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `describe_volumes` requests issued so far
    pub fn volume_describes(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn not_found(&self, operation: &str, what: &str, id: &str) -> Error {
        Error::backend(MOCK_NAME, operation, format!("{} {} not found", what, id))
    }

    fn initial_polls(&self) -> u32 {
        self.settings.converge_after_polls
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        MOCK_NAME
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn connect(&self) -> Result<()> {
        self.record_call();
        if self.settings.fail_connect {
            return Err(Error::backend(MOCK_NAME, "connect", "connection refused"));
        }
        Ok(())
    }

    async fn instance(&self) -> Result<Instance> {
        self.record_call();
        if self.settings.instance_delay_millis > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.instance_delay_millis)).await;
        }
        if self.settings.fail_instance {
            return Err(Error::backend(MOCK_NAME, "instance", "metadata service unavailable"));
        }
        Ok(Instance {
            provider_name: MOCK_NAME.to_string(),
            instance_id: self.settings.instance_id.clone(),
            region: self.region.clone(),
            name: self.settings.instance_name.clone(),
        })
    }

    async fn block_devices(&self, instance_id: &str) -> Result<Vec<BlockDevice>> {
        self.record_call();
        let world = self.world.lock();
        let Some(region) = world.regions.get(&self.region) else {
            return Ok(Vec::new());
        };

        Ok(region
            .volumes
            .values()
            .flat_map(|v| v.attachments.iter().map(move |a| (v, a)))
            .filter(|(_, a)| a.attachment.instance_id == instance_id)
            .map(|(v, a)| BlockDevice {
                provider_name: MOCK_NAME.to_string(),
                instance_id: instance_id.to_string(),
                volume_id: v.volume.volume_id.clone(),
                device_name: a.attachment.device_name.clone(),
                region: self.region.clone(),
                status: a.attachment.status.clone(),
                network_name: v.volume.volume_id.clone(),
            })
            .collect())
    }

    async fn describe_volumes(&self, filter: &VolumeFilter) -> Result<Vec<Volume>> {
        self.record_call();
        self.describes.fetch_add(1, Ordering::SeqCst);
        let mut world = self.world.lock();
        let region = world.regions.entry(self.region.clone()).or_default();

        Ok(region
            .volumes
            .values_mut()
            .filter(|v| filter.matches(&v.volume))
            .map(|v| {
                v.advance();
                v.volume.clone()
            })
            .collect())
    }

    async fn describe_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        self.record_call();
        let mut world = self.world.lock();
        let region = world.regions.entry(self.region.clone()).or_default();

        Ok(region
            .snapshots
            .values_mut()
            .filter(|s| filter.matches(&s.snapshot))
            .map(|s| {
                s.advance();
                s.snapshot.clone()
            })
            .collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume> {
        self.record_call();
        if self.settings.fail_restore && spec.snapshot_id.is_some() {
            return Err(Error::backend(MOCK_NAME, "create_volume", "volume quota exceeded"));
        }
        let mut world = self.world.lock();
        let volume_id = world.next_id("vol");
        let region = world.regions.entry(self.region.clone()).or_default();

        let source_size = match spec.snapshot_id.as_deref() {
            Some(snapshot_id) => Some(
                region
                    .snapshots
                    .get(snapshot_id)
                    .map(|s| s.snapshot.volume_size_gb)
                    .ok_or_else(|| self.not_found("create_volume", "snapshot", snapshot_id))?,
            ),
            None => None,
        };

        let mut volume = MockVolume {
            volume: Volume {
                volume_id: volume_id.clone(),
                availability_zone: spec
                    .availability_zone
                    .clone()
                    .unwrap_or_else(|| self.settings.availability_zone.clone()),
                volume_type: spec.volume_type.clone().unwrap_or_else(|| "standard".into()),
                iops: spec.iops.unwrap_or_default(),
                size_gb: spec
                    .size_gb
                    .or(source_size)
                    .unwrap_or(DEFAULT_VOLUME_SIZE_GB),
                ..Default::default()
            },
            polls_left: self.initial_polls(),
            attachments: Vec::new(),
        };
        volume.refresh();

        let created = volume.volume.clone();
        region.volumes.insert(volume_id, volume);
        Ok(created)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.record_call();
        let mut world = self.world.lock();
        let region = world.regions.entry(self.region.clone()).or_default();

        match region.volumes.get(volume_id) {
            None => Err(self.not_found("delete_volume", "volume", volume_id)),
            Some(v) if !v.attachments.is_empty() => Err(Error::backend(
                MOCK_NAME,
                "delete_volume",
                format!("volume {} is attached", volume_id),
            )),
            Some(_) => {
                region.volumes.remove(volume_id);
                Ok(())
            }
        }
    }

    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<Snapshot> {
        self.record_call();
        let mut world = self.world.lock();
        let snapshot_id = world.next_id("snap");
        let region = world.regions.entry(self.region.clone()).or_default();

        let size = region
            .volumes
            .get(volume_id)
            .map(|v| v.volume.size_gb)
            .ok_or_else(|| self.not_found("create_snapshot", "volume", volume_id))?;

        let mut snapshot = MockSnapshot {
            snapshot: Snapshot {
                volume_id: volume_id.to_string(),
                snapshot_id: snapshot_id.clone(),
                volume_size_gb: size,
                start_time: Some(chrono::Utc::now()),
                description: description.to_string(),
                ..Default::default()
            },
            polls_left: self.initial_polls(),
        };
        snapshot.refresh();

        let created = snapshot.snapshot.clone();
        region.snapshots.insert(snapshot_id, snapshot);
        Ok(created)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.record_call();
        let mut world = self.world.lock();
        let region = world.regions.entry(self.region.clone()).or_default();

        region
            .snapshots
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| self.not_found("delete_snapshot", "snapshot", snapshot_id))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment> {
        self.record_call();
        let polls = self.initial_polls();
        let mut world = self.world.lock();
        let region = world.regions.entry(self.region.clone()).or_default();

        let volume = region
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| self.not_found("attach_volume", "volume", volume_id))?;

        let attachment = VolumeAttachment {
            volume_id: volume_id.to_string(),
            instance_id: instance_id.to_string(),
            device_name: device.to_string(),
            status: status::ATTACHING.to_string(),
        };
        volume.attachments.push(MockAttachment {
            attachment: attachment.clone(),
            polls_left: polls,
            detaching: false,
        });
        volume.refresh();
        Ok(attachment)
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: Option<&str>,
        _force: bool,
    ) -> Result<()> {
        self.record_call();
        let polls = self.initial_polls();
        let mut world = self.world.lock();
        let region = world.regions.entry(self.region.clone()).or_default();

        let volume = region
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| self.not_found("detach_volume", "volume", volume_id))?;

        for a in volume
            .attachments
            .iter_mut()
            .filter(|a| instance_id.map_or(true, |id| a.attachment.instance_id == id))
        {
            a.detaching = true;
            a.polls_left = polls;
            a.attachment.status = "detaching".to_string();
        }
        volume.refresh();
        Ok(())
    }

    async fn copy_snapshot(
        &self,
        source_region: &str,
        snapshot_id: &str,
        description: &str,
    ) -> Result<Snapshot> {
        self.record_call();
        let polls = self.initial_polls();
        let mut world = self.world.lock();

        let source = world
            .regions
            .get(source_region)
            .and_then(|r| r.snapshots.get(snapshot_id))
            .map(|s| s.snapshot.clone())
            .ok_or_else(|| self.not_found("copy_snapshot", "snapshot", snapshot_id))?;

        let copied_id = world.next_id("snap");
        let mut copy = MockSnapshot {
            snapshot: Snapshot {
                snapshot_id: copied_id.clone(),
                start_time: Some(chrono::Utc::now()),
                description: description.to_string(),
                name: String::new(),
                ..source
            },
            polls_left: polls,
        };
        copy.refresh();

        let created = copy.snapshot.clone();
        world
            .regions
            .entry(self.region.clone())
            .or_default()
            .snapshots
            .insert(copied_id, copy);
        Ok(created)
    }

    async fn tag(&self, resource_id: &str, name: &str) -> Result<()> {
        self.record_call();
        let mut world = self.world.lock();
        let region = world.regions.entry(self.region.clone()).or_default();

        if let Some(volume) = region.volumes.get_mut(resource_id) {
            volume.volume.name = name.to_string();
            return Ok(());
        }
        if let Some(snapshot) = region.snapshots.get_mut(resource_id) {
            snapshot.snapshot.name = name.to_string();
            return Ok(());
        }
        Err(self.not_found("tag", "resource", resource_id))
    }

    async fn for_region(&self, region: &str) -> Result<StorageBackendRef> {
        self.record_call();
        Ok(Arc::new(MockBackend {
            settings: self.settings.clone(),
            region: region.to_string(),
            world: self.world.clone(),
            calls: self.calls.clone(),
            describes: self.describes.clone(),
        }))
    }
}

// =============================================================================
// Storage Driver
// =============================================================================

/// The `mock` storage driver
pub fn mock_storage_driver() -> LifecycleDriver {
    storage_driver_named(MOCK_NAME)
}

/// A mock storage driver registered under another name
///
/// Each driver gets its own backend world, built from its configuration
/// blob at init.
pub fn storage_driver_named(name: &str) -> LifecycleDriver {
    let factory: BackendFactory = Arc::new(|ctx: &InitContext| {
        let settings: MockSettings = ctx.settings()?;
        Ok(Arc::new(MockBackend::new(settings)) as StorageBackendRef)
    });

    LifecycleDriver::new(
        name,
        MOCK_DEVICE_PREFIX,
        Arc::new(StaticPartitions::default()),
        factory,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_os_mount_requires_filesystem() {
        let os = MockOsDriver::new();

        let err = os.mount("/dev/xvdf", "/mnt/data", None, None).await.unwrap_err();
        assert_matches!(err, Error::BackendOperationFailed { .. });

        os.format("/dev/xvdf", "ext4", false).await.unwrap();
        os.mount("/dev/xvdf", "/mnt/data", Some("rw"), None).await.unwrap();

        assert!(os.mounted("/mnt/data").await.unwrap());
        let mounts = os.get_mounts(Some("/dev/xvdf"), None).await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fs_type, "ext4");
        assert_eq!(mounts[0].options, "rw");

        os.unmount("/mnt/data").await.unwrap();
        assert!(!os.mounted("/mnt/data").await.unwrap());
    }

    #[tokio::test]
    async fn test_os_format_keeps_existing_filesystem() {
        let os = MockOsDriver::new();
        os.format("/dev/xvdf", "ext4", false).await.unwrap();
        os.format("/dev/xvdf", "xfs", false).await.unwrap();
        assert_eq!(os.filesystem("/dev/xvdf").as_deref(), Some("ext4"));

        os.format("/dev/xvdf", "xfs", true).await.unwrap();
        assert_eq!(os.filesystem("/dev/xvdf").as_deref(), Some("xfs"));
    }

    #[tokio::test]
    async fn test_volume_converges_after_polls() {
        let backend = MockBackend::new(MockSettings {
            converge_after_polls: 2,
            ..Default::default()
        });

        let volume = backend.create_volume(&VolumeSpec::default()).await.unwrap();
        assert_eq!(volume.status, status::VOLUME_CREATING);
        assert_eq!(volume.size_gb, DEFAULT_VOLUME_SIZE_GB);

        let filter = VolumeFilter::by_id(&volume.volume_id);
        assert_eq!(backend.describe_volumes(&filter).await.unwrap()[0].status, status::VOLUME_CREATING);
        assert_eq!(backend.describe_volumes(&filter).await.unwrap()[0].status, status::VOLUME_AVAILABLE);
    }

    #[tokio::test]
    async fn test_volume_from_snapshot_takes_its_size() {
        let backend = MockBackend::new(MockSettings::default());
        let source = backend
            .create_volume(&VolumeSpec {
                size_gb: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();
        let snapshot = backend.create_snapshot(&source.volume_id, "").await.unwrap();

        let volume = backend
            .create_volume(&VolumeSpec {
                snapshot_id: Some(snapshot.snapshot_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(volume.size_gb, 100);
    }

    #[tokio::test]
    async fn test_attached_volume_cannot_be_deleted() {
        let backend = MockBackend::new(MockSettings::default());
        let volume = backend.create_volume(&VolumeSpec::default()).await.unwrap();
        backend
            .attach_volume(&volume.volume_id, "i-mock", "/dev/xvdf")
            .await
            .unwrap();

        let devices = backend.block_devices("i-mock").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_name, "/dev/xvdf");

        assert!(backend.delete_volume(&volume.volume_id).await.is_err());
    }

    #[tokio::test]
    async fn test_regions_share_world_but_not_entities() {
        let backend = MockBackend::new(MockSettings::default());
        let other = backend.for_region("mock-region-2").await.unwrap();

        backend.create_volume(&VolumeSpec::default()).await.unwrap();

        assert!(other
            .describe_volumes(&VolumeFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(other.region(), "mock-region-2");
        assert!(backend.calls() >= 3);
    }

    #[tokio::test]
    async fn test_settings_from_blob() {
        let ctx = InitContext::with_config(serde_json::json!({
            "instanceId": "i-alpha",
            "convergeAfterPolls": 3
        }));
        let settings: MockSettings = ctx.settings().unwrap();

        assert_eq!(settings.instance_id, "i-alpha");
        assert_eq!(settings.converge_after_polls, 3);
        assert_eq!(settings.region, "mock-region-1");
    }
}

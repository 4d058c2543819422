//! Storage Backend Port
//!
//! The thin, provider-specific surface a cloud or array SDK exposes. A
//! backend issues single requests and reports raw state; waiting, device
//! allocation and multi-step flows live in [`LifecycleDriver`].
//!
//! [`LifecycleDriver`]: crate::lifecycle::LifecycleDriver

use crate::domain::types::{BlockDevice, Instance, Snapshot, Volume, VolumeAttachment};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Filter for volume lookups; empty matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    pub volume_id: Option<String>,
    pub name: Option<String>,
}

impl VolumeFilter {
    pub fn by_id(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: Some(volume_id.into()),
            ..Default::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, volume: &Volume) -> bool {
        self.volume_id.as_deref().map_or(true, |id| volume.volume_id == id)
            && self.name.as_deref().map_or(true, |name| volume.name == name)
    }
}

/// Filter for snapshot lookups; empty matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub volume_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub name: Option<String>,
}

impl SnapshotFilter {
    pub fn by_id(snapshot_id: impl Into<String>) -> Self {
        Self {
            snapshot_id: Some(snapshot_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.volume_id
            .as_deref()
            .map_or(true, |id| snapshot.volume_id == id)
            && self
                .snapshot_id
                .as_deref()
                .map_or(true, |id| snapshot.snapshot_id == id)
            && self.name.as_deref().map_or(true, |name| snapshot.name == name)
    }
}

/// Parameters of a single create-volume request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Size in GB; `None` takes the snapshot's size or the backend default
    pub size_gb: Option<u64>,
    /// Availability zone; `None` uses the backend's own zone
    pub availability_zone: Option<String>,
    pub volume_type: Option<String>,
    pub iops: Option<u64>,
    pub snapshot_id: Option<String>,
}

/// Provider SDK surface
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Provider name reported in block devices and errors
    fn name(&self) -> &str;

    /// Region this client talks to
    fn region(&self) -> &str;

    /// Verify credentials and reachability
    async fn connect(&self) -> Result<()>;

    /// The instance this process runs on
    async fn instance(&self) -> Result<Instance>;

    /// Block devices the backend believes are attached to an instance
    async fn block_devices(&self, instance_id: &str) -> Result<Vec<BlockDevice>>;

    async fn describe_volumes(&self, filter: &VolumeFilter) -> Result<Vec<Volume>>;

    async fn describe_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>>;

    /// Submit a volume creation; the returned volume may still be creating
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume>;

    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Submit a snapshot; the returned snapshot may still be pending
    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<Snapshot>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Submit an attachment at `device`
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment>;

    /// Submit a detachment, from every instance when `instance_id` is `None`
    async fn detach_volume(&self, volume_id: &str, instance_id: Option<&str>, force: bool)
        -> Result<()>;

    /// Copy a snapshot from `source_region` into this client's region
    async fn copy_snapshot(
        &self,
        source_region: &str,
        snapshot_id: &str,
        description: &str,
    ) -> Result<Snapshot>;

    /// Set the display name of a volume or snapshot
    async fn tag(&self, resource_id: &str, name: &str) -> Result<()>;

    /// A separate client bound to `region`
    async fn for_region(&self, region: &str) -> Result<Arc<dyn StorageBackend>>;
}

pub type StorageBackendRef = Arc<dyn StorageBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_filter() {
        let volume = Volume {
            name: "data".into(),
            volume_id: "vol-1".into(),
            ..Default::default()
        };

        assert!(VolumeFilter::default().matches(&volume));
        assert!(VolumeFilter::by_id("vol-1").matches(&volume));
        assert!(VolumeFilter::by_name("data").matches(&volume));
        assert!(!VolumeFilter::by_name("logs").matches(&volume));
    }

    #[test]
    fn test_snapshot_filter() {
        let snapshot = Snapshot {
            name: "nightly".into(),
            volume_id: "vol-1".into(),
            snapshot_id: "snap-1".into(),
            ..Default::default()
        };

        assert!(SnapshotFilter::by_id("snap-1").matches(&snapshot));
        assert!(!SnapshotFilter::by_id("snap-2").matches(&snapshot));

        let filter = SnapshotFilter {
            volume_id: Some("vol-1".into()),
            name: Some("weekly".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&snapshot));
    }
}

//! Domain Ports - Core trait definitions for the orchestrator
//!
//! These traits define the boundaries between the orchestration engine and
//! the concrete drivers. Every driver implements [`Driver`] plus exactly one
//! of [`OsDriver`], [`VolumeDriver`] or [`StorageDriver`].

use crate::domain::types::{
    BlockDevice, CopySnapshotRequest, CreateSnapshotRequest, CreateVolumeRequest, Instance,
    MountInfo, MountOptions, Snapshot, Volume, VolumeAttachment, VolumeMapping, VolumeOpts,
};
use crate::driver::manager::{OsDriverManager, StorageDriverManager};
use crate::error::Result;
use crate::lifecycle::{OpOptions, WaitPolicy};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Driver Category
// =============================================================================

/// The three driver categories the orchestrator aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverCategory {
    Os,
    Volume,
    Storage,
}

impl std::fmt::Display for DriverCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverCategory::Os => write!(f, "OS"),
            DriverCategory::Volume => write!(f, "volume"),
            DriverCategory::Storage => write!(f, "storage"),
        }
    }
}

// =============================================================================
// Init Context
// =============================================================================

/// Everything a driver receives when it is initialized
///
/// Volume drivers are initialized last and see the already-built OS and
/// Storage managers; OS and Storage drivers see `None` for both.
#[derive(Clone, Default)]
pub struct InitContext {
    /// Opaque per-driver configuration blob (`Null` when not configured)
    pub driver_config: serde_json::Value,
    /// Active OS drivers
    pub os: Option<Arc<OsDriverManager>>,
    /// Active storage drivers
    pub storage: Option<Arc<StorageDriverManager>>,
    /// Wait policy for calls made during and after init
    pub wait: WaitPolicy,
}

impl InitContext {
    /// Create a context carrying only a driver configuration blob
    pub fn with_config(driver_config: serde_json::Value) -> Self {
        Self {
            driver_config,
            ..Default::default()
        }
    }

    /// Decode the driver configuration blob into typed settings
    pub fn settings<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.driver_config.is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(self.driver_config.clone())?)
    }
}

// =============================================================================
// Driver Port
// =============================================================================

/// Capability root shared by every driver
#[async_trait]
pub trait Driver: Send + Sync {
    /// Get driver name
    fn name(&self) -> &str;

    /// Initialize the driver. Constructors are side-effect free; this is the
    /// first point at which a driver may contact its backend.
    async fn init(&mut self, ctx: &InitContext) -> Result<()>;
}

// =============================================================================
// OS Driver Port
// =============================================================================

/// Port for OS-level mount and format operations
#[async_trait]
pub trait OsDriver: Driver {
    /// List mounts, optionally filtered by device and/or mount point
    async fn get_mounts(
        &self,
        device: Option<&str>,
        mount_point: Option<&str>,
    ) -> Result<Vec<MountInfo>>;

    /// Check whether a path is mounted
    async fn mounted(&self, mount_point: &str) -> Result<bool>;

    /// Unmount a path
    async fn unmount(&self, mount_point: &str) -> Result<()>;

    /// Mount a device at a target path
    async fn mount(
        &self,
        device: &str,
        target: &str,
        options: Option<&str>,
        label: Option<&str>,
    ) -> Result<()>;

    /// Format a device if it is blank or `overwrite` is set
    async fn format(&self, device: &str, fs_type: &str, overwrite: bool) -> Result<()>;
}

// =============================================================================
// Volume Driver Port
// =============================================================================

/// Port for volume-level operations consumed by container volume plugins
#[async_trait]
pub trait VolumeDriver: Driver {
    /// Make a volume available on this host and return its mount point
    async fn mount(
        &self,
        volume_name: Option<&str>,
        volume_id: Option<&str>,
        options: &MountOptions,
    ) -> Result<String>;

    /// Unmount a volume and release it from this host
    async fn unmount(&self, volume_name: Option<&str>, volume_id: Option<&str>) -> Result<()>;

    /// Get the mount point of a volume, `None` if not mounted here
    async fn path(
        &self,
        volume_name: Option<&str>,
        volume_id: Option<&str>,
    ) -> Result<Option<String>>;

    /// Get one volume by name with its local mount point
    async fn get(&self, volume_name: &str) -> Result<VolumeMapping>;

    /// List every volume with its local mount point
    async fn list(&self) -> Result<Vec<VolumeMapping>>;

    /// Create a volume
    async fn create(&self, volume_name: &str, opts: &VolumeOpts) -> Result<()>;

    /// Remove a volume
    async fn remove(&self, volume_name: &str) -> Result<()>;

    /// Attach a volume to an instance, returning the device name
    async fn attach(&self, volume_name: &str, instance_id: &str, force: bool) -> Result<String>;

    /// Detach a volume from an instance
    async fn detach(&self, volume_name: &str, instance_id: &str, force: bool) -> Result<()>;

    /// Identifier correlating the volume with a local device on the instance
    async fn network_name(&self, volume_name: &str, instance_id: &str) -> Result<String>;
}

// =============================================================================
// Storage Driver Port
// =============================================================================

/// Port for storage backend introspection and management
///
/// The mutating calls taking [`OpOptions`] follow the sync/async operation
/// lifecycle: with `run_async` unset they return only once the backend
/// reports the entity ready.
#[async_trait]
pub trait StorageDriver: Driver {
    /// List block devices attached to the local instance
    async fn get_volume_mapping(&self) -> Result<Vec<BlockDevice>>;

    /// Get the local instance
    async fn get_instance(&self) -> Result<Instance>;

    /// Get volumes by ID or name (both `None` lists all)
    async fn get_volume(
        &self,
        volume_id: Option<&str>,
        volume_name: Option<&str>,
    ) -> Result<Vec<Volume>>;

    /// Get attachments of a volume, optionally only to one instance
    async fn get_volume_attach(
        &self,
        volume_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<VolumeAttachment>>;

    /// Take a snapshot of a volume
    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
        opts: &OpOptions,
    ) -> Result<Vec<Snapshot>>;

    /// Get snapshots by volume ID, snapshot ID or snapshot name
    async fn get_snapshot(
        &self,
        volume_id: Option<&str>,
        snapshot_id: Option<&str>,
        snapshot_name: Option<&str>,
    ) -> Result<Vec<Snapshot>>;

    /// Remove a snapshot
    async fn remove_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Create a volume, optionally from a snapshot or by cloning a volume
    async fn create_volume(&self, request: &CreateVolumeRequest, opts: &OpOptions)
        -> Result<Volume>;

    /// Remove a volume
    async fn remove_volume(&self, volume_id: &str) -> Result<()>;

    /// Get the next free local device path
    async fn get_device_next_available(&self) -> Result<String>;

    /// Attach a volume to an instance
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        opts: &OpOptions,
    ) -> Result<Vec<VolumeAttachment>>;

    /// Detach a volume
    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: Option<&str>,
        opts: &OpOptions,
    ) -> Result<()>;

    /// Copy a snapshot into another region
    async fn copy_snapshot(&self, request: &CopySnapshotRequest, opts: &OpOptions)
        -> Result<Snapshot>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type OsDriverRef = Arc<dyn OsDriver>;
pub type VolumeDriverRef = Arc<dyn VolumeDriver>;
pub type StorageDriverRef = Arc<dyn StorageDriver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Settings {
        #[serde(default)]
        region: String,
        #[serde(default)]
        retries: u32,
    }

    #[test]
    fn test_category_display() {
        assert_eq!(format!("{}", DriverCategory::Os), "OS");
        assert_eq!(format!("{}", DriverCategory::Volume), "volume");
        assert_eq!(format!("{}", DriverCategory::Storage), "storage");
    }

    #[test]
    fn test_settings_default_when_unconfigured() {
        let ctx = InitContext::default();
        let settings: Settings = ctx.settings().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_decoded_from_blob() {
        let ctx = InitContext::with_config(serde_json::json!({
            "region": "us-west-2",
            "retries": 3
        }));
        let settings: Settings = ctx.settings().unwrap();
        assert_eq!(settings.region, "us-west-2");
        assert_eq!(settings.retries, 3);
    }
}

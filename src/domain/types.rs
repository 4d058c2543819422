//! Domain Types - Value entities returned by drivers
//!
//! Every value here is a plain record returned fresh on each call; the caller
//! owns it outright once returned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Status Values
// =============================================================================

/// Backend status strings the operation lifecycle waits for
pub mod status {
    /// Volume is created and detached
    pub const VOLUME_AVAILABLE: &str = "available";
    /// Volume is created and attached somewhere
    pub const VOLUME_IN_USE: &str = "in-use";
    /// Attachment has completed
    pub const ATTACHED: &str = "attached";
    /// Attachment is in progress
    pub const ATTACHING: &str = "attaching";
    /// Snapshot data is fully written
    pub const SNAPSHOT_COMPLETED: &str = "completed";
    /// Snapshot is still being taken
    pub const SNAPSHOT_PENDING: &str = "pending";
    /// Snapshot failed on the backend
    pub const SNAPSHOT_ERROR: &str = "error";
    /// Volume is still being created
    pub const VOLUME_CREATING: &str = "creating";
}

// =============================================================================
// Storage Entities
// =============================================================================

/// A block device attached to an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    /// Name of the provider that owns the device
    pub provider_name: String,
    /// Instance the device is connected to
    pub instance_id: String,
    /// Volume backing the device
    pub volume_id: String,
    /// Device path (e.g. /dev/xvdf)
    pub device_name: String,
    /// Region the device originates from
    pub region: String,
    /// Device status
    pub status: String,
    /// Network on which the device resides
    pub network_name: String,
}

/// A compute instance as seen by a storage backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub provider_name: String,
    pub instance_id: String,
    pub region: String,
    pub name: String,
}

/// A storage-layer snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub name: String,
    pub volume_id: String,
    pub snapshot_id: String,
    /// Size of the source volume in GB
    pub volume_size_gb: u64,
    /// When the snapshot request was submitted
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub description: String,
    pub status: String,
}

/// A storage volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub volume_id: String,
    pub availability_zone: String,
    pub status: String,
    pub volume_type: String,
    pub iops: u64,
    pub size_gb: u64,
    pub network_name: String,
    pub attachments: Vec<VolumeAttachment>,
}

/// An attachment of a volume to an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub instance_id: String,
    pub device_name: String,
    pub status: String,
}

/// A mounted filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
}

/// Options for mounting a volume through a volume driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountOptions {
    /// Format even if a filesystem is already present
    pub overwrite_fs: bool,
    /// Filesystem to create when the device is blank
    pub new_fs_type: Option<String>,
    /// Take the volume over from another instance if needed
    pub preempt: bool,
}

/// Free-form options passed to `VolumeDriver::create`
pub type VolumeOpts = BTreeMap<String, String>;

/// A volume as seen by a volume plugin: its name and where it is mounted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMapping {
    pub name: String,
    /// Mount point on this host, `None` when not mounted here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
}

// =============================================================================
// Requests
// =============================================================================

/// Parameters for creating a volume
///
/// `volume_id` clones an existing volume through an intermediate snapshot;
/// `snapshot_id` creates the volume from an existing snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: Option<String>,
    pub volume_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub volume_type: Option<String>,
    pub iops: Option<u64>,
    pub size_gb: Option<u64>,
    pub availability_zone: Option<String>,
}

impl CreateVolumeRequest {
    /// Request a new, empty volume
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Parameters for taking a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotRequest {
    pub name: Option<String>,
    pub volume_id: String,
    pub description: Option<String>,
}

/// Parameters for copying a snapshot to another region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySnapshotRequest {
    pub volume_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub snapshot_name: Option<String>,
    pub destination_name: Option<String>,
    pub destination_region: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_serializes_camel_case() {
        let volume = Volume {
            name: "data".into(),
            volume_id: "vol-1".into(),
            size_gb: 16,
            ..Default::default()
        };

        let json = serde_json::to_value(&volume).unwrap();
        assert_eq!(json["volumeId"], "vol-1");
        assert_eq!(json["sizeGb"], 16);
    }

    #[test]
    fn test_create_volume_request_named() {
        let request = CreateVolumeRequest::named("data");
        assert_eq!(request.name.as_deref(), Some("data"));
        assert!(request.volume_id.is_none());
        assert!(request.snapshot_id.is_none());
    }
}

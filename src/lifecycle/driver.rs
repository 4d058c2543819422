//! Lifecycle Driver
//!
//! A [`StorageDriver`] built on any [`StorageBackend`]. It owns the parts
//! every backend shares: waiting for entities to converge, device
//! allocation for attachments, clone-through-snapshot and cross-region copy.

use crate::domain::ports::{Driver, InitContext, StorageDriver};
use crate::domain::types::{
    status, BlockDevice, CopySnapshotRequest, CreateSnapshotRequest, CreateVolumeRequest,
    Instance, Snapshot, Volume, VolumeAttachment,
};
use crate::error::{Error, Result};
use crate::hardware::allocation::{next_available_device, PartitionSource, ProcPartitions};
use crate::lifecycle::backend::{
    SnapshotFilter, StorageBackend, StorageBackendRef, VolumeFilter, VolumeSpec,
};
use crate::lifecycle::wait::{poll_until, OpOptions, WaitPolicy};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds the backend client from the driver's init context
pub type BackendFactory = Arc<dyn Fn(&InitContext) -> Result<StorageBackendRef> + Send + Sync>;

/// Settings every lifecycle driver reads from its configuration blob
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LocalSettings {
    /// Partition table to read local devices from, e.g. `/proc/partitions`
    partitions_file: Option<PathBuf>,
}

/// Storage driver implementing the sync/async operation lifecycle
pub struct LifecycleDriver {
    name: String,
    device_prefix: String,
    partitions: Arc<dyn PartitionSource>,
    factory: Option<BackendFactory>,
    backend: Option<StorageBackendRef>,
}

impl LifecycleDriver {
    /// Driver whose backend is created by `factory` at init
    pub fn new(
        name: impl Into<String>,
        device_prefix: impl Into<String>,
        partitions: Arc<dyn PartitionSource>,
        factory: BackendFactory,
    ) -> Self {
        Self {
            name: name.into(),
            device_prefix: device_prefix.into(),
            partitions,
            factory: Some(factory),
            backend: None,
        }
    }

    /// Driver bound to an existing backend client
    pub fn with_backend(
        name: impl Into<String>,
        device_prefix: impl Into<String>,
        partitions: Arc<dyn PartitionSource>,
        backend: StorageBackendRef,
    ) -> Self {
        Self {
            name: name.into(),
            device_prefix: device_prefix.into(),
            partitions,
            factory: None,
            backend: Some(backend),
        }
    }

    pub fn device_prefix(&self) -> &str {
        &self.device_prefix
    }

    fn backend(&self) -> Result<&dyn StorageBackend> {
        self.backend
            .as_deref()
            .ok_or_else(|| Error::DriverNotInitialized {
                driver: self.name.clone(),
            })
    }

    /// Take the clone source snapshot and wait for it
    async fn clone_source_snapshot(&self, volume_id: &str, wait: &WaitPolicy) -> Result<String> {
        let request = CreateSnapshotRequest {
            name: Some(format!("temp-{}", volume_id)),
            volume_id: volume_id.to_string(),
            description: Some("created for create_volume".into()),
        };
        let snapshots = self
            .create_snapshot(&request, &OpOptions::new(false, wait.clone()))
            .await?;

        snapshots
            .into_iter()
            .next()
            .map(|s| s.snapshot_id)
            .ok_or(Error::NoSnapshotsReturned)
    }
}

// =============================================================================
// Waits
// =============================================================================

async fn single_volume(backend: &dyn StorageBackend, volume_id: &str) -> Result<Volume> {
    backend
        .describe_volumes(&VolumeFilter::by_id(volume_id))
        .await?
        .into_iter()
        .next()
        .ok_or(Error::NoVolumesReturned)
}

async fn single_snapshot(backend: &dyn StorageBackend, snapshot_id: &str) -> Result<Snapshot> {
    backend
        .describe_snapshots(&SnapshotFilter::by_id(snapshot_id))
        .await?
        .into_iter()
        .next()
        .ok_or(Error::NoSnapshotsReturned)
}

/// Attachments of a volume; empty when `instance_id` is given and the
/// volume is not attached to it
async fn volume_attachments(
    backend: &dyn StorageBackend,
    volume_id: &str,
    instance_id: Option<&str>,
) -> Result<Vec<VolumeAttachment>> {
    if volume_id.is_empty() {
        return Err(Error::MissingVolumeId);
    }

    let volume = single_volume(backend, volume_id).await?;
    match instance_id {
        Some(instance_id)
            if !volume
                .attachments
                .iter()
                .any(|a| a.instance_id == instance_id) =>
        {
            Ok(Vec::new())
        }
        _ => Ok(volume.attachments),
    }
}

async fn wait_snapshot_complete(
    backend: &dyn StorageBackend,
    snapshot_id: &str,
    wait: &WaitPolicy,
) -> Result<()> {
    poll_until(wait, "snapshot", snapshot_id, move || async move {
        let snapshot = single_snapshot(backend, snapshot_id).await?;
        match snapshot.status.as_str() {
            status::SNAPSHOT_COMPLETED => Ok(true),
            status::SNAPSHOT_ERROR => Err(Error::backend(
                backend.name(),
                "snapshot",
                format!("snapshot {} entered error state", snapshot_id),
            )),
            _ => Ok(false),
        }
    })
    .await
}

async fn wait_volume_available(
    backend: &dyn StorageBackend,
    volume_id: &str,
    wait: &WaitPolicy,
) -> Result<()> {
    poll_until(wait, "create_volume", volume_id, move || async move {
        let volume = single_volume(backend, volume_id).await?;
        Ok(matches!(
            volume.status.as_str(),
            status::VOLUME_AVAILABLE | status::VOLUME_IN_USE
        ))
    })
    .await
}

async fn wait_volume_attach(
    backend: &dyn StorageBackend,
    volume_id: &str,
    instance_id: &str,
    wait: &WaitPolicy,
) -> Result<()> {
    poll_until(wait, "attach_volume", volume_id, move || async move {
        let attachments = volume_attachments(backend, volume_id, Some(instance_id)).await?;
        Ok(attachments
            .iter()
            .any(|a| a.instance_id == instance_id && a.status == status::ATTACHED))
    })
    .await
}

async fn wait_volume_detach(
    backend: &dyn StorageBackend,
    volume_id: &str,
    wait: &WaitPolicy,
) -> Result<()> {
    poll_until(wait, "detach_volume", volume_id, move || async move {
        Ok(volume_attachments(backend, volume_id, None).await?.is_empty())
    })
    .await
}

// =============================================================================
// Driver
// =============================================================================

#[async_trait]
impl Driver for LifecycleDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, ctx: &InitContext) -> Result<()> {
        let local: LocalSettings = ctx.settings()?;
        if let Some(path) = local.partitions_file {
            debug!(driver = %self.name, path = %path.display(), "reading local partitions from file");
            self.partitions = Arc::new(ProcPartitions::at(path));
        }

        let backend = match &self.factory {
            Some(factory) => factory(ctx)?,
            None => self
                .backend
                .clone()
                .ok_or_else(|| Error::DriverNotInitialized {
                    driver: self.name.clone(),
                })?,
        };

        backend
            .connect()
            .await
            .map_err(|e| Error::DriverInitFailed {
                driver: self.name.clone(),
                reason: e.to_string(),
            })?;

        info!(
            driver = %self.name,
            backend = backend.name(),
            region = backend.region(),
            "storage driver initialized"
        );
        self.backend = Some(backend);
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for LifecycleDriver {
    async fn get_volume_mapping(&self) -> Result<Vec<BlockDevice>> {
        let backend = self.backend()?;
        let instance = backend.instance().await?;
        backend.block_devices(&instance.instance_id).await
    }

    async fn get_instance(&self) -> Result<Instance> {
        self.backend()?.instance().await
    }

    async fn get_volume(
        &self,
        volume_id: Option<&str>,
        volume_name: Option<&str>,
    ) -> Result<Vec<Volume>> {
        let filter = VolumeFilter {
            volume_id: volume_id.map(str::to_string),
            name: volume_name.map(str::to_string),
        };
        self.backend()?.describe_volumes(&filter).await
    }

    async fn get_volume_attach(
        &self,
        volume_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<VolumeAttachment>> {
        volume_attachments(self.backend()?, volume_id, instance_id).await
    }

    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
        opts: &OpOptions,
    ) -> Result<Vec<Snapshot>> {
        if request.volume_id.is_empty() {
            return Err(Error::MissingVolumeId);
        }
        let backend = self.backend()?;

        let snapshot = backend
            .create_snapshot(
                &request.volume_id,
                request.description.as_deref().unwrap_or_default(),
            )
            .await?;

        if let Some(name) = request.name.as_deref().filter(|n| !n.is_empty()) {
            backend.tag(&snapshot.snapshot_id, name).await?;
        }

        if !opts.run_async {
            info!(
                driver = %self.name,
                snapshot_id = %snapshot.snapshot_id,
                "waiting for snapshot to complete"
            );
            wait_snapshot_complete(backend, &snapshot.snapshot_id, &opts.wait).await?;
        }

        let snapshots = self
            .get_snapshot(None, Some(&snapshot.snapshot_id), None)
            .await?;
        debug!(driver = %self.name, snapshot_id = %snapshot.snapshot_id, "created snapshot");
        Ok(snapshots)
    }

    async fn get_snapshot(
        &self,
        volume_id: Option<&str>,
        snapshot_id: Option<&str>,
        snapshot_name: Option<&str>,
    ) -> Result<Vec<Snapshot>> {
        let filter = SnapshotFilter {
            volume_id: volume_id.map(str::to_string),
            snapshot_id: snapshot_id.map(str::to_string),
            name: snapshot_name.map(str::to_string),
        };
        self.backend()?.describe_snapshots(&filter).await
    }

    async fn remove_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.backend()?.delete_snapshot(snapshot_id).await
    }

    async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
        opts: &OpOptions,
    ) -> Result<Volume> {
        let clone_source = request.volume_id.as_deref().filter(|id| !id.is_empty());
        if clone_source.is_some() && opts.run_async {
            return Err(Error::AsyncPreconditionViolation(
                "cannot create a volume from another volume asynchronously".into(),
            ));
        }

        let backend = self.backend()?;
        let name = request.name.as_deref().filter(|n| !n.is_empty());

        if let Some(name) = name {
            if !backend
                .describe_volumes(&VolumeFilter::by_name(name))
                .await?
                .is_empty()
            {
                return Err(Error::VolumeExists {
                    name: name.to_string(),
                });
            }
        }

        let snapshot_id = match clone_source {
            Some(source) => Some(self.clone_source_snapshot(source, &opts.wait).await?),
            None => request.snapshot_id.clone(),
        };

        let spec = VolumeSpec {
            size_gb: request.size_gb,
            availability_zone: request.availability_zone.clone(),
            volume_type: request.volume_type.clone(),
            iops: request.iops.filter(|iops| *iops > 0),
            snapshot_id: snapshot_id.clone(),
        };
        let temp_snapshot = clone_source.and(snapshot_id.as_deref());

        let created = async {
            let created = backend.create_volume(&spec).await?;

            if let Some(name) = name {
                backend.tag(&created.volume_id, name).await?;
            }

            if !opts.run_async {
                info!(
                    driver = %self.name,
                    volume_id = %created.volume_id,
                    "waiting for volume creation to complete"
                );
                wait_volume_available(backend, &created.volume_id, &opts.wait).await?;
            }
            Ok::<_, Error>(created)
        }
        .await;

        let created = match created {
            Ok(created) => created,
            Err(e) => {
                if let Some(temp) = temp_snapshot {
                    if let Err(cleanup) = backend.delete_snapshot(temp).await {
                        warn!(
                            driver = %self.name,
                            snapshot_id = %temp,
                            error = %cleanup,
                            "failed to remove clone snapshot"
                        );
                    }
                }
                return Err(e);
            }
        };

        if let Some(temp) = temp_snapshot {
            backend.delete_snapshot(temp).await?;
        }

        single_volume(backend, &created.volume_id).await
    }

    async fn remove_volume(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::MissingVolumeId);
        }
        self.backend()?.delete_volume(volume_id).await
    }

    async fn get_device_next_available(&self) -> Result<String> {
        let mapped = self.get_volume_mapping().await?;
        let local = self.partitions.partitions()?;
        next_available_device(&self.device_prefix, &mapped, &local)
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        opts: &OpOptions,
    ) -> Result<Vec<VolumeAttachment>> {
        if volume_id.is_empty() {
            return Err(Error::MissingVolumeId);
        }
        let backend = self.backend()?;

        let device = self.get_device_next_available().await?;
        let instance_id = if instance_id.is_empty() {
            backend.instance().await?.instance_id
        } else {
            instance_id.to_string()
        };

        backend
            .attach_volume(volume_id, &instance_id, &device)
            .await?;

        if !opts.run_async {
            info!(
                driver = %self.name,
                volume_id,
                instance_id = %instance_id,
                device = %device,
                "waiting for volume attachment to complete"
            );
            wait_volume_attach(backend, volume_id, &instance_id, &opts.wait).await?;
        }

        volume_attachments(backend, volume_id, Some(&instance_id)).await
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: Option<&str>,
        opts: &OpOptions,
    ) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::MissingVolumeId);
        }
        let backend = self.backend()?;

        let volume = single_volume(backend, volume_id).await?;
        if volume.status == status::VOLUME_AVAILABLE && volume.attachments.is_empty() {
            debug!(driver = %self.name, volume_id, "volume already detached");
            return Ok(());
        }

        backend.detach_volume(volume_id, instance_id, false).await?;

        if !opts.run_async {
            info!(driver = %self.name, volume_id, "waiting for volume detachment to complete");
            wait_volume_detach(backend, volume_id, &opts.wait).await?;
        }

        info!(driver = %self.name, volume_id, "detached volume");
        Ok(())
    }

    async fn copy_snapshot(
        &self,
        request: &CopySnapshotRequest,
        opts: &OpOptions,
    ) -> Result<Snapshot> {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
        let volume_id = non_empty(&request.volume_id);
        let snapshot_id = non_empty(&request.snapshot_id);
        let snapshot_name = non_empty(&request.snapshot_name);

        if volume_id.is_none() && snapshot_id.is_none() && snapshot_name.is_none() {
            return Err(Error::MissingSnapshotSelector);
        }

        let backend = self.backend()?;
        let source_region = backend.region().to_string();
        let destination_region = if request.destination_region.is_empty() {
            source_region.clone()
        } else {
            request.destination_region.clone()
        };

        let mut sources = backend
            .describe_snapshots(&SnapshotFilter {
                volume_id,
                snapshot_id,
                name: snapshot_name,
            })
            .await?;
        let source = match sources.len() {
            0 => return Err(Error::NoSnapshotsReturned),
            1 => sources.remove(0),
            count => return Err(Error::MultipleSnapshotsReturned { count }),
        };

        let destination = backend.for_region(&destination_region).await?;
        let description = format!("[Copied {} from {}]", source.snapshot_id, source_region);
        let copied = destination
            .copy_snapshot(&source_region, &source.snapshot_id, &description)
            .await?;

        if let Some(name) = request.destination_name.as_deref().filter(|n| !n.is_empty()) {
            destination.tag(&copied.snapshot_id, name).await?;
        }

        if !opts.run_async {
            info!(
                driver = %self.name,
                snapshot_id = %copied.snapshot_id,
                region = %destination_region,
                "waiting for snapshot copy to complete"
            );
            wait_snapshot_complete(destination.as_ref(), &copied.snapshot_id, &opts.wait).await?;
        }

        single_snapshot(destination.as_ref(), &copied.snapshot_id).await
    }
}

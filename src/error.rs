//! Error types for the Volume Orchestrator
//!
//! Provides structured error types for all orchestrator components including
//! driver construction, the category managers, the operation lifecycle,
//! device allocation, and the module supervisor.

use crate::domain::ports::DriverCategory;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Driver Errors
    // =========================================================================
    #[error("Unknown driver: {name}")]
    UnknownDriver { name: String },

    #[error("Driver {name} is registered as a {registered} driver, not a {requested} driver")]
    DriverCategoryMismatch {
        name: String,
        registered: DriverCategory,
        requested: DriverCategory,
    },

    #[error("Driver initialization failed: {driver} - {reason}")]
    DriverInitFailed { driver: String, reason: String },

    #[error("Driver not initialized: {driver}")]
    DriverNotInitialized { driver: String },

    #[error("no {category} drivers initialized")]
    NotDetected { category: DriverCategory },

    #[error("Driver block device discovery failed: {driver} - {reason}")]
    BlockDeviceDiscovery { driver: String, reason: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Missing volume ID")]
    MissingVolumeId,

    #[error("Missing volume ID, snapshot ID, or snapshot name")]
    MissingSnapshotSelector,

    #[error("Missing volume name or ID")]
    MissingVolumeSelector,

    #[error("No instances returned")]
    NoInstances,

    #[error("Too many instances returned ({count}), limit the storage drivers")]
    MultipleInstances { count: usize },

    #[error("No volumes returned")]
    NoVolumesReturned,

    #[error("Multiple volumes returned ({count})")]
    MultipleVolumesReturned { count: usize },

    #[error("No snapshots returned")]
    NoSnapshotsReturned,

    #[error("Multiple snapshots returned ({count})")]
    MultipleSnapshotsReturned { count: usize },

    #[error("Volume name already exists: {name}")]
    VolumeExists { name: String },

    #[error("Volume did not attach: {volume_id}")]
    VolumeNotAttached { volume_id: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("No available device with prefix {prefix}")]
    DeviceAllocationExhausted { prefix: String },

    #[error("Async precondition violated: {0}")]
    AsyncPreconditionViolation(String),

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Timed out after {waited:?} waiting for {operation} on {resource}")]
    WaitTimeout {
        operation: String,
        resource: String,
        waited: Duration,
    },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    // =========================================================================
    // Module Errors
    // =========================================================================
    #[error("Unknown module type id {type_id}")]
    ModuleUnknownType { type_id: u32 },

    #[error("Unknown module type {name}")]
    ModuleUnknownTypeName { name: String },

    #[error("Unknown module instance id {instance_id}")]
    ModuleUnknownInstance { instance_id: u32 },

    #[error("Error initializing module type {type_id}, {name} at {address}: {reason}")]
    ModuleInitFailed {
        type_id: u32,
        name: String,
        address: String,
        reason: String,
    },

    #[error("Error starting module type {type_id}, {instance_id}-{name} at {address}: {reason}")]
    ModuleStartFailed {
        type_id: u32,
        instance_id: u32,
        name: String,
        address: String,
        reason: String,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a backend failure for `operation` on `backend`
    pub fn backend(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Error::BackendOperationFailed {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendOperationFailed { .. }
                | Error::WaitTimeout { .. }
                | Error::BlockDeviceDiscovery { .. }
                | Error::Io(_)
        )
    }

    /// Check if retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Configuration(_)
                | Error::UnknownDriver { .. }
                | Error::DriverCategoryMismatch { .. }
                | Error::AsyncPreconditionViolation(_)
                | Error::MissingVolumeId
                | Error::MissingSnapshotSelector
                | Error::MissingVolumeSelector
                | Error::VolumeExists { .. }
                | Error::InvalidAddress(_)
                | Error::ModuleUnknownType { .. }
                | Error::ModuleUnknownTypeName { .. }
                | Error::ModuleUnknownInstance { .. }
                | Error::JsonParse(_)
                | Error::YamlParse(_)
        )
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;

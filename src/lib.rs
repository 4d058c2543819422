//! Volume Orchestrator - Driver Aggregation Engine
//!
//! Aggregates pluggable OS, volume and storage drivers behind one unified
//! interface per category, and supervises the network-facing modules that
//! expose them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Module Supervisor                              │
//! │        ┌──────────────┐   ┌──────────────┐   ┌──────────────┐           │
//! │        │ admin (HTTP) │   │   module …   │   │   module …   │           │
//! │        └──────┬───────┘   └──────┬───────┘   └──────┬───────┘           │
//! ├───────────────┴──────────────────┴──────────────────┴───────────────────┤
//! │                            Orchestrator                                 │
//! │   ┌────────────────┐   ┌──────────────────┐   ┌──────────────────┐      │
//! │   │  OS manager    │◄──│  Volume manager  │──►│ Storage manager  │      │
//! │   └───────┬────────┘   └────────┬─────────┘   └────────┬─────────┘      │
//! ├───────────┴─────────────────────┴──────────────────────┴────────────────┤
//! │                         Driver Registry                                 │
//! │     mock-os (OS)      docker (volume)      mock / … (storage)           │
//! │                                              │                          │
//! │                             Lifecycle driver + StorageBackend           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: YAML configuration
//! - [`controlplane`]: the orchestrator
//! - [`domain`]: driver ports and value entities
//! - [`driver`]: constructor registry and category managers
//! - [`drivers`]: built-in drivers
//! - [`lifecycle`]: sync/async operation contract for storage backends
//! - [`hardware`]: local block device allocation
//! - [`module`]: module supervisor and the admin module
//! - [`metrics`]: prometheus counters
//! - [`error`]: error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod hardware;
pub mod lifecycle;
pub mod metrics;
pub mod module;

// Re-export commonly used types
pub use config::{
    DriverSelectionConfig, ModuleSpec, OrchestratorConfig, VolumeConfig, WaitConfig,
};

pub use controlplane::{Orchestrator, OrchestratorStatus};

pub use domain::ports::{
    Driver, DriverCategory, InitContext, OsDriver, StorageDriver, VolumeDriver,
};

pub use domain::types::{
    BlockDevice, Instance, MountInfo, MountOptions, Snapshot, Volume, VolumeAttachment,
    VolumeMapping, VolumeOpts,
};

pub use driver::{
    DriverCtor, DriverManager, DriverRegistry, OsDriverManager, StorageDriverManager,
    VolumeDriverManager,
};

pub use error::{Error, Result};

pub use hardware::{next_available_device, PartitionSource, ProcPartitions};

pub use lifecycle::{LifecycleDriver, OpOptions, StorageBackend, WaitPolicy};

pub use metrics::Metrics;

pub use module::{Module, ModuleAddress, ModuleInstance, ModuleSupervisor, ModuleType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

//! Built-in Drivers
//!
//! - `mock-os` (OS): in-memory mount table
//! - `mock` (storage): lifecycle driver over an in-memory backend
//! - `docker` (volume): volume plugin driver over the OS and storage managers

pub mod docker;
pub mod mock;

pub use docker::{DockerSettings, DockerVolumeDriver, DOCKER_NAME};
pub use mock::{mock_storage_driver, storage_driver_named, MockBackend, MockOsDriver, MockSettings};

use crate::driver::registry::{DriverCtor, DriverRegistry};

/// Register every built-in driver
///
/// The OS and storage mocks share the name `mock`; the registry is keyed by
/// name, so they are registered as `mock` (storage) and `mock-os`.
pub fn register_builtin(registry: &DriverRegistry) {
    registry.register("mock-os", DriverCtor::os(|| Box::new(MockOsDriver::named("mock-os"))));
    registry.register(mock::MOCK_NAME, DriverCtor::storage(|| Box::new(mock_storage_driver())));
    registry.register(DOCKER_NAME, DriverCtor::volume(|| Box::new(DockerVolumeDriver::new())));
}

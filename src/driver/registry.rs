//! Driver Registry
//!
//! Name → constructor table. Each constructor is tagged with the category
//! of driver it builds, so the orchestrator never has to probe a driver for
//! its capabilities. Constructors must be side-effect free; backend contact
//! happens in `Driver::init`.

use crate::domain::ports::{Driver, DriverCategory, OsDriver, StorageDriver, VolumeDriver};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub type OsDriverCtor = Arc<dyn Fn() -> Box<dyn OsDriver> + Send + Sync>;
pub type VolumeDriverCtor = Arc<dyn Fn() -> Box<dyn VolumeDriver> + Send + Sync>;
pub type StorageDriverCtor = Arc<dyn Fn() -> Box<dyn StorageDriver> + Send + Sync>;

// =============================================================================
// Constructors
// =============================================================================

/// A category-tagged driver constructor
#[derive(Clone)]
pub enum DriverCtor {
    Os(OsDriverCtor),
    Volume(VolumeDriverCtor),
    Storage(StorageDriverCtor),
}

impl DriverCtor {
    pub fn os<F>(ctor: F) -> Self
    where
        F: Fn() -> Box<dyn OsDriver> + Send + Sync + 'static,
    {
        DriverCtor::Os(Arc::new(ctor))
    }

    pub fn volume<F>(ctor: F) -> Self
    where
        F: Fn() -> Box<dyn VolumeDriver> + Send + Sync + 'static,
    {
        DriverCtor::Volume(Arc::new(ctor))
    }

    pub fn storage<F>(ctor: F) -> Self
    where
        F: Fn() -> Box<dyn StorageDriver> + Send + Sync + 'static,
    {
        DriverCtor::Storage(Arc::new(ctor))
    }

    pub fn category(&self) -> DriverCategory {
        match self {
            DriverCtor::Os(_) => DriverCategory::Os,
            DriverCtor::Volume(_) => DriverCategory::Volume,
            DriverCtor::Storage(_) => DriverCategory::Storage,
        }
    }

    fn construct(&self) -> DriverInstance {
        match self {
            DriverCtor::Os(ctor) => DriverInstance::Os(ctor()),
            DriverCtor::Volume(ctor) => DriverInstance::Volume(ctor()),
            DriverCtor::Storage(ctor) => DriverInstance::Storage(ctor()),
        }
    }
}

impl std::fmt::Debug for DriverCtor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DriverCtor({})", self.category())
    }
}

/// A freshly constructed, not yet initialised driver
pub enum DriverInstance {
    Os(Box<dyn OsDriver>),
    Volume(Box<dyn VolumeDriver>),
    Storage(Box<dyn StorageDriver>),
}

impl std::fmt::Debug for DriverInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DriverInstance({})", self.category())
    }
}

impl DriverInstance {
    pub fn category(&self) -> DriverCategory {
        match self {
            DriverInstance::Os(_) => DriverCategory::Os,
            DriverInstance::Volume(_) => DriverCategory::Volume,
            DriverInstance::Storage(_) => DriverCategory::Storage,
        }
    }

    /// Name reported by the driver itself
    pub fn name(&self) -> &str {
        match self {
            DriverInstance::Os(d) => d.name(),
            DriverInstance::Volume(d) => d.name(),
            DriverInstance::Storage(d) => d.name(),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Table of every known driver constructor
#[derive(Debug, Default)]
pub struct DriverRegistry {
    ctors: RwLock<BTreeMap<String, DriverCtor>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; a later registration under the same name
    /// replaces the earlier one
    pub fn register(&self, name: impl Into<String>, ctor: DriverCtor) {
        let name = name.into();
        debug!(driver = %name, category = %ctor.category(), "registered driver");
        if let Some(previous) = self.ctors.write().insert(name.clone(), ctor) {
            debug!(driver = %name, category = %previous.category(), "replaced driver registration");
        }
    }

    /// Snapshot of the registered names, taken at call time
    pub fn driver_names(&self) -> impl Iterator<Item = String> {
        self.ctors
            .read()
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Category a name was registered under
    pub fn category_of(&self, name: &str) -> Option<DriverCategory> {
        self.ctors.read().get(name).map(DriverCtor::category)
    }

    pub fn len(&self) -> usize {
        self.ctors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctors.read().is_empty()
    }

    /// Build the driver registered as `name`, checking it belongs to
    /// `requested`
    pub fn construct(&self, name: &str, requested: DriverCategory) -> Result<DriverInstance> {
        // The constructor runs outside the lock
        let ctor = self
            .ctors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDriver {
                name: name.to_string(),
            })?;

        if ctor.category() != requested {
            return Err(Error::DriverCategoryMismatch {
                name: name.to_string(),
                registered: ctor.category(),
                requested,
            });
        }

        Ok(ctor.construct())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::MockOsDriver;
    use assert_matches::assert_matches;

    fn registry() -> DriverRegistry {
        let registry = DriverRegistry::new();
        registry.register("mock", DriverCtor::os(|| Box::new(MockOsDriver::new())));
        registry
    }

    #[test]
    fn test_construct_registered_driver() {
        let registry = registry();
        let driver = registry.construct("mock", DriverCategory::Os).unwrap();
        assert_eq!(driver.category(), DriverCategory::Os);
        assert_eq!(driver.name(), "mock");
    }

    #[test]
    fn test_construct_unknown_driver() {
        let registry = registry();
        let err = registry.construct("ec2", DriverCategory::Storage).unwrap_err();
        assert_matches!(err, Error::UnknownDriver { ref name } if name == "ec2");
    }

    #[test]
    fn test_construct_wrong_category() {
        let registry = registry();
        let err = registry.construct("mock", DriverCategory::Storage).unwrap_err();
        assert_matches!(
            err,
            Error::DriverCategoryMismatch {
                registered: DriverCategory::Os,
                requested: DriverCategory::Storage,
                ..
            }
        );
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = registry();
        registry.register(
            "mock",
            DriverCtor::storage(|| Box::new(crate::drivers::mock::mock_storage_driver())),
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.category_of("mock"), Some(DriverCategory::Storage));
    }

    #[test]
    fn test_driver_names_is_a_snapshot() {
        let registry = registry();
        let names = registry.driver_names();

        registry.register("other", DriverCtor::os(|| Box::new(MockOsDriver::new())));

        assert_eq!(names.collect::<Vec<_>>(), vec!["mock".to_string()]);
        assert_eq!(registry.driver_names().count(), 2);
    }
}

//! Module Supervisor
//!
//! Tracks module types and the instances created from them, and starts
//! instances under a supervision timeout. A module whose `start` is still
//! running when the timeout elapses is assumed to be a long-running listener
//! and reported as started.

use crate::error::{Error, Result};
use crate::metrics::{outcome, Metrics};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Default supervision timeout for `start`
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Module Port
// =============================================================================

/// A pluggable network-facing adapter
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Address the module serves on
    fn address(&self) -> &str;

    fn description(&self) -> &str;

    /// Start serving. May return once the listener is up or keep running for
    /// the life of the module.
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

pub type ModuleRef = Arc<dyn Module>;

/// What a module constructor receives
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub instance_id: u32,
    pub address: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
}

pub type ModuleInit = Arc<dyn Fn(ModuleContext) -> Result<ModuleRef> + Send + Sync>;

/// An instance created for a type at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDefault {
    pub address: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ModuleDefault {
    pub fn at(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            config: serde_json::Value::Null,
        }
    }
}

// =============================================================================
// Types and Instances
// =============================================================================

/// A registered module type
pub struct ModuleType {
    pub id: u32,
    pub name: String,
    pub ignore_fail_on_init: bool,
    init: ModuleInit,
    pub defaults: Vec<ModuleDefault>,
}

impl ModuleType {
    pub fn info(&self) -> ModuleTypeInfo {
        ModuleTypeInfo {
            id: self.id,
            name: self.name.clone(),
            addresses: self.defaults.iter().map(|d| d.address.clone()).collect(),
        }
    }
}

impl std::fmt::Debug for ModuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ignore_fail_on_init", &self.ignore_fail_on_init)
            .field("defaults", &self.defaults)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTypeInfo {
    pub id: u32,
    pub name: String,
    pub addresses: Vec<String>,
}

/// A module created from a type
pub struct ModuleInstance {
    pub id: u32,
    pub type_id: u32,
    pub type_name: String,
    pub module: ModuleRef,
    pub name: String,
    pub address: String,
    pub description: String,
    started: AtomicBool,
}

impl ModuleInstance {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    fn start_failed(&self, reason: impl Into<String>) -> Error {
        Error::ModuleStartFailed {
            type_id: self.type_id,
            instance_id: self.id,
            name: self.name.clone(),
            address: self.address.clone(),
            reason: reason.into(),
        }
    }

    pub fn info(&self) -> ModuleInstanceInfo {
        ModuleInstanceInfo {
            id: self.id,
            type_id: self.type_id,
            name: self.name.clone(),
            address: self.address.clone(),
            description: self.description.clone(),
            started: self.is_started(),
        }
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("type_id", &self.type_id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("started", &self.is_started())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInstanceInfo {
    pub id: u32,
    pub type_id: u32,
    pub name: String,
    pub address: String,
    pub description: String,
    pub started: bool,
}

// =============================================================================
// Supervisor
// =============================================================================

enum StartOutcome {
    Started,
    Failed(String),
    Panicked(String),
}

/// Progress of one supervised start
const START_PENDING: u8 = 0;
const START_FINISHED: u8 = 1;
const START_TIMED_OUT: u8 = 2;

/// Handle an outcome that arrived after the supervisor stopped waiting
fn late_outcome(instance: &ModuleInstance, outcome: StartOutcome) {
    match outcome {
        StartOutcome::Started => {
            debug!(instance_id = instance.id, "module start returned after timeout");
        }
        StartOutcome::Failed(reason) | StartOutcome::Panicked(reason) => {
            error!(
                instance_id = instance.id,
                name = %instance.name,
                address = %instance.address,
                reason = %reason,
                "module failed after start"
            );
            instance.set_started(false);
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Registry of module types and instances
pub struct ModuleSupervisor {
    types: RwLock<BTreeMap<u32, Arc<ModuleType>>>,
    instances: RwLock<BTreeMap<u32, Arc<ModuleInstance>>>,
    next_type_id: AtomicU32,
    next_instance_id: AtomicU32,
    start_timeout: Duration,
    metrics: Option<Metrics>,
}

impl Default for ModuleSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_START_TIMEOUT)
    }
}

impl ModuleSupervisor {
    pub fn new(start_timeout: Duration) -> Self {
        Self {
            types: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(BTreeMap::new()),
            next_type_id: AtomicU32::new(0),
            next_instance_id: AtomicU32::new(0),
            start_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a module type and return its ID
    pub fn register_module<F>(
        &self,
        name: impl Into<String>,
        ignore_fail_on_init: bool,
        init: F,
        defaults: Vec<ModuleDefault>,
    ) -> u32
    where
        F: Fn(ModuleContext) -> Result<ModuleRef> + Send + Sync + 'static,
    {
        let id = self.next_type_id.fetch_add(1, Ordering::SeqCst) + 1;
        let module_type = ModuleType {
            id,
            name: name.into(),
            ignore_fail_on_init,
            init: Arc::new(init),
            defaults,
        };
        debug!(type_id = id, name = %module_type.name, "registered module type");
        self.types.write().insert(id, Arc::new(module_type));
        id
    }

    pub fn module_types(&self) -> Vec<Arc<ModuleType>> {
        self.types.read().values().cloned().collect()
    }

    pub fn module_instances(&self) -> Vec<Arc<ModuleInstance>> {
        self.instances.read().values().cloned().collect()
    }

    pub fn get_module_instance(&self, instance_id: u32) -> Result<Arc<ModuleInstance>> {
        self.instances
            .read()
            .get(&instance_id)
            .cloned()
            .ok_or(Error::ModuleUnknownInstance { instance_id })
    }

    /// Create one instance per default address of every type
    ///
    /// A failure aborts the pass unless the type ignores init failures.
    pub fn initialize_default_modules(&self) -> Result<()> {
        for module_type in self.module_types() {
            for default in &module_type.defaults {
                let result = self.initialize_module(
                    module_type.id,
                    &default.address,
                    default.config.clone(),
                    None,
                );
                match result {
                    Ok(_) => {}
                    Err(e) if module_type.ignore_fail_on_init => {
                        warn!(module = %module_type.name, error = %e, "ignoring module init failure");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Create an instance of a type
    pub fn initialize_module(
        &self,
        type_id: u32,
        address: &str,
        config: serde_json::Value,
        description: Option<String>,
    ) -> Result<Arc<ModuleInstance>> {
        let module_type = self
            .types
            .read()
            .get(&type_id)
            .cloned()
            .ok_or(Error::ModuleUnknownType { type_id })?;

        // IDs are never handed out twice, even when init fails
        let instance_id = self.next_instance_id.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = ModuleContext {
            instance_id,
            address: address.to_string(),
            description,
            config,
        };

        let module = (module_type.init)(ctx).map_err(|e| Error::ModuleInitFailed {
            type_id,
            name: module_type.name.clone(),
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let instance = Arc::new(ModuleInstance {
            id: instance_id,
            type_id,
            type_name: module_type.name.clone(),
            name: module.name().to_string(),
            address: module.address().to_string(),
            description: module.description().to_string(),
            module,
            started: AtomicBool::new(false),
        });
        self.instances.write().insert(instance_id, instance.clone());

        info!(
            type_id,
            instance_id,
            name = %instance.name,
            address = %instance.address,
            "Initialized module"
        );
        Ok(instance)
    }

    /// Create an instance of the type registered as `name`
    pub fn initialize_module_by_name(
        &self,
        name: &str,
        address: &str,
        config: serde_json::Value,
        description: Option<String>,
    ) -> Result<Arc<ModuleInstance>> {
        let type_id = self
            .types
            .read()
            .values()
            .find(|t| t.name == name)
            .map(|t| t.id)
            .ok_or_else(|| Error::ModuleUnknownTypeName {
                name: name.to_string(),
            })?;
        self.initialize_module(type_id, address, config, description)
    }

    /// Start an instance, waiting at most the supervision timeout
    pub async fn start_module(&self, instance_id: u32) -> Result<()> {
        let instance = self.get_module_instance(instance_id)?;
        let (tx, mut rx) = oneshot::channel();
        let phase = Arc::new(AtomicU8::new(START_PENDING));

        let task_instance = instance.clone();
        let task_phase = phase.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task_instance.module.start())
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => StartOutcome::Started,
                Ok(Err(e)) => StartOutcome::Failed(e.to_string()),
                Err(panic) => StartOutcome::Panicked(panic_message(panic)),
            };

            // Whoever moves the phase first owns the outcome
            if task_phase.swap(START_FINISHED, Ordering::SeqCst) == START_TIMED_OUT {
                late_outcome(&task_instance, outcome);
                return;
            }
            let _ = tx.send(outcome);
        });

        let received = match tokio::time::timeout(self.start_timeout, &mut rx).await {
            Ok(received) => received,
            Err(_) => {
                instance.set_started(true);
                if phase
                    .compare_exchange(
                        START_PENDING,
                        START_TIMED_OUT,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    debug!(instance_id, "module still starting, assuming long-running");
                    self.record_start(&instance, outcome::TIMEOUT);
                    self.log_started(&instance);
                    return Ok(());
                }
                // Finished right at the deadline, the outcome is already sent
                rx.await
            }
        };

        match received {
            Ok(StartOutcome::Started) => {
                instance.set_started(true);
                self.record_start(&instance, outcome::OK);
                self.log_started(&instance);
                Ok(())
            }
            Ok(StartOutcome::Failed(reason)) => {
                instance.set_started(false);
                self.record_start(&instance, outcome::FAILED);
                Err(instance.start_failed(reason))
            }
            Ok(StartOutcome::Panicked(reason)) => {
                instance.set_started(false);
                self.record_start(&instance, outcome::PANICKED);
                Err(instance.start_failed(format!("panicked: {}", reason)))
            }
            Err(_) => {
                instance.set_started(false);
                self.record_start(&instance, outcome::FAILED);
                Err(instance.start_failed("start task ended without an outcome"))
            }
        }
    }

    fn log_started(&self, instance: &ModuleInstance) {
        info!(
            type_id = instance.type_id,
            instance_id = instance.id,
            name = %instance.name,
            address = %instance.address,
            "Started module"
        );
    }

    /// Start every instance not yet started; stops at the first failure
    pub async fn start_default_modules(&self) -> Result<()> {
        for instance in self.module_instances() {
            if instance.is_started() {
                continue;
            }
            self.start_module(instance.id).await?;
        }
        Ok(())
    }

    /// Stop every started instance
    pub async fn stop(&self) {
        for instance in self.module_instances() {
            if !instance.is_started() {
                continue;
            }
            if let Err(e) = instance.module.stop().await {
                warn!(instance_id = instance.id, name = %instance.name, error = %e, "module stop failed");
            }
            instance.set_started(false);
        }
    }

    fn record_start(&self, instance: &ModuleInstance, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_module_start(&instance.type_name, outcome);
        }
    }
}

impl std::fmt::Debug for ModuleSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSupervisor")
            .field("types", &self.types.read().len())
            .field("instances", &self.instances.read().len())
            .field("start_timeout", &self.start_timeout)
            .finish()
    }
}

//! Storage backend contract and the name-keyed registry of backends.
//!
//! A backend implements five verbs ([`StorageBackend::validate`], `stage`,
//! `unstage`, `publish`, `unpublish`) plus descriptive metadata. The
//! [`BackendRegistry`] is populated once at startup and shared read-only
//! afterwards.

pub mod local;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{BackendError, VolumeError};
use crate::types::{BackendCapabilities, BackendInfo, Parameters, Volume};

pub use local::{LocalBackend, MountMode};

/// A pluggable storage engine.
///
/// Every verb except `validate` must be idempotent: callers retry freely and
/// a teardown of something never set up succeeds.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Check creation parameters. Runs before any record is persisted.
    fn validate(&self, parameters: &Parameters) -> Result<(), BackendError>;

    /// Prepare the volume's data at a node-local staging path.
    async fn stage(&self, volume: &Volume, staging_path: &Path) -> Result<(), BackendError>;

    async fn unstage(&self, volume: &Volume, staging_path: &Path) -> Result<(), BackendError>;

    /// Make the volume reachable at `target_path`, creating it if absent.
    async fn publish(
        &self,
        volume: &Volume,
        staging_path: &Path,
        target_path: &Path,
        read_only: bool,
    ) -> Result<(), BackendError>;

    async fn unpublish(&self, volume: &Volume, target_path: &Path) -> Result<(), BackendError>;
}

/// Produces a backend instance on demand.
pub type BackendFactory =
    Box<dyn Fn() -> Result<Arc<dyn StorageBackend>, BackendError> + Send + Sync>;

/// Name-keyed set of backend factories.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: BackendFactory,
    ) -> Result<(), VolumeError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(VolumeError::AlreadyRegistered(name));
        }
        info!(backend = %name, "storage backend registered");
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve `name` to a backend instance.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageBackend>, VolumeError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| VolumeError::BackendNotFound(name.to_owned()))?;
        factory().map_err(|e| VolumeError::Internal(format!("backend {name}: {e}")))
    }

    /// Describe every registered backend, sorted by name.
    pub fn list(&self) -> Vec<BackendInfo> {
        self.factories
            .iter()
            .filter_map(|(name, factory)| match factory() {
                Ok(backend) => Some(BackendInfo {
                    name: name.clone(),
                    description: format!("{name} storage backend"),
                    capabilities: backend.capabilities(),
                }),
                Err(e) => {
                    warn!(backend = %name, error = %e, "backend factory failed");
                    None
                }
            })
            .collect()
    }
}

//! Volume lifecycle orchestrator.
//!
//! [`VolumeLifecycle`] drives a volume through create, stage, publish and
//! their reversals. It validates before persisting, calls the backend before
//! recording an acknowledgement, and never retries a failed backend call.
//!
//! Node-set changes are read-modify-write cycles guarded by
//! [`MetadataStore::compare_and_update`], so concurrent stages on different
//! nodes never lose each other's entry.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendRegistry, StorageBackend};
use crate::error::{BackendOp, StoreError, VolumeError};
use crate::store::MetadataStore;
use crate::types::{
    BackendInfo, CreateVolumeRequest, PublishVolumeRequest, StageVolumeRequest,
    UnpublishVolumeRequest, UnstageVolumeRequest, Volume,
};

/// Attempts for one node-set update before giving up on contention.
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Orchestrates volume state transitions against a store and a registry.
pub struct VolumeLifecycle {
    store: Arc<dyn MetadataStore>,
    registry: Arc<BackendRegistry>,
}

impl VolumeLifecycle {
    pub fn new(store: Arc<dyn MetadataStore>, registry: Arc<BackendRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Validate the request and persist a new `Created` record.
    #[instrument(skip(self, req), fields(name = %req.name, backend = %req.backend))]
    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, VolumeError> {
        if req.name.trim().is_empty() {
            return Err(VolumeError::Validation("name is required".into()));
        }
        if req.backend.trim().is_empty() {
            return Err(VolumeError::Validation("backend is required".into()));
        }

        let backend = self.registry.get(&req.backend)?;
        backend
            .validate(&req.parameters)
            .map_err(|e| VolumeError::Validation(e.to_string()))?;

        let volume = Volume::new(req.name, req.backend, req.parameters);
        self.store.create_volume(&volume).await?;
        info!(id = %volume.id, "volume created");
        Ok(volume)
    }

    pub async fn get_volume(&self, id: &str) -> Result<Volume, VolumeError> {
        Ok(self.store.get_volume(id).await?)
    }

    pub async fn get_volume_by_name(&self, name: &str) -> Result<Volume, VolumeError> {
        Ok(self.store.get_volume_by_name(name).await?)
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, VolumeError> {
        Ok(self.store.list_volumes().await?)
    }

    /// Remove a volume that is published nowhere.
    ///
    /// The delete only commits against the exact record that was checked, so
    /// a publish racing with it either lands first and blocks the delete or
    /// finds the volume gone.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, id: &str) -> Result<(), VolumeError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let volume = self.store.get_volume(id).await?;
            if volume.is_published() {
                let nodes: Vec<_> = volume.published_on.iter().cloned().collect();
                return Err(VolumeError::Conflict(format!(
                    "volume {id} is still published on {}",
                    nodes.join(", ")
                )));
            }
            match self.store.compare_and_delete(&volume).await {
                Ok(()) => {
                    info!("volume deleted");
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(attempt, "volume changed before delete, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(contended(id))
    }

    #[instrument(skip(self, req), fields(node = %req.node_id))]
    pub async fn stage_volume(
        &self,
        id: &str,
        req: StageVolumeRequest,
    ) -> Result<Volume, VolumeError> {
        require("staging_path", &req.staging_path)?;
        require("node_id", &req.node_id)?;

        let (volume, backend) = self.resolve(id).await?;
        backend
            .stage(&volume, Path::new(&req.staging_path))
            .await
            .map_err(|source| backend_failed(BackendOp::Stage, source))?;

        let node = req.node_id;
        let volume = self
            .update_nodes(volume, |v| {
                v.staged_on.insert(node.clone());
            })
            .await?;
        info!(status = %volume.status, "volume staged");
        Ok(volume)
    }

    #[instrument(skip(self, req))]
    pub async fn unstage_volume(
        &self,
        id: &str,
        req: UnstageVolumeRequest,
    ) -> Result<Volume, VolumeError> {
        require("staging_path", &req.staging_path)?;

        let (volume, backend) = self.resolve(id).await?;
        backend
            .unstage(&volume, Path::new(&req.staging_path))
            .await
            .map_err(|source| backend_failed(BackendOp::Unstage, source))?;

        let Some(node) = req.node_id else {
            debug!("no node given, node sets unchanged");
            return Ok(volume);
        };
        let volume = self
            .update_nodes(volume, |v| {
                v.staged_on.remove(&node);
            })
            .await?;
        info!(status = %volume.status, "volume unstaged");
        Ok(volume)
    }

    #[instrument(skip(self, req), fields(node = %req.node_id, read_only = req.read_only))]
    pub async fn publish_volume(
        &self,
        id: &str,
        req: PublishVolumeRequest,
    ) -> Result<Volume, VolumeError> {
        require("target_path", &req.target_path)?;
        require("node_id", &req.node_id)?;

        let (volume, backend) = self.resolve(id).await?;
        backend
            .publish(
                &volume,
                Path::new(&req.staging_path),
                Path::new(&req.target_path),
                req.read_only,
            )
            .await
            .map_err(|source| backend_failed(BackendOp::Publish, source))?;

        let node = req.node_id;
        let volume = self
            .update_nodes(volume, |v| {
                v.published_on.insert(node.clone());
            })
            .await?;
        info!(status = %volume.status, "volume published");
        Ok(volume)
    }

    #[instrument(skip(self, req))]
    pub async fn unpublish_volume(
        &self,
        id: &str,
        req: UnpublishVolumeRequest,
    ) -> Result<Volume, VolumeError> {
        require("target_path", &req.target_path)?;

        let (volume, backend) = self.resolve(id).await?;
        backend
            .unpublish(&volume, Path::new(&req.target_path))
            .await
            .map_err(|source| backend_failed(BackendOp::Unpublish, source))?;

        let Some(node) = req.node_id else {
            debug!("no node given, node sets unchanged");
            return Ok(volume);
        };
        let volume = self
            .update_nodes(volume, |v| {
                v.published_on.remove(&node);
            })
            .await?;
        info!(status = %volume.status, "volume unpublished");
        Ok(volume)
    }

    pub fn list_backends(&self) -> Vec<BackendInfo> {
        self.registry.list()
    }

    async fn resolve(&self, id: &str) -> Result<(Volume, Arc<dyn StorageBackend>), VolumeError> {
        let volume = self.store.get_volume(id).await?;
        let backend = self.registry.get(&volume.backend)?;
        Ok((volume, backend))
    }

    /// Apply `change` to the freshest copy of `volume` and store it, retrying
    /// when another writer got there first.
    async fn update_nodes(
        &self,
        mut current: Volume,
        change: impl Fn(&mut Volume),
    ) -> Result<Volume, VolumeError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut next = current.clone();
            change(&mut next);
            next.refresh_status();
            if next == current {
                return Ok(current);
            }
            next.updated_at = Utc::now();

            match self.store.compare_and_update(&current, &next).await {
                Ok(()) => return Ok(next),
                Err(StoreError::Conflict(_)) => {
                    debug!(attempt, "volume changed concurrently, retrying");
                    current = self.store.get_volume(&current.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(contended(&current.id))
    }
}

/// Retries ran out against concurrent writers. This is transient, so it
/// surfaces as a store failure rather than as a state conflict.
fn contended(id: &str) -> VolumeError {
    warn!(%id, "giving up on contended volume write");
    VolumeError::Store(StoreError::Conflict(id.to_owned()))
}

fn require(field: &str, value: &str) -> Result<(), VolumeError> {
    if value.trim().is_empty() {
        return Err(VolumeError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn backend_failed(op: BackendOp, source: crate::error::BackendError) -> VolumeError {
    warn!(%op, error = %source, "backend operation failed");
    VolumeError::BackendOperationFailed { op, source }
}

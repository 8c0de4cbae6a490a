//! [`VolumeDriver`]: the CSI services backed by the volume manager.
//!
//! Every call is translated into one request against the manager's HTTP API.
//! The driver keeps no state of its own beyond the node identifier it stamps
//! on stage and publish requests.

use std::collections::HashMap;

use async_trait::async_trait;
use libvolume::api::ManagerClient;
use libvolume::types::{
    CreateVolumeRequest as ManagerCreateRequest, PublishVolumeRequest, StageVolumeRequest,
    UnpublishVolumeRequest, UnstageVolumeRequest,
};
use tracing::{debug, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::types::*;

/// Name reported by `GetPluginInfo`.
pub const PLUGIN_NAME: &str = "rkvol.csi.rk8s.io";
/// Storage-class parameter selecting the backend.
pub const PARAM_BACKEND: &str = "backend";
/// Backend used when a request does not name one.
pub const DEFAULT_BACKEND: &str = "local";
/// Topology segment key carrying the node identifier.
pub const TOPOLOGY_NODE_KEY: &str = "topology.rkvol.csi.rk8s.io/node";

/// Identity, Controller and Node services for one node agent.
pub struct VolumeDriver {
    client: ManagerClient,
    node_id: String,
    max_volumes: u64,
}

impl VolumeDriver {
    pub fn new(client: ManagerClient, node_id: impl Into<String>) -> Self {
        Self {
            client,
            node_id: node_id.into(),
            max_volumes: 0,
        }
    }

    /// Cap the number of volumes reported by `NodeGetInfo`.
    pub fn with_max_volumes(mut self, max_volumes: u64) -> Self {
        self.max_volumes = max_volumes;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

fn require(field: &str, value: &str) -> Result<(), CsiError> {
    if value.trim().is_empty() {
        return Err(CsiError::required(field));
    }
    Ok(())
}

async fn ensure_dir(path: &str) -> Result<(), CsiError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| CsiError::Internal(format!("create {path}: {e}")))
}

/// Treat a missing volume as an already completed teardown.
fn already_gone(result: Result<(), CsiError>, volume_id: &VolumeId) -> Result<(), CsiError> {
    match result {
        Err(CsiError::VolumeNotFound(_)) => {
            warn!(%volume_id, "volume not found, treating teardown as done");
            Ok(())
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for VolumeDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        match self.client.health().await {
            Ok(healthy) => Ok(healthy),
            Err(e) => {
                warn!(error = %e, manager = self.client.base_url(), "volume manager unreachable");
                Ok(false)
            }
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for VolumeDriver {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        require("volume name", &req.name)?;

        let volume_context = req.parameters.clone();
        let mut parameters = req.parameters;
        let backend = parameters
            .remove(PARAM_BACKEND)
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BACKEND.to_owned());

        let created = self
            .client
            .create_volume(&ManagerCreateRequest {
                name: req.name,
                backend,
                parameters: parameters.into_iter().collect(),
            })
            .await?;

        info!(volume_id = %created.id, backend = %created.backend, "volume created");
        Ok(Volume {
            volume_id: VolumeId(created.id),
            capacity_bytes: 0,
            volume_context,
            accessible_topology: Vec::new(),
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        require("volume id", volume_id.as_str())?;
        match self.client.delete_volume(volume_id.as_str()).await {
            Ok(()) => {
                info!("volume deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("volume already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        require("volume id", volume_id.as_str())?;
        self.client.get_volume(volume_id.as_str()).await?;
        debug!(%volume_id, requested = capabilities.len(), "capabilities confirmed");
        Ok(true)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        let volumes = self.client.list_volumes().await?;
        Ok(volumes
            .into_iter()
            .map(|v| {
                let mut volume_context: HashMap<String, String> = v.parameters.into_iter().collect();
                volume_context.insert(PARAM_BACKEND.to_owned(), v.backend);
                Volume {
                    volume_id: VolumeId(v.id),
                    capacity_bytes: 0,
                    volume_context,
                    accessible_topology: Vec::new(),
                }
            })
            .collect())
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Ok(0)
    }

    async fn get_controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::ListVolumes,
        ])
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for VolumeDriver {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node = %self.node_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require("volume id", req.volume_id.as_str())?;
        require("staging target path", &req.staging_target_path)?;

        ensure_dir(&req.staging_target_path).await?;
        self.client
            .stage_volume(
                req.volume_id.as_str(),
                &StageVolumeRequest {
                    staging_path: req.staging_target_path,
                    node_id: self.node_id.clone(),
                },
            )
            .await?;
        info!("volume staged");
        Ok(())
    }

    #[instrument(skip(self), fields(node = %self.node_id))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require("volume id", volume_id.as_str())?;
        require("staging target path", staging_target_path)?;

        let result = self
            .client
            .unstage_volume(
                volume_id.as_str(),
                &UnstageVolumeRequest {
                    staging_path: staging_target_path.to_owned(),
                    node_id: Some(self.node_id.clone()),
                },
            )
            .await
            .map_err(CsiError::from);
        already_gone(result, volume_id)?;
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node = %self.node_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require("volume id", req.volume_id.as_str())?;
        require("staging target path", &req.staging_target_path)?;
        require("target path", &req.target_path)?;

        ensure_dir(&req.target_path).await?;
        self.client
            .publish_volume(
                req.volume_id.as_str(),
                &PublishVolumeRequest {
                    staging_path: req.staging_target_path,
                    target_path: req.target_path,
                    read_only: req.read_only,
                    node_id: self.node_id.clone(),
                },
            )
            .await?;
        info!(read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self), fields(node = %self.node_id))]
    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
        require("volume id", volume_id.as_str())?;
        require("target path", target_path)?;

        let result = self
            .client
            .unpublish_volume(
                volume_id.as_str(),
                &UnpublishVolumeRequest {
                    target_path: target_path.to_owned(),
                    node_id: Some(self.node_id.clone()),
                },
            )
            .await
            .map_err(CsiError::from);
        already_gone(result, volume_id)?;
        info!("volume unpublished");
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: self.max_volumes,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(TOPOLOGY_NODE_KEY.to_owned(), self.node_id.clone())]),
            }),
        })
    }
}

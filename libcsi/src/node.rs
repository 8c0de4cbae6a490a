//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a volume available to
//! pod containers in two steps:
//!
//! 1. **Stage** — prepare the volume at a node-local staging path.
//! 2. **Publish** — expose the staged volume at the pod's target path.
//!
//! Unpublish and unstage reverse them in the opposite order.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service — per-node stage / publish operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at `staging_target_path`.
    ///
    /// This is idempotent — calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Reverse a stage.
    ///
    /// This is idempotent — calling it on an already-unstaged volume, or on
    /// a volume that no longer exists, succeeds.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a staged volume at `target_path`.
    ///
    /// This is idempotent — calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Reverse a publish. This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}

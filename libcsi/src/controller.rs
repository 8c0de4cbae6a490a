//! CSI Controller service trait.
//!
//! The Controller service manages the cluster-wide volume catalog: creation,
//! deletion, capability validation, listing, and capacity queries. Every call
//! is forwarded to the volume manager; the service itself keeps no state.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{ControllerCapability, CreateVolumeRequest, Volume, VolumeCapability, VolumeId};

/// Controller service — centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] carries the assigned `volume_id` and the
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume. Deleting an unknown volume succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the available capacity in bytes; `0` means unbounded.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    async fn get_controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}

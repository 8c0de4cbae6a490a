//! Metadata store abstraction.
//!
//! A [`MetadataStore`] is the sole authority on which volumes exist. Two
//! implementations are provided:
//!
//! | Type | Use |
//! |---|---|
//! | [`MemoryStore`] | single-process deployments and tests |
//! | [`ConsensusStore`] | replicated catalog backed by an embedded raft member |

pub mod consensus;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::Volume;

pub use consensus::{ClusterLayout, ConsensusConfig, ConsensusStore};
pub use memory::MemoryStore;

/// Key prefix for primary volume records.
pub const VOLUME_PREFIX: &str = "/volumes/";
/// Key prefix for the name index.
pub const VOLUME_NAME_PREFIX: &str = "/volume-names/";

pub fn volume_key(id: &str) -> String {
    format!("{VOLUME_PREFIX}{id}")
}

pub fn volume_name_key(name: &str) -> String {
    format!("{VOLUME_NAME_PREFIX}{name}")
}

/// Durable, linearizable catalog of volume records.
///
/// Implementations must make the uniqueness check and dual write of
/// [`create_volume`](Self::create_volume) a single atomic step, and must be
/// safe for any number of concurrent callers.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a new record. Fails with [`StoreError::AlreadyExists`] when the
    /// id or the name is taken.
    async fn create_volume(&self, volume: &Volume) -> Result<(), StoreError>;

    async fn get_volume(&self, id: &str) -> Result<Volume, StoreError>;

    async fn get_volume_by_name(&self, name: &str) -> Result<Volume, StoreError>;

    /// Return every record, ordered by id.
    async fn list_volumes(&self) -> Result<Vec<Volume>, StoreError>;

    /// Replace an existing record wholesale.
    async fn update_volume(&self, volume: &Volume) -> Result<(), StoreError>;

    /// Replace `current` with `next` only if the stored record still equals
    /// `current`. Fails with [`StoreError::Conflict`] otherwise.
    async fn compare_and_update(&self, current: &Volume, next: &Volume) -> Result<(), StoreError>;

    /// Remove the record and its name index atomically.
    async fn delete_volume(&self, id: &str) -> Result<(), StoreError>;

    /// Remove `current` and its name index only if the stored record still
    /// equals `current`. Fails with [`StoreError::Conflict`] otherwise.
    async fn compare_and_delete(&self, current: &Volume) -> Result<(), StoreError>;

    /// Whether the store can currently serve requests.
    async fn is_ready(&self) -> bool {
        true
    }

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;
}

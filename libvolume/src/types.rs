//! Volume data model shared by the stores, the lifecycle orchestrator and the
//! HTTP API.
//!
//! Every type here is [`Serialize`]/[`Deserialize`]: volume records are
//! persisted as JSON in the metadata store and the same representation is
//! returned over the control-plane API.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-specific parameters attached to a volume at creation time.
pub type Parameters = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Volume record
// ---------------------------------------------------------------------------

/// Lifecycle status of a volume.
///
/// The persisted status is derived from the node sets: see
/// [`Volume::refresh_status`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    /// Recorded in the catalog, not staged anywhere.
    #[default]
    Created,
    /// A stage operation is in flight.
    Staging,
    /// Staged on at least one node, published nowhere.
    Staged,
    /// Published on at least one node.
    Published,
    /// The last backend operation failed.
    Failed,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Staging => "staging",
            Self::Staged => "staged",
            Self::Published => "published",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A volume record as stored in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Immutable UUID assigned at creation.
    pub id: String,
    /// Immutable, cluster-wide unique name chosen by the caller.
    pub name: String,
    /// Name of the registered backend serving this volume.
    pub backend: String,
    /// Backend parameters, fixed at creation.
    #[serde(default)]
    pub parameters: Parameters,
    pub status: VolumeStatus,
    /// Nodes whose stage operation has been acknowledged by the backend.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub staged_on: BTreeSet<String>,
    /// Nodes whose publish operation has been acknowledged by the backend.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub published_on: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    /// Build a fresh record with a new UUID and `Created` status.
    pub fn new(name: impl Into<String>, backend: impl Into<String>, parameters: Parameters) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            backend: backend.into(),
            parameters,
            status: VolumeStatus::Created,
            staged_on: BTreeSet::new(),
            published_on: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute [`Volume::status`] from the node sets.
    pub fn refresh_status(&mut self) {
        self.status = if !self.published_on.is_empty() {
            VolumeStatus::Published
        } else if !self.staged_on.is_empty() {
            VolumeStatus::Staged
        } else {
            VolumeStatus::Created
        };
    }

    pub fn is_published(&self) -> bool {
        !self.published_on.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to register a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub backend: String,
    #[serde(default)]
    pub parameters: Parameters,
}

/// Request to stage a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageVolumeRequest {
    pub staging_path: String,
    pub node_id: String,
}

/// Request to reverse a stage.
///
/// `node_id` is optional so that callers that never recorded a node can
/// still tear down the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnstageVolumeRequest {
    pub staging_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Request to publish a staged volume at a workload-visible path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishVolumeRequest {
    #[serde(default)]
    pub staging_path: String,
    pub target_path: String,
    #[serde(default)]
    pub read_only: bool,
    pub node_id: String,
}

/// Request to reverse a publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpublishVolumeRequest {
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Backend descriptors
// ---------------------------------------------------------------------------

/// Feature flags a backend advertises for client-side negotiation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    pub supports_read_only: bool,
    pub supports_read_write: bool,
    pub supports_snapshot: bool,
    pub supports_clone: bool,
}

/// Entry returned by the list-backends operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: String,
    pub description: String,
    pub capabilities: BackendCapabilities,
}

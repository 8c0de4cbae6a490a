//! # libvolume
//!
//! Volume catalog and lifecycle orchestration for rk8s.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | `Volume` record, lifecycle requests, backend descriptors. |
//! | [`error`] | [`VolumeError`], [`StoreError`], [`BackendError`]. |
//! | [`store`] | [`MetadataStore`] contract, in-memory and raft-replicated stores. |
//! | [`backend`] | [`StorageBackend`] contract, registry, `local` backend. |
//! | [`lifecycle`] | [`VolumeLifecycle`] orchestrator. |
//! | [`api`] | HTTP/JSON control-plane server and client. |

pub mod api;
pub mod backend;
pub mod error;
pub mod lifecycle;
pub mod store;
pub mod types;

pub use backend::{BackendRegistry, StorageBackend};
pub use error::{BackendError, StoreError, VolumeError};
pub use lifecycle::VolumeLifecycle;
pub use store::MetadataStore;
pub use types::*;

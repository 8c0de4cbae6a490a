//! # libcsi — Simplified CSI over QUIC for rkvol
//!
//! `libcsi` implements a lightweight [Container Storage Interface][csi] layer
//! that uses QUIC (via [`quinn`]) instead of gRPC for transport. Requests are
//! served by [`VolumeDriver`], which forwards every call to the rkvol volume
//! manager and records the calling node in the volume's node sets.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait — volume create/delete. |
//! | [`node`] | [`CsiNode`] trait — stage, publish, unpublish, unstage. |
//! | [`driver`] | [`VolumeDriver`] — all three services over the manager API. |
//! | [`transport`] | QUIC client/server built on `quinn`, TLS helpers. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use controller::CsiController;
pub use driver::VolumeDriver;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use transport::{CsiClient, CsiServer};
pub use types::*;

//! Control-plane request surface: the axum router served by the manager and
//! the matching reqwest client used by node agents.

pub mod client;
pub mod error;
pub mod server;

pub use client::{ClientError, ManagerClient};
pub use error::{ApiError, ErrorBody, ErrorCode};
pub use server::{
    BackendList, MessageResponse, REQUEST_TIMEOUT, VolumeList, router, router_with_timeout, serve,
};

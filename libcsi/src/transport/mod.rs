//! QUIC transport layer for CSI messages.
//!
//! This module provides [`CsiClient`] and [`CsiServer`] that communicate
//! [`CsiMessage`](crate::message::CsiMessage) values over QUIC bi-directional
//! streams using `quinn`, plus the [`tls`] helpers that build their rustls
//! configurations.

pub mod client;
pub mod server;
pub mod tls;

pub use client::CsiClient;
pub use server::CsiServer;

/// Upper bound on a single JSON-encoded request or response.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// ALPN identifier negotiated by both ends.
pub const ALPN_CSI: &[u8] = b"rkvol-csi/1";

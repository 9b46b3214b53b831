//! QUIC transport layer for CSI messages.
//!
//! This module provides [`CsiClient`](client::CsiClient) and
//! [`CsiServer`](server::CsiServer) that communicate [`CsiMessage`] values
//! over QUIC bi-directional streams using `quinn`, plus [`tls`] helpers that
//! build the rustls configurations both sides need from PEM files.
//!
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;
pub mod tls;

/// Upper bound on a single encoded request or response.
pub(crate) const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

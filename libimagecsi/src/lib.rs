//! # libimagecsi — Image volumes for RK8s over a CSI node service
//!
//! `libimagecsi` publishes OCI images into Pods as read-only volumes.  A
//! publish pulls the image into a shared blob store, unpacks it once per
//! manifest digest into a rootfs cache, records a reference for the volume,
//! and links the rootfs at the Pod's target path.  Unpublish drops the
//! reference and reclaims the rootfs when nobody else uses it.
//!
//! The CSI surface is carried over QUIC (via [`quinn`]) as in the rest of
//! RK8s, with Tokio, `tracing` and `thiserror` throughout.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`config`] | [`ImageDriverConfig`], defaults and environment overrides. |
//! | [`runner`] | External command execution with an optional deadline. |
//! | [`tools`] | [`tools::ImageTools`] seam over the copy and unpack tools. |
//! | [`layout`] | On-disk store layout and filesystem primitives. |
//! | [`rollback`] | Undo log that unwinds a failed publish. |
//! | [`gate`] | Process-wide publish/unpublish serialization. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait — stage, publish, unpublish, unstage. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | The image volume backend. |

pub mod backend;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod layout;
pub mod message;
pub mod node;
pub mod rollback;
pub mod runner;
pub mod tools;
pub mod transport;
pub mod types;

pub use backend::ImageBackend;
pub use config::ImageDriverConfig;
pub use error::{CsiError, ErrorCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;

//! Core CSI types: volume identity, capabilities, requests, and plugin info.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and backend implementations.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key in [`NodePublishVolumeRequest::volume_context`] naming the image.
pub const CONTEXT_IMAGE: &str = "image";
/// Key in [`NodePublishVolumeRequest::volume_context`] naming the pod volume.
pub const CONTEXT_NAME: &str = "name";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
///
/// The unpacked rootfs is shared between volumes, so multi-node write is
/// refused at publish.  Kubelet requests [`AccessMode::ReadWriteOnce`] for
/// inline volumes by default, which is accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadOnlyMany,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to stage a volume on a node.  Image volumes have no staging step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from the volume source.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish an image as a volume at `target_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish; unique per mount request.
    pub volume_id: VolumeId,
    /// Where the pod expects the volume,
    /// e.g. `/var/lib/kubelet/pods/<pod-uid>/volumes/kubernetes.io~csi/<name>/mount`.
    pub target_path: String,
    /// Requested capability.  Required.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Must carry [`CONTEXT_IMAGE`]; may carry [`CONTEXT_NAME`].
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Image volumes are always read-only content; accepted for protocol
    /// compatibility.
    #[serde(default)]
    pub read_only: bool,
}

impl NodePublishVolumeRequest {
    /// The image reference requested through the volume context.
    pub fn image(&self) -> Option<&str> {
        self.volume_context
            .get(CONTEXT_IMAGE)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.image.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Optional capabilities advertised by the CSI plugin.
///
/// Image volumes only implement the Node service and advertise none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
}

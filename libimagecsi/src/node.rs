//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes an image available to
//! Pod containers:
//!
//! 1. **Stage** — not used by image volumes; always succeeds.
//! 2. **Publish** — pull and unpack the image, then alias it at the target path.
//! 3. **Unpublish** — remove the alias and reclaim unreferenced content.
//! 4. **Unstage** — not used by image volumes; always succeeds.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId};

/// Node service — local publish / unpublish operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume from the staging path.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at `req.target_path`.
    ///
    /// Either fully succeeds or leaves no new state behind.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.
    ///
    /// Safe to retry: every step tolerates its target already being gone.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}

//! Container-image storage backend for CSI.
//!
//! [`ImageBackend`] implements [`CsiIdentity`] and [`CsiNode`] by pulling an
//! image, unpacking it once per manifest digest, and aliasing the unpacked
//! rootfs at the pod's target path.  All state lives on disk under the
//! [`StoreLayout`] root; nothing is kept in memory between calls, so a
//! restarted plugin can unpublish volumes published by its predecessor.
//!
//! # Sharing
//!
//! Volumes that resolve to the same digest share one rootfs.  Each volume
//! drops a marker file into `volumes/<digest>/`; the rootfs is reclaimed by
//! whichever unpublish leaves that directory empty.
//!
//! # Concurrency
//!
//! Every publish and unpublish runs entirely inside the backend's
//! [`PublishGate`].

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::ImageDriverConfig;
use crate::error::CsiError;
use crate::gate::PublishGate;
use crate::identity::CsiIdentity;
use crate::layout::{
    ImageDigest, StoreLayout, claim_dir, create_marker, create_symlink, ensure_dir,
    list_references, read_alias, remove_dir_if_empty, remove_path, replace_symlink,
};
use crate::node::CsiNode;
use crate::rollback::Rollback;
use crate::tools::{ExternalImageTools, ImageTools};
use crate::types::*;

/// Name reported by `get_plugin_info`.
pub const PLUGIN_NAME: &str = "rk8s.image.csi";

const MAX_VOLUMES_PER_NODE: u64 = 256;

/// CSI backend that serves container images as read-only volumes.
pub struct ImageBackend<T = ExternalImageTools> {
    layout: StoreLayout,
    tools: T,
    gate: PublishGate,
    /// Node identifier (hostname or user-supplied string).
    node_id: String,
}

impl ImageBackend<ExternalImageTools> {
    /// Backend driving the external tools named in `cfg`.
    pub fn from_config(cfg: &ImageDriverConfig) -> Self {
        Self::new(
            StoreLayout::new(&cfg.root, &cfg.pods_dir),
            ExternalImageTools::from_config(cfg),
            cfg.node_id.clone(),
        )
    }
}

impl<T: ImageTools> ImageBackend<T> {
    pub fn new(layout: StoreLayout, tools: T, node_id: String) -> Self {
        Self {
            layout,
            tools,
            gate: PublishGate::new(),
            node_id,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// The exclusive region every publish and unpublish runs in.
    pub fn gate(&self) -> &PublishGate {
        &self.gate
    }

    async fn query_digest(&self, volume_id: &VolumeId) -> Result<ImageDigest, CsiError> {
        let raw = self
            .tools
            .manifest_digest(&self.layout.image_index(volume_id))
            .await?;
        ImageDigest::parse(raw.trim())
    }

    /// Find the digest a volume is registered under.
    ///
    /// The pulled layout is the primary source.  If it is already gone (an
    /// earlier unpublish got that far and then failed), fall back to finding
    /// the volume's reference marker.
    async fn resolve_digest(&self, volume_id: &VolumeId) -> Result<Option<ImageDigest>, CsiError> {
        if path_exists(&self.layout.image_index(volume_id)).await? {
            return self.query_digest(volume_id).await.map(Some);
        }
        self.find_marker(volume_id).await
    }

    async fn find_marker(&self, volume_id: &VolumeId) -> Result<Option<ImageDigest>, CsiError> {
        for digest in list_references(&self.layout.volumes_dir()).await? {
            let Ok(digest) = ImageDigest::parse(&digest) else {
                continue;
            };
            if path_exists(&self.layout.reference_marker(&digest, volume_id)).await? {
                debug!(%volume_id, %digest, "digest recovered from reference marker");
                return Ok(Some(digest));
            }
        }
        Ok(None)
    }

    /// `true` when an earlier publish of this exact request completed.
    ///
    /// An alias bound to `target` whose target never got linked is what a
    /// publish killed midway leaves behind; that state is discarded so the
    /// request can run again.
    async fn already_published(
        &self,
        volume_id: &VolumeId,
        alias: &Path,
        target: &Path,
    ) -> Result<bool, CsiError> {
        let Some(bound) = read_alias(alias).await? else {
            return Ok(false);
        };
        if bound != target {
            return Err(CsiError::InconsistentState(format!(
                "{} is already bound to {}",
                alias.display(),
                bound.display()
            )));
        }
        match read_alias(target).await? {
            Some(rootfs) if rootfs.starts_with(self.layout.rootfs_base()) => Ok(true),
            _ => {
                warn!(alias = %alias.display(), "discarding state of an interrupted publish");
                self.discard_interrupted(volume_id, alias).await?;
                Ok(false)
            }
        }
    }

    async fn discard_interrupted(&self, volume_id: &VolumeId, alias: &Path) -> Result<(), CsiError> {
        if let Some(digest) = self.find_marker(volume_id).await? {
            remove_path(&self.layout.reference_marker(&digest, volume_id)).await?;
            let refs_dir = self.layout.references_dir(&digest);
            if list_references(&refs_dir).await?.is_empty() {
                remove_path(&refs_dir).await?;
                remove_path(&self.layout.rootfs_dir(&digest)).await?;
            }
        }
        remove_path(&self.layout.image_dir(volume_id)).await?;
        remove_path(alias).await?;
        Ok(())
    }

    /// Link the pull's blob directory to the shared store so the layout is
    /// self-contained for the unpack tool.
    async fn link_shared_blobs(&self, image_dir: &Path) -> Result<(), CsiError> {
        let shared = self.layout.shared_sha256_dir();
        let blobs = image_dir.join("blobs");
        ensure_dir(&blobs).await?;
        let link = blobs.join("sha256");
        match read_alias(&link).await? {
            Some(existing) if existing == shared => Ok(()),
            _ => create_symlink(&shared, &link).await,
        }
    }
}

async fn path_exists(path: &Path) -> Result<bool, CsiError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| CsiError::io("stat", path, e))
}

fn require_ids(volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
    if volume_id.is_empty() {
        return Err(CsiError::InvalidArgument(
            "Volume ID missing in request".into(),
        ));
    }
    // Used as a file name under images/, volumes/ and pods/.
    if volume_id.0.contains('/') || volume_id.0 == "." || volume_id.0 == ".." {
        return Err(CsiError::InvalidArgument(format!(
            "Volume ID {volume_id} is not a valid file name"
        )));
    }
    if target_path.is_empty() {
        return Err(CsiError::InvalidArgument(
            "Target path missing in request".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl<T: ImageTools> CsiIdentity for ImageBackend<T> {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Healthy when the store root exists and is a directory.
        let exists = tokio::fs::metadata(self.layout.root())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(exists)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        // Node service only.
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl<T: ImageTools> CsiNode for ImageBackend<T> {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        debug!(volume_id = %req.volume_id, "stage is a no-op for image volumes");
        Ok(())
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), CsiError> {
        debug!(%volume_id, "unstage is a no-op for image volumes");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let _gate = self.gate.enter().await;

        let Some(capability) = &req.volume_capability else {
            return Err(CsiError::InvalidArgument(
                "Volume capability missing in request".into(),
            ));
        };
        if capability.access_mode == AccessMode::ReadWriteMany {
            return Err(CsiError::InvalidArgument(
                "image volumes cannot be published for multi-node write".into(),
            ));
        }
        require_ids(&req.volume_id, &req.target_path)?;
        let image = req.image().ok_or_else(|| {
            CsiError::InvalidArgument(format!("{CONTEXT_IMAGE} missing in volume context"))
        })?;

        self.layout.ensure_base_dirs().await?;

        let pod_uid = self.layout.pod_owner_id(&req.target_path)?;
        let target = Path::new(&req.target_path);
        let alias = self.layout.alias_path(pod_uid, &req.volume_id);

        if self.already_published(&req.volume_id, &alias, target).await? {
            debug!("volume already published, assuming idempotent retry");
            return Ok(());
        }

        // Declared after the gate guard so it unwinds while the gate is held.
        let mut rollback = Rollback::new();

        let pod_dir = self.layout.pod_dir(pod_uid);
        if claim_dir(&pod_dir).await? {
            rollback.push("pod alias dir", &pod_dir);
        }
        create_symlink(target, &alias).await?;
        rollback.push("volume alias", &alias);

        // Registered before the copy so a half-written layout is removed too.
        let image_dir = self.layout.image_dir(&req.volume_id);
        rollback.push("image pull", &image_dir);
        self.tools
            .pull(image, &self.layout.blobs_dir(), &image_dir)
            .await?;
        self.link_shared_blobs(&image_dir).await?;

        let digest = self.query_digest(&req.volume_id).await?;
        debug!(image, %digest, "image pulled");

        let rootfs = self.layout.rootfs_dir(&digest);
        let refs_dir = self.layout.references_dir(&digest);
        let mut fresh = claim_dir(&rootfs).await?;
        if !fresh && list_references(&refs_dir).await?.is_empty() {
            // Every referenced rootfs has a marker; this one is a partial unpack.
            warn!(%digest, "discarding unreferenced rootfs");
            remove_path(&rootfs).await?;
            fresh = claim_dir(&rootfs).await?;
        }
        if fresh {
            rollback.push("rootfs", &rootfs);
            self.tools.unpack(&image_dir, &rootfs).await?;
            info!(%digest, rootfs = %rootfs.display(), "image unpacked");
        } else {
            debug!(%digest, "reusing unpacked rootfs");
        }

        if claim_dir(&refs_dir).await? {
            rollback.push("reference dir", &refs_dir);
        }
        let marker = self.layout.reference_marker(&digest, &req.volume_id);
        if create_marker(&marker).await? {
            rollback.push("reference marker", &marker);
        } else {
            warn!(marker = %marker.display(), "reference marker already present");
        }

        replace_symlink(&rootfs, target).await?;
        rollback.push("target", target);

        rollback.commit();
        info!(%digest, image, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        let _gate = self.gate.enter().await;

        require_ids(volume_id, target_path)?;
        let pod_uid = self.layout.pod_owner_id(target_path)?;
        let alias = self.layout.alias_path(pod_uid, volume_id);
        let image_dir = self.layout.image_dir(volume_id);

        let Some(bound) = read_alias(&alias).await? else {
            if path_exists(&image_dir).await? {
                return Err(CsiError::InconsistentState(format!(
                    "alias {} is missing but the image pull for {volume_id} remains",
                    alias.display()
                )));
            }
            debug!("volume already unpublished");
            return Ok(());
        };

        if !remove_path(&bound).await? {
            debug!(target = %bound.display(), "target already absent");
        }

        match self.resolve_digest(volume_id).await? {
            Some(digest) => {
                let marker = self.layout.reference_marker(&digest, volume_id);
                remove_path(&marker).await?;

                let refs_dir = self.layout.references_dir(&digest);
                let remaining = list_references(&refs_dir).await?;
                if remaining.is_empty() {
                    remove_path(&refs_dir).await?;
                    remove_path(&self.layout.rootfs_dir(&digest)).await?;
                    info!(%digest, "last reference dropped, rootfs reclaimed");
                } else {
                    debug!(%digest, remaining = remaining.len(), "rootfs still referenced");
                }
            }
            None => warn!("no digest recorded for volume, skipping rootfs reclamation"),
        }

        remove_path(&image_dir).await?;
        remove_path(&alias).await?;
        remove_dir_if_empty(&self.layout.pod_dir(pod_uid)).await?;

        info!("volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: MAX_VOLUMES_PER_NODE,
        })
    }
}

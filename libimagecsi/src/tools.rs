//! External image tooling used by the image backend.
//!
//! [`ImageTools`] is the seam between the publish/unpublish orchestration and
//! the tools that actually move bytes.  [`ExternalImageTools`] drives `skopeo`
//! and `oci-image-tool` through a [`CommandRunner`].

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ImageDriverConfig;
use crate::error::CsiError;
use crate::runner::CommandRunner;

/// OCI ref name every pull is tagged with inside its own layout.
pub const IMAGE_REF_NAME: &str = "img";

/// Image transfer, digest and unpack operations.
#[async_trait]
pub trait ImageTools: Send + Sync {
    /// Copy `image` into an OCI layout at `dest_dir`, sharing blobs through
    /// `blobs_dir`.
    async fn pull(&self, image: &str, blobs_dir: &Path, dest_dir: &Path) -> Result<(), CsiError>;

    /// Digest of the manifest referenced by the layout's `index.json`.
    /// Surrounding whitespace is ignored by callers.
    async fn manifest_digest(&self, index_json: &Path) -> Result<String, CsiError>;

    /// Expand the layout at `layout_dir` into a flat filesystem at `dest_dir`.
    async fn unpack(&self, layout_dir: &Path, dest_dir: &Path) -> Result<(), CsiError>;
}

/// [`ImageTools`] backed by `skopeo` and `oci-image-tool`.
#[derive(Debug, Clone)]
pub struct ExternalImageTools {
    runner: CommandRunner,
    copy_tool: String,
    unpack_tool: String,
}

impl ExternalImageTools {
    pub fn new(runner: CommandRunner, copy_tool: impl Into<String>, unpack_tool: impl Into<String>) -> Self {
        Self {
            runner,
            copy_tool: copy_tool.into(),
            unpack_tool: unpack_tool.into(),
        }
    }

    pub fn from_config(cfg: &ImageDriverConfig) -> Self {
        Self::new(
            CommandRunner::new(cfg.command_timeout),
            cfg.copy_tool.clone(),
            cfg.unpack_tool.clone(),
        )
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn copy_args(image: &str, blobs_dir: &Path, dest_dir: &Path) -> Vec<String> {
    // Trailing slash: skopeo treats the shared blob dir as a directory prefix.
    let blobs = format!("{}/", path_arg(blobs_dir).trim_end_matches('/'));
    vec![
        "copy".to_owned(),
        "--src-shared-blob-dir".to_owned(),
        blobs.clone(),
        "--dest-shared-blob-dir".to_owned(),
        blobs,
        format!("docker://{image}"),
        format!("oci:{}:{IMAGE_REF_NAME}", path_arg(dest_dir)),
    ]
}

fn digest_args(index_json: &Path) -> Vec<String> {
    vec!["manifest-digest".to_owned(), path_arg(index_json)]
}

fn unpack_args(layout_dir: &Path, dest_dir: &Path) -> Vec<String> {
    vec![
        "unpack".to_owned(),
        "--ref".to_owned(),
        format!("name={IMAGE_REF_NAME}"),
        path_arg(layout_dir),
        path_arg(dest_dir),
    ]
}

#[async_trait]
impl ImageTools for ExternalImageTools {
    async fn pull(&self, image: &str, blobs_dir: &Path, dest_dir: &Path) -> Result<(), CsiError> {
        let out = self
            .runner
            .run(&self.copy_tool, &copy_args(image, blobs_dir, dest_dir))
            .await?;
        debug!(image, output = %out.combined(), "image copied");
        Ok(())
    }

    async fn manifest_digest(&self, index_json: &Path) -> Result<String, CsiError> {
        let out = self
            .runner
            .run(&self.copy_tool, &digest_args(index_json))
            .await?;
        Ok(out.stdout_trimmed())
    }

    async fn unpack(&self, layout_dir: &Path, dest_dir: &Path) -> Result<(), CsiError> {
        self.runner
            .run(&self.unpack_tool, &unpack_args(layout_dir, dest_dir))
            .await?;
        Ok(())
    }
}

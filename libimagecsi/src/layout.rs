//! On-disk layout of the image volume store.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//!   blobs/sha256/...            # shared, content-addressed blob store
//!   images/<volume-id>/         # per-volume OCI layout produced by the pull
//!   rootfs/<digest>/            # unpacked filesystem, one per digest
//!   volumes/<digest>/<volume-id> # reference markers; the listing is the count
//!   pods/<pod-uid>/<volume-id>  # alias symlink -> bound target path
//! ```
//!
//! Every path the orchestrators touch is built here, together with the small
//! set of filesystem primitives they are composed from.

use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::CsiError;
use crate::types::VolumeId;

/// Permission bits for every directory the store creates.
const DIR_MODE: u32 = 0o750;

/// Content digest of a pulled image manifest, e.g. `sha256:4f1c...`.
///
/// Used as a directory name, so it must be a single normal path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDigest(String);

impl ImageDigest {
    /// Validate the raw (already trimmed) output of a digest query.
    pub fn parse(raw: &str) -> Result<Self, CsiError> {
        let mut components = Path::new(raw).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !raw.contains('/') => Ok(Self(raw.to_owned())),
            _ => Err(CsiError::Internal(format!(
                "manifest digest {raw:?} is not a usable directory name"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical paths under the store root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    pods_prefix: String,
}

impl StoreLayout {
    /// * `root` — the store namespace, e.g. `/var/run/imager2`
    /// * `pods_prefix` — directory under which the caller places pod volumes,
    ///   e.g. `/var/lib/kubelet/pods`
    pub fn new(root: impl Into<PathBuf>, pods_prefix: impl AsRef<str>) -> Self {
        let mut pods_prefix = pods_prefix.as_ref().trim_end_matches('/').to_owned();
        pods_prefix.push('/');
        Self {
            root: root.into(),
            pods_prefix,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// The canonical digest subpath every pull workspace links its blobs to.
    pub fn shared_sha256_dir(&self) -> PathBuf {
        self.blobs_dir().join("sha256")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn image_dir(&self, volume_id: &VolumeId) -> PathBuf {
        self.images_dir().join(&volume_id.0)
    }

    /// `index.json` of the OCI layout pulled for `volume_id`.
    pub fn image_index(&self, volume_id: &VolumeId) -> PathBuf {
        self.image_dir(volume_id).join("index.json")
    }

    pub fn rootfs_base(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    pub fn rootfs_dir(&self, digest: &ImageDigest) -> PathBuf {
        self.rootfs_base().join(digest.as_str())
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn references_dir(&self, digest: &ImageDigest) -> PathBuf {
        self.volumes_dir().join(digest.as_str())
    }

    pub fn reference_marker(&self, digest: &ImageDigest, volume_id: &VolumeId) -> PathBuf {
        self.references_dir(digest).join(&volume_id.0)
    }

    pub fn pods_dir(&self) -> PathBuf {
        self.root.join("pods")
    }

    pub fn pod_dir(&self, pod_uid: &str) -> PathBuf {
        self.pods_dir().join(pod_uid)
    }

    pub fn alias_path(&self, pod_uid: &str, volume_id: &VolumeId) -> PathBuf {
        self.pod_dir(pod_uid).join(&volume_id.0)
    }

    /// Extract the owning pod UID from a target path.
    ///
    /// The target must live under the configured pods prefix; the UID is the
    /// first segment after it.  `/var/lib/kubelet/pods/<uid>/volumes/...`
    /// yields `<uid>`.
    pub fn pod_owner_id<'a>(&self, target_path: &'a str) -> Result<&'a str, CsiError> {
        let rest = target_path.strip_prefix(&self.pods_prefix).ok_or_else(|| {
            CsiError::InvalidArgument(format!(
                "target path {target_path} is not under {}",
                self.pods_prefix
            ))
        })?;
        match rest.split('/').next() {
            Some(uid) if !uid.is_empty() && uid != "." && uid != ".." => Ok(uid),
            _ => Err(CsiError::InvalidArgument(format!(
                "target path {target_path} does not name a pod"
            ))),
        }
    }

    /// Create the top-level store directories.  Idempotent.
    pub async fn ensure_base_dirs(&self) -> Result<(), CsiError> {
        for dir in [
            self.shared_sha256_dir(),
            self.images_dir(),
            self.volumes_dir(),
            self.rootfs_base(),
            self.pods_dir(),
        ] {
            ensure_dir(&dir).await?;
        }
        Ok(())
    }
}

/// `mkdir -p` with the store's directory mode.
pub async fn ensure_dir(path: &Path) -> Result<(), CsiError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(DIR_MODE);
    builder
        .create(path)
        .await
        .map_err(|e| CsiError::io("create dir", path, e))
}

/// Exclusively create `path`.
///
/// Returns `true` when this call created the directory and `false` when it
/// already existed; the caller that gets `true` owns the directory's lifecycle.
pub async fn claim_dir(path: &Path) -> Result<bool, CsiError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.mode(DIR_MODE);
    match builder.create(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(CsiError::io("create dir", path, e)),
    }
}

/// Remove whatever lives at `path`: a symlink or file is unlinked, a directory
/// is removed recursively.  Symlinks are never followed.
///
/// Returns `false` if nothing was there.
pub async fn remove_path(path: &Path) -> Result<bool, CsiError> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CsiError::io("stat", path, e)),
    };
    let removed = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CsiError::io("remove", path, e)),
    }
}

/// Point `link` at `target`, replacing anything already at `link`.
pub async fn replace_symlink(target: &Path, link: &Path) -> Result<(), CsiError> {
    if remove_path(link).await? {
        debug!(link = %link.display(), "replaced existing path");
    }
    create_symlink(target, link).await
}

/// Create `link -> target`; fails if `link` exists.
pub async fn create_symlink(target: &Path, link: &Path) -> Result<(), CsiError> {
    tokio::fs::symlink(target, link)
        .await
        .map_err(|e| CsiError::io("symlink", link, e))
}

/// Read a symlink, mapping a missing link to `None`.
pub async fn read_alias(link: &Path) -> Result<Option<PathBuf>, CsiError> {
    match tokio::fs::read_link(link).await {
        Ok(target) => Ok(Some(target)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CsiError::io("readlink", link, e)),
    }
}

/// Create an empty marker file.  Returns `false` if it already existed.
pub async fn create_marker(path: &Path) -> Result<bool, CsiError> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(CsiError::io("create marker", path, e)),
    }
}

/// Names of the reference markers in `dir`; empty if `dir` is gone.
pub async fn list_references(dir: &Path) -> Result<BTreeSet<String>, CsiError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(CsiError::io("read dir", dir, e)),
    };
    let mut names = BTreeSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CsiError::io("read dir", dir, e))?
    {
        names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Remove `dir` only if it is empty.  Returns whether it was removed.
pub async fn remove_dir_if_empty(dir: &Path) -> Result<bool, CsiError> {
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => Ok(true),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
            ) =>
        {
            Ok(false)
        }
        Err(e) => Err(CsiError::io("remove dir", dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StoreLayout {
        StoreLayout::new("/var/run/imager2", "/var/lib/kubelet/pods/")
    }

    #[test]
    fn canonical_paths() {
        let l = layout();
        let vol = VolumeId::from("csi-1");
        let digest = ImageDigest::parse("sha256:abc").unwrap();
        assert_eq!(l.image_dir(&vol), Path::new("/var/run/imager2/images/csi-1"));
        assert_eq!(
            l.rootfs_dir(&digest),
            Path::new("/var/run/imager2/rootfs/sha256:abc")
        );
        assert_eq!(
            l.reference_marker(&digest, &vol),
            Path::new("/var/run/imager2/volumes/sha256:abc/csi-1")
        );
        assert_eq!(
            l.alias_path("pod-uid", &vol),
            Path::new("/var/run/imager2/pods/pod-uid/csi-1")
        );
        assert_eq!(
            l.shared_sha256_dir(),
            Path::new("/var/run/imager2/blobs/sha256")
        );
    }

    #[test]
    fn pod_owner_from_target_path() {
        let l = layout();
        assert_eq!(
            l.pod_owner_id("/var/lib/kubelet/pods/1234/volumes/kubernetes.io~csi/vol/mount")
                .unwrap(),
            "1234"
        );
        // Prefix configured without a trailing slash behaves the same.
        let l = StoreLayout::new("/r", "/var/lib/kubelet/pods");
        assert_eq!(l.pod_owner_id("/var/lib/kubelet/pods/abc").unwrap(), "abc");
    }

    #[test]
    fn pod_owner_requires_prefix() {
        let l = layout();
        for bad in [
            "/tmp/elsewhere/1234",
            "/var/lib/kubelet/pods/",
            "/var/lib/kubelet/pods//x",
            "/var/lib/kubelet/pods/../etc",
            "/var/lib/kubelet/podsX/1",
        ] {
            assert!(
                matches!(l.pod_owner_id(bad), Err(CsiError::InvalidArgument(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn digest_must_be_single_component() {
        assert!(ImageDigest::parse("sha256:0123abcd").is_ok());
        for bad in ["", ".", "..", "a/b", "/abs", "../up"] {
            assert!(ImageDigest::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn claim_dir_reports_first_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rootfs");
        assert!(claim_dir(&dir).await.unwrap());
        assert!(!claim_dir(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn replace_symlink_overwrites_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target");
        let link = tmp.path().join("link");
        tokio::fs::create_dir_all(link.join("nested")).await.unwrap();
        tokio::fs::create_dir(&target).await.unwrap();

        replace_symlink(&target, &link).await.unwrap();
        assert_eq!(tokio::fs::read_link(&link).await.unwrap(), target);
    }

    #[tokio::test]
    async fn remove_path_does_not_follow_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("shared");
        tokio::fs::create_dir(&target).await.unwrap();
        tokio::fs::write(target.join("keep"), b"x").await.unwrap();
        let link = tmp.path().join("alias");
        create_symlink(&target, &link).await.unwrap();

        assert!(remove_path(&link).await.unwrap());
        assert!(target.join("keep").exists());
        assert!(!remove_path(&link).await.unwrap());
    }

    #[tokio::test]
    async fn references_are_a_directory_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sha256:abc");
        assert!(list_references(&dir).await.unwrap().is_empty());

        ensure_dir(&dir).await.unwrap();
        assert!(create_marker(&dir.join("v1")).await.unwrap());
        assert!(create_marker(&dir.join("v2")).await.unwrap());
        assert!(!create_marker(&dir.join("v2")).await.unwrap());

        let refs = list_references(&dir).await.unwrap();
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), ["v1", "v2"]);
        assert!(!remove_dir_if_empty(&dir).await.unwrap());
    }
}

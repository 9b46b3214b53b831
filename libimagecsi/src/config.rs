//! Image driver configuration.
//!
//! Environment variables:
//! - `IMAGECSI_ROOT`: store root. Defaults to `/var/run/imager2`.
//! - `IMAGECSI_PODS_DIR`: directory under which target paths are placed.
//!   Defaults to `/var/lib/kubelet/pods`.
//! - `IMAGECSI_COPY_TOOL`: image copy executable. Defaults to `skopeo`.
//! - `IMAGECSI_UNPACK_TOOL`: image unpack executable. Defaults to `oci-image-tool`.
//! - `IMAGECSI_TIMEOUT_SECS`: per-command timeout; `0` disables it.
//!   Defaults to `0`.
//! - `IMAGECSI_NODE_ID`: node identifier. Defaults to the host name.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

static ROOT_PATH: &str = "/var/run/imager2";
static PODS_DIR: &str = "/var/lib/kubelet/pods";

/// Configuration for the image volume node service.
#[derive(Debug, Clone)]
pub struct ImageDriverConfig {
    /// Root namespace for blobs, pulls, rootfs cache, references and aliases.
    pub root: PathBuf,
    /// Target paths must live under this directory; the next segment is the pod UID.
    pub pods_dir: String,
    /// Executable used for `copy` and `manifest-digest`.
    pub copy_tool: String,
    /// Executable used for `unpack`.
    pub unpack_tool: String,
    /// Deadline for every external command.  `None` runs without one.
    pub command_timeout: Option<Duration>,
    /// Identifier reported by `get_info`.
    pub node_id: String,
}

impl Default for ImageDriverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(ROOT_PATH),
            pods_dir: PODS_DIR.to_owned(),
            copy_tool: "skopeo".to_owned(),
            unpack_tool: "oci-image-tool".to_owned(),
            command_timeout: None,
            node_id: default_node_id(),
        }
    }
}

impl ImageDriverConfig {
    /// Defaults overridden by any `IMAGECSI_*` variables that are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(root) = lookup("IMAGECSI_ROOT") {
            cfg.root = PathBuf::from(root);
        }
        if let Some(pods_dir) = lookup("IMAGECSI_PODS_DIR") {
            cfg.pods_dir = pods_dir;
        }
        if let Some(tool) = lookup("IMAGECSI_COPY_TOOL") {
            cfg.copy_tool = tool;
        }
        if let Some(tool) = lookup("IMAGECSI_UNPACK_TOOL") {
            cfg.unpack_tool = tool;
        }
        if let Some(raw) = lookup("IMAGECSI_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => {
                    cfg.command_timeout = Some(Duration::from_secs(secs)).filter(|t| !t.is_zero());
                }
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid IMAGECSI_TIMEOUT_SECS"),
            }
        }
        if let Some(node_id) = lookup("IMAGECSI_NODE_ID") {
            cfg.node_id = node_id;
        }
        cfg
    }
}

fn default_node_id() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_owned())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let cfg = ImageDriverConfig::from_lookup(|_| None);
        assert_eq!(cfg.root, PathBuf::from("/var/run/imager2"));
        assert_eq!(cfg.pods_dir, "/var/lib/kubelet/pods");
        assert_eq!(cfg.copy_tool, "skopeo");
        assert_eq!(cfg.unpack_tool, "oci-image-tool");
        assert!(cfg.command_timeout.is_none());
        assert!(!cfg.node_id.is_empty());
    }

    #[test]
    fn env_overrides() {
        let vars = HashMap::from([
            ("IMAGECSI_ROOT", "/tmp/imgroot"),
            ("IMAGECSI_TIMEOUT_SECS", "90"),
            ("IMAGECSI_NODE_ID", "node-7"),
        ]);
        let cfg = ImageDriverConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.root, PathBuf::from("/tmp/imgroot"));
        assert_eq!(cfg.command_timeout, Some(Duration::from_secs(90)));
        assert_eq!(cfg.node_id, "node-7");
    }

    #[test]
    fn invalid_timeout_keeps_default() {
        let cfg = ImageDriverConfig::from_lookup(|k| {
            (k == "IMAGECSI_TIMEOUT_SECS").then(|| "ten".to_owned())
        });
        assert!(cfg.command_timeout.is_none());

        let cfg = ImageDriverConfig::from_lookup(|k| {
            (k == "IMAGECSI_TIMEOUT_SECS").then(|| " 30\n".to_owned())
        });
        assert_eq!(cfg.command_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let cfg = ImageDriverConfig::from_lookup(|k| {
            (k == "IMAGECSI_TIMEOUT_SECS").then(|| "0".to_owned())
        });
        assert!(cfg.command_timeout.is_none());
    }
}

//! Reverse-order undo log for the publish transaction.
//!
//! Every step of a publish that creates something registers the path it
//! created.  If the publish returns early (any `?`), dropping the [`Rollback`]
//! removes those paths newest-first.  A successful publish calls
//! [`Rollback::commit`], which disarms the log.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

#[derive(Debug)]
struct UndoStep {
    what: &'static str,
    path: PathBuf,
}

/// Guard that undoes registered creations unless committed.
#[derive(Debug, Default)]
pub struct Rollback {
    steps: Vec<UndoStep>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` for removal if the transaction does not commit.
    pub fn push(&mut self, what: &'static str, path: impl Into<PathBuf>) {
        self.steps.push(UndoStep {
            what,
            path: path.into(),
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep everything that was created.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Run all pending steps newest-first.  Failures are logged and skipped so
    /// that one stuck path does not strand the rest.
    pub fn unwind(&mut self) {
        while let Some(step) = self.steps.pop() {
            match remove_path_sync(&step.path) {
                Ok(()) => debug!(what = step.what, path = %step.path.display(), "rolled back"),
                Err(e) => warn!(
                    what = step.what,
                    path = %step.path.display(),
                    error = %e,
                    "rollback step failed"
                ),
            }
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        self.unwind();
    }
}

fn remove_path_sync(path: &Path) -> std::io::Result<()> {
    let removed = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match removed {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_removes_in_reverse_order() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rootfs");
        let marker = dir.join("marker");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(&marker, b"").unwrap();

        {
            let mut rb = Rollback::new();
            rb.push("rootfs", &dir);
            // Pushed last, removed first.
            rb.push("marker", &marker);
            assert_eq!(rb.len(), 2);
        }
        assert!(!dir.exists());
    }

    #[test]
    fn commit_keeps_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("keep");
        std::fs::write(&file, b"x").unwrap();

        let mut rb = Rollback::new();
        rb.push("file", &file);
        rb.commit();
        assert!(file.exists());
    }

    #[test]
    fn unwind_removes_symlink_not_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("shared");
        std::fs::create_dir(&target).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut rb = Rollback::new();
        rb.push("alias", &link);
        rb.push("already gone", tmp.path().join("missing"));
        rb.unwind();
        assert!(rb.is_empty());
        assert!(target.exists());
        assert!(std::fs::symlink_metadata(&link).is_err());
    }
}

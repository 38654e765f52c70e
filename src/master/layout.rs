//! Output directory layout: `<output_root>/<partition key>/<host>.html`

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("Partition key {0:?} is not a single directory name")]
    InvalidKey(String),

    #[error("Cannot resolve output root {path}: {source}")]
    Root { path: PathBuf, source: io::Error },

    #[error("Cannot create directory {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
}

/// Absolute form of `root`, without touching the filesystem
pub fn absolute_root(root: &Path) -> Result<PathBuf, LayoutError> {
    std::path::absolute(root).map_err(|source| LayoutError::Root {
        path: root.to_path_buf(),
        source,
    })
}

/// `root/key`, rejecting keys that would escape `root` or nest directories
pub fn partition_dir(root: &Path, key: &str) -> Result<PathBuf, LayoutError> {
    let mut components = Path::new(key).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == key => Ok(root.join(name)),
        _ => Err(LayoutError::InvalidKey(key.to_string())),
    }
}

/// Create `dir` and any missing parents; existing directories are fine
pub async fn ensure_dir(dir: &Path) -> Result<(), LayoutError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| LayoutError::Create {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partition_dir() {
        let root = Path::new("/srv/pages");
        assert_eq!(
            partition_dir(root, "United_States").unwrap(),
            PathBuf::from("/srv/pages/United_States")
        );
    }

    #[test]
    fn test_partition_dir_rejects_escapes() {
        let root = Path::new("/srv/pages");
        for key in ["", "..", ".", "a/b", "/etc", "RO/"] {
            assert!(
                matches!(partition_dir(root, key), Err(LayoutError::InvalidKey(_))),
                "accepted {:?}",
                key
            );
        }
    }

    #[test]
    fn test_absolute_root_resolves_relative() {
        let root = absolute_root(Path::new("pages")).unwrap();
        assert!(root.is_absolute());
        assert!(root.ends_with("pages"));
    }

    #[tokio::test]
    async fn test_ensure_dir_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("RO");

        ensure_dir(&dir).await.unwrap();
        std::fs::write(dir.join("google.com.html"), "kept").unwrap();
        ensure_dir(&dir).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.join("google.com.html")).unwrap(),
            "kept"
        );
    }
}

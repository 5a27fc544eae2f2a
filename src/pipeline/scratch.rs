//! Filesystem helpers for scratch directories.

use std::io;
use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

/// Recursively copies `src` into `dst`, creating `dst` if needed.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Moves `src` to `dst`, merging into an existing directory at `dst`.
pub fn move_path(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.is_dir() && src.is_dir() {
        move_children(src, dst)?;
        return std::fs::remove_dir_all(src);
    }

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) if src.is_dir() => {
            copy_dir_recursive(src, dst)?;
            std::fs::remove_dir_all(src)
        }
        Err(_) => {
            std::fs::copy(src, dst)?;
            std::fs::remove_file(src)
        }
    }
}

/// Moves every entry of `src` into the directory `dst`.
pub fn move_children(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        move_path(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

/// Removes a directory tree, logging instead of failing.
pub async fn remove_dir_logged(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_dir_recursive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("input-files");
        std::fs::create_dir_all(src.join("qvina/receptor")).unwrap();
        std::fs::write(src.join("qvina/config.txt"), "cpu = 1").unwrap();
        std::fs::write(src.join("qvina/receptor/rec.pdbqt"), "ATOM").unwrap();

        let dst = temp.path().join("run/input-files");
        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("qvina/config.txt")).unwrap(), "cpu = 1");
        assert!(dst.join("qvina/receptor/rec.pdbqt").exists());
    }

    #[test]
    fn test_move_children_merges() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a/output/qvina");
        let dst = temp.path().join("final/qvina/7");
        std::fs::create_dir_all(src.join("Z1/0")).unwrap();
        std::fs::write(src.join("Z1/0/stdout"), "run 0").unwrap();
        std::fs::create_dir_all(dst.join("Z1/1")).unwrap();
        std::fs::write(dst.join("Z1/1/stdout"), "run 1").unwrap();

        move_children(&src, &dst).unwrap();

        assert_eq!(std::fs::read_to_string(dst.join("Z1/0/stdout")).unwrap(), "run 0");
        assert_eq!(std::fs::read_to_string(dst.join("Z1/1/stdout")).unwrap(), "run 1");
        assert!(!src.join("Z1").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_quiet() {
        let temp = TempDir::new().unwrap();
        remove_dir_logged(&temp.path().join("absent")).await;
    }
}

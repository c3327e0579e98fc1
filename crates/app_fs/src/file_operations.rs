//! File operations: sidecar-aware moves and empty-folder cleanup

use crate::{FsError, Result};
use std::path::{Path, PathBuf};

/// Move a single file, creating the destination's parent directory.
///
/// Tries a rename first and falls back to copy + delete when source and
/// destination live on different file systems.
pub fn move_file(source: &Path, target: &Path) -> Result<()> {
    if !source.exists() {
        return Err(FsError::NotFound(source.to_path_buf()));
    }

    if target.exists() {
        return Err(FsError::AlreadyExists(target.to_path_buf()));
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match std::fs::rename(source, target) {
        Ok(()) => {
            tracing::info!("Moved: {} -> {}", source.display(), target.display());
        }
        Err(e) => {
            // Unix: EXDEV = 18, Windows: ERROR_NOT_SAME_DEVICE = 17
            let is_cross_device = match e.raw_os_error() {
                Some(18) => cfg!(unix),
                Some(17) => cfg!(windows),
                _ => false,
            };

            if !is_cross_device {
                return Err(e.into());
            }

            tracing::info!(
                "Cross-filesystem move, using copy+delete: {} -> {}",
                source.display(),
                target.display()
            );
            std::fs::copy(source, target)?;
            std::fs::remove_file(source)?;
        }
    }

    Ok(())
}

/// List the files in `dir` sharing the base name of `file_name`
/// (the image itself plus its sidecars), image first.
pub fn related_files(file_name: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let stem = file_name
        .file_stem()
        .ok_or_else(|| FsError::InvalidPath(format!("No file name: {}", file_name.display())))?
        .to_os_string();
    let own_name = file_name.file_name().map(|n| n.to_os_string());

    let mut related = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if path.file_stem().map(|s| s == stem.as_os_str()).unwrap_or(false) {
            related.push(path);
        }
    }

    // The image itself goes first so a failure leaves the sidecars in place
    related.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()) != own_name);
    Ok(related)
}

/// Move an image and every sidecar sharing its base name from
/// `source_dir` to `dest_dir`. Returns the new paths.
///
/// The image itself must move; a sidecar that fails is logged and skipped.
pub fn move_related_files(file_name: &Path, source_dir: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    let name = file_name
        .file_name()
        .ok_or_else(|| FsError::InvalidPath(format!("No file name: {}", file_name.display())))?;
    let image = source_dir.join(name);
    if !image.exists() {
        return Err(FsError::NotFound(image));
    }

    let mut moved = Vec::new();
    for source in related_files(file_name, source_dir)? {
        let target = match source.file_name() {
            Some(n) => dest_dir.join(n),
            None => continue,
        };

        match move_file(&source, &target) {
            Ok(()) => moved.push(target),
            Err(e) if source == image => return Err(e),
            Err(e) => tracing::warn!("Failed to move sidecar {}: {}", source.display(), e),
        }
    }

    Ok(moved)
}

/// Remove `dir` if it exists and is empty. Returns whether it was removed.
pub fn remove_dir_if_empty(dir: &Path) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }

    if std::fs::read_dir(dir)?.next().is_some() {
        return Ok(false);
    }

    std::fs::remove_dir(dir)?;
    tracing::info!("Removed empty directory: {}", dir.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_move_file_creates_parent() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("a.jpg");
        let to = temp.path().join("nested/dir/a.jpg");
        fs::write(&from, b"test").unwrap();

        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert!(to.exists());
    }

    #[test]
    fn test_move_file_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("a.jpg");
        let to = temp.path().join("b.jpg");
        fs::write(&from, b"1").unwrap();
        fs::write(&to, b"2").unwrap();

        assert!(matches!(move_file(&from, &to), Err(FsError::AlreadyExists(_))));
        assert!(from.exists());
    }

    #[test]
    fn test_move_related_files_takes_sidecars() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("b.jpg"), b"img").unwrap();
        fs::write(src.join("b.xmp"), b"meta").unwrap();
        fs::write(src.join("b.txt"), b"note").unwrap();
        fs::write(src.join("bb.jpg"), b"other").unwrap();

        let moved = move_related_files(Path::new("b.jpg"), &src, &dst).unwrap();

        assert_eq!(moved.len(), 3);
        assert_eq!(moved[0], dst.join("b.jpg"));
        assert!(dst.join("b.xmp").exists());
        assert!(dst.join("b.txt").exists());
        assert!(src.join("bb.jpg").exists());
        assert!(!src.join("b.jpg").exists());
    }

    #[test]
    fn test_move_related_files_missing_image() {
        let temp = TempDir::new().unwrap();
        let result = move_related_files(Path::new("nope.jpg"), temp.path(), &temp.path().join("d"));
        assert!(matches!(result, Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_remove_dir_if_empty() {
        let temp = TempDir::new().unwrap();
        let empty = temp.path().join("empty");
        let full = temp.path().join("full");
        fs::create_dir_all(&empty).unwrap();
        fs::create_dir_all(&full).unwrap();
        fs::write(full.join("x"), b"x").unwrap();

        assert!(remove_dir_if_empty(&empty).unwrap());
        assert!(!empty.exists());
        assert!(!remove_dir_if_empty(&full).unwrap());
        assert!(!remove_dir_if_empty(&temp.path().join("missing")).unwrap());
    }
}

//! Per-image metadata record

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Whether an image decodes to one frame or a frame sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Static,
    Animated,
}

/// Metadata persisted for each decoded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub path: PathBuf,
    pub file_size: u64,
    pub modified: SystemTime,
    pub width: u32,
    pub height: u32,
    pub kind: ImageKind,
}

impl ImageMetadata {
    /// Build a record from the file's current size and modification time
    pub fn from_file(path: &Path, width: u32, height: u32, kind: ImageKind) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file_size: meta.len(),
            modified: meta.modified()?,
            width,
            height,
            kind,
        })
    }

    /// True if the file on disk no longer matches this record
    pub fn is_stale(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() != self.file_size || meta.modified().ok() != Some(self.modified),
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_file_and_staleness() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.png");
        std::fs::write(&path, b"1234").unwrap();

        let meta = ImageMetadata::from_file(&path, 2, 3, ImageKind::Static).unwrap();
        assert_eq!(meta.file_size, 4);
        assert!(!meta.is_stale());

        std::fs::write(&path, b"123456").unwrap();
        assert!(meta.is_stale());

        std::fs::remove_file(&path).unwrap();
        assert!(meta.is_stale());
    }
}

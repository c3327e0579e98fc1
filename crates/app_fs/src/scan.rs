//! Image discovery: extension filter and recursive directory walking

use crate::natural::natural_cmp;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Extensions recognised as images (lowercase, without dot)
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "ico", "tiff", "tif",
];

/// Check if a path has a recognised image extension
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Check if `path` is one of `dirs` or lies beneath one of them
pub fn is_under_any(path: &Path, dirs: &[PathBuf]) -> bool {
    dirs.iter().any(|dir| path.starts_with(dir))
}

/// Lazy recursive walk over the image files below a root.
///
/// Within each directory, files come first in natural order, then
/// subdirectories (also in natural order). Excluded subtrees are pruned
/// without being read.
pub struct ImageWalker {
    inner: Box<dyn Iterator<Item = PathBuf> + Send>,
}

impl ImageWalker {
    pub fn new(root: &Path, excluded: &[PathBuf]) -> Self {
        let excluded = excluded.to_vec();

        let iter = WalkDir::new(root)
            .follow_links(false)
            .sort_by(files_first_natural)
            .into_iter()
            .filter_entry(move |entry| !(entry.file_type().is_dir() && is_under_any(entry.path(), &excluded)))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_image_file(entry.path()))
            .map(DirEntry::into_path);

        Self { inner: Box::new(iter) }
    }
}

impl Iterator for ImageWalker {
    type Item = PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

fn files_first_natural(a: &DirEntry, b: &DirEntry) -> Ordering {
    let a_dir = a.file_type().is_dir();
    let b_dir = b.file_type().is_dir();
    a_dir
        .cmp(&b_dir)
        .then_with(|| natural_cmp(&a.file_name().to_string_lossy(), &b.file_name().to_string_lossy()))
}

/// Collect every image below `root`, skipping `excluded` subtrees
pub fn walk_images(root: &Path, excluded: &[PathBuf]) -> Vec<PathBuf> {
    ImageWalker::new(root, excluded).collect()
}

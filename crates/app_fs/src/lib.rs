//! picsort File System Layer
//!
//! Provides the file-system primitives the core builds on:
//! - Natural ("img2" < "img10") ordering of names and paths
//! - Image-extension filtering and recursive directory walking
//! - Sidecar-aware file moves with empty-folder cleanup
//! - Recursive file watching

mod natural;
mod scan;
mod file_operations;
mod watcher;

pub use natural::{natural_cmp, natural_path_cmp, NaturalKey};
pub use scan::{is_image_file, is_under_any, walk_images, ImageWalker, IMAGE_EXTENSIONS};
pub use file_operations::{move_file, move_related_files, related_files, remove_dir_if_empty};
pub use watcher::{FileWatcher, FsEvent};

use std::path::PathBuf;
use thiserror::Error;

/// File system errors
#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

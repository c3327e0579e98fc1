//! picsort Metadata Persistence Layer
//!
//! One JSON record per image under the cache directory, named after the
//! image's file name. Reads run concurrently; writes are exclusive and atomic.

mod record;
mod store;

pub use record::{ImageKind, ImageMetadata};
pub use store::RecordStore;

use std::path::PathBuf;
use directories::ProjectDirs;
use thiserror::Error;

/// Database errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(PathBuf),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Get the default metadata cache directory
pub fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("org", "picsort", "picsort")
        .map(|dirs| dirs.cache_dir().join("metadata"))
        .unwrap_or_else(|| PathBuf::from("./cache"))
}

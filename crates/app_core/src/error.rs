//! Core error types

use std::path::PathBuf;
use thiserror::Error;

/// Main core error type
#[derive(Error, Debug)]
pub enum CoreError {
    // ===== Recoverable Errors (log, skip the operation) =====
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("File already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Image decode error: {0}")]
    ImageDecode(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Watcher error: {0}")]
    Watch(String),

    #[error("No destination folder for {path} in category {category}")]
    NoDestination { path: PathBuf, category: String },

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("No image selected")]
    NoCurrentImage,

    #[error("A file operation is already running for {0}")]
    FileTaskInProgress(PathBuf),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    // ===== Fatal Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization failed: {0}")]
    Init(String),
}

impl CoreError {
    /// Is this error recoverable?
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CoreError::Config(_) | CoreError::Init(_))
    }

    /// Is this a fatal error?
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Get a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            CoreError::FileNotFound(path) => format!("File not found: {}", path.display()),
            CoreError::UnsupportedFormat(ext) => format!("Unsupported format: {}", ext),
            CoreError::ImageDecode(msg) => format!("Cannot load image: {}", msg),
            CoreError::NoDestination { category, .. } => format!("Unknown category: {}", category),
            _ => self.to_string(),
        }
    }
}

impl From<app_fs::FsError> for CoreError {
    fn from(e: app_fs::FsError) -> Self {
        match e {
            app_fs::FsError::NotFound(p) => CoreError::FileNotFound(p),
            app_fs::FsError::AlreadyExists(p) => CoreError::AlreadyExists(p),
            app_fs::FsError::Io(e) => CoreError::Io(e),
            app_fs::FsError::Watch(e) => CoreError::Watch(e.to_string()),
            app_fs::FsError::InvalidPath(msg) => {
                CoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))
            }
        }
    }
}

impl From<app_db::DbError> for CoreError {
    fn from(e: app_db::DbError) -> Self {
        CoreError::Metadata(e.to_string())
    }
}

impl From<image::ImageError> for CoreError {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::Unsupported(u) => CoreError::UnsupportedFormat(u.to_string()),
            image::ImageError::IoError(e) => CoreError::Io(e),
            other => CoreError::ImageDecode(other.to_string()),
        }
    }
}

impl From<notify::Error> for CoreError {
    fn from(e: notify::Error) -> Self {
        CoreError::Watch(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_error_conversion() {
        let err: CoreError = app_fs::FsError::NotFound(PathBuf::from("/x.jpg")).into();
        assert!(matches!(err, CoreError::FileNotFound(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::Config("bad".into()).is_fatal());
        assert!(!CoreError::NothingToUndo.is_fatal());
        assert_eq!(
            CoreError::NoDestination { path: PathBuf::from("/a.jpg"), category: "Cats".into() }.user_message(),
            "Unknown category: Cats"
        );
    }
}

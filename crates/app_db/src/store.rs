//! File-per-image record store

use crate::{DbError, ImageMetadata, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

const RECORD_SUFFIX: &str = ".cache";

/// Durable metadata records, one file per image
pub struct RecordStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl RecordStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        tracing::info!("Metadata store at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            lock: RwLock::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for an image: `<dir>/<file name>.cache`
    pub fn record_path(&self, image: &Path) -> Option<PathBuf> {
        let name = image.file_name()?;
        let mut record = name.to_os_string();
        record.push(RECORD_SUFFIX);
        Some(self.dir.join(record))
    }

    /// Read the record for `image`.
    ///
    /// Returns `Ok(None)` when there is no record, or when the record belongs
    /// to a different image with the same file name.
    pub fn read(&self, image: &Path) -> Result<Option<ImageMetadata>> {
        let _guard = self.lock.read();
        self.read_unlocked(image)
    }

    fn read_unlocked(&self, image: &Path) -> Result<Option<ImageMetadata>> {
        let record = match self.record_path(image) {
            Some(r) => r,
            None => return Ok(None),
        };
        if !record.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&record)?;
        let meta: ImageMetadata =
            serde_json::from_slice(&bytes).map_err(|_| DbError::Corrupt(record.clone()))?;

        if meta.path != image {
            return Ok(None);
        }
        Ok(Some(meta))
    }

    /// Write a record. Returns false if an identical record was already stored.
    pub fn write(&self, meta: &ImageMetadata) -> Result<bool> {
        let record = self
            .record_path(&meta.path)
            .ok_or_else(|| DbError::Corrupt(meta.path.clone()))?;

        let _guard = self.lock.write();

        if let Ok(Some(existing)) = self.read_unlocked(&meta.path) {
            if &existing == meta {
                return Ok(false);
            }
        }

        let bytes = serde_json::to_vec(meta)?;
        let mut tmp_name = record.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        std::fs::write(&tmp, &bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &record) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!("Wrote metadata record {}", record.display());
        Ok(true)
    }

    /// Remove the record for `image`. Returns whether one existed.
    pub fn remove(&self, image: &Path) -> Result<bool> {
        let record = match self.record_path(image) {
            Some(r) => r,
            None => return Ok(false),
        };

        let _guard = self.lock.write();
        match std::fs::remove_file(&record) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

//! Asynchronous front end to the durable metadata records

use crate::scheduler::{Task, TaskHandle, TaskScheduler};
use crate::Result;
use app_db::{ImageMetadata, RecordStore};
use std::path::Path;
use std::sync::Arc;

pub const METADATA_TAG: &str = "metadata";

/// Per-image metadata persistence.
///
/// `save` is fire-and-forget through the scheduler; `load` blocks and treats
/// unreadable records as absent.
pub struct MetadataStore {
    records: Arc<RecordStore>,
    scheduler: Arc<TaskScheduler>,
}

impl MetadataStore {
    pub fn open(dir: &Path, scheduler: Arc<TaskScheduler>) -> Result<Self> {
        Ok(Self {
            records: Arc::new(RecordStore::open(dir)?),
            scheduler,
        })
    }

    pub fn dir(&self) -> &Path {
        self.records.dir()
    }

    /// Persist `meta` in the background. Returns `None` if the scheduler
    /// refused the task.
    pub fn save(&self, meta: ImageMetadata) -> Option<TaskHandle> {
        let records = Arc::clone(&self.records);
        let task = Task::new(move |token| {
            if token.is_cancelled() {
                return;
            }
            match records.write(&meta) {
                Ok(true) => tracing::debug!("Metadata saved for {}", meta.path.display()),
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to save metadata for {}: {}", meta.path.display(), e),
            }
        })
        .with_tag(METADATA_TAG);

        let handle = self.scheduler.submit(task);
        if handle.is_none() {
            tracing::debug!("Scheduler shutting down, metadata not saved");
        }
        handle
    }

    pub fn load(&self, path: &Path) -> Option<ImageMetadata> {
        match self.records.read(path) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Failed to load metadata for {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Err(e) = self.records.remove(path) {
            tracing::warn!("Failed to remove metadata for {}: {}", path.display(), e);
        }
    }
}

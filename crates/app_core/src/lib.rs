//! picsort Core
//!
//! This crate contains:
//! - Task scheduler with tag-based cancellation
//! - Decoded image cache with metadata persistence and filesystem watching
//! - Image list scanning and navigation
//! - Move/delete/undo file tasks
//! - Configuration and error types

pub mod cache;
pub mod cancel;
pub mod config;
pub mod data_service;
pub mod error;
pub mod events;
pub mod file_tasks;
pub mod image_loader;
pub mod list_manager;
pub mod metadata;
pub mod scheduler;

pub use cache::{CacheStats, ImageCache, DECODE_TAG, REFRESH_TAG, WATCH_TAG};
pub use cancel::CancelToken;
pub use config::{
    CacheConfig, FileTaskConfig, LibraryConfig, ResolvedConfig, ScanConfig, SchedulerConfig, SorterConfig,
};
pub use data_service::DataService;
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventBus, FileAction, SubscriptionId};
pub use file_tasks::{FileTaskHandler, UndoAction, UndoLog, FILE_TASK_TAG};
pub use image_loader::{decode_image, AnimationFrame, DecodedImage};
pub use list_manager::{BatchSizer, ImageListManager, SCAN_TAG};
pub use metadata::{MetadataStore, METADATA_TAG};
pub use scheduler::{Task, TaskHandle, TaskOutcome, TaskScheduler};

use std::path::PathBuf;
use std::sync::Arc;

/// Position in the list, for status display
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListStatus {
    pub index: Option<usize>,
    pub len: usize,
    pub path: Option<PathBuf>,
}

/// Owns every core component, wired together
pub struct Sorter {
    config: Arc<ResolvedConfig>,
    scheduler: Arc<TaskScheduler>,
    events: Arc<EventBus>,
    data: Arc<DataService>,
    cache: Arc<ImageCache>,
    list: ImageListManager,
    files: FileTaskHandler,
}

impl Sorter {
    pub fn new(config: ResolvedConfig) -> Result<Self> {
        let config = Arc::new(config);
        let scheduler = Arc::new(TaskScheduler::new(config.workers)?);
        let events = Arc::new(EventBus::new());
        let data = Arc::new(DataService::new());

        let cache = ImageCache::new(
            Arc::clone(&config),
            Arc::clone(&scheduler),
            Arc::clone(&data),
            Arc::clone(&events),
        )?;
        let list = ImageListManager::new(
            Arc::clone(&config),
            Arc::clone(&scheduler),
            Arc::clone(&data),
            Arc::clone(&events),
        );
        let files = FileTaskHandler::new(
            Arc::clone(&config),
            Arc::clone(&scheduler),
            Arc::clone(&data),
            Arc::clone(&events),
        );

        tracing::info!("Sorter ready with {} root(s)", config.roots.len());
        Ok(Self {
            config,
            scheduler,
            events,
            data,
            cache,
            list,
            files,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn data(&self) -> &Arc<DataService> {
        &self.data
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn list(&self) -> &ImageListManager {
        &self.list
    }

    pub fn files(&self) -> &FileTaskHandler {
        &self.files
    }

    /// Rescan every root
    pub fn refresh(&self) {
        self.list.refresh_all();
    }

    /// Request the current image. A cached image is published as
    /// [`CoreEvent::ImageReady`] right away; otherwise it is decoded in the
    /// background and published when done.
    pub fn show_current(&self) -> Option<Arc<DecodedImage>> {
        let path = self.data.current_path()?;
        let image = self.cache.retrieve(&path, true, true)?;
        self.events.publish(&CoreEvent::ImageReady {
            path,
            image: Arc::clone(&image),
        });
        Some(image)
    }

    pub fn status(&self) -> ListStatus {
        self.data.atomically(|data| ListStatus {
            index: data.current_index(),
            len: data.len(),
            path: data.current_path(),
        })
    }

    /// Stop the cache, then the scheduler. Does not block.
    pub fn shutdown(&self) {
        self.cache.shutdown();
        self.scheduler.shutdown();
    }

    /// Shut down and wait for the workers to exit
    pub fn join(&self) {
        self.shutdown();
        self.scheduler.join();
    }
}

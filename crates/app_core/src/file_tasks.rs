//! Move, delete and undo of images with their sidecar files
//!
//! The list entry is removed on the caller's thread so navigation moves on
//! at once; the filesystem work runs on the scheduler with the watcher
//! suspended and the path marked as an ongoing file task.

use crate::cancel::CancelToken;
use crate::config::{ResolvedConfig, DELETE_FOLDER_NAME};
use crate::data_service::DataService;
use crate::events::{CoreEvent, EventBus, FileAction};
use crate::scheduler::{Task, TaskHandle, TaskOutcome, TaskScheduler};
use crate::{CoreError, Result};
use app_fs::{move_related_files, remove_dir_if_empty};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tag of move, delete and undo tasks
pub const FILE_TASK_TAG: &str = "file_task";

/// A completed file operation that can be reversed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    Move {
        category: String,
        path: PathBuf,
        source_dir: PathBuf,
        dest_dir: PathBuf,
        original_index: Option<usize>,
    },
    Delete {
        path: PathBuf,
        source_dir: PathBuf,
        dest_dir: PathBuf,
        original_index: Option<usize>,
    },
}

impl UndoAction {
    /// Path of the image before the operation
    pub fn path(&self) -> &Path {
        match self {
            UndoAction::Move { path, .. } | UndoAction::Delete { path, .. } => path,
        }
    }

    pub fn source_dir(&self) -> &Path {
        match self {
            UndoAction::Move { source_dir, .. } | UndoAction::Delete { source_dir, .. } => source_dir,
        }
    }

    pub fn dest_dir(&self) -> &Path {
        match self {
            UndoAction::Move { dest_dir, .. } | UndoAction::Delete { dest_dir, .. } => dest_dir,
        }
    }

    pub fn original_index(&self) -> Option<usize> {
        match self {
            UndoAction::Move { original_index, .. } | UndoAction::Delete { original_index, .. } => *original_index,
        }
    }
}

/// LIFO stack of reversible actions
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Mutex<Vec<UndoAction>>,
}

impl UndoLog {
    pub fn push(&self, action: UndoAction) {
        self.entries.lock().push(action);
    }

    pub fn pop(&self) -> Option<UndoAction> {
        self.entries.lock().pop()
    }

    pub fn peek(&self) -> Option<UndoAction> {
        self.entries.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a queued file task does
struct FileJob {
    action: FileAction,
    path: PathBuf,
    source_dir: PathBuf,
    dest_dir: PathBuf,
    original_index: Option<usize>,
    /// Set for moves and deletes; the entry to push on success
    undo: Option<UndoAction>,
    /// Set for undo; the entry to push back on failure
    undone: Option<UndoAction>,
}

/// Shared state captured by file tasks
struct Context {
    config: Arc<ResolvedConfig>,
    data: Arc<DataService>,
    events: Arc<EventBus>,
    undo: Arc<UndoLog>,
}

pub struct FileTaskHandler {
    context: Arc<Context>,
    scheduler: Arc<TaskScheduler>,
}

impl FileTaskHandler {
    pub fn new(
        config: Arc<ResolvedConfig>,
        scheduler: Arc<TaskScheduler>,
        data: Arc<DataService>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            context: Arc::new(Context {
                config,
                data,
                events,
                undo: Arc::new(UndoLog::default()),
            }),
            scheduler,
        }
    }

    // ===== Category-level operations =====

    /// Move `path` into the destination folder configured for `category`
    pub fn move_image(&self, path: &Path, category: &str) -> Result<TaskHandle> {
        let dest = self
            .context
            .config
            .dest_for(path, category)
            .cloned()
            .ok_or_else(|| CoreError::NoDestination {
                path: path.to_path_buf(),
                category: category.to_string(),
            })?;
        let source = parent_of(path)?;
        self.schedule_move(path, source, dest, Some(category.to_string()))
    }

    /// Move `path` into its root's delete folder
    pub fn delete_image(&self, path: &Path) -> Result<TaskHandle> {
        let dest = self
            .context
            .config
            .delete_for(path)
            .cloned()
            .ok_or_else(|| CoreError::NoDestination {
                path: path.to_path_buf(),
                category: DELETE_FOLDER_NAME.to_string(),
            })?;
        let source = parent_of(path)?;
        self.schedule_move(path, source, dest, None)
    }

    pub fn move_current(&self, category: &str) -> Result<TaskHandle> {
        let path = self.current()?;
        self.move_image(&path, category)
    }

    pub fn delete_current(&self) -> Result<TaskHandle> {
        let path = self.current()?;
        self.delete_image(&path)
    }

    fn current(&self) -> Result<PathBuf> {
        self.context
            .data
            .current_path()
            .ok_or(CoreError::NoCurrentImage)
    }

    // ===== Directory-level operations =====

    /// Move the image named by `path` and its sidecars from `source_dir` to
    /// `dest_dir`
    pub fn move_between(&self, path: &Path, source_dir: &Path, dest_dir: &Path) -> Result<TaskHandle> {
        let category = dest_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.schedule_move(path, source_dir.to_path_buf(), dest_dir.to_path_buf(), Some(category))
    }

    /// Same as [`FileTaskHandler::move_between`] with a delete folder as target
    pub fn delete_into(&self, path: &Path, source_dir: &Path, delete_dir: &Path) -> Result<TaskHandle> {
        self.schedule_move(path, source_dir.to_path_buf(), delete_dir.to_path_buf(), None)
    }

    fn schedule_move(
        &self,
        path: &Path,
        source_dir: PathBuf,
        dest_dir: PathBuf,
        category: Option<String>,
    ) -> Result<TaskHandle> {
        if self.scheduler.is_shutting_down() {
            return Err(CoreError::ShuttingDown);
        }

        let path = source_dir.join(path.file_name().ok_or_else(|| CoreError::FileNotFound(path.to_path_buf()))?);
        let data = &self.context.data;
        let original_index = data.atomically(|d| {
            if !d.begin_file_task(&path) {
                return Err(CoreError::FileTaskInProgress(path.clone()));
            }
            Ok(d.remove(&path))
        })?;
        if original_index.is_some() {
            self.context.events.publish(&CoreEvent::ListSizeChanged { len: data.len() });
            self.context.events.publish(&CoreEvent::DisplayRefreshRequested {
                current: data.current_path(),
            });
        }

        let (action, undo) = match category {
            Some(category) => (
                FileAction::Move,
                UndoAction::Move {
                    category,
                    path: path.clone(),
                    source_dir: source_dir.clone(),
                    dest_dir: dest_dir.clone(),
                    original_index,
                },
            ),
            None => (
                FileAction::Delete,
                UndoAction::Delete {
                    path: path.clone(),
                    source_dir: source_dir.clone(),
                    dest_dir: dest_dir.clone(),
                    original_index,
                },
            ),
        };

        tracing::info!("{:?} {} -> {}", action, path.display(), dest_dir.display());
        self.submit(FileJob {
            action,
            path,
            source_dir,
            dest_dir,
            original_index,
            undo: Some(undo),
            undone: None,
        })
    }

    // ===== Undo =====

    /// Reverse the most recent move or delete
    pub fn undo(&self) -> Result<TaskHandle> {
        if self.scheduler.is_shutting_down() {
            return Err(CoreError::ShuttingDown);
        }
        let entry = self.context.undo.pop().ok_or(CoreError::NothingToUndo)?;

        let path = entry.path().to_path_buf();
        if !self.context.data.begin_file_task(&path) {
            self.context.undo.push(entry);
            return Err(CoreError::FileTaskInProgress(path));
        }
        tracing::info!("Undo: {} back to {}", path.display(), entry.source_dir().display());

        self.submit(FileJob {
            action: FileAction::Undo,
            source_dir: entry.dest_dir().to_path_buf(),
            dest_dir: entry.source_dir().to_path_buf(),
            original_index: entry.original_index(),
            path,
            undo: None,
            undone: Some(entry),
        })
    }

    pub fn undo_len(&self) -> usize {
        self.context.undo.len()
    }

    pub fn peek_undo(&self) -> Option<UndoAction> {
        self.context.undo.peek()
    }

    fn submit(&self, job: FileJob) -> Result<TaskHandle> {
        let job = Arc::new(Mutex::new(Some(job)));
        let started = Arc::new(AtomicBool::new(false));

        let work_job = Arc::clone(&job);
        let work_started = Arc::clone(&started);
        let work_context = Arc::clone(&self.context);

        let finish_job = Arc::clone(&job);
        let finish_context = Arc::clone(&self.context);

        let task = Task::new(move |token| {
            work_started.store(true, Ordering::Release);
            if let Some(job) = work_job.lock().take() {
                work_context.run(job, token);
            }
        })
        .with_tag(FILE_TASK_TAG)
        .on_finished(move |outcome| {
            if started.load(Ordering::Acquire) && outcome != TaskOutcome::Panicked {
                return;
            }
            // Never ran, or died midway: put the list back as it was
            if let Some(job) = finish_job.lock().take() {
                finish_context.abandon(job);
            }
        });

        match self.scheduler.submit(task) {
            Some(handle) => Ok(handle),
            None => {
                if let Some(job) = job.lock().take() {
                    self.context.abandon(job);
                }
                Err(CoreError::ShuttingDown)
            }
        }
    }
}

impl Context {
    fn run(&self, job: FileJob, token: &CancelToken) {
        let cache = self.data.cache();
        if let Some(cache) = &cache {
            cache.suspend_watcher();
        }

        let file_name = PathBuf::from(job.path.file_name().unwrap_or_default());
        let result = move_related_files(&file_name, &job.source_dir, &job.dest_dir);
        let success = result.is_ok();

        match result {
            Ok(moved) => {
                tracing::debug!("Moved {} file(s) to {}", moved.len(), job.dest_dir.display());
                self.cleanup_dir(&job.source_dir);
                if let Some(cache) = &cache {
                    cache.invalidate(&job.path);
                }

                if let Some(undo) = job.undo {
                    self.undo.push(undo);
                }
                if job.undone.is_some() {
                    self.restore(&job.path, job.original_index, true);
                }
            }
            Err(e) => {
                tracing::error!(
                    "{:?} of {} failed: {}",
                    job.action,
                    job.path.display(),
                    e
                );
                if let Some(undone) = job.undone {
                    self.undo.push(undone);
                } else if job.original_index.is_some() {
                    self.restore(&job.path, job.original_index, false);
                }
            }
        }

        if let Some(cache) = &cache {
            cache.resume_watcher();
        }

        let settle = self.config.settle;
        if settle > Duration::ZERO {
            token.sleep(settle);
        }
        self.data.end_file_task(&job.path);

        self.events.publish(&CoreEvent::FileTaskFinished {
            action: job.action,
            path: job.path,
            success,
        });
    }

    /// Undo the caller-side list change of a job that never ran
    fn abandon(&self, job: FileJob) {
        tracing::debug!("{:?} of {} abandoned", job.action, job.path.display());
        match job.undone {
            Some(undone) => self.undo.push(undone),
            None if job.original_index.is_some() => self.restore(&job.path, job.original_index, false),
            None => {}
        }
        self.data.end_file_task(&job.path);
    }

    /// Put `path` back into the list at `index`. Without an index (undo of
    /// an image that was not listed) it goes to its sorted position.
    fn restore(&self, path: &Path, index: Option<usize>, select: bool) {
        let restored = self.data.atomically(|d| {
            let at = match index {
                Some(i) => d.insert_at(i, path.to_path_buf()),
                None => d.insert_sorted(path.to_path_buf()),
            }?;
            if select {
                d.set_index(at);
            }
            Some(at)
        });

        if restored.is_some() {
            self.events.publish(&CoreEvent::ListSizeChanged { len: self.data.len() });
            self.events.publish(&CoreEvent::DisplayRefreshRequested {
                current: self.data.current_path(),
            });
        }
    }

    /// Remove `dir` if it is a managed folder left empty
    fn cleanup_dir(&self, dir: &Path) {
        if !self.config.is_managed_folder(dir) {
            return;
        }
        match remove_dir_if_empty(dir) {
            Ok(true) => tracing::debug!("Removed empty folder {}", dir.display()),
            Ok(false) => {}
            Err(e) => tracing::warn!("Could not remove {}: {}", dir.display(), e),
        }
    }
}

fn parent_of(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| CoreError::FileNotFound(path.to_path_buf()))
}

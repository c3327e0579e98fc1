//! Recursive file system watcher built on notify
//!
//! Raw notify events are translated into [`FsEvent`]s on a dispatch thread
//! and handed to a caller-supplied handler. Throttling and debouncing are
//! left to the handler.

use crate::Result;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// File system event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl FsEvent {
    /// Paths touched by this event
    pub fn paths(&self) -> Vec<&PathBuf> {
        match self {
            FsEvent::Created(p) | FsEvent::Modified(p) | FsEvent::Removed(p) => vec![p],
            FsEvent::Renamed { from, to } => vec![from, to],
        }
    }
}

/// Recursive watcher over a set of roots
pub struct FileWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    roots: Vec<PathBuf>,
}

impl FileWatcher {
    /// Start watching `roots` recursively, calling `handler` for every event
    pub fn start<F>(roots: &[PathBuf], handler: F) -> Result<Self>
    where
        F: Fn(FsEvent) + Send + 'static,
    {
        let (tx, rx) = unbounded::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            tracing::info!("Watching: {}", root.display());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let failed_flag = Arc::clone(&failed);

        let dispatch = std::thread::Builder::new()
            .name("fs-watcher".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    match rx.recv_timeout(DISPATCH_POLL) {
                        Ok(Ok(event)) => {
                            for fs_event in convert_event(event) {
                                handler(fs_event);
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("Watcher error: {:?}", e);
                            failed_flag.store(true, Ordering::Release);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Watcher dispatch thread exiting");
            })?;

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            dispatch: Mutex::new(Some(dispatch)),
            stop,
            failed,
            roots: roots.to_vec(),
        })
    }

    /// Roots this watcher was started on
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// False once the dispatch thread has exited or the backend reported an error
    pub fn is_alive(&self) -> bool {
        if self.failed.load(Ordering::Acquire) || self.stop.load(Ordering::Acquire) {
            return false;
        }
        self.dispatch
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Report the watcher as dead without stopping it. A supervisor polling
    /// [`FileWatcher::is_alive`] will replace it.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Stop watching and join the dispatch thread. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        drop(self.watcher.lock().take());

        if let Some(handle) = self.dispatch.lock().take() {
            // Stopped from inside the handler: the thread exits on its own
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("Watcher dispatch thread panicked");
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert a raw notify event into zero or more FsEvents
fn convert_event(event: Event) -> Vec<FsEvent> {
    let mut paths = event.paths.into_iter();

    match event.kind {
        EventKind::Create(_) => paths.map(FsEvent::Created).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match (paths.next(), paths.next()) {
            (Some(from), Some(to)) => vec![FsEvent::Renamed { from, to }],
            (Some(from), None) => vec![FsEvent::Removed(from)],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths.map(FsEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths.map(FsEvent::Created).collect(),
        EventKind::Modify(_) => paths.map(FsEvent::Modified).collect(),
        EventKind::Remove(_) => paths.map(FsEvent::Removed).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};
    use tempfile::TempDir;

    #[test]
    fn test_convert_rename_both() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/a/x.jpg"))
            .add_path(PathBuf::from("/a/y.jpg"));

        assert_eq!(
            convert_event(event),
            vec![FsEvent::Renamed {
                from: PathBuf::from("/a/x.jpg"),
                to: PathBuf::from("/a/y.jpg"),
            }]
        );
    }

    #[test]
    fn test_convert_basic_kinds() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/a.jpg"));
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/a.jpg"));
        let moved_out =
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From))).add_path(PathBuf::from("/a.jpg"));

        assert_eq!(convert_event(created), vec![FsEvent::Created(PathBuf::from("/a.jpg"))]);
        assert_eq!(convert_event(removed), vec![FsEvent::Removed(PathBuf::from("/a.jpg"))]);
        assert_eq!(convert_event(moved_out), vec![FsEvent::Removed(PathBuf::from("/a.jpg"))]);
        assert!(convert_event(Event::new(EventKind::Any)).is_empty());
    }

    #[test]
    fn test_watcher_reports_created_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let (tx, rx) = unbounded();

        let watcher = FileWatcher::start(&[root.clone()], move |event| {
            let _ = tx.send(event);
        })
        .unwrap();
        assert!(watcher.is_alive());

        let file = root.join("new.png");
        std::fs::write(&file, b"x").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while std::time::Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
                if event.paths().iter().any(|p| p.file_name() == file.file_name()) {
                    seen = true;
                    break;
                }
            }
        }
        assert!(seen);

        watcher.stop();
        assert!(!watcher.is_alive());
    }

    #[test]
    fn test_mark_failed() {
        let temp = TempDir::new().unwrap();
        let watcher = FileWatcher::start(&[temp.path().to_path_buf()], |_| {}).unwrap();
        assert!(watcher.is_alive());

        watcher.mark_failed();
        assert!(!watcher.is_alive());
        watcher.stop();
    }
}

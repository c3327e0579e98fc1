//! Filesystem watch handling for the image cache
//!
//! Events pass through a per-path throttle and the exclusion checks before
//! touching the list or the cache. A supervisory task restarts the watcher
//! when it dies.

use super::ImageCache;
use crate::events::CoreEvent;
use crate::scheduler::Task;
use app_fs::{is_image_file, is_under_any, FileWatcher, FsEvent};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Tag of the watcher health-check task
pub const WATCH_TAG: &str = "watchdog_monitor";

const THROTTLE_PRUNE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum WatchKind {
    Created,
    Modified,
    Deleted,
}

impl ImageCache {
    // ===== Event handling =====

    /// Entry point for watcher events
    pub fn handle_fs_event(&self, event: FsEvent) {
        match event {
            FsEvent::Created(path) => self.on_created(&path),
            FsEvent::Modified(path) => self.on_modified(&path),
            FsEvent::Removed(path) => self.on_deleted(&path),
            FsEvent::Renamed { from, to } => {
                self.on_deleted(&from);
                self.on_created(&to);
            }
        }
    }

    /// Drop same-path, same-kind events inside the throttle window
    fn throttled(&self, path: &Path, kind: WatchKind) -> bool {
        let now = Instant::now();
        let window = self.config.throttle;

        if self.throttle.len() > THROTTLE_PRUNE_LEN {
            self.throttle.retain(|_, last| now.duration_since(*last) < window);
        }

        let mut throttled = false;
        self.throttle
            .entry((path.to_path_buf(), kind))
            .and_modify(|last| {
                if now.duration_since(*last) < window {
                    throttled = true;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);

        if throttled {
            tracing::debug!("Throttling {:?} event for {}", kind, path.display());
        }
        throttled
    }

    /// Common filters for every event kind
    fn should_handle(&self, path: &Path, kind: WatchKind) -> bool {
        if self.throttled(path, kind) {
            return false;
        }
        if self.is_shutting_down() {
            tracing::debug!("Shutdown initiated, ignoring {:?} event for {}", kind, path.display());
            return false;
        }
        if self.data.in_file_task(path) {
            tracing::debug!("{} is part of a file task, ignoring {:?} event", path.display(), kind);
            return false;
        }
        if self.is_active(path) {
            tracing::debug!("{} is already loading, ignoring {:?} event", path.display(), kind);
            return false;
        }
        if is_under_any(path, &self.excluded) {
            return false;
        }
        true
    }

    fn on_created(&self, path: &Path) {
        if !self.should_handle(path, WatchKind::Created) {
            return;
        }
        if path.is_dir() || !is_image_file(path) {
            return;
        }

        tracing::debug!("Created: {}, adding to image list", path.display());
        if self.data.insert_sorted(path.to_path_buf()).is_some() {
            self.events.publish(&CoreEvent::ListSizeChanged { len: self.data.len() });
        }
        self.refresh_if_needed(path);
    }

    fn on_modified(&self, path: &Path) {
        if !self.should_handle(path, WatchKind::Modified) {
            return;
        }
        if path.is_dir() || !is_image_file(path) {
            return;
        }
        self.refresh_if_needed(path);
    }

    fn on_deleted(&self, path: &Path) {
        if !self.should_handle(path, WatchKind::Deleted) {
            return;
        }
        if !self.data.contains(path) {
            return;
        }

        tracing::debug!("Deleted: {}, removing from image list", path.display());
        self.data.remove(path);
        self.invalidate(path);
        self.store.remove(path);
        self.events.publish(&CoreEvent::ListSizeChanged { len: self.data.len() });
        self.events.publish(&CoreEvent::DisplayRefreshRequested {
            current: self.data.current_path(),
        });
    }

    /// Schedule a debounced refresh unless the recorded mtime still matches
    fn refresh_if_needed(&self, path: &Path) {
        let current = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Cannot stat {}: {}", path.display(), e);
                return;
            }
        };

        match self.metadata(path) {
            Some(meta) if meta.modified == current => {
                tracing::debug!("Modification time unchanged for {}", path.display());
            }
            _ => self.debounced_refresh(path),
        }
    }

    // ===== Watcher lifecycle =====

    /// Roots to watch: every configured root that is not itself a managed folder
    fn watch_roots(&self) -> Vec<PathBuf> {
        self.config
            .roots
            .iter()
            .filter(|root| !is_under_any(root, &self.excluded) && root.is_dir())
            .cloned()
            .collect()
    }

    /// Start the watcher and its health-check task
    pub fn start_watching(&self) {
        if self.is_shutting_down() {
            tracing::debug!("Shutdown initiated, not starting watcher");
            return;
        }

        self.restart_watcher();

        if self.scheduler.tagged_count(WATCH_TAG) == 0 {
            self.spawn_monitor();
        }
    }

    /// Stop the health-check task, then the watcher
    pub fn stop_watching(&self) {
        self.scheduler.cancel_and_wait(WATCH_TAG);
        if let Some(watcher) = self.watcher.lock().take() {
            tracing::debug!("Stopping watcher");
            watcher.stop();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().as_ref().map_or(false, FileWatcher::is_alive)
    }

    fn restart_watcher(&self) {
        let mut slot = self.watcher.lock();
        if let Some(old) = slot.take() {
            old.stop();
        }

        let roots = self.watch_roots();
        if roots.is_empty() {
            tracing::warn!("No directories to watch");
            return;
        }

        let weak = self.this.clone();
        match FileWatcher::start(&roots, move |event| {
            if let Some(cache) = weak.upgrade() {
                cache.handle_fs_event(event);
            }
        }) {
            Ok(watcher) => {
                tracing::debug!("Watcher started, excluding {:?}", self.excluded);
                *slot = Some(watcher);
            }
            Err(e) => tracing::error!("Failed to start watcher: {}", e),
        }
    }

    fn spawn_monitor(&self) {
        let weak = self.this.clone();
        let interval = self.config.health_check;

        let task = Task::new(move |token| {
            while token.sleep(interval) {
                let Some(cache) = weak.upgrade() else { break };
                if cache.is_shutting_down() {
                    break;
                }
                cache.check_watcher();
            }
            tracing::debug!("Watcher monitor exiting");
        })
        .with_tag(WATCH_TAG);

        if self.scheduler.submit(task).is_none() {
            tracing::debug!("Watcher monitor not scheduled");
        }
    }

    fn check_watcher(&self) {
        // A suspend/resume in progress owns the watcher
        let Some(suspended) = self.suspended.try_lock() else { return };
        if *suspended > 0 {
            return;
        }

        if !self.is_watching() {
            tracing::warn!("Watcher is not alive, restarting");
            self.restart_watcher();
        }
    }

    /// Stop watching until the matching [`ImageCache::resume_watcher`].
    /// Nested suspensions keep the watcher down until the last resume.
    pub fn suspend_watcher(&self) {
        let mut suspended = self.suspended.lock();
        *suspended += 1;
        if *suspended == 1 && self.config.watch {
            self.stop_watching();
        }
    }

    pub fn resume_watcher(&self) {
        let mut suspended = self.suspended.lock();
        if *suspended == 0 {
            return;
        }
        *suspended -= 1;
        if *suspended == 0 && self.config.watch && !self.is_shutting_down() {
            self.start_watching();
        }
    }

    pub fn is_watcher_suspended(&self) -> bool {
        *self.suspended.lock() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use crate::events::CoreEvent;
    use crate::image_loader::test_support::write_png;
    use app_fs::FsEvent;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_created_event_inserts_sorted_and_loads() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let a = fx.root.join("img2.png");
        let b = fx.root.join("img10.png");
        write_png(&a, 2, 2);
        write_png(&b, 2, 2);
        fx.data.extend(vec![b.clone()]);

        cache.handle_fs_event(FsEvent::Created(a.clone()));
        assert_eq!(fx.data.images(), vec![a.clone(), b]);

        fx.idle();
        assert!(cache.is_cached(&a));
    }

    #[test]
    fn test_events_in_managed_folders_are_ignored() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let sorted = fx.root.join("Cat1/x.png");
        let deleted = fx.root.join("deleted/y.png");
        write_png(&sorted, 2, 2);
        write_png(&deleted, 2, 2);

        cache.handle_fs_event(FsEvent::Created(sorted.clone()));
        cache.handle_fs_event(FsEvent::Modified(deleted.clone()));
        cache.handle_fs_event(FsEvent::Removed(sorted.clone()));
        fx.idle();

        assert!(fx.data.is_empty());
        assert!(!cache.is_cached(&sorted));
        assert!(!cache.is_cached(&deleted));
        assert_eq!(cache.stats().decodes, 0);
    }

    #[test]
    fn test_deleted_event_removes_and_requests_display() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let a = fx.root.join("a.png");
        let b = fx.root.join("b.png");
        fx.data.extend(vec![a.clone(), b.clone()]);

        let requested = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&requested);
        fx.events.subscribe(move |event| {
            if let CoreEvent::DisplayRefreshRequested { current } = event {
                r.lock().push(current.clone());
            }
        });

        cache.handle_fs_event(FsEvent::Removed(a.clone()));
        assert_eq!(fx.data.images(), vec![b.clone()]);
        assert_eq!(*requested.lock(), vec![Some(b)]);

        // Unknown path: nothing happens
        cache.handle_fs_event(FsEvent::Removed(fx.root.join("zzz.png")));
        assert_eq!(requested.lock().len(), 1);
    }

    #[test]
    fn test_ongoing_file_task_is_ignored() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let a = fx.root.join("a.png");
        fx.data.extend(vec![a.clone()]);
        fx.data.begin_file_task(&a);

        cache.handle_fs_event(FsEvent::Removed(a.clone()));
        assert!(fx.data.contains(&a));
    }

    #[test]
    fn test_throttle_drops_repeat_events() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let a = fx.root.join("a.png");
        let b = fx.root.join("b.png");
        fx.data.extend(vec![a.clone(), b.clone()]);

        cache.handle_fs_event(FsEvent::Removed(a.clone()));
        fx.data.insert_sorted(a.clone());
        // Same path and kind inside the window
        cache.handle_fs_event(FsEvent::Removed(a.clone()));
        assert!(fx.data.contains(&a));

        std::thread::sleep(fx.config.throttle + Duration::from_millis(50));
        cache.handle_fs_event(FsEvent::Removed(a.clone()));
        assert!(!fx.data.contains(&a));
    }

    #[test]
    fn test_unchanged_mtime_skips_refresh() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let a = fx.root.join("a.png");
        write_png(&a, 2, 2);
        fx.data.extend(vec![a.clone()]);

        cache.retrieve(&a, true, false).unwrap();
        fx.idle();
        cache.handle_fs_event(FsEvent::Modified(a.clone()));
        fx.idle();
        assert_eq!(cache.stats().decodes, 1);
    }

    #[test]
    fn test_rename_is_delete_plus_create() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let old = fx.root.join("old.png");
        let new = fx.root.join("new.png");
        write_png(&new, 2, 2);
        fx.data.extend(vec![old.clone()]);

        cache.handle_fs_event(FsEvent::Renamed {
            from: old.clone(),
            to: new.clone(),
        });
        assert_eq!(fx.data.images(), vec![new]);
        fx.idle();
    }

    #[test]
    fn test_live_watcher_picks_up_new_file() {
        let fx = Fixture::with(10, |c| {
            c.cache.watch = true;
            c.cache.debounce_ms = 300;
        });
        let cache = fx.cache();
        assert!(wait_for(|| cache.is_watching()));

        let path: PathBuf = fx.root.join("fresh.png");
        write_png(&path, 3, 3);

        assert!(wait_for(|| fx.data.contains(&path)));
        assert!(wait_for(|| cache.is_cached(&path)));

        cache.shutdown();
        assert!(!cache.is_watching());
        assert_eq!(fx.scheduler.tagged_count(super::WATCH_TAG), 0);
    }

    #[test]
    fn test_monitor_restarts_dead_watcher() {
        let fx = Fixture::with(10, |c| c.cache.watch = true);
        let cache = fx.cache();
        assert!(wait_for(|| cache.is_watching()));

        if let Some(watcher) = cache.watcher.lock().as_ref() {
            watcher.mark_failed();
        }

        assert!(wait_for(|| cache.is_watching()));
        assert_eq!(fx.scheduler.tagged_count(super::WATCH_TAG), 1);

        // The replacement still delivers events
        let path = fx.root.join("after_restart.png");
        write_png(&path, 2, 2);
        assert!(wait_for(|| fx.data.contains(&path)));

        cache.shutdown();
    }

    #[test]
    fn test_suspend_is_reference_counted() {
        let fx = Fixture::with(10, |c| c.cache.watch = true);
        let cache = fx.cache();
        assert!(wait_for(|| cache.is_watching()));

        cache.suspend_watcher();
        cache.suspend_watcher();
        assert!(!cache.is_watching());

        cache.resume_watcher();
        assert!(cache.is_watcher_suspended());
        assert!(!cache.is_watching());

        cache.resume_watcher();
        assert!(wait_for(|| cache.is_watching()));
        assert_eq!(fx.scheduler.tagged_count(super::WATCH_TAG), 1);

        cache.shutdown();
    }
}

//! In-memory LRU cache of decoded images
//!
//! - At most one decode in flight per path (the active request set)
//! - Strict LRU eviction by entry count
//! - Metadata LRU in front of the durable [`MetadataStore`]
//! - Filesystem-driven invalidation (see `watch`)

mod watch;

use crate::cancel::CancelToken;
use crate::config::ResolvedConfig;
use crate::data_service::DataService;
use crate::events::{CoreEvent, EventBus};
use crate::image_loader::{decode_image, DecodedImage};
use crate::metadata::MetadataStore;
use crate::scheduler::{Task, TaskHandle, TaskOutcome, TaskScheduler};
use crate::Result;
use app_db::ImageMetadata;
use app_fs::FileWatcher;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

pub use watch::WATCH_TAG;

pub const DECODE_TAG: &str = "decode";
pub const REFRESH_TAG: &str = "refresh";

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub active_requests: usize,
    pub decodes: u64,
    pub evictions: u64,
}

struct CacheState {
    images: LruCache<PathBuf, Arc<DecodedImage>>,
    /// Paths being decoded, with the number of outstanding requests
    active: HashMap<PathBuf, usize>,
}

impl CacheState {
    fn release(&mut self, path: &Path) {
        if let Some(count) = self.active.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(path);
            }
        }
    }
}

/// Decoded image cache with watcher-driven invalidation
pub struct ImageCache {
    this: Weak<ImageCache>,
    config: Arc<ResolvedConfig>,
    scheduler: Arc<TaskScheduler>,
    data: Arc<DataService>,
    events: Arc<EventBus>,
    store: MetadataStore,

    state: Mutex<CacheState>,
    metadata: Mutex<LruCache<PathBuf, ImageMetadata>>,
    /// path -> (generation, pending refresh)
    debounce: Mutex<HashMap<PathBuf, (u64, TaskHandle)>>,
    debounce_generation: AtomicU64,
    throttle: DashMap<(PathBuf, watch::WatchKind), Instant>,

    watcher: Mutex<Option<FileWatcher>>,
    suspended: Mutex<usize>,
    excluded: Vec<PathBuf>,

    shutdown: CancelToken,
    decodes: AtomicU64,
    evictions: AtomicU64,
}

impl ImageCache {
    /// Build the cache, register it with `data` and start watching the roots
    /// when enabled.
    pub fn new(
        config: Arc<ResolvedConfig>,
        scheduler: Arc<TaskScheduler>,
        data: Arc<DataService>,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        let store = MetadataStore::open(&config.cache_dir, Arc::clone(&scheduler))?;
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        let excluded = config.excluded_folders();
        let shutdown = scheduler.shutdown_token().child();

        let cache = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config: Arc::clone(&config),
            scheduler,
            data: Arc::clone(&data),
            events,
            store,
            state: Mutex::new(CacheState {
                images: LruCache::new(capacity),
                active: HashMap::new(),
            }),
            metadata: Mutex::new(LruCache::new(capacity)),
            debounce: Mutex::new(HashMap::new()),
            debounce_generation: AtomicU64::new(0),
            throttle: DashMap::new(),
            watcher: Mutex::new(None),
            suspended: Mutex::new(0),
            excluded,
            shutdown,
            decodes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });

        data.set_cache(&cache);

        if config.watch {
            cache.start_watching();
        }

        tracing::info!(
            "Image cache ready (capacity {}, metadata in {})",
            config.max_entries,
            cache.store.dir().display()
        );
        Ok(cache)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Look up `path`, decoding it if needed.
    ///
    /// A hit is returned immediately and becomes most recently used. On a
    /// miss with `background`, a decode is scheduled and `None` returned; the
    /// result arrives as [`CoreEvent::ImageReady`]. Without `background` the
    /// decode runs on the calling thread. With `active_request`, a path that
    /// is already being decoded is not decoded again.
    pub fn retrieve(&self, path: &Path, active_request: bool, background: bool) -> Option<Arc<DecodedImage>> {
        if self.is_shutting_down() {
            tracing::debug!("Shutdown initiated, not retrieving {}", path.display());
            return None;
        }

        {
            let mut state = self.state.lock();
            if let Some(image) = state.images.get(path) {
                return Some(Arc::clone(image));
            }

            if active_request && state.active.contains_key(path) {
                tracing::debug!("Already loading {}, skipping duplicate request", path.display());
                return None;
            }

            *state.active.entry(path.to_path_buf()).or_insert(0) += 1;
        }

        if !background {
            return self.load_and_cache(path);
        }

        let started = Arc::new(AtomicBool::new(false));
        let started_in_task = Arc::clone(&started);
        let weak = self.this.clone();
        let weak_on_finish = self.this.clone();
        let task_path = path.to_path_buf();
        let finish_path = path.to_path_buf();

        let task = Task::new(move |_| {
            started_in_task.store(true, Ordering::Release);
            if let Some(cache) = weak.upgrade() {
                cache.load_and_cache(&task_path);
            }
        })
        .with_tag(DECODE_TAG)
        .on_finished(move |outcome| {
            let never_ran = !started.load(Ordering::Acquire);
            if never_ran || outcome == TaskOutcome::Panicked {
                if let Some(cache) = weak_on_finish.upgrade() {
                    cache.state.lock().release(&finish_path);
                }
            }
        });

        if self.scheduler.submit(task).is_none() {
            tracing::debug!("Decode task for {} not scheduled", path.display());
            self.state.lock().release(path);
        }
        None
    }

    /// Decode `path` (already registered as active) and cache the result.
    fn load_and_cache(&self, path: &Path) -> Option<Arc<DecodedImage>> {
        if self.is_shutting_down() {
            self.state.lock().release(path);
            return None;
        }

        match decode_image(path) {
            Ok(image) => {
                let image = Arc::new(image);
                let metadata = image.metadata().ok();

                {
                    let mut state = self.state.lock();
                    if let Some((evicted, _)) = state.images.push(path.to_path_buf(), Arc::clone(&image)) {
                        if evicted != path {
                            self.evictions.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("Cache full, evicted {}", evicted.display());
                        }
                    }
                    state.release(path);
                }
                self.decodes.fetch_add(1, Ordering::Relaxed);

                if let Some(meta) = metadata {
                    self.metadata.lock().put(path.to_path_buf(), meta.clone());
                    self.store.save(meta);
                }

                tracing::debug!("Loaded {}", path.display());
                self.events.publish(&CoreEvent::ImageReady {
                    path: path.to_path_buf(),
                    image: Arc::clone(&image),
                });
                Some(image)
            }
            Err(e) => {
                tracing::error!("Error loading image {}: {}", path.display(), e);

                if self.data.remove(path).is_some() {
                    self.events.publish(&CoreEvent::ListSizeChanged { len: self.data.len() });
                }
                self.state.lock().release(path);
                self.metadata.lock().pop(path);

                self.events.publish(&CoreEvent::ImageUnavailable {
                    path: path.to_path_buf(),
                });
                None
            }
        }
    }

    /// Evict `path` and decode it again on the calling thread
    pub fn refresh(&self, path: &Path) -> Option<Arc<DecodedImage>> {
        if self.is_shutting_down() {
            tracing::debug!("Shutdown initiated, not refreshing {}", path.display());
            return None;
        }
        tracing::debug!("Refreshing cache for {}", path.display());
        self.state.lock().images.pop(path);
        self.retrieve(path, true, false)
    }

    /// Refresh `path` after the debounce interval. A newer request for the
    /// same path replaces a pending one.
    pub fn debounced_refresh(&self, path: &Path) {
        if self.is_shutting_down() {
            return;
        }

        let generation = self.debounce_generation.fetch_add(1, Ordering::Relaxed);
        let delay = self.config.debounce;
        let weak = self.this.clone();
        let key = path.to_path_buf();

        let mut pending = self.debounce.lock();
        if let Some((_, previous)) = pending.remove(path) {
            previous.cancel();
        }

        let task = Task::new(move |token| {
            if !token.sleep(delay) {
                return;
            }
            let Some(cache) = weak.upgrade() else { return };
            {
                let mut pending = cache.debounce.lock();
                if pending.get(&key).map_or(false, |(g, _)| *g == generation) {
                    pending.remove(&key);
                }
            }
            cache.refresh(&key);
        })
        .with_tag(REFRESH_TAG);

        if let Some(handle) = self.scheduler.submit(task) {
            pending.insert(path.to_path_buf(), (generation, handle));
        }
    }

    pub fn is_cached(&self, path: &Path) -> bool {
        self.state.lock().images.contains(path)
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.state.lock().active.contains_key(path)
    }

    /// Drop the decoded image and cached metadata for `path`
    pub fn invalidate(&self, path: &Path) {
        self.state.lock().images.pop(path);
        self.metadata.lock().pop(path);
        if let Some((_, pending)) = self.debounce.lock().remove(path) {
            pending.cancel();
        }
    }

    pub fn clear(&self) {
        self.state.lock().images.clear();
        self.metadata.lock().clear();
    }

    /// Metadata for `path` from memory, falling back to the durable store
    pub fn metadata(&self, path: &Path) -> Option<ImageMetadata> {
        if let Some(meta) = self.metadata.lock().get(path) {
            return Some(meta.clone());
        }
        let meta = self.store.load(path)?;
        self.metadata.lock().put(path.to_path_buf(), meta.clone());
        Some(meta)
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.images.len(),
            active_requests: state.active.len(),
            decodes: self.decodes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Stop watching and turn every entry point into a no-op
    pub fn shutdown(&self) {
        tracing::debug!("Image cache shutting down");
        self.shutdown.cancel();
        self.stop_watching();

        for (_, (_, pending)) in self.debounce.lock().drain() {
            pending.cancel();
        }
        self.state.lock().active.clear();
        tracing::debug!("Image cache shutdown complete");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Fixture;
    use super::*;
    use crate::image_loader::test_support::{write_gif, write_png};
    use app_db::ImageKind;
    use std::time::Duration;

    #[test]
    fn test_sync_retrieve_and_hit() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let path = fx.root.join("a.png");
        write_png(&path, 4, 4);

        let image = cache.retrieve(&path, true, false).unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert!(!cache.is_active(&path));
        assert!(cache.is_cached(&path));

        let again = cache.retrieve(&path, true, false).unwrap();
        assert!(Arc::ptr_eq(&image, &again));
        assert_eq!(cache.stats().decodes, 1);
    }

    #[test]
    fn test_failed_decode_removes_from_list() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let good = fx.root.join("a.png");
        let bad = fx.root.join("b.png");
        write_png(&good, 2, 2);
        std::fs::write(&bad, b"garbage").unwrap();
        fx.data.extend(vec![good.clone(), bad.clone()]);

        let unavailable = Arc::new(Mutex::new(Vec::new()));
        let u = Arc::clone(&unavailable);
        fx.events.subscribe(move |event| {
            if let CoreEvent::ImageUnavailable { path } = event {
                u.lock().push(path.clone());
            }
        });

        assert!(cache.retrieve(&bad, true, false).is_none());
        assert!(!cache.is_active(&bad));
        assert_eq!(fx.data.images(), vec![good]);
        assert_eq!(*unavailable.lock(), vec![bad]);
    }

    #[test]
    fn test_duplicate_background_requests_decode_once() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let path = fx.root.join("a.png");
        write_png(&path, 8, 8);

        // Occupy every worker so the decode stays queued
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        for _ in 0..fx.scheduler.worker_count() {
            let rx = release_rx.clone();
            fx.scheduler.submit(Task::new(move |_| {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }));
        }

        assert!(cache.retrieve(&path, true, true).is_none());
        assert!(cache.retrieve(&path, true, true).is_none());
        assert_eq!(fx.scheduler.tagged_count(DECODE_TAG), 1);
        assert!(cache.is_active(&path));

        drop(release_tx);
        fx.idle();
        assert_eq!(cache.stats().decodes, 1);
        assert!(cache.is_cached(&path));
        assert!(!cache.is_active(&path));
    }

    #[test]
    fn test_background_retrieve_publishes_ready() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let path = fx.root.join("anim.gif");
        write_gif(&path, 2);

        let ready = Arc::new(Mutex::new(None));
        let r = Arc::clone(&ready);
        fx.events.subscribe(move |event| {
            if let CoreEvent::ImageReady { path, image } = event {
                *r.lock() = Some((path.clone(), image.kind()));
            }
        });

        assert!(cache.retrieve(&path, true, true).is_none());
        fx.idle();
        assert_eq!(*ready.lock(), Some((path.clone(), ImageKind::Animated)));
        assert_eq!(cache.metadata(&path).map(|m| m.kind), Some(ImageKind::Animated));
    }

    #[test]
    fn test_lru_eviction() {
        let fx = Fixture::new(3);
        let cache = fx.cache();
        let paths: Vec<PathBuf> = (0..4).map(|i| fx.root.join(format!("{}.png", i))).collect();
        for p in &paths {
            write_png(p, 2, 2);
        }

        for p in &paths[..3] {
            cache.retrieve(p, true, false).unwrap();
        }
        // Touch 0 so 1 becomes least recently used
        cache.retrieve(&paths[0], true, false).unwrap();
        cache.retrieve(&paths[3], true, false).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 1);
        assert!(!cache.is_cached(&paths[1]));
        assert!(cache.is_cached(&paths[0]));
        assert!(cache.is_cached(&paths[3]));
    }

    #[test]
    fn test_metadata_persisted_and_reloaded() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let path = fx.root.join("a.png");
        write_png(&path, 6, 5);

        cache.retrieve(&path, true, false).unwrap();
        fx.idle();
        cache.clear();

        let meta = cache.metadata(&path).unwrap();
        assert_eq!((meta.width, meta.height), (6, 5));
        assert!(fx.config.cache_dir.join("a.png.cache").exists());
    }

    #[test]
    fn test_debounced_refresh_coalesces() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let path = fx.root.join("a.png");
        write_png(&path, 2, 2);

        for _ in 0..5 {
            cache.debounced_refresh(&path);
        }
        fx.idle();

        assert_eq!(cache.stats().decodes, 1);
        assert!(cache.is_cached(&path));
        assert!(cache.debounce.lock().is_empty());
    }

    #[test]
    fn test_shutdown_makes_retrieve_noop() {
        let fx = Fixture::new(10);
        let cache = fx.cache();
        let path = fx.root.join("a.png");
        write_png(&path, 2, 2);

        cache.shutdown();
        assert!(cache.is_shutting_down());
        assert!(cache.retrieve(&path, true, false).is_none());
        assert_eq!(cache.stats().active_requests, 0);
    }
}

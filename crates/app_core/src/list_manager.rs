//! Ordered image list: scanning, sorted insertion and navigation
//!
//! Scans run as one scheduler task per root. Each task streams its results
//! into [`DataService`] in adaptively sized batches; a later root holds its
//! results back until every earlier root has finished so the overall order
//! stays root by root.

use crate::cancel::CancelToken;
use crate::config::{ResolvedConfig, ScanConfig};
use crate::data_service::DataService;
use crate::events::{CoreEvent, EventBus};
use crate::scheduler::{Task, TaskScheduler};
use app_fs::ImageWalker;
use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tag of directory scan tasks
pub const SCAN_TAG: &str = "refresh_image_list";

const TURN_POLL: Duration = Duration::from_millis(100);

/// Batch size that doubles while batches finish under the target time and
/// halves when they overrun it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizer {
    size: usize,
    min: usize,
    max: usize,
    target: Duration,
}

impl BatchSizer {
    pub fn new(config: &ScanConfig) -> Self {
        let min = config.min_batch.max(1);
        let max = config.max_batch.max(min);
        Self {
            size: config.initial_batch.clamp(min, max),
            min,
            max,
            target: Duration::from_millis(config.target_batch_ms),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Adjust after a batch took `elapsed`. Returns the next size.
    pub fn record(&mut self, elapsed: Duration) -> usize {
        self.size = if elapsed < self.target {
            (self.size * 2).min(self.max)
        } else {
            (self.size / 2).max(self.min)
        };
        self.size
    }
}

/// Which root may append directly to the list
struct ScanOrder {
    /// Number of leading roots that have finished
    done: Mutex<usize>,
    changed: Condvar,
}

impl ScanOrder {
    fn new() -> Self {
        Self {
            done: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn is_turn(&self, index: usize) -> bool {
        *self.done.lock() == index
    }

    /// Block until `index` may append. False if cancelled first.
    fn wait_turn(&self, index: usize, token: &CancelToken) -> bool {
        let mut done = self.done.lock();
        while *done != index {
            if token.is_cancelled() {
                return false;
            }
            self.changed.wait_for(&mut done, TURN_POLL);
        }
        !token.is_cancelled()
    }

    fn finish(&self, index: usize) {
        let mut done = self.done.lock();
        if *done == index {
            *done += 1;
            self.changed.notify_all();
        }
    }
}

#[derive(Default)]
struct RandomOrder {
    remaining: Vec<usize>,
    len: usize,
}

/// Builds and navigates the image list held by [`DataService`]
pub struct ImageListManager {
    config: Arc<ResolvedConfig>,
    scheduler: Arc<TaskScheduler>,
    data: Arc<DataService>,
    events: Arc<EventBus>,
    scanning: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    random: Mutex<RandomOrder>,
}

impl ImageListManager {
    pub fn new(
        config: Arc<ResolvedConfig>,
        scheduler: Arc<TaskScheduler>,
        data: Arc<DataService>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            scheduler,
            data,
            events,
            scanning: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            random: Mutex::new(RandomOrder::default()),
        }
    }

    // ===== Scanning =====

    /// Rescan every configured root, skipping the managed folders
    pub fn refresh_all(&self) {
        let roots = self.config.roots.clone();
        let excluded = self.config.excluded_folders();
        self.refresh(roots, excluded);
    }

    /// Rebuild the list from `roots`, cancelling any scan in progress.
    /// Returns immediately; progress arrives as [`CoreEvent::ListUpdated`].
    pub fn refresh(&self, roots: Vec<PathBuf>, excluded: Vec<PathBuf>) {
        if self.scheduler.is_shutting_down() {
            tracing::debug!("Shutdown initiated, not scanning");
            return;
        }

        self.scheduler.cancel_and_wait(SCAN_TAG);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        self.data.set_list(Vec::new());
        self.scanning.store(true, Ordering::Release);
        self.events.publish(&CoreEvent::ScanStarted);
        self.events.publish(&CoreEvent::ListSizeChanged { len: 0 });

        if roots.is_empty() {
            self.finish_scan(generation);
            return;
        }

        tracing::info!("Scanning {} root(s)", roots.len());
        let order = Arc::new(ScanOrder::new());
        let remaining = Arc::new(AtomicUsize::new(roots.len()));
        let excluded = Arc::new(excluded);

        for (index, root) in roots.into_iter().enumerate() {
            let task_order = Arc::clone(&order);
            let finish_order = Arc::clone(&order);
            let excluded = Arc::clone(&excluded);
            let data = Arc::clone(&self.data);
            let events = Arc::clone(&self.events);
            let scan = self.config.scan;

            let task_remaining = Arc::clone(&remaining);
            let scanning = Arc::clone(&self.scanning);
            let current_generation = Arc::clone(&self.generation);
            let finish_events = Arc::clone(&self.events);

            let task = Task::new(move |token| {
                scan_root(index, &root, &excluded, scan, &task_order, &data, &events, token);
            })
            .with_tag(SCAN_TAG)
            .on_finished(move |_| {
                // Later roots must not wait on a root that died early
                finish_order.finish(index);
                if task_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                if current_generation.load(Ordering::Acquire) == generation {
                    scanning.store(false, Ordering::Release);
                    finish_events.publish(&CoreEvent::ScanFinished);
                    tracing::info!("Scan finished");
                }
            });

            if self.scheduler.submit(task).is_none() {
                tracing::debug!("Scan task not scheduled");
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.finish_scan(generation);
                }
            }
        }
    }

    fn finish_scan(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.scanning.store(false, Ordering::Release);
            self.events.publish(&CoreEvent::ScanFinished);
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    // ===== Mutation =====

    /// Insert `path` at its natural-sort position
    pub fn insert_sorted(&self, path: PathBuf) -> Option<usize> {
        let index = self.data.insert_sorted(path)?;
        self.events.publish(&CoreEvent::ListSizeChanged { len: self.data.len() });
        Some(index)
    }

    pub fn remove(&self, path: &Path) -> Option<usize> {
        let index = self.data.remove(path)?;
        self.events.publish(&CoreEvent::ListSizeChanged { len: self.data.len() });
        Some(index)
    }

    /// Remove the current image. Returns the index and path it had.
    pub fn pop_current(&self) -> Option<(usize, PathBuf)> {
        let popped = self.data.atomically(|data| {
            let (index, _) = data.current()?;
            let path = data.pop(index)?;
            Some((index, path))
        })?;
        self.events.publish(&CoreEvent::ListSizeChanged { len: self.data.len() });
        Some(popped)
    }

    // ===== Navigation =====

    pub fn next(&self) -> Option<PathBuf> {
        self.data.atomically(|data| {
            let len = data.len();
            if len == 0 {
                return None;
            }
            let index = data.current_index().map_or(0, |i| (i + 1) % len);
            data.set_index(index)
        })
    }

    pub fn previous(&self) -> Option<PathBuf> {
        self.data.atomically(|data| {
            let len = data.len();
            if len == 0 {
                return None;
            }
            let index = data.current_index().map_or(len - 1, |i| (i + len - 1) % len);
            data.set_index(index)
        })
    }

    pub fn first(&self) -> Option<PathBuf> {
        self.data.set_index(0)
    }

    pub fn last(&self) -> Option<PathBuf> {
        self.data.atomically(|data| data.set_index(data.len().checked_sub(1)?))
    }

    /// Jump to a random image. Every index is visited once before any
    /// repeats; the order is reshuffled when exhausted or when the list
    /// length changes.
    pub fn random(&self) -> Option<PathBuf> {
        self.data.atomically(|data| {
            let len = data.len();
            if len == 0 {
                return None;
            }

            let mut random = self.random.lock();
            if random.remaining.is_empty() || random.len != len {
                let mut order: Vec<usize> = (0..len).collect();
                order.shuffle(&mut rand::thread_rng());
                random.remaining = order;
                random.len = len;
            }
            let index = random.remaining.pop()?;
            data.set_index(index)
        })
    }

    pub fn set_current(&self, index: usize) -> Option<PathBuf> {
        self.data.set_index(index)
    }

    pub fn current(&self) -> Option<(usize, PathBuf)> {
        self.data.current()
    }
}

#[allow(clippy::too_many_arguments)]
fn scan_root(
    index: usize,
    root: &Path,
    excluded: &[PathBuf],
    scan: ScanConfig,
    order: &ScanOrder,
    data: &DataService,
    events: &EventBus,
    token: &CancelToken,
) {
    tracing::debug!("Scanning root {}: {}", index, root.display());
    let mut walker = ImageWalker::new(root, excluded);
    let mut sizer = BatchSizer::new(&scan);
    let mut held = Vec::new();
    let mut found = 0usize;

    loop {
        if token.is_cancelled() {
            tracing::debug!("Scan of {} cancelled", root.display());
            return;
        }

        let started = Instant::now();
        let batch: Vec<PathBuf> = walker.by_ref().take(sizer.size()).collect();
        if batch.is_empty() {
            break;
        }
        found += batch.len();
        held.extend(batch);

        if order.is_turn(index) {
            append(data, events, std::mem::take(&mut held));
        }
        sizer.record(started.elapsed());
    }

    if !order.wait_turn(index, token) {
        tracing::debug!("Scan of {} cancelled while waiting", root.display());
        return;
    }
    if !held.is_empty() {
        append(data, events, held);
    }
    order.finish(index);
    tracing::debug!("Root {} done: {} images", root.display(), found);
}

fn append(data: &DataService, events: &EventBus, batch: Vec<PathBuf>) {
    let was_empty = data.is_empty();
    let len = data.extend(batch);

    events.publish(&CoreEvent::ListUpdated);
    events.publish(&CoreEvent::ListSizeChanged { len });
    if was_empty && len > 0 {
        events.publish(&CoreEvent::DisplayRefreshRequested {
            current: data.current_path(),
        });
    }
}

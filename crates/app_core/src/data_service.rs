//! Thread-safe owner of the image list and the current position
//!
//! Every read and write goes through one re-entrant lock, so a caller that
//! needs several steps to be atomic can wrap them in [`DataService::atomically`]
//! and still call the ordinary accessors from inside. Reads hand out owned
//! copies, never references into the list.

use crate::cache::ImageCache;
use app_fs::natural_path_cmp;
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct ListState {
    images: Vec<PathBuf>,
    members: HashSet<PathBuf>,
    current_index: Option<usize>,
    current_path: Option<PathBuf>,
    ongoing_file_tasks: HashSet<PathBuf>,
}

impl ListState {
    fn position(&self, path: &Path) -> Option<usize> {
        if !self.members.contains(path) {
            return None;
        }
        self.images.iter().position(|p| p == path)
    }

    fn select(&mut self, index: Option<usize>) {
        self.current_index = index;
        self.current_path = index.and_then(|i| self.images.get(i).cloned());
    }

    /// Restore the index/path invariant after the list changed.
    ///
    /// Follows the current path if it is still listed, otherwise keeps the
    /// old index clamped to the list.
    fn resync(&mut self, fallback: Option<usize>) {
        if self.images.is_empty() {
            self.select(None);
            return;
        }

        let by_path = self.current_path.as_deref().and_then(|p| self.position(p));
        let index = by_path
            .or(fallback)
            .unwrap_or(0)
            .min(self.images.len() - 1);
        self.select(Some(index));
    }

    fn remove_at(&mut self, index: usize) -> PathBuf {
        let old = self.current_index;
        let removed = self.images.remove(index);
        self.members.remove(&removed);
        self.resync(old);
        removed
    }
}

/// Single source of truth for the image list
#[derive(Default)]
pub struct DataService {
    state: ReentrantMutex<RefCell<ListState>>,
    cache: RwLock<Weak<ImageCache>>,
}

impl DataService {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ListState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Run `f` with the list lock held. Other accessors may be called from
    /// inside `f`.
    pub fn atomically<R>(&self, f: impl FnOnce(&DataService) -> R) -> R {
        let _guard = self.state.lock();
        f(self)
    }

    pub fn set_cache(&self, cache: &Arc<ImageCache>) {
        *self.cache.write() = Arc::downgrade(cache);
    }

    pub fn cache(&self) -> Option<Arc<ImageCache>> {
        self.cache.read().upgrade()
    }

    // ===== List mutation =====

    /// Append paths not already listed. Selects index 0 if the list was empty.
    /// Returns the new length.
    pub fn extend(&self, paths: impl IntoIterator<Item = PathBuf>) -> usize {
        self.with(|s| {
            let was_empty = s.images.is_empty();
            for path in paths {
                if s.members.insert(path.clone()) {
                    s.images.push(path);
                }
            }
            if was_empty && !s.images.is_empty() {
                s.select(Some(0));
            }
            s.images.len()
        })
    }

    /// Replace the whole list, keeping the current image if it survives
    pub fn set_list(&self, paths: Vec<PathBuf>) {
        self.with(|s| {
            let old = s.current_index;
            s.images.clear();
            s.members.clear();
            for path in paths {
                if s.members.insert(path.clone()) {
                    s.images.push(path);
                }
            }
            s.resync(old);
        })
    }

    /// Remove `path`. Returns the index it had.
    pub fn remove(&self, path: &Path) -> Option<usize> {
        self.with(|s| {
            let index = s.position(path)?;
            s.remove_at(index);
            Some(index)
        })
    }

    /// Remove and return the entry at `index`
    pub fn pop(&self, index: usize) -> Option<PathBuf> {
        self.with(|s| {
            if index >= s.images.len() {
                return None;
            }
            Some(s.remove_at(index))
        })
    }

    /// Insert `path` at its natural-sort position. Returns the index, or
    /// `None` if it was already listed.
    pub fn insert_sorted(&self, path: PathBuf) -> Option<usize> {
        self.with(|s| {
            if s.members.contains(&path) {
                return None;
            }
            let index = s
                .images
                .iter()
                .position(|p| natural_path_cmp(&path, p) == Ordering::Less)
                .unwrap_or(s.images.len());

            s.members.insert(path.clone());
            s.images.insert(index, path);
            let old = s.current_index;
            s.resync(old);
            Some(index)
        })
    }

    /// Insert `path` at `index` (clamped to the list length). Returns the
    /// index used, or `None` if it was already listed.
    pub fn insert_at(&self, index: usize, path: PathBuf) -> Option<usize> {
        self.with(|s| {
            if s.members.contains(&path) {
                return None;
            }
            let index = index.min(s.images.len());
            s.members.insert(path.clone());
            s.images.insert(index, path);
            let old = s.current_index;
            s.resync(old);
            Some(index)
        })
    }

    /// Make `index` current. Returns the new current path, or `None` if the
    /// index is out of range (nothing changes).
    pub fn set_index(&self, index: usize) -> Option<PathBuf> {
        self.with(|s| {
            if index >= s.images.len() {
                return None;
            }
            s.select(Some(index));
            s.current_path.clone()
        })
    }

    // ===== Reads =====

    pub fn len(&self) -> usize {
        self.with(|s| s.images.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.with(|s| s.members.contains(path))
    }

    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.with(|s| s.position(path))
    }

    pub fn path_at(&self, index: usize) -> Option<PathBuf> {
        self.with(|s| s.images.get(index).cloned())
    }

    /// Snapshot of the whole list
    pub fn images(&self) -> Vec<PathBuf> {
        self.with(|s| s.images.clone())
    }

    pub fn current_index(&self) -> Option<usize> {
        self.with(|s| s.current_index)
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.with(|s| s.current_path.clone())
    }

    /// Current index and path together
    pub fn current(&self) -> Option<(usize, PathBuf)> {
        self.with(|s| Some((s.current_index?, s.current_path.clone()?)))
    }

    // ===== Ongoing file tasks =====

    /// Mark `path` as being moved by the application. Returns false if it
    /// already was.
    pub fn begin_file_task(&self, path: &Path) -> bool {
        self.with(|s| s.ongoing_file_tasks.insert(path.to_path_buf()))
    }

    pub fn end_file_task(&self, path: &Path) {
        self.with(|s| {
            s.ongoing_file_tasks.remove(path);
        })
    }

    pub fn in_file_task(&self, path: &Path) -> bool {
        self.with(|s| s.ongoing_file_tasks.contains(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/pics/{}", n))).collect()
    }

    fn p(name: &str) -> PathBuf {
        PathBuf::from(format!("/pics/{}", name))
    }

    #[test]
    fn test_extend_selects_first() {
        let data = DataService::new();
        assert_eq!(data.current_index(), None);
        assert_eq!(data.current_path(), None);

        assert_eq!(data.extend(paths(&["a.jpg", "b.jpg"])), 2);
        assert_eq!(data.current(), Some((0, p("a.jpg"))));

        // Duplicates are ignored
        assert_eq!(data.extend(paths(&["b.jpg", "c.jpg"])), 3);
        assert_eq!(data.current_index(), Some(0));
    }

    #[test]
    fn test_insert_sorted_natural_order() {
        let data = DataService::new();
        data.insert_sorted(p("img10.jpg"));
        data.insert_sorted(p("img2.jpg"));
        assert_eq!(data.images(), paths(&["img2.jpg", "img10.jpg"]));
        assert_eq!(data.insert_sorted(p("img2.jpg")), None);
    }

    #[test]
    fn test_insert_keeps_current_path() {
        let data = DataService::new();
        data.extend(paths(&["b.jpg", "c.jpg"]));
        data.set_index(1);

        data.insert_sorted(p("a.jpg"));
        assert_eq!(data.current(), Some((2, p("c.jpg"))));
    }

    #[test]
    fn test_remove_current_last_clamps() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg", "b.jpg", "c.jpg"]));
        data.set_index(2);

        assert_eq!(data.remove(&p("c.jpg")), Some(2));
        assert_eq!(data.current(), Some((1, p("b.jpg"))));
    }

    #[test]
    fn test_remove_current_middle_advances() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg", "b.jpg", "c.jpg"]));
        data.set_index(1);

        data.remove(&p("b.jpg"));
        assert_eq!(data.images(), paths(&["a.jpg", "c.jpg"]));
        assert_eq!(data.current(), Some((1, p("c.jpg"))));
    }

    #[test]
    fn test_remove_other_follows_current() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg", "b.jpg", "c.jpg"]));
        data.set_index(2);

        data.remove(&p("a.jpg"));
        assert_eq!(data.current(), Some((1, p("c.jpg"))));
    }

    #[test]
    fn test_remove_last_remaining_clears() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg"]));
        data.remove(&p("a.jpg"));
        assert!(data.is_empty());
        assert_eq!(data.current_index(), None);
        assert_eq!(data.current_path(), None);
        assert_eq!(data.remove(&p("a.jpg")), None);
    }

    #[test]
    fn test_set_index_out_of_range() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg", "b.jpg"]));
        assert_eq!(data.set_index(5), None);
        assert_eq!(data.current_index(), Some(0));
        assert_eq!(data.set_index(1), Some(p("b.jpg")));
    }

    #[test]
    fn test_pop_and_insert_at() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg", "b.jpg", "c.jpg"]));

        assert_eq!(data.pop(1), Some(p("b.jpg")));
        assert_eq!(data.pop(7), None);
        assert_eq!(data.insert_at(1, p("b.jpg")), Some(1));
        assert_eq!(data.images(), paths(&["a.jpg", "b.jpg", "c.jpg"]));
        assert_eq!(data.insert_at(99, p("d.jpg")), Some(3));
    }

    #[test]
    fn test_set_list_keeps_surviving_current() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg", "b.jpg", "c.jpg"]));
        data.set_index(2);

        data.set_list(paths(&["c.jpg", "d.jpg"]));
        assert_eq!(data.current(), Some((0, p("c.jpg"))));

        data.set_list(Vec::new());
        assert_eq!(data.current(), None);
    }

    #[test]
    fn test_atomically_allows_nested_calls() {
        let data = DataService::new();
        data.extend(paths(&["a.jpg", "b.jpg"]));

        let removed = data.atomically(|d| {
            let current = d.current_path()?;
            d.remove(&current)?;
            Some(current)
        });
        assert_eq!(removed, Some(p("a.jpg")));
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_concurrent_mutation_keeps_invariant() {
        let data = Arc::new(DataService::new());
        let mut threads = Vec::new();

        for t in 0..4 {
            let data = Arc::clone(&data);
            threads.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let path = PathBuf::from(format!("/pics/t{}_{}.jpg", t, i));
                    data.insert_sorted(path.clone());
                    if i % 3 == 0 {
                        data.remove(&path);
                    }
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        let (index, path) = data.current().unwrap();
        assert_eq!(data.path_at(index), Some(path));
        let images = data.images();
        let mut sorted = images.clone();
        sorted.sort_by(|a, b| natural_path_cmp(a, b));
        assert_eq!(images, sorted);
    }

    #[test]
    fn test_file_task_markers() {
        let data = DataService::new();
        assert!(data.begin_file_task(&p("a.jpg")));
        assert!(!data.begin_file_task(&p("a.jpg")));
        assert!(data.in_file_task(&p("a.jpg")));
        data.end_file_task(&p("a.jpg"));
        assert!(!data.in_file_task(&p("a.jpg")));
    }
}

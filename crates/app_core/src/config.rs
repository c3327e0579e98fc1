//! Sorter configuration
//!
//! [`SorterConfig`] is the on-disk TOML form. [`SorterConfig::resolve`] turns
//! it into the immutable [`ResolvedConfig`] every core component receives.

use crate::{CoreError, Result};
use app_fs::natural_path_cmp;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-root delete folder when none is configured
pub const DELETE_FOLDER_NAME: &str = "deleted";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    pub library: LibraryConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub scan: ScanConfig,
    pub file_tasks: FileTaskConfig,
}

/// Which folders to scan and where sorted images go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Root directories to scan
    pub start_dirs: Vec<PathBuf>,
    /// Category names; each becomes a destination folder
    pub categories: Vec<String>,
    /// Parent of the category folders. Defaults to each root.
    pub sort_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    /// Explicit root -> category -> folder mapping, overrides `categories`
    pub dest_folders: BTreeMap<String, BTreeMap<String, PathBuf>>,
    /// Explicit root -> delete folder mapping
    pub delete_folders: BTreeMap<String, PathBuf>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            start_dirs: Vec::new(),
            categories: Vec::new(),
            sort_dir: None,
            cache_dir: None,
            log_dir: None,
            log_level: "info".to_string(),
            dest_folders: BTreeMap::new(),
            delete_folders: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum decoded images held in memory
    pub max_entries: usize,
    /// Same-path watcher events inside this window are dropped
    pub throttle_ms: u64,
    /// Quiet period before a refresh runs
    pub debounce_ms: u64,
    /// Watcher health check interval
    pub health_check_ms: u64,
    pub watch: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            throttle_ms: 1000,
            debounce_ms: 500,
            health_check_ms: 1000,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { workers: 16 }
    }
}

/// Adaptive scan batch sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub initial_batch: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub target_batch_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            initial_batch: 50,
            min_batch: 10,
            max_batch: 1000,
            target_batch_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTaskConfig {
    /// Delay between re-arming the watcher and releasing the path
    pub settle_ms: u64,
}

impl Default for FileTaskConfig {
    fn default() -> Self {
        Self { settle_ms: 1000 }
    }
}

impl SorterConfig {
    /// Load configuration from `path`, or the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            tracing::info!("Configuration loaded from {:?}", config_path);
            Ok(config)
        } else {
            tracing::info!("Using default configuration");
            Ok(Self::default())
        }
    }

    /// Save configuration to `path`, or the default location when `None`
    pub fn save(&self, path: Option<&Path>) -> anyhow::Result<()> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        ProjectDirs::from("org", "picsort", "picsort")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Logging settings for `app_log::init`
    pub fn log_config(&self) -> app_log::LogConfig {
        app_log::LogConfig {
            dir: self.library.log_dir.clone().unwrap_or_else(app_log::default_log_dir),
            level: self.library.log_level.clone(),
        }
    }

    /// Derive the folder layout and runtime settings
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        if self.library.start_dirs.is_empty() {
            return Err(CoreError::Config("no start_dirs configured".into()));
        }
        if self.scheduler.workers == 0 {
            return Err(CoreError::Config("scheduler.workers must be at least 1".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(CoreError::Config("cache.max_entries must be at least 1".into()));
        }

        let sort_dir = self.library.sort_dir.as_deref().map(absolute);
        let mut roots = Vec::new();
        let mut dest_folders = HashMap::new();
        let mut delete_folders = HashMap::new();

        for dir in &self.library.start_dirs {
            let root = absolute(dir);
            if roots.contains(&root) {
                continue;
            }
            let key = dir.to_string_lossy().to_string();
            let base = sort_dir.clone().unwrap_or_else(|| root.clone());

            let categories: BTreeMap<String, PathBuf> = match self.library.dest_folders.get(&key) {
                Some(explicit) => explicit.iter().map(|(cat, p)| (cat.clone(), absolute(p))).collect(),
                None => self
                    .library
                    .categories
                    .iter()
                    .map(|cat| (cat.clone(), base.join(cat)))
                    .collect(),
            };

            let delete = self
                .library
                .delete_folders
                .get(&key)
                .map(|p| absolute(p))
                .unwrap_or_else(|| base.join(DELETE_FOLDER_NAME));

            dest_folders.insert(root.clone(), categories);
            delete_folders.insert(root.clone(), delete);
            roots.push(root);
        }
        roots.sort_by(|a, b| natural_path_cmp(a, b));

        Ok(ResolvedConfig {
            roots,
            dest_folders,
            delete_folders,
            cache_dir: self.library.cache_dir.clone().unwrap_or_else(app_db::default_cache_dir),
            max_entries: self.cache.max_entries,
            throttle: Duration::from_millis(self.cache.throttle_ms),
            debounce: Duration::from_millis(self.cache.debounce_ms),
            health_check: Duration::from_millis(self.cache.health_check_ms.max(1)),
            watch: self.cache.watch,
            workers: self.scheduler.workers,
            scan: self.scan,
            settle: Duration::from_millis(self.file_tasks.settle_ms),
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Immutable configuration consumed by the core
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute root directories in natural order, which is also scan order
    pub roots: Vec<PathBuf>,
    /// root -> category -> destination folder
    pub dest_folders: HashMap<PathBuf, BTreeMap<String, PathBuf>>,
    /// root -> delete folder
    pub delete_folders: HashMap<PathBuf, PathBuf>,
    pub cache_dir: PathBuf,
    pub max_entries: usize,
    pub throttle: Duration,
    pub debounce: Duration,
    pub health_check: Duration,
    pub watch: bool,
    pub workers: usize,
    pub scan: ScanConfig,
    pub settle: Duration,
}

impl ResolvedConfig {
    /// Every destination and delete folder. The scanner and watcher skip these.
    pub fn excluded_folders(&self) -> Vec<PathBuf> {
        let mut folders: Vec<PathBuf> = self
            .dest_folders
            .values()
            .flat_map(|cats| cats.values().cloned())
            .chain(self.delete_folders.values().cloned())
            .collect();
        folders.sort();
        folders.dedup();
        folders
    }

    /// Is `dir` one of the destination or delete folders?
    pub fn is_managed_folder(&self, dir: &Path) -> bool {
        self.dest_folders.values().any(|cats| cats.values().any(|p| p == dir))
            || self.delete_folders.values().any(|p| p == dir)
    }

    /// The most specific configured root containing `path`
    pub fn root_for(&self, path: &Path) -> Option<&PathBuf> {
        self.roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
    }

    /// Destination folder for `path` in `category`
    pub fn dest_for(&self, path: &Path, category: &str) -> Option<&PathBuf> {
        let root = self.root_for(path)?;
        self.dest_folders.get(root)?.get(category)
    }

    /// Delete folder for `path`
    pub fn delete_for(&self, path: &Path) -> Option<&PathBuf> {
        let root = self.root_for(path)?;
        self.delete_folders.get(root)
    }

    /// Category names available for `path`
    pub fn categories_for(&self, path: &Path) -> Vec<String> {
        self.root_for(path)
            .and_then(|root| self.dest_folders.get(root))
            .map(|cats| cats.keys().cloned().collect())
            .unwrap_or_default()
    }
}

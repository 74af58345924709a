use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{OfflineManager, SnapshotSource, SnapshotStorage, SseConfig};

/// Configuration for [`OfflineManager`].
///
/// ```
/// # use std::time::Duration;
/// # use flagent::OfflineConfig;
/// let config = OfflineConfig::new()
///     .refresh_interval(Duration::from_secs(30))
///     .enable_persistence(false);
/// ```
#[derive(Clone)]
pub struct OfflineConfig {
    pub(crate) enable_persistence: bool,
    pub(crate) storage_dir: PathBuf,
    pub(crate) storage: Option<Arc<dyn SnapshotStorage>>,
    pub(crate) auto_refresh: bool,
    pub(crate) refresh_interval: Duration,
    pub(crate) refresh_jitter: Duration,
    pub(crate) snapshot_ttl: Duration,
    pub(crate) refresh_timeout: Duration,
    pub(crate) enable_debug_logging: bool,
    pub(crate) realtime: SseConfig,
}

impl OfflineConfig {
    /// Default interval between background refreshes.
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

    /// Default jitter. Zero disables jitter.
    pub const DEFAULT_REFRESH_JITTER: Duration = Duration::ZERO;

    /// Default time a fetched snapshot stays fresh.
    pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60);

    /// Default upper bound of a single background refresh.
    pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

    /// Name of the default storage directory inside the user's home directory.
    pub const DEFAULT_STORAGE_DIR_NAME: &'static str = ".flagent";

    /// Create a configuration with default settings.
    pub fn new() -> Self {
        OfflineConfig {
            enable_persistence: true,
            storage_dir: Self::default_storage_dir(),
            storage: None,
            auto_refresh: true,
            refresh_interval: Self::DEFAULT_REFRESH_INTERVAL,
            refresh_jitter: Self::DEFAULT_REFRESH_JITTER,
            snapshot_ttl: Self::DEFAULT_SNAPSHOT_TTL,
            refresh_timeout: Self::DEFAULT_REFRESH_TIMEOUT,
            enable_debug_logging: false,
            realtime: SseConfig::default(),
        }
    }

    /// `$HOME/.flagent`, or a directory under the system temp dir if there is no home directory.
    pub fn default_storage_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(Self::DEFAULT_STORAGE_DIR_NAME)
    }

    /// Keep a copy of the last snapshot on disk so that restarts can skip the network. When
    /// disabled, the copy only lives in memory.
    pub fn enable_persistence(mut self, enable_persistence: bool) -> Self {
        self.enable_persistence = enable_persistence;
        self
    }

    /// Directory for the file-backed storage.
    pub fn storage_dir(mut self, storage_dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = storage_dir.into();
        self
    }

    /// Use a custom storage instead of the built-in ones. Takes precedence over
    /// [`OfflineConfig::enable_persistence`].
    pub fn storage(mut self, storage: impl SnapshotStorage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Refresh the snapshot in the background, both on a timer and when an evaluation notices
    /// an expired snapshot.
    pub fn auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    /// Interval between background refreshes.
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Randomly shorten each refresh interval by up to `refresh_jitter` so that many processes
    /// don't hit the server in lockstep.
    pub fn refresh_jitter(mut self, refresh_jitter: Duration) -> Self {
        self.refresh_jitter = refresh_jitter;
        self
    }

    /// How long a fetched snapshot stays fresh. A zero TTL never expires.
    pub fn snapshot_ttl(mut self, snapshot_ttl: Duration) -> Self {
        self.snapshot_ttl = snapshot_ttl;
        self
    }

    /// Upper bound of every background refresh.
    pub fn refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Collect a debug trace for every evaluation done through the manager.
    pub fn enable_debug_logging(mut self, enable_debug_logging: bool) -> Self {
        self.enable_debug_logging = enable_debug_logging;
        self
    }

    /// Settings for the real-time connection opened by
    /// [`OfflineManager::enable_realtime_updates`].
    pub fn realtime(mut self, realtime: SseConfig) -> Self {
        self.realtime = realtime;
        self
    }

    /// Create a new [`OfflineManager`] fetching snapshots from `source`.
    ///
    /// ```no_run
    /// # async fn run() -> flagent::Result<()> {
    /// use flagent::{HttpSourceConfig, OfflineConfig};
    ///
    /// let source = HttpSourceConfig::new("https://flags.example.com/api/v1")
    ///     .api_key("api-key")
    ///     .to_source()?;
    /// let manager = OfflineConfig::new().to_manager(source);
    /// manager.bootstrap(false).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn to_manager(self, source: impl SnapshotSource + 'static) -> OfflineManager {
        OfflineManager::new(self, Arc::new(source))
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self::new()
    }
}

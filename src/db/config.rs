//! Open-time configuration.

pub use crate::storage::cache::CacheOptions;

/// Durability mode for WAL writes at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync before commit returns; full crash durability.
    Full,
    /// Write through to the OS at commit, let writeback flush; a crash can
    /// lose the last moments of commits.
    Normal,
    /// No header write per commit; durability limited to checkpoints.
    Off,
}

/// Options accepted by [`GraphDB::open`](crate::db::GraphDB::open).
#[derive(Debug, Clone)]
pub struct Options {
    /// Open without write access; mutation attempts fail with `ReadOnly`.
    pub read_only: bool,
    /// Create the container when the path does not exist.
    pub create_if_missing: bool,
    /// Page size for snapshot placement (power of two).
    pub page_size: u32,
    /// Total WAL area in bytes, split ~75/25 between the two regions.
    pub wal_size: u64,
    /// Checkpoint automatically when thresholds trip.
    pub auto_checkpoint: bool,
    /// Active-region usage fraction that triggers auto-checkpoint.
    pub checkpoint_threshold: f64,
    /// Run auto-checkpoints on a background worker instead of blocking the
    /// committing caller.
    pub background_checkpoint: bool,
    /// WAL durability mode.
    pub sync_mode: SyncMode,
    /// Cache layer configuration; `None` disables caching.
    pub cache: Option<CacheOptions>,
    /// Enable MVCC snapshot isolation and conflict detection.
    pub mvcc: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            create_if_missing: true,
            page_size: 4096,
            wal_size: 1024 * 1024,
            auto_checkpoint: true,
            checkpoint_threshold: 0.8,
            background_checkpoint: false,
            sync_mode: SyncMode::Full,
            cache: Some(CacheOptions::default()),
            mvcc: true,
        }
    }
}

impl Options {
    /// Opens read-only.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Creates the file when missing.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the page size.
    pub fn page_size(mut self, value: u32) -> Self {
        self.page_size = value;
        self
    }

    /// Sets the WAL area size.
    pub fn wal_size(mut self, value: u64) -> Self {
        self.wal_size = value;
        self
    }

    /// Toggles auto-checkpoint.
    pub fn auto_checkpoint(mut self, value: bool) -> Self {
        self.auto_checkpoint = value;
        self
    }

    /// Sets the auto-checkpoint usage threshold, clamped to (0, 1].
    pub fn checkpoint_threshold(mut self, value: f64) -> Self {
        self.checkpoint_threshold = value.clamp(0.05, 1.0);
        self
    }

    /// Toggles the background checkpoint worker.
    pub fn background_checkpoint(mut self, value: bool) -> Self {
        self.background_checkpoint = value;
        self
    }

    /// Sets the durability mode.
    pub fn sync_mode(mut self, value: SyncMode) -> Self {
        self.sync_mode = value;
        self
    }

    /// Configures or disables the cache layer.
    pub fn cache(mut self, value: Option<CacheOptions>) -> Self {
        self.cache = value;
        self
    }

    /// Toggles MVCC.
    pub fn mvcc(mut self, value: bool) -> Self {
        self.mvcc = value;
        self
    }
}

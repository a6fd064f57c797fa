use std::path::PathBuf;

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Pool file backing the store.
    pub path: PathBuf,

    /// Create the pool file when it does not exist (default: true).
    pub create_if_missing: bool,

    /// Fsync the image and its directory on every durable point
    /// (default: true). Disabling this trades crash durability for speed;
    /// tests do, production should not.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./emberdb.pool"),
            create_if_missing: true,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given pool file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set whether a missing pool file is created on open.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set whether durable points fsync.
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

pub mod header;

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::Index;

use header::{layout_tag, PoolHeader, LAYOUT_LEN};

/// The durable root object: one pointer, to the index.
#[derive(Debug, Serialize, Deserialize)]
pub struct Root {
    pub index: Arc<Index>,
}

/// Durable object pool backing the store: one file holding a checksummed
/// header followed by a bincode image of the root object graph.
///
/// Durability is all-or-nothing at the granularity of a [`Pool::durable`]
/// block. The closure stages its mutations on the live object graph, and
/// only a successful return publishes them by rewriting the image
/// atomically (write to a sibling temp file, fsync, rename over the pool
/// file). A failed closure publishes nothing, which is the contract version
/// installation relies on to undo a conflicting commit.
#[derive(Debug)]
pub struct Pool {
    path: PathBuf,
    layout: [u8; LAYOUT_LEN],
    root: Root,
    // Serializes image writes; never held while user closures run.
    io: Mutex<()>,
    sync_writes: bool,
    // Exclusive cross-process lock on the pool, held until the pool drops.
    // The OS releases it when the handle closes.
    _lock: File,
}

impl Pool {
    /// Creates a new pool file with an empty index. Fails if the file
    /// already exists.
    pub fn create(path: impl Into<PathBuf>, layout: &str, sync_writes: bool) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(Error::IO(format!(
                "pool file {} already exists",
                path.display()
            )));
        }
        let lock = Self::acquire_lock(&path)?;
        let pool = Self {
            path,
            layout: layout_tag(layout),
            root: Root {
                index: Arc::new(Index::new()),
            },
            io: Mutex::new(()),
            sync_writes,
            _lock: lock,
        };
        pool.flush()?;
        tracing::info!(path = %pool.path.display(), layout, "created pool");
        Ok(pool)
    }

    /// Opens an existing pool file, verifying header, layout tag and
    /// checksum before deserializing the image.
    pub fn open(path: impl Into<PathBuf>, layout: &str, sync_writes: bool) -> Result<Self> {
        let path = path.into();
        // Lock before reading: the image must not be read mid-rewrite.
        let lock = Self::acquire_lock(&path)?;
        let (header, payload) = read_image(&path)?;

        let tag = layout_tag(layout);
        if header.layout != tag {
            return Err(Error::Corrupted(format!(
                "pool {} has layout {:?}, expected {layout:?}",
                path.display(),
                String::from_utf8_lossy(&header.layout)
            )));
        }

        let root: Root = bincode::deserialize(&payload)?;
        tracing::info!(path = %path.display(), keys = root.index.len(), "opened pool");
        Ok(Self {
            path,
            layout: tag,
            root,
            io: Mutex::new(()),
            sync_writes,
            _lock: lock,
        })
    }

    /// Claims the pool for this process: an exclusive advisory lock on the
    /// sibling `.lock` file, held until the pool drops. A second open of
    /// the same pool fails here instead of racing the image. The holder's
    /// pid is recorded in the file for debugging.
    fn acquire_lock(pool_path: &Path) -> Result<File> {
        let lock_path = sibling_path(pool_path, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        file.try_lock_exclusive().map_err(|e| {
            Error::IO(format!(
                "pool {} is locked by another process: {e}",
                pool_path.display()
            ))
        })?;
        // Only the lock holder may rewrite the file, so a failed attempt
        // leaves the recorded holder intact.
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;
        Ok(file)
    }

    /// Verifies a pool file without constructing a pool: header decodes,
    /// layout matches and the payload checksums.
    pub fn check(path: impl AsRef<Path>, layout: &str) -> Result<()> {
        let (header, _payload) = read_image(path.as_ref())?;
        if header.layout != layout_tag(layout) {
            return Err(Error::Corrupted(format!(
                "layout tag mismatch, expected {layout:?}"
            )));
        }
        Ok(())
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    pub fn index(&self) -> Arc<Index> {
        Arc::clone(&self.root.index)
    }

    /// Runs `f` as a durable transactional block: the image is rewritten
    /// only if `f` returns `Ok`. Callers must not hold a history mutex
    /// across this call, since the flush acquires every chain lock while
    /// serializing the image.
    pub fn durable<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let out = f()?;
        self.flush()?;
        Ok(out)
    }

    /// Rewrites the pool image from the live object graph.
    pub fn flush(&self) -> Result<()> {
        let _io = self.io.lock().unwrap();

        // Serialization walks root -> index -> histories -> versions,
        // taking the index mutex and then each chain mutex in the canonical
        // lock order.
        let payload = bincode::serialize(&self.root)?;
        let header = PoolHeader::new(self.layout, &payload);

        let tmp_path = sibling_path(&self.path, ".tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        header.encode(&mut file)?;
        file.write_all(&payload)?;
        if self.sync_writes {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        if self.sync_writes {
            sync_parent_dir(&self.path)?;
        }
        Ok(())
    }
}

fn read_image(path: &Path) -> Result<(PoolHeader, Vec<u8>)> {
    let mut file = File::open(path)
        .map_err(|e| Error::IO(format!("cannot open pool {}: {e}", path.display())))?;
    let header = PoolHeader::decode(&mut file)?;
    let mut payload = Vec::with_capacity(header.payload_len as usize);
    file.read_to_end(&mut payload)?;
    header.verify(&payload)?;
    Ok((header, payload))
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

//! Backup-range catalog: maps `(owner, range_id)` to the secondary log,
//! per-range coalescing buffer, and version store that back it, and owns
//! creating/removing the disk files underneath them.
//!
//! The backend choice ([`BackendFactory`]) is pulled out so the same
//! registry works whether files live on a normal filesystem or inside a
//! shared raw device slab.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::config::Config;
use crate::error::LogError;
use crate::ids::RangeKey;
use crate::io_backend::{open_backend, DiskBackend, RawDeviceManager};
use crate::secondary_log::SecondaryLog;
use crate::secondary_log_buffer::SecondaryLogBuffer;
use crate::version_store::VersionStore;

/// Everything the processing stage and reorganisation thread need for one
/// backup range.
pub struct RangeEntry {
    pub log: Arc<SecondaryLog>,
    pub buffer: Mutex<SecondaryLogBuffer>,
    pub versions: Arc<VersionStore>,
    /// Set for the duration of a recovery scan over this range's secondary
    /// log, so a concurrent [`SecondaryLogRegistry::remove_backup_range`]
    /// call fails with [`LogError::Busy`] instead of racing the scan.
    recovering: AtomicBool,
}

impl RangeEntry {
    /// Marks the range as under active recovery, returning `false` (and
    /// leaving the flag untouched) if a scan is already in progress.
    pub fn begin_recovery(&self) -> bool {
        self.recovering.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn end_recovery(&self) {
        self.recovering.store(false, Ordering::Release);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }
}

/// Opens the backend file/slab for a given range; lets the registry stay
/// agnostic to whether ranges live as separate files or slabs of a shared
/// raw device.
pub trait BackendFactory: Send + Sync {
    fn open(&self, range: RangeKey, size: u64) -> io::Result<Box<dyn DiskBackend>>;

    /// Filesystem path to persist this range's version-store snapshot, for
    /// factories that back ranges with ordinary files. Raw-device-backed
    /// factories have no natural home for a variable-length blob outside
    /// the slab directory's fixed-size entries and return `None`, leaving
    /// their version stores to be rebuilt by a full recovery scan on
    /// restart instead.
    fn snapshot_path(&self, _range: RangeKey) -> Option<PathBuf> {
        None
    }
}

/// One file per range under a directory, named `<owner>-<range_id>.seclog`.
pub struct DirectoryBackendFactory {
    dir: PathBuf,
    config: Config,
}

impl DirectoryBackendFactory {
    pub fn new(dir: PathBuf, config: Config) -> Self {
        Self { dir, config }
    }

    fn path_for(&self, range: RangeKey) -> PathBuf {
        self.dir.join(format!("{:04x}-{:04x}.seclog", range.owner, range.range_id))
    }
}

impl BackendFactory for DirectoryBackendFactory {
    fn open(&self, range: RangeKey, size: u64) -> io::Result<Box<dyn DiskBackend>> {
        open_backend(&self.config, &self.path_for(range), size, None)
    }

    fn snapshot_path(&self, range: RangeKey) -> Option<PathBuf> {
        Some(self.dir.join(format!("{:04x}-{:04x}.vsnap", range.owner, range.range_id)))
    }
}

/// One slab per range, carved out of a shared [`RawDeviceManager`].
pub struct RawBackendFactory {
    manager: Arc<RawDeviceManager>,
    config: Config,
}

impl RawBackendFactory {
    pub fn new(manager: Arc<RawDeviceManager>, config: Config) -> Self {
        Self { manager, config }
    }
}

impl BackendFactory for RawBackendFactory {
    fn open(&self, range: RangeKey, size: u64) -> io::Result<Box<dyn DiskBackend>> {
        let name = format!("{:04x}-{:04x}", range.owner, range.range_id);
        open_backend(&self.config, &PathBuf::from(name), size, Some(&self.manager))
    }
}

/// Live catalog of every backup range this node currently hosts.
pub struct SecondaryLogRegistry {
    factory: Box<dyn BackendFactory>,
    config: Config,
    epoch: u16,
    ranges: RwLock<HashMap<RangeKey, Arc<RangeEntry>>>,
}

impl SecondaryLogRegistry {
    pub fn new(factory: Box<dyn BackendFactory>, config: Config, epoch: u16) -> Self {
        Self {
            factory,
            config,
            epoch,
            ranges: RwLock::new(HashMap::new()),
        }
    }

    pub fn ranges(&self) -> Vec<RangeKey> {
        self.ranges.read().keys().copied().collect()
    }

    pub fn get(&self, range: RangeKey) -> Option<Arc<RangeEntry>> {
        self.ranges.read().get(&range).cloned()
    }

    fn build_entry(&self, range: RangeKey, versions: Arc<VersionStore>) -> Result<Arc<RangeEntry>, LogError> {
        let backend = self.factory.open(range, self.config.secondary_log_size())?;
        let log = Arc::new(SecondaryLog::open(
            range,
            backend,
            self.config.log_segment_size,
            self.config.secondary_log_size(),
            Arc::clone(&versions),
            self.config.use_checksum,
        ));
        Ok(Arc::new(RangeEntry {
            log,
            buffer: Mutex::new(SecondaryLogBuffer::new(self.config.secondary_log_buffer_size as usize)),
            versions,
            recovering: AtomicBool::new(false),
        }))
    }

    /// Creates a brand-new backup range. Errors if the range already exists.
    ///
    /// If this range was previously opened by this process and has a
    /// persisted version snapshot on disk, it's reloaded here rather than
    /// starting the version store empty.
    pub fn init_backup_range(&self, range: RangeKey) -> Result<Arc<RangeEntry>, LogError> {
        let mut ranges = self.ranges.write();
        if ranges.contains_key(&range) {
            return Err(LogError::InvalidArgument {
                message: format!("backup range {range} already exists"),
            });
        }
        let versions = self
            .load_version_snapshot(range)
            .unwrap_or_else(|| Arc::new(VersionStore::new(self.epoch)));
        let entry = self.build_entry(range, versions)?;
        ranges.insert(range, Arc::clone(&entry));
        Ok(entry)
    }

    fn load_version_snapshot(&self, range: RangeKey) -> Option<Arc<VersionStore>> {
        let path = self.factory.snapshot_path(range)?;
        let bytes = std::fs::read(&path).ok()?;
        Some(Arc::new(VersionStore::load_snapshot(self.epoch, &bytes)))
    }

    /// Writes `range`'s current version store out to its snapshot path, if
    /// its factory has one. A no-op for raw-device-backed ranges.
    pub fn save_version_snapshot(&self, range: RangeKey) -> io::Result<()> {
        let Some(path) = self.factory.snapshot_path(range) else {
            return Ok(());
        };
        let Some(entry) = self.get(range) else {
            return Ok(());
        };
        std::fs::write(path, entry.versions.snapshot())
    }

    /// Persists every registered range's version store. Used for periodic
    /// and shutdown snapshotting; failures are logged, not propagated, since
    /// a missing snapshot only costs a full recovery scan on next startup.
    pub fn save_all_version_snapshots(&self) {
        for range in self.ranges() {
            if let Err(error) = self.save_version_snapshot(range) {
                warn!(%range, %error, "failed to persist version snapshot");
            }
        }
    }

    /// Creates a backup range whose version store is seeded from a prior
    /// recovery pass rather than starting empty.
    pub fn init_recovered_backup_range(
        &self,
        range: RangeKey,
        versions: Arc<VersionStore>,
    ) -> Result<Arc<RangeEntry>, LogError> {
        let mut ranges = self.ranges.write();
        if ranges.contains_key(&range) {
            return Err(LogError::InvalidArgument {
                message: format!("backup range {range} already exists"),
            });
        }
        let entry = self.build_entry(range, versions)?;
        ranges.insert(range, Arc::clone(&entry));
        Ok(entry)
    }

    /// Removes `range` from the catalog and deletes its backing storage.
    /// The `Arc<SecondaryLog>` must be uniquely held at this point (no
    /// in-flight writer job references it);
    /// callers are expected to have drained the writer pool first.
    pub fn remove_backup_range(&self, range: RangeKey) -> Result<(), LogError> {
        let entry = {
            let mut ranges = self.ranges.write();
            match ranges.get(&range) {
                None => return Err(LogError::UnknownRange { range }),
                Some(entry) if entry.is_recovering() => return Err(LogError::Busy { range }),
                Some(_) => ranges.remove(&range).expect("checked present above"),
            }
        };

        match Arc::try_unwrap(entry) {
            Ok(entry) => match Arc::try_unwrap(entry.log) {
                Ok(log) => {
                    log.close_and_remove()?;
                }
                Err(_) => {
                    return Err(LogError::Busy { range });
                }
            },
            Err(_) => {
                return Err(LogError::Busy { range });
            }
        }
        if let Some(path) = self.factory.snapshot_path(range) {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

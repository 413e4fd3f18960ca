//! Primary log: a single sequential file receiving whole processing-pass
//! batches, rotated once every range that contributed to the oldest
//! unrotated span has flushed its data out to secondary logs.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{instrument, trace};

use crate::ids::RangeKey;
use crate::io_backend::DiskBackend;

/// One append-only primary log segment plus the set of ranges whose data
/// it still holds the only durable copy of.
struct ActiveFile {
    backend: Box<dyn DiskBackend>,
    cursor: u64,
    contributing: HashSet<RangeKey>,
}

/// Sequential write-ahead file backing the primary write buffer's flushed
/// batches, until each batch's ranges have been durably written to their
/// secondary logs.
pub struct PrimaryLog {
    size: u64,
    generation: AtomicU64,
    active: Mutex<ActiveFile>,
}

impl PrimaryLog {
    pub fn open(backend: Box<dyn DiskBackend>, size: u64) -> Self {
        Self {
            size,
            generation: AtomicU64::new(0),
            active: Mutex::new(ActiveFile {
                backend,
                cursor: 0,
                contributing: HashSet::new(),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Appends `batch` (already-encoded entries) followed by the one-byte
    /// zero sentinel that marks the end of a processing pass, recording
    /// which ranges contributed so rotation can later tell
    /// whether this file is still load-bearing.
    #[instrument(skip(self, batch, contributing), fields(len = batch.len()))]
    pub fn append_batch(&self, batch: &[u8], contributing: &[RangeKey]) -> io::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut active = self.active.lock();
        if active.cursor + batch.len() as u64 + 1 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "primary log is full; caller must rotate before this write",
            ));
        }

        active.backend.write_at(batch, 0, active.cursor, batch.len(), 0)?;
        active.cursor += batch.len() as u64;
        active.backend.write_at(&[0u8], 0, active.cursor, 1, 0)?;
        active.cursor += 1;
        active.contributing.extend(contributing.iter().copied());

        trace!(cursor = active.cursor, "appended batch to primary log");
        Ok(())
    }

    pub fn used_bytes(&self) -> u64 {
        self.active.lock().cursor
    }

    /// `true` once every range that has ever contributed to the current
    /// file has also flushed its data out to a secondary log, meaning the
    /// file can be reset without losing the only durable copy of anything.
    pub fn ready_to_rotate(&self, flushed_ranges: &HashSet<RangeKey>) -> bool {
        let active = self.active.lock();
        !active.contributing.is_empty() && active.contributing.is_subset(flushed_ranges)
    }

    /// Resets the file to empty and bumps the generation counter, provided
    /// [`Self::ready_to_rotate`] held at the time of the check. Returns
    /// `false` (no-op) if the file was already empty.
    pub fn rotate_if_ready(&self, flushed_ranges: &HashSet<RangeKey>) -> bool {
        let mut active = self.active.lock();
        if active.contributing.is_empty() || !active.contributing.is_subset(flushed_ranges) {
            return false;
        }
        active.cursor = 0;
        active.contributing.clear();
        self.generation.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Builds the on-disk path for a primary log file by owner.
pub fn primary_log_path(dir: &Path, owner: u16) -> std::path::PathBuf {
    dir.join(format!("{owner:04x}-primary.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_backend::BufferedBackend;

    fn open_test_log(dir: &std::path::Path, size: u64) -> PrimaryLog {
        let backend = BufferedBackend::open(&dir.join("p.log"), size).unwrap();
        PrimaryLog::open(Box::new(backend), size)
    }

    #[test]
    fn append_batch_advances_cursor_past_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_test_log(dir.path(), 4096);
        log.append_batch(b"hello", &[RangeKey::new(1, 0)]).unwrap();
        assert_eq!(log.used_bytes(), 6);
    }

    #[test]
    fn rotation_requires_all_contributing_ranges_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_test_log(dir.path(), 4096);
        let r1 = RangeKey::new(1, 0);
        let r2 = RangeKey::new(1, 1);
        log.append_batch(b"a", &[r1]).unwrap();
        log.append_batch(b"b", &[r2]).unwrap();

        let mut flushed = HashSet::new();
        flushed.insert(r1);
        assert!(!log.rotate_if_ready(&flushed));

        flushed.insert(r2);
        assert!(log.rotate_if_ready(&flushed));
        assert_eq!(log.used_bytes(), 0);
        assert_eq!(log.generation(), 1);
    }

    #[test]
    fn rotate_on_empty_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_test_log(dir.path(), 4096);
        assert!(!log.rotate_if_ready(&HashSet::new()));
        assert_eq!(log.generation(), 0);
    }
}

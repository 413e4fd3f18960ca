//! Per-(owner,range) version store: maps chunk id to `(epoch, version)`,
//! with a compact on-disk snapshot for fast recovery.
//!
//! One counter per chunk id, guarded by a single lock rather than
//! per-entry atomics, since entries are created dynamically and a
//! `HashMap` can't host raw atomics.

use std::collections::HashMap;
use std::io;

use crc32fast::Hasher;
use parking_lot::Mutex;

use crate::ids::{ChunkId, Version, INVALID_VERSION};

const SNAPSHOT_MAGIC: &[u8; 4] = b"DXVS";

/// Open-addressed (via `std::collections::HashMap`) mapping from chunk id to
/// its current `(epoch, version)`.
pub struct VersionStore {
    epoch: u16,
    inner: Mutex<HashMap<ChunkId, Version>>,
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl VersionStore {
    pub fn new(epoch: u16) -> Self {
        Self {
            epoch,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(epoch: u16, capacity: usize) -> Self {
        Self {
            epoch,
            inner: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Returns the version to use for the next write to `cid`, advancing the
    /// stored counter under a per-store lock.
    ///
    /// The store always holds the version most recently handed out, so that
    /// `get(cid)` reflects exactly what the latest write on disk carries —
    /// what reorg and recovery compare against to decide whether an on-disk
    /// entry is still live.
    pub fn next_version(&self, cid: ChunkId) -> Version {
        let mut guard = self.inner.lock();
        let assigned = match guard.get(&cid) {
            Some(current) => current.next(),
            None => Version { epoch: self.epoch, version: 0 },
        };
        guard.insert(cid, assigned);
        assigned
    }

    pub fn get(&self, cid: ChunkId) -> Option<Version> {
        self.inner.lock().get(&cid).copied()
    }

    /// Marks `cid` as removed by storing the tombstone marker, without
    /// disturbing the epoch.
    pub fn tombstone(&self, cid: ChunkId) {
        let mut guard = self.inner.lock();
        guard
            .entry(cid)
            .and_modify(|v| v.version = INVALID_VERSION)
            .or_insert(Version::tombstone(self.epoch));
    }

    pub fn set(&self, cid: ChunkId, version: Version) {
        self.inner.lock().insert(cid, version);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Bulk readout used by recovery and reorganisation.
    pub fn for_all(&self, mut cb: impl FnMut(ChunkId, Version)) {
        for (cid, version) in self.inner.lock().iter() {
            cb(*cid, *version);
        }
    }

    /// Lowest chunk id currently tracked, used by reorg/recovery to bound scans.
    pub fn lowest_chunk_id(&self) -> Option<ChunkId> {
        self.inner.lock().keys().min().copied()
    }

    /// Serializes the store as `[magic:4][count:4][(cid:8,epoch:2,version:4)×count][crc:4]`.
    pub fn snapshot(&self) -> Vec<u8> {
        let guard = self.inner.lock();
        let mut buf = Vec::with_capacity(8 + guard.len() * 14 + 4);
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.extend_from_slice(&(guard.len() as u32).to_le_bytes());
        for (cid, version) in guard.iter() {
            buf.extend_from_slice(&cid.as_raw().to_le_bytes());
            buf.extend_from_slice(&version.epoch.to_le_bytes());
            buf.extend_from_slice(&version.version.to_le_bytes());
        }
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    /// Loads a snapshot previously produced by [`Self::snapshot`].
    ///
    /// A corrupt snapshot is treated as empty, causing a full scan on next
    /// recovery rather than aborting startup.
    pub fn load_snapshot(epoch: u16, bytes: &[u8]) -> Self {
        match Self::try_load_snapshot(epoch, bytes) {
            Ok(store) => store,
            Err(_) => {
                tracing::warn!("version snapshot failed validation; starting from an empty store");
                Self::new(epoch)
            }
        }
    }

    fn try_load_snapshot(epoch: u16, bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad snapshot magic"));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let expected_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != expected_crc {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "snapshot crc mismatch"));
        }

        let count = u32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
        let mut map = HashMap::with_capacity(count);
        let mut pos = 8;
        for _ in 0..count {
            if pos + 14 > body.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated snapshot entry"));
            }
            let cid = ChunkId::from_raw(u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap()));
            let epoch = u16::from_le_bytes(body[pos + 8..pos + 10].try_into().unwrap());
            let version = u32::from_le_bytes(body[pos + 10..pos + 14].try_into().unwrap());
            map.insert(cid, Version { epoch, version });
            pos += 14;
        }

        Ok(Self {
            epoch,
            inner: Mutex::new(map),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_version_is_monotonic_per_chunk() {
        let store = VersionStore::new(0);
        let cid = ChunkId::new(1, 1);
        let v0 = store.next_version(cid);
        let v1 = store.next_version(cid);
        let v2 = store.next_version(cid);
        assert!(v0 < v1 && v1 < v2);
    }

    #[test]
    fn snapshot_roundtrips() {
        let store = VersionStore::new(2);
        let cid = ChunkId::new(9, 100);
        store.next_version(cid);
        store.next_version(cid);
        let bytes = store.snapshot();
        let restored = VersionStore::load_snapshot(2, &bytes);
        assert_eq!(restored.get(cid), store.get(cid));
    }

    #[test]
    fn corrupt_snapshot_loads_as_empty() {
        let restored = VersionStore::load_snapshot(0, b"not a snapshot");
        assert!(restored.is_empty());
    }

    #[test]
    fn tombstone_sets_invalid_version() {
        let store = VersionStore::new(0);
        let cid = ChunkId::new(1, 2);
        store.next_version(cid);
        store.tombstone(cid);
        assert!(store.get(cid).unwrap().is_tombstone());
    }
}

//! Secondary log: a segmented, append-structured file per `(owner, range)`,
//! with an in-memory version index and segment reorganisation.

pub mod recovery;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{instrument, trace};

use crate::error::SegmentError;
use crate::header::LogEntryHeader;
use crate::ids::{ChunkId, RangeKey, Version};
use crate::io_backend::DiskBackend;
use crate::version_store::VersionStore;

pub use recovery::{Chunk, RecoveryMetadata};

/// Lifecycle of a single segment, transitioned by writer appends,
/// invalidation, reorg scheduling, and reorg completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Empty,
    Open,
    Full,
    Invalidating,
    Reorganising,
}

struct SegmentMeta {
    state: SegmentState,
    /// Next free byte offset within the segment; entries are appended here.
    cursor: u32,
    used_bytes: u32,
    invalid_bytes: u32,
}

impl SegmentMeta {
    fn empty() -> Self {
        Self {
            state: SegmentState::Empty,
            cursor: 0,
            used_bytes: 0,
            invalid_bytes: 0,
        }
    }

    fn remaining(&self, segment_size: u32) -> u32 {
        segment_size.saturating_sub(self.cursor)
    }
}

#[derive(Clone, Copy)]
struct EntryLocation {
    segment_idx: usize,
    offset: u32,
    entry_size: u32,
}

/// Per-(owner,range) segmented log.
pub struct SecondaryLog {
    pub range: RangeKey,
    backend: Box<dyn DiskBackend>,
    segment_size: u32,
    num_segments: usize,
    segments: Mutex<Vec<SegmentMeta>>,
    /// Multiple writer threads may append concurrently (read side); the
    /// reorganisation thread takes the write side for the whole log.
    access_lock: RwLock<()>,
    index: Mutex<HashMap<ChunkId, EntryLocation>>,
    pub versions: Arc<VersionStore>,
    use_checksum: bool,
}

impl SecondaryLog {
    pub fn open(
        range: RangeKey,
        backend: Box<dyn DiskBackend>,
        segment_size: u32,
        capacity: u64,
        versions: Arc<VersionStore>,
        use_checksum: bool,
    ) -> Self {
        let num_segments = (capacity / segment_size as u64) as usize;
        let segments = (0..num_segments).map(|_| SegmentMeta::empty()).collect();
        Self {
            range,
            backend,
            segment_size,
            num_segments,
            segments: Mutex::new(segments),
            access_lock: RwLock::new(()),
            index: Mutex::new(HashMap::new()),
            versions,
            use_checksum,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn segment_offset(&self, segment_idx: usize) -> u64 {
        segment_idx as u64 * self.segment_size as u64
    }

    /// Picks the segment with the fewest used bytes that still fits `len`;
    /// ties broken by lowest index. Returns `None` (and schedules the most
    /// invalidated segment for reorg) if nothing fits.
    fn segment_for_insert(&self, len: usize, segments: &mut [SegmentMeta]) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (idx, seg) in segments.iter().enumerate() {
            if matches!(seg.state, SegmentState::Reorganising) {
                continue;
            }
            if seg.remaining(self.segment_size) >= len as u32 {
                match best {
                    Some((_, used)) if used <= seg.used_bytes => {}
                    _ => best = Some((idx, seg.used_bytes)),
                }
            }
        }

        if best.is_none() {
            if let Some((worst_idx, _)) = segments
                .iter()
                .enumerate()
                .filter(|(_, s)| !matches!(s.state, SegmentState::Reorganising))
                .max_by_key(|(_, s)| s.invalid_bytes)
            {
                segments[worst_idx].state = SegmentState::Invalidating;
            }
        }

        best.map(|(idx, _)| idx)
    }

    /// Appends one already-encoded secondary-format entry
    /// (`header || payload`) for `cid`/`version`. Takes the read side of
    /// the access lock so multiple ranges on the same physical device can
    /// write concurrently, while the reorganiser holds the write side.
    #[instrument(skip(self, entry), fields(range = %self.range, len = entry.len()))]
    pub fn append_segment(&self, entry: &[u8], cid: ChunkId, version: Version) -> Result<(), SegmentError> {
        let _guard = self.access_lock.read();
        let mut segments = self.segments.lock();
        self.append_segment_locked(entry, cid, version, &mut segments)
    }

    /// Core of [`Self::append_segment`], callable by [`Self::invalidate`]
    /// while it already holds the read side of `access_lock` (the lock
    /// isn't reentrant, so the guard must be shared rather than taken
    /// twice).
    fn append_segment_locked(
        &self,
        entry: &[u8],
        cid: ChunkId,
        version: Version,
        segments: &mut [SegmentMeta],
    ) -> Result<(), SegmentError> {
        let idx = self
            .segment_for_insert(entry.len(), segments)
            .ok_or(SegmentError::NoSpace {
                range: self.range,
                len: entry.len(),
            })?;

        let offset = segments[idx].cursor;
        if offset as u64 + entry.len() as u64 > self.segment_size as u64 {
            return Err(SegmentError::WouldStraddleBoundary {
                len: entry.len(),
                offset: offset as usize,
            });
        }

        let absolute = self.segment_offset(idx) + offset as u64;
        self.backend
            .write_at(entry, 0, absolute, entry.len(), 0)
            .map_err(|source| SegmentError::Io { range: self.range, source })?;

        segments[idx].cursor += entry.len() as u32;
        segments[idx].used_bytes += entry.len() as u32;
        segments[idx].state = if segments[idx].remaining(self.segment_size) == 0 {
            SegmentState::Full
        } else {
            SegmentState::Open
        };

        self.index.lock().insert(
            cid,
            EntryLocation {
                segment_idx: idx,
                offset,
                entry_size: entry.len() as u32,
            },
        );

        trace!(segment = idx, offset, "appended entry to secondary log");
        Ok(())
    }

    /// Marks `cid`'s current entry as invalidated and durably records the
    /// removal as a zero-length tombstone entry (version `INVALID_VERSION`),
    /// so a crash before the next reorg doesn't resurrect the removed chunk
    /// on recovery. A second call for an already-tombstoned `cid` is a
    /// no-op for disk state — the tombstone check happens before touching
    /// the index or writing anything.
    #[instrument(skip(self), fields(range = %self.range, %cid))]
    pub fn invalidate(&self, cid: ChunkId) -> Result<(), SegmentError> {
        let _guard = self.access_lock.read();

        if self.versions.get(cid).map(Version::is_tombstone).unwrap_or(false) {
            return Ok(());
        }

        let location = {
            let mut index = self.index.lock();
            index.remove(&cid)
        };
        if let Some(location) = location {
            let mut segments = self.segments.lock();
            let seg = &mut segments[location.segment_idx];
            seg.invalid_bytes = seg.invalid_bytes.saturating_add(location.entry_size);
        }

        self.versions.tombstone(cid);
        let tombstone_version = self.versions.get(cid).expect("just tombstoned");

        let mut header = LogEntryHeader::create(cid, 0, tombstone_version, 0, 0, 0, None);
        if self.use_checksum {
            header.add_checksum(&[]);
        }
        let mut buf = header.encode();
        // `index` has no meaning here (no segment has been read yet); reuse
        // `SegmentError::Header` since decoding what we just encoded can't
        // realistically fail.
        let offset = LogEntryHeader::convert_and_put(&mut buf)
            .map_err(|source| SegmentError::Header { index: usize::MAX, source })?;

        {
            let mut segments = self.segments.lock();
            self.append_segment_locked(&buf[offset..], cid, tombstone_version, &mut segments)?;
        }

        // Mark the segment that held the invalidated entry as a reorg
        // candidate now that it carries a dead byte, unless the tombstone
        // write above already pushed it elsewhere (Empty/Reorganising).
        if let Some(location) = location {
            let mut segments = self.segments.lock();
            let seg = &mut segments[location.segment_idx];
            if matches!(seg.state, SegmentState::Open | SegmentState::Full) {
                seg.state = SegmentState::Invalidating;
            }
        }

        Ok(())
    }

    /// Fraction of used bytes in `segment_idx` that are invalidated.
    pub fn invalidation_ratio(&self, segment_idx: usize) -> f32 {
        let segments = self.segments.lock();
        let seg = &segments[segment_idx];
        if seg.used_bytes == 0 {
            0.0
        } else {
            seg.invalid_bytes as f32 / seg.used_bytes as f32
        }
    }

    /// Segment with the highest invalidation ratio at or above `threshold`,
    /// if any.
    pub fn most_invalidated_segment_above(&self, threshold: f32) -> Option<usize> {
        let segments = self.segments.lock();
        segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.used_bytes > 0 && !matches!(s.state, SegmentState::Reorganising))
            .map(|(idx, s)| (idx, s.invalid_bytes as f32 / s.used_bytes as f32))
            .filter(|(_, ratio)| *ratio >= threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .map(|(idx, _)| idx)
    }

    pub fn used_bytes(&self, segment_idx: usize) -> u32 {
        self.segments.lock()[segment_idx].used_bytes
    }

    pub fn invalid_bytes(&self, segment_idx: usize) -> u32 {
        self.segments.lock()[segment_idx].invalid_bytes
    }

    /// Reads a full segment off disk.
    fn read_segment(&self, segment_idx: usize) -> Result<Vec<u8>, SegmentError> {
        let mut buf = vec![0u8; self.segment_size as usize];
        self.backend
            .read_at(&mut buf, self.segment_offset(segment_idx), self.segment_size as usize)
            .map_err(|source| SegmentError::Io { range: self.range, source })?;
        Ok(buf)
    }

    /// Reorganises one segment in place: reads it, discards tombstones and
    /// entries whose version is stale, rewrites survivors densely into a
    /// fresh segment buffer, and swaps.
    ///
    /// Takes the write side of the access lock, blocking writers to this log
    /// for the duration.
    #[instrument(skip(self), fields(range = %self.range, segment = segment_idx))]
    pub fn reorganise_segment(&self, segment_idx: usize) -> Result<u32, SegmentError> {
        let _guard = self.access_lock.write();
        {
            let mut segments = self.segments.lock();
            segments[segment_idx].state = SegmentState::Reorganising;
        }

        let raw = self.read_segment(segment_idx)?;
        let mut fresh = vec![0u8; self.segment_size as usize];
        let mut write_cursor = 0usize;
        let mut read_cursor = 0usize;
        let mut new_used = 0u32;
        let mut new_locations = Vec::new();

        while read_cursor < raw.len() && LogEntryHeader::is_readable(&raw[read_cursor..]) {
            let (header, header_len) = match LogEntryHeader::decode(&raw[read_cursor..]) {
                Ok(v) => v,
                Err(source) => {
                    return Err(SegmentError::Header {
                        index: segment_idx,
                        source,
                    })
                }
            };
            let entry_len = header_len + header.length as usize;
            let current_version = self.versions.get(header.chunk_id);
            let is_live = match current_version {
                Some(v) => !v.is_tombstone() && v == header.version,
                None => false,
            };

            if is_live {
                fresh[write_cursor..write_cursor + entry_len].copy_from_slice(&raw[read_cursor..read_cursor + entry_len]);
                new_locations.push((
                    header.chunk_id,
                    EntryLocation {
                        segment_idx,
                        offset: write_cursor as u32,
                        entry_size: entry_len as u32,
                    },
                ));
                write_cursor += entry_len;
                new_used += entry_len as u32;
            }
            read_cursor += entry_len;
        }

        self.backend
            .write_at(&fresh, 0, self.segment_offset(segment_idx), fresh.len(), 0)
            .map_err(|source| SegmentError::Io { range: self.range, source })?;

        let reclaimed = {
            let mut segments = self.segments.lock();
            let seg = &mut segments[segment_idx];
            let reclaimed = seg.used_bytes.saturating_sub(new_used);
            seg.used_bytes = new_used;
            seg.invalid_bytes = 0;
            seg.cursor = write_cursor as u32;
            seg.state = if new_used == 0 {
                SegmentState::Empty
            } else if seg.remaining(self.segment_size) == 0 {
                SegmentState::Full
            } else {
                SegmentState::Open
            };
            reclaimed
        };

        let mut index = self.index.lock();
        index.retain(|_, loc| loc.segment_idx != segment_idx);
        for (cid, loc) in new_locations {
            index.insert(cid, loc);
        }

        Ok(reclaimed)
    }

    /// Closes the backing file and deletes it, for `remove_backup_range`.
    pub fn close_and_remove(self) -> std::io::Result<()> {
        self.backend.close_and_remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_backend::BufferedBackend;

    fn open_test_log(dir: &std::path::Path, segment_size: u32, segments: u64) -> SecondaryLog {
        let path = dir.join("range.seclog");
        let backend = BufferedBackend::open(&path, segment_size as u64 * segments).unwrap();
        SecondaryLog::open(
            RangeKey::new(2, 0),
            Box::new(backend),
            segment_size,
            segment_size as u64 * segments,
            Arc::new(VersionStore::new(0)),
            true,
        )
    }

    fn encode_entry(cid: ChunkId, version: Version, payload: &[u8]) -> Vec<u8> {
        let mut header = LogEntryHeader::create(cid, payload.len() as u32, version, 0, 0, 0, None);
        header.add_checksum(payload);
        let mut bytes = header.encode();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn append_then_read_back_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_test_log(dir.path(), 4096, 4);
        let cid = ChunkId::new(2, 1);
        let version = log.versions.next_version(cid);
        let entry = encode_entry(cid, version, b"payload-bytes");
        log.append_segment(&entry, cid, version).unwrap();
        assert_eq!(log.used_bytes(0) as usize, entry.len());
    }

    #[test]
    fn invalidate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_test_log(dir.path(), 4096, 4);
        let cid = ChunkId::new(2, 1);
        let version = log.versions.next_version(cid);
        let entry = encode_entry(cid, version, b"abc");
        log.append_segment(&entry, cid, version).unwrap();

        log.invalidate(cid).unwrap();
        let after_first = log.invalid_bytes(0);
        log.invalidate(cid).unwrap();
        assert_eq!(log.invalid_bytes(0), after_first);
    }

    #[test]
    fn reorganisation_reclaims_space_at_thousand_entry_scale() {
        // 1,000 entries of 1 KiB, 800 of them invalidated, then a reorg at
        // threshold=0.60 should compact the containing segment down to
        // roughly the 200 survivors. One distinct chunk id per entry makes
        // "invalidate 800 of 1000" unambiguous.
        let dir = tempfile::tempdir().unwrap();
        let entry_payload = vec![0xABu8; 1024];
        let header_size = {
            let mut h = LogEntryHeader::create(ChunkId::new(5, 0), entry_payload.len() as u32, Version::ZERO, 0, 0, 0, None);
            h.add_checksum(&entry_payload);
            h.encoded_size()
        };
        let entry_size = (header_size + entry_payload.len()) as u64;
        // One segment sized to hold all 1,000 entries plus the 800
        // zero-payload tombstones `invalidate` durably appends for each
        // removed one, so they all land in segment 0 and a single reorg
        // call compacts everything.
        let segment_size = (entry_size * 1000 + header_size as u64 * 800) as u32;
        let log = open_test_log(dir.path(), segment_size, 1);

        let ids: Vec<ChunkId> = (0..1000u64).map(|i| ChunkId::new(5, i)).collect();
        for &cid in &ids {
            let version = log.versions.next_version(cid);
            let entry = encode_entry(cid, version, &entry_payload);
            log.append_segment(&entry, cid, version).unwrap();
        }
        for &cid in &ids[..800] {
            log.invalidate(cid).unwrap();
        }

        let used_before = log.used_bytes(0);
        assert!(log.invalidation_ratio(0) >= 0.60);
        assert_eq!(log.most_invalidated_segment_above(0.60), Some(0));

        let reclaimed = log.reorganise_segment(0).unwrap();
        assert!(reclaimed > 0);
        assert_eq!(log.invalid_bytes(0), 0);
        assert!(log.used_bytes(0) < used_before);

        let mut live = Vec::new();
        log.versions.for_all(|cid, version| {
            if !version.is_tombstone() {
                live.push(cid);
            }
        });
        assert_eq!(live.len(), 200);
    }

    #[test]
    fn reorganise_drops_invalidated_entries_and_keeps_live_ones() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_test_log(dir.path(), 4096, 4);

        let stale_cid = ChunkId::new(2, 1);
        let stale_version = log.versions.next_version(stale_cid);
        let stale_entry = encode_entry(stale_cid, stale_version, b"stale");
        log.append_segment(&stale_entry, stale_cid, stale_version).unwrap();
        log.invalidate(stale_cid).unwrap();

        let live_cid = ChunkId::new(2, 2);
        let live_version = log.versions.next_version(live_cid);
        let live_entry = encode_entry(live_cid, live_version, b"live-data");
        log.append_segment(&live_entry, live_cid, live_version).unwrap();

        let used_before = log.used_bytes(0);
        let reclaimed = log.reorganise_segment(0).unwrap();
        assert!(reclaimed > 0);
        assert_eq!(log.invalid_bytes(0), 0);
        assert!(log.used_bytes(0) < used_before);
    }
}

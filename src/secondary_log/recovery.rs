//! Recovery reader for a [`super::SecondaryLog`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::header::LogEntryHeader;
use crate::ids::{ChunkId, Version};
use crate::version_store::VersionStore;

use super::{EntryLocation, SecondaryLog, SegmentState};

/// One chunk recovered from a secondary log: its id, payload, and the
/// version it was written with.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub version: Version,
    pub payload: Vec<u8>,
}

/// Summary of a recovery pass: corrupt entries are skipped and counted
/// rather than aborting the whole range.
#[derive(Debug, Default, Clone)]
pub struct RecoveryMetadata {
    pub num_chunks: u64,
    pub num_tombstones: u64,
    pub bytes: u64,
    pub errors: Vec<String>,
}

impl SecondaryLog {
    /// Streams every segment, delivering `(chunk_id, payload, version)` for
    /// the highest version seen per chunk id to `chunk_sink`.
    ///
    /// A two-pass scan: the first pass rebuilds the version store from
    /// whatever's actually on disk (the durable snapshot may be stale or
    /// absent, in which case it's treated as empty and this full scan
    /// rebuilds it), then the second pass emits only the entries
    /// that are still the current version for their chunk id and restores
    /// this log's in-memory segment metadata and chunk index to match what
    /// the scan actually found — `open` always starts a log with empty
    /// segments, so without this a write issued right after recovery would
    /// silently overwrite recovered data starting at each segment's offset
    /// 0.
    pub fn recover(
        &self,
        versions: &Arc<VersionStore>,
        mut chunk_sink: impl FnMut(Chunk),
    ) -> RecoveryMetadata {
        let mut metadata = RecoveryMetadata::default();

        for segment_idx in 0..self.num_segments() {
            self.scan_segment_for_latest_versions(segment_idx, versions, &mut metadata);
        }

        for segment_idx in 0..self.num_segments() {
            self.scan_segment_emit_live(segment_idx, versions, &mut chunk_sink, &mut metadata);
        }

        metadata
    }

    fn scan_segment_for_latest_versions(
        &self,
        segment_idx: usize,
        versions: &Arc<VersionStore>,
        metadata: &mut RecoveryMetadata,
    ) {
        let raw = match self.read_segment(segment_idx) {
            Ok(raw) => raw,
            Err(e) => {
                metadata.errors.push(format!("segment {segment_idx}: {e}"));
                return;
            }
        };

        let mut cursor = 0usize;
        while cursor < raw.len() && LogEntryHeader::is_readable(&raw[cursor..]) {
            match LogEntryHeader::decode(&raw[cursor..]) {
                Ok((header, header_len)) => {
                    let entry_len = header_len + header.length as usize;
                    if cursor + entry_len > raw.len() {
                        metadata.errors.push(format!(
                            "segment {segment_idx}: entry at offset {cursor} claims {entry_len} bytes past segment end"
                        ));
                        break;
                    }
                    let payload = &raw[cursor + header_len..cursor + entry_len];
                    if header.verify_checksum(payload).is_err() {
                        metadata.errors.push(format!(
                            "segment {segment_idx}: checksum mismatch at offset {cursor}"
                        ));
                        warn!(segment = segment_idx, offset = cursor, "checksum mismatch during recovery scan");
                    } else {
                        let existing = versions.get(header.chunk_id);
                        if existing.map(|v| header.version > v).unwrap_or(true) {
                            versions.set(header.chunk_id, header.version);
                        }
                    }
                    cursor += entry_len;
                }
                Err(e) => {
                    metadata.errors.push(format!("segment {segment_idx}: header error at offset {cursor}: {e}"));
                    break;
                }
            }
        }
    }

    fn scan_segment_emit_live(
        &self,
        segment_idx: usize,
        versions: &Arc<VersionStore>,
        chunk_sink: &mut impl FnMut(Chunk),
        metadata: &mut RecoveryMetadata,
    ) {
        let raw = match self.read_segment(segment_idx) {
            Ok(raw) => raw,
            Err(_) => return, // already recorded as an error in the first pass
        };

        let mut new_index: HashMap<ChunkId, EntryLocation> = HashMap::new();
        let mut invalid_bytes = 0u32;

        let mut cursor = 0usize;
        while cursor < raw.len() && LogEntryHeader::is_readable(&raw[cursor..]) {
            let (header, header_len) = match LogEntryHeader::decode(&raw[cursor..]) {
                Ok(v) => v,
                Err(_) => break,
            };
            let entry_len = header_len + header.length as usize;
            if cursor + entry_len > raw.len() {
                break;
            }
            let payload = &raw[cursor + header_len..cursor + entry_len];

            let is_current = versions.get(header.chunk_id) == Some(header.version);
            if is_current && !header.version.is_tombstone() && header.verify_checksum(payload).is_ok() {
                new_index.insert(
                    header.chunk_id,
                    EntryLocation {
                        segment_idx,
                        offset: cursor as u32,
                        entry_size: entry_len as u32,
                    },
                );
            } else {
                invalid_bytes = invalid_bytes.saturating_add(entry_len as u32);
            }

            if is_current {
                if header.version.is_tombstone() {
                    metadata.num_tombstones += 1;
                } else if header.verify_checksum(payload).is_ok() {
                    metadata.num_chunks += 1;
                    metadata.bytes += payload.len() as u64;
                    chunk_sink(Chunk {
                        chunk_id: header.chunk_id,
                        version: header.version,
                        payload: payload.to_vec(),
                    });
                }
            }
            cursor += entry_len;
        }

        // `cursor` is the final scan position, which per this log's
        // cursor/used_bytes invariant equals both fields outside of a
        // mid-reorg transient state.
        {
            let mut segments = self.segments.lock();
            let seg = &mut segments[segment_idx];
            seg.cursor = cursor as u32;
            seg.used_bytes = cursor as u32;
            seg.invalid_bytes = invalid_bytes;
            seg.state = if cursor == 0 {
                SegmentState::Empty
            } else if seg.remaining(self.segment_size) == 0 {
                SegmentState::Full
            } else {
                SegmentState::Open
            };
        }
        self.index.lock().extend(new_index);
    }
}

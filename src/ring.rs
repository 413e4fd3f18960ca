//! Primary write buffer: a single fixed-capacity ring that every
//! `put_log_data` call appends encoded entries into, and that the
//! processing/sort stage drains from in order.
//!
//! One `write_ptr`/`read_ptr` pair of 31-bit modular counters (see
//! [`crate::seq`]) tracks occupancy, and a `parking_lot::Condvar` pair
//! blocks writers on space and the drain thread on data, generalized from
//! "one record at a time" to "one or more chained parts per call".

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::LogError;
use crate::header::{LogEntryHeader, MAX_CHAIN_COUNT};
use crate::ids::{ChunkId, RangeKey, Version};
use crate::seq::{seq_add, seq_diff};

/// One decoded entry pulled off the ring by [`PrimaryWriteBuffer::drain_pending`].
#[derive(Debug, Clone)]
pub struct DrainedEntry {
    pub header: LogEntryHeader,
    pub payload: Vec<u8>,
    pub range: RangeKey,
}

/// Result of one [`PrimaryWriteBuffer::drain_pending`] call: the entries
/// recovered, the set of ranges they belong to, and the number of bytes
/// the read pointer advanced by.
#[derive(Debug, Default)]
pub struct DrainBatch {
    pub entries: Vec<DrainedEntry>,
    pub contributing: HashSet<RangeKey>,
    pub bytes: u64,
}

impl DrainBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct RingState {
    buffer: Vec<u8>,
    write_ptr: u32,
    read_ptr: u32,
    range_size_map: HashMap<RangeKey, u64>,
    priority_flush: HashSet<RangeKey>,
}

/// Fixed-capacity ring of encoded primary-headed entries, shared between
/// every range's `put_log_data` callers and the single processing thread
/// that drains it.
pub struct PrimaryWriteBuffer {
    capacity: u32,
    small_buffer_pool_size: usize,
    use_checksum: bool,
    state: Mutex<RingState>,
    not_full: Condvar,
    not_empty: Condvar,
    closed: AtomicBool,
}

impl PrimaryWriteBuffer {
    pub fn new(capacity: u32) -> Self {
        Self::with_small_buffer_pool_size(capacity, crate::config::DEFAULT_SMALL_BUFFER_POOL_SIZE)
    }

    /// As [`Self::new`], but with an explicit cap on how many distinct
    /// ranges may have pending bytes at once. A `put_log_data` call for a range not
    /// already tracked blocks once this many ranges are already pending,
    /// rather than growing the map without bound.
    pub fn with_small_buffer_pool_size(capacity: u32, small_buffer_pool_size: usize) -> Self {
        Self::with_checksum_policy(capacity, small_buffer_pool_size, true)
    }

    /// As [`Self::with_small_buffer_pool_size`], with an explicit choice of
    /// whether entries get a checksum computed and verified at all.
    pub fn with_checksum_policy(capacity: u32, small_buffer_pool_size: usize, use_checksum: bool) -> Self {
        Self {
            capacity,
            small_buffer_pool_size,
            use_checksum,
            state: Mutex::new(RingState {
                buffer: vec![0u8; capacity as usize],
                write_ptr: 0,
                read_ptr: 0,
                range_size_map: HashMap::new(),
                priority_flush: HashSet::new(),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unblocks every pending `put_log_data`/`wait_for_work` caller with an
    /// error instead of more data.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Marks `range` for out-of-order priority flush, overriding the normal
    /// size-threshold classification on the next processing pass.
    pub fn request_priority_flush(&self, range: RangeKey) {
        self.state.lock().priority_flush.insert(range);
    }

    /// Drains and returns the set of ranges requested for priority flush
    /// since the last call.
    pub fn take_priority_flush(&self) -> HashSet<RangeKey> {
        std::mem::take(&mut self.state.lock().priority_flush)
    }

    /// Snapshot of bytes currently buffered per range, used by the
    /// processing stage to classify ranges as tentative-primary vs.
    /// secondary-direct.
    pub fn range_size_snapshot(&self) -> HashMap<RangeKey, u64> {
        self.state.lock().range_size_map.clone()
    }

    /// Appends `payload` for `chunk_id`, chaining it into multiple parts if
    /// it exceeds `max_entry_size`, blocking on a condvar until enough ring
    /// space frees up.
    #[allow(clippy::too_many_arguments)]
    pub fn put_log_data(
        &self,
        chunk_id: ChunkId,
        range: RangeKey,
        owner: u16,
        original_owner: u16,
        version: Version,
        payload: &[u8],
        timestamp: Option<u64>,
        max_entry_size: u32,
    ) -> Result<(), LogError> {
        if payload.is_empty() {
            return Err(LogError::InvalidArgument {
                message: "payload must not be empty".to_string(),
            });
        }

        let parts = split_entries(
            chunk_id,
            payload,
            version,
            range.range_id,
            owner,
            original_owner,
            timestamp,
            max_entry_size,
            self.use_checksum,
        )?;
        let total_len: usize = parts.iter().map(|p| p.len()).sum();
        if total_len as u64 > self.capacity as u64 {
            return Err(LogError::InvalidArgument {
                message: format!("entry of {total_len} bytes does not fit in a {}-byte ring", self.capacity),
            });
        }

        let mut guard = self.state.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(LogError::Shutdown);
            }
            let used = seq_diff(guard.write_ptr, guard.read_ptr) as u32;
            let free = self.capacity - used;
            let range_map_saturated = !guard.range_size_map.contains_key(&range)
                && guard.range_size_map.len() >= self.small_buffer_pool_size;
            if free >= total_len as u32 && !range_map_saturated {
                break;
            }
            // Ask the processing thread to drain every range currently
            // holding a slot, so one frees up for `range`.
            if range_map_saturated {
                for pending_range in guard.range_size_map.keys() {
                    guard.priority_flush.insert(*pending_range);
                }
            } else {
                guard.priority_flush.insert(range);
            }
            self.not_full.wait(&mut guard);
        }

        for part in &parts {
            write_wrapping(&mut guard.buffer, self.capacity, guard.write_ptr, part);
            guard.write_ptr = seq_add(guard.write_ptr, part.len() as u32);
        }
        *guard.range_size_map.entry(range).or_insert(0) += total_len as u64;

        drop(guard);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Blocks (up to `timeout`) until at least one byte is available to
    /// drain, or the buffer is closed. Returns whether there is data to
    /// drain.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut guard = self.state.lock();
        if seq_diff(guard.write_ptr, guard.read_ptr) > 0 {
            return true;
        }
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.not_empty.wait_for(&mut guard, timeout);
        seq_diff(guard.write_ptr, guard.read_ptr) > 0
    }

    /// Pulls up to `max_bytes` worth of complete entries off the front of
    /// the ring, advancing `read_ptr` only past what was fully parsed —
    /// a trailing, not-yet-fully-written entry is left for the next call.
    pub fn drain_pending(&self, max_bytes: u32) -> DrainBatch {
        let mut guard = self.state.lock();
        let available = seq_diff(guard.write_ptr, guard.read_ptr).max(0) as u32;
        let take = available.min(max_bytes);
        if take == 0 {
            return DrainBatch::default();
        }

        let raw = read_wrapping(&guard.buffer, self.capacity, guard.read_ptr, take as usize);
        let (parsed, consumed) = parse_entries(&raw);
        if consumed == 0 {
            return DrainBatch::default();
        }

        let mut entries = Vec::with_capacity(parsed.len());
        let mut contributing = HashSet::new();
        let mut per_range_bytes: HashMap<RangeKey, u64> = HashMap::new();
        for (header, payload_start, payload_end) in parsed {
            let range = RangeKey::new(
                header.owner.unwrap_or(0),
                header.range_id.unwrap_or(0),
            );
            let entry_len = (payload_end - payload_start) + header.encoded_size();
            *per_range_bytes.entry(range).or_insert(0) += entry_len as u64;
            contributing.insert(range);
            entries.push(DrainedEntry {
                payload: raw[payload_start..payload_end].to_vec(),
                header,
                range,
            });
        }

        guard.read_ptr = seq_add(guard.read_ptr, consumed as u32);
        for (range, consumed_bytes) in per_range_bytes {
            if let Some(remaining) = guard.range_size_map.get_mut(&range) {
                *remaining = remaining.saturating_sub(consumed_bytes);
                if *remaining == 0 {
                    guard.range_size_map.remove(&range);
                }
            }
        }

        drop(guard);
        self.not_full.notify_all();

        DrainBatch {
            entries,
            contributing,
            bytes: consumed as u64,
        }
    }
}

/// Splits `payload` into one or more primary-headed, checksummed parts no
/// larger than `max_entry_size`, chaining them together when more than one
/// part is required, capped at [`crate::header::MAX_CHAIN_COUNT`] parts.
#[allow(clippy::too_many_arguments)]
fn split_entries(
    chunk_id: ChunkId,
    payload: &[u8],
    version: Version,
    range_id: u16,
    owner: u16,
    original_owner: u16,
    timestamp: Option<u64>,
    max_entry_size: u32,
    use_checksum: bool,
) -> Result<Vec<Vec<u8>>, LogError> {
    let max = max_entry_size.max(1) as usize;
    let num_parts = ((payload.len() as u64 + max as u64 - 1) / max as u64).max(1) as usize;
    if num_parts > MAX_CHAIN_COUNT as usize {
        return Err(LogError::InvalidArgument {
            message: format!("payload requires {num_parts} chained parts, exceeding the {MAX_CHAIN_COUNT}-part maximum"),
        });
    }

    let mut out = Vec::with_capacity(num_parts);
    for (i, chunk) in payload.chunks(max).enumerate() {
        let mut header = LogEntryHeader::create(chunk_id, chunk.len() as u32, version, range_id, owner, original_owner, timestamp);
        if num_parts > 1 {
            header.add_chaining(i as u8, num_parts as u8)?;
        }
        if use_checksum {
            header.add_checksum(chunk);
        }
        let mut bytes = header.encode();
        bytes.extend_from_slice(chunk);
        out.push(bytes);
    }
    Ok(out)
}

/// Copies `src` into `buf` starting at the modular position `start`,
/// wrapping around the end of `buf` as needed.
fn write_wrapping(buf: &mut [u8], capacity: u32, start: u32, src: &[u8]) {
    let cap = capacity as usize;
    let start_idx = (start % capacity) as usize;
    let first_len = (cap - start_idx).min(src.len());
    buf[start_idx..start_idx + first_len].copy_from_slice(&src[..first_len]);
    if first_len < src.len() {
        let rest = &src[first_len..];
        buf[..rest.len()].copy_from_slice(rest);
    }
}

/// Linearizes `len` bytes starting at the modular position `start`.
fn read_wrapping(buf: &[u8], capacity: u32, start: u32, len: usize) -> Vec<u8> {
    let cap = capacity as usize;
    let start_idx = (start % capacity) as usize;
    let mut out = Vec::with_capacity(len);
    let first_len = (cap - start_idx).min(len);
    out.extend_from_slice(&buf[start_idx..start_idx + first_len]);
    if first_len < len {
        out.extend_from_slice(&buf[..len - first_len]);
    }
    out
}

/// Parses as many complete `(header, payload_start, payload_end)` entries
/// as fit in `raw`, stopping at the first truncated or undecodable header
/// rather than erroring — the remainder stays in the ring for the next
/// drain. Returns the parsed entries and the number of bytes consumed.
type ParsedEntry = (LogEntryHeader, usize, usize);

fn parse_entries(raw: &[u8]) -> (Vec<ParsedEntry>, usize) {
    let mut cursor = 0usize;
    let mut entries = Vec::new();
    while cursor < raw.len() && LogEntryHeader::is_readable(&raw[cursor..]) {
        match LogEntryHeader::decode(&raw[cursor..]) {
            Ok((header, header_len)) => {
                let entry_len = header_len + header.length as usize;
                if cursor + entry_len > raw.len() {
                    break;
                }
                entries.push((header, cursor + header_len, cursor + entry_len));
                cursor += entry_len;
            }
            Err(_) => break,
        }
    }
    (entries, cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_range() -> RangeKey {
        RangeKey::new(1, 0)
    }

    #[test]
    fn put_then_drain_roundtrips_single_entry() {
        let ring = PrimaryWriteBuffer::new(4096);
        let cid = ChunkId::new(1, 1);
        ring.put_log_data(cid, sample_range(), 1, 1, Version::ZERO, b"hello", None, 1024)
            .unwrap();

        let batch = ring.drain_pending(4096);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].payload, b"hello");
        assert_eq!(batch.entries[0].range, sample_range());
    }

    #[test]
    fn drain_leaves_trailing_partial_entry_for_next_call() {
        let ring = PrimaryWriteBuffer::new(4096);
        let cid = ChunkId::new(1, 1);
        ring.put_log_data(cid, sample_range(), 1, 1, Version::ZERO, b"first-entry", None, 1024)
            .unwrap();
        ring.put_log_data(cid, sample_range(), 1, 1, Version::ZERO, b"second-entry", None, 1024)
            .unwrap();

        // request fewer bytes than both entries need combined
        let first_header_len = ring.drain_pending(0).bytes; // no-op, sanity
        assert_eq!(first_header_len, 0);

        let partial = ring.drain_pending(50);
        assert_eq!(partial.entries.len(), 1);

        let rest = ring.drain_pending(4096);
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(rest.entries[0].payload, b"second-entry");
    }

    #[test]
    fn oversized_payload_is_chained_across_parts() {
        let ring = PrimaryWriteBuffer::new(1 << 20);
        let cid = ChunkId::new(1, 1);
        let payload = vec![7u8; 300];
        ring.put_log_data(cid, sample_range(), 1, 1, Version::ZERO, &payload, None, 128)
            .unwrap();

        let batch = ring.drain_pending(1 << 20);
        assert_eq!(batch.entries.len(), 3);
        assert_eq!(batch.entries[0].header.chain_count, 3);
        let reassembled: Vec<u8> = batch.entries.iter().flat_map(|e| e.payload.clone()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn put_log_data_after_close_returns_shutdown_error() {
        let ring = PrimaryWriteBuffer::new(4096);
        ring.close();
        let err = ring.put_log_data(ChunkId::new(1, 1), sample_range(), 1, 1, Version::ZERO, b"x", None, 1024);
        assert!(matches!(err, Err(LogError::Shutdown)));
    }

    #[test]
    fn small_buffer_pool_size_requests_priority_flush_once_saturated() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration as StdDuration;

        let ring = Arc::new(PrimaryWriteBuffer::with_small_buffer_pool_size(1 << 20, 2));
        let cid = ChunkId::new(1, 1);
        ring.put_log_data(cid, RangeKey::new(1, 0), 1, 1, Version::ZERO, b"a", None, 1024)
            .unwrap();
        ring.put_log_data(cid, RangeKey::new(1, 1), 1, 1, Version::ZERO, b"b", None, 1024)
            .unwrap();
        assert!(ring.take_priority_flush().is_empty());

        // A third, not-yet-tracked range pushes the pool past its cap: the
        // call blocks and marks the two currently-pending ranges for
        // priority flush instead of proceeding.
        let blocked_ring = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            blocked_ring
                .put_log_data(cid, RangeKey::new(1, 2), 1, 1, Version::ZERO, b"c", None, 1024)
                .unwrap();
        });

        thread::sleep(StdDuration::from_millis(50));
        let requested = ring.take_priority_flush();
        assert!(requested.contains(&RangeKey::new(1, 0)));
        assert!(requested.contains(&RangeKey::new(1, 1)));

        // Draining one range frees a slot and lets the blocked call through.
        ring.drain_pending(4096);
        handle.join().unwrap();
    }

    #[test]
    fn large_entry_chains_into_three_parts_with_expected_lengths() {
        // A payload just short of 3 full parts: payload_len = 3*max_entry_size-10.
        let max_entry_size = 128u32;
        let payload_len = 3 * max_entry_size as usize - 10;
        let ring = PrimaryWriteBuffer::new(1 << 20);
        let cid = ChunkId::from_raw(0x0003_0000_0000_002A);
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 256) as u8).collect();
        ring.put_log_data(cid, sample_range(), 3, 3, Version::ZERO, &payload, None, max_entry_size)
            .unwrap();

        let batch = ring.drain_pending(1 << 20);
        assert_eq!(batch.entries.len(), 3);
        for entry in &batch.entries {
            assert_eq!(entry.header.chain_count, 3);
            assert!((0..3).contains(&entry.header.chain_id));
            assert_eq!(entry.header.chunk_id, cid);
        }
        assert_eq!(batch.entries[0].payload.len(), max_entry_size as usize);
        assert_eq!(batch.entries[1].payload.len(), max_entry_size as usize);
        assert_eq!(batch.entries[2].payload.len(), payload_len - 2 * max_entry_size as usize);

        let reassembled: Vec<u8> = batch.entries.iter().flat_map(|e| e.payload.clone()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn header_spanning_ring_wraparound_is_never_observed_torn() {
        // Force write_ptr close to the physical end so the
        // header itself straddles the wrap point, then confirm the drain
        // side still parses a complete, correct header and payload.
        //
        // A single-part header here (range_id + owner + original_owner +
        // checksum present, no timestamp/chaining, 2-byte length varint for
        // a payload this size) encodes to 27 bytes; a 483-byte filler
        // payload's entry therefore lands write_ptr exactly 2 bytes short of
        // this 512-byte ring's physical end.
        let capacity = 512u32;
        let ring = PrimaryWriteBuffer::new(capacity);
        let cid = ChunkId::new(1, 1);

        let filler = vec![9u8; 483];
        ring.put_log_data(cid, sample_range(), 1, 1, Version::ZERO, &filler, None, 4096)
            .unwrap();
        ring.drain_pending(1 << 20);

        let payload = vec![7u8; 200];
        ring.put_log_data(cid, sample_range(), 1, 1, Version::ZERO, &payload, None, 4096)
            .unwrap();

        let batch = ring.drain_pending(1 << 20);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].header.chunk_id, cid);
        assert_eq!(batch.entries[0].payload, payload);
    }

    #[test]
    fn range_size_snapshot_reflects_buffered_and_drained_bytes() {
        let ring = PrimaryWriteBuffer::new(4096);
        let cid = ChunkId::new(1, 1);
        ring.put_log_data(cid, sample_range(), 1, 1, Version::ZERO, b"payload", None, 1024)
            .unwrap();
        assert!(ring.range_size_snapshot().contains_key(&sample_range()));

        ring.drain_pending(4096);
        assert!(!ring.range_size_snapshot().contains_key(&sample_range()));
    }
}

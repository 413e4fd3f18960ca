//! Sort-and-dispatch stage: the single thread that drains the primary
//! write buffer, decides per entry whether it also gets a fast-path
//! primary-log copy, and hands work off to the
//! [`crate::writer_pool::WriterPool`].
//!
//! Every drained entry is converted to secondary framing in place
//! ([`crate::header::LogEntryHeader::convert_and_put`]) and then routed one
//! of two ways, decided from the range-size snapshot taken at the start of
//! the pass:
//! - "secondary-direct" (priority-flushed, or already at/over
//!   `secondary_log_buffer_size`): the converted bytes skip the coalescing
//!   buffer and are submitted as their own job straight to the writer
//!   pool's secondary-log queue. Any bytes already sitting in that range's
//!   [`crate::secondary_log_buffer::SecondaryLogBuffer`] are flushed first,
//!   so ordering into the secondary log is preserved.
//! - "tentative-primary": coalesced through the range's
//!   `SecondaryLogBuffer` as usual, and (when `two_level_logging` is on)
//!   also duplicated in primary format into this pass's primary-log batch,
//!   so the data has a second, faster durable copy while its secondary
//!   buffer is still filling.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, trace};

use crate::error::LogError;
use crate::header::LogEntryHeader;
use crate::ids::RangeKey;
use crate::metrics::MetricsSink;
use crate::primary_log::PrimaryLog;
use crate::registry::SecondaryLogRegistry;
use crate::ring::{DrainedEntry, PrimaryWriteBuffer};
use crate::writer_pool::{PrimaryJob, SecondaryJob, WriterPool};

pub struct ProcessingStage {
    ring: Arc<PrimaryWriteBuffer>,
    registry: Arc<SecondaryLogRegistry>,
    primary_log: Arc<PrimaryLog>,
    writer_pool: Arc<WriterPool>,
    secondary_threshold: u64,
    flushed_ranges: Arc<parking_lot::Mutex<HashSet<RangeKey>>>,
    metrics: Arc<dyn MetricsSink>,
    max_drain_bytes: u32,
    two_level_logging: bool,
}

impl ProcessingStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: Arc<PrimaryWriteBuffer>,
        registry: Arc<SecondaryLogRegistry>,
        primary_log: Arc<PrimaryLog>,
        writer_pool: Arc<WriterPool>,
        flushed_ranges: Arc<parking_lot::Mutex<HashSet<RangeKey>>>,
        secondary_threshold: u64,
        max_drain_bytes: u32,
        metrics: Arc<dyn MetricsSink>,
        two_level_logging: bool,
    ) -> Self {
        Self {
            ring,
            registry,
            primary_log,
            writer_pool,
            secondary_threshold,
            flushed_ranges,
            metrics,
            max_drain_bytes,
            two_level_logging,
        }
    }

    /// Blocks until the ring has work (or is closed), then runs one pass.
    /// Returns `false` once the ring is closed and drained, signalling the
    /// caller's loop to stop.
    pub fn run_once(&self, poll_timeout: Duration) -> bool {
        if !self.ring.wait_for_work(poll_timeout) {
            if self.ring.is_closed() {
                return self.drain_remaining();
            }
            return true;
        }
        self.drain_remaining()
    }

    fn drain_remaining(&self) -> bool {
        loop {
            // Snapshot sizes and steal priority-flush requests before
            // draining, so classification reflects what was actually
            // buffered going into this pass rather than what's left after.
            let range_sizes = self.ring.range_size_snapshot();
            let priority = self.ring.take_priority_flush();

            let batch = self.ring.drain_pending(self.max_drain_bytes);
            if batch.is_empty() {
                return !self.ring.is_closed();
            }
            self.dispatch_batch(batch.entries, batch.contributing, range_sizes, priority);
        }
    }

    /// One full classify-and-dispatch pass over a drained batch.
    ///
    /// Every entry is converted to secondary framing, then either submitted
    /// straight to the writer pool (secondary-direct) or coalesced through
    /// its range's buffer (tentative-primary); see the module doc for the
    /// classification rule.
    #[instrument(skip(self, entries, range_sizes, priority))]
    fn dispatch_batch(
        &self,
        entries: Vec<DrainedEntry>,
        _contributing: HashSet<RangeKey>,
        range_sizes: HashMap<RangeKey, u64>,
        priority: HashSet<RangeKey>,
    ) {
        let mut primary_batch = Vec::new();
        let mut primary_contributing = Vec::new();

        for entry in entries {
            let is_priority = priority.contains(&entry.range);
            let is_secondary_direct =
                is_priority || range_sizes.get(&entry.range).copied().unwrap_or(0) >= self.secondary_threshold;

            let Some(converted) = self.convert_to_secondary_framing(&entry) else {
                continue;
            };

            if is_secondary_direct {
                // Anything already coalescing for this range has to reach
                // the secondary log first so the direct write lands after
                // it, not before.
                self.flush_range_buffer(entry.range);
                let _ = self.writer_pool.submit_secondary(SecondaryJob {
                    range: entry.range,
                    bytes: converted,
                });
            } else {
                if self.two_level_logging {
                    append_primary_encoded(&mut primary_batch, &entry);
                    primary_contributing.push(entry.range);
                }
                self.buffer_for_secondary(entry.range, &converted);
            }
        }

        if !primary_batch.is_empty() {
            self.metrics.record_bytes_ingested(primary_batch.len() as u64);
            let _ = self.writer_pool.submit_primary(PrimaryJob {
                batch: primary_batch,
                contributing: primary_contributing,
            });
        }

        self.primary_log.rotate_if_ready(&self.flushed_ranges.lock());
    }

    /// Re-encodes a drained entry's header and payload into secondary-log
    /// framing. Returns `None` (after recording the corruption) if the
    /// range is unknown or the conversion itself fails.
    fn convert_to_secondary_framing(&self, entry: &DrainedEntry) -> Option<Vec<u8>> {
        if self.registry.get(entry.range).is_none() {
            self.metrics.record_corruption("unknown_range");
            return None;
        }

        let mut buf = entry.header.encode();
        buf.extend_from_slice(&entry.payload);
        let offset = match LogEntryHeader::convert_and_put(&mut buf) {
            Ok(offset) => offset,
            Err(_) => {
                self.metrics.record_corruption("convert_failed");
                return None;
            }
        };
        buf.drain(..offset);
        Some(buf)
    }

    fn buffer_for_secondary(&self, range: RangeKey, converted: &[u8]) {
        let Some(range_entry) = self.registry.get(range) else {
            return;
        };
        let flushed = range_entry.buffer.lock().buffer_data(converted);
        if let Some(bytes) = flushed {
            let _ = self.writer_pool.submit_secondary(SecondaryJob { range, bytes });
        }
    }

    fn flush_range_buffer(&self, range: RangeKey) {
        let Some(range_entry) = self.registry.get(range) else {
            return;
        };
        let flushed = range_entry.buffer.lock().flush();
        if let Some(bytes) = flushed {
            let _ = self.writer_pool.submit_secondary(SecondaryJob { range, bytes });
        }
    }

    /// Force-flushes every registered range's coalescing buffer, regardless
    /// of whether it was touched by the most recent pass. Used by
    /// [`crate::subsystem::LogSubsystem::flush_data_to_secondary_logs`] to
    /// guarantee no buffered bytes are left stranded when the caller wants a
    /// synchronous flush.
    pub fn flush_all_range_buffers(&self) {
        for range in self.registry.ranges() {
            self.flush_range_buffer(range);
        }
    }
}

fn append_primary_encoded(batch: &mut Vec<u8>, entry: &DrainedEntry) {
    let header_bytes = entry.header.encode();
    batch.extend_from_slice(&header_bytes);
    batch.extend_from_slice(&entry.payload);
    trace!(range = %entry.range, len = entry.payload.len(), "kept entry in primary batch");
}

/// Runs [`ProcessingStage::run_once`] in a loop until the ring closes and
/// fully drains, for use as the body of the subsystem's processing thread.
pub fn run_loop(stage: &ProcessingStage, poll_timeout: Duration, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        if !stage.run_once(poll_timeout) {
            break;
        }
    }
}

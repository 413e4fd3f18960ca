//! Writer pool: one bounded job queue and consumer thread per disk
//! destination, decoupling the processing stage's dispatch pass from the
//! latency of the actual write.
//!
//! A job enqueued for the secondary-log consumer carries raw,
//! already-secondary-framed bytes rather than a single `(chunk_id,
//! version)` pair: the processing stage may have coalesced several
//! logical entries into one [`crate::secondary_log_buffer::SecondaryLogBuffer`]
//! flush, so the consumer re-parses the blob to append each entry to the
//! right place in the index.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::header::LogEntryHeader;
use crate::ids::RangeKey;
use crate::metrics::MetricsSink;
use crate::primary_log::PrimaryLog;
use crate::registry::SecondaryLogRegistry;

/// One coalesced flush destined for a single range's secondary log.
pub struct SecondaryJob {
    pub range: RangeKey,
    pub bytes: Vec<u8>,
}

/// One batch destined for the primary log.
pub struct PrimaryJob {
    pub batch: Vec<u8>,
    pub contributing: Vec<RangeKey>,
}

/// Bounded job queues plus their consumer threads: one queue and one
/// thread per writer kind.
pub struct WriterPool {
    secondary_queue: Arc<ArrayQueue<SecondaryJob>>,
    primary_queue: Arc<ArrayQueue<PrimaryJob>>,
    shutdown: Arc<AtomicBool>,
    secondary_thread: Mutex<Option<JoinHandle<()>>>,
    primary_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriterPool {
    pub fn new(
        registry: Arc<SecondaryLogRegistry>,
        primary_log: Arc<PrimaryLog>,
        flushed_ranges: Arc<Mutex<HashSet<RangeKey>>>,
        metrics: Arc<dyn MetricsSink>,
        queue_capacity: usize,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let secondary_queue = Arc::new(ArrayQueue::new(queue_capacity));
        let primary_queue = Arc::new(ArrayQueue::new(queue_capacity));
        let shutdown = Arc::new(AtomicBool::new(false));

        let secondary_thread = {
            let queue = Arc::clone(&secondary_queue);
            let shutdown = Arc::clone(&shutdown);
            let registry = Arc::clone(&registry);
            let metrics = Arc::clone(&metrics);
            let flushed_ranges = Arc::clone(&flushed_ranges);
            thread::Builder::new()
                .name("peerlog-secondary-writer".to_string())
                .spawn(move || run_secondary_consumer(queue, shutdown, registry, flushed_ranges, metrics, poll_interval))
                .expect("failed to spawn secondary writer thread")
        };

        let primary_thread = {
            let queue = Arc::clone(&primary_queue);
            let shutdown = Arc::clone(&shutdown);
            let metrics = Arc::clone(&metrics);
            thread::Builder::new()
                .name("peerlog-primary-writer".to_string())
                .spawn(move || run_primary_consumer(queue, shutdown, primary_log, metrics, poll_interval))
                .expect("failed to spawn primary writer thread")
        };

        Arc::new(Self {
            secondary_queue,
            primary_queue,
            shutdown,
            secondary_thread: Mutex::new(Some(secondary_thread)),
            primary_thread: Mutex::new(Some(primary_thread)),
        })
    }

    /// Enqueues a secondary-log job, spinning with a short sleep while the
    /// bounded queue is full.
    pub fn submit_secondary(&self, mut job: SecondaryJob) -> Result<(), SecondaryJob> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(job);
            }
            match self.secondary_queue.push(job) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    job = returned;
                    thread::sleep(Duration::from_micros(100));
                }
            }
        }
    }

    /// Enqueues a primary-log job, same backpressure policy as
    /// [`Self::submit_secondary`].
    pub fn submit_primary(&self, mut job: PrimaryJob) -> Result<(), PrimaryJob> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(job);
            }
            match self.primary_queue.push(job) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    job = returned;
                    thread::sleep(Duration::from_micros(100));
                }
            }
        }
    }

    pub fn pending_secondary(&self) -> usize {
        self.secondary_queue.len()
    }

    pub fn pending_primary(&self) -> usize {
        self.primary_queue.len()
    }

    /// Signals both consumer threads to drain their queues and stop, then
    /// joins them. Takes `&self` (rather than `&mut self`) so the pool can
    /// be held as a plain `Arc<WriterPool>` by [`crate::subsystem::LogSubsystem`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.secondary_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.primary_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_secondary_consumer(
    queue: Arc<ArrayQueue<SecondaryJob>>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<SecondaryLogRegistry>,
    flushed_ranges: Arc<Mutex<HashSet<RangeKey>>>,
    metrics: Arc<dyn MetricsSink>,
    poll_interval: Duration,
) {
    loop {
        match queue.pop() {
            Some(job) => {
                apply_secondary_job(&job, &registry, &metrics);
                flushed_ranges.lock().insert(job.range);
            }
            None => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(poll_interval);
            }
        }
    }
}

/// Re-parses the coalesced blob and appends each complete entry to its
/// range's secondary log. A truncated trailing entry (shouldn't happen for
/// a buffer flush produced by `SecondaryLogBuffer`, but guarded against
/// regardless) is counted as corruption and the rest of the job is
/// dropped rather than retried.
fn apply_secondary_job(job: &SecondaryJob, registry: &SecondaryLogRegistry, metrics: &Arc<dyn MetricsSink>) {
    let Some(entry) = registry.get(job.range) else {
        warn!(range = %job.range, "secondary job for unknown range; dropping");
        metrics.record_corruption("unknown_range");
        return;
    };

    let mut cursor = 0usize;
    while cursor < job.bytes.len() && LogEntryHeader::is_readable(&job.bytes[cursor..]) {
        let (header, header_len) = match LogEntryHeader::decode(&job.bytes[cursor..]) {
            Ok(v) => v,
            Err(_) => {
                metrics.record_corruption("header_decode");
                break;
            }
        };
        let entry_len = header_len + header.length as usize;
        if cursor + entry_len > job.bytes.len() {
            metrics.record_corruption("truncated_entry");
            break;
        }

        if let Err(e) = entry
            .log
            .append_segment(&job.bytes[cursor..cursor + entry_len], header.chunk_id, header.version)
        {
            error!(range = %job.range, error = %e, "failed to append to secondary log");
            metrics.record_corruption("append_failed");
            break;
        }
        metrics.record_bytes_flushed_secondary(entry_len as u64);
        cursor += entry_len;
    }
}

fn run_primary_consumer(
    queue: Arc<ArrayQueue<PrimaryJob>>,
    shutdown: Arc<AtomicBool>,
    primary_log: Arc<PrimaryLog>,
    metrics: Arc<dyn MetricsSink>,
    poll_interval: Duration,
) {
    loop {
        match queue.pop() {
            Some(job) => {
                if job.batch.is_empty() {
                    continue;
                }
                let mut attempts = 0;
                loop {
                    match primary_log.append_batch(&job.batch, &job.contributing) {
                        Ok(()) => {
                            metrics.record_bytes_flushed_primary(job.batch.len() as u64);
                            break;
                        }
                        Err(e) => {
                            attempts += 1;
                            if attempts >= 10 {
                                error!(error = %e, "giving up on primary log batch after repeated failures");
                                metrics.record_corruption("primary_write_failed");
                                break;
                            }
                            thread::sleep(poll_interval);
                        }
                    }
                }
            }
            None => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ids::{ChunkId, Version};
    use crate::io_backend::BufferedBackend;
    use crate::metrics::NullMetricsSink;
    use crate::registry::DirectoryBackendFactory;

    fn encode_secondary_entry(cid: ChunkId, version: Version, payload: &[u8]) -> Vec<u8> {
        let mut header = LogEntryHeader::create(cid, payload.len() as u32, version, 0, 0, 0, None);
        header.add_checksum(payload);
        let mut buf = header.encode();
        buf.extend_from_slice(payload);
        let offset = LogEntryHeader::convert_and_put(&mut buf).unwrap();
        buf[offset..].to_vec()
    }

    #[test]
    fn writer_pool_applies_secondary_job_and_marks_range_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder()
            .backup_range_size(4096 * 2)
            .log_segment_size(4096)
            .build()
            .unwrap();
        let registry = Arc::new(SecondaryLogRegistry::new(
            Box::new(DirectoryBackendFactory::new(dir.path().to_path_buf(), config.clone())),
            config.clone(),
            0,
        ));
        let range = RangeKey::new(1, 0);
        let entry = registry.init_backup_range(range).unwrap();

        let primary_backend = BufferedBackend::open(&dir.path().join("p.log"), 4096).unwrap();
        let primary_log = Arc::new(PrimaryLog::open(Box::new(primary_backend), 4096));
        let flushed_ranges = Arc::new(Mutex::new(HashSet::new()));
        let metrics = NullMetricsSink;
        let metrics: Arc<dyn MetricsSink> = Arc::new(metrics);

        let pool = WriterPool::new(
            Arc::clone(&registry),
            Arc::clone(&primary_log),
            Arc::clone(&flushed_ranges),
            metrics,
            16,
            Duration::from_millis(1),
        );

        let cid = ChunkId::new(1, 1);
        let version = entry.versions.next_version(cid);
        let bytes = encode_secondary_entry(cid, version, b"hello");
        pool.submit_secondary(SecondaryJob { range, bytes }).unwrap();

        // Give the consumer thread a moment to drain the queue.
        let mut waited = Duration::ZERO;
        while flushed_ranges.lock().is_empty() && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }

        assert!(flushed_ranges.lock().contains(&range));
        pool.shutdown();
    }
}

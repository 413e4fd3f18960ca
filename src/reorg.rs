//! Reorganisation thread: periodically scans every backup range's
//! secondary log for a segment whose invalidated fraction clears
//! `reorg_utilisation_threshold` and compacts it.
//!
//! A plain round-robin sweep over
//! [`crate::registry::SecondaryLogRegistry::ranges`] — with as many ranges
//! as a node hosts, round-robin already gives every range a bounded wait
//! before its turn, and `most_invalidated_segment_above` means the thread
//! only ever does work where it's actually warranted. See DESIGN.md for
//! the tradeoff this drops (explicit priority ordering across ranges with
//! very different churn rates).
//!
//! Each pass reorganises at most one segment per range before moving on,
//! and since [`crate::secondary_log::SecondaryLog::reorganise_segment`]
//! takes and releases its log's access lock per call, writers are never
//! blocked for longer than a single segment's compaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{instrument, trace, warn};

use crate::metrics::MetricsSink;
use crate::registry::SecondaryLogRegistry;

pub struct ReorgThread {
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReorgThread {
    pub fn spawn(
        registry: Arc<SecondaryLogRegistry>,
        threshold: f32,
        poll_interval: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("peerlog-reorg".to_string())
                .spawn(move || run(registry, threshold, poll_interval, shutdown, metrics))
                .expect("failed to spawn reorg thread")
        };
        Arc::new(Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signals the thread to stop after its current pass and joins it.
    /// Takes `&self` so [`crate::subsystem::LogSubsystem`] can hold this as
    /// a plain `Arc<ReorgThread>`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[instrument(skip(registry, metrics))]
fn run(
    registry: Arc<SecondaryLogRegistry>,
    threshold: f32,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<dyn MetricsSink>,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let ranges = registry.ranges();
        for range in ranges {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            let Some(entry) = registry.get(range) else {
                continue;
            };
            let Some(segment_idx) = entry.log.most_invalidated_segment_above(threshold) else {
                continue;
            };
            match entry.log.reorganise_segment(segment_idx) {
                Ok(reclaimed) => {
                    trace!(%range, segment = segment_idx, reclaimed, "reorganised segment");
                    metrics.record_segment_reorganised(reclaimed as u64);
                }
                Err(e) => {
                    warn!(%range, segment = segment_idx, error = %e, "segment reorganisation failed");
                }
            }
        }

        thread::sleep(poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::header::LogEntryHeader;
    use crate::ids::{ChunkId, RangeKey};
    use crate::metrics::NullMetricsSink;
    use crate::registry::DirectoryBackendFactory;

    fn encode_entry(cid: ChunkId, version: crate::ids::Version, payload: &[u8]) -> Vec<u8> {
        let mut header = LogEntryHeader::create(cid, payload.len() as u32, version, 0, 0, 0, None);
        header.add_checksum(payload);
        let mut bytes = header.encode();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn reorg_thread_reclaims_invalidated_segment() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder()
            .backup_range_size(4096 * 2)
            .log_segment_size(4096)
            .reorg_utilisation_threshold(0.3)
            .build()
            .unwrap();
        let registry = Arc::new(SecondaryLogRegistry::new(
            Box::new(DirectoryBackendFactory::new(dir.path().to_path_buf(), config.clone())),
            config.clone(),
            0,
        ));
        let range = RangeKey::new(1, 0);
        let entry = registry.init_backup_range(range).unwrap();

        let stale_cid = ChunkId::new(1, 1);
        let v0 = entry.versions.next_version(stale_cid);
        entry.log.append_segment(&encode_entry(stale_cid, v0, b"stale-data"), stale_cid, v0).unwrap();
        entry.log.invalidate(stale_cid).unwrap();

        let metrics = Arc::new(NullMetricsSink);
        let reorg = ReorgThread::spawn(Arc::clone(&registry), 0.3, Duration::from_millis(5), metrics);

        let mut waited = Duration::ZERO;
        while entry.log.invalid_bytes(0) > 0 && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }

        assert_eq!(entry.log.invalid_bytes(0), 0);
        reorg.shutdown();
    }
}

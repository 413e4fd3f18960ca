//! The logging subsystem facade: wires the primary write buffer,
//! sort-and-dispatch stage, writer pool, secondary log registry, and
//! reorganisation thread together behind the external interface the chunk
//! component calls. Owns a ring, a registry of per-range secondary logs, a
//! shared primary log, a writer pool, a reorg thread, and the processing
//! thread that ties them together.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::LogError;
use crate::ids::{ChunkId, RangeKey};
use crate::io_backend::{BufferedBackend, DiskBackend};
use crate::metrics::MetricsSink;
use crate::primary_log::PrimaryLog;
use crate::processing::{run_loop, ProcessingStage};
use crate::registry::{BackendFactory, SecondaryLogRegistry};
use crate::reorg::ReorgThread;
use crate::secondary_log::{Chunk, RecoveryMetadata, SecondaryLog};
use crate::version_store::VersionStore;
use crate::writer_pool::WriterPool;

/// Bound on each writer-pool job queue. Not separately configurable; the
/// processing thread backs off long before this would matter in practice.
const WRITER_QUEUE_CAPACITY: usize = 256;

/// Outbound collaborator: receives chunks recovered from a secondary log
/// so the chunk component can reinsert them into the live object store.
pub trait ChunkSink: Send + Sync {
    fn put_recovered_chunks(&self, chunks: &[Chunk]);
}

/// A [`ChunkSink`] that drops everything; useful when recovery metadata
/// alone is wanted (tests, `recover_backup_range_from_file`'s exploratory
/// callers).
pub struct NullChunkSink;

impl ChunkSink for NullChunkSink {
    fn put_recovered_chunks(&self, _chunks: &[Chunk]) {}
}

/// Top-level handle for one node's peer-side durable logging subsystem.
pub struct LogSubsystem {
    config: Config,
    epoch: u16,
    ring: Arc<crate::ring::PrimaryWriteBuffer>,
    registry: Arc<SecondaryLogRegistry>,
    primary_log: Arc<PrimaryLog>,
    writer_pool: Arc<WriterPool>,
    reorg: Arc<ReorgThread>,
    processing: Arc<ProcessingStage>,
    processing_stop: Arc<AtomicBool>,
    processing_thread: Mutex<Option<JoinHandle<()>>>,
    flush_lock: Mutex<()>,
    chunk_sink: Arc<dyn ChunkSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl LogSubsystem {
    /// Builds and starts every background thread (processing, writer pool,
    /// reorganiser). `range_factory` opens the backend for each backup
    /// range's secondary log; `primary_backend` is the already-opened
    /// backend for the single shared primary log file.
    #[instrument(skip(config, range_factory, primary_backend, chunk_sink, metrics))]
    pub fn new(
        config: Config,
        range_factory: Box<dyn BackendFactory>,
        primary_backend: Box<dyn DiskBackend>,
        epoch: u16,
        chunk_sink: Arc<dyn ChunkSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let registry = Arc::new(SecondaryLogRegistry::new(range_factory, config.clone(), epoch));
        let primary_log = Arc::new(PrimaryLog::open(primary_backend, config.primary_log_size));
        let ring = Arc::new(crate::ring::PrimaryWriteBuffer::with_checksum_policy(
            config.write_buffer_size,
            config.small_buffer_pool_size,
            config.use_checksum,
        ));
        let flushed_ranges = Arc::new(Mutex::new(std::collections::HashSet::new()));

        let poll_interval = Duration::from_millis(config.processthread_timeout_ms);

        let writer_pool = WriterPool::new(
            Arc::clone(&registry),
            Arc::clone(&primary_log),
            Arc::clone(&flushed_ranges),
            Arc::clone(&metrics),
            WRITER_QUEUE_CAPACITY,
            poll_interval,
        );

        let reorg = ReorgThread::spawn(
            Arc::clone(&registry),
            config.reorg_utilisation_threshold,
            poll_interval,
            Arc::clone(&metrics),
        );

        // Ranges whose buffered bytes already fill a whole coalescing
        // buffer get no benefit from further coalescing, so they route
        // straight to their secondary log instead of detouring through the
        // shared primary log.
        let secondary_threshold = config.secondary_log_buffer_size as u64;
        let processing = Arc::new(ProcessingStage::new(
            Arc::clone(&ring),
            Arc::clone(&registry),
            Arc::clone(&primary_log),
            Arc::clone(&writer_pool),
            flushed_ranges,
            secondary_threshold,
            config.write_buffer_size,
            Arc::clone(&metrics),
            config.two_level_logging,
        ));

        let processing_stop = Arc::new(AtomicBool::new(false));
        let processing_thread = {
            let processing = Arc::clone(&processing);
            let processing_stop = Arc::clone(&processing_stop);
            thread::Builder::new()
                .name("peerlog-processing".to_string())
                .spawn(move || run_loop(&processing, poll_interval, &processing_stop))
                .expect("failed to spawn processing thread")
        };

        Arc::new(Self {
            config,
            epoch,
            ring,
            registry,
            primary_log,
            writer_pool,
            reorg,
            processing,
            processing_stop,
            processing_thread: Mutex::new(Some(processing_thread)),
            flush_lock: Mutex::new(()),
            chunk_sink,
            metrics,
        })
    }

    /// Creates a brand-new backup range. Idempotent: a second call for a
    /// range that already exists is a no-op.
    pub fn init_backup_range(&self, owner: u16, range_id: u16) -> Result<(), LogError> {
        let range = RangeKey::new(owner, range_id);
        if self.registry.get(range).is_some() {
            return Ok(());
        }
        self.registry.init_backup_range(range)?;
        Ok(())
    }

    /// Creates or takes over a backup range being transferred from another
    /// peer. Chunk migration transport is out of scope; this assumes that
    /// when `is_new_peer` is false, the backing storage
    /// this node opens for `(owner, range_id)` already holds whatever the
    /// prior owner wrote, and recovers it into a fresh version store.
    /// `original_owner`/`original_range_id` name the range being taken over
    /// but otherwise aren't consulted here — see DESIGN.md.
    pub fn init_recovered_backup_range(
        &self,
        owner: u16,
        range_id: u16,
        _original_owner: u16,
        _original_range_id: u16,
        is_new_peer: bool,
    ) -> Result<RecoveryMetadata, LogError> {
        let range = RangeKey::new(owner, range_id);
        if self.registry.get(range).is_some() {
            return Ok(RecoveryMetadata::default());
        }
        if is_new_peer {
            self.registry.init_backup_range(range)?;
            return Ok(RecoveryMetadata::default());
        }

        let versions = Arc::new(VersionStore::new(self.epoch));
        let entry = self.registry.init_recovered_backup_range(range, Arc::clone(&versions))?;
        entry.begin_recovery();
        let metadata = entry.log.recover(&versions, |_chunk| {});
        entry.end_recovery();
        Ok(metadata)
    }

    /// Decodes a batch of `(chunk_id:u64 LE, length:u32 LE, payload)`
    /// tuples from `buf` and calls `put_log_data` for each.
    pub fn incoming_log_chunks(&self, buf: &[u8], owner: u16, range_id: u16) -> Result<(), LogError> {
        let range = RangeKey::new(owner, range_id);
        let entry = self.registry.get(range).ok_or(LogError::UnknownRange { range })?;

        let mut cursor = 0usize;
        while cursor < buf.len() {
            if cursor + 12 > buf.len() {
                return Err(LogError::Corruption {
                    kind: "incoming_log_chunks",
                    detail: "truncated entry header in incoming batch".to_string(),
                });
            }
            let chunk_id = ChunkId::from_raw(u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap()));
            let length = u32::from_le_bytes(buf[cursor + 8..cursor + 12].try_into().unwrap()) as usize;
            cursor += 12;
            if cursor + length > buf.len() {
                return Err(LogError::Corruption {
                    kind: "incoming_log_chunks",
                    detail: "truncated payload in incoming batch".to_string(),
                });
            }
            let payload = &buf[cursor..cursor + length];
            cursor += length;

            let version = entry.versions.next_version(chunk_id);
            self.ring.put_log_data(
                chunk_id,
                range,
                owner,
                owner,
                version,
                payload,
                None,
                self.config.max_entry_size(),
            )?;
        }
        Ok(())
    }

    /// Decodes a batch of `chunk_id:u64 LE` entries from `buf` and calls
    /// `invalidate(cid)` for each.
    pub fn incoming_remove_chunks(&self, buf: &[u8], owner: u16, range_id: u16) -> Result<(), LogError> {
        let range = RangeKey::new(owner, range_id);
        let entry = self.registry.get(range).ok_or(LogError::UnknownRange { range })?;

        if buf.len() % 8 != 0 {
            return Err(LogError::Corruption {
                kind: "incoming_remove_chunks",
                detail: "chunk id batch length not a multiple of 8".to_string(),
            });
        }
        for raw in buf.chunks_exact(8) {
            let cid = ChunkId::from_raw(u64::from_le_bytes(raw.try_into().unwrap()));
            entry.log.invalidate(cid)?;
        }
        Ok(())
    }

    /// Streams a backup range's secondary log, delivering recovered chunks
    /// to the configured [`ChunkSink`].
    pub fn recover_backup_range(&self, owner: u16, range_id: u16) -> Result<RecoveryMetadata, LogError> {
        let range = RangeKey::new(owner, range_id);
        let entry = self.registry.get(range).ok_or(LogError::UnknownRange { range })?;
        if !entry.begin_recovery() {
            return Err(LogError::Busy { range });
        }

        let mut batch = Vec::new();
        let metadata = entry.log.recover(&entry.versions, |chunk| batch.push(chunk));
        entry.end_recovery();
        self.chunk_sink.put_recovered_chunks(&batch);
        Ok(metadata)
    }

    /// Recovers a secondary log file directly, outside the registry — used
    /// to inspect a standalone file (e.g. one pulled from a dead peer)
    /// without first registering it as a live backup range.
    pub fn recover_backup_range_from_file(&self, path: &Path) -> Result<Vec<Chunk>, LogError> {
        let size = self.config.secondary_log_size();
        let backend: Box<dyn DiskBackend> = Box::new(BufferedBackend::open(path, size)?);
        let versions = Arc::new(VersionStore::new(self.epoch));
        let log = SecondaryLog::open(
            RangeKey::new(0, 0),
            backend,
            self.config.log_segment_size,
            size,
            Arc::clone(&versions),
            self.config.use_checksum,
        );

        let mut chunks = Vec::new();
        log.recover(&versions, |chunk| chunks.push(chunk));
        Ok(chunks)
    }

    /// Removes a backup range and deletes its backing storage.
    /// Callers must ensure no writer job for this range is still in flight
    /// (drain via [`Self::flush_data_to_secondary_logs`] first).
    pub fn remove_backup_range(&self, owner: u16, range_id: u16) -> Result<(), LogError> {
        self.registry.remove_backup_range(RangeKey::new(owner, range_id))
    }

    /// Blocks until every byte currently in the primary write buffer has
    /// reached its secondary log, and every range's coalescing buffer is
    /// empty. Idempotent, serialised by an internal `flush_lock`.
    #[instrument(skip(self))]
    pub fn flush_data_to_secondary_logs(&self) {
        let _guard = self.flush_lock.lock();

        while self.ring.wait_for_work(Duration::ZERO) {
            self.processing.run_once(Duration::ZERO);
        }
        self.processing.flush_all_range_buffers();

        while self.writer_pool.pending_secondary() > 0 || self.writer_pool.pending_primary() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        self.registry.save_all_version_snapshots();
        info!("flush_data_to_secondary_logs complete");
    }

    /// Signals `shutting_down`, drains the processing thread, flushes every
    /// range's coalescing buffer so nothing staged-but-not-yet-threshold
    /// is left behind, then shuts down the writer pool and reorganiser, in
    /// that order so no job is dropped mid-flight. Any `put_log_data` call
    /// still in progress when this is called unblocks with `LogError::Shutdown`.
    pub fn close_write_buffer(&self) {
        self.ring.close();
        self.processing_stop.store(true, Ordering::Release);
        if let Some(handle) = self.processing_thread.lock().take() {
            let _ = handle.join();
        }
        self.processing.flush_all_range_buffers();
        self.writer_pool.shutdown();
        self.reorg.shutdown();
        self.registry.save_all_version_snapshots();
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetricsSink;
    use crate::registry::DirectoryBackendFactory;

    fn build(dir: &std::path::Path) -> Arc<LogSubsystem> {
        let config = Config::builder()
            .backup_range_size(4096 * 2)
            .log_segment_size(4096)
            .write_buffer_size(4096)
            .secondary_log_buffer_size(64)
            .primary_log_size(4096 * 4)
            .build()
            .unwrap();
        let range_factory = Box::new(DirectoryBackendFactory::new(dir.to_path_buf(), config.clone()));
        let primary_backend: Box<dyn DiskBackend> =
            Box::new(BufferedBackend::open(&dir.join("primary.log"), config.primary_log_size).unwrap());
        LogSubsystem::new(
            config,
            range_factory,
            primary_backend,
            0,
            Arc::new(NullChunkSink),
            Arc::new(NullMetricsSink),
        )
    }

    #[test]
    fn init_backup_range_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sub = build(dir.path());
        sub.init_backup_range(1, 0).unwrap();
        sub.init_backup_range(1, 0).unwrap();
        sub.close_write_buffer();
    }

    #[test]
    fn incoming_log_chunks_then_flush_lands_in_secondary_log() {
        let dir = tempfile::tempdir().unwrap();
        let sub = build(dir.path());
        sub.init_backup_range(1, 0).unwrap();

        let cid = ChunkId::new(1, 42);
        let payload = b"hello world";
        let mut buf = Vec::new();
        buf.extend_from_slice(&cid.as_raw().to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        sub.incoming_log_chunks(&buf, 1, 0).unwrap();

        sub.flush_data_to_secondary_logs();

        let mut recovered = Vec::new();
        let entry = sub.registry.get(RangeKey::new(1, 0)).unwrap();
        entry.log.recover(&entry.versions, |chunk| recovered.push(chunk));
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].payload, payload);

        sub.close_write_buffer();
    }

    #[test]
    fn incoming_remove_chunks_invalidates_entries() {
        let dir = tempfile::tempdir().unwrap();
        let sub = build(dir.path());
        sub.init_backup_range(1, 0).unwrap();

        let cid = ChunkId::new(1, 7);
        let payload = b"removable";
        let mut buf = Vec::new();
        buf.extend_from_slice(&cid.as_raw().to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        sub.incoming_log_chunks(&buf, 1, 0).unwrap();
        sub.flush_data_to_secondary_logs();

        sub.incoming_remove_chunks(&cid.as_raw().to_le_bytes(), 1, 0).unwrap();

        let entry = sub.registry.get(RangeKey::new(1, 0)).unwrap();
        assert!(entry.versions.get(cid).unwrap().is_tombstone());

        sub.close_write_buffer();
    }

    #[test]
    fn unknown_range_operations_error() {
        let dir = tempfile::tempdir().unwrap();
        let sub = build(dir.path());
        assert!(matches!(
            sub.incoming_log_chunks(&[], 9, 9),
            Err(LogError::UnknownRange { .. })
        ));
        sub.close_write_buffer();
    }

    fn encode_log_chunks_batch(entries: &[(ChunkId, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (cid, payload) in entries {
            buf.extend_from_slice(&cid.as_raw().to_le_bytes());
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(payload);
        }
        buf
    }

    #[test]
    fn small_batch_with_two_level_logging_stays_buffered_until_flush() {
        // A large processthread_timeout_ms keeps the background processing
        // thread from racing this test; one manual
        // `run_once` drives exactly one pass so the pre-flush assertions are
        // deterministic.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder()
            .backup_range_size(1 << 20)
            .flash_page_size(4096)
            .log_segment_size(8192)
            .write_buffer_size(65536)
            .secondary_log_buffer_size(4096)
            .processthread_timeout_ms(60_000)
            .two_level_logging(true)
            .build()
            .unwrap();
        let range_factory = Box::new(DirectoryBackendFactory::new(dir.to_path_buf(), config.clone()));
        let primary_backend: Box<dyn DiskBackend> =
            Box::new(BufferedBackend::open(&dir.join("primary.log"), config.primary_log_size).unwrap());
        let sub = LogSubsystem::new(
            config,
            range_factory,
            primary_backend,
            0,
            Arc::new(NullChunkSink),
            Arc::new(NullMetricsSink),
        );
        sub.init_backup_range(2, 0).unwrap();

        let payload = vec![0x42u8; 100];
        let entries: Vec<(ChunkId, &[u8])> = (0..10).map(|i| (ChunkId::new(2, i), payload.as_slice())).collect();
        let buf = encode_log_chunks_batch(&entries);
        sub.incoming_log_chunks(&buf, 2, 0).unwrap();

        assert!(sub.processing.run_once(Duration::from_millis(1)));

        // All ten 100-byte entries stay well under the 4096-byte
        // secondary_log_buffer_size, so they're still coalescing — nothing
        // has reached the secondary log file yet.
        let entry = sub.registry.get(RangeKey::new(2, 0)).unwrap();
        assert!(!entry.buffer.lock().is_empty());
        assert_eq!(entry.log.used_bytes(0), 0);

        // Each entry also got a primary-log duplicate this pass, since the
        // whole range was classified tentative-primary.
        assert!(sub.primary_log.used_bytes() as usize >= 10 * (100 + 26));

        sub.flush_data_to_secondary_logs();
        let mut recovered = Vec::new();
        entry.log.recover(&entry.versions, |chunk| recovered.push(chunk));
        assert_eq!(recovered.len(), 10);

        sub.close_write_buffer();
    }

    #[test]
    fn range_map_saturation_forces_priority_flush_end_to_end() {
        // With small_buffer_pool_size=4, a 5th distinct range saturates the
        // pool and `incoming_log_chunks` blocks on a priority
        // flush until the background processing thread frees a slot.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder()
            .backup_range_size(4096 * 2)
            .log_segment_size(4096)
            .write_buffer_size(1 << 20)
            .secondary_log_buffer_size(64)
            .primary_log_size(4096 * 4)
            .small_buffer_pool_size(4)
            .build()
            .unwrap();
        let range_factory = Box::new(DirectoryBackendFactory::new(dir.to_path_buf(), config.clone()));
        let primary_backend: Box<dyn DiskBackend> =
            Box::new(BufferedBackend::open(&dir.join("primary.log"), config.primary_log_size).unwrap());
        let sub = LogSubsystem::new(
            config,
            range_factory,
            primary_backend,
            0,
            Arc::new(NullChunkSink),
            Arc::new(NullMetricsSink),
        );

        for range_id in 0..5u16 {
            sub.init_backup_range(1, range_id).unwrap();
        }
        for range_id in 0..5u16 {
            let cid = ChunkId::new(1, range_id as u64);
            let buf = encode_log_chunks_batch(&[(cid, b"x".as_slice())]);
            sub.incoming_log_chunks(&buf, 1, range_id).unwrap();
        }

        sub.flush_data_to_secondary_logs();
        for range_id in 0..5u16 {
            let entry = sub.registry.get(RangeKey::new(1, range_id)).unwrap();
            let mut recovered = Vec::new();
            entry.log.recover(&entry.versions, |chunk| recovered.push(chunk));
            assert_eq!(recovered.len(), 1);
        }

        sub.close_write_buffer();
    }

    #[test]
    fn recovery_round_trip_excludes_tombstones_and_restores_last_payload() {
        // Writes spanning several overwrites and some tombstones, then a
        // flush and close to simulate a clean stop, then a fresh subsystem
        // opened against the same files recovers exactly the survivors.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder()
            .backup_range_size(1 << 20)
            .log_segment_size(4096)
            .write_buffer_size(65536)
            .secondary_log_buffer_size(256)
            .primary_log_size(1 << 16)
            .build()
            .unwrap();

        let mut expected = std::collections::HashMap::new();
        {
            let range_factory = Box::new(DirectoryBackendFactory::new(dir.to_path_buf(), config.clone()));
            let primary_backend: Box<dyn DiskBackend> =
                Box::new(BufferedBackend::open(&dir.join("primary.log"), config.primary_log_size).unwrap());
            let sub = LogSubsystem::new(
                config.clone(),
                range_factory,
                primary_backend,
                0,
                Arc::new(NullChunkSink),
                Arc::new(NullMetricsSink),
            );
            sub.init_backup_range(3, 0).unwrap();

            for i in 0..200u64 {
                let cid = ChunkId::new(3, i);
                let payload = format!("payload-{i}-v0").into_bytes();
                let buf = encode_log_chunks_batch(&[(cid, payload.as_slice())]);
                sub.incoming_log_chunks(&buf, 3, 0).unwrap();
                expected.insert(cid, payload);
            }
            // Overwrite a subset so recovery must keep the latest payload.
            for i in (0..200u64).step_by(5) {
                let cid = ChunkId::new(3, i);
                let payload = format!("payload-{i}-v1").into_bytes();
                let buf = encode_log_chunks_batch(&[(cid, payload.as_slice())]);
                sub.incoming_log_chunks(&buf, 3, 0).unwrap();
                expected.insert(cid, payload);
            }
            // Tombstone another subset; these must be excluded on recovery.
            for i in (1..200u64).step_by(7) {
                let cid = ChunkId::new(3, i);
                sub.incoming_remove_chunks(&cid.as_raw().to_le_bytes(), 3, 0).unwrap();
                expected.remove(&cid);
            }

            sub.flush_data_to_secondary_logs();
            sub.close_write_buffer();
        }

        let range_factory = Box::new(DirectoryBackendFactory::new(dir.path().to_path_buf(), config.clone()));
        let primary_backend: Box<dyn DiskBackend> =
            Box::new(BufferedBackend::open(&dir.path().join("primary.log"), config.primary_log_size).unwrap());
        let sub = LogSubsystem::new(
            config,
            range_factory,
            primary_backend,
            0,
            Arc::new(NullChunkSink),
            Arc::new(NullMetricsSink),
        );
        sub.init_recovered_backup_range(3, 0, 3, 0, false).unwrap();

        let mut recovered = std::collections::HashMap::new();
        let entry = sub.registry.get(RangeKey::new(3, 0)).unwrap();
        entry.log.recover(&entry.versions, |chunk| {
            recovered.insert(chunk.chunk_id, chunk.payload);
        });

        assert_eq!(recovered.len(), expected.len());
        for (cid, payload) in &expected {
            assert_eq!(recovered.get(cid), Some(payload));
        }

        sub.close_write_buffer();
    }
}

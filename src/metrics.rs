//! Metrics sink, passed in at construction rather than kept as a
//! process-wide singleton, and exposed as a trait so embedders can wire
//! their own exporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Narrow seam for the statistics-export collaborator; the exporter itself
/// is left to the embedder.
pub trait MetricsSink: Send + Sync {
    fn record_bytes_ingested(&self, bytes: u64);
    fn record_bytes_flushed_primary(&self, bytes: u64);
    fn record_bytes_flushed_secondary(&self, bytes: u64);
    fn record_segment_reorganised(&self, reclaimed_bytes: u64);
    fn record_corruption(&self, kind: &'static str);
}

/// Default in-process sink: plain atomic counters, plus emission through the
/// `metrics` facade for anyone who installed a recorder.
#[derive(Default)]
pub struct CountingMetricsSink {
    bytes_ingested: AtomicU64,
    bytes_flushed_primary: AtomicU64,
    bytes_flushed_secondary: AtomicU64,
    segments_reorganised: AtomicU64,
    bytes_reclaimed: AtomicU64,
    corruption_events: AtomicU64,
}

impl CountingMetricsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bytes_ingested(&self) -> u64 {
        self.bytes_ingested.load(Ordering::Relaxed)
    }

    pub fn bytes_flushed_primary(&self) -> u64 {
        self.bytes_flushed_primary.load(Ordering::Relaxed)
    }

    pub fn bytes_flushed_secondary(&self) -> u64 {
        self.bytes_flushed_secondary.load(Ordering::Relaxed)
    }

    pub fn segments_reorganised(&self) -> u64 {
        self.segments_reorganised.load(Ordering::Relaxed)
    }

    pub fn corruption_events(&self) -> u64 {
        self.corruption_events.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CountingMetricsSink {
    fn record_bytes_ingested(&self, bytes: u64) {
        self.bytes_ingested.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("peerlog_bytes_ingested_total", bytes);
    }

    fn record_bytes_flushed_primary(&self, bytes: u64) {
        self.bytes_flushed_primary.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("peerlog_bytes_flushed_primary_total", bytes);
    }

    fn record_bytes_flushed_secondary(&self, bytes: u64) {
        self.bytes_flushed_secondary.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("peerlog_bytes_flushed_secondary_total", bytes);
    }

    fn record_segment_reorganised(&self, reclaimed_bytes: u64) {
        self.segments_reorganised.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed.fetch_add(reclaimed_bytes, Ordering::Relaxed);
        metrics::counter!("peerlog_segments_reorganised_total", 1);
        metrics::counter!("peerlog_bytes_reclaimed_total", reclaimed_bytes);
    }

    fn record_corruption(&self, kind: &'static str) {
        self.corruption_events.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("peerlog_corruption_total", 1, "kind" => kind);
    }
}

/// Sink that drops every observation; useful for tests that don't care about metrics.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record_bytes_ingested(&self, _bytes: u64) {}
    fn record_bytes_flushed_primary(&self, _bytes: u64) {}
    fn record_bytes_flushed_secondary(&self, _bytes: u64) {}
    fn record_segment_reorganised(&self, _reclaimed_bytes: u64) {}
    fn record_corruption(&self, _kind: &'static str) {}
}

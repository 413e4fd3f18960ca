//! Peer-side durable logging subsystem for a distributed in-memory object
//! store: a primary write buffer ring, a sort-and-dispatch stage, segmented
//! secondary logs with background reorganisation, and a pluggable disk I/O
//! abstraction (buffered, `O_DIRECT`-aligned, or raw block device).
//!
//! [`subsystem::LogSubsystem`] is the entry point for embedders; everything
//! else is exposed for testing and for building alternative wiring.

pub mod config;
pub mod error;
pub mod header;
pub mod ids;
pub mod io_backend;
pub mod metrics;
pub mod primary_log;
pub mod processing;
pub mod registry;
pub mod reorg;
pub mod ring;
pub mod secondary_log;
pub mod secondary_log_buffer;
pub mod segment_pool;
pub mod seq;
pub mod subsystem;
pub mod version_store;
pub mod writer_pool;

pub use config::{Config, ConfigBuilder, ConfigError, HardDriveAccessMode};
pub use error::LogError;
pub use ids::{ChunkId, RangeKey, Version};
pub use secondary_log::{Chunk, RecoveryMetadata};
pub use subsystem::{ChunkSink, LogSubsystem, NullChunkSink};

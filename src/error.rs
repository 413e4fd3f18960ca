//! Error types for the logging subsystem: one `snafu` enum per component
//! boundary, composed into [`LogError`] at the public API surface.

use std::io;

use snafu::Snafu;

use crate::ids::RangeKey;

/// Errors raised while encoding or decoding a log entry header.
#[derive(Debug, Snafu)]
pub enum HeaderError {
    #[snafu(display("header claims {claimed} bytes but only {available} were available"))]
    Truncated { claimed: usize, available: usize },

    #[snafu(display("entry chain length {count} exceeds the 127-part maximum"))]
    ChainTooLong { count: usize },

    #[snafu(display("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}"))]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[snafu(display("zero-length flags byte encountered where a header was expected"))]
    SentinelEncountered,
}

/// Errors raised by a [`crate::secondary_log::SecondaryLog`].
#[derive(Debug, Snafu)]
pub enum SegmentError {
    #[snafu(display("no segment in range {range} has room for a {len}-byte entry"))]
    NoSpace { range: RangeKey, len: usize },

    #[snafu(display("segment index {index} out of bounds ({count} segments)"))]
    IndexOutOfBounds { index: usize, count: usize },

    #[snafu(display("entry of length {len} would straddle the segment boundary at offset {offset}"))]
    WouldStraddleBoundary { len: usize, offset: usize },

    #[snafu(display("header error while scanning segment {index}: {source}"))]
    Header { index: usize, source: HeaderError },

    #[snafu(display("disk I/O error on range {range}: {source}"))]
    Io { range: RangeKey, source: io::Error },
}

/// Errors surfaced by the writer pool's background disk threads.
#[derive(Debug, Snafu)]
pub enum WriterError {
    #[snafu(display("writer pool queue is closed"))]
    Closed,

    #[snafu(display("secondary log write failed: {source}"))]
    Secondary { source: SegmentError },

    #[snafu(display("primary log write failed: {source}"))]
    Primary { source: io::Error },
}

/// Top-level error type returned from the subsystem's public operations.
#[derive(Debug, Snafu)]
pub enum LogError {
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument { message: String },

    #[snafu(display("range {range} is currently being recovered"))]
    Busy { range: RangeKey },

    #[snafu(display("I/O failure: {source}"))]
    IoFailure { source: io::Error },

    #[snafu(display("corruption detected ({kind}): {detail}"))]
    Corruption { kind: &'static str, detail: String },

    #[snafu(display("operation submitted after shutdown"))]
    Shutdown,

    #[snafu(display("unknown backup range {range}"))]
    UnknownRange { range: RangeKey },
}

impl From<io::Error> for LogError {
    fn from(source: io::Error) -> Self {
        LogError::IoFailure { source }
    }
}

impl From<HeaderError> for LogError {
    fn from(source: HeaderError) -> Self {
        LogError::Corruption {
            kind: "header",
            detail: source.to_string(),
        }
    }
}

impl From<SegmentError> for LogError {
    fn from(source: SegmentError) -> Self {
        match source {
            SegmentError::Io { source, .. } => LogError::IoFailure { source },
            other => LogError::Corruption {
                kind: "segment",
                detail: other.to_string(),
            },
        }
    }
}

impl From<WriterError> for LogError {
    fn from(source: WriterError) -> Self {
        match source {
            WriterError::Closed => LogError::Shutdown,
            WriterError::Secondary { source } => source.into(),
            WriterError::Primary { source } => LogError::IoFailure { source },
        }
    }
}

pub type Result<T, E = LogError> = std::result::Result<T, E>;

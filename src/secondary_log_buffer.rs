//! Per-range secondary log buffer: coalesces small secondary-framed
//! entries into one write before they reach the disk, one staging buffer
//! per `(owner, range)`.
//!
//! Invariant: the buffer only ever contains secondary-log-framed bytes
//! (entries already converted via [`crate::header::LogEntryHeader::convert_and_put`]).
//! Callers are responsible for converting before calling [`SecondaryLogBuffer::buffer_data`].

use bytes::BytesMut;

/// Accumulates secondary-framed entries until they'd overflow `capacity`,
/// at which point the prior contents are handed back so the caller can
/// dispatch them as one write.
pub struct SecondaryLogBuffer {
    staged: BytesMut,
    capacity: usize,
}

impl SecondaryLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            staged: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Appends `entry` to the staging buffer. If `entry` alone is at least
    /// as large as `capacity`, it is appended to (and dispatched with)
    /// whatever was already staged rather than coalesced into a future
    /// batch. Otherwise, if appending would overflow `capacity`, the prior
    /// contents are flushed and returned first, and `entry` starts the
    /// next batch.
    pub fn buffer_data(&mut self, entry: &[u8]) -> Option<Vec<u8>> {
        if entry.len() >= self.capacity {
            self.staged.extend_from_slice(entry);
            return self.flush();
        }

        if self.staged.len() + entry.len() > self.capacity {
            let flushed = self.flush();
            self.staged.extend_from_slice(entry);
            return flushed;
        }

        self.staged.extend_from_slice(entry);
        None
    }

    /// Forces out whatever is currently staged, if anything. Called for a
    /// priority-flushed range right after it's buffered, and by
    /// [`crate::subsystem::LogSubsystem::flush_data_to_secondary_logs`]
    /// for every range on an explicit flush request.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.staged.is_empty() {
            None
        } else {
            Some(std::mem::replace(&mut self.staged, BytesMut::with_capacity(self.capacity)).to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_until_capacity_then_flushes() {
        let mut buf = SecondaryLogBuffer::new(16);
        assert!(buf.buffer_data(&[1; 8]).is_none());
        assert!(buf.buffer_data(&[2; 4]).is_none());
        // 8 + 4 + 6 = 18 > 16, so this triggers a flush of the first 12 bytes.
        let flushed = buf.buffer_data(&[3; 6]).unwrap();
        assert_eq!(flushed.len(), 12);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn oversized_entry_flushes_immediately_with_prior_contents() {
        let mut buf = SecondaryLogBuffer::new(16);
        assert!(buf.buffer_data(&[1; 4]).is_none());
        let flushed = buf.buffer_data(&[9; 32]).unwrap();
        assert_eq!(flushed.len(), 36);
        assert!(buf.is_empty());
    }

    #[test]
    fn explicit_flush_drains_buffer() {
        let mut buf = SecondaryLogBuffer::new(16);
        buf.buffer_data(&[7; 5]);
        let flushed = buf.flush().unwrap();
        assert_eq!(flushed, vec![7; 5]);
        assert!(buf.flush().is_none());
    }
}

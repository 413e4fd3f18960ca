//! Log entry header codec.
//!
//! A header is a flags byte followed by a fixed set of fields whose presence
//! is determined by the flags byte, except `length`, which is a variable-width
//! unsigned varint (7 bits per byte, high bit set on every byte but the
//! last) rather than a fixed-width integer — reading a header therefore
//! means walking the fixed prefix up to `length`, then scanning forward one
//! byte at a time until the terminating byte is seen. Two flavours share
//! this layout: *primary* headers carry full routing (`range_id`, `owner`,
//! `original_owner`); *secondary* headers drop `range_id` and `owner`
//! (implied by which secondary log the entry lives in) and drop
//! `original_owner` when it equals `owner`. All fixed-width multi-byte
//! fields are little-endian.
//!
//! Bit 7 (`ENTRY_PRESENT`) is set on every real header and is the only thing
//! that distinguishes a header from the zero sentinel byte that marks the
//! end of a segment or a primary-log batch.

use crc32fast::Hasher;

use crate::error::HeaderError;
use crate::ids::{ChunkId, Version};

pub const MAX_CHAIN_COUNT: u8 = 127;

/// Upper bound on [`LogEntryHeader::encoded_size`] across every flag
/// combination: flags(1) + chunk_id(8) + range_id(2) + owner(2) +
/// original_owner(2) + timestamp(8) + chaining(2) + length(varint, up to 5
/// for a u32) + epoch(2) + version(4) + checksum(4).
pub const MAX_HEADER_SIZE: usize = 1 + 8 + 2 + 2 + 2 + 8 + 2 + 5 + 2 + 4 + 4;

pub const HAS_RANGE_ID: u8 = 0b0000_0001;
pub const HAS_OWNER: u8 = 0b0000_0010;
pub const HAS_ORIGINAL_OWNER: u8 = 0b0000_0100;
pub const HAS_TIMESTAMP: u8 = 0b0000_1000;
pub const HAS_CHECKSUM: u8 = 0b0001_0000;
pub const HAS_CHAINING: u8 = 0b0010_0000;
pub const IS_SECONDARY: u8 = 0b0100_0000;
pub const ENTRY_PRESENT: u8 = 0b1000_0000;

/// Decoded log entry header. See module docs for the wire layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntryHeader {
    pub chunk_id: ChunkId,
    pub range_id: Option<u16>,
    pub owner: Option<u16>,
    pub original_owner: Option<u16>,
    pub timestamp: Option<u64>,
    pub chain_id: u8,
    pub chain_count: u8,
    pub length: u32,
    pub version: Version,
    pub checksum: Option<u32>,
    secondary: bool,
}

impl LogEntryHeader {
    /// Builds a primary header carrying full routing metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        chunk_id: ChunkId,
        length: u32,
        version: Version,
        range_id: u16,
        owner: u16,
        original_owner: u16,
        timestamp: Option<u64>,
    ) -> Self {
        Self {
            chunk_id,
            range_id: Some(range_id),
            owner: Some(owner),
            original_owner: Some(original_owner),
            timestamp,
            chain_id: 0,
            chain_count: 1,
            length,
            version,
            checksum: None,
            secondary: false,
        }
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    pub fn add_chaining(&mut self, chain_id: u8, chain_count: u8) -> Result<(), HeaderError> {
        if chain_count as usize > MAX_CHAIN_COUNT as usize {
            return Err(HeaderError::ChainTooLong {
                count: chain_count as usize,
            });
        }
        self.chain_id = chain_id;
        self.chain_count = chain_count;
        Ok(())
    }

    pub fn adjust_length(&mut self, new_len: u32) {
        self.length = new_len;
    }

    /// Computes CRC32 over `(chunk_id, version, payload)` and stores it in
    /// the header's checksum slot.
    pub fn add_checksum(&mut self, payload: &[u8]) {
        self.checksum = Some(compute_checksum(self.chunk_id, self.version, payload));
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> Result<(), HeaderError> {
        match self.checksum {
            None => Ok(()),
            Some(expected) => {
                let computed = compute_checksum(self.chunk_id, self.version, payload);
                if computed == expected {
                    Ok(())
                } else {
                    Err(HeaderError::ChecksumMismatch { expected, computed })
                }
            }
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = ENTRY_PRESENT;
        if self.range_id.is_some() {
            flags |= HAS_RANGE_ID;
        }
        if self.owner.is_some() {
            flags |= HAS_OWNER;
        }
        if self.original_owner.is_some() {
            flags |= HAS_ORIGINAL_OWNER;
        }
        if self.timestamp.is_some() {
            flags |= HAS_TIMESTAMP;
        }
        if self.checksum.is_some() {
            flags |= HAS_CHECKSUM;
        }
        if self.chain_count > 1 || self.chain_id != 0 {
            flags |= HAS_CHAINING;
        }
        if self.secondary {
            flags |= IS_SECONDARY;
        }
        flags
    }

    /// Size in bytes of this header's encoding.
    pub fn encoded_size(&self) -> usize {
        header_prefix_size(self.flags()) + varint_encoded_len(self.length) + 2 + 4
            + if self.checksum.is_some() { 4 } else { 0 }
    }

    /// Encodes the header (not including the payload) into `out`, which must
    /// already have at least `encoded_size()` bytes available.
    pub fn encode_into(&self, out: &mut [u8]) -> usize {
        let flags = self.flags();
        let mut pos = 0;
        out[pos] = flags;
        pos += 1;
        out[pos..pos + 8].copy_from_slice(&self.chunk_id.as_raw().to_le_bytes());
        pos += 8;
        if let Some(range_id) = self.range_id {
            out[pos..pos + 2].copy_from_slice(&range_id.to_le_bytes());
            pos += 2;
        }
        if let Some(owner) = self.owner {
            out[pos..pos + 2].copy_from_slice(&owner.to_le_bytes());
            pos += 2;
        }
        if let Some(original_owner) = self.original_owner {
            out[pos..pos + 2].copy_from_slice(&original_owner.to_le_bytes());
            pos += 2;
        }
        if let Some(ts) = self.timestamp {
            out[pos..pos + 8].copy_from_slice(&ts.to_le_bytes());
            pos += 8;
        }
        if flags & HAS_CHAINING != 0 {
            out[pos] = self.chain_id;
            out[pos + 1] = self.chain_count;
            pos += 2;
        }
        pos += write_varint(&mut out[pos..], self.length);
        out[pos..pos + 2].copy_from_slice(&self.version.epoch.to_le_bytes());
        pos += 2;
        out[pos..pos + 4].copy_from_slice(&self.version.version.to_le_bytes());
        pos += 4;
        if let Some(checksum) = self.checksum {
            out[pos..pos + 4].copy_from_slice(&checksum.to_le_bytes());
            pos += 4;
        }
        debug_assert_eq!(pos, self.encoded_size());
        pos
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_size()];
        self.encode_into(&mut buf);
        buf
    }

    /// `true` iff a full header can be read starting at `buf[0]`.
    pub fn is_readable(buf: &[u8]) -> bool {
        header_size(buf).is_ok()
    }

    /// Decodes a header from the front of `buf`. Returns the header and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), HeaderError> {
        let total = header_size(buf)?;
        let flags = buf[0];

        let mut pos = 1;
        let chunk_id = ChunkId::from_raw(read_u64(buf, &mut pos));
        let range_id = (flags & HAS_RANGE_ID != 0).then(|| read_u16(buf, &mut pos));
        let owner = (flags & HAS_OWNER != 0).then(|| read_u16(buf, &mut pos));
        let original_owner = (flags & HAS_ORIGINAL_OWNER != 0).then(|| read_u16(buf, &mut pos));
        let timestamp = (flags & HAS_TIMESTAMP != 0).then(|| read_u64(buf, &mut pos));
        let (chain_id, chain_count) = if flags & HAS_CHAINING != 0 {
            let chain_id = buf[pos];
            let chain_count = buf[pos + 1];
            pos += 2;
            (chain_id, chain_count)
        } else {
            (0, 1)
        };
        let length = read_varint(buf, &mut pos);
        let epoch = read_u16(buf, &mut pos);
        let version = read_u32(buf, &mut pos);
        let checksum = (flags & HAS_CHECKSUM != 0).then(|| read_u32(buf, &mut pos));

        debug_assert_eq!(pos, total);

        Ok((
            LogEntryHeader {
                chunk_id,
                range_id,
                owner,
                original_owner,
                timestamp,
                chain_id,
                chain_count,
                length,
                version: Version { epoch, version },
                checksum,
                secondary: flags & IS_SECONDARY != 0,
            },
            pos,
        ))
    }

    /// Rewrites a primary header in `buf[0..]` as a secondary header, in place.
    ///
    /// `buf` must contain the full primary header followed by its payload.
    /// The secondary header (which is never larger than the primary one,
    /// since it only ever drops fields) is written so that it ends exactly
    /// where the payload begins; the return value is the number of leading
    /// bytes the caller must skip (`conversion_offset`) when emitting this
    /// entry to a secondary log.
    pub fn convert_and_put(buf: &mut [u8]) -> Result<usize, HeaderError> {
        let (primary, primary_size) = Self::decode(buf)?;
        let mut secondary = primary.clone();
        secondary.secondary = true;
        secondary.range_id = None;
        secondary.owner = None;
        if let (Some(owner), Some(original_owner)) = (primary.owner, primary.original_owner) {
            if owner == original_owner {
                secondary.original_owner = None;
            }
        }

        let secondary_size = secondary.encoded_size();
        debug_assert!(secondary_size <= primary_size);
        let conversion_offset = primary_size - secondary_size;
        secondary.encode_into(&mut buf[conversion_offset..primary_size]);
        Ok(conversion_offset)
    }
}

fn compute_checksum(chunk_id: ChunkId, version: Version, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&chunk_id.as_raw().to_be_bytes());
    hasher.update(&version.epoch.to_be_bytes());
    hasher.update(&version.version.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Size of the fixed portion of a header up to (but not including) the
/// varint-encoded `length` field, derived purely from the flags byte.
fn header_prefix_size(flags: u8) -> usize {
    let mut size = 1 + 8; // flags + chunk_id
    if flags & HAS_RANGE_ID != 0 {
        size += 2;
    }
    if flags & HAS_OWNER != 0 {
        size += 2;
    }
    if flags & HAS_ORIGINAL_OWNER != 0 {
        size += 2;
    }
    if flags & HAS_TIMESTAMP != 0 {
        size += 8;
    }
    if flags & HAS_CHAINING != 0 {
        size += 2;
    }
    size
}

/// Number of bytes needed to varint-encode `value`.
fn varint_encoded_len(value: u32) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Writes `value` to `out` as a varint, returning the number of bytes written.
fn write_varint(out: &mut [u8], mut value: u32) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out[i] = byte | 0x80;
            i += 1;
        } else {
            out[i] = byte;
            i += 1;
            break;
        }
    }
    i
}

/// Reads a varint starting at `*pos`, advancing `*pos` past it.
fn read_varint(buf: &[u8], pos: &mut usize) -> u32 {
    let mut result: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = buf[*pos];
        *pos += 1;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    result
}

/// Scans for the terminating byte of a varint at the front of `buf`,
/// returning its length in bytes. `None` if no terminator appears within
/// the 5 bytes a u32 varint can ever occupy, or `buf` runs out first.
fn scan_varint_len(buf: &[u8]) -> Option<usize> {
    for i in 0..5.min(buf.len()) {
        if buf[i] & 0x80 == 0 {
            return Some(i + 1);
        }
    }
    None
}

/// Computes the total size of the header at the front of `buf`, scanning
/// past the fixed prefix into the varint `length` field to find where the
/// rest of the header (epoch, version, optional checksum) begins.
fn header_size(buf: &[u8]) -> Result<usize, HeaderError> {
    let flags = *buf.first().ok_or(HeaderError::Truncated {
        claimed: 1,
        available: 0,
    })?;
    if flags == 0 {
        return Err(HeaderError::SentinelEncountered);
    }
    let prefix = header_prefix_size(flags);
    if buf.len() < prefix + 1 {
        return Err(HeaderError::Truncated {
            claimed: prefix + 1,
            available: buf.len(),
        });
    }
    let varint_len = scan_varint_len(&buf[prefix..]).ok_or(HeaderError::Truncated {
        claimed: prefix + 5,
        available: buf.len(),
    })?;
    let tail = 2 + 4 + if flags & HAS_CHECKSUM != 0 { 4 } else { 0 };
    let total = prefix + varint_len + tail;
    if buf.len() < total {
        return Err(HeaderError::Truncated {
            claimed: total,
            available: buf.len(),
        });
    }
    Ok(total)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> u16 {
    let v = u16::from_le_bytes(buf[*pos..*pos + 2].try_into().unwrap());
    *pos += 2;
    v
}

fn read_u32(buf: &[u8], pos: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    v
}

fn read_u64(buf: &[u8], pos: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_primary() -> LogEntryHeader {
        LogEntryHeader::create(
            ChunkId::new(0x0003, 0x2A),
            128,
            Version { epoch: 1, version: 7 },
            3,
            0x0002,
            0x0002,
            Some(1_700_000_000),
        )
    }

    #[test]
    fn encode_decode_roundtrips() {
        let header = sample_primary();
        let bytes = header.encode();
        let (decoded, consumed) = LogEntryHeader::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, header);
    }

    #[test]
    fn zero_byte_is_not_readable() {
        assert!(!LogEntryHeader::is_readable(&[0u8; 16]));
    }

    #[test]
    fn convert_drops_range_and_owner_and_matching_original_owner() {
        let header = sample_primary();
        let mut buf = header.encode();
        buf.extend_from_slice(&[0xAB; 128]);

        let offset = LogEntryHeader::convert_and_put(&mut buf).unwrap();
        let (secondary, _) = LogEntryHeader::decode(&buf[offset..]).unwrap();
        assert!(secondary.is_secondary());
        assert_eq!(secondary.range_id, None);
        assert_eq!(secondary.owner, None);
        assert_eq!(secondary.original_owner, None);
        assert_eq!(secondary.chunk_id, header.chunk_id);
        assert_eq!(secondary.version, header.version);
    }

    #[test]
    fn convert_keeps_original_owner_when_it_differs() {
        let mut header = sample_primary();
        header.original_owner = Some(0x0099);
        let mut buf = header.encode();
        buf.extend_from_slice(&[0xCD; 16]);

        let offset = LogEntryHeader::convert_and_put(&mut buf).unwrap();
        let (secondary, _) = LogEntryHeader::decode(&buf[offset..]).unwrap();
        assert_eq!(secondary.original_owner, Some(0x0099));
    }

    #[test]
    fn chain_length_over_127_is_rejected() {
        let mut header = sample_primary();
        assert!(header.add_chaining(0, 200).is_err());
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut header = sample_primary();
        let payload = vec![1, 2, 3, 4];
        header.add_checksum(&payload);
        assert!(header.verify_checksum(&payload).is_ok());
        assert!(header.verify_checksum(&[1, 2, 3, 5]).is_err());
    }
}

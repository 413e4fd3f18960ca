//! `Direct` disk backend: page-aligned O_DIRECT-style I/O.
//!
//! Bypasses the page cache. Every write is staged through a page-aligned
//! buffer checked out from a [`SegmentBufferPool`] owned by this backend, and
//! offsets must be multiples of the page size; writes shorter than a full
//! page are padded up to the next page boundary with `pad_byte`.

use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::DiskBackend;
use crate::segment_pool::SegmentBufferPool;

pub struct DirectBackend {
    file: Mutex<File>,
    path: PathBuf,
    page_size: u32,
    pool: Arc<SegmentBufferPool>,
}

impl DirectBackend {
    pub fn open(path: &Path, size: u64, page_size: u32) -> io::Result<Self> {
        let file = open_o_direct(path)?;
        if file.metadata()?.len() < size {
            file.set_len(round_up(size, page_size as u64))?;
        }
        let pool = SegmentBufferPool::new(
            page_size as usize,
            page_size as usize,
            page_size as usize * 16,
            page_size as usize * 256,
            4,
        );
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size,
            pool,
        })
    }

    fn check_alignment(&self, off: u64, len: usize) -> io::Result<()> {
        let page = self.page_size as u64;
        if off % page != 0 || (len as u64) % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("direct I/O requires {page}-byte aligned offset and length, got off={off} len={len}"),
            ));
        }
        Ok(())
    }
}

impl DiskBackend for DirectBackend {
    fn length(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn read_at(&self, dst: &mut [u8], off: u64, len: usize) -> io::Result<usize> {
        self.check_alignment(off, len)?;
        self.file.lock().read_exact_at(&mut dst[..len], off)?;
        Ok(len)
    }

    fn write_at(&self, src: &[u8], src_off: usize, off: u64, len: usize, pad_byte: u8) -> io::Result<usize> {
        let page = self.page_size as u64;
        let padded_len = round_up(len as u64, page) as usize;
        self.check_alignment(off, padded_len)?;

        let mut buf = self.pool.get(padded_len);
        let available = src.len() - src_off;
        let copy_len = available.min(len);
        {
            let slice = buf.as_mut_slice();
            slice[..copy_len].copy_from_slice(&src[src_off..src_off + copy_len]);
            if padded_len > copy_len {
                slice[copy_len..padded_len].fill(pad_byte);
            }
        }
        buf.set_len(padded_len);
        let result = self.file.lock().write_all_at(&buf.as_slice()[..padded_len], off);
        self.pool.put(buf);
        result?;
        Ok(padded_len)
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn close_and_remove(self: Box<Self>) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

#[cfg(unix)]
fn open_o_direct(path: &Path) -> io::Result<File> {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;

    let fd = open(
        path,
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_DIRECT,
        Mode::from_bits_truncate(0o644),
    )
    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    // SAFETY: `open` above returned a freshly opened, owned file descriptor
    // that nothing else has a handle to yet.
    Ok(unsafe { File::from_raw_fd(fd) })
}

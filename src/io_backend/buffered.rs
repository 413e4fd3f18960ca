//! `Buffered` disk backend: ordinary positioned page-cache file I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::DiskBackend;

pub struct BufferedBackend {
    file: Mutex<File>,
    path: PathBuf,
}

impl BufferedBackend {
    pub fn open(path: &Path, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }
}

impl DiskBackend for BufferedBackend {
    fn length(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn read_at(&self, dst: &mut [u8], off: u64, len: usize) -> io::Result<usize> {
        self.file.lock().read_exact_at(&mut dst[..len], off)?;
        Ok(len)
    }

    fn write_at(&self, src: &[u8], src_off: usize, off: u64, len: usize, pad_byte: u8) -> io::Result<usize> {
        let available = src.len() - src_off;
        if available >= len {
            self.file.lock().write_all_at(&src[src_off..src_off + len], off)?;
        } else {
            let mut padded = Vec::with_capacity(len);
            padded.extend_from_slice(&src[src_off..]);
            padded.resize(len, pad_byte);
            self.file.lock().write_all_at(&padded, off)?;
        }
        Ok(len)
    }

    fn close(&self) -> io::Result<()> {
        self.file.lock().flush()
    }

    fn close_and_remove(self: Box<Self>) -> io::Result<()> {
        self.file.lock().flush()?;
        std::fs::remove_file(&self.path)
    }
}

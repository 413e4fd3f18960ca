//! Disk I/O abstraction: three interchangeable sinks for positioned
//! reads/writes against a fixed-size file or raw slab.
//!
//! A single object-safe trait with three implementations selected at
//! startup from [`crate::config::HardDriveAccessMode`]; `Direct` and `Raw`
//! require page-aligned buffers sourced exclusively from the
//! [`crate::segment_pool::SegmentBufferPool`].

mod buffered;
mod direct;
mod raw;

pub use buffered::BufferedBackend;
pub use direct::DirectBackend;
pub use raw::{RawBackend, RawDeviceManager};

use std::io;
use std::path::Path;

use crate::config::{Config, HardDriveAccessMode};

/// Capability set shared by all three backends: `{length, read_at, write_at,
/// close, close_and_remove}`. `open` is not part of the trait itself (it
/// needs a concrete return type per backend) and is instead exposed through
/// [`open_backend`].
pub trait DiskBackend: Send + Sync {
    /// Usable length of the backing file/slab in bytes.
    fn length(&self) -> io::Result<u64>;

    /// Reads `len` bytes starting at `off` into `dst[..len]`.
    fn read_at(&self, dst: &mut [u8], off: u64, len: usize) -> io::Result<usize>;

    /// Writes `len` bytes from `src[src_off..src_off+len]` at `off`.
    ///
    /// `Direct` requires `src` to be page-aligned, `off % page_size == 0`,
    /// and `len` to be a multiple of the page size; implementations pad the
    /// final partial page with `pad_byte` rather than reject the write.
    fn write_at(&self, src: &[u8], src_off: usize, off: u64, len: usize, pad_byte: u8) -> io::Result<usize>;

    /// Flushes and releases the underlying OS handle, but leaves any on-disk
    /// data in place.
    fn close(&self) -> io::Result<()>;

    /// Closes the backend and removes its backing storage (deletes the file,
    /// or releases the slab back to the raw device's directory).
    fn close_and_remove(self: Box<Self>) -> io::Result<()>;
}

/// Opens the backend selected by `config.harddrive_access_mode`.
///
/// `raw_manager` is required (and `path` ignored beyond naming the slab) when
/// the mode is [`HardDriveAccessMode::Raw`].
pub fn open_backend(
    config: &Config,
    path: &Path,
    size: u64,
    raw_manager: Option<&RawDeviceManager>,
) -> io::Result<Box<dyn DiskBackend>> {
    match config.harddrive_access_mode {
        HardDriveAccessMode::Buffered => Ok(Box::new(BufferedBackend::open(path, size)?)),
        HardDriveAccessMode::Direct => Ok(Box::new(DirectBackend::open(path, size, config.flash_page_size)?)),
        HardDriveAccessMode::Raw => {
            let manager = raw_manager.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "raw mode requires a RawDeviceManager")
            })?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "raw slab name must be valid UTF-8"))?;
            Ok(Box::new(manager.open_or_create(name, size)?))
        }
    }
}

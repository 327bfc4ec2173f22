//! Backing file management: create/open the share file at its fixed size and
//! map it read-write.
//!
//! The file is exactly `num_pages * page_size` bytes of page images, nothing
//! else; geometry agreement between processes is by configuration, and a file
//! whose size disagrees (or an explicit `init_file`) is truncated and built
//! fresh. The whole-file lock taken for that bootstrap is deliberately held
//! past the resize, across page formatting: a narrower scope that only
//! serializes the truncate would let a concurrent opener map a resized but
//! still unformatted file. Concurrent openers therefore block until every
//! page carries a valid header.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use memmap2::MmapMut;
use tracing::debug;

use super::lock;
use crate::error::{CacheError, Result};
use crate::options::CacheOptions;

pub struct MappedFile {
    file: std::fs::File,
    mmap: MmapMut,
    path: PathBuf,
    /// Still holding the whole-file bootstrap lock; released by
    /// [`MappedFile::finish_init`] once the pages are formatted.
    init_locked: bool,
}

impl MappedFile {
    /// Open (creating if needed) and map the share file.
    ///
    /// Returns the mapping and whether the file content is fresh and needs
    /// its pages formatted. When fresh, the whole-file lock is retained —
    /// not released after the resize — and must be dropped with
    /// [`finish_init`](Self::finish_init) once formatting is done.
    pub fn open(opts: &CacheOptions) -> Result<(Self, bool)> {
        let path = opts.share_file.clone();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(opts.permissions)
            .open(&path)
            .map_err(|e| CacheError::io(format!("opening share file {}", path.display()), e))?;

        let fd = file.as_raw_fd();
        lock::acquire(fd, 0, 0, false)
            .map_err(|e| CacheError::io(format!("locking share file {}", path.display()), e))?;

        let total = opts.total_size() as u64;
        let current = file
            .metadata()
            .map_err(|e| CacheError::io(format!("statting share file {}", path.display()), e))?
            .len();

        let fresh = opts.init_file || current != total;
        if fresh {
            debug!(
                path = %path.display(),
                size = total,
                "creating share file contents"
            );
            // Truncate to zero first so stale page images never survive a
            // geometry change.
            file.set_len(0)
                .and_then(|()| file.set_len(total))
                .map_err(|e| {
                    CacheError::io(format!("sizing share file {}", path.display()), e)
                })?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| CacheError::io(format!("mapping share file {}", path.display()), e))?;

        if !fresh {
            lock::release(fd, 0, 0)
                .map_err(|e| CacheError::io(format!("unlocking share file {}", path.display()), e))?;
        }

        Ok((
            MappedFile {
                file,
                mmap,
                path,
                init_locked: fresh,
            },
            fresh,
        ))
    }

    /// Drop the whole-file bootstrap lock after page formatting.
    pub fn finish_init(&mut self) -> Result<()> {
        if self.init_locked {
            self.init_locked = false;
            lock::release(self.fd(), 0, 0).map_err(|e| {
                CacheError::io(format!("unlocking share file {}", self.path.display()), e)
            })?;
        }
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Immutable view of one page.
    pub fn page(&self, index: usize, page_size: usize) -> &[u8] {
        let start = index * page_size;
        &self.mmap[start..start + page_size]
    }

    /// Mutable view of one page. Callers may only take this for a page they
    /// hold the byte-range lock on (or during the bootstrap, under the
    /// whole-file lock).
    pub fn page_mut(&mut self, index: usize, page_size: usize) -> &mut [u8] {
        let start = index * page_size;
        &mut self.mmap[start..start + page_size]
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.init_locked {
            let _ = lock::release(self.fd(), 0, 0);
        }
    }
}

use crate::errors::RingError;
use crate::paths;
use memmap2::{MmapOptions, MmapRaw};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;

#[derive(Debug, Clone, Copy)]
pub struct RegionOptions {
    pub exist_ok: bool,
    pub permissions: u32,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            exist_ok: false,
            permissions: paths::DEFAULT_PERMISSIONS,
        }
    }
}

/// One POSIX shared-memory segment mapped into this process.
///
/// The region has no synchronization of its own: callers coordinate through
/// the header field locks. Dropping it detaches the mapping.
pub struct SharedRegion {
    key: u32,
    mmap: MmapRaw,
    _file: File,
}

// The mapping is shared with other processes anyway; in-process access is
// serialized by the same semaphores.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the segment for `key` with `size` bytes.
    ///
    /// With `exist_ok == false` this is an exclusive create and fails with
    /// `SegmentExists` when another segment already uses the key.
    pub fn create(key: u32, size: usize, options: RegionOptions) -> Result<Self, RingError> {
        let name = paths::segment_name(key);
        let mut flags = OFlag::O_CREAT | OFlag::O_RDWR;
        if !options.exist_ok {
            flags |= OFlag::O_EXCL;
        }

        let fd = shm_open(
            name.as_str(),
            flags,
            Mode::from_bits_truncate(options.permissions as _),
        )
        .map_err(|e| segment_error(key, e))?;
        let file = File::from(fd);

        // Only grow: an existing segment opened with exist_ok keeps its size
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }

        let mmap = MmapOptions::new().len(size).map_raw(&file)?;
        tracing::debug!(key, size, segment = %name, "Shared memory segment created");

        Ok(Self {
            key,
            mmap,
            _file: file,
        })
    }

    /// Attach to an existing segment. Fails if it is missing or smaller than `size`.
    pub fn attach(key: u32, size: usize) -> Result<Self, RingError> {
        let name = paths::segment_name(key);
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| segment_error(key, e))?;
        let file = File::from(fd);

        let actual = file.metadata()?.len() as usize;
        if actual < size {
            return Err(RingError::SizeMismatch {
                key,
                expected: size,
                actual,
            });
        }

        let mmap = MmapOptions::new().len(size).map_raw(&file)?;
        tracing::debug!(key, size, segment = %name, "Shared memory segment attached");

        Ok(Self {
            key,
            mmap,
            _file: file,
        })
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, data: &[u8], offset: usize) -> Result<(), RingError> {
        self.check_bounds(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mmap.as_mut_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy `length` bytes starting at `offset` out of the region.
    pub fn read(&self, length: usize, offset: usize) -> Result<Vec<u8>, RingError> {
        let mut out = vec![0u8; length];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<(), RingError> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mmap.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Release this process's mapping only.
    pub fn detach(self) {
        tracing::debug!(key = self.key, "Shared memory segment detached");
    }

    /// Remove the segment from the system. Existing mappings, this one
    /// included, stay valid until detached.
    pub fn destroy(&self) -> Result<(), RingError> {
        shm_unlink(paths::segment_name(self.key).as_str())
            .map_err(|e| segment_error(self.key, e))?;
        tracing::debug!(key = self.key, "Shared memory segment destroyed");
        Ok(())
    }

    /// Probe-and-remove used by cleanup paths; an absent segment is not an error.
    pub fn maybe_destroy(key: u32) -> Result<bool, RingError> {
        match shm_unlink(paths::segment_name(key).as_str()) {
            Ok(()) => {
                tracing::info!(key, "Removed shared memory segment");
                Ok(true)
            }
            Err(Errno::ENOENT) => Ok(false),
            Err(e) => Err(segment_error(key, e)),
        }
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), RingError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(RingError::OutOfBounds {
                offset,
                len,
                size: self.len(),
            }),
        }
    }
}

fn segment_error(key: u32, errno: Errno) -> RingError {
    match errno {
        Errno::EEXIST => RingError::SegmentExists { key },
        Errno::ENOENT => RingError::SegmentNotFound { key },
        source => RingError::Segment { key, source },
    }
}

//! Named shared memory region holding a single frame slot.
//!
//! ```text
//! offset 0:  sequence   i32  (atomic, native endian)
//! offset 4:  data_size  u32  (atomic, native endian)
//! offset 8:  pixels     [u8; capacity]
//! ```
//!
//! The region is either a POSIX shared memory object (`shm_open`) or a
//! regular file; both are mapped with `memmap2`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use memmap2::MmapRaw;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{debug, info, warn};

use crate::error::ResourceError;

#[repr(C)]
pub struct SlotHeader {
    pub sequence: AtomicI32,
    pub data_size: AtomicU32,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

const _: () = assert!(HEADER_SIZE == 8);

#[derive(Debug, Clone)]
enum Backing {
    Shm(String),
    File(PathBuf),
}

impl Backing {
    fn name(&self) -> String {
        match self {
            Backing::Shm(name) => name.clone(),
            Backing::File(path) => path.display().to_string(),
        }
    }
}

pub struct SharedSegment {
    map: MmapRaw,
    backing: Backing,
    /// The creator removes the name on drop
    owner: bool,
}

impl SharedSegment {
    /// Creates (or reuses) the shm object `name` with room for `capacity`
    /// pixel bytes and initialises the header.
    pub fn create_shm(name: &str, capacity: usize) -> Result<Self, ResourceError> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP,
        )
        .map_err(|e| allocation(name, e.into()))?;
        let segment = Self::create_from(File::from(fd), Backing::Shm(name.to_owned()), capacity)?;
        info!(name, capacity, "shared segment created");
        Ok(segment)
    }

    /// Opens an existing shm object created by another process.
    pub fn open_shm(name: &str) -> Result<Self, ResourceError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| allocation(name, e.into()))?;
        Self::open_from(File::from(fd), Backing::Shm(name.to_owned()))
    }

    /// File-backed variant of [`create_shm`](Self::create_shm).
    pub fn create_file(path: &Path, capacity: usize) -> Result<Self, ResourceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| allocation(&path.display().to_string(), e))?;
        Self::create_from(file, Backing::File(path.to_owned()), capacity)
    }

    pub fn open_file(path: &Path) -> Result<Self, ResourceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| allocation(&path.display().to_string(), e))?;
        Self::open_from(file, Backing::File(path.to_owned()))
    }

    fn create_from(file: File, backing: Backing, capacity: usize) -> Result<Self, ResourceError> {
        let total = HEADER_SIZE + capacity;
        file.set_len(total as u64)
            .map_err(|e| allocation(&backing.name(), e))?;
        let map = MmapRaw::map_raw(&file).map_err(|e| allocation(&backing.name(), e))?;

        let segment = Self {
            map,
            backing,
            owner: true,
        };
        let header = segment.header();
        header.sequence.store(0, Ordering::Relaxed);
        header.data_size.store(capacity as u32, Ordering::Release);
        Ok(segment)
    }

    fn open_from(file: File, backing: Backing) -> Result<Self, ResourceError> {
        let map = MmapRaw::map_raw(&file).map_err(|e| allocation(&backing.name(), e))?;
        if map.len() <= HEADER_SIZE {
            return Err(ResourceError::SegmentTooSmall {
                name: backing.name(),
                expected: HEADER_SIZE + 1,
                actual: map.len(),
            });
        }
        debug!(name = %backing.name(), len = map.len(), "shared segment opened");
        Ok(Self {
            map,
            backing,
            owner: false,
        })
    }

    pub fn header(&self) -> &SlotHeader {
        // SAFETY: the mapping is page aligned, at least HEADER_SIZE long and
        // lives as long as `self`. The header is only accessed atomically.
        unsafe { &*(self.map.as_ptr() as *const SlotHeader) }
    }

    /// Pixel bytes available after the header.
    pub fn capacity(&self) -> usize {
        self.map.len() - HEADER_SIZE
    }

    /// Start of the pixel area. Other processes may access it concurrently,
    /// so it is only ever touched through raw copies.
    pub(crate) fn pixels_ptr(&self) -> *mut u8 {
        // SAFETY: HEADER_SIZE < map.len(), checked on construction
        unsafe { self.map.as_mut_ptr().add(HEADER_SIZE) }
    }

    pub fn name(&self) -> String {
        self.backing.name()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        if let Backing::Shm(name) = &self.backing {
            match shm_unlink(name.as_str()) {
                Ok(()) => debug!(name = %name, "shared segment unlinked"),
                Err(e) => warn!(name = %name, "shm_unlink failed: {}", e),
            }
        }
    }
}

fn allocation(name: &str, source: io::Error) -> ResourceError {
    ResourceError::Allocation {
        name: name.to_owned(),
        source,
    }
}

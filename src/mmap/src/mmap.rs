//! Builder-style wrapper over mmap(2) for mapping device windows and queue rings.
//!
//! Mappings are either shared against a device file descriptor at a given offset, or anonymous
//! and private when no device is present.
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

#[derive(Debug, Clone)]
pub struct MmapOptions {
    /// Mapped length. This option is mandatory for every mapping made through this crate.
    map_len: Option<usize>,
    /// Memory protection flags
    prot_flags: ProtFlags,
    /// Additional parameter for mmap
    map_flags: MapFlags,
    /// The file descriptor to the memory object (e.g., a device)
    fd: Option<RawFd>,
    /// The map starts at `file_off` offset in the memory object. `file_off` must be
    /// a multiple of the page size as returned by sysconf(_SC_PAGE_SIZE).
    file_off: libc::off_t,
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self {
            map_len: None,
            prot_flags: ProtFlags::empty(),
            map_flags: MapFlags::empty(),
            fd: None,
            file_off: 0,
        }
    }
}

impl MmapOptions {
    pub fn new() -> Self {
        MmapOptions::default()
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.file_off = offset as libc::off_t;
        self
    }

    pub fn len(&mut self, len: usize) -> &mut Self {
        self.map_len = Some(len);
        self
    }

    pub fn set_fd(&mut self, fd: RawFd) -> &mut Self {
        self.fd = Some(fd);
        self
    }

    /* ==================== Mmap Flags ==================== */
    pub fn anon(&mut self, enable: bool) -> &mut Self {
        self.map_flags.set(MapFlags::MAP_ANONYMOUS, enable);
        self
    }

    pub fn private(&mut self, enable: bool) -> &mut Self {
        self.map_flags.set(MapFlags::MAP_PRIVATE, enable);
        self
    }

    pub fn shared(&mut self, enable: bool) -> &mut Self {
        self.map_flags.set(MapFlags::MAP_SHARED, enable);
        self
    }

    pub fn populate(&mut self, enable: bool) -> &mut Self {
        self.map_flags.set(MapFlags::MAP_POPULATE, enable);
        self
    }

    /* ==================== Protection Flags ==================== */
    pub fn read(&mut self, enable: bool) -> &mut Self {
        self.prot_flags.set(ProtFlags::PROT_READ, enable);
        self
    }

    pub fn write(&mut self, enable: bool) -> &mut Self {
        self.prot_flags.set(ProtFlags::PROT_WRITE, enable);
        self
    }

    /// Creates the mapping. A device mapping (`set_fd`) is shared at `offset`; without a
    /// descriptor the mapping must be anonymous.
    pub fn mmap(&self) -> nix::Result<Mmap> {
        let map_len = match self.map_len {
            Some(len) if len > 0 => len,
            _ => return Err(nix::errno::Errno::EINVAL),
        };
        let (fd, off) = match self.fd {
            Some(fd) => (fd, self.file_off),
            None => {
                if !self.map_flags.contains(MapFlags::MAP_ANONYMOUS) {
                    return Err(nix::errno::Errno::EBADF);
                }
                (-1, 0)
            }
        };
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                map_len,
                self.prot_flags,
                self.map_flags,
                fd,
                off,
            )?
        };

        Ok(Mmap { ptr, len: map_len })
    }
}

#[repr(C)]
pub struct Mmap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr, self.len).unwrap_or_else(|e| eprintln!("failed to munmap: {}", e))
        };
    }
}

impl Mmap {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns a raw pointer to the mapped memory.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Returns an unsafe mutable pointer to the mapped memory.
    ///
    /// Writes through this pointer are visible to every other holder of the mapping (and to the
    /// device, for a shared mapping); the caller is responsible for ordering them.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Unmaps the region and reports the result, instead of logging it on drop.
    pub fn unmap(self) -> nix::Result<()> {
        let this = ManuallyDrop::new(self);
        unsafe { munmap(this.ptr, this.len) }
    }
}

// The mapping is plain memory; synchronization of its contents is left to the users.
unsafe impl Sync for Mmap {}
unsafe impl Send for Mmap {}

impl Deref for Mmap {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}

impl AsRef<[u8]> for Mmap {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.deref()
    }
}

impl DerefMut for Mmap {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }
}

impl fmt::Debug for Mmap {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Mmap")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

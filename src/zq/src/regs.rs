//! Device register window.
//!
//! All accesses to the queue control registers go through [`RegisterWindow`], so the ring
//! engine itself never does pointer arithmetic on the mapping.
use std::fmt;
use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};

use mmap::Mmap;

/// Writing 1 stops the queue, writing 0 starts it.
pub const QCM_STOP_OFFSET: usize = 0x40;
/// Bit 0 is set while the queue is still processing commands.
pub const QCM_ACTIVE_STATUS_ERROR_OFFSET: usize = 0x28;
/// Producer index published by `commit`, already masked to the ring size.
pub const QCM_CMD_QUEUE_TAIL_OFFSET: usize = 0x80;
/// Consumer index maintained by the device.
pub const QCM_CMD_QUEUE_HEAD_OFFSET: usize = 0xc0;
/// Device-side completion tail and the toggle it is currently writing.
pub const QCM_CMPL_QUEUE_TAIL_TOGGLE_OFFSET: usize = 0x100;
/// Size of the mapped register window.
pub const QCM_SIZE: usize = 0x1000;

pub const QCM_ACTIVE: u64 = 1;

/// Completion tail register: `index` in bits 0..16, the toggle in bit 31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmplTailToggle {
    pub index: u16,
    pub toggle: bool,
}

impl CmplTailToggle {
    const TOGGLE_BIT: u64 = 1 << 31;

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.index as u64 | if self.toggle { Self::TOGGLE_BIT } else { 0 }
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        CmplTailToggle {
            index: raw as u16,
            toggle: raw & Self::TOGGLE_BIT != 0,
        }
    }
}

/// Orders all prior stores to normal memory before any later store to the device.
#[inline(always)]
pub fn io_wmb() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("dsb st", options(nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::sync::atomic::fence(Ordering::Release);
    }
    compiler_fence(Ordering::SeqCst);
}

/// Orders the read of a completion's valid bit before the reads of its payload.
#[inline(always)]
pub fn io_rmb() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("dmb ld", options(nostack, preserves_flags));
    }
    #[cfg(target_arch = "x86_64")]
    {
        compiler_fence(Ordering::Acquire);
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::sync::atomic::fence(Ordering::Acquire);
    }
}

pub struct RegisterWindow {
    map: Mmap,
}

impl RegisterWindow {
    pub fn new(map: Mmap) -> Self {
        assert!(map.len() >= QCM_SIZE);
        RegisterWindow { map }
    }

    #[inline]
    fn reg(&self, offset: usize) -> *mut u64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.map.len());
        // SAFETY: in bounds and 8-byte aligned (the mapping is page aligned).
        unsafe { self.map.as_mut_ptr().add(offset) as *mut u64 }
    }

    #[inline]
    pub fn read64(&self, offset: usize) -> u64 {
        unsafe { ptr::read_volatile(self.reg(offset)) }
    }

    #[inline]
    pub fn write64(&self, offset: usize, val: u64) {
        unsafe { ptr::write_volatile(self.reg(offset), val) }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.read64(QCM_ACTIVE_STATUS_ERROR_OFFSET) & QCM_ACTIVE != 0
    }

    pub fn into_inner(self) -> Mmap {
        self.map
    }

    /// A snapshot of the interesting registers, for diagnostics.
    pub fn dump(&self) -> Vec<(usize, u64)> {
        (0x00..0x30)
            .step_by(0x08)
            .chain((0x40..0x108).step_by(0x40))
            .map(|off| (off, self.read64(off)))
            .collect()
    }
}

impl fmt::Debug for RegisterWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (off, val) in self.dump() {
            m.entry(&format_args!("qcm[{:#05x}]", off), &format_args!("{:#x}", val));
        }
        m.finish()
    }
}

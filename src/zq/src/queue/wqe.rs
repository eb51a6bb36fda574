//! Work entry layouts and the encoders that fill reserved submission slots.
use std::fmt;
use std::ptr;

use static_assertions::const_assert_eq;

use super::Queue;
use crate::{Error, Result};

pub const ENTRY_LEN: usize = 64;
/// Inline payload carried by immediate puts and returned by immediate gets.
pub const IMM_MAX: usize = 32;

pub const OPCODE_NOP: u16 = 0x00;
pub const OPCODE_PUT: u16 = 0x02;
pub const OPCODE_GET: u16 = 0x03;
pub const OPCODE_PUTIMM: u16 = 0x04;
pub const OPCODE_GETIMM: u16 = 0x05;
pub const OPCODE_ATM_SWAP: u16 = 0x20;
pub const OPCODE_ATM_ADD: u16 = 0x22;
pub const OPCODE_ATM_CAS: u16 = 0x2c;
pub const OPCODE_FENCE: u16 = 0x100;
pub const OPCODE_MASK: u16 = 0xff;

pub const ATOMIC_RETURN: u8 = 0x01;
pub const ATOMIC_SIZE_32: u8 = 0x02;
pub const ATOMIC_SIZE_64: u8 = 0x04;
pub const ATOMIC_SIZE_MASK: u8 = 0x0e;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WqHeader {
    pub opcode: u16,
    /// Context slot the matching completion resolves.
    pub cmp_index: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WqDma {
    pub hdr: WqHeader,
    pub len: u32,
    pub rd_addr: u64,
    pub wr_addr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WqImm {
    pub hdr: WqHeader,
    pub len: u32,
    pub rem_addr: u64,
    pub data: [u8; IMM_MAX],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WqAtomic {
    pub hdr: WqHeader,
    pub size: u8,
    pub _rsvd: [u8; 3],
    pub rem_addr: u64,
    pub operands: [u64; 2],
}

/// One submission ring entry.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub union WorkEntry {
    pub hdr: WqHeader,
    pub dma: WqDma,
    pub imm: WqImm,
    pub atm: WqAtomic,
    filler: [u8; ENTRY_LEN],
}

const_assert_eq!(std::mem::size_of::<WorkEntry>(), ENTRY_LEN);

impl WorkEntry {
    #[inline]
    pub fn zeroed() -> Self {
        WorkEntry {
            filler: [0; ENTRY_LEN],
        }
    }

    #[inline]
    pub fn header(&self) -> WqHeader {
        // SAFETY: every variant starts with the header and entries are built from zeroed().
        unsafe { self.hdr }
    }

    #[inline]
    pub fn opcode(&self) -> u16 {
        self.header().opcode & OPCODE_MASK
    }

    #[inline]
    pub fn is_fenced(&self) -> bool {
        self.header().opcode & OPCODE_FENCE != 0
    }

    #[inline]
    fn set_cmp_index(&mut self, index: u32) {
        debug_assert!(index < super::MAX_CMP_LEN);
        // SAFETY: see header().
        unsafe { self.hdr.cmp_index = index as u16 };
    }
}

impl fmt::Debug for WorkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: any bit pattern is a valid byte array.
        let bytes = unsafe { &self.filler };
        f.debug_struct("WorkEntry")
            .field("hdr", &self.header())
            .field("bytes", &&bytes[4..])
            .finish()
    }
}

#[inline]
fn fence_flag(fence: bool) -> u16 {
    if fence {
        OPCODE_FENCE
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    CompareAndSwap,
    Swap,
}

impl AtomicOp {
    #[inline]
    pub fn opcode(self) -> u16 {
        match self {
            AtomicOp::Add => OPCODE_ATM_ADD,
            AtomicOp::CompareAndSwap => OPCODE_ATM_CAS,
            AtomicOp::Swap => OPCODE_ATM_SWAP,
        }
    }

    /// Operands consumed by this operation.
    #[inline]
    pub fn operand_count(self) -> usize {
        match self {
            AtomicOp::CompareAndSwap => 2,
            AtomicOp::Add | AtomicOp::Swap => 1,
        }
    }
}

impl TryFrom<u32> for AtomicOp {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(AtomicOp::Add),
            1 => Ok(AtomicOp::CompareAndSwap),
            2 => Ok(AtomicOp::Swap),
            _ => Err(Error::InvalidArgument("atomic op")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicSize {
    Size32,
    Size64,
}

impl AtomicSize {
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            AtomicSize::Size32 => ATOMIC_SIZE_32,
            AtomicSize::Size64 => ATOMIC_SIZE_64,
        }
    }
}

impl TryFrom<u32> for AtomicSize {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            32 => Ok(AtomicSize::Size32),
            64 => Ok(AtomicSize::Size64),
            _ => Err(Error::InvalidArgument("atomic operand size")),
        }
    }
}

// Encoders.
//
// None of these reserve: `index` must come from `reserve` and must not have been committed yet.
// Arguments are checked before a context slot is taken, so a failed call leaves no trace.
impl<'d> Queue<'d> {
    /// Binds `context` to a completion slot and writes `entry` into submission slot `index`.
    ///
    /// Every encoder goes through here, so the completion index field is always the context
    /// slot, atomics included.
    #[inline]
    unsafe fn emit(&self, index: u32, mut entry: WorkEntry, context: u64) -> Result<()> {
        if context == 0 {
            return Err(Error::InvalidArgument("null context"));
        }
        let slot = self.contexts.acquire(context);
        entry.set_cmp_index(slot);
        ptr::write_volatile(self.wq.slot(index), entry);
        tracing::trace!(index, slot, opcode = entry.opcode(), "encoded");
        Ok(())
    }

    /// # Safety
    ///
    /// `index` must lie in a range returned by [`Queue::reserve`] that has not been committed, and
    /// no other thread may encode the same slot.
    pub unsafe fn no_op(&self, index: u32, fence: bool, context: u64) -> Result<()> {
        let mut e = WorkEntry::zeroed();
        e.hdr.opcode = OPCODE_NOP | fence_flag(fence);
        self.emit(index, e, context)
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn rw(
        &self,
        index: u32,
        fence: bool,
        rd_addr: u64,
        len: usize,
        wr_addr: u64,
        context: u64,
        opcode: u16,
    ) -> Result<()> {
        if len as u64 > self.max_dma_len() || len > u32::MAX as usize {
            return Err(Error::InvalidArgument("transfer exceeds max_dma_len"));
        }
        let mut e = WorkEntry::zeroed();
        e.dma = WqDma {
            hdr: WqHeader {
                opcode: opcode | fence_flag(fence),
                cmp_index: 0,
            },
            len: len as u32,
            rd_addr,
            wr_addr,
        };
        self.emit(index, e, context)
    }

    /// Writes `len` bytes from `local_addr` to `remote_addr`.
    ///
    /// # Safety
    ///
    /// The slot requirements of [`Queue::no_op`] apply. The local buffer must stay valid and
    /// unmodified until the completion for this entry has been polled.
    pub unsafe fn put(
        &self,
        index: u32,
        fence: bool,
        local_addr: u64,
        len: usize,
        remote_addr: u64,
        context: u64,
    ) -> Result<()> {
        self.rw(index, fence, local_addr, len, remote_addr, context, OPCODE_PUT)
    }

    /// Reads `len` bytes from `remote_addr` into `local_addr`.
    ///
    /// # Safety
    ///
    /// The slot requirements of [`Queue::no_op`] apply. The local buffer must stay valid and must
    /// not be accessed until the completion for this entry has been polled.
    pub unsafe fn get(
        &self,
        index: u32,
        fence: bool,
        local_addr: u64,
        len: usize,
        remote_addr: u64,
        context: u64,
    ) -> Result<()> {
        self.rw(index, fence, remote_addr, len, local_addr, context, OPCODE_GET)
    }

    /// Writes `buf` to `remote_addr`; the payload travels inside the entry.
    ///
    /// # Safety
    ///
    /// The slot requirements of [`Queue::no_op`] apply.
    pub unsafe fn put_immediate(
        &self,
        index: u32,
        fence: bool,
        buf: &[u8],
        remote_addr: u64,
        context: u64,
    ) -> Result<()> {
        if buf.is_empty() || buf.len() > IMM_MAX {
            return Err(Error::InvalidArgument("immediate length"));
        }
        let mut e = WorkEntry::zeroed();
        let mut data = [0u8; IMM_MAX];
        data[..buf.len()].copy_from_slice(buf);
        e.imm = WqImm {
            hdr: WqHeader {
                opcode: OPCODE_PUTIMM | fence_flag(fence),
                cmp_index: 0,
            },
            len: buf.len() as u32,
            rem_addr: remote_addr,
            data,
        };
        self.emit(index, e, context)
    }

    /// Reads `len` bytes from `remote_addr`; they come back in the completion's result.
    ///
    /// # Safety
    ///
    /// The slot requirements of [`Queue::no_op`] apply.
    pub unsafe fn get_immediate(
        &self,
        index: u32,
        fence: bool,
        len: usize,
        remote_addr: u64,
        context: u64,
    ) -> Result<()> {
        if len == 0 || len > IMM_MAX {
            return Err(Error::InvalidArgument("immediate length"));
        }
        let mut e = WorkEntry::zeroed();
        e.imm = WqImm {
            hdr: WqHeader {
                opcode: OPCODE_GETIMM | fence_flag(fence),
                cmp_index: 0,
            },
            len: len as u32,
            rem_addr: remote_addr,
            data: [0; IMM_MAX],
        };
        self.emit(index, e, context)
    }

    /// Encodes an atomic on `remote_addr`. `operands` holds one value for add and swap, and
    /// `[compare, swap]` for compare-and-swap. With `return_value` the prior remote value comes
    /// back in the completion's result.
    ///
    /// # Safety
    ///
    /// The slot requirements of [`Queue::no_op`] apply.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn atomic(
        &self,
        index: u32,
        fence: bool,
        return_value: bool,
        size: AtomicSize,
        op: AtomicOp,
        remote_addr: u64,
        operands: &[u64],
        context: u64,
    ) -> Result<()> {
        let n_operands = op.operand_count();
        if operands.len() < n_operands {
            return Err(Error::InvalidArgument("missing atomic operands"));
        }
        let mut atm = WqAtomic {
            hdr: WqHeader {
                opcode: op.opcode() | fence_flag(fence),
                cmp_index: 0,
            },
            size: size.bits() | if return_value { ATOMIC_RETURN } else { 0 },
            _rsvd: [0; 3],
            rem_addr: remote_addr,
            operands: [0; 2],
        };
        for i in (0..n_operands).rev() {
            atm.operands[i] = match size {
                AtomicSize::Size32 => operands[i] as u32 as u64,
                AtomicSize::Size64 => operands[i],
            };
        }
        let mut e = WorkEntry::zeroed();
        e.atm = atm;
        self.emit(index, e, context)
    }
}

//! Completion entries and the completion reader.
use std::ptr;
use std::sync::atomic::Ordering;

use static_assertions::const_assert_eq;

use super::ring::HeadTail;
use super::wqe::{ENTRY_LEN, IMM_MAX};
use super::Queue;
use crate::regs;
use crate::{Error, Result};

/// Bit 0 of the first byte; its expected value flips on every pass over the ring.
pub const CQ_VALID: u8 = 0x01;

pub const CQ_STATUS_SUCCESS: u8 = 0x00;
pub const CQ_STATUS_BAD_COMMAND: u8 = 0x01;
pub const CQ_STATUS_LOCAL_ERROR: u8 = 0x02;
pub const CQ_STATUS_REMOTE_ERROR: u8 = 0x03;

/// One completion ring entry, as written by the device.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy)]
pub struct CqEntry {
    pub valid: u8,
    pub status: u8,
    /// The `cmp_index` of the work entry this completes.
    pub index: u16,
    pub _rsvd: u32,
    pub result: [u8; IMM_MAX],
    pub _pad: [u8; 24],
}

const_assert_eq!(std::mem::size_of::<CqEntry>(), ENTRY_LEN);

impl CqEntry {
    pub fn new(valid: bool, status: u8, index: u16, result: [u8; IMM_MAX]) -> Self {
        CqEntry {
            valid: if valid { CQ_VALID } else { 0 },
            status,
            index,
            _rsvd: 0,
            result,
            _pad: [0; 24],
        }
    }
}

/// A consumed completion with the context bound at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: u8,
    pub index: u16,
    pub result: [u8; IMM_MAX],
    pub context: u64,
}

impl Completion {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == CQ_STATUS_SUCCESS
    }

    /// The first eight result bytes, e.g. the prior value returned by an atomic.
    #[inline]
    pub fn result_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.result[..8]);
        u64::from_le_bytes(b)
    }
}

/// The valid-bit value that marks a fresh entry at ring position `head`.
#[inline]
pub fn cq_valid(head: u32, qmask: u32) -> u8 {
    if head & (qmask + 1) != 0 {
        0
    } else {
        CQ_VALID
    }
}

impl<'d> Queue<'d> {
    /// Moves `head` from `old` to `old + 1`, leaving `tail` untouched. Fails with the current
    /// head if another reader got there first.
    fn advance_head(&self, old: u32) -> std::result::Result<(), u32> {
        let mut cur = self.head_tail.load(Ordering::Acquire);
        loop {
            let ht = HeadTail::unpack(cur);
            if ht.head != old {
                return Err(ht.head);
            }
            let new = HeadTail {
                head: old.wrapping_add(1),
                tail: ht.tail,
            };
            match self.head_tail.compare_exchange_weak(
                cur,
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(c) => cur = c,
            }
        }
    }

    /// Appends up to `max_entries` ready completions to `out` and returns how many were added.
    ///
    /// Never waits. When nothing is ready on the first slot the backend's `active_poll` is given
    /// one chance to produce completions; zero is a normal result.
    pub fn poll(&self, out: &mut Vec<Completion>, max_entries: usize) -> Result<usize> {
        if max_entries > isize::MAX as usize {
            return Err(Error::InvalidArgument("max_entries"));
        }

        let qmask = self.cq.mask();
        let mut polled = false;
        let mut count = 0;
        let mut old = HeadTail::unpack(self.head_tail.load(Ordering::Acquire)).head;

        while count < max_entries {
            let cqe = self.cq.slot(old);
            // SAFETY: slot() stays inside the completion ring.
            let valid = unsafe { ptr::read_volatile(cqe as *const u8) } & CQ_VALID;
            if valid != cq_valid(old, qmask) {
                if count > 0 || polled {
                    break;
                }
                match self.runtime().backend().active_poll(self, max_entries) {
                    Ok(()) => {
                        polled = true;
                        continue;
                    }
                    Err(Error::Unsupported(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            regs::io_rmb();
            let entry = unsafe { ptr::read_volatile(cqe) };
            if let Err(cur) = self.advance_head(old) {
                // Another reader took this slot; look at wherever head is now.
                old = cur;
                continue;
            }
            let context = match self.contexts.release(entry.index as u32) {
                Ok(context) => context,
                Err(e) => {
                    // The slot is already consumed; hand back what was collected before it.
                    tracing::error!(index = entry.index, "completion for unbound context: {}", e);
                    if count > 0 {
                        return Ok(count);
                    }
                    return Err(e);
                }
            };
            tracing::trace!(head = old, index = entry.index, context, "completed");
            out.push(Completion {
                status: entry.status,
                index: entry.index,
                result: entry.result,
                context,
            });
            old = old.wrapping_add(1);
            count += 1;
        }

        Ok(count)
    }
}

//! Submission slot reservation and in-order commit.
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::Ordering;

use mmap::Mmap;

use super::Queue;
use crate::regs::{self, QCM_CMD_QUEUE_TAIL_OFFSET};
use crate::{Error, Result};

/// A ring of fixed-size entries over a mapping. `ent` is a power of two.
pub(crate) struct Ring<T> {
    map: Mmap,
    ent: u32,
    _marker: PhantomData<T>,
}

impl<T> Ring<T> {
    pub(crate) fn new(map: Mmap, ent: u32) -> Result<Self> {
        if !ent.is_power_of_two() || map.len() < ent as usize * mem::size_of::<T>() {
            return Err(Error::InvalidArgument("ring mapping too small"));
        }
        Ok(Ring {
            map,
            ent,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn ent(&self) -> u32 {
        self.ent
    }

    #[inline]
    pub(crate) fn mask(&self) -> u32 {
        self.ent - 1
    }

    /// Pointer to the entry at `index`, wrapped to the ring.
    #[inline]
    pub(crate) fn slot(&self, index: u32) -> *mut T {
        let i = (index & self.mask()) as usize;
        // SAFETY: i < ent and the mapping holds ent entries.
        unsafe { (self.map.as_mut_ptr() as *mut T).add(i) }
    }

    pub(crate) fn into_inner(self) -> Mmap {
        self.map
    }
}

/// `{head, tail}` packed into one word: `head` in the low half, `tail` in the high half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct HeadTail {
    pub(crate) head: u32,
    pub(crate) tail: u32,
}

impl HeadTail {
    #[inline]
    pub(crate) fn pack(self) -> u64 {
        (self.tail as u64) << 32 | self.head as u64
    }

    #[inline]
    pub(crate) fn unpack(raw: u64) -> Self {
        HeadTail {
            head: raw as u32,
            tail: (raw >> 32) as u32,
        }
    }

    #[inline]
    pub(crate) fn outstanding(self) -> u32 {
        self.tail.wrapping_sub(self.head)
    }
}

impl<'d> Queue<'d> {
    /// Slots that may be outstanding at once. One slot stays empty so that a published tail
    /// never equals the device head of a full ring.
    #[inline]
    pub fn usable_slots(&self) -> u32 {
        self.wq.mask()
    }

    /// Claims `n` consecutive submission slots and returns the index of the first one.
    ///
    /// Fails with [`Error::WouldBlock`] without side effects when fewer than `n` slots are
    /// available; the caller retries after polling completions.
    pub fn reserve(&self, n: u32) -> Result<u32> {
        let qmask = self.wq.mask();
        if n < 1 || n > qmask {
            return Err(Error::InvalidArgument("reservation size"));
        }

        let mut old = HeadTail::unpack(self.head_tail.load(Ordering::Acquire));
        loop {
            let avail = qmask.wrapping_sub(old.outstanding());
            if avail < n {
                return Err(Error::WouldBlock);
            }
            let new = HeadTail {
                head: old.head,
                tail: old.tail.wrapping_add(n),
            };
            match self.head_tail.compare_exchange_weak(
                old.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!(start = old.tail, n, "reserved");
                    return Ok(old.tail);
                }
                Err(cur) => old = HeadTail::unpack(cur),
            }
        }
    }

    /// Publishes the encoded slots `[start, start + n)` to the device.
    ///
    /// Ranges must be committed in the order they were reserved: unless `start` is exactly the
    /// next index to publish this fails with [`Error::OutOfOrder`] and changes nothing.
    pub fn commit(&self, start: u32, n: u32) -> Result<()> {
        let qmask = self.wq.mask();
        if n < 1 || n > qmask {
            return Err(Error::InvalidArgument("commit size"));
        }

        let old = self.tail_commit.load(Ordering::Acquire);
        if old != start {
            return Err(Error::OutOfOrder {
                expected: old,
                found: start,
            });
        }
        let tail = HeadTail::unpack(self.head_tail.load(Ordering::Acquire)).tail;
        if tail.wrapping_sub(start) < n {
            return Err(Error::InvalidArgument("commit of unreserved slots"));
        }

        let new = old.wrapping_add(n);
        regs::io_wmb();
        self.qcm
            .write64(QCM_CMD_QUEUE_TAIL_OFFSET, (new & qmask) as u64);
        regs::io_wmb();
        self.tail_commit.store(new, Ordering::Release);
        tracing::trace!(start, n, "committed");
        Ok(())
    }

    /// `tail - head`: slots reserved and not yet completed.
    #[inline]
    pub fn outstanding(&self) -> u32 {
        HeadTail::unpack(self.head_tail.load(Ordering::Acquire)).outstanding()
    }

    /// The next index eligible for commit.
    #[inline]
    pub fn committed(&self) -> u32 {
        self.tail_commit.load(Ordering::Acquire)
    }
}

//! Lock-free pool binding completion indices to caller contexts.
//!
//! Free slots form a stack threaded through `links`; the head `{index, seq}` is swapped as one
//! 64-bit word so a pop racing with a pop-then-push of the same index fails its CAS.
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::thread;

use crossbeam::utils::CachePadded;

use super::MAX_CMP_LEN;
use crate::{Error, Result};

/// Terminates the free list.
pub const FREE_END: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeIndex {
    index: i32,
    seq: u32,
}

impl FreeIndex {
    #[inline]
    fn pack(self) -> u64 {
        (self.seq as u64) << 32 | self.index as u32 as u64
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        FreeIndex {
            index: raw as u32 as i32,
            seq: (raw >> 32) as u32,
        }
    }
}

pub(crate) struct ContextTable {
    free: CachePadded<AtomicU64>,
    /// Next free index, meaningful only while the slot is free.
    links: Box<[AtomicI32]>,
    /// The caller's context, meaningful only while the slot is in use.
    contexts: Box<[AtomicU64]>,
    in_use: Box<[AtomicBool]>,
}

impl ContextTable {
    /// Builds a table with `n` slots, all free and chained `0 -> 1 -> .. -> n-1 -> FREE_END`.
    pub(crate) fn new(n: u32) -> Result<Self> {
        if n == 0 || n > MAX_CMP_LEN {
            return Err(Error::InvalidArgument("context table size"));
        }
        let n = n as usize;
        let mut links = Vec::new();
        let mut contexts = Vec::new();
        let mut in_use = Vec::new();
        links
            .try_reserve_exact(n)
            .and_then(|_| contexts.try_reserve_exact(n))
            .and_then(|_| in_use.try_reserve_exact(n))
            .map_err(|_| Error::ResourceExhausted("context table"))?;

        links.extend((1..n as i32).map(AtomicI32::new));
        links.push(AtomicI32::new(FREE_END));
        contexts.extend((0..n).map(|_| AtomicU64::new(0)));
        in_use.extend((0..n).map(|_| AtomicBool::new(false)));

        let head = FreeIndex { index: 0, seq: 0 };
        Ok(ContextTable {
            free: CachePadded::new(AtomicU64::new(head.pack())),
            links: links.into_boxed_slice(),
            contexts: contexts.into_boxed_slice(),
            in_use: in_use.into_boxed_slice(),
        })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.links.len() as u32
    }

    /// Pops a free slot, or `None` if the pool is momentarily empty.
    pub(crate) fn try_acquire(&self, context: u64) -> Option<u32> {
        let mut old = FreeIndex::unpack(self.free.load(Ordering::Acquire));
        loop {
            if old.index == FREE_END {
                return None;
            }
            let new = FreeIndex {
                index: self.links[old.index as usize].load(Ordering::Relaxed),
                seq: old.seq.wrapping_add(1),
            };
            match self.free.compare_exchange_weak(
                old.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => old = FreeIndex::unpack(cur),
            }
        }
        let index = old.index as usize;
        self.contexts[index].store(context, Ordering::Release);
        self.in_use[index].store(true, Ordering::Release);
        Some(index as u32)
    }

    /// Pops a free slot, yielding until a completion returns one.
    pub(crate) fn acquire(&self, context: u64) -> u32 {
        loop {
            if let Some(index) = self.try_acquire(context) {
                return index;
            }
            // A completion has advanced head but not returned its slot yet.
            thread::yield_now();
        }
    }

    /// Returns `index` to the pool and hands back the context bound to it.
    pub(crate) fn release(&self, index: u32) -> Result<u64> {
        let slot = index as usize;
        if slot >= self.links.len() {
            return Err(Error::InvalidArgument("context index out of range"));
        }
        if !self.in_use[slot].swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidArgument("context slot is not in use"));
        }
        let context = self.contexts[slot].load(Ordering::Acquire);

        let mut old = FreeIndex::unpack(self.free.load(Ordering::Acquire));
        loop {
            self.links[slot].store(old.index, Ordering::Relaxed);
            let new = FreeIndex {
                index: slot as i32,
                seq: old.seq.wrapping_add(1),
            };
            match self.free.compare_exchange_weak(
                old.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(context),
                Err(cur) => old = FreeIndex::unpack(cur),
            }
        }
    }

    /// The context bound to `index`, if the slot is in use.
    pub(crate) fn peek(&self, index: u32) -> Option<u64> {
        let slot = index as usize;
        if slot < self.in_use.len() && self.in_use[slot].load(Ordering::Acquire) {
            Some(self.contexts[slot].load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Number of slots currently handed out.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use
            .iter()
            .filter(|b| b.load(Ordering::Relaxed))
            .count()
    }

    /// Length of the free list. Only exact while no other thread touches the table.
    pub(crate) fn free_len(&self) -> usize {
        let mut n = 0;
        let mut index = FreeIndex::unpack(self.free.load(Ordering::Acquire)).index;
        while index != FREE_END && n <= self.links.len() {
            n += 1;
            index = self.links[index as usize].load(Ordering::Relaxed);
        }
        n
    }
}

//! Queue lifecycle: allocation, mapping and teardown of a command/completion ring pair.
use std::any::Any;
use std::fmt;
use std::mem::ManuallyDrop;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::thread;

use crossbeam::utils::CachePadded;
use mmap::{Mmap, MmapOptions};

use crate::backend::{PeerId, Private, Runtime};
use crate::domain::Domain;
use crate::regs::{
    CmplTailToggle, RegisterWindow, QCM_CMD_QUEUE_HEAD_OFFSET, QCM_CMD_QUEUE_TAIL_OFFSET,
    QCM_CMPL_QUEUE_TAIL_TOGGLE_OFFSET, QCM_SIZE, QCM_STOP_OFFSET,
};
use crate::{Error, Result};

pub mod context;
pub mod cq;
pub mod ring;
pub mod wqe;

use context::ContextTable;
use cq::CqEntry;
use ring::Ring;
use wqe::WorkEntry;

/// All four slices of the chip.
pub const ALL_SLICES: u32 = 0x0f;
/// Let the device pick the slice.
pub const SLICE_DEMAND: u32 = 0x80;
/// Completion slots are named by the 16-bit `cmp_index`, which caps the completion ring.
pub const MAX_CMP_LEN: u32 = 1 << 16;

/// Where a region lives in the device file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub off: u64,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingRegion {
    pub off: u64,
    pub size: usize,
    /// Entries in the ring, a power of two.
    pub ent: u32,
}

/// Mapping parameters handed back by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInfo {
    pub qcm: Region,
    pub cmdq: RingRegion,
    pub cmplq: RingRegion,
}

/// A validated allocation request; both lengths are powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub cmd_len: u32,
    pub cmp_len: u32,
    pub traffic_class: u32,
    pub priority: u32,
    pub slice_mask: u32,
}

/// What the backend allocated for a queue.
pub struct QueueHw {
    /// The device file, or `None` when the backend emulates the device in memory.
    pub fd: Option<RawFd>,
    pub info: QueueInfo,
    pub private: Private,
}

impl fmt::Debug for QueueHw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHw")
            .field("fd", &self.fd)
            .field("info", &self.info)
            .finish()
    }
}

/// One open command/completion ring pair.
///
/// Every data path operation takes `&self`; the queue is meant to be shared between threads.
pub struct Queue<'d> {
    domain: &'d Domain<'d>,
    hw: QueueHw,
    qcm: ManuallyDrop<RegisterWindow>,
    wq: ManuallyDrop<Ring<WorkEntry>>,
    cq: ManuallyDrop<Ring<CqEntry>>,
    head_tail: CachePadded<AtomicU64>,
    tail_commit: CachePadded<AtomicU32>,
    contexts: ContextTable,
    torn_down: bool,
}

impl<'d> fmt::Debug for Queue<'d> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("hw", &self.hw)
            .field("head_tail", &ring::HeadTail::unpack(self.raw_head_tail()))
            .field("tail_commit", &self.committed())
            .field("qcm", &*self.qcm)
            .finish()
    }
}

fn map_region(fd: Option<RawFd>, off: u64, size: usize) -> Result<Mmap> {
    let mut opts = MmapOptions::new();
    opts.len(size).read(true).write(true);
    match fd {
        Some(fd) => opts.shared(true).set_fd(fd).offset(off),
        None => opts.anon(true).private(true),
    };
    opts.mmap().map_err(Error::Mmap)
}

impl<'d> Queue<'d> {
    /// Allocates and starts a queue in `domain`.
    ///
    /// Both lengths must be in `[2, max_tx_qlen]` and are rounded up to a power of two. If any
    /// step fails, everything set up so far is torn down before the error is returned.
    pub fn allocate(
        domain: &'d Domain<'d>,
        cmd_len: u32,
        cmp_len: u32,
        traffic_class: u32,
        priority: u32,
        slice_mask: u32,
    ) -> Result<Self> {
        let rt = domain.runtime();
        let limits = &rt.attr().limits;
        if cmd_len < 2 || cmd_len > limits.max_tx_qlen {
            return Err(Error::InvalidArgument("cmd_len"));
        }
        if cmp_len < 2 || cmp_len > limits.max_tx_qlen || cmp_len > MAX_CMP_LEN {
            return Err(Error::InvalidArgument("cmp_len"));
        }
        if traffic_class > limits.max_traffic_class {
            return Err(Error::InvalidArgument("traffic_class"));
        }
        if priority > limits.max_priority {
            return Err(Error::InvalidArgument("priority"));
        }
        if slice_mask & !(ALL_SLICES | SLICE_DEMAND) != 0 {
            return Err(Error::InvalidArgument("slice_mask"));
        }

        let req = QueueRequest {
            cmd_len: cmd_len.next_power_of_two(),
            cmp_len: cmp_len.next_power_of_two(),
            traffic_class,
            priority,
            slice_mask,
        };
        let backend = rt.backend();
        let hw = backend.allocate_queue(&req)?;

        let parts = Self::map_parts(&hw);
        let (qcm, wq, cq, contexts) = match parts {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(?hw, "queue setup failed: {}", e);
                if let Err(e2) = backend.free_queue(&hw) {
                    tracing::warn!("freeing half-built queue: {}", e2);
                }
                return Err(e);
            }
        };

        let zq = Queue {
            domain,
            hw,
            qcm: ManuallyDrop::new(qcm),
            wq: ManuallyDrop::new(wq),
            cq: ManuallyDrop::new(cq),
            head_tail: CachePadded::new(AtomicU64::new(0)),
            tail_commit: CachePadded::new(AtomicU32::new(0)),
            contexts,
            torn_down: false,
        };

        match backend.post_allocate(&zq) {
            Ok(()) | Err(Error::Unsupported(_)) => {}
            Err(e) => {
                tracing::error!("post_allocate failed: {}", e);
                // Mirrors a normal free; the backend error is what the caller sees.
                let _ = zq.free();
                return Err(e);
            }
        }

        let tail = CmplTailToggle {
            index: 0,
            toggle: true,
        };
        zq.qcm
            .write64(QCM_CMPL_QUEUE_TAIL_TOGGLE_OFFSET, tail.to_raw());
        zq.qcm.write64(QCM_CMD_QUEUE_HEAD_OFFSET, 0);
        zq.qcm.write64(QCM_CMD_QUEUE_TAIL_OFFSET, 0);
        zq.qcm.write64(QCM_STOP_OFFSET, 0);

        tracing::debug!(
            cmd_len = req.cmd_len,
            cmp_len = req.cmp_len,
            "queue allocated"
        );
        Ok(zq)
    }

    fn map_parts(
        hw: &QueueHw,
    ) -> Result<(RegisterWindow, Ring<WorkEntry>, Ring<CqEntry>, ContextTable)> {
        let info = &hw.info;
        if info.qcm.size < QCM_SIZE {
            return Err(Error::InvalidArgument("register window too small"));
        }
        if info.cmplq.ent > MAX_CMP_LEN {
            return Err(Error::InvalidArgument("completion ring wider than cmp_index"));
        }
        let contexts = ContextTable::new(info.cmplq.ent)?;
        // Mappings made before a failure are released when they go out of scope.
        let qcm = RegisterWindow::new(map_region(hw.fd, info.qcm.off, info.qcm.size)?);
        let wq = Ring::new(
            map_region(hw.fd, info.cmdq.off, info.cmdq.size)?,
            info.cmdq.ent,
        )?;
        let cq = Ring::new(
            map_region(hw.fd, info.cmplq.off, info.cmplq.size)?,
            info.cmplq.ent,
        )?;
        Ok((qcm, wq, cq, contexts))
    }

    /// Stops the queue, waits for the device to go idle, and releases everything.
    ///
    /// All three regions are unmapped even if one fails; the first error is returned.
    pub fn free(mut self) -> Result<()> {
        let ret = self.teardown();
        self.torn_down = true;
        ret
    }

    fn teardown(&mut self) -> Result<()> {
        self.qcm.write64(QCM_STOP_OFFSET, 1);
        while self.qcm.is_active() {
            thread::yield_now();
        }

        let backend = self.runtime().backend();
        match backend.pre_free(self) {
            Ok(()) | Err(Error::Unsupported(_)) => {}
            Err(e) => tracing::warn!("pre_free: {}", e),
        }

        let mut ret = Ok(());
        // SAFETY: teardown runs once; `torn_down` keeps Drop from running it again and nothing
        // touches the rings afterwards.
        let (qcm, wq, cq) = unsafe {
            (
                ManuallyDrop::take(&mut self.qcm),
                ManuallyDrop::take(&mut self.wq),
                ManuallyDrop::take(&mut self.cq),
            )
        };
        for (name, map) in [
            ("qcm", qcm.into_inner()),
            ("wq", wq.into_inner()),
            ("cq", cq.into_inner()),
        ] {
            if let Err(e) = map.unmap() {
                tracing::warn!("failed to unmap {}: {}", name, e);
                if ret.is_ok() {
                    ret = Err(Error::Mmap(e));
                }
            }
        }

        if let Err(e) = backend.free_queue(&self.hw) {
            if ret.is_ok() {
                ret = Err(e);
            }
        }
        tracing::debug!("queue freed");
        ret
    }

    #[inline]
    pub fn domain(&self) -> &'d Domain<'d> {
        self.domain
    }

    #[inline]
    pub fn runtime(&self) -> &'d Runtime {
        self.domain.runtime()
    }

    #[inline]
    pub fn hw(&self) -> &QueueHw {
        &self.hw
    }

    /// The backend's per-queue state.
    #[inline]
    pub fn private<T: Any>(&self) -> Option<&T> {
        self.hw.private.downcast_ref::<T>()
    }

    #[inline]
    pub fn cmd_len(&self) -> u32 {
        self.wq.ent()
    }

    #[inline]
    pub fn cmp_len(&self) -> u32 {
        self.cq.ent()
    }

    #[inline]
    pub(crate) fn max_dma_len(&self) -> u64 {
        self.runtime().attr().limits.max_dma_len
    }

    #[inline]
    fn raw_head_tail(&self) -> u64 {
        self.head_tail.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Completion slots currently bound to a context.
    pub fn contexts_in_use(&self) -> usize {
        self.contexts.in_use()
    }

    /// Free completion slots. Exact only while the queue is idle.
    pub fn contexts_free(&self) -> usize {
        self.contexts.free_len()
    }

    /// The context bound to completion slot `index`, if any.
    pub fn bound_context(&self, index: u16) -> Option<u64> {
        self.contexts.peek(index as u32)
    }

    /// Device-side access for backends that emulate the device.
    pub fn device(&self) -> DeviceView<'_> {
        DeviceView {
            qcm: &self.qcm,
            wq: &self.wq,
            cq: &self.cq,
        }
    }

    /* ==================== Backend passthroughs ==================== */

    /// Tells the transport that new work was committed.
    pub fn signal(&self) -> Result<()> {
        self.runtime().backend().signal(self)
    }

    pub fn exchange_address(&self, sock: RawFd, addr: &SocketAddr) -> Result<SocketAddr> {
        self.runtime().backend().exchange_address(self, sock, addr)
    }

    pub fn open_peer(&self, addr: &SocketAddr) -> Result<PeerId> {
        self.runtime().backend().open_peer(self, addr)
    }

    pub fn close_peer(&self, peer: PeerId) -> Result<()> {
        self.runtime().backend().close_peer(self, peer)
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        self.runtime().backend().local_address(self)
    }

    pub fn describe(&self) -> Result<String> {
        self.runtime().backend().describe(self)
    }
}

impl<'d> Drop for Queue<'d> {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(e) = self.teardown() {
                tracing::warn!("dropping queue: {}", e);
            }
            self.torn_down = true;
        }
    }
}

/// Frees `zq` if there is one; `None` succeeds trivially.
pub fn free_queue(zq: Option<Queue<'_>>) -> Result<()> {
    match zq {
        Some(zq) => zq.free(),
        None => Ok(()),
    }
}

/// The device's view of a queue: registers, committed work, completion slots.
pub struct DeviceView<'a> {
    qcm: &'a RegisterWindow,
    wq: &'a Ring<WorkEntry>,
    cq: &'a Ring<CqEntry>,
}

impl<'a> DeviceView<'a> {
    #[inline]
    pub fn registers(&self) -> &'a RegisterWindow {
        self.qcm
    }

    #[inline]
    pub fn cmd_len(&self) -> u32 {
        self.wq.ent()
    }

    #[inline]
    pub fn cmp_len(&self) -> u32 {
        self.cq.ent()
    }

    /// Reads the work entry at ring position `index`.
    #[inline]
    pub fn work_entry(&self, index: u32) -> WorkEntry {
        unsafe { ptr::read_volatile(self.wq.slot(index)) }
    }

    /// Writes the completion at ring position `index`. The payload is written first and the
    /// byte carrying the valid bit last.
    pub fn write_completion(&self, index: u32, entry: &CqEntry) {
        let slot = self.cq.slot(index);
        unsafe {
            let mut staged = *entry;
            staged.valid = ptr::read_volatile(slot as *const u8);
            ptr::write_volatile(slot, staged);
            crate::regs::io_wmb();
            ptr::write_volatile(slot as *mut u8, entry.valid);
        }
    }
}

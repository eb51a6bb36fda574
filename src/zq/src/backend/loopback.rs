//! A software backend that executes committed work inside the calling process.
//!
//! Queues are anonymous mappings. Work runs when the producer calls `signal` or when a reader
//! finds no completion ready; either way the backend walks the submission ring from its private
//! head up to the published tail and writes one completion per entry.
use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{FromRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nix::errno::Errno;
use spin::Mutex;

use super::{Backend, Limits, PeerId, Private};
use crate::config::LoopbackConfig;
use crate::domain::{AccessFlags, Domain, KeyData, KEY_MAGIC, KEY_VERSION};
use crate::queue::cq::{
    cq_valid, CqEntry, CQ_STATUS_BAD_COMMAND, CQ_STATUS_LOCAL_ERROR, CQ_STATUS_REMOTE_ERROR,
    CQ_STATUS_SUCCESS, CQ_VALID,
};
use crate::queue::wqe::*;
use crate::queue::{Queue, QueueHw, QueueInfo, QueueRequest, Region, RingRegion, MAX_CMP_LEN};
use crate::regs::{
    CmplTailToggle, QCM_ACTIVE, QCM_ACTIVE_STATUS_ERROR_OFFSET, QCM_CMD_QUEUE_HEAD_OFFSET,
    QCM_CMD_QUEUE_TAIL_OFFSET, QCM_CMPL_QUEUE_TAIL_TOGGLE_OFFSET, QCM_SIZE, QCM_STOP_OFFSET,
};
use crate::{Error, Result};

/// Length of an exported key blob.
pub const KEY_BLOB_LEN: usize = 40;
/// Length of an address on the wire: IPv4 address then port, both little endian.
const ADDR_LEN: usize = 6;

pub struct Loopback {
    limits: Limits,
    queues: AtomicU32,
    next_id: AtomicU32,
}

impl Loopback {
    pub fn new(config: &LoopbackConfig) -> Self {
        Loopback {
            limits: Limits {
                max_tx_queues: config.max_tx_queues,
                max_rx_queues: config.max_rx_queues,
                max_tx_qlen: config.max_tx_qlen,
                max_rx_qlen: config.max_rx_qlen,
                max_dma_len: config.max_dma_len,
                ..Limits::default()
            },
            queues: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
        }
    }

    /// Queues currently allocated through this backend.
    pub fn queues(&self) -> u32 {
        self.queues.load(Ordering::Relaxed)
    }
}

/// Registrations and imported keys of one domain.
#[derive(Debug, Default)]
pub struct LoopbackDomain {
    keys: Mutex<Vec<KeyData>>,
}

impl LoopbackDomain {
    pub fn keys(&self) -> usize {
        self.keys.lock().len()
    }

    /// Whether `[addr, addr + len)` lies inside one region granting `access`.
    fn check(&self, addr: u64, len: u64, access: AccessFlags) -> bool {
        let end = match addr.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        self.keys.lock().iter().any(|k| {
            k.access.contains(access) && k.zaddr <= addr && end <= k.zaddr.saturating_add(k.len)
        })
    }

    fn remove(&self, key: &KeyData) -> Result<()> {
        let mut keys = self.keys.lock();
        match keys.iter().position(|k| k == key) {
            Some(i) => {
                keys.swap_remove(i);
                Ok(())
            }
            None => Err(Error::Backend(Errno::ENOENT)),
        }
    }
}

#[derive(Debug, Default)]
struct Engine {
    /// Next submission slot to execute, masked.
    cmd_head: u32,
    /// Next completion slot to write, unmasked so its wrap parity gives the valid bit.
    cmpl_tail: u32,
    started: bool,
}

/// Per-queue state, stored as the queue's backend-private data.
#[derive(Debug)]
pub struct LoopbackQueue {
    id: u32,
    engine: Mutex<Engine>,
    peers: Mutex<Vec<Option<SocketAddr>>>,
    executed: AtomicU64,
}

impl LoopbackQueue {
    /// Entries executed so far.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

/// Queue ids double as loopback ports.
fn port_for(id: u32) -> Result<u16> {
    u16::try_from(id).map_err(|_| Error::ResourceExhausted("loopback port space"))
}

fn queue_state<'a>(zq: &'a Queue<'_>) -> Result<&'a LoopbackQueue> {
    zq.private::<LoopbackQueue>()
        .ok_or(Error::InvalidArgument("queue not allocated by loopback"))
}

fn domain_state<'a>(dom: &'a Domain<'_>) -> Result<&'a LoopbackDomain> {
    dom.private::<LoopbackDomain>()
        .ok_or(Error::InvalidArgument("domain not opened by loopback"))
}

fn ring_region(ent: u32) -> RingRegion {
    RingRegion {
        off: 0,
        size: mmap::page_align(ent as usize * ENTRY_LEN),
        ent,
    }
}

fn encode_addr(addr: &SocketAddr) -> Result<[u8; ADDR_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = [0u8; ADDR_LEN];
            buf[..4].copy_from_slice(&u32::from(*v4.ip()).to_le_bytes());
            buf[4..].copy_from_slice(&v4.port().to_le_bytes());
            Ok(buf)
        }
        SocketAddr::V6(_) => Err(Error::Unsupported("IPv6 address on loopback")),
    }
}

fn decode_addr(buf: &[u8; ADDR_LEN]) -> SocketAddr {
    let ip = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let port = u16::from_le_bytes([buf[4], buf[5]]);
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

fn io_errno(e: std::io::Error) -> Error {
    Error::Backend(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)))
}

impl Loopback {
    /// Runs every committed entry the engine has not seen yet.
    fn run(&self, zq: &Queue<'_>, engine: &mut Engine) -> Result<usize> {
        let dev = zq.device();
        let regs = dev.registers();
        if !engine.started || regs.read64(QCM_STOP_OFFSET) != 0 {
            return Ok(0);
        }
        let cmd_mask = dev.cmd_len() - 1;
        let cmp_mask = dev.cmp_len() - 1;
        let tail = regs.read64(QCM_CMD_QUEUE_TAIL_OFFSET) as u32 & cmd_mask;
        if engine.cmd_head == tail {
            return Ok(0);
        }

        let dom = domain_state(zq.domain())?;
        regs.write64(QCM_ACTIVE_STATUS_ERROR_OFFSET, QCM_ACTIVE);
        crate::regs::io_rmb();
        let mut n = 0;
        while engine.cmd_head != tail {
            let wqe = dev.work_entry(engine.cmd_head);
            let (status, result) = self.execute(dom, &wqe);
            if status != CQ_STATUS_SUCCESS {
                tracing::debug!(?wqe, status, "loopback command failed");
            }
            let valid = cq_valid(engine.cmpl_tail, cmp_mask) == CQ_VALID;
            let cqe = CqEntry::new(valid, status, wqe.header().cmp_index, result);
            dev.write_completion(engine.cmpl_tail, &cqe);

            engine.cmd_head = (engine.cmd_head + 1) & cmd_mask;
            engine.cmpl_tail = engine.cmpl_tail.wrapping_add(1);
            n += 1;
        }
        let toggle = CmplTailToggle {
            index: (engine.cmpl_tail & cmp_mask) as u16,
            toggle: cq_valid(engine.cmpl_tail, cmp_mask) == CQ_VALID,
        };
        regs.write64(QCM_CMD_QUEUE_HEAD_OFFSET, engine.cmd_head as u64);
        regs.write64(QCM_CMPL_QUEUE_TAIL_TOGGLE_OFFSET, toggle.to_raw());
        regs.write64(QCM_ACTIVE_STATUS_ERROR_OFFSET, 0);
        Ok(n)
    }

    fn execute(&self, dom: &LoopbackDomain, wqe: &WorkEntry) -> (u8, [u8; IMM_MAX]) {
        let mut result = [0u8; IMM_MAX];
        let status = match wqe.opcode() {
            OPCODE_NOP => CQ_STATUS_SUCCESS,
            OPCODE_PUT | OPCODE_GET => {
                // SAFETY: the opcode selects the variant.
                let dma = unsafe { wqe.dma };
                let (remote, access) = if wqe.opcode() == OPCODE_PUT {
                    (dma.wr_addr, AccessFlags::REMOTE_WRITE)
                } else {
                    (dma.rd_addr, AccessFlags::REMOTE_READ)
                };
                if dma.len as u64 > self.limits.max_dma_len {
                    CQ_STATUS_BAD_COMMAND
                } else if dma.rd_addr == 0 || dma.wr_addr == 0 {
                    CQ_STATUS_LOCAL_ERROR
                } else if !dom.check(remote, dma.len as u64, access) {
                    CQ_STATUS_REMOTE_ERROR
                } else {
                    // SAFETY: the remote side is registered and the encoder's contract keeps the
                    // local buffer alive until this completion is polled.
                    unsafe {
                        ptr::copy(
                            dma.rd_addr as *const u8,
                            dma.wr_addr as *mut u8,
                            dma.len as usize,
                        )
                    };
                    CQ_STATUS_SUCCESS
                }
            }
            op @ (OPCODE_PUTIMM | OPCODE_GETIMM) => {
                let imm = unsafe { wqe.imm };
                let len = imm.len as usize;
                let access = if op == OPCODE_PUTIMM {
                    AccessFlags::REMOTE_WRITE
                } else {
                    AccessFlags::REMOTE_READ
                };
                if len == 0 || len > IMM_MAX {
                    CQ_STATUS_BAD_COMMAND
                } else if !dom.check(imm.rem_addr, len as u64, access) {
                    CQ_STATUS_REMOTE_ERROR
                } else {
                    unsafe {
                        if op == OPCODE_PUTIMM {
                            ptr::copy_nonoverlapping(
                                imm.data.as_ptr(),
                                imm.rem_addr as *mut u8,
                                len,
                            );
                        } else {
                            ptr::copy_nonoverlapping(
                                imm.rem_addr as *const u8,
                                result.as_mut_ptr(),
                                len,
                            );
                        }
                    }
                    CQ_STATUS_SUCCESS
                }
            }
            OPCODE_ATM_ADD | OPCODE_ATM_SWAP | OPCODE_ATM_CAS => {
                let atm = unsafe { wqe.atm };
                match self.atomic(dom, wqe.opcode(), &atm) {
                    Ok(prev) => {
                        if atm.size & ATOMIC_RETURN != 0 {
                            result[..8].copy_from_slice(&prev.to_le_bytes());
                        }
                        CQ_STATUS_SUCCESS
                    }
                    Err(status) => status,
                }
            }
            _ => CQ_STATUS_BAD_COMMAND,
        };
        (status, result)
    }

    /// Returns the prior value, or the completion status on failure.
    fn atomic(
        &self,
        dom: &LoopbackDomain,
        opcode: u16,
        atm: &WqAtomic,
    ) -> std::result::Result<u64, u8> {
        let width: u64 = match atm.size & ATOMIC_SIZE_MASK {
            ATOMIC_SIZE_32 => 4,
            ATOMIC_SIZE_64 => 8,
            _ => return Err(CQ_STATUS_BAD_COMMAND),
        };
        let access = AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        if atm.rem_addr % width != 0 || !dom.check(atm.rem_addr, width, access) {
            return Err(CQ_STATUS_REMOTE_ERROR);
        }
        let [a, b] = atm.operands;
        // SAFETY: aligned and inside a registered region.
        let prev = unsafe {
            if width == 4 {
                let cell = &*(atm.rem_addr as *const AtomicU32);
                let (a, b) = (a as u32, b as u32);
                let prev = match opcode {
                    OPCODE_ATM_ADD => cell.fetch_add(a, Ordering::SeqCst),
                    OPCODE_ATM_SWAP => cell.swap(a, Ordering::SeqCst),
                    _ => cell
                        .compare_exchange(a, b, Ordering::SeqCst, Ordering::SeqCst)
                        .unwrap_or_else(|cur| cur),
                };
                u64::from(prev)
            } else {
                let cell = &*(atm.rem_addr as *const AtomicU64);
                match opcode {
                    OPCODE_ATM_ADD => cell.fetch_add(a, Ordering::SeqCst),
                    OPCODE_ATM_SWAP => cell.swap(a, Ordering::SeqCst),
                    _ => cell
                        .compare_exchange(a, b, Ordering::SeqCst, Ordering::SeqCst)
                        .unwrap_or_else(|cur| cur),
                }
            }
        };
        Ok(prev)
    }
}

impl Backend for Loopback {
    fn init(&self) -> Result<Limits> {
        if self.limits.max_tx_qlen < 2 || self.limits.max_tx_qlen > MAX_CMP_LEN {
            return Err(Error::InvalidArgument("loopback max_tx_qlen"));
        }
        Ok(self.limits)
    }

    fn open_domain(&self) -> Result<Private> {
        Ok(Box::new(LoopbackDomain::default()))
    }

    fn close_domain(&self, dom: &Domain<'_>) -> Result<()> {
        let keys = domain_state(dom)?.keys();
        if keys > 0 {
            tracing::warn!(keys, "domain closed with live registrations");
        }
        Ok(())
    }

    fn allocate_queue(&self, req: &QueueRequest) -> Result<QueueHw> {
        let max = self.limits.max_tx_queues;
        self.queues
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| Error::ResourceExhausted("loopback queues"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, ?req, "loopback queue allocated");
        Ok(QueueHw {
            fd: None,
            info: QueueInfo {
                qcm: Region {
                    off: 0,
                    size: QCM_SIZE,
                },
                cmdq: ring_region(req.cmd_len),
                cmplq: ring_region(req.cmp_len),
            },
            private: Box::new(LoopbackQueue {
                id,
                engine: Mutex::new(Engine::default()),
                peers: Mutex::new(Vec::new()),
                executed: AtomicU64::new(0),
            }),
        })
    }

    fn post_allocate(&self, zq: &Queue<'_>) -> Result<()> {
        let q = queue_state(zq)?;
        q.engine.lock().started = true;
        Ok(())
    }

    fn pre_free(&self, zq: &Queue<'_>) -> Result<()> {
        let q = queue_state(zq)?;
        let mut engine = q.engine.lock();
        engine.started = false;
        let open = q.peers.lock().iter().filter(|p| p.is_some()).count();
        if open > 0 {
            tracing::debug!(id = q.id, open, "queue freed with open peers");
        }
        Ok(())
    }

    fn free_queue(&self, hw: &QueueHw) -> Result<()> {
        if hw.private.downcast_ref::<LoopbackQueue>().is_none() {
            return Err(Error::InvalidArgument("queue not allocated by loopback"));
        }
        self.queues.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn register_memory(
        &self,
        dom: &Domain<'_>,
        addr: u64,
        len: u64,
        access: AccessFlags,
    ) -> Result<KeyData> {
        let key = KeyData::new(addr, addr, len, access);
        domain_state(dom)?.keys.lock().push(key);
        Ok(key)
    }

    fn deregister_memory(&self, dom: &Domain<'_>, key: &KeyData) -> Result<()> {
        domain_state(dom)?.remove(key)
    }

    fn import_remote_key(
        &self,
        dom: &Domain<'_>,
        _peer: PeerId,
        blob: &[u8],
        cpu_visible: bool,
    ) -> Result<KeyData> {
        if blob.len() != KEY_BLOB_LEN {
            return Err(Error::InvalidArgument("key blob length"));
        }
        let u32_at = |off: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&blob[off..off + 4]);
            u32::from_le_bytes(b)
        };
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&blob[off..off + 8]);
            u64::from_le_bytes(b)
        };
        if u32_at(0) != KEY_MAGIC || u32_at(4) != KEY_VERSION {
            return Err(Error::InvalidArgument("key blob tag"));
        }
        let access = AccessFlags::from_bits(u32_at(32))
            .ok_or(Error::InvalidArgument("key blob access"))?;
        let mut key = KeyData::new(u64_at(8), u64_at(16), u64_at(24), access);
        if cpu_visible {
            key.laddr = key.vaddr;
        }
        domain_state(dom)?.keys.lock().push(key);
        Ok(key)
    }

    fn export_remote_key(&self, _dom: &Domain<'_>, key: &KeyData) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(KEY_BLOB_LEN);
        blob.extend_from_slice(&key.magic.to_le_bytes());
        blob.extend_from_slice(&key.version.to_le_bytes());
        blob.extend_from_slice(&key.vaddr.to_le_bytes());
        blob.extend_from_slice(&key.zaddr.to_le_bytes());
        blob.extend_from_slice(&key.len.to_le_bytes());
        blob.extend_from_slice(&key.access.bits().to_le_bytes());
        blob.extend_from_slice(&[0u8; 4]);
        Ok(blob)
    }

    fn release_remote_key(&self, dom: &Domain<'_>, key: &KeyData) -> Result<()> {
        domain_state(dom)?.remove(key)
    }

    fn exchange_address(
        &self,
        _zq: &Queue<'_>,
        sock: RawFd,
        addr: &SocketAddr,
    ) -> Result<SocketAddr> {
        let ours = encode_addr(addr)?;
        // The caller keeps ownership of the socket.
        let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(sock) });
        file.write_all(&ours).map_err(io_errno)?;
        let mut theirs = [0u8; ADDR_LEN];
        file.read_exact(&mut theirs).map_err(io_errno)?;
        Ok(decode_addr(&theirs))
    }

    fn open_peer(&self, zq: &Queue<'_>, addr: &SocketAddr) -> Result<PeerId> {
        let q = queue_state(zq)?;
        let mut peers = q.peers.lock();
        let slot = match peers.iter().position(Option::is_none) {
            Some(i) => {
                peers[i] = Some(*addr);
                i
            }
            None => {
                peers.push(Some(*addr));
                peers.len() - 1
            }
        };
        Ok(PeerId(slot as u32))
    }

    fn close_peer(&self, zq: &Queue<'_>, peer: PeerId) -> Result<()> {
        let q = queue_state(zq)?;
        match q.peers.lock().get_mut(peer.0 as usize) {
            Some(p @ Some(_)) => {
                *p = None;
                Ok(())
            }
            _ => Err(Error::InvalidArgument("unknown peer")),
        }
    }

    fn local_address(&self, zq: &Queue<'_>) -> Result<SocketAddr> {
        let q = queue_state(zq)?;
        Ok(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            port_for(q.id)?,
        )))
    }

    fn active_poll(&self, zq: &Queue<'_>, _hint: usize) -> Result<()> {
        let q = queue_state(zq)?;
        // Whoever holds the engine is already producing completions.
        if let Some(mut engine) = q.engine.try_lock() {
            let n = self.run(zq, &mut engine)?;
            q.executed.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn signal(&self, zq: &Queue<'_>) -> Result<()> {
        let q = queue_state(zq)?;
        let mut engine = q.engine.lock();
        let n = self.run(zq, &mut engine)?;
        q.executed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    fn describe(&self, zq: &Queue<'_>) -> Result<String> {
        let q = queue_state(zq)?;
        let engine = q.engine.lock();
        Ok(format!(
            "loopback queue {}: cmd {}/{} cmpl tail {} executed {}",
            q.id,
            engine.cmd_head,
            zq.cmd_len(),
            engine.cmpl_tail,
            q.executed()
        ))
    }
}

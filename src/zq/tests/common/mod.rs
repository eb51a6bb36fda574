#![allow(dead_code)]
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use zq::backend::loopback::Loopback;
use zq::config::LoopbackConfig;
use zq::queue::{QueueHw, QueueRequest};
use zq::{AccessFlags, Backend, BackendKind, Domain, KeyData, Limits, PeerId, Private, Queue};
use zq::{Error, Result, Runtime};

/// Loopback with call counters and injectable misbehavior.
pub struct Counting {
    pub inner: Loopback,
    pub inits: AtomicUsize,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub fail_post_allocate: AtomicBool,
    /// When nonzero, `init` advertises this `max_tx_qlen`.
    pub advertise_qlen: AtomicU32,
    /// When nonzero, `allocate_queue` reports this many completion entries.
    pub report_cmplq_ent: AtomicU32,
}

impl Counting {
    pub fn new(config: &LoopbackConfig) -> Self {
        Counting {
            inner: Loopback::new(config),
            inits: AtomicUsize::new(0),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            fail_post_allocate: AtomicBool::new(false),
            advertise_qlen: AtomicU32::new(0),
            report_cmplq_ent: AtomicU32::new(0),
        }
    }
}

impl Backend for Counting {
    fn init(&self) -> Result<Limits> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let mut limits = self.inner.init()?;
        match self.advertise_qlen.load(Ordering::SeqCst) {
            0 => {}
            qlen => limits.max_tx_qlen = qlen,
        }
        Ok(limits)
    }

    fn open_domain(&self) -> Result<Private> {
        self.inner.open_domain()
    }

    fn close_domain(&self, dom: &Domain<'_>) -> Result<()> {
        self.inner.close_domain(dom)
    }

    fn allocate_queue(&self, req: &QueueRequest) -> Result<QueueHw> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        let mut hw = self.inner.allocate_queue(req)?;
        match self.report_cmplq_ent.load(Ordering::SeqCst) {
            0 => {}
            ent => hw.info.cmplq.ent = ent,
        }
        Ok(hw)
    }

    fn post_allocate(&self, zq: &Queue<'_>) -> Result<()> {
        if self.fail_post_allocate.load(Ordering::SeqCst) {
            return Err(Error::Backend(nix::errno::Errno::EIO));
        }
        self.inner.post_allocate(zq)
    }

    fn pre_free(&self, zq: &Queue<'_>) -> Result<()> {
        self.inner.pre_free(zq)
    }

    fn free_queue(&self, hw: &QueueHw) -> Result<()> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.inner.free_queue(hw)
    }

    fn register_memory(
        &self,
        dom: &Domain<'_>,
        addr: u64,
        len: u64,
        access: AccessFlags,
    ) -> Result<KeyData> {
        self.inner.register_memory(dom, addr, len, access)
    }

    fn deregister_memory(&self, dom: &Domain<'_>, key: &KeyData) -> Result<()> {
        self.inner.deregister_memory(dom, key)
    }

    fn import_remote_key(
        &self,
        dom: &Domain<'_>,
        peer: PeerId,
        blob: &[u8],
        cpu_visible: bool,
    ) -> Result<KeyData> {
        self.inner.import_remote_key(dom, peer, blob, cpu_visible)
    }

    fn export_remote_key(&self, dom: &Domain<'_>, key: &KeyData) -> Result<Vec<u8>> {
        self.inner.export_remote_key(dom, key)
    }

    fn release_remote_key(&self, dom: &Domain<'_>, key: &KeyData) -> Result<()> {
        self.inner.release_remote_key(dom, key)
    }

    fn exchange_address(
        &self,
        zq: &Queue<'_>,
        sock: RawFd,
        addr: &SocketAddr,
    ) -> Result<SocketAddr> {
        self.inner.exchange_address(zq, sock, addr)
    }

    fn open_peer(&self, zq: &Queue<'_>, addr: &SocketAddr) -> Result<PeerId> {
        self.inner.open_peer(zq, addr)
    }

    fn close_peer(&self, zq: &Queue<'_>, peer: PeerId) -> Result<()> {
        self.inner.close_peer(zq, peer)
    }

    fn local_address(&self, zq: &Queue<'_>) -> Result<SocketAddr> {
        self.inner.local_address(zq)
    }

    fn active_poll(&self, zq: &Queue<'_>, hint: usize) -> Result<()> {
        self.inner.active_poll(zq, hint)
    }

    fn signal(&self, zq: &Queue<'_>) -> Result<()> {
        self.inner.signal(zq)
    }

    fn describe(&self, zq: &Queue<'_>) -> Result<String> {
        self.inner.describe(zq)
    }
}

pub fn loopback_runtime(config: &LoopbackConfig) -> Runtime {
    Runtime::new(BackendKind::Software, Arc::new(Loopback::new(config))).unwrap()
}

pub fn counting_runtime() -> (Arc<Counting>, Runtime) {
    counting_runtime_with(|_| {})
}

/// Like `counting_runtime`, with the backend adjusted before the runtime queries its limits.
pub fn counting_runtime_with(setup: impl FnOnce(&Counting)) -> (Arc<Counting>, Runtime) {
    let backend = Arc::new(Counting::new(&LoopbackConfig::default()));
    setup(&backend);
    let rt = Runtime::new(BackendKind::Software, backend.clone()).unwrap();
    (backend, rt)
}

//! The backend capability table and the process-wide runtime built on top of it.
//!
//! Exactly one backend is active per process. It is chosen by registration order, with a
//! hardware backend always preferred over a software one, and frozen by the first call to
//! [`init`].
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use spin::{Mutex, Once};

use crate::config::{BackendSelect, Config};
use crate::domain::{AccessFlags, Domain, KeyData};
use crate::queue::{Queue, QueueHw, QueueRequest};
use crate::{Error, Result};

pub mod loopback;

/// Version of the interface between callers and this library.
pub const API_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Talks to the device driver; queues are shared mappings of the device file.
    Hardware,
    /// Emulates the device in software; queues are anonymous private mappings.
    Software,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Hardware => f.write_str("hardware"),
            BackendKind::Software => f.write_str("software"),
        }
    }
}

/// Capability limits reported by a backend when it is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_tx_queues: u32,
    pub max_rx_queues: u32,
    pub max_tx_qlen: u32,
    pub max_rx_qlen: u32,
    pub max_dma_len: u64,
    pub max_traffic_class: u32,
    pub max_priority: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_tx_queues: 1024,
            max_rx_queues: 1024,
            max_tx_qlen: 1 << 15,
            max_rx_qlen: 1 << 15,
            max_dma_len: 1 << 31,
            max_traffic_class: 15,
            max_priority: 1,
        }
    }
}

/// Read-only snapshot of the active backend's identity and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    pub backend: BackendKind,
    pub limits: Limits,
}

/// Backend-private state attached to a domain or a queue.
pub type Private = Box<dyn Any + Send + Sync>;

/// Identifies an opened peer on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

/// The operations a transport implementation supplies.
///
/// The methods with default bodies are optional; their defaults report
/// [`Error::Unsupported`]. The queue lifecycle treats an unsupported `post_allocate`/`pre_free`
/// as absent, and `poll` treats an unsupported `active_poll` the same way.
pub trait Backend: Send + Sync {
    fn init(&self) -> Result<Limits>;

    fn open_domain(&self) -> Result<Private>;
    fn close_domain(&self, dom: &Domain<'_>) -> Result<()>;

    /// Allocates the device queue. Lengths are already powers of two.
    fn allocate_queue(&self, req: &QueueRequest) -> Result<QueueHw>;
    fn post_allocate(&self, _zq: &Queue<'_>) -> Result<()> {
        Err(Error::Unsupported("post_allocate"))
    }
    fn pre_free(&self, _zq: &Queue<'_>) -> Result<()> {
        Err(Error::Unsupported("pre_free"))
    }
    fn free_queue(&self, hw: &QueueHw) -> Result<()>;

    fn register_memory(
        &self,
        dom: &Domain<'_>,
        addr: u64,
        len: u64,
        access: AccessFlags,
    ) -> Result<KeyData>;
    fn deregister_memory(&self, dom: &Domain<'_>, key: &KeyData) -> Result<()>;
    fn import_remote_key(
        &self,
        dom: &Domain<'_>,
        peer: PeerId,
        blob: &[u8],
        cpu_visible: bool,
    ) -> Result<KeyData>;
    fn import_fam_key(&self, _dom: &Domain<'_>, _peer: PeerId, _cpu_visible: bool) -> Result<KeyData> {
        Err(Error::Unsupported("import_fam_key"))
    }
    fn export_remote_key(&self, dom: &Domain<'_>, key: &KeyData) -> Result<Vec<u8>>;
    fn release_remote_key(&self, dom: &Domain<'_>, key: &KeyData) -> Result<()>;

    /// Swaps addresses with the peer at the other end of `sock`.
    fn exchange_address(&self, zq: &Queue<'_>, sock: RawFd, addr: &SocketAddr)
        -> Result<SocketAddr>;
    fn open_peer(&self, zq: &Queue<'_>, addr: &SocketAddr) -> Result<PeerId>;
    fn close_peer(&self, zq: &Queue<'_>, peer: PeerId) -> Result<()>;
    fn local_address(&self, zq: &Queue<'_>) -> Result<SocketAddr>;

    /// Gives a software transport a chance to make progress while a reader is waiting.
    fn active_poll(&self, _zq: &Queue<'_>, _hint: usize) -> Result<()> {
        Err(Error::Unsupported("active_poll"))
    }
    /// Tells the transport that new commands were committed.
    fn signal(&self, zq: &Queue<'_>) -> Result<()>;
    fn describe(&self, _zq: &Queue<'_>) -> Result<String> {
        Err(Error::Unsupported("describe"))
    }
}

/// The initialized backend. Immutable once constructed.
pub struct Runtime {
    backend: Arc<dyn Backend>,
    attr: Attr,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("attr", &self.attr).finish()
    }
}

impl Runtime {
    /// Initializes `backend` outside of the process-wide registry.
    pub fn new(kind: BackendKind, backend: Arc<dyn Backend>) -> Result<Self> {
        let limits = backend.init()?;
        tracing::debug!(%kind, ?limits, "backend initialized");
        Ok(Runtime {
            backend,
            attr: Attr {
                backend: kind,
                limits,
            },
        })
    }

    #[inline]
    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    #[inline]
    pub fn attr(&self) -> &Attr {
        &self.attr
    }

    #[inline]
    pub fn is_hardware(&self) -> bool {
        self.attr.backend == BackendKind::Hardware
    }
}

struct Registration {
    kind: BackendKind,
    backend: Arc<dyn Backend>,
}

lazy_static! {
    static ref REGISTERED: Mutex<Option<Registration>> = Mutex::new(None);
}

static RUNTIME: Once<Result<Runtime>> = Once::new();

/// Makes `backend` the active implementation, unless a hardware backend is already registered
/// and this one is software. Has no effect once [`init`] has run.
pub fn register_backend(kind: BackendKind, backend: Arc<dyn Backend>) {
    if RUNTIME.is_completed() {
        tracing::warn!(%kind, "backend registered after init, ignored");
        return;
    }
    let mut slot = REGISTERED.lock();
    if let Some(cur) = slot.as_ref() {
        if cur.kind == BackendKind::Hardware && kind == BackendKind::Software {
            tracing::debug!("hardware backend present, software backend not selected");
            return;
        }
    }
    tracing::debug!(%kind, "backend registered");
    *slot = Some(Registration { kind, backend });
}

/// Initializes the process-wide runtime with the default configuration.
pub fn init(api_version: u32) -> Result<&'static Runtime> {
    init_with_config(api_version, &Config::default())
}

/// Initializes the process-wide runtime. The first call decides the outcome; later calls
/// observe it without running the backend setup again.
pub fn init_with_config(api_version: u32, config: &Config) -> Result<&'static Runtime> {
    if api_version != API_VERSION {
        return Err(Error::ApiVersion {
            expected: API_VERSION,
            found: api_version,
        });
    }

    let res = RUNTIME.call_once(|| {
        let mut slot = REGISTERED.lock();
        if slot.is_none() {
            match config.backend {
                BackendSelect::Auto | BackendSelect::Loopback => {
                    tracing::info!("no backend registered, using loopback");
                    *slot = Some(Registration {
                        kind: BackendKind::Software,
                        backend: Arc::new(loopback::Loopback::new(&config.loopback)),
                    });
                }
                BackendSelect::None => {}
            }
        }
        match slot.take() {
            Some(reg) => Runtime::new(reg.kind, reg.backend),
            None => Err(Error::Unsupported("no backend registered")),
        }
    });
    res.as_ref().map_err(Clone::clone)
}

/// The runtime, if [`init`] has succeeded.
pub fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get().and_then(|r| r.as_ref().ok())
}

/// The attribute snapshot of the initialized runtime.
pub fn query_attr() -> Result<Attr> {
    runtime()
        .map(|rt| *rt.attr())
        .ok_or(Error::InvalidArgument("runtime not initialized"))
}

/// Whether the active backend drives real hardware.
pub fn is_hardware() -> bool {
    runtime().map_or(false, Runtime::is_hardware)
}

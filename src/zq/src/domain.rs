//! Registration and addressing scope for queues.
use std::any::Any;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::backend::{PeerId, Private, Runtime};
use crate::{Error, Result};

/// Tag carried by every key descriptor handed out by a backend.
pub const KEY_MAGIC: u32 = 0x5a48_5045;
pub const KEY_VERSION: u32 = 1;

bitflags! {
    /// Access granted on a registered region.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_READ = 0b00000001;
        const LOCAL_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
        const REMOTE_WRITE = 0b00001000;
        const ALL = 0b00001111;
    }
}

/// Describes a local registration or an imported remote key.
///
/// Backends define their own wire form for export; this struct is only the in-process view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyData {
    pub magic: u32,
    pub version: u32,
    /// Virtual address of the region in the owner's address space.
    pub vaddr: u64,
    /// Address the fabric uses to reach the region.
    pub zaddr: u64,
    pub len: u64,
    pub access: AccessFlags,
    /// Local address at which an imported region is mapped, when CPU visible.
    pub laddr: u64,
}

impl KeyData {
    pub fn new(vaddr: u64, zaddr: u64, len: u64, access: AccessFlags) -> Self {
        KeyData {
            magic: KEY_MAGIC,
            version: KEY_VERSION,
            vaddr,
            zaddr,
            len,
            access,
            laddr: 0,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == KEY_MAGIC && self.version == KEY_VERSION
    }
}

/// A domain opened through the runtime's backend. Closed on drop.
pub struct Domain<'rt> {
    runtime: &'rt Runtime,
    private: Private,
}

impl<'rt> fmt::Debug for Domain<'rt> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("backend", &self.runtime.attr().backend)
            .finish()
    }
}

impl<'rt> Drop for Domain<'rt> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.backend().close_domain(self) {
            tracing::warn!("closing domain: {}", e);
        }
    }
}

impl<'rt> Domain<'rt> {
    pub fn open(runtime: &'rt Runtime) -> Result<Self> {
        let private = runtime.backend().open_domain()?;
        tracing::debug!("domain opened");
        Ok(Domain { runtime, private })
    }

    #[inline]
    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    /// The backend's per-domain state.
    #[inline]
    pub fn private<T: Any>(&self) -> Option<&T> {
        self.private.downcast_ref::<T>()
    }

    pub fn register_memory(&self, buf: &[u8], access: AccessFlags) -> Result<KeyData> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty registration"));
        }
        self.runtime.backend().register_memory(
            self,
            buf.as_ptr() as u64,
            buf.len() as u64,
            access,
        )
    }

    pub fn deregister_memory(&self, key: KeyData) -> Result<()> {
        self.runtime.backend().deregister_memory(self, &key)
    }

    pub fn import_remote_key(&self, peer: PeerId, blob: &[u8], cpu_visible: bool) -> Result<KeyData> {
        if blob.is_empty() {
            return Err(Error::InvalidArgument("empty key blob"));
        }
        self.runtime
            .backend()
            .import_remote_key(self, peer, blob, cpu_visible)
    }

    /// Imports fabric-attached memory exposed by `peer`.
    pub fn import_fam_key(&self, peer: PeerId, cpu_visible: bool) -> Result<KeyData> {
        self.runtime.backend().import_fam_key(self, peer, cpu_visible)
    }

    pub fn export_remote_key(&self, key: &KeyData) -> Result<Vec<u8>> {
        if !key.is_valid() {
            return Err(Error::InvalidArgument("not a key descriptor"));
        }
        self.runtime.backend().export_remote_key(self, key)
    }

    pub fn release_remote_key(&self, key: KeyData) -> Result<()> {
        self.runtime.backend().release_remote_key(self, &key)
    }
}

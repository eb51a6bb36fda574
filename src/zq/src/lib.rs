//! A multi-producer command queue engine for a userspace fabric interface.
//!
//! Callers [`reserve`](Queue::reserve) submission slots, encode work into them, publish them with
//! [`commit`](Queue::commit), and later [`poll`](Queue::poll) completions that hand back the
//! context bound at encode time. The transport underneath is a [`Backend`], chosen once per
//! process by [`init`].
pub extern crate tracing;
// alias
pub extern crate tracing as log;

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod queue;
pub mod regs;

pub use backend::{
    init, init_with_config, is_hardware, query_attr, register_backend, runtime, Attr, Backend,
    BackendKind, Limits, PeerId, Private, Runtime, API_VERSION,
};
pub use config::Config;
pub use domain::{AccessFlags, Domain, KeyData};
pub use error::{status, Error, Result};
pub use queue::cq::Completion;
pub use queue::wqe::{AtomicOp, AtomicSize};
pub use queue::{free_queue, Queue};

/// Allocates a queue; see [`Queue::allocate`].
pub fn allocate_queue<'d>(
    domain: &'d Domain<'d>,
    cmd_len: u32,
    cmp_len: u32,
    traffic_class: u32,
    priority: u32,
    slice_mask: u32,
) -> Result<Queue<'d>> {
    Queue::allocate(domain, cmd_len, cmp_len, traffic_class, priority, slice_mask)
}

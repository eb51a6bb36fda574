#![allow(clippy::len_without_is_empty)]
pub mod mmap;
pub use self::mmap::{Mmap, MmapOptions};

/// Rounds `len` up to a multiple of the system page size.
#[inline]
pub fn page_align(len: usize) -> usize {
    let page = page_size::get();
    (len + page - 1) & !(page - 1)
}

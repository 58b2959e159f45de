//! Resolution of consumer page faults against the buffer pool.
//!
//! The consumer sees the chunks of the pool back to back, each with its full (allocated) size.
//! Faults only read chunk sizes and addresses, which never change while the pool exists, so they
//! can be served while transfers complete into the very same memory.

use std::sync::Arc;
use std::{cmp, ptr};

use common::PAGE_SIZE;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// The page backing one offset of the mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageAddress {
    /// Index of the chunk holding the page.
    pub chunk: usize,
    /// Page-aligned offset of the page inside that chunk.
    pub offset: usize,
    /// Bus address of the page.
    pub address: usize,
    /// Host-side address of the page.
    pub host: *mut u8,
}

/// Translates a mapping offset to the page that backs it, walking the chunks in order. Offsets
/// at or past the end of the last chunk fail with [Error::Fault].
pub fn resolve(pool: &BufferPool, offset: usize) -> Result<PageAddress> {
    let page = offset & !(PAGE_SIZE - 1);
    let mut start = 0;

    for chunk in pool.chunks() {
        let end = start + chunk.full_size();
        if page < end {
            let within = page - start;
            return Ok(PageAddress {
                chunk: chunk.index(),
                offset: within,
                address: chunk.address() + within,
                host: chunk.base().wrapping_add(within),
            });
        }
        start = end;
    }
    Err(Error::Fault)
}

/// The consumer's view of the buffer pool, handed out by a successful mapping request.
///
/// Once the session is closed the pool is released and every further access faults.
#[derive(Clone)]
pub struct MappedRegion {
    pool: Arc<RwLock<BufferPool>>,
    len: usize,
}

impl MappedRegion {
    pub(crate) fn new(pool: Arc<RwLock<BufferPool>>, len: usize) -> Self {
        Self { pool, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resolves the page fault at `offset`.
    pub fn resolve(&self, offset: usize) -> Result<PageAddress> {
        if offset >= self.len {
            return Err(Error::Fault);
        }
        resolve(&self.pool.read(), offset)
    }

    /// Copies bytes out of the mapping starting at `offset`, page by page. Returns the number of
    /// bytes copied, which is short only at the end of the mapping.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let pool = self.pool.read();
        let end = cmp::min(self.len, offset.saturating_add(buf.len()));

        let mut pos = offset;
        while pos < end {
            let page = resolve(&pool, pos)?;
            let in_page = pos % PAGE_SIZE;
            let count = cmp::min(PAGE_SIZE - in_page, end - pos);
            // SAFETY: the page lies inside a live chunk, and the read lock keeps the pool from
            // being released while copying.
            unsafe {
                ptr::copy_nonoverlapping(
                    page.host.add(in_page),
                    buf[pos - offset..].as_mut_ptr(),
                    count,
                );
            }
            pos += count;
        }
        Ok(end.saturating_sub(offset))
    }
}

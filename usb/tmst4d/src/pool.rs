//! The DMA buffer pool behind one streaming session.
//!
//! Physical memory is often too fragmented for one large contiguous allocation, so the pool is
//! made of several chunks. Allocation starts with a large chunk order and falls back to smaller
//! orders whenever the allocator cannot satisfy a request; the chunks are then used in order as a
//! ring by the transfer scheduler, and back to back by the consumer mapping.

use std::fmt;
use std::sync::Arc;

use common::dma::{DmaAllocator, DmaChunk};
use common::order_size;
use log::{debug, info, trace, warn};

use crate::error::{Error, Result};

/// One chunk of the pool.
pub struct BufferChunk {
    dma: DmaChunk,
    index: usize,
    usable: usize,
}

impl BufferChunk {
    /// Position of this chunk in allocation order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Allocated size, always a power-of-two number of pages.
    pub fn full_size(&self) -> usize {
        self.dma.size()
    }

    /// Bytes of the chunk that belong to the stream. Only the last chunk may be partially used.
    pub fn usable_size(&self) -> usize {
        self.usable
    }

    /// Bus address of the chunk.
    pub fn address(&self) -> usize {
        self.dma.address()
    }

    /// Host-side address of the chunk.
    pub fn base(&self) -> *mut u8 {
        self.dma.as_ptr()
    }
}

impl fmt::Debug for BufferChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferChunk")
            .field("index", &self.index)
            .field("full_size", &self.full_size())
            .field("usable_size", &self.usable)
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

pub struct BufferPool {
    allocator: Arc<dyn DmaAllocator>,
    chunks: Vec<BufferChunk>,
    min_chunk_size: usize,
}

impl BufferPool {
    /// Allocates chunks until `target` bytes (rounded down to a multiple of 4) are covered.
    ///
    /// Either the whole amount is allocated, or every chunk obtained so far is given back and
    /// [Error::ResourceExhausted] is returned.
    pub fn allocate(allocator: Arc<dyn DmaAllocator>, target: usize, start_order: u32) -> Result<Self> {
        let target = target & !0x3;
        let mut remaining = target;
        let mut order = start_order.min(allocator.max_order());

        let mut pool = Self {
            allocator,
            chunks: Vec::new(),
            min_chunk_size: order_size(order),
        };

        while remaining > 0 {
            while order > 0 && order_size(order - 1) >= remaining {
                order -= 1;
            }

            match pool.allocator.allocate(order) {
                Ok(dma) => {
                    let usable = dma.size().min(remaining);
                    trace!(
                        "chunk {}: order {}, {:#x} bytes at {:#x}, {:#x} usable",
                        pool.chunks.len(),
                        order,
                        dma.size(),
                        dma.address(),
                        usable
                    );
                    pool.chunks.push(BufferChunk {
                        index: pool.chunks.len(),
                        dma,
                        usable,
                    });
                    remaining -= usable;
                }
                Err(err) if order > 0 => {
                    debug!("order {} allocation failed ({}), retrying smaller", order, err);
                    order -= 1;
                }
                Err(err) => {
                    warn!(
                        "DMA pool allocation failed with {:#x} of {:#x} bytes missing: {}",
                        remaining, target, err
                    );
                    pool.release();
                    return Err(Error::ResourceExhausted);
                }
            }
        }

        pool.min_chunk_size = order_size(order);
        info!(
            "allocated DMA pool of {:#x} bytes in {} chunks, smallest chunk {:#x}",
            target,
            pool.chunks.len(),
            pool.min_chunk_size
        );
        Ok(pool)
    }

    /// Gives every chunk back to the allocator it came from. Releasing an empty pool does nothing.
    pub fn release(&mut self) {
        if self.chunks.is_empty() {
            return;
        }
        debug!("releasing {} DMA chunks", self.chunks.len());
        for chunk in self.chunks.drain(..) {
            // SAFETY: the chunk came from this allocator, and the session only releases the pool
            // once no transfer or mapping can reach it anymore.
            unsafe { self.allocator.release(chunk.dma) };
        }
    }

    pub fn chunks(&self) -> &[BufferChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Index of the chunk after `index`, wrapping at the last one.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.chunks.len()
    }

    /// Sum of the usable sizes, i.e. the length of the stream ring.
    pub fn usable_size(&self) -> usize {
        self.chunks.iter().map(BufferChunk::usable_size).sum()
    }

    /// Sum of the full chunk sizes, i.e. the extent that can be mapped.
    pub fn mapped_size(&self) -> usize {
        self.chunks.iter().map(BufferChunk::full_size).sum()
    }

    /// Size of the smallest chunk order used.
    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("chunks", &self.chunks)
            .field("min_chunk_size", &self.min_chunk_size)
            .finish()
    }
}

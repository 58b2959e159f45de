use std::alloc::{self, Layout};
use std::ptr::NonNull;

use syscall::error::{Error, Result, EINVAL, ENOMEM};
use syscall::PAGE_SIZE;

use crate::order_size;

/// Highest page order handed out by any allocator (`PAGE_SIZE << MAX_ORDER` bytes).
pub const MAX_ORDER: u32 = 10;

fn assert_aligned(x: usize) {
    assert_eq!(x % PAGE_SIZE, 0);
}

/// One physically contiguous allocation, visible to both the host and the device. Currently all
/// chunks are page-aligned and span a power-of-two number of pages.
///
/// A chunk does not free itself; it has to be handed back to the [DmaAllocator] it came from.
#[derive(Debug)]
pub struct DmaChunk {
    address: usize,
    virt: NonNull<u8>,
    size: usize,
}

// SAFETY: the chunk is plain memory owned by whoever holds the descriptor; synchronization of
// the contents is the holder's responsibility.
unsafe impl Send for DmaChunk {}
unsafe impl Sync for DmaChunk {}

impl DmaChunk {
    /// Construct a chunk from its bus address, kernel-side mapping and size. Both the address
    /// and the size must be page-aligned.
    ///
    /// # Safety
    /// `virt` must point to `size` bytes that stay mapped until the chunk is released.
    pub unsafe fn from_raw_parts(address: usize, virt: NonNull<u8>, size: usize) -> Self {
        assert_aligned(address);
        assert_aligned(size);

        Self {
            address,
            virt,
            size,
        }
    }

    /// The address the device uses for DMA into this chunk.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Size of the chunk in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host-side pointer to the first byte of the chunk.
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn order(&self) -> u32 {
        (self.size / PAGE_SIZE).trailing_zeros()
    }
}

/// A page-allocation facility producing device-visible buffers.
pub trait DmaAllocator: Send + Sync {
    /// Highest order `allocate` may be asked for.
    fn max_order(&self) -> u32;

    /// Allocate `PAGE_SIZE << order` zeroed bytes of physically contiguous memory.
    fn allocate(&self, order: u32) -> Result<DmaChunk>;

    /// Give a chunk back.
    ///
    /// # Safety
    /// `chunk` must have been returned by `allocate` on this same allocator, and no references
    /// into its memory may outlive this call.
    unsafe fn release(&self, chunk: DmaChunk);
}

/// Allocator backed by the host heap, where the bus address is the virtual address. Used for
/// hosted builds of the drivers and for testing.
#[derive(Debug)]
pub struct HostDma {
    max_order: u32,
}

impl HostDma {
    pub fn new() -> Self {
        Self::with_max_order(MAX_ORDER)
    }

    pub fn with_max_order(max_order: u32) -> Self {
        Self {
            max_order: max_order.min(MAX_ORDER),
        }
    }

    fn layout(order: u32) -> Result<Layout> {
        Layout::from_size_align(order_size(order), PAGE_SIZE).map_err(|_| Error::new(EINVAL))
    }
}

impl Default for HostDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HostDma {
    fn max_order(&self) -> u32 {
        self.max_order
    }

    fn allocate(&self, order: u32) -> Result<DmaChunk> {
        if order > self.max_order {
            return Err(Error::new(EINVAL));
        }
        let layout = Self::layout(order)?;
        let virt = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(Error::new(ENOMEM))?;

        Ok(unsafe { DmaChunk::from_raw_parts(virt.as_ptr() as usize, virt, layout.size()) })
    }

    unsafe fn release(&self, chunk: DmaChunk) {
        if let Ok(layout) = Self::layout(chunk.order()) {
            alloc::dealloc(chunk.as_ptr(), layout);
        }
    }
}

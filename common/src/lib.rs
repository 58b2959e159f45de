//! Helpers shared by the USB instrument drivers: device-visible page allocation and logging.

pub use syscall::PAGE_SIZE;

pub mod dma;
pub mod logger;

/// Number of bytes covered by an allocation of the given page order.
#[inline]
pub const fn order_size(order: u32) -> usize {
    PAGE_SIZE << order
}

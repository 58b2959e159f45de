//! The transport primitives the driver is built on. They are provided by the USB host stack; the
//! driver only consumes them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::error::TransportError;

/// Index of one transfer slot of the stream endpoint.
pub type SlotId = usize;

/// Where a bulk IN transfer lands: a contiguous range inside one DMA chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransferTarget {
    /// Bus address of the first byte.
    pub address: usize,
    pub len: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionStatus {
    Completed,
    /// The request was cancelled through [BulkStream::cancel].
    Cancelled,
    Failed(TransportError),
}

/// The completion report of one transfer slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Completion {
    pub slot: SlotId,
    pub status: CompletionStatus,
    pub actual_len: usize,
}

/// Asynchronous bulk IN transfers on the high-rate stream endpoint.
pub trait BulkStream: Send + Sync {
    /// Max packet size of the stream endpoint.
    fn max_packet_size(&self) -> usize;

    /// The channel on which one [Completion] is delivered per submitted request.
    fn completions(&self) -> Receiver<Completion>;

    /// Queue a read into `target` on behalf of `slot`. The slot must not have a request in flight.
    fn submit(&self, slot: SlotId, target: TransferTarget) -> Result<(), TransportError>;

    /// Cancel the request in flight on `slot`, if any. A cancelled request still reports a
    /// completion (with [CompletionStatus::Cancelled] unless it finished first).
    fn cancel(&self, slot: SlotId);
}

/// The low-rate command endpoint pair (EP1 OUT / EP1 IN).
pub trait ControlChannel: Send {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
}

/// Monotonic scheduling ticks, wrapping at `u32::MAX`.
pub trait TickSource: Send + Sync {
    fn ticks(&self) -> u32;
}

impl<T: TickSource + ?Sized> TickSource for Arc<T> {
    fn ticks(&self) -> u32 {
        (**self).ticks()
    }
}

/// Ticks derived from the monotonic clock.
#[derive(Debug)]
pub struct ClockTicks {
    epoch: Instant,
    tick: Duration,
}

impl ClockTicks {
    pub fn new(tick: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            tick,
        }
    }
}

impl TickSource for ClockTicks {
    fn ticks(&self) -> u32 {
        (self.epoch.elapsed().as_nanos() / self.tick.as_nanos().max(1)) as u32
    }
}

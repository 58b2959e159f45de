//! The transfer ring: a fixed set of bulk IN requests that are kept in flight on the stream
//! endpoint, each bound to the next free range of the buffer pool.
//!
//! Completions are processed by a reactor thread that owns the [Scheduler] while streaming runs,
//! so the cursor and the servo only ever have one writer. The control path gets the scheduler
//! back from [RunningStream::shutdown], which returns only once every slot has reported its final
//! completion.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use syscall::error::ECONNRESET;

use crate::config::ServoConfig;
use crate::error::{Error, Result, TransportError};
use crate::pool::BufferPool;
use crate::servo::RateServo;
use crate::transport::{
    BulkStream, Completion, CompletionStatus, SlotId, TickSource, TransferTarget,
};

/// Byte count as reported to the consumer: the received byte counter truncated to 31 bits, or
/// the error sentinel once a transport error has been latched.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ByteCount(i32);

impl ByteCount {
    pub const ERROR: Self = Self(-1);

    pub fn from_counter(received: u32) -> Self {
        Self((received & 0x7fff_ffff) as i32)
    }

    /// The count, or `None` for the error sentinel.
    pub fn get(self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }

    pub fn is_error(self) -> bool {
        self.0 < 0
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

/// Stream state shared between the reactor and the control path.
#[derive(Debug, Default)]
pub struct StreamStatus {
    running: Mutex<bool>,
    received: AtomicU32,
    error: AtomicI32,
    block_size: AtomicUsize,
}

impl StreamStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    pub fn transferred_bytes(&self) -> ByteCount {
        if self.error.load(Ordering::Acquire) != 0 {
            return ByteCount::ERROR;
        }
        ByteCount::from_counter(self.received.load(Ordering::Acquire))
    }

    /// The latched transport error code, 0 if none.
    pub fn error_code(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    /// Current servo block size.
    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_counter(&self) {
        self.received.store(0, Ordering::Release);
    }

    pub(crate) fn clear_error(&self) {
        self.error.store(0, Ordering::Release);
    }

    fn latch(&self, err: TransportError) {
        self.error.store(err.code(), Ordering::Release);
    }

    fn set_running(&self, running: bool) {
        *self.running.lock() = running;
    }
}

#[derive(Clone, Copy, Debug)]
struct ChunkRange {
    address: usize,
    base: usize,
    usable: usize,
}

/// Next free position in the pool.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Cursor {
    pub chunk: usize,
    pub offset: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    chunk: usize,
    offset: usize,
    len: usize,
    in_flight: bool,
}

pub struct Scheduler {
    transport: Arc<dyn BulkStream>,
    completions: Receiver<Completion>,
    ticks: Arc<dyn TickSource>,
    status: Arc<StreamStatus>,
    servo_config: ServoConfig,
    servo: Option<RateServo>,
    slots: Vec<Slot>,
    chunks: Vec<ChunkRange>,
    cursor: Cursor,
    in_flight: usize,
}

impl Scheduler {
    pub fn new(
        transport: Arc<dyn BulkStream>,
        ticks: Arc<dyn TickSource>,
        status: Arc<StreamStatus>,
        slot_count: usize,
        servo_config: ServoConfig,
    ) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(slot_count)
            .map_err(|_| Error::ResourceExhausted)?;
        slots.resize(slot_count, Slot::default());

        Ok(Self {
            completions: transport.completions(),
            transport,
            ticks,
            status,
            servo_config,
            servo: None,
            slots,
            chunks: Vec::new(),
            cursor: Cursor::default(),
            in_flight: 0,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn block_size(&self) -> Option<usize> {
        self.servo.as_ref().map(RateServo::block_size)
    }

    pub fn status(&self) -> &Arc<StreamStatus> {
        &self.status
    }

    /// Rewinds the cursor to the start of `pool`, resets the servo and issues one transfer of
    /// `initial_block` bytes per slot. Must only be called while no slot is in flight.
    ///
    /// A failed submission latches the error and stops streaming; slots submitted before it stay
    /// in flight and still have to be drained.
    pub fn populate(&mut self, pool: &BufferPool, initial_block: usize) -> Result<(), TransportError> {
        debug_assert_eq!(self.in_flight, 0, "populating a busy transfer ring");

        self.chunks.clear();
        self.chunks.extend(pool.chunks().iter().map(|chunk| ChunkRange {
            address: chunk.address(),
            base: chunk.base() as usize,
            usable: chunk.usable_size(),
        }));
        self.cursor = Cursor::default();

        let servo = RateServo::new(
            self.servo_config,
            self.transport.max_packet_size(),
            pool.min_chunk_size(),
            initial_block,
            self.ticks.ticks(),
        );
        let block = servo.block_size();
        self.servo = Some(servo);
        self.status.block_size.store(block, Ordering::Relaxed);

        if self.chunks.is_empty() {
            return Ok(());
        }
        self.status.set_running(true);

        for slot in 0..self.slots.len() {
            let target = self.bind_next(slot, block);
            if let Err(err) = self.transport.submit(slot, target) {
                error!("initial submission of slot {} failed: {}", slot, err);
                self.slots[slot].in_flight = false;
                self.status.latch(err);
                self.status.set_running(false);
                return Err(err);
            }
            self.slots[slot].in_flight = true;
            self.in_flight += 1;
        }
        debug!(
            "transfer ring populated: {} slots of {} bytes",
            self.slots.len(),
            block
        );
        Ok(())
    }

    /// Binds `slot` to the range at the cursor, at most `len` bytes long and never crossing the
    /// end of the current chunk, and advances the cursor past it.
    fn bind_next(&mut self, slot: SlotId, len: usize) -> TransferTarget {
        let chunk = self.chunks[self.cursor.chunk];
        let offset = self.cursor.offset;
        let len = len.min(chunk.usable - offset);

        self.slots[slot] = Slot {
            chunk: self.cursor.chunk,
            offset,
            len,
            in_flight: false,
        };

        self.cursor.offset += len;
        if self.cursor.offset >= chunk.usable {
            self.cursor.chunk = (self.cursor.chunk + 1) % self.chunks.len();
            self.cursor.offset = 0;
        }

        TransferTarget {
            address: chunk.address + offset,
            len,
        }
    }

    /// Handles the completion of one slot: pads a short transfer with zeros, accounts the
    /// requested length, updates the servo and resubmits the slot while streaming runs.
    pub fn on_completion(&mut self, completion: Completion) {
        let Completion {
            slot: id,
            status,
            actual_len,
        } = completion;

        let slot = match self.slots.get_mut(id) {
            Some(slot) if slot.in_flight => slot,
            _ => {
                warn!("spurious completion for slot {}", id);
                return;
            }
        };
        slot.in_flight = false;
        let slot = *slot;
        self.in_flight -= 1;

        match status {
            CompletionStatus::Cancelled => {
                // shutdown clears `running` before it cancels anything
                let mut running = self.status.running.lock();
                if *running {
                    error!("slot {} cancelled while streaming", id);
                    self.status.latch(TransportError::Io(ECONNRESET));
                    *running = false;
                } else {
                    trace!("slot {} cancelled", id);
                }
                return;
            }
            CompletionStatus::Failed(err) => {
                error!("stream transfer on slot {} failed: {}", id, err);
                self.status.latch(err);
                self.status.set_running(false);
                return;
            }
            CompletionStatus::Completed => (),
        }

        if actual_len < slot.len {
            let chunk = self.chunks[slot.chunk];
            // SAFETY: the slot range lies inside the chunk, which stays allocated until the
            // session has drained the ring and closed.
            unsafe {
                ptr::write_bytes(
                    (chunk.base + slot.offset + actual_len) as *mut u8,
                    0,
                    slot.len - actual_len,
                );
            }
        }
        self.status
            .received
            .fetch_add(slot.len as u32, Ordering::AcqRel);

        let now = self.ticks.ticks();
        let block = match self.servo.as_mut() {
            Some(servo) => servo.on_completion(now),
            None => return,
        };
        self.status.block_size.store(block, Ordering::Relaxed);
        trace!(
            "slot {} done: {}/{} bytes, next block {}",
            id,
            actual_len,
            slot.len,
            block
        );

        let status = Arc::clone(&self.status);
        let running = status.running.lock();
        if !*running {
            return;
        }
        let target = self.bind_next(id, block);
        match self.transport.submit(id, target) {
            Ok(()) => {
                self.slots[id].in_flight = true;
                self.in_flight += 1;
            }
            Err(err) => {
                drop(running);
                error!("resubmission of slot {} failed: {}", id, err);
                status.latch(err);
                status.set_running(false);
            }
        }
    }

    /// Forget every in-flight request, used when the completion channel is gone.
    fn abandon(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.in_flight = false;
        }
        self.in_flight = 0;
    }

    /// Hands the scheduler to a reactor thread, which populates the ring from `pool` and then
    /// processes completions until streaming has stopped and every slot is idle.
    ///
    /// The outcome of populating is available from [RunningStream::populated]; a failed ring
    /// still has to be shut down to drain the slots that made it out.
    pub fn start(self, pool: Arc<RwLock<BufferPool>>, initial_block: usize) -> io::Result<RunningStream> {
        let transport = Arc::clone(&self.transport);
        let status = Arc::clone(&self.status);
        let slot_count = self.slots.len();
        let (ready_tx, ready_rx) = bounded(1);

        let reactor = thread::Builder::new()
            .name("tmst4-reactor".into())
            .spawn(move || {
                let mut scheduler = self;
                let populated = scheduler.populate(&pool.read(), initial_block);
                drop(pool);
                let _ = ready_tx.send(populated);
                Reactor { scheduler }.run()
            })?;

        let populated = ready_rx
            .recv()
            .unwrap_or(Err(TransportError::Disconnected));

        Ok(RunningStream {
            reactor,
            transport,
            status,
            slot_count,
            populated,
        })
    }
}

struct Reactor {
    scheduler: Scheduler,
}

impl Reactor {
    fn run(mut self) -> Scheduler {
        debug!("stream reactor started");
        while self.scheduler.in_flight > 0 {
            match self.scheduler.completions.recv() {
                Ok(completion) => self.scheduler.on_completion(completion),
                Err(_) => {
                    error!("completion channel closed with {} requests in flight", self.scheduler.in_flight);
                    self.scheduler.status.latch(TransportError::Disconnected);
                    self.scheduler.status.set_running(false);
                    self.scheduler.abandon();
                }
            }
        }
        debug!("stream reactor idle");
        self.scheduler
    }
}

/// A transfer ring whose completions are being processed by the reactor thread.
pub struct RunningStream {
    reactor: JoinHandle<Scheduler>,
    transport: Arc<dyn BulkStream>,
    status: Arc<StreamStatus>,
    slot_count: usize,
    populated: Result<(), TransportError>,
}

impl RunningStream {
    pub fn status(&self) -> &Arc<StreamStatus> {
        &self.status
    }

    /// Whether every slot got its initial transfer.
    pub fn populated(&self) -> Result<(), TransportError> {
        self.populated
    }

    /// Stops resubmission, cancels every slot and waits for the reactor to see the last
    /// completion. Once this returns nothing touches the cursor or the servo anymore.
    pub fn shutdown(self) -> Scheduler {
        self.status.set_running(false);
        for slot in 0..self.slot_count {
            self.transport.cancel(slot);
        }
        match self.reactor.join() {
            Ok(scheduler) => scheduler,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::dma::HostDma;
    use common::PAGE_SIZE;
    use crossbeam_channel::{unbounded, Sender};
    use std::sync::atomic::AtomicU32;

    struct RecordingStream {
        max_packet: usize,
        sender: Sender<Completion>,
        receiver: Receiver<Completion>,
        submitted: Mutex<Vec<(SlotId, TransferTarget)>>,
        pending: Mutex<Vec<SlotId>>,
        fail_after: Option<usize>,
    }

    impl RecordingStream {
        fn new(max_packet: usize) -> Arc<Self> {
            Self::failing_after(max_packet, None)
        }
        fn failing_after(max_packet: usize, fail_after: Option<usize>) -> Arc<Self> {
            let (sender, receiver) = unbounded();
            Arc::new(Self {
                max_packet,
                sender,
                receiver,
                submitted: Mutex::new(Vec::new()),
                pending: Mutex::new(Vec::new()),
                fail_after,
            })
        }

        fn finish(&self, slot: SlotId, status: CompletionStatus, actual_len: usize) {
            let mut pending = self.pending.lock();
            if let Some(pos) = pending.iter().position(|&s| s == slot) {
                pending.remove(pos);
                let _ = self.sender.send(Completion {
                    slot,
                    status,
                    actual_len,
                });
            }
        }
    }

    impl BulkStream for RecordingStream {
        fn max_packet_size(&self) -> usize {
            self.max_packet
        }
        fn completions(&self) -> Receiver<Completion> {
            self.receiver.clone()
        }
        fn submit(&self, slot: SlotId, target: TransferTarget) -> Result<(), TransportError> {
            let mut submitted = self.submitted.lock();
            if Some(submitted.len()) == self.fail_after {
                return Err(TransportError::Stalled);
            }
            submitted.push((slot, target));
            self.pending.lock().push(slot);
            Ok(())
        }
        fn cancel(&self, slot: SlotId) {
            self.finish(slot, CompletionStatus::Cancelled, 0);
        }
    }

    #[derive(Default)]
    struct FrozenTicks(AtomicU32);
    impl TickSource for FrozenTicks {
        fn ticks(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn scheduler(stream: &Arc<RecordingStream>, slots: usize) -> Scheduler {
        Scheduler::new(
            stream.clone(),
            Arc::new(FrozenTicks::default()),
            Arc::new(StreamStatus::new()),
            slots,
            ServoConfig::default(),
        )
        .unwrap()
    }

    fn done(slot: SlotId, actual_len: usize) -> Completion {
        Completion {
            slot,
            status: CompletionStatus::Completed,
            actual_len,
        }
    }

    #[test]
    fn populate_clips_to_chunk_ends() {
        // two chunks of one page each, bound in 1536 byte blocks
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), 2 * PAGE_SIZE, 0).unwrap();
        let stream = RecordingStream::new(512);
        let mut sched = scheduler(&stream, 4);
        sched.populate(&pool, 1536).unwrap();

        let base0 = pool.chunks()[0].address();
        let base1 = pool.chunks()[1].address();
        let submitted = stream.submitted.lock().clone();
        assert_eq!(
            submitted,
            [
                (0, TransferTarget { address: base0, len: 1536 }),
                (1, TransferTarget { address: base0 + 1536, len: 1536 }),
                (2, TransferTarget { address: base0 + 3072, len: 1024 }),
                (3, TransferTarget { address: base1, len: 1536 }),
            ]
        );
        assert_eq!(sched.cursor(), Cursor { chunk: 1, offset: 1536 });
        assert_eq!(sched.in_flight(), 4);
        assert!(sched.status().is_running());
    }

    #[test]
    fn completion_counts_requested_length_and_zero_pads() {
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), PAGE_SIZE, 0).unwrap();
        let base = pool.chunks()[0].base();
        unsafe { ptr::write_bytes(base, 0xaa, PAGE_SIZE) };

        let stream = RecordingStream::new(512);
        let mut sched = scheduler(&stream, 2);
        sched.populate(&pool, 512).unwrap();
        sched.on_completion(done(0, 100));

        let bytes = unsafe { std::slice::from_raw_parts(base, PAGE_SIZE) };
        assert!(bytes[..100].iter().all(|&b| b == 0xaa));
        assert!(bytes[100..512].iter().all(|&b| b == 0));
        assert!(bytes[512..].iter().all(|&b| b == 0xaa));
        assert_eq!(sched.status().transferred_bytes(), ByteCount::from_counter(512));

        // slot 0 went on to the next free range
        let submitted = stream.submitted.lock().clone();
        assert_eq!(submitted.len(), 3);
        assert_eq!(
            submitted[2],
            (0, TransferTarget { address: pool.chunks()[0].address() + 1024, len: 512 })
        );
    }

    #[test]
    fn cursor_wraps_and_accounting_is_exact() {
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), 3 * PAGE_SIZE + 1024, 1).unwrap();
        let stream = RecordingStream::new(512);
        let mut sched = scheduler(&stream, 4);
        sched.populate(&pool, 512).unwrap();

        for n in 0..200 {
            let slot = n % 4;
            sched.on_completion(done(slot, 512));
            let cursor = sched.cursor();
            assert!(cursor.offset < pool.chunks()[cursor.chunk].usable_size());
        }

        let submitted = stream.submitted.lock().clone();
        let resubmitted: usize = submitted[4..].iter().map(|(_, t)| t.len).sum();
        let completed: usize = submitted[..200].iter().map(|(_, t)| t.len).sum();
        assert_eq!(submitted.len(), 204);
        assert!(resubmitted > 0);
        assert_eq!(
            sched.status().transferred_bytes().get(),
            Some(completed as u32)
        );
        for (_, target) in &submitted {
            let chunk = pool
                .chunks()
                .iter()
                .find(|c| (c.address()..c.address() + c.usable_size()).contains(&target.address))
                .unwrap();
            assert!(target.address + target.len <= chunk.address() + chunk.usable_size());
        }
    }

    #[test]
    fn failure_latches_and_stops_resubmission() {
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), PAGE_SIZE, 0).unwrap();
        let stream = RecordingStream::new(512);
        let mut sched = scheduler(&stream, 2);
        sched.populate(&pool, 512).unwrap();

        sched.on_completion(Completion {
            slot: 1,
            status: CompletionStatus::Failed(TransportError::Io(71)),
            actual_len: 0,
        });
        assert_eq!(sched.status().transferred_bytes(), ByteCount::ERROR);
        assert_eq!(sched.status().error_code(), 71);
        assert!(!sched.status().is_running());

        sched.on_completion(done(0, 512));
        assert_eq!(sched.in_flight(), 0);
        assert_eq!(stream.submitted.lock().len(), 2);
    }

    #[test]
    fn cancel_while_streaming_latches() {
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), PAGE_SIZE, 0).unwrap();
        let stream = RecordingStream::new(512);
        let mut sched = scheduler(&stream, 4);
        sched.populate(&pool, 512).unwrap();

        for slot in 0..4 {
            sched.on_completion(Completion {
                slot,
                status: CompletionStatus::Cancelled,
                actual_len: 0,
            });
        }
        assert_eq!(sched.in_flight(), 0);
        assert!(!sched.status().is_running());
        assert_eq!(sched.status().error_code(), ECONNRESET);
        assert_eq!(sched.status().transferred_bytes(), ByteCount::ERROR);
        assert_eq!(stream.submitted.lock().len(), 4);
    }

    #[test]
    fn failed_initial_submission_is_reported() {
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), PAGE_SIZE, 0).unwrap();
        let stream = RecordingStream::failing_after(512, Some(2));
        let mut sched = scheduler(&stream, 4);
        assert_eq!(sched.populate(&pool, 512), Err(TransportError::Stalled));
        assert_eq!(sched.in_flight(), 2);
        assert!(!sched.status().is_running());
        assert_eq!(sched.status().error_code(), TransportError::Stalled.code());
    }

    #[test]
    fn spurious_completion_is_ignored() {
        let stream = RecordingStream::new(512);
        let mut sched = scheduler(&stream, 2);
        sched.on_completion(done(1, 512));
        sched.on_completion(done(9, 512));
        assert_eq!(sched.in_flight(), 0);
        assert_eq!(sched.status().transferred_bytes().get(), Some(0));
    }

    #[test]
    fn shutdown_drains_every_slot() {
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), 4 * PAGE_SIZE, 2).unwrap();
        let stream = RecordingStream::new(512);
        let sched = scheduler(&stream, 4);

        let running = sched.start(Arc::new(RwLock::new(pool)), 512).unwrap();
        assert_eq!(running.populated(), Ok(()));
        stream.finish(2, CompletionStatus::Completed, 512);
        while stream.submitted.lock().len() < 5 {
            thread::yield_now();
        }
        let sched = running.shutdown();

        assert_eq!(sched.in_flight(), 0);
        assert!(!sched.status().is_running());
        assert_eq!(sched.status().error_code(), 0);
        assert!(stream.receiver.is_empty());
        assert_eq!(sched.status().transferred_bytes().get(), Some(512));
    }

    #[test]
    fn failed_start_still_drains() {
        let pool = BufferPool::allocate(Arc::new(HostDma::new()), 4 * PAGE_SIZE, 2).unwrap();
        let stream = RecordingStream::failing_after(512, Some(1));
        let running = scheduler(&stream, 4)
            .start(Arc::new(RwLock::new(pool)), 512)
            .unwrap();
        assert_eq!(running.populated(), Err(TransportError::Stalled));

        let sched = running.shutdown();
        assert_eq!(sched.in_flight(), 0);
        assert_eq!(sched.status().transferred_bytes(), ByteCount::ERROR);
        assert!(stream.receiver.is_empty());
    }

    #[test]
    fn byte_count_wraps_at_31_bits() {
        assert_eq!(ByteCount::from_counter(0x8000_0010).get(), Some(0x10));
        assert_eq!(ByteCount::from_counter(u32::MAX).get(), Some(0x7fff_ffff));
        assert!(ByteCount::ERROR.is_error());
        assert_eq!(ByteCount::ERROR.get(), None);
        assert_eq!(ByteCount::ERROR.raw(), -1);
    }
}

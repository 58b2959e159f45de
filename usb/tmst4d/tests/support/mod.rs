#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::dma::{DmaAllocator, DmaChunk, HostDma};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tmst4d::transport::{
    BulkStream, Completion, CompletionStatus, ControlChannel, SlotId, TickSource, TransferTarget,
};
use tmst4d::{DeviceId, DeviceRegistry, DeviceTransport, DriverConfig, TransportError};

pub const TIMESTAMPER: DeviceId = DeviceId::new(0x04b4, 0x123a);

/// Host memory allocator that keeps count and can be told to run dry.
#[derive(Default)]
pub struct CountingDma {
    inner: HostDma,
    pub live: AtomicUsize,
    pub exhausted: AtomicBool,
}

impl DmaAllocator for CountingDma {
    fn max_order(&self) -> u32 {
        self.inner.max_order()
    }

    fn allocate(&self, order: u32) -> syscall::Result<DmaChunk> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(syscall::Error::new(syscall::ENOMEM));
        }
        let chunk = self.inner.allocate(order)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(chunk)
    }

    unsafe fn release(&self, chunk: DmaChunk) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.release(chunk)
    }
}

/// Bulk endpoint whose transfers only complete when the test says so.
pub struct FakeStream {
    max_packet: usize,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    pending: Mutex<VecDeque<(SlotId, TransferTarget)>>,
    pub submitted: Mutex<Vec<TransferTarget>>,
    pub refuse_submissions: AtomicBool,
}

impl FakeStream {
    pub fn new(max_packet: usize) -> Arc<Self> {
        let (sender, receiver) = unbounded();
        Arc::new(Self {
            max_packet,
            sender,
            receiver,
            pending: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            refuse_submissions: AtomicBool::new(false),
        })
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Finishes the oldest transfer with `status`; returns its requested length.
    pub fn finish_oldest(&self, status: CompletionStatus) -> usize {
        let (slot, target) = self
            .pending
            .lock()
            .pop_front()
            .expect("no transfer in flight");
        let actual_len = match status {
            CompletionStatus::Completed => target.len,
            _ => 0,
        };
        self.sender
            .send(Completion {
                slot,
                status,
                actual_len,
            })
            .unwrap();
        target.len
    }

    /// Completes the oldest transfer in full and waits until the slot went out again.
    pub fn complete_and_wait(&self) -> usize {
        let before = self.submissions();
        let len = self.finish_oldest(CompletionStatus::Completed);
        wait_until(|| self.submissions() > before);
        len
    }
}

impl BulkStream for FakeStream {
    fn max_packet_size(&self) -> usize {
        self.max_packet
    }

    fn completions(&self) -> Receiver<Completion> {
        self.receiver.clone()
    }

    fn submit(&self, slot: SlotId, target: TransferTarget) -> Result<(), TransportError> {
        if self.refuse_submissions.load(Ordering::SeqCst) {
            return Err(TransportError::Stalled);
        }
        self.pending.lock().push_back((slot, target));
        self.submitted.lock().push(target);
        Ok(())
    }

    fn cancel(&self, slot: SlotId) {
        let mut pending = self.pending.lock();
        if let Some(pos) = pending.iter().position(|&(s, _)| s == slot) {
            pending.remove(pos);
            let _ = self.sender.send(Completion {
                slot,
                status: CompletionStatus::Cancelled,
                actual_len: 0,
            });
        }
    }
}

#[derive(Default)]
pub struct Script {
    pub sent: Vec<Vec<u8>>,
    pub responses: VecDeque<Result<Vec<u8>, TransportError>>,
    pub send_error: Option<TransportError>,
}

/// Control endpoints answering from a script; clones share it.
#[derive(Clone, Default)]
pub struct ScriptedControl(pub Arc<Mutex<Script>>);

impl ScriptedControl {
    pub fn respond(&self, bytes: &[u8]) {
        self.0.lock().responses.push_back(Ok(bytes.to_vec()));
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.lock().sent.clone()
    }
}

impl ControlChannel for ScriptedControl {
    fn send(&mut self, bytes: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut script = self.0.lock();
        if let Some(err) = script.send_error {
            return Err(err);
        }
        script.sent.push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let bytes = self
            .0
            .lock()
            .responses
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout))?;
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }
}

#[derive(Default)]
pub struct ManualTicks(pub AtomicU32);

impl ManualTicks {
    pub fn advance(&self, ticks: u32) {
        self.0.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl TickSource for ManualTicks {
    fn ticks(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Rig {
    pub registry: DeviceRegistry,
    pub minor: usize,
    pub dma: Arc<CountingDma>,
    pub stream: Arc<FakeStream>,
    pub control: ScriptedControl,
    pub ticks: Arc<ManualTicks>,
}

/// One attached timestamper with 512 byte packets.
pub fn rig() -> Rig {
    let registry = DeviceRegistry::new(DriverConfig::default());
    let dma = Arc::new(CountingDma::default());
    let stream = FakeStream::new(512);
    let control = ScriptedControl::default();
    let ticks = Arc::new(ManualTicks::default());

    let device = registry
        .attach(
            TIMESTAMPER,
            DeviceTransport {
                dma: dma.clone(),
                stream: stream.clone(),
                control: Box::new(control.clone()),
                ticks: Some(ticks.clone() as Arc<dyn TickSource>),
            },
        )
        .unwrap();

    Rig {
        minor: device.minor(),
        registry,
        dma,
        stream,
        control,
        ticks,
    }
}

pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting");
        thread::sleep(Duration::from_millis(1));
    }
}

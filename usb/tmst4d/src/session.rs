//! Devices, sessions and their lifecycle.
//!
//! Each attached device can be opened by one consumer at a time. The session walks through
//! `Closed -> Opened -> Mapped <-> Running -> Closed`; `Stopping` is held while the transfer ring
//! drains and makes every other lifecycle operation wait. Unplugging a device stops streaming
//! right away, but resources are only ever given back by the consumer's close.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::dma::DmaAllocator;
use common::PAGE_SIZE;
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::bitchain::{BitChain, ChainCommand};
use crate::config::{DeviceId, DriverConfig};
use crate::control::{ControlMux, Response};
use crate::error::{Error, Result};
use crate::mapping::MappedRegion;
use crate::pool::BufferPool;
use crate::scheduler::{ByteCount, RunningStream, Scheduler, StreamStatus};
use crate::spi::{SpiCommand, SpiResponse};
use crate::transport::{BulkStream, ClockTicks, ControlChannel, TickSource};

/// Minor number of the first attached device.
pub const MINOR_BASE: usize = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Closed,
    Opened,
    Mapped,
    Running,
    Stopping,
}

/// What the host stack provides for one attached device.
pub struct DeviceTransport {
    pub dma: Arc<dyn DmaAllocator>,
    pub stream: Arc<dyn BulkStream>,
    pub control: Box<dyn ControlChannel>,
    /// Defaults to the monotonic clock with the configured tick length.
    pub ticks: Option<Arc<dyn TickSource>>,
}

struct Inner {
    state: SessionState,
    removed: bool,
    scheduler: Option<Scheduler>,
    stream: Option<RunningStream>,
    pool: Option<Arc<RwLock<BufferPool>>>,
}

pub struct Device {
    id: DeviceId,
    minor: usize,
    config: DriverConfig,
    dma: Arc<dyn DmaAllocator>,
    stream: Arc<dyn BulkStream>,
    ticks: Arc<dyn TickSource>,
    control: Mutex<Box<dyn ControlChannel>>,
    status: Arc<StreamStatus>,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Device {
    fn new(id: DeviceId, minor: usize, config: DriverConfig, transport: DeviceTransport) -> Self {
        let ticks = transport
            .ticks
            .unwrap_or_else(|| Arc::new(ClockTicks::new(config.tick())) as Arc<dyn TickSource>);
        Self {
            id,
            minor,
            config,
            dma: transport.dma,
            stream: transport.stream,
            ticks,
            control: Mutex::new(transport.control),
            status: Arc::new(StreamStatus::new()),
            inner: Mutex::new(Inner {
                state: SessionState::Closed,
                removed: false,
                scheduler: None,
                stream: None,
                pool: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn minor(&self) -> usize {
        self.minor
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    pub fn status(&self) -> &Arc<StreamStatus> {
        &self.status
    }

    /// Locks the session once no shutdown is in progress.
    fn lock_settled(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        while inner.state == SessionState::Stopping {
            self.changed.wait(&mut inner);
        }
        inner
    }

    fn new_scheduler(&self) -> Result<Scheduler> {
        Scheduler::new(
            Arc::clone(&self.stream),
            Arc::clone(&self.ticks),
            Arc::clone(&self.status),
            self.config.transfer_slots,
            self.config.servo,
        )
    }

    /// Opens the device for its single consumer.
    pub fn open(self: &Arc<Self>) -> Result<Session> {
        let mut inner = self.inner.lock();
        if inner.removed {
            return Err(Error::DeviceGone);
        }
        if inner.state != SessionState::Closed {
            return Err(Error::Busy);
        }

        inner.scheduler = Some(self.new_scheduler()?);
        self.status.reset_counter();
        self.status.clear_error();
        inner.state = SessionState::Opened;
        info!("tmst4 {}: opened", self.minor);

        Ok(Session {
            device: Arc::clone(self),
            closed: false,
        })
    }

    fn request_mapping(&self, len: usize) -> Result<MappedRegion> {
        let mut inner = self.lock_settled();
        if inner.removed {
            return Err(Error::DeviceGone);
        }
        match inner.state {
            SessionState::Opened => (),
            SessionState::Closed => return Err(Error::Busy),
            _ => return Err(Error::AlreadyMapped),
        }
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument("mapping length must be a nonzero page multiple"));
        }

        let pool = BufferPool::allocate(Arc::clone(&self.dma), len, self.config.initial_chunk_order)?;
        let pool = Arc::new(RwLock::new(pool));
        inner.pool = Some(Arc::clone(&pool));
        inner.state = SessionState::Mapped;
        info!("tmst4 {}: mapped {:#x} bytes", self.minor, len);

        Ok(MappedRegion::new(pool, len))
    }

    fn start(&self) -> Result<()> {
        let mut inner = self.lock_settled();
        if inner.removed {
            return Err(Error::DeviceGone);
        }
        if inner.state != SessionState::Mapped {
            return Err(Error::Busy);
        }
        let pool = inner.pool.clone().ok_or(Error::Busy)?;
        let scheduler = inner.scheduler.take().ok_or(Error::Busy)?;

        self.status.clear_error();
        let running = match scheduler.start(pool, self.stream.max_packet_size()) {
            Ok(running) => running,
            Err(err) => {
                error!("tmst4 {}: failed to spawn stream reactor: {}", self.minor, err);
                inner.scheduler = Some(self.new_scheduler()?);
                return Err(Error::ResourceExhausted);
            }
        };

        if let Err(err) = running.populated() {
            inner.scheduler = Some(running.shutdown());
            return Err(err.into());
        }
        inner.stream = Some(running);
        inner.state = SessionState::Running;
        info!("tmst4 {}: streaming started", self.minor);
        Ok(())
    }

    /// Stops streaming and waits for the transfer ring to drain. Stopping a mapped session that
    /// is not streaming does nothing.
    fn stop(&self) -> Result<()> {
        let mut inner = self.lock_settled();
        match inner.state {
            SessionState::Running => (),
            SessionState::Mapped => return Ok(()),
            _ => return Err(Error::Busy),
        }
        let running = inner.stream.take().ok_or(Error::Busy)?;
        inner.state = SessionState::Stopping;
        drop(inner);

        let scheduler = running.shutdown();

        let mut inner = self.inner.lock();
        inner.scheduler = Some(scheduler);
        inner.state = SessionState::Mapped;
        self.changed.notify_all();
        info!(
            "tmst4 {}: streaming stopped after {:?} bytes",
            self.minor,
            self.status.transferred_bytes().get()
        );
        Ok(())
    }

    fn transferred_bytes(&self) -> Result<ByteCount> {
        match self.inner.lock().state {
            SessionState::Closed | SessionState::Opened => Err(Error::Busy),
            _ => Ok(self.status.transferred_bytes()),
        }
    }

    fn close(&self) {
        match self.stop() {
            Ok(()) | Err(Error::Busy) => (),
            Err(err) => warn!("tmst4 {}: stop on close failed: {}", self.minor, err),
        }

        let mut inner = self.lock_settled();
        if inner.state == SessionState::Closed {
            return;
        }
        inner.scheduler = None;
        if let Some(pool) = inner.pool.take() {
            pool.write().release();
        }
        inner.state = SessionState::Closed;
        self.changed.notify_all();
        info!("tmst4 {}: closed", self.minor);
    }

    /// Handles the device being unplugged: streaming stops at once, and the call returns once
    /// the consumer has closed its session.
    fn remove(&self) {
        {
            let mut inner = self.inner.lock();
            inner.removed = true;
            if inner.state == SessionState::Closed {
                return;
            }
        }
        warn!("tmst4 {}: unplugged while open", self.minor);

        match self.stop() {
            Ok(()) | Err(Error::Busy) => (),
            Err(err) => warn!("tmst4 {}: stop on removal failed: {}", self.minor, err),
        }

        let mut inner = self.inner.lock();
        while inner.state != SessionState::Closed {
            self.changed.wait(&mut inner);
        }
    }

    fn with_control<T>(&self, f: impl FnOnce(&mut ControlMux<'_>) -> Result<T>) -> Result<T> {
        if self.is_removed() {
            return Err(Error::DeviceGone);
        }
        let mut channel = self.control.lock();
        let mut mux = ControlMux::new(&mut **channel, self.config.control_timeout());
        f(&mut mux)
    }
}

/// An open device. Dropping the session closes it.
pub struct Session {
    device: Arc<Device>,
    closed: bool,
}

impl Session {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.device.state()
    }

    /// Allocates the buffer pool and hands out its mapping. `len` must be a nonzero multiple of
    /// the page size; a session is mapped at most once.
    pub fn request_mapping(&self, len: usize) -> Result<MappedRegion> {
        self.device.request_mapping(len)
    }

    /// Starts streaming into the mapped pool.
    pub fn start(&self) -> Result<()> {
        self.device.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.device.stop()
    }

    /// Bytes received since open, or [ByteCount::ERROR] once a transfer has failed.
    pub fn transferred_bytes(&self) -> Result<ByteCount> {
        self.device.transferred_bytes()
    }

    /// The latched transport error code, 0 if none.
    pub fn error_status(&self) -> i32 {
        self.device.status.error_code()
    }

    /// The current length of stream transfers.
    pub fn block_size(&self) -> usize {
        self.device.status.block_size()
    }

    /// Runs a simple command, see [crate::control::Command].
    pub fn execute(&self, code: u32, arg: u32) -> Result<Response> {
        self.device.with_control(|mux| mux.execute(code, arg))
    }

    pub fn scan_chain(&self, code: u32, chain: &mut BitChain) -> Result<()> {
        let command = ChainCommand::from_code(code).ok_or(Error::NotSupported(code))?;
        self.device.with_control(|mux| mux.scan_chain(command, chain))
    }

    pub fn spi_write(&self, code: u32, control: [u8; 2], payload: &[u8]) -> Result<()> {
        let command = SpiCommand::from_code(code)
            .filter(|command| !command.is_read())
            .ok_or(Error::NotSupported(code))?;
        self.device.with_control(|mux| mux.spi_write(command, control, payload))
    }

    pub fn spi_read(&self, code: u32, control: [u8; 2], len: usize) -> Result<SpiResponse> {
        let command = SpiCommand::from_code(code)
            .filter(|command| command.is_read())
            .ok_or(Error::NotSupported(code))?;
        self.device.with_control(|mux| mux.spi_read(command, control, len))
    }

    /// Stops streaming if needed and gives the buffer pool back.
    pub fn close(mut self) {
        self.closed = true;
        self.device.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            self.device.close();
        }
    }
}

/// The attached devices, by minor number.
pub struct DeviceRegistry {
    config: DriverConfig,
    devices: Mutex<BTreeMap<usize, Arc<Device>>>,
    next_minor: AtomicUsize,
}

impl DeviceRegistry {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            devices: Mutex::new(BTreeMap::new()),
            next_minor: AtomicUsize::new(MINOR_BASE),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Registers a newly plugged device. Devices not listed in the configuration are refused.
    pub fn attach(&self, id: DeviceId, transport: DeviceTransport) -> Result<Arc<Device>> {
        if !self.config.supports(id) {
            return Err(Error::UnsupportedDevice {
                vendor: id.vendor,
                product: id.product,
            });
        }
        let minor = self.next_minor.fetch_add(1, Ordering::Relaxed);
        let max_packet = transport.stream.max_packet_size();
        let device = Arc::new(Device::new(id, minor, self.config.clone(), transport));

        self.devices.lock().insert(minor, Arc::clone(&device));
        info!(
            "tmst4 {}: attached {:04x}:{:04x}, stream max packet {}",
            minor, id.vendor, id.product, max_packet
        );
        Ok(device)
    }

    pub fn get(&self, minor: usize) -> Option<Arc<Device>> {
        self.devices.lock().get(&minor).cloned()
    }

    pub fn minors(&self) -> Vec<usize> {
        self.devices.lock().keys().copied().collect()
    }

    pub fn open(&self, minor: usize) -> Result<Session> {
        self.get(minor).ok_or(Error::DeviceGone)?.open()
    }

    /// Unregisters an unplugged device, waiting for an open session to be closed.
    pub fn detach(&self, minor: usize) -> Result<()> {
        let device = self.devices.lock().remove(&minor).ok_or(Error::DeviceGone)?;
        device.remove();
        info!("tmst4 {}: detached", minor);
        Ok(())
    }
}

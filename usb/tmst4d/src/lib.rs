//! Driver core for the USB timestamp unit.
//!
//! The device streams timestamps over a high-rate bulk IN endpoint into a DMA buffer pool that
//! the consumer maps; a low-rate endpoint pair carries framed commands, JTAG scan chains and SPI
//! register accesses. The USB host stack itself is abstracted behind the traits in [transport].

pub mod bitchain;
pub mod config;
pub mod control;
pub mod error;
pub mod mapping;
pub mod pool;
pub mod scheduler;
pub mod servo;
pub mod session;
pub mod spi;
pub mod transport;

pub use config::{DeviceId, DriverConfig, ServoConfig};
pub use error::{Error, Result, TransportError};
pub use scheduler::ByteCount;
pub use session::{Device, DeviceRegistry, DeviceTransport, Session, SessionState};

/// Sets up logging for the driver, at the levels from `config`.
pub fn init_logging(config: &DriverConfig) -> Result<(), log::SetLoggerError> {
    common::logger::setup_logging(
        "usb",
        "tmst4",
        "tmst4",
        config.output_level(),
        config.file_level(),
    )
}

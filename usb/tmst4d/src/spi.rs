//! Register access to the SPI chips on the board (clock synthesizer and ADC).
//!
//! A write is one frame `[length, command, payload length, 0, control 0, control 1, payload..]`.
//! A read sends the same six byte header without payload and returns the whole response burst,
//! which starts with the two control bytes echoed by the device.

use log::debug;
use smallvec::SmallVec;

use crate::control::{ControlMux, Frame, MAX_FRAME};
use crate::error::{Error, Result};

const HEADER: usize = 6;

/// Largest payload of one transaction.
pub const MAX_SPI_PAYLOAD: usize = MAX_FRAME - HEADER;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SpiCommand {
    ClockChipWrite = 0x50,
    AdcChipWrite = 0x51,
    ClockChipRead = 0x52,
    AdcChipRead = 0x53,
}

impl SpiCommand {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x50 => Some(Self::ClockChipWrite),
            0x51 => Some(Self::AdcChipWrite),
            0x52 => Some(Self::ClockChipRead),
            0x53 => Some(Self::AdcChipRead),
            _ => None,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::ClockChipRead | Self::AdcChipRead)
    }
}

/// Data returned by a read transaction. Its length is the actual length of the answer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SpiResponse {
    pub data: SmallVec<[u8; MAX_FRAME]>,
}

impl SpiResponse {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_SPI_PAYLOAD {
        return Err(Error::TooLarge {
            len,
            max: MAX_SPI_PAYLOAD,
        });
    }
    Ok(())
}

fn header(command: SpiCommand, frame_len: usize, len: usize, control: [u8; 2]) -> Frame {
    let mut frame = Frame::new();
    frame.extend_from_slice(&[frame_len as u8, command as u8, len as u8, 0, control[0], control[1]]);
    frame
}

pub fn encode_write(command: SpiCommand, control: [u8; 2], payload: &[u8]) -> Result<Frame> {
    check_len(payload.len())?;
    let mut frame = header(command, payload.len() + HEADER, payload.len(), control);
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn encode_read(command: SpiCommand, control: [u8; 2], len: usize) -> Result<Frame> {
    check_len(len)?;
    Ok(header(command, HEADER, len, control))
}

impl ControlMux<'_> {
    /// Writes `payload` with the two control bytes addressing the chip register.
    pub fn spi_write(&mut self, command: SpiCommand, control: [u8; 2], payload: &[u8]) -> Result<()> {
        let frame = encode_write(command, control, payload)?;
        debug!("{:?}: {} bytes", command, payload.len());
        self.send(&frame)
    }

    /// Requests `len` bytes and returns the device's answer as received.
    pub fn spi_read(&mut self, command: SpiCommand, control: [u8; 2], len: usize) -> Result<SpiResponse> {
        let frame = encode_read(command, control, len)?;
        self.send(&frame)?;

        let mut buf = [0u8; MAX_FRAME];
        let received = self.receive(&mut buf)?;
        debug!("{:?}: {} of {} bytes", command, received, len);
        Ok(SpiResponse {
            data: SmallVec::from_slice(&buf[..received]),
        })
    }
}

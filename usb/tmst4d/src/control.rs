//! Command multiplexer for the control endpoint pair.
//!
//! Every command travels in one frame on EP1 OUT:
//!
//! ```text
//! [ length | command | argument bytes (little endian) | checksum ]
//! ```
//!
//! where `length` counts the whole frame and `checksum` is the byte sum of everything before it.
//! Commands with a response get one read of up to [MAX_FRAME] bytes on EP1 IN.

use std::time::Duration;

use log::{debug, trace};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::transport::ControlChannel;

/// Largest frame in either direction.
pub const MAX_FRAME: usize = 64;

pub type Frame = SmallVec<[u8; MAX_FRAME]>;

/// How the response of a command is read and interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseKind {
    /// No response is read.
    None,
    /// One byte value.
    Byte,
    /// 16 bit little endian value.
    Half,
    /// 32 bit little endian value.
    Word,
    /// Status byte; nonzero means the firmware failed the command.
    Status,
    /// Status byte; nonzero means the firmware is busy and the command should be retried.
    Retry,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Descriptor {
    pub command: Command,
    pub arg_bytes: usize,
    pub response: ResponseKind,
}

macro_rules! commands {
    ($($name:ident = $code:literal, $args:literal, $response:ident;)*) => {
        /// Simple commands of the firmware.
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        #[repr(u8)]
        pub enum Command {
            $($name = $code,)*
        }

        impl Command {
            pub const ALL: &'static [Command] = &[$(Command::$name,)*];

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Command::$name),)*
                    _ => None,
                }
            }

            pub fn descriptor(self) -> &'static Descriptor {
                match self {
                    $(Command::$name => &Descriptor {
                        command: Command::$name,
                        arg_bytes: $args,
                        response: ResponseKind::$response,
                    },)*
                }
            }
        }
    };
}

commands! {
    StartStream = 0x01, 0, Retry;
    StopStream = 0x02, 0, None;
    GetReadyLineStatus = 0x03, 0, Word;
    ResetTarget = 0x04, 0, None;
    UnresetTarget = 0x05, 0, None;
    JtagInitialize = 0x06, 0, None;
    GetByteCount = 0x07, 0, Half;
    FlushFifo = 0x08, 0, None;
    ResetTransfer = 0x09, 0, None;
    GetTcb = 0x0a, 0, Word;
    GetPowerState = 0x0b, 0, Byte;
    RetrieveEeprom = 0x0c, 0, Status;
    SaveEeprom = 0x0d, 0, Status;
    PushLookup = 0x0e, 0, None;
    GetStatusWord = 0x0f, 0, Word;
    SetDelay = 0x10, 1, None;
    JtagEndDr = 0x11, 1, None;
    JtagEndIr = 0x12, 1, None;
    JtagSetTrst = 0x13, 1, None;
    SwdReset = 0x14, 1, None;
    SetOverflowFlag = 0x15, 1, None;
    SetPowerState = 0x16, 1, None;
    ConfigDevice = 0x17, 1, None;
    GetConfig = 0x18, 1, Word;
    WriteCpld = 0x20, 2, None;
    SwdSendWord = 0x21, 2, None;
    WriteInputDac = 0x22, 2, None;
    WriteExtraDac = 0x23, 2, None;
    JtagForceState = 0x28, 3, None;
    JtagRunState = 0x29, 3, None;
    SendWord = 0x30, 4, None;
    StartLimited = 0x31, 4, Retry;
    WriteCpldLong = 0x32, 4, None;
    ReadRam = 0x33, 4, Word;
    WriteRam = 0x34, 4, Status;
    EraseFlash = 0xfe, 0, None;
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Outcome of a simple command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Response {
    Done,
    Value(u32),
}

impl Response {
    pub fn value(self) -> Option<u32> {
        match self {
            Self::Done => None,
            Self::Value(value) => Some(value),
        }
    }
}

/// Byte sum used by every outgoing frame.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Builds the frame of `command` carrying the low `arg_bytes` bytes of `arg`.
pub fn encode(command: Command, arg: u32) -> Frame {
    let desc = command.descriptor();
    let len = desc.arg_bytes + 3;

    let mut frame = Frame::new();
    frame.push(len as u8);
    frame.push(command.code());
    frame.extend_from_slice(&arg.to_le_bytes()[..desc.arg_bytes]);
    frame.push(checksum(&frame));
    frame
}

/// Interprets the response of `kind` from the bytes received.
pub fn decode(kind: ResponseKind, bytes: &[u8]) -> Result<Response> {
    let need = match kind {
        ResponseKind::None => return Ok(Response::Done),
        ResponseKind::Byte | ResponseKind::Status | ResponseKind::Retry => 1,
        ResponseKind::Half => 2,
        ResponseKind::Word => 4,
    };
    if bytes.len() < need {
        return Err(Error::Protocol("short response"));
    }

    match kind {
        ResponseKind::Byte => Ok(Response::Value(bytes[0].into())),
        ResponseKind::Half => Ok(Response::Value(
            u16::from_le_bytes([bytes[0], bytes[1]]).into(),
        )),
        ResponseKind::Word => Ok(Response::Value(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        ResponseKind::Status if bytes[0] != 0 => Err(Error::Fault),
        ResponseKind::Retry if bytes[0] != 0 => Err(Error::RetryLater),
        _ => Ok(Response::Done),
    }
}

/// Runs commands over one control channel. Callers serialize access by holding the channel.
pub struct ControlMux<'a> {
    channel: &'a mut dyn ControlChannel,
    timeout: Duration,
}

impl<'a> ControlMux<'a> {
    pub fn new(channel: &'a mut dyn ControlChannel, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// Sends one complete frame.
    pub(crate) fn send(&mut self, frame: &[u8]) -> Result<()> {
        trace!("control out: {:02x?}", frame);
        let sent = self.channel.send(frame, self.timeout)?;
        if sent != frame.len() {
            return Err(Error::Protocol("short control write"));
        }
        Ok(())
    }

    /// Reads one response burst of at most [MAX_FRAME] bytes.
    pub(crate) fn receive(&mut self, buf: &mut [u8; MAX_FRAME]) -> Result<usize> {
        let len = self.channel.receive(buf, self.timeout)?;
        if len > MAX_FRAME {
            return Err(Error::Protocol("oversized response"));
        }
        trace!("control in: {:02x?}", &buf[..len]);
        Ok(len)
    }

    /// Runs the simple command with code `code`. Codes outside the command table fail with
    /// [Error::NotSupported] before anything is sent.
    pub fn execute(&mut self, code: u32, arg: u32) -> Result<Response> {
        let command = Command::from_code(code).ok_or(Error::NotSupported(code))?;
        let desc = command.descriptor();
        debug!("{:?}({:#x})", command, arg);

        self.send(&encode(command, arg))?;
        if desc.response == ResponseKind::None {
            return Ok(Response::Done);
        }

        let mut buf = [0u8; MAX_FRAME];
        let len = self.receive(&mut buf)?;
        decode(desc.response, &buf[..len])
    }
}

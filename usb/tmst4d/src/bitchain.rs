//! JTAG scan chains.
//!
//! A chain of up to [MAX_CHAIN_BITS] bits is shifted out in a sequence of frames. The first frame
//! carries a four byte header `[length, command, bits lo, bits hi]`, every later frame only the
//! length byte. The checksum is the sum of every byte after the length byte of each frame and
//! travels as the last payload byte of the last frame. The bits shifted in come back in as many
//! response bursts as needed.

use std::cmp;

use log::debug;

use crate::control::{checksum, ControlMux, Frame, MAX_FRAME};
use crate::error::{Error, Result};

pub const MAX_CHAIN_BITS: usize = 8000;
pub const MAX_CHAIN_BYTES: usize = MAX_CHAIN_BITS / 8;

const FIRST_HEADER: usize = 4;
const NEXT_HEADER: usize = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ChainCommand {
    ScanData = 0x40,
    ScanIr = 0x41,
}

impl ChainCommand {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x40 => Some(Self::ScanData),
            0x41 => Some(Self::ScanIr),
            _ => None,
        }
    }
}

/// A scan chain: bits to shift out, replaced in place by the bits shifted in.
#[derive(Clone)]
pub struct BitChain {
    pub bits: usize,
    pub content: [u8; MAX_CHAIN_BYTES],
}

impl BitChain {
    pub fn new(bits: usize, data: &[u8]) -> Self {
        let mut content = [0; MAX_CHAIN_BYTES];
        let len = cmp::min(data.len(), MAX_CHAIN_BYTES);
        content[..len].copy_from_slice(&data[..len]);
        Self { bits, content }
    }

    /// Number of bytes the bits occupy.
    pub fn byte_len(&self) -> usize {
        (self.bits + 7) / 8
    }

    pub fn bytes(&self) -> &[u8] {
        &self.content[..cmp::min(self.byte_len(), MAX_CHAIN_BYTES)]
    }
}

impl std::fmt::Debug for BitChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitChain")
            .field("bits", &self.bits)
            .field("content", &self.bytes())
            .finish()
    }
}

/// The frames shifting out one chain.
pub struct ChainFrames<'a> {
    command: ChainCommand,
    chain: &'a BitChain,
    remaining: usize,
    offset: usize,
    header: usize,
    checksum: u8,
}

impl<'a> ChainFrames<'a> {
    /// Chains longer than [MAX_CHAIN_BITS] fail with [Error::TooLarge].
    pub fn new(command: ChainCommand, chain: &'a BitChain) -> Result<Self> {
        if chain.bits > MAX_CHAIN_BITS {
            return Err(Error::TooLarge {
                len: chain.bits,
                max: MAX_CHAIN_BITS,
            });
        }
        Ok(Self {
            command,
            chain,
            // payload plus the trailing checksum
            remaining: chain.byte_len() + 1,
            offset: 0,
            header: FIRST_HEADER,
            checksum: 0,
        })
    }
}

impl Iterator for ChainFrames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.remaining == 0 {
            return None;
        }
        let room = MAX_FRAME - self.header;
        let payload = cmp::min(self.remaining, room);
        let last = self.remaining <= room;
        let copy = if last { payload - 1 } else { payload };

        let mut frame = Frame::new();
        frame.push((payload + self.header) as u8);
        if self.header == FIRST_HEADER {
            frame.push(self.command as u8);
            frame.extend_from_slice(&(self.chain.bits as u16).to_le_bytes());
        }
        frame.extend_from_slice(&self.chain.content[self.offset..self.offset + copy]);
        self.checksum = self.checksum.wrapping_add(checksum(&frame[1..]));
        if last {
            frame.push(self.checksum);
        }

        self.offset += copy;
        self.remaining -= payload;
        self.header = NEXT_HEADER;
        Some(frame)
    }
}

impl ControlMux<'_> {
    /// Shifts `chain` through the scan chain selected by `command`; on return the chain holds
    /// the bits shifted in.
    pub fn scan_chain(&mut self, command: ChainCommand, chain: &mut BitChain) -> Result<()> {
        let frames = ChainFrames::new(command, chain)?;
        debug!("{:?}: {} bits", command, chain.bits);

        let mut sent = 0;
        for frame in frames {
            self.send(&frame)?;
            sent += 1;
        }

        let expected = chain.byte_len();
        let mut buf = [0u8; MAX_FRAME];
        let mut received = 0;
        while received < expected {
            let len = self.receive(&mut buf)?;
            if len == 0 {
                return Err(Error::Protocol("empty scan chain response"));
            }
            let take = cmp::min(len, MAX_CHAIN_BYTES.saturating_sub(received));
            chain.content[received..received + take].copy_from_slice(&buf[..take]);
            received += len;
        }
        debug!("{:?}: {} frames out, {} bytes in", command, sent, received);
        Ok(())
    }
}

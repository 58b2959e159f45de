//! Interrupt-rate servo.
//!
//! Every completion of a stream transfer is an interrupt on the host. The servo watches the
//! spacing of completions and adapts the length of the next transfers so that completions arrive
//! roughly between one and ten scheduling ticks apart: short transfers at low data rates keep the
//! latency down, long transfers at high data rates keep the interrupt load bounded.

use log::debug;

use crate::config::ServoConfig;

/// Fixed-point scale of tick intervals.
pub const TICK_SCALE: u32 = 256;

#[derive(Debug)]
pub struct RateServo {
    config: ServoConfig,
    max_packet: usize,
    max_block: usize,
    last_tick: u32,
    smoothed: i32,
    hold: u32,
    block_size: usize,
}

impl RateServo {
    /// `max_packet` is the endpoint max packet size, `min_chunk` the smallest chunk of the pool;
    /// the block size always stays a multiple of the former within `[max_packet, min_chunk]`.
    pub fn new(config: ServoConfig, max_packet: usize, min_chunk: usize, initial: usize, now: u32) -> Self {
        let max_packet = max_packet.max(1);
        let mut servo = Self {
            config,
            max_packet,
            max_block: (min_chunk / max_packet * max_packet).max(max_packet),
            last_tick: now,
            smoothed: 0,
            hold: 0,
            block_size: max_packet,
        };
        servo.reset(initial, now);
        servo
    }

    /// Restart from `initial` with a cleared history.
    pub fn reset(&mut self, initial: usize, now: u32) {
        self.block_size = self.clamp(initial);
        self.smoothed = 0;
        self.hold = self.config.period.max(1);
        self.last_tick = now;
    }

    /// Feed one completion seen at tick `now`; returns the block size for the next transfer.
    pub fn on_completion(&mut self, now: u32) -> usize {
        let elapsed = now.wrapping_sub(self.last_tick);
        self.last_tick = now;

        let dt = elapsed.saturating_mul(TICK_SCALE).min(i32::MAX as u32) as i32;
        self.smoothed += (dt - self.smoothed) / 8;
        self.smoothed = self.smoothed.min(self.config.ceiling);

        self.hold -= 1;
        if self.hold == 0 {
            self.hold = self.config.period.max(1);
            self.evaluate();
        }
        self.block_size
    }

    fn evaluate(&mut self) {
        let old = self.block_size;
        if self.smoothed < self.config.fast_threshold && self.block_size < self.max_block {
            self.block_size = (self.block_size * 2).min(self.max_block);
        }
        if self.smoothed > self.config.slow_threshold && self.block_size > self.max_packet {
            self.block_size = self.clamp(self.block_size / 2);
        }
        if self.block_size != old {
            debug!(
                "transfer length {} -> {} (smoothed interval {})",
                old, self.block_size, self.smoothed
            );
        }
    }

    fn clamp(&self, len: usize) -> usize {
        (len / self.max_packet * self.max_packet).clamp(self.max_packet, self.max_block)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Smoothed completion interval, in ticks scaled by [TICK_SCALE].
    pub fn smoothed_interval(&self) -> i32 {
        self.smoothed
    }
}

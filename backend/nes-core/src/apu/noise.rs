//! The noise channel: a 15-bit LFSR clocked from a 16-entry period table, with envelope and
//! length counter.

use crate::apu::pulse::{Envelope, LengthCounter};
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

const NTSC_PERIOD_TABLE: [u16; 16] =
    [4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068];

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct NoiseChannel {
    timer_period: u16,
    timer: u16,
    lfsr: u16,
    short_mode: bool,
    envelope: Envelope,
    length: LengthCounter,
}

impl NoiseChannel {
    pub(crate) fn new() -> Self {
        Self {
            timer_period: NTSC_PERIOD_TABLE[0],
            timer: 0,
            lfsr: 1,
            short_mode: false,
            envelope: Envelope::new(),
            length: LengthCounter::new(),
        }
    }

    pub(crate) fn write_vol(&mut self, value: u8) {
        self.envelope.configure(value);
        self.length.set_halt(value.bit(5));
    }

    pub(crate) fn write_lo(&mut self, value: u8) {
        self.short_mode = value.bit(7);
        self.timer_period = NTSC_PERIOD_TABLE[usize::from(value & 0x0F)];
    }

    pub(crate) fn write_hi(&mut self, value: u8) {
        self.length.load(value);
        self.envelope.restart();
    }

    pub(crate) fn write_snd_chn(&mut self, enabled: bool) {
        self.length.set_enabled(enabled);
    }

    pub(crate) fn tick_cpu(&mut self) {
        if self.timer == 0 {
            self.timer = self.timer_period;

            let feedback_bit = if self.short_mode { 6 } else { 1 };
            let feedback = u16::from(self.lfsr.bit(0) != self.lfsr.bit(feedback_bit));
            self.lfsr = (self.lfsr >> 1) | (feedback << 14);
        } else {
            self.timer -= 1;
        }
    }

    pub(crate) fn clock_quarter_frame(&mut self) {
        self.envelope.clock();
    }

    pub(crate) fn clock_half_frame(&mut self) {
        self.length.clock();
    }

    pub(crate) fn length_counter(&self) -> u8 {
        self.length.counter()
    }

    pub(crate) fn sample(&self) -> u8 {
        if self.length.counter() == 0 || self.lfsr.bit(0) {
            0
        } else {
            self.envelope.volume()
        }
    }
}

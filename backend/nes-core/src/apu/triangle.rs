//! The triangle channel: 32-step waveform generator with a linear counter in addition to the
//! standard length counter. Unlike the pulses, the timer clocks on every CPU cycle.

use crate::apu::pulse::LengthCounter;
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

const WAVEFORM: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11,
    12, 13, 14, 15,
];

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct TriangleChannel {
    timer_period: u16,
    timer: u16,
    phase: u8,
    linear_counter: u8,
    linear_counter_reload: u8,
    linear_reload_flag: bool,
    control_flag: bool,
    length: LengthCounter,
    current_output: u8,
}

impl TriangleChannel {
    pub(crate) fn new() -> Self {
        Self {
            timer_period: 0,
            timer: 0,
            phase: 0,
            linear_counter: 0,
            linear_counter_reload: 0,
            linear_reload_flag: false,
            control_flag: false,
            length: LengthCounter::new(),
            current_output: 0,
        }
    }

    pub(crate) fn write_linear(&mut self, value: u8) {
        self.control_flag = value.bit(7);
        self.linear_counter_reload = value & 0x7F;
        self.length.set_halt(value.bit(7));
    }

    pub(crate) fn write_lo(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x0700) | u16::from(value);
    }

    pub(crate) fn write_hi(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (u16::from(value & 0x07) << 8);
        self.length.load(value);
        self.linear_reload_flag = true;
    }

    pub(crate) fn write_snd_chn(&mut self, enabled: bool) {
        self.length.set_enabled(enabled);
    }

    pub(crate) fn tick_cpu(&mut self, silence_ultrasonic: bool) {
        if self.timer == 0 {
            self.timer = self.timer_period;

            if self.linear_counter > 0 && self.length.counter() > 0 {
                self.phase = (self.phase + 1) & 0x1F;
                // With an ultrasonic period the triangle degenerates into a DC offset; games
                // that use it this way expect ~7.5, and emulating the full-rate toggle just
                // produces aliasing noise
                self.current_output = if silence_ultrasonic && self.timer_period < 2 {
                    7
                } else {
                    WAVEFORM[self.phase as usize]
                };
            }
        } else {
            self.timer -= 1;
        }
    }

    pub(crate) fn clock_quarter_frame(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_counter_reload;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }

        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    pub(crate) fn clock_half_frame(&mut self) {
        self.length.clock();
    }

    pub(crate) fn length_counter(&self) -> u8 {
        self.length.counter()
    }

    pub(crate) fn sample(&self) -> u8 {
        // The triangle has no volume control; silencing it freezes the output level rather
        // than dropping it to zero
        self.current_output
    }
}

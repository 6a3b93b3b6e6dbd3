//! The two pulse (square wave) channels: 11-bit timer, 4 duty cycles, envelope unit, sweep
//! unit, length counter.

use crate::apu::LENGTH_COUNTER_TABLE;
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

const DUTY_SEQUENCES: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Envelope {
    constant_volume: bool,
    volume_or_period: u8,
    divider: u8,
    decay_counter: u8,
    start_flag: bool,
    loop_flag: bool,
}

impl Envelope {
    pub(crate) fn new() -> Self {
        Self {
            constant_volume: true,
            volume_or_period: 0,
            divider: 0,
            decay_counter: 0,
            start_flag: false,
            loop_flag: false,
        }
    }

    pub(crate) fn configure(&mut self, value: u8) {
        self.constant_volume = value.bit(4);
        self.volume_or_period = value & 0x0F;
        self.loop_flag = value.bit(5);
    }

    pub(crate) fn restart(&mut self) {
        self.start_flag = true;
    }

    pub(crate) fn clock(&mut self) {
        if self.start_flag {
            self.start_flag = false;
            self.decay_counter = 15;
            self.divider = self.volume_or_period;
            return;
        }

        if self.divider == 0 {
            self.divider = self.volume_or_period;
            if self.decay_counter > 0 {
                self.decay_counter -= 1;
            } else if self.loop_flag {
                self.decay_counter = 15;
            }
        } else {
            self.divider -= 1;
        }
    }

    pub(crate) fn volume(&self) -> u8 {
        if self.constant_volume { self.volume_or_period } else { self.decay_counter }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct LengthCounter {
    counter: u8,
    halt: bool,
    enabled: bool,
}

impl LengthCounter {
    pub(crate) fn new() -> Self {
        Self { counter: 0, halt: false, enabled: false }
    }

    pub(crate) fn set_halt(&mut self, halt: bool) {
        self.halt = halt;
    }

    pub(crate) fn load(&mut self, register_value: u8) {
        if self.enabled {
            self.counter = LENGTH_COUNTER_TABLE[usize::from(register_value >> 3)];
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.counter = 0;
        }
    }

    pub(crate) fn clock(&mut self) {
        if !self.halt && self.counter > 0 {
            self.counter -= 1;
        }
    }

    pub(crate) fn counter(&self) -> u8 {
        self.counter
    }
}

#[derive(Debug, Clone, Encode, Decode)]
struct Sweep {
    enabled: bool,
    period: u8,
    negate: bool,
    shift: u8,
    divider: u8,
    reload_flag: bool,
    // Pulse 1's negate uses one's complement, pulse 2's uses two's complement
    ones_complement_negate: bool,
}

impl Sweep {
    fn new(ones_complement_negate: bool) -> Self {
        Self {
            enabled: false,
            period: 0,
            negate: false,
            shift: 0,
            divider: 0,
            reload_flag: false,
            ones_complement_negate,
        }
    }

    fn configure(&mut self, value: u8) {
        self.enabled = value.bit(7);
        self.period = (value >> 4) & 0x07;
        self.negate = value.bit(3);
        self.shift = value & 0x07;
        self.reload_flag = true;
    }

    fn target_period(&self, current_period: u16) -> u16 {
        let change = current_period >> self.shift;
        if self.negate {
            let negated = current_period.wrapping_sub(change);
            if self.ones_complement_negate { negated.wrapping_sub(1) } else { negated }
        } else {
            current_period + change
        }
    }

    fn muting(&self, current_period: u16) -> bool {
        current_period < 8 || self.target_period(current_period) > 0x07FF
    }

    fn clock(&mut self, timer_period: &mut u16) {
        if self.divider == 0 && self.enabled && self.shift != 0 && !self.muting(*timer_period) {
            *timer_period = self.target_period(*timer_period) & 0x07FF;
        }

        if self.divider == 0 || self.reload_flag {
            self.divider = self.period;
            self.reload_flag = false;
        } else {
            self.divider -= 1;
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct PulseChannel {
    duty_cycle: u8,
    duty_phase: u8,
    timer_period: u16,
    timer: u16,
    // The timer clocks every other CPU cycle
    timer_parity: bool,
    envelope: Envelope,
    sweep: Sweep,
    length: LengthCounter,
}

impl PulseChannel {
    pub(crate) fn new_channel_1() -> Self {
        Self::new(true)
    }

    pub(crate) fn new_channel_2() -> Self {
        Self::new(false)
    }

    fn new(ones_complement_negate: bool) -> Self {
        Self {
            duty_cycle: 0,
            duty_phase: 0,
            timer_period: 0,
            timer: 0,
            timer_parity: false,
            envelope: Envelope::new(),
            sweep: Sweep::new(ones_complement_negate),
            length: LengthCounter::new(),
        }
    }

    pub(crate) fn write_vol(&mut self, value: u8) {
        self.duty_cycle = value >> 6;
        self.envelope.configure(value);
        self.length.set_halt(value.bit(5));
    }

    pub(crate) fn write_sweep(&mut self, value: u8) {
        self.sweep.configure(value);
    }

    pub(crate) fn write_lo(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x0700) | u16::from(value);
    }

    pub(crate) fn write_hi(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (u16::from(value & 0x07) << 8);
        self.length.load(value);
        self.envelope.restart();
        self.duty_phase = 0;
    }

    pub(crate) fn write_snd_chn(&mut self, enabled: bool) {
        self.length.set_enabled(enabled);
    }

    pub(crate) fn tick_cpu(&mut self) {
        self.timer_parity = !self.timer_parity;
        if !self.timer_parity {
            return;
        }

        if self.timer == 0 {
            self.timer = self.timer_period;
            self.duty_phase = (self.duty_phase + 1) & 0x07;
        } else {
            self.timer -= 1;
        }
    }

    pub(crate) fn clock_quarter_frame(&mut self) {
        self.envelope.clock();
    }

    pub(crate) fn clock_half_frame(&mut self) {
        self.length.clock();
        self.sweep.clock(&mut self.timer_period);
    }

    pub(crate) fn length_counter(&self) -> u8 {
        self.length.counter()
    }

    pub(crate) fn sample(&self) -> u8 {
        // Periods below 8 put the output above 20kHz, which the DAC stage filters to silence
        if self.length.counter() == 0 || self.sweep.muting(self.timer_period) {
            return 0;
        }

        let duty_output =
            DUTY_SEQUENCES[self.duty_cycle as usize][self.duty_phase as usize];
        duty_output * self.envelope.volume()
    }
}

//! APU (audio processing unit) emulation.
//!
//! Five channels: two pulse generators, a triangle generator, a noise generator, and the DMC.
//! A frame sequencer divides the CPU clock into quarter-frame ticks (envelopes + triangle
//! linear counter) and half-frame ticks (length counters + sweeps), with 4-step and 5-step
//! modes; only the 4-step sequence raises the frame IRQ.
//!
//! The APU does not produce one sample per clock. Whenever the non-linear mix of the channel
//! outputs changes, it emits a delta (cycle-stamped level change) into a per-frame buffer that
//! the console resamples at frame end. Cycles with no change cost nothing downstream.

mod dmc;
mod noise;
mod pulse;
mod triangle;

use crate::apu::dmc::DeltaModulationChannel;
use crate::apu::noise::NoiseChannel;
use crate::apu::pulse::PulseChannel;
use crate::apu::triangle::TriangleChannel;
use bincode::{Decode, Encode};
use nexen_common::audio::{AudioDelta, DeltaBuffer};
use nexen_common::frontend::TimingMode;
use nexen_common::num::GetBit;
use std::ops::Range;
use std::sync::LazyLock;

// Large enough for the longest PAL frame in CPU cycles
pub(crate) const DELTA_BUFFER_CYCLES: usize = 40_000;

// The length counter load values are indexed by the 5-bit field in the channel's high register
pub(crate) const LENGTH_COUNTER_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum FrameCounterMode {
    FourStep,
    FiveStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum FrameCounterResetState {
    JustWritten,
    PendingReset,
    None,
}

#[derive(Debug, Clone, Encode, Decode)]
struct FrameCounter {
    steps: [u16; 5],
    four_step_reset: u16,
    five_step_reset: u16,
    interrupt_range: Range<u16>,
    cpu_ticks: u16,
    mode: FrameCounterMode,
    interrupt_inhibit_flag: bool,
    reset_state: FrameCounterResetState,
}

impl FrameCounter {
    const NTSC_STEPS: [u16; 5] = [7456, 14912, 22370, 29828, 37280];
    const PAL_STEPS: [u16; 5] = [8312, 16626, 24938, 33252, 41564];

    fn new(timing_mode: TimingMode) -> Self {
        let steps = match timing_mode {
            TimingMode::Ntsc => Self::NTSC_STEPS,
            TimingMode::Pal => Self::PAL_STEPS,
        };

        Self {
            steps,
            four_step_reset: steps[3] + 2,
            five_step_reset: steps[4] + 2,
            interrupt_range: (steps[3] - 1)..(steps[3] + 2),
            cpu_ticks: 0,
            mode: FrameCounterMode::FourStep,
            interrupt_inhibit_flag: false,
            reset_state: FrameCounterResetState::None,
        }
    }

    fn process_register_write(&mut self, value: u8) -> bool {
        self.mode =
            if value.bit(7) { FrameCounterMode::FiveStep } else { FrameCounterMode::FourStep };
        self.interrupt_inhibit_flag = value.bit(6);
        self.reset_state = FrameCounterResetState::JustWritten;

        // Writing 5-step mode immediately clocks the quarter and half frame units
        self.mode == FrameCounterMode::FiveStep
    }

    fn tick(&mut self) {
        if (self.cpu_ticks == self.four_step_reset && self.mode == FrameCounterMode::FourStep)
            || self.cpu_ticks == self.five_step_reset
        {
            self.cpu_ticks = 1;
        } else {
            self.cpu_ticks += 1;
        }

        // The sequencer reset after a $4017 write lands on an even CPU cycle
        if !self.cpu_ticks.bit(0) {
            match self.reset_state {
                FrameCounterResetState::JustWritten => {
                    self.reset_state = FrameCounterResetState::PendingReset;
                }
                FrameCounterResetState::PendingReset => {
                    self.cpu_ticks = 0;
                    self.reset_state = FrameCounterResetState::None;
                }
                FrameCounterResetState::None => {}
            }
        }
    }

    fn quarter_frame_clock(&self) -> bool {
        self.cpu_ticks == self.steps[0]
            || self.cpu_ticks == self.steps[1]
            || self.cpu_ticks == self.steps[2]
            || (self.cpu_ticks == self.steps[3] && self.mode == FrameCounterMode::FourStep)
            || self.cpu_ticks == self.steps[4]
    }

    fn half_frame_clock(&self) -> bool {
        self.cpu_ticks == self.steps[1]
            || (self.cpu_ticks == self.steps[3] && self.mode == FrameCounterMode::FourStep)
            || self.cpu_ticks == self.steps[4]
    }

    fn should_set_interrupt_flag(&self) -> bool {
        !self.interrupt_inhibit_flag
            && self.mode == FrameCounterMode::FourStep
            && self.interrupt_range.contains(&self.cpu_ticks)
    }
}

/// What the DMC needs from the bus this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DmcDmaRequest {
    None,
    Fetch { address: u16 },
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Apu {
    pulse_1: PulseChannel,
    pulse_2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DeltaModulationChannel,
    frame_counter: FrameCounter,
    frame_counter_interrupt_flag: bool,
    last_mixed_level: f64,
    deltas: DeltaBuffer,
    silence_ultrasonic_triangle: bool,
}

impl Apu {
    pub(crate) fn new(timing_mode: TimingMode, silence_ultrasonic_triangle: bool) -> Self {
        Self {
            pulse_1: PulseChannel::new_channel_1(),
            pulse_2: PulseChannel::new_channel_2(),
            triangle: TriangleChannel::new(),
            noise: NoiseChannel::new(),
            dmc: DeltaModulationChannel::new(),
            frame_counter: FrameCounter::new(timing_mode),
            frame_counter_interrupt_flag: false,
            last_mixed_level: 0.0,
            deltas: DeltaBuffer::new(DELTA_BUFFER_CYCLES),
            silence_ultrasonic_triangle,
        }
    }

    pub(crate) fn set_silence_ultrasonic_triangle(&mut self, silence: bool) {
        self.silence_ultrasonic_triangle = silence;
    }

    /// Put/get cycle parity, which OAM DMA alignment depends on.
    pub(crate) fn is_active_cycle(&self) -> bool {
        self.frame_counter.cpu_ticks.bit(0)
    }

    pub(crate) fn write_register(&mut self, address: u16, value: u8) {
        match address {
            0x4000 => self.pulse_1.write_vol(value),
            0x4001 => self.pulse_1.write_sweep(value),
            0x4002 => self.pulse_1.write_lo(value),
            0x4003 => self.pulse_1.write_hi(value),
            0x4004 => self.pulse_2.write_vol(value),
            0x4005 => self.pulse_2.write_sweep(value),
            0x4006 => self.pulse_2.write_lo(value),
            0x4007 => self.pulse_2.write_hi(value),
            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_lo(value),
            0x400B => self.triangle.write_hi(value),
            0x400C => self.noise.write_vol(value),
            0x400E => self.noise.write_lo(value),
            0x400F => self.noise.write_hi(value),
            0x4010 => self.dmc.write_freq(value),
            0x4011 => self.dmc.write_raw(value),
            0x4012 => self.dmc.write_start(value),
            0x4013 => self.dmc.write_len(value),
            0x4015 => {
                self.pulse_1.write_snd_chn(value.bit(0));
                self.pulse_2.write_snd_chn(value.bit(1));
                self.triangle.write_snd_chn(value.bit(2));
                self.noise.write_snd_chn(value.bit(3));
                self.dmc.write_snd_chn(value.bit(4));
            }
            0x4017 => {
                if self.frame_counter.process_register_write(value) {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                if self.frame_counter.interrupt_inhibit_flag {
                    self.frame_counter_interrupt_flag = false;
                }
            }
            _ => {}
        }
    }

    /// $4015 read: channel length counter statuses plus interrupt flags. Reading clears the
    /// frame counter interrupt flag.
    pub(crate) fn read_status(&mut self) -> u8 {
        let status = self.peek_status();
        self.frame_counter_interrupt_flag = false;
        status
    }

    pub(crate) fn peek_status(&self) -> u8 {
        (u8::from(self.dmc.interrupt_flag()) << 7)
            | (u8::from(self.frame_counter_interrupt_flag) << 6)
            | (u8::from(self.dmc.sample_bytes_remaining() > 0) << 4)
            | (u8::from(self.noise.length_counter() > 0) << 3)
            | (u8::from(self.triangle.length_counter() > 0) << 2)
            | (u8::from(self.pulse_2.length_counter() > 0) << 1)
            | u8::from(self.pulse_1.length_counter() > 0)
    }

    /// Clock the APU by one CPU cycle. Emits a delta if the mixed output level changed.
    /// Returns a DMA request if the DMC's sample buffer ran dry this cycle.
    pub(crate) fn tick(&mut self, frame_cycle: u32) -> DmcDmaRequest {
        self.pulse_1.tick_cpu();
        self.pulse_2.tick_cpu();
        self.triangle.tick_cpu(self.silence_ultrasonic_triangle);
        self.noise.tick_cpu();
        let dma_request = self.dmc.tick_cpu();

        self.frame_counter.tick();
        if self.frame_counter.quarter_frame_clock() {
            self.clock_quarter_frame();
        }
        if self.frame_counter.half_frame_clock() {
            self.clock_half_frame();
        }

        if self.frame_counter.should_set_interrupt_flag() {
            self.frame_counter_interrupt_flag = true;
        }

        let mixed = self.mix();
        if mixed != self.last_mixed_level {
            self.deltas.push(frame_cycle, mixed - self.last_mixed_level);
            self.last_mixed_level = mixed;
        }

        dma_request
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse_1.clock_quarter_frame();
        self.pulse_2.clock_quarter_frame();
        self.triangle.clock_quarter_frame();
        self.noise.clock_quarter_frame();
    }

    fn clock_half_frame(&mut self) {
        self.pulse_1.clock_half_frame();
        self.pulse_2.clock_half_frame();
        self.triangle.clock_half_frame();
        self.noise.clock_half_frame();
    }

    pub(crate) fn dmc_sample_fetched(&mut self, sample: u8) {
        self.dmc.sample_fetched(sample);
    }

    pub(crate) fn frame_irq(&self) -> bool {
        self.frame_counter_interrupt_flag
    }

    pub(crate) fn dmc_irq(&self) -> bool {
        self.dmc.interrupt_flag()
    }

    fn mix(&self) -> f64 {
        let pulse_mix = mix_pulse_samples(self.pulse_1.sample(), self.pulse_2.sample());
        let tnd_mix =
            mix_tnd_samples(self.triangle.sample(), self.noise.sample(), self.dmc.sample());
        pulse_mix + tnd_mix
    }

    /// Move this frame's deltas into `out` in cycle order.
    pub(crate) fn take_deltas(&mut self, out: &mut Vec<AudioDelta>) {
        self.deltas.drain_sorted(out);
    }

    /// Soft reset: silence all channels and reset the frame counter. The triangle's length
    /// counter state survives reset on real hardware.
    pub(crate) fn reset(&mut self) {
        self.write_register(0x4015, 0x00);
        self.frame_counter.reset_state = FrameCounterResetState::JustWritten;
        self.frame_counter_interrupt_flag = false;
        self.dmc.reset();
    }
}

fn mix_pulse_samples(pulse1: u8, pulse2: u8) -> f64 {
    static PULSE_TABLE: LazyLock<[[f64; 16]; 16]> = LazyLock::new(|| {
        let mut table = [[0.0; 16]; 16];
        for (pulse1, row) in table.iter_mut().enumerate() {
            for (pulse2, value) in row.iter_mut().enumerate() {
                if pulse1 > 0 || pulse2 > 0 {
                    *value = 95.88 / (8128.0 / (pulse1 + pulse2) as f64 + 100.0);
                }
            }
        }
        table
    });

    PULSE_TABLE[pulse1 as usize][pulse2 as usize]
}

fn mix_tnd_samples(triangle: u8, noise: u8, dmc: u8) -> f64 {
    static TND_TABLE: LazyLock<Box<[[[f64; 16]; 16]; 128]>> = LazyLock::new(|| {
        let mut table = Box::new([[[0.0; 16]; 16]; 128]);
        for (dmc, dmc_row) in table.iter_mut().enumerate() {
            for (triangle, triangle_row) in dmc_row.iter_mut().enumerate() {
                for (noise, value) in triangle_row.iter_mut().enumerate() {
                    if triangle > 0 || noise > 0 || dmc > 0 {
                        *value = 159.79
                            / (1.0
                                / (triangle as f64 / 8227.0
                                    + noise as f64 / 12241.0
                                    + dmc as f64 / 22638.0)
                                + 100.0);
                    }
                }
            }
        }
        table
    });

    TND_TABLE[dmc as usize][triangle as usize][noise as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cycles(apu: &mut Apu, cycles: u32) {
        for cycle in 0..cycles {
            apu.tick(cycle);
        }
    }

    fn setup_pulse_1(apu: &mut Apu) {
        apu.write_register(0x4015, 0x01); // enable pulse 1
        apu.write_register(0x4000, 0x9F); // duty 2, halt off, constant volume 15
        apu.write_register(0x4002, 0x80); // period low
        apu.write_register(0x4003, 0x18); // period high 0, length load index 3 (2 ticks)
    }

    #[test]
    fn pulse_channel_produces_deltas() {
        let mut apu = Apu::new(TimingMode::Ntsc, false);
        setup_pulse_1(&mut apu);
        run_cycles(&mut apu, 10_000);

        let mut deltas = Vec::new();
        apu.take_deltas(&mut deltas);
        assert!(!deltas.is_empty());
        assert!(deltas.windows(2).all(|pair| pair[0].cycle < pair[1].cycle));
        assert!(deltas.iter().all(|delta| delta.change != 0.0));
    }

    #[test]
    fn pulse_at_ultrasonic_period_is_silent() {
        let mut apu = Apu::new(TimingMode::Ntsc, false);
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0x3F); // duty 0, constant volume 15
        apu.write_register(0x4002, 0x01); // period 1: below the hardware minimum of 8
        apu.write_register(0x4003, 0x08);

        run_cycles(&mut apu, 5_000);

        let mut deltas = Vec::new();
        apu.take_deltas(&mut deltas);
        assert!(deltas.is_empty());
    }

    #[test]
    fn writing_zero_length_silences_channel_within_half_frame() {
        let mut apu = Apu::new(TimingMode::Ntsc, false);
        setup_pulse_1(&mut apu);
        assert!(apu.peek_status().bit(0));

        // Disabling the channel zeroes its length counter immediately
        apu.write_register(0x4015, 0x00);
        assert!(!apu.peek_status().bit(0));

        // Re-enable with length counting down and halt clear: length expires via half-frames
        setup_pulse_1(&mut apu);
        run_cycles(&mut apu, 600_000);
        assert!(!apu.peek_status().bit(0));
    }

    #[test]
    fn four_step_mode_sets_frame_irq() {
        let mut apu = Apu::new(TimingMode::Ntsc, false);
        apu.write_register(0x4017, 0x00); // 4-step, IRQ enabled
        run_cycles(&mut apu, 30_000);
        assert!(apu.frame_irq());

        // $4015 read clears it
        apu.read_status();
        assert!(!apu.frame_irq());
    }

    #[test]
    fn five_step_mode_never_sets_frame_irq() {
        let mut apu = Apu::new(TimingMode::Ntsc, false);
        apu.write_register(0x4017, 0x80); // 5-step
        run_cycles(&mut apu, 80_000);
        assert!(!apu.frame_irq());
    }

    #[test]
    fn frame_irq_inhibit_clears_flag() {
        let mut apu = Apu::new(TimingMode::Ntsc, false);
        apu.write_register(0x4017, 0x00);
        run_cycles(&mut apu, 30_000);
        assert!(apu.frame_irq());

        apu.write_register(0x4017, 0x40);
        assert!(!apu.frame_irq());
    }
}

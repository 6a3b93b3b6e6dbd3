//! The DMC (delta modulation channel): plays 1-bit delta-encoded samples fetched from CPU
//! memory. Sample fetches go through the scheduler as DMA requests that steal CPU cycles.

use crate::apu::DmcDmaRequest;
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

const NTSC_RATE_TABLE: [u16; 16] =
    [428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54];

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct DeltaModulationChannel {
    timer_period: u16,
    timer: u16,
    output_level: u8,
    shift_register: u8,
    bits_remaining: u8,
    silence_flag: bool,
    sample_buffer: Option<u8>,
    sample_address: u16,
    sample_length: u16,
    current_address: u16,
    bytes_remaining: u16,
    loop_flag: bool,
    irq_enabled: bool,
    interrupt_flag: bool,
    dma_pending: bool,
}

impl DeltaModulationChannel {
    pub(crate) fn new() -> Self {
        Self {
            timer_period: NTSC_RATE_TABLE[0],
            timer: 0,
            output_level: 0,
            shift_register: 0,
            bits_remaining: 8,
            silence_flag: true,
            sample_buffer: None,
            sample_address: 0xC000,
            sample_length: 1,
            current_address: 0xC000,
            bytes_remaining: 0,
            loop_flag: false,
            irq_enabled: false,
            interrupt_flag: false,
            dma_pending: false,
        }
    }

    pub(crate) fn write_freq(&mut self, value: u8) {
        self.timer_period = NTSC_RATE_TABLE[usize::from(value & 0x0F)];
        self.loop_flag = value.bit(6);
        self.irq_enabled = value.bit(7);
        if !self.irq_enabled {
            self.interrupt_flag = false;
        }
    }

    pub(crate) fn write_raw(&mut self, value: u8) {
        self.output_level = value & 0x7F;
    }

    pub(crate) fn write_start(&mut self, value: u8) {
        self.sample_address = 0xC000 | (u16::from(value) << 6);
    }

    pub(crate) fn write_len(&mut self, value: u8) {
        self.sample_length = (u16::from(value) << 4) | 0x01;
    }

    pub(crate) fn write_snd_chn(&mut self, enabled: bool) {
        self.interrupt_flag = false;

        if !enabled {
            self.bytes_remaining = 0;
            return;
        }

        if self.bytes_remaining == 0 {
            self.restart_sample();
        }
    }

    fn restart_sample(&mut self) {
        self.current_address = self.sample_address;
        self.bytes_remaining = self.sample_length;
        if self.sample_buffer.is_none() {
            self.dma_pending = true;
        }
    }

    pub(crate) fn tick_cpu(&mut self) -> DmcDmaRequest {
        if self.timer == 0 {
            self.timer = self.timer_period - 1;
            self.clock_output_unit();
        } else {
            self.timer -= 1;
        }

        if self.dma_pending && self.bytes_remaining > 0 {
            self.dma_pending = false;
            return DmcDmaRequest::Fetch { address: self.current_address };
        }

        DmcDmaRequest::None
    }

    fn clock_output_unit(&mut self) {
        if !self.silence_flag {
            if self.shift_register.bit(0) {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
            self.shift_register >>= 1;
        }

        self.bits_remaining -= 1;
        if self.bits_remaining == 0 {
            self.bits_remaining = 8;

            match self.sample_buffer.take() {
                Some(sample) => {
                    self.silence_flag = false;
                    self.shift_register = sample;
                    if self.bytes_remaining > 0 {
                        self.dma_pending = true;
                    }
                }
                None => {
                    self.silence_flag = true;
                }
            }
        }
    }

    /// The bus completed a DMA fetch for this channel.
    pub(crate) fn sample_fetched(&mut self, sample: u8) {
        self.sample_buffer = Some(sample);

        self.current_address = self.current_address.checked_add(1).unwrap_or(0x8000);
        self.bytes_remaining -= 1;

        if self.bytes_remaining == 0 {
            if self.loop_flag {
                self.restart_sample();
            } else if self.irq_enabled {
                self.interrupt_flag = true;
            }
        }
    }

    pub(crate) fn interrupt_flag(&self) -> bool {
        self.interrupt_flag
    }

    pub(crate) fn sample_bytes_remaining(&self) -> u16 {
        self.bytes_remaining
    }

    pub(crate) fn sample(&self) -> u8 {
        self.output_level
    }

    pub(crate) fn reset(&mut self) {
        self.output_level = 0;
        self.silence_flag = true;
        self.interrupt_flag = false;
    }
}

//! The public console interface for the SMS/GG core.
//!
//! The scheduler here is instruction-grained: the Z80 reports each instruction's T-cycle cost
//! and the VDP/PSG are driven forward by the equivalent number of their own clocks.

use crate::audio::AudioResampler;
use crate::bus::Bus;
use crate::input::{SmsGgButton, SmsGgInputs};
use crate::memory::Memory;
use crate::vdp;
use crate::SmsGgHardware;
use bincode::{Decode, Encode};
use nexen_common::audio::DEFAULT_OUTPUT_FREQUENCY;
use nexen_common::frontend::{
    AudioOutput, Color, EmulatorConfigTrait, EmulatorTrait, FrameSize, PartialClone, Renderer,
    SaveWriter, TickEffect, TickResult,
};
use nexen_common::savestate::{SaveStateError, StateRecords};
use nexen_proc_macros::{FakeDecode, FakeEncode};
use std::fmt::{Debug, Display};
use std::mem;
use thiserror::Error;
use z80_emu::Z80;

// The VDP pixel clock is half the master clock; the Z80 clock is a third of it. Driving the
// VDP at 3/2 dots per Z80 cycle keeps them in exact ratio using integer accumulation.
const VDP_DOTS_PER_Z80_CYCLE_NUM: u64 = 3;
const VDP_DOTS_PER_Z80_CYCLE_DEN: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct SmsGgEmulatorConfig {
    pub hardware: SmsGgHardware,
    /// Remove the 512-byte copier header if present
    pub strip_smd_header: bool,
}

impl EmulatorConfigTrait for SmsGgEmulatorConfig {}

#[derive(Debug, Error)]
pub enum SmsGgError<RErr, AErr, SErr> {
    #[error("Error rendering frame: {0}")]
    Render(RErr),
    #[error("Error outputting audio samples: {0}")]
    Audio(AErr),
    #[error("Error persisting save file: {0}")]
    SaveWrite(SErr),
}

#[derive(Debug, Error)]
pub enum SmsGgInitializationError {
    #[error("ROM image is empty")]
    EmptyRom,
}

#[derive(Debug, Clone, FakeEncode, FakeDecode)]
struct RgbaFrameBuffer(Vec<Color>);

impl Default for RgbaFrameBuffer {
    fn default() -> Self {
        Self(vec![Color::default(); vdp::FRAME_BUFFER_LEN])
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub struct SmsGgEmulator {
    cpu: Z80,
    #[partial_clone(partial)]
    bus: Bus,
    config: SmsGgEmulatorConfig,
    hardware: SmsGgHardware,
    audio_resampler: AudioResampler,
    z80_cycle_counter: u64,
    vdp_dot_remainder: u64,
    frame_z80_cycles: u32,
    #[partial_clone(default)]
    rgba_frame_buffer: RgbaFrameBuffer,
    frame_count: u64,
}

impl SmsGgEmulator {
    /// Create a new emulator instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM image is empty.
    pub fn create<S: SaveWriter>(
        mut rom_bytes: Vec<u8>,
        config: SmsGgEmulatorConfig,
        save_writer: &mut S,
    ) -> Result<Self, SmsGgInitializationError> {
        if config.strip_smd_header && rom_bytes.len() % 0x4000 == 512 {
            rom_bytes.drain(..512);
        }
        if rom_bytes.is_empty() {
            return Err(SmsGgInitializationError::EmptyRom);
        }

        let sav_bytes = save_writer.load_bytes("sav").ok();
        let memory = Memory::new(rom_bytes, sav_bytes);
        let bus = Bus::new(memory, config.hardware);

        Ok(Self {
            cpu: Z80::new(),
            bus,
            config,
            hardware: config.hardware,
            audio_resampler: AudioResampler::new(DEFAULT_OUTPUT_FREQUENCY),
            z80_cycle_counter: 0,
            vdp_dot_remainder: 0,
            frame_z80_cycles: 0,
            rgba_frame_buffer: RgbaFrameBuffer::default(),
            frame_count: 0,
        })
    }

    #[must_use]
    pub fn hardware(&self) -> SmsGgHardware {
        self.hardware
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn set_cheat_codes(&mut self, codes: Vec<nexen_common::cheats::CheatCode>) {
        self.bus.cheats.set_codes(codes);
    }

    /// Flush battery-backed RAM regardless of the dirty bit; used on shutdown.
    pub fn persist_battery_save<S: SaveWriter>(&mut self, save_writer: &mut S) -> Result<(), S::Err> {
        if self.bus.memory.has_battery() {
            save_writer.persist_bytes("sav", self.bus.memory.sram())?;
        }
        Ok(())
    }

    fn render_frame<R: Renderer>(&mut self, renderer: &mut R) -> Result<(), R::Err> {
        let raw = self.bus.vdp.frame_buffer();

        if self.hardware == SmsGgHardware::GameGear {
            for y in 0..vdp::GG_SCREEN_HEIGHT {
                for x in 0..vdp::GG_SCREEN_WIDTH {
                    let source = raw[vdp::gg_crop_offset(x, y)];
                    self.rgba_frame_buffer.0[y * vdp::GG_SCREEN_WIDTH + x] =
                        bgr444_to_color(source);
                }
            }
            renderer.render_frame(
                &self.rgba_frame_buffer.0[..vdp::GG_SCREEN_WIDTH * vdp::GG_SCREEN_HEIGHT],
                FrameSize {
                    width: vdp::GG_SCREEN_WIDTH as u32,
                    height: vdp::GG_SCREEN_HEIGHT as u32,
                },
            )
        } else {
            for (i, &bgr444) in raw.iter().enumerate() {
                self.rgba_frame_buffer.0[i] = bgr444_to_color(bgr444);
            }
            renderer.render_frame(
                &self.rgba_frame_buffer.0,
                FrameSize {
                    width: vdp::SCREEN_WIDTH as u32,
                    height: vdp::SCREEN_HEIGHT as u32,
                },
            )
        }
    }
}

fn bgr444_to_color(bgr444: u16) -> Color {
    let expand = |channel: u16| -> u8 {
        let channel = (channel & 0x0F) as u8;
        (channel << 4) | channel
    };

    Color::rgb(expand(bgr444), expand(bgr444 >> 4), expand(bgr444 >> 8))
}

impl EmulatorTrait for SmsGgEmulator {
    type Button = SmsGgButton;
    type Inputs = SmsGgInputs;
    type Config = SmsGgEmulatorConfig;
    type Err<
        RErr: Debug + Display + Send + Sync + 'static,
        AErr: Debug + Display + Send + Sync + 'static,
        SErr: Debug + Display + Send + Sync + 'static,
    > = SmsGgError<RErr, AErr, SErr>;

    fn tick<R, A, S>(
        &mut self,
        renderer: &mut R,
        audio_output: &mut A,
        inputs: &Self::Inputs,
        save_writer: &mut S,
    ) -> TickResult<Self::Err<R::Err, A::Err, S::Err>>
    where
        R: Renderer,
        R::Err: Debug + Display + Send + Sync + 'static,
        A: AudioOutput,
        A::Err: Debug + Display + Send + Sync + 'static,
        S: SaveWriter,
        S::Err: Debug + Display + Send + Sync + 'static,
    {
        self.bus.input.update(inputs);
        if self.hardware == SmsGgHardware::MasterSystem {
            let pause_pressed = self.bus.input.pause_pressed();
            self.bus.set_nmi_pending(pause_pressed);
        }

        let t_cycles = u64::from(self.cpu.execute_instruction(&mut self.bus));
        self.z80_cycle_counter += t_cycles;
        self.frame_z80_cycles += t_cycles as u32;

        // Drive the VDP to the CPU's new position in master-clock terms
        let dots_scaled = t_cycles * VDP_DOTS_PER_Z80_CYCLE_NUM + self.vdp_dot_remainder;
        self.vdp_dot_remainder = dots_scaled % VDP_DOTS_PER_Z80_CYCLE_DEN;
        self.bus.vdp.tick_dots((dots_scaled / VDP_DOTS_PER_Z80_CYCLE_DEN) as u32);

        let frame_z80_cycles = self.frame_z80_cycles;
        self.bus.psg.tick_z80_cycles(t_cycles as u32, frame_z80_cycles);

        if self.bus.vdp.get_and_clear_frame_complete() {
            self.frame_count += 1;

            let frame_psg_cycles = self.frame_z80_cycles / 16;
            self.audio_resampler.process_frame(&mut self.bus.psg, frame_psg_cycles);
            self.frame_z80_cycles = 0;
            self.audio_resampler.output_samples(audio_output).map_err(SmsGgError::Audio)?;

            self.render_frame(renderer).map_err(SmsGgError::Render)?;

            if self.bus.memory.get_and_clear_ram_dirty_bit() && self.bus.memory.has_battery() {
                save_writer
                    .persist_bytes("sav", self.bus.memory.sram())
                    .map_err(SmsGgError::SaveWrite)?;
            }

            return Ok(TickEffect::FrameRendered);
        }

        Ok(TickEffect::None)
    }

    fn force_render<R>(&mut self, renderer: &mut R) -> Result<(), R::Err>
    where
        R: Renderer,
    {
        self.render_frame(renderer)
    }

    fn write_state_records(&self, records: &mut StateRecords) {
        records.push_serialized("smsgg.cpu", &self.cpu);
        records.push_serialized("smsgg.bus", &self.bus);
        records.push_serialized("smsgg.audio", &self.audio_resampler);
        records.push_serialized("smsgg.frame_count", &self.frame_count);
        records.push_serialized("smsgg.timing", &(self.z80_cycle_counter, self.frame_z80_cycles));
    }

    fn load_state_records(&mut self, records: &StateRecords) -> Result<(), SaveStateError> {
        let cpu: Z80 = records.decode("smsgg.cpu")?;
        let mut bus: Bus = records.decode("smsgg.bus")?;
        let audio_resampler: AudioResampler = records.decode("smsgg.audio")?;
        let frame_count: u64 = records.decode("smsgg.frame_count")?;
        let (z80_cycle_counter, frame_z80_cycles): (u64, u32) =
            records.decode("smsgg.timing")?;

        bus.memory.move_rom_from(&mut self.bus.memory);

        self.cpu = cpu;
        self.bus = bus;
        self.audio_resampler = audio_resampler;
        self.frame_count = frame_count;
        self.z80_cycle_counter = z80_cycle_counter;
        self.frame_z80_cycles = frame_z80_cycles;

        Ok(())
    }

    fn reload_config(&mut self, config: &Self::Config) {
        self.config = *config;
    }

    fn take_rom_from(&mut self, other: &mut Self) {
        self.bus.memory.move_rom_from(&mut other.bus.memory);
    }

    fn soft_reset(&mut self) {
        self.cpu.reset();
    }

    fn hard_reset<S: SaveWriter>(&mut self, _save_writer: &mut S) {
        let memory = mem::replace(&mut self.bus.memory, Memory::new(vec![0], None));
        self.bus = Bus::new(memory, self.hardware);
        self.cpu = Z80::new();
        self.frame_count = 0;
        self.frame_z80_cycles = 0;
        self.z80_cycle_counter = 0;
    }

    fn target_fps(&self) -> f64 {
        // NTSC: 3579545 / (342 * 262 * 2/3) -> ~59.92
        59.9227
    }

    fn update_audio_output_frequency(&mut self, output_frequency: u64) {
        self.audio_resampler.update_output_frequency(output_frequency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexen_common::frontend::AudioOutput;
    use std::convert::Infallible;

    struct NullRenderer;

    impl Renderer for NullRenderer {
        type Err = Infallible;

        fn render_frame(&mut self, _: &[Color], _: FrameSize) -> Result<(), Self::Err> {
            Ok(())
        }
    }

    struct NullAudio;

    impl AudioOutput for NullAudio {
        type Err = Infallible;

        fn push_sample(&mut self, _: f64, _: f64) -> Result<(), Self::Err> {
            Ok(())
        }
    }

    struct NullSaveWriter;

    impl SaveWriter for NullSaveWriter {
        type Err = std::io::Error;

        fn load_bytes(&mut self, _: &str) -> Result<Vec<u8>, Self::Err> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "none"))
        }

        fn persist_bytes(&mut self, _: &str, _: &[u8]) -> Result<(), Self::Err> {
            Ok(())
        }
    }

    #[test]
    fn runs_a_frame_of_nops() {
        let rom = vec![0x00; 32 * 1024];
        let mut emulator =
            SmsGgEmulator::create(rom, SmsGgEmulatorConfig::default(), &mut NullSaveWriter)
                .unwrap();

        let inputs = SmsGgInputs::default();
        loop {
            let effect = emulator
                .tick(&mut NullRenderer, &mut NullAudio, &inputs, &mut NullSaveWriter)
                .unwrap();
            if effect == TickEffect::FrameRendered {
                break;
            }
        }

        assert_eq!(emulator.frame_count(), 1);
        // One NTSC frame is ~59736 Z80 cycles
        assert!((55_000..65_000).contains(&emulator.z80_cycle_counter));
    }
}

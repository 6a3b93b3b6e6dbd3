//! The public console interface: creation from a ROM image, the tick loop, save states, and
//! configuration.

use crate::apu::Apu;
use crate::audio::AudioResampler;
use crate::bus::Bus;
use crate::cartridge::{self, CartridgeError, Rom};
use crate::input::{NesButton, NesInputs};
use crate::ppu::{self, Ppu};
use crate::{Overscan, TimingModeExt, graphics};
use bincode::{Decode, Encode};
use mos6502_emu::bus::BusInterface;
use mos6502_emu::{CpuVariant, Mos6502};
use nexen_common::audio::{AudioDelta, DEFAULT_OUTPUT_FREQUENCY};
use nexen_common::cheats::CheatCode;
use nexen_common::frontend::{
    AudioOutput, Color, EmulatorConfigTrait, EmulatorTrait, FrameSize, PartialClone, Renderer,
    SaveWriter, TickEffect, TickResult, TimingMode,
};
use nexen_common::savestate::{SaveStateError, StateRecords};
use nexen_proc_macros::{FakeDecode, FakeEncode};
use std::fmt::{Debug, Display};
use std::mem;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct NesEmulatorConfig {
    /// Override the timing mode instead of trusting the ROM header
    pub forced_timing_mode: Option<TimingMode>,
    /// Disable the 8-sprite-per-scanline limit; eliminates flicker but breaks games that
    /// depend on it
    pub remove_sprite_limit: bool,
    /// Replace ultrasonic triangle output with its DC average instead of aliasing
    pub silence_ultrasonic_triangle_output: bool,
    pub overscan: Overscan,
}

impl EmulatorConfigTrait for NesEmulatorConfig {}

#[derive(Debug, Error)]
pub enum NesError<RErr, AErr, SErr> {
    #[error("Error rendering frame: {0}")]
    Render(RErr),
    #[error("Error outputting audio samples: {0}")]
    Audio(AErr),
    #[error("Error persisting save file: {0}")]
    SaveWrite(SErr),
}

#[derive(Debug, Error)]
pub enum NesInitializationError {
    #[error("Error loading cartridge ROM: {0}")]
    CartridgeLoad(#[from] CartridgeError),
}

/// RGBA conversion output; rebuilt every frame, never serialized.
#[derive(Debug, Clone, FakeEncode, FakeDecode)]
struct RgbaFrameBuffer(Vec<Color>);

impl Default for RgbaFrameBuffer {
    fn default() -> Self {
        Self(vec![Color::default(); ppu::FRAME_BUFFER_LEN])
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub struct NesEmulator {
    cpu: Mos6502,
    #[partial_clone(partial)]
    bus: Bus,
    config: NesEmulatorConfig,
    timing_mode: TimingMode,
    audio_resampler: AudioResampler,
    apu_delta_scratch: Vec<AudioDelta>,
    expansion_delta_scratch: Vec<AudioDelta>,
    #[partial_clone(default)]
    rgba_frame_buffer: RgbaFrameBuffer,
    frame_count: u64,
    // Kept around to enable hard reset
    #[partial_clone(default)]
    raw_rom_bytes: Rom,
}

impl NesEmulator {
    /// Create a new emulator instance from iNES ROM bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not parse as a supported NES ROM image.
    pub fn create<S: SaveWriter>(
        rom_bytes: Vec<u8>,
        config: NesEmulatorConfig,
        save_writer: &mut S,
    ) -> Result<Self, NesInitializationError> {
        let sav_bytes = save_writer.load_bytes("sav").ok();
        let mapper = cartridge::from_ines_file(&rom_bytes, sav_bytes, config.forced_timing_mode)?;

        let timing_mode = config.forced_timing_mode.unwrap_or_else(|| {
            cartridge::INesHeader::parse(&rom_bytes)
                .map_or(TimingMode::Ntsc, |header| header.timing_mode)
        });

        let ppu = Ppu::new(timing_mode, config.remove_sprite_limit);
        let apu = Apu::new(timing_mode, config.silence_ultrasonic_triangle_output);
        let mut bus = Bus::new(mapper, ppu, apu, timing_mode);

        // Power-on: the CPU reads its reset vector through the live bus
        let cpu = Mos6502::new(CpuVariant::Nmos, &mut bus);

        Ok(Self {
            cpu,
            bus,
            config,
            timing_mode,
            audio_resampler: AudioResampler::new(timing_mode, DEFAULT_OUTPUT_FREQUENCY),
            apu_delta_scratch: Vec::with_capacity(1024),
            expansion_delta_scratch: Vec::with_capacity(64),
            rgba_frame_buffer: RgbaFrameBuffer::default(),
            frame_count: 0,
            raw_rom_bytes: Rom(rom_bytes),
        })
    }

    #[must_use]
    pub fn timing_mode(&self) -> TimingMode {
        self.timing_mode
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The CPU's current program counter; exposed for testing and debug tooling.
    #[must_use]
    pub fn cpu_pc(&self) -> u16 {
        self.cpu.pc()
    }

    /// Read a CPU address with no side effects.
    #[must_use]
    pub fn debug_peek(&self, address: u16) -> u8 {
        self.bus.peek(address)
    }

    pub fn set_cheat_codes(&mut self, codes: Vec<CheatCode>) {
        self.bus.chipset.cheats.set_codes(codes);
    }

    /// Flush battery-backed RAM regardless of the dirty bit; used on shutdown.
    pub fn persist_battery_save<S: SaveWriter>(&mut self, save_writer: &mut S) -> Result<(), S::Err> {
        if self.bus.mapper.has_battery() {
            save_writer.persist_bytes("sav", self.bus.mapper.prg_ram())?;
        }
        Ok(())
    }

    /// The raw frame buffer of (palette index, emphasis) words; exposed for testing.
    #[must_use]
    pub fn raw_frame_buffer(&self) -> &[u16] {
        self.bus.ppu.frame_buffer().as_slice()
    }

    fn render_frame<R: Renderer>(&mut self, renderer: &mut R) -> Result<(), R::Err> {
        let overscan = self.config.overscan;
        let raw = self.bus.ppu.frame_buffer();

        for (i, &word) in raw.iter().enumerate() {
            let color = (word & 0x3F) as u8;
            let emphasis = (word >> 8) as u8;
            self.rgba_frame_buffer.0[i] = apply_emphasis(graphics::nes_color_to_rgb(color), emphasis);
        }

        let full_width = u32::from(ppu::SCREEN_WIDTH);
        let width = full_width
            .saturating_sub(overscan.left.into())
            .saturating_sub(overscan.right.into());
        let height = u32::from(ppu::SCREEN_HEIGHT)
            .saturating_sub(overscan.top.into())
            .saturating_sub(overscan.bottom.into());

        if width == 0 || height == 0 {
            log::error!("Overscan cropped the entire frame: {overscan:?}");
            return renderer.render_frame(&[Color::BLACK], FrameSize { width: 1, height: 1 });
        }

        if overscan == Overscan::default() {
            return renderer
                .render_frame(&self.rgba_frame_buffer.0, FrameSize { width, height });
        }

        // Compact the cropped rows in place; rows shrink, so forward copying is safe
        let src = self.rgba_frame_buffer.0.clone();
        for (dst_row, src_row) in (overscan.top..ppu::SCREEN_HEIGHT - overscan.bottom).enumerate()
        {
            let src_start = usize::from(src_row) * full_width as usize + usize::from(overscan.left);
            let dst_start = dst_row * width as usize;
            self.rgba_frame_buffer.0[dst_start..dst_start + width as usize]
                .copy_from_slice(&src[src_start..src_start + width as usize]);
        }

        renderer.render_frame(&self.rgba_frame_buffer.0, FrameSize { width, height })
    }

    fn process_frame_audio<A: AudioOutput>(&mut self, audio_output: &mut A) -> Result<(), A::Err> {
        let frame_cycles = self.bus.frame_cycle();
        self.bus.apu.take_deltas(&mut self.apu_delta_scratch);
        self.bus.mapper.take_audio_deltas(&mut self.expansion_delta_scratch);

        self.audio_resampler.process_frame(
            &mut self.apu_delta_scratch,
            &mut self.expansion_delta_scratch,
            frame_cycles,
        );
        self.audio_resampler.output_samples(audio_output)
    }
}

fn apply_emphasis(color: Color, emphasis: u8) -> Color {
    if emphasis == 0 {
        return color;
    }

    // Emphasizing a channel attenuates the other two
    let attenuate = |channel: u8, emphasized: bool| -> u8 {
        if emphasized { channel } else { (u16::from(channel) * 3 / 4) as u8 }
    };

    Color::rgb(
        attenuate(color.r, emphasis & 0x01 != 0),
        attenuate(color.g, emphasis & 0x02 != 0),
        attenuate(color.b, emphasis & 0x04 != 0),
    )
}

impl EmulatorTrait for NesEmulator {
    type Button = NesButton;
    type Inputs = NesInputs;
    type Config = NesEmulatorConfig;
    type Err<
        RErr: Debug + Display + Send + Sync + 'static,
        AErr: Debug + Display + Send + Sync + 'static,
        SErr: Debug + Display + Send + Sync + 'static,
    > = NesError<RErr, AErr, SErr>;

    /// Run one CPU instruction and everything that hangs off it.
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
        self.bus.chipset.input.update_joypads(inputs);

        self.cpu.execute_instruction(&mut self.bus);

        if self.bus.ppu.get_and_clear_frame_complete() {
            self.frame_count += 1;

            self.process_frame_audio(audio_output).map_err(NesError::Audio)?;
            self.bus.start_new_frame();

            self.render_frame(renderer).map_err(NesError::Render)?;

            if self.bus.mapper.get_and_clear_ram_dirty_bit() && self.bus.mapper.has_battery() {
                save_writer
                    .persist_bytes("sav", self.bus.mapper.prg_ram())
                    .map_err(NesError::SaveWrite)?;
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
        records.push_serialized("nes.cpu", &self.cpu);
        records.push_serialized("nes.ppu", &self.bus.ppu);
        records.push_serialized("nes.apu", &self.bus.apu);
        records.push_serialized("nes.mapper", &self.bus.mapper);
        records.push_serialized("nes.chipset", &self.bus.chipset);
        records.push_serialized("nes.audio", &self.audio_resampler);
        records.push_serialized("nes.frame_count", &self.frame_count);
    }

    fn load_state_records(&mut self, records: &StateRecords) -> Result<(), SaveStateError> {
        let cpu: Mos6502 = records.decode("nes.cpu")?;
        let ppu: Ppu = records.decode("nes.ppu")?;
        let apu: Apu = records.decode("nes.apu")?;
        let mut mapper: crate::cartridge::Mapper = records.decode("nes.mapper")?;
        let chipset: crate::bus::Chipset = records.decode("nes.chipset")?;
        let audio_resampler: AudioResampler = records.decode("nes.audio")?;
        let frame_count: u64 = records.decode("nes.frame_count")?;

        // ROM blobs are not serialized; adopt them from the running console
        mapper.move_rom_from(&mut self.bus.mapper);

        self.cpu = cpu;
        self.bus.ppu = ppu;
        self.bus.apu = apu;
        self.bus.mapper = mapper;
        self.bus.chipset = chipset;
        self.audio_resampler = audio_resampler;
        self.frame_count = frame_count;
        self.bus.rebuild_cpu_pages();

        Ok(())
    }

    fn reload_config(&mut self, config: &Self::Config) {
        self.config = *config;
        self.bus.ppu.set_remove_sprite_limit(config.remove_sprite_limit);
        self.bus
            .apu
            .set_silence_ultrasonic_triangle(config.silence_ultrasonic_triangle_output);
    }

    fn take_rom_from(&mut self, other: &mut Self) {
        self.bus.mapper.move_rom_from(&mut other.bus.mapper);
        self.raw_rom_bytes = mem::take(&mut other.raw_rom_bytes);
    }

    fn soft_reset(&mut self) {
        self.cpu.reset(&mut self.bus);
        self.bus.apu.reset();
    }

    fn hard_reset<S: SaveWriter>(&mut self, save_writer: &mut S) {
        let rom_bytes = mem::take(&mut self.raw_rom_bytes);

        *self = Self::create(rom_bytes.0, self.config, save_writer)
            .expect("creation during hard reset should never fail");
    }

    fn target_fps(&self) -> f64 {
        match self.timing_mode() {
            TimingMode::Ntsc => 60.0988,
            TimingMode::Pal => 50.007,
        }
    }

    fn update_audio_output_frequency(&mut self, output_frequency: u64) {
        self.audio_resampler.update_output_frequency(output_frequency);
    }
}

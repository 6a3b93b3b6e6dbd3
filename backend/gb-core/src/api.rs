//! The public console interface for the Game Boy core.

use crate::audio::AudioResampler;
use crate::bus::Bus;
use crate::cartridge::{self, CartridgeError, CartridgeHeader, Rom};
use crate::input::{GbButton, GbInputs};
use crate::ppu;
use crate::sm83::Sm83;
use crate::HardwareMode;
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct GameBoyEmulatorConfig {
    /// Force DMG or CGB hardware instead of following the cartridge's CGB flag
    pub forced_hardware_mode: Option<HardwareMode>,
}

impl EmulatorConfigTrait for GameBoyEmulatorConfig {}

#[derive(Debug, Error)]
pub enum GbError<RErr, AErr, SErr> {
    #[error("Error rendering frame: {0}")]
    Render(RErr),
    #[error("Error outputting audio samples: {0}")]
    Audio(AErr),
    #[error("Error persisting save file: {0}")]
    SaveWrite(SErr),
}

#[derive(Debug, Error)]
pub enum GbInitializationError {
    #[error("Error loading cartridge ROM: {0}")]
    CartridgeLoad(#[from] CartridgeError),
}

#[derive(Debug, Clone, FakeEncode, FakeDecode)]
struct RgbaFrameBuffer(Vec<Color>);

impl Default for RgbaFrameBuffer {
    fn default() -> Self {
        Self(vec![Color::default(); ppu::FRAME_BUFFER_LEN])
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub struct GameBoyEmulator {
    cpu: Sm83,
    #[partial_clone(partial)]
    bus: Bus,
    config: GameBoyEmulatorConfig,
    hardware_mode: HardwareMode,
    audio_resampler: AudioResampler,
    #[partial_clone(default)]
    rgba_frame_buffer: RgbaFrameBuffer,
    frame_count: u64,
    #[partial_clone(default)]
    raw_rom_bytes: Rom,
}

impl GameBoyEmulator {
    /// Create a new emulator instance from ROM bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid or the cartridge type unsupported.
    pub fn create<S: SaveWriter>(
        rom_bytes: Vec<u8>,
        config: GameBoyEmulatorConfig,
        save_writer: &mut S,
    ) -> Result<Self, GbInitializationError> {
        let header = CartridgeHeader::parse(&rom_bytes)?;

        let hardware_mode = config.forced_hardware_mode.unwrap_or(if header.cgb_support {
            HardwareMode::Cgb
        } else {
            HardwareMode::Dmg
        });

        let sav_bytes = save_writer.load_bytes("sav").ok();
        let mapper = cartridge::create_mapper(rom_bytes.clone(), &header, sav_bytes)?;

        let bus = Bus::new(mapper, hardware_mode);
        let cpu = Sm83::new(hardware_mode == HardwareMode::Cgb);

        Ok(Self {
            cpu,
            bus,
            config,
            hardware_mode,
            audio_resampler: AudioResampler::new(DEFAULT_OUTPUT_FREQUENCY),
            rgba_frame_buffer: RgbaFrameBuffer::default(),
            frame_count: 0,
            raw_rom_bytes: Rom(rom_bytes),
        })
    }

    #[must_use]
    pub fn hardware_mode(&self) -> HardwareMode {
        self.hardware_mode
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
        if self.bus.mapper.has_battery() {
            save_writer.persist_bytes("sav", self.bus.mapper.sram())?;
        }
        Ok(())
    }

    fn render_frame<R: Renderer>(&mut self, renderer: &mut R) -> Result<(), R::Err> {
        let raw = self.bus.ppu.frame_buffer();
        for (i, &rgb555) in raw.iter().enumerate() {
            self.rgba_frame_buffer.0[i] = rgb555_to_color(rgb555);
        }

        renderer.render_frame(
            &self.rgba_frame_buffer.0,
            FrameSize {
                width: ppu::SCREEN_WIDTH as u32,
                height: ppu::SCREEN_HEIGHT as u32,
            },
        )
    }
}

fn rgb555_to_color(rgb555: u16) -> Color {
    let expand = |channel: u16| -> u8 {
        let channel = (channel & 0x1F) as u8;
        (channel << 3) | (channel >> 2)
    };

    Color::rgb(expand(rgb555), expand(rgb555 >> 5), expand(rgb555 >> 10))
}

impl EmulatorTrait for GameBoyEmulator {
    type Button = GbButton;
    type Inputs = GbInputs;
    type Config = GameBoyEmulatorConfig;
    type Err<
        RErr: Debug + Display + Send + Sync + 'static,
        AErr: Debug + Display + Send + Sync + 'static,
        SErr: Debug + Display + Send + Sync + 'static,
    > = GbError<RErr, AErr, SErr>;

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
        {
            let Bus { joypad, interrupts, .. } = &mut self.bus;
            joypad.update(inputs, interrupts);
        }

        self.cpu.execute_instruction(&mut self.bus);

        if self.bus.ppu.get_and_clear_frame_complete() {
            self.frame_count += 1;

            let frame_cycles = self.bus.frame_cycle();
            self.audio_resampler.process_frame(&mut self.bus.apu, frame_cycles);
            self.bus.start_new_frame();
            self.audio_resampler.output_samples(audio_output).map_err(GbError::Audio)?;

            self.render_frame(renderer).map_err(GbError::Render)?;

            if self.bus.mapper.get_and_clear_ram_dirty_bit() && self.bus.mapper.has_battery() {
                save_writer
                    .persist_bytes("sav", self.bus.mapper.sram())
                    .map_err(GbError::SaveWrite)?;
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
        records.push_serialized("gb.cpu", &self.cpu);
        records.push_serialized("gb.bus", &self.bus);
        records.push_serialized("gb.audio", &self.audio_resampler);
        records.push_serialized("gb.frame_count", &self.frame_count);
    }

    fn load_state_records(&mut self, records: &StateRecords) -> Result<(), SaveStateError> {
        let cpu: Sm83 = records.decode("gb.cpu")?;
        let mut bus: Bus = records.decode("gb.bus")?;
        let audio_resampler: AudioResampler = records.decode("gb.audio")?;
        let frame_count: u64 = records.decode("gb.frame_count")?;

        bus.mapper.move_rom_from(&mut self.bus.mapper);

        self.cpu = cpu;
        self.bus = bus;
        self.audio_resampler = audio_resampler;
        self.frame_count = frame_count;

        Ok(())
    }

    fn reload_config(&mut self, config: &Self::Config) {
        self.config = *config;
    }

    fn take_rom_from(&mut self, other: &mut Self) {
        self.bus.mapper.move_rom_from(&mut other.bus.mapper);
        self.raw_rom_bytes = mem::take(&mut other.raw_rom_bytes);
    }

    fn soft_reset(&mut self) {
        // The Game Boy has no reset button; a soft reset is a power cycle without touching
        // battery RAM
        let sram = self.bus.mapper.sram().to_vec();
        let rom_bytes = mem::take(&mut self.raw_rom_bytes);

        if let Ok(header) = CartridgeHeader::parse(&rom_bytes) {
            if let Ok(mapper) = cartridge::create_mapper(rom_bytes.0.clone(), &header, Some(sram))
            {
                self.bus = Bus::new(mapper, self.hardware_mode);
                self.cpu = Sm83::new(self.hardware_mode == HardwareMode::Cgb);
            }
        }
        self.raw_rom_bytes = rom_bytes;
        self.frame_count = 0;
    }

    fn hard_reset<S: SaveWriter>(&mut self, save_writer: &mut S) {
        let rom_bytes = mem::take(&mut self.raw_rom_bytes);

        *self = Self::create(rom_bytes.0, self.config, save_writer)
            .expect("creation during hard reset should never fail");
    }

    fn target_fps(&self) -> f64 {
        // 4194304 / 70224
        59.7275
    }

    fn update_audio_output_frequency(&mut self, output_frequency: u64) {
        self.audio_resampler.update_output_frequency(output_frequency);
    }
}

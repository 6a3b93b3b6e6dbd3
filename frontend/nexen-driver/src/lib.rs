//! The host-facing driver: ROM loading with system detection, the frame loop, save states,
//! rewind, movie recording/playback, cheats, and notifications.
//!
//! Video and audio device management stay on the host side of the boundary; the driver hands
//! frames to a `Renderer` and samples to an `AudioOutput` and never blocks on either.

pub mod cheats;
pub mod movie;
pub mod notification;
pub mod rewind;
pub mod romdetect;
pub mod save;

#[cfg(test)]
mod tests;

pub use notification::{NotificationEvent, NotificationManager};
pub use rewind::{CapturedFrame, RewindManager};
pub use romdetect::System;

use crate::movie::{Movie, MovieError};
use crate::rewind::DEFAULT_MEMORY_CEILING;
use crate::save::{FsSaveWriter, SaveWriteError};
use crc::{CRC_32_ISO_HDLC, Crc};
use gb_core::{GameBoyEmulator, GameBoyEmulatorConfig};
use nes_core::{NesEmulator, NesEmulatorConfig};
use nexen_common::cheats::CheatCode;
use nexen_common::frontend::{AudioOutput, EmulatorTrait, Renderer, SaveWriter, TickEffect};
use nexen_common::input::PortInputs;
use nexen_common::savestate::{SaveStateError, StateRecords};
use smsgg_core::{SmsGgEmulator, SmsGgEmulatorConfig, SmsGgHardware};
use std::fmt::{Debug, Display};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const SAVE_STATE_VERSION: &str = "nexen-state-1";

#[derive(Debug, Error)]
pub enum NexenError {
    #[error("error reading ROM file '{path}': {source}")]
    RomRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not identify the system for ROM '{path}'")]
    UnidentifiedRom { path: String },
    #[error("{system} ROMs are recognized but this build has no {system} console core")]
    UnsupportedSystem { system: System },
    #[error(transparent)]
    NesLoad(#[from] nes_core::NesInitializationError),
    #[error(transparent)]
    GbLoad(#[from] gb_core::GbInitializationError),
    #[error(transparent)]
    SmsGgLoad(#[from] smsgg_core::SmsGgInitializationError),
    #[error(transparent)]
    SaveState(#[from] SaveStateError),
    #[error("error accessing save state file: {0}")]
    SaveStateIo(std::io::Error),
    #[error("save state was created for a different system or ROM")]
    SaveStateMismatch,
    #[error(transparent)]
    SaveWrite(#[from] SaveWriteError),
    #[error(transparent)]
    Movie(#[from] MovieError),
    #[error(transparent)]
    Cheats(#[from] cheats::CheatFileError),
    #[error("emulation error: {0}")]
    Emulation(String),
}

/// What `run_frame` hands back to the host alongside the rendered pixels.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub frame_number: u64,
    /// The input snapshot that was in effect for the frame, as per-port bits.
    pub inputs: Vec<u16>,
}

struct Loaded<Emulator: EmulatorTrait> {
    emulator: Emulator,
    inputs: Emulator::Inputs,
    rewind: RewindManager<Emulator>,
}

impl<Emulator: EmulatorTrait> Loaded<Emulator> {
    fn new(emulator: Emulator) -> Self {
        Self {
            emulator,
            inputs: Emulator::Inputs::default(),
            rewind: RewindManager::new(DEFAULT_MEMORY_CEILING),
        }
    }

    fn run_frame<R, A>(
        &mut self,
        renderer: &mut R,
        audio_output: &mut A,
        save_writer: &mut FsSaveWriter,
        record_rewind: bool,
    ) -> Result<Vec<u16>, String>
    where
        R: Renderer,
        R::Err: Debug + Display + Send + Sync + 'static,
        A: AudioOutput,
        A::Err: Debug + Display + Send + Sync + 'static,
    {
        loop {
            let effect = self
                .emulator
                .tick(renderer, audio_output, &self.inputs, save_writer)
                .map_err(|err| err.to_string())?;
            if effect == TickEffect::FrameRendered {
                break;
            }
        }

        if record_rewind {
            self.rewind.record_frame(&self.emulator, &self.inputs);
        }

        Ok((0..Emulator::Inputs::PORTS).map(|port| self.inputs.port_bits(port)).collect())
    }

    fn set_port_bits(&mut self, port: usize, bits: u16) {
        self.inputs.set_port_bits(port, bits);
    }

    fn state_records(&self) -> StateRecords {
        let mut records = StateRecords::new();
        self.emulator.write_state_records(&mut records);
        records
    }
}

enum Console {
    Nes(Loaded<NesEmulator>),
    GameBoy(Loaded<GameBoyEmulator>),
    SmsGg(Loaded<SmsGgEmulator>),
}

macro_rules! for_each_console {
    ($console:expr, $loaded:ident => $body:expr) => {
        match $console {
            Console::Nes($loaded) => $body,
            Console::GameBoy($loaded) => $body,
            Console::SmsGg($loaded) => $body,
        }
    };
}

pub struct NexenEmulator {
    console: Console,
    system: System,
    rom_path: PathBuf,
    rom_crc32: u32,
    save_writer: FsSaveWriter,
    frame_number: u64,
    rewinding: bool,
    recording_movie: Option<Movie>,
    playing_movie: Option<(Movie, usize)>,
    pub notifications: NotificationManager,
}

impl NexenEmulator {
    /// Open a ROM image, construct the matching console, and power it on.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the system cannot be identified, this
    /// build has no core for the system, or the ROM fails to parse.
    pub fn load_rom(rom_path: &Path) -> Result<Self, NexenError> {
        let rom_bytes = std::fs::read(rom_path).map_err(|source| NexenError::RomRead {
            path: rom_path.display().to_string(),
            source,
        })?;

        let system = romdetect::detect_system(rom_path, &rom_bytes).ok_or_else(|| {
            NexenError::UnidentifiedRom { path: rom_path.display().to_string() }
        })?;
        if !system.has_core() {
            return Err(NexenError::UnsupportedSystem { system });
        }

        let rom_crc32 = CRC32.checksum(&rom_bytes);
        let mut save_writer = FsSaveWriter::new(rom_path.to_path_buf());

        let console = match system {
            System::Nes => Console::Nes(Loaded::new(NesEmulator::create(
                rom_bytes,
                NesEmulatorConfig::default(),
                &mut save_writer,
            )?)),
            System::GameBoy | System::GameBoyColor => Console::GameBoy(Loaded::new(
                GameBoyEmulator::create(
                    rom_bytes,
                    GameBoyEmulatorConfig::default(),
                    &mut save_writer,
                )?,
            )),
            System::MasterSystem | System::GameGear => {
                let config = SmsGgEmulatorConfig {
                    hardware: if system == System::GameGear {
                        SmsGgHardware::GameGear
                    } else {
                        SmsGgHardware::MasterSystem
                    },
                    strip_smd_header: true,
                };
                Console::SmsGg(Loaded::new(SmsGgEmulator::create(
                    rom_bytes,
                    config,
                    &mut save_writer,
                )?))
            }
            _ => unreachable!("has_core() checked above"),
        };

        let notifications = NotificationManager::new();
        notifications.notify(&NotificationEvent::RomLoaded {
            system: system.to_string(),
            name: rom_path.file_stem().map_or_else(String::new, |stem| {
                stem.to_string_lossy().into_owned()
            }),
        });

        log::info!("Loaded {} ROM '{}' (CRC32 {rom_crc32:08X})", system, rom_path.display());

        Ok(Self {
            console,
            system,
            rom_path: rom_path.to_path_buf(),
            rom_crc32,
            save_writer,
            frame_number: 0,
            rewinding: false,
            recording_movie: None,
            playing_movie: None,
            notifications,
        })
    }

    #[must_use]
    pub fn system(&self) -> System {
        self.system
    }

    #[must_use]
    pub fn rom_crc32(&self) -> u32 {
        self.rom_crc32
    }

    #[must_use]
    pub fn rom_path(&self) -> &Path {
        &self.rom_path
    }

    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Whether the host should skip frame pacing (asserted during rewind reconstruction).
    #[must_use]
    pub fn max_speed(&self) -> bool {
        self.rewinding
    }

    #[must_use]
    pub fn controller_ports(&self) -> usize {
        match &self.console {
            Console::Nes(..) => <NesEmulator as EmulatorTrait>::Inputs::PORTS,
            Console::GameBoy(..) => <GameBoyEmulator as EmulatorTrait>::Inputs::PORTS,
            Console::SmsGg(..) => <SmsGgEmulator as EmulatorTrait>::Inputs::PORTS,
        }
    }

    /// Push controller state for the next frame.
    pub fn set_controller_state(&mut self, port: usize, bits: u16) {
        for_each_console!(&mut self.console, loaded => loaded.set_port_bits(port, bits));
    }

    /// Advance one frame; the pixels go to `renderer` and the samples to `audio_output`.
    ///
    /// # Errors
    ///
    /// Propagates renderer/audio/save failures as strings (their concrete error types vary by
    /// console).
    pub fn run_frame<R, A>(
        &mut self,
        renderer: &mut R,
        audio_output: &mut A,
    ) -> Result<FrameOutcome, String>
    where
        R: Renderer,
        R::Err: Debug + Display + Send + Sync + 'static,
        A: AudioOutput,
        A::Err: Debug + Display + Send + Sync + 'static,
    {
        // Movie playback overrides host inputs
        if let Some((movie, position)) = &mut self.playing_movie {
            if let Some(frame_inputs) = movie.inputs.get(*position) {
                let frame_inputs = frame_inputs.clone();
                *position += 1;
                for (port, &bits) in frame_inputs.iter().enumerate() {
                    for_each_console!(&mut self.console, loaded => loaded.set_port_bits(port, bits));
                }
            } else {
                self.playing_movie = None;
                self.notifications.notify(&NotificationEvent::MovieEnded);
            }
        }

        let save_writer = &mut self.save_writer;
        let inputs = for_each_console!(&mut self.console, loaded => {
            loaded.run_frame(renderer, audio_output, save_writer, true)?
        });

        if let Some(movie) = &mut self.recording_movie {
            movie.record_frame(inputs.clone());
        }

        self.frame_number += 1;
        Ok(FrameOutcome { frame_number: self.frame_number, inputs })
    }

    /// Reset the console. A soft reset models the console's reset button; a hard reset is a
    /// power cycle.
    pub fn reset(&mut self, soft: bool) {
        if soft {
            for_each_console!(&mut self.console, loaded => loaded.emulator.soft_reset());
        } else {
            let save_writer = &mut self.save_writer;
            for_each_console!(
                &mut self.console,
                loaded => loaded.emulator.hard_reset(save_writer)
            );
        }
    }

    /// Save battery-backed RAM and release resources. Also invoked by `Drop` so saves survive
    /// unexpected termination paths that still unwind.
    pub fn stop(&mut self) {
        let save_writer = &mut self.save_writer;
        let flush_result = for_each_console!(&mut self.console, loaded => {
            loaded.emulator.persist_battery_save(save_writer).map_err(|err| err.to_string())
        });
        if let Err(err) = flush_result {
            log::error!("Failed to flush battery save on shutdown: {err}");
        }

        log::info!("Console stopped after {} frames", self.frame_number);
    }

    // ===== Save states =====

    /// Serialize the console state to bytes in the keyed-record container format.
    #[must_use]
    pub fn save_state_bytes(&self) -> Vec<u8> {
        let mut records = for_each_console!(&self.console, loaded => loaded.state_records());
        records.push_str("meta.system", self.system.to_str());
        records.push_serialized("meta.rom_crc32", &self.rom_crc32);
        records.to_bytes(SAVE_STATE_VERSION)
    }

    /// Restore console state from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed, were created for a different ROM, or fail
    /// to decode. The running console is unchanged on error.
    pub fn load_state_bytes(&mut self, bytes: &[u8]) -> Result<(), NexenError> {
        let records = StateRecords::from_bytes(bytes, SAVE_STATE_VERSION)?;

        if records.str("meta.system")? != self.system.to_str()
            || records.decode::<u32>("meta.rom_crc32")? != self.rom_crc32
        {
            return Err(NexenError::SaveStateMismatch);
        }

        for_each_console!(&mut self.console, loaded => {
            loaded.emulator.load_state_records(&records)?;
            loaded.rewind.mark_end_of_segment(&loaded.emulator);
        });

        Ok(())
    }

    /// Write a save state file.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn save_state(&mut self, path: &Path) -> Result<(), NexenError> {
        let bytes = self.save_state_bytes();
        std::fs::write(path, bytes).map_err(NexenError::SaveStateIo)?;
        self.notifications.notify(&NotificationEvent::SaveStateCreated);
        Ok(())
    }

    /// Load a save state file.
    ///
    /// # Errors
    ///
    /// Propagates filesystem and format errors; the console is unchanged on error.
    pub fn load_state(&mut self, path: &Path) -> Result<(), NexenError> {
        let bytes = std::fs::read(path).map_err(NexenError::SaveStateIo)?;
        match self.load_state_bytes(&bytes) {
            Ok(()) => {
                self.notifications.notify(&NotificationEvent::StateLoaded);
                Ok(())
            }
            Err(err) => {
                self.notifications.notify(&NotificationEvent::StateLoadFailed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    // ===== Rewind =====

    pub fn start_rewind(&mut self) {
        if !self.rewinding {
            self.rewinding = true;
            self.notifications.notify(&NotificationEvent::RewindStarted);
        }
    }

    pub fn stop_rewind(&mut self) {
        if self.rewinding {
            self.rewinding = false;
            self.notifications.notify(&NotificationEvent::RewindStopped);
        }
    }

    /// Rewind one block (~30 frames); the returned frames are in reverse display order.
    /// Reversed audio is available from the rewind audio ring.
    pub fn rewind_block(&mut self) -> Option<Vec<CapturedFrame>> {
        let frames = for_each_console!(&mut self.console, loaded => {
            loaded.rewind.rewind_block(&mut loaded.emulator)
        });
        if let Some(frames) = &frames {
            self.frame_number =
                self.frame_number.saturating_sub(frames.len() as u64);
        }
        frames
    }

    /// Single-frame rewind for step-back debugging.
    pub fn step_back(&mut self) -> Option<CapturedFrame> {
        let frame = for_each_console!(&mut self.console, loaded => {
            loaded.rewind.step_back(&mut loaded.emulator)
        });
        if frame.is_some() {
            self.frame_number = self.frame_number.saturating_sub(1);
        }
        frame
    }

    pub fn pop_rewind_audio(&mut self) -> Option<(f64, f64)> {
        for_each_console!(&mut self.console, loaded => loaded.rewind.audio_ring.pop_reversed())
    }

    #[must_use]
    pub fn rewind_memory_used(&self) -> usize {
        for_each_console!(&self.console, loaded => loaded.rewind.total_bytes())
    }

    // ===== Movies =====

    pub fn start_movie_recording(&mut self) {
        let mut movie = Movie::new(
            self.system.to_str().into(),
            self.rom_crc32,
            self.controller_ports() as u8,
        );
        movie.initial_state = Some(self.save_state_bytes());
        self.recording_movie = Some(movie);
        self.notifications.notify(&NotificationEvent::MovieRecordingStarted);
    }

    /// Finish recording and write the movie file.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors. No-op if no recording is active.
    pub fn stop_movie_recording(&mut self, path: &Path) -> Result<(), NexenError> {
        if let Some(movie) = self.recording_movie.take() {
            movie.save(path)?;
            log::info!("Recorded {} movie frames to '{}'", movie.frame_count(), path.display());
        }
        Ok(())
    }

    /// Begin movie playback, restoring the movie's initial state if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or was recorded for a different ROM.
    pub fn play_movie(&mut self, path: &Path) -> Result<(), NexenError> {
        let movie = Movie::load(path, self.rom_crc32)?;
        if let Some(initial_state) = &movie.initial_state {
            self.load_state_bytes(initial_state)?;
        } else {
            self.reset(false);
        }
        self.playing_movie = Some((movie, 0));
        Ok(())
    }

    #[must_use]
    pub fn movie_playing(&self) -> bool {
        self.playing_movie.is_some()
    }

    // ===== Cheats =====

    /// Load a per-game cheat JSON file and apply it.
    ///
    /// # Errors
    ///
    /// Propagates file and parse errors.
    pub fn load_cheats(&mut self, path: &Path) -> Result<(), NexenError> {
        let codes = cheats::load_cheat_file(path)?;
        let count = codes.len();
        self.set_cheat_codes(codes);
        self.notifications.notify(&NotificationEvent::CheatsApplied { count });
        Ok(())
    }

    pub fn set_cheat_codes(&mut self, codes: Vec<CheatCode>) {
        match &mut self.console {
            Console::Nes(loaded) => loaded.emulator.set_cheat_codes(codes),
            Console::GameBoy(loaded) => loaded.emulator.set_cheat_codes(codes),
            Console::SmsGg(loaded) => loaded.emulator.set_cheat_codes(codes),
        }
    }

    pub fn register_notification_listener(&mut self, listener: &Rc<dyn Fn(&NotificationEvent)>) {
        self.notifications.register(listener);
    }
}

impl Drop for NexenEmulator {
    fn drop(&mut self) {
        self.stop();
    }
}

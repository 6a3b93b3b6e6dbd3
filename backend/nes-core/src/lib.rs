//! NES / Famicom emulation core.
//!
//! The console is the 2A03 CPU (a 6502 with the APU on-die), the 2C02 PPU, 2KB of work RAM, and
//! whatever hardware the cartridge brings along. The CPU core is instruction-stepped; every CPU
//! bus access advances the master clock and drives the PPU, APU, and mapper forward to the new
//! target, so register reads always observe component state for the exact cycle of the access.

pub mod api;
mod apu;
mod audio;
mod bus;
mod cartridge;
mod graphics;
mod input;
mod ppu;

pub use api::{NesEmulator, NesEmulatorConfig, NesError, NesInitializationError};
pub use cartridge::CartridgeError;
pub use input::{NesButton, NesInputs, NesJoypadState};

use bincode::{Decode, Encode};
use nexen_common::frontend::TimingMode;

// NTSC master clock: 21.477272 MHz; CPU divider 12, PPU divider 4
// PAL master clock: 26.601712 MHz; CPU divider 16, PPU divider 5
pub(crate) trait TimingModeExt: Copy {
    fn cpu_divider(self) -> u64;

    fn ppu_divider(self) -> u64;

    fn cpu_frequency(self) -> f64;

    fn total_scanlines(self) -> u16;
}

impl TimingModeExt for TimingMode {
    fn cpu_divider(self) -> u64 {
        match self {
            Self::Ntsc => 12,
            Self::Pal => 16,
        }
    }

    fn ppu_divider(self) -> u64 {
        match self {
            Self::Ntsc => 4,
            Self::Pal => 5,
        }
    }

    fn cpu_frequency(self) -> f64 {
        match self {
            Self::Ntsc => 21_477_272.0 / 12.0,
            Self::Pal => 26_601_712.0 / 16.0,
        }
    }

    fn total_scanlines(self) -> u16 {
        match self {
            Self::Ntsc => 262,
            Self::Pal => 312,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct Overscan {
    pub top: u16,
    pub bottom: u16,
    pub left: u16,
    pub right: u16,
}

//! Game Boy / Game Boy Color emulation core.
//!
//! The SM83 CPU is instruction-stepped; every memory access costs one M-cycle and advances the
//! PPU, APU, timer, and DMA engines in lockstep through the bus. CGB support covers the color
//! palettes, VRAM/WRAM banking, HDMA, and the double-speed switch.

pub mod api;
mod apu;
mod audio;
mod bus;
mod cartridge;
mod dma;
mod input;
mod interrupts;
mod memory;
mod ppu;
mod sm83;
mod timer;

pub use api::{GameBoyEmulator, GameBoyEmulatorConfig, GbError, GbInitializationError};
pub use cartridge::{CartridgeError, CartridgeHeader};
pub use input::{GbButton, GbInputs, GbJoypadState};

use bincode::{Decode, Encode};
use nexen_proc_macros::{EnumAll, EnumDisplay, EnumFromStr};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode, EnumDisplay, EnumFromStr, EnumAll,
)]
pub enum HardwareMode {
    /// Original monochrome Game Boy
    Dmg,
    /// Game Boy Color
    #[default]
    Cgb,
}

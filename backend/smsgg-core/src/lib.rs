//! Sega Master System / Game Gear emulation core.
//!
//! A Z80 drives the VDP (Mode 4 renderer with line and frame interrupts) and the SN76489 PSG
//! through the I/O port space. The Game Gear variant crops the VDP output to its 160x144 LCD
//! window and adds stereo PSG panning.

pub mod api;
mod audio;
mod bus;
mod input;
mod memory;
mod psg;
mod vdp;

pub use api::{SmsGgEmulator, SmsGgEmulatorConfig, SmsGgError, SmsGgInitializationError};
pub use input::{SmsGgButton, SmsGgInputs, SmsGgJoypadState};

use bincode::{Decode, Encode};
use nexen_proc_macros::{EnumAll, EnumDisplay, EnumFromStr};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode, EnumDisplay, EnumFromStr, EnumAll,
)]
pub enum SmsGgHardware {
    #[default]
    MasterSystem,
    GameGear,
}

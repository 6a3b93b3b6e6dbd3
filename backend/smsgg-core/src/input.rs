//! Controller ports behind the $DC/$DD I/O registers, plus the SMS pause button (which is
//! wired to NMI) and the Game Gear start button.

use bincode::{Decode, Encode};
use nexen_common::input::PortInputs;
use nexen_common::num::GetBit;
use nexen_proc_macros::{EnumAll, EnumDisplay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay, EnumAll)]
pub enum SmsGgButton {
    Up,
    Down,
    Left,
    Right,
    Button1,
    Button2,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct SmsGgJoypadState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub button_1: bool,
    pub button_2: bool,
}

impl SmsGgJoypadState {
    pub fn set_button(&mut self, button: SmsGgButton, pressed: bool) {
        match button {
            SmsGgButton::Up => self.up = pressed,
            SmsGgButton::Down => self.down = pressed,
            SmsGgButton::Left => self.left = pressed,
            SmsGgButton::Right => self.right = pressed,
            SmsGgButton::Button1 => self.button_1 = pressed,
            SmsGgButton::Button2 => self.button_2 = pressed,
            SmsGgButton::Pause => {}
        }
    }

    #[must_use]
    pub fn to_bits(self) -> u16 {
        u16::from(self.up)
            | (u16::from(self.down) << 1)
            | (u16::from(self.left) << 2)
            | (u16::from(self.right) << 3)
            | (u16::from(self.button_1) << 4)
            | (u16::from(self.button_2) << 5)
    }

    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            up: bits.bit(0),
            down: bits.bit(1),
            left: bits.bit(2),
            right: bits.bit(3),
            button_1: bits.bit(4),
            button_2: bits.bit(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct SmsGgInputs {
    pub p1: SmsGgJoypadState,
    pub p2: SmsGgJoypadState,
    pub pause: bool,
}

impl PortInputs for SmsGgInputs {
    const PORTS: usize = 2;

    fn set_port_bits(&mut self, port: usize, bits: u16) {
        match port {
            0 => {
                self.p1 = SmsGgJoypadState::from_bits(bits);
                self.pause = bits.bit(6);
            }
            1 => self.p2 = SmsGgJoypadState::from_bits(bits),
            _ => {}
        }
    }

    fn port_bits(&self, port: usize) -> u16 {
        match port {
            0 => self.p1.to_bits() | (u16::from(self.pause) << 6),
            1 => self.p2.to_bits(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub(crate) struct InputState {
    p1: SmsGgJoypadState,
    p2: SmsGgJoypadState,
    pause: bool,
    last_pause: bool,
}

impl InputState {
    pub(crate) fn update(&mut self, inputs: &SmsGgInputs) {
        self.p1 = inputs.p1;
        self.p2 = inputs.p2;
        self.last_pause = self.pause;
        self.pause = inputs.pause;
    }

    /// Pause is edge-triggered into the Z80's NMI line.
    pub(crate) fn pause_pressed(&self) -> bool {
        self.pause && !self.last_pause
    }

    /// Port $DC: P1 all bits plus P2 up/down, active low.
    pub(crate) fn read_port_dc(&self) -> u8 {
        !(u8::from(self.p1.up)
            | (u8::from(self.p1.down) << 1)
            | (u8::from(self.p1.left) << 2)
            | (u8::from(self.p1.right) << 3)
            | (u8::from(self.p1.button_1) << 4)
            | (u8::from(self.p1.button_2) << 5)
            | (u8::from(self.p2.up) << 6)
            | (u8::from(self.p2.down) << 7))
    }

    /// Port $DD: the rest of P2 plus the (unimplemented) reset/light gun lines.
    pub(crate) fn read_port_dd(&self) -> u8 {
        !(u8::from(self.p2.left)
            | (u8::from(self.p2.right) << 1)
            | (u8::from(self.p2.button_1) << 2)
            | (u8::from(self.p2.button_2) << 3))
    }

    /// Game Gear port $00: the start button.
    pub(crate) fn read_gg_start(&self) -> u8 {
        0x7F | (u8::from(!self.pause) << 7)
    }
}

//! Controller port emulation: two standard joypads behind the $4016/$4017 strobe/shift
//! interface.

use bincode::{Decode, Encode};
use nexen_common::input::PortInputs;
use nexen_common::num::GetBit;
use nexen_proc_macros::{EnumAll, EnumDisplay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay, EnumAll)]
pub enum NesButton {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
    Start,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct NesJoypadState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub a: bool,
    pub b: bool,
    pub start: bool,
    pub select: bool,
}

impl NesJoypadState {
    pub fn set_button(&mut self, button: NesButton, pressed: bool) {
        match button {
            NesButton::Up => self.up = pressed,
            NesButton::Down => self.down = pressed,
            NesButton::Left => self.left = pressed,
            NesButton::Right => self.right = pressed,
            NesButton::A => self.a = pressed,
            NesButton::B => self.b = pressed,
            NesButton::Start => self.start = pressed,
            NesButton::Select => self.select = pressed,
        }
    }

    /// Pack into the hardware shift order: A, B, Select, Start, Up, Down, Left, Right.
    #[must_use]
    pub fn to_bits(self) -> u16 {
        u16::from(self.a)
            | (u16::from(self.b) << 1)
            | (u16::from(self.select) << 2)
            | (u16::from(self.start) << 3)
            | (u16::from(self.up) << 4)
            | (u16::from(self.down) << 5)
            | (u16::from(self.left) << 6)
            | (u16::from(self.right) << 7)
    }

    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            a: bits.bit(0),
            b: bits.bit(1),
            select: bits.bit(2),
            start: bits.bit(3),
            up: bits.bit(4),
            down: bits.bit(5),
            left: bits.bit(6),
            right: bits.bit(7),
        }
    }

    /// Real D-pads cannot press opposing directions simultaneously, and some games glitch badly
    /// if they see it.
    #[must_use]
    pub fn sanitize_opposing_directions(self) -> Self {
        let mut sanitized = self;
        if self.up && self.down {
            sanitized.up = false;
            sanitized.down = false;
        }
        if self.left && self.right {
            sanitized.left = false;
            sanitized.right = false;
        }
        sanitized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct NesInputs {
    pub p1: NesJoypadState,
    pub p2: NesJoypadState,
}

impl PortInputs for NesInputs {
    const PORTS: usize = 2;

    fn set_port_bits(&mut self, port: usize, bits: u16) {
        match port {
            0 => self.p1 = NesJoypadState::from_bits(bits),
            1 => self.p2 = NesJoypadState::from_bits(bits),
            _ => {}
        }
    }

    fn port_bits(&self, port: usize) -> u16 {
        match port {
            0 => self.p1.to_bits(),
            1 => self.p2.to_bits(),
            _ => 0,
        }
    }
}

/// The latched shift registers behind $4016/$4017 reads.
#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct InputState {
    p1_joypad: NesJoypadState,
    p2_joypad: NesJoypadState,
    strobe: bool,
    p1_shift: u16,
    p2_shift: u16,
}

impl InputState {
    pub(crate) fn new() -> Self {
        Self {
            p1_joypad: NesJoypadState::default(),
            p2_joypad: NesJoypadState::default(),
            strobe: false,
            p1_shift: 0,
            p2_shift: 0,
        }
    }

    pub(crate) fn update_joypads(&mut self, inputs: &NesInputs) {
        self.p1_joypad = inputs.p1.sanitize_opposing_directions();
        self.p2_joypad = inputs.p2.sanitize_opposing_directions();

        if self.strobe {
            self.reload_shift_registers();
        }
    }

    fn reload_shift_registers(&mut self) {
        self.p1_shift = self.p1_joypad.to_bits();
        self.p2_shift = self.p2_joypad.to_bits();
    }

    pub(crate) fn write_strobe(&mut self, value: u8) {
        self.strobe = value.bit(0);
        if self.strobe {
            self.reload_shift_registers();
        }
    }

    /// Only bit 0 is driven on a standard controller; the caller fills the upper bits from
    /// open bus.
    pub(crate) fn read_p1(&mut self) -> u8 {
        self.shift_out(false)
    }

    pub(crate) fn read_p2(&mut self) -> u8 {
        self.shift_out(true)
    }

    pub(crate) fn peek_p1(&self) -> u8 {
        (self.p1_shift & 0x01) as u8
    }

    pub(crate) fn peek_p2(&self) -> u8 {
        (self.p2_shift & 0x01) as u8
    }

    fn shift_out(&mut self, second_port: bool) -> u8 {
        if self.strobe {
            // While strobed, reads return the live A button state
            let joypad = if second_port { self.p2_joypad } else { self.p1_joypad };
            return u8::from(joypad.a);
        }

        let shift = if second_port { &mut self.p2_shift } else { &mut self.p1_shift };
        let bit = (*shift & 0x01) as u8;
        // Exhausted shift registers read 1
        *shift = (*shift >> 1) | 0x8000;
        bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strobe_then_read_shifts_buttons_in_order() {
        let mut state = InputState::new();
        let mut inputs = NesInputs::default();
        inputs.p1.a = true;
        inputs.p1.start = true;
        state.update_joypads(&inputs);

        state.write_strobe(1);
        state.write_strobe(0);

        // A, B, Select, Start
        assert_eq!(state.read_p1(), 1);
        assert_eq!(state.read_p1(), 0);
        assert_eq!(state.read_p1(), 0);
        assert_eq!(state.read_p1(), 1);
        // Remaining reads: directions (none pressed), then all 1s
        for _ in 0..4 {
            assert_eq!(state.read_p1(), 0);
        }
        assert_eq!(state.read_p1(), 1);
    }

    #[test]
    fn opposing_directions_are_sanitized() {
        let joypad = NesJoypadState { up: true, down: true, left: true, ..Default::default() };
        let sanitized = joypad.sanitize_opposing_directions();
        assert!(!sanitized.up);
        assert!(!sanitized.down);
        assert!(sanitized.left);
    }

    #[test]
    fn port_bits_round_trip() {
        let mut inputs = NesInputs::default();
        inputs.set_port_bits(0, 0b1010_0101);
        assert_eq!(inputs.port_bits(0), 0b1010_0101);
        assert!(inputs.p1.a);
        assert!(!inputs.p1.b);
        assert!(inputs.p1.select);
    }
}

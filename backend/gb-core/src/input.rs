//! The joypad matrix behind the P1/JOYP register.

use crate::interrupts::{InterruptRegisters, InterruptType};
use bincode::{Decode, Encode};
use nexen_common::input::PortInputs;
use nexen_common::num::GetBit;
use nexen_proc_macros::{EnumAll, EnumDisplay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay, EnumAll)]
pub enum GbButton {
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
pub struct GbJoypadState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub a: bool,
    pub b: bool,
    pub start: bool,
    pub select: bool,
}

impl GbJoypadState {
    pub fn set_button(&mut self, button: GbButton, pressed: bool) {
        match button {
            GbButton::Up => self.up = pressed,
            GbButton::Down => self.down = pressed,
            GbButton::Left => self.left = pressed,
            GbButton::Right => self.right = pressed,
            GbButton::A => self.a = pressed,
            GbButton::B => self.b = pressed,
            GbButton::Start => self.start = pressed,
            GbButton::Select => self.select = pressed,
        }
    }

    #[must_use]
    pub fn to_bits(self) -> u16 {
        u16::from(self.a)
            | (u16::from(self.b) << 1)
            | (u16::from(self.select) << 2)
            | (u16::from(self.start) << 3)
            | (u16::from(self.right) << 4)
            | (u16::from(self.left) << 5)
            | (u16::from(self.up) << 6)
            | (u16::from(self.down) << 7)
    }

    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            a: bits.bit(0),
            b: bits.bit(1),
            select: bits.bit(2),
            start: bits.bit(3),
            right: bits.bit(4),
            left: bits.bit(5),
            up: bits.bit(6),
            down: bits.bit(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct GbInputs {
    pub p1: GbJoypadState,
}

impl PortInputs for GbInputs {
    const PORTS: usize = 1;

    fn set_port_bits(&mut self, port: usize, bits: u16) {
        if port == 0 {
            self.p1 = GbJoypadState::from_bits(bits);
        }
    }

    fn port_bits(&self, port: usize) -> u16 {
        if port == 0 { self.p1.to_bits() } else { 0 }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct JoypadRegister {
    joypad: GbJoypadState,
    select_actions: bool,
    select_directions: bool,
}

impl JoypadRegister {
    pub(crate) fn new() -> Self {
        Self { joypad: GbJoypadState::default(), select_actions: true, select_directions: true }
    }

    pub(crate) fn update(&mut self, inputs: &GbInputs, interrupts: &mut InterruptRegisters) {
        let previous_lines = self.read() & 0x0F;
        self.joypad = inputs.p1;
        let new_lines = self.read() & 0x0F;

        // Lines are active-low; a 1 -> 0 transition is a new press
        if previous_lines & !new_lines != 0 {
            interrupts.request(InterruptType::Joypad);
        }
    }

    /// Buttons read active-low through the selected matrix rows.
    pub(crate) fn read(&self) -> u8 {
        let mut value = 0xC0
            | (u8::from(!self.select_actions) << 5)
            | (u8::from(!self.select_directions) << 4)
            | 0x0F;

        if self.select_directions {
            value &= !(u8::from(self.joypad.right)
                | (u8::from(self.joypad.left) << 1)
                | (u8::from(self.joypad.up) << 2)
                | (u8::from(self.joypad.down) << 3));
        }
        if self.select_actions {
            value &= !(u8::from(self.joypad.a)
                | (u8::from(self.joypad.b) << 1)
                | (u8::from(self.joypad.select) << 2)
                | (u8::from(self.joypad.start) << 3));
        }

        value
    }

    pub(crate) fn write(&mut self, value: u8) {
        self.select_actions = !value.bit(5);
        self.select_directions = !value.bit(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buttons_read_active_low() {
        let mut register = JoypadRegister::new();
        let mut interrupts = InterruptRegisters::default();

        let mut inputs = GbInputs::default();
        inputs.p1.a = true;
        register.update(&inputs, &mut interrupts);

        register.write(0x10); // select action buttons
        assert_eq!(register.read() & 0x0F, 0x0E); // A pressed -> bit 0 low

        register.write(0x20); // select directions
        assert_eq!(register.read() & 0x0F, 0x0F);
    }
}

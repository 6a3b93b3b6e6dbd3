//! Sharp SM83 (LR35902), the Game Boy CPU.
//!
//! A Z80 relative with the index registers, alternate register set, and I/O ports removed, plus
//! its own flag layout (Z N H C in the F high nibble). Instruction-stepped: every memory access
//! is one M-cycle and internal cycles call `bus.idle()`, so instruction timing emerges from the
//! access sequences.

use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

use crate::interrupts::InterruptType;

pub(crate) trait BusInterface {
    /// Read a memory address; advances all components by one M-cycle.
    fn read(&mut self, address: u16) -> u8;

    /// Write a memory address; advances all components by one M-cycle.
    fn write(&mut self, address: u16, value: u8);

    /// An internal CPU cycle with no bus access; advances all components by one M-cycle.
    fn idle(&mut self);

    /// The IE register (upper 3 bits clear).
    fn read_ie_register(&self) -> u8;

    /// The IF register (upper 3 bits clear).
    fn read_if_register(&self) -> u8;

    fn interrupt_pending(&self) -> bool {
        self.read_ie_register() & self.read_if_register() != 0
    }

    /// Clear the IF bit for the given interrupt.
    fn acknowledge_interrupt(&mut self, interrupt: InterruptType);

    /// Whether the CPU is halted by an in-progress CGB VRAM DMA.
    fn cpu_halted_by_dma(&self) -> bool;

    /// Whether a CGB speed switch is armed (KEY1 bit 0).
    fn speed_switch_armed(&self) -> bool;

    fn perform_speed_switch(&mut self);
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub(crate) struct Flags {
    pub(crate) zero: bool,
    pub(crate) subtract: bool,
    pub(crate) half_carry: bool,
    pub(crate) carry: bool,
}

impl From<Flags> for u8 {
    fn from(flags: Flags) -> Self {
        (u8::from(flags.zero) << 7)
            | (u8::from(flags.subtract) << 6)
            | (u8::from(flags.half_carry) << 5)
            | (u8::from(flags.carry) << 4)
    }
}

impl From<u8> for Flags {
    fn from(byte: u8) -> Self {
        Self {
            zero: byte.bit(7),
            subtract: byte.bit(6),
            half_carry: byte.bit(5),
            carry: byte.bit(4),
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Registers {
    pub(crate) a: u8,
    pub(crate) f: Flags,
    pub(crate) b: u8,
    pub(crate) c: u8,
    pub(crate) d: u8,
    pub(crate) e: u8,
    pub(crate) h: u8,
    pub(crate) l: u8,
    pub(crate) sp: u16,
    pub(crate) pc: u16,
    pub(crate) ime: bool,
}

impl Registers {
    /// Post-boot-ROM register values; A distinguishes DMG ($01) from CGB ($11).
    fn new(cgb: bool) -> Self {
        if cgb {
            Self {
                a: 0x11,
                f: Flags { zero: true, subtract: false, half_carry: false, carry: false },
                b: 0x00,
                c: 0x00,
                d: 0xFF,
                e: 0x56,
                h: 0x00,
                l: 0x0D,
                sp: 0xFFFE,
                pc: 0x0100,
                ime: false,
            }
        } else {
            Self {
                a: 0x01,
                f: Flags { zero: true, subtract: false, half_carry: true, carry: true },
                b: 0x00,
                c: 0x13,
                d: 0x00,
                e: 0xD8,
                h: 0x01,
                l: 0x4D,
                sp: 0xFFFE,
                pc: 0x0100,
                ime: false,
            }
        }
    }

    pub(crate) fn bc(&self) -> u16 {
        u16::from_be_bytes([self.b, self.c])
    }

    pub(crate) fn de(&self) -> u16 {
        u16::from_be_bytes([self.d, self.e])
    }

    pub(crate) fn hl(&self) -> u16 {
        u16::from_be_bytes([self.h, self.l])
    }

    fn set_bc(&mut self, value: u16) {
        [self.b, self.c] = value.to_be_bytes();
    }

    fn set_de(&mut self, value: u16) {
        [self.d, self.e] = value.to_be_bytes();
    }

    fn set_hl(&mut self, value: u16) {
        [self.h, self.l] = value.to_be_bytes();
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Sm83 {
    pub(crate) registers: Registers,
    halted: bool,
    halt_bug: bool,
    ime_pending: bool,
    frozen: bool,
}

impl Sm83 {
    pub(crate) fn new(cgb: bool) -> Self {
        Self {
            registers: Registers::new(cgb),
            halted: false,
            halt_bug: false,
            ime_pending: false,
            frozen: false,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn pc(&self) -> u16 {
        self.registers.pc
    }

    pub(crate) fn execute_instruction<B: BusInterface>(&mut self, bus: &mut B) {
        if self.frozen || bus.cpu_halted_by_dma() {
            bus.idle();
            return;
        }

        if self.halted {
            if !bus.interrupt_pending() {
                bus.idle();
                return;
            }
            self.halted = false;
        }

        if self.registers.ime {
            if let Some(interrupt) = self.highest_priority_interrupt(bus) {
                self.service_interrupt(bus, interrupt);
                return;
            }
        }

        if self.ime_pending {
            self.registers.ime = true;
            self.ime_pending = false;
        }

        let opcode = self.fetch(bus);
        self.execute_opcode(bus, opcode);
    }

    fn highest_priority_interrupt<B: BusInterface>(&self, bus: &B) -> Option<InterruptType> {
        let pending = bus.read_ie_register() & bus.read_if_register();
        InterruptType::ALL.into_iter().find(|interrupt| pending.bit(interrupt.bit_index()))
    }

    fn service_interrupt<B: BusInterface>(&mut self, bus: &mut B, interrupt: InterruptType) {
        bus.idle();
        bus.idle();

        self.registers.ime = false;
        bus.acknowledge_interrupt(interrupt);

        let [pc_lsb, pc_msb] = self.registers.pc.to_le_bytes();
        self.push_byte(bus, pc_msb);
        self.push_byte(bus, pc_lsb);

        bus.idle();
        self.registers.pc = interrupt.vector();
    }

    fn fetch<B: BusInterface>(&mut self, bus: &mut B) -> u8 {
        let value = bus.read(self.registers.pc);
        if self.halt_bug {
            // The HALT bug: the PC fails to increment for one fetch
            self.halt_bug = false;
        } else {
            self.registers.pc = self.registers.pc.wrapping_add(1);
        }
        value
    }

    fn fetch_u16<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let lsb = self.fetch(bus);
        let msb = self.fetch(bus);
        u16::from_le_bytes([lsb, msb])
    }

    fn push_byte<B: BusInterface>(&mut self, bus: &mut B, value: u8) {
        self.registers.sp = self.registers.sp.wrapping_sub(1);
        bus.write(self.registers.sp, value);
    }

    fn push_u16<B: BusInterface>(&mut self, bus: &mut B, value: u16) {
        bus.idle();
        let [lsb, msb] = value.to_le_bytes();
        self.push_byte(bus, msb);
        self.push_byte(bus, lsb);
    }

    fn pop_u16<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let lsb = bus.read(self.registers.sp);
        self.registers.sp = self.registers.sp.wrapping_add(1);
        let msb = bus.read(self.registers.sp);
        self.registers.sp = self.registers.sp.wrapping_add(1);
        u16::from_le_bytes([lsb, msb])
    }

    /// Register field decode: 0-7 = B C D E H L (HL) A.
    fn read_r<B: BusInterface>(&mut self, bus: &mut B, code: u8) -> u8 {
        match code & 0x7 {
            0 => self.registers.b,
            1 => self.registers.c,
            2 => self.registers.d,
            3 => self.registers.e,
            4 => self.registers.h,
            5 => self.registers.l,
            6 => bus.read(self.registers.hl()),
            _ => self.registers.a,
        }
    }

    fn write_r<B: BusInterface>(&mut self, bus: &mut B, code: u8, value: u8) {
        match code & 0x7 {
            0 => self.registers.b = value,
            1 => self.registers.c = value,
            2 => self.registers.d = value,
            3 => self.registers.e = value,
            4 => self.registers.h = value,
            5 => self.registers.l = value,
            6 => bus.write(self.registers.hl(), value),
            _ => self.registers.a = value,
        }
    }

    fn read_rr(&self, code: u8) -> u16 {
        match code & 0x3 {
            0 => self.registers.bc(),
            1 => self.registers.de(),
            2 => self.registers.hl(),
            _ => self.registers.sp,
        }
    }

    fn write_rr(&mut self, code: u8, value: u16) {
        match code & 0x3 {
            0 => self.registers.set_bc(value),
            1 => self.registers.set_de(value),
            2 => self.registers.set_hl(value),
            _ => self.registers.sp = value,
        }
    }

    fn condition(&self, code: u8) -> bool {
        match code & 0x3 {
            0 => !self.registers.f.zero,
            1 => self.registers.f.zero,
            2 => !self.registers.f.carry,
            _ => self.registers.f.carry,
        }
    }

    // ===== ALU =====

    fn add_a(&mut self, operand: u8, with_carry: bool) {
        let a = self.registers.a;
        let carry_in = u8::from(with_carry && self.registers.f.carry);
        let sum = u16::from(a) + u16::from(operand) + u16::from(carry_in);
        let result = sum as u8;

        self.registers.f = Flags {
            zero: result == 0,
            subtract: false,
            half_carry: (a & 0x0F) + (operand & 0x0F) + carry_in > 0x0F,
            carry: sum > 0xFF,
        };
        self.registers.a = result;
    }

    fn sub_a(&mut self, operand: u8, with_carry: bool, store_result: bool) {
        let a = self.registers.a;
        let carry_in = u8::from(with_carry && self.registers.f.carry);
        let diff = i16::from(a) - i16::from(operand) - i16::from(carry_in);
        let result = diff as u8;

        self.registers.f = Flags {
            zero: result == 0,
            subtract: true,
            half_carry: (a & 0x0F) < (operand & 0x0F) + carry_in,
            carry: diff < 0,
        };
        if store_result {
            self.registers.a = result;
        }
    }

    fn and_a(&mut self, operand: u8) {
        self.registers.a &= operand;
        self.registers.f = Flags {
            zero: self.registers.a == 0,
            subtract: false,
            half_carry: true,
            carry: false,
        };
    }

    fn xor_a(&mut self, operand: u8) {
        self.registers.a ^= operand;
        self.registers.f = Flags {
            zero: self.registers.a == 0,
            subtract: false,
            half_carry: false,
            carry: false,
        };
    }

    fn or_a(&mut self, operand: u8) {
        self.registers.a |= operand;
        self.registers.f = Flags {
            zero: self.registers.a == 0,
            subtract: false,
            half_carry: false,
            carry: false,
        };
    }

    fn alu_a(&mut self, op: u8, operand: u8) {
        match op & 0x7 {
            0 => self.add_a(operand, false),
            1 => self.add_a(operand, true),
            2 => self.sub_a(operand, false, true),
            3 => self.sub_a(operand, true, true),
            4 => self.and_a(operand),
            5 => self.xor_a(operand),
            6 => self.or_a(operand),
            _ => self.sub_a(operand, false, false),
        }
    }

    fn inc_r<B: BusInterface>(&mut self, bus: &mut B, code: u8) {
        let value = self.read_r(bus, code);
        let result = value.wrapping_add(1);
        self.registers.f.zero = result == 0;
        self.registers.f.subtract = false;
        self.registers.f.half_carry = value & 0x0F == 0x0F;
        self.write_r(bus, code, result);
    }

    fn dec_r<B: BusInterface>(&mut self, bus: &mut B, code: u8) {
        let value = self.read_r(bus, code);
        let result = value.wrapping_sub(1);
        self.registers.f.zero = result == 0;
        self.registers.f.subtract = true;
        self.registers.f.half_carry = value & 0x0F == 0x00;
        self.write_r(bus, code, result);
    }

    fn add_hl_rr<B: BusInterface>(&mut self, bus: &mut B, code: u8) {
        let hl = self.registers.hl();
        let operand = self.read_rr(code);
        let sum = u32::from(hl) + u32::from(operand);

        self.registers.f.subtract = false;
        self.registers.f.half_carry = (hl & 0x0FFF) + (operand & 0x0FFF) > 0x0FFF;
        self.registers.f.carry = sum > 0xFFFF;
        self.registers.set_hl(sum as u16);
        bus.idle();
    }

    /// ADD SP,e and LD HL,SP+e share their (8-bit, unsigned) flag computation.
    fn sp_plus_offset<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let offset = self.fetch(bus) as i8 as u16;
        let sp = self.registers.sp;

        self.registers.f = Flags {
            zero: false,
            subtract: false,
            half_carry: (sp & 0x000F) + (offset & 0x000F) > 0x000F,
            carry: (sp & 0x00FF) + (offset & 0x00FF) > 0x00FF,
        };
        sp.wrapping_add(offset)
    }

    fn daa(&mut self) {
        let mut a = self.registers.a;
        let flags = self.registers.f;

        if flags.subtract {
            if flags.carry {
                a = a.wrapping_sub(0x60);
            }
            if flags.half_carry {
                a = a.wrapping_sub(0x06);
            }
        } else {
            if flags.carry || a > 0x99 {
                a = a.wrapping_add(0x60);
                self.registers.f.carry = true;
            }
            if flags.half_carry || a & 0x0F > 0x09 {
                a = a.wrapping_add(0x06);
            }
        }

        self.registers.a = a;
        self.registers.f.zero = a == 0;
        self.registers.f.half_carry = false;
    }

    // ===== Dispatch =====

    #[allow(clippy::match_same_arms)]
    fn execute_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) {
        match opcode {
            // NOP
            0x00 => {}
            // LD rr, u16
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch_u16(bus);
                self.write_rr(opcode >> 4, value);
            }
            // LD (BC)/(DE), A and loads back
            0x02 => bus.write(self.registers.bc(), self.registers.a),
            0x12 => bus.write(self.registers.de(), self.registers.a),
            0x0A => self.registers.a = bus.read(self.registers.bc()),
            0x1A => self.registers.a = bus.read(self.registers.de()),
            // LD (HL±), A / LD A, (HL±)
            0x22 => {
                let hl = self.registers.hl();
                bus.write(hl, self.registers.a);
                self.registers.set_hl(hl.wrapping_add(1));
            }
            0x32 => {
                let hl = self.registers.hl();
                bus.write(hl, self.registers.a);
                self.registers.set_hl(hl.wrapping_sub(1));
            }
            0x2A => {
                let hl = self.registers.hl();
                self.registers.a = bus.read(hl);
                self.registers.set_hl(hl.wrapping_add(1));
            }
            0x3A => {
                let hl = self.registers.hl();
                self.registers.a = bus.read(hl);
                self.registers.set_hl(hl.wrapping_sub(1));
            }
            // INC/DEC rr
            0x03 | 0x13 | 0x23 | 0x33 => {
                let value = self.read_rr(opcode >> 4).wrapping_add(1);
                self.write_rr(opcode >> 4, value);
                bus.idle();
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let value = self.read_rr(opcode >> 4).wrapping_sub(1);
                self.write_rr(opcode >> 4, value);
                bus.idle();
            }
            // INC/DEC r
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                self.inc_r(bus, opcode >> 3);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                self.dec_r(bus, opcode >> 3);
            }
            // LD r, u8
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let value = self.fetch(bus);
                self.write_r(bus, opcode >> 3, value);
            }
            // Accumulator rotates: Z is always cleared, unlike the CB forms
            0x07 => {
                self.registers.f.carry = self.registers.a.bit(7);
                self.registers.a = self.registers.a.rotate_left(1);
                self.registers.f.zero = false;
                self.registers.f.subtract = false;
                self.registers.f.half_carry = false;
            }
            0x0F => {
                self.registers.f.carry = self.registers.a.bit(0);
                self.registers.a = self.registers.a.rotate_right(1);
                self.registers.f.zero = false;
                self.registers.f.subtract = false;
                self.registers.f.half_carry = false;
            }
            0x17 => {
                let carry_in = u8::from(self.registers.f.carry);
                self.registers.f.carry = self.registers.a.bit(7);
                self.registers.a = (self.registers.a << 1) | carry_in;
                self.registers.f.zero = false;
                self.registers.f.subtract = false;
                self.registers.f.half_carry = false;
            }
            0x1F => {
                let carry_in = u8::from(self.registers.f.carry) << 7;
                self.registers.f.carry = self.registers.a.bit(0);
                self.registers.a = (self.registers.a >> 1) | carry_in;
                self.registers.f.zero = false;
                self.registers.f.subtract = false;
                self.registers.f.half_carry = false;
            }
            // LD (u16), SP
            0x08 => {
                let address = self.fetch_u16(bus);
                let [lsb, msb] = self.registers.sp.to_le_bytes();
                bus.write(address, lsb);
                bus.write(address.wrapping_add(1), msb);
            }
            // ADD HL, rr
            0x09 | 0x19 | 0x29 | 0x39 => self.add_hl_rr(bus, opcode >> 4),
            // STOP: either a speed switch or a deep sleep
            0x10 => {
                self.fetch(bus);
                if bus.speed_switch_armed() {
                    bus.perform_speed_switch();
                } else {
                    self.halted = true;
                }
            }
            // JR / JR cc
            0x18 => {
                let offset = self.fetch(bus) as i8;
                self.registers.pc = self.registers.pc.wrapping_add(offset as u16);
                bus.idle();
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch(bus) as i8;
                if self.condition(opcode >> 3) {
                    self.registers.pc = self.registers.pc.wrapping_add(offset as u16);
                    bus.idle();
                }
            }
            // DAA / CPL / SCF / CCF
            0x27 => self.daa(),
            0x2F => {
                self.registers.a = !self.registers.a;
                self.registers.f.subtract = true;
                self.registers.f.half_carry = true;
            }
            0x37 => {
                self.registers.f.carry = true;
                self.registers.f.subtract = false;
                self.registers.f.half_carry = false;
            }
            0x3F => {
                self.registers.f.carry = !self.registers.f.carry;
                self.registers.f.subtract = false;
                self.registers.f.half_carry = false;
            }
            // HALT
            0x76 => {
                if self.registers.ime || !bus.interrupt_pending() {
                    self.halted = true;
                } else {
                    // IME clear with an interrupt already pending triggers the HALT bug
                    self.halt_bug = true;
                }
            }
            // LD r, r'
            0x40..=0x7F => {
                let value = self.read_r(bus, opcode);
                self.write_r(bus, opcode >> 3, value);
            }
            // ALU A, r
            0x80..=0xBF => {
                let operand = self.read_r(bus, opcode);
                self.alu_a(opcode >> 3, operand);
            }
            // ALU A, u8
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let operand = self.fetch(bus);
                self.alu_a(opcode >> 3, operand);
            }
            // RET cc / RET / RETI
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                bus.idle();
                if self.condition(opcode >> 3) {
                    self.registers.pc = self.pop_u16(bus);
                    bus.idle();
                }
            }
            0xC9 => {
                self.registers.pc = self.pop_u16(bus);
                bus.idle();
            }
            0xD9 => {
                self.registers.pc = self.pop_u16(bus);
                self.registers.ime = true;
                bus.idle();
            }
            // POP / PUSH
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let value = self.pop_u16(bus);
                match (opcode >> 4) & 0x3 {
                    0 => self.registers.set_bc(value),
                    1 => self.registers.set_de(value),
                    2 => self.registers.set_hl(value),
                    _ => {
                        let [a, f] = value.to_be_bytes();
                        self.registers.a = a;
                        self.registers.f = f.into();
                    }
                }
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let value = match (opcode >> 4) & 0x3 {
                    0 => self.registers.bc(),
                    1 => self.registers.de(),
                    2 => self.registers.hl(),
                    _ => u16::from_be_bytes([self.registers.a, self.registers.f.into()]),
                };
                self.push_u16(bus, value);
            }
            // JP / JP cc / JP HL
            0xC3 => {
                self.registers.pc = self.fetch_u16(bus);
                bus.idle();
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let target = self.fetch_u16(bus);
                if self.condition(opcode >> 3) {
                    self.registers.pc = target;
                    bus.idle();
                }
            }
            0xE9 => self.registers.pc = self.registers.hl(),
            // CALL / CALL cc
            0xCD => {
                let target = self.fetch_u16(bus);
                let pc = self.registers.pc;
                self.push_u16(bus, pc);
                self.registers.pc = target;
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let target = self.fetch_u16(bus);
                if self.condition(opcode >> 3) {
                    let pc = self.registers.pc;
                    self.push_u16(bus, pc);
                    self.registers.pc = target;
                }
            }
            // RST
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let pc = self.registers.pc;
                self.push_u16(bus, pc);
                self.registers.pc = u16::from(opcode & 0x38);
            }
            // CB prefix
            0xCB => {
                let cb_opcode = self.fetch(bus);
                self.execute_cb_opcode(bus, cb_opcode);
            }
            // High-page loads
            0xE0 => {
                let offset = self.fetch(bus);
                bus.write(0xFF00 | u16::from(offset), self.registers.a);
            }
            0xF0 => {
                let offset = self.fetch(bus);
                self.registers.a = bus.read(0xFF00 | u16::from(offset));
            }
            0xE2 => bus.write(0xFF00 | u16::from(self.registers.c), self.registers.a),
            0xF2 => self.registers.a = bus.read(0xFF00 | u16::from(self.registers.c)),
            // LD (u16), A / LD A, (u16)
            0xEA => {
                let address = self.fetch_u16(bus);
                bus.write(address, self.registers.a);
            }
            0xFA => {
                let address = self.fetch_u16(bus);
                self.registers.a = bus.read(address);
            }
            // ADD SP, e / LD HL, SP+e / LD SP, HL
            0xE8 => {
                let result = self.sp_plus_offset(bus);
                self.registers.sp = result;
                bus.idle();
                bus.idle();
            }
            0xF8 => {
                let result = self.sp_plus_offset(bus);
                self.registers.set_hl(result);
                bus.idle();
            }
            0xF9 => {
                self.registers.sp = self.registers.hl();
                bus.idle();
            }
            // DI / EI
            0xF3 => {
                self.registers.ime = false;
                self.ime_pending = false;
            }
            0xFB => {
                // IME is not set until after the following instruction
                self.ime_pending = true;
            }
            // Invalid opcodes freeze the CPU
            0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => {
                log::error!(
                    "SM83 executed invalid opcode {opcode:02X} at {:04X}; CPU frozen",
                    self.registers.pc.wrapping_sub(1)
                );
                self.frozen = true;
            }
        }
    }

    fn execute_cb_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) {
        let reg_code = opcode & 0x7;
        let bit_index = (opcode >> 3) & 0x7;

        match opcode {
            // Rotates and shifts
            0x00..=0x3F => {
                let value = self.read_r(bus, reg_code);
                let (result, carry) = match opcode >> 3 {
                    0 => (value.rotate_left(1), value.bit(7)),
                    1 => (value.rotate_right(1), value.bit(0)),
                    2 => ((value << 1) | u8::from(self.registers.f.carry), value.bit(7)),
                    3 => {
                        ((value >> 1) | (u8::from(self.registers.f.carry) << 7), value.bit(0))
                    }
                    4 => (value << 1, value.bit(7)),
                    5 => (((value as i8) >> 1) as u8, value.bit(0)),
                    6 => (value.rotate_left(4), false),
                    _ => (value >> 1, value.bit(0)),
                };

                self.registers.f =
                    Flags { zero: result == 0, subtract: false, half_carry: false, carry };
                self.write_r(bus, reg_code, result);
            }
            // BIT
            0x40..=0x7F => {
                let value = self.read_r(bus, reg_code);
                self.registers.f.zero = !value.bit(bit_index);
                self.registers.f.subtract = false;
                self.registers.f.half_carry = true;
            }
            // RES / SET
            0x80..=0xBF => {
                let value = self.read_r(bus, reg_code) & !(1 << bit_index);
                self.write_r(bus, reg_code, value);
            }
            0xC0..=0xFF => {
                let value = self.read_r(bus, reg_code) | (1 << bit_index);
                self.write_r(bus, reg_code, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBus {
        memory: Box<[u8; 0x10000]>,
        ie: u8,
        iff: u8,
        m_cycles: u32,
    }

    impl TestBus {
        fn new() -> Self {
            Self {
                memory: vec![0; 0x10000].into_boxed_slice().try_into().unwrap(),
                ie: 0,
                iff: 0,
                m_cycles: 0,
            }
        }
    }

    impl BusInterface for TestBus {
        fn read(&mut self, address: u16) -> u8 {
            self.m_cycles += 1;
            self.memory[address as usize]
        }

        fn write(&mut self, address: u16, value: u8) {
            self.m_cycles += 1;
            self.memory[address as usize] = value;
        }

        fn idle(&mut self) {
            self.m_cycles += 1;
        }

        fn read_ie_register(&self) -> u8 {
            self.ie
        }

        fn read_if_register(&self) -> u8 {
            self.iff
        }

        fn acknowledge_interrupt(&mut self, interrupt: InterruptType) {
            self.iff &= !(1 << interrupt.bit_index());
        }

        fn cpu_halted_by_dma(&self) -> bool {
            false
        }

        fn speed_switch_armed(&self) -> bool {
            false
        }

        fn perform_speed_switch(&mut self) {}
    }

    fn new_cpu(program: &[u8]) -> (Sm83, TestBus) {
        let mut bus = TestBus::new();
        bus.memory[0x0100..0x0100 + program.len()].copy_from_slice(program);
        (Sm83::new(false), bus)
    }

    // Reference implementation of the documented DAA adjustment table
    fn reference_daa(a: u8, n: bool, h: bool, c: bool) -> (u8, bool) {
        let mut result = a;
        let mut carry = c;

        if n {
            if c {
                result = result.wrapping_sub(0x60);
            }
            if h {
                result = result.wrapping_sub(0x06);
            }
        } else {
            if c || a > 0x99 {
                result = result.wrapping_add(0x60);
                carry = true;
            }
            if h || a & 0x0F > 0x09 {
                result = result.wrapping_add(0x06);
            }
        }

        (result, carry)
    }

    #[test]
    fn daa_exhaustive_over_all_inputs() {
        // All 2048 combinations of (A, N, H, C)
        for a in 0..=255_u8 {
            for n in [false, true] {
                for h in [false, true] {
                    for c in [false, true] {
                        let (expected, expected_carry) = reference_daa(a, n, h, c);

                        let (mut cpu, mut bus) = new_cpu(&[0x27]);
                        cpu.registers.a = a;
                        cpu.registers.f =
                            Flags { zero: false, subtract: n, half_carry: h, carry: c };
                        cpu.execute_instruction(&mut bus);

                        assert_eq!(
                            cpu.registers.a, expected,
                            "DAA result for A={a:02X} N={n} H={h} C={c}"
                        );
                        assert_eq!(
                            cpu.registers.f.carry, expected_carry,
                            "DAA carry for A={a:02X} N={n} H={h} C={c}"
                        );
                        assert_eq!(cpu.registers.f.zero, expected == 0);
                        assert!(!cpu.registers.f.half_carry);
                    }
                }
            }
        }
    }

    #[test]
    fn half_carry_on_add() {
        let (mut cpu, mut bus) = new_cpu(&[0xC6, 0x01]); // ADD A, 1
        cpu.registers.a = 0x0F;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers.a, 0x10);
        assert!(cpu.registers.f.half_carry);
        assert!(!cpu.registers.f.carry);
    }

    #[test]
    fn halt_bug_freezes_pc_for_one_fetch() {
        // IME clear, interrupt pending, then HALT followed by INC A
        let (mut cpu, mut bus) = new_cpu(&[0x76, 0x3C, 0x00]);
        bus.ie = 0x01;
        bus.iff = 0x01;
        cpu.registers.ime = false;
        cpu.registers.a = 0;

        cpu.execute_instruction(&mut bus); // HALT triggers the bug
        cpu.execute_instruction(&mut bus); // INC A executes...
        cpu.execute_instruction(&mut bus); // ...and executes AGAIN because PC did not advance

        assert_eq!(cpu.registers.a, 2);
        assert_eq!(cpu.registers.pc, 0x0102);
    }

    #[test]
    fn ei_delay_and_interrupt_dispatch() {
        let (mut cpu, mut bus) = new_cpu(&[0xFB, 0x00, 0x00]); // EI / NOP / NOP
        bus.ie = 0x01; // VBlank enabled
        bus.iff = 0x01; // VBlank requested

        cpu.execute_instruction(&mut bus); // EI
        assert!(!cpu.registers.ime);
        cpu.execute_instruction(&mut bus); // NOP executes; IME becomes set
        assert!(cpu.registers.ime);

        cpu.execute_instruction(&mut bus); // interrupt dispatch
        assert_eq!(cpu.registers.pc, 0x0040);
        assert!(!cpu.registers.ime);
        assert_eq!(bus.iff, 0);
    }

    #[test]
    fn halt_wakes_without_dispatch_when_ime_clear() {
        let (mut cpu, mut bus) = new_cpu(&[0x00, 0x76, 0x3C]);
        cpu.execute_instruction(&mut bus); // NOP

        cpu.execute_instruction(&mut bus); // HALT (no interrupt pending -> halts)
        assert!(cpu.halted);

        cpu.execute_instruction(&mut bus); // still halted
        assert!(cpu.halted);

        bus.ie = 0x04;
        bus.iff = 0x04;
        cpu.execute_instruction(&mut bus); // wakes, executes INC A, no dispatch
        assert!(!cpu.halted);
        assert_eq!(cpu.registers.a, 0x02); // DMG boot A=$01, incremented
    }

    #[test]
    fn instruction_timing_in_m_cycles() {
        for (program, expected_m_cycles) in [
            (vec![0x00_u8], 1),       // NOP
            (vec![0x3E, 0x42], 2),    // LD A, u8
            (vec![0xC3, 0x00, 0x02], 4), // JP u16
            (vec![0xCD, 0x00, 0x02], 6), // CALL u16
            (vec![0x34], 3),          // INC (HL)
            (vec![0xE8, 0x05], 4),    // ADD SP, e
        ] {
            let (mut cpu, mut bus) = new_cpu(&program);
            cpu.execute_instruction(&mut bus);
            assert_eq!(
                bus.m_cycles, expected_m_cycles,
                "cycle count for opcode {:02X}",
                program[0]
            );
        }
    }

    #[test]
    fn pop_af_masks_flag_low_bits() {
        let (mut cpu, mut bus) = new_cpu(&[0xF1]); // POP AF
        cpu.registers.sp = 0xC000;
        bus.memory[0xC000] = 0xFF; // F byte: only the high nibble sticks
        bus.memory[0xC001] = 0x12;

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers.a, 0x12);
        let f: u8 = cpu.registers.f.into();
        assert_eq!(f, 0xF0);
    }
}

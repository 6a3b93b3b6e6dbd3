//! Opcode dispatch and execution.
//!
//! Cycle costs are tabulated per instruction (the HuC6280's timing does not follow the 6502's
//! one-bus-access-per-cycle pattern; most memory-operand instructions carry an extra internal
//! cycle). Branch and T-flag penalties are added at the point they occur.

use crate::{BRK_VECTOR, BusInterface, ClockSpeed, HuC6280};
use nexen_common::num::GetBit;

pub(crate) fn execute<B: BusInterface>(cpu: &mut HuC6280, bus: &mut B) -> u32 {
    let opcode = cpu.fetch(bus);

    log::trace!(
        "Executing {opcode:02X} from PC {:04X}: A={:02X} X={:02X} Y={:02X} SP={:02X}",
        cpu.registers.pc.wrapping_sub(1),
        cpu.registers.a,
        cpu.registers.x,
        cpu.registers.y,
        cpu.registers.sp
    );

    let cycles = cpu.execute_opcode(bus, opcode);

    // The T flag only survives the SET instruction itself
    if opcode != 0xF4 {
        cpu.registers.status.memory_operand = false;
    }

    cycles
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    IndexedIndirect,
    IndirectY,
    Indirect,
}

impl Mode {
    fn read_cycles(self) -> u32 {
        match self {
            Self::Immediate => 2,
            Self::ZeroPage | Self::ZeroPageX | Self::ZeroPageY => 4,
            Self::Absolute | Self::AbsoluteX | Self::AbsoluteY => 5,
            Self::IndexedIndirect | Self::IndirectY | Self::Indirect => 7,
        }
    }
}

impl HuC6280 {
    fn fetch<B: BusInterface>(&mut self, bus: &mut B) -> u8 {
        let value = bus.read(self.translate(self.registers.pc));
        self.registers.pc = self.registers.pc.wrapping_add(1);
        value
    }

    fn fetch_u16<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let lsb = self.fetch(bus);
        let msb = self.fetch(bus);
        u16::from_le_bytes([lsb, msb])
    }

    fn read_log<B: BusInterface>(&mut self, bus: &mut B, address: u16) -> u8 {
        bus.read(self.translate(address))
    }

    fn write_log<B: BusInterface>(&mut self, bus: &mut B, address: u16, value: u8) {
        bus.write(self.translate(address), value);
    }

    // Zero page sits in the logical $2000 page (MPR1)
    fn zp_address(offset: u8) -> u16 {
        0x2000 | u16::from(offset)
    }

    fn resolve<B: BusInterface>(&mut self, bus: &mut B, mode: Mode) -> u16 {
        match mode {
            Mode::Immediate => unreachable!("immediate mode has no address"),
            Mode::ZeroPage => {
                let offset = self.fetch(bus);
                Self::zp_address(offset)
            }
            Mode::ZeroPageX => {
                let offset = self.fetch(bus).wrapping_add(self.registers.x);
                Self::zp_address(offset)
            }
            Mode::ZeroPageY => {
                let offset = self.fetch(bus).wrapping_add(self.registers.y);
                Self::zp_address(offset)
            }
            Mode::Absolute => self.fetch_u16(bus),
            Mode::AbsoluteX => self.fetch_u16(bus).wrapping_add(self.registers.x.into()),
            Mode::AbsoluteY => self.fetch_u16(bus).wrapping_add(self.registers.y.into()),
            Mode::IndexedIndirect => {
                let offset = self.fetch(bus).wrapping_add(self.registers.x);
                self.read_zp_pointer(bus, offset)
            }
            Mode::IndirectY => {
                let offset = self.fetch(bus);
                self.read_zp_pointer(bus, offset).wrapping_add(self.registers.y.into())
            }
            Mode::Indirect => {
                let offset = self.fetch(bus);
                self.read_zp_pointer(bus, offset)
            }
        }
    }

    fn read_zp_pointer<B: BusInterface>(&mut self, bus: &mut B, offset: u8) -> u16 {
        let lsb = self.read_log(bus, Self::zp_address(offset));
        let msb = self.read_log(bus, Self::zp_address(offset.wrapping_add(1)));
        u16::from_le_bytes([lsb, msb])
    }

    fn read_operand<B: BusInterface>(&mut self, bus: &mut B, mode: Mode) -> u8 {
        if mode == Mode::Immediate {
            return self.fetch(bus);
        }
        let address = self.resolve(bus, mode);
        self.read_log(bus, address)
    }

    // ===== ALU =====

    /// ADC/AND/EOR/ORA honor the T flag: with T set, the operation reads and writes the
    /// zero-page byte indexed by X instead of the accumulator, at a 3-cycle premium.
    fn alu_with_t_flag<B: BusInterface>(
        &mut self,
        bus: &mut B,
        operand: u8,
        op: impl FnOnce(&mut Self, u8, u8) -> u8,
    ) -> u32 {
        if self.registers.status.memory_operand {
            let address = Self::zp_address(self.registers.x);
            let target = self.read_log(bus, address);
            let result = op(self, target, operand);
            self.write_log(bus, address, result);
            3
        } else {
            let a = self.registers.a;
            self.registers.a = op(self, a, operand);
            0
        }
    }

    fn adc_op(&mut self, target: u8, operand: u8) -> u8 {
        let carry_in = u8::from(self.registers.status.carry);

        if self.registers.status.decimal {
            let mut low = (target & 0x0F) + (operand & 0x0F) + carry_in;
            let mut high = u16::from(target >> 4) + u16::from(operand >> 4);
            if low > 0x09 {
                low += 0x06;
                high += 1;
            }
            if high > 0x09 {
                high += 0x06;
            }
            let result = ((high as u8) << 4) | (low & 0x0F);
            self.registers.status.carry = high > 0x0F;
            self.registers.status.set_nz(result);
            return result;
        }

        let sum = u16::from(target) + u16::from(operand) + u16::from(carry_in);
        let result = sum as u8;
        self.registers.status.carry = sum > 0xFF;
        self.registers.status.overflow = (!(target ^ operand) & (target ^ result)).bit(7);
        self.registers.status.set_nz(result);
        result
    }

    fn sbc_op(&mut self, operand: u8) {
        let a = self.registers.a;
        let borrow_in = u8::from(!self.registers.status.carry);

        if self.registers.status.decimal {
            let mut low = i16::from(a & 0x0F) - i16::from(operand & 0x0F) - i16::from(borrow_in);
            let mut high = i16::from(a >> 4) - i16::from(operand >> 4);
            if low < 0 {
                low += 0x0A;
                high -= 1;
            }
            if high < 0 {
                high += 0x0A;
            }
            let diff = i16::from(a) - i16::from(operand) - i16::from(borrow_in);
            let result = (((high as u8) & 0x0F) << 4) | ((low as u8) & 0x0F);
            self.registers.status.carry = diff >= 0;
            self.registers.status.set_nz(result);
            self.registers.a = result;
            return;
        }

        let diff = i16::from(a) - i16::from(operand) - i16::from(borrow_in);
        let result = diff as u8;
        self.registers.status.carry = diff >= 0;
        self.registers.status.overflow = ((a ^ operand) & (a ^ result)).bit(7);
        self.registers.status.set_nz(result);
        self.registers.a = result;
    }

    fn compare(&mut self, register: u8, operand: u8) {
        let (diff, borrowed) = register.overflowing_sub(operand);
        self.registers.status.carry = !borrowed;
        self.registers.status.set_nz(diff);
    }

    fn asl_op(&mut self, value: u8) -> u8 {
        self.registers.status.carry = value.bit(7);
        let result = value << 1;
        self.registers.status.set_nz(result);
        result
    }

    fn lsr_op(&mut self, value: u8) -> u8 {
        self.registers.status.carry = value.bit(0);
        let result = value >> 1;
        self.registers.status.set_nz(result);
        result
    }

    fn rol_op(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.registers.status.carry);
        self.registers.status.carry = value.bit(7);
        let result = (value << 1) | carry_in;
        self.registers.status.set_nz(result);
        result
    }

    fn ror_op(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.registers.status.carry) << 7;
        self.registers.status.carry = value.bit(0);
        let result = (value >> 1) | carry_in;
        self.registers.status.set_nz(result);
        result
    }

    fn bit_test(&mut self, value: u8) {
        self.registers.status.zero = self.registers.a & value == 0;
        self.registers.status.negative = value.bit(7);
        self.registers.status.overflow = value.bit(6);
    }

    fn rmw<B: BusInterface>(
        &mut self,
        bus: &mut B,
        mode: Mode,
        op: impl FnOnce(&mut Self, u8) -> u8,
    ) -> u32 {
        let address = self.resolve(bus, mode);
        let value = self.read_log(bus, address);
        let result = op(self, value);
        self.write_log(bus, address, result);
        mode.read_cycles() + 2
    }

    // ===== Control flow =====

    fn branch<B: BusInterface>(&mut self, bus: &mut B, condition: bool) -> u32 {
        let offset = self.fetch(bus) as i8;
        if condition {
            self.registers.pc = self.registers.pc.wrapping_add(offset as u16);
            4
        } else {
            2
        }
    }

    // ===== Dispatch =====

    #[allow(clippy::match_same_arms)]
    fn execute_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) -> u32 {
        match opcode {
            // BRK
            0x00 => {
                self.fetch(bus);
                self.service_interrupt(bus, BRK_VECTOR, true)
            }
            // ORA / AND / EOR / ADC with T-flag support
            0x01 | 0x05 | 0x09 | 0x0D | 0x11 | 0x12 | 0x15 | 0x19 | 0x1D => {
                let mode = group_one_mode(opcode);
                let operand = self.read_operand(bus, mode);
                mode.read_cycles()
                    + self.alu_with_t_flag(bus, operand, |cpu, target, operand| {
                        let result = target | operand;
                        cpu.registers.status.set_nz(result);
                        result
                    })
            }
            0x21 | 0x25 | 0x29 | 0x2D | 0x31 | 0x32 | 0x35 | 0x39 | 0x3D => {
                let mode = group_one_mode(opcode);
                let operand = self.read_operand(bus, mode);
                mode.read_cycles()
                    + self.alu_with_t_flag(bus, operand, |cpu, target, operand| {
                        let result = target & operand;
                        cpu.registers.status.set_nz(result);
                        result
                    })
            }
            0x41 | 0x45 | 0x49 | 0x4D | 0x51 | 0x52 | 0x55 | 0x59 | 0x5D => {
                let mode = group_one_mode(opcode);
                let operand = self.read_operand(bus, mode);
                mode.read_cycles()
                    + self.alu_with_t_flag(bus, operand, |cpu, target, operand| {
                        let result = target ^ operand;
                        cpu.registers.status.set_nz(result);
                        result
                    })
            }
            0x61 | 0x65 | 0x69 | 0x6D | 0x71 | 0x72 | 0x75 | 0x79 | 0x7D => {
                let mode = group_one_mode(opcode);
                let operand = self.read_operand(bus, mode);
                let decimal_penalty = u32::from(self.registers.status.decimal);
                mode.read_cycles()
                    + decimal_penalty
                    + self.alu_with_t_flag(bus, operand, Self::adc_op)
            }
            // LDA / CMP / SBC (no T-flag variants)
            0xA1 | 0xA5 | 0xA9 | 0xAD | 0xB1 | 0xB2 | 0xB5 | 0xB9 | 0xBD => {
                let mode = group_one_mode(opcode);
                let value = self.read_operand(bus, mode);
                self.registers.a = value;
                self.registers.status.set_nz(value);
                mode.read_cycles()
            }
            0xC1 | 0xC5 | 0xC9 | 0xCD | 0xD1 | 0xD2 | 0xD5 | 0xD9 | 0xDD => {
                let mode = group_one_mode(opcode);
                let value = self.read_operand(bus, mode);
                self.compare(self.registers.a, value);
                mode.read_cycles()
            }
            0xE1 | 0xE5 | 0xE9 | 0xED | 0xF1 | 0xF2 | 0xF5 | 0xF9 | 0xFD => {
                let mode = group_one_mode(opcode);
                let value = self.read_operand(bus, mode);
                let decimal_penalty = u32::from(self.registers.status.decimal);
                self.sbc_op(value);
                mode.read_cycles() + decimal_penalty
            }
            // STA
            0x81 | 0x85 | 0x8D | 0x91 | 0x92 | 0x95 | 0x99 | 0x9D => {
                let mode = group_one_mode(opcode);
                let address = self.resolve(bus, mode);
                self.write_log(bus, address, self.registers.a);
                mode.read_cycles()
            }
            // STX / STY / STZ
            0x86 | 0x96 | 0x8E => {
                let mode = match opcode {
                    0x86 => Mode::ZeroPage,
                    0x96 => Mode::ZeroPageY,
                    _ => Mode::Absolute,
                };
                let address = self.resolve(bus, mode);
                self.write_log(bus, address, self.registers.x);
                mode.read_cycles()
            }
            0x84 | 0x94 | 0x8C => {
                let mode = match opcode {
                    0x84 => Mode::ZeroPage,
                    0x94 => Mode::ZeroPageX,
                    _ => Mode::Absolute,
                };
                let address = self.resolve(bus, mode);
                self.write_log(bus, address, self.registers.y);
                mode.read_cycles()
            }
            0x64 | 0x74 | 0x9C | 0x9E => {
                let mode = match opcode {
                    0x64 => Mode::ZeroPage,
                    0x74 => Mode::ZeroPageX,
                    0x9C => Mode::Absolute,
                    _ => Mode::AbsoluteX,
                };
                let address = self.resolve(bus, mode);
                self.write_log(bus, address, 0);
                mode.read_cycles()
            }
            // LDX / LDY
            0xA2 | 0xA6 | 0xB6 | 0xAE | 0xBE => {
                let mode = match opcode {
                    0xA2 => Mode::Immediate,
                    0xA6 => Mode::ZeroPage,
                    0xB6 => Mode::ZeroPageY,
                    0xAE => Mode::Absolute,
                    _ => Mode::AbsoluteY,
                };
                let value = self.read_operand(bus, mode);
                self.registers.x = value;
                self.registers.status.set_nz(value);
                mode.read_cycles()
            }
            0xA0 | 0xA4 | 0xB4 | 0xAC | 0xBC => {
                let mode = match opcode {
                    0xA0 => Mode::Immediate,
                    0xA4 => Mode::ZeroPage,
                    0xB4 => Mode::ZeroPageX,
                    0xAC => Mode::Absolute,
                    _ => Mode::AbsoluteX,
                };
                let value = self.read_operand(bus, mode);
                self.registers.y = value;
                self.registers.status.set_nz(value);
                mode.read_cycles()
            }
            // CPX / CPY
            0xE0 | 0xE4 | 0xEC => {
                let mode = match opcode {
                    0xE0 => Mode::Immediate,
                    0xE4 => Mode::ZeroPage,
                    _ => Mode::Absolute,
                };
                let value = self.read_operand(bus, mode);
                self.compare(self.registers.x, value);
                mode.read_cycles()
            }
            0xC0 | 0xC4 | 0xCC => {
                let mode = match opcode {
                    0xC0 => Mode::Immediate,
                    0xC4 => Mode::ZeroPage,
                    _ => Mode::Absolute,
                };
                let value = self.read_operand(bus, mode);
                self.compare(self.registers.y, value);
                mode.read_cycles()
            }
            // BIT
            0x89 => {
                let value = self.fetch(bus);
                self.registers.status.zero = self.registers.a & value == 0;
                2
            }
            0x24 | 0x34 | 0x2C | 0x3C => {
                let mode = match opcode {
                    0x24 => Mode::ZeroPage,
                    0x34 => Mode::ZeroPageX,
                    0x2C => Mode::Absolute,
                    _ => Mode::AbsoluteX,
                };
                let value = self.read_operand(bus, mode);
                self.bit_test(value);
                mode.read_cycles()
            }
            // TST #imm, <mode>: N/V from the memory byte, Z from imm AND memory
            0x83 | 0xA3 | 0x93 | 0xB3 => {
                let mask = self.fetch(bus);
                let mode = match opcode {
                    0x83 => Mode::ZeroPage,
                    0xA3 => Mode::ZeroPageX,
                    0x93 => Mode::Absolute,
                    _ => Mode::AbsoluteX,
                };
                let value = self.read_operand(bus, mode);
                self.registers.status.zero = mask & value == 0;
                self.registers.status.negative = value.bit(7);
                self.registers.status.overflow = value.bit(6);
                mode.read_cycles() + 3
            }
            // TSB / TRB
            0x04 | 0x0C => {
                let mode = if opcode == 0x04 { Mode::ZeroPage } else { Mode::Absolute };
                self.rmw(bus, mode, |cpu, value| {
                    cpu.registers.status.zero = cpu.registers.a & value == 0;
                    value | cpu.registers.a
                })
            }
            0x14 | 0x1C => {
                let mode = if opcode == 0x14 { Mode::ZeroPage } else { Mode::Absolute };
                self.rmw(bus, mode, |cpu, value| {
                    cpu.registers.status.zero = cpu.registers.a & value == 0;
                    value & !cpu.registers.a
                })
            }
            // Shifts / rotates
            0x0A => {
                self.registers.a = self.asl_op(self.registers.a);
                2
            }
            0x2A => {
                self.registers.a = self.rol_op(self.registers.a);
                2
            }
            0x4A => {
                self.registers.a = self.lsr_op(self.registers.a);
                2
            }
            0x6A => {
                self.registers.a = self.ror_op(self.registers.a);
                2
            }
            0x06 | 0x16 | 0x0E | 0x1E => {
                let mode = rmw_mode(opcode);
                self.rmw(bus, mode, Self::asl_op)
            }
            0x26 | 0x36 | 0x2E | 0x3E => {
                let mode = rmw_mode(opcode);
                self.rmw(bus, mode, Self::rol_op)
            }
            0x46 | 0x56 | 0x4E | 0x5E => {
                let mode = rmw_mode(opcode);
                self.rmw(bus, mode, Self::lsr_op)
            }
            0x66 | 0x76 | 0x6E | 0x7E => {
                let mode = rmw_mode(opcode);
                self.rmw(bus, mode, Self::ror_op)
            }
            // INC / DEC
            0x1A => {
                self.registers.a = self.registers.a.wrapping_add(1);
                self.registers.status.set_nz(self.registers.a);
                2
            }
            0x3A => {
                self.registers.a = self.registers.a.wrapping_sub(1);
                self.registers.status.set_nz(self.registers.a);
                2
            }
            0xE6 | 0xF6 | 0xEE | 0xFE => {
                let mode = rmw_mode(opcode);
                self.rmw(bus, mode, |cpu, value| {
                    let result = value.wrapping_add(1);
                    cpu.registers.status.set_nz(result);
                    result
                })
            }
            0xC6 | 0xD6 | 0xCE | 0xDE => {
                let mode = rmw_mode(opcode);
                self.rmw(bus, mode, |cpu, value| {
                    let result = value.wrapping_sub(1);
                    cpu.registers.status.set_nz(result);
                    result
                })
            }
            // Rockwell-style bit ops
            0x07 | 0x17 | 0x27 | 0x37 | 0x47 | 0x57 | 0x67 | 0x77 | 0x87 | 0x97 | 0xA7 | 0xB7
            | 0xC7 | 0xD7 | 0xE7 | 0xF7 => {
                let bit_index = (opcode >> 4) & 0x07;
                let set = opcode.bit(7);
                let offset = self.fetch(bus);
                let address = Self::zp_address(offset);
                let value = self.read_log(bus, address);
                let result = if set { value | (1 << bit_index) } else { value & !(1 << bit_index) };
                self.write_log(bus, address, result);
                7
            }
            0x0F | 0x1F | 0x2F | 0x3F | 0x4F | 0x5F | 0x6F | 0x7F | 0x8F | 0x9F | 0xAF | 0xBF
            | 0xCF | 0xDF | 0xEF | 0xFF => {
                let bit_index = (opcode >> 4) & 0x07;
                let branch_if_set = opcode.bit(7);
                let offset = self.fetch(bus);
                let value = self.read_log(bus, Self::zp_address(offset));
                4 + self.branch(bus, value.bit(bit_index) == branch_if_set)
            }
            // Transfers / swaps / clears
            0xAA => {
                self.registers.x = self.registers.a;
                self.registers.status.set_nz(self.registers.x);
                2
            }
            0x8A => {
                self.registers.a = self.registers.x;
                self.registers.status.set_nz(self.registers.a);
                2
            }
            0xA8 => {
                self.registers.y = self.registers.a;
                self.registers.status.set_nz(self.registers.y);
                2
            }
            0x98 => {
                self.registers.a = self.registers.y;
                self.registers.status.set_nz(self.registers.a);
                2
            }
            0xBA => {
                self.registers.x = self.registers.sp;
                self.registers.status.set_nz(self.registers.x);
                2
            }
            0x9A => {
                self.registers.sp = self.registers.x;
                2
            }
            0x02 => {
                std::mem::swap(&mut self.registers.x, &mut self.registers.y);
                3
            }
            0x22 => {
                std::mem::swap(&mut self.registers.a, &mut self.registers.x);
                3
            }
            0x42 => {
                std::mem::swap(&mut self.registers.a, &mut self.registers.y);
                3
            }
            0x62 => {
                self.registers.a = 0;
                2
            }
            0x82 => {
                self.registers.x = 0;
                2
            }
            0xC2 => {
                self.registers.y = 0;
                2
            }
            // Index arithmetic
            0xE8 => {
                self.registers.x = self.registers.x.wrapping_add(1);
                self.registers.status.set_nz(self.registers.x);
                2
            }
            0xCA => {
                self.registers.x = self.registers.x.wrapping_sub(1);
                self.registers.status.set_nz(self.registers.x);
                2
            }
            0xC8 => {
                self.registers.y = self.registers.y.wrapping_add(1);
                self.registers.status.set_nz(self.registers.y);
                2
            }
            0x88 => {
                self.registers.y = self.registers.y.wrapping_sub(1);
                self.registers.status.set_nz(self.registers.y);
                2
            }
            // Flag operations
            0x18 => {
                self.registers.status.carry = false;
                2
            }
            0x38 => {
                self.registers.status.carry = true;
                2
            }
            0x58 => {
                self.registers.status.interrupt_disable = false;
                2
            }
            0x78 => {
                self.registers.status.interrupt_disable = true;
                2
            }
            0xB8 => {
                self.registers.status.overflow = false;
                2
            }
            0xD8 => {
                self.registers.status.decimal = false;
                2
            }
            0xF8 => {
                self.registers.status.decimal = true;
                2
            }
            0xF4 => {
                self.registers.status.memory_operand = true;
                2
            }
            // Clock speed switch
            0x54 => {
                self.clock_speed = ClockSpeed::Slow;
                3
            }
            0xD4 => {
                self.clock_speed = ClockSpeed::Fast;
                3
            }
            // MMU
            0x43 => {
                // TMA: copy the MPR selected by the (single) mask bit into A
                let mask = self.fetch(bus);
                if let Some(index) = (0..8).find(|&i| mask.bit(i)) {
                    self.registers.a = self.mpr[usize::from(index)];
                }
                4
            }
            0x53 => {
                // TAM: copy A into every MPR selected by the mask
                let mask = self.fetch(bus);
                for i in 0..8 {
                    if mask.bit(i) {
                        self.mpr[usize::from(i)] = self.registers.a;
                    }
                }
                5
            }
            // VDC store shortcuts
            0x03 => {
                let value = self.fetch(bus);
                bus.st0(value);
                4
            }
            0x13 => {
                let value = self.fetch(bus);
                bus.st1(value);
                4
            }
            0x23 => {
                let value = self.fetch(bus);
                bus.st2(value);
                4
            }
            // Block transfers
            0x73 => self.block_transfer(bus, BlockKind::Tii),
            0xC3 => self.block_transfer(bus, BlockKind::Tdd),
            0xD3 => self.block_transfer(bus, BlockKind::Tin),
            0xE3 => self.block_transfer(bus, BlockKind::Tia),
            0xF3 => self.block_transfer(bus, BlockKind::Tai),
            // Stack
            0x48 => {
                self.push(bus, self.registers.a);
                3
            }
            0x68 => {
                self.registers.a = self.pull(bus);
                self.registers.status.set_nz(self.registers.a);
                4
            }
            0xDA => {
                self.push(bus, self.registers.x);
                3
            }
            0xFA => {
                self.registers.x = self.pull(bus);
                self.registers.status.set_nz(self.registers.x);
                4
            }
            0x5A => {
                self.push(bus, self.registers.y);
                3
            }
            0x7A => {
                self.registers.y = self.pull(bus);
                self.registers.status.set_nz(self.registers.y);
                4
            }
            0x08 => {
                let status = self.registers.status.to_byte(true);
                self.push(bus, status);
                3
            }
            0x28 => {
                let status = self.pull(bus);
                self.registers.status = crate::StatusFlags::from_byte(status);
                4
            }
            // Control flow
            0x4C => {
                self.registers.pc = self.fetch_u16(bus);
                4
            }
            0x6C => {
                let pointer = self.fetch_u16(bus);
                let lsb = self.read_log(bus, pointer);
                let msb = self.read_log(bus, pointer.wrapping_add(1));
                self.registers.pc = u16::from_le_bytes([lsb, msb]);
                7
            }
            0x7C => {
                let pointer = self.fetch_u16(bus).wrapping_add(self.registers.x.into());
                let lsb = self.read_log(bus, pointer);
                let msb = self.read_log(bus, pointer.wrapping_add(1));
                self.registers.pc = u16::from_le_bytes([lsb, msb]);
                7
            }
            0x20 => {
                let target = self.fetch_u16(bus);
                let return_addr = self.registers.pc.wrapping_sub(1);
                let [lsb, msb] = return_addr.to_le_bytes();
                self.push(bus, msb);
                self.push(bus, lsb);
                self.registers.pc = target;
                7
            }
            0x44 => {
                // BSR: relative subroutine call
                let offset = self.fetch(bus) as i8;
                let return_addr = self.registers.pc.wrapping_sub(1);
                let [lsb, msb] = return_addr.to_le_bytes();
                self.push(bus, msb);
                self.push(bus, lsb);
                self.registers.pc = self.registers.pc.wrapping_add(offset as u16);
                8
            }
            0x60 => {
                let lsb = self.pull(bus);
                let msb = self.pull(bus);
                self.registers.pc = u16::from_le_bytes([lsb, msb]).wrapping_add(1);
                7
            }
            0x40 => {
                let status = self.pull(bus);
                self.registers.status = crate::StatusFlags::from_byte(status);
                let lsb = self.pull(bus);
                let msb = self.pull(bus);
                self.registers.pc = u16::from_le_bytes([lsb, msb]);
                7
            }
            0x10 => {
                let negative = self.registers.status.negative;
                self.branch(bus, !negative)
            }
            0x30 => {
                let negative = self.registers.status.negative;
                self.branch(bus, negative)
            }
            0x50 => {
                let overflow = self.registers.status.overflow;
                self.branch(bus, !overflow)
            }
            0x70 => {
                let overflow = self.registers.status.overflow;
                self.branch(bus, overflow)
            }
            0x90 => {
                let carry = self.registers.status.carry;
                self.branch(bus, !carry)
            }
            0xB0 => {
                let carry = self.registers.status.carry;
                self.branch(bus, carry)
            }
            0xD0 => {
                let zero = self.registers.status.zero;
                self.branch(bus, !zero)
            }
            0xF0 => {
                let zero = self.registers.status.zero;
                self.branch(bus, zero)
            }
            0x80 => self.branch(bus, true),
            // NOP and the handful of genuinely unused slots
            _ => 2,
        }
    }

    fn block_transfer<B: BusInterface>(&mut self, bus: &mut B, kind: BlockKind) -> u32 {
        let mut source = self.fetch_u16(bus);
        let mut dest = self.fetch_u16(bus);
        let length = self.fetch_u16(bus);
        let length = if length == 0 { 0x10000_u32 } else { u32::from(length) };

        let mut alternate = false;
        for _ in 0..length {
            let value = self.read_log(bus, source);
            self.write_log(bus, dest, value);

            match kind {
                BlockKind::Tii => {
                    source = source.wrapping_add(1);
                    dest = dest.wrapping_add(1);
                }
                BlockKind::Tdd => {
                    source = source.wrapping_sub(1);
                    dest = dest.wrapping_sub(1);
                }
                BlockKind::Tin => {
                    source = source.wrapping_add(1);
                }
                BlockKind::Tia => {
                    source = source.wrapping_add(1);
                    dest = if alternate { dest.wrapping_sub(1) } else { dest.wrapping_add(1) };
                    alternate = !alternate;
                }
                BlockKind::Tai => {
                    source = if alternate { source.wrapping_sub(1) } else { source.wrapping_add(1) };
                    dest = dest.wrapping_add(1);
                    alternate = !alternate;
                }
            }
        }

        17 + 6 * length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Tii,
    Tdd,
    Tin,
    Tia,
    Tai,
}

fn group_one_mode(opcode: u8) -> Mode {
    match opcode & 0x1F {
        0x01 => Mode::IndexedIndirect,
        0x05 => Mode::ZeroPage,
        0x09 => Mode::Immediate,
        0x0D => Mode::Absolute,
        0x11 => Mode::IndirectY,
        0x12 => Mode::Indirect,
        0x15 => Mode::ZeroPageX,
        0x19 => Mode::AbsoluteY,
        0x1D => Mode::AbsoluteX,
        _ => unreachable!("not a group-one addressing mode: {opcode:02X}"),
    }
}

fn rmw_mode(opcode: u8) -> Mode {
    match opcode & 0x1F {
        0x06 => Mode::ZeroPage,
        0x16 => Mode::ZeroPageX,
        0x0E => Mode::Absolute,
        0x1E => Mode::AbsoluteX,
        _ => unreachable!("not an RMW addressing mode: {opcode:02X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq;

    struct TestBus {
        memory: Vec<u8>,
        pending: u8,
    }

    impl TestBus {
        fn new() -> Self {
            Self { memory: vec![0; 1 << 21], pending: 0 }
        }
    }

    impl BusInterface for TestBus {
        fn read(&mut self, address: u32) -> u8 {
            self.memory[address as usize]
        }

        fn write(&mut self, address: u32, value: u8) {
            self.memory[address as usize] = value;
        }

        fn peek(&self, address: u32) -> u8 {
            self.memory[address as usize]
        }

        fn pending_irqs(&self) -> u8 {
            self.pending
        }
    }

    const PROGRAM_START: u16 = 0xE000;

    fn new_cpu(program: &[u8]) -> (HuC6280, TestBus) {
        let mut bus = TestBus::new();
        // MPR7 = 0 at power-on, so logical $E000-$FFFF maps to physical $0000-$1FFF
        let reset_physical = (RESET_VECTOR & 0x1FFF) as usize;
        bus.memory[reset_physical] = (PROGRAM_START & 0xFF) as u8;
        bus.memory[reset_physical + 1] = (PROGRAM_START >> 8) as u8;

        let program_physical = (PROGRAM_START & 0x1FFF) as usize;
        bus.memory[program_physical..program_physical + program.len()].copy_from_slice(program);

        let cpu = HuC6280::new(&mut bus);
        (cpu, bus)
    }

    use crate::RESET_VECTOR;

    fn zp_physical(cpu: &HuC6280, offset: u8) -> usize {
        cpu.translate(0x2000 | u16::from(offset)) as usize
    }

    #[test]
    fn tst_immediate_flags() {
        // TST #$80, $40 with memory $C0: V and N from memory, Z from imm AND memory
        let (mut cpu, mut bus) = new_cpu(&[0x83, 0x80, 0x40]);
        let zp = zp_physical(&cpu, 0x40);
        bus.memory[zp] = 0xC0;
        cpu.execute_instruction(&mut bus);

        assert!(cpu.registers().status.overflow);
        assert!(cpu.registers().status.negative);
        assert!(!cpu.registers().status.zero);
    }

    #[test]
    fn tst_zero_flag_from_mask() {
        let (mut cpu, mut bus) = new_cpu(&[0x83, 0x01, 0x40]);
        let zp = zp_physical(&cpu, 0x40);
        bus.memory[zp] = 0xC0;
        cpu.execute_instruction(&mut bus);

        assert!(cpu.registers().status.zero);
    }

    #[test]
    fn tam_tma_round_trip() {
        // LDA #$55 / TAM #$04 / CLA / TMA #$04
        let (mut cpu, mut bus) = new_cpu(&[0xA9, 0x55, 0x53, 0x04, 0x62, 0x43, 0x04]);
        for _ in 0..4 {
            cpu.execute_instruction(&mut bus);
        }

        assert_eq!(cpu.mpr(2), 0x55);
        assert_eq!(cpu.registers().a, 0x55);
    }

    #[test]
    fn mmu_translation() {
        let (mut cpu, mut bus) = new_cpu(&[0xA9, 0x12, 0x53, 0x08]); // LDA #$12 / TAM #$08
        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);

        // Logical $6000 is page 3, now mapped through MPR3 = $12
        assert_eq!(cpu.translate(0x6000), (0x12 << 13));
        assert_eq!(cpu.translate(0x6FFF), (0x12 << 13) | 0x0FFF);
    }

    #[test]
    fn block_transfer_tii() {
        // TII $2010 -> $2020, length 3
        let (mut cpu, mut bus) = new_cpu(&[0x73, 0x10, 0x20, 0x20, 0x20, 0x03, 0x00]);
        let src = zp_physical(&cpu, 0x10);
        bus.memory[src..src + 3].copy_from_slice(&[0xAA, 0xBB, 0xCC]);

        let cycles = cpu.execute_instruction(&mut bus);

        let dst = zp_physical(&cpu, 0x20);
        assert_eq!(&bus.memory[dst..dst + 3], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(cycles, 17 + 6 * 3);
    }

    #[test]
    fn block_transfer_tia_alternates() {
        // TIA $2010 -> $2020, length 4: destination alternates $2020, $2021, $2020, $2021
        let (mut cpu, mut bus) = new_cpu(&[0xE3, 0x10, 0x20, 0x20, 0x20, 0x04, 0x00]);
        let src = zp_physical(&cpu, 0x10);
        bus.memory[src..src + 4].copy_from_slice(&[1, 2, 3, 4]);

        cpu.execute_instruction(&mut bus);

        let dst = zp_physical(&cpu, 0x20);
        assert_eq!(bus.memory[dst], 3);
        assert_eq!(bus.memory[dst + 1], 4);
    }

    #[test]
    fn t_flag_applies_alu_to_memory() {
        // SET / ORA #$0F with X=$20: ORs into zero-page $20 instead of A
        let (mut cpu, mut bus) = new_cpu(&[0xF4, 0x09, 0x0F]);
        cpu.registers_mut().x = 0x20;
        cpu.registers_mut().a = 0xFF;
        let zp = zp_physical(&cpu, 0x20);
        bus.memory[zp] = 0xF0;

        cpu.execute_instruction(&mut bus); // SET
        assert!(cpu.registers().status.memory_operand);
        cpu.execute_instruction(&mut bus); // ORA

        assert_eq!(bus.memory[zp], 0xFF);
        assert_eq!(cpu.registers().a, 0xFF); // A untouched
        assert!(!cpu.registers().status.memory_operand); // T cleared
    }

    #[test]
    fn speed_switch() {
        let (mut cpu, mut bus) = new_cpu(&[0xD4, 0x54]); // CSH / CSL
        assert_eq!(cpu.clock_speed(), ClockSpeed::Slow);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.clock_speed(), ClockSpeed::Fast);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.clock_speed(), ClockSpeed::Slow);
    }

    #[test]
    fn interrupt_priority_and_vectors() {
        let (mut cpu, mut bus) = new_cpu(&[0x58, 0xEA]); // CLI / NOP
        // Timer vector at logical $FFFA (physical $1FFA with MPR7=0)
        bus.memory[0x1FFA] = 0x34;
        bus.memory[0x1FFB] = 0x12;

        cpu.execute_instruction(&mut bus); // CLI
        bus.pending = irq::TIMER | irq::IRQ1;
        cpu.execute_instruction(&mut bus); // service TIMER (higher priority)

        assert_eq!(cpu.pc(), 0x1234);
        assert!(cpu.registers().status.interrupt_disable);
    }

    #[test]
    fn bsr_pushes_return_address() {
        let (mut cpu, mut bus) = new_cpu(&[0x44, 0x10]);
        let sp_before = cpu.registers().sp;
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.pc(), PROGRAM_START.wrapping_add(2).wrapping_add(0x10));
        assert_eq!(cpu.registers().sp, sp_before.wrapping_sub(2));
    }

    #[test]
    fn swap_and_clear_instructions() {
        let (mut cpu, mut bus) = new_cpu(&[0x02, 0x22, 0x62]); // SXY / SAX / CLA
        cpu.registers_mut().a = 1;
        cpu.registers_mut().x = 2;
        cpu.registers_mut().y = 3;

        cpu.execute_instruction(&mut bus); // SXY
        assert_eq!((cpu.registers().x, cpu.registers().y), (3, 2));

        cpu.execute_instruction(&mut bus); // SAX
        assert_eq!((cpu.registers().a, cpu.registers().x), (3, 1));

        cpu.execute_instruction(&mut bus); // CLA
        assert_eq!(cpu.registers().a, 0);
    }
}

//! Opcode dispatch and execution.
//!
//! Cycle costs are the documented base costs per addressing mode plus the standard penalty
//! rules: +1 per 16-bit memory access (M or X clear), +1 when the direct page register's low
//! byte is non-zero, and +1 on indexed reads that cross a page (always charged for writes and
//! 16-bit index mode).

use crate::{BusInterface, InterruptType, Wdc65816};
use nexen_common::num::{GetBit, U16Ext};

pub(crate) fn execute<B: BusInterface>(cpu: &mut Wdc65816, bus: &mut B) -> u32 {
    let opcode = cpu.fetch(bus);

    log::trace!(
        "Executing {opcode:02X} from {:02X}:{:04X} A={:04X} X={:04X} Y={:04X} S={:04X} D={:04X} DBR={:02X} E={}",
        cpu.registers.pbr,
        cpu.registers.pc.wrapping_sub(1),
        cpu.registers.a,
        cpu.registers.x,
        cpu.registers.y,
        cpu.registers.s,
        cpu.registers.d,
        cpu.registers.dbr,
        cpu.registers.emulation_mode
    );

    cpu.execute_opcode(bus, opcode)
}

/// Hardware interrupt entry. Software interrupts (BRK/COP) go through `software_interrupt`,
/// which additionally advances past the signature byte.
pub(crate) fn service_interrupt<B: BusInterface>(
    cpu: &mut Wdc65816,
    bus: &mut B,
    interrupt: InterruptType,
) -> u32 {
    cpu.interrupt_sequence(bus, interrupt, false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wrap {
    /// 16-bit wrap within bank 0 (direct page and stack accesses)
    Bank0,
    /// Linear 24-bit address space
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Immediate,
    Direct,
    DirectX,
    DirectY,
    DirectIndirect,
    DirectIndexedIndirect,
    DirectIndirectIndexed,
    DirectIndirectLong,
    DirectIndirectLongY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Long,
    LongX,
    StackRelative,
    StackRelativeIndirectY,
}

impl Mode {
    /// Base cycle count for a read-class instruction with an 8-bit memory operand.
    fn base_cycles(self) -> u32 {
        match self {
            Self::Immediate => 2,
            Self::Direct => 3,
            Self::DirectX | Self::DirectY | Self::Absolute | Self::AbsoluteX | Self::AbsoluteY
            | Self::StackRelative => 4,
            Self::DirectIndirect | Self::DirectIndirectIndexed | Self::Long | Self::LongX => 5,
            Self::DirectIndexedIndirect | Self::DirectIndirectLong | Self::DirectIndirectLongY => 6,
            Self::StackRelativeIndirectY => 7,
        }
    }
}

struct Operand {
    address: u32,
    wrap: Wrap,
    extra_cycles: u32,
}

impl Wdc65816 {
    fn m8(&self) -> bool {
        self.registers.p.accumulator_size_8
    }

    fn x8(&self) -> bool {
        self.registers.p.index_size_8
    }

    fn fetch<B: BusInterface>(&mut self, bus: &mut B) -> u8 {
        let address = (u32::from(self.registers.pbr) << 16) | u32::from(self.registers.pc);
        let value = bus.read(address);
        self.registers.pc = self.registers.pc.wrapping_add(1);
        value
    }

    fn fetch_u16<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let lsb = self.fetch(bus);
        let msb = self.fetch(bus);
        u16::from_le_bytes([lsb, msb])
    }

    fn read_u16<B: BusInterface>(&mut self, bus: &mut B, address: u32, wrap: Wrap) -> u16 {
        let lsb = bus.read(address);
        let msb = bus.read(next_address(address, wrap));
        u16::from_le_bytes([lsb, msb])
    }

    fn write_u16<B: BusInterface>(&mut self, bus: &mut B, address: u32, wrap: Wrap, value: u16) {
        bus.write(address, value.lsb());
        bus.write(next_address(address, wrap), value.msb());
    }

    // ===== Stack =====

    fn push<B: BusInterface>(&mut self, bus: &mut B, value: u8) {
        bus.write(self.registers.s.into(), value);
        self.registers.s = self.registers.s.wrapping_sub(1);
        if self.registers.emulation_mode {
            self.registers.s = 0x0100 | (self.registers.s & 0x00FF);
        }
    }

    fn push_u16<B: BusInterface>(&mut self, bus: &mut B, value: u16) {
        self.push(bus, value.msb());
        self.push(bus, value.lsb());
    }

    fn pull<B: BusInterface>(&mut self, bus: &mut B) -> u8 {
        self.registers.s = self.registers.s.wrapping_add(1);
        if self.registers.emulation_mode {
            self.registers.s = 0x0100 | (self.registers.s & 0x00FF);
        }
        bus.read(self.registers.s.into())
    }

    fn pull_u16<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let lsb = self.pull(bus);
        let msb = self.pull(bus);
        u16::from_le_bytes([lsb, msb])
    }

    // ===== Addressing =====

    fn direct_page_address<B: BusInterface>(&mut self, bus: &mut B, index: u16) -> (u16, u32) {
        let offset = self.fetch(bus);
        let d = self.registers.d;
        let dl_penalty = u32::from(d & 0x00FF != 0);

        // With E=1 and DL=0, direct page indexed accesses wrap within the page
        let address = if self.registers.emulation_mode && d & 0x00FF == 0 {
            d | u16::from(offset.wrapping_add(index as u8))
        } else {
            d.wrapping_add(offset.into()).wrapping_add(index)
        };

        (address, dl_penalty)
    }

    fn indexed_penalty(&self, base: u32, indexed: u32, is_write: bool) -> u32 {
        u32::from(is_write || !self.x8() || (base & 0xFFFF00) != (indexed & 0xFFFF00))
    }

    fn operand(&mut self, bus: &mut impl BusInterface, mode: Mode, is_write: bool) -> Operand {
        match mode {
            Mode::Immediate => unreachable!("immediate mode has no address"),
            Mode::Direct => {
                let (address, extra) = self.direct_page_address(bus, 0);
                Operand { address: address.into(), wrap: Wrap::Bank0, extra_cycles: extra }
            }
            Mode::DirectX => {
                let x = self.registers.x;
                let (address, extra) = self.direct_page_address(bus, x);
                Operand { address: address.into(), wrap: Wrap::Bank0, extra_cycles: extra }
            }
            Mode::DirectY => {
                let y = self.registers.y;
                let (address, extra) = self.direct_page_address(bus, y);
                Operand { address: address.into(), wrap: Wrap::Bank0, extra_cycles: extra }
            }
            Mode::DirectIndirect => {
                let (pointer, extra) = self.direct_page_address(bus, 0);
                let target = self.read_u16(bus, pointer.into(), Wrap::Bank0);
                let address = (u32::from(self.registers.dbr) << 16) | u32::from(target);
                Operand { address, wrap: Wrap::Linear, extra_cycles: extra }
            }
            Mode::DirectIndexedIndirect => {
                let x = self.registers.x;
                let (pointer, extra) = self.direct_page_address(bus, x);
                let target = self.read_u16(bus, pointer.into(), Wrap::Bank0);
                let address = (u32::from(self.registers.dbr) << 16) | u32::from(target);
                Operand { address, wrap: Wrap::Linear, extra_cycles: extra }
            }
            Mode::DirectIndirectIndexed => {
                let (pointer, extra) = self.direct_page_address(bus, 0);
                let target = self.read_u16(bus, pointer.into(), Wrap::Bank0);
                let base = (u32::from(self.registers.dbr) << 16) | u32::from(target);
                let address = base.wrapping_add(self.registers.y.into()) & 0xFF_FFFF;
                let penalty = self.indexed_penalty(base, address, is_write);
                Operand { address, wrap: Wrap::Linear, extra_cycles: extra + penalty }
            }
            Mode::DirectIndirectLong => {
                let (pointer, extra) = self.direct_page_address(bus, 0);
                let address = self.read_u24(bus, pointer);
                Operand { address, wrap: Wrap::Linear, extra_cycles: extra }
            }
            Mode::DirectIndirectLongY => {
                let (pointer, extra) = self.direct_page_address(bus, 0);
                let base = self.read_u24(bus, pointer);
                let address = base.wrapping_add(self.registers.y.into()) & 0xFF_FFFF;
                Operand { address, wrap: Wrap::Linear, extra_cycles: extra }
            }
            Mode::Absolute => {
                let offset = self.fetch_u16(bus);
                let address = (u32::from(self.registers.dbr) << 16) | u32::from(offset);
                Operand { address, wrap: Wrap::Linear, extra_cycles: 0 }
            }
            Mode::AbsoluteX => {
                let offset = self.fetch_u16(bus);
                let base = (u32::from(self.registers.dbr) << 16) | u32::from(offset);
                let address = base.wrapping_add(self.registers.x.into()) & 0xFF_FFFF;
                let penalty = self.indexed_penalty(base, address, is_write);
                Operand { address, wrap: Wrap::Linear, extra_cycles: penalty }
            }
            Mode::AbsoluteY => {
                let offset = self.fetch_u16(bus);
                let base = (u32::from(self.registers.dbr) << 16) | u32::from(offset);
                let address = base.wrapping_add(self.registers.y.into()) & 0xFF_FFFF;
                let penalty = self.indexed_penalty(base, address, is_write);
                Operand { address, wrap: Wrap::Linear, extra_cycles: penalty }
            }
            Mode::Long => {
                let address = self.fetch_u24(bus);
                Operand { address, wrap: Wrap::Linear, extra_cycles: 0 }
            }
            Mode::LongX => {
                let base = self.fetch_u24(bus);
                let address = base.wrapping_add(self.registers.x.into()) & 0xFF_FFFF;
                Operand { address, wrap: Wrap::Linear, extra_cycles: 0 }
            }
            Mode::StackRelative => {
                let offset = self.fetch(bus);
                let address = self.registers.s.wrapping_add(offset.into());
                Operand { address: address.into(), wrap: Wrap::Bank0, extra_cycles: 0 }
            }
            Mode::StackRelativeIndirectY => {
                let offset = self.fetch(bus);
                let pointer = self.registers.s.wrapping_add(offset.into());
                let target = self.read_u16(bus, pointer.into(), Wrap::Bank0);
                let base = (u32::from(self.registers.dbr) << 16) | u32::from(target);
                let address = base.wrapping_add(self.registers.y.into()) & 0xFF_FFFF;
                Operand { address, wrap: Wrap::Linear, extra_cycles: 0 }
            }
        }
    }

    fn read_u24<B: BusInterface>(&mut self, bus: &mut B, pointer: u16) -> u32 {
        let low = bus.read(pointer.into());
        let mid = bus.read(pointer.wrapping_add(1).into());
        let high = bus.read(pointer.wrapping_add(2).into());
        u32::from_le_bytes([low, mid, high, 0])
    }

    fn fetch_u24<B: BusInterface>(&mut self, bus: &mut B) -> u32 {
        let low = self.fetch(bus);
        let mid = self.fetch(bus);
        let high = self.fetch(bus);
        u32::from_le_bytes([low, mid, high, 0])
    }

    /// Read a memory operand at the accumulator width; returns (value, total read cycles).
    fn read_operand_m<B: BusInterface>(&mut self, bus: &mut B, mode: Mode) -> (u16, u32) {
        if mode == Mode::Immediate {
            return if self.m8() {
                (self.fetch(bus).into(), 2)
            } else {
                (self.fetch_u16(bus), 3)
            };
        }

        let operand = self.operand(bus, mode, false);
        let width_penalty = u32::from(!self.m8());
        let value = if self.m8() {
            bus.read(operand.address).into()
        } else {
            self.read_u16(bus, operand.address, operand.wrap)
        };

        (value, mode.base_cycles() + operand.extra_cycles + width_penalty)
    }

    fn write_operand_m<B: BusInterface>(&mut self, bus: &mut B, mode: Mode, value: u16) -> u32 {
        let operand = self.operand(bus, mode, true);
        let width_penalty = u32::from(!self.m8());
        if self.m8() {
            bus.write(operand.address, value as u8);
        } else {
            self.write_u16(bus, operand.address, operand.wrap, value);
        }

        mode.base_cycles() + operand.extra_cycles + width_penalty
    }

    fn rmw_operand_m<B: BusInterface>(
        &mut self,
        bus: &mut B,
        mode: Mode,
        op: impl FnOnce(&mut Self, u16) -> u16,
    ) -> u32 {
        let base = match mode {
            Mode::Direct => 5,
            Mode::DirectX | Mode::Absolute => 6,
            Mode::AbsoluteX => 7,
            _ => unreachable!("not an RMW addressing mode"),
        };

        let operand = self.operand(bus, mode, true);
        let width_penalty = 2 * u32::from(!self.m8());
        if self.m8() {
            let value = bus.read(operand.address);
            let result = op(self, value.into()) as u8;
            bus.write(operand.address, result);
        } else {
            let value = self.read_u16(bus, operand.address, operand.wrap);
            let result = op(self, value);
            self.write_u16(bus, operand.address, operand.wrap, result);
        }

        base + operand.extra_cycles + width_penalty
    }

    // ===== Flag helpers =====

    fn set_nz_m(&mut self, value: u16) {
        if self.m8() {
            self.registers.p.negative = (value as u8).bit(7);
            self.registers.p.zero = value as u8 == 0;
        } else {
            self.registers.p.negative = value.bit(15);
            self.registers.p.zero = value == 0;
        }
    }

    fn set_nz_x(&mut self, value: u16) {
        if self.x8() {
            self.registers.p.negative = (value as u8).bit(7);
            self.registers.p.zero = value as u8 == 0;
        } else {
            self.registers.p.negative = value.bit(15);
            self.registers.p.zero = value == 0;
        }
    }

    fn set_nz_16(&mut self, value: u16) {
        self.registers.p.negative = value.bit(15);
        self.registers.p.zero = value == 0;
    }

    fn accumulator_m(&self) -> u16 {
        if self.m8() { self.registers.a & 0x00FF } else { self.registers.a }
    }

    fn set_accumulator_m(&mut self, value: u16) {
        if self.m8() {
            self.registers.a = (self.registers.a & 0xFF00) | (value & 0x00FF);
        } else {
            self.registers.a = value;
        }
        self.set_nz_m(value);
    }

    fn index_mask(&self) -> u16 {
        if self.x8() { 0x00FF } else { 0xFFFF }
    }

    // ===== ALU =====

    fn adc(&mut self, operand: u16) {
        let a = self.accumulator_m();
        let carry_in = u16::from(self.registers.p.carry);

        if self.registers.p.decimal_mode {
            self.adc_decimal(operand);
            return;
        }

        if self.m8() {
            let sum = a + operand + carry_in;
            let result = sum as u8;
            self.registers.p.carry = sum > 0xFF;
            self.registers.p.overflow = (!(a as u8 ^ operand as u8) & (a as u8 ^ result)).bit(7);
            self.set_accumulator_m(result.into());
        } else {
            let sum = u32::from(a) + u32::from(operand) + u32::from(carry_in);
            let result = sum as u16;
            self.registers.p.carry = sum > 0xFFFF;
            self.registers.p.overflow = (!(a ^ operand) & (a ^ result)).bit(15);
            self.set_accumulator_m(result);
        }
    }

    fn adc_decimal(&mut self, operand: u16) {
        let a = self.accumulator_m();
        let digits = if self.m8() { 2 } else { 4 };
        let mut carry = u16::from(self.registers.p.carry);
        let mut result = 0_u16;

        for digit in 0..digits {
            let shift = 4 * digit;
            let mut sum = ((a >> shift) & 0xF) + ((operand >> shift) & 0xF) + carry;
            if sum > 9 {
                sum += 6;
            }
            carry = u16::from(sum > 0xF);
            result |= (sum & 0xF) << shift;
        }

        self.registers.p.carry = carry != 0;
        // V is computed from the binary interpretation
        if self.m8() {
            self.registers.p.overflow =
                (!(a as u8 ^ operand as u8) & (a as u8 ^ result as u8)).bit(7);
        } else {
            self.registers.p.overflow = (!(a ^ operand) & (a ^ result)).bit(15);
        }
        self.set_accumulator_m(result);
    }

    fn sbc(&mut self, operand: u16) {
        if self.registers.p.decimal_mode {
            self.sbc_decimal(operand);
            return;
        }

        // Binary SBC is ADC of the complement at the current width
        let complement = if self.m8() { u16::from(!(operand as u8)) } else { !operand };
        self.adc(complement);
    }

    fn sbc_decimal(&mut self, operand: u16) {
        let a = self.accumulator_m();
        let digits = if self.m8() { 2_u32 } else { 4 };
        let mut borrow = i16::from(!self.registers.p.carry);
        let mut result = 0_u16;

        for digit in 0..digits {
            let shift = 4 * digit;
            let mut diff =
                ((a >> shift) & 0xF) as i16 - ((operand >> shift) & 0xF) as i16 - borrow;
            borrow = 0;
            if diff < 0 {
                diff += 10;
                borrow = 1;
            }
            result |= ((diff as u16) & 0xF) << shift;
        }

        self.registers.p.carry = borrow == 0;
        if self.m8() {
            self.registers.p.overflow =
                ((a as u8 ^ operand as u8) & (a as u8 ^ result as u8)).bit(7);
        } else {
            self.registers.p.overflow = ((a ^ operand) & (a ^ result)).bit(15);
        }
        self.set_accumulator_m(result);
    }

    fn compare_value(&mut self, register: u16, operand: u16, mask: u16) {
        let register = register & mask;
        let operand = operand & mask;
        let result = register.wrapping_sub(operand) & mask;

        self.registers.p.carry = register >= operand;
        if mask == 0x00FF {
            self.registers.p.negative = (result as u8).bit(7);
            self.registers.p.zero = result == 0;
        } else {
            self.registers.p.negative = result.bit(15);
            self.registers.p.zero = result == 0;
        }
    }

    fn asl_value(&mut self, value: u16) -> u16 {
        let (result, carry) = if self.m8() {
            (u16::from((value as u8) << 1), (value as u8).bit(7))
        } else {
            (value << 1, value.bit(15))
        };
        self.registers.p.carry = carry;
        self.set_nz_m(result);
        result
    }

    fn lsr_value(&mut self, value: u16) -> u16 {
        let masked = if self.m8() { value & 0x00FF } else { value };
        self.registers.p.carry = masked.bit(0);
        let result = masked >> 1;
        self.set_nz_m(result);
        result
    }

    fn rol_value(&mut self, value: u16) -> u16 {
        let carry_in = u16::from(self.registers.p.carry);
        let (result, carry) = if self.m8() {
            (u16::from((value as u8) << 1) | carry_in, (value as u8).bit(7))
        } else {
            ((value << 1) | carry_in, value.bit(15))
        };
        self.registers.p.carry = carry;
        self.set_nz_m(result);
        result
    }

    fn ror_value(&mut self, value: u16) -> u16 {
        let masked = if self.m8() { value & 0x00FF } else { value };
        let carry_in = if self.m8() {
            u16::from(self.registers.p.carry) << 7
        } else {
            u16::from(self.registers.p.carry) << 15
        };
        self.registers.p.carry = masked.bit(0);
        let result = (masked >> 1) | carry_in;
        self.set_nz_m(result);
        result
    }

    fn bit_test(&mut self, value: u16) {
        let a = self.accumulator_m();
        self.registers.p.zero = a & value == 0;
        if self.m8() {
            self.registers.p.negative = (value as u8).bit(7);
            self.registers.p.overflow = (value as u8).bit(6);
        } else {
            self.registers.p.negative = value.bit(15);
            self.registers.p.overflow = value.bit(14);
        }
    }

    // ===== Control flow =====

    fn branch<B: BusInterface>(&mut self, bus: &mut B, condition: bool) -> u32 {
        let offset = self.fetch(bus) as i8;
        if !condition {
            return 2;
        }

        let old_pc = self.registers.pc;
        self.registers.pc = old_pc.wrapping_add(offset as u16);

        // Emulation mode charges an extra cycle when the branch crosses a page
        let page_cross_penalty = u32::from(
            self.registers.emulation_mode && (old_pc & 0xFF00) != (self.registers.pc & 0xFF00),
        );
        3 + page_cross_penalty
    }

    fn interrupt_sequence<B: BusInterface>(
        &mut self,
        bus: &mut B,
        interrupt: InterruptType,
        software: bool,
    ) -> u32 {
        if software {
            // BRK and COP carry a signature byte
            self.fetch(bus);
        }

        let emulation = self.registers.emulation_mode;
        if !emulation {
            let pbr = self.registers.pbr;
            self.push(bus, pbr);
        }
        let pc = self.registers.pc;
        self.push_u16(bus, pc);

        let mut status: u8 = self.registers.p.into();
        if emulation {
            // In emulation mode bit 4 distinguishes BRK from hardware IRQ
            if software {
                status |= 0x10;
            } else {
                status &= !0x10;
            }
        }
        self.push(bus, status);

        self.registers.p.irq_disabled = true;
        self.registers.p.decimal_mode = false;
        self.registers.pbr = 0;

        let vector = if emulation {
            interrupt.emulation_vector()
        } else {
            interrupt.native_vector()
        };
        self.registers.pc = self.read_u16(bus, vector.into(), Wrap::Linear);

        if emulation { 7 } else { 8 }
    }

    // ===== Dispatch =====

    #[allow(clippy::match_same_arms)]
    fn execute_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) -> u32 {
        match opcode {
            // BRK / COP
            0x00 => self.interrupt_sequence(bus, InterruptType::Breakpoint, true),
            0x02 => self.interrupt_sequence(bus, InterruptType::Coprocessor, true),
            // ORA / AND / EOR / ADC / LDA / CMP / SBC across the full mode column
            _ if is_group_one(opcode) => {
                let mode = group_one_mode(opcode);
                match opcode & 0xE0 {
                    0x00 => {
                        let (value, cycles) = self.read_operand_m(bus, mode);
                        let result = self.accumulator_m() | value;
                        self.set_accumulator_m(result);
                        cycles
                    }
                    0x20 => {
                        let (value, cycles) = self.read_operand_m(bus, mode);
                        let result = self.accumulator_m() & value;
                        self.set_accumulator_m(result);
                        cycles
                    }
                    0x40 => {
                        let (value, cycles) = self.read_operand_m(bus, mode);
                        let result = self.accumulator_m() ^ value;
                        self.set_accumulator_m(result);
                        cycles
                    }
                    0x60 => {
                        let (value, cycles) = self.read_operand_m(bus, mode);
                        self.adc(value);
                        cycles + u32::from(self.registers.p.decimal_mode)
                    }
                    0x80 => {
                        let a = self.accumulator_m();
                        self.write_operand_m(bus, mode, a)
                    }
                    0xA0 => {
                        let (value, cycles) = self.read_operand_m(bus, mode);
                        self.set_accumulator_m(value);
                        cycles
                    }
                    0xC0 => {
                        let (value, cycles) = self.read_operand_m(bus, mode);
                        let a = self.accumulator_m();
                        let mask = if self.m8() { 0x00FF } else { 0xFFFF };
                        self.compare_value(a, value, mask);
                        cycles
                    }
                    0xE0 => {
                        let (value, cycles) = self.read_operand_m(bus, mode);
                        self.sbc(value);
                        cycles + u32::from(self.registers.p.decimal_mode)
                    }
                    _ => unreachable!("masked to 3 bits"),
                }
            }
            // LDX / LDY / STX / STY / STZ
            0xA2 => {
                let (value, cycles) = self.read_index_immediate(bus);
                self.registers.x = value;
                self.set_nz_x(value);
                cycles
            }
            0xA0 => {
                let (value, cycles) = self.read_index_immediate(bus);
                self.registers.y = value;
                self.set_nz_x(value);
                cycles
            }
            0xA6 | 0xB6 | 0xAE | 0xBE => {
                let mode = match opcode {
                    0xA6 => Mode::Direct,
                    0xB6 => Mode::DirectY,
                    0xAE => Mode::Absolute,
                    _ => Mode::AbsoluteY,
                };
                let (value, cycles) = self.read_operand_x(bus, mode);
                self.registers.x = value;
                self.set_nz_x(value);
                cycles
            }
            0xA4 | 0xB4 | 0xAC | 0xBC => {
                let mode = match opcode {
                    0xA4 => Mode::Direct,
                    0xB4 => Mode::DirectX,
                    0xAC => Mode::Absolute,
                    _ => Mode::AbsoluteX,
                };
                let (value, cycles) = self.read_operand_x(bus, mode);
                self.registers.y = value;
                self.set_nz_x(value);
                cycles
            }
            0x86 | 0x96 | 0x8E => {
                let mode = match opcode {
                    0x86 => Mode::Direct,
                    0x96 => Mode::DirectY,
                    _ => Mode::Absolute,
                };
                let x = self.registers.x;
                self.write_operand_x(bus, mode, x)
            }
            0x84 | 0x94 | 0x8C => {
                let mode = match opcode {
                    0x84 => Mode::Direct,
                    0x94 => Mode::DirectX,
                    _ => Mode::Absolute,
                };
                let y = self.registers.y;
                self.write_operand_x(bus, mode, y)
            }
            0x64 | 0x74 | 0x9C | 0x9E => {
                let mode = match opcode {
                    0x64 => Mode::Direct,
                    0x74 => Mode::DirectX,
                    0x9C => Mode::Absolute,
                    _ => Mode::AbsoluteX,
                };
                self.write_operand_m(bus, mode, 0)
            }
            // CPX / CPY
            0xE0 | 0xE4 | 0xEC => {
                let (value, cycles) = match opcode {
                    0xE0 => self.read_index_immediate(bus),
                    0xE4 => self.read_operand_x(bus, Mode::Direct),
                    _ => self.read_operand_x(bus, Mode::Absolute),
                };
                let x = self.registers.x;
                let mask = self.index_mask();
                self.compare_value(x, value, mask);
                cycles
            }
            0xC0 | 0xC4 | 0xCC => {
                let (value, cycles) = match opcode {
                    0xC0 => self.read_index_immediate(bus),
                    0xC4 => self.read_operand_x(bus, Mode::Direct),
                    _ => self.read_operand_x(bus, Mode::Absolute),
                };
                let y = self.registers.y;
                let mask = self.index_mask();
                self.compare_value(y, value, mask);
                cycles
            }
            // BIT
            0x89 => {
                let (value, cycles) = self.read_operand_m(bus, Mode::Immediate);
                // Immediate BIT only affects Z
                self.registers.p.zero = self.accumulator_m() & value == 0;
                cycles
            }
            0x24 | 0x34 | 0x2C | 0x3C => {
                let mode = match opcode {
                    0x24 => Mode::Direct,
                    0x34 => Mode::DirectX,
                    0x2C => Mode::Absolute,
                    _ => Mode::AbsoluteX,
                };
                let (value, cycles) = self.read_operand_m(bus, mode);
                self.bit_test(value);
                cycles
            }
            // TSB / TRB
            0x04 | 0x0C => {
                let mode = if opcode == 0x04 { Mode::Direct } else { Mode::Absolute };
                self.rmw_operand_m(bus, mode, |cpu, value| {
                    let a = cpu.accumulator_m();
                    cpu.registers.p.zero = a & value == 0;
                    value | a
                })
            }
            0x14 | 0x1C => {
                let mode = if opcode == 0x14 { Mode::Direct } else { Mode::Absolute };
                self.rmw_operand_m(bus, mode, |cpu, value| {
                    let a = cpu.accumulator_m();
                    cpu.registers.p.zero = a & value == 0;
                    value & !a
                })
            }
            // Shifts / rotates
            0x0A => {
                let a = self.accumulator_m();
                let result = self.asl_value(a);
                self.set_accumulator_m(result);
                2
            }
            0x2A => {
                let a = self.accumulator_m();
                let result = self.rol_value(a);
                self.set_accumulator_m(result);
                2
            }
            0x4A => {
                let a = self.accumulator_m();
                let result = self.lsr_value(a);
                self.set_accumulator_m(result);
                2
            }
            0x6A => {
                let a = self.accumulator_m();
                let result = self.ror_value(a);
                self.set_accumulator_m(result);
                2
            }
            0x06 | 0x16 | 0x0E | 0x1E => {
                let mode = rmw_mode(opcode);
                self.rmw_operand_m(bus, mode, Self::asl_value)
            }
            0x26 | 0x36 | 0x2E | 0x3E => {
                let mode = rmw_mode(opcode);
                self.rmw_operand_m(bus, mode, Self::rol_value)
            }
            0x46 | 0x56 | 0x4E | 0x5E => {
                let mode = rmw_mode(opcode);
                self.rmw_operand_m(bus, mode, Self::lsr_value)
            }
            0x66 | 0x76 | 0x6E | 0x7E => {
                let mode = rmw_mode(opcode);
                self.rmw_operand_m(bus, mode, Self::ror_value)
            }
            // INC / DEC
            0x1A => {
                let result = self.accumulator_m().wrapping_add(1);
                self.set_accumulator_m(result);
                2
            }
            0x3A => {
                let result = self.accumulator_m().wrapping_sub(1);
                self.set_accumulator_m(result);
                2
            }
            0xE6 | 0xF6 | 0xEE | 0xFE => {
                let mode = rmw_mode(opcode);
                self.rmw_operand_m(bus, mode, |cpu, value| {
                    let result = if cpu.m8() {
                        u16::from((value as u8).wrapping_add(1))
                    } else {
                        value.wrapping_add(1)
                    };
                    cpu.set_nz_m(result);
                    result
                })
            }
            0xC6 | 0xD6 | 0xCE | 0xDE => {
                let mode = rmw_mode(opcode);
                self.rmw_operand_m(bus, mode, |cpu, value| {
                    let result = if cpu.m8() {
                        u16::from((value as u8).wrapping_sub(1))
                    } else {
                        value.wrapping_sub(1)
                    };
                    cpu.set_nz_m(result);
                    result
                })
            }
            // Index register inc/dec
            0xE8 => {
                self.registers.x = self.registers.x.wrapping_add(1) & self.index_mask();
                let x = self.registers.x;
                self.set_nz_x(x);
                2
            }
            0xCA => {
                self.registers.x = self.registers.x.wrapping_sub(1) & self.index_mask();
                let x = self.registers.x;
                self.set_nz_x(x);
                2
            }
            0xC8 => {
                self.registers.y = self.registers.y.wrapping_add(1) & self.index_mask();
                let y = self.registers.y;
                self.set_nz_x(y);
                2
            }
            0x88 => {
                self.registers.y = self.registers.y.wrapping_sub(1) & self.index_mask();
                let y = self.registers.y;
                self.set_nz_x(y);
                2
            }
            // Register transfers
            0xAA => {
                let value = self.registers.a & self.index_mask();
                self.registers.x = value;
                self.set_nz_x(value);
                2
            }
            0xA8 => {
                let value = self.registers.a & self.index_mask();
                self.registers.y = value;
                self.set_nz_x(value);
                2
            }
            0x8A => {
                let x = self.registers.x;
                self.set_accumulator_m(x);
                2
            }
            0x98 => {
                let y = self.registers.y;
                self.set_accumulator_m(y);
                2
            }
            0x9A => {
                // TXS: no flags; emulation mode forces the stack into page 1
                self.registers.s = if self.registers.emulation_mode {
                    0x0100 | (self.registers.x & 0x00FF)
                } else {
                    self.registers.x
                };
                2
            }
            0xBA => {
                let value = self.registers.s & self.index_mask();
                self.registers.x = value;
                self.set_nz_x(value);
                2
            }
            0x9B => {
                let value = self.registers.x & self.index_mask();
                self.registers.y = value;
                self.set_nz_x(value);
                2
            }
            0xBB => {
                let value = self.registers.y & self.index_mask();
                self.registers.x = value;
                self.set_nz_x(value);
                2
            }
            0x5B => {
                // TCD: always 16-bit
                self.registers.d = self.registers.a;
                let d = self.registers.d;
                self.set_nz_16(d);
                2
            }
            0x7B => {
                self.registers.a = self.registers.d;
                let a = self.registers.a;
                self.set_nz_16(a);
                2
            }
            0x1B => {
                // TCS: no flags
                self.registers.s = if self.registers.emulation_mode {
                    0x0100 | (self.registers.a & 0x00FF)
                } else {
                    self.registers.a
                };
                2
            }
            0x3B => {
                self.registers.a = self.registers.s;
                let a = self.registers.a;
                self.set_nz_16(a);
                2
            }
            0xEB => {
                // XBA: swap accumulator bytes; NZ from the new low byte
                self.registers.a = self.registers.a.rotate_right(8);
                self.registers.p.negative = (self.registers.a as u8).bit(7);
                self.registers.p.zero = self.registers.a as u8 == 0;
                3
            }
            0xFB => {
                // XCE: exchange carry and emulation flags
                let new_emulation = self.registers.p.carry;
                self.registers.p.carry = self.registers.emulation_mode;
                if new_emulation {
                    self.enter_emulation_mode();
                } else {
                    self.registers.emulation_mode = false;
                }
                2
            }
            // Flag operations
            0x18 => {
                self.registers.p.carry = false;
                2
            }
            0x38 => {
                self.registers.p.carry = true;
                2
            }
            0x58 => {
                self.registers.p.irq_disabled = false;
                2
            }
            0x78 => {
                self.registers.p.irq_disabled = true;
                2
            }
            0xB8 => {
                self.registers.p.overflow = false;
                2
            }
            0xD8 => {
                self.registers.p.decimal_mode = false;
                2
            }
            0xF8 => {
                self.registers.p.decimal_mode = true;
                2
            }
            0xC2 => {
                // REP
                let mask = self.fetch(bus);
                let current: u8 = self.registers.p.into();
                self.set_status(current & !mask);
                3
            }
            0xE2 => {
                // SEP
                let mask = self.fetch(bus);
                let current: u8 = self.registers.p.into();
                self.set_status(current | mask);
                3
            }
            // Stack
            0x48 => {
                let a = self.accumulator_m();
                if self.m8() {
                    self.push(bus, a as u8);
                    3
                } else {
                    self.push_u16(bus, a);
                    4
                }
            }
            0x68 => {
                let (value, cycles) = if self.m8() {
                    (u16::from(self.pull(bus)), 4)
                } else {
                    (self.pull_u16(bus), 5)
                };
                self.set_accumulator_m(value);
                cycles
            }
            0xDA => {
                let x = self.registers.x;
                if self.x8() {
                    self.push(bus, x as u8);
                    3
                } else {
                    self.push_u16(bus, x);
                    4
                }
            }
            0xFA => {
                let (value, cycles) = if self.x8() {
                    (u16::from(self.pull(bus)), 4)
                } else {
                    (self.pull_u16(bus), 5)
                };
                self.registers.x = value;
                self.set_nz_x(value);
                cycles
            }
            0x5A => {
                let y = self.registers.y;
                if self.x8() {
                    self.push(bus, y as u8);
                    3
                } else {
                    self.push_u16(bus, y);
                    4
                }
            }
            0x7A => {
                let (value, cycles) = if self.x8() {
                    (u16::from(self.pull(bus)), 4)
                } else {
                    (self.pull_u16(bus), 5)
                };
                self.registers.y = value;
                self.set_nz_x(value);
                cycles
            }
            0x08 => {
                let status: u8 = self.registers.p.into();
                self.push(bus, status);
                3
            }
            0x28 => {
                let status = self.pull(bus);
                self.set_status(status);
                4
            }
            0x8B => {
                let dbr = self.registers.dbr;
                self.push(bus, dbr);
                3
            }
            0xAB => {
                let value = self.pull(bus);
                self.registers.dbr = value;
                self.registers.p.negative = value.bit(7);
                self.registers.p.zero = value == 0;
                4
            }
            0x0B => {
                let d = self.registers.d;
                self.push_u16(bus, d);
                4
            }
            0x2B => {
                let value = self.pull_u16(bus);
                self.registers.d = value;
                self.set_nz_16(value);
                5
            }
            0x4B => {
                let pbr = self.registers.pbr;
                self.push(bus, pbr);
                3
            }
            0xF4 => {
                // PEA
                let value = self.fetch_u16(bus);
                self.push_u16(bus, value);
                5
            }
            0xD4 => {
                // PEI
                let (pointer, extra) = self.direct_page_address(bus, 0);
                let value = self.read_u16(bus, pointer.into(), Wrap::Bank0);
                self.push_u16(bus, value);
                6 + extra
            }
            0x62 => {
                // PER
                let offset = self.fetch_u16(bus);
                let value = self.registers.pc.wrapping_add(offset);
                self.push_u16(bus, value);
                6
            }
            // Jumps and subroutines
            0x4C => {
                self.registers.pc = self.fetch_u16(bus);
                3
            }
            0x5C => {
                // JML long
                let target = self.fetch_u24(bus);
                self.registers.pc = target as u16;
                self.registers.pbr = (target >> 16) as u8;
                4
            }
            0x6C => {
                // JMP (abs): pointer in bank 0
                let pointer = self.fetch_u16(bus);
                self.registers.pc = self.read_u16(bus, pointer.into(), Wrap::Bank0);
                5
            }
            0x7C => {
                // JMP (abs,X): pointer in the program bank
                let pointer = self.fetch_u16(bus).wrapping_add(self.registers.x);
                let address = (u32::from(self.registers.pbr) << 16) | u32::from(pointer);
                self.registers.pc = self.read_u16(bus, address, Wrap::Linear);
                6
            }
            0xDC => {
                // JML (abs): 24-bit pointer in bank 0
                let pointer = self.fetch_u16(bus);
                let target = self.read_u24(bus, pointer);
                self.registers.pc = target as u16;
                self.registers.pbr = (target >> 16) as u8;
                6
            }
            0x20 => {
                let target = self.fetch_u16(bus);
                let return_addr = self.registers.pc.wrapping_sub(1);
                self.push_u16(bus, return_addr);
                self.registers.pc = target;
                6
            }
            0xFC => {
                // JSR (abs,X)
                let return_addr = self.registers.pc.wrapping_add(1);
                let pointer = self.fetch_u16(bus).wrapping_add(self.registers.x);
                self.push_u16(bus, return_addr);
                let address = (u32::from(self.registers.pbr) << 16) | u32::from(pointer);
                self.registers.pc = self.read_u16(bus, address, Wrap::Linear);
                8
            }
            0x22 => {
                // JSL
                let target = self.fetch_u24(bus);
                let pbr = self.registers.pbr;
                self.push(bus, pbr);
                let return_addr = self.registers.pc.wrapping_sub(1);
                self.push_u16(bus, return_addr);
                self.registers.pc = target as u16;
                self.registers.pbr = (target >> 16) as u8;
                8
            }
            0x60 => {
                self.registers.pc = self.pull_u16(bus).wrapping_add(1);
                6
            }
            0x6B => {
                // RTL
                self.registers.pc = self.pull_u16(bus).wrapping_add(1);
                self.registers.pbr = self.pull(bus);
                6
            }
            0x40 => {
                // RTI
                let status = self.pull(bus);
                self.set_status(status);
                self.registers.pc = self.pull_u16(bus);
                if self.registers.emulation_mode {
                    6
                } else {
                    self.registers.pbr = self.pull(bus);
                    7
                }
            }
            // Branches
            0x10 => {
                let negative = self.registers.p.negative;
                self.branch(bus, !negative)
            }
            0x30 => {
                let negative = self.registers.p.negative;
                self.branch(bus, negative)
            }
            0x50 => {
                let overflow = self.registers.p.overflow;
                self.branch(bus, !overflow)
            }
            0x70 => {
                let overflow = self.registers.p.overflow;
                self.branch(bus, overflow)
            }
            0x90 => {
                let carry = self.registers.p.carry;
                self.branch(bus, !carry)
            }
            0xB0 => {
                let carry = self.registers.p.carry;
                self.branch(bus, carry)
            }
            0xD0 => {
                let zero = self.registers.p.zero;
                self.branch(bus, !zero)
            }
            0xF0 => {
                let zero = self.registers.p.zero;
                self.branch(bus, zero)
            }
            0x80 => self.branch(bus, true),
            0x82 => {
                // BRL
                let offset = self.fetch_u16(bus);
                self.registers.pc = self.registers.pc.wrapping_add(offset);
                4
            }
            // Block moves: one byte per execution; PC rewinds until the count in A runs out
            0x54 | 0x44 => {
                let dest_bank = self.fetch(bus);
                let source_bank = self.fetch(bus);
                self.registers.dbr = dest_bank;

                let source =
                    (u32::from(source_bank) << 16) | u32::from(self.registers.x & self.index_mask());
                let dest =
                    (u32::from(dest_bank) << 16) | u32::from(self.registers.y & self.index_mask());
                let value = bus.read(source);
                bus.write(dest, value);

                let mask = self.index_mask();
                if opcode == 0x54 {
                    // MVN increments
                    self.registers.x = self.registers.x.wrapping_add(1) & mask;
                    self.registers.y = self.registers.y.wrapping_add(1) & mask;
                } else {
                    self.registers.x = self.registers.x.wrapping_sub(1) & mask;
                    self.registers.y = self.registers.y.wrapping_sub(1) & mask;
                }

                self.registers.a = self.registers.a.wrapping_sub(1);
                if self.registers.a != 0xFFFF {
                    self.registers.pc = self.registers.pc.wrapping_sub(3);
                }
                7
            }
            // WAI / STP / NOP / WDM
            0xCB => {
                self.waiting = true;
                3
            }
            0xDB => {
                self.stopped = true;
                3
            }
            0xEA => 2,
            0x42 => {
                // WDM: reserved 2-byte NOP
                self.fetch(bus);
                2
            }
            _ => unreachable!("all 256 opcodes are covered: {opcode:02X}"),
        }
    }

    fn set_status(&mut self, value: u8) {
        self.registers.p = value.into();
        if self.registers.emulation_mode {
            self.registers.p.accumulator_size_8 = true;
            self.registers.p.index_size_8 = true;
        }
        if self.registers.p.index_size_8 {
            self.registers.x &= 0x00FF;
            self.registers.y &= 0x00FF;
        }
    }

    fn read_index_immediate<B: BusInterface>(&mut self, bus: &mut B) -> (u16, u32) {
        if self.x8() {
            (self.fetch(bus).into(), 2)
        } else {
            (self.fetch_u16(bus), 3)
        }
    }

    fn read_operand_x<B: BusInterface>(&mut self, bus: &mut B, mode: Mode) -> (u16, u32) {
        let operand = self.operand(bus, mode, false);
        let width_penalty = u32::from(!self.x8());
        let value = if self.x8() {
            bus.read(operand.address).into()
        } else {
            self.read_u16(bus, operand.address, operand.wrap)
        };
        (value, mode.base_cycles() + operand.extra_cycles + width_penalty)
    }

    fn write_operand_x<B: BusInterface>(&mut self, bus: &mut B, mode: Mode, value: u16) -> u32 {
        let operand = self.operand(bus, mode, true);
        let width_penalty = u32::from(!self.x8());
        if self.x8() {
            bus.write(operand.address, value as u8);
        } else {
            self.write_u16(bus, operand.address, operand.wrap, value);
        }
        mode.base_cycles() + operand.extra_cycles + width_penalty
    }
}

fn next_address(address: u32, wrap: Wrap) -> u32 {
    match wrap {
        Wrap::Bank0 => u32::from((address as u16).wrapping_add(1)),
        Wrap::Linear => address.wrapping_add(1) & 0xFF_FFFF,
    }
}

/// The 15 addressing-mode columns shared by the 8 primary ALU ops (ORA/AND/EOR/ADC/STA/LDA/
/// CMP/SBC). The only carve-out in the matrix is $89 (BIT immediate).
fn is_group_one(opcode: u8) -> bool {
    matches!(
        opcode & 0x1F,
        0x01 | 0x03 | 0x05 | 0x07 | 0x09 | 0x0D | 0x0F | 0x11 | 0x12 | 0x13 | 0x15 | 0x17 | 0x19
            | 0x1D | 0x1F
    ) && opcode != 0x89
}

fn group_one_mode(opcode: u8) -> Mode {
    match opcode & 0x1F {
        0x01 => Mode::DirectIndexedIndirect,
        0x03 => Mode::StackRelative,
        0x05 => Mode::Direct,
        0x07 => Mode::DirectIndirectLong,
        0x09 => Mode::Immediate,
        0x0D => Mode::Absolute,
        0x0F => Mode::Long,
        0x11 => Mode::DirectIndirectIndexed,
        0x12 => Mode::DirectIndirect,
        0x13 => Mode::StackRelativeIndirectY,
        0x15 => Mode::DirectX,
        0x17 => Mode::DirectIndirectLongY,
        0x19 => Mode::AbsoluteY,
        0x1D => Mode::AbsoluteX,
        0x1F => Mode::LongX,
        _ => unreachable!("not a group-one addressing mode: {opcode:02X}"),
    }
}

fn rmw_mode(opcode: u8) -> Mode {
    match opcode & 0x1F {
        0x06 => Mode::Direct,
        0x16 => Mode::DirectX,
        0x0E => Mode::Absolute,
        0x1E => Mode::AbsoluteX,
        _ => unreachable!("not an RMW addressing mode: {opcode:02X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RESET_VECTOR;

    struct TestBus {
        memory: Vec<u8>,
        nmi: bool,
        irq: bool,
    }

    impl TestBus {
        fn new() -> Self {
            Self { memory: vec![0; 1 << 24], nmi: false, irq: false }
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

        fn nmi(&self) -> bool {
            self.nmi
        }

        fn irq(&self) -> bool {
            self.irq
        }
    }

    const PROGRAM_START: u16 = 0x8000;

    fn new_cpu(program: &[u8]) -> (Wdc65816, TestBus) {
        let mut bus = TestBus::new();
        bus.memory[RESET_VECTOR as usize] = (PROGRAM_START & 0xFF) as u8;
        bus.memory[RESET_VECTOR as usize + 1] = (PROGRAM_START >> 8) as u8;
        bus.memory[PROGRAM_START as usize..PROGRAM_START as usize + program.len()]
            .copy_from_slice(program);

        let cpu = Wdc65816::new(&mut bus);
        (cpu, bus)
    }

    fn enter_native(cpu: &mut Wdc65816, bus: &mut TestBus, program: &[u8]) {
        // CLC / XCE
        let pc = cpu.registers().pc as usize;
        bus.memory[pc..pc + 2].copy_from_slice(&[0x18, 0xFB]);
        cpu.execute_instruction(bus);
        cpu.execute_instruction(bus);
        assert!(!cpu.registers().emulation_mode);

        let pc = cpu.registers().pc as usize;
        bus.memory[pc..pc + program.len()].copy_from_slice(program);
    }

    #[test]
    fn powers_on_in_emulation_mode() {
        let (cpu, _) = new_cpu(&[]);
        assert!(cpu.registers().emulation_mode);
        assert!(cpu.registers().p.accumulator_size_8);
        assert!(cpu.registers().p.index_size_8);
        assert_eq!(cpu.registers().s & 0xFF00, 0x0100);
    }

    #[test]
    fn xce_switches_to_native_mode() {
        let (mut cpu, mut bus) = new_cpu(&[0x18, 0xFB]); // CLC / XCE
        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);

        assert!(!cpu.registers().emulation_mode);
        assert!(cpu.registers().p.carry); // old emulation flag
        // M/X remain 8-bit until REP
        assert!(cpu.registers().p.accumulator_size_8);
    }

    #[test]
    fn rep_enables_16_bit_accumulator() {
        let (mut cpu, mut bus) = new_cpu(&[]);
        enter_native(&mut cpu, &mut bus, &[0xC2, 0x30, 0xA9, 0x34, 0x12]); // REP #$30 / LDA #$1234

        cpu.execute_instruction(&mut bus);
        assert!(!cpu.registers().p.accumulator_size_8);
        assert!(!cpu.registers().p.index_size_8);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().a, 0x1234);
        assert!(!cpu.registers().p.negative);
        assert!(!cpu.registers().p.zero);
    }

    #[test]
    fn rep_in_emulation_mode_cannot_clear_m_x() {
        let (mut cpu, mut bus) = new_cpu(&[0xC2, 0x30]);
        cpu.execute_instruction(&mut bus);
        assert!(cpu.registers().p.accumulator_size_8);
        assert!(cpu.registers().p.index_size_8);
    }

    #[test]
    fn adc_16_bit() {
        let (mut cpu, mut bus) = new_cpu(&[]);
        enter_native(&mut cpu, &mut bus, &[0xC2, 0x20, 0xA9, 0x50, 0x50, 0x69, 0x50, 0x50]);

        cpu.execute_instruction(&mut bus); // REP #$20
        cpu.execute_instruction(&mut bus); // LDA #$5050
        cpu.execute_instruction(&mut bus); // ADC #$5050

        assert_eq!(cpu.registers().a, 0xA0A0);
        assert!(cpu.registers().p.overflow);
        assert!(cpu.registers().p.negative);
        assert!(!cpu.registers().p.carry);
    }

    #[test]
    fn emulation_stack_wraps_within_page_one() {
        let (mut cpu, mut bus) = new_cpu(&[0x48]); // PHA
        cpu.registers_mut().s = 0x0100;
        cpu.registers_mut().a = 0xAB;
        cpu.execute_instruction(&mut bus);

        assert_eq!(bus.memory[0x0100], 0xAB);
        assert_eq!(cpu.registers().s, 0x01FF);
    }

    #[test]
    fn direct_page_addressing_uses_d_register() {
        let (mut cpu, mut bus) = new_cpu(&[0xA5, 0x10]); // LDA $10
        cpu.registers_mut().d = 0x1200;
        bus.memory[0x1210] = 0x42;

        let cycles = cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().a & 0xFF, 0x42);
        // 3 base + 1 for non-zero D... low byte is zero here, so exactly 3? D=$1200 has DL=0
        assert_eq!(cycles, 3);

        // Non-zero DL costs one extra cycle
        let (mut cpu, mut bus) = new_cpu(&[0xA5, 0x10]);
        cpu.registers_mut().d = 0x1201;
        bus.memory[0x1211] = 0x55;
        let cycles = cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().a & 0xFF, 0x55);
        assert_eq!(cycles, 4);
    }

    #[test]
    fn long_addressing() {
        let (mut cpu, mut bus) = new_cpu(&[0xAF, 0x56, 0x34, 0x12]); // LDA $123456
        bus.memory[0x123456] = 0x77;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().a & 0xFF, 0x77);
    }

    #[test]
    fn jsl_rtl_round_trip() {
        let (mut cpu, mut bus) = new_cpu(&[0x22, 0x00, 0x90, 0x02]); // JSL $029000
        bus.memory[0x029000] = 0x6B; // RTL

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().pbr, 0x02);
        assert_eq!(cpu.registers().pc, 0x9000);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().pbr, 0x00);
        assert_eq!(cpu.registers().pc, PROGRAM_START + 4);
    }

    #[test]
    fn mvn_block_move() {
        let (mut cpu, mut bus) = new_cpu(&[]);
        enter_native(&mut cpu, &mut bus, &[0xC2, 0x30, 0x54, 0x00, 0x7E]); // REP #$30 / MVN $7E,$00
        cpu.execute_instruction(&mut bus); // REP

        cpu.registers_mut().a = 2; // move 3 bytes
        cpu.registers_mut().x = 0x1000;
        cpu.registers_mut().y = 0x2000;
        bus.memory[0x7E1000..0x7E1003].copy_from_slice(&[0xAA, 0xBB, 0xCC]);

        // One byte per instruction execution
        for _ in 0..3 {
            cpu.execute_instruction(&mut bus);
        }

        assert_eq!(&bus.memory[0x2000..0x2003], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(cpu.registers().a, 0xFFFF);
        assert_eq!(cpu.registers().x, 0x1003);
        assert_eq!(cpu.registers().y, 0x2003);
    }

    #[test]
    fn wai_wakes_on_irq_with_interrupts_disabled() {
        let (mut cpu, mut bus) = new_cpu(&[0x78, 0xCB, 0xEA]); // SEI / WAI / NOP
        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);
        assert!(cpu.waiting());

        let pc = cpu.pc();
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), pc); // still waiting

        bus.irq = true;
        cpu.execute_instruction(&mut bus); // wakes and executes NOP without vectoring
        assert!(!cpu.waiting());
        assert_eq!(cpu.pc(), pc + 1);
    }

    #[test]
    fn stp_halts_until_reset() {
        let (mut cpu, mut bus) = new_cpu(&[0xDB, 0xEA]); // STP
        cpu.execute_instruction(&mut bus);
        assert!(cpu.stopped());

        let pc = cpu.pc();
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), pc);

        cpu.reset(&mut bus);
        assert!(!cpu.stopped());
    }

    #[test]
    fn native_mode_interrupt_pushes_pbr_and_uses_native_vector() {
        let (mut cpu, mut bus) = new_cpu(&[]);
        enter_native(&mut cpu, &mut bus, &[0x58, 0xEA, 0xEA]); // CLI / NOP / NOP
        bus.memory[0xFFEE] = 0x00;
        bus.memory[0xFFEF] = 0x60;

        cpu.execute_instruction(&mut bus); // CLI
        bus.irq = true;
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.registers().pc, 0x6000);
        assert_eq!(cpu.registers().pbr, 0);
        assert!(cpu.registers().p.irq_disabled);
    }

    #[test]
    fn brk_in_emulation_mode_uses_emulation_vector() {
        let (mut cpu, mut bus) = new_cpu(&[0x00, 0xFF]);
        bus.memory[0xFFFE] = 0x00;
        bus.memory[0xFFFF] = 0x50;

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().pc, 0x5000);

        // Pushed status byte has bit 4 set to mark BRK
        let s = cpu.registers().s;
        let pushed_status = bus.memory[usize::from(s) + 1];
        assert_ne!(pushed_status & 0x10, 0);
    }

    #[test]
    fn index_registers_truncate_when_x_set() {
        let (mut cpu, mut bus) = new_cpu(&[]);
        enter_native(&mut cpu, &mut bus, &[0xC2, 0x10, 0xA2, 0x34, 0x12, 0xE2, 0x10]);

        cpu.execute_instruction(&mut bus); // REP #$10
        cpu.execute_instruction(&mut bus); // LDX #$1234
        assert_eq!(cpu.registers().x, 0x1234);

        cpu.execute_instruction(&mut bus); // SEP #$10
        assert_eq!(cpu.registers().x, 0x0034);
    }
}

//! Opcode decoding and execution, including the CB/DD/ED/FD prefix spaces and the undocumented
//! instructions that shipped silicon actually executes (SLL, IXH/IXL register access, DDCB
//! store-back).
//!
//! Every executor returns the instruction's T-cycle count; prefix fetches add 4 each.

use crate::registers::{Flags, IndexRegister, InterruptMode, Registers};
use crate::traits::{BusInterface, InterruptLine};
use nexen_common::num::GetBit;

fn parity(value: u8) -> bool {
    value.count_ones() % 2 == 0
}

// ===== 8-bit ALU primitives =====

fn add8(a: u8, operand: u8, carry_in: bool, flags: &mut Flags) -> u8 {
    let carry_in = u8::from(carry_in);
    let sum = u16::from(a) + u16::from(operand) + u16::from(carry_in);
    let result = sum as u8;

    flags.sign = result.bit(7);
    flags.zero = result == 0;
    flags.half_carry = (a & 0x0F) + (operand & 0x0F) + carry_in > 0x0F;
    flags.overflow = (!(a ^ operand) & (a ^ result)).bit(7);
    flags.subtract = false;
    flags.carry = sum > 0xFF;
    flags.set_xy(result);

    result
}

fn sub8(a: u8, operand: u8, carry_in: bool, flags: &mut Flags) -> u8 {
    let carry_in = u8::from(carry_in);
    let diff = i16::from(a) - i16::from(operand) - i16::from(carry_in);
    let result = diff as u8;

    flags.sign = result.bit(7);
    flags.zero = result == 0;
    flags.half_carry = (a & 0x0F) < (operand & 0x0F) + carry_in;
    flags.overflow = ((a ^ operand) & (a ^ result)).bit(7);
    flags.subtract = true;
    flags.carry = diff < 0;
    flags.set_xy(result);

    result
}

fn and8(a: u8, operand: u8, flags: &mut Flags) -> u8 {
    let result = a & operand;
    logic_flags(result, flags);
    flags.half_carry = true;
    result
}

fn or8(a: u8, operand: u8, flags: &mut Flags) -> u8 {
    let result = a | operand;
    logic_flags(result, flags);
    result
}

fn xor8(a: u8, operand: u8, flags: &mut Flags) -> u8 {
    let result = a ^ operand;
    logic_flags(result, flags);
    result
}

fn logic_flags(result: u8, flags: &mut Flags) {
    flags.sign = result.bit(7);
    flags.zero = result == 0;
    flags.half_carry = false;
    flags.overflow = parity(result);
    flags.subtract = false;
    flags.carry = false;
    flags.set_xy(result);
}

fn inc8(value: u8, flags: &mut Flags) -> u8 {
    let result = value.wrapping_add(1);
    flags.sign = result.bit(7);
    flags.zero = result == 0;
    flags.half_carry = value & 0x0F == 0x0F;
    flags.overflow = value == 0x7F;
    flags.subtract = false;
    flags.set_xy(result);
    result
}

fn dec8(value: u8, flags: &mut Flags) -> u8 {
    let result = value.wrapping_sub(1);
    flags.sign = result.bit(7);
    flags.zero = result == 0;
    flags.half_carry = value & 0x0F == 0x00;
    flags.overflow = value == 0x80;
    flags.subtract = true;
    flags.set_xy(result);
    result
}

// ===== Rotate / shift primitives (CB space) =====

fn rlc(value: u8, flags: &mut Flags) -> u8 {
    let result = value.rotate_left(1);
    shift_flags(result, value.bit(7), flags);
    result
}

fn rrc(value: u8, flags: &mut Flags) -> u8 {
    let result = value.rotate_right(1);
    shift_flags(result, value.bit(0), flags);
    result
}

fn rl(value: u8, flags: &mut Flags) -> u8 {
    let result = (value << 1) | u8::from(flags.carry);
    shift_flags(result, value.bit(7), flags);
    result
}

fn rr(value: u8, flags: &mut Flags) -> u8 {
    let result = (value >> 1) | (u8::from(flags.carry) << 7);
    shift_flags(result, value.bit(0), flags);
    result
}

fn sla(value: u8, flags: &mut Flags) -> u8 {
    let result = value << 1;
    shift_flags(result, value.bit(7), flags);
    result
}

fn sra(value: u8, flags: &mut Flags) -> u8 {
    let result = ((value as i8) >> 1) as u8;
    shift_flags(result, value.bit(0), flags);
    result
}

// Undocumented: shift left, shifting in a 1
fn sll(value: u8, flags: &mut Flags) -> u8 {
    let result = (value << 1) | 0x01;
    shift_flags(result, value.bit(7), flags);
    result
}

fn srl(value: u8, flags: &mut Flags) -> u8 {
    let result = value >> 1;
    shift_flags(result, value.bit(0), flags);
    result
}

fn shift_flags(result: u8, carry: bool, flags: &mut Flags) {
    flags.sign = result.bit(7);
    flags.zero = result == 0;
    flags.half_carry = false;
    flags.overflow = parity(result);
    flags.subtract = false;
    flags.carry = carry;
    flags.set_xy(result);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockMode {
    Increment,
    Decrement,
}

impl BlockMode {
    fn apply(self, value: u16) -> u16 {
        match self {
            Self::Increment => value.wrapping_add(1),
            Self::Decrement => value.wrapping_sub(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptType {
    Nmi,
    Int,
}

struct Runner<'a, B> {
    regs: &'a mut Registers,
    bus: &'a mut B,
}

pub(crate) fn execute<B: BusInterface>(registers: &mut Registers, bus: &mut B) -> u32 {
    Runner { regs: registers, bus }.run()
}

impl<B: BusInterface> Runner<'_, B> {
    fn run(&mut self) -> u32 {
        let interrupt = self.check_pending_interrupt();
        self.regs.ei_delay = false;
        self.regs.last_nmi = self.bus.nmi();

        if let Some(interrupt) = interrupt {
            return self.interrupt_service_routine(interrupt);
        }

        if self.regs.halted {
            self.refresh();
            return 4;
        }

        let mut index = None;
        let mut prefix_cycles = 0;
        let opcode = loop {
            let opcode = self.fetch();
            self.refresh();
            match opcode {
                0xDD => {
                    index = Some(IndexRegister::IX);
                    prefix_cycles += 4;
                }
                0xFD => {
                    index = Some(IndexRegister::IY);
                    prefix_cycles += 4;
                }
                _ => break opcode,
            }
        };

        log::trace!(
            "PC={:04X} opcode={opcode:02X} index={index:?} AF={:04X} BC={:04X} DE={:04X} HL={:04X} SP={:04X}",
            self.regs.pc.wrapping_sub(1),
            self.regs.af(),
            self.regs.bc(),
            self.regs.de(),
            self.regs.hl(),
            self.regs.sp
        );

        prefix_cycles + self.execute_opcode(opcode, index)
    }

    fn check_pending_interrupt(&self) -> Option<InterruptType> {
        if self.bus.nmi() == InterruptLine::Low && self.regs.last_nmi == InterruptLine::High {
            Some(InterruptType::Nmi)
        } else if !self.regs.ei_delay && self.regs.iff1 && self.bus.int() == InterruptLine::Low {
            Some(InterruptType::Int)
        } else {
            None
        }
    }

    fn interrupt_service_routine(&mut self, interrupt: InterruptType) -> u32 {
        self.regs.halted = false;
        self.refresh();

        match interrupt {
            InterruptType::Nmi => {
                // NMI preserves IFF2 so RETN can restore the interrupt enable state
                self.regs.iff1 = false;
                let pc = self.regs.pc;
                self.push(pc);
                self.regs.pc = 0x0066;
                11
            }
            InterruptType::Int => {
                self.regs.iff1 = false;
                self.regs.iff2 = false;

                match self.regs.interrupt_mode {
                    // In mode 0 the device drives an opcode onto the bus; with nothing driving
                    // it the CPU sees $FF, which is RST $38, making modes 0 and 1 equivalent on
                    // the consoles emulated here
                    InterruptMode::Mode0 | InterruptMode::Mode1 => {
                        let pc = self.regs.pc;
                        self.push(pc);
                        self.regs.pc = 0x0038;
                        13
                    }
                    InterruptMode::Mode2 => {
                        let pc = self.regs.pc;
                        self.push(pc);
                        let pointer =
                            (u16::from(self.regs.i) << 8) | u16::from(self.bus.int_vector());
                        self.regs.pc = self.read_u16(pointer);
                        19
                    }
                }
            }
        }
    }

    fn refresh(&mut self) {
        self.regs.r = (self.regs.r.wrapping_add(1) & 0x7F) | (self.regs.r & 0x80);
    }

    // ===== Fetch / memory / stack helpers =====

    fn fetch(&mut self) -> u8 {
        let value = self.bus.read_memory(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_u16(&mut self) -> u16 {
        let lsb = self.fetch();
        let msb = self.fetch();
        u16::from_le_bytes([lsb, msb])
    }

    fn read_u16(&mut self, address: u16) -> u16 {
        let lsb = self.bus.read_memory(address);
        let msb = self.bus.read_memory(address.wrapping_add(1));
        u16::from_le_bytes([lsb, msb])
    }

    fn write_u16(&mut self, address: u16, value: u16) {
        let [lsb, msb] = value.to_le_bytes();
        self.bus.write_memory(address, lsb);
        self.bus.write_memory(address.wrapping_add(1), msb);
    }

    fn push(&mut self, value: u16) {
        let [lsb, msb] = value.to_le_bytes();
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.bus.write_memory(self.regs.sp, msb);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.bus.write_memory(self.regs.sp, lsb);
    }

    fn pop(&mut self) -> u16 {
        let lsb = self.bus.read_memory(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        let msb = self.bus.read_memory(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        u16::from_le_bytes([lsb, msb])
    }

    // ===== Register field decoding =====

    /// Read the 8-bit register encoded in bits 2-0 (or 5-3 when pre-shifted). H and L map to
    /// IXH/IXL/IYH/IYL when an index prefix is active. Code 6 is the (HL) slot and must be
    /// handled by the caller.
    fn read_r(&mut self, code: u8, index: Option<IndexRegister>) -> u8 {
        match code & 0x07 {
            0x00 => self.regs.b,
            0x01 => self.regs.c,
            0x02 => self.regs.d,
            0x03 => self.regs.e,
            0x04 => match index {
                None => self.regs.h,
                Some(idx) => (idx.read(self.regs) >> 8) as u8,
            },
            0x05 => match index {
                None => self.regs.l,
                Some(idx) => idx.read(self.regs) as u8,
            },
            0x07 => self.regs.a,
            _ => unreachable!("(HL) slot handled by callers"),
        }
    }

    fn write_r(&mut self, code: u8, index: Option<IndexRegister>, value: u8) {
        match code & 0x07 {
            0x00 => self.regs.b = value,
            0x01 => self.regs.c = value,
            0x02 => self.regs.d = value,
            0x03 => self.regs.e = value,
            0x04 => match index {
                None => self.regs.h = value,
                Some(idx) => {
                    let current = idx.read(self.regs);
                    idx.write(self.regs, (current & 0x00FF) | (u16::from(value) << 8));
                }
            },
            0x05 => match index {
                None => self.regs.l = value,
                Some(idx) => {
                    let current = idx.read(self.regs);
                    idx.write(self.regs, (current & 0xFF00) | u16::from(value));
                }
            },
            0x07 => self.regs.a = value,
            _ => unreachable!("(HL) slot handled by callers"),
        }
    }

    /// Read the 16-bit register pair encoded in bits 5-4, with HL replaced by IX/IY under a
    /// prefix. `use_af` selects the PUSH/POP encoding where slot 3 is AF instead of SP.
    fn read_rr(&self, code: u8, index: Option<IndexRegister>, use_af: bool) -> u16 {
        match code & 0x30 {
            0x00 => self.regs.bc(),
            0x10 => self.regs.de(),
            0x20 => index.map_or_else(|| self.regs.hl(), |idx| idx.read(self.regs)),
            0x30 => {
                if use_af {
                    self.regs.af()
                } else {
                    self.regs.sp
                }
            }
            _ => unreachable!("masked to 2 bits"),
        }
    }

    fn write_rr(&mut self, code: u8, index: Option<IndexRegister>, use_af: bool, value: u16) {
        match code & 0x30 {
            0x00 => self.regs.set_bc(value),
            0x10 => self.regs.set_de(value),
            0x20 => match index {
                None => self.regs.set_hl(value),
                Some(idx) => idx.write(self.regs, value),
            },
            0x30 => {
                if use_af {
                    self.regs.set_af(value);
                } else {
                    self.regs.sp = value;
                }
            }
            _ => unreachable!("masked to 2 bits"),
        }
    }

    /// Resolve the (HL) slot: plain HL, or IX+d / IY+d with the displacement fetched from the
    /// instruction stream.
    fn hl_address(&mut self, index: Option<IndexRegister>) -> u16 {
        match index {
            None => self.regs.hl(),
            Some(idx) => {
                let displacement = self.fetch() as i8;
                idx.read(self.regs).wrapping_add(displacement as u16)
            }
        }
    }

    fn condition(&self, code: u8) -> bool {
        match (code >> 3) & 0x07 {
            0x00 => !self.regs.f.zero,
            0x01 => self.regs.f.zero,
            0x02 => !self.regs.f.carry,
            0x03 => self.regs.f.carry,
            0x04 => !self.regs.f.overflow,
            0x05 => self.regs.f.overflow,
            0x06 => !self.regs.f.sign,
            0x07 => self.regs.f.sign,
            _ => unreachable!("masked to 3 bits"),
        }
    }

    // ===== Main opcode space =====

    #[allow(clippy::match_same_arms)]
    fn execute_opcode(&mut self, opcode: u8, index: Option<IndexRegister>) -> u32 {
        match opcode {
            0x00 => 4,
            // LD rr, nn
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch_u16();
                self.write_rr(opcode, index, false, value);
                10
            }
            // LD (BC)/(DE), A
            0x02 => {
                self.bus.write_memory(self.regs.bc(), self.regs.a);
                7
            }
            0x12 => {
                self.bus.write_memory(self.regs.de(), self.regs.a);
                7
            }
            // LD A, (BC)/(DE)
            0x0A => {
                self.regs.a = self.bus.read_memory(self.regs.bc());
                7
            }
            0x1A => {
                self.regs.a = self.bus.read_memory(self.regs.de());
                7
            }
            // INC/DEC rr
            0x03 | 0x13 | 0x23 | 0x33 => {
                let value = self.read_rr(opcode, index, false).wrapping_add(1);
                self.write_rr(opcode, index, false, value);
                6
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let value = self.read_rr(opcode, index, false).wrapping_sub(1);
                self.write_rr(opcode, index, false, value);
                6
            }
            // INC/DEC r
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x3C => {
                let value = self.read_r(opcode >> 3, index);
                let result = inc8(value, &mut self.regs.f);
                self.write_r(opcode >> 3, index, result);
                4
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x3D => {
                let value = self.read_r(opcode >> 3, index);
                let result = dec8(value, &mut self.regs.f);
                self.write_r(opcode >> 3, index, result);
                4
            }
            // INC/DEC (HL)
            0x34 => {
                let address = self.hl_address(index);
                let value = self.bus.read_memory(address);
                let result = inc8(value, &mut self.regs.f);
                self.bus.write_memory(address, result);
                if index.is_some() { 19 } else { 11 }
            }
            0x35 => {
                let address = self.hl_address(index);
                let value = self.bus.read_memory(address);
                let result = dec8(value, &mut self.regs.f);
                self.bus.write_memory(address, result);
                if index.is_some() { 19 } else { 11 }
            }
            // LD r, n
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x3E => {
                let value = self.fetch();
                self.write_r(opcode >> 3, index, value);
                7
            }
            // LD (HL), n
            0x36 => {
                let address = self.hl_address(index);
                let value = self.fetch();
                self.bus.write_memory(address, value);
                if index.is_some() { 15 } else { 10 }
            }
            // Accumulator rotates: only H/N/C and X/Y change
            0x07 => {
                self.regs.a = self.regs.a.rotate_left(1);
                self.regs.f.carry = self.regs.a.bit(0);
                self.regs.f.half_carry = false;
                self.regs.f.subtract = false;
                self.regs.f.set_xy(self.regs.a);
                4
            }
            0x0F => {
                self.regs.f.carry = self.regs.a.bit(0);
                self.regs.a = self.regs.a.rotate_right(1);
                self.regs.f.half_carry = false;
                self.regs.f.subtract = false;
                self.regs.f.set_xy(self.regs.a);
                4
            }
            0x17 => {
                let carry_in = u8::from(self.regs.f.carry);
                self.regs.f.carry = self.regs.a.bit(7);
                self.regs.a = (self.regs.a << 1) | carry_in;
                self.regs.f.half_carry = false;
                self.regs.f.subtract = false;
                self.regs.f.set_xy(self.regs.a);
                4
            }
            0x1F => {
                let carry_in = u8::from(self.regs.f.carry) << 7;
                self.regs.f.carry = self.regs.a.bit(0);
                self.regs.a = (self.regs.a >> 1) | carry_in;
                self.regs.f.half_carry = false;
                self.regs.f.subtract = false;
                self.regs.f.set_xy(self.regs.a);
                4
            }
            // EX AF, AF'
            0x08 => {
                std::mem::swap(&mut self.regs.a, &mut self.regs.a_prime);
                std::mem::swap(&mut self.regs.f, &mut self.regs.f_prime);
                4
            }
            // ADD HL, rr
            0x09 | 0x19 | 0x29 | 0x39 => {
                let hl = self.read_rr(0x20, index, false);
                let operand = self.read_rr(opcode, index, false);
                let sum = u32::from(hl) + u32::from(operand);
                let result = sum as u16;

                self.regs.f.half_carry = (hl & 0x0FFF) + (operand & 0x0FFF) > 0x0FFF;
                self.regs.f.subtract = false;
                self.regs.f.carry = sum > 0xFFFF;
                self.regs.f.set_xy((result >> 8) as u8);

                self.write_rr(0x20, index, false, result);
                11
            }
            // DJNZ
            0x10 => {
                let offset = self.fetch() as i8;
                self.regs.b = self.regs.b.wrapping_sub(1);
                if self.regs.b != 0 {
                    self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
                    13
                } else {
                    8
                }
            }
            // JR / JR cc
            0x18 => {
                let offset = self.fetch() as i8;
                self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
                12
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch() as i8;
                // JR condition codes only cover NZ/Z/NC/C
                if self.condition(opcode.wrapping_sub(0x20)) {
                    self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
                    12
                } else {
                    7
                }
            }
            // LD (nn), HL / LD HL, (nn)
            0x22 => {
                let address = self.fetch_u16();
                let value = self.read_rr(0x20, index, false);
                self.write_u16(address, value);
                16
            }
            0x2A => {
                let address = self.fetch_u16();
                let value = self.read_u16(address);
                self.write_rr(0x20, index, false, value);
                16
            }
            // DAA
            0x27 => {
                self.daa();
                4
            }
            // CPL
            0x2F => {
                self.regs.a = !self.regs.a;
                self.regs.f.half_carry = true;
                self.regs.f.subtract = true;
                self.regs.f.set_xy(self.regs.a);
                4
            }
            // LD (nn), A / LD A, (nn)
            0x32 => {
                let address = self.fetch_u16();
                self.bus.write_memory(address, self.regs.a);
                13
            }
            0x3A => {
                let address = self.fetch_u16();
                self.regs.a = self.bus.read_memory(address);
                13
            }
            // SCF / CCF
            0x37 => {
                self.regs.f.carry = true;
                self.regs.f.half_carry = false;
                self.regs.f.subtract = false;
                self.regs.f.set_xy(self.regs.a);
                4
            }
            0x3F => {
                self.regs.f.half_carry = self.regs.f.carry;
                self.regs.f.carry = !self.regs.f.carry;
                self.regs.f.subtract = false;
                self.regs.f.set_xy(self.regs.a);
                4
            }
            // HALT
            0x76 => {
                self.regs.halted = true;
                4
            }
            // LD r, r' / LD r, (HL) / LD (HL), r
            0x40..=0x7F => {
                let dst = (opcode >> 3) & 0x07;
                let src = opcode & 0x07;
                match (dst, src) {
                    (6, _) => {
                        // When storing to (IX+d), the source register is never IXH/IXL
                        let address = self.hl_address(index);
                        let value = self.read_r(src, None);
                        self.bus.write_memory(address, value);
                        if index.is_some() { 15 } else { 7 }
                    }
                    (_, 6) => {
                        let address = self.hl_address(index);
                        let value = self.bus.read_memory(address);
                        self.write_r(dst, None, value);
                        if index.is_some() { 15 } else { 7 }
                    }
                    _ => {
                        let value = self.read_r(src, index);
                        self.write_r(dst, index, value);
                        4
                    }
                }
            }
            // 8-bit ALU on registers / (HL) / immediates
            0x80..=0xBF => {
                let src = opcode & 0x07;
                let (operand, cycles) = if src == 6 {
                    let address = self.hl_address(index);
                    (self.bus.read_memory(address), if index.is_some() { 15 } else { 7 })
                } else {
                    (self.read_r(src, index), 4)
                };
                self.alu_a(opcode, operand);
                cycles
            }
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let operand = self.fetch();
                self.alu_a(opcode, operand);
                7
            }
            // RET cc / RET
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                if self.condition(opcode) {
                    self.regs.pc = self.pop();
                    11
                } else {
                    5
                }
            }
            0xC9 => {
                self.regs.pc = self.pop();
                10
            }
            // POP / PUSH
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let value = self.pop();
                self.write_rr(opcode, index, true, value);
                10
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let value = self.read_rr(opcode, index, true);
                self.push(value);
                11
            }
            // JP / JP cc
            0xC3 => {
                self.regs.pc = self.fetch_u16();
                10
            }
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let target = self.fetch_u16();
                if self.condition(opcode) {
                    self.regs.pc = target;
                }
                10
            }
            // CALL / CALL cc
            0xCD => {
                let target = self.fetch_u16();
                let pc = self.regs.pc;
                self.push(pc);
                self.regs.pc = target;
                17
            }
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let target = self.fetch_u16();
                if self.condition(opcode) {
                    let pc = self.regs.pc;
                    self.push(pc);
                    self.regs.pc = target;
                    17
                } else {
                    10
                }
            }
            // RST
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let pc = self.regs.pc;
                self.push(pc);
                self.regs.pc = u16::from(opcode & 0x38);
                11
            }
            // EXX / EX DE,HL / EX (SP),HL
            0xD9 => {
                std::mem::swap(&mut self.regs.b, &mut self.regs.b_prime);
                std::mem::swap(&mut self.regs.c, &mut self.regs.c_prime);
                std::mem::swap(&mut self.regs.d, &mut self.regs.d_prime);
                std::mem::swap(&mut self.regs.e, &mut self.regs.e_prime);
                std::mem::swap(&mut self.regs.h, &mut self.regs.h_prime);
                std::mem::swap(&mut self.regs.l, &mut self.regs.l_prime);
                4
            }
            0xEB => {
                let de = self.regs.de();
                let hl = self.regs.hl();
                self.regs.set_de(hl);
                self.regs.set_hl(de);
                4
            }
            0xE3 => {
                let sp = self.regs.sp;
                let stack_value = self.read_u16(sp);
                let reg_value = self.read_rr(0x20, index, false);
                self.write_u16(sp, reg_value);
                self.write_rr(0x20, index, false, stack_value);
                19
            }
            // JP (HL) / LD SP, HL
            0xE9 => {
                self.regs.pc = self.read_rr(0x20, index, false);
                4
            }
            0xF9 => {
                self.regs.sp = self.read_rr(0x20, index, false);
                6
            }
            // I/O with immediate port
            0xD3 => {
                let port = self.fetch();
                // A drives the upper address lines
                let address = (u16::from(self.regs.a) << 8) | u16::from(port);
                self.bus.write_io(address, self.regs.a);
                11
            }
            0xDB => {
                let port = self.fetch();
                let address = (u16::from(self.regs.a) << 8) | u16::from(port);
                self.regs.a = self.bus.read_io(address);
                11
            }
            // DI / EI
            0xF3 => {
                self.regs.iff1 = false;
                self.regs.iff2 = false;
                4
            }
            0xFB => {
                self.regs.iff1 = true;
                self.regs.iff2 = true;
                self.regs.ei_delay = true;
                4
            }
            // Prefixes
            0xCB => self.execute_cb(index),
            0xED => self.execute_ed(),
            0xDD | 0xFD => unreachable!("index prefixes consumed by the fetch loop"),
        }
    }

    fn alu_a(&mut self, opcode: u8, operand: u8) {
        let a = self.regs.a;
        match (opcode >> 3) & 0x07 {
            0x00 => self.regs.a = add8(a, operand, false, &mut self.regs.f),
            0x01 => {
                let carry = self.regs.f.carry;
                self.regs.a = add8(a, operand, carry, &mut self.regs.f);
            }
            0x02 => self.regs.a = sub8(a, operand, false, &mut self.regs.f),
            0x03 => {
                let carry = self.regs.f.carry;
                self.regs.a = sub8(a, operand, carry, &mut self.regs.f);
            }
            0x04 => self.regs.a = and8(a, operand, &mut self.regs.f),
            0x05 => self.regs.a = xor8(a, operand, &mut self.regs.f),
            0x06 => self.regs.a = or8(a, operand, &mut self.regs.f),
            0x07 => {
                // CP: flags as SUB, but X/Y come from the operand, not the result
                sub8(a, operand, false, &mut self.regs.f);
                self.regs.f.set_xy(operand);
            }
            _ => unreachable!("masked to 3 bits"),
        }
    }

    fn daa(&mut self) {
        let a = self.regs.a;
        let mut correction = 0_u8;
        let mut carry = self.regs.f.carry;

        if self.regs.f.half_carry || (a & 0x0F) > 0x09 {
            correction |= 0x06;
        }
        if carry || a > 0x99 {
            correction |= 0x60;
            carry = true;
        }

        let result = if self.regs.f.subtract {
            a.wrapping_sub(correction)
        } else {
            a.wrapping_add(correction)
        };

        self.regs.f.half_carry = if self.regs.f.subtract {
            self.regs.f.half_carry && (a & 0x0F) < 0x06
        } else {
            (a & 0x0F) > 0x09
        };
        self.regs.f.carry = carry;
        self.regs.f.sign = result.bit(7);
        self.regs.f.zero = result == 0;
        self.regs.f.overflow = parity(result);
        self.regs.f.set_xy(result);

        self.regs.a = result;
    }

    // ===== CB prefix space =====

    fn execute_cb(&mut self, index: Option<IndexRegister>) -> u32 {
        // In the DDCB/FDCB form the displacement byte comes before the final opcode and the
        // operand is always (IX+d); a non-6 register field additionally receives the result
        let address = index.map(|idx| {
            let displacement = self.fetch() as i8;
            idx.read(self.regs).wrapping_add(displacement as u16)
        });

        let opcode = self.fetch();
        if index.is_none() {
            self.refresh();
        }

        let reg_code = opcode & 0x07;
        let bit_index = (opcode >> 3) & 0x07;

        let operand = match address {
            Some(address) => self.bus.read_memory(address),
            None if reg_code == 6 => self.bus.read_memory(self.regs.hl()),
            None => self.read_r(reg_code, None),
        };

        match opcode {
            // Rotates and shifts
            0x00..=0x3F => {
                let result = match opcode >> 3 {
                    0x00 => rlc(operand, &mut self.regs.f),
                    0x01 => rrc(operand, &mut self.regs.f),
                    0x02 => rl(operand, &mut self.regs.f),
                    0x03 => rr(operand, &mut self.regs.f),
                    0x04 => sla(operand, &mut self.regs.f),
                    0x05 => sra(operand, &mut self.regs.f),
                    0x06 => sll(operand, &mut self.regs.f),
                    0x07 => srl(operand, &mut self.regs.f),
                    _ => unreachable!("opcode <= 0x3F"),
                };
                self.write_cb_result(address, reg_code, result);
                cb_cycles(address.is_some(), reg_code, false)
            }
            // BIT
            0x40..=0x7F => {
                let bit_set = operand.bit(bit_index);
                self.regs.f.zero = !bit_set;
                self.regs.f.sign = bit_index == 7 && bit_set;
                self.regs.f.half_carry = true;
                self.regs.f.overflow = !bit_set;
                self.regs.f.subtract = false;
                match address {
                    // For indexed/indirect forms X/Y leak from the internal address latch
                    Some(addr) => self.regs.f.set_xy((addr >> 8) as u8),
                    None if reg_code == 6 => {
                        let hl = self.regs.hl();
                        self.regs.f.set_xy((hl >> 8) as u8);
                    }
                    None => self.regs.f.set_xy(operand),
                }
                cb_cycles(address.is_some(), reg_code, true)
            }
            // RES / SET
            0x80..=0xBF => {
                let result = operand & !(1 << bit_index);
                self.write_cb_result(address, reg_code, result);
                cb_cycles(address.is_some(), reg_code, false)
            }
            0xC0..=0xFF => {
                let result = operand | (1 << bit_index);
                self.write_cb_result(address, reg_code, result);
                cb_cycles(address.is_some(), reg_code, false)
            }
        }
    }

    fn write_cb_result(&mut self, address: Option<u16>, reg_code: u8, result: u8) {
        match address {
            Some(address) => {
                self.bus.write_memory(address, result);
                if reg_code != 6 {
                    // Undocumented DDCB behavior: the result is also copied into the register
                    self.write_r(reg_code, None, result);
                }
            }
            None if reg_code == 6 => {
                let hl = self.regs.hl();
                self.bus.write_memory(hl, result);
            }
            None => self.write_r(reg_code, None, result),
        }
    }

    // ===== ED prefix space =====

    fn execute_ed(&mut self) -> u32 {
        let opcode = self.fetch();
        self.refresh();

        match opcode {
            // IN r, (C) / OUT (C), r
            0x40 | 0x48 | 0x50 | 0x58 | 0x60 | 0x68 | 0x70 | 0x78 => {
                let value = self.bus.read_io(self.regs.bc());
                if opcode != 0x70 {
                    self.write_r(opcode >> 3, None, value);
                }
                self.regs.f.sign = value.bit(7);
                self.regs.f.zero = value == 0;
                self.regs.f.half_carry = false;
                self.regs.f.overflow = parity(value);
                self.regs.f.subtract = false;
                self.regs.f.set_xy(value);
                12
            }
            0x41 | 0x49 | 0x51 | 0x59 | 0x61 | 0x69 | 0x71 | 0x79 => {
                // OUT (C) with the missing register outputs 0
                let value = if opcode == 0x71 { 0 } else { self.read_r(opcode >> 3, None) };
                self.bus.write_io(self.regs.bc(), value);
                12
            }
            // SBC/ADC HL, rr
            0x42 | 0x52 | 0x62 | 0x72 => {
                self.sbc_hl(self.read_rr(opcode, None, false));
                15
            }
            0x4A | 0x5A | 0x6A | 0x7A => {
                self.adc_hl(self.read_rr(opcode, None, false));
                15
            }
            // LD (nn), rr / LD rr, (nn)
            0x43 | 0x53 | 0x63 | 0x73 => {
                let address = self.fetch_u16();
                let value = self.read_rr(opcode, None, false);
                self.write_u16(address, value);
                20
            }
            0x4B | 0x5B | 0x6B | 0x7B => {
                let address = self.fetch_u16();
                let value = self.read_u16(address);
                self.write_rr(opcode, None, false, value);
                20
            }
            // NEG (all of its mirrors too)
            0x44 | 0x4C | 0x54 | 0x5C | 0x64 | 0x6C | 0x74 | 0x7C => {
                self.regs.a = sub8(0, self.regs.a, false, &mut self.regs.f);
                8
            }
            // RETN / RETI and mirrors
            0x45 | 0x4D | 0x55 | 0x5D | 0x65 | 0x6D | 0x75 | 0x7D => {
                self.regs.iff1 = self.regs.iff2;
                self.regs.pc = self.pop();
                14
            }
            // IM 0/1/2 and mirrors
            0x46 | 0x4E | 0x66 | 0x6E => {
                self.regs.interrupt_mode = InterruptMode::Mode0;
                8
            }
            0x56 | 0x76 => {
                self.regs.interrupt_mode = InterruptMode::Mode1;
                8
            }
            0x5E | 0x7E => {
                self.regs.interrupt_mode = InterruptMode::Mode2;
                8
            }
            // LD I,A / LD R,A / LD A,I / LD A,R
            0x47 => {
                self.regs.i = self.regs.a;
                9
            }
            0x4F => {
                self.regs.r = self.regs.a;
                9
            }
            0x57 | 0x5F => {
                let value = if opcode == 0x57 { self.regs.i } else { self.regs.r };
                self.regs.a = value;
                self.regs.f.sign = value.bit(7);
                self.regs.f.zero = value == 0;
                self.regs.f.half_carry = false;
                self.regs.f.overflow = self.regs.iff2;
                self.regs.f.subtract = false;
                self.regs.f.set_xy(value);
                9
            }
            // RRD / RLD
            0x67 => {
                let hl = self.regs.hl();
                let value = self.bus.read_memory(hl);
                let new_value = (self.regs.a << 4) | (value >> 4);
                self.regs.a = (self.regs.a & 0xF0) | (value & 0x0F);
                self.bus.write_memory(hl, new_value);
                self.rotate_digit_flags();
                18
            }
            0x6F => {
                let hl = self.regs.hl();
                let value = self.bus.read_memory(hl);
                let new_value = (value << 4) | (self.regs.a & 0x0F);
                self.regs.a = (self.regs.a & 0xF0) | (value >> 4);
                self.bus.write_memory(hl, new_value);
                self.rotate_digit_flags();
                18
            }
            // Block transfer / compare / I/O
            0xA0 => self.block_transfer(BlockMode::Increment, false),
            0xA8 => self.block_transfer(BlockMode::Decrement, false),
            0xB0 => self.block_transfer(BlockMode::Increment, true),
            0xB8 => self.block_transfer(BlockMode::Decrement, true),
            0xA1 => self.block_compare(BlockMode::Increment, false),
            0xA9 => self.block_compare(BlockMode::Decrement, false),
            0xB1 => self.block_compare(BlockMode::Increment, true),
            0xB9 => self.block_compare(BlockMode::Decrement, true),
            0xA2 => self.block_in(BlockMode::Increment, false),
            0xAA => self.block_in(BlockMode::Decrement, false),
            0xB2 => self.block_in(BlockMode::Increment, true),
            0xBA => self.block_in(BlockMode::Decrement, true),
            0xA3 => self.block_out(BlockMode::Increment, false),
            0xAB => self.block_out(BlockMode::Decrement, false),
            0xB3 => self.block_out(BlockMode::Increment, true),
            0xBB => self.block_out(BlockMode::Decrement, true),
            // Everything else in the ED space is a 2-byte NOP
            _ => 8,
        }
    }

    fn rotate_digit_flags(&mut self) {
        self.regs.f.sign = self.regs.a.bit(7);
        self.regs.f.zero = self.regs.a == 0;
        self.regs.f.half_carry = false;
        self.regs.f.overflow = parity(self.regs.a);
        self.regs.f.subtract = false;
        self.regs.f.set_xy(self.regs.a);
    }

    fn adc_hl(&mut self, operand: u16) {
        let hl = self.regs.hl();
        let carry_in = u16::from(self.regs.f.carry);
        let sum = u32::from(hl) + u32::from(operand) + u32::from(carry_in);
        let result = sum as u16;

        self.regs.f.sign = result.bit(15);
        self.regs.f.zero = result == 0;
        self.regs.f.half_carry = (hl & 0x0FFF) + (operand & 0x0FFF) + carry_in > 0x0FFF;
        self.regs.f.overflow = (!(hl ^ operand) & (hl ^ result)).bit(15);
        self.regs.f.subtract = false;
        self.regs.f.carry = sum > 0xFFFF;
        self.regs.f.set_xy((result >> 8) as u8);

        self.regs.set_hl(result);
    }

    fn sbc_hl(&mut self, operand: u16) {
        let hl = self.regs.hl();
        let carry_in = u16::from(self.regs.f.carry);
        let diff = i32::from(hl) - i32::from(operand) - i32::from(carry_in);
        let result = diff as u16;

        self.regs.f.sign = result.bit(15);
        self.regs.f.zero = result == 0;
        self.regs.f.half_carry = (hl & 0x0FFF) < (operand & 0x0FFF) + carry_in;
        self.regs.f.overflow = ((hl ^ operand) & (hl ^ result)).bit(15);
        self.regs.f.subtract = true;
        self.regs.f.carry = diff < 0;
        self.regs.f.set_xy((result >> 8) as u8);

        self.regs.set_hl(result);
    }

    fn block_transfer(&mut self, mode: BlockMode, repeat: bool) -> u32 {
        let hl = self.regs.hl();
        let de = self.regs.de();
        let value = self.bus.read_memory(hl);
        self.bus.write_memory(de, value);

        self.regs.set_hl(mode.apply(hl));
        self.regs.set_de(mode.apply(de));
        let bc = self.regs.bc().wrapping_sub(1);
        self.regs.set_bc(bc);

        // Undocumented X/Y: bits 3 and 1 of (A + transferred byte)
        let n = self.regs.a.wrapping_add(value);
        self.regs.f.half_carry = false;
        self.regs.f.overflow = bc != 0;
        self.regs.f.subtract = false;
        self.regs.f.x = n.bit(3);
        self.regs.f.y = n.bit(1);

        if repeat && bc != 0 {
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            21
        } else {
            16
        }
    }

    fn block_compare(&mut self, mode: BlockMode, repeat: bool) -> u32 {
        let hl = self.regs.hl();
        let value = self.bus.read_memory(hl);
        let result = self.regs.a.wrapping_sub(value);
        let half_borrow = (self.regs.a & 0x0F) < (value & 0x0F);

        self.regs.set_hl(mode.apply(hl));
        let bc = self.regs.bc().wrapping_sub(1);
        self.regs.set_bc(bc);

        self.regs.f.sign = result.bit(7);
        self.regs.f.zero = result == 0;
        self.regs.f.half_carry = half_borrow;
        self.regs.f.overflow = bc != 0;
        self.regs.f.subtract = true;
        // X/Y: bits 3 and 1 of (result - half_borrow)
        let n = result.wrapping_sub(u8::from(half_borrow));
        self.regs.f.x = n.bit(3);
        self.regs.f.y = n.bit(1);

        if repeat && bc != 0 && result != 0 {
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            21
        } else {
            16
        }
    }

    fn block_in(&mut self, mode: BlockMode, repeat: bool) -> u32 {
        let value = self.bus.read_io(self.regs.bc());
        let hl = self.regs.hl();
        self.bus.write_memory(hl, value);

        self.regs.set_hl(mode.apply(hl));
        self.regs.b = self.regs.b.wrapping_sub(1);

        let c_adjusted = match mode {
            BlockMode::Increment => self.regs.c.wrapping_add(1),
            BlockMode::Decrement => self.regs.c.wrapping_sub(1),
        };
        let k = u16::from(value) + u16::from(c_adjusted);
        self.block_io_flags(value, k);

        if repeat && self.regs.b != 0 {
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            21
        } else {
            16
        }
    }

    fn block_out(&mut self, mode: BlockMode, repeat: bool) -> u32 {
        let hl = self.regs.hl();
        let value = self.bus.read_memory(hl);
        self.regs.b = self.regs.b.wrapping_sub(1);
        self.bus.write_io(self.regs.bc(), value);

        self.regs.set_hl(mode.apply(hl));

        let k = u16::from(value) + u16::from(self.regs.l);
        self.block_io_flags(value, k);

        if repeat && self.regs.b != 0 {
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            21
        } else {
            16
        }
    }

    fn block_io_flags(&mut self, value: u8, k: u16) {
        let b = self.regs.b;
        self.regs.f.sign = b.bit(7);
        self.regs.f.zero = b == 0;
        self.regs.f.half_carry = k > 0xFF;
        self.regs.f.carry = k > 0xFF;
        self.regs.f.overflow = parity(((k & 0x07) as u8) ^ b);
        self.regs.f.subtract = value.bit(7);
        self.regs.f.set_xy(b);
    }
}

fn cb_cycles(indexed: bool, reg_code: u8, is_bit: bool) -> u32 {
    if indexed {
        // DDCB/FDCB: the prefix adds 4 on top of these
        if is_bit { 16 } else { 19 }
    } else if reg_code == 6 {
        if is_bit { 12 } else { 15 }
    } else {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Z80;
    use crate::traits::InMemoryBus;

    fn new_cpu(program: &[u8]) -> (Z80, InMemoryBus) {
        let mut bus = InMemoryBus::new();
        bus.memory[..program.len()].copy_from_slice(program);
        let mut cpu = Z80::new();
        cpu.registers_mut().a = 0;
        cpu.registers_mut().f = 0.into();
        (cpu, bus)
    }

    // Independent branching model of the ADD A,r flags, including the undocumented X/Y bits
    fn reference_add_flags(a: u8, operand: u8) -> u8 {
        let result = a.wrapping_add(operand);
        let mut f = 0_u8;
        if result & 0x80 != 0 {
            f |= 0x80;
        }
        if result == 0 {
            f |= 0x40;
        }
        if result & 0x20 != 0 {
            f |= 0x20;
        }
        if (a & 0x0F) + (operand & 0x0F) > 0x0F {
            f |= 0x10;
        }
        if result & 0x08 != 0 {
            f |= 0x08;
        }
        let signed_sum = i16::from(a as i8) + i16::from(operand as i8);
        if signed_sum > 127 || signed_sum < -128 {
            f |= 0x04;
        }
        if u16::from(a) + u16::from(operand) > 0xFF {
            f |= 0x01;
        }
        f
    }

    #[test]
    fn add_flag_oracle_including_xy_bits() {
        for a in 0..=255_u8 {
            for operand in 0..=255_u8 {
                let (mut cpu, mut bus) = new_cpu(&[0x80]); // ADD A, B
                cpu.registers_mut().a = a;
                cpu.registers_mut().b = operand;
                cpu.execute_instruction(&mut bus);

                let actual: u8 = cpu.registers().f.into();
                let expected = reference_add_flags(a, operand);
                assert_eq!(
                    actual, expected,
                    "flags mismatch for {a:02X}+{operand:02X}: {actual:08b} vs {expected:08b}"
                );
            }
        }
    }

    #[test]
    fn daa_adjusts_bcd_addition() {
        // $15 + $27 = $3C, DAA -> $42
        let (mut cpu, mut bus) = new_cpu(&[0x80, 0x27]);
        cpu.registers_mut().a = 0x15;
        cpu.registers_mut().b = 0x27;
        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.registers().a, 0x42);
        assert!(!cpu.registers().f.carry);
    }

    #[test]
    fn ld_ixh_undocumented() {
        // DD 26 5A = LD IXH, $5A
        let (mut cpu, mut bus) = new_cpu(&[0xDD, 0x26, 0x5A]);
        cpu.registers_mut().ix = 0x1234;
        let cycles = cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.registers().ix, 0x5A34);
        assert_eq!(cycles, 11);
    }

    #[test]
    fn ld_r_ix_d() {
        // DD 46 05 = LD B, (IX+5)
        let (mut cpu, mut bus) = new_cpu(&[0xDD, 0x46, 0x05]);
        cpu.registers_mut().ix = 0x2000;
        bus.memory[0x2005] = 0x99;
        let cycles = cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.registers().b, 0x99);
        assert_eq!(cycles, 19);
    }

    #[test]
    fn ddcb_stores_back_to_register() {
        // DD CB 03 00 = RLC (IX+3) -> also stored into B
        let (mut cpu, mut bus) = new_cpu(&[0xDD, 0xCB, 0x03, 0x00]);
        cpu.registers_mut().ix = 0x3000;
        bus.memory[0x3003] = 0x81;
        let cycles = cpu.execute_instruction(&mut bus);

        assert_eq!(bus.memory[0x3003], 0x03);
        assert_eq!(cpu.registers().b, 0x03);
        assert!(cpu.registers().f.carry);
        assert_eq!(cycles, 23);
    }

    #[test]
    fn ldir_copies_block() {
        // LDIR copying 3 bytes from $4000 to $5000
        let (mut cpu, mut bus) = new_cpu(&[0xED, 0xB0]);
        cpu.registers_mut().set_hl(0x4000);
        cpu.registers_mut().set_de(0x5000);
        cpu.registers_mut().set_bc(3);
        bus.memory[0x4000..0x4003].copy_from_slice(&[1, 2, 3]);

        let mut total = 0;
        while cpu.registers().bc() != 0 {
            total += cpu.execute_instruction(&mut bus);
        }

        assert_eq!(&bus.memory[0x5000..0x5003], &[1, 2, 3]);
        assert_eq!(total, 21 + 21 + 16);
        assert!(!cpu.registers().f.overflow);
    }

    #[test]
    fn alternate_register_set() {
        let (mut cpu, mut bus) = new_cpu(&[0x08, 0xD9]); // EX AF,AF' / EXX
        cpu.registers_mut().a = 0x11;
        cpu.registers_mut().a_prime = 0x22;
        cpu.registers_mut().b = 0x33;
        cpu.registers_mut().b_prime = 0x44;

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().a, 0x22);
        assert_eq!(cpu.registers().a_prime, 0x11);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.registers().b, 0x44);
        assert_eq!(cpu.registers().b_prime, 0x33);
    }

    #[test]
    fn halt_waits_for_interrupt() {
        let (mut cpu, mut bus) = new_cpu(&[0x76]);
        cpu.execute_instruction(&mut bus);
        assert!(cpu.halted());

        // While halted the CPU just burns cycles
        let pc = cpu.pc();
        assert_eq!(cpu.execute_instruction(&mut bus), 4);
        assert_eq!(cpu.pc(), pc);

        // An interrupt wakes it (IM 1 -> RST $38)
        cpu.registers_mut().iff1 = true;
        bus.int = InterruptLine::Low;
        cpu.execute_instruction(&mut bus);
        assert!(!cpu.halted());
        assert_eq!(cpu.pc(), 0x0038);
    }

    #[test]
    fn ei_delays_interrupt_by_one_instruction() {
        let (mut cpu, mut bus) = new_cpu(&[0xFB, 0x00, 0x00]); // EI / NOP / NOP
        bus.int = InterruptLine::Low;

        cpu.execute_instruction(&mut bus); // EI
        cpu.execute_instruction(&mut bus); // NOP executes despite pending INT
        assert_eq!(cpu.pc(), 0x0002);

        cpu.execute_instruction(&mut bus); // now the interrupt is taken
        assert_eq!(cpu.pc(), 0x0038);
        assert!(!cpu.registers().iff1);
    }

    #[test]
    fn im2_fetches_vector_from_table() {
        let (mut cpu, mut bus) = new_cpu(&[0xED, 0x5E, 0x00]); // IM 2 / NOP
        cpu.registers_mut().i = 0x40;
        // Vector table entry at $40FF (I=$40, bus vector=$FF)
        bus.memory[0x40FF] = 0x34;
        bus.memory[0x4100] = 0x12;

        cpu.execute_instruction(&mut bus); // IM 2
        cpu.registers_mut().iff1 = true;
        bus.int = InterruptLine::Low;
        let cycles = cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.pc(), 0x1234);
        assert_eq!(cycles, 19);
    }

    #[test]
    fn nmi_edge_triggered_and_preserves_iff2() {
        let (mut cpu, mut bus) = new_cpu(&[0x00, 0x00]);
        cpu.registers_mut().iff1 = true;
        cpu.registers_mut().iff2 = true;

        cpu.execute_instruction(&mut bus);
        bus.nmi = InterruptLine::Low;
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.pc(), 0x0066);
        assert!(!cpu.registers().iff1);
        assert!(cpu.registers().iff2);

        // Line held low: no retrigger
        bus.memory[0x0066] = 0x00;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x0067);
    }

    #[test]
    fn cp_xy_flags_come_from_operand() {
        // CP B with B = $28: X/Y from the operand ($28 has bit 5 set, bit 3 clear)
        let (mut cpu, mut bus) = new_cpu(&[0xB8]);
        cpu.registers_mut().a = 0x50;
        cpu.registers_mut().b = 0x28;
        cpu.execute_instruction(&mut bus);

        assert!(cpu.registers().f.y);
        assert!(!cpu.registers().f.x);
    }
}

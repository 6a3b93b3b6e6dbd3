//! Opcode dispatch and execution.
//!
//! Every cycle of every instruction is a bus access; the dummy reads and double-writes below are
//! the documented ones, so cycle counts (including page-cross and branch penalties) fall out of
//! the access sequences.

use crate::bus::BusInterface;
use crate::{CpuVariant, Mos6502, StatusReadContext};
use nexen_common::num::GetBit;

impl Mos6502 {
    pub(crate) fn fetch_operand<B: BusInterface>(&mut self, bus: &mut B) -> u8 {
        let operand = bus.read(self.registers.pc);
        self.registers.pc = self.registers.pc.wrapping_add(1);
        operand
    }

    fn fetch_operand_u16<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let lsb = self.fetch_operand(bus);
        let msb = self.fetch_operand(bus);
        u16::from_le_bytes([lsb, msb])
    }

    pub(crate) fn push_stack<B: BusInterface>(&mut self, bus: &mut B, value: u8) {
        bus.write(0x0100 | u16::from(self.registers.sp), value);
        self.registers.sp = self.registers.sp.wrapping_sub(1);
    }

    fn pull_stack<B: BusInterface>(&mut self, bus: &mut B) -> u8 {
        self.registers.sp = self.registers.sp.wrapping_add(1);
        bus.read(0x0100 | u16::from(self.registers.sp))
    }

    fn stack_dummy_read<B: BusInterface>(&mut self, bus: &mut B) {
        bus.read(0x0100 | u16::from(self.registers.sp));
    }

    fn pc_dummy_read<B: BusInterface>(&mut self, bus: &mut B) {
        bus.read(self.registers.pc);
    }

    // ===== Address resolution =====
    //
    // The _read variants only spend the extra cycle when the index carry actually crosses a page;
    // the _write variants always spend it, reading from the partially-formed address, which is
    // what the hardware does.

    fn addr_zero_page<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        self.fetch_operand(bus).into()
    }

    fn addr_zero_page_indexed<B: BusInterface>(&mut self, bus: &mut B, index: u8) -> u16 {
        let base = self.fetch_operand(bus);
        bus.read(base.into());
        base.wrapping_add(index).into()
    }

    fn addr_absolute<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        self.fetch_operand_u16(bus)
    }

    fn addr_absolute_indexed_read<B: BusInterface>(&mut self, bus: &mut B, index: u8) -> u16 {
        let base = self.fetch_operand_u16(bus);
        let address = base.wrapping_add(index.into());
        if address & 0xFF00 != base & 0xFF00 {
            bus.read((base & 0xFF00) | (address & 0x00FF));
        }
        address
    }

    fn addr_absolute_indexed_write<B: BusInterface>(&mut self, bus: &mut B, index: u8) -> u16 {
        let base = self.fetch_operand_u16(bus);
        let address = base.wrapping_add(index.into());
        bus.read((base & 0xFF00) | (address & 0x00FF));
        address
    }

    fn read_zero_page_pointer<B: BusInterface>(&mut self, bus: &mut B, zp_addr: u8) -> u16 {
        // The pointer's high byte fetch wraps within page zero
        let lsb = bus.read(zp_addr.into());
        let msb = bus.read(zp_addr.wrapping_add(1).into());
        u16::from_le_bytes([lsb, msb])
    }

    fn addr_indexed_indirect<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let operand = self.fetch_operand(bus);
        bus.read(operand.into());
        self.read_zero_page_pointer(bus, operand.wrapping_add(self.registers.x))
    }

    fn addr_indirect_indexed_read<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let operand = self.fetch_operand(bus);
        let base = self.read_zero_page_pointer(bus, operand);
        let address = base.wrapping_add(self.registers.y.into());
        if address & 0xFF00 != base & 0xFF00 {
            bus.read((base & 0xFF00) | (address & 0x00FF));
        }
        address
    }

    fn addr_indirect_indexed_write<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let operand = self.fetch_operand(bus);
        let base = self.read_zero_page_pointer(bus, operand);
        let address = base.wrapping_add(self.registers.y.into());
        bus.read((base & 0xFF00) | (address & 0x00FF));
        address
    }

    // 65C02 (zp) mode
    fn addr_zero_page_indirect<B: BusInterface>(&mut self, bus: &mut B) -> u16 {
        let operand = self.fetch_operand(bus);
        self.read_zero_page_pointer(bus, operand)
    }

    // ===== Read / write / read-modify-write dispatch by addressing mode =====

    fn read_group_one_operand<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) -> u8 {
        // Standard aaabbbcc decoding for the cc=01 column plus the 65C02 (zp) column
        match opcode & 0x1F {
            0x01 => {
                let addr = self.addr_indexed_indirect(bus);
                bus.read(addr)
            }
            0x05 => {
                let addr = self.addr_zero_page(bus);
                bus.read(addr)
            }
            0x09 => self.fetch_operand(bus),
            0x0D => {
                let addr = self.addr_absolute(bus);
                bus.read(addr)
            }
            0x11 => {
                let addr = self.addr_indirect_indexed_read(bus);
                bus.read(addr)
            }
            0x12 => {
                let addr = self.addr_zero_page_indirect(bus);
                bus.read(addr)
            }
            0x15 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.x);
                bus.read(addr)
            }
            0x19 => {
                let addr = self.addr_absolute_indexed_read(bus, self.registers.y);
                bus.read(addr)
            }
            0x1D => {
                let addr = self.addr_absolute_indexed_read(bus, self.registers.x);
                bus.read(addr)
            }
            _ => unreachable!("not a group-one addressing mode: {opcode:02X}"),
        }
    }

    /// Read-modify-write access pattern. NMOS writes the unmodified value back before writing the
    /// result (double-write); 65C02 performs a second read instead.
    fn read_modify_write<B: BusInterface>(
        &mut self,
        bus: &mut B,
        address: u16,
        f: impl FnOnce(&mut Self, u8) -> u8,
    ) {
        let value = bus.read(address);
        match self.variant {
            CpuVariant::Nmos => bus.write(address, value),
            CpuVariant::Cmos => {
                bus.read(address);
            }
        }
        let modified = f(self, value);
        bus.write(address, modified);
    }

    // ===== ALU =====

    fn add_with_carry(&mut self, value: u8) -> bool {
        let a = self.registers.accumulator;
        let carry_in = u8::from(self.registers.status.carry);

        let binary_sum = u16::from(a) + u16::from(value) + u16::from(carry_in);
        let binary_result = binary_sum as u8;
        let binary_overflow = (!(a ^ value) & (a ^ binary_result)).bit(7);

        if !self.registers.status.decimal {
            self.registers.status.carry = binary_sum > 0xFF;
            self.registers.status.overflow = binary_overflow;
            self.registers.status.set_nz(binary_result);
            self.registers.accumulator = binary_result;
            return false;
        }

        // Decimal mode. NMOS takes N/V from the intermediate high digit and Z from the binary
        // sum; 65C02 computes all flags from the adjusted result (and spends an extra cycle)
        let mut low = (a & 0x0F) + (value & 0x0F) + carry_in;
        if low > 0x09 {
            low += 0x06;
        }
        let mut high = u16::from(a >> 4) + u16::from(value >> 4) + u16::from(low > 0x0F);

        let intermediate = ((high as u8) << 4) | (low & 0x0F);
        if high > 0x09 {
            high += 0x06;
        }
        let result = ((high as u8) << 4) | (low & 0x0F);

        self.registers.status.carry = high > 0x0F;
        match self.variant {
            CpuVariant::Nmos => {
                self.registers.status.negative = intermediate.bit(7);
                self.registers.status.overflow = (!(a ^ value) & (a ^ intermediate)).bit(7);
                self.registers.status.zero = binary_result == 0;
            }
            CpuVariant::Cmos => {
                self.registers.status.overflow = binary_overflow;
                self.registers.status.set_nz(result);
            }
        }
        self.registers.accumulator = result;

        self.variant == CpuVariant::Cmos
    }

    fn subtract_with_carry(&mut self, value: u8) -> bool {
        let a = self.registers.accumulator;
        let borrow_in = u8::from(!self.registers.status.carry);

        let binary_diff =
            i16::from(a) - i16::from(value) - i16::from(borrow_in);
        let binary_result = binary_diff as u8;
        let binary_overflow = ((a ^ value) & (a ^ binary_result)).bit(7);

        if !self.registers.status.decimal {
            self.registers.status.carry = binary_diff >= 0;
            self.registers.status.overflow = binary_overflow;
            self.registers.status.set_nz(binary_result);
            self.registers.accumulator = binary_result;
            return false;
        }

        let mut low = i16::from(a & 0x0F) - i16::from(value & 0x0F) - i16::from(borrow_in);
        let mut high = i16::from(a >> 4) - i16::from(value >> 4);
        if low < 0 {
            low += 0x0A;
            high -= 1;
        }
        if high < 0 {
            high += 0x0A;
        }
        let result = (((high as u8) & 0x0F) << 4) | ((low as u8) & 0x0F);

        // Carry and overflow always come from the binary computation
        self.registers.status.carry = binary_diff >= 0;
        self.registers.status.overflow = binary_overflow;
        match self.variant {
            CpuVariant::Nmos => {
                self.registers.status.set_nz(binary_result);
            }
            CpuVariant::Cmos => {
                self.registers.status.set_nz(result);
            }
        }
        self.registers.accumulator = result;

        self.variant == CpuVariant::Cmos
    }

    fn compare(&mut self, register: u8, value: u8) {
        let (diff, borrowed) = register.overflowing_sub(value);
        self.registers.status.carry = !borrowed;
        self.registers.status.set_nz(diff);
    }

    fn bit_test(&mut self, value: u8) {
        self.registers.status.zero = self.registers.accumulator & value == 0;
        self.registers.status.negative = value.bit(7);
        self.registers.status.overflow = value.bit(6);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.registers.status.carry = value.bit(7);
        let shifted = value << 1;
        self.registers.status.set_nz(shifted);
        shifted
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.registers.status.carry = value.bit(0);
        let shifted = value >> 1;
        self.registers.status.set_nz(shifted);
        shifted
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.registers.status.carry);
        self.registers.status.carry = value.bit(7);
        let rotated = (value << 1) | carry_in;
        self.registers.status.set_nz(rotated);
        rotated
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.registers.status.carry) << 7;
        self.registers.status.carry = value.bit(0);
        let rotated = (value >> 1) | carry_in;
        self.registers.status.set_nz(rotated);
        rotated
    }

    fn and(&mut self, value: u8) {
        self.registers.accumulator &= value;
        self.registers.status.set_nz(self.registers.accumulator);
    }

    fn ora(&mut self, value: u8) {
        self.registers.accumulator |= value;
        self.registers.status.set_nz(self.registers.accumulator);
    }

    fn eor(&mut self, value: u8) {
        self.registers.accumulator ^= value;
        self.registers.status.set_nz(self.registers.accumulator);
    }

    // ===== Control flow =====

    fn branch<B: BusInterface>(&mut self, bus: &mut B, condition: bool) {
        let offset = self.fetch_operand(bus) as i8;
        if !condition {
            return;
        }

        self.pc_dummy_read(bus);
        let target = self.registers.pc.wrapping_add(offset as u16);
        if target & 0xFF00 != self.registers.pc & 0xFF00 {
            bus.read((self.registers.pc & 0xFF00) | (target & 0x00FF));
        }
        self.registers.pc = target;
    }

    fn jmp_indirect<B: BusInterface>(&mut self, bus: &mut B) {
        let pointer = self.fetch_operand_u16(bus);
        let lsb = bus.read(pointer);
        let msb_addr = match self.variant {
            // NMOS does not propagate the carry into the pointer's high byte
            CpuVariant::Nmos => (pointer & 0xFF00) | (pointer.wrapping_add(1) & 0x00FF),
            CpuVariant::Cmos => {
                self.pc_dummy_read(bus);
                pointer.wrapping_add(1)
            }
        };
        let msb = bus.read(msb_addr);
        self.registers.pc = u16::from_le_bytes([lsb, msb]);
    }

    fn jmp_indexed_indirect<B: BusInterface>(&mut self, bus: &mut B) {
        let pointer = self.fetch_operand_u16(bus).wrapping_add(self.registers.x.into());
        self.pc_dummy_read(bus);
        let lsb = bus.read(pointer);
        let msb = bus.read(pointer.wrapping_add(1));
        self.registers.pc = u16::from_le_bytes([lsb, msb]);
    }

    fn jsr<B: BusInterface>(&mut self, bus: &mut B) {
        let lsb = self.fetch_operand(bus);
        self.stack_dummy_read(bus);

        let [pc_lsb, pc_msb] = self.registers.pc.to_le_bytes();
        self.push_stack(bus, pc_msb);
        self.push_stack(bus, pc_lsb);

        let msb = self.fetch_operand(bus);
        self.registers.pc = u16::from_le_bytes([lsb, msb]);
    }

    fn rts<B: BusInterface>(&mut self, bus: &mut B) {
        self.pc_dummy_read(bus);
        self.stack_dummy_read(bus);
        let lsb = self.pull_stack(bus);
        let msb = self.pull_stack(bus);
        self.registers.pc = u16::from_le_bytes([lsb, msb]);
        self.pc_dummy_read(bus);
        self.registers.pc = self.registers.pc.wrapping_add(1);
    }

    fn rti<B: BusInterface>(&mut self, bus: &mut B) {
        self.pc_dummy_read(bus);
        self.stack_dummy_read(bus);
        let status = self.pull_stack(bus);
        self.registers.status = crate::StatusFlags::from_byte(status);
        let lsb = self.pull_stack(bus);
        let msb = self.pull_stack(bus);
        self.registers.pc = u16::from_le_bytes([lsb, msb]);
    }

    fn brk<B: BusInterface>(&mut self, bus: &mut B) {
        // The padding byte after BRK is fetched and discarded
        self.fetch_operand(bus);

        let [pc_lsb, pc_msb] = self.registers.pc.to_le_bytes();
        self.push_stack(bus, pc_msb);
        self.push_stack(bus, pc_lsb);
        self.push_stack(bus, self.registers.status.to_byte(StatusReadContext::Brk));

        // An NMI arriving during the stack pushes hijacks the BRK vector
        let vector = self.hijackable_vector(bus, crate::IRQ_VECTOR);
        self.finish_interrupt_sequence(bus, vector, true);
    }

    // ===== 65C02 Rockwell bit ops =====

    fn bbr_bbs<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) {
        let zp_addr = self.fetch_operand(bus);
        let value = bus.read(zp_addr.into());
        bus.read(zp_addr.into());

        let bit_index = (opcode >> 4) & 0x07;
        let branch_if_set = opcode.bit(7);
        self.branch(bus, value.bit(bit_index) == branch_if_set);
    }

    fn rmb_smb<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) {
        let address = self.addr_zero_page(bus);
        let bit_index = (opcode >> 4) & 0x07;
        let set = opcode.bit(7);
        self.read_modify_write(bus, address, |_, value| {
            if set { value | (1 << bit_index) } else { value & !(1 << bit_index) }
        });
    }

    // ===== NMOS illegal opcode helpers =====

    fn nmos_magic() -> u8 {
        // The "magic constant" in the unstable LXA/XAA opcodes; $EE is the most commonly
        // observed value on retail consoles
        0xEE
    }

    fn kil(&mut self) {
        log::error!(
            "CPU executed illegal KIL opcode at {:04X}; CPU is now frozen",
            self.registers.pc.wrapping_sub(1)
        );
        self.frozen = true;
    }

    // SHY/SHX/AHX/TAS all store (register & (high byte of target + 1))
    fn unstable_store<B: BusInterface>(&mut self, bus: &mut B, index: u8, value: u8) {
        let base = self.fetch_operand_u16(bus);
        let address = base.wrapping_add(index.into());
        bus.read((base & 0xFF00) | (address & 0x00FF));

        let masked = value & ((base >> 8) as u8).wrapping_add(1);
        bus.write(address, masked);
    }

    // ===== Dispatch =====

    pub(crate) fn execute_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) {
        match self.variant {
            CpuVariant::Nmos => self.execute_nmos_opcode(bus, opcode),
            CpuVariant::Cmos => self.execute_cmos_opcode(bus, opcode),
        }
    }

    /// Opcodes shared between NMOS and CMOS. Returns false if the opcode is not a common one.
    fn execute_common_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) -> bool {
        match opcode {
            // BRK
            0x00 => self.brk(bus),
            // ORA / AND / EOR / ADC / LDA / CMP / SBC, all standard addressing modes
            0x01 | 0x05 | 0x09 | 0x0D | 0x11 | 0x15 | 0x19 | 0x1D => {
                let value = self.read_group_one_operand(bus, opcode);
                self.ora(value);
            }
            0x21 | 0x25 | 0x29 | 0x2D | 0x31 | 0x35 | 0x39 | 0x3D => {
                let value = self.read_group_one_operand(bus, opcode);
                self.and(value);
            }
            0x41 | 0x45 | 0x49 | 0x4D | 0x51 | 0x55 | 0x59 | 0x5D => {
                let value = self.read_group_one_operand(bus, opcode);
                self.eor(value);
            }
            0x61 | 0x65 | 0x69 | 0x6D | 0x71 | 0x75 | 0x79 | 0x7D => {
                let value = self.read_group_one_operand(bus, opcode);
                if self.add_with_carry(value) {
                    self.pc_dummy_read(bus);
                }
            }
            0xA1 | 0xA5 | 0xA9 | 0xAD | 0xB1 | 0xB5 | 0xB9 | 0xBD => {
                let value = self.read_group_one_operand(bus, opcode);
                self.registers.accumulator = value;
                self.registers.status.set_nz(value);
            }
            0xC1 | 0xC5 | 0xC9 | 0xCD | 0xD1 | 0xD5 | 0xD9 | 0xDD => {
                let value = self.read_group_one_operand(bus, opcode);
                self.compare(self.registers.accumulator, value);
            }
            0xE1 | 0xE5 | 0xE9 | 0xED | 0xF1 | 0xF5 | 0xF9 | 0xFD => {
                let value = self.read_group_one_operand(bus, opcode);
                if self.subtract_with_carry(value) {
                    self.pc_dummy_read(bus);
                }
            }
            // STA
            0x85 => {
                let addr = self.addr_zero_page(bus);
                bus.write(addr, self.registers.accumulator);
            }
            0x95 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.x);
                bus.write(addr, self.registers.accumulator);
            }
            0x8D => {
                let addr = self.addr_absolute(bus);
                bus.write(addr, self.registers.accumulator);
            }
            0x9D => {
                let addr = self.addr_absolute_indexed_write(bus, self.registers.x);
                bus.write(addr, self.registers.accumulator);
            }
            0x99 => {
                let addr = self.addr_absolute_indexed_write(bus, self.registers.y);
                bus.write(addr, self.registers.accumulator);
            }
            0x81 => {
                let addr = self.addr_indexed_indirect(bus);
                bus.write(addr, self.registers.accumulator);
            }
            0x91 => {
                let addr = self.addr_indirect_indexed_write(bus);
                bus.write(addr, self.registers.accumulator);
            }
            // STX / STY
            0x86 => {
                let addr = self.addr_zero_page(bus);
                bus.write(addr, self.registers.x);
            }
            0x96 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.y);
                bus.write(addr, self.registers.x);
            }
            0x8E => {
                let addr = self.addr_absolute(bus);
                bus.write(addr, self.registers.x);
            }
            0x84 => {
                let addr = self.addr_zero_page(bus);
                bus.write(addr, self.registers.y);
            }
            0x94 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.x);
                bus.write(addr, self.registers.y);
            }
            0x8C => {
                let addr = self.addr_absolute(bus);
                bus.write(addr, self.registers.y);
            }
            // LDX / LDY
            0xA2 => {
                let value = self.fetch_operand(bus);
                self.registers.x = value;
                self.registers.status.set_nz(value);
            }
            0xA6 | 0xB6 | 0xAE | 0xBE => {
                let addr = match opcode {
                    0xA6 => self.addr_zero_page(bus),
                    0xB6 => self.addr_zero_page_indexed(bus, self.registers.y),
                    0xAE => self.addr_absolute(bus),
                    0xBE => self.addr_absolute_indexed_read(bus, self.registers.y),
                    _ => unreachable!(),
                };
                let value = bus.read(addr);
                self.registers.x = value;
                self.registers.status.set_nz(value);
            }
            0xA0 => {
                let value = self.fetch_operand(bus);
                self.registers.y = value;
                self.registers.status.set_nz(value);
            }
            0xA4 | 0xB4 | 0xAC | 0xBC => {
                let addr = match opcode {
                    0xA4 => self.addr_zero_page(bus),
                    0xB4 => self.addr_zero_page_indexed(bus, self.registers.x),
                    0xAC => self.addr_absolute(bus),
                    0xBC => self.addr_absolute_indexed_read(bus, self.registers.x),
                    _ => unreachable!(),
                };
                let value = bus.read(addr);
                self.registers.y = value;
                self.registers.status.set_nz(value);
            }
            // CPX / CPY
            0xE0 => {
                let value = self.fetch_operand(bus);
                self.compare(self.registers.x, value);
            }
            0xE4 | 0xEC => {
                let addr = if opcode == 0xE4 {
                    self.addr_zero_page(bus)
                } else {
                    self.addr_absolute(bus)
                };
                let value = bus.read(addr);
                self.compare(self.registers.x, value);
            }
            0xC0 => {
                let value = self.fetch_operand(bus);
                self.compare(self.registers.y, value);
            }
            0xC4 | 0xCC => {
                let addr = if opcode == 0xC4 {
                    self.addr_zero_page(bus)
                } else {
                    self.addr_absolute(bus)
                };
                let value = bus.read(addr);
                self.compare(self.registers.y, value);
            }
            // BIT
            0x24 | 0x2C => {
                let addr = if opcode == 0x24 {
                    self.addr_zero_page(bus)
                } else {
                    self.addr_absolute(bus)
                };
                let value = bus.read(addr);
                self.bit_test(value);
            }
            // Shifts / rotates, accumulator mode
            0x0A => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.asl(self.registers.accumulator);
            }
            0x2A => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.rol(self.registers.accumulator);
            }
            0x4A => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.lsr(self.registers.accumulator);
            }
            0x6A => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.ror(self.registers.accumulator);
            }
            // Shifts / rotates / INC / DEC, memory modes
            0x06 | 0x16 | 0x0E | 0x1E => {
                let addr = self.rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, Self::asl);
            }
            0x26 | 0x36 | 0x2E | 0x3E => {
                let addr = self.rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, Self::rol);
            }
            0x46 | 0x56 | 0x4E | 0x5E => {
                let addr = self.rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, Self::lsr);
            }
            0x66 | 0x76 | 0x6E | 0x7E => {
                let addr = self.rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, Self::ror);
            }
            0xE6 | 0xF6 | 0xEE | 0xFE => {
                let addr = self.inc_dec_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let new = value.wrapping_add(1);
                    cpu.registers.status.set_nz(new);
                    new
                });
            }
            0xC6 | 0xD6 | 0xCE | 0xDE => {
                let addr = self.inc_dec_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let new = value.wrapping_sub(1);
                    cpu.registers.status.set_nz(new);
                    new
                });
            }
            // Register transfers and index arithmetic
            0xAA => {
                self.pc_dummy_read(bus);
                self.registers.x = self.registers.accumulator;
                self.registers.status.set_nz(self.registers.x);
            }
            0x8A => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.registers.x;
                self.registers.status.set_nz(self.registers.accumulator);
            }
            0xA8 => {
                self.pc_dummy_read(bus);
                self.registers.y = self.registers.accumulator;
                self.registers.status.set_nz(self.registers.y);
            }
            0x98 => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.registers.y;
                self.registers.status.set_nz(self.registers.accumulator);
            }
            0xBA => {
                self.pc_dummy_read(bus);
                self.registers.x = self.registers.sp;
                self.registers.status.set_nz(self.registers.x);
            }
            0x9A => {
                self.pc_dummy_read(bus);
                self.registers.sp = self.registers.x;
            }
            0xE8 => {
                self.pc_dummy_read(bus);
                self.registers.x = self.registers.x.wrapping_add(1);
                self.registers.status.set_nz(self.registers.x);
            }
            0xCA => {
                self.pc_dummy_read(bus);
                self.registers.x = self.registers.x.wrapping_sub(1);
                self.registers.status.set_nz(self.registers.x);
            }
            0xC8 => {
                self.pc_dummy_read(bus);
                self.registers.y = self.registers.y.wrapping_add(1);
                self.registers.status.set_nz(self.registers.y);
            }
            0x88 => {
                self.pc_dummy_read(bus);
                self.registers.y = self.registers.y.wrapping_sub(1);
                self.registers.status.set_nz(self.registers.y);
            }
            // Flag operations
            0x18 => {
                self.pc_dummy_read(bus);
                self.registers.status.carry = false;
            }
            0x38 => {
                self.pc_dummy_read(bus);
                self.registers.status.carry = true;
            }
            0x58 => {
                self.pc_dummy_read(bus);
                self.registers.status.interrupt_disable = false;
            }
            0x78 => {
                self.pc_dummy_read(bus);
                self.registers.status.interrupt_disable = true;
            }
            0xB8 => {
                self.pc_dummy_read(bus);
                self.registers.status.overflow = false;
            }
            0xD8 => {
                self.pc_dummy_read(bus);
                self.registers.status.decimal = false;
            }
            0xF8 => {
                self.pc_dummy_read(bus);
                self.registers.status.decimal = true;
            }
            // Stack
            0x48 => {
                self.pc_dummy_read(bus);
                self.push_stack(bus, self.registers.accumulator);
            }
            0x68 => {
                self.pc_dummy_read(bus);
                self.stack_dummy_read(bus);
                self.registers.accumulator = self.pull_stack(bus);
                self.registers.status.set_nz(self.registers.accumulator);
            }
            0x08 => {
                self.pc_dummy_read(bus);
                let status = self.registers.status.to_byte(StatusReadContext::PushStack);
                self.push_stack(bus, status);
            }
            0x28 => {
                self.pc_dummy_read(bus);
                self.stack_dummy_read(bus);
                let status = self.pull_stack(bus);
                self.registers.status = crate::StatusFlags::from_byte(status);
            }
            // Control flow
            0x4C => {
                self.registers.pc = self.fetch_operand_u16(bus);
            }
            0x6C => self.jmp_indirect(bus),
            0x20 => self.jsr(bus),
            0x60 => self.rts(bus),
            0x40 => self.rti(bus),
            0x10 => {
                let negative = self.registers.status.negative;
                self.branch(bus, !negative);
            }
            0x30 => {
                let negative = self.registers.status.negative;
                self.branch(bus, negative);
            }
            0x50 => {
                let overflow = self.registers.status.overflow;
                self.branch(bus, !overflow);
            }
            0x70 => {
                let overflow = self.registers.status.overflow;
                self.branch(bus, overflow);
            }
            0x90 => {
                let carry = self.registers.status.carry;
                self.branch(bus, !carry);
            }
            0xB0 => {
                let carry = self.registers.status.carry;
                self.branch(bus, carry);
            }
            0xD0 => {
                let zero = self.registers.status.zero;
                self.branch(bus, !zero);
            }
            0xF0 => {
                let zero = self.registers.status.zero;
                self.branch(bus, zero);
            }
            // NOP
            0xEA => self.pc_dummy_read(bus),
            _ => return false,
        }

        true
    }

    fn rmw_address<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) -> u16 {
        match opcode & 0x1F {
            0x06 => self.addr_zero_page(bus),
            0x16 => self.addr_zero_page_indexed(bus, self.registers.x),
            0x0E => self.addr_absolute(bus),
            0x1E => match self.variant {
                CpuVariant::Nmos => self.addr_absolute_indexed_write(bus, self.registers.x),
                // 65C02 shift/rotate abs,X only spends the extra cycle on a page cross
                CpuVariant::Cmos => self.addr_absolute_indexed_read(bus, self.registers.x),
            },
            _ => unreachable!("not an RMW addressing mode: {opcode:02X}"),
        }
    }

    fn inc_dec_address<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) -> u16 {
        match opcode & 0x1F {
            0x06 => self.addr_zero_page(bus),
            0x16 => self.addr_zero_page_indexed(bus, self.registers.x),
            0x0E => self.addr_absolute(bus),
            0x1E => self.addr_absolute_indexed_write(bus, self.registers.x),
            _ => unreachable!("not an INC/DEC addressing mode: {opcode:02X}"),
        }
    }

    fn execute_nmos_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) {
        if self.execute_common_opcode(bus, opcode) {
            return;
        }

        match opcode {
            // KIL
            0x02 | 0x12 | 0x22 | 0x32 | 0x42 | 0x52 | 0x62 | 0x72 | 0x92 | 0xB2 | 0xD2 | 0xF2 => {
                self.kil();
            }
            // Multi-byte NOPs
            0x80 | 0x82 | 0x89 | 0xC2 | 0xE2 => {
                self.fetch_operand(bus);
            }
            0x04 | 0x44 | 0x64 => {
                let addr = self.addr_zero_page(bus);
                bus.read(addr);
            }
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.x);
                bus.read(addr);
            }
            0x0C => {
                let addr = self.addr_absolute(bus);
                bus.read(addr);
            }
            0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => {
                let addr = self.addr_absolute_indexed_read(bus, self.registers.x);
                bus.read(addr);
            }
            // Single-byte NOPs
            0x1A | 0x3A | 0x5A | 0x7A | 0xDA | 0xFA => self.pc_dummy_read(bus),
            // LAX
            0xA7 | 0xB7 | 0xAF | 0xBF | 0xA3 | 0xB3 => {
                let addr = match opcode {
                    0xA7 => self.addr_zero_page(bus),
                    0xB7 => self.addr_zero_page_indexed(bus, self.registers.y),
                    0xAF => self.addr_absolute(bus),
                    0xBF => self.addr_absolute_indexed_read(bus, self.registers.y),
                    0xA3 => self.addr_indexed_indirect(bus),
                    0xB3 => self.addr_indirect_indexed_read(bus),
                    _ => unreachable!(),
                };
                let value = bus.read(addr);
                self.registers.accumulator = value;
                self.registers.x = value;
                self.registers.status.set_nz(value);
            }
            // LXA (unstable LAX #imm)
            0xAB => {
                let value = self.fetch_operand(bus);
                let result = (self.registers.accumulator | Self::nmos_magic()) & value;
                self.registers.accumulator = result;
                self.registers.x = result;
                self.registers.status.set_nz(result);
            }
            // SAX
            0x87 | 0x97 | 0x8F | 0x83 => {
                let addr = match opcode {
                    0x87 => self.addr_zero_page(bus),
                    0x97 => self.addr_zero_page_indexed(bus, self.registers.y),
                    0x8F => self.addr_absolute(bus),
                    0x83 => self.addr_indexed_indirect(bus),
                    _ => unreachable!(),
                };
                bus.write(addr, self.registers.accumulator & self.registers.x);
            }
            // RMW + ALU combos
            0x07 | 0x17 | 0x0F | 0x1F | 0x1B | 0x03 | 0x13 => {
                let addr = self.illegal_rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let shifted = cpu.asl(value);
                    cpu.ora(shifted);
                    shifted
                });
            }
            0x27 | 0x37 | 0x2F | 0x3F | 0x3B | 0x23 | 0x33 => {
                let addr = self.illegal_rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let rotated = cpu.rol(value);
                    cpu.and(rotated);
                    rotated
                });
            }
            0x47 | 0x57 | 0x4F | 0x5F | 0x5B | 0x43 | 0x53 => {
                let addr = self.illegal_rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let shifted = cpu.lsr(value);
                    cpu.eor(shifted);
                    shifted
                });
            }
            0x67 | 0x77 | 0x6F | 0x7F | 0x7B | 0x63 | 0x73 => {
                let addr = self.illegal_rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let rotated = cpu.ror(value);
                    cpu.add_with_carry(rotated);
                    rotated
                });
            }
            0xC7 | 0xD7 | 0xCF | 0xDF | 0xDB | 0xC3 | 0xD3 => {
                let addr = self.illegal_rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let new = value.wrapping_sub(1);
                    cpu.compare(cpu.registers.accumulator, new);
                    new
                });
            }
            0xE7 | 0xF7 | 0xEF | 0xFF | 0xFB | 0xE3 | 0xF3 => {
                let addr = self.illegal_rmw_address(bus, opcode);
                self.read_modify_write(bus, addr, |cpu, value| {
                    let new = value.wrapping_add(1);
                    cpu.subtract_with_carry(new);
                    new
                });
            }
            // Immediate-mode combos
            0x0B | 0x2B => {
                // ANC: AND then copy N into C
                let value = self.fetch_operand(bus);
                self.and(value);
                self.registers.status.carry = self.registers.status.negative;
            }
            0x4B => {
                // ALR: AND then LSR A
                let value = self.fetch_operand(bus);
                self.and(value);
                self.registers.accumulator = self.lsr(self.registers.accumulator);
            }
            0x6B => {
                // ARR: AND then ROR A with C/V from bits 6/5
                let value = self.fetch_operand(bus);
                let anded = self.registers.accumulator & value;
                let carry_in = u8::from(self.registers.status.carry) << 7;
                let result = (anded >> 1) | carry_in;
                self.registers.accumulator = result;
                self.registers.status.set_nz(result);
                self.registers.status.carry = result.bit(6);
                self.registers.status.overflow = result.bit(6) != result.bit(5);
            }
            0xCB => {
                // SBX: X = (A & X) - imm
                let value = self.fetch_operand(bus);
                let operand = self.registers.accumulator & self.registers.x;
                let (diff, borrowed) = operand.overflowing_sub(value);
                self.registers.status.carry = !borrowed;
                self.registers.status.set_nz(diff);
                self.registers.x = diff;
            }
            0xEB => {
                // Duplicate SBC #imm
                let value = self.fetch_operand(bus);
                self.subtract_with_carry(value);
            }
            0x8B => {
                // XAA (unstable)
                let value = self.fetch_operand(bus);
                let result =
                    (self.registers.accumulator | Self::nmos_magic()) & self.registers.x & value;
                self.registers.accumulator = result;
                self.registers.status.set_nz(result);
            }
            // Unstable high-byte stores
            0x9C => self.unstable_store(bus, self.registers.x, self.registers.y),
            0x9E => self.unstable_store(bus, self.registers.y, self.registers.x),
            0x9F => {
                let a_and_x = self.registers.accumulator & self.registers.x;
                self.unstable_store(bus, self.registers.y, a_and_x);
            }
            0x93 => {
                let operand = self.fetch_operand(bus);
                let base = self.read_zero_page_pointer(bus, operand);
                let address = base.wrapping_add(self.registers.y.into());
                bus.read((base & 0xFF00) | (address & 0x00FF));
                let value = self.registers.accumulator
                    & self.registers.x
                    & ((base >> 8) as u8).wrapping_add(1);
                bus.write(address, value);
            }
            0x9B => {
                // TAS: SP = A & X, then unstable store
                self.registers.sp = self.registers.accumulator & self.registers.x;
                let value = self.registers.sp;
                self.unstable_store(bus, self.registers.y, value);
            }
            0xBB => {
                // LAS: A, X, SP = memory & SP
                let addr = self.addr_absolute_indexed_read(bus, self.registers.y);
                let value = bus.read(addr) & self.registers.sp;
                self.registers.accumulator = value;
                self.registers.x = value;
                self.registers.sp = value;
                self.registers.status.set_nz(value);
            }
            _ => unreachable!("all 256 NMOS opcodes are covered: {opcode:02X}"),
        }
    }

    fn illegal_rmw_address<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) -> u16 {
        match opcode & 0x1F {
            0x07 => self.addr_zero_page(bus),
            0x17 => self.addr_zero_page_indexed(bus, self.registers.x),
            0x0F => self.addr_absolute(bus),
            0x1F => self.addr_absolute_indexed_write(bus, self.registers.x),
            0x1B => self.addr_absolute_indexed_write(bus, self.registers.y),
            0x03 => self.addr_indexed_indirect(bus),
            0x13 => self.addr_indirect_indexed_write(bus),
            _ => unreachable!("not an illegal RMW addressing mode: {opcode:02X}"),
        }
    }

    fn execute_cmos_opcode<B: BusInterface>(&mut self, bus: &mut B, opcode: u8) {
        if self.execute_common_opcode(bus, opcode) {
            return;
        }

        match opcode {
            // (zp) addressing modes for the group-one ALU ops
            0x12 => {
                let value = self.read_group_one_operand(bus, opcode);
                self.ora(value);
            }
            0x32 => {
                let value = self.read_group_one_operand(bus, opcode);
                self.and(value);
            }
            0x52 => {
                let value = self.read_group_one_operand(bus, opcode);
                self.eor(value);
            }
            0x72 => {
                let value = self.read_group_one_operand(bus, opcode);
                if self.add_with_carry(value) {
                    self.pc_dummy_read(bus);
                }
            }
            0xB2 => {
                let value = self.read_group_one_operand(bus, opcode);
                self.registers.accumulator = value;
                self.registers.status.set_nz(value);
            }
            0xD2 => {
                let value = self.read_group_one_operand(bus, opcode);
                self.compare(self.registers.accumulator, value);
            }
            0xF2 => {
                let value = self.read_group_one_operand(bus, opcode);
                if self.subtract_with_carry(value) {
                    self.pc_dummy_read(bus);
                }
            }
            0x92 => {
                let addr = self.addr_zero_page_indirect(bus);
                bus.write(addr, self.registers.accumulator);
            }
            // BRA
            0x80 => self.branch(bus, true),
            // STZ
            0x64 => {
                let addr = self.addr_zero_page(bus);
                bus.write(addr, 0);
            }
            0x74 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.x);
                bus.write(addr, 0);
            }
            0x9C => {
                let addr = self.addr_absolute(bus);
                bus.write(addr, 0);
            }
            0x9E => {
                let addr = self.addr_absolute_indexed_write(bus, self.registers.x);
                bus.write(addr, 0);
            }
            // PHX / PLX / PHY / PLY
            0xDA => {
                self.pc_dummy_read(bus);
                self.push_stack(bus, self.registers.x);
            }
            0xFA => {
                self.pc_dummy_read(bus);
                self.stack_dummy_read(bus);
                self.registers.x = self.pull_stack(bus);
                self.registers.status.set_nz(self.registers.x);
            }
            0x5A => {
                self.pc_dummy_read(bus);
                self.push_stack(bus, self.registers.y);
            }
            0x7A => {
                self.pc_dummy_read(bus);
                self.stack_dummy_read(bus);
                self.registers.y = self.pull_stack(bus);
                self.registers.status.set_nz(self.registers.y);
            }
            // INC A / DEC A
            0x1A => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.registers.accumulator.wrapping_add(1);
                self.registers.status.set_nz(self.registers.accumulator);
            }
            0x3A => {
                self.pc_dummy_read(bus);
                self.registers.accumulator = self.registers.accumulator.wrapping_sub(1);
                self.registers.status.set_nz(self.registers.accumulator);
            }
            // BIT immediate / indexed; the immediate form only affects Z
            0x89 => {
                let value = self.fetch_operand(bus);
                self.registers.status.zero = self.registers.accumulator & value == 0;
            }
            0x34 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.x);
                let value = bus.read(addr);
                self.bit_test(value);
            }
            0x3C => {
                let addr = self.addr_absolute_indexed_read(bus, self.registers.x);
                let value = bus.read(addr);
                self.bit_test(value);
            }
            // TSB / TRB
            0x04 | 0x0C => {
                let addr = if opcode == 0x04 {
                    self.addr_zero_page(bus)
                } else {
                    self.addr_absolute(bus)
                };
                self.read_modify_write(bus, addr, |cpu, value| {
                    cpu.registers.status.zero = cpu.registers.accumulator & value == 0;
                    value | cpu.registers.accumulator
                });
            }
            0x14 | 0x1C => {
                let addr = if opcode == 0x14 {
                    self.addr_zero_page(bus)
                } else {
                    self.addr_absolute(bus)
                };
                self.read_modify_write(bus, addr, |cpu, value| {
                    cpu.registers.status.zero = cpu.registers.accumulator & value == 0;
                    value & !cpu.registers.accumulator
                });
            }
            // JMP (abs,X)
            0x7C => self.jmp_indexed_indirect(bus),
            // Rockwell bit ops
            0x0F | 0x1F | 0x2F | 0x3F | 0x4F | 0x5F | 0x6F | 0x7F | 0x8F | 0x9F | 0xAF | 0xBF
            | 0xCF | 0xDF | 0xEF | 0xFF => self.bbr_bbs(bus, opcode),
            0x07 | 0x17 | 0x27 | 0x37 | 0x47 | 0x57 | 0x67 | 0x77 | 0x87 | 0x97 | 0xA7 | 0xB7
            | 0xC7 | 0xD7 | 0xE7 | 0xF7 => self.rmb_smb(bus, opcode),
            // Remaining undefined opcodes execute as NOPs of documented lengths
            0x02 | 0x22 | 0x42 | 0x62 | 0x82 | 0xC2 | 0xE2 => {
                self.fetch_operand(bus);
            }
            0x44 => {
                let addr = self.addr_zero_page(bus);
                bus.read(addr);
            }
            0x54 | 0xD4 | 0xF4 => {
                let addr = self.addr_zero_page_indexed(bus, self.registers.x);
                bus.read(addr);
            }
            0x5C | 0xDC | 0xFC => {
                let addr = self.addr_absolute(bus);
                bus.read(addr);
            }
            0x03 | 0x13 | 0x23 | 0x33 | 0x43 | 0x53 | 0x63 | 0x73 | 0x83 | 0x93 | 0xA3 | 0xB3
            | 0xC3 | 0xD3 | 0xE3 | 0xF3 | 0x0B | 0x1B | 0x2B | 0x3B | 0x4B | 0x5B | 0x6B
            | 0x7B | 0x8B | 0x9B | 0xAB | 0xBB | 0xCB | 0xDB | 0xEB | 0xFB => {
                // Single-cycle NOPs on the 65C02
            }
            _ => unreachable!("all 256 CMOS opcodes are covered: {opcode:02X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::{BusInterface, DryRunBus, InMemoryBus, InterruptLine};
    use crate::{CpuVariant, Mos6502, StatusReadContext};

    const PROGRAM_START: u16 = 0x8000;

    fn new_cpu(variant: CpuVariant, program: &[u8]) -> (Mos6502, InMemoryBus) {
        let mut bus = InMemoryBus::new();
        bus.memory[0xFFFC] = (PROGRAM_START & 0xFF) as u8;
        bus.memory[0xFFFD] = (PROGRAM_START >> 8) as u8;
        bus.memory[PROGRAM_START as usize..PROGRAM_START as usize + program.len()]
            .copy_from_slice(program);

        let cpu = Mos6502::new(variant, &mut bus);
        bus.cycles = 0;
        (cpu, bus)
    }

    fn run_one(cpu: &mut Mos6502, bus: &mut InMemoryBus) -> u64 {
        let before = bus.cycles;
        cpu.execute_instruction(bus);
        bus.cycles - before
    }

    // Independent branching model of binary ADC flag computation
    fn reference_adc(a: u8, operand: u8, carry: bool) -> (u8, bool, bool, bool, bool) {
        let sum = u16::from(a) + u16::from(operand) + u16::from(carry);
        let result = sum as u8;

        let carry_out = sum > 0xFF;
        let a_neg = a >= 0x80;
        let op_neg = operand >= 0x80;
        let result_neg = result >= 0x80;
        let overflow = if a_neg == op_neg { result_neg != a_neg } else { false };

        (result, carry_out, overflow, result_neg, result == 0)
    }

    #[test]
    fn adc_binary_flag_oracle() {
        for a in 0..=255_u8 {
            for operand in 0..=255_u8 {
                for carry in [false, true] {
                    let (expected, exp_c, exp_v, exp_n, exp_z) = reference_adc(a, operand, carry);

                    let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0x69, operand]);
                    cpu.registers.accumulator = a;
                    cpu.registers.status.carry = carry;
                    cpu.execute_instruction(&mut bus);

                    assert_eq!(cpu.registers.accumulator, expected, "A for {a:02X}+{operand:02X}");
                    assert_eq!(cpu.registers.status.carry, exp_c, "C for {a:02X}+{operand:02X}");
                    assert_eq!(cpu.registers.status.overflow, exp_v, "V for {a:02X}+{operand:02X}");
                    assert_eq!(cpu.registers.status.negative, exp_n, "N for {a:02X}+{operand:02X}");
                    assert_eq!(cpu.registers.status.zero, exp_z, "Z for {a:02X}+{operand:02X}");
                }
            }
        }
    }

    #[test]
    fn sbc_binary_flag_oracle() {
        for a in 0..=255_u8 {
            for operand in 0..=255_u8 {
                for carry in [false, true] {
                    // SBC == ADC with the operand complemented
                    let (expected, exp_c, exp_v, exp_n, exp_z) = reference_adc(a, !operand, carry);

                    let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xE9, operand]);
                    cpu.registers.accumulator = a;
                    cpu.registers.status.carry = carry;
                    cpu.execute_instruction(&mut bus);

                    assert_eq!(cpu.registers.accumulator, expected);
                    assert_eq!(cpu.registers.status.carry, exp_c);
                    assert_eq!(cpu.registers.status.overflow, exp_v);
                    assert_eq!(cpu.registers.status.negative, exp_n);
                    assert_eq!(cpu.registers.status.zero, exp_z);
                }
            }
        }
    }

    #[test]
    fn adc_overflow_case() {
        // $50 + $50 with C=0: A=$A0, V=1, N=1, Z=0, C=0
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0x69, 0x50]);
        cpu.registers.accumulator = 0x50;
        cpu.registers.status.carry = false;
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.registers.accumulator, 0xA0);
        assert!(cpu.registers.status.overflow);
        assert!(cpu.registers.status.negative);
        assert!(!cpu.registers.status.zero);
        assert!(!cpu.registers.status.carry);
    }

    #[test]
    fn adc_decimal_mode() {
        for (a, operand, carry_in, expected, expected_carry) in [
            (0x09_u8, 0x01_u8, false, 0x10_u8, false),
            (0x50, 0x50, false, 0x00, true),
            (0x99, 0x01, false, 0x00, true),
            (0x19, 0x27, false, 0x46, false),
            (0x99, 0x99, true, 0x99, true),
        ] {
            let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0x69, operand]);
            cpu.registers.accumulator = a;
            cpu.registers.status.decimal = true;
            cpu.registers.status.carry = carry_in;
            cpu.execute_instruction(&mut bus);

            assert_eq!(
                cpu.registers.accumulator, expected,
                "BCD {a:02X}+{operand:02X}+{carry_in}"
            );
            assert_eq!(cpu.registers.status.carry, expected_carry);
        }
    }

    #[test]
    fn sbc_decimal_mode() {
        for (a, operand, carry_in, expected, expected_carry) in [
            (0x10_u8, 0x01_u8, true, 0x09_u8, true),
            (0x00, 0x01, true, 0x99, false),
            (0x46, 0x27, true, 0x19, true),
        ] {
            let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xE9, operand]);
            cpu.registers.accumulator = a;
            cpu.registers.status.decimal = true;
            cpu.registers.status.carry = carry_in;
            cpu.execute_instruction(&mut bus);

            assert_eq!(
                cpu.registers.accumulator, expected,
                "BCD {a:02X}-{operand:02X}"
            );
            assert_eq!(cpu.registers.status.carry, expected_carry);
        }
    }

    #[test]
    fn zero_page_indexed_wraps() {
        // LDA $FF,X with X=1 reads from $0000
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xB5, 0xFF]);
        cpu.registers.x = 0x01;
        bus.memory[0x0000] = 0x5A;
        bus.memory[0x0100] = 0xFF;
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.registers.accumulator, 0x5A);
    }

    #[test]
    fn absolute_x_page_cross_cycle() {
        // LDA $80F0,X; no cross with X=$05 (4 cycles), cross with X=$20 (5 cycles)
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xBD, 0xF0, 0x80]);
        cpu.registers.x = 0x05;
        assert_eq!(run_one(&mut cpu, &mut bus), 4);

        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xBD, 0xF0, 0x80]);
        cpu.registers.x = 0x20;
        assert_eq!(run_one(&mut cpu, &mut bus), 5);
    }

    #[test]
    fn store_absolute_x_always_five_cycles() {
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0x9D, 0xF0, 0x20]);
        cpu.registers.x = 0x05;
        assert_eq!(run_one(&mut cpu, &mut bus), 5);
    }

    #[test]
    fn indirect_y_pointer_wraps_in_zero_page() {
        // LDA ($FF),Y: pointer low at $FF, pointer high at $00
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xB1, 0xFF]);
        bus.memory[0x00FF] = 0x34;
        bus.memory[0x0000] = 0x12;
        bus.memory[0x1236] = 0x77;
        cpu.registers.y = 0x02;
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.registers.accumulator, 0x77);
    }

    #[test]
    fn jmp_indirect_page_bug() {
        // JMP ($10FF): NMOS reads the high byte from $1000, CMOS from $1100
        let program = [0x6C, 0xFF, 0x10];

        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &program);
        bus.memory[0x10FF] = 0x00;
        bus.memory[0x1000] = 0x40;
        bus.memory[0x1100] = 0x80;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x4000);

        let (mut cpu, mut bus) = new_cpu(CpuVariant::Cmos, &program);
        bus.memory[0x10FF] = 0x00;
        bus.memory[0x1000] = 0x40;
        bus.memory[0x1100] = 0x80;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x8000);
    }

    struct WriteRecordingBus {
        inner: InMemoryBus,
        writes: Vec<(u16, u8)>,
    }

    impl BusInterface for WriteRecordingBus {
        fn read(&mut self, address: u16) -> u8 {
            self.inner.read(address)
        }

        fn write(&mut self, address: u16, value: u8) {
            self.writes.push((address, value));
            self.inner.write(address, value);
        }

        fn peek(&self, address: u16) -> u8 {
            self.inner.peek(address)
        }

        fn nmi(&self) -> InterruptLine {
            self.inner.nmi()
        }

        fn irq(&self) -> InterruptLine {
            self.inner.irq()
        }
    }

    #[test]
    fn rmw_double_write_on_nmos() {
        // INC $0010 writes the unmodified value back before the incremented value on NMOS
        let (mut cpu, bus) = new_cpu(CpuVariant::Nmos, &[0xE6, 0x10]);
        let mut bus = WriteRecordingBus { inner: bus, writes: Vec::new() };
        bus.inner.memory[0x0010] = 0x41;
        cpu.execute_instruction(&mut bus);

        assert_eq!(bus.writes, vec![(0x0010, 0x41), (0x0010, 0x42)]);

        let (mut cpu, bus) = new_cpu(CpuVariant::Cmos, &[0xE6, 0x10]);
        let mut bus = WriteRecordingBus { inner: bus, writes: Vec::new() };
        bus.inner.memory[0x0010] = 0x41;
        cpu.execute_instruction(&mut bus);

        assert_eq!(bus.writes, vec![(0x0010, 0x42)]);
    }

    #[test]
    fn branch_cycle_counts() {
        // Not taken: 2 cycles
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xD0, 0x10]);
        cpu.registers.status.zero = true;
        assert_eq!(run_one(&mut cpu, &mut bus), 2);

        // Taken, same page: 3 cycles
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xD0, 0x10]);
        cpu.registers.status.zero = false;
        assert_eq!(run_one(&mut cpu, &mut bus), 3);
        assert_eq!(cpu.pc(), PROGRAM_START + 0x12);

        // Taken, page cross: 4 cycles
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xD0, 0xFC]);
        cpu.registers.status.zero = false;
        assert_eq!(run_one(&mut cpu, &mut bus), 4);
    }

    #[test]
    fn brk_sequence() {
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0x00]);
        bus.memory[0xFFFE] = 0x00;
        bus.memory[0xFFFF] = 0x40;
        cpu.registers.status.decimal = true;
        let sp_before = cpu.registers.sp;

        assert_eq!(run_one(&mut cpu, &mut bus), 7);
        assert_eq!(cpu.pc(), 0x4000);
        assert!(cpu.registers.status.interrupt_disable);
        // The pushed status byte has B set; NMOS also clears D on the way in
        let pushed_status = bus.memory[0x0100 + usize::from(sp_before) - 2];
        assert_ne!(pushed_status & 0x10, 0);
        assert!(!cpu.registers.status.decimal);
        // Pushed return address is BRK + 2
        let pushed_pcl = bus.memory[0x0100 + usize::from(sp_before) - 1];
        let pushed_pch = bus.memory[0x0100 + usize::from(sp_before)];
        let pushed_pc = u16::from_le_bytes([pushed_pcl, pushed_pch]);
        assert_eq!(pushed_pc, PROGRAM_START + 2);
    }

    #[test]
    fn nmi_edge_triggered() {
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xEA, 0xEA, 0xEA]);
        bus.memory[0xFFFA] = 0x00;
        bus.memory[0xFFFB] = 0x30;

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), PROGRAM_START + 1);

        bus.nmi = InterruptLine::Low;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x3000);

        // Level stays low: no retrigger
        bus.memory[0x3000] = 0xEA;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x3001);
    }

    #[test]
    fn irq_respects_interrupt_disable() {
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0xEA, 0xEA]);
        bus.memory[0xFFFE] = 0x00;
        bus.memory[0xFFFF] = 0x20;
        bus.irq = InterruptLine::Low;

        cpu.registers.status.interrupt_disable = true;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), PROGRAM_START + 1);

        cpu.registers.status.interrupt_disable = false;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x2000);
    }

    #[test]
    fn kil_freezes_cpu() {
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Nmos, &[0x02, 0xEA]);
        cpu.execute_instruction(&mut bus);
        assert!(cpu.frozen());

        let pc = cpu.pc();
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), pc);
    }

    #[test]
    fn cmos_stz_and_tsb() {
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Cmos, &[0x64, 0x20, 0x04, 0x21]);
        bus.memory[0x0020] = 0xFF;
        bus.memory[0x0021] = 0x0F;
        cpu.registers.accumulator = 0xF0;

        cpu.execute_instruction(&mut bus);
        assert_eq!(bus.memory[0x0020], 0x00);

        cpu.execute_instruction(&mut bus);
        assert_eq!(bus.memory[0x0021], 0xFF);
        assert!(cpu.registers.status.zero); // $F0 & $0F == 0
    }

    #[test]
    fn cmos_bbr_bbs() {
        // BBR0 $40, +4: branch taken when bit 0 of $40 is clear
        let (mut cpu, mut bus) = new_cpu(CpuVariant::Cmos, &[0x0F, 0x40, 0x04]);
        bus.memory[0x0040] = 0xFE;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), PROGRAM_START + 3 + 4);

        let (mut cpu, mut bus) = new_cpu(CpuVariant::Cmos, &[0x0F, 0x40, 0x04]);
        bus.memory[0x0040] = 0x01;
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), PROGRAM_START + 3);
    }

    #[test]
    fn dry_run_bus_has_no_side_effects() {
        let (mut cpu, bus) = new_cpu(CpuVariant::Nmos, &[0x8D, 0x00, 0x02]);
        cpu.registers.accumulator = 0x99;

        let memory_before = bus.memory.clone();
        let mut dry_run = DryRunBus::new(&bus);
        cpu.execute_instruction(&mut dry_run);

        assert_eq!(dry_run.writes, vec![(0x0200, 0x99)]);
        assert_eq!(*bus.memory, *memory_before);
    }

    #[test]
    fn status_byte_round_trip() {
        let (cpu, _) = new_cpu(CpuVariant::Nmos, &[]);
        let byte = cpu.registers.status.to_byte(StatusReadContext::PushStack);
        // I set at power-on, bit 5 always reads 1, B set in push context
        assert_eq!(byte, 0x34);
    }
}

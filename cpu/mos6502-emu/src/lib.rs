//! MOS 6502 / WDC 65C02 instruction interpreter.
//!
//! The core is instruction-stepped: `execute_instruction` runs exactly one instruction, and every
//! CPU cycle within it is expressed as a bus access (the 6502 touches the bus on every cycle,
//! including internal ones, which it spends on documented dummy reads). Cycle counts, page-cross
//! penalties, and read-modify-write double-writes therefore fall out of the access sequences
//! rather than being tabulated.

pub mod bus;
mod disassemble;
mod instructions;

pub use disassemble::disassemble;

use crate::bus::{BusInterface, InterruptLine};
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum CpuVariant {
    /// NMOS 6502: illegal opcodes, JMP ($xxFF) bug, RMW double-write.
    Nmos,
    /// WDC 65C02: BBR/BBS, PHX/PLX, STZ, TSB/TRB and friends; bug fixes; undefined opcodes
    /// execute as NOPs.
    Cmos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum StatusReadContext {
    HardwareInterruptHandler,
    Brk,
    PushStack,
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct StatusFlags {
    pub negative: bool,
    pub overflow: bool,
    pub decimal: bool,
    pub interrupt_disable: bool,
    pub zero: bool,
    pub carry: bool,
}

impl StatusFlags {
    #[must_use]
    pub fn new() -> Self {
        // I defaults to 1, everything else to 0
        Self {
            negative: false,
            overflow: false,
            decimal: false,
            interrupt_disable: true,
            zero: false,
            carry: false,
        }
    }

    #[must_use]
    pub fn to_byte(self, read_ctx: StatusReadContext) -> u8 {
        // B flag reads as set during BRK and PHP, clear inside NMI/IRQ handlers; bit 5 is
        // unused and always reads as 1
        let b_flag = match read_ctx {
            StatusReadContext::Brk | StatusReadContext::PushStack => 0x10,
            StatusReadContext::HardwareInterruptHandler => 0x00,
        };

        (u8::from(self.negative) << 7)
            | (u8::from(self.overflow) << 6)
            | 0x20
            | b_flag
            | (u8::from(self.decimal) << 3)
            | (u8::from(self.interrupt_disable) << 2)
            | (u8::from(self.zero) << 1)
            | u8::from(self.carry)
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self {
            negative: byte.bit(7),
            overflow: byte.bit(6),
            decimal: byte.bit(3),
            interrupt_disable: byte.bit(2),
            zero: byte.bit(1),
            carry: byte.bit(0),
        }
    }

    pub(crate) fn set_nz(&mut self, value: u8) -> &mut Self {
        self.negative = value.bit(7);
        self.zero = value == 0;
        self
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct CpuRegisters {
    pub accumulator: u8,
    pub x: u8,
    pub y: u8,
    pub status: StatusFlags,
    pub pc: u16,
    pub sp: u8,
}

impl CpuRegisters {
    fn new(reset_vector: u16) -> Self {
        Self { accumulator: 0, x: 0, y: 0, status: StatusFlags::new(), pc: reset_vector, sp: 0xFD }
    }
}

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

#[derive(Debug, Clone, Encode, Decode)]
pub struct Mos6502 {
    registers: CpuRegisters,
    variant: CpuVariant,
    nmi_last_level: InterruptLine,
    nmi_pending: bool,
    frozen: bool,
}

impl Mos6502 {
    /// Create a new CPU with the PC pointing to the RESET vector, read from $FFFC.
    pub fn new<B: BusInterface>(variant: CpuVariant, bus: &mut B) -> Self {
        let reset_vector_lsb = bus.read(RESET_VECTOR);
        let reset_vector_msb = bus.read(RESET_VECTOR + 1);
        let reset_vector = u16::from_le_bytes([reset_vector_lsb, reset_vector_msb]);

        Self {
            registers: CpuRegisters::new(reset_vector),
            variant,
            nmi_last_level: InterruptLine::High,
            nmi_pending: false,
            frozen: false,
        }
    }

    /// Reset the CPU:
    /// * Update PC to point to the RESET vector
    /// * Subtract 3 from the stack pointer
    /// * Disable IRQs
    /// * Unfreeze the CPU if it was frozen by an illegal KIL opcode
    pub fn reset<B: BusInterface>(&mut self, bus: &mut B) {
        let reset_vector_lsb = bus.read(RESET_VECTOR);
        let reset_vector_msb = bus.read(RESET_VECTOR + 1);
        self.registers.pc = u16::from_le_bytes([reset_vector_lsb, reset_vector_msb]);

        self.registers.sp = self.registers.sp.wrapping_sub(3);
        self.registers.status.interrupt_disable = true;

        self.nmi_pending = false;
        self.frozen = false;
    }

    /// Execute a single instruction, or service a pending interrupt if one is due.
    ///
    /// The NMI line is edge-detected at instruction boundaries; components raise the line during
    /// the bus accesses of the previous instruction.
    pub fn execute_instruction<B: BusInterface>(&mut self, bus: &mut B) {
        if self.frozen {
            // Frozen by KIL; burn a cycle so time still advances
            bus.read(self.registers.pc);
            return;
        }

        self.poll_nmi_edge(bus);

        if self.nmi_pending {
            self.nmi_pending = false;
            self.service_interrupt(bus, NMI_VECTOR);
            return;
        }

        if bus.irq() == InterruptLine::Low && !self.registers.status.interrupt_disable {
            self.service_interrupt(bus, IRQ_VECTOR);
            return;
        }

        let opcode = self.fetch_operand(bus);
        log::trace!(
            "Executing {opcode:02X} from PC {:04X}: A={:02X} X={:02X} Y={:02X} SP={:02X} P={:02X}",
            self.registers.pc.wrapping_sub(1),
            self.registers.accumulator,
            self.registers.x,
            self.registers.y,
            self.registers.sp,
            self.registers.status.to_byte(StatusReadContext::PushStack)
        );

        self.execute_opcode(bus, opcode);
    }

    fn poll_nmi_edge<B: BusInterface>(&mut self, bus: &mut B) {
        let level = bus.nmi();
        if self.nmi_last_level == InterruptLine::High && level == InterruptLine::Low {
            self.nmi_pending = true;
        }
        self.nmi_last_level = level;
    }

    /// 7-cycle hardware interrupt sequence. The vector is re-evaluated right before the vector
    /// fetch so that an NMI arriving mid-sequence hijacks a BRK or IRQ.
    fn service_interrupt<B: BusInterface>(&mut self, bus: &mut B, vector: u16) {
        bus.read(self.registers.pc);
        bus.read(self.registers.pc);

        let [pc_lsb, pc_msb] = self.registers.pc.to_le_bytes();
        self.push_stack(bus, pc_msb);
        self.push_stack(bus, pc_lsb);
        self.push_stack(
            bus,
            self.registers.status.to_byte(StatusReadContext::HardwareInterruptHandler),
        );

        let vector = self.hijackable_vector(bus, vector);
        // NMOS leaves D alone on hardware interrupts; 65C02 clears it on every interrupt entry
        self.finish_interrupt_sequence(bus, vector, self.variant == CpuVariant::Cmos);
    }

    fn hijackable_vector<B: BusInterface>(&mut self, bus: &mut B, requested: u16) -> u16 {
        self.poll_nmi_edge(bus);
        if requested != NMI_VECTOR && self.nmi_pending {
            self.nmi_pending = false;
            return NMI_VECTOR;
        }
        requested
    }

    fn finish_interrupt_sequence<B: BusInterface>(
        &mut self,
        bus: &mut B,
        vector: u16,
        clear_decimal: bool,
    ) {
        self.registers.status.interrupt_disable = true;
        if clear_decimal {
            self.registers.status.decimal = false;
        }

        let vector_lsb = bus.read(vector);
        let vector_msb = bus.read(vector + 1);
        self.registers.pc = u16::from_le_bytes([vector_lsb, vector_msb]);
    }

    #[inline]
    #[must_use]
    pub fn pc(&self) -> u16 {
        self.registers.pc
    }

    #[inline]
    #[must_use]
    pub fn variant(&self) -> CpuVariant {
        self.variant
    }

    #[must_use]
    pub fn registers(&self) -> &CpuRegisters {
        &self.registers
    }

    pub fn set_registers(&mut self, registers: CpuRegisters) {
        self.registers = registers;
    }

    /// Return whether the CPU has frozen from a KIL instruction.
    #[inline]
    #[must_use]
    pub fn frozen(&self) -> bool {
        self.frozen
    }
}

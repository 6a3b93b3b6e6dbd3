//! ARM7TDMI instruction interpreter (ARMv4T: ARM + Thumb instruction sets).
//!
//! The 3-stage pipeline is modeled through R15's visible value: while an instruction executes,
//! R15 reads as the instruction address plus 8 (ARM) or plus 4 (Thumb). Banked R13/R14 (and
//! R8-R12 for FIQ) are swapped on mode changes, and each exception mode has its own SPSR.
//!
//! `execute_instruction` runs one instruction and returns an approximate cycle count using the
//! documented S/N/I cycle totals; memory wait states are the bus implementation's concern.

pub mod bus;
mod instructions;
mod thumb;

use crate::bus::{BusInterface, MemoryCycle};
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum CpuState {
    #[default]
    Arm,
    Thumb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum CpuMode {
    User,
    Fiq,
    Irq,
    #[default]
    Supervisor,
    Abort,
    Undefined,
    System,
}

impl CpuMode {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x1F {
            0x11 => Self::Fiq,
            0x12 => Self::Irq,
            0x13 => Self::Supervisor,
            0x17 => Self::Abort,
            0x1B => Self::Undefined,
            0x1F => Self::System,
            // 0x10 is User; anything else is architecturally unpredictable, treat as User
            _ => Self::User,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            Self::User => 0x10,
            Self::Fiq => 0x11,
            Self::Irq => 0x12,
            Self::Supervisor => 0x13,
            Self::Abort => 0x17,
            Self::Undefined => 0x1B,
            Self::System => 0x1F,
        }
    }

    /// User and System share the user register bank; every exception mode banks R13/R14.
    fn bank_index(self) -> usize {
        match self {
            Self::User | Self::System => 0,
            Self::Fiq => 1,
            Self::Irq => 2,
            Self::Supervisor => 3,
            Self::Abort => 4,
            Self::Undefined => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct StatusRegister {
    pub sign: bool,
    pub zero: bool,
    pub carry: bool,
    pub overflow: bool,
    pub irq_disabled: bool,
    pub fiq_disabled: bool,
    pub state: CpuState,
    pub mode: CpuMode,
}

impl StatusRegister {
    fn power_on() -> Self {
        Self {
            sign: false,
            zero: false,
            carry: false,
            overflow: false,
            irq_disabled: true,
            fiq_disabled: true,
            state: CpuState::Arm,
            mode: CpuMode::Supervisor,
        }
    }
}

impl From<StatusRegister> for u32 {
    fn from(value: StatusRegister) -> Self {
        (u32::from(value.sign) << 31)
            | (u32::from(value.zero) << 30)
            | (u32::from(value.carry) << 29)
            | (u32::from(value.overflow) << 28)
            | (u32::from(value.irq_disabled) << 7)
            | (u32::from(value.fiq_disabled) << 6)
            | (u32::from(value.state == CpuState::Thumb) << 5)
            | value.mode.to_bits()
    }
}

impl From<u32> for StatusRegister {
    fn from(value: u32) -> Self {
        Self {
            sign: value.bit(31),
            zero: value.bit(30),
            carry: value.bit(29),
            overflow: value.bit(28),
            irq_disabled: value.bit(7),
            fiq_disabled: value.bit(6),
            state: if value.bit(5) { CpuState::Thumb } else { CpuState::Arm },
            mode: CpuMode::from_bits(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exception {
    Undefined,
    SoftwareInterrupt,
    Irq,
}

impl Exception {
    fn vector(self) -> u32 {
        match self {
            Self::Undefined => 0x04,
            Self::SoftwareInterrupt => 0x08,
            Self::Irq => 0x18,
        }
    }

    fn mode(self) -> CpuMode {
        match self {
            Self::Undefined => CpuMode::Undefined,
            Self::SoftwareInterrupt => CpuMode::Supervisor,
            Self::Irq => CpuMode::Irq,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
struct Registers {
    /// Active register file; R15 is the program counter
    r: [u32; 16],
    /// Banked R13/R14 per bank index (usr/fiq/irq/svc/abt/und)
    r13_banked: [u32; 6],
    r14_banked: [u32; 6],
    /// FIQ additionally banks R8-R12
    r8_r12_fiq: [u32; 5],
    r8_r12_usr: [u32; 5],
    cpsr: StatusRegister,
    /// SPSR per exception bank; index 0 (usr/sys) is unused
    spsr: [StatusRegister; 6],
}

impl Registers {
    fn power_on() -> Self {
        Self {
            r: [0; 16],
            r13_banked: [0; 6],
            r14_banked: [0; 6],
            r8_r12_fiq: [0; 5],
            r8_r12_usr: [0; 5],
            cpsr: StatusRegister::power_on(),
            spsr: [StatusRegister::power_on(); 6],
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Arm7Tdmi {
    registers: Registers,
}

impl Arm7Tdmi {
    #[must_use]
    pub fn new() -> Self {
        Self { registers: Registers::power_on() }
    }

    pub fn reset(&mut self) {
        self.registers = Registers::power_on();
    }

    /// Manually set the execution entry point (e.g. the cartridge entry after BIOS handoff).
    pub fn set_pc(&mut self, pc: u32) {
        self.registers.r[15] = pc;
    }

    #[inline]
    #[must_use]
    pub fn pc(&self) -> u32 {
        self.registers.r[15]
    }

    #[must_use]
    pub fn cpsr(&self) -> StatusRegister {
        self.registers.cpsr
    }

    #[must_use]
    pub fn register(&self, index: usize) -> u32 {
        self.registers.r[index & 0xF]
    }

    pub fn set_register(&mut self, index: usize, value: u32) {
        self.registers.r[index & 0xF] = value;
    }

    /// Execute one instruction (or take a pending IRQ) and return its cycle count.
    pub fn execute_instruction<B: BusInterface>(&mut self, bus: &mut B) -> u32 {
        if bus.irq() && !self.registers.cpsr.irq_disabled {
            return self.enter_exception(Exception::Irq);
        }

        match self.registers.cpsr.state {
            CpuState::Arm => {
                let pc = self.registers.r[15] & !3;
                let opcode = bus.fetch_opcode_word(pc, MemoryCycle::S);

                // Pipeline: R15 reads as PC+8 during execution
                self.registers.r[15] = pc.wrapping_add(8);
                let cycles = instructions::execute_arm(self, bus, opcode);
                if self.registers.r[15] == pc.wrapping_add(8) {
                    self.registers.r[15] = pc.wrapping_add(4);
                }
                cycles
            }
            CpuState::Thumb => {
                let pc = self.registers.r[15] & !1;
                let opcode = bus.fetch_opcode_halfword(pc, MemoryCycle::S);

                // Pipeline: R15 reads as PC+4 during execution
                self.registers.r[15] = pc.wrapping_add(4);
                let cycles = thumb::execute_thumb(self, bus, opcode);
                if self.registers.r[15] == pc.wrapping_add(4) {
                    self.registers.r[15] = pc.wrapping_add(2);
                }
                cycles
            }
        }
    }

    /// Switch CPU mode, swapping the banked registers in and out of the active file.
    pub(crate) fn change_mode(&mut self, new_mode: CpuMode) {
        let old_mode = self.registers.cpsr.mode;
        if old_mode == new_mode {
            return;
        }

        let old_bank = old_mode.bank_index();
        let new_bank = new_mode.bank_index();

        self.registers.r13_banked[old_bank] = self.registers.r[13];
        self.registers.r14_banked[old_bank] = self.registers.r[14];
        self.registers.r[13] = self.registers.r13_banked[new_bank];
        self.registers.r[14] = self.registers.r14_banked[new_bank];

        // FIQ banks R8-R12 as well
        if (old_mode == CpuMode::Fiq) != (new_mode == CpuMode::Fiq) {
            if new_mode == CpuMode::Fiq {
                self.registers.r8_r12_usr.copy_from_slice(&self.registers.r[8..13]);
                self.registers.r[8..13].copy_from_slice(&self.registers.r8_r12_fiq);
            } else {
                self.registers.r8_r12_fiq.copy_from_slice(&self.registers.r[8..13]);
                self.registers.r[8..13].copy_from_slice(&self.registers.r8_r12_usr);
            }
        }

        self.registers.cpsr.mode = new_mode;
    }

    pub(crate) fn spsr(&self) -> StatusRegister {
        self.registers.spsr[self.registers.cpsr.mode.bank_index()]
    }

    pub(crate) fn set_spsr(&mut self, value: StatusRegister) {
        let bank = self.registers.cpsr.mode.bank_index();
        if bank != 0 {
            self.registers.spsr[bank] = value;
        }
    }

    pub(crate) fn enter_exception(&mut self, exception: Exception) -> u32 {
        let old_cpsr = self.registers.cpsr;
        let new_mode = exception.mode();

        // Return address: for IRQ this is the interrupted instruction + 4; for SWI/undefined
        // the instruction after the faulting one
        let return_address = match (exception, old_cpsr.state) {
            (Exception::Irq, CpuState::Arm) => self.registers.r[15].wrapping_add(4),
            (Exception::Irq, CpuState::Thumb) => self.registers.r[15].wrapping_add(4),
            (_, CpuState::Arm) => self.registers.r[15].wrapping_sub(4),
            (_, CpuState::Thumb) => self.registers.r[15].wrapping_sub(2),
        };

        self.change_mode(new_mode);
        self.registers.spsr[new_mode.bank_index()] = old_cpsr;
        self.registers.r[14] = return_address;

        self.registers.cpsr.state = CpuState::Arm;
        self.registers.cpsr.irq_disabled = true;
        self.registers.r[15] = exception.vector();

        3
    }
}

impl Default for Arm7Tdmi {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    fn new_cpu_arm(program: &[u32]) -> (Arm7Tdmi, InMemoryBus) {
        let mut bus = InMemoryBus::new();
        for (i, &word) in program.iter().enumerate() {
            bus.memory[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
        }
        (Arm7Tdmi::new(), bus)
    }

    #[test]
    fn pipeline_pc_plus_8_visible() {
        // MOV r0, r15 at address 0: r0 must read 8
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE1A0000F]);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 8);
        assert_eq!(cpu.pc(), 4);
    }

    #[test]
    fn data_processing_flags() {
        // MOVS r0, #0 -> Z set; SUBS r1, r0, #1 -> N set, C clear (borrow)
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE3B00000, 0xE2501001]);
        cpu.execute_instruction(&mut bus);
        assert!(cpu.cpsr().zero);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(1), u32::MAX);
        assert!(cpu.cpsr().sign);
        assert!(!cpu.cpsr().carry);
    }

    #[test]
    fn add_sets_carry_and_overflow() {
        // MOV r0, #0x80000000 (via MVN/shift trick): use MOV r0, #2, MOV r0, r0 LSL #30
        // Simpler: ADDS r2, r1, r1 with r1 = 0x40000000 -> overflow set
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE0912001]); // ADDS r2, r1, r1
        cpu.set_register(1, 0x4000_0000);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(2), 0x8000_0000);
        assert!(cpu.cpsr().overflow);
        assert!(cpu.cpsr().sign);
        assert!(!cpu.cpsr().carry);
    }

    #[test]
    fn conditional_execution_skips() {
        // MOVEQ r0, #5 with Z clear: must not execute
        let (mut cpu, mut bus) = new_cpu_arm(&[0x03A00005]);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 0);
        assert_eq!(cpu.pc(), 4);
    }

    #[test]
    fn branch_with_link() {
        // BL +8 from address 0: branches to 0x10 (0 + 8 + 8), LR = 4
        let (mut cpu, mut bus) = new_cpu_arm(&[0xEB000002]);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x10);
        assert_eq!(cpu.register(14), 4);
    }

    #[test]
    fn bx_enters_thumb_state() {
        // MOV r0, #0x101 / BX r0
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE3A00C01, 0xE3800001, 0xE12FFF10]);
        // MOV r0, #0x100 (0xC01 = rotate 24, imm 1 -> 1 ror 24 = 0x100)
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 0x100);
        cpu.execute_instruction(&mut bus); // ORR r0, r0, #1
        cpu.execute_instruction(&mut bus); // BX r0

        assert_eq!(cpu.cpsr().state, CpuState::Thumb);
        assert_eq!(cpu.pc(), 0x100);
    }

    #[test]
    fn ldr_str_round_trip() {
        // STR r1, [r0] / LDR r2, [r0]
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE5801000, 0xE5902000]);
        cpu.set_register(0, 0x1000);
        cpu.set_register(1, 0xDEADBEEF);

        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(2), 0xDEADBEEF);
    }

    #[test]
    fn ldr_unaligned_rotates() {
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE5902000]); // LDR r2, [r0]
        bus.memory[0x1000..0x1004].copy_from_slice(&0x11223344_u32.to_le_bytes());
        cpu.set_register(0, 0x1001);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(2), 0x4411_2233);
    }

    #[test]
    fn ldm_stm_round_trip() {
        // STMIA r0!, {r1-r3} / LDMDB r0!, {r4-r6}
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE8A0000E, 0xE9300070]);
        cpu.set_register(0, 0x2000);
        cpu.set_register(1, 0x11);
        cpu.set_register(2, 0x22);
        cpu.set_register(3, 0x33);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 0x200C);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 0x2000);
        assert_eq!(cpu.register(4), 0x11);
        assert_eq!(cpu.register(5), 0x22);
        assert_eq!(cpu.register(6), 0x33);
    }

    #[test]
    fn multiply_long_unsigned() {
        // UMULL r0, r1, r2, r3
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE0810392]);
        cpu.set_register(2, 0xFFFF_FFFF);
        cpu.set_register(3, 2);
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 0xFFFF_FFFE);
        assert_eq!(cpu.register(1), 1);
    }

    #[test]
    fn swi_banks_registers_and_vectors() {
        let (mut cpu, mut bus) = new_cpu_arm(&[0xEF000000]); // SWI #0
        // Start in System mode so we can observe the bank switch
        let mut cpsr = cpu.cpsr();
        cpsr.mode = CpuMode::System;
        cpsr.irq_disabled = false;
        cpu.registers.cpsr = cpsr;
        cpu.set_register(13, 0x3000);
        cpu.set_register(14, 0x1234);

        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.pc(), 0x08);
        assert_eq!(cpu.cpsr().mode, CpuMode::Supervisor);
        assert!(cpu.cpsr().irq_disabled);
        // Supervisor r13/r14 are banked; r14_svc holds the return address
        assert_eq!(cpu.register(14), 4);
        assert_ne!(cpu.register(13), 0x3000);

        // Return via MOVS pc, lr restores mode and registers
        bus.memory[0x08..0x0C].copy_from_slice(&0xE1B0F00E_u32.to_le_bytes());
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.cpsr().mode, CpuMode::System);
        assert_eq!(cpu.register(13), 0x3000);
        assert_eq!(cpu.register(14), 0x1234);
    }

    #[test]
    fn irq_taken_when_enabled() {
        let (mut cpu, mut bus) = new_cpu_arm(&[0xE3A00001, 0xE3A00002]);
        let mut cpsr = cpu.cpsr();
        cpsr.irq_disabled = false;
        cpsr.mode = CpuMode::System;
        cpu.registers.cpsr = cpsr;

        cpu.execute_instruction(&mut bus);
        bus.irq = true;
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.pc(), 0x18);
        assert_eq!(cpu.cpsr().mode, CpuMode::Irq);
        assert!(cpu.cpsr().irq_disabled);
    }

    #[test]
    fn thumb_basic_alu_and_branch() {
        // Thumb program at 0x100: MOV r0, #5; ADD r0, #3; B -4 (loop back over the ADD)
        let (mut cpu, mut bus) = new_cpu_arm(&[]);
        let program: [u16; 3] = [0x2005, 0x3003, 0xE7FD];
        for (i, &halfword) in program.iter().enumerate() {
            let addr = 0x100 + 2 * i;
            bus.memory[addr..addr + 2].copy_from_slice(&halfword.to_le_bytes());
        }

        cpu.registers.cpsr.state = CpuState::Thumb;
        cpu.set_pc(0x100);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 5);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(0), 8);

        // B with offset -3*2: PC = 0x104 + 4 - 6 = 0x102
        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.pc(), 0x102);
    }

    #[test]
    fn thumb_bl_pair() {
        // BL target 0x200 from 0x100: H=0 with offset, then H=1
        let (mut cpu, mut bus) = new_cpu_arm(&[]);
        // First half: LR = PC(0x104) + (0 << 12) = 0x104; second half: PC = LR + (0x7C << 1)
        let program: [u16; 2] = [0xF000, 0xF87C];
        for (i, &halfword) in program.iter().enumerate() {
            let addr = 0x100 + 2 * i;
            bus.memory[addr..addr + 2].copy_from_slice(&halfword.to_le_bytes());
        }

        cpu.registers.cpsr.state = CpuState::Thumb;
        cpu.set_pc(0x100);

        cpu.execute_instruction(&mut bus);
        cpu.execute_instruction(&mut bus);

        assert_eq!(cpu.pc(), 0x104 + (0x7C << 1));
        // LR holds the return address with bit 0 set
        assert_eq!(cpu.register(14), 0x103 + 2);
    }

    #[test]
    fn thumb_push_pop() {
        let (mut cpu, mut bus) = new_cpu_arm(&[]);
        // PUSH {r0, r1} / POP {r2, r3}
        let program: [u16; 2] = [0xB403, 0xBC0C];
        for (i, &halfword) in program.iter().enumerate() {
            let addr = 0x100 + 2 * i;
            bus.memory[addr..addr + 2].copy_from_slice(&halfword.to_le_bytes());
        }

        cpu.registers.cpsr.state = CpuState::Thumb;
        cpu.set_pc(0x100);
        cpu.set_register(13, 0x4000);
        cpu.set_register(0, 0xAA);
        cpu.set_register(1, 0xBB);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(13), 0x4000 - 8);

        cpu.execute_instruction(&mut bus);
        assert_eq!(cpu.register(13), 0x4000);
        assert_eq!(cpu.register(2), 0xAA);
        assert_eq!(cpu.register(3), 0xBB);
    }
}

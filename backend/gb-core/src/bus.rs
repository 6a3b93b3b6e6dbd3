//! The main bus: address decoding plus the M-cycle scheduler that keeps the PPU, APU, timer,
//! and DMA engines in lockstep with the CPU.
//!
//! In normal speed one M-cycle is 4 PPU dots and 1 APU tick; in CGB double speed the CPU and
//! timer run twice as fast relative to the PPU and APU, so each M-cycle is 2 dots and the APU
//! ticks every other M-cycle.

use crate::apu::Apu;
use crate::cartridge::Mapper;
use crate::dma::{OamDma, VramDma};
use crate::input::JoypadRegister;
use crate::interrupts::{InterruptRegisters, InterruptType};
use crate::memory::Memory;
use crate::ppu::Ppu;
use crate::sm83::BusInterface;
use crate::HardwareMode;
use bincode::{Decode, Encode};
use nexen_common::cheats::CheatTable;
use nexen_common::num::GetBit;
use nexen_proc_macros::PartialClone;

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Bus {
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    #[partial_clone(partial)]
    pub(crate) mapper: Mapper,
    pub(crate) memory: Memory,
    pub(crate) timer: crate::timer::Timer,
    pub(crate) interrupts: InterruptRegisters,
    pub(crate) joypad: JoypadRegister,
    oam_dma: OamDma,
    vram_dma: VramDma,
    hardware_mode: HardwareMode,
    double_speed: bool,
    speed_switch_armed: bool,
    // Serial stub: written data is captured, transfers complete immediately
    serial_data: u8,
    serial_control: u8,
    master_clock: u64,
    frame_cycle: u32,
    apu_tick_parity: bool,
    pub(crate) cheats: CheatTable,
}

impl Bus {
    pub(crate) fn new(mapper: Mapper, hardware_mode: HardwareMode) -> Self {
        Self {
            ppu: Ppu::new(hardware_mode),
            apu: Apu::new(),
            mapper,
            memory: Memory::new(hardware_mode == HardwareMode::Cgb),
            timer: crate::timer::Timer::new(),
            interrupts: InterruptRegisters::default(),
            joypad: JoypadRegister::new(),
            oam_dma: OamDma::default(),
            vram_dma: VramDma::new(),
            hardware_mode,
            double_speed: false,
            speed_switch_armed: false,
            serial_data: 0,
            serial_control: 0,
            master_clock: 0,
            frame_cycle: 0,
            apu_tick_parity: false,
            cheats: CheatTable::new(),
        }
    }

    #[inline]
    pub(crate) fn frame_cycle(&self) -> u32 {
        self.frame_cycle
    }

    pub(crate) fn start_new_frame(&mut self) {
        self.frame_cycle = 0;
    }

    #[inline]
    pub(crate) fn double_speed(&self) -> bool {
        self.double_speed
    }

    /// One CPU M-cycle: advance every other component to the new master-clock target.
    fn m_cycle(&mut self) {
        self.master_clock += 1;

        let ppu_dots = if self.double_speed { 2 } else { 4 };
        self.ppu.tick_dots(ppu_dots, &mut self.interrupts);

        if self.ppu.get_and_clear_hblank_entered() {
            self.vram_dma.notify_hblank();
        }

        // The timer runs at CPU speed; the APU does not double up
        self.timer.tick_m_cycle(&mut self.interrupts);
        self.apu_tick_parity = !self.apu_tick_parity;
        if !self.double_speed || self.apu_tick_parity {
            self.frame_cycle += 1;
            let frame_cycle = self.frame_cycle;
            self.apu.tick_m_cycle(frame_cycle);
        }

        self.run_dma_engines();
    }

    fn run_dma_engines(&mut self) {
        if let Some((source, oam_offset)) = self.oam_dma.next_transfer() {
            let byte = self.read_resolved(source);
            self.ppu.oam[usize::from(oam_offset)] = byte;
        }

        // VRAM DMA copies 2 bytes per M-cycle while active
        for _ in 0..2 {
            if let Some((source, dest)) = self.vram_dma.next_transfer() {
                let byte = self.read_resolved(source);
                self.ppu.dma_write_vram(0x8000 | (dest & 0x1FFF), byte);
            }
        }
    }

    fn read_resolved(&self, address: u16) -> u8 {
        match address {
            0x0000..=0x7FFF => self.mapper.read_rom(address),
            0x8000..=0x9FFF => self.ppu.read_vram(address),
            0xA000..=0xBFFF => self.mapper.read_ram(address),
            0xC000..=0xDFFF | 0xE000..=0xFDFF => self.memory.read_wram(address),
            0xFE00..=0xFE9F => self.ppu.read_oam(address),
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00..=0xFF7F => self.read_io_register(address),
            0xFF80..=0xFFFE => self.memory.read_hram(address),
            0xFFFF => self.interrupts.enabled,
        }
    }

    fn read_io_register(&self, address: u16) -> u8 {
        match address {
            0xFF00 => self.joypad.read(),
            0xFF01 => self.serial_data,
            0xFF02 => self.serial_control | 0x7E,
            0xFF04..=0xFF07 => self.timer.read_register(address),
            0xFF0F => self.interrupts.read_if(),
            0xFF10..=0xFF3F => self.apu.read_register(address),
            0xFF46 => self.oam_dma.read_register(),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6B => {
                self.ppu.read_register(address)
            }
            0xFF4D if self.hardware_mode == HardwareMode::Cgb => {
                0x7E | (u8::from(self.double_speed) << 7) | u8::from(self.speed_switch_armed)
            }
            0xFF55 if self.hardware_mode == HardwareMode::Cgb => self.vram_dma.read_status(),
            0xFF70 if self.hardware_mode == HardwareMode::Cgb => self.memory.read_svbk(),
            _ => 0xFF,
        }
    }

    fn write_resolved(&mut self, address: u16, value: u8) {
        match address {
            0x0000..=0x7FFF => self.mapper.write_rom_register(address, value),
            0x8000..=0x9FFF => self.ppu.write_vram(address, value),
            0xA000..=0xBFFF => self.mapper.write_ram(address, value),
            0xC000..=0xDFFF | 0xE000..=0xFDFF => self.memory.write_wram(address, value),
            0xFE00..=0xFE9F => self.ppu.write_oam(address, value),
            0xFEA0..=0xFEFF => {}
            0xFF00..=0xFF7F => self.write_io_register(address, value),
            0xFF80..=0xFFFE => self.memory.write_hram(address, value),
            0xFFFF => self.interrupts.enabled = value & 0x1F,
        }
    }

    fn write_io_register(&mut self, address: u16, value: u8) {
        match address {
            0xFF00 => self.joypad.write(value),
            0xFF01 => self.serial_data = value,
            0xFF02 => {
                self.serial_control = value & 0x83;
                // With no link partner the transfer shifts in all 1s and completes at once
                if value.bit(7) && value.bit(0) {
                    self.serial_data = 0xFF;
                    self.serial_control &= !0x80;
                    self.interrupts.request(InterruptType::Serial);
                }
            }
            0xFF04..=0xFF07 => self.timer.write_register(address, value),
            0xFF0F => self.interrupts.flags = value & 0x1F,
            0xFF10..=0xFF3F => self.apu.write_register(address, value),
            0xFF46 => self.oam_dma.start(value),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6B => {
                self.ppu.write_register(address, value, &mut self.interrupts);
            }
            0xFF4D if self.hardware_mode == HardwareMode::Cgb => {
                self.speed_switch_armed = value.bit(0);
            }
            0xFF51..=0xFF55 if self.hardware_mode == HardwareMode::Cgb => {
                self.vram_dma.write_register(address, value);
            }
            0xFF70 if self.hardware_mode == HardwareMode::Cgb => self.memory.write_svbk(value),
            _ => {}
        }
    }
}

impl BusInterface for Bus {
    fn read(&mut self, address: u16) -> u8 {
        self.m_cycle();
        let value = self.read_resolved(address);
        if self.cheats.is_empty() { value } else { self.cheats.apply(address.into(), value) }
    }

    fn write(&mut self, address: u16, value: u8) {
        self.m_cycle();
        self.write_resolved(address, value);
    }

    fn idle(&mut self) {
        self.m_cycle();
    }

    fn read_ie_register(&self) -> u8 {
        self.interrupts.read_ie()
    }

    fn read_if_register(&self) -> u8 {
        self.interrupts.read_if() & 0x1F
    }

    fn acknowledge_interrupt(&mut self, interrupt: InterruptType) {
        self.interrupts.acknowledge(interrupt);
    }

    fn cpu_halted_by_dma(&self) -> bool {
        self.vram_dma.cpu_halted()
    }

    fn speed_switch_armed(&self) -> bool {
        self.speed_switch_armed
    }

    fn perform_speed_switch(&mut self) {
        self.double_speed = !self.double_speed;
        self.speed_switch_armed = false;
        log::debug!("CGB speed switch: double speed now {}", self.double_speed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{CartridgeHeader, create_mapper};

    fn build_test_rom() -> Vec<u8> {
        let mut rom = vec![0; 32 * 1024];
        rom[0x0134..0x0138].copy_from_slice(b"TEST");
        let mut checksum = 0_u8;
        for &byte in &rom[0x0134..0x014D] {
            checksum = checksum.wrapping_sub(byte).wrapping_sub(1);
        }
        rom[0x014D] = checksum;
        rom
    }

    fn new_bus() -> Bus {
        let rom = build_test_rom();
        let header = CartridgeHeader::parse(&rom).unwrap();
        let mapper = create_mapper(rom, &header, None).unwrap();
        Bus::new(mapper, HardwareMode::Dmg)
    }

    #[test]
    fn wram_echo_region() {
        let mut bus = new_bus();
        bus.write(0xC123, 0xAB);
        assert_eq!(bus.read(0xE123), 0xAB);
    }

    #[test]
    fn oam_dma_copies_one_byte_per_m_cycle() {
        let mut bus = new_bus();
        for i in 0..160_u16 {
            bus.write(0xC000 + i, i as u8);
        }

        bus.write(0xFF46, 0xC0);
        // 160 M-cycles to finish
        for _ in 0..160 {
            bus.idle();
        }

        assert_eq!(bus.ppu.oam[0], 0);
        assert_eq!(bus.ppu.oam[159], 159);
    }

    #[test]
    fn interrupt_flags_unused_bits_read_high() {
        let mut bus = new_bus();
        bus.write(0xFF0F, 0x00);
        assert_eq!(bus.read(0xFF0F) & 0xE0, 0xE0);
    }
}

//! The CPU bus and the master-clock scheduler.
//!
//! The NES has two address spaces: the 16-bit CPU bus (2KB internal RAM, PPU registers, APU/IO
//! registers, cartridge) and the 14-bit PPU bus (pattern tables, nametables, palette RAM). The
//! CPU only reaches the PPU bus through memory-mapped registers.
//!
//! Every CPU bus access advances the monotonic master clock by one CPU cycle and drives the
//! PPU, APU, and mapper forward to the new target before the access resolves, so same-cycle
//! register semantics match hardware ordering. Cartridge-space reads resolve through a 256-slot
//! page table whose ROM/RAM pages index the backing arrays directly; mapper register writes
//! rewrite the affected slots.

use crate::TimingModeExt;
use crate::apu::Apu;
use crate::cartridge::{CpuPage, Mapper};
use crate::input::InputState;
use crate::ppu::Ppu;
use bincode::{Decode, Encode};
use mos6502_emu::bus::{BusInterface, InterruptLine};
use nexen_common::cheats::CheatTable;
use nexen_common::frontend::TimingMode;
use nexen_proc_macros::PartialClone;

pub(crate) const CPU_RAM_LEN: usize = 2048;

/// Per-source IRQ line aggregation. Sources pull the line low by setting their bit.
#[derive(Debug, Clone, Default, Encode, Decode)]
pub(crate) struct InterruptLines {
    irq_mask: u8,
}

impl InterruptLines {
    pub(crate) const APU_FRAME_COUNTER: u8 = 1 << 0;
    pub(crate) const APU_DMC: u8 = 1 << 1;
    pub(crate) const MAPPER: u8 = 1 << 2;

    pub(crate) fn set_irq_source(&mut self, source: u8, active: bool) {
        if active {
            self.irq_mask |= source;
        } else {
            self.irq_mask &= !source;
        }
    }

    pub(crate) fn irq(&self) -> bool {
        self.irq_mask != 0
    }
}

/// Everything on the board that is not the PPU, APU, or cartridge.
#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Chipset {
    pub(crate) ram: [u8; CPU_RAM_LEN],
    pub(crate) input: InputState,
    pub(crate) interrupt_lines: InterruptLines,
    timing_mode: TimingMode,
    master_clock: u64,
    frame_cycle: u32,
    open_bus: u8,
    oam_dma_page: Option<u8>,
    pub(crate) cheats: CheatTable,
    cpu_pages: [CpuPage; 256],
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Bus {
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    #[partial_clone(partial)]
    pub(crate) mapper: Mapper,
    pub(crate) chipset: Chipset,
}

impl Bus {
    pub(crate) fn new(mapper: Mapper, ppu: Ppu, apu: Apu, timing_mode: TimingMode) -> Self {
        let mut chipset = Chipset {
            ram: [0; CPU_RAM_LEN],
            input: InputState::new(),
            interrupt_lines: InterruptLines::default(),
            timing_mode,
            master_clock: 0,
            frame_cycle: 0,
            open_bus: 0,
            oam_dma_page: None,
            cheats: CheatTable::new(),
            cpu_pages: [CpuPage::Unmapped; 256],
        };
        mapper.rebuild_cpu_pages(&mut chipset.cpu_pages);

        Self { ppu, apu, mapper, chipset }
    }

    #[inline]
    pub(crate) fn master_clock(&self) -> u64 {
        self.chipset.master_clock
    }

    /// CPU cycles since the last frame boundary; the timestamp base for audio deltas.
    #[inline]
    pub(crate) fn frame_cycle(&self) -> u32 {
        self.chipset.frame_cycle
    }

    pub(crate) fn start_new_frame(&mut self) {
        self.chipset.frame_cycle = 0;
    }

    pub(crate) fn rebuild_cpu_pages(&mut self) {
        self.mapper.rebuild_cpu_pages(&mut self.chipset.cpu_pages);
    }

    /// Advance all non-CPU components by one CPU cycle and service any DMC sample fetch.
    fn cpu_cycle(&mut self) {
        if let Some(address) = self.tick_components() {
            // The DMC's DMA steals cycles from the CPU: stall cycles, then the fetch itself
            for _ in 0..3 {
                self.tick_components();
            }
            self.tick_components();
            let sample = self.read_resolved(address);
            self.apu.dmc_sample_fetched(sample);
        }
    }

    fn tick_components(&mut self) -> Option<u16> {
        self.chipset.master_clock += self.chipset.timing_mode.cpu_divider();
        self.chipset.frame_cycle += 1;

        self.ppu.run(&mut self.mapper, self.chipset.master_clock);

        let dma_request = self.apu.tick(self.chipset.frame_cycle);
        self.mapper.clock_cpu(self.chipset.frame_cycle);

        // Mapper IRQ counters are checked at the end of every CPU cycle
        self.chipset
            .interrupt_lines
            .set_irq_source(InterruptLines::APU_FRAME_COUNTER, self.apu.frame_irq());
        self.chipset.interrupt_lines.set_irq_source(InterruptLines::APU_DMC, self.apu.dmc_irq());
        self.chipset.interrupt_lines.set_irq_source(InterruptLines::MAPPER, self.mapper.irq());

        match dma_request {
            crate::apu::DmcDmaRequest::Fetch { address } => Some(address),
            crate::apu::DmcDmaRequest::None => None,
        }
    }

    /// Sprite DMA: 256 read/write pairs plus alignment, all consuming scheduler cycles before
    /// the CPU's read completes.
    fn run_oam_dma(&mut self, page: u8) {
        self.cpu_cycle();
        if self.apu.is_active_cycle() {
            self.cpu_cycle();
        }

        for offset in 0..=255_u8 {
            self.cpu_cycle();
            let byte = self.read_resolved(u16::from_le_bytes([offset, page]));
            self.cpu_cycle();
            let oam_addr = self.ppu.registers.oam_addr;
            self.ppu.oam[oam_addr as usize] = byte;
            self.ppu.registers.oam_addr = oam_addr.wrapping_add(1);
        }
    }

    /// Resolve a read without advancing time.
    fn read_resolved(&mut self, address: u16) -> u8 {
        match address {
            0x0000..=0x1FFF => self.chipset.ram[(address & 0x07FF) as usize],
            0x2000..=0x3FFF => self.ppu.read_register(&mut self.mapper, address & 0x0007),
            0x4015 => self.apu.read_status() | (self.chipset.open_bus & 0x20),
            0x4016 => (self.chipset.open_bus & 0xE0) | self.chipset.input.read_p1(),
            0x4017 => (self.chipset.open_bus & 0xE0) | self.chipset.input.read_p2(),
            // Write-only and test-mode registers read back open bus
            0x4000..=0x4014 | 0x4018..=0x401F => self.chipset.open_bus,
            0x4020..=0xFFFF => self.read_cartridge(address),
        }
    }

    #[inline]
    fn read_cartridge(&mut self, address: u16) -> u8 {
        let value = match self.chipset.cpu_pages[(address >> 8) as usize] {
            CpuPage::PrgRom(base) => {
                self.mapper.prg_rom_byte(base | u32::from(address & 0x00FF))
            }
            CpuPage::PrgRam(base) => {
                self.mapper.prg_ram_byte(base | u32::from(address & 0x00FF))
            }
            CpuPage::Handler => {
                self.mapper.read_cpu_address(address).unwrap_or(self.chipset.open_bus)
            }
            // Reads of unmapped regions return the residual bus value
            CpuPage::Unmapped => self.chipset.open_bus,
        };

        if self.chipset.cheats.is_empty() {
            value
        } else {
            self.chipset.cheats.apply(address.into(), value)
        }
    }

    fn write_resolved(&mut self, address: u16, value: u8) {
        match address {
            0x0000..=0x1FFF => self.chipset.ram[(address & 0x07FF) as usize] = value,
            0x2000..=0x3FFF => {
                self.ppu.write_register(&mut self.mapper, address & 0x0007, value);
            }
            0x4014 => {
                // OAM DMA halts the CPU on its next read cycle
                self.chipset.oam_dma_page = Some(value);
            }
            0x4016 => self.chipset.input.write_strobe(value),
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.write_register(address, value),
            0x4018..=0x401F => {}
            0x4020..=0xFFFF => {
                self.mapper.write_cpu_address(address, value);
                // Register writes can rewire the page table; PRG RAM data writes cannot
                if address >= 0x8000 {
                    self.rebuild_cpu_pages();
                }
            }
        }
    }
}

impl BusInterface for Bus {
    fn read(&mut self, address: u16) -> u8 {
        if let Some(page) = self.chipset.oam_dma_page.take() {
            self.run_oam_dma(page);
        }

        self.cpu_cycle();
        let value = self.read_resolved(address);
        self.chipset.open_bus = value;
        value
    }

    fn write(&mut self, address: u16, value: u8) {
        self.cpu_cycle();
        self.write_resolved(address, value);
        self.chipset.open_bus = value;
    }

    fn peek(&self, address: u16) -> u8 {
        match address {
            0x0000..=0x1FFF => self.chipset.ram[(address & 0x07FF) as usize],
            0x2000..=0x3FFF => self.ppu.peek_register(address & 0x0007),
            0x4015 => self.apu.peek_status(),
            0x4016 => self.chipset.input.peek_p1(),
            0x4017 => self.chipset.input.peek_p2(),
            0x4000..=0x4014 | 0x4018..=0x401F => self.chipset.open_bus,
            0x4020..=0xFFFF => {
                self.mapper.peek_cpu_address(address).unwrap_or(self.chipset.open_bus)
            }
        }
    }

    fn nmi(&self) -> InterruptLine {
        if self.ppu.nmi_line() { InterruptLine::Low } else { InterruptLine::High }
    }

    fn irq(&self) -> InterruptLine {
        if self.chipset.interrupt_lines.irq() {
            InterruptLine::Low
        } else {
            InterruptLine::High
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::from_ines_file;
    use nexen_common::cheats::CheatCode;

    fn new_bus() -> Bus {
        // 32KB NROM test image, PRG filled with $EA
        let mut rom = vec![0; 16 + 32 * 1024 + 8 * 1024];
        rom[..4].copy_from_slice(b"NES\x1A");
        rom[4] = 2;
        rom[5] = 1;
        for byte in &mut rom[16..16 + 32 * 1024] {
            *byte = 0xEA;
        }

        let mapper = from_ines_file(&rom, None, None).unwrap();
        let ppu = Ppu::new(TimingMode::Ntsc, false);
        let apu = Apu::new(TimingMode::Ntsc, false);
        Bus::new(mapper, ppu, apu, TimingMode::Ntsc)
    }

    #[test]
    fn ram_is_mirrored() {
        let mut bus = new_bus();
        bus.write(0x0000, 0xAB);
        assert_eq!(bus.read(0x0800), 0xAB);
        assert_eq!(bus.read(0x1000), 0xAB);
        assert_eq!(bus.read(0x1800), 0xAB);
    }

    #[test]
    fn master_clock_advances_per_cpu_cycle() {
        let mut bus = new_bus();
        let before = bus.master_clock();
        bus.read(0x0000);
        assert_eq!(bus.master_clock(), before + 12);
    }

    #[test]
    fn unmapped_reads_return_open_bus() {
        let mut bus = new_bus();
        // Put a known value on the bus, then read an unmapped cartridge address
        bus.read(0x8000); // $EA
        assert_eq!(bus.read(0x4020), 0xEA);
    }

    #[test]
    fn unmapped_writes_are_dropped() {
        let mut bus = new_bus();
        bus.write(0x4020, 0x55);
        bus.read(0x8000);
        assert_eq!(bus.read(0x4020), 0xEA);
    }

    #[test]
    fn peek_matches_read_for_plain_memory() {
        let mut bus = new_bus();
        bus.write(0x0123, 0x77);

        for address in [0x0123_u16, 0x8000, 0x9ABC, 0xFFFF] {
            let peeked = bus.peek(address);
            assert_eq!(bus.read(address), peeked, "mismatch at {address:04X}");
        }
    }

    #[test]
    fn ppustatus_read_has_side_effects_but_peek_does_not() {
        let mut bus = new_bus();
        // Run until the PPU raises vblank
        while !bus.ppu.in_vblank() {
            bus.read(0x0000);
        }

        let peeked = bus.peek(0x2002);
        assert_ne!(peeked & 0x80, 0);
        // Peek again: still set
        assert_ne!(bus.peek(0x2002) & 0x80, 0);
        // Real read clears it
        assert_ne!(bus.read(0x2002) & 0x80, 0);
        assert_eq!(bus.peek(0x2002) & 0x80, 0);
    }

    #[test]
    fn oam_dma_consumes_cycles_before_returning() {
        let mut bus = new_bus();
        for i in 0..=255_u8 {
            bus.write(0x0200 | u16::from(i), i);
        }

        let before = bus.master_clock();
        bus.write(0x4014, 0x02);
        // DMA runs when the CPU next reads
        bus.read(0x0000);
        let elapsed_cpu_cycles = (bus.master_clock() - before) / 12;

        // 1 write + 513/514 DMA + 1 read
        assert!((513..=516).contains(&elapsed_cpu_cycles), "elapsed {elapsed_cpu_cycles}");
        assert_eq!(bus.ppu.oam[0], 0);
        assert_eq!(bus.ppu.oam[255], 255);
    }

    #[test]
    fn cheat_applies_on_cartridge_reads() {
        let mut bus = new_bus();
        bus.chipset.cheats.set_codes(vec![CheatCode {
            address: 0x8000,
            compare: None,
            value: 0x42,
        }]);

        assert_eq!(bus.read(0x8000), 0x42);
        assert_eq!(bus.read(0x8001), 0xEA);
    }

    #[test]
    fn page_table_follows_bank_switch() {
        // UxROM image with distinct bank tags
        let prg_len = 8 * 16 * 1024;
        let mut rom = vec![0; 16 + prg_len];
        rom[..4].copy_from_slice(b"NES\x1A");
        rom[4] = 8;
        rom[5] = 0;
        rom[6] = 0x20; // mapper 2
        for bank in 0..8 {
            rom[16 + bank * 16 * 1024] = bank as u8;
        }

        let mapper = from_ines_file(&rom, None, None).unwrap();
        let ppu = Ppu::new(TimingMode::Ntsc, false);
        let apu = Apu::new(TimingMode::Ntsc, false);
        let mut bus = Bus::new(mapper, ppu, apu, TimingMode::Ntsc);

        assert_eq!(bus.read(0x8000), 0);
        bus.write(0x8000, 3);
        assert_eq!(bus.read(0x8000), 3);
        // Fixed last bank unaffected
        assert_eq!(bus.read(0xC000), 7);
    }
}

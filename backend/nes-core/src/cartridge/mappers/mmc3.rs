//! MMC3 (iNES mapper 4): 8KB PRG banking, 1KB/2KB CHR banking, and the A12-clocked scanline
//! IRQ counter.

use crate::cartridge::MapperImpl;
use crate::cartridge::mappers::{BankSizeKb, NametableMirroring, basic_ppu_read, basic_ppu_write};
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;
use nexen_proc_macros::PartialClone;

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Mmc3 {
    bank_select: u8,
    bank_registers: [u8; 8],
    prg_mode: bool,
    chr_mode: bool,
    nametable_mirroring: NametableMirroring,
    ram_enabled: bool,
    ram_write_protected: bool,
    irq_counter: u8,
    irq_reload_value: u8,
    irq_reload_pending: bool,
    irq_enabled: bool,
    irq_line: bool,
    last_a12: bool,
    a12_low_cycles: u8,
}

impl Mmc3 {
    pub(crate) fn new(mirroring: NametableMirroring) -> Self {
        Self {
            bank_select: 0,
            bank_registers: [0; 8],
            prg_mode: false,
            chr_mode: false,
            nametable_mirroring: mirroring,
            ram_enabled: true,
            ram_write_protected: false,
            irq_counter: 0,
            irq_reload_value: 0,
            irq_reload_pending: false,
            irq_enabled: false,
            irq_line: false,
            last_a12: false,
            a12_low_cycles: 0,
        }
    }
}

impl MapperImpl<Mmc3> {
    fn prg_rom_address(&self, address: u16) -> u32 {
        let last_bank = (self.cartridge.prg_rom.len() >> 13) as u8 - 1;
        let second_to_last = last_bank - 1;

        let bank = match (address, self.data.prg_mode) {
            (0x8000..=0x9FFF, false) | (0xC000..=0xDFFF, true) => self.data.bank_registers[6],
            (0xA000..=0xBFFF, _) => self.data.bank_registers[7],
            (0xC000..=0xDFFF, false) | (0x8000..=0x9FFF, true) => second_to_last,
            (0xE000..=0xFFFF, _) => last_bank,
            _ => panic!("invalid MMC3 PRG address: {address:04X}"),
        };
        BankSizeKb::Eight.to_absolute_address(bank, address)
    }

    fn chr_address(&self, address: u16) -> u32 {
        // In CHR mode 1 the 2KB banks cover $1000-$1FFF instead of $0000-$0FFF
        let address = if self.data.chr_mode { address ^ 0x1000 } else { address };

        match address {
            0x0000..=0x07FF => {
                BankSizeKb::Two.to_absolute_address(self.data.bank_registers[0] >> 1, address)
            }
            0x0800..=0x0FFF => {
                BankSizeKb::Two.to_absolute_address(self.data.bank_registers[1] >> 1, address)
            }
            0x1000..=0x13FF => {
                BankSizeKb::One.to_absolute_address(self.data.bank_registers[2], address)
            }
            0x1400..=0x17FF => {
                BankSizeKb::One.to_absolute_address(self.data.bank_registers[3], address)
            }
            0x1800..=0x1BFF => {
                BankSizeKb::One.to_absolute_address(self.data.bank_registers[4], address)
            }
            0x1C00..=0x1FFF => {
                BankSizeKb::One.to_absolute_address(self.data.bank_registers[5], address)
            }
            _ => panic!("invalid MMC3 CHR address: {address:04X}"),
        }
    }

    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x6000..=0x7FFF
                if !self.cartridge.prg_ram.is_empty() && self.data.ram_enabled =>
            {
                Some(self.cartridge.get_prg_ram(u32::from(address & 0x1FFF)))
            }
            0x8000..=0xFFFF => Some(self.cartridge.get_prg_rom(self.prg_rom_address(address))),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        match (address, address.bit(0)) {
            (0x6000..=0x7FFF, _) => {
                if !self.cartridge.prg_ram.is_empty()
                    && self.data.ram_enabled
                    && !self.data.ram_write_protected
                {
                    self.cartridge.set_prg_ram(u32::from(address & 0x1FFF), value);
                }
            }
            (0x8000..=0x9FFF, false) => {
                self.data.bank_select = value & 0x07;
                self.data.prg_mode = value.bit(6);
                self.data.chr_mode = value.bit(7);
            }
            (0x8000..=0x9FFF, true) => {
                self.data.bank_registers[self.data.bank_select as usize] = value;
            }
            (0xA000..=0xBFFF, false) => {
                // Boards hardwired to 4-screen mirroring ignore this register; not modeled
                self.data.nametable_mirroring = if value.bit(0) {
                    NametableMirroring::Horizontal
                } else {
                    NametableMirroring::Vertical
                };
            }
            (0xA000..=0xBFFF, true) => {
                self.data.ram_write_protected = value.bit(6);
                self.data.ram_enabled = value.bit(7);
            }
            (0xC000..=0xDFFF, false) => {
                self.data.irq_reload_value = value;
            }
            (0xC000..=0xDFFF, true) => {
                self.data.irq_counter = 0;
                self.data.irq_reload_pending = true;
            }
            (0xE000..=0xFFFF, false) => {
                self.data.irq_enabled = false;
                self.data.irq_line = false;
            }
            (0xE000..=0xFFFF, true) => {
                self.data.irq_enabled = true;
            }
            _ => {}
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        match address {
            0x0000..=0x1FFF => self.cartridge.get_chr(self.chr_address(address)),
            _ => basic_ppu_read(address, 0, self.data.nametable_mirroring, &self.cartridge, vram),
        }
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        match address {
            0x0000..=0x1FFF => {
                let chr_addr = self.chr_address(address);
                self.cartridge.set_chr_ram(chr_addr, value);
            }
            _ => basic_ppu_write(
                address,
                value,
                0,
                self.data.nametable_mirroring,
                &mut self.cartridge,
                vram,
            ),
        }
    }

    /// The IRQ counter clocks on A12 rising edges that follow a sufficiently long low period
    /// (the filter that makes the counter fire once per scanline during normal rendering).
    pub(crate) fn notify_ppu_address(&mut self, address: u16) {
        let a12 = address.bit(12);

        if a12 && !self.data.last_a12 && self.data.a12_low_cycles >= 10 {
            self.clock_irq_counter();
        }

        if a12 {
            self.data.a12_low_cycles = 0;
        }
        self.data.last_a12 = a12;
    }

    /// Called every CPU cycle to time the A12 low-period filter.
    pub(crate) fn tick_a12_filter(&mut self) {
        if !self.data.last_a12 {
            self.data.a12_low_cycles = self.data.a12_low_cycles.saturating_add(3);
        }
    }

    fn clock_irq_counter(&mut self) {
        if self.data.irq_counter == 0 || self.data.irq_reload_pending {
            self.data.irq_counter = self.data.irq_reload_value;
            self.data.irq_reload_pending = false;
        } else {
            self.data.irq_counter -= 1;
        }

        if self.data.irq_counter == 0 && self.data.irq_enabled {
            self.data.irq_line = true;
        }
    }

    pub(crate) fn irq(&self) -> bool {
        self.data.irq_line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{Cartridge, Rom};

    fn new_mmc3() -> MapperImpl<Mmc3> {
        let mut prg_rom = vec![0; 16 * 8 * 1024];
        for bank in 0..16 {
            prg_rom[bank * 8 * 1024] = bank as u8;
        }

        MapperImpl {
            cartridge: Cartridge {
                prg_rom: Rom(prg_rom),
                chr_rom: Rom(vec![0; 128 * 1024]),
                prg_ram: vec![0; 8 * 1024],
                chr_ram: vec![],
                has_battery: false,
                prg_ram_dirty: false,
            },
            data: Mmc3::new(NametableMirroring::Vertical),
        }
    }

    #[test]
    fn prg_banking_modes() {
        let mut mapper = new_mmc3();

        // R6 = 3 via bank select 6 + bank data
        mapper.write_cpu_address(0x8000, 6);
        mapper.write_cpu_address(0x8001, 3);

        assert_eq!(mapper.read_cpu_address(0x8000), Some(3));
        assert_eq!(mapper.read_cpu_address(0xC000), Some(14)); // second-to-last fixed
        assert_eq!(mapper.read_cpu_address(0xE000), Some(15)); // last fixed

        // PRG mode 1 swaps $8000 and $C000
        mapper.write_cpu_address(0x8000, 0x46);
        assert_eq!(mapper.read_cpu_address(0xC000), Some(3));
        assert_eq!(mapper.read_cpu_address(0x8000), Some(14));
    }

    fn run_scanline_worth_of_a12(mapper: &mut MapperImpl<Mmc3>) {
        // Simulate a rendering scanline: A12 low for a while, then a rise
        for _ in 0..10 {
            mapper.tick_a12_filter();
            mapper.notify_ppu_address(0x0000);
        }
        mapper.notify_ppu_address(0x1000);
    }

    #[test]
    fn irq_counter_fires_after_reload_and_countdown() {
        let mut mapper = new_mmc3();

        mapper.write_cpu_address(0xC000, 2); // reload value
        mapper.write_cpu_address(0xC001, 0); // force reload
        mapper.write_cpu_address(0xE001, 0); // enable IRQ

        run_scanline_worth_of_a12(&mut mapper); // reload to 2
        assert!(!mapper.irq());
        run_scanline_worth_of_a12(&mut mapper); // 1
        assert!(!mapper.irq());
        run_scanline_worth_of_a12(&mut mapper); // 0 -> IRQ
        assert!(mapper.irq());

        // Acknowledge via $E000
        mapper.write_cpu_address(0xE000, 0);
        assert!(!mapper.irq());
    }
}

use crate::cartridge::CpuPage;

impl MapperImpl<Mmc3> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x6000..=0x7FFF if !self.cartridge.prg_ram.is_empty() && self.data.ram_enabled => {
                CpuPage::PrgRam(u32::from(page_base & 0x1FFF))
            }
            0x8000..=0xFFFF => CpuPage::PrgRom(self.prg_rom_address(page_base)),
            _ => CpuPage::Unmapped,
        }
    }
}

//! MMC1 (iNES mapper 1): serial shift-register interface, 16/32KB PRG banking, 4/8KB CHR
//! banking, software-controlled mirroring.

use crate::cartridge::MapperImpl;
use crate::cartridge::mappers::{BankSizeKb, ChrType, NametableMirroring, basic_ppu_read, basic_ppu_write};
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;
use nexen_proc_macros::PartialClone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum PrgBankingMode {
    Switch32Kb,
    Switch16KbFirstBankFixed,
    Switch16KbLastBankFixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum ChrBankingMode {
    Single8KbBank,
    Two4KbBanks,
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Mmc1 {
    chr_type: ChrType,
    shift_register: u8,
    shift_register_len: u8,
    nametable_mirroring: NametableMirroring,
    prg_banking_mode: PrgBankingMode,
    chr_banking_mode: ChrBankingMode,
    chr_bank_0: u8,
    chr_bank_1: u8,
    prg_bank: u8,
    ram_disabled: bool,
}

impl Mmc1 {
    pub(crate) fn new(chr_type: ChrType) -> Self {
        Self {
            chr_type,
            shift_register: 0,
            shift_register_len: 0,
            nametable_mirroring: NametableMirroring::SingleScreenBank0,
            prg_banking_mode: PrgBankingMode::Switch16KbLastBankFixed,
            chr_banking_mode: ChrBankingMode::Single8KbBank,
            chr_bank_0: 0,
            chr_bank_1: 0,
            prg_bank: 0,
            ram_disabled: false,
        }
    }
}

impl MapperImpl<Mmc1> {
    fn prg_rom_address(&self, address: u16) -> u32 {
        match self.data.prg_banking_mode {
            PrgBankingMode::Switch32Kb => {
                // The bank register is a 16KB bank number; its low bit is ignored in 32KB mode
                BankSizeKb::ThirtyTwo.to_absolute_address(self.data.prg_bank >> 1, address)
            }
            PrgBankingMode::Switch16KbFirstBankFixed => match address {
                0x8000..=0xBFFF => u32::from(address & BankSizeKb::Sixteen.address_mask()),
                0xC000..=0xFFFF => {
                    BankSizeKb::Sixteen.to_absolute_address(self.data.prg_bank, address)
                }
                _ => panic!("invalid MMC1 PRG address: {address:04X}"),
            },
            PrgBankingMode::Switch16KbLastBankFixed => match address {
                0x8000..=0xBFFF => {
                    BankSizeKb::Sixteen.to_absolute_address(self.data.prg_bank, address)
                }
                0xC000..=0xFFFF => {
                    let last_bank = (self.cartridge.prg_rom.len() >> 14) as u8 - 1;
                    BankSizeKb::Sixteen.to_absolute_address(last_bank, address)
                }
                _ => panic!("invalid MMC1 PRG address: {address:04X}"),
            },
        }
    }

    fn chr_address(&self, address: u16) -> u32 {
        match self.data.chr_banking_mode {
            ChrBankingMode::Single8KbBank => {
                BankSizeKb::Eight.to_absolute_address(self.data.chr_bank_0 >> 1, address)
            }
            ChrBankingMode::Two4KbBanks => {
                let bank =
                    if address < 0x1000 { self.data.chr_bank_0 } else { self.data.chr_bank_1 };
                BankSizeKb::Four.to_absolute_address(bank, address)
            }
        }
    }

    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x6000..=0x7FFF if !self.cartridge.prg_ram.is_empty() && !self.data.ram_disabled => {
                Some(self.cartridge.get_prg_ram(u32::from(address & 0x1FFF)))
            }
            0x8000..=0xFFFF => Some(self.cartridge.get_prg_rom(self.prg_rom_address(address))),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        match address {
            0x6000..=0x7FFF => {
                if !self.cartridge.prg_ram.is_empty() && !self.data.ram_disabled {
                    self.cartridge.set_prg_ram(u32::from(address & 0x1FFF), value);
                }
            }
            0x8000..=0xFFFF => {
                // Bit 7 resets the shift register and re-fixes the last PRG bank
                if value.bit(7) {
                    self.data.shift_register = 0;
                    self.data.shift_register_len = 0;
                    self.data.prg_banking_mode = PrgBankingMode::Switch16KbLastBankFixed;
                    return;
                }

                // 5 serial writes of bit 0 build the register value, LSB first
                self.data.shift_register =
                    (self.data.shift_register >> 1) | ((value & 0x01) << 4);
                self.data.shift_register_len += 1;

                if self.data.shift_register_len == 5 {
                    let register_value = self.data.shift_register;
                    self.data.shift_register = 0;
                    self.data.shift_register_len = 0;
                    self.write_internal_register(address, register_value);
                }
            }
            _ => {}
        }
    }

    fn write_internal_register(&mut self, address: u16, value: u8) {
        match address {
            0x8000..=0x9FFF => {
                self.data.nametable_mirroring = match value & 0x03 {
                    0x00 => NametableMirroring::SingleScreenBank0,
                    0x01 => NametableMirroring::SingleScreenBank1,
                    0x02 => NametableMirroring::Vertical,
                    _ => NametableMirroring::Horizontal,
                };
                self.data.prg_banking_mode = match value & 0x0C {
                    0x00 | 0x04 => PrgBankingMode::Switch32Kb,
                    0x08 => PrgBankingMode::Switch16KbFirstBankFixed,
                    _ => PrgBankingMode::Switch16KbLastBankFixed,
                };
                self.data.chr_banking_mode = if value.bit(4) {
                    ChrBankingMode::Two4KbBanks
                } else {
                    ChrBankingMode::Single8KbBank
                };
            }
            0xA000..=0xBFFF => {
                self.data.chr_bank_0 = value & 0x1F;
            }
            0xC000..=0xDFFF => {
                self.data.chr_bank_1 = value & 0x1F;
            }
            0xE000..=0xFFFF => {
                self.data.prg_bank = value & 0x0F;
                self.data.ram_disabled = value.bit(4);
            }
            _ => unreachable!("caller only passes $8000-$FFFF"),
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        match address {
            0x0000..=0x1FFF => self.cartridge.get_chr(self.chr_address(address)),
            _ => basic_ppu_read(address, 0, self.data.nametable_mirroring, &self.cartridge, vram),
        }
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        match (address, self.data.chr_type) {
            // CHR ROM boards ignore pattern table writes
            (0x0000..=0x1FFF, ChrType::Rom) => {}
            (0x0000..=0x1FFF, ChrType::Ram) => {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{Cartridge, Rom};

    fn new_mmc1_with_chr(prg_banks: usize, chr_type: ChrType) -> MapperImpl<Mmc1> {
        let mut prg_rom = vec![0; prg_banks * 16 * 1024];
        // Tag the first byte of each 16KB bank with its bank number
        for bank in 0..prg_banks {
            prg_rom[bank * 16 * 1024] = bank as u8;
        }

        // 32KB of CHR, each 4KB bank tagged with its bank number
        let mut chr = vec![0; 32 * 1024];
        for bank in 0..8 {
            chr[bank * 4 * 1024] = bank as u8;
        }
        let (chr_rom, chr_ram) = match chr_type {
            ChrType::Rom => (chr, vec![]),
            ChrType::Ram => (vec![], chr),
        };

        MapperImpl {
            cartridge: Cartridge {
                prg_rom: Rom(prg_rom),
                chr_rom: Rom(chr_rom),
                prg_ram: vec![0; 8 * 1024],
                chr_ram,
                has_battery: false,
                prg_ram_dirty: false,
            },
            data: Mmc1::new(chr_type),
        }
    }

    fn new_mmc1(prg_banks: usize) -> MapperImpl<Mmc1> {
        new_mmc1_with_chr(prg_banks, ChrType::Rom)
    }

    fn write_serial(mapper: &mut MapperImpl<Mmc1>, address: u16, value: u8) {
        for i in 0..5 {
            mapper.write_cpu_address(address, (value >> i) & 0x01);
        }
    }

    #[test]
    fn five_bit_serial_write_selects_prg_bank() {
        let mut mapper = new_mmc1(8);

        write_serial(&mut mapper, 0xE000, 0x05);
        // $8000-$BFFF is the switchable bank, $C000-$FFFF fixed to the last bank
        assert_eq!(mapper.read_cpu_address(0x8000), Some(5));
        assert_eq!(mapper.read_cpu_address(0xC000), Some(7));
    }

    #[test]
    fn bit7_write_resets_shift_register() {
        let mut mapper = new_mmc1(8);

        // Two serial bits, then a reset, then a full serial write
        mapper.write_cpu_address(0xE000, 0x01);
        mapper.write_cpu_address(0xE000, 0x01);
        mapper.write_cpu_address(0xE000, 0x80);
        write_serial(&mut mapper, 0xE000, 0x02);

        assert_eq!(mapper.read_cpu_address(0x8000), Some(2));
    }

    #[test]
    fn reset_restores_last_bank_fixed_mode() {
        let mut mapper = new_mmc1(8);

        // Switch to 32KB mode, then reset via bit 7
        write_serial(&mut mapper, 0x8000, 0x00);
        assert_eq!(mapper.data.prg_banking_mode, PrgBankingMode::Switch32Kb);

        mapper.write_cpu_address(0x8000, 0x80);
        assert_eq!(mapper.data.prg_banking_mode, PrgBankingMode::Switch16KbLastBankFixed);
    }

    #[test]
    fn mirroring_control() {
        let mut mapper = new_mmc1(2);
        write_serial(&mut mapper, 0x8000, 0x03); // horizontal
        assert_eq!(mapper.data.nametable_mirroring, NametableMirroring::Horizontal);

        write_serial(&mut mapper, 0x8000, 0x02); // vertical
        assert_eq!(mapper.data.nametable_mirroring, NametableMirroring::Vertical);
    }

    #[test]
    fn four_kb_chr_banking() {
        let mut mapper = new_mmc1(2);
        let vram = [0; 2048];

        write_serial(&mut mapper, 0x8000, 0x10); // 4KB CHR mode
        write_serial(&mut mapper, 0xA000, 2); // CHR bank 0
        write_serial(&mut mapper, 0xC000, 5); // CHR bank 1

        assert_eq!(mapper.read_ppu_address(0x0000, &vram), 2);
        assert_eq!(mapper.read_ppu_address(0x1000, &vram), 5);
    }

    #[test]
    fn chr_rom_ignores_pattern_table_writes() {
        let mut mapper = new_mmc1_with_chr(2, ChrType::Rom);
        let mut vram = [0; 2048];

        mapper.write_ppu_address(0x0000, 0xFF, &mut vram);
        assert_eq!(mapper.read_ppu_address(0x0000, &vram), 0);

        // Nametable writes still land in VRAM
        mapper.write_ppu_address(0x2000, 0xAB, &mut vram);
        assert_eq!(mapper.read_ppu_address(0x2000, &vram), 0xAB);
    }

    #[test]
    fn chr_ram_accepts_pattern_table_writes() {
        let mut mapper = new_mmc1_with_chr(2, ChrType::Ram);
        let mut vram = [0; 2048];

        mapper.write_ppu_address(0x0123, 0x5A, &mut vram);
        assert_eq!(mapper.read_ppu_address(0x0123, &vram), 0x5A);
    }
}

use crate::cartridge::CpuPage;

impl MapperImpl<Mmc1> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x6000..=0x7FFF if !self.cartridge.prg_ram.is_empty() && !self.data.ram_disabled => {
                CpuPage::PrgRam(u32::from(page_base & 0x1FFF))
            }
            0x8000..=0xFFFF => CpuPage::PrgRom(self.prg_rom_address(page_base)),
            _ => CpuPage::Unmapped,
        }
    }
}

//! The 64KB memory map: 8KB of system RAM (mirrored) plus the cartridge slot with Sega or
//! Codemasters banking.

use bincode::{Decode, Encode};
use crc::{CRC_32_ISO_HDLC, Crc};
use nexen_common::num::GetBit;
use nexen_proc_macros::{FakeDecode, FakeEncode, PartialClone};
use std::ops::Deref;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const SYSTEM_RAM_LEN: usize = 8 * 1024;
const BANK_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Default, FakeEncode, FakeDecode)]
pub(crate) struct Rom(pub(crate) Vec<u8>);

impl Deref for Rom {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub(crate) enum MapperKind {
    Sega,
    Codemasters,
}

/// Codemasters ROMs are identified by the checksum words in their headers; everything else
/// uses the standard Sega mapper.
pub(crate) fn detect_mapper(rom: &[u8]) -> MapperKind {
    if rom.len() >= 0x8000 {
        let checksum = u16::from_le_bytes([rom[0x7FE6], rom[0x7FE7]]);
        let inverse = u16::from_le_bytes([rom[0x7FE8], rom[0x7FE9]]);
        // The two words sum to $10000 on Codemasters boards
        if checksum != 0 && checksum.wrapping_add(inverse) == 0 {
            return MapperKind::Codemasters;
        }
    }
    MapperKind::Sega
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Memory {
    #[partial_clone(default)]
    rom: Rom,
    rom_crc32: u32,
    mapper: MapperKind,
    system_ram: [u8; SYSTEM_RAM_LEN],
    cartridge_ram: Vec<u8>,
    cartridge_ram_mapped: bool,
    cartridge_ram_dirty: bool,
    has_battery: bool,
    rom_banks: [u8; 3],
}

impl Memory {
    pub(crate) fn new(rom: Vec<u8>, sav_bytes: Option<Vec<u8>>) -> Self {
        let mapper = detect_mapper(&rom);
        let rom_crc32 = CRC32.checksum(&rom);

        let has_battery = sav_bytes.is_some();
        let cartridge_ram = sav_bytes.unwrap_or_default();

        log::info!(
            "Loaded {}KB ROM, mapper {mapper:?}, CRC32 {rom_crc32:08X}",
            rom.len() / 1024
        );

        Self {
            rom: Rom(rom),
            rom_crc32,
            mapper,
            system_ram: [0; SYSTEM_RAM_LEN],
            cartridge_ram,
            cartridge_ram_mapped: false,
            cartridge_ram_dirty: false,
            has_battery,
            rom_banks: [0, 1, 2],
        }
    }

    #[allow(dead_code)]
    pub(crate) fn rom_crc32(&self) -> u32 {
        self.rom_crc32
    }

    fn rom_byte(&self, bank: u8, offset: u16) -> u8 {
        let address = (usize::from(bank) * BANK_LEN + usize::from(offset)) % self.rom.len().max(1);
        self.rom[address]
    }

    pub(crate) fn read(&self, address: u16) -> u8 {
        match address {
            // The first 1KB is always bank 0 on the Sega mapper so the interrupt vectors
            // stay put
            0x0000..=0x03FF if self.mapper == MapperKind::Sega => self.rom_byte(0, address),
            0x0000..=0x3FFF => self.rom_byte(self.rom_banks[0], address & 0x3FFF),
            0x4000..=0x7FFF => self.rom_byte(self.rom_banks[1], address & 0x3FFF),
            0x8000..=0xBFFF => {
                if self.cartridge_ram_mapped && !self.cartridge_ram.is_empty() {
                    self.cartridge_ram
                        [(address as usize & 0x3FFF) % self.cartridge_ram.len()]
                } else {
                    self.rom_byte(self.rom_banks[2], address & 0x3FFF)
                }
            }
            0xC000..=0xFFFF => self.system_ram[(address as usize) & (SYSTEM_RAM_LEN - 1)],
        }
    }

    pub(crate) fn write(&mut self, address: u16, value: u8) {
        match (self.mapper, address) {
            // Codemasters banking registers sit at the start of each slot
            (MapperKind::Codemasters, 0x0000) => self.rom_banks[0] = value,
            (MapperKind::Codemasters, 0x4000) => self.rom_banks[1] = value,
            (MapperKind::Codemasters, 0x8000) => self.rom_banks[2] = value,
            (_, 0x8000..=0xBFFF) => {
                if self.cartridge_ram_mapped {
                    if self.cartridge_ram.is_empty() {
                        // First RAM access allocates; boards with battery RAM are detected
                        // by use rather than a header flag
                        self.cartridge_ram = vec![0; 32 * 1024];
                        self.has_battery = true;
                    }
                    let len = self.cartridge_ram.len();
                    self.cartridge_ram[(address as usize & 0x3FFF) % len] = value;
                    self.cartridge_ram_dirty = true;
                }
            }
            (MapperKind::Sega, 0xC000..=0xFFFF) => {
                self.system_ram[(address as usize) & (SYSTEM_RAM_LEN - 1)] = value;

                // The Sega mapper registers shadow the top of RAM
                match address {
                    0xFFFC => {
                        self.cartridge_ram_mapped = value.bit(3);
                    }
                    0xFFFD => self.rom_banks[0] = value,
                    0xFFFE => self.rom_banks[1] = value,
                    0xFFFF => self.rom_banks[2] = value,
                    _ => {}
                }
            }
            (_, 0xC000..=0xFFFF) => {
                self.system_ram[(address as usize) & (SYSTEM_RAM_LEN - 1)] = value;
            }
            _ => {}
        }
    }

    pub(crate) fn has_battery(&self) -> bool {
        self.has_battery
    }

    pub(crate) fn sram(&self) -> &[u8] {
        &self.cartridge_ram
    }

    pub(crate) fn get_and_clear_ram_dirty_bit(&mut self) -> bool {
        let dirty = self.cartridge_ram_dirty;
        self.cartridge_ram_dirty = false;
        dirty
    }

    pub(crate) fn move_rom_from(&mut self, other: &mut Self) {
        self.rom = std::mem::take(&mut other.rom);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_rom(banks: usize) -> Vec<u8> {
        let mut rom = vec![0; banks * BANK_LEN];
        for bank in 0..banks {
            rom[bank * BANK_LEN] = bank as u8;
            rom[bank * BANK_LEN + 0x3FF] = bank as u8;
            rom[bank * BANK_LEN + 0x400] = bank as u8;
        }
        rom
    }

    #[test]
    fn sega_mapper_bank_switching() {
        let mut memory = Memory::new(tagged_rom(8), None);

        assert_eq!(memory.read(0x4000), 1);
        memory.write(0xFFFE, 5);
        assert_eq!(memory.read(0x4000), 5);
    }

    #[test]
    fn first_kilobyte_is_fixed() {
        let mut memory = Memory::new(tagged_rom(8), None);

        memory.write(0xFFFD, 3);
        // Below $0400 always reads bank 0
        assert_eq!(memory.read(0x03FF), 0);
        // Above it follows the bank register
        assert_eq!(memory.read(0x0400), 3);
    }

    #[test]
    fn system_ram_is_mirrored() {
        let mut memory = Memory::new(tagged_rom(2), None);
        memory.write(0xC123, 0xAB);
        assert_eq!(memory.read(0xE123), 0xAB);
    }

    #[test]
    fn cartridge_ram_mapping() {
        let mut memory = Memory::new(tagged_rom(4), None);

        memory.write(0xFFFC, 0x08);
        memory.write(0x8000, 0x42);
        assert_eq!(memory.read(0x8000), 0x42);
        assert!(memory.has_battery());
        assert!(memory.get_and_clear_ram_dirty_bit());

        memory.write(0xFFFC, 0x00);
        assert_eq!(memory.read(0x8000), 2);
    }
}

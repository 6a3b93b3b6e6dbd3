//! Mapper implementations. The discrete-logic boards live here; the register-heavy boards
//! (MMC1, MMC3, FME-7) get their own modules.

pub(crate) mod fme7;
pub(crate) mod mmc1;
pub(crate) mod mmc3;

pub(crate) use fme7::Fme7;
pub(crate) use mmc1::Mmc1;
pub(crate) use mmc3::Mmc3;

use crate::cartridge::{Cartridge, MapperImpl};
use bincode::{Decode, Encode};
use nexen_common::num::GetBit;
use nexen_proc_macros::PartialClone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub(crate) enum ChrType {
    Rom,
    Ram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub(crate) enum NametableMirroring {
    Horizontal,
    Vertical,
    SingleScreenBank0,
    SingleScreenBank1,
}

impl NametableMirroring {
    pub(crate) fn map_to_vram(self, address: u16) -> u16 {
        debug_assert!((0x2000..=0x3EFF).contains(&address));

        let relative_addr = address & 0x0FFF;
        match self {
            Self::Horizontal => ((relative_addr & 0x0800) >> 1) | (relative_addr & 0x03FF),
            Self::Vertical => relative_addr & 0x07FF,
            Self::SingleScreenBank0 => relative_addr & 0x03FF,
            Self::SingleScreenBank1 => 0x0400 | (relative_addr & 0x03FF),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub(crate) enum BankSizeKb {
    One,
    Two,
    Four,
    Eight,
    Sixteen,
    ThirtyTwo,
}

impl BankSizeKb {
    fn shift(self) -> u32 {
        match self {
            Self::One => 10,
            Self::Two => 11,
            Self::Four => 12,
            Self::Eight => 13,
            Self::Sixteen => 14,
            Self::ThirtyTwo => 15,
        }
    }

    pub(crate) fn address_mask(self) -> u16 {
        (1 << self.shift()) - 1
    }

    pub(crate) fn to_absolute_address<B: Into<u32>>(self, bank: B, address: u16) -> u32 {
        (bank.into() << self.shift()) | u32::from(address & self.address_mask())
    }
}

/// Reads of PPU $0000-$3EFF resolve to CHR or the console's 2KB of VRAM.
pub(crate) fn basic_ppu_read(
    address: u16,
    chr_bank_base: u32,
    mirroring: NametableMirroring,
    cartridge: &Cartridge,
    vram: &[u8; 2048],
) -> u8 {
    match address {
        0x0000..=0x1FFF => cartridge.get_chr(chr_bank_base | u32::from(address)),
        0x2000..=0x3EFF => vram[mirroring.map_to_vram(address) as usize],
        _ => panic!("invalid PPU map address: {address:04X}"),
    }
}

pub(crate) fn basic_ppu_write(
    address: u16,
    value: u8,
    chr_bank_base: u32,
    mirroring: NametableMirroring,
    cartridge: &mut Cartridge,
    vram: &mut [u8; 2048],
) {
    match address {
        0x0000..=0x1FFF => cartridge.set_chr_ram(chr_bank_base | u32::from(address), value),
        0x2000..=0x3EFF => vram[mirroring.map_to_vram(address) as usize] = value,
        _ => panic!("invalid PPU map address: {address:04X}"),
    }
}

// ===== NROM (mapper 0): no banking at all =====

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Nrom {
    mirroring: NametableMirroring,
}

impl Nrom {
    pub(crate) fn new(mirroring: NametableMirroring) -> Self {
        Self { mirroring }
    }
}

impl MapperImpl<Nrom> {
    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x6000..=0x7FFF if !self.cartridge.prg_ram.is_empty() => {
                Some(self.cartridge.get_prg_ram(u32::from(address & 0x1FFF)))
            }
            0x8000..=0xFFFF => Some(self.cartridge.get_prg_rom(u32::from(address & 0x7FFF))),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        if let 0x6000..=0x7FFF = address {
            if !self.cartridge.prg_ram.is_empty() {
                self.cartridge.set_prg_ram(u32::from(address & 0x1FFF), value);
            }
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        basic_ppu_read(address, 0, self.data.mirroring, &self.cartridge, vram)
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        basic_ppu_write(address, value, 0, self.data.mirroring, &mut self.cartridge, vram);
    }
}

// ===== UxROM (mappers 2 / 94 / 180): switchable + fixed 16KB PRG banks =====

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Uxrom {
    prg_bank: u8,
    mirroring: NametableMirroring,
    // Mapper 180 fixes the FIRST bank and switches the second (Crazy Climber)
    fixed_bank_first: bool,
    // Mapper 94 takes the bank number from bits 4-2 instead of 3-0
    bank_shift: u8,
}

impl Uxrom {
    pub(crate) fn new(mapper_number: u16, mirroring: NametableMirroring) -> Self {
        Self {
            prg_bank: 0,
            mirroring,
            fixed_bank_first: mapper_number == 180,
            bank_shift: if mapper_number == 94 { 2 } else { 0 },
        }
    }
}

impl MapperImpl<Uxrom> {
    fn prg_rom_address(&self, address: u16) -> u32 {
        let last_bank = (self.cartridge.prg_rom.len() >> 14) as u8 - 1;
        let (switchable, fixed) = (self.data.prg_bank, last_bank);
        let bank = match (address, self.data.fixed_bank_first) {
            (0x8000..=0xBFFF, false) | (0xC000..=0xFFFF, true) => switchable,
            (0xC000..=0xFFFF, false) => fixed,
            (0x8000..=0xBFFF, true) => 0,
            _ => panic!("invalid UxROM PRG address: {address:04X}"),
        };
        BankSizeKb::Sixteen.to_absolute_address(bank, address)
    }

    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x8000..=0xFFFF => Some(self.cartridge.get_prg_rom(self.prg_rom_address(address))),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        if address >= 0x8000 {
            self.data.prg_bank = (value >> self.data.bank_shift) & 0x0F;
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        basic_ppu_read(address, 0, self.data.mirroring, &self.cartridge, vram)
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        basic_ppu_write(address, value, 0, self.data.mirroring, &mut self.cartridge, vram);
    }
}

// ===== CNROM (mapper 3): 8KB CHR banking =====

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Cnrom {
    chr_bank: u8,
    mirroring: NametableMirroring,
}

impl Cnrom {
    pub(crate) fn new(mirroring: NametableMirroring) -> Self {
        Self { chr_bank: 0, mirroring }
    }
}

impl MapperImpl<Cnrom> {
    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x8000..=0xFFFF => Some(self.cartridge.get_prg_rom(u32::from(address & 0x7FFF))),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        if address >= 0x8000 {
            self.data.chr_bank = value;
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        let chr_base = BankSizeKb::Eight.to_absolute_address(self.data.chr_bank, 0) & !0x1FFF;
        basic_ppu_read(address, chr_base, self.data.mirroring, &self.cartridge, vram)
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        let chr_base = BankSizeKb::Eight.to_absolute_address(self.data.chr_bank, 0) & !0x1FFF;
        basic_ppu_write(address, value, chr_base, self.data.mirroring, &mut self.cartridge, vram);
    }
}

// ===== AxROM (mapper 7): 32KB PRG banking + single-screen mirroring =====

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Axrom {
    prg_bank: u8,
    mirroring: NametableMirroring,
}

impl Axrom {
    pub(crate) fn new() -> Self {
        Self { prg_bank: 0, mirroring: NametableMirroring::SingleScreenBank0 }
    }
}

impl MapperImpl<Axrom> {
    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x8000..=0xFFFF => Some(
                self.cartridge
                    .get_prg_rom(BankSizeKb::ThirtyTwo.to_absolute_address(self.data.prg_bank, address)),
            ),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        if address >= 0x8000 {
            self.data.prg_bank = value & 0x07;
            self.data.mirroring = if value.bit(4) {
                NametableMirroring::SingleScreenBank1
            } else {
                NametableMirroring::SingleScreenBank0
            };
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        basic_ppu_read(address, 0, self.data.mirroring, &self.cartridge, vram)
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        basic_ppu_write(address, value, 0, self.data.mirroring, &mut self.cartridge, vram);
    }
}

// ===== GxROM / BNROM (mappers 66 / 34): 32KB PRG + optional 8KB CHR banking =====

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Gxrom {
    prg_bank: u8,
    chr_bank: u8,
    mirroring: NametableMirroring,
    // BNROM only banks PRG
    prg_only: bool,
}

impl Gxrom {
    pub(crate) fn new(mirroring: NametableMirroring, prg_only: bool) -> Self {
        Self { prg_bank: 0, chr_bank: 0, mirroring, prg_only }
    }
}

impl MapperImpl<Gxrom> {
    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x8000..=0xFFFF => Some(
                self.cartridge
                    .get_prg_rom(BankSizeKb::ThirtyTwo.to_absolute_address(self.data.prg_bank, address)),
            ),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        if address >= 0x8000 {
            if self.data.prg_only {
                self.data.prg_bank = value;
            } else {
                self.data.prg_bank = (value >> 4) & 0x03;
                self.data.chr_bank = value & 0x03;
            }
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        let chr_base = u32::from(self.data.chr_bank) << 13;
        basic_ppu_read(address, chr_base, self.data.mirroring, &self.cartridge, vram)
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        let chr_base = u32::from(self.data.chr_bank) << 13;
        basic_ppu_write(address, value, chr_base, self.data.mirroring, &mut self.cartridge, vram);
    }
}

// ===== Color Dreams (mapper 11): like GxROM with swapped register fields =====

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct ColorDreams {
    prg_bank: u8,
    chr_bank: u8,
    mirroring: NametableMirroring,
}

impl ColorDreams {
    pub(crate) fn new(mirroring: NametableMirroring) -> Self {
        Self { prg_bank: 0, chr_bank: 0, mirroring }
    }
}

impl MapperImpl<ColorDreams> {
    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x8000..=0xFFFF => Some(
                self.cartridge
                    .get_prg_rom(BankSizeKb::ThirtyTwo.to_absolute_address(self.data.prg_bank, address)),
            ),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        if address >= 0x8000 {
            self.data.prg_bank = value & 0x03;
            self.data.chr_bank = value >> 4;
        }
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        let chr_base = u32::from(self.data.chr_bank) << 13;
        basic_ppu_read(address, chr_base, self.data.mirroring, &self.cartridge, vram)
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        let chr_base = u32::from(self.data.chr_bank) << 13;
        basic_ppu_write(address, value, chr_base, self.data.mirroring, &mut self.cartridge, vram);
    }
}

// ===== CPU page table classification =====
//
// Each mapper reports how a 256-byte page of the cartridge space resolves so the bus can build
// its direct-read page table. Bank math reuses the same address functions as the slow path.

use crate::cartridge::CpuPage;

impl MapperImpl<Nrom> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x6000..=0x7FFF if !self.cartridge.prg_ram.is_empty() => {
                CpuPage::PrgRam(u32::from(page_base & 0x1FFF))
            }
            0x8000..=0xFFFF => CpuPage::PrgRom(u32::from(page_base & 0x7FFF)),
            _ => CpuPage::Unmapped,
        }
    }
}

impl MapperImpl<Uxrom> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x8000..=0xFFFF => CpuPage::PrgRom(self.prg_rom_address(page_base)),
            _ => CpuPage::Unmapped,
        }
    }
}

impl MapperImpl<Cnrom> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x8000..=0xFFFF => CpuPage::PrgRom(u32::from(page_base & 0x7FFF)),
            _ => CpuPage::Unmapped,
        }
    }
}

impl MapperImpl<Axrom> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x8000..=0xFFFF => CpuPage::PrgRom(
                BankSizeKb::ThirtyTwo.to_absolute_address(self.data.prg_bank, page_base),
            ),
            _ => CpuPage::Unmapped,
        }
    }
}

impl MapperImpl<Gxrom> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x8000..=0xFFFF => CpuPage::PrgRom(
                BankSizeKb::ThirtyTwo.to_absolute_address(self.data.prg_bank, page_base),
            ),
            _ => CpuPage::Unmapped,
        }
    }
}

impl MapperImpl<ColorDreams> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x8000..=0xFFFF => CpuPage::PrgRom(
                BankSizeKb::ThirtyTwo.to_absolute_address(self.data.prg_bank, page_base),
            ),
            _ => CpuPage::Unmapped,
        }
    }
}

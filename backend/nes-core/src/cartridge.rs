//! Cartridge loading: iNES / NES 2.0 header parsing and the mapper factory.

pub(crate) mod mappers;

use crate::cartridge::mappers::{
    Axrom, Cnrom, ColorDreams, Fme7, Gxrom, Mmc1, Mmc3, NametableMirroring, Nrom, Uxrom,
};
use bincode::{Decode, Encode};
use crc::{CRC_32_ISO_HDLC, Crc};
use nexen_common::frontend::TimingMode;
use nexen_proc_macros::{FakeDecode, FakeEncode, MatchEachVariantMacro, PartialClone};
use std::ops::Deref;
use thiserror::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("ROM is too short to contain an iNES header")]
    HeaderTooShort,
    #[error("ROM header is missing the iNES magic bytes")]
    InvalidMagic,
    #[error("ROM file is shorter than the size declared in its header")]
    RomTruncated,
    #[error("mapper {mapper_number} is not supported")]
    UnsupportedMapper { mapper_number: u16 },
}

/// Wrapper so that large ROM blobs are excluded from serialized state and rewind clones; they
/// are restored from the loaded ROM after deserialization.
#[derive(Debug, Clone, Default, FakeEncode, FakeDecode)]
pub(crate) struct Rom(pub(crate) Vec<u8>);

impl Deref for Rom {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Cartridge {
    #[partial_clone(default)]
    pub(crate) prg_rom: Rom,
    #[partial_clone(default)]
    pub(crate) chr_rom: Rom,
    pub(crate) prg_ram: Vec<u8>,
    pub(crate) chr_ram: Vec<u8>,
    pub(crate) has_battery: bool,
    pub(crate) prg_ram_dirty: bool,
}

impl Cartridge {
    #[inline]
    pub(crate) fn get_prg_rom(&self, address: u32) -> u8 {
        self.prg_rom[(address as usize) & (self.prg_rom.len() - 1)]
    }

    #[inline]
    pub(crate) fn get_prg_ram(&self, address: u32) -> u8 {
        self.prg_ram[(address as usize) & (self.prg_ram.len() - 1)]
    }

    pub(crate) fn set_prg_ram(&mut self, address: u32, value: u8) {
        let len = self.prg_ram.len();
        self.prg_ram[(address as usize) & (len - 1)] = value;
        self.prg_ram_dirty = true;
    }

    #[inline]
    pub(crate) fn get_chr(&self, address: u32) -> u8 {
        if self.chr_rom.is_empty() {
            self.chr_ram[(address as usize) & (self.chr_ram.len() - 1)]
        } else {
            self.chr_rom[(address as usize) & (self.chr_rom.len() - 1)]
        }
    }

    pub(crate) fn set_chr_ram(&mut self, address: u32, value: u8) {
        if !self.chr_ram.is_empty() {
            let len = self.chr_ram.len();
            self.chr_ram[(address as usize) & (len - 1)] = value;
        }
    }

    pub(crate) fn get_and_clear_ram_dirty_bit(&mut self) -> bool {
        let dirty = self.prg_ram_dirty;
        self.prg_ram_dirty = false;
        dirty
    }
}

/// A concrete mapper paired with the cartridge memory it controls.
#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct MapperImpl<MapperData> {
    #[partial_clone(partial)]
    pub(crate) cartridge: Cartridge,
    #[partial_clone(partial)]
    pub(crate) data: MapperData,
}

#[derive(Debug, Clone, Encode, Decode, MatchEachVariantMacro, PartialClone)]
pub(crate) enum Mapper {
    Axrom(#[partial_clone(partial)] MapperImpl<Axrom>),
    Cnrom(#[partial_clone(partial)] MapperImpl<Cnrom>),
    ColorDreams(#[partial_clone(partial)] MapperImpl<ColorDreams>),
    Fme7(#[partial_clone(partial)] MapperImpl<Fme7>),
    Gxrom(#[partial_clone(partial)] MapperImpl<Gxrom>),
    Mmc1(#[partial_clone(partial)] MapperImpl<Mmc1>),
    Mmc3(#[partial_clone(partial)] MapperImpl<Mmc3>),
    Nrom(#[partial_clone(partial)] MapperImpl<Nrom>),
    Uxrom(#[partial_clone(partial)] MapperImpl<Uxrom>),
}

impl Mapper {
    /// The mapper's user-readable name, for logging.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Axrom(..) => "AxROM",
            Self::Cnrom(..) => "CNROM",
            Self::ColorDreams(..) => "Color Dreams",
            Self::Fme7(..) => "Sunsoft FME-7",
            Self::Gxrom(..) => "GxROM / BNROM",
            Self::Mmc1(..) => "MMC1",
            Self::Mmc3(..) => "MMC3",
            Self::Nrom(..) => "NROM",
            Self::Uxrom(..) => "UxROM",
        }
    }

    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        match_each_variant!(self, mapper => mapper.read_cpu_address(address))
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match_each_variant!(self, mapper => mapper.peek_cpu_address(address))
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        match_each_variant!(self, mapper => mapper.write_cpu_address(address, value));
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        match_each_variant!(self, mapper => mapper.read_ppu_address(address, vram))
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        match_each_variant!(self, mapper => mapper.write_ppu_address(address, value, vram));
    }

    /// Called whenever the PPU address bus changes; mappers with address-line-triggered IRQ
    /// counters (MMC3 A12 watching) hook this.
    pub(crate) fn notify_ppu_address(&mut self, address: u16) {
        if let Self::Mmc3(mmc3) = self {
            mmc3.notify_ppu_address(address);
        }
    }

    /// Clocked once per CPU cycle for cycle-counter IRQs and expansion audio.
    pub(crate) fn clock_cpu(&mut self, frame_cycle: u32) {
        match self {
            Self::Fme7(fme7) => fme7.clock_cpu(frame_cycle),
            Self::Mmc3(mmc3) => mmc3.tick_a12_filter(),
            _ => {}
        }
    }

    pub(crate) fn irq(&self) -> bool {
        match self {
            Self::Mmc3(mmc3) => mmc3.irq(),
            Self::Fme7(fme7) => fme7.irq(),
            _ => false,
        }
    }

    /// Move this frame's expansion audio deltas into `out`. Only boards with expansion audio
    /// produce anything.
    pub(crate) fn take_audio_deltas(&mut self, out: &mut Vec<nexen_common::audio::AudioDelta>) {
        if let Self::Fme7(fme7) = self {
            fme7.take_audio_deltas(out);
        }
    }

    pub(crate) fn has_battery(&self) -> bool {
        match_each_variant!(self, mapper => mapper.cartridge.has_battery)
    }

    pub(crate) fn prg_ram(&self) -> &[u8] {
        match_each_variant!(self, mapper => &mapper.cartridge.prg_ram)
    }

    pub(crate) fn get_and_clear_ram_dirty_bit(&mut self) -> bool {
        match_each_variant!(self, mapper => mapper.cartridge.get_and_clear_ram_dirty_bit())
    }

    pub(crate) fn move_rom_from(&mut self, other: &mut Self) {
        let (prg, chr) = match_each_variant!(other, mapper => (
            std::mem::take(&mut mapper.cartridge.prg_rom),
            std::mem::take(&mut mapper.cartridge.chr_rom)
        ));
        match_each_variant!(self, mapper => {
            mapper.cartridge.prg_rom = prg;
            mapper.cartridge.chr_rom = chr;
        });
    }
}

/// One 256-byte slot of the CPU page table covering the cartridge space. ROM and RAM pages
/// resolve reads directly against the backing arrays with no mapper dispatch; `Handler` routes
/// through the mapper for anything with read side effects or sub-page granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub(crate) enum CpuPage {
    Unmapped,
    PrgRom(u32),
    PrgRam(u32),
    Handler,
}

impl Mapper {
    /// Recompute the CPU page table for the cartridge address space ($4000-$FFFF pages). Called
    /// at power-on and after any write that can change banking.
    pub(crate) fn rebuild_cpu_pages(&self, pages: &mut [CpuPage; 256]) {
        for page_index in 0x40..=0xFF_usize {
            let page_base = (page_index as u16) << 8;
            pages[page_index] = match_each_variant!(self, mapper => mapper.cpu_page(page_base));
        }
    }

    #[inline]
    pub(crate) fn prg_rom_byte(&self, offset: u32) -> u8 {
        match_each_variant!(self, mapper => mapper.cartridge.get_prg_rom(offset))
    }

    #[inline]
    pub(crate) fn prg_ram_byte(&self, offset: u32) -> u8 {
        match_each_variant!(self, mapper => mapper.cartridge.get_prg_ram(offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct INesHeader {
    pub(crate) mapper_number: u16,
    pub(crate) prg_rom_len: u32,
    pub(crate) chr_rom_len: u32,
    pub(crate) prg_ram_len: u32,
    pub(crate) chr_ram_len: u32,
    pub(crate) nametable_mirroring: NametableMirroring,
    pub(crate) has_battery: bool,
    pub(crate) has_trainer: bool,
    pub(crate) timing_mode: TimingMode,
}

const INES_MAGIC: [u8; 4] = *b"NES\x1A";
const HEADER_LEN: usize = 16;
const TRAINER_LEN: usize = 512;
const PRG_PAGE_LEN: u32 = 16 * 1024;
const CHR_PAGE_LEN: u32 = 8 * 1024;

impl INesHeader {
    pub(crate) fn parse(rom: &[u8]) -> Result<Self, CartridgeError> {
        if rom.len() < HEADER_LEN {
            return Err(CartridgeError::HeaderTooShort);
        }
        if rom[..4] != INES_MAGIC {
            return Err(CartridgeError::InvalidMagic);
        }

        let is_nes_2 = rom[7] & 0x0C == 0x08;

        let mut prg_rom_pages = u32::from(rom[4]);
        let mut chr_rom_pages = u32::from(rom[5]);
        let mut mapper_number = u16::from((rom[6] >> 4) | (rom[7] & 0xF0));

        let nametable_mirroring = if rom[6] & 0x01 != 0 {
            NametableMirroring::Vertical
        } else {
            NametableMirroring::Horizontal
        };
        let has_battery = rom[6] & 0x02 != 0;
        let has_trainer = rom[6] & 0x04 != 0;

        let mut prg_ram_len = 8 * 1024;
        let mut chr_ram_len = if chr_rom_pages == 0 { CHR_PAGE_LEN } else { 0 };
        let mut timing_mode = TimingMode::Ntsc;

        if is_nes_2 {
            mapper_number |= u16::from(rom[8] & 0x0F) << 8;
            prg_rom_pages |= u32::from(rom[9] & 0x0F) << 8;
            chr_rom_pages |= u32::from(rom[9] >> 4) << 8;

            let prg_ram_shift = rom[10] & 0x0F;
            if prg_ram_shift != 0 {
                prg_ram_len = 64 << prg_ram_shift;
            }
            let prg_nvram_shift = rom[10] >> 4;
            if prg_nvram_shift != 0 {
                prg_ram_len = 64 << prg_nvram_shift;
            }

            let chr_ram_shift = rom[11] & 0x0F;
            chr_ram_len = if chr_ram_shift != 0 { 64 << chr_ram_shift } else { chr_ram_len };

            if rom[12] & 0x03 == 0x01 {
                timing_mode = TimingMode::Pal;
            }
        }

        Ok(Self {
            mapper_number,
            prg_rom_len: prg_rom_pages * PRG_PAGE_LEN,
            chr_rom_len: chr_rom_pages * CHR_PAGE_LEN,
            prg_ram_len,
            chr_ram_len,
            nametable_mirroring,
            has_battery,
            has_trainer,
            timing_mode,
        })
    }
}

/// Parse a ROM image, construct the cartridge, and select the mapper.
pub(crate) fn from_ines_file(
    rom: &[u8],
    sav_bytes: Option<Vec<u8>>,
    forced_timing_mode: Option<TimingMode>,
) -> Result<Mapper, CartridgeError> {
    let header = INesHeader::parse(rom)?;

    let prg_rom_start = HEADER_LEN + if header.has_trainer { TRAINER_LEN } else { 0 };
    let prg_rom_end = prg_rom_start + header.prg_rom_len as usize;
    let chr_rom_end = prg_rom_end + header.chr_rom_len as usize;
    if rom.len() < chr_rom_end {
        return Err(CartridgeError::RomTruncated);
    }

    let prg_rom = rom[prg_rom_start..prg_rom_end].to_vec();
    let chr_rom = rom[prg_rom_end..chr_rom_end].to_vec();

    let timing_mode = forced_timing_mode.unwrap_or(header.timing_mode);
    let rom_crc = CRC32.checksum(&prg_rom);

    log::info!(
        "Loaded ROM: mapper {}, PRG ROM {}KB, CHR {} {}KB, mirroring {:?}, battery {}, {}",
        header.mapper_number,
        header.prg_rom_len / 1024,
        if header.chr_rom_len != 0 { "ROM" } else { "RAM" },
        header.chr_rom_len.max(header.chr_ram_len) / 1024,
        header.nametable_mirroring,
        header.has_battery,
        timing_mode,
    );

    let prg_ram = match sav_bytes {
        Some(sav) if header.has_battery && sav.len() == header.prg_ram_len as usize => sav,
        _ => vec![0; header.prg_ram_len as usize],
    };

    let cartridge = Cartridge {
        prg_rom: Rom(prg_rom),
        chr_rom: Rom(chr_rom),
        prg_ram,
        chr_ram: vec![0; header.chr_ram_len as usize],
        has_battery: header.has_battery,
        prg_ram_dirty: false,
    };

    let mirroring = header.nametable_mirroring;
    let chr_type = if header.chr_rom_len != 0 {
        mappers::ChrType::Rom
    } else {
        mappers::ChrType::Ram
    };

    // Known multicarts that mis-declare their mapper are detected by PRG CRC32
    let mapper_number = apply_per_game_exceptions(header.mapper_number, rom_crc);

    let mapper = match mapper_number {
        0 => Mapper::Nrom(MapperImpl { cartridge, data: Nrom::new(mirroring) }),
        1 => Mapper::Mmc1(MapperImpl { cartridge, data: Mmc1::new(chr_type) }),
        2 | 94 | 180 => Mapper::Uxrom(MapperImpl {
            cartridge,
            data: Uxrom::new(mapper_number, mirroring),
        }),
        3 => Mapper::Cnrom(MapperImpl { cartridge, data: Cnrom::new(mirroring) }),
        4 => Mapper::Mmc3(MapperImpl { cartridge, data: Mmc3::new(mirroring) }),
        7 => Mapper::Axrom(MapperImpl { cartridge, data: Axrom::new() }),
        11 => Mapper::ColorDreams(MapperImpl { cartridge, data: ColorDreams::new(mirroring) }),
        34 => Mapper::Gxrom(MapperImpl { cartridge, data: Gxrom::new(mirroring, true) }),
        66 => Mapper::Gxrom(MapperImpl { cartridge, data: Gxrom::new(mirroring, false) }),
        69 => Mapper::Fme7(MapperImpl { cartridge, data: Fme7::new() }),
        _ => {
            return Err(CartridgeError::UnsupportedMapper { mapper_number });
        }
    };

    log::info!("Using mapper: {}", mapper.name());

    Ok(mapper)
}

fn apply_per_game_exceptions(mapper_number: u16, prg_crc32: u32) -> u16 {
    match (mapper_number, prg_crc32) {
        // Cybernoid declares CNROM but its PRG writes expect Color Dreams register layout
        (3, 0x1BC686A8) => 11,
        _ => mapper_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_rom(mapper: u8, prg_pages: u8, chr_pages: u8) -> Vec<u8> {
        let mut rom = vec![0; HEADER_LEN];
        rom[..4].copy_from_slice(&INES_MAGIC);
        rom[4] = prg_pages;
        rom[5] = chr_pages;
        rom[6] = (mapper << 4) & 0xF0;
        rom[7] = mapper & 0xF0;
        rom.resize(
            HEADER_LEN
                + usize::try_from(u32::from(prg_pages) * PRG_PAGE_LEN).unwrap()
                + usize::try_from(u32::from(chr_pages) * CHR_PAGE_LEN).unwrap(),
            0,
        );
        rom
    }

    #[test]
    fn parses_basic_ines_header() {
        let rom = build_rom(0, 2, 1);
        let header = INesHeader::parse(&rom).unwrap();

        assert_eq!(header.mapper_number, 0);
        assert_eq!(header.prg_rom_len, 32 * 1024);
        assert_eq!(header.chr_rom_len, 8 * 1024);
        assert_eq!(header.chr_ram_len, 0);
        assert!(!header.has_battery);
    }

    #[test]
    fn chr_ram_assumed_when_no_chr_rom() {
        let rom = build_rom(0, 1, 0);
        let header = INesHeader::parse(&rom).unwrap();
        assert_eq!(header.chr_ram_len, 8 * 1024);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut rom = build_rom(0, 1, 1);
        rom[0] = b'X';
        assert!(matches!(INesHeader::parse(&rom), Err(CartridgeError::InvalidMagic)));
    }

    #[test]
    fn rejects_truncated_rom() {
        let mut rom = build_rom(0, 2, 1);
        rom.truncate(rom.len() - 1);
        assert!(matches!(
            from_ines_file(&rom, None, None),
            Err(CartridgeError::RomTruncated)
        ));
    }

    #[test]
    fn unsupported_mapper_is_an_error() {
        let rom = build_rom(99, 1, 1);
        assert!(matches!(
            from_ines_file(&rom, None, None),
            Err(CartridgeError::UnsupportedMapper { mapper_number: 99 })
        ));
    }

    #[test]
    fn nes2_header_extends_mapper_number() {
        let mut rom = build_rom(0, 1, 1);
        rom[7] |= 0x08; // NES 2.0
        rom[8] = 0x01; // mapper high bits
        let header = INesHeader::parse(&rom).unwrap();
        assert_eq!(header.mapper_number, 0x100);
    }
}

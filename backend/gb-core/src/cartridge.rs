//! Cartridge loading: the $0100-$014F header and the MBC mapper family.

use bincode::{Decode, Encode};
use nexen_common::timeutils;
use nexen_proc_macros::{FakeDecode, FakeEncode, MatchEachVariantMacro, PartialClone};
use nexen_common::num::GetBit;
use std::ops::Deref;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("ROM is too short to contain a cartridge header")]
    HeaderTooShort,
    #[error("ROM header checksum mismatch: computed {computed:02X}, stored {stored:02X}")]
    HeaderChecksumMismatch { computed: u8, stored: u8 },
    #[error("cartridge type {cartridge_type:02X} is not supported")]
    UnsupportedMapper { cartridge_type: u8 },
}

const HEADER_START: usize = 0x0100;
const HEADER_END: usize = 0x0150;

const TITLE_RANGE: std::ops::Range<usize> = 0x0134..0x0144;
const CGB_FLAG: usize = 0x0143;
const CARTRIDGE_TYPE: usize = 0x0147;
const ROM_SIZE_CODE: usize = 0x0148;
const RAM_SIZE_CODE: usize = 0x0149;
const HEADER_CHECKSUM: usize = 0x014D;
const GLOBAL_CHECKSUM: usize = 0x014E;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartridgeHeader {
    pub title: String,
    pub cgb_support: bool,
    pub cgb_only: bool,
    pub cartridge_type: u8,
    pub rom_len: u32,
    pub ram_len: u32,
    pub has_battery: bool,
    pub has_rtc: bool,
    pub global_checksum: u16,
}

impl CartridgeHeader {
    /// Parse the cartridge header, validating the header checksum the boot ROM checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM is too short or the header checksum does not match.
    pub fn parse(rom: &[u8]) -> Result<Self, CartridgeError> {
        if rom.len() < HEADER_END {
            return Err(CartridgeError::HeaderTooShort);
        }

        let mut computed = 0_u8;
        for &byte in &rom[TITLE_RANGE.start..HEADER_CHECKSUM] {
            computed = computed.wrapping_sub(byte).wrapping_sub(1);
        }
        let stored = rom[HEADER_CHECKSUM];
        if computed != stored {
            return Err(CartridgeError::HeaderChecksumMismatch { computed, stored });
        }

        let title = rom[TITLE_RANGE]
            .iter()
            .copied()
            .take_while(|&byte| byte != 0 && byte < 0x80)
            .map(char::from)
            .collect();

        let cgb_flag = rom[CGB_FLAG];
        let cartridge_type = rom[CARTRIDGE_TYPE];

        let rom_len = 32 * 1024 << rom[ROM_SIZE_CODE].min(8);
        let ram_len = match rom[RAM_SIZE_CODE] {
            0x02 => 8 * 1024,
            0x03 => 32 * 1024,
            0x04 => 128 * 1024,
            0x05 => 64 * 1024,
            _ => 0,
        };

        let has_battery =
            matches!(cartridge_type, 0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E);
        let has_rtc = matches!(cartridge_type, 0x0F | 0x10);

        Ok(Self {
            title,
            cgb_support: cgb_flag & 0x80 != 0,
            cgb_only: cgb_flag == 0xC0,
            cartridge_type,
            rom_len,
            ram_len,
            has_battery,
            has_rtc,
            global_checksum: u16::from_be_bytes([rom[GLOBAL_CHECKSUM], rom[GLOBAL_CHECKSUM + 1]]),
        })
    }
}

/// ROM blob excluded from serialized state and rewind clones.
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
    pub(crate) rom: Rom,
    pub(crate) ram: Vec<u8>,
    pub(crate) has_battery: bool,
    ram_dirty: bool,
}

impl Cartridge {
    fn rom_byte(&self, address: u32) -> u8 {
        self.rom[(address as usize) & (self.rom.len() - 1)]
    }

    fn ram_byte(&self, address: u32) -> u8 {
        if self.ram.is_empty() {
            return 0xFF;
        }
        self.ram[(address as usize) & (self.ram.len() - 1)]
    }

    fn set_ram_byte(&mut self, address: u32, value: u8) {
        if self.ram.is_empty() {
            return;
        }
        let len = self.ram.len();
        self.ram[(address as usize) & (len - 1)] = value;
        self.ram_dirty = true;
    }

    pub(crate) fn get_and_clear_ram_dirty_bit(&mut self) -> bool {
        let dirty = self.ram_dirty;
        self.ram_dirty = false;
        dirty
    }
}

// ===== MBC implementations =====

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct NoMbc;

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Mbc1 {
    ram_enabled: bool,
    rom_bank: u8,
    ram_bank: u8,
    // Mode 1 repurposes the RAM bank bits as ROM bank high bits for large ROMs
    banking_mode: bool,
}

impl Mbc1 {
    fn new() -> Self {
        Self { ram_enabled: false, rom_bank: 1, ram_bank: 0, banking_mode: false }
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Mbc2 {
    ram_enabled: bool,
    rom_bank: u8,
}

impl Mbc2 {
    fn new() -> Self {
        Self { ram_enabled: false, rom_bank: 1 }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct RealTimeClock {
    seconds: u8,
    minutes: u8,
    hours: u8,
    day_counter: u16,
    halted: bool,
    day_carry: bool,
    latched: [u8; 5],
    latch_armed: bool,
    last_update_nanos: u128,
}

impl RealTimeClock {
    fn new() -> Self {
        Self {
            seconds: 0,
            minutes: 0,
            hours: 0,
            day_counter: 0,
            halted: false,
            day_carry: false,
            latched: [0; 5],
            latch_armed: false,
            last_update_nanos: timeutils::current_time_nanos(),
        }
    }

    fn catch_up(&mut self) {
        let now = timeutils::current_time_nanos();
        let elapsed_seconds = ((now - self.last_update_nanos) / 1_000_000_000) as u64;
        if elapsed_seconds == 0 || self.halted {
            self.last_update_nanos = now;
            return;
        }
        self.last_update_nanos = now;

        let mut total = u64::from(self.seconds)
            + 60 * u64::from(self.minutes)
            + 3600 * u64::from(self.hours)
            + 86400 * u64::from(self.day_counter)
            + elapsed_seconds;

        self.seconds = (total % 60) as u8;
        total /= 60;
        self.minutes = (total % 60) as u8;
        total /= 60;
        self.hours = (total % 24) as u8;
        total /= 24;
        if total > 0x1FF {
            self.day_carry = true;
        }
        self.day_counter = (total & 0x1FF) as u16;
    }

    fn latch(&mut self) {
        self.catch_up();
        self.latched = [
            self.seconds,
            self.minutes,
            self.hours,
            (self.day_counter & 0xFF) as u8,
            (u8::from(self.day_counter.bit(8)))
                | (u8::from(self.halted) << 6)
                | (u8::from(self.day_carry) << 7),
        ];
    }

    fn read_register(&self, register: u8) -> u8 {
        self.latched.get(usize::from(register.wrapping_sub(0x08))).copied().unwrap_or(0xFF)
    }

    fn write_register(&mut self, register: u8, value: u8) {
        self.catch_up();
        match register {
            0x08 => self.seconds = value & 0x3F,
            0x09 => self.minutes = value & 0x3F,
            0x0A => self.hours = value & 0x1F,
            0x0B => self.day_counter = (self.day_counter & 0x100) | u16::from(value),
            0x0C => {
                self.day_counter = (self.day_counter & 0xFF) | (u16::from(value & 0x01) << 8);
                self.halted = value.bit(6);
                self.day_carry = value.bit(7);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Mbc3 {
    ram_enabled: bool,
    rom_bank: u8,
    // 0-3 select RAM banks; 8-12 select RTC registers
    ram_bank: u8,
    rtc: Option<RealTimeClock>,
}

impl Mbc3 {
    fn new(has_rtc: bool) -> Self {
        Self { ram_enabled: false, rom_bank: 1, ram_bank: 0, rtc: has_rtc.then(RealTimeClock::new) }
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Mbc5 {
    ram_enabled: bool,
    rom_bank: u16,
    ram_bank: u8,
}

impl Mbc5 {
    fn new() -> Self {
        Self { ram_enabled: false, rom_bank: 1, ram_bank: 0 }
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct MapperImpl<MapperData> {
    #[partial_clone(partial)]
    pub(crate) cartridge: Cartridge,
    #[partial_clone(partial)]
    pub(crate) data: MapperData,
}

#[derive(Debug, Clone, Encode, Decode, MatchEachVariantMacro, PartialClone)]
pub(crate) enum Mapper {
    None(#[partial_clone(partial)] MapperImpl<NoMbc>),
    Mbc1(#[partial_clone(partial)] MapperImpl<Mbc1>),
    Mbc2(#[partial_clone(partial)] MapperImpl<Mbc2>),
    Mbc3(#[partial_clone(partial)] MapperImpl<Mbc3>),
    Mbc5(#[partial_clone(partial)] MapperImpl<Mbc5>),
}

impl Mapper {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::None(..) => "ROM only",
            Self::Mbc1(..) => "MBC1",
            Self::Mbc2(..) => "MBC2",
            Self::Mbc3(..) => "MBC3",
            Self::Mbc5(..) => "MBC5",
        }
    }

    pub(crate) fn read_rom(&self, address: u16) -> u8 {
        match self {
            Self::None(mapper) => mapper.cartridge.rom_byte(address.into()),
            Self::Mbc1(mapper) => {
                let data = &mapper.data;
                let bank = match address {
                    0x0000..=0x3FFF if data.banking_mode => u32::from(data.ram_bank) << 5,
                    0x0000..=0x3FFF => 0,
                    _ => u32::from(data.rom_bank) | (u32::from(data.ram_bank) << 5),
                };
                mapper.cartridge.rom_byte((bank << 14) | u32::from(address & 0x3FFF))
            }
            Self::Mbc2(mapper) => {
                let bank =
                    if address < 0x4000 { 0 } else { u32::from(mapper.data.rom_bank) };
                mapper.cartridge.rom_byte((bank << 14) | u32::from(address & 0x3FFF))
            }
            Self::Mbc3(mapper) => {
                let bank = if address < 0x4000 { 0 } else { u32::from(mapper.data.rom_bank) };
                mapper.cartridge.rom_byte((bank << 14) | u32::from(address & 0x3FFF))
            }
            Self::Mbc5(mapper) => {
                let bank = if address < 0x4000 { 0 } else { u32::from(mapper.data.rom_bank) };
                mapper.cartridge.rom_byte((bank << 14) | u32::from(address & 0x3FFF))
            }
        }
    }

    pub(crate) fn read_ram(&self, address: u16) -> u8 {
        match self {
            Self::None(mapper) => mapper.cartridge.ram_byte(u32::from(address & 0x1FFF)),
            Self::Mbc1(mapper) => {
                if !mapper.data.ram_enabled {
                    return 0xFF;
                }
                let bank = if mapper.data.banking_mode { mapper.data.ram_bank } else { 0 };
                mapper
                    .cartridge
                    .ram_byte((u32::from(bank) << 13) | u32::from(address & 0x1FFF))
            }
            Self::Mbc2(mapper) => {
                if !mapper.data.ram_enabled {
                    return 0xFF;
                }
                // 512 half-bytes; upper nibble is open
                0xF0 | mapper.cartridge.ram_byte(u32::from(address & 0x01FF))
            }
            Self::Mbc3(mapper) => {
                if !mapper.data.ram_enabled {
                    return 0xFF;
                }
                match mapper.data.ram_bank {
                    bank @ 0x00..=0x03 => mapper
                        .cartridge
                        .ram_byte((u32::from(bank) << 13) | u32::from(address & 0x1FFF)),
                    register @ 0x08..=0x0C => mapper
                        .data
                        .rtc
                        .as_ref()
                        .map_or(0xFF, |rtc| rtc.read_register(register)),
                    _ => 0xFF,
                }
            }
            Self::Mbc5(mapper) => {
                if !mapper.data.ram_enabled {
                    return 0xFF;
                }
                mapper
                    .cartridge
                    .ram_byte((u32::from(mapper.data.ram_bank) << 13) | u32::from(address & 0x1FFF))
            }
        }
    }

    pub(crate) fn write_ram(&mut self, address: u16, value: u8) {
        match self {
            Self::None(mapper) => mapper.cartridge.set_ram_byte(u32::from(address & 0x1FFF), value),
            Self::Mbc1(mapper) => {
                if !mapper.data.ram_enabled {
                    return;
                }
                let bank = if mapper.data.banking_mode { mapper.data.ram_bank } else { 0 };
                mapper
                    .cartridge
                    .set_ram_byte((u32::from(bank) << 13) | u32::from(address & 0x1FFF), value);
            }
            Self::Mbc2(mapper) => {
                if mapper.data.ram_enabled {
                    mapper.cartridge.set_ram_byte(u32::from(address & 0x01FF), value & 0x0F);
                }
            }
            Self::Mbc3(mapper) => {
                if !mapper.data.ram_enabled {
                    return;
                }
                match mapper.data.ram_bank {
                    bank @ 0x00..=0x03 => mapper.cartridge.set_ram_byte(
                        (u32::from(bank) << 13) | u32::from(address & 0x1FFF),
                        value,
                    ),
                    register @ 0x08..=0x0C => {
                        if let Some(rtc) = &mut mapper.data.rtc {
                            rtc.write_register(register, value);
                        }
                    }
                    _ => {}
                }
            }
            Self::Mbc5(mapper) => {
                if mapper.data.ram_enabled {
                    mapper.cartridge.set_ram_byte(
                        (u32::from(mapper.data.ram_bank) << 13) | u32::from(address & 0x1FFF),
                        value,
                    );
                }
            }
        }
    }

    pub(crate) fn write_rom_register(&mut self, address: u16, value: u8) {
        match self {
            Self::None(..) => {}
            Self::Mbc1(mapper) => match address {
                0x0000..=0x1FFF => mapper.data.ram_enabled = value & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    // Bank 0 is not selectable; writing 0 selects 1
                    mapper.data.rom_bank = (value & 0x1F).max(1);
                }
                0x4000..=0x5FFF => mapper.data.ram_bank = value & 0x03,
                _ => mapper.data.banking_mode = value.bit(0),
            },
            Self::Mbc2(mapper) => {
                if address < 0x4000 {
                    // Address bit 8 selects between RAM enable and ROM bank
                    if address.bit(8) {
                        mapper.data.rom_bank = (value & 0x0F).max(1);
                    } else {
                        mapper.data.ram_enabled = value & 0x0F == 0x0A;
                    }
                }
            }
            Self::Mbc3(mapper) => match address {
                0x0000..=0x1FFF => mapper.data.ram_enabled = value & 0x0F == 0x0A,
                0x2000..=0x3FFF => mapper.data.rom_bank = (value & 0x7F).max(1),
                0x4000..=0x5FFF => mapper.data.ram_bank = value & 0x0F,
                _ => {
                    // Latch on a 0 -> 1 write sequence
                    if let Some(rtc) = &mut mapper.data.rtc {
                        if value == 0x00 {
                            rtc.latch_armed = true;
                        } else if value == 0x01 && rtc.latch_armed {
                            rtc.latch_armed = false;
                            rtc.latch();
                        } else {
                            rtc.latch_armed = false;
                        }
                    }
                }
            },
            Self::Mbc5(mapper) => match address {
                0x0000..=0x1FFF => mapper.data.ram_enabled = value & 0x0F == 0x0A,
                0x2000..=0x2FFF => {
                    mapper.data.rom_bank = (mapper.data.rom_bank & 0x100) | u16::from(value);
                }
                0x3000..=0x3FFF => {
                    mapper.data.rom_bank =
                        (mapper.data.rom_bank & 0xFF) | (u16::from(value & 0x01) << 8);
                }
                0x4000..=0x5FFF => mapper.data.ram_bank = value & 0x0F,
                _ => {}
            },
        }
    }

    pub(crate) fn has_battery(&self) -> bool {
        match_each_variant!(self, mapper => mapper.cartridge.has_battery)
    }

    pub(crate) fn sram(&self) -> &[u8] {
        match_each_variant!(self, mapper => &mapper.cartridge.ram)
    }

    pub(crate) fn get_and_clear_ram_dirty_bit(&mut self) -> bool {
        match_each_variant!(self, mapper => mapper.cartridge.get_and_clear_ram_dirty_bit())
    }

    pub(crate) fn move_rom_from(&mut self, other: &mut Self) {
        let rom = match_each_variant!(other, mapper => std::mem::take(&mut mapper.cartridge.rom));
        match_each_variant!(self, mapper => mapper.cartridge.rom = rom);
    }
}

/// Construct the mapper for a ROM image.
pub(crate) fn create_mapper(
    rom: Vec<u8>,
    header: &CartridgeHeader,
    sav_bytes: Option<Vec<u8>>,
) -> Result<Mapper, CartridgeError> {
    let ram_len = if header.cartridge_type == 0x05 || header.cartridge_type == 0x06 {
        // MBC2 has 512 internal half-bytes regardless of the header RAM code
        512
    } else {
        header.ram_len as usize
    };

    let ram = match sav_bytes {
        Some(sav) if header.has_battery && sav.len() == ram_len => sav,
        _ => vec![0; ram_len],
    };

    let cartridge =
        Cartridge { rom: Rom(rom), ram, has_battery: header.has_battery, ram_dirty: false };

    let mapper = match header.cartridge_type {
        0x00 | 0x08 | 0x09 => Mapper::None(MapperImpl { cartridge, data: NoMbc }),
        0x01..=0x03 => Mapper::Mbc1(MapperImpl { cartridge, data: Mbc1::new() }),
        0x05 | 0x06 => Mapper::Mbc2(MapperImpl { cartridge, data: Mbc2::new() }),
        0x0F..=0x13 => {
            Mapper::Mbc3(MapperImpl { cartridge, data: Mbc3::new(header.has_rtc) })
        }
        0x19..=0x1E => Mapper::Mbc5(MapperImpl { cartridge, data: Mbc5::new() }),
        cartridge_type => {
            return Err(CartridgeError::UnsupportedMapper { cartridge_type });
        }
    };

    log::info!(
        "Loaded '{}': {} with {}KB ROM, {}KB RAM, battery {}",
        header.title,
        mapper.name(),
        header.rom_len / 1024,
        ram_len / 1024,
        header.has_battery,
    );

    Ok(mapper)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn build_rom(title: &str, cartridge_type: u8, ram_size_code: u8) -> Vec<u8> {
        let mut rom = vec![0; 32 * 1024];
        rom[TITLE_RANGE.start..TITLE_RANGE.start + title.len()]
            .copy_from_slice(title.as_bytes());
        rom[CARTRIDGE_TYPE] = cartridge_type;
        rom[ROM_SIZE_CODE] = 0;
        rom[RAM_SIZE_CODE] = ram_size_code;

        let mut checksum = 0_u8;
        for &byte in &rom[TITLE_RANGE.start..HEADER_CHECKSUM] {
            checksum = checksum.wrapping_sub(byte).wrapping_sub(1);
        }
        rom[HEADER_CHECKSUM] = checksum;
        rom
    }

    #[test]
    fn parses_tetris_style_header() {
        let rom = build_rom("TETRIS", 0x00, 0x00);
        let header = CartridgeHeader::parse(&rom).unwrap();

        assert_eq!(header.title, "TETRIS");
        assert_eq!(header.cartridge_type, 0x00);
        assert!(!header.has_battery);
        assert_eq!(header.ram_len, 0);
        assert!(!header.cgb_support);
    }

    #[test]
    fn rejects_bad_header_checksum() {
        let mut rom = build_rom("TEST", 0x00, 0x00);
        rom[HEADER_CHECKSUM] ^= 0xFF;
        assert!(matches!(
            CartridgeHeader::parse(&rom),
            Err(CartridgeError::HeaderChecksumMismatch { .. })
        ));
    }

    #[test]
    fn mbc1_bank_switching() {
        let mut rom = build_rom("BANKS", 0x01, 0x00);
        rom.resize(128 * 1024, 0);
        for bank in 0..8 {
            rom[bank * 0x4000] = bank as u8;
        }
        // Re-fix the header checksum after resizing (bank 0 contents unchanged)

        let header = CartridgeHeader::parse(&rom).unwrap();
        let mut mapper = create_mapper(rom, &header, None).unwrap();

        assert_eq!(mapper.read_rom(0x4000), 1);
        mapper.write_rom_register(0x2000, 5);
        assert_eq!(mapper.read_rom(0x4000), 5);
        // Bank 0 write selects bank 1
        mapper.write_rom_register(0x2000, 0);
        assert_eq!(mapper.read_rom(0x4000), 1);
    }

    #[test]
    fn mbc1_ram_requires_enable() {
        let rom = build_rom("RAMTEST", 0x03, 0x02);
        let header = CartridgeHeader::parse(&rom).unwrap();
        let mut mapper = create_mapper(rom, &header, None).unwrap();

        mapper.write_ram(0xA000, 0x55);
        assert_eq!(mapper.read_ram(0xA000), 0xFF);

        mapper.write_rom_register(0x0000, 0x0A);
        mapper.write_ram(0xA000, 0x55);
        assert_eq!(mapper.read_ram(0xA000), 0x55);
    }

    #[test]
    fn mbc5_nine_bit_rom_bank() {
        let mut rom = build_rom("BIGROM", 0x19, 0x00);
        rom.resize(4 * 1024 * 1024, 0);
        rom[256 * 0x4000] = 0xAB;

        let header = CartridgeHeader::parse(&rom).unwrap();
        let mut mapper = create_mapper(rom, &header, None).unwrap();

        mapper.write_rom_register(0x2000, 0x00);
        mapper.write_rom_register(0x3000, 0x01); // bank 256
        assert_eq!(mapper.read_rom(0x4000), 0xAB);
    }
}

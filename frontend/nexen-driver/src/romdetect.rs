//! ROM format identification for every console family Nexen knows about.
//!
//! Detection is extension-first with header validation as the tie-breaker, since several
//! formats are raw dumps with no magic bytes.

use nexen_proc_macros::{EnumAll, EnumDisplay, EnumFromStr};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay, EnumFromStr, EnumAll)]
pub enum System {
    Nes,
    GameBoy,
    GameBoyColor,
    GameBoyAdvance,
    Snes,
    MasterSystem,
    GameGear,
    PcEngine,
    Lynx,
    WonderSwan,
}

impl System {
    /// Whether this build ships a full console core for the system. The remaining systems are
    /// identified and reported, with their CPU cores available as library crates.
    #[must_use]
    pub fn has_core(self) -> bool {
        matches!(
            self,
            Self::Nes | Self::GameBoy | Self::GameBoyColor | Self::MasterSystem | Self::GameGear
        )
    }
}

/// Identify the system a ROM image belongs to.
#[must_use]
pub fn detect_system(path: &Path, rom: &[u8]) -> Option<System> {
    let extension =
        path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("nes") => return Some(System::Nes),
        Some("gb") => return Some(System::GameBoy),
        Some("gbc") => return Some(System::GameBoyColor),
        Some("gba") => return Some(System::GameBoyAdvance),
        Some("sfc" | "smc") => return Some(System::Snes),
        Some("sms") => return Some(System::MasterSystem),
        Some("gg") => return Some(System::GameGear),
        Some("pce") => return Some(System::PcEngine),
        Some("lnx" | "lyx") => return Some(System::Lynx),
        Some("ws" | "wsc") => return Some(System::WonderSwan),
        _ => {}
    }

    detect_by_contents(rom)
}

fn detect_by_contents(rom: &[u8]) -> Option<System> {
    if rom.len() >= 16 && rom[..4] == *b"NES\x1A" {
        return Some(System::Nes);
    }

    if rom.len() >= 4 && rom[..4] == *b"LYNX" {
        return Some(System::Lynx);
    }

    // GB: the Nintendo logo at $0104 is checked by the boot ROM, so it is a reliable magic
    const GB_LOGO_PREFIX: [u8; 8] = [0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B];
    if rom.len() >= 0x0150 && rom[0x0104..0x010C] == GB_LOGO_PREFIX {
        return if rom[0x0143] & 0x80 != 0 {
            Some(System::GameBoyColor)
        } else {
            Some(System::GameBoy)
        };
    }

    // GBA: header starts with an ARM branch and carries the same compressed logo
    if rom.len() >= 0xC0 && rom[3] == 0xEA && rom[0xB2] == 0x96 {
        return Some(System::GameBoyAdvance);
    }

    // WonderSwan: 16-byte footer ending in a fixed publisher/$00 pattern; the last two bytes
    // are a checksum and the footer starts with $EA far-jump bytes
    if rom.len() >= 16 && rom[rom.len() - 16] == 0xEA {
        return Some(System::WonderSwan);
    }

    // SNES: score LoROM vs HiROM header candidates by checksum + printable title
    if snes_header_score(rom, 0x7FC0).max(snes_header_score(rom, 0xFFC0)) >= 2 {
        return Some(System::Snes);
    }

    None
}

/// Score a candidate SNES internal header: checksum pair consistency and a printable title
/// each add a point.
fn snes_header_score(rom: &[u8], header_addr: usize) -> u32 {
    if rom.len() < header_addr + 0x20 {
        return 0;
    }

    let mut score = 0;

    let checksum = u16::from_le_bytes([rom[header_addr + 0x1E], rom[header_addr + 0x1F]]);
    let complement = u16::from_le_bytes([rom[header_addr + 0x1C], rom[header_addr + 0x1D]]);
    if checksum != 0 && checksum ^ complement == 0xFFFF {
        score += 2;
    }

    let title = &rom[header_addr..header_addr + 21];
    if title.iter().all(|&byte| byte == 0x20 || (0x20..0x7F).contains(&byte)) {
        score += 1;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn detects_by_extension() {
        for (name, system) in [
            ("game.nes", System::Nes),
            ("game.gb", System::GameBoy),
            ("game.gbc", System::GameBoyColor),
            ("game.gba", System::GameBoyAdvance),
            ("game.sfc", System::Snes),
            ("game.sms", System::MasterSystem),
            ("game.gg", System::GameGear),
            ("game.pce", System::PcEngine),
            ("game.lnx", System::Lynx),
            ("game.ws", System::WonderSwan),
        ] {
            assert_eq!(detect_system(&PathBuf::from(name), &[]), Some(system), "{name}");
        }
    }

    #[test]
    fn detects_ines_magic_without_extension() {
        let mut rom = vec![0; 32];
        rom[..4].copy_from_slice(b"NES\x1A");
        assert_eq!(detect_system(&PathBuf::from("dump.bin"), &rom), Some(System::Nes));
    }

    #[test]
    fn detects_gb_logo_without_extension() {
        let mut rom = vec![0; 0x0150];
        rom[0x0104..0x010C].copy_from_slice(&[0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B]);
        assert_eq!(detect_system(&PathBuf::from("dump.bin"), &rom), Some(System::GameBoy));

        rom[0x0143] = 0x80;
        assert_eq!(
            detect_system(&PathBuf::from("dump.bin"), &rom),
            Some(System::GameBoyColor)
        );
    }

    #[test]
    fn detects_snes_by_header_score() {
        let mut rom = vec![0; 64 * 1024];
        rom[0x7FC0..0x7FD5].copy_from_slice(b"SOME GAME TITLE      ");
        rom[0x7FDC] = 0xAA;
        rom[0x7FDD] = 0x55;
        rom[0x7FDE] = 0x55;
        rom[0x7FDF] = 0xAA;
        assert_eq!(detect_system(&PathBuf::from("dump.bin"), &rom), Some(System::Snes));
    }

    #[test]
    fn core_availability() {
        assert!(System::Nes.has_core());
        assert!(System::GameBoy.has_core());
        assert!(System::MasterSystem.has_core());
        assert!(!System::Snes.has_core());
        assert!(!System::GameBoyAdvance.has_core());
    }
}

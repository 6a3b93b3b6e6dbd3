//! Sunsoft FME-7 / 5B (iNES mapper 69): command/parameter register interface, 8KB PRG banking
//! with bankable $6000 region, 1KB CHR banking, a 16-bit CPU-cycle IRQ counter, and (on the 5B)
//! three YM2149-style square wave expansion audio channels that feed the console mixer.

use crate::cartridge::MapperImpl;
use crate::cartridge::mappers::{BankSizeKb, NametableMirroring, basic_ppu_read, basic_ppu_write};
use bincode::{Decode, Encode};
use nexen_common::audio::{AudioDelta, DeltaBuffer};
use nexen_common::num::GetBit;
use nexen_proc_macros::PartialClone;

// Large enough for the longest PAL frame in CPU cycles
const DELTA_BUFFER_CYCLES: usize = 40_000;

#[derive(Debug, Clone, Encode, Decode)]
struct SquareChannel {
    period: u16,
    counter: u16,
    output_high: bool,
    volume: u8,
    enabled: bool,
}

impl SquareChannel {
    fn new() -> Self {
        Self { period: 1, counter: 1, output_high: false, volume: 0, enabled: false }
    }

    fn clock(&mut self) -> bool {
        if self.counter == 0 {
            self.counter = self.period.max(1);
            self.output_high = !self.output_high;
            true
        } else {
            self.counter -= 1;
            false
        }
    }

    fn level(&self) -> f64 {
        if !self.enabled || !self.output_high || self.volume == 0 {
            return 0.0;
        }
        // YM2149 DAC steps are roughly 3dB per volume level
        1.0 / f64::from(1 << (15 - self.volume.min(15)))
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialClone)]
pub(crate) struct Fme7 {
    command: u8,
    prg_banks: [u8; 4],
    prg_ram_selected: bool,
    prg_ram_enabled: bool,
    chr_banks: [u8; 8],
    nametable_mirroring: NametableMirroring,
    irq_enabled: bool,
    irq_counter_enabled: bool,
    irq_counter: u16,
    irq_line: bool,
    audio_command: u8,
    channels: [SquareChannel; 3],
    audio_divider: u8,
    last_output_level: f64,
    audio_deltas: DeltaBuffer,
}

impl Fme7 {
    pub(crate) fn new() -> Self {
        Self {
            command: 0,
            prg_banks: [0; 4],
            prg_ram_selected: false,
            prg_ram_enabled: false,
            chr_banks: [0; 8],
            nametable_mirroring: NametableMirroring::Vertical,
            irq_enabled: false,
            irq_counter_enabled: false,
            irq_counter: 0,
            irq_line: false,
            audio_command: 0,
            channels: [SquareChannel::new(), SquareChannel::new(), SquareChannel::new()],
            audio_divider: 0,
            last_output_level: 0.0,
            audio_deltas: DeltaBuffer::new(DELTA_BUFFER_CYCLES),
        }
    }

    fn output_level(&self) -> f64 {
        self.channels.iter().map(SquareChannel::level).sum()
    }
}

impl MapperImpl<Fme7> {
    fn prg_rom_address(&self, address: u16) -> u32 {
        let bank = match address {
            0x8000..=0x9FFF => self.data.prg_banks[1],
            0xA000..=0xBFFF => self.data.prg_banks[2],
            0xC000..=0xDFFF => self.data.prg_banks[3],
            0xE000..=0xFFFF => (self.cartridge.prg_rom.len() >> 13) as u8 - 1,
            _ => panic!("invalid FME-7 PRG address: {address:04X}"),
        };
        BankSizeKb::Eight.to_absolute_address(bank, address)
    }

    pub(crate) fn read_cpu_address(&mut self, address: u16) -> Option<u8> {
        self.peek_cpu_address(address)
    }

    pub(crate) fn peek_cpu_address(&self, address: u16) -> Option<u8> {
        match address {
            0x6000..=0x7FFF => {
                if self.data.prg_ram_selected {
                    (self.data.prg_ram_enabled && !self.cartridge.prg_ram.is_empty())
                        .then(|| self.cartridge.get_prg_ram(u32::from(address & 0x1FFF)))
                } else {
                    Some(self.cartridge.get_prg_rom(
                        BankSizeKb::Eight.to_absolute_address(self.data.prg_banks[0], address),
                    ))
                }
            }
            0x8000..=0xFFFF => Some(self.cartridge.get_prg_rom(self.prg_rom_address(address))),
            _ => None,
        }
    }

    pub(crate) fn write_cpu_address(&mut self, address: u16, value: u8) {
        match address {
            0x6000..=0x7FFF => {
                if self.data.prg_ram_selected
                    && self.data.prg_ram_enabled
                    && !self.cartridge.prg_ram.is_empty()
                {
                    self.cartridge.set_prg_ram(u32::from(address & 0x1FFF), value);
                }
            }
            0x8000..=0x9FFF => {
                self.data.command = value & 0x0F;
            }
            0xA000..=0xBFFF => self.write_parameter(value),
            0xC000..=0xDFFF => {
                self.data.audio_command = value & 0x0F;
            }
            0xE000..=0xFFFF => self.write_audio_parameter(value),
            _ => {}
        }
    }

    fn write_parameter(&mut self, value: u8) {
        match self.data.command {
            0x0..=0x7 => {
                self.data.chr_banks[self.data.command as usize] = value;
            }
            0x8 => {
                self.data.prg_banks[0] = value & 0x3F;
                self.data.prg_ram_selected = value.bit(6);
                self.data.prg_ram_enabled = value.bit(7);
            }
            0x9..=0xB => {
                self.data.prg_banks[(self.data.command - 0x8) as usize] = value & 0x3F;
            }
            0xC => {
                self.data.nametable_mirroring = match value & 0x03 {
                    0x00 => NametableMirroring::Vertical,
                    0x01 => NametableMirroring::Horizontal,
                    0x02 => NametableMirroring::SingleScreenBank0,
                    _ => NametableMirroring::SingleScreenBank1,
                };
            }
            0xD => {
                self.data.irq_enabled = value.bit(0);
                self.data.irq_counter_enabled = value.bit(7);
                // Writing the control register acknowledges any pending IRQ
                self.data.irq_line = false;
            }
            0xE => {
                self.data.irq_counter = (self.data.irq_counter & 0xFF00) | u16::from(value);
            }
            0xF => {
                self.data.irq_counter =
                    (self.data.irq_counter & 0x00FF) | (u16::from(value) << 8);
            }
            _ => unreachable!("command register is masked to 4 bits"),
        }
    }

    fn write_audio_parameter(&mut self, value: u8) {
        let channels = &mut self.data.channels;
        match self.data.audio_command {
            0x0 | 0x2 | 0x4 => {
                let channel = &mut channels[(self.data.audio_command / 2) as usize];
                channel.period = (channel.period & 0x0F00) | u16::from(value);
            }
            0x1 | 0x3 | 0x5 => {
                let channel = &mut channels[(self.data.audio_command / 2) as usize];
                channel.period = (channel.period & 0x00FF) | (u16::from(value & 0x0F) << 8);
            }
            0x7 => {
                // Tone enable bits are active-low
                for (i, channel) in channels.iter_mut().enumerate() {
                    channel.enabled = !value.bit(i as u8);
                }
            }
            0x8..=0xA => {
                channels[(self.data.audio_command - 0x8) as usize].volume = value & 0x0F;
            }
            _ => {}
        }
    }

    /// CPU-cycle clocking: the IRQ down-counter and the expansion audio tone generators.
    pub(crate) fn clock_cpu(&mut self, frame_cycle: u32) {
        if self.data.irq_counter_enabled {
            let (new_counter, underflowed) = self.data.irq_counter.overflowing_sub(1);
            self.data.irq_counter = new_counter;
            if underflowed && self.data.irq_enabled {
                self.data.irq_line = true;
            }
        }

        // Tone generators clock at CPU/16
        self.data.audio_divider = (self.data.audio_divider + 1) & 0x0F;
        if self.data.audio_divider == 0 {
            let mut any_toggled = false;
            for channel in &mut self.data.channels {
                any_toggled |= channel.clock();
            }

            if any_toggled {
                let level = self.data.output_level();
                let change = level - self.data.last_output_level;
                self.data.audio_deltas.push(frame_cycle, change);
                self.data.last_output_level = level;
            }
        }
    }

    pub(crate) fn irq(&self) -> bool {
        self.data.irq_line
    }

    pub(crate) fn take_audio_deltas(&mut self, out: &mut Vec<AudioDelta>) {
        self.data.audio_deltas.drain_sorted(out);
    }

    pub(crate) fn read_ppu_address(&mut self, address: u16, vram: &[u8; 2048]) -> u8 {
        match address {
            0x0000..=0x1FFF => {
                let bank = self.data.chr_banks[(address >> 10) as usize];
                self.cartridge.get_chr(BankSizeKb::One.to_absolute_address(bank, address))
            }
            _ => basic_ppu_read(address, 0, self.data.nametable_mirroring, &self.cartridge, vram),
        }
    }

    pub(crate) fn write_ppu_address(&mut self, address: u16, value: u8, vram: &mut [u8; 2048]) {
        match address {
            0x0000..=0x1FFF => {
                let bank = self.data.chr_banks[(address >> 10) as usize];
                let chr_addr = BankSizeKb::One.to_absolute_address(bank, address);
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

    fn new_fme7() -> MapperImpl<Fme7> {
        let mut prg_rom = vec![0; 32 * 8 * 1024];
        for bank in 0..32 {
            prg_rom[bank * 8 * 1024] = bank as u8;
        }

        MapperImpl {
            cartridge: Cartridge {
                prg_rom: Rom(prg_rom),
                chr_rom: Rom(vec![0; 256 * 1024]),
                prg_ram: vec![0; 8 * 1024],
                chr_ram: vec![],
                has_battery: true,
                prg_ram_dirty: false,
            },
            data: Fme7::new(),
        }
    }

    #[test]
    fn command_parameter_banking() {
        let mut mapper = new_fme7();

        mapper.write_cpu_address(0x8000, 0x09);
        mapper.write_cpu_address(0xA000, 5);
        assert_eq!(mapper.read_cpu_address(0x8000), Some(5));

        // $E000 region is fixed to the last bank
        assert_eq!(mapper.read_cpu_address(0xE000), Some(31));
    }

    #[test]
    fn irq_counter_fires_on_underflow() {
        let mut mapper = new_fme7();

        mapper.write_cpu_address(0x8000, 0x0E);
        mapper.write_cpu_address(0xA000, 3); // counter low
        mapper.write_cpu_address(0x8000, 0x0F);
        mapper.write_cpu_address(0xA000, 0); // counter high
        mapper.write_cpu_address(0x8000, 0x0D);
        mapper.write_cpu_address(0xA000, 0x81); // enable counter + IRQ

        for cycle in 0..4 {
            assert!(!mapper.irq(), "IRQ fired early at cycle {cycle}");
            mapper.clock_cpu(cycle);
        }
        // Counter underflowed 3 -> 2 -> 1 -> 0 -> wrap
        assert!(mapper.irq());

        // Control write acknowledges
        mapper.write_cpu_address(0x8000, 0x0D);
        mapper.write_cpu_address(0xA000, 0x81);
        assert!(!mapper.irq());
    }

    #[test]
    fn expansion_audio_emits_deltas() {
        let mut mapper = new_fme7();

        // Channel A: period 1, volume 15, enabled
        mapper.write_cpu_address(0xC000, 0x00);
        mapper.write_cpu_address(0xE000, 1);
        mapper.write_cpu_address(0xC000, 0x08);
        mapper.write_cpu_address(0xE000, 0x0F);
        mapper.write_cpu_address(0xC000, 0x07);
        mapper.write_cpu_address(0xE000, 0xF8); // enable tone A (active low)

        for cycle in 0..200 {
            mapper.clock_cpu(cycle);
        }

        let mut deltas = Vec::new();
        mapper.take_audio_deltas(&mut deltas);
        assert!(!deltas.is_empty());
        // Deltas are cycle-ordered
        assert!(deltas.windows(2).all(|pair| pair[0].cycle < pair[1].cycle));
    }
}

use crate::cartridge::CpuPage;

impl MapperImpl<Fme7> {
    pub(crate) fn cpu_page(&self, page_base: u16) -> CpuPage {
        match page_base {
            0x6000..=0x7FFF => {
                if self.data.prg_ram_selected {
                    if self.data.prg_ram_enabled && !self.cartridge.prg_ram.is_empty() {
                        CpuPage::PrgRam(u32::from(page_base & 0x1FFF))
                    } else {
                        CpuPage::Unmapped
                    }
                } else {
                    CpuPage::PrgRom(
                        BankSizeKb::Eight.to_absolute_address(self.data.prg_banks[0], page_base),
                    )
                }
            }
            0x8000..=0xFFFF => CpuPage::PrgRom(self.prg_rom_address(page_base)),
            _ => CpuPage::Unmapped,
        }
    }
}

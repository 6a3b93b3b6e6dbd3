//! Work RAM and HRAM, including CGB WRAM banking via SVBK.

use bincode::{Decode, Encode};
use nexen_common::boxedarray::BoxedByteArray;

// 8 banks of 4KB on CGB; DMG only ever sees banks 0 and 1
const WRAM_LEN: usize = 32 * 1024;
const HRAM_LEN: usize = 127;

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Memory {
    wram: BoxedByteArray<WRAM_LEN>,
    hram: [u8; HRAM_LEN],
    svbk: u8,
    cgb_banking: bool,
}

impl Memory {
    pub(crate) fn new(cgb_banking: bool) -> Self {
        Self { wram: BoxedByteArray::new(), hram: [0; HRAM_LEN], svbk: 1, cgb_banking }
    }

    fn high_bank(&self) -> usize {
        if !self.cgb_banking {
            return 1;
        }
        // Bank 0 selects bank 1
        (self.svbk & 0x07).max(1) as usize
    }

    pub(crate) fn read_wram(&self, address: u16) -> u8 {
        match address & 0x1FFF {
            offset @ 0x0000..=0x0FFF => self.wram[offset as usize],
            offset => self.wram[self.high_bank() * 0x1000 + (offset & 0x0FFF) as usize],
        }
    }

    pub(crate) fn write_wram(&mut self, address: u16, value: u8) {
        match address & 0x1FFF {
            offset @ 0x0000..=0x0FFF => self.wram[offset as usize] = value,
            offset => {
                let bank = self.high_bank();
                self.wram[bank * 0x1000 + (offset & 0x0FFF) as usize] = value;
            }
        }
    }

    pub(crate) fn read_hram(&self, address: u16) -> u8 {
        self.hram[(address & 0x7F) as usize % HRAM_LEN]
    }

    pub(crate) fn write_hram(&mut self, address: u16, value: u8) {
        self.hram[(address & 0x7F) as usize % HRAM_LEN] = value;
    }

    pub(crate) fn read_svbk(&self) -> u8 {
        self.svbk | 0xF8
    }

    pub(crate) fn write_svbk(&mut self, value: u8) {
        self.svbk = value & 0x07;
    }
}

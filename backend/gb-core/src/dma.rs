//! The OAM DMA engine and the CGB VRAM DMA (GDMA/HDMA) engine.

use bincode::{Decode, Encode};
use nexen_common::num::GetBit;

/// OAM DMA copies 160 bytes to OAM, one byte per M-cycle, while the CPU keeps running (games
/// park in HRAM for the duration).
#[derive(Debug, Clone, Default, Encode, Decode)]
pub(crate) struct OamDma {
    source_high: u8,
    bytes_copied: u8,
    active: bool,
}

impl OamDma {
    pub(crate) fn start(&mut self, source_high: u8) {
        self.source_high = source_high;
        self.bytes_copied = 0;
        self.active = true;
    }

    pub(crate) fn read_register(&self) -> u8 {
        self.source_high
    }

    /// Returns the (source, oam offset) to copy this M-cycle, if the DMA is active.
    pub(crate) fn next_transfer(&mut self) -> Option<(u16, u8)> {
        if !self.active {
            return None;
        }

        let offset = self.bytes_copied;
        let source = (u16::from(self.source_high) << 8) | u16::from(offset);
        self.bytes_copied += 1;
        if self.bytes_copied == 160 {
            self.active = false;
        }

        Some((source, offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum VramDmaMode {
    Idle,
    /// General-purpose: copies everything at once, halting the CPU
    General { blocks_remaining: u8 },
    /// HBlank: copies one 16-byte block at each hblank
    HBlank { blocks_remaining: u8, block_ready: bool },
}

/// CGB VRAM DMA via HDMA1-5.
#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct VramDma {
    source: u16,
    dest: u16,
    mode: VramDmaMode,
}

impl VramDma {
    pub(crate) fn new() -> Self {
        Self { source: 0, dest: 0, mode: VramDmaMode::Idle }
    }

    pub(crate) fn write_register(&mut self, address: u16, value: u8) {
        match address {
            0xFF51 => self.source = (self.source & 0x00FF) | (u16::from(value) << 8),
            0xFF52 => self.source = (self.source & 0xFF00) | u16::from(value & 0xF0),
            0xFF53 => {
                self.dest = (self.dest & 0x00FF) | (u16::from(value & 0x1F) << 8);
            }
            0xFF54 => self.dest = (self.dest & 0xFF00) | u16::from(value & 0xF0),
            0xFF55 => {
                let blocks = (value & 0x7F) + 1;
                if value.bit(7) {
                    self.mode = VramDmaMode::HBlank { blocks_remaining: blocks, block_ready: false };
                } else if let VramDmaMode::HBlank { .. } = self.mode {
                    // Writing with bit 7 clear during an HBlank DMA cancels it
                    self.mode = VramDmaMode::Idle;
                } else {
                    self.mode = VramDmaMode::General { blocks_remaining: blocks };
                }
            }
            _ => {}
        }
    }

    pub(crate) fn read_status(&self) -> u8 {
        match self.mode {
            VramDmaMode::Idle => 0xFF,
            VramDmaMode::General { blocks_remaining }
            | VramDmaMode::HBlank { blocks_remaining, .. } => blocks_remaining - 1,
        }
    }

    pub(crate) fn notify_hblank(&mut self) {
        if let VramDmaMode::HBlank { blocks_remaining, .. } = self.mode {
            self.mode = VramDmaMode::HBlank { blocks_remaining, block_ready: true };
        }
    }

    /// Whether the CPU is halted waiting on this DMA.
    pub(crate) fn cpu_halted(&self) -> bool {
        match self.mode {
            VramDmaMode::General { .. } => true,
            VramDmaMode::HBlank { block_ready, .. } => block_ready,
            VramDmaMode::Idle => false,
        }
    }

    /// The next (source, dest) byte pair to copy, if a transfer should progress this M-cycle.
    pub(crate) fn next_transfer(&mut self) -> Option<(u16, u16)> {
        let transfer = match self.mode {
            VramDmaMode::Idle => return None,
            VramDmaMode::General { .. } => true,
            VramDmaMode::HBlank { block_ready, .. } => block_ready,
        };
        if !transfer {
            return None;
        }

        let pair = (self.source, self.dest);
        self.source = self.source.wrapping_add(1);
        self.dest = self.dest.wrapping_add(1);

        // A block boundary every 16 bytes
        if self.source & 0x0F == 0 {
            self.mode = match self.mode {
                VramDmaMode::General { blocks_remaining: 1 }
                | VramDmaMode::HBlank { blocks_remaining: 1, .. } => VramDmaMode::Idle,
                VramDmaMode::General { blocks_remaining } => {
                    VramDmaMode::General { blocks_remaining: blocks_remaining - 1 }
                }
                VramDmaMode::HBlank { blocks_remaining, .. } => {
                    VramDmaMode::HBlank { blocks_remaining: blocks_remaining - 1, block_ready: false }
                }
                VramDmaMode::Idle => VramDmaMode::Idle,
            };
        }

        Some(pair)
    }
}

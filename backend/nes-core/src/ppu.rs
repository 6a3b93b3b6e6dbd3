//! PPU (2C02) emulation.
//!
//! The PPU is a state machine indexed by (scanline, dot): 341 dots per scanline, 262 (NTSC) or
//! 312 (PAL) scanlines per frame. Visible scanlines interleave background tile fetches with
//! pixel output and sprite evaluation; the pre-render scanline primes the shift registers and
//! copies the vertical scroll bits; the vblank scanlines are idle except for raising the vblank
//! flag (and NMI) on dot 1 of the first one.
//!
//! `run` catches the PPU up to a master-clock target, which is how the bus keeps register reads
//! accurate to the exact cycle of the access.

use crate::TimingModeExt;
use crate::cartridge::Mapper;
use bincode::{Decode, Encode};
use nexen_common::boxedarray::BoxedWordArray;
use nexen_common::frontend::TimingMode;
use nexen_common::num::GetBit;
use nexen_proc_macros::{FakeDecode, FakeEncode};
use std::ops::{Deref, DerefMut};

pub(crate) const SCREEN_WIDTH: u16 = 256;
pub(crate) const SCREEN_HEIGHT: u16 = 240;
pub(crate) const DOTS_PER_SCANLINE: u16 = 341;

pub(crate) const FRAME_BUFFER_LEN: usize = SCREEN_WIDTH as usize * SCREEN_HEIGHT as usize;

const FIRST_VBLANK_SCANLINE: u16 = 241;

// 64 sprite slots so that the unlimited-sprites mode can reuse the same pipeline; strict mode
// only ever fills 8
const SPRITE_SLOTS: usize = 64;

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct PpuRegisters {
    pub(crate) ppu_ctrl: u8,
    pub(crate) ppu_mask: u8,
    vblank_flag: bool,
    sprite_0_hit: bool,
    sprite_overflow: bool,
    pub(crate) oam_addr: u8,
    data_buffer: u8,
    open_bus: u8,
}

impl PpuRegisters {
    fn new() -> Self {
        Self {
            ppu_ctrl: 0,
            ppu_mask: 0,
            vblank_flag: false,
            sprite_0_hit: false,
            sprite_overflow: false,
            oam_addr: 0,
            data_buffer: 0,
            open_bus: 0,
        }
    }

    fn nmi_enabled(&self) -> bool {
        self.ppu_ctrl.bit(7)
    }

    fn double_height_sprites(&self) -> bool {
        self.ppu_ctrl.bit(5)
    }

    fn bg_pattern_table_address(&self) -> u16 {
        if self.ppu_ctrl.bit(4) { 0x1000 } else { 0x0000 }
    }

    fn sprite_pattern_table_address(&self) -> u16 {
        if self.ppu_ctrl.bit(3) { 0x1000 } else { 0x0000 }
    }

    fn vram_address_increment(&self) -> u16 {
        if self.ppu_ctrl.bit(2) { 32 } else { 1 }
    }

    fn emphasis_bits(&self, timing_mode: TimingMode) -> u8 {
        let mask = self.ppu_mask;
        match timing_mode {
            TimingMode::Ntsc => (mask >> 5) & 0x07,
            // PAL swaps the red and green emphasis bits
            TimingMode::Pal => {
                u8::from(mask.bit(6))
                    | (u8::from(mask.bit(5)) << 1)
                    | (u8::from(mask.bit(7)) << 2)
            }
        }
    }

    fn greyscale(&self) -> bool {
        self.ppu_mask.bit(0)
    }

    fn left_edge_bg_enabled(&self) -> bool {
        self.ppu_mask.bit(1)
    }

    fn left_edge_sprites_enabled(&self) -> bool {
        self.ppu_mask.bit(2)
    }

    fn bg_enabled(&self) -> bool {
        self.ppu_mask.bit(3)
    }

    fn sprites_enabled(&self) -> bool {
        self.ppu_mask.bit(4)
    }

    fn rendering_enabled(&self) -> bool {
        self.bg_enabled() || self.sprites_enabled()
    }
}

/// The v/t/x/w internal registers ("loopy registers").
#[derive(Debug, Clone, Encode, Decode)]
struct InternalRegisters {
    vram_address: u16,
    temp_vram_address: u16,
    fine_x_scroll: u8,
    second_write: bool,
}

impl InternalRegisters {
    fn new() -> Self {
        Self { vram_address: 0, temp_vram_address: 0, fine_x_scroll: 0, second_write: false }
    }

    fn fine_y(&self) -> u16 {
        self.vram_address >> 12
    }

    fn increment_coarse_x(&mut self) {
        if self.vram_address & 0x001F == 0x001F {
            // Coarse X wraps into the horizontal nametable bit
            self.vram_address = (self.vram_address & !0x001F) ^ 0x0400;
        } else {
            self.vram_address += 1;
        }
    }

    fn increment_y(&mut self) {
        if self.vram_address & 0x7000 != 0x7000 {
            self.vram_address += 0x1000;
            return;
        }

        self.vram_address &= !0x7000;
        let mut coarse_y = (self.vram_address & 0x03E0) >> 5;
        if coarse_y == 29 {
            coarse_y = 0;
            self.vram_address ^= 0x0800;
        } else if coarse_y == 31 {
            // Coarse Y past the attribute rows wraps without flipping the nametable
            coarse_y = 0;
        } else {
            coarse_y += 1;
        }
        self.vram_address = (self.vram_address & !0x03E0) | (coarse_y << 5);
    }

    fn copy_horizontal(&mut self) {
        self.vram_address =
            (self.vram_address & !0x041F) | (self.temp_vram_address & 0x041F);
    }

    fn copy_vertical(&mut self) {
        self.vram_address =
            (self.vram_address & !0x7BE0) | (self.temp_vram_address & 0x7BE0);
    }
}

#[derive(Debug, Clone, Encode, Decode)]
struct BgBuffers {
    pattern_low_shift: u16,
    pattern_high_shift: u16,
    palette_shift: u32,
    next_nametable_byte: u8,
    next_palette_bits: u8,
    next_pattern_low: u8,
    next_pattern_high: u8,
}

impl BgBuffers {
    fn new() -> Self {
        Self {
            pattern_low_shift: 0,
            pattern_high_shift: 0,
            palette_shift: 0,
            next_nametable_byte: 0,
            next_palette_bits: 0,
            next_pattern_low: 0,
            next_pattern_high: 0,
        }
    }

    fn shift(&mut self) {
        self.pattern_low_shift <<= 1;
        self.pattern_high_shift <<= 1;
        self.palette_shift <<= 2;
    }

    fn reload(&mut self) {
        self.pattern_low_shift |= u16::from(self.next_pattern_low);
        self.pattern_high_shift |= u16::from(self.next_pattern_high);
        let palette_bits = u32::from(self.next_palette_bits);
        self.palette_shift |= (palette_bits * 0x5555) & 0xFFFF;
    }

    fn pixel(&self, fine_x: u8) -> (u8, u8) {
        let color_low = u8::from(self.pattern_low_shift.bit(15 - fine_x));
        let color_high = u8::from(self.pattern_high_shift.bit(15 - fine_x));
        let palette =
            ((self.palette_shift >> (30 - 2 * u32::from(fine_x))) & 0x03) as u8;
        (color_low | (color_high << 1), palette)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum SpriteEvaluationState {
    Scanning { oam_index: u8 },
    Copying { oam_index: u8, byte_index: u8 },
    OverflowScan { oam_index: u8, byte_offset: u8 },
    Done,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct SpriteSlot {
    x: u8,
    attributes: u8,
    pattern_low: u8,
    pattern_high: u8,
    is_sprite_0: bool,
}

#[derive(Debug, Clone, Encode, Decode)]
struct SpriteState {
    secondary_oam: [u8; 4 * SPRITE_SLOTS],
    sprites_found: u8,
    sprite_0_found: bool,
    evaluation: SpriteEvaluationState,
    slots: [SpriteSlot; SPRITE_SLOTS],
    slots_in_use: u8,
    slot_sprite_0: bool,
}

impl SpriteState {
    fn new() -> Self {
        Self {
            secondary_oam: [0xFF; 4 * SPRITE_SLOTS],
            sprites_found: 0,
            sprite_0_found: false,
            evaluation: SpriteEvaluationState::Scanning { oam_index: 0 },
            slots: [SpriteSlot::default(); SPRITE_SLOTS],
            slots_in_use: 0,
            slot_sprite_0: false,
        }
    }

    fn reset_for_scanline(&mut self) {
        self.secondary_oam.fill(0xFF);
        self.sprites_found = 0;
        self.sprite_0_found = false;
        self.evaluation = SpriteEvaluationState::Scanning { oam_index: 0 };
    }
}

/// The frame buffer is rebuilt every frame, so it is excluded from serialized state and rewind
/// clones.
#[derive(Debug, Clone, FakeEncode, FakeDecode)]
struct FrameBuffer(BoxedWordArray<FRAME_BUFFER_LEN>);

impl Default for FrameBuffer {
    fn default() -> Self {
        Self(BoxedWordArray::new())
    }
}

impl Deref for FrameBuffer {
    type Target = [u16; FRAME_BUFFER_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Ppu {
    timing_mode: TimingMode,
    ppu_clock: u64,
    pub(crate) registers: PpuRegisters,
    internal: InternalRegisters,
    bg: BgBuffers,
    sprites: SpriteState,
    pub(crate) oam: [u8; 256],
    vram: [u8; 2048],
    palette_ram: [u8; 32],
    // Palette index in the low byte, color emphasis bits in the high byte
    frame_buffer: FrameBuffer,
    scanline: u16,
    dot: u16,
    odd_frame: bool,
    frame_complete: bool,
    remove_sprite_limit: bool,
    // Vblank-flag reads are sticky within the same tick so a read on the set dot suppresses NMI
    suppress_vblank: bool,
}

impl Ppu {
    pub(crate) fn new(timing_mode: TimingMode, remove_sprite_limit: bool) -> Self {
        Self {
            timing_mode,
            ppu_clock: 0,
            registers: PpuRegisters::new(),
            internal: InternalRegisters::new(),
            bg: BgBuffers::new(),
            sprites: SpriteState::new(),
            oam: [0; 256],
            vram: [0; 2048],
            palette_ram: INITIAL_PALETTE_RAM,
            frame_buffer: FrameBuffer::default(),
            scanline: timing_mode.total_scanlines() - 1,
            dot: 0,
            odd_frame: false,
            frame_complete: false,
            remove_sprite_limit,
            suppress_vblank: false,
        }
    }

    pub(crate) fn set_remove_sprite_limit(&mut self, remove: bool) {
        self.remove_sprite_limit = remove;
    }

    fn pre_render_scanline(&self) -> u16 {
        self.timing_mode.total_scanlines() - 1
    }

    pub(crate) fn frame_buffer(&self) -> &[u16; FRAME_BUFFER_LEN] {
        &self.frame_buffer
    }

    pub(crate) fn in_vblank(&self) -> bool {
        self.scanline >= FIRST_VBLANK_SCANLINE && self.scanline != self.pre_render_scanline()
    }

    pub(crate) fn get_and_clear_frame_complete(&mut self) -> bool {
        let complete = self.frame_complete;
        self.frame_complete = false;
        complete
    }

    pub(crate) fn nmi_line(&self) -> bool {
        self.registers.vblank_flag && self.registers.nmi_enabled()
    }

    /// Advance until the internal PPU clock catches up to the master clock target.
    pub(crate) fn run(&mut self, mapper: &mut Mapper, target_master_clock: u64) {
        let divider = self.timing_mode.ppu_divider();
        while self.ppu_clock + divider <= target_master_clock {
            self.ppu_clock += divider;
            self.tick_dot(mapper);
        }
    }

    fn tick_dot(&mut self, mapper: &mut Mapper) {
        let pre_render = self.pre_render_scanline();

        if self.scanline == pre_render && self.dot == 1 {
            self.registers.vblank_flag = false;
            self.registers.sprite_0_hit = false;
            self.registers.sprite_overflow = false;
        } else if self.scanline == FIRST_VBLANK_SCANLINE && self.dot == 1 {
            if !self.suppress_vblank {
                self.registers.vblank_flag = true;
            }
            self.suppress_vblank = false;
            self.frame_complete = true;
        }

        if self.scanline < SCREEN_HEIGHT || self.scanline == pre_render {
            self.tick_rendering_dot(mapper);
        }

        self.dot += 1;

        // On NTSC, odd frames skip the last dot of the pre-render scanline while rendering
        if self.timing_mode == TimingMode::Ntsc
            && self.scanline == pre_render
            && self.dot == DOTS_PER_SCANLINE - 1
            && self.odd_frame
            && self.registers.rendering_enabled()
        {
            self.dot = DOTS_PER_SCANLINE;
        }

        if self.dot == DOTS_PER_SCANLINE {
            self.dot = 0;
            self.scanline += 1;
            if self.scanline == self.timing_mode.total_scanlines() {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn tick_rendering_dot(&mut self, mapper: &mut Mapper) {
        let rendering_enabled = self.registers.rendering_enabled();
        let visible_scanline = self.scanline < SCREEN_HEIGHT;
        let dot = self.dot;

        if visible_scanline && (1..=256).contains(&dot) {
            self.output_pixel();
        }

        if !rendering_enabled {
            return;
        }

        // Background fetch pipeline
        if (1..=256).contains(&dot) || (321..=336).contains(&dot) {
            let fetch_phase = (dot - 1) & 7;
            match fetch_phase {
                1 => {
                    let address = 0x2000 | (self.internal.vram_address & 0x0FFF);
                    self.bg.next_nametable_byte = self.read_ppu_memory(mapper, address);
                }
                3 => {
                    let v = self.internal.vram_address;
                    let address =
                        0x23C0 | (v & 0x0C00) | ((v >> 4) & 0x38) | ((v >> 2) & 0x07);
                    let attribute_byte = self.read_ppu_memory(mapper, address);
                    let shift =
                        (u16::from(v.bit(6)) << 2) | (u16::from(v.bit(1)) << 1);
                    self.bg.next_palette_bits = (attribute_byte >> shift) & 0x03;
                }
                5 => {
                    let address = self.bg_pattern_address();
                    self.bg.next_pattern_low = self.read_ppu_memory(mapper, address);
                }
                7 => {
                    let address = self.bg_pattern_address() + 8;
                    self.bg.next_pattern_high = self.read_ppu_memory(mapper, address);
                    self.internal.increment_coarse_x();
                }
                _ => {}
            }

            self.bg.shift();
            if fetch_phase == 7 {
                self.bg.reload();
            }
        }

        if dot == 256 {
            self.internal.increment_y();
        } else if dot == 257 {
            self.internal.copy_horizontal();
        }

        if self.scanline == self.pre_render_scanline() && (280..=304).contains(&dot) {
            self.internal.copy_vertical();
        }

        // Sprite evaluation scans OAM for next-scanline sprites during the visible dots
        if visible_scanline {
            if dot == 64 {
                self.sprites.reset_for_scanline();
            } else if (65..=256).contains(&dot) && dot.bit(0) {
                // The state machine makes progress on every odd (read) dot
                self.step_sprite_evaluation();
            }
        }

        // Sprite pattern fetches for the next scanline occupy dots 257-320
        if (257..=320).contains(&dot) {
            self.registers.oam_addr = 0;
            if dot == 257 {
                if visible_scanline {
                    self.fetch_sprite_patterns(mapper);
                } else {
                    // No evaluation ran on the pre-render scanline; scanline 0 has no sprites
                    self.sprites.slots_in_use = 0;
                }
            }
        }
    }

    fn bg_pattern_address(&self) -> u16 {
        self.registers.bg_pattern_table_address()
            | (u16::from(self.bg.next_nametable_byte) << 4)
            | self.internal.fine_y()
    }

    fn output_pixel(&mut self) {
        let x = self.dot - 1;
        let rendering_enabled = self.registers.rendering_enabled();

        if !rendering_enabled {
            // With rendering disabled the backdrop color displays, unless v points into
            // palette RAM, in which case that entry displays (the "background palette hack")
            let v = self.internal.vram_address & 0x3FFF;
            let palette_addr = if v >= 0x3F00 { v & 0x001F } else { 0 };
            let color = self.read_palette(palette_addr as u8);
            self.write_frame_buffer(x, color);
            return;
        }

        let (bg_color, bg_palette) = if self.registers.bg_enabled()
            && (x >= 8 || self.registers.left_edge_bg_enabled())
        {
            self.bg.pixel(self.internal.fine_x_scroll)
        } else {
            (0, 0)
        };

        let sprite_pixel = self.sprite_pixel(x);

        let mut color_addr = if bg_color != 0 { (bg_palette << 2) | bg_color } else { 0 };

        if let Some((sprite_color, sprite_palette, behind_bg, is_sprite_0)) = sprite_pixel {
            let sprite_visible = self.registers.sprites_enabled()
                && (x >= 8 || self.registers.left_edge_sprites_enabled());

            if sprite_visible {
                if is_sprite_0 && bg_color != 0 && x != 255 {
                    self.registers.sprite_0_hit = true;
                }

                if bg_color == 0 || !behind_bg {
                    color_addr = 0x10 | (sprite_palette << 2) | sprite_color;
                }
            }
        }

        let color = self.read_palette(color_addr);
        self.write_frame_buffer(x, color);
    }

    fn write_frame_buffer(&mut self, x: u16, color: u8) {
        let emphasis = self.registers.emphasis_bits(self.timing_mode);
        let index = usize::from(self.scanline) * usize::from(SCREEN_WIDTH) + usize::from(x);
        self.frame_buffer[index] = u16::from(color) | (u16::from(emphasis) << 8);
    }

    fn read_palette(&self, address: u8) -> u8 {
        let mut address = address & 0x1F;
        // $3F10/$3F14/$3F18/$3F1C mirror the backdrop entries
        if address & 0x13 == 0x10 {
            address &= !0x10;
        }
        let color = self.palette_ram[address as usize];
        if self.registers.greyscale() { color & 0x30 } else { color & 0x3F }
    }

    fn write_palette(&mut self, address: u8, value: u8) {
        let mut address = address & 0x1F;
        if address & 0x13 == 0x10 {
            address &= !0x10;
        }
        self.palette_ram[address as usize] = value & 0x3F;
    }

    fn sprite_height(&self) -> u16 {
        if self.registers.double_height_sprites() { 16 } else { 8 }
    }

    /// One step of the OAM scan state machine. The hardware reads on odd dots and writes on
    /// even dots; stepping once per pair keeps the same per-scanline progression.
    fn step_sprite_evaluation(&mut self) {
        let sprite_height = self.sprite_height();
        let scanline = self.scanline;
        let max_sprites = if self.remove_sprite_limit { SPRITE_SLOTS as u8 } else { 8 };

        match self.sprites.evaluation {
            SpriteEvaluationState::Scanning { oam_index } => {
                let y = self.oam[usize::from(oam_index) * 4];
                let in_range = (u16::from(y)..u16::from(y) + sprite_height)
                    .contains(&scanline);

                if in_range {
                    let base = usize::from(self.sprites.sprites_found) * 4;
                    self.sprites.secondary_oam[base] = y;
                    if oam_index == 0 {
                        self.sprites.sprite_0_found = true;
                    }
                    self.sprites.evaluation =
                        SpriteEvaluationState::Copying { oam_index, byte_index: 1 };
                } else {
                    self.advance_scan(oam_index);
                }
            }
            SpriteEvaluationState::Copying { oam_index, byte_index } => {
                let base = usize::from(self.sprites.sprites_found) * 4;
                self.sprites.secondary_oam[base + usize::from(byte_index)] =
                    self.oam[usize::from(oam_index) * 4 + usize::from(byte_index)];

                if byte_index == 3 {
                    self.sprites.sprites_found += 1;
                    if self.sprites.sprites_found == max_sprites {
                        self.sprites.evaluation = SpriteEvaluationState::OverflowScan {
                            oam_index: oam_index.wrapping_add(1) & 0x3F,
                            byte_offset: 0,
                        };
                    } else {
                        self.advance_scan(oam_index);
                    }
                } else {
                    self.sprites.evaluation = SpriteEvaluationState::Copying {
                        oam_index,
                        byte_index: byte_index + 1,
                    };
                }
            }
            SpriteEvaluationState::OverflowScan { oam_index, byte_offset } => {
                if oam_index == 0 {
                    self.sprites.evaluation = SpriteEvaluationState::Done;
                    return;
                }

                // Hardware bug: the scan reads OAM[n][m] as if it were a Y coordinate, and on
                // a miss increments BOTH n and m, so the overflow flag is unreliable
                let address = usize::from(oam_index) * 4 + usize::from(byte_offset);
                let y = self.oam[address & 0xFF];
                let in_range =
                    (u16::from(y)..u16::from(y) + sprite_height).contains(&scanline);

                if in_range {
                    self.registers.sprite_overflow = true;
                    self.sprites.evaluation = SpriteEvaluationState::Done;
                } else {
                    self.sprites.evaluation = SpriteEvaluationState::OverflowScan {
                        oam_index: oam_index.wrapping_add(1) & 0x3F,
                        byte_offset: (byte_offset + 1) & 0x03,
                    };
                }
            }
            SpriteEvaluationState::Done => {}
        }
    }

    fn advance_scan(&mut self, oam_index: u8) {
        let next = oam_index.wrapping_add(1) & 0x3F;
        self.sprites.evaluation = if next == 0 {
            SpriteEvaluationState::Done
        } else {
            SpriteEvaluationState::Scanning { oam_index: next }
        };
    }

    /// Fetch pattern data for the sprites found by evaluation. On hardware this is spread over
    /// dots 257-320 (8 dots per sprite); the aggregate result at dot 320 is identical.
    fn fetch_sprite_patterns(&mut self, mapper: &mut Mapper) {
        let count = self.sprites.sprites_found;
        let sprite_height = self.sprite_height();
        // The NEXT scanline is the one these sprites render on
        let target_scanline =
            if self.scanline == self.pre_render_scanline() { 0 } else { self.scanline + 1 };

        self.sprites.slots_in_use = count;
        self.sprites.slot_sprite_0 = self.sprites.sprite_0_found;

        for slot_index in 0..usize::from(count) {
            let base = slot_index * 4;
            let y = self.sprites.secondary_oam[base];
            let tile_index = self.sprites.secondary_oam[base + 1];
            let attributes = self.sprites.secondary_oam[base + 2];
            let x = self.sprites.secondary_oam[base + 3];

            let vertical_flip = attributes.bit(7);
            let mut row = target_scanline.wrapping_sub(u16::from(y)) & (sprite_height - 1);
            if vertical_flip {
                row = sprite_height - 1 - row;
            }

            let pattern_address = if sprite_height == 16 {
                // 8x16 sprites take the pattern table from tile bit 0
                let table = if tile_index.bit(0) { 0x1000 } else { 0x0000 };
                let tile = u16::from(tile_index & 0xFE) + u16::from(row >= 8);
                table | (tile << 4) | (row & 0x07)
            } else {
                self.registers.sprite_pattern_table_address()
                    | (u16::from(tile_index) << 4)
                    | row
            };

            let mut pattern_low = self.read_ppu_memory(mapper, pattern_address);
            let mut pattern_high = self.read_ppu_memory(mapper, pattern_address + 8);

            if attributes.bit(6) {
                pattern_low = pattern_low.reverse_bits();
                pattern_high = pattern_high.reverse_bits();
            }

            self.sprites.slots[slot_index] = SpriteSlot {
                x,
                attributes,
                pattern_low,
                pattern_high,
                is_sprite_0: slot_index == 0 && self.sprites.sprite_0_found,
            };
        }
    }

    /// The first opaque sprite pixel at this x position, as (color, palette, behind_bg,
    /// is_sprite_0).
    fn sprite_pixel(&self, x: u16) -> Option<(u8, u8, bool, bool)> {
        for slot in self.sprites.slots[..usize::from(self.sprites.slots_in_use)].iter() {
            let sprite_x = u16::from(slot.x);
            if !(sprite_x..sprite_x + 8).contains(&x) {
                continue;
            }

            let pixel = (x - sprite_x) as u8;
            let color = u8::from(slot.pattern_low.bit(7 - pixel))
                | (u8::from(slot.pattern_high.bit(7 - pixel)) << 1);
            if color == 0 {
                continue;
            }

            return Some((
                color,
                slot.attributes & 0x03,
                slot.attributes.bit(5),
                slot.is_sprite_0,
            ));
        }

        None
    }

    // ===== Memory =====

    fn read_ppu_memory(&mut self, mapper: &mut Mapper, address: u16) -> u8 {
        let address = address & 0x3FFF;
        mapper.notify_ppu_address(address);
        if address >= 0x3F00 {
            return self.read_palette(address as u8);
        }
        mapper.read_ppu_address(address, &self.vram)
    }

    fn write_ppu_memory(&mut self, mapper: &mut Mapper, address: u16, value: u8) {
        let address = address & 0x3FFF;
        mapper.notify_ppu_address(address);
        if address >= 0x3F00 {
            self.write_palette(address as u8, value);
            return;
        }
        mapper.write_ppu_address(address, value, &mut self.vram);
    }

    // ===== CPU-visible registers =====

    pub(crate) fn read_register(&mut self, mapper: &mut Mapper, register: u16) -> u8 {
        let value = match register & 0x7 {
            // PPUSTATUS: reading clears the vblank flag and the write toggle
            2 => {
                let status = (u8::from(self.registers.vblank_flag) << 7)
                    | (u8::from(self.registers.sprite_0_hit) << 6)
                    | (u8::from(self.registers.sprite_overflow) << 5)
                    | (self.registers.open_bus & 0x1F);

                self.registers.vblank_flag = false;
                self.internal.second_write = false;

                // Reading the flag on the exact dot it would be set both returns clear and
                // suppresses the NMI for that frame
                if self.scanline == FIRST_VBLANK_SCANLINE && self.dot == 0 {
                    self.suppress_vblank = true;
                }

                status
            }
            4 => self.oam[self.registers.oam_addr as usize],
            // PPUDATA: buffered for VRAM, direct for palette RAM (with a nametable fill of
            // the buffer)
            7 => {
                let address = self.internal.vram_address & 0x3FFF;
                let result = if address >= 0x3F00 {
                    let palette_value = self.read_palette(address as u8);
                    self.registers.data_buffer =
                        mapper.read_ppu_address(address & 0x2FFF, &self.vram);
                    palette_value
                } else {
                    let buffered = self.registers.data_buffer;
                    self.registers.data_buffer = self.read_ppu_memory(mapper, address);
                    buffered
                };
                self.increment_vram_address();
                result
            }
            // Write-only registers read back the open bus value
            _ => self.registers.open_bus,
        };

        self.registers.open_bus = value;
        value
    }

    /// Side-effect-free register read for the debugger. PPUSTATUS does not clear flags and
    /// PPUDATA returns the buffer without advancing the address.
    pub(crate) fn peek_register(&self, register: u16) -> u8 {
        match register & 0x7 {
            2 => {
                (u8::from(self.registers.vblank_flag) << 7)
                    | (u8::from(self.registers.sprite_0_hit) << 6)
                    | (u8::from(self.registers.sprite_overflow) << 5)
                    | (self.registers.open_bus & 0x1F)
            }
            4 => self.oam[self.registers.oam_addr as usize],
            7 => self.registers.data_buffer,
            _ => self.registers.open_bus,
        }
    }

    pub(crate) fn write_register(&mut self, mapper: &mut Mapper, register: u16, value: u8) {
        self.registers.open_bus = value;

        match register & 0x7 {
            0 => {
                self.registers.ppu_ctrl = value;
                self.internal.temp_vram_address = (self.internal.temp_vram_address & !0x0C00)
                    | (u16::from(value & 0x03) << 10);
            }
            1 => {
                self.registers.ppu_mask = value;
            }
            3 => {
                self.registers.oam_addr = value;
            }
            4 => {
                // OAM writes during rendering glitch the address instead; games only write
                // during vblank
                if self.in_vblank() || !self.registers.rendering_enabled() {
                    self.oam[self.registers.oam_addr as usize] = value;
                    self.registers.oam_addr = self.registers.oam_addr.wrapping_add(1);
                }
            }
            5 => {
                if self.internal.second_write {
                    self.internal.temp_vram_address = (self.internal.temp_vram_address
                        & !0x73E0)
                        | (u16::from(value & 0xF8) << 2)
                        | (u16::from(value & 0x07) << 12);
                } else {
                    self.internal.temp_vram_address =
                        (self.internal.temp_vram_address & !0x001F) | u16::from(value >> 3);
                    self.internal.fine_x_scroll = value & 0x07;
                }
                self.internal.second_write = !self.internal.second_write;
            }
            6 => {
                if self.internal.second_write {
                    self.internal.temp_vram_address =
                        (self.internal.temp_vram_address & 0xFF00) | u16::from(value);
                    self.internal.vram_address = self.internal.temp_vram_address;
                    mapper.notify_ppu_address(self.internal.vram_address);
                } else {
                    self.internal.temp_vram_address = (self.internal.temp_vram_address
                        & 0x00FF)
                        | (u16::from(value & 0x3F) << 8);
                }
                self.internal.second_write = !self.internal.second_write;
            }
            7 => {
                let address = self.internal.vram_address & 0x3FFF;
                self.write_ppu_memory(mapper, address, value);
                self.increment_vram_address();
            }
            _ => {}
        }
    }

    fn increment_vram_address(&mut self) {
        let rendering = self.registers.rendering_enabled()
            && (self.scanline < SCREEN_HEIGHT || self.scanline == self.pre_render_scanline());

        if rendering {
            // Accessing PPUDATA mid-render performs a coarse X and Y increment glitch
            self.internal.increment_coarse_x();
            self.internal.increment_y();
        } else {
            self.internal.vram_address = self
                .internal
                .vram_address
                .wrapping_add(self.registers.vram_address_increment())
                & 0x7FFF;
        }
    }
}

// Power-on palette contents per the 2C02 reference captures
const INITIAL_PALETTE_RAM: [u8; 32] = [
    0x09, 0x01, 0x00, 0x01, 0x00, 0x02, 0x02, 0x0D, 0x08, 0x10, 0x08, 0x24, 0x00, 0x00, 0x04,
    0x2C, 0x09, 0x01, 0x34, 0x03, 0x00, 0x04, 0x00, 0x14, 0x08, 0x3A, 0x00, 0x02, 0x00, 0x20,
    0x2C, 0x08,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::mappers::{NametableMirroring, Nrom};
    use crate::cartridge::{Cartridge, Mapper, MapperImpl, Rom};

    fn new_mapper(mirroring: NametableMirroring) -> Mapper {
        Mapper::Nrom(MapperImpl {
            cartridge: Cartridge {
                prg_rom: Rom(vec![0; 32 * 1024]),
                chr_rom: Rom(vec![0; 8 * 1024]),
                prg_ram: vec![],
                chr_ram: vec![],
                has_battery: false,
                prg_ram_dirty: false,
            },
            data: Nrom::new(mirroring),
        })
    }

    fn new_ppu() -> (Ppu, Mapper) {
        (Ppu::new(TimingMode::Ntsc, false), new_mapper(NametableMirroring::Horizontal))
    }

    fn run_to(ppu: &mut Ppu, mapper: &mut Mapper, scanline: u16, dot: u16) {
        while !(ppu.scanline == scanline && ppu.dot == dot) {
            ppu.tick_dot(mapper);
        }
    }

    #[test]
    fn vblank_flag_set_and_cleared_at_documented_dots() {
        let (mut ppu, mut mapper) = new_ppu();

        run_to(&mut ppu, &mut mapper, FIRST_VBLANK_SCANLINE, 0);
        assert!(!ppu.registers.vblank_flag);

        ppu.tick_dot(&mut mapper); // dot 1
        ppu.tick_dot(&mut mapper);
        assert!(ppu.registers.vblank_flag);

        let pre_render_scanline = ppu.pre_render_scanline();
        run_to(&mut ppu, &mut mapper, pre_render_scanline, 0);
        assert!(ppu.registers.vblank_flag);
        ppu.tick_dot(&mut mapper);
        ppu.tick_dot(&mut mapper);
        assert!(!ppu.registers.vblank_flag);
    }

    #[test]
    fn status_read_clears_vblank_and_write_toggle() {
        let (mut ppu, mut mapper) = new_ppu();
        ppu.registers.vblank_flag = true;
        ppu.internal.second_write = true;

        let status = ppu.read_register(&mut mapper, 2);
        assert_ne!(status & 0x80, 0);
        assert!(!ppu.registers.vblank_flag);
        assert!(!ppu.internal.second_write);
    }

    #[test]
    fn nametable_mirroring_pairs() {
        let (mut ppu, mut mapper) = new_ppu();

        // Horizontal: $2000/$2400 share memory, $2800/$2C00 share memory
        ppu.write_ppu_memory(&mut mapper, 0x2005, 0xAB);
        assert_eq!(ppu.read_ppu_memory(&mut mapper, 0x2405), 0xAB);
        ppu.write_ppu_memory(&mut mapper, 0x2C05, 0xCD);
        assert_eq!(ppu.read_ppu_memory(&mut mapper, 0x2805), 0xCD);
        assert_ne!(ppu.read_ppu_memory(&mut mapper, 0x2005), 0xCD);

        // Vertical: $2000/$2800 share, $2400/$2C00 share
        let mut mapper = new_mapper(NametableMirroring::Vertical);
        let mut ppu = Ppu::new(TimingMode::Ntsc, false);
        ppu.write_ppu_memory(&mut mapper, 0x2005, 0xAB);
        assert_eq!(ppu.read_ppu_memory(&mut mapper, 0x2805), 0xAB);
        assert_ne!(ppu.read_ppu_memory(&mut mapper, 0x2405), 0xAB);
    }

    #[test]
    fn ppudata_reads_are_buffered() {
        let (mut ppu, mut mapper) = new_ppu();

        ppu.write_ppu_memory(&mut mapper, 0x2000, 0x55);
        ppu.write_ppu_memory(&mut mapper, 0x2001, 0x66);

        // Point v at $2000 via PPUADDR
        ppu.write_register(&mut mapper, 6, 0x20);
        ppu.write_register(&mut mapper, 6, 0x00);

        // First read returns the stale buffer; subsequent reads lag by one
        let _ = ppu.read_register(&mut mapper, 7);
        assert_eq!(ppu.read_register(&mut mapper, 7), 0x55);
        assert_eq!(ppu.read_register(&mut mapper, 7), 0x66);
    }

    #[test]
    fn ppudata_palette_reads_are_direct() {
        let (mut ppu, mut mapper) = new_ppu();

        ppu.write_register(&mut mapper, 6, 0x3F);
        ppu.write_register(&mut mapper, 6, 0x00);
        ppu.write_register(&mut mapper, 7, 0x2A);

        ppu.write_register(&mut mapper, 6, 0x3F);
        ppu.write_register(&mut mapper, 6, 0x00);
        assert_eq!(ppu.read_register(&mut mapper, 7), 0x2A);
    }

    #[test]
    fn peek_has_no_side_effects() {
        let (mut ppu, _mapper) = new_ppu();
        ppu.registers.vblank_flag = true;

        let peeked = ppu.peek_register(2);
        assert_ne!(peeked & 0x80, 0);
        assert!(ppu.registers.vblank_flag);
    }

    #[test]
    fn scroll_writes_update_temp_address() {
        let (mut ppu, mut mapper) = new_ppu();

        ppu.write_register(&mut mapper, 5, 0x7D); // X = 15 coarse, 5 fine
        assert_eq!(ppu.internal.temp_vram_address & 0x1F, 0x0F);
        assert_eq!(ppu.internal.fine_x_scroll, 5);

        ppu.write_register(&mut mapper, 5, 0x5E); // Y = 11 coarse, 6 fine
        assert_eq!((ppu.internal.temp_vram_address >> 5) & 0x1F, 11);
        assert_eq!(ppu.internal.temp_vram_address >> 12, 6);
    }

    #[test]
    fn sprite_evaluation_respects_8_sprite_limit() {
        let (mut ppu, mut mapper) = new_ppu();

        // 10 sprites all on scanline 50
        for sprite in 0..10 {
            ppu.oam[sprite * 4] = 50;
            ppu.oam[sprite * 4 + 1] = 0;
            ppu.oam[sprite * 4 + 2] = 0;
            ppu.oam[sprite * 4 + 3] = (sprite * 8) as u8;
        }
        ppu.registers.ppu_mask = 0x18; // rendering on

        run_to(&mut ppu, &mut mapper, 50, 0);
        run_to(&mut ppu, &mut mapper, 50, 257);

        assert_eq!(ppu.sprites.sprites_found, 8);
        assert!(ppu.registers.sprite_overflow);
    }

    #[test]
    fn frame_complete_signaled_once_per_frame() {
        let (mut ppu, mut mapper) = new_ppu();

        let mut count = 0;
        for _ in 0..(u32::from(DOTS_PER_SCANLINE) * 262 + 10) {
            ppu.tick_dot(&mut mapper);
            if ppu.get_and_clear_frame_complete() {
                count += 1;
            }
        }
        assert_eq!(count, 1);
    }
}

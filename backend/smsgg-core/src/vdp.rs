//! The SMS/GG VDP: a Mode 4 scanline renderer over 342-dot lines.
//!
//! NTSC timing is 262 lines per frame with 192 visible. The line interrupt counter reloads
//! during the off-screen lines and counts down once per active line; the frame interrupt flag
//! is raised just after the last visible line. Sprite collision and overflow flags follow the
//! hardware's status register semantics.

use crate::SmsGgHardware;
use bincode::{Decode, Encode};
use nexen_common::boxedarray::BoxedWordArray;
use nexen_common::num::GetBit;
use nexen_proc_macros::{FakeDecode, FakeEncode};
use std::ops::{Deref, DerefMut};

pub(crate) const SCREEN_WIDTH: usize = 256;
pub(crate) const SCREEN_HEIGHT: usize = 192;
pub(crate) const FRAME_BUFFER_LEN: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

pub(crate) const GG_SCREEN_WIDTH: usize = 160;
pub(crate) const GG_SCREEN_HEIGHT: usize = 144;
const GG_CROP_LEFT: usize = (SCREEN_WIDTH - GG_SCREEN_WIDTH) / 2;
const GG_CROP_TOP: usize = (SCREEN_HEIGHT - GG_SCREEN_HEIGHT) / 2;

const DOTS_PER_LINE: u16 = 342;
const LINES_PER_FRAME: u16 = 262;
const FIRST_VBLANK_LINE: u16 = SCREEN_HEIGHT as u16;

const VRAM_LEN: usize = 16 * 1024;
// SMS: 32 entries of 6-bit color; GG: 32 entries of 12-bit color (64 bytes)
const CRAM_LEN: usize = 64;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum ControlWriteState {
    First,
    Second { low_byte: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum DataPortTarget {
    Vram,
    Cram,
}

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct Vdp {
    hardware: SmsGgHardware,
    vram: Box<[u8]>,
    cram: [u8; CRAM_LEN],
    registers: [u8; 16],
    // Frame buffer of 12-bit BGR values (SMS 6-bit colors are expanded on write)
    frame_buffer: FrameBuffer,
    control_state: ControlWriteState,
    data_target: DataPortTarget,
    address: u16,
    read_buffer: u8,
    scanline: u16,
    dot: u16,
    frame_interrupt_flag: bool,
    line_interrupt_flag: bool,
    sprite_overflow_flag: bool,
    sprite_collision_flag: bool,
    line_counter: u8,
    latched_h_counter: u8,
    frame_complete: bool,
}

impl Vdp {
    pub(crate) fn new(hardware: SmsGgHardware) -> Self {
        Self {
            hardware,
            vram: vec![0; VRAM_LEN].into_boxed_slice(),
            cram: [0; CRAM_LEN],
            registers: [0; 16],
            frame_buffer: FrameBuffer::default(),
            control_state: ControlWriteState::First,
            data_target: DataPortTarget::Vram,
            address: 0,
            read_buffer: 0,
            scanline: 0,
            dot: 0,
            frame_interrupt_flag: false,
            line_interrupt_flag: false,
            sprite_overflow_flag: false,
            sprite_collision_flag: false,
            line_counter: 0xFF,
            latched_h_counter: 0,
            frame_complete: false,
        }
    }

    pub(crate) fn frame_buffer(&self) -> &[u16; FRAME_BUFFER_LEN] {
        &self.frame_buffer
    }

    pub(crate) fn get_and_clear_frame_complete(&mut self) -> bool {
        let complete = self.frame_complete;
        self.frame_complete = false;
        complete
    }

    fn display_enabled(&self) -> bool {
        self.registers[1].bit(6)
    }

    fn frame_interrupt_enabled(&self) -> bool {
        self.registers[1].bit(5)
    }

    fn line_interrupt_enabled(&self) -> bool {
        self.registers[0].bit(4)
    }

    fn sprites_8x16(&self) -> bool {
        self.registers[1].bit(1)
    }

    fn left_column_blanked(&self) -> bool {
        self.registers[0].bit(5)
    }

    pub(crate) fn interrupt_line(&self) -> bool {
        (self.frame_interrupt_flag && self.frame_interrupt_enabled())
            || (self.line_interrupt_flag && self.line_interrupt_enabled())
    }

    /// Advance the VDP by the given number of pixel-clock dots.
    pub(crate) fn tick_dots(&mut self, dots: u32) {
        for _ in 0..dots {
            self.tick_dot();
        }
    }

    fn tick_dot(&mut self) {
        self.dot += 1;
        if self.dot < DOTS_PER_LINE {
            return;
        }
        self.dot = 0;

        // End-of-line bookkeeping for the line we just finished
        if self.scanline < FIRST_VBLANK_LINE {
            if self.line_counter == 0 {
                self.line_counter = self.registers[10];
                self.line_interrupt_flag = true;
            } else {
                self.line_counter -= 1;
            }
        } else {
            self.line_counter = self.registers[10];
        }

        self.scanline += 1;
        if self.scanline == LINES_PER_FRAME {
            self.scanline = 0;
        }

        if self.scanline < FIRST_VBLANK_LINE {
            self.render_scanline();
        } else if self.scanline == FIRST_VBLANK_LINE {
            self.frame_interrupt_flag = true;
            self.frame_complete = true;
        }
    }

    pub(crate) fn latch_h_counter(&mut self) {
        self.latched_h_counter = (self.dot / 2) as u8;
    }

    pub(crate) fn read_v_counter(&self) -> u8 {
        // NTSC V counter jumps from $DA to $D5
        if self.scanline <= 0xDA { self.scanline as u8 } else { (self.scanline - 6) as u8 }
    }

    pub(crate) fn read_h_counter(&self) -> u8 {
        self.latched_h_counter
    }

    // ===== Port interface =====

    pub(crate) fn write_control(&mut self, value: u8) {
        match self.control_state {
            ControlWriteState::First => {
                self.address = (self.address & 0x3F00) | u16::from(value);
                self.control_state = ControlWriteState::Second { low_byte: value };
            }
            ControlWriteState::Second { low_byte } => {
                self.address = (u16::from(value & 0x3F) << 8) | u16::from(low_byte);
                self.control_state = ControlWriteState::First;

                match value >> 6 {
                    // Code 0: read setup with a prefetch
                    0 => {
                        self.read_buffer = self.vram[(self.address & 0x3FFF) as usize];
                        self.address = self.address.wrapping_add(1) & 0x3FFF;
                        self.data_target = DataPortTarget::Vram;
                    }
                    1 => self.data_target = DataPortTarget::Vram,
                    2 => {
                        let register = (value & 0x0F) as usize;
                        self.registers[register] = low_byte;
                        self.data_target = DataPortTarget::Vram;
                    }
                    _ => self.data_target = DataPortTarget::Cram,
                }
            }
        }
    }

    pub(crate) fn read_data(&mut self) -> u8 {
        self.control_state = ControlWriteState::First;
        let value = self.read_buffer;
        self.read_buffer = self.vram[(self.address & 0x3FFF) as usize];
        self.address = self.address.wrapping_add(1) & 0x3FFF;
        value
    }

    pub(crate) fn write_data(&mut self, value: u8) {
        self.control_state = ControlWriteState::First;
        self.read_buffer = value;

        match self.data_target {
            DataPortTarget::Vram => {
                self.vram[(self.address & 0x3FFF) as usize] = value;
            }
            DataPortTarget::Cram => {
                let mask = if self.hardware == SmsGgHardware::GameGear {
                    CRAM_LEN - 1
                } else {
                    31
                };
                self.cram[(self.address as usize) & mask] = value;
            }
        }
        self.address = self.address.wrapping_add(1) & 0x3FFF;
    }

    pub(crate) fn read_status(&mut self) -> u8 {
        let status = (u8::from(self.frame_interrupt_flag) << 7)
            | (u8::from(self.sprite_overflow_flag) << 6)
            | (u8::from(self.sprite_collision_flag) << 5);

        self.frame_interrupt_flag = false;
        self.line_interrupt_flag = false;
        self.sprite_overflow_flag = false;
        self.sprite_collision_flag = false;
        self.control_state = ControlWriteState::First;

        status
    }

    pub(crate) fn peek_status(&self) -> u8 {
        (u8::from(self.frame_interrupt_flag) << 7)
            | (u8::from(self.sprite_overflow_flag) << 6)
            | (u8::from(self.sprite_collision_flag) << 5)
    }

    // ===== Rendering =====

    fn color_at(&self, palette: usize, color_id: usize) -> u16 {
        if self.hardware == SmsGgHardware::GameGear {
            let base = palette * 32 + color_id * 2;
            u16::from_le_bytes([self.cram[base], self.cram[base + 1]]) & 0x0FFF
        } else {
            // Expand 6-bit SMS color (2 bits per channel) to 12-bit
            let color = self.cram[palette * 16 + color_id];
            let expand = |channel: u8| -> u16 {
                let channel = u16::from(channel & 0x03);
                channel | (channel << 2)
            };
            expand(color) | (expand(color >> 2) << 4) | (expand(color >> 4) << 8)
        }
    }

    fn name_table_base(&self) -> usize {
        (usize::from(self.registers[2] & 0x0E)) << 10
    }

    fn sprite_attribute_base(&self) -> usize {
        (usize::from(self.registers[5] & 0x7E)) << 7
    }

    fn sprite_pattern_base(&self) -> usize {
        if self.registers[6].bit(2) { 0x2000 } else { 0x0000 }
    }

    fn render_scanline(&mut self) {
        let line = self.scanline;
        let row_base = usize::from(line) * SCREEN_WIDTH;

        if !self.display_enabled() {
            let backdrop = self.color_at(1, usize::from(self.registers[7] & 0x0F));
            for x in 0..SCREEN_WIDTH {
                self.frame_buffer[row_base + x] = backdrop;
            }
            return;
        }

        let mut bg_priority = [false; SCREEN_WIDTH];
        let mut bg_opaque = [false; SCREEN_WIDTH];
        self.render_background(line, row_base, &mut bg_priority, &mut bg_opaque);
        self.render_sprites(line, row_base, &bg_priority);

        if self.left_column_blanked() {
            let backdrop = self.color_at(1, usize::from(self.registers[7] & 0x0F));
            for x in 0..8 {
                self.frame_buffer[row_base + x] = backdrop;
            }
        }
    }

    fn render_background(
        &mut self,
        line: u16,
        row_base: usize,
        priority: &mut [bool; SCREEN_WIDTH],
        opaque: &mut [bool; SCREEN_WIDTH],
    ) {
        let fine_y_scroll = self.registers[9];
        // Horizontal scroll can be locked for the top 2 tile rows (HUD support)
        let h_scroll_locked = self.registers[0].bit(6) && line < 16;
        let x_scroll = if h_scroll_locked { 0 } else { self.registers[8] };
        let v_scroll_locked = self.registers[0].bit(7);

        for x in 0..SCREEN_WIDTH {
            let scrolled_x = (x as u8).wrapping_sub(x_scroll);

            let scrolled_y = if v_scroll_locked && x >= 192 {
                line
            } else {
                (line + u16::from(fine_y_scroll)) % 224
            };

            let tile_x = usize::from(scrolled_x / 8);
            let tile_y = usize::from(scrolled_y / 8);

            let entry_address = self.name_table_base() + (tile_y * 32 + tile_x) * 2;
            let entry =
                u16::from_le_bytes([self.vram[entry_address], self.vram[entry_address + 1]]);

            let tile_index = usize::from(entry & 0x01FF);
            let h_flip = entry.bit(9);
            let v_flip = entry.bit(10);
            let palette = usize::from(entry.bit(11));
            let has_priority = entry.bit(12);

            let mut fine_y = scrolled_y % 8;
            if v_flip {
                fine_y = 7 - fine_y;
            }
            let mut fine_x = u16::from(scrolled_x % 8);
            if !h_flip {
                fine_x = 7 - fine_x;
            }

            // Mode 4 tiles are 4 bitplanes interleaved per row
            let tile_row_address = tile_index * 32 + usize::from(fine_y) * 4;
            let color_id = (0..4).fold(0_usize, |acc, plane| {
                acc | (usize::from(self.vram[tile_row_address + plane].bit(fine_x as u8))
                    << plane)
            });

            opaque[x] = color_id != 0;
            priority[x] = has_priority && color_id != 0;
            self.frame_buffer[row_base + x] = self.color_at(palette, color_id);
        }
    }

    fn render_sprites(&mut self, line: u16, row_base: usize, bg_priority: &[bool; SCREEN_WIDTH]) {
        let sprite_height: u16 = if self.sprites_8x16() { 16 } else { 8 };
        let attribute_base = self.sprite_attribute_base();

        // Scan the 64-entry attribute table for sprites on this line
        let mut line_sprites: [u8; 8] = [0; 8];
        let mut count = 0_usize;
        for sprite in 0..64_usize {
            let y = self.vram[attribute_base + sprite];
            // Y = $D0 terminates the list in 192-line modes
            if y == 0xD0 {
                break;
            }
            let top = u16::from(y.wrapping_add(1));
            if (top..top + sprite_height).contains(&line) {
                if count == 8 {
                    self.sprite_overflow_flag = true;
                    break;
                }
                line_sprites[count] = sprite as u8;
                count += 1;
            }
        }

        let mut written = [false; SCREEN_WIDTH];
        for &sprite in &line_sprites[..count] {
            let sprite = usize::from(sprite);
            let y = self.vram[attribute_base + sprite];
            let x = self.vram[attribute_base + 0x80 + sprite * 2];
            let tile = self.vram[attribute_base + 0x80 + sprite * 2 + 1];

            let row = line - u16::from(y.wrapping_add(1));
            let tile = if sprite_height == 16 {
                (usize::from(tile) & !1) + usize::from(row >= 8)
            } else {
                usize::from(tile)
            };

            // Early-clock shifts all sprites 8 pixels left
            let base_x = if self.registers[0].bit(3) {
                i16::from(x) - 8
            } else {
                i16::from(x)
            };

            let tile_row_address = self.sprite_pattern_base() + tile * 32 + usize::from(row & 7) * 4;

            for pixel in 0..8_i16 {
                let screen_x = base_x + pixel;
                if !(0..SCREEN_WIDTH as i16).contains(&screen_x) {
                    continue;
                }
                let screen_x = screen_x as usize;

                let bit = (7 - pixel) as u8;
                let color_id = (0..4).fold(0_usize, |acc, plane| {
                    acc | (usize::from(self.vram[tile_row_address + plane].bit(bit)) << plane)
                });
                if color_id == 0 {
                    continue;
                }

                if written[screen_x] {
                    self.sprite_collision_flag = true;
                    continue;
                }
                written[screen_x] = true;

                if !bg_priority[screen_x] {
                    // Sprites always use the second palette
                    self.frame_buffer[row_base + screen_x] = self.color_at(1, color_id);
                }
            }
        }
    }
}

/// The Game Gear viewport: the centered 160x144 window of the 256x192 output.
pub(crate) fn gg_crop_offset(x: usize, y: usize) -> usize {
    (y + GG_CROP_TOP) * SCREEN_WIDTH + x + GG_CROP_LEFT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_lines(vdp: &mut Vdp, lines: u32) {
        vdp.tick_dots(lines * u32::from(DOTS_PER_LINE));
    }

    #[test]
    fn frame_interrupt_at_vblank_start() {
        let mut vdp = Vdp::new(SmsGgHardware::MasterSystem);
        vdp.registers[1] = 0x60; // display + frame interrupts on

        run_lines(&mut vdp, 193);
        assert!(vdp.frame_interrupt_flag);
        assert!(vdp.interrupt_line());
        assert!(vdp.get_and_clear_frame_complete());

        // Status read clears the flag and the IRQ
        let status = vdp.read_status();
        assert_ne!(status & 0x80, 0);
        assert!(!vdp.interrupt_line());
    }

    #[test]
    fn line_interrupt_counter() {
        let mut vdp = Vdp::new(SmsGgHardware::MasterSystem);
        vdp.registers[0] = 0x10; // line interrupts enabled
        vdp.registers[10] = 9; // fire every 10 lines

        run_lines(&mut vdp, 11);
        assert!(vdp.line_interrupt_flag);
    }

    #[test]
    fn control_port_register_write() {
        let mut vdp = Vdp::new(SmsGgHardware::MasterSystem);
        vdp.write_control(0x55);
        vdp.write_control(0x87); // write $55 to register 7
        assert_eq!(vdp.registers[7], 0x55);
    }

    #[test]
    fn data_port_buffered_vram_reads() {
        let mut vdp = Vdp::new(SmsGgHardware::MasterSystem);

        // Write $AB to VRAM $0000
        vdp.write_control(0x00);
        vdp.write_control(0x40); // code 1: VRAM write at $0000
        vdp.write_data(0xAB);

        // Read setup prefetches, so the first data read returns VRAM $0000
        vdp.write_control(0x00);
        vdp.write_control(0x00);
        assert_eq!(vdp.read_data(), 0xAB);
    }

    #[test]
    fn sms_color_expansion() {
        let mut vdp = Vdp::new(SmsGgHardware::MasterSystem);
        // CRAM write: full red (bits 1-0)
        vdp.write_control(0x00);
        vdp.write_control(0xC0);
        vdp.write_data(0x03);

        assert_eq!(vdp.color_at(0, 0), 0x000F);
    }
}

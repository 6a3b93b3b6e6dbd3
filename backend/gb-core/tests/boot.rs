//! End-to-end: boot a minimal ROM and run frames through the public interface.

use gb_core::{GameBoyEmulator, GameBoyEmulatorConfig, GbInputs};
use nexen_common::frontend::{
    AudioOutput, Color, EmulatorTrait, FrameSize, Renderer, SaveWriter, TickEffect,
};
use std::convert::Infallible;

struct NullRenderer;

impl Renderer for NullRenderer {
    type Err = Infallible;

    fn render_frame(
        &mut self,
        frame_buffer: &[Color],
        frame_size: FrameSize,
    ) -> Result<(), Self::Err> {
        assert_eq!(frame_size, FrameSize { width: 160, height: 144 });
        assert!(frame_buffer.len() >= 160 * 144);
        Ok(())
    }
}

struct NullAudioOutput {
    samples: u64,
}

impl AudioOutput for NullAudioOutput {
    type Err = Infallible;

    fn push_sample(&mut self, _sample_l: f64, _sample_r: f64) -> Result<(), Self::Err> {
        self.samples += 1;
        Ok(())
    }
}

struct NullSaveWriter;

impl SaveWriter for NullSaveWriter {
    type Err = std::io::Error;

    fn load_bytes(&mut self, _extension: &str) -> Result<Vec<u8>, Self::Err> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no save"))
    }

    fn persist_bytes(&mut self, _extension: &str, _bytes: &[u8]) -> Result<(), Self::Err> {
        Ok(())
    }
}

/// A valid-header 32KB ROM whose code is all NOPs.
fn nop_rom() -> Vec<u8> {
    let mut rom = vec![0; 32 * 1024];
    rom[0x0134..0x013A].copy_from_slice(b"NOPROM");

    let mut checksum = 0_u8;
    for &byte in &rom[0x0134..0x014D] {
        checksum = checksum.wrapping_sub(byte).wrapping_sub(1);
    }
    rom[0x014D] = checksum;
    rom
}

#[test]
fn boots_and_runs_frames() {
    let mut emulator =
        GameBoyEmulator::create(nop_rom(), GameBoyEmulatorConfig::default(), &mut NullSaveWriter)
            .expect("ROM should load");

    let mut audio = NullAudioOutput { samples: 0 };
    let inputs = GbInputs::default();

    for _ in 0..3 {
        loop {
            let effect = emulator
                .tick(&mut NullRenderer, &mut audio, &inputs, &mut NullSaveWriter)
                .expect("tick should not fail");
            if effect == TickEffect::FrameRendered {
                break;
            }
        }
    }

    assert_eq!(emulator.frame_count(), 3);
    // ~800 stereo samples per frame at 48kHz
    assert!((1_500..=3_500).contains(&audio.samples), "samples {}", audio.samples);
}

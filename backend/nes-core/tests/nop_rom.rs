//! End-to-end console test: boot a synthetic all-NOP ROM and run a frame.

use nes_core::{NesEmulator, NesEmulatorConfig, NesInputs};
use nexen_common::frontend::{
    AudioOutput, Color, EmulatorTrait, FrameSize, Renderer, SaveWriter, TickEffect,
};
use std::convert::Infallible;

struct NullRenderer {
    frames_rendered: u32,
}

impl Renderer for NullRenderer {
    type Err = Infallible;

    fn render_frame(
        &mut self,
        _frame_buffer: &[Color],
        _frame_size: FrameSize,
    ) -> Result<(), Self::Err> {
        self.frames_rendered += 1;
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

/// 32KB NROM image: PRG filled with NOP ($EA), reset vector pointing at $8000.
fn nop_rom() -> Vec<u8> {
    let prg_len = 32 * 1024;
    let mut rom = vec![0; 16 + prg_len + 8 * 1024];
    rom[..4].copy_from_slice(b"NES\x1A");
    rom[4] = 2; // 2x 16KB PRG
    rom[5] = 1; // 1x 8KB CHR

    for byte in &mut rom[16..16 + prg_len] {
        *byte = 0xEA;
    }

    // Vectors live at the end of PRG ($FFFA-$FFFF)
    let vectors = 16 + prg_len - 6;
    rom[vectors + 2] = 0x00; // RESET -> $8000
    rom[vectors + 3] = 0x80;

    rom
}

fn run_one_frame(emulator: &mut NesEmulator) -> (NullRenderer, NullAudioOutput) {
    let mut renderer = NullRenderer { frames_rendered: 0 };
    let mut audio = NullAudioOutput { samples: 0 };
    let inputs = NesInputs::default();

    loop {
        let effect = emulator
            .tick(&mut renderer, &mut audio, &inputs, &mut NullSaveWriter)
            .expect("tick should not fail");
        if effect == TickEffect::FrameRendered {
            break;
        }
    }

    (renderer, audio)
}

#[test]
fn nop_rom_boots_and_renders_a_frame() {
    let mut emulator =
        NesEmulator::create(nop_rom(), NesEmulatorConfig::default(), &mut NullSaveWriter)
            .expect("NOP ROM should load");

    assert_eq!(emulator.cpu_pc(), 0x8000);

    let (renderer, _) = run_one_frame(&mut emulator);
    assert_eq!(emulator.frame_count(), 1);
    assert_eq!(renderer.frames_rendered, 1);

    // NOP is 2 cycles, so the PC advances by half the frame's CPU cycles. The first frame
    // starts on the pre-render scanline and ends at vblank start, ~27,500 CPU cycles later
    let pc = emulator.cpu_pc();
    assert!(pc > 0x8000, "PC did not advance: {pc:04X}");
    let executed = u32::from(pc - 0x8000);
    assert!(
        (13_000..15_000).contains(&executed),
        "unexpected instruction count for one frame: {executed}"
    );

    // Rendering is disabled at power-on, so every pixel is the backdrop palette entry
    let frame = emulator.raw_frame_buffer();
    let backdrop = frame[0] & 0x3F;
    assert!(frame.iter().all(|&word| word & 0x3F == backdrop));
}

#[test]
fn audio_samples_are_produced_each_frame() {
    let mut emulator =
        NesEmulator::create(nop_rom(), NesEmulatorConfig::default(), &mut NullSaveWriter)
            .expect("NOP ROM should load");

    let mut total_samples = 0;
    for _ in 0..5 {
        let (_, audio) = run_one_frame(&mut emulator);
        total_samples += audio.samples;
    }

    // ~800 samples per frame at 48kHz / 60fps
    assert!((3_500..=4_500).contains(&total_samples), "sample count {total_samples}");
}

#[test]
fn save_state_round_trip_is_deterministic() {
    let mut emulator =
        NesEmulator::create(nop_rom(), NesEmulatorConfig::default(), &mut NullSaveWriter)
            .expect("NOP ROM should load");

    for _ in 0..3 {
        run_one_frame(&mut emulator);
    }

    let mut records = nexen_common::savestate::StateRecords::new();
    emulator.write_state_records(&mut records);
    let bytes = records.to_bytes("test");

    // Run forward, then restore and re-run; the end states must match exactly
    for _ in 0..2 {
        run_one_frame(&mut emulator);
    }
    let pc_after = emulator.cpu_pc();
    let frame_after = emulator.frame_count();

    let parsed = nexen_common::savestate::StateRecords::from_bytes(&bytes, "test").unwrap();
    emulator.load_state_records(&parsed).expect("state should load");
    assert_eq!(emulator.frame_count(), 3);

    for _ in 0..2 {
        run_one_frame(&mut emulator);
    }
    assert_eq!(emulator.cpu_pc(), pc_after);
    assert_eq!(emulator.frame_count(), frame_after);
}

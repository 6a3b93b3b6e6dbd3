//! Driver-level integration tests built on the NES core (the cheapest console to spin up
//! in-memory).

use crate::rewind::RewindManager;
use nes_core::{NesEmulator, NesEmulatorConfig, NesInputs};
use nexen_common::frontend::{EmulatorTrait, SaveWriter};
use nexen_common::input::PortInputs;

struct NullSaveWriter;

impl SaveWriter for NullSaveWriter {
    type Err = std::io::Error;

    fn load_bytes(&mut self, _extension: &str) -> Result<Vec<u8>, Self::Err> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "none"))
    }

    fn persist_bytes(&mut self, _extension: &str, _bytes: &[u8]) -> Result<(), Self::Err> {
        Ok(())
    }
}

fn nop_rom() -> Vec<u8> {
    let prg_len = 32 * 1024;
    let mut rom = vec![0; 16 + prg_len + 8 * 1024];
    rom[..4].copy_from_slice(b"NES\x1A");
    rom[4] = 2;
    rom[5] = 1;
    for byte in &mut rom[16..16 + prg_len] {
        *byte = 0xEA;
    }
    let vectors = 16 + prg_len - 6;
    rom[vectors + 2] = 0x00;
    rom[vectors + 3] = 0x80;
    rom
}

fn new_emulator() -> NesEmulator {
    NesEmulator::create(nop_rom(), NesEmulatorConfig::default(), &mut NullSaveWriter)
        .expect("NOP ROM should load")
}

fn run_frames(emulator: &mut NesEmulator, rewind: &mut RewindManager<NesEmulator>, frames: u32) {
    struct NullRenderer;
    impl nexen_common::frontend::Renderer for NullRenderer {
        type Err = std::convert::Infallible;
        fn render_frame(
            &mut self,
            _: &[nexen_common::frontend::Color],
            _: nexen_common::frontend::FrameSize,
        ) -> Result<(), Self::Err> {
            Ok(())
        }
    }
    struct NullAudio;
    impl nexen_common::frontend::AudioOutput for NullAudio {
        type Err = std::convert::Infallible;
        fn push_sample(&mut self, _: f64, _: f64) -> Result<(), Self::Err> {
            Ok(())
        }
    }

    let inputs = NesInputs::default();
    for _ in 0..frames {
        emulator
            .run_frame(&mut NullRenderer, &mut NullAudio, &inputs, &mut NullSaveWriter)
            .expect("frame should run");
        rewind.record_frame(emulator, &inputs);
    }
}

#[test]
fn rewind_ring_replays_frames_in_reverse_order_under_ceiling() {
    let memory_ceiling = 16 * 1024 * 1024;
    let mut emulator = new_emulator();
    let mut rewind: RewindManager<NesEmulator> = RewindManager::new(memory_ceiling);

    run_frames(&mut emulator, &mut rewind, 120);
    let frame_count_before = emulator.frame_count();
    assert_eq!(frame_count_before, 120);
    assert!(rewind.total_bytes() <= memory_ceiling);
    assert_eq!(rewind.block_count(), 4);

    // Walk the entire history backwards. 120 frames is two full/delta pairs, so this
    // crosses every delta-reconstruction case; each step must restore an earlier point in
    // time and replay its window's frames
    let mut last_frame_count = frame_count_before;
    let mut blocks_rewound = 0;
    while let Some(frames) = rewind.rewind_block(&mut emulator) {
        assert!(!frames.is_empty());
        assert!(
            emulator.frame_count() < last_frame_count,
            "rewind did not move backwards: {} -> {}",
            last_frame_count,
            emulator.frame_count()
        );
        last_frame_count = emulator.frame_count();
        blocks_rewound += 1;
    }

    assert_eq!(blocks_rewound, 4);
    assert_eq!(rewind.block_count(), 0);
}

#[test]
fn rewind_determinism_round_trip() {
    // Save state S, run N frames, restore S, run N frames with the same inputs: identical end
    // states (the determinism guarantee that rewind playback depends on)
    let mut emulator = new_emulator();
    let mut rewind: RewindManager<NesEmulator> = RewindManager::new(usize::MAX);

    run_frames(&mut emulator, &mut rewind, 10);

    let mut records = nexen_common::savestate::StateRecords::new();
    emulator.write_state_records(&mut records);
    let snapshot = records.to_bytes("test");

    run_frames(&mut emulator, &mut rewind, 20);
    let pc_first_run = emulator.cpu_pc();

    let parsed = nexen_common::savestate::StateRecords::from_bytes(&snapshot, "test").unwrap();
    emulator.load_state_records(&parsed).unwrap();
    run_frames(&mut emulator, &mut rewind, 20);

    assert_eq!(emulator.cpu_pc(), pc_first_run);
    assert_eq!(emulator.frame_count(), 30);
}

#[test]
fn rewind_evicts_oldest_blocks_when_over_ceiling() {
    // Measure how much 240 frames of history costs, then rerun with half that as the
    // ceiling: eviction must hold the total under the ceiling with fewer blocks retained
    let mut emulator = new_emulator();
    let mut unlimited: RewindManager<NesEmulator> = RewindManager::new(usize::MAX);
    run_frames(&mut emulator, &mut unlimited, 240);
    let unlimited_bytes = unlimited.total_bytes();
    let unlimited_blocks = unlimited.block_count();

    let ceiling = unlimited_bytes / 2;
    let mut emulator = new_emulator();
    let mut capped: RewindManager<NesEmulator> = RewindManager::new(ceiling);
    run_frames(&mut emulator, &mut capped, 240);

    assert!(capped.total_bytes() <= ceiling);
    assert!(capped.block_count() < unlimited_blocks, "eviction should cap history");
    assert!(capped.rewind_block(&mut emulator).is_some());
}

#[test]
fn controller_inputs_are_logged_and_replayed() {
    let mut emulator = new_emulator();
    let mut rewind: RewindManager<NesEmulator> = RewindManager::new(usize::MAX);

    let mut inputs = NesInputs::default();
    inputs.set_port_bits(0, 0x0001);
    struct NullRenderer;
    impl nexen_common::frontend::Renderer for NullRenderer {
        type Err = std::convert::Infallible;
        fn render_frame(
            &mut self,
            _: &[nexen_common::frontend::Color],
            _: nexen_common::frontend::FrameSize,
        ) -> Result<(), Self::Err> {
            Ok(())
        }
    }
    struct NullAudio;
    impl nexen_common::frontend::AudioOutput for NullAudio {
        type Err = std::convert::Infallible;
        fn push_sample(&mut self, _: f64, _: f64) -> Result<(), Self::Err> {
            Ok(())
        }
    }

    for _ in 0..40 {
        emulator
            .run_frame(&mut NullRenderer, &mut NullAudio, &inputs, &mut NullSaveWriter)
            .unwrap();
        rewind.record_frame(&emulator, &inputs);
    }

    // The in-progress window (10 of 40 frames) replays first, then a full 30-frame block;
    // each captured frame corresponds to one logged frame
    let frames = rewind.rewind_block(&mut emulator).unwrap();
    assert_eq!(frames.len(), 10);
    let frames = rewind.rewind_block(&mut emulator).unwrap();
    assert_eq!(frames.len(), 30);
}

//! The save-state/rewind manager.
//!
//! While emulation runs forward, the manager appends a `RewindData` block for every ~30 frames:
//! full serialized console states alternate with XOR deltas against the previous full state
//! (deflate squeezes the mostly-zero delta well). Each block carries the per-port input log for
//! its window. A running byte total enforces the user's memory ceiling; eviction pops from the
//! head, always removing a full state together with the deltas that depend on it.
//!
//! Rewind playback pops the tail block, restores its state, and re-executes forward with the
//! recorded inputs while capturing frames, which the host then presents in reverse order.
//! Rewind audio goes through a reversed ring buffer filled by bulk copy.

use bincode::{Decode, Encode};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use nexen_common::frontend::{
    AudioOutput, Color, EmulatorTrait, FrameSize, PartialClone, Renderer, SaveWriter, TickEffect,
};
use nexen_common::input::PortInputs;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io::{Read, Write};

pub const DEFAULT_FRAMES_PER_BLOCK: u32 = 30;
pub const DEFAULT_MEMORY_CEILING: usize = 256 * 1024 * 1024;

macro_rules! bincode_config {
    () => {
        bincode::config::standard().with_little_endian().with_variable_int_encoding()
    };
}

#[derive(Debug, Clone, Encode, Decode)]
enum RewindState {
    /// Deflate-compressed full serialized console state
    Full(Vec<u8>),
    /// Deflate-compressed XOR against the previous full state
    Delta(Vec<u8>),
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct RewindData {
    state: RewindState,
    /// Per-frame, per-port input bits for the frames following this snapshot
    input_log: Vec<Vec<u16>>,
    /// Marks a discontinuity (e.g. the user loaded a save state); rewind stops here
    end_of_segment: bool,
}

impl RewindData {
    fn byte_len(&self) -> usize {
        let state_len = match &self.state {
            RewindState::Full(bytes) | RewindState::Delta(bytes) => bytes.len(),
        };
        state_len + self.input_log.iter().map(|frame| frame.len() * 2).sum::<usize>() + 64
    }
}

/// A frame captured during rewind re-execution.
pub struct CapturedFrame {
    pub pixels: Vec<Color>,
    pub size: FrameSize,
}

struct CapturingRenderer {
    frames: Vec<CapturedFrame>,
}

impl Renderer for CapturingRenderer {
    type Err = Infallible;

    fn render_frame(
        &mut self,
        frame_buffer: &[Color],
        frame_size: FrameSize,
    ) -> Result<(), Self::Err> {
        let pixel_count = (frame_size.width * frame_size.height) as usize;
        self.frames.push(CapturedFrame {
            pixels: frame_buffer[..pixel_count.min(frame_buffer.len())].to_vec(),
            size: frame_size,
        });
        Ok(())
    }
}

struct CapturingAudio<'a> {
    samples: &'a mut Vec<(f64, f64)>,
}

impl AudioOutput for CapturingAudio<'_> {
    type Err = Infallible;

    fn push_sample(&mut self, sample_l: f64, sample_r: f64) -> Result<(), Self::Err> {
        self.samples.push((sample_l, sample_r));
        Ok(())
    }
}

struct NullSaveWriter;

impl SaveWriter for NullSaveWriter {
    type Err = Infallible;

    fn load_bytes(&mut self, _extension: &str) -> Result<Vec<u8>, Self::Err> {
        Ok(Vec::new())
    }

    fn persist_bytes(&mut self, _extension: &str, _bytes: &[u8]) -> Result<(), Self::Err> {
        Ok(())
    }
}

/// Fixed-capacity ring that plays captured rewind audio backwards. Blocks are bulk-copied in
/// at the front (the read pointer walks backward through contiguous memory), rather than
/// pushed sample-by-sample through a deque.
#[derive(Debug, Clone)]
pub struct ReversedAudioRing {
    buffer: Vec<(f64, f64)>,
    read_position: usize,
    available: usize,
}

impl ReversedAudioRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { buffer: vec![(0.0, 0.0); capacity], read_position: 0, available: 0 }
    }

    /// Insert a frame's samples; they will be read newest-first.
    pub fn insert_block(&mut self, samples: &[(f64, f64)]) {
        let capacity = self.buffer.len();
        let take = samples.len().min(capacity);

        // Copy in one or two contiguous spans ending at the current read position
        let end = self.read_position;
        let start = (end + capacity - take) % capacity;
        if start < end {
            self.buffer[start..end].copy_from_slice(&samples[samples.len() - take..]);
        } else {
            let first_span = capacity - start;
            self.buffer[start..].copy_from_slice(&samples[samples.len() - take..][..first_span]);
            self.buffer[..end]
                .copy_from_slice(&samples[samples.len() - take + first_span..]);
        }

        self.read_position = start;
        self.available = (self.available + take).min(capacity);
    }

    pub fn pop_reversed(&mut self) -> Option<(f64, f64)> {
        if self.available == 0 {
            return None;
        }
        // Read pointer moves backward: newest sample first
        let capacity = self.buffer.len();
        let index = (self.read_position + self.available - 1) % capacity;
        self.available -= 1;
        Some(self.buffer[index])
    }
}

pub struct RewindManager<Emulator: EmulatorTrait> {
    history: VecDeque<RewindData>,
    total_bytes: usize,
    memory_ceiling: usize,
    frames_per_block: u32,
    frames_in_current_block: u32,
    current_input_log: Vec<Vec<u16>>,
    last_full_state: Vec<u8>,
    blocks_since_full: u32,
    pub audio_ring: ReversedAudioRing,
    _marker: std::marker::PhantomData<Emulator>,
}

impl<Emulator: EmulatorTrait> RewindManager<Emulator> {
    #[must_use]
    pub fn new(memory_ceiling: usize) -> Self {
        Self {
            history: VecDeque::new(),
            total_bytes: 0,
            memory_ceiling,
            frames_per_block: DEFAULT_FRAMES_PER_BLOCK,
            frames_in_current_block: 0,
            current_input_log: Vec::with_capacity(DEFAULT_FRAMES_PER_BLOCK as usize),
            last_full_state: Vec::new(),
            blocks_since_full: 0,
            audio_ring: ReversedAudioRing::new(48_000 * 4),
            _marker: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Record one emulated frame's inputs, starting a new snapshot block when the window
    /// fills up.
    pub fn record_frame(&mut self, emulator: &Emulator, inputs: &Emulator::Inputs) {
        if self.frames_in_current_block == 0 {
            self.push_snapshot(emulator, false);
        }

        let port_bits: Vec<u16> =
            (0..Emulator::Inputs::PORTS).map(|port| inputs.port_bits(port)).collect();
        self.current_input_log.push(port_bits);

        self.frames_in_current_block += 1;
        if self.frames_in_current_block == self.frames_per_block {
            self.finish_block();
        }
    }

    /// Mark a discontinuity after a user-initiated state load.
    pub fn mark_end_of_segment(&mut self, emulator: &Emulator) {
        self.finish_block();
        self.push_snapshot(emulator, true);
        self.finish_block();
    }

    fn serialize_state(emulator: &Emulator) -> Vec<u8> {
        bincode::encode_to_vec(emulator, bincode_config!())
            .expect("console state serialization cannot fail")
    }

    fn push_snapshot(&mut self, emulator: &Emulator, end_of_segment: bool) {
        let raw = Self::serialize_state(emulator);

        // Full states every other block; a delta XORs against the full block immediately
        // before it in the queue, which is the invariant playback and eviction rely on
        let state = if self.blocks_since_full == 0 || raw.len() != self.last_full_state.len() {
            self.blocks_since_full = 1;
            self.last_full_state = raw.clone();
            RewindState::Full(deflate(&raw))
        } else {
            self.blocks_since_full = (self.blocks_since_full + 1) % 2;
            let xored: Vec<u8> =
                raw.iter().zip(&self.last_full_state).map(|(a, b)| a ^ b).collect();
            RewindState::Delta(deflate(&xored))
        };

        let block =
            RewindData { state, input_log: Vec::new(), end_of_segment };
        self.total_bytes += block.byte_len();
        self.history.push_back(block);

        self.evict_over_ceiling();
    }

    fn finish_block(&mut self) {
        self.frames_in_current_block = 0;
        if self.current_input_log.is_empty() {
            return;
        }

        if let Some(block) = self.history.back_mut() {
            let log = std::mem::take(&mut self.current_input_log);
            self.total_bytes += log.iter().map(|frame| frame.len() * 2).sum::<usize>();
            block.input_log = log;
        } else {
            self.current_input_log.clear();
        }
    }

    fn evict_over_ceiling(&mut self) {
        while self.total_bytes > self.memory_ceiling && self.history.len() > 1 {
            // Evict the head full state together with every delta depending on it
            let front = self.history.pop_front().expect("len checked above");
            self.total_bytes = self.total_bytes.saturating_sub(front.byte_len());

            while matches!(
                self.history.front().map(|block| &block.state),
                Some(RewindState::Delta(_))
            ) {
                let delta = self.history.pop_front().expect("front checked above");
                self.total_bytes = self.total_bytes.saturating_sub(delta.byte_len());
            }
        }
    }

    /// Rewind one block: restore the most recent snapshot, re-execute its frames at maximum
    /// speed to capture them, and return the captured frames in reverse display order. The
    /// console is left at the window start, the last frame the reverse presentation shows,
    /// so resuming forward (or rewinding further) continues from there.
    ///
    /// Returns None when there is nothing left to rewind.
    pub fn rewind_block(&mut self, emulator: &mut Emulator) -> Option<Vec<CapturedFrame>> {
        // Attach any partially recorded window to its block so those frames replay too
        self.finish_block();

        let block = self.history.pop_back()?;
        self.total_bytes = self.total_bytes.saturating_sub(block.byte_len());

        let raw: Vec<u8> = match &block.state {
            RewindState::Full(compressed) => inflate(compressed),
            RewindState::Delta(compressed) => {
                // A delta's base is the full block now at the tail of the queue; eviction
                // always removes a full together with its dependent deltas, so the base is
                // still present
                let Some(RewindState::Full(base_compressed)) =
                    self.history.back().map(|previous| &previous.state)
                else {
                    log::error!("Rewind delta block has no preceding full state; dropping it");
                    return None;
                };
                let base = inflate(base_compressed);
                let xored = inflate(compressed);
                xored.iter().zip(&base).map(|(a, b)| a ^ b).collect()
            }
        };

        // Whatever gets recorded after this rewind starts a fresh full/delta pair
        self.blocks_since_full = 0;
        self.last_full_state.clear();

        let (mut restored, _): (Emulator, usize) =
            bincode::decode_from_slice(&raw, bincode_config!()).ok()?;
        restored.take_rom_from(emulator);
        *emulator = restored;

        // A segment boundary (recorded after a user save-state load) is a rewind barrier:
        // restore its snapshot but do not play back across it
        if block.end_of_segment {
            return Some(Vec::new());
        }

        // Re-execute forward with the recorded inputs, capturing video and audio
        let mut renderer = CapturingRenderer { frames: Vec::new() };
        let mut audio_samples = Vec::new();

        for frame_inputs in &block.input_log {
            let mut inputs = Emulator::Inputs::default();
            for (port, &bits) in frame_inputs.iter().enumerate() {
                inputs.set_port_bits(port, bits);
            }

            let mut audio = CapturingAudio { samples: &mut audio_samples };
            loop {
                let Ok(effect) =
                    emulator.tick(&mut renderer, &mut audio, &inputs, &mut NullSaveWriter)
                else {
                    unreachable!("capturing sinks are infallible");
                };
                if effect == TickEffect::FrameRendered {
                    break;
                }
            }
        }

        self.audio_ring.insert_block(&audio_samples);

        // Park the console back on the snapshot now that the window's frames are captured
        let (mut rewound, _): (Emulator, usize) =
            bincode::decode_from_slice(&raw, bincode_config!()).ok()?;
        rewound.take_rom_from(emulator);
        *emulator = rewound;

        // Present in reverse frame order
        renderer.frames.reverse();
        Some(renderer.frames)
    }

    /// Single-frame rewind for the debugger's step-back: same engine, finer granularity.
    pub fn step_back(&mut self, emulator: &mut Emulator) -> Option<CapturedFrame> {
        let mut frames = self.rewind_block(emulator)?;
        frames.truncate(1);
        frames.pop()
    }

    /// Drop everything (e.g. after loading a fresh ROM).
    pub fn clear(&mut self) {
        self.history.clear();
        self.current_input_log.clear();
        self.total_bytes = 0;
        self.frames_in_current_block = 0;
        self.blocks_since_full = 0;
        self.last_full_state.clear();
    }
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes).expect("in-memory deflate cannot fail");
    encoder.finish().expect("in-memory deflate cannot fail")
}

fn inflate(bytes: &[u8]) -> Vec<u8> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).expect("rewind buffers always hold valid deflate data");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_ring_plays_newest_first() {
        let mut ring = ReversedAudioRing::new(8);
        ring.insert_block(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]);

        assert_eq!(ring.pop_reversed(), Some((3.0, 3.0)));
        assert_eq!(ring.pop_reversed(), Some((2.0, 2.0)));
        assert_eq!(ring.pop_reversed(), Some((1.0, 1.0)));
        assert_eq!(ring.pop_reversed(), None);
    }

    #[test]
    fn reversed_ring_bulk_copy_wraps() {
        let mut ring = ReversedAudioRing::new(4);
        ring.insert_block(&[(1.0, 0.0), (2.0, 0.0)]);
        ring.insert_block(&[(3.0, 0.0), (4.0, 0.0), (5.0, 0.0)]);

        // Capacity 4: the oldest sample fell off
        assert_eq!(ring.pop_reversed(), Some((5.0, 0.0)));
        assert_eq!(ring.pop_reversed(), Some((4.0, 0.0)));
        assert_eq!(ring.pop_reversed(), Some((3.0, 0.0)));
        assert_eq!(ring.pop_reversed(), Some((2.0, 0.0)));
        assert_eq!(ring.pop_reversed(), None);
    }

    #[test]
    fn deflate_round_trip() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 7) as u8).collect();
        let compressed = deflate(&data);
        assert!(compressed.len() < data.len());
        assert_eq!(inflate(&compressed), data);
    }
}

//! Delta-stream audio plumbing shared by the console cores.
//!
//! APU channels do not produce one sample per clock; they emit *deltas*, timestamped output-level
//! changes, whenever a channel's output actually moves. A console's mixer walks the merged delta
//! stream once per frame, converts absolute channel levels into a mixed output level, and hands
//! level-change events to a [`DeltaResampler`] that integrates them into host-rate samples. Only
//! cycles that carry at least one change are ever visited.

use bincode::{Decode, Encode};
use std::collections::VecDeque;

pub const DEFAULT_OUTPUT_FREQUENCY: u64 = 48000;

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct AudioDelta {
    /// CPU cycle within the current frame.
    pub cycle: u32,
    /// Output level change at that cycle.
    pub change: f64,
}

/// Per-channel delta buffer with dedup-at-insert.
///
/// Same-cycle changes are merged into a single entry via an occupancy table indexed by
/// cycle-within-frame, so draining only needs a sort and never a `dedup` pass.
#[derive(Debug, Clone, Encode, Decode)]
pub struct DeltaBuffer {
    deltas: Vec<AudioDelta>,
    // cycle -> delta index + 1; 0 means unoccupied
    slot_for_cycle: Vec<u32>,
}

impl DeltaBuffer {
    #[must_use]
    pub fn new(max_cycles_per_frame: usize) -> Self {
        Self { deltas: Vec::with_capacity(256), slot_for_cycle: vec![0; max_cycles_per_frame] }
    }

    /// Record an output level change at the given cycle. Zero changes are never recorded.
    pub fn push(&mut self, cycle: u32, change: f64) {
        if change == 0.0 {
            return;
        }

        let Some(slot) = self.slot_for_cycle.get_mut(cycle as usize) else {
            // Cycle past the expected frame length; clamp to the final slot
            log::warn!("Audio delta past end of frame (cycle {cycle}), clamping");
            if let Some(last) = self.slot_for_cycle.len().checked_sub(1) {
                self.push(last as u32, change);
            }
            return;
        };

        if *slot != 0 {
            self.deltas[(*slot - 1) as usize].change += change;
            return;
        }

        self.deltas.push(AudioDelta { cycle, change });
        *slot = self.deltas.len() as u32;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Move this frame's deltas into `out` in strictly increasing cycle order, dropping entries
    /// whose merged change canceled out to zero, and reset for the next frame.
    pub fn drain_sorted(&mut self, out: &mut Vec<AudioDelta>) {
        for delta in &self.deltas {
            self.slot_for_cycle[delta.cycle as usize] = 0;
        }

        self.deltas.retain(|delta| delta.change != 0.0);
        self.deltas.sort_unstable_by_key(|delta| delta.cycle);

        out.append(&mut self.deltas);
    }
}

/// Integrates level-change events into host-rate samples by exact area accumulation.
///
/// Between events the output level is constant, so each source-rate segment contributes
/// `level * len` of area; output samples are the average level over `source_freq / output_freq`
/// cycles. This is a box filter, which is adequate band-limiting for the chip sources involved
/// while keeping the per-frame cost proportional to the number of deltas.
#[derive(Debug, Clone, Encode, Decode)]
pub struct DeltaResampler<const CHANNELS: usize> {
    level: [f64; CHANNELS],
    source_frequency: f64,
    output_frequency: u64,
    cycles_per_output_sample: f64,
    sample_progress: f64,
    area: [f64; CHANNELS],
    cursor: u64,
    output: VecDeque<[f64; CHANNELS]>,
}

impl<const CHANNELS: usize> DeltaResampler<CHANNELS> {
    #[must_use]
    pub fn new(source_frequency: f64, output_frequency: u64) -> Self {
        Self {
            level: [0.0; CHANNELS],
            source_frequency,
            output_frequency,
            cycles_per_output_sample: source_frequency / output_frequency as f64,
            sample_progress: 0.0,
            area: [0.0; CHANNELS],
            cursor: 0,
            output: VecDeque::with_capacity((DEFAULT_OUTPUT_FREQUENCY / 30) as usize),
        }
    }

    pub fn update_output_frequency(&mut self, output_frequency: u64) {
        self.output_frequency = output_frequency;
        self.cycles_per_output_sample = self.source_frequency / output_frequency as f64;
    }

    pub fn update_source_frequency(&mut self, source_frequency: f64) {
        self.source_frequency = source_frequency;
        self.cycles_per_output_sample = source_frequency / self.output_frequency as f64;
    }

    /// Set the absolute output level at the given cycle within the current frame.
    ///
    /// Cycles must be monotonically non-decreasing within a frame.
    pub fn set_level(&mut self, cycle: u32, level: [f64; CHANNELS]) {
        debug_assert!(u64::from(cycle) >= self.cursor, "audio deltas must be cycle-ordered");

        self.advance(u64::from(cycle).saturating_sub(self.cursor));
        self.cursor = u64::from(cycle);
        self.level = level;
    }

    /// Finish the current frame, which is `frame_cycles` long, and reset the cycle cursor.
    pub fn end_frame(&mut self, frame_cycles: u32) {
        self.advance(u64::from(frame_cycles).saturating_sub(self.cursor));
        self.cursor = 0;
    }

    fn advance(&mut self, cycles: u64) {
        let mut remaining = cycles as f64;

        while remaining > 0.0 {
            let take = remaining.min(self.cycles_per_output_sample - self.sample_progress);
            for ch in 0..CHANNELS {
                self.area[ch] += take * self.level[ch];
            }
            self.sample_progress += take;
            remaining -= take;

            if self.sample_progress >= self.cycles_per_output_sample - 1e-9 {
                let sample = std::array::from_fn(|ch| self.area[ch] / self.cycles_per_output_sample);
                self.output.push_back(sample);
                self.area = [0.0; CHANNELS];
                self.sample_progress = 0.0;
            }
        }
    }

    #[must_use]
    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    pub fn pop_output(&mut self) -> Option<[f64; CHANNELS]> {
        self.output.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_buffer_merges_same_cycle() {
        let mut buffer = DeltaBuffer::new(100);
        buffer.push(10, 0.5);
        buffer.push(10, 0.25);
        buffer.push(5, -0.125);

        let mut out = Vec::new();
        buffer.drain_sorted(&mut out);

        assert_eq!(
            out,
            vec![
                AudioDelta { cycle: 5, change: -0.125 },
                AudioDelta { cycle: 10, change: 0.75 }
            ]
        );
    }

    #[test]
    fn delta_buffer_never_emits_zero_changes() {
        let mut buffer = DeltaBuffer::new(100);
        buffer.push(10, 0.0);
        buffer.push(20, 0.5);
        buffer.push(20, -0.5);

        let mut out = Vec::new();
        buffer.drain_sorted(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn delta_buffer_resets_between_frames() {
        let mut buffer = DeltaBuffer::new(100);
        buffer.push(10, 1.0);

        let mut out = Vec::new();
        buffer.drain_sorted(&mut out);
        assert_eq!(out.len(), 1);

        buffer.push(10, 0.5);
        out.clear();
        buffer.drain_sorted(&mut out);
        assert_eq!(out, vec![AudioDelta { cycle: 10, change: 0.5 }]);
    }

    #[test]
    fn resampler_zero_deltas_idempotent() {
        // Emitting no level changes and emitting changes that are all zero must produce
        // identical output streams
        let mut silent = DeltaResampler::<1>::new(1000.0, 100);
        let mut with_events = DeltaResampler::<1>::new(1000.0, 100);

        silent.end_frame(1000);

        with_events.set_level(250, [0.0]);
        with_events.set_level(500, [0.0]);
        with_events.end_frame(1000);

        assert_eq!(silent.output_len(), with_events.output_len());
        while let Some(a) = silent.pop_output() {
            let b = with_events.pop_output().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn resampler_averages_levels() {
        // 10 source cycles per output sample; constant level 1.0 for the first half of the
        // frame and 0.0 for the second half
        let mut resampler = DeltaResampler::<1>::new(1000.0, 100);
        resampler.set_level(0, [1.0]);
        resampler.set_level(50, [0.0]);
        resampler.end_frame(100);

        assert_eq!(resampler.output_len(), 10);
        for i in 0..10 {
            let [sample] = resampler.pop_output().unwrap();
            let expected = if i < 5 { 1.0 } else { 0.0 };
            assert!((sample - expected).abs() < 1e-9, "sample {i} was {sample}");
        }
    }
}

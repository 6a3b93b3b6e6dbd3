//! Frame-level audio assembly: merges the APU's delta stream with any expansion audio deltas
//! from the mapper, integrates them through the delta resampler, and hands host-rate samples
//! to the audio output.

use crate::TimingModeExt;
use bincode::{Decode, Encode};
use nexen_common::audio::{AudioDelta, DeltaResampler};
use nexen_common::frontend::{AudioOutput, TimingMode};

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct AudioResampler {
    resampler: DeltaResampler<1>,
    level: f64,
    scratch: Vec<AudioDelta>,
}

impl AudioResampler {
    pub(crate) fn new(timing_mode: TimingMode, output_frequency: u64) -> Self {
        Self {
            resampler: DeltaResampler::new(timing_mode.cpu_frequency(), output_frequency),
            level: 0.0,
            scratch: Vec::with_capacity(1024),
        }
    }

    pub(crate) fn update_output_frequency(&mut self, output_frequency: u64) {
        self.resampler.update_output_frequency(output_frequency);
    }

    /// Merge and integrate one frame's deltas. Both input streams are individually
    /// cycle-sorted; the merge re-sorts the concatenation, which is cheap at these sizes.
    pub(crate) fn process_frame(
        &mut self,
        apu_deltas: &mut Vec<AudioDelta>,
        expansion_deltas: &mut Vec<AudioDelta>,
        frame_cycles: u32,
    ) {
        self.scratch.clear();
        self.scratch.append(apu_deltas);
        self.scratch.append(expansion_deltas);
        self.scratch.sort_unstable_by_key(|delta| delta.cycle);

        for delta in &self.scratch {
            self.level += delta.change;
            self.resampler.set_level(delta.cycle, [self.level]);
        }

        self.resampler.end_frame(frame_cycles);
    }

    pub(crate) fn output_samples<A: AudioOutput>(&mut self, audio_output: &mut A) -> Result<(), A::Err> {
        while let Some([sample]) = self.resampler.pop_output() {
            audio_output.push_sample(sample, sample)?;
        }
        Ok(())
    }
}

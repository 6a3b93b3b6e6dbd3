//! Frame-level stereo audio assembly for the SMS/GG core.

use bincode::{Decode, Encode};
use nexen_common::audio::{AudioDelta, DeltaResampler};
use nexen_common::frontend::AudioOutput;

// PSG tone clock: Z80 clock (NTSC) / 16
const PSG_FREQUENCY: f64 = 3_579_545.0 / 16.0;

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct AudioResampler {
    resampler: DeltaResampler<2>,
    left_level: f64,
    right_level: f64,
    left_scratch: Vec<AudioDelta>,
    right_scratch: Vec<AudioDelta>,
}

impl AudioResampler {
    pub(crate) fn new(output_frequency: u64) -> Self {
        Self {
            resampler: DeltaResampler::new(PSG_FREQUENCY, output_frequency),
            left_level: 0.0,
            right_level: 0.0,
            left_scratch: Vec::with_capacity(512),
            right_scratch: Vec::with_capacity(512),
        }
    }

    pub(crate) fn update_output_frequency(&mut self, output_frequency: u64) {
        self.resampler.update_output_frequency(output_frequency);
    }

    pub(crate) fn process_frame(&mut self, psg: &mut crate::psg::Psg, frame_psg_cycles: u32) {
        self.left_scratch.clear();
        self.right_scratch.clear();
        psg.take_deltas(&mut self.left_scratch, &mut self.right_scratch);

        let mut left_index = 0;
        let mut right_index = 0;
        while left_index < self.left_scratch.len() || right_index < self.right_scratch.len() {
            let left_cycle =
                self.left_scratch.get(left_index).map_or(u32::MAX, |delta| delta.cycle);
            let right_cycle =
                self.right_scratch.get(right_index).map_or(u32::MAX, |delta| delta.cycle);

            let cycle = left_cycle.min(right_cycle);
            if left_cycle == cycle {
                self.left_level += self.left_scratch[left_index].change;
                left_index += 1;
            }
            if right_cycle == cycle {
                self.right_level += self.right_scratch[right_index].change;
                right_index += 1;
            }

            self.resampler.set_level(cycle, [self.left_level, self.right_level]);
        }

        self.resampler.end_frame(frame_psg_cycles);
    }

    pub(crate) fn output_samples<A: AudioOutput>(
        &mut self,
        audio_output: &mut A,
    ) -> Result<(), A::Err> {
        while let Some([left, right]) = self.resampler.pop_output() {
            audio_output.push_sample(left, right)?;
        }
        Ok(())
    }
}

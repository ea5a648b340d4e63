//! Optional RNNoise-style suppression applied to outgoing microphone audio.
//!
//! The denoiser works on 480-sample sub-frames in the i16 float range, so one
//! 960-sample voice frame is processed as two passes with scaling on the way
//! in and out.

use nnnoiseless::DenoiseState;

use super::FRAME_SIZE;

const SUB_FRAME: usize = DenoiseState::FRAME_SIZE; // 480 samples

pub struct Denoiser {
    state: Box<DenoiseState<'static>>,
    scratch_in: [f32; SUB_FRAME],
    scratch_out: [f32; SUB_FRAME],
}

impl Denoiser {
    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            scratch_in: [0.0; SUB_FRAME],
            scratch_out: [0.0; SUB_FRAME],
        }
    }

    /// Denoise one 20 ms frame in place. PCM is [-1, 1] floats.
    pub fn process(&mut self, pcm: &mut [f32]) {
        debug_assert_eq!(pcm.len(), FRAME_SIZE);
        for sub in pcm.chunks_mut(SUB_FRAME) {
            if sub.len() != SUB_FRAME {
                break;
            }
            for (dst, src) in self.scratch_in.iter_mut().zip(sub.iter()) {
                *dst = *src * 32768.0;
            }
            self.state
                .process_frame(&mut self.scratch_out, &self.scratch_in);
            for (dst, src) in sub.iter_mut().zip(self.scratch_out.iter()) {
                *dst = *src / 32768.0;
            }
        }
    }
}

impl Default for Denoiser {
    fn default() -> Self {
        Self::new()
    }
}

//! Opus voice codec wrappers: 48 kHz mono, 20 ms frames, VOIP profile.

use anyhow::Result;
use std::convert::TryFrom;

use super::{FRAME_SIZE, SAMPLE_RATE};

/// Target bitrate for voice. Plenty for speech at 48 kHz mono.
const BITRATE_BPS: i32 = 64_000;
/// Upper bound on an encoded packet. Opus never comes close at 64 kbps.
const MAX_OPUS_PACKET: usize = 4000;

pub struct VoiceEncoder {
    inner: audiopus::coder::Encoder,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self> {
        let mut inner = audiopus::coder::Encoder::new(
            audiopus::SampleRate::Hz48000,
            audiopus::Channels::Mono,
            audiopus::Application::Voip,
        )
        .map_err(|e| anyhow::anyhow!("failed to create Opus encoder: {}", e))?;
        inner
            .set_bitrate(audiopus::Bitrate::BitsPerSecond(BITRATE_BPS))
            .map_err(|e| anyhow::anyhow!("failed to set Opus bitrate: {}", e))?;
        Ok(Self { inner })
    }

    /// Encode exactly one 960-sample frame of [-1, 1] PCM.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>> {
        debug_assert_eq!(pcm.len(), FRAME_SIZE);
        let mut out = vec![0u8; MAX_OPUS_PACKET];
        let len = self
            .inner
            .encode_float(pcm, &mut out)
            .map_err(|e| anyhow::anyhow!("Opus encode failed: {}", e))?;
        out.truncate(len);
        Ok(out)
    }
}

pub struct VoiceDecoder {
    inner: audiopus::coder::Decoder,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self> {
        let inner = audiopus::coder::Decoder::new(
            audiopus::SampleRate::Hz48000,
            audiopus::Channels::Mono,
        )
        .map_err(|e| anyhow::anyhow!("failed to create Opus decoder: {}", e))?;
        Ok(Self { inner })
    }

    /// Decode one packet into one 20 ms frame of PCM.
    pub fn decode(&mut self, opus: &[u8]) -> Result<Vec<f32>> {
        let mut pcm = vec![0f32; FRAME_SIZE];
        let packet = audiopus::packet::Packet::try_from(opus)
            .map_err(|e| anyhow::anyhow!("invalid Opus packet: {:?}", e))?;
        let signals = audiopus::MutSignals::try_from(&mut pcm)
            .map_err(|e| anyhow::anyhow!("output buffer error: {:?}", e))?;
        let decoded = self
            .inner
            .decode_float(Some(packet), signals, false)
            .map_err(|e| anyhow::anyhow!("Opus decode failed: {}", e))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }

    /// Packet-loss concealment: synthesize one frame from decoder state.
    /// Falls back to silence rather than erroring — a pop is worse than a gap.
    pub fn decode_plc(&mut self) -> Vec<f32> {
        let mut pcm = vec![0f32; FRAME_SIZE];
        let ok = audiopus::MutSignals::try_from(&mut pcm)
            .ok()
            .and_then(|signals| self.inner.decode_float(None, signals, false).ok());
        match ok {
            Some(decoded) => {
                pcm.truncate(decoded);
                pcm.resize(FRAME_SIZE, 0.0);
                pcm
            }
            None => vec![0.0; FRAME_SIZE],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_frame_length() {
        let mut enc = VoiceEncoder::new().unwrap();
        let mut dec = VoiceDecoder::new().unwrap();

        // A quiet 440 Hz tone, one frame.
        let pcm: Vec<f32> = (0..FRAME_SIZE)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / SAMPLE_RATE as f32).sin() * 0.1)
            .collect();

        let opus = enc.encode(&pcm).unwrap();
        assert!(!opus.is_empty() && opus.len() <= MAX_OPUS_PACKET);

        let decoded = dec.decode(&opus).unwrap();
        assert_eq!(decoded.len(), FRAME_SIZE);
    }

    #[test]
    fn test_plc_returns_full_frame() {
        let mut dec = VoiceDecoder::new().unwrap();
        let frame = dec.decode_plc();
        assert_eq!(frame.len(), FRAME_SIZE);
    }
}

//! H.264 encode/decode for screen sharing.
//!
//! The encoder contract the rest of the pipeline leans on:
//! - the first output after construction (or reconfiguration) is an IDR;
//! - `force_idr` makes the *next* produced output an IDR;
//! - keyframes are never more than `fps * 2` input frames apart;
//! - rate control is CBR at the configured target.
//!
//! The decoder discards anything arriving before the first keyframe and
//! republishes its RGB surface on every decoded frame, so a mid-stream
//! resolution change just shows up as new dimensions.

use anyhow::{Context, Result};
use openh264::decoder::Decoder;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType, RateControlMode};
use openh264::formats::YUVSource;
use openh264::OpenH264API;

pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

pub struct VideoEncoder {
    inner: Encoder,
    width: u32,
    height: u32,
    fps: u32,
    bitrate_bps: u32,
    frames_since_idr: u32,
    rebuild: bool,
}

fn build_encoder(fps: u32, bitrate_bps: u32) -> Result<Encoder> {
    let config = EncoderConfig::new()
        .max_frame_rate(FrameRate::from_hz(fps as f32))
        .rate_control_mode(RateControlMode::Bitrate)
        .bitrate(BitRate::from_bps(bitrate_bps));
    Encoder::with_api_config(OpenH264API::from_source(), config)
        .context("H.264 encoder init failed")
}

impl VideoEncoder {
    /// Dimensions must be even (4:2:0 chroma).
    pub fn new(width: u32, height: u32, fps: u32, bitrate_bps: u32) -> Result<Self> {
        anyhow::ensure!(
            width % 2 == 0 && height % 2 == 0 && width > 0 && height > 0,
            "encoder dimensions must be even and non-zero"
        );
        Ok(Self {
            inner: build_encoder(fps, bitrate_bps)?,
            width,
            height,
            fps,
            bitrate_bps,
            frames_since_idr: 0,
            rebuild: true, // first output is always an IDR
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Retarget the bitrate. Takes effect on the next frame; that frame will
    /// be an IDR since the underlying encoder is reconfigured.
    pub fn set_bitrate(&mut self, bitrate_bps: u32) {
        if bitrate_bps != self.bitrate_bps {
            self.bitrate_bps = bitrate_bps;
            self.rebuild = true;
        }
    }

    /// Encode one BGRA frame. Returns `None` when the encoder elides the
    /// frame entirely (rate control skip).
    pub fn encode_bgra(
        &mut self,
        bgra: &[u8],
        stride: usize,
        force_idr: bool,
    ) -> Result<Option<EncodedFrame>> {
        if self.rebuild {
            self.inner = build_encoder(self.fps, self.bitrate_bps)?;
            self.frames_since_idr = 0;
            self.rebuild = false;
            self.inner.force_intra_frame();
        } else if force_idr || self.frames_since_idr + 1 >= self.fps * 2 {
            self.inner.force_intra_frame();
        }

        let yuv = bgra_to_i420(bgra, self.width as usize, self.height as usize, stride);
        let bitstream = self
            .inner
            .encode(&yuv)
            .map_err(|e| anyhow::anyhow!("H.264 encode failed: {e}"))?;

        let keyframe = matches!(bitstream.frame_type(), FrameType::IDR);
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }
        if keyframe {
            self.frames_since_idr = 0;
        } else {
            self.frames_since_idr += 1;
        }
        Ok(Some(EncodedFrame { data, keyframe }))
    }
}

pub struct VideoDecoder {
    inner: Decoder,
    seen_keyframe: bool,
    surface: Vec<u8>,
    width: u32,
    height: u32,
}

impl VideoDecoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Decoder::new().context("H.264 decoder init failed")?,
            seen_keyframe: false,
            surface: Vec::new(),
            width: 0,
            height: 0,
        })
    }

    /// Feed one access unit. Returns true when a new surface is ready.
    /// Frames arriving before the first keyframe are discarded.
    pub fn submit(&mut self, data: &[u8], is_keyframe: bool) -> Result<bool> {
        if !self.seen_keyframe {
            if !is_keyframe {
                return Ok(false);
            }
            self.seen_keyframe = true;
        }

        let decoded = self
            .inner
            .decode(data)
            .map_err(|e| anyhow::anyhow!("H.264 decode failed: {e}"))?;
        let Some(yuv) = decoded else {
            // Decoder is buffering (e.g. reconfiguring after a resolution
            // change); nothing to show yet.
            return Ok(false);
        };

        let (w, h) = yuv.dimensions();
        self.surface.resize(w * h * 3, 0);
        yuv.write_rgb8(&mut self.surface);
        self.width = w as u32;
        self.height = h as u32;
        Ok(true)
    }

    /// The current displayable RGB surface and its dimensions.
    pub fn present(&self) -> Option<(&[u8], u32, u32)> {
        if self.surface.is_empty() {
            None
        } else {
            Some((&self.surface, self.width, self.height))
        }
    }
}

// ── BGRA → I420 ──

pub struct I420Buffer {
    width: usize,
    height: usize,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl YUVSource for I420Buffer {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        &self.y
    }

    fn u(&self) -> &[u8] {
        &self.u
    }

    fn v(&self) -> &[u8] {
        &self.v
    }
}

/// BT.601 limited-range conversion with 2x2 chroma averaging.
/// `stride` is the source row pitch in bytes (captures often pad rows).
pub fn bgra_to_i420(bgra: &[u8], width: usize, height: usize, stride: usize) -> I420Buffer {
    let mut y_plane = vec![0u8; width * height];
    let mut u_plane = vec![0u8; (width / 2) * (height / 2)];
    let mut v_plane = vec![0u8; (width / 2) * (height / 2)];

    for row in 0..height {
        for col in 0..width {
            let src = row * stride + col * 4;
            let (b, g, r) = (
                bgra[src] as i32,
                bgra[src + 1] as i32,
                bgra[src + 2] as i32,
            );
            y_plane[row * width + col] =
                (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;
        }
    }

    for row in (0..height).step_by(2) {
        for col in (0..width).step_by(2) {
            // Average the 2x2 block for chroma.
            let (mut r_sum, mut g_sum, mut b_sum) = (0i32, 0i32, 0i32);
            for dy in 0..2 {
                for dx in 0..2 {
                    let src = (row + dy) * stride + (col + dx) * 4;
                    b_sum += bgra[src] as i32;
                    g_sum += bgra[src + 1] as i32;
                    r_sum += bgra[src + 2] as i32;
                }
            }
            let (r, g, b) = (r_sum / 4, g_sum / 4, b_sum / 4);
            let idx = (row / 2) * (width / 2) + col / 2;
            u_plane[idx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            v_plane[idx] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        }
    }

    I420Buffer {
        width,
        height,
        y: y_plane,
        u: u_plane,
        v: v_plane,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_bgra(width: usize, height: usize, b: u8, g: u8, r: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(width * height * 4);
        for _ in 0..width * height {
            buf.extend_from_slice(&[b, g, r, 255]);
        }
        buf
    }

    #[test]
    fn test_i420_conversion_grey_is_neutral_chroma() {
        let bgra = solid_bgra(16, 16, 128, 128, 128);
        let yuv = bgra_to_i420(&bgra, 16, 16, 16 * 4);
        assert_eq!(yuv.dimensions(), (16, 16));
        // Neutral grey: chroma planes sit at the midpoint.
        assert!(yuv.u().iter().all(|&u| (u as i32 - 128).abs() <= 1));
        assert!(yuv.v().iter().all(|&v| (v as i32 - 128).abs() <= 1));
    }

    #[test]
    fn test_i420_conversion_black_white_luma() {
        let black = bgra_to_i420(&solid_bgra(8, 8, 0, 0, 0), 8, 8, 32);
        let white = bgra_to_i420(&solid_bgra(8, 8, 255, 255, 255), 8, 8, 32);
        assert!(black.y().iter().all(|&y| y <= 20));
        assert!(white.y().iter().all(|&y| y >= 230));
    }

    #[test]
    fn test_encoder_first_output_is_keyframe() {
        let mut enc = VideoEncoder::new(64, 64, 30, 200_000).unwrap();
        let frame = solid_bgra(64, 64, 30, 60, 90);
        let out = enc.encode_bgra(&frame, 64 * 4, false).unwrap().unwrap();
        assert!(out.keyframe);
    }

    #[test]
    fn test_encoder_forced_idr_on_next_output() {
        let mut enc = VideoEncoder::new(64, 64, 30, 200_000).unwrap();
        let frame = solid_bgra(64, 64, 10, 20, 30);
        enc.encode_bgra(&frame, 64 * 4, false).unwrap();
        // A couple of deltas first.
        for _ in 0..3 {
            enc.encode_bgra(&frame, 64 * 4, false).unwrap();
        }
        let forced = enc.encode_bgra(&frame, 64 * 4, true).unwrap().unwrap();
        assert!(forced.keyframe);
    }

    #[test]
    fn test_encoder_gop_cap() {
        let fps = 10; // keeps the test fast: keyframe at most 20 frames apart
        let mut enc = VideoEncoder::new(64, 64, fps, 200_000).unwrap();
        let frame = solid_bgra(64, 64, 77, 77, 77);
        let mut gap = 0u32;
        let mut max_gap = 0u32;
        for _ in 0..(fps * 2) * 3 {
            if let Some(out) = enc.encode_bgra(&frame, 64 * 4, false).unwrap() {
                if out.keyframe {
                    gap = 0;
                } else {
                    gap += 1;
                    max_gap = max_gap.max(gap);
                }
            } else {
                gap += 1;
            }
        }
        assert!(max_gap < fps * 2, "keyframe gap {max_gap} exceeds GOP cap");
    }

    #[test]
    fn test_decoder_discards_pre_keyframe_deltas() {
        let mut enc = VideoEncoder::new(64, 64, 30, 200_000).unwrap();
        let frame = solid_bgra(64, 64, 200, 100, 50);
        let key = enc.encode_bgra(&frame, 64 * 4, false).unwrap().unwrap();
        let delta = loop {
            if let Some(out) = enc.encode_bgra(&frame, 64 * 4, false).unwrap() {
                if !out.keyframe {
                    break out;
                }
            }
        };

        let mut dec = VideoDecoder::new().unwrap();
        // Delta before any keyframe: dropped, no surface.
        assert!(!dec.submit(&delta.data, false).unwrap());
        assert!(dec.present().is_none());

        // Keyframe gets us a surface with the right dimensions.
        let mut ready = dec.submit(&key.data, true).unwrap();
        if !ready {
            // Some decoders hold the first picture until the next unit.
            ready = dec.submit(&delta.data, false).unwrap();
        }
        assert!(ready);
        let (surface, w, h) = dec.present().unwrap();
        assert_eq!((w, h), (64, 64));
        assert_eq!(surface.len(), 64 * 64 * 3);
    }
}

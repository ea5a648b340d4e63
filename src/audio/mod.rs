//! Blocking audio I/O at 48 kHz mono in 20 ms frames.
//!
//! cpal drives the devices through callbacks; these wrappers bridge the
//! callbacks into blocking `read_frame`/`write_frame` calls so the voice
//! threads are paced by the hardware, the way the pipeline expects.

pub mod codec;
pub mod denoise;
pub mod jitter;

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::warn;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 1;
/// 20 ms at 48 kHz mono.
pub const FRAME_SIZE: usize = 960;

fn mono_config() -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: CHANNELS,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Pick an input device by index; -1 means the system default.
fn input_device(index: i32) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if index < 0 {
        return host
            .default_input_device()
            .context("no default audio input device");
    }
    host.input_devices()?
        .nth(index as usize)
        .with_context(|| format!("no audio input device at index {index}"))
}

fn output_device(index: i32) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if index < 0 {
        return host
            .default_output_device()
            .context("no default audio output device");
    }
    host.output_devices()?
        .nth(index as usize)
        .with_context(|| format!("no audio output device at index {index}"))
}

/// Device names for a settings UI, in index order.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devs| devs.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.output_devices()
        .map(|devs| devs.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

// ── Microphone capture ──

pub struct AudioCapture {
    frame_rx: mpsc::Receiver<Vec<f32>>,
    _stream: cpal::Stream,
}

impl AudioCapture {
    pub fn new(device_index: i32) -> Result<Self> {
        let device = input_device(device_index)?;
        // Bounded: if the send thread stalls, old frames are shed here
        // instead of growing a queue.
        let (tx, rx) = mpsc::sync_channel::<Vec<f32>>(8);

        let mut accum: Vec<f32> = Vec::with_capacity(FRAME_SIZE * 2);
        let stream = device.build_input_stream(
            &mono_config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                accum.extend_from_slice(data);
                while accum.len() >= FRAME_SIZE {
                    let frame: Vec<f32> = accum.drain(..FRAME_SIZE).collect();
                    let _ = tx.try_send(frame);
                }
            },
            |err| warn!("audio capture error: {err}"),
            None,
        )?;
        stream.play()?;
        Ok(Self {
            frame_rx: rx,
            _stream: stream,
        })
    }

    /// Block until the next 20 ms frame, or `None` on timeout so the caller
    /// can re-check its running flag.
    pub fn read_frame(&self, timeout: Duration) -> Option<Vec<f32>> {
        self.frame_rx.recv_timeout(timeout).ok()
    }
}

// ── Speaker playback ──

struct PlaybackShared {
    queue: Mutex<VecDeque<f32>>,
    space: Condvar,
}

pub struct AudioPlayback {
    shared: Arc<PlaybackShared>,
    _stream: cpal::Stream,
}

/// Keep at most two frames queued ahead of the hardware; `write_frame`
/// blocks past that, which is what paces the playback thread.
const PLAYBACK_HIGH_WATER: usize = FRAME_SIZE * 2;

impl AudioPlayback {
    pub fn new(device_index: i32) -> Result<Self> {
        let device = output_device(device_index)?;
        let shared = Arc::new(PlaybackShared {
            queue: Mutex::new(VecDeque::with_capacity(PLAYBACK_HIGH_WATER * 2)),
            space: Condvar::new(),
        });

        let cb_shared = shared.clone();
        let stream = device.build_output_stream(
            &mono_config(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = cb_shared.queue.lock().unwrap();
                for sample in data.iter_mut() {
                    *sample = queue.pop_front().unwrap_or(0.0);
                }
                drop(queue);
                cb_shared.space.notify_one();
            },
            |err| warn!("audio playback error: {err}"),
            None,
        )?;
        stream.play()?;
        Ok(Self {
            shared,
            _stream: stream,
        })
    }

    /// Queue one mixed frame, blocking while the device is still working
    /// through the previous ones. The timeout keeps a dead device from
    /// wedging the playback thread.
    pub fn write_frame(&self, pcm: &[f32]) {
        let mut queue = self.shared.queue.lock().unwrap();
        while queue.len() >= PLAYBACK_HIGH_WATER {
            let (q, timed_out) = self
                .shared
                .space
                .wait_timeout(queue, Duration::from_millis(200))
                .unwrap();
            queue = q;
            if timed_out.timed_out() {
                break;
            }
        }
        queue.extend(pcm.iter().copied());
    }
}

// ── System (loopback) audio capture ──

/// Captures what the machine is playing, for sharing alongside the screen.
///
/// Self-excluding loopback is not available through this backend, so capture
/// always runs in plain-loopback fallback mode; `excludes_self()` stays
/// false and the UI warns that shared audio may include the app's own output.
pub struct SystemAudioCapture {
    buffer: Arc<Mutex<VecDeque<f32>>>,
    excludes_self: bool,
    _stream: cpal::Stream,
}

/// About one second of backlog before old samples are shed.
const SYS_AUDIO_CAP: usize = SAMPLE_RATE as usize;

impl SystemAudioCapture {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .input_devices()?
            .find(|d| {
                d.name()
                    .map(|n| {
                        let n = n.to_lowercase();
                        n.contains("monitor") || n.contains("loopback") || n.contains("stereo mix")
                    })
                    .unwrap_or(false)
            })
            .context("no loopback capture device found")?;

        let config = device.default_input_config()?;
        let src_rate = config.sample_rate().0;
        let src_channels = config.channels() as usize;
        if config.sample_format() != cpal::SampleFormat::F32 {
            anyhow::bail!("loopback device does not produce float samples");
        }

        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(SYS_AUDIO_CAP)));
        let cb_buffer = buffer.clone();
        let mut resample_pos = 0f64;
        let step = src_rate as f64 / SAMPLE_RATE as f64;

        let stream = device.build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Downmix to mono, then walk the frame at the rate ratio.
                let frames = data.len() / src_channels;
                let mut out = cb_buffer.lock().unwrap();
                while (resample_pos as usize) < frames {
                    let frame = resample_pos as usize;
                    let mut sum = 0.0f32;
                    for ch in 0..src_channels {
                        sum += data[frame * src_channels + ch];
                    }
                    out.push_back(sum / src_channels as f32);
                    resample_pos += step;
                }
                resample_pos -= frames as f64;
                while out.len() > SYS_AUDIO_CAP {
                    out.pop_front();
                }
            },
            |err| warn!("system audio capture error: {err}"),
            None,
        )?;
        stream.play()?;

        Ok(Self {
            buffer,
            excludes_self: false,
            _stream: stream,
        })
    }

    /// Whether the capture path excludes this application's own playback.
    pub fn excludes_self(&self) -> bool {
        self.excludes_self
    }

    /// Drain whatever mono 48 kHz samples have arrived since the last call.
    pub fn read_samples(&self) -> Vec<f32> {
        let mut buf = self.buffer.lock().unwrap();
        buf.drain(..).collect()
    }
}

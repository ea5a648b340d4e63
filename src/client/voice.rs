//! The three voice workers: capture→encode→send, receive→decode→buffer,
//! and the mixer paced by blocking playback writes.
//!
//! Device streams are not `Send`, so each worker opens its own device and
//! reports the result back over a oneshot before entering its loop; a
//! failed open aborts the whole voice join.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::audio::codec::{VoiceDecoder, VoiceEncoder};
use crate::audio::denoise::Denoiser;
use crate::audio::jitter::JitterPop;
use crate::audio::{AudioCapture, AudioPlayback, FRAME_SIZE};
use crate::client::state::ClientShared;
use crate::protocol::{VoicePacket, MAX_VOICE_PACKET};

pub struct VoiceSession {
    send_thread: JoinHandle<()>,
    recv_thread: JoinHandle<()>,
    play_thread: JoinHandle<()>,
}

impl VoiceSession {
    /// Start the three workers. Resolves once both audio devices opened (or
    /// failed); on failure all threads are joined before the error returns.
    pub async fn start(
        shared: Arc<ClientShared>,
        udp: Arc<UdpSocket>,
        server_addr: SocketAddr,
        input_device: i32,
        output_device: i32,
    ) -> Result<Self> {
        let encoder = VoiceEncoder::new()?;
        let (capture_ready_tx, capture_ready_rx) = oneshot::channel();
        let (playback_ready_tx, playback_ready_rx) = oneshot::channel();

        let send_thread = {
            let shared = shared.clone();
            let udp = udp.clone();
            std::thread::spawn(move || {
                let capture = match AudioCapture::new(input_device) {
                    Ok(capture) => {
                        let _ = capture_ready_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = capture_ready_tx.send(Err(e));
                        return;
                    }
                };
                send_loop(shared, udp, server_addr, capture, encoder);
            })
        };
        let recv_thread = {
            let shared = shared.clone();
            std::thread::spawn(move || recv_loop(shared, udp))
        };
        let play_thread = std::thread::spawn(move || {
            let playback = match AudioPlayback::new(output_device) {
                Ok(playback) => {
                    let _ = playback_ready_tx.send(Ok(()));
                    playback
                }
                Err(e) => {
                    let _ = playback_ready_tx.send(Err(e));
                    return;
                }
            };
            play_loop(shared, playback);
        });

        let session = Self {
            send_thread,
            recv_thread,
            play_thread,
        };

        let capture_init = capture_ready_rx.await.unwrap_or_else(|_| {
            Err(anyhow::anyhow!("audio capture thread exited during init"))
        });
        let playback_init = playback_ready_rx.await.unwrap_or_else(|_| {
            Err(anyhow::anyhow!("audio playback thread exited during init"))
        });

        match capture_init.and(playback_init) {
            Ok(()) => Ok(session),
            Err(e) => {
                // Caller has not set in_voice yet; the loops see the flag
                // down and wind themselves up.
                let _ = tokio::task::spawn_blocking(move || session.join()).await;
                Err(e.context("opening audio devices"))
            }
        }
    }

    /// Blocks until all three workers have exited.
    pub fn join(self) {
        let _ = self.send_thread.join();
        let _ = self.recv_thread.join();
        let _ = self.play_thread.join();
    }
}

fn voice_active(shared: &ClientShared) -> bool {
    shared.running.load(Ordering::Acquire)
        && shared.connected.load(Ordering::Acquire)
        && shared.in_voice.load(Ordering::Acquire)
}

/// Wait out the join handshake: the threads start before `in_voice` flips.
fn wait_for_voice(shared: &ClientShared) -> bool {
    for _ in 0..50 {
        if voice_active(shared) {
            return true;
        }
        if !shared.running.load(Ordering::Acquire) || !shared.connected.load(Ordering::Acquire) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    voice_active(shared)
}

/// Paced by the capture device: one 20 ms frame per iteration.
fn send_loop(
    shared: Arc<ClientShared>,
    udp: Arc<UdpSocket>,
    server_addr: SocketAddr,
    capture: AudioCapture,
    mut encoder: VoiceEncoder,
) {
    if !wait_for_voice(&shared) {
        return;
    }
    let mut denoiser = Denoiser::new();
    let mut sequence: u32 = 0;

    while voice_active(&shared) {
        // Keep draining the device even while gated, so the stream stays
        // in sync and un-muting is instant.
        let Some(mut pcm) = capture.read_frame(Duration::from_millis(100)) else {
            continue;
        };

        let transmit = !shared.muted.load(Ordering::Acquire)
            && (!shared.ptt_enabled.load(Ordering::Acquire)
                || shared.ptt_active.load(Ordering::Acquire));
        if !transmit {
            continue;
        }

        if shared.noise_suppression.load(Ordering::Acquire) {
            denoiser.process(&mut pcm);
        }

        let opus = match encoder.encode(&pcm) {
            Ok(opus) => opus,
            Err(e) => {
                debug!("voice encode failed: {e}");
                continue;
            }
        };
        let packet = VoicePacket {
            sender_id: shared.my_id.load(Ordering::Acquire),
            sequence,
            opus,
        };
        sequence = sequence.wrapping_add(1);

        let bytes = packet.to_bytes();
        if bytes.len() > MAX_VOICE_PACKET {
            continue;
        }
        if let Err(e) = udp.send_to(&bytes, server_addr) {
            debug!("voice send failed: {e}");
        }
    }
}

/// Drains the socket (20 ms read timeout), decodes, and feeds the per-peer
/// jitter buffers.
fn recv_loop(shared: Arc<ClientShared>, udp: Arc<UdpSocket>) {
    if !wait_for_voice(&shared) {
        return;
    }
    let mut buf = [0u8; MAX_VOICE_PACKET];
    let my_id = shared.my_id.load(Ordering::Acquire);

    while voice_active(&shared) {
        let len = match udp.recv_from(&mut buf) {
            Ok((len, _src)) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                debug!("voice recv failed: {e}");
                continue;
            }
        };

        // Short datagrams are noise; so are our own reflected packets.
        let Some(packet) = VoicePacket::from_bytes(&buf[..len]) else {
            continue;
        };
        if packet.sender_id == my_id {
            continue;
        }

        shared.note_voice_activity(packet.sender_id);

        let mut voice_rx = shared.voice_rx.lock().unwrap();
        let state = &mut *voice_rx;
        let decoder = match state.decoders.entry(packet.sender_id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => match VoiceDecoder::new() {
                Ok(d) => v.insert(d),
                Err(e) => {
                    warn!("voice decoder init failed: {e}");
                    continue;
                }
            },
        };
        match decoder.decode(&packet.opus) {
            Ok(pcm) => state
                .buffers
                .entry(packet.sender_id)
                .or_default()
                .push(pcm),
            Err(e) => debug!("voice decode failed: {e}"),
        }
    }
}

/// Mixes one frame per cycle; the blocking device write paces the loop.
fn play_loop(shared: Arc<ClientShared>, playback: AudioPlayback) {
    if !wait_for_voice(&shared) {
        return;
    }
    while voice_active(&shared) {
        let mut mix = [0.0f32; FRAME_SIZE];

        {
            let mut voice_rx = shared.voice_rx.lock().unwrap();
            let state = &mut *voice_rx;
            for (&peer, buffer) in state.buffers.iter_mut() {
                let frame = match buffer.pop() {
                    JitterPop::Silence => continue,
                    JitterPop::Frame(pcm) => pcm,
                    JitterPop::Conceal => match state.decoders.get_mut(&peer) {
                        Some(decoder) => decoder.decode_plc(),
                        None => continue,
                    },
                };
                let volume = shared.volume(peer);
                for (out, sample) in mix.iter_mut().zip(frame.iter()) {
                    *out += sample * volume;
                }
            }
        }

        // One frame of the watched sharer's system audio, if present.
        {
            let mut sys = shared.sys_audio.lock().unwrap();
            if let Some(frame) = sys.frames.pop_front() {
                let volume = shared.stream_volume();
                for (out, sample) in mix.iter_mut().zip(frame.iter()) {
                    *out += sample * volume;
                }
            }
        }

        for sample in mix.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        playback.write_frame(&mix);
    }
}

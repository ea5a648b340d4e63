//! Screen sharing, both directions.
//!
//! Outgoing: a capture/encode thread paced at ~30 fps, a system-audio
//! encode thread, and a send task that drains their shared queue with the
//! same discipline as the server relay — audio first, then only the newest
//! video frame.
//!
//! Incoming: the reader task drops frames from the watched sharer into a
//! slot; the decode thread turns them into the published RGB surface.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scrap::{Capturer, Display};
use tracing::{debug, warn};

use crate::audio::codec::VoiceEncoder;
use crate::audio::{SystemAudioCapture, FRAME_SIZE};
use crate::client::state::{ClientShared, ScreenSendItem, ScreenSurface};
use crate::client::TcpSender;
use crate::protocol::{self, FLAG_KEYFRAME};
use crate::video::{VideoDecoder, VideoEncoder};

const CAPTURE_FPS: u32 = 30;
const FRAME_INTERVAL: Duration = Duration::from_millis(1000 / CAPTURE_FPS as u64);

pub struct ShareSession {
    capture_thread: std::thread::JoinHandle<()>,
    sys_audio_thread: std::thread::JoinHandle<()>,
    send_task: tokio::task::JoinHandle<()>,
}

impl ShareSession {
    /// `shared.sharing` must already be set; clearing it (from anywhere)
    /// winds the whole session down and SCREEN_STOP goes out on the way.
    pub fn start(shared: Arc<ClientShared>, sender: TcpSender) -> Self {
        let send_task = tokio::spawn(send_loop(shared.clone(), sender));
        let capture_thread = {
            let shared = shared.clone();
            std::thread::spawn(move || capture_loop(shared))
        };
        let sys_audio_thread = std::thread::spawn(move || sys_audio_loop(shared));
        Self {
            capture_thread,
            sys_audio_thread,
            send_task,
        }
    }

    pub async fn join(self) {
        let capture = self.capture_thread;
        let sys_audio = self.sys_audio_thread;
        let _ = tokio::task::spawn_blocking(move || {
            let _ = capture.join();
            let _ = sys_audio.join();
        })
        .await;
        let _ = self.send_task.await;
    }
}

fn share_active(shared: &ClientShared) -> bool {
    shared.running.load(Ordering::Acquire)
        && shared.connected.load(Ordering::Acquire)
        && shared.sharing.load(Ordering::Acquire)
}

/// Announce, then drain the send queue until the share ends; the stop
/// notice goes out from here no matter which side ended it.
async fn send_loop(shared: Arc<ClientShared>, sender: TcpSender) {
    sender.send(&protocol::make_screen_start()).await;

    while share_active(&shared) {
        let batch: Vec<ScreenSendItem> = {
            let mut queue = shared.screen_send.lock().unwrap();
            queue.drain(..).collect()
        };
        if batch.is_empty() {
            let _ = tokio::time::timeout(
                Duration::from_millis(5),
                shared.screen_send_notify.notified(),
            )
            .await;
            continue;
        }

        // Audio is small and latency-sensitive: all of it, in order.
        for item in batch.iter().filter(|i| i.is_audio) {
            sender.send(&item.data).await;
        }
        // Video: newest frame only; older ones are already stale.
        if let Some(item) = batch.iter().rev().find(|i| !i.is_audio) {
            sender.send(&item.data).await;
        }
    }

    shared.screen_send.lock().unwrap().clear();
    if shared.connected.load(Ordering::Acquire) {
        sender.send(&protocol::make_screen_stop()).await;
    }
}

fn enqueue(shared: &ClientShared, data: Vec<u8>, is_audio: bool) {
    shared
        .screen_send
        .lock()
        .unwrap()
        .push_back(ScreenSendItem { data, is_audio });
    shared.screen_send_notify.notify_one();
}

/// Pick a target bitrate from the capture resolution.
fn auto_bitrate(width: u32, height: u32) -> u32 {
    match width * height {
        p if p >= 3_686_400 => 30_000_000, // 2560x1440 and up
        p if p >= 2_073_600 => 18_000_000, // 1920x1080
        p if p >= 921_600 => 10_000_000,   // 1280x720
        _ => 6_000_000,
    }
}

fn abort_share(shared: &ClientShared, message: String) {
    warn!("{message}");
    shared.add_system_msg(message);
    shared.sharing.store(false, Ordering::Release);
    shared.screen_send_notify.notify_waiters();
}

fn capture_loop(shared: Arc<ClientShared>) {
    let display = match Display::primary() {
        Ok(d) => d,
        Err(e) => return abort_share(&shared, format!("Screen capture init failed: {e}")),
    };
    let src_w = display.width();
    let src_h = display.height();
    // 4:2:0 needs even dimensions; crop a stray edge pixel.
    let enc_w = (src_w & !1) as u32;
    let enc_h = (src_h & !1) as u32;

    let mut bitrate = shared.video_bitrate.load(Ordering::Acquire);
    if bitrate == 0 {
        bitrate = auto_bitrate(enc_w, enc_h);
        shared.video_bitrate.store(bitrate, Ordering::Release);
    }

    let mut encoder = match VideoEncoder::new(enc_w, enc_h, CAPTURE_FPS, bitrate) {
        Ok(e) => e,
        Err(e) => return abort_share(&shared, format!("Screen encoder init failed: {e}")),
    };
    let mut capturer = match Capturer::new(display) {
        Ok(c) => c,
        Err(e) => return abort_share(&shared, format!("Screen capture init failed: {e}")),
    };

    let mut next_frame = Instant::now();
    while share_active(&shared) {
        next_frame += FRAME_INTERVAL;

        // Backpressure: while a video frame is still queued, skip this one
        // rather than pile more behind a slow link.
        let has_pending_video = shared
            .screen_send
            .lock()
            .unwrap()
            .iter()
            .any(|item| !item.is_audio);
        if !has_pending_video {
            let new_bitrate = shared.video_bitrate.load(Ordering::Acquire);
            if new_bitrate != bitrate && new_bitrate != 0 {
                bitrate = new_bitrate;
                encoder.set_bitrate(bitrate);
            }

            match capturer.frame() {
                Ok(frame) => {
                    let stride = frame.len() / src_h;
                    let force_idr = shared.force_keyframe.swap(false, Ordering::AcqRel);
                    match encoder.encode_bgra(&frame, stride, force_idr) {
                        Ok(Some(encoded)) => {
                            let flags = if encoded.keyframe { FLAG_KEYFRAME } else { 0 };
                            let msg = protocol::make_screen_frame(
                                enc_w as u16,
                                enc_h as u16,
                                flags,
                                &encoded.data,
                            );
                            enqueue(&shared, msg, false);
                        }
                        Ok(None) => {} // encoder elided the frame
                        Err(e) => debug!("screen encode failed: {e}"),
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Frame not ready yet.
                }
                Err(e) => {
                    debug!("screen capture error: {e}");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }

        let now = Instant::now();
        if next_frame > now {
            std::thread::sleep(next_frame - now);
        } else {
            next_frame = now;
        }
    }
}

/// Loopback capture → accumulate 20 ms frames → Opus → audio queue.
fn sys_audio_loop(shared: Arc<ClientShared>) {
    let capture = match SystemAudioCapture::new() {
        Ok(c) => c,
        Err(e) => {
            shared.add_system_msg(format!("System audio capture unavailable: {e}"));
            return;
        }
    };
    if capture.excludes_self() {
        shared.add_system_msg("System audio: capturing (own audio excluded).");
    } else {
        shared.add_system_msg(
            "System audio: fallback mode (shared audio may include this app's output).",
        );
    }

    let mut encoder = match VoiceEncoder::new() {
        Ok(e) => e,
        Err(e) => {
            shared.add_system_msg(format!("System audio encoder failed: {e}"));
            return;
        }
    };

    let mut accum: Vec<f32> = Vec::with_capacity(FRAME_SIZE * 2);
    while share_active(&shared) {
        let samples = capture.read_samples();
        if samples.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        accum.extend_from_slice(&samples);

        while accum.len() >= FRAME_SIZE {
            let frame: Vec<f32> = accum.drain(..FRAME_SIZE).collect();
            match encoder.encode(&frame) {
                Ok(opus) => enqueue(&shared, protocol::make_screen_audio(&opus), true),
                Err(e) => debug!("system audio encode failed: {e}"),
            }
        }
    }
}

/// Decode worker for the incoming share. Waits on the frame slot, decodes,
/// and republishes the display surface.
pub fn spawn_decode_thread(shared: Arc<ClientShared>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut decoder = match VideoDecoder::new() {
            Ok(d) => d,
            Err(e) => {
                shared.add_system_msg(format!("Screen decoder init failed: {e}"));
                return;
            }
        };

        while shared.running.load(Ordering::Acquire) && shared.connected.load(Ordering::Acquire) {
            let (data, flags) = {
                let slot = shared.screen_frame.lock().unwrap();
                let (mut slot, _timeout) = shared
                    .screen_frame_cv
                    .wait_timeout(slot, Duration::from_millis(200))
                    .unwrap();
                if !slot.fresh || slot.data.is_empty() {
                    continue;
                }
                slot.fresh = false;
                (std::mem::take(&mut slot.data), slot.flags)
            };

            let is_keyframe = flags & FLAG_KEYFRAME != 0;
            match decoder.submit(&data, is_keyframe) {
                Ok(true) => {
                    if let Some((rgb, width, height)) = decoder.present() {
                        let surface = Arc::new(ScreenSurface {
                            rgb: rgb.to_vec(),
                            width,
                            height,
                        });
                        *shared.surface.lock().unwrap() = Some(surface);
                    }
                }
                Ok(false) => {}
                // One bad frame is transient; the stream recovers on the
                // next keyframe.
                Err(e) => debug!("screen decode failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_bitrate_tiers() {
        assert_eq!(auto_bitrate(2560, 1440), 30_000_000);
        assert_eq!(auto_bitrate(1920, 1080), 18_000_000);
        assert_eq!(auto_bitrate(1280, 720), 10_000_000);
        assert_eq!(auto_bitrate(640, 480), 6_000_000);
    }

    #[test]
    fn test_send_queue_priority_shape() {
        // The send loop sends every audio item and only the newest video.
        let shared = ClientShared::new();
        enqueue(&shared, vec![1], false);
        enqueue(&shared, vec![2], true);
        enqueue(&shared, vec![3], false);
        enqueue(&shared, vec![4], true);

        let batch: Vec<ScreenSendItem> = shared.screen_send.lock().unwrap().drain(..).collect();
        let audio: Vec<u8> = batch
            .iter()
            .filter(|i| i.is_audio)
            .map(|i| i.data[0])
            .collect();
        let newest_video = batch.iter().rev().find(|i| !i.is_audio).unwrap();
        assert_eq!(audio, vec![2, 4]);
        assert_eq!(newest_video.data[0], 3);
    }
}

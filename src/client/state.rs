//! State shared between the client's pipeline workers and the UI.
//!
//! The UI only ever sees published snapshots taken under these locks; it
//! never reaches into a worker. Each concern gets its own lock so the audio
//! path never waits on chat, and none of them is held across codec or
//! network calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::audio::codec::VoiceDecoder;
use crate::audio::jitter::JitterBuffer;

/// Compared against server update notices.
pub const APP_VERSION: &str = "0.3.0";

/// A peer is "talking" if a voice packet arrived within this window.
pub const TALKING_WINDOW: Duration = Duration::from_millis(300);

const MAX_CHAT_MESSAGES: usize = 5000;
/// Received system-audio frames buffered ahead of the mixer.
const SYS_AUDIO_MAX_FRAMES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthState {
    Disconnected = 0,
    ConnectedUnauth = 1,
    LoggingIn = 2,
    Registering = 3,
    Authenticated = 4,
}

impl AuthState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => AuthState::ConnectedUnauth,
            2 => AuthState::LoggingIn,
            3 => AuthState::Registering,
            4 => AuthState::Authenticated,
            _ => AuthState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub id: u32,
    pub name: String,
    pub in_voice: bool,
    pub is_sharing: bool,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender_id: u32,
    pub sender_name: String,
    pub text: String,
    pub is_system: bool,
    pub seq: u64,
    pub timestamp: i64,
}

/// Decoded screen frame ready for display.
pub struct ScreenSurface {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One entry in the outgoing screen-share queue: a fully framed message.
pub struct ScreenSendItem {
    pub data: Vec<u8>,
    pub is_audio: bool,
}

/// Latest received screen frame awaiting the decode thread.
#[derive(Default)]
pub struct ScreenFrameSlot {
    pub data: Vec<u8>,
    pub flags: u8,
    pub fresh: bool,
}

/// Per-peer voice receive state; one lock covers both maps since every
/// access needs the decoder and buffer together.
#[derive(Default)]
pub struct VoiceReceiveState {
    pub buffers: HashMap<u32, JitterBuffer>,
    pub decoders: HashMap<u32, VoiceDecoder>,
}

#[derive(Default)]
pub struct SystemAudioState {
    pub frames: VecDeque<Vec<f32>>,
    pub decoder: Option<VoiceDecoder>,
}

impl SystemAudioState {
    pub fn push_frame(&mut self, frame: Vec<f32>) {
        self.frames.push_back(frame);
        while self.frames.len() > SYS_AUDIO_MAX_FRAMES {
            self.frames.pop_front();
        }
    }
}

pub struct ClientShared {
    pub running: AtomicBool,
    pub connected: AtomicBool,
    auth_state: AtomicU8,
    pub my_id: AtomicU32,
    pub in_voice: AtomicBool,
    pub sharing: AtomicBool,
    /// Sharer currently being watched; 0 = none.
    pub watching: AtomicU32,

    pub muted: AtomicBool,
    pub ptt_enabled: AtomicBool,
    pub ptt_active: AtomicBool,
    pub noise_suppression: AtomicBool,

    /// Set by SCREEN_REQUEST_KEYFRAME; consumed by the capture loop.
    pub force_keyframe: AtomicBool,
    /// 0 = pick from resolution.
    pub video_bitrate: AtomicU32,

    pub users: Mutex<Vec<UserEntry>>,
    pub chat: Mutex<Vec<ChatMessage>>,
    pub last_known_seq: AtomicU64,
    pub auth_error: Mutex<String>,
    pub update: Mutex<Option<(String, String)>>,

    pub volumes: Mutex<HashMap<u32, f32>>,
    /// Volume applied to received system audio, stored as milli-units.
    stream_volume_milli: AtomicU32,

    pub voice_rx: Mutex<VoiceReceiveState>,
    pub voice_last_seen: Mutex<HashMap<u32, Instant>>,
    pub sys_audio: Mutex<SystemAudioState>,

    pub screen_send: Mutex<VecDeque<ScreenSendItem>>,
    pub screen_send_notify: Notify,
    pub screen_frame: Mutex<ScreenFrameSlot>,
    pub screen_frame_cv: Condvar,
    pub surface: Mutex<Option<Arc<ScreenSurface>>>,
}

impl ClientShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            auth_state: AtomicU8::new(AuthState::Disconnected as u8),
            my_id: AtomicU32::new(0),
            in_voice: AtomicBool::new(false),
            sharing: AtomicBool::new(false),
            watching: AtomicU32::new(0),
            muted: AtomicBool::new(false),
            ptt_enabled: AtomicBool::new(false),
            ptt_active: AtomicBool::new(false),
            noise_suppression: AtomicBool::new(false),
            force_keyframe: AtomicBool::new(false),
            video_bitrate: AtomicU32::new(0),
            users: Mutex::new(Vec::new()),
            chat: Mutex::new(Vec::new()),
            last_known_seq: AtomicU64::new(0),
            auth_error: Mutex::new(String::new()),
            update: Mutex::new(None),
            volumes: Mutex::new(HashMap::new()),
            stream_volume_milli: AtomicU32::new(1000),
            voice_rx: Mutex::new(VoiceReceiveState::default()),
            voice_last_seen: Mutex::new(HashMap::new()),
            sys_audio: Mutex::new(SystemAudioState::default()),
            screen_send: Mutex::new(VecDeque::new()),
            screen_send_notify: Notify::new(),
            screen_frame: Mutex::new(ScreenFrameSlot::default()),
            screen_frame_cv: Condvar::new(),
            surface: Mutex::new(None),
        })
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState::from_u8(self.auth_state.load(Ordering::Acquire))
    }

    pub fn set_auth_state(&self, state: AuthState) {
        self.auth_state.store(state as u8, Ordering::Release);
    }

    pub fn add_system_msg(&self, text: impl Into<String>) {
        let mut chat = self.chat.lock().unwrap();
        chat.push(ChatMessage {
            sender_id: 0,
            sender_name: String::new(),
            text: text.into(),
            is_system: true,
            seq: 0,
            timestamp: 0,
        });
        if chat.len() > MAX_CHAT_MESSAGES {
            chat.remove(0);
        }
    }

    pub fn add_chat_msg(
        &self,
        sender_id: u32,
        sender_name: &str,
        text: &str,
        seq: u64,
        timestamp: i64,
    ) {
        let mut chat = self.chat.lock().unwrap();
        chat.push(ChatMessage {
            sender_id,
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            is_system: false,
            seq,
            timestamp,
        });
        if chat.len() > MAX_CHAT_MESSAGES {
            chat.remove(0);
        }
    }

    pub fn volume(&self, id: u32) -> f32 {
        *self.volumes.lock().unwrap().get(&id).unwrap_or(&1.0)
    }

    /// Per-peer volume slider, clamped to 0–2x.
    pub fn set_volume(&self, id: u32, volume: f32) {
        self.volumes
            .lock()
            .unwrap()
            .insert(id, volume.clamp(0.0, 2.0));
    }

    pub fn stream_volume(&self) -> f32 {
        self.stream_volume_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn set_stream_volume(&self, volume: f32) {
        let milli = (volume.clamp(0.0, 2.0) * 1000.0) as u32;
        self.stream_volume_milli.store(milli, Ordering::Relaxed);
    }

    pub fn username_of(&self, id: u32) -> String {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| format!("User #{id}"))
    }

    pub fn note_voice_activity(&self, id: u32) {
        self.voice_last_seen
            .lock()
            .unwrap()
            .insert(id, Instant::now());
    }

    /// Peers with voice packets inside the talking window.
    pub fn talking_peers(&self) -> Vec<u32> {
        let now = Instant::now();
        self.voice_last_seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, &seen)| now.duration_since(seen) <= TALKING_WINDOW)
            .map(|(&id, _)| id)
            .collect()
    }

    // ── UI snapshots ──

    pub fn users_snapshot(&self) -> Vec<UserEntry> {
        self.users.lock().unwrap().clone()
    }

    pub fn chat_snapshot(&self) -> Vec<ChatMessage> {
        self.chat.lock().unwrap().clone()
    }

    pub fn surface_snapshot(&self) -> Option<Arc<ScreenSurface>> {
        self.surface.lock().unwrap().clone()
    }

    pub fn update_notice(&self) -> Option<(String, String)> {
        self.update.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_caps_at_limit() {
        let shared = ClientShared::new();
        for i in 0..(MAX_CHAT_MESSAGES + 10) {
            shared.add_system_msg(format!("msg {i}"));
        }
        let chat = shared.chat_snapshot();
        assert_eq!(chat.len(), MAX_CHAT_MESSAGES);
        assert_eq!(chat.last().unwrap().text, format!("msg {}", MAX_CHAT_MESSAGES + 9));
    }

    #[test]
    fn test_volume_defaults_and_clamps() {
        let shared = ClientShared::new();
        assert_eq!(shared.volume(5), 1.0);
        shared.set_volume(5, 3.5);
        assert_eq!(shared.volume(5), 2.0);
        shared.set_volume(5, -1.0);
        assert_eq!(shared.volume(5), 0.0);
    }

    #[test]
    fn test_talking_window() {
        let shared = ClientShared::new();
        shared.note_voice_activity(7);
        assert_eq!(shared.talking_peers(), vec![7]);
        shared
            .voice_last_seen
            .lock()
            .unwrap()
            .insert(8, Instant::now() - TALKING_WINDOW - Duration::from_millis(50));
        assert!(!shared.talking_peers().contains(&8));
    }

    #[test]
    fn test_sys_audio_backlog_capped() {
        let mut state = SystemAudioState::default();
        for i in 0..12 {
            state.push_frame(vec![i as f32]);
        }
        assert_eq!(state.frames.len(), SYS_AUDIO_MAX_FRAMES);
        assert_eq!(state.frames.front().unwrap()[0], 4.0);
    }
}

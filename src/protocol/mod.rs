//! Binary wire protocol shared by the client and the relay server.
//!
//! Every control message is `type(1) ‖ payload_len(4 LE) ‖ payload`. Strings
//! on the wire are NUL-terminated UTF-8 unless the field carries its own
//! length. The numeric message codes are load-bearing for interop — do not
//! renumber.

pub mod chat_log;

/// TCP signal header: type byte + little-endian payload length.
pub const HEADER_SIZE: usize = 5;

/// Hard ceiling on a control payload. Large enough for any I-frame.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;
/// Auth messages are small; anything bigger during the handshake is hostile.
pub const MAX_AUTH_PAYLOAD: usize = 4096;

pub const MAX_USERNAME_LEN: usize = 32;
pub const MAX_CHAT_LEN: usize = 512;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;
pub const SESSION_TOKEN_SIZE: usize = 32;

/// UDP voice packet: `sender_id(4 LE) ‖ sequence(4 LE) ‖ opus`.
pub const VOICE_HEADER_SIZE: usize = 8;
pub const MAX_VOICE_PACKET: usize = 1400;

/// Bit 0 of a SCREEN_FRAME flags byte: the payload is an H.264 IDR.
pub const FLAG_KEYFRAME: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Join = 0x01,
    Welcome = 0x02,
    UserJoined = 0x03,
    UserLeft = 0x04,
    Leave = 0x05,
    TextChat = 0x06,
    ScreenStart = 0x07,
    ScreenStop = 0x08,
    ScreenSubscribe = 0x09,
    ScreenUnsubscribe = 0x0A,
    ScreenFrame = 0x0B,
    ScreenAudio = 0x0C,
    UpdateAvailable = 0x0D,
    VoiceJoin = 0x0E,
    VoiceLeave = 0x0F,
    VoiceJoined = 0x10,
    VoiceLeft = 0x11,
    ChatSync = 0x12,
    ScreenRequestKeyframe = 0x13,
    AuthRegisterReq = 0x20,
    AuthRegisterResp = 0x21,
    AuthLoginReq = 0x22,
    AuthLoginResp = 0x23,
    AuthTokenLoginReq = 0x24,
    AuthTokenLoginResp = 0x25,
    AuthChangePassReq = 0x26,
    AuthChangePassResp = 0x27,
    AuthDeleteAcctReq = 0x28,
    AuthDeleteAcctResp = 0x29,
    AuthLogout = 0x2A,
}

impl MsgType {
    pub fn from_u8(b: u8) -> Option<Self> {
        use MsgType::*;
        Some(match b {
            0x01 => Join,
            0x02 => Welcome,
            0x03 => UserJoined,
            0x04 => UserLeft,
            0x05 => Leave,
            0x06 => TextChat,
            0x07 => ScreenStart,
            0x08 => ScreenStop,
            0x09 => ScreenSubscribe,
            0x0A => ScreenUnsubscribe,
            0x0B => ScreenFrame,
            0x0C => ScreenAudio,
            0x0D => UpdateAvailable,
            0x0E => VoiceJoin,
            0x0F => VoiceLeave,
            0x10 => VoiceJoined,
            0x11 => VoiceLeft,
            0x12 => ChatSync,
            0x13 => ScreenRequestKeyframe,
            0x20 => AuthRegisterReq,
            0x21 => AuthRegisterResp,
            0x22 => AuthLoginReq,
            0x23 => AuthLoginResp,
            0x24 => AuthTokenLoginReq,
            0x25 => AuthTokenLoginResp,
            0x26 => AuthChangePassReq,
            0x27 => AuthChangePassResp,
            0x28 => AuthDeleteAcctReq,
            0x29 => AuthDeleteAcctResp,
            0x2A => AuthLogout,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthStatus {
    Ok = 0x00,
    UsernameTaken = 0x01,
    InvalidCreds = 0x02,
    TokenExpired = 0x03,
    RateLimited = 0x04,
    InvalidInput = 0x05,
    Internal = 0x06,
}

impl AuthStatus {
    pub fn from_u8(b: u8) -> Option<Self> {
        use AuthStatus::*;
        Some(match b {
            0x00 => Ok,
            0x01 => UsernameTaken,
            0x02 => InvalidCreds,
            0x03 => TokenExpired,
            0x04 => RateLimited,
            0x05 => InvalidInput,
            0x06 => Internal,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub payload_len: u32,
}

pub fn serialize_header(h: Header) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = h.msg_type as u8;
    buf[1..5].copy_from_slice(&h.payload_len.to_le_bytes());
    buf
}

pub fn deserialize_header(buf: &[u8; HEADER_SIZE]) -> Option<Header> {
    Some(Header {
        msg_type: MsgType::from_u8(buf[0])?,
        payload_len: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
    })
}

// ── Little-endian field helpers ──

pub fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let b = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

pub fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let b = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at + 8)?;
    Some(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

/// Read a NUL-terminated UTF-8 string starting at `at`.
/// Returns the string and the offset just past the terminator.
pub fn read_cstr(buf: &[u8], at: usize) -> Option<(String, usize)> {
    let rest = buf.get(at..)?;
    let nul = rest.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&rest[..nul]).ok()?;
    Some((s.to_string(), at + nul + 1))
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Frame a payload under the given message type.
fn frame(msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&serialize_header(Header {
        msg_type,
        payload_len: payload.len() as u32,
    }));
    buf.extend_from_slice(payload);
    buf
}

fn truncate_to(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Room / presence messages ──

pub fn make_join(username: &str) -> Vec<u8> {
    let mut p = Vec::new();
    push_cstr(&mut p, truncate_to(username, MAX_USERNAME_LEN));
    frame(MsgType::Join, &p)
}

pub fn make_welcome(client_id: u32, udp_port: u16) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&client_id.to_le_bytes());
    p.extend_from_slice(&udp_port.to_le_bytes());
    frame(MsgType::Welcome, &p)
}

pub fn make_user_joined(client_id: u32, username: &str) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&client_id.to_le_bytes());
    push_cstr(&mut p, truncate_to(username, MAX_USERNAME_LEN));
    frame(MsgType::UserJoined, &p)
}

pub fn make_user_left(client_id: u32) -> Vec<u8> {
    frame(MsgType::UserLeft, &client_id.to_le_bytes())
}

pub fn make_leave() -> Vec<u8> {
    frame(MsgType::Leave, &[])
}

pub fn parse_user_joined(payload: &[u8]) -> Option<(u32, String)> {
    let id = read_u32(payload, 0)?;
    let (name, _) = read_cstr(payload, 4)?;
    Some((id, name))
}

// ── Text chat ──

/// Client → server: just the text.
pub fn make_text_chat(text: &str) -> Vec<u8> {
    let mut p = Vec::new();
    push_cstr(&mut p, truncate_to(text, MAX_CHAT_LEN));
    frame(MsgType::TextChat, &p)
}

/// Server → all: `seq(8) ‖ sender_id(4) ‖ ts(8) ‖ name\0 ‖ text\0`.
pub fn make_text_chat_broadcast(
    seq: u64,
    sender_id: u32,
    timestamp: i64,
    sender_name: &str,
    text: &str,
) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&seq.to_le_bytes());
    p.extend_from_slice(&sender_id.to_le_bytes());
    p.extend_from_slice(&(timestamp as u64).to_le_bytes());
    push_cstr(&mut p, truncate_to(sender_name, MAX_USERNAME_LEN));
    push_cstr(&mut p, truncate_to(text, MAX_CHAT_LEN));
    frame(MsgType::TextChat, &p)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatBroadcast {
    pub seq: u64,
    pub sender_id: u32,
    pub timestamp: i64,
    pub sender_name: String,
    pub text: String,
}

pub fn parse_text_chat_broadcast(payload: &[u8]) -> Option<ChatBroadcast> {
    let seq = read_u64(payload, 0)?;
    let sender_id = read_u32(payload, 8)?;
    let timestamp = read_u64(payload, 12)? as i64;
    let (sender_name, next) = read_cstr(payload, 20)?;
    let (text, _) = read_cstr(payload, next)?;
    Some(ChatBroadcast {
        seq,
        sender_id,
        timestamp,
        sender_name,
        text,
    })
}

pub fn make_chat_sync(last_seq: u64) -> Vec<u8> {
    frame(MsgType::ChatSync, &last_seq.to_le_bytes())
}

// ── Voice channel membership ──

pub fn make_voice_join() -> Vec<u8> {
    frame(MsgType::VoiceJoin, &[])
}

pub fn make_voice_leave() -> Vec<u8> {
    frame(MsgType::VoiceLeave, &[])
}

pub fn make_voice_joined(client_id: u32) -> Vec<u8> {
    frame(MsgType::VoiceJoined, &client_id.to_le_bytes())
}

pub fn make_voice_left(client_id: u32) -> Vec<u8> {
    frame(MsgType::VoiceLeft, &client_id.to_le_bytes())
}

// ── Screen sharing ──

pub fn make_screen_start() -> Vec<u8> {
    frame(MsgType::ScreenStart, &[])
}

pub fn make_screen_start_broadcast(sharer_id: u32) -> Vec<u8> {
    frame(MsgType::ScreenStart, &sharer_id.to_le_bytes())
}

pub fn make_screen_stop() -> Vec<u8> {
    frame(MsgType::ScreenStop, &[])
}

pub fn make_screen_stop_broadcast(sharer_id: u32) -> Vec<u8> {
    frame(MsgType::ScreenStop, &sharer_id.to_le_bytes())
}

pub fn make_screen_subscribe(target_id: u32) -> Vec<u8> {
    frame(MsgType::ScreenSubscribe, &target_id.to_le_bytes())
}

pub fn make_screen_unsubscribe(target_id: u32) -> Vec<u8> {
    frame(MsgType::ScreenUnsubscribe, &target_id.to_le_bytes())
}

pub fn make_screen_request_keyframe() -> Vec<u8> {
    frame(MsgType::ScreenRequestKeyframe, &[])
}

/// Client → server: `w(2) ‖ h(2) ‖ flags(1) ‖ h264`.
pub fn make_screen_frame(width: u16, height: u16, flags: u8, h264: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(5 + h264.len());
    p.extend_from_slice(&width.to_le_bytes());
    p.extend_from_slice(&height.to_le_bytes());
    p.push(flags);
    p.extend_from_slice(h264);
    frame(MsgType::ScreenFrame, &p)
}

/// Server → subscribers: `sharer(4) ‖ w(2) ‖ h(2) ‖ flags(1) ‖ h264`.
pub fn make_screen_frame_relay(
    sharer_id: u32,
    width: u16,
    height: u16,
    flags: u8,
    h264: &[u8],
) -> Vec<u8> {
    let mut p = Vec::with_capacity(9 + h264.len());
    p.extend_from_slice(&sharer_id.to_le_bytes());
    p.extend_from_slice(&width.to_le_bytes());
    p.extend_from_slice(&height.to_le_bytes());
    p.push(flags);
    p.extend_from_slice(h264);
    frame(MsgType::ScreenFrame, &p)
}

#[derive(Debug, Clone)]
pub struct ScreenFrame<'a> {
    pub width: u16,
    pub height: u16,
    pub flags: u8,
    pub h264: &'a [u8],
}

pub fn parse_screen_frame(payload: &[u8]) -> Option<ScreenFrame<'_>> {
    if payload.len() < 5 {
        return None;
    }
    Some(ScreenFrame {
        width: read_u16(payload, 0)?,
        height: read_u16(payload, 2)?,
        flags: payload[4],
        h264: &payload[5..],
    })
}

pub fn parse_screen_frame_relay(payload: &[u8]) -> Option<(u32, ScreenFrame<'_>)> {
    if payload.len() < 9 {
        return None;
    }
    let sharer = read_u32(payload, 0)?;
    Some((sharer, parse_screen_frame(&payload[4..])?))
}

/// Client → server: bare opus packet.
pub fn make_screen_audio(opus: &[u8]) -> Vec<u8> {
    frame(MsgType::ScreenAudio, opus)
}

/// Server → subscribers: `sharer(4) ‖ opus`.
pub fn make_screen_audio_relay(sharer_id: u32, opus: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(4 + opus.len());
    p.extend_from_slice(&sharer_id.to_le_bytes());
    p.extend_from_slice(opus);
    frame(MsgType::ScreenAudio, &p)
}

pub fn parse_screen_audio_relay(payload: &[u8]) -> Option<(u32, &[u8])> {
    if payload.len() <= 4 {
        return None;
    }
    Some((read_u32(payload, 0)?, &payload[4..]))
}

// ── Update notification ──

pub fn make_update_available(version: &str, url: &str) -> Vec<u8> {
    let mut p = Vec::new();
    push_cstr(&mut p, version);
    push_cstr(&mut p, url);
    frame(MsgType::UpdateAvailable, &p)
}

pub fn parse_update_available(payload: &[u8]) -> Option<(String, String)> {
    let (version, next) = read_cstr(payload, 0)?;
    let (url, _) = read_cstr(payload, next)?;
    Some((version, url))
}

// ── Authentication ──

/// `username\0 ‖ password\0` — shared by register and login requests.
fn make_credentials(msg_type: MsgType, username: &str, password: &str) -> Vec<u8> {
    let mut p = Vec::new();
    push_cstr(&mut p, truncate_to(username, MAX_USERNAME_LEN));
    push_cstr(&mut p, truncate_to(password, MAX_PASSWORD_LEN));
    frame(msg_type, &p)
}

pub fn make_auth_register_req(username: &str, password: &str) -> Vec<u8> {
    make_credentials(MsgType::AuthRegisterReq, username, password)
}

pub fn make_auth_login_req(username: &str, password: &str) -> Vec<u8> {
    make_credentials(MsgType::AuthLoginReq, username, password)
}

pub fn parse_credentials(payload: &[u8]) -> Option<(String, String)> {
    let (username, next) = read_cstr(payload, 0)?;
    let (password, _) = read_cstr(payload, next)?;
    Some((username, password))
}

pub fn make_auth_token_login_req(username: &str, token: &[u8; SESSION_TOKEN_SIZE]) -> Vec<u8> {
    let mut p = Vec::new();
    push_cstr(&mut p, truncate_to(username, MAX_USERNAME_LEN));
    p.extend_from_slice(token);
    frame(MsgType::AuthTokenLoginReq, &p)
}

pub fn parse_token_login_req(payload: &[u8]) -> Option<(String, [u8; SESSION_TOKEN_SIZE])> {
    let (username, next) = read_cstr(payload, 0)?;
    let raw = payload.get(next..next + SESSION_TOKEN_SIZE)?;
    let mut token = [0u8; SESSION_TOKEN_SIZE];
    token.copy_from_slice(raw);
    Some((username, token))
}

/// `status(1) ‖ message\0` — register / change-pass / delete responses.
pub fn make_auth_status_resp(msg_type: MsgType, status: AuthStatus, message: &str) -> Vec<u8> {
    let mut p = Vec::new();
    p.push(status as u8);
    push_cstr(&mut p, message);
    frame(msg_type, &p)
}

pub fn parse_auth_status_resp(payload: &[u8]) -> Option<(AuthStatus, String)> {
    let status = AuthStatus::from_u8(*payload.first()?)?;
    let (message, _) = read_cstr(payload, 1)?;
    Some((status, message))
}

/// `status(1) ‖ client_id(4) ‖ udp_port(2) ‖ token(32) ‖ message\0` — login
/// and token-login responses share the layout.
pub fn make_auth_login_resp(
    msg_type: MsgType,
    status: AuthStatus,
    client_id: u32,
    udp_port: u16,
    token: &[u8; SESSION_TOKEN_SIZE],
    message: &str,
) -> Vec<u8> {
    let mut p = Vec::new();
    p.push(status as u8);
    p.extend_from_slice(&client_id.to_le_bytes());
    p.extend_from_slice(&udp_port.to_le_bytes());
    p.extend_from_slice(token);
    push_cstr(&mut p, message);
    frame(msg_type, &p)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResp {
    pub status: AuthStatus,
    pub client_id: u32,
    pub udp_port: u16,
    pub token: [u8; SESSION_TOKEN_SIZE],
    pub message: String,
}

pub fn parse_auth_login_resp(payload: &[u8]) -> Option<LoginResp> {
    let status = AuthStatus::from_u8(*payload.first()?)?;
    let client_id = read_u32(payload, 1)?;
    let udp_port = read_u16(payload, 5)?;
    let raw = payload.get(7..7 + SESSION_TOKEN_SIZE)?;
    let mut token = [0u8; SESSION_TOKEN_SIZE];
    token.copy_from_slice(raw);
    let (message, _) = read_cstr(payload, 7 + SESSION_TOKEN_SIZE)?;
    Some(LoginResp {
        status,
        client_id,
        udp_port,
        token,
        message,
    })
}

pub fn make_auth_change_pass_req(old_password: &str, new_password: &str) -> Vec<u8> {
    let mut p = Vec::new();
    push_cstr(&mut p, old_password);
    push_cstr(&mut p, new_password);
    frame(MsgType::AuthChangePassReq, &p)
}

pub fn make_auth_delete_acct_req(password: &str) -> Vec<u8> {
    let mut p = Vec::new();
    push_cstr(&mut p, password);
    frame(MsgType::AuthDeleteAcctReq, &p)
}

pub fn make_auth_logout() -> Vec<u8> {
    frame(MsgType::AuthLogout, &[])
}

// ── UDP voice packet ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub sender_id: u32,
    pub sequence: u32,
    pub opus: Vec<u8>,
}

impl VoicePacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VOICE_HEADER_SIZE + self.opus.len());
        buf.extend_from_slice(&self.sender_id.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.opus);
        buf
    }

    /// Datagrams shorter than the header are discarded.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < VOICE_HEADER_SIZE {
            return None;
        }
        Some(Self {
            sender_id: read_u32(buf, 0)?,
            sequence: read_u32(buf, 4)?,
            opus: buf[VOICE_HEADER_SIZE..].to_vec(),
        })
    }
}

// ── Input validation ──

pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn is_valid_password(password: &str) -> bool {
    (MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&password.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for ty in [MsgType::Join, MsgType::ScreenFrame, MsgType::AuthLogout] {
            for len in [0u32, 1, 0xDEAD_BEEF] {
                let h = Header {
                    msg_type: ty,
                    payload_len: len,
                };
                let buf = serialize_header(h);
                assert_eq!(deserialize_header(&buf), Some(h));
            }
        }
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let buf = [0xFFu8, 0, 0, 0, 0];
        assert!(deserialize_header(&buf).is_none());
    }

    #[test]
    fn test_text_chat_broadcast_roundtrip() {
        let msg = make_text_chat_broadcast(7, 42, 1700000000, "alice", "hi there");
        let parsed = parse_text_chat_broadcast(&msg[HEADER_SIZE..]).unwrap();
        assert_eq!(
            parsed,
            ChatBroadcast {
                seq: 7,
                sender_id: 42,
                timestamp: 1700000000,
                sender_name: "alice".into(),
                text: "hi there".into(),
            }
        );
    }

    #[test]
    fn test_login_resp_roundtrip() {
        let token = [0xABu8; SESSION_TOKEN_SIZE];
        let msg = make_auth_login_resp(
            MsgType::AuthLoginResp,
            AuthStatus::Ok,
            9,
            7778,
            &token,
            "Login successful",
        );
        let resp = parse_auth_login_resp(&msg[HEADER_SIZE..]).unwrap();
        assert_eq!(resp.status, AuthStatus::Ok);
        assert_eq!(resp.client_id, 9);
        assert_eq!(resp.udp_port, 7778);
        assert_eq!(resp.token, token);
        assert_eq!(resp.message, "Login successful");
    }

    #[test]
    fn test_token_login_req_roundtrip() {
        let token = [3u8; SESSION_TOKEN_SIZE];
        let msg = make_auth_token_login_req("bob", &token);
        let (name, parsed) = parse_token_login_req(&msg[HEADER_SIZE..]).unwrap();
        assert_eq!(name, "bob");
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_screen_frame_relay_roundtrip() {
        let data = vec![1u8, 2, 3, 4];
        let msg = make_screen_frame_relay(5, 1920, 1080, FLAG_KEYFRAME, &data);
        let (sharer, f) = parse_screen_frame_relay(&msg[HEADER_SIZE..]).unwrap();
        assert_eq!(sharer, 5);
        assert_eq!((f.width, f.height, f.flags), (1920, 1080, FLAG_KEYFRAME));
        assert_eq!(f.h264, &data[..]);
    }

    #[test]
    fn test_voice_packet_roundtrip() {
        let pkt = VoicePacket {
            sender_id: 3,
            sequence: u32::MAX,
            opus: vec![9u8; 40],
        };
        assert_eq!(VoicePacket::from_bytes(&pkt.to_bytes()), Some(pkt));
    }

    #[test]
    fn test_voice_packet_short_datagram_discarded() {
        assert!(VoicePacket::from_bytes(&[0u8; VOICE_HEADER_SIZE - 1]).is_none());
        assert!(VoicePacket::from_bytes(&[0u8; VOICE_HEADER_SIZE]).is_some());
    }

    #[test]
    fn test_username_boundaries() {
        assert!(is_valid_username(&"a".repeat(32)));
        assert!(!is_valid_username(&"a".repeat(33)));
        assert!(!is_valid_username(""));
        assert!(is_valid_username("ok_name_123"));
        assert!(!is_valid_username("no spaces"));
        assert!(!is_valid_username("bad-dash"));
    }

    #[test]
    fn test_password_boundaries() {
        assert!(!is_valid_password(&"p".repeat(7)));
        assert!(is_valid_password(&"p".repeat(8)));
        assert!(is_valid_password(&"p".repeat(128)));
        assert!(!is_valid_password(&"p".repeat(129)));
    }

    #[test]
    fn test_credentials_missing_password_is_malformed() {
        // A lone name with no second NUL-terminated field must not parse.
        let mut payload = b"alice".to_vec();
        payload.push(0);
        assert!(parse_credentials(&payload).is_none());
    }
}

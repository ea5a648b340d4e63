//! Dispatch for messages arriving on an authenticated stream, plus the UDP
//! voice relay loop.

use std::sync::Arc;

use tracing::{debug, info};

use crate::protocol::{self, AuthStatus, Header, MsgType, VOICE_HEADER_SIZE};
use crate::server::auth::{AuthStore, PasswordCheck};
use crate::server::history::ChatHistory;
use crate::server::registry::Registry;
use crate::server::relay::{RelayItem, RelayQueue};

/// What the read loop should do after a message has been handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Disconnect,
}

pub struct Room {
    pub registry: Arc<Registry>,
    pub relay: Arc<RelayQueue>,
    pub history: Arc<ChatHistory>,
    pub auth: Arc<AuthStore>,
}

impl Room {
    pub async fn dispatch(&self, client_id: u32, header: Header, payload: Vec<u8>) -> Dispatch {
        match header.msg_type {
            MsgType::Leave => {
                self.remove_client(client_id);
                Dispatch::Disconnect
            }
            MsgType::TextChat => {
                if let Some((text, _)) = protocol::read_cstr(&payload, 0) {
                    if !text.is_empty() {
                        self.handle_chat(client_id, &text);
                    }
                }
                Dispatch::Continue
            }
            MsgType::VoiceJoin => {
                self.registry.set_voice(client_id, true);
                Dispatch::Continue
            }
            MsgType::VoiceLeave => {
                self.registry.set_voice(client_id, false);
                Dispatch::Continue
            }
            MsgType::ChatSync => {
                if let Some(last_seq) = protocol::read_u64(&payload, 0) {
                    for record in self.history.records_after(last_seq) {
                        self.registry.send_to(
                            client_id,
                            protocol::make_text_chat_broadcast(
                                record.seq,
                                0,
                                record.ts,
                                &record.sender,
                                &record.text,
                            ),
                        );
                    }
                }
                Dispatch::Continue
            }
            MsgType::ScreenStart => {
                self.registry.set_sharing(client_id, true);
                Dispatch::Continue
            }
            MsgType::ScreenStop => {
                self.registry.set_sharing(client_id, false);
                Dispatch::Continue
            }
            MsgType::ScreenSubscribe => {
                if let Some(target) = protocol::read_u32(&payload, 0) {
                    self.registry.subscribe(client_id, target);
                }
                Dispatch::Continue
            }
            MsgType::ScreenUnsubscribe => {
                if let Some(target) = protocol::read_u32(&payload, 0) {
                    self.registry.unsubscribe(client_id, target);
                }
                Dispatch::Continue
            }
            MsgType::ScreenFrame => {
                if let Some(frame) = protocol::parse_screen_frame(&payload) {
                    let is_keyframe = frame.flags & protocol::FLAG_KEYFRAME != 0;
                    let relay_msg = protocol::make_screen_frame_relay(
                        client_id,
                        frame.width,
                        frame.height,
                        frame.flags,
                        frame.h264,
                    );
                    if is_keyframe {
                        self.registry.store_keyframe(client_id, &relay_msg);
                    }
                    self.relay.enqueue(RelayItem {
                        data: Arc::new(relay_msg),
                        sharer_id: client_id,
                        is_audio: false,
                        is_keyframe,
                    });
                }
                Dispatch::Continue
            }
            MsgType::ScreenAudio => {
                if !payload.is_empty() {
                    let relay_msg = protocol::make_screen_audio_relay(client_id, &payload);
                    self.relay.enqueue(RelayItem {
                        data: Arc::new(relay_msg),
                        sharer_id: client_id,
                        is_audio: true,
                        is_keyframe: false,
                    });
                }
                Dispatch::Continue
            }
            MsgType::AuthChangePassReq => {
                self.handle_change_password(client_id, &payload).await;
                Dispatch::Continue
            }
            MsgType::AuthDeleteAcctReq => self.handle_delete_account(client_id, &payload).await,
            MsgType::AuthLogout => {
                if let Some(account_id) = self.registry.account_id(client_id) {
                    if account_id > 0 {
                        let _ = self.auth.invalidate_all_sessions(account_id).await;
                    }
                }
                self.remove_client(client_id);
                Dispatch::Disconnect
            }
            other => {
                debug!(?other, client_id, "ignoring unexpected message");
                Dispatch::Continue
            }
        }
    }

    pub fn remove_client(&self, client_id: u32) {
        if let Some(name) = self.registry.remove(client_id) {
            info!(client_id, name, "client left");
        }
    }

    fn handle_chat(&self, client_id: u32, text: &str) {
        let sender_name = self
            .registry
            .username(client_id)
            .unwrap_or_else(|| format!("User #{client_id}"));
        let record = self.history.append(&sender_name, text);
        self.registry.broadcast(protocol::make_text_chat_broadcast(
            record.seq,
            client_id,
            record.ts,
            &record.sender,
            &record.text,
        ));
    }

    async fn handle_change_password(&self, client_id: u32, payload: &[u8]) {
        let respond = |status: AuthStatus, message: &str| {
            self.registry.send_to(
                client_id,
                protocol::make_auth_status_resp(MsgType::AuthChangePassResp, status, message),
            );
        };

        let Some((old_pass, new_pass)) = protocol::parse_credentials(payload) else {
            respond(AuthStatus::InvalidInput, "Invalid request");
            return;
        };
        if !protocol::is_valid_password(&new_pass) {
            respond(
                AuthStatus::InvalidInput,
                "Password must be 8-128 characters",
            );
            return;
        }
        let Some(account_id) = self.registry.account_id(client_id) else {
            return;
        };
        match self.auth.change_password(account_id, &old_pass, &new_pass).await {
            Ok(PasswordCheck::Ok) => respond(AuthStatus::Ok, "Password changed successfully"),
            Ok(_) => respond(AuthStatus::InvalidCreds, "Current password is incorrect"),
            Err(e) => {
                debug!("password change failed: {e}");
                respond(AuthStatus::Internal, "Server error");
            }
        }
    }

    async fn handle_delete_account(&self, client_id: u32, payload: &[u8]) -> Dispatch {
        let respond = |status: AuthStatus, message: &str| {
            self.registry.send_to(
                client_id,
                protocol::make_auth_status_resp(MsgType::AuthDeleteAcctResp, status, message),
            );
        };

        let Some((password, _)) = protocol::read_cstr(payload, 0) else {
            respond(AuthStatus::InvalidInput, "Invalid request");
            return Dispatch::Continue;
        };
        let Some(account_id) = self.registry.account_id(client_id) else {
            return Dispatch::Continue;
        };
        match self.auth.delete_account(account_id, &password).await {
            Ok(PasswordCheck::Ok) => {
                respond(AuthStatus::Ok, "Account deleted");
                self.remove_client(client_id);
                Dispatch::Disconnect
            }
            Ok(_) => {
                respond(AuthStatus::InvalidCreds, "Password is incorrect");
                Dispatch::Continue
            }
            Err(e) => {
                debug!("account deletion failed: {e}");
                respond(AuthStatus::Internal, "Server error");
                Dispatch::Continue
            }
        }
    }
}

/// UDP voice relay: learn the sender's address on its first datagram, then
/// fan the packet out, unmodified, to every other voice member with a known
/// address.
pub async fn run_voice_relay(socket: tokio::net::UdpSocket, registry: Arc<Registry>) {
    let mut buf = [0u8; protocol::MAX_VOICE_PACKET];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!("voice relay recv error: {e}");
                continue;
            }
        };
        if len < VOICE_HEADER_SIZE {
            continue;
        }
        let Some(sender_id) = protocol::read_u32(&buf, 0) else {
            continue;
        };
        for addr in registry.voice_relay_targets(sender_id, src) {
            let _ = socket.send_to(&buf[..len], addr).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{deserialize_header, HEADER_SIZE, MAX_PAYLOAD};
    use crate::server::registry::{OutMsg, OUTBOUND_QUEUE};
    use tokio::sync::mpsc;

    async fn test_room(tag: &str) -> (Room, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "huddle-room-{}-{tag}.jsonl",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let room = Room {
            registry: Arc::new(Registry::new()),
            relay: Arc::new(RelayQueue::new()),
            history: Arc::new(ChatHistory::load(&path).unwrap()),
            auth: Arc::new(AuthStore::open_in_memory().await.unwrap()),
        };
        (room, path)
    }

    fn header(msg_type: MsgType, len: usize) -> Header {
        Header {
            msg_type,
            payload_len: len as u32,
        }
    }

    fn recv_messages(rx: &mut mpsc::Receiver<OutMsg>) -> Vec<(MsgType, Vec<u8>)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let hdr: [u8; HEADER_SIZE] = msg[..HEADER_SIZE].try_into().unwrap();
            let h = deserialize_header(&hdr).unwrap();
            assert!((h.payload_len as usize) <= MAX_PAYLOAD);
            out.push((h.msg_type, msg[HEADER_SIZE..].to_vec()));
        }
        out
    }

    #[tokio::test]
    async fn test_chat_assigns_seq_and_broadcasts() {
        let (room, path) = test_room("chat").await;
        let (tx_a, mut rx_a) = mpsc::channel(OUTBOUND_QUEUE);
        let (tx_b, mut rx_b) = mpsc::channel(OUTBOUND_QUEUE);
        let alice = room.registry.admit("alice", 1, tx_a, None);
        let _bob = room.registry.admit("bob", 2, tx_b, None);
        recv_messages(&mut rx_a);
        recv_messages(&mut rx_b);

        let msg = protocol::make_text_chat("hi");
        let d = room
            .dispatch(alice, header(MsgType::TextChat, msg.len() - HEADER_SIZE), msg[HEADER_SIZE..].to_vec())
            .await;
        assert_eq!(d, Dispatch::Continue);

        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = recv_messages(rx);
            assert_eq!(msgs.len(), 1);
            let (ty, payload) = &msgs[0];
            assert_eq!(*ty, MsgType::TextChat);
            let chat = protocol::parse_text_chat_broadcast(payload).unwrap();
            assert_eq!(chat.seq, 1);
            assert_eq!(chat.sender_name, "alice");
            assert_eq!(chat.text, "hi");
        }
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_chat_sync_replays_only_after_seq() {
        let (room, path) = test_room("sync").await;
        room.history.append("alice", "one");
        room.history.append("alice", "two");

        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        let bob = room.registry.admit("bob", 2, tx, None);
        recv_messages(&mut rx);

        let sync = protocol::make_chat_sync(1);
        room.dispatch(bob, header(MsgType::ChatSync, 8), sync[HEADER_SIZE..].to_vec())
            .await;
        let msgs = recv_messages(&mut rx);
        assert_eq!(msgs.len(), 1);
        let chat = protocol::parse_text_chat_broadcast(&msgs[0].1).unwrap();
        assert_eq!(chat.seq, 2);
        assert_eq!(chat.text, "two");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_screen_frame_caches_keyframe_and_enqueues() {
        let (room, path) = test_room("frame").await;
        let (tx_a, _rx_a) = mpsc::channel(OUTBOUND_QUEUE);
        let (tx_b, mut rx_b) = mpsc::channel(OUTBOUND_QUEUE);
        let alice = room.registry.admit("alice", 1, tx_a, None);
        let bob = room.registry.admit("bob", 2, tx_b, None);
        room.registry.set_sharing(alice, true);

        let frame = protocol::make_screen_frame(320, 200, protocol::FLAG_KEYFRAME, &[7, 7]);
        room.dispatch(
            alice,
            header(MsgType::ScreenFrame, frame.len() - HEADER_SIZE),
            frame[HEADER_SIZE..].to_vec(),
        )
        .await;

        // Relay queue holds one keyframe-tagged video item.
        let batch = room.relay.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert!(batch[0].is_keyframe && !batch[0].is_audio);
        assert_eq!(batch[0].sharer_id, alice);

        // A late subscriber gets the cached keyframe immediately.
        recv_messages(&mut rx_b);
        room.registry.subscribe(bob, alice);
        let msgs = recv_messages(&mut rx_b);
        assert_eq!(msgs.len(), 1);
        let (sharer, f) = protocol::parse_screen_frame_relay(&msgs[0].1).unwrap();
        assert_eq!(sharer, alice);
        assert_eq!(f.flags & protocol::FLAG_KEYFRAME, protocol::FLAG_KEYFRAME);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_screen_audio_enqueues_high_priority() {
        let (room, path) = test_room("audio").await;
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        let alice = room.registry.admit("alice", 1, tx, None);

        let msg = protocol::make_screen_audio(&[1, 2, 3]);
        room.dispatch(
            alice,
            header(MsgType::ScreenAudio, msg.len() - HEADER_SIZE),
            msg[HEADER_SIZE..].to_vec(),
        )
        .await;
        let batch = room.relay.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert!(batch[0].is_audio);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_logout_invalidates_sessions_and_disconnects() {
        let (room, path) = test_room("logout").await;
        let outcome = room.auth.register("alice", "passw0rd").await.unwrap();
        let crate::server::auth::RegisterOutcome::Created(account_id) = outcome else {
            panic!();
        };
        let token = room.auth.create_session(account_id).await.unwrap();

        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        let alice = room.registry.admit("alice", account_id, tx, None);

        let d = room
            .dispatch(alice, header(MsgType::AuthLogout, 0), Vec::new())
            .await;
        assert_eq!(d, Dispatch::Disconnect);
        assert!(!room.registry.contains(alice));
        assert!(room.auth.validate_token("alice", &token).await.unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }
}

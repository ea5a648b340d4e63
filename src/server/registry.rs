//! Table of connected clients and the room state derived from it.
//!
//! One lock guards the whole table and is never held across I/O: outbound
//! traffic goes through each client's bounded channel, drained by a writer
//! task that owns the TLS write half. Enqueueing under the lock is just a
//! channel push, so snapshot ordering (a joiner sees the full room before
//! anyone hears about the joiner) falls out of doing it all in one critical
//! section.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol;

/// Outbound messages are shared, not copied, across subscribers.
pub type OutMsg = Arc<Vec<u8>>;

/// Depth of each client's outbound queue. Sits in front of a 1 MiB kernel
/// buffer; video relay sheds frames once this fills.
pub const OUTBOUND_QUEUE: usize = 256;

pub struct ClientState {
    pub id: u32,
    pub username: String,
    pub account_id: i64,
    outbound: mpsc::Sender<OutMsg>,
    pub voice_addr: Option<SocketAddr>,
    pub in_voice: bool,
    pub sharing: bool,
    pub subscribers: HashSet<u32>,
    /// Last keyframe-bearing relay message; empty until the first IDR.
    pub cached_keyframe: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubscribeAction {
    /// Cached keyframe was queued straight to the subscriber.
    SentCachedKeyframe,
    /// No cache yet — the sharer was asked for an IDR.
    RequestedKeyframe,
    /// Target is unknown or not sharing; nothing happened.
    NotSharing,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<u32, ClientState>,
    next_id: u32,
}

pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Admit an authenticated client: stream the current room snapshot into
    /// its queue, announce it to everyone else, and insert it. Ids are never
    /// reused for the life of the process.
    pub fn admit(
        &self,
        username: &str,
        account_id: i64,
        outbound: mpsc::Sender<OutMsg>,
        update_notice: Option<&[u8]>,
    ) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        if let Some(notice) = update_notice {
            enqueue(&outbound, notice.to_vec());
        }
        for existing in inner.clients.values() {
            enqueue(
                &outbound,
                protocol::make_user_joined(existing.id, &existing.username),
            );
        }
        for existing in inner.clients.values() {
            if existing.sharing {
                enqueue(&outbound, protocol::make_screen_start_broadcast(existing.id));
            }
        }
        for existing in inner.clients.values() {
            if existing.in_voice {
                enqueue(&outbound, protocol::make_voice_joined(existing.id));
            }
        }

        let joined = Arc::new(protocol::make_user_joined(id, username));
        for existing in inner.clients.values() {
            enqueue_shared(&existing.outbound, &joined);
        }

        inner.clients.insert(
            id,
            ClientState {
                id,
                username: username.to_string(),
                account_id,
                outbound,
                voice_addr: None,
                in_voice: false,
                sharing: false,
                subscribers: HashSet::new(),
                cached_keyframe: Vec::new(),
            },
        );
        id
    }

    /// Remove a client and notify the rest of the room. Idempotent.
    pub fn remove(&self, id: u32) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.clients.remove(&id)?;

        if removed.in_voice {
            let msg = Arc::new(protocol::make_voice_left(id));
            for c in inner.clients.values() {
                enqueue_shared(&c.outbound, &msg);
            }
        }
        if removed.sharing {
            let msg = Arc::new(protocol::make_screen_stop_broadcast(id));
            for c in inner.clients.values() {
                enqueue_shared(&c.outbound, &msg);
            }
        }
        for c in inner.clients.values_mut() {
            c.subscribers.remove(&id);
        }
        let msg = Arc::new(protocol::make_user_left(id));
        for c in inner.clients.values() {
            enqueue_shared(&c.outbound, &msg);
        }
        Some(removed.username)
    }

    pub fn broadcast(&self, msg: Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        let msg = Arc::new(msg);
        for c in inner.clients.values() {
            enqueue_shared(&c.outbound, &msg);
        }
    }

    /// Queue a message to one client.
    pub fn send_to(&self, id: u32, msg: Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        if let Some(c) = inner.clients.get(&id) {
            enqueue(&c.outbound, msg);
        }
    }

    pub fn username(&self, id: u32) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.clients.get(&id).map(|c| c.username.clone())
    }

    pub fn account_id(&self, id: u32) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.clients.get(&id).map(|c| c.account_id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().unwrap().clients.contains_key(&id)
    }

    /// Flip voice membership and broadcast the change. Returns false for an
    /// unknown client.
    pub fn set_voice(&self, id: u32, in_voice: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(c) = inner.clients.get_mut(&id) else {
            return false;
        };
        c.in_voice = in_voice;
        let msg = Arc::new(if in_voice {
            protocol::make_voice_joined(id)
        } else {
            protocol::make_voice_left(id)
        });
        for c in inner.clients.values() {
            enqueue_shared(&c.outbound, &msg);
        }
        true
    }

    /// Flip sharing state and broadcast. Stopping clears the subscriber set
    /// and the cached keyframe.
    pub fn set_sharing(&self, id: u32, sharing: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(c) = inner.clients.get_mut(&id) else {
            return false;
        };
        c.sharing = sharing;
        if !sharing {
            c.subscribers.clear();
            c.cached_keyframe.clear();
        }
        let msg = Arc::new(if sharing {
            protocol::make_screen_start_broadcast(id)
        } else {
            protocol::make_screen_stop_broadcast(id)
        });
        for c in inner.clients.values() {
            enqueue_shared(&c.outbound, &msg);
        }
        true
    }

    pub fn subscribe(&self, caller: u32, target: u32) -> SubscribeAction {
        let mut inner = self.inner.lock().unwrap();
        let Some(t) = inner.clients.get_mut(&target) else {
            return SubscribeAction::NotSharing;
        };
        if !t.sharing {
            return SubscribeAction::NotSharing;
        }
        t.subscribers.insert(caller);
        let cached = if t.cached_keyframe.is_empty() {
            None
        } else {
            Some(t.cached_keyframe.clone())
        };
        let sharer_outbound = t.outbound.clone();
        match cached {
            Some(keyframe) => {
                if let Some(sub) = inner.clients.get(&caller) {
                    enqueue(&sub.outbound, keyframe);
                }
                SubscribeAction::SentCachedKeyframe
            }
            None => {
                enqueue(&sharer_outbound, protocol::make_screen_request_keyframe());
                SubscribeAction::RequestedKeyframe
            }
        }
    }

    pub fn unsubscribe(&self, caller: u32, target: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.clients.get_mut(&target) {
            t.subscribers.remove(&caller);
        }
    }

    pub fn store_keyframe(&self, sharer: u32, relay_msg: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.clients.get_mut(&sharer) {
            c.cached_keyframe = relay_msg.to_vec();
        }
    }

    /// Outbound channels of everyone watching `sharer`, for the relay drain.
    pub fn subscriber_channels(&self, sharer: u32) -> Vec<mpsc::Sender<OutMsg>> {
        let inner = self.inner.lock().unwrap();
        let Some(c) = inner.clients.get(&sharer) else {
            return Vec::new();
        };
        c.subscribers
            .iter()
            .filter_map(|sub| inner.clients.get(sub))
            .map(|sub| sub.outbound.clone())
            .collect()
    }

    /// Handle one inbound voice datagram's bookkeeping: pin the sender's
    /// address on first sight, then return the addresses to relay to. Empty
    /// when the sender is unknown or not in voice.
    pub fn voice_relay_targets(&self, sender_id: u32, src: SocketAddr) -> Vec<SocketAddr> {
        let mut inner = self.inner.lock().unwrap();
        let Some(sender) = inner.clients.get_mut(&sender_id) else {
            return Vec::new();
        };
        // First packet wins; a changing source address smells like spoofing.
        if sender.voice_addr.is_none() {
            sender.voice_addr = Some(src);
        }
        if !sender.in_voice {
            return Vec::new();
        }
        inner
            .clients
            .values()
            .filter(|c| c.id != sender_id && c.in_voice)
            .filter_map(|c| c.voice_addr)
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn enqueue(outbound: &mpsc::Sender<OutMsg>, msg: Vec<u8>) {
    enqueue_shared(outbound, &Arc::new(msg));
}

fn enqueue_shared(outbound: &mpsc::Sender<OutMsg>, msg: &OutMsg) {
    if let Err(e) = outbound.try_send(msg.clone()) {
        // Queue full means the subscriber is hopelessly behind; its reader
        // or writer task will notice the dead socket and remove it.
        debug!("outbound queue full, dropping message: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{deserialize_header, MsgType, HEADER_SIZE};

    fn channel() -> (mpsc::Sender<OutMsg>, mpsc::Receiver<OutMsg>) {
        mpsc::channel(OUTBOUND_QUEUE)
    }

    fn drain(rx: &mut mpsc::Receiver<OutMsg>) -> Vec<MsgType> {
        let mut types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let hdr: [u8; HEADER_SIZE] = msg[..HEADER_SIZE].try_into().unwrap();
            types.push(deserialize_header(&hdr).unwrap().msg_type);
        }
        types
    }

    #[tokio::test]
    async fn test_ids_monotonic_never_reused() {
        let reg = Registry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let a = reg.admit("alice", 1, tx1, None);
        reg.remove(a);
        let b = reg.admit("bob", 2, tx2, None);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_admit_snapshot_order() {
        let reg = Registry::new();
        let (tx1, mut rx1) = channel();
        let alice = reg.admit("alice", 1, tx1, None);
        reg.set_voice(alice, true);
        reg.set_sharing(alice, true);
        drain(&mut rx1);

        let (tx2, mut rx2) = channel();
        reg.admit("bob", 2, tx2, None);

        // Bob sees the full room: user list, sharers, voice members.
        assert_eq!(
            drain(&mut rx2),
            vec![MsgType::UserJoined, MsgType::ScreenStart, MsgType::VoiceJoined]
        );
        // Alice hears about Bob exactly once.
        assert_eq!(drain(&mut rx1), vec![MsgType::UserJoined]);
    }

    #[tokio::test]
    async fn test_remove_notifies_and_scrubs_subscribers() {
        let reg = Registry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let alice = reg.admit("alice", 1, tx1, None);
        let bob = reg.admit("bob", 2, tx2, None);

        reg.set_sharing(alice, true);
        reg.set_voice(alice, true);
        assert_eq!(reg.subscribe(bob, alice), SubscribeAction::RequestedKeyframe);
        drain(&mut rx1);
        drain(&mut rx2);

        reg.remove(alice);
        // Voice left, screen stop, then user left.
        assert_eq!(
            drain(&mut rx2),
            vec![MsgType::VoiceLeft, MsgType::ScreenStop, MsgType::UserLeft]
        );
        assert!(reg.subscriber_channels(alice).is_empty());

        // Removing Bob must scrub him from nothing and not panic; also his
        // own subscriber entries elsewhere are gone.
        reg.remove(bob);
        assert_eq!(reg.client_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_prefers_cached_keyframe() {
        let reg = Registry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let alice = reg.admit("alice", 1, tx1, None);
        let bob = reg.admit("bob", 2, tx2, None);
        reg.set_sharing(alice, true);
        drain(&mut rx1);
        drain(&mut rx2);

        let keyframe = protocol::make_screen_frame_relay(alice, 64, 64, 1, &[1, 2, 3]);
        reg.store_keyframe(alice, &keyframe);

        assert_eq!(reg.subscribe(bob, alice), SubscribeAction::SentCachedKeyframe);
        assert_eq!(drain(&mut rx2), vec![MsgType::ScreenFrame]);
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_screen_stop_clears_cache_and_subscribers() {
        let reg = Registry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let alice = reg.admit("alice", 1, tx1, None);
        let bob = reg.admit("bob", 2, tx2, None);
        reg.set_sharing(alice, true);
        reg.subscribe(bob, alice);
        reg.store_keyframe(alice, &[9, 9, 9]);

        reg.set_sharing(alice, false);
        assert!(reg.subscriber_channels(alice).is_empty());

        // Re-subscribing after a fresh start must request a keyframe again.
        reg.set_sharing(alice, true);
        assert_eq!(reg.subscribe(bob, alice), SubscribeAction::RequestedKeyframe);
    }

    #[tokio::test]
    async fn test_voice_address_learning_first_packet_wins() {
        let reg = Registry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let alice = reg.admit("alice", 1, tx1, None);
        let bob = reg.admit("bob", 2, tx2, None);
        reg.set_voice(alice, true);
        reg.set_voice(bob, true);

        let alice_addr: SocketAddr = "1.2.3.4:5000".parse().unwrap();
        let bob_addr: SocketAddr = "5.6.7.8:6000".parse().unwrap();
        let spoofed: SocketAddr = "9.9.9.9:7000".parse().unwrap();

        // Alice's first packet: nobody else has an address yet.
        assert!(reg.voice_relay_targets(alice, alice_addr).is_empty());
        // Bob's first packet: relayed to Alice's learned address.
        assert_eq!(reg.voice_relay_targets(bob, bob_addr), vec![alice_addr]);
        // A different source for Alice is ignored; Bob still sees the
        // original address.
        reg.voice_relay_targets(alice, spoofed);
        assert_eq!(reg.voice_relay_targets(bob, bob_addr), vec![alice_addr]);
    }

    #[tokio::test]
    async fn test_voice_relay_requires_membership() {
        let reg = Registry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let alice = reg.admit("alice", 1, tx1, None);
        let bob = reg.admit("bob", 2, tx2, None);
        reg.set_voice(bob, true);
        reg.voice_relay_targets(bob, "5.6.7.8:6000".parse().unwrap());

        // Alice is not in voice: her packets go nowhere (but her address is
        // learned for when she joins).
        assert!(reg
            .voice_relay_targets(alice, "1.2.3.4:5000".parse().unwrap())
            .is_empty());

        reg.set_voice(alice, true);
        assert_eq!(
            reg.voice_relay_targets(alice, "1.2.3.4:5000".parse().unwrap()),
            vec!["5.6.7.8:6000".parse().unwrap()]
        );
    }
}

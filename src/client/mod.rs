//! Client connection controller: TLS connect, the auth state machine,
//! post-auth pipeline setup, and idempotent teardown.

pub mod screen;
pub mod state;
pub mod voice;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::net::{self, tls};
use crate::protocol::{self, AuthStatus, Header, MsgType, MAX_PAYLOAD};
use crate::storage::Storage;
use self::state::{AuthState, ClientShared, UserEntry, APP_VERSION};

pub const CONTROL_PORT: u16 = 7777;

type ClientTls = tokio_rustls::client::TlsStream<TcpStream>;
type TlsReader = ReadHalf<ClientTls>;
type TlsWriter = WriteHalf<ClientTls>;

/// The reliable-stream send lock. Every module that writes to the server
/// does so through this handle; the mutex serializes frames on the wire.
#[derive(Clone)]
pub struct TcpSender {
    writer: Arc<tokio::sync::Mutex<Option<TlsWriter>>>,
}

impl TcpSender {
    fn empty() -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    async fn install(&self, writer: TlsWriter) {
        *self.writer.lock().await = Some(writer);
    }

    async fn take(&self) -> Option<TlsWriter> {
        self.writer.lock().await.take()
    }

    pub async fn send(&self, msg: &[u8]) -> bool {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => net::send_all(writer, msg).await.is_ok(),
            None => false,
        }
    }
}

pub struct Connection {
    shared: Arc<ClientShared>,
    storage: Arc<Storage>,
    sender: TcpSender,
    /// Owned directly during the handshake; handed to the reader task after.
    reader: Option<TlsReader>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    decode_thread: Option<std::thread::JoinHandle<()>>,
    voice: Option<voice::VoiceSession>,
    share: Option<screen::ShareSession>,
    udp: Option<Arc<std::net::UdpSocket>>,
    udp_dest: Option<SocketAddr>,
    server_host: String,
    username: String,
}

impl Connection {
    pub fn new(storage: Storage) -> Self {
        Self {
            shared: ClientShared::new(),
            storage: Arc::new(storage),
            sender: TcpSender::empty(),
            reader: None,
            reader_task: None,
            decode_thread: None,
            voice: None,
            share: None,
            udp: None,
            udp_dest: None,
            server_host: String::new(),
            username: String::new(),
        }
    }

    pub fn shared(&self) -> Arc<ClientShared> {
        self.shared.clone()
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    /// The account name used for the current (or last attempted) login.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// TCP + TLS. Moves DISCONNECTED → CONNECTED_UNAUTH.
    pub async fn connect(&mut self, host: &str, trust_self_signed: bool) -> Result<()> {
        anyhow::ensure!(
            self.shared.auth_state() == AuthState::Disconnected,
            "already connected"
        );
        tls::init_crypto();

        let stream = TcpStream::connect((host, CONTROL_PORT))
            .await
            .with_context(|| format!("connecting to {host}:{CONTROL_PORT}"))?;
        net::configure_stream(&stream);

        let connector = TlsConnector::from(Arc::new(tls::client_config(trust_self_signed)));
        let tls_stream = connector
            .connect(tls::server_name(host)?, stream)
            .await
            .context("TLS handshake failed (self-signed server certificate?)")?;

        let (reader, writer) = tokio::io::split(tls_stream);
        self.reader = Some(reader);
        self.sender.install(writer).await;
        self.server_host = host.to_string();
        self.shared.set_auth_state(AuthState::ConnectedUnauth);
        self.shared
            .add_system_msg("TLS connected. Please log in or register.");
        Ok(())
    }

    /// Create an account. Ends back in CONNECTED_UNAUTH either way; the user
    /// logs in afterwards.
    pub async fn register(&mut self, username: &str, password: &str) -> Result<(AuthStatus, String)> {
        anyhow::ensure!(
            self.shared.auth_state() == AuthState::ConnectedUnauth,
            "not ready to register"
        );
        self.shared.set_auth_state(AuthState::Registering);

        let sent = self
            .sender
            .send(&protocol::make_auth_register_req(username, password))
            .await;
        if !sent {
            self.shared.set_auth_state(AuthState::ConnectedUnauth);
            anyhow::bail!("failed to send register request");
        }

        let (header, payload) = self.read_response().await?;
        self.shared.set_auth_state(AuthState::ConnectedUnauth);
        anyhow::ensure!(
            header.msg_type == MsgType::AuthRegisterResp,
            "unexpected response from server"
        );
        let (status, message) =
            protocol::parse_auth_status_resp(&payload).context("malformed register response")?;
        if status == AuthStatus::Ok {
            self.shared
                .add_system_msg(format!("Registration successful: {message}"));
            self.shared.auth_error.lock().unwrap().clear();
        } else {
            *self.shared.auth_error.lock().unwrap() = message.clone();
            self.shared
                .add_system_msg(format!("Registration failed: {message}"));
        }
        Ok((status, message))
    }

    /// Password login. Returns false on a rejected login (state back in
    /// CONNECTED_UNAUTH, error recorded), true once fully set up.
    pub async fn login(&mut self, username: &str, password: &str, remember: bool) -> Result<bool> {
        anyhow::ensure!(
            self.shared.auth_state() == AuthState::ConnectedUnauth,
            "not ready to log in"
        );
        self.shared.set_auth_state(AuthState::LoggingIn);
        self.username = username.to_string();

        let sent = self
            .sender
            .send(&protocol::make_auth_login_req(username, password))
            .await;
        if !sent {
            self.shared.set_auth_state(AuthState::ConnectedUnauth);
            anyhow::bail!("failed to send login request");
        }

        let (resp, pending) = self.read_login_response(MsgType::AuthLoginResp).await?;
        if resp.status != AuthStatus::Ok {
            self.shared.set_auth_state(AuthState::ConnectedUnauth);
            *self.shared.auth_error.lock().unwrap() = resp.message.clone();
            self.shared
                .add_system_msg(format!("Login failed: {}", resp.message));
            return Ok(false);
        }

        if remember {
            self.storage
                .save_session(&self.server_host, username, &resp.token);
        }
        self.post_auth_setup(resp, pending).await?;
        Ok(true)
    }

    /// Rolling-token login using the session saved for this server.
    /// A rejected token clears the saved session.
    pub async fn token_login(&mut self) -> Result<bool> {
        anyhow::ensure!(
            self.shared.auth_state() == AuthState::ConnectedUnauth,
            "not ready to log in"
        );
        let Some((username, token)) = self.storage.load_session(&self.server_host) else {
            return Ok(false);
        };
        self.shared.set_auth_state(AuthState::LoggingIn);
        self.username = username.clone();

        let sent = self
            .sender
            .send(&protocol::make_auth_token_login_req(&username, &token))
            .await;
        if !sent {
            self.shared.set_auth_state(AuthState::ConnectedUnauth);
            anyhow::bail!("failed to send token login request");
        }

        let (resp, pending) = self.read_login_response(MsgType::AuthTokenLoginResp).await?;
        if resp.status != AuthStatus::Ok {
            self.shared.set_auth_state(AuthState::ConnectedUnauth);
            self.storage.clear_session(&self.server_host);
            self.shared
                .add_system_msg("Saved session expired. Please log in.");
            return Ok(false);
        }

        // The rolling token: what we just used is dead, store its successor.
        self.storage
            .save_session(&self.server_host, &username, &resp.token);
        self.post_auth_setup(resp, pending).await?;
        Ok(true)
    }

    async fn read_response(&mut self) -> Result<(Header, Vec<u8>)> {
        let reader = self.reader.as_mut().context("no connection")?;
        net::read_frame(reader, MAX_PAYLOAD)
            .await
            .context("connection lost waiting for response")
    }

    /// Read until the typed login response arrives. The server streams the
    /// room snapshot ahead of the response; those frames are kept and
    /// replayed through the normal handler after setup.
    async fn read_login_response(
        &mut self,
        expected: MsgType,
    ) -> Result<(protocol::LoginResp, Vec<(Header, Vec<u8>)>)> {
        let mut pending = Vec::new();
        loop {
            let (header, payload) = self.read_response().await?;
            if header.msg_type == expected {
                let resp = protocol::parse_auth_login_resp(&payload)
                    .context("malformed login response")?;
                return Ok((resp, pending));
            }
            pending.push((header, payload));
        }
    }

    async fn post_auth_setup(
        &mut self,
        resp: protocol::LoginResp,
        pending: Vec<(Header, Vec<u8>)>,
    ) -> Result<()> {
        // Voice endpoint: one unbound UDP socket, read timeout paces the
        // receive thread.
        let udp = net::bind_udp(([0, 0, 0, 0], 0).into()).context("binding voice socket")?;
        udp.set_read_timeout(Some(Duration::from_millis(20)))?;
        let udp_dest = (self.server_host.as_str(), resp.udp_port)
            .to_socket_addrs()
            .context("resolving voice address")?
            .next()
            .context("no address for voice endpoint")?;
        self.udp = Some(Arc::new(udp));
        self.udp_dest = Some(udp_dest);

        // Fresh per-connection state.
        let shared = &self.shared;
        shared.my_id.store(resp.client_id, Ordering::Release);
        shared.in_voice.store(false, Ordering::Release);
        shared.sharing.store(false, Ordering::Release);
        shared.watching.store(0, Ordering::Release);
        shared.force_keyframe.store(false, Ordering::Release);
        shared.users.lock().unwrap().clear();
        shared.volumes.lock().unwrap().clear();
        {
            let mut voice_rx = shared.voice_rx.lock().unwrap();
            voice_rx.buffers.clear();
            voice_rx.decoders.clear();
        }
        *shared.screen_frame.lock().unwrap() = Default::default();
        *shared.surface.lock().unwrap() = None;
        shared.chat.lock().unwrap().clear();

        // Replay the on-disk chat cache, then ask for everything newer.
        let mut last_seq = 0u64;
        for record in self.storage.load_chat_cache(&self.server_host) {
            shared.add_chat_msg(0, &record.sender, &record.text, record.seq, record.ts);
            last_seq = last_seq.max(record.seq);
        }
        shared.last_known_seq.store(last_seq, Ordering::Release);

        shared.set_auth_state(AuthState::Authenticated);
        shared.connected.store(true, Ordering::Release);
        shared.add_system_msg(format!("Connected! Your ID: {}", resp.client_id));

        self.sender.send(&protocol::make_chat_sync(last_seq)).await;

        // Room snapshot frames that arrived ahead of the login response.
        for (header, payload) in pending {
            handle_message(&self.shared, &self.storage, &self.server_host, header, payload);
        }

        // Background workers: reliable-stream reader, screen-decode consumer.
        let reader = self.reader.take().context("no connection")?;
        self.reader_task = Some(tokio::spawn(reader_loop(
            reader,
            self.shared.clone(),
            self.storage.clone(),
            self.server_host.clone(),
        )));
        self.decode_thread = Some(screen::spawn_decode_thread(self.shared.clone()));

        info!(client_id = resp.client_id, "authenticated");
        Ok(())
    }

    // ── Chat ──

    pub async fn send_chat(&self, text: &str) {
        if self.shared.connected.load(Ordering::Acquire) {
            self.sender.send(&protocol::make_text_chat(text)).await;
        }
    }

    // ── Voice ──

    /// Join the voice channel: open devices, announce, start the three
    /// voice workers. Device or codec failures surface as system messages.
    pub async fn join_voice(&mut self, input_device: i32, output_device: i32) -> Result<()> {
        anyhow::ensure!(self.shared.connected.load(Ordering::Acquire), "not connected");
        if self.shared.in_voice.load(Ordering::Acquire) {
            return Ok(());
        }
        let (udp, dest) = match (&self.udp, self.udp_dest) {
            (Some(udp), Some(dest)) => (udp.clone(), dest),
            _ => anyhow::bail!("no voice endpoint"),
        };

        let session = match voice::VoiceSession::start(
            self.shared.clone(),
            udp,
            dest,
            input_device,
            output_device,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.shared
                    .add_system_msg(format!("Failed to join voice: {e}"));
                return Err(e);
            }
        };
        self.shared.in_voice.store(true, Ordering::Release);
        self.sender.send(&protocol::make_voice_join()).await;
        self.voice = Some(session);
        Ok(())
    }

    pub async fn leave_voice(&mut self) {
        if !self.shared.in_voice.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.shared.connected.load(Ordering::Acquire) {
            self.sender.send(&protocol::make_voice_leave()).await;
        }
        if let Some(session) = self.voice.take() {
            let _ = tokio::task::spawn_blocking(move || session.join()).await;
        }
        {
            let mut voice_rx = self.shared.voice_rx.lock().unwrap();
            voice_rx.buffers.clear();
            voice_rx.decoders.clear();
        }
        self.shared.voice_last_seen.lock().unwrap().clear();
    }

    // ── Screen sharing ──

    pub async fn start_share(&mut self) -> Result<()> {
        anyhow::ensure!(self.shared.connected.load(Ordering::Acquire), "not connected");
        if self.shared.sharing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.share = Some(screen::ShareSession::start(
            self.shared.clone(),
            self.sender.clone(),
        ));
        Ok(())
    }

    pub async fn stop_share(&mut self) {
        self.shared.sharing.store(false, Ordering::Release);
        self.shared.screen_send_notify.notify_waiters();
        if let Some(session) = self.share.take() {
            session.join().await;
        }
    }

    /// Watch another client's screen.
    pub async fn watch(&self, target_id: u32) {
        self.shared.watching.store(target_id, Ordering::Release);
        *self.shared.screen_frame.lock().unwrap() = Default::default();
        *self.shared.surface.lock().unwrap() = None;
        self.sender
            .send(&protocol::make_screen_subscribe(target_id))
            .await;
    }

    pub async fn stop_watching(&self) {
        let target = self.shared.watching.swap(0, Ordering::AcqRel);
        if target != 0 && self.shared.connected.load(Ordering::Acquire) {
            self.sender
                .send(&protocol::make_screen_unsubscribe(target))
                .await;
        }
        *self.shared.surface.lock().unwrap() = None;
    }

    // ── Account management ──

    pub async fn change_password(&self, old_password: &str, new_password: &str) {
        if self.shared.connected.load(Ordering::Acquire) {
            self.sender
                .send(&protocol::make_auth_change_pass_req(old_password, new_password))
                .await;
        }
    }

    pub async fn delete_account(&self, password: &str) {
        if self.shared.connected.load(Ordering::Acquire) {
            self.sender
                .send(&protocol::make_auth_delete_acct_req(password))
                .await;
        }
    }

    /// Log out everywhere: the server invalidates every session for the
    /// account, and the local saved session is cleared.
    pub async fn logout(&mut self) {
        if self.shared.connected.load(Ordering::Acquire) {
            self.sender.send(&protocol::make_auth_logout()).await;
        }
        self.storage.clear_session(&self.server_host);
        self.disconnect().await;
    }

    // ── Teardown ──

    /// Full teardown. Safe to call twice; the second call is a no-op.
    pub async fn disconnect(&mut self) {
        let was_connected = self.shared.connected.load(Ordering::Acquire);
        if !was_connected
            && self.shared.auth_state() == AuthState::Disconnected
            && self.reader_task.is_none()
        {
            return;
        }

        self.leave_voice().await;
        self.stop_share().await;
        self.shared.watching.store(0, Ordering::Release);

        if was_connected {
            self.sender.send(&protocol::make_leave()).await;
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_auth_state(AuthState::Disconnected);

        // Wake every waiter so the workers notice the flags.
        self.shared.screen_send_notify.notify_waiters();
        self.shared.screen_frame_cv.notify_all();

        // Close the write side to hurry the server along, then stop the
        // reader outright — it may be mid-read on a dead link.
        if let Some(mut writer) = self.sender.take().await {
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(thread) = self.decode_thread.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = thread.join();
            })
            .await;
        }
        self.reader = None;
        self.udp = None;
        self.udp_dest = None;

        {
            let mut voice_rx = self.shared.voice_rx.lock().unwrap();
            voice_rx.buffers.clear();
            voice_rx.decoders.clear();
        }
        self.shared.voice_last_seen.lock().unwrap().clear();
        *self.shared.sys_audio.lock().unwrap() = Default::default();
        self.shared.screen_send.lock().unwrap().clear();
        *self.shared.screen_frame.lock().unwrap() = Default::default();
        *self.shared.surface.lock().unwrap() = None;
        self.shared.users.lock().unwrap().clear();
        self.shared.force_keyframe.store(false, Ordering::Release);

        self.shared.add_system_msg("Disconnected.");
    }
}

/// Reads server frames until the connection drops or teardown stops it.
async fn reader_loop(
    mut reader: TlsReader,
    shared: Arc<ClientShared>,
    storage: Arc<Storage>,
    server_host: String,
) {
    while shared.running.load(Ordering::Acquire) && shared.connected.load(Ordering::Acquire) {
        match net::read_frame(&mut reader, MAX_PAYLOAD).await {
            Ok((header, payload)) => {
                handle_message(&shared, &storage, &server_host, header, payload);
            }
            Err(e) => {
                if shared.connected.swap(false, Ordering::AcqRel) {
                    debug!("control stream ended: {e}");
                    shared.add_system_msg("Disconnected from server.");
                    shared.set_auth_state(AuthState::Disconnected);
                }
                break;
            }
        }
    }
}

/// Dispatch one server→client message into shared state.
fn handle_message(
    shared: &Arc<ClientShared>,
    storage: &Storage,
    server_host: &str,
    header: Header,
    payload: Vec<u8>,
) {
    match header.msg_type {
        MsgType::UserJoined => {
            if let Some((id, name)) = protocol::parse_user_joined(&payload) {
                let mut users = shared.users.lock().unwrap();
                if !users.iter().any(|u| u.id == id) {
                    users.push(UserEntry {
                        id,
                        name: name.clone(),
                        in_voice: false,
                        is_sharing: false,
                    });
                }
                drop(users);
                shared.add_system_msg(format!("{name} joined."));
            }
        }
        MsgType::UserLeft => {
            if let Some(id) = protocol::read_u32(&payload, 0) {
                let name = {
                    let mut users = shared.users.lock().unwrap();
                    match users.iter().position(|u| u.id == id) {
                        Some(idx) => Some(users.remove(idx).name),
                        None => None,
                    }
                };
                shared.volumes.lock().unwrap().remove(&id);
                let _ = shared
                    .watching
                    .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Relaxed);
                let display = name.unwrap_or_else(|| format!("User #{id}"));
                shared.add_system_msg(format!("{display} left."));
            }
        }
        MsgType::TextChat => {
            if let Some(chat) = protocol::parse_text_chat_broadcast(&payload) {
                // Anything at or below the high-water mark is already cached.
                if chat.seq <= shared.last_known_seq.load(Ordering::Acquire) {
                    return;
                }
                shared.add_chat_msg(
                    chat.sender_id,
                    &chat.sender_name,
                    &chat.text,
                    chat.seq,
                    chat.timestamp,
                );
                shared.last_known_seq.store(chat.seq, Ordering::Release);
                storage.append_chat_cache(
                    server_host,
                    &crate::protocol::chat_log::ChatRecord {
                        seq: chat.seq,
                        sender: chat.sender_name,
                        ts: chat.timestamp,
                        text: chat.text,
                    },
                );
            }
        }
        MsgType::VoiceJoined => {
            if let Some(id) = protocol::read_u32(&payload, 0) {
                set_user_flag(shared, id, |u| u.in_voice = true);
            }
        }
        MsgType::VoiceLeft => {
            if let Some(id) = protocol::read_u32(&payload, 0) {
                set_user_flag(shared, id, |u| u.in_voice = false);
                // Their jitter state is dead weight now.
                let mut voice_rx = shared.voice_rx.lock().unwrap();
                voice_rx.buffers.remove(&id);
                voice_rx.decoders.remove(&id);
                drop(voice_rx);
                shared.voice_last_seen.lock().unwrap().remove(&id);
            }
        }
        MsgType::ScreenStart => {
            if let Some(id) = protocol::read_u32(&payload, 0) {
                set_user_flag(shared, id, |u| u.is_sharing = true);
            }
        }
        MsgType::ScreenStop => {
            if let Some(id) = protocol::read_u32(&payload, 0) {
                set_user_flag(shared, id, |u| u.is_sharing = false);
                if shared
                    .watching
                    .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    *shared.surface.lock().unwrap() = None;
                }
            }
        }
        MsgType::ScreenFrame => {
            if let Some((sharer, frame)) = protocol::parse_screen_frame_relay(&payload) {
                if sharer == shared.watching.load(Ordering::Acquire) {
                    let mut slot = shared.screen_frame.lock().unwrap();
                    slot.data.clear();
                    slot.data.extend_from_slice(frame.h264);
                    slot.flags = frame.flags;
                    slot.fresh = true;
                    drop(slot);
                    shared.screen_frame_cv.notify_one();
                }
            }
        }
        MsgType::ScreenAudio => {
            if let Some((sharer, opus)) = protocol::parse_screen_audio_relay(&payload) {
                if sharer == shared.watching.load(Ordering::Acquire) {
                    let mut sys = shared.sys_audio.lock().unwrap();
                    if sys.decoder.is_none() {
                        sys.decoder = crate::audio::codec::VoiceDecoder::new().ok();
                    }
                    if let Some(decoder) = sys.decoder.as_mut() {
                        if let Ok(pcm) = decoder.decode(opus) {
                            sys.push_frame(pcm);
                        }
                    }
                }
            }
        }
        MsgType::ScreenRequestKeyframe => {
            shared.force_keyframe.store(true, Ordering::Release);
        }
        MsgType::UpdateAvailable => {
            if let Some((version, url)) = protocol::parse_update_available(&payload) {
                if !version.is_empty() && !url.is_empty() && is_newer_version(APP_VERSION, &version)
                {
                    *shared.update.lock().unwrap() = Some((version, url));
                }
            }
        }
        MsgType::AuthChangePassResp => {
            if let Some((status, message)) = protocol::parse_auth_status_resp(&payload) {
                if status == AuthStatus::Ok {
                    shared.add_system_msg(format!("Password changed: {message}"));
                    // Every session was invalidated server-side.
                    storage.clear_session(server_host);
                    shared.auth_error.lock().unwrap().clear();
                } else {
                    shared.add_system_msg(format!("Password change failed: {message}"));
                    *shared.auth_error.lock().unwrap() = message;
                }
            }
        }
        MsgType::AuthDeleteAcctResp => {
            if let Some((status, message)) = protocol::parse_auth_status_resp(&payload) {
                if status == AuthStatus::Ok {
                    shared.add_system_msg("Account deleted.");
                    storage.clear_session(server_host);
                    shared.connected.store(false, Ordering::Release);
                } else {
                    shared.add_system_msg(format!("Delete account failed: {message}"));
                    *shared.auth_error.lock().unwrap() = message;
                }
            }
        }
        other => {
            debug!(?other, "ignoring message");
        }
    }
}

fn set_user_flag(shared: &ClientShared, id: u32, apply: impl FnOnce(&mut UserEntry)) {
    let mut users = shared.users.lock().unwrap();
    if let Some(user) = users.iter_mut().find(|u| u.id == id) {
        apply(user);
    }
}

/// Strict semver-triple comparison: is `remote` newer than `local`?
pub fn is_newer_version(local: &str, remote: &str) -> bool {
    fn triple(v: &str) -> (u32, u32, u32) {
        let mut parts = v.split('.').map(|p| {
            p.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse::<u32>()
                .unwrap_or(0)
        });
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    }
    triple(remote) > triple(local)
}

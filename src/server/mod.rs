//! The relay server: TLS acceptor, auth handshake, per-client read loops,
//! screen relay scheduler, UDP voice relay, and session cleanup.

pub mod auth;
pub mod history;
pub mod registry;
pub mod relay;
pub mod room;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::net::{self, tls, FrameError};
use crate::protocol::{self, AuthStatus, MsgType, MAX_AUTH_PAYLOAD, MAX_PAYLOAD, SESSION_TOKEN_SIZE};
use auth::{AuthStore, RateLimiter, RegisterOutcome};
use registry::{OutMsg, Registry, OUTBOUND_QUEUE};
use relay::RelayQueue;
use room::{Dispatch, Room};

pub struct ServerConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub db_path: PathBuf,
    pub history_path: PathBuf,
    /// Two lines: version, then download URL. Absent file disables notices.
    pub update_file: Option<PathBuf>,
    /// Accept the unauthenticated JOIN/WELCOME handshake. Off by default.
    pub allow_legacy_join: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: 7777,
            udp_port: 7778,
            cert_path: "server.crt".into(),
            key_path: "server.key".into(),
            db_path: "huddle.db".into(),
            history_path: "chat_history.jsonl".into(),
            update_file: Some("update.txt".into()),
            allow_legacy_join: false,
        }
    }
}

struct ServerState {
    room: Room,
    rate_limiter: Mutex<RateLimiter>,
    update_notice: Option<Vec<u8>>,
    udp_port: u16,
    allow_legacy_join: bool,
}

pub async fn run(config: ServerConfig) -> Result<()> {
    tls::init_crypto();

    let auth = Arc::new(AuthStore::open(&config.db_path).await?);
    auth.cleanup_expired_sessions().await?;

    let history = Arc::new(history::ChatHistory::load(&config.history_path)?);
    let registry = Arc::new(Registry::new());
    let relay_queue = Arc::new(RelayQueue::new());

    tls::load_or_generate_cert(&config.cert_path, &config.key_path)?;
    let tls_config = tls::server_config(&config.cert_path, &config.key_path)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
        .await
        .with_context(|| format!("binding TCP port {}", config.tcp_port))?;
    let udp_std = net::bind_udp(([0, 0, 0, 0], config.udp_port).into())
        .with_context(|| format!("binding UDP port {}", config.udp_port))?;
    udp_std.set_nonblocking(true)?;
    let udp = tokio::net::UdpSocket::from_std(udp_std)?;

    let update_notice = config.update_file.as_deref().and_then(load_update_notice);
    if update_notice.is_some() {
        info!("update notice configured");
    }

    let state = Arc::new(ServerState {
        room: Room {
            registry: registry.clone(),
            relay: relay_queue.clone(),
            history,
            auth: auth.clone(),
        },
        rate_limiter: Mutex::new(RateLimiter::new()),
        update_notice,
        udp_port: config.udp_port,
        allow_legacy_join: config.allow_legacy_join,
    });

    tokio::spawn(relay::run(relay_queue, registry.clone()));
    tokio::spawn(room::run_voice_relay(udp, registry.clone()));
    tokio::spawn(session_cleanup(auth));

    info!(
        tcp = config.tcp_port,
        udp = config.udp_port,
        "listening (TLS enabled)"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                net::configure_stream(&stream);
                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            handle_connection(tls_stream, peer_addr, state).await;
                        }
                        Err(e) => debug!(%peer_addr, "TLS handshake failed: {e}"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Hourly purge of expired session rows.
async fn session_cleanup(auth: Arc<AuthStore>) {
    let period = Duration::from_secs(3600);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        if let Err(e) = auth.cleanup_expired_sessions().await {
            warn!("session cleanup failed: {e}");
        }
    }
}

fn load_update_notice(path: &Path) -> Option<Vec<u8>> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut lines = contents.lines();
    let version = lines.next()?.trim();
    let url = lines.next()?.trim();
    if version.is_empty() || url.is_empty() {
        return None;
    }
    Some(protocol::make_update_available(version, url))
}

type TlsReadHalf = ReadHalf<TlsStream<TcpStream>>;
type TlsWriteHalf = WriteHalf<TlsStream<TcpStream>>;

/// Who a connection authenticated as.
struct Authenticated {
    username: String,
    account_id: i64,
    /// Login response to send after the room snapshot; legacy joins get a
    /// WELCOME instead.
    response: PendingResponse,
}

enum PendingResponse {
    Login {
        msg_type: MsgType,
        token: [u8; SESSION_TOKEN_SIZE],
        message: String,
    },
    LegacyWelcome,
}

async fn handle_connection(
    stream: TlsStream<TcpStream>,
    peer_addr: std::net::SocketAddr,
    state: Arc<ServerState>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let authed = match auth_handshake(&mut read_half, &mut write_half, peer_addr, &state).await {
        Some(a) => a,
        None => return,
    };

    // The outbound channel plus its writer task is this client's send path;
    // everything queued while the registry lock is held drains in order.
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutMsg>(OUTBOUND_QUEUE);
    tokio::spawn(writer_task(write_half, outbound_rx));

    let client_id = state.room.registry.admit(
        &authed.username,
        authed.account_id,
        outbound_tx,
        state.update_notice.as_deref(),
    );

    let response = match authed.response {
        PendingResponse::Login {
            msg_type,
            token,
            message,
        } => protocol::make_auth_login_resp(
            msg_type,
            AuthStatus::Ok,
            client_id,
            state.udp_port,
            &token,
            &message,
        ),
        PendingResponse::LegacyWelcome => protocol::make_welcome(client_id, state.udp_port),
    };
    state.room.registry.send_to(client_id, response);
    info!(client_id, name = %authed.username, "authenticated");

    loop {
        match net::read_frame(&mut read_half, MAX_PAYLOAD).await {
            Ok((header, payload)) => {
                if state.room.dispatch(client_id, header, payload).await == Dispatch::Disconnect {
                    break;
                }
            }
            Err(FrameError::ConnectionLost) => {
                state.room.remove_client(client_id);
                break;
            }
            Err(e) => {
                // Malformed or oversize frames get the peer disconnected.
                warn!(client_id, "disconnecting: {e}");
                state.room.remove_client(client_id);
                break;
            }
        }
    }
}

/// Pre-auth loop: the client may register (repeatedly) and then log in, by
/// password or rolling token. Anything else ends the connection.
async fn auth_handshake(
    read_half: &mut TlsReadHalf,
    write_half: &mut TlsWriteHalf,
    peer_addr: std::net::SocketAddr,
    state: &ServerState,
) -> Option<Authenticated> {
    let zero_token = [0u8; SESSION_TOKEN_SIZE];
    loop {
        let (header, payload) = match net::read_frame(read_half, MAX_AUTH_PAYLOAD).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer_addr, "handshake read failed: {e}");
                return None;
            }
        };

        match header.msg_type {
            MsgType::AuthRegisterReq => {
                let resp = handle_register(state, &payload).await;
                net::send_all(write_half, &resp).await.ok()?;
            }
            MsgType::AuthLoginReq => {
                if !state.rate_limiter.lock().unwrap().check(peer_addr.ip()) {
                    let resp = protocol::make_auth_login_resp(
                        MsgType::AuthLoginResp,
                        AuthStatus::RateLimited,
                        0,
                        0,
                        &zero_token,
                        "Too many failed attempts. Try again later.",
                    );
                    net::send_all(write_half, &resp).await.ok()?;
                    continue;
                }
                let Some((username, password)) = protocol::parse_credentials(&payload) else {
                    let resp = protocol::make_auth_login_resp(
                        MsgType::AuthLoginResp,
                        AuthStatus::InvalidInput,
                        0,
                        0,
                        &zero_token,
                        "Invalid request",
                    );
                    net::send_all(write_half, &resp).await.ok()?;
                    continue;
                };
                match state.room.auth.verify_login(&username, &password).await {
                    Ok(Some(account_id)) => {
                        let token = match state.room.auth.create_session(account_id).await {
                            Ok(t) => t,
                            Err(e) => {
                                warn!("session creation failed: {e}");
                                return None;
                            }
                        };
                        return Some(Authenticated {
                            username,
                            account_id,
                            response: PendingResponse::Login {
                                msg_type: MsgType::AuthLoginResp,
                                token,
                                message: "Login successful".into(),
                            },
                        });
                    }
                    Ok(None) => {
                        state.rate_limiter.lock().unwrap().record_failure(peer_addr.ip());
                        let resp = protocol::make_auth_login_resp(
                            MsgType::AuthLoginResp,
                            AuthStatus::InvalidCreds,
                            0,
                            0,
                            &zero_token,
                            "Invalid username or password",
                        );
                        net::send_all(write_half, &resp).await.ok()?;
                    }
                    Err(e) => {
                        warn!("login check failed: {e}");
                        let resp = protocol::make_auth_login_resp(
                            MsgType::AuthLoginResp,
                            AuthStatus::Internal,
                            0,
                            0,
                            &zero_token,
                            "Server error",
                        );
                        net::send_all(write_half, &resp).await.ok()?;
                    }
                }
            }
            MsgType::AuthTokenLoginReq => {
                if !state.rate_limiter.lock().unwrap().check(peer_addr.ip()) {
                    let resp = protocol::make_auth_login_resp(
                        MsgType::AuthTokenLoginResp,
                        AuthStatus::RateLimited,
                        0,
                        0,
                        &zero_token,
                        "Too many failed attempts. Try again later.",
                    );
                    net::send_all(write_half, &resp).await.ok()?;
                    continue;
                }
                let Some((username, token)) = protocol::parse_token_login_req(&payload) else {
                    let resp = protocol::make_auth_login_resp(
                        MsgType::AuthTokenLoginResp,
                        AuthStatus::InvalidInput,
                        0,
                        0,
                        &zero_token,
                        "Invalid request",
                    );
                    net::send_all(write_half, &resp).await.ok()?;
                    continue;
                };
                match state.room.auth.validate_token(&username, &token).await {
                    Ok(Some(login)) => {
                        return Some(Authenticated {
                            username: login.username,
                            account_id: login.user_id,
                            response: PendingResponse::Login {
                                msg_type: MsgType::AuthTokenLoginResp,
                                token: login.new_token,
                                message: "Token login successful".into(),
                            },
                        });
                    }
                    Ok(None) => {
                        state.rate_limiter.lock().unwrap().record_failure(peer_addr.ip());
                        let resp = protocol::make_auth_login_resp(
                            MsgType::AuthTokenLoginResp,
                            AuthStatus::TokenExpired,
                            0,
                            0,
                            &zero_token,
                            "Session expired or invalid",
                        );
                        net::send_all(write_half, &resp).await.ok()?;
                    }
                    Err(e) => {
                        warn!("token check failed: {e}");
                        return None;
                    }
                }
            }
            MsgType::Join if state.allow_legacy_join => {
                let Some((username, _)) = protocol::read_cstr(&payload, 0) else {
                    return None;
                };
                if !protocol::is_valid_username(&username) {
                    return None;
                }
                return Some(Authenticated {
                    username,
                    account_id: 0,
                    response: PendingResponse::LegacyWelcome,
                });
            }
            other => {
                debug!(%peer_addr, ?other, "unexpected message during handshake");
                return None;
            }
        }
    }
}

async fn handle_register(state: &ServerState, payload: &[u8]) -> Vec<u8> {
    let resp =
        |status, message: &str| protocol::make_auth_status_resp(MsgType::AuthRegisterResp, status, message);

    let Some((username, password)) = protocol::parse_credentials(payload) else {
        return resp(AuthStatus::InvalidInput, "Invalid request");
    };
    if !protocol::is_valid_username(&username) {
        return resp(
            AuthStatus::InvalidInput,
            "Username must be 1-32 alphanumeric/underscore characters",
        );
    }
    if !protocol::is_valid_password(&password) {
        return resp(AuthStatus::InvalidInput, "Password must be 8-128 characters");
    }
    match state.room.auth.register(&username, &password).await {
        Ok(RegisterOutcome::Created(_)) => resp(AuthStatus::Ok, "Account created successfully"),
        Ok(RegisterOutcome::UsernameTaken) => {
            resp(AuthStatus::UsernameTaken, "Username already taken")
        }
        Err(e) => {
            warn!("registration failed: {e}");
            resp(AuthStatus::Internal, "Server error")
        }
    }
}

/// Drains a client's outbound queue onto its TLS write half. Serializing all
/// sends through one task is what keeps frames from interleaving.
async fn writer_task(mut write_half: TlsWriteHalf, mut outbound: mpsc::Receiver<OutMsg>) {
    while let Some(msg) = outbound.recv().await {
        if net::send_all(&mut write_half, &msg).await.is_err() {
            break;
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_notice_requires_both_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("huddle-update-{}.txt", std::process::id()));

        std::fs::write(&path, "1.2.3\nhttps://example.com/download\n").unwrap();
        let notice = load_update_notice(&path).unwrap();
        let (version, url) =
            protocol::parse_update_available(&notice[protocol::HEADER_SIZE..]).unwrap();
        assert_eq!(version, "1.2.3");
        assert_eq!(url, "https://example.com/download");

        std::fs::write(&path, "1.2.3\n").unwrap();
        assert!(load_update_notice(&path).is_none());
        std::fs::write(&path, "\n\n").unwrap();
        assert!(load_update_notice(&path).is_none());
        let _ = std::fs::remove_file(&path);
    }
}

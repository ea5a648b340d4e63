mod cli;

use std::sync::atomic::Ordering;

use anyhow::Result;
use cli::{Cli, Commands};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use huddle::client::state::AuthState;
use huddle::client::Connection;
use huddle::server::ServerConfig;
use huddle::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Serve {
            port,
            udp_port,
            cert,
            key,
            db,
            history,
            update_file,
            allow_legacy_join,
        } => {
            huddle::server::run(ServerConfig {
                tcp_port: port,
                udp_port,
                cert_path: cert,
                key_path: key,
                db_path: db,
                history_path: history,
                update_file: Some(update_file),
                allow_legacy_join,
            })
            .await
        }
        Commands::Connect {
            server,
            username,
            password,
            register,
            remember,
            trust_self_signed,
            voice,
            input_device,
            output_device,
        } => {
            run_client(
                server,
                username,
                password,
                register,
                remember,
                trust_self_signed,
                voice,
                input_device,
                output_device,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    server: String,
    username: String,
    password: Option<String>,
    register: bool,
    remember: bool,
    trust_self_signed: bool,
    voice: bool,
    input_device: i32,
    output_device: i32,
) -> Result<()> {
    let mut conn = Connection::new(Storage::new());
    conn.connect(&server, trust_self_signed).await?;

    // Try the saved rolling token first; fall back to password auth.
    let mut authed = conn.token_login().await?;
    if !authed {
        let password = match password {
            Some(p) => p,
            None => {
                println!("Password for {username}:");
                rpassword::read_password()?
            }
        };
        if register {
            let (status, message) = conn.register(&username, &password).await?;
            if status != huddle::protocol::AuthStatus::Ok {
                anyhow::bail!("registration failed: {message}");
            }
        }
        authed = conn.login(&username, &password, remember).await?;
    }
    if !authed {
        let reason = conn.shared().auth_error.lock().unwrap().clone();
        anyhow::bail!("login failed: {reason}");
    }

    if voice {
        conn.join_voice(input_device, output_device).await?;
    }

    let shared = conn.shared();
    // Print chat as it lands; the console is the poor man's UI.
    let printer = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut printed = 0usize;
            while shared.running.load(Ordering::Acquire) {
                let chat = shared.chat_snapshot();
                for msg in chat.iter().skip(printed) {
                    if msg.is_system {
                        println!("-- {}", msg.text);
                    } else {
                        println!("<{}> {}", msg.sender_name, msg.text);
                    }
                }
                printed = chat.len();
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        })
    };

    println!("Connected. /quit to exit, /users to list, /watch <id>, /share, /stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if !shared.connected.load(Ordering::Acquire)
            && shared.auth_state() != AuthState::Authenticated
        {
            break;
        }
        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["/quit"] => break,
            ["/users"] => {
                for user in shared.users_snapshot() {
                    println!(
                        "  {:>4}  {}{}{}",
                        user.id,
                        user.name,
                        if user.in_voice { " [voice]" } else { "" },
                        if user.is_sharing { " [sharing]" } else { "" },
                    );
                }
            }
            ["/watch", id] => {
                if let Ok(id) = id.parse() {
                    conn.watch(id).await;
                }
            }
            ["/stop"] => {
                conn.stop_watching().await;
                conn.stop_share().await;
            }
            ["/share"] => {
                let _ = conn.start_share().await;
            }
            ["/mute"] => {
                let muted = !shared.muted.load(Ordering::Acquire);
                shared.muted.store(muted, Ordering::Release);
                println!("-- {}", if muted { "muted" } else { "unmuted" });
            }
            ["/logout"] => {
                conn.logout().await;
                break;
            }
            _ => conn.send_chat(&line).await,
        }
    }

    conn.disconnect().await;
    shared.running.store(false, Ordering::Release);
    printer.abort();
    Ok(())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Small-group voice, screen share and text chat", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server
    Serve {
        /// TCP control port (TLS)
        #[arg(long, default_value_t = 7777)]
        port: u16,

        /// UDP voice port, announced to clients at login
        #[arg(long, default_value_t = 7778)]
        udp_port: u16,

        /// TLS certificate path (generated on first run if missing)
        #[arg(long, default_value = "server.crt")]
        cert: PathBuf,

        /// TLS private key path
        #[arg(long, default_value = "server.key")]
        key: PathBuf,

        /// Account database
        #[arg(long, default_value = "huddle.db")]
        db: PathBuf,

        /// Chat history log
        #[arg(long, default_value = "chat_history.jsonl")]
        history: PathBuf,

        /// Update notice file: line 1 = version, line 2 = URL
        #[arg(long, default_value = "update.txt")]
        update_file: PathBuf,

        /// Accept the legacy unauthenticated JOIN handshake
        #[arg(long)]
        allow_legacy_join: bool,
    },

    /// Connect as a headless client (debug chat console)
    Connect {
        /// Server host or IP
        server: String,

        /// Account name
        #[arg(short, long)]
        username: String,

        /// Password; prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,

        /// Create the account before logging in
        #[arg(long)]
        register: bool,

        /// Save the session token for token login next time
        #[arg(long)]
        remember: bool,

        /// Accept the server certificate without validation
        #[arg(long)]
        trust_self_signed: bool,

        /// Join the voice channel after login
        #[arg(long)]
        voice: bool,

        /// Audio input device index (-1 = default)
        #[arg(long, default_value_t = -1)]
        input_device: i32,

        /// Audio output device index (-1 = default)
        #[arg(long, default_value_t = -1)]
        output_device: i32,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

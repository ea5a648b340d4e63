//! Client-side persistence: saved sessions and per-server chat caches.
//!
//! Layout under the data dir:
//! ```text
//! huddle/
//!   sessions/<server>.txt   — line 1: username, line 2: hex session token
//!   cache/<server>/chat.jsonl
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::protocol::chat_log::{self, ChatRecord};
use crate::protocol::SESSION_TOKEN_SIZE;

pub type Token = [u8; SESSION_TOKEN_SIZE];

pub struct Storage {
    base: PathBuf,
}

impl Storage {
    pub fn new() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("huddle");
        Self { base }
    }

    pub fn with_base<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    /// Server addresses become file names; path separators and colons won't do.
    fn sanitize(server: &str) -> String {
        server
            .chars()
            .map(|c| match c {
                ':' | '/' | '\\' => '_',
                other => other,
            })
            .collect()
    }

    fn session_path(&self, server: &str) -> PathBuf {
        self.base
            .join("sessions")
            .join(format!("{}.txt", Self::sanitize(server)))
    }

    fn chat_cache_path(&self, server: &str) -> PathBuf {
        self.base
            .join("cache")
            .join(Self::sanitize(server))
            .join("chat.jsonl")
    }

    // ── Saved sessions ──

    pub fn save_session(&self, server: &str, username: &str, token: &Token) {
        let path = self.session_path(server);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let contents = format!("{username}\n{}\n", hex::encode(token));
        if let Err(e) = fs::write(&path, contents) {
            warn!("failed to save session: {e}");
        }
    }

    pub fn load_session(&self, server: &str) -> Option<(String, Token)> {
        let contents = fs::read_to_string(self.session_path(server)).ok()?;
        let mut lines = contents.lines();
        let username = lines.next()?.trim().to_string();
        let raw = hex::decode(lines.next()?.trim()).ok()?;
        let token: Token = raw.try_into().ok()?;
        if username.is_empty() {
            return None;
        }
        Some((username, token))
    }

    pub fn clear_session(&self, server: &str) {
        let _ = fs::remove_file(self.session_path(server));
    }

    // ── Chat cache ──

    pub fn load_chat_cache(&self, server: &str) -> Vec<ChatRecord> {
        match fs::read_to_string(self.chat_cache_path(server)) {
            Ok(contents) => chat_log::parse_log(&contents),
            Err(_) => Vec::new(),
        }
    }

    pub fn append_chat_cache(&self, server: &str, record: &ChatRecord) {
        let path = self.chat_cache_path(server);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let appended = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{}", chat_log::serialize_line(record)));
        if let Err(e) = appended {
            warn!("failed to append chat cache: {e}");
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage(tag: &str) -> (Storage, PathBuf) {
        let base = std::env::temp_dir().join(format!(
            "huddle-storage-{}-{tag}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&base);
        (Storage::with_base(&base), base)
    }

    #[test]
    fn test_session_roundtrip_and_clear() {
        let (storage, base) = temp_storage("session");
        let token = [0x5Au8; SESSION_TOKEN_SIZE];

        assert!(storage.load_session("192.168.1.5:7777").is_none());
        storage.save_session("192.168.1.5:7777", "alice", &token);
        assert_eq!(
            storage.load_session("192.168.1.5:7777"),
            Some(("alice".into(), token))
        );

        storage.clear_session("192.168.1.5:7777");
        assert!(storage.load_session("192.168.1.5:7777").is_none());
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_sessions_are_per_server() {
        let (storage, base) = temp_storage("per-server");
        let token = [1u8; SESSION_TOKEN_SIZE];
        storage.save_session("one.example", "alice", &token);
        assert!(storage.load_session("two.example").is_none());
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_corrupt_session_file_ignored() {
        let (storage, base) = temp_storage("corrupt");
        let token = [2u8; SESSION_TOKEN_SIZE];
        storage.save_session("srv", "alice", &token);
        let path = storage.session_path("srv");
        fs::write(&path, "alice\nnot-hex\n").unwrap();
        assert!(storage.load_session("srv").is_none());
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_chat_cache_appends_and_reloads() {
        let (storage, base) = temp_storage("cache");
        let server = "example.com:7777";
        for seq in 1..=3 {
            storage.append_chat_cache(
                server,
                &ChatRecord {
                    seq,
                    sender: "alice".into(),
                    ts: 100 + seq as i64,
                    text: format!("msg {seq}"),
                },
            );
        }
        let records = storage.load_chat_cache(server);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].text, "msg 3");
        let _ = fs::remove_dir_all(&base);
    }
}

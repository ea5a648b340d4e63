//! Account and session storage.
//!
//! Passwords are Argon2id hashes; session tokens are 32 random bytes of
//! which only the SHA-256 is stored. Token logins are rolling: a matched
//! session row is deleted and a fresh token minted, so any token works at
//! most once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::info;

use crate::protocol::SESSION_TOKEN_SIZE;

const SESSION_EXPIRY_SECS: i64 = 30 * 24 * 3600;

pub type Token = [u8; SESSION_TOKEN_SIZE];

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created(i64),
    UsernameTaken,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PasswordCheck {
    Ok,
    WrongPassword,
    NoSuchUser,
}

#[derive(Debug)]
pub struct TokenLogin {
    pub user_id: i64,
    pub username: String,
    pub new_token: Token,
}

pub struct AuthStore {
    pool: Pool<Sqlite>,
}

impl AuthStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::with_options(options).await
    }

    /// In-memory store for tests. One connection, or the data vanishes.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open auth database")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                username      TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                created_at    INTEGER NOT NULL DEFAULT (strftime('%s','now'))
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                token_hash TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
            .to_string())
    }

    fn verify_password(password: &str, stored: &str) -> bool {
        match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    fn hash_token(token: &Token) -> String {
        hex::encode(Sha256::digest(token))
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<RegisterOutcome> {
        let hash = Self::hash_password(password)?;
        let result = sqlx::query("INSERT INTO users (username, password_hash) VALUES (?, ?)")
            .bind(username)
            .bind(&hash)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) => {
                let user_id = done.last_insert_rowid();
                info!(username, user_id, "registered user");
                Ok(RegisterOutcome::Created(user_id))
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(RegisterOutcome::UsernameTaken)
            }
            Err(e) => Err(e).context("user insert failed"),
        }
    }

    /// Password login. Returns the user id on success.
    pub async fn verify_login(&self, username: &str, password: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id, password_hash FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let user_id: i64 = row.get(0);
        let stored: String = row.get(1);
        if Self::verify_password(password, &stored) {
            Ok(Some(user_id))
        } else {
            Ok(None)
        }
    }

    /// Mint a session. The raw token is returned exactly once, here.
    pub async fn create_session(&self, user_id: i64) -> Result<Token> {
        let mut token = [0u8; SESSION_TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut token);
        sqlx::query(
            "INSERT INTO sessions (user_id, token_hash, expires_at)
             VALUES (?, ?, strftime('%s','now') + ?)",
        )
        .bind(user_id)
        .bind(Self::hash_token(&token))
        .bind(SESSION_EXPIRY_SECS)
        .execute(&self.pool)
        .await?;
        Ok(token)
    }

    /// Rolling token login: on a hit the matched session row is deleted and
    /// a fresh token minted. A miss means expired, unknown, or reused.
    pub async fn validate_token(&self, username: &str, token: &Token) -> Result<Option<TokenLogin>> {
        let row = sqlx::query(
            "SELECT s.id, s.user_id, u.username FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ? AND u.username = ?
               AND s.expires_at > strftime('%s','now')",
        )
        .bind(Self::hash_token(token))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let session_id: i64 = row.get(0);
        let user_id: i64 = row.get(1);
        let username: String = row.get(2);

        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        let new_token = self.create_session(user_id).await?;
        Ok(Some(TokenLogin {
            user_id,
            username,
            new_token,
        }))
    }

    pub async fn invalidate_all_sessions(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn check_password(&self, user_id: i64, password: &str) -> Result<PasswordCheck> {
        let row = sqlx::query("SELECT password_hash FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(PasswordCheck::NoSuchUser);
        };
        let stored: String = row.get(0);
        if Self::verify_password(password, &stored) {
            Ok(PasswordCheck::Ok)
        } else {
            Ok(PasswordCheck::WrongPassword)
        }
    }

    /// Change password after verifying the old one. Every session for the
    /// user is invalidated on success.
    pub async fn change_password(
        &self,
        user_id: i64,
        old_password: &str,
        new_password: &str,
    ) -> Result<PasswordCheck> {
        let check = self.check_password(user_id, old_password).await?;
        if check != PasswordCheck::Ok {
            return Ok(check);
        }
        let hash = Self::hash_password(new_password)?;
        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(&hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.invalidate_all_sessions(user_id).await?;
        info!(user_id, "password changed");
        Ok(PasswordCheck::Ok)
    }

    /// Delete the account and, via cascade, all its sessions.
    pub async fn delete_account(&self, user_id: i64, password: &str) -> Result<PasswordCheck> {
        let check = self.check_password(user_id, password).await?;
        if check != PasswordCheck::Ok {
            return Ok(check);
        }
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        info!(user_id, "account deleted");
        Ok(PasswordCheck::Ok)
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM sessions WHERE expires_at <= strftime('%s','now')")
            .execute(&self.pool)
            .await?;
        let deleted = done.rows_affected();
        if deleted > 0 {
            info!(deleted, "cleaned up expired sessions");
        }
        Ok(deleted)
    }
}

// ── Per-address auth rate limiting ──

pub const RATE_LIMIT_MAX_FAILURES: u32 = 5;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

struct RateEntry {
    failures: u32,
    window_start: Instant,
}

/// Sliding-window failure counter keyed by source address. Success does not
/// reset the window; only the window rolling off does.
#[derive(Default)]
pub struct RateLimiter {
    entries: HashMap<IpAddr, RateEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn record_failure(&mut self, ip: IpAddr) {
        self.record_failure_at(ip, Instant::now());
    }

    fn entry_at(&mut self, ip: IpAddr, now: Instant) -> &mut RateEntry {
        let entry = self.entries.entry(ip).or_insert(RateEntry {
            failures: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= RATE_LIMIT_WINDOW {
            entry.failures = 0;
            entry.window_start = now;
        }
        entry
    }

    fn check_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        self.entry_at(ip, now).failures < RATE_LIMIT_MAX_FAILURES
    }

    fn record_failure_at(&mut self, ip: IpAddr, now: Instant) {
        self.entry_at(ip, now).failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_login_roundtrip() {
        let store = AuthStore::open_in_memory().await.unwrap();
        let outcome = store.register("alice", "passw0rd").await.unwrap();
        let RegisterOutcome::Created(user_id) = outcome else {
            panic!("expected creation");
        };

        assert_eq!(store.verify_login("alice", "passw0rd").await.unwrap(), Some(user_id));
        assert_eq!(store.verify_login("alice", "wrong-pass").await.unwrap(), None);
        assert_eq!(store.verify_login("nobody", "passw0rd").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_username_case_insensitive() {
        let store = AuthStore::open_in_memory().await.unwrap();
        store.register("Alice", "passw0rd").await.unwrap();
        assert_eq!(
            store.register("alice", "otherpass").await.unwrap(),
            RegisterOutcome::UsernameTaken
        );
    }

    #[tokio::test]
    async fn test_rolling_token_single_use() {
        let store = AuthStore::open_in_memory().await.unwrap();
        let RegisterOutcome::Created(user_id) = store.register("alice", "passw0rd").await.unwrap()
        else {
            panic!();
        };

        let t1 = store.create_session(user_id).await.unwrap();
        let login = store.validate_token("alice", &t1).await.unwrap().unwrap();
        assert_eq!(login.user_id, user_id);
        assert_ne!(login.new_token, t1);

        // T1 was consumed by the successful login.
        assert!(store.validate_token("alice", &t1).await.unwrap().is_none());
        // The replacement still works, once.
        assert!(store
            .validate_token("alice", &login.new_token)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_token_bound_to_username() {
        let store = AuthStore::open_in_memory().await.unwrap();
        let RegisterOutcome::Created(alice) = store.register("alice", "passw0rd").await.unwrap()
        else {
            panic!();
        };
        store.register("bob", "passw0rd").await.unwrap();
        let token = store.create_session(alice).await.unwrap();
        assert!(store.validate_token("bob", &token).await.unwrap().is_none());
        // The failed lookup must not have consumed Alice's token.
        assert!(store.validate_token("alice", &token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_change_password_invalidates_sessions() {
        let store = AuthStore::open_in_memory().await.unwrap();
        let RegisterOutcome::Created(user_id) = store.register("alice", "passw0rd").await.unwrap()
        else {
            panic!();
        };
        let token = store.create_session(user_id).await.unwrap();

        assert_eq!(
            store.change_password(user_id, "nope1234", "newpass99").await.unwrap(),
            PasswordCheck::WrongPassword
        );
        assert_eq!(
            store.change_password(user_id, "passw0rd", "newpass99").await.unwrap(),
            PasswordCheck::Ok
        );

        assert!(store.validate_token("alice", &token).await.unwrap().is_none());
        assert!(store.verify_login("alice", "newpass99").await.unwrap().is_some());
        assert!(store.verify_login("alice", "passw0rd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_account_cascades() {
        let store = AuthStore::open_in_memory().await.unwrap();
        let RegisterOutcome::Created(user_id) = store.register("alice", "passw0rd").await.unwrap()
        else {
            panic!();
        };
        let token = store.create_session(user_id).await.unwrap();

        assert_eq!(
            store.delete_account(user_id, "wrong-pass").await.unwrap(),
            PasswordCheck::WrongPassword
        );
        assert_eq!(
            store.delete_account(user_id, "passw0rd").await.unwrap(),
            PasswordCheck::Ok
        );
        assert!(store.verify_login("alice", "passw0rd").await.unwrap().is_none());
        assert!(store.validate_token("alice", &token).await.unwrap().is_none());
    }

    #[test]
    fn test_rate_limit_boundary() {
        let mut limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let start = Instant::now();

        for _ in 0..RATE_LIMIT_MAX_FAILURES {
            assert!(limiter.check_at(ip, start));
            limiter.record_failure_at(ip, start);
        }
        // Sixth attempt inside the window is rejected.
        assert!(!limiter.check_at(ip, start));

        // Other addresses are unaffected.
        assert!(limiter.check_at("10.0.0.2".parse().unwrap(), start));

        // Window rolls off after 60 s of no failures.
        let later = start + RATE_LIMIT_WINDOW;
        assert!(limiter.check_at(ip, later));
    }
}

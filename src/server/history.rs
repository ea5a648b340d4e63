//! The room's persistent chat history.
//!
//! Full history lives in memory for replay; every record is also appended to
//! a line-per-record log so sequence numbers stay gap-free across restarts.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::protocol::chat_log::{self, ChatRecord};

struct Inner {
    records: Vec<ChatRecord>,
    next_seq: u64,
}

pub struct ChatHistory {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl ChatHistory {
    /// Load the log (or start fresh). The next sequence number resumes at
    /// max + 1 so restarts never reuse or skip a seq.
    pub fn load(path: &Path) -> Result<Self> {
        let records = match std::fs::read_to_string(path) {
            Ok(contents) => chat_log::parse_log(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("reading chat history"),
        };
        let next_seq = records.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
        if !records.is_empty() {
            info!(count = records.len(), next_seq, "loaded chat history");
        }
        Ok(Self {
            inner: Mutex::new(Inner { records, next_seq }),
            path: path.to_path_buf(),
        })
    }

    /// Assign the next seq and persist the record. The lock is held across
    /// the flushed file append so on-disk order always matches seq order.
    pub fn append(&self, sender: &str, text: &str) -> ChatRecord {
        let mut inner = self.inner.lock().unwrap();
        let record = ChatRecord {
            seq: inner.next_seq,
            sender: sender.to_string(),
            ts: chrono::Utc::now().timestamp(),
            text: text.to_string(),
        };
        inner.next_seq += 1;
        inner.records.push(record.clone());

        let line = chat_log::serialize_line(&record);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                writeln!(f, "{line}")?;
                f.flush()
            });
        if let Err(e) = written {
            warn!("failed to persist chat record: {e}");
        }
        record
    }

    /// Everything after `last_seq`, for CHAT_SYNC replay.
    pub fn records_after(&self, last_seq: u64) -> Vec<ChatRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| r.seq > last_seq)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("huddle-history-{}-{name}.jsonl", std::process::id()))
    }

    #[test]
    fn test_seq_starts_at_one_and_increments() {
        let path = temp_log("fresh");
        let _ = std::fs::remove_file(&path);
        let history = ChatHistory::load(&path).unwrap();
        assert_eq!(history.append("alice", "first").seq, 1);
        assert_eq!(history.append("bob", "second").seq, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_seq_resumes_after_reload() {
        let path = temp_log("resume");
        let _ = std::fs::remove_file(&path);
        {
            let history = ChatHistory::load(&path).unwrap();
            history.append("alice", "one");
            history.append("alice", "two");
            history.append("alice", "three");
        }
        let reloaded = ChatHistory::load(&path).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.append("bob", "four").seq, 4);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_records_after_filters() {
        let path = temp_log("after");
        let _ = std::fs::remove_file(&path);
        let history = ChatHistory::load(&path).unwrap();
        for i in 1..=5 {
            history.append("alice", &format!("msg {i}"));
        }
        let tail = history.records_after(3);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
        assert_eq!(tail[1].seq, 5);
        assert!(history.records_after(5).is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_junk_lines_ignored_on_load() {
        let path = temp_log("junk");
        std::fs::write(
            &path,
            "{\"seq\":2,\"sender\":\"a\",\"ts\":1,\"text\":\"keep\"}\nnot json\n",
        )
        .unwrap();
        let history = ChatHistory::load(&path).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.append("b", "next").seq, 3);
        let _ = std::fs::remove_file(&path);
    }
}

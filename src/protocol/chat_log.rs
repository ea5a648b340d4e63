//! Persisted chat records: one JSON object per line, append-only.
//!
//! The same format is written by the server history log and the client's
//! per-server chat cache, so either side can replay the other's files.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub seq: u64,
    pub sender: String,
    pub ts: i64,
    pub text: String,
}

/// Serialize a record to a single line (no trailing newline).
pub fn serialize_line(record: &ChatRecord) -> String {
    // A flat struct of strings and ints cannot fail to serialize.
    serde_json::to_string(record).unwrap_or_default()
}

/// Parse one line. Malformed lines and lines missing required fields
/// come back as `None` and are skipped by callers.
pub fn parse_line(line: &str) -> Option<ChatRecord> {
    let record: ChatRecord = serde_json::from_str(line.trim_end()).ok()?;
    // Sequence numbers start at 1; a zero seq means the line is junk.
    if record.seq == 0 {
        return None;
    }
    Some(record)
}

/// Parse a whole log, skipping blank and malformed lines.
pub fn parse_log(contents: &str) -> Vec<ChatRecord> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str) -> ChatRecord {
        ChatRecord {
            seq: 12,
            sender: "alice".into(),
            ts: 1700000000,
            text: text.into(),
        }
    }

    #[test]
    fn test_roundtrip_plain() {
        let r = record("hello world");
        assert_eq!(parse_line(&serialize_line(&r)), Some(r));
    }

    #[test]
    fn test_roundtrip_awkward_text() {
        // Newlines, tabs, backslashes and quotes must all survive.
        let r = record("line one\nline\ttwo \\ \"quoted\" \r end");
        let line = serialize_line(&r);
        assert!(!line.contains('\n'));
        assert_eq!(parse_line(&line), Some(r));
    }

    #[test]
    fn test_roundtrip_awkward_sender() {
        let r = ChatRecord {
            seq: 1,
            sender: "we\"ird\\name".into(),
            ts: -5,
            text: String::new(),
        };
        assert_eq!(parse_line(&serialize_line(&r)), Some(r));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert_eq!(parse_line("not json"), None);
        assert_eq!(parse_line("{\"seq\":3}"), None); // missing fields
        assert_eq!(parse_line(""), None);
        // seq 0 is reserved-invalid
        assert_eq!(
            parse_line("{\"seq\":0,\"sender\":\"a\",\"ts\":1,\"text\":\"x\"}"),
            None
        );
    }

    #[test]
    fn test_parse_log_skips_junk() {
        let good = serialize_line(&record("ok"));
        let log = format!("garbage\n\n{}\n{{\"seq\":2}}\n", good);
        let records = parse_log(&log);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "ok");
    }
}

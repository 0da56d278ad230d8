use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only `key=value` decision log shared by every session under one
/// state root.
#[derive(Debug, Clone)]
pub struct EngineLog {
    path: PathBuf,
}

impl EngineLog {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join("logs").join("engine.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every line leads with `ts` and `session_id` so one session's decisions
    /// can be filtered out of the shared file.
    pub fn append(&self, now: i64, session_id: &str, fields: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        match fields.trim() {
            "" => writeln!(file, "ts={now} session_id={session_id}"),
            fields => writeln!(file, "ts={now} session_id={session_id} {fields}"),
        }
    }
}

/// Renders free text as one `key=value` token. Values containing whitespace,
/// quotes or `=` are double-quoted with newlines escaped.
pub fn quote_value(value: impl Display) -> String {
    let value = value.to_string();
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '=' || c == '\\');
    if plain {
        return value;
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_prefixes_timestamp_and_session() {
        let dir = tempdir().expect("tempdir");
        let log = EngineLog::new(dir.path());
        log.append(10, "sess-1", "decision=create").expect("first");
        log.append(11, "sess-1", "  ").expect("second");

        let raw = fs::read_to_string(log.path()).expect("read log");
        assert_eq!(
            raw,
            "ts=10 session_id=sess-1 decision=create\nts=11 session_id=sess-1\n"
        );
        assert!(log.path().ends_with("logs/engine.log"));
    }

    #[test]
    fn quote_value_keeps_single_tokens_intact() {
        assert_eq!(quote_value("draft"), "draft");
        assert_eq!(quote_value(3), "3");
        assert_eq!(quote_value(""), "\"\"");
        assert_eq!(
            quote_value("worker said \"no\"\nretry"),
            "\"worker said \\\"no\\\"\\nretry\""
        );
    }
}

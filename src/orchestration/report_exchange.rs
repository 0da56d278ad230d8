use crate::orchestration::gateway::WorkerCapability;
use crate::shared::fs_atomic::atomic_write_file;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const MAX_SUMMARY_CHARS: usize = 1200;

const CONTEXT_ACK_BLOCK: &str = "context_ack";
const BODY_BLOCK: &str = "body";
const SUMMARY_BLOCK: &str = "summary";
const DECISIONS_BLOCK: &str = "decisions";
const DIRECTIVES_BLOCK: &str = "directives";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("missing [{0}] block")]
    MissingBlock(&'static str),
    #[error("missing [/{0}] tag")]
    UnclosedBlock(&'static str),
    #[error("multiple [{0}] blocks are not allowed")]
    DuplicateBlock(&'static str),
    #[error("summary is {len} chars; limit is {limit}")]
    SummaryTooLong { len: usize, limit: usize },
    #[error("context acknowledgment is missing a `bundle:` line")]
    MissingAckDigest,
    #[error("invalid directive line `{0}`; expected `key: value`")]
    InvalidDirective(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportKey {
    pub session_id: String,
    pub task_id: String,
    pub capability: WorkerCapability,
}

impl ReportKey {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        capability: WorkerCapability,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            capability,
        }
    }
}

impl std::fmt::Display for ReportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.session_id, self.task_id, self.capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextAck {
    pub bundle_digest: String,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub key: String,
    pub value: String,
}

impl Directive {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Structured worker output. `body` is the process narrative; `decisions`
/// carry the load-bearing facts that survive context compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub context_ack: ContextAck,
    pub body: String,
    pub summary: String,
    pub decisions: Vec<String>,
    pub directives: Vec<Directive>,
}

impl Report {
    pub fn directive<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.directive_values(key).next()
    }

    pub fn directive_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.directives
            .iter()
            .filter(move |directive| directive.key.eq_ignore_ascii_case(key))
            .map(|directive| directive.value.as_str())
    }

    pub fn gaps(&self) -> Vec<String> {
        self.directive_values("gap").map(str::to_string).collect()
    }

    /// Bounded stand-in for the full report: summary, decisions and directives.
    pub fn synopsis(&self) -> String {
        let mut out = format!("Summary: {}\n", self.summary.trim());
        if !self.decisions.is_empty() {
            out.push_str("Decisions:\n");
            for decision in &self.decisions {
                out.push_str(&format!("- {decision}\n"));
            }
        }
        if !self.directives.is_empty() {
            out.push_str("Directives:\n");
            for directive in &self.directives {
                out.push_str(&format!("- {}: {}\n", directive.key, directive.value));
            }
        }
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("[{CONTEXT_ACK_BLOCK}]\n"));
        out.push_str(&format!("bundle: {}\n", self.context_ack.bundle_digest));
        for note in &self.context_ack.notes {
            out.push_str(&format!("{note}\n"));
        }
        out.push_str(&format!("[/{CONTEXT_ACK_BLOCK}]\n\n"));
        out.push_str(&format!(
            "[{BODY_BLOCK}]\n{}\n[/{BODY_BLOCK}]\n\n",
            self.body.trim()
        ));
        out.push_str(&format!(
            "[{SUMMARY_BLOCK}]\n{}\n[/{SUMMARY_BLOCK}]\n\n",
            self.summary.trim()
        ));
        if !self.decisions.is_empty() {
            out.push_str(&format!("[{DECISIONS_BLOCK}]\n"));
            for decision in &self.decisions {
                out.push_str(&format!("- {decision}\n"));
            }
            out.push_str(&format!("[/{DECISIONS_BLOCK}]\n\n"));
        }
        out.push_str(&format!("[{DIRECTIVES_BLOCK}]\n"));
        for directive in &self.directives {
            out.push_str(&format!("{}: {}\n", directive.key, directive.value));
        }
        out.push_str(&format!("[/{DIRECTIVES_BLOCK}]\n"));
        out
    }
}

const BLOCK_NAMES: [&str; 5] = [
    CONTEXT_ACK_BLOCK,
    BODY_BLOCK,
    SUMMARY_BLOCK,
    DECISIONS_BLOCK,
    DIRECTIVES_BLOCK,
];

fn block_tag(line: &str, closing: bool) -> Option<&'static str> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?;
    let inner = if closing {
        inner.strip_prefix('/')?
    } else {
        inner
    };
    BLOCK_NAMES.iter().copied().find(|name| *name == inner)
}

/// Splits a report into its tagged blocks. Tags count only on their own line
/// and only outside an open block, so a body may quote another block's tags.
fn scan_blocks(raw: &str) -> Result<BTreeMap<&'static str, &str>, ReportError> {
    let mut blocks = BTreeMap::new();
    let mut open: Option<(&'static str, usize)> = None;
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let tag = line.trim();
        match open {
            Some((name, content_start)) => {
                if block_tag(tag, true) == Some(name) {
                    blocks.insert(name, raw[content_start..line_start].trim());
                    open = None;
                }
            }
            None => {
                if let Some(name) = block_tag(tag, false) {
                    if blocks.contains_key(name) {
                        return Err(ReportError::DuplicateBlock(name));
                    }
                    open = Some((name, offset));
                } else if let Some(name) = block_tag(tag, true) {
                    return Err(if blocks.contains_key(name) {
                        ReportError::DuplicateBlock(name)
                    } else {
                        ReportError::MissingBlock(name)
                    });
                }
            }
        }
    }
    match open {
        Some((name, _)) => Err(ReportError::UnclosedBlock(name)),
        None => Ok(blocks),
    }
}

fn bullet_lines(block: &str) -> Vec<String> {
    block
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .unwrap_or(line)
                .trim()
                .to_string()
        })
        .collect()
}

pub fn parse_report(raw: &str) -> Result<Report, ReportError> {
    let blocks = scan_blocks(raw)?;
    let required = |name: &'static str| {
        blocks
            .get(name)
            .copied()
            .ok_or(ReportError::MissingBlock(name))
    };
    let ack_block = required(CONTEXT_ACK_BLOCK)?;
    let body = required(BODY_BLOCK)?;
    let summary = required(SUMMARY_BLOCK)?;
    let directives_block = required(DIRECTIVES_BLOCK)?;
    let decisions = blocks
        .get(DECISIONS_BLOCK)
        .copied()
        .map(bullet_lines)
        .unwrap_or_default();

    let summary_len = summary.chars().count();
    if summary_len > MAX_SUMMARY_CHARS {
        return Err(ReportError::SummaryTooLong {
            len: summary_len,
            limit: MAX_SUMMARY_CHARS,
        });
    }

    let mut bundle_digest = None;
    let mut notes = Vec::new();
    for line in ack_block.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.strip_prefix("bundle:") {
            Some(digest) if bundle_digest.is_none() => {
                bundle_digest = Some(digest.trim().to_string());
            }
            _ => notes.push(line.to_string()),
        }
    }
    let bundle_digest = bundle_digest
        .filter(|digest| !digest.is_empty())
        .ok_or(ReportError::MissingAckDigest)?;

    let mut directives = Vec::new();
    for line in bullet_lines(directives_block) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ReportError::InvalidDirective(line.clone()))?;
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(ReportError::InvalidDirective(line.clone()));
        }
        directives.push(Directive::new(key, value.trim()));
    }

    Ok(Report {
        context_ack: ContextAck {
            bundle_digest,
            notes,
        },
        body: body.to_string(),
        summary: summary.to_string(),
        decisions,
        directives,
    })
}

#[derive(Debug, Clone)]
pub struct ReportExchange {
    root: PathBuf,
}

impl ReportExchange {
    pub fn new(state_root: &Path) -> Self {
        Self {
            root: state_root.join("reports"),
        }
    }

    pub fn path_for(&self, key: &ReportKey) -> PathBuf {
        self.root
            .join(&key.session_id)
            .join(&key.task_id)
            .join(format!("{}.md", key.capability))
    }

    pub fn bundle_path_for(&self, key: &ReportKey) -> PathBuf {
        self.root
            .join(&key.session_id)
            .join(&key.task_id)
            .join("bundle.md")
    }

    pub fn write_report(&self, key: &ReportKey, report: &Report) -> Result<PathBuf, ReportError> {
        let path = self.path_for(key);
        atomic_write_file(&path, report.render().as_bytes()).map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }

    pub fn read_report(&self, key: &ReportKey) -> Result<Report, ReportError> {
        let path = self.path_for(key);
        let raw = fs::read_to_string(&path).map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        parse_report(&raw)
    }
}

use crate::config::{ProtocolDefinition, ProtocolType};
use crate::orchestration::error::{io_error, json_error, OrchestratorError};
use crate::orchestration::fsm::Fsm;
use crate::orchestration::progress::ProgressSnapshot;
use crate::orchestration::quality_gate::QualityGateResult;
use crate::orchestration::report_exchange::ReportKey;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{generate_session_id, validate_identifier_value};
use crate::shared::logging::EngineLog;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const SESSION_ID_MAX_GENERATION_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initialized,
    InProgress,
    Completed,
    Halted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Initialized => write!(f, "initialized"),
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Halted => write!(f, "halted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Linear,
    Optional,
    Iterative,
    Remediation,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Sealed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub seq: u32,
    pub phase_id: String,
    pub name: String,
    pub step_type: StepType,
    pub attempt: u32,
    pub status: StepStatus,
    pub input_summary: String,
    #[serde(default)]
    pub output_summary: Option<String>,
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    pub bundle_digest: String,
    #[serde(default)]
    pub reports: Vec<ReportKey>,
    #[serde(default)]
    pub failed_branches: BTreeMap<String, String>,
    #[serde(default)]
    pub merged_inputs: usize,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn is_sealed(&self) -> bool {
        self.status == StepStatus::Sealed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTimestamps {
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

/// The step persisted right before its work requests went out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightStep {
    pub seq: u32,
    pub phase_id: String,
    pub attempt: u32,
    pub units: Vec<ReportKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    AwaitingClarification,
    Escalated,
    BlockingGaps,
    Manual,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::AwaitingClarification => write!(f, "awaiting_clarification"),
            HaltReason::Escalated => write!(f, "escalated"),
            HaltReason::BlockingGaps => write!(f, "blocking_gaps"),
            HaltReason::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HaltState {
    pub reason: HaltReason,
    #[serde(default)]
    pub phase_id: Option<String>,
    /// Highest priority first.
    #[serde(default)]
    pub open_questions: Vec<String>,
    pub halted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRemediation {
    pub target_phase: String,
    pub from_phase: String,
    pub gaps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub session_id: Option<String>,
    pub inputs: Map<String, Value>,
    pub flags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub protocol_id: String,
    pub protocol_type: ProtocolType,
    pub status: SessionStatus,
    pub revision: u64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    pub fsm: Fsm,
    #[serde(default)]
    pub step_outputs: BTreeMap<u32, StepRecord>,
    #[serde(default)]
    pub step_timestamps: BTreeMap<u32, StepTimestamps>,
    #[serde(default)]
    pub remediation_counters: BTreeMap<String, u32>,
    #[serde(default)]
    pub gate_results: Vec<QualityGateResult>,
    #[serde(default)]
    pub pending_remediation: Option<PendingRemediation>,
    #[serde(default)]
    pub clarifications: Vec<String>,
    #[serde(default)]
    pub in_flight: Option<InFlightStep>,
    #[serde(default)]
    pub halt: Option<HaltState>,
    #[serde(default)]
    pub last_error: Option<String>,
}

pub fn remediation_counter_key(phase_id: &str, target: &str) -> String {
    format!("{phase_id}->{target}")
}

impl Session {
    pub fn next_seq(&self) -> u32 {
        self.step_outputs
            .keys()
            .next_back()
            .map(|seq| seq.saturating_add(1))
            .unwrap_or(1)
    }

    pub fn touch(&mut self, now: i64) {
        self.revision = self.revision.saturating_add(1);
        self.updated_at = now;
    }

    pub fn latest_sealed(&self, phase_id: &str) -> Option<&StepRecord> {
        self.step_outputs
            .values()
            .rev()
            .find(|record| record.phase_id == phase_id && record.is_sealed())
    }

    pub fn latest_sealed_any(&self) -> Option<&StepRecord> {
        self.step_outputs
            .values()
            .rev()
            .find(|record| record.is_sealed())
    }

    pub fn sealed_count(&self) -> usize {
        self.step_outputs
            .values()
            .filter(|record| record.is_sealed())
            .count()
    }

    pub fn remediation_count(&self, phase_id: &str, target: &str) -> u32 {
        self.remediation_counters
            .get(&remediation_counter_key(phase_id, target))
            .copied()
            .unwrap_or(0)
    }

    pub fn insert_record(&mut self, record: StepRecord) {
        self.step_timestamps.insert(
            record.seq,
            StepTimestamps {
                started_at: record.started_at,
                completed_at: record.completed_at,
            },
        );
        self.step_outputs.insert(record.seq, record);
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    state_root: PathBuf,
    log: EngineLog,
}

impl SessionStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        let state_root = state_root.into();
        Self {
            log: EngineLog::new(&state_root),
            state_root,
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn create(
        &self,
        protocol: &ProtocolDefinition,
        options: SessionOptions,
        now: i64,
    ) -> Result<Session, OrchestratorError> {
        let session_id = match options.session_id {
            Some(session_id) => {
                validate_identifier_value("session id", &session_id)
                    .map_err(OrchestratorError::Config)?;
                if self.session_path(&session_id).exists()
                    || self.archived_path(&session_id).exists()
                {
                    return Err(OrchestratorError::Config(format!(
                        "session `{session_id}` already exists"
                    )));
                }
                session_id
            }
            None => self.allocate_session_id(now)?,
        };

        let session = Session {
            session_id,
            protocol_id: protocol.id.clone(),
            protocol_type: protocol.protocol_type,
            status: SessionStatus::Initialized,
            revision: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
            inputs: options.inputs,
            flags: options.flags,
            fsm: Fsm::new(),
            step_outputs: BTreeMap::new(),
            step_timestamps: BTreeMap::new(),
            remediation_counters: BTreeMap::new(),
            gate_results: Vec::new(),
            pending_remediation: None,
            clarifications: Vec::new(),
            in_flight: None,
            halt: None,
            last_error: None,
        };
        self.checkpoint(&session, "initialized", false, "dispatch first phase")?;
        Ok(session)
    }

    pub fn load(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        let path = self.session_path(session_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => {
                return Err(OrchestratorError::SessionNotFound {
                    session_id: session_id.to_string(),
                })
            }
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
    }

    /// Writes the whole record atomically; a reader sees the old or new
    /// version, never a torn one.
    pub fn save(&self, session: &Session) -> Result<(), OrchestratorError> {
        let path = self.session_path(&session.session_id);
        let body = serde_json::to_vec_pretty(session).map_err(|e| json_error(&path, e))?;
        atomic_write_file(&path, &body).map_err(|e| io_error(&path, e))
    }

    pub fn checkpoint(
        &self,
        session: &Session,
        summary: impl Into<String>,
        pending_external_input: bool,
        next_expected_action: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        self.save(session)?;
        self.persist_progress(&ProgressSnapshot {
            session_id: session.session_id.clone(),
            protocol_id: session.protocol_id.clone(),
            status: session.status,
            fsm_state: session.fsm.state.clone(),
            revision: session.revision,
            sealed_steps: session.sealed_count(),
            in_flight_phase: session
                .in_flight
                .as_ref()
                .map(|in_flight| in_flight.phase_id.clone()),
            created_at: session.created_at,
            updated_at: session.updated_at,
            summary: summary.into(),
            pending_external_input,
            next_expected_action: next_expected_action.into(),
        })
    }

    pub fn persist_progress(&self, progress: &ProgressSnapshot) -> Result<(), OrchestratorError> {
        let path = self.progress_path(&progress.session_id);
        let body = serde_json::to_vec_pretty(progress).map_err(|e| json_error(&path, e))?;
        atomic_write_file(&path, &body).map_err(|e| io_error(&path, e))
    }

    pub fn load_progress(&self, session_id: &str) -> Result<ProgressSnapshot, OrchestratorError> {
        let path = self.progress_path(session_id);
        let raw = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
    }

    pub fn archive(&self, session_id: &str) -> Result<PathBuf, OrchestratorError> {
        let path = self.session_path(session_id);
        if !path.is_file() {
            return Err(OrchestratorError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        let archived = self.archived_path(session_id);
        if let Some(parent) = archived.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        fs::rename(&path, &archived).map_err(|e| io_error(&path, e))?;
        Ok(archived)
    }

    pub fn is_archived(&self, session_id: &str) -> bool {
        self.archived_path(session_id).is_file()
    }

    pub fn load_archived(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        let path = self.archived_path(session_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => {
                return Err(OrchestratorError::SessionNotFound {
                    session_id: session_id.to_string(),
                })
            }
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
    }

    pub fn list_active(&self) -> Result<Vec<String>, OrchestratorError> {
        let root = self.sessions_root();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&root, source)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&root, source))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|value| value.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|value| value.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn append_engine_log(
        &self,
        session_id: &str,
        now: i64,
        message: impl AsRef<str>,
    ) -> Result<(), OrchestratorError> {
        self.log
            .append(now, session_id, message.as_ref())
            .map_err(|source| io_error(self.log.path(), source))
    }

    fn allocate_session_id(&self, now: i64) -> Result<String, OrchestratorError> {
        for _ in 0..SESSION_ID_MAX_GENERATION_ATTEMPTS {
            let session_id = generate_session_id(now).map_err(OrchestratorError::Config)?;
            if !self.session_path(&session_id).exists()
                && !self.archived_path(&session_id).exists()
            {
                return Ok(session_id);
            }
        }
        Err(OrchestratorError::Config(format!(
            "failed to allocate unique session id after {SESSION_ID_MAX_GENERATION_ATTEMPTS} attempts"
        )))
    }

    fn sessions_root(&self) -> PathBuf {
        self.state_root.join("sessions")
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_root().join(format!("{session_id}.json"))
    }

    pub fn archived_path(&self, session_id: &str) -> PathBuf {
        self.sessions_root()
            .join("archive")
            .join(format!("{session_id}.json"))
    }

    fn progress_path(&self, session_id: &str) -> PathBuf {
        self.state_root
            .join("progress")
            .join(format!("{session_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn protocol() -> ProtocolDefinition {
        serde_yaml::from_str(
            r#"
id: single
protocol_type: linear_sequence
phases:
  - id: clarify
    capability: clarify
    context: { pattern: workflow_only }
"#,
        )
        .expect("parse protocol")
    }

    #[test]
    fn create_persists_initialized_session_and_progress() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let session = store
            .create(&protocol(), SessionOptions::default(), 100)
            .expect("create");

        let loaded = store.load(&session.session_id).expect("load");
        assert_eq!(loaded, session);
        assert_eq!(loaded.status, SessionStatus::Initialized);
        assert_eq!(loaded.fsm.state, "init");

        let progress = store.load_progress(&session.session_id).expect("progress");
        assert_eq!(progress.summary, "initialized");
        assert_eq!(progress.revision, 1);
    }

    #[test]
    fn load_unknown_session_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let err = store.load("sess-missing").expect_err("missing");
        assert!(matches!(err, OrchestratorError::SessionNotFound { .. }));
    }

    #[test]
    fn save_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let session = store
            .create(
                &protocol(),
                SessionOptions {
                    session_id: Some("sess-fixed".to_string()),
                    ..SessionOptions::default()
                },
                100,
            )
            .expect("create");

        store.save(&session).expect("first save");
        let first = fs::read(dir.path().join("sessions/sess-fixed.json")).expect("read");
        store.save(&session).expect("second save");
        let second = fs::read(dir.path().join("sessions/sess-fixed.json")).expect("read");
        assert_eq!(first, second);
    }

    #[test]
    fn explicit_session_ids_must_be_unique_and_safe() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let options = SessionOptions {
            session_id: Some("sess-a".to_string()),
            ..SessionOptions::default()
        };
        store
            .create(&protocol(), options.clone(), 1)
            .expect("first create");
        assert!(store.create(&protocol(), options, 2).is_err());

        let unsafe_id = SessionOptions {
            session_id: Some("../escape".to_string()),
            ..SessionOptions::default()
        };
        assert!(store.create(&protocol(), unsafe_id, 3).is_err());
    }

    #[test]
    fn archive_moves_session_out_of_active_listing() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let session = store
            .create(&protocol(), SessionOptions::default(), 100)
            .expect("create");
        assert_eq!(store.list_active().expect("list"), vec![session.session_id.clone()]);

        assert!(!store.is_archived(&session.session_id));
        store.archive(&session.session_id).expect("archive");
        assert!(store.is_archived(&session.session_id));
        assert!(store.list_active().expect("list").is_empty());
        assert!(matches!(
            store.load(&session.session_id),
            Err(OrchestratorError::SessionNotFound { .. })
        ));
        assert_eq!(
            store.load_archived(&session.session_id).expect("archived"),
            session
        );
    }

    #[test]
    fn next_seq_and_latest_sealed_follow_records() {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let mut session = store
            .create(&protocol(), SessionOptions::default(), 100)
            .expect("create");
        assert_eq!(session.next_seq(), 1);

        for (seq, status) in [(1, StepStatus::Sealed), (2, StepStatus::Failed)] {
            session.insert_record(StepRecord {
                seq,
                phase_id: "clarify".to_string(),
                name: "clarify".to_string(),
                step_type: StepType::Linear,
                attempt: seq,
                status,
                input_summary: String::new(),
                output_summary: None,
                started_at: 100,
                completed_at: Some(101),
                bundle_digest: "d".to_string(),
                reports: Vec::new(),
                failed_branches: BTreeMap::new(),
                merged_inputs: 0,
                error: None,
            });
        }
        assert_eq!(session.next_seq(), 3);
        assert_eq!(session.latest_sealed("clarify").map(|r| r.seq), Some(1));
        assert_eq!(session.step_timestamps.len(), 2);
    }
}

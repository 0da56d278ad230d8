use crate::config::ConfigError;
use crate::orchestration::gateway::GatewayError;
use crate::orchestration::report_exchange::ReportError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("illegal transition `{from}` -> `{to}`")]
    IllegalTransition { from: String, to: String },
    #[error("context pattern violation for phase `{phase_id}`: {reason}")]
    PatternViolation { phase_id: String, reason: String },
    #[error(
        "context for phase `{phase_id}` needs ~{estimated} tokens after compression; ceiling is {ceiling}"
    )]
    BudgetExceeded {
        phase_id: String,
        estimated: usize,
        ceiling: usize,
    },
    #[error("worker failed for phase `{phase_id}`: {reason}")]
    WorkerFailure { phase_id: String, reason: String },
    #[error("worker for phase `{phase_id}` timed out after {timeout_seconds}s")]
    WorkerTimeout {
        phase_id: String,
        timeout_seconds: u64,
    },
    #[error("report `{key}` is invalid: {reason}")]
    ReportInvalid { key: String, reason: String },
    #[error("remediation `{phase_id}` -> `{target}` exhausted after {max_loops} loop(s)")]
    RemediationExhausted {
        phase_id: String,
        target: String,
        max_loops: u32,
    },
    #[error("session `{session_id}` not found")]
    SessionNotFound { session_id: String },
    #[error("session `{session_id}` is already completed")]
    SessionTerminal { session_id: String },
    #[error("session `{session_id}` is halted: {reason}")]
    SessionHalted { session_id: String, reason: String },
    #[error("unknown protocol `{protocol_id}`")]
    UnknownProtocol { protocol_id: String },
    #[error("protocol `{protocol_id}` has no phase `{phase_id}`")]
    UnknownPhase {
        protocol_id: String,
        phase_id: String,
    },
    #[error("session `{session_id}` exceeded {max_cycles} execution cycles")]
    CycleLimitExceeded { session_id: String, max_cycles: u32 },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl OrchestratorError {
    /// Worker-side failures the executor may re-dispatch on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::WorkerFailure { .. } | OrchestratorError::WorkerTimeout { .. }
        )
    }

    /// Configuration or protocol bugs; these must halt loudly and are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            OrchestratorError::IllegalTransition { .. }
                | OrchestratorError::PatternViolation { .. }
                | OrchestratorError::BudgetExceeded { .. }
        )
    }

    pub(crate) fn from_gateway(phase_id: &str, error: GatewayError) -> Self {
        match error {
            GatewayError::Timeout { timeout_seconds, .. } => OrchestratorError::WorkerTimeout {
                phase_id: phase_id.to_string(),
                timeout_seconds,
            },
            other => OrchestratorError::WorkerFailure {
                phase_id: phase_id.to_string(),
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn from_report(key: &str, error: ReportError) -> Self {
        match error {
            ReportError::Io { path, source } => OrchestratorError::Io { path, source },
            other => OrchestratorError::ReportInvalid {
                key: key.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<ConfigError> for OrchestratorError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

pub(crate) fn io_error(path: &std::path::Path, source: std::io::Error) -> OrchestratorError {
    OrchestratorError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn json_error(path: &std::path::Path, source: serde_json::Error) -> OrchestratorError {
    OrchestratorError::Json {
        path: path.display().to_string(),
        source,
    }
}

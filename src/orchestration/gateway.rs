use crate::orchestration::context_loader::ContextBundle;
use crate::orchestration::report_exchange::ReportKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCapability {
    Clarify,
    Research,
    Analyze,
    Synthesize,
    Generate,
    Validate,
}

impl WorkerCapability {
    pub const ALL: [WorkerCapability; 6] = [
        WorkerCapability::Clarify,
        WorkerCapability::Research,
        WorkerCapability::Analyze,
        WorkerCapability::Synthesize,
        WorkerCapability::Generate,
        WorkerCapability::Validate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clarify => "clarify",
            Self::Research => "research",
            Self::Analyze => "analyze",
            Self::Synthesize => "synthesize",
            Self::Generate => "generate",
            Self::Validate => "validate",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|capability| capability.as_str() == normalized)
            .ok_or_else(|| {
                "capability must be one of: clarify, research, analyze, synthesize, generate, validate"
                    .to_string()
            })
    }
}

impl std::fmt::Display for WorkerCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no worker configured for capability `{capability}`")]
    UnsupportedCapability { capability: WorkerCapability },
    #[error("worker binary missing for {capability}: {binary}")]
    MissingBinary {
        capability: WorkerCapability,
        binary: String,
    },
    #[error("worker `{key}` exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        key: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("worker `{key}` timed out after {timeout_seconds}s")]
    Timeout { key: String, timeout_seconds: u64 },
    #[error("worker `{key}` did not write expected output {path}")]
    MissingOutput { key: String, path: String },
    #[error("worker `{key}` wrote an empty output {path}")]
    EmptyOutput { key: String, path: String },
    #[error("worker `{key}` failed: {reason}")]
    Rejected { key: String, reason: String },
    #[error("unknown worker invocation {invocation_id}")]
    UnknownInvocation { invocation_id: u64 },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub capability: WorkerCapability,
    pub context_bundle: ContextBundle,
    pub expected_output_key: ReportKey,
    pub expected_output_path: PathBuf,
    pub bundle_path: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub invocation_id: u64,
    pub key: ReportKey,
    pub capability: WorkerCapability,
    pub output_path: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeExit {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub detail: String,
}

impl RuntimeExit {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            detail: String::new(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    pub key: ReportKey,
    pub output_path: PathBuf,
    pub bytes: u64,
    pub exit: RuntimeExit,
}

/// Transport seam: how a unit of work actually reaches a worker.
///
/// `spawn` must not block on the worker finishing; `wait` is the single
/// suspension point and may block up to `timeout`.
pub trait WorkerRuntime: Send + Sync {
    fn spawn(&self, unit: &UnitOfWork) -> Result<u64, GatewayError>;
    fn wait(&self, invocation_id: u64, timeout: Option<Duration>)
        -> Result<RuntimeExit, GatewayError>;
}

#[derive(Clone)]
pub struct Gateway {
    runtime: Arc<dyn WorkerRuntime>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(runtime: Arc<dyn WorkerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn invoke(&self, unit: &UnitOfWork) -> Result<WorkerHandle, GatewayError> {
        let invocation_id = self.runtime.spawn(unit)?;
        Ok(WorkerHandle {
            invocation_id,
            key: unit.expected_output_key.clone(),
            capability: unit.capability,
            output_path: unit.expected_output_path.clone(),
            timeout: unit.timeout,
        })
    }

    pub fn await_result(&self, handle: WorkerHandle) -> Result<WorkerResult, GatewayError> {
        let exit = self.runtime.wait(handle.invocation_id, handle.timeout)?;
        let key = handle.key.to_string();
        if !exit.success {
            return Err(match exit.exit_code {
                Some(exit_code) => GatewayError::NonZeroExit {
                    key,
                    exit_code,
                    stderr: exit.detail,
                },
                None => GatewayError::Rejected {
                    key,
                    reason: exit.detail,
                },
            });
        }

        let path = handle.output_path.display().to_string();
        let metadata = match fs::metadata(&handle.output_path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(GatewayError::MissingOutput { key, path }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::MissingOutput { key, path })
            }
            Err(source) => return Err(GatewayError::Io { path, source }),
        };
        if metadata.len() == 0 {
            return Err(GatewayError::EmptyOutput { key, path });
        }

        Ok(WorkerResult {
            key: handle.key,
            output_path: handle.output_path,
            bytes: metadata.len(),
            exit,
        })
    }
}

type InProcessHandler = dyn Fn(&UnitOfWork) -> Result<(), String> + Send + Sync;

/// Runs workers as in-process callbacks; the callback is expected to write the
/// report to `unit.expected_output_path` before returning.
pub struct InProcessRuntime {
    handler: Box<InProcessHandler>,
    next_id: AtomicU64,
    finished: Mutex<BTreeMap<u64, RuntimeExit>>,
}

impl InProcessRuntime {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&UnitOfWork) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            next_id: AtomicU64::new(1),
            finished: Mutex::new(BTreeMap::new()),
        }
    }
}

impl WorkerRuntime for InProcessRuntime {
    fn spawn(&self, unit: &UnitOfWork) -> Result<u64, GatewayError> {
        let invocation_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exit = match (self.handler)(unit) {
            Ok(()) => RuntimeExit::succeeded(),
            Err(reason) => RuntimeExit::failed(reason),
        };
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(invocation_id, exit);
        Ok(invocation_id)
    }

    fn wait(
        &self,
        invocation_id: u64,
        _timeout: Option<Duration>,
    ) -> Result<RuntimeExit, GatewayError> {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&invocation_id)
            .ok_or(GatewayError::UnknownInvocation { invocation_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::context_loader::ContextBundle;
    use tempfile::tempdir;

    fn unit(output: PathBuf) -> UnitOfWork {
        UnitOfWork {
            capability: WorkerCapability::Research,
            context_bundle: ContextBundle::empty("sess-1", "gather"),
            expected_output_key: ReportKey::new("sess-1", "gather-1", WorkerCapability::Research),
            expected_output_path: output.clone(),
            bundle_path: output.with_extension("bundle.md"),
            timeout: None,
        }
    }

    #[test]
    fn capability_parse_is_case_insensitive() {
        assert_eq!(
            WorkerCapability::parse(" Synthesize "),
            Ok(WorkerCapability::Synthesize)
        );
        assert!(WorkerCapability::parse("summarize").is_err());
    }

    #[test]
    fn await_requires_non_empty_output() {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("report.md");
        let runtime = InProcessRuntime::new(|unit| {
            fs::write(&unit.expected_output_path, "").map_err(|err| err.to_string())
        });
        let gateway = Gateway::new(Arc::new(runtime));

        let handle = gateway.invoke(&unit(output)).expect("invoke");
        let err = gateway.await_result(handle).expect_err("empty output");
        assert!(matches!(err, GatewayError::EmptyOutput { .. }));
    }

    #[test]
    fn await_reports_missing_output_and_worker_rejection() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::new(Arc::new(InProcessRuntime::new(|_| Ok(()))));
        let handle = gateway
            .invoke(&unit(dir.path().join("never.md")))
            .expect("invoke");
        assert!(matches!(
            gateway.await_result(handle),
            Err(GatewayError::MissingOutput { .. })
        ));

        let failing = Gateway::new(Arc::new(InProcessRuntime::new(|_| {
            Err("model unavailable".to_string())
        })));
        let handle = failing
            .invoke(&unit(dir.path().join("never.md")))
            .expect("invoke");
        let err = failing.await_result(handle).expect_err("rejected");
        assert!(err.to_string().contains("model unavailable"));
    }

    #[test]
    fn await_returns_written_size() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::new(Arc::new(InProcessRuntime::new(|unit| {
            fs::write(&unit.expected_output_path, "report").map_err(|err| err.to_string())
        })));
        let handle = gateway
            .invoke(&unit(dir.path().join("report.md")))
            .expect("invoke");
        let result = gateway.await_result(handle).expect("result");
        assert_eq!(result.bytes, 6);
        assert!(result.exit.success);
    }
}

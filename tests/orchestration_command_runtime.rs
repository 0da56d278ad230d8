#![cfg(target_os = "linux")]

use phaseloom::config::{EngineSettings, ProtocolRegistry, WorkerCommandConfig};
use phaseloom::orchestration::{
    Engine, NextDirective, OrchestratorError, SessionOptions, StepStatus, WorkerCapability,
};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

const SHELL_WORKER: &str = r#"digest=$(sha256sum "$PHASELOOM_BUNDLE_PATH" | cut -d' ' -f1)
printf '[context_ack]\nbundle: %s\n[/context_ack]\n[body]\n%s body\n[/body]\n[summary]\n%s done\n[/summary]\n[directives]\n[/directives]\n' "$digest" "$PHASELOOM_TASK_ID" "$PHASELOOM_TASK_ID" > "$PHASELOOM_OUTPUT_PATH""#;

const TWO_STEPS: &str = r#"
id: two_steps
protocol_type: linear_sequence
phases:
  - id: intake
    capability: clarify
    context: { pattern: workflow_only }
  - id: draft
    capability: generate
    context: { pattern: immediate_predecessor }
"#;

fn shell(script: &str) -> WorkerCommandConfig {
    WorkerCommandConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: BTreeMap::new(),
    }
}

fn engine(root: &Path, generate_script: &str) -> Engine {
    let mut settings = EngineSettings::new(root);
    settings.workers = BTreeMap::from([
        (WorkerCapability::Clarify, shell(SHELL_WORKER)),
        (WorkerCapability::Generate, shell(generate_script)),
    ]);
    let mut registry = ProtocolRegistry::new();
    registry
        .insert(serde_yaml::from_str(TWO_STEPS).expect("parse protocol"))
        .expect("register protocol");
    Engine::with_command_runtime(settings, registry).expect("engine")
}

#[test]
fn shell_workers_acknowledge_bundle_digest_and_complete() {
    let dir = tempdir().expect("tempdir");
    let engine = engine(dir.path(), SHELL_WORKER);
    let session = engine
        .create_session("two_steps", SessionOptions::default(), 1_700_000_000)
        .expect("create");

    let settled = engine
        .run_until_settled(&session.session_id, 1_700_000_001)
        .expect("settle");
    assert_eq!(settled, NextDirective::Complete);

    let stored = engine
        .store()
        .load_archived(&session.session_id)
        .expect("archived");
    assert!(stored
        .step_outputs
        .values()
        .all(|record| record.status == StepStatus::Sealed));
    let draft = stored.latest_sealed("draft").expect("draft sealed");
    let report = engine
        .exchange()
        .read_report(&draft.reports[0])
        .expect("read report");
    assert_eq!(report.summary, "draft-2 done");
}

#[test]
fn failing_shell_worker_surfaces_stderr() {
    let dir = tempdir().expect("tempdir");
    let engine = engine(dir.path(), "echo 'model quota exhausted' >&2; exit 7");
    let session = engine
        .create_session("two_steps", SessionOptions::default(), 1_700_000_000)
        .expect("create");

    let err = engine
        .run_until_settled(&session.session_id, 1_700_000_001)
        .expect_err("draft fails");
    match err {
        OrchestratorError::WorkerFailure { phase_id, reason } => {
            assert_eq!(phase_id, "draft");
            assert!(reason.contains("model quota exhausted"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

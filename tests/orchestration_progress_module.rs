use phaseloom::config::{EngineSettings, ProtocolRegistry};
use phaseloom::orchestration::{
    Engine, InProcessRuntime, SessionOptions, SessionStatus, UnitOfWork,
};
use std::fs;
use std::sync::Arc;

const SINGLE: &str = r#"
id: single
protocol_type: linear_sequence
phases:
  - id: draft
    capability: generate
    context: { pattern: workflow_only }
"#;

fn write_report(unit: &UnitOfWork) -> Result<(), String> {
    let text = format!(
        "[context_ack]\nbundle: {}\n[/context_ack]\n[body]\ndraft body\n[/body]\n[summary]\ndrafted\n[/summary]\n[directives]\n[/directives]\n",
        unit.context_bundle.digest()
    );
    fs::write(&unit.expected_output_path, text).map_err(|err| err.to_string())
}

#[test]
fn progress_snapshot_tracks_every_checkpoint() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut registry = ProtocolRegistry::new();
    registry
        .insert(serde_yaml::from_str(SINGLE).expect("parse protocol"))
        .expect("register");
    let engine = Engine::new(
        EngineSettings::new(temp.path()),
        registry,
        Arc::new(InProcessRuntime::new(write_report)),
    )
    .expect("engine");

    let session = engine
        .create_session("single", SessionOptions::default(), 10)
        .expect("create");
    let progress = engine
        .store()
        .load_progress(&session.session_id)
        .expect("progress");
    assert_eq!(progress.status, SessionStatus::Initialized);
    assert_eq!(progress.fsm_state, "init");
    assert_eq!(progress.summary, "initialized");
    assert_eq!(progress.sealed_steps, 0);

    engine
        .halt(&session.session_id, "waiting on budget", Vec::new(), 11)
        .expect("halt");
    let progress = engine
        .store()
        .load_progress(&session.session_id)
        .expect("progress");
    assert_eq!(progress.status, SessionStatus::Halted);
    assert!(progress.pending_external_input);
    assert_eq!(progress.summary, "halted: waiting on budget");

    engine
        .release_halt(&session.session_id, Vec::new(), 12)
        .expect("release");
    engine
        .run_until_settled(&session.session_id, 13)
        .expect("settle");
    let progress = engine
        .store()
        .load_progress(&session.session_id)
        .expect("progress");
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.fsm_state, "complete");
    assert_eq!(progress.sealed_steps, 1);
    assert!(progress.in_flight_phase.is_none());
    assert!(!progress.pending_external_input);
}

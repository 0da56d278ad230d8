use phaseloom::config::{ConfigError, ProtocolDefinition, ProtocolRegistry};
use phaseloom::orchestration::{Engine, SessionOptions, SessionStatus};
use std::fs;

const BASE: &str = r#"
id: review_loop
protocol_type: phase_graph
phases:
  - id: draft
    capability: generate
    context: { pattern: workflow_only }
  - id: review
    capability: validate
    context: { pattern: immediate_predecessor }
    gate:
      criteria:
        - id: no_gaps
          check: { kind: no_directive, key: gap }
    remediation: { target: draft, max_loops: 2 }
"#;

fn validate(yaml: &str) -> Result<(), ConfigError> {
    let protocol: ProtocolDefinition = serde_yaml::from_str(yaml).expect("parse protocol");
    protocol.validate()
}

#[test]
fn engine_boots_from_settings_file_and_protocol_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    let protocols = temp.path().join("protocols");
    fs::create_dir_all(&protocols).expect("mkdir");
    fs::write(protocols.join("review_loop.yaml"), BASE).expect("write protocol");
    let settings = temp.path().join("phaseloom.yaml");
    fs::write(
        &settings,
        format!(
            "state_root: {}\nprotocols_dir: {}\nlimits:\n  max_retries: 1\nworkers:\n  generate:\n    command: draft-worker\n",
            temp.path().join("state").display(),
            protocols.display()
        ),
    )
    .expect("write settings");

    let engine = Engine::from_settings_path(&settings).expect("engine");
    let session = engine
        .create_session(
            "review_loop",
            SessionOptions {
                session_id: Some("sess-config".to_string()),
                ..SessionOptions::default()
            },
            1,
        )
        .expect("create");
    assert_eq!(session.status, SessionStatus::Initialized);
    assert!(temp.path().join("state/sessions/sess-config.json").is_file());
    assert!(engine
        .create_session(
            "review_loop",
            SessionOptions {
                session_id: Some("sess-config".to_string()),
                ..SessionOptions::default()
            },
            2,
        )
        .is_err());
}

#[test]
fn duplicate_protocol_ids_are_rejected() {
    let mut registry = ProtocolRegistry::new();
    registry
        .insert(serde_yaml::from_str(BASE).expect("parse"))
        .expect("first insert");
    let err = registry
        .insert(serde_yaml::from_str(BASE).expect("parse"))
        .expect_err("duplicate");
    assert!(matches!(err, ConfigError::DuplicateProtocol { .. }));
}

#[test]
fn structural_protocol_mistakes_are_caught_at_load() {
    assert!(validate(BASE).is_ok());

    let cases = [
        (
            BASE.replace("target: draft", "target: review_later"),
            "unknown phase",
        ),
        (
            BASE.replace("max_loops: 2", "max_loops: 0"),
            "max_loops",
        ),
        (
            BASE.replace("protocol_type: phase_graph", "protocol_type: linear_sequence"),
            "linear_sequence",
        ),
        (
            BASE.replace(
                "context: { pattern: workflow_only }",
                "context: { pattern: immediate_predecessor }",
            ),
            "no predecessor",
        ),
        (BASE.replace("id: review\n", "id: complete\n"), "reserved"),
        (
            BASE.replace(
                "    capability: generate\n",
                "    capability: generate\n    type: parallel\n    branches: [only]\n",
            ),
            "at least two",
        ),
    ];
    for (yaml, expected) in cases {
        let err = validate(&yaml).expect_err(expected);
        assert!(
            err.to_string().contains(expected),
            "`{err}` should mention `{expected}`"
        );
    }
}

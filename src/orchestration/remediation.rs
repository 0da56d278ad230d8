use crate::config::{ExhaustionPolicy, PhaseConfig, ProtocolDefinition};
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::fsm::FsmDefinition;
use crate::orchestration::impasse::{self, ImpasseRoute, ImpasseSignal};
use crate::orchestration::quality_gate::{QualityGateResult, Verdict};
use crate::orchestration::session_store::{
    remediation_counter_key, HaltReason, HaltState, PendingRemediation, Session, SessionStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationDecision {
    Proceed,
    LoopBack { target: String, count: u32 },
    /// Remediation ran out; the phase was accepted with its gaps on record.
    Forced { gaps: Vec<String> },
    Halted {
        reason: HaltReason,
        open_questions: Vec<String>,
    },
}

/// Loops `session` back from `phase_id` to `target` unless the pair's
/// counter already reached `max_loops`.
#[allow(clippy::too_many_arguments)]
pub fn guarded_loop_back(
    session: &mut Session,
    def: &FsmDefinition,
    phase_id: &str,
    target: &str,
    max_loops: u32,
    gaps: Vec<String>,
    reason: &str,
    now: i64,
) -> Result<u32, OrchestratorError> {
    let count = session.remediation_count(phase_id, target);
    if count >= max_loops {
        return Err(OrchestratorError::RemediationExhausted {
            phase_id: phase_id.to_string(),
            target: target.to_string(),
            max_loops,
        });
    }
    session.fsm.loop_back(def, target, now, reason)?;
    let count = count + 1;
    session
        .remediation_counters
        .insert(remediation_counter_key(phase_id, target), count);
    session.pending_remediation = Some(PendingRemediation {
        target_phase: target.to_string(),
        from_phase: phase_id.to_string(),
        gaps,
    });
    Ok(count)
}

pub fn halt_session(
    session: &mut Session,
    def: &FsmDefinition,
    reason: HaltReason,
    phase_id: Option<String>,
    open_questions: Vec<String>,
    rerun_on_resume: bool,
    now: i64,
) -> Result<(), OrchestratorError> {
    session
        .fsm
        .halt(def, now, rerun_on_resume, reason.to_string())?;
    session.status = SessionStatus::Halted;
    session.halt = Some(HaltState {
        reason,
        phase_id,
        open_questions: dedupe(open_questions),
        halted_at: now,
    });
    Ok(())
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

pub struct RemediationController<'a> {
    protocol: &'a ProtocolDefinition,
    def: &'a FsmDefinition,
}

impl<'a> RemediationController<'a> {
    pub fn new(protocol: &'a ProtocolDefinition, def: &'a FsmDefinition) -> Self {
        Self { protocol, def }
    }

    /// Acts on a sealed gate verdict. The session must already sit in the
    /// phase's state.
    pub fn decide(
        &self,
        session: &mut Session,
        phase_index: usize,
        result: &mut QualityGateResult,
        now: i64,
    ) -> Result<RemediationDecision, OrchestratorError> {
        if result.verdict != Verdict::NoGo {
            return Ok(RemediationDecision::Proceed);
        }
        let phase = self.phase(phase_index)?;
        let Some(rule) = phase.remediation_rule(self.protocol.max_remediation_loops()) else {
            let open_questions = result.gaps.clone();
            halt_session(
                session,
                self.def,
                HaltReason::BlockingGaps,
                Some(phase.id.clone()),
                open_questions.clone(),
                true,
                now,
            )?;
            return Ok(RemediationDecision::Halted {
                reason: HaltReason::BlockingGaps,
                open_questions,
            });
        };

        result.remediation_target = Some(rule.target.clone());
        match guarded_loop_back(
            session,
            self.def,
            &phase.id,
            &rule.target,
            rule.max_loops,
            result.gaps.clone(),
            "quality gate NO-GO",
            now,
        ) {
            Ok(count) => {
                result.remediation_count = count;
                Ok(RemediationDecision::LoopBack {
                    target: rule.target,
                    count,
                })
            }
            Err(OrchestratorError::RemediationExhausted { max_loops, .. }) => {
                result.remediation_count = max_loops;
                match rule.on_exhausted {
                    ExhaustionPolicy::ForceComplete => {
                        tracing::warn!(
                            session_id = %session.session_id,
                            phase_id = %phase.id,
                            target = %rule.target,
                            max_loops,
                            "remediation exhausted; accepting phase with recorded gaps"
                        );
                        result.verdict = Verdict::Conditional;
                        result.forced = true;
                        Ok(RemediationDecision::Forced {
                            gaps: result.gaps.clone(),
                        })
                    }
                    ExhaustionPolicy::Escalate => {
                        let open_questions = result.gaps.clone();
                        halt_session(
                            session,
                            self.def,
                            HaltReason::Escalated,
                            Some(phase.id.clone()),
                            open_questions.clone(),
                            true,
                            now,
                        )?;
                        Ok(RemediationDecision::Halted {
                            reason: HaltReason::Escalated,
                            open_questions,
                        })
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    pub fn on_impasse(
        &self,
        session: &mut Session,
        phase_index: usize,
        signal: &ImpasseSignal,
        now: i64,
    ) -> Result<RemediationDecision, OrchestratorError> {
        let phase = self.phase(phase_index)?;
        match impasse::route(self.protocol, phase_index, signal) {
            ImpasseRoute::Halt { questions } => {
                halt_session(
                    session,
                    self.def,
                    HaltReason::AwaitingClarification,
                    Some(phase.id.clone()),
                    questions.clone(),
                    true,
                    now,
                )?;
                Ok(RemediationDecision::Halted {
                    reason: HaltReason::AwaitingClarification,
                    open_questions: questions,
                })
            }
            ImpasseRoute::LoopBack { target, max_loops } => {
                let reason = format!("impasse {}", signal.kind);
                match guarded_loop_back(
                    session,
                    self.def,
                    &phase.id,
                    &target,
                    max_loops,
                    vec![signal.detail.clone()],
                    &reason,
                    now,
                ) {
                    Ok(count) => Ok(RemediationDecision::LoopBack { target, count }),
                    Err(OrchestratorError::RemediationExhausted { max_loops, .. }) => {
                        let open_questions = vec![
                            format!("{}: {}", signal.kind, signal.detail),
                            format!(
                                "impasse persisted after {max_loops} loop(s) to `{target}`"
                            ),
                        ];
                        halt_session(
                            session,
                            self.def,
                            HaltReason::Escalated,
                            Some(phase.id.clone()),
                            open_questions.clone(),
                            true,
                            now,
                        )?;
                        Ok(RemediationDecision::Halted {
                            reason: HaltReason::Escalated,
                            open_questions,
                        })
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    fn phase(&self, phase_index: usize) -> Result<&'a PhaseConfig, OrchestratorError> {
        self.protocol
            .phases
            .get(phase_index)
            .ok_or_else(|| OrchestratorError::UnknownPhase {
                protocol_id: self.protocol.id.clone(),
                phase_id: format!("#{phase_index}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::fsm::HALTED_STATE;
    use crate::orchestration::impasse::ImpasseKind;
    use crate::orchestration::session_store::{SessionOptions, SessionStore};
    use tempfile::tempdir;

    fn protocol(on_exhausted: &str) -> ProtocolDefinition {
        serde_yaml::from_str(&format!(
            r#"
id: review
protocol_type: phase_graph
phases:
  - id: draft
    capability: generate
    context: {{ pattern: workflow_only }}
  - id: review
    capability: validate
    context: {{ pattern: immediate_predecessor }}
    remediation: {{ target: draft, max_loops: 2, on_exhausted: {on_exhausted} }}
"#
        ))
        .expect("parse protocol")
    }

    fn session_at_review(protocol: &ProtocolDefinition, def: &FsmDefinition) -> Session {
        let dir = tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let mut session = store
            .create(protocol, SessionOptions::default(), 1)
            .expect("create");
        session.fsm.transition(def, "draft", 2).expect("draft");
        session.fsm.transition(def, "review", 3).expect("review");
        session
    }

    fn no_go() -> QualityGateResult {
        QualityGateResult {
            phase_id: "review".to_string(),
            seq: 2,
            verdict: Verdict::NoGo,
            criteria_checked: Vec::new(),
            gaps: vec!["missing tests".to_string()],
            remediation_target: None,
            remediation_count: 0,
            forced: false,
            evaluated_at: 4,
        }
    }

    #[test]
    fn no_go_loops_back_until_bound_then_forces() {
        let protocol = protocol("force_complete");
        let def = FsmDefinition::from_protocol(&protocol);
        let mut session = session_at_review(&protocol, &def);
        let controller = RemediationController::new(&protocol, &def);

        for expected in 1..=2 {
            let mut result = no_go();
            let decision = controller
                .decide(&mut session, 1, &mut result, 10)
                .expect("decide");
            assert_eq!(
                decision,
                RemediationDecision::LoopBack {
                    target: "draft".to_string(),
                    count: expected
                }
            );
            assert_eq!(session.fsm.state, "draft");
            assert_eq!(
                session.pending_remediation.as_ref().map(|p| p.gaps.clone()),
                Some(vec!["missing tests".to_string()])
            );
            session.fsm.transition(&def, "review", 11).expect("forward");
        }

        let mut result = no_go();
        let decision = controller
            .decide(&mut session, 1, &mut result, 12)
            .expect("decide");
        assert!(matches!(decision, RemediationDecision::Forced { .. }));
        assert_eq!(result.verdict, Verdict::Conditional);
        assert!(result.forced);
        assert_eq!(result.remediation_count, 2);
        assert_eq!(session.fsm.state, "review");
        assert_eq!(session.remediation_count("review", "draft"), 2);
    }

    #[test]
    fn escalate_policy_halts_with_gaps() {
        let protocol = protocol("escalate");
        let def = FsmDefinition::from_protocol(&protocol);
        let mut session = session_at_review(&protocol, &def);
        session
            .remediation_counters
            .insert(remediation_counter_key("review", "draft"), 2);

        let mut result = no_go();
        let decision = RemediationController::new(&protocol, &def)
            .decide(&mut session, 1, &mut result, 10)
            .expect("decide");
        assert!(matches!(
            decision,
            RemediationDecision::Halted {
                reason: HaltReason::Escalated,
                ..
            }
        ));
        assert_eq!(session.fsm.state, HALTED_STATE);
        assert_eq!(session.status, SessionStatus::Halted);
        assert_eq!(
            session.halt.as_ref().map(|h| h.open_questions.clone()),
            Some(vec!["missing tests".to_string()])
        );
    }

    #[test]
    fn exhausted_guard_is_a_typed_error() {
        let protocol = protocol("force_complete");
        let def = FsmDefinition::from_protocol(&protocol);
        let mut session = session_at_review(&protocol, &def);
        session
            .remediation_counters
            .insert(remediation_counter_key("review", "draft"), 1);
        let err = guarded_loop_back(&mut session, &def, "review", "draft", 1, Vec::new(), "x", 5)
            .expect_err("exhausted");
        assert!(matches!(err, OrchestratorError::RemediationExhausted { .. }));
        assert_eq!(session.fsm.state, "review");
    }

    #[test]
    fn conflict_impasse_halts_for_clarification() {
        let protocol = protocol("force_complete");
        let def = FsmDefinition::from_protocol(&protocol);
        let mut session = session_at_review(&protocol, &def);
        let signal = ImpasseSignal {
            kind: ImpasseKind::Conflict,
            detail: "sources disagree on scope".to_string(),
        };
        let decision = RemediationController::new(&protocol, &def)
            .on_impasse(&mut session, 1, &signal, 10)
            .expect("route");
        assert!(matches!(
            decision,
            RemediationDecision::Halted {
                reason: HaltReason::AwaitingClarification,
                ..
            }
        ));
        assert!(session.fsm.paused_rerun);
    }
}

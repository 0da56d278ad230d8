use crate::config::{LimitsConfig, PhaseConfig, PhaseType, ProtocolDefinition};
use crate::orchestration::context_loader::{ContextBundle, ContextLoader};
use crate::orchestration::error::{io_error, OrchestratorError};
use crate::orchestration::fsm::FsmDefinition;
use crate::orchestration::gateway::{Gateway, GatewayError, UnitOfWork, WorkerResult};
use crate::orchestration::impasse::{ImpasseDetector, ImpasseObservation, ImpasseSignal};
use crate::orchestration::quality_gate::{self, GateInput, Verdict};
use crate::orchestration::remediation::{RemediationController, RemediationDecision};
use crate::orchestration::report_exchange::{Report, ReportExchange, ReportKey};
use crate::orchestration::session_store::{
    InFlightStep, Session, SessionStatus, SessionStore, StepRecord, StepStatus, StepTimestamps,
    StepType,
};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::quote_value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseLimits {
    pub max_retries: u32,
    pub timeout: Option<Duration>,
}

/// Phase limits win over protocol limits, which win over engine settings.
pub fn resolve_phase_limits(
    settings: &LimitsConfig,
    protocol: &ProtocolDefinition,
    phase: &PhaseConfig,
) -> PhaseLimits {
    let phase_limits = phase.limits.as_ref();
    let protocol_limits = protocol.limits.as_ref();
    PhaseLimits {
        max_retries: phase_limits
            .and_then(|v| v.max_retries)
            .or_else(|| protocol_limits.and_then(|v| v.max_retries))
            .or(settings.max_retries)
            .unwrap_or(0),
        timeout: phase_limits
            .and_then(|v| v.timeout_seconds)
            .or_else(|| protocol_limits.and_then(|v| v.step_timeout_seconds))
            .or(settings.step_timeout_seconds)
            .map(Duration::from_secs),
    }
}

pub fn task_id(phase_id: &str, seq: u32, branch: Option<&str>) -> String {
    match branch {
        Some(branch) => format!("{phase_id}-{seq}-{branch}"),
        None => format!("{phase_id}-{seq}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub seq: u32,
    pub phase_id: String,
    pub attempt: u32,
    pub reports: Vec<ReportKey>,
    pub failed_branches: BTreeMap<String, String>,
    /// `None` for phases without gate criteria.
    pub verdict: Option<Verdict>,
    pub impasse: Option<ImpasseSignal>,
    pub decision: RemediationDecision,
}

struct Dispatch {
    branch: Option<String>,
    unit: UnitOfWork,
}

struct Collected {
    reports: Vec<(ReportKey, Report)>,
    failed_branches: BTreeMap<String, String>,
}

pub struct StepExecutor<'a> {
    pub store: &'a SessionStore,
    pub exchange: &'a ReportExchange,
    pub loader: &'a ContextLoader,
    pub gateway: &'a Gateway,
    pub detector: &'a dyn ImpasseDetector,
    pub limits: &'a LimitsConfig,
}

impl StepExecutor<'_> {
    /// Runs the phase at `phase_index` to a sealed record, re-dispatching
    /// worker failures up to the phase's retry limit.
    pub fn execute(
        &self,
        session: &mut Session,
        protocol: &ProtocolDefinition,
        def: &FsmDefinition,
        phase_index: usize,
        now: i64,
    ) -> Result<StepOutcome, OrchestratorError> {
        let phase = protocol
            .phases
            .get(phase_index)
            .ok_or_else(|| OrchestratorError::UnknownPhase {
                protocol_id: protocol.id.clone(),
                phase_id: format!("#{phase_index}"),
            })?;
        let limits = resolve_phase_limits(self.limits, protocol, phase);

        let mut retries = 0;
        loop {
            match self.run_attempt(session, protocol, def, phase_index, limits, now) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && retries < limits.max_retries => {
                    retries += 1;
                    tracing::warn!(
                        session_id = %session.session_id,
                        phase_id = %phase.id,
                        retry = retries,
                        max_retries = limits.max_retries,
                        error = %err,
                        "retrying phase after worker failure"
                    );
                    self.store.append_engine_log(
                        &session.session_id,
                        now,
                        format!(
                            "decision=retry phase_id={} retry={retries} max_retries={}",
                            phase.id, limits.max_retries
                        ),
                    )?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_attempt(
        &self,
        session: &mut Session,
        protocol: &ProtocolDefinition,
        def: &FsmDefinition,
        phase_index: usize,
        limits: PhaseLimits,
        now: i64,
    ) -> Result<StepOutcome, OrchestratorError> {
        let phase = &protocol.phases[phase_index];
        let rerun = session.fsm.awaiting_rerun && session.fsm.state == phase.id;
        if !rerun {
            if let Err(err) = session.fsm.check(def, &phase.id, now) {
                session.last_error = Some(err.to_string());
                session.touch(now);
                self.store.save(session)?;
                return Err(err);
            }
        }

        let bundle = self.loader.load(session, protocol, phase_index, now)?;
        let digest = bundle.digest();
        let seq = session.next_seq();
        let attempt = session
            .step_outputs
            .values()
            .filter(|record| record.phase_id == phase.id)
            .count() as u32
            + 1;

        let dispatches = self.plan_units(session, phase, seq, &bundle, limits.timeout);
        let rendered = bundle.render();
        for dispatch in &dispatches {
            atomic_write_file(&dispatch.unit.bundle_path, rendered.as_bytes())
                .map_err(|e| io_error(&dispatch.unit.bundle_path, e))?;
        }
        let units = dispatches
            .iter()
            .map(|dispatch| dispatch.unit.expected_output_key.clone())
            .collect::<Vec<_>>();

        let step_type = if rerun {
            StepType::Remediation
        } else {
            match phase.phase_type {
                PhaseType::Linear => StepType::Linear,
                PhaseType::Optional => StepType::Optional,
                PhaseType::Iterative => StepType::Iterative,
                PhaseType::Parallel => StepType::Parallel,
            }
        };
        session.insert_record(StepRecord {
            seq,
            phase_id: phase.id.clone(),
            name: phase.display_name().to_string(),
            step_type,
            attempt,
            status: StepStatus::Started,
            input_summary: format!(
                "{} bundle, ~{} tokens, {} merged input(s)",
                bundle.metadata.pattern.as_str(),
                bundle.estimated_tokens,
                bundle.merged_inputs()
            ),
            output_summary: None,
            started_at: now,
            completed_at: None,
            bundle_digest: digest.clone(),
            reports: Vec::new(),
            failed_branches: BTreeMap::new(),
            merged_inputs: bundle.merged_inputs(),
            error: None,
        });
        session.in_flight = Some(InFlightStep {
            seq,
            phase_id: phase.id.clone(),
            attempt,
            units: units.clone(),
        });
        session.status = SessionStatus::InProgress;
        session.last_error = None;
        session.touch(now);
        // Durable before any work request leaves the process.
        self.store.checkpoint(
            session,
            format!("step {seq} `{}` dispatched", phase.id),
            false,
            format!("await {} worker result(s)", units.len()),
        )?;
        self.store.append_engine_log(
            &session.session_id,
            now,
            format!(
                "decision=dispatch phase_id={} seq={seq} attempt={attempt} units={} rerun={rerun}",
                phase.id,
                units.len()
            ),
        )?;
        tracing::info!(
            session_id = %session.session_id,
            phase_id = %phase.id,
            seq,
            attempt,
            units = units.len(),
            "dispatching phase"
        );

        let completed = self
            .collect(phase, dispatches, &digest)
            .and_then(|collected| {
                self.seal(
                    session,
                    protocol,
                    def,
                    phase_index,
                    seq,
                    rerun,
                    bundle.merged_inputs(),
                    collected,
                    now,
                )
            });
        match completed {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail(session, &phase.id, seq, &err, now)?;
                Err(err)
            }
        }
    }

    fn plan_units(
        &self,
        session: &Session,
        phase: &PhaseConfig,
        seq: u32,
        bundle: &ContextBundle,
        timeout: Option<Duration>,
    ) -> Vec<Dispatch> {
        let branches: Vec<Option<String>> = if phase.phase_type == PhaseType::Parallel {
            phase.branches.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        };
        branches
            .into_iter()
            .map(|branch| {
                let key = ReportKey::new(
                    session.session_id.clone(),
                    task_id(&phase.id, seq, branch.as_deref()),
                    phase.capability,
                );
                Dispatch {
                    unit: UnitOfWork {
                        capability: phase.capability,
                        context_bundle: bundle.clone(),
                        expected_output_path: self.exchange.path_for(&key),
                        bundle_path: self.exchange.bundle_path_for(&key),
                        expected_output_key: key,
                        timeout,
                    },
                    branch,
                }
            })
            .collect()
    }

    /// Invokes every unit before awaiting any, then parses what came back.
    fn collect(
        &self,
        phase: &PhaseConfig,
        dispatches: Vec<Dispatch>,
        digest: &str,
    ) -> Result<Collected, OrchestratorError> {
        let total = dispatches.len();
        let mut pending = Vec::with_capacity(total);
        for dispatch in dispatches {
            let invoked = self.gateway.invoke(&dispatch.unit);
            pending.push((dispatch.branch, invoked));
        }

        let mut finished: Vec<(Option<String>, Result<WorkerResult, GatewayError>)> =
            Vec::with_capacity(total);
        for (branch, invoked) in pending {
            let result = invoked.and_then(|handle| self.gateway.await_result(handle));
            finished.push((branch, result));
        }

        let mut reports = Vec::new();
        let mut failed_branches = BTreeMap::new();
        for (branch, result) in finished {
            let result = match (result, branch.clone()) {
                (Ok(result), _) => result,
                (Err(err), Some(branch)) => {
                    tracing::warn!(phase_id = %phase.id, branch = %branch, error = %err, "branch failed");
                    failed_branches.insert(branch, err.to_string());
                    continue;
                }
                (Err(err), None) => return Err(OrchestratorError::from_gateway(&phase.id, err)),
            };
            match (self.accept_report(&result.key, digest), branch) {
                (Ok(report), _) => reports.push((result.key, report)),
                (Err(reason), Some(branch)) => {
                    tracing::warn!(phase_id = %phase.id, branch = %branch, reason = %reason, "branch report rejected");
                    failed_branches.insert(branch, reason);
                }
                (Err(reason), None) => {
                    return Err(OrchestratorError::WorkerFailure {
                        phase_id: phase.id.clone(),
                        reason,
                    })
                }
            }
        }

        if reports.is_empty() {
            let reason = if failed_branches.is_empty() {
                "no worker produced a report".to_string()
            } else {
                format!(
                    "all {total} branches failed: {}",
                    failed_branches
                        .iter()
                        .map(|(branch, error)| format!("{branch}: {error}"))
                        .collect::<Vec<_>>()
                        .join("; ")
                )
            };
            return Err(OrchestratorError::WorkerFailure {
                phase_id: phase.id.clone(),
                reason,
            });
        }
        Ok(Collected {
            reports,
            failed_branches,
        })
    }

    /// A report that fails to parse or acknowledges a different bundle counts
    /// as a failed unit of work.
    fn accept_report(&self, key: &ReportKey, digest: &str) -> Result<Report, String> {
        let report = self
            .exchange
            .read_report(key)
            .map_err(|err| format!("report `{key}` invalid: {err}"))?;
        if report.context_ack.bundle_digest != digest {
            return Err(format!(
                "report `{key}` invalid: context acknowledgment `{}` does not match bundle digest",
                report.context_ack.bundle_digest
            ));
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn seal(
        &self,
        session: &mut Session,
        protocol: &ProtocolDefinition,
        def: &FsmDefinition,
        phase_index: usize,
        seq: u32,
        rerun: bool,
        merged_inputs: usize,
        collected: Collected,
        now: i64,
    ) -> Result<StepOutcome, OrchestratorError> {
        let phase = &protocol.phases[phase_index];
        let (keys, reports): (Vec<ReportKey>, Vec<Report>) = collected.reports.into_iter().unzip();

        let previous = match session.latest_sealed(&phase.id) {
            Some(record) => record
                .reports
                .iter()
                .map(|key| {
                    self.exchange
                        .read_report(key)
                        .map_err(|err| OrchestratorError::from_report(&key.to_string(), err))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let impasse = self.detector.detect(
            &protocol.impasse,
            ImpasseObservation {
                phase_id: &phase.id,
                reports: &reports,
                previous: &previous,
            },
        );
        let criteria = phase.gate_criteria();
        let mut gate = (!criteria.is_empty()).then(|| {
            quality_gate::evaluate(
                &phase.id,
                seq,
                GateInput {
                    reports: &reports,
                    merged_inputs,
                },
                criteria,
                now,
            )
        });

        if rerun {
            session.fsm.awaiting_rerun = false;
        } else {
            session.fsm.transition(def, &phase.id, now)?;
        }

        let output_summary = reports
            .iter()
            .map(|report| report.summary.trim())
            .collect::<Vec<_>>()
            .join("; ");
        if let Some(record) = session.step_outputs.get_mut(&seq) {
            record.status = StepStatus::Sealed;
            record.completed_at = Some(now);
            record.output_summary = Some(output_summary);
            record.reports = keys.clone();
            record.failed_branches = collected.failed_branches.clone();
        }
        session.step_timestamps.insert(
            seq,
            StepTimestamps {
                started_at: session
                    .step_outputs
                    .get(&seq)
                    .map(|record| record.started_at)
                    .unwrap_or(now),
                completed_at: Some(now),
            },
        );
        session.in_flight = None;
        if session
            .pending_remediation
            .as_ref()
            .map(|pending| pending.target_phase == phase.id)
            .unwrap_or(false)
        {
            session.pending_remediation = None;
        }

        let controller = RemediationController::new(protocol, def);
        let decision = match (&impasse, gate.as_mut()) {
            (Some(signal), _) => controller.on_impasse(session, phase_index, signal, now)?,
            (None, Some(result)) => controller.decide(session, phase_index, result, now)?,
            (None, None) => RemediationDecision::Proceed,
        };
        let verdict = gate.as_ref().map(|result| result.verdict);
        if let Some(result) = gate {
            session.gate_results.push(result);
        }

        session.touch(now);
        self.store.checkpoint(
            session,
            format!("step {seq} `{}` sealed", phase.id),
            matches!(decision, RemediationDecision::Halted { .. }),
            next_action_label(&decision),
        )?;
        self.store.append_engine_log(
            &session.session_id,
            now,
            format!(
                "decision=seal phase_id={} seq={seq} reports={} failed_branches={} verdict={} impasse={} next={}",
                phase.id,
                keys.len(),
                collected.failed_branches.len(),
                verdict.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string()),
                impasse
                    .as_ref()
                    .map(|signal| signal.kind.as_str())
                    .unwrap_or("none"),
                next_action_label(&decision)
            ),
        )?;
        tracing::info!(
            session_id = %session.session_id,
            phase_id = %phase.id,
            seq,
            reports = keys.len(),
            "phase sealed"
        );

        Ok(StepOutcome {
            seq,
            phase_id: phase.id.clone(),
            attempt: session
                .step_outputs
                .get(&seq)
                .map(|record| record.attempt)
                .unwrap_or(1),
            reports: keys,
            failed_branches: collected.failed_branches,
            verdict,
            impasse,
            decision,
        })
    }

    fn fail(
        &self,
        session: &mut Session,
        phase_id: &str,
        seq: u32,
        err: &OrchestratorError,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        if let Some(record) = session.step_outputs.get_mut(&seq) {
            if record.status == StepStatus::Started {
                record.status = StepStatus::Failed;
                record.completed_at = Some(now);
                record.error = Some(err.to_string());
                session.step_timestamps.insert(
                    seq,
                    StepTimestamps {
                        started_at: record.started_at,
                        completed_at: Some(now),
                    },
                );
            }
        }
        session.in_flight = None;
        session.last_error = Some(err.to_string());
        session.touch(now);
        tracing::warn!(
            session_id = %session.session_id,
            phase_id,
            seq,
            error = %err,
            "phase failed"
        );
        self.store.checkpoint(
            session,
            format!("step {seq} `{phase_id}` failed: {err}"),
            false,
            format!("re-run phase {phase_id}"),
        )?;
        self.store.append_engine_log(
            &session.session_id,
            now,
            format!(
                "decision=fail phase_id={phase_id} seq={seq} retryable={} error={}",
                err.is_retryable(),
                quote_value(&err)
            ),
        )
    }
}

fn next_action_label(decision: &RemediationDecision) -> String {
    match decision {
        RemediationDecision::Proceed => "advance".to_string(),
        RemediationDecision::Forced { .. } => "advance (forced)".to_string(),
        RemediationDecision::LoopBack { target, count } => {
            format!("re-run {target} (loop {count})")
        }
        RemediationDecision::Halted { reason, .. } => format!("release halt ({reason})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhaseLimitsConfig, ProtocolLimitsConfig};

    fn protocol() -> ProtocolDefinition {
        serde_yaml::from_str(
            r#"
id: single
protocol_type: linear_sequence
limits: { max_retries: 2, step_timeout_seconds: 30 }
phases:
  - id: draft
    capability: generate
    context: { pattern: workflow_only }
"#,
        )
        .expect("parse protocol")
    }

    #[test]
    fn phase_limits_layer_over_protocol_and_settings() {
        let mut protocol = protocol();
        let settings = LimitsConfig {
            max_retries: Some(5),
            step_timeout_seconds: Some(90),
            ..LimitsConfig::default()
        };

        let limits = resolve_phase_limits(&settings, &protocol, &protocol.phases[0]);
        assert_eq!(limits.max_retries, 2);
        assert_eq!(limits.timeout, Some(Duration::from_secs(30)));

        protocol.phases[0].limits = Some(PhaseLimitsConfig {
            max_retries: Some(0),
            timeout_seconds: None,
        });
        let limits = resolve_phase_limits(&settings, &protocol, &protocol.phases[0]);
        assert_eq!(limits.max_retries, 0);
        assert_eq!(limits.timeout, Some(Duration::from_secs(30)));

        protocol.limits = Some(ProtocolLimitsConfig::default());
        protocol.phases[0].limits = None;
        let limits = resolve_phase_limits(&settings, &protocol, &protocol.phases[0]);
        assert_eq!(limits.max_retries, 5);
        assert_eq!(limits.timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn retries_default_to_zero() {
        let mut protocol = protocol();
        protocol.limits = None;
        let limits = resolve_phase_limits(&LimitsConfig::default(), &protocol, &protocol.phases[0]);
        assert_eq!(limits.max_retries, 0);
        assert_eq!(limits.timeout, None);
    }

    #[test]
    fn task_ids_carry_branch_suffix() {
        assert_eq!(task_id("gather", 3, None), "gather-3");
        assert_eq!(task_id("gather", 3, Some("web")), "gather-3-web");
    }
}

use crate::config::{EngineSettings, ProtocolDefinition, ProtocolLimitsConfig, ProtocolRegistry};
use crate::orchestration::command_runtime::CommandRuntime;
use crate::orchestration::context_loader::ContextLoader;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::executor::{StepExecutor, StepOutcome};
use crate::orchestration::fsm::{FsmDefinition, COMPLETE_STATE, INIT_STATE};
use crate::orchestration::gateway::{Gateway, WorkerRuntime};
use crate::orchestration::impasse::{DirectiveImpasseDetector, ImpasseDetector};
use crate::orchestration::report_exchange::{ReportExchange, ReportKey};
use crate::orchestration::session_store::{
    HaltReason, HaltState, Session, SessionOptions, SessionStatus, SessionStore, StepStatus,
    StepTimestamps,
};
use crate::shared::logging::quote_value;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What the caller should expect the engine to do next for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextDirective {
    Dispatch {
        phase_id: String,
        rerun: bool,
        /// Keys of a step that was persisted in flight and never sealed.
        in_flight: Vec<ReportKey>,
    },
    Complete,
    Halted {
        reason: HaltReason,
        open_questions: Vec<String>,
    },
}

enum NextTarget {
    Phase { index: usize, rerun: bool },
    Complete,
}

pub struct Engine {
    settings: EngineSettings,
    protocols: ProtocolRegistry,
    store: SessionStore,
    exchange: ReportExchange,
    loader: ContextLoader,
    gateway: Gateway,
    detector: Box<dyn ImpasseDetector>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state_root", &self.settings.state_root)
            .field("protocols", &self.protocols.ids().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        protocols: ProtocolRegistry,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> Result<Self, OrchestratorError> {
        settings.validate()?;
        let store = SessionStore::new(&settings.state_root);
        let exchange = ReportExchange::new(&settings.state_root);
        let loader = ContextLoader::new(exchange.clone(), settings.budgets.clone());
        Ok(Self {
            settings,
            protocols,
            store,
            exchange,
            loader,
            gateway: Gateway::new(runtime),
            detector: Box::new(DirectiveImpasseDetector),
        })
    }

    /// Dispatches through child processes configured under `workers`.
    pub fn with_command_runtime(
        settings: EngineSettings,
        protocols: ProtocolRegistry,
    ) -> Result<Self, OrchestratorError> {
        let runtime = Arc::new(CommandRuntime::new(settings.workers.clone()));
        Self::new(settings, protocols, runtime)
    }

    pub fn from_settings_path(path: &Path) -> Result<Self, OrchestratorError> {
        let settings = EngineSettings::from_path(path)?;
        let protocols = match &settings.protocols_dir {
            Some(dir) => ProtocolRegistry::from_dir(dir)?,
            None => ProtocolRegistry::new(),
        };
        Self::with_command_runtime(settings, protocols)
    }

    pub fn with_impasse_detector(mut self, detector: Box<dyn ImpasseDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn exchange(&self) -> &ReportExchange {
        &self.exchange
    }

    pub fn create_session(
        &self,
        protocol_id: &str,
        options: SessionOptions,
        now: i64,
    ) -> Result<Session, OrchestratorError> {
        let protocol = self.protocol(protocol_id)?;
        let session = self.store.create(&protocol, options, now)?;
        self.store.append_engine_log(
            &session.session_id,
            now,
            format!("decision=create protocol_id={protocol_id}"),
        )?;
        tracing::info!(
            session_id = %session.session_id,
            protocol_id,
            "session created"
        );
        Ok(session)
    }

    /// Executes the next phase of the session and reports what follows.
    pub fn advance(&self, session_id: &str, now: i64) -> Result<NextDirective, OrchestratorError> {
        let mut session = self.load_active(session_id)?;
        match session.status {
            SessionStatus::Completed => {
                return Err(OrchestratorError::SessionTerminal {
                    session_id: session_id.to_string(),
                })
            }
            SessionStatus::Halted => {
                return Err(OrchestratorError::SessionHalted {
                    session_id: session_id.to_string(),
                    reason: session
                        .halt
                        .as_ref()
                        .map(|halt| halt.reason.to_string())
                        .unwrap_or_else(|| "halted".to_string()),
                })
            }
            SessionStatus::Initialized | SessionStatus::InProgress => {}
        }

        let protocol = self.protocol(&session.protocol_id)?;
        let def = FsmDefinition::from_protocol(&protocol);
        self.abandon_in_flight(&mut session, now)?;

        match next_target(&session, &protocol, &def)? {
            NextTarget::Complete => self.complete(&mut session, &def, now)?,
            NextTarget::Phase { index, .. } => {
                let outcome = self.execute(&mut session, &protocol, &def, index, now)?;
                tracing::debug!(
                    session_id,
                    phase_id = %outcome.phase_id,
                    seq = outcome.seq,
                    decision = ?outcome.decision,
                    "advance finished"
                );
                if session.status != SessionStatus::Halted && !session.fsm.awaiting_rerun {
                    if let NextTarget::Complete = next_target(&session, &protocol, &def)? {
                        self.complete(&mut session, &def, now)?;
                    }
                }
            }
        }
        directive_for(&session, &protocol, &def)
    }

    /// Pure read of where the session stands. Calling it any number of times
    /// changes nothing on disk.
    pub fn resume(&self, session_id: &str) -> Result<NextDirective, OrchestratorError> {
        let session = match self.store.load(session_id) {
            Ok(session) => session,
            Err(OrchestratorError::SessionNotFound { .. }) => {
                let archived = self.store.load_archived(session_id)?;
                if archived.status == SessionStatus::Completed {
                    return Ok(NextDirective::Complete);
                }
                return Err(OrchestratorError::SessionNotFound {
                    session_id: session_id.to_string(),
                });
            }
            Err(other) => return Err(other),
        };
        let protocol = self.protocol(&session.protocol_id)?;
        let def = FsmDefinition::from_protocol(&protocol);
        directive_for(&session, &protocol, &def)
    }

    pub fn run_until_settled(
        &self,
        session_id: &str,
        now: i64,
    ) -> Result<NextDirective, OrchestratorError> {
        let max_cycles = self.settings.limits.max_cycles;
        for _ in 0..max_cycles {
            match self.advance(session_id, now)? {
                NextDirective::Dispatch { .. } => continue,
                settled => return Ok(settled),
            }
        }
        Err(OrchestratorError::CycleLimitExceeded {
            session_id: session_id.to_string(),
            max_cycles,
        })
    }

    /// Re-enters the paused state with the supplied answers attached to every
    /// later context bundle.
    pub fn release_halt(
        &self,
        session_id: &str,
        clarifications: Vec<String>,
        now: i64,
    ) -> Result<NextDirective, OrchestratorError> {
        let mut session = self.load_active(session_id)?;
        if session.status != SessionStatus::Halted {
            return Err(OrchestratorError::IllegalTransition {
                from: session.fsm.state.clone(),
                to: "resume".to_string(),
            });
        }
        let protocol = self.protocol(&session.protocol_id)?;
        let def = FsmDefinition::from_protocol(&protocol);

        session.fsm.resume_from_halt(&def, now)?;
        session.clarifications.extend(
            clarifications
                .into_iter()
                .map(|answer| answer.trim().to_string())
                .filter(|answer| !answer.is_empty()),
        );
        session.halt = None;
        session.last_error = None;
        session.status = if session.fsm.state == INIT_STATE {
            SessionStatus::Initialized
        } else {
            SessionStatus::InProgress
        };
        session.touch(now);
        self.store.checkpoint(
            &session,
            format!("halt released at `{}`", session.fsm.state),
            false,
            "advance",
        )?;
        self.store.append_engine_log(
            session_id,
            now,
            format!(
                "decision=release_halt state={} rerun={}",
                session.fsm.state, session.fsm.awaiting_rerun
            ),
        )?;
        directive_for(&session, &protocol, &def)
    }

    pub fn halt(
        &self,
        session_id: &str,
        reason: &str,
        open_questions: Vec<String>,
        now: i64,
    ) -> Result<NextDirective, OrchestratorError> {
        let mut session = self.load_active(session_id)?;
        match session.status {
            SessionStatus::Completed => {
                return Err(OrchestratorError::SessionTerminal {
                    session_id: session_id.to_string(),
                })
            }
            SessionStatus::Halted => {
                return Err(OrchestratorError::SessionHalted {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                })
            }
            SessionStatus::Initialized | SessionStatus::InProgress => {}
        }
        let protocol = self.protocol(&session.protocol_id)?;
        let def = FsmDefinition::from_protocol(&protocol);
        self.abandon_in_flight(&mut session, now)?;

        let phase_id = (session.fsm.state != INIT_STATE).then(|| session.fsm.state.clone());
        session.fsm.halt(&def, now, false, reason)?;
        session.status = SessionStatus::Halted;
        session.halt = Some(HaltState {
            reason: HaltReason::Manual,
            phase_id,
            open_questions,
            halted_at: now,
        });
        session.touch(now);
        self.store.checkpoint(
            &session,
            format!("halted: {reason}"),
            true,
            "release halt",
        )?;
        self.store.append_engine_log(
            session_id,
            now,
            format!("decision=halt reason={}", quote_value(reason)),
        )?;
        directive_for(&session, &protocol, &def)
    }

    /// Moves the session record into the archive. Completed sessions are
    /// already there, so cleaning one up again just reports its location.
    pub fn cleanup(&self, session_id: &str) -> Result<PathBuf, OrchestratorError> {
        match self.store.archive(session_id) {
            Ok(archived) => {
                tracing::info!(session_id, path = %archived.display(), "session archived");
                Ok(archived)
            }
            Err(OrchestratorError::SessionNotFound { .. }) if self.store.is_archived(session_id) => {
                Ok(self.store.archived_path(session_id))
            }
            Err(err) => Err(err),
        }
    }

    /// Active record, or `SessionTerminal` when only the archived copy exists.
    fn load_active(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        match self.store.load(session_id) {
            Err(OrchestratorError::SessionNotFound { .. }) if self.store.is_archived(session_id) => {
                Err(OrchestratorError::SessionTerminal {
                    session_id: session_id.to_string(),
                })
            }
            loaded => loaded,
        }
    }

    fn execute(
        &self,
        session: &mut Session,
        protocol: &ProtocolDefinition,
        def: &FsmDefinition,
        phase_index: usize,
        now: i64,
    ) -> Result<StepOutcome, OrchestratorError> {
        let executor = StepExecutor {
            store: &self.store,
            exchange: &self.exchange,
            loader: &self.loader,
            gateway: &self.gateway,
            detector: self.detector.as_ref(),
            limits: &self.settings.limits,
        };
        executor.execute(session, protocol, def, phase_index, now)
    }

    /// A step persisted in flight whose result was never recorded is marked
    /// failed; its phase is re-dispatched under fresh keys.
    fn abandon_in_flight(&self, session: &mut Session, now: i64) -> Result<(), OrchestratorError> {
        let Some(in_flight) = session.in_flight.take() else {
            return Ok(());
        };
        let reason = format!(
            "step {} `{}` was interrupted before its result was recorded",
            in_flight.seq, in_flight.phase_id
        );
        if let Some(record) = session.step_outputs.get_mut(&in_flight.seq) {
            if record.status == StepStatus::Started {
                record.status = StepStatus::Failed;
                record.completed_at = Some(now);
                record.error = Some(reason.clone());
                session.step_timestamps.insert(
                    in_flight.seq,
                    StepTimestamps {
                        started_at: record.started_at,
                        completed_at: Some(now),
                    },
                );
            }
        }
        session.last_error = Some(reason.clone());
        session.touch(now);
        tracing::warn!(
            session_id = %session.session_id,
            phase_id = %in_flight.phase_id,
            seq = in_flight.seq,
            "abandoning interrupted step"
        );
        self.store.checkpoint(
            session,
            reason,
            false,
            format!("re-run phase {}", in_flight.phase_id),
        )?;
        self.store.append_engine_log(
            &session.session_id,
            now,
            format!(
                "decision=abandon phase_id={} seq={}",
                in_flight.phase_id, in_flight.seq
            ),
        )
    }

    fn complete(
        &self,
        session: &mut Session,
        def: &FsmDefinition,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        session.fsm.transition(def, COMPLETE_STATE, now)?;
        session.status = SessionStatus::Completed;
        session.completed_at = Some(now);
        session.touch(now);
        self.store
            .checkpoint(session, "session completed", false, "none")?;
        self.store
            .append_engine_log(&session.session_id, now, "decision=complete")?;
        let archived = self.store.archive(&session.session_id)?;
        tracing::info!(
            session_id = %session.session_id,
            path = %archived.display(),
            "session completed and archived"
        );
        Ok(())
    }

    /// Registry entry with engine-wide defaults filled into unset limits.
    fn protocol(&self, protocol_id: &str) -> Result<ProtocolDefinition, OrchestratorError> {
        let mut protocol = self
            .protocols
            .get(protocol_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownProtocol {
                protocol_id: protocol_id.to_string(),
            })?;
        if let Some(max_loops) = self.settings.limits.max_remediation_loops {
            let limits = protocol
                .limits
                .get_or_insert_with(ProtocolLimitsConfig::default);
            if limits.max_remediation_loops.is_none() {
                limits.max_remediation_loops = Some(max_loops);
            }
        }
        Ok(protocol)
    }
}

fn next_target(
    session: &Session,
    protocol: &ProtocolDefinition,
    def: &FsmDefinition,
) -> Result<NextTarget, OrchestratorError> {
    let state = &session.fsm.state;
    if session.fsm.awaiting_rerun {
        let index = protocol
            .phase_index(state)
            .ok_or_else(|| OrchestratorError::UnknownPhase {
                protocol_id: protocol.id.clone(),
                phase_id: state.clone(),
            })?;
        return Ok(NextTarget::Phase { index, rerun: true });
    }
    match def.resolve_branch(state, &session.flags) {
        Some(target) if target == COMPLETE_STATE => Ok(NextTarget::Complete),
        Some(target) => protocol
            .phase_index(&target)
            .map(|index| NextTarget::Phase {
                index,
                rerun: false,
            })
            .ok_or(OrchestratorError::UnknownPhase {
                protocol_id: protocol.id.clone(),
                phase_id: target,
            }),
        None => Err(OrchestratorError::IllegalTransition {
            from: state.clone(),
            to: "<next phase>".to_string(),
        }),
    }
}

fn directive_for(
    session: &Session,
    protocol: &ProtocolDefinition,
    def: &FsmDefinition,
) -> Result<NextDirective, OrchestratorError> {
    match session.status {
        SessionStatus::Completed => return Ok(NextDirective::Complete),
        SessionStatus::Halted => {
            let (reason, open_questions) = session
                .halt
                .as_ref()
                .map(|halt| (halt.reason, halt.open_questions.clone()))
                .unwrap_or((HaltReason::Manual, Vec::new()));
            return Ok(NextDirective::Halted {
                reason,
                open_questions,
            });
        }
        SessionStatus::Initialized | SessionStatus::InProgress => {}
    }

    if let Some(in_flight) = &session.in_flight {
        return Ok(NextDirective::Dispatch {
            phase_id: in_flight.phase_id.clone(),
            rerun: session.fsm.awaiting_rerun,
            in_flight: in_flight.units.clone(),
        });
    }
    Ok(match next_target(session, protocol, def)? {
        NextTarget::Complete => NextDirective::Complete,
        NextTarget::Phase { index, rerun } => NextDirective::Dispatch {
            phase_id: protocol.phases[index].id.clone(),
            rerun,
            in_flight: Vec::new(),
        },
    })
}

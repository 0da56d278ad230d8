use crate::config::ProtocolDefinition;
use crate::orchestration::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const INIT_STATE: &str = "init";
pub const COMPLETE_STATE: &str = "complete";
pub const HALTED_STATE: &str = "halted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Linear,
    Branch,
    LoopBack,
    Complete,
    Halt,
    Resume,
}

impl EdgeKind {
    fn is_forward(self) -> bool {
        matches!(self, EdgeKind::Linear | EdgeKind::Branch | EdgeKind::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub to: String,
    pub kind: EdgeKind,
}

/// Static transition table for one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsmDefinition {
    protocol_id: String,
    transitions: BTreeMap<String, Vec<Edge>>,
    skip_flags: BTreeMap<String, String>,
}

impl FsmDefinition {
    pub fn from_protocol(protocol: &ProtocolDefinition) -> Self {
        let mut transitions: BTreeMap<String, Vec<Edge>> = BTreeMap::new();
        let skip_flags = protocol
            .phases
            .iter()
            .filter_map(|phase| {
                phase
                    .skip_when
                    .as_ref()
                    .map(|flag| (phase.id.clone(), flag.clone()))
            })
            .collect::<BTreeMap<_, _>>();

        let mut add = |from: &str, to: &str, kind: EdgeKind| {
            let edges = transitions.entry(from.to_string()).or_default();
            if !edges.iter().any(|edge| edge.to == to) {
                edges.push(Edge {
                    to: to.to_string(),
                    kind,
                });
            }
        };

        let forward = |start: Option<usize>| -> Vec<String> {
            let mut candidates = Vec::new();
            let mut cursor = start;
            loop {
                let Some(index) = cursor else {
                    candidates.push(COMPLETE_STATE.to_string());
                    break;
                };
                let phase = &protocol.phases[index];
                candidates.push(phase.id.clone());
                if phase.skip_when.is_none() {
                    break;
                }
                cursor = protocol.successor_index(index);
            }
            candidates
        };

        let mut add_forward = |from: &str, candidates: Vec<String>| {
            let branching = candidates.len() > 1;
            for candidate in candidates {
                let kind = if candidate == COMPLETE_STATE {
                    EdgeKind::Complete
                } else if branching {
                    EdgeKind::Branch
                } else {
                    EdgeKind::Linear
                };
                add(from, &candidate, kind);
            }
        };

        let first = if protocol.phases.is_empty() {
            None
        } else {
            Some(0)
        };
        add_forward(INIT_STATE, forward(first));
        for (index, phase) in protocol.phases.iter().enumerate() {
            add_forward(&phase.id, forward(protocol.successor_index(index)));
        }

        let default_loops = protocol.max_remediation_loops();
        for (index, phase) in protocol.phases.iter().enumerate() {
            if let Some(rule) = phase.remediation_rule(default_loops) {
                add(&phase.id, &rule.target, EdgeKind::LoopBack);
            }
            for target in [
                &protocol.impasse.research_phase,
                &protocol.impasse.analysis_phase,
            ]
            .into_iter()
            .flatten()
            {
                if protocol
                    .phase_index(target)
                    .map(|target_index| target_index <= index)
                    .unwrap_or(false)
                {
                    add(&phase.id, target, EdgeKind::LoopBack);
                }
            }
            add(&phase.id, &phase.id, EdgeKind::LoopBack);
        }

        let pausable = std::iter::once(INIT_STATE.to_string())
            .chain(protocol.phases.iter().map(|phase| phase.id.clone()))
            .collect::<Vec<_>>();
        for state in &pausable {
            add(state, HALTED_STATE, EdgeKind::Halt);
            add(HALTED_STATE, state, EdgeKind::Resume);
        }

        Self {
            protocol_id: protocol.id.clone(),
            transitions,
            skip_flags,
        }
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn allowed(&self, from: &str) -> &[Edge] {
        self.transitions
            .get(from)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&Edge> {
        self.allowed(from).iter().find(|edge| edge.to == to)
    }

    /// First forward successor of `from` whose `skip_when` flag is not raised.
    pub fn resolve_branch(&self, from: &str, flags: &BTreeSet<String>) -> Option<String> {
        self.allowed(from)
            .iter()
            .filter(|edge| edge.kind.is_forward())
            .find(|edge| {
                self.skip_flags
                    .get(&edge.to)
                    .map(|flag| !flags.contains(flag))
                    .unwrap_or(true)
            })
            .map(|edge| edge.to.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: Option<EdgeKind>,
    pub at: i64,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fsm {
    pub state: String,
    /// Set by a loop-back or a re-running resume: the current state's phase
    /// must execute again before moving forward.
    #[serde(default)]
    pub awaiting_rerun: bool,
    #[serde(default)]
    pub paused_state: Option<String>,
    #[serde(default)]
    pub paused_rerun: bool,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            state: INIT_STATE.to_string(),
            awaiting_rerun: false,
            paused_state: None,
            paused_rerun: false,
            history: Vec::new(),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state == HALTED_STATE
    }

    pub fn is_complete(&self) -> bool {
        self.state == COMPLETE_STATE
    }

    /// Validates a forward move without committing it. Rejections are still
    /// appended to history.
    pub fn check(
        &mut self,
        def: &FsmDefinition,
        target: &str,
        now: i64,
    ) -> Result<EdgeKind, OrchestratorError> {
        self.lookup(def, target, now, EdgeKind::is_forward)
    }

    pub fn transition(
        &mut self,
        def: &FsmDefinition,
        target: &str,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        let kind = self.lookup(def, target, now, EdgeKind::is_forward)?;
        self.commit(target, kind, now, None);
        self.awaiting_rerun = false;
        Ok(())
    }

    pub fn loop_back(
        &mut self,
        def: &FsmDefinition,
        target: &str,
        now: i64,
        reason: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let kind = self.lookup(def, target, now, |kind| kind == EdgeKind::LoopBack)?;
        self.commit(target, kind, now, Some(reason.into()));
        self.awaiting_rerun = true;
        Ok(())
    }

    pub fn halt(
        &mut self,
        def: &FsmDefinition,
        now: i64,
        rerun_on_resume: bool,
        reason: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let kind = self.lookup(def, HALTED_STATE, now, |kind| kind == EdgeKind::Halt)?;
        let paused = self.state.clone();
        let rerun = self.awaiting_rerun || rerun_on_resume;
        self.commit(HALTED_STATE, kind, now, Some(reason.into()));
        self.paused_state = Some(paused);
        self.paused_rerun = rerun;
        self.awaiting_rerun = false;
        Ok(())
    }

    pub fn resume_from_halt(
        &mut self,
        def: &FsmDefinition,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        let Some(paused) = self.paused_state.clone() else {
            self.reject(HALTED_STATE, now, "no paused state recorded");
            return Err(OrchestratorError::IllegalTransition {
                from: self.state.clone(),
                to: HALTED_STATE.to_string(),
            });
        };
        let kind = self.lookup(def, &paused, now, |kind| kind == EdgeKind::Resume)?;
        self.commit(&paused, kind, now, None);
        self.awaiting_rerun = self.paused_rerun;
        self.paused_state = None;
        self.paused_rerun = false;
        Ok(())
    }

    fn lookup(
        &mut self,
        def: &FsmDefinition,
        target: &str,
        now: i64,
        permitted: impl Fn(EdgeKind) -> bool,
    ) -> Result<EdgeKind, OrchestratorError> {
        match def.edge(&self.state, target) {
            Some(edge) if permitted(edge.kind) => Ok(edge.kind),
            Some(edge) => {
                let reason = format!("edge kind {:?} not permitted here", edge.kind);
                self.reject(target, now, &reason);
                Err(OrchestratorError::IllegalTransition {
                    from: self.state.clone(),
                    to: target.to_string(),
                })
            }
            None => {
                self.reject(target, now, "target not in allowed set");
                Err(OrchestratorError::IllegalTransition {
                    from: self.state.clone(),
                    to: target.to_string(),
                })
            }
        }
    }

    fn commit(&mut self, target: &str, kind: EdgeKind, now: i64, reason: Option<String>) {
        self.history.push(TransitionRecord {
            from: self.state.clone(),
            to: target.to_string(),
            kind: Some(kind),
            at: now,
            accepted: true,
            reason,
        });
        self.state = target.to_string();
    }

    fn reject(&mut self, target: &str, now: i64, reason: &str) {
        self.history.push(TransitionRecord {
            from: self.state.clone(),
            to: target.to_string(),
            kind: None,
            at: now,
            accepted: false,
            reason: Some(reason.to_string()),
        });
    }
}

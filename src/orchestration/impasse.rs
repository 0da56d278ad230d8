use crate::config::{ImpasseConfig, ProtocolDefinition};
use crate::orchestration::report_exchange::Report;
use serde::{Deserialize, Serialize};

/// Variants are declared in priority order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpasseKind {
    Conflict,
    MissingKnowledge,
    Tie,
    NoChange,
}

impl ImpasseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::MissingKnowledge => "missing_knowledge",
            Self::Tie => "tie",
            Self::NoChange => "no_change",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "conflict" => Some(Self::Conflict),
            "missing_knowledge" => Some(Self::MissingKnowledge),
            "tie" => Some(Self::Tie),
            "no_change" => Some(Self::NoChange),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImpasseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpasseSignal {
    pub kind: ImpasseKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ImpasseObservation<'a> {
    pub phase_id: &'a str,
    pub reports: &'a [Report],
    /// Reports of the last sealed step of the same phase, if any.
    pub previous: &'a [Report],
}

pub trait ImpasseDetector: Send + Sync {
    fn detect(
        &self,
        config: &ImpasseConfig,
        observation: ImpasseObservation<'_>,
    ) -> Option<ImpasseSignal>;
}

/// Reads explicit `impasse:` directives, and flags no-change when a re-run
/// repeats the previous summary with a near-identical body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectiveImpasseDetector;

impl ImpasseDetector for DirectiveImpasseDetector {
    fn detect(
        &self,
        config: &ImpasseConfig,
        observation: ImpasseObservation<'_>,
    ) -> Option<ImpasseSignal> {
        let mut signals = Vec::new();
        for report in observation.reports {
            for value in report.directive_values("impasse") {
                if let Some(kind) = ImpasseKind::parse(value) {
                    let detail = report
                        .directive("question")
                        .map(str::to_string)
                        .unwrap_or_else(|| report.summary.trim().to_string());
                    signals.push(ImpasseSignal { kind, detail });
                }
            }
        }

        if let Some(detail) = no_change_detail(config, observation) {
            signals.push(ImpasseSignal {
                kind: ImpasseKind::NoChange,
                detail,
            });
        }

        signals.into_iter().min_by_key(|signal| signal.kind)
    }
}

fn no_change_detail(config: &ImpasseConfig, observation: ImpasseObservation<'_>) -> Option<String> {
    if observation.previous.is_empty() || observation.previous.len() != observation.reports.len() {
        return None;
    }
    let unchanged = observation
        .reports
        .iter()
        .zip(observation.previous)
        .all(|(current, previous)| {
            let delta = current
                .body
                .chars()
                .count()
                .abs_diff(previous.body.chars().count());
            current.summary.trim() == previous.summary.trim()
                && delta < config.no_change_min_delta_chars
        });
    unchanged.then(|| {
        format!(
            "phase `{}` repeated its previous output without progress",
            observation.phase_id
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpasseRoute {
    /// Stop and wait for external clarification.
    Halt { questions: Vec<String> },
    LoopBack { target: String, max_loops: u32 },
}

/// Maps an impasse to its recovery action for the phase at `phase_index`.
pub fn route(
    protocol: &ProtocolDefinition,
    phase_index: usize,
    signal: &ImpasseSignal,
) -> ImpasseRoute {
    let Some(phase) = protocol.phases.get(phase_index) else {
        return ImpasseRoute::Halt {
            questions: vec![signal.detail.clone()],
        };
    };
    let max_loops = protocol.max_remediation_loops();
    let reachable = |target: &Option<String>| -> Option<String> {
        target
            .as_ref()
            .filter(|target| {
                protocol
                    .phase_index(target)
                    .map(|index| index <= phase_index)
                    .unwrap_or(false)
            })
            .cloned()
    };

    let target = match signal.kind {
        ImpasseKind::Conflict => None,
        ImpasseKind::MissingKnowledge => reachable(&protocol.impasse.research_phase)
            .map(|target| (target, max_loops)),
        ImpasseKind::Tie => {
            reachable(&protocol.impasse.analysis_phase).map(|target| (target, max_loops))
        }
        ImpasseKind::NoChange => Some((phase.id.clone(), protocol.impasse.max_no_change_retries)),
    };

    match target {
        Some((target, max_loops)) => ImpasseRoute::LoopBack { target, max_loops },
        None => ImpasseRoute::Halt {
            questions: vec![format!("{}: {}", signal.kind, signal.detail)],
        },
    }
}

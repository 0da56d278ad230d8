use super::ConfigError;
use crate::orchestration::context_loader::{BudgetOverrides, ContextPattern};
use crate::orchestration::gateway::WorkerCapability;
use crate::orchestration::quality_gate::GateCriterion;
use crate::shared::ids::validate_identifier_value;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const DEFAULT_MAX_REMEDIATION_LOOPS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    LinearSequence,
    PhaseGraph,
}

impl ProtocolType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinearSequence => "linear_sequence",
            Self::PhaseGraph => "phase_graph",
        }
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    #[default]
    Linear,
    Optional,
    Iterative,
    Parallel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    #[default]
    ForceComplete,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSpec {
    pub pattern: ContextPattern,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub criteria: Vec<GateCriterion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationConfig {
    pub target: String,
    #[serde(default)]
    pub max_loops: Option<u32>,
    #[serde(default)]
    pub on_exhausted: ExhaustionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLimitsConfig {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub capability: WorkerCapability,
    #[serde(rename = "type", default)]
    pub phase_type: PhaseType,
    pub context: ContextSpec,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub skip_when: Option<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub gate: Option<GateConfig>,
    #[serde(default)]
    pub remediation: Option<RemediationConfig>,
    #[serde(default)]
    pub limits: Option<PhaseLimitsConfig>,
}

/// Loop-back rule a NO-GO verdict on a phase resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationRule {
    pub target: String,
    pub max_loops: u32,
    pub on_exhausted: ExhaustionPolicy,
}

impl PhaseConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn gate_criteria(&self) -> &[GateCriterion] {
        self.gate
            .as_ref()
            .map(|gate| gate.criteria.as_slice())
            .unwrap_or(&[])
    }

    /// Iterative phases without an explicit rule loop back onto themselves.
    pub fn remediation_rule(&self, default_max_loops: u32) -> Option<RemediationRule> {
        if let Some(remediation) = &self.remediation {
            return Some(RemediationRule {
                target: remediation.target.clone(),
                max_loops: remediation.max_loops.unwrap_or(default_max_loops),
                on_exhausted: remediation.on_exhausted,
            });
        }
        if self.phase_type == PhaseType::Iterative {
            return Some(RemediationRule {
                target: self.id.clone(),
                max_loops: default_max_loops,
                on_exhausted: ExhaustionPolicy::ForceComplete,
            });
        }
        None
    }
}

fn default_no_change_min_delta_chars() -> usize {
    64
}

fn default_max_no_change_retries() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpasseConfig {
    #[serde(default)]
    pub research_phase: Option<String>,
    #[serde(default)]
    pub analysis_phase: Option<String>,
    #[serde(default = "default_no_change_min_delta_chars")]
    pub no_change_min_delta_chars: usize,
    #[serde(default = "default_max_no_change_retries")]
    pub max_no_change_retries: u32,
}

impl Default for ImpasseConfig {
    fn default() -> Self {
        Self {
            research_phase: None,
            analysis_phase: None,
            no_change_min_delta_chars: default_no_change_min_delta_chars(),
            max_no_change_retries: default_max_no_change_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolLimitsConfig {
    #[serde(default)]
    pub max_remediation_loops: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub step_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDefinition {
    pub id: String,
    pub protocol_type: ProtocolType,
    #[serde(default)]
    pub description: Option<String>,
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub budgets: BudgetOverrides,
    #[serde(default)]
    pub impasse: ImpasseConfig,
    #[serde(default)]
    pub limits: Option<ProtocolLimitsConfig>,
}

impl ProtocolDefinition {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let protocol: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        protocol.validate()?;
        Ok(protocol)
    }

    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|phase| phase.id == phase_id)
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|phase| phase.id == phase_id)
    }

    /// `None` means the phase at `index` is the last one before completion.
    pub fn successor_index(&self, index: usize) -> Option<usize> {
        let phase = self.phases.get(index)?;
        match &phase.next {
            Some(next) => self.phase_index(next),
            None if index + 1 < self.phases.len() => Some(index + 1),
            None => None,
        }
    }

    pub fn max_remediation_loops(&self) -> u32 {
        self.limits
            .as_ref()
            .and_then(|limits| limits.max_remediation_loops)
            .unwrap_or(DEFAULT_MAX_REMEDIATION_LOOPS)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier_value("protocol id", &self.id)
            .map_err(|reason| ConfigError::protocol(&self.id, reason))?;
        if self.phases.is_empty() {
            return Err(ConfigError::protocol(
                &self.id,
                "`phases` must be non-empty",
            ));
        }
        self.budgets
            .validate()
            .map_err(|reason| ConfigError::protocol(&self.id, reason))?;

        let mut seen = HashSet::new();
        for phase in &self.phases {
            validate_identifier_value("phase id", &phase.id)
                .map_err(|reason| ConfigError::protocol(&self.id, reason))?;
            if matches!(phase.id.as_str(), "init" | "complete" | "halted") {
                return Err(ConfigError::protocol(
                    &self.id,
                    format!("phase id `{}` is reserved", phase.id),
                ));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(ConfigError::protocol(
                    &self.id,
                    format!("duplicate phase id `{}`", phase.id),
                ));
            }
        }

        for (index, phase) in self.phases.iter().enumerate() {
            self.validate_phase(index, phase)?;
        }

        for (field, target) in [
            ("impasse.research_phase", &self.impasse.research_phase),
            ("impasse.analysis_phase", &self.impasse.analysis_phase),
        ] {
            if let Some(target) = target {
                if self.phase_index(target).is_none() {
                    return Err(ConfigError::protocol(
                        &self.id,
                        format!("`{field}` references unknown phase `{target}`"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_phase(&self, index: usize, phase: &PhaseConfig) -> Result<(), ConfigError> {
        let fail = |reason: String| ConfigError::protocol(&self.id, reason);
        let earlier = |target: &str| -> bool {
            self.phase_index(target)
                .map(|target_index| target_index < index)
                .unwrap_or(false)
        };

        if self.protocol_type == ProtocolType::LinearSequence {
            if phase.phase_type != PhaseType::Linear {
                return Err(fail(format!(
                    "linear_sequence phase `{}` must have type `linear`",
                    phase.id
                )));
            }
            if phase.next.is_some() || phase.skip_when.is_some() || phase.remediation.is_some() {
                return Err(fail(format!(
                    "linear_sequence phase `{}` cannot declare `next`, `skip_when` or `remediation`",
                    phase.id
                )));
            }
        }

        if let Some(next) = &phase.next {
            match self.phase_index(next) {
                Some(next_index) if next_index > index => {}
                Some(_) => {
                    return Err(fail(format!(
                        "phase `{}` `next` must point forward; use `remediation` for loop-backs",
                        phase.id
                    )))
                }
                None => {
                    return Err(fail(format!(
                        "phase `{}` `next` references unknown phase `{next}`",
                        phase.id
                    )))
                }
            }
        }

        match (phase.phase_type, &phase.skip_when) {
            (PhaseType::Optional, None) => {
                return Err(fail(format!(
                    "optional phase `{}` requires `skip_when`",
                    phase.id
                )))
            }
            (PhaseType::Optional, Some(flag)) if flag.trim().is_empty() => {
                return Err(fail(format!(
                    "optional phase `{}` requires non-empty `skip_when`",
                    phase.id
                )))
            }
            (PhaseType::Optional, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                return Err(fail(format!(
                    "phase `{}` declares `skip_when` but is not `optional`",
                    phase.id
                )))
            }
        }

        if phase.phase_type == PhaseType::Parallel {
            if phase.branches.len() < 2 {
                return Err(fail(format!(
                    "parallel phase `{}` requires at least two `branches`",
                    phase.id
                )));
            }
            let mut branch_ids = HashSet::new();
            for branch in &phase.branches {
                validate_identifier_value("branch id", branch).map_err(&fail)?;
                if !branch_ids.insert(branch.as_str()) {
                    return Err(fail(format!(
                        "parallel phase `{}` repeats branch `{branch}`",
                        phase.id
                    )));
                }
            }
        } else if !phase.branches.is_empty() {
            return Err(fail(format!(
                "phase `{}` declares `branches` but is not `parallel`",
                phase.id
            )));
        }

        if phase.phase_type == PhaseType::Iterative && phase.gate_criteria().is_empty() {
            return Err(fail(format!(
                "iterative phase `{}` requires gate criteria",
                phase.id
            )));
        }

        let context = &phase.context;
        match context.pattern {
            ContextPattern::WorkflowOnly => {
                if context.from.is_some()
                    || !context.required.is_empty()
                    || !context.optional.is_empty()
                {
                    return Err(fail(format!(
                        "phase `{}` uses workflow_only and cannot name predecessors",
                        phase.id
                    )));
                }
            }
            ContextPattern::ImmediatePredecessor => {
                if index == 0 {
                    return Err(fail(format!(
                        "first phase `{}` has no predecessor; use workflow_only",
                        phase.id
                    )));
                }
                if !context.required.is_empty() || !context.optional.is_empty() {
                    return Err(fail(format!(
                        "phase `{}` uses immediate_predecessor and cannot list `required` or `optional`",
                        phase.id
                    )));
                }
                if let Some(from) = &context.from {
                    if !earlier(from) {
                        return Err(fail(format!(
                            "phase `{}` context `from` must name an earlier phase, got `{from}`",
                            phase.id
                        )));
                    }
                }
            }
            ContextPattern::MultiplePredecessors => {
                if context.from.is_some() {
                    return Err(fail(format!(
                        "phase `{}` uses multiple_predecessors and cannot set `from`",
                        phase.id
                    )));
                }
                if context.required.is_empty() {
                    return Err(fail(format!(
                        "phase `{}` uses multiple_predecessors and requires `required`",
                        phase.id
                    )));
                }
                for name in context.required.iter().chain(context.optional.iter()) {
                    if !earlier(name) {
                        return Err(fail(format!(
                            "phase `{}` context must reference earlier phases, got `{name}`",
                            phase.id
                        )));
                    }
                }
                if context
                    .optional
                    .iter()
                    .any(|name| context.required.contains(name))
                {
                    return Err(fail(format!(
                        "phase `{}` lists a phase as both required and optional",
                        phase.id
                    )));
                }
            }
        }

        if let Some(remediation) = &phase.remediation {
            match self.phase_index(&remediation.target) {
                Some(target_index) if target_index <= index => {}
                Some(_) => {
                    return Err(fail(format!(
                        "phase `{}` remediation target `{}` must not come after it",
                        phase.id, remediation.target
                    )))
                }
                None => {
                    return Err(fail(format!(
                        "phase `{}` remediation references unknown phase `{}`",
                        phase.id, remediation.target
                    )))
                }
            }
            if remediation.max_loops == Some(0) {
                return Err(fail(format!(
                    "phase `{}` remediation `max_loops` must be >= 1",
                    phase.id
                )));
            }
        }

        if let Some(limits) = &phase.limits {
            if limits.timeout_seconds == Some(0) {
                return Err(fail(format!(
                    "phase `{}` `timeout_seconds` must be >= 1",
                    phase.id
                )));
            }
        }

        let mut criterion_ids = HashSet::new();
        for criterion in phase.gate_criteria() {
            if !criterion_ids.insert(criterion.id.as_str()) {
                return Err(fail(format!(
                    "phase `{}` repeats gate criterion `{}`",
                    phase.id, criterion.id
                )));
            }
        }
        Ok(())
    }
}

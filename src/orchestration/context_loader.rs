use crate::config::ProtocolDefinition;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::report_exchange::{Report, ReportExchange, ReportKey};
use crate::orchestration::session_store::{Session, StepRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPattern {
    WorkflowOnly,
    ImmediatePredecessor,
    MultiplePredecessors,
}

impl ContextPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowOnly => "workflow_only",
            Self::ImmediatePredecessor => "immediate_predecessor",
            Self::MultiplePredecessors => "multiple_predecessors",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRange {
    pub floor: usize,
    pub ceiling: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetOverrides {
    #[serde(default)]
    pub workflow_only: Option<BudgetRange>,
    #[serde(default)]
    pub immediate_predecessor: Option<BudgetRange>,
    #[serde(default)]
    pub multiple_predecessors: Option<BudgetRange>,
}

impl BudgetOverrides {
    pub fn validate(&self) -> Result<(), String> {
        for (name, range) in [
            ("workflow_only", self.workflow_only),
            ("immediate_predecessor", self.immediate_predecessor),
            ("multiple_predecessors", self.multiple_predecessors),
        ] {
            let Some(range) = range else {
                continue;
            };
            if range.ceiling == 0 {
                return Err(format!("budget `{name}` ceiling must be > 0"));
            }
            if range.floor > range.ceiling {
                return Err(format!(
                    "budget `{name}` floor {} exceeds ceiling {}",
                    range.floor, range.ceiling
                ));
            }
        }
        Ok(())
    }
}

/// Effective per-pattern budgets after layering overrides on the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudgets {
    pub workflow_only: BudgetRange,
    pub immediate_predecessor: BudgetRange,
    pub multiple_predecessors: BudgetRange,
}

impl Default for ContextBudgets {
    fn default() -> Self {
        Self {
            workflow_only: BudgetRange {
                floor: 0,
                ceiling: 2_000,
            },
            immediate_predecessor: BudgetRange {
                floor: 500,
                ceiling: 8_000,
            },
            multiple_predecessors: BudgetRange {
                floor: 1_000,
                ceiling: 16_000,
            },
        }
    }
}

impl ContextBudgets {
    /// Later layers win: defaults, then engine settings, then the protocol.
    pub fn resolve(layers: &[&BudgetOverrides]) -> Self {
        let mut budgets = Self::default();
        for layer in layers {
            if let Some(range) = layer.workflow_only {
                budgets.workflow_only = range;
            }
            if let Some(range) = layer.immediate_predecessor {
                budgets.immediate_predecessor = range;
            }
            if let Some(range) = layer.multiple_predecessors {
                budgets.multiple_predecessors = range;
            }
        }
        budgets
    }

    pub fn range(&self, pattern: ContextPattern) -> BudgetRange {
        match pattern {
            ContextPattern::WorkflowOnly => self.workflow_only,
            ContextPattern::ImmediatePredecessor => self.immediate_predecessor,
            ContextPattern::MultiplePredecessors => self.multiple_predecessors,
        }
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionRole {
    Predecessor,
    Required,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSection {
    pub phase_id: String,
    pub seq: u32,
    pub key: ReportKey,
    pub role: SectionRole,
    pub content: String,
    pub summarized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMetadata {
    pub session_id: String,
    pub protocol_id: String,
    pub phase_id: String,
    pub pattern: ContextPattern,
    pub generated_at: i64,
    pub inputs: Map<String, Value>,
    pub flags: Vec<String>,
    pub clarifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBundle {
    pub metadata: BundleMetadata,
    pub remediation_gaps: Vec<String>,
    pub sections: Vec<BundleSection>,
    pub dropped_optional: Vec<ReportKey>,
    pub budget: BudgetRange,
    pub estimated_tokens: usize,
}

impl ContextBundle {
    pub fn empty(session_id: impl Into<String>, phase_id: impl Into<String>) -> Self {
        let mut bundle = Self {
            metadata: BundleMetadata {
                session_id: session_id.into(),
                protocol_id: String::new(),
                phase_id: phase_id.into(),
                pattern: ContextPattern::WorkflowOnly,
                generated_at: 0,
                inputs: Map::new(),
                flags: Vec::new(),
                clarifications: Vec::new(),
            },
            remediation_gaps: Vec::new(),
            sections: Vec::new(),
            dropped_optional: Vec::new(),
            budget: ContextBudgets::default().workflow_only,
            estimated_tokens: 0,
        };
        bundle.estimated_tokens = estimate_tokens(&bundle.render());
        bundle
    }

    /// Number of predecessor reports carried, summarized or not.
    pub fn merged_inputs(&self) -> usize {
        self.sections
            .iter()
            .filter(|section| section.role != SectionRole::Optional)
            .count()
    }

    pub fn render(&self) -> String {
        let meta = &self.metadata;
        let generated_at = chrono::DateTime::<chrono::Utc>::from_timestamp(meta.generated_at, 0)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| meta.generated_at.to_string());

        let mut out = String::new();
        out.push_str("# Context bundle\n\n");
        out.push_str(&format!("- session: {}\n", meta.session_id));
        out.push_str(&format!("- protocol: {}\n", meta.protocol_id));
        out.push_str(&format!("- phase: {}\n", meta.phase_id));
        out.push_str(&format!("- pattern: {}\n", meta.pattern.as_str()));
        out.push_str(&format!("- generated_at: {generated_at}\n"));

        if !meta.inputs.is_empty() {
            let inputs = serde_json::to_string_pretty(&meta.inputs)
                .unwrap_or_else(|_| "{}".to_string());
            out.push_str(&format!("\n## Inputs\n\n```json\n{inputs}\n```\n"));
        }
        push_list(&mut out, "Flags", &meta.flags);
        push_list(&mut out, "Clarifications", &meta.clarifications);
        push_list(&mut out, "Remediation gaps", &self.remediation_gaps);

        for section in &self.sections {
            let role = match section.role {
                SectionRole::Predecessor => "Predecessor",
                SectionRole::Required => "Required",
                SectionRole::Optional => "Reference",
            };
            let marker = if section.summarized { " (summarized)" } else { "" };
            out.push_str(&format!(
                "\n## {role}: {} [{}]{marker}\n\n{}\n",
                section.phase_id,
                section.key,
                section.content.trim()
            ));
        }
        out
    }

    /// Lowercase hex SHA-256 of the rendered bundle; workers echo it back in
    /// `[context_ack]`.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.render().as_bytes());
        hash.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {title}\n\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

struct Candidate {
    section: BundleSection,
    report: Report,
}

#[derive(Debug, Clone)]
pub struct ContextLoader {
    exchange: ReportExchange,
    overrides: BudgetOverrides,
}

impl ContextLoader {
    pub fn new(exchange: ReportExchange, overrides: BudgetOverrides) -> Self {
        Self {
            exchange,
            overrides,
        }
    }

    pub fn budgets_for(&self, protocol: &ProtocolDefinition) -> ContextBudgets {
        ContextBudgets::resolve(&[&self.overrides, &protocol.budgets])
    }

    pub fn load(
        &self,
        session: &Session,
        protocol: &ProtocolDefinition,
        phase_index: usize,
        now: i64,
    ) -> Result<ContextBundle, OrchestratorError> {
        let phase = protocol
            .phases
            .get(phase_index)
            .ok_or_else(|| OrchestratorError::UnknownPhase {
                protocol_id: protocol.id.clone(),
                phase_id: format!("#{phase_index}"),
            })?;
        let pattern = phase.context.pattern;
        let budget = self.budgets_for(protocol).range(pattern);

        let candidates = match pattern {
            ContextPattern::WorkflowOnly => Vec::new(),
            ContextPattern::ImmediatePredecessor => {
                let earlier = &protocol.phases[..phase_index];
                vec![self.immediate_predecessor(
                    session,
                    &phase.id,
                    phase.context.from.as_deref(),
                    earlier.iter().map(|earlier_phase| earlier_phase.id.as_str()),
                )?]
            }
            ContextPattern::MultiplePredecessors => self.multiple_predecessors(
                session,
                &phase.id,
                &phase.context.required,
                &phase.context.optional,
            )?,
        };

        let remediation_gaps = session
            .pending_remediation
            .as_ref()
            .filter(|pending| pending.target_phase == phase.id)
            .map(|pending| pending.gaps.clone())
            .unwrap_or_default();

        let mut bundle = ContextBundle {
            metadata: BundleMetadata {
                session_id: session.session_id.clone(),
                protocol_id: protocol.id.clone(),
                phase_id: phase.id.clone(),
                pattern,
                generated_at: now,
                inputs: session.inputs.clone(),
                flags: session.flags.iter().cloned().collect(),
                clarifications: session.clarifications.clone(),
            },
            remediation_gaps,
            sections: Vec::new(),
            dropped_optional: Vec::new(),
            budget,
            estimated_tokens: 0,
        };
        compress_into(&mut bundle, candidates)?;

        if bundle.estimated_tokens < budget.floor {
            tracing::debug!(
                session_id = %session.session_id,
                phase_id = %phase.id,
                estimated = bundle.estimated_tokens,
                floor = budget.floor,
                "context bundle is below its budget floor"
            );
        }
        Ok(bundle)
    }

    /// Without an explicit `from`, the predecessor is the nearest earlier
    /// phase in protocol order that has a sealed step. Skipped optional phases
    /// and later phases reached through a loop-back never qualify.
    fn immediate_predecessor<'p>(
        &self,
        session: &Session,
        phase_id: &str,
        from: Option<&str>,
        earlier: impl DoubleEndedIterator<Item = &'p str>,
    ) -> Result<Candidate, OrchestratorError> {
        let record = match from {
            Some(from) => session.latest_sealed(from),
            None => earlier
                .rev()
                .find_map(|earlier_phase| session.latest_sealed(earlier_phase)),
        };
        let Some(record) = record else {
            return Err(OrchestratorError::PatternViolation {
                phase_id: phase_id.to_string(),
                reason: match from {
                    Some(from) => format!("predecessor `{from}` has no sealed step"),
                    None => "no sealed predecessor step".to_string(),
                },
            });
        };
        if record.reports.len() != 1 {
            return Err(OrchestratorError::PatternViolation {
                phase_id: phase_id.to_string(),
                reason: format!(
                    "immediate_predecessor expects exactly one report, `{}` step {} has {}",
                    record.phase_id,
                    record.seq,
                    record.reports.len()
                ),
            });
        }
        let mut candidates = self.read_record(record, SectionRole::Predecessor)?;
        candidates
            .pop()
            .ok_or_else(|| OrchestratorError::PatternViolation {
                phase_id: phase_id.to_string(),
                reason: format!("step {} report could not be read", record.seq),
            })
    }

    fn multiple_predecessors(
        &self,
        session: &Session,
        phase_id: &str,
        required: &[String],
        optional: &[String],
    ) -> Result<Vec<Candidate>, OrchestratorError> {
        let mut candidates = Vec::new();
        for required_phase in required {
            let record = session
                .latest_sealed(required_phase)
                .filter(|record| !record.reports.is_empty())
                .ok_or_else(|| OrchestratorError::PatternViolation {
                    phase_id: phase_id.to_string(),
                    reason: format!("required predecessor `{required_phase}` has no sealed reports"),
                })?;
            candidates.extend(self.read_record(record, SectionRole::Required)?);
        }
        for optional_phase in optional {
            if let Some(record) = session.latest_sealed(optional_phase) {
                candidates.extend(self.read_record(record, SectionRole::Optional)?);
            }
        }
        Ok(candidates)
    }

    fn read_record(
        &self,
        record: &StepRecord,
        role: SectionRole,
    ) -> Result<Vec<Candidate>, OrchestratorError> {
        record
            .reports
            .iter()
            .map(|key| {
                let report = self
                    .exchange
                    .read_report(key)
                    .map_err(|err| OrchestratorError::from_report(&key.to_string(), err))?;
                Ok(Candidate {
                    section: BundleSection {
                        phase_id: record.phase_id.clone(),
                        seq: record.seq,
                        key: key.clone(),
                        role,
                        content: full_content(&report),
                        summarized: false,
                    },
                    report,
                })
            })
            .collect()
    }
}

fn full_content(report: &Report) -> String {
    format!("{}\n\n{}", report.body.trim(), report.synopsis())
}

/// Fits candidate sections under the ceiling. Optional references go first,
/// least recent first; then required bodies collapse to their synopsis in the
/// same order. Decisions survive both steps.
fn compress_into(
    bundle: &mut ContextBundle,
    mut candidates: Vec<Candidate>,
) -> Result<(), OrchestratorError> {
    candidates.sort_by_key(|candidate| candidate.section.seq);
    let ceiling = bundle.budget.ceiling;
    let refresh = |bundle: &mut ContextBundle, candidates: &[Candidate]| {
        bundle.sections = candidates
            .iter()
            .map(|candidate| candidate.section.clone())
            .collect();
        bundle.estimated_tokens = estimate_tokens(&bundle.render());
    };

    refresh(bundle, &candidates);
    while bundle.estimated_tokens > ceiling {
        let Some(position) = candidates
            .iter()
            .position(|candidate| candidate.section.role == SectionRole::Optional)
        else {
            break;
        };
        let dropped = candidates.remove(position);
        bundle.dropped_optional.push(dropped.section.key);
        refresh(bundle, &candidates);
    }

    let mut cursor = 0;
    while bundle.estimated_tokens > ceiling && cursor < candidates.len() {
        let candidate = &mut candidates[cursor];
        cursor += 1;
        if candidate.section.summarized {
            continue;
        }
        candidate.section.content = candidate.report.synopsis();
        candidate.section.summarized = true;
        refresh(bundle, &candidates);
    }

    if bundle.estimated_tokens > ceiling {
        return Err(OrchestratorError::BudgetExceeded {
            phase_id: bundle.metadata.phase_id.clone(),
            estimated: bundle.estimated_tokens,
            ceiling,
        });
    }
    Ok(())
}

use crate::orchestration::report_exchange::Report;
use serde::{Deserialize, Serialize};

fn default_blocking() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionCheck {
    MinMergedInputs { count: usize },
    MinReports { count: usize },
    RequiresDecisions,
    SummaryNonEmpty,
    DirectiveEquals { key: String, value: String },
    NoDirective { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCriterion {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    pub check: CriterionCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "GO")]
    Go,
    #[serde(rename = "CONDITIONAL")]
    Conditional,
    #[serde(rename = "NO-GO")]
    NoGo,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Go => write!(f, "GO"),
            Verdict::Conditional => write!(f, "CONDITIONAL"),
            Verdict::NoGo => write!(f, "NO-GO"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionOutcome {
    pub criterion_id: String,
    pub blocking: bool,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateResult {
    pub phase_id: String,
    pub seq: u32,
    pub verdict: Verdict,
    pub criteria_checked: Vec<CriterionOutcome>,
    pub gaps: Vec<String>,
    #[serde(default)]
    pub remediation_target: Option<String>,
    #[serde(default)]
    pub remediation_count: u32,
    /// True when an exhausted remediation rewrote NO-GO to CONDITIONAL.
    #[serde(default)]
    pub forced: bool,
    pub evaluated_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub reports: &'a [Report],
    pub merged_inputs: usize,
}

pub fn evaluate(
    phase_id: &str,
    seq: u32,
    input: GateInput<'_>,
    criteria: &[GateCriterion],
    now: i64,
) -> QualityGateResult {
    let mut criteria_checked = Vec::with_capacity(criteria.len());
    let mut blocking_gaps = Vec::new();
    let mut advisory_gaps = Vec::new();

    for criterion in criteria {
        let (passed, detail) = check_criterion(&criterion.check, input);
        if !passed {
            let gap = criterion
                .description
                .clone()
                .unwrap_or_else(|| format!("criterion `{}` failed: {detail}", criterion.id));
            if criterion.blocking {
                blocking_gaps.push(gap);
            } else {
                advisory_gaps.push(gap);
            }
        }
        criteria_checked.push(CriterionOutcome {
            criterion_id: criterion.id.clone(),
            blocking: criterion.blocking,
            passed,
            detail,
        });
    }

    // Blocking gaps lead so halts surface them first.
    let mut gaps = Vec::new();
    for gap in blocking_gaps.into_iter().chain(advisory_gaps) {
        if !gaps.contains(&gap) {
            gaps.push(gap);
        }
    }
    for report in input.reports {
        for gap in report.gaps() {
            if !gaps.contains(&gap) {
                gaps.push(gap);
            }
        }
    }

    let blocking_failed = criteria_checked
        .iter()
        .any(|outcome| outcome.blocking && !outcome.passed);
    let any_failed = criteria_checked.iter().any(|outcome| !outcome.passed);
    let verdict = if blocking_failed {
        Verdict::NoGo
    } else if any_failed {
        Verdict::Conditional
    } else {
        Verdict::Go
    };

    QualityGateResult {
        phase_id: phase_id.to_string(),
        seq,
        verdict,
        criteria_checked,
        gaps,
        remediation_target: None,
        remediation_count: 0,
        forced: false,
        evaluated_at: now,
    }
}

fn check_criterion(check: &CriterionCheck, input: GateInput<'_>) -> (bool, String) {
    match check {
        CriterionCheck::MinMergedInputs { count } => (
            input.merged_inputs >= *count,
            format!("{} merged input(s), need {count}", input.merged_inputs),
        ),
        CriterionCheck::MinReports { count } => (
            input.reports.len() >= *count,
            format!("{} report(s), need {count}", input.reports.len()),
        ),
        CriterionCheck::RequiresDecisions => {
            let missing = input
                .reports
                .iter()
                .filter(|report| report.decisions.is_empty())
                .count();
            (
                !input.reports.is_empty() && missing == 0,
                format!("{missing} report(s) without decisions"),
            )
        }
        CriterionCheck::SummaryNonEmpty => {
            let empty = input
                .reports
                .iter()
                .filter(|report| report.summary.trim().is_empty())
                .count();
            (
                !input.reports.is_empty() && empty == 0,
                format!("{empty} report(s) with empty summary"),
            )
        }
        CriterionCheck::DirectiveEquals { key, value } => {
            let found = input.reports.iter().any(|report| {
                report
                    .directive_values(key)
                    .any(|candidate| candidate.trim().eq_ignore_ascii_case(value.trim()))
            });
            (found, format!("directive `{key}: {value}` present={found}"))
        }
        CriterionCheck::NoDirective { key } => {
            let count = input
                .reports
                .iter()
                .map(|report| report.directive_values(key).count())
                .sum::<usize>();
            (count == 0, format!("{count} `{key}` directive(s)"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::report_exchange::{ContextAck, Directive};

    fn report(directives: &[(&str, &str)], decisions: &[&str]) -> Report {
        Report {
            context_ack: ContextAck {
                bundle_digest: "d".to_string(),
                notes: Vec::new(),
            },
            body: "body".to_string(),
            summary: "summary".to_string(),
            decisions: decisions.iter().map(|d| d.to_string()).collect(),
            directives: directives
                .iter()
                .map(|(k, v)| Directive::new(*k, *v))
                .collect(),
        }
    }

    fn criteria() -> Vec<GateCriterion> {
        serde_yaml::from_str(
            r#"
- id: no_gaps
  blocking: true
  check: { kind: no_directive, key: gap }
- id: has_decisions
  blocking: false
  description: reports should record decisions
  check: { kind: requires_decisions }
"#,
        )
        .expect("parse criteria")
    }

    #[test]
    fn all_passing_criteria_yield_go() {
        let reports = vec![report(&[("next", "ship")], &["use plan B"])];
        let result = evaluate(
            "validate",
            4,
            GateInput {
                reports: &reports,
                merged_inputs: 1,
            },
            &criteria(),
            10,
        );
        assert_eq!(result.verdict, Verdict::Go);
        assert!(result.gaps.is_empty());
        assert_eq!(result.criteria_checked.len(), 2);
    }

    #[test]
    fn non_blocking_failure_yields_conditional_with_recorded_gap() {
        let reports = vec![report(&[], &[])];
        let result = evaluate(
            "validate",
            4,
            GateInput {
                reports: &reports,
                merged_inputs: 1,
            },
            &criteria(),
            10,
        );
        assert_eq!(result.verdict, Verdict::Conditional);
        assert_eq!(result.gaps, vec!["reports should record decisions"]);
    }

    #[test]
    fn blocking_failure_yields_no_go_and_collects_gap_directives() {
        let reports = vec![report(&[("gap", "missing load test")], &["keep cache"])];
        let result = evaluate(
            "validate",
            4,
            GateInput {
                reports: &reports,
                merged_inputs: 1,
            },
            &criteria(),
            10,
        );
        assert_eq!(result.verdict, Verdict::NoGo);
        assert!(result.gaps.iter().any(|gap| gap == "missing load test"));
    }

    #[test]
    fn merged_input_minimum_is_checked() {
        let criteria = vec![GateCriterion {
            id: "quorum".to_string(),
            description: None,
            blocking: true,
            check: CriterionCheck::MinMergedInputs { count: 2 },
        }];
        let reports = vec![report(&[], &["d"])];
        let pass = evaluate(
            "synthesize",
            3,
            GateInput {
                reports: &reports,
                merged_inputs: 2,
            },
            &criteria,
            10,
        );
        assert_eq!(pass.verdict, Verdict::Go);
        let fail = evaluate(
            "synthesize",
            3,
            GateInput {
                reports: &reports,
                merged_inputs: 1,
            },
            &criteria,
            10,
        );
        assert_eq!(fail.verdict, Verdict::NoGo);
    }

    #[test]
    fn verdict_serializes_with_hyphenated_no_go() {
        assert_eq!(
            serde_json::to_string(&Verdict::NoGo).expect("serialize"),
            "\"NO-GO\""
        );
    }
}

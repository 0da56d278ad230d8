pub mod command_runtime;
pub mod context_loader;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fsm;
pub mod gateway;
pub mod impasse;
pub mod progress;
pub mod quality_gate;
pub mod remediation;
pub mod report_exchange;
pub mod session_store;

pub use command_runtime::CommandRuntime;
pub use context_loader::{
    estimate_tokens, BudgetOverrides, BudgetRange, BundleMetadata, BundleSection, ContextBudgets,
    ContextBundle, ContextLoader, ContextPattern, SectionRole,
};
pub use engine::{Engine, NextDirective};
pub use error::OrchestratorError;
pub use executor::{resolve_phase_limits, task_id, PhaseLimits, StepExecutor, StepOutcome};
pub use fsm::{
    Edge, EdgeKind, Fsm, FsmDefinition, TransitionRecord, COMPLETE_STATE, HALTED_STATE, INIT_STATE,
};
pub use gateway::{
    Gateway, GatewayError, InProcessRuntime, RuntimeExit, UnitOfWork, WorkerCapability,
    WorkerHandle, WorkerResult, WorkerRuntime,
};
pub use impasse::{
    DirectiveImpasseDetector, ImpasseDetector, ImpasseKind, ImpasseObservation, ImpasseRoute,
    ImpasseSignal,
};
pub use progress::ProgressSnapshot;
pub use quality_gate::{
    evaluate, CriterionCheck, CriterionOutcome, GateCriterion, GateInput, QualityGateResult,
    Verdict,
};
pub use remediation::{guarded_loop_back, RemediationController, RemediationDecision};
pub use report_exchange::{
    parse_report, ContextAck, Directive, Report, ReportError, ReportExchange, ReportKey,
    MAX_SUMMARY_CHARS,
};
pub use session_store::{
    HaltReason, HaltState, InFlightStep, PendingRemediation, Session, SessionOptions,
    SessionStatus, SessionStore, StepRecord, StepStatus, StepType,
};

pub mod error;
pub mod load;
pub mod protocol_file;
pub mod settings;

pub use error::ConfigError;
pub use load::ProtocolRegistry;
pub use protocol_file::{
    ContextSpec, ExhaustionPolicy, GateConfig, ImpasseConfig, PhaseConfig, PhaseLimitsConfig,
    PhaseType, ProtocolDefinition, ProtocolLimitsConfig, ProtocolType, RemediationConfig,
    RemediationRule, DEFAULT_MAX_REMEDIATION_LOOPS,
};
pub use settings::{EngineSettings, LimitsConfig, WorkerCommandConfig};

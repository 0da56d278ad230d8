#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("protocol `{protocol_id}` validation failed: {reason}")]
    Protocol { protocol_id: String, reason: String },
    #[error("protocol `{protocol_id}` is declared more than once")]
    DuplicateProtocol { protocol_id: String },
}

impl ConfigError {
    pub(crate) fn protocol(protocol_id: &str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol_id: protocol_id.to_string(),
            reason: reason.into(),
        }
    }
}

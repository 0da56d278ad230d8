use super::{ConfigError, ProtocolDefinition};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    protocols: BTreeMap<String, ProtocolDefinition>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Read {
            path: dir.display().to_string(),
            source,
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Read {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|value| value.to_str()),
                Some("yaml") | Some("yml")
            );
            if path.is_file() && is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut registry = Self::new();
        for path in paths {
            registry.insert(ProtocolDefinition::from_path(&path)?)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, protocol: ProtocolDefinition) -> Result<(), ConfigError> {
        protocol.validate()?;
        if self.protocols.contains_key(&protocol.id) {
            return Err(ConfigError::DuplicateProtocol {
                protocol_id: protocol.id,
            });
        }
        self.protocols.insert(protocol.id.clone(), protocol);
        Ok(())
    }

    pub fn get(&self, protocol_id: &str) -> Option<&ProtocolDefinition> {
        self.protocols.get(protocol_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }
}

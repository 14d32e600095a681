use serde::{Deserialize, Serialize};

use cardgraph_core::CoreError;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Written as the author of every history entry. Also namespaces this engine's
    /// sync state, so engines sharing a database need distinct authors.
    pub author: String,
    /// Minimum number of days between two history prunes.
    pub prune_interval_days: i64,
    pub export_checksum: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            author: "app".to_string(),
            prune_interval_days: 30,
            export_checksum: true,
        }
    }
}

impl EngineConfig {
    pub fn with_author(author: &str) -> Self {
        Self {
            author: author.to_string(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Core(CoreError::Serialization(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = EngineConfig::from_json_str(r#"{"author":"widget"}"#).unwrap();
        assert_eq!(config.author, "widget");
        assert_eq!(config.prune_interval_days, 30);
        assert!(config.export_checksum);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(EngineConfig::from_json_str("{author").is_err());
    }
}

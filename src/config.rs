//! Session configuration and validation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tool names the engine is allowed to expose to a session.
///
/// `allowed_tools` entries outside this set are rejected at configuration
/// time, never at query time.
pub const TOOL_WHITELIST: &[&str] = &[
    "Bash",
    "Edit",
    "Glob",
    "Grep",
    "LS",
    "MultiEdit",
    "NotebookEdit",
    "NotebookRead",
    "Read",
    "Task",
    "TodoRead",
    "TodoWrite",
    "WebFetch",
    "WebSearch",
    "Write",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("max_turns must be positive")]
    InvalidMaxTurns,

    #[error("timeout_seconds must be positive")]
    InvalidTimeout,
}

/// Policy governing the engine's file-editing actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    AcceptEdits,
    RejectEdits,
    ConfirmEdits,
}

impl PermissionMode {
    /// Flag value understood by the engine CLI.
    pub fn as_engine_arg(&self) -> &'static str {
        match self {
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::RejectEdits => "rejectEdits",
            PermissionMode::ConfirmEdits => "confirmEdits",
        }
    }
}

/// Per-session configuration, immutable once applied.
///
/// Replaced as a whole by `update_config`; the session re-provisions its
/// connection lazily on the next query after a swap.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    pub working_directory: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
}

impl SessionConfig {
    /// Validate invariants: allowed_tools ⊆ whitelist, positive bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in &self.allowed_tools {
            if !TOOL_WHITELIST.contains(&name.as_str()) {
                return Err(ConfigError::UnknownTool { name: name.clone() });
            }
        }
        if self.max_turns == Some(0) {
            return Err(ConfigError::InvalidMaxTurns);
        }
        if self.timeout_seconds == Some(0) {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_whitelisted_tools_accepted() {
        let config = SessionConfig {
            allowed_tools: vec!["Read".into(), "Write".into(), "Bash".into()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let config = SessionConfig {
            allowed_tools: vec!["Read".into(), "LaunchMissiles".into()],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownTool {
                name: "LaunchMissiles".into()
            })
        );
    }

    #[test]
    fn test_zero_max_turns_rejected() {
        let config = SessionConfig {
            max_turns: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxTurns));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = SessionConfig {
            timeout_seconds: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout));
    }

    #[test]
    fn test_permission_mode_serde() {
        let json = serde_json::to_string(&PermissionMode::ConfirmEdits).unwrap();
        assert_eq!(json, "\"confirm_edits\"");
        let mode: PermissionMode = serde_json::from_str("\"reject_edits\"").unwrap();
        assert_eq!(mode, PermissionMode::RejectEdits);
    }
}

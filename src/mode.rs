//! Push / pull delivery mode selection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ModeConfig;

/// How diagnostics reach consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticMode {
    /// The engine publishes update events to subscribers
    Push,
    /// Consumers request diagnostics when they need them
    Pull,
}

impl FromStr for DiagnosticMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(DiagnosticMode::Push),
            "pull" => Ok(DiagnosticMode::Pull),
            other => Err(format!("unknown diagnostic mode '{other}'")),
        }
    }
}

impl fmt::Display for DiagnosticMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticMode::Push => f.write_str("push"),
            DiagnosticMode::Pull => f.write_str("pull"),
        }
    }
}

/// Which diagnostics a mode decision applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticChannel {
    /// Diagnostics attached to a document
    Document,
    /// Project and workspace level diagnostics
    Workspace,
}

/// Decides push or pull per channel from configuration
#[derive(Debug, Clone)]
pub struct ModeSelector {
    document: DiagnosticMode,
    workspace: DiagnosticMode,
}

impl ModeSelector {
    pub fn new(config: &ModeConfig) -> Self {
        Self {
            document: config.document.unwrap_or(config.default_mode),
            workspace: config.workspace.unwrap_or(config.default_mode),
        }
    }

    pub fn mode(&self, channel: DiagnosticChannel) -> DiagnosticMode {
        match channel {
            DiagnosticChannel::Document => self.document,
            DiagnosticChannel::Workspace => self.workspace,
        }
    }

    pub fn is_pull_mode(&self, channel: DiagnosticChannel) -> bool {
        self.mode(channel) == DiagnosticMode::Pull
    }

    pub fn is_push_mode(&self, channel: DiagnosticChannel) -> bool {
        self.mode(channel) == DiagnosticMode::Push
    }
}

impl Default for ModeSelector {
    fn default() -> Self {
        Self::new(&ModeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_override_wins() {
        let selector = ModeSelector::new(&ModeConfig {
            default_mode: DiagnosticMode::Push,
            document: Some(DiagnosticMode::Pull),
            workspace: None,
        });
        assert!(selector.is_pull_mode(DiagnosticChannel::Document));
        assert!(selector.is_push_mode(DiagnosticChannel::Workspace));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("PULL".parse::<DiagnosticMode>().unwrap(), DiagnosticMode::Pull);
        assert!("sideways".parse::<DiagnosticMode>().is_err());
    }
}

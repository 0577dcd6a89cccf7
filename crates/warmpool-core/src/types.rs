//! Types of the command-execution boundary.

use serde::{Deserialize, Serialize};

/// Timeout applied when a request does not name one (ms).
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3000;

/// How a command execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The completion sentinel appeared, or the worker exited and its output
    /// was fully drained.
    Completed,
    /// The deadline passed first; the worker was killed.
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Completed)
    }
}

/// A one-shot command for a pooled interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Raw command text, passed to the interpreter verbatim.
    pub command: String,
    /// Execution limit in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Requested configuration; the closest running match is used.
    #[serde(default)]
    pub configuration: Option<String>,
    /// Base URL substituted for `%PLOT-URL-BASE%` in the path command.
    #[serde(default)]
    pub plot_url_base: Option<String>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_ms: None,
            configuration: None,
            plot_url_base: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_configuration(mut self, name: impl Into<String>) -> Self {
        self.configuration = Some(name.into());
        self
    }

    /// The effective timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_from_json() {
        let req: CommandRequest = serde_json::from_str(r#"{"command":"1+1;"}"#).unwrap();
        assert_eq!(req.command, "1+1;");
        assert_eq!(req.timeout_ms(), DEFAULT_COMMAND_TIMEOUT_MS);
        assert!(req.configuration.is_none());
    }

    #[test]
    fn builder_sets_fields() {
        let req = CommandRequest::new("2+2;")
            .with_timeout_ms(500)
            .with_configuration("5.41.0");
        assert_eq!(req.timeout_ms(), 500);
        assert_eq!(req.configuration.as_deref(), Some("5.41.0"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&ExecutionStatus::TimedOut).unwrap();
        assert_eq!(s, "\"timed_out\"");
        assert!(ExecutionStatus::Completed.is_success());
    }
}

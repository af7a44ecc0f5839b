use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Step execution failed: {0}")]
    Step(#[from] StepError),

    #[error("Transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Application error: {0}")]
    Application(String),
}

/// Configuration-related errors (settings file, not macro documents)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Config file parse error: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Pre-execution validation failure: bad step list or missing parameters.
/// Aborts only the one macro it belongs to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The standard `Step N (action): <reason>` form used by the step validator.
    pub fn at_step(index: usize, action: &str, reason: impl AsRef<str>) -> Self {
        Self {
            message: format!("Step {} ({}): {}", index, action, reason.as_ref()),
        }
    }
}

/// Execution-time step failure. Aborts only the current invocation.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("element not found: {criteria}")]
    NotFound { criteria: String },

    #[error("element '{target}' did not reach enabled={want} before the step deadline")]
    NotEnabled { target: String, want: bool },

    #[error("step timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("macro deadline elapsed")]
    MacroTimeout,

    #[error("execution cancelled")]
    Cancelled,

    #[error("target process exited during execution")]
    NotAttached,

    #[error("verification failed: {0}")]
    VerifyFailed(String),

    #[error("unknown match mode '{mode}' (valid: equals, contains, not_equals, regex, starts_with)")]
    UnknownMatchMode { mode: String },

    #[error("unknown macro '{name}'")]
    UnknownMacro { name: String },

    #[error("macro '{name}' failed: {message}")]
    NestedMacro { name: String, message: String },

    #[error("'include' steps must be expanded at load time; rebuild the macro table")]
    IncludeAtRuntime,

    #[error("missing field '{field}' for action '{action}'")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },

    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),
}

/// RPC transport faults. Never leave the server's command gate held.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed message: {detail}")]
    Malformed { detail: String },

    #[error("unknown method '{method}'")]
    UnknownMethod { method: String },

    #[error("call timed out")]
    Timeout,

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Type alias for Results
pub type Result<T> = std::result::Result<T, Error>;

/// Where and why a single macro invocation stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailure {
    /// 1-based index of the failing step
    pub index: usize,
    pub action: String,
    pub error: String,
}

/// Outcome of one macro invocation, created and discarded per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub steps_executed: usize,
    pub total_steps: usize,
    pub message: String,
    pub failure: Option<StepFailure>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(total_steps: usize, duration_ms: u64) -> Self {
        Self {
            success: true,
            steps_executed: total_steps,
            total_steps,
            message: format!("completed {} step(s)", total_steps),
            failure: None,
            duration_ms,
        }
    }

    pub fn failed_at(
        index: usize,
        action: &str,
        error: impl std::fmt::Display,
        total_steps: usize,
        duration_ms: u64,
    ) -> Self {
        let error = error.to_string();
        Self {
            success: false,
            steps_executed: index.saturating_sub(1),
            total_steps,
            message: format!("failed at step {} ({}): {}", index, action, error),
            failure: Some(StepFailure {
                index,
                action: action.to_string(),
                error,
            }),
            duration_ms,
        }
    }

    /// Failure before any step ran (missing parameters, unknown macro).
    pub fn rejected(message: impl Into<String>, total_steps: usize) -> Self {
        Self {
            success: false,
            steps_executed: 0,
            total_steps,
            message: message.into(),
            failure: None,
            duration_ms: 0,
        }
    }
}

/// A per-file problem recorded by the loader. The whole set is replaced
/// wholesale on every reload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LoadError {
    pub path: PathBuf,
    pub macro_name: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_step_format() {
        let err = ValidationError::at_step(3, "send_keys", "requires 'keys'");
        assert_eq!(err.to_string(), "Step 3 (send_keys): requires 'keys'");
    }

    #[test]
    fn test_execution_result_success() {
        let result = ExecutionResult::succeeded(4, 120);
        assert!(result.success);
        assert_eq!(result.steps_executed, 4);
        assert_eq!(result.total_steps, 4);
        assert!(result.failure.is_none());
    }

    #[test]
    fn test_execution_result_failure_counts_prior_steps() {
        let result = ExecutionResult::failed_at(3, "click", "no such element", 5, 42);
        assert!(!result.success);
        assert_eq!(result.steps_executed, 2);
        assert_eq!(result.total_steps, 5);
        let failure = result.failure.expect("failure details");
        assert_eq!(failure.index, 3);
        assert_eq!(failure.action, "click");
    }

    #[test]
    fn test_rejected_runs_no_steps() {
        let result = ExecutionResult::rejected("missing required parameter(s): user", 7);
        assert!(!result.success);
        assert_eq!(result.steps_executed, 0);
        assert_eq!(result.total_steps, 7);
    }

    #[test]
    fn test_error_conversion() {
        let step_error = StepError::UnknownMacro {
            name: "login".to_string(),
        };
        let main_error: Error = step_error.into();
        match main_error {
            Error::Step(StepError::UnknownMacro { name }) => assert_eq!(name, "login"),
            _ => panic!("Error conversion failed"),
        }
    }
}

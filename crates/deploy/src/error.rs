//! Error taxonomy for a deployment run.
//!
//! Every fatal error ends up in [`DeployError`], which the binary maps to a
//! non-zero process exit code.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Pre-flight failure. Raised before any side effect is performed.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required argument `{0}`")]
    MissingArgument(String),

    #[error("invalid value for `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("this deployment must run with root privileges")]
    InsufficientPrivilege,
}

/// An external command exited unsuccessfully (or could not run at all).
#[derive(Debug, Error)]
#[error("step `{step_name}` failed (exit code: {}):\n{log_excerpt}", display_code(.exit_code))]
pub struct StepFailure {
    pub step_name: String,
    /// `None` when the process was never spawned, timed out or was killed by a signal.
    pub exit_code: Option<i32>,
    pub log_excerpt: String,
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// A required value could not be found in a tool's output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("extraction failed: {reason}")]
pub struct ExtractionFailure {
    pub reason: String,
}

impl ExtractionFailure {
    pub fn not_found() -> Self {
        Self {
            reason: "pattern not found".to_string(),
        }
    }
}

/// A configuration file could not be patched. The file is left untouched.
#[derive(Debug, Error)]
#[error("failed to patch {}: {reason}", .file.display())]
pub struct PatchFailure {
    pub file: PathBuf,
    pub reason: String,
}

/// One or more services could not be installed or started.
#[derive(Debug, Error)]
#[error("{} service(s) failed to start: {}", .failures.len(), summarize(.failures))]
pub struct ProvisionFailure {
    /// `(service name, reason)` for every failed service, in provisioning order.
    pub failures: Vec<(String, String)>,
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{name} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A dependent service did not become ready within the allotted time.
#[derive(Debug, Error)]
#[error("timed out after {waited:?} waiting for {target} to become ready")]
pub struct ReadinessTimeout {
    pub target: String,
    pub waited: Duration,
}

/// Misuse of the pipeline context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("required variable `{0}` is not set")]
    Missing(String),

    #[error("variable `{key}` is already set to a different value")]
    AlreadySet { key: String },
}

/// Any error that aborts a deployment run.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Step(#[from] StepFailure),

    #[error("step `{step}`: {source}")]
    Extraction {
        step: String,
        #[source]
        source: ExtractionFailure,
    },

    #[error(transparent)]
    Patch(#[from] PatchFailure),

    #[error(transparent)]
    Provision(#[from] ProvisionFailure),

    #[error(transparent)]
    Readiness(#[from] ReadinessTimeout),

    #[error("{stage}: {source}")]
    Context {
        stage: String,
        #[source]
        source: ContextError,
    },

    #[error("deployment cancelled before `{0}`")]
    Cancelled(String),

    #[error("deployment cancelled while running `{0}`")]
    Interrupted(String),

    #[error("{stage}: {error:#}")]
    Task { stage: String, error: anyhow::Error },
}

impl DeployError {
    /// Process exit code reported to the operator.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

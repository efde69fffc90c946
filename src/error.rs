//! Error taxonomy shared by `workspace-control` and `workspace-pilot`.
//!
//! Every variant maps onto one of the documented process exit codes. Helpers
//! that shell out or parse hypervisor output return `anyhow::Result`; those
//! errors are lifted into [`WorkspaceError::Unexpected`] at the controller and
//! engine boundaries.

use std::fmt;

use thiserror::Error;

/// Exit status for a successful action.
pub const EXIT_OK: u8 = 0;
/// Malformed CLI/API arguments.
pub const EXIT_INVALID_INPUT: u8 = 1;
/// Bad or missing configuration, or a request that failed validation.
pub const EXIT_INVALID_CONFIG: u8 = 2;
/// A system/environment precondition failed.
pub const EXIT_INCOMPATIBLE_ENV: u8 = 3;
/// An action failed while executing.
pub const EXIT_UNEXPECTED: u8 = 4;
/// The VM was created but its record could not be persisted.
pub const EXIT_CREATED_NOT_PERSISTED: u8 = 9;
/// Remove found neither a record nor a running VM.
pub const EXIT_ALREADY_REMOVED: u8 = 18;
/// Remove found a record but the VM had already shut itself down.
pub const EXIT_SELF_SHUTDOWN: u8 = 27;
/// Invariant violation.
pub const EXIT_PROGRAMMING: u8 = 42;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("request failed validation:\n{0}")]
    Validation(ValidationReport),

    #[error("incompatible environment: {0}")]
    IncompatibleEnvironment(String),

    #[error("{0:#}")]
    Unexpected(anyhow::Error),

    #[error("storage failure: {context}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{name}' was created but its record could not be persisted: {cause}")]
    CreatedNotPersisted { name: String, cause: String },

    #[error("programming error: {0}")]
    Programming(String),
}

impl WorkspaceError {
    pub fn unexpected(msg: impl fmt::Display) -> Self {
        WorkspaceError::Unexpected(anyhow::anyhow!("{msg}"))
    }

    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        WorkspaceError::Storage {
            context: context.into(),
            source,
        }
    }

    /// Process exit status for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkspaceError::InvalidInput(_) => EXIT_INVALID_INPUT,
            WorkspaceError::InvalidConfig(_) | WorkspaceError::Validation(_) => {
                EXIT_INVALID_CONFIG
            }
            WorkspaceError::IncompatibleEnvironment(_) => EXIT_INCOMPATIBLE_ENV,
            WorkspaceError::Unexpected(_) | WorkspaceError::Storage { .. } => EXIT_UNEXPECTED,
            WorkspaceError::CreatedNotPersisted { .. } => EXIT_CREATED_NOT_PERSISTED,
            WorkspaceError::Programming(_) => EXIT_PROGRAMMING,
        }
    }
}

impl From<anyhow::Error> for WorkspaceError {
    fn from(err: anyhow::Error) -> Self {
        WorkspaceError::Unexpected(err)
    }
}

pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// Accumulated outcome of a validation pass.
///
/// Every check appends one line to either `ok` or `errors`; `tripped` is set
/// as soon as any fatal error is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub ok: Vec<String>,
    pub errors: Vec<String>,
    pub tripped: bool,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&mut self, line: impl Into<String>) {
        self.ok.push(line.into());
    }

    pub fn error(&mut self, line: impl Into<String>) {
        self.errors.push(line.into());
        self.tripped = true;
    }

    /// Whether any error line mentions `needle`.
    pub fn has_error_containing(&self, needle: &str) -> bool {
        self.errors.iter().any(|line| line.contains(needle))
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.errors.is_empty() {
            writeln!(f, "Problems:")?;
            for line in &self.errors {
                writeln!(f, "  - {line}")?;
            }
        }
        if !self.ok.is_empty() {
            writeln!(f, "OK:")?;
            for line in &self.ok {
                writeln!(f, "  - {line}")?;
            }
        }
        Ok(())
    }
}

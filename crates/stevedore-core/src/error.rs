use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the stevedore-core library.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad names, unknown wait strategy, missing
    /// dependency, cycle, unknown output reference.
    #[error("validation error: {0}")]
    Validation(String),

    /// Container create/start failure or non-zero exit.
    #[error("container error: {0}")]
    Container(String),

    /// Container did not become ready within its startup timeout.
    #[error("wait strategy timeout: {0}")]
    WaitTimeout(String),

    /// Container did not exit within its run timeout.
    #[error("run timeout: {0}")]
    RunTimeout(String),

    /// Artifact staging, collection, or store failure.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Template reference that cannot be resolved at render time.
    #[error("template error: {0}")]
    Template(String),

    /// Malformed `when` expression.
    #[error("conditional error: {0}")]
    Conditional(String),

    /// Run or step canceled externally.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Bug or impossible state.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error for node-result reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Container(_) => ErrorKind::Container,
            Error::WaitTimeout(_) => ErrorKind::WaitTimeout,
            Error::RunTimeout(_) => ErrorKind::RunTimeout,
            Error::Artifact(_) => ErrorKind::Artifact,
            Error::Template(_) => ErrorKind::Template,
            Error::Conditional(_) => ErrorKind::Conditional,
            Error::Canceled(_) => ErrorKind::Canceled,
            Error::Internal(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Serializable classification carried on failed node results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Container,
    WaitTimeout,
    RunTimeout,
    Artifact,
    Template,
    Conditional,
    Canceled,
    Internal,
}

impl ErrorKind {
    /// Whether the failure happened below the container's own exit status:
    /// timeouts, store failures, unresolved references, engine bugs.
    ///
    /// `continue_on_error` forgives these kinds; a plain non-zero exit
    /// (`Container` with a positive exit code) is governed by
    /// `continue_on_fail` instead.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ErrorKind::WaitTimeout
                | ErrorKind::RunTimeout
                | ErrorKind::Artifact
                | ErrorKind::Template
                | ErrorKind::Conditional
                | ErrorKind::Internal
        )
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

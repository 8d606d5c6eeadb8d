#![forbid(unsafe_code)]

use crate::domain::ProbeId;
use crate::exclusion::Exclusion;
use std::path::PathBuf;
use std::time::Duration;

/// Error type returned by external collaborators (probe manager, binary
/// inspector, event sources).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pid {pid} excluded: {reason}")]
    Excluded { pid: u32, reason: Exclusion },

    #[error("no matching rule")]
    NoMatchingRule,

    #[error("could not resolve executable of pid {pid} within {timeout:?}: {source}")]
    PathResolutionTimeout {
        pid: u32,
        timeout: Duration,
        #[source]
        source: std::io::Error,
    },

    #[error("incompatible binary {0}")]
    BinaryNotAttachable(PathBuf),

    #[error("symbol {symbol} not found in {path}")]
    SymbolNotFound { symbol: String, path: PathBuf },

    #[error("failed to inspect {path}: {source}")]
    Inspection {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("failed to install probe {probe}: {source}")]
    ProbeInstall {
        probe: ProbeId,
        #[source]
        source: BoxError,
    },

    #[error("failed to detach probe {probe}: {source}")]
    ProbeDetach {
        probe: ProbeId,
        #[source]
        source: BoxError,
    },

    #[error("probe validation failed for {path}: {reason}")]
    ProbeValidation { path: PathBuf, reason: String },

    #[error("invalid probe name {name}: {reason}")]
    InvalidProbeName { name: String, reason: &'static str },

    #[error("activation of {path} failed: {source}")]
    Activation {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("deactivation of {path} failed: {source}")]
    Deactivation {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error(
        "attaching libraries of pid {pid}: {} failure(s), {} attached",
        .failures.len(),
        .attached.len()
    )]
    LibraryAttach {
        pid: u32,
        attached: Vec<PathBuf>,
        failures: Vec<Error>,
    },

    #[error("event source failure: {0}")]
    EventSource(#[source] BoxError),

    #[error("attacher is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid library pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to read procfs info: {0}")]
    Procfs(#[from] procfs::ProcError),

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Expected control-flow outcomes that are not failures: the target was
    /// excluded or no rule asked for it. Exclusions found while activating a
    /// binary count as well.
    pub fn is_benign(&self) -> bool {
        matches!(self.root(), Error::Excluded { .. } | Error::NoMatchingRule)
    }

    /// Walk through registry wrappers down to the error raised by the
    /// activation or deactivation callback.
    pub fn root(&self) -> &Error {
        match self {
            Error::Activation { source, .. } | Error::Deactivation { source, .. } => source.root(),
            other => other,
        }
    }
}

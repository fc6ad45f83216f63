//! Run-level errors and the exit-code contract for CLI callers.

use miette::Diagnostic;
use thiserror::Error;

/// Exit codes callers map process status to. The install-related codes are
/// produced by the install tooling around the core, but the contract lives
/// here so every railyard surface agrees on the numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    /// Everything succeeded or was up-to-date.
    Success = 0,
    /// At least one task failed.
    TaskFailed = -1,
    /// The selection criteria matched no package.
    NoMatchedPackages = -4,
    InstallFailed = -5,
    UninstallFailed = -8,
    DependencyNotInstalled = -10,
    /// Task-definition resolution or graph construction failed.
    GraphConstructionFailed = -11,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    Repository(#[from] railyard_repository::package_graph::Error),
    #[error(transparent)]
    Scope(#[from] railyard_scope::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] railyard_engine::Error),
    #[error(transparent)]
    Execute(#[from] railyard_engine::ExecuteError),
    #[error("No package matched the selection criteria")]
    NoMatchedPackages,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The exit code a CLI wrapping the core should terminate with.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::NoMatchedPackages => ExitStatus::NoMatchedPackages,
            Error::Repository(_) | Error::Engine(_) | Error::Scope(_) => {
                ExitStatus::GraphConstructionFailed
            }
            Error::Execute(_) | Error::Internal(_) => ExitStatus::TaskFailed,
        }
    }
}

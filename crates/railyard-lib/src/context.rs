//! The immutable record of everything a build was invoked with.
//!
//! There is deliberately no module-level mutable options state; the context
//! is assembled once by the caller and threaded through the run.

use camino::Utf8PathBuf;
use railyard_config::{BuildConfig, SelectionCriteria};

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub repo_root: Utf8PathBuf,
    /// The fully resolved repo configuration (see railyard-config).
    pub config: BuildConfig,
    /// The resolved form of the user's package-selection flags.
    pub selection: SelectionCriteria,
    /// Target task names from the command line.
    pub targets: Vec<String>,
    pub options: BuildOptions,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Number of concurrent worker slots.
    pub concurrency: usize,
    /// Classify and report without running anything.
    pub dry_run: bool,
    /// How many trailing output lines a failed task contributes to the
    /// failure summary.
    pub output_tail_lines: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|parallelism| parallelism.get())
                .unwrap_or(4),
            dry_run: false,
            output_tail_lines: 20,
        }
    }
}

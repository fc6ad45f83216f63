//! Everything the incremental check needs: the memoized file-hash store, the
//! per-task donefile, input/output glob resolution, and the classification of
//! a leaf task as up-to-date, needing a run, or non-incremental.

mod donefile;
mod file_hashes;
mod incremental;
mod inputs;

pub use crate::{
    donefile::{donefile_path, task_identifier, Donefile, FileHashEntry, DONEFILE_DIR, DONEFILE_SCHEMA},
    file_hashes::FileHashes,
    incremental::{
        write_donefile, CacheStatus, IncrementalCheck, IncrementalChecker, TaskFingerprint,
    },
    inputs::{expand_input_files, expand_output_files, resolve_task_inputs, TaskInputSpec},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed donefile {path}: {source}")]
    MalformedDonefile {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid glob '{glob}': {reason}")]
    InvalidGlob { glob: String, reason: String },
}

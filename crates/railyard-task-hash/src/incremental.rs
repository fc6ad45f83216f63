//! Classification of a leaf task against its donefile.

use camino::Utf8Path;
use railyard_task_id::TaskId;
use tracing::{debug, warn};

use crate::{
    donefile::{donefile_path, Donefile, FileHashEntry, DONEFILE_SCHEMA},
    file_hashes::{hash_str, FileHashes},
    inputs::{expand_input_files, expand_output_files, TaskInputSpec},
    Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Inputs and environment match the last successful run.
    Hit,
    /// No donefile, or something changed since it was written.
    Miss,
    /// The task declares no hashable inputs; it always runs.
    NonIncremental,
}

/// What the incremental check hashed. Written back as the donefile after a
/// successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFingerprint {
    pub env_hash: String,
    pub files: Vec<FileHashEntry>,
}

#[derive(Debug)]
pub struct IncrementalCheck {
    pub status: CacheStatus,
    /// Absent for non-incremental tasks and for tasks whose inputs could not
    /// be expanded.
    pub fingerprint: Option<TaskFingerprint>,
}

impl IncrementalCheck {
    fn non_incremental() -> Self {
        IncrementalCheck {
            status: CacheStatus::NonIncremental,
            fingerprint: None,
        }
    }
}

pub struct IncrementalChecker<'a> {
    file_hashes: &'a FileHashes,
    repo_root: &'a Utf8Path,
}

impl<'a> IncrementalChecker<'a> {
    pub fn new(file_hashes: &'a FileHashes, repo_root: &'a Utf8Path) -> Self {
        Self {
            file_hashes,
            repo_root,
        }
    }

    /// Decides whether the task can be skipped. Every failure mode inside the
    /// check (unreadable input, malformed donefile) demotes to a cache miss:
    /// the task runs and the donefile is rewritten.
    pub async fn check(
        &self,
        task_id: &TaskId<'_>,
        command: &str,
        package_dir: &Utf8Path,
        spec: Option<&TaskInputSpec>,
    ) -> IncrementalCheck {
        let Some(spec) = spec else {
            return IncrementalCheck::non_incremental();
        };

        let files = match expand_input_files(spec, package_dir, self.repo_root) {
            Ok(files) => files,
            Err(err) => {
                warn!("{task_id}: unable to expand inputs: {err}");
                return IncrementalCheck {
                    status: CacheStatus::Miss,
                    fingerprint: None,
                };
            }
        };
        if files.is_empty() {
            return IncrementalCheck::non_incremental();
        }

        let mut unreadable_input = false;
        let mut hashed = Vec::with_capacity(files.len());
        for file in files {
            match self.file_hashes.hash(&self.repo_root.join(&file)).await {
                Some(hash) => hashed.push(FileHashEntry {
                    path: file.to_string(),
                    hash,
                }),
                None => {
                    warn!("{task_id}: input {file} is unreadable");
                    unreadable_input = true;
                }
            }
        }

        let fingerprint = TaskFingerprint {
            env_hash: environment_hash(task_id, command, spec.extra_state.as_deref()),
            files: hashed,
        };
        let status = if unreadable_input {
            CacheStatus::Miss
        } else {
            match self.compare(task_id, command, package_dir, &fingerprint) {
                // A matching donefile does not help when the declared outputs
                // were cleaned away; the task runs to recreate them.
                CacheStatus::Hit if !self.outputs_present(task_id, package_dir, spec) => {
                    CacheStatus::Miss
                }
                status => status,
            }
        };

        IncrementalCheck {
            status,
            fingerprint: Some(fingerprint),
        }
    }

    /// True when the task declares no outputs, or at least one file matches
    /// its output globs (after the gitignore setting's `output` filtering).
    fn outputs_present(
        &self,
        task_id: &TaskId<'_>,
        package_dir: &Utf8Path,
        spec: &TaskInputSpec,
    ) -> bool {
        if spec.output_globs.is_empty() {
            return true;
        }
        match expand_output_files(spec, package_dir, self.repo_root) {
            Ok(outputs) => {
                if outputs.is_empty() {
                    debug!("{task_id}: declared outputs are missing");
                }
                !outputs.is_empty()
            }
            Err(err) => {
                warn!("{task_id}: unable to expand outputs: {err}");
                false
            }
        }
    }

    fn compare(
        &self,
        task_id: &TaskId<'_>,
        command: &str,
        package_dir: &Utf8Path,
        fingerprint: &TaskFingerprint,
    ) -> CacheStatus {
        let path = donefile_path(package_dir, task_id.task());
        let donefile = match Donefile::read(&path) {
            Ok(donefile) => donefile,
            Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!("{task_id}: no donefile at {path}");
                return CacheStatus::Miss;
            }
            Err(err) => {
                warn!("{task_id}: {err}");
                return CacheStatus::Miss;
            }
        };

        if donefile.schema != DONEFILE_SCHEMA {
            debug!("{task_id}: donefile schema {} is stale", donefile.schema);
            return CacheStatus::Miss;
        }
        if donefile.command != command || donefile.env_hash != fingerprint.env_hash {
            debug!("{task_id}: environment changed");
            return CacheStatus::Miss;
        }
        if donefile.files != fingerprint.files {
            debug!("{task_id}: input files changed");
            return CacheStatus::Miss;
        }
        CacheStatus::Hit
    }
}

/// Writes the donefile for a task that just succeeded.
pub fn write_donefile(
    package_dir: &Utf8Path,
    task_name: &str,
    command: &str,
    fingerprint: &TaskFingerprint,
) -> Result<(), Error> {
    let donefile = Donefile {
        schema: DONEFILE_SCHEMA,
        command: command.to_string(),
        env_hash: fingerprint.env_hash.clone(),
        files: fingerprint.files.clone(),
    };
    donefile.write(&donefile_path(package_dir, task_name))
}

/// The environment fingerprint: a stable, sorted concatenation of the
/// command, the package name, the task name, and any task-kind-specific
/// extra state, hashed. Each field is labelled so permuted values can never
/// collide.
fn environment_hash(task_id: &TaskId<'_>, command: &str, extra_state: Option<&str>) -> String {
    let mut parts = vec![
        format!("command={command}"),
        format!("package={}", task_id.package()),
        format!("task={}", task_id.task()),
    ];
    if let Some(extra) = extra_state {
        parts.push(format!("state={extra}"));
    }
    parts.sort();
    hash_str(&parts.join("\n"))
}

//! The per-task record of the last successful run.
//!
//! A donefile lives under the owning package's build-metadata directory and
//! is written only after the task succeeds. The incremental check reads it,
//! never writes it. Unknown fields are ignored so older railyard versions can
//! read newer records.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::Error;

pub const DONEFILE_SCHEMA: u32 = 1;
pub const DONEFILE_DIR: &str = "node_modules/.railyard-task-done";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donefile {
    pub schema: u32,
    pub command: String,
    pub env_hash: String,
    /// Repo-root-relative, forward-slash paths in sorted order.
    pub files: Vec<FileHashEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashEntry {
    pub path: String,
    pub hash: String,
}

/// A filesystem-safe identifier for a task within its package's donefile
/// directory.
pub fn task_identifier(task_name: &str) -> String {
    task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn donefile_path(package_dir: &Utf8Path, task_name: &str) -> Utf8PathBuf {
    package_dir
        .join(DONEFILE_DIR)
        .join(format!("{}.json", task_identifier(task_name)))
}

impl Donefile {
    pub fn read(path: &Utf8Path) -> Result<Donefile, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| Error::MalformedDonefile {
            path: path.to_string(),
            source,
        })
    }

    /// Writes atomically: serialize to a sibling temp file, then rename into
    /// place so a crash never leaves a truncated donefile behind.
    pub fn write(&self, path: &Utf8Path) -> Result<(), Error> {
        let io_err = |source| Error::Io {
            path: path.to_string(),
            source,
        };
        let parent = path.parent().expect("donefile path has a parent");
        std::fs::create_dir_all(parent).map_err(io_err)?;

        let contents =
            serde_json::to_vec_pretty(self).expect("donefile serialization cannot fail");
        // Donefile directories are partitioned per package and task, so a
        // fixed temp name cannot race another writer.
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, &contents).map_err(io_err)?;
        std::fs::rename(&temp, path).map_err(io_err)?;
        Ok(())
    }
}

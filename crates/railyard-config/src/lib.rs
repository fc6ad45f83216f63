//! Serde models for the resolved railyard configuration.
//!
//! The configuration file discovery, schema validation, and `...` placeholder
//! substitution happen in the CLI layer. The types here represent the
//! *resolved* configuration handed to the core: the repo-wide task table,
//! declaratively described external executables, the repo-packages listing,
//! and the package-selection criteria.

mod dependency;
mod selection;

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};

pub use crate::{
    dependency::DependencySpec,
    selection::{PrivateFilter, SelectionCriteria},
};

/// Name of the orchestrator executable. Scripts that invoke it directly are
/// recursion back into the orchestrator and are never run as tasks.
pub const CLI_NAME: &str = "railyard";

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Returns true if a package script shells back out to the orchestrator.
pub fn is_orchestrator_invocation(script: &str) -> bool {
    script == CLI_NAME || script.starts_with(&format!("{CLI_NAME} "))
}

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum Error {
    #[error("Unsupported configuration version {version} (expected {SUPPORTED_CONFIG_VERSION})")]
    #[diagnostic(code(railyard::config::unsupported_version))]
    UnsupportedVersion { version: u32 },
    #[error(
        "Task '{task}' still contains the '...' placeholder; it must be expanded before the \
         configuration reaches the build engine"
    )]
    #[diagnostic(code(railyard::config::unexpanded_placeholder))]
    UnexpandedPlaceholder { task: String },
    #[error("Invalid dependency entry '{entry}' in task '{task}': {reason}")]
    #[diagnostic(code(railyard::config::invalid_dependency))]
    InvalidDependency {
        task: String,
        entry: String,
        reason: String,
    },
}

/// The resolved repo-wide configuration consumed by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub version: Option<u32>,
    /// The repo-wide default task table. Per-package tables overlay this.
    #[serde(default)]
    pub tasks: TaskConfigMap,
    /// Input/output declarations for external executables, keyed by the
    /// executable name (or `executable subcommand` for multi-command tools).
    #[serde(default)]
    pub declarative_tasks: BTreeMap<String, DeclarativeTask>,
    /// Executables whose first argument selects a subcommand, so declarative
    /// lookups should use `executable subcommand` as the key.
    #[serde(default)]
    pub multi_command_executables: Vec<String>,
    /// Where the repo's packages live: release groups and directories of
    /// independent packages.
    #[serde(default)]
    pub repo_packages: BTreeMap<String, RepoPackagesEntry>,
}

impl BuildConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Checks the schema version and that no `...` placeholder survived
    /// config loading.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(version) = self.version {
            if version != SUPPORTED_CONFIG_VERSION {
                return Err(Error::UnsupportedVersion { version });
            }
        }
        for (name, entry) in &self.tasks.0 {
            entry.validate(name)?;
        }
        Ok(())
    }
}

/// A table of task configurations keyed by task name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskConfigMap(pub BTreeMap<String, TaskConfigEntry>);

impl TaskConfigMap {
    pub fn get(&self, name: &str) -> Option<&TaskConfigEntry> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskConfigEntry)> {
        self.0.iter()
    }
}

/// A task entry is either the shorthand list of dependencies or the full
/// object form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskConfigEntry {
    DependsOn(Vec<String>),
    Full(TaskConfig),
}

impl TaskConfigEntry {
    fn validate(&self, task: &str) -> Result<(), Error> {
        let entries = match self {
            TaskConfigEntry::DependsOn(deps) => chain_entries(deps, &[], &[]),
            TaskConfigEntry::Full(config) => {
                chain_entries(&config.depends_on, &config.before, &config.after)
            }
        };
        for entry in entries {
            if entry == dependency::PLACEHOLDER {
                return Err(Error::UnexpandedPlaceholder {
                    task: task.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Normalizes the entry into its resolved form: all lists present and
    /// `script` explicitly boolean.
    pub fn resolve(&self, task: &str) -> Result<TaskDefinition, Error> {
        let (script, depends_on, before, after) = match self {
            TaskConfigEntry::DependsOn(deps) => (true, deps.as_slice(), &[] as &[_], &[] as &[_]),
            TaskConfigEntry::Full(config) => (
                config.script,
                config.depends_on.as_slice(),
                config.before.as_slice(),
                config.after.as_slice(),
            ),
        };
        Ok(TaskDefinition {
            script,
            depends_on: DependencySpec::parse_all(task, depends_on)?,
            before: DependencySpec::parse_all(task, before)?,
            after: DependencySpec::parse_all(task, after)?,
        })
    }
}

fn chain_entries<'a>(
    a: &'a [String],
    b: &'a [String],
    c: &'a [String],
) -> impl Iterator<Item = &'a String> {
    a.iter().chain(b.iter()).chain(c.iter())
}

/// The full object form of a task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskConfig {
    /// `false` marks a pure aggregation target with no command of its own.
    #[serde(default = "default_true")]
    pub script: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// The resolved form of a task configuration: lists always present, `script`
/// explicitly boolean, dependency strings parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub script: bool,
    pub depends_on: Vec<DependencySpec>,
    pub before: Vec<DependencySpec>,
    pub after: Vec<DependencySpec>,
}

impl TaskDefinition {
    /// The synthesized definition for a release-group root task: "run the
    /// same task in every member package".
    pub fn fan_out(task: &str) -> Self {
        TaskDefinition {
            script: false,
            depends_on: vec![DependencySpec::Upstream(task.to_string())],
            before: Vec::new(),
            after: Vec::new(),
        }
    }
}

/// Which side of a declarative task's globs gitignored files are filtered
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GitIgnoreScope {
    Input,
    Output,
}

/// Input/output declarations for an external executable. Leaf tasks whose
/// command starts with the entry's key pick up these globs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeclarativeTask {
    pub input_globs: Vec<String>,
    #[serde(default)]
    pub output_globs: Vec<String>,
    /// Defaults to filtering inputs only, so gitignored build artifacts can
    /// still appear in output globs.
    #[serde(default = "default_gitignore")]
    pub gitignore: Vec<GitIgnoreScope>,
}

fn default_gitignore() -> Vec<GitIgnoreScope> {
    vec![GitIgnoreScope::Input]
}

impl DeclarativeTask {
    pub fn gitignore_inputs(&self) -> bool {
        self.gitignore.contains(&GitIgnoreScope::Input)
    }

    pub fn gitignore_outputs(&self) -> bool {
        self.gitignore.contains(&GitIgnoreScope::Output)
    }
}

/// An entry in the repo-packages listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepoPackagesEntry {
    /// A directory of standalone packages that version independently.
    Directory(Utf8PathBuf),
    /// A release group: a workspace of packages sharing a root and version.
    Group(ReleaseGroupConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReleaseGroupConfig {
    pub directory: Utf8PathBuf,
    #[serde(default)]
    pub ignored_dirs: Vec<Utf8PathBuf>,
    /// The version range members use to depend on each other.
    #[serde(default)]
    pub default_interdependency_range: Option<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_shorthand_entry_resolves_to_depends_on() {
        let entry: TaskConfigEntry = serde_json::from_str(r#"["^build", "gen"]"#).unwrap();
        let definition = entry.resolve("build").unwrap();
        assert!(definition.script);
        assert_eq!(
            definition.depends_on,
            vec![
                DependencySpec::Upstream("build".to_string()),
                DependencySpec::Task("gen".to_string()),
            ]
        );
        assert!(definition.before.is_empty());
        assert!(definition.after.is_empty());
    }

    #[test]
    fn test_full_entry_defaults() {
        let entry: TaskConfigEntry =
            serde_json::from_str(r#"{"script": false, "dependsOn": ["^build"]}"#).unwrap();
        let definition = entry.resolve("build").unwrap();
        assert!(!definition.script);
        assert_eq!(
            definition.depends_on,
            vec![DependencySpec::Upstream("build".to_string())]
        );
    }

    #[test]
    fn test_placeholder_is_rejected() {
        let config: BuildConfig = serde_json::from_str(
            r#"{"tasks": {"build": ["...", "^build"]}}"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::UnexpandedPlaceholder { task } if task == "build"));
    }

    #[test]
    fn test_unsupported_version() {
        let config: BuildConfig = serde_json::from_str(r#"{"version": 7}"#).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            Error::UnsupportedVersion { version: 7 }
        ));
    }

    #[test]
    fn test_declarative_task_gitignore_default() {
        let task: DeclarativeTask = serde_json::from_str(
            r#"{"inputGlobs": ["src/**/*.ts"], "outputGlobs": ["dist/**"]}"#,
        )
        .unwrap();
        assert!(task.gitignore_inputs());
        assert!(!task.gitignore_outputs());
    }

    #[test]
    fn test_repo_packages_forms() {
        let config: BuildConfig = serde_json::from_str(
            r#"{
                "repoPackages": {
                    "tools": "tools",
                    "client": {"directory": "packages", "defaultInterdependencyRange": "workspace:~"}
                }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            config.repo_packages.get("tools"),
            Some(RepoPackagesEntry::Directory(dir)) if dir == "tools"
        ));
        assert!(matches!(
            config.repo_packages.get("client"),
            Some(RepoPackagesEntry::Group(group)) if group.directory == "packages"
        ));
    }

    #[test]
    fn test_orchestrator_invocation_detection() {
        assert!(is_orchestrator_invocation("railyard"));
        assert!(is_orchestrator_invocation("railyard --task build"));
        assert!(!is_orchestrator_invocation("railyard-helper --x"));
        assert!(!is_orchestrator_invocation("tsc --project ."));
    }
}

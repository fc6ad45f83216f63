//! Per-package task-definition resolution.
//!
//! Layering, in order: the repo-wide default table, then the package's own
//! `railyard.tasks` table (whole-entry replacement, no field merging), then
//! normalization, then the release-group-root synthesis that gives a root
//! task the default meaning "run the same task in every member package".

use std::collections::HashMap;

use railyard_config::{is_orchestrator_invocation, BuildConfig, TaskDefinition};
use railyard_repository::package_graph::PackageInfo;

use crate::Error;

pub struct TaskDefinitionResolver<'a> {
    config: &'a BuildConfig,
}

impl<'a> TaskDefinitionResolver<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        Self { config }
    }

    pub fn resolve(&self, package: &PackageInfo) -> Result<ResolvedTaskDefinitions, Error> {
        let mut definitions = HashMap::new();

        for (name, entry) in self.config.tasks.iter() {
            definitions.insert(name.clone(), entry.resolve(name)?);
        }
        // Per-task entries fully replace the global entry.
        if let Some(overrides) = package.package_json.task_overrides() {
            for (name, entry) in overrides.iter() {
                definitions.insert(name.clone(), entry.resolve(name)?);
            }
        }

        Ok(ResolvedTaskDefinitions {
            definitions,
            scripts: package.package_json.scripts.clone(),
            is_release_group_root: package.is_release_group_root,
        })
    }
}

/// The effective task table for one package.
#[derive(Debug)]
pub struct ResolvedTaskDefinitions {
    definitions: HashMap<String, TaskDefinition>,
    scripts: std::collections::BTreeMap<String, String>,
    is_release_group_root: bool,
}

impl ResolvedTaskDefinitions {
    /// The definition for `name`, synthesizing the fan-out default for
    /// release-group roots whose script is absent or shells back into the
    /// orchestrator.
    pub fn get(&self, name: &str) -> Option<TaskDefinition> {
        let defined = self.definitions.get(name);

        if self.is_release_group_root {
            let script_usable = matches!(
                self.scripts.get(name),
                Some(script) if !is_orchestrator_invocation(script)
            );
            let script_expected = defined.map(|definition| definition.script).unwrap_or(true);
            if script_expected && !script_usable {
                return Some(TaskDefinition::fan_out(name));
            }
        }

        defined.cloned()
    }

    /// Whether the table (or synthesis) says anything about `name`.
    pub fn is_defined(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

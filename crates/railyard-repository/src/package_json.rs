//! The parts of `package.json` the orchestrator reads.

use std::collections::BTreeMap;

use camino::Utf8Path;
use railyard_config::TaskConfigMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub workspaces: Option<Workspaces>,
    /// The per-package task table that overlays the repo-wide defaults.
    #[serde(default)]
    pub railyard: Option<PackageBuildConfig>,
}

/// Both accepted shapes of the `workspaces` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Workspaces {
    Globs(Vec<String>),
    Object { packages: Vec<String> },
}

impl Workspaces {
    pub fn globs(&self) -> &[String] {
        match self {
            Workspaces::Globs(globs) => globs,
            Workspaces::Object { packages } => packages,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageBuildConfig {
    #[serde(default)]
    pub tasks: TaskConfigMap,
}

impl PackageJson {
    pub fn load(path: &Utf8Path) -> Result<PackageJson, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| Error::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// The combined dependency list: all dependency kinds flattened into
    /// `(name, range)` pairs. Regular dependencies win over dev dependencies
    /// when a name appears in both.
    pub fn all_dependencies(&self) -> impl Iterator<Item = (&String, &String)> {
        self.dev_dependencies
            .iter()
            .chain(self.optional_dependencies.iter())
            .chain(self.peer_dependencies.iter())
            .chain(self.dependencies.iter())
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(|script| script.as_str())
    }

    pub fn task_overrides(&self) -> Option<&TaskConfigMap> {
        self.railyard.as_ref().map(|config| &config.tasks)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_minimal() {
        let json: PackageJson = serde_json::from_str(r#"{"name": "pkg-a"}"#).unwrap();
        assert_eq!(json.name, "pkg-a");
        assert!(!json.private);
        assert!(json.scripts.is_empty());
        assert!(json.workspaces.is_none());
    }

    #[test]
    fn test_workspaces_both_shapes() {
        let list: PackageJson =
            serde_json::from_str(r#"{"name": "r", "workspaces": ["packages/*"]}"#).unwrap();
        assert_eq!(list.workspaces.unwrap().globs(), ["packages/*"]);

        let object: PackageJson = serde_json::from_str(
            r#"{"name": "r", "workspaces": {"packages": ["packages/*", "tools/*"]}}"#,
        )
        .unwrap();
        assert_eq!(
            object.workspaces.unwrap().globs(),
            ["packages/*", "tools/*"]
        );
    }

    #[test]
    fn test_all_dependencies_combines_kinds() {
        let json: PackageJson = serde_json::from_str(
            r#"{
                "name": "pkg-a",
                "dependencies": {"dep": "^1.0.0"},
                "devDependencies": {"tool": "^2.0.0"},
                "peerDependencies": {"peer": "*"}
            }"#,
        )
        .unwrap();
        let deps: Vec<_> = json
            .all_dependencies()
            .map(|(name, range)| (name.as_str(), range.as_str()))
            .collect();
        assert_eq!(deps.len(), 3);
        assert!(deps.contains(&("dep", "^1.0.0")));
        assert!(deps.contains(&("tool", "^2.0.0")));
        assert!(deps.contains(&("peer", "*")));
    }

    #[test]
    fn test_task_overrides() {
        let json: PackageJson = serde_json::from_str(
            r#"{"name": "pkg-a", "railyard": {"tasks": {"build": ["^build"]}}}"#,
        )
        .unwrap();
        assert!(json.task_overrides().unwrap().get("build").is_some());
    }
}
